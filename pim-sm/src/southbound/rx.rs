//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

//! Upcalls from the forwarder bridge.

use pim_utils::ip::IpAddrExt;
use pim_utils::mfea::MfeaUpcallMsg;

use crate::error::Error;
use crate::instance::Instance;
use crate::mrt;

pub(crate) fn process_upcall(
    instance: &mut Instance,
    msg: MfeaUpcallMsg,
) -> Result<(), Error> {
    if !instance.state.active {
        return Ok(());
    }
    match msg {
        // First packet of a flow without forwarding state.
        MfeaUpcallMsg::NoCache {
            vif_index,
            source,
            group,
        } => {
            if !group.is_multicast() || !source.is_usable() {
                return Ok(());
            }
            mrt::register::nocache_data_arrived(
                instance, vif_index, source, group,
            );
            mrt::spt::spt_switch_check(instance, &source, &group, None);
        }
        // Data on an interface other than the expected iif: assert
        // machinery.
        MfeaUpcallMsg::WrongVif {
            vif_index,
            source,
            group,
        } => {
            if let Some(mre_idx) =
                instance.state.mrt.lookup_sg(&source, &group)
            {
                mrt::assert::wrong_iif_data_arrived_sg(
                    instance, mre_idx, vif_index,
                );
            } else if let Some(mre_idx) =
                instance.state.mrt.lookup_wc(&group)
            {
                // Shared-tree forwarding contested on this vif.
                mrt::assert::send_assert(instance, mre_idx, vif_index, true);
            }
        }
        // A packet that needs software processing: on the Register
        // pseudo-vif this is the DR-side encapsulation path.
        MfeaUpcallMsg::WholePkt {
            vif_index,
            source,
            group,
            packet,
        } => {
            if Some(vif_index) == instance.state.register_vif_index
                && let Some(mre_idx) =
                    instance.state.mrt.lookup_sg(&source, &group)
            {
                mrt::register::whole_pkt_to_register(
                    instance, mre_idx, packet,
                );
            }
        }
        // A dataflow monitor fired.
        MfeaUpcallMsg::BwUpcall {
            source,
            group,
            measurement,
            cmp,
            ..
        } => {
            mrt::spt::bw_upcall(instance, source, group, &measurement, cmp);
        }
    }
    Ok(())
}
