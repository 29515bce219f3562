//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

//! Shortest-path-tree switch logic and bandwidth-driven keepalives.

use std::net::IpAddr;
use std::time::Duration;

use pim_utils::mfea::{
    DataflowCmp, DataflowMeasurement, DataflowMonitorMsg, DataflowUnits,
};

use crate::consts::KEEPALIVE_PERIOD;
use crate::debug::Debug;
use crate::instance::Instance;
use crate::mrt::olist::OlistCtx;
use crate::mrt::{MreFlags, MreIndex, MreType, register, task, upstream};
use crate::southbound;

// SwitchToSptDesired(S,G): policy-driven. With a zero byte threshold
// the switch happens on the first packet.
pub(crate) fn switch_to_spt_desired(
    instance: &Instance,
    _source: &IpAddr,
    _group: &IpAddr,
    measured_bytes: Option<u64>,
) -> bool {
    let cfg = &instance.config.spt_switch;
    if !cfg.enabled {
        return false;
    }
    match measured_bytes {
        Some(measured_bytes) => measured_bytes >= cfg.bytes_threshold,
        None => cfg.bytes_threshold == 0,
    }
}

// Data arrived on the (S,G) RPF interface: the SPT bit latches once we
// are joined toward the source.
pub(crate) fn data_arrived_on_rpf(instance: &mut Instance, mre_idx: MreIndex) {
    let set = {
        let Some(mre) = instance.state.mrt.get(mre_idx) else {
            return;
        };
        if mre.spt_bit() {
            return;
        }
        // The SPT bit is set when the flow arrives over the source tree:
        // either the two RPF neighbors converged or we are directly
        // connected to the source.
        mre.upstream_state == crate::mrt::UpstreamState::Joined
            && (mre.rpfp_nbr_sg == mre.rpfp_nbr_sg_rpt
                || mre.flags.contains(MreFlags::DIRECTLY_CONNECTED_S))
            || mre.flags.contains(MreFlags::DIRECTLY_CONNECTED_S)
    };
    if !set {
        return;
    }

    if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
        Debug::SptSwitch(&mre.source, &mre.group).log();
        mre.flags.insert(MreFlags::SPT);
    }
    // A new iif and possibly a prune of the shared tree.
    task::update_mfc(instance, mre_idx);
    upstream::update_upstream_sg_rpt_sibling(instance, mre_idx);
}

// Evaluates the SPT-switch policy when traffic for the group shows up
// at a router with local (*,G) state (last-hop router case).
pub(crate) fn spt_switch_check(
    instance: &mut Instance,
    source: &IpAddr,
    group: &IpAddr,
    measured_bytes: Option<u64>,
) {
    if !switch_to_spt_desired(instance, source, group, measured_bytes) {
        return;
    }
    let af = instance.af;
    let mre_idx =
        instance.state.mrt.insert(af, MreType::Sg, source, group);

    let already = instance
        .state
        .mrt
        .get(mre_idx)
        .map(|mre| {
            mre.flags.contains(MreFlags::WAS_SWITCH_TO_SPT_DESIRED)
        })
        .unwrap_or(true);
    if already {
        return;
    }
    if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
        mre.flags.insert(MreFlags::WAS_SWITCH_TO_SPT_DESIRED);
    }

    // Joining the source tree starts with a keepalive so the entry is
    // not immediately garbage-collected.
    register::start_keepalive(
        instance,
        mre_idx,
        Duration::from_secs(KEEPALIVE_PERIOD as u64),
    );
    upstream::update_rpf(instance, mre_idx);
    task::entry_state_changed(instance, mre_idx);
    monitor_flow(instance, mre_idx);
}

// Installs a dataflow monitor so the forwarder tells us when the flow
// goes idle (or crosses the SPT threshold).
pub(crate) fn monitor_flow(instance: &mut Instance, mre_idx: MreIndex) {
    let Some(mre) = instance.state.mrt.get(mre_idx) else {
        return;
    };
    let (source, group) = (mre.source, mre.group);
    let interval = instance.config.spt_switch.interval_sec.max(1);
    southbound::tx::add_dataflow_monitor(
        instance,
        DataflowMonitorMsg {
            source,
            group,
            threshold_interval: Duration::from_secs(interval as u64),
            threshold_packets: None,
            threshold_bytes: Some(0),
            cmp: DataflowCmp::Leq,
            units: DataflowUnits::BYTES,
            is_rolling: true,
        },
    );
}

// A bandwidth upcall from the forwarder.
pub(crate) fn bw_upcall(
    instance: &mut Instance,
    source: IpAddr,
    group: IpAddr,
    measurement: &DataflowMeasurement,
    cmp: DataflowCmp,
) {
    match cmp {
        // The flow went idle: let the keepalive expire.
        DataflowCmp::Leq => {
            if let Some(mre_idx) =
                instance.state.mrt.lookup_sg(&source, &group)
            {
                register::keepalive_expired(instance, mre_idx);
            }
        }
        // Traffic crossed the configured threshold: consider the SPT
        // switch and refresh the keepalive.
        DataflowCmp::Geq => {
            if let Some(mre_idx) =
                instance.state.mrt.lookup_sg(&source, &group)
            {
                register::start_keepalive(
                    instance,
                    mre_idx,
                    Duration::from_secs(KEEPALIVE_PERIOD as u64),
                );
            }
            spt_switch_check(
                instance,
                &source,
                &group,
                Some(measurement.measured_bytes),
            );
        }
    }
}

// An (S,G) flow stopped mattering: withdraw its dataflow monitors.
pub(crate) fn unmonitor_flow(instance: &mut Instance, mre_idx: MreIndex) {
    let Some(mre) = instance.state.mrt.get(mre_idx) else {
        return;
    };
    let (source, group) = (mre.source, mre.group);
    southbound::tx::delete_all_dataflow_monitor(instance, source, group);
}

// A check used by the task engine after membership or join changes at
// the last-hop router.
pub(crate) fn recheck_last_hop(instance: &mut Instance, mre_idx: MreIndex) {
    let wants = {
        let state = &instance.state;
        let Some(mre) = state.mrt.get(mre_idx) else {
            return;
        };
        if !mre.is_wc() {
            return;
        }
        let ctx = OlistCtx::new(
            &state.interfaces,
            &instance.arenas.interfaces,
            state.register_vif_index,
        );
        !state.mrt.immediate_olist(&ctx, mre).is_empty()
    };
    if !wants {
        return;
    }
    // Known sources on the shared tree become SPT candidates.
    let group = match instance.state.mrt.get(mre_idx) {
        Some(mre) => mre.group,
        None => return,
    };
    let sources = instance
        .state
        .mrt
        .indexes()
        .into_iter()
        .filter_map(|idx| instance.state.mrt.get(idx))
        .filter(|mre| mre.is_sg() && mre.group == group)
        .map(|mre| mre.source)
        .collect::<Vec<_>>();
    for source in sources {
        spt_switch_check(instance, &source, &group, None);
    }
}
