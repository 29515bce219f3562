//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

//! Downstream per-interface Join/Prune state machines.

use std::time::Duration;

use pim_utils::mfea::VifIndex;

use crate::instance::Instance;
use crate::mrt::{MreIndex, task};
use crate::packet::Packet;
use crate::packet::join_prune::{
    EncodedSource, JoinPruneGroup, JoinPruneMsg, SourceFlags,
};
use crate::tasks;
use crate::tasks::messages::input::MreTimerKind;

// Receive Join: any state moves to Join, expiry armed to the received
// holdtime.
pub(crate) fn receive_join(
    instance: &mut Instance,
    mre_idx: MreIndex,
    vif_index: VifIndex,
    holdtime: u16,
) {
    // A holdtime of zero directed at a joined interface is an immediate
    // prune; at a pruned or clean one it is a no-op.
    if holdtime == 0 {
        let joined = instance
            .state
            .mrt
            .get(mre_idx)
            .map(|mre| mre.downstream.join.contains(vif_index))
            .unwrap_or(false);
        if joined {
            receive_prune(instance, mre_idx, vif_index, 0);
        }
        return;
    }

    let expiry = mre_downstream_timer(
        instance,
        mre_idx,
        MreTimerKind::DownstreamExpiry(vif_index),
        Duration::from_secs(holdtime as u64),
    );
    if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
        mre.downstream.prune_pending.clear(vif_index);
        mre.downstream.prune.clear(vif_index);
        mre.downstream.prune_pending_timers.remove(&vif_index);
        mre.downstream.join.set(vif_index);
        if let Some(expiry) = expiry {
            mre.downstream.expiry_timers.insert(vif_index, expiry);
        }
    }
    task::entry_state_changed(instance, mre_idx);
}

// Receive Prune: Join moves to Prune-Pending for J/P_Override_Interval;
// NoInfo stays NoInfo.
pub(crate) fn receive_prune(
    instance: &mut Instance,
    mre_idx: MreIndex,
    vif_index: VifIndex,
    holdtime: u16,
) {
    let joined = instance
        .state
        .mrt
        .get(mre_idx)
        .map(|mre| {
            mre.downstream.join.contains(vif_index)
                || mre.downstream.prune_pending.contains(vif_index)
        })
        .unwrap_or(false);
    if !joined {
        return;
    }

    // With only one neighbor on the vif the prune-pending delay serves
    // no purpose; expire it at once.
    let (override_interval, lone_downstream) = {
        let Some((_, iface)) = instance
            .state
            .interfaces
            .get_by_vif_index(&instance.arenas.interfaces, vif_index)
        else {
            return;
        };
        (
            iface.jp_override_interval(&instance.arenas.neighbors),
            iface.neighbors.iter(&instance.arenas.neighbors).count() <= 1,
        )
    };

    let expiry_reset = holdtime != 0;
    if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
        mre.downstream.join.clear(vif_index);
        mre.downstream.prune_pending.set(vif_index);
        if expiry_reset
            && let Some(timer) =
                mre.downstream.expiry_timers.get_mut(&vif_index)
        {
            let holdtime = Duration::from_secs(holdtime as u64);
            if timer.remaining() < holdtime {
                timer.reset(Some(holdtime));
            }
        }
    }

    if lone_downstream || holdtime == 0 {
        prune_pending_expired(instance, mre_idx, vif_index);
        return;
    }

    let prune_pending = mre_downstream_timer(
        instance,
        mre_idx,
        MreTimerKind::PrunePending(vif_index),
        override_interval,
    );
    if let Some(mre) = instance.state.mrt.get_mut(mre_idx)
        && let Some(prune_pending) = prune_pending
    {
        mre.downstream
            .prune_pending_timers
            .insert(vif_index, prune_pending);
    }
    task::entry_state_changed(instance, mre_idx);
}

// Prune-Pending timer fired: the interface moves to Prune and a
// PruneEcho tells other downstream routers on the LAN.
pub(crate) fn prune_pending_expired(
    instance: &mut Instance,
    mre_idx: MreIndex,
    vif_index: VifIndex,
) {
    let was_pending = instance
        .state
        .mrt
        .get(mre_idx)
        .map(|mre| mre.downstream.prune_pending.contains(vif_index))
        .unwrap_or(false);
    if !was_pending {
        return;
    }

    if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
        mre.downstream.prune_pending.clear(vif_index);
        mre.downstream.prune_pending_timers.remove(&vif_index);
        mre.downstream.prune.set(vif_index);
    }

    send_prune_echo(instance, mre_idx, vif_index);
    task::entry_state_changed(instance, mre_idx);
}

// Downstream expiry timer fired: back to NoInfo.
pub(crate) fn expiry_expired(
    instance: &mut Instance,
    mre_idx: MreIndex,
    vif_index: VifIndex,
) {
    if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
        mre.downstream.join.clear(vif_index);
        mre.downstream.prune_pending.clear(vif_index);
        mre.downstream.prune.clear(vif_index);
        mre.downstream.expiry_timers.remove(&vif_index);
        mre.downstream.prune_pending_timers.remove(&vif_index);
    }
    task::entry_state_changed(instance, mre_idx);
}

// Sweep one vif out of the downstream state (vif stopped or deleted).
pub(crate) fn clear_vif(
    instance: &mut Instance,
    mre_idx: MreIndex,
    vif_index: VifIndex,
) {
    if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
        mre.downstream.join.clear(vif_index);
        mre.downstream.prune_pending.clear(vif_index);
        mre.downstream.prune.clear(vif_index);
        mre.downstream.expiry_timers.remove(&vif_index);
        mre.downstream.prune_pending_timers.remove(&vif_index);
        mre.local_include.clear(vif_index);
        mre.local_exclude.clear(vif_index);
        mre.processed_wc_by_sg_rpt.clear(vif_index);
        mre.assert.i_am_winner.clear(vif_index);
        mre.assert.i_am_loser.clear(vif_index);
        mre.assert.winner_metrics.remove(&vif_index);
        mre.assert.timers.remove(&vif_index);
        mre.assert.rate_limit.clear(vif_index);
        mre.assert.rate_limit_timers.remove(&vif_index);
    }
    task::entry_state_changed(instance, mre_idx);
}

// A PruneEcho is a Prune sent by the upstream router itself onto the
// LAN so that other downstream routers can override it.
fn send_prune_echo(
    instance: &mut Instance,
    mre_idx: MreIndex,
    vif_index: VifIndex,
) {
    let multiple_nbrs = instance
        .state
        .interfaces
        .get_by_vif_index(&instance.arenas.interfaces, vif_index)
        .map(|(_, iface)| {
            iface.neighbors.iter(&instance.arenas.neighbors).count() > 1
        })
        .unwrap_or(false);
    if !multiple_nbrs {
        return;
    }

    let Some(mre) = instance.state.mrt.get(mre_idx) else {
        return;
    };
    let af = instance.af;
    let (group_prefix, source_addr, flags) = match mre.mre_type {
        crate::mrt::MreType::Rp => (
            af.multicast_base(),
            mre.source,
            SourceFlags::SPARSE | SourceFlags::WC | SourceFlags::RPT,
        ),
        crate::mrt::MreType::Wc => {
            let Some(rp_addr) = mre.rp_addr else {
                return;
            };
            (
                pim_utils::ip::IpAddrExt::to_host_prefix(&mre.group),
                rp_addr,
                SourceFlags::SPARSE | SourceFlags::WC | SourceFlags::RPT,
            )
        }
        crate::mrt::MreType::Sg => (
            pim_utils::ip::IpAddrExt::to_host_prefix(&mre.group),
            mre.source,
            SourceFlags::SPARSE,
        ),
        crate::mrt::MreType::SgRpt => (
            pim_utils::ip::IpAddrExt::to_host_prefix(&mre.group),
            mre.source,
            SourceFlags::SPARSE | SourceFlags::RPT,
        ),
    };
    let Some(my_addr) = instance
        .state
        .interfaces
        .get_by_vif_index(&instance.arenas.interfaces, vif_index)
        .and_then(|(_, iface)| iface.state.primary_addr)
    else {
        return;
    };
    let holdtime = instance
        .state
        .interfaces
        .get_by_vif_index(&instance.arenas.interfaces, vif_index)
        .map(|(_, iface)| iface.config.join_prune_holdtime)
        .unwrap_or(crate::consts::JOIN_PRUNE_HOLDTIME);

    let packet = Packet::JoinPrune(JoinPruneMsg {
        upstream_nbr: my_addr,
        holdtime,
        groups: vec![JoinPruneGroup {
            group: crate::packet::EncodedGroup::new(group_prefix),
            joins: Vec::new(),
            prunes: vec![EncodedSource::new(
                source_addr,
                af.max_prefixlen(),
                flags,
            )],
        }],
    });
    crate::mrt::upstream::send_on_vif(instance, vif_index, packet);
}

// ===== helpers =====

fn mre_downstream_timer(
    instance: &mut Instance,
    mre_idx: MreIndex,
    kind: MreTimerKind,
    timeout: Duration,
) -> Option<pim_utils::task::TimeoutTask> {
    let key = instance.state.mrt.get(mre_idx)?.key();
    let (view, _) = instance.as_up()?;
    Some(tasks::mre_timer(&view, key, kind, timeout))
}
