//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

//! The deferred per-entry task engine.
//!
//! State changes with a wide blast radius (an RP change, a lost
//! neighbor, a vif going down) are not applied inline. They enqueue a
//! task carrying the list of affected entries; the engine processes one
//! entry per poll and re-kicks itself through the event loop, so a
//! large table never stalls the instance. Work is idempotent and
//! repeated processing converges.

use std::collections::VecDeque;
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use pim_utils::mfea::{
    AddMfcMsg, DeleteMfcMsg, MAX_VIFS, MfcOifFlags, MfcRequestMsg, VifIndex,
};

use crate::collections::NeighborIndex;
use crate::debug::Debug;
use crate::instance::Instance;
use crate::mrt::olist::OlistCtx;
use crate::mrt::{
    MreFlags, MreIndex, downstream, register, spt, upstream,
};

// What a deferred task does to each of its entries.
#[derive(Clone, Debug)]
pub enum TaskKind {
    // The RP mapping changed for a group range (None = everything).
    RpChanged { prefix: Option<IpNetwork> },
    // The unicast routing changed for a prefix (None = everything).
    MribChanged { prefix: Option<IpNetwork> },
    // A new neighbor appeared; entries waiting for it re-resolve.
    NeighborAdded { vif_index: VifIndex, addr: IpAddr },
    // A neighbor is going away; its dependents re-parent first.
    NeighborGone {
        nbr_idx: Option<NeighborIndex>,
        vif_index: VifIndex,
        addr: IpAddr,
    },
    // A neighbor restarted (GenID changed).
    NeighborGenIdChanged { vif_index: VifIndex, addr: IpAddr },
    // Our DR role on a vif changed.
    MyDrChanged { vif_index: VifIndex },
    // A vif came up or went away.
    VifStarted { vif_index: VifIndex },
    VifStopped { vif_index: VifIndex },
    // Sweep entries flagged for deletion.
    DeleteSweep,
}

// One queued task with its remaining fan-out.
#[derive(Debug)]
pub struct MrtTask {
    pub kind: TaskKind,
    pub pending: VecDeque<MreIndex>,
}

// ===== scheduling =====

// Enqueues a task, computing its fan-out list now, and kicks the
// engine.
pub(crate) fn schedule(instance: &mut Instance, kind: TaskKind) {
    let pending: VecDeque<MreIndex> = match &kind {
        TaskKind::RpChanged { prefix } => instance
            .state
            .mrt
            .entries_for_group_prefix(prefix.as_ref())
            .into(),
        TaskKind::MribChanged { prefix } => {
            // Any entry whose RP or source falls in the prefix.
            instance
                .state
                .mrt
                .indexes()
                .into_iter()
                .filter(|idx| {
                    let Some(mre) = instance.state.mrt.get(*idx) else {
                        return false;
                    };
                    match prefix {
                        None => true,
                        Some(prefix) => {
                            mre.rp_addr
                                .map(|rp| prefix.contains(rp))
                                .unwrap_or(true)
                                || prefix.contains(mre.source)
                        }
                    }
                })
                .collect()
        }
        TaskKind::NeighborAdded { addr, .. } => instance
            .state
            .mrt
            .entries_with_upstream_addr(addr)
            .into(),
        TaskKind::NeighborGone { nbr_idx, addr, .. } => {
            // Prefer the back-reference lists; fall back to an address
            // scan when the neighbor is already gone from the arena.
            let mut entries = nbr_idx
                .and_then(|nbr_idx| {
                    instance.arenas.neighbors.get_mut(nbr_idx)
                })
                .map(|nbr| nbr.take_mre_refs())
                .unwrap_or_default();
            if entries.is_empty() {
                entries =
                    instance.state.mrt.entries_with_upstream_addr(addr);
            }
            entries.into()
        }
        TaskKind::NeighborGenIdChanged { addr, .. } => instance
            .state
            .mrt
            .entries_with_upstream_addr(addr)
            .into(),
        TaskKind::MyDrChanged { vif_index }
        | TaskKind::VifStarted { vif_index }
        | TaskKind::VifStopped { vif_index } => {
            instance.state.mrt.entries_on_vif(*vif_index).into()
        }
        TaskKind::DeleteSweep => instance
            .state
            .mrt
            .indexes()
            .into_iter()
            .filter(|idx| {
                instance
                    .state
                    .mrt
                    .get(*idx)
                    .map(|mre| mre.flags.contains(MreFlags::DELETE_PENDING))
                    .unwrap_or(false)
            })
            .collect(),
    };

    instance.state.mrt.tasks.push_back(MrtTask { kind, pending });
    kick(instance);
}

fn kick(instance: &mut Instance) {
    if let Some((view, _)) = instance.as_up() {
        view.kick_task_engine();
    }
}

// One engine poll: process a single entry of the front task, then
// yield back to the event loop.
pub(crate) fn run(instance: &mut Instance) {
    let Some(mut front) = instance.state.mrt.tasks.pop_front() else {
        return;
    };
    let entry = front.pending.pop_front();
    let kind = front.kind.clone();
    let more = !front.pending.is_empty();
    if more {
        instance.state.mrt.tasks.push_front(front);
    }

    if let Some(mre_idx) = entry {
        process_one(instance, &kind, mre_idx);
    }

    if more || !instance.state.mrt.tasks.is_empty() {
        kick(instance);
    }

    // Tail work once a task's fan-out is complete.
    if !more
        && let TaskKind::NeighborGone {
            nbr_idx: Some(nbr_idx),
            vif_index,
            ..
        } = kind
    {
        finish_neighbor_gone(instance, nbr_idx, vif_index);
    }
}

// Drains the whole queue synchronously; used at shutdown and by tests.
pub(crate) fn run_all(instance: &mut Instance) {
    let mut iterations = 0usize;
    while !instance.state.mrt.tasks.is_empty() {
        run(instance);
        iterations += 1;
        if iterations > 1_000_000 {
            debug_assert!(false, "task queue failed to drain");
            break;
        }
    }
}

fn process_one(instance: &mut Instance, kind: &TaskKind, mre_idx: MreIndex) {
    match kind {
        TaskKind::RpChanged { .. }
        | TaskKind::MribChanged { .. }
        | TaskKind::NeighborAdded { .. }
        | TaskKind::NeighborGone { .. } => {
            entry_state_changed(instance, mre_idx);
        }
        TaskKind::NeighborGenIdChanged { .. } => {
            // A restarted upstream lost our state; refresh quickly.
            upstream::restart_jp_timer_override(instance, mre_idx);
            entry_state_changed(instance, mre_idx);
        }
        TaskKind::MyDrChanged { .. } | TaskKind::VifStarted { .. } => {
            entry_state_changed(instance, mre_idx);
            register::update_register_state(instance, mre_idx);
        }
        TaskKind::VifStopped { vif_index } => {
            downstream::clear_vif(instance, mre_idx, *vif_index);
        }
        TaskKind::DeleteSweep => {
            entry_teardown(instance, mre_idx);
        }
    }
}

// The completed re-parenting of a departed neighbor frees it.
fn finish_neighbor_gone(
    instance: &mut Instance,
    nbr_idx: NeighborIndex,
    vif_index: VifIndex,
) {
    let Some((_, iface)) = instance
        .state
        .interfaces
        .get_mut_by_vif_index(&mut instance.arenas.interfaces, vif_index)
    else {
        // The vif is gone; drop the object directly.
        instance.arenas.neighbors.remove(nbr_idx);
        return;
    };
    if instance.arenas.neighbors.get(nbr_idx).is_some() {
        iface
            .neighbors
            .delete(&mut instance.arenas.neighbors, nbr_idx);
    }
}

// ===== per-entry convergence =====

// Recomputes the derived state of one entry after any input changed:
// upstream resolution, the upstream machines, the register machine,
// the forwarding entry, and finally removability.
pub(crate) fn entry_state_changed(instance: &mut Instance, mre_idx: MreIndex) {
    if instance.state.mrt.get(mre_idx).is_none() {
        return;
    }
    upstream::update_rpf(instance, mre_idx);
    upstream::update_upstream(instance, mre_idx);

    // A winner that can no longer assert on a vif must cancel.
    let cancel_vifs = {
        let state = &instance.state;
        let Some(mre) = state.mrt.get(mre_idx) else {
            return;
        };
        let ctx = OlistCtx::new(
            &state.interfaces,
            &instance.arenas.interfaces,
            state.register_vif_index,
        );
        mre.assert
            .i_am_winner
            .iter()
            .filter(|vif_index| match mre.mre_type {
                crate::mrt::MreType::Sg => {
                    !state.mrt.could_assert_sg(&ctx, mre, *vif_index)
                }
                crate::mrt::MreType::Wc => {
                    !state.mrt.could_assert_wc(&ctx, mre, *vif_index)
                }
                _ => false,
            })
            .collect::<Vec<_>>()
    };
    for vif_index in cancel_vifs {
        crate::mrt::assert::send_assert_cancel(instance, mre_idx, vif_index);
    }

    let is_sg = instance
        .state
        .mrt
        .get(mre_idx)
        .map(|mre| mre.is_sg())
        .unwrap_or(false);
    if is_sg {
        register::update_register_state(instance, mre_idx);
        update_mfc(instance, mre_idx);
    }
    entry_try_remove(instance, mre_idx);
}

// Installs or refreshes the kernel forwarding entry of an (S,G).
pub(crate) fn update_mfc(instance: &mut Instance, mre_idx: MreIndex) {
    let Some((view, arenas)) = instance.as_up() else {
        return;
    };
    let state = &*view.state;
    let Some(mre) = state.mrt.get(mre_idx) else {
        return;
    };
    if !mre.is_sg() {
        return;
    }
    let ctx = OlistCtx::new(
        &state.interfaces,
        &arenas.interfaces,
        state.register_vif_index,
    );
    let Some(iif) = state.mrt.mfc_iif_sg(mre) else {
        return;
    };
    let olist = state.mrt.mfc_olist_sg(&ctx, mre);

    let mut oif_ttls = [0u8; MAX_VIFS];
    let oif_flags = [MfcOifFlags::default(); MAX_VIFS];
    for vif_index in olist.iter() {
        oif_ttls[vif_index as usize] = 1;
    }

    Debug::MfcInstall(&mre.source, &mre.group, iif).log();
    view.send_mfc(MfcRequestMsg::AddMfc(AddMfcMsg {
        source: mre.source,
        group: mre.group,
        iif,
        oif_ttls,
        oif_flags,
        rp_addr: mre.rp_addr,
    }));
}

// Deletes the kernel forwarding entry and its dataflow monitors.
pub(crate) fn delete_mfc(instance: &mut Instance, mre_idx: MreIndex) {
    let Some((view, _)) = instance.as_up() else {
        return;
    };
    let Some(mre) = view.state.mrt.get(mre_idx) else {
        return;
    };
    if !mre.is_sg() {
        return;
    }
    Debug::MfcDelete(&mre.source, &mre.group).log();
    view.send_mfc(MfcRequestMsg::DeleteMfc(DeleteMfcMsg {
        source: mre.source,
        group: mre.group,
    }));
    view.send_mfc(MfcRequestMsg::DeleteAllDataflowMonitor {
        source: mre.source,
        group: mre.group,
    });
}

// ===== removal =====

// Checks quiescence and, when satisfied, flags the entry and enqueues
// the delete sweep.
pub(crate) fn entry_try_remove(instance: &mut Instance, mre_idx: MreIndex) {
    let removable = {
        let state = &instance.state;
        let Some(mre) = state.mrt.get(mre_idx) else {
            return;
        };
        let mut removable = mre.is_removable();
        if removable
            && instance.config.strict_quiescence
            && mre.is_sg()
        {
            let ctx = OlistCtx::new(
                &state.interfaces,
                &instance.arenas.interfaces,
                state.register_vif_index,
            );
            removable = state.mrt.inherited_olist_sg(&ctx, mre).is_empty();
        }
        removable
    };
    if !removable {
        return;
    }

    let was_pending = {
        let Some(mre) = instance.state.mrt.get_mut(mre_idx) else {
            return;
        };
        let was_pending = mre.flags.contains(MreFlags::DELETE_PENDING);
        mre.flags.insert(MreFlags::DELETE_PENDING);
        was_pending
    };
    if !was_pending {
        schedule(instance, TaskKind::DeleteSweep);
    }
}

// Final teardown of one entry: forwarding entry, timers, links.
pub(crate) fn entry_teardown(instance: &mut Instance, mre_idx: MreIndex) {
    let still_removable = instance
        .state
        .mrt
        .get(mre_idx)
        .map(|mre| {
            !mre.flags.contains(MreFlags::DELETE_PENDING)
                || mre.is_removable()
        })
        .unwrap_or(false);
    if !still_removable {
        // Something revived the entry since it was flagged.
        if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
            mre.flags.remove(MreFlags::DELETE_PENDING);
        }
        return;
    }

    delete_mfc(instance, mre_idx);
    spt::unmonitor_flow(instance, mre_idx);

    // Unlink from every neighbor back-reference list.
    let nbr_idxs = instance
        .arenas
        .neighbors
        .iter()
        .map(|(nbr_idx, _)| nbr_idx)
        .collect::<Vec<_>>();
    for nbr_idx in nbr_idxs {
        if let Some(nbr) = instance.arenas.neighbors.get_mut(nbr_idx) {
            nbr.unlink_mre(mre_idx);
        }
    }

    if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
        mre.cancel_timers();
        mre.flags.insert(MreFlags::DELETE_DONE);
    }
    instance.state.mrt.remove(mre_idx);
}
