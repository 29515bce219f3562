//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

//! Upstream state: RPF resolution and the upstream Join/Prune machines.

use std::net::IpAddr;
use std::time::Duration;

use pim_utils::ip::IpAddrExt;
use pim_utils::mfea::VifIndex;

use crate::debug::Debug;
use crate::instance::Instance;
use crate::mrt::olist::OlistCtx;
use crate::mrt::{
    Mre, MreFlags, MreIndex, MreType, SgRptUpstreamState, UpstreamState,
};
use crate::packet::join_prune::SourceFlags;
use crate::tasks;
use crate::tasks::messages::input::MreTimerKind;

// Newly-resolved upstream pointers of one entry.
#[derive(Debug, Default, Eq, PartialEq)]
struct RpfState {
    rp_addr: Option<IpAddr>,
    mrib_rp: Option<crate::mrib::MribEntry>,
    mrib_s: Option<crate::mrib::MribEntry>,
    nbr_mrib_next_hop_rp: Option<IpAddr>,
    nbr_mrib_next_hop_s: Option<IpAddr>,
    rpfp_nbr_wc: Option<IpAddr>,
    rpfp_nbr_sg: Option<IpAddr>,
    rpfp_nbr_sg_rpt: Option<IpAddr>,
    directly_connected_s: bool,
    i_am_rp: bool,
}

// ===== RPF resolution =====

// Computes the full upstream resolution of one entry from the RP table,
// the MRIB and the assert state.
fn resolve_rpf(instance: &Instance, mre: &Mre) -> RpfState {
    let state = &instance.state;
    let mut new = RpfState::default();

    new.rp_addr = match mre.mre_type {
        MreType::Rp => Some(mre.source),
        _ => state.rp_table.rp_for_group(&mre.group).map(|rp| rp.addr),
    };
    new.mrib_rp = new
        .rp_addr
        .and_then(|rp_addr| state.mrib.lookup(&rp_addr))
        .cloned();
    if mre.is_sg() || mre.is_sg_rpt() {
        new.mrib_s = state.mrib.lookup(&mre.source).cloned();
    }

    new.i_am_rp = new
        .rp_addr
        .map(|rp_addr| {
            state
                .interfaces
                .iter(&instance.arenas.interfaces)
                .any(|iface| iface.is_my_addr(&rp_addr))
        })
        .unwrap_or(false);
    if mre.is_sg() || mre.is_sg_rpt() {
        new.directly_connected_s = state
            .interfaces
            .iter(&instance.arenas.interfaces)
            .filter(|iface| iface.state.active && !iface.is_pim_register())
            .any(|iface| iface.is_same_subnet(&mre.source));
    }

    // NBR_MRIB_next_hop(RP): the MRIB next hop, unless we are the RP.
    new.nbr_mrib_next_hop_rp = if new.i_am_rp {
        None
    } else {
        new.mrib_rp.as_ref().map(|mrib| {
            if mrib.nexthop_addr.is_unspecified() {
                // Directly-connected RP.
                new.rp_addr.unwrap_or(mrib.nexthop_addr)
            } else {
                mrib.nexthop_addr
            }
        })
    };
    // NBR_MRIB_next_hop(S).
    new.nbr_mrib_next_hop_s = if new.directly_connected_s {
        None
    } else {
        new.mrib_s.as_ref().map(|mrib| {
            if mrib.nexthop_addr.is_unspecified() {
                mre.source
            } else {
                mrib.nexthop_addr
            }
        })
    };

    // RPF'(*,G): the assert winner on the RPF interface when we lost an
    // assert there, the MRIB next hop otherwise.
    let rpf_if_rp = new.mrib_rp.as_ref().map(|mrib| mrib.vif_index);
    let wc_view = match mre.mre_type {
        MreType::Wc => Some(mre),
        _ => state.mrt.wc_of(mre),
    };
    new.rpfp_nbr_wc = assert_override(wc_view, rpf_if_rp)
        .or(new.nbr_mrib_next_hop_rp);

    // RPF'(S,G).
    let rpf_if_s = new.mrib_s.as_ref().map(|mrib| mrib.vif_index);
    let sg_view = match mre.mre_type {
        MreType::Sg => Some(mre),
        _ => state.mrt.sg_of(mre),
    };
    new.rpfp_nbr_sg =
        assert_override(sg_view, rpf_if_s).or(new.nbr_mrib_next_hop_s);

    // RPF'(S,G,rpt): RPF'(*,G) unless the (S,G) entry lost an assert on
    // the shared-tree RPF interface.
    new.rpfp_nbr_sg_rpt =
        assert_override(sg_view, rpf_if_rp).or(new.rpfp_nbr_wc);

    new
}

// The assert winner's address, when the entry is an assert loser on the
// given interface.
fn assert_override(
    mre: Option<&Mre>,
    vif_index: Option<VifIndex>,
) -> Option<IpAddr> {
    let mre = mre?;
    let vif_index = vif_index?;
    if !mre.assert.i_am_loser.contains(vif_index) {
        return None;
    }
    mre.assert
        .winner_metrics
        .get(&vif_index)
        .map(|metric| metric.addr)
}

// Recomputes the upstream pointers of one entry and applies the
// Join/Prune consequences of any change. Returns true if anything
// changed.
pub(crate) fn update_rpf(instance: &mut Instance, mre_idx: MreIndex) -> bool {
    let Some(mre) = instance.state.mrt.get(mre_idx) else {
        return false;
    };
    let new = resolve_rpf(instance, mre);
    let Some(mre) = instance.state.mrt.get(mre_idx) else {
        return false;
    };

    let old_rp_addr = mre.rp_addr;
    let old_rpfp_wc = mre.rpfp_nbr_wc;
    let old_rpfp_sg = mre.rpfp_nbr_sg;
    let old_rpfp_sg_rpt = mre.rpfp_nbr_sg_rpt;
    let old_nbr_rp = mre.nbr_mrib_next_hop_rp;
    let old_nbr_s = mre.nbr_mrib_next_hop_s;

    let changed = old_rp_addr != new.rp_addr
        || mre.mrib_rp != new.mrib_rp
        || mre.mrib_s != new.mrib_s
        || old_nbr_rp != new.nbr_mrib_next_hop_rp
        || old_nbr_s != new.nbr_mrib_next_hop_s
        || old_rpfp_wc != new.rpfp_nbr_wc
        || old_rpfp_sg != new.rpfp_nbr_sg
        || old_rpfp_sg_rpt != new.rpfp_nbr_sg_rpt
        || mre.flags.contains(MreFlags::DIRECTLY_CONNECTED_S)
            != new.directly_connected_s
        || mre.flags.contains(MreFlags::I_AM_RP) != new.i_am_rp;
    if !changed {
        return false;
    }

    if old_rp_addr != new.rp_addr {
        let group = mre.group;
        Debug::RpChange(&group, old_rp_addr, new.rp_addr).log();
    }

    // Detach the stale neighbor back-references.
    let old_rpf_vif_rp = mre.mrib_rp.as_ref().map(|mrib| mrib.vif_index);
    let old_rpf_vif_s = mre.mrib_s.as_ref().map(|mrib| mrib.vif_index);
    for (vif, addr) in [
        (old_rpf_vif_rp, old_nbr_rp),
        (old_rpf_vif_s, old_nbr_s),
        (old_rpf_vif_rp, old_rpfp_wc),
        (old_rpf_vif_s, old_rpfp_sg),
        (old_rpf_vif_rp, old_rpfp_sg_rpt),
    ] {
        unlink_backref(instance, mre_idx, vif, addr);
    }

    // Apply the new resolution.
    let mut rp_link_changed = false;
    if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
        if mre.rp_addr != new.rp_addr {
            rp_link_changed = true;
        }
        mre.rp_addr = new.rp_addr;
        mre.mrib_rp = new.mrib_rp.clone();
        mre.mrib_s = new.mrib_s.clone();
        mre.nbr_mrib_next_hop_rp = new.nbr_mrib_next_hop_rp;
        mre.nbr_mrib_next_hop_s = new.nbr_mrib_next_hop_s;
        mre.flags
            .set(MreFlags::DIRECTLY_CONNECTED_S, new.directly_connected_s);
        mre.flags.set(MreFlags::I_AM_RP, new.i_am_rp);

        // A moved RPF interface toward the source unlatches the SPT bit.
        let new_rpf_vif_s =
            new.mrib_s.as_ref().map(|mrib| mrib.vif_index);
        if old_rpf_vif_s != new_rpf_vif_s {
            mre.flags.remove(MreFlags::SPT);
        }
    }
    if rp_link_changed {
        let rp_entry_idx = new
            .rp_addr
            .and_then(|rp_addr| instance.state.mrt.lookup_rp(&rp_addr));
        if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
            mre.rp_entry_idx = rp_entry_idx;
        }
    }

    // Upstream transfer: while Joined, a changed RPF' neighbor means a
    // Join toward the new one and a Prune toward the old one.
    let (mre_type, upstream_state, rpt_state) = {
        let Some(mre) = instance.state.mrt.get(mre_idx) else {
            return true;
        };
        (mre.mre_type, mre.upstream_state, mre.rpt_state)
    };
    match mre_type {
        MreType::Rp | MreType::Wc => {
            let (old, new_addr) = match mre_type {
                MreType::Rp => (old_nbr_rp, new.nbr_mrib_next_hop_rp),
                _ => (old_rpfp_wc, new.rpfp_nbr_wc),
            };
            if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
                mre.rpfp_nbr_wc = new.rpfp_nbr_wc;
            }
            if upstream_state == UpstreamState::Joined && old != new_addr {
                rpf_transfer(instance, mre_idx, old, new_addr);
            }
        }
        MreType::Sg => {
            if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
                mre.rpfp_nbr_sg = new.rpfp_nbr_sg;
                mre.rpfp_nbr_wc = new.rpfp_nbr_wc;
                mre.rpfp_nbr_sg_rpt = new.rpfp_nbr_sg_rpt;
            }
            if upstream_state == UpstreamState::Joined
                && old_rpfp_sg != new.rpfp_nbr_sg
            {
                rpf_transfer(instance, mre_idx, old_rpfp_sg, new.rpfp_nbr_sg);
            }
        }
        MreType::SgRpt => {
            if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
                mre.rpfp_nbr_sg_rpt = new.rpfp_nbr_sg_rpt;
                mre.rpfp_nbr_wc = new.rpfp_nbr_wc;
            }
            if rpt_state == SgRptUpstreamState::Pruned
                && old_rpfp_sg_rpt != new.rpfp_nbr_sg_rpt
            {
                // The prune follows the shared tree; re-evaluate against
                // the new upstream.
                update_upstream_sg_rpt(instance, mre_idx);
            }
        }
    }

    // Attach the fresh neighbor back-references.
    let (new_rpf_vif_rp, new_rpf_vif_s) = {
        let Some(mre) = instance.state.mrt.get(mre_idx) else {
            return true;
        };
        (
            mre.mrib_rp.as_ref().map(|mrib| mrib.vif_index),
            mre.mrib_s.as_ref().map(|mrib| mrib.vif_index),
        )
    };
    for (vif, addr) in [
        (new_rpf_vif_rp, new.nbr_mrib_next_hop_rp),
        (new_rpf_vif_s, new.nbr_mrib_next_hop_s),
        (new_rpf_vif_rp, new.rpfp_nbr_wc),
        (new_rpf_vif_s, new.rpfp_nbr_sg),
        (new_rpf_vif_rp, new.rpfp_nbr_sg_rpt),
    ] {
        link_backref(instance, mre_idx, vif, addr);
    }

    true
}

// ===== neighbor back-reference maintenance =====

fn with_nbr(
    instance: &mut Instance,
    vif_index: Option<VifIndex>,
    addr: Option<IpAddr>,
    f: impl FnOnce(&mut crate::neighbor::Neighbor),
) {
    let (Some(vif_index), Some(addr)) = (vif_index, addr) else {
        return;
    };
    let Some((_, iface)) = instance
        .state
        .interfaces
        .get_mut_by_vif_index(&mut instance.arenas.interfaces, vif_index)
    else {
        return;
    };
    if let Some((_, nbr)) = iface
        .neighbors
        .get_mut_by_addr(&mut instance.arenas.neighbors, &addr)
    {
        f(nbr);
    }
}

fn link_backref(
    instance: &mut Instance,
    mre_idx: MreIndex,
    vif_index: Option<VifIndex>,
    addr: Option<IpAddr>,
) {
    let Some(mre) = instance.state.mrt.get(mre_idx) else {
        return;
    };
    let mre_type = mre.mre_type;
    with_nbr(instance, vif_index, addr, |nbr| {
        match mre_type {
            MreType::Rp => nbr.mre_rp.insert(mre_idx),
            MreType::Wc => nbr.mre_wc.insert(mre_idx),
            MreType::Sg => nbr.mre_sg.insert(mre_idx),
            MreType::SgRpt => nbr.mre_sg_rpt.insert(mre_idx),
        };
    });
}

fn unlink_backref(
    instance: &mut Instance,
    mre_idx: MreIndex,
    vif_index: Option<VifIndex>,
    addr: Option<IpAddr>,
) {
    with_nbr(instance, vif_index, addr, |nbr| {
        nbr.unlink_mre(mre_idx);
    });
}

// ===== upstream Join/Prune machines =====

// The upstream target and flags of one entry kind.
fn upstream_target(mre: &Mre) -> (Option<VifIndex>, Option<IpAddr>) {
    match mre.mre_type {
        MreType::Rp => (
            mre.rpf_interface_rp(),
            mre.nbr_mrib_next_hop_rp,
        ),
        MreType::Wc => (mre.rpf_interface_rp(), mre.rpfp_nbr_wc),
        MreType::Sg => (mre.rpf_interface_s(), mre.rpfp_nbr_sg),
        MreType::SgRpt => (mre.rpf_interface_rp(), mre.rpfp_nbr_sg_rpt),
    }
}

fn source_flags(mre_type: MreType) -> SourceFlags {
    match mre_type {
        MreType::Rp | MreType::Wc => {
            SourceFlags::SPARSE | SourceFlags::WC | SourceFlags::RPT
        }
        MreType::Sg => SourceFlags::SPARSE,
        MreType::SgRpt => SourceFlags::SPARSE | SourceFlags::RPT,
    }
}

// Sends one upstream Join or Prune for the entry toward its RPF'.
pub(crate) fn send_join_prune(
    instance: &mut Instance,
    mre_idx: MreIndex,
    is_join: bool,
    target_override: Option<(VifIndex, IpAddr)>,
) {
    let Some(mre) = instance.state.mrt.get(mre_idx) else {
        return;
    };
    let af = instance.af;
    let mre_type = mre.mre_type;
    let group_addr = mre.group;
    let (vif_index, target) = match target_override {
        Some((vif_index, target)) => (Some(vif_index), Some(target)),
        None => upstream_target(mre),
    };
    let (Some(vif_index), Some(target)) = (vif_index, target) else {
        // No route or no upstream neighbor; the periodic refresh will
        // retry once the MRIB or the neighbor list changes.
        return;
    };
    if let Some((_, iface)) = instance
        .state
        .interfaces
        .get_mut_by_vif_index(&mut instance.arenas.interfaces, vif_index)
        && !iface.state.active
    {
        iface.state.errors.no_route_upstream += 1;
        return;
    }

    let (group_prefix, source_addr) = match mre_type {
        MreType::Rp => (af.multicast_base(), mre.source),
        MreType::Wc => (
            group_addr.to_host_prefix(),
            match mre.rp_addr {
                Some(rp_addr) => rp_addr,
                None => return,
            },
        ),
        MreType::Sg | MreType::SgRpt => {
            (group_addr.to_host_prefix(), mre.source)
        }
    };

    if is_join {
        Debug::UpstreamJoin(mre_type, &source_addr, &group_addr, &target)
            .log();
    } else {
        Debug::UpstreamPrune(mre_type, &source_addr, &group_addr, &target)
            .log();
    }

    // Batch through the neighbor's J/P buffer when it exists, so that a
    // transition producing both a Join and a Prune leaves in a single
    // message.
    let Some((_, iface)) = instance
        .state
        .interfaces
        .get_mut_by_vif_index(&mut instance.arenas.interfaces, vif_index)
    else {
        return;
    };
    let holdtime = iface.config.join_prune_holdtime;
    let masklen = af.max_prefixlen();
    if let Some((_, nbr)) = iface
        .neighbors
        .get_mut_by_addr(&mut instance.arenas.neighbors, &target)
    {
        nbr.jp_buffer.add_entry(
            group_prefix,
            source_addr,
            masklen,
            source_flags(mre_type),
            is_join,
        );
        flush_jp(instance, vif_index, target, holdtime);
    } else {
        // Upstream router is not (yet) a known neighbor; send directly.
        let mut packet = crate::packet::join_prune::JoinPruneMsg {
            upstream_nbr: target,
            holdtime,
            groups: vec![crate::packet::join_prune::JoinPruneGroup {
                group: crate::packet::EncodedGroup::new(group_prefix),
                joins: Vec::new(),
                prunes: Vec::new(),
            }],
        };
        let source = crate::packet::join_prune::EncodedSource::new(
            source_addr,
            masklen,
            source_flags(mre_type),
        );
        if is_join {
            packet.groups[0].joins.push(source);
        } else {
            packet.groups[0].prunes.push(source);
        }
        send_on_vif(
            instance,
            vif_index,
            crate::packet::Packet::JoinPrune(packet),
        );
    }
}

// Flushes a neighbor's J/P buffer onto its vif.
pub(crate) fn flush_jp(
    instance: &mut Instance,
    vif_index: VifIndex,
    nbr_addr: IpAddr,
    holdtime: u16,
) {
    let Some((_, iface)) = instance
        .state
        .interfaces
        .get_mut_by_vif_index(&mut instance.arenas.interfaces, vif_index)
    else {
        return;
    };
    let Some((_, nbr)) = iface
        .neighbors
        .get_mut_by_addr(&mut instance.arenas.neighbors, &nbr_addr)
    else {
        return;
    };
    let Some(packet) = nbr.jp_buffer.take_msg(nbr_addr, holdtime) else {
        return;
    };
    send_on_vif(instance, vif_index, packet);
}

pub(crate) fn send_on_vif(
    instance: &mut Instance,
    vif_index: VifIndex,
    packet: crate::packet::Packet,
) {
    let af = instance.af;
    let Some((mut view, arenas)) = instance.as_up() else {
        return;
    };
    let state = &mut *view.state;
    let Some((_, iface)) = state
        .interfaces
        .get_mut_by_vif_index(&mut arenas.interfaces, vif_index)
    else {
        return;
    };
    iface.send_packet(&mut view, af.all_pim_routers(), packet);
}

// Evaluates JoinDesired and steps the upstream machine of a (*,*,RP),
// (*,G) or (S,G) entry.
pub(crate) fn update_upstream(instance: &mut Instance, mre_idx: MreIndex) {
    let is_sg_rpt = instance
        .state
        .mrt
        .get(mre_idx)
        .map(|mre| mre.is_sg_rpt())
        .unwrap_or(false);
    if is_sg_rpt {
        update_upstream_sg_rpt(instance, mre_idx);
        return;
    }

    let (desired, upstream_state, jp_period) = {
        let Some(mre) = instance.state.mrt.get(mre_idx) else {
            return;
        };
        let state = &instance.state;
        let ctx = OlistCtx::new(
            &state.interfaces,
            &instance.arenas.interfaces,
            state.register_vif_index,
        );
        let desired = match mre.mre_type {
            MreType::Rp => state.mrt.join_desired_rp(mre),
            MreType::Wc => state.mrt.join_desired_wc(&ctx, mre),
            MreType::Sg => state.mrt.join_desired_sg(&ctx, mre),
            MreType::SgRpt => false,
        };
        let jp_period = upstream_jp_period(instance, mre);
        (desired, mre.upstream_state, jp_period)
    };

    match (upstream_state, desired) {
        (UpstreamState::NoInfo, true) => {
            send_join_prune(instance, mre_idx, true, None);
            let timer = mre_jp_timer(instance, mre_idx, jp_period);
            if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
                mre.upstream_state = UpstreamState::Joined;
                mre.upstream_jp_timer = timer;
            }
        }
        (UpstreamState::Joined, false) => {
            send_join_prune(instance, mre_idx, false, None);
            if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
                mre.upstream_state = UpstreamState::NoInfo;
                mre.upstream_jp_timer = None;
            }
        }
        _ => (),
    }
}

// The (S,G,rpt) upstream machine.
pub(crate) fn update_upstream_sg_rpt(
    instance: &mut Instance,
    mre_idx: MreIndex,
) {
    let (prune_desired, rpt_join_desired, rpt_state, jp_period) = {
        let Some(mre) = instance.state.mrt.get(mre_idx) else {
            return;
        };
        let state = &instance.state;
        let ctx = OlistCtx::new(
            &state.interfaces,
            &instance.arenas.interfaces,
            state.register_vif_index,
        );
        (
            state.mrt.prune_desired_sg_rpt(&ctx, mre),
            state.mrt.rpt_join_desired(&ctx, mre),
            mre.rpt_state,
            upstream_jp_period(instance, mre),
        )
    };

    match (rpt_state, prune_desired, rpt_join_desired) {
        (SgRptUpstreamState::RptNotJoined, true, _) => {
            send_join_prune(instance, mre_idx, false, None);
            let timer = mre_jp_timer(instance, mre_idx, jp_period);
            if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
                mre.rpt_state = SgRptUpstreamState::Pruned;
                mre.upstream_jp_timer = timer;
            }
        }
        (SgRptUpstreamState::Pruned, false, true)
        | (SgRptUpstreamState::NotPruned, false, true) => {
            if rpt_state == SgRptUpstreamState::Pruned {
                // Rejoin the shared tree for this source.
                send_join_prune(instance, mre_idx, true, None);
            }
            if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
                mre.rpt_state = SgRptUpstreamState::NotPruned;
                mre.upstream_jp_timer = None;
            }
        }
        (SgRptUpstreamState::NotPruned, true, _) => {
            send_join_prune(instance, mre_idx, false, None);
            let timer = mre_jp_timer(instance, mre_idx, jp_period);
            if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
                mre.rpt_state = SgRptUpstreamState::Pruned;
                mre.upstream_jp_timer = timer;
            }
        }
        (_, _, false) => {
            if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
                mre.rpt_state = SgRptUpstreamState::RptNotJoined;
                mre.upstream_jp_timer = None;
            }
        }
        _ => (),
    }
}

// Ensures the (S,G,rpt) sibling of an (S,G) entry exists and
// re-evaluates its prune state (used by the SPT switch).
pub(crate) fn update_upstream_sg_rpt_sibling(
    instance: &mut Instance,
    sg_idx: MreIndex,
) {
    let (source, group) = {
        let Some(mre) = instance.state.mrt.get(sg_idx) else {
            return;
        };
        if !mre.is_sg() {
            return;
        }
        (mre.source, mre.group)
    };
    let af = instance.af;
    let sg_rpt_idx =
        instance
            .state
            .mrt
            .insert(af, MreType::SgRpt, &source, &group);
    update_rpf(instance, sg_rpt_idx);
    update_upstream_sg_rpt(instance, sg_rpt_idx);
}

// Periodic upstream Join refresh (t_periodic).
pub(crate) fn jp_timer_expired(instance: &mut Instance, mre_idx: MreIndex) {
    let (resend, jp_period) = {
        let Some(mre) = instance.state.mrt.get(mre_idx) else {
            return;
        };
        let resend = mre.upstream_state == UpstreamState::Joined
            || mre.rpt_state == SgRptUpstreamState::Pruned;
        (resend, upstream_jp_period(instance, mre))
    };
    if !resend {
        return;
    }
    let is_join = instance
        .state
        .mrt
        .get(mre_idx)
        .map(|mre| mre.upstream_state == UpstreamState::Joined)
        .unwrap_or(false);
    send_join_prune(instance, mre_idx, is_join, None);
    let timer = mre_jp_timer(instance, mre_idx, jp_period);
    if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
        mre.upstream_jp_timer = timer;
    }
}

// Restart of the Join timer on GenID change or a new RPF' uses
// min(remaining, t_override).
pub(crate) fn restart_jp_timer_override(
    instance: &mut Instance,
    mre_idx: MreIndex,
) {
    let t_override = {
        let Some(mre) = instance.state.mrt.get(mre_idx) else {
            return;
        };
        let (vif_index, _) = upstream_target(mre);
        let Some(vif_index) = vif_index else {
            return;
        };
        let Some((_, iface)) = instance
            .state
            .interfaces
            .get_by_vif_index(&instance.arenas.interfaces, vif_index)
        else {
            return;
        };
        iface.t_override(&instance.arenas.neighbors)
    };
    if let Some(mre) = instance.state.mrt.get_mut(mre_idx)
        && let Some(timer) = mre.upstream_jp_timer.as_mut()
    {
        let remaining = timer.remaining();
        if remaining > t_override {
            timer.reset(Some(t_override));
        }
    }
}

// RPF' changed while Joined: Join toward the new upstream, Prune
// toward the old one, timer back to t_periodic.
fn rpf_transfer(
    instance: &mut Instance,
    mre_idx: MreIndex,
    old: Option<IpAddr>,
    new: Option<IpAddr>,
) {
    let old_target = {
        let Some(mre) = instance.state.mrt.get(mre_idx) else {
            return;
        };
        let (vif_index, _) = upstream_target(mre);
        old.zip(vif_index).map(|(addr, vif)| (vif, addr))
    };

    send_join_prune(instance, mre_idx, true, None);
    if let Some((vif_index, old_addr)) = old_target {
        send_join_prune(instance, mre_idx, false, Some((vif_index, old_addr)));
    }
    let _ = new;

    let jp_period = {
        let Some(mre) = instance.state.mrt.get(mre_idx) else {
            return;
        };
        upstream_jp_period(instance, mre)
    };
    let timer = mre_jp_timer(instance, mre_idx, jp_period);
    if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
        mre.upstream_jp_timer = timer;
    }
}

// ===== helpers =====

fn upstream_jp_period(instance: &Instance, mre: &Mre) -> Duration {
    let (vif_index, _) = upstream_target(mre);
    let period = vif_index
        .and_then(|vif_index| {
            instance
                .state
                .interfaces
                .get_by_vif_index(&instance.arenas.interfaces, vif_index)
                .map(|(_, iface)| iface.config.join_prune_period)
        })
        .unwrap_or(crate::consts::JOIN_PRUNE_PERIOD);
    Duration::from_secs(period as u64)
}

fn mre_jp_timer(
    instance: &mut Instance,
    mre_idx: MreIndex,
    period: Duration,
) -> Option<pim_utils::task::TimeoutTask> {
    let key = instance.state.mrt.get(mre_idx)?.key();
    let (view, _) = instance.as_up()?;
    Some(tasks::mre_timer(
        &view,
        key,
        MreTimerKind::UpstreamJp,
        period,
    ))
}
