//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

//! Receive-path event handlers.

use std::net::IpAddr;
use std::time::Duration;

use ipnetwork::IpNetwork;
use pim_utils::ip::IpAddrExt;
use pim_utils::mfea::{
    MembershipMsg, MembershipOp, VifFlags, VifIndex, VifMsg,
};
use rand::Rng;

use crate::collections::{InterfaceIndex, InterfaceKey, NeighborKey};
use crate::debug::{Debug, InterfaceInactiveReason};
use crate::error::Error;
use crate::instance::Instance;
use crate::interface::VifAddr;
use crate::mrt::task::TaskKind;
use crate::mrt::{MreKey, MreType};
use crate::packet::error::DecodeError;
use crate::packet::hello::HelloMsg;
use crate::packet::join_prune::{JoinPruneMsg, JpEntryType};
use crate::packet::{Packet, PacketType};
use crate::tasks;
use crate::tasks::messages::input::{
    MreTimerKind, MribUpdateMsg, NetRxPacketMsg,
};
use crate::{bsr, mrt};

// ===== Network packet receipt =====

pub(crate) fn process_packet(
    instance: &mut Instance,
    msg: NetRxPacketMsg,
) -> Result<(), Error> {
    if !instance.state.active {
        return Ok(());
    }
    let Ok((iface_idx, vif_index, ifname, active, accept_nohello)) = instance
        .state
        .interfaces
        .get_by_key(&instance.arenas.interfaces, &msg.iface_key)
        .map(|(iface_idx, iface)| {
            (
                iface_idx,
                iface.vif_index,
                iface.name.clone(),
                iface.state.active,
                iface.config.accept_nohello_neighbors,
            )
        })
    else {
        return Ok(());
    };

    // Decode outcome and per-vif statistics.
    let packet = match msg.packet {
        Ok(packet) => packet,
        Err(error) => {
            count_decode_error(instance, vif_index, &error);
            return Err(Error::PacketDecodeError(error));
        }
    };

    if !active {
        bump_error(instance, vif_index, |errors| {
            errors.rx_interface_disabled_messages += 1
        });
        return Err(Error::InterfaceDisabled(ifname, packet.pkt_type()));
    }

    // The source must be a usable unicast address.
    if !msg.src.is_usable() {
        return Err(Error::InvalidSrcAddr(msg.src));
    }

    Debug::PacketRx(&ifname, &msg.src, &packet).log();
    let pkt_type = packet.pkt_type();
    if let Some((_, iface)) = instance
        .state
        .interfaces
        .get_mut_by_vif_index(&mut instance.arenas.interfaces, vif_index)
    {
        iface.state.counters.mark_rx(pkt_type);
    }
    instance.state.statistics.msgs_rcvd[pkt_type as usize] += 1;

    // Several message types require an existing neighbor relationship.
    if matches!(
        pkt_type,
        PacketType::JoinPrune
            | PacketType::Assert
            | PacketType::Graft
            | PacketType::GraftAck
            | PacketType::Bootstrap
    ) {
        let known = instance
            .state
            .interfaces
            .get_by_vif_index(&instance.arenas.interfaces, vif_index)
            .and_then(|(_, iface)| {
                iface
                    .neighbors
                    .get_by_any_addr(&instance.arenas.neighbors, &msg.src)
            })
            .is_some();
        if !known {
            if accept_nohello {
                create_nohello_neighbor(instance, iface_idx, vif_index, msg.src);
            } else {
                bump_error(instance, vif_index, |errors| {
                    errors.neighbor_unknown_messages += 1
                });
                if let Some((_, iface)) =
                    instance.state.interfaces.get_mut_by_vif_index(
                        &mut instance.arenas.interfaces,
                        vif_index,
                    )
                {
                    iface.state.counters.mark_rx_error(pkt_type);
                }
                return Err(Error::UnknownNeighbor(ifname, msg.src));
            }
        }
    }

    match &packet {
        Packet::Hello(hello) => {
            process_hello(instance, iface_idx, vif_index, msg.src, hello)
        }
        Packet::JoinPrune(jp) => {
            process_join_prune(instance, vif_index, msg.src, jp)
        }
        Packet::Assert(assert) => {
            process_assert(instance, vif_index, msg.src, assert)
        }
        Packet::Register(register) => mrt::register::process_register(
            instance, msg.src, msg.dst, register,
        )
        .inspect_err(|_| {
            bump_error(instance, vif_index, |errors| {
                errors.rx_register_not_rp += 1
            });
        }),
        Packet::RegisterStop(register_stop) => {
            if !mrt::register::process_register_stop(instance, register_stop) {
                bump_error(instance, vif_index, |errors| {
                    errors.unknown_register_stop += 1
                });
            }
            Ok(())
        }
        Packet::Bootstrap(bootstrap) => {
            bsr::process_bootstrap(instance, vif_index, msg.src, bootstrap)
        }
        Packet::CandRpAdv(cand_rp_adv) => {
            bsr::process_cand_rp_adv(instance, msg.src, cand_rp_adv)
        }
        // Dense-mode only; parsed and counted.
        Packet::Graft(_) | Packet::GraftAck(_) => {
            bump_error(instance, vif_index, |errors| {
                errors.rx_graft_graft_ack_no_state += 1
            });
            Ok(())
        }
    }
}

fn count_decode_error(
    instance: &mut Instance,
    vif_index: VifIndex,
    error: &DecodeError,
) {
    bump_error(instance, vif_index, |errors| match error {
        DecodeError::InvalidChecksum => errors.bad_checksum_messages += 1,
        DecodeError::UnknownPacketType(_) => {
            errors.unknown_type_messages += 1
        }
        DecodeError::InvalidVersion(_) => {
            errors.unknown_version_messages += 1
        }
        DecodeError::IncompletePacket => errors.bad_length_messages += 1,
        _ => errors.rx_malformed_packet += 1,
    });
}

fn bump_error(
    instance: &mut Instance,
    vif_index: VifIndex,
    f: impl FnOnce(&mut crate::interface::ErrorCounters),
) {
    if let Some((_, iface)) = instance
        .state
        .interfaces
        .get_mut_by_vif_index(&mut instance.arenas.interfaces, vif_index)
    {
        f(&mut iface.state.errors);
    }
}

// ===== Hello =====

fn process_hello(
    instance: &mut Instance,
    iface_idx: InterfaceIndex,
    vif_index: VifIndex,
    src: IpAddr,
    hello: &HelloMsg,
) -> Result<(), Error> {
    if hello.unknown_options > 0 {
        bump_error(instance, vif_index, |errors| {
            errors.rx_unknown_hello_option += hello.unknown_options as u64
        });
    }

    // A holdtime of zero tears the neighbor down at once.
    if hello.holdtime == Some(0) {
        delete_neighbor(instance, iface_idx, vif_index, src);
        return Ok(());
    }

    let (is_new, gen_id_changed) = {
        let Some(iface) = instance.arenas.interfaces.get_mut(iface_idx)
        else {
            return Ok(());
        };
        match iface
            .neighbors
            .get_mut_by_addr(&mut instance.arenas.neighbors, &src)
        {
            Some((_, nbr)) => (false, nbr.update_from_hello(hello)),
            None => {
                Debug::NeighborCreate(&iface.name, &src).log();
                let (_, nbr) = iface.neighbors.insert(
                    &mut instance.arenas.neighbors,
                    vif_index,
                    src,
                );
                nbr.update_from_hello(hello);
                (true, true)
            }
        }
    };

    refresh_liveness(instance, iface_idx, src);

    if is_new || gen_id_changed {
        if !is_new {
            let ifname = instance
                .arenas
                .interfaces
                .get(iface_idx)
                .map(|iface| iface.name.clone())
                .unwrap_or_default();
            Debug::NeighborGenIdChange(
                &ifname,
                &src,
                hello.gen_id.unwrap_or(0),
            )
            .log();
        }

        // A new or restarted neighbor needs a prompt Hello from us, at
        // a random point inside the triggered window.
        arm_triggered_hello(instance, iface_idx);

        // An elected BSR refreshes newcomers with the current RP-set.
        let elected_zones = instance
            .state
            .bsr
            .config_zones
            .iter()
            .filter(|zone| zone.state == bsr::BsrZoneState::ElectedBsr)
            .map(|zone| zone.zone_id)
            .collect::<Vec<_>>();
        for zone_id in elected_zones {
            bsr::originate_bootstrap(instance, zone_id, None);
        }

        let kind = if is_new {
            TaskKind::NeighborAdded {
                vif_index,
                addr: src,
            }
        } else {
            TaskKind::NeighborGenIdChanged {
                vif_index,
                addr: src,
            }
        };
        mrt::task::schedule(instance, kind);
    }

    dr_update_vif(instance, iface_idx);
    Ok(())
}

// Arms or refreshes a neighbor's liveness timer from its holdtime.
fn refresh_liveness(
    instance: &mut Instance,
    iface_idx: InterfaceIndex,
    src: IpAddr,
) {
    let timer = {
        let Some((view, arenas)) = instance.as_up() else {
            return;
        };
        let Some(iface) = arenas.interfaces.get(iface_idx) else {
            return;
        };
        let Some((_, nbr)) =
            iface.neighbors.get_by_addr(&arenas.neighbors, &src)
        else {
            return;
        };
        // A holdtime of 0xffff leaves the neighbor armed forever.
        nbr.liveness()
            .map(|timeout| {
                tasks::nbr_liveness_timer(iface, nbr, &view, timeout)
            })
    };

    let Some(iface) = instance.arenas.interfaces.get(iface_idx) else {
        return;
    };
    if let Some((nbr_idx, _)) =
        iface.neighbors.get_by_addr(&instance.arenas.neighbors, &src)
        && let Some(nbr) = instance.arenas.neighbors.get_mut(nbr_idx)
    {
        nbr.liveness_timer = timer;
    }
}

fn arm_triggered_hello(instance: &mut Instance, iface_idx: InterfaceIndex) {
    let timer = {
        let Some((view, arenas)) = instance.as_up() else {
            return;
        };
        let Some(iface) = arenas.interfaces.get(iface_idx) else {
            return;
        };
        if iface.state.triggered_hello_timer.is_some() {
            // One triggered Hello is already on its way.
            return;
        }
        let delay = rand::rng().random_range(
            0..=iface.config.triggered_hello_delay as u64 * 1000,
        );
        tasks::triggered_hello_timer(
            iface,
            &view,
            Duration::from_millis(delay),
        )
    };
    if let Some(iface) = instance.arenas.interfaces.get_mut(iface_idx) {
        iface.state.triggered_hello_timer = Some(timer);
    }
}

// Creates a neighbor from a non-Hello message (accept-nohello).
fn create_nohello_neighbor(
    instance: &mut Instance,
    iface_idx: InterfaceIndex,
    vif_index: VifIndex,
    src: IpAddr,
) {
    {
        let Some(iface) = instance.arenas.interfaces.get_mut(iface_idx)
        else {
            return;
        };
        Debug::NeighborCreate(&iface.name, &src).log();
        let (_, nbr) = iface.neighbors.insert(
            &mut instance.arenas.neighbors,
            vif_index,
            src,
        );
        nbr.is_nohello = true;
    }
    refresh_liveness(instance, iface_idx, src);
    mrt::task::schedule(
        instance,
        TaskKind::NeighborAdded {
            vif_index,
            addr: src,
        },
    );
    dr_update_vif(instance, iface_idx);
}

// Detaches a neighbor and defers its destruction until every routing
// entry pointing at it has been re-parented.
fn delete_neighbor(
    instance: &mut Instance,
    iface_idx: InterfaceIndex,
    vif_index: VifIndex,
    addr: IpAddr,
) {
    let nbr_idx = {
        let Some(iface) = instance.arenas.interfaces.get_mut(iface_idx)
        else {
            return;
        };
        let Some((nbr_idx, _)) =
            iface.neighbors.get_by_addr(&instance.arenas.neighbors, &addr)
        else {
            return;
        };
        Debug::NeighborDelete(&iface.name, &addr).log();
        iface.neighbors.detach(&instance.arenas.neighbors, nbr_idx);
        nbr_idx
    };
    if let Some(nbr) = instance.arenas.neighbors.get_mut(nbr_idx) {
        nbr.liveness_timer = None;
    }
    mrt::task::schedule(
        instance,
        TaskKind::NeighborGone {
            nbr_idx: Some(nbr_idx),
            vif_index,
            addr,
        },
    );
    dr_update_vif(instance, iface_idx);
}

pub(crate) fn process_nbr_timeout(
    instance: &mut Instance,
    iface_key: InterfaceKey,
    nbr_key: NeighborKey,
) -> Result<(), Error> {
    let (iface_idx, vif_index, ifname) = {
        let (iface_idx, iface) = instance
            .state
            .interfaces
            .get_by_key(&instance.arenas.interfaces, &iface_key)?;
        (iface_idx, iface.vif_index, iface.name.clone())
    };
    let addr = {
        let Some(iface) = instance.arenas.interfaces.get(iface_idx) else {
            return Ok(());
        };
        let (_, nbr) = iface
            .neighbors
            .get_by_key(&instance.arenas.neighbors, &nbr_key)?;
        nbr.addr
    };
    Debug::NeighborTimeout(&ifname, &addr).log();
    delete_neighbor(instance, iface_idx, vif_index, addr);
    Ok(())
}

// ===== DR election =====

fn dr_update_vif(instance: &mut Instance, iface_idx: InterfaceIndex) {
    let changed = {
        let Some((mut view, arenas)) = instance.as_up() else {
            return;
        };
        let Some(iface) = arenas.interfaces.get_mut(iface_idx) else {
            return;
        };
        iface.dr_update(&mut view, &arenas.neighbors)
    };
    if changed {
        let vif_index = instance
            .arenas
            .interfaces
            .get(iface_idx)
            .map(|iface| iface.vif_index);
        if let Some(vif_index) = vif_index {
            mrt::task::schedule(instance, TaskKind::MyDrChanged { vif_index });
        }
    }
}

pub(crate) fn dr_update(
    instance: &mut Instance,
    ifname: &str,
) -> Result<(), Error> {
    let Some((iface_idx, _)) = instance
        .state
        .interfaces
        .get_by_name(&instance.arenas.interfaces, ifname)
    else {
        return Err(Error::InterfaceNotFound(ifname.to_owned()));
    };
    dr_update_vif(instance, iface_idx);
    Ok(())
}

// ===== Join/Prune =====

fn process_join_prune(
    instance: &mut Instance,
    vif_index: VifIndex,
    src: IpAddr,
    jp: &JoinPruneMsg,
) -> Result<(), Error> {
    let af = instance.af;
    let addressed_to_us = instance
        .state
        .interfaces
        .get_by_vif_index(&instance.arenas.interfaces, vif_index)
        .map(|(_, iface)| iface.is_my_addr(&jp.upstream_nbr))
        .unwrap_or(false);

    for group in &jp.groups {
        let group_addr = group.group.prefix.ip();
        let has_wc_join = group.joins.iter().any(|source| {
            source.entry_type(&group.group) == JpEntryType::Wc
        });

        for (source, is_join) in group
            .joins
            .iter()
            .map(|source| (source, true))
            .chain(group.prunes.iter().map(|source| (source, false)))
        {
            let entry_type = source.entry_type(&group.group);
            count_jp_entry(instance, vif_index, entry_type, is_join);

            if !addressed_to_us {
                // Somebody else's Join/Prune on the LAN: suppression and
                // override handling for our own upstream state.
                process_jp_overheard(
                    instance,
                    vif_index,
                    &jp.upstream_nbr,
                    &group_addr,
                    source.addr,
                    entry_type,
                    is_join,
                );
                continue;
            }

            let mre_type = match entry_type {
                JpEntryType::Rp => MreType::Rp,
                JpEntryType::Wc => MreType::Wc,
                JpEntryType::Sg => MreType::Sg,
                JpEntryType::SgRpt => MreType::SgRpt,
            };
            // Joins create state; prunes only create state for
            // (S,G,rpt), which must remember being pruned.
            let mre_idx = if is_join || entry_type == JpEntryType::SgRpt {
                Some(instance.state.mrt.insert(
                    af,
                    mre_type,
                    &source.addr,
                    &group_addr,
                ))
            } else {
                let key = MreKey {
                    source: source.addr,
                    group: group_addr,
                    mre_type,
                };
                instance.state.mrt.lookup_key(&key)
            };
            let Some(mre_idx) = mre_idx else {
                bump_error(instance, vif_index, |errors| {
                    errors.rx_join_prune_no_state += 1
                });
                continue;
            };

            if entry_type == JpEntryType::SgRpt && has_wc_join {
                // The same message joins (*,G); remember that the
                // (S,G,rpt) prune rode along with it.
                if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
                    mre.processed_wc_by_sg_rpt.set(vif_index);
                }
            }

            if is_join {
                mrt::downstream::receive_join(
                    instance,
                    mre_idx,
                    vif_index,
                    jp.holdtime,
                );
            } else {
                mrt::downstream::receive_prune(
                    instance,
                    mre_idx,
                    vif_index,
                    jp.holdtime,
                );
            }
        }
    }
    Ok(())
}

// A Join/Prune overheard on the LAN, targeted at another router.
fn process_jp_overheard(
    instance: &mut Instance,
    vif_index: VifIndex,
    target: &IpAddr,
    group: &IpAddr,
    source: IpAddr,
    entry_type: JpEntryType,
    is_join: bool,
) {
    let mre_type = match entry_type {
        JpEntryType::Rp => MreType::Rp,
        JpEntryType::Wc => MreType::Wc,
        JpEntryType::Sg => MreType::Sg,
        JpEntryType::SgRpt => MreType::SgRpt,
    };
    let key = MreKey {
        source,
        group: *group,
        mre_type,
    };
    let Some(mre_idx) = instance.state.mrt.lookup_key(&key) else {
        return;
    };

    // Only reacts when the overheard message addresses our RPF'.
    let (matches_rpf, suppression) = {
        let Some(mre) = instance.state.mrt.get(mre_idx) else {
            return;
        };
        let rpfp = match mre_type {
            MreType::Rp => mre.nbr_mrib_next_hop_rp,
            MreType::Wc => mre.rpfp_nbr_wc,
            MreType::Sg => mre.rpfp_nbr_sg,
            MreType::SgRpt => mre.rpfp_nbr_sg_rpt,
        };
        let suppression = instance
            .state
            .interfaces
            .get_by_vif_index(&instance.arenas.interfaces, vif_index)
            .map(|(_, iface)| {
                iface.join_suppression_enabled(&instance.arenas.neighbors)
            })
            .unwrap_or(false);
        (rpfp == Some(*target), suppression)
    };
    if !matches_rpf {
        return;
    }

    if is_join {
        // Another router keeps the upstream state alive for us.
        if suppression
            && let Some(mre) = instance.state.mrt.get_mut(mre_idx)
            && let Some(timer) = mre.upstream_jp_timer.as_mut()
        {
            timer.reset(None);
        }
    } else {
        // A prune toward our upstream: answer with a Join within
        // t_override.
        mrt::upstream::restart_jp_timer_override(instance, mre_idx);
    }
}

fn count_jp_entry(
    instance: &mut Instance,
    vif_index: VifIndex,
    entry_type: JpEntryType,
    is_join: bool,
) {
    bump_error(instance, vif_index, |errors| {
        match (entry_type, is_join) {
            (JpEntryType::Rp, true) => errors.rx_join_rp += 1,
            (JpEntryType::Rp, false) => errors.rx_prune_rp += 1,
            (JpEntryType::Wc, true) => errors.rx_join_wc += 1,
            (JpEntryType::Wc, false) => errors.rx_prune_wc += 1,
            (JpEntryType::Sg, true) => errors.rx_join_sg += 1,
            (JpEntryType::Sg, false) => errors.rx_prune_sg += 1,
            (JpEntryType::SgRpt, true) => errors.rx_join_sg_rpt += 1,
            (JpEntryType::SgRpt, false) => errors.rx_prune_sg_rpt += 1,
        }
    });
}

// ===== Assert =====

fn process_assert(
    instance: &mut Instance,
    vif_index: VifIndex,
    src: IpAddr,
    assert: &crate::packet::assert::AssertMsg,
) -> Result<(), Error> {
    // An assert from one of our own addresses is a protocol violation.
    let from_self = instance
        .state
        .interfaces
        .get_by_vif_index(&instance.arenas.interfaces, vif_index)
        .map(|(_, iface)| iface.is_my_addr(&src))
        .unwrap_or(false);
    if from_self {
        let ifname = instance
            .state
            .interfaces
            .get_by_vif_index(&instance.arenas.interfaces, vif_index)
            .map(|(_, iface)| iface.name.clone())
            .unwrap_or_default();
        bump_error(instance, vif_index, |errors| {
            errors.rx_assert_from_self += 1
        });
        return Err(Error::AssertFromSelf(ifname, src));
    }

    let group = assert.group.prefix.ip();
    let af = instance.af;

    // An (S,G) assert steps the (S,G) machine; a (*,G) assert (RPT bit,
    // source is the RP) steps the (*,G) machine.
    let mre_idx = if assert.rpt_bit {
        instance.state.mrt.insert(af, MreType::Wc, &assert.source, &group)
    } else {
        instance
            .state
            .mrt
            .insert(af, MreType::Sg, &assert.source, &group)
    };
    mrt::upstream::update_rpf(instance, mre_idx);
    mrt::assert::process_assert(instance, mre_idx, vif_index, src, assert);
    Ok(())
}

// ===== per-entry timers =====

pub(crate) fn process_mre_timer(
    instance: &mut Instance,
    key: MreKey,
    kind: MreTimerKind,
) -> Result<(), Error> {
    let Some(mre_idx) = instance.state.mrt.lookup_key(&key) else {
        return Ok(());
    };
    match kind {
        MreTimerKind::UpstreamJp => {
            mrt::upstream::jp_timer_expired(instance, mre_idx);
        }
        MreTimerKind::DownstreamExpiry(vif_index) => {
            mrt::downstream::expiry_expired(instance, mre_idx, vif_index);
        }
        MreTimerKind::PrunePending(vif_index) => {
            mrt::downstream::prune_pending_expired(
                instance, mre_idx, vif_index,
            );
        }
        MreTimerKind::Assert(vif_index) => {
            mrt::assert::assert_timer_expired(instance, mre_idx, vif_index);
        }
        MreTimerKind::AssertRateLimit(vif_index) => {
            mrt::assert::rate_limit_expired(instance, mre_idx, vif_index);
        }
        MreTimerKind::RegisterStop => {
            mrt::register::register_stop_timer_expired(instance, mre_idx);
        }
        MreTimerKind::Keepalive => {
            mrt::register::keepalive_expired(instance, mre_idx);
        }
    }
    Ok(())
}

// ===== Hello timers =====

pub(crate) fn process_hello_interval(
    instance: &mut Instance,
    iface_key: InterfaceKey,
) -> Result<(), Error> {
    send_hello(instance, &iface_key)
}

pub(crate) fn process_triggered_hello(
    instance: &mut Instance,
    iface_key: InterfaceKey,
) -> Result<(), Error> {
    // Drop the one-shot handle first so a new trigger can be armed.
    if let Ok((_, iface)) = instance
        .state
        .interfaces
        .get_mut_by_key(&mut instance.arenas.interfaces, &iface_key)
    {
        iface.state.triggered_hello_timer = None;
    }
    send_hello(instance, &iface_key)
}

fn send_hello(
    instance: &mut Instance,
    iface_key: &InterfaceKey,
) -> Result<(), Error> {
    let Some((mut view, arenas)) = instance.as_up() else {
        return Ok(());
    };
    let state = &mut *view.state;
    let Ok((_, iface)) =
        state.interfaces.get_mut_by_key(&mut arenas.interfaces, iface_key)
    else {
        return Ok(());
    };
    iface.send_hello(&mut view);
    Ok(())
}

// ===== membership =====

pub(crate) fn process_membership(instance: &mut Instance, msg: MembershipMsg) {
    if !instance.state.active {
        return;
    }
    let af = instance.af;
    let mre_idx = match msg.source {
        None => instance.state.mrt.insert(
            af,
            MreType::Wc,
            &IpAddr::unspecified(af),
            &msg.group,
        ),
        Some(source) => {
            instance
                .state
                .mrt
                .insert(af, MreType::Sg, &source, &msg.group)
        }
    };

    if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
        match msg.op {
            MembershipOp::Join => {
                mre.local_include.set(msg.vif_index);
                mre.local_exclude.clear(msg.vif_index);
            }
            MembershipOp::Leave => {
                mre.local_include.clear(msg.vif_index);
            }
        }
    }
    mrt::task::entry_state_changed(instance, mre_idx);

    // New receivers at a last-hop router may warrant an SPT switch.
    if msg.op == MembershipOp::Join && msg.source.is_none() {
        mrt::spt::recheck_last_hop(instance, mre_idx);
    }
}

// ===== vif events =====

pub(crate) fn process_vif_msg(
    instance: &mut Instance,
    msg: VifMsg,
) -> Result<(), Error> {
    match msg {
        VifMsg::Update(update) => {
            if instance
                .state
                .interfaces
                .get_by_name(&instance.arenas.interfaces, &update.ifname)
                .is_none()
            {
                instance.add_vif(&update.ifname)?;
            }
            let af = instance.af;
            let (iface_idx, iface) = instance
                .state
                .interfaces
                .get_mut_by_name(
                    &mut instance.arenas.interfaces,
                    &update.ifname,
                )
                .ok_or_else(|| {
                    Error::InterfaceNotFound(update.ifname.clone())
                })?;
            iface.system.flags = update.flags;
            iface.system.mtu = update.mtu;
            iface.update_addresses(af);
            let iface_idx_copy = iface_idx;
            instance.state.interfaces.update_ifindex(
                iface_idx_copy,
                &mut instance.arenas.interfaces[iface_idx_copy],
                Some(update.ifindex),
            );
            update_interface(instance, &update.ifname)
        }
        VifMsg::Delete(ifname) => instance.delete_vif(&ifname),
        VifMsg::AddressAdd(addr_msg) => {
            let af = instance.af;
            let (_, iface) = instance
                .state
                .interfaces
                .get_mut_by_name(
                    &mut instance.arenas.interfaces,
                    &addr_msg.ifname,
                )
                .ok_or_else(|| {
                    Error::InterfaceNotFound(addr_msg.ifname.clone())
                })?;
            if !iface.is_my_addr(&addr_msg.addr) {
                iface.system.addrs.push(VifAddr {
                    addr: addr_msg.addr,
                    subnet: addr_msg.subnet,
                    broadcast: addr_msg.broadcast,
                    peer: addr_msg.peer,
                });
            }
            iface.update_addresses(af);
            update_interface(instance, &addr_msg.ifname)
        }
        VifMsg::AddressDel(addr_msg) => {
            let af = instance.af;
            let (_, iface) = instance
                .state
                .interfaces
                .get_mut_by_name(
                    &mut instance.arenas.interfaces,
                    &addr_msg.ifname,
                )
                .ok_or_else(|| {
                    Error::InterfaceNotFound(addr_msg.ifname.clone())
                })?;
            iface
                .system
                .addrs
                .retain(|vif_addr| vif_addr.addr != addr_msg.addr);
            iface.update_addresses(af);
            update_interface(instance, &addr_msg.ifname)
        }
    }
}

// Starts or stops the vif to match its configuration, and fans the
// change out over the routing entries.
pub(crate) fn update_interface(
    instance: &mut Instance,
    ifname: &str,
) -> Result<(), Error> {
    if !instance.state.active {
        return Ok(());
    }
    let (iface_idx, was_active) = {
        let Some((iface_idx, iface)) = instance
            .state
            .interfaces
            .get_by_name(&instance.arenas.interfaces, ifname)
        else {
            return Err(Error::InterfaceNotFound(ifname.to_owned()));
        };
        (iface_idx, iface.state.active)
    };

    {
        let Some((mut view, arenas)) = instance.as_up() else {
            return Ok(());
        };
        let Some(iface) = arenas.interfaces.get_mut(iface_idx) else {
            return Ok(());
        };
        iface.update(&mut view);
    }

    let (vif_index, now_active) = {
        let Some(iface) = instance.arenas.interfaces.get(iface_idx) else {
            return Ok(());
        };
        (iface.vif_index, iface.state.active)
    };
    if was_active != now_active {
        if now_active {
            mrt::task::schedule(instance, TaskKind::VifStarted { vif_index });
        } else {
            teardown_vif_neighbors(instance, iface_idx, vif_index);
            mrt::task::schedule(instance, TaskKind::VifStopped { vif_index });
        }
    }
    Ok(())
}

// Stops one interface and sweeps its state.
pub(crate) fn stop_interface(
    instance: &mut Instance,
    iface_idx: InterfaceIndex,
    reason: InterfaceInactiveReason,
) {
    let vif_index = {
        let Some((mut view, arenas)) = instance.as_up() else {
            return;
        };
        let Some(iface) = arenas.interfaces.get_mut(iface_idx) else {
            return;
        };
        iface.stop(&mut view, reason);
        iface.vif_index
    };
    teardown_vif_neighbors(instance, iface_idx, vif_index);
    mrt::task::schedule(instance, TaskKind::VifStopped { vif_index });
}

fn teardown_vif_neighbors(
    instance: &mut Instance,
    iface_idx: InterfaceIndex,
    vif_index: VifIndex,
) {
    let addrs = {
        let Some(iface) = instance.arenas.interfaces.get(iface_idx) else {
            return;
        };
        iface
            .neighbors
            .iter(&instance.arenas.neighbors)
            .map(|nbr| nbr.addr)
            .collect::<Vec<_>>()
    };
    for addr in addrs {
        delete_neighbor(instance, iface_idx, vif_index, addr);
    }
}

// ===== Register vif =====

// The logical Register interface carries encapsulated traffic toward
// the RP. Failing to create it is fatal for the instance start.
pub(crate) fn create_register_vif(
    instance: &mut Instance,
) -> Result<(), Error> {
    const REGISTER_VIF_NAME: &str = "register_vif";

    if instance
        .state
        .interfaces
        .get_by_name(&instance.arenas.interfaces, REGISTER_VIF_NAME)
        .is_none()
    {
        instance.add_vif(REGISTER_VIF_NAME).map_err(|error| {
            Error::RegisterVifCreation(error.to_string())
        })?;
    }
    let af = instance.af;
    let register_source = instance.config.register_source.clone();
    let source_addr = register_source
        .as_deref()
        .and_then(|ifname| {
            instance
                .state
                .interfaces
                .get_by_name(&instance.arenas.interfaces, ifname)
                .and_then(|(_, iface)| iface.state.domain_wide_addr)
        })
        .or_else(|| {
            instance
                .state
                .interfaces
                .iter(&instance.arenas.interfaces)
                .find_map(|iface| iface.state.domain_wide_addr)
        });

    let Some((_, iface)) = instance
        .state
        .interfaces
        .get_mut_by_name(&mut instance.arenas.interfaces, REGISTER_VIF_NAME)
    else {
        return Err(Error::RegisterVifCreation(
            "interface lookup failed".to_owned(),
        ));
    };
    iface.system.flags = VifFlags::PIM_REGISTER | VifFlags::UP;
    iface.config.enabled = true;
    if let Some(source_addr) = source_addr {
        iface.system.addrs = vec![VifAddr {
            addr: source_addr,
            subnet: source_addr.to_host_prefix(),
            broadcast: None,
            peer: None,
        }];
        iface.update_addresses(af);
    }
    instance.state.register_vif_index = Some(iface.vif_index);

    bsr::start(instance);
    Ok(())
}

// ===== MRIB and RP-set changes =====

pub(crate) fn process_mrib_update(
    instance: &mut Instance,
    msg: MribUpdateMsg,
) {
    if msg.replace {
        instance.state.mrib.replace_all(msg.add);
        mrt::task::schedule(instance, TaskKind::MribChanged { prefix: None });
        return;
    }
    let mut prefixes: Vec<IpNetwork> = Vec::new();
    for prefix in msg.remove {
        instance.state.mrib.remove(&prefix);
        prefixes.push(prefix);
    }
    for entry in msg.add {
        prefixes.push(entry.prefix);
        instance.state.mrib.insert(entry);
    }
    for prefix in prefixes {
        mrt::task::schedule(
            instance,
            TaskKind::MribChanged {
                prefix: Some(prefix),
            },
        );
    }
}

// The RP mapping changed for a group range: every affected entry must
// re-elect its RP (invariant: an entry's RP always matches the table).
pub(crate) fn rp_table_changed(
    instance: &mut Instance,
    prefix: Option<IpNetwork>,
) {
    if !instance.state.active {
        return;
    }
    mrt::task::schedule(instance, TaskKind::RpChanged { prefix });
}
