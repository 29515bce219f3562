//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

//! Register and Register-Stop handling, on both the DR and the RP side.

use std::net::IpAddr;
use std::time::Duration;

use bytes::Bytes;
use pim_utils::mfea::VifIndex;
use rand::Rng;

use crate::consts::{
    KEEPALIVE_PERIOD, REGISTER_PROBE_TIME, REGISTER_SUPPRESSION_TIME,
    RP_KEEPALIVE_PERIOD,
};
use crate::debug::Debug;
use crate::instance::Instance;
use crate::mrt::{
    MreFlags, MreIndex, MreType, RegisterState, task, upstream,
};
use crate::packet::register::{RegisterMsg, RegisterStopMsg};
use crate::packet::{EncodedGroup, Packet};
use crate::tasks;
use crate::tasks::messages::input::MreTimerKind;

// CouldRegister(S,G): we are the DR on the source's interface, the
// source is directly connected, and the flow is alive.
pub(crate) fn could_register(instance: &Instance, mre_idx: MreIndex) -> bool {
    let Some(mre) = instance.state.mrt.get(mre_idx) else {
        return false;
    };
    if !mre.is_sg() || !mre.flags.contains(MreFlags::DIRECTLY_CONNECTED_S) {
        return false;
    }
    if mre.keepalive_timer.is_none() {
        return false;
    }
    mre.rpf_interface_s()
        .and_then(|vif_index| {
            instance
                .state
                .interfaces
                .get_by_vif_index(&instance.arenas.interfaces, vif_index)
        })
        .map(|(_, iface)| iface.i_am_dr())
        .unwrap_or(false)
}

// Steps the Register machine after any state change that can affect
// CouldRegister.
pub(crate) fn update_register_state(
    instance: &mut Instance,
    mre_idx: MreIndex,
) {
    let could_register = could_register(instance, mre_idx);
    let Some(mre) = instance.state.mrt.get(mre_idx) else {
        return;
    };
    match (mre.register_state, could_register) {
        (RegisterState::NoInfo, true) => {
            if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
                mre.register_state = RegisterState::Join;
            }
            // The register pseudo-vif joins the olist; the kernel will
            // raise WHOLEPKT upcalls for the packets to encapsulate.
            task::update_mfc(instance, mre_idx);
        }
        (
            RegisterState::Join
            | RegisterState::JoinPending
            | RegisterState::Prune,
            false,
        ) => {
            if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
                mre.register_state = RegisterState::NoInfo;
                mre.register_stop_timer = None;
                mre.pmbr_addr = None;
            }
            task::update_mfc(instance, mre_idx);
        }
        _ => (),
    }
}

// A WHOLEPKT upcall for a packet that must be Register-encapsulated
// toward the RP (DR side).
pub(crate) fn whole_pkt_to_register(
    instance: &mut Instance,
    mre_idx: MreIndex,
    packet: Bytes,
) {
    let registering = instance
        .state
        .mrt
        .get(mre_idx)
        .map(|mre| mre.register_state == RegisterState::Join)
        .unwrap_or(false);
    if !registering {
        return;
    }
    send_register(instance, mre_idx, packet, false);
}

// The first packet of a flow arrived with no forwarding state
// (NOCACHE): create the (S,G) entry and start the flow's keepalive.
pub(crate) fn nocache_data_arrived(
    instance: &mut Instance,
    vif_index: VifIndex,
    source: IpAddr,
    group: IpAddr,
) {
    let af = instance.af;
    let mre_idx =
        instance
            .state
            .mrt
            .insert(af, MreType::Sg, &source, &group);
    start_keepalive(
        instance,
        mre_idx,
        Duration::from_secs(KEEPALIVE_PERIOD as u64),
    );
    upstream::update_rpf(instance, mre_idx);

    // Data arriving on the RPF interface re-examines the SPT bit.
    let on_rpf = instance
        .state
        .mrt
        .get(mre_idx)
        .map(|mre| mre.rpf_interface_s() == Some(vif_index))
        .unwrap_or(false);
    if on_rpf {
        super::spt::data_arrived_on_rpf(instance, mre_idx);
    }

    update_register_state(instance, mre_idx);
    task::entry_state_changed(instance, mre_idx);
}

// Register received (RP side).
pub(crate) fn process_register(
    instance: &mut Instance,
    src: IpAddr,
    dst: IpAddr,
    msg: &RegisterMsg,
) -> Result<(), crate::error::Error> {
    let af = instance.af;

    // The inner datagram tells us (S,G). For a Null-Register the inner
    // payload is only an IP header.
    let Some((inner_src, inner_dst)) = decode_inner_header(af, &msg.inner)
    else {
        return Ok(());
    };
    if !inner_dst.is_multicast() {
        return Ok(());
    }

    // We must be the RP for this group, and the Register must have been
    // addressed to our RP address.
    let rp_addr = instance
        .state
        .rp_table
        .rp_for_group(&inner_dst)
        .map(|rp| rp.addr);
    let i_am_rp = rp_addr
        .map(|rp_addr| {
            rp_addr == dst
                && instance
                    .state
                    .interfaces
                    .iter(&instance.arenas.interfaces)
                    .any(|iface| iface.is_my_addr(&rp_addr))
        })
        .unwrap_or(false);
    if !i_am_rp {
        return Err(crate::error::Error::RegisterNotRp(src, dst));
    }

    let mre_idx =
        instance
            .state
            .mrt
            .insert(af, MreType::Sg, &inner_src, &inner_dst);
    if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
        mre.flags.insert(MreFlags::I_AM_RP | MreFlags::KAT_SET_TO_RP_PERIOD);
        if msg.border {
            mre.pmbr_addr = Some(src);
        }
    }
    start_keepalive(
        instance,
        mre_idx,
        Duration::from_secs(RP_KEEPALIVE_PERIOD as u64),
    );
    upstream::update_rpf(instance, mre_idx);
    task::entry_state_changed(instance, mre_idx);

    // Once the shortest-path tree toward the source is up (or nobody
    // listens), the DR must stop encapsulating.
    let stop = {
        let state = &instance.state;
        let Some(mre) = state.mrt.get(mre_idx) else {
            return Ok(());
        };
        let ctx = crate::mrt::olist::OlistCtx::new(
            &state.interfaces,
            &instance.arenas.interfaces,
            state.register_vif_index,
        );
        mre.spt_bit()
            || state.mrt.inherited_olist_sg_rpt(&ctx, mre).is_empty()
    };
    if stop {
        send_register_stop(instance, src, inner_src, inner_dst);
    }
    Ok(())
}

// Register-Stop received (DR side). Returns false when no matching
// register state exists, so the caller can count the anomaly.
pub(crate) fn process_register_stop(
    instance: &mut Instance,
    msg: &RegisterStopMsg,
) -> bool {
    let group = msg.group.prefix.ip();
    let source = msg.source;
    let Some(mre_idx) = instance.state.mrt.lookup_sg(&source, &group) else {
        return false;
    };

    let state = instance
        .state
        .mrt
        .get(mre_idx)
        .map(|mre| mre.register_state);
    match state {
        Some(RegisterState::Join) | Some(RegisterState::JoinPending) => {
            // Move to Prune and probe again shortly before the RP would
            // forget us.
            let suppression = REGISTER_SUPPRESSION_TIME as f64
                * rand::rng().random_range(0.5..1.0);
            let timeout = Duration::from_secs_f64(
                (suppression - REGISTER_PROBE_TIME as f64).max(1.0),
            );
            let timer = register_stop_timer(instance, mre_idx, timeout);
            if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
                mre.register_state = RegisterState::Prune;
                mre.register_stop_timer = timer;
            }
            task::update_mfc(instance, mre_idx);
            true
        }
        _ => false,
    }
}

// Register-Stop timer fired.
pub(crate) fn register_stop_timer_expired(
    instance: &mut Instance,
    mre_idx: MreIndex,
) {
    let state = instance
        .state
        .mrt
        .get(mre_idx)
        .map(|mre| mre.register_state);
    match state {
        Some(RegisterState::Prune) => {
            // Probe the RP with a Null-Register.
            let timer = register_stop_timer(
                instance,
                mre_idx,
                Duration::from_secs(REGISTER_PROBE_TIME as u64),
            );
            if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
                mre.register_state = RegisterState::JoinPending;
                mre.register_stop_timer = timer;
            }
            send_null_register(instance, mre_idx);
        }
        Some(RegisterState::JoinPending) => {
            if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
                mre.register_state = RegisterState::Join;
                mre.register_stop_timer = None;
            }
            task::update_mfc(instance, mre_idx);
        }
        _ => (),
    }
}

// The per-flow keepalive ran out: the flow is idle.
pub(crate) fn keepalive_expired(instance: &mut Instance, mre_idx: MreIndex) {
    if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
        mre.keepalive_timer = None;
        mre.pmbr_addr = None;
        mre.flags.remove(MreFlags::KAT_SET_TO_RP_PERIOD);
    }
    update_register_state(instance, mre_idx);
    task::entry_state_changed(instance, mre_idx);
}

// (Re)starts the keepalive timer of an (S,G) entry.
pub(crate) fn start_keepalive(
    instance: &mut Instance,
    mre_idx: MreIndex,
    period: Duration,
) {
    let timer = {
        let Some(mre) = instance.state.mrt.get(mre_idx) else {
            return;
        };
        let key = mre.key();
        let Some((view, _)) = instance.as_up() else {
            return;
        };
        Some(tasks::mre_timer(
            &view,
            key,
            MreTimerKind::Keepalive,
            period,
        ))
    };
    if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
        mre.keepalive_timer = timer;
    }
}

fn register_stop_timer(
    instance: &mut Instance,
    mre_idx: MreIndex,
    timeout: Duration,
) -> Option<pim_utils::task::TimeoutTask> {
    let key = instance.state.mrt.get(mre_idx)?.key();
    let (view, _) = instance.as_up()?;
    Some(tasks::mre_timer(
        &view,
        key,
        MreTimerKind::RegisterStop,
        timeout,
    ))
}

// ===== transmission =====

// Encapsulates one datagram in a Register and unicasts it to the RP.
pub(crate) fn send_register(
    instance: &mut Instance,
    mre_idx: MreIndex,
    inner: Bytes,
    null_register: bool,
) {
    let (rp_addr, vif_index, source, group) = {
        let Some(mre) = instance.state.mrt.get(mre_idx) else {
            return;
        };
        let Some(rp_addr) = mre.rp_addr else {
            return;
        };
        // Registers leave through the interface toward the RP.
        let Some(vif_index) = mre.rpf_interface_rp() else {
            return;
        };
        (rp_addr, vif_index, mre.source, mre.group)
    };
    Debug::RegisterSend(&source, &group, &rp_addr).log();

    let packet = Packet::Register(RegisterMsg {
        border: false,
        null_register,
        inner,
    });
    send_unicast(instance, vif_index, rp_addr, packet);
}

// A Null-Register probe carries a bare IP header for (S,G).
fn send_null_register(instance: &mut Instance, mre_idx: MreIndex) {
    let Some(mre) = instance.state.mrt.get(mre_idx) else {
        return;
    };
    let inner = encode_null_inner(instance.af, &mre.source, &mre.group);
    send_register(instance, mre_idx, inner, true);
}

// Unicasts a Register-Stop to the DR at `dst_addr`.
pub(crate) fn send_register_stop(
    instance: &mut Instance,
    dst_addr: IpAddr,
    source: IpAddr,
    group: IpAddr,
) {
    Debug::RegisterStopSend(&source, &group, &dst_addr).log();

    let vif_index = instance
        .state
        .mrib
        .lookup(&dst_addr)
        .map(|mrib| mrib.vif_index);
    let Some(vif_index) = vif_index else {
        return;
    };
    let packet = Packet::RegisterStop(RegisterStopMsg {
        group: EncodedGroup::group(group),
        source,
    });
    send_unicast(instance, vif_index, dst_addr, packet);
}

fn send_unicast(
    instance: &mut Instance,
    vif_index: VifIndex,
    dst: IpAddr,
    packet: Packet,
) {
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
    iface.send_packet(&mut view, dst, packet);
}

// ===== inner-header handling =====

// Reads the source and destination addresses out of the encapsulated
// IP header.
fn decode_inner_header(
    af: pim_utils::ip::AddressFamily,
    inner: &Bytes,
) -> Option<(IpAddr, IpAddr)> {
    use pim_utils::ip::AddressFamily;
    match af {
        AddressFamily::Ipv4 => {
            if inner.len() < 20 {
                return None;
            }
            let src: [u8; 4] = inner[12..16].try_into().ok()?;
            let dst: [u8; 4] = inner[16..20].try_into().ok()?;
            Some((
                IpAddr::from(std::net::Ipv4Addr::from(src)),
                IpAddr::from(std::net::Ipv4Addr::from(dst)),
            ))
        }
        AddressFamily::Ipv6 => {
            if inner.len() < 40 {
                return None;
            }
            let src: [u8; 16] = inner[8..24].try_into().ok()?;
            let dst: [u8; 16] = inner[24..40].try_into().ok()?;
            Some((
                IpAddr::from(std::net::Ipv6Addr::from(src)),
                IpAddr::from(std::net::Ipv6Addr::from(dst)),
            ))
        }
    }
}

// Builds the dummy IP header carried by a Null-Register.
fn encode_null_inner(
    af: pim_utils::ip::AddressFamily,
    source: &IpAddr,
    group: &IpAddr,
) -> Bytes {
    use bytes::{BufMut, BytesMut};
    use pim_utils::bytes::BytesMutExt;
    use pim_utils::ip::AddressFamily;

    let mut buf = BytesMut::new();
    match af {
        AddressFamily::Ipv4 => {
            // Version/IHL, TOS, total length 20, no payload.
            buf.put_u8(0x45);
            buf.put_u8(0);
            buf.put_u16(20);
            buf.put_u32(0);
            // TTL, protocol, checksum placeholder.
            buf.put_u8(0);
            buf.put_u8(crate::consts::PIM_IP_PROTOCOL);
            buf.put_u16(0);
            buf.put_ip(source);
            buf.put_ip(group);
            let cksum = internet_checksum::checksum(&buf);
            buf[10] = cksum[0];
            buf[11] = cksum[1];
        }
        AddressFamily::Ipv6 => {
            // Version/class/flow, zero payload length.
            buf.put_u32(6 << 28);
            buf.put_u16(0);
            buf.put_u8(crate::consts::PIM_IP_PROTOCOL);
            buf.put_u8(0);
            buf.put_ip(source);
            buf.put_ip(group);
        }
    }
    buf.freeze()
}
