//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

//! Socket plumbing for the PIM protocol: raw sockets, receive and
//! transmit loops, and per-message TTL / Router Alert policy.

use std::net::IpAddr;

#[cfg(not(feature = "testing"))]
use {
    crate::collections::InterfaceId,
    crate::error::IoError,
    crate::packet::Packet,
    crate::tasks::messages::input::NetRxPacketMsg,
    crate::tasks::messages::output::NetTxPacketMsg,
    nix::sys::socket::{self, SockaddrStorage},
    pim_utils::socket::{AsyncFd, RawSocketExt, Socket, SocketExt},
    std::io::{IoSlice, IoSliceMut},
    std::ops::Deref,
    std::os::fd::AsRawFd,
    std::sync::Arc,
    tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender},
};

use pim_utils::ip::AddressFamily;

use crate::consts::PIM_IP_PROTOCOL;
use crate::packet::PacketType;

// ===== message-level transmit policy =====

// Link-scope messages go out with TTL 1; unicast control messages with
// the maximum TTL.
pub(crate) fn ttl_for(pkt_type: PacketType, dst: &IpAddr) -> u8 {
    match pkt_type {
        PacketType::Register
        | PacketType::RegisterStop
        | PacketType::CandRpAdv => 255,
        PacketType::Bootstrap => {
            if dst.is_multicast() {
                1
            } else {
                255
            }
        }
        _ => 1,
    }
}

// Hop-by-hop messages carry the Router Alert option; unicast tunnel
// messages do not.
pub(crate) fn router_alert_for(pkt_type: PacketType, dst: &IpAddr) -> bool {
    match pkt_type {
        PacketType::Register
        | PacketType::RegisterStop
        | PacketType::CandRpAdv => false,
        PacketType::Bootstrap => dst.is_multicast(),
        _ => true,
    }
}

// ===== socket setup =====

// Creates the per-interface raw PIM socket.
#[cfg(not(feature = "testing"))]
pub(crate) fn socket(
    af: AddressFamily,
    ifname: &str,
    tos: u8,
) -> Result<Socket, std::io::Error> {
    use socket2::{Domain, Protocol, Type};

    let domain = match af {
        AddressFamily::Ipv4 => Domain::IPV4,
        AddressFamily::Ipv6 => Domain::IPV6,
    };
    let socket = Socket::new(
        domain,
        Type::RAW,
        Some(Protocol::from(PIM_IP_PROTOCOL as i32)),
    )?;
    socket.set_nonblocking(true)?;
    socket.bind_device(Some(ifname.as_bytes()))?;

    match af {
        AddressFamily::Ipv4 => {
            socket.set_ipv4_tos(tos)?;
            socket.set_ipv4_pktinfo(true)?;
            socket.set_multicast_loop_v4(false)?;
            socket.set_ipv4_ttl(1)?;
            socket.set_multicast_ttl_v4(1)?;
        }
        AddressFamily::Ipv6 => {
            socket.set_ipv6_tclass(tos)?;
            socket.set_ipv6_pktinfo(true)?;
            socket.set_multicast_loop_v6(false)?;
            // The kernel computes and verifies the PIM checksum,
            // pseudo-header included.
            socket.set_ipv6_checksum(2)?;
            socket.set_ipv6_unicast_hops(1)?;
            socket.set_ipv6_multicast_hops(1)?;
        }
    }
    Ok(socket)
}

#[cfg(not(feature = "testing"))]
pub(crate) fn join_all_pim_routers(
    socket: &Arc<AsyncFd<Socket>>,
    af: AddressFamily,
    ifindex: u32,
) -> Result<(), crate::error::Error> {
    let group = af.all_pim_routers();
    let result = match group {
        IpAddr::V4(addr) => socket
            .get_ref()
            .join_multicast_ifindex_v4(&addr, ifindex),
        IpAddr::V6(addr) => socket
            .get_ref()
            .join_multicast_ifindex_v6(&addr, ifindex),
    };
    result
        .map_err(|error| IoError::MulticastJoinError(group, error).into())
}

// ===== transmit =====

#[cfg(not(feature = "testing"))]
async fn send_packet(
    socket: &AsyncFd<Socket>,
    af: AddressFamily,
    msg: &NetTxPacketMsg,
) -> Result<usize, IoError> {
    // Per-message TTL and Router Alert policy.
    match af {
        AddressFamily::Ipv4 => {
            socket
                .get_ref()
                .set_ipv4_ttl(msg.ttl)
                .and_then(|_| socket.get_ref().set_multicast_ttl_v4(msg.ttl.into()))
                .and_then(|_| {
                    socket.get_ref().set_ipv4_router_alert(msg.router_alert)
                })
                .map_err(IoError::SendError)?;
        }
        AddressFamily::Ipv6 => {
            socket
                .get_ref()
                .set_ipv6_unicast_hops(msg.ttl)
                .and_then(|_| {
                    socket.get_ref().set_ipv6_multicast_hops(msg.ttl)
                })
                .map_err(IoError::SendError)?;
        }
    }

    let buf = msg.packet.encode(af);
    let iov = [IoSlice::new(&buf)];
    let sockaddr: SockaddrStorage =
        std::net::SocketAddr::new(msg.dst, 0).into();
    socket
        .async_io(tokio::io::Interest::WRITABLE, |socket| {
            socket::sendmsg(
                socket.as_raw_fd(),
                &iov,
                &[],
                socket::MsgFlags::empty(),
                Some(&sockaddr),
            )
            .map_err(|errno| errno.into())
        })
        .await
        .map_err(IoError::SendError)
}

#[cfg(not(feature = "testing"))]
pub(crate) async fn write_loop(
    socket: Arc<AsyncFd<Socket>>,
    af: AddressFamily,
    mut net_tx_packetc: UnboundedReceiver<NetTxPacketMsg>,
) {
    while let Some(msg) = net_tx_packetc.recv().await {
        if let Err(error) = send_packet(&socket, af, &msg).await {
            error.log();
        }
    }
}

// ===== receive =====

#[cfg(not(feature = "testing"))]
pub(crate) async fn read_loop(
    socket: Arc<AsyncFd<Socket>>,
    af: AddressFamily,
    iface_id: InterfaceId,
    net_packet_rxp: UnboundedSender<NetRxPacketMsg>,
) -> Result<(), tokio::sync::mpsc::error::SendError<NetRxPacketMsg>> {
    let mut buf = [0; 16384];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsgspace = nix::cmsg_space!(libc::in6_pktinfo);

    loop {
        match socket
            .async_io(tokio::io::Interest::READABLE, |socket| {
                match socket::recvmsg::<SockaddrStorage>(
                    socket.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsgspace),
                    socket::MsgFlags::empty(),
                ) {
                    Ok(msg) => {
                        let src = msg
                            .address
                            .as_ref()
                            .and_then(|addr| sockaddr_to_ip(af, addr));
                        let dst = msg
                            .cmsgs()
                            .ok()
                            .and_then(|cmsgs| pktinfo_dst(af, cmsgs));
                        Ok((src, dst, msg.bytes))
                    }
                    Err(errno) => Err(errno.into()),
                }
            })
            .await
        {
            Ok((src, dst, bytes)) => {
                let Some(src) = src else {
                    IoError::RecvMissingSourceAddr.log();
                    continue;
                };
                let Some(dst) = dst else {
                    IoError::RecvMissingAncillaryData.log();
                    continue;
                };

                // Raw IPv4 sockets deliver the IP header; strip it.
                let data = &iov[0].deref()[0..bytes];
                let payload = match af {
                    AddressFamily::Ipv4 => {
                        match strip_ipv4_header(data) {
                            Some(payload) => payload,
                            None => continue,
                        }
                    }
                    AddressFamily::Ipv6 => data,
                };

                tracing::trace!(%src, %dst, len = payload.len(),
                    "received protocol packet");

                let packet = Packet::decode(af, payload);
                let msg = NetRxPacketMsg {
                    iface_key: iface_id.into(),
                    src,
                    dst,
                    packet,
                };
                net_packet_rxp.send(msg)?;
            }
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {
                // Retry if the syscall was interrupted (EINTR).
                continue;
            }
            Err(error) => {
                IoError::RecvError(error).log();
            }
        }
    }
}

#[cfg(not(feature = "testing"))]
fn sockaddr_to_ip(
    af: AddressFamily,
    addr: &SockaddrStorage,
) -> Option<IpAddr> {
    match af {
        AddressFamily::Ipv4 => addr
            .as_sockaddr_in()
            .map(|sin| IpAddr::V4(sin.ip())),
        AddressFamily::Ipv6 => addr
            .as_sockaddr_in6()
            .map(|sin6| IpAddr::V6(sin6.ip())),
    }
}

#[cfg(not(feature = "testing"))]
fn pktinfo_dst(
    af: AddressFamily,
    cmsgs: socket::CmsgIterator<'_>,
) -> Option<IpAddr> {
    for cmsg in cmsgs {
        match (af, cmsg) {
            (
                AddressFamily::Ipv4,
                socket::ControlMessageOwned::Ipv4PacketInfo(pktinfo),
            ) => {
                let addr =
                    std::net::Ipv4Addr::from(u32::from_be(
                        pktinfo.ipi_addr.s_addr,
                    ));
                return Some(IpAddr::V4(addr));
            }
            (
                AddressFamily::Ipv6,
                socket::ControlMessageOwned::Ipv6PacketInfo(pktinfo),
            ) => {
                let addr =
                    std::net::Ipv6Addr::from(pktinfo.ipi6_addr.s6_addr);
                return Some(IpAddr::V6(addr));
            }
            _ => (),
        }
    }
    None
}

// Packet payload validation shared with the testing build.
#[allow(dead_code)]
pub(crate) fn strip_ipv4_header(data: &[u8]) -> Option<&[u8]> {
    if data.len() < 20 {
        return None;
    }
    let ihl = ((data[0] & 0x0f) as usize) * 4;
    data.get(ihl..)
}
