//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod assert;
pub mod bootstrap;
pub mod error;
pub mod hello;
pub mod join_prune;
pub mod register;

use std::net::IpAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ipnetwork::IpNetwork;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use pim_utils::bytes::{BytesExt, BytesMutExt, TLS_BUF};
use pim_utils::ip::{AddressFamily, AddressFamilyExt, IpAddrExt};
use serde::{Deserialize, Serialize};

use crate::consts::PIM_VERSION;
use crate::packet::assert::AssertMsg;
use crate::packet::bootstrap::{BootstrapMsg, CandRpAdvMsg};
use crate::packet::error::{DecodeError, DecodeResult};
use crate::packet::hello::HelloMsg;
use crate::packet::join_prune::JoinPruneMsg;
use crate::packet::register::{RegisterMsg, RegisterStopMsg};

// PIM message types.
//
// IANA registry:
// https://www.iana.org/assignments/pim-parameters
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum PacketType {
    Hello = 0,
    Register = 1,
    RegisterStop = 2,
    JoinPrune = 3,
    Bootstrap = 4,
    Assert = 5,
    Graft = 6,
    GraftAck = 7,
    CandRpAdv = 8,
}

// A PIM protocol message of any type.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum Packet {
    Hello(HelloMsg),
    Register(RegisterMsg),
    RegisterStop(RegisterStopMsg),
    JoinPrune(JoinPruneMsg),
    Bootstrap(BootstrapMsg),
    Assert(AssertMsg),
    // PIM-DM messages share the Join/Prune body grammar. They are parsed
    // and counted but carry no sparse-mode semantics.
    Graft(JoinPruneMsg),
    GraftAck(JoinPruneMsg),
    CandRpAdv(CandRpAdvMsg),
}

// An encoded group address with its flag bits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct EncodedGroup {
    pub prefix: IpNetwork,
    pub is_bidir: bool,
    pub is_scope_zone: bool,
}

const GROUP_FLAG_BIDIR: u8 = 0x80;
const GROUP_FLAG_SCOPE_ZONE: u8 = 0x01;

// Native address encoding.
const ENCODING_TYPE_NATIVE: u8 = 0;

// ===== impl PacketType =====

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketType::Hello => write!(f, "Hello"),
            PacketType::Register => write!(f, "Register"),
            PacketType::RegisterStop => write!(f, "Register-Stop"),
            PacketType::JoinPrune => write!(f, "Join/Prune"),
            PacketType::Bootstrap => write!(f, "Bootstrap"),
            PacketType::Assert => write!(f, "Assert"),
            PacketType::Graft => write!(f, "Graft"),
            PacketType::GraftAck => write!(f, "Graft-Ack"),
            PacketType::CandRpAdv => write!(f, "Candidate-RP-Advertisement"),
        }
    }
}

// ===== impl Packet =====

impl Packet {
    pub fn pkt_type(&self) -> PacketType {
        match self {
            Packet::Hello(_) => PacketType::Hello,
            Packet::Register(_) => PacketType::Register,
            Packet::RegisterStop(_) => PacketType::RegisterStop,
            Packet::JoinPrune(_) => PacketType::JoinPrune,
            Packet::Bootstrap(_) => PacketType::Bootstrap,
            Packet::Assert(_) => PacketType::Assert,
            Packet::Graft(_) => PacketType::Graft,
            Packet::GraftAck(_) => PacketType::GraftAck,
            Packet::CandRpAdv(_) => PacketType::CandRpAdv,
        }
    }

    // Encodes the message, computing the checksum.
    //
    // For IPv6 the kernel computes the checksum (it covers the
    // pseudo-header), so the field is left as zero.
    pub fn encode(&self, af: AddressFamily) -> Bytes {
        TLS_BUF.with(|buf| {
            let mut buf = buf.borrow_mut();
            buf.clear();

            buf.put_u8((PIM_VERSION << 4) | self.pkt_type() as u8);
            buf.put_u8(0);
            // Checksum placeholder.
            buf.put_u16(0);

            match self {
                Packet::Hello(msg) => msg.encode(&mut buf),
                Packet::Register(msg) => msg.encode(&mut buf),
                Packet::RegisterStop(msg) => msg.encode(&mut buf),
                Packet::JoinPrune(msg)
                | Packet::Graft(msg)
                | Packet::GraftAck(msg) => msg.encode(&mut buf),
                Packet::Bootstrap(msg) => msg.encode(&mut buf),
                Packet::Assert(msg) => msg.encode(&mut buf),
                Packet::CandRpAdv(msg) => msg.encode(&mut buf),
            }

            if af == AddressFamily::Ipv4 {
                // The Register checksum covers the first 8 octets only.
                let cksum_len = match self {
                    Packet::Register(_) => {
                        std::cmp::min(8, buf.len())
                    }
                    _ => buf.len(),
                };
                let cksum =
                    internet_checksum::checksum(&buf[0..cksum_len]);
                buf[2] = cksum[0];
                buf[3] = cksum[1];
            }

            Bytes::copy_from_slice(&buf)
        })
    }

    // Decodes a message from the wire.
    //
    // The IPv4 checksum is verified here; for IPv6 the kernel already
    // verified it together with the pseudo-header.
    pub fn decode(af: AddressFamily, data: &[u8]) -> DecodeResult<Packet> {
        if data.len() < 4 {
            return Err(DecodeError::IncompletePacket);
        }

        let version = data[0] >> 4;
        let pkt_type_raw = data[0] & 0x0f;
        let pkt_type = PacketType::from_u8(pkt_type_raw)
            .ok_or(DecodeError::UnknownPacketType(pkt_type_raw))?;
        if version != PIM_VERSION {
            return Err(DecodeError::InvalidVersion(version));
        }

        if af == AddressFamily::Ipv4 {
            let cksum_len = match pkt_type {
                PacketType::Register => std::cmp::min(8, data.len()),
                _ => data.len(),
            };
            let cksum = internet_checksum::checksum(&data[0..cksum_len]);
            if cksum != [0, 0] {
                return Err(DecodeError::InvalidChecksum);
            }
        }

        let mut buf = Bytes::copy_from_slice(&data[4..]);
        let packet = match pkt_type {
            PacketType::Hello => Packet::Hello(HelloMsg::decode(af, &mut buf)?),
            PacketType::Register => {
                Packet::Register(RegisterMsg::decode(af, &mut buf)?)
            }
            PacketType::RegisterStop => {
                Packet::RegisterStop(RegisterStopMsg::decode(af, &mut buf)?)
            }
            PacketType::JoinPrune => {
                Packet::JoinPrune(JoinPruneMsg::decode(af, &mut buf)?)
            }
            PacketType::Bootstrap => {
                Packet::Bootstrap(BootstrapMsg::decode(af, &mut buf)?)
            }
            PacketType::Assert => {
                Packet::Assert(AssertMsg::decode(af, &mut buf)?)
            }
            PacketType::Graft => {
                Packet::Graft(JoinPruneMsg::decode(af, &mut buf)?)
            }
            PacketType::GraftAck => {
                Packet::GraftAck(JoinPruneMsg::decode(af, &mut buf)?)
            }
            PacketType::CandRpAdv => {
                Packet::CandRpAdv(CandRpAdvMsg::decode(af, &mut buf)?)
            }
        };

        Ok(packet)
    }
}

// ===== encoded address helpers =====

pub(crate) fn encode_unicast_addr(buf: &mut BytesMut, addr: &IpAddr) {
    buf.put_u8(addr.address_family() as u8);
    buf.put_u8(ENCODING_TYPE_NATIVE);
    buf.put_ip(addr);
}

pub(crate) fn decode_unicast_addr(
    af: AddressFamily,
    buf: &mut Bytes,
) -> DecodeResult<IpAddr> {
    let family = buf.try_get_u8()?;
    if family != af as u8 {
        return Err(DecodeError::InvalidAddressFamily(family));
    }
    let enc_type = buf.try_get_u8()?;
    if enc_type != ENCODING_TYPE_NATIVE {
        return Err(DecodeError::InvalidEncodingType(enc_type));
    }
    Ok(buf.try_get_ip(af)?)
}

pub(crate) fn encode_group_addr(buf: &mut BytesMut, group: &EncodedGroup) {
    buf.put_u8(group.prefix.address_family() as u8);
    buf.put_u8(ENCODING_TYPE_NATIVE);
    let mut flags = 0;
    if group.is_bidir {
        flags |= GROUP_FLAG_BIDIR;
    }
    if group.is_scope_zone {
        flags |= GROUP_FLAG_SCOPE_ZONE;
    }
    buf.put_u8(flags);
    buf.put_u8(group.prefix.prefix());
    buf.put_ip(&group.prefix.ip());
}

pub(crate) fn decode_group_addr(
    af: AddressFamily,
    buf: &mut Bytes,
) -> DecodeResult<EncodedGroup> {
    let family = buf.try_get_u8()?;
    if family != af as u8 {
        return Err(DecodeError::InvalidAddressFamily(family));
    }
    let enc_type = buf.try_get_u8()?;
    if enc_type != ENCODING_TYPE_NATIVE {
        return Err(DecodeError::InvalidEncodingType(enc_type));
    }
    let flags = buf.try_get_u8()?;
    let masklen = buf.try_get_u8()?;
    if masklen > af.max_prefixlen() {
        return Err(DecodeError::InvalidMaskLength(masklen));
    }
    let addr = buf.try_get_ip(af)?;
    if !addr.is_multicast() {
        return Err(DecodeError::InvalidGroupAddress);
    }
    let prefix = IpNetwork::new(addr, masklen)
        .map_err(|_| DecodeError::InvalidMaskLength(masklen))?;
    Ok(EncodedGroup {
        prefix,
        is_bidir: flags & GROUP_FLAG_BIDIR != 0,
        is_scope_zone: flags & GROUP_FLAG_SCOPE_ZONE != 0,
    })
}

// ===== impl EncodedGroup =====

impl EncodedGroup {
    pub fn new(prefix: IpNetwork) -> EncodedGroup {
        EncodedGroup {
            prefix,
            is_bidir: false,
            is_scope_zone: false,
        }
    }

    // A single group is encoded as a host prefix.
    pub fn group(group: IpAddr) -> EncodedGroup {
        EncodedGroup::new(group.to_host_prefix())
    }
}
