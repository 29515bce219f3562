//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use ipnetwork::IpNetwork;
use pim_utils::bytes::{BytesExt, BytesMutExt};
use pim_utils::ip::{AddressFamily, AddressFamilyExt};
use serde::{Deserialize, Serialize};

use crate::packet::error::{DecodeError, DecodeResult};
use crate::packet::{
    EncodedGroup, decode_group_addr, decode_unicast_addr, encode_group_addr,
    encode_unicast_addr,
};

bitflags! {
    // Flag bits of an encoded source address.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct SourceFlags: u8 {
        const SPARSE = 0x04;
        const WC = 0x02;
        const RPT = 0x01;
    }
}

// The four logical entry kinds a J/P source can address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum JpEntryType {
    Rp,
    Wc,
    Sg,
    SgRpt,
}

// An encoded source address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct EncodedSource {
    pub addr: IpAddr,
    pub masklen: u8,
    pub flags: SourceFlags,
}

// One group block of a Join/Prune message.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct JoinPruneGroup {
    pub group: EncodedGroup,
    pub joins: Vec<EncodedSource>,
    pub prunes: Vec<EncodedSource>,
}

// PIM Join/Prune message. Graft and Graft-Ack share the same grammar.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct JoinPruneMsg {
    pub upstream_nbr: IpAddr,
    pub holdtime: u16,
    pub groups: Vec<JoinPruneGroup>,
}

// ===== impl EncodedSource =====

impl EncodedSource {
    pub fn new(
        addr: IpAddr,
        masklen: u8,
        flags: SourceFlags,
    ) -> EncodedSource {
        EncodedSource {
            addr,
            masklen,
            flags,
        }
    }

    // Classifies the entry this source addresses within its group block.
    //
    // A (*,*,RP) entry is a wildcard source under the multicast base
    // prefix group; a (*,G) entry carries the WC and RPT bits with a
    // concrete group.
    pub fn entry_type(&self, group: &EncodedGroup) -> JpEntryType {
        let group_is_base_prefix = match group.prefix {
            IpNetwork::V4(prefix) => prefix.prefix() == 4,
            IpNetwork::V6(prefix) => prefix.prefix() == 8,
        };
        if self.flags.contains(SourceFlags::WC | SourceFlags::RPT) {
            if group_is_base_prefix {
                JpEntryType::Rp
            } else {
                JpEntryType::Wc
            }
        } else if self.flags.contains(SourceFlags::RPT) {
            JpEntryType::SgRpt
        } else {
            JpEntryType::Sg
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.addr.address_family() as u8);
        buf.put_u8(0);
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.masklen);
        buf.put_ip(&self.addr);
    }

    fn decode(
        af: AddressFamily,
        buf: &mut Bytes,
    ) -> DecodeResult<EncodedSource> {
        let family = buf.try_get_u8()?;
        if family != af as u8 {
            return Err(DecodeError::InvalidAddressFamily(family));
        }
        let enc_type = buf.try_get_u8()?;
        if enc_type != 0 {
            return Err(DecodeError::InvalidEncodingType(enc_type));
        }
        let flags = SourceFlags::from_bits_truncate(buf.try_get_u8()?);
        let masklen = buf.try_get_u8()?;
        if masklen > af.max_prefixlen() {
            return Err(DecodeError::InvalidMaskLength(masklen));
        }
        let addr = buf.try_get_ip(af)?;
        Ok(EncodedSource {
            addr,
            masklen,
            flags,
        })
    }
}

// ===== impl JoinPruneMsg =====

impl JoinPruneMsg {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        encode_unicast_addr(buf, &self.upstream_nbr);
        buf.put_u8(0);
        buf.put_u8(self.groups.len() as u8);
        buf.put_u16(self.holdtime);
        for group in &self.groups {
            encode_group_addr(buf, &group.group);
            buf.put_u16(group.joins.len() as u16);
            buf.put_u16(group.prunes.len() as u16);
            for source in &group.joins {
                source.encode(buf);
            }
            for source in &group.prunes {
                source.encode(buf);
            }
        }
    }

    pub(crate) fn decode(
        af: AddressFamily,
        buf: &mut Bytes,
    ) -> DecodeResult<JoinPruneMsg> {
        let upstream_nbr = decode_unicast_addr(af, buf)?;
        let _reserved = buf.try_get_u8()?;
        let num_groups = buf.try_get_u8()?;
        let holdtime = buf.try_get_u16()?;

        let mut groups = Vec::with_capacity(num_groups as usize);
        for _ in 0..num_groups {
            let group = decode_group_addr(af, buf)?;
            let num_joins = buf.try_get_u16()?;
            let num_prunes = buf.try_get_u16()?;
            let mut joins = Vec::with_capacity(num_joins as usize);
            for _ in 0..num_joins {
                joins.push(EncodedSource::decode(af, buf)?);
            }
            let mut prunes = Vec::with_capacity(num_prunes as usize);
            for _ in 0..num_prunes {
                prunes.push(EncodedSource::decode(af, buf)?);
            }
            groups.push(JoinPruneGroup {
                group,
                joins,
                prunes,
            });
        }

        Ok(JoinPruneMsg {
            upstream_nbr,
            holdtime,
            groups,
        })
    }
}
