//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pim_utils::ip::AddressFamily;
use serde::{Deserialize, Serialize};

use crate::packet::error::DecodeResult;
use crate::packet::{
    EncodedGroup, decode_group_addr, decode_unicast_addr, encode_group_addr,
    encode_unicast_addr,
};

// One RP listed under a group prefix of a Bootstrap message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct BootstrapRp {
    pub addr: IpAddr,
    pub holdtime: u16,
    pub priority: u8,
}

// One group prefix block of a Bootstrap message.
//
// `rp_count` is the total number of RPs the BSR knows for this prefix;
// a fragment may carry fewer.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct BootstrapGroupPrefix {
    pub group_prefix: EncodedGroup,
    pub rp_count: u8,
    pub rps: Vec<BootstrapRp>,
}

// PIM Bootstrap message (one fragment).
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct BootstrapMsg {
    pub fragment_tag: u16,
    pub hash_mask_len: u8,
    pub bsr_priority: u8,
    pub bsr_addr: IpAddr,
    pub group_prefixes: Vec<BootstrapGroupPrefix>,
}

// PIM Candidate-RP-Advertisement message.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct CandRpAdvMsg {
    pub priority: u8,
    pub holdtime: u16,
    pub rp_addr: IpAddr,
    pub group_prefixes: Vec<EncodedGroup>,
}

// ===== impl BootstrapMsg =====

impl BootstrapMsg {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.fragment_tag);
        buf.put_u8(self.hash_mask_len);
        buf.put_u8(self.bsr_priority);
        encode_unicast_addr(buf, &self.bsr_addr);
        for group_prefix in &self.group_prefixes {
            encode_group_addr(buf, &group_prefix.group_prefix);
            buf.put_u8(group_prefix.rp_count);
            buf.put_u8(group_prefix.rps.len() as u8);
            buf.put_u16(0);
            for rp in &group_prefix.rps {
                encode_unicast_addr(buf, &rp.addr);
                buf.put_u16(rp.holdtime);
                buf.put_u8(rp.priority);
                buf.put_u8(0);
            }
        }
    }

    pub(crate) fn decode(
        af: AddressFamily,
        buf: &mut Bytes,
    ) -> DecodeResult<BootstrapMsg> {
        let fragment_tag = buf.try_get_u16()?;
        let hash_mask_len = buf.try_get_u8()?;
        let bsr_priority = buf.try_get_u8()?;
        let bsr_addr = decode_unicast_addr(af, buf)?;

        let mut group_prefixes = Vec::new();
        while buf.has_remaining() {
            let group_prefix = decode_group_addr(af, buf)?;
            let rp_count = buf.try_get_u8()?;
            let frag_rp_count = buf.try_get_u8()?;
            let _reserved = buf.try_get_u16()?;
            let mut rps = Vec::with_capacity(frag_rp_count as usize);
            for _ in 0..frag_rp_count {
                let addr = decode_unicast_addr(af, buf)?;
                let holdtime = buf.try_get_u16()?;
                let priority = buf.try_get_u8()?;
                let _reserved = buf.try_get_u8()?;
                rps.push(BootstrapRp {
                    addr,
                    holdtime,
                    priority,
                });
            }
            group_prefixes.push(BootstrapGroupPrefix {
                group_prefix,
                rp_count,
                rps,
            });
        }

        Ok(BootstrapMsg {
            fragment_tag,
            hash_mask_len,
            bsr_priority,
            bsr_addr,
            group_prefixes,
        })
    }
}

// ===== impl CandRpAdvMsg =====

impl CandRpAdvMsg {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.group_prefixes.len() as u8);
        buf.put_u8(self.priority);
        buf.put_u16(self.holdtime);
        encode_unicast_addr(buf, &self.rp_addr);
        for group_prefix in &self.group_prefixes {
            encode_group_addr(buf, group_prefix);
        }
    }

    pub(crate) fn decode(
        af: AddressFamily,
        buf: &mut Bytes,
    ) -> DecodeResult<CandRpAdvMsg> {
        let prefix_count = buf.try_get_u8()?;
        let priority = buf.try_get_u8()?;
        let holdtime = buf.try_get_u16()?;
        let rp_addr = decode_unicast_addr(af, buf)?;
        let mut group_prefixes = Vec::with_capacity(prefix_count as usize);
        for _ in 0..prefix_count {
            group_prefixes.push(decode_group_addr(af, buf)?);
        }
        Ok(CandRpAdvMsg {
            priority,
            holdtime,
            rp_addr,
            group_prefixes,
        })
    }
}
