//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pim_utils::ip::AddressFamily;
use serde::{Deserialize, Serialize};

use crate::packet::error::{DecodeError, DecodeResult};
use crate::packet::{decode_unicast_addr, encode_unicast_addr};

// Hello option types.
const OPT_HOLDTIME: u16 = 1;
const OPT_LAN_PRUNE_DELAY: u16 = 2;
const OPT_DR_PRIORITY: u16 = 19;
const OPT_GENID: u16 = 20;
const OPT_ADDRESS_LIST: u16 = 24;

// The T-bit shares the propagation-delay field.
const LAN_PRUNE_DELAY_T_BIT: u16 = 0x8000;

// PIM Hello message.
//
// Every option is optional on the wire; absent options revert the
// neighbor to protocol defaults.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct HelloMsg {
    pub holdtime: Option<u16>,
    pub lan_prune_delay: Option<LanPruneDelay>,
    pub dr_priority: Option<u32>,
    pub gen_id: Option<u32>,
    pub addr_list: Vec<IpAddr>,
    // Number of unknown options skipped during decoding.
    pub unknown_options: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct LanPruneDelay {
    pub t_bit: bool,
    pub propagation_delay_msec: u16,
    pub override_interval_msec: u16,
}

// ===== impl HelloMsg =====

impl HelloMsg {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        if let Some(holdtime) = self.holdtime {
            buf.put_u16(OPT_HOLDTIME);
            buf.put_u16(2);
            buf.put_u16(holdtime);
        }
        if let Some(lan_prune_delay) = &self.lan_prune_delay {
            buf.put_u16(OPT_LAN_PRUNE_DELAY);
            buf.put_u16(4);
            let mut delay =
                lan_prune_delay.propagation_delay_msec & !LAN_PRUNE_DELAY_T_BIT;
            if lan_prune_delay.t_bit {
                delay |= LAN_PRUNE_DELAY_T_BIT;
            }
            buf.put_u16(delay);
            buf.put_u16(lan_prune_delay.override_interval_msec);
        }
        if let Some(dr_priority) = self.dr_priority {
            buf.put_u16(OPT_DR_PRIORITY);
            buf.put_u16(4);
            buf.put_u32(dr_priority);
        }
        if let Some(gen_id) = self.gen_id {
            buf.put_u16(OPT_GENID);
            buf.put_u16(4);
            buf.put_u32(gen_id);
        }
        if !self.addr_list.is_empty() {
            buf.put_u16(OPT_ADDRESS_LIST);
            let addr_len = match self.addr_list[0] {
                IpAddr::V4(_) => 4,
                IpAddr::V6(_) => 16,
            };
            buf.put_u16((self.addr_list.len() * (2 + addr_len)) as u16);
            for addr in &self.addr_list {
                encode_unicast_addr(buf, addr);
            }
        }
    }

    pub(crate) fn decode(
        af: AddressFamily,
        buf: &mut Bytes,
    ) -> DecodeResult<HelloMsg> {
        let mut hello = HelloMsg::default();

        while buf.remaining() >= 4 {
            let option_type = buf.try_get_u16()?;
            let option_length = buf.try_get_u16()?;
            if buf.remaining() < option_length as usize {
                return Err(DecodeError::IncompletePacket);
            }

            match (option_type, option_length) {
                (OPT_HOLDTIME, 2) => {
                    hello.holdtime = Some(buf.try_get_u16()?);
                }
                (OPT_LAN_PRUNE_DELAY, 4) => {
                    let delay = buf.try_get_u16()?;
                    let override_interval = buf.try_get_u16()?;
                    hello.lan_prune_delay = Some(LanPruneDelay {
                        t_bit: delay & LAN_PRUNE_DELAY_T_BIT != 0,
                        propagation_delay_msec: delay & !LAN_PRUNE_DELAY_T_BIT,
                        override_interval_msec: override_interval,
                    });
                }
                (OPT_DR_PRIORITY, 4) => {
                    hello.dr_priority = Some(buf.try_get_u32()?);
                }
                (OPT_GENID, 4) => {
                    hello.gen_id = Some(buf.try_get_u32()?);
                }
                (OPT_ADDRESS_LIST, _) => {
                    let mut opt_buf =
                        buf.copy_to_bytes(option_length as usize);
                    while opt_buf.has_remaining() {
                        let addr = decode_unicast_addr(af, &mut opt_buf)?;
                        hello.addr_list.push(addr);
                    }
                }
                (
                    OPT_HOLDTIME | OPT_LAN_PRUNE_DELAY | OPT_DR_PRIORITY
                    | OPT_GENID,
                    _,
                ) => {
                    return Err(DecodeError::InvalidHelloOption {
                        option_type,
                        option_length,
                    });
                }
                _ => {
                    // Unknown options are skipped and counted.
                    buf.advance(option_length as usize);
                    hello.unknown_options += 1;
                }
            }
        }

        Ok(hello)
    }
}
