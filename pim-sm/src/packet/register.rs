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

const REGISTER_FLAG_BORDER: u32 = 0x8000_0000;
const REGISTER_FLAG_NULL: u32 = 0x4000_0000;

// PIM Register message.
//
// The inner datagram is carried opaquely; only the DR and the RP ever
// look inside it, and then only at the IP header.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct RegisterMsg {
    pub border: bool,
    pub null_register: bool,
    pub inner: Bytes,
}

// PIM Register-Stop message.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct RegisterStopMsg {
    pub group: EncodedGroup,
    pub source: IpAddr,
}

// ===== impl RegisterMsg =====

impl RegisterMsg {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        let mut flags = 0;
        if self.border {
            flags |= REGISTER_FLAG_BORDER;
        }
        if self.null_register {
            flags |= REGISTER_FLAG_NULL;
        }
        buf.put_u32(flags);
        buf.put_slice(&self.inner);
    }

    pub(crate) fn decode(
        _af: AddressFamily,
        buf: &mut Bytes,
    ) -> DecodeResult<RegisterMsg> {
        let flags = buf.try_get_u32()?;
        let inner = buf.copy_to_bytes(buf.remaining());
        Ok(RegisterMsg {
            border: flags & REGISTER_FLAG_BORDER != 0,
            null_register: flags & REGISTER_FLAG_NULL != 0,
            inner,
        })
    }
}

// ===== impl RegisterStopMsg =====

impl RegisterStopMsg {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        encode_group_addr(buf, &self.group);
        encode_unicast_addr(buf, &self.source);
    }

    pub(crate) fn decode(
        af: AddressFamily,
        buf: &mut Bytes,
    ) -> DecodeResult<RegisterStopMsg> {
        let group = decode_group_addr(af, buf)?;
        let source = decode_unicast_addr(af, buf)?;
        Ok(RegisterStopMsg { group, source })
    }
}
