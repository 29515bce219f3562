//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

use bytes::TryGetError;
use serde::{Deserialize, Serialize};

// Type aliases.
pub type DecodeResult<T> = Result<T, DecodeError>;

// PIM message decode errors.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum DecodeError {
    IncompletePacket,
    InvalidVersion(u8),
    UnknownPacketType(u8),
    InvalidChecksum,
    InvalidAddressFamily(u8),
    InvalidEncodingType(u8),
    InvalidMaskLength(u8),
    InvalidGroupAddress,
    InvalidSourceAddress,
    InvalidHelloOption { option_type: u16, option_length: u16 },
}

// ===== impl DecodeError =====

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::IncompletePacket => {
                write!(f, "truncated packet")
            }
            DecodeError::InvalidVersion(version) => {
                write!(f, "invalid protocol version: {}", version)
            }
            DecodeError::UnknownPacketType(pkt_type) => {
                write!(f, "unknown packet type: {}", pkt_type)
            }
            DecodeError::InvalidChecksum => {
                write!(f, "invalid checksum")
            }
            DecodeError::InvalidAddressFamily(family) => {
                write!(f, "invalid address family: {}", family)
            }
            DecodeError::InvalidEncodingType(enc_type) => {
                write!(f, "invalid address encoding type: {}", enc_type)
            }
            DecodeError::InvalidMaskLength(masklen) => {
                write!(f, "invalid mask length: {}", masklen)
            }
            DecodeError::InvalidGroupAddress => {
                write!(f, "invalid group address")
            }
            DecodeError::InvalidSourceAddress => {
                write!(f, "invalid source address")
            }
            DecodeError::InvalidHelloOption {
                option_type,
                option_length,
            } => {
                write!(
                    f,
                    "malformed hello option: type {} length {}",
                    option_type, option_length
                )
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<TryGetError> for DecodeError {
    fn from(_error: TryGetError) -> DecodeError {
        DecodeError::IncompletePacket
    }
}
