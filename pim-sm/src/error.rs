//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use tracing::{warn, warn_span};

use crate::collections::{InterfaceId, NeighborId};
use crate::packet::PacketType;
use crate::packet::error::DecodeError;

// PIM errors.
#[derive(Debug)]
pub enum Error {
    // I/O errors
    IoError(IoError),
    // Inter-task communication
    InterfaceIdNotFound(InterfaceId),
    NeighborIdNotFound(NeighborId),
    // Packet input
    PacketDecodeError(DecodeError),
    InvalidSrcAddr(IpAddr),
    UnknownNeighbor(String, IpAddr),
    AssertFromSelf(String, IpAddr),
    BsrNotRpfInterface(String, IpAddr),
    RegisterNotRp(IpAddr, IpAddr),
    InterfaceDisabled(String, PacketType),
    // Resource / configuration
    InterfaceExists(String),
    InterfaceNotFound(String),
    VifLimitReached(String),
    VifAddressExists(String, IpAddr),
    VifAddressNotFound(String, IpAddr),
    InvalidGroupPrefix(IpNetwork),
    InvalidRpAddress(IpAddr),
    ScopeZoneOverlap(IpNetwork, IpNetwork),
    CandBsrNotFound(IpNetwork),
    CandRpNotFound(IpNetwork, IpAddr),
    StaticRpNotFound(IpNetwork, IpAddr),
    // Fatal
    NoPrimaryAddress(String),
    RegisterVifCreation(String),
    InstanceNotActive,
    InterfaceStartError(String, Box<Error>),
}

// PIM I/O errors.
#[derive(Debug)]
pub enum IoError {
    SocketError(std::io::Error),
    MulticastJoinError(IpAddr, std::io::Error),
    MulticastLeaveError(IpAddr, std::io::Error),
    RecvError(std::io::Error),
    RecvMissingSourceAddr,
    RecvMissingAncillaryData,
    SendError(std::io::Error),
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::IoError(error) => {
                error.log();
            }
            Error::InterfaceIdNotFound(iface_id) => {
                warn!(?iface_id, "{}", self);
            }
            Error::NeighborIdNotFound(nbr_id) => {
                warn!(?nbr_id, "{}", self);
            }
            Error::PacketDecodeError(error) => {
                warn!(%error, "{}", self);
            }
            Error::InvalidSrcAddr(addr) => {
                warn!(address = %addr, "{}", self);
            }
            Error::UnknownNeighbor(ifname, addr) => {
                warn_span!("interface", name = %ifname).in_scope(|| {
                    warn!(address = %addr, "{}", self);
                });
            }
            Error::AssertFromSelf(ifname, addr)
            | Error::BsrNotRpfInterface(ifname, addr) => {
                warn_span!("interface", name = %ifname).in_scope(|| {
                    warn!(address = %addr, "{}", self);
                });
            }
            Error::RegisterNotRp(source, rp_addr) => {
                warn!(%source, %rp_addr, "{}", self);
            }
            Error::InterfaceDisabled(ifname, pkt_type) => {
                warn_span!("interface", name = %ifname).in_scope(|| {
                    warn!(%pkt_type, "{}", self);
                });
            }
            Error::InterfaceExists(ifname)
            | Error::InterfaceNotFound(ifname)
            | Error::VifLimitReached(ifname)
            | Error::NoPrimaryAddress(ifname) => {
                warn!(name = %ifname, "{}", self);
            }
            Error::VifAddressExists(ifname, addr)
            | Error::VifAddressNotFound(ifname, addr) => {
                warn!(name = %ifname, address = %addr, "{}", self);
            }
            Error::InvalidGroupPrefix(prefix) => {
                warn!(%prefix, "{}", self);
            }
            Error::InvalidRpAddress(addr) => {
                warn!(address = %addr, "{}", self);
            }
            Error::ScopeZoneOverlap(new, old) => {
                warn!(%new, %old, "{}", self);
            }
            Error::CandBsrNotFound(zone) => {
                warn!(%zone, "{}", self);
            }
            Error::CandRpNotFound(prefix, rp_addr)
            | Error::StaticRpNotFound(prefix, rp_addr) => {
                warn!(%prefix, %rp_addr, "{}", self);
            }
            Error::RegisterVifCreation(reason) => {
                warn!(%reason, "{}", self);
            }
            Error::InstanceNotActive => {
                warn!("{}", self);
            }
            Error::InterfaceStartError(ifname, error) => {
                warn!(name = %ifname, error = %with_source(error), "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(error) => error.fmt(f),
            Error::InterfaceIdNotFound(..) => {
                write!(f, "interface ID not found")
            }
            Error::NeighborIdNotFound(..) => {
                write!(f, "neighbor ID not found")
            }
            Error::PacketDecodeError(..) => {
                write!(f, "failed to decode packet")
            }
            Error::InvalidSrcAddr(..) => {
                write!(f, "invalid source address")
            }
            Error::UnknownNeighbor(..) => {
                write!(f, "message from unknown neighbor")
            }
            Error::AssertFromSelf(..) => {
                write!(f, "assert message from one of our own addresses")
            }
            Error::BsrNotRpfInterface(..) => {
                write!(f, "bootstrap message on non-RPF interface")
            }
            Error::RegisterNotRp(..) => {
                write!(f, "register message received but not the RP")
            }
            Error::InterfaceDisabled(..) => {
                write!(f, "message received on disabled interface")
            }
            Error::InterfaceExists(..) => {
                write!(f, "interface already exists")
            }
            Error::InterfaceNotFound(..) => {
                write!(f, "interface not found")
            }
            Error::VifLimitReached(..) => {
                write!(f, "out of virtual interface indexes")
            }
            Error::VifAddressExists(..) => {
                write!(f, "address already configured on interface")
            }
            Error::VifAddressNotFound(..) => {
                write!(f, "address not configured on interface")
            }
            Error::InvalidGroupPrefix(..) => {
                write!(f, "invalid multicast group prefix")
            }
            Error::InvalidRpAddress(..) => {
                write!(f, "invalid RP address")
            }
            Error::ScopeZoneOverlap(..) => {
                write!(f, "scope zone overlaps an existing zone")
            }
            Error::CandBsrNotFound(..) => {
                write!(f, "no candidate-BSR configured for zone")
            }
            Error::CandRpNotFound(..) => {
                write!(f, "no candidate-RP configured for prefix")
            }
            Error::StaticRpNotFound(..) => {
                write!(f, "no static RP configured for prefix")
            }
            Error::NoPrimaryAddress(..) => {
                write!(f, "no valid primary address on interface")
            }
            Error::RegisterVifCreation(..) => {
                write!(f, "failed to create PIM Register interface")
            }
            Error::InstanceNotActive => {
                write!(f, "instance is not active")
            }
            Error::InterfaceStartError(..) => {
                write!(f, "failed to start interface")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(error) => Some(error),
            Error::PacketDecodeError(error) => Some(error),
            Error::InterfaceStartError(_, error) => Some(error),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Error {
        Error::IoError(error)
    }
}

// ===== impl IoError =====

impl IoError {
    pub(crate) fn log(&self) {
        match self {
            IoError::SocketError(error)
            | IoError::RecvError(error)
            | IoError::SendError(error) => {
                warn!(error = %with_source(error), "{}", self);
            }
            IoError::MulticastJoinError(addr, error)
            | IoError::MulticastLeaveError(addr, error) => {
                warn!(%addr, error = %with_source(error), "{}", self);
            }
            IoError::RecvMissingSourceAddr
            | IoError::RecvMissingAncillaryData => {
                warn!("{}", self);
            }
        }
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoError::SocketError(..) => {
                write!(f, "socket error")
            }
            IoError::MulticastJoinError(..) => {
                write!(f, "failed to join multicast group")
            }
            IoError::MulticastLeaveError(..) => {
                write!(f, "failed to leave multicast group")
            }
            IoError::RecvError(..) => {
                write!(f, "failed to receive packet")
            }
            IoError::RecvMissingSourceAddr => {
                write!(f, "failed to retrieve source address from packet")
            }
            IoError::RecvMissingAncillaryData => {
                write!(f, "failed to retrieve ancillary data from packet")
            }
            IoError::SendError(..) => {
                write!(f, "failed to send packet")
            }
        }
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoError::SocketError(error)
            | IoError::MulticastJoinError(_, error)
            | IoError::MulticastLeaveError(_, error)
            | IoError::RecvError(error)
            | IoError::SendError(error) => Some(error),
            _ => None,
        }
    }
}

// ===== global functions =====

fn with_source<E: std::error::Error>(error: E) -> String {
    if let Some(source) = error.source() {
        format!("{} ({})", error, with_source(source))
    } else {
        error.to_string()
    }
}
