//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span};

use crate::bsr::BsrZoneState;
use crate::mrt::MreType;
use crate::packet::Packet;

// PIM debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    // Instance
    InstanceCreate,
    InstanceDelete,
    InstanceStart,
    InstanceStop(InstanceInactiveReason),
    // Interfaces
    InterfaceCreate(&'a str),
    InterfaceDelete(&'a str),
    InterfaceStart(&'a str),
    InterfaceStop(&'a str, InterfaceInactiveReason),
    InterfacePrimaryAddrSelect(&'a str, &'a IpAddr),
    DrChange(&'a str, Option<IpAddr>, Option<IpAddr>),
    // Neighbors
    NeighborCreate(&'a str, &'a IpAddr),
    NeighborDelete(&'a str, &'a IpAddr),
    NeighborTimeout(&'a str, &'a IpAddr),
    NeighborGenIdChange(&'a str, &'a IpAddr, u32),
    // Network
    PacketRx(&'a str, &'a IpAddr, &'a Packet),
    PacketTx(&'a str, &'a IpAddr, &'a Packet),
    // Routing entries
    MreCreate(MreType, &'a IpAddr, &'a IpAddr),
    MreDelete(MreType, &'a IpAddr, &'a IpAddr),
    UpstreamJoin(MreType, &'a IpAddr, &'a IpAddr, &'a IpAddr),
    UpstreamPrune(MreType, &'a IpAddr, &'a IpAddr, &'a IpAddr),
    // Assert
    AssertWinner(&'a IpAddr, &'a IpAddr, u16),
    AssertLoser(&'a IpAddr, &'a IpAddr, u16, &'a IpAddr),
    // Register
    RegisterSend(&'a IpAddr, &'a IpAddr, &'a IpAddr),
    RegisterStopSend(&'a IpAddr, &'a IpAddr, &'a IpAddr),
    // SPT switch
    SptSwitch(&'a IpAddr, &'a IpAddr),
    // BSR
    BsrStateChange(&'a str, BsrZoneState, BsrZoneState),
    BsrRpSetStore(&'a IpAddr, u16),
    CandRpAdvSend(&'a IpAddr, u8),
    // RP
    RpChange(&'a IpAddr, Option<IpAddr>, Option<IpAddr>),
    // Forwarding
    MfcInstall(&'a IpAddr, &'a IpAddr, u16),
    MfcDelete(&'a IpAddr, &'a IpAddr),
}

// Reason why an instance is inactive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum InstanceInactiveReason {
    AdminDown,
    MissingRegisterVif,
}

// Reason why an interface is inactive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum InterfaceInactiveReason {
    AdminDown,
    OperationalDown,
    MissingIfindex,
    MissingPrimaryAddress,
    InstanceDown,
    Deleted,
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::InstanceCreate
            | Debug::InstanceDelete
            | Debug::InstanceStart => {
                debug!("{}", self);
            }
            Debug::InstanceStop(reason) => {
                debug!(%reason, "{}", self);
            }
            Debug::InterfaceCreate(name)
            | Debug::InterfaceDelete(name)
            | Debug::InterfaceStart(name) => {
                debug_span!("interface", %name).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::InterfaceStop(name, reason) => {
                debug_span!("interface", %name).in_scope(|| {
                    debug!(%reason, "{}", self);
                });
            }
            Debug::InterfacePrimaryAddrSelect(name, addr) => {
                debug_span!("interface", %name).in_scope(|| {
                    debug!(address = %addr, "{}", self);
                });
            }
            Debug::DrChange(name, old, new) => {
                debug_span!("interface", %name).in_scope(|| {
                    debug!(?old, ?new, "{}", self);
                });
            }
            Debug::NeighborCreate(name, addr)
            | Debug::NeighborDelete(name, addr)
            | Debug::NeighborTimeout(name, addr) => {
                debug_span!("interface", %name).in_scope(|| {
                    debug!(address = %addr, "{}", self);
                });
            }
            Debug::NeighborGenIdChange(name, addr, gen_id) => {
                debug_span!("interface", %name).in_scope(|| {
                    debug!(address = %addr, %gen_id, "{}", self);
                });
            }
            Debug::PacketRx(name, src, packet) => {
                debug_span!("interface", %name).in_scope(|| {
                    debug_span!("input").in_scope(|| {
                        debug!(source = %src, ?packet, "{}", self);
                    });
                });
            }
            Debug::PacketTx(name, dst, packet) => {
                debug_span!("interface", %name).in_scope(|| {
                    debug_span!("output").in_scope(|| {
                        debug!(destination = %dst, ?packet, "{}", self);
                    });
                });
            }
            Debug::MreCreate(mre_type, source, group)
            | Debug::MreDelete(mre_type, source, group) => {
                debug!(?mre_type, %source, %group, "{}", self);
            }
            Debug::UpstreamJoin(mre_type, source, group, target)
            | Debug::UpstreamPrune(mre_type, source, group, target) => {
                debug!(?mre_type, %source, %group, %target, "{}", self);
            }
            Debug::AssertWinner(source, group, vif_index) => {
                debug!(%source, %group, %vif_index, "{}", self);
            }
            Debug::AssertLoser(source, group, vif_index, winner) => {
                debug!(%source, %group, %vif_index, %winner, "{}", self);
            }
            Debug::RegisterSend(source, group, rp_addr)
            | Debug::RegisterStopSend(source, group, rp_addr) => {
                debug!(%source, %group, rp = %rp_addr, "{}", self);
            }
            Debug::SptSwitch(source, group) => {
                debug!(%source, %group, "{}", self);
            }
            Debug::BsrStateChange(zone, old, new) => {
                debug_span!("bsr", %zone).in_scope(|| {
                    debug!(?old, ?new, "{}", self);
                });
            }
            Debug::BsrRpSetStore(bsr_addr, fragment_tag) => {
                debug!(bsr = %bsr_addr, %fragment_tag, "{}", self);
            }
            Debug::CandRpAdvSend(bsr_addr, priority) => {
                debug!(bsr = %bsr_addr, %priority, "{}", self);
            }
            Debug::RpChange(group, old, new) => {
                debug!(%group, ?old, ?new, "{}", self);
            }
            Debug::MfcInstall(source, group, iif) => {
                debug!(%source, %group, %iif, "{}", self);
            }
            Debug::MfcDelete(source, group) => {
                debug!(%source, %group, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::InstanceCreate => write!(f, "instance created"),
            Debug::InstanceDelete => write!(f, "instance deleted"),
            Debug::InstanceStart => write!(f, "starting instance"),
            Debug::InstanceStop(..) => write!(f, "stopping instance"),
            Debug::InterfaceCreate(..) => write!(f, "interface created"),
            Debug::InterfaceDelete(..) => write!(f, "interface deleted"),
            Debug::InterfaceStart(..) => write!(f, "starting interface"),
            Debug::InterfaceStop(..) => write!(f, "stopping interface"),
            Debug::InterfacePrimaryAddrSelect(..) => {
                write!(f, "primary address selected")
            }
            Debug::DrChange(..) => write!(f, "DR changed"),
            Debug::NeighborCreate(..) => write!(f, "neighbor created"),
            Debug::NeighborDelete(..) => write!(f, "neighbor deleted"),
            Debug::NeighborTimeout(..) => write!(f, "neighbor timed out"),
            Debug::NeighborGenIdChange(..) => {
                write!(f, "neighbor GenID changed")
            }
            Debug::PacketRx(..) => write!(f, "packet received"),
            Debug::PacketTx(..) => write!(f, "packet sent"),
            Debug::MreCreate(..) => write!(f, "routing entry created"),
            Debug::MreDelete(..) => write!(f, "routing entry deleted"),
            Debug::UpstreamJoin(..) => write!(f, "upstream join"),
            Debug::UpstreamPrune(..) => write!(f, "upstream prune"),
            Debug::AssertWinner(..) => write!(f, "assert winner"),
            Debug::AssertLoser(..) => write!(f, "assert loser"),
            Debug::RegisterSend(..) => write!(f, "sending register"),
            Debug::RegisterStopSend(..) => {
                write!(f, "sending register-stop")
            }
            Debug::SptSwitch(..) => {
                write!(f, "switching to shortest-path tree")
            }
            Debug::BsrStateChange(..) => write!(f, "BSR state change"),
            Debug::BsrRpSetStore(..) => write!(f, "storing RP-set"),
            Debug::CandRpAdvSend(..) => {
                write!(f, "sending candidate-RP advertisement")
            }
            Debug::RpChange(..) => write!(f, "group RP changed"),
            Debug::MfcInstall(..) => {
                write!(f, "installing forwarding entry")
            }
            Debug::MfcDelete(..) => write!(f, "deleting forwarding entry"),
        }
    }
}

// ===== impl InstanceInactiveReason =====

impl std::fmt::Display for InstanceInactiveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceInactiveReason::AdminDown => {
                write!(f, "administrative status down")
            }
            InstanceInactiveReason::MissingRegisterVif => {
                write!(f, "missing PIM Register interface")
            }
        }
    }
}

// ===== impl InterfaceInactiveReason =====

impl std::fmt::Display for InterfaceInactiveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterfaceInactiveReason::AdminDown => {
                write!(f, "administrative status down")
            }
            InterfaceInactiveReason::OperationalDown => {
                write!(f, "operational status down")
            }
            InterfaceInactiveReason::MissingIfindex => {
                write!(f, "missing ifindex")
            }
            InterfaceInactiveReason::MissingPrimaryAddress => {
                write!(f, "missing primary address")
            }
            InterfaceInactiveReason::InstanceDown => {
                write!(f, "instance down")
            }
            InterfaceInactiveReason::Deleted => {
                write!(f, "interface deleted")
            }
        }
    }
}
