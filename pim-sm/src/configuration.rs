//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

//! Configuration data and the synchronous configuration operations.
//!
//! Every operation returns `Ok(())` or an error with a printable
//! message; none is fire-and-forget.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use pim_utils::ip::AddressFamilyExt;
use pim_utils::mfea::{MembershipMsg, MembershipOp, VifFlags};

use crate::consts::*;
use crate::debug::InterfaceInactiveReason;
use crate::error::Error;
use crate::instance::Instance;
use crate::interface::VifAddr;
use crate::rp::{Rp, RpOrigin, ScopeZoneId, default_hash_mask_len};
use crate::{bsr, events};

// Per-interface configuration.
#[derive(Clone, Debug)]
pub struct InterfaceCfg {
    pub enabled: bool,
    pub hello_period: u16,
    pub hello_holdtime: u16,
    pub triggered_hello_delay: u16,
    pub dr_priority: u32,
    pub propagation_delay_msec: u16,
    pub override_interval_msec: u16,
    pub is_tracking_support_disabled: bool,
    pub accept_nohello_neighbors: bool,
    pub join_prune_period: u16,
    pub join_prune_holdtime: u16,
    pub ip_tos: u8,
}

// Shortest-path-tree switch policy.
#[derive(Clone, Copy, Debug)]
pub struct SptSwitchCfg {
    pub enabled: bool,
    // Interval over which the byte threshold is measured.
    pub interval_sec: u16,
    pub bytes_threshold: u64,
}

// Instance-wide configuration.
#[derive(Clone, Debug)]
pub struct InstanceCfg {
    pub enabled: bool,
    pub spt_switch: SptSwitchCfg,
    // Vif whose domain-wide address sources Register messages.
    pub register_source: Option<String>,
    // Send a lowest-priority Bootstrap at shutdown.
    pub bsm_cancel_on_shutdown: bool,
    // Entry removal also requires an empty (S,G) inherited olist.
    pub strict_quiescence: bool,
    pub default_ip_tos: u8,
}

// Staged static RP configuration, applied by `config_static_rp_done`.
#[derive(Clone, Debug, Default)]
pub struct StaticRpCfg {
    pub entries: Vec<(IpNetwork, IpAddr, u8, u8)>,
}

// ===== impl InterfaceCfg =====

impl Default for InterfaceCfg {
    fn default() -> InterfaceCfg {
        InterfaceCfg {
            enabled: false,
            hello_period: HELLO_PERIOD,
            hello_holdtime: HELLO_HOLDTIME,
            triggered_hello_delay: HELLO_TRIGGERED_DELAY,
            dr_priority: DR_PRIORITY_DEFAULT,
            propagation_delay_msec: PROPAGATION_DELAY_MSEC,
            override_interval_msec: OVERRIDE_INTERVAL_MSEC,
            is_tracking_support_disabled: false,
            accept_nohello_neighbors: false,
            join_prune_period: JOIN_PRUNE_PERIOD,
            join_prune_holdtime: JOIN_PRUNE_HOLDTIME,
            ip_tos: DEFAULT_IP_TOS,
        }
    }
}

// ===== impl InstanceCfg =====

impl Default for InstanceCfg {
    fn default() -> InstanceCfg {
        InstanceCfg {
            enabled: false,
            spt_switch: SptSwitchCfg {
                enabled: false,
                interval_sec: 100,
                bytes_threshold: 0,
            },
            register_source: None,
            bsm_cancel_on_shutdown: true,
            strict_quiescence: false,
            default_ip_tos: DEFAULT_IP_TOS,
        }
    }
}

// ===== configuration operations =====

impl Instance {
    // ===== vif lifecycle =====

    pub fn add_vif(&mut self, ifname: &str) -> Result<(), Error> {
        let (_, iface) = self
            .state
            .interfaces
            .insert(&mut self.arenas.interfaces, ifname)?;
        iface.config.ip_tos = self.config.default_ip_tos;
        Ok(())
    }

    pub fn delete_vif(&mut self, ifname: &str) -> Result<(), Error> {
        let Some((iface_idx, _)) = self
            .state
            .interfaces
            .get_by_name(&self.arenas.interfaces, ifname)
        else {
            return Err(Error::InterfaceNotFound(ifname.to_owned()));
        };
        events::stop_interface(
            self,
            iface_idx,
            InterfaceInactiveReason::Deleted,
        );
        self.state
            .interfaces
            .delete(&mut self.arenas.interfaces, iface_idx);
        Ok(())
    }

    pub fn enable_vif(&mut self, ifname: &str) -> Result<(), Error> {
        self.with_vif(ifname, |iface| iface.config.enabled = true)?;
        self.update_vif(ifname)
    }

    pub fn disable_vif(&mut self, ifname: &str) -> Result<(), Error> {
        self.with_vif(ifname, |iface| iface.config.enabled = false)?;
        self.update_vif(ifname)
    }

    // Marks the vif operationally up. Used both by the system event
    // ingest and by tests driving synthesized vif events.
    pub fn start_vif(&mut self, ifname: &str) -> Result<(), Error> {
        self.with_vif(ifname, |iface| {
            iface.system.flags.insert(VifFlags::UP);
        })?;
        self.update_vif(ifname)
    }

    pub fn stop_vif(&mut self, ifname: &str) -> Result<(), Error> {
        self.with_vif(ifname, |iface| {
            iface.system.flags.remove(VifFlags::UP);
        })?;
        self.update_vif(ifname)
    }

    pub fn set_vif_flags(
        &mut self,
        ifname: &str,
        flags: VifFlags,
    ) -> Result<(), Error> {
        self.with_vif(ifname, |iface| iface.system.flags = flags)?;
        self.update_vif(ifname)
    }

    // Binds the vif to its underlying system interface.
    pub fn set_vif_pif_index(
        &mut self,
        ifname: &str,
        ifindex: u32,
    ) -> Result<(), Error> {
        let Some((iface_idx, _)) = self
            .state
            .interfaces
            .get_by_name(&self.arenas.interfaces, ifname)
        else {
            return Err(Error::InterfaceNotFound(ifname.to_owned()));
        };
        self.state.interfaces.update_ifindex(
            iface_idx,
            &mut self.arenas.interfaces[iface_idx],
            Some(ifindex),
        );
        self.update_vif(ifname)
    }

    pub fn add_vif_addr(
        &mut self,
        ifname: &str,
        addr: IpAddr,
        subnet: IpNetwork,
        broadcast: Option<IpAddr>,
        peer: Option<IpAddr>,
    ) -> Result<(), Error> {
        let af = self.af;
        self.with_vif(ifname, |iface| {
            if iface.is_my_addr(&addr) {
                return Err(Error::VifAddressExists(
                    ifname.to_owned(),
                    addr,
                ));
            }
            iface.system.addrs.push(VifAddr {
                addr,
                subnet,
                broadcast,
                peer,
            });
            iface.update_addresses(af);
            Ok(())
        })??;
        self.update_vif(ifname)
    }

    pub fn delete_vif_addr(
        &mut self,
        ifname: &str,
        addr: IpAddr,
    ) -> Result<(), Error> {
        let af = self.af;
        self.with_vif(ifname, |iface| {
            if !iface.is_my_addr(&addr) {
                return Err(Error::VifAddressNotFound(
                    ifname.to_owned(),
                    addr,
                ));
            }
            iface.system.addrs.retain(|vif_addr| vif_addr.addr != addr);
            iface.update_addresses(af);
            Ok(())
        })??;
        self.update_vif(ifname)
    }

    // ===== membership =====

    // `source` of None (or the unspecified address) means (*,G).
    pub fn add_membership(
        &mut self,
        ifname: &str,
        source: Option<IpAddr>,
        group: IpAddr,
    ) -> Result<(), Error> {
        self.membership(ifname, source, group, MembershipOp::Join)
    }

    pub fn delete_membership(
        &mut self,
        ifname: &str,
        source: Option<IpAddr>,
        group: IpAddr,
    ) -> Result<(), Error> {
        self.membership(ifname, source, group, MembershipOp::Leave)
    }

    fn membership(
        &mut self,
        ifname: &str,
        source: Option<IpAddr>,
        group: IpAddr,
        op: MembershipOp,
    ) -> Result<(), Error> {
        if !group.is_multicast() {
            return Err(Error::InvalidGroupPrefix(
                pim_utils::ip::IpAddrExt::to_host_prefix(&group),
            ));
        }
        let vif_index = self
            .state
            .interfaces
            .get_by_name(&self.arenas.interfaces, ifname)
            .map(|(_, iface)| iface.vif_index)
            .ok_or_else(|| Error::InterfaceNotFound(ifname.to_owned()))?;
        let source = source.filter(|source| !source.is_unspecified());
        events::process_membership(
            self,
            MembershipMsg {
                vif_index,
                source,
                group,
                op,
            },
        );
        Ok(())
    }

    // ===== per-vif knobs =====

    pub fn set_hello_period(
        &mut self,
        ifname: &str,
        period: u16,
    ) -> Result<(), Error> {
        self.with_vif(ifname, |iface| {
            iface.config.hello_period = period;
            iface.config.hello_holdtime = period.saturating_mul(7) / 2;
            if let Some(timer) = iface.state.hello_timer.as_mut() {
                timer.reset(Some(std::time::Duration::from_secs(
                    period as u64,
                )));
            }
        })
    }

    pub fn set_hello_holdtime(
        &mut self,
        ifname: &str,
        holdtime: u16,
    ) -> Result<(), Error> {
        self.with_vif(ifname, |iface| {
            iface.config.hello_holdtime = holdtime;
        })
    }

    pub fn set_triggered_hello_delay(
        &mut self,
        ifname: &str,
        delay: u16,
    ) -> Result<(), Error> {
        self.with_vif(ifname, |iface| {
            iface.config.triggered_hello_delay = delay;
        })
    }

    pub fn set_dr_priority(
        &mut self,
        ifname: &str,
        dr_priority: u32,
    ) -> Result<(), Error> {
        self.with_vif(ifname, |iface| {
            iface.config.dr_priority = dr_priority;
        })?;
        events::dr_update(self, ifname)
    }

    pub fn set_propagation_delay(
        &mut self,
        ifname: &str,
        delay_msec: u16,
    ) -> Result<(), Error> {
        self.with_vif(ifname, |iface| {
            iface.config.propagation_delay_msec = delay_msec;
        })
    }

    pub fn set_override_interval(
        &mut self,
        ifname: &str,
        interval_msec: u16,
    ) -> Result<(), Error> {
        self.with_vif(ifname, |iface| {
            iface.config.override_interval_msec = interval_msec;
        })
    }

    pub fn set_tracking_support_disabled(
        &mut self,
        ifname: &str,
        disabled: bool,
    ) -> Result<(), Error> {
        self.with_vif(ifname, |iface| {
            iface.config.is_tracking_support_disabled = disabled;
        })
    }

    pub fn set_accept_nohello_neighbors(
        &mut self,
        ifname: &str,
        accept: bool,
    ) -> Result<(), Error> {
        self.with_vif(ifname, |iface| {
            iface.config.accept_nohello_neighbors = accept;
        })
    }

    pub fn set_join_prune_period(
        &mut self,
        ifname: &str,
        period: u16,
    ) -> Result<(), Error> {
        self.with_vif(ifname, |iface| {
            iface.config.join_prune_period = period;
            iface.config.join_prune_holdtime =
                period.saturating_mul(7) / 2;
        })
    }

    pub fn set_join_prune_holdtime(
        &mut self,
        ifname: &str,
        holdtime: u16,
    ) -> Result<(), Error> {
        self.with_vif(ifname, |iface| {
            iface.config.join_prune_holdtime = holdtime;
        })
    }

    pub fn set_ip_tos(&mut self, ifname: &str, tos: u8) -> Result<(), Error> {
        self.with_vif(ifname, |iface| iface.config.ip_tos = tos)
    }

    // ===== instance knobs =====

    pub fn set_switch_to_spt_threshold(
        &mut self,
        enabled: bool,
        interval_sec: u16,
        bytes_threshold: u64,
    ) {
        self.config.spt_switch = SptSwitchCfg {
            enabled,
            interval_sec,
            bytes_threshold,
        };
    }

    pub fn set_register_source(&mut self, ifname: Option<String>) {
        self.config.register_source = ifname;
    }

    // ===== BSR configuration =====

    pub fn add_config_cand_bsr(
        &mut self,
        zone: ScopeZoneId,
        ifname: &str,
        priority: u8,
        hash_mask_len: Option<u8>,
    ) -> Result<(), Error> {
        let (my_vif_index, my_bsr_addr) = self
            .state
            .interfaces
            .get_by_name(&self.arenas.interfaces, ifname)
            .and_then(|(_, iface)| {
                iface
                    .state
                    .domain_wide_addr
                    .or(iface.state.primary_addr)
                    .map(|addr| (iface.vif_index, addr))
            })
            .ok_or_else(|| Error::InterfaceNotFound(ifname.to_owned()))?;
        let hash_mask_len =
            hash_mask_len.unwrap_or_else(|| default_hash_mask_len(self.af));
        bsr::add_config_cand_bsr(
            self,
            zone,
            my_vif_index,
            my_bsr_addr,
            priority,
            hash_mask_len,
        )
    }

    pub fn delete_config_cand_bsr(
        &mut self,
        zone: ScopeZoneId,
    ) -> Result<(), Error> {
        bsr::delete_config_cand_bsr(self, zone)
    }

    pub fn add_config_cand_rp(
        &mut self,
        group_prefix: IpNetwork,
        is_scope_zone: bool,
        ifname: &str,
        rp_addr: Option<IpAddr>,
        priority: u8,
        holdtime: u16,
    ) -> Result<(), Error> {
        if !group_prefix.ip().is_multicast() {
            return Err(Error::InvalidGroupPrefix(group_prefix));
        }
        let (my_vif_index, my_rp_addr) = self
            .state
            .interfaces
            .get_by_name(&self.arenas.interfaces, ifname)
            .and_then(|(_, iface)| {
                rp_addr
                    .or(iface.state.domain_wide_addr)
                    .or(iface.state.primary_addr)
                    .map(|addr| (iface.vif_index, addr))
            })
            .ok_or_else(|| Error::InterfaceNotFound(ifname.to_owned()))?;
        bsr::add_config_cand_rp(
            self,
            group_prefix,
            is_scope_zone,
            my_vif_index,
            my_rp_addr,
            priority,
            holdtime,
        )
    }

    pub fn delete_config_cand_rp(
        &mut self,
        group_prefix: IpNetwork,
        rp_addr: IpAddr,
    ) -> Result<(), Error> {
        bsr::delete_config_cand_rp(self, group_prefix, rp_addr)
    }

    // ===== static RP configuration =====

    // Static RP changes are staged and committed in one batch so that a
    // series of add/delete calls produces a single RP-change sweep.
    pub fn add_config_static_rp(
        &mut self,
        group_prefix: IpNetwork,
        rp_addr: IpAddr,
        priority: u8,
        hash_mask_len: Option<u8>,
    ) -> Result<(), Error> {
        if !group_prefix.ip().is_multicast() {
            return Err(Error::InvalidGroupPrefix(group_prefix));
        }
        if rp_addr.is_multicast() || rp_addr.is_unspecified() {
            return Err(Error::InvalidRpAddress(rp_addr));
        }
        if rp_addr.address_family() != self.af {
            return Err(Error::InvalidRpAddress(rp_addr));
        }
        let hash_mask_len =
            hash_mask_len.unwrap_or_else(|| default_hash_mask_len(self.af));
        self.staged_static_rps.entries.retain(
            |(prefix, addr, _, _)| {
                !(*prefix == group_prefix && *addr == rp_addr)
            },
        );
        self.staged_static_rps.entries.push((
            group_prefix,
            rp_addr,
            priority,
            hash_mask_len,
        ));
        Ok(())
    }

    pub fn delete_config_static_rp(
        &mut self,
        group_prefix: IpNetwork,
        rp_addr: IpAddr,
    ) -> Result<(), Error> {
        let old_len = self.staged_static_rps.entries.len();
        self.staged_static_rps.entries.retain(
            |(prefix, addr, _, _)| {
                !(*prefix == group_prefix && *addr == rp_addr)
            },
        );
        if self.staged_static_rps.entries.len() == old_len
            && !self
                .state
                .rp_table
                .get(&group_prefix)
                .map(|entry| {
                    entry.rps.iter().any(|rp| {
                        rp.addr == rp_addr && rp.origin == RpOrigin::Static
                    })
                })
                .unwrap_or(false)
        {
            return Err(Error::StaticRpNotFound(group_prefix, rp_addr));
        }
        Ok(())
    }

    // Commits the staged static RP set.
    pub fn config_static_rp_done(&mut self) -> Result<(), Error> {
        // Rebuild the static portion of the RP table from the staged set.
        let zone = self.af.multicast_base();
        self.state.rp_table.clear_origin(RpOrigin::Static, &zone);
        for (group_prefix, rp_addr, priority, hash_mask_len) in
            self.staged_static_rps.entries.clone()
        {
            self.state.rp_table.add_rp(
                group_prefix,
                hash_mask_len,
                Rp {
                    addr: rp_addr,
                    priority,
                    holdtime: 0,
                    origin: RpOrigin::Static,
                },
            );
        }
        events::rp_table_changed(self, None);
        Ok(())
    }

    // ===== helpers =====

    fn with_vif<R>(
        &mut self,
        ifname: &str,
        f: impl FnOnce(&mut crate::interface::Interface) -> R,
    ) -> Result<R, Error> {
        let Some((_, iface)) = self
            .state
            .interfaces
            .get_mut_by_name(&mut self.arenas.interfaces, ifname)
        else {
            return Err(Error::InterfaceNotFound(ifname.to_owned()));
        };
        Ok(f(iface))
    }

    fn update_vif(&mut self, ifname: &str) -> Result<(), Error> {
        events::update_interface(self, ifname)
    }
}
