//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;
use pim_utils::ip::{AddressFamily, IpAddrExt};
use pim_utils::mfea::{VifFlags, VifIndex};
use pim_utils::socket::{AsyncFd, Socket};
use pim_utils::task::{IntervalTask, Task, TimeoutTask};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedSender;

use crate::collections::{Arena, InterfaceId, Neighbors};
use crate::configuration::InterfaceCfg;
use crate::debug::{Debug, InterfaceInactiveReason};
use crate::error::{Error, IoError};
use crate::instance::InstanceUpView;
use crate::neighbor::Neighbor;
use crate::packet::hello::{HelloMsg, LanPruneDelay};
use crate::packet::{Packet, PacketType};
use crate::tasks::messages::output::NetTxPacketMsg;
use crate::{network, tasks};

// One address configured on a vif.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VifAddr {
    pub addr: IpAddr,
    pub subnet: IpNetwork,
    pub broadcast: Option<IpAddr>,
    pub peer: Option<IpAddr>,
}

// A PIM protocol instance on one virtual interface.
#[derive(Debug)]
pub struct Interface {
    pub id: InterfaceId,
    pub name: String,
    pub vif_index: VifIndex,
    pub system: InterfaceSys,
    pub config: InterfaceCfg,
    pub state: InterfaceState,
    // Neighbor lookup trees; the objects live in the instance arena.
    pub neighbors: Neighbors,
}

#[derive(Debug, Default)]
pub struct InterfaceSys {
    pub ifindex: Option<u32>,
    pub flags: VifFlags,
    pub mtu: u32,
    pub addrs: Vec<VifAddr>,
}

#[derive(Debug, Default)]
pub struct InterfaceState {
    pub active: bool,
    // Link-local unicast when available, else the first usable address.
    pub primary_addr: Option<IpAddr>,
    // Non-link-local, non-loopback unicast address.
    pub domain_wide_addr: Option<IpAddr>,
    pub dr_addr: Option<IpAddr>,
    pub gen_id: u32,
    // The next control message leaving this vif must be preceded by a
    // Hello.
    pub pending_send_hello: bool,
    pub hello_timer: Option<IntervalTask>,
    pub triggered_hello_timer: Option<TimeoutTask>,
    pub net: Option<InterfaceNet>,
    pub counters: MessageCounters,
    pub errors: ErrorCounters,
}

#[derive(Debug)]
pub struct InterfaceNet {
    pub socket: Arc<AsyncFd<Socket>>,
    _net_tx_task: Task<()>,
    _net_rx_task: Task<()>,
    pub net_tx_packetp: UnboundedSender<NetTxPacketMsg>,
}

// Per-vif message counters, indexed by message type.
#[derive(Clone, Copy, Debug, Default)]
pub struct MessageCounters {
    pub rx: [u64; 9],
    pub tx: [u64; 9],
    pub rx_errors: [u64; 9],
}

// Per-vif named error counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct ErrorCounters {
    pub unknown_type_messages: u64,
    pub unknown_version_messages: u64,
    pub bad_checksum_messages: u64,
    pub bad_length_messages: u64,
    pub bad_receive_interface_messages: u64,
    pub neighbor_unknown_messages: u64,
    pub rx_interface_disabled_messages: u64,
    pub rx_malformed_packet: u64,
    pub rx_unknown_hello_option: u64,
    pub rx_register_not_rp: u64,
    pub unknown_register_stop: u64,
    pub rx_join_prune_no_state: u64,
    pub rx_graft_graft_ack_no_state: u64,
    pub rx_graft_on_upstream_interface: u64,
    pub rx_rp_no_state: u64,
    pub rx_data_no_state: u64,
    pub rx_bsr_not_rpf_interface: u64,
    pub rx_bsr_when_bsr: u64,
    pub rx_candidate_rp_not_bsr: u64,
    pub rx_assert_from_self: u64,
    pub no_rp: u64,
    pub no_route_upstream: u64,
    pub rx_join_rp: u64,
    pub rx_prune_rp: u64,
    pub rx_join_wc: u64,
    pub rx_prune_wc: u64,
    pub rx_join_sg: u64,
    pub rx_prune_sg: u64,
    pub rx_join_sg_rpt: u64,
    pub rx_prune_sg_rpt: u64,
}

// ===== impl Interface =====

impl Interface {
    pub(crate) fn new(
        id: InterfaceId,
        name: String,
        vif_index: VifIndex,
    ) -> Interface {
        Debug::InterfaceCreate(&name).log();

        Interface {
            id,
            name,
            vif_index,
            system: InterfaceSys::default(),
            config: InterfaceCfg::default(),
            state: InterfaceState::default(),
            neighbors: Neighbors::default(),
        }
    }

    pub(crate) fn is_pim_register(&self) -> bool {
        self.system.flags.contains(VifFlags::PIM_REGISTER)
    }

    pub(crate) fn is_loopback(&self) -> bool {
        self.system.flags.contains(VifFlags::LOOPBACK)
    }

    // Starts or stops the vif to match its configured and system state.
    pub(crate) fn update(&mut self, instance: &mut InstanceUpView<'_>) {
        match self.is_ready() {
            Ok(()) if !self.state.active => {
                if let Err(error) = self.start(instance) {
                    Error::InterfaceStartError(
                        self.name.clone(),
                        Box::new(error),
                    )
                    .log();
                }
            }
            Err(reason) if self.state.active => self.stop(instance, reason),
            _ => (),
        }
    }

    fn is_ready(&self) -> Result<(), InterfaceInactiveReason> {
        if !self.config.enabled {
            return Err(InterfaceInactiveReason::AdminDown);
        }
        if !self.system.flags.contains(VifFlags::UP) {
            return Err(InterfaceInactiveReason::OperationalDown);
        }
        if !self.is_pim_register() && self.system.ifindex.is_none() {
            return Err(InterfaceInactiveReason::MissingIfindex);
        }
        if !self.is_pim_register()
            && !self.is_loopback()
            && self.state.primary_addr.is_none()
        {
            return Err(InterfaceInactiveReason::MissingPrimaryAddress);
        }
        Ok(())
    }

    fn start(&mut self, instance: &mut InstanceUpView<'_>) -> Result<(), Error> {
        Debug::InterfaceStart(&self.name).log();

        self.state.gen_id = rand::random::<u32>();

        // The Register pseudo-vif neither speaks Hello nor owns a socket.
        if !self.is_pim_register() {
            #[cfg(not(feature = "testing"))]
            {
                let ifindex = self.system.ifindex.unwrap_or(0);
                let socket =
                    network::socket(instance.af, &self.name, self.config.ip_tos)
                        .map_err(IoError::SocketError)?;
                let socket = AsyncFd::new(socket)
                    .map_err(IoError::SocketError)?;
                let socket = Arc::new(socket);
                network::join_all_pim_routers(&socket, instance.af, ifindex)?;
                self.state.net =
                    Some(InterfaceNet::new(socket, self, instance));
            }

            // First Hello goes out at a uniform random point within the
            // triggered window.
            let delay = rand::rng().random_range(
                0..=self.config.triggered_hello_delay as u64 * 1000,
            );
            self.state.triggered_hello_timer =
                Some(tasks::triggered_hello_timer(
                    self,
                    instance,
                    Duration::from_millis(delay),
                ));
            self.state.hello_timer =
                Some(tasks::hello_interval(self, instance));
            self.state.pending_send_hello = true;
        }

        self.state.active = true;
        // No neighbors are known yet, so we start as the DR.
        self.state.dr_addr = self.state.primary_addr;

        Ok(())
    }

    pub(crate) fn stop(
        &mut self,
        instance: &mut InstanceUpView<'_>,
        reason: InterfaceInactiveReason,
    ) {
        if !self.state.active {
            return;
        }

        Debug::InterfaceStop(&self.name, reason).log();

        // Tell the neighbors we are going away.
        if !self.is_pim_register() {
            let mut goodbye = self.hello_options();
            goodbye.holdtime = Some(0);
            let dst = instance.af.all_pim_routers();
            self.send_packet(instance, dst, Packet::Hello(goodbye));
        }

        self.state.hello_timer = None;
        self.state.triggered_hello_timer = None;
        self.state.net = None;
        self.state.dr_addr = None;
        self.state.pending_send_hello = false;
        self.state.active = false;
    }

    // Recomputes the primary and domain-wide addresses after an address
    // change. Returns true if the primary address changed.
    pub(crate) fn update_addresses(&mut self, af: AddressFamily) -> bool {
        let old_primary = self.state.primary_addr;

        let usable = |addr: &&VifAddr| addr.addr.is_usable();
        self.state.primary_addr = match af {
            // IPv6 PIM speaks from the link-local address.
            AddressFamily::Ipv6 => self
                .system
                .addrs
                .iter()
                .filter(usable)
                .find(|addr| addr.addr.is_unicast_link_local())
                .or_else(|| self.system.addrs.iter().find(usable))
                .map(|addr| addr.addr),
            AddressFamily::Ipv4 => self
                .system
                .addrs
                .iter()
                .filter(usable)
                .map(|addr| addr.addr)
                .next(),
        };
        self.state.domain_wide_addr = self
            .system
            .addrs
            .iter()
            .filter(usable)
            .find(|addr| !addr.addr.is_unicast_link_local())
            .map(|addr| addr.addr);

        old_primary != self.state.primary_addr
    }

    // True if the given address is one of this vif's own addresses.
    pub(crate) fn is_my_addr(&self, addr: &IpAddr) -> bool {
        self.system.addrs.iter().any(|vif_addr| vif_addr.addr == *addr)
    }

    // True if the given address lies in one of this vif's subnets.
    pub(crate) fn is_same_subnet(&self, addr: &IpAddr) -> bool {
        self.system
            .addrs
            .iter()
            .any(|vif_addr| vif_addr.subnet.contains(*addr))
            || self
                .system
                .addrs
                .iter()
                .any(|vif_addr| vif_addr.peer == Some(*addr))
    }

    // ===== DR election =====

    // Elects the Designated Router among ourselves and every neighbor.
    //
    // If any router on the link omits the DR-Priority option, the
    // election falls back to a pure address comparison.
    pub(crate) fn dr_election(
        &self,
        neighbors: &Arena<Neighbor>,
    ) -> Option<IpAddr> {
        let my_addr = self.state.primary_addr?;
        let mut candidates: Vec<(Option<u32>, IpAddr)> =
            vec![(Some(self.config.dr_priority), my_addr)];
        candidates.extend(
            self.neighbors
                .iter(neighbors)
                .map(|nbr| (nbr.dr_priority, nbr.addr)),
        );

        let priority_enabled =
            candidates.iter().all(|(priority, _)| priority.is_some());
        candidates
            .into_iter()
            .max_by_key(|(priority, addr)| {
                if priority_enabled {
                    (priority.unwrap_or(0), *addr)
                } else {
                    (0, *addr)
                }
            })
            .map(|(_, addr)| addr)
    }

    // Re-runs DR election; returns true if the DR changed.
    pub(crate) fn dr_update(
        &mut self,
        _instance: &mut InstanceUpView<'_>,
        neighbors: &Arena<Neighbor>,
    ) -> bool {
        let new_dr = self.dr_election(neighbors);
        if new_dr != self.state.dr_addr {
            Debug::DrChange(&self.name, self.state.dr_addr, new_dr).log();
            self.state.dr_addr = new_dr;
            return true;
        }
        false
    }

    pub(crate) fn i_am_dr(&self) -> bool {
        self.state.active
            && self.state.dr_addr.is_some()
            && self.state.dr_addr == self.state.primary_addr
    }

    // ===== Hello =====

    // Builds the Hello options announced on this vif.
    pub(crate) fn hello_options(&self) -> HelloMsg {
        let addr_list = self
            .system
            .addrs
            .iter()
            .map(|vif_addr| vif_addr.addr)
            .filter(|addr| Some(*addr) != self.state.primary_addr)
            .collect();

        HelloMsg {
            holdtime: Some(self.config.hello_holdtime),
            lan_prune_delay: Some(LanPruneDelay {
                t_bit: !self.config.is_tracking_support_disabled,
                propagation_delay_msec: self.config.propagation_delay_msec,
                override_interval_msec: self.config.override_interval_msec,
            }),
            dr_priority: Some(self.config.dr_priority),
            gen_id: Some(self.state.gen_id),
            addr_list,
            unknown_options: 0,
        }
    }

    pub(crate) fn send_hello(&mut self, instance: &mut InstanceUpView<'_>) {
        if self.is_pim_register() || !self.state.active {
            return;
        }
        self.state.pending_send_hello = false;
        let hello = self.hello_options();
        let dst = instance.af.all_pim_routers();
        self.send_packet(instance, dst, Packet::Hello(hello));
    }

    // ===== LAN delay negotiation =====

    // Effective propagation delay: the maximum advertised on the link
    // when every neighbor announces the option, else the local default.
    pub(crate) fn effective_propagation_delay(
        &self,
        neighbors: &Arena<Neighbor>,
    ) -> u16 {
        if !self.lan_delay_enabled(neighbors) {
            return self.config.propagation_delay_msec;
        }
        self.neighbors
            .iter(neighbors)
            .filter_map(|nbr| nbr.lan_prune_delay)
            .map(|lpd| lpd.propagation_delay_msec)
            .chain(std::iter::once(self.config.propagation_delay_msec))
            .max()
            .unwrap_or(self.config.propagation_delay_msec)
    }

    pub(crate) fn effective_override_interval(
        &self,
        neighbors: &Arena<Neighbor>,
    ) -> u16 {
        if !self.lan_delay_enabled(neighbors) {
            return self.config.override_interval_msec;
        }
        self.neighbors
            .iter(neighbors)
            .filter_map(|nbr| nbr.lan_prune_delay)
            .map(|lpd| lpd.override_interval_msec)
            .chain(std::iter::once(self.config.override_interval_msec))
            .max()
            .unwrap_or(self.config.override_interval_msec)
    }

    // LAN delay is only usable when every neighbor announces it.
    pub(crate) fn lan_delay_enabled(
        &self,
        neighbors: &Arena<Neighbor>,
    ) -> bool {
        self.neighbors
            .iter(neighbors)
            .all(|nbr| nbr.lan_prune_delay.is_some())
    }

    // Join suppression is honored unless every neighbor sets the T-bit.
    pub(crate) fn join_suppression_enabled(
        &self,
        neighbors: &Arena<Neighbor>,
    ) -> bool {
        if self.config.is_tracking_support_disabled {
            return true;
        }
        !self.lan_delay_enabled(neighbors)
            || self
                .neighbors
                .iter(neighbors)
                .any(|nbr| !nbr.is_tracking_capable())
    }

    // J/P_Override_Interval(I).
    pub(crate) fn jp_override_interval(
        &self,
        neighbors: &Arena<Neighbor>,
    ) -> Duration {
        Duration::from_millis(
            self.effective_propagation_delay(neighbors) as u64
                + self.effective_override_interval(neighbors) as u64,
        )
    }

    // t_override: random in [0, effective override interval).
    pub(crate) fn t_override(&self, neighbors: &Arena<Neighbor>) -> Duration {
        let override_msec =
            self.effective_override_interval(neighbors) as u64;
        Duration::from_millis(rand::rng().random_range(0..=override_msec))
    }

    // ===== packet transmission =====

    pub(crate) fn send_packet(
        &mut self,
        instance: &mut InstanceUpView<'_>,
        dst: IpAddr,
        packet: Packet,
    ) {
        // A triggered Hello must precede any other control message after
        // vif start or GenID change.
        if self.state.pending_send_hello
            && packet.pkt_type() != PacketType::Hello
        {
            self.send_hello(instance);
        }

        Debug::PacketTx(&self.name, &dst, &packet).log();
        self.state.counters.tx[packet.pkt_type() as usize] += 1;
        instance.state.statistics.msgs_sent[packet.pkt_type() as usize] += 1;

        let msg = NetTxPacketMsg {
            ifname: self.name.clone(),
            vif_index: self.vif_index,
            src: self.state.primary_addr,
            dst,
            ttl: network::ttl_for(packet.pkt_type(), &dst),
            router_alert: network::router_alert_for(packet.pkt_type(), &dst),
            packet,
        };

        #[cfg(not(feature = "testing"))]
        {
            if let Some(net) = &self.state.net {
                let _ = net.net_tx_packetp.send(msg);
            }
        }
        #[cfg(feature = "testing")]
        {
            instance.send_output(
                crate::tasks::messages::output::ProtocolMsg::NetTxPacket(msg),
            );
        }
    }
}

// ===== impl InterfaceNet =====

impl InterfaceNet {
    #[cfg(not(feature = "testing"))]
    pub(crate) fn new(
        socket: Arc<AsyncFd<Socket>>,
        iface: &Interface,
        instance: &mut InstanceUpView<'_>,
    ) -> Self {
        let (net_tx_packetp, net_tx_packetc) = mpsc::unbounded_channel();
        let mut net_tx_task =
            tasks::net_tx(socket.clone(), instance.af, net_tx_packetc);
        net_tx_task.detach();
        let net_rx_task = tasks::net_rx(socket.clone(), iface, instance);

        InterfaceNet {
            socket,
            _net_tx_task: net_tx_task,
            _net_rx_task: net_rx_task,
            net_tx_packetp,
        }
    }
}

// ===== impl MessageCounters =====

impl MessageCounters {
    pub(crate) fn mark_rx(&mut self, pkt_type: PacketType) {
        self.rx[pkt_type as usize] += 1;
    }

    pub(crate) fn mark_rx_error(&mut self, pkt_type: PacketType) {
        self.rx_errors[pkt_type as usize] += 1;
    }
}
