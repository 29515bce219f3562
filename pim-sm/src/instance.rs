//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

use chrono::{DateTime, Utc};
use pim_utils::ip::AddressFamily;
use pim_utils::mfea::{MfcRequestMsg, VifIndex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::bsr::Bsr;
use crate::collections::{Arena, Interfaces};
use crate::configuration::{InstanceCfg, StaticRpCfg};
use crate::debug::{Debug, InstanceInactiveReason, InterfaceInactiveReason};
use crate::error::Error;
use crate::interface::{ErrorCounters, Interface};
use crate::mrib::Mrib;
use crate::mrt::Mrt;
use crate::neighbor::Neighbor;
use crate::rp::{RpTable, ScopeZoneTable};
use crate::tasks::messages::input::{self, ProtocolMsg};
#[cfg(feature = "testing")]
use crate::tasks::messages::output;
use crate::{bsr, events, mrt, southbound};

// The root lifecycle object: one PIM-SM routing instance for one
// address family.
#[derive(Debug)]
pub struct Instance {
    pub name: String,
    pub af: AddressFamily,
    pub config: InstanceCfg,
    // Static RP config staged until `config_static_rp_done`.
    pub staged_static_rps: StaticRpCfg,
    pub state: InstanceState,
    pub arenas: InstanceArenas,
    pub tx: InstanceChannelsTx,
}

#[derive(Debug, Default)]
pub struct InstanceState {
    pub active: bool,
    // Interface lookup trees; objects live in the arenas.
    pub interfaces: Interfaces,
    pub mrt: Mrt,
    pub rp_table: RpTable,
    pub scope_zones: ScopeZoneTable,
    pub bsr: Bsr,
    pub mrib: Mrib,
    pub register_vif_index: Option<VifIndex>,
    pub statistics: Statistics,
}

// Object arenas, split from the state so that tree lookups and object
// mutation can borrow independently.
#[derive(Debug, Default)]
pub struct InstanceArenas {
    pub interfaces: Arena<Interface>,
    pub neighbors: Arena<Neighbor>,
}

#[derive(Debug)]
pub struct Statistics {
    pub discontinuity_time: DateTime<Utc>,
    pub msgs_rcvd: [u64; 9],
    pub msgs_sent: [u64; 9],
}

// Cloneable senders feeding the instance input channel set.
#[derive(Clone, Debug)]
pub struct ProtocolInputChannelsTx {
    pub net_packet_rx: UnboundedSender<input::NetRxPacketMsg>,
    pub hello_interval: UnboundedSender<input::HelloIntervalMsg>,
    pub triggered_hello: UnboundedSender<input::TriggeredHelloMsg>,
    pub nbr_timeout: UnboundedSender<input::NeighborTimeoutMsg>,
    pub mre_timer: UnboundedSender<input::MreTimerMsg>,
    pub mrt_task: UnboundedSender<input::MrtTaskRunMsg>,
    pub bsr_timer: UnboundedSender<input::BsrTimerMsg>,
    pub bsr_zone_expiry: UnboundedSender<input::BsrZoneExpiryMsg>,
    pub crp_adv: UnboundedSender<input::CandRpAdvIntervalMsg>,
    pub crp_expiry: UnboundedSender<input::CandRpExpiryMsg>,
    pub group_prefix_remove: UnboundedSender<input::GroupPrefixRemoveMsg>,
    pub mfea_upcall: UnboundedSender<pim_utils::mfea::MfeaUpcallMsg>,
    pub membership: UnboundedSender<pim_utils::mfea::MembershipMsg>,
    pub vif_event: UnboundedSender<pim_utils::mfea::VifMsg>,
    pub mrib_update: UnboundedSender<input::MribUpdateMsg>,
}

#[derive(Debug)]
pub struct ProtocolInputChannelsRx {
    pub net_packet_rx: UnboundedReceiver<input::NetRxPacketMsg>,
    pub hello_interval: UnboundedReceiver<input::HelloIntervalMsg>,
    pub triggered_hello: UnboundedReceiver<input::TriggeredHelloMsg>,
    pub nbr_timeout: UnboundedReceiver<input::NeighborTimeoutMsg>,
    pub mre_timer: UnboundedReceiver<input::MreTimerMsg>,
    pub mrt_task: UnboundedReceiver<input::MrtTaskRunMsg>,
    pub bsr_timer: UnboundedReceiver<input::BsrTimerMsg>,
    pub bsr_zone_expiry: UnboundedReceiver<input::BsrZoneExpiryMsg>,
    pub crp_adv: UnboundedReceiver<input::CandRpAdvIntervalMsg>,
    pub crp_expiry: UnboundedReceiver<input::CandRpExpiryMsg>,
    pub group_prefix_remove: UnboundedReceiver<input::GroupPrefixRemoveMsg>,
    pub mfea_upcall: UnboundedReceiver<pim_utils::mfea::MfeaUpcallMsg>,
    pub membership: UnboundedReceiver<pim_utils::mfea::MembershipMsg>,
    pub vif_event: UnboundedReceiver<pim_utils::mfea::VifMsg>,
    pub mrib_update: UnboundedReceiver<input::MribUpdateMsg>,
}

// Output channels toward the forwarder bridge and, in testing, the
// captured protocol output.
#[derive(Clone, Debug)]
pub struct InstanceChannelsTx {
    pub protocol_input: ProtocolInputChannelsTx,
    pub mfc: UnboundedSender<MfcRequestMsg>,
    #[cfg(feature = "testing")]
    pub protocol_output: UnboundedSender<output::ProtocolMsg>,
}

#[derive(Debug)]
pub struct InstanceChannelsRx {
    pub protocol_input: ProtocolInputChannelsRx,
    #[cfg(feature = "testing")]
    pub protocol_output: UnboundedReceiver<output::ProtocolMsg>,
}

// A borrowed view of the running instance, split so that the arenas can
// be borrowed independently.
pub struct InstanceUpView<'a> {
    pub name: &'a str,
    pub af: AddressFamily,
    pub config: &'a InstanceCfg,
    pub state: &'a mut InstanceState,
    pub tx: &'a InstanceChannelsTx,
}

// ===== impl Instance =====

impl Instance {
    pub fn new(
        name: String,
        af: AddressFamily,
        mfc: UnboundedSender<MfcRequestMsg>,
    ) -> (Instance, InstanceChannelsRx) {
        Debug::InstanceCreate.log();

        let (input_tx, input_rx) = protocol_input_channels();
        #[cfg(feature = "testing")]
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let instance = Instance {
            name,
            af,
            config: InstanceCfg::default(),
            staged_static_rps: StaticRpCfg::default(),
            state: InstanceState::default(),
            arenas: InstanceArenas::default(),
            tx: InstanceChannelsTx {
                protocol_input: input_tx,
                mfc,
                #[cfg(feature = "testing")]
                protocol_output: output_tx,
            },
        };
        let rx = InstanceChannelsRx {
            protocol_input: input_rx,
            #[cfg(feature = "testing")]
            protocol_output: output_rx,
        };
        (instance, rx)
    }

    // Starts the instance: creates the Register pseudo-vif and marks the
    // instance active.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.state.active {
            return Ok(());
        }
        Debug::InstanceStart.log();

        events::create_register_vif(self)?;
        self.state.active = true;
        self.state.statistics.discontinuity_time = Utc::now();

        // Bring up any vif that was configured before the start.
        let ifnames = self
            .state
            .interfaces
            .iter(&self.arenas.interfaces)
            .map(|iface| iface.name.clone())
            .collect::<Vec<_>>();
        for ifname in ifnames {
            let _ = events::update_interface(self, &ifname);
        }
        Ok(())
    }

    // Two-phase shutdown: first the goodbyes (Cand-RP-Adv holdtime 0,
    // optional Bootstrap cancel, Hello holdtime 0), then state teardown.
    pub fn stop(&mut self, reason: InstanceInactiveReason) {
        if !self.state.active {
            return;
        }
        Debug::InstanceStop(reason).log();

        // Phase 1: protocol goodbyes.
        bsr::shutdown(self);

        let iface_idxs =
            self.state.interfaces.indexes().collect::<Vec<_>>();
        for iface_idx in iface_idxs {
            events::stop_interface(
                self,
                iface_idx,
                InterfaceInactiveReason::InstanceDown,
            );
        }

        // Phase 2: finish pending deferred work, then tear down the
        // remaining state and the forwarding plane.
        mrt::task::run_all(self);
        let mre_idxs = self.state.mrt.indexes();
        for mre_idx in mre_idxs {
            mrt::task::entry_teardown(self, mre_idx);
        }
        self.state.rp_table = RpTable::default();
        self.state.bsr = Bsr::default();
        self.state.register_vif_index = None;
        self.state.active = false;
    }

    // Returns a mutable view over the running instance, or None if it
    // is not active.
    pub(crate) fn as_up(
        &mut self,
    ) -> Option<(InstanceUpView<'_>, &mut InstanceArenas)> {
        if !self.state.active {
            return None;
        }
        let view = InstanceUpView {
            name: &self.name,
            af: self.af,
            config: &self.config,
            state: &mut self.state,
            tx: &self.tx,
        };
        Some((view, &mut self.arenas))
    }

    // Processes one protocol input message.
    pub fn process_protocol_msg(&mut self, msg: ProtocolMsg) {
        let result = match msg {
            ProtocolMsg::NetRxPacket(msg) => {
                events::process_packet(self, msg)
            }
            ProtocolMsg::HelloInterval(msg) => {
                events::process_hello_interval(self, msg.iface_key)
            }
            ProtocolMsg::TriggeredHello(msg) => {
                events::process_triggered_hello(self, msg.iface_key)
            }
            ProtocolMsg::NeighborTimeout(msg) => {
                events::process_nbr_timeout(self, msg.iface_key, msg.nbr_key)
            }
            ProtocolMsg::MreTimer(msg) => {
                events::process_mre_timer(self, msg.key, msg.kind)
            }
            ProtocolMsg::MrtTaskRun(_) => {
                mrt::task::run(self);
                Ok(())
            }
            ProtocolMsg::BsrTimer(msg) => {
                bsr::process_bsr_timer(self, msg.zone)
            }
            ProtocolMsg::BsrZoneExpiry(msg) => {
                bsr::process_zone_expiry(self, msg.zone)
            }
            ProtocolMsg::CandRpAdvInterval(msg) => {
                bsr::send_cand_rp_adv(self, msg.zone)
            }
            ProtocolMsg::CandRpExpiry(msg) => bsr::process_crp_expiry(
                self,
                msg.zone,
                msg.group_prefix,
                msg.rp_addr,
            ),
            ProtocolMsg::GroupPrefixRemove(msg) => {
                bsr::process_group_prefix_remove(
                    self,
                    msg.zone,
                    msg.group_prefix,
                )
            }
            ProtocolMsg::MfeaUpcall(msg) => {
                southbound::rx::process_upcall(self, msg)
            }
            ProtocolMsg::Membership(msg) => {
                events::process_membership(self, msg);
                Ok(())
            }
            ProtocolMsg::VifEvent(msg) => {
                events::process_vif_msg(self, msg)
            }
            ProtocolMsg::MribUpdate(msg) => {
                events::process_mrib_update(self, msg);
                Ok(())
            }
        };
        if let Err(error) = result {
            error.log();
        }
    }

    // Runs the instance event loop until every input sender is gone.
    pub async fn run(mut self, mut rx: InstanceChannelsRx) {
        while let Some(msg) = rx.protocol_input.recv().await {
            self.process_protocol_msg(msg);
        }
        self.stop(InstanceInactiveReason::AdminDown);
    }

    // Sums one named error counter over every vif.
    pub fn error_counters_total(
        &self,
        get: impl Fn(&ErrorCounters) -> u64,
    ) -> u64 {
        self.state
            .interfaces
            .iter(&self.arenas.interfaces)
            .map(|iface| get(&iface.state.errors))
            .sum()
    }
}

// ===== impl InstanceUpView =====

impl InstanceUpView<'_> {
    pub(crate) fn send_mfc(&self, msg: MfcRequestMsg) {
        #[cfg(feature = "testing")]
        {
            self.send_output(output::ProtocolMsg::Mfc(msg.clone()));
        }
        let _ = self.tx.mfc.send(msg);
    }

    #[cfg(feature = "testing")]
    pub(crate) fn send_output(&self, msg: output::ProtocolMsg) {
        let _ = self.tx.protocol_output.send(msg);
    }

    // Requests a deferred-task engine poll through the event loop.
    pub(crate) fn kick_task_engine(&self) {
        let _ = self
            .tx
            .protocol_input
            .mrt_task
            .send(input::MrtTaskRunMsg {});
    }
}

// ===== impl Statistics =====

impl Default for Statistics {
    fn default() -> Statistics {
        Statistics {
            discontinuity_time: Utc::now(),
            msgs_rcvd: [0; 9],
            msgs_sent: [0; 9],
        }
    }
}

// ===== impl ProtocolInputChannelsRx =====

impl ProtocolInputChannelsRx {
    pub async fn recv(&mut self) -> Option<ProtocolMsg> {
        tokio::select! {
            msg = self.net_packet_rx.recv() => {
                msg.map(ProtocolMsg::NetRxPacket)
            }
            msg = self.hello_interval.recv() => {
                msg.map(ProtocolMsg::HelloInterval)
            }
            msg = self.triggered_hello.recv() => {
                msg.map(ProtocolMsg::TriggeredHello)
            }
            msg = self.nbr_timeout.recv() => {
                msg.map(ProtocolMsg::NeighborTimeout)
            }
            msg = self.mre_timer.recv() => {
                msg.map(ProtocolMsg::MreTimer)
            }
            msg = self.mrt_task.recv() => {
                msg.map(ProtocolMsg::MrtTaskRun)
            }
            msg = self.bsr_timer.recv() => {
                msg.map(ProtocolMsg::BsrTimer)
            }
            msg = self.bsr_zone_expiry.recv() => {
                msg.map(ProtocolMsg::BsrZoneExpiry)
            }
            msg = self.crp_adv.recv() => {
                msg.map(ProtocolMsg::CandRpAdvInterval)
            }
            msg = self.crp_expiry.recv() => {
                msg.map(ProtocolMsg::CandRpExpiry)
            }
            msg = self.group_prefix_remove.recv() => {
                msg.map(ProtocolMsg::GroupPrefixRemove)
            }
            msg = self.mfea_upcall.recv() => {
                msg.map(ProtocolMsg::MfeaUpcall)
            }
            msg = self.membership.recv() => {
                msg.map(ProtocolMsg::Membership)
            }
            msg = self.vif_event.recv() => {
                msg.map(ProtocolMsg::VifEvent)
            }
            msg = self.mrib_update.recv() => {
                msg.map(ProtocolMsg::MribUpdate)
            }
        }
    }
}

// ===== global functions =====

fn protocol_input_channels()
-> (ProtocolInputChannelsTx, ProtocolInputChannelsRx) {
    let (net_packet_rxp, net_packet_rxc) = mpsc::unbounded_channel();
    let (hello_intervalp, hello_intervalc) = mpsc::unbounded_channel();
    let (triggered_hellop, triggered_helloc) = mpsc::unbounded_channel();
    let (nbr_timeoutp, nbr_timeoutc) = mpsc::unbounded_channel();
    let (mre_timerp, mre_timerc) = mpsc::unbounded_channel();
    let (mrt_taskp, mrt_taskc) = mpsc::unbounded_channel();
    let (bsr_timerp, bsr_timerc) = mpsc::unbounded_channel();
    let (bsr_zone_expiryp, bsr_zone_expiryc) = mpsc::unbounded_channel();
    let (crp_advp, crp_advc) = mpsc::unbounded_channel();
    let (crp_expiryp, crp_expiryc) = mpsc::unbounded_channel();
    let (group_prefix_removep, group_prefix_removec) =
        mpsc::unbounded_channel();
    let (mfea_upcallp, mfea_upcallc) = mpsc::unbounded_channel();
    let (membershipp, membershipc) = mpsc::unbounded_channel();
    let (vif_eventp, vif_eventc) = mpsc::unbounded_channel();
    let (mrib_updatep, mrib_updatec) = mpsc::unbounded_channel();

    let tx = ProtocolInputChannelsTx {
        net_packet_rx: net_packet_rxp,
        hello_interval: hello_intervalp,
        triggered_hello: triggered_hellop,
        nbr_timeout: nbr_timeoutp,
        mre_timer: mre_timerp,
        mrt_task: mrt_taskp,
        bsr_timer: bsr_timerp,
        bsr_zone_expiry: bsr_zone_expiryp,
        crp_adv: crp_advp,
        crp_expiry: crp_expiryp,
        group_prefix_remove: group_prefix_removep,
        mfea_upcall: mfea_upcallp,
        membership: membershipp,
        vif_event: vif_eventp,
        mrib_update: mrib_updatep,
    };
    let rx = ProtocolInputChannelsRx {
        net_packet_rx: net_packet_rxc,
        hello_interval: hello_intervalc,
        triggered_hello: triggered_helloc,
        nbr_timeout: nbr_timeoutc,
        mre_timer: mre_timerc,
        mrt_task: mrt_taskc,
        bsr_timer: bsr_timerc,
        bsr_zone_expiry: bsr_zone_expiryc,
        crp_adv: crp_advc,
        crp_expiry: crp_expiryc,
        group_prefix_remove: group_prefix_removec,
        mfea_upcall: mfea_upcallc,
        membership: membershipc,
        vif_event: vif_eventc,
        mrib_update: mrib_updatec,
    };
    (tx, rx)
}
