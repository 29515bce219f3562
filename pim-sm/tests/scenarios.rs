//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

//! End-to-end protocol scenarios, driven through the instance's input
//! message channels. Timers are inert in this build; expiries are
//! injected as messages.

use std::net::IpAddr;

use const_addrs::ip;
use ipnetwork::IpNetwork;
use pim_sm::instance::{Instance, InstanceChannelsRx};
use pim_sm::mrt::{MreKey, MreType, RegisterState, UpstreamState};
use pim_sm::packet::hello::{HelloMsg, LanPruneDelay};
use pim_sm::packet::join_prune::{
    EncodedSource, JoinPruneGroup, JoinPruneMsg, SourceFlags,
};
use pim_sm::packet::register::{RegisterMsg, RegisterStopMsg};
use pim_sm::packet::assert::AssertMsg;
use pim_sm::packet::bootstrap::{
    BootstrapGroupPrefix, BootstrapMsg, BootstrapRp,
};
use pim_sm::packet::{EncodedGroup, Packet};
use pim_sm::rp::hash_value;
use pim_sm::tasks::messages::input::{
    BsrTimerMsg, MreTimerKind, MreTimerMsg, MribUpdateMsg, NetRxPacketMsg,
    ProtocolMsg, TriggeredHelloMsg,
};
use pim_sm::tasks::messages::output;
use pim_utils::ip::AddressFamily;
use pim_utils::mfea::{MfcRequestMsg, MfeaUpcallMsg, VifIndex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedReceiver;

const ALL_PIM_ROUTERS: &str = "224.0.0.13";

struct Test {
    instance: Instance,
    rx: InstanceChannelsRx,
    mfc_rx: UnboundedReceiver<MfcRequestMsg>,
    ifindex: u32,
}

impl Test {
    fn new() -> Test {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let (mfc_tx, mfc_rx) = mpsc::unbounded_channel();
        let (instance, rx) = Instance::new(
            "test".to_owned(),
            AddressFamily::Ipv4,
            mfc_tx,
        );
        Test {
            instance,
            rx,
            mfc_rx,
            ifindex: 10,
        }
    }

    fn add_iface(&mut self, ifname: &str, addr: &str, subnet: &str) {
        self.ifindex += 1;
        let ifindex = self.ifindex;
        self.instance.add_vif(ifname).unwrap();
        self.instance.set_vif_pif_index(ifname, ifindex).unwrap();
        self.instance
            .add_vif_addr(
                ifname,
                addr.parse().unwrap(),
                subnet.parse().unwrap(),
                None,
                None,
            )
            .unwrap();
        self.instance.enable_vif(ifname).unwrap();
        self.instance.start_vif(ifname).unwrap();
        self.drain();
    }

    fn start(&mut self) {
        self.instance.start().unwrap();
        self.drain();
    }

    // Runs the deferred task engine until it goes idle.
    fn drain(&mut self) {
        while let Ok(msg) = self.rx.protocol_input.mrt_task.try_recv() {
            self.instance
                .process_protocol_msg(ProtocolMsg::MrtTaskRun(msg));
        }
    }

    fn add_mrib_entry(
        &mut self,
        prefix: &str,
        nexthop: &str,
        vif_index: VifIndex,
    ) {
        self.instance.process_protocol_msg(ProtocolMsg::MribUpdate(
            MribUpdateMsg {
                replace: false,
                add: vec![pim_sm::mrib::MribEntry {
                    prefix: prefix.parse().unwrap(),
                    nexthop_addr: nexthop.parse().unwrap(),
                    vif_index,
                    metric_preference: 100,
                    metric: 10,
                }],
                remove: vec![],
            },
        ));
        self.drain();
    }

    fn rx_packet(&mut self, ifname: &str, src: &str, dst: &str, packet: Packet) {
        self.instance.process_protocol_msg(ProtocolMsg::NetRxPacket(
            NetRxPacketMsg {
                iface_key: pim_sm::collections::ObjectKey::Value(
                    ifname.to_owned(),
                ),
                src: src.parse().unwrap(),
                dst: dst.parse().unwrap(),
                packet: Ok(packet),
            },
        ));
        self.drain();
    }

    fn fire_mre_timer(&mut self, key: MreKey, kind: MreTimerKind) {
        self.instance
            .process_protocol_msg(ProtocolMsg::MreTimer(MreTimerMsg {
                key,
                kind,
            }));
        self.drain();
    }

    fn vif_index(&self, ifname: &str) -> VifIndex {
        let (_, iface) = self
            .instance
            .state
            .interfaces
            .get_by_name(&self.instance.arenas.interfaces, ifname)
            .unwrap();
        iface.vif_index
    }

    // Drains and returns every transmitted protocol packet.
    fn tx_packets(&mut self) -> Vec<(String, IpAddr, Packet)> {
        let mut packets = Vec::new();
        while let Ok(msg) = self.rx.protocol_output.try_recv() {
            if let output::ProtocolMsg::NetTxPacket(msg) = msg {
                packets.push((msg.ifname, msg.dst, msg.packet));
            }
        }
        packets
    }

    fn mfc_requests(&mut self) -> Vec<MfcRequestMsg> {
        let mut requests = Vec::new();
        while let Ok(msg) = self.mfc_rx.try_recv() {
            requests.push(msg);
        }
        requests
    }
}

fn hello(holdtime: u16, dr_priority: u32, gen_id: u32) -> Packet {
    Packet::Hello(HelloMsg {
        holdtime: Some(holdtime),
        lan_prune_delay: Some(LanPruneDelay {
            t_bit: false,
            propagation_delay_msec: 500,
            override_interval_msec: 2500,
        }),
        dr_priority: Some(dr_priority),
        gen_id: Some(gen_id),
        addr_list: vec![],
        unknown_options: 0,
    })
}

fn join_prune(
    upstream_nbr: &str,
    holdtime: u16,
    group: &str,
    source: &str,
    flags: SourceFlags,
    is_join: bool,
) -> Packet {
    let source = EncodedSource::new(source.parse().unwrap(), 32, flags);
    let group_prefix: IpNetwork =
        format!("{}/32", group).parse().unwrap();
    Packet::JoinPrune(JoinPruneMsg {
        upstream_nbr: upstream_nbr.parse().unwrap(),
        holdtime,
        groups: vec![JoinPruneGroup {
            group: EncodedGroup::new(group_prefix),
            joins: if is_join { vec![source] } else { vec![] },
            prunes: if is_join { vec![] } else { vec![source] },
        }],
    })
}

const WC_FLAGS: SourceFlags = SourceFlags::SPARSE
    .union(SourceFlags::WC)
    .union(SourceFlags::RPT);

// ===== scenarios =====

// A Hello establishes the neighbor and re-runs the DR election; the
// triggered Hello carries our own options.
#[test]
fn hello_establishes_neighbor_and_dr() {
    let mut t = Test::new();
    t.add_iface("eth0", "10.0.0.1", "10.0.0.0/30");
    t.start();
    let _ = t.tx_packets();

    t.rx_packet(
        "eth0",
        "10.0.0.2",
        ALL_PIM_ROUTERS,
        hello(105, 200, 0xdeadbeef),
    );

    let (_, iface) = t
        .instance
        .state
        .interfaces
        .get_by_name(&t.instance.arenas.interfaces, "eth0")
        .unwrap();
    let (_, nbr) = iface
        .neighbors
        .get_by_addr(&t.instance.arenas.neighbors, &ip!("10.0.0.2"))
        .expect("neighbor not created");
    assert_eq!(nbr.gen_id, Some(0xdeadbeef));
    assert_eq!(nbr.dr_priority, Some(200));
    assert!(nbr.liveness_timer.is_some());

    // Local DR priority is 1, so the neighbor wins.
    assert_eq!(iface.state.dr_addr, Some(ip!("10.0.0.2")));

    // Drive the triggered Hello and inspect our announced options.
    t.instance.process_protocol_msg(ProtocolMsg::TriggeredHello(
        TriggeredHelloMsg {
            iface_key: pim_sm::collections::ObjectKey::Value(
                "eth0".to_owned(),
            ),
        },
    ));
    let packets = t.tx_packets();
    let hello_out = packets
        .iter()
        .find_map(|(_, _, packet)| match packet {
            Packet::Hello(hello) => Some(hello),
            _ => None,
        })
        .expect("no triggered hello sent");
    assert_eq!(hello_out.holdtime, Some(105));
    assert_eq!(hello_out.dr_priority, Some(1));
    assert!(hello_out.gen_id.is_some());
}

// A higher local DR priority wins the election.
#[test]
fn dr_election_priority_wins() {
    let mut t = Test::new();
    t.add_iface("eth0", "10.0.0.1", "10.0.0.0/30");
    t.start();
    t.instance.set_dr_priority("eth0", 1000).unwrap();
    t.rx_packet(
        "eth0",
        "10.0.0.2",
        ALL_PIM_ROUTERS,
        hello(105, 200, 0x1111),
    );

    let (_, iface) = t
        .instance
        .state
        .interfaces
        .get_by_name(&t.instance.arenas.interfaces, "eth0")
        .unwrap();
    assert_eq!(iface.state.dr_addr, Some(ip!("10.0.0.1")));
}

// Hello holdtime boundaries: 0xffff never expires, zero tears down.
#[test]
fn hello_holdtime_boundaries() {
    let mut t = Test::new();
    t.add_iface("eth0", "10.0.0.1", "10.0.0.0/30");
    t.start();

    t.rx_packet(
        "eth0",
        "10.0.0.2",
        ALL_PIM_ROUTERS,
        hello(0xffff, 200, 0x1),
    );
    {
        let (_, iface) = t
            .instance
            .state
            .interfaces
            .get_by_name(&t.instance.arenas.interfaces, "eth0")
            .unwrap();
        let (_, nbr) = iface
            .neighbors
            .get_by_addr(&t.instance.arenas.neighbors, &ip!("10.0.0.2"))
            .unwrap();
        // Holdtime "forever" leaves the liveness timer unarmed.
        assert!(nbr.liveness_timer.is_none());
    }

    t.rx_packet("eth0", "10.0.0.2", ALL_PIM_ROUTERS, hello(0, 200, 0x1));
    let (_, iface) = t
        .instance
        .state
        .interfaces
        .get_by_name(&t.instance.arenas.interfaces, "eth0")
        .unwrap();
    assert!(
        iface
            .neighbors
            .get_by_addr(&t.instance.arenas.neighbors, &ip!("10.0.0.2"))
            .is_none()
    );
}

// Static RP add/delete round-trip leaves the RP table unchanged.
#[test]
fn static_rp_roundtrip() {
    let mut t = Test::new();
    t.add_iface("eth0", "10.0.0.1", "10.0.0.0/30");
    t.start();

    let prefix: IpNetwork = "224.0.0.0/4".parse().unwrap();
    t.instance
        .add_config_static_rp(prefix, ip!("10.1.1.1"), 1, None)
        .unwrap();
    t.instance.config_static_rp_done().unwrap();
    t.drain();
    assert!(
        t.instance
            .state
            .rp_table
            .rp_for_group(&ip!("239.1.2.3"))
            .is_some()
    );

    t.instance
        .delete_config_static_rp(prefix, ip!("10.1.1.1"))
        .unwrap();
    t.instance.config_static_rp_done().unwrap();
    t.drain();
    assert!(
        t.instance
            .state
            .rp_table
            .rp_for_group(&ip!("239.1.2.3"))
            .is_none()
    );
    assert!(t.instance.state.rp_table.is_empty());
}

// The hash election matches the reference computation and every entry
// keeps its RP pointer synchronized with the table.
#[test]
fn rp_hash_election() {
    let mut t = Test::new();
    t.add_iface("eth0", "10.0.0.1", "10.0.0.0/30");
    t.start();

    let prefix: IpNetwork = "224.0.0.0/4".parse().unwrap();
    t.instance
        .add_config_static_rp(prefix, ip!("10.1.1.1"), 1, Some(30))
        .unwrap();
    t.instance
        .add_config_static_rp(prefix, ip!("10.1.1.2"), 1, Some(30))
        .unwrap();
    t.instance.config_static_rp_done().unwrap();
    t.drain();

    let group = ip!("239.1.2.3");
    let h1 = hash_value(&group, &ip!("10.1.1.1"), 30);
    let h2 = hash_value(&group, &ip!("10.1.1.2"), 30);
    let expected = if h1 > h2 {
        ip!("10.1.1.1")
    } else {
        ip!("10.1.1.2")
    };
    assert_eq!(
        t.instance.state.rp_table.rp_for_group(&group).unwrap().addr,
        expected
    );

    // An entry for the group elects the same RP (invariant I1).
    t.instance
        .add_membership("eth0", None, group)
        .unwrap();
    t.drain();
    let mre_idx = t.instance.state.mrt.lookup_wc(&group).unwrap();
    let mre = t.instance.state.mrt.get(mre_idx).unwrap();
    assert_eq!(mre.rp_addr, Some(expected));
}

// Downstream Join/Prune timeout: Join state expires back to NoInfo and
// the upstream state follows.
#[test]
fn downstream_join_timeout() {
    let mut t = Test::new();
    t.add_iface("eth0", "10.0.0.1", "10.0.0.0/30");
    t.start();
    t.instance
        .add_config_static_rp(
            "224.0.0.0/4".parse().unwrap(),
            ip!("10.1.1.1"),
            1,
            None,
        )
        .unwrap();
    t.instance.config_static_rp_done().unwrap();
    t.add_mrib_entry("10.0.0.0/8", "10.0.0.2", 0);
    t.rx_packet("eth0", "10.0.0.2", ALL_PIM_ROUTERS, hello(105, 200, 0x1));
    let _ = t.tx_packets();

    // Downstream (*,G) join addressed to us.
    let group = "239.9.9.9";
    t.rx_packet(
        "eth0",
        "10.0.0.2",
        ALL_PIM_ROUTERS,
        join_prune("10.0.0.1", 210, group, "10.1.1.1", WC_FLAGS, true),
    );

    let vif_index = t.vif_index("eth0");
    let group_addr: IpAddr = group.parse().unwrap();
    let mre_idx = t.instance.state.mrt.lookup_wc(&group_addr).unwrap();
    {
        let mre = t.instance.state.mrt.get(mre_idx).unwrap();
        assert!(mre.downstream.join.contains(vif_index));
        // Upstream went Joined toward RPF'(*,G) = 10.0.0.2.
        assert_eq!(mre.upstream_state, UpstreamState::Joined);
        assert_eq!(mre.rpfp_nbr_wc, Some(ip!("10.0.0.2")));
    }
    let packets = t.tx_packets();
    assert!(packets.iter().any(|(_, _, packet)| matches!(
        packet,
        Packet::JoinPrune(jp)
            if jp.groups.iter().any(|g| !g.joins.is_empty())
    )));

    // Expiry with no refresh: Join -> NoInfo, upstream prunes.
    let key = MreKey {
        source: "0.0.0.0".parse().unwrap(),
        group: group_addr,
        mre_type: MreType::Wc,
    };
    t.fire_mre_timer(key, MreTimerKind::DownstreamExpiry(vif_index));

    if let Some(mre_idx) = t.instance.state.mrt.lookup_wc(&group_addr) {
        let mre = t.instance.state.mrt.get(mre_idx).unwrap();
        assert!(!mre.downstream.join.contains(vif_index));
        assert_eq!(mre.upstream_state, UpstreamState::NoInfo);
    }
    let packets = t.tx_packets();
    assert!(packets.iter().any(|(_, _, packet)| matches!(
        packet,
        Packet::JoinPrune(jp)
            if jp.groups.iter().any(|g| !g.prunes.is_empty())
    )));
}

// A Join with holdtime zero prunes a joined interface and is a no-op on
// a clean one.
#[test]
fn join_prune_holdtime_zero() {
    let mut t = Test::new();
    t.add_iface("eth0", "10.0.0.1", "10.0.0.0/30");
    t.start();
    t.instance
        .add_config_static_rp(
            "224.0.0.0/4".parse().unwrap(),
            ip!("10.1.1.1"),
            1,
            None,
        )
        .unwrap();
    t.instance.config_static_rp_done().unwrap();
    t.rx_packet("eth0", "10.0.0.2", ALL_PIM_ROUTERS, hello(105, 200, 0x1));

    let group = "239.9.9.9";
    let group_addr: IpAddr = group.parse().unwrap();
    let vif_index = t.vif_index("eth0");

    // Holdtime zero at a clean interface: no state is created.
    t.rx_packet(
        "eth0",
        "10.0.0.2",
        ALL_PIM_ROUTERS,
        join_prune("10.0.0.1", 0, group, "10.1.1.1", WC_FLAGS, true),
    );
    if let Some(mre_idx) = t.instance.state.mrt.lookup_wc(&group_addr) {
        let mre = t.instance.state.mrt.get(mre_idx).unwrap();
        assert!(!mre.downstream.join.contains(vif_index));
    }

    // Join, then a holdtime-zero join acts as a prune.
    t.rx_packet(
        "eth0",
        "10.0.0.2",
        ALL_PIM_ROUTERS,
        join_prune("10.0.0.1", 210, group, "10.1.1.1", WC_FLAGS, true),
    );
    t.rx_packet(
        "eth0",
        "10.0.0.2",
        ALL_PIM_ROUTERS,
        join_prune("10.0.0.1", 0, group, "10.1.1.1", WC_FLAGS, true),
    );
    let mre_idx = t.instance.state.mrt.lookup_wc(&group_addr).unwrap();
    let mre = t.instance.state.mrt.get(mre_idx).unwrap();
    assert!(!mre.downstream.join.contains(vif_index));
}

// BSR election with preemption: Pending -> Elected -> preempted to
// Candidate by a better BSR, whose RP-set is stored.
#[test]
fn bsr_election_with_preemption() {
    let mut t = Test::new();
    t.add_iface("eth0", "10.0.0.1", "10.0.0.0/30");
    t.start();
    t.add_mrib_entry("10.0.0.0/8", "10.0.0.2", 0);
    t.rx_packet("eth0", "10.0.0.2", ALL_PIM_ROUTERS, hello(105, 200, 0x1));
    let _ = t.tx_packets();

    let zone = pim_sm::rp::ScopeZoneId::global(AddressFamily::Ipv4);
    t.instance
        .add_config_cand_bsr(zone, "eth0", 100, None)
        .unwrap();
    assert_eq!(
        t.instance.state.bsr.config_zones[0].state,
        pim_sm::bsr::BsrZoneState::PendingBsr
    );

    // The bootstrap timer fires: we become the elected BSR and
    // originate a Bootstrap.
    t.instance
        .process_protocol_msg(ProtocolMsg::BsrTimer(BsrTimerMsg { zone }));
    t.drain();
    assert_eq!(
        t.instance.state.bsr.config_zones[0].state,
        pim_sm::bsr::BsrZoneState::ElectedBsr
    );
    let packets = t.tx_packets();
    assert!(packets.iter().any(|(_, _, packet)| matches!(
        packet,
        Packet::Bootstrap(_)
    )));

    // A better BSR preempts us and its RP-set takes effect.
    let bsm = Packet::Bootstrap(BootstrapMsg {
        fragment_tag: 0x1234,
        hash_mask_len: 30,
        bsr_priority: 150,
        bsr_addr: ip!("10.0.0.2"),
        group_prefixes: vec![BootstrapGroupPrefix {
            group_prefix: EncodedGroup::new("239.0.0.0/8".parse().unwrap()),
            rp_count: 1,
            rps: vec![BootstrapRp {
                addr: ip!("10.9.9.9"),
                holdtime: 150,
                priority: 10,
            }],
        }],
    });
    t.rx_packet("eth0", "10.0.0.2", ALL_PIM_ROUTERS, bsm.clone());
    assert_eq!(
        t.instance.state.bsr.config_zones[0].state,
        pim_sm::bsr::BsrZoneState::CandidateBsr
    );
    assert_eq!(
        t.instance
            .state
            .rp_table
            .rp_for_group(&ip!("239.1.1.1"))
            .map(|rp| rp.addr),
        Some(ip!("10.9.9.9"))
    );
    let _ = t.tx_packets();

    // Re-applying the same Bootstrap is a no-op on the RP set and the
    // zone state.
    t.rx_packet("eth0", "10.0.0.2", ALL_PIM_ROUTERS, bsm);
    assert_eq!(
        t.instance.state.bsr.config_zones[0].state,
        pim_sm::bsr::BsrZoneState::CandidateBsr
    );
    assert_eq!(
        t.instance
            .state
            .rp_table
            .rp_for_group(&ip!("239.1.1.1"))
            .map(|rp| rp.addr),
        Some(ip!("10.9.9.9"))
    );
}

// Register life cycle at the DR: NOCACHE starts the register machine,
// WHOLEPKT produces the encapsulation, a Register-Stop suppresses it
// and the probe timer emits a Null-Register.
#[test]
fn register_and_register_stop() {
    let mut t = Test::new();
    t.add_iface("eth0", "10.0.0.1", "10.0.0.0/30");
    t.add_iface("eth1", "192.0.2.1", "192.0.2.0/24");
    t.start();
    t.instance
        .add_config_static_rp(
            "224.0.0.0/4".parse().unwrap(),
            ip!("10.2.2.2"),
            1,
            None,
        )
        .unwrap();
    t.instance.config_static_rp_done().unwrap();
    t.add_mrib_entry("10.0.0.0/8", "10.0.0.2", 0);
    t.add_mrib_entry("192.0.2.0/24", "0.0.0.0", 1);
    t.drain();

    let source = ip!("192.0.2.7");
    let group = ip!("239.5.5.5");
    let eth1 = t.vif_index("eth1");

    // First data packet.
    t.instance.process_protocol_msg(ProtocolMsg::MfeaUpcall(
        MfeaUpcallMsg::NoCache {
            vif_index: eth1,
            source,
            group,
        },
    ));
    t.drain();

    let mre_idx = t.instance.state.mrt.lookup_sg(&source, &group).unwrap();
    {
        let mre = t.instance.state.mrt.get(mre_idx).unwrap();
        assert!(mre.keepalive_timer.is_some());
        // We are the DR for a directly-connected source.
        assert_eq!(mre.register_state, RegisterState::Join);
    }
    // The forwarding entry was pushed to the MFEA.
    assert!(t.mfc_requests().iter().any(|msg| matches!(
        msg,
        MfcRequestMsg::AddMfc(_)
    )));

    // The kernel hands us a packet to encapsulate.
    let register_vif = t.instance.state.register_vif_index.unwrap();
    t.instance.process_protocol_msg(ProtocolMsg::MfeaUpcall(
        MfeaUpcallMsg::WholePkt {
            vif_index: register_vif,
            source,
            group,
            packet: bytes::Bytes::from_static(&[0u8; 24]),
        },
    ));
    t.drain();
    let packets = t.tx_packets();
    assert!(packets.iter().any(|(_, dst, packet)| {
        *dst == ip!("10.2.2.2") && matches!(packet, Packet::Register(_))
    }));

    // Register-Stop from the RP.
    t.rx_packet(
        "eth0",
        "10.2.2.2",
        "10.0.0.1",
        Packet::RegisterStop(RegisterStopMsg {
            group: EncodedGroup::new("239.5.5.5/32".parse().unwrap()),
            source,
        }),
    );
    {
        let mre = t.instance.state.mrt.get(mre_idx).unwrap();
        assert_eq!(mre.register_state, RegisterState::Prune);
        assert!(mre.register_stop_timer.is_some());
    }

    // The probe timer fires: Join-Pending plus a Null-Register.
    let key = MreKey {
        source,
        group,
        mre_type: MreType::Sg,
    };
    t.fire_mre_timer(key, MreTimerKind::RegisterStop);
    {
        let mre = t.instance.state.mrt.get(mre_idx).unwrap();
        assert_eq!(mre.register_state, RegisterState::JoinPending);
    }
    let packets = t.tx_packets();
    assert!(packets.iter().any(|(_, _, packet)| matches!(
        packet,
        Packet::Register(register) if register.null_register
    )));
}

// Register received at the RP: (S,G) state is created with the RP
// keepalive and a Register-Stop is returned to the DR.
#[test]
fn register_received_at_rp() {
    let mut t = Test::new();
    t.add_iface("eth0", "10.2.2.2", "10.2.2.0/24");
    t.start();
    t.instance
        .add_config_static_rp(
            "224.0.0.0/4".parse().unwrap(),
            ip!("10.2.2.2"),
            1,
            None,
        )
        .unwrap();
    t.instance.config_static_rp_done().unwrap();
    t.add_mrib_entry("192.0.2.0/24", "10.2.2.9", 0);
    t.drain();

    // A Null-Register probe from the DR at 192.0.2.1.
    let inner = vec![
        0x45, 0x00, 0x00, 0x14, 0x00, 0x00, 0x00, 0x00, 0x00, 0x67,
        0x04, 0x72, 0xc0, 0x00, 0x02, 0x07, 0xef, 0x05, 0x05, 0x05,
    ];
    t.rx_packet(
        "eth0",
        "192.0.2.1",
        "10.2.2.2",
        Packet::Register(RegisterMsg {
            border: false,
            null_register: true,
            inner: bytes::Bytes::from(inner),
        }),
    );

    let source = ip!("192.0.2.7");
    let group = ip!("239.5.5.5");
    let mre_idx = t.instance.state.mrt.lookup_sg(&source, &group).unwrap();
    let mre = t.instance.state.mrt.get(mre_idx).unwrap();
    assert!(mre.i_am_rp());
    assert!(mre.keepalive_timer.is_some());

    // Nobody joined the shared tree, so the DR is told to stop.
    let packets = t.tx_packets();
    assert!(packets.iter().any(|(_, dst, packet)| {
        *dst == ip!("192.0.2.1")
            && matches!(packet, Packet::RegisterStop(_))
    }));
}

// Assert on a LAN: a WRONGVIF upcall fires one rate-limited Assert;
// a worse competing Assert leaves us the winner, an AssertCancel
// releases loser state.
#[test]
fn assert_on_lan() {
    let mut t = Test::new();
    t.add_iface("eth1", "198.51.100.1", "198.51.100.0/24");
    t.add_iface("eth2", "203.0.113.1", "203.0.113.0/24");
    t.start();
    t.instance
        .add_config_static_rp(
            "224.0.0.0/4".parse().unwrap(),
            ip!("10.2.2.2"),
            1,
            None,
        )
        .unwrap();
    t.instance.config_static_rp_done().unwrap();
    t.add_mrib_entry("198.51.100.0/24", "0.0.0.0", 0);
    t.add_mrib_entry("10.0.0.0/8", "198.51.100.9", 0);
    t.rx_packet(
        "eth2",
        "203.0.113.2",
        ALL_PIM_ROUTERS,
        hello(105, 1, 0x2),
    );
    let _ = t.tx_packets();

    let source = ip!("198.51.100.7");
    let group = ip!("232.0.0.1");
    let eth1 = t.vif_index("eth1");
    let eth2 = t.vif_index("eth2");

    // Data shows up; the source is directly connected on eth1.
    t.instance.process_protocol_msg(ProtocolMsg::MfeaUpcall(
        MfeaUpcallMsg::NoCache {
            vif_index: eth1,
            source,
            group,
        },
    ));
    t.drain();
    // A downstream router on eth2 joins (S,G).
    t.rx_packet(
        "eth2",
        "203.0.113.2",
        ALL_PIM_ROUTERS,
        join_prune(
            "203.0.113.1",
            210,
            "232.0.0.1",
            "198.51.100.7",
            SourceFlags::SPARSE,
            true,
        ),
    );
    let _ = t.tx_packets();

    let mre_idx = t.instance.state.mrt.lookup_sg(&source, &group).unwrap();
    assert!(t.instance.state.mrt.get(mre_idx).unwrap().spt_bit());

    // Data leaked onto eth2: we must assert.
    t.instance.process_protocol_msg(ProtocolMsg::MfeaUpcall(
        MfeaUpcallMsg::WrongVif {
            vif_index: eth2,
            source,
            group,
        },
    ));
    t.drain();
    let packets = t.tx_packets();
    assert_eq!(
        packets
            .iter()
            .filter(|(_, _, packet)| matches!(packet, Packet::Assert(_)))
            .count(),
        1
    );
    {
        let mre = t.instance.state.mrt.get(mre_idx).unwrap();
        assert!(mre.assert.i_am_winner.contains(eth2));
        assert!(mre.assert.rate_limit.contains(eth2));
    }

    // A duplicate trigger within the rate-limit window stays quiet.
    t.instance.process_protocol_msg(ProtocolMsg::MfeaUpcall(
        MfeaUpcallMsg::WrongVif {
            vif_index: eth2,
            source,
            group,
        },
    ));
    t.drain();
    assert!(t.tx_packets().iter().all(|(_, _, packet)| !matches!(
        packet,
        Packet::Assert(_)
    )));

    // A worse assert (higher preference) does not dethrone us.
    t.rx_packet(
        "eth2",
        "203.0.113.2",
        ALL_PIM_ROUTERS,
        Packet::Assert(AssertMsg {
            group: EncodedGroup::new("232.0.0.1/32".parse().unwrap()),
            source,
            rpt_bit: false,
            metric_preference: 110,
            metric: 5,
        }),
    );
    {
        let mre = t.instance.state.mrt.get(mre_idx).unwrap();
        assert!(mre.assert.i_am_winner.contains(eth2));
    }

    // A better assert makes us the loser; an AssertCancel releases it.
    t.rx_packet(
        "eth2",
        "203.0.113.2",
        ALL_PIM_ROUTERS,
        Packet::Assert(AssertMsg {
            group: EncodedGroup::new("232.0.0.1/32".parse().unwrap()),
            source,
            rpt_bit: false,
            metric_preference: 50,
            metric: 1,
        }),
    );
    {
        let mre = t.instance.state.mrt.get(mre_idx).unwrap();
        assert!(mre.assert.i_am_loser.contains(eth2));
        assert!(!mre.assert.i_am_winner.contains(eth2));
    }
    t.rx_packet(
        "eth2",
        "203.0.113.2",
        ALL_PIM_ROUTERS,
        Packet::Assert(AssertMsg {
            group: EncodedGroup::new("232.0.0.1/32".parse().unwrap()),
            source,
            rpt_bit: true,
            metric_preference: 0x7fff_ffff,
            metric: 0xffff_ffff,
        }),
    );
    let mre = t.instance.state.mrt.get(mre_idx).unwrap();
    assert!(!mre.assert.i_am_loser.contains(eth2));
}

// Adding and removing a vif address restores the previous address set
// and DR assignment.
#[test]
fn vif_addr_roundtrip() {
    let mut t = Test::new();
    t.add_iface("eth0", "10.0.0.1", "10.0.0.0/30");
    t.start();

    let snapshot = |t: &Test| {
        let (_, iface) = t
            .instance
            .state
            .interfaces
            .get_by_name(&t.instance.arenas.interfaces, "eth0")
            .unwrap();
        (
            iface.system.addrs.clone(),
            iface.state.primary_addr,
            iface.state.dr_addr,
        )
    };
    let before = snapshot(&t);

    t.instance
        .add_vif_addr(
            "eth0",
            ip!("10.0.0.5"),
            "10.0.0.4/30".parse().unwrap(),
            None,
            None,
        )
        .unwrap();
    t.drain();
    t.instance.delete_vif_addr("eth0", ip!("10.0.0.5")).unwrap();
    t.drain();

    assert_eq!(snapshot(&t), before);
}

// An unknown neighbor's Join/Prune is dropped and counted unless
// accept-nohello-neighbors is set.
#[test]
fn unknown_neighbor_policy() {
    let mut t = Test::new();
    t.add_iface("eth0", "10.0.0.1", "10.0.0.0/30");
    t.start();
    t.instance
        .add_config_static_rp(
            "224.0.0.0/4".parse().unwrap(),
            ip!("10.1.1.1"),
            1,
            None,
        )
        .unwrap();
    t.instance.config_static_rp_done().unwrap();

    let jp = join_prune("10.0.0.1", 210, "239.9.9.9", "10.1.1.1", WC_FLAGS, true);
    t.rx_packet("eth0", "10.0.0.2", ALL_PIM_ROUTERS, jp.clone());
    {
        let (_, iface) = t
            .instance
            .state
            .interfaces
            .get_by_name(&t.instance.arenas.interfaces, "eth0")
            .unwrap();
        assert_eq!(iface.state.errors.neighbor_unknown_messages, 1);
        assert!(
            iface
                .neighbors
                .get_by_addr(&t.instance.arenas.neighbors, &ip!("10.0.0.2"))
                .is_none()
        );
    }

    t.instance
        .set_accept_nohello_neighbors("eth0", true)
        .unwrap();
    t.rx_packet("eth0", "10.0.0.2", ALL_PIM_ROUTERS, jp);
    let (_, iface) = t
        .instance
        .state
        .interfaces
        .get_by_name(&t.instance.arenas.interfaces, "eth0")
        .unwrap();
    let (_, nbr) = iface
        .neighbors
        .get_by_addr(&t.instance.arenas.neighbors, &ip!("10.0.0.2"))
        .expect("nohello neighbor not created");
    assert!(nbr.is_nohello);
}
