//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::Arc;
use std::time::Duration;

use pim_utils::socket::{AsyncFd, Socket};
use pim_utils::task::{IntervalTask, Task, TimeoutTask};
use tracing::{Instrument, debug_span};

use crate::instance::InstanceUpView;
use crate::interface::Interface;
use crate::neighbor::Neighbor;
use crate::network;

//
// PIM tasks diagram:
//                                     +--------------+
//                      net_rx (Nx) -> |              | -> (Nx) net_tx
//                                     |              |
//              hello_interval (Nx) -> |              |
//             triggered_hello (Nx) -> |              |
//          nbr_liveness_timer (Nx) -> |              |
//                                     |              |
//       mre timers (upstream,        ->|   instance  | -> (1x) mfc requests
//        downstream, assert,          |              |
//        register, keepalive) (Nx) -> |              |
//                                     |              |
//                   bsr_timer (Nx) -> |              |
//            crp_adv_interval (Nx) -> |              |
//            crp_expiry_timer (Nx) -> |              |
//                                     +--------------+
//                 membership / vif / mrib / upcall events (from bridges)
//

// PIM inter-task message types.
pub mod messages {
    use serde::{Deserialize, Serialize};

    // Type aliases.
    pub type ProtocolInputMsg = input::ProtocolMsg;
    pub type ProtocolOutputMsg = output::ProtocolMsg;

    // Input messages (child task -> main task).
    pub mod input {
        use std::net::IpAddr;

        use ipnetwork::IpNetwork;
        use pim_utils::mfea::{
            MembershipMsg, MfeaUpcallMsg, VifIndex, VifMsg,
        };

        use super::*;
        use crate::collections::{InterfaceKey, NeighborKey};
        use crate::mrib::MribEntry;
        use crate::mrt::MreKey;
        use crate::packet::Packet;
        use crate::packet::error::DecodeError;
        use crate::rp::ScopeZoneId;

        #[derive(Debug, Deserialize, Serialize)]
        pub enum ProtocolMsg {
            NetRxPacket(NetRxPacketMsg),
            HelloInterval(HelloIntervalMsg),
            TriggeredHello(TriggeredHelloMsg),
            NeighborTimeout(NeighborTimeoutMsg),
            MreTimer(MreTimerMsg),
            MrtTaskRun(MrtTaskRunMsg),
            BsrTimer(BsrTimerMsg),
            BsrZoneExpiry(BsrZoneExpiryMsg),
            CandRpAdvInterval(CandRpAdvIntervalMsg),
            CandRpExpiry(CandRpExpiryMsg),
            GroupPrefixRemove(GroupPrefixRemoveMsg),
            MfeaUpcall(MfeaUpcallMsg),
            Membership(MembershipMsg),
            VifEvent(VifMsg),
            MribUpdate(MribUpdateMsg),
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct NetRxPacketMsg {
            pub iface_key: InterfaceKey,
            pub src: IpAddr,
            pub dst: IpAddr,
            pub packet: Result<Packet, DecodeError>,
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct HelloIntervalMsg {
            pub iface_key: InterfaceKey,
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct TriggeredHelloMsg {
            pub iface_key: InterfaceKey,
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct NeighborTimeoutMsg {
            pub iface_key: InterfaceKey,
            pub nbr_key: NeighborKey,
        }

        // Which of an entry's timers fired.
        #[derive(Clone, Copy, Debug, Deserialize, Serialize)]
        pub enum MreTimerKind {
            UpstreamJp,
            DownstreamExpiry(VifIndex),
            PrunePending(VifIndex),
            Assert(VifIndex),
            AssertRateLimit(VifIndex),
            RegisterStop,
            Keepalive,
        }

        #[derive(Clone, Copy, Debug, Deserialize, Serialize)]
        pub struct MreTimerMsg {
            pub key: MreKey,
            pub kind: MreTimerKind,
        }

        #[derive(Clone, Copy, Debug, Deserialize, Serialize)]
        pub struct MrtTaskRunMsg {}

        #[derive(Clone, Copy, Debug, Deserialize, Serialize)]
        pub struct BsrTimerMsg {
            pub zone: ScopeZoneId,
        }

        #[derive(Clone, Copy, Debug, Deserialize, Serialize)]
        pub struct BsrZoneExpiryMsg {
            pub zone: ScopeZoneId,
        }

        #[derive(Clone, Copy, Debug, Deserialize, Serialize)]
        pub struct CandRpAdvIntervalMsg {
            pub zone: ScopeZoneId,
        }

        #[derive(Clone, Copy, Debug, Deserialize, Serialize)]
        pub struct CandRpExpiryMsg {
            pub zone: ScopeZoneId,
            pub group_prefix: IpNetwork,
            pub rp_addr: IpAddr,
        }

        #[derive(Clone, Copy, Debug, Deserialize, Serialize)]
        pub struct GroupPrefixRemoveMsg {
            pub zone: ScopeZoneId,
            pub group_prefix: IpNetwork,
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub struct MribUpdateMsg {
            // Full replacement when true; incremental merge otherwise.
            pub replace: bool,
            pub add: Vec<MribEntry>,
            pub remove: Vec<IpNetwork>,
        }
    }

    // Output messages (main task -> child task).
    pub mod output {
        use std::net::IpAddr;

        use pim_utils::mfea::{MfcRequestMsg, VifIndex};

        use super::*;
        use crate::packet::Packet;

        #[derive(Clone, Debug, Serialize)]
        pub enum ProtocolMsg {
            NetTxPacket(NetTxPacketMsg),
            Mfc(MfcRequestMsg),
        }

        #[derive(Clone, Debug, Serialize)]
        pub struct NetTxPacketMsg {
            pub ifname: String,
            pub vif_index: VifIndex,
            pub src: Option<IpAddr>,
            pub dst: IpAddr,
            pub ttl: u8,
            pub router_alert: bool,
            pub packet: Packet,
        }
    }
}

// ===== PIM tasks =====

// Network Rx task.
#[cfg(not(feature = "testing"))]
pub(crate) fn net_rx(
    socket: Arc<AsyncFd<Socket>>,
    iface: &Interface,
    instance: &InstanceUpView<'_>,
) -> Task<()> {
    let span1 = debug_span!("network");
    let _span1_guard = span1.enter();
    let span2 = debug_span!("input");
    let _span2_guard = span2.enter();

    let af = instance.af;
    let iface_id = iface.id;
    let net_packet_rxp = instance.tx.protocol_input.net_packet_rx.clone();

    Task::spawn_supervised(move || {
        let socket = socket.clone();
        let net_packet_rxp = net_packet_rxp.clone();
        async move {
            let _ = network::read_loop(socket, af, iface_id, net_packet_rxp)
                .await;
        }
        .in_current_span()
    })
}

#[cfg(feature = "testing")]
pub(crate) fn net_rx(
    _socket: Arc<AsyncFd<Socket>>,
    _iface: &Interface,
    _instance: &InstanceUpView<'_>,
) -> Task<()> {
    Task::spawn(async move { std::future::pending().await })
}

// Network Tx task.
#[cfg(not(feature = "testing"))]
pub(crate) fn net_tx(
    socket: Arc<AsyncFd<Socket>>,
    af: pim_utils::ip::AddressFamily,
    net_packet_txc: tokio::sync::mpsc::UnboundedReceiver<
        messages::output::NetTxPacketMsg,
    >,
) -> Task<()> {
    let span1 = debug_span!("network");
    let _span1_guard = span1.enter();
    let span2 = debug_span!("output");
    let _span2_guard = span2.enter();

    Task::spawn(
        async move {
            network::write_loop(socket, af, net_packet_txc).await;
        }
        .in_current_span(),
    )
}

// Periodic Hello timer.
pub(crate) fn hello_interval(
    iface: &Interface,
    instance: &InstanceUpView<'_>,
) -> IntervalTask {
    #[cfg(not(feature = "testing"))]
    {
        let iface_id = iface.id;
        let hello_intervalp = instance.tx.protocol_input.hello_interval.clone();

        IntervalTask::new(
            Duration::from_secs(iface.config.hello_period as u64),
            false,
            move || {
                let hello_intervalp = hello_intervalp.clone();
                async move {
                    let msg = messages::input::HelloIntervalMsg {
                        iface_key: iface_id.into(),
                    };
                    let _ = hello_intervalp.send(msg);
                }
            },
        )
    }
    #[cfg(feature = "testing")]
    {
        IntervalTask {}
    }
}

// One-shot triggered Hello timer.
pub(crate) fn triggered_hello_timer(
    iface: &Interface,
    instance: &InstanceUpView<'_>,
    delay: Duration,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let iface_id = iface.id;
        let triggered_hellop =
            instance.tx.protocol_input.triggered_hello.clone();

        TimeoutTask::new(delay, move || async move {
            let msg = messages::input::TriggeredHelloMsg {
                iface_key: iface_id.into(),
            };
            let _ = triggered_hellop.send(msg);
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Neighbor liveness timer.
pub(crate) fn nbr_liveness_timer(
    iface: &Interface,
    nbr: &Neighbor,
    instance: &InstanceUpView<'_>,
    timeout: Duration,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let iface_id = iface.id;
        let nbr_id = nbr.id;
        let nbr_timeoutp = instance.tx.protocol_input.nbr_timeout.clone();

        TimeoutTask::new(timeout, move || async move {
            let msg = messages::input::NeighborTimeoutMsg {
                iface_key: iface_id.into(),
                nbr_key: nbr_id.into(),
            };
            let _ = nbr_timeoutp.send(msg);
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Any per-entry timer.
pub(crate) fn mre_timer(
    instance: &InstanceUpView<'_>,
    key: crate::mrt::MreKey,
    kind: messages::input::MreTimerKind,
    timeout: Duration,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let mre_timerp = instance.tx.protocol_input.mre_timer.clone();

        TimeoutTask::new(timeout, move || async move {
            let msg = messages::input::MreTimerMsg { key, kind };
            let _ = mre_timerp.send(msg);
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Bootstrap timer of one BSR zone.
pub(crate) fn bsr_timer(
    instance: &InstanceUpView<'_>,
    zone: crate::rp::ScopeZoneId,
    timeout: Duration,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let bsr_timerp = instance.tx.protocol_input.bsr_timer.clone();

        TimeoutTask::new(timeout, move || async move {
            let msg = messages::input::BsrTimerMsg { zone };
            let _ = bsr_timerp.send(msg);
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Scope-zone expiry timer.
pub(crate) fn bsr_zone_expiry_timer(
    instance: &InstanceUpView<'_>,
    zone: crate::rp::ScopeZoneId,
    timeout: Duration,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let zone_expiryp = instance.tx.protocol_input.bsr_zone_expiry.clone();

        TimeoutTask::new(timeout, move || async move {
            let msg = messages::input::BsrZoneExpiryMsg { zone };
            let _ = zone_expiryp.send(msg);
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Periodic Candidate-RP-Advertise timer.
pub(crate) fn crp_adv_interval(
    instance: &InstanceUpView<'_>,
    zone: crate::rp::ScopeZoneId,
    period: Duration,
) -> IntervalTask {
    #[cfg(not(feature = "testing"))]
    {
        let crp_advp = instance.tx.protocol_input.crp_adv.clone();

        IntervalTask::new(period, true, move || {
            let crp_advp = crp_advp.clone();
            async move {
                let msg = messages::input::CandRpAdvIntervalMsg { zone };
                let _ = crp_advp.send(msg);
            }
        })
    }
    #[cfg(feature = "testing")]
    {
        IntervalTask {}
    }
}

// Candidate-RP expiry timer, restarted by every Bootstrap that re-lists
// the RP.
pub(crate) fn crp_expiry_timer(
    instance: &InstanceUpView<'_>,
    zone: crate::rp::ScopeZoneId,
    group_prefix: ipnetwork::IpNetwork,
    rp_addr: std::net::IpAddr,
    timeout: Duration,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let crp_expiryp = instance.tx.protocol_input.crp_expiry.clone();

        TimeoutTask::new(timeout, move || async move {
            let msg = messages::input::CandRpExpiryMsg {
                zone,
                group_prefix,
                rp_addr,
            };
            let _ = crp_expiryp.send(msg);
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Group-prefix removal timer.
pub(crate) fn group_prefix_remove_timer(
    instance: &InstanceUpView<'_>,
    zone: crate::rp::ScopeZoneId,
    group_prefix: ipnetwork::IpNetwork,
    timeout: Duration,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let group_prefix_removep =
            instance.tx.protocol_input.group_prefix_remove.clone();

        TimeoutTask::new(timeout, move || async move {
            let msg = messages::input::GroupPrefixRemoveMsg {
                zone,
                group_prefix,
            };
            let _ = group_prefix_removep.send(msg);
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}
