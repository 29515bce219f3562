//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use pim_utils::mfea::VifIndex;
use pim_utils::task::TimeoutTask;

use crate::collections::NeighborId;
use crate::consts::HELLO_HOLDTIME_FOREVER;
use crate::mrt::MreIndex;
use crate::packet::hello::{HelloMsg, LanPruneDelay};
use crate::packet::join_prune::{
    EncodedSource, JoinPruneGroup, JoinPruneMsg, SourceFlags,
};
use crate::packet::{EncodedGroup, Packet};

// An adjacent PIM router on a vif.
#[derive(Debug)]
pub struct Neighbor {
    pub id: NeighborId,
    pub vif_index: VifIndex,
    pub addr: IpAddr,
    pub protocol_version: u8,
    pub holdtime: u16,
    pub gen_id: Option<u32>,
    pub dr_priority: Option<u32>,
    pub lan_prune_delay: Option<LanPruneDelay>,
    pub secondary_addrs: Vec<IpAddr>,
    // Created from a non-Hello message (accept-nohello-neighbors).
    pub is_nohello: bool,
    pub uptime: DateTime<Utc>,
    // None while the holdtime is "forever".
    pub liveness_timer: Option<TimeoutTask>,
    // Join/Prune groups being batched for transmission to this neighbor.
    pub jp_buffer: JpBuffer,
    // Entries whose upstream resolution currently points at this
    // neighbor, one list per entry kind.
    pub mre_rp: HashSet<MreIndex>,
    pub mre_wc: HashSet<MreIndex>,
    pub mre_sg: HashSet<MreIndex>,
    pub mre_sg_rpt: HashSet<MreIndex>,
}

// Outgoing Join/Prune build buffer.
//
// Entries accumulate per group until the buffer is flushed into a
// single Join/Prune message addressed to the owning neighbor.
#[derive(Debug, Default)]
pub struct JpBuffer {
    groups: BTreeMap<IpNetwork, JpBufferGroup>,
}

#[derive(Debug, Default)]
struct JpBufferGroup {
    joins: Vec<EncodedSource>,
    prunes: Vec<EncodedSource>,
}

// ===== impl Neighbor =====

impl Neighbor {
    pub(crate) fn new(
        id: NeighborId,
        vif_index: VifIndex,
        addr: IpAddr,
    ) -> Neighbor {
        Neighbor {
            id,
            vif_index,
            addr,
            protocol_version: crate::consts::PIM_VERSION,
            holdtime: crate::consts::HELLO_HOLDTIME,
            gen_id: None,
            dr_priority: None,
            lan_prune_delay: None,
            secondary_addrs: Vec::new(),
            is_nohello: false,
            uptime: Utc::now(),
            liveness_timer: None,
            jp_buffer: JpBuffer::default(),
            mre_rp: HashSet::new(),
            mre_wc: HashSet::new(),
            mre_sg: HashSet::new(),
            mre_sg_rpt: HashSet::new(),
        }
    }

    // Merges a received Hello into the neighbor state.
    //
    // Returns true if the GenID changed (including first appearance).
    pub(crate) fn update_from_hello(&mut self, hello: &HelloMsg) -> bool {
        self.holdtime =
            hello.holdtime.unwrap_or(crate::consts::HELLO_HOLDTIME);
        self.dr_priority = hello.dr_priority;
        self.lan_prune_delay = hello.lan_prune_delay;
        self.secondary_addrs = hello.addr_list.clone();
        self.is_nohello = false;

        let gen_id_changed = match (self.gen_id, hello.gen_id) {
            (Some(old), Some(new)) => old != new,
            (None, Some(_)) => true,
            _ => false,
        };
        self.gen_id = hello.gen_id;
        gen_id_changed
    }

    // The liveness duration implied by the current holdtime, or None
    // when the neighbor never expires.
    pub(crate) fn liveness(&self) -> Option<Duration> {
        if self.holdtime == HELLO_HOLDTIME_FOREVER {
            None
        } else {
            Some(Duration::from_secs(self.holdtime as u64))
        }
    }

    // The neighbor announced the LAN Prune Delay option with the T-bit,
    // meaning it is capable of join suppression disabling.
    pub(crate) fn is_tracking_capable(&self) -> bool {
        self.lan_prune_delay
            .map(|lpd| lpd.t_bit)
            .unwrap_or(false)
    }

    // Unlinks one entry handle from every back-reference list.
    pub(crate) fn unlink_mre(&mut self, mre_idx: MreIndex) {
        self.mre_rp.remove(&mre_idx);
        self.mre_wc.remove(&mre_idx);
        self.mre_sg.remove(&mre_idx);
        self.mre_sg_rpt.remove(&mre_idx);
    }

    // Drains every back-reference list.
    pub(crate) fn take_mre_refs(&mut self) -> Vec<MreIndex> {
        self.mre_rp
            .drain()
            .chain(self.mre_wc.drain())
            .chain(self.mre_sg.drain())
            .chain(self.mre_sg_rpt.drain())
            .collect()
    }
}

// ===== impl JpBuffer =====

impl JpBuffer {
    pub(crate) fn add_entry(
        &mut self,
        group: IpNetwork,
        source: IpAddr,
        masklen: u8,
        flags: SourceFlags,
        is_join: bool,
    ) {
        let entry = EncodedSource::new(source, masklen, flags);
        let group = self.groups.entry(group).or_default();
        let list = if is_join {
            &mut group.joins
        } else {
            &mut group.prunes
        };
        if !list.contains(&entry) {
            list.push(entry);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    // Flushes the buffer into a Join/Prune message.
    pub(crate) fn take_msg(
        &mut self,
        upstream_nbr: IpAddr,
        holdtime: u16,
    ) -> Option<Packet> {
        if self.groups.is_empty() {
            return None;
        }
        let groups = std::mem::take(&mut self.groups)
            .into_iter()
            .map(|(prefix, group)| JoinPruneGroup {
                group: EncodedGroup::new(prefix),
                joins: group.joins,
                prunes: group.prunes,
            })
            .collect();
        Some(Packet::JoinPrune(JoinPruneMsg {
            upstream_nbr,
            holdtime,
            groups,
        }))
    }
}
