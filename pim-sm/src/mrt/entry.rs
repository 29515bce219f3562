//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::IpAddr;

use bitflags::bitflags;
use pim_utils::mfea::{MifSet, VifIndex};
use pim_utils::task::TimeoutTask;
use serde::{Deserialize, Serialize};

use crate::mrt::{MreIndex, MreKey, MreType};
use crate::mrib::MribEntry;
use crate::packet::assert::AssertMetric;

// Upstream Join/Prune state for (*,*,RP), (*,G) and (S,G) entries.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum UpstreamState {
    #[default]
    NoInfo,
    Joined,
}

// Upstream state for (S,G,rpt) entries.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum SgRptUpstreamState {
    #[default]
    RptNotJoined,
    Pruned,
    NotPruned,
}

// Register state of an (S,G) entry at the DR.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum RegisterState {
    #[default]
    NoInfo,
    Join,
    JoinPending,
    Prune,
}

// Downstream per-interface Join/Prune state, kept as bitmaps.
//
// A vif is in Join when its bit is set in `join`, in Prune-Pending when
// set in `prune_pending`, and in Prune when set in `prune`.
#[derive(Debug, Default)]
pub struct DownstreamState {
    pub join: MifSet,
    pub prune_pending: MifSet,
    pub prune: MifSet,
    // Scratch bitmaps used while a J/P message is being processed.
    pub tmp_p: MifSet,
    pub tmp_pp: MifSet,
    pub expiry_timers: BTreeMap<VifIndex, TimeoutTask>,
    pub prune_pending_timers: BTreeMap<VifIndex, TimeoutTask>,
}

// Per-interface Assert state.
#[derive(Debug, Default)]
pub struct AssertState {
    pub winner_metrics: BTreeMap<VifIndex, AssertMetric>,
    pub i_am_winner: MifSet,
    pub i_am_loser: MifSet,
    pub timers: BTreeMap<VifIndex, TimeoutTask>,
    // At most one triggered Assert per vif per rate-limit period.
    pub rate_limit: MifSet,
    pub rate_limit_timers: BTreeMap<VifIndex, TimeoutTask>,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct MreFlags: u16 {
        const SPT = 0x0001;
        const DIRECTLY_CONNECTED_S = 0x0002;
        const I_AM_RP = 0x0004;
        const WAS_SWITCH_TO_SPT_DESIRED = 0x0008;
        const KAT_SET_TO_RP_PERIOD = 0x0010;
        const DELETE_PENDING = 0x0020;
        const DELETE_DONE = 0x0040;
    }
}

// One multicast routing entry.
//
// A single struct carries the union of the per-type state; which parts
// are meaningful depends on `mre_type`.
#[derive(Debug)]
pub struct Mre {
    pub mre_type: MreType,
    // For (*,*,RP) entries this is the RP address; for (*,G) entries it
    // is the unspecified address.
    pub source: IpAddr,
    // For (*,*,RP) entries this is the multicast base address.
    pub group: IpAddr,

    // Cross-links. (S,G) and (S,G,rpt) are siblings of each other.
    pub sibling_idx: Option<MreIndex>,
    pub wc_idx: Option<MreIndex>,
    pub rp_entry_idx: Option<MreIndex>,

    // The elected RP(G), kept equal to the RP table's answer.
    pub rp_addr: Option<IpAddr>,
    // Unicast routing state toward the RP and toward the source.
    pub mrib_rp: Option<MribEntry>,
    pub mrib_s: Option<MribEntry>,
    // Upstream neighbor addresses. These stay set even while no matching
    // neighbor exists yet; the table is rescanned when one appears.
    pub nbr_mrib_next_hop_rp: Option<IpAddr>,
    pub nbr_mrib_next_hop_s: Option<IpAddr>,
    pub rpfp_nbr_wc: Option<IpAddr>,
    pub rpfp_nbr_sg: Option<IpAddr>,
    pub rpfp_nbr_sg_rpt: Option<IpAddr>,

    // Upstream state.
    pub upstream_state: UpstreamState,
    pub rpt_state: SgRptUpstreamState,
    pub upstream_jp_timer: Option<TimeoutTask>,

    pub downstream: DownstreamState,
    pub assert: AssertState,

    // Local membership learned from MLD/IGMP.
    pub local_include: MifSet,
    pub local_exclude: MifSet,

    // Register machinery, (S,G) entries only.
    pub register_state: RegisterState,
    pub register_stop_timer: Option<TimeoutTask>,
    pub keepalive_timer: Option<TimeoutTask>,
    pub pmbr_addr: Option<IpAddr>,

    pub flags: MreFlags,
    // Vifs where a (*,G) join in the same message already covered this
    // (S,G,rpt) prune.
    pub processed_wc_by_sg_rpt: MifSet,
}

// ===== impl Mre =====

impl Mre {
    pub(crate) fn new(
        mre_type: MreType,
        source: IpAddr,
        group: IpAddr,
    ) -> Mre {
        Mre {
            mre_type,
            source,
            group,
            sibling_idx: None,
            wc_idx: None,
            rp_entry_idx: None,
            rp_addr: match mre_type {
                MreType::Rp => Some(source),
                _ => None,
            },
            mrib_rp: None,
            mrib_s: None,
            nbr_mrib_next_hop_rp: None,
            nbr_mrib_next_hop_s: None,
            rpfp_nbr_wc: None,
            rpfp_nbr_sg: None,
            rpfp_nbr_sg_rpt: None,
            upstream_state: UpstreamState::default(),
            rpt_state: SgRptUpstreamState::default(),
            upstream_jp_timer: None,
            downstream: DownstreamState::default(),
            assert: AssertState::default(),
            local_include: MifSet::new(),
            local_exclude: MifSet::new(),
            register_state: RegisterState::default(),
            register_stop_timer: None,
            keepalive_timer: None,
            pmbr_addr: None,
            flags: MreFlags::default(),
            processed_wc_by_sg_rpt: MifSet::new(),
        }
    }

    pub fn key(&self) -> MreKey {
        MreKey {
            source: self.source,
            group: self.group,
            mre_type: self.mre_type,
        }
    }

    pub fn is_sg(&self) -> bool {
        self.mre_type == MreType::Sg
    }

    pub fn is_sg_rpt(&self) -> bool {
        self.mre_type == MreType::SgRpt
    }

    pub fn is_wc(&self) -> bool {
        self.mre_type == MreType::Wc
    }

    pub fn is_rp(&self) -> bool {
        self.mre_type == MreType::Rp
    }

    pub fn spt_bit(&self) -> bool {
        self.flags.contains(MreFlags::SPT)
    }

    pub fn i_am_rp(&self) -> bool {
        self.flags.contains(MreFlags::I_AM_RP)
    }

    // RPF interface toward the RP.
    pub(crate) fn rpf_interface_rp(&self) -> Option<VifIndex> {
        self.mrib_rp.as_ref().map(|mrib| mrib.vif_index)
    }

    // RPF interface toward the source.
    pub(crate) fn rpf_interface_s(&self) -> Option<VifIndex> {
        self.mrib_s.as_ref().map(|mrib| mrib.vif_index)
    }

    // The joins macro: downstream interfaces in Join or Prune-Pending.
    pub fn joins(&self) -> MifSet {
        self.downstream.join.union(self.downstream.prune_pending)
    }

    // Downstream interfaces in Prune or Prune-Pending, used by the
    // (S,G,rpt) inherited-olist subtraction.
    pub(crate) fn prunes(&self) -> MifSet {
        self.downstream.prune.union(self.downstream.prune_pending)
    }

    pub(crate) fn has_downstream_state(&self) -> bool {
        !self.downstream.join.is_empty()
            || !self.downstream.prune_pending.is_empty()
            || !self.downstream.prune.is_empty()
    }

    pub(crate) fn has_vif_state(&self, vif_index: VifIndex) -> bool {
        self.downstream.join.contains(vif_index)
            || self.downstream.prune_pending.contains(vif_index)
            || self.downstream.prune.contains(vif_index)
            || self.assert.i_am_winner.contains(vif_index)
            || self.assert.i_am_loser.contains(vif_index)
            || self.local_include.contains(vif_index)
            || self.local_exclude.contains(vif_index)
            || self.mrib_rp.as_ref().map(|m| m.vif_index)
                == Some(vif_index)
            || self.mrib_s.as_ref().map(|m| m.vif_index) == Some(vif_index)
    }

    // The quiescence check gating entry removal.
    //
    // `strict` additionally requires the caller to have verified that the
    // inherited (S,G) olist is empty.
    pub(crate) fn is_removable(&self) -> bool {
        if self.flags.contains(MreFlags::DELETE_DONE) {
            return false;
        }
        self.local_include.is_empty()
            && self.local_exclude.is_empty()
            && !self.has_downstream_state()
            && self.upstream_state == UpstreamState::NoInfo
            && self.rpt_state != SgRptUpstreamState::Pruned
            && self.upstream_jp_timer.is_none()
            && self.assert.i_am_winner.is_empty()
            && self.assert.i_am_loser.is_empty()
            && self.keepalive_timer.is_none()
            && self.register_state == RegisterState::NoInfo
            && self.register_stop_timer.is_none()
    }

    // Clears every timer; used right before the entry is freed.
    pub(crate) fn cancel_timers(&mut self) {
        self.upstream_jp_timer = None;
        self.register_stop_timer = None;
        self.keepalive_timer = None;
        self.downstream.expiry_timers.clear();
        self.downstream.prune_pending_timers.clear();
        self.assert.timers.clear();
        self.assert.rate_limit_timers.clear();
    }
}
