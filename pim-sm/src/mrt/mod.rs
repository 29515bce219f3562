//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod assert;
pub mod downstream;
pub mod entry;
pub mod olist;
pub mod register;
pub mod spt;
pub mod task;
pub mod upstream;

use std::collections::{BTreeMap, VecDeque};
use std::net::IpAddr;

use bitflags::bitflags;
use pim_utils::ip::{AddressFamily, IpAddrExt};
use serde::{Deserialize, Serialize};

pub use crate::mrt::entry::{
    Mre, MreFlags, RegisterState, SgRptUpstreamState, UpstreamState,
};
pub use crate::mrt::task::{MrtTask, TaskKind};

use crate::collections::Arena;
use crate::debug::Debug;

pub type MreIndex = generational_arena::Index;

bitflags! {
    // Entry-presence mask used by table lookups.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct LookupFlags: u8 {
        const RP = 0x01;
        const WC = 0x02;
        const SG = 0x04;
        const SG_RPT = 0x08;
    }
}

// The concrete kind of one routing entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum MreType {
    Rp,
    Wc,
    Sg,
    SgRpt,
}

// Stable identification of one entry, carried inside timer messages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MreKey {
    pub source: IpAddr,
    pub group: IpAddr,
    pub mre_type: MreType,
}

// (S,G) and (S,G,rpt) share one table slot.
#[derive(Clone, Copy, Debug, Default)]
struct SgSlot {
    sg: Option<MreIndex>,
    sg_rpt: Option<MreIndex>,
}

// The multicast routing table.
#[derive(Debug, Default)]
pub struct Mrt {
    pub(crate) arena: Arena<Mre>,
    // Keyed by (group, source).
    sg_tree: BTreeMap<(IpAddr, IpAddr), SgSlot>,
    // Keyed by group.
    wc_tree: BTreeMap<IpAddr, MreIndex>,
    // Keyed by RP address.
    rp_tree: BTreeMap<IpAddr, MreIndex>,
    // Deferred per-entry work.
    pub(crate) tasks: VecDeque<MrtTask>,
}

// ===== impl MreType =====

impl MreType {
    pub fn mask(&self) -> LookupFlags {
        match self {
            MreType::Rp => LookupFlags::RP,
            MreType::Wc => LookupFlags::WC,
            MreType::Sg => LookupFlags::SG,
            MreType::SgRpt => LookupFlags::SG_RPT,
        }
    }
}

impl std::fmt::Display for MreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MreType::Rp => write!(f, "(*,*,RP)"),
            MreType::Wc => write!(f, "(*,G)"),
            MreType::Sg => write!(f, "(S,G)"),
            MreType::SgRpt => write!(f, "(S,G,rpt)"),
        }
    }
}

// ===== impl Mrt =====

impl Mrt {
    pub fn get(&self, mre_idx: MreIndex) -> Option<&Mre> {
        self.arena.get(mre_idx)
    }

    pub(crate) fn get_mut(&mut self, mre_idx: MreIndex) -> Option<&mut Mre> {
        self.arena.get_mut(mre_idx)
    }

    // ===== lookups =====

    pub fn lookup_sg(
        &self,
        source: &IpAddr,
        group: &IpAddr,
    ) -> Option<MreIndex> {
        self.sg_tree.get(&(*group, *source)).and_then(|slot| slot.sg)
    }

    pub fn lookup_sg_rpt(
        &self,
        source: &IpAddr,
        group: &IpAddr,
    ) -> Option<MreIndex> {
        self.sg_tree
            .get(&(*group, *source))
            .and_then(|slot| slot.sg_rpt)
    }

    pub fn lookup_wc(&self, group: &IpAddr) -> Option<MreIndex> {
        self.wc_tree.get(group).copied()
    }

    pub fn lookup_rp(&self, rp_addr: &IpAddr) -> Option<MreIndex> {
        self.rp_tree.get(rp_addr).copied()
    }

    // Finds the first present entry among the requested kinds.
    pub fn find(
        &self,
        source: &IpAddr,
        group: &IpAddr,
        lookup_flags: LookupFlags,
    ) -> Option<MreIndex> {
        if lookup_flags.contains(LookupFlags::SG)
            && let Some(mre_idx) = self.lookup_sg(source, group)
        {
            return Some(mre_idx);
        }
        if lookup_flags.contains(LookupFlags::SG_RPT)
            && let Some(mre_idx) = self.lookup_sg_rpt(source, group)
        {
            return Some(mre_idx);
        }
        if lookup_flags.contains(LookupFlags::WC)
            && let Some(mre_idx) = self.lookup_wc(group)
        {
            return Some(mre_idx);
        }
        if lookup_flags.contains(LookupFlags::RP)
            && let Some(mre_idx) = self.lookup_rp(source)
        {
            return Some(mre_idx);
        }
        None
    }

    // Looks an entry up by its timer-message key.
    pub fn lookup_key(&self, key: &MreKey) -> Option<MreIndex> {
        match key.mre_type {
            MreType::Sg => self.lookup_sg(&key.source, &key.group),
            MreType::SgRpt => self.lookup_sg_rpt(&key.source, &key.group),
            MreType::Wc => self.lookup_wc(&key.group),
            MreType::Rp => self.lookup_rp(&key.source),
        }
    }

    // ===== creation =====

    // Creates an entry of the given type, wiring up every cross-link.
    //
    // For `Rp` entries `source` is the RP address; for `Wc` entries it is
    // ignored.
    pub(crate) fn insert(
        &mut self,
        af: AddressFamily,
        mre_type: MreType,
        source: &IpAddr,
        group: &IpAddr,
    ) -> MreIndex {
        if let Some(mre_idx) = self.lookup_key(&MreKey {
            source: *source,
            group: *group,
            mre_type,
        }) {
            return mre_idx;
        }

        let (source, group) = match mre_type {
            MreType::Rp => (*source, af.multicast_base().ip()),
            MreType::Wc => (IpAddr::unspecified(af), *group),
            _ => (*source, *group),
        };
        Debug::MreCreate(mre_type, &source, &group).log();

        let mre = Mre::new(mre_type, source, group);
        let mre_idx = self.arena.insert(mre);

        // Link into the lookup trees.
        match mre_type {
            MreType::Sg => {
                let slot = self.sg_tree.entry((group, source)).or_default();
                slot.sg = Some(mre_idx);
            }
            MreType::SgRpt => {
                let slot = self.sg_tree.entry((group, source)).or_default();
                slot.sg_rpt = Some(mre_idx);
            }
            MreType::Wc => {
                self.wc_tree.insert(group, mre_idx);
            }
            MreType::Rp => {
                self.rp_tree.insert(source, mre_idx);
            }
        }

        // Wire the sibling and (*,G) cross-links.
        match mre_type {
            MreType::Sg | MreType::SgRpt => {
                let sibling_idx = match mre_type {
                    MreType::Sg => self.lookup_sg_rpt(&source, &group),
                    _ => self.lookup_sg(&source, &group),
                };
                let wc_idx = self.lookup_wc(&group);
                if let Some(sibling_idx) = sibling_idx {
                    self.arena[sibling_idx].sibling_idx = Some(mre_idx);
                }
                let mre = &mut self.arena[mre_idx];
                mre.sibling_idx = sibling_idx;
                mre.wc_idx = wc_idx;
            }
            MreType::Wc => {
                // Existing (S,G)/(S,G,rpt) entries for this group gain
                // their (*,G) link.
                let sg_entries = self
                    .sg_tree
                    .range((group, IpAddr::unspecified(af))..)
                    .take_while(|((g, _), _)| *g == group)
                    .flat_map(|(_, slot)| {
                        slot.sg.into_iter().chain(slot.sg_rpt)
                    })
                    .collect::<Vec<_>>();
                for sg_idx in sg_entries {
                    self.arena[sg_idx].wc_idx = Some(mre_idx);
                }
            }
            MreType::Rp => {
                // Entries electing this RP gain their (*,*,RP) link.
                let dependents = self
                    .arena
                    .iter()
                    .filter(|(_, mre)| mre.rp_addr == Some(source))
                    .map(|(idx, _)| idx)
                    .collect::<Vec<_>>();
                for idx in dependents {
                    self.arena[idx].rp_entry_idx = Some(mre_idx);
                }
            }
        }

        mre_idx
    }

    // ===== removal =====

    // Unconditionally unlinks and frees an entry. Quiescence is the
    // caller's responsibility (`entry_try_remove`).
    pub(crate) fn remove(&mut self, mre_idx: MreIndex) {
        let Some(mre) = self.arena.get(mre_idx) else {
            return;
        };
        let (mre_type, source, group) = (mre.mre_type, mre.source, mre.group);
        Debug::MreDelete(mre_type, &source, &group).log();

        match mre_type {
            MreType::Sg | MreType::SgRpt => {
                if let Some(slot) = self.sg_tree.get_mut(&(group, source)) {
                    match mre_type {
                        MreType::Sg => slot.sg = None,
                        _ => slot.sg_rpt = None,
                    }
                    if slot.sg.is_none() && slot.sg_rpt.is_none() {
                        self.sg_tree.remove(&(group, source));
                    }
                }
            }
            MreType::Wc => {
                self.wc_tree.remove(&group);
            }
            MreType::Rp => {
                self.rp_tree.remove(&source);
            }
        }

        // Clear dangling cross-links in related entries.
        let related = self
            .arena
            .iter()
            .filter(|(_, other)| {
                other.sibling_idx == Some(mre_idx)
                    || other.wc_idx == Some(mre_idx)
                    || other.rp_entry_idx == Some(mre_idx)
            })
            .map(|(idx, _)| idx)
            .collect::<Vec<_>>();
        for idx in related {
            let other = &mut self.arena[idx];
            if other.sibling_idx == Some(mre_idx) {
                other.sibling_idx = None;
            }
            if other.wc_idx == Some(mre_idx) {
                other.wc_idx = None;
            }
            if other.rp_entry_idx == Some(mre_idx) {
                other.rp_entry_idx = None;
            }
        }

        self.arena.remove(mre_idx);
    }

    // ===== iteration =====

    pub(crate) fn indexes(&self) -> Vec<MreIndex> {
        self.arena.iter().map(|(idx, _)| idx).collect()
    }

    // Entries whose group falls under the given RP-change scope.
    pub(crate) fn entries_for_group_prefix(
        &self,
        prefix: Option<&ipnetwork::IpNetwork>,
    ) -> Vec<MreIndex> {
        self.arena
            .iter()
            .filter(|(_, mre)| match prefix {
                Some(prefix) => prefix.contains(mre.group),
                None => true,
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    // Entries with any state on the given vif.
    pub(crate) fn entries_on_vif(
        &self,
        vif_index: pim_utils::mfea::VifIndex,
    ) -> Vec<MreIndex> {
        self.arena
            .iter()
            .filter(|(_, mre)| mre.has_vif_state(vif_index))
            .map(|(idx, _)| idx)
            .collect()
    }

    // Entries whose elected RP or any upstream slot uses this address.
    pub(crate) fn entries_with_upstream_addr(
        &self,
        addr: &IpAddr,
    ) -> Vec<MreIndex> {
        self.arena
            .iter()
            .filter(|(_, mre)| {
                mre.nbr_mrib_next_hop_rp == Some(*addr)
                    || mre.nbr_mrib_next_hop_s == Some(*addr)
                    || mre.rpfp_nbr_wc == Some(*addr)
                    || mre.rpfp_nbr_sg == Some(*addr)
                    || mre.rpfp_nbr_sg_rpt == Some(*addr)
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.iter().next().is_none()
    }
}
