//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

//! Derived outgoing-interface computations.
//!
//! These are the olist macros of RFC 4601, section 4.1.6, evaluated
//! over the downstream, membership and assert bitmaps. All functions
//! are read-only; state transitions consume their results.

use pim_utils::mfea::{MifSet, VifIndex};

use crate::collections::{Arena, Interfaces};
use crate::interface::Interface;
use crate::mrt::{Mre, Mrt, UpstreamState};

// Read-only context for olist evaluation.
pub(crate) struct OlistCtx<'a> {
    pub interfaces: &'a Interfaces,
    pub iface_arena: &'a Arena<Interface>,
    pub register_vif_index: Option<VifIndex>,
}

impl<'a> OlistCtx<'a> {
    pub(crate) fn new(
        interfaces: &'a Interfaces,
        iface_arena: &'a Arena<Interface>,
        register_vif_index: Option<VifIndex>,
    ) -> OlistCtx<'a> {
        OlistCtx {
            interfaces,
            iface_arena,
            register_vif_index,
        }
    }

    fn i_am_dr(&self, vif_index: VifIndex) -> bool {
        self.interfaces
            .get_by_vif_index(self.iface_arena, vif_index)
            .map(|(_, iface)| iface.i_am_dr())
            .unwrap_or(false)
    }
}

impl Mrt {
    // ===== related-entry helpers =====

    pub(crate) fn wc_of<'a>(&'a self, mre: &Mre) -> Option<&'a Mre> {
        mre.wc_idx
            .and_then(|idx| self.get(idx))
            .or_else(|| self.lookup_wc(&mre.group).and_then(|idx| self.get(idx)))
    }

    pub(crate) fn rp_entry_of<'a>(&'a self, mre: &Mre) -> Option<&'a Mre> {
        let rp_addr = mre.rp_addr?;
        mre.rp_entry_idx
            .and_then(|idx| self.get(idx))
            .or_else(|| self.lookup_rp(&rp_addr).and_then(|idx| self.get(idx)))
    }

    pub(crate) fn sg_rpt_of<'a>(&'a self, mre: &'a Mre) -> Option<&'a Mre> {
        if mre.is_sg_rpt() {
            return Some(mre);
        }
        mre.sibling_idx
            .and_then(|idx| self.get(idx))
            .filter(|sibling| sibling.is_sg_rpt())
    }

    pub(crate) fn sg_of<'a>(&'a self, mre: &'a Mre) -> Option<&'a Mre> {
        if mre.is_sg() {
            return Some(mre);
        }
        mre.sibling_idx
            .and_then(|idx| self.get(idx))
            .filter(|sibling| sibling.is_sg())
    }

    fn joins_rp_of(&self, mre: &Mre) -> MifSet {
        self.rp_entry_of(mre)
            .map(|rp| rp.joins())
            .unwrap_or_default()
    }

    fn joins_wc_of(&self, mre: &Mre) -> MifSet {
        self.wc_of(mre).map(|wc| wc.joins()).unwrap_or_default()
    }

    // ===== membership macros =====

    // pim_include(*,G): local (*,G) receivers we forward for, either as
    // the DR without a lost assert or as the assert winner.
    pub(crate) fn pim_include_wc(&self, ctx: &OlistCtx<'_>, mre: &Mre) -> MifSet {
        // `wc_of` resolves through the group tree, so this also works
        // when `mre` is itself the (*,G) entry.
        let Some(wc) = self.wc_of(mre) else {
            return MifSet::new();
        };
        let mut result = MifSet::new();
        for vif_index in wc.local_include.iter() {
            if (ctx.i_am_dr(vif_index)
                && !wc.assert.i_am_loser.contains(vif_index))
                || wc.assert.i_am_winner.contains(vif_index)
            {
                result.set(vif_index);
            }
        }
        result
    }

    pub(crate) fn pim_include_sg(&self, ctx: &OlistCtx<'_>, sg: &Mre) -> MifSet {
        let mut result = MifSet::new();
        for vif_index in sg.local_include.iter() {
            if (ctx.i_am_dr(vif_index)
                && !sg.assert.i_am_loser.contains(vif_index))
                || sg.assert.i_am_winner.contains(vif_index)
            {
                result.set(vif_index);
            }
        }
        result
    }

    pub(crate) fn pim_exclude_sg(&self, ctx: &OlistCtx<'_>, sg: &Mre) -> MifSet {
        let wc_loser = self
            .wc_of(sg)
            .map(|wc| wc.assert.i_am_loser)
            .unwrap_or_default();
        let wc_winner = self
            .wc_of(sg)
            .map(|wc| wc.assert.i_am_winner)
            .unwrap_or_default();
        let mut result = MifSet::new();
        for vif_index in sg.local_exclude.iter() {
            if (ctx.i_am_dr(vif_index) && !wc_loser.contains(vif_index))
                || wc_winner.contains(vif_index)
            {
                result.set(vif_index);
            }
        }
        result
    }

    // ===== olists =====

    // immediate_olist(*,*,RP) = joins(*,*,RP).
    // immediate_olist(*,G) = joins(*,G) (+) pim_include(*,G)
    //                        (-) lost_assert(*,G).
    // immediate_olist(S,G) = joins(S,G) (+) pim_include(S,G)
    //                        (-) lost_assert(S,G).
    pub(crate) fn immediate_olist(
        &self,
        ctx: &OlistCtx<'_>,
        mre: &Mre,
    ) -> MifSet {
        match mre.mre_type {
            crate::mrt::MreType::Rp => mre.joins(),
            crate::mrt::MreType::Wc => mre
                .joins()
                .union(self.pim_include_wc(ctx, mre))
                .difference(mre.assert.i_am_loser),
            crate::mrt::MreType::Sg => mre
                .joins()
                .union(self.pim_include_sg(ctx, mre))
                .difference(mre.assert.i_am_loser),
            // (S,G,rpt) entries have no immediate olist of their own.
            crate::mrt::MreType::SgRpt => MifSet::new(),
        }
    }

    // inherited_olist(S,G,rpt), evaluated for an (S,G) or (S,G,rpt)
    // entry.
    pub(crate) fn inherited_olist_sg_rpt(
        &self,
        ctx: &OlistCtx<'_>,
        mre: &Mre,
    ) -> MifSet {
        let prunes_sg_rpt = self
            .sg_rpt_of(mre)
            .map(|sg_rpt| sg_rpt.prunes())
            .unwrap_or_default();
        let lost_assert_wc = self
            .wc_of(mre)
            .map(|wc| wc.assert.i_am_loser)
            .unwrap_or_default();
        let lost_assert_sg_rpt = self
            .sg_rpt_of(mre)
            .map(|sg_rpt| sg_rpt.assert.i_am_loser)
            .unwrap_or_default();

        let rpt_joins = self
            .joins_rp_of(mre)
            .union(self.joins_wc_of(mre))
            .difference(prunes_sg_rpt);
        let includes = self
            .pim_include_wc(ctx, mre)
            .difference(self.pim_exclude_sg(ctx, mre));

        rpt_joins
            .union(includes)
            .difference(lost_assert_wc.union(lost_assert_sg_rpt))
    }

    // inherited_olist(S,G) = inherited_olist(S,G,rpt)
    //                        (+) joins(S,G) (+) pim_include(S,G)
    //                        (-) lost_assert(S,G).
    pub(crate) fn inherited_olist_sg(
        &self,
        ctx: &OlistCtx<'_>,
        sg: &Mre,
    ) -> MifSet {
        self.inherited_olist_sg_rpt(ctx, sg).union(
            sg.joins()
                .union(self.pim_include_sg(ctx, sg))
                .difference(sg.assert.i_am_loser),
        )
    }

    // The outgoing interfaces installed into the kernel for (S,G),
    // including the Register pseudo-vif while the DR is registering.
    pub(crate) fn mfc_olist_sg(&self, ctx: &OlistCtx<'_>, sg: &Mre) -> MifSet {
        let mut olist = self.inherited_olist_sg(ctx, sg);
        if sg.register_state == crate::mrt::RegisterState::Join
            && let Some(register_vif) = ctx.register_vif_index
        {
            olist.set(register_vif);
        }
        // Never forward back out the incoming interface.
        if let Some(iif) = self.mfc_iif_sg(sg) {
            olist.clear(iif);
        }
        olist
    }

    // The kernel iif for (S,G): toward the source once the SPT bit is
    // set, else toward the RP.
    pub(crate) fn mfc_iif_sg(&self, sg: &Mre) -> Option<VifIndex> {
        if sg.spt_bit() || sg.flags.contains(super::MreFlags::I_AM_RP) {
            sg.rpf_interface_s()
        } else {
            sg.rpf_interface_rp()
        }
    }

    // ===== join-desire macros =====

    pub(crate) fn join_desired_rp(&self, mre: &Mre) -> bool {
        !mre.joins().is_empty()
    }

    pub(crate) fn join_desired_wc(&self, ctx: &OlistCtx<'_>, wc: &Mre) -> bool {
        !self.immediate_olist(ctx, wc).is_empty()
    }

    pub(crate) fn join_desired_sg(&self, ctx: &OlistCtx<'_>, sg: &Mre) -> bool {
        !self.immediate_olist(ctx, sg).is_empty()
            || (sg.keepalive_timer.is_some()
                && !self.inherited_olist_sg(ctx, sg).is_empty())
    }

    pub(crate) fn rpt_join_desired(&self, ctx: &OlistCtx<'_>, mre: &Mre) -> bool {
        let wc_desired = self
            .wc_of(mre)
            .map(|wc| self.join_desired_wc(ctx, wc))
            .unwrap_or(false);
        let rp_desired = self
            .rp_entry_of(mre)
            .map(|rp| self.join_desired_rp(rp))
            .unwrap_or(false);
        wc_desired || rp_desired
    }

    // PruneDesired(S,G,rpt).
    pub(crate) fn prune_desired_sg_rpt(
        &self,
        ctx: &OlistCtx<'_>,
        sg_rpt: &Mre,
    ) -> bool {
        if !self.rpt_join_desired(ctx, sg_rpt) {
            return false;
        }
        if self.inherited_olist_sg_rpt(ctx, sg_rpt).is_empty() {
            return true;
        }
        // SPT-switched flows prune themselves off the shared tree when
        // the two upstream paths diverge.
        if let Some(sg) = self.sg_of(sg_rpt)
            && sg.spt_bit()
            && sg.rpfp_nbr_sg != sg_rpt.rpfp_nbr_sg_rpt
        {
            return true;
        }
        false
    }

    // ===== assert macros =====

    pub(crate) fn could_assert_sg(
        &self,
        ctx: &OlistCtx<'_>,
        sg: &Mre,
        vif_index: VifIndex,
    ) -> bool {
        if !sg.spt_bit() || sg.rpf_interface_s() == Some(vif_index) {
            return false;
        }
        let prunes_sg_rpt = self
            .sg_rpt_of(sg)
            .map(|sg_rpt| sg_rpt.prunes())
            .unwrap_or_default();
        let lost_assert_wc = self
            .wc_of(sg)
            .map(|wc| wc.assert.i_am_loser)
            .unwrap_or_default();
        let olist = self
            .joins_rp_of(sg)
            .union(self.joins_wc_of(sg))
            .difference(prunes_sg_rpt)
            .union(
                self.pim_include_wc(ctx, sg)
                    .difference(self.pim_exclude_sg(ctx, sg)),
            )
            .difference(lost_assert_wc)
            .union(sg.joins())
            .union(self.pim_include_sg(ctx, sg));
        olist.contains(vif_index)
    }

    pub(crate) fn could_assert_wc(
        &self,
        ctx: &OlistCtx<'_>,
        wc: &Mre,
        vif_index: VifIndex,
    ) -> bool {
        if wc.rpf_interface_rp() == Some(vif_index) {
            return false;
        }
        let olist = self
            .joins_rp_of(wc)
            .union(wc.joins())
            .union(self.pim_include_wc(ctx, wc));
        olist.contains(vif_index)
    }

    pub(crate) fn assert_tracking_desired_sg(
        &self,
        ctx: &OlistCtx<'_>,
        sg: &Mre,
        vif_index: VifIndex,
    ) -> bool {
        let prunes_sg_rpt = self
            .sg_rpt_of(sg)
            .map(|sg_rpt| sg_rpt.prunes())
            .unwrap_or_default();
        let lost_assert_wc = self
            .wc_of(sg)
            .map(|wc| wc.assert.i_am_loser)
            .unwrap_or_default();
        let downstream_wants = self
            .joins_rp_of(sg)
            .union(self.joins_wc_of(sg))
            .difference(prunes_sg_rpt)
            .union(
                self.pim_include_wc(ctx, sg)
                    .difference(self.pim_exclude_sg(ctx, sg)),
            )
            .difference(lost_assert_wc)
            .union(sg.joins());
        if downstream_wants.contains(vif_index) {
            return true;
        }
        if sg.local_include.contains(vif_index)
            && (ctx.i_am_dr(vif_index)
                || sg.assert.i_am_winner.contains(vif_index))
        {
            return true;
        }
        if sg.rpf_interface_s() == Some(vif_index)
            && self.join_desired_sg(ctx, sg)
        {
            return true;
        }
        if sg.rpf_interface_rp() == Some(vif_index)
            && !sg.spt_bit()
            && self
                .wc_of(sg)
                .map(|wc| self.join_desired_wc(ctx, wc))
                .unwrap_or(false)
        {
            return true;
        }
        false
    }

    pub(crate) fn assert_tracking_desired_wc(
        &self,
        ctx: &OlistCtx<'_>,
        wc: &Mre,
        vif_index: VifIndex,
    ) -> bool {
        let downstream_wants = self
            .joins_rp_of(wc)
            .union(wc.joins())
            .union(self.pim_include_wc(ctx, wc));
        if downstream_wants.contains(vif_index) {
            return true;
        }
        if wc.local_include.contains(vif_index)
            && (ctx.i_am_dr(vif_index)
                || wc.assert.i_am_winner.contains(vif_index))
        {
            return true;
        }
        wc.rpf_interface_rp() == Some(vif_index)
            && self.rpt_join_desired(ctx, wc)
    }

    // An (S,G) entry whose upstream is Joined keeps the flow alive.
    pub(crate) fn keepalive_desired(&self, ctx: &OlistCtx<'_>, sg: &Mre) -> bool {
        sg.upstream_state == UpstreamState::Joined
            || !self.inherited_olist_sg(ctx, sg).is_empty()
    }
}
