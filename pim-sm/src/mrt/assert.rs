//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

//! Per-interface Assert state machines.

use std::net::IpAddr;
use std::time::Duration;

use pim_utils::mfea::VifIndex;

use crate::consts::{ASSERT_RATE_LIMIT_SECS, ASSERT_TIME};
use crate::debug::Debug;
use crate::instance::Instance;
use crate::mrt::olist::OlistCtx;
use crate::mrt::{MreIndex, MreType, task, upstream};
use crate::packet::assert::{AssertMetric, AssertMsg};
use crate::packet::{EncodedGroup, Packet};
use crate::tasks;
use crate::tasks::messages::input::MreTimerKind;

// Our assert metric for an (S,G) entry: the unicast routing metric
// toward the source.
pub(crate) fn my_metric_sg(
    instance: &Instance,
    mre_idx: MreIndex,
) -> Option<AssertMetric> {
    let mre = instance.state.mrt.get(mre_idx)?;
    let mrib = mre.mrib_s.as_ref()?;
    let (_, iface) = instance
        .state
        .interfaces
        .get_by_vif_index(&instance.arenas.interfaces, mrib.vif_index)?;
    let addr = iface.state.primary_addr?;
    Some(AssertMetric::new(
        false,
        mrib.metric_preference,
        mrib.metric,
        addr,
    ))
}

// Our assert metric for a (*,G) entry: the metric toward the RP, with
// the RPT bit set.
pub(crate) fn my_metric_wc(
    instance: &Instance,
    mre_idx: MreIndex,
) -> Option<AssertMetric> {
    let mre = instance.state.mrt.get(mre_idx)?;
    let mrib = mre.mrib_rp.as_ref()?;
    let (_, iface) = instance
        .state
        .interfaces
        .get_by_vif_index(&instance.arenas.interfaces, mrib.vif_index)?;
    let addr = iface.state.primary_addr?;
    Some(AssertMetric::new(
        true,
        mrib.metric_preference,
        mrib.metric,
        addr,
    ))
}

// Data arrived for (S,G) on an interface in its olist (WRONGVIF): when
// we could assert, we must.
pub(crate) fn wrong_iif_data_arrived_sg(
    instance: &mut Instance,
    mre_idx: MreIndex,
    vif_index: VifIndex,
) {
    let could_assert = {
        let state = &instance.state;
        let Some(mre) = state.mrt.get(mre_idx) else {
            return;
        };
        let ctx = OlistCtx::new(
            &state.interfaces,
            &instance.arenas.interfaces,
            state.register_vif_index,
        );
        state.mrt.could_assert_sg(&ctx, mre, vif_index)
    };
    if !could_assert {
        return;
    }
    send_assert(instance, mre_idx, vif_index, /* become winner */ true);
}

// Processes a received Assert for one matching entry.
pub(crate) fn process_assert(
    instance: &mut Instance,
    mre_idx: MreIndex,
    vif_index: VifIndex,
    src: IpAddr,
    msg: &AssertMsg,
) {
    let received = msg.metric(src);

    let (my_metric, could_assert, i_am_winner, i_am_loser) = {
        let state = &instance.state;
        let Some(mre) = state.mrt.get(mre_idx) else {
            return;
        };
        let ctx = OlistCtx::new(
            &state.interfaces,
            &instance.arenas.interfaces,
            state.register_vif_index,
        );
        let (my_metric, could_assert) = match mre.mre_type {
            MreType::Sg => (
                my_metric_sg(instance, mre_idx),
                state.mrt.could_assert_sg(&ctx, mre, vif_index),
            ),
            MreType::Wc => (
                my_metric_wc(instance, mre_idx),
                state.mrt.could_assert_wc(&ctx, mre, vif_index),
            ),
            _ => return,
        };
        (
            my_metric,
            could_assert,
            mre.assert.i_am_winner.contains(vif_index),
            mre.assert.i_am_loser.contains(vif_index),
        )
    };

    // An AssertCancel releases the loser.
    if received.is_assert_cancel() {
        if i_am_loser {
            clear_assert_state(instance, mre_idx, vif_index);
            task::entry_state_changed(instance, mre_idx);
        }
        return;
    }

    let Some(my_metric) = my_metric else {
        // Without a route we can only track the winner.
        become_loser(instance, mre_idx, vif_index, received);
        return;
    };

    if received.is_better(&my_metric) {
        // The peer wins.
        if !i_am_loser || better_than_stored(instance, mre_idx, vif_index, &received)
        {
            become_loser(instance, mre_idx, vif_index, received);
        } else {
            refresh_assert_timer(instance, mre_idx, vif_index);
        }
    } else if could_assert || i_am_winner {
        // We win; answer with our own Assert (rate limited).
        send_assert(instance, mre_idx, vif_index, true);
    }
}

fn better_than_stored(
    instance: &Instance,
    mre_idx: MreIndex,
    vif_index: VifIndex,
    received: &AssertMetric,
) -> bool {
    instance
        .state
        .mrt
        .get(mre_idx)
        .and_then(|mre| mre.assert.winner_metrics.get(&vif_index))
        .map(|stored| received.is_better(stored) || received.addr == stored.addr)
        .unwrap_or(true)
}

// Assert timer fired: the assert state on the interface dissolves.
pub(crate) fn assert_timer_expired(
    instance: &mut Instance,
    mre_idx: MreIndex,
    vif_index: VifIndex,
) {
    clear_assert_state(instance, mre_idx, vif_index);
    upstream::update_rpf(instance, mre_idx);
    task::entry_state_changed(instance, mre_idx);
}

pub(crate) fn rate_limit_expired(
    instance: &mut Instance,
    mre_idx: MreIndex,
    vif_index: VifIndex,
) {
    if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
        mre.assert.rate_limit.clear(vif_index);
        mre.assert.rate_limit_timers.remove(&vif_index);
    }
}

// ===== transitions =====

fn become_loser(
    instance: &mut Instance,
    mre_idx: MreIndex,
    vif_index: VifIndex,
    winner: AssertMetric,
) {
    let timer = assert_timer(instance, mre_idx, vif_index);
    if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
        Debug::AssertLoser(&mre.source, &mre.group, vif_index, &winner.addr)
            .log();
        mre.assert.i_am_winner.clear(vif_index);
        mre.assert.i_am_loser.set(vif_index);
        mre.assert.winner_metrics.insert(vif_index, winner);
        if let Some(timer) = timer {
            mre.assert.timers.insert(vif_index, timer);
        }
    }
    // Losing an assert moves RPF' to the winner.
    upstream::update_rpf(instance, mre_idx);
    task::entry_state_changed(instance, mre_idx);
}

fn clear_assert_state(
    instance: &mut Instance,
    mre_idx: MreIndex,
    vif_index: VifIndex,
) {
    if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
        mre.assert.i_am_winner.clear(vif_index);
        mre.assert.i_am_loser.clear(vif_index);
        mre.assert.winner_metrics.remove(&vif_index);
        mre.assert.timers.remove(&vif_index);
    }
}

fn refresh_assert_timer(
    instance: &mut Instance,
    mre_idx: MreIndex,
    vif_index: VifIndex,
) {
    if let Some(mre) = instance.state.mrt.get_mut(mre_idx)
        && let Some(timer) = mre.assert.timers.get_mut(&vif_index)
    {
        timer.reset(None);
    }
}

// Sends an Assert for the entry on the vif, subject to the per-vif
// rate limit, and installs the winner state.
pub(crate) fn send_assert(
    instance: &mut Instance,
    mre_idx: MreIndex,
    vif_index: VifIndex,
    become_winner: bool,
) {
    let rate_limited = instance
        .state
        .mrt
        .get(mre_idx)
        .map(|mre| mre.assert.rate_limit.contains(vif_index))
        .unwrap_or(true);
    if rate_limited {
        return;
    }

    let (metric, group, source, rpt_bit) = {
        let Some(mre) = instance.state.mrt.get(mre_idx) else {
            return;
        };
        let metric = match mre.mre_type {
            MreType::Sg => my_metric_sg(instance, mre_idx),
            MreType::Wc => my_metric_wc(instance, mre_idx),
            _ => None,
        };
        let Some(metric) = metric else {
            return;
        };
        let source = match mre.mre_type {
            MreType::Sg => mre.source,
            // A (*,G) assert carries the RP as the source with the RPT
            // bit set.
            _ => match mre.rp_addr {
                Some(rp_addr) => rp_addr,
                None => return,
            },
        };
        (metric, mre.group, source, mre.is_wc())
    };

    let packet = Packet::Assert(AssertMsg {
        group: EncodedGroup::group(group),
        source,
        rpt_bit,
        metric_preference: metric.metric_preference,
        metric: metric.metric,
    });
    upstream::send_on_vif(instance, vif_index, packet);

    let assert_timer = assert_timer(instance, mre_idx, vif_index);
    let rate_timer = rate_limit_timer(instance, mre_idx, vif_index);
    if let Some(mre) = instance.state.mrt.get_mut(mre_idx) {
        Debug::AssertWinner(&mre.source, &mre.group, vif_index).log();
        mre.assert.rate_limit.set(vif_index);
        if let Some(rate_timer) = rate_timer {
            mre.assert.rate_limit_timers.insert(vif_index, rate_timer);
        }
        if become_winner {
            mre.assert.i_am_winner.set(vif_index);
            mre.assert.i_am_loser.clear(vif_index);
            mre.assert.winner_metrics.insert(vif_index, metric);
            if let Some(assert_timer) = assert_timer {
                mre.assert.timers.insert(vif_index, assert_timer);
            }
        }
    }
}

// Sends an AssertCancel when we stop being able to assert on a vif.
pub(crate) fn send_assert_cancel(
    instance: &mut Instance,
    mre_idx: MreIndex,
    vif_index: VifIndex,
) {
    let (group, source, my_addr) = {
        let Some(mre) = instance.state.mrt.get(mre_idx) else {
            return;
        };
        let Some(my_addr) = instance
            .state
            .interfaces
            .get_by_vif_index(&instance.arenas.interfaces, vif_index)
            .and_then(|(_, iface)| iface.state.primary_addr)
        else {
            return;
        };
        let source = match mre.mre_type {
            MreType::Sg => mre.source,
            _ => match mre.rp_addr {
                Some(rp_addr) => rp_addr,
                None => return,
            },
        };
        (mre.group, source, my_addr)
    };

    let cancel = AssertMetric::infinite(my_addr);
    let packet = Packet::Assert(AssertMsg {
        group: EncodedGroup::group(group),
        source,
        rpt_bit: cancel.rpt_bit,
        metric_preference: cancel.metric_preference,
        metric: cancel.metric,
    });
    upstream::send_on_vif(instance, vif_index, packet);
    clear_assert_state(instance, mre_idx, vif_index);
}

// ===== timers =====

fn assert_timer(
    instance: &mut Instance,
    mre_idx: MreIndex,
    vif_index: VifIndex,
) -> Option<pim_utils::task::TimeoutTask> {
    let key = instance.state.mrt.get(mre_idx)?.key();
    let (view, _) = instance.as_up()?;
    Some(tasks::mre_timer(
        &view,
        key,
        MreTimerKind::Assert(vif_index),
        Duration::from_secs(ASSERT_TIME as u64),
    ))
}

fn rate_limit_timer(
    instance: &mut Instance,
    mre_idx: MreIndex,
    vif_index: VifIndex,
) -> Option<pim_utils::task::TimeoutTask> {
    let key = instance.state.mrt.get(mre_idx)?.key();
    let (view, _) = instance.as_up()?;
    Some(tasks::mre_timer(
        &view,
        key,
        MreTimerKind::AssertRateLimit(vif_index),
        Duration::from_secs(ASSERT_RATE_LIMIT_SECS as u64),
    ))
}
