//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

//! Bootstrap Router election and Candidate-RP advertisement.

use std::net::IpAddr;
use std::time::Duration;

use ipnetwork::IpNetwork;
use pim_utils::ip::IpNetworkExt;
use pim_utils::mfea::VifIndex;
use pim_utils::task::{IntervalTask, TimeoutTask};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::consts::{
    BOOTSTRAP_PERIOD, BOOTSTRAP_TIMEOUT, CAND_RP_ADV_PERIOD,
    CAND_RP_HOLDTIME, SCOPE_ZONE_TIMEOUT,
};
use crate::debug::Debug;
use crate::error::Error;
use crate::instance::Instance;
use crate::packet::Packet;
use crate::packet::bootstrap::{
    BootstrapGroupPrefix, BootstrapMsg, BootstrapRp, CandRpAdvMsg,
};
use crate::packet::EncodedGroup;
use crate::rp::{Rp, RpOrigin, ScopeZoneId, default_hash_mask_len};
use crate::tasks;
use crate::{events, mrt};

// Per-zone Candidate-BSR machine states; the last three apply to
// routers not configured as candidates.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum BsrZoneState {
    #[default]
    Init,
    CandidateBsr,
    PendingBsr,
    ElectedBsr,
    NoInfo,
    AcceptAny,
    AcceptPreferred,
}

// One RP within a zone's RP-set.
#[derive(Debug)]
pub struct BsrRp {
    pub addr: IpAddr,
    pub priority: u8,
    pub holdtime: u16,
    // Set when this RP is our own Candidate-RP configuration.
    pub my_vif_index: Option<VifIndex>,
    pub expiry_timer: Option<TimeoutTask>,
}

// One group prefix of a zone's RP-set.
#[derive(Debug)]
pub struct BsrGroupPrefix {
    pub group_prefix: IpNetwork,
    pub is_scope_zone: bool,
    pub expected_rp_count: u8,
    pub rps: Vec<BsrRp>,
    pub remove_timer: Option<TimeoutTask>,
}

// One BSR zone: the elected-BSR state plus the RP-set it distributes.
#[derive(Debug)]
pub struct BsrZone {
    pub zone_id: ScopeZoneId,
    pub bsr_addr: Option<IpAddr>,
    pub bsr_priority: u8,
    pub hash_mask_len: u8,
    pub fragment_tag: u16,
    // Candidate-BSR configuration, when present.
    pub my_bsr_addr: Option<IpAddr>,
    pub my_bsr_priority: u8,
    pub my_vif_index: Option<VifIndex>,
    pub state: BsrZoneState,
    pub bsr_timer: Option<TimeoutTask>,
    pub scope_zone_expiry_timer: Option<TimeoutTask>,
    pub crp_adv_timer: Option<IntervalTask>,
    pub group_prefixes: Vec<BsrGroupPrefix>,
}

// Candidate-BSR and Candidate-RP state, per zone.
#[derive(Debug, Default)]
pub struct Bsr {
    pub config_zones: Vec<BsrZone>,
    pub active_zones: Vec<BsrZone>,
    pub expire_zones: Vec<BsrZone>,
    next_fragment_tag: u16,
}

// ===== impl BsrZone =====

impl BsrZone {
    fn new(zone_id: ScopeZoneId, hash_mask_len: u8) -> BsrZone {
        BsrZone {
            zone_id,
            bsr_addr: None,
            bsr_priority: 0,
            hash_mask_len,
            fragment_tag: 0,
            my_bsr_addr: None,
            my_bsr_priority: 0,
            my_vif_index: None,
            state: BsrZoneState::default(),
            bsr_timer: None,
            scope_zone_expiry_timer: None,
            crp_adv_timer: None,
            group_prefixes: Vec::new(),
        }
    }

    pub fn is_cand_bsr(&self) -> bool {
        self.my_bsr_addr.is_some()
    }

    // Our Candidate-RP prefixes within this zone.
    fn my_cand_rp_prefixes(&self) -> Vec<(IpNetwork, bool, IpAddr, u8, u16)> {
        self.group_prefixes
            .iter()
            .flat_map(|group_prefix| {
                group_prefix
                    .rps
                    .iter()
                    .filter(|rp| rp.my_vif_index.is_some())
                    .map(move |rp| {
                        (
                            group_prefix.group_prefix,
                            group_prefix.is_scope_zone,
                            rp.addr,
                            rp.priority,
                            rp.holdtime,
                        )
                    })
            })
            .collect()
    }

    fn find_prefix_mut(
        &mut self,
        group_prefix: &IpNetwork,
    ) -> Option<&mut BsrGroupPrefix> {
        self.group_prefixes
            .iter_mut()
            .find(|entry| entry.group_prefix == *group_prefix)
    }

    // (priority desc, address desc) comparison of two BSR candidacies.
    fn is_better_bsr(
        priority_a: u8,
        addr_a: IpAddr,
        priority_b: u8,
        addr_b: IpAddr,
    ) -> bool {
        (priority_a, addr_a) > (priority_b, addr_b)
    }
}

// ===== impl Bsr =====

impl Bsr {
    fn zone_mut(
        zones: &mut Vec<BsrZone>,
        zone_id: ScopeZoneId,
        hash_mask_len: u8,
    ) -> &mut BsrZone {
        if let Some(pos) = zones
            .iter()
            .position(|zone| zone.zone_id == zone_id)
        {
            return &mut zones[pos];
        }
        zones.push(BsrZone::new(zone_id, hash_mask_len));
        zones.last_mut().unwrap()
    }

    fn find_active(&self, zone_id: &ScopeZoneId) -> Option<&BsrZone> {
        self.active_zones
            .iter()
            .find(|zone| zone.zone_id == *zone_id)
    }

    fn find_active_mut(
        &mut self,
        zone_id: &ScopeZoneId,
    ) -> Option<&mut BsrZone> {
        self.active_zones
            .iter_mut()
            .find(|zone| zone.zone_id == *zone_id)
    }

    fn find_config_mut(
        &mut self,
        zone_id: &ScopeZoneId,
    ) -> Option<&mut BsrZone> {
        self.config_zones
            .iter_mut()
            .find(|zone| zone.zone_id == *zone_id)
    }

    fn next_fragment_tag(&mut self) -> u16 {
        self.next_fragment_tag = self.next_fragment_tag.wrapping_add(1);
        if self.next_fragment_tag == 0 {
            self.next_fragment_tag = 1;
        }
        self.next_fragment_tag
    }
}

// ===== configuration =====

pub(crate) fn add_config_cand_bsr(
    instance: &mut Instance,
    zone_id: ScopeZoneId,
    my_vif_index: VifIndex,
    my_bsr_addr: IpAddr,
    priority: u8,
    hash_mask_len: u8,
) -> Result<(), Error> {
    // Scoped zones must not overlap.
    if zone_id.is_scope_zone {
        for zone in &instance.state.bsr.config_zones {
            if zone.zone_id.is_scope_zone
                && zone.zone_id != zone_id
                && zone.zone_id.prefix.is_overlap(&zone_id.prefix)
            {
                return Err(Error::ScopeZoneOverlap(
                    zone_id.prefix,
                    zone.zone_id.prefix,
                ));
            }
        }
        instance.state.scope_zones.add_zone(zone_id)?;
    }

    let zone = Bsr::zone_mut(
        &mut instance.state.bsr.config_zones,
        zone_id,
        hash_mask_len,
    );
    zone.my_bsr_addr = Some(my_bsr_addr);
    zone.my_bsr_priority = priority;
    zone.my_vif_index = Some(my_vif_index);
    zone.hash_mask_len = hash_mask_len;

    if instance.state.active {
        start_cand_bsr(instance, zone_id);
    }
    Ok(())
}

pub(crate) fn delete_config_cand_bsr(
    instance: &mut Instance,
    zone_id: ScopeZoneId,
) -> Result<(), Error> {
    let Some(zone) = instance.state.bsr.find_config_mut(&zone_id) else {
        return Err(Error::CandBsrNotFound(zone_id.prefix));
    };
    zone.my_bsr_addr = None;
    zone.my_vif_index = None;
    zone.my_bsr_priority = 0;
    zone.bsr_timer = None;
    zone.state = BsrZoneState::NoInfo;
    if zone_id.is_scope_zone {
        instance.state.scope_zones.delete_zone(&zone_id);
    }
    Ok(())
}

pub(crate) fn add_config_cand_rp(
    instance: &mut Instance,
    group_prefix: IpNetwork,
    is_scope_zone: bool,
    my_vif_index: VifIndex,
    rp_addr: IpAddr,
    priority: u8,
    holdtime: u16,
) -> Result<(), Error> {
    let zone_id = if is_scope_zone {
        ScopeZoneId {
            prefix: group_prefix,
            is_scope_zone: true,
        }
    } else {
        ScopeZoneId::global(instance.af)
    };
    let hash_mask_len = default_hash_mask_len(instance.af);
    let zone = Bsr::zone_mut(
        &mut instance.state.bsr.config_zones,
        zone_id,
        hash_mask_len,
    );

    let entry = match zone.find_prefix_mut(&group_prefix) {
        Some(entry) => entry,
        None => {
            zone.group_prefixes.push(BsrGroupPrefix {
                group_prefix,
                is_scope_zone,
                expected_rp_count: 0,
                rps: Vec::new(),
                remove_timer: None,
            });
            zone.group_prefixes.last_mut().unwrap()
        }
    };
    match entry.rps.iter_mut().find(|rp| rp.addr == rp_addr) {
        Some(rp) => {
            rp.priority = priority;
            rp.holdtime = holdtime;
            rp.my_vif_index = Some(my_vif_index);
        }
        None => entry.rps.push(BsrRp {
            addr: rp_addr,
            priority,
            holdtime,
            my_vif_index: Some(my_vif_index),
            expiry_timer: None,
        }),
    }

    if instance.state.active {
        start_cand_rp(instance, zone_id);
    }
    Ok(())
}

pub(crate) fn delete_config_cand_rp(
    instance: &mut Instance,
    group_prefix: IpNetwork,
    rp_addr: IpAddr,
) -> Result<(), Error> {
    let mut found = false;
    for zone in &mut instance.state.bsr.config_zones {
        if let Some(entry) = zone.find_prefix_mut(&group_prefix) {
            let old_len = entry.rps.len();
            entry.rps.retain(|rp| rp.addr != rp_addr);
            found |= entry.rps.len() != old_len;
        }
        zone.group_prefixes.retain(|entry| !entry.rps.is_empty());
    }
    if !found {
        return Err(Error::CandRpNotFound(group_prefix, rp_addr));
    }
    Ok(())
}

// ===== instance lifecycle =====

// Starts every configured zone when the instance comes up.
pub(crate) fn start(instance: &mut Instance) {
    let zone_ids = instance
        .state
        .bsr
        .config_zones
        .iter()
        .map(|zone| zone.zone_id)
        .collect::<Vec<_>>();
    for zone_id in zone_ids {
        start_cand_bsr(instance, zone_id);
        start_cand_rp(instance, zone_id);
    }
}

fn start_cand_bsr(instance: &mut Instance, zone_id: ScopeZoneId) {
    let is_cand = instance
        .state
        .bsr
        .find_config_mut(&zone_id)
        .map(|zone| zone.is_cand_bsr())
        .unwrap_or(false);
    if !is_cand {
        return;
    }
    let timer = zone_bsr_timer(
        instance,
        zone_id,
        Duration::from_secs(BOOTSTRAP_TIMEOUT as u64),
    );
    if let Some(zone) = instance.state.bsr.find_config_mut(&zone_id)
        && zone.state == BsrZoneState::Init
    {
        Debug::BsrStateChange(
            "config",
            zone.state,
            BsrZoneState::PendingBsr,
        )
        .log();
        zone.state = BsrZoneState::PendingBsr;
        zone.bsr_timer = timer;
    }
}

fn start_cand_rp(instance: &mut Instance, zone_id: ScopeZoneId) {
    let has_cand_rp = instance
        .state
        .bsr
        .find_config_mut(&zone_id)
        .map(|zone| !zone.my_cand_rp_prefixes().is_empty())
        .unwrap_or(false);
    if !has_cand_rp {
        return;
    }
    let timer = {
        let Some((view, _)) = instance.as_up() else {
            return;
        };
        tasks::crp_adv_interval(
            &view,
            zone_id,
            Duration::from_secs(CAND_RP_ADV_PERIOD as u64),
        )
    };
    if let Some(zone) = instance.state.bsr.find_config_mut(&zone_id) {
        zone.crp_adv_timer = Some(timer);
    }
}

// Phase one of the instance shutdown: cancel our candidacies on the
// wire.
pub(crate) fn shutdown(instance: &mut Instance) {
    let zone_ids = instance
        .state
        .bsr
        .config_zones
        .iter()
        .map(|zone| zone.zone_id)
        .collect::<Vec<_>>();
    for zone_id in zone_ids {
        // Candidate-RP-Advertise with holdtime zero.
        let _ = send_cand_rp_adv_holdtime(instance, zone_id, 0);

        // Optionally cancel our BSR candidacy with a lowest-priority
        // Bootstrap.
        let elected = instance
            .state
            .bsr
            .find_config_mut(&zone_id)
            .map(|zone| zone.state == BsrZoneState::ElectedBsr)
            .unwrap_or(false);
        if elected && instance.config.bsm_cancel_on_shutdown {
            originate_bootstrap(instance, zone_id, Some(0));
        }
    }
}

// ===== Bootstrap origination =====

// Builds and floods a Bootstrap message carrying the zone's RP-set.
pub(crate) fn originate_bootstrap(
    instance: &mut Instance,
    zone_id: ScopeZoneId,
    priority_override: Option<u8>,
) {
    let fragment_tag = instance.state.bsr.next_fragment_tag();
    let Some(zone) = instance.state.bsr.find_config_mut(&zone_id) else {
        return;
    };
    let Some(bsr_addr) = zone.my_bsr_addr else {
        return;
    };
    zone.fragment_tag = fragment_tag;

    let group_prefixes = zone
        .group_prefixes
        .iter()
        .map(|entry| BootstrapGroupPrefix {
            group_prefix: EncodedGroup {
                prefix: entry.group_prefix,
                is_bidir: false,
                is_scope_zone: entry.is_scope_zone,
            },
            rp_count: entry.rps.len() as u8,
            rps: entry
                .rps
                .iter()
                .map(|rp| BootstrapRp {
                    addr: rp.addr,
                    holdtime: rp.holdtime,
                    priority: rp.priority,
                })
                .collect(),
        })
        .collect();

    let msg = BootstrapMsg {
        fragment_tag,
        hash_mask_len: zone.hash_mask_len,
        bsr_priority: priority_override.unwrap_or(zone.my_bsr_priority),
        bsr_addr,
        group_prefixes,
    };
    flood_bootstrap(instance, &msg, None);
}

// Sends a Bootstrap on every active vif except the one it came from.
fn flood_bootstrap(
    instance: &mut Instance,
    msg: &BootstrapMsg,
    skip_vif: Option<VifIndex>,
) {
    let vifs = instance
        .state
        .interfaces
        .iter(&instance.arenas.interfaces)
        .filter(|iface| {
            iface.state.active
                && !iface.is_pim_register()
                && Some(iface.vif_index) != skip_vif
        })
        .map(|iface| iface.vif_index)
        .collect::<Vec<_>>();
    for vif_index in vifs {
        mrt::upstream::send_on_vif(
            instance,
            vif_index,
            Packet::Bootstrap(msg.clone()),
        );
    }
}

// ===== timers =====

pub(crate) fn process_bsr_timer(
    instance: &mut Instance,
    zone_id: ScopeZoneId,
) -> Result<(), Error> {
    let state = instance
        .state
        .bsr
        .find_config_mut(&zone_id)
        .map(|zone| zone.state);
    match state {
        Some(BsrZoneState::PendingBsr) => {
            // Nobody better showed up: we are the BSR.
            transition(instance, zone_id, BsrZoneState::ElectedBsr);
            originate_bootstrap(instance, zone_id, None);
            rearm_bsr_timer(instance, zone_id, BOOTSTRAP_PERIOD as u64);
        }
        Some(BsrZoneState::ElectedBsr) => {
            originate_bootstrap(instance, zone_id, None);
            rearm_bsr_timer(instance, zone_id, BOOTSTRAP_PERIOD as u64);
        }
        Some(BsrZoneState::CandidateBsr) => {
            // The incumbent went quiet; race for the role again with a
            // randomized delay derived from our priority.
            transition(instance, zone_id, BsrZoneState::PendingBsr);
            let delay = rand::rng().random_range(5..=10);
            rearm_bsr_timer(instance, zone_id, delay);
        }
        _ => {
            // Non-candidate: the preferred BSR expired.
            if let Some(zone) =
                instance.state.bsr.find_active_mut(&zone_id)
            {
                zone.bsr_addr = None;
                zone.state = BsrZoneState::AcceptAny;
                zone.bsr_timer = None;
            }
        }
    }
    Ok(())
}

fn transition(
    instance: &mut Instance,
    zone_id: ScopeZoneId,
    new_state: BsrZoneState,
) {
    if let Some(zone) = instance.state.bsr.find_config_mut(&zone_id)
        && zone.state != new_state
    {
        Debug::BsrStateChange("config", zone.state, new_state).log();
        zone.state = new_state;
    }
}

fn rearm_bsr_timer(
    instance: &mut Instance,
    zone_id: ScopeZoneId,
    secs: u64,
) {
    let timer = zone_bsr_timer(instance, zone_id, Duration::from_secs(secs));
    if let Some(zone) = instance.state.bsr.find_config_mut(&zone_id) {
        zone.bsr_timer = timer;
    }
}

fn zone_bsr_timer(
    instance: &mut Instance,
    zone_id: ScopeZoneId,
    timeout: Duration,
) -> Option<TimeoutTask> {
    let (view, _) = instance.as_up()?;
    Some(tasks::bsr_timer(&view, zone_id, timeout))
}

// A scoped zone went silent.
pub(crate) fn process_zone_expiry(
    instance: &mut Instance,
    zone_id: ScopeZoneId,
) -> Result<(), Error> {
    // The expired zone is parked on the expire list with its timers
    // cancelled; its RP mappings leave the table at once.
    if let Some(pos) = instance
        .state
        .bsr
        .active_zones
        .iter()
        .position(|zone| zone.zone_id == zone_id)
    {
        let mut zone = instance.state.bsr.active_zones.remove(pos);
        zone.bsr_timer = None;
        zone.scope_zone_expiry_timer = None;
        instance
            .state
            .bsr
            .expire_zones
            .retain(|old| old.zone_id != zone_id);
        instance.state.bsr.expire_zones.push(zone);
    }
    instance
        .state
        .rp_table
        .clear_origin(RpOrigin::Bootstrap, &zone_id.prefix);
    events::rp_table_changed(instance, Some(zone_id.prefix));
    Ok(())
}

// ===== Bootstrap receive =====

pub(crate) fn process_bootstrap(
    instance: &mut Instance,
    vif_index: VifIndex,
    src: IpAddr,
    msg: &BootstrapMsg,
) -> Result<(), Error> {
    // RPF check: a flooded Bootstrap must arrive on the interface
    // toward the BSR it names.
    let rpf_ok = instance
        .state
        .mrib
        .lookup(&msg.bsr_addr)
        .map(|mrib| mrib.vif_index == vif_index)
        // Without a route we cannot validate; accept.
        .unwrap_or(true);
    let from_self = instance
        .state
        .interfaces
        .iter(&instance.arenas.interfaces)
        .any(|iface| iface.is_my_addr(&msg.bsr_addr));
    if from_self {
        // Our own flooded message came back.
        return Ok(());
    }
    if !rpf_ok {
        let ifname = instance
            .state
            .interfaces
            .get_by_vif_index(&instance.arenas.interfaces, vif_index)
            .map(|(_, iface)| iface.name.clone())
            .unwrap_or_default();
        if let Some((_, iface)) = instance
            .state
            .interfaces
            .get_mut_by_vif_index(&mut instance.arenas.interfaces, vif_index)
        {
            iface.state.errors.rx_bsr_not_rpf_interface += 1;
        }
        return Err(Error::BsrNotRpfInterface(ifname, src));
    }

    let zone_id = msg
        .group_prefixes
        .first()
        .filter(|entry| entry.group_prefix.is_scope_zone)
        .map(|entry| ScopeZoneId {
            prefix: entry.group_prefix.prefix,
            is_scope_zone: true,
        })
        .unwrap_or_else(|| ScopeZoneId::global(instance.af));

    // Compare against the current view of the zone.
    let (current_priority, current_addr, same_tag) = instance
        .state
        .bsr
        .find_active(&zone_id)
        .map(|zone| {
            (
                zone.bsr_priority,
                zone.bsr_addr,
                zone.fragment_tag == msg.fragment_tag
                    && zone.bsr_addr == Some(msg.bsr_addr),
            )
        })
        .unwrap_or((0, None, false));

    let acceptable = match current_addr {
        None => true,
        Some(current_addr) => {
            current_addr == msg.bsr_addr
                || BsrZone::is_better_bsr(
                    msg.bsr_priority,
                    msg.bsr_addr,
                    current_priority,
                    current_addr,
                )
        }
    };

    if !acceptable {
        // A worse BSR advertising itself: the elected BSR answers with
        // its own Bootstrap.
        let elected = instance
            .state
            .bsr
            .find_config_mut(&zone_id)
            .map(|zone| zone.state == BsrZoneState::ElectedBsr)
            .unwrap_or(false);
        if elected {
            originate_bootstrap(instance, zone_id, None);
        }
        if let Some((_, iface)) = instance
            .state
            .interfaces
            .get_mut_by_vif_index(&mut instance.arenas.interfaces, vif_index)
        {
            iface.state.errors.rx_bsr_when_bsr += 1;
        }
        return Ok(());
    }

    Debug::BsrRpSetStore(&msg.bsr_addr, msg.fragment_tag).log();

    // Candidate-BSR preemption: a better BSR silences us.
    let we_lost = instance
        .state
        .bsr
        .find_config_mut(&zone_id)
        .map(|zone| {
            zone.is_cand_bsr()
                && matches!(
                    zone.state,
                    BsrZoneState::PendingBsr | BsrZoneState::ElectedBsr
                )
                && BsrZone::is_better_bsr(
                    msg.bsr_priority,
                    msg.bsr_addr,
                    zone.my_bsr_priority,
                    zone.my_bsr_addr.unwrap_or(msg.bsr_addr),
                )
        })
        .unwrap_or(false);
    if we_lost {
        transition(instance, zone_id, BsrZoneState::CandidateBsr);
        rearm_bsr_timer(instance, zone_id, BOOTSTRAP_TIMEOUT as u64);
    }

    // Store or merge the RP-set.
    store_rp_set(instance, zone_id, msg, same_tag);

    // Track the accepted BSR.
    {
        let hash_mask_len = msg.hash_mask_len;
        let zone = Bsr::zone_mut(
            &mut instance.state.bsr.active_zones,
            zone_id,
            hash_mask_len,
        );
        zone.bsr_addr = Some(msg.bsr_addr);
        zone.bsr_priority = msg.bsr_priority;
        zone.hash_mask_len = msg.hash_mask_len;
        zone.fragment_tag = msg.fragment_tag;
        zone.state = BsrZoneState::AcceptPreferred;
    }
    let timer = zone_bsr_timer(
        instance,
        zone_id,
        Duration::from_secs(BOOTSTRAP_TIMEOUT as u64),
    );
    let scope_timer = if zone_id.is_scope_zone {
        let Some((view, _)) = instance.as_up() else {
            return Ok(());
        };
        Some(tasks::bsr_zone_expiry_timer(
            &view,
            zone_id,
            Duration::from_secs(SCOPE_ZONE_TIMEOUT as u64),
        ))
    } else {
        None
    };
    if let Some(zone) = instance.state.bsr.find_active_mut(&zone_id) {
        zone.bsr_timer = timer;
        if scope_timer.is_some() {
            zone.scope_zone_expiry_timer = scope_timer;
        }
    }

    // Forward to the other interfaces.
    flood_bootstrap(instance, msg, Some(vif_index));

    // Commit to the RP table.
    commit_rp_set(instance, zone_id);
    Ok(())
}

// Stores the message's RP-set into the active zone. Fragments sharing
// the tag are unioned; a new tag replaces the set.
fn store_rp_set(
    instance: &mut Instance,
    zone_id: ScopeZoneId,
    msg: &BootstrapMsg,
    merge: bool,
) {
    let crp_timeout = Duration::from_secs(CAND_RP_HOLDTIME as u64);
    let mut expiry_timers = Vec::new();
    for entry in &msg.group_prefixes {
        for rp in &entry.rps {
            let timeout = if rp.holdtime != 0 {
                Duration::from_secs(rp.holdtime as u64)
            } else {
                crp_timeout
            };
            expiry_timers.push((
                entry.group_prefix.prefix,
                rp.addr,
                expiry_timer(instance, zone_id, entry.group_prefix.prefix,
                    rp.addr, timeout),
            ));
        }
    }

    let hash_mask_len = msg.hash_mask_len;
    let zone = Bsr::zone_mut(
        &mut instance.state.bsr.active_zones,
        zone_id,
        hash_mask_len,
    );
    if !merge {
        zone.group_prefixes.clear();
    }
    for entry in &msg.group_prefixes {
        let group_prefix = entry.group_prefix.prefix;
        let slot = match zone.find_prefix_mut(&group_prefix) {
            Some(slot) => slot,
            None => {
                zone.group_prefixes.push(BsrGroupPrefix {
                    group_prefix,
                    is_scope_zone: entry.group_prefix.is_scope_zone,
                    expected_rp_count: entry.rp_count,
                    rps: Vec::new(),
                    remove_timer: None,
                });
                zone.group_prefixes.last_mut().unwrap()
            }
        };
        slot.expected_rp_count = entry.rp_count;
        for rp in &entry.rps {
            // The fragment union must not exceed the advertised count.
            if slot.rps.iter().all(|old| old.addr != rp.addr)
                && slot.rps.len() >= slot.expected_rp_count as usize
            {
                continue;
            }
            let timer = expiry_timers
                .iter_mut()
                .find(|(prefix, addr, _)| {
                    *prefix == group_prefix && *addr == rp.addr
                })
                .and_then(|(_, _, timer)| timer.take());
            match slot.rps.iter_mut().find(|old| old.addr == rp.addr) {
                Some(old) => {
                    old.priority = rp.priority;
                    old.holdtime = rp.holdtime;
                    old.expiry_timer = timer;
                }
                None => slot.rps.push(BsrRp {
                    addr: rp.addr,
                    priority: rp.priority,
                    holdtime: rp.holdtime,
                    my_vif_index: None,
                    expiry_timer: timer,
                }),
            }
        }
    }
}

fn expiry_timer(
    instance: &mut Instance,
    zone_id: ScopeZoneId,
    group_prefix: IpNetwork,
    rp_addr: IpAddr,
    timeout: Duration,
) -> Option<TimeoutTask> {
    let (view, _) = instance.as_up()?;
    Some(tasks::crp_expiry_timer(
        &view, zone_id, group_prefix, rp_addr, timeout,
    ))
}

// Rewrites the RP table from the zone's stored RP-set.
fn commit_rp_set(instance: &mut Instance, zone_id: ScopeZoneId) {
    instance
        .state
        .rp_table
        .clear_origin(RpOrigin::Bootstrap, &zone_id.prefix);
    let mappings = instance
        .state
        .bsr
        .find_active(&zone_id)
        .map(|zone| {
            zone.group_prefixes
                .iter()
                .flat_map(|entry| {
                    let hash_mask_len = zone.hash_mask_len;
                    entry.rps.iter().map(move |rp| {
                        (
                            entry.group_prefix,
                            hash_mask_len,
                            rp.addr,
                            rp.priority,
                            rp.holdtime,
                        )
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    for (group_prefix, hash_mask_len, addr, priority, holdtime) in mappings {
        instance.state.rp_table.add_rp(
            group_prefix,
            hash_mask_len,
            Rp {
                addr,
                priority,
                holdtime,
                origin: RpOrigin::Bootstrap,
            },
        );
    }
    events::rp_table_changed(instance, Some(zone_id.prefix));
}

// ===== Candidate-RP handling =====

// A Candidate-RP expired out of the RP-set.
pub(crate) fn process_crp_expiry(
    instance: &mut Instance,
    zone_id: ScopeZoneId,
    group_prefix: IpNetwork,
    rp_addr: IpAddr,
) -> Result<(), Error> {
    if let Some(zone) = instance.state.bsr.find_active_mut(&zone_id)
        && let Some(entry) = zone.find_prefix_mut(&group_prefix)
    {
        entry.rps.retain(|rp| rp.addr != rp_addr);
    }
    instance
        .state
        .rp_table
        .delete_rp(&group_prefix, &rp_addr, RpOrigin::Bootstrap);
    events::rp_table_changed(instance, Some(group_prefix));
    Ok(())
}

pub(crate) fn process_group_prefix_remove(
    instance: &mut Instance,
    zone_id: ScopeZoneId,
    group_prefix: IpNetwork,
) -> Result<(), Error> {
    if let Some(zone) = instance.state.bsr.find_active_mut(&zone_id) {
        zone.group_prefixes
            .retain(|entry| entry.group_prefix != group_prefix);
    }
    if let Some(zone) = instance.state.bsr.find_config_mut(&zone_id) {
        zone.group_prefixes
            .retain(|entry| entry.group_prefix != group_prefix);
    }
    instance
        .state
        .rp_table
        .clear_origin(RpOrigin::Bootstrap, &group_prefix);
    events::rp_table_changed(instance, Some(group_prefix));
    Ok(())
}

// Periodic Candidate-RP-Advertise transmission.
pub(crate) fn send_cand_rp_adv(
    instance: &mut Instance,
    zone_id: ScopeZoneId,
) -> Result<(), Error> {
    send_cand_rp_adv_holdtime(instance, zone_id, CAND_RP_HOLDTIME)
}

fn send_cand_rp_adv_holdtime(
    instance: &mut Instance,
    zone_id: ScopeZoneId,
    holdtime: u16,
) -> Result<(), Error> {
    let prefixes = instance
        .state
        .bsr
        .find_config_mut(&zone_id)
        .map(|zone| zone.my_cand_rp_prefixes())
        .unwrap_or_default();
    if prefixes.is_empty() {
        return Ok(());
    }

    // Advertisements go unicast to the elected BSR, unless that is us.
    let bsr_addr = instance
        .state
        .bsr
        .find_active(&zone_id)
        .and_then(|zone| zone.bsr_addr);
    let Some(bsr_addr) = bsr_addr else {
        return Ok(());
    };
    let to_self = instance
        .state
        .interfaces
        .iter(&instance.arenas.interfaces)
        .any(|iface| iface.is_my_addr(&bsr_addr));

    let (_, _, rp_addr, priority, _) = prefixes[0];
    let msg = CandRpAdvMsg {
        priority,
        holdtime,
        rp_addr,
        group_prefixes: prefixes
            .iter()
            .map(|(prefix, is_scope_zone, _, _, _)| EncodedGroup {
                prefix: *prefix,
                is_bidir: false,
                is_scope_zone: *is_scope_zone,
            })
            .collect(),
    };

    if to_self {
        // Feed our own advertisement straight into the BSR state.
        let my_addr = rp_addr;
        return process_cand_rp_adv(instance, my_addr, &msg);
    }

    Debug::CandRpAdvSend(&bsr_addr, priority).log();
    let Some(vif_index) = instance
        .state
        .mrib
        .lookup(&bsr_addr)
        .map(|mrib| mrib.vif_index)
    else {
        return Ok(());
    };
    let Some((mut view, arenas)) = instance.as_up() else {
        return Ok(());
    };
    let state = &mut *view.state;
    if let Some((_, iface)) = state
        .interfaces
        .get_mut_by_vif_index(&mut arenas.interfaces, vif_index)
    {
        iface.send_packet(&mut view, bsr_addr, Packet::CandRpAdv(msg));
    }
    Ok(())
}

// A Candidate-RP-Advertise arrived; only the elected BSR cares.
pub(crate) fn process_cand_rp_adv(
    instance: &mut Instance,
    _src: IpAddr,
    msg: &CandRpAdvMsg,
) -> Result<(), Error> {
    let zone_id = msg
        .group_prefixes
        .first()
        .filter(|group| group.is_scope_zone)
        .map(|group| ScopeZoneId {
            prefix: group.prefix,
            is_scope_zone: true,
        })
        .unwrap_or_else(|| ScopeZoneId::global(instance.af));

    let elected = instance
        .state
        .bsr
        .find_config_mut(&zone_id)
        .map(|zone| zone.state == BsrZoneState::ElectedBsr)
        .unwrap_or(false);
    if !elected {
        return Ok(());
    }

    let Some(zone) = instance.state.bsr.find_config_mut(&zone_id) else {
        return Ok(());
    };
    for group in &msg.group_prefixes {
        let entry = match zone.find_prefix_mut(&group.prefix) {
            Some(entry) => entry,
            None => {
                zone.group_prefixes.push(BsrGroupPrefix {
                    group_prefix: group.prefix,
                    is_scope_zone: group.is_scope_zone,
                    expected_rp_count: 0,
                    rps: Vec::new(),
                    remove_timer: None,
                });
                zone.group_prefixes.last_mut().unwrap()
            }
        };
        if msg.holdtime == 0 {
            // The candidate is withdrawing.
            entry.rps.retain(|rp| rp.addr != msg.rp_addr);
            continue;
        }
        match entry.rps.iter_mut().find(|rp| rp.addr == msg.rp_addr) {
            Some(rp) => {
                rp.priority = msg.priority;
                rp.holdtime = msg.holdtime;
            }
            None => entry.rps.push(BsrRp {
                addr: msg.rp_addr,
                priority: msg.priority,
                holdtime: msg.holdtime,
                my_vif_index: None,
                expiry_timer: None,
            }),
        }
    }
    // Prefixes whose last candidate withdrew linger until the removal
    // timer fires, so a flapping candidate does not churn the RP-set.
    let empty_prefixes = zone
        .group_prefixes
        .iter()
        .filter(|entry| entry.rps.is_empty() && entry.remove_timer.is_none())
        .map(|entry| entry.group_prefix)
        .collect::<Vec<_>>();
    for group_prefix in empty_prefixes {
        let timer = {
            let Some((view, _)) = instance.as_up() else {
                continue;
            };
            tasks::group_prefix_remove_timer(
                &view,
                zone_id,
                group_prefix,
                Duration::from_secs(BOOTSTRAP_TIMEOUT as u64),
            )
        };
        if let Some(zone) = instance.state.bsr.find_config_mut(&zone_id)
            && let Some(entry) = zone.find_prefix_mut(&group_prefix)
        {
            entry.remove_timer = Some(timer);
        }
    }
    Ok(())
}

// ===== test support =====

// Injects a fully-formed zone, bypassing the wire. Test builds only.
#[cfg(feature = "testing")]
pub fn inject_test_zone(instance: &mut Instance, zone: BsrZone) {
    let zone_id = zone.zone_id;
    instance
        .state
        .bsr
        .active_zones
        .retain(|old| old.zone_id != zone_id);
    instance.state.bsr.active_zones.push(zone);
    commit_rp_set(instance, zone_id);
}
