//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use pim_utils::ip::{AddressFamily, IpAddrExt, IpNetworkExt};
use prefix_trie::joint::map::JointPrefixMap;
use serde::{Deserialize, Serialize};

use crate::consts::{HASH_MASK_LEN_IPV4, HASH_MASK_LEN_IPV6};
use crate::error::Error;

// Where an RP mapping was learned from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum RpOrigin {
    Bootstrap,
    Static,
}

// One candidate RP for a group prefix.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Rp {
    pub addr: IpAddr,
    pub priority: u8,
    pub holdtime: u16,
    pub origin: RpOrigin,
}

// The set of candidate RPs covering one group prefix.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct RpGroupEntry {
    pub group_prefix: IpNetwork,
    pub hash_mask_len: u8,
    pub rps: Vec<Rp>,
}

// Group-prefix to RP-set mapping with hash-based RP election.
#[derive(Debug, Default)]
pub struct RpTable {
    table: JointPrefixMap<IpNetwork, RpGroupEntry>,
}

// An administratively-scoped zone identifier.
//
// The non-scoped global zone is the multicast base prefix with the
// scoped flag cleared.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct ScopeZoneId {
    pub prefix: IpNetwork,
    pub is_scope_zone: bool,
}

// Maps group prefixes to administratively-scoped zones.
#[derive(Debug, Default)]
pub struct ScopeZoneTable {
    zones: Vec<ScopeZoneId>,
}

// ===== impl RpTable =====

impl RpTable {
    // Resolves RP(G): longest-match group prefix, then the RP with the
    // highest hash value, ties broken by priority and address.
    pub fn rp_for_group(&self, group: &IpAddr) -> Option<&Rp> {
        let (_, entry) = self.table.get_lpm(&group.to_host_prefix())?;
        entry.best_rp(group)
    }

    pub fn get(&self, group_prefix: &IpNetwork) -> Option<&RpGroupEntry> {
        self.table.get(group_prefix)
    }

    // Adds or updates one RP mapping.
    pub fn add_rp(
        &mut self,
        group_prefix: IpNetwork,
        hash_mask_len: u8,
        rp: Rp,
    ) {
        if self.table.get(&group_prefix).is_none() {
            self.table.insert(
                group_prefix,
                RpGroupEntry {
                    group_prefix,
                    hash_mask_len,
                    rps: Vec::new(),
                },
            );
        }
        let Some(entry) = self.table.get_mut(&group_prefix) else {
            return;
        };
        entry.hash_mask_len = hash_mask_len;
        match entry
            .rps
            .iter_mut()
            .find(|old| old.addr == rp.addr && old.origin == rp.origin)
        {
            Some(old) => *old = rp,
            None => entry.rps.push(rp),
        }
    }

    // Removes one RP mapping. Returns true if it was present.
    pub fn delete_rp(
        &mut self,
        group_prefix: &IpNetwork,
        rp_addr: &IpAddr,
        origin: RpOrigin,
    ) -> bool {
        let Some(entry) = self.table.get_mut(group_prefix) else {
            return false;
        };
        let old_len = entry.rps.len();
        entry
            .rps
            .retain(|rp| !(rp.addr == *rp_addr && rp.origin == origin));
        let removed = entry.rps.len() != old_len;
        if entry.rps.is_empty() {
            self.table.remove(group_prefix);
        }
        removed
    }

    // Removes every mapping learned from the given origin under the given
    // zone prefix.
    pub fn clear_origin(&mut self, origin: RpOrigin, zone: &IpNetwork) {
        let prefixes = self
            .table
            .iter()
            .map(|(_, entry)| entry.group_prefix)
            .filter(|prefix| zone.is_overlap(prefix))
            .collect::<Vec<_>>();
        for prefix in prefixes {
            let Some(entry) = self.table.get_mut(&prefix) else {
                continue;
            };
            entry.rps.retain(|rp| rp.origin != origin);
            if entry.rps.is_empty() {
                self.table.remove(&prefix);
            }
        }
    }

    // True if the given address is an RP for any group prefix.
    pub fn has_rp_addr(&self, addr: &IpAddr) -> bool {
        self.table
            .iter()
            .any(|(_, entry)| entry.rps.iter().any(|rp| rp.addr == *addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &RpGroupEntry> + '_ {
        self.table.iter().map(|(_, entry)| entry)
    }

    pub fn is_empty(&self) -> bool {
        self.table.iter().next().is_none()
    }
}

// ===== impl RpGroupEntry =====

impl RpGroupEntry {
    pub fn best_rp(&self, group: &IpAddr) -> Option<&Rp> {
        self.rps.iter().max_by(|a, b| {
            let hash_a = hash_value(group, &a.addr, self.hash_mask_len);
            let hash_b = hash_value(group, &b.addr, self.hash_mask_len);
            hash_a
                .cmp(&hash_b)
                // Lower priority value is preferred.
                .then(b.priority.cmp(&a.priority))
                .then(a.addr.cmp(&b.addr))
        })
    }
}

// ===== impl ScopeZoneTable =====

impl ScopeZoneTable {
    pub fn add_zone(&mut self, zone: ScopeZoneId) -> Result<(), Error> {
        if let Some(old) = self
            .zones
            .iter()
            .find(|old| {
                old.is_scope_zone
                    && zone.is_scope_zone
                    && old.prefix.is_overlap(&zone.prefix)
            })
        {
            return Err(Error::ScopeZoneOverlap(zone.prefix, old.prefix));
        }
        self.zones.push(zone);
        Ok(())
    }

    pub fn delete_zone(&mut self, zone: &ScopeZoneId) {
        self.zones.retain(|old| old != zone);
    }

    // Returns the scoped zone containing the group, if any.
    pub fn zone_for_group(&self, group: &IpAddr) -> Option<&ScopeZoneId> {
        self.zones
            .iter()
            .filter(|zone| zone.is_scope_zone && zone.prefix.contains(*group))
            .max_by_key(|zone| zone.prefix.prefix())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScopeZoneId> + '_ {
        self.zones.iter()
    }
}

impl ScopeZoneId {
    // The global (non-scoped) zone for an address family.
    pub fn global(af: AddressFamily) -> ScopeZoneId {
        ScopeZoneId {
            prefix: af.multicast_base(),
            is_scope_zone: false,
        }
    }
}

impl std::fmt::Display for ScopeZoneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_scope_zone {
            write!(f, "scoped {}", self.prefix)
        } else {
            write!(f, "global {}", self.prefix)
        }
    }
}

// ===== global functions =====

pub fn default_hash_mask_len(af: AddressFamily) -> u8 {
    match af {
        AddressFamily::Ipv4 => HASH_MASK_LEN_IPV4,
        AddressFamily::Ipv6 => HASH_MASK_LEN_IPV6,
    }
}

// The RP hash function of RFC 4601, section 4.7.2:
//
//   Value(G,M,C) = (1103515245 * ((1103515245 * (G&M) + 12345) XOR C)
//                   + 12345) mod 2^31
//
// IPv6 addresses are folded into 32 bits by XOR-ing their words.
pub fn hash_value(group: &IpAddr, rp_addr: &IpAddr, hash_mask_len: u8) -> u32 {
    let masked_group = group.mask_prefix(hash_mask_len);
    let g = addr_fold32(&masked_group);
    let c = addr_fold32(rp_addr);

    let value = 1103515245u64
        .wrapping_mul(
            (1103515245u64.wrapping_mul(g as u64).wrapping_add(12345))
                ^ (c as u64),
        )
        .wrapping_add(12345);
    (value % (1 << 31)) as u32
}

fn addr_fold32(addr: &IpAddr) -> u32 {
    match addr {
        IpAddr::V4(addr) => u32::from(*addr),
        IpAddr::V6(addr) => {
            let bits = u128::from(*addr);
            (bits as u32)
                ^ ((bits >> 32) as u32)
                ^ ((bits >> 64) as u32)
                ^ ((bits >> 96) as u32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rp(addr: &str, priority: u8) -> Rp {
        Rp {
            addr: addr.parse().unwrap(),
            priority,
            holdtime: 150,
            origin: RpOrigin::Static,
        }
    }

    #[test]
    fn hash_election_is_deterministic() {
        let mut table = RpTable::default();
        let base: IpNetwork = "224.0.0.0/4".parse().unwrap();
        table.add_rp(base, 30, rp("10.1.1.1", 1));
        table.add_rp(base, 30, rp("10.1.1.2", 1));

        let group: IpAddr = "239.1.2.3".parse().unwrap();
        let chosen = table.rp_for_group(&group).unwrap().addr;
        // The hash function fully determines the winner.
        let h1 = hash_value(&group, &"10.1.1.1".parse().unwrap(), 30);
        let h2 = hash_value(&group, &"10.1.1.2".parse().unwrap(), 30);
        let expected: IpAddr = if h1 > h2 {
            "10.1.1.1".parse().unwrap()
        } else {
            "10.1.1.2".parse().unwrap()
        };
        assert_eq!(chosen, expected);

        // Repeated queries return the same RP.
        assert_eq!(table.rp_for_group(&group).unwrap().addr, chosen);
    }

    #[test]
    fn hash_mask_len_affects_election() {
        let rp1: IpAddr = "10.1.1.1".parse().unwrap();
        let rp2: IpAddr = "10.1.1.2".parse().unwrap();

        // With a /30 hash mask, groups differing below the mask hash
        // identically; with /16 at least one group in the fixture set
        // must move to the other RP.
        let groups: Vec<IpAddr> = (1..=64)
            .map(|i| format!("239.1.{}.{}", i, i * 3 % 256).parse().unwrap())
            .collect();

        let elect = |mask: u8| -> Vec<IpAddr> {
            groups
                .iter()
                .map(|group| {
                    let h1 = hash_value(group, &rp1, mask);
                    let h2 = hash_value(group, &rp2, mask);
                    if h1 > h2 { rp1 } else { rp2 }
                })
                .collect()
        };

        let elected_30 = elect(30);
        let elected_16 = elect(16);
        assert_ne!(elected_30, elected_16);
    }

    #[test]
    fn static_and_bootstrap_origins() {
        let mut table = RpTable::default();
        let prefix: IpNetwork = "239.0.0.0/8".parse().unwrap();
        table.add_rp(prefix, 30, rp("10.9.9.9", 10));
        table.add_rp(
            prefix,
            30,
            Rp {
                addr: "10.8.8.8".parse().unwrap(),
                priority: 10,
                holdtime: 150,
                origin: RpOrigin::Bootstrap,
            },
        );

        let zone: IpNetwork = "224.0.0.0/4".parse().unwrap();
        table.clear_origin(RpOrigin::Bootstrap, &zone);
        assert!(table.has_rp_addr(&"10.9.9.9".parse().unwrap()));
        assert!(!table.has_rp_addr(&"10.8.8.8".parse().unwrap()));

        assert!(table.delete_rp(
            &prefix,
            &"10.9.9.9".parse().unwrap(),
            RpOrigin::Static
        ));
        assert!(table.is_empty());
    }
}
