//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use pim_utils::ip::IpAddrExt;
use pim_utils::mfea::VifIndex;
use prefix_trie::joint::map::JointPrefixMap;
use serde::{Deserialize, Serialize};

// One unicast next-hop, as consulted for RPF resolution.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MribEntry {
    pub prefix: IpNetwork,
    pub nexthop_addr: IpAddr,
    pub vif_index: VifIndex,
    pub metric_preference: u32,
    pub metric: u32,
}

// The Multicast Routing Information Base.
//
// Read-only from the protocol's perspective; the contents arrive from
// the unicast routing system and are only consulted here.
#[derive(Debug, Default)]
pub struct Mrib {
    table: JointPrefixMap<IpNetwork, MribEntry>,
}

// ===== impl Mrib =====

impl Mrib {
    // Longest-prefix-match lookup for a destination address.
    pub fn lookup(&self, addr: &IpAddr) -> Option<&MribEntry> {
        let (_, entry) = self.table.get_lpm(&addr.to_host_prefix())?;
        Some(entry)
    }

    pub fn insert(&mut self, entry: MribEntry) -> Option<MribEntry> {
        self.table.insert(entry.prefix, entry)
    }

    pub fn remove(&mut self, prefix: &IpNetwork) -> Option<MribEntry> {
        self.table.remove(prefix)
    }

    // Replaces the whole table in one step.
    pub fn replace_all(
        &mut self,
        entries: impl IntoIterator<Item = MribEntry>,
    ) {
        self.table = JointPrefixMap::default();
        for entry in entries {
            self.insert(entry);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MribEntry> + '_ {
        self.table.iter().map(|(_, entry)| entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(
        prefix: &str,
        nexthop: &str,
        vif_index: VifIndex,
    ) -> MribEntry {
        MribEntry {
            prefix: prefix.parse().unwrap(),
            nexthop_addr: nexthop.parse().unwrap(),
            vif_index,
            metric_preference: 100,
            metric: 10,
        }
    }

    #[test]
    fn longest_prefix_match() {
        let mut mrib = Mrib::default();
        mrib.insert(entry("0.0.0.0/0", "10.0.0.254", 0));
        mrib.insert(entry("10.2.0.0/16", "10.0.0.1", 1));
        mrib.insert(entry("10.2.3.0/24", "10.0.0.2", 2));

        let addr: IpAddr = "10.2.3.4".parse().unwrap();
        assert_eq!(mrib.lookup(&addr).unwrap().vif_index, 2);

        let addr: IpAddr = "10.2.9.9".parse().unwrap();
        assert_eq!(mrib.lookup(&addr).unwrap().vif_index, 1);

        let addr: IpAddr = "192.0.2.1".parse().unwrap();
        assert_eq!(mrib.lookup(&addr).unwrap().vif_index, 0);

        mrib.remove(&"10.2.3.0/24".parse().unwrap());
        let addr: IpAddr = "10.2.3.4".parse().unwrap();
        assert_eq!(mrib.lookup(&addr).unwrap().vif_index, 1);
    }
}
