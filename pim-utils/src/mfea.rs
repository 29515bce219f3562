//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;
use std::time::Duration;

use bitflags::bitflags;
use bytes::Bytes;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

// Maximum number of virtual multicast interfaces.
//
// Matches the kernel's MAXVIFS/MAXMIFS limit.
pub const MAX_VIFS: usize = 32;

// A process-scoped index naming a virtual multicast interface.
pub type VifIndex = u16;

// Sentinel for "no vif".
pub const VIF_INDEX_INVALID: VifIndex = VifIndex::MAX;

// A set of virtual multicast interfaces, one bit per vif index.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(transparent)]
pub struct MifSet(u32);

bitflags! {
    // Per-oif flags for an MFC entry.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct MfcOifFlags: u8 {
        // Suppress WRONGVIF upcalls for this oif (advanced kernel API).
        const DISABLE_WRONGVIF = 0x01;
    }
}

bitflags! {
    // System-level vif flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct VifFlags: u8 {
        const PIM_REGISTER = 0x01;
        const P2P = 0x02;
        const LOOPBACK = 0x04;
        const MULTICAST = 0x08;
        const BROADCAST = 0x10;
        const UP = 0x20;
    }
}

// ===== forwarder requests (core -> MFEA) =====

// A request to install or update a kernel MFC entry.
//
// `iif` and every oif whose ttl is non-zero are active.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct AddMfcMsg {
    pub source: IpAddr,
    pub group: IpAddr,
    pub iif: VifIndex,
    #[serde(with = "serde_arrays")]
    pub oif_ttls: [u8; MAX_VIFS],
    #[serde(with = "serde_arrays")]
    pub oif_flags: [MfcOifFlags; MAX_VIFS],
    pub rp_addr: Option<IpAddr>,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct DeleteMfcMsg {
    pub source: IpAddr,
    pub group: IpAddr,
}

// Whether a dataflow monitor fires when the measured rate rises to the
// threshold or falls below it. The two are mutually exclusive by
// construction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum DataflowCmp {
    Geq,
    Leq,
}

// What a dataflow monitor measures.
bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct DataflowUnits: u8 {
        const PACKETS = 0x01;
        const BYTES = 0x02;
    }
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct DataflowMonitorMsg {
    pub source: IpAddr,
    pub group: IpAddr,
    pub threshold_interval: Duration,
    pub threshold_packets: Option<u64>,
    pub threshold_bytes: Option<u64>,
    pub cmp: DataflowCmp,
    pub units: DataflowUnits,
    // Rolling window vs. one-shot measurement.
    pub is_rolling: bool,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub enum MfcRequestMsg {
    AddMfc(AddMfcMsg),
    DeleteMfc(DeleteMfcMsg),
    AddDataflowMonitor(DataflowMonitorMsg),
    DeleteDataflowMonitor(DataflowMonitorMsg),
    DeleteAllDataflowMonitor { source: IpAddr, group: IpAddr },
}

// ===== forwarder upcalls (MFEA -> core) =====

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct DataflowMeasurement {
    pub measured_interval: Duration,
    pub measured_packets: u64,
    pub measured_bytes: u64,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub enum MfeaUpcallMsg {
    // First packet of an (S,G) flow with no MFC entry.
    NoCache {
        vif_index: VifIndex,
        source: IpAddr,
        group: IpAddr,
    },
    // Packet arrived on an interface other than the MFC entry's iif.
    WrongVif {
        vif_index: VifIndex,
        source: IpAddr,
        group: IpAddr,
    },
    // Packet requiring software processing (e.g. Register decapsulation).
    WholePkt {
        vif_index: VifIndex,
        source: IpAddr,
        group: IpAddr,
        packet: Bytes,
    },
    // A dataflow monitor threshold was crossed.
    BwUpcall {
        source: IpAddr,
        group: IpAddr,
        threshold_interval: Duration,
        threshold_packets: u64,
        threshold_bytes: u64,
        measurement: DataflowMeasurement,
        cmp: DataflowCmp,
        units: DataflowUnits,
    },
}

// ===== membership events (MLD/IGMP -> core) =====

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum MembershipOp {
    Join,
    Leave,
}

// A local membership change on a vif. `source` of None means (*,G).
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct MembershipMsg {
    pub vif_index: VifIndex,
    pub source: Option<IpAddr>,
    pub group: IpAddr,
    pub op: MembershipOp,
}

// ===== vif system events =====

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct VifUpdateMsg {
    pub ifname: String,
    pub ifindex: u32,
    pub mtu: u32,
    pub flags: VifFlags,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct VifAddressMsg {
    pub ifname: String,
    pub addr: IpAddr,
    pub subnet: IpNetwork,
    pub broadcast: Option<IpAddr>,
    pub peer: Option<IpAddr>,
}

// Single ingest path for both observed and synthesized vif events.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub enum VifMsg {
    Update(VifUpdateMsg),
    Delete(String),
    AddressAdd(VifAddressMsg),
    AddressDel(VifAddressMsg),
}

// ===== impl MifSet =====

impl MifSet {
    pub fn new() -> MifSet {
        MifSet(0)
    }

    pub fn set(&mut self, vif_index: VifIndex) {
        if (vif_index as usize) < MAX_VIFS {
            self.0 |= 1 << vif_index;
        }
    }

    pub fn clear(&mut self, vif_index: VifIndex) {
        if (vif_index as usize) < MAX_VIFS {
            self.0 &= !(1 << vif_index);
        }
    }

    pub fn contains(&self, vif_index: VifIndex) -> bool {
        (vif_index as usize) < MAX_VIFS && self.0 & (1 << vif_index) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = VifIndex> + '_ {
        (0..MAX_VIFS as VifIndex).filter(|vif| self.contains(*vif))
    }

    #[must_use]
    pub fn union(&self, other: MifSet) -> MifSet {
        MifSet(self.0 | other.0)
    }

    #[must_use]
    pub fn intersection(&self, other: MifSet) -> MifSet {
        MifSet(self.0 & other.0)
    }

    #[must_use]
    pub fn difference(&self, other: MifSet) -> MifSet {
        MifSet(self.0 & !other.0)
    }
}

impl std::fmt::Display for MifSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for vif in self.iter() {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", vif)?;
            first = false;
        }
        write!(f, "}}")
    }
}

// serde helpers for fixed-size arrays larger than 32 elements are not
// needed while MAX_VIFS is 32, but the explicit module keeps the derive
// stable if the limit grows.
mod serde_arrays {
    use serde::de::{Deserializer, Error, SeqAccess, Visitor};
    use serde::ser::{SerializeTuple, Serializer};
    use serde::Deserialize;

    pub fn serialize<S, T, const N: usize>(
        data: &[T; N],
        ser: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: serde::Serialize,
    {
        let mut tup = ser.serialize_tuple(N)?;
        for elem in data {
            tup.serialize_element(elem)?;
        }
        tup.end()
    }

    pub fn deserialize<'de, D, T, const N: usize>(
        de: D,
    ) -> Result<[T; N], D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de> + Copy + Default,
    {
        struct ArrayVisitor<T, const N: usize>(std::marker::PhantomData<T>);

        impl<'de, T, const N: usize> Visitor<'de> for ArrayVisitor<T, N>
        where
            T: Deserialize<'de> + Copy + Default,
        {
            type Value = [T; N];

            fn expecting(
                &self,
                formatter: &mut std::fmt::Formatter<'_>,
            ) -> std::fmt::Result {
                write!(formatter, "an array of length {}", N)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<[T; N], A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut data = [T::default(); N];
                for (i, elem) in data.iter_mut().enumerate() {
                    *elem = seq
                        .next_element()?
                        .ok_or_else(|| Error::invalid_length(i, &self))?;
                }
                Ok(data)
            }
        }

        de.deserialize_tuple(N, ArrayVisitor(std::marker::PhantomData))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mifset_ops() {
        let mut a = MifSet::new();
        a.set(0);
        a.set(3);
        a.set(31);
        assert!(a.contains(3));
        assert!(!a.contains(4));
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![0, 3, 31]);

        let mut b = MifSet::new();
        b.set(3);
        assert_eq!(a.difference(b).iter().collect::<Vec<_>>(), vec![0, 31]);
        assert_eq!(a.intersection(b).iter().collect::<Vec<_>>(), vec![3]);
        assert!(a.difference(a).is_empty());

        // Out-of-range indices are ignored.
        let mut c = MifSet::new();
        c.set(40);
        assert!(c.is_empty());
    }
}
