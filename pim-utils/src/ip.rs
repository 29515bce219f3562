//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::{IpNetwork, IpNetworkError, Ipv4Network, Ipv6Network};
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

// Address Family identifier.
//
// IANA registry:
// http://www.iana.org/assignments/address-family-numbers
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum AddressFamily {
    Ipv4 = 1,
    Ipv6 = 2,
}

// Extension methods for IpAddr.
pub trait IpAddrExt {
    // Returns length of the IP address in bytes.
    fn length(&self) -> usize;

    // Returns vector of bytes that make up this address.
    fn bytes(&self) -> Vec<u8>;

    // Returns true if this is an usable unicast address.
    fn is_usable(&self) -> bool;

    // Returns true if this is a link-local unicast address.
    fn is_unicast_link_local(&self) -> bool;

    // Converts this IP address into a host prefix network.
    fn to_host_prefix(&self) -> IpNetwork;

    // Returns the address with all bits below the given prefix length
    // cleared.
    fn mask_prefix(&self, prefixlen: u8) -> IpAddr;

    // Returns an unspecified address of the given address family.
    fn unspecified(af: AddressFamily) -> IpAddr;
}

// Extension methods for IpNetwork.
pub trait IpNetworkExt {
    // Apply mask to prefix.
    #[must_use]
    fn apply_mask(&self) -> IpNetwork;

    // Returns true if the two prefixes share at least one address.
    fn is_overlap(&self, other: &IpNetwork) -> bool;
}

// ===== impl AddressFamily =====

impl AddressFamily {
    pub const fn addr_len(&self) -> usize {
        match self {
            AddressFamily::Ipv4 => 4,
            AddressFamily::Ipv6 => 16,
        }
    }

    pub const fn max_prefixlen(&self) -> u8 {
        match self {
            AddressFamily::Ipv4 => 32,
            AddressFamily::Ipv6 => 128,
        }
    }

    // The base prefix covering the whole multicast address space.
    pub fn multicast_base(&self) -> IpNetwork {
        match self {
            AddressFamily::Ipv4 => {
                Ipv4Network::new(Ipv4Addr::new(224, 0, 0, 0), 4)
                    .unwrap()
                    .into()
            }
            AddressFamily::Ipv6 => {
                Ipv6Network::new(Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 0), 8)
                    .unwrap()
                    .into()
            }
        }
    }

    // ALL-PIM-ROUTERS link-scope group (224.0.0.13 / ff02::d).
    pub fn all_pim_routers(&self) -> IpAddr {
        match self {
            AddressFamily::Ipv4 => {
                IpAddr::V4(Ipv4Addr::new(224, 0, 0, 13))
            }
            AddressFamily::Ipv6 => {
                IpAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xd))
            }
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressFamily::Ipv4 => write!(f, "IPv4"),
            AddressFamily::Ipv6 => write!(f, "IPv6"),
        }
    }
}

// ===== impl IpAddr =====

impl IpAddrExt for IpAddr {
    fn length(&self) -> usize {
        match self {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 16,
        }
    }

    fn bytes(&self) -> Vec<u8> {
        match self {
            IpAddr::V4(addr) => addr.octets().to_vec(),
            IpAddr::V6(addr) => addr.octets().to_vec(),
        }
    }

    fn is_usable(&self) -> bool {
        !(self.is_loopback() || self.is_multicast() || self.is_unspecified())
    }

    fn is_unicast_link_local(&self) -> bool {
        match self {
            IpAddr::V4(addr) => addr.is_link_local(),
            IpAddr::V6(addr) => addr.is_unicast_link_local(),
        }
    }

    fn to_host_prefix(&self) -> IpNetwork {
        match self {
            IpAddr::V4(addr) => Ipv4Network::new(*addr, 32).unwrap().into(),
            IpAddr::V6(addr) => Ipv6Network::new(*addr, 128).unwrap().into(),
        }
    }

    fn mask_prefix(&self, prefixlen: u8) -> IpAddr {
        match self {
            IpAddr::V4(addr) => {
                let prefixlen = std::cmp::min(prefixlen, 32);
                let mask = if prefixlen == 0 {
                    0
                } else {
                    u32::MAX << (32 - prefixlen as u32)
                };
                IpAddr::V4(Ipv4Addr::from(u32::from(*addr) & mask))
            }
            IpAddr::V6(addr) => {
                let prefixlen = std::cmp::min(prefixlen, 128);
                let mask = if prefixlen == 0 {
                    0
                } else {
                    u128::MAX << (128 - prefixlen as u32)
                };
                IpAddr::V6(Ipv6Addr::from(u128::from(*addr) & mask))
            }
        }
    }

    fn unspecified(af: AddressFamily) -> IpAddr {
        match af {
            AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

pub trait AddressFamilyExt {
    fn address_family(&self) -> AddressFamily;
}

impl AddressFamilyExt for IpAddr {
    fn address_family(&self) -> AddressFamily {
        match self {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }
}

impl AddressFamilyExt for IpNetwork {
    fn address_family(&self) -> AddressFamily {
        match self {
            IpNetwork::V4(_) => AddressFamily::Ipv4,
            IpNetwork::V6(_) => AddressFamily::Ipv6,
        }
    }
}

// ===== impl IpNetwork =====

impl IpNetworkExt for IpNetwork {
    fn apply_mask(&self) -> IpNetwork {
        match self {
            IpNetwork::V4(prefix) => {
                Ipv4Network::new(prefix.network(), prefix.prefix())
                    .unwrap()
                    .into()
            }
            IpNetwork::V6(prefix) => {
                Ipv6Network::new(prefix.network(), prefix.prefix())
                    .unwrap()
                    .into()
            }
        }
    }

    fn is_overlap(&self, other: &IpNetwork) -> bool {
        if self.address_family() != other.address_family() {
            return false;
        }
        let shorter = std::cmp::min(self.prefix(), other.prefix());
        self.ip().mask_prefix(shorter) == other.ip().mask_prefix(shorter)
    }
}

// ===== global functions =====

// Builds a network from an address and prefix length.
pub fn network(
    addr: IpAddr,
    prefixlen: u8,
) -> Result<IpNetwork, IpNetworkError> {
    IpNetwork::new(addr, prefixlen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_prefix() {
        let addr: IpAddr = "239.1.2.3".parse().unwrap();
        assert_eq!(
            addr.mask_prefix(8),
            "239.0.0.0".parse::<IpAddr>().unwrap()
        );
        assert_eq!(addr.mask_prefix(0), "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(addr.mask_prefix(32), addr);

        let addr: IpAddr = "ff3e::8000:1".parse().unwrap();
        assert_eq!(
            addr.mask_prefix(16),
            "ff3e::".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn overlap() {
        let a: IpNetwork = "224.0.0.0/4".parse().unwrap();
        let b: IpNetwork = "239.0.0.0/8".parse().unwrap();
        let c: IpNetwork = "10.0.0.0/8".parse().unwrap();
        assert!(a.is_overlap(&b));
        assert!(b.is_overlap(&a));
        assert!(!b.is_overlap(&c));
    }
}
