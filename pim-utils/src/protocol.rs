//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

use std::str::FromStr;

use serde::{Deserialize, Serialize};

// The protocol modules a multicast routing process is composed of.
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    MFEA,
    MLD6IGMP,
    PIMSM,
    PIMDM,
}

// ===== impl Protocol =====

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::MFEA => write!(f, "mfea"),
            Protocol::MLD6IGMP => write!(f, "mld6igmp"),
            Protocol::PIMSM => write!(f, "pimsm"),
            Protocol::PIMDM => write!(f, "pimdm"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_ref() {
            "mfea" => Ok(Protocol::MFEA),
            "mld6igmp" => Ok(Protocol::MLD6IGMP),
            "pimsm" => Ok(Protocol::PIMSM),
            "pimdm" => Ok(Protocol::PIMDM),
            _ => Err(()),
        }
    }
}
