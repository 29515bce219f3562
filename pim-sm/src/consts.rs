//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

//! Protocol constants and defaults (RFC 4601, RFC 5059).

// PIM protocol version spoken on every vif.
pub const PIM_VERSION: u8 = 2;

// IP protocol number.
pub const PIM_IP_PROTOCOL: u8 = 103;

// ===== Hello =====

pub const HELLO_PERIOD: u16 = 30;
// Default_Hello_Holdtime = 3.5 * Hello_Period.
pub const HELLO_HOLDTIME: u16 = 105;
pub const HELLO_TRIGGERED_DELAY: u16 = 5;
// A holdtime of 0xffff means the neighbor never times out.
pub const HELLO_HOLDTIME_FOREVER: u16 = 0xffff;
pub const DR_PRIORITY_DEFAULT: u32 = 1;

// ===== LAN Prune Delay =====

pub const PROPAGATION_DELAY_MSEC: u16 = 500;
pub const OVERRIDE_INTERVAL_MSEC: u16 = 2500;

// ===== Join/Prune =====

pub const JOIN_PRUNE_PERIOD: u16 = 60;
// Default holdtime = 3.5 * t_periodic.
pub const JOIN_PRUNE_HOLDTIME: u16 = 210;

// ===== Assert =====

pub const ASSERT_TIME: u16 = 180;
pub const ASSERT_OVERRIDE_INTERVAL: u16 = 3;
// Minimum spacing between triggered Asserts for the same (S,G) on a vif.
pub const ASSERT_RATE_LIMIT_SECS: u16 = 10;
// AssertCancel metric: preference 0x7fffffff, metric 0xffffffff.
pub const ASSERT_CANCEL_METRIC_PREFERENCE: u32 = 0x7fff_ffff;
pub const ASSERT_CANCEL_METRIC: u32 = 0xffff_ffff;

// ===== Register =====

pub const REGISTER_SUPPRESSION_TIME: u16 = 60;
pub const REGISTER_PROBE_TIME: u16 = 5;

// ===== Keepalive =====

pub const KEEPALIVE_PERIOD: u16 = 210;
// RP_Keepalive_Period = 3 * Register_Suppression_Time + Register_Probe_Time.
pub const RP_KEEPALIVE_PERIOD: u16 =
    3 * REGISTER_SUPPRESSION_TIME + REGISTER_PROBE_TIME;

// ===== Bootstrap / Candidate-RP =====

pub const BOOTSTRAP_PERIOD: u16 = 60;
pub const BOOTSTRAP_TIMEOUT: u16 = 130;
// Scope-Zone Expiry Timeout (RFC 5059).
pub const SCOPE_ZONE_TIMEOUT: u16 = 1300;
pub const CAND_RP_ADV_PERIOD: u16 = 60;
pub const CAND_RP_HOLDTIME: u16 = 150;
pub const BSR_PRIORITY_DEFAULT: u8 = 1;
pub const CAND_RP_PRIORITY_DEFAULT: u8 = 192;

pub const HASH_MASK_LEN_IPV4: u8 = 30;
pub const HASH_MASK_LEN_IPV6: u8 = 126;

// ===== Misc =====

pub const DEFAULT_IP_TOS: u8 = 0;
