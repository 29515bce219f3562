//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

#![cfg_attr(
    feature = "testing",
    allow(dead_code, unused_variables, unused_imports)
)]
#![allow(clippy::too_many_arguments)]

pub mod bsr;
pub mod collections;
pub mod configuration;
pub mod consts;
pub mod debug;
pub mod error;
pub mod events;
pub mod instance;
pub mod interface;
pub mod mrib;
pub mod mrt;
pub mod neighbor;
pub mod network;
pub mod packet;
pub mod rp;
pub mod southbound;
pub mod tasks;
