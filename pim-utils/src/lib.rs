//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

#![cfg_attr(
    feature = "testing",
    allow(dead_code, unused_variables, unused_imports)
)]

pub mod bytes;
pub mod ip;
pub mod mfea;
pub mod protocol;
pub mod socket;
pub mod task;
