//
// Copyright (c) The Bfdd Project Developers
//
// SPDX-License-Identifier: MIT
//

#![cfg_attr(
    feature = "testing",
    allow(dead_code, unused_variables, unused_imports)
)]

pub mod config;
pub mod debug;
pub mod error;
pub mod events;
pub mod iface;
pub mod master;
pub mod network;
pub mod packet;
pub mod registry;
pub mod session;
pub mod tasks;
