//
// Copyright (c) The Bfdd Project Developers
//
// SPDX-License-Identifier: MIT
//

use serde::{Deserialize, Serialize};

// Routing protocols that can consume BFD liveness information.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum Protocol {
    BFD,
    BGP,
    OSPF,
    RIP,
    STATIC,
}

// ===== impl Protocol =====

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::BFD => write!(f, "bfd"),
            Protocol::BGP => write!(f, "bgp"),
            Protocol::OSPF => write!(f, "ospf"),
            Protocol::RIP => write!(f, "rip"),
            Protocol::STATIC => write!(f, "static"),
        }
    }
}
