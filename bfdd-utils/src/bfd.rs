//
// Copyright (c) The Bfdd Project Developers
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use derive_new::new;
use enum_as_inner::EnumAsInner;
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::protocol::Protocol;

// BFD path type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum PathType {
    IpSingleHop,
    IpMultihop,
}

// BFD session key.
//
// Single-hop sessions are identified by the outgoing interface and the
// neighbor address; multihop sessions by the (source, destination) address
// pair.
#[derive(Clone, Debug, EnumAsInner, Eq, new, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum SessionKey {
    IpSingleHop { ifname: String, dst: IpAddr },
    IpMultihop { src: IpAddr, dst: IpAddr },
}

// BFD session state.
//
// Numeric values match the State (Sta) field of the BFD control packet.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum State {
    AdminDown = 0,
    Down = 1,
    Init = 2,
    Up = 3,
}

// Identity of a protocol requesting liveness tracking of a peer.
#[derive(Clone, Debug, Eq, Hash, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct ClientId {
    pub protocol: Protocol,
    pub name: String,
}

// Per-request session parameter overrides.
//
// Unset fields fall back to the interface-level configuration of the
// instance that claims the request.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct SessionOptions {
    pub min_rx: Option<u32>,
    pub min_tx: Option<u32>,
    pub idle_tx: Option<u32>,
    pub multiplier: Option<u8>,
    pub passive: Option<bool>,
}

// ===== impl SessionKey =====

impl SessionKey {
    pub fn dst(&self) -> &IpAddr {
        match self {
            SessionKey::IpSingleHop { dst, .. }
            | SessionKey::IpMultihop { dst, .. } => dst,
        }
    }

    pub fn path_type(&self) -> PathType {
        match self {
            SessionKey::IpSingleHop { .. } => PathType::IpSingleHop,
            SessionKey::IpMultihop { .. } => PathType::IpMultihop,
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKey::IpSingleHop { ifname, dst } => {
                write!(f, "{dst}%{ifname}")
            }
            SessionKey::IpMultihop { src, dst } => {
                write!(f, "{src}->{dst}")
            }
        }
    }
}

// ===== impl State =====

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::AdminDown => write!(f, "admin-down"),
            State::Down => write!(f, "down"),
            State::Init => write!(f, "init"),
            State::Up => write!(f, "up"),
        }
    }
}
