//
// Copyright (c) The Bfdd Project Developers
//
// SPDX-License-Identifier: MIT
//

use bfdd_utils::bfd::{ClientId, SessionKey, State};
use tracing::{debug, debug_span};

use crate::session::PollFlags;

// BFD debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    InstanceStart(&'a str),
    InstanceStop(&'a str),
    SessionCreate(&'a SessionKey),
    SessionDelete(&'a SessionKey),
    SessionReconfigure(&'a SessionKey),
    SessionClientReg(&'a SessionKey, &'a ClientId),
    SessionClientUnreg(&'a SessionKey, &'a ClientId),
    FsmTransition(&'a SessionKey, State, State),
    DetectionTimeExpiry(&'a SessionKey),
    PollStart(&'a SessionKey, PollFlags),
    PollTerminate(&'a SessionKey, PollFlags),
    RequestWaitListed(&'a ClientId),
    NeighborStart(&'a ClientId),
    NeighborStop(&'a ClientId),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::InstanceStart(name) | Debug::InstanceStop(name) => {
                debug_span!("instance", %name).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::SessionCreate(sess_key)
            | Debug::SessionDelete(sess_key)
            | Debug::SessionReconfigure(sess_key) => {
                debug_span!("session", key = %sess_key).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::SessionClientReg(sess_key, client_id)
            | Debug::SessionClientUnreg(sess_key, client_id) => {
                debug_span!("session", key = %sess_key, client = %client_id.protocol).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::FsmTransition(sess_key, old_state, new_state) => {
                debug_span!("session", key = %sess_key).in_scope(|| {
                    debug!(%old_state, %new_state, "{}", self);
                });
            }
            Debug::DetectionTimeExpiry(sess_key) => {
                debug_span!("session", key = %sess_key).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::PollStart(sess_key, bits)
            | Debug::PollTerminate(sess_key, bits) => {
                debug_span!("session", key = %sess_key).in_scope(|| {
                    debug!(?bits, "{}", self);
                });
            }
            Debug::RequestWaitListed(client_id)
            | Debug::NeighborStart(client_id)
            | Debug::NeighborStop(client_id) => {
                debug_span!("request", client = %client_id.protocol).in_scope(
                    || {
                        debug!("{}", self);
                    },
                );
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::InstanceStart(..) => {
                write!(f, "instance started")
            }
            Debug::InstanceStop(..) => {
                write!(f, "instance stopped")
            }
            Debug::SessionCreate(..) => {
                write!(f, "session created")
            }
            Debug::SessionDelete(..) => {
                write!(f, "session deleted")
            }
            Debug::SessionReconfigure(..) => {
                write!(f, "session reconfigured")
            }
            Debug::SessionClientReg(..) => {
                write!(f, "client registered peer")
            }
            Debug::SessionClientUnreg(..) => {
                write!(f, "client unregistered peer")
            }
            Debug::FsmTransition(..) => {
                write!(f, "state transition")
            }
            Debug::DetectionTimeExpiry(..) => {
                write!(f, "detection timer expired")
            }
            Debug::PollStart(..) => {
                write!(f, "poll sequence started")
            }
            Debug::PollTerminate(..) => {
                write!(f, "poll sequence terminated")
            }
            Debug::RequestWaitListed(..) => {
                write!(f, "request placed on the wait list")
            }
            Debug::NeighborStart(..) => {
                write!(f, "neighbor tracking started")
            }
            Debug::NeighborStop(..) => {
                write!(f, "neighbor tracking stopped")
            }
        }
    }
}
