//
// Copyright (c) The Bfdd Project Developers
//
// SPDX-License-Identifier: MIT
//

#![cfg_attr(
    feature = "testing",
    allow(dead_code, unused_variables, unused_imports)
)]

pub mod bfd;
pub mod bytes;
pub mod crypto;
pub mod ip;
pub mod keychain;
pub mod protocol;
pub mod socket;
pub mod task;

use tokio::sync::mpsc;

// Channel type aliases.
pub type Sender<T> = mpsc::Sender<T>;
pub type Receiver<T> = mpsc::Receiver<T>;
pub type UnboundedSender<T> = mpsc::UnboundedSender<T>;
pub type UnboundedReceiver<T> = mpsc::UnboundedReceiver<T>;
