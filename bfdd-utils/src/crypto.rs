//
// Copyright (c) The Bfdd Project Developers
//
// SPDX-License-Identifier: MIT
//

use serde::{Deserialize, Serialize};

// Cryptographic algorithms usable for BFD packet authentication.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum CryptoAlgo {
    ClearText,
    Md5,
    Sha1,
}

// ===== impl CryptoAlgo =====

impl CryptoAlgo {
    pub fn digest_size(&self) -> u8 {
        match self {
            CryptoAlgo::ClearText => unreachable!(),
            CryptoAlgo::Md5 => 16,
            CryptoAlgo::Sha1 => 20,
        }
    }
}

impl std::fmt::Display for CryptoAlgo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoAlgo::ClearText => write!(f, "clear-text"),
            CryptoAlgo::Md5 => write!(f, "md5"),
            CryptoAlgo::Sha1 => write!(f, "sha-1"),
        }
    }
}
