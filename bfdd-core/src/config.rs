//
// Copyright (c) The Bfdd Project Developers
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use bfdd_utils::bfd::SessionOptions;
use bfdd_utils::crypto::CryptoAlgo;
use bfdd_utils::keychain::Keychain;

use crate::error::Error;
use crate::packet::AuthenticationType;

// Default session timing parameters, in microseconds.
pub const DFLT_MIN_RX_INTERVAL: u32 = 10000;
pub const DFLT_MIN_TX_INTERVAL: u32 = 100000;
pub const DFLT_IDLE_TX_INTERVAL: u32 = 1000000;
pub const DFLT_MULTIPLIER: u8 = 5;

// Per-instance configuration.
//
// An instance accepts session requests matching its VRF and acceptance
// flags. The `strict_bind` and `zero_udp6_checksum_rx` knobs affect how Rx
// sockets are opened and cannot be changed without restarting the instance.
#[derive(Clone, Debug)]
pub struct InstanceCfg {
    pub vrf: Option<String>,
    pub accept_ipv4: bool,
    pub accept_ipv6: bool,
    pub accept_direct: bool,
    pub accept_multihop: bool,
    pub strict_bind: bool,
    pub zero_udp6_checksum_rx: bool,
    // Interface-level defaults, overridable per interface name.
    pub iface_defaults: IfaceCfg,
    pub ifaces: BTreeMap<String, IfaceCfg>,
    // Statically configured peers.
    pub neighbors: Vec<NeighborCfg>,
}

// Per-interface session parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct IfaceCfg {
    pub min_rx: u32,
    pub min_tx: u32,
    pub idle_tx: u32,
    pub multiplier: u8,
    pub passive: bool,
    pub auth: Option<AuthCfg>,
}

// Packet authentication parameters.
#[derive(Clone, Debug)]
pub struct AuthCfg {
    pub auth_type: AuthenticationType,
    pub keychain: Arc<Keychain>,
}

// Statically configured BFD peer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NeighborCfg {
    pub remote: IpAddr,
    pub local: Option<IpAddr>,
    pub ifname: Option<String>,
    pub multihop: bool,
}

// Effective per-session configuration, resolved from the interface-level
// configuration and the head request's option overlay.
#[derive(Clone, Debug)]
pub struct SessionCfg {
    pub min_rx: u32,
    pub min_tx: u32,
    pub idle_tx: u32,
    pub multiplier: u8,
    pub passive: bool,
    pub auth: Option<AuthCfg>,
}

// ===== impl InstanceCfg =====

impl InstanceCfg {
    // Returns the interface-level configuration for the given interface.
    // Multihop sessions have no interface and use the defaults.
    pub fn iface_cfg(&self, ifname: Option<&str>) -> &IfaceCfg {
        ifname
            .and_then(|ifname| self.ifaces.get(ifname))
            .unwrap_or(&self.iface_defaults)
    }

    // Validates the configuration.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if !self.accept_ipv4 && !self.accept_ipv6 {
            return Err(Error::InvalidConfig(
                "no address family accepted".to_owned(),
            ));
        }

        for cfg in
            std::iter::once(&self.iface_defaults).chain(self.ifaces.values())
        {
            cfg.validate()?;
        }

        for nbr in &self.neighbors {
            if nbr.multihop && nbr.local.is_none() {
                return Err(Error::InvalidConfig(format!(
                    "multihop neighbor {} lacks a local address",
                    nbr.remote
                )));
            }
            if !nbr.multihop && nbr.ifname.is_none() {
                return Err(Error::InvalidConfig(format!(
                    "direct neighbor {} lacks an interface",
                    nbr.remote
                )));
            }
        }

        Ok(())
    }

    // Checks whether a configuration change can be applied to a running
    // instance.
    pub(crate) fn compatible(&self, new: &InstanceCfg) -> Result<(), Error> {
        if self.vrf != new.vrf
            || self.accept_ipv4 != new.accept_ipv4
            || self.accept_ipv6 != new.accept_ipv6
            || self.accept_direct != new.accept_direct
            || self.accept_multihop != new.accept_multihop
            || self.strict_bind != new.strict_bind
            || self.zero_udp6_checksum_rx != new.zero_udp6_checksum_rx
        {
            return Err(Error::InvalidConfig(
                "change requires an instance restart".to_owned(),
            ));
        }

        Ok(())
    }
}

impl Default for InstanceCfg {
    fn default() -> InstanceCfg {
        InstanceCfg {
            vrf: None,
            accept_ipv4: true,
            accept_ipv6: true,
            accept_direct: true,
            accept_multihop: true,
            strict_bind: false,
            zero_udp6_checksum_rx: false,
            iface_defaults: Default::default(),
            ifaces: Default::default(),
            neighbors: Default::default(),
        }
    }
}

// ===== impl IfaceCfg =====

impl IfaceCfg {
    fn validate(&self) -> Result<(), Error> {
        if self.min_rx == 0 || self.min_tx == 0 || self.idle_tx == 0 {
            return Err(Error::InvalidConfig(
                "session intervals must be nonzero".to_owned(),
            ));
        }
        if self.multiplier == 0 {
            return Err(Error::InvalidConfig(
                "detection multiplier must be nonzero".to_owned(),
            ));
        }
        if let Some(auth) = &self.auth {
            if auth.keychain.keys.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "key-chain \"{}\" has no keys",
                    auth.keychain.name
                )));
            }
            // Simple passwords must fit the one-octet length field.
            if auth.auth_type == AuthenticationType::SimplePassword
                && auth.keychain.keys.values().any(|key| {
                    key.data.string.is_empty() || key.data.string.len() > 16
                })
            {
                return Err(Error::InvalidConfig(format!(
                    "key-chain \"{}\" has a password of invalid length",
                    auth.keychain.name
                )));
            }
            let algo = match auth.auth_type {
                AuthenticationType::SimplePassword => CryptoAlgo::ClearText,
                AuthenticationType::KeyedMd5
                | AuthenticationType::MeticulousKeyedMd5 => CryptoAlgo::Md5,
                AuthenticationType::KeyedSha1
                | AuthenticationType::MeticulousKeyedSha1 => CryptoAlgo::Sha1,
            };
            if auth
                .keychain
                .keys
                .values()
                .any(|key| key.data.algo != algo)
            {
                return Err(Error::InvalidConfig(format!(
                    "key-chain \"{}\" algorithm doesn't match the \
                     authentication type",
                    auth.keychain.name
                )));
            }
        }

        Ok(())
    }
}

impl Default for IfaceCfg {
    fn default() -> IfaceCfg {
        IfaceCfg {
            min_rx: DFLT_MIN_RX_INTERVAL,
            min_tx: DFLT_MIN_TX_INTERVAL,
            idle_tx: DFLT_IDLE_TX_INTERVAL,
            multiplier: DFLT_MULTIPLIER,
            passive: false,
            auth: None,
        }
    }
}

// ===== impl AuthCfg =====

impl PartialEq for AuthCfg {
    fn eq(&self, other: &AuthCfg) -> bool {
        self.auth_type == other.auth_type
            && Arc::ptr_eq(&self.keychain, &other.keychain)
    }
}

// ===== impl SessionCfg =====

impl SessionCfg {
    // Resolves the effective session configuration from the interface-level
    // configuration and an optional per-request overlay. Set overlay fields
    // take precedence.
    pub(crate) fn merge(
        iface_cfg: &IfaceCfg,
        options: Option<&SessionOptions>,
    ) -> SessionCfg {
        let options = options.copied().unwrap_or_default();

        SessionCfg {
            min_rx: options.min_rx.unwrap_or(iface_cfg.min_rx),
            min_tx: options.min_tx.unwrap_or(iface_cfg.min_tx),
            idle_tx: options.idle_tx.unwrap_or(iface_cfg.idle_tx),
            multiplier: options.multiplier.unwrap_or(iface_cfg.multiplier),
            passive: options.passive.unwrap_or(iface_cfg.passive),
            auth: iface_cfg.auth.clone(),
        }
    }
}
