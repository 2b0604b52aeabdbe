//
// Copyright (c) The Bfdd Project Developers
//
// SPDX-License-Identifier: MIT
//

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use bfdd_utils::Sender;
use bfdd_utils::bfd::PathType;
use bfdd_utils::ip::AddressFamily;
use bfdd_utils::socket::{TTL_MAX, UdpSocket};
use bfdd_utils::task::Task;
use generational_arena::{Arena, Index};

use crate::config::IfaceCfg;
use crate::error::IoError;
use crate::tasks::messages::input::UdpRxPacketMsg;
use crate::{network, tasks};

pub type IfaceIndex = Index;

// Reference-counted (local address, interface) pair owning the Tx socket
// shared by the sessions bound to it.
#[derive(Debug)]
pub struct SessionIface {
    pub local: IpAddr,
    pub ifname: Option<String>,
    pub cfg: IfaceCfg,
    // Set when a reconfiguration changed this interface's parameters.
    pub changed: bool,
    pub socket_tx: Option<Arc<UdpSocket>>,
    refcnt: usize,
    // Rx task bound to the local address (strict-bind mode only).
    rx_task: Option<Task<()>>,
}

#[derive(Debug, Default)]
pub struct IfacePool {
    arena: Arena<SessionIface>,
    key_tree: HashMap<(IpAddr, Option<String>), IfaceIndex>,
}

// ===== impl IfacePool =====

impl IfacePool {
    // Returns the interface for the given (local address, interface) pair,
    // creating it and its Tx socket on first use. The reference count is
    // incremented on every call.
    pub(crate) fn get(
        &mut self,
        local: IpAddr,
        ifname: Option<&str>,
        af: AddressFamily,
        cfg: &IfaceCfg,
    ) -> IfaceIndex {
        let key = (local, ifname.map(str::to_owned));
        if let Some(iface_idx) = self.key_tree.get(&key).copied() {
            self.arena[iface_idx].refcnt += 1;
            return iface_idx;
        }

        let socket_tx = match network::socket_tx(ifname, af, local, TTL_MAX) {
            Ok(socket) => Some(Arc::new(socket)),
            Err(error) => {
                IoError::UdpSocketError(error).log();
                None
            }
        };
        let iface = SessionIface {
            local,
            ifname: key.1.clone(),
            cfg: cfg.clone(),
            changed: false,
            socket_tx,
            refcnt: 1,
            rx_task: None,
        };
        let iface_idx = self.arena.insert(iface);
        self.key_tree.insert(key, iface_idx);
        iface_idx
    }

    // Drops one reference to the interface, freeing it and closing its
    // sockets when the last one is gone.
    pub(crate) fn release(&mut self, iface_idx: IfaceIndex) {
        let iface = &mut self.arena[iface_idx];

        iface.refcnt -= 1;
        if iface.refcnt == 0 {
            let key = (iface.local, iface.ifname.clone());
            self.key_tree.remove(&key);
            self.arena.remove(iface_idx);
        }
    }

    // Opens the strictly bound Rx socket for the interface, unless one is
    // already running.
    pub(crate) fn start_strict_rx(
        &mut self,
        iface_idx: IfaceIndex,
        zero_udp6_checksum_rx: bool,
        udp_packet_rxp: &Sender<UdpRxPacketMsg>,
    ) {
        let iface = &mut self.arena[iface_idx];
        if iface.rx_task.is_some() {
            return;
        }

        let path_type = match iface.ifname {
            Some(_) => PathType::IpSingleHop,
            None => PathType::IpMultihop,
        };
        match network::socket_rx_strict(
            iface.local,
            iface.ifname.as_deref(),
            path_type,
            zero_udp6_checksum_rx,
        ) {
            Ok(socket) => {
                iface.rx_task =
                    Some(tasks::udp_rx(socket, path_type, udp_packet_rxp));
            }
            Err(error) => {
                IoError::UdpSocketError(error).log();
            }
        }
    }

    // Returns an iterator visiting all interfaces mutably.
    pub(crate) fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = (IfaceIndex, &'_ mut SessionIface)> + '_ {
        self.arena.iter_mut()
    }
}

impl std::ops::Index<IfaceIndex> for IfacePool {
    type Output = SessionIface;

    fn index(&self, index: IfaceIndex) -> &Self::Output {
        &self.arena[index]
    }
}

impl std::ops::IndexMut<IfaceIndex> for IfacePool {
    fn index_mut(&mut self, index: IfaceIndex) -> &mut Self::Output {
        &mut self.arena[index]
    }
}
