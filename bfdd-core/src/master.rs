//
// Copyright (c) The Bfdd Project Developers
//
// SPDX-License-Identifier: MIT
//

use std::collections::HashMap;
use std::net::IpAddr;

use bfdd_utils::bfd::{PathType, SessionKey, SessionOptions};
use bfdd_utils::ip::AddressFamily;
use bfdd_utils::task::Task;
use bfdd_utils::{Receiver, Sender, UnboundedReceiver, UnboundedSender};
use derive_new::new;
use tokio::sync::mpsc;

use crate::config::InstanceCfg;
use crate::debug::Debug;
use crate::error::{Error, IoError};
use crate::iface::IfacePool;
use crate::registry::RequestId;
use crate::session::{SessionClient, Sessions};
use crate::tasks::messages::ProtocolInputMsg;
use crate::tasks::messages::input::{DetectTimerMsg, UdpRxPacketMsg};
use crate::{events, network, tasks};

#[derive(Debug)]
pub struct Master {
    // Instance name.
    pub name: String,
    // Instance configuration.
    pub config: InstanceCfg,
    // UDP Rx tasks.
    udp_sh_rx_tasks: Option<UdpRxTasks>,
    udp_mh_rx_tasks: Option<UdpRxTasks>,
    // BFD sessions.
    pub sessions: Sessions,
    // Interface pool owning the Tx sockets.
    pub ifaces: IfacePool,
    // System interfaces.
    pub interfaces: HashMap<String, Interface>,
    // Instance Tx channels.
    pub tx: InstanceChannelsTx,
}

#[derive(Debug)]
pub struct UdpRxTasks {
    _ipv4: Option<Task<()>>,
    _ipv6: Option<Task<()>>,
}

#[derive(Debug, new)]
pub struct Interface {
    pub name: String,
    pub ifindex: Option<u32>,
}

// Control-plane messages, processed in the instance's loop context.
#[derive(Debug)]
pub enum ControlMsg {
    SessionReg {
        key: SessionKey,
        local: Option<IpAddr>,
        client: SessionClient,
    },
    SessionUnreg {
        key: SessionKey,
        request_id: RequestId,
    },
    SessionUpdate {
        key: SessionKey,
        request_id: RequestId,
        options: Option<SessionOptions>,
    },
    IfaceUpd {
        ifname: String,
        ifindex: Option<u32>,
    },
    Reconfigure(InstanceCfg),
}

#[derive(Clone, Debug)]
pub struct InstanceChannelsTx {
    pub protocol_input: ProtocolInputChannelsTx,
}

#[derive(Clone, Debug)]
pub struct ProtocolInputChannelsTx {
    // UDP Rx event.
    pub udp_packet_rx: Sender<UdpRxPacketMsg>,
    // Detection timer.
    pub detect_timer: Sender<DetectTimerMsg>,
}

#[derive(Debug)]
pub struct ProtocolInputChannelsRx {
    // UDP Rx event.
    pub udp_packet_rx: Receiver<UdpRxPacketMsg>,
    // Detection timer.
    pub detect_timer: Receiver<DetectTimerMsg>,
}

// Handle used by the control plane to reach a running instance. Dropping
// the last handle shuts the instance down.
#[derive(Debug)]
pub struct InstanceHandle {
    pub name: String,
    pub(crate) cfg: InstanceCfg,
    control_tx: UnboundedSender<ControlMsg>,
}

// ===== impl Master =====

impl Master {
    pub fn new(
        name: String,
        config: InstanceCfg,
        tx: InstanceChannelsTx,
    ) -> Master {
        Master {
            name,
            config,
            udp_sh_rx_tasks: None,
            udp_mh_rx_tasks: None,
            sessions: Default::default(),
            ifaces: Default::default(),
            interfaces: Default::default(),
            tx,
        }
    }

    // Starts or stops UDP Rx tasks for single-hop and multihop sessions.
    //
    // A single-hop/multihop UDP Rx task is conditioned to existence of at
    // least one BFD session of that path type. This is done to avoid
    // creating UDP sockets that are not necessary.
    pub(crate) fn update_udp_rx_tasks(&mut self) {
        // In strict-bind mode the Rx sockets belong to the interface pool.
        if self.config.strict_bind {
            return;
        }

        let ip_sh_sessions =
            self.sessions.iter().any(|sess| sess.key.is_ip_single_hop());
        let ip_mh_sessions =
            self.sessions.iter().any(|sess| sess.key.is_ip_multihop());
        let udp_packet_rxp = &self.tx.protocol_input.udp_packet_rx;

        // Update IP single-hop Rx tasks.
        if ip_sh_sessions && self.udp_sh_rx_tasks.is_none() {
            self.udp_sh_rx_tasks = Some(UdpRxTasks::new(
                PathType::IpSingleHop,
                &self.config,
                udp_packet_rxp,
            ));
        } else if !ip_sh_sessions && self.udp_sh_rx_tasks.is_some() {
            self.udp_sh_rx_tasks = None;
        }

        // Update IP multihop Rx tasks.
        if ip_mh_sessions && self.udp_mh_rx_tasks.is_none() {
            self.udp_mh_rx_tasks = Some(UdpRxTasks::new(
                PathType::IpMultihop,
                &self.config,
                udp_packet_rxp,
            ));
        } else if !ip_mh_sessions && self.udp_mh_rx_tasks.is_some() {
            self.udp_mh_rx_tasks = None;
        }
    }

    fn process_control_msg(&mut self, msg: ControlMsg) {
        if let Err(error) = match msg {
            ControlMsg::SessionReg { key, local, client } => {
                events::process_session_reg(self, key, local, client)
            }
            ControlMsg::SessionUnreg { key, request_id } => {
                events::process_session_unreg(self, key, request_id)
            }
            ControlMsg::SessionUpdate {
                key,
                request_id,
                options,
            } => events::process_session_update(self, key, request_id, options),
            ControlMsg::IfaceUpd { ifname, ifindex } => {
                events::process_iface_update(self, ifname, ifindex);
                Ok(())
            }
            ControlMsg::Reconfigure(config) => {
                events::process_reconfigure(self, config)
            }
        } {
            error.log();
        }
    }

    fn process_protocol_msg(&mut self, msg: ProtocolInputMsg) {
        if let Err(error) = match msg {
            // Received UDP packet.
            ProtocolInputMsg::UdpRxPacket(msg) => events::process_udp_packet(
                self,
                msg.packet_info,
                msg.packet,
                msg.bytes,
            ),
            // Session detection timer expired.
            ProtocolInputMsg::DetectTimer(msg) => {
                events::process_detect_timer(self, msg.sess_id)
            }
        } {
            error.log();
        }
    }
}

// ===== impl UdpRxTasks =====

impl UdpRxTasks {
    // Starts UDP Rx tasks for the given BFD path type, restricted to the
    // address families the instance accepts.
    fn new(
        path_type: PathType,
        config: &InstanceCfg,
        udp_packet_rxp: &Sender<UdpRxPacketMsg>,
    ) -> Self {
        let udp_rx_task = |af| match network::socket_rx(
            path_type,
            af,
            config.zero_udp6_checksum_rx,
        ) {
            Ok(socket) => {
                Some(tasks::udp_rx(socket, path_type, udp_packet_rxp))
            }
            Err(error) => {
                IoError::UdpSocketError(error).log();
                None
            }
        };
        UdpRxTasks {
            _ipv4: config
                .accept_ipv4
                .then(|| udp_rx_task(AddressFamily::Ipv4))
                .flatten(),
            _ipv6: config
                .accept_ipv6
                .then(|| udp_rx_task(AddressFamily::Ipv6))
                .flatten(),
        }
    }
}

// ===== impl ProtocolInputChannelsRx =====

impl ProtocolInputChannelsRx {
    async fn recv(&mut self) -> Option<ProtocolInputMsg> {
        tokio::select! {
            msg = self.udp_packet_rx.recv() => {
                msg.map(ProtocolInputMsg::UdpRxPacket)
            }
            msg = self.detect_timer.recv() => {
                msg.map(ProtocolInputMsg::DetectTimer)
            }
        }
    }
}

// ===== impl InstanceHandle =====

impl InstanceHandle {
    pub(crate) fn send(&self, msg: ControlMsg) {
        let _ = self.control_tx.send(msg);
    }

    // Checks whether the instance accepts a request for the given target.
    pub(crate) fn accepts(
        &self,
        remote: &IpAddr,
        direct: bool,
        vrf: Option<&str>,
    ) -> bool {
        if self.cfg.vrf.as_deref() != vrf {
            return false;
        }
        let af_ok = match remote {
            IpAddr::V4(_) => self.cfg.accept_ipv4,
            IpAddr::V6(_) => self.cfg.accept_ipv6,
        };
        let path_ok = match direct {
            true => self.cfg.accept_direct,
            false => self.cfg.accept_multihop,
        };
        af_ok && path_ok
    }
}

// ===== global functions =====

pub fn protocol_input_channels()
-> (ProtocolInputChannelsTx, ProtocolInputChannelsRx) {
    let (udp_packet_rxp, udp_packet_rxc) = mpsc::channel(4);
    let (detect_timerp, detect_timerc) = mpsc::channel(4);

    let tx = ProtocolInputChannelsTx {
        udp_packet_rx: udp_packet_rxp,
        detect_timer: detect_timerp,
    };
    let rx = ProtocolInputChannelsRx {
        udp_packet_rx: udp_packet_rxc,
        detect_timer: detect_timerc,
    };

    (tx, rx)
}

async fn run(
    name: String,
    config: InstanceCfg,
    mut control_rx: UnboundedReceiver<ControlMsg>,
) {
    Debug::InstanceStart(&name).log();

    let (proto_tx, mut proto_rx) = protocol_input_channels();
    let tx = InstanceChannelsTx {
        protocol_input: proto_tx,
    };
    let mut master = Master::new(name, config, tx);

    // Main event loop.
    loop {
        tokio::select! {
            msg = control_rx.recv() => match msg {
                Some(msg) => master.process_control_msg(msg),
                // All control handles are gone; shut down. Dropping the
                // sessions cancels their timers and closes the sockets.
                None => break,
            },
            Some(msg) = proto_rx.recv() => master.process_protocol_msg(msg),
        }
    }

    Debug::InstanceStop(&master.name).log();
}

// Spawns a BFD instance, returning the control-plane handle for it.
//
// In production the instance runs on a dedicated OS thread so that timer
// processing doesn't contend with other tasks on the cooperative
// scheduler. In testing it runs as an async task so message ordering is
// deterministic under the single-threaded runtime.
pub fn spawn_instance(
    name: &str,
    config: InstanceCfg,
) -> Result<InstanceHandle, Error> {
    config.validate()?;

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let handle = InstanceHandle {
        name: name.to_owned(),
        cfg: config.clone(),
        control_tx,
    };

    let fut = run(name.to_owned(), config, control_rx);
    #[cfg(not(feature = "testing"))]
    let mut task = Task::spawn_blocking(move || {
        tokio::runtime::Handle::current().block_on(fut)
    });
    #[cfg(feature = "testing")]
    let mut task = Task::spawn(fut);
    task.detach();

    Ok(handle)
}
