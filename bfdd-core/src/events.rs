//
// Copyright (c) The Bfdd Project Developers
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, SocketAddr};

use bfdd_utils::bfd::{SessionKey, SessionOptions, State};
use bfdd_utils::ip::IpAddrExt;
use bytes::Bytes;
use tracing::trace;

use crate::config::{InstanceCfg, SessionCfg};
use crate::debug::Debug;
use crate::error::Error;
use crate::master::Master;
use crate::network::{self, PacketInfo};
use crate::packet::{DiagnosticCode, Packet, PacketFlags};
use crate::registry::{RegistryMsg, RequestId};
use crate::session::{
    Session, SessionClient, SessionId, SessionIndex, SessionRemoteInfo,
};

// ===== UDP packet receipt =====

pub fn process_udp_packet(
    master: &mut Master,
    packet_info: PacketInfo,
    packet: Packet,
    bytes: Bytes,
) -> Result<(), Error> {
    trace!(?packet_info, ?packet, "received packet");

    // Session lookup varies depending on whether the Your Discriminator
    // field is zero or not.
    let Some((_, sess)) = (match packet.your_discr {
        0 => match &packet_info {
            PacketInfo::IpSingleHop { src, ifindex } => {
                master.sessions.get_mut_by_addr(*src, *ifindex)
            }
            PacketInfo::IpMultihop { src, .. } => {
                master.sessions.get_mut_by_addr(*src, 0)
            }
        },
        _ => master.sessions.get_mut_by_discr(packet.your_discr),
    }) else {
        // Discard the packet.
        return Err(Error::SessionNoMatch(packet_info, packet.your_discr));
    };

    // Update packet counter.
    sess.statistics.rx_packet_count += 1;

    // Validation checks.
    if let Err(error) = validate_packet(&packet) {
        sess.statistics.rx_error_count += 1;
        return Err(error);
    }

    // Authentication checks (RFC 5880 section 6.7). A failure discards the
    // packet but leaves the session untouched.
    if let Err(error) = validate_auth(sess, &packet, &bytes) {
        sess.statistics.rx_error_count += 1;
        sess.statistics.rx_auth_error_count += 1;
        return Err(error);
    }
    if let Some(seq) = packet.auth.as_ref().and_then(|tlv| tlv.seq()) {
        sess.state.auth.rx_seq = seq;
        sess.state.auth.rx_seq_known = true;
    }

    // Update the remote parameters, keeping the transmit-relevant values
    // the schedule was computed from.
    let old_tx_int = sess.state.des_min_tx_curr;
    let old_rx_int = sess.remote_min_rx_interval();
    sess.state.remote = Some(SessionRemoteInfo::new(
        packet.state,
        packet.my_discr,
        packet.diag,
        packet.detect_mult,
        packet.desired_min_tx,
        packet.req_min_rx,
        packet.flags.contains(PacketFlags::D),
    ));

    // If a Poll Sequence is being transmitted by the local system and the
    // Final (F) bit in the received packet is set, the Poll Sequence MUST
    // be terminated.
    if sess.poll_is_active() && packet.flags.contains(PacketFlags::F) {
        sess.terminate_poll();
    }

    // Honor changed transmit intervals right away (RFC 5880 section 6.8.2).
    if sess.state.des_min_tx_curr != old_tx_int
        || sess.remote_min_rx_interval() != old_rx_int
    {
        sess.control_tx_timer(true);
    }

    // Update the Detection Time as described in section 6.8.4.
    sess.update_detection_time(true, &master.tx.protocol_input.detect_timer);

    // Invoke FSM event.
    let next_state = match (sess.state.local_state, packet.state) {
        (State::AdminDown, _) => {
            // Silently discard the packet.
            return Ok(());
        }
        (State::Init | State::Up, State::AdminDown) => {
            Some((State::Down, DiagnosticCode::NbrDown))
        }
        (State::Down, State::Down) => {
            Some((State::Init, DiagnosticCode::Nothing))
        }
        (State::Down, State::Init) => {
            Some((State::Up, DiagnosticCode::Nothing))
        }
        (State::Init, State::Init | State::Up) => {
            Some((State::Up, DiagnosticCode::Nothing))
        }
        (State::Up, State::Down) => {
            Some((State::Down, DiagnosticCode::NbrDown))
        }
        _ => None,
    };
    if let Some((state, diag)) = next_state {
        // Effectively transition to the new FSM state.
        sess.state_update(state, diag);
    }

    // Make sure transmission is running if it should be, e.g. on a passive
    // session that just learned the remote discriminator.
    sess.control_tx_timer(false);

    // If the Poll (P) bit is set, send a BFD Control packet to the remote
    // system with the Poll (P) bit clear, and the Final (F) bit set.
    if packet.flags.contains(PacketFlags::P) {
        sess.send_tx_final();
    }

    Ok(())
}

// Checks whether the BFD packet is valid.
fn validate_packet(packet: &Packet) -> Result<(), Error> {
    if packet.version != Packet::VERSION {
        return Err(Error::VersionMismatch(packet.version));
    }
    if packet.detect_mult == 0 {
        return Err(Error::InvalidDetectMult(packet.detect_mult));
    }
    if packet.flags.contains(PacketFlags::M)
        || packet.flags.contains(PacketFlags::P | PacketFlags::F)
    {
        return Err(Error::InvalidFlags(packet.flags));
    }
    if packet.my_discr == 0 {
        return Err(Error::InvalidMyDiscriminator(packet.my_discr));
    }
    if packet.your_discr == 0
        && !matches!(packet.state, State::Down | State::AdminDown)
    {
        return Err(Error::InvalidYourDiscriminator(packet.your_discr));
    }

    Ok(())
}

// Checks the packet's authentication section against the session's
// authentication configuration.
fn validate_auth(
    sess: &Session,
    packet: &Packet,
    bytes: &[u8],
) -> Result<(), Error> {
    match (&sess.config.auth, &packet.auth) {
        (None, None) => Ok(()),
        (None, Some(_)) | (Some(_), None) => {
            Err(Error::AuthError(sess.key.clone()))
        }
        (Some(auth_cfg), Some(tlv)) => {
            let Some(key) = auth_cfg.keychain.key_lookup_accept(tlv.key_id())
            else {
                return Err(Error::AuthError(sess.key.clone()));
            };
            if !Packet::verify_auth(bytes, tlv, auth_cfg.auth_type, key) {
                return Err(Error::AuthError(sess.key.clone()));
            }
            if let Some(seq) = tlv.seq()
                && !sess.rx_seq_valid(auth_cfg.auth_type, seq)
            {
                return Err(Error::AuthError(sess.key.clone()));
            }
            Ok(())
        }
    }
}

// ===== detection timer expiration =====

pub fn process_detect_timer(
    master: &mut Master,
    sess_id: SessionId,
) -> Result<(), Error> {
    let (_, sess) = master.sessions.get_mut_by_id(sess_id)?;

    Debug::DetectionTimeExpiry(&sess.key).log();

    // The peer is dead: forget everything learned from it and cancel any
    // poll sequence in flight.
    sess.state.remote = None;
    sess.state.auth.rx_seq_known = false;
    sess.state.poll_scheduled = Default::default();
    sess.state
        .poll_active
        .store(0, std::sync::atomic::Ordering::Relaxed);
    sess.state.detection_timer = None;

    // Transition to the "Down" state.
    sess.state_update(State::Down, DiagnosticCode::TimeExpired);

    // Restart transmission at the idle rate.
    sess.control_tx_timer(true);

    Ok(())
}

// ===== request (un)registration =====

pub fn process_session_reg(
    master: &mut Master,
    key: SessionKey,
    local: Option<IpAddr>,
    client: SessionClient,
) -> Result<(), Error> {
    Debug::SessionClientReg(&key, &client.client_id).log();

    let sess_idx = match master.sessions.get_mut_by_key(&key) {
        Some((sess_idx, _)) => sess_idx,
        None => create_session(master, &key, local, client.options.as_ref()),
    };

    // Attach the request and report the session's current state back.
    let sess = &mut master.sessions[sess_idx];
    let request_id = client.id;
    let client_tx = client.tx.clone();
    sess.clients.insert(client.id, client);
    let _ = client_tx.send(RegistryMsg::SessionUpd {
        request_id,
        state: sess.state.local_state,
        rem_state: sess.remote_state(),
        diag: sess.state.local_diag,
    });

    // Start UDP Rx tasks if necessary.
    master.update_udp_rx_tasks();

    Ok(())
}

fn create_session(
    master: &mut Master,
    key: &SessionKey,
    local: Option<IpAddr>,
    options: Option<&SessionOptions>,
) -> SessionIndex {
    let (ifname, af, local_addr) = match key {
        SessionKey::IpSingleHop { ifname, dst } => {
            let af = dst.address_family();
            let local_addr = local.unwrap_or(IpAddr::unspecified(af));
            (Some(ifname.as_str()), af, local_addr)
        }
        SessionKey::IpMultihop { src, dst } => {
            (None, dst.address_family(), *src)
        }
    };

    // Merge the interface-level configuration with the request's overlay.
    let iface_cfg = master.config.iface_cfg(ifname).clone();
    let config = SessionCfg::merge(&iface_cfg, options);

    // Resolve or create the owning interface.
    let iface_idx = master.ifaces.get(local_addr, ifname, af, &iface_cfg);
    if master.config.strict_bind {
        master.ifaces.start_strict_rx(
            iface_idx,
            master.config.zero_udp6_checksum_rx,
            &master.tx.protocol_input.udp_packet_rx,
        );
    }

    let (sess_idx, sess) =
        master.sessions.insert(key.clone(), iface_idx, config);
    sess.state.socket_tx = master.ifaces[iface_idx].socket_tx.clone();

    // Try to start transmission if the destination is usable already.
    match key {
        SessionKey::IpSingleHop { ifname, .. } => {
            // Single-hop sessions can only transmit as long as their
            // associated interface is present.
            if let Some(iface) = master.interfaces.get(ifname) {
                let ifindex = iface.ifindex;
                master.sessions.update_ifindex(sess_idx, ifindex);
            }
        }
        SessionKey::IpMultihop { dst, .. } => {
            sess.state.sockaddr =
                Some(SocketAddr::new(*dst, network::PORT_DST_MULTIHOP));
            sess.control_tx_timer(true);
        }
    }

    sess_idx
}

pub fn process_session_unreg(
    master: &mut Master,
    key: SessionKey,
    request_id: RequestId,
) -> Result<(), Error> {
    if let Some((sess_idx, sess)) = master.sessions.get_mut_by_key(&key) {
        if let Some(client) = sess.clients.remove(&request_id) {
            Debug::SessionClientUnreg(&key, &client.client_id).log();
        }

        // Delete the session once the last request is gone, releasing the
        // owning interface.
        if sess.clients.is_empty() {
            let iface_idx = sess.iface_idx;
            master.sessions.delete(sess_idx);
            master.ifaces.release(iface_idx);
        }

        // Stop UDP Rx tasks if necessary.
        master.update_udp_rx_tasks();
    }

    Ok(())
}

pub fn process_session_update(
    master: &mut Master,
    key: SessionKey,
    request_id: RequestId,
    options: Option<SessionOptions>,
) -> Result<(), Error> {
    if let Some((sess_idx, sess)) = master.sessions.get_mut_by_key(&key) {
        if let Some(client) = sess.clients.get_mut(&request_id) {
            client.options = options;
        }
        reconfigure_session(master, sess_idx);
    }

    Ok(())
}

// ===== reconfiguration =====

// Reapplies the session parameters after a configuration change, using
// the head request's option overlay. Interval changes go through the poll
// sequence as required by RFC 5880 section 6.8.3.
pub fn reconfigure_session(master: &mut Master, sess_idx: SessionIndex) {
    let sess = &mut master.sessions[sess_idx];
    let Some(head) = sess.clients.values().next() else {
        return;
    };
    let options = head.options;

    let ifname = sess
        .key
        .as_ip_single_hop()
        .map(|(ifname, _)| ifname.as_str());
    let iface_cfg = master.config.iface_cfg(ifname);
    sess.config = SessionCfg::merge(iface_cfg, options.as_ref());

    let min_tx = match sess.state.local_state {
        State::Up => sess.config.min_tx,
        _ => sess.config.idle_tx,
    };
    sess.set_min_tx(min_tx);
    let min_rx = sess.config.min_rx;
    sess.set_min_rx(min_rx, &master.tx.protocol_input.detect_timer);
    sess.state.detect_mult = sess.config.multiplier;
    sess.state.passive = sess.config.passive;

    // Recompute the detection deadline in place so that a shortened
    // detection time takes effect at once.
    sess.update_detection_time(false, &master.tx.protocol_input.detect_timer);

    sess.control_tx_timer(false);

    Debug::SessionReconfigure(&sess.key).log();
}

pub fn process_reconfigure(
    master: &mut Master,
    new_cfg: InstanceCfg,
) -> Result<(), Error> {
    // Reject invalid or incompatible configurations, keeping the previous
    // one active.
    new_cfg.validate()?;
    master.config.compatible(&new_cfg)?;
    master.config = new_cfg;

    // Mark the interfaces whose configuration changed.
    let mut changed = Vec::new();
    for (iface_idx, iface) in master.ifaces.iter_mut() {
        let cfg = master.config.iface_cfg(iface.ifname.as_deref());
        if iface.cfg != *cfg {
            iface.cfg = cfg.clone();
            iface.changed = true;
            changed.push(iface_idx);
        }
    }

    // Reapply the parameters of every session on a changed interface.
    for sess_idx in master.sessions.indexes().collect::<Vec<_>>() {
        let iface_idx = master.sessions[sess_idx].iface_idx;
        if master.ifaces[iface_idx].changed {
            reconfigure_session(master, sess_idx);
        }
    }
    for iface_idx in changed {
        master.ifaces[iface_idx].changed = false;
    }

    Ok(())
}

// ===== interface updates =====

pub fn process_iface_update(
    master: &mut Master,
    ifname: String,
    ifindex: Option<u32>,
) {
    use std::collections::hash_map::Entry;

    use crate::master::Interface;

    // Update the interface's ifindex.
    match master.interfaces.entry(ifname.clone()) {
        Entry::Occupied(mut o) => {
            let iface = o.get_mut();
            // Return earlier if the ifindex hasn't changed.
            if iface.ifindex == ifindex {
                return;
            }
            iface.ifindex = ifindex;
        }
        Entry::Vacant(v) => {
            let iface = Interface::new(ifname.clone(), ifindex);
            v.insert(iface);
        }
    }

    // Update the ifindex of all single-hop sessions attached to this
    // interface.
    for sess_idx in master
        .sessions
        .iter_by_ifname(&ifname)
        .collect::<Vec<_>>()
    {
        master.sessions.update_ifindex(sess_idx, ifindex);
    }
}
