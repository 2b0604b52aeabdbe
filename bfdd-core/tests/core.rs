//
// Copyright (c) The Bfdd Project Developers
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;
use std::sync::Arc;

use bfdd_core::config::{AuthCfg, IfaceCfg, InstanceCfg};
use bfdd_core::error::Error;
use bfdd_core::events;
use bfdd_core::master::{InstanceChannelsTx, Master, protocol_input_channels};
use bfdd_core::network::PacketInfo;
use bfdd_core::packet::{
    AuthCtx, AuthTlv, AuthenticationType, DiagnosticCode, Packet, PacketFlags,
};
use bfdd_core::registry::{RegistryMsg, RequestId};
use bfdd_core::session::{PollFlags, SessionClient};
use bfdd_utils::bfd::{ClientId, SessionKey, SessionOptions, State};
use bfdd_utils::crypto::CryptoAlgo;
use bfdd_utils::keychain::{Key, Keychain, KeychainKey};
use bfdd_utils::protocol::Protocol;
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedReceiver;

const REMOTE_DISCR: u32 = 0x9fb205d6;

//
// Helper functions.
//

fn new_master(config: InstanceCfg) -> Master {
    // The receiving halves go unused: timer and Rx tasks are inert stubs
    // in the testing build, so nothing ever sends on these channels.
    let (proto_tx, _proto_rx) = protocol_input_channels();
    Master::new(
        "test".to_owned(),
        config,
        InstanceChannelsTx {
            protocol_input: proto_tx,
        },
    )
}

fn register(
    master: &mut Master,
    key: &SessionKey,
    request_id: u64,
    options: Option<SessionOptions>,
    notify_tx: &mpsc::UnboundedSender<RegistryMsg>,
) {
    let client = SessionClient::new(
        RequestId(request_id),
        ClientId::new(Protocol::STATIC, "test".to_owned()),
        options,
        notify_tx.clone(),
    );
    events::process_session_reg(master, key.clone(), None, client).unwrap();
}

fn remote_packet(state: State, your_discr: u32) -> Packet {
    Packet {
        version: 1,
        diag: 0,
        state,
        flags: PacketFlags::empty(),
        detect_mult: 3,
        my_discr: REMOTE_DISCR,
        your_discr,
        desired_min_tx: 100000,
        req_min_rx: 100000,
        req_min_echo_rx: 0,
        auth: None,
    }
}

fn rx(master: &mut Master, packet_info: PacketInfo, packet: Packet) {
    let bytes = packet.encode(None).freeze();
    events::process_udp_packet(master, packet_info, packet, bytes).unwrap();
}

fn single_hop(src: &str, ifindex: u32) -> PacketInfo {
    PacketInfo::IpSingleHop {
        src: src.parse().unwrap(),
        ifindex,
    }
}

// Drives the session from Down to Up with two received packets.
fn bringup(master: &mut Master, key: &SessionKey, src: &str, ifindex: u32) {
    rx(master, single_hop(src, ifindex), remote_packet(State::Down, 0));

    let (_, sess) = master.sessions.get_mut_by_key(key).unwrap();
    assert_eq!(sess.state.local_state, State::Init);
    let local_discr = sess.state.local_discr;

    rx(
        master,
        single_hop(src, ifindex),
        remote_packet(State::Init, local_discr),
    );

    let (_, sess) = master.sessions.get_mut_by_key(key).unwrap();
    assert_eq!(sess.state.local_state, State::Up);

    // Commit the poll sequence that leaving the idle Tx rate started.
    let mut packet = remote_packet(State::Up, local_discr);
    packet.flags.insert(PacketFlags::F);
    rx(master, single_hop(src, ifindex), packet);
}

fn drain(
    notify_rx: &mut UnboundedReceiver<RegistryMsg>,
) -> Vec<(State, State, DiagnosticCode)> {
    let mut states = Vec::new();
    while let Ok(msg) = notify_rx.try_recv() {
        if let RegistryMsg::SessionUpd {
            state,
            rem_state,
            diag,
            ..
        } = msg
        {
            states.push((state, rem_state, diag));
        }
    }
    states
}

fn test_key() -> SessionKey {
    SessionKey::IpSingleHop {
        ifname: "eth0".to_owned(),
        dst: "10.0.0.2".parse().unwrap(),
    }
}

//
// Tests.
//

#[tokio::test]
async fn test_session_bringup() {
    let mut master = new_master(InstanceCfg::default());
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    let key = test_key();

    events::process_iface_update(&mut master, "eth0".to_owned(), Some(1));
    register(&mut master, &key, 1, None, &notify_tx);

    // Initial state per RFC 5880 section 6.8.1.
    let (_, sess) = master.sessions.get_mut_by_key(&key).unwrap();
    assert_eq!(sess.state.local_state, State::Down);
    assert_ne!(sess.state.local_discr, 0);
    assert_eq!(sess.state.des_min_tx_curr, 1000000);
    assert_eq!(sess.state.des_min_tx_new, 1000000);
    assert_eq!(sess.state.req_min_rx_curr, 10000);
    assert!(sess.state.tx_task.is_some());
    // No packet received yet, so the detection timer stays unarmed.
    assert!(sess.state.detection_timer.is_none());

    bringup(&mut master, &key, "10.0.0.2", 1);

    let (_, sess) = master.sessions.get_mut_by_key(&key).unwrap();
    assert_eq!(sess.state.local_state, State::Up);
    assert_eq!(sess.state.local_diag, DiagnosticCode::Nothing);
    // Leaving the idle Tx rate was committed by the Final bit.
    assert_eq!(sess.state.des_min_tx_curr, 100000);
    assert_eq!(sess.state.des_min_tx_new, 100000);
    assert!(!sess.poll_is_active());
    assert!(sess.state.detection_timer.is_some());

    // The attached request observed Down (on attach), Init and Up.
    let states = drain(&mut notify_rx)
        .into_iter()
        .map(|(state, _, _)| state)
        .collect::<Vec<_>>();
    assert_eq!(states, vec![State::Down, State::Init, State::Up]);
}

#[tokio::test]
async fn test_passive_session() {
    let mut master = new_master(InstanceCfg::default());
    let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
    let key = test_key();

    events::process_iface_update(&mut master, "eth0".to_owned(), Some(1));
    let options = SessionOptions {
        passive: Some(true),
        ..Default::default()
    };
    register(&mut master, &key, 1, Some(options), &notify_tx);

    // A passive session emits no packets while the remote discriminator is
    // unknown.
    let (_, sess) = master.sessions.get_mut_by_key(&key).unwrap();
    assert!(sess.state.passive);
    assert!(sess.state.tx_task.is_none());

    // The first received packet reveals the peer and transmission starts.
    rx(
        &mut master,
        single_hop("10.0.0.2", 1),
        remote_packet(State::Down, 0),
    );
    let (_, sess) = master.sessions.get_mut_by_key(&key).unwrap();
    assert_eq!(sess.state.local_state, State::Init);
    assert!(sess.state.tx_task.is_some());
}

#[tokio::test]
async fn test_detection_timeout() {
    let mut master = new_master(InstanceCfg::default());
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    let key = test_key();

    events::process_iface_update(&mut master, "eth0".to_owned(), Some(1));
    register(&mut master, &key, 1, None, &notify_tx);
    bringup(&mut master, &key, "10.0.0.2", 1);
    drain(&mut notify_rx);

    let (_, sess) = master.sessions.get_mut_by_key(&key).unwrap();
    let sess_id = sess.id;
    events::process_detect_timer(&mut master, sess_id).unwrap();

    let (_, sess) = master.sessions.get_mut_by_key(&key).unwrap();
    assert_eq!(sess.state.local_state, State::Down);
    assert_eq!(sess.state.local_diag, DiagnosticCode::TimeExpired);
    // All remote parameters are forgotten.
    assert!(sess.state.remote.is_none());
    assert!(!sess.state.auth.rx_seq_known);
    // Transmission resumes at the idle rate; going back to it launched a
    // fresh poll sequence, replacing the one cancelled by the expiry.
    assert_eq!(sess.state.des_min_tx_curr, 1000000);
    assert!(sess.poll_active_bits().contains(PollFlags::TX));
    assert!(sess.state.tx_task.is_some());

    let states = drain(&mut notify_rx);
    assert_eq!(
        states,
        vec![(State::Down, State::Down, DiagnosticCode::TimeExpired)]
    );
}

#[tokio::test]
async fn test_poll_sequence() {
    let mut master = new_master(InstanceCfg::default());
    let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
    let key = test_key();

    events::process_iface_update(&mut master, "eth0".to_owned(), Some(1));
    register(&mut master, &key, 1, None, &notify_tx);
    bringup(&mut master, &key, "10.0.0.2", 1);

    let (_, sess) = master.sessions.get_mut_by_key(&key).unwrap();
    let local_discr = sess.state.local_discr;

    // Increasing the Tx interval while up is deferred until the poll
    // sequence terminates.
    sess.set_min_tx(200000);
    assert_eq!(sess.state.des_min_tx_curr, 100000);
    assert_eq!(sess.state.des_min_tx_new, 200000);
    assert!(sess.poll_active_bits().contains(PollFlags::TX));

    let mut packet = remote_packet(State::Up, local_discr);
    packet.flags.insert(PacketFlags::F);
    rx(&mut master, single_hop("10.0.0.2", 1), packet);

    let (_, sess) = master.sessions.get_mut_by_key(&key).unwrap();
    assert_eq!(sess.state.des_min_tx_curr, 200000);
    assert_eq!(sess.state.des_min_tx_new, 200000);
    assert!(!sess.poll_is_active());

    // Decreasing the Tx interval takes effect at once, but still needs the
    // poll sequence to conclude.
    sess.set_min_tx(50000);
    assert_eq!(sess.state.des_min_tx_curr, 50000);
    assert_eq!(sess.state.des_min_tx_new, 50000);
    assert!(sess.poll_active_bits().contains(PollFlags::TX));

    let mut packet = remote_packet(State::Up, local_discr);
    packet.flags.insert(PacketFlags::F);
    rx(&mut master, single_hop("10.0.0.2", 1), packet);
    let (_, sess) = master.sessions.get_mut_by_key(&key).unwrap();
    assert!(!sess.poll_is_active());

    // A second change while a poll is in flight rolls over into a new
    // sequence instead of being committed by the first Final.
    sess.set_min_tx(300000);
    sess.set_min_tx(400000);
    assert_eq!(sess.state.des_min_tx_curr, 50000);
    assert_eq!(sess.state.des_min_tx_new, 400000);

    let mut packet = remote_packet(State::Up, local_discr);
    packet.flags.insert(PacketFlags::F);
    rx(&mut master, single_hop("10.0.0.2", 1), packet);
    let (_, sess) = master.sessions.get_mut_by_key(&key).unwrap();
    // Still polling for the latest value.
    assert!(sess.poll_active_bits().contains(PollFlags::TX));
    assert_eq!(sess.state.des_min_tx_curr, 50000);

    let mut packet = remote_packet(State::Up, local_discr);
    packet.flags.insert(PacketFlags::F);
    rx(&mut master, single_hop("10.0.0.2", 1), packet);
    let (_, sess) = master.sessions.get_mut_by_key(&key).unwrap();
    assert!(!sess.poll_is_active());
    assert_eq!(sess.state.des_min_tx_curr, 400000);
    assert_eq!(sess.state.des_min_tx_new, 400000);
}

#[tokio::test]
async fn test_admin_down_absorption() {
    let mut master = new_master(InstanceCfg::default());
    let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
    let key = test_key();

    events::process_iface_update(&mut master, "eth0".to_owned(), Some(1));
    register(&mut master, &key, 1, None, &notify_tx);

    let (_, sess) = master.sessions.get_mut_by_key(&key).unwrap();
    sess.state_update(State::AdminDown, DiagnosticCode::AdminDown);
    let local_discr = sess.state.local_discr;

    // No received state moves an administratively down session.
    for packet in [
        remote_packet(State::Down, 0),
        remote_packet(State::Init, local_discr),
        remote_packet(State::Up, local_discr),
    ] {
        rx(&mut master, single_hop("10.0.0.2", 1), packet);
        let (_, sess) = master.sessions.get_mut_by_key(&key).unwrap();
        assert_eq!(sess.state.local_state, State::AdminDown);
    }
}

#[tokio::test]
async fn test_remote_min_rx_zero() {
    let mut master = new_master(InstanceCfg::default());
    let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
    let key = test_key();

    events::process_iface_update(&mut master, "eth0".to_owned(), Some(1));
    register(&mut master, &key, 1, None, &notify_tx);

    let (_, sess) = master.sessions.get_mut_by_key(&key).unwrap();
    assert!(sess.state.tx_task.is_some());

    // A remote Required Min Rx Interval of zero stops transmission.
    let mut packet = remote_packet(State::Down, 0);
    packet.req_min_rx = 0;
    rx(&mut master, single_hop("10.0.0.2", 1), packet);

    let (_, sess) = master.sessions.get_mut_by_key(&key).unwrap();
    assert!(sess.state.tx_task.is_none());
}

#[tokio::test]
async fn test_session_indexes() {
    let mut master = new_master(InstanceCfg::default());
    let (notify_tx, _notify_rx) = mpsc::unbounded_channel();

    events::process_iface_update(&mut master, "eth0".to_owned(), Some(1));
    let key1 = test_key();
    let key2 = SessionKey::IpSingleHop {
        ifname: "eth0".to_owned(),
        dst: "10.0.0.3".parse().unwrap(),
    };
    let key3 = SessionKey::IpMultihop {
        src: "10.0.0.1".parse().unwrap(),
        dst: "172.16.0.9".parse().unwrap(),
    };
    register(&mut master, &key1, 1, None, &notify_tx);
    register(&mut master, &key2, 2, None, &notify_tx);
    register(&mut master, &key3, 3, None, &notify_tx);

    // Local discriminators are nonzero and unique.
    let discrs = master
        .sessions
        .iter()
        .map(|sess| sess.state.local_discr)
        .collect::<Vec<_>>();
    assert_eq!(discrs.len(), 3);
    assert!(discrs.iter().all(|discr| *discr != 0));
    assert!(discrs.iter().collect::<std::collections::HashSet<_>>().len() == 3);

    // The discriminator and address indexes agree with the key index.
    for (key, addr, ifindex) in [
        (&key1, "10.0.0.2", 1u32),
        (&key2, "10.0.0.3", 1),
        (&key3, "172.16.0.9", 0),
    ] {
        let (sess_idx, sess) = master.sessions.get_mut_by_key(key).unwrap();
        let id = sess.id;
        let discr = sess.state.local_discr;
        let (by_discr_idx, by_discr) =
            master.sessions.get_mut_by_discr(discr).unwrap();
        assert_eq!(sess_idx, by_discr_idx);
        assert_eq!(by_discr.id, id);
        let addr: IpAddr = addr.parse().unwrap();
        let (by_addr_idx, by_addr) =
            master.sessions.get_mut_by_addr(addr, ifindex).unwrap();
        assert_eq!(sess_idx, by_addr_idx);
        assert_eq!(by_addr.id, id);
    }
}

#[tokio::test]
async fn test_session_deletion() {
    let mut master = new_master(InstanceCfg::default());
    let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
    let key = test_key();

    events::process_iface_update(&mut master, "eth0".to_owned(), Some(1));
    register(&mut master, &key, 1, None, &notify_tx);
    register(&mut master, &key, 2, None, &notify_tx);

    // The session stays alive while a request remains attached.
    events::process_session_unreg(&mut master, key.clone(), RequestId(1))
        .unwrap();
    assert!(master.sessions.get_mut_by_key(&key).is_some());

    // The last detach deletes the session.
    events::process_session_unreg(&mut master, key.clone(), RequestId(2))
        .unwrap();
    assert!(master.sessions.get_mut_by_key(&key).is_none());
}

#[tokio::test]
async fn test_reconfiguration() {
    let mut master = new_master(InstanceCfg::default());
    let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
    let key = test_key();

    events::process_iface_update(&mut master, "eth0".to_owned(), Some(1));
    register(&mut master, &key, 1, None, &notify_tx);

    // Shrink the idle Tx interval and the multiplier on eth0.
    let mut new_cfg = InstanceCfg::default();
    new_cfg.ifaces.insert(
        "eth0".to_owned(),
        IfaceCfg {
            idle_tx: 500000,
            multiplier: 3,
            ..Default::default()
        },
    );
    events::process_reconfigure(&mut master, new_cfg).unwrap();

    let (_, sess) = master.sessions.get_mut_by_key(&key).unwrap();
    assert_eq!(sess.state.detect_mult, 3);
    // The session is down, so the new idle Tx interval applies at once.
    assert_eq!(sess.state.des_min_tx_curr, 500000);

    // An invalid configuration is rejected and the previous one stays
    // active.
    let mut bad_cfg = InstanceCfg::default();
    bad_cfg.iface_defaults.multiplier = 0;
    assert!(matches!(
        events::process_reconfigure(&mut master, bad_cfg),
        Err(Error::InvalidConfig(..))
    ));
    assert_eq!(master.config.iface_cfg(Some("eth0")).multiplier, 3);
}

#[tokio::test]
async fn test_authentication() {
    let mut config = InstanceCfg::default();
    let mut keychain = Keychain::new("bfd-keys".to_owned());
    let key_data = Key::new(1, CryptoAlgo::ClearText, b"secret".to_vec());
    keychain.keys.insert(1, KeychainKey::new(key_data.clone()));
    config.iface_defaults.auth = Some(AuthCfg {
        auth_type: AuthenticationType::SimplePassword,
        keychain: Arc::new(keychain),
    });

    let mut master = new_master(config);
    let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
    let key = test_key();

    events::process_iface_update(&mut master, "eth0".to_owned(), Some(1));
    register(&mut master, &key, 1, None, &notify_tx);

    // An unauthenticated packet is discarded and leaves the session
    // untouched.
    let packet = remote_packet(State::Down, 0);
    let bytes = packet.encode(None).freeze();
    let result = events::process_udp_packet(
        &mut master,
        single_hop("10.0.0.2", 1),
        packet,
        bytes,
    );
    assert!(matches!(result, Err(Error::AuthError(..))));
    let (_, sess) = master.sessions.get_mut_by_key(&key).unwrap();
    assert_eq!(sess.state.local_state, State::Down);
    assert_eq!(sess.statistics.rx_auth_error_count, 1);

    // A packet carrying the right password is accepted.
    let mut packet = remote_packet(State::Down, 0);
    packet.auth = Some(AuthTlv::SimplePassword {
        key_id: 1,
        password: b"secret".to_vec(),
    });
    let auth = AuthCtx {
        auth_type: AuthenticationType::SimplePassword,
        key: &key_data,
        seq: 0,
    };
    let bytes = packet.encode(Some(&auth)).freeze();
    events::process_udp_packet(
        &mut master,
        single_hop("10.0.0.2", 1),
        packet,
        bytes,
    )
    .unwrap();
    let (_, sess) = master.sessions.get_mut_by_key(&key).unwrap();
    assert_eq!(sess.state.local_state, State::Init);
}

#[tokio::test]
async fn test_multihop_session() {
    let mut master = new_master(InstanceCfg::default());
    let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
    let key = SessionKey::IpMultihop {
        src: "10.0.0.1".parse().unwrap(),
        dst: "172.16.0.9".parse().unwrap(),
    };

    register(&mut master, &key, 1, None, &notify_tx);

    let (_, sess) = master.sessions.get_mut_by_key(&key).unwrap();
    assert_eq!(sess.state.sockaddr.unwrap().port(), 4784);
    assert!(sess.state.tx_task.is_some());

    // Multihop packets are matched on the (source address, 0) pair.
    let packet_info = PacketInfo::IpMultihop {
        src: "172.16.0.9".parse().unwrap(),
        dst: "10.0.0.1".parse().unwrap(),
    };
    rx(&mut master, packet_info, remote_packet(State::Down, 0));
    let (_, sess) = master.sessions.get_mut_by_key(&key).unwrap();
    assert_eq!(sess.state.local_state, State::Init);
}
