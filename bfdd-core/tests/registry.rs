//
// Copyright (c) The Bfdd Project Developers
//
// SPDX-License-Identifier: MIT
//

use bfdd_core::config::{InstanceCfg, NeighborCfg};
use bfdd_core::master;
use bfdd_core::packet::DiagnosticCode;
use bfdd_core::registry::{Registry, RequestState, RequestTarget};
use bfdd_utils::bfd::{ClientId, State};
use bfdd_utils::protocol::Protocol;
use tokio::sync::mpsc;

fn target(remote: &str, ifname: Option<&str>) -> RequestTarget {
    RequestTarget {
        remote: remote.parse().unwrap(),
        local: None,
        ifname: ifname.map(str::to_owned),
        vrf: None,
    }
}

#[tokio::test]
async fn test_wait_list_handover() {
    let mut registry = Registry::new();
    let (cb_tx, mut cb_rx) = mpsc::unbounded_channel();

    let hook = {
        let cb_tx = cb_tx.clone();
        Box::new(move |state: &RequestState| {
            let _ = cb_tx.send((state.state, state.diag, state.went_down));
        })
    };
    let request = registry.request_session(
        ClientId::new(Protocol::OSPF, "ospf0".to_owned()),
        target("10.0.0.2", Some("eth0")),
        None,
        hook,
    );

    // With no instance around, the request parks on the wait list and
    // reports administratively down.
    assert_eq!(
        cb_rx.try_recv().unwrap(),
        (State::AdminDown, DiagnosticCode::Nothing, false)
    );

    // A starting instance absorbs the wait list; the request observes the
    // session's actual state.
    let handle =
        master::spawn_instance("main", InstanceCfg::default()).unwrap();
    registry.add_instance(handle).unwrap();
    registry.process().await;
    assert_eq!(
        cb_rx.try_recv().unwrap(),
        (State::Down, DiagnosticCode::Nothing, false)
    );

    // A stopping instance parks its requests back on the wait list.
    registry.remove_instance("main");
    assert_eq!(
        cb_rx.try_recv().unwrap(),
        (State::AdminDown, DiagnosticCode::Nothing, false)
    );

    // Dropping the token detaches the request for good.
    drop(request);
    registry.poll();
    assert_eq!(registry.requests().count(), 0);
}

#[tokio::test]
async fn test_instance_acceptance() {
    let mut registry = Registry::new();
    let (cb_tx, mut cb_rx) = mpsc::unbounded_channel();

    let hook = {
        let cb_tx = cb_tx.clone();
        Box::new(move |state: &RequestState| {
            let _ = cb_tx.send(state.state);
        })
    };
    let _request = registry.request_session(
        ClientId::new(Protocol::BGP, "bgp0".to_owned()),
        target("10.0.0.2", Some("eth0")),
        None,
        hook,
    );
    assert_eq!(cb_rx.try_recv().unwrap(), State::AdminDown);

    // An IPv6-only instance doesn't claim an IPv4 request; it stays on the
    // wait list.
    let mut config = InstanceCfg::default();
    config.accept_ipv4 = false;
    let handle = master::spawn_instance("v6-only", config).unwrap();
    registry.add_instance(handle).unwrap();
    assert_eq!(cb_rx.try_recv().unwrap(), State::AdminDown);
}

#[tokio::test]
async fn test_neighbor_requests() {
    let mut registry = Registry::new();

    let mut config = InstanceCfg::default();
    config.neighbors.push(NeighborCfg {
        remote: "172.16.0.9".parse().unwrap(),
        local: Some("10.0.0.1".parse().unwrap()),
        ifname: None,
        multihop: true,
    });
    config.neighbors.push(NeighborCfg {
        remote: "10.0.0.5".parse().unwrap(),
        local: None,
        ifname: Some("eth0".to_owned()),
        multihop: false,
    });
    let handle = master::spawn_instance("main", config).unwrap();
    registry.add_instance(handle).unwrap();

    // The multihop neighbor starts its internal request right away; the
    // direct one waits for a resolvable nexthop.
    assert_eq!(registry.requests().count(), 1);

    registry.neigh_notify("main", "10.0.0.5".parse().unwrap(), Some("eth0"), true);
    assert_eq!(registry.requests().count(), 2);

    registry.neigh_notify(
        "main",
        "10.0.0.5".parse().unwrap(),
        Some("eth0"),
        false,
    );
    assert_eq!(registry.requests().count(), 1);
}
