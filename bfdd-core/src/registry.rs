//
// Copyright (c) The Bfdd Project Developers
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use bfdd_utils::bfd::{ClientId, SessionKey, SessionOptions, State};
use bfdd_utils::ip::IpAddrExt;
use bfdd_utils::protocol::Protocol;
use bfdd_utils::{UnboundedReceiver, UnboundedSender};
use tokio::sync::mpsc;

use crate::config::{InstanceCfg, NeighborCfg};
use crate::debug::Debug;
use crate::error::Error;
use crate::master::{ControlMsg, InstanceHandle};
use crate::packet::DiagnosticCode;
use crate::session::SessionClient;

// Identity of a session request, unique within the registry.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RequestId(pub u64);

// Messages flowing back to the registry: session state notifications
// posted by the instances, and lifecycle messages posted by the request
// handles.
#[derive(Debug)]
pub enum RegistryMsg {
    SessionUpd {
        request_id: RequestId,
        state: State,
        rem_state: State,
        diag: DiagnosticCode,
    },
    RequestRemove {
        request_id: RequestId,
    },
    RequestUpdate {
        request_id: RequestId,
        options: Option<SessionOptions>,
    },
}

// Target of a session request.
#[derive(Clone, Debug)]
pub struct RequestTarget {
    pub remote: IpAddr,
    pub local: Option<IpAddr>,
    pub ifname: Option<String>,
    pub vrf: Option<String>,
}

// State reported to the request's callback. `went_down` flags a loss of
// connectivity the requesting protocol should act upon.
#[derive(Clone, Debug)]
pub struct RequestState {
    pub target: RequestTarget,
    pub state: State,
    pub old_state: State,
    pub diag: DiagnosticCode,
    pub went_down: bool,
}

pub type RequestHook = Box<dyn FnMut(&RequestState) + Send>;

struct RequestEntry {
    client_id: ClientId,
    options: Option<SessionOptions>,
    // Taken out of the entry while the callback runs.
    hook: Option<RequestHook>,
    state: RequestState,
    // Name of the instance that claimed the request, if any.
    instance: Option<String>,
}

// Externally owned request token. Dropping it detaches the request from
// its session; the session itself is deleted once its last request is
// gone.
#[derive(Debug)]
pub struct BfdRequest {
    id: RequestId,
    tx: UnboundedSender<RegistryMsg>,
}

// Statically configured peer, tracked through an internal request.
struct Neighbor {
    instance: String,
    cfg: NeighborCfg,
    client_id: ClientId,
    request: Option<RequestId>,
}

// Control-plane side of the BFD subsystem: routes session requests to the
// instance accepting them, parks unclaimed requests on the wait list,
// tracks static neighbors and dispatches state-change notifications to
// the request callbacks.
pub struct Registry {
    instances: Vec<InstanceHandle>,
    requests: BTreeMap<RequestId, RequestEntry>,
    wait_list: BTreeSet<RequestId>,
    neighbors: Vec<Neighbor>,
    next_request_id: u64,
    tx: UnboundedSender<RegistryMsg>,
    rx: UnboundedReceiver<RegistryMsg>,
}

// ===== impl RequestTarget =====

impl RequestTarget {
    fn session_key(&self) -> SessionKey {
        match &self.ifname {
            Some(ifname) => SessionKey::IpSingleHop {
                ifname: ifname.clone(),
                dst: self.remote,
            },
            None => SessionKey::IpMultihop {
                src: self.local.unwrap_or(IpAddr::unspecified(
                    self.remote.address_family(),
                )),
                dst: self.remote,
            },
        }
    }
}

// ===== impl BfdRequest =====

impl BfdRequest {
    pub fn id(&self) -> RequestId {
        self.id
    }

    // Replaces the request's option overlay, reconfiguring the session.
    pub fn update(&self, options: Option<SessionOptions>) {
        let _ = self.tx.send(RegistryMsg::RequestUpdate {
            request_id: self.id,
            options,
        });
    }
}

impl Drop for BfdRequest {
    fn drop(&mut self) {
        let _ = self.tx.send(RegistryMsg::RequestRemove {
            request_id: self.id,
        });
    }
}

// ===== impl Registry =====

impl Registry {
    pub fn new() -> Registry {
        let (tx, rx) = mpsc::unbounded_channel();

        Registry {
            instances: Vec::new(),
            requests: Default::default(),
            wait_list: Default::default(),
            neighbors: Vec::new(),
            next_request_id: 0,
            tx,
            rx,
        }
    }

    // Adds a running instance. Its static neighbors start their internal
    // requests and the wait list is offered to it.
    pub fn add_instance(
        &mut self,
        handle: InstanceHandle,
    ) -> Result<(), Error> {
        if self.instances.iter().any(|i| i.name == handle.name) {
            return Err(Error::InvalidConfig(format!(
                "instance \"{}\" already exists",
                handle.name
            )));
        }

        let name = handle.name.clone();
        let neighbors = handle.cfg.neighbors.clone();
        self.instances.push(handle);

        for cfg in neighbors {
            self.add_neighbor(&name, cfg);
        }

        // The new instance may claim requests parked on the wait list.
        self.absorb_wait_list();

        Ok(())
    }

    // Removes an instance. Its requests are pushed back to the wait list
    // and dropping the handle shuts the instance down.
    pub fn remove_instance(&mut self, name: &str) {
        let Some(pos) = self.instances.iter().position(|i| i.name == name)
        else {
            return;
        };

        // Stop the instance's static neighbors.
        for idx in (0..self.neighbors.len()).rev() {
            if self.neighbors[idx].instance == name {
                self.neighbor_stop(idx);
                self.neighbors.remove(idx);
            }
        }

        // Park the instance's remaining requests on the wait list.
        let ids = self
            .requests
            .iter()
            .filter(|(_, entry)| entry.instance.as_deref() == Some(name))
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for id in ids {
            let entry = self.requests.get_mut(&id).unwrap();
            entry.instance = None;
            self.wait_list.insert(id);
            self.notify(
                id,
                State::AdminDown,
                State::AdminDown,
                DiagnosticCode::Nothing,
            );
        }

        self.instances.remove(pos);
    }

    // Applies a new configuration to a running instance, diffing its
    // neighbor set on the way. An invalid or incompatible configuration is
    // rejected and the previous one stays active.
    pub fn reconfigure_instance(
        &mut self,
        name: &str,
        new_cfg: InstanceCfg,
    ) -> Result<(), Error> {
        new_cfg.validate()?;

        let Some(instance) =
            self.instances.iter_mut().find(|i| i.name == name)
        else {
            return Err(Error::InvalidConfig(format!(
                "unknown instance \"{name}\""
            )));
        };
        instance.cfg.compatible(&new_cfg)?;

        let old_neighbors = instance.cfg.neighbors.clone();
        let new_neighbors = new_cfg.neighbors.clone();
        instance.cfg = new_cfg.clone();
        instance.send(ControlMsg::Reconfigure(new_cfg));

        // Drop removed neighbors, then start added ones.
        for cfg in &old_neighbors {
            if !new_neighbors.contains(cfg)
                && let Some(idx) = self.neighbors.iter().position(|nbr| {
                    nbr.instance == name && nbr.cfg == *cfg
                })
            {
                self.neighbor_stop(idx);
                self.neighbors.remove(idx);
            }
        }
        for cfg in new_neighbors {
            if !old_neighbors.contains(&cfg) {
                self.add_neighbor(name, cfg);
            }
        }

        Ok(())
    }

    // Propagates a system interface update to every instance.
    pub fn iface_update(&self, ifname: &str, ifindex: Option<u32>) {
        for instance in &self.instances {
            instance.send(ControlMsg::IfaceUpd {
                ifname: ifname.to_owned(),
                ifindex,
            });
        }
    }

    // Requests a liveness probe to the given target. The callback fires
    // with the current session state right after registration and on every
    // subsequent transition.
    pub fn request_session(
        &mut self,
        client_id: ClientId,
        target: RequestTarget,
        options: Option<SessionOptions>,
        hook: RequestHook,
    ) -> BfdRequest {
        let id = self.create_request(client_id, target, options, Some(hook));

        BfdRequest {
            id,
            tx: self.tx.clone(),
        }
    }

    // Waits for the next notification batch and dispatches it.
    pub async fn process(&mut self) {
        if let Some(msg) = self.rx.recv().await {
            self.dispatch(msg);
        }
    }

    // Dispatches all pending notifications without blocking.
    pub fn poll(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            self.dispatch(msg);
        }
    }

    // Nexthop scope change notification for a configured neighbor: starts
    // or stops the neighbor's internal request. Multihop neighbors skip
    // nexthop tracking.
    pub fn neigh_notify(
        &mut self,
        instance: &str,
        remote: IpAddr,
        ifname: Option<&str>,
        resolvable: bool,
    ) {
        let Some(idx) = self.neighbors.iter().position(|nbr| {
            nbr.instance == instance
                && nbr.cfg.remote == remote
                && nbr.cfg.ifname.as_deref() == ifname
        }) else {
            return;
        };
        if self.neighbors[idx].cfg.multihop {
            return;
        }

        if resolvable {
            self.neighbor_start(idx);
        } else {
            self.neighbor_stop(idx);
        }
    }

    // Read-only view of the tracked requests.
    pub fn requests(
        &self,
    ) -> impl Iterator<Item = (&'_ ClientId, &'_ RequestState)> + '_ {
        self.requests
            .values()
            .map(|entry| (&entry.client_id, &entry.state))
    }

    fn create_request(
        &mut self,
        client_id: ClientId,
        target: RequestTarget,
        options: Option<SessionOptions>,
        hook: Option<RequestHook>,
    ) -> RequestId {
        self.next_request_id += 1;
        let id = RequestId(self.next_request_id);

        let entry = RequestEntry {
            client_id,
            options,
            hook,
            state: RequestState {
                target,
                state: State::AdminDown,
                old_state: State::AdminDown,
                diag: DiagnosticCode::Nothing,
                went_down: false,
            },
            instance: None,
        };
        self.requests.insert(id, entry);
        self.submit_request(id);

        id
    }

    // Offers the request to each instance in turn; the first instance
    // whose acceptance criteria match claims it. Unclaimed requests are
    // parked on the wait list and reported as administratively down.
    fn submit_request(&mut self, id: RequestId) {
        let entry = &self.requests[&id];
        let target = entry.state.target.clone();
        let client_id = entry.client_id.clone();
        let options = entry.options;
        let direct = target.ifname.is_some();

        match self.instances.iter().find(|instance| {
            instance.accepts(&target.remote, direct, target.vrf.as_deref())
        }) {
            Some(instance) => {
                instance.send(ControlMsg::SessionReg {
                    key: target.session_key(),
                    local: target.local,
                    client: SessionClient::new(
                        id,
                        client_id,
                        options,
                        self.tx.clone(),
                    ),
                });
                let name = instance.name.clone();
                let entry = self.requests.get_mut(&id).unwrap();
                entry.instance = Some(name);
                self.wait_list.remove(&id);
            }
            None => {
                Error::RequestNoMatch(target.remote).log();
                Debug::RequestWaitListed(&client_id).log();
                self.wait_list.insert(id);
                self.notify(
                    id,
                    State::AdminDown,
                    State::AdminDown,
                    DiagnosticCode::Nothing,
                );
            }
        }
    }

    // Re-submits every request parked on the wait list.
    fn absorb_wait_list(&mut self) {
        for id in std::mem::take(&mut self.wait_list) {
            self.submit_request(id);
        }
    }

    fn remove_request(&mut self, id: RequestId) {
        let Some(entry) = self.requests.remove(&id) else {
            return;
        };
        self.wait_list.remove(&id);

        if let Some(name) = entry.instance
            && let Some(instance) =
                self.instances.iter().find(|i| i.name == name)
        {
            instance.send(ControlMsg::SessionUnreg {
                key: entry.state.target.session_key(),
                request_id: id,
            });
        }
    }

    fn update_request(
        &mut self,
        id: RequestId,
        options: Option<SessionOptions>,
    ) {
        let Some(entry) = self.requests.get_mut(&id) else {
            return;
        };
        entry.options = options;

        if let Some(name) = entry.instance.clone()
            && let Some(instance) =
                self.instances.iter().find(|i| i.name == name)
        {
            instance.send(ControlMsg::SessionUpdate {
                key: entry.state.target.session_key(),
                request_id: id,
                options,
            });
        }
    }

    fn add_neighbor(&mut self, instance: &str, cfg: NeighborCfg) {
        // Duplicates are a configuration mistake; log and move on.
        if self
            .neighbors
            .iter()
            .any(|nbr| nbr.instance == instance && nbr.cfg == cfg)
        {
            Error::DuplicateNeighbor(cfg.remote).log();
            return;
        }

        let client_id = ClientId::new(
            Protocol::BFD,
            format!("neighbor {}", cfg.remote),
        );
        let multihop = cfg.multihop;
        self.neighbors.push(Neighbor {
            instance: instance.to_owned(),
            cfg,
            client_id,
            request: None,
        });

        // Multihop neighbors skip nexthop resolution and start right away.
        // Single-hop neighbors wait for their nexthop to become
        // resolvable.
        if multihop {
            self.neighbor_start(self.neighbors.len() - 1);
        }
    }

    fn neighbor_start(&mut self, idx: usize) {
        let nbr = &self.neighbors[idx];
        if nbr.request.is_some() {
            return;
        }

        Debug::NeighborStart(&nbr.client_id).log();

        let target = RequestTarget {
            remote: nbr.cfg.remote,
            local: nbr.cfg.local,
            ifname: nbr.cfg.ifname.clone(),
            vrf: self
                .instances
                .iter()
                .find(|i| i.name == nbr.instance)
                .and_then(|i| i.cfg.vrf.clone()),
        };
        let client_id = nbr.client_id.clone();
        let id = self.create_request(client_id, target, None, None);
        self.neighbors[idx].request = Some(id);
    }

    fn neighbor_stop(&mut self, idx: usize) {
        if let Some(id) = self.neighbors[idx].request.take() {
            Debug::NeighborStop(&self.neighbors[idx].client_id).log();
            self.remove_request(id);
        }
    }

    // Processes a batch of notifications. Intermediate transitions between
    // two drains are coalesced: only the newest state of each session
    // reaches the callbacks, with the freshest diagnostic.
    fn dispatch(&mut self, first: RegistryMsg) {
        let mut latest = BTreeMap::new();

        let mut msg = Some(first);
        while let Some(event) = msg {
            match event {
                RegistryMsg::SessionUpd {
                    request_id,
                    state,
                    rem_state,
                    diag,
                } => {
                    latest.insert(request_id, (state, rem_state, diag));
                }
                RegistryMsg::RequestRemove { request_id } => {
                    latest.remove(&request_id);
                    self.remove_request(request_id);
                }
                RegistryMsg::RequestUpdate {
                    request_id,
                    options,
                } => {
                    self.update_request(request_id, options);
                }
            }
            msg = self.rx.try_recv().ok();
        }

        for (id, (state, rem_state, diag)) in latest {
            self.notify(id, state, rem_state, diag);
        }
    }

    // Updates the request's reported state and fires its callback. The
    // hook is taken out of the entry for the duration of the call, keeping
    // a request torn down while its own notification runs safe.
    fn notify(
        &mut self,
        id: RequestId,
        state: State,
        rem_state: State,
        diag: DiagnosticCode,
    ) {
        let Some(entry) = self.requests.get_mut(&id) else {
            return;
        };

        let old_state = entry.state.state;
        entry.state.old_state = old_state;
        entry.state.state = state;
        entry.state.diag = diag;
        // RFC 5882 section 4.2: a session going down because the remote
        // end is administratively down is not a path failure.
        entry.state.went_down = old_state == State::Up
            && state == State::Down
            && rem_state != State::AdminDown;

        let Some(mut hook) = entry.hook.take() else {
            return;
        };
        let snapshot = entry.state.clone();
        (hook)(&snapshot);
        if let Some(entry) = self.requests.get_mut(&id)
            && entry.hook.is_none()
        {
            entry.hook = Some(hook);
        }
    }
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}
