//
// Copyright (c) The Bfdd Project Developers
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, HashMap, HashSet, hash_map};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64};
use std::sync::{Arc, atomic};
use std::time::Duration;

use bfdd_utils::bfd::{ClientId, SessionKey, SessionOptions, State};
use bfdd_utils::keychain::Key;
use bfdd_utils::socket::UdpSocket;
use bfdd_utils::task::{IntervalTask, TimeoutTask};
use bfdd_utils::{Sender, UnboundedSender};
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use derive_new::new;
use generational_arena::{Arena, Index};
use rand::RngCore;
use tokio::time::Instant;

use crate::config::SessionCfg;
use crate::debug::Debug;
use crate::error::Error;
use crate::iface::IfaceIndex;
use crate::packet::{
    AuthenticationType, DiagnosticCode, Packet, PacketFlags,
};
use crate::registry::{RegistryMsg, RequestId};
use crate::tasks::messages::input::DetectTimerMsg;
use crate::{network, tasks};

pub type SessionId = usize;
pub type SessionIndex = Index;

bitflags! {
    // Pending poll sequence types. `TX` covers a Desired Min Tx Interval
    // change, `RX` a Required Min Rx Interval change.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PollFlags: u8 {
        const TX = 1 << 0;
        const RX = 1 << 1;
    }
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub key: SessionKey,
    // Link interface index (zero/unset for multihop sessions).
    pub ifindex: Option<u32>,
    // Owning (local address, interface) pair.
    pub iface_idx: IfaceIndex,
    pub config: SessionCfg,
    pub state: SessionState,
    pub statistics: SessionStatistics,
    // Attached requests, ordered by registration.
    pub clients: BTreeMap<RequestId, SessionClient>,
}

#[derive(Debug)]
pub struct SessionState {
    pub socket_tx: Option<Arc<UdpSocket>>,
    pub sockaddr: Option<SocketAddr>,
    pub local_discr: u32,
    pub local_state: State,
    pub local_diag: DiagnosticCode,
    pub remote: Option<SessionRemoteInfo>,
    // Deferred parameter commit (RFC 5880 section 6.8.3). While a poll
    // sequence is pending, `des_min_tx_curr <= des_min_tx_new` and
    // `req_min_rx_curr >= req_min_rx_new`.
    pub des_min_tx_curr: u32,
    pub des_min_tx_new: u32,
    pub req_min_rx_curr: u32,
    pub req_min_rx_new: u32,
    pub detect_mult: u8,
    pub passive: bool,
    // Active poll bits, shared with the Tx task so it can set the P-bit.
    pub poll_active: Arc<AtomicU8>,
    pub poll_scheduled: PollFlags,
    pub last_rx: Option<Instant>,
    pub tx_task: Option<IntervalTask>,
    pub detection_timer: Option<TimeoutTask>,
    pub auth: SessionAuth,
}

// Authentication sequence number state.
#[derive(Debug)]
pub struct SessionAuth {
    pub tx_seq: Arc<AtomicU32>,
    pub rx_seq: u32,
    pub rx_seq_known: bool,
}

#[derive(Debug, new)]
pub struct SessionRemoteInfo {
    pub state: State,
    pub discr: u32,
    pub diag: u8,
    pub multiplier: u8,
    pub min_tx: u32,
    pub min_rx: u32,
    pub demand_mode: bool,
}

#[derive(Debug)]
pub struct SessionStatistics {
    pub create_time: DateTime<Utc>,
    pub last_state_change_time: Option<DateTime<Utc>>,
    pub last_down_time: Option<DateTime<Utc>>,
    pub last_up_time: Option<DateTime<Utc>>,
    pub down_count: u32,
    pub admin_down_count: u32,
    pub rx_packet_count: u64,
    pub rx_error_count: u64,
    pub rx_auth_error_count: u64,
    pub tx_packet_count: Arc<AtomicU64>,
    pub tx_error_count: Arc<AtomicU64>,
}

// Request attached to the session. `tx` leads back to the control-plane
// registry owning the request.
#[derive(Debug, new)]
pub struct SessionClient {
    pub id: RequestId,
    pub client_id: ClientId,
    pub options: Option<SessionOptions>,
    pub tx: UnboundedSender<RegistryMsg>,
}

// Authentication parameters captured by the Tx tasks.
#[derive(Clone, Debug)]
pub struct TxAuth {
    pub auth_type: AuthenticationType,
    pub key: Key,
    pub seq: Arc<AtomicU32>,
}

#[derive(Debug, Default)]
pub struct Sessions {
    // Session arena.
    arena: Arena<Session>,
    // Session hash table keyed by ID (1:1).
    id_tree: HashMap<SessionId, SessionIndex>,
    // Session binary tree keyed by BFD key (1:1).
    key_tree: BTreeMap<SessionKey, SessionIndex>,
    // Session hash table keyed by local discriminator (1:1).
    discr_tree: HashMap<u32, SessionIndex>,
    // Session hash table keyed by (remote address, ifindex) (1:1).
    addr_tree: HashMap<(IpAddr, u32), SessionIndex>,
    // Session hash table keyed by interface name (1:N).
    ifname_tree: HashMap<String, HashSet<SessionIndex>>,
    // Next available ID.
    next_id: SessionId,
}

// ===== impl Session =====

impl Session {
    // Creates a new BFD session with the initial state variables of
    // RFC 5880 section 6.8.1.
    fn new(
        id: SessionId,
        key: SessionKey,
        local_discr: u32,
        iface_idx: IfaceIndex,
        config: SessionCfg,
    ) -> Session {
        Debug::SessionCreate(&key).log();

        let state = SessionState {
            socket_tx: None,
            sockaddr: None,
            local_discr,
            local_state: State::Down,
            local_diag: DiagnosticCode::Nothing,
            remote: None,
            des_min_tx_curr: config.idle_tx,
            des_min_tx_new: config.idle_tx,
            req_min_rx_curr: config.min_rx,
            req_min_rx_new: config.min_rx,
            detect_mult: config.multiplier,
            passive: config.passive,
            poll_active: Arc::new(AtomicU8::new(0)),
            poll_scheduled: PollFlags::empty(),
            last_rx: None,
            tx_task: None,
            detection_timer: None,
            auth: SessionAuth {
                tx_seq: Arc::new(AtomicU32::new(rand::rng().next_u32())),
                rx_seq: 0,
                rx_seq_known: false,
            },
        };

        Session {
            id,
            key,
            ifindex: None,
            iface_idx,
            config,
            state,
            statistics: Default::default(),
            clients: Default::default(),
        }
    }

    // Remote session state, Down until the first packet is received.
    pub fn remote_state(&self) -> State {
        self.state
            .remote
            .as_ref()
            .map(|remote| remote.state)
            .unwrap_or(State::Down)
    }

    // Returns the last value of Required Min Rx Interval received from the
    // remote system in a BFD Control packet.
    pub fn remote_min_rx_interval(&self) -> u32 {
        // If we haven't heard from our peer yet, return the initial value
        // (1 microsecond).
        self.state
            .remote
            .as_ref()
            .map(|remote| remote.min_rx)
            .unwrap_or(1)
    }

    pub fn poll_active_bits(&self) -> PollFlags {
        PollFlags::from_bits_truncate(
            self.state.poll_active.load(atomic::Ordering::Relaxed),
        )
    }

    fn set_poll_active_bits(&self, bits: PollFlags) {
        self.state
            .poll_active
            .store(bits.bits(), atomic::Ordering::Relaxed);
    }

    // Checks whether a poll sequence is in progress.
    pub fn poll_is_active(&self) -> bool {
        !self.poll_active_bits().is_empty()
    }

    // Negotiated transmit schedule: the base interval and jitter range of
    // RFC 5880 section 6.8.2, i.e. transmissions spread uniformly over
    // [tx - tx/4, tx - tx/10] where tx is the negotiated interval.
    fn tx_intervals(&self) -> (Duration, Duration) {
        let tx = std::cmp::max(
            self.state.des_min_tx_curr,
            self.remote_min_rx_interval(),
        );
        let tx_low = tx - tx / 4;
        let tx_high = tx - tx / 10;

        (
            Duration::from_micros(tx_low as u64),
            Duration::from_micros((tx_high - tx_low) as u64),
        )
    }

    // Checks whether periodic transmission is allowed at all
    // (RFC 5880 sections 6.8.3 and 6.8.7).
    fn should_tx(&self) -> bool {
        // A passive session stays quiet until the remote discriminator is
        // learned.
        if self.state.passive && self.state.remote.is_none() {
            return false;
        }

        // No periodic transmission while the remote system is in demand
        // mode, both sides are up and no poll sequence is in flight.
        if let Some(remote) = &self.state.remote
            && remote.demand_mode
            && self.state.local_state == State::Up
            && remote.state == State::Up
            && !self.poll_is_active()
        {
            return false;
        }

        // A remote Required Min Rx Interval of zero prohibits transmission.
        if self.remote_min_rx_interval() == 0 {
            return false;
        }

        true
    }

    // (Re)starts or stops the periodic transmission of BFD packets.
    //
    // With `restart`, a running transmission is rescheduled and a packet
    // goes out immediately; otherwise a running transmission is left
    // undisturbed.
    pub fn control_tx_timer(&mut self, restart: bool) {
        if self.state.socket_tx.is_none()
            || self.state.sockaddr.is_none()
            || !self.should_tx()
        {
            // Stop Tx.
            self.state.tx_task = None;
            return;
        }

        if restart || self.state.tx_task.is_none() {
            let socket_tx = self.state.socket_tx.clone().unwrap();
            let sockaddr = self.state.sockaddr.unwrap();
            let (interval, jitter) = self.tx_intervals();
            let task = tasks::udp_tx_interval(
                self, interval, jitter, &socket_tx, sockaddr,
            );
            self.state.tx_task = Some(task);
        }
    }

    // Changes the Desired Min Tx Interval. An increase while the session
    // is up only takes effect once the poll sequence terminates
    // (RFC 5880 section 6.8.3).
    pub fn set_min_tx(&mut self, val: u32) {
        if val == self.state.des_min_tx_new {
            return;
        }
        self.state.des_min_tx_new = val;

        if self.state.local_state != State::Up
            || val < self.state.des_min_tx_curr
        {
            self.state.des_min_tx_curr = val;
            self.control_tx_timer(true);
        }

        self.request_poll(PollFlags::TX);
    }

    // Changes the Required Min Rx Interval. A decrease while the session
    // is up only takes effect once the poll sequence terminates
    // (RFC 5880 section 6.8.3).
    pub fn set_min_rx(
        &mut self,
        val: u32,
        detect_timerp: &Sender<DetectTimerMsg>,
    ) {
        if val == self.state.req_min_rx_new {
            return;
        }
        self.state.req_min_rx_new = val;

        if self.state.local_state != State::Up
            || val > self.state.req_min_rx_curr
        {
            self.state.req_min_rx_curr = val;
            self.update_detection_time(false, detect_timerp);
        }

        self.request_poll(PollFlags::RX);
    }

    // Requests a poll sequence of the given type, starting it right away
    // unless one is already in flight.
    pub fn request_poll(&mut self, request: PollFlags) {
        // No polls are launched in passive mode until the remote
        // discriminator is known.
        if self.state.passive && self.state.remote.is_none() {
            return;
        }

        self.state.poll_scheduled.insert(request);
        if self.poll_is_active() {
            return;
        }

        let bits = self.state.poll_scheduled;
        self.state.poll_scheduled = PollFlags::empty();
        self.set_poll_active_bits(bits);

        Debug::PollStart(&self.key, bits).log();

        self.control_tx_timer(true);
    }

    // Terminates the poll sequence upon receipt of the Final bit,
    // committing the polled parameters. A poll type requested again while
    // in flight stays uncommitted and rolls over into the next sequence.
    // Timers are updated by the caller.
    pub fn terminate_poll(&mut self) {
        let done = self.poll_active_bits() - self.state.poll_scheduled;

        if done.contains(PollFlags::TX) {
            self.state.des_min_tx_curr = self.state.des_min_tx_new;
        }
        if done.contains(PollFlags::RX) {
            self.state.req_min_rx_curr = self.state.req_min_rx_new;
        }

        Debug::PollTerminate(&self.key, done).log();

        // Roll over into the next poll sequence, if one is scheduled.
        let next = self.state.poll_scheduled;
        self.state.poll_scheduled = PollFlags::empty();
        self.set_poll_active_bits(next);
    }

    // (Re)computes the detection time deadline (RFC 5880 section 6.8.4).
    //
    // The deadline is always absolute, relative to the last received
    // packet, so a reconfiguration that shortens the detection time never
    // extends an imminent expiry. The timer stays unarmed until the first
    // packet is received.
    pub fn update_detection_time(
        &mut self,
        kick: bool,
        detect_timerp: &Sender<DetectTimerMsg>,
    ) {
        if kick {
            self.state.last_rx = Some(Instant::now());
        }

        let (Some(last_rx), Some(remote)) =
            (self.state.last_rx, self.state.remote.as_ref())
        else {
            self.state.detection_timer = None;
            return;
        };

        let interval =
            std::cmp::max(self.state.req_min_rx_curr, remote.min_tx) as u64
                * remote.multiplier as u64;
        let deadline = last_rx + Duration::from_micros(interval);
        let timeout = deadline.saturating_duration_since(Instant::now());
        let task = tasks::detection_timer(self, timeout, detect_timerp);
        self.state.detection_timer = Some(task);
    }

    // Updates the FSM state of the BFD session.
    pub fn state_update(&mut self, state: State, diag: DiagnosticCode) {
        let old_state = self.state.local_state;
        if state == old_state {
            return;
        }

        Debug::FsmTransition(&self.key, old_state, state).log();

        self.state.local_state = state;
        self.state.local_diag = diag;

        // Notify the requests attached to this session.
        self.notify_clients();

        // Update statistics.
        self.statistics.last_state_change_time = Some(Utc::now());
        match state {
            State::AdminDown => {
                self.statistics.admin_down_count += 1;
            }
            State::Down => {
                self.statistics.last_down_time = Some(Utc::now());
                self.statistics.down_count += 1;
            }
            State::Up => {
                self.statistics.last_up_time = Some(Utc::now());
            }
            _ => {}
        }

        if state == State::Up {
            // Leave the idle transmit rate.
            self.set_min_tx(self.config.min_tx);
        } else if old_state == State::Up {
            // Back to the idle transmit rate.
            self.set_min_tx(self.config.idle_tx);
        }

        // Synchronize the Tx task since the advertised state has changed.
        self.control_tx_timer(true);
    }

    // Posts the session's current state to the registry side of every
    // attached request.
    pub fn notify_clients(&self) {
        for client in self.clients.values() {
            let msg = RegistryMsg::SessionUpd {
                request_id: client.id,
                state: self.state.local_state,
                rem_state: self.remote_state(),
                diag: self.state.local_diag,
            };
            let _ = client.tx.send(msg);
        }
    }

    // Generates a BFD Control packet according to the session's state.
    // The P and F bits are filled in by the Tx path.
    pub fn generate_packet(&self) -> Packet {
        Packet {
            version: Packet::VERSION,
            diag: self.state.local_diag as u8,
            state: self.state.local_state,
            flags: PacketFlags::empty(),
            detect_mult: self.state.detect_mult,
            my_discr: self.state.local_discr,
            your_discr: self
                .state
                .remote
                .as_ref()
                .map(|remote| remote.discr)
                .unwrap_or(0),
            desired_min_tx: self.state.des_min_tx_curr,
            req_min_rx: self.state.req_min_rx_curr,
            req_min_echo_rx: 0,
            auth: None,
        }
    }

    // Authentication parameters for outgoing packets, if any.
    pub fn tx_auth(&self) -> Option<TxAuth> {
        let auth = self.config.auth.as_ref()?;
        let key = auth.keychain.key_lookup_send()?.clone();

        Some(TxAuth {
            auth_type: auth.auth_type,
            key,
            seq: self.state.auth.tx_seq.clone(),
        })
    }

    // Sends a single BFD control packet with the F-bit set, outside the
    // regular transmit cadence.
    pub fn send_tx_final(&self) {
        if self.state.socket_tx.is_some() && self.state.sockaddr.is_some() {
            let socket_tx = self.state.socket_tx.clone().unwrap();
            let sockaddr = self.state.sockaddr.unwrap();
            tasks::udp_tx_final(self, &socket_tx, sockaddr);
        }
    }

    // Validates the crypto sequence number of a received packet
    // (RFC 5880 section 6.7.1). Meticulous schemes require a strictly
    // increasing sequence.
    pub fn rx_seq_valid(
        &self,
        auth_type: AuthenticationType,
        seq: u32,
    ) -> bool {
        if !self.state.auth.rx_seq_known {
            return true;
        }

        let window = 3 * self.state.detect_mult as u32;
        let delta = seq.wrapping_sub(self.state.auth.rx_seq);
        if auth_type.is_meticulous() {
            delta >= 1 && delta <= window
        } else {
            delta <= window
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        Debug::SessionDelete(&self.key).log();
    }
}

// ===== impl SessionStatistics =====

impl Default for SessionStatistics {
    fn default() -> SessionStatistics {
        SessionStatistics {
            create_time: Utc::now(),
            last_state_change_time: None,
            last_down_time: None,
            last_up_time: None,
            down_count: 0,
            admin_down_count: 0,
            rx_packet_count: 0,
            rx_error_count: 0,
            rx_auth_error_count: 0,
            tx_packet_count: Arc::new(AtomicU64::new(0)),
            tx_error_count: Arc::new(AtomicU64::new(0)),
        }
    }
}

// ===== impl Sessions =====

impl Sessions {
    // Creates a session and links it to the lookup collections. The caller
    // must have checked that no session exists for the key.
    pub fn insert(
        &mut self,
        key: SessionKey,
        iface_idx: IfaceIndex,
        config: SessionCfg,
    ) -> (SessionIndex, &mut Session) {
        debug_assert!(!self.key_tree.contains_key(&key));

        // Create and insert session into the arena.
        let id = self.next_id();
        let local_discr = self.next_discr();
        let sess = Session::new(id, key, local_discr, iface_idx, config);
        let sess_idx = self.arena.insert(sess);

        // Link session to the lookup collections.
        let sess = &mut self.arena[sess_idx];
        self.id_tree.insert(sess.id, sess_idx);
        self.key_tree.insert(sess.key.clone(), sess_idx);
        self.discr_tree.insert(sess.state.local_discr, sess_idx);
        match &sess.key {
            SessionKey::IpSingleHop { ifname, .. } => {
                // The address entry is linked once the ifindex is known.
                self.ifname_tree
                    .entry(ifname.clone())
                    .or_default()
                    .insert(sess_idx);
            }
            SessionKey::IpMultihop { dst, .. } => {
                self.addr_tree.insert((*dst, 0), sess_idx);
            }
        }

        // Return a mutable reference to the session.
        (sess_idx, sess)
    }

    pub fn delete(&mut self, sess_idx: SessionIndex) {
        let sess = &mut self.arena[sess_idx];

        // Unlink session from the lookup collections.
        self.id_tree.remove(&sess.id);
        self.key_tree.remove(&sess.key);
        self.discr_tree.remove(&sess.state.local_discr);
        match &sess.key {
            SessionKey::IpSingleHop { ifname, dst } => {
                if let Some(ifindex) = sess.ifindex {
                    self.addr_tree.remove(&(*dst, ifindex));
                }
                if let hash_map::Entry::Occupied(mut o) =
                    self.ifname_tree.entry(ifname.clone())
                {
                    let tree = o.get_mut();
                    tree.remove(&sess_idx);
                    if tree.is_empty() {
                        o.remove_entry();
                    }
                }
            }
            SessionKey::IpMultihop { dst, .. } => {
                self.addr_tree.remove(&(*dst, 0));
            }
        }

        // Remove session from the arena.
        self.arena.remove(sess_idx);
    }

    // Updates the link ifindex of a single-hop session, rekeying the
    // address entry and restarting transmission accordingly.
    pub fn update_ifindex(
        &mut self,
        sess_idx: SessionIndex,
        ifindex: Option<u32>,
    ) {
        let sess = &mut self.arena[sess_idx];
        let (_, dst) = sess.key.as_ip_single_hop().unwrap();
        let dst = *dst;

        if let Some(old_ifindex) = sess.ifindex.take() {
            self.addr_tree.remove(&(dst, old_ifindex));
            sess.state.sockaddr = None;

            // Stop Tx.
            sess.state.tx_task = None;
        }
        if let Some(ifindex) = ifindex {
            sess.ifindex = Some(ifindex);
            let mut sockaddr =
                SocketAddr::new(dst, network::PORT_DST_SINGLE_HOP);
            if let SocketAddr::V6(sockaddr) = &mut sockaddr {
                sockaddr.set_scope_id(ifindex);
            }
            sess.state.sockaddr = Some(sockaddr);
            self.addr_tree.insert((dst, ifindex), sess_idx);

            // Start Tx.
            sess.control_tx_timer(false);
        }
    }

    // Returns a mutable reference to the session corresponding to the
    // given ID.
    pub fn get_mut_by_id(
        &mut self,
        id: SessionId,
    ) -> Result<(SessionIndex, &mut Session), Error> {
        self.id_tree
            .get(&id)
            .copied()
            .map(move |sess_idx| (sess_idx, &mut self.arena[sess_idx]))
            .ok_or(Error::SessionIdNotFound(id))
    }

    // Returns a mutable reference to the session corresponding to the
    // given BFD key.
    pub fn get_mut_by_key(
        &mut self,
        key: &SessionKey,
    ) -> Option<(SessionIndex, &mut Session)> {
        self.key_tree
            .get(key)
            .copied()
            .map(move |sess_idx| (sess_idx, &mut self.arena[sess_idx]))
    }

    // Returns a mutable reference to the session corresponding to the
    // given local discriminator.
    pub fn get_mut_by_discr(
        &mut self,
        discr: u32,
    ) -> Option<(SessionIndex, &mut Session)> {
        self.discr_tree
            .get(&discr)
            .copied()
            .map(move |sess_idx| (sess_idx, &mut self.arena[sess_idx]))
    }

    // Returns a mutable reference to the session corresponding to the
    // given (remote address, ifindex) pair.
    pub fn get_mut_by_addr(
        &mut self,
        addr: IpAddr,
        ifindex: u32,
    ) -> Option<(SessionIndex, &mut Session)> {
        self.addr_tree
            .get(&(addr, ifindex))
            .copied()
            .map(move |sess_idx| (sess_idx, &mut self.arena[sess_idx]))
    }

    // Returns an iterator visiting all sessions.
    //
    // Sessions are ordered by their BFD keys.
    pub fn iter(&self) -> impl Iterator<Item = &'_ Session> + '_ {
        self.key_tree
            .values()
            .map(|sess_idx| &self.arena[*sess_idx])
    }

    // Returns an iterator visiting all session indexes.
    pub fn indexes(
        &self,
    ) -> impl Iterator<Item = SessionIndex> + '_ {
        self.key_tree.values().copied()
    }

    // Returns an iterator visiting all single-hop sessions attached to the
    // given interface.
    //
    // Iteration order is undefined.
    pub fn iter_by_ifname(
        &self,
        ifname: &str,
    ) -> impl Iterator<Item = SessionIndex> + '_ {
        self.ifname_tree
            .get(ifname)
            .into_iter()
            .flat_map(|sessions| sessions.iter().copied())
    }

    // Get next session ID.
    fn next_id(&mut self) -> SessionId {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }

    // Picks a random local discriminator, nonzero and unique within the
    // instance.
    fn next_discr(&self) -> u32 {
        let mut discr = rand::rng().next_u32();
        while discr == 0 || self.discr_tree.contains_key(&discr) {
            discr = rand::rng().next_u32();
        }
        discr
    }
}

impl std::ops::Index<SessionIndex> for Sessions {
    type Output = Session;

    fn index(&self, index: SessionIndex) -> &Self::Output {
        &self.arena[index]
    }
}

impl std::ops::IndexMut<SessionIndex> for Sessions {
    fn index_mut(&mut self, index: SessionIndex) -> &mut Self::Output {
        &mut self.arena[index]
    }
}
