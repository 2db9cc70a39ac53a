// Copyright 2025 ribd Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The server loop. `BgpServer` is the single writer of the peer map, the
//! route tables, the policies and the watcher set; sessions, listeners and
//! timers talk to it through queues.

use crate::bgp::codec::WireCodec;
use crate::bgp::family::AfiSafi;
use crate::bgp::msg::UpdateMessage;
use crate::bgp::nlri::Nlri;
use crate::bgp::notification::CeaseSubcode;
use crate::config::{default_stale_path_time, Config, PeerConfig, Vrf};
use crate::log::{debug, info, warn};
use crate::net::{bind_listener, SystemTransport, TransportConfig};
use crate::peer::fsm::BgpState;
use crate::peer::session::{FsmMessage, SessionCmd, SessionDeps, SessionEvent, SessionInfo};
use crate::peer::supervisor::join_within;
use crate::peer::{Deferral, LocalIdentity, Peer};
use crate::policy::{PolicyEngine, PolicyStore};
use crate::rib::{Path, TableId, TableManager};
use crate::rpki::{RoaTable, RpkiValidator};
use crate::server_ops::{MgmtOp, ServerHandle};
use crate::types::StateReason;
use crate::watch::{WatchEvent, WatcherSet};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// First label handed to a VRF; 0-15 are reserved.
const FIRST_VRF_LABEL: u32 = 16;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    Duplicate(String),
    UnknownReference(String),
    InUse(String),
    InvalidArgument(String),
    /// The server loop has exited.
    ServerGone,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Duplicate(what) => write!(f, "{} already exists", what),
            ServerError::UnknownReference(what) => write!(f, "unknown {}", what),
            ServerError::InUse(what) => write!(f, "{} is in use", what),
            ServerError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            ServerError::ServerGone => f.write_str("server is not running"),
        }
    }
}

impl std::error::Error for ServerError {}

pub(crate) struct VrfEntry {
    pub vrf: Vrf,
    pub label: u32,
}

struct Listener {
    addr: SocketAddr,
    fd: RawFd,
    task: JoinHandle<()>,
}

#[derive(Debug)]
pub(crate) enum TimerKind {
    LlgrExpired(AfiSafi),
    /// Stale paths of a reconnected peer ran out of time for End-of-RIB.
    StaleExpired(AfiSafi),
    DeferralExpired(Deferral),
}

/// A server-side timer firing for one peer incarnation.
#[derive(Debug)]
pub(crate) struct TimerEvent {
    peer: IpAddr,
    generation: u64,
    epoch: u64,
    kind: TimerKind,
}

pub struct BgpServer {
    pub(crate) config: Config,
    pub(crate) local: LocalIdentity,
    pub(crate) peers: HashMap<IpAddr, Peer>,
    pub(crate) rib: TableManager,
    pub(crate) policies: Box<dyn PolicyEngine>,
    pub(crate) rpki: RoaTable,
    pub(crate) vrfs: BTreeMap<String, VrfEntry>,
    pub(crate) watchers: WatcherSet,
    pub(crate) deps: SessionDeps,
    listeners: Vec<Listener>,
    next_generation: u64,
    next_label: u32,
    mgmt_tx: mpsc::Sender<MgmtOp>,
    mgmt_rx: mpsc::Receiver<MgmtOp>,
    accept_tx: mpsc::UnboundedSender<(TcpStream, SocketAddr)>,
    accept_rx: mpsc::UnboundedReceiver<(TcpStream, SocketAddr)>,
    fsm_rx: mpsc::UnboundedReceiver<FsmMessage>,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
    timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
}

impl BgpServer {
    pub fn new(config: Config) -> Result<Self, ServerError> {
        Self::with_transport(config, Arc::new(SystemTransport))
    }

    pub fn with_transport(
        config: Config,
        transport: Arc<dyn TransportConfig>,
    ) -> Result<Self, ServerError> {
        config.validate().map_err(ServerError::InvalidArgument)?;
        let policies =
            PolicyStore::from_config(&config.policy_definitions).map_err(ServerError::InvalidArgument)?;
        let rpki = RoaTable::from_config(config.asn, &config.roas).map_err(ServerError::InvalidArgument)?;

        let mut vrfs = BTreeMap::new();
        let mut next_label = FIRST_VRF_LABEL;
        for vrf_config in &config.vrfs {
            let vrf = vrf_config.resolve().map_err(ServerError::InvalidArgument)?;
            vrfs.insert(vrf.name.clone(), VrfEntry { vrf, label: next_label });
            next_label += 1;
        }

        let (mgmt_tx, mgmt_rx) = mpsc::channel(1);
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (fsm_tx, fsm_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        Ok(BgpServer {
            local: LocalIdentity {
                asn: config.asn,
                router_id: config.router_id,
                cluster_id: config.cluster_id(),
            },
            rib: TableManager::new(config.asn, config.router_id),
            peers: HashMap::new(),
            policies: Box::new(policies),
            rpki,
            vrfs,
            watchers: WatcherSet::default(),
            deps: SessionDeps {
                codec: Arc::new(WireCodec),
                transport,
                events: fsm_tx,
            },
            listeners: Vec::new(),
            next_generation: 0,
            next_label,
            config,
            mgmt_tx,
            mgmt_rx,
            accept_tx,
            accept_rx,
            fsm_rx,
            timer_tx,
            timer_rx,
        })
    }

    /// Management handle. Clones share the same queue.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle::new(self.mgmt_tx.clone())
    }

    /// Bind the listeners, start the configured peers and serve until a
    /// shutdown request.
    pub async fn run(mut self) -> Result<(), ServerError> {
        self.start_listeners()?;
        for config in self.config.peers.clone() {
            self.start_peer(config, false);
        }
        info!(
            asn = self.local.asn,
            router_id = %self.local.router_id,
            peers = self.peers.len(),
            "server started"
        );

        loop {
            tokio::select! {
                biased;

                Some(op) = self.mgmt_rx.recv() => {
                    if let MgmtOp::Shutdown { response } = op {
                        self.shutdown().await;
                        let _ = response.send(Ok(()));
                        return Ok(());
                    }
                    self.handle_mgmt_op(op);
                }

                Some((stream, remote)) = self.accept_rx.recv() => {
                    self.handle_accept(stream, remote);
                }

                Some(msg) = self.fsm_rx.recv() => {
                    self.handle_fsm_message(msg);
                }

                Some(event) = self.timer_rx.recv() => {
                    self.handle_timer(event);
                }
            }
        }
    }

    pub(crate) fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.addr).collect()
    }

    fn start_listeners(&mut self) -> Result<(), ServerError> {
        let addrs = self
            .config
            .listen_sockaddrs()
            .map_err(ServerError::InvalidArgument)?;
        for addr in addrs {
            let listener = bind_listener(addr)
                .map_err(|e| ServerError::InvalidArgument(format!("bind {}: {}", addr, e)))?;
            let addr = listener.local_addr().unwrap_or(addr);
            let fd = listener.as_raw_fd();
            let task = tokio::spawn(accept_loop(listener, self.accept_tx.clone()));
            info!(listen_addr = %addr, "listening");
            self.listeners.push(Listener { addr, fd, task });
        }
        Ok(())
    }

    /// Install (or with `None`, remove) the TCP-MD5 key for `peer` on every
    /// listener of its address family.
    fn set_listener_md5(&self, peer: IpAddr, key: Option<&str>) {
        let key = key.map(str::as_bytes).unwrap_or_default();
        for listener in self
            .listeners
            .iter()
            .filter(|l| l.addr.is_ipv4() == peer.is_ipv4())
        {
            if let Err(e) = self.deps.transport.set_md5(listener.fd, peer, key) {
                warn!(peer_ip = %peer, listen_addr = %listener.addr, error = %e, "failed to set TCP-MD5 key");
            }
        }
    }

    /// Spawn a session for `config`, with peer-group defaults applied.
    pub(crate) fn start_peer(&mut self, mut config: PeerConfig, dynamic: bool) {
        if let Some(group) = config
            .peer_group
            .as_ref()
            .and_then(|name| self.config.peer_group(name))
        {
            config.inherit(group);
        }
        let addr = config.address;
        let vrf = config
            .vrf
            .as_ref()
            .and_then(|name| self.vrfs.get(name))
            .map(|entry| entry.vrf.clone());
        if let Some(key) = &config.md5_password {
            self.set_listener_md5(addr, Some(key));
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let peer = Peer::spawn(config, dynamic, vrf, generation, &self.config, self.deps.clone());
        info!(peer_ip = %addr, generation, dynamic, "peer started");
        self.peers.insert(addr, peer);
    }

    /// Stop `addr`'s session, withdraw everything it contributed and join the
    /// session task in the background.
    pub(crate) fn remove_peer(&mut self, addr: IpAddr, subcode: CeaseSubcode) -> bool {
        let Some(mut peer) = self.peers.remove(&addr) else {
            return false;
        };
        let task = peer.shutdown(subcode);

        let mut changes = Vec::new();
        for family in self.rib.families() {
            changes.extend(self.rib.drop_peer(addr, family));
        }
        if peer.config.route_server_client {
            self.rib.drop_table(TableId::RsClient(addr));
        }
        if peer.config.md5_password.is_some() {
            self.set_listener_md5(addr, None);
        }
        info!(peer_ip = %addr, ?subcode, withdrawn = changes.len(), "peer removed");
        self.publish(changes);

        if let Some(task) = task {
            let deadline = self.config.join_deadline();
            tokio::spawn(async move {
                join_within(task, deadline, addr, "session").await;
            });
        }
        true
    }

    pub(crate) fn alloc_vrf_label(&mut self) -> u32 {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    async fn shutdown(&mut self) {
        info!(peers = self.peers.len(), "server shutting down");
        for listener in self.listeners.drain(..) {
            listener.task.abort();
        }
        let deadline = self.config.join_deadline();
        let tasks: Vec<_> = self
            .peers
            .iter_mut()
            .filter_map(|(addr, peer)| {
                peer.shutdown(CeaseSubcode::AdministrativeShutdown)
                    .map(|task| (*addr, task))
            })
            .collect();
        for (addr, task) in tasks {
            join_within(task, deadline, addr, "session").await;
        }
        self.peers.clear();
    }

    fn handle_accept(&mut self, stream: TcpStream, remote: SocketAddr) {
        let addr = remote.ip().to_canonical();
        if !self.peers.contains_key(&addr) {
            let Some(config) = self.dynamic_peer_config(addr) else {
                debug!(peer_ip = %addr, "closing connection from unconfigured address");
                return;
            };
            info!(peer_ip = %addr, group = ?config.peer_group, "dynamic neighbor connected");
            self.start_peer(config, true);
        }
        if let Some(peer) = self.peers.get(&addr) {
            if let Err(e) = peer.command(SessionCmd::Incoming(stream)) {
                debug!(peer_ip = %addr, error = %e, "session gone, dropping connection");
            }
        }
    }

    fn dynamic_peer_config(&self, addr: IpAddr) -> Option<PeerConfig> {
        self.config
            .peer_groups
            .iter()
            .find(|group| {
                group
                    .dynamic_ranges()
                    .is_ok_and(|ranges| ranges.iter().any(|r| r.contains_addr(addr)))
            })
            .map(|group| PeerConfig::dynamic(addr, group))
    }

    /// Single consumption point for session events. Events from an older
    /// incarnation of the peer are dropped here.
    fn handle_fsm_message(&mut self, msg: FsmMessage) {
        let addr = msg.peer;
        let Some(peer) = self.peers.get(&addr) else {
            debug!(peer_ip = %addr, "event for unknown peer dropped");
            return;
        };
        if peer.generation != msg.generation {
            debug!(
                peer_ip = %addr,
                generation = msg.generation,
                current = peer.generation,
                "stale generation event dropped"
            );
            return;
        }

        match msg.event {
            SessionEvent::StateChanged {
                old,
                new,
                reason,
                info,
            } => self.handle_state_change(addr, msg.epoch, old, new, reason, info),
            SessionEvent::Update(update) => {
                if !peer.is_established() || peer.epoch != msg.epoch {
                    debug!(peer_ip = %addr, epoch = msg.epoch, "update from previous session dropped");
                    return;
                }
                self.handle_update(addr, update);
            }
            SessionEvent::RouteRefresh(family) => {
                if peer.deferred.contains_key(&family) {
                    debug!(peer_ip = %addr, %family, "route refresh for deferred family ignored");
                    return;
                }
                debug!(peer_ip = %addr, %family, "route refresh");
                self.flush_family(addr, family, false);
            }
            SessionEvent::FamilyDisabled(family) => {
                warn!(peer_ip = %addr, %family, "family disabled by malformed update");
                self.withdraw_peer_family(addr, family);
            }
        }
    }

    fn handle_state_change(
        &mut self,
        addr: IpAddr,
        epoch: u64,
        old: BgpState,
        new: BgpState,
        reason: StateReason,
        info: Option<Box<SessionInfo>>,
    ) {
        self.watchers.emit(WatchEvent::PeerState {
            peer: addr,
            old,
            new,
            reason: reason.clone(),
        });

        if reason == StateReason::GracefulRestartExpired {
            info!(peer_ip = %addr, "graceful restart timer expired");
            self.graceful_restart_expired(addr);
            return;
        }

        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        let was_established = peer.state == BgpState::Established;
        peer.state = new;
        peer.last_reason = Some(reason.clone());
        info!(peer_ip = %addr, %old, %new, %reason, "peer state changed");

        if new == BgpState::Established {
            peer.epoch = epoch;
            if let Some(info) = info {
                peer.session = Some(*info);
            }
            self.peer_established(addr);
            return;
        }
        if was_established {
            self.peer_down(addr, &reason);
        }
        let dynamic = self.peers.get(&addr).is_some_and(|p| p.dynamic);
        if dynamic && new == BgpState::Idle {
            self.remove_peer(addr, CeaseSubcode::PeerDeconfigured);
        }
    }

    fn peer_established(&mut self, addr: IpAddr) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        let Some(session) = peer.session.clone() else {
            warn!(peer_ip = %addr, "established without session info");
            return;
        };
        let caps = &session.negotiated;

        // RFC 4724 4.2: families whose forwarding state was not preserved
        // lose their stale paths now.
        let mut changes = Vec::new();
        let stale: Vec<AfiSafi> = peer.stale_families.iter().copied().collect();
        for family in stale {
            let preserved = caps.has_family(family)
                && caps
                    .graceful_restart
                    .as_ref()
                    .and_then(|gr| gr.forwarding_preserved(family))
                    .unwrap_or(false);
            if !preserved {
                peer.stale_families.remove(&family);
                if let Some(timer) = peer.llgr_timers.remove(&family) {
                    timer.abort();
                }
                peer.rib_in.clear_family(family);
                changes.extend(self.rib.drop_peer(addr, family));
            }
        }

        let restarting = caps.graceful_restart.is_some()
            && peer
                .config
                .graceful_restart
                .as_ref()
                .is_some_and(|gr| gr.restarting);
        let rtc = caps.has_family(AfiSafi::RTC);
        for &family in &caps.families {
            if rtc && family.is_vpn() {
                peer.deferred.insert(family, Deferral::Rtc);
            } else if restarting {
                peer.deferred.insert(family, Deferral::Restart);
            }
        }

        let mut timers = Vec::new();
        if peer.deferred.values().any(|d| *d == Deferral::Rtc) {
            timers.push((Deferral::Rtc, Duration::from_secs(self.config.rtc_deferral_secs)));
        }
        if peer.deferred.values().any(|d| *d == Deferral::Restart) {
            let delay = peer
                .config
                .graceful_restart
                .as_ref()
                .map(|gr| gr.deferral_time_secs)
                .unwrap_or_default();
            timers.push((Deferral::Restart, Duration::from_secs(delay)));
        }
        // RFC 4724 4.2: what survived the restart waits for End-of-RIB, but
        // not forever.
        let stale_time = Duration::from_secs(
            peer.config
                .graceful_restart
                .as_ref()
                .map(|gr| gr.stale_path_time_secs)
                .unwrap_or_else(default_stale_path_time),
        );
        let still_stale: Vec<AfiSafi> = peer.stale_families.iter().copied().collect();
        let flush: Vec<AfiSafi> = caps
            .families
            .iter()
            .filter(|f| !peer.deferred.contains_key(f))
            .copied()
            .collect();
        let generation = peer.generation;
        let epoch = peer.epoch;
        info!(
            peer_ip = %addr,
            asn = session.remote_asn,
            hold_time = session.hold_time,
            families = caps.families.len(),
            deferred = peer.deferred.len(),
            "session established"
        );

        for (kind, delay) in timers {
            spawn_timer(
                &self.timer_tx,
                delay,
                TimerEvent {
                    peer: addr,
                    generation,
                    epoch,
                    kind: TimerKind::DeferralExpired(kind),
                },
            );
        }
        for family in still_stale {
            debug!(peer_ip = %addr, %family, ?stale_time, "waiting for End-of-RIB");
            spawn_timer(
                &self.timer_tx,
                stale_time,
                TimerEvent {
                    peer: addr,
                    generation,
                    epoch,
                    kind: TimerKind::StaleExpired(family),
                },
            );
        }
        self.publish(changes);
        for family in flush {
            self.flush_family(addr, family, true);
        }
    }

    /// Teardown of an Established session. GR-eligible reasons keep the
    /// negotiated GR families as stale; everything else is withdrawn.
    fn peer_down(&mut self, addr: IpAddr, reason: &StateReason) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        peer.session_down();
        let gr_families = match &peer.session {
            Some(session) if reason.is_gr_eligible() => session.negotiated.gr_families(),
            _ => Vec::new(),
        };

        // A second teardown before End-of-RIB drops what was still stale.
        let previously_stale = std::mem::take(&mut peer.stale_families);
        peer.cancel_llgr_timers();
        let mut families: BTreeSet<AfiSafi> = peer.rib_in.families().into_iter().collect();
        families.extend(previously_stale.iter().copied());

        let mut changes = Vec::new();
        for family in families {
            if gr_families.contains(&family) && !previously_stale.contains(&family) {
                peer.rib_in.mark_stale(family);
                self.rib.mark_stale(addr, family);
                peer.stale_families.insert(family);
            } else {
                peer.rib_in.clear_family(family);
                changes.extend(self.rib.drop_peer(addr, family));
            }
        }
        info!(
            peer_ip = %addr,
            %reason,
            stale = peer.stale_families.len(),
            withdrawn = changes.len(),
            "session down"
        );
        self.publish(changes);
    }

    /// RFC 9494: stale families with a long-lived stale time move to LLGR,
    /// the rest are dropped.
    fn graceful_restart_expired(&mut self, addr: IpAddr) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        let llgr = peer
            .session
            .as_ref()
            .map(|s| s.negotiated.llgr.clone())
            .unwrap_or_default();
        let generation = peer.generation;
        let epoch = peer.epoch;

        let mut changes = Vec::new();
        let families: Vec<AfiSafi> = peer.stale_families.iter().copied().collect();
        for family in families {
            match llgr.get(&family) {
                Some(&stale_time) if stale_time > 0 => {
                    changes.extend(self.rib.enter_llgr(addr, family));
                    let timer = spawn_timer(
                        &self.timer_tx,
                        Duration::from_secs(u64::from(stale_time)),
                        TimerEvent {
                            peer: addr,
                            generation,
                            epoch,
                            kind: TimerKind::LlgrExpired(family),
                        },
                    );
                    if let Some(old) = peer.llgr_timers.insert(family, timer) {
                        old.abort();
                    }
                    info!(peer_ip = %addr, %family, stale_time, "long-lived stale");
                }
                _ => {
                    peer.stale_families.remove(&family);
                    peer.rib_in.take_stale(family);
                    changes.extend(self.rib.clear_stale(addr, family));
                }
            }
        }
        self.publish(changes);
    }

    fn handle_timer(&mut self, event: TimerEvent) {
        let Some(peer) = self.peers.get(&event.peer) else {
            return;
        };
        if peer.generation != event.generation {
            return;
        }
        match event.kind {
            TimerKind::LlgrExpired(family) => {
                info!(peer_ip = %event.peer, %family, "long-lived stale time expired");
                self.clear_stale_family(event.peer, family);
            }
            TimerKind::StaleExpired(family) => {
                if !peer.is_established() || peer.epoch != event.epoch {
                    return;
                }
                if peer.stale_families.contains(&family) {
                    warn!(peer_ip = %event.peer, %family, "no End-of-RIB before the stale timer, dropping stale paths");
                }
                self.clear_stale_family(event.peer, family);
            }
            TimerKind::DeferralExpired(kind) => {
                if !peer.is_established() || peer.epoch != event.epoch {
                    return;
                }
                let families: Vec<AfiSafi> = peer
                    .deferred
                    .iter()
                    .filter(|(_, d)| **d == kind)
                    .map(|(f, _)| *f)
                    .collect();
                if !families.is_empty() {
                    info!(peer_ip = %event.peer, ?kind, families = families.len(), "deferral timer expired");
                }
                self.release_deferred(event.peer, families);
            }
        }
    }

    /// Drop whatever is still stale for `family` and stop its timers.
    fn clear_stale_family(&mut self, addr: IpAddr, family: AfiSafi) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        if !peer.stale_families.remove(&family) {
            return;
        }
        if let Some(timer) = peer.llgr_timers.remove(&family) {
            timer.abort();
        }
        let dropped = peer.rib_in.take_stale(family);
        let changes = self.rib.clear_stale(addr, family);
        debug!(peer_ip = %addr, %family, dropped = dropped.len(), "stale paths cleared");
        self.publish(changes);
    }

    fn end_of_rib(&mut self, addr: IpAddr, family: AfiSafi) {
        debug!(peer_ip = %addr, %family, "end-of-rib received");
        self.clear_stale_family(addr, family);

        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        let released: Vec<AfiSafi> = peer
            .deferred
            .iter()
            .filter(|(f, d)| match d {
                Deferral::Rtc => family == AfiSafi::RTC,
                Deferral::Restart => **f == family,
            })
            .map(|(f, _)| *f)
            .collect();
        self.release_deferred(addr, released);
    }

    fn release_deferred(&mut self, addr: IpAddr, families: Vec<AfiSafi>) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        for family in &families {
            peer.deferred.remove(family);
        }
        for family in families {
            self.flush_family(addr, family, true);
        }
    }

    /// Drop everything `addr` contributed to `family`.
    pub(crate) fn withdraw_peer_family(&mut self, addr: IpAddr, family: AfiSafi) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        peer.stale_families.remove(&family);
        if let Some(timer) = peer.llgr_timers.remove(&family) {
            timer.abort();
        }
        peer.rib_in.clear_family(family);
        let changes = self.rib.drop_peer(addr, family);
        self.publish(changes);
    }

    fn handle_update(&mut self, addr: IpAddr, update: UpdateMessage) {
        if self.watchers.wants(|o| o.raw_message) {
            self.watchers.emit(WatchEvent::RawMessage {
                peer: addr,
                update: update.clone(),
            });
        }

        let local_asn = self.local.asn;
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        let outcome = peer.handle_update(&update, local_asn);
        if let Some(notification) = outcome.notification {
            warn!(peer_ip = %addr, %notification, "resetting session");
            if let Err(e) = peer.command(SessionCmd::Reset(notification)) {
                debug!(peer_ip = %addr, error = %e, "session already gone");
            }
            return;
        }
        let paths = self.import_paths(addr, outcome.paths);
        let rtc_changed = paths.iter().any(|p| p.family() == AfiSafi::RTC);

        self.propagate_update(Some(addr), paths);
        for family in outcome.eors {
            self.end_of_rib(addr, family);
        }
        if rtc_changed {
            self.resend_vpn(addr);
        }
    }

    /// Table form of paths learned from `addr`: VPN for a VRF-bound peer,
    /// with the RPKI verdict stamped.
    pub(crate) fn import_paths(&self, addr: IpAddr, paths: Vec<Arc<Path>>) -> Vec<Arc<Path>> {
        let vrf = self
            .peers
            .get(&addr)
            .and_then(|p| p.vrf.as_ref())
            .and_then(|v| self.vrfs.get(&v.name));
        paths
            .into_iter()
            .map(|path| match vrf {
                Some(entry) => vrf_export(entry, &path),
                None => path,
            })
            .map(|path| self.with_validation(path))
            .collect()
    }

    /// Stamp the RPKI verdict for the current ROA set.
    pub(crate) fn with_validation(&self, path: Arc<Path>) -> Arc<Path> {
        if path.withdraw {
            return path;
        }
        let verdict = self.rpki.validate(&path);
        if verdict == path.validation {
            return path;
        }
        path.clone_with(|p| p.validation = verdict)
    }
}

/// Turn a unicast path learned in a VRF into the VPN path the tables hold:
/// the VRF's route distinguisher, label and export route targets.
pub(crate) fn vrf_export(entry: &VrfEntry, path: &Arc<Path>) -> Arc<Path> {
    let Nlri::Unicast(prefix) = path.nlri else {
        return Arc::clone(path);
    };
    path.clone_with(|p| {
        p.nlri = Nlri::Vpn {
            rd: entry.vrf.rd,
            prefix,
        };
        if p.withdraw {
            return;
        }
        p.label = Some(entry.label);
        let mut attrs = (*p.attrs).clone();
        for rt in &entry.vrf.export_rt {
            if !attrs.extended_communities.contains(rt) {
                attrs.extended_communities.push(*rt);
            }
        }
        p.attrs = Arc::new(attrs);
    })
}

fn spawn_timer(
    tx: &mpsc::UnboundedSender<TimerEvent>,
    delay: Duration,
    event: TimerEvent,
) -> JoinHandle<()> {
    let tx = tx.clone();
    tokio::spawn(async move {
        sleep(delay).await;
        let _ = tx.send(event);
    })
}

async fn accept_loop(listener: TcpListener, tx: mpsc::UnboundedSender<(TcpStream, SocketAddr)>) {
    loop {
        match listener.accept().await {
            Ok(conn) => {
                if tx.send(conn).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PeerGroupConfig, VrfConfig};
    use crate::test_helpers::*;
    use std::net::Ipv4Addr;

    fn config() -> Config {
        Config::new(65000, Ipv4Addr::new(1, 1, 1, 1), vec!["127.0.0.1:0".to_string()])
    }

    fn vrf_entry() -> VrfEntry {
        let vrf = VrfConfig {
            name: "blue".to_string(),
            rd: "65000:1".to_string(),
            import_rt: vec!["65000:1".to_string()],
            export_rt: vec!["65000:1".to_string()],
        }
        .resolve()
        .unwrap();
        VrfEntry { vrf, label: 16 }
    }

    #[test]
    fn test_server_error_display() {
        let cases = [
            (ServerError::Duplicate("neighbor 10.0.0.1".into()), "neighbor 10.0.0.1 already exists"),
            (ServerError::UnknownReference("vrf 'x'".into()), "unknown vrf 'x'"),
            (ServerError::InUse("policy 'p'".into()), "policy 'p' is in use"),
            (ServerError::ServerGone, "server is not running"),
        ];
        for (err, want) in cases {
            assert_eq!(err.to_string(), want);
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut cfg = config();
        cfg.peers.push(PeerConfig::new("10.0.0.1".parse().unwrap(), 65001));
        cfg.peers.push(PeerConfig::new("10.0.0.1".parse().unwrap(), 65002));
        assert!(matches!(
            BgpServer::new(cfg),
            Err(ServerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_vrf_export() {
        let entry = vrf_entry();
        let path = create_test_path("10.0.0.1", "10.1.0.0/24");
        let vpn = vrf_export(&entry, &path);

        assert_eq!(
            vpn.nlri,
            Nlri::Vpn {
                rd: entry.vrf.rd,
                prefix: "10.1.0.0/24".parse().unwrap()
            }
        );
        assert_eq!(vpn.label, Some(16));
        assert_eq!(vpn.attrs.extended_communities, entry.vrf.export_rt);
        // input untouched
        assert!(matches!(path.nlri, Nlri::Unicast(_)));

        let withdraw = vrf_export(&entry, &path.to_withdraw());
        assert!(withdraw.withdraw);
        assert_eq!(withdraw.label, None);
        assert_eq!(withdraw.family(), AfiSafi::IPV4_VPN);
    }

    #[test]
    fn test_dynamic_peer_config() {
        let mut cfg = config();
        let group = PeerGroupConfig {
            name: "edge".to_string(),
            asn: Some(65010),
            route_server_client: true,
            dynamic_neighbors: vec!["192.0.2.0/24".to_string()],
            ..Default::default()
        };
        cfg.peer_groups.push(group);
        let server = BgpServer::new(cfg).unwrap();

        let inside = server.dynamic_peer_config("192.0.2.7".parse().unwrap()).unwrap();
        assert_eq!(inside.asn, 65010);
        assert!(inside.passive_mode);
        assert!(inside.route_server_client);
        assert_eq!(inside.peer_group.as_deref(), Some("edge"));
        assert!(server.dynamic_peer_config("198.51.100.1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_with_validation() {
        use crate::config::RoaConfig;
        use crate::rpki::RpkiVerdict;

        let mut cfg = config();
        cfg.roas.push(RoaConfig {
            prefix: "10.1.0.0/16".to_string(),
            max_length: 24,
            asn: 65001,
        });
        let server = BgpServer::new(cfg).unwrap();

        let valid = server.with_validation(create_test_path("10.0.0.1", "10.1.0.0/24"));
        assert_eq!(valid.validation, RpkiVerdict::Valid);
        let invalid = server.with_validation(create_test_path("10.0.0.1", "10.1.0.0/25"));
        assert_eq!(invalid.validation, RpkiVerdict::Invalid);
        let unknown = server.with_validation(create_test_path("10.0.0.1", "10.9.0.0/24"));
        assert_eq!(unknown.validation, RpkiVerdict::NotFound);
    }
}
