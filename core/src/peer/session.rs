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

//! Session coordinator: one task per FSM.
//!
//! The coordinator owns the `Fsm`, its timers and the connection. While a
//! connection is up a reader task decodes messages and feeds them back over
//! an internal channel; once Established a writer task owns the write half,
//! drains the outgoing queue and sends keepalives. Every event reported to
//! the server carries the FSM generation and the Established epoch.

use crate::bgp::capability::{negotiate, Capability, NegotiatedCapabilities};
use crate::bgp::codec::{Codec, CodecContext, DecodeError, UpdateErrorHandling};
use crate::bgp::family::AfiSafi;
use crate::bgp::msg::{read_frame, BgpMessage, FrameError, MessageType, OpenMessage, UpdateMessage};
use crate::bgp::notification::{BgpError, CeaseSubcode, NotificationMessage, OpenMessageError};
use crate::config::{Config, PeerConfig};
use crate::log::{debug, info, warn};
use crate::net::{connect, ConnectOptions, TransportConfig};
use crate::peer::fsm::{BgpState, Fsm, FsmEvent, FsmTimers};
use crate::peer::supervisor::{abort_and_join, join_within};
use crate::peer::{local_capabilities, MessageCounters, Outgoing, PeerError};
use crate::types::{AdminState, StateReason};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, Interval, MissedTickBehavior};

/// Floor for the connect-retry interval so a zero setting cannot spin.
const MIN_CONNECT_RETRY: Duration = Duration::from_secs(1);

/// How long a closing writer waits to flush its NOTIFICATION.
const NOTIFICATION_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Commands from the server to a session.
#[derive(Debug)]
pub enum SessionCmd {
    /// Enable the neighbor and start connecting now.
    Connect,
    /// Administrative stop; the FSM stays Idle until `Connect`.
    Stop(CeaseSubcode),
    /// Close the session with this NOTIFICATION and restart after the idle
    /// hold time.
    Reset(NotificationMessage),
    /// Accepted connection from this neighbor.
    Incoming(TcpStream),
    /// Close and exit.
    Shutdown(CeaseSubcode),
}

/// What the server learns about a session when it reaches Established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub remote_asn: u32,
    pub remote_router_id: Ipv4Addr,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub negotiated: NegotiatedCapabilities,
    pub hold_time: u16,
    pub keepalive_time: u16,
}

#[derive(Debug)]
pub enum SessionEvent {
    StateChanged {
        old: BgpState,
        new: BgpState,
        reason: StateReason,
        /// Set on entry to Established.
        info: Option<Box<SessionInfo>>,
    },
    Update(UpdateMessage),
    RouteRefresh(AfiSafi),
    /// RFC 7606 AFI/SAFI disable: drop everything learned for the family.
    FamilyDisabled(AfiSafi),
}

#[derive(Debug)]
pub struct FsmMessage {
    pub peer: IpAddr,
    pub generation: u64,
    pub epoch: u64,
    pub event: SessionEvent,
}

/// Per-session settings derived from the neighbor and global config.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub peer: IpAddr,
    pub remote: SocketAddr,
    pub local_asn: u32,
    pub router_id: Ipv4Addr,
    /// Zero accepts any AS.
    pub remote_asn: u32,
    pub hold_time: u16,
    pub open_sent_hold: Duration,
    pub connect_retry: Duration,
    pub idle_hold: Duration,
    pub passive: bool,
    pub admin: AdminState,
    pub capabilities: Vec<Capability>,
    pub treat_as_withdraw: bool,
    pub connect: ConnectOptions,
    pub join_deadline: Duration,
    pub generation: u64,
}

impl SessionParams {
    pub fn new(config: &PeerConfig, global: &Config, generation: u64) -> Self {
        SessionParams {
            peer: config.address,
            remote: config.remote_addr(),
            local_asn: global.asn,
            router_id: global.router_id,
            remote_asn: config.asn,
            hold_time: config.hold_time(global),
            open_sent_hold: Duration::from_secs(global.open_sent_hold_time_secs as u64),
            connect_retry: config.connect_retry(global),
            idle_hold: config.idle_hold(global),
            passive: config.passive_mode,
            admin: if config.admin_down {
                AdminState::Down
            } else {
                AdminState::Up
            },
            capabilities: local_capabilities(config, global.asn),
            treat_as_withdraw: config.treat_as_withdraw,
            connect: ConnectOptions {
                local_addr: config.local_address,
                md5_key: config.md5_password.as_ref().map(|p| p.as_bytes().to_vec()),
                ttl_security_hops: config.ttl_security,
            },
            join_deadline: global.join_deadline(),
            generation,
        }
    }
}

/// Shared collaborators for every session of a server.
#[derive(Clone)]
pub struct SessionDeps {
    pub codec: Arc<dyn Codec>,
    pub transport: Arc<dyn TransportConfig>,
    pub events: mpsc::UnboundedSender<FsmMessage>,
}

/// Channel ends a session task owns.
pub struct SessionChannels {
    pub cmd_rx: mpsc::UnboundedReceiver<SessionCmd>,
    pub out_rx: mpsc::UnboundedReceiver<Outgoing>,
    pub counters: Arc<MessageCounters>,
}

/// Events from the session's own tasks, tagged with the connection they
/// belong to so events from a replaced connection are dropped.
enum Internal {
    Message { conn: u64, msg: BgpMessage },
    DecodeFailed { conn: u64, error: DecodeError },
    ReadFailed { conn: u64, error: String },
    WriteFailed { conn: u64, error: String },
    Connected(TcpStream),
}

struct Connection {
    id: u64,
    outbound: bool,
    local: SocketAddr,
    remote: SocketAddr,
    /// None once the writer task owns it.
    write: Option<OwnedWriteHalf>,
    reader: JoinHandle<()>,
    ctx: watch::Sender<CodecContext>,
}

struct Writer {
    close: oneshot::Sender<Option<NotificationMessage>>,
    handle: JoinHandle<()>,
}

/// The outgoing queue outlives every connection. A writer holds the lock
/// while it runs; the lock is released however the writer exits.
type SharedQueue = Arc<Mutex<mpsc::UnboundedReceiver<Outgoing>>>;

pub fn spawn(params: SessionParams, deps: SessionDeps, channels: SessionChannels) -> JoinHandle<()> {
    let session = Session::new(params, deps, channels);
    tokio::spawn(session.run())
}

struct Session {
    params: SessionParams,
    deps: SessionDeps,
    fsm: Fsm,
    counters: Arc<MessageCounters>,
    cmd_rx: mpsc::UnboundedReceiver<SessionCmd>,
    /// Locked by the writer while Established.
    out_rx: SharedQueue,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    conn: Option<Connection>,
    conn_seq: u64,
    /// Inbound connection that arrived in OpenSent, resolved on OPEN.
    parked: Option<TcpStream>,
    peer_open: Option<OpenMessage>,
    dialer: Option<JoinHandle<()>>,
    writer: Option<Writer>,
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Session {
    fn new(params: SessionParams, deps: SessionDeps, channels: SessionChannels) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Session {
            fsm: Fsm::new(params.generation, params.idle_hold, params.admin),
            params,
            deps,
            counters: channels.counters,
            cmd_rx: channels.cmd_rx,
            out_rx: Arc::new(Mutex::new(channels.out_rx)),
            internal_tx,
            internal_rx,
            conn: None,
            conn_seq: 0,
            parked: None,
            peer_open: None,
            dialer: None,
            writer: None,
        }
    }

    async fn run(mut self) {
        debug!(peer = %self.params.peer, generation = self.params.generation, "session task started");
        self.fsm.schedule_restart(Instant::now());

        while self.fsm.state() != BgpState::Dying {
            let timers: FsmTimers = self.fsm.timers.clone();
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_cmd(cmd).await,
                    None => self.shutdown(CeaseSubcode::PeerDeconfigured).await,
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal).await,
                _ = expire(timers.hold) => self.hold_timer_expired().await,
                _ = expire(timers.keepalive) => self.keepalive_timer_expired().await,
                _ = expire(timers.idle_hold) => self.idle_hold_expired().await,
                _ = expire(timers.graceful_restart) => self.graceful_restart_expired(),
            }
        }
        debug!(peer = %self.params.peer, generation = self.params.generation, "session task exited");
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.deps.events.send(FsmMessage {
            peer: self.params.peer,
            generation: self.fsm.generation,
            epoch: self.fsm.epoch,
            event,
        });
    }

    fn report_state(
        &mut self,
        old: BgpState,
        new: BgpState,
        reason: StateReason,
        info: Option<SessionInfo>,
    ) {
        info!(peer = %self.params.peer, %old, %new, %reason, "peer state changed");
        self.fsm.last_reason = Some(reason.clone());
        self.emit(SessionEvent::StateChanged {
            old,
            new,
            reason,
            info: info.map(Box::new),
        });
    }

    async fn handle_cmd(&mut self, cmd: SessionCmd) {
        match cmd {
            SessionCmd::Connect => {
                self.fsm.admin = AdminState::Up;
                if self.fsm.state() == BgpState::Idle {
                    self.fsm.clear_backoff();
                    self.start();
                }
            }
            SessionCmd::Stop(subcode) => {
                self.fsm.admin = AdminState::Down;
                self.fsm.timers.idle_hold = None;
                self.close(
                    FsmEvent::Stop,
                    StateReason::AdminDown(subcode),
                    Some(NotificationMessage::cease(subcode)),
                    false,
                )
                .await;
            }
            SessionCmd::Reset(notification) => {
                if self.fsm.state() == BgpState::Idle {
                    self.fsm.schedule_restart(Instant::now());
                    return;
                }
                let reason = match notification.error {
                    BgpError::Cease(subcode) => StateReason::AdminReset(subcode),
                    _ => StateReason::NotificationSent(notification.clone()),
                };
                self.close(FsmEvent::Stop, reason, Some(notification), true)
                    .await;
            }
            SessionCmd::Incoming(stream) => self.incoming(stream).await,
            SessionCmd::Shutdown(subcode) => self.shutdown(subcode).await,
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Connected(stream) => {
                if let Some(dialer) = self.dialer.take() {
                    join_within(dialer, self.params.join_deadline, self.params.peer, "dialer").await;
                }
                if self.fsm.state() == BgpState::Active {
                    self.connection_up(stream, true).await;
                } else {
                    debug!(peer = %self.params.peer, state = %self.fsm.state(), "dropping late outbound connection");
                }
            }
            Internal::Message { conn, msg } if self.is_current(conn) => {
                self.handle_message(msg).await;
            }
            Internal::DecodeFailed { conn, error } if self.is_current(conn) => {
                self.handle_decode_error(error).await;
            }
            Internal::ReadFailed { conn, error } | Internal::WriteFailed { conn, error }
                if self.is_current(conn) =>
            {
                self.close(FsmEvent::IoFailure, StateReason::IoFailure(error), None, true)
                    .await;
            }
            _ => debug!(peer = %self.params.peer, "dropping event from a closed connection"),
        }
    }

    fn is_current(&self, conn: u64) -> bool {
        self.conn.as_ref().map(|c| c.id) == Some(conn)
    }

    /// Idle -> Active. Non-passive neighbors start dialing.
    fn start(&mut self) {
        let old = self.fsm.state();
        self.fsm.timers.idle_hold = None;
        if self.fsm.handle_event(&FsmEvent::Start) != BgpState::Active {
            return;
        }
        if !self.params.passive {
            self.spawn_dialer();
        }
        self.report_state(old, BgpState::Active, StateReason::Progress, None);
    }

    fn spawn_dialer(&mut self) {
        let dialer = Dialer {
            peer: self.params.peer,
            remote: self.params.remote,
            opts: self.params.connect.clone(),
            retry: self.params.connect_retry,
            transport: Arc::clone(&self.deps.transport),
            internal: self.internal_tx.clone(),
        };
        self.dialer = Some(tokio::spawn(dialer.run()));
    }

    async fn idle_hold_expired(&mut self) {
        self.fsm.timers.idle_hold = None;
        if self.fsm.state() == BgpState::Idle && self.fsm.admin == AdminState::Up {
            self.start();
        }
    }

    fn graceful_restart_expired(&mut self) {
        self.fsm.timers.graceful_restart = None;
        let state = self.fsm.state();
        self.report_state(state, state, StateReason::GracefulRestartExpired, None);
    }

    async fn hold_timer_expired(&mut self) {
        self.fsm.timers.hold = None;
        let state = self.fsm.state();
        if matches!(
            state,
            BgpState::OpenSent | BgpState::OpenConfirm | BgpState::Established
        ) {
            warn!(peer = %self.params.peer, %state, "hold timer expired");
            self.close(
                FsmEvent::HoldTimerExpires,
                StateReason::HoldTimerExpired,
                Some(NotificationMessage::hold_timer_expired()),
                true,
            )
            .await;
        }
    }

    /// Keepalives before Established; the writer task sends them after.
    async fn keepalive_timer_expired(&mut self) {
        self.fsm.timers.keepalive = None;
        if self.fsm.state() != BgpState::OpenConfirm {
            return;
        }
        if let Err(e) = self.write_direct(BgpMessage::Keepalive).await {
            self.close(FsmEvent::IoFailure, StateReason::IoFailure(e.to_string()), None, true)
                .await;
            return;
        }
        self.fsm.timers.keepalive = self.fsm.keepalive_duration().map(|d| Instant::now() + d);
    }

    async fn incoming(&mut self, stream: TcpStream) {
        match self.fsm.state() {
            BgpState::Dying => {}
            BgpState::Idle => {
                if self.fsm.admin == AdminState::Down {
                    debug!(peer = %self.params.peer, "rejecting connection while admin down");
                    return;
                }
                self.start();
                self.connection_up(stream, false).await;
            }
            BgpState::Active => self.connection_up(stream, false).await,
            BgpState::OpenSent => {
                if self.parked.is_none() {
                    debug!(peer = %self.params.peer, "parking inbound connection until OPEN");
                    self.parked = Some(stream);
                } else {
                    self.reject_collision(stream).await;
                }
            }
            BgpState::OpenConfirm => {
                let inbound_wins = self
                    .peer_open
                    .as_ref()
                    .is_some_and(|open| self.inbound_wins(open.router_id));
                if inbound_wins {
                    self.switch_connection(stream).await;
                } else {
                    self.reject_collision(stream).await;
                }
            }
            BgpState::Established => {
                let gr = self
                    .fsm
                    .negotiated
                    .as_ref()
                    .is_some_and(|c| c.graceful_restart.is_some());
                if gr {
                    info!(peer = %self.params.peer, "new connection while established, peer restarted");
                    self.close(FsmEvent::Stop, StateReason::PeerRestarted, None, false)
                        .await;
                    self.start();
                    self.connection_up(stream, false).await;
                } else {
                    self.reject_collision(stream).await;
                }
            }
        }
    }

    /// RFC 4271 6.8: the connection opened by the higher BGP identifier
    /// survives. An inbound connection wins only against our outbound one.
    fn inbound_wins(&self, remote_id: Ipv4Addr) -> bool {
        let current_outbound = self.conn.as_ref().is_some_and(|c| c.outbound);
        current_outbound && u32::from(remote_id) > u32::from(self.params.router_id)
    }

    async fn switch_connection(&mut self, stream: TcpStream) {
        info!(peer = %self.params.peer, "collision: inbound connection wins");
        self.close(
            FsmEvent::Stop,
            StateReason::ConnectionCollision,
            Some(NotificationMessage::cease(
                CeaseSubcode::ConnectionCollisionResolution,
            )),
            false,
        )
        .await;
        self.start();
        self.connection_up(stream, false).await;
    }

    async fn reject_collision(&self, mut stream: TcpStream) {
        debug!(peer = %self.params.peer, "collision: closing extra connection");
        let msg = BgpMessage::Notification(NotificationMessage::cease(
            CeaseSubcode::ConnectionCollisionResolution,
        ));
        let bytes = self.deps.codec.encode(&CodecContext::default(), &msg);
        if stream.write_all(&bytes).await.is_ok() {
            self.counters.record_sent(MessageType::Notification);
        }
        let _ = stream.shutdown().await;
    }

    /// Active -> OpenSent on any usable connection; the OPEN goes out at once.
    async fn connection_up(&mut self, stream: TcpStream, outbound: bool) {
        if let Some(dialer) = self.dialer.take() {
            abort_and_join(dialer, self.params.join_deadline, self.params.peer, "dialer").await;
        }
        let (local, remote) = match (stream.local_addr(), stream.peer_addr()) {
            (Ok(local), Ok(remote)) => (local, remote),
            _ => {
                debug!(peer = %self.params.peer, "connection closed before setup");
                return;
            }
        };
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();

        self.conn_seq += 1;
        let id = self.conn_seq;
        let (ctx_tx, ctx_rx) = watch::channel(CodecContext::default());
        let reader = tokio::spawn(run_reader(Reader {
            conn: id,
            read,
            codec: Arc::clone(&self.deps.codec),
            ctx: ctx_rx,
            counters: Arc::clone(&self.counters),
            internal: self.internal_tx.clone(),
        }));
        self.conn = Some(Connection {
            id,
            outbound,
            local,
            remote,
            write: Some(write),
            reader,
            ctx: ctx_tx,
        });

        let old = self.fsm.state();
        self.fsm.handle_event(&FsmEvent::ConnectionUp);
        self.fsm.timers.hold = Some(Instant::now() + self.params.open_sent_hold);
        self.report_state(old, BgpState::OpenSent, StateReason::Progress, None);

        let open = OpenMessage::new(
            self.params.local_asn,
            self.params.hold_time,
            self.params.router_id,
            self.params.capabilities.clone(),
        );
        if let Err(e) = self.write_direct(BgpMessage::Open(open)).await {
            self.close(FsmEvent::IoFailure, StateReason::IoFailure(e.to_string()), None, true)
                .await;
        }
    }

    /// Write on the connection before the writer task takes it over.
    async fn write_direct(&mut self, msg: BgpMessage) -> Result<(), PeerError> {
        let conn = self.conn.as_mut().ok_or(PeerError::Shutdown)?;
        let write = conn.write.as_mut().ok_or(PeerError::Shutdown)?;
        let ctx = conn.ctx.borrow().clone();
        let bytes = self.deps.codec.encode(&ctx, &msg);
        write.write_all(&bytes).await?;
        self.counters.record_sent(msg.message_type());
        Ok(())
    }

    async fn handle_message(&mut self, msg: BgpMessage) {
        let state = self.fsm.state();
        if matches!(state, BgpState::OpenConfirm | BgpState::Established) {
            self.fsm.reset_hold_timer(Instant::now());
        }
        match msg {
            BgpMessage::Open(open) => self.open_received(open).await,
            BgpMessage::Keepalive => match state {
                BgpState::OpenConfirm => self.established().await,
                BgpState::Established => {}
                _ => self.fsm_error(FsmEvent::KeepaliveReceived).await,
            },
            BgpMessage::Update(update) => {
                if state == BgpState::Established {
                    self.emit(SessionEvent::Update(update));
                } else {
                    self.fsm_error(FsmEvent::UpdateReceived).await;
                }
            }
            BgpMessage::RouteRefresh(rr) => {
                if state != BgpState::Established {
                    self.fsm_error(FsmEvent::RouteRefreshReceived).await;
                    return;
                }
                let negotiated = rr.afi_safi().filter(|family| {
                    self.fsm
                        .negotiated
                        .as_ref()
                        .is_some_and(|c| c.has_family(*family))
                });
                match negotiated {
                    Some(family) => self.emit(SessionEvent::RouteRefresh(family)),
                    None => debug!(peer = %self.params.peer, afi = rr.afi, safi = rr.safi, "ignoring ROUTE-REFRESH for unknown family"),
                }
            }
            BgpMessage::Notification(notification) => {
                warn!(peer = %self.params.peer, %notification, "NOTIFICATION received");
                self.close(
                    FsmEvent::NotificationReceived,
                    StateReason::NotificationReceived(notification),
                    None,
                    true,
                )
                .await;
            }
        }
    }

    /// RFC 4271 6.6: unexpected message for the state.
    async fn fsm_error(&mut self, event: FsmEvent) {
        let notification = NotificationMessage::fsm_error();
        warn!(peer = %self.params.peer, state = %self.fsm.state(), ?event, "unexpected message");
        self.close(
            event,
            StateReason::NotificationSent(notification.clone()),
            Some(notification),
            true,
        )
        .await;
    }

    fn validate_open(&self, open: &OpenMessage) -> Result<(), PeerError> {
        if self.params.remote_asn != 0 && open.asn != self.params.remote_asn {
            return Err(PeerError::Decode(NotificationMessage::open_error(
                OpenMessageError::BadPeerAs,
                Vec::new(),
            )));
        }
        if open.router_id == self.params.router_id {
            return Err(PeerError::Decode(NotificationMessage::open_error(
                OpenMessageError::BadBgpIdentifier,
                open.router_id.octets().to_vec(),
            )));
        }
        if open.hold_time != 0 && open.hold_time < 3 {
            return Err(PeerError::Decode(NotificationMessage::open_error(
                OpenMessageError::UnacceptableHoldTime,
                Vec::new(),
            )));
        }
        Ok(())
    }

    /// OpenSent -> OpenConfirm: negotiate, fix hold/keepalive, send KEEPALIVE.
    async fn open_received(&mut self, open: OpenMessage) {
        if self.fsm.state() != BgpState::OpenSent {
            self.fsm_error(FsmEvent::OpenReceived).await;
            return;
        }
        if let Err(PeerError::Decode(notification)) = self.validate_open(&open) {
            warn!(peer = %self.params.peer, %notification, asn = open.asn, router_id = %open.router_id, "rejecting OPEN");
            self.close(
                FsmEvent::MessageError,
                StateReason::NotificationSent(notification.clone()),
                Some(notification),
                true,
            )
            .await;
            return;
        }

        if let Some(parked) = self.parked.take() {
            if self.inbound_wins(open.router_id) {
                self.switch_connection(parked).await;
                return;
            }
            self.reject_collision(parked).await;
        }

        let caps = negotiate(&self.params.capabilities, &open.capabilities);
        if let Some(conn) = &self.conn {
            conn.ctx.send_replace(CodecContext::from_negotiated(&caps));
        }
        self.fsm.set_negotiated(caps, self.params.hold_time, open.hold_time);

        let now = Instant::now();
        self.fsm.handle_event(&FsmEvent::OpenReceived);
        self.fsm.timers.hold = self.fsm.hold_duration().map(|d| now + d);
        self.fsm.timers.keepalive = self.fsm.keepalive_duration().map(|d| now + d);
        debug!(peer = %self.params.peer, asn = open.asn, router_id = %open.router_id,
               hold = self.fsm.hold_time, "OPEN accepted");
        self.peer_open = Some(open);

        if let Err(e) = self.write_direct(BgpMessage::Keepalive).await {
            self.close(FsmEvent::IoFailure, StateReason::IoFailure(e.to_string()), None, true)
                .await;
            return;
        }
        self.report_state(
            BgpState::OpenSent,
            BgpState::OpenConfirm,
            StateReason::Progress,
            None,
        );
    }

    /// OpenConfirm -> Established: hand the write half to a writer task.
    async fn established(&mut self) {
        let Ok(out_rx) = Arc::clone(&self.out_rx).try_lock_owned() else {
            crate::fatal!(peer = %self.params.peer, "outgoing queue held by a previous writer, shutting session down");
            self.shutdown(CeaseSubcode::OutOfResources).await;
            return;
        };
        let (Some(conn), Some(open), Some(negotiated)) =
            (self.conn.as_mut(), self.peer_open.as_ref(), self.fsm.negotiated.as_ref())
        else {
            return;
        };
        let Some(write) = conn.write.take() else {
            return;
        };
        let ctx = conn.ctx.borrow().clone();
        let info = SessionInfo {
            remote_asn: open.asn,
            remote_router_id: open.router_id,
            local_addr: conn.local,
            remote_addr: conn.remote,
            negotiated: negotiated.clone(),
            hold_time: self.fsm.hold_time,
            keepalive_time: self.fsm.keepalive_time,
        };
        let conn_id = conn.id;

        self.fsm.handle_event(&FsmEvent::KeepaliveReceived);
        self.fsm.on_established(Instant::now());

        let (close_tx, close_rx) = oneshot::channel();
        let writer = WriterTask {
            peer: self.params.peer,
            conn: conn_id,
            epoch: self.fsm.epoch,
            write,
            out_rx,
            close: close_rx,
            keepalive: self.fsm.keepalive_duration(),
            codec: Arc::clone(&self.deps.codec),
            ctx,
            counters: Arc::clone(&self.counters),
            internal: self.internal_tx.clone(),
        };
        self.writer = Some(Writer {
            close: close_tx,
            handle: tokio::spawn(writer.run()),
        });
        self.report_state(
            BgpState::OpenConfirm,
            BgpState::Established,
            StateReason::Progress,
            Some(info),
        );
    }

    /// RFC 7606: with revised error handling an Established session survives
    /// attribute errors; everything else resets it.
    async fn handle_decode_error(&mut self, error: DecodeError) {
        let revised = self.params.treat_as_withdraw
            && self.fsm.state() == BgpState::Established
            && !error.is_session_reset();
        if !revised {
            let notification = error.notification().clone();
            warn!(peer = %self.params.peer, %notification, "malformed message, closing session");
            self.close(
                FsmEvent::MessageError,
                StateReason::NotificationSent(notification.clone()),
                Some(notification),
                true,
            )
            .await;
            return;
        }

        self.fsm.reset_hold_timer(Instant::now());
        let DecodeError::Body {
            notification,
            handling,
        } = error
        else {
            return;
        };
        match handling {
            UpdateErrorHandling::AttributeDiscard { update } => {
                warn!(peer = %self.params.peer, %notification, "discarding malformed attributes");
                self.emit(SessionEvent::Update(update));
            }
            UpdateErrorHandling::TreatAsWithdraw { withdrawn } => {
                warn!(peer = %self.params.peer, %notification, count = withdrawn.len(), "treating UPDATE as withdraw");
                // an empty UPDATE would read as an End-of-RIB marker
                if !withdrawn.is_empty() {
                    self.emit(SessionEvent::Update(UpdateMessage {
                        withdrawn,
                        ..Default::default()
                    }));
                }
            }
            UpdateErrorHandling::AfiSafiDisable { family } => {
                warn!(peer = %self.params.peer, %notification, %family, "disabling family");
                self.emit(SessionEvent::FamilyDisabled(family));
            }
            UpdateErrorHandling::SessionReset => {}
        }
    }

    /// Any -> Idle. Sends `notification` if a connection is up, joins every
    /// task, arms the graceful restart timer when the teardown allows it and
    /// schedules the restart.
    async fn close(
        &mut self,
        event: FsmEvent,
        reason: StateReason,
        notification: Option<NotificationMessage>,
        count_reset: bool,
    ) {
        let old = self.fsm.state();
        if matches!(old, BgpState::Idle | BgpState::Dying) {
            return;
        }
        self.teardown(notification).await;

        let now = Instant::now();
        if old == BgpState::Established && reason.is_gr_eligible() {
            if let Some(restart_time) = self.fsm.negotiated.as_ref().and_then(|c| c.restart_time()) {
                debug!(peer = %self.params.peer, restart_time, "arming graceful restart timer");
                self.fsm.timers.graceful_restart =
                    Some(now + Duration::from_secs(restart_time as u64));
            }
        }

        let new = self.fsm.handle_event(&event);
        self.fsm.on_session_down(now, count_reset);
        self.fsm.schedule_restart(now);
        self.report_state(old, new, reason, None);
    }

    async fn teardown(&mut self, notification: Option<NotificationMessage>) {
        let deadline = self.params.join_deadline;
        let peer = self.params.peer;

        if let Some(dialer) = self.dialer.take() {
            abort_and_join(dialer, deadline, peer, "dialer").await;
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.close.send(notification);
            join_within(writer.handle, deadline, peer, "writer").await;
        } else if let Some(notification) = notification {
            if let Err(e) = self.write_direct(BgpMessage::Notification(notification)).await {
                debug!(%peer, error = %e, "could not send NOTIFICATION");
            }
        }
        if let Some(mut conn) = self.conn.take() {
            if let Some(mut write) = conn.write.take() {
                let _ = write.shutdown().await;
            }
            abort_and_join(conn.reader, deadline, peer, "reader").await;
        }
        self.parked = None;
        self.peer_open = None;
    }

    async fn shutdown(&mut self, subcode: CeaseSubcode) {
        self.close(
            FsmEvent::Stop,
            StateReason::Deconfigured,
            Some(NotificationMessage::cease(subcode)),
            false,
        )
        .await;
        let old = self.fsm.state();
        self.fsm.handle_event(&FsmEvent::Kill);
        self.fsm.timers = FsmTimers::default();
        self.report_state(old, BgpState::Dying, StateReason::Deconfigured, None);
    }
}

struct Reader {
    conn: u64,
    read: OwnedReadHalf,
    codec: Arc<dyn Codec>,
    ctx: watch::Receiver<CodecContext>,
    counters: Arc<MessageCounters>,
    internal: mpsc::UnboundedSender<Internal>,
}

async fn run_reader(mut reader: Reader) {
    let conn = reader.conn;
    loop {
        let (header, body) = match read_frame(&mut reader.read).await {
            Ok(frame) => frame,
            Err(FrameError::Io(e)) => {
                let _ = reader.internal.send(Internal::ReadFailed {
                    conn,
                    error: e.to_string(),
                });
                return;
            }
            Err(FrameError::Header(notification)) => {
                let _ = reader.internal.send(Internal::DecodeFailed {
                    conn,
                    error: DecodeError::Header(notification),
                });
                return;
            }
        };
        reader.counters.record_received(header.message_type);

        let decoded = {
            let ctx = reader.ctx.borrow();
            reader.codec.decode(&ctx, &header, &body)
        };
        let sent = match decoded {
            Ok(msg) => reader.internal.send(Internal::Message { conn, msg }),
            Err(error) => {
                let fatal = error.is_session_reset();
                let sent = reader.internal.send(Internal::DecodeFailed { conn, error });
                if fatal {
                    return;
                }
                sent
            }
        };
        if sent.is_err() {
            return;
        }
    }
}

struct WriterTask {
    peer: IpAddr,
    conn: u64,
    epoch: u64,
    write: OwnedWriteHalf,
    out_rx: OwnedMutexGuard<mpsc::UnboundedReceiver<Outgoing>>,
    close: oneshot::Receiver<Option<NotificationMessage>>,
    keepalive: Option<Duration>,
    codec: Arc<dyn Codec>,
    ctx: CodecContext,
    counters: Arc<MessageCounters>,
    internal: mpsc::UnboundedSender<Internal>,
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl WriterTask {
    async fn send(&mut self, msg: &BgpMessage) -> Result<(), PeerError> {
        let bytes = self.codec.encode(&self.ctx, msg);
        self.write.write_all(&bytes).await?;
        self.counters.record_sent(msg.message_type());
        Ok(())
    }

    /// Best effort: a peer that stopped reading never gets it.
    async fn send_notification(&mut self, notification: NotificationMessage) {
        let msg = BgpMessage::Notification(notification);
        match timeout(NOTIFICATION_WRITE_TIMEOUT, self.send(&msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = %self.peer, error = %e, "could not send NOTIFICATION"),
            Err(_) => debug!(peer = %self.peer, "NOTIFICATION not flushed, peer is not reading"),
        }
    }

    /// Runs until the coordinator closes it. A close request also cuts short
    /// a write the peer is not draining.
    async fn run(mut self) {
        let mut ticker = self.keepalive.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        // set after a write error or when the server dropped the queue
        let mut stopped = false;

        loop {
            let msg = tokio::select! {
                biased;
                notification = &mut self.close => {
                    if let (Ok(Some(notification)), false) = (notification, stopped) {
                        self.send_notification(notification).await;
                    }
                    let _ = self.write.shutdown().await;
                    return;
                }
                item = self.out_rx.recv(), if !stopped => match item {
                    Some(out) if out.epoch == self.epoch => out.msg,
                    Some(out) => {
                        debug!(peer = %self.peer, epoch = out.epoch, "dropping message queued for an earlier session");
                        continue;
                    }
                    None => {
                        stopped = true;
                        continue;
                    }
                },
                _ = tick(&mut ticker), if !stopped => BgpMessage::Keepalive,
            };

            let bytes = self.codec.encode(&self.ctx, &msg);
            tokio::select! {
                biased;
                _ = &mut self.close => {
                    // a partial frame is on the wire, so no NOTIFICATION
                    debug!(peer = %self.peer, "closed with a write in flight");
                    return;
                }
                written = self.write.write_all(&bytes) => match written {
                    Ok(()) => self.counters.record_sent(msg.message_type()),
                    Err(e) => {
                        stopped = true;
                        self.fail(e.into());
                    }
                },
            }
        }
    }

    fn fail(&self, error: PeerError) {
        let _ = self.internal.send(Internal::WriteFailed {
            conn: self.conn,
            error: error.to_string(),
        });
    }
}

struct Dialer {
    peer: IpAddr,
    remote: SocketAddr,
    opts: ConnectOptions,
    retry: Duration,
    transport: Arc<dyn TransportConfig>,
    internal: mpsc::UnboundedSender<Internal>,
}

/// Connect-retry interval jittered by +/-25%.
fn jittered(base: Duration) -> Duration {
    let base = base.max(MIN_CONNECT_RETRY);
    base.mul_f64(rand::thread_rng().gen_range(0.75..=1.25))
}

impl Dialer {
    async fn run(self) {
        loop {
            let attempt = timeout(
                self.retry.max(MIN_CONNECT_RETRY),
                connect(self.transport.as_ref(), self.remote, &self.opts),
            )
            .await;
            match attempt {
                Ok(Ok(stream)) => {
                    debug!(peer = %self.peer, remote = %self.remote, "outbound connection established");
                    let _ = self.internal.send(Internal::Connected(stream));
                    return;
                }
                Ok(Err(e)) => debug!(peer = %self.peer, error = %e, "connect failed"),
                Err(_) => debug!(peer = %self.peer, "connect timed out"),
            }
            sleep(jittered(self.retry)).await;
        }
    }
}
