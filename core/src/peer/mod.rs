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

//! Server-side state for one neighbor and the session task that drives it.

pub mod filter;
pub mod fsm;
mod incoming;
pub mod outgoing;
pub mod session;
pub(crate) mod supervisor;

pub use filter::{filterpath, PeerView};
pub use incoming::UpdateOutcome;

use crate::bgp::capability::{AddPathMode, Capability, GracefulRestartCap, LlgrFamily};
use crate::bgp::family::AfiSafi;
use crate::bgp::msg::{BgpMessage, MessageType};
use crate::bgp::notification::{CeaseSubcode, NotificationMessage};
use crate::config::{Config, PeerConfig, Vrf};
use crate::peer::fsm::BgpState;
use crate::peer::session::{SessionChannels, SessionCmd, SessionDeps, SessionInfo, SessionParams};
use crate::rib::{AdjRibIn, PathSource};
use crate::types::{AdminState, StateReason};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::io::Error;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum PeerError {
    /// I/O error during message send/receive
    Io(Error),
    /// Malformed or unacceptable message; carries the NOTIFICATION to send
    Decode(NotificationMessage),
    /// Operation not valid in the current state
    Fsm(BgpState),
    /// The session task is gone
    Shutdown,
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::Io(e) => write!(f, "I/O error: {}", e),
            PeerError::Decode(n) => write!(f, "message error: {}", n),
            PeerError::Fsm(state) => write!(f, "not allowed in state {}", state),
            PeerError::Shutdown => write!(f, "session shut down"),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<Error> for PeerError {
    fn from(e: Error) -> Self {
        PeerError::Io(e)
    }
}

/// Message counters, written by the session tasks and read by the server.
#[derive(Debug, Default)]
pub struct MessageCounters {
    sent: [AtomicU64; 5],
    received: [AtomicU64; 5],
}

fn counter_index(t: MessageType) -> usize {
    match t {
        MessageType::Open => 0,
        MessageType::Update => 1,
        MessageType::Notification => 2,
        MessageType::Keepalive => 3,
        MessageType::RouteRefresh => 4,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStatistics {
    pub open_sent: u64,
    pub update_sent: u64,
    pub notification_sent: u64,
    pub keepalive_sent: u64,
    pub route_refresh_sent: u64,
    pub open_received: u64,
    pub update_received: u64,
    pub notification_received: u64,
    pub keepalive_received: u64,
    pub route_refresh_received: u64,
}

impl MessageCounters {
    pub fn record_sent(&self, t: MessageType) {
        self.sent[counter_index(t)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, t: MessageType) {
        self.received[counter_index(t)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PeerStatistics {
        let s = |i: usize| self.sent[i].load(Ordering::Relaxed);
        let r = |i: usize| self.received[i].load(Ordering::Relaxed);
        PeerStatistics {
            open_sent: s(0),
            update_sent: s(1),
            notification_sent: s(2),
            keepalive_sent: s(3),
            route_refresh_sent: s(4),
            open_received: r(0),
            update_received: r(1),
            notification_received: r(2),
            keepalive_received: r(3),
            route_refresh_received: r(4),
        }
    }
}

/// A message for the writer of one Established session.
#[derive(Debug)]
pub struct Outgoing {
    pub epoch: u64,
    pub msg: BgpMessage,
}

/// Sending side of a peer's outgoing queue. Unbounded; entries are tagged
/// with the epoch they were queued for.
#[derive(Debug, Clone)]
pub struct OutgoingQueue {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl OutgoingQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OutgoingQueue { tx }, rx)
    }

    pub fn send(&self, epoch: u64, msg: BgpMessage) -> Result<(), PeerError> {
        self.tx
            .send(Outgoing { epoch, msg })
            .map_err(|_| PeerError::Shutdown)
    }
}

/// Why a family's initial flush toward a peer is held back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferral {
    /// VPN routes wait for the peer's RT-constraint End-of-RIB.
    Rtc,
    /// We restarted: wait for the peer's End-of-RIB before advertising.
    Restart,
}

/// Our identity as seen by every target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalIdentity {
    pub asn: u32,
    pub router_id: Ipv4Addr,
    pub cluster_id: Ipv4Addr,
}

/// Capabilities we advertise to `config`.
pub fn local_capabilities(config: &PeerConfig, local_asn: u32) -> Vec<Capability> {
    let families = config.families();
    let mut caps: Vec<Capability> = families
        .iter()
        .map(|f| Capability::Multiprotocol(*f))
        .collect();
    caps.push(Capability::RouteRefresh);
    caps.push(Capability::FourOctetAs(local_asn));

    let add_path: Vec<_> = config
        .afi_safis
        .iter()
        .filter_map(|c| {
            AddPathMode::from_flags(c.add_path.receive, c.add_path.send).map(|m| (c.afi_safi, m))
        })
        .collect();
    if !add_path.is_empty() {
        caps.push(Capability::AddPath(add_path));
    }

    if let Some(gr) = &config.graceful_restart {
        caps.push(Capability::GracefulRestart(GracefulRestartCap {
            restart_time: gr.restart_time_secs,
            restarting: gr.restarting,
            families: families.iter().map(|f| (*f, gr.restarting)).collect(),
        }));
        let llgr: Vec<_> = config
            .afi_safis
            .iter()
            .filter_map(|c| {
                c.llgr_stale_time_secs.map(|stale_time| LlgrFamily {
                    family: c.afi_safi,
                    forwarding_preserved: false,
                    stale_time,
                })
            })
            .collect();
        if !llgr.is_empty() {
            caps.push(Capability::LongLivedGracefulRestart(llgr));
        }
    }
    caps
}

/// One neighbor as the server sees it. Everything here is owned by the
/// server loop; the session task only shares the counters.
pub struct Peer {
    pub config: PeerConfig,
    /// Created from a peer-group dynamic range; removed when it goes down.
    pub dynamic: bool,
    pub generation: u64,
    pub state: BgpState,
    pub epoch: u64,
    /// Last Established session, kept after it goes down.
    pub session: Option<SessionInfo>,
    pub last_reason: Option<StateReason>,
    pub admin: AdminState,
    pub rib_in: AdjRibIn,
    pub counters: Arc<MessageCounters>,
    pub vrf: Option<Vrf>,
    /// Families holding stale routes from a graceful restart.
    pub stale_families: BTreeSet<AfiSafi>,
    pub deferred: BTreeMap<AfiSafi, Deferral>,
    pub(crate) llgr_timers: HashMap<AfiSafi, JoinHandle<()>>,
    outgoing: OutgoingQueue,
    cmd_tx: mpsc::UnboundedSender<SessionCmd>,
    task: Option<JoinHandle<()>>,
}

impl Peer {
    /// Start the session task for `config`.
    pub fn spawn(
        config: PeerConfig,
        dynamic: bool,
        vrf: Option<Vrf>,
        generation: u64,
        global: &Config,
        deps: SessionDeps,
    ) -> Self {
        let (outgoing, out_rx) = OutgoingQueue::new();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(MessageCounters::default());
        let params = SessionParams::new(&config, global, generation);
        let admin = params.admin;
        let task = session::spawn(
            params,
            deps,
            SessionChannels {
                cmd_rx,
                out_rx,
                counters: Arc::clone(&counters),
            },
        );
        Peer {
            config,
            dynamic,
            generation,
            state: BgpState::Idle,
            epoch: 0,
            session: None,
            last_reason: None,
            admin,
            rib_in: AdjRibIn::new(),
            counters,
            vrf,
            stale_families: BTreeSet::new(),
            deferred: BTreeMap::new(),
            llgr_timers: HashMap::new(),
            outgoing,
            cmd_tx,
            task: Some(task),
        }
    }

    pub fn address(&self) -> IpAddr {
        self.config.address
    }

    pub fn is_established(&self) -> bool {
        self.state == BgpState::Established
    }

    /// Queue `msg` for the current Established session.
    pub fn send(&self, msg: BgpMessage) -> Result<(), PeerError> {
        if !self.is_established() {
            return Err(PeerError::Fsm(self.state));
        }
        self.outgoing.send(self.epoch, msg)
    }

    pub fn command(&self, cmd: SessionCmd) -> Result<(), PeerError> {
        self.cmd_tx.send(cmd).map_err(|_| PeerError::Shutdown)
    }

    pub fn negotiated_families(&self) -> Vec<AfiSafi> {
        self.session
            .as_ref()
            .filter(|_| self.is_established())
            .map(|s| s.negotiated.families.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Source stamped on paths learned over the current session.
    pub fn source(&self, local_asn: u32) -> Option<PathSource> {
        let session = self.session.as_ref()?;
        Some(PathSource::peer(
            self.config.address,
            session.remote_asn,
            session.remote_router_id,
            local_asn,
            self.config.route_reflector_client,
            self.config.route_server_client,
        ))
    }

    /// Snapshot of this peer as an export target. None unless Established.
    pub fn view(&self, local: &LocalIdentity) -> Option<PeerView> {
        if !self.is_established() {
            return None;
        }
        let session = self.session.as_ref()?;
        let caps = &session.negotiated;
        Some(PeerView {
            address: self.config.address,
            asn: session.remote_asn,
            router_id: session.remote_router_id,
            local_asn: local.asn,
            cluster_id: local.cluster_id,
            ibgp: session.remote_asn == local.asn,
            rs_client: self.config.route_server_client,
            rr_client: self.config.route_reflector_client,
            allow_own_as: self.config.allow_own_as,
            families: caps.families.clone(),
            llgr: caps.llgr.keys().copied().collect(),
            rtc: caps.has_family(AfiSafi::RTC),
            rt_interest: self.rib_in.rt_interest(),
            vrf: self.vrf.clone(),
            add_path_tx: caps.add_path_tx.clone(),
            local_addr: session.local_addr.ip(),
        })
    }

    /// Forget per-session state once the session is gone.
    pub fn session_down(&mut self) {
        self.deferred.clear();
        self.rib_in.reset_warnings();
    }

    pub fn cancel_llgr_timers(&mut self) {
        for (_, timer) in self.llgr_timers.drain() {
            timer.abort();
        }
    }

    /// Ask the session to close and exit. Returns the task to join.
    pub fn shutdown(&mut self, subcode: CeaseSubcode) -> Option<JoinHandle<()>> {
        self.cancel_llgr_timers();
        let _ = self.cmd_tx.send(SessionCmd::Shutdown(subcode));
        self.task.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AddPathConfig, AfiSafiConfig, GracefulRestartConfig};

    #[test]
    fn test_counters_snapshot() {
        let counters = MessageCounters::default();
        counters.record_sent(MessageType::Open);
        counters.record_sent(MessageType::Keepalive);
        counters.record_sent(MessageType::Keepalive);
        counters.record_received(MessageType::Update);
        counters.record_received(MessageType::RouteRefresh);

        let stats = counters.snapshot();
        assert_eq!(stats.open_sent, 1);
        assert_eq!(stats.keepalive_sent, 2);
        assert_eq!(stats.update_received, 1);
        assert_eq!(stats.route_refresh_received, 1);
        assert_eq!(stats.update_sent, 0);
    }

    #[test]
    fn test_local_capabilities() {
        let mut config = PeerConfig::new("10.0.0.2".parse().unwrap(), 65001);
        let mut vpn = AfiSafiConfig::new(AfiSafi::IPV4_VPN);
        vpn.add_path = AddPathConfig {
            receive: true,
            send: false,
        };
        vpn.llgr_stale_time_secs = Some(3600);
        config.afi_safis.push(vpn);

        let caps = local_capabilities(&config, 65000);
        assert!(caps.contains(&Capability::Multiprotocol(AfiSafi::IPV4_UNICAST)));
        assert!(caps.contains(&Capability::Multiprotocol(AfiSafi::IPV4_VPN)));
        assert!(caps.contains(&Capability::FourOctetAs(65000)));
        assert!(caps.contains(&Capability::AddPath(vec![(
            AfiSafi::IPV4_VPN,
            AddPathMode::Receive
        )])));
        // LLGR is only advertised together with graceful restart
        assert!(!caps
            .iter()
            .any(|c| matches!(c, Capability::LongLivedGracefulRestart(_))));

        config.graceful_restart = Some(GracefulRestartConfig::default());
        let caps = local_capabilities(&config, 65000);
        assert!(caps
            .iter()
            .any(|c| matches!(c, Capability::GracefulRestart(gr) if gr.families.len() == 2)));
        assert!(caps.contains(&Capability::LongLivedGracefulRestart(vec![LlgrFamily {
            family: AfiSafi::IPV4_VPN,
            forwarding_preserved: false,
            stale_time: 3600,
        }])));
    }

    #[test]
    fn test_outgoing_queue_tags_epoch() {
        let (queue, mut rx) = OutgoingQueue::new();
        queue.send(3, BgpMessage::Keepalive).unwrap();
        let out = rx.try_recv().unwrap();
        assert_eq!(out.epoch, 3);
        drop(rx);
        assert!(matches!(
            queue.send(4, BgpMessage::Keepalive),
            Err(PeerError::Shutdown)
        ));
    }
}
