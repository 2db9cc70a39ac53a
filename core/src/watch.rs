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

//! Event subscriptions.
//!
//! A subscriber gets an ordered, unbounded queue of the event kinds it asked
//! for. The server loop is the only producer, so events arrive in the order
//! the RIB changed.

use crate::bgp::msg::UpdateMessage;
use crate::peer::fsm::BgpState;
use crate::rib::{Path, TableId};
use crate::server::ServerError;
use crate::server_ops::ServerHandle;
use crate::types::StateReason;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Event kinds a subscriber wants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchOptions {
    pub best_path: bool,
    /// Paths as received, before import policy.
    pub pre_policy: bool,
    /// Paths as installed, after import policy.
    pub post_policy: bool,
    pub peer_state: bool,
    /// Send a table snapshot right after subscribing.
    pub initial_table: bool,
    pub raw_message: bool,
}

impl WatchOptions {
    pub fn all() -> Self {
        WatchOptions {
            best_path: true,
            pre_policy: true,
            post_policy: true,
            peer_state: true,
            initial_table: true,
            raw_message: true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// Best path of `table` changed. Withdraws carry the previous best with
    /// `withdraw` set.
    BestPath { table: TableId, paths: Vec<Arc<Path>> },
    PrePolicyUpdate { peer: IpAddr, paths: Vec<Arc<Path>> },
    PostPolicyUpdate {
        peer: IpAddr,
        table: TableId,
        paths: Vec<Arc<Path>>,
    },
    PeerState {
        peer: IpAddr,
        old: BgpState,
        new: BgpState,
        reason: StateReason,
    },
    /// Current best paths of every table and the state of every peer.
    Table {
        paths: Vec<(TableId, Arc<Path>)>,
        peers: Vec<(IpAddr, BgpState)>,
    },
    RawMessage { peer: IpAddr, update: UpdateMessage },
}

impl WatchEvent {
    fn wanted_by(&self, opts: &WatchOptions) -> bool {
        match self {
            WatchEvent::BestPath { .. } => opts.best_path,
            WatchEvent::PrePolicyUpdate { .. } => opts.pre_policy,
            WatchEvent::PostPolicyUpdate { .. } => opts.post_policy,
            WatchEvent::PeerState { .. } => opts.peer_state,
            // Snapshots are only sent on request.
            WatchEvent::Table { .. } => true,
            WatchEvent::RawMessage { .. } => opts.raw_message,
        }
    }
}

struct Subscriber {
    opts: WatchOptions,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

/// Server-side registry of subscribers.
#[derive(Default)]
pub(crate) struct WatcherSet {
    next_id: u64,
    subscribers: HashMap<u64, Subscriber>,
}

impl WatcherSet {
    pub fn add(&mut self, opts: WatchOptions) -> (u64, mpsc::UnboundedReceiver<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.next_id += 1;
        self.subscribers.insert(self.next_id, Subscriber { opts, tx });
        (self.next_id, rx)
    }

    pub fn remove(&mut self, id: u64) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.subscribers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// True if any subscriber would receive an event built by `wanted`.
    /// Lets callers skip building events nobody reads.
    pub fn wants(&self, wanted: impl Fn(&WatchOptions) -> bool) -> bool {
        self.subscribers.values().any(|s| wanted(&s.opts))
    }

    /// Deliver `event` to every subscriber that asked for its kind.
    /// Subscribers whose receiver is gone are dropped.
    pub fn emit(&mut self, event: WatchEvent) {
        self.subscribers.retain(|_, s| {
            if !event.wanted_by(&s.opts) {
                return true;
            }
            s.tx.send(event.clone()).is_ok()
        });
    }

    pub fn send_to(&mut self, id: u64, event: WatchEvent) {
        let closed = match self.subscribers.get(&id) {
            Some(s) => s.tx.send(event).is_err(),
            None => false,
        };
        if closed {
            self.subscribers.remove(&id);
        }
    }
}

/// Client end of a subscription.
pub struct Watcher {
    id: u64,
    rx: mpsc::UnboundedReceiver<WatchEvent>,
    handle: ServerHandle,
}

impl Watcher {
    pub(crate) fn new(id: u64, rx: mpsc::UnboundedReceiver<WatchEvent>, handle: ServerHandle) -> Self {
        Watcher { id, rx, handle }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event. None once the server has stopped.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WatchEvent> {
        self.rx.try_recv().ok()
    }

    /// Ask the server to enqueue a snapshot of the current table and peer
    /// states behind any events already queued.
    pub async fn replay(&self) -> Result<(), ServerError> {
        self.handle.replay(self.id).await
    }

    pub async fn unsubscribe(self) -> Result<(), ServerError> {
        self.handle.unwatch(self.id).await
    }
}
