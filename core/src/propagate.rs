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

//! Route propagation: import into the tables, then export of every table
//! change to the Established peers that may see it.

use crate::bgp::codec::CodecContext;
use crate::bgp::family::AfiSafi;
use crate::bgp::msg::{BgpMessage, UpdateMessage};
use crate::log::debug;
use crate::peer::filterpath;
use crate::peer::filter::PeerView;
use crate::peer::outgoing::{build_updates, export_rewrite, should_filter_by_community};
use crate::policy::PolicyDirection;
use crate::rib::{Path, RouteChange, TableId};
use crate::server::BgpServer;
use crate::watch::WatchEvent;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

impl BgpServer {
    /// Install `paths` (withdraws included) learned from `source`, or
    /// originated locally when `source` is None, and export the result.
    ///
    /// Paths from a route-server client go into the private table of every
    /// other client, each through that client's import policy. Everything
    /// else goes through the source's import policy into the global table.
    pub(crate) fn propagate_update(&mut self, source: Option<IpAddr>, paths: Vec<Arc<Path>>) {
        if paths.is_empty() {
            return;
        }
        if let Some(peer) = source {
            if self.watchers.wants(|o| o.pre_policy) {
                self.watchers.emit(WatchEvent::PrePolicyUpdate {
                    peer,
                    paths: paths.clone(),
                });
            }
        }

        let source_peer = source.and_then(|addr| self.peers.get(&addr));
        let rs_source = source_peer.is_some_and(|p| p.config.route_server_client);
        let mut changes = Vec::new();
        if rs_source {
            let targets: Vec<(IpAddr, Vec<String>)> = self
                .peers
                .values()
                .filter(|p| p.config.route_server_client && Some(p.address()) != source)
                .map(|p| (p.address(), p.config.import_policy.clone()))
                .collect();
            for (target, policy) in targets {
                let accepted = self.apply_import(&policy, &paths);
                self.install(source, TableId::RsClient(target), accepted, &mut changes);
            }
        } else {
            let policy = source_peer
                .map(|p| p.config.import_policy.clone())
                .unwrap_or_default();
            let accepted = self.apply_import(&policy, &paths);
            self.install(source, TableId::Global, accepted, &mut changes);
        }
        self.publish(changes);
    }

    /// Rejected paths become withdraws so a previously accepted version of
    /// the same key leaves the table.
    fn apply_import(&self, policy: &[String], paths: &[Arc<Path>]) -> Vec<Arc<Path>> {
        paths
            .iter()
            .map(|path| {
                self.policies
                    .apply(PolicyDirection::Import, policy, path)
                    .unwrap_or_else(|| path.to_withdraw())
            })
            .collect()
    }

    fn install(
        &mut self,
        source: Option<IpAddr>,
        table: TableId,
        paths: Vec<Arc<Path>>,
        changes: &mut Vec<RouteChange>,
    ) {
        if let Some(peer) = source {
            if self.watchers.wants(|o| o.post_policy) {
                self.watchers.emit(WatchEvent::PostPolicyUpdate {
                    peer,
                    table,
                    paths: paths.clone(),
                });
            }
        }
        for path in paths {
            changes.extend(self.rib.update(table, path));
        }
    }

    /// Report table changes to subscribers and export them.
    pub(crate) fn publish(&mut self, changes: Vec<RouteChange>) {
        if changes.is_empty() {
            return;
        }
        if self.watchers.wants(|o| o.best_path) {
            let mut by_table: BTreeMap<TableId, Vec<Arc<Path>>> = BTreeMap::new();
            for change in changes.iter().filter(|c| c.best_changed()) {
                if let Some(best) = best_or_withdraw(change) {
                    by_table.entry(change.table).or_default().push(best);
                }
            }
            for (table, paths) in by_table {
                self.watchers.emit(WatchEvent::BestPath { table, paths });
            }
        }
        self.propagate_update_to_neighbors(&changes);
    }

    /// Export each change to the Established targets that read its table:
    /// the global table feeds non-clients, a client's private table feeds
    /// only that client.
    pub(crate) fn propagate_update_to_neighbors(&self, changes: &[RouteChange]) {
        let targets: Vec<(PeerView, &[String])> = self
            .peers
            .values()
            .filter_map(|p| {
                p.view(&self.local)
                    .map(|view| (view, p.config.export_policy.as_slice()))
            })
            .collect();
        if targets.is_empty() {
            return;
        }

        let mut outgoing: HashMap<IpAddr, Vec<Arc<Path>>> = HashMap::new();
        for change in changes {
            let rs_table = match change.table {
                TableId::Global => None,
                TableId::RsClient(addr) => Some(addr),
            };
            for (view, export) in &targets {
                if view.rs_client != rs_table.is_some() {
                    continue;
                }
                if rs_table.is_some_and(|addr| addr != view.address) {
                    continue;
                }
                let out = outgoing.entry(view.address).or_default();
                if view.add_path(change.nlri.afi_safi()) {
                    self.add_path_updates(view, export, change, out);
                } else if change.best_changed() {
                    if let Some(best) = best_or_withdraw(change) {
                        out.extend(self.export_to(view, export, &best, change.old_best.as_ref()));
                    }
                }
            }
        }
        for (addr, paths) in outgoing {
            self.send_paths(addr, &paths);
        }
    }

    /// RFC 7911: every path of the destination is advertised under its own
    /// path id, so diff the old and new path sets by id.
    fn add_path_updates(
        &self,
        view: &PeerView,
        export: &[String],
        change: &RouteChange,
        out: &mut Vec<Arc<Path>>,
    ) {
        let new_ids: HashSet<u32> = change.new_paths.iter().map(|p| p.local_path_id).collect();
        for old in change
            .old_paths
            .iter()
            .filter(|p| !new_ids.contains(&p.local_path_id))
        {
            out.extend(self.export_to(view, export, &old.to_withdraw(), Some(old)));
        }
        for new in &change.new_paths {
            let prev = change
                .old_paths
                .iter()
                .find(|p| p.local_path_id == new.local_path_id);
            if prev.is_some_and(|p| Arc::ptr_eq(p, new)) {
                continue;
            }
            out.extend(self.export_to(view, export, new, prev));
        }
    }

    /// What `view` is sent for `path`, given `old` was the previous
    /// candidate: `filterpath`, then community scoping, export policy and
    /// attribute rewrite. A path rejected after `filterpath` withdraws
    /// `old` instead.
    pub(crate) fn export_to(
        &self,
        view: &PeerView,
        export: &[String],
        path: &Arc<Path>,
        old: Option<&Arc<Path>>,
    ) -> Option<Arc<Path>> {
        let filtered = filterpath(view, path, old)?;
        if filtered.withdraw {
            return Some(filtered);
        }
        let exported = if should_filter_by_community(&filtered.attrs, view) {
            None
        } else {
            self.policies
                .apply(PolicyDirection::Export, export, &filtered)
                .and_then(|p| export_rewrite(view, &p))
        };
        exported.or_else(|| {
            old.and_then(|o| filterpath(view, o, None))
                .map(|o| o.to_withdraw())
        })
    }

    /// Send `addr` everything it should hold for `family`, then End-of-RIB
    /// when graceful restart was negotiated and `eor` is set.
    pub(crate) fn flush_family(&self, addr: IpAddr, family: AfiSafi, eor: bool) {
        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        let Some(view) = peer.view(&self.local) else {
            return;
        };
        let table = if view.rs_client {
            TableId::RsClient(addr)
        } else {
            TableId::Global
        };
        // VRF targets are fed from the VPN table
        let source_family = if view.vrf.is_some() && !family.is_vpn() {
            family.vpn_counterpart()
        } else {
            Some(family)
        };
        let paths = match source_family {
            Some(f) if view.add_path(f) => self.rib.get_path_list(table, f),
            Some(f) => self.rib.get_best_path_list(table, f),
            None => Vec::new(),
        };
        let out: Vec<Arc<Path>> = paths
            .iter()
            .filter_map(|p| self.export_to(&view, &peer.config.export_policy, p, None))
            .filter(|p| !p.withdraw)
            .collect();
        debug!(peer_ip = %addr, %family, %table, paths = out.len(), "flushing family");
        self.send_paths(addr, &out);

        let gr = peer
            .session
            .as_ref()
            .is_some_and(|s| s.negotiated.graceful_restart.is_some());
        if eor && gr {
            if let Err(e) = peer.send(BgpMessage::Update(UpdateMessage::end_of_rib(family))) {
                debug!(peer_ip = %addr, error = %e, "end-of-rib not sent");
            }
        }
    }

    /// The target's route-target interest changed: resend its VPN families.
    pub(crate) fn resend_vpn(&self, addr: IpAddr) {
        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        let families: Vec<AfiSafi> = peer
            .negotiated_families()
            .into_iter()
            .filter(|f| f.is_vpn() && !peer.deferred.contains_key(f))
            .collect();
        for family in families {
            self.flush_family(addr, family, false);
        }
    }

    fn send_paths(&self, addr: IpAddr, paths: &[Arc<Path>]) {
        if paths.is_empty() {
            return;
        }
        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        let Some(session) = &peer.session else {
            return;
        };
        let ctx = CodecContext::from_negotiated(&session.negotiated);
        for update in build_updates(self.deps.codec.as_ref(), &ctx, paths) {
            if let Err(e) = peer.send(BgpMessage::Update(update)) {
                debug!(peer_ip = %addr, error = %e, "updates dropped");
                return;
            }
        }
    }
}

/// The new best path, or a withdraw of the old one.
fn best_or_withdraw(change: &RouteChange) -> Option<Arc<Path>> {
    match (&change.new_best, &change.old_best) {
        (Some(new), _) => Some(Arc::clone(new)),
        (None, Some(old)) => Some(old.to_withdraw()),
        (None, None) => None,
    }
}
