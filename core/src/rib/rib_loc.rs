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

use crate::bgp::attr::{LLGR_STALE, NO_LLGR};
use crate::bgp::family::AfiSafi;
use crate::bgp::nlri::Nlri;
use crate::log::debug;
use crate::rib::path_id::PathIdPool;
use crate::rib::{Path, PathAttrs, PathSource, SourceKind, TableId};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

/// Result of one table update for one destination.
#[derive(Debug, Clone)]
pub struct RouteChange {
    pub table: TableId,
    pub nlri: Nlri,
    pub old_best: Option<Arc<Path>>,
    pub new_best: Option<Arc<Path>>,
    /// Full path lists, best first, for ADD-PATH targets.
    pub old_paths: Vec<Arc<Path>>,
    pub new_paths: Vec<Arc<Path>>,
}

impl RouteChange {
    pub fn best_changed(&self) -> bool {
        match (&self.old_best, &self.new_best) {
            (Some(old), Some(new)) => !Arc::ptr_eq(old, new),
            (None, None) => false,
            _ => true,
        }
    }
}

/// All known paths to one NLRI, per table, sorted best first.
#[derive(Debug, Clone)]
pub struct Destination {
    pub nlri: Nlri,
    tables: HashMap<TableId, Vec<Arc<Path>>>,
    path_ids: PathIdPool,
}

impl Destination {
    fn new(nlri: Nlri) -> Self {
        Destination {
            nlri,
            tables: HashMap::new(),
            path_ids: PathIdPool::default(),
        }
    }

    pub fn paths(&self, table: TableId) -> &[Arc<Path>] {
        self.tables.get(&table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn best(&self, table: TableId) -> Option<&Arc<Path>> {
        self.paths(table).first()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    fn apply(&mut self, table: TableId, path: Arc<Path>) -> Option<RouteChange> {
        let old_paths = self.paths(table).to_vec();
        let existing = old_paths.iter().position(|p| p.same_key(&path));

        let mut new_paths = old_paths.clone();
        if path.withdraw {
            // re-withdraw of an unknown key is a no-op
            let idx = existing?;
            let removed = new_paths.remove(idx);
            self.path_ids.release(removed.local_path_id);
        } else {
            match existing {
                Some(idx) if same_route(&new_paths[idx], &path) => return None,
                Some(idx) => {
                    let local_id = new_paths[idx].local_path_id;
                    new_paths[idx] = path.clone_with(|p| p.local_path_id = local_id);
                }
                None => {
                    let local_id = self.path_ids.alloc();
                    new_paths.push(path.clone_with(|p| p.local_path_id = local_id));
                }
            }
            new_paths.sort_by(|a, b| b.best_path_cmp(a));
        }

        if new_paths.is_empty() {
            self.tables.remove(&table);
        } else {
            self.tables.insert(table, new_paths.clone());
        }
        Some(RouteChange {
            table,
            nlri: self.nlri,
            old_best: old_paths.first().cloned(),
            new_best: new_paths.first().cloned(),
            old_paths,
            new_paths,
        })
    }
}

/// Same advertisement content; replacing one with the other changes nothing.
fn same_route(a: &Path, b: &Path) -> bool {
    (Arc::ptr_eq(&a.attrs, &b.attrs) || a.attrs == b.attrs)
        && a.label == b.label
        && a.stale == b.stale
        && a.validation == b.validation
}

/// How to rewrite one path during a per-peer sweep.
enum Rewrite {
    Keep,
    Replace(Arc<Path>),
    Remove,
}

/// Per-family tables of destinations. Owned by the server; every read and
/// write happens on its loop.
pub struct TableManager {
    asn: u32,
    router_id: Ipv4Addr,
    tables: HashMap<AfiSafi, HashMap<Nlri, Destination>>,
}

impl TableManager {
    pub fn new(asn: u32, router_id: Ipv4Addr) -> Self {
        TableManager {
            asn,
            router_id,
            tables: HashMap::new(),
        }
    }

    /// Apply one path (or withdraw) to one table. Returns the change when the
    /// destination's path set changed.
    pub fn update(&mut self, table: TableId, path: Arc<Path>) -> Option<RouteChange> {
        let path = self.fix_source(path);
        let family = path.family();
        let nlri = path.nlri;

        let destinations = self.tables.entry(family).or_default();
        if path.withdraw && !destinations.contains_key(&nlri) {
            return None;
        }
        let dest = destinations
            .entry(nlri)
            .or_insert_with(|| Destination::new(nlri));
        let change = dest.apply(table, path);
        if dest.is_empty() {
            destinations.remove(&nlri);
        }
        change
    }

    /// Local paths are accepted without an identity and take the server's.
    fn fix_source(&self, path: Arc<Path>) -> Arc<Path> {
        if !path.source.is_unset() {
            return path;
        }
        let source = PathSource {
            kind: SourceKind::Local,
            address: IpAddr::V4(self.router_id),
            asn: self.asn,
            router_id: self.router_id,
            rr_client: false,
            rs_client: false,
        };
        path.clone_with(|p| p.source = source)
    }

    pub fn destination(&self, family: AfiSafi, nlri: &Nlri) -> Option<&Destination> {
        self.tables.get(&family).and_then(|t| t.get(nlri))
    }

    pub fn destinations(&self, family: AfiSafi) -> impl Iterator<Item = &Destination> {
        self.tables.get(&family).into_iter().flat_map(|t| t.values())
    }

    pub fn families(&self) -> Vec<AfiSafi> {
        let mut families: Vec<_> = self
            .tables
            .iter()
            .filter(|(_, t)| !t.is_empty())
            .map(|(f, _)| *f)
            .collect();
        families.sort();
        families
    }

    pub fn get_best_path_list(&self, table: TableId, family: AfiSafi) -> Vec<Arc<Path>> {
        self.destinations(family)
            .filter_map(|d| d.best(table).cloned())
            .collect()
    }

    pub fn get_path_list(&self, table: TableId, family: AfiSafi) -> Vec<Arc<Path>> {
        self.destinations(family)
            .flat_map(|d| d.paths(table).iter().cloned())
            .collect()
    }

    /// Paths learned from `peer`, across all tables, one per key.
    pub fn get_path_list_by_peer(&self, peer: IpAddr, family: AfiSafi) -> Vec<Arc<Path>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for dest in self.destinations(family) {
            for paths in dest.tables.values() {
                for path in paths.iter().filter(|p| p.source.address == peer) {
                    if seen.insert((path.nlri, path.remote_path_id)) {
                        out.push(Arc::clone(path));
                    }
                }
            }
        }
        out
    }

    pub fn count(&self, table: TableId, family: AfiSafi) -> usize {
        self.destinations(family)
            .filter(|d| !d.paths(table).is_empty())
            .count()
    }

    /// Flag every path from `peer` in `family` as stale. Idempotent.
    pub fn mark_stale(&mut self, peer: IpAddr, family: AfiSafi) -> usize {
        let mut marked = 0;
        self.rewrite_peer_paths(peer, family, |path| {
            marked += 1;
            if path.stale {
                Rewrite::Keep
            } else {
                Rewrite::Replace(path.clone_with(|p| p.stale = true))
            }
        });
        debug!(%peer, %family, marked, "marked paths stale");
        marked
    }

    pub fn stale_paths(&self, peer: IpAddr, family: AfiSafi) -> Vec<Arc<Path>> {
        self.get_path_list_by_peer(peer, family)
            .into_iter()
            .filter(|p| p.stale)
            .collect()
    }

    /// Remove the still-stale paths from `peer`.
    pub fn clear_stale(&mut self, peer: IpAddr, family: AfiSafi) -> Vec<RouteChange> {
        self.rewrite_peer_paths(peer, family, |path| {
            if path.stale {
                Rewrite::Remove
            } else {
                Rewrite::Keep
            }
        })
    }

    /// Remove every path from `peer` in `family`.
    pub fn drop_peer(&mut self, peer: IpAddr, family: AfiSafi) -> Vec<RouteChange> {
        self.rewrite_peer_paths(peer, family, |_| Rewrite::Remove)
    }

    /// Long-lived stale phase (RFC 9494): stale paths get LLGR_STALE, and
    /// those carrying NO_LLGR are removed.
    pub fn enter_llgr(&mut self, peer: IpAddr, family: AfiSafi) -> Vec<RouteChange> {
        self.rewrite_peer_paths(peer, family, |path| {
            if !path.stale || path.is_llgr_stale() {
                return Rewrite::Keep;
            }
            if path.attrs.has_community(NO_LLGR) {
                return Rewrite::Remove;
            }
            let mut attrs: PathAttrs = (*path.attrs).clone();
            attrs.communities.push(LLGR_STALE);
            Rewrite::Replace(path.clone_with(|p| p.attrs = Arc::new(attrs)))
        })
    }

    /// Drop a route-server client's private table from every destination.
    pub fn drop_table(&mut self, table: TableId) {
        for destinations in self.tables.values_mut() {
            for dest in destinations.values_mut() {
                if let Some(paths) = dest.tables.remove(&table) {
                    for path in paths {
                        dest.path_ids.release(path.local_path_id);
                    }
                }
            }
            destinations.retain(|_, d| !d.is_empty());
        }
    }

    fn rewrite_peer_paths(
        &mut self,
        peer: IpAddr,
        family: AfiSafi,
        mut f: impl FnMut(&Arc<Path>) -> Rewrite,
    ) -> Vec<RouteChange> {
        let Some(destinations) = self.tables.get_mut(&family) else {
            return Vec::new();
        };
        let mut changes = Vec::new();
        for dest in destinations.values_mut() {
            let mut table_ids: Vec<TableId> = dest.tables.keys().copied().collect();
            table_ids.sort();
            for table in table_ids {
                let edits: Vec<Arc<Path>> = dest
                    .paths(table)
                    .iter()
                    .filter(|p| p.source.address == peer)
                    .filter_map(|p| match f(p) {
                        Rewrite::Keep => None,
                        Rewrite::Replace(new) => Some(new),
                        Rewrite::Remove => Some(p.to_withdraw()),
                    })
                    .collect();
                for edit in edits {
                    changes.extend(dest.apply(table, edit));
                }
            }
        }
        destinations.retain(|_, d| !d.is_empty());
        changes
    }
}
