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

use crate::bgp::family::AfiSafi;
use crate::bgp::nlri::Nlri;
use crate::rib::Path;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

type PathKey = (Nlri, Option<u32>);

/// Adj-RIB-In: routes received from one peer, before import policy.
///
/// Keyed per family by (NLRI, received path ID). Owned by the server-side
/// `Peer`; the session tasks never touch it.
#[derive(Debug, Default)]
pub struct AdjRibIn {
    tables: BTreeMap<AfiSafi, HashMap<PathKey, Arc<Path>>>,
    // families whose prefix-limit warning already fired this session
    warned: HashSet<AfiSafi>,
}

/// Route targets a peer asked for over RT-constraint (RFC 4684).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtInterest {
    /// Peer sent the default route target: send everything.
    pub default: bool,
    pub targets: HashSet<u64>,
}

impl RtInterest {
    pub fn allows(&self, path: &Path) -> bool {
        self.default || path.attrs.route_targets().any(|rt| self.targets.contains(&rt))
    }
}

impl AdjRibIn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or remove one path. Returns the entry it replaced or removed.
    pub fn update(&mut self, path: Arc<Path>) -> Option<Arc<Path>> {
        let key = (path.nlri, path.remote_path_id);
        let table = self.tables.entry(path.family()).or_default();
        if path.withdraw {
            table.remove(&key)
        } else {
            table.insert(key, path)
        }
    }

    pub fn get(&self, nlri: &Nlri, path_id: Option<u32>) -> Option<&Arc<Path>> {
        self.tables
            .get(&nlri.afi_safi())
            .and_then(|t| t.get(&(*nlri, path_id)))
    }

    pub fn paths(&self, family: AfiSafi) -> Vec<Arc<Path>> {
        self.tables
            .get(&family)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_paths(&self) -> Vec<Arc<Path>> {
        self.tables
            .values()
            .flat_map(|t| t.values().cloned())
            .collect()
    }

    pub fn families(&self) -> Vec<AfiSafi> {
        self.tables.keys().copied().collect()
    }

    pub fn count(&self, family: AfiSafi) -> usize {
        self.tables.get(&family).map_or(0, HashMap::len)
    }

    pub fn total(&self) -> usize {
        self.tables.values().map(HashMap::len).sum()
    }

    pub fn mark_stale(&mut self, family: AfiSafi) -> usize {
        let Some(table) = self.tables.get_mut(&family) else {
            return 0;
        };
        for path in table.values_mut() {
            if !path.stale {
                *path = path.clone_with(|p| p.stale = true);
            }
        }
        table.len()
    }

    /// Remove and return every entry still flagged stale.
    pub fn take_stale(&mut self, family: AfiSafi) -> Vec<Arc<Path>> {
        let Some(table) = self.tables.get_mut(&family) else {
            return Vec::new();
        };
        let stale: Vec<PathKey> = table
            .iter()
            .filter(|(_, p)| p.stale)
            .map(|(k, _)| *k)
            .collect();
        stale.iter().filter_map(|k| table.remove(k)).collect()
    }

    pub fn clear_family(&mut self, family: AfiSafi) -> Vec<Arc<Path>> {
        self.warned.remove(&family);
        self.tables
            .remove(&family)
            .map(|t| t.into_values().collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.tables.clear();
        self.warned.clear();
    }

    /// Latch the prefix-limit warning for `family`. True the first time.
    pub fn latch_warning(&mut self, family: AfiSafi) -> bool {
        self.warned.insert(family)
    }

    pub fn reset_warnings(&mut self) {
        self.warned.clear();
    }

    pub fn rt_interest(&self) -> RtInterest {
        let mut interest = RtInterest::default();
        for path in self.tables.get(&AfiSafi::RTC).into_iter().flat_map(|t| t.values()) {
            match path.nlri {
                Nlri::RouteTarget {
                    route_target: None, ..
                } => interest.default = true,
                Nlri::RouteTarget {
                    route_target: Some(rt),
                    ..
                } => {
                    interest.targets.insert(rt);
                }
                _ => {}
            }
        }
        interest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;

    #[test]
    fn test_update_and_withdraw() {
        let mut rib_in = AdjRibIn::new();
        let path = create_test_path("10.0.0.1", "10.1.0.0/24");

        assert!(rib_in.update(Arc::clone(&path)).is_none());
        assert_eq!(rib_in.count(AfiSafi::IPV4_UNICAST), 1);
        assert!(rib_in.get(&path.nlri, None).is_some());

        let removed = rib_in.update(path.to_withdraw());
        assert!(removed.is_some());
        assert_eq!(rib_in.count(AfiSafi::IPV4_UNICAST), 0);
        assert!(rib_in.update(path.to_withdraw()).is_none());
    }

    #[test]
    fn test_path_ids_are_separate_keys() {
        let mut rib_in = AdjRibIn::new();
        for id in [1, 2, 2] {
            rib_in.update(create_test_path_with("10.0.0.1", "10.1.0.0/24", |p| {
                p.remote_path_id = Some(id)
            }));
        }
        assert_eq!(rib_in.count(AfiSafi::IPV4_UNICAST), 2);
        assert_eq!(rib_in.total(), 2);
    }

    #[test]
    fn test_stale_cycle() {
        let mut rib_in = AdjRibIn::new();
        let p1 = create_test_path("10.0.0.1", "10.1.0.0/24");
        let p2 = create_test_path("10.0.0.1", "10.2.0.0/24");
        rib_in.update(Arc::clone(&p1));
        rib_in.update(Arc::clone(&p2));

        assert_eq!(rib_in.mark_stale(AfiSafi::IPV4_UNICAST), 2);
        assert_eq!(rib_in.mark_stale(AfiSafi::IPV4_UNICAST), 2);
        assert_eq!(rib_in.mark_stale(AfiSafi::IPV6_UNICAST), 0);

        // refreshed entry is no longer stale
        rib_in.update(p1);
        let taken = rib_in.take_stale(AfiSafi::IPV4_UNICAST);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].nlri, p2.nlri);
        assert!(rib_in.take_stale(AfiSafi::IPV4_UNICAST).is_empty());
        assert_eq!(rib_in.count(AfiSafi::IPV4_UNICAST), 1);
    }

    #[test]
    fn test_warning_latch() {
        let mut rib_in = AdjRibIn::new();
        assert!(rib_in.latch_warning(AfiSafi::IPV4_UNICAST));
        assert!(!rib_in.latch_warning(AfiSafi::IPV4_UNICAST));
        rib_in.reset_warnings();
        assert!(rib_in.latch_warning(AfiSafi::IPV4_UNICAST));
    }

    #[test]
    fn test_rt_interest() {
        let rt = |route_target| {
            Arc::new(Path::new(
                Nlri::RouteTarget {
                    origin_as: 65001,
                    route_target,
                },
                test_attrs(vec![65001], "192.0.2.1"),
                test_source("10.0.0.1", 65001),
            ))
        };
        let tests = [
            ("empty", vec![], RtInterest::default()),
            (
                "specific",
                vec![Some(7), Some(8)],
                RtInterest {
                    default: false,
                    targets: [7, 8].into_iter().collect(),
                },
            ),
            (
                "default",
                vec![None],
                RtInterest {
                    default: true,
                    targets: HashSet::new(),
                },
            ),
        ];
        for (name, targets, expected) in tests {
            let mut rib_in = AdjRibIn::new();
            for target in targets {
                rib_in.update(rt(target));
            }
            assert_eq!(rib_in.rt_interest(), expected, "{}", name);
        }
    }
}
