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

use crate::bgp::attr::{
    as_path_len, is_route_target, leftmost_as, AsPathSegment, Origin, PathAttribute,
    UnknownAttr, LLGR_STALE,
};
use crate::bgp::family::AfiSafi;
use crate::bgp::nlri::Nlri;
use crate::rib::types::{PathSource, SourceKind};
use crate::rpki::RpkiVerdict;
use std::cmp::Ordering;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::time::Instant;

/// Path attributes shared by every NLRI of one UPDATE.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathAttrs {
    pub origin: Origin,
    pub as_path: Vec<AsPathSegment>,
    pub next_hop: IpAddr,
    pub med: Option<u32>,
    pub local_pref: Option<u32>,
    pub atomic_aggregate: bool,
    pub aggregator: Option<(u32, Ipv4Addr)>,
    pub communities: Vec<u32>,
    pub extended_communities: Vec<u64>,
    /// RFC 4456: route reflection loop prevention
    pub originator_id: Option<Ipv4Addr>,
    pub cluster_list: Vec<Ipv4Addr>,
    pub unknown: Vec<UnknownAttr>,
}

impl Default for PathAttrs {
    fn default() -> Self {
        PathAttrs {
            origin: Origin::Igp,
            as_path: Vec::new(),
            next_hop: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            med: None,
            local_pref: None,
            atomic_aggregate: false,
            aggregator: None,
            communities: Vec::new(),
            extended_communities: Vec::new(),
            originator_id: None,
            cluster_list: Vec::new(),
            unknown: Vec::new(),
        }
    }
}

impl PathAttrs {
    /// Collect attributes from an UPDATE. Reach/unreach carriers and
    /// NEXT_HOP are skipped; the next hop is passed in per NLRI family.
    pub fn from_update<'a>(
        attrs: impl Iterator<Item = &'a PathAttribute>,
        next_hop: IpAddr,
    ) -> Self {
        let mut out = PathAttrs {
            next_hop,
            ..Default::default()
        };
        for attr in attrs {
            match attr {
                PathAttribute::Origin(o) => out.origin = *o,
                PathAttribute::AsPath(p) => out.as_path = p.clone(),
                PathAttribute::MultiExitDisc(v) => out.med = Some(*v),
                PathAttribute::LocalPref(v) => out.local_pref = Some(*v),
                PathAttribute::AtomicAggregate => out.atomic_aggregate = true,
                PathAttribute::Aggregator { asn, address } => {
                    out.aggregator = Some((*asn, *address))
                }
                PathAttribute::Communities(c) => out.communities = c.clone(),
                PathAttribute::ExtendedCommunities(c) => out.extended_communities = c.clone(),
                PathAttribute::OriginatorId(id) => out.originator_id = Some(*id),
                PathAttribute::ClusterList(list) => out.cluster_list = list.clone(),
                PathAttribute::Unknown(u) => out.unknown.push(u.clone()),
                PathAttribute::NextHop(_)
                | PathAttribute::MpReachNlri(_)
                | PathAttribute::MpUnreachNlri(_) => {}
            }
        }
        out
    }

    /// Attributes to send, in type-code order, without NEXT_HOP or the
    /// multiprotocol carriers. Non-transitive unknown attributes are dropped.
    pub fn to_attributes(&self) -> Vec<PathAttribute> {
        let mut attrs = vec![
            PathAttribute::Origin(self.origin),
            PathAttribute::AsPath(self.as_path.clone()),
        ];
        if let Some(med) = self.med {
            attrs.push(PathAttribute::MultiExitDisc(med));
        }
        if let Some(lp) = self.local_pref {
            attrs.push(PathAttribute::LocalPref(lp));
        }
        if self.atomic_aggregate {
            attrs.push(PathAttribute::AtomicAggregate);
        }
        if let Some((asn, address)) = self.aggregator {
            attrs.push(PathAttribute::Aggregator { asn, address });
        }
        if !self.communities.is_empty() {
            attrs.push(PathAttribute::Communities(self.communities.clone()));
        }
        if let Some(id) = self.originator_id {
            attrs.push(PathAttribute::OriginatorId(id));
        }
        if !self.cluster_list.is_empty() {
            attrs.push(PathAttribute::ClusterList(self.cluster_list.clone()));
        }
        if !self.extended_communities.is_empty() {
            attrs.push(PathAttribute::ExtendedCommunities(
                self.extended_communities.clone(),
            ));
        }
        attrs.extend(
            self.unknown
                .iter()
                .filter(|u| u.is_transitive())
                .cloned()
                .map(PathAttribute::Unknown),
        );
        attrs.sort_by_key(|a| a.type_code());
        attrs
    }

    pub fn has_community(&self, community: u32) -> bool {
        self.communities.contains(&community)
    }

    pub fn route_targets(&self) -> impl Iterator<Item = u64> + '_ {
        self.extended_communities
            .iter()
            .copied()
            .filter(|ec| is_route_target(*ec))
    }
}

/// One path to a destination. Shared behind `Arc` and never mutated in
/// place; use [`Path::clone_with`].
#[derive(Debug, Clone)]
pub struct Path {
    pub nlri: Nlri,
    /// Path ID received from the peer (ADD-PATH)
    pub remote_path_id: Option<u32>,
    /// 0 = not allocated; set by the table manager
    pub local_path_id: u32,
    pub label: Option<u32>,
    pub attrs: Arc<PathAttrs>,
    pub source: PathSource,
    pub withdraw: bool,
    pub timestamp: Instant,
    pub validation: RpkiVerdict,
    pub as_looped: bool,
    pub stale: bool,
    pub igp_metric: u32,
}

impl Path {
    pub fn new(nlri: Nlri, attrs: Arc<PathAttrs>, source: PathSource) -> Self {
        Path {
            nlri,
            remote_path_id: None,
            local_path_id: 0,
            label: None,
            attrs,
            source,
            withdraw: false,
            timestamp: Instant::now(),
            validation: RpkiVerdict::NotFound,
            as_looped: false,
            stale: false,
            igp_metric: 0,
        }
    }

    pub fn new_withdraw(nlri: Nlri, remote_path_id: Option<u32>, source: PathSource) -> Self {
        Path {
            remote_path_id,
            withdraw: true,
            ..Path::new(nlri, Arc::new(PathAttrs::default()), source)
        }
    }

    pub fn family(&self) -> AfiSafi {
        self.nlri.afi_safi()
    }

    /// Withdraw for the same key, carrying no attributes.
    pub fn to_withdraw(&self) -> Arc<Path> {
        Arc::new(Path {
            attrs: Arc::new(PathAttrs::default()),
            withdraw: true,
            stale: false,
            timestamp: Instant::now(),
            ..self.clone()
        })
    }

    pub fn clone_with(&self, f: impl FnOnce(&mut Path)) -> Arc<Path> {
        let mut path = self.clone();
        f(&mut path);
        Arc::new(path)
    }

    /// Same source peer and same remote path ID (ADD-PATH identity).
    pub fn same_key(&self, other: &Path) -> bool {
        self.source.address == other.source.address && self.remote_path_id == other.remote_path_id
    }

    pub fn is_llgr_stale(&self) -> bool {
        self.attrs.has_community(LLGR_STALE)
    }

    fn tiebreak_router_id(&self) -> Ipv4Addr {
        self.attrs.originator_id.unwrap_or(self.source.router_id)
    }

    /// Compare paths for best path selection (RFC 4271 9.1.2.2, RFC 9494).
    /// Returns Ordering::Greater if self is better.
    pub fn best_path_cmp(&self, other: &Path) -> Ordering {
        // LLGR-stale paths lose to anything else
        other
            .is_llgr_stale()
            .cmp(&self.is_llgr_stale())
            .then_with(|| {
                self.attrs
                    .local_pref
                    .unwrap_or(100)
                    .cmp(&other.attrs.local_pref.unwrap_or(100))
            })
            .then_with(|| as_path_len(&other.attrs.as_path).cmp(&as_path_len(&self.attrs.as_path)))
            .then_with(|| other.attrs.origin.cmp(&self.attrs.origin))
            .then_with(|| {
                // MED only compares between paths from the same neighboring AS
                if leftmost_as(&self.attrs.as_path) == leftmost_as(&other.attrs.as_path) {
                    other
                        .attrs
                        .med
                        .unwrap_or(0)
                        .cmp(&self.attrs.med.unwrap_or(0))
                } else {
                    Ordering::Equal
                }
            })
            .then_with(|| kind_rank(other.source.kind).cmp(&kind_rank(self.source.kind)))
            .then_with(|| other.igp_metric.cmp(&self.igp_metric))
            // older wins
            .then_with(|| other.timestamp.cmp(&self.timestamp))
            .then_with(|| other.tiebreak_router_id().cmp(&self.tiebreak_router_id()))
            .then_with(|| other.source.address.cmp(&self.source.address))
            .then_with(|| other.remote_path_id.cmp(&self.remote_path_id))
    }
}

fn kind_rank(kind: SourceKind) -> u8 {
    match kind {
        SourceKind::Local => 0,
        SourceKind::Ebgp => 1,
        SourceKind::Ibgp => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::attr::{AsPathSegmentType, NO_LLGR};
    use std::time::Duration;

    fn peer_source(last: u8, asn: u32) -> PathSource {
        PathSource::peer(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)),
            asn,
            Ipv4Addr::new(1, 1, 1, last),
            65000,
            false,
            false,
        )
    }

    fn base(last: u8) -> Path {
        Path::new(
            Nlri::Unicast("10.0.0.0/24".parse().unwrap()),
            Arc::new(PathAttrs {
                as_path: vec![AsPathSegment::sequence(vec![65001])],
                next_hop: IpAddr::V4(Ipv4Addr::new(192, 0, 2, last)),
                ..Default::default()
            }),
            peer_source(last, 65001),
        )
    }

    fn with_attrs(path: &Path, f: impl FnOnce(&mut PathAttrs)) -> Path {
        let mut attrs = (*path.attrs).clone();
        f(&mut attrs);
        Path {
            attrs: Arc::new(attrs),
            ..path.clone()
        }
    }

    #[test]
    fn test_best_path_order() {
        let a = base(1);
        let b = Path {
            timestamp: a.timestamp,
            ..base(2)
        };
        let cases: Vec<(&str, Path, Path)> = vec![
            (
                "local pref",
                with_attrs(&b, |x| x.local_pref = Some(200)),
                a.clone(),
            ),
            (
                "as path length",
                b.clone(),
                with_attrs(&a, |x| x.as_path = vec![AsPathSegment::sequence(vec![65001, 2])]),
            ),
            (
                "as set counts once",
                with_attrs(&b, |x| {
                    x.as_path = vec![AsPathSegment {
                        segment_type: AsPathSegmentType::AsSet,
                        asn_list: vec![1, 2, 3],
                    }]
                }),
                with_attrs(&a, |x| x.as_path = vec![AsPathSegment::sequence(vec![1, 2])]),
            ),
            (
                "origin",
                b.clone(),
                with_attrs(&a, |x| x.origin = Origin::Incomplete),
            ),
            (
                "med same neighbor",
                with_attrs(&b, |x| x.med = Some(5)),
                with_attrs(&a, |x| x.med = Some(10)),
            ),
            (
                "llgr stale last",
                with_attrs(&b, |x| x.local_pref = Some(10)),
                with_attrs(&a, |x| {
                    x.local_pref = Some(500);
                    x.communities = vec![LLGR_STALE];
                }),
            ),
            (
                "ebgp over ibgp",
                b.clone(),
                Path {
                    source: peer_source(1, 65000),
                    ..a.clone()
                },
            ),
            (
                "igp metric",
                b.clone(),
                Path {
                    igp_metric: 10,
                    ..a.clone()
                },
            ),
            (
                "older",
                b.clone(),
                Path {
                    timestamp: a.timestamp + Duration::from_secs(1),
                    ..a.clone()
                },
            ),
            ("router id", a.clone(), b.clone()),
        ];
        for (name, better, worse) in cases {
            assert_eq!(better.best_path_cmp(&worse), Ordering::Greater, "{}", name);
            assert_eq!(worse.best_path_cmp(&better), Ordering::Less, "{}", name);
        }
    }

    #[test]
    fn test_med_ignored_across_neighbor_as() {
        let a = with_attrs(&base(1), |x| x.med = Some(100));
        let b = Path {
            timestamp: a.timestamp,
            ..with_attrs(&base(2), |x| {
                x.med = Some(1);
                x.as_path = vec![AsPathSegment::sequence(vec![65009])];
            })
        };
        // falls through to router id, where 1.1.1.1 wins
        assert_eq!(a.best_path_cmp(&b), Ordering::Greater);
    }

    #[test]
    fn test_originator_id_used_for_tiebreak() {
        let a = with_attrs(&base(1), |x| x.originator_id = Some(Ipv4Addr::new(9, 9, 9, 9)));
        let b = Path {
            timestamp: a.timestamp,
            ..base(2)
        };
        assert_eq!(b.best_path_cmp(&a), Ordering::Greater);
    }

    #[test]
    fn test_withdraw_has_no_attributes() {
        let path = base(1);
        let withdraw = path.to_withdraw();
        assert!(withdraw.withdraw);
        assert!(withdraw.same_key(&path));
        assert_eq!(*withdraw.attrs, PathAttrs::default());
        assert!(withdraw.attrs.as_path.is_empty());
    }

    #[test]
    fn test_to_attributes_sorted_and_filtered() {
        let attrs = PathAttrs {
            med: Some(1),
            communities: vec![NO_LLGR],
            unknown: vec![
                UnknownAttr {
                    flags: 0xC0,
                    type_code: 99,
                    value: vec![1],
                },
                UnknownAttr {
                    flags: 0x80,
                    type_code: 98,
                    value: vec![1],
                },
            ],
            ..Default::default()
        };
        let codes: Vec<u8> = attrs.to_attributes().iter().map(|a| a.type_code()).collect();
        assert_eq!(codes, vec![1, 2, 4, 8, 99]);
    }
}
