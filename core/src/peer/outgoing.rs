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

//! Export rewrite and UPDATE building for one target.

use crate::bgp::attr::{
    is_transitive, AsPathSegment, AsPathSegmentType, MpReach, MpUnreach, PathAttribute,
    NO_ADVERTISE, NO_EXPORT, NO_EXPORT_SUBCONFED,
};
use crate::bgp::codec::{Codec, CodecContext};
use crate::bgp::family::AfiSafi;
use crate::bgp::msg::{BgpMessage, UpdateMessage, MAX_MESSAGE_SIZE};
use crate::bgp::nlri::{encode_nlri, NlriEntry};
use crate::log::warn;
use crate::peer::PeerView;
use crate::rib::{Path, PathAttrs};
use std::collections::BTreeMap;
use std::mem;
use std::net::IpAddr;
use std::sync::Arc;

/// Room kept for attribute length fields switching to extended length.
const SIZE_SLACK: usize = 2;

/// Check if a route should be filtered based on well-known communities
/// RFC 1997 Section 3: Well-known communities
pub fn should_filter_by_community(attrs: &PathAttrs, view: &PeerView) -> bool {
    if attrs.has_community(NO_ADVERTISE) {
        return true;
    }
    !view.ibgp && (attrs.has_community(NO_EXPORT) || attrs.has_community(NO_EXPORT_SUBCONFED))
}

/// Build AS path for export to a peer
/// RFC 4271 Section 5.1.2:
/// - eBGP: prepend local_asn to the first AS_SEQUENCE (or start a new one)
/// - iBGP: unchanged
///
/// Preserves AS_SET segments during propagation
pub fn build_export_as_path(as_path: &[AsPathSegment], local_asn: u32, ebgp: bool) -> Vec<AsPathSegment> {
    if !ebgp {
        return as_path.to_vec();
    }
    match as_path.first() {
        Some(first) if first.segment_type == AsPathSegmentType::AsSequence => {
            let mut asn_list = vec![local_asn];
            asn_list.extend_from_slice(&first.asn_list);
            let mut segments = vec![AsPathSegment::sequence(asn_list)];
            segments.extend_from_slice(&as_path[1..]);
            segments
        }
        _ => {
            let mut segments = vec![AsPathSegment::sequence(vec![local_asn])];
            segments.extend_from_slice(as_path);
            segments
        }
    }
}

/// Determine MULTI_EXIT_DISC (MED) to send
/// RFC 4271 Section 5.1.4: a MED learned from a neighboring AS is not passed
/// on to other neighboring ASes.
pub fn build_export_med(path: &Path, ebgp: bool) -> Option<u32> {
    if ebgp && path.source.is_ebgp() {
        None
    } else {
        path.attrs.med
    }
}

fn same_family(a: IpAddr, b: IpAddr) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

/// Build the NEXT_HOP for export to a peer
/// RFC 4271 Section 5.1.3: eBGP rewrites to our session address; iBGP keeps
/// learned next hops. Local paths without a next hop use our address.
/// Cross-family paths keep an explicit next hop and cannot be sent without.
pub fn build_export_next_hop(path: &Path, local_addr: IpAddr, ebgp: bool) -> Option<IpAddr> {
    let next_hop = path.attrs.next_hop;
    if !ebgp && !path.source.is_local() {
        return Some(next_hop);
    }
    if ebgp && same_family(next_hop, local_addr) {
        return Some(local_addr);
    }
    if !next_hop.is_unspecified() {
        return Some(next_hop);
    }
    if same_family(next_hop, local_addr) {
        return Some(local_addr);
    }
    warn!(nlri = %path.nlri, "filtering cross-family route without explicit next hop");
    None
}

/// Rewrite attributes for `view` after policy. None when the path cannot be
/// expressed toward this target.
///
/// - RS clients: transparent (RFC 7947); only a missing next hop is filled
/// - eBGP: prepend, next-hop-self, MED rules, no reflection attributes,
///   non-transitive extended communities dropped
/// - iBGP: LOCAL_PREF always present; reflected paths carry ORIGINATOR_ID
///   and our cluster id (RFC 4456)
pub fn export_rewrite(view: &PeerView, path: &Arc<Path>) -> Option<Arc<Path>> {
    if path.withdraw {
        return Some(Arc::clone(path));
    }
    let mut attrs: PathAttrs = (*path.attrs).clone();

    if view.rs_client {
        if attrs.next_hop.is_unspecified() {
            attrs.next_hop = build_export_next_hop(path, view.local_addr, false)?;
        }
        return Some(path.clone_with(|p| p.attrs = Arc::new(attrs)));
    }

    let ebgp = !view.ibgp;
    attrs.next_hop = build_export_next_hop(path, view.local_addr, ebgp)?;
    attrs.as_path = build_export_as_path(&path.attrs.as_path, view.local_asn, ebgp);
    attrs.med = build_export_med(path, ebgp);

    if ebgp {
        attrs.originator_id = None;
        attrs.cluster_list.clear();
        attrs.extended_communities.retain(|ec| is_transitive(*ec));
    } else {
        attrs.local_pref = Some(attrs.local_pref.unwrap_or(100));
        if path.source.is_ibgp() {
            attrs.originator_id = Some(attrs.originator_id.unwrap_or(path.source.router_id));
            attrs.cluster_list.insert(0, view.cluster_id);
        }
    }
    Some(path.clone_with(|p| p.attrs = Arc::new(attrs)))
}

struct AnnounceGroup {
    family: AfiSafi,
    attrs: Arc<PathAttrs>,
    nlri: Vec<NlriEntry>,
}

/// Pack exported paths into UPDATE messages: withdraws first, then
/// announcements grouped by attribute set and family. Each message stays
/// within the 4096-byte limit.
pub fn build_updates(codec: &dyn Codec, ctx: &CodecContext, paths: &[Arc<Path>]) -> Vec<UpdateMessage> {
    let mut withdrawn: BTreeMap<AfiSafi, Vec<NlriEntry>> = BTreeMap::new();
    let mut groups: Vec<AnnounceGroup> = Vec::new();

    for path in paths {
        let family = path.family();
        let entry = NlriEntry {
            nlri: path.nlri,
            path_id: ctx
                .add_path_tx
                .contains(&family)
                .then_some(path.local_path_id),
            label: if path.withdraw { None } else { path.label },
        };
        if path.withdraw {
            withdrawn.entry(family).or_default().push(entry);
            continue;
        }
        let group = groups.iter_mut().find(|g| {
            g.family == family && (Arc::ptr_eq(&g.attrs, &path.attrs) || g.attrs == path.attrs)
        });
        match group {
            Some(group) => group.nlri.push(entry),
            None => groups.push(AnnounceGroup {
                family,
                attrs: Arc::clone(&path.attrs),
                nlri: vec![entry],
            }),
        }
    }

    let mut out = Vec::new();
    for (family, entries) in withdrawn {
        pack(codec, ctx, family, entries, &mut out, |chunk| {
            withdraw_message(family, chunk)
        });
    }
    for group in groups {
        let attrs = group.attrs;
        pack(codec, ctx, group.family, group.nlri, &mut out, |chunk| {
            announce_message(group.family, &attrs, chunk)
        });
    }
    out
}

fn pack(
    codec: &dyn Codec,
    ctx: &CodecContext,
    family: AfiSafi,
    entries: Vec<NlriEntry>,
    out: &mut Vec<UpdateMessage>,
    build: impl Fn(Vec<NlriEntry>) -> UpdateMessage,
) {
    let add_path = ctx.add_path_tx.contains(&family);
    let base = codec
        .encode(ctx, &BgpMessage::Update(build(Vec::new())))
        .len()
        + SIZE_SLACK;
    let mut chunk = Vec::new();
    let mut size = base;
    let mut scratch = Vec::new();

    for entry in entries {
        scratch.clear();
        encode_nlri(&mut scratch, &entry, add_path);
        if !chunk.is_empty() && size + scratch.len() > MAX_MESSAGE_SIZE as usize {
            out.push(build(mem::take(&mut chunk)));
            size = base;
        }
        size += scratch.len();
        chunk.push(entry);
    }
    if !chunk.is_empty() {
        out.push(build(chunk));
    }
}

fn withdraw_message(family: AfiSafi, withdrawn: Vec<NlriEntry>) -> UpdateMessage {
    if family == AfiSafi::IPV4_UNICAST {
        return UpdateMessage {
            withdrawn,
            ..Default::default()
        };
    }
    UpdateMessage {
        attrs: vec![PathAttribute::MpUnreachNlri(MpUnreach {
            afi_safi: family,
            withdrawn,
        })],
        ..Default::default()
    }
}

fn announce_message(family: AfiSafi, attrs: &PathAttrs, nlri: Vec<NlriEntry>) -> UpdateMessage {
    let mut out = attrs.to_attributes();
    match attrs.next_hop {
        IpAddr::V4(nh) if family == AfiSafi::IPV4_UNICAST => {
            out.push(PathAttribute::NextHop(nh));
            out.sort_by_key(|a| a.type_code());
            UpdateMessage {
                withdrawn: Vec::new(),
                attrs: out,
                nlri,
            }
        }
        next_hop => {
            out.push(PathAttribute::MpReachNlri(MpReach {
                afi_safi: family,
                next_hop: vec![next_hop],
                nlri,
            }));
            out.sort_by_key(|a| a.type_code());
            UpdateMessage {
                attrs: out,
                ..Default::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::codec::WireCodec;
    use crate::bgp::nlri::{Nlri, RouteDistinguisher};
    use crate::rib::{PathSource, RtInterest};
    use crate::test_helpers::*;
    use std::collections::BTreeSet;
    use std::net::Ipv4Addr;

    fn view(asn: u32) -> PeerView {
        PeerView {
            address: "10.0.0.3".parse().unwrap(),
            asn,
            router_id: Ipv4Addr::new(10, 0, 0, 3),
            local_asn: TEST_LOCAL_ASN,
            cluster_id: Ipv4Addr::new(1, 1, 1, 1),
            ibgp: asn == TEST_LOCAL_ASN,
            rs_client: false,
            rr_client: false,
            allow_own_as: 0,
            families: [AfiSafi::IPV4_UNICAST].into_iter().collect(),
            llgr: BTreeSet::new(),
            rtc: false,
            rt_interest: RtInterest::default(),
            vrf: None,
            add_path_tx: BTreeSet::new(),
            local_addr: "10.0.0.1".parse().unwrap(),
        }
    }

    fn ibgp_source(addr: &str) -> PathSource {
        PathSource::peer(
            addr.parse().unwrap(),
            TEST_LOCAL_ASN,
            addr.parse().unwrap(),
            TEST_LOCAL_ASN,
            true,
            false,
        )
    }

    #[test]
    fn test_build_export_as_path() {
        let set = AsPathSegment {
            segment_type: AsPathSegmentType::AsSet,
            asn_list: vec![65010, 65011],
        };
        let cases = [
            // (input, ebgp, expected)
            (vec![], true, vec![AsPathSegment::sequence(vec![65000])]),
            (vec![], false, vec![]),
            (
                vec![AsPathSegment::sequence(vec![65001])],
                true,
                vec![AsPathSegment::sequence(vec![65000, 65001])],
            ),
            (
                vec![AsPathSegment::sequence(vec![65001])],
                false,
                vec![AsPathSegment::sequence(vec![65001])],
            ),
            (
                vec![set.clone()],
                true,
                vec![AsPathSegment::sequence(vec![65000]), set.clone()],
            ),
        ];
        for (input, ebgp, expected) in cases {
            assert_eq!(build_export_as_path(&input, 65000, ebgp), expected, "{:?}", input);
        }
    }

    #[test]
    fn test_build_export_next_hop() {
        let learned = create_test_path("10.0.0.2", "10.1.0.0/24");
        let local_v4: IpAddr = "10.0.0.1".parse().unwrap();
        let local_v6: IpAddr = "2001:db8::1".parse().unwrap();
        let local = create_test_path_with("10.0.0.2", "10.1.0.0/24", |p| {
            p.source = PathSource::local();
            p.attrs = test_attrs(vec![], "0.0.0.0");
        });

        let cases = [
            (&learned, local_v4, true, Some(local_v4)),
            (&learned, local_v4, false, Some("192.0.2.1".parse().unwrap())),
            // cross-family with explicit next hop keeps it
            (&learned, local_v6, true, Some("192.0.2.1".parse().unwrap())),
            (&local, local_v4, false, Some(local_v4)),
            (&local, local_v6, false, None),
        ];
        for (path, local_addr, ebgp, expected) in cases {
            assert_eq!(build_export_next_hop(path, local_addr, ebgp), expected);
        }
    }

    #[test]
    fn test_build_export_med() {
        let ebgp_learned = create_test_path_with("10.0.0.2", "10.1.0.0/24", |p| {
            p.attrs = Arc::new(PathAttrs {
                med: Some(50),
                ..(*p.attrs).clone()
            })
        });
        assert_eq!(build_export_med(&ebgp_learned, true), None);
        assert_eq!(build_export_med(&ebgp_learned, false), Some(50));

        let ibgp_learned = ebgp_learned.clone_with(|p| p.source = ibgp_source("10.0.0.5"));
        assert_eq!(build_export_med(&ibgp_learned, true), Some(50));
    }

    #[test]
    fn test_should_filter_by_community() {
        let cases = [
            (vec![NO_ADVERTISE], TEST_LOCAL_ASN, true),
            (vec![NO_ADVERTISE], 65003, true),
            (vec![NO_EXPORT], TEST_LOCAL_ASN, false),
            (vec![NO_EXPORT], 65003, true),
            (vec![NO_EXPORT_SUBCONFED], 65003, true),
            (vec![0xfde8_0001], 65003, false),
        ];
        for (communities, asn, filtered) in cases {
            let attrs = PathAttrs {
                communities: communities.clone(),
                ..Default::default()
            };
            assert_eq!(should_filter_by_community(&attrs, &view(asn)), filtered, "{:?}", communities);
        }
    }

    #[test]
    fn test_export_rewrite_reflection() {
        let path = create_test_path_with("10.0.0.2", "10.1.0.0/24", |p| {
            p.source = ibgp_source("10.0.0.2");
        });
        let out = export_rewrite(&view(TEST_LOCAL_ASN), &path).unwrap();
        assert_eq!(out.attrs.originator_id, Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(out.attrs.cluster_list, vec![Ipv4Addr::new(1, 1, 1, 1)]);
        assert_eq!(out.attrs.local_pref, Some(100));
        assert_eq!(out.attrs.next_hop, path.attrs.next_hop);

        // toward eBGP the reflection attributes are removed again
        let out = export_rewrite(&view(65003), &out).unwrap();
        assert_eq!(out.attrs.originator_id, None);
        assert!(out.attrs.cluster_list.is_empty());
        assert_eq!(out.attrs.next_hop, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_export_rewrite_route_server_is_transparent() {
        let mut target = view(65003);
        target.rs_client = true;
        let path = create_test_path("10.0.0.2", "10.1.0.0/24");
        let out = export_rewrite(&target, &path).unwrap();
        assert_eq!(out.attrs, path.attrs);
    }

    #[test]
    fn test_build_updates_withdraws_first_and_groups() {
        let a = create_test_path("10.0.0.2", "10.1.0.0/24");
        let b = create_test_path_with("10.0.0.2", "10.2.0.0/24", |p| p.attrs = Arc::clone(&a.attrs));
        let c = create_test_path_with("10.0.0.2", "10.3.0.0/24", |p| {
            p.attrs = test_attrs(vec![65001, 65009], "192.0.2.1")
        });
        let w = create_test_path("10.0.0.2", "10.4.0.0/24").to_withdraw();

        let updates = build_updates(&WireCodec, &CodecContext::default(), &[a, b, c, w]);
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0].withdrawn.len(), 1);
        assert!(updates[0].attrs.is_empty());
        assert_eq!(updates[1].nlri.len(), 2);
        assert_eq!(updates[2].nlri.len(), 1);
        assert!(updates[1]
            .attrs
            .iter()
            .any(|a| matches!(a, PathAttribute::NextHop(nh) if *nh == Ipv4Addr::new(192, 0, 2, 1))));
    }

    #[test]
    fn test_build_updates_splits_oversized() {
        let attrs = test_attrs(vec![65001], "192.0.2.1");
        let paths: Vec<_> = (0..2000u32)
            .map(|i| {
                let prefix = format!("10.{}.{}.0/24", i / 256, i % 256);
                create_test_path_with("10.0.0.2", &prefix, |p| p.attrs = Arc::clone(&attrs))
            })
            .collect();
        let ctx = CodecContext::default();
        let updates = build_updates(&WireCodec, &ctx, &paths);
        assert!(updates.len() > 1);
        assert_eq!(updates.iter().map(|u| u.nlri.len()).sum::<usize>(), 2000);
        for update in updates {
            let len = WireCodec.encode(&ctx, &BgpMessage::Update(update)).len();
            assert!(len <= MAX_MESSAGE_SIZE as usize, "{}", len);
        }
    }

    #[test]
    fn test_build_updates_vpn_and_add_path() {
        let vpn = create_test_path_with("10.0.0.2", "10.1.0.0/24", |p| {
            p.nlri = Nlri::Vpn {
                rd: RouteDistinguisher(1),
                prefix: "10.1.0.0/24".parse().unwrap(),
            };
            p.label = Some(100);
            p.local_path_id = 7;
        });
        let ctx = CodecContext {
            add_path_tx: [AfiSafi::IPV4_VPN].into_iter().collect(),
            ..Default::default()
        };
        let updates = build_updates(&WireCodec, &ctx, &[vpn.clone(), vpn.to_withdraw()]);
        assert_eq!(updates.len(), 2);
        let withdrawn = updates[0].withdrawn_all();
        assert_eq!(withdrawn.len(), 1);
        assert_eq!(withdrawn[0].label, None);
        let announced = updates[1].announced();
        assert_eq!(announced[0].0.path_id, Some(7));
        assert_eq!(announced[0].0.label, Some(100));
    }
}
