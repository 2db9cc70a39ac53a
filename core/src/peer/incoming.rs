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

use crate::bgp::attr::{as_path_count, leftmost_as, PathAttribute};
use crate::bgp::family::AfiSafi;
use crate::bgp::msg::UpdateMessage;
use crate::bgp::notification::NotificationMessage;
use crate::log::{debug, warn};
use crate::peer::Peer;
use crate::rib::{Path, PathAttrs, PathSource};
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

/// What one received UPDATE produced.
#[derive(Debug, Default)]
pub struct UpdateOutcome {
    /// Candidate paths for the tables, withdraws included.
    pub paths: Vec<Arc<Path>>,
    /// Families the peer marked complete.
    pub eors: Vec<AfiSafi>,
    /// Prefix limit exceeded; close the session with this.
    pub notification: Option<NotificationMessage>,
}

impl Peer {
    /// Turn an UPDATE into candidate paths and record them in Adj-RIB-In.
    pub fn handle_update(&mut self, msg: &UpdateMessage, local_asn: u32) -> UpdateOutcome {
        let mut outcome = UpdateOutcome::default();
        if let Some(family) = msg.end_of_rib_family() {
            outcome.eors.push(family);
            return outcome;
        }
        let Some(source) = self.source(local_asn) else {
            return outcome;
        };
        let negotiated: BTreeSet<AfiSafi> = self.negotiated_families().into_iter().collect();
        let mut touched = BTreeSet::new();

        for entry in msg.withdrawn_all() {
            let family = entry.nlri.afi_safi();
            if !negotiated.contains(&family) {
                debug!(peer = %self.address(), %family, "withdraw for family not negotiated");
                continue;
            }
            let withdraw = Arc::new(Path::new_withdraw(entry.nlri, entry.path_id, source));
            // re-withdrawing an unknown key yields nothing
            if let Some(previous) = self.rib_in.update(Arc::clone(&withdraw)) {
                if !previous.as_looped {
                    outcome.paths.push(withdraw);
                }
            }
        }

        let announced = msg.announced();
        if announced.is_empty() {
            return outcome;
        }
        let looped = self.is_looped(msg, local_asn, &source);
        let mut attrs_by_nh: HashMap<IpAddr, Arc<PathAttrs>> = HashMap::new();

        for (entry, next_hop) in announced {
            let family = entry.nlri.afi_safi();
            if !negotiated.contains(&family) {
                debug!(peer = %self.address(), %family, "NLRI for family not negotiated");
                continue;
            }
            let Some(next_hop) = next_hop else {
                debug!(peer = %self.address(), nlri = %entry.nlri, "NLRI without next hop");
                continue;
            };
            let attrs = attrs_by_nh
                .entry(next_hop)
                .or_insert_with(|| Arc::new(PathAttrs::from_update(msg.path_attrs(), next_hop)));

            let mut path = Path::new(entry.nlri, Arc::clone(attrs), source);
            path.remote_path_id = entry.path_id;
            path.label = entry.label;
            path.as_looped = looped;
            let previous = self.rib_in.update(Arc::new(path.clone()));
            touched.insert(family);

            if looped {
                // the looped path replaces what the tables hold for this key
                if previous.is_some_and(|p| !p.as_looped) {
                    outcome
                        .paths
                        .push(Arc::new(Path::new_withdraw(entry.nlri, entry.path_id, source)));
                }
                continue;
            }
            outcome.paths.push(Arc::new(path));
        }

        outcome.notification = self.check_prefix_limits(&touched);
        outcome
    }

    /// Our AS more often than allowed, or an eBGP path whose first AS is
    /// not the peer's.
    fn is_looped(&self, msg: &UpdateMessage, local_asn: u32, source: &PathSource) -> bool {
        let as_path = msg
            .path_attrs()
            .find_map(|a| match a {
                PathAttribute::AsPath(segments) => Some(segments.as_slice()),
                _ => None,
            })
            .unwrap_or(&[]);
        if as_path_count(as_path, local_asn) > self.config.allow_own_as as usize {
            debug!(peer = %self.address(), "AS path contains local AS");
            return true;
        }
        if source.is_ebgp() && leftmost_as(as_path) != Some(source.asn) {
            debug!(peer = %self.address(), first_as = ?leftmost_as(as_path), "first AS is not the peer AS");
            return true;
        }
        false
    }

    fn check_prefix_limits(&mut self, families: &BTreeSet<AfiSafi>) -> Option<NotificationMessage> {
        for family in families {
            let Some(limit) = self.config.afi_safi(*family).and_then(|c| c.prefix_limit) else {
                continue;
            };
            let count = self.rib_in.count(*family);
            let max = limit.max_prefixes as usize;
            if count > max {
                warn!(peer = %self.address(), %family, count, max, "prefix limit exceeded");
                return Some(NotificationMessage::max_prefixes_reached(
                    *family,
                    limit.max_prefixes,
                ));
            }
            let threshold = max * limit.shutdown_threshold_pct as usize / 100;
            if limit.shutdown_threshold_pct > 0
                && count >= threshold
                && self.rib_in.latch_warning(*family)
            {
                warn!(peer = %self.address(), %family, count, max, "prefix count reached warning threshold");
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::attr::{AsPathSegment, Origin};
    use crate::bgp::capability::NegotiatedCapabilities;
    use crate::bgp::codec::WireCodec;
    use crate::bgp::nlri::{Nlri, NlriEntry};
    use crate::bgp::notification::{BgpError, CeaseSubcode};
    use crate::config::{Config, PeerConfig, PrefixLimitConfig};
    use crate::net::SystemTransport;
    use crate::peer::fsm::BgpState;
    use crate::peer::session::{SessionDeps, SessionInfo};
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    const LOCAL_ASN: u32 = 65000;

    fn established_peer(asn: u32, configure: impl FnOnce(&mut PeerConfig)) -> Peer {
        let global = Config::new(LOCAL_ASN, Ipv4Addr::new(1, 1, 1, 1), vec![]);
        let mut config = PeerConfig::new("10.0.0.2".parse().unwrap(), asn);
        config.passive_mode = true;
        config.admin_down = true;
        configure(&mut config);
        let (events, _) = mpsc::unbounded_channel();
        let deps = SessionDeps {
            codec: Arc::new(WireCodec),
            transport: Arc::new(SystemTransport),
            events,
        };
        let mut peer = Peer::spawn(config, false, None, 1, &global, deps);
        peer.state = BgpState::Established;
        peer.session = Some(SessionInfo {
            remote_asn: asn,
            remote_router_id: Ipv4Addr::new(10, 0, 0, 2),
            local_addr: "10.0.0.1:179".parse().unwrap(),
            remote_addr: "10.0.0.2:40000".parse().unwrap(),
            negotiated: NegotiatedCapabilities {
                families: [AfiSafi::IPV4_UNICAST].into_iter().collect(),
                ..Default::default()
            },
            hold_time: 90,
            keepalive_time: 30,
        });
        peer
    }

    fn announce(prefixes: &[&str], as_path: Vec<u32>) -> UpdateMessage {
        UpdateMessage {
            withdrawn: vec![],
            attrs: vec![
                PathAttribute::Origin(Origin::Igp),
                PathAttribute::AsPath(vec![AsPathSegment::sequence(as_path)]),
                PathAttribute::NextHop(Ipv4Addr::new(10, 0, 0, 2)),
            ],
            nlri: prefixes.iter().map(|p| entry(p)).collect(),
        }
    }

    fn withdraw(prefixes: &[&str]) -> UpdateMessage {
        UpdateMessage {
            withdrawn: prefixes.iter().map(|p| entry(p)).collect(),
            ..Default::default()
        }
    }

    fn entry(prefix: &str) -> NlriEntry {
        NlriEntry::new(Nlri::Unicast(prefix.parse().unwrap()))
    }

    #[tokio::test]
    async fn test_announce_and_withdraw() {
        let mut peer = established_peer(65001, |_| {});

        let out = peer.handle_update(&announce(&["10.1.0.0/24", "10.2.0.0/24"], vec![65001]), LOCAL_ASN);
        assert_eq!(out.paths.len(), 2);
        assert!(out.paths.iter().all(|p| !p.withdraw));
        // one attribute set per next hop
        assert!(Arc::ptr_eq(&out.paths[0].attrs, &out.paths[1].attrs));
        assert_eq!(peer.rib_in.count(AfiSafi::IPV4_UNICAST), 2);

        let out = peer.handle_update(&withdraw(&["10.1.0.0/24"]), LOCAL_ASN);
        assert_eq!(out.paths.len(), 1);
        assert!(out.paths[0].withdraw);

        // re-withdraw is a no-op
        let out = peer.handle_update(&withdraw(&["10.1.0.0/24"]), LOCAL_ASN);
        assert!(out.paths.is_empty());
        assert_eq!(peer.rib_in.count(AfiSafi::IPV4_UNICAST), 1);
    }

    #[tokio::test]
    async fn test_end_of_rib() {
        let mut peer = established_peer(65001, |_| {});
        let out = peer.handle_update(&UpdateMessage::end_of_rib(AfiSafi::IPV4_UNICAST), LOCAL_ASN);
        assert_eq!(out.eors, vec![AfiSafi::IPV4_UNICAST]);
        assert!(out.paths.is_empty());
    }

    #[tokio::test]
    async fn test_loop_detection() {
        let cases = [
            // (as_path, allow_own_as, looped)
            (vec![65001], 0, false),
            (vec![65001, 65000], 0, true),
            (vec![65001, 65000], 1, false),
            (vec![65001, 65000, 65000], 1, true),
            // first AS must be the peer's
            (vec![65009, 65001], 0, true),
        ];
        for (as_path, allow, looped) in cases {
            let mut peer = established_peer(65001, |c| c.allow_own_as = allow);
            let out = peer.handle_update(&announce(&["10.1.0.0/24"], as_path.clone()), LOCAL_ASN);
            assert_eq!(out.paths.is_empty(), looped, "as_path {:?} allow {}", as_path, allow);
        }
    }

    #[tokio::test]
    async fn test_looped_replacement_withdraws_stored_path() {
        let mut peer = established_peer(65001, |_| {});
        peer.handle_update(&announce(&["10.1.0.0/24"], vec![65001]), LOCAL_ASN);

        let out = peer.handle_update(&announce(&["10.1.0.0/24"], vec![65001, 65000]), LOCAL_ASN);
        assert_eq!(out.paths.len(), 1);
        assert!(out.paths[0].withdraw);

        // a withdraw of the looped entry does not reach the tables again
        let out = peer.handle_update(&withdraw(&["10.1.0.0/24"]), LOCAL_ASN);
        assert!(out.paths.is_empty());
    }

    #[tokio::test]
    async fn test_ibgp_skips_first_as_check() {
        let mut peer = established_peer(LOCAL_ASN, |_| {});
        let out = peer.handle_update(&announce(&["10.1.0.0/24"], vec![65009]), LOCAL_ASN);
        assert_eq!(out.paths.len(), 1);
        assert!(out.paths[0].source.is_ibgp());
    }

    #[tokio::test]
    async fn test_prefix_limit() {
        let mut peer = established_peer(65001, |c| {
            c.afi_safis[0].prefix_limit = Some(PrefixLimitConfig {
                max_prefixes: 4,
                shutdown_threshold_pct: 50,
            });
        });

        let out = peer.handle_update(&announce(&["10.1.0.0/24", "10.2.0.0/24"], vec![65001]), LOCAL_ASN);
        assert!(out.notification.is_none());
        // warning latched at 50%
        assert!(!peer.rib_in.latch_warning(AfiSafi::IPV4_UNICAST));

        let out = peer.handle_update(
            &announce(&["10.3.0.0/24", "10.4.0.0/24", "10.5.0.0/24"], vec![65001]),
            LOCAL_ASN,
        );
        let notification = out.notification.expect("limit exceeded");
        assert_eq!(notification.error, BgpError::Cease(CeaseSubcode::MaxPrefixesReached));
        // AFI 1, SAFI 1, limit 4
        assert_eq!(notification.data, vec![0, 1, 1, 0, 0, 0, 4]);
    }
}
