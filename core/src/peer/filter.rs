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

//! Per-target export filter.

use crate::bgp::attr::{as_path_count, NO_LLGR};
use crate::bgp::family::AfiSafi;
use crate::bgp::nlri::Nlri;
use crate::config::Vrf;
use crate::rib::{Path, PathAttrs, RtInterest};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

/// Everything `filterpath` needs to know about one Established target.
#[derive(Debug, Clone)]
pub struct PeerView {
    pub address: IpAddr,
    pub asn: u32,
    pub router_id: Ipv4Addr,
    pub local_asn: u32,
    pub cluster_id: Ipv4Addr,
    pub ibgp: bool,
    pub rs_client: bool,
    pub rr_client: bool,
    pub allow_own_as: u8,
    pub families: BTreeSet<AfiSafi>,
    /// Families with long-lived graceful restart negotiated.
    pub llgr: BTreeSet<AfiSafi>,
    /// RT-constraint negotiated; VPN routes follow `rt_interest`.
    pub rtc: bool,
    pub rt_interest: RtInterest,
    pub vrf: Option<Vrf>,
    pub add_path_tx: BTreeSet<AfiSafi>,
    /// Our end of the session, used for next-hop-self.
    pub local_addr: IpAddr,
}

impl PeerView {
    /// Family a path is sent in: VPN routes reach VRF targets as unicast.
    pub fn target_family(&self, family: AfiSafi) -> Option<AfiSafi> {
        match &self.vrf {
            Some(_) if family.is_vpn() => family.vpn_counterpart(),
            Some(_) => None,
            None => Some(family),
        }
    }

    pub fn add_path(&self, family: AfiSafi) -> bool {
        self.target_family(family)
            .is_some_and(|f| self.add_path_tx.contains(&f))
    }
}

/// Decide what `target` is sent for `path`, given `old`, the path it was
/// last sent for the same destination (None if nothing).
///
/// Returns the path to advertise (possibly rewritten), a withdraw for a
/// path the target may hold, or None. Pure: neither input is modified.
pub fn filterpath(view: &PeerView, path: &Arc<Path>, old: Option<&Arc<Path>>) -> Option<Arc<Path>> {
    let family = view.target_family(path.family())?;
    if !view.families.contains(&family) {
        return None;
    }

    if path.withdraw {
        return match old {
            Some(old) => implicit_withdraw(view, Some(old)),
            None => Some(to_target_nlri(view, path)),
        };
    }

    if path.source.address == view.address {
        return implicit_withdraw(view, old);
    }

    if !view.rs_client
        && as_path_count(&path.attrs.as_path, view.asn) > view.allow_own_as as usize
    {
        return implicit_withdraw(view, old);
    }

    // RFC 4684
    if view.rtc && path.family().is_vpn() && !view.rt_interest.allows(path) {
        return implicit_withdraw(view, old);
    }

    if view.ibgp && !view.rs_client && !reflectable(view, path) {
        return implicit_withdraw(view, old);
    }

    if let Some(vrf) = &view.vrf {
        if !path.attrs.route_targets().any(|rt| vrf.import_rt.contains(&rt)) {
            return implicit_withdraw(view, old);
        }
    }

    // RFC 9494 4.3/4.5
    if path.is_llgr_stale()
        && (path.attrs.has_community(NO_LLGR) || !view.llgr.contains(&family))
    {
        return implicit_withdraw(view, old);
    }

    let mut out = to_target_nlri(view, path);
    if !view.ibgp && !view.rs_client && out.attrs.local_pref.is_some() {
        let mut attrs: PathAttrs = (*out.attrs).clone();
        attrs.local_pref = None;
        out = out.clone_with(|p| p.attrs = Arc::new(attrs));
    }
    Some(out)
}

/// RFC 4456 rules for an iBGP target.
fn reflectable(view: &PeerView, path: &Path) -> bool {
    if path.source.is_ibgp() && !path.source.rr_client && !view.rr_client {
        return false;
    }
    if path.attrs.originator_id == Some(view.router_id) {
        return false;
    }
    !path.attrs.cluster_list.contains(&view.cluster_id)
}

/// Withdraw `old` if the target may have been sent it.
fn implicit_withdraw(view: &PeerView, old: Option<&Arc<Path>>) -> Option<Arc<Path>> {
    old.and_then(|old| filterpath(view, old, None))
        .map(|p| p.to_withdraw())
}

fn to_target_nlri(view: &PeerView, path: &Arc<Path>) -> Arc<Path> {
    match (&view.vrf, path.nlri) {
        (Some(_), Nlri::Vpn { prefix, .. }) => path.clone_with(|p| {
            p.nlri = Nlri::Unicast(prefix);
            p.label = None;
        }),
        _ => Arc::clone(path),
    }
}
