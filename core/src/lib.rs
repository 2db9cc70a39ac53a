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

pub mod bgp;
pub mod config;
pub mod log;
pub mod net;
pub mod peer;
pub mod policy;
pub mod propagate;
pub mod rib;
pub mod rpki;
pub mod server;
pub mod server_ops;
pub mod types;
pub mod watch;

#[cfg(test)]
pub(crate) mod test_helpers {
    use crate::bgp::attr::AsPathSegment;
    use crate::bgp::nlri::Nlri;
    use crate::rib::{Path, PathAttrs, PathSource};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    pub const TEST_LOCAL_ASN: u32 = 65000;

    /// eBGP or iBGP source relative to TEST_LOCAL_ASN. The router id is the
    /// peer address for IPv4 peers.
    pub fn test_source(peer_ip: &str, asn: u32) -> PathSource {
        let address: IpAddr = peer_ip.parse().unwrap();
        let router_id = match address {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => Ipv4Addr::new(1, 1, 1, 1),
        };
        PathSource::peer(address, asn, router_id, TEST_LOCAL_ASN, false, false)
    }

    pub fn test_nlri(prefix: &str) -> Nlri {
        Nlri::Unicast(prefix.parse().unwrap())
    }

    pub fn test_attrs(as_path: Vec<u32>, next_hop: &str) -> Arc<PathAttrs> {
        Arc::new(PathAttrs {
            as_path: if as_path.is_empty() {
                vec![]
            } else {
                vec![AsPathSegment::sequence(as_path)]
            },
            next_hop: next_hop.parse().unwrap(),
            ..Default::default()
        })
    }

    /// Path for `prefix` from eBGP peer `peer_ip` in AS 65001.
    pub fn create_test_path(peer_ip: &str, prefix: &str) -> Arc<Path> {
        create_test_path_with(peer_ip, prefix, |_| {})
    }

    pub fn create_test_path_with(
        peer_ip: &str,
        prefix: &str,
        f: impl FnOnce(&mut Path),
    ) -> Arc<Path> {
        let mut path = Path::new(
            test_nlri(prefix),
            test_attrs(vec![65001], "192.0.2.1"),
            test_source(peer_ip, 65001),
        );
        f(&mut path);
        Arc::new(path)
    }
}
