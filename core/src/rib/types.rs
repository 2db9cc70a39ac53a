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

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKind {
    Local,
    Ebgp,
    Ibgp,
}

/// Where a path came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathSource {
    pub kind: SourceKind,
    /// Peer address, or the router id for local paths.
    pub address: IpAddr,
    pub asn: u32,
    pub router_id: Ipv4Addr,
    pub rr_client: bool,
    pub rs_client: bool,
}

impl PathSource {
    /// A locally originated path whose identity the table manager fills in.
    pub fn local() -> Self {
        PathSource {
            kind: SourceKind::Local,
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            asn: 0,
            router_id: Ipv4Addr::UNSPECIFIED,
            rr_client: false,
            rs_client: false,
        }
    }

    pub fn peer(
        address: IpAddr,
        asn: u32,
        router_id: Ipv4Addr,
        local_asn: u32,
        rr_client: bool,
        rs_client: bool,
    ) -> Self {
        PathSource {
            kind: if asn == local_asn {
                SourceKind::Ibgp
            } else {
                SourceKind::Ebgp
            },
            address,
            asn,
            router_id,
            rr_client,
            rs_client,
        }
    }

    pub fn is_local(&self) -> bool {
        self.kind == SourceKind::Local
    }

    pub fn is_ibgp(&self) -> bool {
        self.kind == SourceKind::Ibgp
    }

    pub fn is_ebgp(&self) -> bool {
        self.kind == SourceKind::Ebgp
    }

    pub(crate) fn is_unset(&self) -> bool {
        self.is_local() && self.router_id.is_unspecified()
    }
}

/// Which table of a destination a path lives in: the shared table, or the
/// private table of one route-server client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableId {
    Global,
    RsClient(IpAddr),
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableId::Global => f.write_str("global"),
            TableId::RsClient(addr) => write!(f, "rs-client {}", addr),
        }
    }
}
