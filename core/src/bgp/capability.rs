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

//! OPEN capabilities (RFC 5492) and their negotiation.

use super::family::AfiSafi;
use std::collections::{BTreeMap, BTreeSet};

pub mod cap_code {
    pub const MULTIPROTOCOL: u8 = 1;
    pub const ROUTE_REFRESH: u8 = 2;
    pub const EXTENDED_NEXTHOP: u8 = 5;
    pub const GRACEFUL_RESTART: u8 = 64;
    pub const FOUR_OCTET_AS: u8 = 65;
    pub const ADD_PATH: u8 = 69;
    pub const LONG_LIVED_GRACEFUL_RESTART: u8 = 71;
}

/// ADD-PATH send/receive mode (RFC 7911).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddPathMode {
    Receive = 1,
    Send = 2,
    Both = 3,
}

impl AddPathMode {
    pub fn from_flags(receive: bool, send: bool) -> Option<Self> {
        match (receive, send) {
            (true, true) => Some(AddPathMode::Both),
            (true, false) => Some(AddPathMode::Receive),
            (false, true) => Some(AddPathMode::Send),
            (false, false) => None,
        }
    }

    pub fn can_receive(self) -> bool {
        matches!(self, AddPathMode::Receive | AddPathMode::Both)
    }

    pub fn can_send(self) -> bool {
        matches!(self, AddPathMode::Send | AddPathMode::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GracefulRestartCap {
    /// Seconds, 12 bits on the wire.
    pub restart_time: u16,
    /// R bit: the sender has restarted.
    pub restarting: bool,
    /// Families with their forwarding-state-preserved (F) bit.
    pub families: Vec<(AfiSafi, bool)>,
}

impl GracefulRestartCap {
    pub fn forwarding_preserved(&self, family: AfiSafi) -> Option<bool> {
        self.families
            .iter()
            .find(|(f, _)| *f == family)
            .map(|(_, preserved)| *preserved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LlgrFamily {
    pub family: AfiSafi,
    pub forwarding_preserved: bool,
    /// Seconds, 24 bits on the wire.
    pub stale_time: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Capability {
    Multiprotocol(AfiSafi),
    RouteRefresh,
    /// Next-hop AFI allowed for the family (RFC 8950).
    ExtendedNexthop(Vec<(AfiSafi, u16)>),
    GracefulRestart(GracefulRestartCap),
    FourOctetAs(u32),
    AddPath(Vec<(AfiSafi, AddPathMode)>),
    LongLivedGracefulRestart(Vec<LlgrFamily>),
    Unknown { code: u8, value: Vec<u8> },
}

fn family_bytes(family: AfiSafi) -> [u8; 3] {
    let afi = (family.afi as u16).to_be_bytes();
    [afi[0], afi[1], family.safi as u8]
}

fn read_family(bytes: &[u8]) -> Option<AfiSafi> {
    AfiSafi::from_wire(u16::from_be_bytes([bytes[0], bytes[1]]), bytes[2])
}

impl Capability {
    pub fn code(&self) -> u8 {
        match self {
            Capability::Multiprotocol(_) => cap_code::MULTIPROTOCOL,
            Capability::RouteRefresh => cap_code::ROUTE_REFRESH,
            Capability::ExtendedNexthop(_) => cap_code::EXTENDED_NEXTHOP,
            Capability::GracefulRestart(_) => cap_code::GRACEFUL_RESTART,
            Capability::FourOctetAs(_) => cap_code::FOUR_OCTET_AS,
            Capability::AddPath(_) => cap_code::ADD_PATH,
            Capability::LongLivedGracefulRestart(_) => cap_code::LONG_LIVED_GRACEFUL_RESTART,
            Capability::Unknown { code, .. } => *code,
        }
    }

    fn value_bytes(&self) -> Vec<u8> {
        let mut val = Vec::new();
        match self {
            Capability::Multiprotocol(family) => {
                let fb = family_bytes(*family);
                val.extend_from_slice(&[fb[0], fb[1], 0, fb[2]]);
            }
            Capability::RouteRefresh => {}
            Capability::ExtendedNexthop(entries) => {
                for (family, nh_afi) in entries {
                    val.extend_from_slice(&(family.afi as u16).to_be_bytes());
                    val.extend_from_slice(&(family.safi as u16).to_be_bytes());
                    val.extend_from_slice(&nh_afi.to_be_bytes());
                }
            }
            Capability::GracefulRestart(gr) => {
                let mut flags_time = gr.restart_time & 0x0FFF;
                if gr.restarting {
                    flags_time |= 0x8000;
                }
                val.extend_from_slice(&flags_time.to_be_bytes());
                for (family, preserved) in &gr.families {
                    val.extend_from_slice(&family_bytes(*family));
                    val.push(if *preserved { 0x80 } else { 0 });
                }
            }
            Capability::FourOctetAs(asn) => val.extend_from_slice(&asn.to_be_bytes()),
            Capability::AddPath(entries) => {
                for (family, mode) in entries {
                    val.extend_from_slice(&family_bytes(*family));
                    val.push(*mode as u8);
                }
            }
            Capability::LongLivedGracefulRestart(entries) => {
                for entry in entries {
                    val.extend_from_slice(&family_bytes(entry.family));
                    val.push(if entry.forwarding_preserved { 0x80 } else { 0 });
                    val.extend_from_slice(&entry.stale_time.to_be_bytes()[1..]);
                }
            }
            Capability::Unknown { value, .. } => val.extend_from_slice(value),
        }
        val
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        let val = self.value_bytes();
        buf.push(self.code());
        buf.push(val.len() as u8);
        buf.extend_from_slice(&val);
    }

    /// Decode one capability value. Unsupported families inside a known
    /// capability are skipped; a value with the wrong size yields `None`.
    pub fn decode(code: u8, val: &[u8]) -> Option<Capability> {
        let cap = match code {
            cap_code::MULTIPROTOCOL => {
                if val.len() != 4 {
                    return None;
                }
                match AfiSafi::from_wire(u16::from_be_bytes([val[0], val[1]]), val[3]) {
                    Some(family) => Capability::Multiprotocol(family),
                    None => Capability::Unknown {
                        code,
                        value: val.to_vec(),
                    },
                }
            }
            cap_code::ROUTE_REFRESH => Capability::RouteRefresh,
            cap_code::EXTENDED_NEXTHOP => {
                if val.len() % 6 != 0 {
                    return None;
                }
                let entries = val
                    .chunks(6)
                    .filter_map(|c| {
                        let safi = u16::from_be_bytes([c[2], c[3]]);
                        let family =
                            AfiSafi::from_wire(u16::from_be_bytes([c[0], c[1]]), safi as u8)?;
                        Some((family, u16::from_be_bytes([c[4], c[5]])))
                    })
                    .collect();
                Capability::ExtendedNexthop(entries)
            }
            cap_code::GRACEFUL_RESTART => {
                if val.len() < 2 || (val.len() - 2) % 4 != 0 {
                    return None;
                }
                let flags_time = u16::from_be_bytes([val[0], val[1]]);
                let families = val[2..]
                    .chunks(4)
                    .filter_map(|c| Some((read_family(c)?, c[3] & 0x80 != 0)))
                    .collect();
                Capability::GracefulRestart(GracefulRestartCap {
                    restart_time: flags_time & 0x0FFF,
                    restarting: flags_time & 0x8000 != 0,
                    families,
                })
            }
            cap_code::FOUR_OCTET_AS => {
                if val.len() != 4 {
                    return None;
                }
                Capability::FourOctetAs(u32::from_be_bytes([val[0], val[1], val[2], val[3]]))
            }
            cap_code::ADD_PATH => {
                if val.len() % 4 != 0 {
                    return None;
                }
                let entries = val
                    .chunks(4)
                    .filter_map(|c| {
                        let mode = match c[3] {
                            1 => AddPathMode::Receive,
                            2 => AddPathMode::Send,
                            3 => AddPathMode::Both,
                            _ => return None,
                        };
                        Some((read_family(c)?, mode))
                    })
                    .collect();
                Capability::AddPath(entries)
            }
            cap_code::LONG_LIVED_GRACEFUL_RESTART => {
                if val.len() % 7 != 0 {
                    return None;
                }
                let entries = val
                    .chunks(7)
                    .filter_map(|c| {
                        Some(LlgrFamily {
                            family: read_family(c)?,
                            forwarding_preserved: c[3] & 0x80 != 0,
                            stale_time: u32::from_be_bytes([0, c[4], c[5], c[6]]),
                        })
                    })
                    .collect();
                Capability::LongLivedGracefulRestart(entries)
            }
            _ => Capability::Unknown {
                code,
                value: val.to_vec(),
            },
        };
        Some(cap)
    }
}

/// Result of intersecting the local and remote capability sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiatedCapabilities {
    pub families: BTreeSet<AfiSafi>,
    pub four_octet_as: bool,
    pub route_refresh: bool,
    /// Families where the peer prepends path identifiers to what it sends.
    pub add_path_rx: BTreeSet<AfiSafi>,
    /// Families where we prepend path identifiers.
    pub add_path_tx: BTreeSet<AfiSafi>,
    pub extended_nexthop: BTreeSet<AfiSafi>,
    /// The peer's graceful restart capability, set only when both sides
    /// advertised one.
    pub graceful_restart: Option<GracefulRestartCap>,
    /// Negotiated long-lived stale time per family.
    pub llgr: BTreeMap<AfiSafi, u32>,
    /// Everything the peer advertised, keyed by capability code.
    pub remote: BTreeMap<u8, Vec<Capability>>,
}

impl NegotiatedCapabilities {
    pub fn has_family(&self, family: AfiSafi) -> bool {
        self.families.contains(&family)
    }

    pub fn gr_families(&self) -> Vec<AfiSafi> {
        match &self.graceful_restart {
            Some(gr) => gr
                .families
                .iter()
                .map(|(f, _)| *f)
                .filter(|f| self.families.contains(f))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn restart_time(&self) -> Option<u16> {
        self.graceful_restart.as_ref().map(|gr| gr.restart_time)
    }
}

fn families_of(caps: &[Capability]) -> BTreeSet<AfiSafi> {
    let set: BTreeSet<AfiSafi> = caps
        .iter()
        .filter_map(|c| match c {
            Capability::Multiprotocol(f) => Some(*f),
            _ => None,
        })
        .collect();
    // A speaker without multiprotocol capabilities carries IPv4 unicast only
    if set.is_empty() {
        BTreeSet::from([AfiSafi::IPV4_UNICAST])
    } else {
        set
    }
}

fn add_path_modes(caps: &[Capability]) -> BTreeMap<AfiSafi, AddPathMode> {
    caps.iter()
        .filter_map(|c| match c {
            Capability::AddPath(entries) => Some(entries.iter().copied()),
            _ => None,
        })
        .flatten()
        .collect()
}

pub fn negotiate(local: &[Capability], remote: &[Capability]) -> NegotiatedCapabilities {
    let families: BTreeSet<AfiSafi> = families_of(local)
        .intersection(&families_of(remote))
        .copied()
        .collect();

    let has = |caps: &[Capability], code: u8| caps.iter().any(|c| c.code() == code);

    let local_ap = add_path_modes(local);
    let remote_ap = add_path_modes(remote);
    let mut add_path_rx = BTreeSet::new();
    let mut add_path_tx = BTreeSet::new();
    for (family, mode) in &local_ap {
        if !families.contains(family) {
            continue;
        }
        if let Some(peer_mode) = remote_ap.get(family) {
            if mode.can_receive() && peer_mode.can_send() {
                add_path_rx.insert(*family);
            }
            if mode.can_send() && peer_mode.can_receive() {
                add_path_tx.insert(*family);
            }
        }
    }

    let ext_nh = |caps: &[Capability]| -> BTreeSet<AfiSafi> {
        caps.iter()
            .filter_map(|c| match c {
                Capability::ExtendedNexthop(e) => Some(e.iter().map(|(f, _)| *f)),
                _ => None,
            })
            .flatten()
            .collect()
    };
    let extended_nexthop = ext_nh(local)
        .intersection(&ext_nh(remote))
        .filter(|f| families.contains(f))
        .copied()
        .collect();

    let remote_gr = remote.iter().find_map(|c| match c {
        Capability::GracefulRestart(gr) => Some(gr.clone()),
        _ => None,
    });
    let graceful_restart = if has(local, cap_code::GRACEFUL_RESTART) {
        remote_gr
    } else {
        None
    };

    let llgr_of = |caps: &[Capability]| -> BTreeMap<AfiSafi, u32> {
        caps.iter()
            .filter_map(|c| match c {
                Capability::LongLivedGracefulRestart(e) => {
                    Some(e.iter().map(|f| (f.family, f.stale_time)))
                }
                _ => None,
            })
            .flatten()
            .collect()
    };
    let mut llgr = BTreeMap::new();
    // LLGR is only meaningful alongside graceful restart
    if graceful_restart.is_some() {
        let local_llgr = llgr_of(local);
        for (family, remote_time) in llgr_of(remote) {
            if let Some(local_time) = local_llgr.get(&family) {
                if families.contains(&family) {
                    llgr.insert(family, remote_time.min(*local_time));
                }
            }
        }
    }

    let mut remote_map: BTreeMap<u8, Vec<Capability>> = BTreeMap::new();
    for cap in remote {
        remote_map.entry(cap.code()).or_default().push(cap.clone());
    }

    NegotiatedCapabilities {
        families,
        four_octet_as: has(local, cap_code::FOUR_OCTET_AS) && has(remote, cap_code::FOUR_OCTET_AS),
        route_refresh: has(local, cap_code::ROUTE_REFRESH) && has(remote, cap_code::ROUTE_REFRESH),
        add_path_rx,
        add_path_tx,
        extended_nexthop,
        graceful_restart,
        llgr,
        remote: remote_map,
    }
}

/// Negotiated hold time and keepalive interval in seconds. A hold time of
/// zero disables both.
pub fn negotiate_hold(local: u16, remote: u16) -> (u16, u16) {
    let hold = local.min(remote);
    (hold, hold / 3)
}
