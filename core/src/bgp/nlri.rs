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

//! NLRI keys: unicast prefixes, VPN prefixes (RFC 4364) and route-target
//! membership (RFC 4684).

use super::family::{Afi, AfiSafi};
use crate::net::{IpNetwork, Ipv4Net, Ipv6Net};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Route distinguisher in wire form (8 bytes, big endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteDistinguisher(pub u64);

impl fmt::Display for RouteDistinguisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        match (v >> 48) as u16 {
            0 => write!(f, "{}:{}", (v >> 32) as u16, v as u32),
            1 => write!(f, "{}:{}", Ipv4Addr::from((v >> 16) as u32), v as u16),
            _ => write!(f, "{}:{}", (v >> 16) as u32, v as u16),
        }
    }
}

impl FromStr for RouteDistinguisher {
    type Err = String;

    /// Accepts `ASN:value` or `IPv4:value`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (admin, assigned) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid route distinguisher '{}'", s))?;
        if let Ok(ip) = admin.parse::<Ipv4Addr>() {
            let local: u16 = assigned
                .parse()
                .map_err(|_| format!("invalid route distinguisher '{}'", s))?;
            return Ok(RouteDistinguisher(
                (1u64 << 48) | ((u32::from(ip) as u64) << 16) | local as u64,
            ));
        }
        let asn: u32 = admin
            .parse()
            .map_err(|_| format!("invalid route distinguisher '{}'", s))?;
        if asn <= u16::MAX as u32 {
            let local: u32 = assigned
                .parse()
                .map_err(|_| format!("invalid route distinguisher '{}'", s))?;
            Ok(RouteDistinguisher(((asn as u64) << 32) | local as u64))
        } else {
            let local: u16 = assigned
                .parse()
                .map_err(|_| format!("invalid route distinguisher '{}'", s))?;
            Ok(RouteDistinguisher(
                (2u64 << 48) | ((asn as u64) << 16) | local as u64,
            ))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Nlri {
    Unicast(IpNetwork),
    Vpn {
        rd: RouteDistinguisher,
        prefix: IpNetwork,
    },
    /// Route-target membership. `route_target: None` is the default
    /// (wildcard) membership.
    RouteTarget {
        origin_as: u32,
        route_target: Option<u64>,
    },
}

impl Nlri {
    pub fn afi_safi(&self) -> AfiSafi {
        match self {
            Nlri::Unicast(IpNetwork::V4(_)) => AfiSafi::IPV4_UNICAST,
            Nlri::Unicast(IpNetwork::V6(_)) => AfiSafi::IPV6_UNICAST,
            Nlri::Vpn {
                prefix: IpNetwork::V4(_),
                ..
            } => AfiSafi::IPV4_VPN,
            Nlri::Vpn {
                prefix: IpNetwork::V6(_),
                ..
            } => AfiSafi::IPV6_VPN,
            Nlri::RouteTarget { .. } => AfiSafi::RTC,
        }
    }

    pub fn prefix(&self) -> Option<IpNetwork> {
        match self {
            Nlri::Unicast(p) | Nlri::Vpn { prefix: p, .. } => Some(*p),
            Nlri::RouteTarget { .. } => None,
        }
    }
}

impl From<IpNetwork> for Nlri {
    fn from(prefix: IpNetwork) -> Self {
        Nlri::Unicast(prefix)
    }
}

impl fmt::Display for Nlri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Nlri::Unicast(p) => write!(f, "{}", p),
            Nlri::Vpn { rd, prefix } => write!(f, "{}:{}", rd, prefix),
            Nlri::RouteTarget {
                origin_as,
                route_target: Some(rt),
            } => write!(f, "{}:{:016x}", origin_as, rt),
            Nlri::RouteTarget {
                route_target: None,
                ..
            } => f.write_str("default"),
        }
    }
}

/// One NLRI as it appears in an UPDATE, with its optional ADD-PATH id and
/// MPLS label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NlriEntry {
    pub nlri: Nlri,
    pub path_id: Option<u32>,
    pub label: Option<u32>,
}

impl NlriEntry {
    pub fn new(nlri: Nlri) -> Self {
        NlriEntry {
            nlri,
            path_id: None,
            label: None,
        }
    }
}

/// Label value used in VPN withdrawals (RFC 8277 compatibility value).
pub const WITHDRAW_LABEL: u32 = 0x80000;

fn prefix_bytes(bits: u8) -> usize {
    (bits as usize).div_ceil(8)
}

fn write_prefix_addr(buf: &mut Vec<u8>, prefix: &IpNetwork) {
    match prefix {
        IpNetwork::V4(net) => {
            buf.extend_from_slice(&net.address.octets()[..prefix_bytes(net.prefix_length)])
        }
        IpNetwork::V6(net) => {
            buf.extend_from_slice(&net.address.octets()[..prefix_bytes(net.prefix_length)])
        }
    }
}

fn read_prefix_addr(afi: Afi, bits: u8, bytes: &[u8]) -> Option<IpNetwork> {
    let n = prefix_bytes(bits);
    if bytes.len() < n {
        return None;
    }
    match afi {
        Afi::Ipv4 => {
            if bits > 32 {
                return None;
            }
            let mut octets = [0u8; 4];
            octets[..n].copy_from_slice(&bytes[..n]);
            Some(IpNetwork::V4(Ipv4Net {
                address: Ipv4Addr::from(octets),
                prefix_length: bits,
            }))
        }
        Afi::Ipv6 => {
            if bits > 128 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets[..n].copy_from_slice(&bytes[..n]);
            Some(IpNetwork::V6(Ipv6Net {
                address: Ipv6Addr::from(octets),
                prefix_length: bits,
            }))
        }
    }
}

/// Encode a list of NLRI entries for `family`.
pub fn encode_nlri(buf: &mut Vec<u8>, entry: &NlriEntry, add_path: bool) {
    if add_path {
        buf.extend_from_slice(&entry.path_id.unwrap_or(0).to_be_bytes());
    }
    match &entry.nlri {
        Nlri::Unicast(prefix) => {
            buf.push(prefix.prefix_len());
            write_prefix_addr(buf, prefix);
        }
        Nlri::Vpn { rd, prefix } => {
            buf.push(24 + 64 + prefix.prefix_len());
            let label = entry.label.unwrap_or(WITHDRAW_LABEL);
            let stack = (label << 4) | 1;
            buf.extend_from_slice(&stack.to_be_bytes()[1..]);
            buf.extend_from_slice(&rd.0.to_be_bytes());
            write_prefix_addr(buf, prefix);
        }
        Nlri::RouteTarget {
            origin_as,
            route_target,
        } => match route_target {
            None => buf.push(0),
            Some(rt) => {
                buf.push(96);
                buf.extend_from_slice(&origin_as.to_be_bytes());
                buf.extend_from_slice(&rt.to_be_bytes());
            }
        },
    }
}

/// Decode every NLRI in `bytes`. Returns `None` on any framing error, which
/// the caller classifies.
pub fn decode_nlri(family: AfiSafi, bytes: &[u8], add_path: bool) -> Option<Vec<NlriEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let path_id = if add_path {
            let raw = bytes.get(pos..pos + 4)?;
            pos += 4;
            Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
        } else {
            None
        };
        let bits = *bytes.get(pos)?;
        pos += 1;
        let entry = match family.safi {
            super::family::Safi::Unicast => {
                let prefix = read_prefix_addr(family.afi, bits, &bytes[pos..])?;
                pos += prefix_bytes(bits);
                NlriEntry {
                    nlri: Nlri::Unicast(prefix),
                    path_id,
                    label: None,
                }
            }
            super::family::Safi::MplsVpn => {
                if bits < 88 {
                    return None;
                }
                let raw = bytes.get(pos..pos + 11)?;
                let stack = u32::from_be_bytes([0, raw[0], raw[1], raw[2]]);
                let mut rd = [0u8; 8];
                rd.copy_from_slice(&raw[3..11]);
                pos += 11;
                let prefix = read_prefix_addr(family.afi, bits - 88, &bytes[pos..])?;
                pos += prefix_bytes(bits - 88);
                NlriEntry {
                    nlri: Nlri::Vpn {
                        rd: RouteDistinguisher(u64::from_be_bytes(rd)),
                        prefix,
                    },
                    path_id,
                    label: Some(stack >> 4),
                }
            }
            super::family::Safi::RouteTargetConstraint => {
                let nlri = match bits {
                    0 => Nlri::RouteTarget {
                        origin_as: 0,
                        route_target: None,
                    },
                    96 => {
                        let raw = bytes.get(pos..pos + 12)?;
                        pos += 12;
                        let mut rt = [0u8; 8];
                        rt.copy_from_slice(&raw[4..12]);
                        Nlri::RouteTarget {
                            origin_as: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
                            route_target: Some(u64::from_be_bytes(rt)),
                        }
                    }
                    _ => return None,
                };
                NlriEntry {
                    nlri,
                    path_id,
                    label: None,
                }
            }
        };
        entries.push(entry);
    }
    Some(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_distinguisher_parse() {
        let cases = [
            ("65000:100", "65000:100"),
            ("10.0.0.1:7", "10.0.0.1:7"),
            ("4200000000:5", "4200000000:5"),
        ];
        for (input, display) in cases {
            let rd: RouteDistinguisher = input.parse().unwrap();
            assert_eq!(rd.to_string(), display, "{}", input);
        }
        assert!("65000".parse::<RouteDistinguisher>().is_err());
        assert!("x:1".parse::<RouteDistinguisher>().is_err());
    }

    #[test]
    fn test_decode_vpn_nlri() {
        let entry = NlriEntry {
            nlri: Nlri::Vpn {
                rd: "65000:1".parse().unwrap(),
                prefix: "10.1.0.0/16".parse().unwrap(),
            },
            path_id: None,
            label: Some(100),
        };
        let mut buf = Vec::new();
        encode_nlri(&mut buf, &entry, false);
        assert_eq!(buf[0], 88 + 16);
        assert_eq!(buf.len(), 1 + 3 + 8 + 2);

        let decoded = decode_nlri(AfiSafi::IPV4_VPN, &buf, false).unwrap();
        assert_eq!(decoded, vec![entry]);
    }

    #[test]
    fn test_decode_nlri_truncated() {
        // /24 needs three address bytes
        assert!(decode_nlri(AfiSafi::IPV4_UNICAST, &[24, 10, 0], false).is_none());
        // prefix length beyond the family
        assert!(decode_nlri(AfiSafi::IPV4_UNICAST, &[33, 1, 1, 1, 1, 1], false).is_none());
        // RTC prefixes are either 0 or 96 bits here
        assert!(decode_nlri(AfiSafi::RTC, &[32, 0, 0, 0, 1], false).is_none());
    }

    #[test]
    fn test_decode_add_path_ids() {
        let bytes = [0, 0, 0, 7, 24, 10, 0, 0, 0, 0, 0, 9, 8, 192];
        let decoded = decode_nlri(AfiSafi::IPV4_UNICAST, &bytes, true).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].path_id, Some(7));
        assert_eq!(decoded[1].path_id, Some(9));
        assert_eq!(decoded[1].nlri, Nlri::Unicast("192.0.0.0/8".parse().unwrap()));
    }
}
