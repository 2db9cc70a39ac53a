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

//! Path attributes as a closed set of variants (RFC 4271 section 5).

use super::family::AfiSafi;
use super::nlri::NlriEntry;
use std::net::{IpAddr, Ipv4Addr};

pub mod attr_flags {
    pub const OPTIONAL: u8 = 1 << 7;
    pub const TRANSITIVE: u8 = 1 << 6;
    pub const PARTIAL: u8 = 1 << 5;
    pub const EXTENDED_LENGTH: u8 = 1 << 4;
}

pub mod attr_type_code {
    pub const ORIGIN: u8 = 1;
    pub const AS_PATH: u8 = 2;
    pub const NEXT_HOP: u8 = 3;
    pub const MULTI_EXIT_DISC: u8 = 4;
    pub const LOCAL_PREF: u8 = 5;
    pub const ATOMIC_AGGREGATE: u8 = 6;
    pub const AGGREGATOR: u8 = 7;
    pub const COMMUNITIES: u8 = 8;
    pub const ORIGINATOR_ID: u8 = 9;
    pub const CLUSTER_LIST: u8 = 10;
    pub const MP_REACH_NLRI: u8 = 14;
    pub const MP_UNREACH_NLRI: u8 = 15;
    pub const EXTENDED_COMMUNITIES: u8 = 16;
}

/// RFC 1997 well-known communities.
pub const NO_EXPORT: u32 = 0xFFFF_FF01;
pub const NO_ADVERTISE: u32 = 0xFFFF_FF02;
pub const NO_EXPORT_SUBCONFED: u32 = 0xFFFF_FF03;
/// Long-lived graceful restart communities (RFC 9494).
pub const LLGR_STALE: u32 = 0xFFFF_0006;
pub const NO_LLGR: u32 = 0xFFFF_0007;

pub const AS_TRANS: u32 = 23456;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Origin {
    #[default]
    Igp = 0,
    Egp = 1,
    Incomplete = 2,
}

impl TryFrom<u8> for Origin {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Origin::Igp),
            1 => Ok(Origin::Egp),
            2 => Ok(Origin::Incomplete),
            other => Err(other),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsPathSegmentType {
    AsSet = 1,
    AsSequence = 2,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AsPathSegment {
    pub segment_type: AsPathSegmentType,
    pub asn_list: Vec<u32>,
}

impl AsPathSegment {
    pub fn sequence(asn_list: Vec<u32>) -> Self {
        AsPathSegment {
            segment_type: AsPathSegmentType::AsSequence,
            asn_list,
        }
    }
}

/// Path length for best-path selection: an AS_SET counts as one hop.
pub fn as_path_len(segments: &[AsPathSegment]) -> usize {
    segments
        .iter()
        .map(|s| match s.segment_type {
            AsPathSegmentType::AsSequence => s.asn_list.len(),
            AsPathSegmentType::AsSet => 1,
        })
        .sum()
}

/// Number of times `asn` appears anywhere in the path.
pub fn as_path_count(segments: &[AsPathSegment], asn: u32) -> usize {
    segments
        .iter()
        .flat_map(|s| s.asn_list.iter())
        .filter(|a| **a == asn)
        .count()
}

pub fn leftmost_as(segments: &[AsPathSegment]) -> Option<u32> {
    segments
        .first()
        .filter(|s| s.segment_type == AsPathSegmentType::AsSequence)
        .and_then(|s| s.asn_list.first().copied())
}

pub fn as_path_to_string(segments: &[AsPathSegment]) -> String {
    segments
        .iter()
        .map(|s| {
            let inner = s
                .asn_list
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(" ");
            match s.segment_type {
                AsPathSegmentType::AsSequence => inner,
                AsPathSegmentType::AsSet => format!("{{{}}}", inner),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MpReach {
    pub afi_safi: AfiSafi,
    pub next_hop: Vec<IpAddr>,
    pub nlri: Vec<NlriEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MpUnreach {
    pub afi_safi: AfiSafi,
    pub withdrawn: Vec<NlriEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnknownAttr {
    pub flags: u8,
    pub type_code: u8,
    pub value: Vec<u8>,
}

impl UnknownAttr {
    pub fn is_transitive(&self) -> bool {
        self.flags & attr_flags::TRANSITIVE != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathAttribute {
    Origin(Origin),
    AsPath(Vec<AsPathSegment>),
    NextHop(Ipv4Addr),
    MultiExitDisc(u32),
    LocalPref(u32),
    AtomicAggregate,
    Aggregator { asn: u32, address: Ipv4Addr },
    Communities(Vec<u32>),
    OriginatorId(Ipv4Addr),
    ClusterList(Vec<Ipv4Addr>),
    MpReachNlri(MpReach),
    MpUnreachNlri(MpUnreach),
    ExtendedCommunities(Vec<u64>),
    Unknown(UnknownAttr),
}

impl PathAttribute {
    pub fn type_code(&self) -> u8 {
        use attr_type_code::*;
        match self {
            PathAttribute::Origin(_) => ORIGIN,
            PathAttribute::AsPath(_) => AS_PATH,
            PathAttribute::NextHop(_) => NEXT_HOP,
            PathAttribute::MultiExitDisc(_) => MULTI_EXIT_DISC,
            PathAttribute::LocalPref(_) => LOCAL_PREF,
            PathAttribute::AtomicAggregate => ATOMIC_AGGREGATE,
            PathAttribute::Aggregator { .. } => AGGREGATOR,
            PathAttribute::Communities(_) => COMMUNITIES,
            PathAttribute::OriginatorId(_) => ORIGINATOR_ID,
            PathAttribute::ClusterList(_) => CLUSTER_LIST,
            PathAttribute::MpReachNlri(_) => MP_REACH_NLRI,
            PathAttribute::MpUnreachNlri(_) => MP_UNREACH_NLRI,
            PathAttribute::ExtendedCommunities(_) => EXTENDED_COMMUNITIES,
            PathAttribute::Unknown(u) => u.type_code,
        }
    }

    /// Flags this speaker uses when sending the attribute (extended length is
    /// decided by the encoder).
    pub fn flags(&self) -> u8 {
        use attr_flags::*;
        match self {
            PathAttribute::Origin(_)
            | PathAttribute::AsPath(_)
            | PathAttribute::NextHop(_)
            | PathAttribute::LocalPref(_)
            | PathAttribute::AtomicAggregate => TRANSITIVE,
            PathAttribute::MultiExitDisc(_)
            | PathAttribute::OriginatorId(_)
            | PathAttribute::ClusterList(_)
            | PathAttribute::MpReachNlri(_)
            | PathAttribute::MpUnreachNlri(_) => OPTIONAL,
            PathAttribute::Aggregator { .. }
            | PathAttribute::Communities(_)
            | PathAttribute::ExtendedCommunities(_) => OPTIONAL | TRANSITIVE,
            PathAttribute::Unknown(u) => u.flags & !EXTENDED_LENGTH,
        }
    }
}

/// Revised UPDATE error handling class for a malformed attribute
/// (RFC 7606 section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorClass {
    AttributeDiscard,
    TreatAsWithdraw,
    AfiSafiDisable,
    SessionReset,
}

pub fn error_class(type_code: u8) -> ErrorClass {
    use attr_type_code::*;
    match type_code {
        ORIGIN | AS_PATH | NEXT_HOP | MULTI_EXIT_DISC | LOCAL_PREF | COMMUNITIES
        | ORIGINATOR_ID | CLUSTER_LIST | EXTENDED_COMMUNITIES => ErrorClass::TreatAsWithdraw,
        ATOMIC_AGGREGATE | AGGREGATOR => ErrorClass::AttributeDiscard,
        MP_REACH_NLRI | MP_UNREACH_NLRI => ErrorClass::AfiSafiDisable,
        _ => ErrorClass::AttributeDiscard,
    }
}

// Extended community layout (RFC 4360): [type][subtype][6 value bytes]
pub const EXT_TYPE_TWO_OCTET_AS: u8 = 0x00;
pub const EXT_TYPE_IPV4: u8 = 0x01;
pub const EXT_TYPE_FOUR_OCTET_AS: u8 = 0x02;
pub const EXT_TYPE_NON_TRANSITIVE_BIT: u8 = 0x40;
pub const EXT_SUBTYPE_ROUTE_TARGET: u8 = 0x02;

pub const fn ext_type(ec: u64) -> u8 {
    (ec >> 56) as u8
}

pub const fn ext_subtype(ec: u64) -> u8 {
    (ec >> 48) as u8
}

pub const fn is_transitive(ec: u64) -> bool {
    ext_type(ec) & EXT_TYPE_NON_TRANSITIVE_BIT == 0
}

pub fn is_route_target(ec: u64) -> bool {
    ext_subtype(ec) == EXT_SUBTYPE_ROUTE_TARGET
        && matches!(
            ext_type(ec),
            EXT_TYPE_TWO_OCTET_AS | EXT_TYPE_IPV4 | EXT_TYPE_FOUR_OCTET_AS
        )
}

/// Parse a route target in `ASN:value` or `IPv4:value` form into its
/// extended community encoding.
pub fn parse_route_target(s: &str) -> Result<u64, String> {
    let err = || format!("invalid route target '{}'", s);
    let (admin, local) = s.split_once(':').ok_or_else(err)?;
    let subtype = (EXT_SUBTYPE_ROUTE_TARGET as u64) << 48;
    if let Ok(ip) = admin.parse::<Ipv4Addr>() {
        let local: u16 = local.parse().map_err(|_| err())?;
        return Ok(((EXT_TYPE_IPV4 as u64) << 56)
            | subtype
            | ((u32::from(ip) as u64) << 16)
            | local as u64);
    }
    let asn: u32 = admin.parse().map_err(|_| err())?;
    if asn <= u16::MAX as u32 {
        let local: u32 = local.parse().map_err(|_| err())?;
        Ok(((EXT_TYPE_TWO_OCTET_AS as u64) << 56) | subtype | ((asn as u64) << 32) | local as u64)
    } else {
        let local: u16 = local.parse().map_err(|_| err())?;
        Ok(((EXT_TYPE_FOUR_OCTET_AS as u64) << 56) | subtype | ((asn as u64) << 16) | local as u64)
    }
}

/// Parse `ASN:value` into a standard community.
pub fn parse_community(s: &str) -> Result<u32, String> {
    match s {
        "no-export" => return Ok(NO_EXPORT),
        "no-advertise" => return Ok(NO_ADVERTISE),
        "llgr-stale" => return Ok(LLGR_STALE),
        "no-llgr" => return Ok(NO_LLGR),
        _ => {}
    }
    if let Some((high, low)) = s.split_once(':') {
        let high: u16 = high
            .parse()
            .map_err(|_| format!("invalid community '{}'", s))?;
        let low: u16 = low
            .parse()
            .map_err(|_| format!("invalid community '{}'", s))?;
        return Ok(((high as u32) << 16) | low as u32);
    }
    s.parse().map_err(|_| format!("invalid community '{}'", s))
}
