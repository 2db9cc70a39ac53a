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

//! Message codec. `WireCodec` turns bodies into [`BgpMessage`] values and
//! back, classifying UPDATE errors per RFC 7606.

use super::attr::{
    attr_flags, attr_type_code, error_class, AsPathSegment, AsPathSegmentType, ErrorClass,
    MpReach, MpUnreach, Origin, PathAttribute, UnknownAttr, AS_TRANS,
};
use super::capability::{Capability, NegotiatedCapabilities};
use super::family::AfiSafi;
use super::msg::{
    frame, BgpMessage, MessageHeader, MessageType, OpenMessage, RouteRefreshMessage,
    UpdateMessage, BGP_VERSION,
};
use super::nlri::{decode_nlri, encode_nlri, NlriEntry};
use super::notification::{
    BgpError, NotificationMessage, OpenMessageError, UpdateMessageError,
};
use crate::log::debug;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Session parameters that change how bodies are laid out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecContext {
    pub four_octet_as: bool,
    pub add_path_rx: BTreeSet<AfiSafi>,
    pub add_path_tx: BTreeSet<AfiSafi>,
}

impl CodecContext {
    pub fn from_negotiated(caps: &NegotiatedCapabilities) -> Self {
        CodecContext {
            four_octet_as: caps.four_octet_as,
            add_path_rx: caps.add_path_rx.clone(),
            add_path_tx: caps.add_path_tx.clone(),
        }
    }
}

/// How the session proceeds after a malformed UPDATE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateErrorHandling {
    SessionReset,
    /// The malformed attributes were dropped; process what is left.
    AttributeDiscard { update: UpdateMessage },
    /// Every NLRI in the UPDATE is to be handled as withdrawn.
    TreatAsWithdraw { withdrawn: Vec<NlriEntry> },
    AfiSafiDisable { family: AfiSafi },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Always fatal to the session.
    Header(NotificationMessage),
    Body {
        notification: NotificationMessage,
        handling: UpdateErrorHandling,
    },
}

impl DecodeError {
    fn reset(notification: NotificationMessage) -> Self {
        DecodeError::Body {
            notification,
            handling: UpdateErrorHandling::SessionReset,
        }
    }

    pub fn notification(&self) -> &NotificationMessage {
        match self {
            DecodeError::Header(n) => n,
            DecodeError::Body { notification, .. } => notification,
        }
    }

    pub fn is_session_reset(&self) -> bool {
        matches!(
            self,
            DecodeError::Header(_)
                | DecodeError::Body {
                    handling: UpdateErrorHandling::SessionReset,
                    ..
                }
        )
    }
}

pub trait Codec: Send + Sync {
    fn decode(
        &self,
        ctx: &CodecContext,
        header: &MessageHeader,
        body: &[u8],
    ) -> Result<BgpMessage, DecodeError>;

    /// Full message including the fixed header.
    fn encode(&self, ctx: &CodecContext, msg: &BgpMessage) -> Vec<u8>;
}

/// Codec for IPv4/IPv6 unicast, VPNv4/VPNv6, RT-constraint, ADD-PATH and
/// two- or four-octet AS numbers.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec;

impl Codec for WireCodec {
    fn decode(
        &self,
        ctx: &CodecContext,
        header: &MessageHeader,
        body: &[u8],
    ) -> Result<BgpMessage, DecodeError> {
        match header.message_type {
            MessageType::Open => decode_open(body).map(BgpMessage::Open),
            MessageType::Update => decode_update(ctx, body).map(BgpMessage::Update),
            MessageType::Notification => {
                let code = body.first().copied().unwrap_or(0);
                let subcode = body.get(1).copied().unwrap_or(0);
                Ok(BgpMessage::Notification(NotificationMessage::new(
                    BgpError::from_codes(code, subcode),
                    body.get(2..).map(|d| d.to_vec()).unwrap_or_default(),
                )))
            }
            MessageType::Keepalive => Ok(BgpMessage::Keepalive),
            MessageType::RouteRefresh => Ok(BgpMessage::RouteRefresh(RouteRefreshMessage {
                afi: u16::from_be_bytes([body[0], body[1]]),
                safi: body[3],
            })),
        }
    }

    fn encode(&self, ctx: &CodecContext, msg: &BgpMessage) -> Vec<u8> {
        let mut body = Vec::new();
        match msg {
            BgpMessage::Open(open) => encode_open(&mut body, open),
            BgpMessage::Update(update) => encode_update(&mut body, ctx, update),
            BgpMessage::Notification(n) => {
                body.push(n.error.code());
                body.push(n.error.subcode());
                body.extend_from_slice(&n.data);
            }
            BgpMessage::Keepalive => {}
            BgpMessage::RouteRefresh(rr) => {
                body.extend_from_slice(&rr.afi.to_be_bytes());
                body.push(0);
                body.push(rr.safi);
            }
        }
        frame(msg.message_type(), &body)
    }
}

fn open_error(e: OpenMessageError, data: Vec<u8>) -> DecodeError {
    DecodeError::reset(NotificationMessage::open_error(e, data))
}

fn decode_open(body: &[u8]) -> Result<OpenMessage, DecodeError> {
    if body.len() < 10 {
        return Err(open_error(OpenMessageError::Other(0), Vec::new()));
    }
    let version = body[0];
    if version != BGP_VERSION {
        return Err(open_error(
            OpenMessageError::UnsupportedVersionNumber,
            (BGP_VERSION as u16).to_be_bytes().to_vec(),
        ));
    }
    let two_octet_as = u16::from_be_bytes([body[1], body[2]]);
    let hold_time = u16::from_be_bytes([body[3], body[4]]);
    if hold_time == 1 || hold_time == 2 {
        return Err(open_error(OpenMessageError::UnacceptableHoldTime, Vec::new()));
    }
    let router_id = Ipv4Addr::new(body[5], body[6], body[7], body[8]);
    if router_id.is_unspecified() {
        return Err(open_error(
            OpenMessageError::BadBgpIdentifier,
            router_id.octets().to_vec(),
        ));
    }
    let params_len = body[9] as usize;
    let params = body
        .get(10..10 + params_len)
        .ok_or_else(|| open_error(OpenMessageError::Other(0), Vec::new()))?;

    let mut capabilities = Vec::new();
    let mut pos = 0;
    while pos < params.len() {
        let param_type = params[pos];
        let len = *params
            .get(pos + 1)
            .ok_or_else(|| open_error(OpenMessageError::Other(0), Vec::new()))?
            as usize;
        let value = params
            .get(pos + 2..pos + 2 + len)
            .ok_or_else(|| open_error(OpenMessageError::Other(0), Vec::new()))?;
        pos += 2 + len;

        // Only the capabilities parameter (type 2) is defined
        if param_type != 2 {
            return Err(open_error(
                OpenMessageError::UnsupportedOptionalParameter,
                Vec::new(),
            ));
        }
        let mut cpos = 0;
        while cpos < value.len() {
            let code = value[cpos];
            let clen = *value
                .get(cpos + 1)
                .ok_or_else(|| open_error(OpenMessageError::Other(0), Vec::new()))?
                as usize;
            let cval = value
                .get(cpos + 2..cpos + 2 + clen)
                .ok_or_else(|| open_error(OpenMessageError::Other(0), Vec::new()))?;
            cpos += 2 + clen;
            let cap = Capability::decode(code, cval)
                .ok_or_else(|| open_error(OpenMessageError::Other(0), vec![code]))?;
            capabilities.push(cap);
        }
    }

    let asn = capabilities
        .iter()
        .find_map(|c| match c {
            Capability::FourOctetAs(asn) => Some(*asn),
            _ => None,
        })
        .unwrap_or(two_octet_as as u32);

    Ok(OpenMessage {
        version,
        asn,
        hold_time,
        router_id,
        capabilities,
    })
}

fn encode_open(body: &mut Vec<u8>, open: &OpenMessage) {
    body.push(open.version);
    let wire_as = if open.asn > u16::MAX as u32 {
        AS_TRANS as u16
    } else {
        open.asn as u16
    };
    body.extend_from_slice(&wire_as.to_be_bytes());
    body.extend_from_slice(&open.hold_time.to_be_bytes());
    body.extend_from_slice(&open.router_id.octets());

    let mut params = Vec::new();
    for cap in &open.capabilities {
        let mut encoded = Vec::new();
        cap.encode(&mut encoded);
        params.push(2);
        params.push(encoded.len() as u8);
        params.extend_from_slice(&encoded);
    }
    body.push(params.len() as u8);
    body.extend_from_slice(&params);
}

/// Raw attribute bytes (flags, type, length, value) used as NOTIFICATION data.
fn attr_data(flags: u8, type_code: u8, value: &[u8]) -> Vec<u8> {
    let mut data = vec![flags, type_code];
    if flags & attr_flags::EXTENDED_LENGTH != 0 {
        data.extend_from_slice(&(value.len() as u16).to_be_bytes());
    } else {
        data.push(value.len() as u8);
    }
    data.extend_from_slice(value);
    data
}

/// Optional and transitive bits every known attribute must carry.
fn expected_flags(type_code: u8) -> Option<u8> {
    use attr_flags::*;
    use attr_type_code::*;
    match type_code {
        ORIGIN | AS_PATH | NEXT_HOP | LOCAL_PREF | ATOMIC_AGGREGATE => Some(TRANSITIVE),
        MULTI_EXIT_DISC | ORIGINATOR_ID | CLUSTER_LIST | MP_REACH_NLRI | MP_UNREACH_NLRI => {
            Some(OPTIONAL)
        }
        AGGREGATOR | COMMUNITIES | EXTENDED_COMMUNITIES => Some(OPTIONAL | TRANSITIVE),
        _ => None,
    }
}

fn u32_at(val: &[u8], pos: usize) -> u32 {
    u32::from_be_bytes([val[pos], val[pos + 1], val[pos + 2], val[pos + 3]])
}

fn ipv4_at(val: &[u8], pos: usize) -> Ipv4Addr {
    Ipv4Addr::new(val[pos], val[pos + 1], val[pos + 2], val[pos + 3])
}

fn decode_as_path(val: &[u8], four_octet: bool) -> Option<Vec<AsPathSegment>> {
    let as_len = if four_octet { 4 } else { 2 };
    let mut segments = Vec::new();
    let mut pos = 0;
    while pos < val.len() {
        let segment_type = match val[pos] {
            1 => AsPathSegmentType::AsSet,
            2 => AsPathSegmentType::AsSequence,
            _ => return None,
        };
        let count = *val.get(pos + 1)? as usize;
        if count == 0 {
            return None;
        }
        let raw = val.get(pos + 2..pos + 2 + count * as_len)?;
        let asn_list = raw
            .chunks(as_len)
            .map(|c| {
                if four_octet {
                    u32::from_be_bytes([c[0], c[1], c[2], c[3]])
                } else {
                    u16::from_be_bytes([c[0], c[1]]) as u32
                }
            })
            .collect();
        segments.push(AsPathSegment {
            segment_type,
            asn_list,
        });
        pos += 2 + count * as_len;
    }
    Some(segments)
}

fn decode_next_hops(family: AfiSafi, raw: &[u8]) -> Option<Vec<IpAddr>> {
    // VPN next hops carry a zero route distinguisher in front
    let raw = if family.is_vpn() { raw.get(8..)? } else { raw };
    let hops = match raw.len() {
        4 => vec![IpAddr::V4(ipv4_at(raw, 0))],
        16 | 32 => raw
            .chunks(16)
            .map(|c| {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(c);
                IpAddr::V6(Ipv6Addr::from(octets))
            })
            .collect(),
        _ => return None,
    };
    Some(hops)
}

enum AttrOutcome {
    Attr(PathAttribute),
    /// Recognised but not usable (unsupported family), dropped silently.
    Ignore,
}

struct AttrError {
    subcode: UpdateMessageError,
    class: ErrorClass,
}

fn decode_attr(
    ctx: &CodecContext,
    flags: u8,
    type_code: u8,
    val: &[u8],
) -> Result<AttrOutcome, AttrError> {
    use attr_type_code::*;
    let fail = |subcode| AttrError {
        subcode,
        class: error_class(type_code),
    };
    let len_err = || fail(UpdateMessageError::AttributeLengthError);

    if let Some(expected) = expected_flags(type_code) {
        if flags & (attr_flags::OPTIONAL | attr_flags::TRANSITIVE) != expected {
            return Err(fail(UpdateMessageError::AttributeFlagsError));
        }
    }

    let attr = match type_code {
        ORIGIN => {
            if val.len() != 1 {
                return Err(len_err());
            }
            let origin = Origin::try_from(val[0])
                .map_err(|_| fail(UpdateMessageError::InvalidOriginAttribute))?;
            PathAttribute::Origin(origin)
        }
        AS_PATH => PathAttribute::AsPath(
            decode_as_path(val, ctx.four_octet_as)
                .ok_or_else(|| fail(UpdateMessageError::MalformedAsPath))?,
        ),
        NEXT_HOP => {
            if val.len() != 4 {
                return Err(len_err());
            }
            let nh = ipv4_at(val, 0);
            if nh.is_unspecified() || nh.is_multicast() || nh.is_broadcast() {
                return Err(fail(UpdateMessageError::InvalidNextHopAttribute));
            }
            PathAttribute::NextHop(nh)
        }
        MULTI_EXIT_DISC | LOCAL_PREF | ORIGINATOR_ID => {
            if val.len() != 4 {
                return Err(len_err());
            }
            match type_code {
                MULTI_EXIT_DISC => PathAttribute::MultiExitDisc(u32_at(val, 0)),
                LOCAL_PREF => PathAttribute::LocalPref(u32_at(val, 0)),
                _ => PathAttribute::OriginatorId(ipv4_at(val, 0)),
            }
        }
        ATOMIC_AGGREGATE => {
            if !val.is_empty() {
                return Err(len_err());
            }
            PathAttribute::AtomicAggregate
        }
        AGGREGATOR => {
            let as_len = if ctx.four_octet_as { 4 } else { 2 };
            if val.len() != as_len + 4 {
                return Err(len_err());
            }
            let asn = if ctx.four_octet_as {
                u32_at(val, 0)
            } else {
                u16::from_be_bytes([val[0], val[1]]) as u32
            };
            PathAttribute::Aggregator {
                asn,
                address: ipv4_at(val, as_len),
            }
        }
        COMMUNITIES => {
            if val.is_empty() || val.len() % 4 != 0 {
                return Err(len_err());
            }
            PathAttribute::Communities(val.chunks(4).map(|c| u32_at(c, 0)).collect())
        }
        CLUSTER_LIST => {
            if val.is_empty() || val.len() % 4 != 0 {
                return Err(len_err());
            }
            PathAttribute::ClusterList(val.chunks(4).map(|c| ipv4_at(c, 0)).collect())
        }
        EXTENDED_COMMUNITIES => {
            if val.is_empty() || val.len() % 8 != 0 {
                return Err(len_err());
            }
            PathAttribute::ExtendedCommunities(
                val.chunks(8)
                    .map(|c| u64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            )
        }
        MP_REACH_NLRI => {
            if val.len() < 5 {
                return Err(len_err());
            }
            let Some(family) = AfiSafi::from_wire(u16::from_be_bytes([val[0], val[1]]), val[2])
            else {
                return Ok(AttrOutcome::Ignore);
            };
            let nh_len = val[3] as usize;
            let nh_raw = val.get(4..4 + nh_len).ok_or_else(len_err)?;
            let next_hop = if family == AfiSafi::RTC && nh_raw.is_empty() {
                Vec::new()
            } else {
                decode_next_hops(family, nh_raw).ok_or_else(len_err)?
            };
            // one reserved byte follows the next hop
            let nlri_raw = val.get(5 + nh_len..).ok_or_else(len_err)?;
            let nlri = decode_nlri(family, nlri_raw, ctx.add_path_rx.contains(&family))
                .ok_or_else(|| fail(UpdateMessageError::OptionalAttributeError))?;
            PathAttribute::MpReachNlri(MpReach {
                afi_safi: family,
                next_hop,
                nlri,
            })
        }
        MP_UNREACH_NLRI => {
            if val.len() < 3 {
                return Err(len_err());
            }
            let Some(family) = AfiSafi::from_wire(u16::from_be_bytes([val[0], val[1]]), val[2])
            else {
                return Ok(AttrOutcome::Ignore);
            };
            let withdrawn = decode_nlri(family, &val[3..], ctx.add_path_rx.contains(&family))
                .ok_or_else(|| fail(UpdateMessageError::OptionalAttributeError))?;
            PathAttribute::MpUnreachNlri(MpUnreach {
                afi_safi: family,
                withdrawn,
            })
        }
        _ => {
            if flags & attr_flags::OPTIONAL == 0 {
                return Err(AttrError {
                    subcode: UpdateMessageError::UnrecognizedWellKnownAttribute,
                    class: ErrorClass::SessionReset,
                });
            }
            PathAttribute::Unknown(UnknownAttr {
                flags,
                type_code,
                value: val.to_vec(),
            })
        }
    };
    Ok(AttrOutcome::Attr(attr))
}

fn mp_family(val: &[u8]) -> Option<AfiSafi> {
    if val.len() < 3 {
        return None;
    }
    AfiSafi::from_wire(u16::from_be_bytes([val[0], val[1]]), val[2])
}

fn update_reset(e: UpdateMessageError) -> DecodeError {
    DecodeError::reset(NotificationMessage::update_error(e, Vec::new()))
}

fn decode_update(ctx: &CodecContext, body: &[u8]) -> Result<UpdateMessage, DecodeError> {
    let malformed = || update_reset(UpdateMessageError::MalformedAttributeList);

    let withdrawn_len = u16::from_be_bytes([body[0], body[1]]) as usize;
    let withdrawn_raw = body.get(2..2 + withdrawn_len).ok_or_else(malformed)?;
    let attr_len_pos = 2 + withdrawn_len;
    let attr_len_raw = body.get(attr_len_pos..attr_len_pos + 2).ok_or_else(malformed)?;
    let attrs_len = u16::from_be_bytes([attr_len_raw[0], attr_len_raw[1]]) as usize;
    let attrs_raw = body
        .get(attr_len_pos + 2..attr_len_pos + 2 + attrs_len)
        .ok_or_else(malformed)?;
    let nlri_raw = &body[attr_len_pos + 2 + attrs_len..];

    let v4 = AfiSafi::IPV4_UNICAST;
    let add_path_v4 = ctx.add_path_rx.contains(&v4);
    let withdrawn = decode_nlri(v4, withdrawn_raw, add_path_v4)
        .ok_or_else(|| update_reset(UpdateMessageError::InvalidNetworkField))?;
    let nlri = decode_nlri(v4, nlri_raw, add_path_v4)
        .ok_or_else(|| update_reset(UpdateMessageError::InvalidNetworkField))?;

    let mut attrs: Vec<PathAttribute> = Vec::new();
    let mut seen = BTreeSet::new();
    let mut worst: Option<(ErrorClass, NotificationMessage)> = None;
    let mut disabled_family = None;
    let mut pos = 0;

    while pos < attrs_raw.len() {
        let header = attrs_raw.get(pos..pos + 2).ok_or_else(malformed)?;
        let (flags, type_code) = (header[0], header[1]);
        let (len, hdr_len) = if flags & attr_flags::EXTENDED_LENGTH != 0 {
            let raw = attrs_raw.get(pos + 2..pos + 4).ok_or_else(malformed)?;
            (u16::from_be_bytes([raw[0], raw[1]]) as usize, 4)
        } else {
            (*attrs_raw.get(pos + 2).ok_or_else(malformed)? as usize, 3)
        };
        let val = attrs_raw
            .get(pos + hdr_len..pos + hdr_len + len)
            .ok_or_else(malformed)?;
        pos += hdr_len + len;

        if !seen.insert(type_code) {
            if matches!(
                type_code,
                attr_type_code::MP_REACH_NLRI | attr_type_code::MP_UNREACH_NLRI
            ) {
                return Err(malformed());
            }
            debug!(type_code, "duplicate path attribute discarded");
            continue;
        }

        match decode_attr(ctx, flags, type_code, val) {
            Ok(AttrOutcome::Attr(attr)) => attrs.push(attr),
            Ok(AttrOutcome::Ignore) => {}
            Err(err) => {
                if err.class == ErrorClass::AfiSafiDisable {
                    disabled_family = mp_family(val);
                }
                let notification =
                    NotificationMessage::update_error(err.subcode, attr_data(flags, type_code, val));
                if worst.as_ref().map_or(true, |(class, _)| err.class > *class) {
                    worst = Some((err.class, notification));
                }
            }
        }
    }

    let update = UpdateMessage {
        withdrawn,
        attrs,
        nlri,
    };

    // Mandatory attributes apply only when something is announced
    let announces = !update.nlri.is_empty()
        || update
            .attrs
            .iter()
            .any(|a| matches!(a, PathAttribute::MpReachNlri(r) if !r.nlri.is_empty()));
    if announces && worst.is_none() {
        let has = |code| update.attrs.iter().any(|a| a.type_code() == code);
        let mut missing = None;
        if !has(attr_type_code::ORIGIN) {
            missing = Some(attr_type_code::ORIGIN);
        } else if !has(attr_type_code::AS_PATH) {
            missing = Some(attr_type_code::AS_PATH);
        } else if !update.nlri.is_empty() && !has(attr_type_code::NEXT_HOP) {
            missing = Some(attr_type_code::NEXT_HOP);
        }
        if let Some(code) = missing {
            worst = Some((
                ErrorClass::TreatAsWithdraw,
                NotificationMessage::update_error(
                    UpdateMessageError::MissingWellKnownAttribute,
                    vec![code],
                ),
            ));
        }
    }

    let Some((class, notification)) = worst else {
        return Ok(update);
    };
    let handling = match class {
        ErrorClass::SessionReset => UpdateErrorHandling::SessionReset,
        ErrorClass::AfiSafiDisable => match disabled_family {
            Some(family) => UpdateErrorHandling::AfiSafiDisable { family },
            None => UpdateErrorHandling::SessionReset,
        },
        ErrorClass::TreatAsWithdraw => {
            let mut withdrawn = update.withdrawn_all();
            withdrawn.extend(update.announced().into_iter().map(|(e, _)| e));
            UpdateErrorHandling::TreatAsWithdraw { withdrawn }
        }
        ErrorClass::AttributeDiscard => UpdateErrorHandling::AttributeDiscard { update },
    };
    Err(DecodeError::Body {
        notification,
        handling,
    })
}

fn encode_as_path(out: &mut Vec<u8>, segments: &[AsPathSegment], four_octet: bool) {
    for segment in segments {
        // segments longer than 255 are split
        for chunk in segment.asn_list.chunks(255) {
            out.push(segment.segment_type as u8);
            out.push(chunk.len() as u8);
            for asn in chunk {
                if four_octet {
                    out.extend_from_slice(&asn.to_be_bytes());
                } else {
                    let wire = if *asn > u16::MAX as u32 { AS_TRANS } else { *asn };
                    out.extend_from_slice(&(wire as u16).to_be_bytes());
                }
            }
        }
    }
}

fn encode_next_hops(out: &mut Vec<u8>, family: AfiSafi, hops: &[IpAddr]) {
    let mut raw = Vec::new();
    if family.is_vpn() {
        raw.extend_from_slice(&[0u8; 8]);
    }
    for hop in hops {
        match hop {
            IpAddr::V4(a) => raw.extend_from_slice(&a.octets()),
            IpAddr::V6(a) => raw.extend_from_slice(&a.octets()),
        }
    }
    out.push(raw.len() as u8);
    out.extend_from_slice(&raw);
}

fn encode_attr(out: &mut Vec<u8>, ctx: &CodecContext, attr: &PathAttribute) {
    let mut val = Vec::new();
    match attr {
        PathAttribute::Origin(o) => val.push(*o as u8),
        PathAttribute::AsPath(segments) => encode_as_path(&mut val, segments, ctx.four_octet_as),
        PathAttribute::NextHop(nh) => val.extend_from_slice(&nh.octets()),
        PathAttribute::MultiExitDisc(v) | PathAttribute::LocalPref(v) => {
            val.extend_from_slice(&v.to_be_bytes())
        }
        PathAttribute::AtomicAggregate => {}
        PathAttribute::Aggregator { asn, address } => {
            if ctx.four_octet_as {
                val.extend_from_slice(&asn.to_be_bytes());
            } else {
                let wire = if *asn > u16::MAX as u32 { AS_TRANS } else { *asn };
                val.extend_from_slice(&(wire as u16).to_be_bytes());
            }
            val.extend_from_slice(&address.octets());
        }
        PathAttribute::Communities(list) => {
            for c in list {
                val.extend_from_slice(&c.to_be_bytes());
            }
        }
        PathAttribute::OriginatorId(id) => val.extend_from_slice(&id.octets()),
        PathAttribute::ClusterList(list) => {
            for id in list {
                val.extend_from_slice(&id.octets());
            }
        }
        PathAttribute::MpReachNlri(reach) => {
            val.extend_from_slice(&(reach.afi_safi.afi as u16).to_be_bytes());
            val.push(reach.afi_safi.safi as u8);
            encode_next_hops(&mut val, reach.afi_safi, &reach.next_hop);
            val.push(0);
            let add_path = ctx.add_path_tx.contains(&reach.afi_safi);
            for entry in &reach.nlri {
                encode_nlri(&mut val, entry, add_path);
            }
        }
        PathAttribute::MpUnreachNlri(unreach) => {
            val.extend_from_slice(&(unreach.afi_safi.afi as u16).to_be_bytes());
            val.push(unreach.afi_safi.safi as u8);
            let add_path = ctx.add_path_tx.contains(&unreach.afi_safi);
            for entry in &unreach.withdrawn {
                encode_nlri(&mut val, entry, add_path);
            }
        }
        PathAttribute::ExtendedCommunities(list) => {
            for c in list {
                val.extend_from_slice(&c.to_be_bytes());
            }
        }
        PathAttribute::Unknown(u) => val.extend_from_slice(&u.value),
    }

    let mut flags = attr.flags();
    // Unrecognised transitive attributes we pass on are marked partial
    if let PathAttribute::Unknown(u) = attr {
        if u.is_transitive() {
            flags |= attr_flags::PARTIAL;
        }
    }
    if val.len() > u8::MAX as usize {
        flags |= attr_flags::EXTENDED_LENGTH;
    }
    out.extend_from_slice(&attr_data(flags, attr.type_code(), &val));
}

fn encode_update(body: &mut Vec<u8>, ctx: &CodecContext, update: &UpdateMessage) {
    let add_path_v4 = ctx.add_path_tx.contains(&AfiSafi::IPV4_UNICAST);

    let mut withdrawn = Vec::new();
    for entry in &update.withdrawn {
        encode_nlri(&mut withdrawn, entry, add_path_v4);
    }
    body.extend_from_slice(&(withdrawn.len() as u16).to_be_bytes());
    body.extend_from_slice(&withdrawn);

    let mut attrs = Vec::new();
    for attr in &update.attrs {
        encode_attr(&mut attrs, ctx, attr);
    }
    body.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
    body.extend_from_slice(&attrs);

    for entry in &update.nlri {
        encode_nlri(body, entry, add_path_v4);
    }
}
