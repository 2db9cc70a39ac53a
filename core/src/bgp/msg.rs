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

use super::attr::{MpUnreach, PathAttribute};
use super::capability::Capability;
use super::family::AfiSafi;
use super::nlri::NlriEntry;
use super::notification::{BgpError, MessageHeaderError, NotificationMessage};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const BGP_HEADER_SIZE_BYTES: usize = 19;
pub const MAX_MESSAGE_SIZE: u16 = 4096;
pub const BGP_VERSION: u8 = 4;

// BGP header marker (16 bytes of 0xFF)
pub const BGP_MARKER: [u8; 16] = [0xff; 16];

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Open = 1,
    Update = 2,
    Notification = 3,
    Keepalive = 4,
    RouteRefresh = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Open),
            2 => Ok(MessageType::Update),
            3 => Ok(MessageType::Notification),
            4 => Ok(MessageType::Keepalive),
            5 => Ok(MessageType::RouteRefresh),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMessage {
    pub version: u8,
    /// Effective AS: the four-octet capability value when present.
    pub asn: u32,
    pub hold_time: u16,
    pub router_id: Ipv4Addr,
    pub capabilities: Vec<Capability>,
}

impl OpenMessage {
    pub fn new(asn: u32, hold_time: u16, router_id: Ipv4Addr, capabilities: Vec<Capability>) -> Self {
        OpenMessage {
            version: BGP_VERSION,
            asn,
            hold_time,
            router_id,
            capabilities,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateMessage {
    /// IPv4 unicast withdrawals from the fixed withdrawn-routes field.
    pub withdrawn: Vec<NlriEntry>,
    pub attrs: Vec<PathAttribute>,
    /// IPv4 unicast NLRI from the trailing field.
    pub nlri: Vec<NlriEntry>,
}

impl UpdateMessage {
    pub fn end_of_rib(family: AfiSafi) -> Self {
        if family == AfiSafi::IPV4_UNICAST {
            return UpdateMessage::default();
        }
        UpdateMessage {
            attrs: vec![PathAttribute::MpUnreachNlri(MpUnreach {
                afi_safi: family,
                withdrawn: Vec::new(),
            })],
            ..Default::default()
        }
    }

    /// The family this UPDATE marks as complete, if it is an End-of-RIB
    /// marker (RFC 4724 section 2).
    pub fn end_of_rib_family(&self) -> Option<AfiSafi> {
        if !self.withdrawn.is_empty() || !self.nlri.is_empty() {
            return None;
        }
        match self.attrs.as_slice() {
            [] => Some(AfiSafi::IPV4_UNICAST),
            [PathAttribute::MpUnreachNlri(unreach)] if unreach.withdrawn.is_empty() => {
                Some(unreach.afi_safi)
            }
            _ => None,
        }
    }

    /// Every announced NLRI, classic and multiprotocol, with its next hop.
    pub fn announced(&self) -> Vec<(NlriEntry, Option<IpAddr>)> {
        let classic_nh = self.attrs.iter().find_map(|a| match a {
            PathAttribute::NextHop(nh) => Some(IpAddr::V4(*nh)),
            _ => None,
        });
        let mut out: Vec<_> = self.nlri.iter().map(|e| (*e, classic_nh)).collect();
        for attr in &self.attrs {
            if let PathAttribute::MpReachNlri(reach) = attr {
                let nh = reach.next_hop.first().copied();
                out.extend(reach.nlri.iter().map(|e| (*e, nh)));
            }
        }
        out
    }

    pub fn withdrawn_all(&self) -> Vec<NlriEntry> {
        let mut out = self.withdrawn.clone();
        for attr in &self.attrs {
            if let PathAttribute::MpUnreachNlri(unreach) = attr {
                out.extend(unreach.withdrawn.iter().copied());
            }
        }
        out
    }

    /// Path attributes other than the multiprotocol reach/unreach carriers.
    pub fn path_attrs(&self) -> impl Iterator<Item = &PathAttribute> {
        self.attrs.iter().filter(|a| {
            !matches!(
                a,
                PathAttribute::MpReachNlri(_) | PathAttribute::MpUnreachNlri(_)
            )
        })
    }
}

/// ROUTE-REFRESH (RFC 2918). The family is kept raw so a request for a
/// family we do not support can be logged and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteRefreshMessage {
    pub afi: u16,
    pub safi: u8,
}

impl RouteRefreshMessage {
    pub fn new(family: AfiSafi) -> Self {
        RouteRefreshMessage {
            afi: family.afi as u16,
            safi: family.safi as u8,
        }
    }

    pub fn afi_safi(&self) -> Option<AfiSafi> {
        AfiSafi::from_wire(self.afi, self.safi)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BgpMessage {
    Open(OpenMessage),
    Update(UpdateMessage),
    Notification(NotificationMessage),
    Keepalive,
    RouteRefresh(RouteRefreshMessage),
}

impl BgpMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            BgpMessage::Open(_) => MessageType::Open,
            BgpMessage::Update(_) => MessageType::Update,
            BgpMessage::Notification(_) => MessageType::Notification,
            BgpMessage::Keepalive => MessageType::Keepalive,
            BgpMessage::RouteRefresh(_) => MessageType::RouteRefresh,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub length: u16,
    pub message_type: MessageType,
}

impl MessageHeader {
    pub fn body_len(&self) -> usize {
        self.length as usize - BGP_HEADER_SIZE_BYTES
    }
}

fn bad_length(length: u16) -> NotificationMessage {
    NotificationMessage::new(
        BgpError::MessageHeader(MessageHeaderError::BadMessageLength),
        length.to_be_bytes().to_vec(),
    )
}

/// Validate the fixed header (RFC 4271 section 6.1).
pub fn parse_header(
    header: &[u8; BGP_HEADER_SIZE_BYTES],
) -> Result<MessageHeader, NotificationMessage> {
    if header[0..16] != BGP_MARKER {
        return Err(NotificationMessage::new(
            BgpError::MessageHeader(MessageHeaderError::ConnectionNotSynchronized),
            Vec::new(),
        ));
    }
    let length = u16::from_be_bytes([header[16], header[17]]);
    let message_type = MessageType::try_from(header[18]).map_err(|t| {
        NotificationMessage::new(
            BgpError::MessageHeader(MessageHeaderError::BadMessageType),
            vec![t],
        )
    })?;

    if length < BGP_HEADER_SIZE_BYTES as u16 || length > MAX_MESSAGE_SIZE {
        return Err(bad_length(length));
    }
    let ok = match message_type {
        MessageType::Open => length >= 29,
        MessageType::Update => length >= 23,
        MessageType::Notification => length >= 21,
        MessageType::Keepalive => length == BGP_HEADER_SIZE_BYTES as u16,
        MessageType::RouteRefresh => length == 23,
    };
    if !ok {
        return Err(bad_length(length));
    }
    Ok(MessageHeader {
        length,
        message_type,
    })
}

#[derive(Debug)]
pub enum FrameError {
    Io(io::Error),
    Header(NotificationMessage),
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        FrameError::Io(err)
    }
}

/// Read one framed message and return its validated header and body.
pub async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<(MessageHeader, Vec<u8>), FrameError> {
    let mut header_buffer = [0u8; BGP_HEADER_SIZE_BYTES];
    stream.read_exact(&mut header_buffer).await?;
    let header = parse_header(&header_buffer).map_err(FrameError::Header)?;

    let mut body = vec![0u8; header.body_len()];
    if !body.is_empty() {
        stream.read_exact(&mut body).await?;
    }
    Ok((header, body))
}

/// Prepend the fixed header to a message body.
pub fn frame(message_type: MessageType, body: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(BGP_HEADER_SIZE_BYTES + body.len());
    message.extend_from_slice(&BGP_MARKER);
    let length = (BGP_HEADER_SIZE_BYTES + body.len()) as u16;
    message.extend_from_slice(&length.to_be_bytes());
    message.push(message_type as u8);
    message.extend_from_slice(body);
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::nlri::Nlri;
    use std::io::Cursor;

    const MOCK_OPEN_MESSAGE: &[u8] = &[
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x00, 0x1d, // Message length (29 bytes)
        0x01, // Message type (Open)
        0x04, // Version
        0x04, 0xd2, // ASN
        0x00, 0x0a, // Hold time
        0x0a, 0x0a, 0x0a, 0x0a, // BGP identifier
        0x00, // Optional parameters length
    ];

    #[tokio::test]
    async fn test_read_frame() {
        let mut stream = Cursor::new(MOCK_OPEN_MESSAGE);
        let (header, body) = read_frame(&mut stream).await.unwrap();
        assert_eq!(header.message_type, MessageType::Open);
        assert_eq!(header.length, 29);
        assert_eq!(body.len(), 10);
    }

    #[tokio::test]
    async fn test_read_frame_truncated_is_io_error() {
        let mut stream = Cursor::new(&MOCK_OPEN_MESSAGE[..25]);
        assert!(matches!(
            read_frame(&mut stream).await,
            Err(FrameError::Io(_))
        ));
    }

    #[test]
    fn test_parse_header_errors() {
        let header = |marker: u8, len: u16, t: u8| {
            let mut h = [marker; BGP_HEADER_SIZE_BYTES];
            h[16..18].copy_from_slice(&len.to_be_bytes());
            h[18] = t;
            h
        };
        let cases = [
            (header(0x00, 19, 4), MessageHeaderError::ConnectionNotSynchronized),
            (header(0xff, 18, 4), MessageHeaderError::BadMessageLength),
            (header(0xff, 4097, 2), MessageHeaderError::BadMessageLength),
            (header(0xff, 20, 4), MessageHeaderError::BadMessageLength),
            (header(0xff, 22, 5), MessageHeaderError::BadMessageLength),
            (header(0xff, 19, 9), MessageHeaderError::BadMessageType),
        ];
        for (h, expected) in cases {
            let err = parse_header(&h).unwrap_err();
            assert_eq!(err.error, BgpError::MessageHeader(expected));
        }
        assert!(parse_header(&header(0xff, 19, 4)).is_ok());
    }

    #[test]
    fn test_end_of_rib_detection() {
        assert_eq!(
            UpdateMessage::default().end_of_rib_family(),
            Some(AfiSafi::IPV4_UNICAST)
        );
        assert_eq!(
            UpdateMessage::end_of_rib(AfiSafi::IPV6_UNICAST).end_of_rib_family(),
            Some(AfiSafi::IPV6_UNICAST)
        );
        let withdraw = UpdateMessage {
            withdrawn: vec![NlriEntry::new(Nlri::Unicast("10.0.0.0/24".parse().unwrap()))],
            ..Default::default()
        };
        assert_eq!(withdraw.end_of_rib_family(), None);
    }
}
