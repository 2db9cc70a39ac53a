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

//! NOTIFICATION errors (RFC 4271 section 4.5, RFC 4486 Cease subcodes).

use crate::bgp::family::AfiSafi;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageHeaderError {
    ConnectionNotSynchronized,
    BadMessageLength,
    BadMessageType,
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMessageError {
    UnsupportedVersionNumber,
    BadPeerAs,
    BadBgpIdentifier,
    UnsupportedOptionalParameter,
    UnacceptableHoldTime,
    UnsupportedCapability,
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMessageError {
    MalformedAttributeList,
    UnrecognizedWellKnownAttribute,
    MissingWellKnownAttribute,
    AttributeFlagsError,
    AttributeLengthError,
    InvalidOriginAttribute,
    InvalidNextHopAttribute,
    OptionalAttributeError,
    InvalidNetworkField,
    MalformedAsPath,
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CeaseSubcode {
    MaxPrefixesReached,
    AdministrativeShutdown,
    PeerDeconfigured,
    AdministrativeReset,
    ConnectionRejected,
    OtherConfigurationChange,
    ConnectionCollisionResolution,
    OutOfResources,
    HardReset,
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BgpError {
    MessageHeader(MessageHeaderError),
    OpenMessage(OpenMessageError),
    UpdateMessage(UpdateMessageError),
    HoldTimerExpired,
    FiniteStateMachine,
    Cease(CeaseSubcode),
    Other { code: u8, subcode: u8 },
}

impl BgpError {
    pub fn from_codes(code: u8, subcode: u8) -> BgpError {
        match code {
            1 => BgpError::MessageHeader(match subcode {
                1 => MessageHeaderError::ConnectionNotSynchronized,
                2 => MessageHeaderError::BadMessageLength,
                3 => MessageHeaderError::BadMessageType,
                v => MessageHeaderError::Other(v),
            }),
            2 => BgpError::OpenMessage(match subcode {
                1 => OpenMessageError::UnsupportedVersionNumber,
                2 => OpenMessageError::BadPeerAs,
                3 => OpenMessageError::BadBgpIdentifier,
                4 => OpenMessageError::UnsupportedOptionalParameter,
                6 => OpenMessageError::UnacceptableHoldTime,
                7 => OpenMessageError::UnsupportedCapability,
                v => OpenMessageError::Other(v),
            }),
            3 => BgpError::UpdateMessage(match subcode {
                1 => UpdateMessageError::MalformedAttributeList,
                2 => UpdateMessageError::UnrecognizedWellKnownAttribute,
                3 => UpdateMessageError::MissingWellKnownAttribute,
                4 => UpdateMessageError::AttributeFlagsError,
                5 => UpdateMessageError::AttributeLengthError,
                6 => UpdateMessageError::InvalidOriginAttribute,
                8 => UpdateMessageError::InvalidNextHopAttribute,
                9 => UpdateMessageError::OptionalAttributeError,
                10 => UpdateMessageError::InvalidNetworkField,
                11 => UpdateMessageError::MalformedAsPath,
                v => UpdateMessageError::Other(v),
            }),
            4 => BgpError::HoldTimerExpired,
            5 => BgpError::FiniteStateMachine,
            6 => BgpError::Cease(match subcode {
                1 => CeaseSubcode::MaxPrefixesReached,
                2 => CeaseSubcode::AdministrativeShutdown,
                3 => CeaseSubcode::PeerDeconfigured,
                4 => CeaseSubcode::AdministrativeReset,
                5 => CeaseSubcode::ConnectionRejected,
                6 => CeaseSubcode::OtherConfigurationChange,
                7 => CeaseSubcode::ConnectionCollisionResolution,
                8 => CeaseSubcode::OutOfResources,
                9 => CeaseSubcode::HardReset,
                v => CeaseSubcode::Other(v),
            }),
            _ => BgpError::Other { code, subcode },
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            BgpError::MessageHeader(_) => 1,
            BgpError::OpenMessage(_) => 2,
            BgpError::UpdateMessage(_) => 3,
            BgpError::HoldTimerExpired => 4,
            BgpError::FiniteStateMachine => 5,
            BgpError::Cease(_) => 6,
            BgpError::Other { code, .. } => *code,
        }
    }

    pub fn subcode(&self) -> u8 {
        match self {
            BgpError::MessageHeader(e) => match e {
                MessageHeaderError::ConnectionNotSynchronized => 1,
                MessageHeaderError::BadMessageLength => 2,
                MessageHeaderError::BadMessageType => 3,
                MessageHeaderError::Other(v) => *v,
            },
            BgpError::OpenMessage(e) => match e {
                OpenMessageError::UnsupportedVersionNumber => 1,
                OpenMessageError::BadPeerAs => 2,
                OpenMessageError::BadBgpIdentifier => 3,
                OpenMessageError::UnsupportedOptionalParameter => 4,
                OpenMessageError::UnacceptableHoldTime => 6,
                OpenMessageError::UnsupportedCapability => 7,
                OpenMessageError::Other(v) => *v,
            },
            BgpError::UpdateMessage(e) => match e {
                UpdateMessageError::MalformedAttributeList => 1,
                UpdateMessageError::UnrecognizedWellKnownAttribute => 2,
                UpdateMessageError::MissingWellKnownAttribute => 3,
                UpdateMessageError::AttributeFlagsError => 4,
                UpdateMessageError::AttributeLengthError => 5,
                UpdateMessageError::InvalidOriginAttribute => 6,
                UpdateMessageError::InvalidNextHopAttribute => 8,
                UpdateMessageError::OptionalAttributeError => 9,
                UpdateMessageError::InvalidNetworkField => 10,
                UpdateMessageError::MalformedAsPath => 11,
                UpdateMessageError::Other(v) => *v,
            },
            BgpError::Cease(s) => match s {
                CeaseSubcode::MaxPrefixesReached => 1,
                CeaseSubcode::AdministrativeShutdown => 2,
                CeaseSubcode::PeerDeconfigured => 3,
                CeaseSubcode::AdministrativeReset => 4,
                CeaseSubcode::ConnectionRejected => 5,
                CeaseSubcode::OtherConfigurationChange => 6,
                CeaseSubcode::ConnectionCollisionResolution => 7,
                CeaseSubcode::OutOfResources => 8,
                CeaseSubcode::HardReset => 9,
                CeaseSubcode::Other(v) => *v,
            },
            BgpError::HoldTimerExpired | BgpError::FiniteStateMachine => 0,
            BgpError::Other { subcode, .. } => *subcode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage {
    pub error: BgpError,
    pub data: Vec<u8>,
}

impl NotificationMessage {
    pub fn new(error: BgpError, data: Vec<u8>) -> Self {
        NotificationMessage { error, data }
    }

    pub fn cease(subcode: CeaseSubcode) -> Self {
        NotificationMessage::new(BgpError::Cease(subcode), Vec::new())
    }

    /// RFC 4486 4: the data names the family and its configured upper bound.
    pub fn max_prefixes_reached(family: AfiSafi, limit: u32) -> Self {
        let mut data = Vec::with_capacity(7);
        data.extend_from_slice(&(family.afi as u16).to_be_bytes());
        data.push(family.safi as u8);
        data.extend_from_slice(&limit.to_be_bytes());
        NotificationMessage::new(BgpError::Cease(CeaseSubcode::MaxPrefixesReached), data)
    }

    pub fn hold_timer_expired() -> Self {
        NotificationMessage::new(BgpError::HoldTimerExpired, Vec::new())
    }

    pub fn fsm_error() -> Self {
        NotificationMessage::new(BgpError::FiniteStateMachine, Vec::new())
    }

    pub fn update_error(e: UpdateMessageError, data: Vec<u8>) -> Self {
        NotificationMessage::new(BgpError::UpdateMessage(e), data)
    }

    pub fn open_error(e: OpenMessageError, data: Vec<u8>) -> Self {
        NotificationMessage::new(BgpError::OpenMessage(e), data)
    }
}

impl fmt::Display for NotificationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} (code {}, subcode {})",
            self.error,
            self.error.code(),
            self.error.subcode()
        )
    }
}
