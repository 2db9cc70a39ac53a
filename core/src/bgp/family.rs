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

//! Address family identifiers (RFC 4760).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Afi {
    Ipv4 = 1,
    Ipv6 = 2,
}

impl TryFrom<u16> for Afi {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Afi::Ipv4),
            2 => Ok(Afi::Ipv6),
            other => Err(other),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Safi {
    Unicast = 1,
    MplsVpn = 128,
    RouteTargetConstraint = 132,
}

impl TryFrom<u8> for Safi {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Safi::Unicast),
            128 => Ok(Safi::MplsVpn),
            132 => Ok(Safi::RouteTargetConstraint),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AfiSafi {
    pub afi: Afi,
    pub safi: Safi,
}

impl AfiSafi {
    pub const IPV4_UNICAST: AfiSafi = AfiSafi::new(Afi::Ipv4, Safi::Unicast);
    pub const IPV6_UNICAST: AfiSafi = AfiSafi::new(Afi::Ipv6, Safi::Unicast);
    pub const IPV4_VPN: AfiSafi = AfiSafi::new(Afi::Ipv4, Safi::MplsVpn);
    pub const IPV6_VPN: AfiSafi = AfiSafi::new(Afi::Ipv6, Safi::MplsVpn);
    pub const RTC: AfiSafi = AfiSafi::new(Afi::Ipv4, Safi::RouteTargetConstraint);

    pub const fn new(afi: Afi, safi: Safi) -> Self {
        AfiSafi { afi, safi }
    }

    pub fn from_wire(afi: u16, safi: u8) -> Option<Self> {
        Some(AfiSafi::new(
            Afi::try_from(afi).ok()?,
            Safi::try_from(safi).ok()?,
        ))
    }

    pub fn is_vpn(&self) -> bool {
        self.safi == Safi::MplsVpn
    }

    /// Unicast family carried inside this VPN family, and vice versa.
    pub fn vpn_counterpart(&self) -> Option<AfiSafi> {
        match self.safi {
            Safi::Unicast => Some(AfiSafi::new(self.afi, Safi::MplsVpn)),
            Safi::MplsVpn => Some(AfiSafi::new(self.afi, Safi::Unicast)),
            Safi::RouteTargetConstraint => None,
        }
    }
}

impl fmt::Display for AfiSafi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match (self.afi, self.safi) {
            (Afi::Ipv4, Safi::Unicast) => "ipv4-unicast",
            (Afi::Ipv6, Safi::Unicast) => "ipv6-unicast",
            (Afi::Ipv4, Safi::MplsVpn) => "l3vpn-ipv4-unicast",
            (Afi::Ipv6, Safi::MplsVpn) => "l3vpn-ipv6-unicast",
            (Afi::Ipv4, Safi::RouteTargetConstraint) => "rtc",
            (Afi::Ipv6, Safi::RouteTargetConstraint) => "rtc-ipv6",
        };
        f.write_str(name)
    }
}

impl FromStr for AfiSafi {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ipv4-unicast" => Ok(AfiSafi::IPV4_UNICAST),
            "ipv6-unicast" => Ok(AfiSafi::IPV6_UNICAST),
            "l3vpn-ipv4-unicast" => Ok(AfiSafi::IPV4_VPN),
            "l3vpn-ipv6-unicast" => Ok(AfiSafi::IPV6_VPN),
            "rtc" => Ok(AfiSafi::RTC),
            other => Err(format!("unknown address family '{}'", other)),
        }
    }
}

impl TryFrom<String> for AfiSafi {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AfiSafi> for String {
    fn from(value: AfiSafi) -> Self {
        value.to_string()
    }
}
