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

//! Route origin validation (RFC 6811) against a static ROA list.

use crate::bgp::attr::{AsPathSegment, AsPathSegmentType};
use crate::config::RoaConfig;
use crate::net::IpNetwork;
use crate::rib::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RpkiVerdict {
    #[default]
    NotFound,
    Valid,
    Invalid,
}

impl std::str::FromStr for RpkiVerdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid" => Ok(RpkiVerdict::Valid),
            "invalid" => Ok(RpkiVerdict::Invalid),
            "not-found" => Ok(RpkiVerdict::NotFound),
            other => Err(format!("unknown rpki state '{}'", other)),
        }
    }
}

pub trait RpkiValidator: Send + Sync {
    fn validate(&self, path: &Path) -> RpkiVerdict;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roa {
    pub prefix: IpNetwork,
    pub max_length: u8,
    pub asn: u32,
}

impl TryFrom<&RoaConfig> for Roa {
    type Error = String;

    fn try_from(config: &RoaConfig) -> Result<Self, Self::Error> {
        let prefix: IpNetwork = config.prefix.parse()?;
        if config.max_length < prefix.prefix_len() {
            return Err(format!(
                "roa {}: max length {} shorter than prefix",
                config.prefix, config.max_length
            ));
        }
        Ok(Roa {
            prefix,
            max_length: config.max_length,
            asn: config.asn,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoaTable {
    local_asn: u32,
    roas: Vec<Roa>,
}

/// Origin AS per RFC 6811: the last AS of a trailing AS_SEQUENCE, none when
/// the path ends in an AS_SET.
fn origin_as(as_path: &[AsPathSegment], local_asn: u32) -> Option<u32> {
    match as_path.last() {
        None => Some(local_asn),
        Some(seg) if seg.segment_type == AsPathSegmentType::AsSequence => {
            seg.asn_list.last().copied()
        }
        Some(_) => None,
    }
}

impl RoaTable {
    pub fn new(local_asn: u32, roas: Vec<Roa>) -> Self {
        RoaTable { local_asn, roas }
    }

    pub fn from_config(local_asn: u32, roas: &[RoaConfig]) -> Result<Self, String> {
        let roas = roas.iter().map(Roa::try_from).collect::<Result<_, _>>()?;
        Ok(RoaTable::new(local_asn, roas))
    }

    pub fn replace(&mut self, roas: Vec<Roa>) {
        self.roas = roas;
    }

    pub fn len(&self) -> usize {
        self.roas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roas.is_empty()
    }

    pub fn validate_origin(&self, prefix: &IpNetwork, origin: Option<u32>) -> RpkiVerdict {
        let mut covered = false;
        for roa in self.roas.iter().filter(|r| r.prefix.contains(prefix)) {
            covered = true;
            if Some(roa.asn) == origin && roa.asn != 0 && prefix.prefix_len() <= roa.max_length {
                return RpkiVerdict::Valid;
            }
        }
        if covered {
            RpkiVerdict::Invalid
        } else {
            RpkiVerdict::NotFound
        }
    }
}

impl RpkiValidator for RoaTable {
    fn validate(&self, path: &Path) -> RpkiVerdict {
        match path.nlri.prefix() {
            Some(prefix) => {
                self.validate_origin(&prefix, origin_as(&path.attrs.as_path, self.local_asn))
            }
            None => RpkiVerdict::NotFound,
        }
    }
}
