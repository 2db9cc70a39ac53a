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

use crate::bgp::attr::parse_route_target;
use crate::bgp::family::AfiSafi;
use crate::bgp::nlri::RouteDistinguisher;
use crate::net::{parse_sockaddr, IpNetwork, BGP_PORT};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Prefix limit for one address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PrefixLimitConfig {
    pub max_prefixes: u32,
    /// Warn once when the count reaches this percentage of the limit.
    #[serde(default = "default_shutdown_threshold_pct")]
    pub shutdown_threshold_pct: u8,
}

fn default_shutdown_threshold_pct() -> u8 {
    90
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AddPathConfig {
    #[serde(default)]
    pub receive: bool,
    #[serde(default)]
    pub send: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AfiSafiConfig {
    pub afi_safi: AfiSafi,
    #[serde(default)]
    pub prefix_limit: Option<PrefixLimitConfig>,
    #[serde(default)]
    pub add_path: AddPathConfig,
    /// Long-lived graceful restart stale time (RFC 9494). None disables LLGR.
    #[serde(default)]
    pub llgr_stale_time_secs: Option<u32>,
}

impl AfiSafiConfig {
    pub fn new(afi_safi: AfiSafi) -> Self {
        AfiSafiConfig {
            afi_safi,
            prefix_limit: None,
            add_path: AddPathConfig::default(),
            llgr_stale_time_secs: None,
        }
    }
}

fn default_afi_safis() -> Vec<AfiSafiConfig> {
    vec![AfiSafiConfig::new(AfiSafi::IPV4_UNICAST)]
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GracefulRestartConfig {
    /// Restart time advertised to the peer.
    #[serde(default = "default_restart_time")]
    pub restart_time_secs: u16,
    /// Advertise the restarting (R) bit and defer the initial flush until the
    /// peer's End-of-RIB or the deferral timer.
    #[serde(default)]
    pub restarting: bool,
    #[serde(default = "default_deferral_time")]
    pub deferral_time_secs: u64,
    /// After the peer is back, how long its stale paths wait for End-of-RIB.
    #[serde(default = "default_stale_path_time")]
    pub stale_path_time_secs: u64,
}

fn default_restart_time() -> u16 {
    120
}

fn default_deferral_time() -> u64 {
    360
}

pub(crate) fn default_stale_path_time() -> u64 {
    360
}

impl Default for GracefulRestartConfig {
    fn default() -> Self {
        GracefulRestartConfig {
            restart_time_secs: default_restart_time(),
            restarting: false,
            deferral_time_secs: default_deferral_time(),
            stale_path_time_secs: default_stale_path_time(),
        }
    }
}

/// Neighbor configuration. Immutable for the lifetime of a session; replaced
/// wholesale by an update-neighbor operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub address: IpAddr,
    /// Remote AS. Zero accepts whatever AS the peer announces.
    #[serde(default)]
    pub asn: u32,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub peer_group: Option<String>,
    #[serde(default)]
    pub passive_mode: bool,
    #[serde(default)]
    pub admin_down: bool,
    #[serde(default)]
    pub hold_time_secs: Option<u16>,
    #[serde(default)]
    pub connect_retry_secs: Option<u64>,
    #[serde(default)]
    pub idle_hold_time_secs: Option<u64>,
    #[serde(default)]
    pub route_server_client: bool,
    #[serde(default)]
    pub route_reflector_client: bool,
    /// How many times our own AS may appear in a received AS path.
    #[serde(default)]
    pub allow_own_as: u8,
    #[serde(default = "default_afi_safis")]
    pub afi_safis: Vec<AfiSafiConfig>,
    #[serde(default)]
    pub graceful_restart: Option<GracefulRestartConfig>,
    /// Maximum hop count for GTSM (RFC 5082).
    #[serde(default)]
    pub ttl_security: Option<u8>,
    #[serde(default)]
    pub md5_password: Option<String>,
    #[serde(default, rename = "import-policy")]
    pub import_policy: Vec<String>,
    #[serde(default, rename = "export-policy")]
    pub export_policy: Vec<String>,
    #[serde(default)]
    pub vrf: Option<String>,
    /// Revised UPDATE error handling (RFC 7606). When false every malformed
    /// UPDATE resets the session.
    #[serde(default = "default_true")]
    pub treat_as_withdraw: bool,
    #[serde(default)]
    pub local_address: Option<IpAddr>,
}

fn default_port() -> u16 {
    BGP_PORT
}

fn default_true() -> bool {
    true
}

impl PeerConfig {
    pub fn new(address: IpAddr, asn: u32) -> Self {
        PeerConfig {
            address,
            asn,
            port: default_port(),
            peer_group: None,
            passive_mode: false,
            admin_down: false,
            hold_time_secs: None,
            connect_retry_secs: None,
            idle_hold_time_secs: None,
            route_server_client: false,
            route_reflector_client: false,
            allow_own_as: 0,
            afi_safis: default_afi_safis(),
            graceful_restart: None,
            ttl_security: None,
            md5_password: None,
            import_policy: Vec::new(),
            export_policy: Vec::new(),
            vrf: None,
            treat_as_withdraw: true,
            local_address: None,
        }
    }

    /// Peer created from a group's dynamic-neighbor range.
    pub fn dynamic(address: IpAddr, group: &PeerGroupConfig) -> Self {
        let mut peer = PeerConfig::new(address, group.asn.unwrap_or(0));
        peer.peer_group = Some(group.name.clone());
        // Dynamic peers never dial out
        peer.passive_mode = true;
        peer.inherit(group);
        peer
    }

    /// Fill unset fields from the peer group. Flags set on either side stay
    /// set.
    pub fn inherit(&mut self, group: &PeerGroupConfig) {
        if self.asn == 0 {
            self.asn = group.asn.unwrap_or(0);
        }
        self.passive_mode |= group.passive_mode;
        self.route_server_client |= group.route_server_client;
        self.route_reflector_client |= group.route_reflector_client;
        self.hold_time_secs = self.hold_time_secs.or(group.hold_time_secs);
        if let Some(afi_safis) = &group.afi_safis {
            if self.afi_safis == default_afi_safis() {
                self.afi_safis = afi_safis.clone();
            }
        }
        if self.graceful_restart.is_none() {
            self.graceful_restart = group.graceful_restart.clone();
        }
        if self.import_policy.is_empty() {
            self.import_policy = group.import_policy.clone();
        }
        if self.export_policy.is_empty() {
            self.export_policy = group.export_policy.clone();
        }
        if self.md5_password.is_none() {
            self.md5_password = group.md5_password.clone();
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn families(&self) -> Vec<AfiSafi> {
        self.afi_safis.iter().map(|c| c.afi_safi).collect()
    }

    pub fn afi_safi(&self, family: AfiSafi) -> Option<&AfiSafiConfig> {
        self.afi_safis.iter().find(|c| c.afi_safi == family)
    }

    pub fn hold_time(&self, global: &Config) -> u16 {
        self.hold_time_secs.unwrap_or(global.hold_time_secs)
    }

    pub fn connect_retry(&self, global: &Config) -> Duration {
        Duration::from_secs(self.connect_retry_secs.unwrap_or(global.connect_retry_secs))
    }

    pub fn idle_hold(&self, global: &Config) -> Duration {
        Duration::from_secs(self.idle_hold_time_secs.unwrap_or(global.idle_hold_time_secs))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerGroupConfig {
    pub name: String,
    #[serde(default)]
    pub asn: Option<u32>,
    #[serde(default)]
    pub passive_mode: bool,
    #[serde(default)]
    pub route_server_client: bool,
    #[serde(default)]
    pub route_reflector_client: bool,
    #[serde(default)]
    pub hold_time_secs: Option<u16>,
    #[serde(default)]
    pub afi_safis: Option<Vec<AfiSafiConfig>>,
    #[serde(default)]
    pub graceful_restart: Option<GracefulRestartConfig>,
    #[serde(default)]
    pub md5_password: Option<String>,
    #[serde(default, rename = "import-policy")]
    pub import_policy: Vec<String>,
    #[serde(default, rename = "export-policy")]
    pub export_policy: Vec<String>,
    /// CIDR ranges whose connections create peers in this group.
    #[serde(default)]
    pub dynamic_neighbors: Vec<String>,
}

impl PeerGroupConfig {
    pub fn dynamic_ranges(&self) -> Result<Vec<IpNetwork>, String> {
        self.dynamic_neighbors.iter().map(|s| s.parse()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfConfig {
    pub name: String,
    pub rd: String,
    #[serde(default)]
    pub import_rt: Vec<String>,
    #[serde(default)]
    pub export_rt: Vec<String>,
}

/// A VRF with its route distinguisher and route targets parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vrf {
    pub name: String,
    pub rd: RouteDistinguisher,
    pub import_rt: BTreeSet<u64>,
    pub export_rt: Vec<u64>,
}

impl VrfConfig {
    pub fn resolve(&self) -> Result<Vrf, String> {
        Ok(Vrf {
            name: self.name.clone(),
            rd: self.rd.parse()?,
            import_rt: self
                .import_rt
                .iter()
                .map(|s| parse_route_target(s))
                .collect::<Result<_, _>>()?,
            export_rt: self
                .export_rt
                .iter()
                .map(|s| parse_route_target(s))
                .collect::<Result<_, _>>()?,
        })
    }
}

/// Named policy: statements are evaluated in order and the first match
/// decides.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PolicyDefinitionConfig {
    pub name: String,
    pub statements: Vec<StatementConfig>,
    /// Result when no statement matches.
    #[serde(default = "default_true")]
    pub default_accept: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StatementConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub conditions: ConditionsConfig,
    #[serde(default)]
    pub actions: ActionsConfig,
}

/// Every present condition must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConditionsConfig {
    /// CIDR; matches that prefix and anything more specific up to `prefix-le`.
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub prefix_le: Option<u8>,
    #[serde(default)]
    pub neighbor: Option<IpAddr>,
    #[serde(default)]
    pub as_path_regex: Option<String>,
    #[serde(default)]
    pub community: Option<String>,
    /// "valid", "invalid" or "not-found"
    #[serde(default)]
    pub rpki: Option<String>,
    /// "ebgp", "ibgp" or "local"
    #[serde(default)]
    pub route_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ActionsConfig {
    #[serde(default)]
    pub reject: bool,
    #[serde(default)]
    pub local_pref: Option<u32>,
    #[serde(default)]
    pub med: Option<u32>,
    #[serde(default)]
    pub add_communities: Vec<String>,
    #[serde(default)]
    pub prepend: Option<PrependConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PrependConfig {
    pub asn: u32,
    #[serde(default = "default_prepend_count")]
    pub count: u8,
}

fn default_prepend_count() -> u8 {
    1
}

/// Static route origin authorization.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RoaConfig {
    pub prefix: String,
    pub max_length: u8,
    pub asn: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub asn: u32,
    pub router_id: Ipv4Addr,
    #[serde(default = "default_listen_addrs")]
    pub listen_addrs: Vec<String>,
    #[serde(default = "default_hold_time")]
    pub hold_time_secs: u16,
    #[serde(default = "default_connect_retry_time")]
    pub connect_retry_secs: u64,
    #[serde(default = "default_idle_hold_time")]
    pub idle_hold_time_secs: u64,
    /// Hold time used while waiting for the peer's OPEN.
    #[serde(default = "default_open_sent_hold_time")]
    pub open_sent_hold_time_secs: u16,
    /// Upper bound on joining a session's tasks during teardown.
    #[serde(default = "default_join_deadline")]
    pub join_deadline_secs: u64,
    /// How long VPN families wait for the peer's route-target End-of-RIB.
    #[serde(default = "default_rtc_deferral")]
    pub rtc_deferral_secs: u64,
    /// Route reflector cluster id. Defaults to the router id.
    #[serde(default)]
    pub cluster_id: Option<Ipv4Addr>,
    /// Log level: "error", "warn", "info" (default), "debug"
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub peer_groups: Vec<PeerGroupConfig>,
    #[serde(default)]
    pub vrfs: Vec<VrfConfig>,
    #[serde(default, rename = "policy-definitions")]
    pub policy_definitions: Vec<PolicyDefinitionConfig>,
    #[serde(default)]
    pub roas: Vec<RoaConfig>,
}

fn default_listen_addrs() -> Vec<String> {
    vec!["0.0.0.0:179".to_string()]
}

fn default_hold_time() -> u16 {
    180
}

fn default_connect_retry_time() -> u64 {
    30
}

fn default_idle_hold_time() -> u64 {
    5
}

fn default_open_sent_hold_time() -> u16 {
    240
}

fn default_join_deadline() -> u64 {
    180
}

fn default_rtc_deferral() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn new(asn: u32, router_id: Ipv4Addr, listen_addrs: Vec<String>) -> Self {
        Config {
            asn,
            router_id,
            listen_addrs,
            hold_time_secs: default_hold_time(),
            connect_retry_secs: default_connect_retry_time(),
            idle_hold_time_secs: default_idle_hold_time(),
            open_sent_hold_time_secs: default_open_sent_hold_time(),
            join_deadline_secs: default_join_deadline(),
            rtc_deferral_secs: default_rtc_deferral(),
            cluster_id: None,
            log_level: default_log_level(),
            peers: Vec::new(),
            peer_groups: Vec::new(),
            vrfs: Vec::new(),
            policy_definitions: Vec::new(),
            roas: Vec::new(),
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn cluster_id(&self) -> Ipv4Addr {
        self.cluster_id.unwrap_or(self.router_id)
    }

    pub fn join_deadline(&self) -> Duration {
        Duration::from_secs(self.join_deadline_secs)
    }

    pub fn listen_sockaddrs(&self) -> Result<Vec<SocketAddr>, String> {
        self.listen_addrs
            .iter()
            .map(|a| parse_sockaddr(a, BGP_PORT))
            .collect()
    }

    pub fn peer_group(&self, name: &str) -> Option<&PeerGroupConfig> {
        self.peer_groups.iter().find(|g| g.name == name)
    }

    /// Cross-reference checks serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.router_id.is_unspecified() {
            return Err("router_id must not be 0.0.0.0".to_string());
        }
        if self.asn == 0 {
            return Err("asn must not be 0".to_string());
        }
        self.listen_sockaddrs()?;

        let mut groups = HashSet::new();
        for group in &self.peer_groups {
            if !groups.insert(group.name.as_str()) {
                return Err(format!("duplicate peer group '{}'", group.name));
            }
            group.dynamic_ranges()?;
        }

        let mut vrfs = HashSet::new();
        for vrf in &self.vrfs {
            if !vrfs.insert(vrf.name.as_str()) {
                return Err(format!("duplicate vrf '{}'", vrf.name));
            }
            vrf.resolve()?;
        }

        let policies: HashSet<&str> = self
            .policy_definitions
            .iter()
            .map(|p| p.name.as_str())
            .collect();

        let mut addresses = HashSet::new();
        for peer in &self.peers {
            if !addresses.insert(peer.address) {
                return Err(format!("duplicate peer {}", peer.address));
            }
            if let Some(group) = &peer.peer_group {
                if !groups.contains(group.as_str()) {
                    return Err(format!(
                        "peer {} references unknown peer group '{}'",
                        peer.address, group
                    ));
                }
            }
            if let Some(vrf) = &peer.vrf {
                if !vrfs.contains(vrf.as_str()) {
                    return Err(format!("peer {} references unknown vrf '{}'", peer.address, vrf));
                }
            }
            for name in peer.import_policy.iter().chain(&peer.export_policy) {
                if !policies.contains(name.as_str()) {
                    return Err(format!(
                        "peer {} references unknown policy '{}'",
                        peer.address, name
                    ));
                }
            }
            let mut families = HashSet::new();
            for afi_safi in &peer.afi_safis {
                if !families.insert(afi_safi.afi_safi) {
                    return Err(format!(
                        "peer {} lists {} twice",
                        peer.address, afi_safi.afi_safi
                    ));
                }
            }
        }
        Ok(())
    }
}
