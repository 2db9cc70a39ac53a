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

//! Management operations. Every operation is a `MgmtOp` carrying a oneshot
//! for its result; the server loop handles them one at a time.

use crate::bgp::family::AfiSafi;
use crate::bgp::nlri::Nlri;
use crate::bgp::notification::{CeaseSubcode, NotificationMessage};
use crate::config::{PeerConfig, PeerGroupConfig, PolicyDefinitionConfig, RoaConfig, VrfConfig};
use crate::log::{info, warn};
use crate::net::IpNetwork;
use crate::peer::fsm::BgpState;
use crate::peer::session::{SessionCmd, SessionInfo};
use crate::peer::PeerStatistics;
use crate::rib::{Path, PathAttrs, PathSource, TableId};
use crate::rpki::Roa;
use crate::server::{vrf_export, BgpServer, ServerError, VrfEntry};
use crate::types::{AdminState, StateReason};
use crate::watch::{WatchEvent, WatchOptions, Watcher};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

type Reply<T> = oneshot::Sender<Result<T, ServerError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftResetDirection {
    /// Re-run the Adj-RIB-In through import policy.
    In,
    /// Resend the filtered tables to the neighbor.
    Out,
    Both,
}

/// Neighbor as reported by `list_neighbors`.
#[derive(Debug, Clone)]
pub struct NeighborStatus {
    pub config: PeerConfig,
    pub dynamic: bool,
    pub state: BgpState,
    pub admin: AdminState,
    pub last_reason: Option<StateReason>,
    pub session: Option<SessionInfo>,
    pub statistics: PeerStatistics,
    pub received: usize,
    pub stale_families: Vec<AfiSafi>,
}

pub enum MgmtOp {
    AddNeighbor {
        config: PeerConfig,
        response: Reply<()>,
    },
    UpdateNeighbor {
        config: PeerConfig,
        response: Reply<()>,
    },
    DeleteNeighbor {
        address: IpAddr,
        response: Reply<()>,
    },
    AddPeerGroup {
        group: PeerGroupConfig,
        response: Reply<()>,
    },
    UpdatePeerGroup {
        group: PeerGroupConfig,
        response: Reply<()>,
    },
    DeletePeerGroup {
        name: String,
        response: Reply<()>,
    },
    AddPolicy {
        definition: PolicyDefinitionConfig,
        response: Reply<()>,
    },
    DeletePolicy {
        name: String,
        response: Reply<()>,
    },
    AddVrf {
        vrf: VrfConfig,
        response: Reply<()>,
    },
    DeleteVrf {
        name: String,
        response: Reply<()>,
    },
    AddPath {
        vrf: Option<String>,
        prefix: IpNetwork,
        attrs: PathAttrs,
        response: Reply<()>,
    },
    DeletePath {
        vrf: Option<String>,
        prefix: IpNetwork,
        response: Reply<()>,
    },
    SoftReset {
        address: IpAddr,
        direction: SoftResetDirection,
        response: Reply<()>,
    },
    EnableNeighbor {
        address: IpAddr,
        response: Reply<()>,
    },
    DisableNeighbor {
        address: IpAddr,
        response: Reply<()>,
    },
    /// Hard reset: close the session with a Cease and reconnect.
    ResetNeighbor {
        address: IpAddr,
        response: Reply<()>,
    },
    ListNeighbors {
        response: Reply<Vec<NeighborStatus>>,
    },
    GetRib {
        table: TableId,
        family: AfiSafi,
        response: Reply<Vec<Arc<Path>>>,
    },
    GetAdjRibIn {
        address: IpAddr,
        family: AfiSafi,
        response: Reply<Vec<Arc<Path>>>,
    },
    GetListenAddrs {
        response: Reply<Vec<SocketAddr>>,
    },
    Watch {
        options: WatchOptions,
        response: Reply<(u64, mpsc::UnboundedReceiver<WatchEvent>)>,
    },
    Replay {
        id: u64,
        response: Reply<()>,
    },
    Unwatch {
        id: u64,
        response: Reply<()>,
    },
    ReplaceRoas {
        roas: Vec<RoaConfig>,
        response: Reply<()>,
    },
    Shutdown {
        response: Reply<()>,
    },
}

/// Client side of the management queue.
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::Sender<MgmtOp>,
}

impl ServerHandle {
    pub(crate) fn new(tx: mpsc::Sender<MgmtOp>) -> Self {
        ServerHandle { tx }
    }

    async fn request<T>(&self, op: impl FnOnce(Reply<T>) -> MgmtOp) -> Result<T, ServerError> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(op(response))
            .await
            .map_err(|_| ServerError::ServerGone)?;
        rx.await.map_err(|_| ServerError::ServerGone)?
    }

    pub async fn add_neighbor(&self, config: PeerConfig) -> Result<(), ServerError> {
        self.request(|response| MgmtOp::AddNeighbor { config, response })
            .await
    }

    pub async fn update_neighbor(&self, config: PeerConfig) -> Result<(), ServerError> {
        self.request(|response| MgmtOp::UpdateNeighbor { config, response })
            .await
    }

    pub async fn delete_neighbor(&self, address: IpAddr) -> Result<(), ServerError> {
        self.request(|response| MgmtOp::DeleteNeighbor { address, response })
            .await
    }

    pub async fn add_peer_group(&self, group: PeerGroupConfig) -> Result<(), ServerError> {
        self.request(|response| MgmtOp::AddPeerGroup { group, response })
            .await
    }

    pub async fn update_peer_group(&self, group: PeerGroupConfig) -> Result<(), ServerError> {
        self.request(|response| MgmtOp::UpdatePeerGroup { group, response })
            .await
    }

    pub async fn delete_peer_group(&self, name: &str) -> Result<(), ServerError> {
        let name = name.to_string();
        self.request(|response| MgmtOp::DeletePeerGroup { name, response })
            .await
    }

    pub async fn add_policy(&self, definition: PolicyDefinitionConfig) -> Result<(), ServerError> {
        self.request(|response| MgmtOp::AddPolicy {
            definition,
            response,
        })
        .await
    }

    pub async fn delete_policy(&self, name: &str) -> Result<(), ServerError> {
        let name = name.to_string();
        self.request(|response| MgmtOp::DeletePolicy { name, response })
            .await
    }

    pub async fn add_vrf(&self, vrf: VrfConfig) -> Result<(), ServerError> {
        self.request(|response| MgmtOp::AddVrf { vrf, response }).await
    }

    pub async fn delete_vrf(&self, name: &str) -> Result<(), ServerError> {
        let name = name.to_string();
        self.request(|response| MgmtOp::DeleteVrf { name, response })
            .await
    }

    /// Originate `prefix`, in the global table or in `vrf`.
    pub async fn add_path(
        &self,
        vrf: Option<&str>,
        prefix: IpNetwork,
        attrs: PathAttrs,
    ) -> Result<(), ServerError> {
        let vrf = vrf.map(str::to_string);
        self.request(|response| MgmtOp::AddPath {
            vrf,
            prefix,
            attrs,
            response,
        })
        .await
    }

    pub async fn delete_path(&self, vrf: Option<&str>, prefix: IpNetwork) -> Result<(), ServerError> {
        let vrf = vrf.map(str::to_string);
        self.request(|response| MgmtOp::DeletePath {
            vrf,
            prefix,
            response,
        })
        .await
    }

    pub async fn soft_reset(
        &self,
        address: IpAddr,
        direction: SoftResetDirection,
    ) -> Result<(), ServerError> {
        self.request(|response| MgmtOp::SoftReset {
            address,
            direction,
            response,
        })
        .await
    }

    pub async fn enable_neighbor(&self, address: IpAddr) -> Result<(), ServerError> {
        self.request(|response| MgmtOp::EnableNeighbor { address, response })
            .await
    }

    pub async fn disable_neighbor(&self, address: IpAddr) -> Result<(), ServerError> {
        self.request(|response| MgmtOp::DisableNeighbor { address, response })
            .await
    }

    pub async fn reset_neighbor(&self, address: IpAddr) -> Result<(), ServerError> {
        self.request(|response| MgmtOp::ResetNeighbor { address, response })
            .await
    }

    pub async fn list_neighbors(&self) -> Result<Vec<NeighborStatus>, ServerError> {
        self.request(|response| MgmtOp::ListNeighbors { response })
            .await
    }

    pub async fn get_rib(&self, table: TableId, family: AfiSafi) -> Result<Vec<Arc<Path>>, ServerError> {
        self.request(|response| MgmtOp::GetRib {
            table,
            family,
            response,
        })
        .await
    }

    pub async fn get_adj_rib_in(
        &self,
        address: IpAddr,
        family: AfiSafi,
    ) -> Result<Vec<Arc<Path>>, ServerError> {
        self.request(|response| MgmtOp::GetAdjRibIn {
            address,
            family,
            response,
        })
        .await
    }

    /// Bound listener addresses, with the ports the kernel picked.
    pub async fn listen_addrs(&self) -> Result<Vec<SocketAddr>, ServerError> {
        self.request(|response| MgmtOp::GetListenAddrs { response })
            .await
    }

    pub async fn watch(&self, options: WatchOptions) -> Result<Watcher, ServerError> {
        let (id, rx) = self
            .request(|response| MgmtOp::Watch { options, response })
            .await?;
        Ok(Watcher::new(id, rx, self.clone()))
    }

    pub(crate) async fn replay(&self, id: u64) -> Result<(), ServerError> {
        self.request(|response| MgmtOp::Replay { id, response }).await
    }

    pub(crate) async fn unwatch(&self, id: u64) -> Result<(), ServerError> {
        self.request(|response| MgmtOp::Unwatch { id, response }).await
    }

    pub async fn replace_roas(&self, roas: Vec<RoaConfig>) -> Result<(), ServerError> {
        self.request(|response| MgmtOp::ReplaceRoas { roas, response })
            .await
    }

    /// Close every session and stop the server loop.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        self.request(|response| MgmtOp::Shutdown { response })
            .await
    }
}

impl BgpServer {
    pub(crate) fn handle_mgmt_op(&mut self, op: MgmtOp) {
        match op {
            MgmtOp::AddNeighbor { config, response } => {
                let _ = response.send(self.handle_add_neighbor(config));
            }
            MgmtOp::UpdateNeighbor { config, response } => {
                let _ = response.send(self.handle_update_neighbor(config));
            }
            MgmtOp::DeleteNeighbor { address, response } => {
                let result = if self.remove_peer(address, CeaseSubcode::PeerDeconfigured) {
                    Ok(())
                } else {
                    Err(unknown_neighbor(address))
                };
                let _ = response.send(result);
            }
            MgmtOp::AddPeerGroup { group, response } => {
                let _ = response.send(self.handle_add_peer_group(group));
            }
            MgmtOp::UpdatePeerGroup { group, response } => {
                let _ = response.send(self.handle_update_peer_group(group));
            }
            MgmtOp::DeletePeerGroup { name, response } => {
                let _ = response.send(self.handle_delete_peer_group(&name));
            }
            MgmtOp::AddPolicy {
                definition,
                response,
            } => {
                let _ = response.send(self.handle_add_policy(&definition));
            }
            MgmtOp::DeletePolicy { name, response } => {
                let _ = response.send(self.handle_delete_policy(&name));
            }
            MgmtOp::AddVrf { vrf, response } => {
                let _ = response.send(self.handle_add_vrf(&vrf));
            }
            MgmtOp::DeleteVrf { name, response } => {
                let _ = response.send(self.handle_delete_vrf(&name));
            }
            MgmtOp::AddPath {
                vrf,
                prefix,
                attrs,
                response,
            } => {
                let _ = response.send(self.handle_add_path(vrf.as_deref(), prefix, attrs));
            }
            MgmtOp::DeletePath {
                vrf,
                prefix,
                response,
            } => {
                let _ = response.send(self.handle_delete_path(vrf.as_deref(), prefix));
            }
            MgmtOp::SoftReset {
                address,
                direction,
                response,
            } => {
                let _ = response.send(self.handle_soft_reset(address, direction));
            }
            MgmtOp::EnableNeighbor { address, response } => {
                let _ = response.send(self.set_admin(address, AdminState::Up));
            }
            MgmtOp::DisableNeighbor { address, response } => {
                let _ = response.send(self.set_admin(address, AdminState::Down));
            }
            MgmtOp::ResetNeighbor { address, response } => {
                let result = self.peer_command(
                    address,
                    SessionCmd::Reset(NotificationMessage::cease(CeaseSubcode::AdministrativeReset)),
                );
                let _ = response.send(result);
            }
            MgmtOp::ListNeighbors { response } => {
                let _ = response.send(Ok(self.list_neighbors()));
            }
            MgmtOp::GetRib {
                table,
                family,
                response,
            } => {
                let _ = response.send(Ok(self.rib.get_path_list(table, family)));
            }
            MgmtOp::GetAdjRibIn {
                address,
                family,
                response,
            } => {
                let result = self
                    .peers
                    .get(&address)
                    .map(|p| p.rib_in.paths(family))
                    .ok_or_else(|| unknown_neighbor(address));
                let _ = response.send(result);
            }
            MgmtOp::GetListenAddrs { response } => {
                let _ = response.send(Ok(self.listen_addrs()));
            }
            MgmtOp::Watch { options, response } => {
                let (id, rx) = self.watchers.add(options);
                if options.initial_table {
                    let snapshot = self.table_snapshot();
                    self.watchers.send_to(id, snapshot);
                }
                info!(id, watchers = self.watchers.len(), "watcher added");
                let _ = response.send(Ok((id, rx)));
            }
            MgmtOp::Replay { id, response } => {
                let result = if self.watchers.contains(id) {
                    let snapshot = self.table_snapshot();
                    self.watchers.send_to(id, snapshot);
                    Ok(())
                } else {
                    Err(ServerError::UnknownReference(format!("watcher {}", id)))
                };
                let _ = response.send(result);
            }
            MgmtOp::Unwatch { id, response } => {
                let result = if self.watchers.remove(id) {
                    Ok(())
                } else {
                    Err(ServerError::UnknownReference(format!("watcher {}", id)))
                };
                let _ = response.send(result);
            }
            MgmtOp::ReplaceRoas { roas, response } => {
                let _ = response.send(self.handle_replace_roas(&roas));
            }
            // The loop intercepts shutdown before dispatching here.
            MgmtOp::Shutdown { response } => {
                let _ = response.send(Ok(()));
            }
        }
    }

    /// References a neighbor config makes must resolve.
    fn check_neighbor(&self, config: &PeerConfig) -> Result<(), ServerError> {
        let group = match &config.peer_group {
            Some(name) => Some(
                self.config
                    .peer_group(name)
                    .ok_or_else(|| ServerError::UnknownReference(format!("peer group '{}'", name)))?,
            ),
            None => None,
        };
        if config.asn == 0 && group.and_then(|g| g.asn).is_none() {
            return Err(ServerError::InvalidArgument(format!(
                "neighbor {} has no asn",
                config.address
            )));
        }
        if let Some(vrf) = &config.vrf {
            if !self.vrfs.contains_key(vrf) {
                return Err(ServerError::UnknownReference(format!("vrf '{}'", vrf)));
            }
        }
        self.check_policies(config.import_policy.iter().chain(&config.export_policy))?;

        let mut families = HashSet::new();
        for afi_safi in &config.afi_safis {
            if !families.insert(afi_safi.afi_safi) {
                return Err(ServerError::InvalidArgument(format!(
                    "{} listed twice",
                    afi_safi.afi_safi
                )));
            }
        }
        Ok(())
    }

    fn check_policies<'a>(&self, mut names: impl Iterator<Item = &'a String>) -> Result<(), ServerError> {
        match names.find(|name| !self.policies.contains(name)) {
            Some(name) => Err(ServerError::UnknownReference(format!("policy '{}'", name))),
            None => Ok(()),
        }
    }

    fn handle_add_neighbor(&mut self, config: PeerConfig) -> Result<(), ServerError> {
        if self.peers.contains_key(&config.address) {
            return Err(ServerError::Duplicate(format!("neighbor {}", config.address)));
        }
        self.check_neighbor(&config)?;
        info!(peer_ip = %config.address, asn = config.asn, "neighbor added");
        self.start_peer(config, false);
        Ok(())
    }

    /// Replace the neighbor's configuration: the old session is closed and
    /// a new one starts under the next generation.
    fn handle_update_neighbor(&mut self, config: PeerConfig) -> Result<(), ServerError> {
        if !self.peers.contains_key(&config.address) {
            return Err(unknown_neighbor(config.address));
        }
        self.check_neighbor(&config)?;
        self.remove_peer(config.address, CeaseSubcode::OtherConfigurationChange);
        info!(peer_ip = %config.address, "neighbor updated");
        self.start_peer(config, false);
        Ok(())
    }

    fn check_peer_group(&self, group: &PeerGroupConfig) -> Result<(), ServerError> {
        group
            .dynamic_ranges()
            .map_err(ServerError::InvalidArgument)?;
        self.check_policies(group.import_policy.iter().chain(&group.export_policy))
    }

    fn handle_add_peer_group(&mut self, group: PeerGroupConfig) -> Result<(), ServerError> {
        if self.config.peer_group(&group.name).is_some() {
            return Err(ServerError::Duplicate(format!("peer group '{}'", group.name)));
        }
        self.check_peer_group(&group)?;
        info!(group = %group.name, "peer group added");
        self.config.peer_groups.push(group);
        Ok(())
    }

    /// Later sessions of member neighbors pick up the new defaults.
    fn handle_update_peer_group(&mut self, group: PeerGroupConfig) -> Result<(), ServerError> {
        self.check_peer_group(&group)?;
        let Some(slot) = self
            .config
            .peer_groups
            .iter_mut()
            .find(|g| g.name == group.name)
        else {
            return Err(ServerError::UnknownReference(format!("peer group '{}'", group.name)));
        };
        *slot = group;
        Ok(())
    }

    fn handle_delete_peer_group(&mut self, name: &str) -> Result<(), ServerError> {
        if self.config.peer_group(name).is_none() {
            return Err(ServerError::UnknownReference(format!("peer group '{}'", name)));
        }
        if self
            .peers
            .values()
            .any(|p| p.config.peer_group.as_deref() == Some(name))
        {
            return Err(ServerError::InUse(format!("peer group '{}'", name)));
        }
        self.config.peer_groups.retain(|g| g.name != name);
        info!(group = %name, "peer group deleted");
        Ok(())
    }

    fn handle_add_policy(&mut self, definition: &PolicyDefinitionConfig) -> Result<(), ServerError> {
        if self.policies.contains(&definition.name) {
            return Err(ServerError::Duplicate(format!("policy '{}'", definition.name)));
        }
        self.policies
            .define(definition)
            .map_err(ServerError::InvalidArgument)?;
        info!(policy = %definition.name, "policy added");
        Ok(())
    }

    fn handle_delete_policy(&mut self, name: &str) -> Result<(), ServerError> {
        if !self.policies.contains(name) {
            return Err(ServerError::UnknownReference(format!("policy '{}'", name)));
        }
        let uses = |list: &[String]| list.iter().any(|n| n == name);
        let in_use = self
            .peers
            .values()
            .any(|p| uses(&p.config.import_policy) || uses(&p.config.export_policy))
            || self
                .config
                .peer_groups
                .iter()
                .any(|g| uses(&g.import_policy) || uses(&g.export_policy));
        if in_use {
            return Err(ServerError::InUse(format!("policy '{}'", name)));
        }
        self.policies.remove(name);
        info!(policy = %name, "policy deleted");
        Ok(())
    }

    fn handle_add_vrf(&mut self, config: &VrfConfig) -> Result<(), ServerError> {
        if self.vrfs.contains_key(&config.name) {
            return Err(ServerError::Duplicate(format!("vrf '{}'", config.name)));
        }
        let vrf = config.resolve().map_err(ServerError::InvalidArgument)?;
        let label = self.alloc_vrf_label();
        info!(vrf = %vrf.name, rd = %vrf.rd, label, "vrf added");
        self.vrfs.insert(vrf.name.clone(), VrfEntry { vrf, label });
        Ok(())
    }

    /// Refused while a neighbor is bound to the VRF; its local paths are
    /// withdrawn.
    fn handle_delete_vrf(&mut self, name: &str) -> Result<(), ServerError> {
        if !self.vrfs.contains_key(name) {
            return Err(ServerError::UnknownReference(format!("vrf '{}'", name)));
        }
        if self
            .peers
            .values()
            .any(|p| p.config.vrf.as_deref() == Some(name))
        {
            return Err(ServerError::InUse(format!("vrf '{}'", name)));
        }
        let Some(entry) = self.vrfs.remove(name) else {
            return Ok(());
        };
        let withdraws: Vec<Arc<Path>> = [AfiSafi::IPV4_VPN, AfiSafi::IPV6_VPN]
            .into_iter()
            .flat_map(|family| self.rib.get_path_list(TableId::Global, family))
            .filter(|p| p.source.is_local())
            .filter(|p| matches!(p.nlri, Nlri::Vpn { rd, .. } if rd == entry.vrf.rd))
            .map(|p| p.to_withdraw())
            .collect();
        info!(vrf = %name, withdrawn = withdraws.len(), "vrf deleted");
        self.propagate_update(None, withdraws);
        Ok(())
    }

    fn local_path(&self, vrf: Option<&str>, path: Path) -> Result<Arc<Path>, ServerError> {
        let path = Arc::new(path);
        match vrf {
            None => Ok(path),
            Some(name) => {
                let entry = self
                    .vrfs
                    .get(name)
                    .ok_or_else(|| ServerError::UnknownReference(format!("vrf '{}'", name)))?;
                Ok(vrf_export(entry, &path))
            }
        }
    }

    fn handle_add_path(
        &mut self,
        vrf: Option<&str>,
        prefix: IpNetwork,
        attrs: PathAttrs,
    ) -> Result<(), ServerError> {
        let path = Path::new(Nlri::Unicast(prefix), Arc::new(attrs), PathSource::local());
        let path = self.local_path(vrf, path)?;
        let path = self.with_validation(path);
        info!(nlri = %path.nlri, "local path added");
        self.propagate_update(None, vec![path]);
        Ok(())
    }

    fn handle_delete_path(&mut self, vrf: Option<&str>, prefix: IpNetwork) -> Result<(), ServerError> {
        let path = Path::new_withdraw(Nlri::Unicast(prefix), None, PathSource::local());
        let path = self.local_path(vrf, path)?;
        let exists = self
            .rib
            .destination(path.family(), &path.nlri)
            .is_some_and(|d| d.paths(TableId::Global).iter().any(|p| p.source.is_local()));
        if !exists {
            return Err(ServerError::UnknownReference(format!("local path {}", path.nlri)));
        }
        info!(nlri = %path.nlri, "local path deleted");
        self.propagate_update(None, vec![path]);
        Ok(())
    }

    fn handle_soft_reset(
        &mut self,
        address: IpAddr,
        direction: SoftResetDirection,
    ) -> Result<(), ServerError> {
        let peer = self
            .peers
            .get(&address)
            .ok_or_else(|| unknown_neighbor(address))?;
        info!(peer_ip = %address, ?direction, "soft reset");

        if matches!(direction, SoftResetDirection::In | SoftResetDirection::Both) {
            // stale paths keep their table form until End-of-RIB
            let paths: Vec<Arc<Path>> = peer
                .rib_in
                .all_paths()
                .into_iter()
                .filter(|p| !p.as_looped && !p.stale)
                .collect();
            let paths = self.import_paths(address, paths);
            self.propagate_update(Some(address), paths);
        }
        if matches!(direction, SoftResetDirection::Out | SoftResetDirection::Both) {
            if let Some(peer) = self.peers.get(&address) {
                let families: Vec<AfiSafi> = peer
                    .negotiated_families()
                    .into_iter()
                    .filter(|f| !peer.deferred.contains_key(f))
                    .collect();
                for family in families {
                    self.flush_family(address, family, false);
                }
            }
        }
        Ok(())
    }

    fn set_admin(&mut self, address: IpAddr, admin: AdminState) -> Result<(), ServerError> {
        let cmd = match admin {
            AdminState::Up => SessionCmd::Connect,
            AdminState::Down => SessionCmd::Stop(CeaseSubcode::AdministrativeShutdown),
        };
        self.peer_command(address, cmd)?;
        if let Some(peer) = self.peers.get_mut(&address) {
            peer.admin = admin;
        }
        info!(peer_ip = %address, ?admin, "admin state changed");
        Ok(())
    }

    fn peer_command(&self, address: IpAddr, cmd: SessionCmd) -> Result<(), ServerError> {
        let peer = self
            .peers
            .get(&address)
            .ok_or_else(|| unknown_neighbor(address))?;
        if let Err(e) = peer.command(cmd) {
            warn!(peer_ip = %address, error = %e, "session command not delivered");
        }
        Ok(())
    }

    fn list_neighbors(&self) -> Vec<NeighborStatus> {
        let mut out: Vec<NeighborStatus> = self
            .peers
            .values()
            .map(|peer| NeighborStatus {
                config: peer.config.clone(),
                dynamic: peer.dynamic,
                state: peer.state,
                admin: peer.admin,
                last_reason: peer.last_reason.clone(),
                session: peer.session.clone().filter(|_| peer.is_established()),
                statistics: peer.counters.snapshot(),
                received: peer.rib_in.total(),
                stale_families: peer.stale_families.iter().copied().collect(),
            })
            .collect();
        out.sort_by_key(|n| n.config.address);
        out
    }

    /// Best paths of every table, and every peer's state.
    fn table_snapshot(&self) -> WatchEvent {
        let mut tables = vec![TableId::Global];
        tables.extend(
            self.peers
                .values()
                .filter(|p| p.config.route_server_client)
                .map(|p| TableId::RsClient(p.address())),
        );
        tables.sort();

        let mut paths = Vec::new();
        for family in self.rib.families() {
            for table in &tables {
                paths.extend(
                    self.rib
                        .get_best_path_list(*table, family)
                        .into_iter()
                        .map(|p| (*table, p)),
                );
            }
        }
        let mut peers: Vec<(IpAddr, BgpState)> = self
            .peers
            .values()
            .map(|p| (p.address(), p.state))
            .collect();
        peers.sort_by_key(|(addr, _)| *addr);
        WatchEvent::Table { paths, peers }
    }

    /// Swap the ROA set and re-run every path whose verdict may change
    /// through import.
    fn handle_replace_roas(&mut self, configs: &[RoaConfig]) -> Result<(), ServerError> {
        let roas = configs
            .iter()
            .map(Roa::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(ServerError::InvalidArgument)?;
        self.rpki.replace(roas);
        info!(roas = self.rpki.len(), "roa set replaced");

        let mut peers: Vec<IpAddr> = self.peers.keys().copied().collect();
        peers.sort();
        for address in peers {
            let Some(peer) = self.peers.get(&address) else {
                continue;
            };
            let paths: Vec<Arc<Path>> = peer
                .rib_in
                .all_paths()
                .into_iter()
                .filter(|p| !p.as_looped && !p.stale)
                .collect();
            let paths = self.import_paths(address, paths);
            self.propagate_update(Some(address), paths);
        }

        let local: Vec<Arc<Path>> = self
            .rib
            .families()
            .into_iter()
            .flat_map(|family| self.rib.get_path_list(TableId::Global, family))
            .filter(|p| p.source.is_local())
            .map(|p| self.with_validation(p))
            .collect();
        self.propagate_update(None, local);
        Ok(())
    }
}

fn unknown_neighbor(address: IpAddr) -> ServerError {
    ServerError::UnknownReference(format!("neighbor {}", address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActionsConfig, Config, ConditionsConfig, StatementConfig};
    use crate::rpki::RpkiVerdict;
    use std::net::Ipv4Addr;
    use tokio::task::JoinHandle;

    async fn start() -> (ServerHandle, JoinHandle<Result<(), ServerError>>) {
        let config = Config::new(65000, Ipv4Addr::new(1, 1, 1, 1), vec!["127.0.0.1:0".to_string()]);
        let server = BgpServer::new(config).unwrap();
        let handle = server.handle();
        let task = tokio::spawn(server.run());
        (handle, task)
    }

    fn neighbor(addr: &str, asn: u32) -> PeerConfig {
        let mut config = PeerConfig::new(addr.parse().unwrap(), asn);
        config.admin_down = true;
        config.passive_mode = true;
        config
    }

    fn policy(name: &str) -> PolicyDefinitionConfig {
        PolicyDefinitionConfig {
            name: name.to_string(),
            statements: vec![StatementConfig {
                name: None,
                conditions: ConditionsConfig::default(),
                actions: ActionsConfig {
                    local_pref: Some(200),
                    ..Default::default()
                },
            }],
            default_accept: true,
        }
    }

    fn prefix(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    fn attrs() -> PathAttrs {
        PathAttrs {
            next_hop: "192.0.2.1".parse().unwrap(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_neighbor_admin_errors() {
        let (handle, _task) = start().await;
        handle.add_neighbor(neighbor("10.0.0.1", 65001)).await.unwrap();

        let mut with_group = neighbor("10.0.0.2", 65002);
        with_group.peer_group = Some("missing".to_string());
        let mut with_policy = neighbor("10.0.0.3", 65003);
        with_policy.import_policy = vec!["missing".to_string()];
        let mut with_vrf = neighbor("10.0.0.4", 65004);
        with_vrf.vrf = Some("missing".to_string());

        let cases = [
            (neighbor("10.0.0.1", 65001), "Duplicate"),
            (with_group, "UnknownReference"),
            (with_policy, "UnknownReference"),
            (with_vrf, "UnknownReference"),
            (neighbor("10.0.0.5", 0), "InvalidArgument"),
        ];
        for (config, want) in cases {
            let addr = config.address;
            let err = handle.add_neighbor(config).await.unwrap_err();
            let got = match err {
                ServerError::Duplicate(_) => "Duplicate",
                ServerError::UnknownReference(_) => "UnknownReference",
                ServerError::InvalidArgument(_) => "InvalidArgument",
                _ => "other",
            };
            assert_eq!(got, want, "{}", addr);
        }

        let listed = handle.list_neighbors().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, BgpState::Idle);
        assert_eq!(listed[0].admin, AdminState::Down);

        let missing: IpAddr = "10.9.9.9".parse().unwrap();
        assert!(matches!(
            handle.delete_neighbor(missing).await,
            Err(ServerError::UnknownReference(_))
        ));
        handle.delete_neighbor("10.0.0.1".parse().unwrap()).await.unwrap();
        assert!(handle.list_neighbors().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_use_deletes() {
        let (handle, _task) = start().await;
        handle.add_policy(policy("lp200")).await.unwrap();
        assert!(matches!(
            handle.add_policy(policy("lp200")).await,
            Err(ServerError::Duplicate(_))
        ));
        handle
            .add_peer_group(PeerGroupConfig {
                name: "core".to_string(),
                asn: Some(65000),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut config = neighbor("10.0.0.1", 0);
        config.peer_group = Some("core".to_string());
        config.import_policy = vec!["lp200".to_string()];
        handle.add_neighbor(config).await.unwrap();

        assert!(matches!(handle.delete_policy("lp200").await, Err(ServerError::InUse(_))));
        assert!(matches!(handle.delete_peer_group("core").await, Err(ServerError::InUse(_))));

        handle.delete_neighbor("10.0.0.1".parse().unwrap()).await.unwrap();
        handle.delete_policy("lp200").await.unwrap();
        handle.delete_peer_group("core").await.unwrap();
        assert!(matches!(
            handle.delete_policy("lp200").await,
            Err(ServerError::UnknownReference(_))
        ));
    }

    #[tokio::test]
    async fn test_local_paths() {
        let (handle, _task) = start().await;
        handle.add_path(None, prefix("10.1.0.0/24"), attrs()).await.unwrap();

        let rib = handle
            .get_rib(TableId::Global, AfiSafi::IPV4_UNICAST)
            .await
            .unwrap();
        assert_eq!(rib.len(), 1);
        assert!(rib[0].source.is_local());

        assert!(matches!(
            handle.add_path(Some("blue"), prefix("10.2.0.0/24"), attrs()).await,
            Err(ServerError::UnknownReference(_))
        ));
        handle
            .add_vrf(VrfConfig {
                name: "blue".to_string(),
                rd: "65000:1".to_string(),
                import_rt: vec!["65000:1".to_string()],
                export_rt: vec!["65000:1".to_string()],
            })
            .await
            .unwrap();
        handle
            .add_path(Some("blue"), prefix("10.2.0.0/24"), attrs())
            .await
            .unwrap();
        let vpn = handle.get_rib(TableId::Global, AfiSafi::IPV4_VPN).await.unwrap();
        assert_eq!(vpn.len(), 1);
        assert!(vpn[0].label.is_some());
        assert!(!vpn[0].attrs.extended_communities.is_empty());

        handle.delete_path(None, prefix("10.1.0.0/24")).await.unwrap();
        assert!(matches!(
            handle.delete_path(None, prefix("10.1.0.0/24")).await,
            Err(ServerError::UnknownReference(_))
        ));
        handle.delete_vrf("blue").await.unwrap();
        assert!(handle
            .get_rib(TableId::Global, AfiSafi::IPV4_VPN)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_watch_initial_table_and_replay() {
        let (handle, _task) = start().await;
        handle.add_path(None, prefix("10.1.0.0/24"), attrs()).await.unwrap();

        let mut watcher = handle
            .watch(WatchOptions {
                best_path: true,
                initial_table: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let Some(WatchEvent::Table { paths, .. }) = watcher.recv().await else {
            panic!("expected table snapshot");
        };
        assert_eq!(paths.len(), 1);

        handle.add_path(None, prefix("10.2.0.0/24"), attrs()).await.unwrap();
        assert!(matches!(watcher.recv().await, Some(WatchEvent::BestPath { .. })));

        watcher.replay().await.unwrap();
        let Some(WatchEvent::Table { paths, .. }) = watcher.recv().await else {
            panic!("expected replayed snapshot");
        };
        assert_eq!(paths.len(), 2);

        watcher.unsubscribe().await.unwrap();
    }

    #[tokio::test]
    async fn test_replace_roas_revalidates() {
        let (handle, _task) = start().await;
        handle.add_path(None, prefix("10.1.0.0/24"), attrs()).await.unwrap();
        let verdict = |rib: Vec<Arc<Path>>| rib[0].validation;

        let rib = handle.get_rib(TableId::Global, AfiSafi::IPV4_UNICAST).await.unwrap();
        assert_eq!(verdict(rib), RpkiVerdict::NotFound);

        handle
            .replace_roas(vec![RoaConfig {
                prefix: "10.1.0.0/16".to_string(),
                max_length: 24,
                asn: 65000,
            }])
            .await
            .unwrap();
        let rib = handle.get_rib(TableId::Global, AfiSafi::IPV4_UNICAST).await.unwrap();
        assert_eq!(verdict(rib), RpkiVerdict::Valid);
    }

    #[tokio::test]
    async fn test_shutdown() {
        let (handle, task) = start().await;
        assert_eq!(handle.listen_addrs().await.unwrap().len(), 1);
        handle.shutdown().await.unwrap();
        assert_eq!(task.await.unwrap(), Ok(()));
        assert_eq!(handle.list_neighbors().await.unwrap_err(), ServerError::ServerGone);
    }
}
