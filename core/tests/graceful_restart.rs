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

//! Graceful restart helper behavior (RFC 4724)

mod utils;
pub use utils::*;

use ribd::bgp::capability::GracefulRestartCap;
use ribd::bgp::family::AfiSafi;
use ribd::config::GracefulRestartConfig;
use ribd::rib::TableId;
use std::net::Ipv4Addr;
use tokio::time::{sleep, Duration};

const RESTART_TIME: u16 = 2;

fn gr_cap() -> GracefulRestartCap {
    GracefulRestartCap {
        restart_time: RESTART_TIME,
        restarting: false,
        families: vec![(AfiSafi::IPV4_UNICAST, true)],
    }
}

async fn gr_server() -> TestServer {
    gr_server_with(GracefulRestartConfig::default()).await
}

async fn gr_server_with(gr: GracefulRestartConfig) -> TestServer {
    let mut config = test_config(1);
    let mut neighbor = passive_neighbor("127.0.0.2", 2);
    neighbor.graceful_restart = Some(gr);
    config.peers.push(neighbor);
    start_test_server(config).await
}

async fn connect(server: &TestServer) -> FakePeer {
    let mut peer = FakePeer::connect_and_handshake(
        server,
        "127.0.0.2",
        2,
        Ipv4Addr::new(2, 2, 2, 2),
        Some(gr_cap()),
    )
    .await;
    // Initial table: nothing to send but the End-of-RIB
    let eor = peer.read_update().await;
    assert_eq!(eor.end_of_rib_family(), Some(AfiSafi::IPV4_UNICAST));
    peer
}

async fn stale_prefixes(server: &TestServer) -> Vec<String> {
    let mut out: Vec<String> = server
        .rib(TableId::Global)
        .await
        .iter()
        .filter(|p| p.stale)
        .map(|p| p.nlri.to_string())
        .collect();
    out.sort();
    out
}

#[tokio::test]
async fn test_stale_routes_expire_with_restart_time() {
    let server = gr_server().await;
    let mut peer = connect(&server).await;
    peer.send_update(announce(&["10.0.0.0/24"], vec![2], "127.0.0.2"))
        .await;
    poll_until(
        || async { server.rib(TableId::Global).await.len() == 1 },
        "route never installed",
    )
    .await;

    drop(peer);
    sleep(Duration::from_secs(RESTART_TIME as u64 - 1)).await;
    assert_eq!(stale_prefixes(&server).await, vec!["10.0.0.0/24"]);
    let neighbors = server.handle.list_neighbors().await.unwrap();
    assert_eq!(neighbors[0].stale_families, vec![AfiSafi::IPV4_UNICAST]);

    sleep(Duration::from_secs(2)).await;
    assert!(server.rib(TableId::Global).await.is_empty());
    let neighbors = server.handle.list_neighbors().await.unwrap();
    assert!(neighbors[0].stale_families.is_empty());
}

#[tokio::test]
async fn test_end_of_rib_clears_unrefreshed_routes() {
    let server = gr_server().await;
    let mut peer = connect(&server).await;
    peer.send_update(announce(&["10.0.0.0/24", "10.1.0.0/24"], vec![2], "127.0.0.2"))
        .await;
    poll_until(
        || async { server.rib(TableId::Global).await.len() == 2 },
        "routes never installed",
    )
    .await;

    drop(peer);
    poll_until(
        || async { stale_prefixes(&server).await.len() == 2 },
        "routes never marked stale",
    )
    .await;

    let mut peer = connect(&server).await;
    peer.send_update(announce(&["10.1.0.0/24"], vec![2], "127.0.0.2"))
        .await;
    poll_until(
        || async { stale_prefixes(&server).await == vec!["10.0.0.0/24"] },
        "refreshed route still stale",
    )
    .await;

    // End-of-RIB for IPv4 unicast is an empty UPDATE
    peer.send_update(withdraw(&[])).await;
    poll_until(
        || async {
            let rib = server.rib(TableId::Global).await;
            rib.len() == 1 && rib[0].nlri.to_string() == "10.1.0.0/24" && !rib[0].stale
        },
        "stale route survived End-of-RIB",
    )
    .await;
}

#[tokio::test]
async fn test_stale_routes_cleared_without_end_of_rib() {
    let server = gr_server_with(GracefulRestartConfig {
        stale_path_time_secs: 2,
        ..Default::default()
    })
    .await;
    let mut peer = connect(&server).await;
    peer.send_update(announce(&["10.0.0.0/24"], vec![2], "127.0.0.2"))
        .await;
    poll_until(
        || async { server.rib(TableId::Global).await.len() == 1 },
        "route never installed",
    )
    .await;

    drop(peer);
    poll_until(
        || async { stale_prefixes(&server).await.len() == 1 },
        "route never marked stale",
    )
    .await;

    // back within the restart time, but never sends End-of-RIB
    let _peer = connect(&server).await;
    assert_eq!(stale_prefixes(&server).await, vec!["10.0.0.0/24"]);

    poll_until(
        || async { server.rib(TableId::Global).await.is_empty() },
        "stale route outlived the stale timer",
    )
    .await;
    let neighbors = server.handle.list_neighbors().await.unwrap();
    assert!(neighbors[0].stale_families.is_empty());
}
