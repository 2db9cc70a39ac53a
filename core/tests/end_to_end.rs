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

//! Session setup and route exchange against scripted peers

mod utils;
pub use utils::*;

use ribd::bgp::msg::{BgpMessage, OpenMessage};
use ribd::bgp::notification::{BgpError, CeaseSubcode, OpenMessageError};
use ribd::net::IpNetwork;
use ribd::peer::fsm::BgpState;
use ribd::rib::{PathAttrs, TableId};
use std::net::Ipv4Addr;
use std::time::Duration;

async fn two_peer_server() -> (TestServer, FakePeer, FakePeer) {
    let mut config = test_config(1);
    config.peers.push(passive_neighbor("127.0.0.2", 2));
    config.peers.push(passive_neighbor("127.0.0.3", 3));
    let server = start_test_server(config).await;

    let a = FakePeer::connect_and_handshake(&server, "127.0.0.2", 2, Ipv4Addr::new(2, 2, 2, 2), None)
        .await;
    let b = FakePeer::connect_and_handshake(&server, "127.0.0.3", 3, Ipv4Addr::new(3, 3, 3, 3), None)
        .await;
    poll_until(
        || async {
            let peers = server.handle.list_neighbors().await.unwrap();
            peers.iter().all(|p| p.state == BgpState::Established)
        },
        "peers never reached Established",
    )
    .await;
    (server, a, b)
}

#[tokio::test]
async fn test_single_neighbor_advertise_withdraw() {
    let mut config = test_config(1);
    config.peers.push(passive_neighbor("127.0.0.1", 2));
    let server = start_test_server(config).await;

    let mut peer =
        FakePeer::connect_and_handshake(&server, "127.0.0.1", 2, Ipv4Addr::new(2, 2, 2, 2), None)
            .await;
    peer.send_update(announce(&["192.0.2.0/24"], vec![2, 64512], "127.0.0.1"))
        .await;
    poll_until(
        || async { server.rib(TableId::Global).await.len() == 1 },
        "route never installed",
    )
    .await;
    let rib = server.rib(TableId::Global).await;
    assert_eq!(rib[0].attrs.next_hop, "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
    assert_eq!(rib[0].source.asn, 2);

    peer.send_update(withdraw(&["192.0.2.0/24"])).await;
    poll_until(
        || async { server.rib(TableId::Global).await.is_empty() },
        "route not withdrawn",
    )
    .await;
    let neighbors = server.handle.list_neighbors().await.unwrap();
    assert_eq!(neighbors[0].state, BgpState::Established);
    assert_eq!(neighbors[0].received, 0);
}

#[tokio::test]
async fn test_local_path_advertise_withdraw() {
    let mut config = test_config(1);
    config.peers.push(passive_neighbor("127.0.0.1", 2));
    let server = start_test_server(config).await;

    let mut peer =
        FakePeer::connect_and_handshake(&server, "127.0.0.1", 2, Ipv4Addr::new(2, 2, 2, 2), None)
            .await;
    poll_until(
        || async {
            let peers = server.handle.list_neighbors().await.unwrap();
            peers.iter().all(|p| p.state == BgpState::Established)
        },
        "peer never reached Established",
    )
    .await;

    let prefix: IpNetwork = "10.0.0.0/24".parse().unwrap();
    server
        .handle
        .add_path(None, prefix, PathAttrs::default())
        .await
        .unwrap();
    let update = peer.read_update().await;
    assert_eq!(
        update_prefixes(&update),
        (vec!["10.0.0.0/24".to_string()], vec![])
    );
    assert_eq!(update_as_path(&update), vec![1]);
    let (_, next_hop) = update.announced()[0];
    assert_eq!(next_hop, Some("127.0.0.1".parse().unwrap()));

    server.handle.delete_path(None, prefix).await.unwrap();
    let update = peer.read_update().await;
    assert_eq!(
        update_prefixes(&update),
        (vec![], vec!["10.0.0.0/24".to_string()])
    );
    assert!(update.attrs.is_empty(), "withdraw carried {:?}", update.attrs);

    // nothing else follows
    let extra = tokio::time::timeout(Duration::from_secs(1), peer.read_update()).await;
    assert!(extra.is_err(), "unexpected UPDATE {:?}", extra);
}

#[tokio::test]
async fn test_announce_and_withdraw() {
    let (server, mut a, mut b) = two_peer_server().await;

    a.send_update(announce(&["10.0.0.0/24"], vec![2], "127.0.0.2"))
        .await;
    let update = b.read_update().await;
    assert_eq!(
        update_prefixes(&update),
        (vec!["10.0.0.0/24".to_string()], vec![])
    );
    assert_eq!(update_as_path(&update), vec![1, 2]);
    let (_, next_hop) = update.announced()[0];
    assert_eq!(next_hop, Some("127.0.0.1".parse().unwrap()));

    let rib = server.rib(TableId::Global).await;
    assert_eq!(rib.len(), 1);
    assert_eq!(rib[0].source.address, "127.0.0.2".parse::<std::net::IpAddr>().unwrap());

    // No mandatory attributes on a pure withdrawal
    a.send_update(withdraw(&["10.0.0.0/24"])).await;
    let update = b.read_update().await;
    assert_eq!(
        update_prefixes(&update),
        (vec![], vec!["10.0.0.0/24".to_string()])
    );
    poll_until(
        || async { server.rib(TableId::Global).await.is_empty() },
        "route not withdrawn from the table",
    )
    .await;
}

#[tokio::test]
async fn test_late_peer_receives_table() {
    let mut config = test_config(1);
    config.peers.push(passive_neighbor("127.0.0.2", 2));
    config.peers.push(passive_neighbor("127.0.0.3", 3));
    let server = start_test_server(config).await;

    let mut a =
        FakePeer::connect_and_handshake(&server, "127.0.0.2", 2, Ipv4Addr::new(2, 2, 2, 2), None)
            .await;
    a.send_update(announce(&["10.1.0.0/24", "10.2.0.0/24"], vec![2, 20], "127.0.0.2"))
        .await;
    poll_until(
        || async { server.rib(TableId::Global).await.len() == 2 },
        "routes never installed",
    )
    .await;

    let mut b =
        FakePeer::connect_and_handshake(&server, "127.0.0.3", 3, Ipv4Addr::new(3, 3, 3, 3), None)
            .await;
    let mut announced = Vec::new();
    while announced.len() < 2 {
        announced.extend(update_prefixes(&b.read_update().await).0);
    }
    announced.sort();
    assert_eq!(announced, vec!["10.1.0.0/24", "10.2.0.0/24"]);
}

#[tokio::test]
async fn test_open_errors() {
    let mut config = test_config(1);
    config.peers.push(passive_neighbor("127.0.0.4", 4));
    let server = start_test_server(config).await;

    let cases = [
        (
            5,
            Ipv4Addr::new(4, 4, 4, 4),
            BgpError::OpenMessage(OpenMessageError::BadPeerAs),
        ),
        (
            4,
            Ipv4Addr::new(1, 1, 1, 1),
            BgpError::OpenMessage(OpenMessageError::BadBgpIdentifier),
        ),
    ];
    for (asn, router_id, want) in cases {
        let mut peer = FakePeer::connect(&server, "127.0.0.4").await;
        assert!(matches!(peer.recv().await, BgpMessage::Open(_)));
        peer.send(BgpMessage::Open(OpenMessage::new(asn, 90, router_id, vec![])))
            .await;
        assert_eq!(peer.read_notification().await.error, want, "asn {}", asn);
    }
}

#[tokio::test]
async fn test_delete_neighbor_sends_cease() {
    let (server, mut a, mut b) = two_peer_server().await;
    a.send_update(announce(&["10.0.0.0/24"], vec![2], "127.0.0.2"))
        .await;
    b.read_update().await;

    server
        .handle
        .delete_neighbor("127.0.0.2".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(
        a.read_notification().await.error,
        BgpError::Cease(CeaseSubcode::PeerDeconfigured)
    );
    let update = b.read_update().await;
    assert_eq!(
        update_prefixes(&update),
        (vec![], vec!["10.0.0.0/24".to_string()])
    );
}
