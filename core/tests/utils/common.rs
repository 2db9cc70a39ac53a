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

//! Common test utilities for BGP server testing

use ribd::bgp::attr::{AsPathSegment, Origin, PathAttribute};
use ribd::bgp::capability::{Capability, GracefulRestartCap};
use ribd::bgp::codec::{Codec, CodecContext, WireCodec};
use ribd::bgp::family::AfiSafi;
use ribd::bgp::nlri::{Nlri, NlriEntry};
use ribd::bgp::msg::{read_frame, BgpMessage, OpenMessage, UpdateMessage};
use ribd::bgp::notification::NotificationMessage;
use ribd::config::{Config, PeerConfig};
use ribd::rib::{Path, TableId};
use ribd::server::{BgpServer, ServerError};
use ribd::server_ops::ServerHandle;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing_subscriber::EnvFilter;

/// Initialize tracing for tests. Call at the start of each test.
/// Uses RUST_LOG env var, defaulting to debug for ribd only.
/// Safe to call multiple times - only first call takes effect.
pub fn init_test_logging() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "ribd=debug".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_test_writer()
        .try_init();
}

pub struct TestServer {
    pub handle: ServerHandle,
    pub addr: SocketAddr,
    pub task: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    pub async fn rib(&self, table: TableId) -> Vec<Arc<Path>> {
        self.handle
            .get_rib(table, AfiSafi::IPV4_UNICAST)
            .await
            .unwrap()
    }
}

/// Server in AS `asn` listening on an ephemeral loopback port.
pub fn test_config(asn: u32) -> Config {
    Config::new(asn, Ipv4Addr::new(1, 1, 1, 1), vec!["127.0.0.1:0".to_string()])
}

/// Passive neighbor that reconnects quickly after a session drop.
pub fn passive_neighbor(address: &str, asn: u32) -> PeerConfig {
    let mut config = PeerConfig::new(address.parse().unwrap(), asn);
    config.passive_mode = true;
    config.idle_hold_time_secs = Some(1);
    config
}

pub async fn start_test_server(config: Config) -> TestServer {
    init_test_logging();
    let server = BgpServer::new(config).expect("valid server config");
    let handle = server.handle();
    let task = tokio::spawn(server.run());
    let addrs = handle.listen_addrs().await.unwrap();
    TestServer {
        handle,
        addr: addrs[0],
        task,
    }
}

/// Generic polling helper that retries until a condition is met
pub async fn poll_until<F, Fut>(check: F, timeout_message: &str)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("{}", timeout_message);
}

fn entry(prefix: &str) -> NlriEntry {
    NlriEntry::new(Nlri::Unicast(prefix.parse().unwrap()))
}

/// IPv4 unicast announcement with the mandatory attributes.
pub fn announce(prefixes: &[&str], as_path: Vec<u32>, next_hop: &str) -> UpdateMessage {
    UpdateMessage {
        withdrawn: vec![],
        attrs: vec![
            PathAttribute::Origin(Origin::Igp),
            PathAttribute::AsPath(vec![AsPathSegment::sequence(as_path)]),
            PathAttribute::NextHop(next_hop.parse().unwrap()),
        ],
        nlri: prefixes.iter().map(|p| entry(p)).collect(),
    }
}

/// Withdrawal carrying no path attributes at all.
pub fn withdraw(prefixes: &[&str]) -> UpdateMessage {
    UpdateMessage {
        withdrawn: prefixes.iter().map(|p| entry(p)).collect(),
        ..Default::default()
    }
}

/// Prefixes announced and withdrawn by an UPDATE, as strings.
pub fn update_prefixes(update: &UpdateMessage) -> (Vec<String>, Vec<String>) {
    let announced = update
        .announced()
        .into_iter()
        .map(|(e, _)| e.nlri.to_string())
        .collect();
    let withdrawn = update
        .withdrawn_all()
        .into_iter()
        .map(|e| e.nlri.to_string())
        .collect();
    (announced, withdrawn)
}

/// AS_PATH of an UPDATE flattened to its AS numbers.
pub fn update_as_path(update: &UpdateMessage) -> Vec<u32> {
    update
        .attrs
        .iter()
        .find_map(|a| match a {
            PathAttribute::AsPath(segments) => {
                Some(segments.iter().flat_map(|s| s.asn_list.clone()).collect())
            }
            _ => None,
        })
        .unwrap_or_default()
}

/// Scripted BGP speaker driving the server over a real TCP connection.
pub struct FakePeer {
    pub stream: TcpStream,
    pub ctx: CodecContext,
}

impl FakePeer {
    /// TCP connect from `local_ip`; any 127/8 address works on loopback.
    pub async fn connect(server: &TestServer, local_ip: &str) -> Self {
        let socket = TcpSocket::new_v4().unwrap();
        socket.set_reuseaddr(true).unwrap();
        socket
            .bind(SocketAddr::new(local_ip.parse().unwrap(), 0))
            .unwrap();
        let stream = socket.connect(server.addr).await.unwrap();
        FakePeer {
            stream,
            ctx: CodecContext::default(),
        }
    }

    /// Connect and run OPEN/KEEPALIVE until both sides are Established.
    pub async fn connect_and_handshake(
        server: &TestServer,
        local_ip: &str,
        asn: u32,
        router_id: Ipv4Addr,
        gr: Option<GracefulRestartCap>,
    ) -> Self {
        let mut peer = Self::connect(server, local_ip).await;
        let BgpMessage::Open(open) = peer.recv().await else {
            panic!("expected OPEN from server");
        };

        let mut caps = vec![
            Capability::Multiprotocol(AfiSafi::IPV4_UNICAST),
            Capability::FourOctetAs(asn),
        ];
        if let Some(gr) = gr {
            caps.push(Capability::GracefulRestart(gr));
        }
        peer.send(BgpMessage::Open(OpenMessage::new(asn, 90, router_id, caps)))
            .await;
        peer.ctx.four_octet_as = open
            .capabilities
            .iter()
            .any(|c| matches!(c, Capability::FourOctetAs(_)));

        assert_eq!(peer.recv().await, BgpMessage::Keepalive);
        peer.send(BgpMessage::Keepalive).await;
        peer
    }

    pub async fn send(&mut self, msg: BgpMessage) {
        let bytes = WireCodec.encode(&self.ctx, &msg);
        self.stream.write_all(&bytes).await.unwrap();
    }

    pub async fn send_update(&mut self, update: UpdateMessage) {
        self.send(BgpMessage::Update(update)).await;
    }

    /// Next message within 5s.
    pub async fn recv(&mut self) -> BgpMessage {
        let read = async {
            let (header, body) = read_frame(&mut self.stream).await.expect("read message");
            WireCodec
                .decode(&self.ctx, &header, &body)
                .expect("decode message")
        };
        timeout(Duration::from_secs(5), read)
            .await
            .expect("timeout waiting for message")
    }

    /// Read an UPDATE message (skips any KEEPALIVEs)
    pub async fn read_update(&mut self) -> UpdateMessage {
        loop {
            match self.recv().await {
                BgpMessage::Update(update) => return update,
                BgpMessage::Keepalive => continue,
                other => panic!("expected UPDATE, got {:?}", other),
            }
        }
    }

    /// Read a NOTIFICATION message (skips any KEEPALIVEs)
    pub async fn read_notification(&mut self) -> NotificationMessage {
        loop {
            match self.recv().await {
                BgpMessage::Notification(n) => return n,
                BgpMessage::Keepalive | BgpMessage::Update(_) => continue,
                other => panic!("expected NOTIFICATION, got {:?}", other),
            }
        }
    }
}
