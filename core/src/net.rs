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

use crate::bgp::family::AfiSafi;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

#[cfg(target_os = "linux")]
use std::mem;
#[cfg(target_os = "linux")]
use std::ptr::addr_of_mut;

/// BGP protocol port number
pub const BGP_PORT: u16 = 179;

/// IP network prefix (IPv4 or IPv6)
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum IpNetwork {
    V4(Ipv4Net),
    V6(Ipv6Net),
}

impl IpNetwork {
    pub fn prefix_len(&self) -> u8 {
        match self {
            IpNetwork::V4(net) => net.prefix_length,
            IpNetwork::V6(net) => net.prefix_length,
        }
    }

    /// Check if another prefix is contained within this network
    pub fn contains(&self, other: &IpNetwork) -> bool {
        if other.prefix_len() < self.prefix_len() {
            return false;
        }
        match (self, other) {
            (IpNetwork::V4(net), IpNetwork::V4(p)) => {
                let mask = u32::MAX.checked_shl(32 - net.prefix_length as u32).unwrap_or(0);
                (u32::from(net.address) & mask) == (u32::from(p.address) & mask)
            }
            (IpNetwork::V6(net), IpNetwork::V6(p)) => {
                let mask = u128::MAX
                    .checked_shl(128 - net.prefix_length as u32)
                    .unwrap_or(0);
                (u128::from(net.address) & mask) == (u128::from(p.address) & mask)
            }
            _ => false,
        }
    }

    pub fn contains_addr(&self, addr: IpAddr) -> bool {
        let host = match addr {
            IpAddr::V4(a) => IpNetwork::V4(Ipv4Net {
                address: a,
                prefix_length: 32,
            }),
            IpAddr::V6(a) => IpNetwork::V6(Ipv6Net {
                address: a,
                prefix_length: 128,
            }),
        };
        self.contains(&host)
    }

    pub fn unicast_family(&self) -> AfiSafi {
        match self {
            IpNetwork::V4(_) => AfiSafi::IPV4_UNICAST,
            IpNetwork::V6(_) => AfiSafi::IPV6_UNICAST,
        }
    }
}

impl std::fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpNetwork::V4(net) => write!(f, "{}/{}", net.address, net.prefix_length),
            IpNetwork::V6(net) => write!(f, "{}/{}", net.address, net.prefix_length),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct Ipv4Net {
    pub address: Ipv4Addr,
    pub prefix_length: u8,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct Ipv6Net {
    pub address: Ipv6Addr,
    pub prefix_length: u8,
}

/// Parse CIDR notation string into IpNetwork
impl std::str::FromStr for IpNetwork {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid CIDR format '{}' (expected address/length)", s))?;
        let prefix_len = len
            .parse::<u8>()
            .map_err(|_| format!("invalid prefix length '{}'", len))?;

        match addr.parse::<IpAddr>() {
            Ok(IpAddr::V4(address)) if prefix_len <= 32 => Ok(IpNetwork::V4(Ipv4Net {
                address,
                prefix_length: prefix_len,
            })),
            Ok(IpAddr::V6(address)) if prefix_len <= 128 => Ok(IpNetwork::V6(Ipv6Net {
                address,
                prefix_length: prefix_len,
            })),
            Ok(_) => Err(format!("prefix length {} too long for '{}'", prefix_len, addr)),
            Err(_) => Err(format!("invalid IP address '{}'", addr)),
        }
    }
}

/// Socket options applied to BGP transport connections.
pub trait TransportConfig: Send + Sync {
    /// TCP MD5 signature for `peer` (RFC 2385).
    fn set_md5(&self, fd: RawFd, peer: IpAddr, key: &[u8]) -> io::Result<()>;

    /// Generalized TTL security (RFC 5082): send with TTL 255 and drop
    /// segments that crossed more than `hops` routers.
    fn set_ttl_security(&self, fd: RawFd, peer: IpAddr, hops: u8) -> io::Result<()>;
}

/// `setsockopt` based transport options. Only Linux is supported; other
/// targets return `Unsupported`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTransport;

#[cfg(target_os = "linux")]
const IP_MINTTL: libc::c_int = 21;
#[cfg(target_os = "linux")]
const IPV6_MINHOPCOUNT: libc::c_int = 73;

#[cfg(target_os = "linux")]
fn setsockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            mem::size_of_val(&value) as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// struct tcp_md5sig (linux/tcp.h)
#[cfg(target_os = "linux")]
#[repr(C)]
struct TcpMd5sig {
    peer_addr: libc::sockaddr_storage,
    flags: u8,
    prefixlen: u8,
    keylen: u16,
    ifindex: i32,
    key: [u8; libc::TCP_MD5SIG_MAXKEYLEN],
}

#[cfg(target_os = "linux")]
fn tcp_md5sig(peer: IpAddr, key: &[u8]) -> TcpMd5sig {
    let mut sig: TcpMd5sig = unsafe { mem::zeroed() };
    sig.keylen = key.len() as u16;
    sig.key[..key.len()].copy_from_slice(key);

    // Port stays zero; the kernel matches keys by address only.
    match peer {
        IpAddr::V4(v4) => unsafe {
            let sa = addr_of_mut!(sig.peer_addr) as *mut libc::sockaddr_in;
            (*sa).sin_family = libc::AF_INET as u16;
            (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.octets());
        },
        IpAddr::V6(v6) => unsafe {
            let sa = addr_of_mut!(sig.peer_addr) as *mut libc::sockaddr_in6;
            (*sa).sin6_family = libc::AF_INET6 as u16;
            (*sa).sin6_addr.s6_addr = v6.octets();
        },
    }
    sig
}

#[cfg(target_os = "linux")]
impl TransportConfig for SystemTransport {
    fn set_md5(&self, fd: RawFd, peer: IpAddr, key: &[u8]) -> io::Result<()> {
        if key.len() > libc::TCP_MD5SIG_MAXKEYLEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "MD5 key too long (max 80 bytes)",
            ));
        }
        let sig = tcp_md5sig(peer, key);
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_MD5SIG,
                &sig as *const _ as *const libc::c_void,
                mem::size_of_val(&sig) as libc::socklen_t,
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn set_ttl_security(&self, fd: RawFd, peer: IpAddr, hops: u8) -> io::Result<()> {
        let min_ttl = 256 - hops.max(1) as libc::c_int;
        match peer {
            IpAddr::V4(_) => {
                setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_TTL, 255)?;
                setsockopt_int(fd, libc::IPPROTO_IP, IP_MINTTL, min_ttl)
            }
            IpAddr::V6(_) => {
                setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_UNICAST_HOPS, 255)?;
                setsockopt_int(fd, libc::IPPROTO_IPV6, IPV6_MINHOPCOUNT, min_ttl)
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl TransportConfig for SystemTransport {
    fn set_md5(&self, _fd: RawFd, _peer: IpAddr, _key: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "TCP MD5 is not supported on this platform",
        ))
    }

    fn set_ttl_security(&self, _fd: RawFd, _peer: IpAddr, _hops: u8) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "TTL security is not supported on this platform",
        ))
    }
}

/// Per-connection transport settings taken from the neighbor config.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub local_addr: Option<IpAddr>,
    pub md5_key: Option<Vec<u8>>,
    pub ttl_security_hops: Option<u8>,
}

/// Dial `remote`, applying MD5 and TTL security before the handshake.
pub async fn connect(
    transport: &dyn TransportConfig,
    remote: SocketAddr,
    opts: &ConnectOptions,
) -> io::Result<TcpStream> {
    let socket = if remote.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(local) = opts.local_addr {
        socket.bind(SocketAddr::new(local, 0))?;
    }
    if let Some(key) = &opts.md5_key {
        transport.set_md5(socket.as_raw_fd(), remote.ip(), key)?;
    }
    if let Some(hops) = opts.ttl_security_hops {
        transport.set_ttl_security(socket.as_raw_fd(), remote.ip(), hops)?;
    }
    socket.connect(remote).await
}

/// Bind a listener with address reuse so restarts do not wait for
/// TIME_WAIT sockets.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

pub fn peer_ip(stream: &TcpStream) -> Option<IpAddr> {
    stream.peer_addr().ok().map(|addr| addr.ip())
}

pub fn local_ip(stream: &TcpStream) -> Option<IpAddr> {
    stream.local_addr().ok().map(|addr| addr.ip())
}

/// Parse address string into SocketAddr with optional default port.
/// Accepts formats: "IP:PORT" or "IP" (uses default_port).
pub fn parse_sockaddr(addr: &str, default_port: u16) -> Result<SocketAddr, String> {
    addr.parse()
        .or_else(|_| format!("{}:{}", addr, default_port).parse())
        .or_else(|_| format!("[{}]:{}", addr, default_port).parse())
        .map_err(|e| format!("invalid address '{}': {}", addr, e))
}

#[cfg(test)]
pub(crate) const fn ipv4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_tcp_md5sig_layout() {
        use std::ptr::addr_of;
        let key = b"secret";
        let sig = tcp_md5sig(ipv4(10, 0, 0, 1), key);
        assert_eq!(sig.keylen, key.len() as u16);
        assert_eq!(&sig.key[..key.len()], key.as_ref());
        unsafe {
            let sa = addr_of!(sig.peer_addr) as *const libc::sockaddr_in;
            assert_eq!((*sa).sin_family, libc::AF_INET as u16);
            assert_eq!((*sa).sin_addr.s_addr, u32::from_ne_bytes([10, 0, 0, 1]));
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_md5_key_too_long() {
        let socket = TcpSocket::new_v4().unwrap();
        let result = SystemTransport.set_md5(socket.as_raw_fd(), ipv4(127, 0, 0, 1), &[0u8; 81]);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidInput);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_ttl_security_on_socket() {
        let socket = TcpSocket::new_v4().unwrap();
        SystemTransport
            .set_ttl_security(socket.as_raw_fd(), ipv4(127, 0, 0, 1), 1)
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_and_peer_ip() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let opts = ConnectOptions {
            local_addr: Some(ipv4(127, 0, 0, 1)),
            ..Default::default()
        };
        let client = tokio::spawn(async move { connect(&SystemTransport, addr, &opts).await });
        let (server_stream, _) = listener.accept().await.unwrap();
        let client_stream = client.await.unwrap().unwrap();
        assert_eq!(peer_ip(&server_stream), Some(ipv4(127, 0, 0, 1)));
        assert_eq!(local_ip(&client_stream), Some(ipv4(127, 0, 0, 1)));
    }

    #[test]
    fn test_parse_sockaddr() {
        let cases = [
            ("127.0.0.1:179", 179, "127.0.0.1:179"),
            ("127.0.0.1", 179, "127.0.0.1:179"),
            ("10.0.0.1", 8080, "10.0.0.1:8080"),
            ("::1", 179, "[::1]:179"),
        ];
        for (addr, port, expected) in cases {
            assert_eq!(
                parse_sockaddr(addr, port),
                Ok(expected.parse::<SocketAddr>().unwrap())
            );
        }
        assert!(parse_sockaddr("invalid", 179).is_err());
    }

    #[test]
    fn test_ipnetwork_from_str() {
        assert_eq!(
            IpNetwork::from_str("10.0.0.0/24").unwrap(),
            IpNetwork::V4(Ipv4Net {
                address: Ipv4Addr::new(10, 0, 0, 0),
                prefix_length: 24,
            })
        );
        assert!(IpNetwork::from_str("2001:db8::/32").is_ok());
        for bad in ["10.0.0.0", "10.0.0.0/33", "2001:db8::/129", "999.1.1.1/24", "10.0.0.0/x"] {
            assert!(IpNetwork::from_str(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_ipnetwork_contains() {
        let net = IpNetwork::from_str("10.0.0.0/8").unwrap();
        let cases = [
            ("10.1.2.0/24", true),
            ("192.168.1.0/24", false),
            ("0.0.0.0/0", false),
            ("2001:db8::/32", false),
        ];
        for (other, expected) in cases {
            assert_eq!(net.contains(&other.parse().unwrap()), expected, "{}", other);
        }
        assert!(IpNetwork::from_str("0.0.0.0/0")
            .unwrap()
            .contains_addr(ipv4(192, 0, 2, 1)));
        assert!(!net.contains_addr(ipv4(11, 0, 0, 1)));
    }
}
