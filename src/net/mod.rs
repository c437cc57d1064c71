//! Dual-stack UDP plumbing shared by both workers.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("Failed to bind any UDP socket: v4: {v4}, v6: {v6}")]
    BindFailed { v4: io::Error, v6: io::Error },
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("The target address did not resolve to a valid IP")]
    HostNotFound,

    #[error("Name resolution failed: {0}")]
    Lookup(#[from] io::Error),
}

/// One UDP socket per address family.
///
/// A family whose bind fails is carried as `None`: traffic on it is silently
/// impossible, but the owning worker keeps running on the surviving family.
/// Construction only fails when neither family could be bound.
pub struct SocketPair {
    v4: Option<UdpSocket>,
    v6: Option<UdpSocket>,
}

impl SocketPair {
    /// Binds both families on `port` (0 for ephemeral).
    ///
    /// The IPv6 socket is always bound `IPV6_V6ONLY`: on Linux the kernel
    /// default (`bindv6only=0`) makes a plain `[::]` wildcard claim the IPv4
    /// namespace too, and the second bind on the same port fails with
    /// `EADDRINUSE`. An ephemeral request reuses the port the kernel picked
    /// for v4 so both families answer on one port.
    pub async fn bind(port: u16) -> Result<Self, NetError> {
        let v4 = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await;

        let v6_port = match (port, &v4) {
            (0, Ok(socket)) => socket.local_addr().map(|a| a.port()).unwrap_or(0),
            _ => port,
        };
        let v6 = match bind_v6_only(v6_port) {
            // The v4 ephemeral port happened to be taken on the v6 side;
            // fall back to a v6 ephemeral of its own.
            Err(_) if port == 0 && v6_port != 0 => bind_v6_only(0),
            result => result,
        };

        match (v4, v6) {
            (Err(v4), Err(v6)) => Err(NetError::BindFailed { v4, v6 }),
            (v4, v6) => {
                if let Err(e) = &v4 {
                    warn!("IPv4 socket unavailable: {}", e);
                }
                if let Err(e) = &v6 {
                    warn!("IPv6 socket unavailable: {}", e);
                }
                Ok(Self {
                    v4: v4.ok(),
                    v6: v6.ok(),
                })
            }
        }
    }

    pub fn v4(&self) -> Option<&UdpSocket> {
        self.v4.as_ref()
    }

    pub fn v6(&self) -> Option<&UdpSocket> {
        self.v6.as_ref()
    }

    /// Local port of the IPv4 socket, if bound. Tests bind port 0 and need
    /// the assigned port back.
    pub fn v4_port(&self) -> Option<u16> {
        self.v4
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
    }

    /// Local port of the IPv6 socket, if bound.
    pub fn v6_port(&self) -> Option<u16> {
        self.v6
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
    }

    /// Sends one datagram to `addr` on the family-matched socket. Transient
    /// send failures and a missing family are both ignored: the protocol is
    /// best-effort and heals through periodic resend.
    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr) {
        let socket = match addr {
            SocketAddr::V4(_) => self.v4.as_ref(),
            SocketAddr::V6(_) => self.v6.as_ref(),
        };

        let Some(socket) = socket else {
            debug!("No socket for family of {}, datagram dropped", addr);
            return;
        };

        if let Err(e) = socket.send_to(buf, addr).await {
            debug!("Send to {} failed: {}", addr, e);
        }
    }
}

/// Binds an IPv6-only UDP socket. Tokio exposes no way to set `IPV6_V6ONLY`
/// before binding, so the socket is built with socket2 and converted.
fn bind_v6_only(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)).into())?;
    UdpSocket::from_std(socket.into())
}

/// Awaits a datagram on an optional socket; pends forever when the family is
/// unavailable, so it can sit directly in a `select!` arm.
pub async fn recv_from_opt(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

/// Resolves `host` to every address of both families.
///
/// An empty result set is reported as [`ResolveError::HostNotFound`]; NXDOMAIN
/// surfaces from the platform resolver as an io error and lands in
/// [`ResolveError::Lookup`] unless the platform maps it to `NotFound`.
pub async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, ResolveError> {
    match lookup_host((host, port)).await {
        Ok(addrs) => {
            let addrs: Vec<SocketAddr> = addrs.collect();
            if addrs.is_empty() {
                Err(ResolveError::HostNotFound)
            } else {
                Ok(addrs)
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ResolveError::HostNotFound),
        Err(e) => Err(e.into()),
    }
}
