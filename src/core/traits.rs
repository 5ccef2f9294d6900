//! Core traits for mptun.
//!
//! These traits define the seam between the tunnel and the socket layer.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use super::config::InterfaceName;

/// Where a datagram leaves from or arrived on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathAddr {
    /// Local interface label.
    pub interface: InterfaceName,
    /// Remote socket address.
    pub remote: SocketAddr,
}

impl PathAddr {
    /// Create a path address.
    pub fn new(interface: InterfaceName, remote: SocketAddr) -> Self {
        Self { interface, remote }
    }
}

/// Best-effort datagram transport driven by the tunnel.
///
/// No ordering or delivery guarantee is expected. Implementations decide how
/// an interface label maps to a socket; the tunnel only ever hands back labels
/// it configured or received.
///
/// # Example
///
/// ```ignore
/// struct Loopback { /* ... */ }
///
/// impl Transport for Loopback {
///     async fn send_to(&self, buf: &[u8], to: &PathAddr) -> io::Result<usize> { /* ... */ }
///     async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, PathAddr)> { /* ... */ }
///     async fn writable(&self) -> io::Result<()> { Ok(()) }
///     fn local_addr(&self) -> io::Result<SocketAddr> { /* ... */ }
/// }
/// ```
pub trait Transport: Send + Sync {
    /// Send one datagram along a path.
    fn send_to(&self, buf: &[u8], to: &PathAddr) -> impl Future<Output = io::Result<usize>> + Send;

    /// Receive one datagram, reporting the path it arrived on.
    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, PathAddr)>> + Send;

    /// Wait until a datagram can be sent without blocking.
    fn writable(&self) -> impl Future<Output = io::Result<()>> + Send;

    /// Local address the transport is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Apply an IP traffic class to outgoing datagrams.
    fn set_traffic_class(&self, tc: u8) -> io::Result<()> {
        let _ = tc;
        Ok(())
    }
}
