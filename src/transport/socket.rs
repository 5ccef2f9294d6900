//! Async UDP implementation of [`Transport`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::debug;

use crate::core::{InterfaceName, PathAddr, Transport};

/// UDP socket carrying every path of a tunnel.
///
/// Inbound datagrams are labeled with the interface name given at bind time;
/// the tunnel attributes them to paths by remote address when several paths
/// share this socket.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    interface: InterfaceName,
}

impl UdpTransport {
    /// Bind a socket with an empty interface label.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Self::bind_interface(addr, InterfaceName::default()).await
    }

    /// Bind a socket and label its traffic with `interface`.
    pub async fn bind_interface(addr: SocketAddr, interface: InterfaceName) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        debug!(local = %socket.local_addr()?, %interface, "transport bound");
        Ok(Self::from_socket(socket, interface))
    }

    /// Wrap an existing socket.
    pub fn from_socket(socket: UdpSocket, interface: InterfaceName) -> Self {
        Self {
            socket: Arc::new(socket),
            interface,
        }
    }

    /// Interface label of inbound datagrams.
    pub fn interface(&self) -> &InterfaceName {
        &self.interface
    }

    /// Get a reference to the underlying socket.
    pub fn inner(&self) -> &UdpSocket {
        &self.socket
    }

    /// Get a clone of the Arc-wrapped socket.
    pub fn socket_arc(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }
}

impl Transport for UdpTransport {
    async fn send_to(&self, buf: &[u8], to: &PathAddr) -> io::Result<usize> {
        self.socket.send_to(buf, to.remote).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, PathAddr)> {
        let (len, remote) = self.socket.recv_from(buf).await?;
        Ok((len, PathAddr::new(self.interface.clone(), remote)))
    }

    async fn writable(&self) -> io::Result<()> {
        self.socket.writable().await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    #[cfg(target_os = "linux")]
    fn set_traffic_class(&self, tc: u8) -> io::Result<()> {
        let sock = socket2::SockRef::from(self.socket.as_ref());
        if self.socket.local_addr()?.is_ipv4() {
            sock.set_tos_v4(u32::from(tc))
        } else {
            sock.set_tclass_v6(u32::from(tc))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_labels_interface() {
        let lo = InterfaceName::new("lo").unwrap();
        let a = UdpTransport::bind_interface("127.0.0.1:0".parse().unwrap(), lo.clone())
            .await
            .unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let to = PathAddr::new(InterfaceName::default(), a.local_addr().unwrap());
        b.writable().await.unwrap();
        assert_eq!(b.send_to(b"ping", &to).await.unwrap(), 4);

        let mut buf = [0u8; 64];
        let (len, from) = a.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from.interface, lo);
        assert_eq!(from.remote, b.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_traffic_class() {
        let t = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(t.set_traffic_class(0x10).is_ok());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_traffic_class_v6() {
        // Hosts without IPv6 loopback have nothing to check.
        let Ok(t) = UdpTransport::bind("[::1]:0".parse().unwrap()).await else {
            return;
        };
        t.set_traffic_class(0x10).unwrap();
        let sock = socket2::SockRef::from(t.inner());
        assert_eq!(sock.tclass_v6().unwrap(), 0x10);
    }
}
