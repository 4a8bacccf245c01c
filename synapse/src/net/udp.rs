//! UDP socket wrapper for mio-based I/O, with multicast support.
//!
//! Provides a thin wrapper around [`mio::net::UdpSocket`] with ergonomic
//! send/recv APIs, socket buffer sizing through `rustix`, and a multicast
//! constructor that joins a group at creation time.

use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use mio::event::Source;
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Interest, Registry, Token};
use rustix::net::{AddressFamily, SocketType, bind, socket};

use super::Endpoint;
use crate::trace;

/// Multicast group membership configuration.
///
/// The defaults target an administratively-scoped group on the local
/// segment, with loopback enabled so same-host subscribers receive their own
/// traffic.
#[derive(Debug, Clone)]
pub struct McastConfig {
    /// Multicast group to join.
    pub group: Ipv4Addr,
    /// UDP port the group communicates on.
    pub port: u16,
    /// Local interface to bind and join on (`0.0.0.0` lets the OS choose).
    pub interface: Ipv4Addr,
    /// Time-to-live for outgoing datagrams (1 = stay on the local segment).
    pub ttl: u32,
    /// Whether locally sent datagrams loop back to local members.
    pub loopback: bool,
    /// Whether to set `SO_REUSEADDR` before bind, letting several processes
    /// on one host join the same group/port.
    pub reuse_addr: bool,
}

impl Default for McastConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 255, 0, 1),
            port: 30001,
            interface: Ipv4Addr::UNSPECIFIED,
            ttl: 1,
            loopback: true,
            reuse_addr: true,
        }
    }
}

/// A non-blocking UDP socket.
///
/// Wraps a mio UDP socket and provides methods for sending and receiving
/// datagrams. The socket is non-blocking; use with mio's [`Poll`] for
/// readiness notification.
///
/// [`Poll`]: mio::Poll
pub struct UdpSocket {
    inner: MioUdpSocket,
    /// Destination for `send_broadcast`, set by the multicast constructor.
    group: Option<Endpoint>,
}

impl UdpSocket {
    /// Creates a new UDP socket bound to the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound (e.g., address in use).
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let inner = MioUdpSocket::bind(endpoint.into())?;
        Ok(Self { inner, group: None })
    }

    /// Creates a socket bound to the configured interface/port and joined to
    /// the multicast group.
    ///
    /// The socket is built through `rustix` so `SO_REUSEADDR` can be applied
    /// before bind, then handed to mio for non-blocking polling.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created, bound, or joined to
    /// the group.
    pub fn multicast(cfg: &McastConfig) -> io::Result<Self> {
        let fd = socket(AddressFamily::INET, SocketType::DGRAM, None)?;
        if cfg.reuse_addr {
            rustix::net::sockopt::set_socket_reuseaddr(&fd, true)?;
        }
        bind(&fd, &SocketAddrV4::new(cfg.interface, cfg.port))?;

        let std_socket = std::net::UdpSocket::from(OwnedFd::from(fd));
        std_socket.set_nonblocking(true)?;
        let inner = MioUdpSocket::from_std(std_socket);

        inner.join_multicast_v4(&cfg.group, &cfg.interface)?;
        inner.set_multicast_ttl_v4(cfg.ttl)?;
        inner.set_multicast_loop_v4(cfg.loopback)?;

        trace::debug!(group = %cfg.group, port = cfg.port, "joined multicast group");

        Ok(Self {
            inner,
            group: Some(Endpoint::from(SocketAddrV4::new(cfg.group, cfg.port))),
        })
    }

    /// Returns the local address this socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Sends a datagram to the specified endpoint.
    ///
    /// Returns the number of bytes sent, or `WouldBlock` if the socket
    /// is not ready for writing.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the socket would block.
    pub fn send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<usize> {
        self.inner.send_to(buf, dest.into())
    }

    /// Receives a datagram from the socket.
    ///
    /// Returns the number of bytes received and the source endpoint,
    /// or `WouldBlock` if no data is available.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the socket would block.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Endpoint)> {
        self.inner
            .recv_from(buf)
            .map(|(n, addr)| (n, Endpoint::from(addr)))
    }

    /// Sends a datagram to the joined multicast group.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the socket was not created with
    /// [`UdpSocket::multicast`], otherwise as [`UdpSocket::send_to`].
    pub fn send_broadcast(&self, buf: &[u8]) -> io::Result<usize> {
        let dest = self.group.ok_or_else(|| {
            io::Error::new(ErrorKind::InvalidInput, "socket has no multicast group")
        })?;
        self.send_to(buf, dest)
    }

    /// Receives a datagram from the joined multicast group.
    ///
    /// # Errors
    ///
    /// As [`UdpSocket::recv_from`].
    pub fn recv_broadcast(&self, buf: &mut [u8]) -> io::Result<(usize, Endpoint)> {
        self.recv_from(buf)
    }

    /// Attempts to send, returning `Ok(None)` instead of `WouldBlock`.
    ///
    /// Useful in polling loops where `WouldBlock` is expected.
    pub fn try_send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<Option<usize>> {
        match self.send_to(buf, dest) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts to receive, returning `Ok(None)` instead of `WouldBlock`.
    ///
    /// Useful in polling loops where `WouldBlock` is expected.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>> {
        match self.recv_from(buf) {
            Ok((n, ep)) => Ok(Some((n, ep))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sets the socket's send buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        // Use rustix for socket options since mio doesn't expose them directly
        let fd = self.inner.as_fd();
        rustix::net::sockopt::set_socket_send_buffer_size(fd, size)?;
        Ok(())
    }

    /// Sets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        let fd = self.inner.as_fd();
        rustix::net::sockopt::set_socket_recv_buffer_size(fd, size)?;
        Ok(())
    }

    /// Gets the socket's send buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn send_buffer_size(&self) -> io::Result<usize> {
        let fd = self.inner.as_fd();
        Ok(rustix::net::sockopt::socket_send_buffer_size(fd)?)
    }

    /// Gets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        let fd = self.inner.as_fd();
        Ok(rustix::net::sockopt::socket_recv_buffer_size(fd)?)
    }
}

impl AsFd for UdpSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Source for UdpSocket {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}
