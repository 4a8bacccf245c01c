//! TCP socket wrappers for mio-based I/O.
//!
//! Thin wrappers around [`mio::net::TcpStream`] and [`mio::net::TcpListener`]
//! with ergonomic send/recv APIs and integration with mio's polling
//! infrastructure. All sockets are non-blocking; `try_*` methods turn
//! `WouldBlock` into `Ok(None)` for use in readiness loops.

use std::io::{self, ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsFd, BorrowedFd};

use mio::event::Source;
use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Interest, Registry, Token};

use super::Endpoint;

/// A non-blocking TCP connection.
///
/// Obtained from [`TcpStream::connect`] or [`TcpListener::accept`]. Because
/// the socket is non-blocking, a freshly connected stream may still be mid
/// handshake; wait for writability with mio's [`Poll`] before the first
/// send.
///
/// [`Poll`]: mio::Poll
pub struct TcpStream {
    inner: MioTcpStream,
}

impl TcpStream {
    /// Starts a connection to the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or the connect
    /// cannot be initiated.
    pub fn connect(endpoint: Endpoint) -> io::Result<Self> {
        let inner = MioTcpStream::connect(endpoint.into())?;
        Ok(Self { inner })
    }

    /// Returns the local address of this stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Returns the remote address this stream is connected to.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is not yet connected.
    pub fn peer_addr(&self) -> io::Result<Endpoint> {
        self.inner.peer_addr().map(Endpoint::from)
    }

    /// Sends bytes on the stream.
    ///
    /// Returns the number of bytes written, which may be short, or
    /// `WouldBlock` if the socket is not ready.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the socket would block.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.inner).write(buf)
    }

    /// Receives bytes from the stream.
    ///
    /// Returns the number of bytes read; zero means the peer closed the
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the socket would block.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }

    /// Attempts to send, returning `Ok(None)` instead of `WouldBlock`.
    ///
    /// Useful in polling loops where `WouldBlock` is expected.
    pub fn try_send(&self, buf: &[u8]) -> io::Result<Option<usize>> {
        match self.send(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts to receive, returning `Ok(None)` instead of `WouldBlock`.
    ///
    /// Useful in polling loops where `WouldBlock` is expected.
    pub fn try_recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Disables Nagle's algorithm for latency-sensitive traffic.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.inner.set_nodelay(nodelay)
    }

    /// Shuts down both directions of the connection.
    ///
    /// A peer blocked in recv observes end-of-stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown syscall fails.
    pub fn shutdown(&self) -> io::Result<()> {
        self.inner.shutdown(Shutdown::Both)
    }
}

impl AsFd for TcpStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Source for TcpStream {
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

/// A non-blocking TCP listener.
pub struct TcpListener {
    inner: MioTcpListener,
}

impl TcpListener {
    /// Creates a listener bound to the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound (e.g., address in use).
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let inner = MioTcpListener::bind(endpoint.into())?;
        Ok(Self { inner })
    }

    /// Returns the local address this listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Accepts a pending connection.
    ///
    /// Returns the connected stream and the peer's endpoint, or `WouldBlock`
    /// if no connection is pending.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the socket would block.
    pub fn accept(&self) -> io::Result<(TcpStream, Endpoint)> {
        self.inner
            .accept()
            .map(|(stream, addr)| (TcpStream { inner: stream }, Endpoint::from(addr)))
    }

    /// Attempts to accept, returning `Ok(None)` instead of `WouldBlock`.
    ///
    /// Useful in polling loops where `WouldBlock` is expected.
    pub fn try_accept(&self) -> io::Result<Option<(TcpStream, Endpoint)>> {
        match self.accept() {
            Ok(pair) => Ok(Some(pair)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl AsFd for TcpListener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Source for TcpListener {
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
