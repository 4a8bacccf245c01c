//! Network transport primitives.
//!
//! Thin non-blocking wrappers around mio's TCP and UDP sockets, with
//! `try_*` helpers that normalize `WouldBlock` into `Ok(None)` for polling
//! loops. Multicast group setup goes through `rustix` so socket options can
//! be applied before bind.

pub mod endpoint;
pub mod tcp;
pub mod udp;

pub use endpoint::Endpoint;
pub use tcp::{TcpListener, TcpStream};
pub use udp::{McastConfig, UdpSocket};
