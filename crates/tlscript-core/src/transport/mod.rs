//! Blocking byte transports underneath a layer stack.

pub mod memory;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::io;
use std::time::Duration;

use tlscript_types::TransportError;

use crate::config::{AliasedConnection, TransportType};

pub use memory::{MemoryControl, MemoryTransport};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// A blocking byte transport.
pub trait Transport: fmt::Debug + Send {
    /// Connect, accept or bind, depending on the connection end.
    fn initialize(&mut self) -> Result<(), TransportError>;

    fn is_initialized(&self) -> bool;

    fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Wait up to the configured timeout for data. Returns an empty buffer on
    /// timeout or when the peer closed the connection.
    fn fetch_data(&mut self) -> Result<Vec<u8>, TransportError>;

    fn close_connection(&mut self) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool;

    fn set_timeout(&mut self, timeout: Duration);
}

/// Create the transport a connection definition asks for.
pub fn create_transport(
    connection: &AliasedConnection,
    default_timeout: Duration,
) -> Box<dyn Transport> {
    let timeout = connection
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(default_timeout);
    let addr = format!("{}:{}", connection.host, connection.port);
    match connection.transport {
        TransportType::Tcp => Box::new(TcpTransport::new(connection.local_end, addr, timeout)),
        TransportType::Udp => Box::new(UdpTransport::new(connection.local_end, addr, timeout)),
    }
}

/// Read timeouts surface as `WouldBlock` or `TimedOut` depending on platform.
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Sockets reject a zero timeout; clamp to the smallest accepted value.
pub(crate) fn socket_timeout(timeout: Duration) -> Option<Duration> {
    Some(timeout.max(Duration::from_millis(1)))
}
