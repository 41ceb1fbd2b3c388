//! UDP transport. A server learns its peer from the first datagram.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use tlscript_types::TransportError;

use super::{is_timeout, socket_timeout, Transport};
use crate::ConnectionEnd;

const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug)]
pub struct UdpTransport {
    end: ConnectionEnd,
    addr: String,
    timeout: Duration,
    socket: Option<UdpSocket>,
    peer: Option<SocketAddr>,
    closed: bool,
}

impl UdpTransport {
    pub fn new(end: ConnectionEnd, addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            end,
            addr: addr.into(),
            timeout,
            socket: None,
            peer: None,
            closed: false,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

impl Transport for UdpTransport {
    fn initialize(&mut self) -> Result<(), TransportError> {
        let socket = match self.end {
            ConnectionEnd::Client => {
                let socket = UdpSocket::bind("0.0.0.0:0")?;
                socket.connect(&self.addr)?;
                self.peer = Some(socket.peer_addr()?);
                socket
            }
            ConnectionEnd::Server => {
                self.peer = None;
                UdpSocket::bind(&self.addr)?
            }
        };
        socket.set_read_timeout(socket_timeout(self.timeout))?;
        self.socket = Some(socket);
        self.closed = false;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.socket.is_some()
    }

    fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotInitialized)?;
        let peer = self
            .peer
            .ok_or_else(|| TransportError::Failed("udp peer address not yet known".into()))?;
        socket.send_to(data, peer)?;
        Ok(())
    }

    fn fetch_data(&mut self) -> Result<Vec<u8>, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotInitialized)?;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                if self.peer.is_none() {
                    self.peer = Some(from);
                }
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if is_timeout(&e) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn close_connection(&mut self) -> Result<(), TransportError> {
        self.socket = None;
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        if let Some(socket) = &self.socket {
            let _ = socket.set_read_timeout(socket_timeout(timeout));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_learns_peer() {
        let mut server =
            UdpTransport::new(ConnectionEnd::Server, "127.0.0.1:0", Duration::from_millis(200));
        server.initialize().unwrap();
        let addr = server.local_addr().unwrap();

        // Server cannot send before it heard from anyone.
        assert!(server.send_data(b"hi").is_err());

        let mut client =
            UdpTransport::new(ConnectionEnd::Client, addr.to_string(), Duration::from_millis(200));
        client.initialize().unwrap();
        client.send_data(b"ping").unwrap();
        assert_eq!(server.fetch_data().unwrap(), b"ping");
        server.send_data(b"pong").unwrap();
        assert_eq!(client.fetch_data().unwrap(), b"pong");

        client.close_connection().unwrap();
        assert!(client.is_closed());
        assert!(client.fetch_data().is_err());
    }
}
