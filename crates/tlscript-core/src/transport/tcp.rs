//! TCP transport: connects as client, accepts a single peer as server.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::time::Duration;

use tlscript_types::TransportError;
use tracing::debug;

use super::{is_timeout, socket_timeout, Transport};
use crate::ConnectionEnd;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug)]
pub struct TcpTransport {
    end: ConnectionEnd,
    addr: String,
    timeout: Duration,
    stream: Option<TcpStream>,
    closed: bool,
}

impl TcpTransport {
    pub fn new(end: ConnectionEnd, addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            end,
            addr: addr.into(),
            timeout,
            stream: None,
            closed: false,
        }
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream, timeout: Duration) -> Result<Self, TransportError> {
        stream.set_read_timeout(socket_timeout(timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            end: ConnectionEnd::Client,
            addr: stream.peer_addr()?.to_string(),
            timeout,
            stream: Some(stream),
            closed: false,
        })
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotInitialized)
    }
}

impl Transport for TcpTransport {
    fn initialize(&mut self) -> Result<(), TransportError> {
        let stream = match self.end {
            ConnectionEnd::Client => TcpStream::connect(&self.addr)?,
            ConnectionEnd::Server => {
                let listener = TcpListener::bind(&self.addr)?;
                let (stream, peer) = listener.accept()?;
                debug!(%peer, "accepted tcp connection");
                stream
            }
        };
        stream.set_read_timeout(socket_timeout(self.timeout))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.closed = false;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.stream.is_some()
    }

    fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream()?;
        stream.write_all(data)?;
        stream.flush()?;
        Ok(())
    }

    fn fetch_data(&mut self) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream()?;
        let mut buf = vec![0u8; READ_CHUNK];
        match stream.read(&mut buf) {
            Ok(0) => {
                self.closed = true;
                Ok(Vec::new())
            }
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if is_timeout(&e) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn close_connection(&mut self) -> Result<(), TransportError> {
        if let Some(stream) = self.stream.take() {
            // The peer may already be gone.
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        if let Some(stream) = &self.stream {
            let _ = stream.set_read_timeout(socket_timeout(timeout));
        }
    }
}
