//! In-process duplex transport.
//!
//! [`MemoryTransport::pair`] returns two connected ends. Each `send_data`
//! delivers one chunk to the other end; `fetch_data` returns the oldest chunk
//! or an empty buffer immediately when nothing is queued.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tlscript_types::TransportError;

use super::Transport;

#[derive(Debug, Default)]
struct Channel {
    chunks: VecDeque<Vec<u8>>,
    /// The writing end has closed.
    closed: bool,
}

type SharedChannel = Arc<Mutex<Channel>>;

fn lock(channel: &SharedChannel) -> Result<MutexGuard<'_, Channel>, TransportError> {
    channel
        .lock()
        .map_err(|_| TransportError::Failed("memory channel poisoned".into()))
}

#[derive(Debug)]
pub struct MemoryTransport {
    inbound: SharedChannel,
    outbound: SharedChannel,
    fail_sends: Arc<AtomicBool>,
    initialized: bool,
    closed: bool,
}

impl MemoryTransport {
    /// Two transports wired to each other.
    pub fn pair() -> (Self, Self) {
        let a_to_b = SharedChannel::default();
        let b_to_a = SharedChannel::default();
        let a = Self {
            inbound: Arc::clone(&b_to_a),
            outbound: Arc::clone(&a_to_b),
            fail_sends: Arc::default(),
            initialized: true,
            closed: false,
        };
        let b = Self {
            inbound: a_to_b,
            outbound: b_to_a,
            fail_sends: Arc::default(),
            initialized: true,
            closed: false,
        };
        (a, b)
    }

    /// Handle that stays usable after the transport moved into a context.
    pub fn control(&self) -> MemoryControl {
        MemoryControl {
            inbound: Arc::clone(&self.inbound),
            outbound: Arc::clone(&self.outbound),
            fail_sends: Arc::clone(&self.fail_sends),
        }
    }
}

impl Transport for MemoryTransport {
    fn initialize(&mut self) -> Result<(), TransportError> {
        self.initialized = true;
        self.closed = false;
        lock(&self.outbound)?.closed = false;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !self.initialized {
            return Err(TransportError::NotInitialized);
        }
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "injected send failure",
            )));
        }
        lock(&self.outbound)?.chunks.push_back(data.to_vec());
        Ok(())
    }

    fn fetch_data(&mut self) -> Result<Vec<u8>, TransportError> {
        if !self.initialized {
            return Err(TransportError::NotInitialized);
        }
        let mut inbound = lock(&self.inbound)?;
        match inbound.chunks.pop_front() {
            Some(chunk) => Ok(chunk),
            None => {
                if inbound.closed {
                    self.closed = true;
                }
                Ok(Vec::new())
            }
        }
    }

    fn close_connection(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        lock(&self.outbound)?.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn set_timeout(&mut self, _timeout: Duration) {}
}

/// Test-side handle on a [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct MemoryControl {
    inbound: SharedChannel,
    outbound: SharedChannel,
    fail_sends: Arc<AtomicBool>,
}

impl MemoryControl {
    /// Make every following send of the transport fail with an I/O error.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Queue bytes as if the peer had sent them.
    pub fn inject(&self, data: &[u8]) -> Result<(), TransportError> {
        lock(&self.inbound)?.chunks.push_back(data.to_vec());
        Ok(())
    }

    /// Chunks the transport sent that the peer has not fetched yet.
    pub fn pending_outbound(&self) -> Result<usize, TransportError> {
        Ok(lock(&self.outbound)?.chunks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_delivers_chunks_in_order() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.send_data(b"one").unwrap();
        a.send_data(b"two").unwrap();
        assert_eq!(b.fetch_data().unwrap(), b"one");
        assert_eq!(b.fetch_data().unwrap(), b"two");
        assert!(b.fetch_data().unwrap().is_empty());
        assert!(a.fetch_data().unwrap().is_empty());
    }

    #[test]
    fn test_injected_failure() {
        let (mut a, _b) = MemoryTransport::pair();
        let control = a.control();
        control.set_fail_sends(true);
        assert!(matches!(a.send_data(b"x"), Err(TransportError::Io(_))));
        control.set_fail_sends(false);
        a.send_data(b"x").unwrap();
        assert_eq!(control.pending_outbound().unwrap(), 1);
    }

    #[test]
    fn test_close_is_observed_by_peer() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.send_data(b"last").unwrap();
        a.close_connection().unwrap();
        assert!(a.send_data(b"late").is_err());
        assert_eq!(b.fetch_data().unwrap(), b"last");
        assert!(!b.is_closed());
        assert!(b.fetch_data().unwrap().is_empty());
        assert!(b.is_closed());

        a.initialize().unwrap();
        a.send_data(b"again").unwrap();
        assert_eq!(b.fetch_data().unwrap(), b"again");
    }

    #[test]
    fn test_inject() {
        let (mut a, _b) = MemoryTransport::pair();
        a.control().inject(&[1, 2]).unwrap();
        assert_eq!(a.fetch_data().unwrap(), vec![1, 2]);
    }
}
