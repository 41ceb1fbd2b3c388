//! Running transcript digest over handshake messages.
//!
//! Uses a message buffer + replay approach: `current_hash()` creates a fresh
//! hasher and replays every buffered message, so the transcript can be hashed
//! with whichever algorithm the suite selected after the fact.

use sha2::{Digest, Sha256, Sha384};

use super::HashAlgorithm;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptDigest {
    message_buffer: Vec<u8>,
}

impl TranscriptDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed handshake message bytes into the transcript.
    pub fn update(&mut self, data: &[u8]) {
        self.message_buffer.extend_from_slice(data);
    }

    pub fn current_hash(&self, alg: HashAlgorithm) -> Vec<u8> {
        match alg {
            HashAlgorithm::Sha256 => Sha256::digest(&self.message_buffer).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(&self.message_buffer).to_vec(),
        }
    }

    /// Drop everything hashed so far.
    pub fn reset(&mut self) {
        self.message_buffer.clear();
    }

    pub fn raw(&self) -> &[u8] {
        &self.message_buffer
    }

    pub fn len(&self) -> usize {
        self.message_buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.message_buffer.is_empty()
    }
}
