//! Record protection interface and the null cipher.

use std::fmt;

use tlscript_types::CryptoError;

use super::ContentType;
use crate::{CipherSuite, ProtocolVersion};

/// Per-record inputs to protection: everything that feeds the nonce and AAD.
#[derive(Debug, Clone, Copy)]
pub struct RecordCryptoInput<'a> {
    pub content_type: ContentType,
    pub version: ProtocolVersion,
    pub epoch: u16,
    pub sequence_number: u64,
    pub dtls: bool,
    /// Explicit additional data, used instead of the record header
    /// (QUIC packet protection authenticates the packet header).
    pub header: Option<&'a [u8]>,
}

impl RecordCryptoInput<'_> {
    /// Sequence number fed into the nonce; DTLS prefixes the epoch.
    pub fn nonce_sequence(&self) -> u64 {
        if self.dtls {
            (u64::from(self.epoch) << 48) | (self.sequence_number & super::MAX_SEQ_48)
        } else {
            self.sequence_number
        }
    }
}

/// Output of one protection operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedFragment {
    pub content_type: ContentType,
    pub fragment: Vec<u8>,
}

/// A directional record cipher.
pub trait RecordCipher: fmt::Debug + Send {
    /// Suite this cipher was built for; `None` for the null cipher.
    fn suite(&self) -> Option<CipherSuite>;

    fn is_null(&self) -> bool {
        self.suite().is_none()
    }

    /// Bytes protection adds to a plaintext.
    fn tag_len(&self) -> usize {
        0
    }

    fn encrypt(
        &mut self,
        input: &RecordCryptoInput<'_>,
        plaintext: &[u8],
    ) -> Result<ProtectedFragment, CryptoError>;

    fn decrypt(
        &mut self,
        input: &RecordCryptoInput<'_>,
        fragment: &[u8],
    ) -> Result<ProtectedFragment, CryptoError>;
}

/// Passes records through unprotected.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCipher;

impl RecordCipher for NullCipher {
    fn suite(&self) -> Option<CipherSuite> {
        None
    }

    fn encrypt(
        &mut self,
        input: &RecordCryptoInput<'_>,
        plaintext: &[u8],
    ) -> Result<ProtectedFragment, CryptoError> {
        Ok(ProtectedFragment {
            content_type: input.content_type,
            fragment: plaintext.to_vec(),
        })
    }

    fn decrypt(
        &mut self,
        input: &RecordCryptoInput<'_>,
        fragment: &[u8],
    ) -> Result<ProtectedFragment, CryptoError> {
        Ok(ProtectedFragment {
            content_type: input.content_type,
            fragment: fragment.to_vec(),
        })
    }
}
