//! Key derivation and record cipher construction.
//!
//! The engine never builds ciphers itself: it asks a [`CryptoProvider`] to
//! derive a [`KeySet`] from the connection context and to turn traffic keys
//! into a [`RecordCipher`](crate::record::cipher::RecordCipher).

pub mod aead;
pub mod transcript;

use std::fmt;

use tlscript_types::CryptoError;
use zeroize::Zeroize;

use crate::context::TlsContext;
use crate::record::cipher::RecordCipher;
use crate::{CipherSuite, ConnectionEnd};

pub use aead::AeadCryptoProvider;
pub use transcript::TranscriptDigest;

/// Hash algorithm a suite uses for its PRF and transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
}

impl HashAlgorithm {
    pub fn output_len(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
        }
    }
}

/// Record AEAD algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadAlgorithm {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

/// Parameters derived from a cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSuiteParams {
    pub suite: CipherSuite,
    pub hash: HashAlgorithm,
    pub aead: AeadAlgorithm,
    pub key_len: usize,
    pub iv_len: usize,
    pub tag_len: usize,
}

impl CipherSuiteParams {
    pub fn from_suite(suite: CipherSuite) -> Result<Self, CryptoError> {
        let (hash, aead, key_len) = match suite {
            CipherSuite::TLS_AES_128_GCM_SHA256
            | CipherSuite::TLS_RSA_WITH_AES_128_GCM_SHA256
            | CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
            | CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256 => {
                (HashAlgorithm::Sha256, AeadAlgorithm::Aes128Gcm, 16)
            }
            CipherSuite::TLS_AES_256_GCM_SHA384
            | CipherSuite::TLS_RSA_WITH_AES_256_GCM_SHA384
            | CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
            | CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384 => {
                (HashAlgorithm::Sha384, AeadAlgorithm::Aes256Gcm, 32)
            }
            CipherSuite::TLS_CHACHA20_POLY1305_SHA256
            | CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256
            | CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256 => {
                (HashAlgorithm::Sha256, AeadAlgorithm::ChaCha20Poly1305, 32)
            }
            other => return Err(CryptoError::UnsupportedSuite(other.0)),
        };
        Ok(Self {
            suite,
            hash,
            aead,
            key_len,
            iv_len: 12,
            tag_len: 16,
        })
    }
}

/// Which way a cipher protects records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherDirection {
    Encrypt,
    Decrypt,
}

/// Concrete traffic keys (AEAD key + IV).
#[derive(Clone, PartialEq, Eq)]
pub struct TrafficKeys {
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
}

impl Drop for TrafficKeys {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
    }
}

impl fmt::Debug for TrafficKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrafficKeys")
            .field("key", &format!("[{} bytes]", self.key.len()))
            .field("iv", &format!("[{} bytes]", self.iv.len()))
            .finish()
    }
}

/// Keys for both write directions of a connection.
#[derive(Debug, Clone)]
pub struct KeySet {
    pub client_write: TrafficKeys,
    pub server_write: TrafficKeys,
}

impl KeySet {
    /// Keys the local `end` uses for `direction`.
    pub fn for_direction(&self, end: ConnectionEnd, direction: CipherDirection) -> &TrafficKeys {
        match (end, direction) {
            (ConnectionEnd::Client, CipherDirection::Encrypt)
            | (ConnectionEnd::Server, CipherDirection::Decrypt) => &self.client_write,
            (ConnectionEnd::Server, CipherDirection::Encrypt)
            | (ConnectionEnd::Client, CipherDirection::Decrypt) => &self.server_write,
        }
    }
}

/// Key derivation and cipher construction service.
pub trait CryptoProvider: fmt::Debug + Send + Sync {
    /// Derive both directions' traffic keys from the context's secrets for
    /// the context's effective cipher suite.
    fn derive_keys(&self, ctx: &TlsContext) -> Result<KeySet, CryptoError>;

    fn build_cipher(
        &self,
        suite: CipherSuite,
        keys: &TrafficKeys,
        direction: CipherDirection,
    ) -> Result<Box<dyn RecordCipher>, CryptoError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suite_params() {
        let p = CipherSuiteParams::from_suite(CipherSuite::TLS_AES_256_GCM_SHA384).unwrap();
        assert_eq!(p.key_len, 32);
        assert_eq!(p.hash, HashAlgorithm::Sha384);
        assert_eq!(p.hash.output_len(), 48);

        let p = CipherSuiteParams::from_suite(CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256)
            .unwrap();
        assert_eq!(p.aead, AeadAlgorithm::ChaCha20Poly1305);

        assert_eq!(
            CipherSuiteParams::from_suite(CipherSuite(0x0005)),
            Err(CryptoError::UnsupportedSuite(0x0005))
        );
    }

    #[test]
    fn test_key_set_direction() {
        let keys = KeySet {
            client_write: TrafficKeys {
                key: vec![1; 16],
                iv: vec![1; 12],
            },
            server_write: TrafficKeys {
                key: vec![2; 16],
                iv: vec![2; 12],
            },
        };
        assert_eq!(
            keys.for_direction(ConnectionEnd::Client, CipherDirection::Encrypt).key,
            vec![1; 16]
        );
        assert_eq!(
            keys.for_direction(ConnectionEnd::Client, CipherDirection::Decrypt).key,
            vec![2; 16]
        );
        assert_eq!(
            keys.for_direction(ConnectionEnd::Server, CipherDirection::Decrypt).key,
            vec![1; 16]
        );
    }

    #[test]
    fn test_traffic_keys_debug_redacts() {
        let keys = TrafficKeys {
            key: vec![0xAB; 16],
            iv: vec![0xCD; 12],
        };
        let dbg = format!("{keys:?}");
        assert!(dbg.contains("[16 bytes]"));
        assert!(!dbg.contains("171"));
    }
}
