//! Default crypto provider: HKDF key expansion and AEAD record protection.
//!
//! Nonce construction follows RFC 8446 §5.3 for every suite:
//! `nonce = iv XOR pad_left(sequence_number, iv_length)`.
//! TLS 1.3 records are wrapped in inner plaintext and authenticated with the
//! outer record header; earlier versions authenticate
//! `seq_num || type || version || plaintext_length`.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use sha2::{Sha256, Sha384};
use tlscript_types::CryptoError;
use zeroize::Zeroize;

use super::{
    AeadAlgorithm, CipherDirection, CipherSuiteParams, CryptoProvider, HashAlgorithm, KeySet,
    TrafficKeys,
};
use crate::context::TlsContext;
use crate::record::cipher::{ProtectedFragment, RecordCipher, RecordCryptoInput};
use crate::record::{build_inner_plaintext, parse_inner_plaintext, ContentType};
use crate::CipherSuite;

/// HKDF info label for the key block.
const KEY_EXPANSION_LABEL: &[u8] = b"tlscript key expansion";

/// AEAD nonce size.
const NONCE_LEN: usize = 12;

fn build_nonce_from_iv_seq(iv: &[u8], seq: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..12].copy_from_slice(&seq.to_be_bytes());
    for (n, i) in nonce.iter_mut().zip(iv) {
        *n ^= i;
    }
    nonce
}

/// `seq_num(8) || type(1) || version(2) || length(2)`
fn build_legacy_aad(input: &RecordCryptoInput<'_>, content_type: ContentType, len: usize) -> Vec<u8> {
    let mut aad = Vec::with_capacity(13);
    aad.extend_from_slice(&input.nonce_sequence().to_be_bytes());
    aad.push(content_type.as_u8());
    aad.extend_from_slice(&input.version.to_be_bytes());
    aad.extend_from_slice(&(len as u16).to_be_bytes());
    aad
}

/// `opaque_type(1) || legacy_record_version(2) || length(2)`
fn build_tls13_aad(input: &RecordCryptoInput<'_>, ciphertext_len: usize) -> Vec<u8> {
    let mut aad = Vec::with_capacity(5);
    aad.push(ContentType::ApplicationData.as_u8());
    aad.extend_from_slice(&input.version.record_version().to_be_bytes());
    aad.extend_from_slice(&(ciphertext_len as u16).to_be_bytes());
    aad
}

enum AeadKind {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

impl AeadKind {
    fn new(params: &CipherSuiteParams, key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != params.key_len {
            return Err(CryptoError::InvalidKeyLength {
                expected: params.key_len,
                got: key.len(),
            });
        }
        let invalid = |_| CryptoError::InvalidKeyLength {
            expected: params.key_len,
            got: key.len(),
        };
        Ok(match params.aead {
            AeadAlgorithm::Aes128Gcm => {
                AeadKind::Aes128(Box::new(Aes128Gcm::new_from_slice(key).map_err(invalid)?))
            }
            AeadAlgorithm::Aes256Gcm => {
                AeadKind::Aes256(Box::new(Aes256Gcm::new_from_slice(key).map_err(invalid)?))
            }
            AeadAlgorithm::ChaCha20Poly1305 => AeadKind::ChaCha(Box::new(
                ChaCha20Poly1305::new_from_slice(key).map_err(invalid)?,
            )),
        })
    }

    fn seal(&self, nonce: &[u8; NONCE_LEN], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let payload = Payload { msg, aad };
        match self {
            AeadKind::Aes128(c) => c.encrypt(aes_gcm::Nonce::from_slice(nonce), payload),
            AeadKind::Aes256(c) => c.encrypt(aes_gcm::Nonce::from_slice(nonce), payload),
            AeadKind::ChaCha(c) => c.encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload),
        }
        .map_err(|_| CryptoError::EncryptFailed)
    }

    fn open(&self, nonce: &[u8; NONCE_LEN], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let payload = Payload { msg, aad };
        match self {
            AeadKind::Aes128(c) => c.decrypt(aes_gcm::Nonce::from_slice(nonce), payload),
            AeadKind::Aes256(c) => c.decrypt(aes_gcm::Nonce::from_slice(nonce), payload),
            AeadKind::ChaCha(c) => c.decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload),
        }
        .map_err(|_| CryptoError::AeadTagVerifyFail)
    }
}

/// AEAD record cipher for one direction.
pub struct AeadRecordCipher {
    params: CipherSuiteParams,
    direction: CipherDirection,
    aead: AeadKind,
    iv: Vec<u8>,
}

impl Drop for AeadRecordCipher {
    fn drop(&mut self) {
        self.iv.zeroize();
    }
}

impl fmt::Debug for AeadRecordCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AeadRecordCipher")
            .field("suite", &self.params.suite)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

impl AeadRecordCipher {
    pub fn new(
        suite: CipherSuite,
        keys: &TrafficKeys,
        direction: CipherDirection,
    ) -> Result<Self, CryptoError> {
        let params = CipherSuiteParams::from_suite(suite)?;
        if keys.iv.len() != params.iv_len {
            return Err(CryptoError::InvalidIvLength);
        }
        Ok(Self {
            aead: AeadKind::new(&params, &keys.key)?,
            params,
            direction,
            iv: keys.iv.clone(),
        })
    }

    pub fn direction(&self) -> CipherDirection {
        self.direction
    }
}

impl RecordCipher for AeadRecordCipher {
    fn suite(&self) -> Option<CipherSuite> {
        Some(self.params.suite)
    }

    fn tag_len(&self) -> usize {
        self.params.tag_len
    }

    fn encrypt(
        &mut self,
        input: &RecordCryptoInput<'_>,
        plaintext: &[u8],
    ) -> Result<ProtectedFragment, CryptoError> {
        let nonce = build_nonce_from_iv_seq(&self.iv, input.nonce_sequence());
        if let Some(header) = input.header {
            let fragment = self.aead.seal(&nonce, plaintext, header)?;
            return Ok(ProtectedFragment {
                content_type: input.content_type,
                fragment,
            });
        }
        if input.version.is_tls13() {
            let inner = build_inner_plaintext(input.content_type, plaintext, 0);
            let aad = build_tls13_aad(input, inner.len() + self.params.tag_len);
            let fragment = self.aead.seal(&nonce, &inner, &aad)?;
            Ok(ProtectedFragment {
                content_type: ContentType::ApplicationData,
                fragment,
            })
        } else {
            let aad = build_legacy_aad(input, input.content_type, plaintext.len());
            let fragment = self.aead.seal(&nonce, plaintext, &aad)?;
            Ok(ProtectedFragment {
                content_type: input.content_type,
                fragment,
            })
        }
    }

    fn decrypt(
        &mut self,
        input: &RecordCryptoInput<'_>,
        fragment: &[u8],
    ) -> Result<ProtectedFragment, CryptoError> {
        if fragment.len() < self.params.tag_len {
            return Err(CryptoError::Record("ciphertext shorter than tag".into()));
        }
        let nonce = build_nonce_from_iv_seq(&self.iv, input.nonce_sequence());
        if let Some(header) = input.header {
            let plaintext = self.aead.open(&nonce, fragment, header)?;
            return Ok(ProtectedFragment {
                content_type: input.content_type,
                fragment: plaintext,
            });
        }
        if input.version.is_tls13() {
            let aad = build_tls13_aad(input, fragment.len());
            let inner = self.aead.open(&nonce, fragment, &aad)?;
            let (content_type, content) = parse_inner_plaintext(&inner)
                .map_err(|e| CryptoError::Record(e.to_string()))?;
            Ok(ProtectedFragment {
                content_type,
                fragment: content.to_vec(),
            })
        } else {
            let plaintext_len = fragment.len() - self.params.tag_len;
            let aad = build_legacy_aad(input, input.content_type, plaintext_len);
            let plaintext = self.aead.open(&nonce, fragment, &aad)?;
            Ok(ProtectedFragment {
                content_type: input.content_type,
                fragment: plaintext,
            })
        }
    }
}

/// HKDF-based key expansion over the master secret and both randoms.
///
/// ```text
/// okm = HKDF(salt = client_random || server_random, ikm = master_secret,
///            info = "tlscript key expansion")
/// client_key || server_key || client_iv || server_iv = okm
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct AeadCryptoProvider;

impl AeadCryptoProvider {
    pub fn new() -> Self {
        Self
    }

    fn expand(
        hash: HashAlgorithm,
        salt: &[u8],
        ikm: &[u8],
        okm: &mut [u8],
    ) -> Result<(), CryptoError> {
        match hash {
            HashAlgorithm::Sha256 => Hkdf::<Sha256>::new(Some(salt), ikm)
                .expand(KEY_EXPANSION_LABEL, okm)
                .map_err(|_| CryptoError::KeyDerivation),
            HashAlgorithm::Sha384 => Hkdf::<Sha384>::new(Some(salt), ikm)
                .expand(KEY_EXPANSION_LABEL, okm)
                .map_err(|_| CryptoError::KeyDerivation),
        }
    }
}

impl CryptoProvider for AeadCryptoProvider {
    fn derive_keys(&self, ctx: &TlsContext) -> Result<KeySet, CryptoError> {
        let params = CipherSuiteParams::from_suite(ctx.effective_cipher_suite())?;
        let mut salt = Vec::with_capacity(ctx.client_random.len() + ctx.server_random.len());
        salt.extend_from_slice(&ctx.client_random);
        salt.extend_from_slice(&ctx.server_random);

        let (k, i) = (params.key_len, params.iv_len);
        let mut okm = vec![0u8; 2 * (k + i)];
        Self::expand(params.hash, &salt, &ctx.master_secret, &mut okm)?;

        let keys = KeySet {
            client_write: TrafficKeys {
                key: okm[..k].to_vec(),
                iv: okm[2 * k..2 * k + i].to_vec(),
            },
            server_write: TrafficKeys {
                key: okm[k..2 * k].to_vec(),
                iv: okm[2 * k + i..].to_vec(),
            },
        };
        okm.zeroize();
        Ok(keys)
    }

    fn build_cipher(
        &self,
        suite: CipherSuite,
        keys: &TrafficKeys,
        direction: CipherDirection,
    ) -> Result<Box<dyn RecordCipher>, CryptoError> {
        Ok(Box::new(AeadRecordCipher::new(suite, keys, direction)?))
    }
}
