//! Per-direction history of record ciphers, indexed by epoch.
//!
//! The history starts with a null cipher at epoch 0. Activation pushes a new
//! cipher, deactivation pushes a null cipher, and rollback pops entries. Older
//! entries stay reachable by epoch so retransmissions can reuse the cipher of
//! the epoch a record was originally sent in.

use super::cipher::{NullCipher, RecordCipher};
use crate::CipherSuite;

/// One history entry: the cipher installed for an epoch.
#[derive(Debug)]
pub struct EpochCipher {
    pub epoch: u16,
    pub cipher: Box<dyn RecordCipher>,
}

/// Stack of ciphers for one direction; the last entry is the active one.
#[derive(Debug)]
pub struct CipherEpochState {
    history: Vec<EpochCipher>,
}

impl CipherEpochState {
    pub fn new() -> Self {
        Self {
            history: vec![EpochCipher {
                epoch: 0,
                cipher: Box::new(NullCipher),
            }],
        }
    }

    /// Push `cipher` as the active cipher for `epoch`.
    pub fn activate(&mut self, epoch: u16, cipher: Box<dyn RecordCipher>) {
        self.history.push(EpochCipher { epoch, cipher });
    }

    /// Push a null cipher for `epoch`.
    pub fn deactivate(&mut self, epoch: u16) {
        self.activate(epoch, Box::new(NullCipher));
    }

    /// Replace the cipher of the active entry, keeping its epoch.
    pub fn replace_current(&mut self, cipher: Box<dyn RecordCipher>) {
        if let Some(last) = self.history.last_mut() {
            last.cipher = cipher;
        }
    }

    /// Pop up to `n` of the most recent entries. The initial entry is never
    /// removed. Returns the number of entries popped.
    pub fn rollback(&mut self, n: usize) -> usize {
        let removable = self.history.len().saturating_sub(1);
        let count = n.min(removable);
        self.history.truncate(self.history.len() - count);
        count
    }

    /// Back to a single null cipher at epoch 0.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn current(&self) -> &EpochCipher {
        // The history always holds the initial entry.
        &self.history[self.history.len() - 1]
    }

    pub fn current_mut(&mut self) -> &mut EpochCipher {
        let last = self.history.len() - 1;
        &mut self.history[last]
    }

    pub fn current_epoch(&self) -> u16 {
        self.current().epoch
    }

    /// Most recently installed cipher for `epoch`.
    pub fn cipher_for_epoch(&mut self, epoch: u16) -> Option<&mut EpochCipher> {
        self.history.iter_mut().rev().find(|e| e.epoch == epoch)
    }

    /// Cipher for `epoch`, falling back to the active cipher.
    pub fn cipher_for_epoch_or_current(&mut self, epoch: u16) -> &mut EpochCipher {
        match self.history.iter().rposition(|e| e.epoch == epoch) {
            Some(i) => &mut self.history[i],
            None => self.current_mut(),
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// `(epoch, suite)` for every entry, oldest first.
    pub fn history(&self) -> Vec<(u16, Option<CipherSuite>)> {
        self.history
            .iter()
            .map(|e| (e.epoch, e.cipher.suite()))
            .collect()
    }
}

impl Default for CipherEpochState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::cipher::{ProtectedFragment, RecordCryptoInput};
    use tlscript_types::CryptoError;

    #[derive(Debug)]
    struct TaggedCipher(CipherSuite);

    impl RecordCipher for TaggedCipher {
        fn suite(&self) -> Option<CipherSuite> {
            Some(self.0)
        }

        fn encrypt(
            &mut self,
            input: &RecordCryptoInput<'_>,
            plaintext: &[u8],
        ) -> Result<ProtectedFragment, CryptoError> {
            Ok(ProtectedFragment {
                content_type: input.content_type,
                fragment: plaintext.iter().rev().copied().collect(),
            })
        }

        fn decrypt(
            &mut self,
            input: &RecordCryptoInput<'_>,
            fragment: &[u8],
        ) -> Result<ProtectedFragment, CryptoError> {
            self.encrypt(input, fragment)
        }
    }

    #[test]
    fn test_initial_state_is_null_epoch_zero() {
        let state = CipherEpochState::new();
        assert_eq!(state.len(), 1);
        assert_eq!(state.current_epoch(), 0);
        assert!(state.current().cipher.is_null());
    }

    #[test]
    fn test_activate_deactivate_history() {
        let mut state = CipherEpochState::new();
        state.activate(1, Box::new(TaggedCipher(CipherSuite::TLS_AES_128_GCM_SHA256)));
        assert_eq!(state.current_epoch(), 1);
        assert!(!state.current().cipher.is_null());

        state.deactivate(1);
        assert!(state.current().cipher.is_null());
        assert_eq!(
            state.history(),
            vec![
                (0, None),
                (1, Some(CipherSuite::TLS_AES_128_GCM_SHA256)),
                (1, None),
            ]
        );
    }

    #[test]
    fn test_cipher_for_epoch_keeps_old_entries() {
        let mut state = CipherEpochState::new();
        state.activate(1, Box::new(TaggedCipher(CipherSuite::TLS_AES_128_GCM_SHA256)));
        state.activate(2, Box::new(TaggedCipher(CipherSuite::TLS_AES_256_GCM_SHA384)));

        let e1 = state.cipher_for_epoch(1).unwrap();
        assert_eq!(e1.cipher.suite(), Some(CipherSuite::TLS_AES_128_GCM_SHA256));
        assert!(state.cipher_for_epoch(7).is_none());
        assert_eq!(state.cipher_for_epoch_or_current(7).epoch, 2);
    }

    #[test]
    fn test_rollback_never_removes_initial_entry() {
        let mut state = CipherEpochState::new();
        state.activate(1, Box::new(TaggedCipher(CipherSuite::TLS_AES_128_GCM_SHA256)));
        state.activate(2, Box::new(TaggedCipher(CipherSuite::TLS_AES_128_GCM_SHA256)));
        assert_eq!(state.rollback(1), 1);
        assert_eq!(state.current_epoch(), 1);
        assert_eq!(state.rollback(10), 1);
        assert_eq!(state.len(), 1);
        assert!(state.current().cipher.is_null());
        assert_eq!(state.rollback(1), 0);
    }

    #[test]
    fn test_replace_current_keeps_epoch() {
        let mut state = CipherEpochState::new();
        state.activate(3, Box::new(TaggedCipher(CipherSuite::TLS_AES_128_GCM_SHA256)));
        state.replace_current(Box::new(TaggedCipher(CipherSuite::TLS_CHACHA20_POLY1305_SHA256)));
        assert_eq!(state.current_epoch(), 3);
        assert_eq!(
            state.current().cipher.suite(),
            Some(CipherSuite::TLS_CHACHA20_POLY1305_SHA256)
        );
        state.reset();
        assert_eq!(state.len(), 1);
    }
}
