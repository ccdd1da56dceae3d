//! Canary verification (spec §4.12 "Canary").
//!
//! At repository creation a random 32-byte buffer is encrypted with the
//! derived master key and stored in the CONFIG blob. Unlocking re-derives
//! the key from the supplied passphrase and attempts to decrypt the
//! canary: success confirms the passphrase without ever touching real
//! repository data.

use rand::RngCore;

use crate::error::Result;

use super::envelope::{self, SubkeyWrap, DEFAULT_CHUNK_SIZE};

/// Creates a fresh canary, encrypted under `master_key`. The returned
/// bytes are what gets persisted in the CONFIG blob.
pub fn create(master_key: &[u8; 32], wrap: SubkeyWrap) -> Result<Vec<u8>> {
    let mut plain = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut plain);
    envelope::encrypt(master_key, wrap, DEFAULT_CHUNK_SIZE, &plain)
}

/// Returns `true` iff `master_key` (derived from a candidate passphrase)
/// successfully decrypts `stored_canary`.
pub fn verify(master_key: &[u8; 32], wrap: SubkeyWrap, stored_canary: &[u8]) -> bool {
    envelope::decrypt(master_key, wrap, DEFAULT_CHUNK_SIZE, stored_canary)
        .map(|pt| pt.len() == 32)
        .unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backup::crypto::kdf::{derive_key, KdfParams};

    #[test]
    fn canary_detects_correct_and_wrong_passphrase() {
        let params = KdfParams::default_argon2id();
        let key = derive_key("correct horse battery staple", &params).unwrap();
        let canary = create(&key, SubkeyWrap::AesKw).unwrap();

        let same_key = derive_key("correct horse battery staple", &params).unwrap();
        assert!(verify(&same_key, SubkeyWrap::AesKw, &canary));

        let wrong_key = derive_key("wrong", &params).unwrap();
        assert!(!verify(&wrong_key, SubkeyWrap::AesKw, &canary));
    }
}
