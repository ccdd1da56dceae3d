//! Encryption envelope (spec §4.12, C12): KDF, subkey wrap, streaming
//! AEAD and canary verification, composed into the `EncryptionConfig`
//! persisted in the repository's CONFIG blob (spec §4.5).

pub mod canary;
pub mod envelope;
pub mod kdf;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use envelope::SubkeyWrap;
pub use kdf::KdfParams;

/// Persisted encryption configuration (spec §4.5 CONFIG `encryption?`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub kdf: KdfParams,
    pub subkey_wrap: SubkeyWrap,
    pub chunk_size: usize,
    pub canary: Vec<u8>,
}

impl EncryptionConfig {
    /// Creates a fresh encryption configuration for a new repository,
    /// deriving the master key from `passphrase` and embedding a canary.
    pub fn create(passphrase: &str) -> Result<(Self, [u8; 32])> {
        let kdf = KdfParams::default_argon2id();
        let master_key = kdf::derive_key(passphrase, &kdf)?;
        let subkey_wrap = SubkeyWrap::AesKw;
        let canary = canary::create(&master_key, subkey_wrap)?;
        Ok((
            Self {
                kdf,
                subkey_wrap,
                chunk_size: envelope::DEFAULT_CHUNK_SIZE,
                canary,
            },
            master_key,
        ))
    }

    /// Re-derives the master key from `passphrase` and verifies it
    /// against the stored canary, returning the key on success.
    pub fn unlock(&self, passphrase: &str) -> Result<[u8; 32]> {
        let master_key = kdf::derive_key(passphrase, &self.kdf)?;
        if canary::verify(&master_key, self.subkey_wrap, &self.canary) {
            Ok(master_key)
        } else {
            Err(crate::error::RepoError::Crypto(
                "passphrase does not match repository canary".into(),
            ))
        }
    }

    pub fn encrypt(&self, master_key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
        envelope::encrypt(master_key, self.subkey_wrap, self.chunk_size, plaintext)
    }

    pub fn decrypt(&self, master_key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
        envelope::decrypt(master_key, self.subkey_wrap, self.chunk_size, data)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_unlock_roundtrip() {
        let (cfg, key) = EncryptionConfig::create("correct horse battery staple").unwrap();
        let unlocked = cfg.unlock("correct horse battery staple").unwrap();
        assert_eq!(key, unlocked);
        assert!(cfg.unlock("wrong").is_err());
    }
}
