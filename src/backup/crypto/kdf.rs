//! Key derivation (spec §4.12 "KDF").
//!
//! Three selectable KDFs, matching the sibling backup-engine example's
//! dependency stack (`argon2`, `scrypt`, `pbkdf2`), each producing a
//! 32-byte master key from a passphrase and a per-repository salt. The
//! parameters used to derive a repository's key are persisted verbatim
//! in its CONFIG blob so a later `open` can reproduce the same key.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{RepoError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Argon2idParams {
    pub time: u32,
    pub memory_kib: u32,
    pub threads: u32,
    pub keylen: usize,
    pub salt: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScryptParams {
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
    pub keylen: usize,
    pub salt: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pbkdf2Params {
    pub iterations: u32,
    pub keylen: usize,
    pub salt: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum KdfParams {
    Argon2id(Argon2idParams),
    Scrypt(ScryptParams),
    Pbkdf2(Pbkdf2Params),
}

impl KdfParams {
    /// Default parameters for a freshly created repository: Argon2id,
    /// matching spec §4.12's "Argon2id (default)".
    pub fn default_argon2id() -> Self {
        let mut salt = vec![0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        KdfParams::Argon2id(Argon2idParams {
            time: 3,
            memory_kib: 19 * 1024,
            threads: 1,
            keylen: 32,
            salt,
        })
    }

    pub fn salt(&self) -> &[u8] {
        match self {
            KdfParams::Argon2id(p) => &p.salt,
            KdfParams::Scrypt(p) => &p.salt,
            KdfParams::Pbkdf2(p) => &p.salt,
        }
    }
}

/// Derives a 32-byte master key from `passphrase` under `params`.
pub fn derive_key(passphrase: &str, params: &KdfParams) -> Result<[u8; 32]> {
    let mut out = [0u8; 32];
    match params {
        KdfParams::Argon2id(p) => {
            use argon2::{Algorithm, Argon2, Params, Version};
            let argon_params = Params::new(p.memory_kib, p.time, p.threads, Some(p.keylen))
                .map_err(|e| RepoError::Crypto(format!("invalid argon2 params: {e}")))?;
            let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);
            argon2
                .hash_password_into(passphrase.as_bytes(), &p.salt, &mut out)
                .map_err(|e| RepoError::Crypto(format!("argon2id derivation failed: {e}")))?;
        }
        KdfParams::Scrypt(p) => {
            use scrypt::{scrypt, Params};
            let scrypt_params = Params::new(p.log_n, p.r, p.p, p.keylen)
                .map_err(|e| RepoError::Crypto(format!("invalid scrypt params: {e}")))?;
            scrypt(passphrase.as_bytes(), &p.salt, &scrypt_params, &mut out)
                .map_err(|e| RepoError::Crypto(format!("scrypt derivation failed: {e}")))?;
        }
        KdfParams::Pbkdf2(p) => {
            use pbkdf2::pbkdf2_hmac;
            use sha2::Sha256;
            pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), &p.salt, p.iterations, &mut out);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn argon2id_is_deterministic_for_same_salt() {
        let params = KdfParams::Argon2id(Argon2idParams {
            time: 1,
            memory_kib: 8 * 1024,
            threads: 1,
            keylen: 32,
            salt: vec![1u8; 16],
        });
        let a = derive_key("correct horse battery staple", &params).unwrap();
        let b = derive_key("correct horse battery staple", &params).unwrap();
        assert_eq!(a, b);
        let c = derive_key("wrong", &params).unwrap();
        assert_ne!(a, c);
    }
}
