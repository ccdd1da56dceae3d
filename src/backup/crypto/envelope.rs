//! Subkey wrap and streaming AEAD (spec §4.12 "Subkey wrap", "Data AEAD").
//!
//! Every encrypted blob gets a fresh random 256-bit subkey. The subkey is
//! wrapped with the repository's master key (AES-KW by default, AES-GCM
//! as the alternative) and prefixed to the ciphertext; the body itself is
//! AES-GCM-SIV in independent fixed-size chunks so a reader can seek to
//! any chunk without decrypting the whole stream, mirroring the
//! chunk-at-a-time construction the sibling backup-engine example uses
//! for its own snapshot stream encryption (encrypt one bounded chunk at
//! a time, accumulate a tag per chunk).

use aes_gcm_siv::aead::{Aead, KeyInit};
use aes_gcm_siv::{Aes256GcmSiv, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{RepoError, Result};

/// Default chunk size for the streaming AEAD body (spec §4.12: "default
/// 64 KiB").
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubkeyWrap {
    AesKw,
    AesGcm,
}

/// Length of `wrap_subkey`'s output for a given wrap choice: AES-KW adds
/// an 8-byte integrity block (32 + 8); AES-GCM prefixes a 12-byte nonce
/// to a 32-byte-subkey-plus-16-byte-tag ciphertext (12 + 32 + 16).
fn wrapped_subkey_len(wrap: SubkeyWrap) -> usize {
    match wrap {
        SubkeyWrap::AesKw => 32 + 8,
        SubkeyWrap::AesGcm => 12 + 32 + 16,
    }
}

/// Wraps a fresh random subkey with `master_key` and returns
/// `wrapped_subkey || base_nonce || ciphertext`, ready to be the body of
/// an encrypted blob (spec §4.1: "wrapped subkey is prefixed to the
/// ciphertext").
pub fn encrypt(
    master_key: &[u8; 32],
    wrap: SubkeyWrap,
    chunk_size: usize,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let mut subkey = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut subkey);

    let wrapped = wrap_subkey(master_key, wrap, &subkey)?;

    let mut base_nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut base_nonce);

    let body = encrypt_stream(&subkey, &base_nonce, chunk_size, plaintext)?;

    let mut out = Vec::with_capacity(wrapped.len() + 12 + body.len());
    out.extend_from_slice(&wrapped);
    out.extend_from_slice(&base_nonce);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Inverse of [`encrypt`]: unwraps the subkey and decrypts the chunked
/// body, verifying every chunk's AEAD tag.
pub fn decrypt(
    master_key: &[u8; 32],
    wrap: SubkeyWrap,
    chunk_size: usize,
    data: &[u8],
) -> Result<Vec<u8>> {
    let wrapped_len = wrapped_subkey_len(wrap);
    if data.len() < wrapped_len + 12 {
        return Err(RepoError::Corrupted("envelope too short".into()));
    }
    let (wrapped, rest) = data.split_at(wrapped_len);
    let (base_nonce, body) = rest.split_at(12);

    let subkey = unwrap_subkey(master_key, wrap, wrapped)?;
    let base_nonce: [u8; 12] = base_nonce
        .try_into()
        .map_err(|_| RepoError::Corrupted("bad envelope nonce".into()))?;

    decrypt_stream(&subkey, &base_nonce, chunk_size, body)
}

fn wrap_subkey(master_key: &[u8; 32], wrap: SubkeyWrap, subkey: &[u8; 32]) -> Result<Vec<u8>> {
    match wrap {
        SubkeyWrap::AesKw => {
            use aes_kw::KekAes256;
            let kek = KekAes256::new(master_key.into());
            kek.wrap_vec(subkey)
                .map_err(|e| RepoError::Crypto(format!("AES-KW wrap failed: {e}")))
        }
        SubkeyWrap::AesGcm => {
            use aes_gcm::aead::{Aead as _, KeyInit as _};
            use aes_gcm::{Aes256Gcm, Nonce as GcmNonce};
            let cipher = Aes256Gcm::new(master_key.into());
            let mut nonce_bytes = [0u8; 12];
            rand::thread_rng().fill_bytes(&mut nonce_bytes);
            let nonce = GcmNonce::from_slice(&nonce_bytes);
            let ct = cipher
                .encrypt(nonce, subkey.as_slice())
                .map_err(|e| RepoError::Crypto(format!("AES-GCM wrap failed: {e}")))?;
            let mut out = Vec::with_capacity(12 + ct.len());
            out.extend_from_slice(&nonce_bytes);
            out.extend_from_slice(&ct);
            Ok(out)
        }
    }
}

fn unwrap_subkey(master_key: &[u8; 32], wrap: SubkeyWrap, wrapped: &[u8]) -> Result<[u8; 32]> {
    match wrap {
        SubkeyWrap::AesKw => {
            use aes_kw::KekAes256;
            let kek = KekAes256::new(master_key.into());
            let out = kek
                .unwrap_vec(wrapped)
                .map_err(|_| RepoError::Crypto("AES-KW unwrap failed (bad key?)".into()))?;
            out.try_into()
                .map_err(|_| RepoError::Corrupted("unwrapped subkey has wrong length".into()))
        }
        SubkeyWrap::AesGcm => {
            use aes_gcm::aead::{Aead as _, KeyInit as _};
            use aes_gcm::{Aes256Gcm, Nonce as GcmNonce};
            if wrapped.len() < 12 {
                return Err(RepoError::Corrupted("wrapped subkey too short".into()));
            }
            let (nonce_bytes, ct) = wrapped.split_at(12);
            let cipher = Aes256Gcm::new(master_key.into());
            let nonce = GcmNonce::from_slice(nonce_bytes);
            let pt = cipher
                .decrypt(nonce, ct)
                .map_err(|_| RepoError::Crypto("AES-GCM unwrap failed (bad key?)".into()))?;
            pt.try_into()
                .map_err(|_| RepoError::Corrupted("unwrapped subkey has wrong length".into()))
        }
    }
}

/// Chunk `base_nonce` by XOR-ing a big-endian chunk counter into its last
/// 4 bytes, giving every chunk in the stream a distinct nonce while
/// keeping the envelope's per-message overhead to one base nonce.
fn chunk_nonce(base_nonce: &[u8; 12], index: u32) -> Nonce {
    let mut n = *base_nonce;
    let ctr = index.to_be_bytes();
    for i in 0..4 {
        n[8 + i] ^= ctr[i];
    }
    *Nonce::from_slice(&n)
}

fn encrypt_stream(
    subkey: &[u8; 32],
    base_nonce: &[u8; 12],
    chunk_size: usize,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256GcmSiv::new(subkey.into());
    let mut out = Vec::with_capacity(plaintext.len() + plaintext.len() / chunk_size.max(1) * 16 + 16);
    for (index, chunk) in plaintext.chunks(chunk_size.max(1)).enumerate() {
        let nonce = chunk_nonce(base_nonce, index as u32);
        let ct = cipher
            .encrypt(&nonce, chunk)
            .map_err(|e| RepoError::Crypto(format!("AES-GCM-SIV encrypt failed: {e}")))?;
        out.extend_from_slice(&(ct.len() as u32).to_be_bytes());
        out.extend_from_slice(&ct);
    }
    Ok(out)
}

fn decrypt_stream(
    subkey: &[u8; 32],
    base_nonce: &[u8; 12],
    _chunk_size: usize,
    body: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256GcmSiv::new(subkey.into());
    let mut out = Vec::new();
    let mut pos = 0usize;
    let mut index = 0u32;
    while pos < body.len() {
        if pos + 4 > body.len() {
            return Err(RepoError::Corrupted("truncated AEAD chunk length".into()));
        }
        let len = u32::from_be_bytes(body[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + len > body.len() {
            return Err(RepoError::Corrupted("truncated AEAD chunk body".into()));
        }
        let nonce = chunk_nonce(base_nonce, index);
        let pt = cipher
            .decrypt(&nonce, &body[pos..pos + len])
            .map_err(|_| RepoError::Crypto("AES-GCM-SIV tag verification failed".into()))?;
        out.extend_from_slice(&pt);
        pos += len;
        index += 1;
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_small() {
        let key = [9u8; 32];
        let pt = b"hello dummy";
        let ct = encrypt(&key, SubkeyWrap::AesKw, DEFAULT_CHUNK_SIZE, pt).unwrap();
        let back = decrypt(&key, SubkeyWrap::AesKw, DEFAULT_CHUNK_SIZE, &ct).unwrap();
        assert_eq!(back, pt);
    }

    #[test]
    fn roundtrip_multi_chunk() {
        let key = [3u8; 32];
        let pt = vec![42u8; 200_000];
        let ct = encrypt(&key, SubkeyWrap::AesKw, 64 * 1024, &pt).unwrap();
        let back = decrypt(&key, SubkeyWrap::AesKw, 64 * 1024, &ct).unwrap();
        assert_eq!(back, pt);
    }

    #[test]
    fn wrong_key_fails() {
        let key = [9u8; 32];
        let other = [8u8; 32];
        let ct = encrypt(&key, SubkeyWrap::AesKw, DEFAULT_CHUNK_SIZE, b"secret").unwrap();
        assert!(decrypt(&other, SubkeyWrap::AesKw, DEFAULT_CHUNK_SIZE, &ct).is_err());
    }

    #[test]
    fn aes_gcm_wrap_roundtrip() {
        let key = [5u8; 32];
        let ct = encrypt(&key, SubkeyWrap::AesGcm, DEFAULT_CHUNK_SIZE, b"hello foo").unwrap();
        let back = decrypt(&key, SubkeyWrap::AesGcm, DEFAULT_CHUNK_SIZE, &ct).unwrap();
        assert_eq!(back, b"hello foo");
    }
}
