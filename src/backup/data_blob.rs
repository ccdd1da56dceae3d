//! Blob codec (spec §4.1 "Blob codec", C1).
//!
//! Every persisted resource is wrapped the same way: a small fixed
//! header (`magic`, `resource_type`, `version`, `plaintext_mac`) followed
//! by a body that is optionally zstd-compressed and optionally wrapped
//! in the streaming AEAD envelope (`backup::crypto::envelope`). This
//! mirrors the teacher's `DataBlob`/`DataBlobHeader` framing (magic-tagged
//! header, `UNCOMPRESSED`/`COMPRESSED`/`ENCRYPTED` variants selected by
//! which header fields are present) but with a single header shape and
//! boolean flags instead of one magic constant per combination, since
//! this spec's resources span many more types than the teacher's
//! chunk/blob/index trio.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::error::{RepoError, Result};
use crate::mac::{compute_mac, Mac};
use crate::resource::{ResourceType, ResourceVersion};

use super::crypto::EncryptionConfig;

/// 8-byte magic identifying this crate's blob framing, to fail fast on
/// data written by something else rather than walking into a bogus MAC
/// mismatch.
pub const MAGIC: [u8; 8] = *b"BRROWBL1";

bitflags::bitflags! {
    pub struct BlobFlags: u8 {
        const COMPRESSED = 0b0000_0001;
        const ENCRYPTED  = 0b0000_0010;
    }
}

/// Per-repository compression choice (spec §4.1: "Compression is a
/// per-repository choice (algorithm + level)").
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { level: 3 }
    }
}

/// The handful of ambient parameters every `serialize`/`deserialize` call
/// needs: the repository's MAC key, and its optional compression /
/// encryption configuration.
pub struct Codec<'a> {
    pub mac_key: &'a [u8; 32],
    pub compression: Option<CompressionConfig>,
    pub encryption: Option<(&'a EncryptionConfig, &'a [u8; 32])>,
}

impl<'a> Codec<'a> {
    pub fn new(mac_key: &'a [u8; 32]) -> Self {
        Self {
            mac_key,
            compression: None,
            encryption: None,
        }
    }

    pub fn with_compression(mut self, cfg: CompressionConfig) -> Self {
        self.compression = Some(cfg);
        self
    }

    pub fn with_encryption(mut self, cfg: &'a EncryptionConfig, master_key: &'a [u8; 32]) -> Self {
        self.encryption = Some((cfg, master_key));
        self
    }

    /// `Serialize(type, version, reader) -> reader'` (spec §4.1).
    pub fn serialize(
        &self,
        resource_type: ResourceType,
        version: ResourceVersion,
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let plaintext_mac = compute_mac(self.mac_key, plaintext);

        let mut flags = BlobFlags::empty();
        let mut body = plaintext.to_vec();

        if let Some(cfg) = self.compression {
            body = zstd::stream::encode_all(Cursor::new(&body), cfg.level)
                .map_err(|e| RepoError::Io(format!("zstd compression failed: {e}")))?;
            flags |= BlobFlags::COMPRESSED;
        }

        if let Some((enc_cfg, master_key)) = self.encryption {
            body = enc_cfg.encrypt(master_key, &body)?;
            flags |= BlobFlags::ENCRYPTED;
        }

        let mut out = Vec::with_capacity(MAGIC.len() + 1 + 4 + 32 + 1 + 8 + body.len());
        out.extend_from_slice(&MAGIC);
        out.write_u8(resource_type as u8)?;
        out.write_u16::<BigEndian>(version.major)?;
        out.write_u16::<BigEndian>(version.minor)?;
        out.extend_from_slice(plaintext_mac.as_bytes());
        out.write_u8(flags.bits())?;
        out.write_u64::<BigEndian>(plaintext.len() as u64)?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// `Deserialize(reader) -> (type, version, plaintext_reader)` (spec
    /// §4.1). Verifies the recomputed MAC over the plaintext matches the
    /// header; any mismatch is `Corrupted`.
    pub fn deserialize(&self, data: &[u8]) -> Result<(ResourceType, ResourceVersion, Vec<u8>)> {
        let mut cur = Cursor::new(data);
        let mut magic = [0u8; 8];
        std::io::Read::read_exact(&mut cur, &mut magic)
            .map_err(|_| RepoError::Corrupted("blob too short for magic".into()))?;
        if magic != MAGIC {
            return Err(RepoError::Corrupted("bad blob magic".into()));
        }
        let resource_type = ResourceType::from_u8(cur.read_u8()?)
            .ok_or_else(|| RepoError::Corrupted("unknown resource type tag".into()))?;
        let major = cur.read_u16::<BigEndian>()?;
        let minor = cur.read_u16::<BigEndian>()?;
        let version = ResourceVersion::new(major, minor);

        let mut header_mac = [0u8; 32];
        std::io::Read::read_exact(&mut cur, &mut header_mac)
            .map_err(|_| RepoError::Corrupted("blob too short for mac".into()))?;
        let header_mac = Mac::from_bytes(header_mac);

        let flags = BlobFlags::from_bits(cur.read_u8()?)
            .ok_or_else(|| RepoError::Corrupted("unknown blob flags".into()))?;
        let plaintext_len = cur.read_u64::<BigEndian>()?;

        let pos = cur.position() as usize;
        let mut body = data[pos..].to_vec();

        if flags.contains(BlobFlags::ENCRYPTED) {
            let (enc_cfg, master_key) = self.encryption.ok_or_else(|| {
                RepoError::Crypto("blob is encrypted but no key was supplied".into())
            })?;
            body = enc_cfg.decrypt(master_key, &body)?;
        }

        if flags.contains(BlobFlags::COMPRESSED) {
            body = zstd::stream::decode_all(Cursor::new(&body))
                .map_err(|e| RepoError::Corrupted(format!("zstd decompression failed: {e}")))?;
        }

        if body.len() as u64 != plaintext_len {
            return Err(RepoError::Corrupted(format!(
                "plaintext length mismatch: header says {plaintext_len}, decoded {}",
                body.len()
            )));
        }

        let recomputed = compute_mac(self.mac_key, &body);
        if recomputed != header_mac {
            return Err(RepoError::Corrupted(format!(
                "mac mismatch: expected {header_mac}, got {recomputed}"
            )));
        }

        Ok((resource_type, version, body))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resource::CURRENT_VERSION;

    #[test]
    fn plain_roundtrip() {
        let key = [1u8; 32];
        let codec = Codec::new(&key);
        let encoded = codec
            .serialize(ResourceType::Chunk, CURRENT_VERSION, b"hello dummy")
            .unwrap();
        let (ty, ver, plain) = codec.deserialize(&encoded).unwrap();
        assert_eq!(ty, ResourceType::Chunk);
        assert_eq!(ver, CURRENT_VERSION);
        assert_eq!(plain, b"hello dummy");
    }

    #[test]
    fn compressed_roundtrip() {
        let key = [2u8; 32];
        let codec = Codec::new(&key).with_compression(CompressionConfig::default());
        let data = vec![7u8; 4096];
        let encoded = codec
            .serialize(ResourceType::Object, CURRENT_VERSION, &data)
            .unwrap();
        assert!(encoded.len() < data.len());
        let (_, _, plain) = codec.deserialize(&encoded).unwrap();
        assert_eq!(plain, data);
    }

    #[test]
    fn encrypted_roundtrip() {
        let key = [3u8; 32];
        let (enc_cfg, master_key) = EncryptionConfig::create("swordfish").unwrap();
        let codec = Codec::new(&key).with_encryption(&enc_cfg, &master_key);
        let encoded = codec
            .serialize(ResourceType::Snapshot, CURRENT_VERSION, b"secret header")
            .unwrap();
        let (_, _, plain) = codec.deserialize(&encoded).unwrap();
        assert_eq!(plain, b"secret header");
    }

    #[test]
    fn corruption_is_detected() {
        let key = [4u8; 32];
        let codec = Codec::new(&key);
        let mut encoded = codec
            .serialize(ResourceType::Chunk, CURRENT_VERSION, b"hello foo")
            .unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        let err = codec.deserialize(&encoded).unwrap_err();
        assert!(matches!(err, RepoError::Corrupted(_)));
    }
}
