//! Packfile writer/reader (spec §4.2 "Packfile writer/reader", C2).
//!
//! A packfile is an append-only container: `[blob_0][blob_1]...[blob_N-1]
//! [footer_blob]` (spec §6 "Packfile on-disk layout"). The writer buffers
//! wrapped blobs in memory until `max_size` would be exceeded, then
//! finalizes by appending a footer (itself a wrapped blob of type
//! `PackfileFooter`) and returning the whole byte string keyed by the
//! footer's MAC. This supersedes the teacher's one-file-per-chunk
//! `ChunkStore` layout (see `SPEC_FULL.md` C2: the spec's footer-indexed
//! single-file container is a deliberate redesign over the teacher's
//! loose-file-per-chunk store).

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{RepoError, Result};
use crate::mac::{compute_mac, Mac};
use crate::resource::{ResourceType, ResourceVersion, CURRENT_VERSION};

use super::data_blob::Codec;

/// Trailing byte count appended after the footer blob: a big-endian
/// `u64` giving the wrapped footer's length, so a reader holding the
/// full packfile (e.g. maintenance's colour pass, which has no prior
/// record of the footer's offset) can locate it by seeking from the end
/// instead of needing an externally-tracked offset.
const TRAILER_LEN: usize = 8;

/// One packfile footer entry (spec §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FooterEntry {
    pub mac: Mac,
    pub resource_type: ResourceType,
    pub version: ResourceVersion,
    pub offset: u64,
    pub length: u32,
    pub flags: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Footer {
    pub version: ResourceVersion,
    pub timestamp_ns: i128,
    pub index_mac: Mac,
    pub entries: Vec<FooterEntry>,
}

/// Accumulates blobs in memory and finalizes into a packfile byte
/// string plus footer once `max_size` is reached (or on explicit
/// `finalize`). One `PackWriter` is owned by a single packer task at a
/// time (spec §4.2: "writers are single-threaded per packer").
pub struct PackWriter<'a> {
    codec: Codec<'a>,
    max_size: u64,
    body: Vec<u8>,
    entries: Vec<FooterEntry>,
}

impl<'a> PackWriter<'a> {
    pub fn new(codec: Codec<'a>, max_size: u64) -> Self {
        Self {
            codec,
            max_size,
            body: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> u64 {
        self.body.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if adding a blob of `plaintext_len` bytes (roughly)
    /// would exceed `max_size`, signalling the caller should rotate.
    pub fn would_overflow(&self, plaintext_len: usize) -> bool {
        self.len() + plaintext_len as u64 > self.max_size
    }

    /// Appends a blob, returning the `(offset, length)` it was written
    /// at within the in-progress packfile body.
    pub fn append(
        &mut self,
        resource_type: ResourceType,
        mac: Mac,
        plaintext: &[u8],
    ) -> Result<(u64, u32)> {
        let wrapped = self
            .codec
            .serialize(resource_type, CURRENT_VERSION, plaintext)?;
        let offset = self.body.len() as u64;
        let length = wrapped.len() as u32;
        self.body.extend_from_slice(&wrapped);
        self.entries.push(FooterEntry {
            mac,
            resource_type,
            version: CURRENT_VERSION,
            offset,
            length,
            flags: 0,
        });
        Ok((offset, length))
    }

    /// Finalizes the packfile: appends the encoded footer, returning the
    /// full packfile bytes and the footer's MAC (which identifies the
    /// packfile, spec §4.2).
    pub fn finalize(mut self, timestamp_ns: i128) -> Result<(Mac, Vec<u8>, Footer)> {
        let footer_plain_for_mac = serde_json::to_vec(&self.entries)
            .map_err(|e| RepoError::Corrupted(format!("footer index encode failed: {e}")))?;
        let index_mac = compute_mac(self.codec.mac_key, &footer_plain_for_mac);

        let footer = Footer {
            version: CURRENT_VERSION,
            timestamp_ns,
            index_mac,
            entries: self.entries,
        };
        let footer_bytes = serde_json::to_vec(&footer)
            .map_err(|e| RepoError::Corrupted(format!("footer encode failed: {e}")))?;
        let footer_mac = compute_mac(self.codec.mac_key, &footer_bytes);
        let wrapped_footer =
            self.codec
                .serialize(ResourceType::PackfileFooter, CURRENT_VERSION, &footer_bytes)?;

        self.body.extend_from_slice(&wrapped_footer);
        self.body
            .write_u64::<BigEndian>(wrapped_footer.len() as u64)
            .map_err(|e| RepoError::Corrupted(format!("failed to write footer trailer: {e}")))?;
        Ok((footer_mac, self.body, footer))
    }
}

/// Reads footers and blob slices out of a fully-written packfile.
pub struct PackReader<'a> {
    codec: Codec<'a>,
}

impl<'a> PackReader<'a> {
    pub fn new(codec: Codec<'a>) -> Self {
        Self { codec }
    }

    /// `ReadSlice(packfile_mac, offset, length) -> bytes` (spec §4.2): a
    /// single range read, decoded through the blob codec.
    pub fn read_slice(
        &self,
        packfile_bytes: &[u8],
        offset: u64,
        length: u32,
    ) -> Result<(ResourceType, ResourceVersion, Vec<u8>)> {
        let start = offset as usize;
        let end = start + length as usize;
        if end > packfile_bytes.len() {
            return Err(RepoError::Corrupted(
                "packfile slice out of bounds".into(),
            ));
        }
        self.codec.deserialize(&packfile_bytes[start..end])
    }

    /// Reads the footer when its byte offset within the packfile is
    /// already known (the common case: the repository records
    /// `footer_offset` returned by `finalize` alongside the packfile
    /// MAC). Every packfile ends in an 8-byte trailer (spec §6 on-disk
    /// layout, as extended by `PackWriter::finalize`), so the wrapped
    /// footer blob itself spans `[footer_offset, len - TRAILER_LEN)`.
    pub fn read_footer_at(&self, packfile_bytes: &[u8], footer_offset: u64) -> Result<Footer> {
        if packfile_bytes.len() < TRAILER_LEN {
            return Err(RepoError::Corrupted("packfile too short for trailer".into()));
        }
        let end = packfile_bytes.len() - TRAILER_LEN;
        let start = footer_offset as usize;
        if start > end {
            return Err(RepoError::Corrupted("footer offset out of bounds".into()));
        }
        let wrapped_footer = &packfile_bytes[start..end];
        let (resource_type, _version, footer_bytes) = self.codec.deserialize(wrapped_footer)?;
        if resource_type != ResourceType::PackfileFooter {
            return Err(RepoError::Corrupted(
                "packfile trailer is not a footer blob".into(),
            ));
        }
        serde_json::from_slice(&footer_bytes)
            .map_err(|e| RepoError::Corrupted(format!("malformed footer: {e}")))
    }

    /// Reads the footer from a packfile whose footer offset is not
    /// already known, using the trailing length field written by
    /// `PackWriter::finalize`. Maintenance's colour pass uses this: it
    /// only has a packfile MAC, never a remembered offset.
    pub fn read_footer_from_trailer(&self, packfile_bytes: &[u8]) -> Result<Footer> {
        if packfile_bytes.len() < TRAILER_LEN {
            return Err(RepoError::Corrupted("packfile too short for trailer".into()));
        }
        let (body, mut trailer) = packfile_bytes.split_at(packfile_bytes.len() - TRAILER_LEN);
        let footer_len = trailer
            .read_u64::<BigEndian>()
            .map_err(|e| RepoError::Corrupted(format!("malformed packfile trailer: {e}")))?
            as usize;
        if footer_len > body.len() {
            return Err(RepoError::Corrupted("packfile trailer length out of bounds".into()));
        }
        let footer_offset = (body.len() - footer_len) as u64;
        self.read_footer_at(packfile_bytes, footer_offset)
    }

    /// Returns the footer's own `timestamp_ns`, reading just enough of
    /// `packfile_bytes` to locate and decode it. Thin wrapper used by
    /// maintenance so callers don't need to know about the trailer.
    pub fn footer_timestamp_ns(&self, packfile_bytes: &[u8]) -> Result<i128> {
        self.read_footer_from_trailer(packfile_bytes).map(|f| f.timestamp_ns)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_and_read_back() {
        let key = [5u8; 32];
        let mut writer = PackWriter::new(Codec::new(&key), 1024 * 1024);

        let mac_a = compute_mac(&key, b"hello dummy");
        let (off_a, _) = writer.append(ResourceType::Chunk, mac_a, b"hello dummy").unwrap();
        let mac_b = compute_mac(&key, b"hello foo");
        let (off_b, len_b) = writer.append(ResourceType::Chunk, mac_b, b"hello foo").unwrap();

        let footer_offset_before_finalize = writer.len();
        let (_pf_mac, bytes, footer) = writer.finalize(1234).unwrap();
        assert_eq!(footer.entries.len(), 2);

        let reader = PackReader::new(Codec::new(&key));
        let footer2 = reader
            .read_footer_at(&bytes, footer_offset_before_finalize)
            .unwrap();
        assert_eq!(footer2.entries.len(), 2);

        let (_, _, plain) = reader.read_slice(&bytes, off_b, len_b).unwrap();
        assert_eq!(plain, b"hello foo");
        let _ = off_a;
    }

    #[test]
    fn footer_locatable_from_trailer_alone() {
        let key = [6u8; 32];
        let mut writer = PackWriter::new(Codec::new(&key), 1024 * 1024);
        let mac = compute_mac(&key, b"payload");
        writer.append(ResourceType::Chunk, mac, b"payload").unwrap();
        let (_pf_mac, bytes, footer) = writer.finalize(999).unwrap();

        let reader = PackReader::new(Codec::new(&key));
        let recovered = reader.read_footer_from_trailer(&bytes).unwrap();
        assert_eq!(recovered.entries.len(), footer.entries.len());
        assert_eq!(recovered.timestamp_ns, 999);
        assert_eq!(reader.footer_timestamp_ns(&bytes).unwrap(), 999);
    }
}
