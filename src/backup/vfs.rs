//! VFS data model (spec §3 "VFS entry", "Object"; §4.8 "Snapshot / VFS").
//!
//! The logical view of a captured filesystem tree: directory/file
//! entries keyed by path in a B+tree (`backup::btree`), each file
//! pointing at an `Object` that lists its chunk MACs in order.

use serde::{Deserialize, Serialize};

use crate::mac::Mac;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    Directory,
    Regular,
    Symlink,
    Fifo,
    Socket,
    CharDevice,
    BlockDevice,
}

/// POSIX metadata captured for every entry (spec §3 "VFS entry" `fileinfo`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
    pub dev: u64,
    pub ino: u64,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub username: Option<String>,
    pub groupname: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VfsEntry {
    pub fileinfo: FileInfo,
    pub entry_type: EntryType,
    pub symlink_target: Option<String>,
    pub object_mac: Option<Mac>,
    pub xattrs: Option<Mac>,
    pub classifications: Vec<String>,
    pub custom_metadata: Vec<(String, String)>,
}

/// One chunk of a file's content (spec §3 "Object" `chunks`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObjectChunk {
    pub mac: Mac,
    pub length: u32,
    pub entropy: f32,
    pub distribution: Vec<u32>,
}

/// The full content descriptor for a regular file (spec §3 "Object").
///
/// Deliberately carries no self-identifying MAC field: an object's
/// address is the content hash of its own serialized bytes, computed by
/// the caller before the blob is packed and recovered again from the
/// state lookup (`VfsEntry::object_mac`) when read back — storing it
/// inside the struct would make every encoding self-referential.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Object {
    pub content_type: Option<String>,
    pub entropy: f32,
    pub distribution: Vec<u32>,
    pub tags: Vec<String>,
    pub chunks: Vec<ObjectChunk>,
}

impl Object {
    pub fn total_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.length as u64).sum()
    }
}

/// Shannon entropy over byte values, used for the object/chunk `entropy`
/// and `distribution` fields (spec §3 "Object").
pub fn byte_distribution(data: &[u8]) -> [u32; 256] {
    let mut dist = [0u32; 256];
    for b in data {
        dist[*b as usize] += 1;
    }
    dist
}

pub fn shannon_entropy(dist: &[u32; 256], len: usize) -> f32 {
    if len == 0 {
        return 0.0;
    }
    let len = len as f64;
    let mut entropy = 0.0f64;
    for count in dist {
        if *count == 0 {
            continue;
        }
        let p = *count as f64 / len;
        entropy -= p * p.log2();
    }
    entropy as f32
}

/// Crude MIME sniffing from a content prefix (spec §4.8 step 3:
/// "content type inferred from MIME sniff"). Not exhaustive; covers the
/// handful of signatures a backup engine's content-type index cares
/// about for classification, not full media-type detection.
pub fn sniff_content_type(prefix: &[u8]) -> Option<&'static str> {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"%PDF-", "application/pdf"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b", "application/gzip"),
        (b"#!/", "text/x-shellscript"),
    ];
    for (sig, mime) in SIGNATURES {
        if prefix.starts_with(sig) {
            return Some(mime);
        }
    }
    if prefix.iter().take(512).all(|b| *b != 0 && (b.is_ascii_graphic() || b.is_ascii_whitespace())) {
        Some("text/plain")
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_data_has_zero_entropy() {
        let dist = byte_distribution(&[]);
        assert_eq!(shannon_entropy(&dist, 0), 0.0);
    }

    #[test]
    fn uniform_byte_has_zero_entropy() {
        let data = vec![7u8; 1000];
        let dist = byte_distribution(&data);
        assert_eq!(shannon_entropy(&dist, data.len()), 0.0);
    }

    #[test]
    fn sniffs_known_signatures() {
        assert_eq!(sniff_content_type(b"%PDF-1.4"), Some("application/pdf"));
        assert_eq!(sniff_content_type(b"hello dummy"), Some("text/plain"));
    }
}
