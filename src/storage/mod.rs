//! Abstract storage backend (spec §4.3 "Storage backend interface").
//!
//! A `StorageBackend` is a key/value-of-blobs store with separate
//! namespaces for repository config, states, packfiles and locks. Every
//! write must be atomic per key so a crash never leaves a torn object
//! behind; every read must be idempotent. Concrete backends (object
//! store, SFTP, HTTP, SQLite, append-only archive) are named in spec.md
//! §4.3 but out of scope beyond this trait; we ship the two backends the
//! test suite and local deployments need.

pub mod local;
pub mod memory;

use crate::error::Result;
use crate::mac::Mac;

/// Access mode a backend was opened with (spec §4.3 `Mode()`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageMode {
    Read,
    Write,
    ReadWrite,
}

/// Abstract operations every storage backend must implement.
///
/// Implementations must make `Put*` atomic per key (stage-then-rename or
/// equivalent) so that a reader never observes a partially written
/// object, and `Get*` idempotent (repeatable without side effects).
pub trait StorageBackend: Send + Sync {
    /// Initializes a brand-new, empty repository location with the given
    /// serialized CONFIG blob bytes.
    fn create(&self, config_bytes: &[u8]) -> Result<()>;

    /// Opens an existing repository location, returning the raw CONFIG
    /// blob bytes (still wrapped; the caller decodes via the blob codec).
    fn open(&self) -> Result<Vec<u8>>;

    fn mode(&self) -> StorageMode;

    fn get_states(&self) -> Result<Vec<Mac>>;
    fn put_state(&self, id: Mac, data: &[u8]) -> Result<u64>;
    fn get_state(&self, id: Mac) -> Result<Vec<u8>>;
    fn delete_state(&self, id: Mac) -> Result<()>;

    fn get_packfiles(&self) -> Result<Vec<Mac>>;
    fn put_packfile(&self, mac: Mac, data: &[u8]) -> Result<u64>;
    fn get_packfile(&self, mac: Mac) -> Result<Vec<u8>>;
    /// Reads exactly `length` bytes starting at `offset` inside the
    /// packfile identified by `mac`, in a single range request.
    fn get_packfile_blob(&self, mac: Mac, offset: u64, length: u32) -> Result<Vec<u8>>;
    fn delete_packfile(&self, mac: Mac) -> Result<()>;
    fn has_packfile(&self, mac: Mac) -> Result<bool>;

    fn get_locks(&self) -> Result<Vec<Mac>>;
    fn put_lock(&self, id: Mac, data: &[u8]) -> Result<()>;
    fn get_lock(&self, id: Mac) -> Result<Vec<u8>>;
    fn delete_lock(&self, id: Mac) -> Result<()>;

    /// Raw storage footprint in bytes, or -1 if the backend cannot cheaply
    /// determine it.
    fn size(&self) -> i64;
}
