//! Packer manager (spec §4.6 "Packer manager", C6).
//!
//! Buffers per-snapshot `PutBlob` calls and groups them into packfiles,
//! flushing whenever the active packfile would exceed `max_size`.
//! Grounded on the teacher's bounded-channel-plus-worker-pool idiom
//! (`client/pull.rs`'s `verify_pool`/`verify_and_write_channel`, a
//! `ParallelHandler` feeding a single writer): here the single active
//! `PackWriter` is protected by a mutex instead of owned by a dedicated
//! channel-fed task, which gives the same externally-observable
//! contract (spec §4.6: "writers are single-threaded per packer") while
//! letting multiple backup workers call `put` concurrently without each
//! one needing its own writer handle.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::error::Result;
use crate::mac::Mac;
use crate::resource::ResourceType;

use super::data_blob::Codec;
use super::packfile::{FooterEntry, PackWriter};

/// What happens to a packfile once it's sealed: its bytes are written to
/// storage and its footer entries are staged into the caller's pending
/// state delta (spec §4.6: "each sealed packfile triggers a `flush`
/// callback that registers its index entries into the state delta").
pub trait PackSink: Send + Sync {
    fn put_packfile(&self, mac: Mac, data: &[u8]) -> Result<()>;
    fn register_packfile(&self, packfile_mac: Mac, entries: &[FooterEntry]) -> Result<()>;
    fn now_ns(&self) -> i128;
}

pub struct PackerManager<'a> {
    codec_key: &'a [u8; 32],
    compression: Option<super::data_blob::CompressionConfig>,
    encryption: Option<(&'a super::crypto::EncryptionConfig, &'a [u8; 32])>,
    max_size: u64,
    sink: &'a dyn PackSink,
    seen: Mutex<HashSet<(ResourceType, Mac)>>,
    active: Mutex<Option<PackWriter<'a>>>,
}

impl<'a> PackerManager<'a> {
    pub fn new(codec_key: &'a [u8; 32], max_size: u64, sink: &'a dyn PackSink) -> Self {
        Self {
            codec_key,
            compression: None,
            encryption: None,
            max_size,
            sink,
            seen: Mutex::new(HashSet::new()),
            active: Mutex::new(None),
        }
    }

    pub fn with_compression(mut self, cfg: super::data_blob::CompressionConfig) -> Self {
        self.compression = Some(cfg);
        self
    }

    pub fn with_encryption(
        mut self,
        cfg: &'a super::crypto::EncryptionConfig,
        master_key: &'a [u8; 32],
    ) -> Self {
        self.encryption = Some((cfg, master_key));
        self
    }

    fn new_codec(&self) -> Codec<'a> {
        let mut codec = Codec::new(self.codec_key);
        if let Some(cfg) = self.compression {
            codec = codec.with_compression(cfg);
        }
        if let Some((enc, key)) = self.encryption {
            codec = codec.with_encryption(enc, key);
        }
        codec
    }

    /// `InsertIfNotPresent(type, mac) -> already_present` (spec §4.6): a
    /// local packing cache so concurrent producers don't both enqueue
    /// the same not-yet-committed blob.
    pub fn insert_if_not_present(&self, resource_type: ResourceType, mac: Mac) -> bool {
        let mut seen = self.seen.lock().unwrap();
        !seen.insert((resource_type, mac))
    }

    /// Streams `data` into the active packfile, rotating (sealing the
    /// current one and starting a fresh one) if it would overflow
    /// `max_size` (spec §4.6 `Put`).
    pub fn put(&self, resource_type: ResourceType, mac: Mac, data: &[u8]) -> Result<()> {
        let mut active = self.active.lock().unwrap();

        if let Some(writer) = active.as_ref() {
            if writer.would_overflow(data.len()) && !writer.is_empty() {
                let sealed = active.take().unwrap();
                self.seal(sealed)?;
            }
        }

        let writer = active.get_or_insert_with(|| PackWriter::new(self.new_codec(), self.max_size));
        writer.append(resource_type, mac, data)?;
        Ok(())
    }

    /// `Wait()` (spec §4.6): seals whatever packfile is currently in
    /// flight. Idempotent — calling it with nothing buffered is a no-op.
    pub fn wait(&self) -> Result<()> {
        let mut active = self.active.lock().unwrap();
        if let Some(writer) = active.take() {
            if !writer.is_empty() {
                self.seal(writer)?;
            }
        }
        Ok(())
    }

    fn seal(&self, writer: PackWriter<'a>) -> Result<()> {
        let (packfile_mac, bytes, footer) = writer.finalize(self.sink.now_ns())?;
        self.sink.put_packfile(packfile_mac, &bytes)?;
        self.sink.register_packfile(packfile_mac, &footer.entries)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::memory::MemoryBackend;
    use crate::storage::StorageBackend;
    use std::sync::Mutex as StdMutex;

    struct TestSink<'a> {
        storage: &'a MemoryBackend,
        registrations: StdMutex<Vec<(Mac, usize)>>,
    }

    impl<'a> PackSink for TestSink<'a> {
        fn put_packfile(&self, mac: Mac, data: &[u8]) -> Result<()> {
            self.storage.put_packfile(mac, data)?;
            Ok(())
        }

        fn register_packfile(&self, packfile_mac: Mac, entries: &[FooterEntry]) -> Result<()> {
            self.registrations
                .lock()
                .unwrap()
                .push((packfile_mac, entries.len()));
            Ok(())
        }

        fn now_ns(&self) -> i128 {
            0
        }
    }

    #[test]
    fn rotates_when_max_size_exceeded() {
        let storage = MemoryBackend::new();
        let key = [1u8; 32];
        let sink = TestSink {
            storage: &storage,
            registrations: StdMutex::new(Vec::new()),
        };
        let packer = PackerManager::new(&key, 64, &sink);

        for i in 0..10u8 {
            let data = vec![i; 20];
            let mac = crate::mac::compute_mac(&key, &data);
            packer.put(ResourceType::Chunk, mac, &data).unwrap();
        }
        packer.wait().unwrap();

        let regs = sink.registrations.lock().unwrap();
        assert!(regs.len() > 1, "expected more than one packfile to be sealed");
        let total_entries: usize = regs.iter().map(|(_, n)| n).sum();
        assert_eq!(total_entries, 10);
    }

    #[test]
    fn dedup_cache_flags_repeats() {
        let storage = MemoryBackend::new();
        let key = [2u8; 32];
        let sink = TestSink {
            storage: &storage,
            registrations: StdMutex::new(Vec::new()),
        };
        let packer = PackerManager::new(&key, 1024 * 1024, &sink);
        let mac = crate::mac::compute_mac(&key, b"hello dummy");

        assert!(!packer.insert_if_not_present(ResourceType::Chunk, mac));
        assert!(packer.insert_if_not_present(ResourceType::Chunk, mac));
    }
}
