//! In-memory storage backend used by the test suite (spec §2.4 test
//! tooling: "tempfile-backed local storage" for on-disk round trips; this
//! is its in-process sibling for fast unit tests that don't need to hit
//! a filesystem at all).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{RepoError, Result};
use crate::mac::Mac;

use super::{StorageBackend, StorageMode};

#[derive(Default)]
struct Inner {
    config: Option<Vec<u8>>,
    states: HashMap<Mac, Vec<u8>>,
    packfiles: HashMap<Mac, Vec<u8>>,
    locks: HashMap<Mac, Vec<u8>>,
}

pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryBackend {
    fn create(&self, config_bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.config.is_some() {
            return Err(RepoError::Config("repository already exists".into()));
        }
        inner.config = Some(config_bytes.to_vec());
        Ok(())
    }

    fn open(&self) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .config
            .clone()
            .ok_or_else(|| RepoError::NotFound("repository config".into()))
    }

    fn mode(&self) -> StorageMode {
        StorageMode::ReadWrite
    }

    fn get_states(&self) -> Result<Vec<Mac>> {
        Ok(self.inner.lock().unwrap().states.keys().copied().collect())
    }

    fn put_state(&self, id: Mac, data: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        inner.states.insert(id, data.to_vec());
        Ok(data.len() as u64)
    }

    fn get_state(&self, id: Mac) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .states
            .get(&id)
            .cloned()
            .ok_or_else(|| RepoError::NotFound(format!("state {id}")))
    }

    fn delete_state(&self, id: Mac) -> Result<()> {
        self.inner.lock().unwrap().states.remove(&id);
        Ok(())
    }

    fn get_packfiles(&self) -> Result<Vec<Mac>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .packfiles
            .keys()
            .copied()
            .collect())
    }

    fn put_packfile(&self, mac: Mac, data: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        inner.packfiles.insert(mac, data.to_vec());
        Ok(data.len() as u64)
    }

    fn get_packfile(&self, mac: Mac) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .packfiles
            .get(&mac)
            .cloned()
            .ok_or_else(|| RepoError::NotFound(format!("packfile {mac}")))
    }

    fn get_packfile_blob(&self, mac: Mac, offset: u64, length: u32) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let data = inner
            .packfiles
            .get(&mac)
            .ok_or_else(|| RepoError::NotFound(format!("packfile {mac}")))?;
        let start = offset as usize;
        let end = start + length as usize;
        if end > data.len() {
            return Err(RepoError::Corrupted(format!(
                "packfile {mac} slice [{start}..{end}) out of bounds ({})",
                data.len()
            )));
        }
        Ok(data[start..end].to_vec())
    }

    fn delete_packfile(&self, mac: Mac) -> Result<()> {
        self.inner.lock().unwrap().packfiles.remove(&mac);
        Ok(())
    }

    fn has_packfile(&self, mac: Mac) -> Result<bool> {
        Ok(self.inner.lock().unwrap().packfiles.contains_key(&mac))
    }

    fn get_locks(&self) -> Result<Vec<Mac>> {
        Ok(self.inner.lock().unwrap().locks.keys().copied().collect())
    }

    fn put_lock(&self, id: Mac, data: &[u8]) -> Result<()> {
        self.inner.lock().unwrap().locks.insert(id, data.to_vec());
        Ok(())
    }

    fn get_lock(&self, id: Mac) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .locks
            .get(&id)
            .cloned()
            .ok_or_else(|| RepoError::NotFound(format!("lock {id}")))
    }

    fn delete_lock(&self, id: Mac) -> Result<()> {
        self.inner.lock().unwrap().locks.remove(&id);
        Ok(())
    }

    fn size(&self) -> i64 {
        let inner = self.inner.lock().unwrap();
        let total: usize = inner.states.values().map(|v| v.len()).sum::<usize>()
            + inner.packfiles.values().map(|v| v.len()).sum::<usize>();
        total as i64
    }
}
