//! Local filesystem storage backend.
//!
//! Writes are staged into a temp file in the destination directory and
//! `rename`d into place, the same crash-safe idiom the teacher's
//! `tools::file_set_contents` uses (write to a sibling `.tmp` file, then
//! atomically rename over the final path) so a reader never observes a
//! half-written packfile or state blob.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{RepoError, Result};
use crate::mac::Mac;

use super::{StorageBackend, StorageMode};

pub struct LocalBackend {
    root: PathBuf,
    mode: StorageMode,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>, mode: StorageMode) -> Self {
        Self {
            root: root.into(),
            mode,
        }
    }

    fn config_path(&self) -> PathBuf {
        self.root.join("config")
    }

    fn states_dir(&self) -> PathBuf {
        self.root.join("states")
    }

    fn packfiles_dir(&self) -> PathBuf {
        self.root.join("packfiles")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        let tmp = path.with_extension(format!(
            "tmp-{}",
            std::process::id()
        ));
        {
            let mut f = fs::File::create(&tmp).map_err(RepoError::from)?;
            f.write_all(data).map_err(RepoError::from)?;
            f.sync_all().map_err(RepoError::from)?;
        }
        fs::rename(&tmp, path).map_err(RepoError::from)?;
        Ok(())
    }

    fn list_macs(dir: &Path) -> Result<Vec<Mac>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(dir).map_err(RepoError::from)? {
            let entry = entry.map_err(RepoError::from)?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(mac) = Mac::from_hex(name) {
                    out.push(mac);
                }
            }
        }
        Ok(out)
    }
}

impl StorageBackend for LocalBackend {
    fn create(&self, config_bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(RepoError::from)?;
        fs::create_dir_all(self.states_dir()).map_err(RepoError::from)?;
        fs::create_dir_all(self.packfiles_dir()).map_err(RepoError::from)?;
        fs::create_dir_all(self.locks_dir()).map_err(RepoError::from)?;
        if self.config_path().exists() {
            return Err(RepoError::Config("repository already exists".into()));
        }
        Self::write_atomic(&self.config_path(), config_bytes)
    }

    fn open(&self) -> Result<Vec<u8>> {
        fs::read(self.config_path())
            .map_err(|_| RepoError::NotFound("repository config".into()))
    }

    fn mode(&self) -> StorageMode {
        self.mode
    }

    fn get_states(&self) -> Result<Vec<Mac>> {
        Self::list_macs(&self.states_dir())
    }

    fn put_state(&self, id: Mac, data: &[u8]) -> Result<u64> {
        Self::write_atomic(&self.states_dir().join(id.to_hex()), data)?;
        Ok(data.len() as u64)
    }

    fn get_state(&self, id: Mac) -> Result<Vec<u8>> {
        fs::read(self.states_dir().join(id.to_hex()))
            .map_err(|_| RepoError::NotFound(format!("state {id}")))
    }

    fn delete_state(&self, id: Mac) -> Result<()> {
        let path = self.states_dir().join(id.to_hex());
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RepoError::from(e)),
        }
    }

    fn get_packfiles(&self) -> Result<Vec<Mac>> {
        Self::list_macs(&self.packfiles_dir())
    }

    fn put_packfile(&self, mac: Mac, data: &[u8]) -> Result<u64> {
        Self::write_atomic(&self.packfiles_dir().join(mac.to_hex()), data)?;
        Ok(data.len() as u64)
    }

    fn get_packfile(&self, mac: Mac) -> Result<Vec<u8>> {
        fs::read(self.packfiles_dir().join(mac.to_hex()))
            .map_err(|_| RepoError::NotFound(format!("packfile {mac}")))
    }

    fn get_packfile_blob(&self, mac: Mac, offset: u64, length: u32) -> Result<Vec<u8>> {
        use std::io::{Read, Seek, SeekFrom};
        let mut f = fs::File::open(self.packfiles_dir().join(mac.to_hex()))
            .map_err(|_| RepoError::NotFound(format!("packfile {mac}")))?;
        f.seek(SeekFrom::Start(offset)).map_err(RepoError::from)?;
        let mut buf = vec![0u8; length as usize];
        f.read_exact(&mut buf).map_err(RepoError::from)?;
        Ok(buf)
    }

    fn delete_packfile(&self, mac: Mac) -> Result<()> {
        let path = self.packfiles_dir().join(mac.to_hex());
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RepoError::from(e)),
        }
    }

    fn has_packfile(&self, mac: Mac) -> Result<bool> {
        Ok(self.packfiles_dir().join(mac.to_hex()).exists())
    }

    fn get_locks(&self) -> Result<Vec<Mac>> {
        Self::list_macs(&self.locks_dir())
    }

    fn put_lock(&self, id: Mac, data: &[u8]) -> Result<()> {
        Self::write_atomic(&self.locks_dir().join(id.to_hex()), data)
    }

    fn get_lock(&self, id: Mac) -> Result<Vec<u8>> {
        fs::read(self.locks_dir().join(id.to_hex()))
            .map_err(|_| RepoError::NotFound(format!("lock {id}")))
    }

    fn delete_lock(&self, id: Mac) -> Result<()> {
        let path = self.locks_dir().join(id.to_hex());
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RepoError::from(e)),
        }
    }

    fn size(&self) -> i64 {
        fn dir_size(path: &Path) -> u64 {
            let mut total = 0u64;
            if let Ok(entries) = fs::read_dir(path) {
                for entry in entries.flatten() {
                    if let Ok(meta) = entry.metadata() {
                        total += meta.len();
                    }
                }
            }
            total
        }
        (dir_size(&self.states_dir()) + dir_size(&self.packfiles_dir())) as i64
    }
}
