//! Importer / Exporter interfaces (spec §6 "Importer / Exporter
//! interfaces"). Concrete backends (fs, ftp, sftp, s3, stdio) are
//! specified only by their abstract interfaces per spec §1's scope note;
//! this crate ships the one concrete pair the core needs to exercise the
//! backup/restore pipeline end-to-end: a local filesystem importer and
//! exporter, built on `walkdir` the way the teacher already depends on
//! it for tree traversal.

pub mod fs;

use std::io::Read;

use crate::backup::vfs::FileInfo;
use crate::error::Result;

#[derive(Clone, Debug)]
pub struct ImporterInfo {
    pub importer_type: String,
    pub origin: String,
    pub root: String,
}

#[derive(Clone, Debug)]
pub enum ScanRecord {
    Directory {
        path: String,
        fileinfo: FileInfo,
        xattr_names: Vec<String>,
    },
    Regular {
        path: String,
        fileinfo: FileInfo,
        xattr_names: Vec<String>,
    },
    Symlink {
        path: String,
        fileinfo: FileInfo,
        target: String,
    },
}

#[derive(Clone, Debug)]
pub struct ScanError {
    pub path: String,
    pub message: String,
}

/// `Importer` (spec §6): scans a source tree and serves file content.
pub trait Importer: Send + Sync {
    fn info(&self) -> ImporterInfo;

    /// Produces the full scan up front; a true streaming interface would
    /// return `impl Iterator`, but trait objects (needed so `backup_run`
    /// can accept any importer) can't name that type, so callers get a
    /// materialized list plus any recoverable per-entry scan errors.
    fn scan(&self) -> Result<(Vec<ScanRecord>, Vec<ScanError>)>;

    fn read(&self, pathname: &str) -> Result<Box<dyn Read>>;

    fn read_xattr(&self, _pathname: &str, _name: &str) -> Result<Vec<u8>> {
        Err(crate::error::RepoError::Policy(
            "importer does not support extended attributes".into(),
        ))
    }
}

/// `Exporter` (spec §6): materializes a restored tree.
pub trait Exporter: Send + Sync {
    fn root(&self) -> String;
    fn create_directory(&self, path: &str, mode: u32, uid: u32, gid: u32, mtime: i64) -> Result<()>;
    fn store_file(
        &self,
        path: &str,
        data: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
        mtime: i64,
    ) -> Result<()>;
    fn symlink(&self, path: &str, target: &str) -> Result<()>;
    fn close(&self) -> Result<()> {
        Ok(())
    }
}
