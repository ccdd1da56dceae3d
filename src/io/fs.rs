//! Local filesystem importer/exporter, walked with `walkdir` (already a
//! teacher dependency; the teacher itself walks datastore directories
//! with it, e.g. for pruning and GC enumeration).

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::backup::vfs::FileInfo;
use crate::error::{RepoError, Result};

use super::{Exporter, Importer, ImporterInfo, ScanError, ScanRecord};

pub struct FsImporter {
    root: PathBuf,
}

impl FsImporter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

impl Importer for FsImporter {
    fn info(&self) -> ImporterInfo {
        ImporterInfo {
            importer_type: "fs".into(),
            origin: "localhost".into(),
            root: self.root.to_string_lossy().into_owned(),
        }
    }

    fn scan(&self) -> Result<(Vec<ScanRecord>, Vec<ScanError>)> {
        let mut records = Vec::new();
        let mut errors = Vec::new();

        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    errors.push(ScanError {
                        path: e.path().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let path = entry.path();
            let rel = self.relative(path);
            if rel.is_empty() {
                continue;
            }

            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    errors.push(ScanError {
                        path: rel,
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let fileinfo = to_fileinfo(path, &meta);

            if meta.file_type().is_symlink() {
                match std::fs::read_link(path) {
                    Ok(target) => records.push(ScanRecord::Symlink {
                        path: rel,
                        fileinfo,
                        target: target.to_string_lossy().into_owned(),
                    }),
                    Err(e) => errors.push(ScanError {
                        path: rel,
                        message: e.to_string(),
                    }),
                }
            } else if meta.is_dir() {
                records.push(ScanRecord::Directory {
                    path: rel,
                    fileinfo,
                    xattr_names: Vec::new(),
                });
            } else if meta.is_file() {
                records.push(ScanRecord::Regular {
                    path: rel,
                    fileinfo,
                    xattr_names: Vec::new(),
                });
            }
        }

        Ok((records, errors))
    }

    fn read(&self, pathname: &str) -> Result<Box<dyn Read>> {
        let path = self.root.join(pathname.trim_start_matches('/'));
        let file = File::open(&path)
            .map_err(|e| RepoError::Io(format!("open {}: {e}", path.display())))?;
        Ok(Box::new(file))
    }
}

fn to_fileinfo(path: &Path, meta: &std::fs::Metadata) -> FileInfo {
    FileInfo {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size: meta.size(),
        mode: meta.permissions().mode(),
        mtime: meta.mtime(),
        dev: meta.dev(),
        ino: meta.ino(),
        uid: meta.uid(),
        gid: meta.gid(),
        nlink: meta.nlink(),
        username: lookup_username(meta.uid()),
        groupname: lookup_groupname(meta.gid()),
    }
}

fn lookup_username(uid: u32) -> Option<String> {
    unsafe {
        let pw = libc::getpwuid(uid);
        if pw.is_null() {
            return None;
        }
        let name = std::ffi::CStr::from_ptr((*pw).pw_name);
        Some(name.to_string_lossy().into_owned())
    }
}

fn lookup_groupname(gid: u32) -> Option<String> {
    unsafe {
        let gr = libc::getgrgid(gid);
        if gr.is_null() {
            return None;
        }
        let name = std::ffi::CStr::from_ptr((*gr).gr_name);
        Some(name.to_string_lossy().into_owned())
    }
}

pub struct FsExporter {
    root: PathBuf,
}

impl FsExporter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn target(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl Exporter for FsExporter {
    fn root(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    fn create_directory(&self, path: &str, mode: u32, _uid: u32, _gid: u32, _mtime: i64) -> Result<()> {
        let target = self.target(path);
        std::fs::create_dir_all(&target)
            .map_err(|e| RepoError::Io(format!("mkdir {}: {e}", target.display())))?;
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode & 0o7777))
            .map_err(RepoError::from)?;
        Ok(())
    }

    fn store_file(
        &self,
        path: &str,
        data: &[u8],
        mode: u32,
        _uid: u32,
        _gid: u32,
        _mtime: i64,
    ) -> Result<()> {
        let target = self.target(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(RepoError::from)?;
        }
        std::fs::write(&target, data)
            .map_err(|e| RepoError::Io(format!("write {}: {e}", target.display())))?;
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode & 0o7777))
            .map_err(RepoError::from)?;
        Ok(())
    }

    fn symlink(&self, path: &str, target_path: &str) -> Result<()> {
        let target = self.target(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(RepoError::from)?;
        }
        std::os::unix::fs::symlink(target_path, &target)
            .map_err(|e| RepoError::Io(format!("symlink {}: {e}", target.display())))?;
        Ok(())
    }
}
