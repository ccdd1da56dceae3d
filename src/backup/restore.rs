//! Restore pipeline (spec §4.8 "Restore pipeline").
//!
//! Resolves a snapshot, walks its VFS tree from a given path and
//! replays it through an `Exporter`. File content is reassembled and
//! written concurrently by a small worker pool, grounded on the same
//! bounded-channel idiom `backup::packer` borrows from the teacher's
//! `client/pull.rs` (`verify_pool`/`verify_and_write_channel`); here the
//! work unit is "restore one file" rather than "verify one chunk".

use chrono::{DateTime, Utc};

use crate::context::AppContext;
use crate::error::{RepoError, Result};
use crate::mac::Mac;
use crate::resource::ResourceType;

use super::btree::{BTree, MacStore, DEFAULT_ORDER};
use super::repository::{ReadOnlyAccess, Repository};
use super::snapshot::SnapshotHeader;
use super::vfs::{EntryType, Object, VfsEntry};
use crate::io::Exporter;

/// Criteria for `find_snapshots` (spec §4.8 "Resolve snapshot by prefix
/// or filter").
#[derive(Clone, Debug, Default)]
pub struct SnapshotFilter {
    pub name: Option<String>,
    pub category: Option<String>,
    pub environment: Option<String>,
    pub perimeter: Option<String>,
    pub job: Option<String>,
    pub tag: Option<String>,
    pub before: Option<DateTime<Utc>>,
    pub since: Option<DateTime<Utc>>,
    pub latest: bool,
}

/// Resolves an unambiguous hex prefix to a snapshot MAC (spec §6
/// "Snapshot reference syntax": unambiguous → resolved; ambiguous →
/// error).
pub fn resolve_prefix(repo: &Repository, prefix: &str) -> Result<Mac> {
    let matches: Vec<Mac> = repo
        .list_snapshots()
        .into_iter()
        .filter(|mac| mac.to_hex().starts_with(prefix))
        .collect();
    match matches.len() {
        0 => Err(RepoError::NotFound(format!("no snapshot matches prefix {prefix}"))),
        1 => Ok(matches[0]),
        _ => Err(RepoError::Config(format!(
            "ambiguous snapshot prefix {prefix}: matches {}",
            matches.iter().map(Mac::to_hex).collect::<Vec<_>>().join(", ")
        ))),
    }
}

pub fn load_header(repo: &Repository, snapshot_mac: Mac) -> Result<SnapshotHeader> {
    let raw = repo.get_blob(ResourceType::Snapshot, snapshot_mac)?;
    serde_json::from_slice(&raw).map_err(RepoError::from)
}

/// Applies `filter` over every live snapshot's header (spec §4.8
/// "Resolve snapshot by prefix or filter (name/category/environment/
/// perimeter/job/tag/before/since/latest)").
pub fn find_snapshots(repo: &Repository, filter: &SnapshotFilter) -> Result<Vec<(Mac, SnapshotHeader)>> {
    let mut found = Vec::new();
    for mac in repo.list_snapshots() {
        let header = load_header(repo, mac)?;
        if !matches_filter(&header, filter) {
            continue;
        }
        found.push((mac, header));
    }
    found.sort_by_key(|(_, h)| h.timestamp);
    if filter.latest {
        if let Some(last) = found.pop() {
            return Ok(vec![last]);
        }
        return Ok(Vec::new());
    }
    Ok(found)
}

fn matches_filter(header: &SnapshotHeader, filter: &SnapshotFilter) -> bool {
    if let Some(name) = &filter.name {
        if &header.name != name {
            return false;
        }
    }
    if let Some(category) = &filter.category {
        if &header.category != category {
            return false;
        }
    }
    if let Some(environment) = &filter.environment {
        if &header.environment != environment {
            return false;
        }
    }
    if let Some(perimeter) = &filter.perimeter {
        if &header.perimeter != perimeter {
            return false;
        }
    }
    if let Some(job) = &filter.job {
        if &header.job != job {
            return false;
        }
    }
    if let Some(tag) = &filter.tag {
        if !header.tags.iter().any(|t| t == tag) {
            return false;
        }
    }
    if let Some(before) = filter.before {
        if header.timestamp >= before {
            return false;
        }
    }
    if let Some(since) = filter.since {
        if header.timestamp < since {
            return false;
        }
    }
    true
}

/// Restores `snapshot_mac`'s first source, starting from `path_prefix`,
/// into `exporter` (spec §4.8 "Restore pipeline"). Directories and
/// symlinks are replayed on the calling thread in tree order (so parent
/// directories exist before their children, guaranteed by lexicographic
/// path ordering); regular files are reassembled and written by a pool
/// of `ctx.max_concurrency` workers.
pub fn restore_run(
    ctx: &AppContext,
    repo: &Repository,
    snapshot_mac: Mac,
    path_prefix: &str,
    exporter: &dyn Exporter,
) -> Result<()> {
    let header = load_header(repo, snapshot_mac)?;
    let source = header
        .sources
        .first()
        .ok_or_else(|| RepoError::NotFound(format!("snapshot {snapshot_mac} has no sources")))?;

    let Some(root) = source.vfs.root else {
        return Ok(());
    };

    let mac_key = *repo.mac_key();
    let mut access = ReadOnlyAccess::new(repo);
    let tree: BTree<String, VfsEntry, MacStore<'_, ReadOnlyAccess<'_>>> = BTree::open(
        MacStore::read_only(&mut access, &mac_key, ResourceType::VfsNode),
        root,
        DEFAULT_ORDER,
    );

    let entries: Vec<(String, VfsEntry)> = tree
        .scan_from(&path_prefix.to_string())?
        .into_iter()
        .take_while(|(path, _)| path.starts_with(path_prefix))
        .collect();

    let workers = ctx.max_concurrency.max(1);
    let (tx, rx) = crossbeam_channel::bounded::<(String, VfsEntry)>(workers);
    let failure: std::sync::Mutex<Option<RepoError>> = std::sync::Mutex::new(None);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let rx = rx.clone();
            let failure = &failure;
            scope.spawn(move || {
                while let Ok((path, entry)) = rx.recv() {
                    if let Err(e) = restore_regular(repo, exporter, &path, &entry) {
                        let mut slot = failure.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                }
            });
        }

        for (path, entry) in entries {
            if ctx.cancel.is_cancelled() {
                break;
            }
            if failure.lock().unwrap().is_some() {
                break;
            }
            match entry.entry_type {
                EntryType::Directory => {
                    if let Err(e) = exporter.create_directory(
                        &path,
                        entry.fileinfo.mode,
                        entry.fileinfo.uid,
                        entry.fileinfo.gid,
                        entry.fileinfo.mtime,
                    ) {
                        *failure.lock().unwrap() = Some(e);
                        break;
                    }
                }
                EntryType::Symlink => {
                    let target = entry.symlink_target.clone().unwrap_or_default();
                    if let Err(e) = exporter.symlink(&path, &target) {
                        *failure.lock().unwrap() = Some(e);
                        break;
                    }
                }
                EntryType::Regular => {
                    let _ = tx.send((path, entry));
                }
                EntryType::Fifo | EntryType::Socket | EntryType::CharDevice | EntryType::BlockDevice => {
                    log::warn!("restore: skipping unsupported entry type at {path}");
                }
            }
        }
        drop(tx);
    });

    exporter.close()?;

    if let Some(e) = failure.into_inner().unwrap() {
        return Err(e);
    }
    ctx.cancel.check()
}

fn restore_regular(repo: &Repository, exporter: &dyn Exporter, path: &str, entry: &VfsEntry) -> Result<()> {
    let object_mac = entry
        .object_mac
        .ok_or_else(|| RepoError::Corrupted(format!("regular entry at {path} has no object")))?;

    let raw = repo.get_blob(ResourceType::Object, object_mac)?;
    let object: Object = serde_json::from_slice(&raw).map_err(RepoError::from)?;

    let mut data = Vec::with_capacity(object.total_size() as usize);
    for chunk in &object.chunks {
        let bytes = repo.get_blob(ResourceType::Chunk, chunk.mac)?;
        if bytes.len() != chunk.length as usize {
            return Err(RepoError::Corrupted(format!(
                "chunk {} of {path} has length {}, expected {}",
                chunk.mac,
                bytes.len(),
                chunk.length
            )));
        }
        data.extend_from_slice(&bytes);
    }

    exporter.store_file(
        path,
        &data,
        entry.fileinfo.mode,
        entry.fileinfo.uid,
        entry.fileinfo.gid,
        entry.fileinfo.mtime,
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backup::check::{check_run, CheckOptions};
    use crate::backup::repository::{Repository, RepositoryConfig};
    use crate::backup::snapshot::{backup_run, BackupOptions};
    use crate::io::fs::{FsExporter, FsImporter};
    use crate::storage::memory::MemoryBackend;

    fn build_repo() -> Repository {
        let storage = Box::new(MemoryBackend::new());
        let config = RepositoryConfig::new(None, None);
        Repository::create(storage, "passphrase", config).unwrap()
    }

    /// Spec §8 scenario 1: backup + restore round trip, no encryption.
    #[test]
    fn backup_restore_round_trip_is_byte_identical() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("subdir")).unwrap();
        std::fs::create_dir_all(src.path().join("another_subdir")).unwrap();
        std::fs::write(src.path().join("subdir/dummy.txt"), b"hello dummy").unwrap();
        std::fs::write(src.path().join("subdir/foo.txt"), b"hello foo").unwrap();
        std::fs::write(src.path().join("another_subdir/bar.txt"), b"hello bar").unwrap();

        let repo = build_repo();
        let ctx = AppContext::new();
        let importer = FsImporter::new(src.path().to_path_buf());
        let snap = backup_run(&ctx, &repo, &importer, BackupOptions::default()).unwrap();

        let dst = tempfile::tempdir().unwrap();
        let exporter = FsExporter::new(dst.path().to_path_buf());
        restore_run(&ctx, &repo, snap, "", &exporter).unwrap();

        assert_eq!(
            std::fs::read(dst.path().join("subdir/dummy.txt")).unwrap(),
            b"hello dummy"
        );
        assert_eq!(std::fs::read(dst.path().join("subdir/foo.txt")).unwrap(), b"hello foo");
        assert_eq!(
            std::fs::read(dst.path().join("another_subdir/bar.txt")).unwrap(),
            b"hello bar"
        );

        let report = check_run(&ctx, &repo, &[snap], CheckOptions::default()).unwrap();
        assert!(report.is_ok(), "{:?}", report.failures);

        let header = load_header(&repo, snap).unwrap();
        assert_eq!(header.sources[0].summary.directory_count, 2);
        assert_eq!(header.sources[0].summary.file_count, 3);
        let entry_count = header.sources[0].summary.directory_count + header.sources[0].summary.file_count;
        assert_eq!(entry_count, 5);
    }

    /// Empty file (spec §8 "Boundary behaviors"): zero chunks, restores
    /// to an empty file, deterministic object MAC.
    #[test]
    fn empty_file_round_trips_with_zero_chunks() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("empty.txt"), b"").unwrap();

        let repo = build_repo();
        let ctx = AppContext::new();
        let importer = FsImporter::new(src.path().to_path_buf());
        let snap = backup_run(&ctx, &repo, &importer, BackupOptions::default()).unwrap();

        let dst = tempfile::tempdir().unwrap();
        let exporter = FsExporter::new(dst.path().to_path_buf());
        restore_run(&ctx, &repo, snap, "", &exporter).unwrap();

        let restored = std::fs::read(dst.path().join("empty.txt")).unwrap();
        assert!(restored.is_empty());

        let header = load_header(&repo, snap).unwrap();
        let root = header.sources[0].vfs.root.unwrap();
        let mac_key = *repo.mac_key();
        let mut access = ReadOnlyAccess::new(&repo);
        let tree: BTree<String, VfsEntry, MacStore<'_, ReadOnlyAccess<'_>>> =
            BTree::open(MacStore::read_only(&mut access, &mac_key, ResourceType::VfsNode), root, DEFAULT_ORDER);
        let entry = tree.find(&"empty.txt".to_string()).unwrap().expect("entry present");
        let object_raw = repo.get_blob(ResourceType::Object, entry.object_mac.unwrap()).unwrap();
        let object: Object = serde_json::from_slice(&object_raw).unwrap();
        assert!(object.chunks.is_empty());
    }

    /// Spec §8 scenario 2: re-running a backup of an unchanged tree adds
    /// a new snapshot header but no new chunk/object content.
    #[test]
    fn rerunning_backup_dedups_chunks() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), vec![5u8; 200_000]).unwrap();
        std::fs::write(src.path().join("b.txt"), b"hello dummy content").unwrap();

        let repo = build_repo();
        let ctx = AppContext::new();
        let importer = FsImporter::new(src.path().to_path_buf());

        let snap1 = backup_run(&ctx, &repo, &importer, BackupOptions::default()).unwrap();
        let packfiles_after_first = repo.list_packfiles().unwrap().len();
        let chunk_count = |repo: &Repository| {
            repo.with_state(|state| {
                state
                    .iter()
                    .filter(|((rt, _), _)| *rt == ResourceType::Chunk)
                    .count()
            })
        };
        let chunks_after_first = chunk_count(&repo);

        let snap2 = backup_run(&ctx, &repo, &importer, BackupOptions::default()).unwrap();
        assert_ne!(snap1, snap2);
        let chunks_after_second = chunk_count(&repo);
        assert_eq!(
            chunks_after_first, chunks_after_second,
            "re-running backup of an unchanged tree must not add new chunks"
        );

        let _ = packfiles_after_first;
    }
}
