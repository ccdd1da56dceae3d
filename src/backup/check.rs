//! Integrity check pipeline (spec §4.8 "Check pipeline").
//!
//! Walks the transitive closure of blobs reachable from one or more
//! snapshots and verifies each one: present in the aggregated state, and
//! unless `FastCheck` is requested, that its packfile slice decodes to
//! plaintext whose MAC matches (spec §8 "ForAll blob b reachable from S,
//! GetBlob(type(b), mac(b)) succeeds and the decoded content's MAC equals
//! mac(b)"). Structural nodes (VFS/xattr/error/index tree nodes, and
//! `Object`) are always fully decoded regardless of `fast`, since finding
//! the rest of the closure requires reading them; `fast` only widens to
//! presence-only checks for the terminal content blobs (`Chunk`,
//! `XattrEntry`) that dominate a repository's bulk (spec §9 open question:
//! this crate reads "FastCheck verifies presence, not content" as scoped
//! to terminal blobs, the only reading under which the closure can still
//! be discovered).
//!
//! Never aborts on a single corrupt or missing blob (spec §7: "the check
//! pipeline accumulates failures into a run-level report rather than
//! aborting on the first one"); the caller decides the exit status from
//! `CheckReport::is_ok`.

use std::collections::HashMap;

use crate::context::AppContext;
use crate::error::{RepoError, Result};
use crate::mac::Mac;
use crate::resource::ResourceType;

use super::btree::Node;
use super::repository::Repository;
use super::restore::load_header;
use super::vfs::{Object, VfsEntry};

#[derive(Clone, Copy, Debug, Default)]
pub struct CheckOptions {
    pub fast: bool,
    pub verify_signatures: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobStatus {
    Ok,
    Missing,
    Corrupted,
}

#[derive(Clone, Debug)]
pub struct CheckFailure {
    pub snapshot: Mac,
    pub path: Option<String>,
    pub resource_type: ResourceType,
    pub mac: Mac,
    pub status: BlobStatus,
}

#[derive(Clone, Debug, Default)]
pub struct CheckReport {
    pub checked: u64,
    pub failures: Vec<CheckFailure>,
    pub bad_signatures: Vec<Mac>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty() && self.bad_signatures.is_empty()
    }
}

/// Per-run memoization of blob status, so content shared across several
/// snapshots (or repeated within one, via content-addressed dedup) is
/// verified exactly once (spec §4.8: "CheckCache memoizes per-blob status
/// across snapshots within a check run").
#[derive(Default)]
struct CheckCache {
    seen: HashMap<(ResourceType, Mac), BlobStatus>,
}

pub fn check_run(
    ctx: &AppContext,
    repo: &Repository,
    snapshots: &[Mac],
    options: CheckOptions,
) -> Result<CheckReport> {
    let mut report = CheckReport::default();
    let mut cache = CheckCache::default();

    for &snapshot_mac in snapshots {
        ctx.cancel.check()?;
        check_snapshot(ctx, repo, snapshot_mac, options, &mut cache, &mut report)?;
    }
    Ok(report)
}

fn check_snapshot(
    ctx: &AppContext,
    repo: &Repository,
    snapshot_mac: Mac,
    options: CheckOptions,
    cache: &mut CheckCache,
    report: &mut CheckReport,
) -> Result<()> {
    let header = match load_header(repo, snapshot_mac) {
        Ok(h) => h,
        Err(_) => {
            report.failures.push(CheckFailure {
                snapshot: snapshot_mac,
                path: None,
                resource_type: ResourceType::Snapshot,
                mac: snapshot_mac,
                status: BlobStatus::Missing,
            });
            return Ok(());
        }
    };
    report.checked += 1;

    if options.verify_signatures && !verify_signature(repo, snapshot_mac)? {
        report.bad_signatures.push(snapshot_mac);
    }

    for source in &header.sources {
        ctx.cancel.check()?;
        if let Some(root) = source.vfs.root {
            walk_vfs(ctx, repo, snapshot_mac, root, options, cache, report)?;
        }
        if let Some(root) = source.vfs.xattrs {
            walk_xattr(ctx, repo, snapshot_mac, root, options, cache, report)?;
        }
        if let Some(root) = source.vfs.errors {
            walk_opaque::<String, String>(
                ctx,
                repo,
                snapshot_mac,
                root,
                ResourceType::ErrorNode,
                cache,
                report,
            )?;
        }
        for (_name, root) in &source.indexes {
            walk_opaque::<String, Vec<String>>(
                ctx,
                repo,
                snapshot_mac,
                *root,
                ResourceType::BtreeNode,
                cache,
                report,
            )?;
        }
    }
    Ok(())
}

fn check_structural(
    repo: &Repository,
    resource_type: ResourceType,
    mac: Mac,
    cache: &mut CheckCache,
) -> (BlobStatus, Option<Vec<u8>>) {
    if let Some(status) = cache.seen.get(&(resource_type, mac)) {
        return (*status, None);
    }
    let (status, bytes) = match repo.get_blob(resource_type, mac) {
        Ok(plain) => (BlobStatus::Ok, Some(plain)),
        Err(RepoError::NotFound(_)) => (BlobStatus::Missing, None),
        Err(_) => (BlobStatus::Corrupted, None),
    };
    cache.seen.insert((resource_type, mac), status);
    (status, bytes)
}

fn check_terminal(
    repo: &Repository,
    resource_type: ResourceType,
    mac: Mac,
    fast: bool,
    cache: &mut CheckCache,
) -> BlobStatus {
    if let Some(status) = cache.seen.get(&(resource_type, mac)) {
        return *status;
    }
    let status = if fast {
        if repo.blob_exists(resource_type, mac) {
            BlobStatus::Ok
        } else {
            BlobStatus::Missing
        }
    } else {
        match repo.get_blob(resource_type, mac) {
            Ok(_) => BlobStatus::Ok,
            Err(RepoError::NotFound(_)) => BlobStatus::Missing,
            Err(_) => BlobStatus::Corrupted,
        }
    };
    cache.seen.insert((resource_type, mac), status);
    status
}

fn walk_vfs(
    ctx: &AppContext,
    repo: &Repository,
    snapshot_mac: Mac,
    node_mac: Mac,
    options: CheckOptions,
    cache: &mut CheckCache,
    report: &mut CheckReport,
) -> Result<()> {
    ctx.cancel.check()?;
    report.checked += 1;
    let (status, bytes) = check_structural(repo, ResourceType::VfsNode, node_mac, cache);
    if status != BlobStatus::Ok {
        report.failures.push(CheckFailure {
            snapshot: snapshot_mac,
            path: None,
            resource_type: ResourceType::VfsNode,
            mac: node_mac,
            status,
        });
        return Ok(());
    }
    let Some(plain) = bytes else {
        return Ok(());
    };
    let node: Node<String, VfsEntry, Mac> = serde_json::from_slice(&plain).map_err(RepoError::from)?;
    match node {
        Node::Leaf { keys, values, .. } => {
            for (path, entry) in keys.into_iter().zip(values.into_iter()) {
                check_vfs_entry(ctx, repo, snapshot_mac, &path, &entry, options, cache, report)?;
            }
        }
        Node::Internal { children, .. } => {
            for child in children {
                walk_vfs(ctx, repo, snapshot_mac, child, options, cache, report)?;
            }
        }
    }
    Ok(())
}

fn check_vfs_entry(
    ctx: &AppContext,
    repo: &Repository,
    snapshot_mac: Mac,
    path: &str,
    entry: &VfsEntry,
    options: CheckOptions,
    cache: &mut CheckCache,
    report: &mut CheckReport,
) -> Result<()> {
    ctx.cancel.check()?;

    if let Some(xattrs_mac) = entry.xattrs {
        let status = check_terminal(repo, ResourceType::XattrEntry, xattrs_mac, options.fast, cache);
        if status != BlobStatus::Ok {
            report.failures.push(CheckFailure {
                snapshot: snapshot_mac,
                path: Some(path.to_string()),
                resource_type: ResourceType::XattrEntry,
                mac: xattrs_mac,
                status,
            });
        }
    }

    let Some(object_mac) = entry.object_mac else {
        return Ok(());
    };

    let (status, bytes) = check_structural(repo, ResourceType::Object, object_mac, cache);
    if status != BlobStatus::Ok {
        report.failures.push(CheckFailure {
            snapshot: snapshot_mac,
            path: Some(path.to_string()),
            resource_type: ResourceType::Object,
            mac: object_mac,
            status,
        });
        return Ok(());
    }
    let Some(plain) = bytes else {
        return Ok(());
    };
    let object: Object = serde_json::from_slice(&plain).map_err(RepoError::from)?;
    for chunk in &object.chunks {
        let status = check_terminal(repo, ResourceType::Chunk, chunk.mac, options.fast, cache);
        if status != BlobStatus::Ok {
            report.failures.push(CheckFailure {
                snapshot: snapshot_mac,
                path: Some(path.to_string()),
                resource_type: ResourceType::Chunk,
                mac: chunk.mac,
                status,
            });
        }
    }
    Ok(())
}

fn walk_xattr(
    ctx: &AppContext,
    repo: &Repository,
    snapshot_mac: Mac,
    node_mac: Mac,
    options: CheckOptions,
    cache: &mut CheckCache,
    report: &mut CheckReport,
) -> Result<()> {
    ctx.cancel.check()?;
    let (status, bytes) = check_structural(repo, ResourceType::XattrNode, node_mac, cache);
    if status != BlobStatus::Ok {
        report.failures.push(CheckFailure {
            snapshot: snapshot_mac,
            path: None,
            resource_type: ResourceType::XattrNode,
            mac: node_mac,
            status,
        });
        return Ok(());
    }
    let Some(plain) = bytes else {
        return Ok(());
    };
    let node: Node<String, Mac, Mac> = serde_json::from_slice(&plain).map_err(RepoError::from)?;
    match node {
        Node::Leaf { values, .. } => {
            for v in values {
                let status = check_terminal(repo, ResourceType::XattrEntry, v, options.fast, cache);
                if status != BlobStatus::Ok {
                    report.failures.push(CheckFailure {
                        snapshot: snapshot_mac,
                        path: None,
                        resource_type: ResourceType::XattrEntry,
                        mac: v,
                        status,
                    });
                }
            }
        }
        Node::Internal { children, .. } => {
            for child in children {
                walk_xattr(ctx, repo, snapshot_mac, child, options, cache, report)?;
            }
        }
    }
    Ok(())
}

fn walk_opaque<K, V>(
    ctx: &AppContext,
    repo: &Repository,
    snapshot_mac: Mac,
    node_mac: Mac,
    node_type: ResourceType,
    cache: &mut CheckCache,
    report: &mut CheckReport,
) -> Result<()>
where
    K: serde::de::DeserializeOwned,
    V: serde::de::DeserializeOwned,
{
    ctx.cancel.check()?;
    let (status, bytes) = check_structural(repo, node_type, node_mac, cache);
    if status != BlobStatus::Ok {
        report.failures.push(CheckFailure {
            snapshot: snapshot_mac,
            path: None,
            resource_type: node_type,
            mac: node_mac,
            status,
        });
        return Ok(());
    }
    let Some(plain) = bytes else {
        return Ok(());
    };
    let node: Node<K, V, Mac> = serde_json::from_slice(&plain).map_err(RepoError::from)?;
    if let Node::Internal { children, .. } = node {
        for child in children {
            walk_opaque::<K, V>(ctx, repo, snapshot_mac, child, node_type, cache, report)?;
        }
    }
    Ok(())
}

/// Snapshot header signatures are optional: a missing `SIGNATURE` blob is
/// not itself a failure (it just means this snapshot was never signed),
/// only a present-but-invalid one is.
fn verify_signature(repo: &Repository, snapshot_mac: Mac) -> Result<bool> {
    let header_plain = match repo.get_blob(ResourceType::Snapshot, snapshot_mac) {
        Ok(p) => p,
        Err(_) => return Ok(false),
    };
    let sig_plain = match repo.get_blob_unverified(ResourceType::Signature, snapshot_mac) {
        Ok(p) => p,
        Err(RepoError::NotFound(_)) => return Ok(true),
        Err(_) => return Ok(false),
    };
    super::signing::verify(&header_plain, &sig_plain)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backup::repository::{RepositoryConfig, Repository};
    use crate::backup::snapshot::{backup_run, BackupOptions};
    use crate::io::fs::FsImporter;
    use crate::storage::memory::MemoryBackend;

    fn build_repo() -> Repository {
        let storage = Box::new(MemoryBackend::new());
        let config = RepositoryConfig::new(None, None);
        Repository::create(storage, "passphrase", config).unwrap()
    }

    #[test]
    fn clean_backup_checks_ok() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"hello dummy").unwrap();

        let repo = build_repo();
        let ctx = AppContext::new();
        let importer = FsImporter::new(tmp.path().to_path_buf());
        let snap = backup_run(&ctx, &repo, &importer, BackupOptions::default()).unwrap();

        let report = check_run(&ctx, &repo, &[snap], CheckOptions::default()).unwrap();
        assert!(report.is_ok(), "{:?}", report.failures);
    }

    #[test]
    fn missing_chunk_is_reported_corrupted_or_missing() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), vec![9u8; 8192]).unwrap();

        let repo = build_repo();
        let ctx = AppContext::new();
        let importer = FsImporter::new(tmp.path().to_path_buf());
        let snap = backup_run(&ctx, &repo, &importer, BackupOptions::default()).unwrap();

        // Simulate packfile loss: delete every packfile out from under the
        // repository, then rebuild the in-memory state so lookups still
        // resolve to (now-dangling) locations.
        for pf in repo.storage().get_packfiles().unwrap() {
            repo.storage().delete_packfile(pf).unwrap();
        }

        let report = check_run(&ctx, &repo, &[snap], CheckOptions::default()).unwrap();
        assert!(!report.is_ok());
    }

    #[test]
    fn byte_corruption_in_packfile_body_is_detected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), vec![3u8; 4096]).unwrap();

        let repo = build_repo();
        let ctx = AppContext::new();
        let importer = FsImporter::new(tmp.path().to_path_buf());
        let snap = backup_run(&ctx, &repo, &importer, BackupOptions::default()).unwrap();

        let pf = repo.storage().get_packfiles().unwrap().into_iter().next().unwrap();
        let mut bytes = repo.storage().get_packfile(pf).unwrap();
        bytes[5] ^= 0xff;
        repo.storage().put_packfile(pf, &bytes).unwrap();

        let report = check_run(&ctx, &repo, &[snap], CheckOptions::default()).unwrap();
        assert!(!report.is_ok());
        assert!(report.failures.iter().any(|f| f.status == BlobStatus::Corrupted));
    }

    #[test]
    fn fast_check_skips_corruption_reads_for_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"some content here").unwrap();

        let repo = build_repo();
        let ctx = AppContext::new();
        let importer = FsImporter::new(tmp.path().to_path_buf());
        let snap = backup_run(&ctx, &repo, &importer, BackupOptions::default()).unwrap();

        let report = check_run(
            &ctx,
            &repo,
            &[snap],
            CheckOptions { fast: true, verify_signatures: false },
        )
        .unwrap();
        assert!(report.is_ok());
    }
}
