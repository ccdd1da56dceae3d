//! Garbage collection (spec §4.8 "Maintenance / GC pipeline", C12).
//!
//! Two-phase colour/sweep over packfiles rather than individual blobs:
//! colour marks every packfile holding at least one blob reachable from a
//! live snapshot, then anything left uncoloured and older than the grace
//! period is tombstoned in one batched state delta; sweep re-verifies
//! each candidate's liveness immediately before any destructive action,
//! so a packfile that a concurrent backup referenced after colouring
//! started is never removed out from under it (spec §7: "un-colour
//! before removing any blob"). Grounded on check.rs's closure traversal
//! (same walk over vfs/xattr/error/index trees, reused here to collect
//! `Location::packfile_mac` instead of verifying content) and lock.rs's
//! exclusive-lock idiom (teacher has no equivalent; see lock.rs's own
//! doc comment).

use std::collections::HashSet;
use std::time::Duration;

use crate::context::AppContext;
use crate::error::Result;
use crate::mac::Mac;
use crate::resource::ResourceType;

use super::btree::Node;
use super::packfile::PackReader;
use super::repository::Repository;
use super::restore::load_header;
use super::state::{self, Location};
use super::vfs::{Object, VfsEntry};

/// Minimum age a packfile must reach, past its own footer timestamp,
/// before it's eligible for collection — protects a packfile that was
/// just sealed by a backup still in flight, whose snapshot header (and
/// thus its references into that packfile) hasn't committed yet.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30 * 86400);

#[derive(Clone, Debug, Default)]
pub struct MaintenanceReport {
    pub live_packfiles: usize,
    pub tombstoned: Vec<Mac>,
    pub deleted: Vec<Mac>,
}

/// Runs one colour+sweep pass (spec §4.8 "Maintenance / GC pipeline").
/// Physically deletes tombstoned packfiles only when `ctx.env.do_deletion`
/// is set (spec §6 environment toggles); otherwise the tombstone alone
/// makes them unreachable and a later run with deletion enabled reaps them.
pub fn maintenance_run(ctx: &AppContext, repo: &Repository) -> Result<MaintenanceReport> {
    let lock = super::lock::acquire_exclusive(repo.storage(), &repo.codec(), ctx.env.lockless)?;
    let result = run_locked(ctx, repo);
    super::lock::release(repo.storage(), lock)?;
    result
}

fn run_locked(ctx: &AppContext, repo: &Repository) -> Result<MaintenanceReport> {
    let grace_period = ctx.env.grace_period.unwrap_or(DEFAULT_GRACE_PERIOD);

    let live_packfiles = collect_live_packfiles(ctx, repo)?;
    let all_packfiles = repo.list_packfiles()?;
    let now_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0) as i128;

    let mut candidates = Vec::new();
    for pf in &all_packfiles {
        ctx.cancel.check()?;
        if live_packfiles.contains(pf) {
            continue;
        }
        match packfile_age_ns(repo, *pf, now_ns) {
            Ok(age_ns) if age_ns >= grace_period.as_nanos() as i128 => candidates.push(*pf),
            Ok(_) => {}
            Err(e) => log::warn!("maintenance: could not read footer of packfile {pf}, skipping: {e}"),
        }
    }

    let mut report = MaintenanceReport {
        live_packfiles: live_packfiles.len(),
        ..Default::default()
    };
    if candidates.is_empty() {
        return Ok(report);
    }

    let mut tx = state::start_transaction(crate::mac::random_mac());
    for pf in &candidates {
        tx.delete(ResourceType::Packfile, *pf);
    }
    state::commit_transaction(repo.storage(), &repo.codec(), tx)?;
    repo.refresh_state()?;
    report.tombstoned = candidates.clone();
    log::info!("maintenance: coloured {} packfile(s) dead", candidates.len());

    // Sweep: re-derive liveness after the colour commit so a snapshot
    // that landed mid-run (referencing one of these packfiles through a
    // freshly sealed one of its own, not this one) is reflected before
    // anything is actually removed.
    let live_after = collect_live_packfiles(ctx, repo)?;
    for pf in candidates {
        ctx.cancel.check()?;
        if live_after.contains(&pf) {
            log::warn!("maintenance: packfile {pf} became live again before sweep, skipping deletion");
            continue;
        }
        if ctx.env.do_deletion {
            repo.storage().delete_packfile(pf)?;
            report.deleted.push(pf);
        }
    }

    Ok(report)
}

fn packfile_age_ns(repo: &Repository, packfile_mac: Mac, now_ns: i128) -> Result<i128> {
    let bytes = repo.storage().get_packfile(packfile_mac)?;
    let reader = PackReader::new(repo.codec());
    let sealed_ns = reader.footer_timestamp_ns(&bytes)?;
    Ok(now_ns - sealed_ns)
}

/// Walks every live snapshot's transitive closure, same tree shapes
/// check.rs walks, collecting the `packfile_mac` each reachable blob's
/// `Location` resolves to rather than verifying the blob's content.
fn collect_live_packfiles(ctx: &AppContext, repo: &Repository) -> Result<HashSet<Mac>> {
    let mut live = HashSet::new();
    for snapshot_mac in repo.list_snapshots() {
        ctx.cancel.check()?;
        mark(repo, ResourceType::Snapshot, snapshot_mac, &mut live);

        let Ok(header) = load_header(repo, snapshot_mac) else {
            continue;
        };
        if repo.blob_exists(ResourceType::Signature, snapshot_mac) {
            mark(repo, ResourceType::Signature, snapshot_mac, &mut live);
        }

        for source in &header.sources {
            if let Some(root) = source.vfs.root {
                collect_vfs(repo, root, &mut live)?;
            }
            if let Some(root) = source.vfs.xattrs {
                collect_xattr(repo, root, &mut live)?;
            }
            if let Some(root) = source.vfs.errors {
                collect_opaque::<String, String>(repo, root, ResourceType::ErrorNode, &mut live)?;
            }
            for (_name, root) in &source.indexes {
                collect_opaque::<String, Vec<String>>(repo, *root, ResourceType::BtreeNode, &mut live)?;
            }
        }
    }
    Ok(live)
}

/// Records the packfile backing `(resource_type, mac)` as live, if the
/// blob is still present in the aggregated state. A blob state forgot
/// about (already swept elsewhere) contributes nothing — there is
/// nothing left to keep alive on its behalf.
fn mark(repo: &Repository, resource_type: ResourceType, mac: Mac, live: &mut HashSet<Mac>) {
    if let Some(Location { packfile_mac, .. }) = repo.with_state(|s| s.get(resource_type, mac)) {
        live.insert(packfile_mac);
    }
}

fn collect_vfs(repo: &Repository, node_mac: Mac, live: &mut HashSet<Mac>) -> Result<()> {
    mark(repo, ResourceType::VfsNode, node_mac, live);
    let Ok(plain) = repo.get_blob(ResourceType::VfsNode, node_mac) else {
        return Ok(());
    };
    let node: Node<String, VfsEntry, Mac> =
        serde_json::from_slice(&plain).map_err(crate::error::RepoError::from)?;
    match node {
        Node::Leaf { values, .. } => {
            for entry in &values {
                if let Some(xattrs_mac) = entry.xattrs {
                    mark(repo, ResourceType::XattrEntry, xattrs_mac, live);
                }
                let Some(object_mac) = entry.object_mac else {
                    continue;
                };
                mark(repo, ResourceType::Object, object_mac, live);
                if let Ok(object_plain) = repo.get_blob(ResourceType::Object, object_mac) {
                    if let Ok(object) = serde_json::from_slice::<Object>(&object_plain) {
                        for chunk in &object.chunks {
                            mark(repo, ResourceType::Chunk, chunk.mac, live);
                        }
                    }
                }
            }
        }
        Node::Internal { children, .. } => {
            for child in children {
                collect_vfs(repo, child, live)?;
            }
        }
    }
    Ok(())
}

fn collect_xattr(repo: &Repository, node_mac: Mac, live: &mut HashSet<Mac>) -> Result<()> {
    mark(repo, ResourceType::XattrNode, node_mac, live);
    let Ok(plain) = repo.get_blob(ResourceType::XattrNode, node_mac) else {
        return Ok(());
    };
    let node: Node<String, Mac, Mac> =
        serde_json::from_slice(&plain).map_err(crate::error::RepoError::from)?;
    match node {
        Node::Leaf { values, .. } => {
            for v in values {
                mark(repo, ResourceType::XattrEntry, v, live);
            }
        }
        Node::Internal { children, .. } => {
            for child in children {
                collect_xattr(repo, child, live)?;
            }
        }
    }
    Ok(())
}

fn collect_opaque<K, V>(
    repo: &Repository,
    node_mac: Mac,
    node_type: ResourceType,
    live: &mut HashSet<Mac>,
) -> Result<()>
where
    K: serde::de::DeserializeOwned,
    V: serde::de::DeserializeOwned,
{
    mark(repo, node_type, node_mac, live);
    let Ok(plain) = repo.get_blob(node_type, node_mac) else {
        return Ok(());
    };
    let node: Node<K, V, Mac> = serde_json::from_slice(&plain).map_err(crate::error::RepoError::from)?;
    if let Node::Internal { children, .. } = node {
        for child in children {
            collect_opaque::<K, V>(repo, child, node_type, live)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backup::repository::RepositoryConfig;
    use crate::backup::snapshot::{backup_run, BackupOptions};
    use crate::io::fs::FsImporter;
    use crate::storage::memory::MemoryBackend;

    fn build_repo() -> Repository {
        let storage = Box::new(MemoryBackend::new());
        let config = RepositoryConfig::new(None, None);
        Repository::create(storage, "passphrase", config).unwrap()
    }

    fn ctx_with_grace(secs: u64, do_deletion: bool) -> AppContext {
        let mut ctx = AppContext::new();
        ctx.env.grace_period = Some(Duration::from_secs(secs));
        ctx.env.do_deletion = do_deletion;
        ctx
    }

    #[test]
    fn live_snapshot_packfiles_are_never_collected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"hello dummy content").unwrap();

        let repo = build_repo();
        let ctx = ctx_with_grace(0, true);
        let importer = FsImporter::new(tmp.path().to_path_buf());
        backup_run(&ctx, &repo, &importer, BackupOptions::default()).unwrap();

        let before = repo.list_packfiles().unwrap().len();
        let report = maintenance_run(&ctx, &repo).unwrap();
        assert!(report.tombstoned.is_empty());
        assert!(report.deleted.is_empty());
        assert_eq!(repo.list_packfiles().unwrap().len(), before);
    }

    #[test]
    fn orphaned_packfile_is_collected_after_snapshot_deletion() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), vec![7u8; 4096]).unwrap();

        let repo = build_repo();
        let ctx = ctx_with_grace(0, true);
        let importer = FsImporter::new(tmp.path().to_path_buf());
        let snap = backup_run(&ctx, &repo, &importer, BackupOptions::default()).unwrap();
        repo.delete_snapshot(snap).unwrap();
        repo.refresh_state().unwrap();

        let before = repo.list_packfiles().unwrap().len();
        assert!(before > 0);
        let report = maintenance_run(&ctx, &repo).unwrap();
        assert_eq!(report.deleted.len(), before);
        assert_eq!(repo.list_packfiles().unwrap().len(), 0);
    }

    #[test]
    fn grace_period_defers_collection() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), vec![7u8; 4096]).unwrap();

        let repo = build_repo();
        let short_grace_ctx = AppContext::new();
        let importer = FsImporter::new(tmp.path().to_path_buf());
        let snap = backup_run(&short_grace_ctx, &repo, &importer, BackupOptions::default()).unwrap();
        repo.delete_snapshot(snap).unwrap();
        repo.refresh_state().unwrap();

        let long_grace_ctx = ctx_with_grace(3600, true);
        let report = maintenance_run(&long_grace_ctx, &repo).unwrap();
        assert!(report.tombstoned.is_empty());
        assert!(!repo.list_packfiles().unwrap().is_empty());
    }
}
