//! Snapshot synchronization pipeline (spec §4.8 "Sync pipeline").
//!
//! Replicates missing snapshots' transitive blob closures between two
//! repositories, skipping blobs the destination already has via
//! `BlobExists` (spec §4.8 step 3). Grounded closely on the teacher's
//! `client::pull` module (`pull_store` -> `pull_group` -> `pull_snapshot`
//! -> `pull_index_chunks`, a stream-based dedup download that checks a
//! shared set before fetching each chunk); this pipeline generalizes
//! "pull" to a direction {to, from, with} since the teacher only ever
//! pulls from a remote server (spec §9 design notes).
//!
//! Both repositories must share the same MAC key (derived from the same
//! repository secret and `mac_key_salt`): a blob's identity is its
//! content address, and this pipeline preserves a blob's *source* MAC
//! verbatim on the destination rather than recomputing one under the
//! destination's own key, so the two keyspaces must already agree for
//! the copied graph's cross-references (`VfsEntry::object_mac`,
//! `ObjectChunk::mac`, tree node pointers, ...) to resolve once written.
//! Open Question resolution: spec.md never states this explicitly; it is
//! the only reading under which "BlobExists on dst to skip already-
//! present blobs" and the sync completeness testable property both hold
//! without every synced blob being silently re-addressed.

use std::collections::HashSet;

use crate::context::AppContext;
use crate::error::{RepoError, Result};
use crate::mac::Mac;
use crate::resource::ResourceType;

use super::btree::{BlobAccess, Node};
use super::repository::{BlobAccessor, Repository};
use super::snapshot::SnapshotHeader;
use super::vfs::{Object, VfsEntry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncDirection {
    To,
    From,
    With,
}

impl SyncDirection {
    /// Parses the CLI-level spelling; `both` is accepted as an alias for
    /// `with` (spec §9 open question: "sync `direction` value is
    /// inconsistent (`both` vs `with`) across source revisions").
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "to" => Ok(SyncDirection::To),
            "from" => Ok(SyncDirection::From),
            "with" | "both" => Ok(SyncDirection::With),
            other => Err(RepoError::Config(format!("unknown sync direction '{other}'"))),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SyncReport {
    pub pushed_to_dst: Vec<Mac>,
    pub pushed_to_src: Vec<Mac>,
}

/// Runs a sync between `src` and `dst` in the given `direction` (spec
/// §4.8 "Sync pipeline").
pub fn sync_run(
    ctx: &AppContext,
    src: &Repository,
    dst: &Repository,
    direction: SyncDirection,
) -> Result<SyncReport> {
    if src.mac_key() != dst.mac_key() {
        return Err(RepoError::Config(
            "sync requires both repositories to share the same MAC key".into(),
        ));
    }

    let src_snaps: HashSet<Mac> = src.list_snapshots().into_iter().collect();
    let dst_snaps: HashSet<Mac> = dst.list_snapshots().into_iter().collect();

    let mut report = SyncReport::default();

    if matches!(direction, SyncDirection::To | SyncDirection::With) {
        for mac in src_snaps.difference(&dst_snaps) {
            ctx.cancel.check()?;
            push_snapshot(src, dst, *mac)?;
            report.pushed_to_dst.push(*mac);
        }
    }

    if matches!(direction, SyncDirection::From | SyncDirection::With) {
        for mac in dst_snaps.difference(&src_snaps) {
            ctx.cancel.check()?;
            push_snapshot(dst, src, *mac)?;
            report.pushed_to_src.push(*mac);
        }
    }

    Ok(report)
}

/// Pushes one snapshot's header, optional signature, and full transitive
/// blob closure from `src` to `dst` (spec §4.8 "Sync pipeline" steps
/// 2a-2f), then commits `dst`'s state delta for it.
fn push_snapshot(src: &Repository, dst: &Repository, snapshot_mac: Mac) -> Result<()> {
    if dst.blob_exists(ResourceType::Snapshot, snapshot_mac) {
        return Ok(());
    }

    let header_plain = src.get_blob(ResourceType::Snapshot, snapshot_mac)?;
    let header: SnapshotHeader = serde_json::from_slice(&header_plain).map_err(RepoError::from)?;

    let packer = dst.packer();
    let mut content = BlobAccessor::new(dst, &packer);
    content.put_blob(ResourceType::Snapshot, snapshot_mac, &header_plain)?;

    if let Ok(sig) = src.get_blob_unverified(ResourceType::Signature, snapshot_mac) {
        content.put_blob(ResourceType::Signature, snapshot_mac, &sig)?;
    }

    for source in &header.sources {
        if let Some(root) = source.vfs.root {
            push_vfs_tree(src, dst, &mut content, root)?;
        }
        if let Some(root) = source.vfs.xattrs {
            push_xattr_tree(src, dst, &mut content, root)?;
        }
        if let Some(root) = source.vfs.errors {
            push_opaque_tree::<String, String>(src, dst, &mut content, root, ResourceType::ErrorNode)?;
        }
        for (_name, root) in &source.indexes {
            push_opaque_tree::<String, Vec<String>>(
                src,
                dst,
                &mut content,
                *root,
                ResourceType::BtreeNode,
            )?;
        }
    }

    packer.wait()?;
    dst.commit_pending(snapshot_mac)?;
    log::info!("sync: pushed snapshot {} ({snapshot_mac})", header.name);
    Ok(())
}

fn push_vfs_tree(
    src: &Repository,
    dst: &Repository,
    content: &mut BlobAccessor<'_>,
    root: Mac,
) -> Result<()> {
    if dst.blob_exists(ResourceType::VfsNode, root) {
        return Ok(());
    }
    let plain = src.get_blob(ResourceType::VfsNode, root)?;
    let node: Node<String, VfsEntry, Mac> = serde_json::from_slice(&plain).map_err(RepoError::from)?;
    match &node {
        Node::Leaf { values, .. } => {
            for entry in values {
                push_vfs_entry_refs(src, dst, content, entry)?;
            }
        }
        Node::Internal { children, .. } => {
            for child in children {
                push_vfs_tree(src, dst, content, *child)?;
            }
        }
    }
    content.put_blob(ResourceType::VfsNode, root, &plain)
}

fn push_vfs_entry_refs(
    src: &Repository,
    dst: &Repository,
    content: &mut BlobAccessor<'_>,
    entry: &VfsEntry,
) -> Result<()> {
    if let Some(xattrs_mac) = entry.xattrs {
        if !dst.blob_exists(ResourceType::XattrEntry, xattrs_mac) {
            let plain = src.get_blob(ResourceType::XattrEntry, xattrs_mac)?;
            content.put_blob(ResourceType::XattrEntry, xattrs_mac, &plain)?;
        }
    }
    let Some(object_mac) = entry.object_mac else {
        return Ok(());
    };
    if dst.blob_exists(ResourceType::Object, object_mac) {
        return Ok(());
    }
    let object_plain = src.get_blob(ResourceType::Object, object_mac)?;
    let object: Object = serde_json::from_slice(&object_plain).map_err(RepoError::from)?;
    for chunk in &object.chunks {
        if dst.blob_exists(ResourceType::Chunk, chunk.mac) {
            continue;
        }
        let chunk_plain = src.get_blob(ResourceType::Chunk, chunk.mac)?;
        content.put_blob(ResourceType::Chunk, chunk.mac, &chunk_plain)?;
    }
    content.put_blob(ResourceType::Object, object_mac, &object_plain)
}

fn push_xattr_tree(
    src: &Repository,
    dst: &Repository,
    content: &mut BlobAccessor<'_>,
    root: Mac,
) -> Result<()> {
    if dst.blob_exists(ResourceType::XattrNode, root) {
        return Ok(());
    }
    let plain = src.get_blob(ResourceType::XattrNode, root)?;
    let node: Node<String, Mac, Mac> = serde_json::from_slice(&plain).map_err(RepoError::from)?;
    match &node {
        Node::Leaf { values, .. } => {
            for xattrs_mac in values {
                if !dst.blob_exists(ResourceType::XattrEntry, *xattrs_mac) {
                    let entry_plain = src.get_blob(ResourceType::XattrEntry, *xattrs_mac)?;
                    content.put_blob(ResourceType::XattrEntry, *xattrs_mac, &entry_plain)?;
                }
            }
        }
        Node::Internal { children, .. } => {
            for child in children {
                push_xattr_tree(src, dst, content, *child)?;
            }
        }
    }
    content.put_blob(ResourceType::XattrNode, root, &plain)
}

/// Pushes a tree whose leaf values carry no further blob references
/// (error messages, content-type path lists).
fn push_opaque_tree<K, V>(
    src: &Repository,
    dst: &Repository,
    content: &mut BlobAccessor<'_>,
    root: Mac,
    node_type: ResourceType,
) -> Result<()>
where
    K: serde::Serialize + serde::de::DeserializeOwned,
    V: serde::Serialize + serde::de::DeserializeOwned,
{
    if dst.blob_exists(node_type, root) {
        return Ok(());
    }
    let plain = src.get_blob(node_type, root)?;
    let node: Node<K, V, Mac> = serde_json::from_slice(&plain).map_err(RepoError::from)?;
    if let Node::Internal { children, .. } = &node {
        for child in children {
            push_opaque_tree::<K, V>(src, dst, content, *child, node_type)?;
        }
    }
    content.put_blob(node_type, root, &plain)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backup::check::{check_run, CheckOptions};
    use crate::backup::repository::RepositoryConfig;
    use crate::backup::snapshot::{backup_run, BackupOptions};
    use crate::io::fs::FsImporter;
    use crate::storage::memory::MemoryBackend;

    fn shared_repo() -> Repository {
        // Same secret and same config (hence same `mac_key_salt`) so
        // both repositories derive an identical MAC key, the precondition
        // `sync_run` enforces.
        let storage = Box::new(MemoryBackend::new());
        let config = RepositoryConfig::new(None, None);
        Repository::create(storage, "shared-secret", config).unwrap()
    }

    fn clone_repo_config(repo: &Repository) -> Repository {
        let storage = Box::new(MemoryBackend::new());
        Repository::create(storage, "shared-secret", repo.config().clone()).unwrap()
    }

    #[test]
    fn direction_to_replicates_missing_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"hello dummy content").unwrap();

        let src = shared_repo();
        let dst = clone_repo_config(&src);
        let ctx = AppContext::new();
        let importer = FsImporter::new(tmp.path().to_path_buf());
        let snap = backup_run(&ctx, &src, &importer, BackupOptions::default()).unwrap();

        assert!(dst.list_snapshots().is_empty());
        let report = sync_run(&ctx, &src, &dst, SyncDirection::To).unwrap();
        assert_eq!(report.pushed_to_dst, vec![snap]);
        assert_eq!(dst.list_snapshots(), vec![snap]);

        let check = check_run(&ctx, &dst, &[snap], CheckOptions::default()).unwrap();
        assert!(check.is_ok(), "{:?}", check.failures);
    }

    #[test]
    fn rerun_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"hello dummy content").unwrap();

        let src = shared_repo();
        let dst = clone_repo_config(&src);
        let ctx = AppContext::new();
        let importer = FsImporter::new(tmp.path().to_path_buf());
        let snap = backup_run(&ctx, &src, &importer, BackupOptions::default()).unwrap();

        sync_run(&ctx, &src, &dst, SyncDirection::To).unwrap();
        let report = sync_run(&ctx, &src, &dst, SyncDirection::To).unwrap();
        assert!(report.pushed_to_dst.is_empty());
        let _ = snap;
    }

    #[test]
    fn direction_parsing_accepts_both_as_with() {
        assert_eq!(SyncDirection::parse("both").unwrap(), SyncDirection::With);
        assert_eq!(SyncDirection::parse("with").unwrap(), SyncDirection::With);
        assert!(SyncDirection::parse("sideways").is_err());
    }
}
