//! Snapshot header and backup pipeline (spec §4.8 "Snapshot / VFS", C8).
//!
//! The teacher names this layer (`backup.rs`'s module doc comment:
//! "creates and restores backups ... organized into groups") but the
//! retrieval pack doesn't carry its manifest/backup-writer source, so the
//! pipeline shape here is built from the spec's own numbered steps,
//! wired onto the B+tree/packer/repository machinery the rest of this
//! crate already provides.

use std::io::Read as _;

use serde::{Deserialize, Serialize};

use crate::context::AppContext;
use crate::error::Result;
use crate::mac::{compute_mac, Mac};
use crate::resource::ResourceType;

use super::btree::{BlobAccess, BTree, MacStore, DEFAULT_ORDER};
use super::chunker;
use super::repository::{BlobAccessor, Repository};
use super::vfs::{byte_distribution, shannon_entropy, sniff_content_type, EntryType, Object, ObjectChunk, VfsEntry};
use crate::io::{Importer, ScanRecord};

/// `importer{type,origin,directory}` (spec §3 "Snapshot header").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImporterHeader {
    #[serde(rename = "type")]
    pub importer_type: String,
    pub origin: String,
    pub directory: String,
}

/// `context{hostname,os,arch,...}` (spec §3 "Snapshot header").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextInfo {
    pub hostname: String,
    pub os: String,
    pub arch: String,
}

impl ContextInfo {
    fn current() -> Self {
        Self {
            hostname: super::lock::hostname(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// `sources[].vfs{root,xattrs,errors}` (spec §3 "Snapshot header").
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VfsRoots {
    pub root: Option<Mac>,
    pub xattrs: Option<Mac>,
    pub errors: Option<Mac>,
}

/// Per-source aggregate counts, used for quick `info`/`ls` reporting
/// without walking the VFS tree.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Summary {
    pub directory_count: u64,
    pub file_count: u64,
    pub symlink_count: u64,
    pub error_count: u64,
    pub total_size: u64,
}

/// One entry of `sources[]` (spec §3 "Snapshot header"). `indexes` carries
/// secondary B+tree roots keyed by name, e.g. `"contenttype"`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceHeader {
    pub vfs: VfsRoots,
    pub indexes: Vec<(String, Mac)>,
    pub summary: Summary,
}

/// The SNAPSHOT blob body (spec §3 "Snapshot header", verbatim field
/// list). `identifier` is a random id allocated once at the start of the
/// backup run — a stable identity independent of the header's content
/// address, which is the MAC the repository actually indexes it under
/// (spec §3: "Stored as a SNAPSHOT blob whose MAC is the snapshot id").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub identifier: Mac,
    pub index_id: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub duration_ms: u64,
    pub name: String,
    pub category: String,
    pub environment: String,
    pub perimeter: String,
    pub job: String,
    pub tags: Vec<String>,
    pub identity: Option<String>,
    pub importer: ImporterHeader,
    pub context: ContextInfo,
    pub sources: Vec<SourceHeader>,
}

/// Caller-supplied identity/grouping fields for a backup run (spec §3
/// "Snapshot header": `name, category, environment, perimeter, job,
/// tags[]`), everything else is derived during the walk.
#[derive(Clone, Debug, Default)]
pub struct BackupOptions {
    pub name: String,
    pub category: String,
    pub environment: String,
    pub perimeter: String,
    pub job: String,
    pub tags: Vec<String>,
    pub identity: Option<String>,
    /// Ed25519 seed used to sign the header, producing a `SIGNATURE`
    /// blob alongside it (spec §4.8 step 7, optional).
    pub signing_seed: Option<[u8; 32]>,
}

/// Runs the backup pipeline end to end (spec §4.8 "Backup pipeline",
/// steps 1-7) and returns the committed snapshot's MAC.
pub fn backup_run(
    ctx: &AppContext,
    repo: &Repository,
    importer: &dyn Importer,
    opts: BackupOptions,
) -> Result<Mac> {
    let started = std::time::Instant::now();
    let signing_seed = opts.signing_seed;
    let info = importer.info();
    let (records, scan_errors) = importer.scan()?;

    let packer = repo.packer();
    let mac_key = *repo.mac_key();
    let mut content = BlobAccessor::new(repo, &packer);

    let mut vfs_store_access = BlobAccessor::new(repo, &packer);
    let mut vfs_tree: BTree<String, VfsEntry, MacStore<'_, BlobAccessor<'_>>> = BTree::new(
        MacStore::read_write(&mut vfs_store_access, &mac_key, ResourceType::VfsNode),
        DEFAULT_ORDER,
    );

    let mut xattr_store_access = BlobAccessor::new(repo, &packer);
    let mut xattr_tree: BTree<String, Mac, MacStore<'_, BlobAccessor<'_>>> = BTree::new(
        MacStore::read_write(&mut xattr_store_access, &mac_key, ResourceType::XattrNode),
        DEFAULT_ORDER,
    );

    let mut error_store_access = BlobAccessor::new(repo, &packer);
    let mut error_tree: BTree<String, String, MacStore<'_, BlobAccessor<'_>>> = BTree::new(
        MacStore::read_write(&mut error_store_access, &mac_key, ResourceType::ErrorNode),
        DEFAULT_ORDER,
    );

    let mut content_type_index: std::collections::BTreeMap<String, Vec<String>> =
        std::collections::BTreeMap::new();

    let mut summary = Summary::default();
    let mut any_xattr = false;
    let mut any_error = false;

    for record in &records {
        ctx.cancel.check()?;
        match record {
            ScanRecord::Directory {
                path,
                fileinfo,
                xattr_names,
            } => {
                summary.directory_count += 1;
                let xattrs_mac = pack_xattrs(importer, &mac_key, &mut content, path, xattr_names)?;
                if let Some(mac) = xattrs_mac {
                    any_xattr = true;
                    xattr_tree.insert(path.clone(), mac)?;
                }
                vfs_tree.insert(
                    path.clone(),
                    VfsEntry {
                        fileinfo: fileinfo.clone(),
                        entry_type: EntryType::Directory,
                        symlink_target: None,
                        object_mac: None,
                        xattrs: xattrs_mac,
                        classifications: Vec::new(),
                        custom_metadata: Vec::new(),
                    },
                )?;
            }
            ScanRecord::Symlink {
                path,
                fileinfo,
                target,
            } => {
                vfs_tree.insert(
                    path.clone(),
                    VfsEntry {
                        fileinfo: fileinfo.clone(),
                        entry_type: EntryType::Symlink,
                        symlink_target: Some(target.clone()),
                        object_mac: None,
                        xattrs: None,
                        classifications: Vec::new(),
                        custom_metadata: Vec::new(),
                    },
                )?;
                summary.symlink_count += 1;
            }
            ScanRecord::Regular {
                path,
                fileinfo,
                xattr_names,
            } => {
                let mut data = Vec::with_capacity(fileinfo.size as usize);
                importer.read(path)?.read_to_end(&mut data)?;

                let (object_mac, content_type) =
                    pack_object(&mac_key, &repo.config().chunking, &mut content, &data)?;
                if let Some(ct) = &content_type {
                    content_type_index.entry(ct.clone()).or_default().push(path.clone());
                }

                let xattrs_mac = pack_xattrs(importer, &mac_key, &mut content, path, xattr_names)?;
                if let Some(mac) = xattrs_mac {
                    any_xattr = true;
                    xattr_tree.insert(path.clone(), mac)?;
                }

                vfs_tree.insert(
                    path.clone(),
                    VfsEntry {
                        fileinfo: fileinfo.clone(),
                        entry_type: EntryType::Regular,
                        symlink_target: None,
                        object_mac: Some(object_mac),
                        xattrs: xattrs_mac,
                        classifications: Vec::new(),
                        custom_metadata: Vec::new(),
                    },
                )?;
                summary.file_count += 1;
                summary.total_size += fileinfo.size;
            }
        }
    }

    for err in &scan_errors {
        any_error = true;
        summary.error_count += 1;
        error_tree.insert(err.path.clone(), err.message.clone())?;
    }

    let vfs_root = vfs_tree.close();
    let xattr_root = if any_xattr { xattr_tree.close() } else { None };
    let error_root = if any_error { error_tree.close() } else { None };

    let mut indexes = Vec::new();
    if !content_type_index.is_empty() {
        let mut ct_store_access = BlobAccessor::new(repo, &packer);
        let mut ct_tree: BTree<String, Vec<String>, MacStore<'_, BlobAccessor<'_>>> = BTree::new(
            MacStore::read_write(&mut ct_store_access, &mac_key, ResourceType::BtreeNode),
            DEFAULT_ORDER,
        );
        for (content_type, paths) in content_type_index {
            ct_tree.insert(content_type, paths)?;
        }
        if let Some(root) = ct_tree.close() {
            indexes.push(("contenttype".to_string(), root));
        }
    }

    let source = SourceHeader {
        vfs: VfsRoots {
            root: vfs_root,
            xattrs: xattr_root,
            errors: error_root,
        },
        indexes,
        summary,
    };

    let header = SnapshotHeader {
        identifier: crate::mac::random_mac(),
        index_id: repo.list_snapshots().len() as u64 + 1,
        timestamp: chrono::Utc::now(),
        duration_ms: started.elapsed().as_millis() as u64,
        name: opts.name,
        category: opts.category,
        environment: opts.environment,
        perimeter: opts.perimeter,
        job: opts.job,
        tags: opts.tags,
        identity: opts.identity,
        importer: ImporterHeader {
            importer_type: info.importer_type,
            origin: info.origin,
            directory: info.root,
        },
        context: ContextInfo::current(),
        sources: vec![source],
    };

    let plain = serde_json::to_vec(&header).map_err(crate::error::RepoError::from)?;
    let snapshot_mac = compute_mac(&mac_key, &plain);
    content.put_blob(ResourceType::Snapshot, snapshot_mac, &plain)?;

    if let Some(seed) = signing_seed {
        // Keyed by the snapshot's own MAC rather than the signature
        // bytes' content hash, so the check pipeline can find "the
        // signature for snapshot X" without already knowing it exists.
        let sig_plain = super::signing::sign(&seed, &plain)?;
        content.put_blob(ResourceType::Signature, snapshot_mac, &sig_plain)?;
    }

    packer.wait()?;
    repo.commit_pending(snapshot_mac)?;

    log::info!(
        "backup {} committed as {snapshot_mac} ({} files, {} dirs, {} errors)",
        header.name,
        header.sources[0].summary.file_count,
        header.sources[0].summary.directory_count,
        header.sources[0].summary.error_count,
    );

    Ok(snapshot_mac)
}

/// Splits `data` through the chunker, dedups and packs each chunk, and
/// builds+packs the owning `Object` blob (spec §4.8 steps 2-3).
fn pack_object(
    mac_key: &[u8; 32],
    chunking: &chunker::ChunkerConfig,
    content: &mut BlobAccessor<'_>,
    data: &[u8],
) -> Result<(Mac, Option<String>)> {
    let ranges = chunker::chunk(data, chunking)?;
    let mut chunks = Vec::with_capacity(ranges.len());
    for range in ranges {
        let slice = &data[range];
        let mac = compute_mac(mac_key, slice);
        content.put_blob(ResourceType::Chunk, mac, slice)?;
        let dist = byte_distribution(slice);
        chunks.push(ObjectChunk {
            mac,
            length: slice.len() as u32,
            entropy: shannon_entropy(&dist, slice.len()),
            distribution: dist.to_vec(),
        });
    }

    let dist = byte_distribution(data);
    let content_type = sniff_content_type(&data[..data.len().min(512)]).map(|s| s.to_string());
    let object = Object {
        content_type: content_type.clone(),
        entropy: shannon_entropy(&dist, data.len()),
        distribution: dist.to_vec(),
        tags: Vec::new(),
        chunks,
    };

    let plain = serde_json::to_vec(&object).map_err(crate::error::RepoError::from)?;
    let object_mac = compute_mac(mac_key, &plain);
    content.put_blob(ResourceType::Object, object_mac, &plain)?;
    Ok((object_mac, content_type))
}

/// Reads every named extended attribute via the importer, bundles them
/// into one `XATTR_ENTRY` blob, and returns its MAC (spec §4.8 "similarly
/// for xattrs"). Returns `None` when there are no attributes to carry.
fn pack_xattrs(
    importer: &dyn Importer,
    mac_key: &[u8; 32],
    content: &mut BlobAccessor<'_>,
    path: &str,
    names: &[String],
) -> Result<Option<Mac>> {
    if names.is_empty() {
        return Ok(None);
    }
    let mut bundle = Vec::with_capacity(names.len());
    for name in names {
        let value = importer.read_xattr(path, name)?;
        bundle.push((name.clone(), value));
    }
    let plain = serde_json::to_vec(&bundle).map_err(crate::error::RepoError::from)?;
    let mac = compute_mac(mac_key, &plain);
    content.put_blob(ResourceType::XattrEntry, mac, &plain)?;
    Ok(Some(mac))
}
