//! Retention pruning (spec §4.8 "Prune pipeline").
//!
//! Near-verbatim port of the teacher's `backup::prune` bucket-selection
//! algorithm (`mark_selections`): walk snapshots newest-first, and for
//! each retention class (last/daily/weekly/monthly/yearly) keep the
//! first snapshot seen in each not-yet-claimed time bucket, up to that
//! class's count. Ported onto `SnapshotHeader`/`Mac` instead of
//! `BackupInfo`/`PathBuf`, and grouped by `(name, category, environment)`
//! rather than directory structure, since that's this crate's grouping
//! key (spec §3 "Snapshot header"). The teacher's `remove_incomplete_snapshots`
//! step has no counterpart here: `backup_run` only ever commits a
//! snapshot's state delta after every blob it references has been
//! written (spec §4.8 step 6), so there is no equivalent of an
//! in-progress backup directory left behind by a crash to special-case.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, Local, Utc};

use crate::context::AppContext;
use crate::error::Result;
use crate::mac::Mac;

use super::repository::Repository;
use super::restore::find_snapshots;
use super::snapshot::SnapshotHeader;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PruneMark {
    Keep,
    Remove,
}

/// Claims up to `keep` snapshots for one retention class, skipping
/// buckets a higher-priority class already claimed (spec §4.8: classes
/// are applied in `last, daily, weekly, monthly, yearly` order and never
/// double-count a snapshot already kept by an earlier one).
fn mark_selections<F: Fn(DateTime<Local>, &SnapshotHeader) -> String>(
    mark: &mut HashMap<Mac, PruneMark>,
    list: &[(Mac, SnapshotHeader)],
    keep: usize,
    select_id: F,
) {
    let mut already_included = HashSet::new();
    for (mac, header) in list {
        if let Some(PruneMark::Keep) = mark.get(mac) {
            let local_time = header.timestamp.with_timezone(&Local);
            already_included.insert(select_id(local_time, header));
        }
    }

    let mut include_hash = HashSet::new();
    for (mac, header) in list {
        if mark.contains_key(mac) {
            continue;
        }
        let local_time = header.timestamp.with_timezone(&Local);
        let sel_id = select_id(local_time, header);

        if already_included.contains(&sel_id) {
            continue;
        }

        if !include_hash.contains(&sel_id) {
            if include_hash.len() >= keep {
                break;
            }
            include_hash.insert(sel_id);
            mark.insert(*mac, PruneMark::Keep);
        } else {
            mark.insert(*mac, PruneMark::Remove);
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PruneOptions {
    pub keep_last: Option<u64>,
    pub keep_daily: Option<u64>,
    pub keep_weekly: Option<u64>,
    pub keep_monthly: Option<u64>,
    pub keep_yearly: Option<u64>,
}

impl PruneOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keep_last(mut self, value: Option<u64>) -> Self {
        self.keep_last = value;
        self
    }

    pub fn keep_daily(mut self, value: Option<u64>) -> Self {
        self.keep_daily = value;
        self
    }

    pub fn keep_weekly(mut self, value: Option<u64>) -> Self {
        self.keep_weekly = value;
        self
    }

    pub fn keep_monthly(mut self, value: Option<u64>) -> Self {
        self.keep_monthly = value;
        self
    }

    pub fn keep_yearly(mut self, value: Option<u64>) -> Self {
        self.keep_yearly = value;
        self
    }
}

/// Decides keep/remove for one group of snapshots sharing a
/// `(name, category, environment)` triple, newest first.
fn compute_prune_info(
    mut list: Vec<(Mac, SnapshotHeader)>,
    options: &PruneOptions,
) -> Vec<(Mac, SnapshotHeader, bool)> {
    list.sort_by(|a, b| b.1.timestamp.cmp(&a.1.timestamp));

    let mut mark = HashMap::new();

    if let Some(keep_last) = options.keep_last {
        mark_selections(&mut mark, &list, keep_last as usize, |_local, header| {
            header.timestamp.to_rfc3339()
        });
    }
    if let Some(keep_daily) = options.keep_daily {
        mark_selections(&mut mark, &list, keep_daily as usize, |local, _header| {
            format!("{}/{}/{}", local.year(), local.month(), local.day())
        });
    }
    if let Some(keep_weekly) = options.keep_weekly {
        mark_selections(&mut mark, &list, keep_weekly as usize, |local, _header| {
            format!("{}/{}", local.iso_week().year(), local.iso_week().week())
        });
    }
    if let Some(keep_monthly) = options.keep_monthly {
        mark_selections(&mut mark, &list, keep_monthly as usize, |local, _header| {
            format!("{}/{}", local.year(), local.month())
        });
    }
    if let Some(keep_yearly) = options.keep_yearly {
        mark_selections(&mut mark, &list, keep_yearly as usize, |local, _header| {
            format!("{}", local.year())
        });
    }

    list.into_iter()
        .map(|(mac, header)| {
            let keep = matches!(mark.get(&mac), Some(PruneMark::Keep));
            (mac, header, keep)
        })
        .collect()
}

#[derive(Clone, Debug, Default)]
pub struct PruneReport {
    pub kept: Vec<Mac>,
    pub pruned: Vec<Mac>,
}

/// Runs retention pruning across every snapshot in the repository,
/// grouped by `(name, category, environment)` and evaluated
/// independently within each group (spec §4.8 "Prune pipeline").
/// Snapshots kept by no retention class at all are deleted via
/// `Repository::delete_snapshot`; their blobs are reclaimed later by
/// `maintenance::maintenance_run`, not here.
pub fn prune_run(ctx: &AppContext, repo: &Repository, options: &PruneOptions) -> Result<PruneReport> {
    let all = find_snapshots(repo, &super::restore::SnapshotFilter::default())?;

    let mut groups: HashMap<(String, String, String), Vec<(Mac, SnapshotHeader)>> = HashMap::new();
    for (mac, header) in all {
        let key = (header.name.clone(), header.category.clone(), header.environment.clone());
        groups.entry(key).or_default().push((mac, header));
    }

    let mut report = PruneReport::default();
    for (_key, list) in groups {
        ctx.cancel.check()?;
        for (mac, header, keep) in compute_prune_info(list, options) {
            if keep {
                report.kept.push(mac);
            } else {
                repo.delete_snapshot(mac)?;
                report.pruned.push(mac);
                log::info!("prune: removed snapshot {} ({mac})", header.name);
            }
        }
    }
    Ok(report)
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

    fn run_backup(repo: &Repository, ctx: &AppContext, name: &str) -> Mac {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"hello dummy").unwrap();
        let importer = FsImporter::new(tmp.path().to_path_buf());
        backup_run(
            ctx,
            repo,
            &importer,
            BackupOptions {
                name: name.to_string(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn keep_last_retains_most_recent_only() {
        let repo = build_repo();
        let ctx = AppContext::new();
        let mut snaps = Vec::new();
        for _ in 0..5 {
            snaps.push(run_backup(&repo, &ctx, "job"));
        }

        let options = PruneOptions::new().keep_last(Some(2));
        let report = prune_run(&ctx, &repo, &options).unwrap();

        assert_eq!(report.kept.len(), 2);
        assert_eq!(report.pruned.len(), 3);
        assert_eq!(repo.list_snapshots().len(), 2);
        let kept: HashSet<Mac> = report.kept.into_iter().collect();
        assert!(kept.contains(&snaps[3]));
        assert!(kept.contains(&snaps[4]));
    }

    #[test]
    fn distinct_job_groups_are_pruned_independently() {
        let repo = build_repo();
        let ctx = AppContext::new();
        for _ in 0..3 {
            run_backup(&repo, &ctx, "alpha");
        }
        for _ in 0..3 {
            run_backup(&repo, &ctx, "beta");
        }

        let options = PruneOptions::new().keep_last(Some(1));
        let report = prune_run(&ctx, &repo, &options).unwrap();

        assert_eq!(report.kept.len(), 2);
        assert_eq!(report.pruned.len(), 4);
    }

    #[test]
    fn no_retention_classes_prunes_everything() {
        let repo = build_repo();
        let ctx = AppContext::new();
        for _ in 0..3 {
            run_backup(&repo, &ctx, "job");
        }

        let report = prune_run(&ctx, &repo, &PruneOptions::new()).unwrap();
        assert_eq!(report.kept.len(), 0);
        assert_eq!(report.pruned.len(), 3);
        assert!(repo.list_snapshots().is_empty());
    }
}
