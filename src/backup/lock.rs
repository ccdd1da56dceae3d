//! Advisory lock manager (spec §4.10 "Lock manager", C10).
//!
//! Locks are modeled as data — a blob written through the same
//! stage-then-rename idiom every other storage write uses — rather than
//! an OS `flock()`, because the storage-backend abstraction must also
//! cover object stores that have no such primitive (spec §4.10: "no
//! teacher equivalent — the teacher uses OS `flock()` instead since it
//! has only local/NFS storage").

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{RepoError, Result};
use crate::mac::Mac;
use crate::resource::{ResourceType, CURRENT_VERSION};
use crate::storage::StorageBackend;

use super::data_blob::Codec;

/// How often a held lock's heartbeat rewrites it (spec §4.10).
pub const REFRESH_RATE: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockRecord {
    pub hostname: String,
    pub pid: u32,
    pub exclusive: bool,
    pub timestamp_secs: u64,
}

impl LockRecord {
    fn now() -> Self {
        Self {
            hostname: hostname(),
            pid: std::process::id(),
            exclusive: true,
            timestamp_secs: now_secs(),
        }
    }

    /// A lock is stale once it's older than `2 * REFRESH_RATE` (spec
    /// §4.10 `IsStale()`).
    pub fn is_stale(&self) -> bool {
        let age = now_secs().saturating_sub(self.timestamp_secs);
        age > 2 * REFRESH_RATE.as_secs()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub(crate) fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// A held lock. Dropping it does not itself release the lock (releasing
/// requires access to storage, which a `Drop` impl can't fallibly use);
/// callers must call `release` explicitly, matching spec §4.10's
/// "On release: stop heartbeat, delete the lock."
pub struct Lock {
    pub id: Mac,
    pub exclusive: bool,
}

/// Attempts to acquire an exclusive lock (spec §4.10 "Acquire
/// exclusive"). Honors `PLAKAR_LOCKLESS` by short-circuiting to a no-op
/// lock (spec §6 environment toggles; "testing only").
pub fn acquire_exclusive(
    storage: &dyn StorageBackend,
    codec: &Codec,
    lockless: bool,
) -> Result<Lock> {
    if lockless {
        return Ok(Lock {
            id: crate::mac::random_mac(),
            exclusive: true,
        });
    }

    let id = crate::mac::random_mac();
    let record = LockRecord::now();
    put_lock(storage, codec, id, &record)?;

    for other_id in storage.get_locks()? {
        if other_id == id {
            continue;
        }
        match get_lock(storage, codec, other_id) {
            Ok(other) => {
                if other.is_stale() {
                    storage.delete_lock(other_id)?;
                } else {
                    storage.delete_lock(id)?;
                    return Err(RepoError::Locked(format!(
                        "repository locked by pid {} on {}",
                        other.pid, other.hostname
                    )));
                }
            }
            Err(_) => {
                // Unreadable lock record; treat conservatively as
                // contended rather than silently stealing it.
                storage.delete_lock(id)?;
                return Err(RepoError::Locked(
                    "repository lock held but unreadable".into(),
                ));
            }
        }
    }

    Ok(Lock {
        id,
        exclusive: true,
    })
}

/// Rewrites the lock with a fresh timestamp; call on every
/// `REFRESH_RATE` tick while the lock is held (spec §4.10 "spawn a
/// heartbeat task that rewrites the lock every REFRESH_RATE").
pub fn heartbeat(storage: &dyn StorageBackend, codec: &Codec, lock: &Lock) -> Result<()> {
    let record = LockRecord {
        exclusive: lock.exclusive,
        ..LockRecord::now()
    };
    put_lock(storage, codec, lock.id, &record)
}

pub fn release(storage: &dyn StorageBackend, lock: Lock) -> Result<()> {
    storage.delete_lock(lock.id)
}

fn put_lock(storage: &dyn StorageBackend, codec: &Codec, id: Mac, record: &LockRecord) -> Result<()> {
    let plain = serde_json::to_vec(record)
        .map_err(|e| RepoError::Corrupted(format!("lock record encode failed: {e}")))?;
    let wrapped = codec.serialize(ResourceType::Lock, CURRENT_VERSION, &plain)?;
    storage.put_lock(id, &wrapped)
}

fn get_lock(storage: &dyn StorageBackend, codec: &Codec, id: Mac) -> Result<LockRecord> {
    let raw = storage.get_lock(id)?;
    let (resource_type, _version, plain) = codec.deserialize(&raw)?;
    if resource_type != ResourceType::Lock {
        return Err(RepoError::Corrupted("lock blob has wrong resource type".into()));
    }
    serde_json::from_slice(&plain).map_err(|e| RepoError::Corrupted(format!("malformed lock record: {e}")))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::memory::MemoryBackend;

    #[test]
    fn second_exclusive_acquire_is_rejected() {
        let storage = MemoryBackend::new();
        let key = [1u8; 32];
        let codec = Codec::new(&key);

        let lock1 = acquire_exclusive(&storage, &codec, false).unwrap();
        let err = acquire_exclusive(&storage, &codec, false).unwrap_err();
        assert!(matches!(err, RepoError::Locked(_)));

        release(&storage, lock1).unwrap();
        acquire_exclusive(&storage, &codec, false).unwrap();
    }

    #[test]
    fn stale_lock_is_collected() {
        let storage = MemoryBackend::new();
        let key = [2u8; 32];
        let codec = Codec::new(&key);

        let stale_id = crate::mac::random_mac();
        let stale_record = LockRecord {
            hostname: "ghost".into(),
            pid: 1,
            exclusive: true,
            timestamp_secs: 0,
        };
        put_lock(&storage, &codec, stale_id, &stale_record).unwrap();

        // A fresh acquire should collect the stale lock rather than fail.
        acquire_exclusive(&storage, &codec, false).unwrap();
        assert!(storage.get_lock(stale_id).is_err());
    }

    #[test]
    fn lockless_toggle_skips_coordination() {
        let storage = MemoryBackend::new();
        let key = [3u8; 32];
        let codec = Codec::new(&key);
        acquire_exclusive(&storage, &codec, true).unwrap();
        acquire_exclusive(&storage, &codec, true).unwrap();
        assert!(storage.get_locks().unwrap().is_empty());
    }
}
