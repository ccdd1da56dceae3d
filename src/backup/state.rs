//! State / aggregated index (spec §4.4 "State / aggregated index", C4).
//!
//! Replaces the teacher's per-snapshot `.fidx`/`.didx` flat index files
//! (grounded in `backup.rs`'s module doc comment, "Index files ... used
//! to reconstruct an original file") with the spec's delta-based
//! aggregated index: every commit appends a new STATE blob (a *delta*)
//! recording inserts and tombstones, and the logical view is the merge
//! of all non-tombstoned entries across every delta (REDESIGN — see
//! `SPEC_FULL.md` C4).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{RepoError, Result};
use crate::mac::Mac;
use crate::resource::ResourceType;
use crate::storage::StorageBackend;

use super::data_blob::Codec;

/// Where a blob lives inside a packfile (spec §3 "State").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub packfile_mac: Mac,
    pub offset: u64,
    pub length: u32,
    pub flags: u32,
}

/// A resource key in the aggregated index: its type plus its MAC.
pub type ResourceKey = (ResourceType, Mac);

/// One unit of state update (spec §4.4 "A delta is the unit of state
/// update"). Serialized and stored as a STATE blob keyed by `id`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Delta {
    pub inserts: Vec<(ResourceType, Mac, Location)>,
    pub tombstones: Vec<(ResourceType, Mac)>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.tombstones.is_empty()
    }
}

/// In-progress staged changes for one transaction (spec §4.4
/// `StartTransaction`/`PutIndexResource`/`DeleteStateResource`/
/// `CommitTransaction`).
pub struct Transaction {
    pub id: Mac,
    delta: Delta,
}

impl Transaction {
    pub fn put(&mut self, resource_type: ResourceType, mac: Mac, location: Location) {
        self.delta.inserts.push((resource_type, mac, location));
    }

    pub fn delete(&mut self, resource_type: ResourceType, mac: Mac) {
        self.delta.tombstones.push((resource_type, mac));
    }
}

/// The merged, in-memory view of every non-tombstoned entry across every
/// readable delta (spec §4.4 `Rebuild`).
#[derive(Default)]
pub struct AggregatedState {
    live: HashMap<ResourceKey, Location>,
    tombstoned: HashSet<ResourceKey>,
    /// Delta MACs folded into this view, in the order they were merged.
    delta_ids: Vec<Mac>,
}

impl AggregatedState {
    pub fn get(&self, resource_type: ResourceType, mac: Mac) -> Option<Location> {
        let key = (resource_type, mac);
        if self.tombstoned.contains(&key) {
            return None;
        }
        self.live.get(&key).copied()
    }

    pub fn contains(&self, resource_type: ResourceType, mac: Mac) -> bool {
        self.get(resource_type, mac).is_some()
    }

    pub fn is_tombstoned(&self, resource_type: ResourceType, mac: Mac) -> bool {
        self.tombstoned.contains(&(resource_type, mac))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceKey, &Location)> {
        self.live.iter()
    }

    pub fn delta_ids(&self) -> &[Mac] {
        &self.delta_ids
    }

    /// Applies a single insert to the live view, used both by `rebuild`
    /// and by callers that want freshly packed blobs visible before their
    /// owning delta is committed (spec §4.6: dedup is best-effort against
    /// the in-process view).
    pub fn insert_cache(&mut self, resource_type: ResourceType, mac: Mac, location: Location) {
        let key = (resource_type, mac);
        if !self.tombstoned.contains(&key) {
            self.live.insert(key, location);
        }
    }

    pub fn tombstone_cache(&mut self, resource_type: ResourceType, mac: Mac) {
        let key = (resource_type, mac);
        self.tombstoned.insert(key);
        self.live.remove(&key);
    }

    fn apply(&mut self, id: Mac, delta: &Delta) {
        for (resource_type, mac, location) in &delta.inserts {
            self.insert_cache(*resource_type, *mac, *location);
        }
        for (resource_type, mac) in &delta.tombstones {
            self.tombstone_cache(*resource_type, *mac);
        }
        self.delta_ids.push(id);
    }
}

/// Reads every delta off `storage`, decodes it through `codec`, and
/// merges them in MAC order into an `AggregatedState` (spec §4.4
/// `Rebuild`). Deltas that fail to decode are logged and skipped rather
/// than aborting the whole rebuild (spec §4.4: "Readers tolerate partial
/// delta sets").
pub fn rebuild(storage: &dyn StorageBackend, codec: &Codec) -> Result<AggregatedState> {
    let mut ids = storage.get_states()?;
    ids.sort();

    let mut state = AggregatedState::default();
    for id in ids {
        match storage.get_state(id) {
            Ok(raw) => match codec.deserialize(&raw) {
                Ok((resource_type, _version, plain)) => {
                    if resource_type != ResourceType::State {
                        log::warn!("state blob {id} has unexpected resource type {resource_type}, skipping");
                        continue;
                    }
                    match serde_json::from_slice::<Delta>(&plain) {
                        Ok(delta) => state.apply(id, &delta),
                        Err(e) => log::warn!("state delta {id} is malformed, skipping: {e}"),
                    }
                }
                Err(e) => log::warn!("state delta {id} failed to decode, skipping: {e}"),
            },
            Err(e) => log::warn!("state delta {id} unreadable, skipping: {e}"),
        }
    }
    Ok(state)
}

/// Starts a new transaction identified by `id` (spec §4.4
/// `StartTransaction`).
pub fn start_transaction(id: Mac) -> Transaction {
    Transaction {
        id,
        delta: Delta::default(),
    }
}

/// Serializes and writes the transaction's delta as a STATE blob keyed
/// by its id (spec §4.4 `CommitTransaction`: "Commit is atomic per
/// delta: the storage backend's `PutState` is the linearization point").
pub fn commit_transaction(
    storage: &dyn StorageBackend,
    codec: &Codec,
    tx: Transaction,
) -> Result<Mac> {
    let plain = serde_json::to_vec(&tx.delta)
        .map_err(|e| RepoError::Corrupted(format!("delta encode failed: {e}")))?;
    let wrapped = codec.serialize(
        ResourceType::State,
        crate::resource::CURRENT_VERSION,
        &plain,
    )?;
    storage.put_state(tx.id, &wrapped)?;
    Ok(tx.id)
}

/// Compacts every readable delta into a single merged delta, written
/// under a fresh random id, then deletes the old ones (spec §4.4
/// `MergeDeltas`: "compact into a single delta; older deltas deleted
/// after success").
pub fn merge_deltas(storage: &dyn StorageBackend, codec: &Codec) -> Result<Mac> {
    let state = rebuild(storage, codec)?;
    let merged = Delta {
        inserts: state
            .live
            .iter()
            .map(|((rt, mac), loc)| (*rt, *mac, *loc))
            .collect(),
        tombstones: Vec::new(),
    };
    let new_id = crate::mac::random_mac();
    let mut tx = start_transaction(new_id);
    tx.delta = merged;
    let id = commit_transaction(storage, codec, tx)?;

    for old_id in state.delta_ids() {
        if *old_id != id {
            storage.delete_state(*old_id)?;
        }
    }
    Ok(id)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::memory::MemoryBackend;

    #[test]
    fn rebuild_merges_inserts_and_tombstones() {
        let storage = MemoryBackend::new();
        let key = [1u8; 32];
        let codec = Codec::new(&key);

        let mac_a = crate::mac::compute_mac(&key, b"hello dummy");
        let mac_b = crate::mac::compute_mac(&key, b"hello foo");
        let loc_a = Location {
            packfile_mac: crate::mac::random_mac(),
            offset: 0,
            length: 10,
            flags: 0,
        };
        let loc_b = Location {
            packfile_mac: crate::mac::random_mac(),
            offset: 10,
            length: 20,
            flags: 0,
        };

        let mut tx1 = start_transaction(crate::mac::random_mac());
        tx1.put(ResourceType::Chunk, mac_a, loc_a);
        tx1.put(ResourceType::Chunk, mac_b, loc_b);
        commit_transaction(&storage, &codec, tx1).unwrap();

        let mut tx2 = start_transaction(crate::mac::random_mac());
        tx2.delete(ResourceType::Chunk, mac_a);
        commit_transaction(&storage, &codec, tx2).unwrap();

        let state = rebuild(&storage, &codec).unwrap();
        assert_eq!(state.get(ResourceType::Chunk, mac_a), None);
        assert_eq!(state.get(ResourceType::Chunk, mac_b), Some(loc_b));
    }

    #[test]
    fn merge_compacts_into_one_delta() {
        let storage = MemoryBackend::new();
        let key = [2u8; 32];
        let codec = Codec::new(&key);

        for i in 0..5u8 {
            let mac = crate::mac::compute_mac(&key, &[i]);
            let mut tx = start_transaction(crate::mac::random_mac());
            tx.put(
                ResourceType::Chunk,
                mac,
                Location {
                    packfile_mac: crate::mac::random_mac(),
                    offset: 0,
                    length: 1,
                    flags: 0,
                },
            );
            commit_transaction(&storage, &codec, tx).unwrap();
        }

        assert_eq!(storage.get_states().unwrap().len(), 5);
        merge_deltas(&storage, &codec).unwrap();
        assert_eq!(storage.get_states().unwrap().len(), 1);

        let state = rebuild(&storage, &codec).unwrap();
        assert_eq!(state.iter().count(), 5);
    }
}
