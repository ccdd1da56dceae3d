//! Generic B+tree over an abstract pointer type (spec §4.7 "B+tree on
//! blob store", C7; design notes in spec §9 "Generic B+tree over an
//! abstract pointer type").
//!
//! Two pointer implementations exist: `InMemoryStore` (pointer = `usize`
//! index into a growable vector, used while building a tree during
//! backup) and `MacStore` (pointer = `Mac`, each node persisted as an
//! immutable blob; used for read-only traversal of a tree already
//! written to a repository). There is no teacher equivalent of this
//! module in the retrieval pack (`backup.rs`'s doc comment only mentions
//! flat index files); the node/pointer split here is grounded in the
//! sibling `stratadb-labs-strata-core` example's page/node abstraction
//! for an ordered on-disk structure, adapted to content-addressed,
//! immutable nodes instead of mutable in-place pages.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{RepoError, Result};
use crate::mac::{compute_mac, Mac};
use crate::resource::ResourceType;

/// Default branching factor. Configurable per tree instance.
pub const DEFAULT_ORDER: usize = 64;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Node<K, V, P> {
    Leaf {
        keys: Vec<K>,
        values: Vec<V>,
        next: Option<P>,
    },
    Internal {
        keys: Vec<K>,
        children: Vec<P>,
    },
}

/// Abstracts over where nodes live. A read-only implementation (e.g. a
/// tree persisted over a repository that is not being actively built)
/// refuses `put`/`update` (spec §4.7: "the tree is read-only; writes
/// would create new MACs and must be done during backup/sync via the
/// packer").
pub trait NodeStore<K, V> {
    type Ptr: Clone + Eq + std::fmt::Debug;

    fn get(&self, ptr: &Self::Ptr) -> Result<Node<K, V, Self::Ptr>>;
    fn put(&mut self, node: Node<K, V, Self::Ptr>) -> Result<Self::Ptr>;
}

/// In-memory pointer store used while constructing a tree (e.g. during
/// the backup pipeline, before the tree is sealed and its root pushed
/// through the packer).
pub struct InMemoryStore<K, V> {
    nodes: Vec<Node<K, V, usize>>,
}

impl<K, V> InMemoryStore<K, V> {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }
}

impl<K, V> Default for InMemoryStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone, V: Clone> NodeStore<K, V> for InMemoryStore<K, V> {
    type Ptr = usize;

    fn get(&self, ptr: &usize) -> Result<Node<K, V, usize>> {
        self.nodes
            .get(*ptr)
            .cloned()
            .ok_or_else(|| RepoError::NotFound(format!("in-memory btree node {ptr}")))
    }

    fn put(&mut self, node: Node<K, V, usize>) -> Result<usize> {
        self.nodes.push(node);
        Ok(self.nodes.len() - 1)
    }
}

/// Backing blob access a `MacStore` needs: fetch a node's plaintext by
/// MAC (already run through the blob codec, same contract as
/// `Repository::get_blob`), and persist one (the implementor wraps it
/// through its own packer, same contract as `Repository::put_blob`/
/// `PackerManager::put` — dedup and encoding happen there, not here).
/// `put_blob` is only exercised while a tree is being constructed
/// (backup/sync pipelines); a tree opened purely for traversal never
/// calls it.
pub trait BlobAccess {
    fn get_blob(&self, resource_type: ResourceType, mac: Mac) -> Result<Vec<u8>>;
    fn put_blob(&mut self, resource_type: ResourceType, mac: Mac, plaintext: &[u8]) -> Result<()>;
}

/// Pointer store where every node is a blob, addressed by MAC (spec
/// §4.7: nodes are "blob of the appropriate resource type"). Read-only
/// by default; `allow_write` must be explicitly set to back a tree still
/// under construction.
pub struct MacStore<'a, A: BlobAccess> {
    access: &'a mut A,
    mac_key: &'a [u8; 32],
    node_type: ResourceType,
    allow_write: bool,
}

impl<'a, A: BlobAccess> MacStore<'a, A> {
    pub fn read_only(access: &'a mut A, mac_key: &'a [u8; 32], node_type: ResourceType) -> Self {
        Self {
            access,
            mac_key,
            node_type,
            allow_write: false,
        }
    }

    pub fn read_write(access: &'a mut A, mac_key: &'a [u8; 32], node_type: ResourceType) -> Self {
        Self {
            access,
            mac_key,
            node_type,
            allow_write: true,
        }
    }
}

impl<'a, A, K, V> NodeStore<K, V> for MacStore<'a, A>
where
    A: BlobAccess,
    K: Serialize + DeserializeOwned + Clone,
    V: Serialize + DeserializeOwned + Clone,
{
    type Ptr = Mac;

    fn get(&self, ptr: &Mac) -> Result<Node<K, V, Mac>> {
        let plain = self.access.get_blob(self.node_type, *ptr)?;
        serde_json::from_slice(&plain)
            .map_err(|e| RepoError::Corrupted(format!("malformed btree node: {e}")))
    }

    fn put(&mut self, node: Node<K, V, Mac>) -> Result<Mac> {
        if !self.allow_write {
            return Err(RepoError::Policy(
                "btree backed by MacStore is read-only".into(),
            ));
        }
        let plain = serde_json::to_vec(&node)
            .map_err(|e| RepoError::Corrupted(format!("btree node encode failed: {e}")))?;
        let mac = compute_mac(self.mac_key, &plain);
        self.access.put_blob(self.node_type, mac, &plain)?;
        Ok(mac)
    }
}

/// Result of inserting into a subtree rooted at some pointer: either the
/// node was rewritten in place (new pointer, same position in the
/// parent) or it split, promoting a median key and a new right sibling.
enum InsertResult<K, P> {
    Updated(P),
    Split { median: K, left: P, right: P },
}

/// The generic ordered map itself (spec §4.7 operations: `Find`,
/// `Insert`, `Update`, `ScanFrom`, `IterDFS`, `Close`).
pub struct BTree<K, V, S: NodeStore<K, V>> {
    store: S,
    root: Option<S::Ptr>,
    order: usize,
    _marker: std::marker::PhantomData<(K, V)>,
}

impl<K, V, S> BTree<K, V, S>
where
    K: Ord + Clone,
    V: Clone,
    S: NodeStore<K, V>,
{
    pub fn new(store: S, order: usize) -> Self {
        Self {
            store,
            root: None,
            order: order.max(2),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn open(store: S, root: S::Ptr, order: usize) -> Self {
        Self {
            store,
            root: Some(root),
            order: order.max(2),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn root(&self) -> Option<&S::Ptr> {
        self.root.as_ref()
    }

    pub fn find(&self, key: &K) -> Result<Option<V>> {
        let Some(root) = &self.root else {
            return Ok(None);
        };
        let mut ptr = root.clone();
        loop {
            match self.store.get(&ptr)? {
                Node::Leaf { keys, values, .. } => {
                    return Ok(keys
                        .iter()
                        .position(|k| k == key)
                        .map(|i| values[i].clone()));
                }
                Node::Internal { keys, children } => {
                    let idx = child_index(&keys, key);
                    ptr = children[idx].clone();
                }
            }
        }
    }

    /// Scans all entries with key >= `from`, in ascending order, by
    /// locating the starting leaf and following `next` pointers (spec
    /// §4.7 `ScanFrom`).
    pub fn scan_from(&self, from: &K) -> Result<Vec<(K, V)>> {
        let Some(root) = &self.root else {
            return Ok(Vec::new());
        };
        let mut ptr = root.clone();
        let mut leaf = loop {
            match self.store.get(&ptr)? {
                Node::Leaf { keys, values, next } => break (keys, values, next),
                Node::Internal { keys, children } => {
                    let idx = child_index(&keys, from);
                    ptr = children[idx].clone();
                }
            }
        };
        let mut out = Vec::new();
        loop {
            let (keys, values, next) = leaf;
            for (k, v) in keys.into_iter().zip(values.into_iter()) {
                if &k >= from {
                    out.push((k, v));
                }
            }
            match next {
                Some(next_ptr) => match self.store.get(&next_ptr)? {
                    Node::Leaf { keys, values, next } => leaf = (keys, values, next),
                    Node::Internal { .. } => {
                        return Err(RepoError::Corrupted(
                            "leaf next pointer referenced an internal node".into(),
                        ))
                    }
                },
                None => break,
            }
        }
        Ok(out)
    }

    /// Depth-first enumeration of every `(key, value)` pair in order
    /// (spec §4.7 `IterDFS`).
    pub fn iter_dfs(&self) -> Result<Vec<(K, V)>> {
        let Some(root) = &self.root else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        self.collect_dfs(root, &mut out)?;
        Ok(out)
    }

    fn collect_dfs(&self, ptr: &S::Ptr, out: &mut Vec<(K, V)>) -> Result<()> {
        match self.store.get(ptr)? {
            Node::Leaf { keys, values, .. } => {
                out.extend(keys.into_iter().zip(values.into_iter()));
                Ok(())
            }
            Node::Internal { children, .. } => {
                for child in &children {
                    self.collect_dfs(child, out)?;
                }
                Ok(())
            }
        }
    }

    /// Inserts or replaces the value for `key`. Only valid for a tree
    /// backed by a writable store (spec §4.7: persisted trees are
    /// read-only outside backup/sync).
    ///
    /// Nodes are immutable once placed (spec §9 "avoid cycles via
    /// content-addressing"): updating a leaf never mutates it in place,
    /// it writes a fresh node and the change propagates back up to the
    /// root, which is why every level on the path to `key` gets a new
    /// pointer even when no split occurs.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        let Some(root) = self.root.clone() else {
            let leaf = Node::Leaf {
                keys: vec![key],
                values: vec![value],
                next: None,
            };
            self.root = Some(self.store.put(leaf)?);
            return Ok(());
        };

        match self.insert_rec(&root, key, value)? {
            InsertResult::Updated(new_root) => self.root = Some(new_root),
            InsertResult::Split {
                median,
                left,
                right,
            } => {
                let new_root = Node::Internal {
                    keys: vec![median],
                    children: vec![left, right],
                };
                self.root = Some(self.store.put(new_root)?);
            }
        }
        Ok(())
    }

    fn insert_rec(&mut self, ptr: &S::Ptr, key: K, value: V) -> Result<InsertResult<K, S::Ptr>> {
        match self.store.get(ptr)? {
            Node::Leaf {
                mut keys,
                mut values,
                next,
            } => {
                match keys.binary_search(&key) {
                    Ok(i) => values[i] = value,
                    Err(i) => {
                        keys.insert(i, key);
                        values.insert(i, value);
                    }
                }
                if keys.len() <= self.order {
                    let updated = Node::Leaf { keys, values, next };
                    let new_ptr = self.store.put(updated)?;
                    return Ok(InsertResult::Updated(new_ptr));
                }
                let split_at = keys.len() / 2;
                let right_keys = keys.split_off(split_at);
                let right_values = values.split_off(split_at);
                let median = right_keys[0].clone();

                let right_node = Node::Leaf {
                    keys: right_keys,
                    values: right_values,
                    next,
                };
                let right_ptr = self.store.put(right_node)?;
                let left_node = Node::Leaf {
                    keys,
                    values,
                    next: Some(right_ptr.clone()),
                };
                let left_ptr = self.store.put(left_node)?;
                Ok(InsertResult::Split {
                    median,
                    left: left_ptr,
                    right: right_ptr,
                })
            }
            Node::Internal {
                mut keys,
                mut children,
            } => {
                let idx = child_index(&keys, &key);
                match self.insert_rec(&children[idx], key, value)? {
                    InsertResult::Updated(new_child) => {
                        children[idx] = new_child;
                    }
                    InsertResult::Split {
                        median,
                        left,
                        right,
                    } => {
                        children[idx] = left;
                        keys.insert(idx, median);
                        children.insert(idx + 1, right);
                    }
                }
                if keys.len() <= self.order {
                    let updated = Node::Internal { keys, children };
                    let new_ptr = self.store.put(updated)?;
                    return Ok(InsertResult::Updated(new_ptr));
                }
                let split_at = keys.len() / 2;
                let median = keys[split_at].clone();
                let right_keys = keys.split_off(split_at + 1);
                let right_children = children.split_off(split_at + 1);
                keys.pop(); // remove the promoted median from the left node

                let right_node = Node::Internal {
                    keys: right_keys,
                    children: right_children,
                };
                let right_ptr = self.store.put(right_node)?;
                let left_node = Node::Internal { keys, children };
                let left_ptr = self.store.put(left_node)?;
                Ok(InsertResult::Split {
                    median,
                    left: left_ptr,
                    right: right_ptr,
                })
            }
        }
    }

    /// Writes back any dirty nodes and returns the current root pointer
    /// (spec §4.7 `Close`). Content-addressed stores have nothing to
    /// flush beyond what `insert` already wrote; this exists for parity
    /// with an in-place store and to hand back the root for the caller
    /// to record (e.g. in the snapshot header's `vfs.root`).
    pub fn close(self) -> Option<S::Ptr> {
        self.root
    }
}

fn child_index<K: Ord>(keys: &[K], key: &K) -> usize {
    match keys.binary_search(key) {
        Ok(i) => i + 1,
        Err(i) => i,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_and_find_in_memory() {
        let store = InMemoryStore::new();
        let mut tree: BTree<String, u64, _> = BTree::new(store, 4);
        for i in 0..50u64 {
            tree.insert(format!("{i:04}"), i).unwrap();
        }
        for i in 0..50u64 {
            assert_eq!(tree.find(&format!("{i:04}")).unwrap(), Some(i));
        }
        assert_eq!(tree.find(&"nope".to_string()).unwrap(), None);
    }

    #[test]
    fn scan_from_and_dfs_are_ordered() {
        let store = InMemoryStore::new();
        let mut tree: BTree<u32, u32, _> = BTree::new(store, 4);
        let mut keys: Vec<u32> = (0..100).collect();
        // insert out of order to exercise splits from both directions
        keys.sort_by_key(|k| (k * 37) % 101);
        for k in &keys {
            tree.insert(*k, *k * 10).unwrap();
        }

        let dfs = tree.iter_dfs().unwrap();
        let dfs_keys: Vec<u32> = dfs.iter().map(|(k, _)| *k).collect();
        let mut sorted: Vec<u32> = (0..100).collect();
        sorted.sort();
        assert_eq!(dfs_keys, sorted);

        let scanned = tree.scan_from(&50).unwrap();
        assert_eq!(scanned.first().map(|(k, _)| *k), Some(50));
        assert_eq!(scanned.len(), 50);
    }
}
