//! Store - the layered in-memory key-value state.
//!
//! The store holds a confirmed base layer (server patches) and an ordered
//! list of pending local mutations. Reads resolve a key against the newest
//! pending overlay first and fall back to the base layer.
//!
//! Both layers sit behind `Arc`s. Taking a [`Snapshot`] is O(1), and the
//! next write to the store copies only the layer it touches while a
//! snapshot of it is still alive.

use crate::{
    entry::{KvUpdate, MutationStatus, PendingMutation},
    Entry, Key, LocalMutationId, Mutation, Patch,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Read access shared by the live store and its snapshots.
pub trait KvRead {
    /// Effective value of `key`, or `None` if absent or deleted.
    fn get(&self, key: &str) -> Option<&Value>;

    /// Check if `key` has a visible value.
    fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Every key with a visible value, sorted.
    fn all_keys(&self) -> BTreeSet<Key>;
}

fn lookup<'a>(
    base: &'a BTreeMap<Key, Entry>,
    pending: &'a [PendingMutation],
    key: &str,
) -> Option<&'a Value> {
    for mutation in pending.iter().rev() {
        if let Some(update) = mutation.kv_updates.get(key) {
            return update.value();
        }
    }
    base.get(key).map(|entry| &entry.value)
}

fn visible_keys(base: &BTreeMap<Key, Entry>, pending: &[PendingMutation]) -> BTreeSet<Key> {
    let mut keys: BTreeSet<Key> = base.keys().cloned().collect();
    for mutation in pending {
        keys.extend(mutation.kv_updates.keys().cloned());
    }
    keys.retain(|key| lookup(base, pending, key).is_some());
    keys
}

/// The main store holding all state.
#[derive(Debug, Clone, Default)]
pub struct Store {
    /// Confirmed entries by key
    base: Arc<BTreeMap<Key, Entry>>,
    /// Local mutations not yet confirmed, oldest first
    pending: Arc<Vec<PendingMutation>>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take an immutable view of the current state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            base: Arc::clone(&self.base),
            pending: Arc::clone(&self.pending),
        }
    }

    /// Get the confirmed entry for a key, ignoring pending overlays.
    pub fn entry(&self, key: &str) -> Option<&Entry> {
        self.base.get(key)
    }

    /// Count of confirmed entries.
    pub fn base_len(&self) -> usize {
        self.base.len()
    }

    /// Get all pending mutations, oldest first.
    pub fn pending(&self) -> &[PendingMutation] {
        &self.pending
    }

    /// Get count of pending mutations.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Append a locally applied mutation on top of every other overlay.
    ///
    /// Returns the keys whose effective value may have changed.
    pub fn push_pending(&mut self, mutation: PendingMutation) -> BTreeSet<Key> {
        let changed = mutation.kv_updates.keys().cloned().collect();
        Arc::make_mut(&mut self.pending).push(mutation);
        changed
    }

    /// Apply server patches to the base layer.
    ///
    /// Pending overlays are left untouched. Re-applying the same patches is
    /// observably a no-op.
    pub fn apply_patches(&mut self, patches: &[Patch]) -> BTreeSet<Key> {
        let mut changed = BTreeSet::new();
        if patches.is_empty() {
            return changed;
        }

        let base = Arc::make_mut(&mut self.base);
        for patch in patches {
            match patch {
                Patch::Set {
                    key,
                    value,
                    mutation_id,
                } => {
                    base.insert(key.clone(), Entry::new(value.clone(), *mutation_id));
                }
                Patch::Del { key, .. } => {
                    base.remove(key);
                }
            }
            changed.insert(patch.key().clone());
        }
        changed
    }

    /// Drop pending mutations whose local id is in `ids`.
    ///
    /// Returns the keys the removed overlays covered.
    pub fn remove_completed_local_mutations(&mut self, ids: &[LocalMutationId]) -> BTreeSet<Key> {
        let mut changed = BTreeSet::new();
        if ids.is_empty() || !self.pending.iter().any(|p| ids.contains(&p.id())) {
            return changed;
        }

        Arc::make_mut(&mut self.pending).retain(|p| {
            if ids.contains(&p.id()) {
                changed.extend(p.kv_updates.keys().cloned());
                false
            } else {
                true
            }
        });
        changed
    }

    /// Apply server patches and drop the local mutations they confirm.
    ///
    /// Both steps happen under one `&mut` borrow, so no snapshot can observe
    /// the patches without the matching cleanup.
    pub fn apply_server_update(
        &mut self,
        patches: &[Patch],
        completed: &[LocalMutationId],
    ) -> BTreeSet<Key> {
        let mut changed = self.apply_patches(patches);
        changed.extend(self.remove_completed_local_mutations(completed));
        changed
    }

    /// Mark every waiting mutation as pending and return them for a push.
    pub fn take_waiting(&mut self) -> Vec<Mutation> {
        if !self.pending.iter().any(PendingMutation::is_waiting) {
            return Vec::new();
        }

        Arc::make_mut(&mut self.pending)
            .iter_mut()
            .filter(|p| p.is_waiting())
            .map(|p| {
                p.status = MutationStatus::Pending;
                p.mutation.clone()
            })
            .collect()
    }

    /// Set the status of the given pending mutations.
    pub fn mark(&mut self, ids: &[LocalMutationId], status: MutationStatus) {
        for pending in Arc::make_mut(&mut self.pending).iter_mut() {
            if ids.contains(&pending.id()) {
                pending.status = status;
            }
        }
    }

    /// Local ids of mutations already handed to a push.
    pub fn in_flight_ids(&self) -> Vec<LocalMutationId> {
        self.pending
            .iter()
            .filter(|p| !p.is_waiting())
            .map(PendingMutation::id)
            .collect()
    }
}

impl KvRead for Store {
    fn get(&self, key: &str) -> Option<&Value> {
        lookup(&self.base, &self.pending, key)
    }

    fn all_keys(&self) -> BTreeSet<Key> {
        visible_keys(&self.base, &self.pending)
    }
}

/// An immutable point-in-time view of a [`Store`].
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    base: Arc<BTreeMap<Key, Entry>>,
    pending: Arc<Vec<PendingMutation>>,
}

impl Snapshot {
    /// Resolve `key` with transaction-local overrides consulted first.
    pub fn get_with<'a>(
        &'a self,
        overrides: &'a BTreeMap<Key, KvUpdate>,
        key: &str,
    ) -> Option<&'a Value> {
        match overrides.get(key) {
            Some(update) => update.value(),
            None => self.get(key),
        }
    }

    /// Visible keys with transaction-local overrides applied.
    pub fn keys_with(&self, overrides: &BTreeMap<Key, KvUpdate>) -> BTreeSet<Key> {
        let mut keys = self.all_keys();
        for (key, update) in overrides {
            if update.is_delete() {
                keys.remove(key);
            } else {
                keys.insert(key.clone());
            }
        }
        keys
    }
}

impl KvRead for Snapshot {
    fn get(&self, key: &str) -> Option<&Value> {
        lookup(&self.base, &self.pending, key)
    }

    fn all_keys(&self) -> BTreeSet<Key> {
        visible_keys(&self.base, &self.pending)
    }
}
