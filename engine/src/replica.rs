//! The local replica of a space.
//!
//! A [`Replica`] owns the store, the mutation cursor and the subscription
//! table behind one lock. Every state transition goes through it: the change
//! is applied, affected subscriptions are re-run against the new snapshot,
//! and their callbacks are delivered once the lock is released.

use crate::{
    debug::{DebugState, PendingSummary},
    entry::{MutationStatus, PendingMutation},
    error::{Error, Result},
    store::{KvRead, Snapshot, Store},
    subscription::{Delivery, SubscriptionId, SubscriptionManager},
    ClientId, Key, LocalMutationId, Mutation, MutationCursor, MutationId, PokeResult,
    PullResponse, ReadTransaction,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

#[derive(Debug, Default)]
struct ReplicaState {
    store: Store,
    cursor: MutationCursor,
    subscriptions: SubscriptionManager,
}

/// Store, cursor and subscriptions of one client.
#[derive(Debug)]
pub struct Replica {
    client_id: ClientId,
    state: Mutex<ReplicaState>,
}

/// What a poke did to the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PokeOutcome {
    /// Patches applied and the cursor advanced
    Applied,
    /// Nothing to apply
    Ignored,
}

impl Replica {
    /// Create an empty replica.
    pub fn new(client_id: impl Into<ClientId>) -> Arc<Self> {
        Arc::new(Self {
            client_id: client_id.into(),
            state: Mutex::new(ReplicaState::default()),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Current point-in-time view.
    pub fn snapshot(&self) -> Snapshot {
        self.state.lock().store.snapshot()
    }

    /// Highest server mutation id fully applied.
    pub fn latest_mutation_id(&self) -> MutationId {
        self.state.lock().cursor.get()
    }

    /// Run a one-shot read against the current state.
    pub fn query<T>(&self, f: impl FnOnce(&ReadTransaction) -> T) -> T {
        let tx = ReadTransaction::new(self.snapshot(), self.client_id.clone());
        f(&tx)
    }

    /// Register a subscription and deliver its first result.
    ///
    /// `query` runs under the replica lock and must not call back into the
    /// replica.
    pub fn subscribe<T, Q, C>(self: &Arc<Self>, query: Q, on_changed: C) -> SubscriptionHandle
    where
        T: Clone + PartialEq + Send + 'static,
        Q: Fn(&ReadTransaction) -> Result<T> + Send + 'static,
        C: Fn(T) + Send + Sync + 'static,
    {
        let (id, delivery) = {
            let mut state = self.state.lock();
            let snapshot = state.store.snapshot();
            state
                .subscriptions
                .subscribe(query, on_changed, &snapshot, &self.client_id)
        };
        if let Some(delivery) = delivery {
            delivery.deliver();
        }

        SubscriptionHandle {
            id,
            replica: Arc::downgrade(self),
        }
    }

    /// Append a locally applied mutation.
    pub fn commit(&self, pending: PendingMutation) {
        self.update(|state| state.store.push_pending(pending));
    }

    /// Apply a pull response.
    ///
    /// `completed` are the mutations that were already pushed when the pull
    /// started; the response reflects them, so their overlays are dropped. A
    /// response older than the cursor is discarded.
    pub fn apply_pull(&self, response: &PullResponse, completed: &[LocalMutationId]) -> bool {
        let mut applied = false;
        let client_id = self.client_id.as_str();
        self.update(|state| {
            let current = state.cursor.get();
            if response.last_mutation_id < current {
                tracing::debug!(
                    client_id,
                    cursor = current,
                    last_mutation_id = response.last_mutation_id,
                    "discarding stale pull"
                );
                return BTreeSet::new();
            }
            applied = true;
            let changed = state.store.apply_server_update(&response.patches, completed);
            state.cursor.advance(response.last_mutation_id);
            changed
        });
        applied
    }

    /// Apply a poke if it directly follows the cursor.
    ///
    /// Returns [`Error::OutOfOrderPoke`] when the batch does not start at
    /// `cursor + 1`. Nothing is applied in that case.
    pub fn apply_poke(&self, poke: &PokeResult) -> Result<PokeOutcome> {
        let Some((min, max)) = poke.mutation_range() else {
            return Ok(PokeOutcome::Ignored);
        };

        let mut outcome = Ok(PokeOutcome::Applied);
        self.update(|state| {
            if !state.cursor.is_contiguous(min) {
                outcome = Err(Error::OutOfOrderPoke {
                    expected: state.cursor.next_expected(),
                    got: min,
                });
                return BTreeSet::new();
            }
            let changed = state
                .store
                .apply_server_update(&poke.patches, &poke.local_mutation_ids);
            state.cursor.advance(max);
            changed
        });
        outcome
    }

    /// Hand every waiting mutation to a push.
    pub fn take_waiting(&self) -> Vec<Mutation> {
        self.state.lock().store.take_waiting()
    }

    /// Local ids of mutations already handed to a push.
    pub fn in_flight_ids(&self) -> Vec<LocalMutationId> {
        self.state.lock().store.in_flight_ids()
    }

    /// Record a server acknowledgement.
    pub fn mark_pushed(&self, ids: &[LocalMutationId]) {
        self.state.lock().store.mark(ids, MutationStatus::Pushed);
    }

    /// Drop the overlays of a failed push.
    pub fn rollback(&self, ids: &[LocalMutationId]) {
        self.update(|state| state.store.remove_completed_local_mutations(ids));
    }

    /// Dump the replica for inspection.
    pub fn debug_state(&self, space_id: &str) -> DebugState {
        let state = self.state.lock();
        DebugState {
            client_id: self.client_id.clone(),
            space_id: space_id.to_string(),
            latest_mutation_id: state.cursor.get(),
            base_keys: state.store.base_len(),
            visible_keys: state.store.all_keys().len(),
            subscriptions: state.subscriptions.len(),
            pending: state
                .store
                .pending()
                .iter()
                .map(PendingSummary::from)
                .collect(),
        }
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.lock().subscriptions.unsubscribe(id)
    }

    /// Apply a transition, then notify subscriptions outside the lock.
    fn update(&self, f: impl FnOnce(&mut ReplicaState) -> BTreeSet<Key>) {
        let deliveries: Vec<Delivery> = {
            let mut state = self.state.lock();
            let changed = f(&mut state);
            if changed.is_empty() {
                return;
            }
            let snapshot = state.store.snapshot();
            state
                .subscriptions
                .notify(&changed, &snapshot, &self.client_id)
        };

        for delivery in deliveries {
            delivery.deliver();
        }
    }
}

/// Handle returned by [`Replica::subscribe`].
#[derive(Debug, Clone)]
#[must_use = "dropping the handle keeps the subscription alive; call unsubscribe to stop it"]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    replica: Weak<Replica>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Stop delivering changes. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if let Some(replica) = self.replica.upgrade() {
            replica.unsubscribe(self.id);
        }
    }
}
