//! Subscription manager - re-runs queries and decides when to notify.
//!
//! # Notification policy
//!
//! On every change batch each live subscription is re-run against a fresh
//! transaction. Its callback fires when, in order:
//!
//! 1. the result differs from the previous result, and
//! 2. a changed key is in the new read-set, or
//! 3. the new scan-set differs from the previous scan-set.
//!
//! The new read-set, scan-set and result always become the basis for the
//! next comparison, whether or not the callback fired.
//!
//! # Delivery
//!
//! Queries run while the caller holds the replica lock, so each batch sees
//! exactly the state that produced it. Callbacks are returned as
//! [`Delivery`] closures and invoked after the lock is released. Every
//! delivery carries a sequence number and a subscription drops deliveries
//! older than the newest one it has already seen.

use crate::{error::Result, store::Snapshot, Key, ReadTransaction};
use parking_lot::ReentrantMutex;
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Identifier of a registered subscription.
pub type SubscriptionId = u64;

/// A callback invocation to run once the replica lock is released.
pub struct Delivery(Box<dyn FnOnce() + Send>);

impl Delivery {
    /// Invoke the callback.
    pub fn deliver(self) {
        (self.0)()
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Delivery")
    }
}

struct Sink<T> {
    id: SubscriptionId,
    callback: Box<dyn Fn(T) + Send + Sync>,
    delivered: ReentrantMutex<Cell<u64>>,
    active: AtomicBool,
}

impl<T: Send + 'static> Sink<T> {
    fn delivery(self: &Arc<Self>, seq: u64, result: T) -> Delivery {
        let sink = Arc::clone(self);
        Delivery(Box::new(move || {
            let delivered = sink.delivered.lock();
            if !sink.active.load(Ordering::Acquire) || seq <= delivered.get() {
                return;
            }
            delivered.set(seq);
            if catch_unwind(AssertUnwindSafe(|| (sink.callback)(result))).is_err() {
                tracing::warn!(subscription = sink.id, "subscription callback panicked");
            }
        }))
    }
}

struct LastRun<T> {
    result: T,
    scanned_keys: BTreeSet<Key>,
}

struct QuerySubscription<T, Q> {
    query: Q,
    sink: Arc<Sink<T>>,
    last: Option<LastRun<T>>,
}

trait Evaluate: Send {
    fn evaluate(
        &mut self,
        tx: ReadTransaction,
        changed: Option<&BTreeSet<Key>>,
        seq: u64,
    ) -> Option<Delivery>;

    fn cancel(&self);
}

impl<T, Q> Evaluate for QuerySubscription<T, Q>
where
    T: Clone + PartialEq + Send + 'static,
    Q: Fn(&ReadTransaction) -> Result<T> + Send + 'static,
{
    fn evaluate(
        &mut self,
        tx: ReadTransaction,
        changed: Option<&BTreeSet<Key>>,
        seq: u64,
    ) -> Option<Delivery> {
        let id = self.sink.id;
        let result = match catch_unwind(AssertUnwindSafe(|| (self.query)(&tx))) {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                tracing::warn!(subscription = id, error = %err, "subscription query failed");
                return None;
            }
            Err(_) => {
                tracing::warn!(subscription = id, "subscription query panicked");
                return None;
            }
        };

        let read_keys = tx.read_keys();
        let scanned_keys = tx.scanned_keys();

        let notify = match (&self.last, changed) {
            (None, _) | (_, None) => true,
            (Some(last), Some(changed)) => {
                if last.result == result {
                    false
                } else if changed.iter().any(|key| read_keys.contains(key)) {
                    true
                } else {
                    last.scanned_keys != scanned_keys
                }
            }
        };

        self.last = Some(LastRun {
            result: result.clone(),
            scanned_keys,
        });

        notify.then(|| self.sink.delivery(seq, result))
    }

    fn cancel(&self) {
        self.sink.active.store(false, Ordering::Release);
    }
}

/// Registry of live subscriptions.
#[derive(Default)]
pub struct SubscriptionManager {
    subscriptions: BTreeMap<SubscriptionId, Box<dyn Evaluate>>,
    next_id: SubscriptionId,
    next_seq: u64,
}

impl SubscriptionManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a query and run it once.
    ///
    /// The returned delivery always fires the callback with the first
    /// result, unless the first run failed.
    pub fn subscribe<T, Q, C>(
        &mut self,
        query: Q,
        on_changed: C,
        snapshot: &Snapshot,
        client_id: &str,
    ) -> (SubscriptionId, Option<Delivery>)
    where
        T: Clone + PartialEq + Send + 'static,
        Q: Fn(&ReadTransaction) -> Result<T> + Send + 'static,
        C: Fn(T) + Send + Sync + 'static,
    {
        self.next_id += 1;
        let id = self.next_id;

        let mut subscription = QuerySubscription {
            query,
            sink: Arc::new(Sink {
                id,
                callback: Box::new(on_changed),
                delivered: ReentrantMutex::new(Cell::new(0)),
                active: AtomicBool::new(true),
            }),
            last: None,
        };

        let seq = self.next_seq();
        let tx = ReadTransaction::new(snapshot.clone(), client_id);
        let delivery = subscription.evaluate(tx, None, seq);

        self.subscriptions.insert(id, Box::new(subscription));
        (id, delivery)
    }

    /// Remove a subscription. Deliveries already handed out are dropped.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        match self.subscriptions.remove(&id) {
            Some(subscription) => {
                subscription.cancel();
                true
            }
            None => false,
        }
    }

    /// Re-run every subscription after `changed` keys were modified.
    pub fn notify(
        &mut self,
        changed: &BTreeSet<Key>,
        snapshot: &Snapshot,
        client_id: &str,
    ) -> Vec<Delivery> {
        if changed.is_empty() || self.subscriptions.is_empty() {
            return Vec::new();
        }

        let seq = self.next_seq();
        self.subscriptions
            .values_mut()
            .filter_map(|subscription| {
                let tx = ReadTransaction::new(snapshot.clone(), client_id);
                subscription.evaluate(tx, Some(changed), seq)
            })
            .collect()
    }

    /// Count of live subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Check if there are no live subscriptions.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}
