//! Reconciliation with the server.
//!
//! Three paths move server state into the replica:
//!
//! - **pull** fetches every patch after the cursor and drops the overlays of
//!   mutations the server already acknowledged.
//! - **push** sends waiting mutations. On success they are marked pushed and
//!   kept until their patches arrive; on failure they are rolled back.
//! - **poke** applies a server broadcast directly when it starts at
//!   `cursor + 1`. Any other start means a batch was missed and the caller
//!   must resync with a pull.
//!
//! Pull and push never overlap. Pokes are applied synchronously and are
//! safe against both because the replica serializes every transition.

use crate::{
    error::{Error, Result},
    replica::{PokeOutcome, Replica},
    transport::Transport,
    LocalMutationId, PokeResult, PullRequest, PushRequest, SpaceId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What happened to a poke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PokeAction {
    /// Applied in order
    Applied,
    /// Carried no mutations
    Ignored,
    /// Out of order; a pull is needed
    Resync,
}

/// Confirmation latency of a batch of local mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTrip {
    pub count: usize,
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
}

impl RoundTrip {
    fn from_samples(samples: &[Duration]) -> Option<Self> {
        let min = samples.iter().min().copied()?;
        let max = samples.iter().max().copied()?;
        let total: Duration = samples.iter().sum();
        Some(Self {
            count: samples.len(),
            min,
            max,
            avg: total / samples.len() as u32,
        })
    }
}

/// Pull, push and poke handling for one replica.
pub struct Reconciler {
    replica: Arc<Replica>,
    transport: Arc<dyn Transport>,
    space_id: SpaceId,
    exclusive: tokio::sync::Mutex<()>,
    started: Mutex<HashMap<LocalMutationId, Instant>>,
}

impl Reconciler {
    pub fn new(replica: Arc<Replica>, transport: Arc<dyn Transport>, space_id: SpaceId) -> Self {
        Self {
            replica,
            transport,
            space_id,
            exclusive: tokio::sync::Mutex::new(()),
            started: Mutex::new(HashMap::new()),
        }
    }

    pub fn space_id(&self) -> &str {
        &self.space_id
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Fetch and apply every patch after the cursor.
    ///
    /// On failure the replica is left untouched.
    pub async fn pull(&self) -> Result<()> {
        let _exclusive = self.exclusive.lock().await;

        let completed = self.replica.in_flight_ids();
        let request = PullRequest {
            space_id: self.space_id.clone(),
            after_mutation_id: self.replica.latest_mutation_id(),
        };
        let after = request.after_mutation_id;

        let response = self.transport.pull(request).await.map_err(|err| {
            tracing::warn!(space_id = %self.space_id, error = %err, "pull failed");
            err
        })?;

        let patches = response.patches.len();
        let applied = self.replica.apply_pull(&response, &completed);
        tracing::debug!(
            space_id = %self.space_id,
            client_id = self.replica.client_id(),
            after,
            last_mutation_id = response.last_mutation_id,
            patches,
            applied,
            "pull complete"
        );
        if applied {
            self.forget(&completed);
        }
        Ok(())
    }

    /// Send every waiting mutation.
    ///
    /// A rejected batch is rolled back and not retried.
    pub async fn push(&self) -> Result<()> {
        let _exclusive = self.exclusive.lock().await;

        let mutations = self.replica.take_waiting();
        if mutations.is_empty() {
            return Ok(());
        }
        let ids: Vec<LocalMutationId> = mutations.iter().map(|m| m.id).collect();

        let request = PushRequest {
            space_id: self.space_id.clone(),
            mutations,
        };
        match self.transport.push(request).await {
            Ok(response) => {
                self.replica.mark_pushed(&ids);
                tracing::debug!(
                    space_id = %self.space_id,
                    client_id = self.replica.client_id(),
                    mutations = ids.len(),
                    last_mutation_id = response.last_mutation_id,
                    "push acknowledged"
                );
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    space_id = %self.space_id,
                    mutations = ids.len(),
                    error = %err,
                    "push failed, rolling back"
                );
                self.replica.rollback(&ids);
                self.forget(&ids);
                Err(err)
            }
        }
    }

    /// Apply a poke, or report that a resync is needed.
    pub fn handle_poke(&self, poke: &PokeResult) -> PokeAction {
        match self.replica.apply_poke(poke) {
            Ok(PokeOutcome::Applied) => {
                tracing::debug!(
                    space_id = %self.space_id,
                    mutations = poke.mutation_ids.len(),
                    patches = poke.patches.len(),
                    "poke applied"
                );
                if let Some(round_trip) = self.confirm(&poke.local_mutation_ids) {
                    tracing::debug!(
                        count = round_trip.count,
                        min_ms = round_trip.min.as_millis() as u64,
                        max_ms = round_trip.max.as_millis() as u64,
                        avg_ms = round_trip.avg.as_millis() as u64,
                        "mutation round trip"
                    );
                }
                PokeAction::Applied
            }
            Ok(PokeOutcome::Ignored) => PokeAction::Ignored,
            Err(err @ Error::OutOfOrderPoke { .. }) => {
                tracing::info!(space_id = %self.space_id, error = %err, "resyncing");
                PokeAction::Resync
            }
            Err(err) => {
                tracing::warn!(space_id = %self.space_id, error = %err, "poke rejected");
                PokeAction::Resync
            }
        }
    }

    /// Start the round-trip clock for a local mutation.
    pub fn record_start(&self, id: LocalMutationId) {
        self.started.lock().insert(id, Instant::now());
    }

    fn confirm(&self, ids: &[LocalMutationId]) -> Option<RoundTrip> {
        let now = Instant::now();
        let samples: Vec<Duration> = {
            let mut started = self.started.lock();
            ids.iter()
                .filter_map(|id| started.remove(id))
                .map(|at| now.duration_since(at))
                .collect()
        };
        RoundTrip::from_samples(&samples)
    }

    fn forget(&self, ids: &[LocalMutationId]) {
        let mut started = self.started.lock();
        for id in ids {
            started.remove(id);
        }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("space_id", &self.space_id)
            .field("client_id", &self.replica.client_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        entry::PendingMutation,
        memory::{MemoryServer, MemoryTransport},
        transport::PokeReceiver,
        Mutation, Operation, Patch, PullResponse, PushResponse,
    };
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    fn setup() -> (Arc<Replica>, Arc<MemoryTransport>, Reconciler) {
        let replica = Replica::new("client");
        let transport = Arc::new(MemoryTransport::new(Arc::new(MemoryServer::new())));
        let reconciler = Reconciler::new(
            Arc::clone(&replica),
            Arc::clone(&transport) as Arc<dyn Transport>,
            "space".into(),
        );
        (replica, transport, reconciler)
    }

    fn commit(replica: &Replica, id: LocalMutationId, key: &str, value: Value) {
        replica.commit(PendingMutation::new(Mutation {
            id,
            name: "set".into(),
            args: Value::Null,
            operations: vec![Operation::set(key, value)],
        }));
    }

    #[test]
    fn round_trip_stats() {
        let stats = RoundTrip::from_samples(&[
            Duration::from_millis(10),
            Duration::from_millis(30),
            Duration::from_millis(20),
        ])
        .unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, Duration::from_millis(10));
        assert_eq!(stats.max, Duration::from_millis(30));
        assert_eq!(stats.avg, Duration::from_millis(20));
        assert!(RoundTrip::from_samples(&[]).is_none());
    }

    /// Holds every pull until released and records overlapping calls.
    struct GatedTransport {
        inner: MemoryTransport,
        pull_entered: Notify,
        release: Notify,
        in_pull: AtomicBool,
        push_entered: AtomicBool,
        overlapped: AtomicBool,
    }

    impl GatedTransport {
        fn new() -> Self {
            Self {
                inner: MemoryTransport::new(Arc::new(MemoryServer::new())),
                pull_entered: Notify::new(),
                release: Notify::new(),
                in_pull: AtomicBool::new(false),
                push_entered: AtomicBool::new(false),
                overlapped: AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl Transport for GatedTransport {
        async fn pull(&self, request: PullRequest) -> Result<PullResponse> {
            self.in_pull.store(true, Ordering::SeqCst);
            self.pull_entered.notify_one();
            self.release.notified().await;
            let response = self.inner.pull(request).await;
            self.in_pull.store(false, Ordering::SeqCst);
            response
        }

        async fn push(&self, request: PushRequest) -> Result<PushResponse> {
            self.push_entered.store(true, Ordering::SeqCst);
            if self.in_pull.load(Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            self.inner.push(request).await
        }

        fn subscribe_to_poke(&self, space_id: &str) -> PokeReceiver {
            self.inner.subscribe_to_poke(space_id)
        }

        fn unsubscribe_from_poke(&self, space_id: &str) {
            self.inner.unsubscribe_from_poke(space_id)
        }
    }

    #[tokio::test]
    async fn push_waits_for_an_in_flight_pull() {
        let replica = Replica::new("client");
        let gate = Arc::new(GatedTransport::new());
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&replica),
            Arc::clone(&gate) as Arc<dyn Transport>,
            "space".into(),
        ));
        commit(&replica, 1, "k", json!(1));

        let pulling = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.pull().await }
        });
        gate.pull_entered.notified().await;

        let pushing = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.push().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!gate.push_entered.load(Ordering::SeqCst));

        gate.release.notify_one();
        pulling.await.unwrap().unwrap();
        pushing.await.unwrap().unwrap();

        assert!(gate.push_entered.load(Ordering::SeqCst));
        assert!(!gate.overlapped.load(Ordering::SeqCst));
        assert_eq!(replica.in_flight_ids(), vec![1]);
    }

    #[tokio::test]
    async fn push_then_pull_confirms() {
        let (replica, transport, reconciler) = setup();
        commit(&replica, 7, "k", json!("v"));

        reconciler.push().await.unwrap();
        assert_eq!(replica.in_flight_ids(), vec![7]);

        reconciler.pull().await.unwrap();
        assert!(replica.in_flight_ids().is_empty());
        assert_eq!(replica.latest_mutation_id(), 1);
        assert_eq!(replica.query(|tx| tx.get("k")), Some(json!("v")));
        assert_eq!(transport.push_count(), 1);
    }

    #[tokio::test]
    async fn empty_push_does_not_hit_the_transport() {
        let (_replica, transport, reconciler) = setup();
        reconciler.push().await.unwrap();
        assert_eq!(transport.push_count(), 0);
    }

    #[tokio::test]
    async fn failed_push_rolls_back() {
        let (replica, transport, reconciler) = setup();
        transport.set_fail_pushes(true);
        commit(&replica, 1, "k", json!("optimistic"));

        assert!(matches!(reconciler.push().await, Err(Error::Transport(_))));
        assert_eq!(replica.query(|tx| tx.get("k")), None);
        assert_eq!(replica.debug_state("space").pending.len(), 0);
    }

    #[tokio::test]
    async fn failed_pull_leaves_state_unchanged() {
        let (replica, transport, reconciler) = setup();
        commit(&replica, 1, "k", json!(1));
        reconciler.push().await.unwrap();

        transport.set_fail_pulls(true);
        assert!(reconciler.pull().await.is_err());
        assert_eq!(replica.latest_mutation_id(), 0);
        assert_eq!(replica.in_flight_ids(), vec![1]);
    }

    #[tokio::test]
    async fn poke_paths() {
        let (replica, _transport, reconciler) = setup();

        assert_eq!(
            reconciler.handle_poke(&PokeResult::default()),
            PokeAction::Ignored
        );

        let gap = PokeResult {
            mutation_ids: vec![2],
            local_mutation_ids: vec![],
            patches: vec![Patch::set("k", json!(2), 2)],
        };
        assert_eq!(reconciler.handle_poke(&gap), PokeAction::Resync);
        assert_eq!(replica.latest_mutation_id(), 0);

        let next = PokeResult {
            mutation_ids: vec![1],
            local_mutation_ids: vec![],
            patches: vec![Patch::set("k", json!(1), 1)],
        };
        assert_eq!(reconciler.handle_poke(&next), PokeAction::Applied);
        assert_eq!(replica.latest_mutation_id(), 1);
        assert_eq!(reconciler.handle_poke(&gap), PokeAction::Applied);
        assert_eq!(replica.query(|tx| tx.get("k")), Some(json!(2)));
    }

    #[tokio::test]
    async fn confirmed_mutations_stop_the_clock() {
        let (replica, _transport, reconciler) = setup();
        commit(&replica, 3, "k", json!(1));
        reconciler.record_start(3);

        let poke = PokeResult {
            mutation_ids: vec![1],
            local_mutation_ids: vec![3],
            patches: vec![Patch::set("k", json!(1), 1)],
        };
        assert_eq!(reconciler.handle_poke(&poke), PokeAction::Applied);
        assert!(reconciler.started.lock().is_empty());
    }
}
