//! The public client.
//!
//! A [`Client`] ties a [`Replica`] to a [`Transport`]. Constructing one
//! subscribes to pokes for its space, starts the initial pull and, unless
//! disabled, a background pull timer. Every committed mutation schedules a
//! push. Pulls and pushes are coalesced so bursts of triggers cost at most
//! one extra round trip.

use crate::{
    config::ClientConfig,
    debug::DebugState,
    error::{Error, Result},
    mutation::{Mutate, MutationEngine, Mutators},
    observe::{observe_prefix, observe_space, ChangeEvent, ChangeSummary},
    reconcile::{PokeAction, Reconciler},
    replica::{Replica, SubscriptionHandle},
    single_flight::SingleFlight,
    space::space_id_for_mutators,
    transport::Transport,
    Key, MutationId, PokeResult, ReadTransaction, ScanOptions, SpaceId,
};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

struct ClientInner {
    space_id: SpaceId,
    replica: Arc<Replica>,
    reconciler: Arc<Reconciler>,
    engine: MutationEngine,
    pull: SingleFlight,
    push: SingleFlight,
    initial_pull: Shared<BoxFuture<'static, Result<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// A syncing client of one space.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client and start syncing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(mutators: Mutators, transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let space_id = config
            .space_id
            .clone()
            .unwrap_or_else(|| space_id_for_mutators(&mutators));

        let replica = Replica::new(client_id.clone());
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&replica),
            Arc::clone(&transport),
            space_id.clone(),
        ));

        let pull = {
            let reconciler = Arc::clone(&reconciler);
            SingleFlight::new("pull", config.pull_delay, move || {
                let reconciler = Arc::clone(&reconciler);
                async move { reconciler.pull().await }
            })
        };
        let push = {
            let reconciler = Arc::clone(&reconciler);
            SingleFlight::new("push", config.push_delay, move || {
                let reconciler = Arc::clone(&reconciler);
                async move { reconciler.push().await }
            })
        };

        let engine = {
            let reconciler = Arc::clone(&reconciler);
            let push = push.clone();
            MutationEngine::spawn(mutators, Arc::clone(&replica), move |id| {
                reconciler.record_start(id);
                let _ = push.trigger();
            })
        };

        let mut tasks = Vec::new();

        let mut pokes = transport.subscribe_to_poke(&space_id);
        tasks.push({
            let reconciler = Arc::clone(&reconciler);
            let pull = pull.clone();
            tokio::spawn(async move {
                while let Some(poke) = pokes.recv().await {
                    if reconciler.handle_poke(&poke) == PokeAction::Resync {
                        let _ = pull.trigger();
                    }
                }
            })
        });

        if config.polling {
            let pull = pull.clone();
            let period = config.pull_interval;
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick completes immediately; the initial pull covers it.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let _ = pull.trigger().await;
                }
            }));
        }

        let initial_pull = pull.trigger().boxed().shared();

        tracing::debug!(%client_id, %space_id, "client started");

        Self {
            inner: Arc::new(ClientInner {
                space_id,
                replica,
                reconciler,
                engine,
                pull,
                push,
                initial_pull,
                tasks: Mutex::new(tasks),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        self.inner.replica.client_id()
    }

    pub fn space_id(&self) -> &str {
        &self.inner.space_id
    }

    /// Wait until the pull started by [`Client::new`] has finished.
    ///
    /// A failed initial pull is logged and does not fail the wait.
    pub async fn wait_for_initial_pull(&self) {
        if let Err(err) = self.inner.initial_pull.clone().await {
            tracing::warn!(space_id = %self.inner.space_id, error = %err, "initial pull failed");
        }
    }

    /// Run a read-only query against the current state.
    pub fn query<T>(&self, f: impl FnOnce(&ReadTransaction) -> T) -> T {
        self.inner.replica.query(f)
    }

    /// Re-run `query` whenever its inputs change.
    ///
    /// `on_changed` is called with the first result and then with every
    /// result that differs from the previous one.
    ///
    /// `query` runs while the replica is locked and must read only through
    /// the transaction it is given. Calling back into the client from it,
    /// for example through [`Client::query`], deadlocks. `on_changed` runs
    /// after the lock is released and may use the client freely.
    pub fn subscribe<T, Q, C>(&self, query: Q, on_changed: C) -> SubscriptionHandle
    where
        T: Clone + PartialEq + Send + 'static,
        Q: Fn(&ReadTransaction) -> Result<T> + Send + 'static,
        C: Fn(T) + Send + Sync + 'static,
    {
        self.inner.replica.subscribe(query, on_changed)
    }

    /// Observe the entries of a scan and what changed between deliveries.
    pub fn subscribe_to_scan_entries<F>(
        &self,
        options: impl Into<ScanOptions>,
        callback: F,
    ) -> SubscriptionHandle
    where
        F: Fn(&[(Key, Value)], &ChangeSummary) + Send + Sync + 'static,
    {
        observe_prefix(&self.inner.replica, options, callback)
    }

    /// Observe every key in the space.
    pub fn on_change<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        observe_space(&self.inner.replica, callback)
    }

    /// Run a mutator.
    ///
    /// Mutations run one at a time in the order this method is called. The
    /// returned future resolves with the mutator's return value once its
    /// writes are visible locally; a push is then scheduled in the
    /// background.
    ///
    /// Fails immediately with [`Error::MutatorNotFound`] for unknown names.
    pub fn mutate(&self, name: &str, args: impl Into<Value>) -> Result<Mutate> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.inner.engine.submit(name, args.into())
    }

    /// Run a mutator with serializable arguments.
    pub fn mutate_with<A: Serialize>(&self, name: &str, args: &A) -> Result<Mutate> {
        let args = serde_json::to_value(args)?;
        self.mutate(name, args)
    }

    /// Pull now, or join the pull already scheduled.
    pub async fn pull(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.inner.pull.trigger().await
    }

    /// Push now, or join the push already scheduled.
    pub async fn push(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.inner.push.trigger().await
    }

    /// Apply a poke received out of band.
    ///
    /// An out-of-order poke schedules a pull.
    pub fn handle_poke(&self, poke: &PokeResult) -> PokeAction {
        let action = self.inner.reconciler.handle_poke(poke);
        if action == PokeAction::Resync && !self.is_closed() {
            let _ = self.inner.pull.trigger();
        }
        action
    }

    /// Dump local state.
    pub fn debug(&self) -> DebugState {
        self.inner.replica.debug_state(&self.inner.space_id)
    }

    /// Highest server mutation id applied locally.
    pub fn latest_mutation_id(&self) -> MutationId {
        self.inner.replica.latest_mutation_id()
    }

    /// Stop syncing: unsubscribe from pokes and stop background work.
    ///
    /// Queued mutations resolve with [`Error::Closed`]. Local state stays
    /// readable.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner
            .reconciler
            .transport()
            .unsubscribe_from_poke(&self.inner.space_id);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.engine.shutdown();
        tracing::debug!(client_id = self.client_id(), space_id = %self.inner.space_id, "client closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.client_id())
            .field("space_id", &self.inner.space_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
