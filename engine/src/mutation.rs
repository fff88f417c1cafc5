//! Mutators and the mutation engine.
//!
//! A mutator is a named async function over a [`WriteTransaction`]. The same
//! [`Mutators`] table is registered on the client and, optionally, on the
//! server, which replays mutations against authoritative state.
//!
//! The [`MutationEngine`] runs mutations strictly one at a time in call
//! order. A mutation that is waiting on an await point still blocks the next
//! one, so the second mutation always observes the first one's writes.

use crate::{
    entry::PendingMutation,
    error::{Error, Result},
    replica::Replica,
    LocalMutationId, Mutation, WriteTransaction,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Largest integer a JSON peer can represent exactly.
const MAX_LOCAL_MUTATION_ID: LocalMutationId = (1 << 53) - 1;

/// Boxed future returned by a registered mutator.
pub type MutatorFuture = BoxFuture<'static, std::result::Result<Value, String>>;

/// Type-erased mutator.
pub type MutatorFn = Arc<dyn Fn(WriteTransaction, Value) -> MutatorFuture + Send + Sync>;

/// Static table of named mutators.
#[derive(Clone, Default)]
pub struct Mutators {
    table: BTreeMap<String, MutatorFn>,
}

impl Mutators {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mutator, replacing any previous one with the same name.
    ///
    /// ```rust
    /// use replisync_engine::{Mutators, WriteTransaction};
    /// use serde_json::Value;
    ///
    /// let mutators = Mutators::new().register(
    ///     "setValue",
    ///     |tx: WriteTransaction, args: Value| async move {
    ///         tx.set("value", args);
    ///         Ok::<_, String>(())
    ///     },
    /// );
    /// assert!(mutators.contains("setValue"));
    /// ```
    pub fn register<F, Fut, R, E>(mut self, name: impl Into<String>, mutator: F) -> Self
    where
        F: Fn(WriteTransaction, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize,
        E: Display,
    {
        let mutator: MutatorFn = Arc::new(move |tx, args| {
            mutator(tx, args)
                .map(|outcome| match outcome {
                    Ok(value) => serde_json::to_value(value).map_err(|err| err.to_string()),
                    Err(err) => Err(err.to_string()),
                })
                .boxed()
        });
        self.table.insert(name.into(), mutator);
        self
    }

    /// Look up a mutator by name.
    pub fn get(&self, name: &str) -> Result<&MutatorFn> {
        self.table
            .get(name)
            .ok_or_else(|| Error::MutatorNotFound(name.to_string()))
    }

    /// Check if a mutator is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl std::fmt::Debug for Mutators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.table.keys()).finish()
    }
}

/// Pick a fresh local mutation id.
pub fn next_local_mutation_id() -> LocalMutationId {
    rand::thread_rng().gen_range(1..=MAX_LOCAL_MUTATION_ID)
}

/// Invoke a mutator, reporting a panic as an ordinary failure.
pub(crate) async fn call_mutator(
    mutator: &MutatorFn,
    tx: WriteTransaction,
    args: Value,
) -> std::result::Result<Value, String> {
    AssertUnwindSafe(async { mutator(tx, args).await })
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err("panicked".to_string()))
}

/// Run one mutator against the current state of `replica` and commit its
/// writes as a pending mutation.
///
/// If the mutator fails or panics its buffered writes are discarded and
/// nothing is committed.
pub async fn run_mutation(
    replica: &Replica,
    mutator: &MutatorFn,
    name: &str,
    args: Value,
) -> Result<(LocalMutationId, Value)> {
    let tx = WriteTransaction::new(replica.snapshot(), replica.client_id());
    let value = call_mutator(mutator, tx.clone(), args.clone())
        .await
        .map_err(|message| Error::mutator(name, message))?;

    let id = next_local_mutation_id();
    let mutation = Mutation {
        id,
        name: name.to_string(),
        args,
        operations: tx.operations(),
    };
    tracing::debug!(
        mutation_id = id,
        name,
        operations = mutation.operations.len(),
        "mutation applied locally"
    );
    replica.commit(PendingMutation::new(mutation));
    Ok((id, value))
}

struct Job {
    name: String,
    args: Value,
    mutator: MutatorFn,
    reply: oneshot::Sender<Result<Value>>,
}

/// Outcome of a submitted mutation.
#[must_use = "a mutation result is only observed by awaiting it"]
pub struct Mutate {
    rx: oneshot::Receiver<Result<Value>>,
}

impl Future for Mutate {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(Error::Closed)))
    }
}

/// Serialized mutation queue backed by a worker task.
pub struct MutationEngine {
    mutators: Mutators,
    queue: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
}

impl MutationEngine {
    /// Start the worker. `on_commit` runs after each committed mutation.
    pub fn spawn<F>(mutators: Mutators, replica: Arc<Replica>, on_commit: F) -> Self
    where
        F: Fn(LocalMutationId) + Send + Sync + 'static,
    {
        let (queue, mut jobs) = mpsc::unbounded_channel::<Job>();
        let worker = tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                let outcome = run_mutation(&replica, &job.mutator, &job.name, job.args).await;
                let reply = match outcome {
                    Ok((id, value)) => {
                        on_commit(id);
                        Ok(value)
                    }
                    Err(err) => {
                        tracing::debug!(name = %job.name, error = %err, "mutation discarded");
                        Err(err)
                    }
                };
                // The caller may have dropped the future; the mutation still ran.
                let _ = job.reply.send(reply);
            }
        });

        Self {
            mutators,
            queue,
            worker,
        }
    }

    /// Queue a mutation behind every previously submitted one.
    ///
    /// Unknown names fail here, before anything is queued.
    pub fn submit(&self, name: &str, args: Value) -> Result<Mutate> {
        let mutator = Arc::clone(self.mutators.get(name)?);
        let (reply, rx) = oneshot::channel();
        self.queue
            .send(Job {
                name: name.to_string(),
                args,
                mutator,
                reply,
            })
            .map_err(|_| Error::Closed)?;
        Ok(Mutate { rx })
    }

    pub fn mutators(&self) -> &Mutators {
        &self.mutators
    }

    /// Stop the worker. Queued mutations resolve with [`Error::Closed`].
    pub fn shutdown(&self) {
        self.worker.abort();
    }
}

impl Drop for MutationEngine {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_mutators() -> Mutators {
        Mutators::new()
            .register("increment", |tx: WriteTransaction, args: Value| async move {
                let current = tx.get_as::<i64>("count").map_err(|e| e.to_string())?;
                let next = current.unwrap_or(0) + args.as_i64().unwrap_or(1);
                tx.set("count", next);
                Ok::<_, String>(next)
            })
            .register("slowSet", |tx: WriteTransaction, args: Value| async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                tx.set("slow", args);
                Ok::<_, String>(())
            })
            .register("fail", |tx: WriteTransaction, _args: Value| async move {
                tx.set("partial", true);
                Err::<(), _>("nope")
            })
            .register("boom", |tx: WriteTransaction, _args: Value| async move {
                tx.set("partial", true);
                if tx.get("partial").is_some() {
                    panic!("mutator bug");
                }
                Ok::<_, String>(())
            })
    }

    #[test]
    fn names_are_sorted() {
        let names: Vec<_> = counter_mutators().names().map(str::to_string).collect();
        assert_eq!(names, vec!["boom", "fail", "increment", "slowSet"]);
    }

    #[test]
    fn unknown_mutator() {
        let err = counter_mutators().get("missing").err();
        assert_eq!(err, Some(Error::MutatorNotFound("missing".into())));
    }

    #[test]
    fn local_ids_stay_json_safe() {
        for _ in 0..1000 {
            let id = next_local_mutation_id();
            assert!(id >= 1 && id <= MAX_LOCAL_MUTATION_ID);
        }
    }

    #[tokio::test]
    async fn run_mutation_commits_operations() {
        let replica = Replica::new("client");
        let mutators = counter_mutators();
        let mutator = mutators.get("increment").unwrap();

        let (id, value) = run_mutation(&replica, mutator, "increment", json!(5))
            .await
            .unwrap();

        assert_eq!(value, json!(5));
        assert_eq!(replica.query(|tx| tx.get("count")), Some(json!(5)));
        let debug = replica.debug_state("space");
        assert_eq!(debug.pending.len(), 1);
        assert_eq!(debug.pending[0].id, id);
    }

    #[tokio::test]
    async fn failing_mutator_commits_nothing() {
        let replica = Replica::new("client");
        let mutators = counter_mutators();
        let mutator = mutators.get("fail").unwrap();

        let err = run_mutation(&replica, mutator, "fail", Value::Null)
            .await
            .unwrap_err();

        assert_eq!(err, Error::mutator("fail", "nope"));
        assert_eq!(replica.query(|tx| tx.get("partial")), None);
        assert!(replica.debug_state("space").pending.is_empty());
    }

    #[tokio::test]
    async fn queue_preserves_call_order() {
        let replica = Replica::new("client");
        let commits = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&commits);
        let engine = MutationEngine::spawn(counter_mutators(), Arc::clone(&replica), move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        // Submitted back to back without awaiting in between.
        let slow = engine.submit("slowSet", json!("first")).unwrap();
        let first = engine.submit("increment", json!(1)).unwrap();
        let second = engine.submit("increment", json!(1)).unwrap();

        assert_eq!(second.await.unwrap(), json!(2));
        assert_eq!(first.await.unwrap(), json!(1));
        assert_eq!(slow.await.unwrap(), Value::Null);
        assert_eq!(commits.load(Ordering::SeqCst), 3);

        let names: Vec<_> = replica
            .debug_state("space")
            .pending
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["slowSet", "increment", "increment"]);
    }

    #[tokio::test]
    async fn panicking_mutator_leaves_the_queue_running() {
        let replica = Replica::new("client");
        let engine = MutationEngine::spawn(counter_mutators(), Arc::clone(&replica), |_| {});

        let err = engine.submit("boom", Value::Null).unwrap().await.unwrap_err();
        assert_eq!(err, Error::mutator("boom", "panicked"));
        assert_eq!(replica.query(|tx| tx.get("partial")), None);

        let value = engine
            .submit("increment", json!(3))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(value, json!(3));
        assert_eq!(replica.debug_state("space").pending.len(), 1);
    }

    #[tokio::test]
    async fn submit_rejects_unknown_names_eagerly() {
        let replica = Replica::new("client");
        let engine = MutationEngine::spawn(counter_mutators(), replica, |_| {});
        assert!(matches!(
            engine.submit("missing", Value::Null),
            Err(Error::MutatorNotFound(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_closes_pending_results() {
        let replica = Replica::new("client");
        let engine = MutationEngine::spawn(counter_mutators(), replica, |_| {});
        engine.shutdown();
        tokio::task::yield_now().await;

        match engine.submit("increment", json!(1)) {
            Ok(pending) => assert_eq!(pending.await, Err(Error::Closed)),
            Err(err) => assert_eq!(err, Error::Closed),
        }
    }
}
