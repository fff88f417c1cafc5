//! In-process server and transport.
//!
//! [`MemoryServer`] keeps every space in memory and implements the server
//! side of the sync protocol: it orders pushed mutations, answers pulls with
//! the patches newer than a cursor, and broadcasts a poke after each push.
//! [`MemoryTransport`] connects a client to it directly, with switches for
//! simulating an unreachable server.

use crate::{
    error::{Error, Result},
    mutation::{call_mutator, Mutators},
    store::Store,
    transport::{PokeReceiver, PokeSender, Transport},
    Key, Mutation, MutationId, Operation, Patch, PokeResult, PullRequest, PullResponse,
    PushRequest, PushResponse, SpaceId, WriteTransaction,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Identifier of a poke subscriber.
pub type SubscriberId = u64;

/// Client id seen by mutators replayed on the server.
pub const SERVER_CLIENT_ID: &str = "server";

#[derive(Debug, Clone)]
struct StoredEntry {
    /// `None` is a tombstone
    value: Option<Value>,
    mutation_id: MutationId,
}

#[derive(Debug, Default)]
struct SpaceData {
    last_mutation_id: MutationId,
    entries: BTreeMap<Key, StoredEntry>,
}

impl SpaceData {
    /// Live entries as a store, so mutators can replay against them.
    fn to_store(&self) -> Store {
        let patches: Vec<Patch> = self
            .entries
            .iter()
            .filter_map(|(key, entry)| {
                let value = entry.value.clone()?;
                Some(Patch::set(key.clone(), value, entry.mutation_id))
            })
            .collect();
        let mut store = Store::new();
        store.apply_patches(&patches);
        store
    }

    fn apply(&mut self, patches: &[Patch]) {
        for patch in patches {
            let value = match patch {
                Patch::Set { value, .. } => Some(value.clone()),
                Patch::Del { .. } => None,
            };
            self.entries.insert(
                patch.key().clone(),
                StoredEntry {
                    value,
                    mutation_id: patch.mutation_id(),
                },
            );
        }
    }
}

fn validate_push(request: &PushRequest) -> Result<()> {
    let mut seen = HashSet::with_capacity(request.mutations.len());
    for mutation in &request.mutations {
        if mutation.name.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "mutation {} has no name",
                mutation.id
            )));
        }
        if !seen.insert(mutation.id) {
            return Err(Error::InvalidRequest(format!(
                "duplicate local mutation id {}",
                mutation.id
            )));
        }
    }
    Ok(())
}

/// Authoritative in-memory sync server.
#[derive(Default)]
pub struct MemoryServer {
    mutators: Option<Mutators>,
    spaces: Mutex<HashMap<SpaceId, SpaceData>>,
    subscribers: parking_lot::Mutex<HashMap<SpaceId, Vec<(SubscriberId, PokeSender)>>>,
    next_subscriber: AtomicU64,
}

impl MemoryServer {
    /// Create a server that applies the operations clients recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a server that replays mutators to derive operations.
    pub fn with_mutators(mutators: Mutators) -> Self {
        Self {
            mutators: Some(mutators),
            ..Self::default()
        }
    }

    /// Every patch newer than `after_mutation_id`, one per key.
    pub async fn pull(&self, request: &PullRequest) -> PullResponse {
        let spaces = self.spaces.lock().await;
        let Some(space) = spaces.get(&request.space_id) else {
            return PullResponse::default();
        };

        let mut patches: Vec<Patch> = space
            .entries
            .iter()
            .filter(|(_, entry)| entry.mutation_id > request.after_mutation_id)
            .map(|(key, entry)| match &entry.value {
                Some(value) => Patch::set(key.clone(), value.clone(), entry.mutation_id),
                None => Patch::del(key.clone(), entry.mutation_id),
            })
            .collect();
        patches.sort_by_key(Patch::mutation_id);

        tracing::debug!(
            space_id = %request.space_id,
            after = request.after_mutation_id,
            patches = patches.len(),
            "pull served"
        );
        PullResponse {
            last_mutation_id: space.last_mutation_id,
            patches,
        }
    }

    /// Order and apply pushed mutations, then poke every subscriber.
    ///
    /// A batch with an unnamed mutation or a repeated local id is rejected
    /// as a whole.
    pub async fn push(&self, request: PushRequest) -> Result<PushResponse> {
        validate_push(&request)?;

        let mut spaces = self.spaces.lock().await;
        let space = spaces.entry(request.space_id.clone()).or_default();
        if request.mutations.is_empty() {
            return Ok(PushResponse {
                last_mutation_id: space.last_mutation_id,
            });
        }

        let mut working = self.mutators.as_ref().map(|_| space.to_store());
        let mut poke = PokeResult::default();

        for mutation in request.mutations {
            let mutation_id = space.last_mutation_id + 1;
            space.last_mutation_id = mutation_id;

            let operations = match (&self.mutators, working.as_mut()) {
                (Some(mutators), Some(store)) => replay(mutators, store, &mutation).await,
                _ => mutation.operations,
            };
            let patches: Vec<Patch> = operations
                .into_iter()
                .map(|op| op.into_patch(mutation_id))
                .collect();

            if let Some(store) = working.as_mut() {
                store.apply_patches(&patches);
            }
            space.apply(&patches);

            poke.mutation_ids.push(mutation_id);
            poke.local_mutation_ids.push(mutation.id);
            poke.patches.extend(patches);
        }

        let last_mutation_id = space.last_mutation_id;
        drop(spaces);

        tracing::debug!(
            space_id = %request.space_id,
            mutations = poke.mutation_ids.len(),
            last_mutation_id,
            "push applied"
        );
        self.broadcast(&request.space_id, poke);

        Ok(PushResponse { last_mutation_id })
    }

    /// Register a poke subscriber for a space.
    pub fn subscribe(&self, space_id: &str) -> (SubscriberId, PokeReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed) + 1;
        self.subscribers
            .lock()
            .entry(space_id.to_string())
            .or_default()
            .push((id, tx));
        (id, rx)
    }

    /// Remove a poke subscriber. Its receiver closes.
    pub fn unsubscribe(&self, space_id: &str, id: SubscriberId) {
        let mut subscribers = self.subscribers.lock();
        if let Some(list) = subscribers.get_mut(space_id) {
            list.retain(|(subscriber, _)| *subscriber != id);
            if list.is_empty() {
                subscribers.remove(space_id);
            }
        }
    }

    /// Count of live poke subscribers for a space.
    pub fn subscriber_count(&self, space_id: &str) -> usize {
        self.subscribers
            .lock()
            .get(space_id)
            .map_or(0, |list| list.len())
    }

    /// Current value of a key, for inspection.
    pub async fn get(&self, space_id: &str, key: &str) -> Option<Value> {
        let spaces = self.spaces.lock().await;
        spaces.get(space_id)?.entries.get(key)?.value.clone()
    }

    /// Last mutation id assigned in a space.
    pub async fn last_mutation_id(&self, space_id: &str) -> MutationId {
        let spaces = self.spaces.lock().await;
        spaces.get(space_id).map_or(0, |space| space.last_mutation_id)
    }

    fn broadcast(&self, space_id: &str, poke: PokeResult) {
        let mut subscribers = self.subscribers.lock();
        if let Some(list) = subscribers.get_mut(space_id) {
            list.retain(|(_, tx)| tx.send(poke.clone()).is_ok());
        }
    }
}

impl std::fmt::Debug for MemoryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryServer")
            .field("mutators", &self.mutators)
            .finish_non_exhaustive()
    }
}

/// Run a mutator against server state. A failing or unknown mutator still
/// consumes its mutation id but writes nothing.
async fn replay(mutators: &Mutators, store: &Store, mutation: &Mutation) -> Vec<Operation> {
    let mutator = match mutators.get(&mutation.name) {
        Ok(mutator) => mutator,
        Err(err) => {
            tracing::warn!(name = %mutation.name, error = %err, "skipping mutation");
            return Vec::new();
        }
    };

    let tx = WriteTransaction::new(store.snapshot(), SERVER_CLIENT_ID);
    match call_mutator(mutator, tx.clone(), mutation.args.clone()).await {
        Ok(_) => tx.operations(),
        Err(message) => {
            tracing::warn!(
                name = %mutation.name,
                mutation_id = mutation.id,
                error = %message,
                "mutator failed on server"
            );
            Vec::new()
        }
    }
}

/// Transport that talks to a [`MemoryServer`] in the same process.
#[derive(Debug)]
pub struct MemoryTransport {
    server: Arc<MemoryServer>,
    fail_pulls: AtomicBool,
    fail_pushes: AtomicBool,
    pulls: AtomicUsize,
    pushes: AtomicUsize,
    poke_subscriptions: parking_lot::Mutex<HashMap<SpaceId, SubscriberId>>,
}

impl MemoryTransport {
    pub fn new(server: Arc<MemoryServer>) -> Self {
        Self {
            server,
            fail_pulls: AtomicBool::new(false),
            fail_pushes: AtomicBool::new(false),
            pulls: AtomicUsize::new(0),
            pushes: AtomicUsize::new(0),
            poke_subscriptions: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn server(&self) -> &Arc<MemoryServer> {
        &self.server
    }

    /// Make every pull fail until reset.
    pub fn set_fail_pulls(&self, fail: bool) {
        self.fail_pulls.store(fail, Ordering::SeqCst);
    }

    /// Make every push fail until reset.
    pub fn set_fail_pushes(&self, fail: bool) {
        self.fail_pushes.store(fail, Ordering::SeqCst);
    }

    /// Pulls attempted so far, including failed ones.
    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    /// Pushes attempted so far, including failed ones.
    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn pull(&self, request: PullRequest) -> Result<PullResponse> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.fail_pulls.load(Ordering::SeqCst) {
            return Err(Error::transport("pull rejected: server unreachable"));
        }
        Ok(self.server.pull(&request).await)
    }

    async fn push(&self, request: PushRequest) -> Result<PushResponse> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        if self.fail_pushes.load(Ordering::SeqCst) {
            return Err(Error::transport("push rejected: server unreachable"));
        }
        self.server.push(request).await
    }

    fn subscribe_to_poke(&self, space_id: &str) -> PokeReceiver {
        let (id, rx) = self.server.subscribe(space_id);
        if let Some(previous) = self
            .poke_subscriptions
            .lock()
            .insert(space_id.to_string(), id)
        {
            self.server.unsubscribe(space_id, previous);
        }
        rx
    }

    fn unsubscribe_from_poke(&self, space_id: &str) {
        if let Some(id) = self.poke_subscriptions.lock().remove(space_id) {
            self.server.unsubscribe(space_id, id);
        }
    }
}
