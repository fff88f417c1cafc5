//! # Replisync Engine
//!
//! A client-side optimistic sync engine for a shared key-value space.
//!
//! Applications change data only through named mutators. A mutation runs
//! locally at once and is visible to every read that follows it, while it is
//! also sent to a server that orders all clients' mutations. Confirmed state
//! flows back as patches, either pulled or pushed to the client as pokes.
//! Reactive queries re-run when their inputs change and notify only when
//! their result does.
//!
//! ## Core Concepts
//!
//! ### Layered store
//!
//! The [`Store`] keeps a confirmed base layer and, above it, one overlay per
//! pending local mutation. A read checks overlays newest first, then the
//! base. Deletes are explicit tombstones and JSON `null` is an ordinary
//! value. Snapshots are O(1) and never observe later writes.
//!
//! ### Transactions
//!
//! A [`ReadTransaction`] reads a snapshot and records which keys it read and
//! which keys its scans visited. A [`WriteTransaction`] adds a write buffer
//! that its own reads see first.
//!
//! ### Mutations
//!
//! [`Mutators`] is a static table of named async functions. Mutations run
//! strictly in call order. A failing mutator commits nothing.
//!
//! ### Reconciliation
//!
//! Push sends waiting mutations; a rejected push is rolled back. Pull fetches
//! every patch after the client's cursor. A poke is applied directly when it
//! starts right after the cursor; otherwise a pull is scheduled.
//!
//! ### Subscriptions
//!
//! [`Client::subscribe`] re-runs a query whenever a key it read changed or
//! the set of keys its scans visited drifted, and calls back only when the
//! result differs from the previous one.
//!
//! ## Quick Start
//!
//! ```rust
//! use replisync_engine::{
//!     Client, ClientConfig, MemoryServer, MemoryTransport, Mutators, Transport,
//!     WriteTransaction,
//! };
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> replisync_engine::Result<()> {
//! // 1. Register mutators
//! let mutators = Mutators::new().register(
//!     "addTodo",
//!     |tx: WriteTransaction, args: Value| async move {
//!         let id = args["id"].as_str().unwrap_or_default().to_string();
//!         tx.set(format!("todo/{id}"), args);
//!         Ok::<_, String>(())
//!     },
//! );
//!
//! // 2. Connect a client
//! let server = Arc::new(MemoryServer::new());
//! let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new(server));
//! let client = Client::new(mutators, transport, ClientConfig::new());
//! client.wait_for_initial_pull().await;
//!
//! // 3. Mutate and read your own write
//! client.mutate("addTodo", json!({"id": "1", "text": "ship it"}))?.await?;
//! let todos = client.query(|tx| tx.scan("todo/").values().to_array());
//! assert_eq!(todos.len(), 1);
//! # client.close();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod cursor;
pub mod debug;
pub mod entry;
pub mod error;
pub mod memory;
pub mod mutation;
pub mod observe;
pub mod protocol;
pub mod reconcile;
pub mod replica;
pub mod single_flight;
pub mod space;
pub mod store;
pub mod subscription;
pub mod transaction;
pub mod transport;

// Re-export main types at crate root
pub use client::Client;
pub use config::ClientConfig;
pub use cursor::MutationCursor;
pub use debug::{DebugState, PendingSummary};
pub use entry::{Entry, KvUpdate, MutationStatus, PendingMutation};
pub use error::{Error, Result};
pub use memory::{MemoryServer, MemoryTransport};
pub use mutation::{Mutate, MutationEngine, Mutators};
pub use observe::{ChangeEvent, ChangeSummary};
pub use protocol::{
    Mutation, Operation, Patch, PokeResult, PullRequest, PullResponse, PushRequest, PushResponse,
};
pub use reconcile::{PokeAction, Reconciler};
pub use replica::{Replica, SubscriptionHandle};
pub use space::space_id_for_mutators;
pub use store::{KvRead, Snapshot, Store};
pub use transaction::{
    ReadTransaction, ScanEntries, ScanKeys, ScanOptions, ScanResult, ScanStart, ScanValues,
    WriteTransaction,
};
pub use transport::{PokeReceiver, Transport};

/// Type aliases for clarity
pub type Key = String;
pub type MutationId = u64;
pub type LocalMutationId = u64;
pub type SpaceId = String;
pub type ClientId = String;
