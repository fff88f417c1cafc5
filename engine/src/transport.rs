//! The server collaborator.

use crate::{error::Result, PokeResult, PullRequest, PullResponse, PushRequest, PushResponse};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Stream of pokes for one space. Closes when the subscription ends.
pub type PokeReceiver = mpsc::UnboundedReceiver<PokeResult>;

/// Sending half of a [`PokeReceiver`].
pub type PokeSender = mpsc::UnboundedSender<PokeResult>;

/// Pull, push and poke delivery for a space.
///
/// Implementations must be safe to call concurrently; the client never runs
/// a pull and a push at the same time but pokes arrive independently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch every patch after `request.after_mutation_id`.
    async fn pull(&self, request: PullRequest) -> Result<PullResponse>;

    /// Submit locally buffered mutations for server ordering.
    async fn push(&self, request: PushRequest) -> Result<PushResponse>;

    /// Start receiving pokes for `space_id`.
    fn subscribe_to_poke(&self, space_id: &str) -> PokeReceiver;

    /// Stop receiving pokes for `space_id`.
    fn unsubscribe_from_poke(&self, space_id: &str);
}
