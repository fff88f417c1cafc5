//! WebSocket support for real-time sync.
//!
//! Clients open one WebSocket per space and receive a poke for every push
//! applied to it. The same socket also accepts pull and push requests.

mod manager;
mod protocol;

pub use manager::{Connection, ConnectionManager, MessageSender};
pub use protocol::*;
