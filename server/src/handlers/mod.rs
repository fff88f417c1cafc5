//! Request handlers for sync operations.

mod pull;
mod push;
mod websocket;

pub use pull::*;
pub use push::*;
pub use websocket::handle_poke_connection;

use crate::error::{AppError, Result};

/// Longest accepted space id.
pub const MAX_SPACE_ID_LEN: usize = 128;

/// Reject space ids that are empty, too long, or contain characters outside
/// `[A-Za-z0-9_-]`.
pub fn validate_space_id(space_id: &str) -> Result<()> {
    if space_id.is_empty() {
        return Err(AppError::BadRequest("space id is empty".into()));
    }
    if space_id.len() > MAX_SPACE_ID_LEN {
        return Err(AppError::BadRequest(format!(
            "space id longer than {MAX_SPACE_ID_LEN} characters"
        )));
    }
    if !space_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(AppError::BadRequest(format!(
            "invalid space id: {space_id}"
        )));
    }
    Ok(())
}
