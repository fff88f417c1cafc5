//! Server mutation cursor.
//!
//! The cursor tracks the highest server mutation id whose patches have been
//! fully applied. It is the `afterMutationId` of the next pull and the basis
//! for detecting out-of-order pokes. It never moves backwards.

use crate::MutationId;
use serde::{Deserialize, Serialize};

/// Monotonic `latestMutationId` of a client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationCursor(MutationId);

impl MutationCursor {
    /// Create a cursor at zero (nothing applied yet).
    pub fn new() -> Self {
        Self(0)
    }

    /// Create a cursor at a specific position.
    pub fn at(id: MutationId) -> Self {
        Self(id)
    }

    /// Current position.
    pub fn get(&self) -> MutationId {
        self.0
    }

    /// The mutation id a contiguous poke must start at.
    pub fn next_expected(&self) -> MutationId {
        self.0.saturating_add(1)
    }

    /// Move the cursor forward. Returns false if `to` would move it backwards.
    pub fn advance(&mut self, to: MutationId) -> bool {
        if to < self.0 {
            return false;
        }
        self.0 = to;
        true
    }

    /// Check if a batch starting at `min` directly follows this cursor.
    pub fn is_contiguous(&self, min: MutationId) -> bool {
        min == self.next_expected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_cursor_starts_at_zero() {
        let cursor = MutationCursor::new();
        assert_eq!(cursor.get(), 0);
        assert_eq!(cursor.next_expected(), 1);
    }

    #[test]
    fn advance_moves_forward() {
        let mut cursor = MutationCursor::new();
        assert!(cursor.advance(3));
        assert_eq!(cursor.get(), 3);
        assert!(cursor.advance(3));
        assert_eq!(cursor.get(), 3);
    }

    #[test]
    fn advance_never_moves_backwards() {
        let mut cursor = MutationCursor::at(10);
        assert!(!cursor.advance(4));
        assert_eq!(cursor.get(), 10);
    }

    #[test]
    fn contiguity() {
        let cursor = MutationCursor::at(5);
        assert!(cursor.is_contiguous(6));
        assert!(!cursor.is_contiguous(7));
        assert!(!cursor.is_contiguous(5));
    }

    #[test]
    fn high_values_saturate() {
        let cursor = MutationCursor::at(u64::MAX);
        assert_eq!(cursor.next_expected(), u64::MAX);
    }

    #[test]
    fn serialization_is_a_bare_number() {
        let json = serde_json::to_string(&MutationCursor::at(42)).unwrap();
        assert_eq!(json, "42");
    }
}
