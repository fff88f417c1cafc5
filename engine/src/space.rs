//! Space identity.

use crate::{mutation::Mutators, SpaceId};
use sha2::{Digest, Sha256};

/// Derive a space id from the mutator table.
///
/// Clients registering the same mutator names land in the same space. The
/// id is `"space"` followed by the first 16 hex digits of the SHA-256 of the
/// sorted names joined by newlines.
pub fn space_id_for_mutators(mutators: &Mutators) -> SpaceId {
    let joined = mutators.names().collect::<Vec<_>>().join("\n");
    let digest = Sha256::digest(joined.as_bytes());
    let hex = hex::encode(digest);
    format!("space{}", &hex[..16])
}
