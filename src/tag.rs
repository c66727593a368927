//! Deterministic partitioning of the event stream into a fixed set of tags.
//!
//! Tags exist only to parallelize read-side consumption: every event carries
//! one, assigned from its entity id, and each tag is consumed independently.
//! Write-side routing does not use tags.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::EntityId;

/// Fixed namespace UUID for deterministic tag derivation.
///
/// Tag assignment is UUID v5 under this namespace, so `tag_for` returns the
/// same tag for the same id on every call, process, and architecture.
const TAG_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5f, 0x2b, 0x91, 0x6e, 0x8d, 0x04, 0x4c, 0x17, 0x9b, 0x32, 0xaa, 0x54, 0x0e, 0x6f, 0xd1, 0x83,
]);

/// A read-side partition label in `[0, number_of_tags)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub u32);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Assign the tag for an entity id.
///
/// Pure and stable: derives a UUID v5 from the id under [`TAG_NAMESPACE`]
/// and folds its leading bytes modulo `number_of_tags`.
pub fn tag_for(id: &EntityId, number_of_tags: u32) -> Tag {
    let uuid = Uuid::new_v5(&TAG_NAMESPACE, id.as_str().as_bytes());
    let bytes = uuid.as_bytes();
    let hash = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Tag(hash % number_of_tags)
}

/// All tags for a given partition count, in order.
pub fn all_tags(number_of_tags: u32) -> impl Iterator<Item = Tag> {
    (0..number_of_tags).map(Tag)
}
