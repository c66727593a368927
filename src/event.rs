//! Ledger events and their persisted form.
//!
//! [`LedgerEvent`] is the typed, exhaustively-matched domain event. The log
//! stores [`StoredEvent`]: a kind string plus JSON payload, with the seq and
//! tag duplicated alongside so the log can filter by tag without decoding
//! payloads. [`decode_event`] is strict -- an unrecognized kind in persisted
//! history is a fatal [`ReplayError::Corrupt`], never skipped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ReplayError;
use crate::message::{Amount, EntityId};
use crate::tag::Tag;

/// Common fields of a deposit or withdrawal event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInfo {
    /// Entity whose history this event belongs to.
    pub id: EntityId,
    /// Amount deposited or withdrawn (non-negative; the variant carries the sign).
    pub amount: Amount,
    /// Wall-clock time the event was constructed.
    pub recorded_at: DateTime<Utc>,
    /// Per-id sequence number: strictly increasing, gap-free.
    pub seq: u64,
    /// Read-side partition this event belongs to.
    pub tag: Tag,
}

/// A persisted ledger event. Immutable, append-only.
///
/// Adjacently tagged so the serialized form splits cleanly into the stored
/// kind string and payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LedgerEvent {
    Deposited(EventInfo),
    Withdrawn(EventInfo),
}

impl LedgerEvent {
    /// Build a deposit event stamped with the current wall-clock time.
    pub fn deposited(id: EntityId, amount: Amount, seq: u64, tag: Tag) -> Self {
        Self::Deposited(EventInfo {
            id,
            amount,
            recorded_at: Utc::now(),
            seq,
            tag,
        })
    }

    /// Build a withdrawal event stamped with the current wall-clock time.
    pub fn withdrawn(id: EntityId, amount: Amount, seq: u64, tag: Tag) -> Self {
        Self::Withdrawn(EventInfo {
            id,
            amount,
            recorded_at: Utc::now(),
            seq,
            tag,
        })
    }

    /// The event's common fields, whichever the variant.
    pub fn info(&self) -> &EventInfo {
        match self {
            Self::Deposited(info) | Self::Withdrawn(info) => info,
        }
    }
}

/// The raw persisted form of a [`LedgerEvent`].
///
/// `seq` and `tag` are duplicated out of the payload so the log can replay
/// in order and filter by tag without understanding event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Event kind (the enum variant name, e.g. `"Deposited"`).
    pub kind: String,
    /// JSON payload (the variant's fields).
    pub payload: Value,
    /// Per-id sequence number.
    pub seq: u64,
    /// Read-side partition.
    pub tag: Tag,
}

/// Encode a [`LedgerEvent`] into its stored form.
///
/// Splits the adjacently-tagged serialization (`{"type": ..., "data": ...}`)
/// into the kind string and payload.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event cannot be serialized.
pub fn encode_event(event: &LedgerEvent) -> serde_json::Result<StoredEvent> {
    let value = serde_json::to_value(event)?;
    let obj = value
        .as_object()
        .expect("adjacently tagged enum must serialize to a JSON object");

    let kind = obj["type"]
        .as_str()
        .expect("adjacently tagged enum must have a string 'type' field")
        .to_string();
    let payload = obj.get("data").cloned().unwrap_or(Value::Null);

    let info = event.info();
    Ok(StoredEvent {
        kind,
        payload,
        seq: info.seq,
        tag: info.tag,
    })
}

/// Decode a stored record back into a [`LedgerEvent`].
///
/// # Errors
///
/// Returns [`ReplayError::Corrupt`] if the kind is not a recognized event
/// variant or the payload does not match it. Callers must treat this as
/// fatal for the entity being replayed.
pub fn decode_event(stored: &StoredEvent) -> Result<LedgerEvent, ReplayError> {
    let tagged = serde_json::json!({
        "type": stored.kind,
        "data": stored.payload,
    });
    serde_json::from_value(tagged).map_err(|_| ReplayError::Corrupt {
        kind: stored.kind.clone(),
        seq: stored.seq,
    })
}
