//! Client-facing message types: commands, queries, and their acknowledgements.
//!
//! Commands and queries are in-process messages (transport is an external
//! concern), so they carry an [`Instant`] issue time for client-side latency
//! measurement and a fresh [`Uuid`] correlation token per message. The
//! dispatcher never resends a message: every retry fabricates a new one with
//! a new token.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::LedgerEvent;

/// Arbitrary-precision signed decimal used for amounts and balances.
pub type Amount = rust_decimal::Decimal;

/// Opaque stable key identifying a ledger entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Create an id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Common fields of a deposit or withdrawal command.
#[derive(Debug, Clone)]
pub struct CommandInfo {
    /// Target entity.
    pub id: EntityId,
    /// Amount to deposit or withdraw (always non-negative as issued).
    pub amount: Amount,
    /// Correlation token matching this command to its eventual [`Ack`].
    pub correlation: Uuid,
    /// When the client issued the command; the dispatcher derives round-trip
    /// latency from it when the ack arrives.
    pub issued_at: Instant,
}

/// A write-side command. Immutable once constructed.
#[derive(Debug, Clone)]
pub enum Command {
    Deposit(CommandInfo),
    Withdrawal(CommandInfo),
}

impl Command {
    /// Build a deposit command with a fresh correlation token and issue time.
    pub fn deposit(id: EntityId, amount: Amount) -> Self {
        Self::Deposit(CommandInfo {
            id,
            amount,
            correlation: Uuid::new_v4(),
            issued_at: Instant::now(),
        })
    }

    /// Build a withdrawal command with a fresh correlation token and issue time.
    pub fn withdrawal(id: EntityId, amount: Amount) -> Self {
        Self::Withdrawal(CommandInfo {
            id,
            amount,
            correlation: Uuid::new_v4(),
            issued_at: Instant::now(),
        })
    }

    /// The command's common fields, whichever the variant.
    pub fn info(&self) -> &CommandInfo {
        match self {
            Self::Deposit(info) | Self::Withdrawal(info) => info,
        }
    }

    /// Target entity id.
    pub fn id(&self) -> &EntityId {
        &self.info().id
    }
}

/// Acknowledgement of a committed command: the correlation token of the
/// command and the event it produced. Latency is computed by the receiving
/// dispatcher from the command's issue time, not carried on the wire.
#[derive(Debug, Clone)]
pub struct Ack {
    pub correlation: Uuid,
    pub event: LedgerEvent,
}

/// A balance query. Side-effect free.
#[derive(Debug, Clone)]
pub struct Query {
    pub id: EntityId,
    pub correlation: Uuid,
    pub issued_at: Instant,
}

impl Query {
    /// Build a query with a fresh correlation token and issue time.
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            correlation: Uuid::new_v4(),
            issued_at: Instant::now(),
        }
    }
}

/// Reply to a [`Query`]. Querying a never-existent id is not an error.
#[derive(Debug, Clone)]
pub enum QueryReply {
    /// The entity exists; its balance is the fold of its event history.
    Found {
        id: EntityId,
        balance: Amount,
        correlation: Uuid,
    },
    /// No event has ever been persisted for this id.
    NotFound { id: EntityId, correlation: Uuid },
}

impl QueryReply {
    /// Correlation token of the query this reply answers.
    pub fn correlation(&self) -> Uuid {
        match self {
            Self::Found { correlation, .. } | Self::NotFound { correlation, .. } => *correlation,
        }
    }
}
