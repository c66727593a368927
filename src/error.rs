//! Crate-level error types for the write side, read side, and collaborators.

use crate::cluster::NodeRef;
use crate::tag::Tag;

/// Failure reported by the event log collaborator.
///
/// Log failures are transient I/O errors: they are never absorbed silently.
/// The owning worker terminates and recovery happens one layer up -- the
/// dispatcher's retry tick on the write side, the supervisor's backoff
/// restart on the read side.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Appending an event to the log failed.
    #[error("event log append failed: {0}")]
    Append(String),

    /// A replay or tag-stream read from the log failed.
    #[error("event log read failed: {0}")]
    Read(String),
}

/// Failure reported by the checkpoint store collaborator.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying filesystem I/O failure.
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Store-specific failure (e.g. a remote offset table rejecting a write).
    #[error("checkpoint store failed: {0}")]
    Store(String),
}

/// Failure reported by a downstream event sink.
#[derive(Debug, thiserror::Error)]
#[error("sink delivery failed: {0}")]
pub struct SinkError(pub String);

/// Failure while rebuilding an entity from its persisted history.
///
/// A `Corrupt` history is fatal for the entity instance: integrity is
/// prioritized over availability, so an unrecognized persisted event kind
/// is never skipped.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// A persisted record could not be decoded into a known event kind.
    #[error("unrecognized event kind {kind:?} at seq {seq}")]
    Corrupt { kind: String, seq: u64 },

    /// The replay read itself failed.
    #[error(transparent)]
    Log(#[from] LogError),
}

/// The entity worker's inbox is closed because the worker has exited
/// (passivated, or terminated after an append or replay failure).
#[derive(Debug, thiserror::Error)]
#[error("entity worker is no longer running")]
pub struct WorkerGone;

/// Failure to route a message to its owning worker.
///
/// Routed messages are never buffered: an undeliverable message is dropped
/// and the caller's retry layer recovers.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// The cluster coordinator resolved the key to a node other than this one.
    #[error("no local owner for {key:?}: owned by {owner}")]
    NotLocal { key: String, owner: NodeRef },

    /// The target worker exited between resolution and delivery.
    #[error(transparent)]
    Worker(#[from] WorkerGone),
}

/// Failure of a command issued through [`Router::execute`](crate::Router::execute).
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The command could not be routed to a live worker.
    #[error(transparent)]
    Route(#[from] RouteError),

    /// The worker accepted the command but terminated before acknowledging.
    /// The append may or may not have committed; replay on reactivation
    /// reflects exactly the committed events.
    #[error("no ack: entity worker terminated")]
    NoAck,
}

/// Terminal failure of a tag consumer run, handled by its supervisor.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// The tag stream failed.
    #[error(transparent)]
    Log(#[from] LogError),

    /// Reading or persisting the tag checkpoint failed.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// The downstream sink rejected an event.
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// A stored record on the tag stream could not be decoded.
    #[error(transparent)]
    Replay(#[from] ReplayError),

    /// The supposedly unbounded live stream ended.
    #[error("event stream for tag {tag} ended unexpectedly")]
    StreamEnded { tag: Tag },
}
