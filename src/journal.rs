//! The event log collaborator: the consumed interface to the append-only
//! store, plus [`MemoryJournal`], the in-process stand-in used by tests and
//! single-node runs.
//!
//! The storage engine itself is out of scope. This crate only requires the
//! three reads/writes below: a synchronous-per-id append, a finite per-id
//! replay, and an unbounded, ordered, live read of one tag's events.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::LogError;
use crate::event::StoredEvent;
use crate::message::EntityId;
use crate::tag::Tag;

/// Opaque, totally ordered log position. Monotonically assigned by the log;
/// per-tag checkpoints store the position of the last forwarded event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Position(pub u64);

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live, ordered, unbounded sequence of positioned events for one tag.
///
/// Items are `Err` only for transient read failures; the consumer terminates
/// on them and its supervisor restarts from the durable checkpoint.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<(Position, StoredEvent), LogError>> + Send>>;

/// The consumed surface of the external event log.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Durably append one event to `id`'s history, returning its position.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Append`] on failure; the event is then not part
    /// of the history and must not be applied by the caller.
    async fn append(&self, id: &EntityId, event: StoredEvent) -> Result<Position, LogError>;

    /// Read `id`'s full history in persisted (seq) order. Finite and
    /// restartable.
    async fn replay(&self, id: &EntityId) -> Result<Vec<StoredEvent>, LogError>;

    /// Open a live read of all events carrying `tag`, strictly after
    /// `after` (`None` means start of stream), in log order.
    async fn read_by_tag(&self, tag: Tag, after: Option<Position>) -> EventStream;
}

/// One appended record with its owning id.
#[derive(Debug, Clone)]
struct Record {
    id: EntityId,
    position: Position,
    event: StoredEvent,
}

/// In-memory event log: a position-ordered history plus a broadcast tail for
/// live tag readers.
///
/// Tag readers subscribe to the tail *before* snapshotting history, then
/// de-duplicate by position, so no event between snapshot and subscription
/// is lost or delivered twice.
#[derive(Clone)]
pub struct MemoryJournal {
    history: Arc<Mutex<Vec<Record>>>,
    tail: broadcast::Sender<(Position, StoredEvent)>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        let (tail, _) = broadcast::channel(256);
        Self {
            history: Arc::new(Mutex::new(Vec::new())),
            tail,
        }
    }

    /// Position of the most recently appended event, if any.
    pub async fn last_position(&self) -> Option<Position> {
        self.history.lock().await.last().map(|r| r.position)
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventLog for MemoryJournal {
    async fn append(&self, id: &EntityId, event: StoredEvent) -> Result<Position, LogError> {
        let mut history = self.history.lock().await;
        let position = Position(history.len() as u64);
        history.push(Record {
            id: id.clone(),
            position,
            event: event.clone(),
        });
        // No live readers is fine; history covers catch-up.
        let _ = self.tail.send((position, event));
        Ok(position)
    }

    async fn replay(&self, id: &EntityId) -> Result<Vec<StoredEvent>, LogError> {
        let history = self.history.lock().await;
        Ok(history
            .iter()
            .filter(|r| &r.id == id)
            .map(|r| r.event.clone())
            .collect())
    }

    async fn read_by_tag(&self, tag: Tag, after: Option<Position>) -> EventStream {
        // Subscribe first, snapshot second: anything appended in between
        // shows up in both and is dropped by the position guard below.
        let mut live = self.tail.subscribe();
        let snapshot: Vec<(Position, StoredEvent)> = self
            .history
            .lock()
            .await
            .iter()
            .filter(|r| r.event.tag == tag && after.is_none_or(|a| r.position > a))
            .map(|r| (r.position, r.event.clone()))
            .collect();

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut last = after;
            for (position, event) in snapshot {
                if tx.send(Ok((position, event))).await.is_err() {
                    return;
                }
                last = Some(position);
            }
            loop {
                match live.recv().await {
                    Ok((position, event)) => {
                        if event.tag != tag {
                            continue;
                        }
                        // Already delivered from the snapshot.
                        if last.is_some_and(|l| position <= l) {
                            continue;
                        }
                        if tx.send(Ok((position, event))).await.is_err() {
                            return;
                        }
                        last = Some(position);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // The reader fell too far behind the tail buffer.
                        // Surface it as a read failure; the supervisor
                        // restarts the consumer from its checkpoint.
                        let _ = tx
                            .send(Err(LogError::Read(format!(
                                "tag {tag} reader lagged by {n} events"
                            ))))
                            .await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}
