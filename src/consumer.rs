//! Per-tag read-side processor with durable checkpointing.
//!
//! One consumer per tag. On each run it loads the tag's checkpoint, opens a
//! live read strictly after it, and for every event in per-tag order
//! forwards the event to the downstream sink and then persists the new
//! checkpoint. Checkpointing after forwarding gives at-least-once delivery:
//! a crash between the two redelivers exactly the in-flight event on the
//! next run and never skips one. Sinks must absorb duplicates.
//!
//! Any unrecoverable stream, sink, or checkpoint error ends the run with an
//! error; the supervisor (see [`supervisor`](crate::supervisor)) restarts it
//! against the durable checkpoint.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_stream::StreamExt;

use crate::checkpoint::CheckpointStore;
use crate::error::{ConsumerError, SinkError};
use crate::event::{LedgerEvent, decode_event};
use crate::journal::EventLog;
use crate::tag::Tag;

/// Downstream side of the read pipeline.
///
/// Delivery is at-least-once: implementations must tolerate the same event
/// arriving more than once after a consumer restart.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Forward one decoded event.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] to refuse the event; the consumer terminates
    /// and is restarted by its supervisor without checkpointing past the
    /// refused event.
    async fn deliver(&self, event: &LedgerEvent) -> Result<(), SinkError>;
}

/// Read-side processor for one tag.
pub struct TagConsumer {
    tag: Tag,
    journal: Arc<dyn EventLog>,
    checkpoints: Arc<dyn CheckpointStore>,
    sink: Arc<dyn EventSink>,
}

impl TagConsumer {
    pub fn new(
        tag: Tag,
        journal: Arc<dyn EventLog>,
        checkpoints: Arc<dyn CheckpointStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            tag,
            journal,
            checkpoints,
            sink,
        }
    }

    /// The tag this consumer owns.
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// One consumer run: resume from the checkpoint and process the live
    /// stream until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError`] on any stream, decode, sink, or checkpoint
    /// failure. No event is skipped: the checkpoint only advances past an
    /// event after its delivery succeeded.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        let from = self.checkpoints.get(self.tag).await?;
        tracing::info!(tag = %self.tag, from = ?from, "tag consumer starting");

        let mut stream = self.journal.read_by_tag(self.tag, from).await;

        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok((position, stored))) => {
                        let event = decode_event(&stored)?;
                        // Forward first, checkpoint second: the one event
                        // in flight here is the only possible duplicate
                        // after a crash.
                        self.sink.deliver(&event).await?;
                        self.checkpoints.put(self.tag, position).await?;
                        tracing::debug!(
                            tag = %self.tag,
                            position = %position,
                            seq = stored.seq,
                            "event forwarded and checkpointed"
                        );
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(ConsumerError::StreamEnded { tag: self.tag }),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(tag = %self.tag, "tag consumer stopping");
                        return Ok(());
                    }
                }
            }
        }
    }
}
