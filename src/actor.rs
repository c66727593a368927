//! Worker loop that owns one entity and processes its messages sequentially.
//!
//! Each active entity id has exactly one worker task, fed by a bounded mpsc
//! inbox. The worker replays the id's history on start, then handles one
//! message at a time: the append for a command is awaited before the next
//! inbox message is taken, which is what enforces the single-writer
//! guarantee and the one-outstanding-mutation-per-id rule. An idle timeout
//! passivates the worker; its durable state lives only in the log, so
//! passivation needs no flush and reactivation replays.
//!
//! Public API: [`EntityHandle`] (cloneable async handle) and
//! [`spawn_entity_worker`] (factory that starts the worker task).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::entity::Entity;
use crate::error::{CommandError, ReplayError, WorkerGone};
use crate::event::{LedgerEvent, decode_event, encode_event};
use crate::journal::EventLog;
use crate::message::{Ack, Command, EntityId, Query, QueryReply};
use crate::tag::tag_for;

/// Messages sent from [`EntityHandle`] to the worker loop.
///
/// Replies travel over oneshot channels. A worker that terminates without
/// replying simply drops the sender: the client observes a missing ack,
/// never a partial result.
pub(crate) enum EntityMsg {
    /// Persist and apply a deposit or withdrawal.
    Command {
        cmd: Command,
        reply: oneshot::Sender<Ack>,
    },
    /// Read the current balance. No side effects.
    Query {
        query: Query,
        reply: oneshot::Sender<QueryReply>,
    },
}

/// Async handle to one entity's worker.
///
/// Lightweight and cloneable; all clones feed the same sequential inbox.
#[derive(Clone)]
pub struct EntityHandle {
    sender: mpsc::Sender<EntityMsg>,
}

impl EntityHandle {
    /// Enqueue a command, returning the channel its ack will arrive on.
    ///
    /// The returned receiver errors if the worker terminates before
    /// acknowledging (append failure or passivation) -- the caller's retry
    /// tick treats that as a lost message.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerGone`] if the worker's inbox is already closed.
    pub async fn submit_command(&self, cmd: Command) -> Result<oneshot::Receiver<Ack>, WorkerGone> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(EntityMsg::Command { cmd, reply: tx })
            .await
            .map_err(|_| WorkerGone)?;
        Ok(rx)
    }

    /// Enqueue a query, returning the channel its reply will arrive on.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerGone`] if the worker's inbox is already closed.
    pub async fn submit_query(&self, query: Query) -> Result<oneshot::Receiver<QueryReply>, WorkerGone> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(EntityMsg::Query { query, reply: tx })
            .await
            .map_err(|_| WorkerGone)?;
        Ok(rx)
    }

    /// Send a command and await its ack.
    ///
    /// # Errors
    ///
    /// * [`CommandError::Route`] -- the worker was already gone.
    /// * [`CommandError::NoAck`] -- the worker terminated before replying.
    pub async fn execute(&self, cmd: Command) -> Result<Ack, CommandError> {
        let rx = self
            .submit_command(cmd)
            .await
            .map_err(crate::error::RouteError::from)?;
        rx.await.map_err(|_| CommandError::NoAck)
    }

    /// Send a query and await its reply.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerGone`] if the worker exits before replying.
    pub async fn query(&self, query: Query) -> Result<QueryReply, WorkerGone> {
        let rx = self.submit_query(query).await?;
        rx.await.map_err(|_| WorkerGone)
    }

    /// Whether the worker behind this handle is still running.
    ///
    /// `false` after idle passivation or a terminal failure; the router uses
    /// this to evict stale handles and respawn lazily on next access.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Start the worker task for `id` and return a handle to it.
///
/// The worker replays the id's history before processing its first message,
/// and passivates after `idle_timeout` without traffic.
pub fn spawn_entity_worker(
    id: EntityId,
    journal: Arc<dyn EventLog>,
    number_of_tags: u32,
    idle_timeout: Duration,
) -> EntityHandle {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(run_entity_worker(id, journal, number_of_tags, idle_timeout, rx));
    EntityHandle { sender: tx }
}

/// Replay `id`'s persisted history into an [`Entity`] and the next sequence
/// number to assign.
///
/// # Errors
///
/// * [`ReplayError::Corrupt`] -- an unrecognized event kind in the history.
///   Fatal for this instance; never skipped.
/// * [`ReplayError::Log`] -- the replay read failed.
async fn load_entity(id: &EntityId, journal: &dyn EventLog) -> Result<(Entity, u64), ReplayError> {
    let history = journal.replay(id).await?;
    let mut entity = Entity::new(id.clone());
    let mut next_seq = 0;
    for stored in &history {
        let event = decode_event(stored)?;
        entity = entity.apply(&event);
        next_seq = stored.seq + 1;
    }
    Ok((entity, next_seq))
}

/// The sequential worker loop for one entity.
async fn run_entity_worker(
    id: EntityId,
    journal: Arc<dyn EventLog>,
    number_of_tags: u32,
    idle_timeout: Duration,
    mut rx: mpsc::Receiver<EntityMsg>,
) {
    // Loading: rebuild state from the log before the first message.
    let (mut entity, mut next_seq) = match load_entity(&id, journal.as_ref()).await {
        Ok(loaded) => loaded,
        Err(e) => {
            tracing::error!(id = %id, error = %e, "replay failed, worker terminating");
            return;
        }
    };
    tracing::debug!(
        id = %id,
        exists = entity.exists,
        balance = %entity.balance,
        "recovery completed"
    );

    let tag = tag_for(&id, number_of_tags);

    // Active: one message at a time until idle timeout or channel close.
    loop {
        let msg = match tokio::time::timeout(idle_timeout, rx.recv()).await {
            Ok(Some(msg)) => msg,
            // All handles dropped.
            Ok(None) => break,
            Err(_elapsed) => {
                tracing::info!(id = %id, "entity idle, passivating");
                break;
            }
        };

        match msg {
            EntityMsg::Command { cmd, reply } => {
                let info = cmd.info();
                let event = match &cmd {
                    Command::Deposit(_) => {
                        LedgerEvent::deposited(id.clone(), info.amount, next_seq, tag)
                    }
                    Command::Withdrawal(_) => {
                        LedgerEvent::withdrawn(id.clone(), info.amount, next_seq, tag)
                    }
                };

                let stored = match encode_event(&event) {
                    Ok(stored) => stored,
                    Err(e) => {
                        tracing::error!(id = %id, error = %e, "event encoding failed, worker terminating");
                        return;
                    }
                };

                // The append is awaited here, so the next inbox message is
                // not taken until this mutation is durable or failed.
                match journal.append(&id, stored).await {
                    Ok(position) => {
                        entity = entity.apply(&event);
                        next_seq += 1;
                        tracing::info!(
                            id = %id,
                            seq = event.info().seq,
                            position = %position,
                            balance = %entity.balance,
                            "event appended"
                        );
                        // Receiver may have given up; that's their retry
                        // layer's concern.
                        let _ = reply.send(Ack {
                            correlation: info.correlation,
                            event,
                        });
                    }
                    Err(e) => {
                        // Do not apply. Dropping the reply sender is the only
                        // signal the client gets: a missing ack. Replay on
                        // reactivation reflects exactly the committed events.
                        tracing::error!(id = %id, error = %e, "append failed, worker terminating");
                        drop(reply);
                        return;
                    }
                }
            }

            EntityMsg::Query { query, reply } => {
                let response = if entity.exists {
                    QueryReply::Found {
                        id: id.clone(),
                        balance: entity.balance,
                        correlation: query.correlation,
                    }
                } else {
                    QueryReply::NotFound {
                        id: id.clone(),
                        correlation: query.correlation,
                    }
                };
                let _ = reply.send(response);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LogError;
    use crate::event::StoredEvent;
    use crate::journal::{MemoryJournal, Position};
    use crate::message::Amount;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TAGS: u32 = 18;
    const LONG_IDLE: Duration = Duration::from_secs(60);

    fn handle(journal: &Arc<MemoryJournal>, id: &str) -> EntityHandle {
        spawn_entity_worker(
            EntityId::new(id),
            Arc::clone(journal) as Arc<dyn EventLog>,
            TAGS,
            LONG_IDLE,
        )
    }

    #[tokio::test]
    async fn deposit_then_withdrawal_then_query() {
        let journal = Arc::new(MemoryJournal::new());
        let worker = handle(&journal, "42");

        let ack = worker
            .execute(Command::deposit(EntityId::new("42"), Amount::new(10_000, 2)))
            .await
            .expect("deposit should ack");
        assert_eq!(ack.event.info().seq, 0);

        worker
            .execute(Command::withdrawal(EntityId::new("42"), Amount::new(3_000, 2)))
            .await
            .expect("withdrawal should ack");

        let reply = worker
            .query(Query::new(EntityId::new("42")))
            .await
            .expect("query should reply");
        match reply {
            QueryReply::Found { balance, .. } => assert_eq!(balance, Amount::new(7_000, 2)),
            QueryReply::NotFound { .. } => panic!("entity should exist"),
        }
    }

    #[tokio::test]
    async fn query_before_any_event_is_not_found() {
        let journal = Arc::new(MemoryJournal::new());
        let worker = handle(&journal, "999");

        let reply = worker
            .query(Query::new(EntityId::new("999")))
            .await
            .expect("query should reply");
        assert!(matches!(reply, QueryReply::NotFound { .. }));
    }

    #[tokio::test]
    async fn ack_carries_the_command_correlation() {
        let journal = Arc::new(MemoryJournal::new());
        let worker = handle(&journal, "1");

        let cmd = Command::deposit(EntityId::new("1"), Amount::from(5));
        let correlation = cmd.info().correlation;
        let ack = worker.execute(cmd).await.expect("ack");
        assert_eq!(ack.correlation, correlation);
    }

    #[tokio::test]
    async fn respawn_replays_committed_events() {
        let journal = Arc::new(MemoryJournal::new());
        {
            let worker = handle(&journal, "7");
            worker
                .execute(Command::deposit(EntityId::new("7"), Amount::from(100)))
                .await
                .expect("deposit");
            worker
                .execute(Command::deposit(EntityId::new("7"), Amount::from(25)))
                .await
                .expect("deposit");
        }
        // Handle dropped; worker exits once the channel drains.

        let worker = handle(&journal, "7");
        let reply = worker
            .query(Query::new(EntityId::new("7")))
            .await
            .expect("query");
        match reply {
            QueryReply::Found { balance, .. } => assert_eq!(balance, Amount::from(125)),
            QueryReply::NotFound { .. } => panic!("state should survive respawn"),
        }

        // Sequence numbers continue where the history left off.
        let ack = worker
            .execute(Command::withdrawal(EntityId::new("7"), Amount::from(5)))
            .await
            .expect("withdrawal");
        assert_eq!(ack.event.info().seq, 2);
    }

    #[tokio::test]
    async fn idle_timeout_passivates_the_worker() {
        let journal = Arc::new(MemoryJournal::new());
        let worker = spawn_entity_worker(
            EntityId::new("idle"),
            Arc::clone(&journal) as Arc<dyn EventLog>,
            TAGS,
            Duration::from_millis(100),
        );

        worker
            .execute(Command::deposit(EntityId::new("idle"), Amount::from(1)))
            .await
            .expect("deposit");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!worker.is_alive(), "worker should passivate when idle");

        // Reactivation replays to the same balance.
        let worker = handle(&journal, "idle");
        let reply = worker
            .query(Query::new(EntityId::new("idle")))
            .await
            .expect("query");
        assert!(matches!(
            reply,
            QueryReply::Found { balance, .. } if balance == Amount::from(1)
        ));
    }

    /// Log double that fails every append.
    struct FailingLog {
        inner: MemoryJournal,
    }

    #[async_trait]
    impl EventLog for FailingLog {
        async fn append(&self, _id: &EntityId, _event: StoredEvent) -> Result<Position, LogError> {
            Err(LogError::Append("disk full".to_string()))
        }

        async fn replay(&self, id: &EntityId) -> Result<Vec<StoredEvent>, LogError> {
            self.inner.replay(id).await
        }

        async fn read_by_tag(
            &self,
            tag: crate::tag::Tag,
            after: Option<Position>,
        ) -> crate::journal::EventStream {
            self.inner.read_by_tag(tag, after).await
        }
    }

    #[tokio::test]
    async fn append_failure_yields_missing_ack_and_no_state_change() {
        let journal = Arc::new(FailingLog {
            inner: MemoryJournal::new(),
        });
        let worker = spawn_entity_worker(
            EntityId::new("9"),
            Arc::clone(&journal) as Arc<dyn EventLog>,
            TAGS,
            LONG_IDLE,
        );

        let result = worker
            .execute(Command::deposit(EntityId::new("9"), Amount::from(10)))
            .await;
        assert!(matches!(result, Err(CommandError::NoAck)));

        // The worker terminated; nothing was committed, so reactivation
        // against the (healthy) inner log finds no history.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!worker.is_alive());

        let inner = Arc::new(MemoryJournal::new());
        let worker = handle(&inner, "9");
        let reply = worker
            .query(Query::new(EntityId::new("9")))
            .await
            .expect("query");
        assert!(matches!(reply, QueryReply::NotFound { .. }));
    }

    #[tokio::test]
    async fn corrupt_history_is_fatal_on_replay() {
        let journal = Arc::new(MemoryJournal::new());
        // Persist a record with an unrecognized kind.
        journal
            .append(
                &EntityId::new("bad"),
                StoredEvent {
                    kind: "Minted".to_string(),
                    payload: serde_json::json!({}),
                    seq: 0,
                    tag: crate::tag::Tag(0),
                },
            )
            .await
            .expect("append");

        let worker = handle(&journal, "bad");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!worker.is_alive(), "corrupt replay must kill the worker");

        let result = worker
            .execute(Command::deposit(EntityId::new("bad"), Amount::from(1)))
            .await;
        assert!(result.is_err(), "no command may be processed after corruption");
    }

    /// Log double that records how many appends are in flight at once.
    struct SlowLog {
        inner: MemoryJournal,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl EventLog for SlowLog {
        async fn append(&self, id: &EntityId, event: StoredEvent) -> Result<Position, LogError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let result = self.inner.append(id, event).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn replay(&self, id: &EntityId) -> Result<Vec<StoredEvent>, LogError> {
            self.inner.replay(id).await
        }

        async fn read_by_tag(
            &self,
            tag: crate::tag::Tag,
            after: Option<Position>,
        ) -> crate::journal::EventStream {
            self.inner.read_by_tag(tag, after).await
        }
    }

    #[tokio::test]
    async fn concurrent_commands_never_overlap_appends() {
        let journal = Arc::new(SlowLog {
            inner: MemoryJournal::new(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let worker = spawn_entity_worker(
            EntityId::new("c"),
            Arc::clone(&journal) as Arc<dyn EventLog>,
            TAGS,
            LONG_IDLE,
        );

        let mut pending = Vec::new();
        for _ in 0..4 {
            let worker = worker.clone();
            pending.push(tokio::spawn(async move {
                worker
                    .execute(Command::deposit(EntityId::new("c"), Amount::from(1)))
                    .await
            }));
        }
        for task in pending {
            task.await.expect("join").expect("ack");
        }

        assert_eq!(
            journal.max_in_flight.load(Ordering::SeqCst),
            1,
            "single-writer: appends for one id must never overlap"
        );
    }
}
