//! Shard router: resolves an id or tag to its owning live worker, creating
//! workers lazily.
//!
//! The router keeps liveness-checked handle caches for entity workers (by
//! id) and supervised tag consumers (by tag). Cache hits take a read lock;
//! a dead or missing worker is evicted and respawned under the write lock.
//! Ownership is resolved through the cluster coordinator on every delivery:
//! a message whose owner is not this node is dropped -- never buffered or
//! retried here -- and the caller's retry layer or the consumer's supervisor
//! recovers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, oneshot, watch};
use tokio::task::JoinHandle;

use crate::actor::{EntityHandle, spawn_entity_worker};
use crate::checkpoint::CheckpointStore;
use crate::cluster::ClusterCoordinator;
use crate::config::LedgerConfig;
use crate::consumer::{EventSink, TagConsumer};
use crate::error::{CommandError, RouteError};
use crate::journal::EventLog;
use crate::message::{Ack, Command, EntityId, Query, QueryReply};
use crate::supervisor::run_supervised;
use crate::tag::Tag;

/// A running, supervised tag consumer. The supervisor task only finishes on
/// shutdown (or if it panics), so `is_finished` doubles as the liveness
/// check.
struct ConsumerHandle {
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Routes commands, queries, and consumer liveness signals to their owning
/// workers.
pub struct Router {
    journal: Arc<dyn EventLog>,
    checkpoints: Arc<dyn CheckpointStore>,
    coordinator: Arc<dyn ClusterCoordinator>,
    sink: Arc<dyn EventSink>,
    config: LedgerConfig,
    entities: RwLock<HashMap<EntityId, EntityHandle>>,
    consumers: RwLock<HashMap<Tag, ConsumerHandle>>,
    shutdown: watch::Sender<bool>,
}

impl Router {
    pub fn new(
        journal: Arc<dyn EventLog>,
        checkpoints: Arc<dyn CheckpointStore>,
        coordinator: Arc<dyn ClusterCoordinator>,
        sink: Arc<dyn EventSink>,
        config: LedgerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            journal,
            checkpoints,
            coordinator,
            sink,
            config,
            entities: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            shutdown,
        }
    }

    /// The configuration this router was built with.
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Verify this node owns `key`, or report who does.
    fn check_ownership(&self, key: &str) -> Result<(), RouteError> {
        let owner = self.coordinator.resolve_owner(key);
        if owner == self.coordinator.local_node() {
            Ok(())
        } else {
            tracing::warn!(key, owner = %owner, "dropping message for non-local owner");
            Err(RouteError::NotLocal {
                key: key.to_string(),
                owner,
            })
        }
    }

    /// Handle to the live entity worker for `id`, spawning it lazily.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NotLocal`] if `id` is owned elsewhere.
    pub async fn entity(&self, id: &EntityId) -> Result<EntityHandle, RouteError> {
        self.check_ownership(id.as_str())?;

        // Fast path: cached and alive.
        {
            let entities = self.entities.read().await;
            if let Some(handle) = entities.get(id)
                && handle.is_alive()
            {
                return Ok(handle.clone());
            }
        }

        // Slow path: evict the stale entry and spawn a fresh worker.
        let mut entities = self.entities.write().await;
        if let Some(handle) = entities.get(id)
            && handle.is_alive()
        {
            // Another caller respawned it while we waited for the lock.
            return Ok(handle.clone());
        }
        entities.remove(id);

        tracing::debug!(id = %id, "spawning entity worker");
        let handle = spawn_entity_worker(
            id.clone(),
            Arc::clone(&self.journal),
            self.config.number_of_tags,
            self.config.idle_timeout,
        );
        entities.insert(id.clone(), handle.clone());
        Ok(handle)
    }

    /// Route a command to its entity, returning the channel its ack will
    /// arrive on.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] if the message had to be dropped. The command
    /// was not enqueued anywhere; the caller's next tick retries with a
    /// fresh command.
    pub async fn deliver_command(
        &self,
        cmd: Command,
    ) -> Result<oneshot::Receiver<Ack>, RouteError> {
        let handle = self.entity(cmd.id()).await?;
        Ok(handle.submit_command(cmd).await?)
    }

    /// Route a query to its entity, returning the channel its reply will
    /// arrive on.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] if the message had to be dropped.
    pub async fn deliver_query(
        &self,
        query: Query,
    ) -> Result<oneshot::Receiver<QueryReply>, RouteError> {
        let handle = self.entity(&query.id).await?;
        Ok(handle.submit_query(query).await?)
    }

    /// Route a command and await its ack.
    ///
    /// # Errors
    ///
    /// * [`CommandError::Route`] -- the message was dropped.
    /// * [`CommandError::NoAck`] -- the worker terminated before replying.
    pub async fn execute(&self, cmd: Command) -> Result<Ack, CommandError> {
        let rx = self.deliver_command(cmd).await?;
        rx.await.map_err(|_| CommandError::NoAck)
    }

    /// Route a query and await its reply.
    ///
    /// # Errors
    ///
    /// * [`CommandError::Route`] -- the message was dropped.
    /// * [`CommandError::NoAck`] -- the worker terminated before replying.
    pub async fn query(&self, query: Query) -> Result<QueryReply, CommandError> {
        let rx = self.deliver_query(query).await.map_err(CommandError::Route)?;
        rx.await.map_err(|_| CommandError::NoAck)
    }

    /// Idempotent liveness signal for `tag`'s consumer.
    ///
    /// A live consumer makes this a no-op heartbeat; a missing or dead one
    /// is (re)spawned under backoff supervision, resuming from the tag's
    /// durable checkpoint. This is what lets the heartbeat orchestrator
    /// revive the whole read side from zero.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NotLocal`] if the tag is owned elsewhere; the
    /// signal is dropped and the owner's own heartbeat handles it.
    pub async fn ensure_consumer(&self, tag: Tag) -> Result<(), RouteError> {
        self.check_ownership(&format!("tag-{tag}"))?;

        {
            let consumers = self.consumers.read().await;
            if let Some(handle) = consumers.get(&tag)
                && handle.is_alive()
            {
                tracing::debug!(tag = %tag, "heartbeat");
                return Ok(());
            }
        }

        let mut consumers = self.consumers.write().await;
        if let Some(handle) = consumers.get(&tag)
            && handle.is_alive()
        {
            return Ok(());
        }
        consumers.remove(&tag);

        tracing::info!(tag = %tag, "starting tag consumer");
        let consumer = TagConsumer::new(
            tag,
            Arc::clone(&self.journal),
            Arc::clone(&self.checkpoints),
            Arc::clone(&self.sink),
        );
        let task = tokio::spawn(run_supervised(
            consumer,
            self.config.backoff.clone(),
            self.shutdown.subscribe(),
        ));
        consumers.insert(tag, ConsumerHandle { task });
        Ok(())
    }

    /// Number of live tag consumers on this node.
    pub async fn consumer_count(&self) -> usize {
        self.consumers
            .read()
            .await
            .values()
            .filter(|handle| handle.is_alive())
            .count()
    }

    /// Signal all supervised consumers to stop. Entity workers are left to
    /// passivate on their own; their state is already durable.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    #[cfg(test)]
    pub(crate) async fn abort_consumers(&self) {
        for handle in self.consumers.read().await.values() {
            handle.task.abort();
        }
    }
}

// Dispatchers talk to the router through these seams so tests can drive the
// retry protocol against scripted ports.

#[async_trait::async_trait]
impl crate::dispatcher::CommandPort for Router {
    async fn deliver_command(&self, cmd: Command) -> Result<oneshot::Receiver<Ack>, RouteError> {
        Router::deliver_command(self, cmd).await
    }
}

#[async_trait::async_trait]
impl crate::dispatcher::QueryPort for Router {
    async fn deliver_query(
        &self,
        query: Query,
    ) -> Result<oneshot::Receiver<QueryReply>, RouteError> {
        Router::deliver_query(self, query).await
    }
}
