//! Client-side command and query dispatchers: fixed-interval retry loops
//! driving the router.
//!
//! Each dispatcher is a two-state machine ticking at a fixed interval. A
//! tick in `Sending` fabricates a brand-new message (fresh correlation
//! token -- never a resend) and moves to `AwaitingAck`; a tick in
//! `AwaitingAck` presumes the outstanding message lost, logs a warning, and
//! returns to `Sending`. An ack for the outstanding message logs its
//! round-trip latency; anything else is a late or duplicate ack and is
//! logged and discarded. Because every retry is a new logical command, two
//! independently-acked commands for the same id can both take effect --
//! an accepted property of the protocol, covered by tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::error::RouteError;
use crate::message::{Ack, Amount, Command, EntityId, Query, QueryReply};

/// Where command dispatchers send. Implemented by [`Router`](crate::Router);
/// tests substitute scripted ports.
#[async_trait]
pub trait CommandPort: Send + Sync {
    async fn deliver_command(&self, cmd: Command) -> Result<oneshot::Receiver<Ack>, RouteError>;
}

/// Where query dispatchers send.
#[async_trait]
pub trait QueryPort: Send + Sync {
    async fn deliver_query(&self, query: Query)
    -> Result<oneshot::Receiver<QueryReply>, RouteError>;
}

/// Produces the client traffic a dispatcher sends.
///
/// Every call must fabricate a new message with a fresh correlation token.
pub trait TrafficSource: Send + 'static {
    fn next_command(&mut self) -> Command;
    fn next_query(&mut self) -> Query;
}

/// Random traffic: ids drawn uniformly from a small range, amounts drawn
/// uniformly and sign-split -- non-negative amounts become deposits,
/// negative ones withdrawals of the absolute value.
pub struct RandomTraffic {
    id_low: u64,
    id_high: u64,
    amount_low: i64,
    amount_high: i64,
}

impl RandomTraffic {
    pub fn new(ids: std::ops::RangeInclusive<u64>, amounts: std::ops::RangeInclusive<i64>) -> Self {
        Self {
            id_low: *ids.start(),
            id_high: *ids.end(),
            amount_low: *amounts.start(),
            amount_high: *amounts.end(),
        }
    }

    fn random_id(&self) -> EntityId {
        let id = rand::thread_rng().gen_range(self.id_low..=self.id_high);
        EntityId::new(id.to_string())
    }
}

impl Default for RandomTraffic {
    /// Ids 1..=100, amounts -10_000..=10_000.
    fn default() -> Self {
        Self::new(1..=100, -10_000..=10_000)
    }
}

impl TrafficSource for RandomTraffic {
    fn next_command(&mut self) -> Command {
        let amount = rand::thread_rng().gen_range(self.amount_low..=self.amount_high);
        if amount >= 0 {
            Command::deposit(self.random_id(), Amount::from(amount))
        } else {
            Command::withdrawal(self.random_id(), Amount::from(-amount))
        }
    }

    fn next_query(&mut self) -> Query {
        Query::new(self.random_id())
    }
}

/// The dispatcher's two states. The outstanding correlation token and send
/// instant identify the one message an ack is currently expected for.
#[derive(Clone, Copy)]
enum DispatchState {
    Sending,
    AwaitingAck {
        correlation: Uuid,
        issued_at: Instant,
    },
}

/// Tick-driven command client.
pub struct CommandDispatcher<S> {
    port: Arc<dyn CommandPort>,
    source: S,
    tick_interval: Duration,
}

impl<S: TrafficSource> CommandDispatcher<S> {
    pub fn new(port: Arc<dyn CommandPort>, source: S, tick_interval: Duration) -> Self {
        Self {
            port,
            source,
            tick_interval,
        }
    }

    /// Run the retry loop until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        // The first tick fires immediately; the protocol starts one
        // interval in.
        ticker.tick().await;

        // Acks from any in-flight send, including late ones, funnel in here.
        let (ack_tx, mut ack_rx) = mpsc::channel::<Ack>(16);
        let mut state = DispatchState::Sending;

        loop {
            tokio::select! {
                _ = ticker.tick() => match state {
                    DispatchState::Sending => {
                        let cmd = self.source.next_command();
                        let correlation = cmd.info().correlation;
                        let issued_at = cmd.info().issued_at;
                        tracing::info!(id = %cmd.id(), correlation = %correlation, "sending command");
                        match self.port.deliver_command(cmd).await {
                            Ok(rx) => {
                                let ack_tx = ack_tx.clone();
                                tokio::spawn(async move {
                                    // A dropped reply is a lost message; the
                                    // tick timeout covers it.
                                    if let Ok(ack) = rx.await {
                                        let _ = ack_tx.send(ack).await;
                                    }
                                });
                            }
                            // Dropped in routing: indistinguishable from any
                            // other lost message as far as the protocol goes.
                            Err(e) => tracing::debug!(error = %e, "command dropped in routing"),
                        }
                        state = DispatchState::AwaitingAck { correlation, issued_at };
                    }
                    DispatchState::AwaitingAck { correlation, .. } => {
                        tracing::warn!(correlation = %correlation, "no response to last command");
                        state = DispatchState::Sending;
                    }
                },
                Some(ack) = ack_rx.recv() => match state {
                    DispatchState::AwaitingAck { correlation, issued_at }
                        if ack.correlation == correlation =>
                    {
                        tracing::info!(
                            correlation = %ack.correlation,
                            latency_ms = issued_at.elapsed().as_millis() as u64,
                            seq = ack.event.info().seq,
                            "command acked"
                        );
                        state = DispatchState::Sending;
                    }
                    _ => {
                        tracing::info!(correlation = %ack.correlation, "late ack, discarding");
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

/// Tick-driven query client. Same protocol as [`CommandDispatcher`], with
/// `Found`/`NotFound` replies in place of acks.
pub struct QueryDispatcher<S> {
    port: Arc<dyn QueryPort>,
    source: S,
    tick_interval: Duration,
}

impl<S: TrafficSource> QueryDispatcher<S> {
    pub fn new(port: Arc<dyn QueryPort>, source: S, tick_interval: Duration) -> Self {
        Self {
            port,
            source,
            tick_interval,
        }
    }

    /// Run the retry loop until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.tick().await;

        let (reply_tx, mut reply_rx) = mpsc::channel::<QueryReply>(16);
        let mut state = DispatchState::Sending;

        loop {
            tokio::select! {
                _ = ticker.tick() => match state {
                    DispatchState::Sending => {
                        let query = self.source.next_query();
                        let correlation = query.correlation;
                        let issued_at = query.issued_at;
                        tracing::info!(id = %query.id, correlation = %correlation, "sending query");
                        match self.port.deliver_query(query).await {
                            Ok(rx) => {
                                let reply_tx = reply_tx.clone();
                                tokio::spawn(async move {
                                    if let Ok(reply) = rx.await {
                                        let _ = reply_tx.send(reply).await;
                                    }
                                });
                            }
                            Err(e) => tracing::debug!(error = %e, "query dropped in routing"),
                        }
                        state = DispatchState::AwaitingAck { correlation, issued_at };
                    }
                    DispatchState::AwaitingAck { correlation, .. } => {
                        tracing::warn!(correlation = %correlation, "no response to last query");
                        state = DispatchState::Sending;
                    }
                },
                Some(reply) = reply_rx.recv() => match state {
                    DispatchState::AwaitingAck { correlation, issued_at }
                        if reply.correlation() == correlation =>
                    {
                        match &reply {
                            QueryReply::Found { id, balance, .. } => tracing::info!(
                                id = %id,
                                balance = %balance,
                                latency_ms = issued_at.elapsed().as_millis() as u64,
                                "query answered"
                            ),
                            QueryReply::NotFound { id, .. } => tracing::info!(
                                id = %id,
                                latency_ms = issued_at.elapsed().as_millis() as u64,
                                "query answered: not found"
                            ),
                        }
                        state = DispatchState::Sending;
                    }
                    _ => {
                        tracing::info!(correlation = %reply.correlation(), "late reply, discarding");
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
