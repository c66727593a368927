//! Exponential-backoff restart supervision for tag consumers.
//!
//! Each consumer failure doubles the restart delay up to a cap, with an
//! upward multiplicative jitter so tags that failed together do not retry in
//! lockstep. A sustained healthy run resets the backoff. Restarting is
//! always safe: the consumer re-reads its durable checkpoint on every run.

use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::consumer::TagConsumer;

/// Restart pacing for a supervised consumer.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first restart.
    ///
    /// Default: 1 second.
    pub initial_delay: Duration,

    /// Upper bound for the un-jittered delay.
    ///
    /// Default: 39 seconds.
    pub max_delay: Duration,

    /// Multiplicative randomization factor. Each delay is scaled by
    /// `1 + uniform(0..jitter)`, so delays stay within
    /// `[initial_delay, max_delay * (1 + jitter)]`.
    ///
    /// Default: 0.2.
    pub jitter: f64,

    /// A run lasting at least this long counts as healthy and resets the
    /// backoff to `initial_delay`.
    ///
    /// Default: 60 seconds.
    pub reset_after: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(39),
            jitter: 0.2,
            reset_after: Duration::from_secs(60),
        }
    }
}

/// Explicit backoff state: the last un-jittered delay, if any failure has
/// happened since the last reset.
pub(crate) struct Backoff {
    config: BackoffConfig,
    current: Option<Duration>,
}

impl Backoff {
    pub(crate) fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    /// The delay to wait before the next restart: doubles the previous
    /// delay (capped), then applies upward jitter.
    pub(crate) fn next_delay(&mut self, rng: &mut impl Rng) -> Duration {
        let base = match self.current {
            None => self.config.initial_delay,
            Some(previous) => (previous * 2).min(self.config.max_delay),
        };
        self.current = Some(base);
        base.mul_f64(1.0 + rng.gen_range(0.0..self.config.jitter))
    }

    /// Forget accumulated failures after a healthy run.
    pub(crate) fn reset(&mut self) {
        self.current = None;
    }
}

/// Run `consumer` forever, restarting it after each failure with backoff.
///
/// Returns when the consumer stops cleanly (shutdown signalled) or the
/// shutdown sender is dropped. A failing run never propagates beyond this
/// task: sibling tags and the orchestrator are unaffected.
pub async fn run_supervised(
    consumer: TagConsumer,
    config: BackoffConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let tag = consumer.tag();
    let mut backoff = Backoff::new(config.clone());

    loop {
        if *shutdown.borrow() {
            return;
        }

        let started = Instant::now();
        match consumer.run(shutdown.clone()).await {
            Ok(()) => return,
            Err(e) => {
                if started.elapsed() >= config.reset_after {
                    backoff.reset();
                }
                let delay = backoff.next_delay(&mut rand::thread_rng());
                tracing::error!(
                    tag = %tag,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "tag consumer failed, restarting after backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
    use crate::consumer::EventSink;
    use crate::error::{CheckpointError, SinkError};
    use crate::event::LedgerEvent;
    use crate::journal::{EventLog, MemoryJournal, Position};
    use crate::tag::Tag;
    use async_trait::async_trait;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(jitter: f64) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(39),
            jitter,
            reset_after: Duration::from_secs(60),
        }
    }

    #[test]
    fn delays_double_up_to_the_cap_within_jitter_bounds() {
        let cfg = config(0.2);
        let mut backoff = Backoff::new(cfg.clone());
        let mut rng = StdRng::seed_from_u64(7);

        let mut expected_base = cfg.initial_delay;
        for failure in 0..8 {
            let delay = backoff.next_delay(&mut rng);
            assert!(
                delay >= expected_base,
                "failure {failure}: {delay:?} below base {expected_base:?}"
            );
            assert!(
                delay <= expected_base.mul_f64(1.0 + cfg.jitter),
                "failure {failure}: {delay:?} above jitter ceiling"
            );
            // All delays stay within the documented envelope.
            assert!(delay >= cfg.initial_delay.mul_f64(1.0 - cfg.jitter));
            assert!(delay <= cfg.max_delay.mul_f64(1.0 + cfg.jitter));

            expected_base = (expected_base * 2).min(cfg.max_delay);
        }
    }

    #[test]
    fn growth_is_multiplicative_between_successive_failures() {
        let mut backoff = Backoff::new(config(0.0));
        let mut rng = StdRng::seed_from_u64(0);

        let delays: Vec<Duration> = (0..6).map(|_| backoff.next_delay(&mut rng)).collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[2], Duration::from_secs(4));
        assert_eq!(delays[3], Duration::from_secs(8));
        assert_eq!(delays[4], Duration::from_secs(16));
        assert_eq!(delays[5], Duration::from_secs(32));
    }

    #[test]
    fn delay_saturates_at_the_cap() {
        let mut backoff = Backoff::new(config(0.0));
        let mut rng = StdRng::seed_from_u64(0);

        let last = (0..12).map(|_| backoff.next_delay(&mut rng)).last().unwrap();
        assert_eq!(last, Duration::from_secs(39));
    }

    #[test]
    fn reset_returns_to_the_initial_delay() {
        let mut backoff = Backoff::new(config(0.0));
        let mut rng = StdRng::seed_from_u64(0);

        backoff.next_delay(&mut rng);
        backoff.next_delay(&mut rng);
        backoff.reset();
        assert_eq!(backoff.next_delay(&mut rng), Duration::from_secs(1));
    }

    /// Checkpoint store whose `get` fails a fixed number of times, counting
    /// calls -- each failed `get` corresponds to one consumer run attempt.
    struct CountingFlakyStore {
        attempts: AtomicUsize,
        failures: usize,
        inner: MemoryCheckpointStore,
    }

    #[async_trait]
    impl CheckpointStore for CountingFlakyStore {
        async fn get(&self, tag: Tag) -> Result<Option<Position>, CheckpointError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(CheckpointError::Store("offset table down".to_string()));
            }
            self.inner.get(tag).await
        }

        async fn put(&self, tag: Tag, position: Position) -> Result<(), CheckpointError> {
            self.inner.put(tag, position).await
        }
    }

    struct NullSink;

    #[async_trait]
    impl EventSink for NullSink {
        async fn deliver(&self, _event: &LedgerEvent) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn supervisor_restarts_until_the_consumer_recovers() {
        let journal = Arc::new(MemoryJournal::new());
        let checkpoints = Arc::new(CountingFlakyStore {
            attempts: AtomicUsize::new(0),
            failures: 3,
            inner: MemoryCheckpointStore::new(),
        });
        let consumer = TagConsumer::new(
            Tag(0),
            Arc::clone(&journal) as Arc<dyn EventLog>,
            checkpoints.clone(),
            Arc::new(NullSink),
        );

        let cfg = BackoffConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(40),
            jitter: 0.2,
            reset_after: Duration::from_secs(60),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervised = tokio::spawn(run_supervised(consumer, cfg, shutdown_rx));

        // Three failing runs, then a healthy fourth that blocks on the
        // live stream.
        tokio::time::timeout(Duration::from_secs(5), async {
            while checkpoints.attempts.load(Ordering::SeqCst) < 4 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("supervisor should keep restarting");

        shutdown_tx.send(true).expect("signal shutdown");
        supervised.await.expect("supervised task exits cleanly");
        assert!(checkpoints.attempts.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn shutdown_during_backoff_stops_the_supervisor() {
        let journal = Arc::new(MemoryJournal::new());
        // Always-failing store keeps the supervisor in its backoff loop.
        let checkpoints = Arc::new(CountingFlakyStore {
            attempts: AtomicUsize::new(0),
            failures: usize::MAX,
            inner: MemoryCheckpointStore::new(),
        });
        let consumer = TagConsumer::new(
            Tag(1),
            Arc::clone(&journal) as Arc<dyn EventLog>,
            checkpoints,
            Arc::new(NullSink),
        );

        let cfg = BackoffConfig {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
            reset_after: Duration::from_secs(60),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervised = tokio::spawn(run_supervised(consumer, cfg, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).expect("signal shutdown");

        tokio::time::timeout(Duration::from_secs(1), supervised)
            .await
            .expect("must not sleep out the full backoff")
            .expect("clean exit");
    }
}
