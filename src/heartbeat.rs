//! Cluster-singleton heartbeat keeping every tag consumer alive.
//!
//! One node at a time holds the `read-side-heartbeat` singleton role. While
//! it does, it sends an idempotent ensure/liveness signal for every tag
//! through the router on a fixed interval: live consumers treat it as a
//! no-op, missing or dead ones are recreated against their durable
//! checkpoints. This is the sole mechanism that brings the read side back
//! from zero after a full restart. Losing leadership only stops the ticks;
//! running consumers are unaffected.

use std::sync::Arc;

use tokio::sync::watch;

use crate::cluster::ClusterCoordinator;
use crate::router::Router;
use crate::tag::all_tags;

/// Singleton role name used for the election.
pub const HEARTBEAT_ROLE: &str = "read-side-heartbeat";

/// Run the heartbeat orchestrator until shutdown.
///
/// Joins the singleton election and, while this node leads, signals every
/// tag in `[0, number_of_tags)` each `heartbeat_interval`. Signals the
/// router drops (e.g. a tag transiently owned elsewhere during rebalancing)
/// are logged and retried on the next beat.
pub async fn run_heartbeat(
    router: Arc<Router>,
    coordinator: Arc<dyn ClusterCoordinator>,
    mut shutdown: watch::Receiver<bool>,
) {
    let number_of_tags = router.config().number_of_tags;
    let interval = router.config().heartbeat_interval;
    let mut leadership = coordinator.elect_singleton(HEARTBEAT_ROLE);

    let mut ticker = tokio::time::interval(interval);
    // First beat one interval in, matching the election settling.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !*leadership.borrow() {
                    continue;
                }
                tracing::info!(tags = number_of_tags, "heartbeat");
                for tag in all_tags(number_of_tags) {
                    if let Err(e) = router.ensure_consumer(tag).await {
                        tracing::warn!(tag = %tag, error = %e, "heartbeat signal dropped");
                    }
                }
            }
            changed = leadership.changed() => {
                if changed.is_err() {
                    return;
                }
                if *leadership.borrow() {
                    tracing::info!("heartbeat singleton: leadership acquired");
                } else {
                    tracing::info!("heartbeat singleton: leadership lost");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
