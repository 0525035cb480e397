//! Background task wiring: the health refresher and the state-store
//! flusher, started and stopped per the lifespan ordering in
//! `main.rs::run`. Modeled on the teacher's `tick_loop` shape — a single
//! dedicated task per concern, structured `tracing` events per iteration.

use std::sync::Arc;
use std::time::Duration;

use gateway_core::clock::SystemClock;
use gateway_core::health::{run_refresh_loop, HealthCache, ReqwestUsageFetcher, RefresherConfig};
use gateway_core::registry::Registry;
use gateway_core::state::StateStore;
use tokio::task::JoinHandle;
use tracing::info;

use crate::state::release_memory_to_os;

/// Spawns the refresher task. The caller keeps the returned handle to
/// abort it during shutdown (the refresher loop never returns on its own).
pub(crate) fn spawn_refresher(
    registry: Arc<Registry>,
    state: Arc<StateStore>,
    health: Arc<HealthCache>,
    config: RefresherConfig,
) -> JoinHandle<()> {
    let fetcher: Arc<dyn gateway_core::health::UsageFetcher> = Arc::new(ReqwestUsageFetcher::default());
    let clock = Arc::new(SystemClock);
    tokio::spawn(async move {
        info!("health refresher starting");
        run_refresh_loop(registry, state, health, fetcher, clock, config).await;
    })
}

/// Periodically purges jemalloc arenas; the refresher's JSON fan-out is
/// the steadiest source of short-lived allocations in this process.
pub(crate) fn spawn_memory_purger(period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            release_memory_to_os();
        }
    })
}
