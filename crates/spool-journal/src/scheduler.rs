//! Periodic background jobs.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::error;

use crate::error::Result;

/// Spawns a fixed-rate job: first run after `initial_delay`, then every
/// `period`. A failed tick is logged and the job keeps its cadence; the
/// returned handle is aborted on shutdown.
pub(crate) fn spawn_periodic<F, Fut>(
    name: &'static str,
    initial_delay: Duration,
    period: Duration,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    tokio::spawn(async move {
        tokio::time::sleep(initial_delay).await;
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = tick().await {
                error!("{name}: {e}; will retry on the next tick");
            }
        }
    })
}
