//! Host-owned periodic maintenance.
//!
//! The engine never schedules its own cleanup. Hosts that want it spawn a
//! [`MaintenanceDaemon`]:
//!
//! ```ignore
//! let shutdown = CancellationToken::new();
//! let daemon = MaintenanceDaemon::new(engine.clone(), Duration::from_secs(10));
//! tokio::spawn(daemon.run(shutdown.clone()));
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::engine::DispatchEngine;

/// Default interval between cleanup passes.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

/// Runs [`DispatchEngine::cleanup`] on an interval.
#[derive(Debug)]
pub struct MaintenanceDaemon<R: Clone> {
    engine: Arc<DispatchEngine<R>>,
    interval: Duration,
}

impl<R> MaintenanceDaemon<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn new(engine: Arc<DispatchEngine<R>>, interval: Duration) -> Self {
        Self {
            engine,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Loop until `shutdown` fires or the engine is closed. Returns the
    /// number of passes made.
    pub async fn run(self, shutdown: CancellationToken) -> u64 {
        info!(interval_ms = self.interval.as_millis() as u64, "Maintenance daemon starting");

        let engine_closed = self.engine.shutdown_token();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        let mut passes = 0;
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                _ = engine_closed.cancelled() => break,

                _ = ticker.tick() => {
                    let report = self.engine.cleanup();
                    passes += 1;
                    debug!(
                        pass = passes,
                        removed = report.removed(),
                        remaining = report.remaining,
                        "Maintenance pass"
                    );
                }
            }
        }

        info!(passes, "Maintenance daemon stopped");
        passes
    }
}
