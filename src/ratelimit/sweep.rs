//! Periodic background sweep of the limiter registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace};

use super::engine::LimiterEngine;

/// Default sweep period.
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(300);

/// Handle to the background sweep task.
///
/// One task drives [`LimiterEngine::cleanup`] on a fixed interval; because
/// that single task awaits each tick, two sweeps can never overlap. The
/// engine self-prunes on the request path, so the sweep only bounds memory
/// for keys that went idle.
///
/// Dropping the handle aborts the task; [`shutdown`](Sweeper::shutdown)
/// stops it gracefully.
pub struct Sweeper {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl Sweeper {
    /// Spawn the sweep task. Must be called within a tokio runtime.
    pub fn spawn(engine: Arc<LimiterEngine>, period: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The interval fires immediately; consume that tick so the
            // first sweep lands one full period after spawn.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        trace!("sweeping limiter registry");
                        engine.cleanup();
                    }
                    _ = stopped.changed() => break,
                }
            }
            debug!("sweep task stopped");
        });
        Self { handle, stop }
    }

    /// Spawn with the default 5 minute period.
    pub fn spawn_default(engine: Arc<LimiterEngine>) -> Self {
        Self::spawn(engine, DEFAULT_SWEEP_PERIOD)
    }

    /// Stop the sweep task and wait for it to finish.
    pub async fn shutdown(mut self) {
        let _ = self.stop.send(true);
        let _ = (&mut self.handle).await;
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
