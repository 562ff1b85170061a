use std::{sync::Arc, time::Duration};

use metrics::counter;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::debug;

use golive_core::guard::ReplayGuard;

use crate::dispatch::Clock;
use crate::ratelimit::IngressLimits;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Background sweeper that keeps the in-memory maps bounded: expired
/// replay-guard entries and idle rate-limit buckets are dropped once a
/// minute. Both maps also self-clean on access, so a missed sweep only
/// delays reclamation.
pub struct SweepWorker {
    guard: Arc<ReplayGuard>,
    limits: Arc<IngressLimits>,
    clock: Clock,
    interval: Duration,
}

impl SweepWorker {
    pub fn new(guard: Arc<ReplayGuard>, limits: Arc<IngressLimits>, clock: Clock) -> Self {
        Self {
            guard,
            limits,
            clock,
            interval: SWEEP_INTERVAL,
        }
    }

    #[cfg(test)]
    fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_loop().await })
    }

    async fn run_loop(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately on the first tick
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.run_once();
        }
    }

    fn run_once(&self) {
        let now = (self.clock)();
        let replay_evicted = self.guard.evict_expired(now);
        let buckets_evicted = self.limits.evict_idle(now);

        if replay_evicted > 0 {
            counter!("sweep_evicted_total", "map" => "replay_guard")
                .increment(replay_evicted as u64);
        }
        if buckets_evicted > 0 {
            counter!("sweep_evicted_total", "map" => "rate_limits")
                .increment(buckets_evicted as u64);
        }
        debug!(
            stage = "maintenance",
            replay_evicted, buckets_evicted, "sweep completed"
        );
    }
}
