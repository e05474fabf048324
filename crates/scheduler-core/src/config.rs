//! Engine tunables.
//!
//! Follows a `JobRunnerConfig` shape (`batch_size`, `poll_interval`,
//! `worker_id` defaulting to `runner-{uuid}`) and a
//! `default_lease_ms`-style job-store lease default, extended with the
//! misfire, stalled-run, and concurrency knobs this crate's engine adds.

use std::time::Duration;

use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::model::RateLimitConfig;

#[derive(Debug, Clone, TypedBuilder)]
pub struct EngineConfig {
    #[builder(default = Duration::from_millis(250))]
    pub poll_interval: Duration,

    #[builder(default = 100)]
    pub batch_size: usize,

    #[builder(default = format!("scheduler-{}", Uuid::new_v4()))]
    pub scheduler_id: String,

    #[builder(default = Duration::from_secs(30))]
    pub lease: Duration,

    #[builder(default = Duration::from_secs(30))]
    pub heartbeat_interval: Duration,

    #[builder(default = Duration::from_secs(90))]
    pub stalled_after: Duration,

    #[builder(default = Duration::from_secs(60))]
    pub misfire_tolerance: Duration,

    #[builder(default = 1000)]
    pub max_misfire_skip: u32,

    #[builder(default)]
    pub max_concurrent_runs: Option<usize>,

    #[builder(default)]
    pub global_rate_limit: Option<RateLimitConfig>,

    #[builder(default = Duration::from_secs(5))]
    pub shutdown_grace_period: Duration,
}

impl EngineConfig {
    /// Cadence for the stalled-run monitor: `clamp(250ms, min(heartbeat_interval, stalled_after/2))`.
    pub fn stalled_monitor_period(&self) -> Duration {
        let half_stalled = self.stalled_after / 2;
        self.heartbeat_interval.min(half_stalled).max(Duration::from_millis(250))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
