//! Data model: Job, RetryPolicy, Trigger, Run and their enums.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// A registered unit of work. `job_type` is the routing key the
/// [`crate::registry::JobRegistry`] uses to find a handler.
///
/// `max_concurrent_runs` and `rate_limit` are the per-job overrides of the
/// engine's global [`crate::semaphore::CapacityGate`] and
/// [`crate::token_bucket::TokenBucket`]; `worker_timeout`, when set,
/// overrides `default_timeout` so a job can carry its own timeout distinct
/// from the plain handler shape's.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    #[builder(setter(into))]
    pub name: String,

    #[builder(setter(into))]
    pub job_type: String,

    #[builder(default)]
    pub retry_policy: Option<RetryPolicy>,

    #[builder(default = Duration::from_secs(30))]
    pub default_timeout: Duration,

    #[builder(default)]
    pub worker_timeout: Option<Duration>,

    #[builder(default)]
    pub max_concurrent_runs: Option<usize>,

    #[builder(default)]
    pub rate_limit: Option<RateLimitConfig>,

    #[builder(default = false)]
    pub paused: bool,

    #[builder(default)]
    pub metadata: HashMap<String, Value>,
}

impl Job {
    pub fn new(name: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self::builder().name(name.into()).job_type(job_type.into()).build()
    }

    /// The effective timeout for one invocation: the worker-shape override
    /// if present, otherwise the job's default.
    pub fn effective_timeout(&self) -> Duration {
        self.worker_timeout.unwrap_or(self.default_timeout)
    }
}

/// Token-bucket configuration attached to a job, mirroring
/// [`crate::token_bucket::TokenBucket::new`]'s parameters so it can be
/// persisted alongside the job and rebuilt by the engine on hydrate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub capacity: f64,
    pub refill_rate: f64,
    pub refill_interval: Duration,
    pub burst: Option<f64>,
}

impl RateLimitConfig {
    /// `capacity <= 0` is a configuration error; a `burst` above `capacity`
    /// is silently clamped by [`crate::token_bucket::TokenBucket`] rather
    /// than rejected.
    pub fn validate(&self) -> Result<(), crate::error::SchedulerError> {
        if self.capacity <= 0.0 {
            return Err(crate::error::SchedulerError::Configuration(format!(
                "rate limit capacity must be positive, got {}",
                self.capacity
            )));
        }
        Ok(())
    }
}

/// Shape of the delay curve across successive attempts. `Fixed` and `Linear`
/// ignore `backoff_multiplier`; `Exponential` is the historical default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Always `initial_backoff`.
    Fixed,
    /// `initial_backoff * attempt` — attempt 1 waits once, attempt 2 waits
    /// twice as long, and so on.
    Linear,
    /// `initial_backoff * backoff_multiplier.pow(attempt - 1)`.
    Exponential,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential
    }
}

/// Retry/backoff policy applied when a run fails with a retryable error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    #[serde(default)]
    pub strategy: BackoffStrategy,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(3600),
            strategy: BackoffStrategy::Exponential,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay for the given (1-indexed) attempt number, before any
    /// jitter is applied, capped at `max_backoff`. Negative/zero results
    /// clamp to zero.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        let secs = match self.strategy {
            BackoffStrategy::Fixed => self.initial_backoff.as_secs_f64(),
            BackoffStrategy::Linear => self.initial_backoff.as_secs_f64() * n as f64,
            BackoffStrategy::Exponential => {
                let exp = self.backoff_multiplier.powi(n.saturating_sub(1) as i32);
                self.initial_backoff.as_secs_f64() * exp
            }
        };
        let capped = secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// What to do with a trigger whose scheduled fire time has already passed
/// by the time the engine gets around to evaluating it (e.g. the process
/// was down, or the tick loop fell behind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MisfirePolicy {
    /// Drop the missed fire(s) and resume from the next future fire time.
    Skip,
    /// Fire exactly once, immediately, then resume the normal plan.
    FireNow,
    /// Fire once for every missed occurrence, oldest first, before resuming.
    CatchUp,
}

impl Default for MisfirePolicy {
    fn default() -> Self {
        MisfirePolicy::Skip
    }
}

/// A serializable description of a trigger's fire-time plan, so the engine
/// can rebuild a [`crate::plan::Plan`] after a cache eviction or process
/// restart without re-running `schedule`. Cron-like plans are a non-goal —
/// callers wanting cron syntax implement [`crate::plan::Plan`] directly and
/// drive the engine through [`crate::engine::Engine::schedule_with_plan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PlanSpec {
    At {
        run_at: DateTime<Utc>,
    },
    Interval {
        anchor: DateTime<Utc>,
        period_ms: i64,
    },
}

/// Relative ordering used when multiple triggers are due in the same tick
/// and capacity is scarce. Smaller values run sooner, following a
/// `JobPriority::as_i16` convention (`Critical` maps to `0`, lower wins
/// ties).
pub type Priority = i32;

/// A scheduled binding between a [`Job`] and a fire-time plan.
///
/// `revision` is an optimistic-concurrency counter bumped by every mutating
/// `Store` call on this row.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct Trigger {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub job_id: Uuid,

    pub plan_spec: PlanSpec,

    #[builder(default)]
    pub misfire_policy: MisfirePolicy,

    #[builder(default = 0)]
    pub priority: Priority,

    #[builder(default = 0)]
    pub revision: u64,

    #[builder(default = false)]
    pub paused: bool,

    #[builder(default)]
    pub next_run_at: Option<DateTime<Utc>>,

    #[builder(default)]
    pub last_run_at: Option<DateTime<Utc>>,

    #[builder(default)]
    pub lease_owner: Option<String>,

    #[builder(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Consecutive failures; reset to zero on success or once retries are
    /// exhausted for a given failure chain.
    #[builder(default = 0)]
    pub failure_count: u32,

    /// The run id the *next* fire will use, set whenever a fire is
    /// scheduled so the `scheduled` event and the later `run` event agree.
    #[builder(default)]
    pub next_run_id: Option<Uuid>,

    #[builder(default)]
    pub metadata: HashMap<String, Value>,
}

impl Trigger {
    /// True if the trigger is not paused, not currently leased (or its
    /// lease has expired), and its next fire time is at or before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.paused {
            return false;
        }
        let lease_clear = match self.lease_expires_at {
            None => true,
            Some(expiry) => expiry <= now,
        };
        if !lease_clear {
            return false;
        }
        matches!(self.next_run_at, Some(fire_at) if fire_at <= now)
    }

    /// Clears lease ownership in place, for paths that persist a trigger
    /// right after releasing its claim.
    pub fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }
}

/// Terminal and in-progress states of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Stalled,
}

/// One execution attempt of a trigger.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct Run {
    pub id: Uuid,

    pub trigger_id: Uuid,

    pub job_id: Uuid,

    #[builder(default = RunStatus::Running)]
    pub status: RunStatus,

    #[builder(default = 1)]
    pub attempt: u32,

    pub scheduled_at: DateTime<Utc>,

    #[builder(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[builder(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,

    #[builder(default)]
    pub ended_at: Option<DateTime<Utc>>,

    /// Percent complete in `0..=100`, monotonically non-decreasing within a
    /// run; enforced by [`crate::runner::Runner`], not by the store.
    #[builder(default)]
    pub progress: Option<u8>,

    #[builder(default)]
    pub result: Option<Value>,

    #[builder(default)]
    pub error: Option<Value>,
}
