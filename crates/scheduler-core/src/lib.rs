//! A persistent, lease-based job scheduler core.
//!
//! Components:
//! - [`clock`] — deterministic time source
//! - [`model`] — Job, Trigger, Run, RetryPolicy and their enums
//! - [`semaphore`] — bounded FIFO concurrency gate
//! - [`token_bucket`] — smoothed claim-rate limiter
//! - [`plan`] — opaque fire-time iterator
//! - [`store`] — pluggable durable persistence, plus an in-memory reference store
//! - [`bus`] — named, per-listener-isolated event bus
//! - [`runner`] — single handler invocation with timeout + heartbeat
//! - [`registry`] — job-type to handler registration
//! - [`engine`] — orchestration: bootstrap, tick loop, stalled monitor, shutdown
//! - [`error`] — the crate's error and failure-classification types
//! - [`config`] — engine tunables

pub mod bus;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod plan;
pub mod registry;
pub mod runner;
pub mod semaphore;
pub mod store;
pub mod token_bucket;

pub use bus::{EventBus, EventPayload, SchedulerEvent, Unsubscribe};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{FailureKind, SchedulerError};
pub use model::{
    BackoffStrategy, Job, MisfirePolicy, PlanSpec, Priority, RateLimitConfig, RetryPolicy, Run,
    RunStatus, Trigger,
};
pub use plan::{At, Interval, Plan};
pub use registry::JobRegistry;
pub use store::{InMemoryStore, Store};
