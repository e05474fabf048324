//! Single handler invocation with timeout racing and a heartbeat callback.
//!
//! A `JobRunner`-style queue poller invokes `registry.execute(&claimed_job,
//! deps)` per claim. Latchwork generalizes that single invocation into
//! [`Runner::invoke`], racing the handler against a timeout with
//! `tokio::select!` and passing the handler a `touch` closure so it can
//! signal liveness and progress during long work, the in-task analogue of
//! an out-of-band `heartbeat` call.

use std::time::Duration;

use serde_json::Value;

use crate::error::SchedulerError;
use crate::registry::{JobRegistry, Touch};

/// Invokes registered handlers with a deadline.
pub struct Runner;

impl Runner {
    /// Run the handler registered for `job_type` with `payload`, giving it
    /// `touch` to call for liveness/progress, and fail with
    /// [`SchedulerError::Timeout`] if it has not finished within `timeout`.
    /// A `timeout` of zero disables the race entirely.
    pub async fn invoke(
        registry: &JobRegistry,
        job_type: &str,
        payload: Value,
        touch: Touch,
        timeout: Duration,
    ) -> Result<Value, SchedulerError> {
        if timeout.is_zero() {
            return registry.invoke(job_type, payload, touch).await;
        }
        tokio::select! {
            biased;
            result = registry.invoke(job_type, payload, touch) => result,
            _ = tokio::time::sleep(timeout) => Err(SchedulerError::Timeout(timeout)),
        }
    }
}
