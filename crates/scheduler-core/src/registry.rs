//! Maps job-type strings to handler closures.
//!
//! Follows a `JobRegistry` shape: a `HashMap<&'static str, BoxedHandler>`
//! populated at startup, looked up by [`crate::runner::Runner`] when a
//! trigger's job is claimed. The handler signature is generalized here to
//! accept a `touch` heartbeat-plus-progress callback (see
//! [`crate::runner`]) in place of a separate out-of-band `heartbeat()`
//! store call.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::error::SchedulerError;

/// A callback a handler may call periodically during long work, both to
/// extend its run's lease and, optionally, to report `0..=100` percent
/// complete. A `None` progress just touches the heartbeat.
pub type Touch =
    Arc<dyn Fn(Option<u8>) -> Pin<Box<dyn Future<Output = Result<(), SchedulerError>> + Send>> + Send + Sync>;

type BoxedHandler = Box<
    dyn Fn(Value, Touch) -> Pin<Box<dyn Future<Output = Result<Value, SchedulerError>> + Send>>
        + Send
        + Sync,
>;

/// Maps job-type strings to their registered async handler.
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<&'static str, BoxedHandler>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for `job_type`. `handler` receives the run's
    /// opaque JSON payload and a `touch` heartbeat/progress callback, and
    /// returns the run's opaque JSON result on success.
    pub fn register<F, Fut>(&mut self, job_type: &'static str, handler: F)
    where
        F: Fn(Value, Touch) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, SchedulerError>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |payload, touch| Box::pin(handler(payload, touch)));
        self.handlers.insert(job_type, boxed);
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    pub(crate) async fn invoke(
        &self,
        job_type: &str,
        payload: Value,
        touch: Touch,
    ) -> Result<Value, SchedulerError> {
        let handler = self.handlers.get(job_type).ok_or_else(|| {
            SchedulerError::Configuration(format!("no handler registered for job type {job_type}"))
        })?;
        handler(payload, touch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_touch() -> Touch {
        Arc::new(|_progress| Box::pin(async { Ok(()) }))
    }

    #[tokio::test]
    async fn register_and_invoke_roundtrips() {
        let mut registry = JobRegistry::new();
        registry.register("echo", |payload, _touch| async move {
            assert_eq!(payload, json!({"x": 1}));
            Ok(payload)
        });

        assert!(registry.is_registered("echo"));
        let result = registry
            .invoke("echo", json!({"x": 1}), noop_touch())
            .await
            .unwrap();
        assert_eq!(result, json!({"x": 1}));
    }

    #[tokio::test]
    async fn invoke_unknown_type_is_configuration_error() {
        let registry = JobRegistry::new();
        let err = registry
            .invoke("missing", Value::Null, noop_touch())
            .await
            .unwrap_err();
        assert_eq!(err.kind().as_code(), "E_CONFIGURATION");
    }

    #[test]
    fn registered_types_lists_all_handlers() {
        let mut registry = JobRegistry::new();
        registry.register("a", |_p, _t| async move { Ok(Value::Null) });
        registry.register("b", |_p, _t| async move { Ok(Value::Null) });
        let mut types = registry.registered_types();
        types.sort();
        assert_eq!(types, vec!["a", "b"]);
    }
}
