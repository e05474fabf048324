//! Demo job handlers and event-bus printing for the `latchwork` binary.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use console::style;
use scheduler_core::{
    BackoffStrategy, Engine, EventBus, Job, MisfirePolicy, PlanSpec, RetryPolicy, SchedulerError,
    SchedulerEvent, Unsubscribe,
};
use serde_json::{json, Value};

/// A single one-shot job used by the `demo` subcommand.
pub fn hello_world_job() -> Job {
    Job::new("hello-world", "demo:hello-world")
}

pub async fn hello_world_handler(
    _payload: Value,
    _touch: scheduler_core::registry::Touch,
) -> Result<Value, SchedulerError> {
    Ok(json!({"message": "hello from latchwork"}))
}

/// Register the jobs `run` keeps alive between ticks: a steady heartbeat
/// job that reports progress, and a flaky job that fails on its first two
/// attempts before succeeding, to show the retry path.
pub async fn register_demo_jobs(engine: &Arc<Engine>) -> Result<()> {
    let heartbeat = Job::builder()
        .name("heartbeat")
        .job_type("demo:heartbeat")
        .default_timeout(Duration::from_secs(5))
        .build();
    let heartbeat_id = heartbeat.id;
    engine
        .register_job(heartbeat, |_payload, touch| async move {
            for pct in [25u8, 50, 75, 100] {
                tokio::time::sleep(Duration::from_millis(150)).await;
                touch(Some(pct)).await?;
            }
            Ok(json!({"beats": 4}))
        })
        .await?;
    engine
        .schedule(
            heartbeat_id,
            PlanSpec::Interval {
                anchor: chrono::Utc::now(),
                period_ms: 2_000,
            },
            MisfirePolicy::Skip,
            0,
            None,
        )
        .await?;

    let attempts = Arc::new(AtomicU32::new(0));
    let flaky = Job::builder()
        .name("flaky")
        .job_type("demo:flaky")
        .retry_policy(Some(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_secs(5),
            strategy: BackoffStrategy::Exponential,
            backoff_multiplier: 2.0,
            jitter: false,
        }))
        .build();
    let flaky_id = flaky.id;
    engine
        .register_job(flaky, move |_payload, _touch| {
            let attempts = attempts.clone();
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < 3 {
                    Err(SchedulerError::State(format!("simulated failure on attempt {attempt}")))
                } else {
                    Ok(json!({"attempt": attempt}))
                }
            }
        })
        .await?;
    engine
        .schedule(
            flaky_id,
            PlanSpec::Interval {
                anchor: chrono::Utc::now(),
                period_ms: 10_000,
            },
            MisfirePolicy::Skip,
            0,
            None,
        )
        .await?;

    Ok(())
}

/// Subscribe to every lifecycle event and print a one-line summary of each
/// as it arrives. Returned handles must be kept alive for the duration of
/// the demo; dropping them unsubscribes.
pub fn subscribe_and_print(bus: &EventBus) -> Vec<(tokio::task::JoinHandle<()>, Unsubscribe)> {
    const EVENTS: &[SchedulerEvent] = &[
        SchedulerEvent::Scheduled,
        SchedulerEvent::Run,
        SchedulerEvent::Progress,
        SchedulerEvent::Completed,
        SchedulerEvent::Error,
        SchedulerEvent::Retry,
        SchedulerEvent::Stalled,
        SchedulerEvent::Canceled,
        SchedulerEvent::Paused,
        SchedulerEvent::Resumed,
        SchedulerEvent::Drain,
        SchedulerEvent::Shutdown,
    ];

    EVENTS
        .iter()
        .map(|event| {
            let (mut rx, unsub) = bus.on(*event);
            let name = event.name();
            let handle = tokio::spawn(async move {
                while let Some(payload) = rx.recv().await {
                    println!(
                        "{} {}",
                        style(format!("[{name}]")).bold().magenta(),
                        summarize(&payload)
                    );
                }
            });
            (handle, unsub)
        })
        .collect()
}

fn summarize(payload: &scheduler_core::EventPayload) -> String {
    let mut parts = Vec::new();
    if let Some(job) = &payload.job {
        parts.push(format!("job={job}"));
    }
    if let Some(run_id) = payload.run_id {
        parts.push(format!("run={run_id}"));
    }
    if let Some(attempt) = payload.attempt {
        parts.push(format!("attempt={attempt}"));
    }
    if let Some(progress) = payload.progress {
        parts.push(format!("progress={progress}%"));
    }
    if let Some(result) = &payload.result {
        parts.push(format!("result={result}"));
    }
    if let Some(error) = &payload.error {
        parts.push(format!("error={error}"));
    }
    parts.join(" ")
}
