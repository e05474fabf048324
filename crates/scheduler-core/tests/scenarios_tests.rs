//! End-to-end tests driving a whole [`Engine`] through one lifecycle each:
//! a simple at-trigger, a retrying job, a misfire, a stalled run, a
//! concurrency cap, and a graceful shutdown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, Utc};
use scheduler_core::{
    BackoffStrategy, Clock, Engine, EngineConfig, EventBus, InMemoryStore, Job, ManualClock,
    MisfirePolicy, PlanSpec, RetryPolicy, RunStatus, SchedulerError, SchedulerEvent, Store,
    SystemClock, Trigger,
};
use serde_json::{json, Value};
use uuid::Uuid;

fn manual_engine(now: chrono::DateTime<Utc>) -> (Arc<Engine>, Arc<ManualClock>, Arc<dyn Store>) {
    let clock = Arc::new(ManualClock::new(now));
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let engine = Engine::builder(store.clone(), EventBus::new(), clock.clone() as Arc<dyn Clock>).build();
    (engine, clock, store)
}

fn manual_engine_with_config(
    now: chrono::DateTime<Utc>,
    config: EngineConfig,
) -> (Arc<Engine>, Arc<ManualClock>, Arc<dyn Store>) {
    let clock = Arc::new(ManualClock::new(now));
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let engine = Engine::builder(store.clone(), EventBus::new(), clock.clone() as Arc<dyn Clock>)
        .config(config)
        .build();
    (engine, clock, store)
}

async fn recv(rx: &mut tokio::sync::mpsc::Receiver<scheduler_core::EventPayload>) -> scheduler_core::EventPayload {
    tokio::time::timeout(StdDuration::from_secs(2), rx.recv())
        .await
        .expect("event did not arrive in time")
        .expect("event channel closed")
}

#[tokio::test]
async fn simple_at_trigger_runs_to_completion_and_drains() {
    let now = Utc::now();
    let (engine, clock, store) = manual_engine(now);

    let job = Job::new("answer", "demo:answer");
    let job_id = job.id;
    engine
        .register_job(job, |_payload, _touch| async move { Ok(json!(42)) })
        .await
        .unwrap();

    let (mut scheduled_rx, _s1) = engine.on(SchedulerEvent::Scheduled);
    let (mut run_rx, _s2) = engine.on(SchedulerEvent::Run);
    let (mut completed_rx, _s3) = engine.on(SchedulerEvent::Completed);
    let (mut drain_rx, _s4) = engine.on(SchedulerEvent::Drain);

    let run_at = now + ChronoDuration::milliseconds(10);
    let handle = engine
        .schedule(job_id, PlanSpec::At { run_at }, MisfirePolicy::Skip, 0, None)
        .await
        .unwrap();

    let scheduled = recv(&mut scheduled_rx).await;
    assert_eq!(scheduled.scheduled_at, Some(run_at));

    clock.advance(ChronoDuration::milliseconds(10));
    engine.tick_once().await.unwrap();

    let run_payload = recv(&mut run_rx).await;
    assert_eq!(run_payload.attempt, Some(1));
    let run_id = run_payload.run_id.expect("run event carries a run id");

    let completed = recv(&mut completed_rx).await;
    assert_eq!(completed.run_id, Some(run_id));
    assert_eq!(completed.result, Some(json!(42)));

    let drain = recv(&mut drain_rx).await;
    assert_eq!(drain.pending_runs, Some(0));

    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.result, Some(json!(42)));
    assert!(matches!(store.get_trigger(handle.id()).await, Err(SchedulerError::NotFound(_))));
}

#[tokio::test]
async fn retry_with_backoff_succeeds_on_third_attempt() {
    let now = Utc::now();
    let (engine, clock, store) = manual_engine(now);

    let attempts = Arc::new(AtomicU32::new(0));
    let job = Job::builder()
        .name("flaky")
        .job_type("demo:flaky")
        .retry_policy(Some(RetryPolicy {
            max_attempts: 3,
            initial_backoff: StdDuration::from_millis(100),
            max_backoff: StdDuration::from_secs(5),
            strategy: BackoffStrategy::Linear,
            backoff_multiplier: 1.0,
            jitter: false,
        }))
        .build();
    let job_id = job.id;
    let attempts_for_handler = attempts.clone();
    engine
        .register_job(job, move |_payload, _touch| {
            let attempts = attempts_for_handler.clone();
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < 3 {
                    Err(SchedulerError::State(format!("attempt {attempt} failed")))
                } else {
                    Ok(json!("ok"))
                }
            }
        })
        .await
        .unwrap();

    let (mut run_rx, _s1) = engine.on(SchedulerEvent::Run);
    let (mut retry_rx, _s2) = engine.on(SchedulerEvent::Retry);
    let (mut completed_rx, _s3) = engine.on(SchedulerEvent::Completed);

    engine
        .schedule(job_id, PlanSpec::At { run_at: now }, MisfirePolicy::Skip, 0, None)
        .await
        .unwrap();

    // attempt 1: fails, schedules a retry ~100ms out
    engine.tick_once().await.unwrap();
    let run1 = recv(&mut run_rx).await;
    assert_eq!(run1.attempt, Some(1));
    let retry1 = recv(&mut retry_rx).await;
    assert_eq!(retry1.attempt, Some(2));
    assert!(retry1.delay_ms.unwrap() > 0);

    clock.advance(ChronoDuration::milliseconds(200));
    engine.tick_once().await.unwrap();
    let run2 = recv(&mut run_rx).await;
    assert_eq!(run2.attempt, Some(2));
    let retry2 = recv(&mut retry_rx).await;
    assert_eq!(retry2.attempt, Some(3));
    // linear backoff (100ms * attempt) means attempt 3's delay exceeds attempt 2's
    assert!(retry2.delay_ms.unwrap() > retry1.delay_ms.unwrap());

    clock.advance(ChronoDuration::milliseconds(500));
    engine.tick_once().await.unwrap();
    let run3 = recv(&mut run_rx).await;
    assert_eq!(run3.attempt, Some(3));
    let completed = recv(&mut completed_rx).await;
    assert_eq!(completed.result, Some(json!("ok")));

    let trigger = store.get_trigger(handle_for_job(&store, job_id).await).await.unwrap();
    assert_eq!(trigger.failure_count, 0);
}

/// The test above needs the trigger id but only has the job id; look it up
/// through the store instead of threading the handle through every step.
async fn handle_for_job(store: &Arc<dyn Store>, job_id: Uuid) -> Uuid {
    store.list_triggers(job_id).await.unwrap()[0].id
}

#[tokio::test]
async fn misfire_skip_runs_once_at_the_in_tolerance_candidate() {
    let now = Utc::now();
    let config = EngineConfig::builder()
        .misfire_tolerance(StdDuration::from_millis(20))
        .build();
    let (engine, clock, store) = manual_engine_with_config(now, config);

    let job = Job::new("heartbeat", "demo:heartbeat");
    let job_id = job.id;
    engine
        .register_job(job, |_payload, _touch| async move { Ok(Value::Null) })
        .await
        .unwrap();

    let handle = engine
        .schedule(
            job_id,
            PlanSpec::Interval { anchor: now, period_ms: 50 },
            MisfirePolicy::Skip,
            0,
            None,
        )
        .await
        .unwrap();

    let (mut run_rx, _s1) = engine.on(SchedulerEvent::Run);
    let (mut scheduled_rx, _s2) = engine.on(SchedulerEvent::Scheduled);

    // Scheduler comes back online long after several 50ms occurrences have
    // passed. The first tick only advances the trigger past the missed
    // occurrences and reschedules it at the first in-tolerance candidate;
    // a second tick is what actually claims and runs it.
    clock.advance(ChronoDuration::milliseconds(500));
    engine.tick_once().await.unwrap();
    let scheduled = recv(&mut scheduled_rx).await;

    engine.tick_once().await.unwrap();
    let run = recv(&mut run_rx).await;
    assert_eq!(run.attempt, Some(1));
    assert_eq!(scheduled.run_id, run.run_id);

    let trigger = store.get_trigger(handle.id()).await.unwrap();
    // exactly one run fired for the whole stretch of missed occurrences
    assert_eq!(trigger.last_run_at.unwrap().timestamp_millis() % 50, 0);
}

#[tokio::test]
async fn stalled_run_is_marked_and_retried() {
    let now = Utc::now();
    let config = EngineConfig::builder()
        .stalled_after(StdDuration::from_millis(100))
        .build();
    let (engine, clock, store) = manual_engine_with_config(now, config);

    let job = Job::builder()
        .name("stuck")
        .job_type("demo:stuck")
        .retry_policy(Some(RetryPolicy {
            max_attempts: 2,
            initial_backoff: StdDuration::from_millis(50),
            max_backoff: StdDuration::from_secs(5),
            strategy: BackoffStrategy::Exponential,
            backoff_multiplier: 2.0,
            jitter: false,
        }))
        .build();
    engine
        .register_job(job.clone(), |_payload, _touch| async move {
            tokio::time::sleep(StdDuration::from_secs(3600)).await;
            Ok(Value::Null)
        })
        .await
        .unwrap();

    let run_id = Uuid::new_v4();
    let trigger = Trigger::builder()
        .job_id(job.id)
        .plan_spec(PlanSpec::Interval { anchor: now, period_ms: 3_600_000 })
        .next_run_at(Some(now))
        .next_run_id(Some(run_id))
        .build();
    store.put_trigger(trigger.clone()).await.unwrap();

    let run = scheduler_core::Run::builder()
        .id(run_id)
        .trigger_id(trigger.id)
        .job_id(job.id)
        .scheduled_at(now)
        .started_at(Some(now))
        .heartbeat_at(Some(now))
        .build();
    store.create_run(run).await.unwrap();

    let (mut stalled_rx, _s1) = engine.on(SchedulerEvent::Stalled);
    let (mut retry_rx, _s2) = engine.on(SchedulerEvent::Retry);

    clock.advance(ChronoDuration::milliseconds(150));
    let handled = engine.check_stalled().await.unwrap();
    assert_eq!(handled, 1);

    let stalled = recv(&mut stalled_rx).await;
    assert_eq!(stalled.run_id, Some(run_id));

    let retry = recv(&mut retry_rx).await;
    assert_eq!(retry.attempt, Some(2));

    let stored_run = store.get_run(run_id).await.unwrap();
    assert_eq!(stored_run.status, RunStatus::Stalled);

    let stored_trigger = store.get_trigger(trigger.id).await.unwrap();
    assert_eq!(stored_trigger.failure_count, 1);
}

#[tokio::test]
async fn global_concurrency_cap_serializes_two_due_runs() {
    let config = EngineConfig::builder()
        .max_concurrent_runs(Some(1))
        .build();
    let bus = EventBus::new();
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let engine = Engine::builder(store.clone(), bus.clone(), Arc::new(SystemClock))
        .config(config)
        .build();

    let job_a = Job::new("a", "demo:a");
    let job_b = Job::new("b", "demo:b");
    let job_a_id = job_a.id;
    let job_b_id = job_b.id;
    engine
        .register_job(job_a, |_payload, _touch| async move {
            tokio::time::sleep(StdDuration::from_millis(100)).await;
            Ok(Value::Null)
        })
        .await
        .unwrap();
    engine
        .register_job(job_b, |_payload, _touch| async move {
            tokio::time::sleep(StdDuration::from_millis(100)).await;
            Ok(Value::Null)
        })
        .await
        .unwrap();

    let now = Utc::now();
    engine
        .schedule(job_a_id, PlanSpec::At { run_at: now }, MisfirePolicy::Skip, 0, None)
        .await
        .unwrap();
    engine
        .schedule(job_b_id, PlanSpec::At { run_at: now }, MisfirePolicy::Skip, 0, None)
        .await
        .unwrap();

    let (mut run_rx, _s1) = engine.on(SchedulerEvent::Run);
    let (mut completed_rx, _s2) = engine.on(SchedulerEvent::Completed);

    let start = tokio::time::Instant::now();
    engine.tick_once().await.unwrap();

    let first_run = recv(&mut run_rx).await;
    let first_completed = recv(&mut completed_rx).await;
    assert_eq!(first_completed.run_id, first_run.run_id);
    let gap_before_second = start.elapsed();

    let second_run = recv(&mut run_rx).await;
    assert_ne!(second_run.run_id, first_run.run_id);
    let second_completed = recv(&mut completed_rx).await;
    assert_eq!(second_completed.run_id, second_run.run_id);

    // Run B could only start once A's 100ms handler finished and released
    // the single global permit.
    assert!(gap_before_second >= StdDuration::from_millis(80));
}

#[tokio::test]
async fn graceful_shutdown_returns_within_the_grace_period() {
    let bus = EventBus::new();
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let engine = Engine::builder(store.clone(), bus.clone(), Arc::new(SystemClock)).build();

    let job = Job::new("slow", "demo:slow");
    let job_id = job.id;
    engine
        .register_job(job, |_payload, _touch| async move {
            tokio::time::sleep(StdDuration::from_millis(200)).await;
            Ok(json!("done"))
        })
        .await
        .unwrap();

    engine
        .schedule(job_id, PlanSpec::At { run_at: Utc::now() }, MisfirePolicy::Skip, 0, None)
        .await
        .unwrap();

    let (mut run_rx, _s1) = engine.on(SchedulerEvent::Run);
    let (mut shutdown_rx, _s2) = engine.on(SchedulerEvent::Shutdown);
    engine.tick_once().await.unwrap();
    let run_payload = recv(&mut run_rx).await;
    let run_id = run_payload.run_id.unwrap();

    let start = tokio::time::Instant::now();
    engine.shutdown(true, Some(StdDuration::from_millis(50))).await;
    let elapsed = start.elapsed();

    let shutdown_event = recv(&mut shutdown_rx).await;
    assert_eq!(shutdown_event.graceful, Some(true));
    assert!(elapsed < StdDuration::from_millis(150), "shutdown should return near the grace period, took {elapsed:?}");

    // The in-flight handler keeps running past the grace period and its
    // outcome is still persisted once it finishes.
    tokio::time::sleep(StdDuration::from_millis(250)).await;
    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.result, Some(json!("done")));
}
