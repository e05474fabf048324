//! Orchestration: bootstrap, tick loop, claim→run→reschedule, stalled
//! monitor, pause/resume, graceful shutdown.
//!
//! Built around a `JobRunner::run`/`run_until_shutdown`-style poll loop:
//! an `Arc<AtomicBool>` shutdown flag checked each iteration, plus a spawned
//! `ctrl_c` listener in the CLI demo. That single flat poll loop is
//! generalized here into the richer multi-phase tick this crate's scheduler
//! requires. One tick:
//!
//! 1. snapshot `now` from the [`Clock`]
//! 2. ask the [`Store`] for due triggers, most urgent first
//! 3. claim each (optimistic-concurrency guarded) and spawn its processing
//! 4. inside each spawned task: evaluate misfire policy, acquire capacity in
//!    a fixed order, invoke the handler via [`Runner`], record the outcome,
//!    evaluate retry, and compute the next fire time via the trigger's
//!    [`Plan`]
//!
//! A second, independently-timed loop (`check_stalled`) sweeps the store for
//! runs whose heartbeat has gone silent and resolves them the same way a
//! failed run would be resolved, guarded against double-handling by
//! `handled_runs` — a run id that loop has claimed is a run id the tick path
//! must not also try to reschedule.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::{DashMap, DashSet};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::bus::{EventBus, EventPayload, PauseScope, SchedulerEvent, Unsubscribe};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{classify_scheduler_error, FailureKind, SchedulerError};
use crate::model::{
    BackoffStrategy, Job, MisfirePolicy, PlanSpec, Priority, RetryPolicy, Run, RunStatus, Trigger,
};
use crate::plan::{build_plan, Plan};
use crate::registry::{JobRegistry, Touch};
use crate::runner::Runner;
use crate::semaphore::CapacityGate;
use crate::store::Store;
use crate::token_bucket::TokenBucket;

/// Plans are opaque and not always serializable (a caller-supplied cron-like
/// [`Plan`] has no [`PlanSpec`] representation), so the engine, not the
/// store, holds the live object for each trigger it schedules, rebuilding it
/// from `trigger.plan_spec` whenever the cache has been evicted or never
/// populated (e.g. right after hydrating from the store).
type PlanMap = DashMap<Uuid, Arc<dyn Plan>>;

/// Permits held for the lifetime of one run, released in reverse acquisition
/// order. Field declaration order here is acquisition order reversed — Rust
/// drops struct fields top to bottom, so the per-job permit (acquired last)
/// is released first, then the global permit.
struct CapacityPermits {
    job: Option<OwnedSemaphorePermit>,
    global: Option<OwnedSemaphorePermit>,
}

/// Outcome of evaluating the retry rule for one failed attempt.
enum RetryDecision {
    /// The job carries no retry policy at all; `failure_count` is left as
    /// the caller already incremented it.
    NoPolicy,
    /// A policy exists but its attempt budget is spent; `failure_count`
    /// resets to zero.
    Exhausted,
    /// Schedule another attempt after `delay`.
    Retry {
        next_run_at: DateTime<Utc>,
        delay: ChronoDuration,
    },
}

pub struct Engine {
    store: Arc<dyn Store>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    registry: RwLock<JobRegistry>,
    config: EngineConfig,
    global_capacity: Option<Arc<CapacityGate>>,
    global_bucket: Option<Arc<TokenBucket>>,
    job_capacity: DashMap<Uuid, Arc<CapacityGate>>,
    job_bucket: DashMap<Uuid, Arc<TokenBucket>>,
    plans: PlanMap,
    /// Run ids the stalled monitor has already resolved; the tick path
    /// checks this after a handler returns so it never double-reschedules a
    /// run the monitor declared dead out from under it.
    handled_runs: DashSet<Uuid>,
    release_thunks: DashMap<Uuid, CapacityPermits>,
    scheduler_paused: AtomicBool,
    shutting_down: AtomicBool,
    in_flight: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(store: Arc<dyn Store>, bus: EventBus, clock: Arc<dyn Clock>) -> EngineBuilder {
        EngineBuilder {
            store,
            bus,
            clock,
            config: EngineConfig::default(),
        }
    }

    /// Run the store's `init` once before any other operation. Idempotent.
    pub async fn bootstrap(&self) -> Result<(), SchedulerError> {
        if let Some(rate_limit) = self.config.global_rate_limit {
            rate_limit.validate()?;
        }
        self.store.init().await
    }

    /// Register a job type and its handler, upserting the job definition.
    /// The handler receives the run's JSON payload and a `touch`
    /// heartbeat-plus-progress callback.
    pub async fn register_job<F, Fut>(
        self: &Arc<Self>,
        job: Job,
        handler: F,
    ) -> Result<JobHandle, SchedulerError>
    where
        F: Fn(Value, Touch) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, SchedulerError>> + Send + 'static,
    {
        if let Some(rate_limit) = job.rate_limit {
            rate_limit.validate()?;
        }
        // Job types are registered once at startup and live for the process,
        // but arrive here as owned Strings; promote to 'static so the
        // registry's keys can stay &'static str. One leak per distinct job
        // type.
        let job_type = Box::leak(job.job_type.clone().into_boxed_str()) as &'static str;
        let job_id = job.id;
        self.store.put_job(job).await?;
        self.registry.write().await.register(job_type, handler);
        Ok(JobHandle {
            job_id,
            engine: self.clone(),
        })
    }

    /// Schedule `job_id` on the fire-time plan described by `plan_spec`.
    /// `idempotency_key`, if given, both names the resulting trigger and
    /// makes the call idempotent: scheduling again with the same key
    /// replaces that trigger's plan/policy/priority in place rather than
    /// creating a duplicate.
    pub async fn schedule(
        self: &Arc<Self>,
        job_id: Uuid,
        plan_spec: PlanSpec,
        misfire_policy: MisfirePolicy,
        priority: Priority,
        idempotency_key: Option<Uuid>,
    ) -> Result<TriggerHandle, SchedulerError> {
        let plan = build_plan(&plan_spec);
        self.schedule_with_plan(job_id, plan, plan_spec, misfire_policy, priority, idempotency_key)
            .await
    }

    /// As [`Self::schedule`], but takes an already-constructed [`Plan`]
    /// directly — the extension point for plan kinds `PlanSpec` can't
    /// represent (e.g. a caller-supplied cron planner). Cron parsing itself
    /// is out of scope for this crate; `plan_spec` is still required here so
    /// the engine can rebuild *some* plan after a restart, so callers using
    /// a genuinely custom `Plan` should pick the `PlanSpec` variant that
    /// best approximates their schedule for rebuild purposes.
    pub async fn schedule_with_plan(
        self: &Arc<Self>,
        job_id: Uuid,
        plan: Arc<dyn Plan>,
        plan_spec: PlanSpec,
        misfire_policy: MisfirePolicy,
        priority: Priority,
        idempotency_key: Option<Uuid>,
    ) -> Result<TriggerHandle, SchedulerError> {
        self.store.get_job(job_id).await?;
        let now = self.clock.now();
        let next_run_at = plan.next_fire_after(now).ok_or_else(|| {
            SchedulerError::State("plan produced no first fire instant".to_string())
        })?;
        let next_run_id = Uuid::new_v4();

        let existing = match idempotency_key {
            Some(id) => self.store.get_trigger(id).await.ok(),
            None => None,
        };

        let trigger = match existing {
            Some(mut trigger) => {
                let expected_revision = trigger.revision;
                trigger.plan_spec = plan_spec;
                trigger.misfire_policy = misfire_policy;
                trigger.priority = priority;
                trigger.next_run_at = Some(next_run_at);
                trigger.next_run_id = Some(next_run_id);
                trigger.clear_lease();
                self.store.upsert_trigger(trigger, expected_revision).await?
            }
            None => {
                let trigger = Trigger::builder()
                    .id(idempotency_key.unwrap_or_else(Uuid::new_v4))
                    .job_id(job_id)
                    .plan_spec(plan_spec)
                    .misfire_policy(misfire_policy)
                    .priority(priority)
                    .next_run_at(Some(next_run_at))
                    .next_run_id(Some(next_run_id))
                    .build();
                self.store.put_trigger(trigger.clone()).await?;
                trigger
            }
        };

        self.plans.insert(trigger.id, plan);

        let job = self.store.get_job(job_id).await?;
        self.bus.emit(
            SchedulerEvent::Scheduled,
            EventPayload::new()
                .at(now)
                .with_trigger(trigger.id)
                .with_job(job.name)
                .with_run(next_run_id),
        );

        Ok(TriggerHandle {
            trigger_id: trigger.id,
            engine: self.clone(),
        })
    }

    /// Synthesize and immediately process a one-shot trigger, independent of
    /// any existing schedule for `job_id`. `run_at_override`, if given, is
    /// clamped forward to `now` if it names a past instant. Returns the
    /// synthesized trigger id and the run id once the run has been enqueued.
    pub async fn execute_now(
        self: &Arc<Self>,
        job_id: Uuid,
        run_at_override: Option<DateTime<Utc>>,
    ) -> Result<(Uuid, Uuid), SchedulerError> {
        self.store.get_job(job_id).await?;
        let now = self.clock.now();
        let run_at = run_at_override.unwrap_or(now).max(now);
        let next_run_id = Uuid::new_v4();

        let plan_spec = PlanSpec::At { run_at };
        let plan = build_plan(&plan_spec);
        let trigger = Trigger::builder()
            .job_id(job_id)
            .plan_spec(plan_spec)
            .next_run_at(Some(run_at))
            .next_run_id(Some(next_run_id))
            .build();

        self.plans.insert(trigger.id, plan);
        self.store.put_trigger(trigger.clone()).await?;

        let job = self.store.get_job(job_id).await?;
        self.bus.emit(
            SchedulerEvent::Scheduled,
            EventPayload::new()
                .at(now)
                .with_trigger(trigger.id)
                .with_job(job.name)
                .with_run(next_run_id),
        );

        self.process_due_trigger(trigger.id).await?;
        Ok((trigger.id, next_run_id))
    }

    /// Flip the scheduler-wide pause flag: while set, [`Self::tick_once`]
    /// returns immediately without claiming anything. Distinct from pausing
    /// an individual job or trigger.
    pub fn pause_all(&self) {
        self.scheduler_paused.store(true, Ordering::SeqCst);
        self.bus.emit(
            SchedulerEvent::Paused,
            EventPayload::new().at(self.clock.now()),
        );
    }

    pub fn resume_all(&self) {
        self.scheduler_paused.store(false, Ordering::SeqCst);
        self.bus.emit(
            SchedulerEvent::Resumed,
            EventPayload::new().at(self.clock.now()),
        );
    }

    pub fn on(&self, event: SchedulerEvent) -> (mpsc::Receiver<EventPayload>, Unsubscribe) {
        self.bus.on(event)
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Run, SchedulerError> {
        self.store.get_run(run_id).await
    }

    /// Run one tick synchronously; exposed so tests can step the engine
    /// without racing a background `tokio::time::sleep`. Returns the number
    /// of due triggers whose processing was spawned (not the number that
    /// ultimately ran — a claim can still lose the race to another worker).
    pub async fn tick_once(self: &Arc<Self>) -> Result<usize, SchedulerError> {
        if self.shutting_down.load(Ordering::SeqCst) || self.scheduler_paused.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let now = self.clock.now();
        let due = self.store.due_triggers(now, self.config.batch_size).await?;
        tracing::debug!(scheduler_id = %self.config.scheduler_id, due_count = due.len(), %now, "evaluating due triggers");

        let mut spawned = 0usize;
        for trigger in due {
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            let engine = self.clone();
            let id = trigger.id;
            let handle = tokio::spawn(
                async move {
                    if let Err(err) = engine.process_due_trigger(id).await {
                        tracing::warn!(error = %err, trigger_id = %id, "trigger processing failed");
                    }
                }
                .instrument(tracing::info_span!("run", trigger_id = %id)),
            );
            self.in_flight.lock().await.push(handle);
            spawned += 1;
        }
        Ok(spawned)
    }

    fn plan_for(&self, trigger: &Trigger) -> Arc<dyn Plan> {
        self.plans
            .entry(trigger.id)
            .or_insert_with(|| build_plan(&trigger.plan_spec))
            .clone()
    }

    /// Claim, evaluate misfire policy, run, and reschedule a single due
    /// trigger. The numbered comments below walk the steps in order.
    async fn process_due_trigger(self: &Arc<Self>, trigger_id: Uuid) -> Result<(), SchedulerError> {
        let now = self.clock.now();

        // 1. claim
        let claimed = match self
            .store
            .claim_trigger(trigger_id, &self.config.scheduler_id, self.config.lease, now)
            .await
        {
            Ok(t) => t,
            Err(_) => return Ok(()),
        };

        // 2. fetch plan and job
        let plan = self.plan_for(&claimed);
        let job = match self.store.get_job(claimed.job_id).await {
            Ok(job) => job,
            Err(err) => {
                tracing::warn!(error = %err, trigger_id = %trigger_id, "job missing for trigger, releasing lease");
                let _ = self.store.release_trigger(claimed.id, claimed.revision).await;
                return Ok(());
            }
        };

        let due_at = match claimed.next_run_at {
            Some(at) => at,
            None => {
                let _ = self.store.release_trigger(claimed.id, claimed.revision).await;
                return Ok(());
            }
        };

        // 3. misfire evaluation
        let lateness = now.signed_duration_since(due_at);
        let tolerance = to_chrono(self.config.misfire_tolerance);
        let mut fire_now_misfire = false;
        let scheduled_at = if lateness <= tolerance {
            due_at
        } else {
            match claimed.misfire_policy {
                MisfirePolicy::Skip => {
                    let max_iter = self.config.max_misfire_skip;
                    let advanced = advance_while(&*plan, due_at, max_iter, |candidate| {
                        candidate <= now && now.signed_duration_since(candidate) > tolerance
                    });
                    match advanced {
                        Some((next_fire, skipped)) => {
                            // `due_at` itself never reaches `should_skip` (the loop
                            // asks the plan for the candidate *after* it), so the
                            // abandoned original instant is one more than the count
                            // `advance_while` returns.
                            let skipped_occurrences = skipped + 1;
                            tracing::info!(
                                trigger_id = %claimed.id,
                                job = %job.name,
                                skipped_occurrences,
                                "misfire skip: dropped occurrences before rescheduling"
                            );
                            let next_run_id = Uuid::new_v4();
                            let mut updated = claimed.clone();
                            updated.next_run_at = Some(next_fire);
                            updated.next_run_id = Some(next_run_id);
                            updated.clear_lease();
                            self.store.upsert_trigger(updated, claimed.revision).await?;
                            self.bus.emit(
                                SchedulerEvent::Scheduled,
                                EventPayload::new()
                                    .at(now)
                                    .with_trigger(claimed.id)
                                    .with_job(job.name.clone())
                                    .with_run(next_run_id)
                                    .also(|p| p.scheduled_at = Some(next_fire)),
                            );
                        }
                        None => {
                            self.store.delete_trigger(claimed.id).await.ok();
                            self.plans.remove(&claimed.id);
                            self.bus.emit(
                                SchedulerEvent::Drain,
                                EventPayload::new().at(now).also(|p| p.pending_runs = Some(0)),
                            );
                        }
                    }
                    return Ok(());
                }
                MisfirePolicy::FireNow => {
                    fire_now_misfire = true;
                    due_at
                }
                MisfirePolicy::CatchUp => due_at,
            }
        };

        // 4. acquire capacity, start the run
        let run_id = claimed.next_run_id.unwrap_or_else(Uuid::new_v4);
        let permits = self.acquire_capacity(&job).await;
        self.release_thunks.insert(run_id, permits);

        let attempt = claimed.failure_count + 1;
        let started_at = self.clock.now();
        let run = Run::builder()
            .id(run_id)
            .trigger_id(claimed.id)
            .job_id(job.id)
            .attempt(attempt)
            .scheduled_at(scheduled_at)
            .started_at(Some(started_at))
            .heartbeat_at(Some(started_at))
            .build();
        self.store.create_run(run.clone()).await?;
        tracing::info!(job = %job.name, %run_id, trigger_id = %claimed.id, attempt, "run started");
        self.bus.emit(
            SchedulerEvent::Run,
            EventPayload::new()
                .at(started_at)
                .with_trigger(claimed.id)
                .with_job(job.name.clone())
                .with_run(run_id)
                .also(|p| {
                    p.attempt = Some(attempt);
                    p.scheduled_at = Some(scheduled_at);
                    p.started_at = Some(started_at);
                }),
        );

        let touch = self.build_touch(run_id, claimed.id, job.name.clone());

        // 5. invoke
        let outcome = Runner::invoke(
            &*self.registry.read().await,
            &job.job_type,
            Value::Null,
            touch,
            job.effective_timeout(),
        )
        .await;

        let finished_at = self.clock.now();
        let mut finished_run = run.clone();
        finished_run.ended_at = Some(finished_at);

        let mut next_failure_count = claimed.failure_count;
        let outcome_is_err = outcome.is_err();
        let mut failure_kind = FailureKind::Retryable;

        match outcome {
            Ok(result) => {
                finished_run.status = RunStatus::Completed;
                finished_run.result = Some(result.clone());
                self.store.update_run(finished_run.clone()).await?;
                tracing::info!(job = %job.name, %run_id, attempt, "run completed");
                self.bus.emit(
                    SchedulerEvent::Completed,
                    EventPayload::new()
                        .at(finished_at)
                        .with_trigger(claimed.id)
                        .with_job(job.name.clone())
                        .with_run(run_id)
                        .also(|p| {
                            p.attempt = Some(attempt);
                            p.scheduled_at = Some(scheduled_at);
                            p.completed_at = Some(finished_at);
                            p.result = Some(result);
                        }),
                );
                next_failure_count = 0;
            }
            Err(err) => {
                finished_run.status = RunStatus::Failed;
                let error_value = json!(err.to_string());
                finished_run.error = Some(error_value.clone());
                self.store.update_run(finished_run.clone()).await?;
                self.bus.emit(
                    SchedulerEvent::Error,
                    EventPayload::new()
                        .at(finished_at)
                        .with_trigger(claimed.id)
                        .with_job(job.name.clone())
                        .with_run(run_id)
                        .also(|p| {
                            p.attempt = Some(attempt);
                            p.error = Some(error_value);
                        }),
                );
                next_failure_count = claimed.failure_count + 1;

                failure_kind = classify_scheduler_error(&err);
            }
        }

        // release capacity
        if let Some(permits) = self.release_thunks.remove(&run_id) {
            drop(permits.1);
        }

        // 6. if the stalled monitor already resolved this run, step aside.
        if self.handled_runs.remove(&run_id).is_some() {
            return Ok(());
        }

        // 7. retry evaluation for failures. A non-retryable error (per
        // FailureKind classification) skips straight to "exhausted" —
        // dead-letter immediately regardless of remaining attempt budget.
        if outcome_is_err {
            let decision = if failure_kind.should_retry() {
                self.evaluate_retry(job.retry_policy, attempt, finished_at)
            } else {
                RetryDecision::Exhausted
            };
            match decision {
                RetryDecision::Retry { next_run_at, delay } => {
                    let next_run_id = Uuid::new_v4();
                    self.bus.emit(
                        SchedulerEvent::Retry,
                        EventPayload::new()
                            .at(finished_at)
                            .with_trigger(claimed.id)
                            .with_job(job.name.clone())
                            .with_run(next_run_id)
                            .also(|p| {
                                p.attempt = Some(attempt + 1);
                                p.delay_ms = Some(delay.num_milliseconds());
                            }),
                    );
                    self.bus.emit(
                        SchedulerEvent::Scheduled,
                        EventPayload::new()
                            .at(finished_at)
                            .with_trigger(claimed.id)
                            .with_job(job.name.clone())
                            .with_run(next_run_id)
                            .also(|p| p.scheduled_at = Some(next_run_at)),
                    );

                    let mut updated = claimed.clone();
                    updated.last_run_at = Some(scheduled_at);
                    updated.failure_count = next_failure_count;
                    updated.next_run_at = Some(next_run_at);
                    updated.next_run_id = Some(next_run_id);
                    updated.clear_lease();
                    self.store.upsert_trigger(updated, claimed.revision).await?;
                    return Ok(());
                }
                RetryDecision::Exhausted => next_failure_count = 0,
                RetryDecision::NoPolicy => {}
            }
        }

        // 8. advance the plan
        let next = if fire_now_misfire {
            advance_while(&*plan, scheduled_at, self.config.max_misfire_skip, |candidate| {
                candidate <= now
            })
            .map(|(at, _)| at)
        } else {
            plan.next_fire_after(scheduled_at)
        };

        let mut updated = claimed.clone();
        updated.last_run_at = Some(scheduled_at);
        updated.failure_count = next_failure_count;
        updated.clear_lease();

        match next {
            Some(next_run_at) => {
                let next_run_id = Uuid::new_v4();
                updated.next_run_at = Some(next_run_at);
                updated.next_run_id = Some(next_run_id);
                self.store.upsert_trigger(updated, claimed.revision).await?;
                self.bus.emit(
                    SchedulerEvent::Scheduled,
                    EventPayload::new()
                        .at(finished_at)
                        .with_trigger(claimed.id)
                        .with_job(job.name)
                        .with_run(next_run_id)
                        .also(|p| p.scheduled_at = Some(next_run_at)),
                );
            }
            None => {
                self.store.delete_trigger(claimed.id).await.ok();
                self.plans.remove(&claimed.id);
                self.bus.emit(
                    SchedulerEvent::Drain,
                    EventPayload::new().at(finished_at).also(|p| p.pending_runs = Some(0)),
                );
            }
        }

        Ok(())
    }

    /// Evaluate the retry rule against the attempt that just failed. A job
    /// with no retry policy at all is distinct from one whose policy is
    /// exhausted: only the latter zeroes `failure_count` (zeroing only
    /// happens under "attempt >= max", not under "no policy").
    fn evaluate_retry(
        &self,
        policy: Option<RetryPolicy>,
        attempt: u32,
        after: DateTime<Utc>,
    ) -> RetryDecision {
        let Some(policy) = policy else {
            return RetryDecision::NoPolicy;
        };
        let max = policy.max_attempts.max(1);
        if attempt >= max {
            return RetryDecision::Exhausted;
        }
        let delay = to_chrono(policy.backoff_for_attempt(attempt + 1));
        RetryDecision::Retry {
            next_run_at: after + delay,
            delay,
        }
    }

    async fn acquire_capacity(&self, job: &Job) -> CapacityPermits {
        let global = match &self.global_capacity {
            Some(gate) => Some(gate.acquire_owned().await.expect("global semaphore never closes")),
            None => None,
        };
        let job_gate = job.max_concurrent_runs.map(|limit| {
            self.job_capacity
                .entry(job.id)
                .or_insert_with(|| Arc::new(CapacityGate::new(job.name.clone(), limit)))
                .clone()
        });
        let job_permit = match job_gate {
            Some(gate) => Some(gate.acquire_owned().await.expect("job semaphore never closes")),
            None => None,
        };
        if let Some(bucket) = &self.global_bucket {
            bucket.acquire(1).await;
        }
        if let Some(cfg) = job.rate_limit {
            let bucket = self
                .job_bucket
                .entry(job.id)
                .or_insert_with(|| {
                    Arc::new(TokenBucket::new(cfg.capacity, cfg.refill_rate, cfg.refill_interval, cfg.burst))
                })
                .clone();
            bucket.acquire(1).await;
        }
        CapacityPermits {
            job: job_permit,
            global,
        }
    }

    fn build_touch(&self, run_id: Uuid, trigger_id: Uuid, job_name: String) -> Touch {
        let store = self.store.clone();
        let bus = self.bus.clone();
        let clock = self.clock.clone();
        let last_progress: Arc<AsyncMutex<Option<u8>>> = Arc::new(AsyncMutex::new(None));
        Arc::new(move |progress| {
            let store = store.clone();
            let bus = bus.clone();
            let clock = clock.clone();
            let last_progress = last_progress.clone();
            let job_name = job_name.clone();
            Box::pin(async move {
                if let Some(p) = progress {
                    if p > 100 {
                        return Err(SchedulerError::Configuration(format!(
                            "progress {p} out of range 0..=100"
                        )));
                    }
                    let mut guard = last_progress.lock().await;
                    if let Some(prev) = *guard {
                        if p < prev {
                            return Err(SchedulerError::State(format!(
                                "progress decreased from {prev} to {p}"
                            )));
                        }
                    }
                    *guard = Some(p);
                }
                let now = clock.now();
                store.touch_run(run_id, progress, now).await?;
                if let Some(p) = progress {
                    bus.emit(
                        SchedulerEvent::Progress,
                        EventPayload::new()
                            .at(now)
                            .with_trigger(trigger_id)
                            .with_job(job_name)
                            .with_run(run_id)
                            .also(|payload| payload.progress = Some(p)),
                    );
                }
                Ok(())
            })
        })
    }

    /// Scan for runs whose heartbeat has gone silent and resolve each the
    /// same way a failed run would be: mark stalled, release capacity,
    /// evaluate retry, and either schedule a retry or advance the plan.
    pub async fn check_stalled(self: &Arc<Self>) -> Result<usize, SchedulerError> {
        let now = self.clock.now();
        let threshold = now - to_chrono(self.config.stalled_after);
        let stalled = self.store.find_stalled_runs(threshold).await?;

        let mut handled = 0usize;
        for run in stalled {
            if !self.handled_runs.insert(run.id) {
                continue;
            }

            let last_heartbeat_at = run.heartbeat_at.or(run.started_at);
            let mut ended = run.clone();
            ended.status = RunStatus::Stalled;
            ended.ended_at = Some(now);
            self.store.update_run(ended).await?;

            if let Some(permits) = self.release_thunks.remove(&run.id) {
                drop(permits.1);
            }

            let job = self.store.get_job(run.job_id).await.ok();
            let job_name = job.as_ref().map(|j| j.name.clone()).unwrap_or_default();
            self.bus.emit(
                SchedulerEvent::Stalled,
                EventPayload::new()
                    .at(now)
                    .with_trigger(run.trigger_id)
                    .with_job(job_name.clone())
                    .with_run(run.id)
                    .also(|p| p.last_heartbeat_at = last_heartbeat_at),
            );

            let Ok(trigger) = self.store.get_trigger(run.trigger_id).await else {
                handled += 1;
                continue;
            };
            let retry_policy = job.and_then(|j| j.retry_policy);

            match self.evaluate_retry(retry_policy, run.attempt, now) {
                RetryDecision::Retry { next_run_at, delay } => {
                    let next_run_id = Uuid::new_v4();
                    self.bus.emit(
                        SchedulerEvent::Retry,
                        EventPayload::new()
                            .at(now)
                            .with_trigger(trigger.id)
                            .with_job(job_name.clone())
                            .with_run(next_run_id)
                            .also(|p| {
                                p.attempt = Some(run.attempt + 1);
                                p.delay_ms = Some(delay.num_milliseconds());
                            }),
                    );
                    self.bus.emit(
                        SchedulerEvent::Scheduled,
                        EventPayload::new()
                            .at(now)
                            .with_trigger(trigger.id)
                            .with_job(job_name)
                            .with_run(next_run_id)
                            .also(|p| p.scheduled_at = Some(next_run_at)),
                    );

                    let mut updated = trigger.clone();
                    updated.last_run_at = Some(run.scheduled_at);
                    updated.failure_count = trigger.failure_count + 1;
                    updated.next_run_at = Some(next_run_at);
                    updated.next_run_id = Some(next_run_id);
                    updated.clear_lease();
                    self.store.upsert_trigger(updated, trigger.revision).await?;
                }
                // Exhausted zeroes failure_count; NoPolicy leaves it incremented —
                // same distinction as the tick path's step 7.
                decision @ (RetryDecision::Exhausted | RetryDecision::NoPolicy) => {
                    let plan = self.plan_for(&trigger);
                    let next = plan.next_fire_after(run.scheduled_at);
                    let mut updated = trigger.clone();
                    updated.last_run_at = Some(run.scheduled_at);
                    updated.failure_count = match decision {
                        RetryDecision::Exhausted => 0,
                        _ => trigger.failure_count + 1,
                    };
                    updated.clear_lease();
                    match next {
                        Some(next_run_at) => {
                            let next_run_id = Uuid::new_v4();
                            updated.next_run_at = Some(next_run_at);
                            updated.next_run_id = Some(next_run_id);
                            self.store.upsert_trigger(updated, trigger.revision).await?;
                            self.bus.emit(
                                SchedulerEvent::Scheduled,
                                EventPayload::new()
                                    .at(now)
                                    .with_trigger(trigger.id)
                                    .with_run(next_run_id)
                                    .also(|p| p.scheduled_at = Some(next_run_at)),
                            );
                        }
                        None => {
                            self.store.delete_trigger(trigger.id).await.ok();
                            self.plans.remove(&trigger.id);
                            self.bus.emit(
                                SchedulerEvent::Drain,
                                EventPayload::new().at(now).also(|p| p.pending_runs = Some(0)),
                            );
                        }
                    }
                }
            }

            handled += 1;
        }
        Ok(handled)
    }

    /// Stop accepting new claims, wait up to `grace` for in-flight runs to
    /// finish (when `graceful`), then return.
    pub async fn shutdown(&self, graceful: bool, grace: Option<std::time::Duration>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let at = self.clock.now();
        self.bus.emit(
            SchedulerEvent::Shutdown,
            EventPayload::new().at(at).also(|p| p.graceful = Some(graceful)),
        );

        if !graceful {
            return;
        }
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.in_flight.lock().await);
        let grace = grace.unwrap_or(self.config.shutdown_grace_period);
        let _ = tokio::time::timeout(grace, futures::future::join_all(handles)).await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

fn to_chrono(d: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_default()
}

/// Advance `plan` from `after`, calling `should_skip` on each candidate and
/// continuing past it while true, capped at `max_iterations`. Returns the
/// first candidate `should_skip` rejects, paired with how many were skipped,
/// or `None` if the plan was exhausted or the cap was hit first.
fn advance_while(
    plan: &dyn Plan,
    after: DateTime<Utc>,
    max_iterations: u32,
    mut should_skip: impl FnMut(DateTime<Utc>) -> bool,
) -> Option<(DateTime<Utc>, u32)> {
    let mut current = after;
    let mut skipped = 0u32;
    loop {
        let candidate = plan.next_fire_after(current)?;
        if !should_skip(candidate) {
            return Some((candidate, skipped));
        }
        skipped += 1;
        if skipped > max_iterations {
            return None;
        }
        current = candidate;
    }
}

// Small ergonomic helper so call sites can set a couple of extra fields on
// an `EventPayload` inline without a long builder chain for every variant.
trait EventPayloadExt {
    fn also(self, f: impl FnOnce(&mut EventPayload)) -> EventPayload;
}

impl EventPayloadExt for EventPayload {
    fn also(mut self, f: impl FnOnce(&mut EventPayload)) -> EventPayload {
        f(&mut self);
        self
    }
}

/// Builder for [`Engine`], following a `JobRunner::new`/`with_config`
/// construction style.
pub struct EngineBuilder {
    store: Arc<dyn Store>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Arc<Engine> {
        let global_capacity = self
            .config
            .max_concurrent_runs
            .map(|limit| Arc::new(CapacityGate::new("global", limit)));
        let global_bucket = self.config.global_rate_limit.map(|cfg| {
            Arc::new(TokenBucket::new(cfg.capacity, cfg.refill_rate, cfg.refill_interval, cfg.burst))
        });
        Arc::new(Engine {
            store: self.store,
            bus: self.bus,
            clock: self.clock,
            registry: RwLock::new(JobRegistry::new()),
            global_capacity,
            global_bucket,
            job_capacity: DashMap::new(),
            job_bucket: DashMap::new(),
            plans: DashMap::new(),
            handled_runs: DashSet::new(),
            release_thunks: DashMap::new(),
            scheduler_paused: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            in_flight: AsyncMutex::new(Vec::new()),
            config: self.config,
        })
    }
}

/// A live handle to one registered job.
pub struct JobHandle {
    job_id: Uuid,
    engine: Arc<Engine>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.job_id
    }

    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.engine.store.set_job_paused(self.job_id, true).await?;
        self.engine.bus.emit(
            SchedulerEvent::Paused,
            EventPayload::new()
                .at(self.engine.clock.now())
                .also(|p| {
                    p.scope = Some(PauseScope::Job);
                    p.identifier = Some(self.job_id.to_string());
                }),
        );
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.engine.store.set_job_paused(self.job_id, false).await?;
        self.engine.bus.emit(
            SchedulerEvent::Resumed,
            EventPayload::new()
                .at(self.engine.clock.now())
                .also(|p| {
                    p.scope = Some(PauseScope::Job);
                    p.identifier = Some(self.job_id.to_string());
                }),
        );
        Ok(())
    }

    /// Remove the job definition and any triggers bound to it. A no-op
    /// (`Ok(())`) if the job is already gone.
    pub async fn unregister(&self) -> Result<(), SchedulerError> {
        match self.engine.store.remove_job(self.job_id).await {
            Ok(()) | Err(SchedulerError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// A live binding to one scheduled trigger.
pub struct TriggerHandle {
    trigger_id: Uuid,
    engine: Arc<Engine>,
}

impl TriggerHandle {
    pub fn id(&self) -> Uuid {
        self.trigger_id
    }

    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.engine.store.pause_trigger(self.trigger_id).await?;
        self.engine.bus.emit(
            SchedulerEvent::Paused,
            EventPayload::new()
                .at(self.engine.clock.now())
                .also(|p| {
                    p.scope = Some(PauseScope::Trigger);
                    p.identifier = Some(self.trigger_id.to_string());
                }),
        );
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.engine.store.resume_trigger(self.trigger_id).await?;
        self.engine.bus.emit(
            SchedulerEvent::Resumed,
            EventPayload::new()
                .at(self.engine.clock.now())
                .also(|p| {
                    p.scope = Some(PauseScope::Trigger);
                    p.identifier = Some(self.trigger_id.to_string());
                }),
        );
        Ok(())
    }

    /// Delete the trigger and emit `canceled`. A cancel that races with an
    /// in-flight claim loses: the claimed run still completes, but no
    /// further fire occurs once this returns. A no-op if the trigger is
    /// already gone.
    pub async fn cancel(&self, reason: impl Into<String>) -> Result<(), SchedulerError> {
        let trigger = match self.engine.store.get_trigger(self.trigger_id).await {
            Ok(t) => t,
            Err(SchedulerError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        let job_name = self
            .engine
            .store
            .get_job(trigger.job_id)
            .await
            .map(|j| j.name)
            .unwrap_or_default();

        self.engine.store.delete_trigger(self.trigger_id).await.ok();
        self.engine.plans.remove(&self.trigger_id);

        self.engine.bus.emit(
            SchedulerEvent::Canceled,
            EventPayload::new()
                .at(self.engine.clock.now())
                .with_trigger(self.trigger_id)
                .with_job(job_name)
                .also(|p| {
                    if let Some(run_id) = trigger.next_run_id {
                        p.run_id = Some(run_id);
                    }
                    p.reason = Some(reason.into());
                }),
        );
        Ok(())
    }
}
