//! Pluggable durable persistence.
//!
//! [`Store`] is deliberately policy-light: it knows how to persist and
//! claim things, not when to claim them or how to retry. That decision
//! belongs to [`crate::engine::Engine`]. This mirrors the split drawn by
//! the job-queue abstraction this crate's `Store` trait is descended
//! from, which explicitly keeps polling cadence, retry backoff, and
//! concurrency limits out of the storage layer.
//!
//! [`InMemoryStore`] is the only implementation shipped in this crate —
//! backends beyond it are out of scope. It reproduces the two guarantees a
//! SQL-backed implementation gets from `FOR UPDATE SKIP LOCKED` plus a
//! stale-lease recovery clause: a currently-leased trigger is invisible to
//! other claimants, and a trigger whose lease has expired is claimable
//! again without operator intervention. Every operation that depends on
//! "now" takes it as an explicit argument rather than calling `Utc::now()`
//! internally, so callers driving the engine off a [`crate::clock::Clock`]
//! (including [`crate::clock::ManualClock`] in tests) get fully
//! deterministic behavior out of the store too.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::model::{Job, Run, RunStatus, Trigger};

#[async_trait]
pub trait Store: Send + Sync {
    /// Called once before the engine starts polling. The default is a
    /// no-op; durable backends override it to run migrations or warm
    /// connection pools.
    async fn init(&self) -> Result<(), SchedulerError> {
        Ok(())
    }

    async fn put_job(&self, job: Job) -> Result<(), SchedulerError>;
    async fn get_job(&self, id: Uuid) -> Result<Job, SchedulerError>;
    async fn list_jobs(&self) -> Result<Vec<Job>, SchedulerError>;
    async fn set_job_paused(&self, id: Uuid, paused: bool) -> Result<(), SchedulerError>;
    async fn remove_job(&self, id: Uuid) -> Result<(), SchedulerError>;

    async fn put_trigger(&self, trigger: Trigger) -> Result<(), SchedulerError>;
    async fn get_trigger(&self, id: Uuid) -> Result<Trigger, SchedulerError>;
    async fn list_triggers(&self, job_id: Uuid) -> Result<Vec<Trigger>, SchedulerError>;
    async fn delete_trigger(&self, id: Uuid) -> Result<(), SchedulerError>;

    /// Unpaused, unleased (or lease-expired) triggers due at or before
    /// `now`, ordered by priority (smaller first) then by `next_run_at`
    /// (oldest first), capped at `limit`.
    async fn due_triggers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Trigger>, SchedulerError>;

    /// Atomically claim a trigger for `worker_id`, extending its lease by
    /// `lease` from `now`. Fails with [`SchedulerError::State`] if the
    /// trigger is currently leased by someone else and that lease has not
    /// expired as of `now`. Bumps the trigger's revision.
    async fn claim_trigger(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Trigger, SchedulerError>;

    /// Replace a trigger's persisted state wholesale (used by the engine to
    /// advance `next_run_at`, clear a lease, bump `failure_count`, etc., in
    /// one write), failing if `expected_revision` no longer matches —
    /// guards against a concurrent claim slipping in between read and
    /// write. Bumps the revision on success.
    async fn upsert_trigger(
        &self,
        trigger: Trigger,
        expected_revision: u64,
    ) -> Result<Trigger, SchedulerError>;

    /// Release a claimed trigger without changing anything else about it —
    /// used on early-abort paths (e.g. the job has no registered handler)
    /// where the caller wants the lease gone but isn't ready to decide the
    /// trigger's next fire time.
    async fn release_trigger(&self, id: Uuid, expected_revision: u64) -> Result<(), SchedulerError>;

    async fn pause_trigger(&self, id: Uuid) -> Result<(), SchedulerError>;
    async fn resume_trigger(&self, id: Uuid) -> Result<(), SchedulerError>;

    async fn create_run(&self, run: Run) -> Result<(), SchedulerError>;
    async fn update_run(&self, run: Run) -> Result<(), SchedulerError>;
    async fn get_run(&self, id: Uuid) -> Result<Run, SchedulerError>;

    /// Record a heartbeat (and optional progress) on a still-running run.
    async fn touch_run(
        &self,
        id: Uuid,
        progress: Option<u8>,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError>;

    /// Runs still `Running` whose last heartbeat is at or before
    /// `older_than` — candidates for the stalled-run monitor.
    async fn find_stalled_runs(&self, older_than: DateTime<Utc>) -> Result<Vec<Run>, SchedulerError>;
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    triggers: HashMap<Uuid, Trigger>,
    runs: HashMap<Uuid, Run>,
}

/// Reference `Store` implementation backed by an in-process `Mutex`-guarded
/// map. Suitable for single-process use and for tests; not durable across
/// restarts.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(what: &str, id: Uuid) -> SchedulerError {
    SchedulerError::NotFound(format!("{what} {id} not found"))
}

fn revision_mismatch(id: Uuid, expected: u64, found: u64) -> SchedulerError {
    SchedulerError::State(format!(
        "trigger {id} revision mismatch: expected {expected}, found {found}"
    ))
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put_job(&self, job: Job) -> Result<(), SchedulerError> {
        self.inner.lock().await.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Job, SchedulerError> {
        self.inner
            .lock()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("job", id))
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, SchedulerError> {
        Ok(self.inner.lock().await.jobs.values().cloned().collect())
    }

    async fn set_job_paused(&self, id: Uuid, paused: bool) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get_mut(&id).ok_or_else(|| not_found("job", id))?;
        job.paused = paused;
        Ok(())
    }

    async fn remove_job(&self, id: Uuid) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().await;
        inner.jobs.remove(&id).ok_or_else(|| not_found("job", id))?;
        inner.triggers.retain(|_, t| t.job_id != id);
        Ok(())
    }

    async fn put_trigger(&self, trigger: Trigger) -> Result<(), SchedulerError> {
        self.inner.lock().await.triggers.insert(trigger.id, trigger);
        Ok(())
    }

    async fn get_trigger(&self, id: Uuid) -> Result<Trigger, SchedulerError> {
        self.inner
            .lock()
            .await
            .triggers
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("trigger", id))
    }

    async fn list_triggers(&self, job_id: Uuid) -> Result<Vec<Trigger>, SchedulerError> {
        Ok(self
            .inner
            .lock()
            .await
            .triggers
            .values()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn delete_trigger(&self, id: Uuid) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().await;
        inner
            .triggers
            .remove(&id)
            .ok_or_else(|| not_found("trigger", id))?;
        Ok(())
    }

    async fn due_triggers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Trigger>, SchedulerError> {
        let inner = self.inner.lock().await;
        let mut due: Vec<Trigger> = inner
            .triggers
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.next_run_at.cmp(&b.next_run_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_trigger(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Trigger, SchedulerError> {
        let mut inner = self.inner.lock().await;
        let trigger = inner
            .triggers
            .get_mut(&id)
            .ok_or_else(|| not_found("trigger", id))?;

        let currently_leased = match trigger.lease_expires_at {
            Some(expiry) => expiry > now,
            None => false,
        };
        if currently_leased {
            return Err(SchedulerError::State(format!(
                "trigger {id} is already leased by {:?}",
                trigger.lease_owner
            )));
        }

        trigger.lease_owner = Some(worker_id.to_string());
        trigger.lease_expires_at = Some(now + chrono::Duration::from_std(lease).unwrap_or_default());
        trigger.revision += 1;
        Ok(trigger.clone())
    }

    async fn upsert_trigger(
        &self,
        trigger: Trigger,
        expected_revision: u64,
    ) -> Result<Trigger, SchedulerError> {
        let mut inner = self.inner.lock().await;
        let existing = inner
            .triggers
            .get(&trigger.id)
            .ok_or_else(|| not_found("trigger", trigger.id))?;
        if existing.revision != expected_revision {
            return Err(revision_mismatch(trigger.id, expected_revision, existing.revision));
        }
        let mut next = trigger;
        next.revision = expected_revision + 1;
        inner.triggers.insert(next.id, next.clone());
        Ok(next)
    }

    async fn release_trigger(&self, id: Uuid, expected_revision: u64) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().await;
        let trigger = inner
            .triggers
            .get_mut(&id)
            .ok_or_else(|| not_found("trigger", id))?;
        if trigger.revision != expected_revision {
            return Err(revision_mismatch(id, expected_revision, trigger.revision));
        }
        trigger.clear_lease();
        trigger.revision += 1;
        Ok(())
    }

    async fn pause_trigger(&self, id: Uuid) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().await;
        let trigger = inner
            .triggers
            .get_mut(&id)
            .ok_or_else(|| not_found("trigger", id))?;
        trigger.paused = true;
        trigger.revision += 1;
        Ok(())
    }

    async fn resume_trigger(&self, id: Uuid) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().await;
        let trigger = inner
            .triggers
            .get_mut(&id)
            .ok_or_else(|| not_found("trigger", id))?;
        trigger.paused = false;
        trigger.revision += 1;
        Ok(())
    }

    async fn create_run(&self, run: Run) -> Result<(), SchedulerError> {
        self.inner.lock().await.runs.insert(run.id, run);
        Ok(())
    }

    async fn update_run(&self, run: Run) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().await;
        if !inner.runs.contains_key(&run.id) {
            return Err(not_found("run", run.id));
        }
        inner.runs.insert(run.id, run);
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Run, SchedulerError> {
        self.inner
            .lock()
            .await
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("run", id))
    }

    async fn touch_run(
        &self,
        id: Uuid,
        progress: Option<u8>,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().await;
        let run = inner.runs.get_mut(&id).ok_or_else(|| not_found("run", id))?;
        run.heartbeat_at = Some(now);
        if let Some(progress) = progress {
            run.progress = Some(progress);
        }
        Ok(())
    }

    async fn find_stalled_runs(&self, older_than: DateTime<Utc>) -> Result<Vec<Run>, SchedulerError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .values()
            .filter(|r| {
                r.status == RunStatus::Running
                    && r.heartbeat_at
                        .or(r.started_at)
                        .map(|last| last <= older_than)
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}
