//! Named, per-listener-isolated event bus.
//!
//! Follows `seesaw::EventBus`'s envelope/correlation-id shape, but adapted:
//! a plain `tokio::sync::broadcast` channel explicitly allows a slow
//! receiver to lag and miss events, and has no concept of an isolated
//! listener callback. Here each subscription gets its own bounded channel
//! and its own delivery task, so one slow or panicking listener can never
//! block or drop events for another.
//!
//! `emit` is a synchronous, non-async call on the engine's single tick
//! path, so it can never await a slow listener without stalling the whole
//! scheduler. It pushes onto each listener's unbounded inbox, which only
//! ever queues. A single persistent task per subscription (spawned once in
//! [`EventBus::on`], not once per `emit` call) drains that inbox and
//! forwards to the listener's bounded channel, one send at a time, so
//! ordering into that channel is never at the mercy of two
//! independently-scheduled tasks racing. The bounded channel's capacity
//! only throttles the forwarding task against its own listener — it does
//! not, and cannot, push back on `emit`: a listener that stops consuming
//! entirely leaves its inbox to grow without bound for as long as the
//! scheduler keeps emitting. Callers are expected to keep draining their
//! receiver (or unsubscribe) rather than rely on the bus to stall emitters
//! on their behalf.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Depth of each listener's bounded outbound channel. A slow listener's
/// forwarding task backs up against this limit and queues the overflow in
/// its unbounded inbox instead — it never blocks `emit` and never affects
/// another listener.
const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// The named lifecycle events the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulerEvent {
    Scheduled,
    Run,
    Progress,
    Completed,
    Error,
    Retry,
    Stalled,
    Canceled,
    Paused,
    Resumed,
    Drain,
    Shutdown,
}

impl SchedulerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SchedulerEvent::Scheduled => "scheduled",
            SchedulerEvent::Run => "run",
            SchedulerEvent::Progress => "progress",
            SchedulerEvent::Completed => "completed",
            SchedulerEvent::Error => "error",
            SchedulerEvent::Retry => "retry",
            SchedulerEvent::Stalled => "stalled",
            SchedulerEvent::Canceled => "canceled",
            SchedulerEvent::Paused => "paused",
            SchedulerEvent::Resumed => "resumed",
            SchedulerEvent::Drain => "drain",
            SchedulerEvent::Shutdown => "shutdown",
        }
    }
}

/// The scope a `paused`/`resumed` event applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PauseScope {
    Scheduler,
    Job,
    Trigger,
}

/// Payload carried alongside a [`SchedulerEvent`]. Every field that a given
/// event kind doesn't use is left at its default; see the constructors on
/// [`crate::engine::Engine`] for which fields a given event actually
/// populates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    pub cid: Uuid,
    pub at: DateTime<Utc>,
    pub trigger_id: Option<Uuid>,
    pub job: Option<String>,
    pub run_id: Option<Uuid>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt: Option<u32>,
    pub progress: Option<u8>,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub delay_ms: Option<i64>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub scope: Option<PauseScope>,
    pub identifier: Option<String>,
    pub pending_runs: Option<u64>,
    pub graceful: Option<bool>,
}

impl EventPayload {
    pub fn new() -> Self {
        Self {
            cid: Uuid::new_v4(),
            at: Utc::now(),
            trigger_id: None,
            job: None,
            run_id: None,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            attempt: None,
            progress: None,
            result: None,
            error: None,
            delay_ms: None,
            last_heartbeat_at: None,
            reason: None,
            scope: None,
            identifier: None,
            pending_runs: None,
            graceful: None,
        }
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    pub fn with_trigger(mut self, trigger_id: Uuid) -> Self {
        self.trigger_id = Some(trigger_id);
        self
    }

    pub fn with_job(mut self, job: impl Into<String>) -> Self {
        self.job = Some(job.into());
        self
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

impl Default for EventPayload {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`EventBus::on`]; dropping it or calling
/// [`Unsubscribe::unsubscribe`] stops the listener's delivery task.
pub struct Unsubscribe {
    id: u64,
    event: SchedulerEvent,
    bus: Arc<Inner>,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        // Drop does the work; this just gives the call a readable name.
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(mut listeners) = self.bus.listeners.get_mut(&self.event) {
            listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

struct Inner {
    listeners: DashMap<SchedulerEvent, Vec<(u64, mpsc::UnboundedSender<EventPayload>)>>,
    next_id: AtomicU64,
}

/// Named, per-listener-isolated pub/sub for scheduler lifecycle events.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                listeners: DashMap::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a listener for `event`. Returns a receiver of payloads and
    /// an [`Unsubscribe`] handle. The listener's own channel is bounded and
    /// independent of every other listener's channel; a task spawned here,
    /// once, forwards from an internal unbounded inbox into it. That inbox
    /// exists so `emit` never has to await a slow receiver — it is not a
    /// backpressure mechanism, and a listener that never drains its
    /// receiver will grow it without bound.
    pub fn on(&self, event: SchedulerEvent) -> (mpsc::Receiver<EventPayload>, Unsubscribe) {
        let (tx, rx) = mpsc::channel(DEFAULT_SUBSCRIBER_CAPACITY);
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel::<EventPayload>();
        tokio::spawn(async move {
            while let Some(payload) = inbox_rx.recv().await {
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .entry(event)
            .or_default()
            .push((id, inbox_tx));
        (
            rx,
            Unsubscribe {
                id,
                event,
                bus: self.inner.clone(),
            },
        )
    }

    /// Emit `event` with `payload` to every current listener. Returns the
    /// number of listeners notified. Never blocks and never applies
    /// backpressure: pushing onto a listener's inbox only queues the
    /// payload for its forwarding task.
    pub fn emit(&self, event: SchedulerEvent, payload: EventPayload) -> usize {
        let Some(listeners) = self.inner.listeners.get(&event) else {
            return 0;
        };
        let count = listeners.len();
        for (_, tx) in listeners.iter() {
            // An isolated send: if the receiver was dropped, this is a
            // no-op for everyone else.
            let _ = tx.send(payload.clone());
        }
        count
    }

    pub fn listener_count(&self, event: SchedulerEvent) -> usize {
        self.inner
            .listeners
            .get(&event)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<&'static str, usize> = self
            .inner
            .listeners
            .iter()
            .map(|entry| (entry.key().name(), entry.value().len()))
            .collect();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}
