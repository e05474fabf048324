//! Opaque fire-time iteration. Cron parsing is intentionally out of scope —
//! callers who want cron syntax implement [`Plan`] themselves (e.g. backed
//! by the `cron` crate) and hand the engine the resulting fire times.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::model::PlanSpec;

/// A collaborator that knows when a trigger should next fire. Implementations
/// must be pure functions of `after`: calling `next_fire_after` twice with
/// the same argument must return the same result.
pub trait Plan: Send + Sync {
    fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

/// Fires once, at a fixed instant, then never again.
#[derive(Debug, Clone, Copy)]
pub struct At(pub DateTime<Utc>);

impl Plan for At {
    fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.0 > after {
            Some(self.0)
        } else {
            None
        }
    }
}

/// Fires on a fixed period starting from an anchor time.
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    pub anchor: DateTime<Utc>,
    pub period: ChronoDuration,
}

impl Interval {
    pub fn new(anchor: DateTime<Utc>, period: ChronoDuration) -> Self {
        assert!(period > ChronoDuration::zero(), "interval period must be positive");
        Self { anchor, period }
    }
}

impl Plan for Interval {
    fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if after < self.anchor {
            return Some(self.anchor);
        }
        let elapsed = after - self.anchor;
        let periods_elapsed = elapsed.num_milliseconds() / self.period.num_milliseconds();
        let mut candidate = self.anchor + self.period * ((periods_elapsed + 1) as i32);
        while candidate <= after {
            candidate = candidate + self.period;
        }
        Some(candidate)
    }
}

/// Materialize a stored [`PlanSpec`] into a live [`Plan`]. Used by the
/// engine to rebuild a trigger's plan when its in-memory cache has been
/// evicted (or never populated, e.g. right after hydrating from the
/// store), instead of requiring every trigger to be rescheduled by hand.
pub fn build_plan(spec: &PlanSpec) -> Arc<dyn Plan> {
    match *spec {
        PlanSpec::At { run_at } => Arc::new(At(run_at)),
        PlanSpec::Interval { anchor, period_ms } => {
            Arc::new(Interval::new(anchor, ChronoDuration::milliseconds(period_ms)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_fires_once() {
        let when = Utc::now() + ChronoDuration::seconds(10);
        let plan = At(when);
        let before = when - ChronoDuration::seconds(1);
        assert_eq!(plan.next_fire_after(before), Some(when));
        assert_eq!(plan.next_fire_after(when), None);
        assert_eq!(plan.next_fire_after(when + ChronoDuration::seconds(1)), None);
    }

    #[test]
    fn interval_fires_before_anchor_at_anchor() {
        let anchor = Utc::now();
        let plan = Interval::new(anchor, ChronoDuration::seconds(60));
        assert_eq!(
            plan.next_fire_after(anchor - ChronoDuration::seconds(5)),
            Some(anchor)
        );
    }

    #[test]
    fn interval_advances_by_whole_periods() {
        let anchor = Utc::now();
        let plan = Interval::new(anchor, ChronoDuration::seconds(60));
        let after = anchor + ChronoDuration::seconds(90);
        assert_eq!(
            plan.next_fire_after(after),
            Some(anchor + ChronoDuration::seconds(120))
        );
    }

    #[test]
    fn interval_next_fire_is_always_strictly_after() {
        let anchor = Utc::now();
        let plan = Interval::new(anchor, ChronoDuration::seconds(60));
        let exactly_on_fire = anchor + ChronoDuration::seconds(60);
        let next = plan.next_fire_after(exactly_on_fire).unwrap();
        assert!(next > exactly_on_fire);
    }

    #[test]
    fn build_plan_rebuilds_at_from_spec() {
        let when = Utc::now() + ChronoDuration::seconds(5);
        let plan = build_plan(&PlanSpec::At { run_at: when });
        assert_eq!(plan.next_fire_after(when - ChronoDuration::seconds(1)), Some(when));
    }

    #[test]
    fn build_plan_rebuilds_interval_from_spec() {
        let anchor = Utc::now();
        let plan = build_plan(&PlanSpec::Interval {
            anchor,
            period_ms: 50,
        });
        assert_eq!(
            plan.next_fire_after(anchor - ChronoDuration::milliseconds(1)),
            Some(anchor)
        );
    }
}
