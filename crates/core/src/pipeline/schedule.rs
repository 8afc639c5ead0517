use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::domain::run::{RunContext, RunId};

/// Floors `now` to the start of its interval, counted from the Unix epoch.
pub fn logical_time_for(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let step = interval.as_secs().max(1) as i64;
    let ts = now.timestamp();
    DateTime::from_timestamp(ts - ts.rem_euclid(step), 0).unwrap_or(now)
}

/// Fixed-interval trigger. Each interval boundary yields one run; ticks missed
/// while a run was in flight are not caught up.
#[derive(Debug, Clone)]
pub struct Trigger {
    pipeline: String,
    interval: Duration,
    last_run: Option<RunId>,
}

impl Trigger {
    pub fn new(pipeline: impl Into<String>, interval: Duration) -> Self {
        Self {
            pipeline: pipeline.into(),
            interval,
            last_run: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the run for the current tick, or `None` if that tick already
    /// produced one.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<RunContext> {
        let ctx = RunContext::new(self.pipeline.clone(), logical_time_for(now, self.interval));
        if self.last_run.as_ref() == Some(&ctx.run_id) {
            return None;
        }
        self.last_run = Some(ctx.run_id.clone());
        Some(ctx)
    }

    /// Time left until the next interval boundary.
    pub fn until_next(&self, now: DateTime<Utc>) -> Duration {
        let next = logical_time_for(now, self.interval)
            + chrono::Duration::seconds(self.interval.as_secs().max(1) as i64);
        (next - now).to_std().unwrap_or(Duration::ZERO)
    }
}
