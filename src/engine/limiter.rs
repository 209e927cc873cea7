use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{ChatflowError, Result, model::RateLimit, utils::time::before_secs};

/// Sliding-window admission counter for flow starts.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one start under `key`, or fails when the window is full.
    pub fn acquire(
        &self,
        key: &str,
        limit: &RateLimit,
    ) -> Result<()> {
        let now = Utc::now();
        let window_start = before_secs(now, limit.per_seconds);

        let mut windows = self.windows.lock();
        let hits = windows.entry(key.to_string()).or_default();
        while hits.front().is_some_and(|t| *t <= window_start) {
            hits.pop_front();
        }
        if hits.len() >= limit.max_executions as usize {
            return Err(ChatflowError::RateLimited(format!("{} allows {} executions per {}s", key, limit.max_executions, limit.per_seconds)));
        }
        hits.push_back(now);
        Ok(())
    }

    /// Drops windows with no hit newer than `max_age_secs`.
    pub fn prune(
        &self,
        max_age_secs: u64,
    ) {
        let cutoff = before_secs(Utc::now(), max_age_secs);
        self.windows.lock().retain(|_, hits| hits.back().is_some_and(|t| *t > cutoff));
    }
}
