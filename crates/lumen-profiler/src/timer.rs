//! Timer identity and per-timer accumulators

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Minimum recorded value before the first accumulated sample (ms)
pub(crate) const RESET_MIN_MS: f64 = 1e6;

/// Timer key: integer ids sort before string keys
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TimerId {
    /// Integer id
    Index(i64),
    /// String key
    Name(String),
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerId::Index(i) => write!(f, "{}", i),
            TimerId::Name(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for TimerId {
    fn from(id: i64) -> Self {
        TimerId::Index(id)
    }
}

impl From<i32> for TimerId {
    fn from(id: i32) -> Self {
        TimerId::Index(id as i64)
    }
}

impl From<&str> for TimerId {
    fn from(id: &str) -> Self {
        TimerId::Name(id.to_string())
    }
}

impl From<String> for TimerId {
    fn from(id: String) -> Self {
        TimerId::Name(id)
    }
}

impl From<&String> for TimerId {
    fn from(id: &String) -> Self {
        TimerId::Name(id.clone())
    }
}

/// Snapshot of a timer's statistics, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerStats {
    /// Display title
    pub title: String,
    /// Accumulated samples (stops after the skip window)
    pub count: u64,
    /// Every stop, including skipped ones
    pub stops: u64,
    /// Fastest sample
    pub min_ms: f64,
    /// Slowest sample
    pub max_ms: f64,
    /// Mean sample
    pub mean_ms: f64,
    /// Population standard deviation
    pub std_ms: f64,
    /// Sum of samples
    pub total_ms: f64,
}

/// A single named timer
#[derive(Debug, Clone)]
pub(crate) struct Timer {
    pub(crate) title: String,
    pub(crate) freq: u32,
    pub(crate) skip: u32,
    started_at: Option<Instant>,
    stops: u64,
    n: u64,
    min_ms: f64,
    max_ms: f64,
    sum_ms: f64,
    sum2_ms: f64,
}

impl Timer {
    pub(crate) fn new(title: impl Into<String>, freq: u32, skip: u32) -> Self {
        Self {
            title: title.into(),
            freq,
            skip,
            started_at: None,
            stops: 0,
            n: 0,
            min_ms: RESET_MIN_MS,
            max_ms: 0.0,
            sum_ms: 0.0,
            sum2_ms: 0.0,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    pub(crate) fn begin(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Ends the running interval and records it. `None` if the timer was not running.
    pub(crate) fn end(&mut self) -> Option<Duration> {
        let elapsed = self.started_at.take()?.elapsed();
        self.record(elapsed);
        Some(elapsed)
    }

    pub(crate) fn record(&mut self, elapsed: Duration) {
        let t = elapsed.as_nanos() as f64 / 1e6;

        self.stops += 1;
        if self.stops <= self.skip as u64 {
            return;
        }

        self.n += 1;
        self.min_ms = self.min_ms.min(t);
        self.max_ms = self.max_ms.max(t);
        self.sum_ms += t;
        self.sum2_ms += t * t;
    }

    /// Whether a non-forced print is due
    pub(crate) fn due(&self) -> bool {
        self.n > 0 && self.n % self.freq.max(1) as u64 == 0
    }

    pub(crate) fn count(&self) -> u64 {
        self.n
    }

    /// Clears the statistics; title, frequency and skip window survive.
    pub(crate) fn reset(&mut self) {
        *self = Timer::new(std::mem::take(&mut self.title), self.freq, self.skip);
    }

    pub(crate) fn stats(&self) -> TimerStats {
        let n = self.n as f64;
        let mean = if self.n == 0 { 0.0 } else { self.sum_ms / n };
        let std = if self.n < 2 {
            0.0
        } else {
            (self.sum2_ms / n - mean * mean).max(0.0).sqrt()
        };

        TimerStats {
            title: self.title.clone(),
            count: self.n,
            stops: self.stops,
            min_ms: self.min_ms,
            max_ms: self.max_ms,
            mean_ms: mean,
            std_ms: std,
            total_ms: self.sum_ms,
        }
    }
}
