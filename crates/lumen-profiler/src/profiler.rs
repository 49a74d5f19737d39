//! Named-timer registry
//!
//! Timers are keyed by [`TimerId`]. Mis-paired `start`/`stop` calls are usage
//! errors: they are logged and counted, never raised, so a broken
//! instrumentation bracket cannot take down a running session.

use crate::report;
use crate::timer::{Timer, TimerId, TimerStats};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

/// Profiler handle shared between the compute manager and its observers
pub type SharedProfiler = Arc<Mutex<Profiler>>;

/// Lock a shared profiler, recovering the data if a holder panicked.
pub fn lock(profiler: &SharedProfiler) -> MutexGuard<'_, Profiler> {
    profiler.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of named timers
#[derive(Debug, Default)]
pub struct Profiler {
    timers: BTreeMap<TimerId, Timer>,
    usage_errors: u64,
}

impl Profiler {
    /// Create an empty profiler
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty profiler behind a shared handle
    pub fn shared() -> SharedProfiler {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Register (or re-register) a timer.
    ///
    /// Any previous timer under `id` is replaced, statistics included.
    /// `freq` gates non-forced prints to every `freq`-th sample; the first
    /// `skip` stops are counted but not accumulated.
    pub fn configure(&mut self, id: impl Into<TimerId>, title: impl Into<String>, freq: u32, skip: u32) {
        self.timers.insert(id.into(), Timer::new(title, freq, skip));
    }

    /// Start a timer, registering it with default parameters if unknown.
    pub fn start(&mut self, id: impl Into<TimerId>) {
        let id = id.into();
        let timer = self
            .timers
            .entry(id.clone())
            .or_insert_with(|| Timer::new(id.to_string(), 1, 0));

        if timer.is_running() {
            self.usage_errors += 1;
            warn!("Profiler {} ('{}') is already started", id, timer.title);
            return;
        }

        timer.begin();
    }

    /// Stop a running timer and accumulate the elapsed time.
    pub fn stop(&mut self, id: impl Into<TimerId>) -> Option<Duration> {
        let id = id.into();
        let Some(timer) = self.timers.get_mut(&id) else {
            self.usage_errors += 1;
            warn!("Profiler {} is not registered", id);
            return None;
        };

        let elapsed = timer.end();
        if elapsed.is_none() {
            self.usage_errors += 1;
            warn!("Profiler {} ('{}') is not started", id, timer.title);
        }
        elapsed
    }

    /// Record a sample directly, as if a start/stop pair had measured it.
    pub fn record(&mut self, id: impl Into<TimerId>, elapsed: Duration) {
        let id = id.into();
        self.timers
            .entry(id.clone())
            .or_insert_with(|| Timer::new(id.to_string(), 1, 0))
            .record(elapsed);
    }

    /// Log one timer's line. Returns the line if it was printed.
    ///
    /// Without `force`, a timer prints only when its sample count is a
    /// multiple of its frequency. A timer with no samples never prints.
    pub fn print(&self, id: impl Into<TimerId>, force: bool) -> Option<String> {
        let id = id.into();
        let line = self.line(&id, force)?;
        info!("{}", line);
        Some(line)
    }

    /// Log every printable timer under a table header. Returns the number of lines.
    pub fn print_all(&self, force: bool) -> usize {
        let lines = self.lines(force);
        if lines.is_empty() {
            return 0;
        }

        info!("{}", report::header());
        for line in &lines {
            info!("{}", line);
        }
        info!("{}", report::FOOTER);

        lines.len()
    }

    /// Render the same table `print_all` logs. Empty if nothing is printable.
    pub fn report(&self, force: bool) -> String {
        let lines = self.lines(force);
        if lines.is_empty() {
            return String::new();
        }

        let mut out = report::header();
        out.push('\n');
        for line in lines {
            out.push_str(&line);
            out.push('\n');
        }
        out.push_str(report::FOOTER);
        out.push('\n');
        out
    }

    /// Clear the statistics of every timer, keeping their parameters.
    pub fn reset_all(&mut self) {
        for timer in self.timers.values_mut() {
            timer.reset();
        }
    }

    /// Statistics snapshot for one timer
    pub fn stats(&self, id: impl Into<TimerId>) -> Option<TimerStats> {
        self.timers.get(&id.into()).map(Timer::stats)
    }

    /// Whether a timer is between `start` and `stop`
    pub fn is_running(&self, id: impl Into<TimerId>) -> bool {
        self.timers
            .get(&id.into())
            .map(Timer::is_running)
            .unwrap_or(false)
    }

    /// Registered timer ids in report order
    pub fn timer_ids(&self) -> impl Iterator<Item = &TimerId> {
        self.timers.keys()
    }

    /// Number of mis-paired start/stop calls seen so far
    pub fn usage_errors(&self) -> u64 {
        self.usage_errors
    }

    /// Number of registered timers
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Check if no timer is registered
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    fn line(&self, id: &TimerId, force: bool) -> Option<String> {
        let timer = self.timers.get(id)?;
        if timer.count() == 0 || (!force && !timer.due()) {
            return None;
        }
        Some(report::line(id, &timer.stats()))
    }

    fn lines(&self, force: bool) -> Vec<String> {
        self.timers
            .keys()
            .filter_map(|id| self.line(id, force))
            .collect()
    }
}

/// Scoped timer that stops on drop
pub struct ScopedTimer<'a> {
    profiler: &'a mut Profiler,
    id: TimerId,
}

impl<'a> ScopedTimer<'a> {
    /// Start `id` and stop it when the guard goes out of scope
    pub fn new(profiler: &'a mut Profiler, id: impl Into<TimerId>) -> Self {
        let id = id.into();
        profiler.start(id.clone());
        Self { profiler, id }
    }
}

impl<'a> Drop for ScopedTimer<'a> {
    fn drop(&mut self) {
        self.profiler.stop(self.id.clone());
    }
}
