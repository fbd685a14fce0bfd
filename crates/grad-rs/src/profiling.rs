//! Lightweight scope timing and event counters for graph diagnostics.
//!
//! Collection is off unless `GRADRS_PROFILE` is set or [`enable`] is called,
//! so the hooks sprinkled through tracing, replay, and backward paths cost a
//! single atomic load in the common case.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

static FORCED: AtomicBool = AtomicBool::new(false);

static STATS: Lazy<Mutex<HashMap<&'static str, Stat>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Default, Clone, Copy)]
struct Stat {
    calls: u64,
    elapsed: Duration,
}

/// Snapshot row: scope/event name, call count, accumulated wall-clock time.
#[derive(Debug, Clone)]
pub struct StatLine {
    pub name: &'static str,
    pub calls: u64,
    pub elapsed: Duration,
}

fn enabled() -> bool {
    FORCED.load(Ordering::Relaxed) || crate::env::profiling_enabled()
}

/// Turns collection on for the current process, independent of environment.
pub fn enable() {
    FORCED.store(true, Ordering::Relaxed);
}

/// Turns forced collection back off. Environment configuration still applies.
pub fn disable() {
    FORCED.store(false, Ordering::Relaxed);
}

/// Starts a named wall-clock scope; the timing is recorded when the returned
/// guard drops.
pub fn scope(name: &'static str) -> ScopeTimer {
    let start = enabled().then(Instant::now);
    ScopeTimer { name, start }
}

/// Increments a named counter without timing.
pub fn event(name: &'static str) {
    if !enabled() {
        return;
    }
    let mut stats = STATS.lock().expect("profiling stats poisoned");
    stats.entry(name).or_default().calls += 1;
}

/// Returns the accumulated statistics, sorted by name for stable output.
pub fn snapshot() -> Vec<StatLine> {
    let stats = STATS.lock().expect("profiling stats poisoned");
    let mut lines: Vec<StatLine> = stats
        .iter()
        .map(|(name, stat)| StatLine {
            name,
            calls: stat.calls,
            elapsed: stat.elapsed,
        })
        .collect();
    lines.sort_by_key(|line| line.name);
    lines
}

/// Clears all accumulated statistics.
pub fn reset() {
    STATS.lock().expect("profiling stats poisoned").clear();
}

/// RAII guard recording elapsed time for a named scope on drop.
pub struct ScopeTimer {
    name: &'static str,
    start: Option<Instant>,
}

impl Drop for ScopeTimer {
    fn drop(&mut self) {
        if let Some(start) = self.start.take() {
            let elapsed = start.elapsed();
            let mut stats = STATS.lock().expect("profiling stats poisoned");
            let stat = stats.entry(self.name).or_default();
            stat.calls += 1;
            stat.elapsed += elapsed;
        }
    }
}
