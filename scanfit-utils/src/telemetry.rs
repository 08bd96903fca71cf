//! Scoped step timing for the scan pipeline.
//!
//! Each pipeline stage (page loading, alignment, model fitting, ...) opens a
//! [`TimingGuard`]; when the guard drops it logs the elapsed time under the
//! `scanfit::telemetry` target. Guards stay silent unless telemetry was
//! switched on through [`configure`] and the logger accepts the level, so the
//! cost on a quiet run is one atomic load.

use std::{
    borrow::Cow,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
    time::{Duration, Instant},
};

use log::{Level, LevelFilter, log, log_enabled};

/// Log target shared by every timing guard.
pub const TELEMETRY_TARGET: &str = "scanfit::telemetry";

static ENABLED: AtomicBool = AtomicBool::new(false);
static THRESHOLD: AtomicU8 = AtomicU8::new(0);

/// Logs the lifetime of a pipeline step when dropped.
pub struct TimingGuard {
    step: Cow<'static, str>,
    level: Level,
    started: Instant,
    armed: bool,
}

impl TimingGuard {
    /// Whether the guard will log on drop.
    pub fn is_active(&self) -> bool {
        self.armed
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Disarm the guard and hand back the elapsed time.
    pub fn finish(mut self) -> Duration {
        self.armed = false;
        self.started.elapsed()
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        if self.armed {
            log!(
                target: TELEMETRY_TARGET,
                self.level,
                "{} took {:.2?}",
                self.step,
                self.started.elapsed()
            );
        }
    }
}

/// Time a step, logging at `level` when telemetry allows it.
pub fn timing_guard(step: impl Into<Cow<'static, str>>, level: Level) -> TimingGuard {
    timing_guard_if(step, level, true)
}

/// Like [`timing_guard`] with an extra caller-side switch.
pub fn timing_guard_if(
    step: impl Into<Cow<'static, str>>,
    level: Level,
    enabled: bool,
) -> TimingGuard {
    let armed = enabled && telemetry_allows(level) && log_enabled!(target: TELEMETRY_TARGET, level);
    TimingGuard {
        step: step.into(),
        level,
        started: Instant::now(),
        armed,
    }
}

/// Update the global telemetry switch and level threshold.
pub fn configure(enabled: bool, level: LevelFilter) {
    ENABLED.store(enabled, Ordering::Relaxed);
    THRESHOLD.store(rank_filter(level), Ordering::Relaxed);
}

pub fn telemetry_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

pub fn telemetry_level() -> LevelFilter {
    match THRESHOLD.load(Ordering::Relaxed) {
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        5 => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

/// True when telemetry is on and `level` is within the configured threshold.
pub fn telemetry_allows(level: Level) -> bool {
    telemetry_enabled() && rank_level(level) <= THRESHOLD.load(Ordering::Relaxed)
}

fn rank_level(level: Level) -> u8 {
    level as u8
}

fn rank_filter(filter: LevelFilter) -> u8 {
    filter as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ranks_follow_log_ordering() {
        assert_eq!(rank_level(Level::Error), 1);
        assert_eq!(rank_level(Level::Trace), 5);
        assert_eq!(rank_filter(LevelFilter::Off), 0);
        assert_eq!(rank_filter(LevelFilter::Debug), 4);
    }

    #[test]
    fn configure_round_trips_and_gates_levels() {
        configure(true, LevelFilter::Info);
        assert!(telemetry_enabled());
        assert_eq!(telemetry_level(), LevelFilter::Info);
        assert!(telemetry_allows(Level::Warn));
        assert!(!telemetry_allows(Level::Debug));

        configure(false, LevelFilter::Trace);
        assert!(!telemetry_allows(Level::Error));
    }

    #[test]
    fn finished_guard_reports_elapsed() {
        let guard = timing_guard_if("unit", Level::Debug, false);
        assert!(!guard.is_active());
        let elapsed = guard.finish();
        assert!(elapsed < Duration::from_secs(5));
    }
}
