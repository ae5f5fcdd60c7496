//! Reconfiguration bookkeeping: decides when a chain of incremental passes
//! is due for a full sanity-check rebuild, and when timer metrics should be
//! flushed. There is a surprising amount of business logic in here; read
//! carefully before changing it.

use std::time::Instant;

use smallvec::SmallVec;
use tracing::debug;

/// Kind of one reconfiguration event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigKind {
    /// Built from nothing (or from a reset cache).
    Complete,
    /// Patched from the warm cache.
    Incremental,
    /// Not a real reconfigure: a diagnostics render that may still want
    /// timers flushed.
    Diag,
}

const HISTORY: usize = 10;

pub struct ReconfigStats {
    max_incr_between_checks: u64,
    max_time_between_checks: f64,
    max_config_between_timers: u64,
    max_time_between_timers: f64,

    /// Rolling history of the last few reconfigures.
    reconfigures: SmallVec<[(ReconfigKind, f64); HISTORY]>,

    pub complete_count: u64,
    pub incremental_count: u64,

    /// The previous complete pass usually falls out of the rolling history,
    /// so its timestamp is kept separately.
    last_complete: Option<f64>,
    last_check: Option<f64>,
    last_timer_log: Option<f64>,

    /// Incrementals since the last complete or sanity check.
    incrementals_outstanding: u64,
    /// Configurations of any kind since timers were last flushed.
    configs_outstanding: u64,

    pub checks: u64,
    pub check_errors: u64,

    started: Instant,
}

impl ReconfigStats {
    pub fn new() -> Self {
        Self::with_limits(100, 600.0, 10, 120.0)
    }

    /// Limits: incrementals between sanity checks, seconds between sanity
    /// checks, configurations between timer flushes, seconds between timer
    /// flushes.
    pub fn with_limits(
        max_incr_between_checks: u64,
        max_time_between_checks: f64,
        max_config_between_timers: u64,
        max_time_between_timers: f64,
    ) -> Self {
        Self {
            max_incr_between_checks,
            max_time_between_checks,
            max_config_between_timers,
            max_time_between_timers,
            reconfigures: SmallVec::new(),
            complete_count: 0,
            incremental_count: 0,
            last_complete: None,
            last_check: None,
            last_timer_log: None,
            incrementals_outstanding: 0,
            configs_outstanding: 0,
            checks: 0,
            check_errors: 0,
            started: Instant::now(),
        }
    }

    fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Record one reconfiguration event. `when` is monotonic seconds and
    /// defaults to now; tests pass explicit values.
    ///
    /// There is no incremental without a baseline: an incremental claimed
    /// before any complete has ever occurred is promoted to complete.
    pub fn mark(&mut self, kind: ReconfigKind, when: Option<f64>) {
        let when = when.unwrap_or_else(|| self.now());

        let kind = match kind {
            ReconfigKind::Incremental if self.last_complete.is_none() => ReconfigKind::Complete,
            k => k,
        };

        match kind {
            ReconfigKind::Complete => {
                // A complete pass is itself a sanity check: clear the
                // outstanding incrementals and reset the check baseline.
                // It does not touch the timer bookkeeping.
                self.incrementals_outstanding = 0;
                self.last_complete = Some(when);
                self.last_check = Some(when);
                self.complete_count += 1;
                debug!(when, "MARK COMPLETE");
            }
            ReconfigKind::Incremental => {
                self.incrementals_outstanding += 1;
                self.incremental_count += 1;
                debug!(when, "MARK INCREMENTAL");
            }
            ReconfigKind::Diag => {}
        }

        if kind != ReconfigKind::Diag {
            if self.reconfigures.len() >= HISTORY {
                self.reconfigures.remove(0);
            }
            self.reconfigures.push((kind, when));
        }

        // Diag events still count toward timer flushing.
        self.configs_outstanding += 1;
    }

    /// Should a complete rebuild be run to double-check the incremental
    /// chain? True iff the most recent pass was incremental and either the
    /// outstanding count or the elapsed time passes its limit.
    pub fn needs_check(&self, when: Option<f64>) -> bool {
        let when = when.unwrap_or_else(|| self.now());

        let Some((last_kind, _)) = self.reconfigures.last() else {
            return false;
        };

        if *last_kind == ReconfigKind::Complete {
            return false;
        }

        if self.incrementals_outstanding == 0 {
            return false;
        }

        if self.incrementals_outstanding >= self.max_incr_between_checks {
            return true;
        }

        // An incremental implies a complete happened, so a check baseline
        // must exist.
        let last_check = self.last_check.unwrap_or(0.0);
        when - last_check > self.max_time_between_checks
    }

    /// Parallel policy for flushing timer metrics. If timers were never
    /// flushed, the last complete pass is the baseline.
    pub fn needs_timers(&self, when: Option<f64>) -> bool {
        let when = when.unwrap_or_else(|| self.now());

        if self.reconfigures.is_empty() {
            return false;
        }

        if self.configs_outstanding == 0 {
            return false;
        }

        if self.configs_outstanding >= self.max_config_between_timers {
            return true;
        }

        let baseline = self.last_timer_log.or(self.last_complete).unwrap_or(0.0);
        when - baseline > self.max_time_between_timers
    }

    /// Note that a sanity check ran, and whether it passed.
    pub fn mark_checked(&mut self, ok: bool, when: Option<f64>) {
        debug!(ok, "MARK_CHECKED");

        self.incrementals_outstanding = 0;
        self.checks += 1;
        if !ok {
            self.check_errors += 1;
        }

        self.last_check = Some(when.unwrap_or_else(|| self.now()));
    }

    /// Note that timer metrics were flushed.
    pub fn mark_timers_logged(&mut self, when: Option<f64>) {
        debug!("MARK_TIMERS");

        self.configs_outstanding = 0;
        self.last_timer_log = Some(when.unwrap_or_else(|| self.now()));
    }

    pub fn incrementals_outstanding(&self) -> u64 {
        self.incrementals_outstanding
    }

    pub fn dump(&self) {
        for (kind, when) in &self.reconfigures {
            debug!(?kind, when, "RECONFIG: event");
        }
        debug!(
            complete = self.complete_count,
            incremental = self.incremental_count,
            outstanding = self.incrementals_outstanding,
            checks = self.checks,
            errors = self.check_errors,
            "RECONFIG: counters"
        );
    }
}

impl Default for ReconfigStats {
    fn default() -> Self {
        Self::new()
    }
}
