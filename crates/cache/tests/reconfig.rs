#![forbid(unsafe_code)]

use tiller_cache::{ReconfigKind, ReconfigStats};

fn stats() -> ReconfigStats {
    // Small limits so tests exercise the thresholds directly:
    // 3 incrementals or 60s between checks, 5 configs or 30s between timers.
    ReconfigStats::with_limits(3, 60.0, 5, 30.0)
}

#[test]
fn first_incremental_is_promoted_to_complete() {
    let mut s = stats();

    // No complete has ever happened, so this cannot be an incremental.
    s.mark(ReconfigKind::Incremental, Some(1.0));

    assert_eq!(s.complete_count, 1);
    assert_eq!(s.incremental_count, 0);
    assert_eq!(s.incrementals_outstanding(), 0);
}

#[test]
fn no_check_needed_after_complete() {
    let mut s = stats();
    s.mark(ReconfigKind::Complete, Some(1.0));
    assert!(!s.needs_check(Some(2.0)));

    s.mark(ReconfigKind::Incremental, Some(3.0));
    s.mark(ReconfigKind::Complete, Some(4.0));

    // The complete clears the outstanding incrementals.
    assert!(!s.needs_check(Some(5.0)));
    assert_eq!(s.incrementals_outstanding(), 0);
}

#[test]
fn check_needed_after_enough_incrementals() {
    let mut s = stats();
    s.mark(ReconfigKind::Complete, Some(1.0));

    s.mark(ReconfigKind::Incremental, Some(2.0));
    s.mark(ReconfigKind::Incremental, Some(3.0));
    assert!(!s.needs_check(Some(4.0)));

    s.mark(ReconfigKind::Incremental, Some(5.0));
    assert!(s.needs_check(Some(6.0)));
}

#[test]
fn check_needed_after_enough_time() {
    let mut s = stats();
    s.mark(ReconfigKind::Complete, Some(1.0));
    s.mark(ReconfigKind::Incremental, Some(2.0));

    assert!(!s.needs_check(Some(10.0)));
    // Baseline is the complete at t=1.
    assert!(s.needs_check(Some(62.0)));
}

#[test]
fn mark_checked_resets_the_incremental_chain() {
    let mut s = stats();
    s.mark(ReconfigKind::Complete, Some(1.0));
    for t in 2..5 {
        s.mark(ReconfigKind::Incremental, Some(t as f64));
    }
    assert!(s.needs_check(Some(5.0)));

    s.mark_checked(true, Some(5.0));
    assert!(!s.needs_check(Some(6.0)));
    assert_eq!(s.checks, 1);
    assert_eq!(s.check_errors, 0);

    s.mark(ReconfigKind::Incremental, Some(7.0));
    s.mark_checked(false, Some(8.0));
    assert_eq!(s.check_errors, 1);
}

#[test]
fn timers_by_count() {
    let mut s = stats();
    s.mark(ReconfigKind::Complete, Some(1.0));
    for t in 2..5 {
        s.mark(ReconfigKind::Incremental, Some(t as f64));
    }
    assert!(!s.needs_timers(Some(5.0)));

    // Diag events count toward the timer flush even though they are not
    // real reconfigurations.
    s.mark(ReconfigKind::Diag, Some(5.0));
    assert!(s.needs_timers(Some(6.0)));

    s.mark_timers_logged(Some(6.0));
    assert!(!s.needs_timers(Some(7.0)));
}

#[test]
fn timers_by_time_baseline_is_last_complete_until_first_flush() {
    let mut s = stats();
    s.mark(ReconfigKind::Complete, Some(1.0));
    s.mark(ReconfigKind::Incremental, Some(2.0));

    assert!(!s.needs_timers(Some(20.0)));
    // 30s past the complete at t=1.
    assert!(s.needs_timers(Some(32.0)));

    s.mark_timers_logged(Some(32.0));
    s.mark(ReconfigKind::Incremental, Some(33.0));

    // Now the baseline is the flush at t=32.
    assert!(!s.needs_timers(Some(40.0)));
    assert!(s.needs_timers(Some(63.0)));
}

#[test]
fn no_activity_means_no_work() {
    let s = stats();
    assert!(!s.needs_check(Some(100.0)));
    assert!(!s.needs_timers(Some(100.0)));
}
