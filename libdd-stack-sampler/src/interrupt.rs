// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Interrupt-context stage of the sampling pipeline.
//!
//! Runs on the interrupted thread, in signal context. Everything here is
//! restricted to atomic operations on the thread's own state and the two
//! host primitives documented as interrupt-safe. No allocation, no locks,
//! no logging.

use crate::capture::deferred_capture_job;
use crate::counters::SkipReason;
use crate::host::ScheduleOutcome;
use crate::state::{with_current, ThreadSamplerState};
use std::ptr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

/// Entry point for a "please sample" interrupt on the calling thread.
///
/// Installed as the OS signal handler by [`crate::StackSampler::install`];
/// hosts that deliver interrupts through their own mechanism can call it
/// directly. Async-signal-safe.
pub fn on_sample_interrupt() {
    let saved = errno::errno();
    with_current(handle_interrupt);
    errno::set_errno(saved);
}

pub(crate) fn handle_interrupt(state: &ThreadSamplerState) {
    // Disarmed is not a skip.
    if !state.ok_to_sample.load(Relaxed) {
        return;
    }
    if state.in_signal_handler.swap(true, Acquire) {
        state.counters.incr(SkipReason::InSignalHandler);
        return;
    }
    request_capture(state);
    state.in_signal_handler.store(false, Release);
}

fn request_capture(state: &ThreadSamplerState) {
    let host = state.host();
    if host.is_collector_paused() {
        state.counters.incr(SkipReason::InGc);
        return;
    }
    // Claim the pending-job slot before enqueueing: a host may run the job
    // synchronously, and the job clears the flag on exit.
    if state.job_registered.swap(true, AcqRel) {
        state.counters.incr(SkipReason::JobRegistered);
        return;
    }
    match host.schedule_deferred(deferred_capture_job, ptr::null_mut()) {
        ScheduleOutcome::Accepted | ScheduleOutcome::AlreadyQueued => {}
        ScheduleOutcome::Rejected => {
            state.job_registered.store(false, Release);
            state.counters.incr(SkipReason::JobRejected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::attach_current_for_test;
    use crate::test_utils::SyntheticHost;
    use std::sync::Arc;

    #[test]
    fn test_disarmed_thread_is_ignored() {
        let host = Arc::new(SyntheticHost::new());
        let state = attach_current_for_test(host.clone(), 4, 8);
        on_sample_interrupt();
        assert_eq!(host.pending_jobs(), 0);
        assert_eq!(state.counters().total_skipped(), 0);
    }

    #[test]
    fn test_unregistered_thread_is_ignored() {
        let host = Arc::new(SyntheticHost::new());
        on_sample_interrupt();
        assert_eq!(host.pending_jobs(), 0);
    }

    #[test]
    fn test_overlapping_interrupts_enqueue_one_job() {
        let host = Arc::new(SyntheticHost::new());
        host.set_stack(&[(1, 1)]);
        let state = attach_current_for_test(host.clone(), 4, 8);
        state.ok_to_sample.store(true, Relaxed);

        on_sample_interrupt();
        on_sample_interrupt();
        on_sample_interrupt();
        assert_eq!(host.pending_jobs(), 1);
        assert!(state.job_registered.load(Relaxed));
        assert_eq!(state.counters().skipped_in_job_registered, 2);

        assert_eq!(host.run_pending_jobs(), 1);
        assert!(!state.job_registered.load(Relaxed));
        assert_eq!(state.cur_traces_num(), 1);

        on_sample_interrupt();
        assert_eq!(host.pending_jobs(), 1);
    }

    #[test]
    fn test_reentrant_delivery_is_counted() {
        let host = Arc::new(SyntheticHost::new());
        let state = attach_current_for_test(host.clone(), 4, 8);
        state.ok_to_sample.store(true, Relaxed);
        state.in_signal_handler.store(true, Relaxed);

        on_sample_interrupt();
        assert_eq!(state.counters().skipped_in_signal_handler, 1);
        assert_eq!(host.pending_jobs(), 0);
        // The outer delivery still owns the flag.
        assert!(state.in_signal_handler.load(Relaxed));
    }

    #[test]
    fn test_collector_pause_is_counted() {
        let host = Arc::new(SyntheticHost::new());
        let state = attach_current_for_test(host.clone(), 4, 8);
        state.ok_to_sample.store(true, Relaxed);
        host.set_collector_paused(true);

        on_sample_interrupt();
        assert_eq!(state.counters().skipped_in_gc, 1);
        assert_eq!(host.pending_jobs(), 0);
        assert!(!state.in_signal_handler.load(Relaxed));
        assert!(!state.job_registered.load(Relaxed));
    }

    #[test]
    fn test_rejected_job_releases_slot() {
        let host = Arc::new(SyntheticHost::new());
        let state = attach_current_for_test(host.clone(), 4, 8);
        state.ok_to_sample.store(true, Relaxed);
        host.set_reject_jobs(true);

        on_sample_interrupt();
        assert_eq!(state.counters().skipped_job_rejected, 1);
        assert!(!state.job_registered.load(Relaxed));

        host.set_reject_jobs(false);
        on_sample_interrupt();
        assert_eq!(host.pending_jobs(), 1);
    }

    #[test]
    fn test_errno_is_preserved() {
        let host = Arc::new(SyntheticHost::new());
        let state = attach_current_for_test(host.clone(), 4, 8);
        state.ok_to_sample.store(true, Relaxed);
        errno::set_errno(errno::Errno(libc::EINTR));
        on_sample_interrupt();
        assert_eq!(errno::errno().0, libc::EINTR);
    }
}
