// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Safe-point stage of the sampling pipeline.
//!
//! The host runs [`deferred_capture_job`] on the sampled thread once it
//! reaches a safe point. This is the only place a mutator pays for sampling.

use crate::counters::SkipReason;
use crate::state::{with_current, ThreadSamplerState};
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering::Release};

/// Deferred job handed to [`crate::HostRuntime::schedule_deferred`].
///
/// `data` is unused; the job always records into the calling thread's own
/// state.
pub extern "C" fn deferred_capture_job(_data: *mut c_void) {
    with_current(capture_into);
}

/// Records one sample of the calling thread right now, as the deferred job
/// would. Must be called at a point where the host's capture primitive is
/// safe to use.
pub fn record_sample() {
    with_current(capture_into);
}

/// Clears the pending-job flag however the capture exits.
struct JobSlotGuard<'a>(&'a AtomicBool);

impl Drop for JobSlotGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Release);
    }
}

pub(crate) fn capture_into(state: &ThreadSamplerState) {
    let _job_slot = JobSlotGuard(&state.job_registered);

    if !state.is_armed() {
        state.counters.incr(SkipReason::NotRunning);
        return;
    }
    let host = state.host();
    if host.is_collector_paused() {
        state.counters.incr(SkipReason::InGc);
        return;
    }
    let Some(slot) = state.next_free_slot() else {
        state.counters.incr(SkipReason::BufferFull);
        return;
    };

    // SAFETY: we are on the owning thread, outside of interrupt context, and
    // `slot` came from `next_free_slot`. The row borrow ends with this block.
    let usable = unsafe {
        let (frames, lines) = state.row_mut(slot);
        let captured = panic::catch_unwind(AssertUnwindSafe(|| {
            host.capture_frames(0, frames, lines)
        }));
        let Ok(captured) = captured else {
            // Nothing was published; the partial row is simply overwritten by
            // the next capture.
            state.counters.incr(SkipReason::Rescued);
            return;
        };
        let captured = captured.min(frames.len());
        let start_frame_index = state.start_frame_index();
        // A full row may be a truncated stack; the boundary counts from the
        // outermost frame of the real one.
        let depth = if captured == frames.len() && start_frame_index > 0 {
            host.current_depth().max(captured)
        } else {
            captured
        };
        let trim = host.unreliable_innermost_frames();
        let usable = depth
            .saturating_sub(start_frame_index)
            .min(captured)
            .saturating_sub(trim);
        if usable > 0 && trim > 0 {
            frames.copy_within(trim..trim + usable, 0);
            lines.copy_within(trim..trim + usable, 0);
        }
        usable
    };

    if usable > 0 {
        // SAFETY: same thread, same slot, `usable <= max_frames`.
        unsafe { state.commit(slot, usable) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FrameHandle;
    use crate::state::attach_current_for_test;
    use crate::test_utils::SyntheticHost;
    use std::sync::atomic::Ordering::Relaxed;
    use std::sync::Arc;

    fn armed(host: &Arc<SyntheticHost>, max_traces: usize, max_frames: usize) -> Arc<ThreadSamplerState> {
        let state = attach_current_for_test(host.clone(), max_traces, max_frames);
        state.ok_to_sample.store(true, Relaxed);
        state
    }

    #[test]
    fn test_records_innermost_first() {
        let host = Arc::new(SyntheticHost::new());
        host.set_stack(&[(1, 10), (2, 20), (3, 30)]);
        let state = armed(&host, 4, 8);

        record_sample();
        assert_eq!(state.cur_traces_num(), 1);
        let (frames, lines) = unsafe { state.row(0) };
        assert_eq!(frames, &[FrameHandle(1), FrameHandle(2), FrameHandle(3)]);
        assert_eq!(lines, &[10, 20, 30]);
    }

    #[test]
    fn test_start_frame_index_drops_outer_frames() {
        let host = Arc::new(SyntheticHost::new());
        host.set_stack(&[(1, 10), (2, 20), (3, 30), (4, 40)]);
        let state = armed(&host, 4, 8);
        state.update_indexes(3, 0);

        record_sample();
        let (frames, _) = unsafe { state.row(0) };
        assert_eq!(frames, &[FrameHandle(1)]);

        // Nothing left above the boundary: no trace.
        state.update_indexes(4, 0);
        record_sample();
        assert_eq!(state.cur_traces_num(), 1);
    }

    #[test]
    fn test_unreliable_innermost_frames_are_trimmed() {
        let host = Arc::new(SyntheticHost::new());
        host.set_stack(&[(9, 0), (1, 10), (2, 20)]);
        host.set_unreliable_innermost_frames(1);
        let state = armed(&host, 4, 8);

        record_sample();
        let (frames, lines) = unsafe { state.row(0) };
        assert_eq!(frames, &[FrameHandle(1), FrameHandle(2)]);
        assert_eq!(lines, &[10, 20]);
    }

    #[test]
    fn test_deep_stack_is_truncated_to_row() {
        let host = Arc::new(SyntheticHost::new());
        let stack: Vec<(usize, i32)> = (1..=20).map(|i| (i, i as i32)).collect();
        host.set_stack(&stack);
        let state = armed(&host, 2, 5);

        record_sample();
        let (frames, _) = unsafe { state.row(0) };
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0], FrameHandle(1));
    }

    #[test]
    fn test_boundary_on_truncated_stack_counts_real_depth() {
        let host = Arc::new(SyntheticHost::new());
        let stack: Vec<(usize, i32)> = (1..=20).map(|i| (i, i as i32)).collect();
        host.set_stack(&stack);
        let state = armed(&host, 4, 5);

        // 5 frames above the boundary fill the row.
        state.update_indexes(15, 0);
        record_sample();
        let (frames, _) = unsafe { state.row(0) };
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0], FrameHandle(1));

        state.update_indexes(17, 0);
        record_sample();
        let (frames, _) = unsafe { state.row(1) };
        assert_eq!(frames, &[FrameHandle(1), FrameHandle(2), FrameHandle(3)]);

        state.update_indexes(20, 0);
        record_sample();
        assert_eq!(state.cur_traces_num(), 2);
    }

    #[test]
    fn test_buffer_full_is_counted_not_wrapped() {
        let host = Arc::new(SyntheticHost::new());
        host.set_stack(&[(1, 1)]);
        let state = armed(&host, 2, 4);

        record_sample();
        record_sample();
        record_sample();
        assert_eq!(state.cur_traces_num(), 2);
        assert_eq!(state.counters().skipped_buffer_full, 1);
    }

    #[test]
    fn test_collector_pause_is_counted() {
        let host = Arc::new(SyntheticHost::new());
        host.set_stack(&[(1, 1)]);
        let state = armed(&host, 2, 4);
        host.set_collector_paused(true);

        record_sample();
        assert_eq!(state.cur_traces_num(), 0);
        assert_eq!(state.counters().skipped_in_gc, 1);
    }

    #[test]
    fn test_disarmed_capture_is_counted_and_releases_job_slot() {
        let host = Arc::new(SyntheticHost::new());
        host.set_stack(&[(1, 1)]);
        let state = attach_current_for_test(host.clone(), 2, 4);
        state.job_registered.store(true, Relaxed);

        deferred_capture_job(std::ptr::null_mut());
        assert_eq!(state.cur_traces_num(), 0);
        assert_eq!(state.counters().skipped_in_not_running, 1);
        assert!(!state.job_registered.load(Relaxed));
    }

    #[test]
    fn test_faulting_capture_is_rescued() {
        let host = Arc::new(SyntheticHost::new());
        host.set_stack(&[(1, 1), (2, 2)]);
        let state = armed(&host, 2, 4);
        state.job_registered.store(true, Relaxed);
        host.fail_next_capture();

        deferred_capture_job(std::ptr::null_mut());
        assert_eq!(state.cur_traces_num(), 0);
        assert_eq!(state.counters().rescued_profile_frames, 1);
        assert!(!state.job_registered.load(Relaxed));

        record_sample();
        assert_eq!(state.cur_traces_num(), 1);
    }
}
