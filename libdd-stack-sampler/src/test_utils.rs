// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A scripted [`HostRuntime`] for tests.
//!
//! Each thread scripts its own stack with [`SyntheticHost::set_stack`]. The
//! deferred-execution queue holds at most one job per thread and is drained
//! by [`SyntheticHost::run_pending_jobs`], which plays the role of the host's
//! safe point.

use crate::host::{DeferredJob, FrameHandle, FrameInfo, HostRuntime, RootToken, ScheduleOutcome};
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering::SeqCst};

thread_local! {
    // Touched from the signal handler: const, no destructor.
    static PENDING: Cell<Option<(DeferredJob, *mut c_void)>> = const { Cell::new(None) };
    static STACK: RefCell<Vec<(FrameHandle, i32)>> = const { RefCell::new(Vec::new()) };
}

#[derive(Default)]
pub struct SyntheticHost {
    collector_paused: AtomicBool,
    reject_jobs: AtomicBool,
    fail_next_capture: AtomicBool,
    capture_on_describe: AtomicBool,
    unrooted_resolutions: AtomicUsize,
    unreliable_innermost_frames: AtomicUsize,
    captures: AtomicUsize,
    next_root: AtomicU64,
    // token -> (base address, len)
    roots: Mutex<HashMap<u64, (usize, usize)>>,
    frames: Mutex<HashMap<FrameHandle, FrameInfo>>,
}

impl SyntheticHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the calling thread's stack, innermost frame first, as
    /// `(frame handle, line)` pairs.
    pub fn set_stack(&self, stack: &[(usize, i32)]) {
        STACK.with(|s| {
            *s.borrow_mut() = stack
                .iter()
                .map(|&(frame, line)| (FrameHandle(frame), line))
                .collect();
        });
    }

    pub fn describe(&self, frame: FrameHandle, info: FrameInfo) {
        self.frames.lock().insert(frame, info);
    }

    pub fn set_collector_paused(&self, paused: bool) {
        self.collector_paused.store(paused, SeqCst);
    }

    pub fn set_reject_jobs(&self, reject: bool) {
        self.reject_jobs.store(reject, SeqCst);
    }

    pub fn set_unreliable_innermost_frames(&self, count: usize) {
        self.unreliable_innermost_frames.store(count, SeqCst);
    }

    /// Makes the next capture fault midway through writing frames.
    pub fn fail_next_capture(&self) {
        self.fail_next_capture.store(true, SeqCst);
    }

    /// Makes `describe_frame` run a capture first, as a host whose frame
    /// introspection reaches a safe point would.
    pub fn set_capture_on_describe(&self, enabled: bool) {
        self.capture_on_describe.store(enabled, SeqCst);
    }

    /// Frames that `describe_frame` was asked about while no registered
    /// root range held them.
    pub fn unrooted_resolutions(&self) -> usize {
        self.unrooted_resolutions.load(SeqCst)
    }

    fn is_rooted(&self, frame: FrameHandle) -> bool {
        self.roots.lock().values().any(|&(base, len)| {
            // SAFETY: registered ranges stay allocated until unregistered,
            // and nothing writes to them while a frame is being described.
            let rooted = unsafe { std::slice::from_raw_parts(base as *const FrameHandle, len) };
            rooted.contains(&frame)
        })
    }

    /// Completed calls to the capture primitive.
    pub fn captures(&self) -> usize {
        self.captures.load(SeqCst)
    }

    /// Jobs waiting on the calling thread.
    pub fn pending_jobs(&self) -> usize {
        PENDING.with(|p| p.get().map_or(0, |_| 1))
    }

    /// Runs the calling thread's pending job, if any, and returns how many
    /// ran.
    pub fn run_pending_jobs(&self) -> usize {
        match PENDING.with(|p| p.take()) {
            Some((job, data)) => {
                job(data);
                1
            }
            None => 0,
        }
    }

    pub fn registered_roots(&self) -> usize {
        self.roots.lock().len()
    }

    /// Total number of frame handles currently registered as roots.
    pub fn registered_root_len(&self) -> usize {
        self.roots.lock().values().map(|&(_, len)| len).sum()
    }
}

impl HostRuntime for SyntheticHost {
    #[allow(clippy::panic)]
    fn capture_frames(&self, skip: usize, frames: &mut [FrameHandle], lines: &mut [i32]) -> usize {
        let fail = self.fail_next_capture.swap(false, SeqCst);
        let count = STACK.with(|stack| {
            let stack = stack.borrow();
            let mut written = 0;
            for ((frame_out, line_out), &(frame, line)) in frames
                .iter_mut()
                .zip(lines.iter_mut())
                .zip(stack.iter().skip(skip))
            {
                *frame_out = frame;
                *line_out = line;
                written += 1;
                if fail {
                    panic!("synthetic fault while walking frames");
                }
            }
            written
        });
        self.captures.fetch_add(1, SeqCst);
        count
    }

    fn schedule_deferred(&self, job: DeferredJob, data: *mut c_void) -> ScheduleOutcome {
        if self.reject_jobs.load(SeqCst) {
            return ScheduleOutcome::Rejected;
        }
        PENDING.with(|p| match p.get() {
            Some(_) => ScheduleOutcome::AlreadyQueued,
            None => {
                p.set(Some((job, data)));
                ScheduleOutcome::Accepted
            }
        })
    }

    fn is_collector_paused(&self) -> bool {
        self.collector_paused.load(SeqCst)
    }

    unsafe fn register_roots(&self, base: *const FrameHandle, len: usize) -> Option<RootToken> {
        let token = self.next_root.fetch_add(1, SeqCst);
        self.roots.lock().insert(token, (base as usize, len));
        Some(RootToken(token))
    }

    fn unregister_roots(&self, token: RootToken) {
        self.roots.lock().remove(&token.0);
    }

    fn describe_frame(&self, frame: FrameHandle) -> FrameInfo {
        if self.capture_on_describe.load(SeqCst) {
            crate::capture::record_sample();
        }
        if !self.is_rooted(frame) {
            self.unrooted_resolutions.fetch_add(1, SeqCst);
        }
        self.frames.lock().get(&frame).cloned().unwrap_or_default()
    }

    fn unreliable_innermost_frames(&self) -> usize {
        self.unreliable_innermost_frames.load(SeqCst)
    }
}
