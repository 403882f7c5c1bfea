// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The surface the sampler consumes from the host runtime.
//!
//! The sampler never walks a stack itself. It relies on the runtime to read
//! its own call-stack representation, to run callbacks at a safe point, and
//! to keep captured frame handles alive while they sit in a trace buffer.

use serde::{Deserialize, Serialize};
use std::ffi::c_void;

/// An opaque handle into the host runtime's call-stack representation.
///
/// The sampler copies these around and hands them back to the host for
/// introspection; it never dereferences them.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameHandle(pub usize);

impl FrameHandle {
    pub const NULL: FrameHandle = FrameHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Token returned by [`HostRuntime::register_roots`], given back on release.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RootToken(pub u64);

/// Result of asking the host to run a callback at its next safe point.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleOutcome {
    Accepted,
    /// The same job is already pending on this thread; it will still run.
    AlreadyQueued,
    Rejected,
}

/// Callback shape accepted by the deferred-execution scheduler.
pub type DeferredJob = extern "C" fn(*mut c_void);

/// What the host knows about a frame. Fields the host cannot resolve are
/// left as `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub absolute_path: Option<String>,
    pub label: Option<String>,
    pub classpath: Option<String>,
    pub first_lineno: Option<i32>,
}

/// Host runtime primitives.
///
/// Implementations are shared by every profiled thread and by the
/// background threads, hence `Send + Sync`.
///
/// # Async-signal-safety
/// [`HostRuntime::is_collector_paused`] and [`HostRuntime::schedule_deferred`]
/// are called from the sampling signal handler. They must not allocate, lock,
/// or otherwise do anything that is unsafe in interrupt context.
pub trait HostRuntime: Send + Sync + 'static {
    /// Fills `frames` and `lines` (same length) with the innermost frames of
    /// the calling thread's stack, skipping `skip` of them, and returns the
    /// number of entries written.
    ///
    /// Only valid on the thread whose stack is read, outside of interrupt
    /// context.
    fn capture_frames(&self, skip: usize, frames: &mut [FrameHandle], lines: &mut [i32]) -> usize;

    /// Queues `job(data)` to run at the next safe point on the calling thread.
    /// Called in interrupt context.
    fn schedule_deferred(&self, job: DeferredJob, data: *mut c_void) -> ScheduleOutcome;

    /// Whether a collector pause is in progress. Called in interrupt context.
    fn is_collector_paused(&self) -> bool;

    /// Asks the collector to treat `len` frame handles starting at `base` as
    /// roots until [`HostRuntime::unregister_roots`] is called with the
    /// returned token. Hosts whose frame handles are not collectable return
    /// `None`.
    ///
    /// # Safety
    /// `base..base + len` stays allocated until the token is released.
    unsafe fn register_roots(&self, _base: *const FrameHandle, _len: usize) -> Option<RootToken> {
        None
    }

    fn unregister_roots(&self, _token: RootToken) {}

    /// Resolves a frame handle. Only called at extraction time.
    fn describe_frame(&self, frame: FrameHandle) -> FrameInfo;

    /// Number of innermost frames the capture primitive reports that do not
    /// belong to the profiled program (e.g. the frame running the deferred
    /// job). They are trimmed from every recorded trace.
    fn unreliable_innermost_frames(&self) -> usize {
        0
    }

    /// Depth of the calling thread's stack, as the capture primitive sees it.
    /// Not bounded by the size of a trace row.
    fn current_depth(&self) -> usize {
        let mut frames = [FrameHandle::NULL; crate::BUF_SIZE];
        let mut lines = [0i32; crate::BUF_SIZE];
        let mut depth = 0;
        loop {
            let n = self.capture_frames(depth, &mut frames, &mut lines);
            depth += n;
            if n < frames.len() {
                return depth;
            }
        }
    }
}
