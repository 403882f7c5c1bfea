// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libdd_stack_sampler::{DeferredJob, FrameHandle, FrameInfo, HostRuntime, RootToken, ScheduleOutcome};
use std::ffi::{c_char, c_void};

/// A string borrowed from the host for the duration of a callback. It need
/// not be NUL-terminated.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct CharSlice {
    pub ptr: *const c_char,
    pub len: usize,
}

impl CharSlice {
    pub const EMPTY: CharSlice = CharSlice {
        ptr: std::ptr::null(),
        len: 0,
    };

    /// Copies the string out; null means "unknown". Invalid UTF-8 is
    /// replaced.
    ///
    /// # Safety
    /// A non-null `ptr` must be valid for `len` bytes.
    unsafe fn to_owned_string(self) -> Option<String> {
        if self.ptr.is_null() {
            return None;
        }
        let bytes = std::slice::from_raw_parts(self.ptr.cast::<u8>(), self.len);
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Filled in by [`HostVTable::describe_frame`].
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct FrameDescription {
    pub absolute_path: CharSlice,
    pub label: CharSlice,
    pub classpath: CharSlice,
    pub first_lineno: i32,
    pub has_first_lineno: bool,
}

impl Default for FrameDescription {
    fn default() -> Self {
        Self {
            absolute_path: CharSlice::EMPTY,
            label: CharSlice::EMPTY,
            classpath: CharSlice::EMPTY,
            first_lineno: 0,
            has_first_lineno: false,
        }
    }
}

/// Host runtime callbacks.
///
/// `schedule_deferred` and `is_collector_paused` are called from a signal
/// handler and must be async-signal-safe.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct HostVTable {
    /// Writes up to `max` innermost frames of the calling thread, after
    /// skipping `skip`, and returns how many were written.
    pub capture_frames:
        extern "C" fn(skip: usize, frames: *mut FrameHandle, lines: *mut i32, max: usize) -> usize,
    pub schedule_deferred: extern "C" fn(job: DeferredJob, data: *mut c_void) -> ScheduleOutcome,
    pub is_collector_paused: extern "C" fn() -> bool,
    /// Optional. Returns a non-zero token, or 0 if nothing was registered.
    pub register_roots: Option<extern "C" fn(base: *const FrameHandle, len: usize) -> u64>,
    pub unregister_roots: Option<extern "C" fn(token: u64)>,
    /// Returns false if the frame cannot be described. Strings only need to
    /// stay valid until the callback returns to the sampler.
    pub describe_frame: extern "C" fn(frame: FrameHandle, out: *mut FrameDescription) -> bool,
    pub unreliable_innermost_frames: usize,
}

pub(crate) struct VTableHost(pub(crate) HostVTable);

impl HostRuntime for VTableHost {
    fn capture_frames(&self, skip: usize, frames: &mut [FrameHandle], lines: &mut [i32]) -> usize {
        let max = frames.len().min(lines.len());
        (self.0.capture_frames)(skip, frames.as_mut_ptr(), lines.as_mut_ptr(), max).min(max)
    }

    fn schedule_deferred(&self, job: DeferredJob, data: *mut c_void) -> ScheduleOutcome {
        (self.0.schedule_deferred)(job, data)
    }

    fn is_collector_paused(&self) -> bool {
        (self.0.is_collector_paused)()
    }

    unsafe fn register_roots(&self, base: *const FrameHandle, len: usize) -> Option<RootToken> {
        let register = self.0.register_roots?;
        match register(base, len) {
            0 => None,
            token => Some(RootToken(token)),
        }
    }

    fn unregister_roots(&self, token: RootToken) {
        if let Some(unregister) = self.0.unregister_roots {
            unregister(token.0);
        }
    }

    fn describe_frame(&self, frame: FrameHandle) -> FrameInfo {
        let mut out = FrameDescription::default();
        if !(self.0.describe_frame)(frame, &mut out) {
            return FrameInfo::default();
        }
        // SAFETY: the callback contract keeps the strings alive until here.
        unsafe {
            FrameInfo {
                absolute_path: out.absolute_path.to_owned_string(),
                label: out.label.to_owned_string(),
                classpath: out.classpath.to_owned_string(),
                first_lineno: out.has_first_lineno.then_some(out.first_lineno),
            }
        }
    }

    fn unreliable_innermost_frames(&self) -> usize {
        self.0.unreliable_innermost_frames
    }
}
