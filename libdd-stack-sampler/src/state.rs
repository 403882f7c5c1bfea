// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-thread sampler state and the current-thread slot.
//!
//! Every profiled thread owns one [`ThreadSamplerState`]. The trace payload
//! is only ever touched by the owning thread: by its signal handler (flags
//! and counters only), by the deferred capture that the host runs on it, and
//! by the consumer extracting traces on it. Other threads only read the
//! atomics, or drop the state once the owner is known to be gone.

use crate::counters::{SamplerCounters, SkipCounters};
use crate::host::{FrameHandle, HostRuntime, RootToken};
use crate::registry::RegistryHandle;
use crate::thread_handle::ThreadHandle;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicU16};
use std::sync::Arc;

pub(crate) struct ThreadSamplerState {
    host: Arc<dyn HostRuntime>,
    thread: ThreadHandle,
    sampler_id: u64,
    max_traces: usize,
    max_frames: usize,
    // `max_traces` rows of `max_frames` entries each.
    frames: UnsafeCell<Box<[FrameHandle]>>,
    lines: UnsafeCell<Box<[i32]>>,
    // Valid entries per row; a row is only read below `cur_traces_num`.
    tracelines: UnsafeCell<Box<[u16]>>,
    pub(crate) ok_to_sample: AtomicBool,
    pub(crate) in_signal_handler: AtomicBool,
    pub(crate) job_registered: AtomicBool,
    start_frame_index: AtomicU16,
    start_trace_index: AtomicU16,
    cur_traces_num: AtomicU16,
    pub(crate) counters: SkipCounters,
    roots: Option<RootToken>,
}

// SAFETY: the `UnsafeCell` buffers are only accessed by the owning thread
// (see the `unsafe fn` contracts below). Everything else is atomic or
// immutable after construction.
unsafe impl Sync for ThreadSamplerState {}
unsafe impl Send for ThreadSamplerState {}

impl std::fmt::Debug for ThreadSamplerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadSamplerState")
            .field("thread", &self.thread)
            .field("ok_to_sample", &self.ok_to_sample.load(Relaxed))
            .field("cur_traces_num", &self.cur_traces_num.load(Relaxed))
            .field("start_trace_index", &self.start_trace_index.load(Relaxed))
            .field("start_frame_index", &self.start_frame_index.load(Relaxed))
            .finish_non_exhaustive()
    }
}

impl ThreadSamplerState {
    pub(crate) fn new(
        host: Arc<dyn HostRuntime>,
        thread: ThreadHandle,
        sampler_id: u64,
        max_traces: usize,
        max_frames: usize,
    ) -> Option<Self> {
        let len = max_traces.checked_mul(max_frames)?;
        let frames = zeroed_frames(len);
        // SAFETY: `frames` is a live heap allocation; the token is released in
        // `Drop` before the box is freed.
        let roots = unsafe { host.register_roots(frames.as_ptr(), len) };
        Some(Self {
            host,
            thread,
            sampler_id,
            max_traces,
            max_frames,
            frames: UnsafeCell::new(frames),
            lines: UnsafeCell::new(vec![0i32; len].into_boxed_slice()),
            tracelines: UnsafeCell::new(vec![0u16; max_traces].into_boxed_slice()),
            ok_to_sample: AtomicBool::new(false),
            in_signal_handler: AtomicBool::new(false),
            job_registered: AtomicBool::new(false),
            start_frame_index: AtomicU16::new(0),
            start_trace_index: AtomicU16::new(0),
            cur_traces_num: AtomicU16::new(0),
            counters: SkipCounters::default(),
            roots,
        })
    }

    pub(crate) fn host(&self) -> &dyn HostRuntime {
        self.host.as_ref()
    }

    pub(crate) fn thread(&self) -> ThreadHandle {
        self.thread
    }

    pub(crate) fn sampler_id(&self) -> u64 {
        self.sampler_id
    }

    pub(crate) fn max_traces(&self) -> usize {
        self.max_traces
    }

    pub(crate) fn max_frames(&self) -> usize {
        self.max_frames
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.ok_to_sample.load(Relaxed)
    }

    pub(crate) fn cur_traces_num(&self) -> usize {
        self.cur_traces_num.load(Acquire) as usize
    }

    pub(crate) fn start_trace_index(&self) -> usize {
        self.start_trace_index.load(Relaxed) as usize
    }

    pub(crate) fn start_frame_index(&self) -> usize {
        self.start_frame_index.load(Relaxed) as usize
    }

    pub(crate) fn counters(&self) -> SamplerCounters {
        self.counters.snapshot()
    }

    /// The trace boundary never moves past the traces captured so far. The
    /// frame boundary is a stack depth and may exceed the row size.
    pub(crate) fn update_indexes(&self, frame_index: usize, trace_index: usize) {
        let frame_index = frame_index.min(u16::MAX as usize);
        let trace_index = trace_index.min(self.cur_traces_num());
        self.start_frame_index.store(frame_index as u16, Relaxed);
        self.start_trace_index.store(trace_index as u16, Relaxed);
    }

    /// Drops every buffered trace and zeroes the counters.
    pub(crate) fn reset(&self) {
        self.start_trace_index.store(0, Relaxed);
        self.cur_traces_num.store(0, Release);
        self.counters.reset();
    }

    /// Index of the next free row, if any.
    pub(crate) fn next_free_slot(&self) -> Option<usize> {
        let cur = self.cur_traces_num();
        (cur < self.max_traces).then_some(cur)
    }

    /// Row `slot` of the frame and line buffers.
    ///
    /// # Safety
    /// Must be called on the owning thread, outside of its signal handler,
    /// with `slot < max_traces`, and the returned slices must be dropped
    /// before any other accessor is used.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn row_mut(&self, slot: usize) -> (&mut [FrameHandle], &mut [i32]) {
        let range = slot * self.max_frames..(slot + 1) * self.max_frames;
        let frames = &mut (&mut (*self.frames.get()))[range.clone()];
        let lines = &mut (&mut (*self.lines.get()))[range];
        (frames, lines)
    }

    /// Publishes row `slot` with `count` entries and advances the cursor.
    ///
    /// # Safety
    /// Same contract as [`Self::row_mut`]; `slot` must be the value last
    /// returned by [`Self::next_free_slot`] and `count <= max_frames`.
    pub(crate) unsafe fn commit(&self, slot: usize, count: usize) {
        (*self.tracelines.get())[slot] = count as u16;
        self.cur_traces_num.store((slot + 1) as u16, Release);
    }

    /// Visible entries of row `slot`.
    ///
    /// # Safety
    /// Must be called on the owning thread with `slot < cur_traces_num`.
    pub(crate) unsafe fn row(&self, slot: usize) -> (&[FrameHandle], &[i32]) {
        let count = (*self.tracelines.get())[slot] as usize;
        let start = slot * self.max_frames;
        let frames = &(&(*self.frames.get()))[start..start + count];
        let lines = &(&(*self.lines.get()))[start..start + count];
        (frames, lines)
    }

    /// Consumes everything above the trace boundary.
    pub(crate) fn rewind_to_start(&self) {
        self.cur_traces_num
            .store(self.start_trace_index.load(Relaxed), Release);
    }
}

impl Drop for ThreadSamplerState {
    fn drop(&mut self) {
        if let Some(token) = self.roots.take() {
            self.host.unregister_roots(token);
        }
    }
}

fn zeroed_frames(len: usize) -> Box<[FrameHandle]> {
    // `vec![0usize; n]` is served by a zeroing allocation, so rows nobody
    // writes to are never committed.
    let raw = Box::into_raw(vec![0usize; len].into_boxed_slice());
    // SAFETY: `FrameHandle` is `repr(transparent)` over `usize`.
    unsafe { Box::from_raw(raw as *mut [FrameHandle]) }
}

/// Links the calling thread to its state. Dropped on explicit removal or by
/// the thread-local destructor when the thread exits.
pub(crate) struct Registration {
    pub(crate) state: Arc<ThreadSamplerState>,
    pub(crate) handle: RegistryHandle,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.state.ok_to_sample.store(false, Relaxed);
        // Unpublish before the state can be freed.
        let ours = Arc::as_ptr(&self.state);
        let _ = CURRENT.try_with(|c| {
            if c.get() == ours {
                c.set(ptr::null());
            }
        });
    }
}

thread_local! {
    // Const-initialized and without a destructor: reading it from a signal
    // handler does not allocate or register anything.
    static CURRENT: Cell<*const ThreadSamplerState> = const { Cell::new(ptr::null()) };
    static REGISTRATION: RefCell<Option<Registration>> = const { RefCell::new(None) };
}

/// Runs `f` with the calling thread's state, if it is registered.
/// Async-signal-safe.
#[inline]
pub(crate) fn with_current<R>(f: impl FnOnce(&ThreadSamplerState) -> R) -> Option<R> {
    let state = CURRENT.try_with(|c| c.get()).unwrap_or(ptr::null());
    if state.is_null() {
        return None;
    }
    // SAFETY: CURRENT is only non-null while `REGISTRATION` on this same
    // thread holds an `Arc` to the pointee, and it is cleared before that
    // `Arc` is released.
    Some(f(unsafe { &*state }))
}

/// Installs `registration` as the calling thread's. Returns it back if the
/// thread is already registered.
pub(crate) fn set_current(registration: Registration) -> Result<(), Registration> {
    REGISTRATION.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            return Err(registration);
        }
        let state = Arc::as_ptr(&registration.state);
        *slot = Some(registration);
        CURRENT.with(|c| c.set(state));
        Ok(())
    })
}

/// Detaches the calling thread's registration, if any. The caller decides
/// when to drop it.
#[cfg(test)]
pub(crate) fn take_current() -> Option<Registration> {
    REGISTRATION
        .try_with(|slot| slot.borrow_mut().take())
        .ok()
        .flatten()
}

/// Detaches the calling thread's registration if it belongs to `sampler_id`.
pub(crate) fn take_current_for(sampler_id: u64) -> Option<Registration> {
    REGISTRATION
        .try_with(|slot| {
            let mut slot = slot.borrow_mut();
            match slot.as_ref() {
                Some(r) if r.state.sampler_id() == sampler_id => slot.take(),
                _ => None,
            }
        })
        .ok()
        .flatten()
}

/// Points the calling thread's registration at a new registry entry, keeping
/// its state and buffered traces. Only applies to registrations owned by
/// `sampler_id`.
pub(crate) fn rebind_current(
    sampler_id: u64,
    relink: impl FnOnce(&Arc<ThreadSamplerState>) -> RegistryHandle,
) -> bool {
    REGISTRATION
        .try_with(|slot| match slot.borrow_mut().as_mut() {
            Some(r) if r.state.sampler_id() == sampler_id => {
                r.handle = relink(&r.state);
                true
            }
            _ => false,
        })
        .unwrap_or(false)
}

/// Registry handle and sampler of the calling thread, if registered.
pub(crate) fn current_registration() -> Option<(RegistryHandle, u64)> {
    REGISTRATION
        .try_with(|slot| {
            slot.borrow()
                .as_ref()
                .map(|r| (r.handle, r.state.sampler_id()))
        })
        .ok()
        .flatten()
}

/// Publishes a fresh, disarmed state for the calling thread without going
/// through a registry.
#[cfg(test)]
pub(crate) fn attach_current_for_test(
    host: Arc<dyn HostRuntime>,
    max_traces: usize,
    max_frames: usize,
) -> Arc<ThreadSamplerState> {
    let state = Arc::new(ThreadSamplerState::new(
        host,
        ThreadHandle::current(),
        0,
        max_traces,
        max_frames,
    )
    .unwrap());
    let registration = Registration {
        state: state.clone(),
        handle: RegistryHandle::detached(),
    };
    if set_current(registration).is_err() {
        panic!("test thread already registered");
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::SyntheticHost;

    fn state(host: &Arc<SyntheticHost>, max_traces: usize, max_frames: usize) -> ThreadSamplerState {
        ThreadSamplerState::new(
            host.clone(),
            ThreadHandle::current(),
            0,
            max_traces,
            max_frames,
        )
        .unwrap()
    }

    #[test]
    fn test_new_state_is_disarmed_and_empty() {
        let host = Arc::new(SyntheticHost::new());
        let state = state(&host, 4, 8);
        assert!(!state.is_armed());
        assert_eq!(state.cur_traces_num(), 0);
        assert_eq!(state.next_free_slot(), Some(0));
        assert_eq!(state.counters(), SamplerCounters::default());
    }

    #[test]
    fn test_roots_registered_for_lifetime() {
        let host = Arc::new(SyntheticHost::new());
        let s = state(&host, 4, 8);
        assert_eq!(host.registered_roots(), 1);
        assert_eq!(host.registered_root_len(), 32);
        drop(s);
        assert_eq!(host.registered_roots(), 0);
    }

    #[test]
    fn test_commit_and_read_rows() {
        let host = Arc::new(SyntheticHost::new());
        let state = state(&host, 2, 4);
        unsafe {
            let slot = state.next_free_slot().unwrap();
            let (frames, lines) = state.row_mut(slot);
            frames[..3].copy_from_slice(&[FrameHandle(1), FrameHandle(2), FrameHandle(3)]);
            lines[..3].copy_from_slice(&[10, 20, 30]);
            state.commit(slot, 3);

            let (frames, lines) = state.row(0);
            assert_eq!(frames, &[FrameHandle(1), FrameHandle(2), FrameHandle(3)]);
            assert_eq!(lines, &[10, 20, 30]);

            state.commit(1, 0);
        }
        assert_eq!(state.cur_traces_num(), 2);
        assert_eq!(state.next_free_slot(), None);
    }

    #[test]
    fn test_update_indexes_clamps() {
        let host = Arc::new(SyntheticHost::new());
        let state = state(&host, 4, 8);
        unsafe { state.commit(0, 0) };
        state.update_indexes(100, 100);
        assert_eq!(state.start_frame_index(), 100);
        state.update_indexes(1 << 20, 0);
        assert_eq!(state.start_frame_index(), u16::MAX as usize);
        assert_eq!(state.start_trace_index(), 1);
        state.reset();
        assert_eq!(state.start_trace_index(), 0);
        assert_eq!(state.cur_traces_num(), 0);
    }

    #[test]
    fn test_current_slot_lifecycle() {
        let host = Arc::new(SyntheticHost::new());
        assert!(with_current(|_| ()).is_none());
        let registration = Registration {
            state: Arc::new(state(&host, 1, 1)),
            handle: RegistryHandle::detached(),
        };
        set_current(registration).unwrap();
        assert_eq!(with_current(|s| s.max_frames()), Some(1));

        let duplicate = Registration {
            state: Arc::new(state(&host, 1, 1)),
            handle: RegistryHandle::detached(),
        };
        assert!(set_current(duplicate).is_err());

        let taken = take_current().unwrap();
        drop(taken);
        assert!(with_current(|_| ()).is_none());
    }
}
