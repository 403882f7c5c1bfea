// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Cross-thread statistical stack sampler for a managed runtime.
//!
//! A broadcast thread periodically interrupts every registered, armed
//! thread. The interrupt only asks the host runtime to run a capture job at
//! its next safe point; the job records the thread's stack into a bounded
//! per-thread buffer that the thread later drains with [`profile_frames`].
//!
//! ```no_run
//! # use libdd_stack_sampler::*;
//! # use std::sync::Arc;
//! # fn host() -> Arc<dyn HostRuntime> { unimplemented!() }
//! let sampler = StackSampler::new(host(), SamplerConfiguration::default());
//! sampler.install()?;
//! sampler.start();
//!
//! // On a request thread:
//! sampler.add_profiled_thread();
//! update_indexes(current_frame_index(), current_trace_index());
//! start_sampling();
//! // ... the work being profiled ...
//! stop_sampling(false);
//! let traces = profile_frames();
//! # Ok::<(), SamplerError>(())
//! ```

mod capture;
pub mod configuration;
mod counters;
mod driver;
mod error;
mod extraction;
mod host;
mod interrupt;
mod registry;
mod sampler;
mod signal;
mod state;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
mod thread_handle;

pub use capture::{deferred_capture_job, record_sample};
pub use configuration::{ForkPolicy, SamplerConfiguration};
pub use counters::{SamplerCounters, SamplerStats, SkipReason};
pub use error::SamplerError;
pub use extraction::{Trace, TraceLine, UNKNOWN_FIELD};
pub use host::{DeferredJob, FrameHandle, FrameInfo, HostRuntime, RootToken, ScheduleOutcome};
pub use interrupt::on_sample_interrupt;
pub use sampler::StackSampler;
pub use signal::installed_signal;
pub use thread_handle::{Delivery, ThreadHandle};

use std::sync::atomic::Ordering::Relaxed;
use std::time::Duration;
use tracing::debug;

/// Frames kept per trace.
pub const BUF_SIZE: usize = 512;
/// Traces buffered per thread between extractions.
pub const MAX_TRACES: usize = 3000;
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(5);

/// Whether this build can sample at all.
pub const ENABLED: bool = cfg!(unix);

/// Arms sampling for the calling thread. Idempotent. Returns `false` if the
/// thread is not registered.
pub fn start_sampling() -> bool {
    state::with_current(|s| s.ok_to_sample.store(true, Relaxed)).is_some()
}

/// Disarms sampling for the calling thread. With `reset`, also discards every
/// buffered trace and zeroes the skip counters. A capture already scheduled
/// when this is called is dropped and counted as `skipped_in_not_running`.
pub fn stop_sampling(reset: bool) -> bool {
    state::with_current(|s| {
        s.ok_to_sample.store(false, Relaxed);
        if reset {
            s.reset();
        }
    })
    .is_some()
}

/// Marks the consumption boundary for the calling thread: later extractions
/// only return traces captured at or after `trace_index`, each without its
/// `frame_index` outermost frames. Both are clamped to what is valid.
pub fn update_indexes(frame_index: usize, trace_index: usize) -> bool {
    state::with_current(|s| s.update_indexes(frame_index, trace_index)).is_some()
}

/// Number of traces currently buffered for the calling thread.
pub fn current_trace_index() -> usize {
    state::with_current(|s| s.cur_traces_num()).unwrap_or(0)
}

/// Depth of the calling thread's stack, as a frame boundary for
/// [`update_indexes`].
pub fn current_frame_index() -> usize {
    state::with_current(|s| s.host().current_depth()).unwrap_or(0)
}

/// Drains the calling thread's traces above the trace boundary, oldest
/// first. An unregistered thread gets nothing.
pub fn profile_frames() -> Vec<Trace> {
    state::with_current(extraction::extract).unwrap_or_else(|| {
        debug!("profile_frames called on a thread that is not profiled");
        Vec::new()
    })
}

/// Skip counters of the calling thread.
pub fn counters() -> Option<SamplerCounters> {
    state::with_current(|s| s.counters())
}

/// Whether the calling thread is registered with any sampler.
pub fn is_profiled_thread() -> bool {
    state::with_current(|_| ()).is_some()
}
