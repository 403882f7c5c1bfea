// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! C ABI over a single, process-global [`StackSampler`].
//!
//! The host calls `ddog_sampler_init` once with its callbacks, then drives
//! the process-wide lifecycle (`install`, `start`, ...) and, from each
//! profiled thread, the per-thread operations.

use function_name::named;
use libdd_stack_sampler::{self as sampler, StackSampler};
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

mod cstr;
mod error;
mod host;
mod traces;
mod utils;
mod vec;

pub use cstr::CString;
pub use error::*;
pub use host::*;
pub use libdd_stack_sampler::{ForkPolicy, SamplerCounters, SamplerStats};
pub use traces::*;
pub use vec::Vec;

use crate::utils::{wrap_or, wrap_with_error};

static SAMPLER: OnceLock<StackSampler> = OnceLock::new();

fn global() -> Result<&'static StackSampler, StackSamplerError> {
    SAMPLER
        .get()
        .ok_or_else(|| StackSamplerErrorCode::NotInitialized.into())
}

/// Sampler settings. Zero values select the defaults.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct SamplerConfig {
    pub sample_interval_ms: u64,
    pub sweep_interval_ms: u64,
    pub sweep_batch_size: usize,
    pub max_traces: usize,
    pub max_frames: usize,
    pub signal: i32,
    pub fork_policy: ForkPolicy,
}

impl TryFrom<&SamplerConfig> for sampler::SamplerConfiguration {
    type Error = StackSamplerError;

    fn try_from(value: &SamplerConfig) -> Result<Self, Self::Error> {
        let default = sampler::SamplerConfiguration::default();
        let or_default = |v: usize, d: usize| if v == 0 { d } else { v };
        let millis_or = |v: u64, d: Duration| {
            if v == 0 {
                d
            } else {
                Duration::from_millis(v)
            }
        };
        sampler::SamplerConfiguration::new(
            millis_or(value.sample_interval_ms, default.sample_interval()),
            millis_or(value.sweep_interval_ms, default.sweep_interval()),
            or_default(value.sweep_batch_size, default.sweep_batch_size()),
            or_default(value.max_traces, default.max_traces()),
            or_default(value.max_frames, default.max_frames()),
            if value.signal == 0 {
                default.signal()
            } else {
                value.signal
            },
            value.fork_policy,
        )
        .map_err(|e| {
            StackSamplerError::new(StackSamplerErrorCode::InvalidConfiguration, &e.to_string())
        })
    }
}

/// Creates the process-global sampler. With a null `config`, settings come
/// from the `DD_STACK_SAMPLER_*` environment variables.
///
/// # Safety
///
/// `config` must be null or point to a valid `SamplerConfig`.
#[no_mangle]
#[must_use]
#[named]
pub unsafe extern "C" fn ddog_sampler_init(
    vtable: HostVTable,
    config: Option<&SamplerConfig>,
) -> Option<Box<StackSamplerError>> {
    wrap_with_error!({
        if SAMPLER.get().is_some() {
            return Err(StackSamplerErrorCode::AlreadyInitialized.into());
        }
        let host = Arc::new(VTableHost(vtable));
        let built = match config {
            Some(config) => StackSampler::new(host, config.try_into()?),
            None => StackSampler::from_env(host)?,
        };
        SAMPLER
            .set(built)
            .map_err(|_| StackSamplerErrorCode::AlreadyInitialized.into())
    })
}

/// Installs the signal handler and starts the background threads. Sets
/// `*installed` to false if the sampler was already installed.
///
/// # Safety
///
/// `installed` must be null or valid for writes.
#[no_mangle]
#[must_use]
#[named]
pub unsafe extern "C" fn ddog_sampler_install(
    installed: Option<&mut bool>,
) -> Option<Box<StackSamplerError>> {
    wrap_with_error!({
        let newly = global()?.install()?;
        if let Some(installed) = installed {
            *installed = newly;
        }
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn ddog_sampler_uninstall() {
    wrap_or!((), {
        if let Some(sampler) = SAMPLER.get() {
            sampler.uninstall();
        }
    })
}

#[no_mangle]
pub extern "C" fn ddog_sampler_start() {
    wrap_or!((), {
        if let Some(sampler) = SAMPLER.get() {
            sampler.start();
        }
    })
}

#[no_mangle]
pub extern "C" fn ddog_sampler_stop() {
    wrap_or!((), {
        if let Some(sampler) = SAMPLER.get() {
            sampler.stop();
        }
    })
}

/// Whether sampling is possible: supported platform, initialized, and not
/// disabled by a failed install.
#[no_mangle]
pub extern "C" fn ddog_sampler_is_enabled() -> bool {
    SAMPLER.get().is_some_and(StackSampler::is_enabled)
}

#[no_mangle]
pub extern "C" fn ddog_sampler_is_installed() -> bool {
    SAMPLER.get().is_some_and(StackSampler::is_installed)
}

#[no_mangle]
pub extern "C" fn ddog_sampler_add_profiled_thread() -> bool {
    wrap_or!(false, {
        SAMPLER
            .get()
            .is_some_and(StackSampler::add_profiled_thread)
    })
}

#[no_mangle]
pub extern "C" fn ddog_sampler_remove_profiled_thread() -> bool {
    wrap_or!(false, {
        SAMPLER
            .get()
            .is_some_and(StackSampler::remove_profiled_thread)
    })
}

#[no_mangle]
pub extern "C" fn ddog_sampler_start_sampling() -> bool {
    wrap_or!(false, { sampler::start_sampling() })
}

#[no_mangle]
pub extern "C" fn ddog_sampler_stop_sampling(reset: bool) -> bool {
    wrap_or!(false, { sampler::stop_sampling(reset) })
}

#[no_mangle]
pub extern "C" fn ddog_sampler_update_indexes(frame_index: usize, trace_index: usize) -> bool {
    wrap_or!(false, {
        sampler::update_indexes(frame_index, trace_index)
    })
}

#[no_mangle]
pub extern "C" fn ddog_sampler_current_trace_index() -> usize {
    sampler::current_trace_index()
}

#[no_mangle]
pub extern "C" fn ddog_sampler_current_frame_index() -> usize {
    sampler::current_frame_index()
}

/// Drains the calling thread's traces. Free the result with
/// `ddog_sampler_traces_drop`. A panic while resolving frames returns no
/// traces.
#[no_mangle]
#[must_use]
pub extern "C" fn ddog_sampler_profile_frames() -> Traces {
    wrap_or!(Traces::new(), {
        traces::to_ffi(sampler::profile_frames())
    })
}

/// Copies the calling thread's skip counters into `out`. Returns false,
/// leaving `out` untouched, if the thread is not profiled.
///
/// # Safety
///
/// `out` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn ddog_sampler_counters(out: Option<&mut SamplerCounters>) -> bool {
    match (out, sampler::counters()) {
        (Some(out), Some(counters)) => {
            *out = counters;
            true
        }
        _ => false,
    }
}

/// Copies the process-wide driver statistics into `out`.
///
/// # Safety
///
/// `out` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn ddog_sampler_stats(out: Option<&mut SamplerStats>) -> bool {
    match (out, SAMPLER.get()) {
        (Some(out), Some(sampler)) => {
            *out = sampler.stats();
            true
        }
        _ => false,
    }
}

/// Runs the capture for the calling thread immediately. For hosts that
/// reach a safe point without going through the deferred scheduler.
#[no_mangle]
pub extern "C" fn ddog_sampler_record_sample() {
    wrap_or!((), { sampler::record_sample() })
}

/// Delivers a sampling interrupt to the calling thread by hand. Async-signal
/// safe.
#[no_mangle]
pub extern "C" fn ddog_sampler_on_sample_interrupt() {
    sampler::on_sample_interrupt()
}

// Whether `prepare_fork` locked the global sampler.
static FORK_LOCKED: AtomicBool = AtomicBool::new(false);

#[no_mangle]
pub extern "C" fn ddog_sampler_prepare_fork() {
    if let Some(sampler) = SAMPLER.get() {
        sampler.prepare_fork();
        FORK_LOCKED.store(true, SeqCst);
    }
}

#[no_mangle]
pub extern "C" fn ddog_sampler_after_fork_parent() {
    if FORK_LOCKED.swap(false, SeqCst) {
        if let Some(sampler) = SAMPLER.get() {
            // SAFETY: `prepare_fork` ran, as recorded by FORK_LOCKED.
            unsafe { sampler.after_fork_parent() };
        }
    }
}

#[no_mangle]
pub extern "C" fn ddog_sampler_after_fork_child() {
    if FORK_LOCKED.swap(false, SeqCst) {
        if let Some(sampler) = SAMPLER.get() {
            // SAFETY: `prepare_fork` ran in the parent, as recorded by
            // FORK_LOCKED.
            unsafe { sampler.after_fork_child() };
        }
    }
}

/// Registers the fork hooks with `pthread_atfork`. Hosts that have their own
/// fork callbacks can call the three hooks from there instead.
#[cfg(unix)]
#[no_mangle]
#[must_use]
#[named]
pub extern "C" fn ddog_sampler_register_fork_hooks() -> Option<Box<StackSamplerError>> {
    extern "C" fn prepare() {
        ddog_sampler_prepare_fork()
    }
    extern "C" fn parent() {
        ddog_sampler_after_fork_parent()
    }
    extern "C" fn child() {
        ddog_sampler_after_fork_child()
    }
    wrap_with_error!({
        // SAFETY: the hooks are plain functions with static lifetime.
        let rc = unsafe {
            libc::pthread_atfork(
                Some(prepare as unsafe extern "C" fn()),
                Some(parent as unsafe extern "C" fn()),
                Some(child as unsafe extern "C" fn()),
            )
        };
        match rc {
            0 => Ok(()),
            rc => Err(StackSamplerError::new(
                StackSamplerErrorCode::InvalidArgument,
                &format!("pthread_atfork failed with {rc}"),
            )),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::tests::{run_pending_job, test_vtable};

    #[test]
    fn test_config_zero_means_default() {
        let config = sampler::SamplerConfiguration::try_from(&SamplerConfig::default()).unwrap();
        assert_eq!(config, sampler::SamplerConfiguration::default());

        let bad = SamplerConfig {
            max_traces: 1 << 20,
            ..Default::default()
        };
        let error = sampler::SamplerConfiguration::try_from(&bad).unwrap_err();
        assert_eq!(error.code, StackSamplerErrorCode::InvalidConfiguration);
    }

    // The global can only be initialized once per process, so the whole
    // lifecycle lives in a single test.
    #[test]
    fn test_global_lifecycle() {
        assert!(!ddog_sampler_add_profiled_thread());
        assert!(!ddog_sampler_is_enabled());
        let error = unsafe { ddog_sampler_install(None) }.unwrap();
        assert_eq!(error.code, StackSamplerErrorCode::NotInitialized);

        let config = SamplerConfig {
            max_traces: 8,
            max_frames: 8,
            ..Default::default()
        };
        assert!(unsafe { ddog_sampler_init(test_vtable(), Some(&config)) }.is_none());
        let again = unsafe { ddog_sampler_init(test_vtable(), Some(&config)) }.unwrap();
        assert_eq!(again.code, StackSamplerErrorCode::AlreadyInitialized);

        let mut installed = false;
        assert!(unsafe { ddog_sampler_install(Some(&mut installed)) }.is_none());
        assert!(installed);
        assert!(ddog_sampler_is_installed());
        ddog_sampler_start();

        assert!(ddog_sampler_add_profiled_thread());
        assert_eq!(ddog_sampler_current_frame_index(), 2);
        assert!(ddog_sampler_start_sampling());
        ddog_sampler_on_sample_interrupt();
        assert!(run_pending_job());
        ddog_sampler_record_sample();
        assert_eq!(ddog_sampler_current_trace_index(), 2);

        let mut counters = SamplerCounters::default();
        assert!(unsafe { ddog_sampler_counters(Some(&mut counters)) });
        assert_eq!(counters.total_skipped(), 0);

        let mut traces = ddog_sampler_profile_frames();
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0][0].file.as_str(), "/app/jobs/report.rb");
        assert_eq!(traces[0][1].file.as_str(), sampler::UNKNOWN_FIELD);
        unsafe { ddog_sampler_traces_drop(Some(&mut traces)) };
        assert_eq!(ddog_sampler_current_trace_index(), 0);

        ddog_sampler_prepare_fork();
        ddog_sampler_after_fork_parent();

        assert!(ddog_sampler_stop_sampling(true));
        assert!(ddog_sampler_remove_profiled_thread());
        let mut stats = SamplerStats::default();
        assert!(unsafe { ddog_sampler_stats(Some(&mut stats)) });

        ddog_sampler_stop();
        ddog_sampler_uninstall();
        assert!(!ddog_sampler_is_installed());
        let error = unsafe { ddog_sampler_install(None) }.unwrap();
        assert_eq!(error.code, StackSamplerErrorCode::AlreadyUninstalled);
    }
}
