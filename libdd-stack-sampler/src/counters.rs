// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering::Relaxed};

/// Why a sample was not recorded. Diagnostics only, never gates correctness.
#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SkipReason {
    /// A collector pause was in progress.
    InGc = 0,
    /// The interrupt arrived while the previous one was still being handled.
    InSignalHandler,
    /// A capture job was already pending for this thread.
    JobRegistered,
    /// The deferred capture ran after sampling was disarmed.
    NotRunning,
    /// Every trace slot was in use.
    BufferFull,
    /// The host scheduler refused the capture job.
    JobRejected,
    /// The capture primitive faulted and the partial trace was discarded.
    Rescued,
    SIZE,
}

impl SkipReason {
    pub fn name(self) -> &'static str {
        match self {
            SkipReason::InGc => "skipped_in_gc",
            SkipReason::InSignalHandler => "skipped_in_signal_handler",
            SkipReason::JobRegistered => "skipped_in_job_registered",
            SkipReason::NotRunning => "skipped_in_not_running",
            SkipReason::BufferFull => "skipped_buffer_full",
            SkipReason::JobRejected => "skipped_job_rejected",
            SkipReason::Rescued => "rescued_profile_frames",
            SkipReason::SIZE => "size",
        }
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const ATOMIC_ZERO: AtomicU32 = AtomicU32::new(0);

/// Per-thread skip counters. Written by the owning thread (including from its
/// signal handler), readable from anywhere.
#[derive(Debug)]
pub(crate) struct SkipCounters {
    counts: [AtomicU32; SkipReason::SIZE as usize],
}

impl Default for SkipCounters {
    fn default() -> Self {
        Self {
            counts: [ATOMIC_ZERO; SkipReason::SIZE as usize],
        }
    }
}

impl SkipCounters {
    /// Async-signal-safe.
    #[inline]
    pub(crate) fn incr(&self, reason: SkipReason) {
        self.counts[reason as usize].fetch_add(1, Relaxed);
    }

    pub(crate) fn get(&self, reason: SkipReason) -> u32 {
        self.counts[reason as usize].load(Relaxed)
    }

    pub(crate) fn reset(&self) {
        for c in self.counts.iter() {
            c.store(0, Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> SamplerCounters {
        SamplerCounters {
            skipped_in_gc: self.get(SkipReason::InGc),
            skipped_in_signal_handler: self.get(SkipReason::InSignalHandler),
            skipped_in_job_registered: self.get(SkipReason::JobRegistered),
            skipped_in_not_running: self.get(SkipReason::NotRunning),
            skipped_buffer_full: self.get(SkipReason::BufferFull),
            skipped_job_rejected: self.get(SkipReason::JobRejected),
            rescued_profile_frames: self.get(SkipReason::Rescued),
        }
    }
}

/// Point-in-time copy of a thread's skip counters.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplerCounters {
    pub skipped_in_gc: u32,
    pub skipped_in_signal_handler: u32,
    pub skipped_in_job_registered: u32,
    pub skipped_in_not_running: u32,
    pub skipped_buffer_full: u32,
    pub skipped_job_rejected: u32,
    pub rescued_profile_frames: u32,
}

impl SamplerCounters {
    pub fn total_skipped(&self) -> u64 {
        [
            self.skipped_in_gc,
            self.skipped_in_signal_handler,
            self.skipped_in_job_registered,
            self.skipped_in_not_running,
            self.skipped_buffer_full,
            self.skipped_job_rejected,
            self.rescued_profile_frames,
        ]
        .iter()
        .map(|&c| c as u64)
        .sum()
    }
}

/// Process-wide activity of the background threads.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplerStats {
    /// Broadcast ticks taken while started.
    pub ticks: u64,
    pub interrupts_delivered: u64,
    /// Deliveries that found the target thread gone.
    pub vanished_deliveries: u64,
    /// Ticks skipped because the registry was locked for a structural change.
    pub busy_ticks: u64,
    pub threads_swept: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub(crate) ticks: AtomicU64,
    pub(crate) interrupts_delivered: AtomicU64,
    pub(crate) vanished_deliveries: AtomicU64,
    pub(crate) busy_ticks: AtomicU64,
    pub(crate) threads_swept: AtomicU64,
}

impl StatCounters {
    pub(crate) fn snapshot(&self) -> SamplerStats {
        SamplerStats {
            ticks: self.ticks.load(Relaxed),
            interrupts_delivered: self.interrupts_delivered.load(Relaxed),
            vanished_deliveries: self.vanished_deliveries.load(Relaxed),
            busy_ticks: self.busy_ticks.load(Relaxed),
            threads_swept: self.threads_swept.load(Relaxed),
        }
    }
}
