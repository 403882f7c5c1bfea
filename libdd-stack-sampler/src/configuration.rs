// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{BUF_SIZE, DEFAULT_SAMPLE_INTERVAL, MAX_TRACES};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 64;
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);
/// Upper bound on `max_traces * max_frames`, the frame handles allocated for
/// each profiled thread.
pub const MAX_BUFFER_ENTRIES: usize = 1 << 22;

/// What a forked child does with the sampler it inherited.
///
/// Only the forking thread survives a fork, and neither background thread
/// does, so the child has to decide explicitly.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkPolicy {
    /// The child stops sampling; its inherited registry is dropped.
    #[default]
    Disable,
    /// The child re-registers the forking thread and restarts the
    /// background threads.
    Rearm,
}

impl FromStr for ForkPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disable" => Ok(Self::Disable),
            "rearm" => Ok(Self::Rearm),
            other => anyhow::bail!("unknown fork policy {other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedConfiguration")]
pub struct SamplerConfiguration {
    // Period of the broadcast driver
    sample_interval: Duration,
    sweep_interval: Duration,
    // Upper bound on registry entries checked per sweep
    sweep_batch_size: usize,
    max_traces: usize,
    max_frames: usize,
    signal: i32,
    fork_policy: ForkPolicy,
}

// Deserialized form, validated on the way into `SamplerConfiguration`.
#[derive(Deserialize)]
struct UncheckedConfiguration {
    sample_interval: Duration,
    sweep_interval: Duration,
    sweep_batch_size: usize,
    max_traces: usize,
    max_frames: usize,
    signal: i32,
    fork_policy: ForkPolicy,
}

impl TryFrom<UncheckedConfiguration> for SamplerConfiguration {
    type Error = anyhow::Error;

    fn try_from(value: UncheckedConfiguration) -> Result<Self, Self::Error> {
        Self::new(
            value.sample_interval,
            value.sweep_interval,
            value.sweep_batch_size,
            value.max_traces,
            value.max_frames,
            value.signal,
            value.fork_policy,
        )
    }
}

impl Default for SamplerConfiguration {
    fn default() -> Self {
        Self {
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            max_traces: MAX_TRACES,
            max_frames: BUF_SIZE,
            signal: default_signal(),
            fork_policy: ForkPolicy::Disable,
        }
    }
}

#[cfg(unix)]
fn default_signal() -> i32 {
    libc::SIGVTALRM
}

#[cfg(not(unix))]
fn default_signal() -> i32 {
    0
}

impl SamplerConfiguration {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sample_interval: Duration,
        sweep_interval: Duration,
        sweep_batch_size: usize,
        max_traces: usize,
        max_frames: usize,
        signal: i32,
        fork_policy: ForkPolicy,
    ) -> anyhow::Result<Self> {
        let config = Self {
            sample_interval,
            sweep_interval,
            sweep_batch_size,
            max_traces,
            max_frames,
            signal,
            fork_policy,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.sample_interval >= MIN_INTERVAL,
            "sample interval {:?} is below the {MIN_INTERVAL:?} minimum",
            self.sample_interval
        );
        anyhow::ensure!(
            self.sweep_interval >= MIN_INTERVAL,
            "sweep interval {:?} is below the {MIN_INTERVAL:?} minimum",
            self.sweep_interval
        );
        anyhow::ensure!(self.sweep_batch_size > 0, "sweep batch size must be positive");
        // Cursors are 16 bits wide.
        anyhow::ensure!(
            (1..=u16::MAX as usize).contains(&self.max_traces),
            "max_traces must be within 1..={}, got {}",
            u16::MAX,
            self.max_traces
        );
        anyhow::ensure!(
            (1..=u16::MAX as usize).contains(&self.max_frames),
            "max_frames must be within 1..={}, got {}",
            u16::MAX,
            self.max_frames
        );
        anyhow::ensure!(
            self.max_traces
                .checked_mul(self.max_frames)
                .is_some_and(|entries| entries <= MAX_BUFFER_ENTRIES),
            "trace buffer of {} x {} frames exceeds {MAX_BUFFER_ENTRIES} entries",
            self.max_traces,
            self.max_frames
        );
        validate_signal(self.signal)
    }

    /// Defaults overridden by any `DD_STACK_SAMPLER_*` variable that parses.
    pub fn from_env() -> anyhow::Result<Self> {
        let default = Self::default();
        let config = Self {
            sample_interval: FromEnv::millis(FromEnv::DD_STACK_SAMPLER_INTERVAL_MS)
                .unwrap_or(default.sample_interval),
            sweep_interval: FromEnv::millis(FromEnv::DD_STACK_SAMPLER_SWEEP_INTERVAL_MS)
                .unwrap_or(default.sweep_interval),
            sweep_batch_size: FromEnv::parse(FromEnv::DD_STACK_SAMPLER_SWEEP_BATCH_SIZE)
                .unwrap_or(default.sweep_batch_size),
            max_traces: FromEnv::parse(FromEnv::DD_STACK_SAMPLER_MAX_TRACES)
                .unwrap_or(default.max_traces),
            max_frames: FromEnv::parse(FromEnv::DD_STACK_SAMPLER_MAX_FRAMES)
                .unwrap_or(default.max_frames),
            signal: FromEnv::parse(FromEnv::DD_STACK_SAMPLER_SIGNAL).unwrap_or(default.signal),
            fork_policy: FromEnv::parse(FromEnv::DD_STACK_SAMPLER_FORK_POLICY)
                .unwrap_or(default.fork_policy),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn sample_interval(&self) -> Duration {
        self.sample_interval
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn sweep_batch_size(&self) -> usize {
        self.sweep_batch_size
    }

    pub fn max_traces(&self) -> usize {
        self.max_traces
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    pub fn signal(&self) -> i32 {
        self.signal
    }

    pub fn fork_policy(&self) -> ForkPolicy {
        self.fork_policy
    }

    pub fn set_fork_policy(&mut self, fork_policy: ForkPolicy) {
        self.fork_policy = fork_policy;
    }
}

#[cfg(unix)]
fn validate_signal(signum: i32) -> anyhow::Result<()> {
    use nix::sys::signal::Signal;
    let signal = Signal::try_from(signum)?;
    anyhow::ensure!(
        !matches!(signal, Signal::SIGKILL | Signal::SIGSTOP),
        "{signal} cannot be handled"
    );
    Ok(())
}

#[cfg(not(unix))]
fn validate_signal(_signum: i32) -> anyhow::Result<()> {
    Ok(())
}

struct FromEnv;

impl FromEnv {
    const DD_STACK_SAMPLER_INTERVAL_MS: &'static str = "DD_STACK_SAMPLER_INTERVAL_MS";
    const DD_STACK_SAMPLER_SWEEP_INTERVAL_MS: &'static str = "DD_STACK_SAMPLER_SWEEP_INTERVAL_MS";
    const DD_STACK_SAMPLER_SWEEP_BATCH_SIZE: &'static str = "DD_STACK_SAMPLER_SWEEP_BATCH_SIZE";
    const DD_STACK_SAMPLER_MAX_TRACES: &'static str = "DD_STACK_SAMPLER_MAX_TRACES";
    const DD_STACK_SAMPLER_MAX_FRAMES: &'static str = "DD_STACK_SAMPLER_MAX_FRAMES";
    const DD_STACK_SAMPLER_SIGNAL: &'static str = "DD_STACK_SAMPLER_SIGNAL";
    const DD_STACK_SAMPLER_FORK_POLICY: &'static str = "DD_STACK_SAMPLER_FORK_POLICY";

    fn parse<T>(name: &str) -> Option<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = env::var(name).ok().filter(|v| !v.trim().is_empty())?;
        match raw.trim().parse::<T>() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring {name}={raw:?}: {e}");
                None
            }
        }
    }

    fn millis(name: &str) -> Option<Duration> {
        Self::parse::<u64>(name).map(Duration::from_millis)
    }
}
