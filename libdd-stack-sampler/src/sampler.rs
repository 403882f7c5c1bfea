// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::configuration::{ForkPolicy, SamplerConfiguration};
use crate::counters::{SamplerStats, StatCounters};
use crate::driver::BackgroundThreads;
use crate::error::SamplerError;
use crate::host::{FrameHandle, HostRuntime};
use crate::registry::ThreadRegistry;
use crate::state::{self, Registration, ThreadSamplerState};
use crate::thread_handle::ThreadHandle;
use crate::{signal, ENABLED};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use tracing::{debug, error, warn};

static NEXT_SAMPLER_ID: AtomicU64 = AtomicU64::new(1);

/// State shared with the background threads.
pub(crate) struct SamplerInner {
    pub(crate) id: u64,
    pub(crate) host: Arc<dyn HostRuntime>,
    pub(crate) config: SamplerConfiguration,
    pub(crate) registry: ThreadRegistry,
    /// Process-wide switch for the broadcast driver.
    pub(crate) running: AtomicBool,
    pub(crate) stats: StatCounters,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum InstallState {
    NotInstalled,
    Installed,
    /// Terminal.
    Uninstalled,
}

struct Lifecycle {
    state: InstallState,
    threads: Option<BackgroundThreads>,
}

/// Cross-thread statistical stack sampler.
///
/// The process-wide lifecycle is `install` → `start`/`stop` (any number of
/// times) → `uninstall`. Independently, each thread opts in with
/// [`StackSampler::add_profiled_thread`] and is then driven through the free
/// functions at the crate root ([`crate::start_sampling`],
/// [`crate::profile_frames`], ...), which always act on the calling thread.
pub struct StackSampler {
    inner: Arc<SamplerInner>,
    lifecycle: Mutex<Lifecycle>,
    // Set when installation failed; sampling stays off for good.
    failed: AtomicBool,
}

impl StackSampler {
    pub fn new(host: Arc<dyn HostRuntime>, config: SamplerConfiguration) -> Self {
        Self {
            inner: Arc::new(SamplerInner {
                id: NEXT_SAMPLER_ID.fetch_add(1, Relaxed),
                host,
                config,
                registry: ThreadRegistry::new(),
                running: AtomicBool::new(false),
                stats: StatCounters::default(),
            }),
            lifecycle: Mutex::new(Lifecycle {
                state: InstallState::NotInstalled,
                threads: None,
            }),
            failed: AtomicBool::new(false),
        }
    }

    /// Builds a sampler configured from `DD_STACK_SAMPLER_*` variables.
    pub fn from_env(host: Arc<dyn HostRuntime>) -> Result<Self, SamplerError> {
        Ok(Self::new(host, SamplerConfiguration::from_env()?))
    }

    pub fn config(&self) -> &SamplerConfiguration {
        &self.inner.config
    }

    /// Installs the interrupt handler and spawns the background threads.
    ///
    /// Returns `Ok(false)` if already installed. A sampler cannot be
    /// installed again after [`StackSampler::uninstall`]. On failure the
    /// sampler is left disabled and the process is otherwise unaffected.
    pub fn install(&self) -> Result<bool, SamplerError> {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            InstallState::Installed => return Ok(false),
            InstallState::Uninstalled => return Err(SamplerError::AlreadyUninstalled),
            InstallState::NotInstalled => {}
        }
        if !ENABLED {
            self.failed.store(true, Relaxed);
            return Err(SamplerError::Unsupported);
        }

        let installed = signal::install_handler(self.inner.config.signal())
            .and_then(|()| BackgroundThreads::spawn(&self.inner).map_err(SamplerError::from));
        match installed {
            Ok(threads) => {
                lifecycle.threads = Some(threads);
                lifecycle.state = InstallState::Installed;
                debug!(
                    "Stack sampler installed on signal {} with a {:?} interval",
                    self.inner.config.signal(),
                    self.inner.config.sample_interval()
                );
                Ok(true)
            }
            Err(e) => {
                self.failed.store(true, Relaxed);
                error!("Failed to install the stack sampler, sampling is disabled: {e}");
                Err(e)
            }
        }
    }

    /// Stops and joins the background threads. Idempotent. Interrupts still
    /// in flight are harmless: the handler stays installed and no-ops on
    /// disarmed threads.
    pub fn uninstall(&self) {
        let threads = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == InstallState::Uninstalled {
                return;
            }
            lifecycle.state = InstallState::Uninstalled;
            self.inner.running.store(false, Relaxed);
            lifecycle.threads.take()
        };
        // Joined outside the lifecycle lock.
        drop(threads);
        debug!("Stack sampler uninstalled");
    }

    /// Turns on process-wide broadcasting. Idempotent.
    pub fn start(&self) {
        if !self.inner.running.swap(true, Relaxed) {
            debug!("Stack sampling started");
        }
    }

    /// Turns off process-wide broadcasting, keeping the handler and
    /// registrations. Idempotent.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Relaxed) {
            debug!("Stack sampling stopped");
        }
    }

    pub fn is_installed(&self) -> bool {
        self.lifecycle.lock().state == InstallState::Installed
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Relaxed)
    }

    /// Whether this sampler can sample at all: the platform supports it and
    /// installation has not failed.
    pub fn is_enabled(&self) -> bool {
        ENABLED && !self.failed.load(Relaxed)
    }

    /// Registers the calling thread, disarmed. Returns `false` if it was
    /// already registered, with this or any other sampler.
    pub fn add_profiled_thread(&self) -> bool {
        if state::current_registration().is_some() {
            return false;
        }
        let thread = ThreadHandle::current();
        let config = &self.inner.config;
        let Some(state) = ThreadSamplerState::new(
            self.inner.host.clone(),
            thread,
            self.inner.id,
            config.max_traces(),
            config.max_frames(),
        ) else {
            warn!(
                "Trace buffer of {} x {} frames is too large, thread {} is not profiled",
                config.max_traces(),
                config.max_frames(),
                thread.tid()
            );
            return false;
        };
        let state = Arc::new(state);
        let handle = self.inner.registry.register(thread, state.clone());
        if let Err(duplicate) = state::set_current(Registration { state, handle }) {
            self.inner.registry.unregister(duplicate.handle);
            return false;
        }
        debug!("Registered profiled thread {}", thread.tid());
        true
    }

    /// Disarms and unregisters the calling thread, discarding its buffered
    /// traces. Returns `false` if it was not registered with this sampler.
    pub fn remove_profiled_thread(&self) -> bool {
        let Some(registration) = state::take_current_for(self.inner.id) else {
            return false;
        };
        self.inner.registry.unregister(registration.handle);
        debug!(
            "Removed profiled thread {}",
            registration.state.thread().tid()
        );
        true
    }

    /// Number of registry entries, including exited threads the sweeper has
    /// not reclaimed yet.
    pub fn registered_threads(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn stats(&self) -> SamplerStats {
        self.inner.stats.snapshot()
    }

    pub fn frame_file(&self, frame: FrameHandle) -> Option<String> {
        self.inner.host.describe_frame(frame).absolute_path
    }

    pub fn frame_klass(&self, frame: FrameHandle) -> Option<String> {
        self.inner.host.describe_frame(frame).classpath
    }

    pub fn frame_method(&self, frame: FrameHandle) -> Option<String> {
        self.inner.host.describe_frame(frame).label
    }

    pub fn frame_lineno(&self, frame: FrameHandle) -> Option<i32> {
        self.inner.host.describe_frame(frame).first_lineno
    }

    /// Call right before `fork()`. Holds the sampler's locks across the fork
    /// so the child never inherits them mid-change; broadcasting pauses until
    /// one of the `after_fork_*` hooks runs.
    pub fn prepare_fork(&self) {
        std::mem::forget(self.lifecycle.lock());
        self.inner.registry.lock_for_fork();
    }

    /// Call in the parent after `fork()`.
    ///
    /// # Safety
    /// Must be paired with a preceding [`StackSampler::prepare_fork`] on the
    /// same thread.
    pub unsafe fn after_fork_parent(&self) {
        self.inner.registry.unlock_after_fork();
        self.lifecycle.force_unlock();
    }

    /// Call in the child after `fork()`. Only the forking thread exists in
    /// the child; every other registration is dropped, and the configured
    /// [`ForkPolicy`] decides whether sampling resumes.
    ///
    /// # Safety
    /// Must be paired with a [`StackSampler::prepare_fork`] that the parent
    /// called before forking.
    pub unsafe fn after_fork_child(&self) {
        self.inner.registry.unlock_after_fork();
        self.lifecycle.force_unlock();

        let mut lifecycle = self.lifecycle.lock();
        if let Some(threads) = lifecycle.threads.take() {
            threads.abandon();
        }
        // Memory referenced by the vanished threads' own registrations is
        // leaked; it is never reachable again.
        drop(self.inner.registry.clear());

        match self.inner.config.fork_policy() {
            ForkPolicy::Disable => {
                self.inner.running.store(false, Relaxed);
                drop(state::take_current_for(self.inner.id));
                if lifecycle.state == InstallState::Installed {
                    lifecycle.state = InstallState::Uninstalled;
                }
                debug!("Stack sampling disabled in forked child");
            }
            ForkPolicy::Rearm => {
                let registry = &self.inner.registry;
                // The forking thread has a new OS identity in the child.
                state::rebind_current(self.inner.id, |state| {
                    registry.register(ThreadHandle::current(), state.clone())
                });
                if lifecycle.state == InstallState::Installed {
                    match BackgroundThreads::spawn(&self.inner) {
                        Ok(threads) => lifecycle.threads = Some(threads),
                        Err(e) => {
                            warn!("Failed to restart sampler threads in forked child: {e}");
                            self.inner.running.store(false, Relaxed);
                            lifecycle.state = InstallState::Uninstalled;
                            self.failed.store(true, Relaxed);
                        }
                    }
                }
                debug!("Stack sampling re-armed in forked child");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<SamplerInner> {
        &self.inner
    }
}

impl Drop for StackSampler {
    fn drop(&mut self) {
        self.uninstall();
    }
}
