// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Broadcast driver and dead-thread sweeper.
//!
//! Both run on their own thread, woken by a `crossbeam_channel::tick` and
//! stopped by disconnecting a shared shutdown channel.

use crate::sampler::SamplerInner;
use crate::thread_handle::{Delivery, ThreadHandle};
use crossbeam_channel::{select, tick, Receiver, Sender};
use std::io;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

const BROADCAST_THREAD_NAME: &str = "dd-stack-broadcast";
const SWEEPER_THREAD_NAME: &str = "dd-stack-sweeper";

pub(crate) struct BackgroundThreads {
    // Dropping it disconnects every receiver.
    shutdown_sender: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundThreads {
    pub(crate) fn spawn(inner: &Arc<SamplerInner>) -> io::Result<Self> {
        let (shutdown_sender, shutdown_receiver) = crossbeam_channel::bounded::<()>(0);
        let mut threads = Self {
            shutdown_sender: Some(shutdown_sender),
            handles: Vec::with_capacity(2),
        };

        let broadcast = {
            let inner = inner.clone();
            let shutdown = shutdown_receiver.clone();
            let interval = inner.config.sample_interval();
            std::thread::Builder::new()
                .name(BROADCAST_THREAD_NAME.to_owned())
                .spawn(move || run_every(interval, &shutdown, || broadcast_once(&inner)))?
        };
        threads.handles.push(broadcast);

        // On failure `threads` drops here and stops the broadcast thread.
        let sweeper = {
            let inner = inner.clone();
            let interval = inner.config.sweep_interval();
            std::thread::Builder::new()
                .name(SWEEPER_THREAD_NAME.to_owned())
                .spawn(move || {
                    run_every(interval, &shutdown_receiver, || {
                        sweep_once(&inner);
                    })
                })?
        };
        threads.handles.push(sweeper);

        Ok(threads)
    }

    /// Forgets threads that do not exist in a forked child. Joining them
    /// would never return.
    pub(crate) fn abandon(mut self) {
        self.handles.clear();
        if let Some(sender) = self.shutdown_sender.take() {
            std::mem::forget(sender);
        }
    }
}

impl Drop for BackgroundThreads {
    fn drop(&mut self) {
        drop(self.shutdown_sender.take());
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or_default().to_owned();
            if handle.join().is_err() {
                warn!("Sampler thread {name} panicked");
            }
        }
    }
}

fn run_every(interval: Duration, shutdown: &Receiver<()>, mut on_tick: impl FnMut()) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => on_tick(),
            recv(shutdown) -> _ => break,
        }
    }
    debug!("Sampler thread exiting");
}

/// Interrupts every armed, registered thread once. Skips the tick entirely
/// when the process-wide switch is off or the registry is mid-change.
pub(crate) fn broadcast_once(inner: &SamplerInner) {
    if !inner.running.load(Relaxed) {
        return;
    }
    let stats = &inner.stats;
    stats.ticks.fetch_add(1, Relaxed);
    let signal = inner.config.signal();
    let visited = inner.registry.try_for_each_live(|thread, state| {
        if !state.is_armed() {
            return;
        }
        match thread.signal(signal) {
            Delivery::Delivered => {
                stats.interrupts_delivered.fetch_add(1, Relaxed);
            }
            // Left for the sweeper.
            Delivery::Vanished => {
                stats.vanished_deliveries.fetch_add(1, Relaxed);
            }
            Delivery::Failed(errno) => {
                trace!("Failed to interrupt thread {}: errno {errno}", thread.tid());
            }
        }
    });
    if visited.is_none() {
        stats.busy_ticks.fetch_add(1, Relaxed);
    }
}

/// Reclaims up to one batch of entries whose thread has exited. Returns how
/// many were reclaimed.
pub(crate) fn sweep_once(inner: &SamplerInner) -> usize {
    let reclaimed = inner
        .registry
        .sweep(inner.config.sweep_batch_size(), ThreadHandle::is_alive);
    let count = reclaimed.len();
    // Buffers and root registrations are released outside the registry lock.
    drop(reclaimed);
    if count > 0 {
        inner.stats.threads_swept.fetch_add(count as u64, Relaxed);
        debug!("Reclaimed {count} exited profiled threads");
    }
    count
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::configuration::{ForkPolicy, SamplerConfiguration};
    use crate::sampler::StackSampler;
    use crate::test_utils::SyntheticHost;
    use std::sync::mpsc;

    fn sampler(batch: usize) -> StackSampler {
        let config = SamplerConfiguration::new(
            Duration::from_millis(1),
            Duration::from_millis(1),
            batch,
            4,
            4,
            libc::SIGVTALRM,
            ForkPolicy::Disable,
        )
        .unwrap();
        StackSampler::new(Arc::new(SyntheticHost::new()), config)
    }

    /// Registers `count` threads with `sampler`, lets them exit without
    /// removing themselves, and waits until the OS has reaped them.
    fn leak_exited_threads(sampler: &Arc<StackSampler>, count: usize) {
        let (tx, rx) = mpsc::channel();
        let workers: Vec<_> = (0..count)
            .map(|_| {
                let sampler = sampler.clone();
                let tx = tx.clone();
                std::thread::spawn(move || {
                    assert!(sampler.add_profiled_thread());
                    tx.send(ThreadHandle::current()).unwrap();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        drop(tx);
        for thread in rx {
            while thread.is_alive() {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn test_broadcast_skips_when_stopped_or_busy() {
        let sampler = sampler(8);
        assert!(sampler.add_profiled_thread());
        broadcast_once(sampler.inner());
        assert_eq!(sampler.stats().ticks, 0);

        sampler.start();
        // Registered but disarmed: no delivery.
        broadcast_once(sampler.inner());
        assert_eq!(sampler.stats().ticks, 1);
        assert_eq!(sampler.stats().interrupts_delivered, 0);

        sampler.inner().registry.lock_for_fork();
        broadcast_once(sampler.inner());
        unsafe { sampler.inner().registry.unlock_after_fork() };
        assert_eq!(sampler.stats().busy_ticks, 1);
    }

    #[test]
    fn test_sweep_reclaims_in_batches_and_slots_are_reused() {
        let sampler = Arc::new(sampler(2));
        leak_exited_threads(&sampler, 5);
        assert_eq!(sampler.registered_threads(), 5);

        // ceil(5 / 2) sweeps.
        assert_eq!(sweep_once(sampler.inner()), 2);
        assert_eq!(sweep_once(sampler.inner()), 2);
        assert_eq!(sweep_once(sampler.inner()), 1);
        assert_eq!(sampler.registered_threads(), 0);
        assert_eq!(sampler.stats().threads_swept, 5);

        assert!(sampler.add_profiled_thread());
        assert_eq!(sampler.registered_threads(), 1);
        assert_eq!(sweep_once(sampler.inner()), 0);
    }

    #[test]
    fn test_background_threads_stop_on_drop() {
        let sampler = sampler(8);
        let threads = BackgroundThreads::spawn(sampler.inner()).unwrap();
        sampler.start();
        std::thread::sleep(Duration::from_millis(20));
        drop(threads);
        let ticks = sampler.stats().ticks;
        assert!(ticks > 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sampler.stats().ticks, ticks);
    }
}
