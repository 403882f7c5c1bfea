// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Registry of profiled threads.
//!
//! Entries live in a slot arena with a free list. A slot's generation is
//! bumped whenever it is vacated, so a stale [`RegistryHandle`] can never
//! remove the entry of a thread that reused the slot.
//!
//! The mutex serializes structural changes. The broadcast driver only ever
//! `try_lock`s it; sampling and capture never touch it.

use crate::state::ThreadSamplerState;
use crate::thread_handle::ThreadHandle;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RegistryHandle {
    slot: u32,
    generation: u32,
}

impl RegistryHandle {
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            slot: u32::MAX,
            generation: u32::MAX,
        }
    }
}

struct ProfiledThreadEntry {
    thread: ThreadHandle,
    state: Arc<ThreadSamplerState>,
}

#[derive(Default)]
struct Slots {
    entries: Vec<Option<ProfiledThreadEntry>>,
    generations: Vec<u32>,
    free: Vec<usize>,
    live: usize,
    // Where the next sweep resumes.
    sweep_cursor: usize,
}

impl Slots {
    fn vacate(&mut self, slot: usize) -> Option<Arc<ThreadSamplerState>> {
        let entry = self.entries.get_mut(slot)?.take()?;
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        self.free.push(slot);
        self.live -= 1;
        Some(entry.state)
    }
}

#[derive(Default)]
pub(crate) struct ThreadRegistry {
    slots: Mutex<Slots>,
}

impl ThreadRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Links a new entry. Does not deduplicate: registering the same thread
    /// twice yields two entries.
    pub(crate) fn register(
        &self,
        thread: ThreadHandle,
        state: Arc<ThreadSamplerState>,
    ) -> RegistryHandle {
        let mut slots = self.slots.lock();
        let entry = Some(ProfiledThreadEntry { thread, state });
        let slot = match slots.free.pop() {
            Some(slot) => {
                slots.entries[slot] = entry;
                slot
            }
            None => {
                slots.entries.push(entry);
                slots.generations.push(0);
                slots.entries.len() - 1
            }
        };
        slots.live += 1;
        RegistryHandle {
            slot: slot as u32,
            generation: slots.generations[slot],
        }
    }

    /// Removes the entry `handle` refers to. Stale handles are a no-op.
    pub(crate) fn unregister(&self, handle: RegistryHandle) -> Option<Arc<ThreadSamplerState>> {
        let mut slots = self.slots.lock();
        let slot = handle.slot as usize;
        if slots.generations.get(slot) != Some(&handle.generation) {
            return None;
        }
        slots.vacate(slot)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().live
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, handle: RegistryHandle) -> bool {
        let slots = self.slots.lock();
        let slot = handle.slot as usize;
        slots.generations.get(slot) == Some(&handle.generation)
            && slots.entries.get(slot).is_some_and(Option::is_some)
    }

    /// Visits every live entry while holding the lock, unless a structural
    /// change holds it, in which case nothing is visited and `None` is
    /// returned.
    pub(crate) fn try_for_each_live(
        &self,
        mut f: impl FnMut(&ThreadHandle, &ThreadSamplerState),
    ) -> Option<usize> {
        let slots = self.slots.try_lock()?;
        let mut visited = 0;
        for entry in slots.entries.iter().flatten() {
            f(&entry.thread, &entry.state);
            visited += 1;
        }
        Some(visited)
    }

    /// Probes up to `batch` live entries, resuming where the last sweep
    /// stopped, and unlinks those `is_alive` rejects. The removed states are
    /// returned so they can be dropped after the lock is released.
    pub(crate) fn sweep(
        &self,
        batch: usize,
        is_alive: impl Fn(&ThreadHandle) -> bool,
    ) -> Vec<Arc<ThreadSamplerState>> {
        let mut slots = self.slots.lock();
        let capacity = slots.entries.len();
        let mut reclaimed = Vec::new();
        if capacity == 0 {
            return reclaimed;
        }
        let mut checked = 0;
        let mut slot = slots.sweep_cursor % capacity;
        for _ in 0..capacity {
            if checked == batch {
                break;
            }
            if let Some(entry) = &slots.entries[slot] {
                checked += 1;
                if !is_alive(&entry.thread) {
                    if let Some(state) = slots.vacate(slot) {
                        reclaimed.push(state);
                    }
                }
            }
            slot = (slot + 1) % capacity;
        }
        slots.sweep_cursor = slot;
        reclaimed
    }

    /// Unlinks everything. Used in a forked child, where none of the other
    /// threads exist.
    pub(crate) fn clear(&self) -> Vec<Arc<ThreadSamplerState>> {
        let mut slots = self.slots.lock();
        let occupied: Vec<usize> = slots
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|_| i))
            .collect();
        occupied
            .into_iter()
            .filter_map(|slot| slots.vacate(slot))
            .collect()
    }

    /// Takes the lock across a `fork()`, so that the child never inherits it
    /// held by a thread that does not exist there.
    pub(crate) fn lock_for_fork(&self) {
        std::mem::forget(self.slots.lock());
    }

    /// Releases the lock taken by [`Self::lock_for_fork`].
    ///
    /// # Safety
    /// Must follow a call to [`Self::lock_for_fork`] in this process (or in
    /// the parent it was forked from).
    pub(crate) unsafe fn unlock_after_fork(&self) {
        self.slots.force_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::SyntheticHost;

    fn state(host: &Arc<SyntheticHost>) -> Arc<ThreadSamplerState> {
        Arc::new(ThreadSamplerState::new(
            host.clone(),
            ThreadHandle::current(),
            0,
            1,
            1,
        )
        .unwrap())
    }

    #[test]
    fn test_register_unregister_reuses_slot() {
        let host = Arc::new(SyntheticHost::new());
        let registry = ThreadRegistry::new();
        let me = ThreadHandle::current();

        let first = registry.register(me, state(&host));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(first));

        assert!(registry.unregister(first).is_some());
        assert_eq!(registry.len(), 0);
        assert!(!registry.contains(first));
        // Stale handle.
        assert!(registry.unregister(first).is_none());

        let second = registry.register(me, state(&host));
        assert_eq!(second.slot, first.slot);
        assert_ne!(second.generation, first.generation);
        assert!(registry.unregister(first).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_try_for_each_live_skips_when_busy() {
        let host = Arc::new(SyntheticHost::new());
        let registry = ThreadRegistry::new();
        registry.register(ThreadHandle::current(), state(&host));
        registry.register(ThreadHandle::current(), state(&host));

        assert_eq!(registry.try_for_each_live(|_, _| ()), Some(2));
        let guard = registry.slots.lock();
        assert_eq!(registry.try_for_each_live(|_, _| ()), None);
        drop(guard);
    }

    #[test]
    fn test_sweep_is_batched_and_round_robin() {
        let host = Arc::new(SyntheticHost::new());
        let registry = ThreadRegistry::new();
        for _ in 0..5 {
            registry.register(ThreadHandle::current(), state(&host));
        }
        // Everything is "dead"; each sweep may only reclaim two.
        assert_eq!(registry.sweep(2, |_| false).len(), 2);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.sweep(2, |_| false).len(), 2);
        assert_eq!(registry.sweep(2, |_| false).len(), 1);
        assert_eq!(registry.len(), 0);
        assert!(registry.sweep(2, |_| false).is_empty());
    }

    #[test]
    fn test_sweep_keeps_live_threads() {
        let host = Arc::new(SyntheticHost::new());
        let registry = ThreadRegistry::new();
        let h = registry.register(ThreadHandle::current(), state(&host));
        assert!(registry.sweep(10, |_| true).is_empty());
        assert!(registry.contains(h));
    }

    #[test]
    fn test_reclaimed_state_releases_roots() {
        let host = Arc::new(SyntheticHost::new());
        let registry = ThreadRegistry::new();
        registry.register(ThreadHandle::current(), state(&host));
        assert_eq!(host.registered_roots(), 1);
        drop(registry.sweep(1, |_| false));
        assert_eq!(host.registered_roots(), 0);
    }

    #[test]
    fn test_clear_and_fork_lock() {
        let host = Arc::new(SyntheticHost::new());
        let registry = ThreadRegistry::new();
        registry.register(ThreadHandle::current(), state(&host));
        registry.register(ThreadHandle::current(), state(&host));

        registry.lock_for_fork();
        assert_eq!(registry.try_for_each_live(|_, _| ()), None);
        unsafe { registry.unlock_after_fork() };

        assert_eq!(registry.clear().len(), 2);
        assert_eq!(registry.len(), 0);
    }
}
