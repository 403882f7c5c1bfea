// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OS identity of a profiled thread, as seen from other threads.
//!
//! Liveness checks and signal delivery are both advisory: an exited thread's
//! identifier may be recycled by a new thread before the sweeper notices.

#[cfg(unix)]
use nix::errno::Errno;

/// Identifies an OS thread for signal delivery and liveness checks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ThreadHandle {
    /// Kernel thread id on Linux, `pthread_threadid_np` on macOS.
    tid: i64,
    #[cfg(all(unix, not(target_os = "linux")))]
    pthread: libc::pthread_t,
}

/// Outcome of probing or signalling a thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The thread no longer exists.
    Vanished,
    Failed(i32),
}

impl ThreadHandle {
    /// Handle for the calling thread.
    #[cfg(target_os = "linux")]
    pub fn current() -> Self {
        // SAFETY: syscall(SYS_gettid) has no preconditions for current thread.
        let tid = unsafe { libc::syscall(libc::SYS_gettid) as i64 };
        Self { tid }
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    pub fn current() -> Self {
        let pthread = nix::sys::pthread::pthread_self();
        let mut tid: u64 = 0;
        #[cfg(target_os = "macos")]
        // SAFETY: `pthread_threadid_np` has no preconditions for current thread
        // when pthread_t is 0 and output pointer is valid.
        unsafe {
            libc::pthread_threadid_np(0, &mut tid);
        }
        #[cfg(not(target_os = "macos"))]
        {
            tid = pthread as u64;
        }
        Self {
            tid: tid as i64,
            pthread,
        }
    }

    #[cfg(not(unix))]
    pub fn current() -> Self {
        Self { tid: 0 }
    }

    pub fn tid(&self) -> i64 {
        self.tid
    }

    /// Sends `signum` to the thread. Async-signal-safe.
    pub fn signal(&self, signum: i32) -> Delivery {
        self.raw_kill(signum)
    }

    /// Non-destructive existence check (signal 0).
    pub fn is_alive(&self) -> bool {
        !matches!(self.raw_kill(0), Delivery::Vanished)
    }

    #[cfg(target_os = "linux")]
    fn raw_kill(&self, signum: i32) -> Delivery {
        // tgkill addresses the kernel tid within our own thread group, so a
        // stale handle never dereferences freed pthread bookkeeping.
        // SAFETY: getpid and tgkill have no memory-safety preconditions.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_tgkill,
                libc::getpid(),
                self.tid as libc::pid_t,
                signum,
            )
        };
        if rc == 0 {
            Delivery::Delivered
        } else {
            match Errno::last() {
                Errno::ESRCH => Delivery::Vanished,
                errno => Delivery::Failed(errno as i32),
            }
        }
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    fn raw_kill(&self, signum: i32) -> Delivery {
        use nix::sys::signal::Signal;
        let signal = match signum {
            0 => None,
            n => match Signal::try_from(n) {
                Ok(signal) => Some(signal),
                Err(errno) => return Delivery::Failed(errno as i32),
            },
        };
        match nix::sys::pthread::pthread_kill(self.pthread, signal) {
            Ok(()) => Delivery::Delivered,
            Err(Errno::ESRCH) => Delivery::Vanished,
            Err(errno) => Delivery::Failed(errno as i32),
        }
    }

    #[cfg(not(unix))]
    fn raw_kill(&self, _signum: i32) -> Delivery {
        Delivery::Failed(0)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_current_thread_is_alive() {
        let me = ThreadHandle::current();
        assert!(me.is_alive());
        assert_eq!(me, ThreadHandle::current());
    }

    #[test]
    fn test_distinct_threads_have_distinct_handles() {
        let me = ThreadHandle::current();
        let other = std::thread::spawn(ThreadHandle::current).join().unwrap();
        assert_ne!(me.tid(), other.tid());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_exited_thread_is_eventually_reported_dead() {
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || tx.send(ThreadHandle::current()).unwrap());
        let exited = rx.recv().unwrap();
        handle.join().unwrap();
        // The kernel reaps the task asynchronously after join returns.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while exited.is_alive() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(!exited.is_alive());
        assert_eq!(exited.signal(0), Delivery::Vanished);
    }
}
