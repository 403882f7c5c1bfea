// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide OS signal handler for sampling interrupts.
//!
//! The handler is installed once per process and never removed: a sampling
//! signal still in flight when profiling is torn down would otherwise hit the
//! default disposition, which terminates the process. Once disarmed it is a
//! no-op.

use crate::error::SamplerError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering::SeqCst};

// 0 while no handler is installed. Only set once `sigaction` succeeded.
static INSTALLED_SIGNAL: AtomicI32 = AtomicI32::new(0);
// Serializes installs.
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// Signal the sampling handler is installed for, if any.
pub fn installed_signal() -> Option<i32> {
    match INSTALLED_SIGNAL.load(SeqCst) {
        0 => None,
        signum => Some(signum),
    }
}

/// Installs the sampling handler for `signum`. Installing again for the same
/// signal is a no-op; a different signal is refused.
#[cfg(unix)]
pub(crate) fn install_handler(signum: i32) -> Result<(), SamplerError> {
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use tracing::debug;

    let _install = INSTALL_LOCK.lock();
    match INSTALLED_SIGNAL.load(SeqCst) {
        0 => {}
        installed if installed == signum => return Ok(()),
        installed => {
            return Err(SamplerError::SignalConflict {
                installed,
                requested: signum,
            })
        }
    }

    let result = Signal::try_from(signum).and_then(|signal_type| {
        // SA_RESTART: syscalls the interrupt lands in resume instead of
        // failing with EINTR in application code.
        let sig_action = SigAction::new(
            SigHandler::Handler(handle_sample_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: the handler only touches atomics and const thread-locals.
        unsafe { signal::sigaction(signal_type, &sig_action) }
    });
    match result {
        Ok(old_action) => {
            INSTALLED_SIGNAL.store(signum, SeqCst);
            if old_action.handler() != SigHandler::SigDfl {
                debug!("Replaced an existing handler for signal {signum}");
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
pub(crate) fn install_handler(_signum: i32) -> Result<(), SamplerError> {
    Err(SamplerError::Unsupported)
}

#[cfg(unix)]
extern "C" fn handle_sample_signal(_signum: libc::c_int) {
    crate::interrupt::on_sample_interrupt();
}
