// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::cstr::CString;
use libdd_stack_sampler::SamplerError;
use std::ffi::c_char;
use std::fmt::Display;

/// Represent error codes that `StackSamplerError` struct can hold
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StackSamplerErrorCode {
    InvalidArgument,
    AlreadyInitialized,
    NotInitialized,
    AlreadyUninstalled,
    Unsupported,
    SignalHandler,
    SignalConflict,
    SpawnThread,
    InvalidConfiguration,
    Panic,
}

impl Display for StackSamplerErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "Invalid argument provided"),
            Self::AlreadyInitialized => write!(f, "The stack sampler is already initialized"),
            Self::NotInitialized => write!(f, "The stack sampler is not initialized"),
            Self::AlreadyUninstalled => write!(f, "The stack sampler was uninstalled"),
            Self::Unsupported => write!(f, "Stack sampling is not supported on this platform"),
            Self::SignalHandler => write!(f, "Failed to install the signal handler"),
            Self::SignalConflict => write!(f, "Conflicting sampling signal"),
            Self::SpawnThread => write!(f, "Failed to spawn a sampler thread"),
            Self::InvalidConfiguration => write!(f, "Invalid configuration"),
            Self::Panic => write!(f, "Panic inside the stack sampler"),
        }
    }
}

/// Error information returned by the stack sampler FFI API.
#[repr(C)]
#[derive(Debug)]
pub struct StackSamplerError {
    pub code: StackSamplerErrorCode,
    pub msg: CString,
}

impl StackSamplerError {
    pub fn new(code: StackSamplerErrorCode, msg: &str) -> Self {
        Self {
            code,
            msg: CString::new_or_empty(msg),
        }
    }
}

impl From<StackSamplerErrorCode> for StackSamplerError {
    fn from(code: StackSamplerErrorCode) -> Self {
        Self::new(code, &code.to_string())
    }
}

impl From<SamplerError> for StackSamplerError {
    fn from(value: SamplerError) -> Self {
        let code = match &value {
            SamplerError::AlreadyUninstalled => StackSamplerErrorCode::AlreadyUninstalled,
            SamplerError::Unsupported => StackSamplerErrorCode::Unsupported,
            #[cfg(unix)]
            SamplerError::SignalHandler(_) => StackSamplerErrorCode::SignalHandler,
            SamplerError::SignalConflict { .. } => StackSamplerErrorCode::SignalConflict,
            SamplerError::SpawnThread(_) => StackSamplerErrorCode::SpawnThread,
            SamplerError::InvalidConfiguration(_) => StackSamplerErrorCode::InvalidConfiguration,
        };
        Self::new(code, &value.to_string())
    }
}

/// Frees `error` and all its contents. After being called error will not point to a valid memory
/// address so any further actions on it could lead to undefined behavior.
///
/// # Safety
///
/// Only pass null or a pointer to a valid StackSamplerError created by this library.
#[no_mangle]
pub unsafe extern "C" fn ddog_sampler_error_free(error: Option<Box<StackSamplerError>>) {
    drop(error)
}

/// Returns the NUL-terminated message of `error`, or null. The pointer is
/// valid until the error is freed.
///
/// # Safety
///
/// Only pass null or a pointer to a valid StackSamplerError created by this library.
#[no_mangle]
pub unsafe extern "C" fn ddog_sampler_error_message(
    error: Option<&StackSamplerError>,
) -> *const c_char {
    error.map_or(std::ptr::null(), |e| e.msg.as_cstr().as_ptr())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_keeps_message() {
        let error = StackSamplerError::from(SamplerError::SignalConflict {
            installed: 26,
            requested: 27,
        });
        assert_eq!(error.code, StackSamplerErrorCode::SignalConflict);
        assert_eq!(
            error.msg.as_str(),
            "Sampling signal 26 already installed, cannot switch to 27"
        );
        let message = unsafe { ddog_sampler_error_message(Some(&error)) };
        let message = unsafe { std::ffi::CStr::from_ptr(message) };
        assert_eq!(
            message.to_bytes(),
            b"Sampling signal 26 already installed, cannot switch to 27"
        );
        assert!(unsafe { ddog_sampler_error_message(None) }.is_null());
        unsafe { ddog_sampler_error_free(Some(Box::new(error))) };
    }

    #[test]
    fn test_code_only_error() {
        let error = StackSamplerError::from(StackSamplerErrorCode::NotInitialized);
        assert_eq!(error.msg.as_str(), "The stack sampler is not initialized");
    }
}
