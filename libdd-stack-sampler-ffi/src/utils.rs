// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::{StackSamplerError, StackSamplerErrorCode};

/// Wraps the body of a fallible C-FFI function, which returns
/// `Result<(), StackSamplerError>`, into the `Option<Box<StackSamplerError>>`
/// the C side sees. Panics become a `Panic` error. Expects the function to be
/// decorated with #[named].
macro_rules! wrap_with_error {
    ($body:block) => {{
        use std::panic::{catch_unwind, AssertUnwindSafe};

        catch_unwind(AssertUnwindSafe(
            || -> Result<(), $crate::error::StackSamplerError> { $body },
        ))
        .unwrap_or_else(|e| Err($crate::utils::handle_panic_error(e, function_name!())))
        .err()
        .map(Box::new)
    }};
}

/// Wraps the body of an infallible C-FFI function; a panic returns
/// `$default` instead of unwinding into C.
macro_rules! wrap_or {
    ($default:expr, $body:block) => {{
        use std::panic::{catch_unwind, AssertUnwindSafe};

        catch_unwind(AssertUnwindSafe(|| $body)).unwrap_or($default)
    }};
}

pub(crate) use {wrap_or, wrap_with_error};

/// Turns a panic payload into an error naming the function it came from.
pub(crate) fn handle_panic_error(
    error: Box<dyn std::any::Any + Send + 'static>,
    function_name: &str,
) -> StackSamplerError {
    // This pattern of String vs &str comes from
    // https://doc.rust-lang.org/std/panic/struct.PanicHookInfo.html#method.payload
    let msg = if let Some(s) = error.downcast_ref::<String>() {
        format!("{function_name} failed: (panic) {s}")
    } else if let Some(s) = error.downcast_ref::<&str>() {
        format!("{function_name} failed: (panic) {s}")
    } else {
        format!("{function_name} failed: (panic) Unable to retrieve panic context")
    };
    StackSamplerError::new(StackSamplerErrorCode::Panic, &msg)
}
