// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::ffi::{c_char, CStr};
use std::ptr::NonNull;

/// A NUL-terminated UTF-8 string owned by this library. `length` does not
/// count the terminator.
#[repr(C)]
#[derive(Debug)]
pub struct CString {
    ptr: NonNull<c_char>,
    length: usize,
}

// SAFETY: uniquely owned heap allocation.
unsafe impl Send for CString {}

impl CString {
    /// Copies `s`, cut at its first NUL byte if it has one.
    pub fn new_or_empty(s: &str) -> Self {
        Self::from(s.to_owned())
    }

    pub fn as_cstr(&self) -> &CStr {
        // SAFETY: built by `std::ffi::CString::into_raw` in `From<String>`.
        unsafe { CStr::from_ptr(self.ptr.as_ptr()) }
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: the bytes come from a `String` cut at a NUL byte, which is
        // always a char boundary.
        unsafe { std::str::from_utf8_unchecked(self.as_cstr().to_bytes()) }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl From<String> for CString {
    fn from(value: String) -> Self {
        let mut bytes = value.into_bytes();
        if let Some(nul) = bytes.iter().position(|&b| b == 0) {
            bytes.truncate(nul);
        }
        let owned = std::ffi::CString::new(bytes).unwrap_or_default();
        let length = owned.as_bytes().len();
        Self {
            // SAFETY: `into_raw` never returns null.
            ptr: unsafe { NonNull::new_unchecked(owned.into_raw()) },
            length,
        }
    }
}

impl Drop for CString {
    fn drop(&mut self) {
        // SAFETY: reclaims the allocation leaked in `From<String>`.
        drop(unsafe { std::ffi::CString::from_raw(self.ptr.as_ptr()) })
    }
}
