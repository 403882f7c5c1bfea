// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::NonNull;

/// Holds the raw parts of a Rust Vec; it should only be created from Rust,
/// never from C.
#[repr(C)]
#[derive(Debug)]
pub struct Vec<T: Sized> {
    ptr: *const T,
    len: usize,
    capacity: usize,
    _marker: PhantomData<T>,
}

impl<T: Sized> Vec<T> {
    /// Like the regular rust `Vec`, this doesn't allocate memory when
    /// capacity is zero.
    pub const fn new() -> Self {
        Self {
            ptr: NonNull::dangling().as_ptr(),
            len: 0,
            capacity: 0,
            _marker: PhantomData,
        }
    }

    pub fn from_std(vec: std::vec::Vec<T>) -> Self {
        let mut v = ManuallyDrop::new(vec);
        Self {
            ptr: v.as_mut_ptr(),
            len: v.len(),
            capacity: v.capacity(),
            _marker: PhantomData,
        }
    }

    pub fn into_std(self) -> std::vec::Vec<T> {
        let v = ManuallyDrop::new(self);
        // SAFETY: the parts come from `from_std` and are owned by `v`.
        unsafe { std::vec::Vec::from_raw_parts(v.ptr.cast_mut(), v.len, v.capacity) }
    }
}

unsafe impl<T: Send> Send for Vec<T> {}

unsafe impl<T: Sync> Sync for Vec<T> {}

impl<T> Drop for Vec<T> {
    fn drop(&mut self) {
        // An empty `Vec::new()` never allocated.
        if self.capacity == 0 {
            return;
        }
        // SAFETY: the parts come from `from_std` and were not released yet.
        drop(unsafe {
            std::vec::Vec::from_raw_parts(self.ptr.cast_mut(), self.len, self.capacity)
        })
    }
}

impl<T> Deref for Vec<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        // SAFETY: `ptr` is valid for `len` elements, or dangling with len 0.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl<T> Default for Vec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> From<std::vec::Vec<T>> for Vec<T> {
    fn from(vec: std::vec::Vec<T>) -> Self {
        Self::from_std(vec)
    }
}

impl<T> From<Vec<T>> for std::vec::Vec<T> {
    fn from(vec: Vec<T>) -> Self {
        vec.into_std()
    }
}
