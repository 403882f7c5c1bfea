// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Owned, C-compatible views of extracted traces.

use crate::cstr::CString;
use crate::vec::Vec;
use libdd_stack_sampler as sampler;

#[repr(C)]
#[derive(Debug)]
pub struct TraceLine {
    pub file: CString,
    pub line: i32,
    pub klass: CString,
    pub label: CString,
}

/// Frames of one trace, innermost first.
pub type Trace = Vec<TraceLine>;

/// Traces in capture order. Free with `ddog_sampler_traces_drop`.
pub type Traces = Vec<Trace>;

impl From<sampler::TraceLine> for TraceLine {
    fn from(value: sampler::TraceLine) -> Self {
        Self {
            file: value.file.into(),
            line: value.line,
            klass: value.klass.into(),
            label: value.label.into(),
        }
    }
}

pub(crate) fn to_ffi(traces: std::vec::Vec<sampler::Trace>) -> Traces {
    traces
        .into_iter()
        .map(|trace| Vec::from_std(trace.into_iter().map(TraceLine::from).collect()))
        .collect::<std::vec::Vec<_>>()
        .into()
}

/// Frees traces returned by `ddog_sampler_profile_frames`.
///
/// # Safety
///
/// Only pass null or a pointer to traces returned by this library.
#[no_mangle]
pub unsafe extern "C" fn ddog_sampler_traces_drop(traces: Option<&mut Traces>) {
    if let Some(traces) = traces {
        // Leaves an empty value behind, so a second drop is harmless.
        drop(std::mem::take(traces));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(file: &str, line: i32) -> sampler::TraceLine {
        sampler::TraceLine {
            file: file.to_owned(),
            line,
            klass: sampler::UNKNOWN_FIELD.to_owned(),
            label: "call".to_owned(),
        }
    }

    #[test]
    fn test_traces_layout() {
        let mut traces = to_ffi(vec![
            vec![line("a.rb", 1), line("b.rb", 2)],
            vec![],
            vec![line("c.rb", 3)],
        ]);
        assert_eq!(traces.len(), 3);
        assert_eq!(traces[0].len(), 2);
        assert!(traces[1].is_empty());
        assert_eq!(traces[0][1].file.as_str(), "b.rb");
        assert_eq!(traces[0][1].file.as_cstr().to_bytes_with_nul(), b"b.rb\0");
        assert_eq!(traces[0][1].line, 2);
        assert_eq!(traces[0][0].klass.as_str(), " ");

        unsafe {
            ddog_sampler_traces_drop(Some(&mut traces));
            ddog_sampler_traces_drop(Some(&mut traces));
            ddog_sampler_traces_drop(None);
        }
        assert!(traces.is_empty());
    }
}
