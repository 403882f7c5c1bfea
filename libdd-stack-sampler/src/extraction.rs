// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::host::{FrameHandle, FrameInfo, HostRuntime};
use crate::state::ThreadSamplerState;
use serde::{Deserialize, Serialize};

/// Stand-in for a frame field the host could not resolve.
pub const UNKNOWN_FIELD: &str = " ";

/// One resolved frame of a trace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceLine {
    pub file: String,
    pub line: i32,
    pub klass: String,
    pub label: String,
}

/// A trace, innermost frame first.
pub type Trace = Vec<TraceLine>;

impl TraceLine {
    pub(crate) fn resolve(host: &dyn HostRuntime, frame: FrameHandle, line: i32) -> Self {
        let FrameInfo {
            absolute_path,
            label,
            classpath,
            ..
        } = host.describe_frame(frame);
        let or_unknown = |field: Option<String>| field.unwrap_or_else(|| UNKNOWN_FIELD.to_owned());
        Self {
            file: or_unknown(absolute_path),
            line,
            klass: or_unknown(classpath),
            label: or_unknown(label),
        }
    }
}

/// Returns every trace between the trace boundary and the cursor, oldest
/// first, and rewinds the cursor to the boundary.
///
/// Rows are copied out before their frames are resolved, and the cursor is
/// only rewound once resolution is done. Until then the rows stay in the
/// rooted buffer, and a capture the host runs while resolving lands past
/// them, at the cursor, where the rewind discards it.
pub(crate) fn extract(state: &ThreadSamplerState) -> Vec<Trace> {
    let start = state.start_trace_index();
    let end = state.cur_traces_num();
    let mut rows = Vec::with_capacity(end.saturating_sub(start));
    for slot in start..end {
        // SAFETY: called on the owning thread, `slot < cur_traces_num`.
        let (frames, lines) = unsafe { state.row(slot) };
        if !frames.is_empty() {
            rows.push(
                frames
                    .iter()
                    .copied()
                    .zip(lines.iter().copied())
                    .collect::<Vec<_>>(),
            );
        }
    }

    let host = state.host();
    let traces = rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|(frame, line)| TraceLine::resolve(host, frame, line))
                .collect()
        })
        .collect();
    state.rewind_to_start();
    traces
}
