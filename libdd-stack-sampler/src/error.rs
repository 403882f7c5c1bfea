// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[error("The sampler was uninstalled and cannot be installed again")]
    AlreadyUninstalled,
    #[error("Stack sampling is not supported on this platform")]
    Unsupported,
    #[cfg(unix)]
    #[error("Failed to install the sampling signal handler: {0}")]
    SignalHandler(#[from] nix::Error),
    #[error("Sampling signal {installed} already installed, cannot switch to {requested}")]
    SignalConflict { installed: i32, requested: i32 },
    #[error("Failed to spawn sampler thread: {0}")]
    SpawnThread(#[from] io::Error),
    #[error("Invalid sampler configuration: {0}")]
    InvalidConfiguration(#[from] anyhow::Error),
}
