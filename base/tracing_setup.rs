// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Logic for setting up a `tracing` subscriber according to our preferences.

use tracing_subscriber::EnvFilter;

fn default_env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Installs the global subscriber for normal operation.
///
/// Writes to stderr with thread names, since worker threads are named after
/// their streams and that is the most useful context for a log line.
pub fn install() {
    tracing_subscriber::fmt()
        .with_env_filter(default_env_filter())
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Installs a subscriber for tests. They may run in parallel in one process,
/// so this is best-effort: the first install wins.
pub fn install_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(default_env_filter())
        .with_thread_names(true)
        .with_test_writer()
        .try_init();
}
