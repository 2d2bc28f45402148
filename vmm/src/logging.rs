// SPDX-License-Identifier: GPL-2.0-only
use tracing_subscriber::{fmt, EnvFilter};

/// Diagnostics go to stderr so command output on stdout stays clean.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    fmt()
        .without_time()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
