// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Process-wide setup shared by every ember binary.

/// Installs the fmt subscriber, filtered by `RUST_LOG`.
///
/// Falls back to `info` when `RUST_LOG` is unset so swapchain and
/// frame-loop milestones are visible without extra configuration.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
