/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Periodic heap and CPU profile capture from a local diagnostic endpoint.
//!
//! [`runtime::control_panel::ControlPanel`] starts one sampling loop per
//! snapshot kind. Each loop polls the endpoint, writes timestamped artifacts
//! under `<output_dir>/<kind>/`, and when it finishes opens the profile
//! viewer on a port from the shared [`PortAllocator`].

use std::env;

use tracing_subscriber::EnvFilter;

pub mod prefs;
pub mod runtime;
pub mod services;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use port_allocator::{PortAllocError, PortAllocator};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable consulted when no `--log-filter` is given.
pub const LOG_FILTER_ENV: &str = "PPROF_HARVEST_LOG";

const DEFAULT_LOG_FILTER: &str = "info";

/// Install the fmt subscriber. `log` records are forwarded through its
/// `tracing-log` bridge. A second call is a no-op.
pub fn init_tracing(filter: Option<&str>) {
    let directive = filter
        .map(str::to_string)
        .or_else(|| env::var(LOG_FILTER_ENV).ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    let env_filter = EnvFilter::try_new(&directive).unwrap_or_else(|e| {
        eprintln!("ignoring invalid log filter '{directive}': {e}");
        EnvFilter::new(DEFAULT_LOG_FILTER)
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}
