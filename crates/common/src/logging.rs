// fil-rpc-proxy - Caching JSON-RPC reverse proxy
// Copyright (C) 2024 fil-rpc-proxy contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Logging initialization for the proxy binary and for tests

use std::sync::Once;

use eyre::Result;
use tracing_subscriber::EnvFilter;

static TEST_LOGGING: Once = Once::new();

/// Initializes the global tracing subscriber for the proxy binary.
///
/// The filter is taken from `RUST_LOG` when set, otherwise from the
/// configured level. `debug` forces debug verbosity regardless of the
/// configured level; `pretty` switches from the compact single-line format
/// to a multi-line human-readable one.
///
/// # Arguments
/// * `level` - Default log level (e.g. "info") when `RUST_LOG` is unset
/// * `pretty` - Use the pretty multi-line formatter
/// * `debug` - Force debug verbosity
pub fn init_logging(level: &str, pretty: bool, debug: bool) -> Result<()> {
    let default_level = if debug { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level.to_lowercase()))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    if pretty {
        builder.pretty().try_init().map_err(|e| eyre::eyre!("failed to init logging: {e}"))?;
    } else {
        builder.compact().try_init().map_err(|e| eyre::eyre!("failed to init logging: {e}"))?;
    }

    Ok(())
}

/// Initializes logging for tests, at most once per process.
///
/// Safe to call from every test; later calls are no-ops. Pass a level to
/// override the `RUST_LOG`/default selection.
pub fn ensure_test_logging(level: Option<&str>) {
    TEST_LOGGING.call_once(|| {
        let default_level = level.unwrap_or("debug");
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_test_writer()
            .compact()
            .try_init();
    });
}
