//! Log subscriber setup for the `sbie` binary.
//!
//! Verbosity only applies to the sbie crates; dependencies such as `reqwest`
//! and `hyper` stay at `warn` unless `SBIE_LOG` or `RUST_LOG` says otherwise.
//! Logs always go to stderr so `--json` command output on stdout stays
//! parseable.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter override read before `RUST_LOG`.
pub const LOG_ENV: &str = "SBIE_LOG";

const SBIE_TARGETS: [&str; 3] = ["sbie_core", "sbie_native", "sbie"];

/// Filter directives for a verbosity: `info` for the sbie crates normally,
/// `debug` with `--verbose`.
pub fn default_directives(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    std::iter::once("warn".to_string())
        .chain(SBIE_TARGETS.iter().map(|target| format!("{target}={level}")))
        .collect::<Vec<_>>()
        .join(",")
}

fn env_filter(verbose: bool) -> EnvFilter {
    [LOG_ENV, EnvFilter::DEFAULT_ENV]
        .into_iter()
        .find_map(|var| EnvFilter::try_from_env(var).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directives(verbose)))
}

/// Install the global subscriber. `json` switches to newline-delimited JSON
/// events carrying the `event`/`step`/`status` fields from [`crate::obs`].
/// Only the first call takes effect.
pub fn init_tracing(json: bool, verbose: bool) {
    let layer = fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(env_filter(verbose));

    if json {
        registry
            .with(layer.with_target(false).json())
            .try_init()
            .ok();
    } else {
        registry.with(layer.with_target(verbose)).try_init().ok();
    }
}
