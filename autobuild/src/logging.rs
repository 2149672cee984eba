//! Development-time tracing for the engine.
//!
//! Tracing output is diagnostics only: it goes to stderr and is never
//! persisted. Anything an operator needs after the fact (failures, policy
//! violations, resets, crashes) is written to `.autobuild/audit.log` by
//! `io::audit`, independent of `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset: `warn`, raised by each `-v`.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "autobuild=info,warn",
        2 => "autobuild=debug,warn",
        _ => "autobuild=trace,info",
    }
}

/// Install the stderr subscriber. `RUST_LOG` wins over `verbosity`.
///
/// ```bash
/// RUST_LOG=autobuild=debug autobuild run --until-terminal
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbosity > 1)
                .compact(),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_crate_level() {
        assert_eq!(default_directive(0), "warn");
        assert!(default_directive(1).contains("autobuild=info"));
        assert!(default_directive(2).contains("autobuild=debug"));
        assert_eq!(default_directive(9), default_directive(3));
    }

    #[test]
    fn directives_parse() {
        for verbosity in 0..4 {
            EnvFilter::try_new(default_directive(verbosity)).expect("valid directive");
        }
    }
}
