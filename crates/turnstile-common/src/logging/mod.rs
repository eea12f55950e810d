//! Logging initialization shared by Turnstile binaries.
//!
//! The effective filter is resolved in priority order: `-v`/`-q` CLI flags,
//! then `RUST_LOG`, then the service's configured log level. Except under
//! `RUST_LOG`, the level applies to the turnstile crates only; foreign
//! crates stay at `warn` so a verbose ingestion run does not drown in
//! client-library chatter.

use anyhow::Result;
use clap_verbosity_flag::{LogLevel, Verbosity};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging for a Turnstile service binary.
///
/// # Arguments
///
/// * `verbosity` - The verbosity flags from clap (-v/-q)
/// * `service` - The binary name (dashes allowed; normalized to the crate's
///   module path)
/// * `configured_level` - The service config's log level, used when neither
///   CLI flags nor `RUST_LOG` are present
///
/// # Example
///
/// ```no_run
/// use clap::Parser;
/// use clap_verbosity_flag::{Verbosity, InfoLevel};
/// use turnstile_common::logging;
///
/// #[derive(Parser)]
/// struct Args {
///     #[clap(flatten)]
///     verbosity: Verbosity<InfoLevel>,
/// }
///
/// let args = Args::parse();
/// logging::init_logging(&args.verbosity, "turnstile-metering", "info").unwrap();
/// ```
pub fn init_logging<L: LogLevel>(
    verbosity: &Verbosity<L>,
    service: &str,
    configured_level: &str,
) -> Result<()> {
    let filter = if verbosity.is_present() {
        EnvFilter::try_new(directives(service, &verbosity.log_level_filter().to_string()))?
    } else if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        env_filter
    } else {
        EnvFilter::try_new(directives(service, configured_level))?
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .compact(),
        )
        .init();

    Ok(())
}

/// Turnstile crates at `level`, everything else at `warn`.
fn directives(service: &str, level: &str) -> String {
    let service = service.replace('-', "_");
    format!("warn,turnstile_common={level},{service}={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_scope_the_service_and_quiet_the_rest() {
        assert_eq!(
            directives("turnstile-metering", "debug"),
            "warn,turnstile_common=debug,turnstile_metering=debug"
        );
    }

    #[test]
    fn test_directives_parse_as_an_env_filter() {
        assert!(EnvFilter::try_new(directives("turnstile-metering", "trace")).is_ok());
    }
}
