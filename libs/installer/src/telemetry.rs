use crate::error::{Error, Result};

use clap::ValueEnum;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Filter directive used when verbosity flags are given on the command line.
pub fn filter_for_verbosity(log_filter: &str, verbose: u8) -> String {
    match verbose {
        0 => log_filter.to_string(),
        1 => format!("{log_filter},orkestra=debug,orkestra_installer=debug"),
        _ => format!("{log_filter},orkestra=trace,orkestra_installer=trace,kube=debug"),
    }
}

/// Initialize the global subscriber. Logs go to stderr so stdout keeps the step markers and
/// the final report.
pub fn init(log_filter: &str, log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_new(log_filter)
        .map_err(|e| Error::MissingData(format!("invalid log filter {log_filter}: {e}")))?;

    let registry = Registry::default().with(env_filter);
    let init_result = match log_format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .compact(),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init(),
    };
    init_result.map_err(|e| Error::MissingData(format!("failed to initialize logging: {e}")))
}

#[cfg(test)]
mod tests {
    use super::filter_for_verbosity;

    #[test]
    fn test_filter_for_verbosity() {
        assert_eq!(filter_for_verbosity("info", 0), "info");
        assert!(filter_for_verbosity("info", 1).contains("orkestra_installer=debug"));
        assert!(filter_for_verbosity("info", 3).contains("kube=debug"));
    }
}
