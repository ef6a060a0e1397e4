use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::{MakeWriter, fmt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogFormat, Logging};

/// Installs a global JSON subscriber which also forwards events to sentry.
pub fn init_json_logging<W>(env_filter: &str, make_writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(env_filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(make_writer)
        .finish()
        .with(sentry::integrations::tracing::layer())
        .init();
}

/// Installs a global subscriber as configured, writing to stderr.
///
/// The `RUST_LOG` environment variable takes precedence over the configured level.
pub fn init_logging(config: &Logging) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        format!(
            "{level},resourcer_service={level}",
            level = config.level.to_string().to_lowercase()
        )
    });

    match config.format {
        LogFormat::Json => init_json_logging(&filter, std::io::stderr),
        LogFormat::Simplified => fmt()
            .with_timer(UtcTime::rfc_3339())
            .with_target(false)
            .with_env_filter(filter.as_str())
            .with_writer(std::io::stderr)
            .finish()
            .with(sentry::integrations::tracing::layer())
            .init(),
    }
}
