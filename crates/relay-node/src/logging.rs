//! Tracing subscriber setup.

use relay_settings::{LogFormat, LoggingSettings};
use tracing_subscriber::EnvFilter;

/// Filter from `RUST_LOG`, else the configured level, else `info`.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(settings: &LoggingSettings) {
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter(&settings.level));
    let result = match settings.format {
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
        LogFormat::Compact => builder.compact().with_target(false).try_init(),
    };
    if let Err(e) = result {
        eprintln!("tracing subscriber already installed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_level_falls_back() {
        // Must not panic on garbage directives.
        let _ = env_filter("not a [valid directive");
    }

    #[test]
    fn init_twice_is_harmless() {
        let settings = LoggingSettings::default();
        init(&settings);
        init(&settings);
    }
}
