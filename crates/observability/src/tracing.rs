//! Tracing subscriber installation.
//!
//! Filtering comes from `RUST_LOG`; `LOG_FORMAT=pretty` switches the JSON
//! output to human-readable lines for local runs.

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(std::env::var("LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("pretty") => Self::Pretty,
            _ => Self::Json,
        }
    }
}

/// Install the global subscriber.
///
/// `default_filter` applies when `RUST_LOG` is unset or invalid. Returns
/// `false` if a subscriber was already installed.
pub fn init_with(format: LogFormat, default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().try_init().is_ok(),
        LogFormat::Pretty => builder.try_init().is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_defaults_to_json() {
        assert_eq!(LogFormat::parse(None), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("json")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some(" Pretty ")), LogFormat::Pretty);
    }

    #[test]
    fn second_init_is_a_noop() {
        init_with(LogFormat::Json, "warn");
        assert!(!init_with(LogFormat::Pretty, "warn"));
    }
}
