use tracing::Level;
use tracing_subscriber::{
    filter::Directive,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Crates logged at the configured level. Everything else, redis and tokio
/// included, stays at `warn`.
const FLEETLINK_TARGETS: &[&str] = &["fleetlink", "fleetlink_core", "fleetlink_cluster"];

/// Per-packet chatter, kept at `info` even when the rest runs at `debug`
const PACKET_TARGETS: &[&str] = &["fleetlink_cluster::packet::bus", "fleetlink_cluster::packet::dedup"];

/// Initialize structured logging based on configuration
///
/// Supports both JSON (production) and pretty (development) formats
/// with configurable log levels and optional file output.
/// `RUST_LOG` takes precedence over the configured level and directives.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => {
            parse_log_level(&config.level)?;
            filter
        }
        Err(_) => default_filter(config)?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.format.as_str() == "json" {
        let json_layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_line_number(true)
            .with_file(true);

        if let Some(file_path) = &config.file_path {
            let file = open_log_file(file_path)?;
            registry.with(json_layer.with_writer(file)).try_init()?;
        } else {
            registry.with(json_layer).try_init()?;
        }
    } else {
        let pretty_layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_line_number(true)
            .with_file(false);

        if let Some(file_path) = &config.file_path {
            let file = open_log_file(file_path)?;
            registry
                .with(pretty_layer.with_ansi(false).with_writer(file))
                .try_init()?;
        } else {
            registry.with(pretty_layer).try_init()?;
        }
    }

    Ok(())
}

fn open_log_file(path: &str) -> anyhow::Result<std::sync::Arc<std::fs::File>> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(std::sync::Arc::new(file))
}

/// Filter used when `RUST_LOG` is not set
fn default_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    let level = parse_log_level(&config.level)?.to_string().to_lowercase();
    let mut filter = EnvFilter::new("warn");

    for target in FLEETLINK_TARGETS {
        filter = filter.add_directive(format!("{target}={level}").parse::<Directive>()?);
    }
    if matches!(level.as_str(), "trace" | "debug") {
        for target in PACKET_TARGETS {
            filter = filter.add_directive(format!("{target}=info").parse::<Directive>()?);
        }
    }
    // Configured directives come last and win over the defaults above
    for directive in &config.directives {
        let parsed = directive
            .parse::<Directive>()
            .map_err(|e| anyhow::anyhow!("Invalid log directive `{directive}`: {e}"))?;
        filter = filter.add_directive(parsed);
    }
    Ok(filter)
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(parse_log_level("trace").is_ok());
        assert!(parse_log_level("debug").is_ok());
        assert!(parse_log_level("INFO").is_ok());
        assert!(parse_log_level("warning").is_ok());
        assert!(parse_log_level("error").is_ok());
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_init_logging_rejects_bad_level() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }

    #[test]
    fn test_default_filter_scopes_level_to_fleetlink() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            directives: vec!["fleetlink_cluster::matchmaking=trace".to_string()],
            ..LoggingConfig::default()
        };
        let rendered = default_filter(&config).unwrap().to_string().to_lowercase();

        assert!(rendered.contains("fleetlink_cluster=debug"), "{rendered}");
        assert!(rendered.contains("fleetlink_core=debug"), "{rendered}");
        assert!(rendered.contains("fleetlink_cluster::packet::bus=info"), "{rendered}");
        assert!(rendered.contains("fleetlink_cluster::matchmaking=trace"), "{rendered}");
        assert!(rendered.contains("warn"), "{rendered}");
    }

    #[test]
    fn test_default_filter_rejects_bad_directive() {
        let config = LoggingConfig {
            directives: vec!["fleetlink_cluster=shouting".to_string()],
            ..LoggingConfig::default()
        };
        assert!(default_filter(&config).is_err());
    }
}
