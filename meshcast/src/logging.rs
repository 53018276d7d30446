use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig};

/// Crates whose events follow `LoggingConfig::level`
const MESH_TARGETS: &[&str] = &["meshcast", "meshcast_sim"];

/// Install the global subscriber for a meshcast process
///
/// `RUST_LOG`, when set, replaces the configured directives. Otherwise the
/// meshcast crates log at `level` and everything else at
/// `dependency_level`, which keeps ICE and DTLS chatter out of the output.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => mesh_filter(config)?,
    };

    let output = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(config.ansi)
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()?;
    Ok(())
}

/// Filter directives for the configured levels
fn mesh_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    Ok(EnvFilter::try_new(directives(config)?)?)
}

fn directives(config: &LoggingConfig) -> anyhow::Result<String> {
    let mesh = parse_log_level(&config.level)?;
    let dependencies = parse_log_level(&config.dependency_level)?;

    let mut parts = vec![dependencies.to_string().to_lowercase()];
    parts.extend(
        MESH_TARGETS
            .iter()
            .map(|target| format!("{target}={}", mesh.to_string().to_lowercase())),
    );
    Ok(parts.join(","))
}

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
    fn test_directives_split_mesh_and_dependencies() {
        let config = LoggingConfig {
            level: "DEBUG".to_string(),
            dependency_level: "error".to_string(),
            ..Default::default()
        };
        assert_eq!(
            directives(&config).unwrap(),
            "error,meshcast=debug,meshcast_sim=debug"
        );
        assert!(mesh_filter(&config).is_ok());
    }

    #[test]
    fn test_warning_alias_is_accepted() {
        assert_eq!(parse_log_level("warning").unwrap(), Level::WARN);
    }

    #[test]
    fn test_invalid_levels_are_rejected() {
        let loud = LoggingConfig {
            level: "loud".to_string(),
            ..Default::default()
        };
        assert!(directives(&loud).is_err());

        let noisy_deps = LoggingConfig {
            dependency_level: "verbose".to_string(),
            ..Default::default()
        };
        assert!(mesh_filter(&noisy_deps).is_err());
    }
}
