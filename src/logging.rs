use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::INFO;

/// Installs the global tracing subscriber. A CLI-provided level beats the
/// `[logging]` config section, which beats the `info` default.
pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_max_level(resolve_level(config, cli_level_override)?)
        .with_target(true);

    match resolve_format(config) {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    }
    .map_err(|err| anyhow!("install logging subscriber: {err}"))?;

    Ok(())
}

fn resolve_level(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<LevelFilter> {
    let configured = config
        .logging
        .as_ref()
        .and_then(|logging| logging.level.as_deref());
    let Some(raw_level) = cli_level_override.or(configured) else {
        return Ok(DEFAULT_LOG_LEVEL);
    };

    raw_level.trim().to_ascii_lowercase().parse().map_err(|_| {
        anyhow!("unknown log level `{raw_level}`, expected trace, debug, info, warn, error, or off")
    })
}

fn resolve_format(config: &Config) -> LogFormat {
    match config.logging.as_ref().and_then(|logging| logging.format) {
        Some(format) => format,
        None => LogFormat::Json,
    }
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::filter::LevelFilter;

    use super::{resolve_format, resolve_level};
    use crate::config::{Config, LogFormat};

    fn config(toml: &str) -> Config {
        Config::from_toml_str(toml).expect("config should parse")
    }

    #[test]
    fn level_defaults_to_info() {
        let level = resolve_level(&config(""), None).expect("default level should resolve");
        assert_eq!(level, LevelFilter::INFO);
    }

    #[test]
    fn cli_level_beats_configured_level() {
        let config = config("[logging]\nlevel = \"warn\"\n");
        assert_eq!(
            resolve_level(&config, Some("debug")).expect("cli level should resolve"),
            LevelFilter::DEBUG
        );
        assert_eq!(
            resolve_level(&config, None).expect("configured level should resolve"),
            LevelFilter::WARN
        );
    }

    #[test]
    fn unknown_level_is_rejected() {
        let err = resolve_level(&config(""), Some("verbose")).unwrap_err();
        assert!(err.to_string().contains("unknown log level"), "{err}");
    }

    #[test]
    fn format_defaults_to_json_and_can_be_pretty() {
        assert_eq!(resolve_format(&config("")), LogFormat::Json);
        assert_eq!(
            resolve_format(&config("[logging]\nformat = \"pretty\"\n")),
            LogFormat::Pretty
        );
    }
}
