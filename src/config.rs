use std::{fs, path::Path};

use anyhow::Context as _;
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml = fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse TOML config")
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// One recording listener: traffic accepted on `source_port` is forwarded
/// to `target_host:target_port` and captured on the way through.
#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    pub source_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub target_type: TargetType,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Header names dropped from recorded requests (case-insensitive).
    #[serde(default)]
    pub redact_request_headers: Vec<String>,
    /// Regex rewrites applied to named response headers, in order.
    #[serde(default)]
    pub response_header_replacements: Vec<HeaderReplacement>,
}

impl EndpointConfig {
    /// Upstream URL for a proxied HTTP request, e.g. `https://host:443/a/b?q=1`.
    pub fn upstream_url(&self, path_and_query: &str) -> String {
        format!(
            "{}://{}:{}{path_and_query}",
            self.target_type.scheme(),
            self.target_host,
            self.target_port
        )
    }

    /// Upstream URL for a WebSocket upgrade, e.g. `wss://host:443/socket`.
    pub fn upstream_websocket_url(&self, path_and_query: &str) -> String {
        format!(
            "{}://{}:{}{path_and_query}",
            self.target_type.websocket_scheme(),
            self.target_host,
            self.target_port
        )
    }
}

fn default_health_path() -> String {
    "/health".to_owned()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Http,
    Https,
}

impl TargetType {
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub fn websocket_scheme(self) -> &'static str {
        match self {
            Self::Http => "ws",
            Self::Https => "wss",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HeaderReplacement {
    pub header: String,
    pub regex: String,
    pub replace: String,
}

#[cfg(test)]
mod tests {
    use super::{Config, LogFormat, TargetType};

    #[test]
    fn parses_full_endpoint_config() {
        let config = Config::from_toml_str(
            r#"
[logging]
level = "debug"
format = "pretty"

[[endpoints]]
source_port = 8080
target_host = "api.example.com"
target_port = 443
target_type = "https"
health_path = "/healthz"
redact_request_headers = ["Authorization", "X-Api-Key"]

[[endpoints.response_header_replacements]]
header = "Set-Cookie"
regex = "sessionid=[^;]+"
replace = "sessionid=X"
"#,
        )
        .expect("config should parse");

        let logging = config.logging.expect("logging section");
        assert_eq!(logging.level.as_deref(), Some("debug"));
        assert_eq!(logging.format, Some(LogFormat::Pretty));

        assert_eq!(config.endpoints.len(), 1);
        let endpoint = &config.endpoints[0];
        assert_eq!(endpoint.source_port, 8080);
        assert_eq!(endpoint.target_host, "api.example.com");
        assert_eq!(endpoint.target_port, 443);
        assert_eq!(endpoint.target_type, TargetType::Https);
        assert_eq!(endpoint.health_path, "/healthz");
        assert_eq!(
            endpoint.redact_request_headers,
            vec!["Authorization", "X-Api-Key"]
        );
        assert_eq!(endpoint.response_header_replacements.len(), 1);
        assert_eq!(endpoint.response_header_replacements[0].header, "Set-Cookie");
    }

    #[test]
    fn health_path_defaults_when_omitted() {
        let config = Config::from_toml_str(
            r#"
[[endpoints]]
source_port = 0
target_host = "127.0.0.1"
target_port = 9000
target_type = "http"
"#,
        )
        .expect("config should parse");

        let endpoint = &config.endpoints[0];
        assert_eq!(endpoint.health_path, "/health");
        assert!(endpoint.redact_request_headers.is_empty());
        assert!(endpoint.response_header_replacements.is_empty());
    }

    #[test]
    fn upstream_urls_follow_target_type() {
        let config = Config::from_toml_str(
            r#"
[[endpoints]]
source_port = 0
target_host = "example.com"
target_port = 443
target_type = "https"
"#,
        )
        .expect("config should parse");

        let endpoint = &config.endpoints[0];
        assert_eq!(
            endpoint.upstream_url("/data?x=1"),
            "https://example.com:443/data?x=1"
        );
        assert_eq!(
            endpoint.upstream_websocket_url("/socket"),
            "wss://example.com:443/socket"
        );
    }

    #[test]
    fn rejects_unknown_target_type() {
        let err = Config::from_toml_str(
            r#"
[[endpoints]]
source_port = 0
target_host = "example.com"
target_port = 80
target_type = "ftp"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("parse TOML config"), "{err}");
    }
}
