//! YAML configuration loading and validation.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::from("0.0.0.0"),
            port: 8055,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// OpenAI-compatible API root, e.g. `http://127.0.0.1:1234/v1`.
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Connect timeout; streamed responses themselves are unbounded.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// When set, overrides the model name forwarded upstream.
    #[serde(default)]
    pub model: Option<String>,
}

impl UpstreamConfig {
    #[must_use]
    pub fn chat_completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FeaturesConfig {
    /// Rewrites emulated tool-call markup into native tool_calls chunks.
    /// Off, the proxy forwards upstream responses untouched.
    pub tool_emulation: bool,
    /// Default tracing filter; `RUST_LOG` wins when set.
    pub log_level: Option<String>,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            tool_emulation: true,
            log_level: None,
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Load and validate a config file.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config: Config = serde_yaml::from_str(&raw)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let url = Url::parse(&config.upstream.base_url)
        .map_err(|err| ConfigError::Invalid(format!("upstream.base_url: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid(format!(
            "upstream.base_url: unsupported scheme `{}`",
            url.scheme()
        )));
    }
    if config.server.port == 0 {
        return Err(ConfigError::Invalid(String::from(
            "server.port: must be non-zero",
        )));
    }
    if config.upstream.connect_timeout_secs == 0 {
        return Err(ConfigError::Invalid(String::from(
            "upstream.connect_timeout_secs: must be non-zero",
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse("upstream:\n  base_url: http://localhost:1234/v1\n").unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8055);
        assert!(config.features.tool_emulation);
        assert_eq!(config.upstream.connect_timeout_secs, 10);
        assert_eq!(
            config.upstream.chat_completions_url(),
            "http://localhost:1234/v1/chat/completions"
        );
    }

    #[test]
    fn trailing_slash_in_base_url_is_normalized() {
        let config = parse("upstream:\n  base_url: http://localhost:1234/v1/\n").unwrap();
        assert_eq!(
            config.upstream.chat_completions_url(),
            "http://localhost:1234/v1/chat/completions"
        );
    }

    #[test]
    fn rejects_bad_scheme_and_zero_port() {
        assert!(parse("upstream:\n  base_url: ftp://host/v1\n").is_err());
        assert!(parse(
            "server:\n  port: 0\nupstream:\n  base_url: http://localhost:1234/v1\n"
        )
        .is_err());
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(parse("upstream:\n  base_url: http://h/v1\n  extra: 1\n").is_err());
    }

    #[test]
    fn full_config_round_trips() {
        let yaml = "\
server:
  host: 127.0.0.1
  port: 9000
upstream:
  base_url: https://api.example.com/v1
  api_key: sk-test
  connect_timeout_secs: 5
  model: local-diagram-model
features:
  tool_emulation: false
  log_level: debug
";
        let config = parse(yaml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.upstream.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.upstream.model.as_deref(), Some("local-diagram-model"));
        assert!(!config.features.tool_emulation);
        assert_eq!(config.features.log_level.as_deref(), Some("debug"));
    }
}
