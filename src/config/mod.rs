//! TOML configuration with environment overrides.
//!
//! Every field has a default, so an empty file (or no file at all) is a
//! valid configuration. Environment variables win over the file.

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub webhook: WebhookConfig,
    pub rate_limit: RateLimitConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Maximum request body size in bytes.
    pub max_body_size: usize,
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 42617,
            max_body_size: 65_536,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct WebhookConfig {
    /// Shared HMAC secret. Unset means signatures cannot be checked.
    pub secret: Option<String>,
    /// Reject deliveries that cannot be verified.
    pub require_signature: bool,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            require_signature: true,
        }
    }
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("require_signature", &self.require_signature)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Commands allowed per principal per window. 0 disables limiting.
    pub max_per_window: u32,
    pub window_ms: u64,
    /// Minimum spacing between two runs of the same command by one principal.
    pub cooldown_ms: u64,
    pub sweep_interval_secs: u64,
    /// Cap on tracked principals. 0 falls back to the built-in default.
    ///
    /// Once the cap is hit and no window has closed, the least recently
    /// active principal is evicted and its window restarts on its next
    /// request. Size this above the expected number of concurrently active
    /// principals.
    pub max_principals: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: 10,
            window_ms: 60_000,
            cooldown_ms: 2_000,
            sweep_interval_secs: 300,
            max_principals: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct MetricsConfig {
    /// Ring buffer size.
    pub capacity: usize,
    /// Samples slower than this are logged as warnings.
    pub slow_threshold_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            slow_threshold_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, colorized.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("unknown log format '{other}' (expected 'pretty' or 'json')"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            level: "info".into(),
        }
    }
}

impl Config {
    /// `<platform config dir>/botgate/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "botgate")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Failed to parse config TOML")
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Load `explicit` if given (it must exist), else the default path if it
    /// exists, else defaults. Environment overrides are applied last.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load_from(path)?,
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(path) => Self::load_from(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        // Key material is taken verbatim; only a blank value is ignored.
        let secret = lookup("BOTGATE_WEBHOOK_SECRET");
        if let Some(secret) = secret.filter(|s| !s.trim().is_empty()) {
            self.webhook.secret = Some(secret);
        }
        if let Some(raw) = var("BOTGATE_REQUIRE_WEBHOOK_SIGNATURE") {
            self.webhook.require_signature =
                parse_bool(&raw).context("Invalid BOTGATE_REQUIRE_WEBHOOK_SIGNATURE")?;
        }

        match var("BOTGATE_LOG_FORMAT") {
            Some(raw) => {
                self.logging.format = raw.parse().context("Invalid BOTGATE_LOG_FORMAT")?;
            }
            None => {
                if var("BOTGATE_ENV").is_some_and(|env| env.eq_ignore_ascii_case("production")) {
                    self.logging.format = LogFormat::Json;
                }
            }
        }

        if let Some(host) = var("BOTGATE_HOST") {
            self.gateway.host = host;
        }
        if let Some(raw) = var("BOTGATE_PORT") {
            self.gateway.port = raw
                .parse()
                .with_context(|| format!("Invalid BOTGATE_PORT '{raw}'"))?;
        }

        Ok(())
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_toml_is_default() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.rate_limit.max_per_window, 10);
        assert_eq!(config.rate_limit.window_ms, 60_000);
        assert_eq!(config.rate_limit.cooldown_ms, 2_000);
        assert_eq!(config.rate_limit.sweep_interval_secs, 300);
        assert_eq!(config.metrics.capacity, 1_000);
        assert_eq!(config.metrics.slow_threshold_ms, 1_000);
        assert!(config.webhook.require_signature);
        assert!(config.webhook.secret.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [webhook]
            secret = "shh"

            [rate_limit]
            cooldown_ms = 500

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.webhook.secret.as_deref(), Some("shh"));
        assert!(config.webhook.require_signature);
        assert_eq!(config.rate_limit.cooldown_ms, 500);
        assert_eq!(config.rate_limit.max_per_window, 10);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(Config::from_toml("[rate_limit]\nmax_per_window = \"ten\"").is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[gateway]\nport = 9000\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.host, "127.0.0.1");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from(&dir.path().join("nope.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("nope.toml"));
    }

    #[test]
    fn env_overrides_win_over_file() {
        let mut config = Config::from_toml("[webhook]\nsecret = \"file\"\n").unwrap();
        config
            .apply_overrides_from(lookup(&[
                ("BOTGATE_WEBHOOK_SECRET", "env"),
                ("BOTGATE_REQUIRE_WEBHOOK_SIGNATURE", "false"),
                ("BOTGATE_PORT", "8080"),
            ]))
            .unwrap();

        assert_eq!(config.webhook.secret.as_deref(), Some("env"));
        assert!(!config.webhook.require_signature);
        assert_eq!(config.gateway.port, 8080);
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let mut config = Config::from_toml("[webhook]\nsecret = \"file\"\n").unwrap();
        config
            .apply_overrides_from(lookup(&[("BOTGATE_WEBHOOK_SECRET", "   ")]))
            .unwrap();
        assert_eq!(config.webhook.secret.as_deref(), Some("file"));
    }

    #[test]
    fn env_secret_is_taken_verbatim() {
        let mut config = Config::default();
        config
            .apply_overrides_from(lookup(&[
                ("BOTGATE_WEBHOOK_SECRET", "  padded key\t"),
                ("BOTGATE_PORT", " 8080 "),
            ]))
            .unwrap();
        assert_eq!(config.webhook.secret.as_deref(), Some("  padded key\t"));
        assert_eq!(config.gateway.port, 8080);
    }

    #[test]
    fn production_env_selects_json_logs() {
        let mut config = Config::default();
        config
            .apply_overrides_from(lookup(&[("BOTGATE_ENV", "Production")]))
            .unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);

        let mut config = Config::default();
        config
            .apply_overrides_from(lookup(&[
                ("BOTGATE_ENV", "production"),
                ("BOTGATE_LOG_FORMAT", "pretty"),
            ]))
            .unwrap();
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn bad_env_values_are_errors() {
        let mut config = Config::default();
        assert!(config
            .apply_overrides_from(lookup(&[("BOTGATE_REQUIRE_WEBHOOK_SIGNATURE", "maybe")]))
            .is_err());
        assert!(config
            .apply_overrides_from(lookup(&[("BOTGATE_PORT", "99999")]))
            .is_err());
    }

    #[test]
    fn debug_redacts_webhook_secret() {
        let config = WebhookConfig {
            secret: Some("hunter2".into()),
            require_signature: true,
        };
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn schema_exports() {
        let schema = schemars::schema_for!(Config);
        let rendered = serde_json::to_string(&schema).unwrap();
        assert!(rendered.contains("rate_limit"));
    }
}
