//! Session configuration.
//!
//! Sources, lowest priority first: built-in defaults, a TOML file, then
//! `PILOT_*` environment variables (a `.env` file is loaded by the binary).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub model: String,
    pub api_base: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_ms: u64,
    pub temperature: f32,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_ms: 60_000,
            temperature: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    pub profile_dir: Option<PathBuf>,
    /// DevTools endpoint of an already running Chrome to attach to.
    pub debug_endpoint: Option<String>,
    pub timeout_ms: u64,
    /// Pause after page-mutating primitives so the page can react.
    pub settle_ms: u64,
    pub window_width: u32,
    pub window_height: u32,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            profile_dir: None,
            debug_endpoint: None,
            timeout_ms: 30_000,
            settle_ms: 800,
            window_width: 1280,
            window_height: 800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Extra attempts per step after the first one fails.
    pub max_step_retries: u32,
    pub max_replans: u32,
    /// Attempts for each planning call.
    pub oracle_attempts: u32,
    /// Attempts for each disambiguation call made while interpreting.
    pub vision_attempts: u32,
    /// Pause before the first retry; doubles for each retry after that.
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_step_retries: 2,
            max_replans: 2,
            oracle_attempts: 2,
            vision_attempts: 2,
            retry_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl ControlConfig {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(
            self.retry_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Offer utterances that match no pattern to the oracle.
    pub oracle_fallback: bool,
    /// Search URL template; `{}` is replaced by the encoded term.
    pub search_url: String,
    pub default_scroll: u32,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            oracle_fallback: true,
            search_url: "https://duckduckgo.com/?q={}".to_string(),
            default_scroll: 600,
        }
    }
}

/// Per-host map from element label (case-insensitive) to selector.
pub type LocatorOverrides = HashMap<String, HashMap<String, String>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub oracle: OracleConfig,
    pub browser: BrowserConfig,
    pub control: ControlConfig,
    pub interpreter: InterpreterConfig,
    pub locator_overrides: LocatorOverrides,
}

impl Config {
    /// `<config dir>/browser-pilot/config.toml`, if the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("browser-pilot").join("config.toml"))
    }

    /// Loads `path`, or the default path when it exists, then applies the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        };

        let mut config = match file {
            Some(path) => {
                debug!(path = %path.display(), "loading config file");
                let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Overlays `PILOT_*` variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup("PILOT_MODEL") {
            self.oracle.model = model;
        }
        if let Some(base) = lookup("PILOT_API_BASE") {
            self.oracle.api_base = base;
        }
        if let Some(headless) = lookup("PILOT_HEADLESS") {
            self.browser.headless = parse_bool("PILOT_HEADLESS", &headless)?;
        }
        if let Some(path) = lookup("PILOT_CHROME_PATH") {
            self.browser.chrome_path = Some(PathBuf::from(path));
        }
        if let Some(endpoint) = lookup("PILOT_DEBUG_ENDPOINT") {
            self.browser.debug_endpoint = Some(endpoint);
        }
        if let Some(retries) = lookup("PILOT_MAX_RETRIES") {
            self.control.max_step_retries = parse_u32("PILOT_MAX_RETRIES", &retries)?;
        }
        if let Some(replans) = lookup("PILOT_MAX_REPLANS") {
            self.control.max_replans = parse_u32("PILOT_MAX_REPLANS", &replans)?;
        }
        if let Some(backoff) = lookup("PILOT_RETRY_BACKOFF_MS") {
            self.control.retry_backoff_ms = parse_u32("PILOT_RETRY_BACKOFF_MS", &backoff)?.into();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.oracle.model.trim().is_empty() {
            return Err(ConfigError::Invalid("oracle.model must not be empty".into()));
        }
        if self.oracle.timeout_ms == 0 || self.browser.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be greater than zero".into()));
        }
        if self.control.oracle_attempts == 0 || self.control.vision_attempts == 0 {
            return Err(ConfigError::Invalid("oracle attempts must be at least 1".into()));
        }
        if !self.interpreter.search_url.contains("{}") {
            return Err(ConfigError::Invalid(
                "interpreter.search_url must contain a {} placeholder".into(),
            ));
        }
        Ok(())
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle.timeout_ms)
    }

    pub fn driver_timeout(&self) -> Duration {
        Duration::from_millis(self.browser.timeout_ms)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid(format!("{key}: expected a boolean, got {other:?}"))),
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key}: expected a number, got {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.control.max_step_retries, 2);
        assert_eq!(config.control.vision_attempts, 2);
        assert!(config.browser.headless);
    }

    #[test]
    fn toml_overrides_only_named_fields() {
        let config = Config::from_toml(
            r##"
            [control]
            max_step_retries = 4

            [browser]
            headless = false

            [locator_overrides."example.com"]
            "sign in" = "#login-button"
            "##,
        )
        .unwrap();
        assert_eq!(config.control.max_step_retries, 4);
        assert_eq!(config.control.max_replans, 2);
        assert!(!config.browser.headless);
        assert_eq!(
            config.locator_overrides["example.com"]["sign in"],
            "#login-button"
        );
    }

    #[test]
    fn env_overlay_wins_and_rejects_garbage() {
        let mut config = Config::default();
        config
            .apply_env(|key| match key {
                "PILOT_MODEL" => Some("local-model".into()),
                "PILOT_HEADLESS" => Some("off".into()),
                "PILOT_MAX_REPLANS" => Some("5".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.oracle.model, "local-model");
        assert!(!config.browser.headless);
        assert_eq!(config.control.max_replans, 5);

        let err = config
            .apply_env(|key| (key == "PILOT_MAX_RETRIES").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pilot.toml");
        std::fs::write(&path, "[oracle]\ntimeout_ms = 1500\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.oracle_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let control = ControlConfig {
            retry_backoff_ms: 300,
            max_backoff_ms: 1_000,
            ..ControlConfig::default()
        };
        assert_eq!(control.backoff(1), Duration::from_millis(300));
        assert_eq!(control.backoff(2), Duration::from_millis(600));
        assert_eq!(control.backoff(3), Duration::from_millis(1_000));
        assert_eq!(control.backoff(40), Duration::from_millis(1_000));

        let mut config = Config::default();
        config
            .apply_env(|key| (key == "PILOT_RETRY_BACKOFF_MS").then(|| "0".to_string()))
            .unwrap();
        assert_eq!(config.control.backoff(3), Duration::ZERO);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut config = Config::default();
        config.browser.timeout_ms = 0;
        assert!(config.validate().is_err());
    }
}
