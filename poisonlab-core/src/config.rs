//! Configuration system for poisonlab.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit overrides. Configuration is
//! loaded from `~/.config/poisonlab/config.toml` and/or `.poisonlab/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoisonConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub integrity: IntegrityConfig,
    #[serde(default)]
    pub flag: FlagConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Where session datasets live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one `<session>_baseline.csv` per session.
    pub datasets_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            datasets_dir: PathBuf::from("data").join("datasets"),
        }
    }
}

/// OpenAI-compatible endpoint used as the row scoring oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Base URL of the chat completions API.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Explicit API key; takes precedence over `api_key_env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Hard timeout for a single oracle call, in seconds.
    pub timeout_secs: u64,
    /// Maximum tokens requested for a scoring reply.
    pub max_tokens: u32,
    /// Sampling temperature for scoring requests.
    pub temperature: f32,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            api_key: None,
            timeout_secs: 30,
            max_tokens: 10,
            temperature: 0.0,
        }
    }
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Thresholds driving the integrity score state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityConfig {
    /// Scores strictly below this make the flag reachable.
    pub flag_threshold: f64,
    /// Global display threshold used by presentation layers.
    pub display_threshold: f64,
    /// Scores at or above this are fully trusted.
    pub trusted_threshold: f64,
    /// Largest penalty a single row may receive.
    pub max_row_score: f64,
    /// Re-append the sentinel row on every qualifying upload instead of once.
    pub repeat_injection: bool,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            flag_threshold: 0.25,
            display_threshold: 0.4,
            trusted_threshold: 0.50,
            max_row_score: 0.07,
            repeat_injection: false,
        }
    }
}

/// The hidden marker injected once integrity collapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagConfig {
    pub label: String,
    pub token: String,
    /// Append-only log of correct flag submissions.
    pub submission_log: PathBuf,
}

impl Default for FlagConfig {
    fn default() -> Self {
        Self {
            label: "FLAG".to_string(),
            token: "ME{D4Ta_P01sOn1nG}".to_string(),
            submission_log: PathBuf::from("data")
                .join("flags")
                .join("correct_flags.log"),
        }
    }
}

/// Session lifetime policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Evict sessions idle for longer than this. Unset keeps sessions for the
    /// process lifetime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_ttl_secs: Option<u64>,
}

impl PoisonConfig {
    /// Check the thresholds form a consistent state machine.
    pub fn validate(&self) -> Result<(), String> {
        let i = &self.integrity;
        for (name, value) in [
            ("flag_threshold", i.flag_threshold),
            ("display_threshold", i.display_threshold),
            ("trusted_threshold", i.trusted_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("integrity.{name} must be within [0, 1], got {value}"));
            }
        }
        if i.flag_threshold > i.trusted_threshold {
            return Err(format!(
                "integrity.flag_threshold ({}) must not exceed integrity.trusted_threshold ({})",
                i.flag_threshold, i.trusted_threshold
            ));
        }
        if !(i.max_row_score.is_finite() && i.max_row_score >= 0.0) {
            return Err(format!(
                "integrity.max_row_score must be a non-negative number, got {}",
                i.max_row_score
            ));
        }
        if self.oracle.timeout_secs == 0 {
            return Err("oracle.timeout_secs must be greater than zero".to_string());
        }
        if self.flag.label.is_empty() || self.flag.token.is_empty() {
            return Err("flag.label and flag.token must not be empty".to_string());
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `POISONLAB_`)
/// 3. Workspace-local config (`.poisonlab/config.toml`)
/// 4. User config (`~/.config/poisonlab/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&PoisonConfig>,
) -> Result<PoisonConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(PoisonConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "poisonlab", "poisonlab") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".poisonlab").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // POISONLAB_ORACLE__MODEL, POISONLAB_INTEGRITY__REPEAT_INJECTION, etc.
    figment = figment.merge(Env::prefixed("POISONLAB_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = PoisonConfig::default();
        assert_eq!(config.integrity.flag_threshold, 0.25);
        assert_eq!(config.integrity.display_threshold, 0.4);
        assert_eq!(config.integrity.max_row_score, 0.07);
        assert!(!config.integrity.repeat_injection);
        assert_eq!(config.oracle.timeout_secs, 30);
        assert_eq!(config.flag.token, "ME{D4Ta_P01sOn1nG}");
        assert!(config.session.idle_ttl_secs.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = PoisonConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: PoisonConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.oracle.model, config.oracle.model);
        assert_eq!(deserialized.storage.datasets_dir, config.storage.datasets_dir);
    }

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(None, None).unwrap();
        assert_eq!(config.flag.label, "FLAG");
    }

    #[test]
    fn test_workspace_config_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg_dir = dir.path().join(".poisonlab");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            "[integrity]\nflag_threshold = 0.3\ndisplay_threshold = 0.4\ntrusted_threshold = 0.5\nmax_row_score = 0.05\nrepeat_injection = true\n",
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.integrity.flag_threshold, 0.3);
        assert_eq!(config.integrity.max_row_score, 0.05);
        assert!(config.integrity.repeat_injection);
        assert_eq!(config.oracle.model, "gpt-3.5-turbo");
    }

    #[test]
    fn test_explicit_overrides_win() {
        let mut overrides = PoisonConfig::default();
        overrides.storage.datasets_dir = PathBuf::from("/srv/poisonlab");
        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.storage.datasets_dir, PathBuf::from("/srv/poisonlab"));
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut config = PoisonConfig::default();
        config.integrity.flag_threshold = 0.9;
        assert!(config.validate().is_err());

        let mut config = PoisonConfig::default();
        config.oracle.timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
