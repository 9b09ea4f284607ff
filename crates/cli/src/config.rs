//! Configuration loading from gatehouse.toml.

use policy::IdentityScope;
use runtime::Settings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "gatehouse.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// Where the database and key file live. Defaults to the platform data
    /// directory.
    pub data_dir: Option<PathBuf>,

    /// Directory of plugin manifests (`*.toml`) registered next to the
    /// built-in plugins.
    pub plugins_dir: Option<PathBuf>,

    #[serde(default)]
    pub tokens: TokensConfig,

    #[serde(default)]
    pub consent: ConsentConfig,

    #[serde(default)]
    pub identity: IdentityConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokensConfig {
    /// Lifetime of always and once tokens.
    #[serde(default = "default_expiry_hours")]
    pub expiry_hours: u64,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            expiry_hours: default_expiry_hours(),
        }
    }
}

/// Ten years.
const MAX_EXPIRY_HOURS: u64 = 10 * 365 * 24;

fn default_expiry_hours() -> u64 {
    24
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConsentConfig {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

fn default_timeout_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub scope: IdentityScope,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else `gatehouse.toml` in the working directory
    /// if it exists, else the defaults. Environment overrides apply on top.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::load(path)?,
            None if Path::new(CONFIG_FILE).exists() => Self::load(CONFIG_FILE)?,
            None => Self::default(),
        };
        config.with_env(|name| std::env::var(name).ok())
    }

    /// Apply `GATEHOUSE_*` overrides read through `lookup`.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(dir) = lookup("GATEHOUSE_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(hours) = lookup("GATEHOUSE_TOKEN_EXPIRY_HOURS") {
            self.tokens.expiry_hours = parse_number("GATEHOUSE_TOKEN_EXPIRY_HOURS", &hours)?;
        }
        if let Some(seconds) = lookup("GATEHOUSE_CONSENT_TIMEOUT_SECONDS") {
            self.consent.timeout_seconds =
                parse_number("GATEHOUSE_CONSENT_TIMEOUT_SECONDS", &seconds)?;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tokens.expiry_hours == 0 {
            return Err(ConfigError::Invalid("tokens.expiry_hours must be at least 1".into()));
        }
        if self.tokens.expiry_hours > MAX_EXPIRY_HOURS {
            return Err(ConfigError::Invalid(format!(
                "tokens.expiry_hours must be at most {MAX_EXPIRY_HOURS}"
            )));
        }
        if self.consent.timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "consent.timeout_seconds must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Engine settings.
    pub fn settings(&self) -> Settings {
        Settings {
            token_expiry: Duration::from_secs(self.tokens.expiry_hours.saturating_mul(3600)),
            consent_timeout: Duration::from_secs(self.consent.timeout_seconds),
            identity_scope: self.identity.scope,
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .or_else(dirs_data_dir)
            .unwrap_or_else(|| ".gatehouse".into())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("gatehouse.db")
    }

    pub fn secret_path(&self) -> PathBuf {
        self.data_dir().join(".secret")
    }
}

fn parse_number(name: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{name} must be a whole number, got '{value}'")))
}

fn dirs_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share/gatehouse"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
            .map(|p| p.join("gatehouse"))
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|h| PathBuf::from(h).join("gatehouse"))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());

        let settings = config.settings();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn parses_all_sections() {
        let config = Config::parse(
            r#"
data_dir = "/var/lib/gatehouse"
plugins_dir = "plugins"

[tokens]
expiry_hours = 2

[consent]
timeout_seconds = 15

[identity]
scope = "process"
"#,
        )
        .unwrap();

        assert_eq!(config.db_path(), PathBuf::from("/var/lib/gatehouse/gatehouse.db"));
        assert_eq!(config.plugins_dir, Some(PathBuf::from("plugins")));

        let settings = config.settings();
        assert_eq!(settings.token_expiry, Duration::from_secs(2 * 3600));
        assert_eq!(settings.consent_timeout, Duration::from_secs(15));
        assert_eq!(settings.identity_scope, IdentityScope::Process);
    }

    #[test]
    fn rejects_zero_timeout() {
        let result = Config::parse("[consent]\ntimeout_seconds = 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_unbounded_expiry() {
        let result = Config::parse("[tokens]\nexpiry_hours = 10000000000\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = Config::default().with_env(|name| {
            (name == "GATEHOUSE_TOKEN_EXPIRY_HOURS").then(|| "87601".to_string())
        });
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let config = Config::parse("[tokens]\nexpiry_hours = 87600\n").unwrap();
        assert_eq!(config.settings().token_expiry, Duration::from_secs(87_600 * 3600));
    }

    #[test]
    fn rejects_unknown_scope() {
        let result = Config::parse("[identity]\nscope = \"host\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn environment_overrides_file() {
        let env = HashMap::from([
            ("GATEHOUSE_DATA_DIR", "/tmp/gh"),
            ("GATEHOUSE_CONSENT_TIMEOUT_SECONDS", "5"),
        ]);
        let config = Config::parse("[consent]\ntimeout_seconds = 30\n")
            .unwrap()
            .with_env(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.data_dir(), PathBuf::from("/tmp/gh"));
        assert_eq!(config.consent.timeout_seconds, 5);
        assert_eq!(config.tokens.expiry_hours, 24);
    }

    #[test]
    fn rejects_malformed_environment_values() {
        let result = Config::default().with_env(|name| {
            (name == "GATEHOUSE_TOKEN_EXPIRY_HOURS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[tokens]\nexpiry_hours = 1\n").unwrap();
        assert_eq!(Config::load(&path).unwrap().tokens.expiry_hours, 1);
        assert!(matches!(
            Config::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
