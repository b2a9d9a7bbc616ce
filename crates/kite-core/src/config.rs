//! Runtime configuration (Section 1A, ambient stack).
//!
//! Covers the handful of values the spec leaves to "runtime discretion":
//! default concurrency, where artifacts/logs live under the workspace,
//! and console verbosity. Loaded from a `key = value` line-oriented file
//! (`.kite/config`), same shape and tolerances as the rest of this stack:
//! `#[serde(default)]` fallbacks, quote-stripping, and unknown keys that
//! warn rather than fail so newer config files keep working with older
//! binaries.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Console verbosity level (Section 4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
    Debug,
}

impl Default for Verbosity {
    fn default() -> Self {
        Self::Normal
    }
}

/// Runtime configuration, resolved against a workspace root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Used as `ride.maxConcurrency ?? default_parallelism` (Section 4.6.3).
    pub default_parallelism: usize,
    /// Relative to the workspace root; default `.kite/artifacts`.
    pub artifact_root: PathBuf,
    /// Relative to the workspace root; default `.kite/logs`.
    pub log_root: PathBuf,
    pub console_verbosity: Verbosity,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_parallelism: 4,
            artifact_root: PathBuf::from(".kite/artifacts"),
            log_root: PathBuf::from(".kite/logs"),
            console_verbosity: Verbosity::Normal,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults. Missing file is
    /// not an error; callers check existence first if that distinction
    /// matters to them.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };
            let key = key.trim();
            let value = Self::unquote(value.trim());
            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "default_parallelism" => {
                self.default_parallelism = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "artifact_root" => self.artifact_root = PathBuf::from(value),
            "log_root" => self.log_root = PathBuf::from(value),
            "console_verbosity" => {
                self.console_verbosity = match value {
                    "quiet" => Verbosity::Quiet,
                    "normal" => Verbosity::Normal,
                    "verbose" => Verbosity::Verbose,
                    "debug" => Verbosity::Debug,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "console_verbosity must be one of quiet/normal/verbose/debug, got '{value}'"
                        )))
                    }
                };
            }
            _ => {
                tracing::warn!(key, "unknown config key, ignoring");
            }
        }
        Ok(())
    }

    /// Resolve `artifact_root`/`log_root` against a workspace root if
    /// they are relative paths.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        if self.artifact_root.is_relative() {
            self.artifact_root = workspace_root.join(&self.artifact_root);
        }
        if self.log_root.is_relative() {
            self.log_root = workspace_root.join(&self.log_root);
        }
    }

}

/// Parse a boolean config value, matching the rest of this stack's
/// truthy/falsy vocabulary. Kept for loader implementations that add
/// boolean keys on top of the core fields above.
pub fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" => Ok(true),
        "false" | "0" | "no" | "n" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.default_parallelism, 4);
        assert_eq!(config.artifact_root, PathBuf::from(".kite/artifacts"));
        assert_eq!(config.log_root, PathBuf::from(".kite/logs"));
        assert_eq!(config.console_verbosity, Verbosity::Normal);
    }

    #[test]
    fn parses_simple_config() {
        let mut config = Config::default();
        let content = "default_parallelism=8\nconsole_verbosity=verbose\n";
        config.parse_content(content).unwrap();
        assert_eq!(config.default_parallelism, 8);
        assert_eq!(config.console_verbosity, Verbosity::Verbose);
    }

    #[test]
    fn unquotes_values() {
        let mut config = Config::default();
        config
            .parse_content("artifact_root=\".kite/custom-artifacts\"")
            .unwrap();
        assert_eq!(
            config.artifact_root,
            PathBuf::from(".kite/custom-artifacts")
        );
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let mut config = Config::default();
        let result = config.parse_content("totally_unknown_key=1");
        assert!(result.is_ok());
    }

    #[test]
    fn invalid_verbosity_is_rejected() {
        let mut config = Config::default();
        let result = config.parse_content("console_verbosity=loud");
        assert!(result.is_err());
    }

    #[test]
    fn resolve_paths_joins_relative_roots() {
        let mut config = Config::default();
        config.resolve_paths(Path::new("/workspace"));
        assert_eq!(
            config.artifact_root,
            PathBuf::from("/workspace/.kite/artifacts")
        );
        assert_eq!(config.log_root, PathBuf::from("/workspace/.kite/logs"));
    }

    #[test]
    fn parse_bool_accepts_common_variants() {
        assert!(parse_bool("k", "true").unwrap());
        assert!(parse_bool("k", "yes").unwrap());
        assert!(!parse_bool("k", "off").unwrap());
        assert!(parse_bool("k", "nah").is_err());
    }
}
