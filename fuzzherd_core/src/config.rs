use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::budget::ResourceLimits;

pub const DEFAULT_MAX_LEN: usize = 17000;
pub const DEFAULT_TARGET: &str = "parser_parse";
pub const DEFAULT_MAX_SECONDS: u64 = 600;

/// Errors raised while loading or validating project configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Target name must not be empty")]
    EmptyName,

    #[error("Target '{0}' is configured more than once")]
    DuplicateTarget(String),

    #[error("Target '{0}' must have a max length greater than zero")]
    ZeroMaxLen(String),

    #[error("No matching fuzzers found for: {0:?}")]
    NoMatchingTargets(Vec<String>),
}

/// One fuzz target of a campaign. Identity is the name.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub name: String,
    #[serde(default = "default_max_len")]
    pub max_len: usize,
}

fn default_max_len() -> usize {
    DEFAULT_MAX_LEN
}

impl TargetConfig {
    pub fn new(name: impl Into<String>, max_len: usize) -> Self {
        Self {
            name: name.into(),
            max_len,
        }
    }
}

/// Supplies the ordered list of targets for a campaign.
pub trait TargetProvider {
    fn targets(&self) -> Result<Vec<TargetConfig>, ConfigError>;
}

/// A fixed, in-memory target list.
#[derive(Debug, Clone, Default)]
pub struct StaticTargets(pub Vec<TargetConfig>);

impl TargetProvider for StaticTargets {
    fn targets(&self) -> Result<Vec<TargetConfig>, ConfigError> {
        validate_targets(&self.0)?;
        Ok(self.0.clone())
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LogSettings {
    pub level: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzConfigFile {
    pub jobs: Option<usize>,
    pub max_seconds: Option<u64>,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

impl FuzzConfigFile {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Loads `path` if it exists, otherwise falls back to built-in defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn max_seconds(&self) -> u64 {
        self.max_seconds.unwrap_or(DEFAULT_MAX_SECONDS)
    }
}

impl TargetProvider for FuzzConfigFile {
    /// An empty `[[targets]]` list yields the single default target.
    fn targets(&self) -> Result<Vec<TargetConfig>, ConfigError> {
        if self.targets.is_empty() {
            return Ok(vec![TargetConfig::new(DEFAULT_TARGET, DEFAULT_MAX_LEN)]);
        }
        validate_targets(&self.targets)?;
        Ok(self.targets.clone())
    }
}

pub fn validate_targets(targets: &[TargetConfig]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for target in targets {
        if target.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if target.max_len == 0 {
            return Err(ConfigError::ZeroMaxLen(target.name.clone()));
        }
        if !seen.insert(target.name.as_str()) {
            return Err(ConfigError::DuplicateTarget(target.name.clone()));
        }
    }
    Ok(())
}

/// Keeps the targets named in `filter`, in configured order.
pub fn filter_targets(
    targets: Vec<TargetConfig>,
    filter: &[String],
) -> Result<Vec<TargetConfig>, ConfigError> {
    if filter.is_empty() {
        return Ok(targets);
    }
    let selected: Vec<TargetConfig> = targets
        .into_iter()
        .filter(|t| filter.iter().any(|name| name == &t.name))
        .collect();
    if selected.is_empty() {
        return Err(ConfigError::NoMatchingTargets(filter.to_vec()));
    }
    Ok(selected)
}
