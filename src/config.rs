//! Optional TOML configuration, applying defaults under CLI values.
//!
//! An explicitly named file must exist and parse; the default
//! `loadherd.toml` is silently skipped when absent.

use std::path::Path;

use serde::Deserialize;

use crate::error::{AppError, AppResult, ConfigError};

pub const DEFAULT_CONFIG_FILE: &str = "loadherd.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub client: ClientSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerSection {
    pub frontend: Option<String>,
    pub backend: Option<String>,
    pub heartbeat: Option<String>,
    pub agent_timeout: Option<u64>,
    pub evict_stale: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSection {
    pub backend: Option<String>,
    pub heartbeat: Option<String>,
    pub frontend: Option<String>,
    pub runner: Option<String>,
    pub max_age: Option<i64>,
    pub max_age_delta: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientSection {
    pub timeout_ms: Option<u64>,
    pub timeout_max_overflow_ms: Option<u64>,
    pub timeout_overflows: Option<u32>,
}

/// # Errors
///
/// Returns an error when an explicitly named file cannot be read or parsed.
pub fn load(path: Option<&str>) -> AppResult<FileConfig> {
    let (path, required) = match path {
        Some(path) => (path, true),
        None => (DEFAULT_CONFIG_FILE, false),
    };
    if !required && !Path::new(path).exists() {
        return Ok(FileConfig::default());
    }
    let raw = std::fs::read_to_string(path).map_err(|err| {
        AppError::config(ConfigError::Read {
            path: path.to_owned(),
            source: err,
        })
    })?;
    toml::from_str(&raw).map_err(|err| {
        AppError::config(ConfigError::Parse {
            path: path.to_owned(),
            source: err,
        })
    })
}
