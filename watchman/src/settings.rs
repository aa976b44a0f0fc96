//! YAML configuration: schema, defaults, validation.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter;

const CONFIG_DIR_ENV: &str = "CONF_DIR";
const CONFIG_FILENAME: &str = "watchman.yml";

const DEFAULT_BUFFER_KB: usize = 64;
const DEFAULT_FD_SIZE: u64 = 4096;
const DEFAULT_FD_TTL: u64 = 300;
const DEFAULT_FP_SIZE: u64 = 5000;
const DEFAULT_FP_TTL: u64 = 5;

const MIN_BUFFER_KB: usize = 4;
const MAX_BUFFER_KB: usize = 1024;
const MIN_CACHE_SIZE: u64 = 1;
const MIN_CACHE_TTL_SECS: u64 = 1;
const MAX_CACHE_TTL_SECS: u64 = 86400;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("read config: {0}")]
    Io(#[from] io::Error),
    #[error("parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("watchman.watcher.paths cannot be empty")]
    NoPaths,
    #[error("watchman.watcher.paths contains empty path")]
    EmptyPath,
    #[error("watchman.watcher.paths must be absolute: {0}")]
    RelativePath(String),
    #[error("watchman.watcher.paths duplicate path: {0}")]
    DuplicatePath(String),
    #[error(
        "watchman.watcher.buffer-size-kb must be between {min} and {max}, got {0}",
        min = MIN_BUFFER_KB,
        max = MAX_BUFFER_KB
    )]
    BufferSize(usize),
    #[error("watchman.cache.{0} must be >= {min}", min = MIN_CACHE_SIZE)]
    CacheSize(&'static str),
    #[error(
        "watchman.cache.{0} must be between {min} and {max} seconds",
        min = MIN_CACHE_TTL_SECS,
        max = MAX_CACHE_TTL_SECS
    )]
    CacheTtl(&'static str),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub watchman: WatchmanConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchmanConfig {
    #[serde(rename = "plugin-root")]
    pub plugin_root: PathBuf,
    pub watcher: WatcherConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub paths: Vec<String>,
    #[serde(rename = "buffer-size-kb")]
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(rename = "fd-size")]
    pub fd_size: u64,
    #[serde(rename = "fd-ttl")]
    pub fd_ttl: u64,
    #[serde(rename = "fp-size")]
    pub fp_size: u64,
    #[serde(rename = "fp-ttl")]
    pub fp_ttl: u64,
}

impl Settings {
    /// Loads, fills defaults, normalizes watched paths and validates.
    /// `path` overrides the `CONF_DIR` lookup.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let data = fs::read_to_string(config_path(path))?;
        let mut settings: Settings = serde_yaml::from_str(&data)?;
        settings.apply_defaults();
        settings.normalize_paths();
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: Option<&Path>) -> Result<(), SettingsError> {
        let data = serde_yaml::to_string(self)?;
        fs::write(config_path(path), data)?;
        Ok(())
    }

    fn apply_defaults(&mut self) {
        let c = &mut self.watchman;
        if c.watcher.buffer_size == 0 {
            c.watcher.buffer_size = DEFAULT_BUFFER_KB;
        }
        if c.cache.fd_size == 0 {
            c.cache.fd_size = DEFAULT_FD_SIZE;
        }
        if c.cache.fd_ttl == 0 {
            c.cache.fd_ttl = DEFAULT_FD_TTL;
        }
        if c.cache.fp_size == 0 {
            c.cache.fp_size = DEFAULT_FP_SIZE;
        }
        if c.cache.fp_ttl == 0 {
            c.cache.fp_ttl = DEFAULT_FP_TTL;
        }
    }

    // Cleaned, no trailing slash, so the prefix tree sees one spelling per
    // directory.
    fn normalize_paths(&mut self) {
        for path in &mut self.watchman.watcher.paths {
            if path.starts_with('/') {
                *path = filter::normalize(path);
            }
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let c = &self.watchman;
        if c.watcher.paths.is_empty() {
            return Err(SettingsError::NoPaths);
        }
        let mut seen = std::collections::HashSet::new();
        for path in &c.watcher.paths {
            if path.is_empty() {
                return Err(SettingsError::EmptyPath);
            }
            if !path.starts_with('/') {
                return Err(SettingsError::RelativePath(path.clone()));
            }
            if !seen.insert(path) {
                return Err(SettingsError::DuplicatePath(path.clone()));
            }
        }
        if !(MIN_BUFFER_KB..=MAX_BUFFER_KB).contains(&c.watcher.buffer_size) {
            return Err(SettingsError::BufferSize(c.watcher.buffer_size));
        }
        if c.cache.fd_size < MIN_CACHE_SIZE {
            return Err(SettingsError::CacheSize("fd-size"));
        }
        if !(MIN_CACHE_TTL_SECS..=MAX_CACHE_TTL_SECS).contains(&c.cache.fd_ttl) {
            return Err(SettingsError::CacheTtl("fd-ttl"));
        }
        if c.cache.fp_size < MIN_CACHE_SIZE {
            return Err(SettingsError::CacheSize("fp-size"));
        }
        if !(MIN_CACHE_TTL_SECS..=MAX_CACHE_TTL_SECS).contains(&c.cache.fp_ttl) {
            return Err(SettingsError::CacheTtl("fp-ttl"));
        }
        Ok(())
    }
}

fn config_path(path: Option<&Path>) -> PathBuf {
    if let Some(path) = path {
        return path.to_path_buf();
    }
    match env::var(CONFIG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => Path::new(&dir).join(CONFIG_FILENAME),
        _ => PathBuf::from(CONFIG_FILENAME),
    }
}
