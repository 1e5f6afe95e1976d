//! JSON configuration file loading.
//!
//! Recognized keys and defaults follow the deployed config format: a
//! required non-empty `streams` array plus optional `http_port`,
//! `autostart`, `display_mode`, `pre_buffering_time`, `post_buffering_time`
//! and `rec_base_folder`. Out-of-range values fall back to their defaults
//! with a logged warning; a missing or empty `streams` array is fatal.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadFailed(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    ParseFailed(#[from] serde_json::Error),
    #[error("'streams' array missing or empty in config")]
    NoStreams,
    #[error("Cannot create recording folder '{folder}': {source}")]
    BadRecFolder {
        folder: String,
        source: std::io::Error,
    },
}

/// One camera: an opaque id and its RTSP url.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StreamConfig {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub streams: Vec<StreamConfig>,

    #[serde(default = "default_http_port")]
    pub http_port: i64,

    #[serde(default)]
    pub autostart: i64,

    #[serde(default)]
    pub display_mode: i64,

    #[serde(default = "default_pre_buffering")]
    pub pre_buffering_time: f64,

    #[serde(default = "default_post_buffering")]
    pub post_buffering_time: f64,

    #[serde(default = "default_rec_base_folder")]
    pub rec_base_folder: String,
}

fn default_http_port() -> i64 {
    8090
}

fn default_pre_buffering() -> f64 {
    5.0
}

fn default_post_buffering() -> f64 {
    0.5
}

fn default_rec_base_folder() -> String {
    "./".to_string()
}

impl AppConfig {
    /// Load, validate and normalize a config file. Creates the recording
    /// base folder when it does not exist yet.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let mut config: AppConfig = serde_json::from_str(&data)?;

        config.streams.retain(|s| {
            let ok = !s.id.is_empty() && !s.url.is_empty();
            if !ok {
                log::warn!("skipping stream entry with empty id or url");
            }
            ok
        });
        if config.streams.is_empty() {
            return Err(ConfigError::NoStreams);
        }

        if !(1..=65535).contains(&config.http_port) {
            log::warn!("http_port out of range, using default 8090");
            config.http_port = default_http_port();
        }
        if !(0..=1).contains(&config.autostart) {
            log::warn!("autostart must be 0 or 1, using 0");
            config.autostart = 0;
        }
        if !(0..=1).contains(&config.display_mode) {
            log::warn!("display_mode must be 0 or 1, using 0");
            config.display_mode = 0;
        }
        if config.pre_buffering_time < 0.0 {
            log::warn!("pre_buffering_time must not be negative, using 0");
            config.pre_buffering_time = 0.0;
        }
        if config.post_buffering_time < 0.0 {
            log::warn!("post_buffering_time must not be negative, using 0");
            config.post_buffering_time = 0.0;
        }

        let folder = PathBuf::from(&config.rec_base_folder);
        if !folder.exists() {
            std::fs::create_dir_all(&folder).map_err(|source| ConfigError::BadRecFolder {
                folder: config.rec_base_folder.clone(),
                source,
            })?;
            log::info!("created recording folder {}", folder.display());
        }

        Ok(config)
    }

    pub fn rec_base(&self) -> PathBuf {
        PathBuf::from(&self.rec_base_folder)
    }
}
