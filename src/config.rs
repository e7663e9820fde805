//! Configuration management for Reel Ingest

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::upload::{
    DirectUploadConfig, CLASSIFY_LIMIT, MAX_CHUNK_SIZE, MAX_FILE_SIZE, RETENTION_HOURS,
    SWEEP_INTERVAL_SECS,
};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    pub sweeper: SweeperConfig,
    pub processing: ProcessingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root for in-progress chunked uploads (swept)
    pub chunk_dir: PathBuf,
    /// Root for completed artifacts (never swept)
    pub artifact_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    pub max_file_size: u64,
    pub max_chunk_size: usize,
    pub classify_limit: usize,
    pub file_field: String,
    pub allowed_mime_types: Vec<String>,
    pub allowed_extensions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    pub retention_hours: u64,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessingConfig {
    /// Jobs are POSTed here when set, otherwise only logged
    pub webhook_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let direct = DirectUploadConfig::default();
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            storage: StorageConfig {
                chunk_dir: PathBuf::from("./data/chunks"),
                artifact_dir: PathBuf::from("./data/artifacts"),
            },
            upload: UploadConfig {
                max_file_size: MAX_FILE_SIZE,
                max_chunk_size: MAX_CHUNK_SIZE,
                classify_limit: CLASSIFY_LIMIT,
                file_field: direct.field_name,
                allowed_mime_types: direct.allowed_mime_types,
                allowed_extensions: direct.allowed_extensions,
            },
            sweeper: SweeperConfig {
                retention_hours: RETENTION_HOURS,
                interval_secs: SWEEP_INTERVAL_SECS,
            },
            processing: ProcessingConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| defaults.server.host.clone()),
                port: parsed("SERVER_PORT", defaults.server.port)?,
            },
            storage: StorageConfig {
                chunk_dir: env::var("UPLOAD_CHUNK_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.chunk_dir),
                artifact_dir: env::var("UPLOAD_ARTIFACT_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.artifact_dir),
            },
            upload: UploadConfig {
                max_file_size: parsed("UPLOAD_MAX_FILE_SIZE", defaults.upload.max_file_size)?,
                max_chunk_size: parsed("UPLOAD_MAX_CHUNK_SIZE", defaults.upload.max_chunk_size)?,
                classify_limit: parsed("UPLOAD_CLASSIFY_LIMIT", defaults.upload.classify_limit)?,
                file_field: env::var("UPLOAD_FILE_FIELD").unwrap_or(defaults.upload.file_field),
                allowed_mime_types: list("UPLOAD_ALLOWED_MIME_TYPES")
                    .unwrap_or(defaults.upload.allowed_mime_types),
                allowed_extensions: list("UPLOAD_ALLOWED_EXTENSIONS")
                    .map(|exts| {
                        exts.into_iter()
                            .map(|e| e.trim_start_matches('.').to_string())
                            .collect()
                    })
                    .unwrap_or(defaults.upload.allowed_extensions),
            },
            sweeper: SweeperConfig {
                retention_hours: parsed("UPLOAD_RETENTION_HOURS", defaults.sweeper.retention_hours)?,
                interval_secs: parsed("UPLOAD_SWEEP_INTERVAL_SECS", defaults.sweeper.interval_secs)?,
            },
            processing: ProcessingConfig {
                webhook_url: env::var("PROCESSING_WEBHOOK_URL")
                    .ok()
                    .filter(|url| !url.trim().is_empty()),
            },
        })
    }

    /// Acceptance rules for the direct receiver
    pub fn direct_upload(&self) -> DirectUploadConfig {
        DirectUploadConfig {
            max_file_size: self.upload.max_file_size,
            allowed_mime_types: self.upload.allowed_mime_types.clone(),
            allowed_extensions: self.upload.allowed_extensions.clone(),
            field_name: self.upload.file_field.clone(),
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.sweeper.retention_hours * 60 * 60)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweeper.interval_secs.max(1))
    }
}

fn parsed<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}

/// Comma-separated, lower-cased, empty entries dropped
fn list(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect();
    (!items.is_empty()).then_some(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_upload_constants() {
        let config = Config::default();
        assert_eq!(config.upload.max_chunk_size, MAX_CHUNK_SIZE);
        assert_eq!(config.retention(), Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.sweep_interval(), Duration::from_secs(6 * 60 * 60));
        assert_ne!(config.storage.chunk_dir, config.storage.artifact_dir);
    }

    #[test]
    fn test_direct_upload_rules_follow_config() {
        let mut config = Config::default();
        config.upload.file_field = "file".to_string();
        config.upload.max_file_size = 1024;

        let direct = config.direct_upload();
        assert_eq!(direct.field_name, "file");
        assert_eq!(direct.max_file_size, 1024);
        assert!(direct.allowed_extensions.contains(&"mp4".to_string()));
    }
}
