//! Persistent application configuration model and defaults.

use std::path::{Path, PathBuf};

use log::{info, warn};

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// Library backend connection profile.
    pub backend: BackendConfig,
    #[serde(default)]
    /// Resolution cache location and TTLs.
    pub cache: CacheConfig,
    #[serde(default)]
    /// Similarity index persistence and retrieval knobs.
    pub index: IndexConfig,
    #[serde(default)]
    /// External metadata cleanup service.
    pub cleanup: CleanupConfig,
    #[serde(default)]
    /// Human confirmation behavior.
    pub confirmation: ConfirmationConfig,
}

/// Backend endpoint and credentials.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CacheConfig {
    /// Cache database path; empty means the per-user data directory.
    #[serde(default)]
    pub db_path: String,
    #[serde(default = "default_negative_ttl_days")]
    pub negative_ttl_days: u32,
    #[serde(default = "default_playlist_ttl_hours")]
    pub playlist_ttl_hours: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct IndexConfig {
    /// Index file path; empty means the per-user data directory.
    #[serde(default)]
    pub file_path: String,
    #[serde(default = "default_index_min_score")]
    pub min_score: f64,
    #[serde(default = "default_index_limit")]
    pub limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CleanupConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ConfirmationConfig {
    #[serde(default = "default_true")]
    pub manual_search: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            db_path: String::new(),
            negative_ttl_days: default_negative_ttl_days(),
            playlist_ttl_hours: default_playlist_ttl_hours(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            file_path: String::new(),
            min_score: default_index_min_score(),
            limit: default_index_limit(),
        }
    }
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            manual_search: default_true(),
        }
    }
}

impl Config {
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tunebridge")
            .join("config.toml")
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tunebridge")
    }

    /// Loads configuration from `path`, falling back to defaults when the
    /// file is absent or malformed.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    info!("Loaded configuration from: {}", path.display());
                    config
                }
                Err(err) => {
                    warn!(
                        "Failed to parse configuration at {}: {err}; using defaults",
                        path.display()
                    );
                    Config::default()
                }
            },
            Err(_) => {
                info!(
                    "No configuration at {}; using defaults",
                    path.display()
                );
                Config::default()
            }
        }
    }

    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn cache_db_path(&self) -> PathBuf {
        if self.cache.db_path.is_empty() {
            Self::data_dir().join("cache.db")
        } else {
            PathBuf::from(&self.cache.db_path)
        }
    }

    pub fn index_file_path(&self) -> PathBuf {
        if self.index.file_path.is_empty() {
            Self::data_dir().join("index.json")
        } else {
            PathBuf::from(&self.index.file_path)
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_negative_ttl_days() -> u32 {
    30
}

fn default_playlist_ttl_hours() -> u64 {
    168
}

fn default_index_min_score() -> f64 {
    0.35
}

fn default_index_limit() -> usize {
    25
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config: Config = toml::from_str(
            "[backend]\nendpoint = \"http://music.local\"\nusername = \"u\"\npassword = \"p\"\n",
        )
        .unwrap();
        assert_eq!(config.backend.endpoint, "http://music.local");
        assert_eq!(config.cache.negative_ttl_days, 30);
        assert_eq!(config.index.limit, 25);
        assert!(config.confirmation.manual_search);
        assert!(!config.cleanup.enabled);
    }

    #[test]
    fn test_round_trip() {
        let config = Config::default();
        let serialized = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed, config);
    }
}
