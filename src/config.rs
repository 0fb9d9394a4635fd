use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config value: {message}")]
    Invalid { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub clustering: ClusteringConfig,
    pub dedup: DedupConfig,
    pub import: ImportConfig,
    pub merge: MergeConfig,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub threshold_px: f64,
    pub lat_epsilon: f64,
    pub settle_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub suspicious_window_ms: i64,
    pub suspicious_min_members: usize,
    pub hash_sample_len: usize,
    pub hash_hex_len: usize,
    /// Max mean-hash Hamming distance for the `Similar` import tier; `None` disables it.
    pub perceptual_tolerance: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub max_dimension: u32,
    pub jpeg_qualities: Vec<u8>,
    pub max_encoded_bytes: Option<usize>,
    pub skip_duplicates: bool,
    /// File extensions picked up when walking a photo directory, case-insensitive.
    pub extensions: Vec<String>,
}

impl ImportConfig {
    pub fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Local copy always wins a conflicting id.
    LocalWins,
    /// Higher `version`, then later `updated_at`, wins; ties keep local.
    NewerVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub note_coordinate_tolerance: f64,
    pub policy: MergePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clustering: ClusteringConfig::default(),
            dedup: DedupConfig::default(),
            import: ImportConfig::default(),
            merge: MergeConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            threshold_px: 40.0,
            lat_epsilon: 1e-4,
            settle_delay_ms: 150,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            suspicious_window_ms: 1000,
            suspicious_min_members: 3,
            hash_sample_len: 500,
            hash_hex_len: 32,
            perceptual_tolerance: None,
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            max_dimension: 1600,
            jpeg_qualities: vec![85, 70, 50],
            max_encoded_bytes: None,
            skip_duplicates: false,
            extensions: ["jpg", "jpeg", "png", "gif", "bmp", "tiff", "webp"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            note_coordinate_tolerance: 0.0001,
            policy: MergePolicy::LocalWins,
        }
    }
}

impl Config {
    /// `<config dir>/pinsift/config.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("pinsift").join("config.json"))
    }

    /// Load from `path`, else from the default location if present, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(default) if default.is_file() => Self::from_file(&default)?,
                _ => {
                    log::debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                message: message.to_string(),
            })
        };

        if !(self.clustering.threshold_px.is_finite() && self.clustering.threshold_px > 0.0) {
            return invalid("clustering.threshold_px must be a positive number");
        }
        if !(self.clustering.lat_epsilon.is_finite() && self.clustering.lat_epsilon >= 0.0) {
            return invalid("clustering.lat_epsilon must be a non-negative number");
        }
        if self.dedup.hash_hex_len == 0 || self.dedup.hash_hex_len > 64 {
            return invalid("dedup.hash_hex_len must be between 1 and 64");
        }
        if self.dedup.hash_sample_len == 0 {
            return invalid("dedup.hash_sample_len must be positive");
        }
        if self.dedup.suspicious_min_members < 2 {
            return invalid("dedup.suspicious_min_members must be at least 2");
        }
        if self.import.jpeg_qualities.is_empty() {
            return invalid("import.jpeg_qualities must not be empty");
        }
        if self.import.jpeg_qualities.iter().any(|&q| q == 0 || q > 100) {
            return invalid("import.jpeg_qualities entries must be within 1..=100");
        }
        if self.import.extensions.is_empty() {
            return invalid("import.extensions must not be empty");
        }
        if self.import.max_dimension == 0 {
            return invalid("import.max_dimension must be positive");
        }
        if !(self.merge.note_coordinate_tolerance.is_finite()
            && self.merge.note_coordinate_tolerance >= 0.0)
        {
            return invalid("merge.note_coordinate_tolerance must be a non-negative number");
        }
        Ok(())
    }
}
