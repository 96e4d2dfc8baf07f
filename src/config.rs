//! Pipeline configuration

use crate::types::{ChipletError, ChipletResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings shared by every pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root of all generated outputs (tables, stores, statistics)
    pub base_output_dir: PathBuf,
    /// Worker pool size for per-year builds
    pub cores: usize,
    /// Also make completed outputs read-only
    pub protect: bool,
    /// Draw progress bars while workers run
    pub show_progress: bool,
    /// Side length of an unpadded chiplet in pixels
    pub base_size_pix: usize,
    /// Number of random partitions in the chiplet table
    pub n_subsets: u32,
    /// Decoded source tiles kept in memory per packet
    pub tile_cache_size: usize,
    /// Latest year included in summary statistics
    pub stats_last_year: Option<i32>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_output_dir: default_base_output_dir(),
            cores: 4,
            protect: true,
            show_progress: true,
            base_size_pix: 160,
            n_subsets: 5,
            tile_cache_size: 4,
            stats_last_year: Some(2018),
        }
    }
}

fn default_base_output_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ecofuture")
}

impl PipelineConfig {
    /// Default configuration rooted at `base_output_dir`
    pub fn with_base_dir<P: AsRef<Path>>(base_output_dir: P) -> Self {
        Self {
            base_output_dir: base_output_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("ECOFUTURE_BASE_OUTPUT_DIR") {
            config.base_output_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("ECOFUTURE_CORES") {
            if let Ok(cores) = val.parse() {
                config.cores = cores;
            }
        }

        if let Ok(val) = std::env::var("ECOFUTURE_PROTECT") {
            config.protect = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("ECOFUTURE_SHOW_PROGRESS") {
            config.show_progress = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("ECOFUTURE_BASE_SIZE_PIX") {
            if let Ok(size) = val.parse() {
                config.base_size_pix = size;
            }
        }

        config
    }

    /// Load configuration from a JSON file; missing keys take defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ChipletResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ChipletResult<()> {
        if self.cores == 0 {
            return Err(ChipletError::InvalidFormat("cores must be at least 1".to_string()));
        }
        if self.base_size_pix == 0 {
            return Err(ChipletError::InvalidFormat(
                "base_size_pix must be positive".to_string(),
            ));
        }
        if self.n_subsets == 0 {
            return Err(ChipletError::InvalidFormat(
                "n_subsets must be at least 1".to_string(),
            ));
        }
        if self.tile_cache_size == 0 {
            return Err(ChipletError::InvalidFormat(
                "tile_cache_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_flag(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.base_size_pix, 160);
        assert_eq!(config.n_subsets, 5);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"cores": 8, "base_output_dir": "/tmp/eco"}"#).unwrap();

        let config = PipelineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.cores, 8);
        assert_eq!(config.base_output_dir, PathBuf::from("/tmp/eco"));
        assert_eq!(config.base_size_pix, 160);
    }

    #[test]
    fn test_zero_cores_rejected() {
        let config = PipelineConfig {
            cores: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_flag_parsing() {
        assert!(parse_flag("TRUE"));
        assert!(parse_flag("1"));
        assert!(!parse_flag("no"));
    }
}
