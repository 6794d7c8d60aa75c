//! Configuration settings and validation.

use crate::{Error, Result};
use std::path::PathBuf;

/// Main configuration for the Shoebox library store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for the `SQLite` database and derived artifacts.
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Active embedding model version. Staleness comparisons use this
    /// value explicitly; it is never read from global state.
    pub model_version: String,

    /// Dimension of vectors produced by the active model.
    pub embedding_dim: usize,

    /// Maximum number of embedding worker threads.
    pub embedding_threads: usize,

    /// Default number of results returned by similarity search.
    pub search_top_k: usize,

    /// Default minimum cosine score for a similarity hit.
    pub search_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            model_version: "clip-vit-b32-v1".to_string(),
            embedding_dim: 512,
            embedding_threads: std::thread::available_parallelism()
                .map(|n| n.get().min(4))
                .unwrap_or(4),
            search_top_k: 20,
            search_threshold: 0.2,
        }
    }
}

impl Config {
    /// Create a new configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(Error::config(format!(
                "invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.model_version.is_empty() {
            return Err(Error::config("model_version cannot be empty"));
        }

        if self.embedding_dim == 0 {
            return Err(Error::config("embedding_dim cannot be 0"));
        }

        if self.embedding_threads == 0 {
            return Err(Error::config("embedding_threads cannot be 0"));
        }

        if self.embedding_threads > 32 {
            return Err(Error::config(
                "embedding_threads cannot exceed 32 (hardware limit)",
            ));
        }

        if !(-1.0..=1.0).contains(&self.search_threshold) {
            return Err(Error::config(
                "search_threshold must be within [-1.0, 1.0]",
            ));
        }

        Ok(())
    }

    /// Get the path to the `SQLite` database file.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("shoebox.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.embedding_dim, 512);
        assert_eq!(config.search_top_k, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_new() {
        let config = Config::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let config = Config {
            log_level: "invalid".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log level"));
    }

    #[test]
    fn test_validate_empty_model_version() {
        let config = Config {
            model_version: String::new(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("model_version"));
    }

    #[test]
    fn test_validate_zero_embedding_dim() {
        let config = Config {
            embedding_dim: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("embedding_dim"));
    }

    #[test]
    fn test_validate_invalid_embedding_threads_zero() {
        let config = Config {
            embedding_threads: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("embedding_threads"));
    }

    #[test]
    fn test_validate_invalid_embedding_threads_too_high() {
        let config = Config {
            embedding_threads: 100,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("32"));
    }

    #[test]
    fn test_validate_threshold_out_of_range() {
        let config = Config {
            search_threshold: 1.5,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("search_threshold"));
    }

    #[test]
    fn test_database_path() {
        let config = Config {
            data_dir: PathBuf::from("/var/lib/shoebox"),
            ..Default::default()
        };
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/shoebox/shoebox.db")
        );
    }
}
