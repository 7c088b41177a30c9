//! Configuration loading for graphweld.
//!
//! Settings come from a TOML file (default `config.toml`, overridable via the
//! `GRAPHWELD_CONFIG` env var) with serde defaults for every field, so an
//! empty file is a valid configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GraphweldError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub conflict: ConflictConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path of the SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Default log filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Composite similarity at or above which candidates merge
    #[serde(default = "default_merge_threshold")]
    pub merge_threshold: f64,
    /// Lower bound of the ambiguous band (tentative attachment)
    #[serde(default = "default_ambiguous_low")]
    pub ambiguous_low: f64,
    /// Leading characters of the normalized value used in blocking keys
    #[serde(default = "default_blocking_prefix_len")]
    pub blocking_prefix_len: usize,
    /// Cap on candidates scored per block before falling back to best-so-far
    #[serde(default = "default_max_block_candidates")]
    pub max_block_candidates: usize,
    /// Weight of name similarity in the composite score
    #[serde(default = "default_value_weight")]
    pub value_weight: f64,
    /// Weight of attribute overlap in the composite score
    #[serde(default = "default_attribute_weight")]
    pub attribute_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// Confidence lead required for one value to win outright
    #[serde(default = "default_confidence_margin")]
    pub confidence_margin: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Number of (revision, measure) centrality results kept in memory
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("graphweld.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_merge_threshold() -> f64 {
    0.88
}

fn default_ambiguous_low() -> f64 {
    0.75
}

fn default_blocking_prefix_len() -> usize {
    4
}

fn default_max_block_candidates() -> usize {
    64
}

fn default_value_weight() -> f64 {
    0.8
}

fn default_attribute_weight() -> f64 {
    0.2
}

fn default_confidence_margin() -> f64 {
    0.15
}

fn default_cache_capacity() -> usize {
    32
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            merge_threshold: default_merge_threshold(),
            ambiguous_low: default_ambiguous_low(),
            blocking_prefix_len: default_blocking_prefix_len(),
            max_block_candidates: default_max_block_candidates(),
            value_weight: default_value_weight(),
            attribute_weight: default_attribute_weight(),
        }
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            confidence_margin: default_confidence_margin(),
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            resolver: ResolverConfig::default(),
            conflict: ConflictConfig::default(),
            analyzer: AnalyzerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration: `.env`, then `GRAPHWELD_CONFIG` (or `config.toml`),
    /// falling back to defaults if the file does not exist.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let config_path =
            std::env::var("GRAPHWELD_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let config = if Path::new(&config_path).exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            toml::from_str(&contents)
                .map_err(|e| GraphweldError::Config(format!("{}: {}", config_path, e)))?
        } else {
            log::warn!("config file {} not found, using defaults", config_path);
            Config::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, used by binaries with a `--config` flag.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| GraphweldError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.resolver;
        for (name, v) in [
            ("resolver.merge_threshold", r.merge_threshold),
            ("resolver.ambiguous_low", r.ambiguous_low),
            ("resolver.value_weight", r.value_weight),
            ("resolver.attribute_weight", r.attribute_weight),
            ("conflict.confidence_margin", self.conflict.confidence_margin),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(GraphweldError::Config(format!(
                    "{} must be in [0, 1], got {}",
                    name, v
                )));
            }
        }
        if r.ambiguous_low >= r.merge_threshold {
            return Err(GraphweldError::Config(format!(
                "resolver.ambiguous_low ({}) must be below resolver.merge_threshold ({})",
                r.ambiguous_low, r.merge_threshold
            )));
        }
        if (r.value_weight + r.attribute_weight - 1.0).abs() > 1e-9 {
            return Err(GraphweldError::Config(format!(
                "resolver weights must sum to 1.0, got {}",
                r.value_weight + r.attribute_weight
            )));
        }
        if r.blocking_prefix_len == 0 {
            return Err(GraphweldError::Config(
                "resolver.blocking_prefix_len must be at least 1".to_string(),
            ));
        }
        if r.max_block_candidates == 0 {
            return Err(GraphweldError::Config(
                "resolver.max_block_candidates must be at least 1".to_string(),
            ));
        }
        if self.analyzer.cache_capacity == 0 {
            return Err(GraphweldError::Config(
                "analyzer.cache_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.resolver.merge_threshold, 0.88);
        assert_eq!(config.resolver.ambiguous_low, 0.75);
        assert_eq!(config.conflict.confidence_margin, 0.15);
        assert_eq!(config.analyzer.cache_capacity, 32);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config: Config = toml::from_str(
            r#"
            [resolver]
            merge_threshold = 0.9

            [engine]
            db_path = "/tmp/kg.db"
            "#,
        )
        .unwrap();
        assert_eq!(config.resolver.merge_threshold, 0.9);
        assert_eq!(config.engine.db_path, PathBuf::from("/tmp/kg.db"));
        // untouched sections keep defaults
        assert_eq!(config.resolver.blocking_prefix_len, 4);
    }

    #[test]
    fn test_validate_rejects_inverted_band() {
        let mut config = Config::default();
        config.resolver.ambiguous_low = 0.95;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_weights() {
        let mut config = Config::default();
        config.resolver.value_weight = 0.9;
        config.resolver.attribute_weight = 0.3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[conflict]\nconfidence_margin = 0.2").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.conflict.confidence_margin, 0.2);
    }
}
