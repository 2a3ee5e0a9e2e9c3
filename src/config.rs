use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::document::filters::DocumentFilter;
use crate::error::{DedupError, Result};

/// Fingerprinting and similarity parameters. Every worker sharing an index
/// must use identical values, otherwise band keys stop matching.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DedupConfig {
    /// Shingle width in characters.
    pub char_ngram: usize,
    /// Length of the MinHash signature.
    pub num_seeds: usize,
    /// Number of LSH bands; must divide `num_seeds`.
    pub num_bands: usize,
    /// Bytes kept from each MinHash value (4 or 8).
    pub hash_width: usize,
    /// Seed material for the MinHash permutations.
    pub seed: u64,
    /// Jaccard similarity above which two documents are duplicates.
    pub jaccard_threshold: f64,
    /// Per-class thresholds for sources that legitimately share boilerplate.
    pub tolerance_classes: Vec<ToleranceClass>,
    /// Filters applied before fingerprinting.
    pub filters: Vec<DocumentFilter>,
}

/// A content class selected by URL substring, e.g. encyclopedic mirrors.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ToleranceClass {
    pub name: String,
    pub patterns: Vec<String>,
    pub threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            char_ngram: 5,
            num_seeds: 50,
            num_bands: 5,
            hash_width: 4,
            seed: 8787,
            jaccard_threshold: 0.5,
            tolerance_classes: vec![ToleranceClass {
                name: "encyclopedic".to_string(),
                patterns: vec!["baike".to_string(), "wiki".to_string()],
                threshold: 0.8,
            }],
            filters: Vec::new(),
        }
    }
}

impl DedupConfig {
    pub fn rows_per_band(&self) -> usize {
        self.num_seeds / self.num_bands
    }

    pub fn validate(&self) -> Result<()> {
        if self.char_ngram == 0 {
            return Err(DedupError::Config("char_ngram must be >= 1".into()));
        }
        if self.num_seeds == 0 || self.num_bands == 0 {
            return Err(DedupError::Config(
                "num_seeds and num_bands must be >= 1".into(),
            ));
        }
        if self.num_seeds % self.num_bands != 0 {
            return Err(DedupError::Config(format!(
                "num_seeds has to be a multiple of num_bands: {} % {} != 0",
                self.num_seeds, self.num_bands
            )));
        }
        if !matches!(self.hash_width, 4 | 8) {
            return Err(DedupError::Config(format!(
                "hash_width must be 4 or 8 bytes, got {}",
                self.hash_width
            )));
        }
        check_threshold("jaccard_threshold", self.jaccard_threshold)?;
        for class in &self.tolerance_classes {
            check_threshold(&class.name, class.threshold)?;
            if class.patterns.iter().any(|p| p.is_empty()) {
                return Err(DedupError::Config(format!(
                    "tolerance class '{}' has an empty pattern",
                    class.name
                )));
            }
        }
        Ok(())
    }
}

fn check_threshold(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(DedupError::Config(format!(
            "threshold '{}' must lie in [0, 1], got {}",
            name, value
        )))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub name: String,
    /// Threads used for signature and Jaccard computation; 0 means one per CPU.
    pub signature_workers: usize,
    /// Threads issuing cross-batch index lookups.
    pub lookup_workers: usize,
    pub retries: u32,
    pub retry_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            signature_workers: 0,
            lookup_workers: 8,
            retries: 3,
            retry_interval_ms: 5000,
        }
    }
}

impl WorkerConfig {
    pub fn signature_threads(&self) -> usize {
        if self.signature_workers == 0 {
            num_cpus::get()
        } else {
            self.signature_workers
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DedupError::Config("worker name must not be empty".into()));
        }
        if self.lookup_workers == 0 {
            return Err(DedupError::Config("lookup_workers must be >= 1".into()));
        }
        Ok(())
    }
}

/// Directory roots. Batch uris are paths relative to `input_root`, and the
/// same relative path is used under each output root.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    pub input_root: PathBuf,
    pub unique_root: PathBuf,
    pub duplicate_root: PathBuf,
    pub processed_root: PathBuf,
}

impl PathsConfig {
    pub fn under(root: &Path) -> Self {
        Self {
            input_root: root.join("input"),
            unique_root: root.join("unique"),
            duplicate_root: root.join("duplicate"),
            processed_root: root.join("processed"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case", deny_unknown_fields)]
pub enum StoreConfig {
    Sqlite {
        path: PathBuf,
    },
    Postgres {
        url: String,
        #[serde(default = "default_pool_size")]
        pool_size: u32,
    },
}

fn default_pool_size() -> u32 {
    16
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    pub paths: PathsConfig,
    pub store: StoreConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DedupError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(content).map_err(|e| DedupError::Config(e.to_string()))?;
        config.dedup.validate()?;
        config.worker.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [paths]
        input_root = "in"
        unique_root = "uni"
        duplicate_root = "dup"
        processed_root = "done"

        [store]
        backend = "sqlite"
        path = "dedup.sqlite3"
    "#;

    #[test]
    fn defaults_are_valid() {
        DedupConfig::default().validate().unwrap();
        WorkerConfig::default().validate().unwrap();
    }

    #[test]
    fn loads_minimal_file_with_defaults() {
        let config = AppConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.dedup.num_seeds, 50);
        assert_eq!(config.dedup.rows_per_band(), 10);
        assert_eq!(config.paths.unique_root, PathBuf::from("uni"));
        assert!(matches!(config.store, StoreConfig::Sqlite { .. }));
    }

    #[test]
    fn rejects_seeds_not_divisible_by_bands() {
        let config = DedupConfig {
            num_seeds: 50,
            num_bands: 4,
            ..DedupConfig::default()
        };
        assert!(matches!(config.validate(), Err(DedupError::Config(_))));

        let text = format!("{}\n[dedup]\nnum_seeds = 21\nnum_bands = 4\n", MINIMAL);
        assert!(matches!(
            AppConfig::from_toml(&text),
            Err(DedupError::Config(_))
        ));
    }

    #[test]
    fn rejects_unknown_filter_kind() {
        let text = format!(
            "{}\n[[dedup.filters]]\nkind = \"eval\"\nexpr = \"len(x) > 3\"\n",
            MINIMAL
        );
        assert!(matches!(
            AppConfig::from_toml(&text),
            Err(DedupError::Config(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let config = DedupConfig {
            jaccard_threshold: 1.5,
            ..DedupConfig::default()
        };
        assert!(config.validate().is_err());

        let config = DedupConfig {
            hash_width: 3,
            ..DedupConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_postgres_store_and_classes() {
        let text = r#"
            [dedup]
            jaccard_threshold = 0.6
            [[dedup.tolerance_classes]]
            name = "mirror"
            patterns = ["mirror."]
            threshold = 0.9

            [paths]
            input_root = "in"
            unique_root = "uni"
            duplicate_root = "dup"
            processed_root = "done"

            [store]
            backend = "postgres"
            url = "postgres://dedup@localhost/crawl"
        "#;
        let config = AppConfig::from_toml(text).unwrap();
        assert_eq!(config.dedup.tolerance_classes.len(), 1);
        assert_eq!(config.dedup.tolerance_classes[0].threshold, 0.9);
        match config.store {
            StoreConfig::Postgres { pool_size, .. } => assert_eq!(pool_size, 16),
            other => panic!("unexpected store {:?}", other),
        }
    }
}
