use std::str::FromStr;

use crate::{
    error::{Error, Result},
    index_store::IndexStore,
};

pub const DEFAULT_BATCH_SIZE: usize = 200;
pub const DEFAULT_ML_VERSION: u32 = 3;
pub const DEFAULT_MAX_ERROR_COUNT: u32 = 1;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_LOCAL_BATCH_SIZE: usize = 200;
pub const DEFAULT_INDEX_PROBABILITY: f64 = 0.2;
pub const DEFAULT_EMBEDDING_MODEL: &str = "file-ml-clip-face";
pub const DEFAULT_CLUSTER_MAX_DISTANCE: f32 = 0.35;
pub const DEFAULT_MIN_CLUSTER_SIZE: usize = 2;

/// Setting keys understood by [`SyncConfig::load`], in display order.
pub const SETTING_KEYS: &[&str] = &[
    "batch_size",
    "ml_version",
    "max_error_count",
    "concurrency",
    "local_batch_size",
    "index_probability",
    "embedding_model",
    "cluster_max_distance",
    "min_cluster_size",
];

/// Immutable configuration for a sync run.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SyncConfig {
    /// Maximum number of files processed per `sync` call.
    pub batch_size: usize,
    /// Target pipeline version; files at another version are out of sync.
    pub ml_version: u32,
    /// Consecutive failures after which a file is quarantined.
    pub max_error_count: u32,
    /// Maximum number of per-file pipelines running at once.
    pub concurrency: usize,
    /// Files a local sync context may process before it is torn down.
    pub local_batch_size: usize,
    /// Chance of running the clustering pass after a full batch.
    pub index_probability: f64,
    /// Model name sent with uploaded embeddings.
    pub embedding_model: String,
    pub cluster_max_distance: f32,
    pub min_cluster_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            ml_version: DEFAULT_ML_VERSION,
            max_error_count: DEFAULT_MAX_ERROR_COUNT,
            concurrency: DEFAULT_CONCURRENCY,
            local_batch_size: DEFAULT_LOCAL_BATCH_SIZE,
            index_probability: DEFAULT_INDEX_PROBABILITY,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            cluster_max_distance: DEFAULT_CLUSTER_MAX_DISTANCE,
            min_cluster_size: DEFAULT_MIN_CLUSTER_SIZE,
        }
    }
}

impl SyncConfig {
    /// Resolve the configuration from, in order of priority:
    /// 1. `FACESYNC_<KEY>` environment variables
    /// 2. Settings persisted in the index store
    /// 3. Built-in defaults
    pub fn load(store: &IndexStore) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in store.list_settings()? {
            if SETTING_KEYS.contains(&key.as_str()) {
                config.apply(&key, &value)?;
            }
        }
        for key in SETTING_KEYS {
            let var = format!("FACESYNC_{}", key.to_ascii_uppercase());
            if let Ok(value) = std::env::var(&var) {
                config.apply(key, &value)?;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Set one field from its string form.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "batch_size" => self.batch_size = parse(key, value)?,
            "ml_version" => self.ml_version = parse(key, value)?,
            "max_error_count" => self.max_error_count = parse(key, value)?,
            "concurrency" => self.concurrency = parse(key, value)?,
            "local_batch_size" => self.local_batch_size = parse(key, value)?,
            "index_probability" => self.index_probability = parse(key, value)?,
            "embedding_model" => self.embedding_model = value.to_string(),
            "cluster_max_distance" => {
                self.cluster_max_distance = parse(key, value)?
            }
            "min_cluster_size" => self.min_cluster_size = parse(key, value)?,
            _ => {
                return Err(Error::Config(format!("unknown setting '{key}'")));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if self.ml_version == 0 {
            return Err(Error::Config(
                "ml_version 0 is reserved for unprocessed files".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.index_probability) {
            return Err(Error::Config(format!(
                "index_probability must be within [0, 1], got {}",
                self.index_probability
            )));
        }
        Ok(())
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| {
        Error::Config(format!("invalid value '{value}' for {key}: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, IndexStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = IndexStore::open(&tmp.path().join("index.redb")).unwrap();
        (tmp, store)
    }

    #[test]
    fn defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.max_error_count, 1);
    }

    #[test]
    fn stored_settings_override_defaults() {
        let (_tmp, store) = test_store();
        store.set_setting("batch_size", "25").unwrap();
        store.set_setting("embedding_model", "faces-v2").unwrap();
        store.set_setting("unrelated", "x").unwrap();

        let config = SyncConfig::load(&store).unwrap();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.embedding_model, "faces-v2");
        assert_eq!(config.ml_version, DEFAULT_ML_VERSION);
    }

    #[test]
    fn malformed_setting_is_a_config_error() {
        let (_tmp, store) = test_store();
        store.set_setting("max_error_count", "many").unwrap();

        let err = SyncConfig::load(&store).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn apply_rejects_unknown_keys() {
        let mut config = SyncConfig::default();
        assert!(config.apply("nope", "1").is_err());
        config.apply("concurrency", " 8 ").unwrap();
        assert_eq!(config.concurrency, 8);
    }

    #[test]
    fn validate_catches_bad_ranges() {
        let config = SyncConfig {
            index_probability: 1.5,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SyncConfig {
            concurrency: 0,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
