use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use super::index::ENTRY_WIDTH;
use crate::common::{Error, Result};

/// Prefix of environment variables overriding file settings,
/// e.g. `HOMELOG_SEGMENT__MAX_STORE_BYTES=4096`.
const ENV_PREFIX: &str = "HOMELOG";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Store size (in bytes) at which a segment stops taking appends.
    pub max_store_bytes: u64,
    /// Index capacity (in bytes). The index file is pre-allocated to this size.
    pub max_index_bytes: u64,
    /// First offset of a log created in an empty directory.
    pub initial_offset: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_store_bytes: 1024,
            max_index_bytes: 1024,
            initial_offset: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub segment: SegmentConfig,
}

impl Config {
    /// Loads defaults, then the config file if one is given, then
    /// `HOMELOG_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.segment.max_store_bytes == 0 {
            return Err(Error::Config(
                "segment.max_store_bytes must be greater than 0".to_string(),
            ));
        }
        if self.segment.max_index_bytes < ENTRY_WIDTH {
            return Err(Error::Config(format!(
                "segment.max_index_bytes must hold at least one entry ({} bytes), got {}",
                ENTRY_WIDTH, self.segment.max_index_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.segment.initial_offset, 0);
    }

    #[test]
    fn test_validate_rejects_tiny_index() {
        let mut config = Config::default();
        config.segment.max_index_bytes = ENTRY_WIDTH - 1;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.segment.max_store_bytes = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("homelog.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[segment]").unwrap();
        writeln!(file, "max_store_bytes = 4096").unwrap();
        writeln!(file, "initial_offset = 16").unwrap();
        drop(file);

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.segment.max_store_bytes, 4096);
        assert_eq!(config.segment.initial_offset, 16);
    }

    #[test]
    fn test_load_env_without_file() {
        // Only this test touches the environment.
        std::env::set_var("HOMELOG_SEGMENT__MAX_INDEX_BYTES", "2400");
        let loaded = Config::load(None);
        std::env::remove_var("HOMELOG_SEGMENT__MAX_INDEX_BYTES");

        let config = loaded.unwrap();
        assert_eq!(config.segment.max_index_bytes, 2400);
        // Unset keys fall back to defaults.
        assert_eq!(config.segment.max_store_bytes, 1024);
        assert_eq!(config.segment.initial_offset, 0);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
