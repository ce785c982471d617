//! Map parameters
//!
//! Node bytes record the page size limit and key width but not the search
//! key function, so whoever stores a root key also has to keep the
//! parameters it was built with. The CLI keeps them next to the store file.

use crate::trie::{SearchKeyFunc, DEFAULT_PAGE_CACHE_BYTES};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default page size limit for new maps
pub const DEFAULT_MAXIMUM_SIZE: usize = 4096;

/// Parameters of a map, stored alongside the store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Serialized size a leaf may reach before it splits; 0 for no limit
    pub maximum_size: usize,
    /// Number of elements in every key
    pub key_width: usize,
    /// Registry name of the search key function
    pub search_key: SearchKeyFunc,
    /// Byte budget of the page cache
    pub page_cache_bytes: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            maximum_size: DEFAULT_MAXIMUM_SIZE,
            key_width: 1,
            search_key: SearchKeyFunc::Plain,
            page_cache_bytes: DEFAULT_PAGE_CACHE_BYTES,
        }
    }
}

impl MapConfig {
    pub fn validate(&self) -> Result<()> {
        if self.key_width == 0 {
            return Err(Error::Config("key_width must be at least 1".into()));
        }
        Ok(())
    }

    /// Load the config for a store, or the defaults if there is none
    pub fn load(store_path: &Path) -> Result<Self> {
        let config_path = Self::config_path(store_path);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: MapConfig = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse {}: {}", config_path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save the config next to a store
    pub fn save(&self, store_path: &Path) -> Result<()> {
        self.validate()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::config_path(store_path), content)?;
        Ok(())
    }

    /// `<store file name>.json` in the store's directory
    pub fn config_path(store_path: &Path) -> PathBuf {
        let file_name = store_path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "chkmap".to_string());
        store_path.with_file_name(format!("{}.json", file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = MapConfig::load(&dir.path().join("maps.chk")).unwrap();
        assert_eq!(config, MapConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("maps.chk");
        let config = MapConfig {
            maximum_size: 255,
            key_width: 2,
            search_key: SearchKeyFunc::Hash255,
            page_cache_bytes: 1024,
        };
        config.save(&store_path).unwrap();
        assert!(dir.path().join("maps.chk.json").exists());
        assert_eq!(MapConfig::load(&store_path).unwrap(), config);
    }

    #[test]
    fn test_search_key_is_stored_by_name() {
        let json = serde_json::to_value(MapConfig {
            search_key: SearchKeyFunc::Hash16,
            ..MapConfig::default()
        })
        .unwrap();
        assert_eq!(json["search_key"], "hash-16-way");

        let parsed: MapConfig = serde_json::from_str(r#"{"key_width": 3}"#).unwrap();
        assert_eq!(parsed.key_width, 3);
        assert_eq!(parsed.search_key, SearchKeyFunc::Plain);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("maps.chk");
        std::fs::write(
            MapConfig::config_path(&store_path),
            r#"{"search_key": "hash-7-way"}"#,
        )
        .unwrap();
        assert!(matches!(MapConfig::load(&store_path), Err(Error::Config(_))));

        std::fs::write(MapConfig::config_path(&store_path), r#"{"key_width": 0}"#).unwrap();
        assert!(matches!(MapConfig::load(&store_path), Err(Error::Config(_))));
    }
}
