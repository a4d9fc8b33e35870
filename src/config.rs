use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IoResultExt, Result};
use crate::hash::HashKind;

/// repository configuration stored in config.toml
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
}

/// storage settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// digest algorithm for every object in the repository
    pub hash: HashKind,
    /// zlib level used for loose objects and pack entries
    pub compression: u32,
    /// fsync objects, packs, the index and refs before publishing them
    pub fsync: bool,
    /// longest delta chain a pack read will follow
    pub max_delta_depth: usize,
    /// most symbolic hops a ref resolution will follow
    pub max_symref_depth: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            hash: HashKind::Sha1,
            compression: 6,
            fsync: true,
            max_delta_depth: 4096,
            max_symref_depth: 5,
        }
    }
}

impl Config {
    /// create a config for a repository addressed with `hash`
    pub fn new(hash: HashKind) -> Self {
        Self {
            core: CoreConfig {
                hash,
                ..CoreConfig::default()
            },
        }
    }

    /// load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.core.compression = config.core.compression.min(9);
        Ok(config)
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    pub fn hash(&self) -> HashKind {
        self.core.hash
    }

    pub(crate) fn compression(&self) -> flate2::Compression {
        flate2::Compression::new(self.core.compression.min(9))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::tempdir;

    #[test]
    fn test_config_toml_roundtrip() {
        let mut config = Config::new(HashKind::Sha256);
        config.core.compression = 1;
        config.core.fsync = false;

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("hash = \"sha256\""));
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_config_minimal_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());

        let config: Config = toml::from_str("[core]\nhash = \"sha1\"\n").unwrap();
        assert_eq!(config.core.max_delta_depth, 4096);
        assert_eq!(config.core.max_symref_depth, 5);
        assert!(config.core.fsync);
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.core.max_symref_depth = 8;
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_config_clamps_compression() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[core]\ncompression = 42\n").unwrap();

        assert_eq!(Config::load(&path).unwrap().core.compression, 9);
    }

    #[test]
    fn test_config_rejects_unknown_hash() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[core]\nhash = \"md5\"\n").unwrap();

        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }
}
