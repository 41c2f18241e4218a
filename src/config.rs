use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IoResultExt, Result};

fn default_compression_level() -> i32 {
    3
}

fn default_part_count() -> u32 {
    1
}

/// container configuration stored in config.toml
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// zstd compression level for in-container objects
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
    /// number of physical parts the container is split across;
    /// anything other than 1 refuses writable mounts
    #[serde(default = "default_part_count")]
    pub part_count: u32,
}

impl Config {
    /// load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compression_level: default_compression_level(),
            part_count: default_part_count(),
        }
    }
}
