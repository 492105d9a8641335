use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default cap on the number of rows accepted by a single batch insert.
pub const DEFAULT_INSERT_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    pub data_dir: PathBuf,
    /// Maximum number of records accepted by a single insert call.
    #[serde(default = "default_insert_limit")]
    pub insert_limit: usize,
}

fn default_insert_limit() -> usize {
    DEFAULT_INSERT_LIMIT
}

impl DbConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("annodb.db")
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            insert_limit: DEFAULT_INSERT_LIMIT,
        }
    }
}
