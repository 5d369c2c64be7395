use crate::dialect::{validate_table_name, Dialect};
use crate::manager::{DEFAULT_KEY_SIZE, DEFAULT_TABLE, MAX_DATA_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One descriptor table and the database it lives in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database: PathBuf,
    pub table: String,
    pub dialect: Dialect,
    pub key_size: usize,
    pub max_data_size: usize,
    pub busy_timeout_ms: u64,
    /// Create the table at host init when missing
    pub create_schema: bool,
    /// Back the owner lookup with a unique index
    pub unique_owner: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            table: DEFAULT_TABLE.to_string(),
            dialect: Dialect::Generic,
            key_size: DEFAULT_KEY_SIZE,
            max_data_size: MAX_DATA_SIZE,
            busy_timeout_ms: 5000,
            create_schema: true,
            unique_owner: false,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_table_name(&self.table)?;
        if !(1..=4000).contains(&self.key_size) {
            anyhow::bail!("key_size must be between 1 and 4000, got {}", self.key_size);
        }
        if !(1..=MAX_DATA_SIZE).contains(&self.max_data_size) {
            anyhow::bail!(
                "max_data_size must be between 1 and {}, got {}",
                MAX_DATA_SIZE,
                self.max_data_size
            );
        }
        Ok(())
    }
}

/// Everything a hosting process needs to build its managers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default, rename = "store")]
    pub stores: Vec<StoreConfig>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            stores: vec![StoreConfig::default()],
        }
    }
}

impl HostConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.stores.is_empty() {
            anyhow::bail!("no [[store]] sections configured");
        }
        for (i, store) in self.stores.iter().enumerate() {
            store.validate()?;
            if self.stores[..i].iter().any(|s| s.table == store.table) {
                anyhow::bail!("table {} is configured twice", store.table);
            }
        }
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("lwstore.toml")
}

pub fn default_database_path() -> PathBuf {
    PathBuf::from(".lwstore").join("lwstore.db")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<HostConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: HostConfig = toml::from_str(&contents)?;
    config.validate()?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &HostConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_db_dir(db_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
