//! Host container - builds every configured manager once at startup
//!
//! The hosting process owns the container: `init` at start, hand out
//! managers by table name, `teardown` at shutdown. There is no lazy global
//! state; two hosts in one process are fully independent.

use crate::config::{ensure_db_dir, HostConfig, StoreConfig};
use crate::connection::{ConnectionFactory, SqliteConnectionFactory};
use crate::dialect::Dialect;
use crate::manager::{ManagerOptions, StorageManager};
use crate::storage::ensure_schema;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::time::Duration;

pub struct StorageHost {
    managers: BTreeMap<String, StorageManager>,
}

impl StorageHost {
    /// Build one manager per configured store, creating schemas where asked.
    pub async fn init(config: &HostConfig) -> Result<Self> {
        config.validate().map_err(|e| Error::Config(e.to_string()))?;

        let mut managers = BTreeMap::new();
        for store in &config.stores {
            let manager = Self::build(store).await?;
            managers.insert(store.table.clone(), manager);
        }

        tracing::info!("Storage host initialized with {} table(s)", managers.len());
        Ok(Self { managers })
    }

    async fn build(store: &StoreConfig) -> Result<StorageManager> {
        if store.dialect != Dialect::Generic {
            return Err(Error::Config(format!(
                "table {} uses the {} dialect, but the host only opens SQLite databases (dialect generic)",
                store.table, store.dialect
            )));
        }
        ensure_db_dir(&store.database).map_err(|e| Error::Config(e.to_string()))?;

        let factory: ConnectionFactory = SqliteConnectionFactory::new(&store.database)
            .with_busy_timeout(Duration::from_millis(store.busy_timeout_ms))
            .into();

        if store.create_schema {
            ensure_schema(
                &factory,
                store.dialect,
                &store.table,
                store.key_size,
                store.max_data_size,
                store.unique_owner,
            )
            .await?;
        }

        StorageManager::new(factory, ManagerOptions::from(store))
    }

    pub fn manager(&self, table: &str) -> Option<StorageManager> {
        self.managers.get(table).cloned()
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.managers.keys().map(String::as_str)
    }

    /// Drop every manager. Descriptors still held elsewhere keep their
    /// manager alive until released.
    pub fn teardown(self) {
        for table in self.managers.keys() {
            tracing::debug!("Tearing down manager for {}", table);
        }
        tracing::info!("Storage host shut down");
    }
}
