//! Storage manager - the single point of access to one descriptor table
//!
//! Every operation opens its own connection and transaction. Writes run
//! serializable, single-row reads repeatable-read. Nothing is retried here:
//! a busy or conflicting database surfaces to the caller, who decides.

use crate::command::{Command, Row};
use crate::config::StoreConfig;
use crate::connection::{Connection, ConnectionFactory, IsolationLevel};
use crate::descriptor::Descriptor;
use crate::dialect::{Dialect, Statements};
use crate::enumerable::{Enumeration, Lease, TableEnumerator};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Upper bound of the Data column
pub const MAX_DATA_SIZE: usize = 8000;

pub const DEFAULT_TABLE: &str = "LWStorage";
pub const DEFAULT_KEY_SIZE: usize = 64;

/// Produces a new unique descriptor id
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Default id: 128 random bits as 32 lowercase hex characters
pub fn default_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Construction-time settings of a [`StorageManager`]
#[derive(Clone)]
pub struct ManagerOptions {
    pub table: String,
    pub dialect: Dialect,
    /// Maximum character length of Id and UserID
    pub key_size: usize,
    /// Maximum payload size in bytes, at most [`MAX_DATA_SIZE`]
    pub max_data_size: usize,
    pub id_generator: IdGenerator,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            dialect: Dialect::Generic,
            key_size: DEFAULT_KEY_SIZE,
            max_data_size: MAX_DATA_SIZE,
            id_generator: Arc::new(default_id),
        }
    }
}

impl ManagerOptions {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_key_size(mut self, key_size: usize) -> Self {
        self.key_size = key_size;
        self
    }

    pub fn with_max_data_size(mut self, bytes: usize) -> Self {
        self.max_data_size = bytes;
        self
    }

    /// Replace the id generator
    pub fn with_id_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.id_generator = Arc::new(generator);
        self
    }
}

impl From<&StoreConfig> for ManagerOptions {
    fn from(config: &StoreConfig) -> Self {
        Self::new(config.table.clone())
            .with_dialect(config.dialect)
            .with_key_size(config.key_size)
            .with_max_data_size(config.max_data_size)
    }
}

impl fmt::Debug for ManagerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerOptions")
            .field("table", &self.table)
            .field("dialect", &self.dialect)
            .field("key_size", &self.key_size)
            .field("max_data_size", &self.max_data_size)
            .finish_non_exhaustive()
    }
}

struct ManagerInner {
    factory: ConnectionFactory,
    statements: Statements,
    key_size: usize,
    max_data_size: usize,
    id_generator: IdGenerator,
}

/// Manager for one descriptor table. Cheap to clone.
#[derive(Clone)]
pub struct StorageManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageManager")
            .field("table", &self.inner.statements.table)
            .field("dialect", &self.inner.statements.dialect)
            .finish_non_exhaustive()
    }
}

impl StorageManager {
    /// Compile the statement set and validate sizes. No I/O happens here.
    pub fn new(factory: ConnectionFactory, options: ManagerOptions) -> Result<Self> {
        if options.key_size == 0 {
            return Err(Error::Config("key_size must be at least 1".to_string()));
        }
        if options.max_data_size == 0 || options.max_data_size > MAX_DATA_SIZE {
            return Err(Error::Config(format!(
                "max_data_size must be between 1 and {MAX_DATA_SIZE}, got {}",
                options.max_data_size
            )));
        }

        let statements = Statements::compile(options.dialect, &options.table)?;
        tracing::debug!(
            "Storage manager for {} ({} dialect, key size {})",
            statements.table,
            statements.dialect,
            options.key_size
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                factory,
                statements,
                key_size: options.key_size,
                max_data_size: options.max_data_size,
                id_generator: options.id_generator,
            }),
        })
    }

    pub fn table(&self) -> &str {
        &self.inner.statements.table
    }

    pub fn dialect(&self) -> Dialect {
        self.inner.statements.dialect
    }

    pub fn statements(&self) -> &Statements {
        &self.inner.statements
    }

    pub fn key_size(&self) -> usize {
        self.inner.key_size
    }

    pub fn max_data_size(&self) -> usize {
        self.inner.max_data_size
    }

    /// A fresh id from the configured generator
    pub fn generate_id(&self) -> String {
        (self.inner.id_generator)()
    }

    // ========== Descriptor Operations ==========

    /// Insert a new, empty descriptor owned by `owner`.
    ///
    /// An id collision affects zero rows and fails with
    /// [`Error::DescriptorCreation`].
    pub async fn create_descriptor(
        &self,
        owner: &str,
        id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Descriptor> {
        require_key("owner id", owner)?;
        let id = match id {
            Some(id) => {
                require_key("descriptor id", id)?;
                id.to_string()
            }
            None => self.generate_id(),
        };

        let now = Utc::now();
        let command = Command::new(&self.inner.statements.insert)
            .bind_text("@Id", &id, self.inner.key_size)?
            .bind_text("@UserID", owner, self.inner.key_size)?
            .bind_bytes("@Data", &[], self.inner.max_data_size)?
            .bind_datetime("@Created", now)?
            .bind_datetime("@LastModified", now)?;

        let mut conn = self.begin(IsolationLevel::Serializable, cancel).await?;
        let affected = match conn.execute(&command, cancel).await {
            Ok(n) => n,
            Err(e) if is_constraint_violation(&e) => 0,
            Err(e) => return Err(e),
        };
        if affected == 0 {
            tracing::debug!("Insert of descriptor {} into {} affected no rows", id, self.table());
            return Err(Error::DescriptorCreation { id });
        }
        conn.commit(cancel).await?;

        tracing::debug!("Created descriptor {} for owner {}", id, owner);
        Ok(Descriptor::prepared(self.clone(), id, owner.to_string(), now, now, Vec::new()))
    }

    /// Fetch the descriptor owned by `owner`.
    ///
    /// When several rows share an owner, which one is returned is unspecified.
    pub async fn get_descriptor_by_owner(
        &self,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Descriptor>> {
        require_key("owner id", owner)?;
        let command = Command::new(&self.inner.statements.select_by_owner)
            .bind_text("@UserID", owner, self.inner.key_size)?;
        self.read_one(command, cancel).await
    }

    pub async fn get_descriptor_by_id(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Descriptor>> {
        require_key("descriptor id", id)?;
        let command = Command::new(&self.inner.statements.select_by_id)
            .bind_text("@Id", id, self.inner.key_size)?;
        self.read_one(command, cancel).await
    }

    /// Overwrite the payload of `descriptor` with `data`.
    ///
    /// Any fault, including a missing row, surfaces as
    /// [`Error::UpdateFailed`]; cancellation stays [`Error::Cancelled`]. On
    /// success the descriptor holds `data`, is no longer dirty and carries
    /// the new LastModified.
    pub async fn update_descriptor_data(
        &self,
        descriptor: &mut Descriptor,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        descriptor.ensure_usable()?;
        let id = descriptor.key().to_string();

        // LastModified must move forward even on a coarse clock.
        let modified = Utc::now().max(descriptor.modified_at() + chrono::Duration::nanoseconds(1));

        match self.write_data(&id, data, modified, cancel).await {
            Ok(0) => Err(Error::UpdateFailed { id, source: None }),
            Ok(_) => {
                descriptor.apply_persisted(data, modified);
                tracing::debug!("Updated descriptor {} ({} bytes)", id, data.len());
                Ok(())
            }
            Err(e) => Err(Error::update_failed(id, e)),
        }
    }

    async fn write_data(
        &self,
        id: &str,
        data: &[u8],
        modified: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let command = Command::new(&self.inner.statements.update_data)
            .bind_text("@Id", id, self.inner.key_size)?
            .bind_bytes("@Data", data, self.inner.max_data_size)?
            .bind_datetime("@LastModified", modified)?;

        let mut conn = self.begin(IsolationLevel::Serializable, cancel).await?;
        let affected = conn.execute(&command, cancel).await?;
        if affected > 0 {
            conn.commit(cancel).await?;
        }
        Ok(affected)
    }

    /// Delete the row behind `descriptor`. A row that is already gone is not an error.
    pub async fn remove_descriptor(&self, descriptor: &Descriptor, cancel: &CancellationToken) -> Result<()> {
        self.remove_by_id(descriptor.key(), cancel).await
    }

    pub async fn remove_by_id(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        require_key("descriptor id", id)?;
        match self.delete(id, cancel).await {
            Ok(0) => {
                tracing::debug!("Descriptor {} was already removed", id);
                Ok(())
            }
            Ok(_) => {
                tracing::debug!("Removed descriptor {}", id);
                Ok(())
            }
            Err(e) => Err(Error::remove_failed(id, e)),
        }
    }

    async fn delete(&self, id: &str, cancel: &CancellationToken) -> Result<u64> {
        let command = Command::new(&self.inner.statements.delete_by_id)
            .bind_text("@Id", id, self.inner.key_size)?;
        let mut conn = self.begin(IsolationLevel::Serializable, cancel).await?;
        let affected = conn.execute(&command, cancel).await?;
        conn.commit(cancel).await?;
        Ok(affected)
    }

    // ========== Maintenance Operations ==========

    /// Delete every descriptor created before `cutoff`; returns the count removed
    pub async fn cleanup_older_than(&self, cutoff: DateTime<Utc>, cancel: &CancellationToken) -> Result<u64> {
        let command = Command::new(&self.inner.statements.delete_older_than).bind_datetime("@Cutoff", cutoff)?;

        let mut conn = self.begin(IsolationLevel::Serializable, cancel).await?;
        let removed = conn.execute(&command, cancel).await?;
        conn.commit(cancel).await?;

        tracing::info!("Cleaned up {} descriptors from {} created before {}", removed, self.table(), cutoff);
        Ok(removed)
    }

    /// Delete every descriptor older than `age`
    pub async fn cleanup_older_than_age(&self, age: chrono::Duration, cancel: &CancellationToken) -> Result<u64> {
        if age < chrono::Duration::zero() {
            return Err(Error::invalid("cleanup age must not be negative"));
        }
        self.cleanup_older_than(Utc::now() - age, cancel).await
    }

    /// Count all descriptors
    pub async fn count(&self, cancel: &CancellationToken) -> Result<u64> {
        let mut conn = self.inner.factory.create();
        conn.open(cancel).await?;
        let row = conn
            .query_one(&Command::new(&self.inner.statements.count), cancel)
            .await?
            .ok_or_else(|| Error::invalid("COUNT returned no row"))?;
        Ok(row.integer(0)?.max(0) as u64)
    }

    /// Stream every descriptor in the table.
    ///
    /// Each yielded lease disposes its descriptor's stream when dropped
    /// unless the consumer released it first.
    pub fn enumerate_all(&self, cancel: CancellationToken) -> Enumeration<Lease<Descriptor>> {
        Arc::new(DescriptorTable { manager: self.clone() }).enumerate(cancel)
    }

    // ========== Helpers ==========

    async fn begin(&self, level: IsolationLevel, cancel: &CancellationToken) -> Result<Box<dyn Connection>> {
        let mut conn = self.inner.factory.create();
        conn.open(cancel).await?;
        conn.begin(level, cancel).await?;
        tracing::trace!("Began {} transaction on {} ({})", level.as_str(), self.table(), conn.type_name());
        Ok(conn)
    }

    async fn read_one(&self, command: Command, cancel: &CancellationToken) -> Result<Option<Descriptor>> {
        let mut conn = self.begin(IsolationLevel::RepeatableRead, cancel).await?;
        let row = conn.query_one(&command, cancel).await?;
        conn.commit(cancel).await?;
        row.map(|row| self.materialize(row)).transpose()
    }

    /// Row layout: Id, UserID, Data, Created, LastModified
    fn materialize(&self, row: Row) -> Result<Descriptor> {
        Ok(Descriptor::prepared(
            self.clone(),
            row.text(0)?,
            row.text(1)?,
            row.datetime(3)?,
            row.datetime(4)?,
            row.bytes(2)?,
        ))
    }
}

fn require_key(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::invalid(format!("{what} must not be empty")));
    }
    Ok(())
}

fn is_constraint_violation(err: &Error) -> bool {
    matches!(
        err,
        Error::Storage(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Enumeration source backing [`StorageManager::enumerate_all`]
struct DescriptorTable {
    manager: StorageManager,
}

impl TableEnumerator for DescriptorTable {
    type Item = Descriptor;

    fn connection(&self) -> Box<dyn Connection> {
        self.manager.inner.factory.create()
    }

    fn enumeration_command(&self) -> Command {
        Command::new(&self.manager.inner.statements.select_all)
    }

    fn materialize(&self, row: Row) -> Result<Descriptor> {
        self.manager.materialize(row)
    }

    fn cleanup(&self, descriptor: &mut Descriptor) {
        descriptor.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::SqliteConnectionFactory;
    use crate::storage::ensure_schema;
    use futures::StreamExt;
    use std::collections::HashSet;

    async fn test_manager(dir: &tempfile::TempDir) -> StorageManager {
        test_manager_with(dir, ManagerOptions::new("Blobs")).await
    }

    async fn test_manager_with(dir: &tempfile::TempDir, options: ManagerOptions) -> StorageManager {
        let factory: ConnectionFactory = SqliteConnectionFactory::new(dir.path().join("lw.db")).into();
        ensure_schema(&factory, options.dialect, &options.table, options.key_size, options.max_data_size, false)
            .await
            .unwrap();
        StorageManager::new(factory, options).unwrap()
    }

    #[tokio::test]
    async fn test_create_then_get_by_owner() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir).await;
        let cancel = CancellationToken::new();

        let created = manager.create_descriptor("u1", None, &cancel).await.unwrap();
        let fetched = manager.get_descriptor_by_owner("u1", &cancel).await.unwrap().unwrap();

        assert_eq!(fetched.id().unwrap(), created.id().unwrap());
        assert_eq!(fetched.owner().unwrap(), "u1");
        assert!(fetched.data().unwrap().is_empty());
        assert_eq!(fetched.created().unwrap(), created.created().unwrap());
    }

    #[tokio::test]
    async fn test_update_then_get_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir).await;
        let cancel = CancellationToken::new();

        let mut d = manager.create_descriptor("u1", Some("a1"), &cancel).await.unwrap();
        manager.update_descriptor_data(&mut d, &[0x01, 0x02], &cancel).await.unwrap();

        let fetched = manager.get_descriptor_by_id("a1", &cancel).await.unwrap().unwrap();
        assert_eq!(fetched.data().unwrap(), &[0x01, 0x02]);
        assert_eq!(fetched.owner().unwrap(), "u1");
        assert!(fetched.last_modified().unwrap() > fetched.created().unwrap());
        assert_eq!(d.last_modified().unwrap(), fetched.last_modified().unwrap());
    }

    #[tokio::test]
    async fn test_empty_arguments_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir).await;
        let cancel = CancellationToken::new();

        assert!(matches!(manager.create_descriptor("", None, &cancel).await, Err(Error::InvalidArgument(_))));
        assert!(matches!(manager.create_descriptor("u", Some(""), &cancel).await, Err(Error::InvalidArgument(_))));
        assert!(matches!(manager.get_descriptor_by_owner("", &cancel).await, Err(Error::InvalidArgument(_))));
        assert!(matches!(manager.get_descriptor_by_id("", &cancel).await, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_oversized_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager_with(&dir, ManagerOptions::new("Blobs").with_key_size(4)).await;
        let cancel = CancellationToken::new();
        let err = manager.create_descriptor("owner-too-long", Some("a1"), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_duplicate_id_fails_creation() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir).await;
        let cancel = CancellationToken::new();

        manager.create_descriptor("u1", Some("dup"), &cancel).await.unwrap();
        let err = manager.create_descriptor("u2", Some("dup"), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::DescriptorCreation { ref id } if id == "dup"));
        assert_eq!(manager.count(&cancel).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unique_owner_index_maps_to_creation_error() {
        let dir = tempfile::tempdir().unwrap();
        let factory: ConnectionFactory = SqliteConnectionFactory::new(dir.path().join("u.db")).into();
        ensure_schema(&factory, Dialect::Generic, "Blobs", 64, 8000, true).await.unwrap();
        let manager = StorageManager::new(factory, ManagerOptions::new("Blobs")).unwrap();
        let cancel = CancellationToken::new();

        manager.create_descriptor("u1", None, &cancel).await.unwrap();
        let err = manager.create_descriptor("u1", None, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::DescriptorCreation { .. }));
    }

    #[tokio::test]
    async fn test_missing_lookups_return_none() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir).await;
        let cancel = CancellationToken::new();
        assert!(manager.get_descriptor_by_id("nope", &cancel).await.unwrap().is_none());
        assert!(manager.get_descriptor_by_owner("nobody", &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_then_get_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir).await;
        let cancel = CancellationToken::new();

        let d = manager.create_descriptor("u1", Some("r1"), &cancel).await.unwrap();
        manager.remove_descriptor(&d, &cancel).await.unwrap();
        assert!(manager.get_descriptor_by_id("r1", &cancel).await.unwrap().is_none());

        // already gone is still success
        manager.remove_descriptor(&d, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_of_removed_row_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir).await;
        let cancel = CancellationToken::new();

        let mut d = manager.create_descriptor("u1", Some("x1"), &cancel).await.unwrap();
        manager.remove_by_id("x1", &cancel).await.unwrap();

        let err = manager.update_descriptor_data(&mut d, b"late", &cancel).await.unwrap_err();
        assert!(matches!(err, Error::UpdateFailed { source: None, .. }));
    }

    #[tokio::test]
    async fn test_oversized_payload_wrapped_in_update_failed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager_with(&dir, ManagerOptions::new("Blobs").with_max_data_size(4)).await;
        let cancel = CancellationToken::new();

        let mut d = manager.create_descriptor("u1", None, &cancel).await.unwrap();
        let err = manager.update_descriptor_data(&mut d, &[0u8; 5], &cancel).await.unwrap_err();
        match err {
            Error::UpdateFailed { source: Some(inner), .. } => {
                assert!(matches!(*inner, Error::InvalidArgument(_)))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_update_is_not_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir).await;
        let live = CancellationToken::new();
        let mut d = manager.create_descriptor("u1", None, &live).await.unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = manager.update_descriptor_data(&mut d, b"x", &cancelled).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(manager.get_descriptor_by_id(d.id().unwrap(), &live).await.unwrap().unwrap().data().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_older_than_removes_exact_count() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir).await;
        let cancel = CancellationToken::new();

        for owner in ["a", "b", "c"] {
            manager.create_descriptor(owner, None, &cancel).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let cutoff = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        manager.create_descriptor("late", None, &cancel).await.unwrap();

        assert_eq!(manager.cleanup_older_than(cutoff, &cancel).await.unwrap(), 3);
        assert_eq!(manager.count(&cancel).await.unwrap(), 1);
        assert!(manager.get_descriptor_by_owner("late", &cancel).await.unwrap().is_some());
        assert_eq!(manager.cleanup_older_than(cutoff, &cancel).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_cutoff_equal_to_created_keeps_row() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir).await;
        let cancel = CancellationToken::new();
        manager.create_descriptor("u1", Some("edge"), &cancel).await.unwrap();
        let stored = manager.get_descriptor_by_id("edge", &cancel).await.unwrap().unwrap();
        let created = stored.created().unwrap();

        assert_eq!(manager.cleanup_older_than(created, &cancel).await.unwrap(), 0);
        assert!(manager.get_descriptor_by_id("edge", &cancel).await.unwrap().is_some());

        let just_after = created + chrono::Duration::nanoseconds(1);
        assert_eq!(manager.cleanup_older_than(just_after, &cancel).await.unwrap(), 1);
        assert!(manager.get_descriptor_by_id("edge", &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir).await;
        let cancel = CancellationToken::new();
        manager.create_descriptor("a", None, &cancel).await.unwrap();

        assert_eq!(manager.cleanup_older_than_age(chrono::Duration::hours(1), &cancel).await.unwrap(), 0);
        assert!(manager.cleanup_older_than_age(chrono::Duration::seconds(-1), &cancel).await.is_err());
    }

    #[tokio::test]
    async fn test_generated_ids_do_not_collide() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = default_id();
            assert_eq!(id.len(), 32);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(seen.insert(id));
        }
    }

    #[tokio::test]
    async fn test_sequential_creates_get_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir).await;
        let cancel = CancellationToken::new();
        let a = manager.create_descriptor("u", None, &cancel).await.unwrap();
        let b = manager.create_descriptor("u", None, &cancel).await.unwrap();
        assert_ne!(a.id().unwrap(), b.id().unwrap());
    }

    #[tokio::test]
    async fn test_custom_id_generator() {
        let dir = tempfile::tempdir().unwrap();
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = counter.clone();
        let options = ManagerOptions::new("Blobs").with_id_generator(move || {
            format!("seq-{}", c.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
        });
        let manager = test_manager_with(&dir, options).await;
        let cancel = CancellationToken::new();

        let d = manager.create_descriptor("u", None, &cancel).await.unwrap();
        assert_eq!(d.id().unwrap(), "seq-0");
    }

    #[tokio::test]
    async fn test_enumerate_all_yields_every_row() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir).await;
        let cancel = CancellationToken::new();
        for owner in ["a", "b", "c"] {
            manager.create_descriptor(owner, None, &cancel).await.unwrap();
        }

        let mut owners = Vec::new();
        let mut all = manager.enumerate_all(cancel.clone());
        while let Some(lease) = all.next().await {
            let mut lease = lease.unwrap();
            owners.push(lease.owner().unwrap().to_string());
            lease.release(&cancel).await.unwrap();
        }
        owners.sort();
        assert_eq!(owners, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_sweep_removes_while_enumerating() {
        let dir = tempfile::tempdir().unwrap();
        let factory = SqliteConnectionFactory::new(dir.path().join("sweep.db"))
            .with_busy_timeout(std::time::Duration::from_millis(300));
        let factory: ConnectionFactory = factory.into();
        ensure_schema(&factory, Dialect::Generic, "Blobs", 64, MAX_DATA_SIZE, false)
            .await
            .unwrap();
        let manager = StorageManager::new(factory, ManagerOptions::new("Blobs")).unwrap();
        let cancel = CancellationToken::new();
        for owner in ["a", "b", "c", "d"] {
            manager.create_descriptor(owner, None, &cancel).await.unwrap();
        }

        let mut swept = 0;
        let mut all = manager.enumerate_all(cancel.clone());
        while let Some(lease) = all.next().await {
            let mut lease = lease.unwrap();
            lease.mark_for_removal().unwrap();
            lease.release(&cancel).await.unwrap();
            swept += 1;
        }
        assert_eq!(swept, 4);
        assert_eq!(manager.count(&cancel).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_enumeration_disposes_items() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir).await;
        let cancel = CancellationToken::new();
        for owner in ["a", "b"] {
            manager.create_descriptor(owner, None, &cancel).await.unwrap();
        }

        let mut all = manager.enumerate_all(cancel.clone());
        let lease = all.next().await.unwrap().unwrap();
        let mut descriptor = lease.into_inner();
        drop(all);

        assert!(descriptor.id().is_ok());
        descriptor.release(&cancel).await.unwrap();

        // still usable after an abandoned sweep
        assert_eq!(manager.count(&cancel).await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir).await;
        let cancel = CancellationToken::new();
        manager.create_descriptor("u1", Some("c1"), &cancel).await.unwrap();

        let first = vec![0xAA; 4000];
        let second = vec![0x55; 4000];
        let mut tasks = Vec::new();
        for payload in [first.clone(), second.clone()] {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut d = manager.get_descriptor_by_id("c1", &cancel).await.unwrap().unwrap();
                manager.update_descriptor_data(&mut d, &payload, &cancel).await
            }));
        }

        let mut committed = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => committed += 1,
                Err(e) => assert!(matches!(e, Error::UpdateFailed { .. })),
            }
        }
        assert!(committed >= 1);

        let stored = manager.get_descriptor_by_id("c1", &cancel).await.unwrap().unwrap();
        let data = stored.data().unwrap().to_vec();
        assert!(data == first || data == second);
    }

    #[test]
    fn test_invalid_options_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let factory: ConnectionFactory = SqliteConnectionFactory::new(dir.path().join("o.db")).into();
        assert!(StorageManager::new(factory.clone(), ManagerOptions::new("Blobs").with_key_size(0)).is_err());
        assert!(StorageManager::new(factory.clone(), ManagerOptions::new("Blobs").with_max_data_size(8001)).is_err());
        assert!(StorageManager::new(factory, ManagerOptions::new("bad name")).is_err());
    }
}
