//! Connection layer - the database handle the manager talks to
//!
//! A connection is created unopened by a [`ConnectionFactory`], opened, used
//! for one logical operation and dropped. Dropping a connection with an open
//! transaction rolls the transaction back.

pub mod sqlite;

use crate::command::{Command, Row};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use sqlite::{SqliteConnection, SqliteConnectionFactory};

/// Forward-only stream of rows
pub type RowStream = Pin<Box<dyn Stream<Item = Result<Row>> + Send>>;

/// Transaction isolation requested by an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Used by single-row reads
    RepeatableRead,
    /// Used by every write
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::RepeatableRead => "repeatable_read",
            IsolationLevel::Serializable => "serializable",
        }
    }
}

/// An abstract database connection.
///
/// Every call is a suspension point and observes the cancellation token:
/// a cancelled token yields [`Error::Cancelled`] and leaves any open
/// transaction uncommitted. [`Connection::commit`] is the exception once
/// it has been sent.
#[async_trait]
pub trait Connection: Send {
    /// Driver name, for diagnostics only
    fn type_name(&self) -> &'static str;

    async fn open(&mut self, cancel: &CancellationToken) -> Result<()>;

    async fn begin(&mut self, level: IsolationLevel, cancel: &CancellationToken) -> Result<()>;

    /// Execute a non-query command and return the affected row count
    async fn execute(&mut self, command: &Command, cancel: &CancellationToken) -> Result<u64>;

    /// Execute a query and materialize at most one row
    async fn query_one(&mut self, command: &Command, cancel: &CancellationToken) -> Result<Option<Row>>;

    /// Commit the open transaction.
    ///
    /// The token is checked only before COMMIT is sent. Once sent, the
    /// commit runs to completion and its own outcome is returned, so a
    /// successful result always means the write is durable.
    async fn commit(&mut self, cancel: &CancellationToken) -> Result<()>;

    /// Consume the connection into a lazy row stream.
    ///
    /// The connection stays open until the stream is exhausted or dropped.
    fn into_rows(self: Box<Self>, command: Command, cancel: CancellationToken) -> RowStream;
}

/// Zero-argument function producing new, unopened connections
#[derive(Clone)]
pub struct ConnectionFactory {
    make: Arc<dyn Fn() -> Box<dyn Connection> + Send + Sync>,
}

impl ConnectionFactory {
    pub fn new<F>(make: F) -> Self
    where
        F: Fn() -> Box<dyn Connection> + Send + Sync + 'static,
    {
        Self { make: Arc::new(make) }
    }

    pub fn create(&self) -> Box<dyn Connection> {
        (self.make)()
    }
}

impl fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFactory").finish_non_exhaustive()
    }
}

/// Race `fut` against the token; cancellation wins ties.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancellable_passes_result_through() {
        let token = CancellationToken::new();
        let value = cancellable(&token, async { Ok::<_, Error>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancelled_token_wins() {
        let token = CancellationToken::new();
        token.cancel();
        let res = cancellable(&token, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, Error>(())
        })
        .await;
        assert!(matches!(res, Err(Error::Cancelled)));
    }

    #[test]
    fn test_factory_creates_fresh_connections() {
        let dir = tempfile::tempdir().unwrap();
        let factory: ConnectionFactory = SqliteConnectionFactory::new(dir.path().join("f.db")).into();
        let a = factory.create();
        let b = factory.create();
        assert_eq!(a.type_name(), "sqlite");
        assert_eq!(b.type_name(), "sqlite");
    }
}
