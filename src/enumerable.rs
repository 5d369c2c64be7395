//! Enumerable table base
//!
//! Opens a connection on first poll, runs one enumeration statement and
//! yields materialized rows one at a time. The sequence is forward-only and
//! cannot be restarted. Every yielded item is wrapped in a [`Lease`] that
//! runs the table's cleanup hook when dropped, so abandoning the sweep early
//! still cleans up whatever was handed out.

use crate::command::{Command, Row};
use crate::connection::{Connection, RowStream};
use crate::Result;
use futures::{Stream, StreamExt};
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;

/// A table that can be swept row by row
pub trait TableEnumerator: Send + Sync + 'static {
    type Item: Send + 'static;

    /// A new, unopened connection for the sweep
    fn connection(&self) -> Box<dyn Connection>;

    fn enumeration_command(&self) -> Command;

    fn materialize(&self, row: Row) -> Result<Self::Item>;

    /// Runs once per yielded item when its lease is dropped
    fn cleanup(&self, _item: &mut Self::Item) {}

    fn enumerate(self: Arc<Self>, cancel: CancellationToken) -> Enumeration<Lease<Self::Item>>
    where
        Self: Sized,
    {
        let stream = futures::stream::unfold(SweepState::Pending(self, cancel), |state| async move {
            match state {
                SweepState::Pending(table, cancel) => {
                    let mut conn = table.connection();
                    if let Err(e) = conn.open(&cancel).await {
                        return Some((Err(e), SweepState::Done));
                    }
                    let rows = conn.into_rows(table.enumeration_command(), cancel);
                    next_item(table, rows).await
                }
                SweepState::Streaming(table, rows) => next_item(table, rows).await,
                SweepState::Done => None,
            }
        });
        Enumeration::new(stream)
    }
}

enum SweepState<E: TableEnumerator> {
    Pending(Arc<E>, CancellationToken),
    Streaming(Arc<E>, RowStream),
    Done,
}

async fn next_item<E>(table: Arc<E>, mut rows: RowStream) -> Option<(Result<Lease<E::Item>>, SweepState<E>)>
where
    E: TableEnumerator,
{
    match rows.next().await? {
        Ok(row) => {
            let item = table.materialize(row).map(|item| {
                let hook = Arc::clone(&table);
                Lease::new(item, move |item: &mut E::Item| hook.cleanup(item))
            });
            Some((item, SweepState::Streaming(table, rows)))
        }
        Err(e) => Some((Err(e), SweepState::Done)),
    }
}

/// Lazy, forward-only sequence of items
pub struct Enumeration<T> {
    inner: Pin<Box<dyn Stream<Item = Result<T>> + Send>>,
}

impl<T> Enumeration<T> {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<T>> + Send + 'static,
    {
        Self { inner: Box::pin(stream) }
    }
}

impl<T> Stream for Enumeration<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

type CleanupHook<T> = Box<dyn FnOnce(&mut T) + Send>;

/// An item on loan from an enumeration; the cleanup hook runs on drop.
pub struct Lease<T> {
    item: Option<T>,
    cleanup: Option<CleanupHook<T>>,
}

impl<T> Lease<T> {
    pub fn new<F>(item: T, cleanup: F) -> Self
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        Self {
            item: Some(item),
            cleanup: Some(Box::new(cleanup)),
        }
    }

    /// Take the item out; the cleanup hook will not run.
    pub fn into_inner(mut self) -> T {
        self.cleanup = None;
        match self.item.take() {
            Some(item) => item,
            None => unreachable!("lease item is present until drop"),
        }
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.item {
            Some(item) => item,
            None => unreachable!("lease item is present until drop"),
        }
    }
}

impl<T> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("lease item is present until drop"),
        }
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if let (Some(item), Some(cleanup)) = (self.item.as_mut(), self.cleanup.take()) {
            cleanup(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::SqliteConnectionFactory;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Numbers {
        path: PathBuf,
        cleaned: AtomicUsize,
    }

    impl TableEnumerator for Numbers {
        type Item = i64;

        fn connection(&self) -> Box<dyn Connection> {
            Box::new(SqliteConnectionFactory::new(&self.path).connection())
        }

        fn enumeration_command(&self) -> Command {
            Command::new("SELECT n FROM numbers ORDER BY n")
        }

        fn materialize(&self, row: Row) -> Result<i64> {
            row.integer(0)
        }

        fn cleanup(&self, _item: &mut i64) {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn numbers(dir: &tempfile::TempDir, count: i64) -> Arc<Numbers> {
        let path = dir.path().join("n.db");
        let token = CancellationToken::new();
        let mut conn = SqliteConnectionFactory::new(&path).connection();
        conn.open(&token).await.unwrap();
        conn.execute(&Command::new("CREATE TABLE numbers (n INTEGER)"), &token).await.unwrap();
        for n in 0..count {
            conn.execute(&Command::new(format!("INSERT INTO numbers VALUES ({n})")), &token)
                .await
                .unwrap();
        }
        Arc::new(Numbers {
            path,
            cleaned: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_yields_in_order_and_cleans_each_item() {
        let dir = tempfile::tempdir().unwrap();
        let table = numbers(&dir, 5).await;

        let mut seen = Vec::new();
        let mut sweep = Arc::clone(&table).enumerate(CancellationToken::new());
        while let Some(item) = sweep.next().await {
            let item = item.unwrap();
            seen.push(*item);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(table.cleaned.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_abandoned_sweep_cleans_what_was_yielded() {
        let dir = tempfile::tempdir().unwrap();
        let table = numbers(&dir, 10).await;

        let mut sweep = Arc::clone(&table).enumerate(CancellationToken::new());
        let first = sweep.next().await.unwrap().unwrap();
        let second = sweep.next().await.unwrap().unwrap();
        drop(sweep);
        drop(first);
        assert_eq!(table.cleaned.load(Ordering::SeqCst), 1);

        assert_eq!(second.into_inner(), 1);
        assert_eq!(table.cleaned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_is_lazy_until_polled() {
        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(Numbers {
            path: dir.path().join("missing").join("nope.db"),
            cleaned: AtomicUsize::new(0),
        });

        // no connection is attempted until the first poll
        let mut sweep = table.enumerate(CancellationToken::new());
        assert!(sweep.next().await.unwrap().is_err());
        assert!(sweep.next().await.is_none());
    }
}
