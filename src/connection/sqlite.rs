//! SQLite connection implementation
//!
//! rusqlite is synchronous, so every round-trip runs on the blocking pool
//! with the connection behind a mutex. Cancellation interrupts the running
//! statement through SQLite's interrupt handle.

use super::{Connection, ConnectionFactory, IsolationLevel, RowStream};
use crate::command::{format_datetime, Command, Row, Value};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::{InterruptHandle, Statement};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds [`SqliteConnection`]s for one database file
#[derive(Debug, Clone)]
pub struct SqliteConnectionFactory {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteConnectionFactory {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// How long a writer waits on a locked database before failing
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection(&self) -> SqliteConnection {
        SqliteConnection::new(self.path.clone(), self.busy_timeout)
    }
}

impl From<SqliteConnectionFactory> for ConnectionFactory {
    fn from(factory: SqliteConnectionFactory) -> Self {
        ConnectionFactory::new(move || Box::new(factory.connection()) as Box<dyn Connection>)
    }
}

/// A single SQLite connection, unopened until [`Connection::open`]
pub struct SqliteConnection {
    path: PathBuf,
    busy_timeout: Duration,
    conn: Option<Arc<Mutex<rusqlite::Connection>>>,
    interrupt: Option<Arc<InterruptHandle>>,
    in_transaction: bool,
}

impl SqliteConnection {
    fn new(path: PathBuf, busy_timeout: Duration) -> Self {
        Self {
            path,
            busy_timeout,
            conn: None,
            interrupt: None,
            in_transaction: false,
        }
    }

    fn handle(&self) -> Result<Arc<Mutex<rusqlite::Connection>>> {
        self.conn
            .clone()
            .ok_or_else(|| Error::invalid("connection is not open"))
    }

    fn dispatch<T, F>(&self, f: F) -> Result<JoinHandle<Result<T>>>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.handle()?;
        Ok(tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        }))
    }

    /// Run one round-trip on the blocking pool
    async fn run<T, F>(&self, cancel: &CancellationToken, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let task = self.dispatch(f)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if let Some(interrupt) = &self.interrupt {
                    interrupt.interrupt();
                }
                Err(Error::Cancelled)
            }
            res = task => res?,
        }
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    fn type_name(&self) -> &'static str {
        "sqlite"
    }

    async fn open(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }

        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let open = tokio::task::spawn_blocking(move || -> Result<rusqlite::Connection> {
            let conn = rusqlite::Connection::open(&path)?;
            conn.busy_timeout(busy_timeout)?;
            // An open enumeration cursor must not block writers on other connections.
            let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            if !mode.eq_ignore_ascii_case("wal") {
                tracing::debug!("SQLite kept journal mode {} for {}", mode, path.display());
            }
            Ok(conn)
        });

        let conn = super::cancellable(cancel, async { open.await? }).await?;
        tracing::trace!("Opened SQLite connection to {}", self.path.display());
        self.interrupt = Some(Arc::new(conn.get_interrupt_handle()));
        self.conn = Some(Arc::new(Mutex::new(conn)));
        Ok(())
    }

    async fn begin(&mut self, level: IsolationLevel, cancel: &CancellationToken) -> Result<()> {
        if self.in_transaction {
            return Err(Error::invalid("transaction already open on this connection"));
        }
        // SQLite transactions are serializable; IMMEDIATE takes the write lock up front.
        let sql = match level {
            IsolationLevel::Serializable => "BEGIN IMMEDIATE",
            IsolationLevel::RepeatableRead => "BEGIN DEFERRED",
        };
        self.run(cancel, move |conn| Ok(conn.execute_batch(sql)?)).await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn execute(&mut self, command: &Command, cancel: &CancellationToken) -> Result<u64> {
        let command = command.clone();
        self.run(cancel, move |conn| {
            let mut stmt = conn.prepare_cached(command.sql())?;
            bind_params(&mut stmt, &command)?;
            Ok(stmt.raw_execute()? as u64)
        })
        .await
    }

    async fn query_one(&mut self, command: &Command, cancel: &CancellationToken) -> Result<Option<Row>> {
        let command = command.clone();
        self.run(cancel, move |conn| {
            let mut stmt = conn.prepare_cached(command.sql())?;
            bind_params(&mut stmt, &command)?;
            let columns = stmt.column_count();
            let mut rows = stmt.raw_query();
            let row = match rows.next()? {
                Some(row) => Some(read_row(row, columns)?),
                None => None,
            };
            Ok(row)
        })
        .await
    }

    async fn commit(&mut self, cancel: &CancellationToken) -> Result<()> {
        if !self.in_transaction {
            return Err(Error::invalid("no open transaction to commit"));
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        // Once dispatched, COMMIT runs to completion and its outcome is reported as is.
        let task = self.dispatch(|conn| Ok(conn.execute_batch("COMMIT")?))?;
        task.await??;
        self.in_transaction = false;
        Ok(())
    }

    fn into_rows(self: Box<Self>, command: Command, cancel: CancellationToken) -> RowStream {
        let (tx, rx) = mpsc::channel::<Result<Row>>(1);

        match self.handle() {
            Ok(conn) => {
                tokio::task::spawn_blocking(move || {
                    let guard = conn.lock();
                    if let Err(e) = stream_rows(&guard, &command, &cancel, &tx) {
                        let _ = tx.blocking_send(Err(e));
                    }
                });
            }
            Err(e) => {
                let _ = tx.try_send(Err(e));
            }
        }

        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        if !self.in_transaction {
            return;
        }
        // A busy lock means a cancelled round-trip still runs; closing the
        // connection after it finishes rolls back instead.
        if let Some(guard) = self.conn.as_ref().and_then(|c| c.try_lock()) {
            match guard.execute_batch("ROLLBACK") {
                Ok(()) => tracing::debug!("Rolled back uncommitted transaction"),
                Err(e) => tracing::debug!("Rollback on drop failed: {}", e),
            }
        }
    }
}

/// Producer side of [`Connection::into_rows`]; stops when the receiver goes away.
fn stream_rows(
    conn: &rusqlite::Connection,
    command: &Command,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<Result<Row>>,
) -> Result<()> {
    let mut stmt = conn.prepare(command.sql())?;
    bind_params(&mut stmt, command)?;
    let columns = stmt.column_count();
    let mut rows = stmt.raw_query();

    while let Some(row) = rows.next()? {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let row = read_row(row, columns)?;
        if tx.blocking_send(Ok(row)).is_err() {
            tracing::trace!("Row consumer dropped, stopping enumeration");
            break;
        }
    }
    Ok(())
}

fn bind_params(stmt: &mut Statement<'_>, command: &Command) -> Result<()> {
    for param in command.params() {
        match stmt.parameter_index(&param.name)? {
            Some(idx) => stmt.raw_bind_parameter(idx, &param.value)?,
            None => {
                return Err(Error::invalid(format!(
                    "parameter {} does not appear in the command text",
                    param.name
                )));
            }
        }
    }
    Ok(())
}

fn read_row(row: &rusqlite::Row<'_>, columns: usize) -> rusqlite::Result<Row> {
    let mut values = Vec::with_capacity(columns);
    for idx in 0..columns {
        let value = match row.get_ref(idx)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(n) => Value::Integer(n),
            ValueRef::Real(f) => Value::Text(f.to_string()),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
        };
        values.push(value);
    }
    Ok(Row::new(values))
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b.as_slice())),
            Value::DateTime(dt) => ToSqlOutput::from(format_datetime(dt)),
            Value::Integer(n) => ToSqlOutput::from(*n),
        })
    }
}
