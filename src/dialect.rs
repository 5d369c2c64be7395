//! SQL dialects and the compiled statement set
//!
//! The dialect is picked from configuration once, when a manager is built.
//! The table name is substituted into every template at that point and never
//! again; it must come from trusted configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Placeholder replaced by the table name in every template
const TABLE: &str = "{table}";

const COLUMNS: &str = "Id, UserID, Data, Created, LastModified";

/// SQL dialect family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// ANSI-style engines using a trailing `LIMIT 1` (SQLite, PostgreSQL, MySQL)
    #[default]
    Generic,
    /// SQL Server family using `SELECT TOP 1`
    SqlServer,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Generic => "generic",
            Dialect::SqlServer => "sqlserver",
        }
    }

    /// Build a single-row select over the descriptor columns
    fn select_one(&self, predicate: &str) -> String {
        match self {
            Dialect::SqlServer => {
                format!("SELECT TOP 1 {COLUMNS} FROM {TABLE} WHERE {predicate}")
            }
            Dialect::Generic => {
                format!("SELECT {COLUMNS} FROM {TABLE} WHERE {predicate} LIMIT 1")
            }
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "generic" | "ansi" | "sqlite" | "postgres" | "mysql" => Ok(Dialect::Generic),
            "sqlserver" | "mssql" => Ok(Dialect::SqlServer),
            other => Err(Error::Config(format!("unknown SQL dialect: {other}"))),
        }
    }
}

/// The full statement set for one table, compiled for one dialect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statements {
    pub dialect: Dialect,
    pub table: String,
    /// Insert guarded by `NOT EXISTS`, so an id collision affects zero rows
    pub insert: String,
    pub select_by_owner: String,
    pub select_by_id: String,
    pub update_data: String,
    pub delete_by_id: String,
    pub delete_older_than: String,
    pub select_all: String,
    pub count: String,
}

impl Statements {
    /// Compile every template for `dialect` against `table`.
    ///
    /// Fails when the table name is not a plain identifier.
    pub fn compile(dialect: Dialect, table: &str) -> Result<Self> {
        validate_table_name(table)?;

        let insert = format!(
            "INSERT INTO {TABLE} ({COLUMNS}) \
             SELECT @Id, @UserID, @Data, @Created, @LastModified \
             WHERE NOT EXISTS (SELECT 1 FROM {TABLE} WHERE Id = @Id)"
        );
        let update_data =
            format!("UPDATE {TABLE} SET Data = @Data, LastModified = @LastModified WHERE Id = @Id");

        let subst = |template: &str| template.replace(TABLE, table);

        Ok(Self {
            dialect,
            table: table.to_string(),
            insert: subst(&insert),
            select_by_owner: subst(&dialect.select_one("UserID = @UserID")),
            select_by_id: subst(&dialect.select_one("Id = @Id")),
            update_data: subst(&update_data),
            delete_by_id: subst(&format!("DELETE FROM {TABLE} WHERE Id = @Id")),
            delete_older_than: subst(&format!("DELETE FROM {TABLE} WHERE Created < @Cutoff")),
            select_all: subst(&format!("SELECT {COLUMNS} FROM {TABLE}")),
            count: subst(&format!("SELECT COUNT(*) FROM {TABLE}")),
        })
    }
}

/// Table names are spliced into SQL text, so only plain identifiers pass.
pub fn validate_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table.len() <= 128
        && !table.starts_with(|c: char| c.is_ascii_digit())
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid table name: {table:?}")))
    }
}
