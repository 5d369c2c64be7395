//! Database schema definitions
//!
//! The manager never creates its table; hosts and tests call
//! [`ensure_schema`] at startup when they own the database.

use crate::command::Command;
use crate::connection::ConnectionFactory;
use crate::dialect::{validate_table_name, Dialect};
use crate::Result;
use tokio_util::sync::CancellationToken;

/// Descriptor table for ANSI-style engines.
///
/// Timestamps are fixed-width UTC text, so text comparison orders them.
const CREATE_TABLE_GENERIC: &str = r#"
CREATE TABLE IF NOT EXISTS {table} (
    Id VARCHAR({key}) NOT NULL PRIMARY KEY,
    UserID VARCHAR({key}) NOT NULL,
    Data BLOB,
    Created CHAR(30) NOT NULL,
    LastModified CHAR(30) NOT NULL
)
"#;

const CREATE_TABLE_SQLSERVER: &str = r#"
IF OBJECT_ID(N'{table}', N'U') IS NULL
CREATE TABLE {table} (
    Id NVARCHAR({key}) NOT NULL PRIMARY KEY,
    UserID NVARCHAR({key}) NOT NULL,
    Data VARBINARY({data}) NULL,
    Created DATETIME2 NOT NULL,
    LastModified DATETIME2 NOT NULL
)
"#;

fn create_index(dialect: Dialect, unique: bool, name: &str, table: &str, column: &str) -> String {
    let unique = if unique { "UNIQUE " } else { "" };
    match dialect {
        Dialect::Generic => {
            format!("CREATE {unique}INDEX IF NOT EXISTS {name} ON {table}({column})")
        }
        Dialect::SqlServer => format!(
            "IF NOT EXISTS (SELECT 1 FROM sys.indexes WHERE name = N'{name}') \
             CREATE {unique}INDEX {name} ON {table}({column})"
        ),
    }
}

/// All schema creation statements for one descriptor table
pub fn create_table_statements(
    dialect: Dialect,
    table: &str,
    key_size: usize,
    max_data_size: usize,
    unique_owner: bool,
) -> Result<Vec<String>> {
    validate_table_name(table)?;

    let template = match dialect {
        Dialect::Generic => CREATE_TABLE_GENERIC,
        Dialect::SqlServer => CREATE_TABLE_SQLSERVER,
    };
    let create = template
        .replace("{table}", table)
        .replace("{key}", &key_size.to_string())
        .replace("{data}", &max_data_size.to_string());

    Ok(vec![
        create,
        create_index(dialect, unique_owner, &format!("IX_{table}_UserID"), table, "UserID"),
        create_index(dialect, false, &format!("IX_{table}_Created"), table, "Created"),
    ])
}

/// Create the descriptor table and its indexes if they do not exist
pub async fn ensure_schema(
    factory: &ConnectionFactory,
    dialect: Dialect,
    table: &str,
    key_size: usize,
    max_data_size: usize,
    unique_owner: bool,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let statements = create_table_statements(dialect, table, key_size, max_data_size, unique_owner)?;

    let mut conn = factory.create();
    conn.open(&cancel).await?;
    for sql in statements {
        conn.execute(&Command::new(sql), &cancel).await?;
    }
    tracing::debug!("Ensured schema for table {}", table);
    Ok(())
}
