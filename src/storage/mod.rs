//! Storage Layer - schema bootstrap for the descriptor table
//!
//! One table per manager:
//! - `<table>(Id, UserID, Data, Created, LastModified)`

pub mod schema;

pub use schema::{create_table_statements, ensure_schema};
