//! Pooled, transactional runtime for embedded SQLite.
//!
//! sqlward sits between application code and SQLite and takes care of three
//! things:
//!
//! - **Connections**: one write-capable connection serializes all writes;
//!   a pool of read-only connections serves concurrent reads. Borrowing
//!   blocks until a connection is free and release is guaranteed by drop.
//! - **Transactions**: nested scopes with correct commit/rollback
//!   propagation, read/write exclusivity enforced before anything physical
//!   happens, and `after_commit` / `after_rollback` hooks.
//! - **Statements**: a per-connection prepared-statement cache keyed by
//!   caller-assigned identifiers, with overlap-safe checkout.
//!
//! ```no_run
//! use sqlward::{DriverConfig, SqliteDriver, Transacter};
//! use std::sync::Arc;
//!
//! fn main() -> sqlward::Result<()> {
//!     let driver = Arc::new(SqliteDriver::open(DriverConfig::file("app.db"))?);
//!     driver.execute(None, "CREATE TABLE IF NOT EXISTS note (body TEXT)", &[])?;
//!
//!     let transacter = Transacter::new(driver);
//!     transacter.write(|scope| {
//!         scope.execute(None, "INSERT INTO note (body) VALUES (?)", &["hi".into()])?;
//!         scope.after_commit(|| {
//!             println!("note saved");
//!             Ok(())
//!         })
//!     })?;
//!
//!     let notes = transacter.read_with_result(|scope| {
//!         scope.query(None, "SELECT body FROM note", &[])
//!     })?;
//!     println!("{} notes", notes.len());
//!     Ok(())
//! }
//! ```

pub use sqlward_core::{
    ColumnInfo, DataChangedListener, Error, FromValue, HookError, QueryError, QueryErrorKind,
    Result, Row, SchemaError, TransactionError, TransactionErrorKind, Value,
};
pub use sqlward_pool::{Borrowed, ResourcePool};
pub use sqlward_sqlite::{
    ConnectionConfig, Cursor, DriverConfig, Schema, Scope, SqliteDriver, Statement,
    ThreadConnection, Transacter, TransactionInfo,
};
