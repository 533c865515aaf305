//! SQLite runtime for sqlward.
//!
//! This crate owns everything that touches the engine: opening connections,
//! the per-connection statement cache, the nested-transaction state machine,
//! pool routing between one writer and N readers, and the [`Transacter`]
//! API application code uses.
//!
//! ```no_run
//! use sqlward_sqlite::{DriverConfig, SqliteDriver, Transacter};
//! use std::sync::Arc;
//!
//! # fn main() -> sqlward_core::Result<()> {
//! let driver = Arc::new(SqliteDriver::open(DriverConfig::file("app.db"))?);
//! let transacter = Transacter::new(Arc::clone(&driver));
//!
//! transacter.write(|scope| {
//!     scope.execute(None, "INSERT INTO log (line) VALUES (?)", &["hello".into()])?;
//!     scope.after_commit(|| {
//!         println!("persisted");
//!         Ok(())
//!     })
//! })?;
//! # Ok(())
//! # }
//! ```

#![allow(unsafe_code)]

pub mod connection;
pub mod driver;
pub mod ffi;
pub mod statement;
pub mod transacter;
pub mod types;

pub use connection::{ConnectionConfig, Hook, ThreadConnection, TransactionInfo};
pub use driver::{DriverConfig, Schema, SqliteDriver};
pub use statement::{Cursor, Statement};
pub use transacter::{Scope, Transacter};
