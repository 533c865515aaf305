//! Core types for sqlward.
//!
//! This crate provides the foundational, engine-agnostic pieces of the
//! runtime:
//!
//! - the [`Error`] taxonomy and [`Result`] alias
//! - the dynamic [`Value`] type used for parameter binding and result reading
//! - [`Row`] / [`ColumnInfo`] result representation with typed access
//! - the [`DataChangedListener`] invalidation seam
//!
//! The SQLite driver itself lives in `sqlward-sqlite`; the resource pool in
//! `sqlward-pool`.

pub mod error;
pub mod listener;
pub mod row;
pub mod value;

pub use error::{
    ConnectionError, ConnectionErrorKind, Error, HookError, PoolError, PoolErrorKind, QueryError,
    QueryErrorKind, Result, SchemaError, TransactionError, TransactionErrorKind, TypeError,
};
pub use listener::DataChangedListener;
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
