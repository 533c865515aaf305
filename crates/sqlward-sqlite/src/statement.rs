//! Prepared statements and cursors.
//!
//! A [`Statement`] owns one `sqlite3_stmt` handle for its whole lifetime; the
//! connection's statement cache moves statements in and out of circulation
//! but never shares one between two in-flight operations. A [`Cursor`]
//! mutably borrows its statement, so a cursor is necessarily closed before
//! the statement can be reset or recycled.

use crate::ffi;
use crate::types;
use sqlward_core::{
    ColumnInfo, Error, QueryError, QueryErrorKind, Result, Row, TypeError, Value,
};
use std::ffi::{CStr, CString, c_int};
use std::ptr;
use std::sync::Arc;

/// A prepared statement bound to one connection.
pub struct Statement {
    raw: *mut ffi::sqlite3_stmt,
    db: *mut ffi::sqlite3,
    sql: String,
}

// SAFETY: a Statement is only reachable through its owning connection, which
// the pool hands to one thread at a time; the handle is never aliased.
unsafe impl Send for Statement {}

impl Statement {
    /// Prepare `sql` against `db`.
    ///
    /// # Safety contract (internal)
    /// `db` must be a valid open database handle that outlives the statement.
    pub(crate) fn prepare(db: *mut ffi::sqlite3, sql: &str) -> Result<Self> {
        let c_sql = CString::new(sql).map_err(|_| {
            Error::Query(QueryError {
                kind: QueryErrorKind::Syntax,
                sql: Some(sql.to_string()),
                code: None,
                message: "SQL contains null byte".to_string(),
            })
        })?;

        let mut raw: *mut ffi::sqlite3_stmt = ptr::null_mut();

        // SAFETY: all pointers are valid; length matches the C string
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(
                db,
                c_sql.as_ptr(),
                c_sql.as_bytes().len() as c_int,
                &mut raw,
                ptr::null_mut(),
            )
        };

        if rc != ffi::SQLITE_OK {
            return Err(db_error(db, Some(sql)));
        }

        Ok(Self {
            raw,
            db,
            sql: sql.to_string(),
        })
    }

    /// The SQL this statement was prepared from.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Number of bind parameters the statement declares.
    pub fn parameter_count(&self) -> usize {
        // SAFETY: raw is valid
        unsafe { ffi::sqlite3_bind_parameter_count(self.raw) as usize }
    }

    /// Bind `params` positionally, starting at parameter 1.
    pub fn bind(&mut self, params: &[Value]) -> Result<()> {
        for (i, param) in params.iter().enumerate() {
            // SAFETY: raw is valid, index is 1-based
            let rc = unsafe { types::bind_value(self.raw, (i + 1) as c_int, param) };
            if rc != ffi::SQLITE_OK {
                let mut err = db_error(self.db, Some(&self.sql));
                if let Error::Query(q) = &mut err {
                    q.message = format!("failed to bind parameter {}: {}", i + 1, q.message);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Advance the statement one step. `Ok(true)` means a row is available.
    pub(crate) fn step(&mut self) -> Result<bool> {
        // SAFETY: raw is valid
        let rc = unsafe { ffi::sqlite3_step(self.raw) };
        match rc {
            ffi::SQLITE_ROW => Ok(true),
            ffi::SQLITE_DONE => Ok(false),
            _ => Err(db_error(self.db, Some(&self.sql))),
        }
    }

    /// Run a non-query statement to completion.
    pub(crate) fn step_to_done(&mut self) -> Result<()> {
        while self.step()? {}
        Ok(())
    }

    /// Reset the statement and clear its bindings so it can be reused.
    pub(crate) fn reset(&mut self) {
        // sqlite3_reset re-reports the last step error, which has already
        // been surfaced to the caller; only the reset effect matters here.
        // SAFETY: raw is valid
        unsafe {
            ffi::sqlite3_reset(self.raw);
            ffi::sqlite3_clear_bindings(self.raw);
        }
    }

    /// Result column names, in order.
    pub(crate) fn column_names(&self) -> Vec<String> {
        // SAFETY: raw is valid
        let count = unsafe { ffi::sqlite3_column_count(self.raw) };
        (0..count)
            .map(|i| {
                // SAFETY: raw is valid, i is in range
                unsafe { types::column_name(self.raw, i) }.unwrap_or_else(|| format!("col{}", i))
            })
            .collect()
    }

    /// Destroy the statement, reporting the engine's verdict.
    ///
    /// Used by cleanup paths that want to log finalization failures; plain
    /// drops finalize silently.
    pub(crate) fn finalize(mut self) -> Result<()> {
        let raw = std::mem::replace(&mut self.raw, ptr::null_mut());
        let db = self.db;
        std::mem::forget(self);
        // SAFETY: raw was valid and is consumed exactly once
        let rc = unsafe { ffi::sqlite3_finalize(raw) };
        if rc != ffi::SQLITE_OK {
            return Err(db_error(db, None));
        }
        Ok(())
    }

    /// Identity of the underlying handle; used to observe cache reuse.
    pub fn handle_id(&self) -> usize {
        self.raw as usize
    }

    pub(crate) fn raw(&self) -> *mut ffi::sqlite3_stmt {
        self.raw
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            // SAFETY: raw is valid and dropped exactly once
            unsafe {
                ffi::sqlite3_finalize(self.raw);
            }
        }
    }
}

/// Streaming view over a statement's result rows.
///
/// Borrows the statement mutably for its whole life, so the statement cannot
/// be reset, recycled, or finalized while the cursor is open.
pub struct Cursor<'stmt> {
    stmt: &'stmt mut Statement,
    columns: Arc<ColumnInfo>,
    on_row: bool,
}

impl<'stmt> Cursor<'stmt> {
    pub(crate) fn new(stmt: &'stmt mut Statement) -> Self {
        let columns = Arc::new(ColumnInfo::new(stmt.column_names()));
        Self {
            stmt,
            columns,
            on_row: false,
        }
    }

    /// Advance to the next row. Returns `false` once the result is exhausted.
    pub fn next(&mut self) -> Result<bool> {
        self.on_row = self.stmt.step()?;
        Ok(self.on_row)
    }

    /// Shared column metadata for this result.
    pub fn columns(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Read one column of the current row.
    pub fn get(&self, index: usize) -> Result<Value> {
        self.require_row()?;
        if index >= self.columns.len() {
            return Err(Error::Type(TypeError {
                expected: "column index in range",
                actual: format!(
                    "index {} out of bounds ({} columns)",
                    index,
                    self.columns.len()
                ),
                column: None,
            }));
        }
        // SAFETY: the statement returned SQLITE_ROW and index is in range
        Ok(unsafe { types::read_column(self.stmt.raw(), index as c_int) })
    }

    /// Materialize the current row.
    pub fn row(&self) -> Result<Row> {
        self.require_row()?;
        let values = (0..self.columns.len())
            // SAFETY: the statement returned SQLITE_ROW and i is in range
            .map(|i| unsafe { types::read_column(self.stmt.raw(), i as c_int) })
            .collect();
        Ok(Row::with_columns(Arc::clone(&self.columns), values))
    }

    fn require_row(&self) -> Result<()> {
        if self.on_row {
            Ok(())
        } else {
            Err(Error::Query(QueryError {
                kind: QueryErrorKind::Misuse,
                sql: Some(self.stmt.sql().to_string()),
                code: None,
                message: "cursor is not positioned on a row".to_string(),
            }))
        }
    }
}

/// Build an error from the connection's last engine verdict.
pub(crate) fn db_error(db: *mut ffi::sqlite3, sql: Option<&str>) -> Error {
    // SAFETY: db is a valid open handle
    let (code, message) = unsafe {
        let code = ffi::sqlite3_errcode(db);
        let ptr = ffi::sqlite3_errmsg(db);
        let message = CStr::from_ptr(ptr).to_string_lossy().into_owned();
        (code, message)
    };

    Error::Query(QueryError {
        kind: error_code_to_kind(code),
        sql: sql.map(String::from),
        code: Some(code),
        message,
    })
}

pub(crate) fn error_code_to_kind(code: c_int) -> QueryErrorKind {
    match code & 0xff {
        ffi::SQLITE_CONSTRAINT => QueryErrorKind::Constraint,
        ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => QueryErrorKind::Busy,
        ffi::SQLITE_PERM | ffi::SQLITE_AUTH | ffi::SQLITE_READONLY => QueryErrorKind::Permission,
        ffi::SQLITE_NOTFOUND => QueryErrorKind::NotFound,
        ffi::SQLITE_MISUSE => QueryErrorKind::Misuse,
        _ => QueryErrorKind::Database,
    }
}
