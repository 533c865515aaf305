//! A physical SQLite connection owned by one thread at a time.
//!
//! [`ThreadConnection`] wraps one `sqlite3` handle together with the two
//! pieces of per-connection state the runtime needs: a prepared-statement
//! cache keyed by caller-supplied identifiers, and the stack of open
//! transaction scopes. The pool hands a connection to exactly one thread at a
//! time, so neither structure needs its own lock; `&mut self` is the
//! synchronization.

use crate::ffi;
use crate::statement::{Cursor, Statement, db_error};
use sqlward_core::{
    ConnectionError, ConnectionErrorKind, Error, Result, Row, TransactionError,
    TransactionErrorKind, Value,
};
use std::collections::HashMap;
use std::ffi::{CString, c_int};
use std::ptr;

/// Callback registered with `after_commit` / `after_rollback`.
pub type Hook = Box<dyn FnOnce() -> Result<()> + Send>;

/// How to open a physical connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub path: String,
    /// Open with the engine's read-only flag; write statements fail at the
    /// engine level in addition to the runtime's own access checks.
    pub read_only: bool,
    /// Create the database file if it does not exist.
    pub create: bool,
    /// How long the engine retries a locked database before reporting busy.
    pub busy_timeout_ms: u32,
}

impl ConnectionConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            read_only: false,
            create: true,
            busy_timeout_ms: 5_000,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn busy_timeout_ms(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }
}

/// A cached statement is either parked and reusable, or checked out by one
/// in-flight operation. The `InUse` marker records the handle identity of the
/// checked-out statement so return can tell it apart from a fresh overflow
/// statement prepared for the same identifier.
enum CacheSlot {
    Idle(Statement),
    InUse(usize),
}

/// One open transaction scope.
struct TransactionFrame {
    read_only: bool,
    after_commit: Vec<Hook>,
    after_rollback: Vec<Hook>,
}

/// Snapshot of the innermost open scope, for callers that only need to ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionInfo {
    /// 1-based nesting depth.
    pub depth: usize,
    pub read_only: bool,
}

/// One physical connection plus its statement cache and transaction stack.
pub struct ThreadConnection {
    db: *mut ffi::sqlite3,
    path: String,
    write_capable: bool,
    statements: HashMap<i64, CacheSlot>,
    frames: Vec<TransactionFrame>,
}

// SAFETY: the pool moves a ThreadConnection between threads but never shares
// it; all access goes through &mut self on the borrowing thread.
unsafe impl Send for ThreadConnection {}

impl ThreadConnection {
    /// Open a physical connection per `config`.
    pub fn open(config: &ConnectionConfig) -> Result<Self> {
        let c_path = CString::new(config.path.as_str()).map_err(|_| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!("database path contains null byte: {:?}", config.path),
                source: None,
            })
        })?;

        let mut flags = if config.read_only {
            ffi::SQLITE_OPEN_READONLY
        } else if config.create {
            ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE
        } else {
            ffi::SQLITE_OPEN_READWRITE
        };
        flags |= ffi::SQLITE_OPEN_URI;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        // SAFETY: c_path is a valid C string; db receives the handle
        let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags, ptr::null()) };

        if rc != ffi::SQLITE_OK {
            let message = if db.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                let err = db_error(db, None);
                // SAFETY: open returned a handle even on failure; it must
                // still be closed
                unsafe {
                    ffi::sqlite3_close_v2(db);
                }
                err.to_string()
            };
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!("failed to open {:?}: {}", config.path, message),
                source: None,
            }));
        }

        // SAFETY: db is a valid open handle
        unsafe {
            ffi::sqlite3_busy_timeout(db, config.busy_timeout_ms as c_int);
        }

        tracing::debug!(path = %config.path, read_only = config.read_only, "connection opened");

        Ok(Self {
            db,
            path: config.path.clone(),
            write_capable: !config.read_only,
            statements: HashMap::new(),
            frames: Vec::new(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the engine will accept mutating statements on this handle.
    pub fn is_write_capable(&self) -> bool {
        self.write_capable
    }

    pub(crate) fn raw_db(&self) -> *mut ffi::sqlite3 {
        self.db
    }

    /// Rows changed by the most recent mutating statement.
    pub fn changes(&self) -> u64 {
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_changes(self.db) as u64 }
    }

    /// Rowid of the most recent successful insert.
    pub fn last_insert_rowid(&self) -> i64 {
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_last_insert_rowid(self.db) }
    }

    /// Run one statement outside the cache, without parameters or access
    /// checks. Used for transaction control and pragmas.
    pub(crate) fn execute_raw(&mut self, sql: &str) -> Result<()> {
        let mut stmt = Statement::prepare(self.db, sql)?;
        stmt.step_to_done()
    }

    /// Read `PRAGMA user_version`.
    pub fn user_version(&mut self) -> Result<i64> {
        let mut stmt = Statement::prepare(self.db, "PRAGMA user_version")?;
        let mut cursor = Cursor::new(&mut stmt);
        if cursor.next()? {
            cursor.get(0)?.as_i64().ok_or_else(|| {
                Error::Custom("PRAGMA user_version returned a non-integer".to_string())
            })
        } else {
            Ok(0)
        }
    }

    /// Stamp `PRAGMA user_version`.
    pub fn set_user_version(&mut self, version: i64) -> Result<()> {
        self.execute_raw(&format!("PRAGMA user_version = {}", version))
    }

    // ---- statement cache -------------------------------------------------

    /// Check a statement out for `identifier`, or prepare a fresh one.
    ///
    /// A cached idle statement is moved out of the cache for the duration of
    /// the access, so two overlapping operations on the same identifier can
    /// never observe the same statement; the second gets a fresh one.
    pub fn get_statement(&mut self, identifier: Option<i64>, sql: &str) -> Result<Statement> {
        let Some(id) = identifier else {
            return Statement::prepare(self.db, sql);
        };

        match self.statements.remove(&id) {
            Some(CacheSlot::Idle(stmt)) => {
                self.statements.insert(id, CacheSlot::InUse(stmt.handle_id()));
                Ok(stmt)
            }
            // Slot is checked out; overflow with an uncached statement.
            Some(marker @ CacheSlot::InUse(_)) => {
                self.statements.insert(id, marker);
                Statement::prepare(self.db, sql)
            }
            None => {
                let stmt = Statement::prepare(self.db, sql)?;
                self.statements.insert(id, CacheSlot::InUse(stmt.handle_id()));
                Ok(stmt)
            }
        }
    }

    /// Return a statement obtained from [`get_statement`].
    ///
    /// If the cache slot for `identifier` is waiting for exactly this
    /// statement it is reset and parked idle; any other statement (no
    /// identifier, overflow, evicted slot) is finalized on the spot.
    ///
    /// [`get_statement`]: Self::get_statement
    pub fn end_statement_access(&mut self, identifier: Option<i64>, mut stmt: Statement) {
        if let Some(id) = identifier {
            if let Some(CacheSlot::InUse(handle)) = self.statements.get(&id) {
                if *handle == stmt.handle_id() {
                    stmt.reset();
                    self.statements.insert(id, CacheSlot::Idle(stmt));
                    return;
                }
            }
        }
        if let Err(err) = stmt.finalize() {
            tracing::warn!(error = %err, "failed to finalize statement");
        }
    }

    // ---- execute / query -------------------------------------------------

    fn assert_writable(&self, what: &str) -> Result<()> {
        if !self.write_capable {
            return Err(Error::access_violation(format!(
                "{} requires a write-capable connection",
                what
            )));
        }
        if self.frames.last().is_some_and(|f| f.read_only) {
            return Err(Error::access_violation(format!(
                "{} inside a read-only transaction scope",
                what
            )));
        }
        Ok(())
    }

    /// Run a mutating statement. Returns the number of rows changed.
    ///
    /// The access check runs before any statement is prepared, so a rejected
    /// write leaves no side effects.
    pub fn execute(&mut self, identifier: Option<i64>, sql: &str, params: &[Value]) -> Result<u64> {
        self.assert_writable("write statement")?;
        let mut stmt = self.get_statement(identifier, sql)?;
        let result = stmt.bind(params).and_then(|()| stmt.step_to_done());
        self.end_statement_access(identifier, stmt);
        result?;
        Ok(self.changes())
    }

    /// Run a query, handing the open cursor to `body`.
    ///
    /// The cursor borrows the statement, so `body` cannot outlive the access;
    /// the statement goes back to the cache on every exit path.
    pub fn execute_query<R>(
        &mut self,
        identifier: Option<i64>,
        sql: &str,
        params: &[Value],
        body: impl FnOnce(&mut Cursor<'_>) -> Result<R>,
    ) -> Result<R> {
        let mut stmt = self.get_statement(identifier, sql)?;
        let result = stmt.bind(params).and_then(|()| {
            let mut cursor = Cursor::new(&mut stmt);
            body(&mut cursor)
        });
        self.end_statement_access(identifier, stmt);
        result
    }

    /// Run a query and collect every row.
    pub fn query(&mut self, identifier: Option<i64>, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.execute_query(identifier, sql, params, |cursor| {
            let mut rows = Vec::new();
            while cursor.next()? {
                rows.push(cursor.row()?);
            }
            Ok(rows)
        })
    }

    // ---- transaction stack -----------------------------------------------

    /// Open a transaction scope. Returns its 1-based depth.
    ///
    /// The outermost scope begins a physical transaction (IMMEDIATE for
    /// writes so the writer lock is taken up front, DEFERRED for reads);
    /// nested scopes only push a frame. Access checks run before anything
    /// physical happens.
    pub fn begin_transaction(&mut self, read_only: bool) -> Result<usize> {
        if !read_only {
            if !self.write_capable {
                return Err(Error::access_violation(
                    "write transaction on a read-only connection",
                ));
            }
            if self.frames.iter().any(|f| f.read_only) {
                return Err(Error::access_violation(
                    "write transaction inside a read-only transaction scope",
                ));
            }
        }

        if self.frames.is_empty() {
            let begin = if read_only {
                "BEGIN DEFERRED"
            } else {
                "BEGIN IMMEDIATE"
            };
            self.execute_raw(begin)?;
        }

        self.frames.push(TransactionFrame {
            read_only,
            after_commit: Vec::new(),
            after_rollback: Vec::new(),
        });
        Ok(self.frames.len())
    }

    /// Close the innermost scope.
    ///
    /// The frame is popped before any physical work, so the connection's
    /// transaction state is already consistent if commit or rollback fails.
    /// Returns the hooks the caller must now dispatch: after-commit hooks
    /// when the outermost scope committed, this scope's after-rollback hooks
    /// when it rolled back, nothing when a nested scope committed (its
    /// after-commit hooks move to the enclosing scope).
    pub fn end_transaction(&mut self, successful: bool) -> Result<Vec<Hook>> {
        let frame = self.frames.pop().ok_or_else(|| {
            Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NotActive,
                message: "end_transaction without an active transaction".to_string(),
            })
        })?;

        if successful {
            if let Some(parent) = self.frames.last_mut() {
                // Nested commit is provisional until the outermost commits.
                parent.after_commit.extend(frame.after_commit);
                Ok(Vec::new())
            } else {
                self.execute_raw("COMMIT")?;
                Ok(frame.after_commit)
            }
        } else {
            if self.frames.is_empty() {
                self.execute_raw("ROLLBACK")?;
            }
            // An inner rollback does not roll back enclosing scopes, but its
            // own after-rollback hooks fire now.
            Ok(frame.after_rollback)
        }
    }

    /// Register a hook on the innermost open scope.
    pub fn register_after_commit(&mut self, hook: Hook) -> Result<()> {
        self.innermost_frame("after_commit")?.after_commit.push(hook);
        Ok(())
    }

    /// Register a hook on the innermost open scope.
    pub fn register_after_rollback(&mut self, hook: Hook) -> Result<()> {
        self.innermost_frame("after_rollback")?
            .after_rollback
            .push(hook);
        Ok(())
    }

    fn innermost_frame(&mut self, what: &str) -> Result<&mut TransactionFrame> {
        self.frames.last_mut().ok_or_else(|| {
            Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NotActive,
                message: format!("{} requires an active transaction", what),
            })
        })
    }

    /// The innermost open scope, if any.
    pub fn current_transaction(&self) -> Option<TransactionInfo> {
        self.frames.last().map(|f| TransactionInfo {
            depth: self.frames.len(),
            read_only: f.read_only,
        })
    }

    pub fn in_transaction(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Finalize every cached statement, logging failures.
    ///
    /// Used before discarding a connection that served only a transient
    /// purpose (schema bootstrap); finalization failures never block
    /// teardown.
    pub fn clean_up(&mut self) {
        for (id, slot) in self.statements.drain() {
            match slot {
                CacheSlot::Idle(stmt) => {
                    if let Err(err) = stmt.finalize() {
                        tracing::warn!(identifier = id, error = %err, "failed to finalize cached statement");
                    }
                }
                CacheSlot::InUse(_) => {
                    tracing::warn!(identifier = id, "cached statement still in use during cleanup");
                }
            }
        }
    }
}

impl Drop for ThreadConnection {
    fn drop(&mut self) {
        self.clean_up();
        if !self.db.is_null() {
            // SAFETY: db is valid; close_v2 defers if statements are still
            // outstanding rather than erroring
            unsafe {
                ffi::sqlite3_close_v2(self.db);
            }
            self.db = ptr::null_mut();
        }
    }
}
