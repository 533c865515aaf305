//! Error types for sqlward operations.

use std::fmt;

/// The primary error type for all sqlward operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (open, close)
    Connection(ConnectionError),
    /// Statement preparation and execution errors
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction protocol errors
    Transaction(TransactionError),
    /// Resource pool errors
    Pool(PoolError),
    /// Schema create/migrate errors
    Schema(SchemaError),
    /// A commit/rollback hook failed during transaction ending
    Hook(HookError),
    /// I/O errors
    Io(std::io::Error),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to open the database
    Connect,
    /// Connection has been closed
    Closed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    /// Raw engine result code, when one was produced
    pub code: Option<i32>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, check)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied (read-only connection, auth)
    Permission,
    /// Database is locked or busy
    Busy,
    /// API misuse reported by the engine
    Misuse,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

/// Transaction protocol violations.
///
/// These are detected before any physical statement executes, so a failed
/// check leaves no partial side effects.
#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Write attempted on a read-only scope or non-write-capable connection
    AccessViolation,
    /// An exclusive transaction was requested while one is already active
    NestingViolation,
    /// Operation requires an active transaction and none is open
    NotActive,
    /// Control-flow signal raised by `Scope::rollback`, carrying the depth of
    /// the scope that requested it so the matching boundary can intercept it
    RollbackRequested { scope: usize },
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Pool has been closed; no further borrows
    Closed,
}

#[derive(Debug)]
pub struct SchemaError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// A failure raised while a transaction was ending (a hook threw, or the
/// physical commit/rollback itself failed).
///
/// When the transaction body had already failed, both failures are preserved:
/// `error` is the failure raised during ending, `body` the error that was
/// already propagating out of the body. Neither is discarded.
#[derive(Debug)]
pub struct HookError {
    /// What failed: "after_commit hook", "after_rollback hook", "commit",
    /// or "rollback"
    pub stage: &'static str,
    pub error: Box<Error>,
    pub body: Option<Box<Error>>,
}

impl Error {
    /// Shorthand for an access-control violation.
    pub fn access_violation(message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind: TransactionErrorKind::AccessViolation,
            message: message.into(),
        })
    }

    /// Shorthand for a nesting violation.
    pub fn nesting_violation(message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind: TransactionErrorKind::NestingViolation,
            message: message.into(),
        })
    }

    /// Is this an access-control violation?
    pub fn is_access_violation(&self) -> bool {
        matches!(
            self,
            Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AccessViolation,
                ..
            })
        )
    }

    /// Is this a nesting violation?
    pub fn is_nesting_violation(&self) -> bool {
        matches!(
            self,
            Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NestingViolation,
                ..
            })
        )
    }

    /// If this is a rollback signal, the depth of the scope that raised it.
    pub fn rollback_scope(&self) -> Option<usize> {
        match self {
            Error::Transaction(TransactionError {
                kind: TransactionErrorKind::RollbackRequested { scope },
                ..
            }) => Some(*scope),
            _ => None,
        }
    }

    /// Is this a busy/locked error where a retry may succeed?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Query(QueryError {
                kind: QueryErrorKind::Busy,
                ..
            })
        )
    }

    /// Get the SQL that caused this error, if available.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(code) = e.code {
                    write!(f, "Query error (code {}): {}", code, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Hook(e) => write!(f, "{}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed during transaction ending: {}", self.stage, self.error)?;
        if let Some(body) = &self.body {
            write!(f, " (while handling: {})", body)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Schema(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Hook(e) => Some(e.error.as_ref()),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected {}, found {}", self.expected, self.actual)
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<HookError> for Error {
    fn from(err: HookError) -> Self {
        Error::Hook(err)
    }
}

/// Result type alias for sqlward operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_scope_extraction() {
        let signal = Error::Transaction(TransactionError {
            kind: TransactionErrorKind::RollbackRequested { scope: 2 },
            message: "rollback requested".to_string(),
        });
        assert_eq!(signal.rollback_scope(), Some(2));

        let other = Error::access_violation("write inside read scope");
        assert_eq!(other.rollback_scope(), None);
        assert!(other.is_access_violation());
    }

    #[test]
    fn hook_error_preserves_both_failures() {
        let hook = HookError {
            stage: "after_rollback hook",
            error: Box::new(Error::Custom("hook exploded".to_string())),
            body: Some(Box::new(Error::Custom("body failed first".to_string()))),
        };
        let err = Error::Hook(hook);
        let rendered = err.to_string();
        assert!(rendered.contains("hook exploded"));
        assert!(rendered.contains("body failed first"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn retryable_flags() {
        let busy = Error::Query(QueryError {
            kind: QueryErrorKind::Busy,
            sql: Some("UPDATE t SET x = 1".to_string()),
            code: Some(5),
            message: "database is locked".to_string(),
        });
        assert!(busy.is_retryable());
        assert_eq!(busy.sql(), Some("UPDATE t SET x = 1"));

        let nesting = Error::nesting_violation("already in a transaction");
        assert!(!nesting.is_retryable());
        assert!(nesting.is_nesting_violation());
    }
}
