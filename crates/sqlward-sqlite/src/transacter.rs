//! The public transaction API.
//!
//! A [`Transacter`] opens transaction scopes against a [`SqliteDriver`]. The
//! body of a transaction receives a [`Scope`], which carries the borrowed
//! connection explicitly; all statements, hook registrations, and nested
//! scopes go through it. There is no thread-local binding, so a transaction
//! cannot leak across threads and a scope cannot outlive its borrow: the
//! borrow checker enforces what the runtime would otherwise have to police.
//!
//! `rollback` aborts a scope by unwinding through the error channel with a
//! control-flow marker carrying the scope's depth; the matching boundary
//! intercepts the marker and turns it back into a normal return, while a
//! marker crossing a foreign boundary keeps propagating.

use crate::connection::{Hook, ThreadConnection, TransactionInfo};
use crate::driver::SqliteDriver;
use crate::statement::Cursor;
use sqlward_core::{
    Error, HookError, Result, Row, TransactionError, TransactionErrorKind, Value,
};
use std::sync::Arc;

/// Entry point for transactions against one driver.
///
/// Cloning is cheap; all clones share the driver's pools.
#[derive(Clone)]
pub struct Transacter {
    driver: Arc<SqliteDriver>,
}

impl Transacter {
    pub fn new(driver: Arc<SqliteDriver>) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &Arc<SqliteDriver> {
        &self.driver
    }

    /// Run `body` in a write-capable transaction.
    pub fn transaction(&self, body: impl FnOnce(&mut Scope<'_, ()>) -> Result<()>) -> Result<()> {
        self.run(false, body)
    }

    /// Run `body` in a write-capable transaction, returning its result.
    ///
    /// If the body aborts via [`Scope::rollback`], the value supplied to
    /// `rollback` becomes the return value.
    pub fn transaction_with_result<R>(
        &self,
        body: impl FnOnce(&mut Scope<'_, R>) -> Result<R>,
    ) -> Result<R> {
        self.run(false, body)
    }

    /// Run `body` in a read-only transaction. Write statements and nested
    /// write scopes fail with an access violation.
    pub fn read(&self, body: impl FnOnce(&mut Scope<'_, ()>) -> Result<()>) -> Result<()> {
        self.run(true, body)
    }

    pub fn read_with_result<R>(
        &self,
        body: impl FnOnce(&mut Scope<'_, R>) -> Result<R>,
    ) -> Result<R> {
        self.run(true, body)
    }

    /// Run `body` in a write transaction. Equivalent to [`transaction`];
    /// spelled out for symmetry with [`read`].
    ///
    /// [`transaction`]: Self::transaction
    /// [`read`]: Self::read
    pub fn write(&self, body: impl FnOnce(&mut Scope<'_, ()>) -> Result<()>) -> Result<()> {
        self.run(false, body)
    }

    pub fn write_with_result<R>(
        &self,
        body: impl FnOnce(&mut Scope<'_, R>) -> Result<R>,
    ) -> Result<R> {
        self.run(false, body)
    }

    fn run<R>(
        &self,
        read_only: bool,
        body: impl FnOnce(&mut Scope<'_, R>) -> Result<R>,
    ) -> Result<R> {
        let mut conn = self.driver.pool(read_only).borrow()?;
        // The connection goes back to the pool before listeners run, so a
        // listener that opens its own transaction does not deadlock on the
        // writer.
        let outcome = run_scope(&mut *conn, read_only, body);
        drop(conn);

        let (value, committed) = outcome?;
        if committed && !read_only {
            self.driver.notify_data_changed();
        }
        Ok(value)
    }
}

/// An open transaction scope.
///
/// The type parameter `R` is the value the enclosing transaction yields; it
/// is what [`rollback`](Self::rollback) carries out of the body.
pub struct Scope<'conn, R> {
    conn: &'conn mut ThreadConnection,
    depth: usize,
    rollback_value: Option<R>,
}

impl<'conn, R> Scope<'conn, R> {
    /// Run a mutating statement in this transaction.
    pub fn execute(&mut self, identifier: Option<i64>, sql: &str, params: &[Value]) -> Result<u64> {
        self.conn.execute(identifier, sql, params)
    }

    /// Run a query in this transaction, streaming rows to `body`.
    pub fn execute_query<T>(
        &mut self,
        identifier: Option<i64>,
        sql: &str,
        params: &[Value],
        body: impl FnOnce(&mut Cursor<'_>) -> Result<T>,
    ) -> Result<T> {
        self.conn.execute_query(identifier, sql, params, body)
    }

    /// Run a query in this transaction and collect every row.
    pub fn query(&mut self, identifier: Option<i64>, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.conn.query(identifier, sql, params)
    }

    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    pub fn changes(&self) -> u64 {
        self.conn.changes()
    }

    /// The innermost open scope on this connection.
    pub fn current_transaction(&self) -> Option<TransactionInfo> {
        self.conn.current_transaction()
    }

    /// Register a hook that runs after the outermost transaction commits.
    ///
    /// Hooks registered in a nested scope are held back until the outermost
    /// scope commits; they are discarded if any enclosing scope rolls back.
    pub fn after_commit(&mut self, hook: impl FnOnce() -> Result<()> + Send + 'static) -> Result<()> {
        self.conn.register_after_commit(Box::new(hook))
    }

    /// Register a hook that runs if this scope rolls back.
    ///
    /// Fires immediately when this scope rolls back, at any nesting depth;
    /// it does not fire when only a nested scope rolls back.
    pub fn after_rollback(&mut self, hook: impl FnOnce() -> Result<()> + Send + 'static) -> Result<()> {
        self.conn.register_after_rollback(Box::new(hook))
    }

    /// Abort this scope, yielding `value` from the transaction.
    ///
    /// Returns the control-flow marker the body must propagate:
    ///
    /// ```ignore
    /// return Err(scope.rollback(fallback));
    /// ```
    ///
    /// The transaction boundary intercepts the marker, rolls back, and
    /// returns `value` (for the `_with_result` variants) instead of an error.
    pub fn rollback(&mut self, value: R) -> Error {
        self.rollback_value = Some(value);
        Error::Transaction(TransactionError {
            kind: TransactionErrorKind::RollbackRequested { scope: self.depth },
            message: "rollback requested".to_string(),
        })
    }

    /// Open a nested scope inheriting this scope's read-only mode.
    ///
    /// A transaction is always active inside a scope, so passing
    /// `no_enclosing` fails with a nesting violation before the nested body
    /// runs.
    pub fn transaction<T>(
        &mut self,
        no_enclosing: bool,
        body: impl FnOnce(&mut Scope<'_, T>) -> Result<T>,
    ) -> Result<T> {
        if no_enclosing {
            return Err(Error::nesting_violation(
                "a transaction is already active on this connection",
            ));
        }
        let read_only = self
            .conn
            .current_transaction()
            .is_some_and(|t| t.read_only);
        run_scope(&mut *self.conn, read_only, body).map(|(value, _)| value)
    }

    /// Open a nested read-only scope.
    pub fn read<T>(&mut self, body: impl FnOnce(&mut Scope<'_, T>) -> Result<T>) -> Result<T> {
        run_scope(&mut *self.conn, true, body).map(|(value, _)| value)
    }

    /// Open a nested write scope. Fails with an access violation if any
    /// enclosing scope is read-only, before anything physical happens.
    pub fn write<T>(&mut self, body: impl FnOnce(&mut Scope<'_, T>) -> Result<T>) -> Result<T> {
        run_scope(&mut *self.conn, false, body).map(|(value, _)| value)
    }
}

/// How a scope body came out, before the transaction is ended.
enum Ending<R> {
    Commit(R),
    /// `rollback(value)` raised at this boundary.
    RollbackWithValue(R),
    /// Body error, or a rollback marker belonging to some other scope.
    Fail(Error),
}

/// Open a scope, run its body, end the transaction, dispatch hooks.
///
/// Returns the scope's value and whether it committed. Every failure path
/// still ends the transaction; a failure while ending is aggregated with the
/// body's own failure into a [`HookError`] so neither is lost.
fn run_scope<R>(
    conn: &mut ThreadConnection,
    read_only: bool,
    body: impl FnOnce(&mut Scope<'_, R>) -> Result<R>,
) -> Result<(R, bool)> {
    let depth = conn.begin_transaction(read_only)?;
    let mut scope = Scope {
        conn,
        depth,
        rollback_value: None,
    };

    let body_result = body(&mut scope);

    let Scope {
        conn,
        rollback_value,
        ..
    } = scope;

    let ending = match body_result {
        Ok(value) => Ending::Commit(value),
        Err(err) => match err.rollback_scope() {
            Some(scope_depth) if scope_depth == depth => match rollback_value {
                Some(value) => Ending::RollbackWithValue(value),
                // A marker for this depth without a stored value was not
                // produced by this scope's rollback; treat it as a failure.
                None => Ending::Fail(err),
            },
            _ => Ending::Fail(err),
        },
    };
    let successful = matches!(ending, Ending::Commit(_));

    let hooks = match conn.end_transaction(successful) {
        Ok(hooks) => hooks,
        Err(end_err) => {
            return Err(Error::Hook(HookError {
                stage: if successful { "commit" } else { "rollback" },
                error: Box::new(end_err),
                body: match ending {
                    Ending::Fail(body_err) => Some(Box::new(body_err)),
                    _ => None,
                },
            }));
        }
    };

    let hook_failure = dispatch_hooks(hooks);

    match (ending, hook_failure) {
        (Ending::Commit(value), None) => Ok((value, true)),
        (Ending::RollbackWithValue(value), None) => Ok((value, false)),
        (Ending::Fail(body_err), None) => Err(body_err),
        (ending, Some(hook_err)) => Err(Error::Hook(HookError {
            stage: if successful {
                "after_commit hook"
            } else {
                "after_rollback hook"
            },
            error: Box::new(hook_err),
            body: match ending {
                Ending::Fail(body_err) => Some(Box::new(body_err)),
                _ => None,
            },
        })),
    }
}

/// Run hooks in registration order. The first failure is kept for the
/// caller; later hooks still run, their failures logged.
fn dispatch_hooks(hooks: Vec<Hook>) -> Option<Error> {
    let mut first_failure = None;
    for hook in hooks {
        if let Err(err) = hook() {
            if first_failure.is_none() {
                first_failure = Some(err);
            } else {
                tracing::warn!(error = %err, "additional hook failure dropped");
            }
        }
    }
    first_failure
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverConfig;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn transacter() -> Transacter {
        let driver = Arc::new(SqliteDriver::open(DriverConfig::memory()).unwrap());
        driver
            .execute(None, "CREATE TABLE t (id INTEGER PRIMARY KEY, n INTEGER)", &[])
            .unwrap();
        Transacter::new(driver)
    }

    fn count(t: &Transacter) -> i64 {
        let rows = t.driver().query(None, "SELECT count(*) FROM t", &[]).unwrap();
        rows[0].get_as::<i64>(0).unwrap()
    }

    #[test]
    fn commit_persists_and_returns_result() {
        let t = transacter();
        let id = t
            .transaction_with_result(|scope| {
                scope.execute(None, "INSERT INTO t (n) VALUES (1)", &[])?;
                Ok(scope.last_insert_rowid())
            })
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(count(&t), 1);
    }

    #[test]
    fn body_error_rolls_back() {
        let t = transacter();
        let err = t
            .transaction(|scope| {
                scope.execute(None, "INSERT INTO t (n) VALUES (1)", &[])?;
                Err(Error::Custom("boom".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Custom(_)));
        assert_eq!(count(&t), 0);
    }

    #[test]
    fn rollback_yields_the_supplied_value() {
        let t = transacter();
        let result = t
            .transaction_with_result(|scope| {
                scope.execute(None, "INSERT INTO t (n) VALUES (1)", &[])?;
                Err(scope.rollback(42))
            })
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(count(&t), 0);
    }

    #[test]
    fn inner_rollback_value_does_not_abort_outer() {
        let t = transacter();
        let result = t
            .transaction_with_result(|scope| {
                scope.execute(None, "INSERT INTO t (n) VALUES (1)", &[])?;
                let inner: i32 = scope.transaction(false, |nested| {
                    nested.execute(None, "INSERT INTO t (n) VALUES (2)", &[])?;
                    Err(nested.rollback(-1))
                })?;
                assert_eq!(inner, -1);
                Ok(scope.changes())
            })
            .unwrap();
        assert_eq!(result, 1);
        // No savepoints: the inner insert was already applied physically, so
        // the outer commit decides both rows.
        assert_eq!(count(&t), 2);
    }

    #[test]
    fn no_enclosing_nested_fails_fast() {
        let t = transacter();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        t.transaction(|scope| {
            let err = scope
                .transaction::<()>(true, |_| {
                    ran2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap_err();
            assert!(err.is_nesting_violation());
            Ok(())
        })
        .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn write_inside_read_is_rejected_at_any_depth() {
        let t = transacter();
        let err = t
            .write(|scope| {
                scope.read(|nested| nested.write(|inner| inner.execute(None, "INSERT INTO t (n) VALUES (1)", &[]).map(|_| ())))
            })
            .unwrap_err();
        assert!(err.is_access_violation());
        assert_eq!(count(&t), 0);
    }

    #[test]
    fn after_commit_hooks_run_in_order_after_outermost_commit() {
        let t = transacter();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order2 = Arc::clone(&order);
        let order3 = Arc::clone(&order);
        t.transaction(move |scope| {
            let o = Arc::clone(&order2);
            scope.after_commit(move || {
                o.lock().unwrap().push("outer");
                Ok(())
            })?;
            scope.transaction(false, |nested| {
                let o = Arc::clone(&order3);
                nested.after_commit(move || {
                    o.lock().unwrap().push("inner");
                    Ok(())
                })
            })?;
            // Nothing has fired before the outermost commit.
            assert!(order2.lock().unwrap().is_empty());
            Ok(())
        })
        .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["outer", "inner"]);
    }

    #[test]
    fn inner_commit_hooks_die_with_outer_rollback() {
        let t = transacter();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);

        let result: i32 = t
            .transaction_with_result(move |scope| {
                scope.transaction(false, |nested| {
                    let f = Arc::clone(&fired2);
                    nested.after_commit(move || {
                        f.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                })?;
                Err(scope.rollback(0))
            })
            .unwrap();
        assert_eq!(result, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn after_rollback_fires_at_the_rolling_scope_only() {
        let t = transacter();
        let outer_fired = Arc::new(AtomicUsize::new(0));
        let inner_fired = Arc::new(AtomicUsize::new(0));

        let of = Arc::clone(&outer_fired);
        let inf = Arc::clone(&inner_fired);
        t.transaction(move |scope| {
            let of2 = Arc::clone(&of);
            scope.after_rollback(move || {
                of2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })?;
            scope.transaction(false, |nested| {
                let inf2 = Arc::clone(&inf);
                nested.after_rollback(move || {
                    inf2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })?;
                Err(nested.rollback(()))
            })?;
            // The inner hook fired as soon as the inner scope rolled back.
            assert_eq!(inf.load(Ordering::SeqCst), 1);
            Ok(())
        })
        .unwrap();

        assert_eq!(inner_fired.load(Ordering::SeqCst), 1);
        // The enclosing scope committed; its rollback hook never fired.
        assert_eq!(outer_fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn hook_failure_and_body_failure_surface_together() {
        let t = transacter();
        let err = t
            .transaction(|scope| {
                scope.after_rollback(|| Err(Error::Custom("hook A".to_string())))?;
                Err(Error::Custom("body B".to_string()))
            })
            .unwrap_err();

        let Error::Hook(hook_err) = &err else {
            panic!("expected a hook error, got {}", err);
        };
        assert_eq!(hook_err.stage, "after_rollback hook");
        assert!(hook_err.error.to_string().contains("hook A"));
        assert!(hook_err.body.as_ref().unwrap().to_string().contains("body B"));
    }

    #[test]
    fn read_scope_rejects_writes() {
        let t = transacter();
        let err = t
            .read(|scope| {
                scope
                    .execute(None, "INSERT INTO t (n) VALUES (1)", &[])
                    .map(|_| ())
            })
            .unwrap_err();
        assert!(err.is_access_violation());
    }

    #[test]
    fn sequential_transactions_release_the_connection() {
        let t = transacter();
        t.transaction(|scope| {
            scope.execute(None, "INSERT INTO t (n) VALUES (1)", &[])?;
            Ok(())
        })
        .unwrap();
        t.transaction(|scope| {
            scope.execute(None, "INSERT INTO t (n) VALUES (2)", &[])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(count(&t), 2);
        assert_eq!(t.driver().pool(false).free_count(), 1);
    }

    #[test]
    fn listeners_fire_after_committed_write_transaction() {
        let t = transacter();
        let notified = Arc::new(AtomicUsize::new(0));
        let n2 = Arc::clone(&notified);
        t.driver().add_listener(Arc::new(move || {
            n2.fetch_add(1, Ordering::SeqCst);
        }));

        t.transaction(|scope| {
            scope.execute(None, "INSERT INTO t (n) VALUES (1)", &[])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // Rolled-back and read-only transactions stay silent.
        let _: i32 = t
            .transaction_with_result(|scope| Err(scope.rollback(0)))
            .unwrap();
        t.read(|_| Ok(())).unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }
}
