//! Driver: connection pools, routing, and database bootstrap.
//!
//! A [`SqliteDriver`] owns two pools over one database: a writer pool of
//! capacity one, which serializes all write transactions, and a reader pool
//! of read-only connections for concurrent reads. With WAL journaling readers
//! proceed concurrently with an in-progress write.
//!
//! In-memory databases are private to their connection, so a memory driver
//! runs everything through the single writer connection and keeps the reader
//! pool empty.

use crate::connection::{ConnectionConfig, ThreadConnection};
use sqlward_core::{DataChangedListener, Error, Result, Row, SchemaError, Value};
use sqlward_pool::ResourcePool;
use std::sync::{Arc, Mutex};

const MEMORY_PATH: &str = ":memory:";

/// How to open a database and size its pools.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    path: String,
    in_memory: bool,
    reader_count: usize,
    busy_timeout_ms: u32,
    wal: bool,
}

impl DriverConfig {
    /// A database file on disk, created if absent.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            in_memory: false,
            reader_count: 4,
            busy_timeout_ms: 5_000,
            wal: true,
        }
    }

    /// A private in-memory database. Reads and writes share the single
    /// writer connection.
    pub fn memory() -> Self {
        Self {
            path: MEMORY_PATH.to_string(),
            in_memory: true,
            reader_count: 0,
            busy_timeout_ms: 5_000,
            wal: false,
        }
    }

    /// Size of the reader pool. Ignored for in-memory databases.
    pub fn reader_count(mut self, count: usize) -> Self {
        self.reader_count = count;
        self
    }

    pub fn busy_timeout_ms(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    /// Enable or disable WAL journaling for file databases.
    pub fn wal(mut self, wal: bool) -> Self {
        self.wal = wal;
        self
    }
}

/// Versioned schema applied when the driver opens a database.
///
/// `create` runs against a fresh database, `migrate` against one stamped
/// with an older version. The driver records the version in
/// `PRAGMA user_version` and runs either path inside a write transaction, so
/// a failed bootstrap leaves the file untouched.
pub trait Schema {
    fn version(&self) -> i64;
    fn create(&self, conn: &mut ThreadConnection) -> Result<()>;
    fn migrate(&self, conn: &mut ThreadConnection, from: i64, to: i64) -> Result<()>;
}

/// Pooled access to one SQLite database.
pub struct SqliteDriver {
    path: String,
    writer: ResourcePool<ThreadConnection>,
    readers: ResourcePool<ThreadConnection>,
    listeners: Mutex<Vec<Arc<dyn DataChangedListener>>>,
}

impl SqliteDriver {
    /// Open the database without a schema.
    pub fn open(config: DriverConfig) -> Result<Self> {
        Self::open_inner(config, None)
    }

    /// Open the database, creating or migrating `schema` first.
    pub fn open_with_schema(config: DriverConfig, schema: &dyn Schema) -> Result<Self> {
        Self::open_inner(config, Some(schema))
    }

    fn open_inner(config: DriverConfig, schema: Option<&dyn Schema>) -> Result<Self> {
        let write_config = ConnectionConfig::new(config.path.clone())
            .busy_timeout_ms(config.busy_timeout_ms);

        if config.in_memory {
            // A transient bootstrap connection would take its database with
            // it when dropped, so the writer is built first and the schema
            // runs through it.
            let writer = ResourcePool::new(1, || ThreadConnection::open(&write_config))?;
            if let Some(schema) = schema {
                writer.access(|conn| apply_schema(conn, schema))?;
            }
            let readers = ResourcePool::new(0, || ThreadConnection::open(&write_config))?;
            tracing::info!("opened in-memory database");
            return Ok(Self {
                path: config.path,
                writer,
                readers,
                listeners: Mutex::new(Vec::new()),
            });
        }

        // Journal mode and schema are settled through a throwaway connection
        // before any pooled connection exists.
        {
            let mut bootstrap = ThreadConnection::open(&write_config)?;
            if config.wal {
                bootstrap.execute_raw("PRAGMA journal_mode = WAL")?;
            }
            if let Some(schema) = schema {
                apply_schema(&mut bootstrap, schema)?;
            }
            bootstrap.clean_up();
        }

        let writer = ResourcePool::new(1, || ThreadConnection::open(&write_config))?;

        let read_config = ConnectionConfig::new(config.path.clone())
            .read_only(true)
            .busy_timeout_ms(config.busy_timeout_ms);
        let readers =
            ResourcePool::new(config.reader_count, || ThreadConnection::open(&read_config))?;

        tracing::info!(
            path = %config.path,
            readers = config.reader_count,
            wal = config.wal,
            "opened database"
        );

        Ok(Self {
            path: config.path,
            writer,
            readers,
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The pool serving transactions of the given mode. Reads fall back to
    /// the writer when there are no reader connections.
    pub(crate) fn pool(&self, read_only: bool) -> &ResourcePool<ThreadConnection> {
        if read_only && self.readers.capacity() > 0 {
            &self.readers
        } else {
            &self.writer
        }
    }

    /// Run one mutating statement outside any transaction.
    ///
    /// Borrows the writer transiently; listeners are notified after the
    /// statement succeeds. Returns the number of rows changed.
    pub fn execute(&self, identifier: Option<i64>, sql: &str, params: &[Value]) -> Result<u64> {
        let changed = self
            .writer
            .access(|conn| conn.execute(identifier, sql, params))?;
        self.notify_data_changed();
        Ok(changed)
    }

    /// Run a query outside any transaction, streaming rows to `body`.
    pub fn execute_query<R>(
        &self,
        identifier: Option<i64>,
        sql: &str,
        params: &[Value],
        body: impl FnOnce(&mut crate::statement::Cursor<'_>) -> Result<R>,
    ) -> Result<R> {
        self.pool(true)
            .access(|conn| conn.execute_query(identifier, sql, params, body))
    }

    /// Run a query outside any transaction and collect every row.
    pub fn query(&self, identifier: Option<i64>, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.pool(true)
            .access(|conn| conn.query(identifier, sql, params))
    }

    /// Register a listener for data-change notifications.
    ///
    /// Notification is coarse: any successful mutating statement fires every
    /// listener, with no statement-level filtering. A listener may therefore
    /// see notifications for data it does not care about, but never misses
    /// one for data it does.
    pub fn add_listener(&self, listener: Arc<dyn DataChangedListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Remove a previously registered listener, matched by identity.
    pub fn remove_listener(&self, listener: &Arc<dyn DataChangedListener>) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Fire every registered listener. Called by the write paths after a
    /// mutating statement or a committed write transaction.
    pub(crate) fn notify_data_changed(&self) {
        let snapshot: Vec<_> = self.listeners.lock().unwrap().clone();
        for listener in snapshot {
            listener.notify_data_changed();
        }
    }

    /// Close both pools, waiting for borrowed connections to come back.
    pub fn close(&self) {
        self.readers.close();
        self.writer.close();
        tracing::debug!(path = %self.path, "driver closed");
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_closed()
    }
}

/// Create or migrate the schema inside a write transaction and stamp
/// `PRAGMA user_version`.
fn apply_schema(conn: &mut ThreadConnection, schema: &dyn Schema) -> Result<()> {
    let current = conn.user_version()?;
    let target = schema.version();

    if current == target {
        return Ok(());
    }
    if current > target {
        return Err(Error::Schema(SchemaError {
            message: format!(
                "database version {} is newer than schema version {}",
                current, target
            ),
            source: None,
        }));
    }

    conn.begin_transaction(false)?;
    let applied = if current == 0 {
        tracing::info!(version = target, "creating schema");
        schema.create(conn)
    } else {
        tracing::info!(from = current, to = target, "migrating schema");
        schema.migrate(conn, current, target)
    }
    .and_then(|()| conn.set_user_version(target));

    match applied {
        Ok(()) => {
            conn.end_transaction(true)?;
            Ok(())
        }
        Err(err) => {
            if let Err(rollback_err) = conn.end_transaction(false) {
                tracing::warn!(error = %rollback_err, "schema rollback failed");
            }
            Err(Error::Schema(SchemaError {
                message: if current == 0 {
                    format!("schema create (version {}) failed", target)
                } else {
                    format!("schema migration {} -> {} failed", current, target)
                },
                source: Some(Box::new(err)),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestSchema {
        version: i64,
        migrations: AtomicUsize,
    }

    impl TestSchema {
        fn v(version: i64) -> Self {
            Self {
                version,
                migrations: AtomicUsize::new(0),
            }
        }
    }

    impl Schema for TestSchema {
        fn version(&self) -> i64 {
            self.version
        }

        fn create(&self, conn: &mut ThreadConnection) -> Result<()> {
            conn.execute(
                None,
                "CREATE TABLE item (id INTEGER PRIMARY KEY, label TEXT NOT NULL)",
                &[],
            )?;
            Ok(())
        }

        fn migrate(&self, conn: &mut ThreadConnection, _from: i64, _to: i64) -> Result<()> {
            self.migrations.fetch_add(1, Ordering::SeqCst);
            conn.execute(None, "ALTER TABLE item ADD COLUMN extra TEXT", &[])?;
            Ok(())
        }
    }

    #[test]
    fn memory_driver_reads_through_the_writer() {
        let driver =
            SqliteDriver::open_with_schema(DriverConfig::memory(), &TestSchema::v(1)).unwrap();

        driver
            .execute(None, "INSERT INTO item (label) VALUES (?)", &[Value::from("x")])
            .unwrap();
        let rows = driver.query(None, "SELECT label FROM item", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_as::<String>(0).unwrap(), "x");

        driver.close();
        assert!(driver.is_closed());
    }

    #[test]
    fn file_driver_serves_reads_from_the_reader_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db").to_string_lossy().into_owned();
        let driver = SqliteDriver::open_with_schema(
            DriverConfig::file(path).reader_count(2),
            &TestSchema::v(1),
        )
        .unwrap();

        driver
            .execute(None, "INSERT INTO item (label) VALUES ('a')", &[])
            .unwrap();

        let mode = driver
            .query(None, "PRAGMA journal_mode", &[])
            .unwrap();
        assert_eq!(mode[0].get_as::<String>(0).unwrap(), "wal");

        let rows = driver.query(None, "SELECT count(*) FROM item", &[]).unwrap();
        assert_eq!(rows[0].get_as::<i64>(0).unwrap(), 1);

        driver.close();
    }

    #[test]
    fn schema_migration_runs_once_on_stale_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db").to_string_lossy().into_owned();

        let driver =
            SqliteDriver::open_with_schema(DriverConfig::file(path.clone()), &TestSchema::v(1))
                .unwrap();
        driver.close();

        let schema = TestSchema::v(2);
        let driver =
            SqliteDriver::open_with_schema(DriverConfig::file(path.clone()), &schema).unwrap();
        assert_eq!(schema.migrations.load(Ordering::SeqCst), 1);
        driver
            .execute(None, "INSERT INTO item (label, extra) VALUES ('a', 'b')", &[])
            .unwrap();
        driver.close();

        // Same version: neither create nor migrate runs again.
        let schema = TestSchema::v(2);
        let driver = SqliteDriver::open_with_schema(DriverConfig::file(path), &schema).unwrap();
        assert_eq!(schema.migrations.load(Ordering::SeqCst), 0);
        driver.close();
    }

    #[test]
    fn schema_downgrade_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db").to_string_lossy().into_owned();

        SqliteDriver::open_with_schema(DriverConfig::file(path.clone()), &TestSchema::v(3))
            .unwrap()
            .close();

        let err =
            SqliteDriver::open_with_schema(DriverConfig::file(path), &TestSchema::v(2))
                .err()
                .unwrap();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn failed_schema_create_leaves_database_fresh() {
        struct Broken;
        impl Schema for Broken {
            fn version(&self) -> i64 {
                1
            }
            fn create(&self, conn: &mut ThreadConnection) -> Result<()> {
                conn.execute(None, "CREATE TABLE half (id INTEGER)", &[])?;
                Err(Error::Custom("create failed".to_string()))
            }
            fn migrate(&self, _: &mut ThreadConnection, _: i64, _: i64) -> Result<()> {
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db").to_string_lossy().into_owned();

        let err = SqliteDriver::open_with_schema(DriverConfig::file(path.clone()), &Broken)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Schema(_)));

        // The partial create rolled back; a later open starts from scratch.
        let driver =
            SqliteDriver::open_with_schema(DriverConfig::file(path), &TestSchema::v(1)).unwrap();
        let rows = driver
            .query(
                None,
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'half'",
                &[],
            )
            .unwrap();
        assert!(rows.is_empty());
        driver.close();
    }

    #[test]
    fn listeners_fire_on_writes_only() {
        let driver = SqliteDriver::open(DriverConfig::memory()).unwrap();
        driver
            .execute(None, "CREATE TABLE t (id INTEGER)", &[])
            .unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let listener: Arc<dyn DataChangedListener> = Arc::new(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        driver.add_listener(Arc::clone(&listener));
        driver.execute(None, "INSERT INTO t VALUES (1)", &[]).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        driver.query(None, "SELECT * FROM t", &[]).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        driver.remove_listener(&listener);
        driver.execute(None, "INSERT INTO t VALUES (2)", &[]).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        driver.close();
    }

    #[test]
    fn failed_write_does_not_notify() {
        let driver = SqliteDriver::open(DriverConfig::memory()).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        driver.add_listener(Arc::new(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(driver.execute(None, "INSERT INTO missing VALUES (1)", &[]).is_err());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        driver.close();
    }
}
