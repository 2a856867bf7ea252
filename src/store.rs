//! Persistence contract and its SQLite implementation.
//!
//! Everything above this module talks to the database through [`Store`]:
//! positional parameters only, rows returned as JSON maps keyed by column
//! name. SQL text is never assembled from caller values.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;
use serde_json::{Map, Number, Value};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

/// A result row, keyed by column name.
pub type Row = Map<String, Value>;

/// The persistence surface consumed by the registry, the history and the
/// delivery queue.
///
/// `execute` must have durably persisted its write by the time it returns.
pub trait Store: Send + Sync {
    /// Run a statement that returns no rows. Returns the number of rows changed.
    fn execute(&self, sql: &str, params: &[Value]) -> StoreResult<usize>;

    fn query_one(&self, sql: &str, params: &[Value]) -> StoreResult<Option<Row>>;

    fn query_all(&self, sql: &str, params: &[Value]) -> StoreResult<Vec<Row>>;

    /// Opaque unique identifier.
    fn new_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Current time as an ISO-8601 UTC timestamp.
    fn now(&self) -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// SQLite-backed [`Store`].
///
/// A file-backed store is opened with `synchronous = FULL`, so every write
/// is on disk before `execute` returns.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<String>,
}

impl SqliteStore {
    /// Open (or create) a database file and run pending migrations.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        run_migrations(&conn)?;

        let path = path.to_string_lossy().to_string();
        info!(path = %path, "Opened webhook store");

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    /// Open an in-memory database, mostly for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Path of the backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Write a consistent snapshot of the whole database to `target`.
    ///
    /// The snapshot can be loaded again with [`SqliteStore::open`].
    /// An existing file at `target` is replaced.
    pub fn save_to(&self, target: &Path) -> StoreResult<()> {
        if self.is_own_file(target) {
            return Err(StoreError::InvalidData(format!(
                "cannot snapshot the store onto its own file {}",
                target.display()
            )));
        }
        if target.exists() {
            std::fs::remove_file(target)?;
        }
        let target_str = target.to_string_lossy().to_string();
        let conn = self.lock()?;
        conn.execute("VACUUM INTO ?1", [&target_str])?;
        info!(target = %target_str, "Saved store snapshot");
        Ok(())
    }

    fn is_own_file(&self, target: &Path) -> bool {
        let Some(own) = self.path.as_deref() else {
            return false;
        };
        match (Path::new(own).canonicalize(), target.canonicalize()) {
            (Ok(own), Ok(target)) => own == target,
            _ => Path::new(own) == target,
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Connection("connection lock poisoned".to_string()))
    }
}

impl Store for SqliteStore {
    fn execute(&self, sql: &str, params: &[Value]) -> StoreResult<usize> {
        let bound = bind_params(params)?;
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let changed = stmt.execute(rusqlite::params_from_iter(bound.iter()))?;
        Ok(changed)
    }

    fn query_one(&self, sql: &str, params: &[Value]) -> StoreResult<Option<Row>> {
        Ok(self.query_all(sql, params)?.into_iter().next())
    }

    fn query_all(&self, sql: &str, params: &[Value]) -> StoreResult<Vec<Row>> {
        let bound = bind_params(params)?;
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();

        let mut rows = stmt.query(rusqlite::params_from_iter(bound.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut map = Map::with_capacity(columns.len());
            for (index, name) in columns.iter().enumerate() {
                map.insert(name.clone(), read_value(row.get_ref(index)?));
            }
            out.push(map);
        }
        Ok(out)
    }
}

fn bind_params(params: &[Value]) -> StoreResult<Vec<SqlValue>> {
    params.iter().map(to_sql_value).collect()
}

fn to_sql_value(value: &Value) -> StoreResult<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if n.is_u64() {
                return Err(StoreError::InvalidData(format!("integer {n} exceeds the SQLite range")));
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                return Err(StoreError::InvalidData(format!("unrepresentable number {n}")));
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(serde_json::to_string(value)?),
    })
}

fn read_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

/// Typed column access on a [`Row`].
pub trait RowExt {
    fn text(&self, column: &str) -> StoreResult<String>;
    fn opt_text(&self, column: &str) -> StoreResult<Option<String>>;
    fn int(&self, column: &str) -> StoreResult<i64>;
    fn opt_int(&self, column: &str) -> StoreResult<Option<i64>>;
    fn real(&self, column: &str) -> StoreResult<f64>;
    fn flag(&self, column: &str) -> StoreResult<bool>;
    /// A TEXT column holding JSON.
    fn json<T: serde::de::DeserializeOwned>(&self, column: &str) -> StoreResult<T>;
}

impl RowExt for Row {
    fn text(&self, column: &str) -> StoreResult<String> {
        self.opt_text(column)?
            .ok_or_else(|| StoreError::InvalidData(format!("column {column} is null")))
    }

    fn opt_text(&self, column: &str) -> StoreResult<Option<String>> {
        match self.get(column) {
            None => Err(missing(column)),
            Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(mismatch(column, "text", other)),
        }
    }

    fn int(&self, column: &str) -> StoreResult<i64> {
        self.opt_int(column)?
            .ok_or_else(|| StoreError::InvalidData(format!("column {column} is null")))
    }

    fn opt_int(&self, column: &str) -> StoreResult<Option<i64>> {
        match self.get(column) {
            None => Err(missing(column)),
            Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| mismatch(column, "integer", &Value::Number(n.clone()))),
            Some(other) => Err(mismatch(column, "integer", other)),
        }
    }

    fn real(&self, column: &str) -> StoreResult<f64> {
        match self.get(column) {
            None => Err(missing(column)),
            Some(Value::Null) => Ok(0.0),
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| mismatch(column, "real", &Value::Number(n.clone()))),
            Some(other) => Err(mismatch(column, "real", other)),
        }
    }

    fn flag(&self, column: &str) -> StoreResult<bool> {
        Ok(self.int(column)? != 0)
    }

    fn json<T: serde::de::DeserializeOwned>(&self, column: &str) -> StoreResult<T> {
        let raw = self.text(column)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

fn missing(column: &str) -> StoreError {
    StoreError::InvalidData(format!("column {column} not in result"))
}

fn mismatch(column: &str, expected: &str, got: &Value) -> StoreError {
    StoreError::InvalidData(format!("column {column}: expected {expected}, got {got}"))
}

/// Current schema version.
pub const CURRENT_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    debug!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_webhooks(conn)?;
    }

    Ok(())
}

fn record_migration(conn: &Connection, version: i64, name: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: webhook subscriptions and delivery history.
fn migrate_v1_webhooks(conn: &Connection) -> StoreResult<()> {
    info!("Applying migration v1: webhooks");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS webhooks (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            method TEXT NOT NULL DEFAULT 'POST',
            headers TEXT NOT NULL DEFAULT '{}',
            secret TEXT,
            events TEXT NOT NULL DEFAULT '[]',
            active INTEGER NOT NULL DEFAULT 1,
            retry_count INTEGER NOT NULL DEFAULT 3,
            timeout INTEGER NOT NULL DEFAULT 30,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_webhooks_active ON webhooks(active);

        CREATE TABLE IF NOT EXISTS webhook_deliveries (
            id TEXT PRIMARY KEY,
            webhook_id TEXT NOT NULL REFERENCES webhooks(id),
            event TEXT NOT NULL,
            payload TEXT NOT NULL,
            status_code INTEGER,
            response_body TEXT,
            success INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_webhook
            ON webhook_deliveries(webhook_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_created
            ON webhook_deliveries(created_at);
        ",
    )?;

    record_migration(conn, 1, "webhooks")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_positional_params_round_trip_types() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .execute(
                "CREATE TABLE kv (k TEXT PRIMARY KEY, n INTEGER, r REAL, b INTEGER, j TEXT, z TEXT)",
                &[],
            )
            .unwrap();
        store
            .execute(
                "INSERT INTO kv (k, n, r, b, j, z) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                &[
                    json!("a"),
                    json!(42),
                    json!(1.5),
                    json!(true),
                    json!({"x": [1, 2]}),
                    Value::Null,
                ],
            )
            .unwrap();

        let row = store
            .query_one("SELECT * FROM kv WHERE k = ?1", &[json!("a")])
            .unwrap()
            .unwrap();
        assert_eq!(row.text("k").unwrap(), "a");
        assert_eq!(row.int("n").unwrap(), 42);
        assert_eq!(row.real("r").unwrap(), 1.5);
        assert!(row.flag("b").unwrap());
        assert_eq!(row.json::<Value>("j").unwrap(), json!({"x": [1, 2]}));
        assert_eq!(row.opt_text("z").unwrap(), None);
    }

    #[test]
    fn test_out_of_range_integer_is_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.execute("CREATE TABLE n (v INTEGER)", &[]).unwrap();

        let err = store
            .execute("INSERT INTO n (v) VALUES (?1)", &[json!(u64::MAX)])
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));

        store
            .execute("INSERT INTO n (v) VALUES (?1)", &[json!(i64::MAX as u64)])
            .unwrap();
        let rows = store.query_all("SELECT v FROM n", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].int("v").unwrap(), i64::MAX);
    }

    #[test]
    fn test_injection_text_is_bound_not_executed() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.execute("CREATE TABLE t (v TEXT)", &[]).unwrap();
        let hostile = "x'); DROP TABLE t; --";
        store
            .execute("INSERT INTO t (v) VALUES (?1)", &[json!(hostile)])
            .unwrap();

        let rows = store.query_all("SELECT v FROM t", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text("v").unwrap(), hostile);
    }

    #[test]
    fn test_malformed_sql_is_an_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.execute("INSERT INTO nowhere VALUES (?1)", &[json!(1)]);
        assert!(matches!(err, Err(StoreError::Sqlite(_))));
    }

    #[test]
    fn test_query_one_returns_none_for_no_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        let row = store
            .query_one("SELECT id FROM webhooks WHERE id = ?1", &[json!("missing")])
            .unwrap();
        assert!(row.is_none());
    }

    #[test]
    fn test_row_ext_reports_type_mismatch() {
        let mut row = Row::new();
        row.insert("n".into(), json!("not a number"));
        assert!(matches!(row.int("n"), Err(StoreError::InvalidData(_))));
        assert!(matches!(row.text("absent"), Err(StoreError::InvalidData(_))));
    }

    #[test]
    fn test_file_store_persists_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("app.db");
        let snapshot = dir.path().join("snapshot.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            let now = store.now();
            store
                .execute(
                    "INSERT INTO webhooks (id, name, url, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
                    &[json!("wh-1"), json!("hook"), json!("https://example.test"), json!(now)],
                )
                .unwrap();
            store.save_to(&snapshot).unwrap();
            // A second save replaces the previous snapshot.
            store.save_to(&snapshot).unwrap();
        }

        for file in [&path, &snapshot] {
            let reopened = SqliteStore::open(file).unwrap();
            let row = reopened
                .query_one("SELECT name FROM webhooks WHERE id = ?1", &[json!("wh-1")])
                .unwrap()
                .unwrap();
            assert_eq!(row.text("name").unwrap(), "hook");
        }
    }

    #[test]
    fn test_save_to_own_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let store = SqliteStore::open(&path).unwrap();
        store
            .execute(
                "INSERT INTO webhooks (id, name, url, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
                &[json!("wh-1"), json!("hook"), json!("https://example.test"), json!(store.now())],
            )
            .unwrap();

        let err = store.save_to(&path).unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));
        let aliased = dir.path().join(".").join("app.db");
        assert!(matches!(store.save_to(&aliased), Err(StoreError::InvalidData(_))));

        assert!(path.exists());
        let row = store
            .query_one("SELECT name FROM webhooks WHERE id = ?1", &[json!("wh-1")])
            .unwrap()
            .unwrap();
        assert_eq!(row.text("name").unwrap(), "hook");
    }

    #[test]
    fn test_ids_are_unique_and_timestamps_parse() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_ne!(store.new_id(), store.new_id());
        assert!(chrono::DateTime::parse_from_rfc3339(&store.now()).is_ok());
    }
}
