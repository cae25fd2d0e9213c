use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use relay_core::StoreError;
use rusqlite::Connection;
use tracing::info;

use crate::schema;

/// Handle onto the relay database. Clones share one connection; rusqlite's
/// `Connection` is not `Sync`, so every call takes the mutex.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open (creating if needed) the database file and bring its schema up to date.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::Io(format!("{}: {e}", dir.display())))?;
        }
        let db = Self::prepare(Connection::open(path)?, path.to_owned())?;
        info!(path = %path.display(), version = db.schema_version()?, "database opened");
        Ok(db)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::prepare(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn prepare(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        f(&self.conn.lock())
    }

    pub fn schema_version(&self) -> Result<u32, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?)
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let step = |what: &str, result: rusqlite::Result<()>| {
        result.map_err(|e| StoreError::Database(format!("{what}: {e}")))
    };
    step("pragmas", conn.execute_batch(schema::PRAGMAS))?;
    step("tables", conn.execute_batch(schema::CREATE_TABLES))?;
    step(
        "schema version",
        conn.execute(
            "INSERT INTO schema_version (version)
             SELECT ?1 WHERE NOT EXISTS (SELECT 1 FROM schema_version)",
            [schema::SCHEMA_VERSION],
        )
        .map(drop),
    )
}
