use crate::core::broker::DbBroker;
use crate::core::error;
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};

pub fn db_connect(db_path: &str) -> Result<Connection, error::WorldlineError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(error::WorldlineError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::WorldlineError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::WorldlineError::RusqliteError)?;
    Ok(conn)
}

pub fn world_db_path(root: &Path) -> PathBuf {
    root.join(schemas::WORLD_DB_NAME)
}

pub fn initialize_world_db(root: &Path) -> Result<(), error::WorldlineError> {
    fs::create_dir_all(root).map_err(error::WorldlineError::IoError)?;
    let db_path = world_db_path(root);

    let broker = DbBroker::new(root);
    broker.with_conn(&db_path, "worldline", None, "store.init", |conn| {
        for stmt in schemas::WORLD_DB_SCHEMA {
            conn.execute(stmt, [])?;
        }
        Ok(())
    })?;

    tracing::debug!(path = %db_path.display(), "world database initialized");
    Ok(())
}
