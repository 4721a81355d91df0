//! The per-user durable store.
//!
//! Each user owns one SQLite database file; a one-connection r2d2 pool
//! enforces the single-writer discipline at the connection level while the
//! user actor enforces it at the operation level. All mutating operations
//! run inside a transaction per actor call.

pub mod migrations;
pub mod schema;

use std::fs;
use std::path::{Path, PathBuf};

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};

use calfed_core::error::{EngineError, EngineResult};

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Connection setup applied on every checkout.
#[derive(Debug)]
struct SqlitePragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Handle to one user's database.
#[derive(Clone)]
pub struct Store {
    user_id: String,
    pool: DbPool,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (creating if needed) the database for `user_id` under
    /// `data_dir` and bring the schema up to date.
    pub fn open(data_dir: &Path, user_id: &str) -> EngineResult<Self> {
        if user_id.is_empty() || user_id.contains(['/', '\\', '.']) {
            return Err(EngineError::validation(format!(
                "invalid user id: {:?}",
                user_id
            )));
        }
        fs::create_dir_all(data_dir).map_err(|e| EngineError::Database {
            message: format!("failed to create data dir {}: {}", data_dir.display(), e),
        })?;
        let path = data_dir.join(format!("{}.db", user_id));
        let store = Self::from_url(user_id, path.display().to_string(), Some(path))?;
        store.ensure_migrations()?;
        Ok(store)
    }

    /// In-memory store for tests. The single pooled connection keeps the
    /// database alive for the store's lifetime.
    pub fn open_ephemeral(user_id: &str) -> EngineResult<Self> {
        let store = Self::from_url(user_id, ":memory:".to_string(), None)?;
        store.ensure_migrations()?;
        Ok(store)
    }

    fn from_url(user_id: &str, url: String, path: Option<PathBuf>) -> EngineResult<Self> {
        let manager = ConnectionManager::<SqliteConnection>::new(url);
        let pool = Pool::builder()
            .max_size(1)
            .connection_customizer(Box::new(SqlitePragmas))
            .build(manager)?;
        Ok(Self {
            user_id: user_id.to_string(),
            pool,
            path,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Check out the store connection.
    pub fn conn(&self) -> EngineResult<DbConn> {
        self.pool.get().map_err(EngineError::from)
    }

    /// Run `f` inside a transaction on the store connection. A failure
    /// that looks like schema drift (missing table) re-applies migrations
    /// and retries once.
    pub fn transaction<T>(
        &self,
        f: impl Fn(&mut SqliteConnection) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut conn = self.conn()?;
        match conn.transaction::<T, EngineError, _>(|conn| f(conn)) {
            Err(EngineError::Database { message }) if message.contains("no such table") => {
                tracing::warn!(user_id = %self.user_id, "schema drift detected, re-running migrations");
                migrations::apply_migrations(&mut conn)?;
                conn.transaction::<T, EngineError, _>(|conn| f(conn))
            }
            other => other,
        }
    }

    /// Apply missing migrations; retried once when a query later reports a
    /// missing table.
    pub fn ensure_migrations(&self) -> EngineResult<()> {
        let mut conn = self.conn()?;
        migrations::apply_migrations(&mut conn)
    }

    /// Delete the backing database file. Consumes the store; the caller
    /// must have stopped the owning actor first.
    pub fn delete_database(self) -> EngineResult<()> {
        let Store { pool, path, .. } = self;
        drop(pool);
        if let Some(path) = path {
            remove_database_files(&path)?;
        }
        Ok(())
    }

    /// Remove a user's database files without opening them. Used by
    /// whole-user purge after the owning actor has stopped.
    pub fn purge_files(data_dir: &Path, user_id: &str) -> EngineResult<()> {
        remove_database_files(&data_dir.join(format!("{}.db", user_id)))
    }
}

fn remove_database_files(path: &Path) -> EngineResult<()> {
    for suffix in ["", "-wal", "-shm"] {
        let target = PathBuf::from(format!("{}{}", path.display(), suffix));
        if target.exists() {
            fs::remove_file(&target).map_err(|e| EngineError::Database {
                message: format!("failed to remove {}: {}", target.display(), e),
            })?;
        }
    }
    Ok(())
}
