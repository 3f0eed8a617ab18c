//! SQLite persistence for sessions, queues, preferences and age verification.

pub mod migrations;
pub mod models;
pub mod schema;

use std::sync::{Arc, Mutex};

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use tracing::info;

/// Open a raw connection without running migrations.
pub fn establish_connection(database_url: &str) -> ConnectionResult<SqliteConnection> {
    SqliteConnection::establish(database_url)
}

/// Thread-safe database handle wrapping a single SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<SqliteConnection>>,
}

impl Database {
    /// Open or create the database at `database_url` and bring the schema up to date.
    pub fn open(database_url: &str) -> anyhow::Result<Self> {
        let conn = establish_connection(database_url)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.configure()?;
        db.with_conn(migrations::run_migrations)?;
        info!("Database ready at {}", database_url);
        Ok(db)
    }

    /// Fresh in-memory database, used by tests.
    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::open(":memory:")
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<F, R>(&self, f: F) -> QueryResult<R>
    where
        F: FnOnce(&mut SqliteConnection) -> QueryResult<R>,
    {
        // A panic while holding the lock leaves SQLite itself consistent.
        let mut conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut conn)
    }

    /// Run `f` inside a transaction.
    pub fn transaction<F, R>(&self, f: F) -> QueryResult<R>
    where
        F: FnOnce(&mut SqliteConnection) -> QueryResult<R>,
    {
        self.with_conn(|conn| conn.transaction(f))
    }

    fn configure(&self) -> QueryResult<()> {
        self.with_conn(|conn| {
            conn.batch_execute(
                "PRAGMA busy_timeout=5000;
                 PRAGMA foreign_keys=ON;",
            )
        })
    }
}
