//! SQLite connection access for the history store: a lightweight handle
//! that establishes a fresh async connection per use rather than pooling a
//! fixed set, since `SyncConnectionWrapper<SqliteConnection>` already wraps
//! a blocking connection on a dedicated thread and SQLite itself serializes
//! writers.

use diesel::sqlite::SqliteConnection;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::AsyncConnection;

use crate::error::{EngineError, Result};

pub type SqliteConn = SyncConnectionWrapper<SqliteConnection>;

#[derive(Clone)]
pub struct HistoryPool {
    database_url: String,
}

impl HistoryPool {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    pub async fn get(&self) -> Result<SqliteConn> {
        SqliteConn::establish(&self.database_url)
            .await
            .map_err(|e| EngineError::Internal(format!("failed to open history store: {e}")))
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }
}
