//! Applies embedded diesel migrations to the history store on open.
//! Migrations are embedded at compile time and run on a blocking task
//! since diesel's migration harness is synchronous.

use diesel::Connection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::info;

use crate::error::{EngineError, Result};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/sqlite");

pub async fn run_migrations(database_url: &str) -> Result<()> {
    let url = database_url.to_string();
    tokio::task::spawn_blocking(move || {
        let mut conn = diesel::SqliteConnection::establish(&url)
            .map_err(|e| EngineError::Internal(format!("failed to open history store: {e}")))?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| EngineError::Internal(format!("migration failed: {e}")))?;
        for migration in &applied {
            info!("applied history store migration: {}", migration);
        }
        if applied.is_empty() {
            info!("history store schema already up to date");
        }
        Ok(())
    })
    .await
    .map_err(|e| EngineError::Internal(format!("migration task panicked: {e}")))?
}
