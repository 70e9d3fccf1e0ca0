//! An append-only tabular store of runs, plugin executions, step metrics
//! and estimates, with transactional inserts and analytic read queries.
//!
//! One pool handle per store (`pool::HistoryPool`), one migration runner
//! (`migrations::run_migrations`), and CRUD methods that each open a
//! connection and run a single query — every write commits on its own,
//! independent of any other write in the same run.

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;
pub mod schema;

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use crate::domain::PluginStatus;
use crate::error::Result;
use models::{format_datetime, EstimateRow, PluginExecutionRow, RunRow, StepMetricsInsertRow, StepMetricsRow};
use pool::HistoryPool;

#[derive(Clone)]
pub struct HistoryStore {
    pool: HistoryPool,
}

/// End-of-run tallies recorded on the `runs` row when a run closes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunTallies {
    pub total: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub skipped: i32,
}

impl HistoryStore {
    /// Opens (creating if absent) the history store file and applies any
    /// pending migrations. Safe to call against an already up-to-date
    /// schema.
    pub async fn open(database_url: &str) -> Result<Self> {
        migrations::run_migrations(database_url).await?;
        Ok(Self {
            pool: HistoryPool::new(database_url),
        })
    }

    /// Exposes the underlying pool for callers (the estimator, analytic
    /// queries) that read the store outside the row-level CRUD above.
    pub fn pool(&self) -> &HistoryPool {
        &self.pool
    }

    pub async fn create_run(&self, host: &str, user: &str, config_fingerprint: &str) -> Result<RunRow> {
        let mut conn = self.pool.get().await?;
        let row = RunRow {
            id: uuid::Uuid::new_v4().to_string(),
            host: host.to_string(),
            user: user.to_string(),
            config_fingerprint: config_fingerprint.to_string(),
            start_time: format_datetime(Utc::now()),
            end_time: None,
            total: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
        };
        diesel::insert_into(schema::runs::table)
            .values(&row)
            .execute(&mut conn)
            .await?;
        Ok(row)
    }

    /// Back-fills end time and tallies on a run row — the only mutation a
    /// run row ever receives after creation.
    pub async fn close_run(&self, run_id: &str, tallies: RunTallies) -> Result<()> {
        use schema::runs::dsl;
        let mut conn = self.pool.get().await?;
        diesel::update(dsl::runs.filter(dsl::id.eq(run_id)))
            .set((
                dsl::end_time.eq(Some(format_datetime(Utc::now()))),
                dsl::total.eq(tallies.total),
                dsl::succeeded.eq(tallies.succeeded),
                dsl::failed.eq(tallies.failed),
                dsl::skipped.eq(tallies.skipped),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRow>> {
        use schema::runs::dsl;
        let mut conn = self.pool.get().await?;
        let row = dsl::runs
            .filter(dsl::id.eq(run_id))
            .first::<RunRow>(&mut conn)
            .await
            .optional()?;
        Ok(row)
    }

    pub async fn create_execution(&self, run_id: &str, plugin_name: &str) -> Result<PluginExecutionRow> {
        let mut conn = self.pool.get().await?;
        let row = PluginExecutionRow {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            plugin_name: plugin_name.to_string(),
            status: PluginStatus::Pending.as_str().to_string(),
            start_time: None,
            end_time: None,
            packages_updated: 0,
            exit_code: None,
            error_message: None,
        };
        diesel::insert_into(schema::plugin_executions::table)
            .values(&row)
            .execute(&mut conn)
            .await?;
        Ok(row)
    }

    pub async fn mark_execution_started(&self, execution_id: &str) -> Result<()> {
        use schema::plugin_executions::dsl;
        let mut conn = self.pool.get().await?;
        diesel::update(dsl::plugin_executions.filter(dsl::id.eq(execution_id)))
            .set((
                dsl::status.eq(PluginStatus::Running.as_str()),
                dsl::start_time.eq(Some(format_datetime(Utc::now()))),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Records a terminal status. Called exactly once per execution.
    pub async fn mark_execution_terminal(
        &self,
        execution_id: &str,
        status: PluginStatus,
        packages_updated: i32,
        exit_code: Option<i32>,
        error_message: Option<&str>,
    ) -> Result<()> {
        use schema::plugin_executions::dsl;
        let mut conn = self.pool.get().await?;
        diesel::update(dsl::plugin_executions.filter(dsl::id.eq(execution_id)))
            .set((
                dsl::status.eq(status.as_str()),
                dsl::end_time.eq(Some(format_datetime(Utc::now()))),
                dsl::packages_updated.eq(packages_updated),
                dsl::exit_code.eq(exit_code),
                dsl::error_message.eq(error_message),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Option<PluginExecutionRow>> {
        use schema::plugin_executions::dsl;
        let mut conn = self.pool.get().await?;
        let row = dsl::plugin_executions
            .filter(dsl::id.eq(execution_id))
            .first::<PluginExecutionRow>(&mut conn)
            .await
            .optional()?;
        Ok(row)
    }

    pub async fn list_executions_for_run(&self, run_id: &str) -> Result<Vec<PluginExecutionRow>> {
        use schema::plugin_executions::dsl;
        let mut conn = self.pool.get().await?;
        let rows = dsl::plugin_executions
            .filter(dsl::run_id.eq(run_id))
            .load::<PluginExecutionRow>(&mut conn)
            .await?;
        Ok(rows)
    }

    /// Inserts one step's finalized metrics. The schema's unique index on
    /// (execution_id, step_name, phase) rejects a second row for the same
    /// step.
    pub async fn insert_step_metrics(&self, row: StepMetricsRow) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let insert_row: StepMetricsInsertRow = row.into();
        diesel::insert_into(schema::step_metrics::table)
            .values(&insert_row)
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn insert_estimate(&self, row: EstimateRow) -> Result<()> {
        let mut conn = self.pool.get().await?;
        diesel::insert_into(schema::estimates::table)
            .values(&row)
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    pub fn database_url(&self) -> &str {
        self.pool.database_url()
    }
}
