//! Row types for the history store. Timestamps round-trip through RFC 3339
//! text columns rather than a backend-specific timestamp type.

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use super::schema::{estimates, plugin_executions, runs, step_metrics};

pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

pub fn parse_datetime_opt(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

#[derive(Debug, Clone, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = runs)]
pub struct RunRow {
    pub id: String,
    pub host: String,
    pub user: String,
    pub config_fingerprint: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub total: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub skipped: i32,
}

#[derive(Debug, Clone, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = plugin_executions)]
pub struct PluginExecutionRow {
    pub id: String,
    pub run_id: String,
    pub plugin_name: String,
    pub status: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub packages_updated: i32,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = step_metrics)]
pub struct StepMetricsInsertRow {
    pub execution_id: String,
    pub step_name: String,
    pub phase: String,
    pub start_time: String,
    pub end_time: String,
    pub wall_clock_seconds: f64,
    pub cpu_user_seconds: f64,
    pub cpu_kernel_seconds: f64,
    pub peak_memory_bytes: i64,
    pub avg_memory_bytes: i64,
    pub io_read_bytes: i64,
    pub io_write_bytes: i64,
    pub io_read_ops: i64,
    pub io_write_ops: i64,
    pub net_rx_bytes: i64,
    pub net_tx_bytes: i64,
    pub download_size_bytes: Option<i64>,
    pub download_speed_bps: Option<f64>,
}

/// Transient, human-friendly form produced by the Metrics Collector before
/// it is turned into a timestamp-text `StepMetricsInsertRow` for persistence.
#[derive(Debug, Clone)]
pub struct StepMetricsRow {
    pub execution_id: String,
    pub step_name: String,
    pub phase: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub wall_clock_seconds: f64,
    pub cpu_user_seconds: f64,
    pub cpu_kernel_seconds: f64,
    pub peak_memory_bytes: i64,
    pub avg_memory_bytes: i64,
    pub io_read_bytes: i64,
    pub io_write_bytes: i64,
    pub io_read_ops: i64,
    pub io_write_ops: i64,
    pub net_rx_bytes: i64,
    pub net_tx_bytes: i64,
    pub download_size_bytes: Option<i64>,
    pub download_speed_bps: Option<f64>,
}

impl From<StepMetricsRow> for StepMetricsInsertRow {
    fn from(row: StepMetricsRow) -> Self {
        Self {
            execution_id: row.execution_id,
            step_name: row.step_name,
            phase: row.phase,
            start_time: format_datetime(row.start_time),
            end_time: format_datetime(row.end_time),
            wall_clock_seconds: row.wall_clock_seconds,
            cpu_user_seconds: row.cpu_user_seconds,
            cpu_kernel_seconds: row.cpu_kernel_seconds,
            peak_memory_bytes: row.peak_memory_bytes,
            avg_memory_bytes: row.avg_memory_bytes,
            io_read_bytes: row.io_read_bytes,
            io_write_bytes: row.io_write_bytes,
            io_read_ops: row.io_read_ops,
            io_write_ops: row.io_write_ops,
            net_rx_bytes: row.net_rx_bytes,
            net_tx_bytes: row.net_tx_bytes,
            download_size_bytes: row.download_size_bytes,
            download_speed_bps: row.download_speed_bps,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = estimates)]
pub struct EstimateRow {
    pub execution_id: String,
    pub phase: String,
    pub download_bytes: Option<i64>,
    pub cpu_seconds: Option<f64>,
    pub wall_seconds: Option<f64>,
    pub memory_bytes: Option<i64>,
    pub package_count: Option<i32>,
    pub confidence: Option<f64>,
}
