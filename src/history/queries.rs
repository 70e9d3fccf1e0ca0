//! Analytic read views over the history store: the training table the
//! estimator samples from, a per-plugin performance summary, and an
//! estimate-accuracy comparison between predicted and observed cost.

use std::collections::HashMap;

use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use super::models::{parse_datetime, StepMetricsInsertRow};
use super::pool::HistoryPool;
use super::schema::{estimates, plugin_executions, step_metrics};
use crate::error::Result;

/// One observed (inputs, outcome) pair for a plugin/phase, used to fit or
/// refresh an estimator model.
#[derive(Debug, Clone, Queryable)]
pub struct TrainingSample {
    pub plugin_name: String,
    pub phase: String,
    pub wall_clock_seconds: f64,
    pub cpu_user_seconds: f64,
    pub peak_memory_bytes: i64,
    pub download_size_bytes: Option<i64>,
    pub start_time: String,
}

/// Rolled-up outcome counts and timing for one plugin across all runs.
#[derive(Debug, Clone, Default)]
pub struct PluginPerformanceSummary {
    pub plugin_name: String,
    pub total_runs: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub skipped: i64,
    pub avg_wall_clock_seconds: f64,
    pub last_run_at: Option<String>,
}

/// One estimate compared against what actually happened.
#[derive(Debug, Clone)]
pub struct EstimateAccuracyRow {
    pub execution_id: String,
    pub phase: String,
    pub estimated_wall_seconds: Option<f64>,
    pub actual_wall_seconds: f64,
    pub confidence: Option<f64>,
}

impl EstimateAccuracyRow {
    /// Relative error of the estimate against the observed value, or
    /// `None` when no estimate was recorded for this execution/phase.
    pub fn relative_error(&self) -> Option<f64> {
        let estimated = self.estimated_wall_seconds?;
        if self.actual_wall_seconds <= 0.0 {
            return None;
        }
        Some((estimated - self.actual_wall_seconds).abs() / self.actual_wall_seconds)
    }
}

pub async fn training_table(pool: &HistoryPool, plugin_name: &str, phase: &str) -> Result<Vec<TrainingSample>> {
    let mut conn = pool.get().await?;
    let rows = plugin_executions::table
        .inner_join(step_metrics::table.on(step_metrics::execution_id.eq(plugin_executions::id)))
        .filter(plugin_executions::plugin_name.eq(plugin_name))
        .filter(step_metrics::phase.eq(phase))
        .select((
            plugin_executions::plugin_name,
            step_metrics::phase,
            step_metrics::wall_clock_seconds,
            step_metrics::cpu_user_seconds,
            step_metrics::peak_memory_bytes,
            step_metrics::download_size_bytes,
            step_metrics::start_time,
        ))
        .load::<TrainingSample>(&mut conn)
        .await?;
    Ok(rows)
}

pub async fn plugin_performance_summary(pool: &HistoryPool, plugin_name: &str) -> Result<PluginPerformanceSummary> {
    let mut conn = pool.get().await?;
    let executions = plugin_executions::table
        .filter(plugin_executions::plugin_name.eq(plugin_name))
        .select(plugin_executions::status)
        .load::<String>(&mut conn)
        .await?;

    let total_runs = executions.len() as i64;
    let succeeded = executions.iter().filter(|s| s.as_str() == "success").count() as i64;
    let failed = executions.iter().filter(|s| s.as_str() == "failed").count() as i64;
    let skipped = executions.iter().filter(|s| s.as_str() == "skipped").count() as i64;

    let wall_times = plugin_executions::table
        .inner_join(step_metrics::table.on(step_metrics::execution_id.eq(plugin_executions::id)))
        .filter(plugin_executions::plugin_name.eq(plugin_name))
        .select(step_metrics::wall_clock_seconds)
        .load::<f64>(&mut conn)
        .await?;
    let avg_wall_clock_seconds = if wall_times.is_empty() {
        0.0
    } else {
        wall_times.iter().sum::<f64>() / wall_times.len() as f64
    };

    let last_run_at = plugin_executions::table
        .filter(plugin_executions::plugin_name.eq(plugin_name))
        .filter(plugin_executions::start_time.is_not_null())
        .select(plugin_executions::start_time)
        .order(plugin_executions::start_time.desc())
        .first::<Option<String>>(&mut conn)
        .await
        .optional()?
        .flatten();

    Ok(PluginPerformanceSummary {
        plugin_name: plugin_name.to_string(),
        total_runs,
        succeeded,
        failed,
        skipped,
        avg_wall_clock_seconds,
        last_run_at,
    })
}

pub async fn estimate_accuracy(pool: &HistoryPool, plugin_name: &str) -> Result<Vec<EstimateAccuracyRow>> {
    let mut conn = pool.get().await?;
    let rows = plugin_executions::table
        .inner_join(step_metrics::table.on(step_metrics::execution_id.eq(plugin_executions::id)))
        .left_join(
            estimates::table.on(estimates::execution_id
                .eq(plugin_executions::id)
                .and(estimates::phase.eq(step_metrics::phase))),
        )
        .filter(plugin_executions::plugin_name.eq(plugin_name))
        .select((
            plugin_executions::id,
            step_metrics::phase,
            estimates::wall_seconds.nullable(),
            step_metrics::wall_clock_seconds,
            estimates::confidence.nullable(),
        ))
        .load::<(String, String, Option<f64>, f64, Option<f64>)>(&mut conn)
        .await?;

    Ok(rows
        .into_iter()
        .map(|(execution_id, phase, estimated_wall_seconds, actual_wall_seconds, confidence)| EstimateAccuracyRow {
            execution_id,
            phase,
            estimated_wall_seconds,
            actual_wall_seconds,
            confidence,
        })
        .collect())
}

/// Sorts training samples oldest-first by their recorded start time, the
/// order the estimator expects when applying recency weighting.
pub fn sort_by_recency(samples: &mut [TrainingSample]) {
    samples.sort_by_key(|s| parse_datetime(&s.start_time));
}

/// Mean absolute percent error between estimated and observed wall time for
/// one plugin's phase, across every execution that recorded both.
#[derive(Debug, Clone)]
pub struct PhaseAccuracy {
    pub phase: String,
    pub mean_absolute_percent_error: f64,
    pub sample_count: i64,
}

/// Rolls `estimate_accuracy`'s per-execution rows up into one MAPE per
/// phase for `plugin_name`. Executions with no recorded estimate, or with
/// `actual_wall_seconds <= 0`, are excluded (see `EstimateAccuracyRow::
/// relative_error`) rather than counted as zero error.
pub async fn estimate_accuracy_by_phase(pool: &HistoryPool, plugin_name: &str) -> Result<Vec<PhaseAccuracy>> {
    let rows = estimate_accuracy(pool, plugin_name).await?;

    let mut errors_by_phase: HashMap<String, Vec<f64>> = HashMap::new();
    for row in &rows {
        if let Some(error) = row.relative_error() {
            errors_by_phase.entry(row.phase.clone()).or_default().push(error);
        }
    }

    let mut summaries: Vec<PhaseAccuracy> = errors_by_phase
        .into_iter()
        .map(|(phase, errors)| {
            let sample_count = errors.len() as i64;
            let mean_absolute_percent_error = errors.iter().sum::<f64>() / errors.len() as f64 * 100.0;
            PhaseAccuracy {
                phase,
                mean_absolute_percent_error,
                sample_count,
            }
        })
        .collect();
    summaries.sort_by(|a, b| a.phase.cmp(&b.phase));
    Ok(summaries)
}

/// All `StepMetrics` rows recorded for one execution.
pub async fn steps_for_execution(pool: &HistoryPool, execution_id: &str) -> Result<Vec<StepMetricsInsertRow>> {
    let mut conn = pool.get().await?;
    let rows = step_metrics::table
        .filter(step_metrics::execution_id.eq(execution_id))
        .select((
            step_metrics::execution_id,
            step_metrics::step_name,
            step_metrics::phase,
            step_metrics::start_time,
            step_metrics::end_time,
            step_metrics::wall_clock_seconds,
            step_metrics::cpu_user_seconds,
            step_metrics::cpu_kernel_seconds,
            step_metrics::peak_memory_bytes,
            step_metrics::avg_memory_bytes,
            step_metrics::io_read_bytes,
            step_metrics::io_write_bytes,
            step_metrics::io_read_ops,
            step_metrics::io_write_ops,
            step_metrics::net_rx_bytes,
            step_metrics::net_tx_bytes,
            step_metrics::download_size_bytes,
            step_metrics::download_speed_bps,
        ))
        .load::<StepMetricsInsertRow>(&mut conn)
        .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_error_none_without_estimate() {
        let row = EstimateAccuracyRow {
            execution_id: "e1".into(),
            phase: "download".into(),
            estimated_wall_seconds: None,
            actual_wall_seconds: 12.0,
            confidence: None,
        };
        assert_eq!(row.relative_error(), None);
    }

    #[test]
    fn relative_error_computes_ratio() {
        let row = EstimateAccuracyRow {
            execution_id: "e1".into(),
            phase: "download".into(),
            estimated_wall_seconds: Some(9.0),
            actual_wall_seconds: 12.0,
            confidence: Some(0.8),
        };
        assert!((row.relative_error().unwrap() - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn estimate_accuracy_by_phase_groups_and_averages_one_phase() {
        use super::super::models::{EstimateRow, StepMetricsRow};
        use super::super::HistoryStore;
        use chrono::Utc;

        let db_path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        let history = HistoryStore::open(&db_path.to_string_lossy()).await.unwrap();
        let run = history.create_run("host", "user", "fingerprint").await.unwrap();
        let execution = history.create_execution(&run.id, "apt").await.unwrap();

        history
            .insert_estimate(EstimateRow {
                execution_id: execution.id.clone(),
                phase: "EXECUTE".into(),
                download_bytes: None,
                cpu_seconds: None,
                wall_seconds: Some(10.0),
                memory_bytes: None,
                package_count: None,
                confidence: None,
            })
            .await
            .unwrap();

        let now = Utc::now();
        history
            .insert_step_metrics(StepMetricsRow {
                execution_id: execution.id.clone(),
                step_name: "update".into(),
                phase: "EXECUTE".into(),
                start_time: now,
                end_time: now,
                wall_clock_seconds: 12.0,
                cpu_user_seconds: 0.0,
                cpu_kernel_seconds: 0.0,
                peak_memory_bytes: 0,
                avg_memory_bytes: 0,
                io_read_bytes: 0,
                io_write_bytes: 0,
                io_read_ops: 0,
                io_write_ops: 0,
                net_rx_bytes: 0,
                net_tx_bytes: 0,
                download_size_bytes: None,
                download_speed_bps: None,
            })
            .await
            .unwrap();

        let summary = estimate_accuracy_by_phase(history.pool(), "apt").await.unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].phase, "EXECUTE");
        assert_eq!(summary[0].sample_count, 1);
        let expected = (10.0f64 - 12.0).abs() / 12.0 * 100.0;
        assert!((summary[0].mean_absolute_percent_error - expected).abs() < 1e-9);
    }
}
