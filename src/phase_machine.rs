//! The Phase Machine: drives one plugin through CHECK, an optional
//! DOWNLOAD, and EXECUTE, turning scheduler/mutex state into ticket
//! requests and relaying each phase's event stream into the Metrics
//! Collector and History Store.
//!
//! pending -> checking -> (up_to_date | downloading -> updating) ->
//! done | failed | cancelled | timed_out, with every non-pending
//! transition persisted as a `PluginExecution` status change.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::domain::{NeedsUpdate, Phase, PluginStatus};
use crate::error::EngineError;
use crate::estimator::{Estimator, Target};
use crate::history::models::EstimateRow;
use crate::history::HistoryStore;
use crate::metrics::{MetricsCollector, UsageSink};
use crate::plugin::Plugin;
use crate::scheduler::{DependencyOutcome, Scheduler};
use crate::stream::{EventSink, StreamEvent};

/// Configuration a run applies uniformly to every plugin's phase machine.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub dry_run: bool,
    pub phase_timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            phase_timeout: Some(Duration::from_secs(3600)),
        }
    }
}

/// Final disposition of one plugin's run, reported up to the orchestrator
/// for tallying into the closing `RunRow`.
#[derive(Debug, Clone)]
pub struct PluginOutcome {
    pub plugin_name: String,
    pub status: PluginStatus,
    pub packages_updated: i32,
    pub error: Option<String>,
}

struct PhaseRunResult {
    status: PluginStatus,
    packages_updated: i32,
    exit_code: Option<i32>,
    error: Option<String>,
}

enum PhaseError {
    Cancelled,
    Timeout,
    Failed(String, Option<i32>),
}

pub struct PhaseMachine {
    plugin: Arc<dyn Plugin>,
    scheduler: Scheduler,
    history: HistoryStore,
    metrics: Arc<MetricsCollector>,
    estimator: Estimator,
    options: RunOptions,
}

impl PhaseMachine {
    pub fn new(
        plugin: Arc<dyn Plugin>,
        scheduler: Scheduler,
        history: HistoryStore,
        metrics: Arc<MetricsCollector>,
        estimator: Estimator,
        options: RunOptions,
    ) -> Self {
        Self {
            plugin,
            scheduler,
            history,
            metrics,
            estimator,
            options,
        }
    }

    /// Drives this plugin from dependency wait through its terminal state,
    /// persisting every transition and returning the final tally.
    #[instrument(skip(self, cancel), fields(plugin = %self.plugin.identity().name))]
    pub async fn run(&self, run_id: &str, cancel: CancellationToken) -> PluginOutcome {
        let name = self.plugin.identity().name;

        match self.scheduler.wait_for_dependencies(&name).await {
            DependencyOutcome::Proceed => {}
            DependencyOutcome::SkipDueTo(dep) => {
                info!(blocking_dependency = %dep, "skipping: dependency did not succeed");
                self.scheduler.record_status(&name, PluginStatus::Skipped).await;
                return PluginOutcome {
                    plugin_name: name,
                    status: PluginStatus::Skipped,
                    packages_updated: 0,
                    error: Some(format!("dependency {dep} did not succeed")),
                };
            }
            DependencyOutcome::Cancelled => {
                self.scheduler.record_status(&name, PluginStatus::Cancelled).await;
                return PluginOutcome {
                    plugin_name: name,
                    status: PluginStatus::Cancelled,
                    packages_updated: 0,
                    error: Some("cancelled before start".to_string()),
                };
            }
        }

        let execution = match self.history.create_execution(run_id, &name).await {
            Ok(row) => row,
            Err(err) => {
                warn!(error = %err, "failed to create execution row");
                self.scheduler.record_status(&name, PluginStatus::Failed).await;
                return PluginOutcome {
                    plugin_name: name,
                    status: PluginStatus::Failed,
                    packages_updated: 0,
                    error: Some(err.to_string()),
                };
            }
        };

        if !self.plugin.is_applicable().await {
            let _ = self
                .history
                .mark_execution_terminal(&execution.id, PluginStatus::Skipped, 0, None, Some("not applicable"))
                .await;
            self.scheduler.record_status(&name, PluginStatus::Skipped).await;
            return PluginOutcome {
                plugin_name: name,
                status: PluginStatus::Skipped,
                packages_updated: 0,
                error: None,
            };
        }

        if let Err(err) = self.history.mark_execution_started(&execution.id).await {
            warn!(error = %err, "failed to mark execution started");
        }

        let result = self.run_phases(&name, &execution.id, cancel).await;

        if let Err(err) = self
            .history
            .mark_execution_terminal(
                &execution.id,
                result.status,
                result.packages_updated,
                result.exit_code,
                result.error.as_deref(),
            )
            .await
        {
            warn!(error = %err, "failed to record terminal execution state");
        }
        self.scheduler.record_status(&name, result.status).await;

        PluginOutcome {
            plugin_name: name,
            status: result.status,
            packages_updated: result.packages_updated,
            error: result.error,
        }
    }

    async fn run_phases(&self, name: &str, execution_id: &str, cancel: CancellationToken) -> PhaseRunResult {
        if matches!(self.plugin.needs_update().await, NeedsUpdate::No) {
            return PhaseRunResult {
                status: PluginStatus::Skipped,
                packages_updated: 0,
                exit_code: None,
                error: None,
            };
        }

        let phases: &[Phase] = if self.plugin.supports_split_download() {
            &[Phase::Check, Phase::Download, Phase::Execute]
        } else {
            &[Phase::Check, Phase::Execute]
        };

        let mut total_packages = 0;
        for &phase in phases {
            if cancel.is_cancelled() {
                return PhaseRunResult {
                    status: PluginStatus::Cancelled,
                    packages_updated: total_packages,
                    exit_code: None,
                    error: Some("cancelled".to_string()),
                };
            }
            match self.run_one_phase(name, execution_id, phase, cancel.clone()).await {
                Ok(packages) => total_packages += packages,
                Err(PhaseError::Cancelled) => {
                    return PhaseRunResult {
                        status: PluginStatus::Cancelled,
                        packages_updated: total_packages,
                        exit_code: None,
                        error: Some("cancelled".to_string()),
                    }
                }
                Err(PhaseError::Timeout) => {
                    return PhaseRunResult {
                        status: PluginStatus::Timeout,
                        packages_updated: total_packages,
                        exit_code: None,
                        error: Some(format!("{phase} timed out")),
                    }
                }
                Err(PhaseError::Failed(message, exit_code)) => {
                    return PhaseRunResult {
                        status: PluginStatus::Failed,
                        packages_updated: total_packages,
                        exit_code,
                        error: Some(message),
                    }
                }
            }
        }

        PhaseRunResult {
            status: PluginStatus::Success,
            packages_updated: total_packages,
            exit_code: Some(0),
            error: None,
        }
    }

    async fn run_one_phase(
        &self,
        name: &str,
        execution_id: &str,
        phase: Phase,
        cancel: CancellationToken,
    ) -> Result<i32, PhaseError> {
        // A dry run never acquires EXECUTE-phase mutexes or spawns its
        // child: report the synthetic success the plugin would have
        // emitted, with no ticket requested and no StepMetrics row written.
        if self.options.dry_run && phase == Phase::Execute {
            return Ok(0);
        }

        let mutexes = self.plugin.required_mutexes(phase);
        let plugin_estimate = self.plugin.estimate().await;
        let phase_label = phase.to_string();
        let trained_wall = self.estimator.estimate(name, &phase_label, Target::WallClockSeconds).await;
        let trained_memory = self.estimator.estimate(name, &phase_label, Target::MemoryPeakBytes).await;
        let estimated_wall = plugin_estimate
            .as_ref()
            .and_then(|e| e.seconds)
            .or_else(|| trained_wall.map(|e| e.point))
            .unwrap_or(30.0);
        let estimated_memory = trained_memory.map(|e| e.point as u64).unwrap_or(0);

        let ticket = match self
            .scheduler
            .request_ticket(name, phase, mutexes, estimated_wall, estimated_memory)
            .await
        {
            Ok(ticket) => ticket,
            Err(EngineError::Cancelled) => return Err(PhaseError::Cancelled),
            Err(err) => return Err(PhaseError::Failed(err.to_string(), None)),
        };

        let estimate_row = EstimateRow {
            execution_id: execution_id.to_string(),
            phase: phase_label.clone(),
            download_bytes: plugin_estimate.as_ref().and_then(|e| e.download_bytes).map(|b| b as i64),
            cpu_seconds: None,
            wall_seconds: Some(estimated_wall),
            memory_bytes: Some(estimated_memory as i64),
            package_count: plugin_estimate.as_ref().and_then(|e| e.package_count).map(|c| c as i32),
            confidence: plugin_estimate.as_ref().and_then(|e| e.confidence),
        };
        if let Err(err) = self.history.insert_estimate(estimate_row).await {
            warn!(phase = %phase, error = %err, "failed to persist estimate");
        }

        let sink = EventSink::default();
        let mut receiver = sink.subscribe().await;
        let usage = UsageSink::new();
        let step = phase.default_step();
        self.metrics.begin_step(execution_id, step, phase).await;

        let execute_fut = self
            .plugin
            .execute(phase, self.options.dry_run, cancel.clone(), sink.clone(), usage.clone());
        let timed_out = match self.options.phase_timeout {
            Some(timeout) => tokio::time::timeout(timeout, execute_fut).await.is_err(),
            None => {
                execute_fut.await;
                false
            }
        };

        let mut completion = None;
        while let Some(event) = receiver.recv().await {
            if matches!(event, StreamEvent::Completion { .. }) {
                completion = Some(event);
            }
        }

        let exit_usage = usage.take(step, phase).await;
        let metrics_row = self.metrics.finalize_step(execution_id, step, phase, exit_usage).await;
        if let Err(err) = self.history.insert_step_metrics(metrics_row).await {
            warn!(phase = %phase, error = %err, "failed to persist step metrics");
        }

        ticket.release().await;

        if timed_out {
            cancel.cancel();
            return Err(PhaseError::Timeout);
        }

        match completion {
            Some(StreamEvent::Completion {
                success: true,
                packages_updated,
                ..
            }) => Ok(packages_updated as i32),
            Some(StreamEvent::Completion {
                success: false,
                exit_code,
                error,
                ..
            }) => {
                if cancel.is_cancelled() {
                    Err(PhaseError::Cancelled)
                } else {
                    Err(PhaseError::Failed(error.unwrap_or_else(|| "update failed".to_string()), exit_code))
                }
            }
            _ => Err(PhaseError::Failed("plugin did not emit a completion event".to_string(), None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::history::HistoryStore;
    use crate::mutex_manager::MutexManager;
    use crate::plugin::{Identity, PluginEstimate};
    use crate::scheduler::{Budgets, PluginNode};

    /// A fresh on-disk sqlite path for one test. The history store opens a
    /// new connection per call, so a shared-cache `:memory:` db (destroyed
    /// once its last connection closes) won't do; a temp file persists for
    /// the test's lifetime.
    fn temp_db_url() -> String {
        let path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        let url = path.to_string_lossy().into_owned();
        std::mem::forget(path);
        url
    }

    struct StubPlugin {
        name: String,
        needs_update: NeedsUpdate,
        succeed: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Plugin for StubPlugin {
        fn identity(&self) -> Identity {
            Identity {
                name: self.name.clone(),
                description: "stub".into(),
                primary_command: "stub".into(),
            }
        }

        async fn is_applicable(&self) -> bool {
            true
        }

        async fn installed_version(&self) -> Option<String> {
            Some("1".into())
        }

        async fn available_version(&self) -> Option<String> {
            Some("2".into())
        }

        async fn needs_update(&self) -> NeedsUpdate {
            self.needs_update
        }

        async fn estimate(&self) -> Option<PluginEstimate> {
            None
        }

        fn required_mutexes(&self, _phase: Phase) -> BTreeSet<String> {
            BTreeSet::new()
        }

        async fn execute(
            &self,
            phase: Phase,
            _dry_run: bool,
            _cancel: CancellationToken,
            sink: EventSink,
            _usage: UsageSink,
        ) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            sink.publish(StreamEvent::PhaseStart { phase }).await;
            sink.publish(StreamEvent::Completion {
                success: self.succeed,
                exit_code: Some(if self.succeed { 0 } else { 1 }),
                packages_updated: if self.succeed && phase == Phase::Execute { 1 } else { 0 },
                error: if self.succeed { None } else { Some("boom".into()) },
            })
            .await;
        }
    }

    async fn harness(plugin: Arc<StubPlugin>) -> (PhaseMachine, HistoryStore, String) {
        harness_with_options(plugin, RunOptions::default()).await
    }

    async fn harness_with_options(plugin: Arc<StubPlugin>, options: RunOptions) -> (PhaseMachine, HistoryStore, String) {
        let history = HistoryStore::open(&temp_db_url()).await.unwrap();
        let run = history.create_run("test-host", "test-user", "fingerprint").await.unwrap();
        let nodes = vec![PluginNode {
            name: plugin.name.clone(),
            dependencies: Vec::new(),
        }];
        let scheduler = Scheduler::new(&nodes, Budgets::default(), MutexManager::new()).unwrap();
        let estimator = Estimator::new(history.pool().clone(), 0.1);
        let metrics = Arc::new(MetricsCollector::new());
        let machine = PhaseMachine::new(plugin, scheduler, history.clone(), metrics, estimator, options);
        (machine, history, run.id)
    }

    #[tokio::test]
    async fn up_to_date_plugin_skips_without_invoking_execute() {
        let plugin = Arc::new(StubPlugin {
            name: "apt".into(),
            needs_update: NeedsUpdate::No,
            succeed: true,
            calls: AtomicUsize::new(0),
        });
        let (machine, _history, run_id) = harness(plugin.clone()).await;
        let outcome = machine.run(&run_id, CancellationToken::new()).await;
        assert_eq!(outcome.status, PluginStatus::Skipped);
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_plugin_runs_check_and_execute_phases() {
        let plugin = Arc::new(StubPlugin {
            name: "brew".into(),
            needs_update: NeedsUpdate::Yes,
            succeed: true,
            calls: AtomicUsize::new(0),
        });
        let (machine, history, run_id) = harness(plugin.clone()).await;
        let outcome = machine.run(&run_id, CancellationToken::new()).await;
        assert_eq!(outcome.status, PluginStatus::Success);
        assert_eq!(outcome.packages_updated, 1);
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 2);

        let executions = history.list_executions_for_run(&run_id).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, "success");
    }

    #[tokio::test]
    async fn failing_phase_marks_plugin_failed() {
        let plugin = Arc::new(StubPlugin {
            name: "dnf".into(),
            needs_update: NeedsUpdate::Yes,
            succeed: false,
            calls: AtomicUsize::new(0),
        });
        let (machine, _history, run_id) = harness(plugin).await;
        let outcome = machine.run(&run_id, CancellationToken::new()).await;
        assert_eq!(outcome.status, PluginStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn dry_run_skips_execute_phase_entirely() {
        let plugin = Arc::new(StubPlugin {
            name: "yum".into(),
            needs_update: NeedsUpdate::Yes,
            succeed: true,
            calls: AtomicUsize::new(0),
        });
        let options = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        let (machine, history, run_id) = harness_with_options(plugin.clone(), options).await;
        let outcome = machine.run(&run_id, CancellationToken::new()).await;
        assert_eq!(outcome.status, PluginStatus::Success);
        assert_eq!(outcome.packages_updated, 0);
        // Only the CHECK phase actually invokes the plugin; EXECUTE is
        // short-circuited before `Plugin::execute` is ever called.
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 1);

        let executions = history.list_executions_for_run(&run_id).await.unwrap();
        let step_metrics = crate::history::queries::steps_for_execution(history.pool(), &executions[0].id)
            .await
            .unwrap();
        assert!(
            step_metrics.iter().all(|m| m.phase != "EXECUTE"),
            "dry run must not write an EXECUTE-phase StepMetrics row"
        );
    }
}
