//! The Orchestrator: opens a Run, builds a Phase Machine per enabled and
//! applicable plugin, hands the set to the Scheduler, runs every issued
//! ticket as a concurrent task, and closes the Run with final tallies.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::domain::PluginStatus;
use crate::error::Result;
use crate::estimator::Estimator;
use crate::history::{HistoryStore, RunTallies};
use crate::metrics::MetricsCollector;
use crate::mutex_manager::MutexManager;
use crate::phase_machine::{PhaseMachine, PluginOutcome, RunOptions};
use crate::plugin::Plugin;
use crate::scheduler::{Budgets, PluginNode, Scheduler};

/// Final disposition of one invocation of the engine.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub outcomes: Vec<PluginOutcome>,
}

impl RunResult {
    /// 0 if every plugin succeeded, 1 if any failed, 2 if any was
    /// cancelled. Invalid configuration (exit code 3) is reported before a
    /// run ever starts and has no `RunResult` to report from.
    pub fn exit_code(&self) -> i32 {
        if self.outcomes.iter().any(|o| o.status == PluginStatus::Cancelled) {
            2
        } else if self.outcomes.iter().any(|o| o.status == PluginStatus::Failed) {
            1
        } else {
            0
        }
    }
}

pub struct Orchestrator {
    config: AppConfig,
    history: HistoryStore,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Orchestrator {
    pub fn new(config: AppConfig, history: HistoryStore, plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self {
            config,
            history,
            plugins,
        }
    }

    /// Runs every enabled, applicable plugin to completion and returns the
    /// tally. `cancel` is the process-wide cancellation root; the caller
    /// (the CLI) triggers it on Ctrl-C.
    pub async fn run(&self, host: &str, user: &str, cancel: CancellationToken) -> Result<RunResult> {
        let fingerprint = self.config.fingerprint();
        let run = self.history.create_run(host, user, &fingerprint).await?;

        let mut applicable = Vec::new();
        for plugin in &self.plugins {
            let name = plugin.identity().name;
            if !self.config.is_plugin_enabled(&name) {
                info!(plugin = %name, "disabled by configuration, skipping");
                continue;
            }
            if !plugin.is_applicable().await {
                info!(plugin = %name, "not applicable on this host, skipping");
                continue;
            }
            applicable.push(plugin.clone());
        }

        if applicable.is_empty() {
            self.history.close_run(&run.id, RunTallies::default()).await?;
            return Ok(RunResult {
                run_id: run.id,
                outcomes: Vec::new(),
            });
        }

        let nodes: Vec<PluginNode> = applicable
            .iter()
            .map(|p| PluginNode {
                name: p.identity().name,
                dependencies: p.dependencies(),
            })
            .collect();

        let budgets = Budgets {
            max_parallel: self.config.max_parallel_tasks,
            max_memory_bytes: self.config.max_memory_bytes,
            max_cpu_load: None,
            max_parallel_downloads: self.config.max_parallel_downloads,
        };
        let scheduler = Scheduler::new(&nodes, budgets, MutexManager::new())?;
        let metrics = Arc::new(MetricsCollector::new());
        let estimator = Estimator::new(self.history.pool().clone(), self.config.confidence_alpha);

        let run_id = run.id.clone();
        let mut tasks = Vec::with_capacity(applicable.len());
        for plugin in applicable {
            let name = plugin.identity().name;
            let options = RunOptions {
                dry_run: self.config.dry_run,
                phase_timeout: self
                    .config
                    .plugin_timeout(&name)
                    .or(Some(std::time::Duration::from_secs(3600))),
            };
            let machine = PhaseMachine::new(
                plugin,
                scheduler.clone(),
                self.history.clone(),
                metrics.clone(),
                estimator.clone(),
                options,
            );
            let run_id = run_id.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move { machine.run(&run_id, cancel).await }));
        }

        let outer_cancel = cancel.clone();
        let scheduler_for_cancel = scheduler.clone();
        tokio::spawn(async move {
            outer_cancel.cancelled().await;
            scheduler_for_cancel.cancel_all();
        });

        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => warn!(error = %err, "plugin task panicked"),
            }
        }

        let tallies = tally(&outcomes);
        self.history.close_run(&run_id, tallies).await?;

        Ok(RunResult {
            run_id,
            outcomes,
        })
    }
}

fn tally(outcomes: &[PluginOutcome]) -> RunTallies {
    let mut tallies = RunTallies {
        total: outcomes.len() as i32,
        ..Default::default()
    };
    for outcome in outcomes {
        match outcome.status {
            PluginStatus::Success => tallies.succeeded += 1,
            PluginStatus::Skipped => tallies.skipped += 1,
            _ => tallies.failed += 1,
        }
    }
    tallies
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use async_trait::async_trait;

    use crate::domain::{NeedsUpdate, Phase};
    use crate::metrics::UsageSink;
    use crate::plugin::{Identity, PluginEstimate};
    use crate::stream::{EventSink, StreamEvent};

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

    struct EchoPlugin {
        name: String,
        mutexes: BTreeSet<String>,
    }

    #[async_trait]
    impl Plugin for EchoPlugin {
        fn identity(&self) -> Identity {
            Identity {
                name: self.name.clone(),
                description: "echo".into(),
                primary_command: "echo".into(),
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
            NeedsUpdate::Yes
        }

        async fn estimate(&self) -> Option<PluginEstimate> {
            None
        }

        fn required_mutexes(&self, phase: Phase) -> BTreeSet<String> {
            if phase == Phase::Execute {
                self.mutexes.clone()
            } else {
                BTreeSet::new()
            }
        }

        async fn execute(&self, phase: Phase, _dry_run: bool, _cancel: CancellationToken, sink: EventSink, _usage: UsageSink) {
            sink.publish(StreamEvent::PhaseStart { phase }).await;
            sink.publish(StreamEvent::Completion {
                success: true,
                exit_code: Some(0),
                packages_updated: if phase == Phase::Execute { 1 } else { 0 },
                error: None,
            })
            .await;
        }
    }

    #[tokio::test]
    async fn run_with_no_plugins_closes_an_empty_run() {
        let history = HistoryStore::open(&temp_db_url()).await.unwrap();
        let orchestrator = Orchestrator::new(AppConfig::default(), history, Vec::new());
        let result = orchestrator.run("host", "user", CancellationToken::new()).await.unwrap();
        assert!(result.outcomes.is_empty());
        assert_eq!(result.exit_code(), 0);
    }

    #[tokio::test]
    async fn two_independent_plugins_both_succeed() {
        let history = HistoryStore::open(&temp_db_url()).await.unwrap();
        let plugins: Vec<Arc<dyn Plugin>> = vec![
            Arc::new(EchoPlugin {
                name: "a".into(),
                mutexes: BTreeSet::new(),
            }),
            Arc::new(EchoPlugin {
                name: "b".into(),
                mutexes: BTreeSet::new(),
            }),
        ];
        let orchestrator = Orchestrator::new(AppConfig::default(), history, plugins);
        let result = orchestrator.run("host", "user", CancellationToken::new()).await.unwrap();
        assert_eq!(result.outcomes.len(), 2);
        assert!(result.outcomes.iter().all(|o| o.status == PluginStatus::Success));
        assert_eq!(result.exit_code(), 0);
    }

    #[tokio::test]
    async fn disabled_plugin_is_excluded_from_the_run() {
        let history = HistoryStore::open(&temp_db_url()).await.unwrap();
        let plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(EchoPlugin {
            name: "a".into(),
            mutexes: BTreeSet::new(),
        })];
        let mut config = AppConfig::default();
        config.plugin.insert(
            "a".into(),
            crate::config::PluginConfig {
                enabled: false,
                timeout_seconds: None,
            },
        );
        let orchestrator = Orchestrator::new(config, history, plugins);
        let result = orchestrator.run("host", "user", CancellationToken::new()).await.unwrap();
        assert!(result.outcomes.is_empty());
    }
}
