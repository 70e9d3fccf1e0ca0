//! Wraps an arbitrary executable satisfying the verb protocol: the core
//! invokes it with a subcommand verb and parses standardized output.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command as TokioCommand;
use tokio_util::sync::CancellationToken;

use crate::domain::Phase;
use crate::metrics::UsageSink;
use crate::plugin::{Identity, Plugin, PluginEstimate};
use crate::process_runner::{self, RunSpec};
use crate::stream::{EventSink, StreamEvent};

/// An external plugin's capabilities that don't change between runs:
/// mutex/dependency declarations, sudo requirement, and whether download
/// can run separately from update. Discovered once via `ExternalPlugin::discover`
/// since the `Plugin` trait's probes for these are synchronous.
#[derive(Debug, Clone, Default)]
struct StaticCapabilities {
    mutexes_by_phase: HashMap<Phase, BTreeSet<String>>,
    dependencies_by_phase: HashMap<Phase, BTreeSet<String>>,
    sudo_paths: Vec<String>,
    supports_split_download: bool,
}

pub struct ExternalPlugin {
    executable: PathBuf,
    name: String,
    capabilities: StaticCapabilities,
}

impl ExternalPlugin {
    /// Probes the executable once for its phase-independent declarations
    /// and returns a ready-to-use plugin handle.
    pub async fn discover(executable: impl Into<PathBuf>) -> Self {
        let executable = executable.into();
        let name = executable
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("external-plugin")
            .to_string();

        let mut mutexes_by_phase = HashMap::new();
        let mut dependencies_by_phase = HashMap::new();
        for phase in [Phase::Check, Phase::Download, Phase::Execute] {
            mutexes_by_phase.insert(phase, run_verb_lines(&executable, &format!("{}-mutexes", phase_verb(phase))).await);
            dependencies_by_phase.insert(
                phase,
                run_verb_lines(&executable, &format!("{}-dependency", phase_verb(phase))).await,
            );
        }

        let sudo_paths = run_verb_lines(&executable, "sudo-programs-paths")
            .await
            .into_iter()
            .collect();
        let supports_split_download = matches!(run_verb(&executable, "can-separate-download").await, Some((true, _)));

        Self {
            executable,
            name,
            capabilities: StaticCapabilities {
                mutexes_by_phase,
                dependencies_by_phase,
                sudo_paths,
                supports_split_download,
            },
        }
    }
}

fn phase_verb(phase: Phase) -> &'static str {
    match phase {
        Phase::Check => "check",
        Phase::Download => "download",
        Phase::Execute => "update",
    }
}

async fn run_verb(executable: &PathBuf, verb: &str) -> Option<(bool, String)> {
    let output = TokioCommand::new(executable).arg(verb).output().await.ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Some((output.status.success(), stdout))
}

async fn run_verb_lines(executable: &PathBuf, verb: &str) -> BTreeSet<String> {
    match run_verb(executable, verb).await {
        Some((true, stdout)) => stdout.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect(),
        _ => BTreeSet::new(),
    }
}

#[async_trait]
impl Plugin for ExternalPlugin {
    fn identity(&self) -> Identity {
        Identity {
            name: self.name.clone(),
            description: format!("external plugin at {}", self.executable.display()),
            primary_command: self.executable.display().to_string(),
        }
    }

    async fn is_applicable(&self) -> bool {
        matches!(run_verb(&self.executable, "is-applicable").await, Some((true, _)))
    }

    async fn installed_version(&self) -> Option<String> {
        match run_verb(&self.executable, "installed-version").await {
            Some((true, v)) if !v.is_empty() => Some(v),
            _ => None,
        }
    }

    async fn available_version(&self) -> Option<String> {
        match run_verb(&self.executable, "available-version").await {
            Some((true, v)) if !v.is_empty() => Some(v),
            _ => None,
        }
    }

    async fn estimate(&self) -> Option<PluginEstimate> {
        let (success, stdout) = run_verb(&self.executable, "estimate-update").await?;
        if !success || stdout.is_empty() {
            return None;
        }
        #[derive(serde::Deserialize)]
        struct Raw {
            download_bytes: Option<u64>,
            cpu_seconds: Option<f64>,
            wall_seconds: Option<f64>,
            #[allow(dead_code)]
            memory_bytes: Option<u64>,
            package_count: Option<u32>,
            confidence: Option<f64>,
        }
        let raw: Raw = serde_json::from_str(&stdout).ok()?;
        Some(PluginEstimate {
            download_bytes: raw.download_bytes,
            package_count: raw.package_count,
            seconds: raw.wall_seconds.or(raw.cpu_seconds),
            confidence: raw.confidence,
        })
    }

    fn supports_split_download(&self) -> bool {
        self.capabilities.supports_split_download
    }

    fn required_mutexes(&self, phase: Phase) -> BTreeSet<String> {
        self.capabilities.mutexes_by_phase.get(&phase).cloned().unwrap_or_default()
    }

    fn required_dependencies(&self, phase: Phase) -> BTreeSet<String> {
        self.capabilities.dependencies_by_phase.get(&phase).cloned().unwrap_or_default()
    }

    fn sudo_commands(&self) -> Vec<String> {
        self.capabilities.sudo_paths.clone()
    }

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn execute(
        &self,
        phase: Phase,
        dry_run: bool,
        cancel: CancellationToken,
        sink: EventSink,
        usage: UsageSink,
    ) {
        if phase == Phase::Check || (dry_run && phase == Phase::Execute) {
            sink.publish(StreamEvent::Completion {
                success: true,
                exit_code: Some(0),
                packages_updated: 0,
                error: None,
            })
            .await;
            return;
        }

        let requires_sudo = matches!(run_verb(&self.executable, "does-require-sudo").await, Some((true, _)));

        sink.publish(StreamEvent::PhaseStart { phase }).await;

        let spec = RunSpec {
            argv: vec![self.executable.display().to_string(), phase_verb(phase).to_string()],
            sudo: requires_sudo,
            timeout: None,
            success_patterns: Vec::new(),
            error_patterns: Vec::new(),
            ignore_exit_codes: Vec::new(),
            phase,
        };
        let outcome = process_runner::run(spec, cancel, &sink).await;
        usage.record(phase.default_step(), phase, outcome.usage).await;

        sink.publish(StreamEvent::PhaseEnd {
            phase,
            success: outcome.success,
            error: outcome.error.clone(),
        })
        .await;

        sink.publish(StreamEvent::Completion {
            success: outcome.success,
            exit_code: outcome.exit_code,
            packages_updated: if outcome.success && phase == Phase::Execute { 1 } else { 0 },
            error: outcome.error,
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_verb_maps_to_protocol_names() {
        assert_eq!(phase_verb(Phase::Check), "check");
        assert_eq!(phase_verb(Phase::Download), "download");
        assert_eq!(phase_verb(Phase::Execute), "update");
    }

    #[tokio::test]
    async fn discover_on_missing_executable_yields_empty_capabilities() {
        let plugin = ExternalPlugin::discover("/nonexistent/updater-binary").await;
        assert_eq!(plugin.identity().name, "updater-binary");
        assert!(plugin.required_mutexes(Phase::Execute).is_empty());
        assert!(!plugin.supports_split_download());
    }
}
