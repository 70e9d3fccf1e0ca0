//! The Plugin Contract: the polymorphic abstraction every back-end —
//! in-process or external-executable — satisfies, as a single
//! `async_trait` object-safe interface.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{NeedsUpdate, Phase};
use crate::metrics::UsageSink;

/// Stable identity of a plugin.
#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    pub description: String,
    pub primary_command: String,
}

/// A plugin's own pre-execution estimate.
#[derive(Debug, Clone, Default)]
pub struct PluginEstimate {
    pub download_bytes: Option<u64>,
    pub package_count: Option<u32>,
    pub seconds: Option<f64>,
    pub confidence: Option<f64>,
}

/// Inter-plugin and mutex declarations a plugin makes for a given phase.
#[derive(Debug, Clone, Default)]
pub struct PhaseRequirements {
    /// Named resources this phase must hold for its duration.
    pub mutexes: BTreeSet<String>,
    /// Named resources that, advisorially, should be free for the scheduler
    /// to prefer running this plugin now.
    pub dependencies: BTreeSet<String>,
}

/// One command to run as part of a phase, for plugins built on the
/// declarative base.
#[derive(Debug, Clone)]
pub struct UpdateCommand {
    pub argv: Vec<String>,
    pub description: String,
    pub sudo: bool,
    pub timeout: Option<std::time::Duration>,
    pub phase: Phase,
    pub ignore_exit_codes: Vec<i32>,
    pub success_patterns: Vec<String>,
    pub error_patterns: Vec<String>,
}

/// The capability set every plugin exposes.
///
/// Implementations may be in-process modules (see `plugins::command`) or
/// wrappers around an external executable satisfying a verb protocol (see
/// `plugins::external`).
#[async_trait]
pub trait Plugin: Send + Sync {
    fn identity(&self) -> Identity;

    /// Never fails: a probe error here is a plugin author bug, not a runtime
    /// condition — plugins that cannot determine applicability should
    /// return `false`.
    async fn is_applicable(&self) -> bool;

    /// Returns `None` on probe failure (TransientIOError, downgraded to
    /// "unknown" by the caller).
    async fn installed_version(&self) -> Option<String>;

    async fn available_version(&self) -> Option<String>;

    /// Default implementation compares `installed_version`/`available_version`
    /// by string inequality. Plugins with richer version semantics (semver,
    /// etc.) override this.
    async fn needs_update(&self) -> NeedsUpdate {
        match (self.installed_version().await, self.available_version().await) {
            (Some(installed), Some(available)) => {
                if installed == available {
                    NeedsUpdate::No
                } else {
                    NeedsUpdate::Yes
                }
            }
            _ => NeedsUpdate::Unknown,
        }
    }

    /// `None` when estimation is unsupported for this plugin.
    async fn estimate(&self) -> Option<PluginEstimate> {
        None
    }

    fn supports_split_download(&self) -> bool {
        false
    }

    fn required_mutexes(&self, phase: Phase) -> BTreeSet<String>;

    fn required_dependencies(&self, phase: Phase) -> BTreeSet<String> {
        let _ = phase;
        BTreeSet::new()
    }

    /// Absolute paths of executables this plugin needs to elevate.
    fn sudo_commands(&self) -> Vec<String> {
        Vec::new()
    }

    /// Plugin names whose successful completion must precede this plugin's
    /// first phase.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Runs one phase, streaming events through `sink` and terminating with
    /// exactly one `StreamEvent::Completion`. Resource
    /// usage observed by the underlying process runner is reported into
    /// `usage` for the Metrics Collector to finalize.
    async fn execute(
        &self,
        phase: Phase,
        dry_run: bool,
        cancel: CancellationToken,
        sink: crate::stream::EventSink,
        usage: UsageSink,
    );
}

pub fn requirements(plugin: &dyn Plugin, phase: Phase) -> PhaseRequirements {
    PhaseRequirements {
        mutexes: plugin.required_mutexes(phase),
        dependencies: plugin.required_dependencies(phase),
    }
}
