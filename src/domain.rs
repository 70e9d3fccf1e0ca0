//! Shared vocabulary types used across the plugin contract, scheduler, phase
//! machine and history store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the three phases a plugin passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Check,
    Download,
    Execute,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Check => "CHECK",
            Phase::Download => "DOWNLOAD",
            Phase::Execute => "EXECUTE",
        };
        f.write_str(s)
    }
}

/// `StepMetrics.step_name`: the logical unit of work a phase's
/// resource usage is attributed to. Distinct from `Phase` because a plugin
/// may run several named steps within one phase in a richer implementation;
/// the reference plugins run exactly one step per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepName {
    Prepare,
    Download,
    Update,
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepName::Prepare => "prepare",
            StepName::Download => "download",
            StepName::Update => "update",
        };
        f.write_str(s)
    }
}

impl Phase {
    /// The step a phase's resource usage is attributed to by default.
    pub fn default_step(self) -> StepName {
        match self {
            Phase::Check => StepName::Prepare,
            Phase::Download => StepName::Download,
            Phase::Execute => StepName::Update,
        }
    }
}

/// `PluginExecution.status`.
///
/// A plugin skipped for being already up-to-date is tallied as `Skipped`,
/// distinct from `Success` (see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PluginStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Timeout,
    Cancelled,
}

impl PluginStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PluginStatus::Pending | PluginStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PluginStatus::Pending => "pending",
            PluginStatus::Running => "running",
            PluginStatus::Success => "success",
            PluginStatus::Failed => "failed",
            PluginStatus::Skipped => "skipped",
            PluginStatus::Timeout => "timeout",
            PluginStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of comparing installed vs. available versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NeedsUpdate {
    Yes,
    No,
    Unknown,
}
