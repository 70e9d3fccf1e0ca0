//! A declarative in-process plugin base: phases are expressed as a list of
//! `UpdateCommand`s the core runs through the Process Runner. Version
//! probes run a configured argv and take its trimmed first stdout line.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::process::Command as TokioCommand;
use tokio_util::sync::CancellationToken;

use crate::domain::{NeedsUpdate, Phase, StepName};
use crate::metrics::UsageSink;
use crate::plugin::{Identity, PhaseRequirements, Plugin, PluginEstimate, UpdateCommand};
use crate::process_runner::{self, RunSpec};
use crate::stream::{EventSink, StreamEvent};

/// A plugin built from a declared list of commands, one per phase.
pub struct CommandPlugin {
    identity: Identity,
    installed_version_argv: Option<Vec<String>>,
    available_version_argv: Option<Vec<String>>,
    commands: Vec<UpdateCommand>,
    requirements: HashMap<Phase, PhaseRequirements>,
    sudo_paths: Vec<String>,
    depends_on: Vec<String>,
}

/// Builder-style construction mirroring the fields a config file supplies
/// per plugin entry.
#[derive(Default)]
pub struct CommandPluginSpec {
    pub identity: Option<Identity>,
    pub installed_version_argv: Option<Vec<String>>,
    pub available_version_argv: Option<Vec<String>>,
    pub commands: Vec<UpdateCommand>,
    pub requirements: HashMap<Phase, PhaseRequirements>,
    pub sudo_paths: Vec<String>,
    pub depends_on: Vec<String>,
}

impl CommandPlugin {
    pub fn new(spec: CommandPluginSpec) -> Self {
        Self {
            identity: spec.identity.unwrap_or(Identity {
                name: "unnamed".to_string(),
                description: String::new(),
                primary_command: String::new(),
            }),
            installed_version_argv: spec.installed_version_argv,
            available_version_argv: spec.available_version_argv,
            commands: spec.commands,
            requirements: spec.requirements,
            sudo_paths: spec.sudo_paths,
            depends_on: spec.depends_on,
        }
    }

    fn commands_for(&self, phase: Phase) -> Vec<&UpdateCommand> {
        self.commands.iter().filter(|c| c.phase == phase).collect()
    }

    async fn probe_version(argv: &[String]) -> Option<String> {
        let (program, rest) = argv.split_first()?;
        let output = TokioCommand::new(program).args(rest).output().await.ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let first_line = text.lines().next()?.trim();
        if first_line.is_empty() {
            None
        } else {
            Some(first_line.to_string())
        }
    }
}

#[async_trait]
impl Plugin for CommandPlugin {
    fn identity(&self) -> Identity {
        self.identity.clone()
    }

    async fn is_applicable(&self) -> bool {
        match &self.installed_version_argv {
            Some(argv) => {
                let Some((program, _)) = argv.split_first() else {
                    return false;
                };
                which::which(program).is_ok()
            }
            None => true,
        }
    }

    async fn installed_version(&self) -> Option<String> {
        match &self.installed_version_argv {
            Some(argv) => Self::probe_version(argv).await,
            None => None,
        }
    }

    async fn available_version(&self) -> Option<String> {
        match &self.available_version_argv {
            Some(argv) => Self::probe_version(argv).await,
            None => None,
        }
    }

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

    async fn estimate(&self) -> Option<PluginEstimate> {
        None
    }

    fn supports_split_download(&self) -> bool {
        self.commands.iter().any(|c| c.phase == Phase::Download)
    }

    fn required_mutexes(&self, phase: Phase) -> BTreeSet<String> {
        self.requirements.get(&phase).map(|r| r.mutexes.clone()).unwrap_or_default()
    }

    fn required_dependencies(&self, phase: Phase) -> BTreeSet<String> {
        self.requirements.get(&phase).map(|r| r.dependencies.clone()).unwrap_or_default()
    }

    fn sudo_commands(&self) -> Vec<String> {
        self.sudo_paths.clone()
    }

    fn dependencies(&self) -> Vec<String> {
        self.depends_on.clone()
    }

    async fn execute(
        &self,
        phase: Phase,
        dry_run: bool,
        cancel: CancellationToken,
        sink: EventSink,
        usage: UsageSink,
    ) {
        let commands = self.commands_for(phase);

        if commands.is_empty() || (dry_run && phase == Phase::Execute) {
            sink.publish(StreamEvent::Completion {
                success: true,
                exit_code: Some(0),
                packages_updated: 0,
                error: None,
            })
            .await;
            return;
        }

        sink.publish(StreamEvent::PhaseStart { phase }).await;

        let mut overall_success = true;
        let mut last_exit_code = None;
        let mut first_error = None;
        let mut packages_updated = 0u32;

        for command in commands {
            if cancel.is_cancelled() {
                overall_success = false;
                first_error.get_or_insert_with(|| "cancelled".to_string());
                break;
            }
            let spec = RunSpec {
                argv: command.argv.clone(),
                sudo: command.sudo,
                timeout: command.timeout,
                success_patterns: command.success_patterns.clone(),
                error_patterns: command.error_patterns.clone(),
                ignore_exit_codes: command.ignore_exit_codes.clone(),
                phase,
            };
            let outcome = process_runner::run(spec, cancel.clone(), &sink).await;
            last_exit_code = outcome.exit_code;
            usage.record(phase.default_step(), phase, outcome.usage).await;
            if outcome.success {
                if phase == Phase::Execute {
                    packages_updated += 1;
                }
            } else {
                overall_success = false;
                first_error.get_or_insert(outcome.error.unwrap_or_else(|| outcome.stderr_tail.clone()));
                break;
            }
        }

        sink.publish(StreamEvent::PhaseEnd {
            phase,
            success: overall_success,
            error: first_error.clone(),
        })
        .await;

        sink.publish(StreamEvent::Completion {
            success: overall_success,
            exit_code: last_exit_code,
            packages_updated,
            error: first_error,
        })
        .await;
    }
}

/// Exposed for plugins that want the same `<command> --version` default
/// the spec describes for `needs_update` without depending on `CommandPlugin`.
pub fn default_step_for(phase: Phase) -> StepName {
    phase.default_step()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::EventSink;

    fn echo_plugin() -> CommandPlugin {
        let mut requirements = HashMap::new();
        requirements.insert(
            Phase::Execute,
            PhaseRequirements {
                mutexes: BTreeSet::new(),
                dependencies: BTreeSet::new(),
            },
        );
        CommandPlugin::new(CommandPluginSpec {
            identity: Some(Identity {
                name: "echo-plugin".into(),
                description: "test plugin".into(),
                primary_command: "echo".into(),
            }),
            commands: vec![UpdateCommand {
                argv: vec!["echo".into(), "updated".into()],
                description: "run echo".into(),
                sudo: false,
                timeout: None,
                phase: Phase::Execute,
                ignore_exit_codes: vec![],
                success_patterns: vec![],
                error_patterns: vec![],
            }],
            requirements,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn execute_emits_phase_bracket_and_completion() {
        let plugin = echo_plugin();
        let sink = EventSink::new(64);
        let mut rx = sink.subscribe().await;
        let usage = UsageSink::new();
        plugin
            .execute(Phase::Execute, false, CancellationToken::new(), sink, usage)
            .await;

        let mut saw_start = false;
        let mut saw_completion = false;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::PhaseStart { .. } => saw_start = true,
                StreamEvent::Completion { success, packages_updated, .. } => {
                    saw_completion = true;
                    assert!(success);
                    assert_eq!(packages_updated, 1);
                }
                _ => {}
            }
        }
        assert!(saw_start && saw_completion);
    }

    #[tokio::test]
    async fn dry_run_execute_phase_emits_synthetic_completion_only() {
        let plugin = echo_plugin();
        let sink = EventSink::new(64);
        let mut rx = sink.subscribe().await;
        let usage = UsageSink::new();
        plugin
            .execute(Phase::Execute, true, CancellationToken::new(), sink, usage)
            .await;

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            StreamEvent::Completion { packages_updated: 0, success: true, .. }
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn empty_phase_emits_synthetic_completion() {
        let plugin = echo_plugin();
        let sink = EventSink::new(64);
        let mut rx = sink.subscribe().await;
        let usage = UsageSink::new();
        plugin
            .execute(Phase::Check, false, CancellationToken::new(), sink, usage)
            .await;
        let event = rx.recv().await.unwrap();
        assert!(event.is_completion());
    }
}
