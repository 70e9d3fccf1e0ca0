//! Command-line surface: `run` (full orchestration), `check` (CHECK-phase
//! probe only) and `history` (read views over the history store).

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::AppConfig;
use crate::history::{queries, HistoryStore};
use crate::orchestrator::Orchestrator;
use crate::plugin::Plugin;
use crate::plugins::external::ExternalPlugin;

#[derive(Parser)]
#[command(name = "update-all")]
#[command(about = "Unified update orchestrator")]
#[command(version)]
pub struct Cli {
    /// Path to the TOML config file (default: $XDG_CONFIG_HOME/update-all/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory the history store and discovered plugins live under
    /// (default: $XDG_DATA_HOME/update-all)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Directory scanned for external-executable plugins
    #[arg(long, global = true)]
    plugin_dir: Option<PathBuf>,

    /// Skip EXECUTE phases; still probes and reports what would run
    #[arg(long, global = true)]
    dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Checked before the tracing subscriber is built, since that itself needs
/// to know the verbosity.
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Run every enabled, applicable plugin through CHECK/DOWNLOAD/EXECUTE
    Run,

    /// Run only the CHECK phase and report each plugin's version status
    Check,

    /// Inspect the history store
    History {
        #[command(subcommand)]
        command: HistoryCommands,
    },
}

#[derive(Subcommand)]
enum HistoryCommands {
    /// Show a run and its per-plugin executions
    Show {
        /// Run id (UUID)
        run_id: String,
    },
    /// Show rolled-up outcome counts and timing for one plugin
    Summary {
        /// Plugin name
        plugin: String,
    },
    /// Show mean absolute percent error between estimated and observed
    /// wall time, grouped by phase, for one plugin
    Accuracy {
        /// Plugin name
        plugin: String,
    },
}

/// Runs the CLI, returning the process exit code (see `RunResult::exit_code`
/// for `run`; `check` and `history` return 0 on success, 3 on setup failure).
pub async fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(AppConfig::default_path);
    let mut config = match config_path {
        Some(path) => match AppConfig::load(&path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("invalid configuration: {err}");
                return Ok(3);
            }
        },
        None => AppConfig::default(),
    };
    if cli.dry_run {
        config.dry_run = true;
    }

    let data_dir = match cli
        .data_dir
        .clone()
        .or_else(|| dirs::data_dir().map(|d| d.join("update-all")))
    {
        Some(dir) => dir,
        None => {
            eprintln!("could not determine a data directory; pass --data-dir");
            return Ok(3);
        }
    };
    std::fs::create_dir_all(&data_dir)?;

    let database_path = data_dir.join("history.sqlite3");
    let history = HistoryStore::open(&database_path.to_string_lossy()).await?;

    let plugin_dir = cli.plugin_dir.clone().unwrap_or_else(|| data_dir.join("plugins"));
    let plugins = discover_plugins(&plugin_dir).await;

    match cli.command {
        Commands::Run => cmd_run(config, history, plugins).await,
        Commands::Check => cmd_check(plugins).await,
        Commands::History { command } => cmd_history(&history, command).await,
    }
}

/// Scans `dir` for executables and wraps each as an `ExternalPlugin`. A
/// missing directory is not an error: it means no external plugins are
/// configured.
async fn discover_plugins(dir: &Path) -> Vec<std::sync::Arc<dyn Plugin>> {
    let mut plugins: Vec<std::sync::Arc<dyn Plugin>> = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return plugins;
    };
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, dir = %dir.display(), "failed to read plugin directory entry");
                break;
            }
        };
        if !is_executable(&entry.path()).await {
            continue;
        }
        let plugin = ExternalPlugin::discover(entry.path()).await;
        plugins.push(std::sync::Arc::new(plugin));
    }
    plugins
}

#[cfg(unix)]
async fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
async fn is_executable(path: &Path) -> bool {
    tokio::fs::metadata(path).await.map(|meta| meta.is_file()).unwrap_or(false)
}

fn host_and_user() -> (String, String) {
    let host = sysinfo::System::host_name().unwrap_or_else(|| "unknown-host".to_string());
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown-user".to_string());
    (host, user)
}

async fn cmd_run(
    config: AppConfig,
    history: HistoryStore,
    plugins: Vec<std::sync::Arc<dyn Plugin>>,
) -> anyhow::Result<i32> {
    if plugins.is_empty() {
        println!("No plugins discovered; nothing to do.");
        return Ok(0);
    }

    let (host, user) = host_and_user();
    let orchestrator = Orchestrator::new(config, history, plugins);
    let cancel = CancellationToken::new();

    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received interrupt, cancelling in-flight plugins");
            cancel_for_signal.cancel();
        }
    });

    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message("running plugins...");
    pb.enable_steady_tick(std::time::Duration::from_millis(120));

    let result = orchestrator.run(&host, &user, cancel).await?;
    pb.finish_and_clear();

    println!("run {}", result.run_id);
    for outcome in &result.outcomes {
        let mut line = format!("  {:<20} {}", outcome.plugin_name, outcome.status);
        if outcome.packages_updated > 0 {
            line.push_str(&format!(" ({} packages)", outcome.packages_updated));
        }
        if let Some(error) = &outcome.error {
            line.push_str(&format!(" - {error}"));
        }
        println!("{line}");
    }

    Ok(result.exit_code())
}

async fn cmd_check(plugins: Vec<std::sync::Arc<dyn Plugin>>) -> anyhow::Result<i32> {
    if plugins.is_empty() {
        println!("No plugins discovered; nothing to check.");
        return Ok(0);
    }

    for plugin in &plugins {
        let identity = plugin.identity();
        if !plugin.is_applicable().await {
            println!("{:<20} not applicable", identity.name);
            continue;
        }
        let installed = plugin.installed_version().await.unwrap_or_else(|| "unknown".to_string());
        let available = plugin.available_version().await.unwrap_or_else(|| "unknown".to_string());
        let needs_update = plugin.needs_update().await;
        println!(
            "{:<20} installed={:<15} available={:<15} {:?}",
            identity.name, installed, available, needs_update
        );
    }

    Ok(0)
}

async fn cmd_history(history: &HistoryStore, command: HistoryCommands) -> anyhow::Result<i32> {
    match command {
        HistoryCommands::Show { run_id } => {
            let Some(run) = history.get_run(&run_id).await? else {
                println!("no such run: {run_id}");
                return Ok(3);
            };
            println!(
                "run {} host={} user={} started={}",
                run.id, run.host, run.user, run.start_time
            );
            println!(
                "  total={} succeeded={} failed={} skipped={}",
                run.total, run.succeeded, run.failed, run.skipped
            );
            for execution in history.list_executions_for_run(&run_id).await? {
                println!(
                    "  {:<20} {:<10} packages={}",
                    execution.plugin_name, execution.status, execution.packages_updated
                );
            }
            Ok(0)
        }
        HistoryCommands::Summary { plugin } => {
            let summary = queries::plugin_performance_summary(history.pool(), &plugin).await?;
            println!(
                "{}: {} runs ({} succeeded, {} failed, {} skipped), avg wall clock {:.1}s",
                summary.plugin_name,
                summary.total_runs,
                summary.succeeded,
                summary.failed,
                summary.skipped,
                summary.avg_wall_clock_seconds,
            );
            if let Some(last_run) = &summary.last_run_at {
                println!("  last run: {last_run}");
            }
            Ok(0)
        }
        HistoryCommands::Accuracy { plugin } => {
            let phases = queries::estimate_accuracy_by_phase(history.pool(), &plugin).await?;
            if phases.is_empty() {
                println!("{plugin}: no estimates recorded yet");
                return Ok(0);
            }
            for phase in &phases {
                println!(
                    "{:<20} {:<10} mape={:.1}% ({} samples)",
                    plugin, phase.phase, phase.mean_absolute_percent_error, phase.sample_count
                );
            }
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn discover_plugins_on_missing_directory_yields_empty() {
        let plugins = discover_plugins(Path::new("/nonexistent/update-all/plugins")).await;
        assert!(plugins.is_empty());
    }
}
