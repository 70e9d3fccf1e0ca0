//! The Process Runner: launches and supervises a child process, merges its
//! stdout/stderr into a single ordered `StreamEvent` sequence, enforces
//! timeouts and cancellation via a graceful-then-forceful shutdown
//! sequence, and reports resource usage at exit.
//!
//! Line-by-line streaming over `tokio::process::Command`'s piped
//! stdout/stderr, with two concurrent readers so neither stream can starve
//! the other.

use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::Phase;
use crate::stream::{Channel, EventSink, StreamEvent};

/// Wall-clock grace period between a graceful termination signal and a
/// forceful kill.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Sentinel prefix for the in-band progress sub-protocol.
const PROGRESS_SENTINEL: &str = "PROGRESS:";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ProgressLine {
    Progress {
        #[serde(default)]
        percent: Option<f32>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        bytes_done: Option<u64>,
        #[serde(default)]
        bytes_total: Option<u64>,
        #[serde(default)]
        items_done: Option<u64>,
        #[serde(default)]
        items_total: Option<u64>,
    },
    PhaseStart,
    PhaseEnd {
        #[serde(default)]
        success: bool,
        #[serde(default)]
        error: Option<String>,
    },
    Error {
        message: String,
    },
}

/// Resource usage accumulated by a finished child. Network bytes are deliberately
/// absent here; the Metrics Collector samples those host-level.
#[derive(Debug, Clone, Default)]
pub struct ResourceUsage {
    pub cpu_user_seconds: f64,
    pub cpu_kernel_seconds: f64,
    pub peak_rss_bytes: u64,
    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
    pub io_read_ops: u64,
    pub io_write_ops: u64,
}

/// Outcome of a single invocation.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub stderr_tail: String,
    pub usage: ResourceUsage,
}

/// Configuration for one invocation.
pub struct RunSpec {
    pub argv: Vec<String>,
    pub sudo: bool,
    pub timeout: Option<Duration>,
    pub success_patterns: Vec<String>,
    pub error_patterns: Vec<String>,
    pub ignore_exit_codes: Vec<i32>,
    pub phase: Phase,
}

/// Runs one child process to completion, streaming events into `sink`.
///
/// Does not itself emit `Completion` — callers compose multiple invocations
/// (e.g. several `UpdateCommand`s) into one phase and emit the phase's
/// `Completion` once, via `StreamEvent::PhaseEnd`/`Completion` in
/// `phase_machine`.
pub async fn run(spec: RunSpec, cancel: CancellationToken, sink: &EventSink) -> RunOutcome {
    let mut command = if spec.sudo {
        let mut c = Command::new("sudo");
        c.arg("-n").args(&spec.argv);
        c
    } else {
        let (program, rest) = match spec.argv.split_first() {
            Some((program, rest)) => (program.clone(), rest.to_vec()),
            None => {
                return RunOutcome {
                    success: false,
                    exit_code: None,
                    error: Some("empty argv".to_string()),
                    stderr_tail: String::new(),
                    usage: ResourceUsage::default(),
                }
            }
        };
        let mut c = Command::new(program);
        c.args(rest);
        c
    };

    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let message = format!("failed to spawn: {e}");
            sink.publish(StreamEvent::Error {
                message: message.clone(),
            })
            .await;
            return RunOutcome {
                success: false,
                exit_code: None,
                error: Some(message),
                stderr_tail: String::new(),
                usage: ResourceUsage::default(),
            };
        }
    };

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let stdout_tail = std::sync::Arc::new(tokio::sync::Mutex::new(String::new()));
    let stderr_tail = std::sync::Arc::new(tokio::sync::Mutex::new(String::new()));

    let out_task = tokio::spawn(read_lines(
        stdout,
        Channel::Out,
        sink.clone(),
        spec.phase,
        Some(stdout_tail.clone()),
    ));
    let err_task = tokio::spawn(read_lines(
        stderr,
        Channel::Err,
        sink.clone(),
        spec.phase,
        Some(stderr_tail.clone()),
    ));

    let wait_result = wait_with_deadline(&mut child, spec.timeout, cancel).await;

    // Readers finish once the pipes close (child exit or kill), which
    // `wait_with_deadline` guarantees by the time it returns.
    let _ = out_task.await;
    let _ = err_task.await;

    let stdout_tail_text = stdout_tail.lock().await.clone();
    let stderr_tail_text = stderr_tail.lock().await.clone();
    let combined_tail_text = format!("{stdout_tail_text}{stderr_tail_text}");

    match wait_result {
        WaitResult::Exited(status) => {
            let exit_code = status.code();
            let exit_success = status.success();
            let pattern_success =
                !exit_success && matches_any(&combined_tail_text, &spec.success_patterns);
            let ignored_exit = exit_code.is_some_and(|c| spec.ignore_exit_codes.contains(&c));
            let pattern_error = exit_success && matches_any(&combined_tail_text, &spec.error_patterns);
            let success = (exit_success || pattern_success || ignored_exit) && !pattern_error;
            let usage = read_child_resource_usage();
            RunOutcome {
                success,
                exit_code,
                error: if success {
                    None
                } else {
                    Some(format!("exited with code {exit_code:?}"))
                },
                stderr_tail: tail(&stderr_tail_text),
                usage,
            }
        }
        WaitResult::TimedOut => {
            sink.publish(StreamEvent::Error {
                message: "timeout".to_string(),
            })
            .await;
            RunOutcome {
                success: false,
                exit_code: None,
                error: Some("timeout".to_string()),
                stderr_tail: tail(&stderr_tail_text),
                usage: read_child_resource_usage(),
            }
        }
        WaitResult::Cancelled => {
            sink.publish(StreamEvent::Error {
                message: "cancelled".to_string(),
            })
            .await;
            RunOutcome {
                success: false,
                exit_code: None,
                error: Some("cancelled".to_string()),
                stderr_tail: tail(&stderr_tail_text),
                usage: read_child_resource_usage(),
            }
        }
    }
}

fn tail(s: &str) -> String {
    crate::error::tail_bytes(s, 4096)
}

fn matches_any(haystack: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| haystack.contains(p.as_str()))
}

enum WaitResult {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

async fn wait_with_deadline(
    child: &mut Child,
    timeout: Option<Duration>,
    cancel: CancellationToken,
) -> WaitResult {
    let timeout_fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
        match timeout {
            Some(d) => Box::pin(tokio::time::sleep(d)),
            None => Box::pin(std::future::pending()),
        };
    tokio::pin!(timeout_fut);

    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => WaitResult::Exited(status),
                Err(e) => {
                    warn!("error waiting for child: {e}");
                    WaitResult::Exited(std::process::ExitStatus::default())
                }
            }
        }
        _ = &mut timeout_fut => {
            terminate_then_kill(child).await;
            let _ = child.wait().await;
            WaitResult::TimedOut
        }
        _ = cancel.cancelled() => {
            terminate_then_kill(child).await;
            let _ = child.wait().await;
            WaitResult::Cancelled
        }
    }
}

/// Graceful termination signal, then (after `GRACE_PERIOD`) a forceful
/// kill. Used for both timeout and cancellation.
async fn terminate_then_kill(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    tokio::select! {
        _ = child.wait() => return,
        _ = tokio::time::sleep(GRACE_PERIOD) => {}
    }

    let _ = child.start_kill();
    let _ = child.wait().await;
}

async fn read_lines(
    pipe: impl tokio::io::AsyncRead + Unpin,
    channel: Channel,
    sink: EventSink,
    phase: Phase,
    tail_accumulator: Option<std::sync::Arc<tokio::sync::Mutex<String>>>,
) {
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(acc) = &tail_accumulator {
                    let mut acc = acc.lock().await;
                    acc.push_str(&line);
                    acc.push('\n');
                }
                if let Some(stripped) = line.strip_prefix(PROGRESS_SENTINEL) {
                    match parse_progress(stripped, phase) {
                        Some(event) => {
                            sink.publish(event).await;
                            continue;
                        }
                        None => debug!("failed to parse PROGRESS line: {}", stripped),
                    }
                }
                sink.publish(StreamEvent::Output { line, channel }).await;
            }
            Ok(None) => break,
            Err(e) => {
                warn!("error reading child output: {e}");
                break;
            }
        }
    }
}

fn parse_progress(json: &str, phase: Phase) -> Option<StreamEvent> {
    let parsed: ProgressLine = serde_json::from_str(json).ok()?;
    Some(match parsed {
        ProgressLine::Progress {
            percent,
            message,
            bytes_done,
            bytes_total,
            items_done,
            items_total,
        } => StreamEvent::Progress {
            phase,
            percent,
            message,
            bytes_done,
            bytes_total,
            items_done,
            items_total,
        },
        ProgressLine::PhaseStart => StreamEvent::PhaseStart { phase },
        ProgressLine::PhaseEnd { success, error } => StreamEvent::PhaseEnd {
            phase,
            success,
            error,
        },
        ProgressLine::Error { message } => StreamEvent::Error { message },
    })
}

/// Pattern used to recognize the PROGRESS: sentinel even mid-line (e.g. when
/// a plugin's other output is buffered together); kept narrow on purpose —
/// only a line *beginning* with the sentinel is treated as structured.
pub fn sentinel_pattern() -> Regex {
    Regex::new(&format!("^{}", regex::escape(PROGRESS_SENTINEL))).expect("valid regex")
}

#[cfg(unix)]
fn read_child_resource_usage() -> ResourceUsage {
    // getrusage(RUSAGE_CHILDREN, ...) reports *cumulative* usage across all
    // reaped children of this process, not just the one we just waited on.
    // Callers attribute the delta to the current step.
    unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_CHILDREN, &mut usage) != 0 {
            return ResourceUsage::default();
        }
        ResourceUsage {
            cpu_user_seconds: usage.ru_utime.tv_sec as f64 + usage.ru_utime.tv_usec as f64 / 1e6,
            cpu_kernel_seconds: usage.ru_stime.tv_sec as f64 + usage.ru_stime.tv_usec as f64 / 1e6,
            peak_rss_bytes: (usage.ru_maxrss as u64) * 1024,
            io_read_bytes: 0,
            io_write_bytes: 0,
            io_read_ops: usage.ru_inblock as u64,
            io_write_ops: usage.ru_oublock as u64,
        }
    }
}

#[cfg(not(unix))]
fn read_child_resource_usage() -> ResourceUsage {
    ResourceUsage::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::EventSink;

    #[tokio::test]
    async fn echo_hello_produces_output_and_success() {
        let sink = EventSink::new(64);
        let mut rx = sink.subscribe().await;
        let spec = RunSpec {
            argv: vec!["echo".into(), "hello".into()],
            sudo: false,
            timeout: None,
            success_patterns: vec![],
            error_patterns: vec![],
            ignore_exit_codes: vec![],
            phase: Phase::Execute,
        };
        let outcome = run(spec, CancellationToken::new(), &sink).await;
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));

        let mut saw_hello = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
        {
            if let StreamEvent::Output { line, .. } = event {
                if line == "hello" {
                    saw_hello = true;
                }
            }
        }
        assert!(saw_hello);
    }

    #[tokio::test]
    async fn nonzero_exit_matching_success_pattern_is_success() {
        let sink = EventSink::new(64);
        let spec = RunSpec {
            argv: vec![
                "sh".into(),
                "-c".into(),
                "echo 'No packages to upgrade' 1>&2; exit 1".into(),
            ],
            sudo: false,
            timeout: None,
            success_patterns: vec!["No packages to upgrade".into()],
            error_patterns: vec![],
            ignore_exit_codes: vec![],
            phase: Phase::Execute,
        };
        let outcome = run(spec, CancellationToken::new(), &sink).await;
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(1));
    }

    #[tokio::test]
    async fn nonzero_exit_matching_success_pattern_on_stdout_is_success() {
        let sink = EventSink::new(64);
        let spec = RunSpec {
            argv: vec![
                "sh".into(),
                "-c".into(),
                "echo 'No packages to upgrade'; exit 1".into(),
            ],
            sudo: false,
            timeout: None,
            success_patterns: vec!["No packages to upgrade".into()],
            error_patterns: vec![],
            ignore_exit_codes: vec![],
            phase: Phase::Execute,
        };
        let outcome = run(spec, CancellationToken::new(), &sink).await;
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(1));
    }

    #[tokio::test]
    async fn timeout_kills_child_and_reports_timeout_error() {
        let sink = EventSink::new(64);
        let spec = RunSpec {
            argv: vec!["sleep".into(), "60".into()],
            sudo: false,
            timeout: Some(Duration::from_millis(100)),
            success_patterns: vec![],
            error_patterns: vec![],
            ignore_exit_codes: vec![],
            phase: Phase::Execute,
        };
        let start = std::time::Instant::now();
        let outcome = run(spec, CancellationToken::new(), &sink).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("timeout"));
        // Should not wait anywhere near the grace period for a process
        // that dies immediately on SIGTERM.
        assert!(start.elapsed() < Duration::from_secs(6));
    }
}
