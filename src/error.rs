//! Engine-wide error kinds.
//!
//! Mirrors the error taxonomy the orchestrator uses to decide whether a
//! failure is locally recoverable (probe downgrades to `unknown`), fatal to
//! a single plugin (`UpdateFailed`, `Timeout`, `Cancelled`), or fatal to the
//! whole run (`ConfigError`).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("plugin unavailable: {0}")]
    Unavailable(String),

    #[error("invalid configuration: {0}")]
    ConfigError(String),

    #[error("transient I/O error: {0}")]
    TransientIoError(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("update failed (exit code {exit_code:?}): {stderr_tail}")]
    UpdateFailed {
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("internal engine error: {0}")]
    Internal(String),

    #[error("mutex acquisition timed out waiting for: {0:?}")]
    MutexTimeout(Vec<String>),

    #[error("dependency cycle detected among plugins: {0:?}")]
    DependencyCycle(Vec<String>),

    #[error(transparent)]
    Database(#[from] diesel::result::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Truncates stderr/stdout captures to a fixed bound (4 KiB).
pub fn tail_bytes(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let start = s.len() - max_bytes;
    // Walk forward to the next char boundary so we never split a UTF-8 sequence.
    let mut start = start;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_bytes_under_limit_is_unchanged() {
        assert_eq!(tail_bytes("hello", 10), "hello");
    }

    #[test]
    fn tail_bytes_truncates_to_suffix() {
        let long = "a".repeat(5000);
        let tail = tail_bytes(&long, 4096);
        assert_eq!(tail.len(), 4096);
    }
}
