//! Shared id, size, and status types used across the engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unique download task identifier. One request group exists per task.
pub type TaskId = u64;

/// Invalid task id (never allocated).
pub const INVALID_TASK_ID: TaskId = 0;

/// Unique command identifier, monotonic per engine.
pub type CommandId = u64;

/// File sizes and byte counters.
pub type Bytes = u64;

/// Transfer rate in bytes per second.
pub type Speed = u64;

/// Lifecycle status of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Waiting in queue.
    Pending,
    /// Fetching file info (initial handshake).
    Preparing,
    /// Actively transferring.
    Downloading,
    /// Paused by user.
    Paused,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled by user.
    Cancelled,
}

impl TaskStatus {
    /// True for Completed, Failed, and Cancelled. Terminal status is frozen:
    /// no further transition is ever observed.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Preparing => "Preparing",
            TaskStatus::Downloading => "Downloading",
            TaskStatus::Paused => "Paused",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
            TaskStatus::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata for the file behind a URL, established by the initial response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileInfo {
    /// Effective URL after redirects.
    pub url: String,
    /// Derived output filename (Content-Disposition or URL path).
    pub filename: String,
    /// `Content-Type` header value, if any.
    pub content_type: String,
    /// Total size in bytes (0 if unknown).
    pub total_size: Bytes,
    /// True if the server advertised `Accept-Ranges: bytes`.
    pub supports_resume: bool,
    /// `ETag` value if present (resume validator).
    pub etag: Option<String>,
    /// `Last-Modified` value if present (resume validator).
    pub last_modified: Option<String>,
}

/// Snapshot of one task's progress, delivered to listeners.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    pub task_id: TaskId,
    pub downloaded_bytes: Bytes,
    pub total_bytes: Bytes,
    pub speed: Speed,
    /// Fraction complete in [0.0, 1.0]; 0.0 when total is unknown.
    pub progress: f64,
    pub elapsed: Duration,
    /// Estimated time remaining (None when the rate is 0 or total unknown).
    pub eta: Option<Duration>,
}

impl ProgressInfo {
    /// Compute the fraction and ETA for the given counters.
    pub fn compute(
        task_id: TaskId,
        downloaded: Bytes,
        total: Bytes,
        speed: Speed,
        elapsed: Duration,
    ) -> Self {
        let progress = if total > 0 {
            (downloaded as f64 / total as f64).min(1.0)
        } else {
            0.0
        };
        let eta = if total > 0 && speed > 0 {
            Some(Duration::from_secs(
                total.saturating_sub(downloaded) / speed,
            ))
        } else {
            None
        };
        ProgressInfo {
            task_id,
            downloaded_bytes: downloaded,
            total_bytes: total,
            speed,
            progress,
            elapsed,
            eta,
        }
    }
}

/// Aggregate engine counters exposed via `Engine::get_statistics`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statistics {
    pub active_tasks: usize,
    pub waiting_tasks: usize,
    pub completed_tasks: usize,
    /// Tasks that reached Failed or Cancelled.
    pub stopped_tasks: usize,
    pub global_download_speed: Speed,
    pub total_downloaded: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Downloading.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
    }

    #[test]
    fn progress_compute_fraction_and_eta() {
        let p = ProgressInfo::compute(1, 500, 1000, 100, Duration::from_secs(5));
        assert!((p.progress - 0.5).abs() < 1e-9);
        assert_eq!(p.eta, Some(Duration::from_secs(5)));
    }

    #[test]
    fn progress_compute_unknown_total() {
        let p = ProgressInfo::compute(1, 500, 0, 100, Duration::from_secs(5));
        assert_eq!(p.progress, 0.0);
        assert_eq!(p.eta, None);
    }
}
