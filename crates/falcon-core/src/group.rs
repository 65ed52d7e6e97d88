//! Request groups: per-job lifecycle, URI failover, and the waiting/active
//! queues that enforce the concurrency cap.

use crate::error::{EngineError, Result};
use crate::http;
use crate::options::DownloadOptions;
use crate::segment::SegmentDownloader;
use crate::task::DownloadTask;
use crate::types::{Bytes, FileInfo, Speed, TaskId};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

/// Lifecycle of a request group (one logical download job).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Waiting,
    Active,
    Paused,
    Completed,
    Error,
    Removed,
}

impl GroupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupStatus::Waiting => "WAITING",
            GroupStatus::Active => "ACTIVE",
            GroupStatus::Paused => "PAUSED",
            GroupStatus::Completed => "COMPLETED",
            GroupStatus::Error => "ERROR",
            GroupStatus::Removed => "REMOVED",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            GroupStatus::Completed | GroupStatus::Error | GroupStatus::Removed
        )
    }
}

/// Aggregated progress for one group.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupProgress {
    pub downloaded: Bytes,
    pub total: Bytes,
    pub progress: f64,
    pub speed: Speed,
    pub active_connections: usize,
}

/// One download job: ordered mirror URIs, effective options, the shared task
/// handle, and (while segmented) the downloader driving the transfer.
pub struct RequestGroup {
    id: TaskId,
    uris: Vec<String>,
    current_uri_index: usize,
    options: DownloadOptions,
    status: GroupStatus,
    task: Arc<DownloadTask>,
    file_info: Option<FileInfo>,
    segment_downloader: Option<SegmentDownloader>,
    error_message: String,
    /// Retries spent on the current URI.
    retry_count: u32,
    redirect_count: u32,
    output_path: Option<PathBuf>,
}

impl RequestGroup {
    /// Validate the URI list and create the group in Waiting state. Every
    /// URI must parse with a supported scheme.
    pub fn new(
        id: TaskId,
        uris: Vec<String>,
        options: DownloadOptions,
        task: Arc<DownloadTask>,
    ) -> Result<Self> {
        if uris.is_empty() {
            return Err(EngineError::InvalidInput("no URIs given".into()));
        }
        for uri in &uris {
            http::parse_url(uri)?;
        }
        Ok(Self {
            id,
            uris,
            current_uri_index: 0,
            options,
            status: GroupStatus::Waiting,
            task,
            file_info: None,
            segment_downloader: None,
            error_message: String::new(),
            retry_count: 0,
            redirect_count: 0,
            output_path: None,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn status(&self) -> GroupStatus {
        self.status
    }

    pub fn set_status(&mut self, status: GroupStatus) {
        if self.status != status {
            tracing::debug!(group = self.id, from = self.status.as_str(), to = status.as_str(), "group status");
            self.status = status;
        }
    }

    pub fn task(&self) -> &Arc<DownloadTask> {
        &self.task
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    pub fn current_uri(&self) -> &str {
        &self.uris[self.current_uri_index]
    }

    /// Advance to the next mirror URI, resetting the per-URI retry budget.
    /// Returns false when the list is exhausted.
    pub fn try_next_uri(&mut self) -> bool {
        if self.current_uri_index + 1 < self.uris.len() {
            self.current_uri_index += 1;
            self.retry_count = 0;
            tracing::info!(group = self.id, uri = self.current_uri(), "failing over to next URI");
            true
        } else {
            false
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn bump_retry_count(&mut self) -> u32 {
        self.retry_count += 1;
        self.retry_count
    }

    pub fn redirect_count(&self) -> u32 {
        self.redirect_count
    }

    pub fn bump_redirect_count(&mut self) -> u32 {
        self.redirect_count += 1;
        self.redirect_count
    }

    pub fn reset_redirects(&mut self) {
        self.redirect_count = 0;
    }

    pub fn file_info(&self) -> Option<&FileInfo> {
        self.file_info.as_ref()
    }

    pub fn set_file_info(&mut self, info: FileInfo) {
        self.file_info = Some(info);
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn set_error_message(&mut self, message: impl Into<String>) {
        self.error_message = message.into();
    }

    pub fn segment_downloader(&self) -> Option<&SegmentDownloader> {
        self.segment_downloader.as_ref()
    }

    pub fn set_segment_downloader(&mut self, downloader: SegmentDownloader) {
        self.segment_downloader = Some(downloader);
    }

    pub fn take_segment_downloader(&mut self) -> Option<SegmentDownloader> {
        self.segment_downloader.take()
    }

    /// Resolve (and remember) the output path for this group, deriving the
    /// filename from options, Content-Disposition, or the URL.
    pub fn resolve_output_path(&mut self, content_disposition: Option<&str>) -> Result<PathBuf> {
        if let Some(path) = &self.output_path {
            return Ok(path.clone());
        }
        let dir = PathBuf::from(&self.options.output_directory);
        if !dir.exists() {
            if self.options.create_directory {
                std::fs::create_dir_all(&dir).map_err(|e| {
                    EngineError::InvalidInput(format!(
                        "cannot create output directory {}: {e}",
                        dir.display()
                    ))
                })?;
            } else {
                return Err(EngineError::InvalidInput(format!(
                    "output directory {} does not exist",
                    dir.display()
                )));
            }
        }
        let filename = if self.options.output_filename.is_empty() {
            http::derive_filename(self.current_uri(), content_disposition)
        } else {
            self.options.output_filename.clone()
        };
        let path = dir.join(filename);
        if path.exists() && !self.options.overwrite_existing {
            return Err(EngineError::InvalidInput(format!(
                "output file {} already exists",
                path.display()
            )));
        }
        self.task.set_output_path(&path);
        self.output_path = Some(path.clone());
        Ok(path)
    }

    pub fn output_path(&self) -> Option<&PathBuf> {
        self.output_path.as_ref()
    }

    /// Aggregate counters across the task and any active segment downloader.
    pub fn get_progress(&self) -> GroupProgress {
        let (downloaded, active_connections) = match &self.segment_downloader {
            Some(dl) => (dl.downloaded_bytes(), dl.active_connections()),
            None => {
                let n = if self.status == GroupStatus::Active { 1 } else { 0 };
                (self.task.downloaded_bytes(), n)
            }
        };
        let total = self.task.total_bytes();
        GroupProgress {
            downloaded,
            total,
            progress: if total > 0 {
                (downloaded as f64 / total as f64).min(1.0)
            } else {
                0.0
            },
            speed: self.task.speed(),
            active_connections,
        }
    }
}

/// Owns every group and enforces `max_concurrent`: a FIFO waiting queue, the
/// active set, and an id index.
pub struct RequestGroupMan {
    max_concurrent: usize,
    waiting: VecDeque<TaskId>,
    active: Vec<TaskId>,
    groups: HashMap<TaskId, RequestGroup>,
}

impl RequestGroupMan {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            waiting: VecDeque::new(),
            active: Vec::new(),
            groups: HashMap::new(),
        }
    }

    pub fn add(&mut self, group: RequestGroup) {
        let id = group.id();
        self.waiting.push_back(id);
        self.groups.insert(id, group);
    }

    pub fn find(&self, id: TaskId) -> Option<&RequestGroup> {
        self.groups.get(&id)
    }

    pub fn find_mut(&mut self, id: TaskId) -> Option<&mut RequestGroup> {
        self.groups.get_mut(&id)
    }

    pub fn active_ids(&self) -> &[TaskId] {
        &self.active
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Move waiting groups into the active set while slots are free. Returns
    /// the ids promoted this call; the scheduler creates their initial
    /// commands.
    pub fn fill_from_reservation(&mut self) -> Vec<TaskId> {
        let mut promoted = Vec::new();
        while self.active.len() < self.max_concurrent {
            let id = match self.waiting.pop_front() {
                Some(id) => id,
                None => break,
            };
            let group = match self.groups.get_mut(&id) {
                Some(g) => g,
                None => continue,
            };
            if group.status() != GroupStatus::Waiting {
                continue;
            }
            group.set_status(GroupStatus::Active);
            self.active.push(id);
            promoted.push(id);
        }
        promoted
    }

    /// Take a group out of the active set (completion, failure, pause).
    pub fn deactivate(&mut self, id: TaskId) {
        self.active.retain(|&a| a != id);
    }

    /// Put a paused group back into the waiting queue for resumption.
    pub fn requeue(&mut self, id: TaskId) {
        if self.groups.contains_key(&id) && !self.waiting.contains(&id) {
            self.waiting.push_back(id);
        }
    }

    /// Cancel, evict from both queues, and drop the group's state.
    pub fn remove_group(&mut self, id: TaskId) -> Option<RequestGroup> {
        self.waiting.retain(|&w| w != id);
        self.active.retain(|&a| a != id);
        let mut group = self.groups.remove(&id)?;
        group.set_status(GroupStatus::Removed);
        Some(group)
    }

    /// True when nothing is waiting or active.
    pub fn all_finished(&self) -> bool {
        self.waiting.is_empty() && self.active.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequestGroup> {
        self.groups.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventDispatcher;

    fn group(id: TaskId) -> RequestGroup {
        let dispatcher = Arc::new(EventDispatcher::new_sync());
        let task = DownloadTask::new(id, "http://example.com/f".into(), dispatcher);
        RequestGroup::new(
            id,
            vec![
                "http://example.com/f".into(),
                "http://mirror.example.com/f".into(),
            ],
            DownloadOptions::default(),
            task,
        )
        .unwrap()
    }

    #[test]
    fn rejects_invalid_uris() {
        let dispatcher = Arc::new(EventDispatcher::new_sync());
        let task = DownloadTask::new(1, "x".into(), dispatcher);
        let err = RequestGroup::new(
            1,
            vec!["ftp://example.com/f".into()],
            DownloadOptions::default(),
            task.clone(),
        );
        assert!(err.is_err());
        let empty = RequestGroup::new(2, vec![], DownloadOptions::default(), task);
        assert!(empty.is_err());
    }

    #[test]
    fn uri_failover_resets_retry_budget() {
        let mut g = group(1);
        assert_eq!(g.current_uri(), "http://example.com/f");
        g.bump_retry_count();
        g.bump_retry_count();
        assert_eq!(g.retry_count(), 2);
        assert!(g.try_next_uri());
        assert_eq!(g.current_uri(), "http://mirror.example.com/f");
        assert_eq!(g.retry_count(), 0);
        assert!(!g.try_next_uri());
    }

    #[test]
    fn fill_from_reservation_respects_cap() {
        let mut man = RequestGroupMan::new(2);
        for id in 1..=4 {
            man.add(group(id));
        }
        let promoted = man.fill_from_reservation();
        assert_eq!(promoted, vec![1, 2]);
        assert_eq!(man.active_count(), 2);
        assert_eq!(man.waiting_count(), 2);

        // No free slot: nothing promoted.
        assert!(man.fill_from_reservation().is_empty());

        man.deactivate(1);
        let promoted = man.fill_from_reservation();
        assert_eq!(promoted, vec![3]);
    }

    #[test]
    fn remove_group_evicts_everywhere() {
        let mut man = RequestGroupMan::new(1);
        man.add(group(1));
        man.add(group(2));
        man.fill_from_reservation();
        assert!(man.remove_group(1).is_some());
        assert_eq!(man.active_count(), 0);
        assert!(man.remove_group(1).is_none());
        assert!(man.remove_group(2).is_some());
        assert!(man.all_finished());
    }

    #[test]
    fn resolve_output_path_uses_explicit_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut g = group(1);
        g.options.output_directory = dir.path().to_string_lossy().into_owned();
        g.options.output_filename = "named.bin".into();
        let path = g.resolve_output_path(None).unwrap();
        assert_eq!(path, dir.path().join("named.bin"));
        // Cached on second call.
        assert_eq!(g.resolve_output_path(Some("ignored")).unwrap(), path);
    }

    #[test]
    fn resolve_output_path_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("f");
        std::fs::write(&existing, b"x").unwrap();
        let mut g = group(1);
        g.options.output_directory = dir.path().to_string_lossy().into_owned();
        g.options.overwrite_existing = false;
        let err = g.resolve_output_path(None).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
