//! Shared per-download task state.
//!
//! A `DownloadTask` is the thread-safe view of one job: atomic counters for
//! readers on any thread, privileged setters used by the engine, and a
//! completion signal external callers can block on. Status transitions fire
//! the listener exactly once per distinct transition, and a terminal status
//! is frozen.

use crate::events::{Event, EventDispatcher};
use crate::types::{Bytes, FileInfo, ProgressInfo, Speed, TaskId, TaskStatus};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

fn status_to_u8(s: TaskStatus) -> u8 {
    match s {
        TaskStatus::Pending => 0,
        TaskStatus::Preparing => 1,
        TaskStatus::Downloading => 2,
        TaskStatus::Paused => 3,
        TaskStatus::Completed => 4,
        TaskStatus::Failed => 5,
        TaskStatus::Cancelled => 6,
    }
}

fn status_from_u8(v: u8) -> TaskStatus {
    match v {
        0 => TaskStatus::Pending,
        1 => TaskStatus::Preparing,
        2 => TaskStatus::Downloading,
        3 => TaskStatus::Paused,
        4 => TaskStatus::Completed,
        5 => TaskStatus::Failed,
        _ => TaskStatus::Cancelled,
    }
}

pub struct DownloadTask {
    id: TaskId,
    url: String,
    status: AtomicU8,
    total_bytes: AtomicU64,
    downloaded_bytes: AtomicU64,
    speed: AtomicU64,
    cancel_requested: AtomicBool,
    pause_requested: AtomicBool,
    started_at: Instant,
    // Multi-field state behind short locks.
    info: Mutex<FileInfo>,
    error: Mutex<String>,
    output_path: Mutex<PathBuf>,
    // Guards status transitions so the listener fires once per transition.
    transition: Mutex<()>,
    done: Condvar,
    dispatcher: Arc<EventDispatcher>,
}

impl DownloadTask {
    pub fn new(id: TaskId, url: String, dispatcher: Arc<EventDispatcher>) -> Arc<Self> {
        Arc::new(Self {
            id,
            url,
            status: AtomicU8::new(status_to_u8(TaskStatus::Pending)),
            total_bytes: AtomicU64::new(0),
            downloaded_bytes: AtomicU64::new(0),
            speed: AtomicU64::new(0),
            cancel_requested: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            started_at: Instant::now(),
            info: Mutex::new(FileInfo::default()),
            error: Mutex::new(String::new()),
            output_path: Mutex::new(PathBuf::new()),
            transition: Mutex::new(()),
            done: Condvar::new(),
            dispatcher,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> TaskStatus {
        status_from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn downloaded_bytes(&self) -> Bytes {
        self.downloaded_bytes.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> Bytes {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn speed(&self) -> Speed {
        self.speed.load(Ordering::Relaxed)
    }

    /// Fraction complete in [0.0, 1.0]; 0.0 while the total is unknown.
    pub fn progress(&self) -> f64 {
        let total = self.total_bytes();
        if total == 0 {
            return 0.0;
        }
        (self.downloaded_bytes() as f64 / total as f64).min(1.0)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn eta(&self) -> Option<Duration> {
        let speed = self.speed();
        let total = self.total_bytes();
        if speed == 0 || total == 0 {
            return None;
        }
        Some(Duration::from_secs(
            total.saturating_sub(self.downloaded_bytes()) / speed,
        ))
    }

    pub fn file_info(&self) -> FileInfo {
        self.info.lock().unwrap().clone()
    }

    pub fn error_message(&self) -> String {
        self.error.lock().unwrap().clone()
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_path.lock().unwrap().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Relaxed)
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::Relaxed)
    }

    /// Block until the task reaches a terminal status.
    pub fn wait(&self) {
        let mut guard = self.transition.lock().unwrap();
        while !self.status().is_terminal() {
            guard = self.done.wait(guard).unwrap();
        }
    }

    /// Block up to `timeout`; returns true if the task finished.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.transition.lock().unwrap();
        while !self.status().is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (g, result) = self.done.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
            if result.timed_out() && !self.status().is_terminal() {
                return false;
            }
        }
        true
    }

    // === Privileged setters (engine only) ===

    /// Transition to `new`, firing `on_status_changed` once. Duplicate sets
    /// and transitions out of a terminal status are no-ops returning false.
    pub(crate) fn set_status(&self, new: TaskStatus) -> bool {
        let _guard = self.transition.lock().unwrap();
        let old = self.status();
        if old == new || old.is_terminal() {
            return false;
        }
        self.status.store(status_to_u8(new), Ordering::Release);
        tracing::debug!(task_id = self.id, from = %old, to = %new, "task status");
        self.dispatcher.dispatch(Event::StatusChanged {
            task_id: self.id,
            old,
            new,
        });
        if new.is_terminal() {
            self.done.notify_all();
        }
        true
    }

    /// Update counters and fan out `on_progress`.
    pub(crate) fn update_progress(&self, downloaded: Bytes, total: Bytes, speed: Speed) {
        self.downloaded_bytes.store(downloaded, Ordering::Relaxed);
        if total > 0 {
            self.total_bytes.store(total, Ordering::Relaxed);
        }
        self.speed.store(speed, Ordering::Relaxed);
        self.dispatcher.dispatch(Event::Progress(ProgressInfo::compute(
            self.id,
            downloaded,
            self.total_bytes(),
            speed,
            self.elapsed(),
        )));
    }

    /// Bump the downloaded counter without a listener callback (used by the
    /// single-stream path between progress ticks).
    pub(crate) fn add_downloaded(&self, bytes: Bytes) {
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_total_bytes(&self, total: Bytes) {
        self.total_bytes.store(total, Ordering::Relaxed);
    }

    pub(crate) fn set_speed(&self, speed: Speed) {
        self.speed.store(speed, Ordering::Relaxed);
    }

    pub(crate) fn set_file_info(&self, info: FileInfo) {
        *self.info.lock().unwrap() = info.clone();
        self.dispatcher.dispatch(Event::FileInfo {
            task_id: self.id,
            info,
        });
    }

    pub(crate) fn set_output_path(&self, path: &Path) {
        *self.output_path.lock().unwrap() = path.to_path_buf();
    }

    pub(crate) fn set_error(&self, message: &str) {
        *self.error.lock().unwrap() = message.to_string();
        self.dispatcher.dispatch(Event::Error {
            task_id: self.id,
            message: message.to_string(),
        });
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Relaxed);
    }

    pub(crate) fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::Relaxed);
    }

    pub(crate) fn clear_pause_request(&self) {
        self.pause_requested.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct TransitionRecorder {
        transitions: Mutex<Vec<(TaskStatus, TaskStatus)>>,
        progress_count: AtomicUsize,
    }

    impl crate::events::EventListener for TransitionRecorder {
        fn on_status_changed(&self, _: TaskId, old: TaskStatus, new: TaskStatus) {
            self.transitions.lock().unwrap().push((old, new));
        }

        fn on_progress(&self, _: &ProgressInfo) {
            self.progress_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn task_with_recorder() -> (Arc<DownloadTask>, Arc<TransitionRecorder>) {
        let dispatcher = Arc::new(EventDispatcher::new_sync());
        let recorder = Arc::new(TransitionRecorder {
            transitions: Mutex::new(Vec::new()),
            progress_count: AtomicUsize::new(0),
        });
        dispatcher.add_listener(recorder.clone());
        let task = DownloadTask::new(1, "http://example.com/f".into(), dispatcher);
        (task, recorder)
    }

    #[test]
    fn duplicate_status_set_is_noop() {
        let (task, recorder) = task_with_recorder();
        assert!(task.set_status(TaskStatus::Preparing));
        assert!(!task.set_status(TaskStatus::Preparing));
        assert_eq!(recorder.transitions.lock().unwrap().len(), 1);
    }

    #[test]
    fn terminal_status_is_frozen() {
        let (task, recorder) = task_with_recorder();
        task.set_status(TaskStatus::Downloading);
        assert!(task.set_status(TaskStatus::Completed));
        assert!(!task.set_status(TaskStatus::Failed));
        assert!(!task.set_status(TaskStatus::Downloading));
        assert_eq!(task.status(), TaskStatus::Completed);
        let transitions = recorder.transitions.lock().unwrap();
        assert_eq!(
            transitions.last(),
            Some(&(TaskStatus::Downloading, TaskStatus::Completed))
        );
    }

    #[test]
    fn progress_updates_counters_and_listener() {
        let (task, recorder) = task_with_recorder();
        task.update_progress(100, 1000, 50);
        assert_eq!(task.downloaded_bytes(), 100);
        assert_eq!(task.total_bytes(), 1000);
        assert_eq!(task.speed(), 50);
        assert!((task.progress() - 0.1).abs() < 1e-9);
        assert_eq!(recorder.progress_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_for_times_out_then_completes() {
        let (task, _) = task_with_recorder();
        assert!(!task.wait_for(Duration::from_millis(10)));

        let t2 = Arc::clone(&task);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            t2.set_status(TaskStatus::Completed);
        });
        assert!(task.wait_for(Duration::from_secs(5)));
        handle.join().unwrap();
        task.wait(); // returns immediately once terminal
    }

    #[test]
    fn cancel_and_pause_flags() {
        let (task, _) = task_with_recorder();
        assert!(!task.cancel_requested());
        task.request_pause();
        assert!(task.pause_requested());
        task.clear_pause_request();
        assert!(!task.pause_requested());
        task.request_cancel();
        assert!(task.cancel_requested());
    }
}
