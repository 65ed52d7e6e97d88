//! The download engine: public control surface and the state owned by the
//! scheduler loop.
//!
//! One thread calls `run()` and drives everything cooperatively; any thread
//! may control the engine through its methods (or a cloned `EngineHandle`),
//! which update the shared task table and enqueue control operations the
//! loop applies at the start of its next tick.

mod run;

use crate::command::Command;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EventDispatcher, EventListener};
use crate::group::RequestGroupMan;
use crate::hash;
use crate::http;
use crate::net::SocketPool;
use crate::options::DownloadOptions;
use crate::poll::{create_event_poll, EventPoll};
use crate::speed::SpeedLimiter;
use crate::task::DownloadTask;
use crate::types::{CommandId, Statistics, TaskId, TaskStatus};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Control requests queued for the scheduler loop.
pub(crate) enum ControlOp {
    Add {
        task_id: TaskId,
        uris: Vec<String>,
        options: Box<DownloadOptions>,
    },
    Pause(TaskId),
    Resume(TaskId),
    Cancel(TaskId),
}

#[derive(Default)]
pub(crate) struct Counters {
    pub active: AtomicUsize,
    pub waiting: AtomicUsize,
    pub completed: AtomicUsize,
    pub stopped: AtomicUsize,
    pub global_speed: AtomicU64,
    pub total_downloaded: AtomicU64,
}

/// State shared between the loop and control callers.
pub(crate) struct EngineShared {
    pub next_task_id: AtomicU64,
    pub tasks: Mutex<HashMap<TaskId, Arc<DownloadTask>>>,
    pub ops: Mutex<Vec<ControlOp>>,
    /// 0 = running, 1 = graceful stop requested, 2 = immediate stop.
    pub halt: AtomicU8,
    pub dispatcher: Arc<EventDispatcher>,
    pub counters: Counters,
}

impl EngineShared {
    fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            next_task_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
            ops: Mutex::new(Vec::new()),
            halt: AtomicU8::new(0),
            dispatcher,
            counters: Counters::default(),
        }
    }

    fn push_op(&self, op: ControlOp) {
        self.ops.lock().unwrap().push(op);
    }

    fn add_download(&self, uris: Vec<String>, options: DownloadOptions) -> Result<TaskId> {
        if uris.is_empty() {
            return Err(EngineError::InvalidInput("no URIs given".into()));
        }
        for uri in &uris {
            http::parse_url(uri)?;
        }
        if let Some(checksum) = &options.checksum {
            if hash::detect_algorithm(checksum).is_none() {
                return Err(EngineError::InvalidInput(format!(
                    "cannot infer hash algorithm from checksum {checksum:?}"
                )));
            }
        }
        // Surface directory problems now instead of mid-download.
        let dir = std::path::Path::new(&options.output_directory);
        if !dir.exists() {
            if options.create_directory {
                std::fs::create_dir_all(dir).map_err(|e| {
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

        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let task = DownloadTask::new(task_id, uris[0].clone(), Arc::clone(&self.dispatcher));
        self.tasks.lock().unwrap().insert(task_id, task);
        self.push_op(ControlOp::Add {
            task_id,
            uris,
            options: Box::new(options),
        });
        tracing::info!(task_id, "download added");
        Ok(task_id)
    }

    fn task(&self, id: TaskId) -> Option<Arc<DownloadTask>> {
        self.tasks.lock().unwrap().get(&id).cloned()
    }

    fn pause_task(&self, id: TaskId) -> bool {
        let task = match self.task(id) {
            Some(t) => t,
            None => return false,
        };
        if !matches!(
            task.status(),
            TaskStatus::Pending | TaskStatus::Preparing | TaskStatus::Downloading
        ) {
            return false;
        }
        task.request_pause();
        task.set_status(TaskStatus::Paused);
        self.push_op(ControlOp::Pause(id));
        true
    }

    fn resume_task(&self, id: TaskId) -> bool {
        let task = match self.task(id) {
            Some(t) => t,
            None => return false,
        };
        if task.status() != TaskStatus::Paused {
            return false;
        }
        task.clear_pause_request();
        task.set_status(TaskStatus::Pending);
        self.push_op(ControlOp::Resume(id));
        true
    }

    fn cancel_task(&self, id: TaskId) -> bool {
        let task = match self.task(id) {
            Some(t) => t,
            None => return false,
        };
        if task.status().is_terminal() {
            return false;
        }
        task.request_cancel();
        task.set_status(TaskStatus::Cancelled);
        self.push_op(ControlOp::Cancel(id));
        true
    }

    fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.lock().unwrap().keys().copied().collect()
    }

    fn statistics(&self) -> Statistics {
        Statistics {
            active_tasks: self.counters.active.load(Ordering::Relaxed),
            waiting_tasks: self.counters.waiting.load(Ordering::Relaxed),
            completed_tasks: self.counters.completed.load(Ordering::Relaxed),
            stopped_tasks: self.counters.stopped.load(Ordering::Relaxed),
            global_download_speed: self.counters.global_speed.load(Ordering::Relaxed),
            total_downloaded: self.counters.total_downloaded.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable control surface usable from listener callbacks and other
/// threads while `Engine::run` owns the loop.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

impl EngineHandle {
    pub fn add_download(&self, uri: &str, options: DownloadOptions) -> Result<TaskId> {
        self.shared.add_download(vec![uri.to_string()], options)
    }

    pub fn add_download_uris(
        &self,
        uris: Vec<String>,
        options: DownloadOptions,
    ) -> Result<TaskId> {
        self.shared.add_download(uris, options)
    }

    pub fn pause_task(&self, id: TaskId) -> bool {
        self.shared.pause_task(id)
    }

    pub fn resume_task(&self, id: TaskId) -> bool {
        self.shared.resume_task(id)
    }

    pub fn cancel_task(&self, id: TaskId) -> bool {
        self.shared.cancel_task(id)
    }

    pub fn task(&self, id: TaskId) -> Option<Arc<DownloadTask>> {
        self.shared.task(id)
    }

    pub fn get_statistics(&self) -> Statistics {
        self.shared.statistics()
    }

    pub fn shutdown(&self) {
        self.shared.halt.fetch_max(1, Ordering::Relaxed);
    }

    pub fn force_shutdown(&self) {
        self.shared.halt.store(2, Ordering::Relaxed);
    }
}

/// A command suspended on fd readiness.
struct Suspended {
    command: Command,
    fd: RawFd,
    deadline: Instant,
}

/// A command parked until a deadline (retry backoff, rate limiting).
struct TimedEntry {
    deadline: Instant,
    seq: u64,
    command: Command,
}

impl PartialEq for TimedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimedEntry {}

impl PartialOrd for TimedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedEntry {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The download engine. Construct, add downloads, then call `run()`.
pub struct Engine {
    shared: Arc<EngineShared>,
    config: EngineConfig,
    poll: Box<dyn EventPoll>,
    pool: SocketPool,
    groups: RequestGroupMan,
    global_limiter: Arc<SpeedLimiter>,
    ready: VecDeque<Command>,
    suspended: HashMap<CommandId, Suspended>,
    fd_index: HashMap<RawFd, CommandId>,
    timed: BinaryHeap<TimedEntry>,
    routines: Vec<Command>,
    next_command_id: CommandId,
    timed_seq: u64,
}

impl Engine {
    /// Engine with inline (synchronous) event delivery.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_dispatcher(config, Arc::new(EventDispatcher::new_sync()))
    }

    /// Engine with a caller-provided dispatcher (e.g. async delivery).
    pub fn with_dispatcher(
        config: EngineConfig,
        dispatcher: Arc<EventDispatcher>,
    ) -> Result<Self> {
        let poll = create_event_poll()?;
        let groups = RequestGroupMan::new(config.max_concurrent_tasks);
        let global_limiter = Arc::new(SpeedLimiter::new(config.global_speed_limit));
        let mut engine = Self {
            shared: Arc::new(EngineShared::new(dispatcher)),
            config,
            poll,
            pool: SocketPool::default(),
            groups,
            global_limiter,
            ready: VecDeque::new(),
            suspended: HashMap::new(),
            fd_index: HashMap::new(),
            timed: BinaryHeap::new(),
            routines: Vec::new(),
            next_command_id: 1,
            timed_seq: 0,
        };
        engine.install_routines();
        Ok(engine)
    }

    /// Handle for controlling the engine from other threads.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn add_download(&self, uri: &str, options: DownloadOptions) -> Result<TaskId> {
        self.shared.add_download(vec![uri.to_string()], options)
    }

    /// Add a job with mirror URIs; later entries are failover alternatives.
    pub fn add_download_uris(
        &self,
        uris: Vec<String>,
        options: DownloadOptions,
    ) -> Result<TaskId> {
        self.shared.add_download(uris, options)
    }

    pub fn pause_task(&self, id: TaskId) -> bool {
        self.shared.pause_task(id)
    }

    pub fn resume_task(&self, id: TaskId) -> bool {
        self.shared.resume_task(id)
    }

    pub fn cancel_task(&self, id: TaskId) -> bool {
        self.shared.cancel_task(id)
    }

    pub fn pause_all(&self) {
        for id in self.shared.task_ids() {
            self.shared.pause_task(id);
        }
    }

    pub fn resume_all(&self) {
        for id in self.shared.task_ids() {
            self.shared.resume_task(id);
        }
    }

    pub fn cancel_all(&self) {
        for id in self.shared.task_ids() {
            self.shared.cancel_task(id);
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.shared.dispatcher.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn EventListener>) -> bool {
        self.shared.dispatcher.remove_listener(listener)
    }

    pub fn task(&self, id: TaskId) -> Option<Arc<DownloadTask>> {
        self.shared.task(id)
    }

    pub fn get_statistics(&self) -> Statistics {
        self.shared.statistics()
    }

    /// Request a graceful stop: the loop exits once active work finishes.
    pub fn shutdown(&self) {
        self.shared.halt.fetch_max(1, Ordering::Relaxed);
    }

    /// Request an immediate stop: active downloads are cancelled.
    pub fn force_shutdown(&self) {
        self.shared.halt.store(2, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_into(dir: &std::path::Path) -> (Engine, DownloadOptions) {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let options = DownloadOptions {
            output_directory: dir.to_string_lossy().into_owned(),
            ..DownloadOptions::default()
        };
        (engine, options)
    }

    #[test]
    fn add_download_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, options) = engine_into(dir.path());

        let err = engine.add_download("ftp://example.com/f", options.clone());
        assert!(matches!(err, Err(EngineError::InvalidInput(_))));

        let err = engine.add_download_uris(vec![], options.clone());
        assert!(matches!(err, Err(EngineError::InvalidInput(_))));

        let mut bad_checksum = options;
        bad_checksum.checksum = Some("nothex".into());
        let err = engine.add_download("http://example.com/f", bad_checksum);
        assert!(matches!(err, Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn add_download_refuses_missing_directory_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut options) = engine_into(dir.path());
        options.output_directory = dir
            .path()
            .join("missing")
            .to_string_lossy()
            .into_owned();
        options.create_directory = false;
        let err = engine.add_download("http://example.com/f", options);
        assert!(matches!(err, Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn task_ids_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, options) = engine_into(dir.path());
        let a = engine
            .add_download("http://example.com/a", options.clone())
            .unwrap();
        let b = engine.add_download("http://example.com/b", options).unwrap();
        assert!(b > a);
        assert!(engine.task(a).is_some());
        assert_eq!(engine.task(a).unwrap().status(), TaskStatus::Pending);
    }

    #[test]
    fn control_on_unknown_task_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_into(dir.path());
        assert!(!engine.pause_task(99));
        assert!(!engine.resume_task(99));
        assert!(!engine.cancel_task(99));
    }

    #[test]
    fn pause_resume_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, options) = engine_into(dir.path());
        let id = engine.add_download("http://example.com/f", options).unwrap();

        assert!(engine.pause_task(id));
        assert!(!engine.pause_task(id), "second pause is a no-op");
        assert_eq!(engine.task(id).unwrap().status(), TaskStatus::Paused);

        assert!(engine.resume_task(id));
        assert!(!engine.resume_task(id), "resume of a non-paused task");

        assert!(engine.cancel_task(id));
        assert!(!engine.resume_task(id), "cancelled task cannot resume");
    }

    #[test]
    fn statistics_start_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_into(dir.path());
        let stats = engine.get_statistics();
        assert_eq!(stats.active_tasks, 0);
        assert_eq!(stats.completed_tasks, 0);
        assert_eq!(stats.total_downloaded, 0);
    }
}
