//! Worker pool, progress monitor, and merge for one segmented download.
//!
//! This is the only place the engine spawns OS threads: one worker per
//! connection plus a supervisor that monitors progress and performs the
//! merge. Workers touch no scheduler state; they communicate through the
//! atomic fields on their segments and the shared flags here.

use super::fetch::{seed_from_parts, SegmentFetch, SegmentFetchFn};
use super::{plan_segments, Segment, SegmentConfig};
use crate::error::EngineError;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::storage;
use crate::task::DownloadTask;
use crate::types::Bytes;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Lifecycle of one segmented download run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

fn state_to_u8(s: SegmentState) -> u8 {
    match s {
        SegmentState::Running => 0,
        SegmentState::Completed => 1,
        SegmentState::Failed => 2,
        SegmentState::Paused => 3,
        SegmentState::Cancelled => 4,
    }
}

fn state_from_u8(v: u8) -> SegmentState {
    match v {
        0 => SegmentState::Running,
        1 => SegmentState::Completed,
        2 => SegmentState::Failed,
        3 => SegmentState::Paused,
        _ => SegmentState::Cancelled,
    }
}

struct Shared {
    task: Arc<DownloadTask>,
    url: String,
    output_path: PathBuf,
    file_size: Bytes,
    config: SegmentConfig,
    retry: RetryPolicy,
    resume_enabled: bool,
    segments: Vec<Arc<Segment>>,
    queue: Mutex<VecDeque<usize>>,
    /// Cancel/pause/fatal signal observed by workers between reads.
    stop: AtomicBool,
    cancelled: AtomicBool,
    paused: AtomicBool,
    state: AtomicU8,
    error: Mutex<Option<EngineError>>,
}

/// Drives one segmented download to completion on background threads.
pub struct SegmentDownloader {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SegmentDownloader {
    /// Plan segments for `file_size` and seed progress from any part files a
    /// previous run left behind (when resuming). With resume disabled, stale
    /// parts are removed first.
    pub fn new(
        task: Arc<DownloadTask>,
        url: String,
        output_path: PathBuf,
        file_size: Bytes,
        config: SegmentConfig,
        retry: RetryPolicy,
        resume_enabled: bool,
    ) -> Self {
        let segments: Vec<Arc<Segment>> = plan_segments(file_size, &config)
            .into_iter()
            .map(Arc::new)
            .collect();
        if resume_enabled {
            let resumed = seed_from_parts(&output_path, &segments);
            if resumed > 0 {
                tracing::info!(
                    task_id = task.id(),
                    resumed_bytes = resumed,
                    "resuming from part files"
                );
            }
        } else {
            storage::remove_temp_files(&output_path, segments.len());
        }
        let queue: VecDeque<usize> = segments
            .iter()
            .filter(|s| !s.completed.load(Ordering::Relaxed))
            .map(|s| s.index)
            .collect();
        Self {
            shared: Arc::new(Shared {
                task,
                url,
                output_path,
                file_size,
                config,
                retry,
                resume_enabled,
                segments,
                queue: Mutex::new(queue),
                stop: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                state: AtomicU8::new(state_to_u8(SegmentState::Running)),
                error: Mutex::new(None),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Spawn the workers and the supervising monitor. Returns immediately.
    pub fn start(&self, fetch: SegmentFetchFn) {
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name(format!("falcon-seg-{}", shared.task.id()))
            .spawn(move || supervise(shared, fetch))
            .expect("spawn segment supervisor");
        *self.supervisor.lock().unwrap() = Some(handle);
    }

    /// Stop workers, keeping part files for a later resume.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Relaxed);
        self.shared.stop.store(true, Ordering::Relaxed);
    }

    /// Stop workers and discard temp state.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Relaxed);
        self.shared.stop.store(true, Ordering::Relaxed);
    }

    pub fn state(&self) -> SegmentState {
        state_from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Terminal error, once the state is Failed.
    pub fn take_error(&self) -> Option<EngineError> {
        self.shared.error.lock().unwrap().take()
    }

    pub fn downloaded_bytes(&self) -> Bytes {
        self.shared
            .segments
            .iter()
            .map(|s| s.downloaded.load(Ordering::Relaxed))
            .sum()
    }

    pub fn total_bytes(&self) -> Bytes {
        self.shared.file_size
    }

    pub fn total_segments(&self) -> usize {
        self.shared.segments.len()
    }

    pub fn completed_segments(&self) -> usize {
        self.shared
            .segments
            .iter()
            .filter(|s| s.completed.load(Ordering::Relaxed))
            .count()
    }

    pub fn active_connections(&self) -> usize {
        self.shared
            .segments
            .iter()
            .filter(|s| s.active.load(Ordering::Relaxed))
            .count()
    }

    /// Wait for the supervisor (and with it all workers) to finish.
    pub fn join(&self) {
        if let Some(handle) = self.supervisor.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SegmentDownloader {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        self.join();
    }
}

fn supervise(shared: Arc<Shared>, fetch: SegmentFetchFn) {
    let worker_count = {
        let queued = shared.queue.lock().unwrap().len();
        shared.config.num_connections.min(queued.max(1))
    };
    let mut workers = Vec::with_capacity(worker_count);
    for i in 0..worker_count {
        let shared = Arc::clone(&shared);
        let fetch = Arc::clone(&fetch);
        workers.push(
            std::thread::Builder::new()
                .name(format!("falcon-worker-{}-{}", shared.task.id(), i))
                .spawn(move || worker_loop(&shared, &fetch))
                .expect("spawn segment worker"),
        );
    }

    monitor(&shared, &workers);
    for w in workers {
        let _ = w.join();
    }
    finish(&shared);
}

fn worker_loop(shared: &Shared, fetch: &SegmentFetchFn) {
    loop {
        if shared.stop.load(Ordering::Relaxed) {
            return;
        }
        let index = match shared.queue.lock().unwrap().pop_front() {
            Some(i) => i,
            None => return,
        };
        let segment = &shared.segments[index];
        if segment.completed.load(Ordering::Relaxed) {
            continue;
        }
        segment.active.store(true, Ordering::Relaxed);
        let part_path = storage::part_path(&shared.output_path, index);
        let request = SegmentFetch {
            url: &shared.url,
            segment,
            part_path: &part_path,
            stop: &shared.stop,
        };
        let result = fetch(&request);
        segment.active.store(false, Ordering::Relaxed);

        match result {
            Ok(()) => {
                segment.completed.store(true, Ordering::Relaxed);
                segment.restart.store(false, Ordering::Relaxed);
                tracing::debug!(
                    task_id = shared.task.id(),
                    segment = index,
                    "segment complete"
                );
            }
            Err(_) if shared.stop.load(Ordering::Relaxed) => return,
            Err(e) => {
                if segment.restart.swap(false, Ordering::Relaxed) {
                    // Watchdog interruption: requeue at no retry cost; the
                    // next attempt resumes from the part file offset.
                    tracing::debug!(
                        task_id = shared.task.id(),
                        segment = index,
                        "restarting slow segment"
                    );
                    shared.queue.lock().unwrap().push_back(index);
                    continue;
                }
                let attempt = segment.attempts.fetch_add(1, Ordering::Relaxed) + 1;
                match shared.retry.decide(attempt, &e) {
                    RetryDecision::RetryAfter(delay) => {
                        tracing::warn!(
                            task_id = shared.task.id(),
                            segment = index,
                            attempt,
                            error = %e,
                            "segment failed, will retry"
                        );
                        std::thread::sleep(delay);
                        shared.queue.lock().unwrap().push_back(index);
                    }
                    RetryDecision::NoRetry => {
                        tracing::error!(
                            task_id = shared.task.id(),
                            segment = index,
                            error = %e,
                            "segment failed terminally"
                        );
                        shared.error.lock().unwrap().get_or_insert(e);
                        shared.stop.store(true, Ordering::Relaxed);
                        return;
                    }
                }
            }
        }
    }
}

/// Aggregate progress, push it to the task, and watch for stalled workers,
/// until every worker has exited.
fn monitor(shared: &Shared, workers: &[JoinHandle<()>]) {
    let interval = Duration::from_millis(shared.config.progress_interval_ms);
    let mut last_total = total_downloaded(shared);
    let mut last_tick = Instant::now();
    let mut windows: Vec<(Bytes, Instant)> = shared
        .segments
        .iter()
        .map(|s| (s.downloaded.load(Ordering::Relaxed), Instant::now()))
        .collect();

    while !workers.iter().all(|w| w.is_finished()) {
        std::thread::sleep(Duration::from_millis(50).min(interval));
        if last_tick.elapsed() < interval {
            continue;
        }

        let now = Instant::now();
        let total = total_downloaded(shared);
        let elapsed = now.duration_since(last_tick).as_secs_f64();
        let speed = if elapsed > 0.0 {
            ((total.saturating_sub(last_total)) as f64 / elapsed) as u64
        } else {
            0
        };
        last_total = total;
        last_tick = now;
        if !shared.stop.load(Ordering::Relaxed) {
            shared.task.update_progress(total, shared.file_size, speed);
        }

        watchdog(shared, &mut windows, now);
    }
}

/// Flag segments whose throughput stayed below the threshold for the
/// configured window; their workers restart the connection.
fn watchdog(shared: &Shared, windows: &mut [(Bytes, Instant)], now: Instant) {
    if shared.config.slow_speed_threshold == 0 {
        return;
    }
    let slow_window = Duration::from_secs(shared.config.slow_timeout_secs);
    for (segment, window) in shared.segments.iter().zip(windows.iter_mut()) {
        if !segment.active.load(Ordering::Relaxed) {
            *window = (segment.downloaded.load(Ordering::Relaxed), now);
            continue;
        }
        let downloaded = segment.downloaded.load(Ordering::Relaxed);
        let elapsed = now.duration_since(window.1);
        let floor = (shared.config.slow_speed_threshold as f64 * elapsed.as_secs_f64()) as u64;
        if downloaded.saturating_sub(window.0) >= floor.max(1) {
            *window = (downloaded, now);
        } else if elapsed >= slow_window {
            tracing::warn!(
                task_id = shared.task.id(),
                segment = segment.index,
                "connection below speed threshold, restarting"
            );
            segment.restart.store(true, Ordering::Relaxed);
            *window = (downloaded, now);
        }
    }
}

fn total_downloaded(shared: &Shared) -> Bytes {
    shared
        .segments
        .iter()
        .map(|s| s.downloaded.load(Ordering::Relaxed))
        .sum()
}

/// Decide the terminal state once all workers have exited, merging on
/// success.
fn finish(shared: &Shared) {
    let state = if shared.cancelled.load(Ordering::Relaxed) {
        storage::remove_temp_files(&shared.output_path, shared.segments.len());
        SegmentState::Cancelled
    } else if shared.paused.load(Ordering::Relaxed) {
        SegmentState::Paused
    } else if shared.error.lock().unwrap().is_some() {
        if !shared.resume_enabled {
            storage::remove_temp_files(&shared.output_path, shared.segments.len());
        }
        SegmentState::Failed
    } else if shared
        .segments
        .iter()
        .all(|s| s.completed.load(Ordering::Relaxed))
    {
        let total = total_downloaded(shared);
        shared.task.update_progress(total, shared.file_size, 0);
        match storage::merge_parts(&shared.output_path, shared.segments.len(), shared.file_size) {
            Ok(()) => SegmentState::Completed,
            Err(e) => {
                shared.error.lock().unwrap().get_or_insert(e);
                SegmentState::Failed
            }
        }
    } else {
        // Workers exited without completing everything or recording a cause.
        shared
            .error
            .lock()
            .unwrap()
            .get_or_insert(EngineError::Network("segment workers exited early".into()));
        if !shared.resume_enabled {
            storage::remove_temp_files(&shared.output_path, shared.segments.len());
        }
        SegmentState::Failed
    };
    shared.state.store(state_to_u8(state), Ordering::Release);
    tracing::debug!(task_id = shared.task.id(), state = ?state, "segmented download finished");
}
