//! Listener registry and event fan-out.
//!
//! Sync mode invokes listeners inline on the dispatching thread; async mode
//! hands events to a small worker pool through a bounded queue, dropping (and
//! counting) events on overflow. Listeners must not block the scheduler:
//! heavy consumers configure async mode or hand off themselves.

use crate::types::{Bytes, FileInfo, ProgressInfo, TaskId, TaskStatus};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

/// Download lifecycle callbacks. Default impls are no-ops so listeners
/// implement only what they care about.
pub trait EventListener: Send + Sync {
    fn on_status_changed(&self, task_id: TaskId, old: TaskStatus, new: TaskStatus) {
        let _ = (task_id, old, new);
    }

    fn on_progress(&self, info: &ProgressInfo) {
        let _ = info;
    }

    fn on_error(&self, task_id: TaskId, message: &str) {
        let _ = (task_id, message);
    }

    fn on_completed(&self, task_id: TaskId, output_path: &std::path::Path) {
        let _ = (task_id, output_path);
    }

    fn on_file_info(&self, task_id: TaskId, info: &FileInfo) {
        let _ = (task_id, info);
    }

    fn on_custom(&self, name: &str, data: &str) {
        let _ = (name, data);
    }
}

/// An event queued for delivery.
#[derive(Debug, Clone)]
pub enum Event {
    StatusChanged {
        task_id: TaskId,
        old: TaskStatus,
        new: TaskStatus,
    },
    Progress(ProgressInfo),
    Error {
        task_id: TaskId,
        message: String,
    },
    Completed {
        task_id: TaskId,
        path: PathBuf,
        size: Bytes,
        duration: Duration,
    },
    FileInfo {
        task_id: TaskId,
        info: FileInfo,
    },
    Custom {
        name: String,
        data: String,
    },
}

enum Delivery {
    Sync,
    Async {
        tx: Mutex<Option<SyncSender<Event>>>,
        workers: Mutex<Vec<JoinHandle<()>>>,
    },
}

/// Fan-out hub for engine events.
pub struct EventDispatcher {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
    delivery: Delivery,
    dropped: AtomicU64,
}

impl EventDispatcher {
    /// Listeners are invoked inline by whichever thread dispatches.
    pub fn new_sync() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            delivery: Delivery::Sync,
            dropped: AtomicU64::new(0),
        }
    }

    /// Events are queued (bounded) and delivered by `workers` threads.
    pub fn new_async(queue_capacity: usize, workers: usize) -> Arc<Self> {
        let (tx, rx) = sync_channel(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let dispatcher = Arc::new(Self {
            listeners: RwLock::new(Vec::new()),
            delivery: Delivery::Async {
                tx: Mutex::new(Some(tx)),
                workers: Mutex::new(Vec::new()),
            },
            dropped: AtomicU64::new(0),
        });
        let mut handles = Vec::new();
        for i in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            // Weak reference: worker threads must not keep the dispatcher
            // alive, or drop-time cleanup would never run.
            let this = Arc::downgrade(&dispatcher);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("falcon-events-{i}"))
                    .spawn(move || loop {
                        let event = {
                            let guard = rx.lock().unwrap();
                            guard.recv()
                        };
                        match (event, this.upgrade()) {
                            (Ok(e), Some(dispatcher)) => dispatcher.deliver(&e),
                            _ => break,
                        }
                    })
                    .expect("spawn event worker"),
            );
        }
        if let Delivery::Async { workers, .. } = &dispatcher.delivery {
            *workers.lock().unwrap() = handles;
        }
        dispatcher
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    /// Remove a previously added listener (matched by identity). Returns
    /// whether it was present.
    pub fn remove_listener(&self, listener: &Arc<dyn EventListener>) -> bool {
        let mut listeners = self.listeners.write().unwrap();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap().len()
    }

    /// Events dropped due to a full async queue.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Dispatch one event according to the delivery mode.
    pub fn dispatch(&self, event: Event) {
        match &self.delivery {
            Delivery::Sync => self.deliver(&event),
            Delivery::Async { tx, .. } => {
                let guard = tx.lock().unwrap();
                match guard.as_ref() {
                    Some(tx) => match tx.try_send(event) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(TrySendError::Disconnected(_)) => {}
                    },
                    None => self.deliver(&event),
                }
            }
        }
    }

    /// Stop async delivery, draining queued events synchronously. A no-op in
    /// sync mode.
    pub fn stop(&self) {
        if let Delivery::Async { tx, workers } = &self.delivery {
            tx.lock().unwrap().take();
            let handles: Vec<_> = workers.lock().unwrap().drain(..).collect();
            for h in handles {
                let _ = h.join();
            }
        }
    }

    fn deliver(&self, event: &Event) {
        let listeners: Vec<_> = self.listeners.read().unwrap().clone();
        for l in &listeners {
            match event {
                Event::StatusChanged { task_id, old, new } => {
                    l.on_status_changed(*task_id, *old, *new)
                }
                Event::Progress(info) => l.on_progress(info),
                Event::Error { task_id, message } => l.on_error(*task_id, message),
                Event::Completed { task_id, path, .. } => l.on_completed(*task_id, path),
                Event::FileInfo { task_id, info } => l.on_file_info(*task_id, info),
                Event::Custom { name, data } => l.on_custom(name, data),
            }
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
