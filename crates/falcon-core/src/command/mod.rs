//! Scheduler commands: tagged state machines stepped by the event loop.
//!
//! Each variant owns exactly the state its next step needs; a step never
//! blocks, returning a `StepOutcome` that tells the scheduler whether to
//! drop, suspend, or re-queue the command. Failures are routed through the
//! group's retry budget and URI failover here, so no error ever unwinds
//! into the loop.

mod download;
mod initiate;
mod response;
mod retry_cmd;
mod routine;
mod verify;

pub use download::DownloadCommand;
pub use initiate::InitiateCommand;
pub use response::ResponseCommand;
pub use retry_cmd::RetryCommand;
pub use routine::{RoutineCommand, RoutineKind};
pub use verify::VerifyCommand;

use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind};
use crate::events::{Event, EventDispatcher};
use crate::group::{GroupStatus, RequestGroupMan};
use crate::net::SocketPool;
use crate::retry::RetryPolicy;
use crate::speed::SpeedLimiter;
use crate::task::DownloadTask;
use crate::types::{CommandId, TaskId, TaskStatus};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Redirect chain cap, matching common client behavior.
pub const MAX_REDIRECTS: u32 = 10;

/// What a command asks the scheduler to do after one step.
#[derive(Debug)]
pub enum StepOutcome {
    /// Finished (successfully or after delegating); drop the command.
    Done,
    /// Suspend until `fd` is ready for `interest`.
    WaitIo { fd: RawFd, interest: u8 },
    /// Re-queue at `deadline` (backoff timers, rate limiting).
    Retry { deadline: Instant },
    /// Unrecoverable for this command; the scheduler fails the group.
    Failed(EngineError),
}

/// Why the scheduler woke a suspended command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// First step, or re-queued after a retry deadline.
    Run,
    /// The awaited fd became ready (bitmask of fired interest).
    Io(u8),
    /// The suspension deadline expired.
    Timeout,
    /// The owning task was paused or cancelled.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Ready,
    Active,
    Completed,
    Failed,
}

/// Command payload, dispatched by tag in `Command::step`.
pub enum CommandKind {
    HttpInitiate(InitiateCommand),
    HttpResponse(ResponseCommand),
    HttpDownload(DownloadCommand),
    HttpRetry(RetryCommand),
    HashVerify(VerifyCommand),
    Routine(RoutineCommand),
}

/// One schedulable unit of work, owned by the scheduler while queued.
pub struct Command {
    pub id: CommandId,
    pub task_id: TaskId,
    pub status: CommandStatus,
    pub wake: WakeReason,
    pub kind: CommandKind,
}

impl Command {
    pub fn new(id: CommandId, task_id: TaskId, kind: CommandKind) -> Self {
        Self {
            id,
            task_id,
            status: CommandStatus::Ready,
            wake: WakeReason::Run,
            kind,
        }
    }

    pub fn name(&self) -> &'static str {
        match &self.kind {
            CommandKind::HttpInitiate(_) => "HttpInitiate",
            CommandKind::HttpResponse(_) => "HttpResponse",
            CommandKind::HttpDownload(_) => "HttpDownload",
            CommandKind::HttpRetry(_) => "HttpRetry",
            CommandKind::HashVerify(_) => "HashVerify",
            CommandKind::Routine(_) => "Routine",
        }
    }

    /// Advance the state machine one step. Never blocks.
    pub fn step(&mut self, ctx: &mut StepContext<'_>) -> StepOutcome {
        self.status = CommandStatus::Active;
        let task_id = self.task_id;
        let wake = self.wake;
        self.wake = WakeReason::Run;
        let outcome = match &mut self.kind {
            CommandKind::HttpInitiate(c) => c.step(ctx, task_id, wake),
            CommandKind::HttpResponse(c) => c.step(ctx, task_id, wake),
            CommandKind::HttpDownload(c) => c.step(ctx, task_id, wake),
            CommandKind::HttpRetry(c) => c.step(ctx, task_id, wake),
            CommandKind::HashVerify(c) => c.step(ctx, task_id),
            CommandKind::Routine(c) => c.step(ctx),
        };
        self.status = match &outcome {
            StepOutcome::Done => CommandStatus::Completed,
            StepOutcome::Failed(_) => CommandStatus::Failed,
            _ => CommandStatus::Active,
        };
        outcome
    }
}

/// Everything a step may touch. Borrowed from the engine for the duration of
/// one step; commands scheduled here enter the ready queue next tick.
pub struct StepContext<'a> {
    pub config: &'a EngineConfig,
    pub pool: &'a SocketPool,
    pub groups: &'a mut RequestGroupMan,
    pub tasks: &'a Mutex<HashMap<TaskId, Arc<DownloadTask>>>,
    pub dispatcher: &'a Arc<EventDispatcher>,
    pub global_limiter: &'a Arc<SpeedLimiter>,
    pub new_commands: &'a mut Vec<Command>,
    pub next_command_id: &'a mut CommandId,
    pub now: Instant,
}

impl StepContext<'_> {
    pub fn task(&self, id: TaskId) -> Option<Arc<DownloadTask>> {
        self.tasks.lock().unwrap().get(&id).cloned()
    }

    /// Queue a follow-up command; it runs no earlier than the next tick.
    pub fn schedule(&mut self, task_id: TaskId, kind: CommandKind) {
        let id = *self.next_command_id;
        *self.next_command_id += 1;
        self.new_commands.push(Command::new(id, task_id, kind));
    }

    /// Mark the group and task failed and notify listeners. The scheduler
    /// deactivates the group on its next pass.
    pub fn fail_group(&mut self, task_id: TaskId, error: &EngineError) {
        tracing::error!(task_id, error = %error, "download failed");
        if let Some(group) = self.groups.find_mut(task_id) {
            group.set_error_message(error.to_string());
            group.set_status(GroupStatus::Error);
        }
        if let Some(task) = self.task(task_id) {
            task.set_error(&error.to_string());
            task.set_status(TaskStatus::Failed);
        }
    }

    /// Route a mid-flight error: absorb it with the retry budget, fail over
    /// to the next URI, or fail the group.
    pub fn fail_or_retry(&mut self, task_id: TaskId, error: EngineError) -> StepOutcome {
        if matches!(error.kind(), ErrorKind::Cancelled) {
            return StepOutcome::Done;
        }
        if matches!(
            error.kind(),
            ErrorKind::InvalidInput | ErrorKind::FileIo | ErrorKind::Verification
        ) {
            self.fail_group(task_id, &error);
            return StepOutcome::Done;
        }

        let group = match self.groups.find_mut(task_id) {
            Some(g) => g,
            None => return StepOutcome::Done,
        };
        if error.is_retryable() {
            let attempt = group.bump_retry_count();
            let max_retries = group.options().max_retries;
            if attempt <= max_retries {
                let delay = RetryPolicy::from_options(group.options()).backoff(attempt - 1);
                tracing::warn!(
                    task_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "scheduling retry"
                );
                self.schedule(
                    task_id,
                    CommandKind::HttpRetry(RetryCommand::new(delay)),
                );
                return StepOutcome::Done;
            }
        }
        self.advance_uri_or_fail(task_id, error)
    }

    /// Skip the retry budget: move straight to the next URI (DNS failures
    /// and terminal HTTP statuses), failing the group when none is left.
    pub fn advance_uri_or_fail(&mut self, task_id: TaskId, error: EngineError) -> StepOutcome {
        let advanced = match self.groups.find_mut(task_id) {
            Some(group) => {
                group.set_error_message(error.to_string());
                group.try_next_uri()
            }
            None => return StepOutcome::Done,
        };
        if advanced {
            let url = self
                .groups
                .find(task_id)
                .map(|g| g.current_uri().to_string())
                .unwrap_or_default();
            self.schedule(task_id, CommandKind::HttpInitiate(InitiateCommand::new(url)));
            StepOutcome::Done
        } else {
            self.fail_group(task_id, &error);
            StepOutcome::Done
        }
    }

    /// Finish a downloaded file: schedule checksum verification when the
    /// options ask for it, otherwise complete the task right away.
    pub fn complete_download(&mut self, task_id: TaskId, path: &Path) -> StepOutcome {
        let checksum = self
            .groups
            .find(task_id)
            .and_then(|g| g.options().checksum.clone());
        match checksum {
            Some(expected) => {
                self.schedule(
                    task_id,
                    CommandKind::HashVerify(VerifyCommand::new(path.to_path_buf(), expected)),
                );
                StepOutcome::Done
            }
            None => {
                self.finish_completed(task_id, path);
                StepOutcome::Done
            }
        }
    }

    /// Final bookkeeping for a successful download.
    pub fn finish_completed(&mut self, task_id: TaskId, path: &Path) {
        if let Some(group) = self.groups.find_mut(task_id) {
            group.set_status(GroupStatus::Completed);
        }
        if let Some(task) = self.task(task_id) {
            let total = task.total_bytes();
            task.update_progress(total, total, 0);
            task.set_status(TaskStatus::Completed);
            self.dispatcher.dispatch(Event::Completed {
                task_id,
                path: path.to_path_buf(),
                size: total,
                duration: task.elapsed(),
            });
            tracing::info!(task_id, path = %path.display(), bytes = total, "download complete");
        }
    }

    /// True when the task asked to stop; the caller cleans up and returns
    /// `Done`.
    pub fn interrupted(&self, task_id: TaskId) -> bool {
        match self.task(task_id) {
            Some(task) => task.cancel_requested() || task.pause_requested(),
            None => true,
        }
    }
}
