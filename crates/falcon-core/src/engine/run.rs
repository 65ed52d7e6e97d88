//! The scheduler loop: one tick drains ready commands, runs due routines,
//! supervises segmented downloads, promotes waiting groups, then parks in
//! the event poll until an fd, a timer, or the configured timeout fires.

use super::{ControlOp, Engine, Suspended, TimedEntry};
use crate::command::{
    Command, CommandKind, InitiateCommand, RoutineCommand, RoutineKind, StepContext, StepOutcome,
    WakeReason,
};
use crate::error::EngineError;
use crate::group::{GroupStatus, RequestGroup};
use crate::poll::interest;
use crate::segment::SegmentState;
use crate::storage;
use crate::types::{CommandId, TaskId, TaskStatus};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

/// Build a `StepContext` from disjoint engine fields. A macro keeps the
/// borrow splitting in one place.
macro_rules! step_ctx {
    ($engine:expr, $now:expr, $new_commands:expr) => {
        StepContext {
            config: &$engine.config,
            pool: &$engine.pool,
            groups: &mut $engine.groups,
            tasks: &$engine.shared.tasks,
            dispatcher: &$engine.shared.dispatcher,
            global_limiter: &$engine.global_limiter,
            new_commands: $new_commands,
            next_command_id: &mut $engine.next_command_id,
            now: $now,
        }
    };
}

impl Engine {
    /// Drive all downloads to completion. Blocks until every task reaches a
    /// terminal state (paused tasks keep the loop alive) or shutdown is
    /// requested.
    pub fn run(&mut self) {
        tracing::info!("engine loop starting");
        loop {
            let now = Instant::now();
            if self.shared.halt.load(Ordering::Relaxed) >= 2 {
                self.cancel_all();
            }
            self.apply_control_ops();
            self.drain_ready(now);
            self.run_routines(now);
            self.supervise_groups(now);
            if self.shared.halt.load(Ordering::Relaxed) == 0 {
                // A graceful shutdown finishes active work but promotes no
                // new groups.
                self.promote_waiting();
            }
            self.update_counters();
            if self.should_exit() {
                break;
            }
            let timeout = self.poll_timeout(now);
            self.poll_and_wake(timeout);
            let now = Instant::now();
            self.expire_deadlines(now);
            self.release_due_retries(now);
        }
        // Join any background workers of finished groups before returning,
        // so temp-file cleanup is observable once run() exits.
        let finished: Vec<TaskId> = self
            .groups
            .iter()
            .filter(|g| g.status().is_finished())
            .map(|g| g.id())
            .collect();
        for id in finished {
            drop(self.groups.remove_group(id));
        }
        self.pool.clear();
        self.update_counters();
        tracing::info!("engine loop stopped");
    }

    pub(super) fn install_routines(&mut self) {
        let progress = RoutineCommand::new(
            RoutineKind::ProgressTick {
                window: Default::default(),
            },
            Duration::from_millis(500),
        );
        let cleanup = RoutineCommand::new(RoutineKind::PoolCleanup, Duration::from_secs(10));
        for routine in [progress, cleanup] {
            let id = self.next_command_id;
            self.next_command_id += 1;
            self.routines
                .push(Command::new(id, 0, CommandKind::Routine(routine)));
        }
    }

    fn apply_control_ops(&mut self) {
        let ops: Vec<ControlOp> = self.shared.ops.lock().unwrap().drain(..).collect();
        for op in ops {
            match op {
                ControlOp::Add {
                    task_id,
                    uris,
                    options,
                } => self.handle_add(task_id, uris, *options),
                ControlOp::Pause(id) => self.handle_pause(id),
                ControlOp::Resume(id) => self.handle_resume(id),
                ControlOp::Cancel(id) => self.handle_cancel(id),
            }
        }
    }

    fn handle_add(&mut self, task_id: TaskId, uris: Vec<String>, options: crate::options::DownloadOptions) {
        let task = match self.shared.task(task_id) {
            Some(t) => t,
            None => return,
        };
        if task.status().is_terminal() {
            return; // cancelled before the loop saw it
        }
        match RequestGroup::new(task_id, uris, options, task.clone()) {
            Ok(group) => self.groups.add(group),
            Err(e) => {
                task.set_error(&e.to_string());
                task.set_status(TaskStatus::Failed);
            }
        }
    }

    fn handle_pause(&mut self, id: TaskId) {
        self.wake_task_commands(id);
        let was_active = match self.groups.find_mut(id) {
            Some(group) => match group.status() {
                GroupStatus::Active => {
                    if let Some(dl) = group.segment_downloader() {
                        dl.pause();
                    }
                    group.set_status(GroupStatus::Paused);
                    true
                }
                GroupStatus::Waiting => {
                    group.set_status(GroupStatus::Paused);
                    false
                }
                _ => false,
            },
            None => false,
        };
        if was_active {
            self.groups.deactivate(id);
        }
    }

    fn handle_resume(&mut self, id: TaskId) {
        // Wait for a paused segmented run to wind down before re-planning
        // from its part files.
        let still_running = self
            .groups
            .find(id)
            .and_then(|g| g.segment_downloader())
            .map(|d| d.state() == SegmentState::Running)
            .unwrap_or(false);
        if still_running {
            self.shared.push_op(ControlOp::Resume(id));
            return;
        }
        let resumed = match self.groups.find_mut(id) {
            Some(group) if group.status() == GroupStatus::Paused => {
                let _ = group.take_segment_downloader();
                group.set_status(GroupStatus::Waiting);
                true
            }
            _ => false,
        };
        if resumed {
            self.groups.requeue(id);
        }
    }

    fn handle_cancel(&mut self, id: TaskId) {
        self.wake_task_commands(id);
        if let Some(group) = self.groups.find_mut(id) {
            if let Some(dl) = group.segment_downloader() {
                dl.cancel();
            }
            if let Some(path) = group.output_path().cloned() {
                let _ = std::fs::remove_file(storage::tmp_path(&path));
            }
            group.set_status(GroupStatus::Removed);
        }
        self.groups.deactivate(id);
    }

    /// Wake every suspended or timer-parked command of a task so it observes
    /// the pause/cancel flag and winds down.
    fn wake_task_commands(&mut self, task_id: TaskId) {
        let suspended_ids: Vec<CommandId> = self
            .suspended
            .iter()
            .filter(|(_, s)| s.command.task_id == task_id)
            .map(|(id, _)| *id)
            .collect();
        for cid in suspended_ids {
            if let Some(s) = self.suspended.remove(&cid) {
                let _ = self.poll.remove(s.fd);
                self.fd_index.remove(&s.fd);
                let mut command = s.command;
                command.wake = WakeReason::Interrupted;
                self.ready.push_back(command);
            }
        }
        let entries = std::mem::take(&mut self.timed).into_vec();
        for entry in entries {
            if entry.command.task_id == task_id {
                let mut command = entry.command;
                command.wake = WakeReason::Interrupted;
                self.ready.push_back(command);
            } else {
                self.timed.push(entry);
            }
        }
    }

    /// Step every command that was ready at the start of this tick. Commands
    /// scheduled inside a step are appended afterwards, so they run no
    /// earlier than the next tick.
    fn drain_ready(&mut self, now: Instant) {
        let batch = self.ready.len();
        let mut new_commands = Vec::new();
        for _ in 0..batch {
            let mut command = match self.ready.pop_front() {
                Some(c) => c,
                None => break,
            };
            let outcome = {
                let mut ctx = step_ctx!(self, now, &mut new_commands);
                command.step(&mut ctx)
            };
            tracing::trace!(
                command = command.name(),
                id = command.id,
                task_id = command.task_id,
                "stepped"
            );
            match outcome {
                StepOutcome::Done => {}
                StepOutcome::WaitIo { fd, interest } => {
                    self.suspend_on_fd(command, fd, interest, now)
                }
                StepOutcome::Retry { deadline } => self.push_timed(deadline, command),
                StepOutcome::Failed(error) => {
                    let task_id = command.task_id;
                    let mut ctx = step_ctx!(self, now, &mut new_commands);
                    ctx.fail_group(task_id, &error);
                }
            }
        }
        self.ready.extend(new_commands);
    }

    fn suspend_on_fd(&mut self, command: Command, fd: i32, interest_mask: u8, now: Instant) {
        let timeout_secs = self
            .groups
            .find(command.task_id)
            .map(|g| g.options().timeout_seconds)
            .unwrap_or(30)
            .max(1);
        let deadline = now + Duration::from_secs(timeout_secs);
        if let Err(e) = self.poll.add(fd, interest_mask, command.id) {
            if self.poll.modify(fd, interest_mask).is_err() {
                // Registration failed outright; let the command see the error
                // through a synthetic readiness wake.
                tracing::warn!(fd, error = %e, "poll registration failed");
                let mut command = command;
                command.wake = WakeReason::Io(interest::ERR | interest::HANGUP);
                self.ready.push_back(command);
                return;
            }
        }
        self.fd_index.insert(fd, command.id);
        self.suspended.insert(
            command.id,
            Suspended {
                command,
                fd,
                deadline,
            },
        );
    }

    fn push_timed(&mut self, deadline: Instant, command: Command) {
        self.timed_seq += 1;
        self.timed.push(TimedEntry {
            deadline,
            seq: self.timed_seq,
            command,
        });
    }

    fn run_routines(&mut self, now: Instant) {
        let mut routines = std::mem::take(&mut self.routines);
        let mut new_commands = Vec::new();
        for command in routines.iter_mut() {
            let due = match &command.kind {
                CommandKind::Routine(r) => r.due(now),
                _ => false,
            };
            if due {
                let mut ctx = step_ctx!(self, now, &mut new_commands);
                let _ = command.step(&mut ctx);
            }
        }
        self.routines = routines;
        self.ready.extend(new_commands);
    }

    /// Watch segmented downloads for terminal states, retire finished
    /// groups, and drop removed ones.
    fn supervise_groups(&mut self, now: Instant) {
        enum Action {
            Complete(PathBuf),
            SegmentFailed(EngineError),
            None,
        }

        let active: Vec<TaskId> = self.groups.active_ids().to_vec();
        let mut new_commands = Vec::new();
        for id in active {
            let action = {
                let group = match self.groups.find_mut(id) {
                    Some(g) => g,
                    None => continue,
                };
                match group.segment_downloader().map(|d| d.state()) {
                    Some(SegmentState::Completed) => {
                        let _ = group.take_segment_downloader();
                        match group.output_path().cloned() {
                            Some(path) => Action::Complete(path),
                            None => Action::None,
                        }
                    }
                    Some(SegmentState::Failed) => {
                        let error = group
                            .take_segment_downloader()
                            .and_then(|dl| dl.take_error())
                            .unwrap_or_else(|| {
                                EngineError::Network("segmented download failed".into())
                            });
                        Action::SegmentFailed(error)
                    }
                    Some(SegmentState::Paused) | Some(SegmentState::Cancelled) => {
                        let _ = group.take_segment_downloader();
                        Action::None
                    }
                    _ => Action::None,
                }
            };
            match action {
                Action::Complete(path) => {
                    let mut ctx = step_ctx!(self, now, &mut new_commands);
                    let _ = ctx.complete_download(id, &path);
                }
                Action::SegmentFailed(error) => {
                    // Per-segment retries are already spent; move to the next
                    // mirror (part files stay for resume) or fail.
                    let mut ctx = step_ctx!(self, now, &mut new_commands);
                    let _ = ctx.advance_uri_or_fail(id, error);
                }
                Action::None => {}
            }
        }
        self.ready.extend(new_commands);

        let retired: Vec<TaskId> = self
            .groups
            .active_ids()
            .iter()
            .copied()
            .filter(|id| {
                self.groups
                    .find(*id)
                    .map(|g| g.status().is_finished())
                    .unwrap_or(true)
            })
            .collect();
        for id in retired {
            self.groups.deactivate(id);
        }

        let removable: Vec<TaskId> = self
            .groups
            .iter()
            .filter(|g| {
                g.status() == GroupStatus::Removed
                    && g.segment_downloader()
                        .map(|d| d.state() != SegmentState::Running)
                        .unwrap_or(true)
            })
            .map(|g| g.id())
            .collect();
        for id in removable {
            self.groups.remove_group(id);
        }
    }

    fn promote_waiting(&mut self) {
        for id in self.groups.fill_from_reservation() {
            let url = match self.groups.find_mut(id) {
                Some(group) => {
                    group.reset_redirects();
                    group.current_uri().to_string()
                }
                None => continue,
            };
            if let Some(task) = self.shared.task(id) {
                task.set_status(TaskStatus::Preparing);
            }
            let command_id = self.next_command_id;
            self.next_command_id += 1;
            self.ready.push_back(Command::new(
                command_id,
                id,
                CommandKind::HttpInitiate(InitiateCommand::new(url)),
            ));
            tracing::info!(task_id = id, "group activated");
        }
    }

    fn update_counters(&mut self) {
        let (mut completed, mut stopped) = (0usize, 0usize);
        let (mut total_downloaded, mut global_speed) = (0u64, 0u64);
        {
            let tasks = self.shared.tasks.lock().unwrap();
            for task in tasks.values() {
                match task.status() {
                    TaskStatus::Completed => completed += 1,
                    TaskStatus::Failed | TaskStatus::Cancelled => stopped += 1,
                    _ => global_speed += task.speed(),
                }
                total_downloaded += task.downloaded_bytes();
            }
        }
        let counters = &self.shared.counters;
        counters.active.store(self.groups.active_count(), Ordering::Relaxed);
        counters
            .waiting
            .store(self.groups.waiting_count(), Ordering::Relaxed);
        counters.completed.store(completed, Ordering::Relaxed);
        counters.stopped.store(stopped, Ordering::Relaxed);
        counters
            .global_speed
            .store(global_speed, Ordering::Relaxed);
        counters
            .total_downloaded
            .store(total_downloaded, Ordering::Relaxed);
    }

    fn should_exit(&self) -> bool {
        let halt = self.shared.halt.load(Ordering::Relaxed);
        if halt >= 2 {
            return true;
        }
        let commands_pending =
            !self.ready.is_empty() || !self.suspended.is_empty() || !self.timed.is_empty();
        let ops_pending = !self.shared.ops.lock().unwrap().is_empty();
        if halt == 1 {
            return self.groups.active_count() == 0 && !commands_pending && !ops_pending;
        }
        let work_remaining = self.groups.iter().any(|g| !g.status().is_finished());
        !work_remaining && !commands_pending && !ops_pending
    }

    fn poll_timeout(&self, now: Instant) -> i32 {
        if !self.ready.is_empty() {
            return 0;
        }
        let mut budget = Duration::from_millis(self.config.poll_timeout_ms.max(1));
        if let Some(entry) = self.timed.peek() {
            budget = budget.min(entry.deadline.saturating_duration_since(now));
        }
        for s in self.suspended.values() {
            budget = budget.min(s.deadline.saturating_duration_since(now));
        }
        for routine in &self.routines {
            if let CommandKind::Routine(r) = &routine.kind {
                budget = budget.min(r.next_run().saturating_duration_since(now));
            }
        }
        budget.as_millis().min(i32::MAX as u128) as i32
    }

    fn poll_and_wake(&mut self, timeout_ms: i32) {
        let mut events = Vec::new();
        if let Err(e) = self.poll.wait(timeout_ms, &mut events) {
            tracing::warn!(error = %e, "event poll failed");
            std::thread::sleep(Duration::from_millis(5));
            return;
        }
        for event in events {
            let command_id = event.token;
            if let Some(s) = self.suspended.remove(&command_id) {
                let _ = self.poll.remove(s.fd);
                self.fd_index.remove(&s.fd);
                let mut command = s.command;
                command.wake = WakeReason::Io(event.events);
                self.ready.push_back(command);
            }
        }
    }

    /// Wake suspended commands whose I/O deadline has passed; they convert
    /// the timeout into the retry policy.
    fn expire_deadlines(&mut self, now: Instant) {
        let expired: Vec<CommandId> = self
            .suspended
            .iter()
            .filter(|(_, s)| s.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for cid in expired {
            if let Some(s) = self.suspended.remove(&cid) {
                let _ = self.poll.remove(s.fd);
                self.fd_index.remove(&s.fd);
                let mut command = s.command;
                command.wake = WakeReason::Timeout;
                self.ready.push_back(command);
            }
        }
    }

    fn release_due_retries(&mut self, now: Instant) {
        while let Some(entry) = self.timed.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = self.timed.pop().unwrap();
            let mut command = entry.command;
            command.wake = WakeReason::Run;
            self.ready.push_back(command);
        }
    }
}
