//! Periodic background commands run by the scheduler between ticks.

use super::{StepContext, StepOutcome};
use crate::types::{Bytes, TaskId, TaskStatus};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// What a routine command does when its period elapses.
pub enum RoutineKind {
    /// Sweep idle pooled connections past their timeout.
    PoolCleanup,
    /// Broadcast progress and recompute speed for single-stream tasks
    /// (segmented tasks report through their monitor thread).
    ProgressTick {
        window: HashMap<TaskId, (Bytes, Instant)>,
    },
}

/// `Routine`: re-armed after every run instead of being dropped.
pub struct RoutineCommand {
    kind: RoutineKind,
    period: Duration,
    next_run: Instant,
}

impl RoutineCommand {
    pub fn new(kind: RoutineKind, period: Duration) -> Self {
        Self {
            kind,
            period,
            next_run: Instant::now() + period,
        }
    }

    pub fn due(&self, now: Instant) -> bool {
        now >= self.next_run
    }

    pub fn next_run(&self) -> Instant {
        self.next_run
    }

    pub fn step(&mut self, ctx: &mut StepContext<'_>) -> StepOutcome {
        self.next_run = ctx.now + self.period;
        match &mut self.kind {
            RoutineKind::PoolCleanup => {
                ctx.pool.cleanup_expired();
            }
            RoutineKind::ProgressTick { window } => {
                let active: Vec<TaskId> = ctx.groups.active_ids().to_vec();
                window.retain(|id, _| active.contains(id));
                for id in active {
                    let has_segments = ctx
                        .groups
                        .find(id)
                        .map(|g| g.segment_downloader().is_some())
                        .unwrap_or(false);
                    if has_segments {
                        continue;
                    }
                    let task = match ctx.task(id) {
                        Some(t) => t,
                        None => continue,
                    };
                    if task.status() != TaskStatus::Downloading {
                        continue;
                    }
                    let downloaded = task.downloaded_bytes();
                    let now = ctx.now;
                    let speed = match window.get(&id) {
                        Some((prev, at)) => {
                            let dt = now.duration_since(*at).as_secs_f64();
                            if dt > 0.0 {
                                (downloaded.saturating_sub(*prev) as f64 / dt) as u64
                            } else {
                                task.speed()
                            }
                        }
                        None => task.speed(),
                    };
                    window.insert(id, (downloaded, now));
                    task.update_progress(downloaded, task.total_bytes(), speed);
                }
            }
        }
        StepOutcome::Done
    }
}
