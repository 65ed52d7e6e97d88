//! Backoff wait before re-initiating a failed connection.

use super::initiate::InitiateCommand;
use super::{CommandKind, StepContext, StepOutcome, WakeReason};
use crate::types::TaskId;
use std::time::Duration;

/// `HttpRetry`: sleeps out the backoff on the scheduler's timer, then
/// re-issues `HttpInitiate` against the group's current URI.
pub struct RetryCommand {
    delay: Duration,
    waited: bool,
}

impl RetryCommand {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            waited: false,
        }
    }

    pub fn step(
        &mut self,
        ctx: &mut StepContext<'_>,
        task_id: TaskId,
        _wake: WakeReason,
    ) -> StepOutcome {
        if ctx.interrupted(task_id) {
            return StepOutcome::Done;
        }
        if !self.waited {
            self.waited = true;
            return StepOutcome::Retry {
                deadline: ctx.now + self.delay,
            };
        }
        let url = match ctx.groups.find_mut(task_id) {
            Some(group) => {
                group.reset_redirects();
                group.current_uri().to_string()
            }
            None => return StepOutcome::Done,
        };
        tracing::debug!(task_id, url = %url, "retrying connection");
        ctx.schedule(task_id, CommandKind::HttpInitiate(InitiateCommand::new(url)));
        StepOutcome::Done
    }
}
