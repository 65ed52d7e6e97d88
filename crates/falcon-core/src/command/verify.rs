//! Post-download checksum verification.

use super::{StepContext, StepOutcome};
use crate::error::EngineError;
use crate::hash;
use crate::types::TaskId;
use std::path::PathBuf;

/// `HashVerify`: digest the completed file and compare against the expected
/// checksum. On mismatch the file is kept for inspection and the task fails
/// with both digests. Hashing runs inline on the scheduler thread; it is the
/// last step of a download, with no other I/O to starve for that task.
pub struct VerifyCommand {
    path: PathBuf,
    expected: String,
}

impl VerifyCommand {
    pub fn new(path: PathBuf, expected: String) -> Self {
        Self { path, expected }
    }

    pub fn step(&mut self, ctx: &mut StepContext<'_>, task_id: TaskId) -> StepOutcome {
        match hash::verify_detect(&self.path, &self.expected) {
            Ok(result) if result.valid => {
                tracing::info!(
                    task_id,
                    algorithm = result.algorithm.as_str(),
                    "checksum verified"
                );
                ctx.finish_completed(task_id, &self.path);
                StepOutcome::Done
            }
            Ok(result) => {
                let error = EngineError::Verification {
                    expected: result.expected,
                    calculated: result.calculated,
                };
                ctx.fail_group(task_id, &error);
                StepOutcome::Done
            }
            Err(e) => {
                ctx.fail_group(task_id, &e);
                StepOutcome::Done
            }
        }
    }
}
