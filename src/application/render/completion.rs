//! Bridges an instance render to the single response write.
//!
//! Engines that report completion are waited on until they finish, bounded
//! only by a generous safety cap. Engines without a signal get one of two
//! fixed budgets: explicitly tagged requests are usually a single highlighted
//! listing and get the short one; untagged markdown that reached the slow path
//! carries code or math and gets the long one. The result is flagged as
//! possibly incomplete whenever completion was not observed.

use std::time::Duration;

use tokio::time::{Instant, sleep, timeout};

use super::types::RenderInstance;

pub const DEFAULT_EXPLICIT_MODE_WAIT: Duration = Duration::from_millis(8);
pub const DEFAULT_DEFAULT_MODE_WAIT: Duration = Duration::from_millis(60);
pub const DEFAULT_COMPLETION_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionHeuristic {
    explicit_mode_wait: Duration,
    default_mode_wait: Duration,
    completion_cap: Duration,
}

/// Outcome of waiting on an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub waited: Duration,
    /// Completion was not observed before the budget ran out.
    pub possibly_incomplete: bool,
}

impl Default for CompletionHeuristic {
    fn default() -> Self {
        Self::new(DEFAULT_EXPLICIT_MODE_WAIT, DEFAULT_DEFAULT_MODE_WAIT)
    }
}

impl CompletionHeuristic {
    pub const fn new(explicit_mode_wait: Duration, default_mode_wait: Duration) -> Self {
        Self {
            explicit_mode_wait,
            default_mode_wait,
            completion_cap: DEFAULT_COMPLETION_CAP,
        }
    }

    /// Longest wait on an engine that reports completion. Never shorter than
    /// the tier budgets.
    pub const fn with_completion_cap(mut self, cap: Duration) -> Self {
        self.completion_cap = cap;
        self
    }

    pub fn completion_cap(&self) -> Duration {
        self.completion_cap
    }

    pub fn budget(&self, explicit_mode: bool) -> Duration {
        if explicit_mode {
            self.explicit_mode_wait
        } else {
            self.default_mode_wait
        }
    }

    pub async fn settle(&self, instance: &dyn RenderInstance, explicit_mode: bool) -> Settlement {
        let budget = self.budget(explicit_mode);
        let started_at = Instant::now();

        let completed = match instance.completion() {
            Some(mut done) => {
                let cap = self.completion_cap.max(budget);
                let outcome = timeout(cap, done.wait_for(|finished| *finished)).await;
                matches!(outcome, Ok(Ok(_)))
            }
            None => {
                sleep(budget).await;
                false
            }
        };

        Settlement {
            waited: started_at.elapsed(),
            possibly_incomplete: !completed,
        }
    }
}
