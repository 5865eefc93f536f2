//! Background task lifecycle, generalized from the teacher's own
//! `task_mgr`: every long-running loop shares one `CancellationToken` and
//! is expected to observe it at least once per poll period, so shutdown is
//! cooperative rather than `abort`-based.

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TaskKind {
    ClockSweeper,
    IntentLogDrain,
}

/// Shared shutdown signal plus a join-handle registry, used the way the
/// teacher's task manager gives every spawned background loop a single
/// place to observe cancellation.
#[derive(Clone)]
pub struct TaskRegistry {
    cancel: CancellationToken,
}

impl TaskRegistry {
    pub fn new() -> TaskRegistry {
        TaskRegistry {
            cancel: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests every background task observing this registry's token to
    /// exit at the next poll boundary.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        TaskRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancellation_is_observed() {
        let registry = TaskRegistry::new();
        let token = registry.token();
        assert!(!token.is_cancelled());
        registry.shutdown();
        assert!(token.is_cancelled());
    }
}
