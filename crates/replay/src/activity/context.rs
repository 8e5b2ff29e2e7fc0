//! Activity execution context

use uuid::Uuid;

/// Context provided to activities during execution
///
/// Identifies the journal entry the activity will complete and the attempt
/// being made.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Unique execution attempt ID
    pub attempt_id: Uuid,

    /// Workflow that recorded the call
    pub workflow_id: Uuid,

    /// Generation of the invocation that recorded the call
    pub generation: u64,

    /// Journal position of the call
    pub step_number: u32,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,
}

impl ActivityContext {
    /// Create a new activity context
    pub fn new(
        workflow_id: Uuid,
        generation: u64,
        step_number: u32,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            attempt_id: Uuid::now_v7(),
            workflow_id,
            generation,
            step_number,
            attempt,
            max_attempts,
        }
    }

    /// Whether a failure now will be final
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Key stable across attempts, for deduplicating side effects downstream
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.workflow_id, self.step_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_attempt() {
        let id = Uuid::now_v7();
        assert!(!ActivityContext::new(id, 1, 0, 1, 3).is_last_attempt());
        assert!(ActivityContext::new(id, 1, 0, 3, 3).is_last_attempt());
    }

    #[test]
    fn test_idempotency_key_ignores_attempt() {
        let id = Uuid::now_v7();
        let first = ActivityContext::new(id, 1, 4, 1, 3);
        let second = ActivityContext::new(id, 1, 4, 2, 3);
        assert_ne!(first.attempt_id, second.attempt_id);
        assert_eq!(first.idempotency_key(), second.idempotency_key());
    }
}
