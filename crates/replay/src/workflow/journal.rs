//! Journal entries for persistence and replay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result envelope for workflow completion and for each step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    /// The operation returned a value
    Success {
        /// Result value (JSON)
        result: serde_json::Value,
    },

    /// The operation failed
    Error {
        /// Error message, re-raised verbatim on replay
        message: String,
    },
}

impl Outcome {
    /// Create a success outcome
    pub fn success(result: serde_json::Value) -> Self {
        Self::Success { result }
    }

    /// Create an error outcome
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Check if this is a success outcome
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Convert into a `Result`, keeping only the message on failure
    pub fn into_result(self) -> Result<serde_json::Value, String> {
        match self {
            Self::Success { result } => Ok(result),
            Self::Error { message } => Err(message),
        }
    }
}

impl From<Result<serde_json::Value, String>> for Outcome {
    fn from(result: Result<serde_json::Value, String>) -> Self {
        match result {
            Ok(result) => Self::Success { result },
            Err(message) => Self::Error { message },
        }
    }
}

/// How a function step is executed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FunctionType {
    /// Closure run inside the invocation; `handle` is the step label
    Inline,

    /// Registered activity handed off to the scheduler; `handle` is the activity type
    Activity,
}

impl std::fmt::Display for FunctionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inline => write!(f, "inline"),
            Self::Activity => write!(f, "activity"),
        }
    }
}

/// Discriminant of [`Step`], used for index lookups and completion checks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Function,
    Sleep,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Function => write!(f, "function"),
            Self::Sleep => write!(f, "sleep"),
        }
    }
}

/// A recorded step
///
/// Steps are inserted in progress and completed exactly once. A completed
/// step is never mutated again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// A function call (inline closure or activity)
    Function {
        /// How the function is executed
        function_type: FunctionType,

        /// Step label or activity type
        handle: String,

        /// Serialized arguments, compared on replay
        args: serde_json::Value,

        /// Whether the call is still awaiting its outcome
        in_progress: bool,

        /// Recorded outcome, present once completed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outcome: Option<Outcome>,

        /// When the call was recorded
        started_at: DateTime<Utc>,

        /// When the outcome was recorded
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completed_at: Option<DateTime<Utc>>,
    },

    /// A durable timer
    Sleep {
        /// Requested duration in milliseconds
        duration_ms: u64,

        /// Wall-clock time at which the sleep elapses
        deadline: DateTime<Utc>,

        /// Whether the sleep is still pending
        in_progress: bool,
    },
}

impl Step {
    /// Get the step type
    pub fn step_type(&self) -> StepType {
        match self {
            Self::Function { .. } => StepType::Function,
            Self::Sleep { .. } => StepType::Sleep,
        }
    }

    /// Check if the step still awaits completion
    pub fn is_in_progress(&self) -> bool {
        match self {
            Self::Function { in_progress, .. } | Self::Sleep { in_progress, .. } => *in_progress,
        }
    }

    /// Get the recorded outcome of a completed function step
    pub fn outcome(&self) -> Option<&Outcome> {
        match self {
            Self::Function { outcome, .. } => outcome.as_ref(),
            Self::Sleep { .. } => None,
        }
    }

    /// Short human-readable description used in replay errors
    pub fn describe(&self) -> String {
        match self {
            Self::Function {
                function_type,
                handle,
                ..
            } => format!("{function_type} '{handle}'"),
            Self::Sleep { duration_ms, .. } => format!("sleep {duration_ms}ms"),
        }
    }

    /// Mark the step completed
    ///
    /// Function steps keep `outcome`; sleeps ignore it.
    pub(crate) fn complete(&mut self, result: Outcome, now: DateTime<Utc>) {
        match self {
            Self::Function {
                in_progress,
                outcome,
                completed_at,
                ..
            } => {
                *in_progress = false;
                *outcome = Some(result);
                *completed_at = Some(now);
            }
            Self::Sleep { in_progress, .. } => {
                *in_progress = false;
            }
        }
    }
}

/// One durably recorded step of a workflow
///
/// `step_number` starts at 0 and increases by one per step without gaps; it is
/// the replay index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEntry {
    /// Owning workflow
    pub workflow_id: Uuid,

    /// Position in the journal
    pub step_number: u32,

    /// The recorded step
    pub step: Step,
}

impl JournalEntry {
    /// Check if the entry still awaits completion
    pub fn is_in_progress(&self) -> bool {
        self.step.is_in_progress()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_serialization() {
        let outcome = Outcome::success(json!(5));
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"type\":\"success\""));

        let parsed: Outcome = serde_json::from_str(&json).unwrap();
        assert_eq!(outcome, parsed);

        let error = Outcome::error("boom");
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"type": "error", "message": "boom"})
        );
    }

    #[test]
    fn test_outcome_into_result() {
        assert_eq!(Outcome::success(json!(1)).into_result(), Ok(json!(1)));
        assert_eq!(
            Outcome::error("failed").into_result(),
            Err("failed".to_string())
        );
        assert!(Outcome::from(Ok(json!(null))).is_success());
    }

    #[test]
    fn test_step_serialization_shape() {
        let step = Step::Sleep {
            duration_ms: 1000,
            deadline: Utc::now(),
            in_progress: true,
        };
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["type"], "sleep");
        assert_eq!(value["in_progress"], true);

        let step = Step::Function {
            function_type: FunctionType::Activity,
            handle: "transcribe".to_string(),
            args: json!({"id": 1}),
            in_progress: true,
            outcome: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["type"], "function");
        assert_eq!(value["function_type"], "activity");
        assert!(value.get("outcome").is_none());
    }

    #[test]
    fn test_complete_function_step() {
        let now = Utc::now();
        let mut step = Step::Function {
            function_type: FunctionType::Inline,
            handle: "x".to_string(),
            args: json!(null),
            in_progress: true,
            outcome: None,
            started_at: now,
            completed_at: None,
        };
        assert!(step.is_in_progress());

        step.complete(Outcome::success(json!(2)), now);

        assert!(!step.is_in_progress());
        assert_eq!(step.outcome(), Some(&Outcome::success(json!(2))));
    }

    #[test]
    fn test_describe() {
        let sleep = Step::Sleep {
            duration_ms: 250,
            deadline: Utc::now(),
            in_progress: false,
        };
        assert_eq!(sleep.describe(), "sleep 250ms");
        assert_eq!(sleep.step_type(), StepType::Sleep);
    }
}
