//! Journal events for durable workflow runs.
//!
//! Every state change of a run is recorded as an immutable event in an
//! append-only log. Step outputs travel inside the events so a restarted run
//! can replay completed steps instead of executing them again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single event in a run's journal.
///
/// Events are the source of truth for run state. The current state of any run
/// can be reconstructed by replaying its events in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The workflow run this event belongs to
    pub run_id: String,

    /// Step key, `{sequence}-{activity}` (if applicable)
    pub step_id: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Idempotency key format: "{run_id}:{step}:{input_hash}"
    pub idempotency_key: String,

    /// Human-readable summary (NO secrets)
    pub payload_summary: String,

    /// Current status of the step/run
    pub status: StepStatus,

    /// Time taken in milliseconds (for completed steps)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,

    /// Structured payload: run header for `RunStarted`, step result for
    /// `StepCompleted`, run outcome for `RunCompleted`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: impl Into<String>,
        step_id: Option<String>,
        event_type: EventType,
        idempotency_key: String,
        payload_summary: String,
        status: StepStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id: run_id.into(),
            step_id,
            event_type,
            idempotency_key,
            payload_summary,
            status,
            duration_ms: None,
            error: None,
            output: None,
        }
    }

    /// Create an event with duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Create an event with error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    /// Attach a structured payload
    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }
}

/// Types of events that can occur during a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started
    RunStarted,

    /// A run was picked up again after a crash, failure or cancellation
    RunResumed,

    /// A run completed successfully
    RunCompleted,

    /// A run failed
    RunFailed,

    /// A run stopped because shutdown was requested
    RunCancelled,

    /// A step has started execution
    StepStarted,

    /// A step completed successfully
    StepCompleted,

    /// A step failed (may or may not retry)
    StepFailed,

    /// A step is being retried after failure
    StepRetrying,
}

/// Status of a step or run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started
    Pending,

    /// Currently executing
    Running,

    /// Completed successfully
    Completed,

    /// Failed (with error)
    Failed,

    /// Skipped (replayed from the journal)
    Skipped,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}
