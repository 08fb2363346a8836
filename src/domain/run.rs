//! Run identity, state and reconstruction from events.
//!
//! A Run represents a single durable execution of one workflow. Its state is
//! never stored directly; it is folded from the run's journal.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventType, StepStatus};

/// Stable identity of a workflow run.
///
/// Identities are derived from the work they describe so that starting the
/// same work twice resolves to the same run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity of the per-article pipeline: `analyze-<url>`.
    pub fn for_article(url: &str) -> Self {
        Self(format!("analyze-{}", url))
    }

    /// Identity of the causal run for one inbox delivery.
    pub fn for_signal(delivery_id: &str) -> Self {
        Self(format!("causal-{}", delivery_id))
    }

    /// A fresh identity for one ingestion cycle.
    pub fn for_cycle() -> Self {
        Self(format!("ingest-{}", Uuid::new_v4()))
    }

    /// A fresh identity for one rebalance invocation.
    pub fn for_rebalance() -> Self {
        Self(format!("rebalance-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which workflow a run executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Pipeline,
    IngestionCycle,
    CausalSignal,
    Rebalance,
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pipeline => "pipeline",
            Self::IngestionCycle => "ingestion_cycle",
            Self::CausalSignal => "causal_signal",
            Self::Rebalance => "rebalance",
        };
        f.write_str(name)
    }
}

/// Payload of the `RunStarted` event: what the run was asked to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHeader {
    pub kind: WorkflowKind,
    pub input: serde_json::Value,
}

/// A durable workflow run, as reconstructed from its journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: WorkflowId,

    /// Workflow kind, from the run header
    pub kind: Option<WorkflowKind>,

    /// Input the run was started with
    pub input: serde_json::Value,

    pub state: RunState,

    pub started_at: DateTime<Utc>,

    /// When the run last reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,

    /// Number of steps completed so far
    pub completed_steps: usize,

    /// How many times the run was resumed
    pub resumptions: usize,

    /// Status of each step (step key -> status)
    pub step_statuses: HashMap<String, StepStatus>,

    /// Outcome recorded by `RunCompleted`
    pub outcome: Option<serde_json::Value>,
}

impl Run {
    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.first()?;

        let mut run = Self {
            id: WorkflowId::new(first_event.run_id.clone()),
            kind: None,
            input: serde_json::Value::Null,
            state: RunState::Running,
            started_at: first_event.timestamp,
            completed_at: None,
            completed_steps: 0,
            resumptions: 0,
            step_statuses: HashMap::new(),
            outcome: None,
        };

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
                if let Some(header) = event
                    .output
                    .as_ref()
                    .and_then(|v| serde_json::from_value::<RunHeader>(v.clone()).ok())
                {
                    self.kind = Some(header.kind);
                    self.input = header.input;
                }
            }
            EventType::RunResumed => {
                self.state = RunState::Running;
                self.completed_at = None;
                self.resumptions += 1;
            }
            EventType::RunCompleted => {
                self.state = RunState::Completed;
                self.completed_at = Some(event.timestamp);
                self.outcome = event.output.clone();
            }
            EventType::RunFailed => {
                self.state = RunState::Failed {
                    error: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunCancelled => {
                self.state = RunState::Cancelled;
                self.completed_at = Some(event.timestamp);
            }
            EventType::StepStarted | EventType::StepRetrying => {
                if let Some(ref step_id) = event.step_id {
                    self.step_statuses
                        .insert(step_id.clone(), StepStatus::Running);
                }
            }
            EventType::StepCompleted => {
                if let Some(ref step_id) = event.step_id {
                    self.step_statuses
                        .insert(step_id.clone(), StepStatus::Completed);
                    self.completed_steps += 1;
                }
            }
            EventType::StepFailed => {
                if let Some(ref step_id) = event.step_id {
                    self.step_statuses
                        .insert(step_id.clone(), StepStatus::Failed);
                }
            }
        }
    }

    /// Check if the run is still in progress (or was interrupted by a crash)
    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running)
    }

    /// Check if the run reached a terminal state
    pub fn is_finished(&self) -> bool {
        !self.is_running()
    }
}

/// State of a workflow run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Currently executing
    Running,

    /// Completed successfully
    Completed,

    /// Failed with error (can be resumed)
    Failed { error: String },

    /// Stopped by shutdown (can be resumed)
    Cancelled,
}

impl Default for RunState {
    fn default() -> Self {
        Self::Running
    }
}
