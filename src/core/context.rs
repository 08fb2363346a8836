//! Per-run execution context.
//!
//! A [`WorkflowContext`] is what workflow code sees: it executes activities
//! through the registry with timeout, retry and cancellation, journals every
//! attempt, and short-circuits steps that already completed in an earlier
//! execution of the same run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::domain::{Event, EventType, RunHeader, StepStatus, WorkflowId, WorkflowKind};

use super::activities::{Activity, ActivityError, ActivityRegistry};
use super::journal::{generate_idempotency_key, Journal};
use super::retry::ActivityOptions;
use super::shutdown::ShutdownSignal;

/// Why a workflow run did not produce its result
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("activity '{activity}' failed after {attempts} attempt(s): {source}")]
    ActivityFailed {
        activity: &'static str,
        attempts: u32,
        source: ActivityError,
    },

    #[error("run cancelled by shutdown")]
    Cancelled,

    #[error("journal error: {0:#}")]
    Journal(#[from] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no handler registered for activity '{0}'")]
    UnknownActivity(&'static str),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("run task aborted: {0}")]
    Aborted(String),
}

impl WorkflowError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Execution context of one workflow run
pub struct WorkflowContext {
    run_id: WorkflowId,
    journal: Journal,
    registry: Arc<ActivityRegistry>,
    options: ActivityOptions,
    shutdown: ShutdownSignal,

    /// Position of the next step; step keys are `{sequence:03}-{name}`
    sequence: u32,

    /// Outputs of steps completed by earlier executions (idempotency key -> output)
    completed: HashMap<String, Value>,
}

impl WorkflowContext {
    /// Open a run: journal `RunStarted` for a fresh run, `RunResumed` otherwise
    pub async fn begin<I: Serialize>(
        journal: Journal,
        kind: WorkflowKind,
        input: &I,
        registry: Arc<ActivityRegistry>,
        options: ActivityOptions,
        shutdown: ShutdownSignal,
    ) -> Result<Self, WorkflowError> {
        let run_id = journal.run_id().clone();
        let events = journal.replay().await?;

        let completed: HashMap<String, Value> = events
            .iter()
            .filter(|e| e.event_type == EventType::StepCompleted)
            .map(|e| {
                (
                    e.idempotency_key.clone(),
                    e.output.clone().unwrap_or(Value::Null),
                )
            })
            .collect();

        let event = if events.is_empty() {
            info!(%run_id, %kind, "Starting run");
            let header = RunHeader {
                kind,
                input: serde_json::to_value(input)?,
            };
            Event::new(
                run_id.as_str(),
                None,
                EventType::RunStarted,
                format!("{}:start", run_id),
                format!("Run '{}' started", kind),
                StepStatus::Running,
            )
            .with_output(serde_json::to_value(header)?)
        } else {
            info!(%run_id, %kind, replayable = completed.len(), "Resuming run");
            Event::new(
                run_id.as_str(),
                None,
                EventType::RunResumed,
                format!("{}:resume", run_id),
                format!("Run '{}' resumed with {} completed step(s)", kind, completed.len()),
                StepStatus::Running,
            )
        };
        journal.append(&event).await?;

        Ok(Self {
            run_id,
            journal,
            registry,
            options,
            shutdown,
            sequence: 0,
            completed,
        })
    }

    pub fn run_id(&self) -> &WorkflowId {
        &self.run_id
    }

    pub fn options(&self) -> &ActivityOptions {
        &self.options
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_triggered()
    }

    fn next_step_key(&mut self, name: &str) -> String {
        self.sequence += 1;
        format!("{:03}-{}", self.sequence, name)
    }

    /// Execute activity `A`, or return its journaled output if this step
    /// already completed in an earlier execution of the run
    pub async fn execute<A: Activity>(&mut self, input: &A::Input) -> Result<A::Output, WorkflowError> {
        let step_key = self.next_step_key(A::NAME);
        let input_value = serde_json::to_value(input)?;
        let idem_key = generate_idempotency_key(&self.run_id, &step_key, &input_value.to_string());

        if let Some(output) = self.completed.get(&idem_key) {
            debug!(run_id = %self.run_id, step = %step_key, "Step already completed, replaying output");
            return Ok(serde_json::from_value(output.clone())?);
        }

        let handler = self
            .registry
            .handler(A::NAME)
            .ok_or(WorkflowError::UnknownActivity(A::NAME))?;

        let policy = self.options.retry.clone();
        let timeout = self.options.start_to_close;
        let mut attempt = 0u32;

        loop {
            if self.is_cancelled() {
                info!(run_id = %self.run_id, step = %step_key, "Shutdown requested, not starting step");
                return Err(WorkflowError::Cancelled);
            }

            attempt += 1;
            let step_start = Instant::now();

            let start_event = Event::new(
                self.run_id.as_str(),
                Some(step_key.clone()),
                EventType::StepStarted,
                idem_key.clone(),
                format!("Step '{}' attempt {}", step_key, attempt),
                StepStatus::Running,
            );
            self.journal.append(&start_event).await?;

            let result = match tokio::time::timeout(timeout, handler(input_value.clone())).await {
                Ok(result) => result,
                Err(_) => Err(ActivityError::Timeout(timeout)),
            };

            let duration_ms = step_start.elapsed().as_millis() as u64;

            match result {
                Ok(output) => {
                    let complete_event = Event::new(
                        self.run_id.as_str(),
                        Some(step_key.clone()),
                        EventType::StepCompleted,
                        idem_key.clone(),
                        format!("Step '{}' completed in {}ms", step_key, duration_ms),
                        StepStatus::Completed,
                    )
                    .with_duration(duration_ms)
                    .with_output(output.clone());
                    self.journal.append(&complete_event).await?;
                    self.completed.insert(idem_key, output.clone());

                    return Ok(serde_json::from_value(output)?);
                }
                Err(e) => {
                    if e.is_retryable() && policy.should_retry(attempt) {
                        let delay = policy.delay_for_attempt(attempt);

                        let retry_event = Event::new(
                            self.run_id.as_str(),
                            Some(step_key.clone()),
                            EventType::StepRetrying,
                            format!("{}:retry:{}", idem_key, attempt),
                            format!("Step '{}' failed, retrying in {:?}: {}", step_key, delay, e),
                            StepStatus::Running,
                        )
                        .with_error(e.to_string());
                        self.journal.append(&retry_event).await?;

                        warn!(
                            run_id = %self.run_id,
                            step = %step_key,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Step failed, retrying"
                        );

                        let interrupted = tokio::select! {
                            _ = tokio::time::sleep(delay) => false,
                            _ = self.shutdown.wait() => true,
                        };
                        if interrupted {
                            info!(run_id = %self.run_id, step = %step_key, "Shutdown during backoff");
                            return Err(WorkflowError::Cancelled);
                        }
                        continue;
                    }

                    let fail_event = Event::new(
                        self.run_id.as_str(),
                        Some(step_key.clone()),
                        EventType::StepFailed,
                        idem_key.clone(),
                        format!("Step '{}' failed after {} attempts: {}", step_key, attempt, e),
                        StepStatus::Failed,
                    )
                    .with_duration(duration_ms)
                    .with_error(e.to_string());
                    self.journal.append(&fail_event).await?;

                    error!(
                        run_id = %self.run_id,
                        step = %step_key,
                        attempt,
                        error = %e,
                        "Step failed permanently"
                    );

                    return Err(WorkflowError::ActivityFailed {
                        activity: A::NAME,
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    /// Record a non-deterministic value once; replays return the recorded value
    pub async fn side_effect<T, F>(&mut self, name: &str, produce: F) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        let step_key = self.next_step_key(name);
        let idem_key = generate_idempotency_key(&self.run_id, &step_key, "side_effect");

        if let Some(recorded) = self.completed.get(&idem_key) {
            return Ok(serde_json::from_value(recorded.clone())?);
        }

        let value = produce();
        let recorded = serde_json::to_value(&value)?;
        let event = Event::new(
            self.run_id.as_str(),
            Some(step_key.clone()),
            EventType::StepCompleted,
            idem_key.clone(),
            format!("Recorded side effect '{}'", step_key),
            StepStatus::Completed,
        )
        .with_output(recorded.clone());
        self.journal.append(&event).await?;
        self.completed.insert(idem_key, recorded);

        Ok(value)
    }

    /// Journal the terminal state of the run and hand the result back
    pub async fn finish<T: Serialize>(
        self,
        result: Result<T, WorkflowError>,
    ) -> Result<T, WorkflowError> {
        match result {
            Ok(outcome) => {
                info!(run_id = %self.run_id, "Run completed successfully");
                let event = Event::new(
                    self.run_id.as_str(),
                    None,
                    EventType::RunCompleted,
                    format!("{}:complete", self.run_id),
                    format!("Run '{}' completed", self.run_id),
                    StepStatus::Completed,
                )
                .with_output(serde_json::to_value(&outcome)?);
                self.journal.append(&event).await?;
                Ok(outcome)
            }
            Err(WorkflowError::Cancelled) => {
                warn!(run_id = %self.run_id, "Run cancelled");
                let event = Event::new(
                    self.run_id.as_str(),
                    None,
                    EventType::RunCancelled,
                    format!("{}:complete", self.run_id),
                    "Run cancelled by shutdown".to_string(),
                    StepStatus::Failed,
                );
                if let Err(e) = self.journal.append(&event).await {
                    error!(run_id = %self.run_id, "Failed to journal cancellation: {:#}", e);
                }
                Err(WorkflowError::Cancelled)
            }
            Err(err) => {
                let error_msg = err.to_string();
                error!(run_id = %self.run_id, %error_msg, "Run failed");
                let event = Event::new(
                    self.run_id.as_str(),
                    None,
                    EventType::RunFailed,
                    format!("{}:complete", self.run_id),
                    format!("Run failed: {}", error_msg),
                    StepStatus::Failed,
                )
                .with_error(error_msg);
                if let Err(e) = self.journal.append(&event).await {
                    error!(run_id = %self.run_id, "Failed to journal run failure: {:#}", e);
                }
                Err(err)
            }
        }
    }
}
