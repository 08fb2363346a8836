//! Workflow host: run identity, child starts and lifecycle.
//!
//! The host owns the journal root, the activity registry and the shutdown
//! trigger shared by all runs. Child pipelines are started by identity: an id
//! that is running or already completed is never started a second time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::domain::{ProcessingRequest, Run, RunState, WorkflowId, WorkflowKind};
use crate::workflows::pipeline::{self, PipelineOutcome};

use super::activities::ActivityRegistry;
use super::context::{WorkflowContext, WorkflowError};
use super::journal::Journal;
use super::retry::ActivityOptions;
use super::shutdown::{ShutdownSignal, ShutdownTrigger};

/// Tunables shared by every run of this host
#[derive(Debug, Clone)]
pub struct HostSettings {
    /// Similarity at or above which a candidate is a duplicate
    pub dedup_threshold: f64,
    /// Recent graph events handed to causal analysis
    pub context_event_limit: usize,
    pub pipeline: ActivityOptions,
    pub causal: ActivityOptions,
    pub rebalance: ActivityOptions,
    pub discovery: ActivityOptions,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            dedup_threshold: 0.90,
            context_event_limit: 20,
            pipeline: ActivityOptions::pipeline(),
            causal: ActivityOptions::causal(),
            rebalance: ActivityOptions::rebalance(),
            discovery: ActivityOptions::discovery(),
        }
    }
}

/// What happened when a child pipeline was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    /// Fresh run started
    Started,
    /// Earlier failed, cancelled or interrupted run picked up from its journal
    Resumed,
    AlreadyRunning,
    AlreadyCompleted,
}

type PipelineHandle = JoinHandle<Result<PipelineOutcome, WorkflowError>>;

struct HostInner {
    journal_root: PathBuf,
    registry: Arc<ActivityRegistry>,
    settings: HostSettings,
    running: Mutex<HashMap<WorkflowId, PipelineHandle>>,
    shutdown: ShutdownTrigger,
}

/// Cheaply cloneable handle to the workflow host
#[derive(Clone)]
pub struct WorkflowHost {
    inner: Arc<HostInner>,
}

impl WorkflowHost {
    pub fn new(journal_root: impl Into<PathBuf>, registry: ActivityRegistry, settings: HostSettings) -> Self {
        let (shutdown, _) = ShutdownTrigger::new();
        Self {
            inner: Arc::new(HostInner {
                journal_root: journal_root.into(),
                registry: Arc::new(registry),
                settings,
                running: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    pub fn journal_root(&self) -> &Path {
        &self.inner.journal_root
    }

    pub fn settings(&self) -> &HostSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &ActivityRegistry {
        &self.inner.registry
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.inner.shutdown.signal()
    }

    /// Ask every run to stop before its next activity attempt
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.inner.shutdown.trigger();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_triggered()
    }

    /// Open (or resume) the run `id` and hand back its context
    pub async fn open_context<I: Serialize>(
        &self,
        id: &WorkflowId,
        kind: WorkflowKind,
        input: &I,
        options: ActivityOptions,
    ) -> Result<WorkflowContext, WorkflowError> {
        let journal = Journal::open(&self.inner.journal_root, id).await?;
        WorkflowContext::begin(
            journal,
            kind,
            input,
            Arc::clone(&self.inner.registry),
            options,
            self.shutdown_signal(),
        )
        .await
    }

    /// Start the pipeline for `url` as a child task, unless that identity is
    /// already running or completed
    #[instrument(skip(self))]
    pub async fn start_pipeline(&self, url: &str) -> Result<StartOutcome, WorkflowError> {
        let request = ProcessingRequest::new(url);
        request
            .validate()
            .map_err(|e| WorkflowError::InvalidInput(e.to_string()))?;

        let id = WorkflowId::for_article(url);
        let mut running = self.inner.running.lock().await;

        if let Some(handle) = running.get(&id) {
            if !handle.is_finished() {
                debug!(%id, "Pipeline already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
        }

        let outcome = match Journal::find(&self.inner.journal_root, &id).await? {
            Some(run) if run.state == RunState::Completed => {
                debug!(%id, "Pipeline already completed");
                return Ok(StartOutcome::AlreadyCompleted);
            }
            Some(_) => StartOutcome::Resumed,
            None => StartOutcome::Started,
        };

        let host = self.clone();
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let result = pipeline::execute(&host, request).await;
            match &result {
                Ok(outcome) => info!(id = %task_id, ?outcome, "Child pipeline finished"),
                Err(WorkflowError::Cancelled) => info!(id = %task_id, "Child pipeline cancelled"),
                Err(e) => error!(id = %task_id, error = %e, "Child pipeline failed"),
            }
            result
        });
        running.insert(id, handle);

        Ok(outcome)
    }

    /// Drop bookkeeping for child runs that have finished
    pub async fn reap_finished(&self) -> usize {
        let mut running = self.inner.running.lock().await;
        let before = running.len();
        running.retain(|_, handle| !handle.is_finished());
        before - running.len()
    }

    /// Number of child runs still executing
    pub async fn active_children(&self) -> usize {
        let running = self.inner.running.lock().await;
        running.values().filter(|h| !h.is_finished()).count()
    }

    /// Await every tracked child run
    pub async fn wait_all(&self) -> Vec<(WorkflowId, Result<PipelineOutcome, WorkflowError>)> {
        let handles: Vec<_> = {
            let mut running = self.inner.running.lock().await;
            running.drain().collect()
        };

        let mut results = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(WorkflowError::Aborted(e.to_string())),
            };
            results.push((id, result));
        }
        results
    }

    /// Get status of a run by id
    pub async fn status(&self, id: &WorkflowId) -> Result<Option<Run>, WorkflowError> {
        Ok(Journal::find(&self.inner.journal_root, id).await?)
    }

    /// List recent runs, most recent first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<Run>, WorkflowError> {
        let mut runs = Journal::list_runs(&self.inner.journal_root).await?;
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_invalid_url_is_rejected_before_start() {
        let temp = TempDir::new().unwrap();
        let host = WorkflowHost::new(temp.path(), ActivityRegistry::new(), HostSettings::default());

        let err = host.start_pipeline("not a url").await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidInput(_)));
        assert!(host.list_runs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_reaches_new_signals() {
        let temp = TempDir::new().unwrap();
        let host = WorkflowHost::new(temp.path(), ActivityRegistry::new(), HostSettings::default());

        assert!(!host.shutdown_signal().is_triggered());
        host.shutdown();
        assert!(host.shutdown_signal().is_triggered());
        assert!(host.is_shutting_down());
    }

    #[test]
    fn test_default_settings() {
        let settings = HostSettings::default();
        assert_eq!(settings.dedup_threshold, 0.90);
        assert_eq!(settings.context_event_limit, 20);
        assert_eq!(settings.pipeline.retry.max_attempts, 5);
    }
}
