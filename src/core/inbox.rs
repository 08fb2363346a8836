//! Durable signal inbox for the causal chain processor.
//!
//! Append-only JSONL with state derived from replay. Each delivery is
//! enqueued once and then moves through processing to done or failed by
//! appending new entries. Line order is delivery order. Writers take an
//! exclusive lock on a sidecar `.lock` file so a CLI producer and a running
//! worker can share the inbox, and so [`SignalInbox::compact`] can swap the
//! file out from under them.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use crate::domain::IngestSignal;

/// Errors that can occur with the signal inbox
#[derive(Debug, Error)]
pub enum InboxError {
    #[error("Delivery not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: {from:?} → {to:?}")]
    InvalidTransition {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    #[error("Inbox writer task failed: {0}")]
    Task(String),
}

/// Lifecycle of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

/// An entry in the inbox log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxEvent {
    pub timestamp: DateTime<Utc>,

    pub delivery_id: String,

    pub event_type: InboxEventType,

    /// Signal for `Enqueued`, error for `Failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxEventType {
    Enqueued,
    ProcessingStarted,
    Completed,
    Failed,
}

/// A delivery with its current state (derived from replay)
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: String,
    pub signal: IngestSignal,
    pub status: DeliveryStatus,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Times processing was started (more than one after a crash)
    pub attempts: u32,
}

/// JSONL-backed signal inbox
#[derive(Debug, Clone)]
pub struct SignalInbox {
    path: PathBuf,
}

impl SignalInbox {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Run `f` on a blocking thread while holding the inbox write lock
    async fn with_lock<T, F>(&self, f: F) -> Result<T, InboxError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, InboxError> + Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path();

        tokio::task::spawn_blocking(move || -> Result<T, InboxError> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let lock = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&lock_path)?;
            lock.lock_exclusive()?;
            // Lock is released when `lock` is dropped
            f(path.as_path())
        })
        .await
        .map_err(|e| InboxError::Task(e.to_string()))?
    }

    /// Append an event under the write lock
    async fn append_event(&self, event: &InboxEvent) -> Result<(), InboxError> {
        let line = format!("{}\n", serde_json::to_string(event)?);

        self.with_lock(move |path| {
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(path)?;
            if let Some(dropped) = truncate_torn_tail(&mut file)? {
                tracing::warn!(dropped, "Dropped torn inbox tail before append");
            }
            file.write_all(line.as_bytes())?;
            file.flush()?;
            file.sync_data()?;
            Ok(())
        })
        .await
    }

    /// Rewrite the inbox keeping only the history of pending and processing
    /// deliveries. Unreadable lines are dropped too. Returns the number of
    /// finished deliveries removed.
    pub async fn compact(&self) -> Result<usize, InboxError> {
        self.with_lock(|path| {
            let contents = match std::fs::read_to_string(path) {
                Ok(contents) => contents,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
                Err(e) => return Err(e.into()),
            };

            let mut entries: Vec<(&str, InboxEvent)> = Vec::new();
            let mut items: HashMap<String, Delivery> = HashMap::new();
            for line in contents.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                if let Ok(event) = serde_json::from_str::<InboxEvent>(line) {
                    entries.push((line, event.clone()));
                    Self::apply_event(&mut items, event);
                }
            }

            let finished: HashSet<&str> = items
                .values()
                .filter(|d| matches!(d.status, DeliveryStatus::Done | DeliveryStatus::Failed))
                .map(|d| d.id.as_str())
                .collect();
            if finished.is_empty() && entries.len() == contents.lines().count() {
                return Ok(0);
            }

            let mut kept = String::new();
            for (line, event) in &entries {
                if items.contains_key(&event.delivery_id) && !finished.contains(event.delivery_id.as_str()) {
                    kept.push_str(line);
                    kept.push('\n');
                }
            }

            let mut tmp_name = path.as_os_str().to_owned();
            tmp_name.push(".compact");
            let tmp_path = PathBuf::from(tmp_name);
            {
                let mut tmp = std::fs::File::create(&tmp_path)?;
                tmp.write_all(kept.as_bytes())?;
                tmp.sync_all()?;
            }
            std::fs::rename(&tmp_path, path)?;

            Ok(finished.len())
        })
        .await
    }

    /// Replay all events; deliveries come back in delivery order
    pub async fn replay(&self) -> Result<Vec<Delivery>, InboxError> {
        let mut order: Vec<String> = Vec::new();
        let mut items: HashMap<String, Delivery> = HashMap::new();

        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path).await?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let event: InboxEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("Skipping unreadable inbox line: {}", e);
                    continue;
                }
            };
            if event.event_type == InboxEventType::Enqueued && !items.contains_key(&event.delivery_id) {
                order.push(event.delivery_id.clone());
            }
            Self::apply_event(&mut items, event);
        }

        Ok(order
            .into_iter()
            .filter_map(|id| items.remove(&id))
            .collect())
    }

    fn apply_event(items: &mut HashMap<String, Delivery>, event: InboxEvent) {
        match event.event_type {
            InboxEventType::Enqueued => {
                if let Some(signal) = event
                    .data
                    .and_then(|data| serde_json::from_value::<IngestSignal>(data).ok())
                {
                    items.insert(
                        event.delivery_id.clone(),
                        Delivery {
                            id: event.delivery_id,
                            signal,
                            status: DeliveryStatus::Pending,
                            enqueued_at: event.timestamp,
                            started_at: None,
                            completed_at: None,
                            error: None,
                            attempts: 0,
                        },
                    );
                }
            }
            InboxEventType::ProcessingStarted => {
                if let Some(item) = items.get_mut(&event.delivery_id) {
                    item.status = DeliveryStatus::Processing;
                    item.started_at = Some(event.timestamp);
                    item.attempts += 1;
                }
            }
            InboxEventType::Completed => {
                if let Some(item) = items.get_mut(&event.delivery_id) {
                    item.status = DeliveryStatus::Done;
                    item.completed_at = Some(event.timestamp);
                }
            }
            InboxEventType::Failed => {
                if let Some(item) = items.get_mut(&event.delivery_id) {
                    item.status = DeliveryStatus::Failed;
                    item.completed_at = Some(event.timestamp);
                    item.error = event
                        .data
                        .as_ref()
                        .and_then(|d| d.get("error"))
                        .and_then(|e| e.as_str())
                        .map(str::to_string);
                }
            }
        }
    }

    /// Record a new delivery. Every call is a distinct delivery, even for a
    /// signal seen before.
    pub async fn enqueue(&self, signal: &IngestSignal) -> Result<String, InboxError> {
        let delivery_id = Uuid::new_v4().to_string();
        let event = InboxEvent {
            timestamp: Utc::now(),
            delivery_id: delivery_id.clone(),
            event_type: InboxEventType::Enqueued,
            data: Some(serde_json::to_value(signal)?),
        };
        self.append_event(&event).await?;
        Ok(delivery_id)
    }

    /// Deliveries not yet done or failed, oldest first
    pub async fn unfinished(&self) -> Result<Vec<Delivery>, InboxError> {
        Ok(self
            .replay()
            .await?
            .into_iter()
            .filter(|d| matches!(d.status, DeliveryStatus::Pending | DeliveryStatus::Processing))
            .collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Delivery>, InboxError> {
        Ok(self.replay().await?.into_iter().find(|d| d.id == id))
    }

    /// Mark a delivery as processing. A delivery interrupted mid-processing
    /// may be marked again.
    pub async fn mark_processing(&self, id: &str) -> Result<(), InboxError> {
        let item = self
            .get(id)
            .await?
            .ok_or_else(|| InboxError::NotFound(id.to_string()))?;

        if !matches!(item.status, DeliveryStatus::Pending | DeliveryStatus::Processing) {
            return Err(InboxError::InvalidTransition {
                from: item.status,
                to: DeliveryStatus::Processing,
            });
        }

        self.append_event(&InboxEvent {
            timestamp: Utc::now(),
            delivery_id: id.to_string(),
            event_type: InboxEventType::ProcessingStarted,
            data: None,
        })
        .await
    }

    pub async fn mark_done(&self, id: &str) -> Result<(), InboxError> {
        self.append_event(&InboxEvent {
            timestamp: Utc::now(),
            delivery_id: id.to_string(),
            event_type: InboxEventType::Completed,
            data: None,
        })
        .await
    }

    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<(), InboxError> {
        self.append_event(&InboxEvent {
            timestamp: Utc::now(),
            delivery_id: id.to_string(),
            event_type: InboxEventType::Failed,
            data: Some(serde_json::json!({ "error": error })),
        })
        .await
    }

    /// Counts per status
    pub async fn status(&self) -> Result<InboxStatus, InboxError> {
        let mut status = InboxStatus::default();
        for item in self.replay().await? {
            match item.status {
                DeliveryStatus::Pending => status.pending += 1,
                DeliveryStatus::Processing => status.processing += 1,
                DeliveryStatus::Done => status.done += 1,
                DeliveryStatus::Failed => status.failed += 1,
            }
        }
        Ok(status)
    }
}

/// Cut a file that does not end in a newline back to its last complete line.
/// Returns the number of bytes dropped, if any.
fn truncate_torn_tail(file: &mut std::fs::File) -> std::io::Result<Option<u64>> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(None);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(None);
    }

    let mut contents = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut contents)?;
    let keep = contents
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos as u64 + 1);

    file.set_len(keep)?;
    Ok(Some(len - keep))
}

/// Inbox status summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboxStatus {
    pub pending: usize,
    pub processing: usize,
    pub done: usize,
    pub failed: usize,
}

impl InboxStatus {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.done + self.failed
    }
}
