//! Append-only run journal with file-based persistence.
//!
//! Each workflow run owns one directory under the journal root, named by a
//! hash of its [`WorkflowId`], holding an `events.jsonl` write-ahead log.
//! Events are stored as newline-delimited JSON (JSONL) for simplicity and
//! easy debugging/inspection.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::warn;

use crate::domain::{Event, Run, WorkflowId};

const EVENTS_FILE: &str = "events.jsonl";

/// File-based journal for a single run using JSONL format
#[derive(Debug, Clone)]
pub struct Journal {
    run_id: WorkflowId,

    /// Directory containing the run
    run_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,
}

impl Journal {
    /// Create or open the journal for a run under `root`
    pub async fn open(root: &Path, run_id: &WorkflowId) -> Result<Self> {
        let run_dir = root.join(storage_key(run_id));

        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        let events_path = run_dir.join(EVENTS_FILE);

        Ok(Self {
            run_id: run_id.clone(),
            run_dir,
            events_path,
        })
    }

    pub fn run_id(&self) -> &WorkflowId {
        &self.run_id
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Get the run directory
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append an event to the log.
    ///
    /// A torn tail left by an earlier crash is cut back to the last complete
    /// line first, so the new event never lands on the end of a partial one.
    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open events file: {}",
                    self.events_path.display()
                )
            })?;

        if let Some(dropped) = truncate_torn_tail(&mut file).await? {
            warn!(run_id = %self.run_id, dropped, "Dropped torn journal tail before append");
        }

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;
        file.sync_data().await.context("Failed to sync events file")?;

        Ok(())
    }

    /// Replay all events in order.
    ///
    /// A torn final line (crash mid-append) is skipped; corruption anywhere
    /// else is an error.
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();
        let mut torn: Option<String> = None;

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if let Some(previous) = torn.take() {
                anyhow::bail!("Failed to parse event: {}", previous);
            }
            match serde_json::from_str::<Event>(&line) {
                Ok(event) => events.push(event),
                Err(_) => torn = Some(line),
            }
        }

        if let Some(line) = torn {
            warn!(run_id = %self.run_id, "Skipping torn journal line: {}", line);
        }

        Ok(events)
    }

    /// Reconstruct the run from its events
    pub async fn load_run(&self) -> Result<Option<Run>> {
        let events = self.replay().await?;
        Ok(Run::from_events(&events))
    }

    /// Load a run by id without creating its directory
    pub async fn find(root: &Path, run_id: &WorkflowId) -> Result<Option<Run>> {
        let events_path = root.join(storage_key(run_id)).join(EVENTS_FILE);
        if !events_path.exists() {
            return Ok(None);
        }
        let journal = Self {
            run_id: run_id.clone(),
            run_dir: root.join(storage_key(run_id)),
            events_path,
        };
        journal.load_run().await
    }

    /// List all runs under the journal root
    pub async fn list_runs(root: &Path) -> Result<Vec<Run>> {
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let events_path = entry.path().join(EVENTS_FILE);
            if !events_path.exists() {
                continue;
            }
            let journal = Self {
                run_id: WorkflowId::new(String::new()),
                run_dir: entry.path(),
                events_path,
            };
            match journal.load_run().await {
                Ok(Some(run)) => runs.push(run),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable journal {}: {:#}", entry.path().display(), e),
            }
        }

        Ok(runs)
    }
}

/// Cut a file that does not end in a newline back to its last complete line.
/// Returns the number of bytes dropped, if any.
async fn truncate_torn_tail(file: &mut File) -> Result<Option<u64>> {
    let len = file.metadata().await.context("Failed to stat events file")?.len();
    if len == 0 {
        return Ok(None);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1)).await?;
    file.read_exact(&mut last).await?;
    if last[0] == b'\n' {
        return Ok(None);
    }

    let mut contents = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0)).await?;
    file.read_to_end(&mut contents).await?;
    let keep = contents
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos as u64 + 1);

    file.set_len(keep).await.context("Failed to truncate torn journal tail")?;
    Ok(Some(len - keep))
}

/// Directory name for a run: first 16 hex chars of SHA256 of its id
pub fn storage_key(run_id: &WorkflowId) -> String {
    hash_input(run_id.as_str())
}

/// Generate an idempotency key for a step
pub fn generate_idempotency_key(run_id: &WorkflowId, step_key: &str, input: &str) -> String {
    let input_hash = hash_input(input);
    format!("{}:{}:{}", run_id, step_key, input_hash)
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}
