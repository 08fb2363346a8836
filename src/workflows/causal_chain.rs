//! Causal chain processor: a long-lived loop that turns ingest signals into
//! causal graph events.
//!
//! Signals are written to the durable inbox before the processor is woken
//! through a bounded channel, so a delivery survives a crash between send
//! and processing. Deliveries are handled one at a time in order; each runs
//! as its own journaled workflow (`causal-<delivery-id>`). A failing signal
//! is recorded and the loop moves on; only shutdown ends it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::core::activities::{AnalyzeCausality, CreateCausalEdge, Extract, FetchRecentEvents, UpsertCausalEvent};
use crate::core::inbox::{DeliveryStatus, InboxError, SignalInbox};
use crate::core::{ShutdownSignal, WorkflowContext, WorkflowError, WorkflowHost};
use crate::domain::article::validate_url;
use crate::domain::{CausalEdge, CausalEvent, CausalityContext, IngestSignal, WorkflowId, WorkflowKind};

/// Finished deliveries between inbox compactions
const COMPACT_AFTER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Waiting,
    Processing,
}

/// Result of processing one signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalOutcome {
    pub event_id: String,
    pub edges_created: usize,
    /// Links without a target event
    pub links_skipped: usize,
}

/// Counters reported when the processor stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub processed: usize,
    pub failed: usize,
    /// Left in the inbox by shutdown, picked up on next start
    pub interrupted: usize,
}

/// Producer handle. Cloneable; `send` waits while the channel is full.
#[derive(Clone)]
pub struct SignalSender {
    inbox: Arc<SignalInbox>,
    sender: mpsc::Sender<String>,
}

impl SignalSender {
    /// Durably record the signal, then wake the processor. Returns the
    /// delivery id.
    pub async fn send(&self, signal: IngestSignal) -> Result<String, InboxError> {
        let delivery_id = self.inbox.enqueue(&signal).await?;
        if self.sender.send(delivery_id.clone()).await.is_err() {
            warn!(%delivery_id, "Processor is gone; delivery stays in the inbox");
        }
        Ok(delivery_id)
    }
}

pub struct CausalChainProcessor {
    host: WorkflowHost,
    inbox: Arc<SignalInbox>,
    receiver: mpsc::Receiver<String>,
    state: ProcessorState,
    stats: ProcessorStats,
    finished_since_compact: usize,
}

/// Create a connected sender/processor pair over `inbox`
pub fn channel(
    host: WorkflowHost,
    inbox: SignalInbox,
    capacity: usize,
) -> (SignalSender, CausalChainProcessor) {
    let inbox = Arc::new(inbox);
    let (sender, receiver) = mpsc::channel(capacity.max(1));

    (
        SignalSender {
            inbox: Arc::clone(&inbox),
            sender,
        },
        CausalChainProcessor {
            host,
            inbox,
            receiver,
            state: ProcessorState::Waiting,
            stats: ProcessorStats::default(),
            finished_since_compact: 0,
        },
    )
}

impl CausalChainProcessor {
    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats
    }

    /// Process leftovers from the inbox, then wait for signals until shutdown
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> ProcessorStats {
        self.compact_inbox().await;

        match self.inbox.unfinished().await {
            Ok(leftovers) => {
                if !leftovers.is_empty() {
                    info!(count = leftovers.len(), "Recovering unfinished deliveries");
                }
                for delivery in leftovers {
                    if shutdown.is_triggered() {
                        return self.stats;
                    }
                    self.handle(&delivery.id).await;
                }
            }
            Err(e) => error!(error = %e, "Failed to read signal inbox"),
        }

        info!("Causal chain processor waiting for signals");
        loop {
            self.state = ProcessorState::Waiting;

            let next = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                next = self.receiver.recv() => next,
            };

            match next {
                Some(delivery_id) => {
                    self.handle(&delivery_id).await;
                    if self.finished_since_compact >= COMPACT_AFTER {
                        self.compact_inbox().await;
                    }
                }
                None => {
                    debug!("All signal senders dropped; idling until shutdown");
                    shutdown.wait().await;
                    break;
                }
            }
        }

        info!(
            processed = self.stats.processed,
            failed = self.stats.failed,
            interrupted = self.stats.interrupted,
            "Causal chain processor stopped"
        );
        self.stats
    }

    async fn compact_inbox(&mut self) {
        match self.inbox.compact().await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Compacted signal inbox"),
            Err(e) => warn!(error = %e, "Failed to compact signal inbox"),
        }
        self.finished_since_compact = 0;
    }

    /// Process one delivery if it is still outstanding
    pub async fn handle(&mut self, delivery_id: &str) {
        let delivery = match self.inbox.get(delivery_id).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                warn!(%delivery_id, "Unknown delivery");
                return;
            }
            Err(e) => {
                error!(%delivery_id, error = %e, "Failed to read delivery");
                return;
            }
        };

        if !matches!(delivery.status, DeliveryStatus::Pending | DeliveryStatus::Processing) {
            debug!(%delivery_id, status = ?delivery.status, "Delivery already handled");
            return;
        }

        self.state = ProcessorState::Processing;

        if let Err(e) = self.inbox.mark_processing(delivery_id).await {
            error!(%delivery_id, error = %e, "Failed to mark delivery as processing");
            self.state = ProcessorState::Waiting;
            return;
        }

        match process_signal(&self.host, delivery_id, &delivery.signal).await {
            Ok(outcome) => {
                self.stats.processed += 1;
                self.finished_since_compact += 1;
                if let Err(e) = self.inbox.mark_done(delivery_id).await {
                    error!(%delivery_id, error = %e, "Failed to mark delivery as done");
                }
                info!(
                    %delivery_id,
                    event_id = %outcome.event_id,
                    edges = outcome.edges_created,
                    "Signal processed"
                );
            }
            Err(WorkflowError::Cancelled) => {
                self.stats.interrupted += 1;
                info!(%delivery_id, "Signal interrupted by shutdown; will resume on next start");
            }
            Err(e) => {
                self.stats.failed += 1;
                self.finished_since_compact += 1;
                error!(%delivery_id, url = %delivery.signal.article_url, error = %e, "Signal processing failed");
                if let Err(mark_err) = self.inbox.mark_failed(delivery_id, &e.to_string()).await {
                    error!(%delivery_id, error = %mark_err, "Failed to mark delivery as failed");
                }
            }
        }

        self.state = ProcessorState::Waiting;
    }
}

/// Run (or resume) the causal workflow for one delivery
#[instrument(skip(host, signal), fields(url = %signal.article_url))]
pub async fn process_signal(
    host: &WorkflowHost,
    delivery_id: &str,
    signal: &IngestSignal,
) -> Result<CausalOutcome, WorkflowError> {
    validate_url(&signal.article_url).map_err(|e| WorkflowError::InvalidInput(e.to_string()))?;

    let id = WorkflowId::for_signal(delivery_id);
    let mut ctx = host
        .open_context(&id, WorkflowKind::CausalSignal, signal, host.settings().causal.clone())
        .await?;

    let result = run(&mut ctx, signal, host.settings().context_event_limit).await;
    ctx.finish(result).await
}

/// The per-signal body
pub async fn run(
    ctx: &mut WorkflowContext,
    signal: &IngestSignal,
    context_event_limit: usize,
) -> Result<CausalOutcome, WorkflowError> {
    let text = ctx.execute::<Extract>(&signal.article_url).await?;
    let context_events = ctx.execute::<FetchRecentEvents>(&context_event_limit).await?;
    let analysis = ctx
        .execute::<AnalyzeCausality>(&CausalityContext {
            text,
            context_events,
        })
        .await?;

    let (event_id, timestamp): (String, DateTime<Utc>) = ctx
        .side_effect("new_event", || (Uuid::new_v4().to_string(), Utc::now()))
        .await?;

    let processing = analysis.event_processing;
    let summary = if processing.neutral_headline.trim().is_empty() {
        processing.original_headline.clone()
    } else {
        processing.neutral_headline.clone()
    };
    let event = CausalEvent {
        event_id: event_id.clone(),
        timestamp,
        summary,
        trust_score: processing.bridging_score,
    };
    ctx.execute::<UpsertCausalEvent>(&event).await?;

    let mut outcome = CausalOutcome {
        event_id,
        edges_created: 0,
        links_skipped: 0,
    };

    for link in processing.causal_links {
        if link.target_event_id.trim().is_empty() {
            outcome.links_skipped += 1;
            continue;
        }
        let edge = CausalEdge {
            parent_id: link.target_event_id,
            child_id: outcome.event_id.clone(),
            relation_type: link.link_type,
        };
        ctx.execute::<CreateCausalEdge>(&edge).await?;
        outcome.edges_created += 1;
    }

    Ok(outcome)
}
