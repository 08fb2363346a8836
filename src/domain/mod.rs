//! Domain types for the truthweave orchestrator.
//!
//! This module contains the core data structures:
//! - Events: Immutable records of run state changes
//! - Run: Workflow identity and execution state
//! - Article: Processed news articles and their analysis
//! - Causality: Causal events, links and verdicts
//! - Feed: Ads and the interleaved feed

pub mod article;
pub mod causality;
pub mod events;
pub mod feed;
pub mod run;

// Re-export commonly used types
pub use article::{
    AiAnalysis, Anchoring, ArticleRecord, CausalEventLink, GeoPoint, NamedEntity,
    ProcessingRequest, RecordStamp, SimilarityCheckResult,
};
pub use causality::{
    CausalAnalysis, CausalEdge, CausalEvent, CausalLink, CausalityAnalysisResult,
    CausalityContext, EventProcessing, GraphMutation, IngestSignal, PotentialCause,
    RebalanceRequest,
};
pub use events::{Event, EventType, StepStatus};
pub use feed::{AdKind, Advertisement, FeedItem};
pub use run::{Run, RunHeader, RunState, WorkflowId, WorkflowKind};
