//! Collaborator interfaces for external systems.
//!
//! Activities never talk to the outside world directly; they go through
//! these traits. Real implementations live in the submodules, tests supply
//! their own.

pub mod extractor;
pub mod gdelt;
pub mod gemini;
pub mod sqlite_graph;
pub mod sqlite_store;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::core::activities::ActivityError;
use crate::domain::{
    Advertisement, AiAnalysis, ArticleRecord, CausalAnalysis, CausalEvent,
    CausalityAnalysisResult, PotentialCause,
};
use crate::domain::article::IntegrityError;

pub use extractor::HttpExtractor;
pub use gdelt::GdeltDiscovery;
pub use gemini::GeminiClient;
pub use sqlite_graph::SqliteKnowledgeGraph;
pub use sqlite_store::SqliteArticleStore;

/// Errors from the relational article/ad store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("stored data could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record rejected: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("store task failed: {0}")]
    Task(String),
}

/// Errors from the causal knowledge graph
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("event '{0}' does not exist in the graph")]
    EventNotFound(String),

    #[error("edge {parent} -> {child} would make an effect precede its cause")]
    TemporalOrder { parent: String, child: String },

    #[error("invalid graph data: {0}")]
    Invalid(String),
}

/// An article paired with its similarity to a query vector
#[derive(Debug, Clone)]
pub struct ScoredArticle {
    pub article: ArticleRecord,
    pub score: f64,
}

/// Fetches a page and reduces it to readable text
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, url: &str) -> Result<String, ActivityError>;
}

/// Embedding and language-model reasoning
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ActivityError>;

    async fn analyze(&self, text: &str) -> Result<AiAnalysis, ActivityError>;

    /// Analyze a new article against recent events of the graph
    async fn analyze_causality(
        &self,
        text: &str,
        context: &[CausalEvent],
    ) -> Result<CausalAnalysis, ActivityError>;

    /// Decide whether `target_summary` is a consequence of one of the candidates
    async fn determine_causality(
        &self,
        target_summary: &str,
        candidates: &[PotentialCause],
    ) -> Result<CausalityAnalysisResult, ActivityError>;
}

/// Relational store for processed articles
#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Insert or update by `original_url`; returns the id the row is stored under
    async fn upsert(&self, record: &ArticleRecord) -> Result<Uuid, StoreError>;

    /// Most similar articles first
    async fn find_similar(&self, vector: &[f32], limit: usize) -> Result<Vec<ScoredArticle>, StoreError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ArticleRecord>, StoreError>;

    async fn exists_by_url(&self, url: &str) -> Result<bool, StoreError>;

    /// Most recently processed first
    async fn latest(&self, limit: usize) -> Result<Vec<ArticleRecord>, StoreError>;
}

/// Store for advertisements shown in the feed
#[async_trait]
pub trait AdStore: Send + Sync {
    async fn create_ad(&self, ad: &Advertisement) -> Result<(), StoreError>;

    /// Active ads, highest priority first
    async fn active_ads(&self, limit: usize) -> Result<Vec<Advertisement>, StoreError>;

    /// Returns false when no ad has that id
    async fn set_ad_active(&self, id: Uuid, active: bool) -> Result<bool, StoreError>;

    /// Count one impression for each served ad
    async fn record_impressions(&self, ids: &[Uuid]) -> Result<(), StoreError>;
}

/// Causal knowledge graph
#[async_trait]
pub trait KnowledgeGraph: Send + Sync {
    /// Resolve mentioned entities by name and upsert the article node
    async fn save_article(&self, record: &ArticleRecord) -> Result<(), GraphError>;

    async fn upsert_causal_event(&self, event: &CausalEvent) -> Result<(), GraphError>;

    /// Make `child_id` caused_by `parent_id`. Creating an existing edge is a no-op.
    async fn create_causal_edge(
        &self,
        parent_id: &str,
        child_id: &str,
        relation_type: &str,
    ) -> Result<(), GraphError>;

    /// Most recent events first
    async fn recent_events(&self, limit: usize) -> Result<Vec<CausalEvent>, GraphError>;

    async fn get_event(&self, event_id: &str) -> Result<Option<CausalEvent>, GraphError>;
}

/// Source of candidate article URLs
#[async_trait]
pub trait NewsDiscovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<String>, ActivityError>;
}

/// Classify a non-success HTTP status. Throttling, timeouts and server errors
/// are worth retrying; other client errors are not.
pub(crate) fn status_error(status: reqwest::StatusCode, context: &str, body: &str) -> ActivityError {
    let message = format!("{} returned {}: {}", context, status, truncate(body, 200));
    if status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
    {
        ActivityError::Transient(message)
    } else {
        ActivityError::NonRetryable(message)
    }
}

/// Transport-level failures (connect, timeout, reset) are transient
pub(crate) fn transport_error(err: reqwest::Error, context: &str) -> ActivityError {
    ActivityError::Transient(format!("{}: {}", context, err))
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

impl From<StoreError> for ActivityError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Integrity(_) | StoreError::Serialization(_) => {
                ActivityError::NonRetryable(err.to_string())
            }
            StoreError::Database(_) | StoreError::Task(_) => ActivityError::Transient(err.to_string()),
        }
    }
}

impl From<GraphError> for ActivityError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Database(_) => ActivityError::Transient(err.to_string()),
            GraphError::EventNotFound(_) | GraphError::TemporalOrder { .. } | GraphError::Invalid(_) => {
                ActivityError::NonRetryable(err.to_string())
            }
        }
    }
}
