//! Activity registry.
//!
//! Activities are the only side-effecting steps a workflow performs. Each one
//! is declared as a marker type implementing [`Activity`] (name plus typed
//! input/output) and registered with a handler at construction time. The
//! registry is handed to the [`WorkflowHost`](super::host::WorkflowHost); no
//! workflow reaches a collaborator any other way.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::adapters::{ArticleStore, ContentExtractor, KnowledgeGraph, NewsDiscovery, ReasoningService};
use crate::domain::{
    AiAnalysis, ArticleRecord, CausalAnalysis, CausalEdge, CausalEvent, CausalityAnalysisResult,
    CausalityContext, GraphMutation, RebalanceRequest, SimilarityCheckResult,
};

/// Failure of a single activity attempt
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum ActivityError {
    /// Network hiccup, rate limit, unavailable dependency
    #[error("transient failure: {0}")]
    Transient(String),

    /// The dependency answered with something unparseable
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Retrying cannot help
    #[error("non-retryable failure: {0}")]
    NonRetryable(String),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
}

impl ActivityError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NonRetryable(_))
    }
}

/// Declaration of an activity: registry name plus input and output types
pub trait Activity: Send + Sync + 'static {
    const NAME: &'static str;
    type Input: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;
}

pub type ActivityFuture = Pin<Box<dyn Future<Output = Result<Value, ActivityError>> + Send>>;

pub(crate) type Handler = Arc<dyn Fn(Value) -> ActivityFuture + Send + Sync>;

macro_rules! activity {
    ($(#[$meta:meta])* $ty:ident, $name:literal, $input:ty => $output:ty) => {
        $(#[$meta])*
        pub struct $ty;

        impl Activity for $ty {
            const NAME: &'static str = $name;
            type Input = $input;
            type Output = $output;
        }
    };
}

activity!(
    /// Fetch a URL and reduce it to text
    Extract, "extract", String => String
);
activity!(
    /// Text to semantic vector
    Embed, "embed", String => Vec<f32>
);
activity!(
    /// Nearest stored article to a vector
    CheckDuplicates, "check_duplicates", Vec<f32> => SimilarityCheckResult
);
activity!(Analyze, "analyze", String => AiAnalysis);
activity!(
    /// Upsert keyed by `original_url`; yields the id the article is stored under
    Persist, "persist", ArticleRecord => Uuid
);
activity!(
    /// Entity resolution plus article node upsert
    LinkGraph, "link_graph", ArticleRecord => ()
);
activity!(DiscoverCandidateUrls, "discover_candidate_urls", () => Vec<String>);
activity!(
    /// Limit to recent graph events
    FetchRecentEvents, "fetch_recent_events", usize => Vec<CausalEvent>
);
activity!(AnalyzeCausality, "analyze_causality", CausalityContext => CausalAnalysis);
activity!(UpsertCausalEvent, "upsert_causal_event", CausalEvent => ());
activity!(CreateCausalEdge, "create_causal_edge", CausalEdge => ());
activity!(DetermineCausality, "determine_causality", RebalanceRequest => CausalityAnalysisResult);
activity!(ApplyGraphMutation, "apply_graph_mutation", GraphMutation => ());

/// Name-keyed table of activity handlers
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    handlers: HashMap<&'static str, Handler>,
}

impl std::fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activities", &self.names())
            .finish()
    }
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for activity `A`
    pub fn register<A, F, Fut>(&mut self, handler: F) -> &mut Self
    where
        A: Activity,
        F: Fn(A::Input) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<A::Output, ActivityError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(move |value: Value| {
            let handler = Arc::clone(&handler);
            let fut: ActivityFuture = Box::pin(async move {
                let input: A::Input = serde_json::from_value(value).map_err(|e| {
                    ActivityError::NonRetryable(format!("invalid input for '{}': {}", A::NAME, e))
                })?;
                let output = (*handler)(input).await?;
                serde_json::to_value(output).map_err(|e| {
                    ActivityError::NonRetryable(format!("unserializable output of '{}': {}", A::NAME, e))
                })
            });
            fut
        });

        debug!(activity = A::NAME, "Registered activity");
        self.handlers.insert(A::NAME, erased);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn handler(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }

    /// Wire every activity to its collaborator
    pub fn from_collaborators(collaborators: Collaborators) -> Self {
        let Collaborators {
            extractor,
            reasoning,
            articles,
            graph,
            discovery,
        } = collaborators;

        let mut registry = Self::new();

        let c = Arc::clone(&extractor);
        registry.register::<Extract, _, _>(move |url: String| {
            let c = Arc::clone(&c);
            async move { c.extract(&url).await }
        });

        let c = Arc::clone(&reasoning);
        registry.register::<Embed, _, _>(move |text: String| {
            let c = Arc::clone(&c);
            async move { c.embed(&text).await }
        });

        let c = Arc::clone(&articles);
        registry.register::<CheckDuplicates, _, _>(move |vector: Vec<f32>| {
            let c = Arc::clone(&c);
            async move {
                let nearest = c.find_similar(&vector, 1).await?.into_iter().next();
                Ok::<_, ActivityError>(match nearest {
                    Some(hit) => SimilarityCheckResult {
                        similarity_score: hit.score,
                        existing_article: Some(hit.article),
                    },
                    None => SimilarityCheckResult::default(),
                })
            }
        });

        let c = Arc::clone(&reasoning);
        registry.register::<Analyze, _, _>(move |text: String| {
            let c = Arc::clone(&c);
            async move { c.analyze(&text).await }
        });

        let c = Arc::clone(&articles);
        registry.register::<Persist, _, _>(move |record: ArticleRecord| {
            let c = Arc::clone(&c);
            async move { Ok::<_, ActivityError>(c.upsert(&record).await?) }
        });

        let g = Arc::clone(&graph);
        registry.register::<LinkGraph, _, _>(move |record: ArticleRecord| {
            let g = Arc::clone(&g);
            async move { Ok::<_, ActivityError>(g.save_article(&record).await?) }
        });

        let d = Arc::clone(&discovery);
        registry.register::<DiscoverCandidateUrls, _, _>(move |_: ()| {
            let d = Arc::clone(&d);
            async move { d.discover().await }
        });

        let g = Arc::clone(&graph);
        registry.register::<FetchRecentEvents, _, _>(move |limit: usize| {
            let g = Arc::clone(&g);
            async move { Ok::<_, ActivityError>(g.recent_events(limit).await?) }
        });

        let c = Arc::clone(&reasoning);
        registry.register::<AnalyzeCausality, _, _>(move |input: CausalityContext| {
            let c = Arc::clone(&c);
            async move { c.analyze_causality(&input.text, &input.context_events).await }
        });

        let g = Arc::clone(&graph);
        registry.register::<UpsertCausalEvent, _, _>(move |event: CausalEvent| {
            let g = Arc::clone(&g);
            async move { Ok::<_, ActivityError>(g.upsert_causal_event(&event).await?) }
        });

        let g = Arc::clone(&graph);
        registry.register::<CreateCausalEdge, _, _>(move |edge: CausalEdge| {
            let g = Arc::clone(&g);
            async move {
                Ok::<_, ActivityError>(g
                    .create_causal_edge(&edge.parent_id, &edge.child_id, &edge.relation_type)
                    .await?)
            }
        });

        let (g, c) = (Arc::clone(&graph), Arc::clone(&reasoning));
        registry.register::<DetermineCausality, _, _>(move |request: RebalanceRequest| {
            let (g, c) = (Arc::clone(&g), Arc::clone(&c));
            async move {
                let target = g.get_event(&request.target_event_id).await?.ok_or_else(|| {
                    ActivityError::NonRetryable(format!(
                        "target event '{}' not found in graph",
                        request.target_event_id
                    ))
                })?;
                let verdict = c
                    .determine_causality(&target.summary, &request.candidate_events)
                    .await?;
                verdict
                    .check_parent(&request.candidate_events)
                    .map_err(ActivityError::Malformed)?;
                Ok::<_, ActivityError>(verdict)
            }
        });

        let g = Arc::clone(&graph);
        registry.register::<ApplyGraphMutation, _, _>(move |mutation: GraphMutation| {
            let g = Arc::clone(&g);
            async move {
                if let Some(edge) = mutation.edge() {
                    g.create_causal_edge(&edge.parent_id, &edge.child_id, &edge.relation_type)
                        .await?;
                }
                Ok::<_, ActivityError>(())
            }
        });

        registry
    }
}

/// Everything the standard activities talk to
#[derive(Clone)]
pub struct Collaborators {
    pub extractor: Arc<dyn ContentExtractor>,
    pub reasoning: Arc<dyn ReasoningService>,
    pub articles: Arc<dyn ArticleStore>,
    pub graph: Arc<dyn KnowledgeGraph>,
    pub discovery: Arc<dyn NewsDiscovery>,
}
