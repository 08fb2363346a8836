//! Shared fixtures: a call log, fast host settings and scripted activities.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tempfile::TempDir;

use truthweave::core::activities::{
    Activity, Analyze, CheckDuplicates, Embed, Extract, LinkGraph, Persist,
};
use truthweave::adapters::{
    ArticleStore, ContentExtractor, KnowledgeGraph, NewsDiscovery, ReasoningService,
    SqliteArticleStore, SqliteKnowledgeGraph,
};
use truthweave::core::{
    ActivityError, ActivityOptions, ActivityRegistry, Collaborators, HostSettings, RetryPolicy,
    WorkflowHost,
};
use truthweave::domain::{
    AiAnalysis, ArticleRecord, CausalAnalysis, CausalEvent, CausalityAnalysisResult,
    PotentialCause, SimilarityCheckResult,
};

/// Ordered record of activity invocations (name, input)
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<(String, Value)>>>);

impl CallLog {
    pub fn record(&self, name: &str, input: Value) {
        self.0.lock().unwrap().push((name.to_string(), input));
    }

    pub fn names(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|(n, _)| n == name).count()
    }

    pub fn inputs(&self, name: &str) -> Vec<Value> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().unwrap().is_empty()
    }
}

/// Register a synchronous, logged handler for activity `A`
pub fn script<A, F>(registry: &mut ActivityRegistry, log: &CallLog, f: F)
where
    A: Activity,
    A::Input: Serialize,
    F: Fn(A::Input) -> Result<A::Output, ActivityError> + Send + Sync + 'static,
{
    let log = log.clone();
    registry.register::<A, _, _>(move |input: A::Input| {
        log.record(A::NAME, serde_json::to_value(&input).unwrap_or(Value::Null));
        let result = f(input);
        async move { result }
    });
}

/// Options with a short timeout and retries without backoff
pub fn fast_options(attempts: u32) -> ActivityOptions {
    ActivityOptions {
        start_to_close: Duration::from_secs(5),
        retry: RetryPolicy::immediate(attempts),
    }
}

pub fn fast_settings() -> HostSettings {
    HostSettings {
        pipeline: fast_options(3),
        causal: fast_options(3),
        rebalance: fast_options(3),
        discovery: fast_options(3),
        ..HostSettings::default()
    }
}

pub fn host(temp: &TempDir, registry: ActivityRegistry) -> WorkflowHost {
    WorkflowHost::new(temp.path().join("runs"), registry, fast_settings())
}

/// Analysis reply shaped like a model response
pub fn sample_analysis(truth_score: f64) -> AiAnalysis {
    serde_json::from_value(serde_json::json!({
        "title": "Rates rise",
        "neutral_text": "The central bank raised rates.",
        "truth_score": truth_score,
        "entities": [{"name": "Central Bank", "type": "Org", "score": 0.9}],
        "bias_rating": "Neutral",
        "summary": "Rates up half a point.",
        "location": {"lat": 10.0, "lng": 20.0, "emo": "Fear", "intensity": 0.4},
        "global_emotion": "Fear",
        "causal_relations": [],
        "counter_argument": ""
    }))
    .unwrap()
}

/// Scripted per-article pipeline: fixed text and embedding per URL, a
/// similarity decided by `similarity`, and a logged persist/link.
pub struct PipelineScript {
    pub pages: HashMap<String, String>,
    pub embedding: Vec<f32>,
    pub similarity: Arc<dyn Fn(&[f32]) -> SimilarityCheckResult + Send + Sync>,
    pub analysis: AiAnalysis,
}

impl Default for PipelineScript {
    fn default() -> Self {
        Self {
            pages: HashMap::new(),
            embedding: vec![0.1, 0.2],
            similarity: Arc::new(|_| SimilarityCheckResult::default()),
            analysis: sample_analysis(0.8),
        }
    }
}

impl PipelineScript {
    pub fn register(self, registry: &mut ActivityRegistry, log: &CallLog) {
        let pages = self.pages;
        script::<Extract, _>(registry, log, move |url| {
            Ok(pages
                .get(&url)
                .cloned()
                .unwrap_or_else(|| "Raw Content".to_string()))
        });

        let embedding = self.embedding;
        script::<Embed, _>(registry, log, move |_| Ok(embedding.clone()));

        let similarity = self.similarity;
        script::<CheckDuplicates, _>(registry, log, move |vector| Ok(similarity(&vector)));

        let analysis = self.analysis;
        script::<Analyze, _>(registry, log, move |_| Ok(analysis.clone()));
        script::<Persist, _>(registry, log, |record: ArticleRecord| Ok(record.id));
        script::<LinkGraph, _>(registry, log, |_: ArticleRecord| Ok(()));
    }
}

// ---------------------------------------------------------------------------
// Collaborator fakes for tests that wire the real registry and SQLite stores
// ---------------------------------------------------------------------------

/// Serves fixed text per URL; unknown URLs are a 404
#[derive(Default)]
pub struct FakeExtractor {
    pub pages: HashMap<String, String>,
}

#[async_trait]
impl ContentExtractor for FakeExtractor {
    async fn extract(&self, url: &str) -> Result<String, ActivityError> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| ActivityError::NonRetryable(format!("{} returned 404", url)))
    }
}

/// Scripted model: embeddings by text, queued causal analyses, one verdict
pub struct FakeReasoning {
    pub embeddings: HashMap<String, Vec<f32>>,
    pub analysis: AiAnalysis,
    pub causal: Mutex<VecDeque<CausalAnalysis>>,
    pub verdict: CausalityAnalysisResult,
    /// Event ids offered as context, per analyze_causality call
    pub seen_context: Mutex<Vec<Vec<String>>>,
    /// Target summaries handed to determine_causality
    pub seen_targets: Mutex<Vec<String>>,
}

impl Default for FakeReasoning {
    fn default() -> Self {
        Self {
            embeddings: HashMap::new(),
            analysis: sample_analysis(0.7),
            causal: Mutex::new(VecDeque::new()),
            verdict: CausalityAnalysisResult::default(),
            seen_context: Mutex::new(Vec::new()),
            seen_targets: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ReasoningService for FakeReasoning {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ActivityError> {
        Ok(self
            .embeddings
            .get(text)
            .cloned()
            .unwrap_or_else(|| vec![1.0, 0.0, 0.0]))
    }

    async fn analyze(&self, _text: &str) -> Result<AiAnalysis, ActivityError> {
        Ok(self.analysis.clone())
    }

    async fn analyze_causality(
        &self,
        _text: &str,
        context: &[CausalEvent],
    ) -> Result<CausalAnalysis, ActivityError> {
        self.seen_context
            .lock()
            .unwrap()
            .push(context.iter().map(|e| e.event_id.clone()).collect());
        Ok(self.causal.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn determine_causality(
        &self,
        target_summary: &str,
        _candidates: &[PotentialCause],
    ) -> Result<CausalityAnalysisResult, ActivityError> {
        self.seen_targets.lock().unwrap().push(target_summary.to_string());
        Ok(self.verdict.clone())
    }
}

/// Discovery returning a fixed list, or failing
pub struct FakeDiscovery {
    pub result: Result<Vec<String>, ActivityError>,
}

#[async_trait]
impl NewsDiscovery for FakeDiscovery {
    async fn discover(&self) -> Result<Vec<String>, ActivityError> {
        self.result.clone()
    }
}

/// Real registry over fakes and in-memory SQLite
pub struct Wired {
    pub registry: ActivityRegistry,
    pub articles: Arc<SqliteArticleStore>,
    pub graph: Arc<SqliteKnowledgeGraph>,
    pub reasoning: Arc<FakeReasoning>,
}

pub fn wire(extractor: FakeExtractor, reasoning: FakeReasoning, discovery: FakeDiscovery) -> Wired {
    let articles = Arc::new(SqliteArticleStore::open_in_memory().unwrap());
    let graph = Arc::new(SqliteKnowledgeGraph::open_in_memory().unwrap());
    let reasoning = Arc::new(reasoning);

    let registry = ActivityRegistry::from_collaborators(Collaborators {
        extractor: Arc::new(extractor),
        reasoning: Arc::clone(&reasoning) as Arc<dyn ReasoningService>,
        articles: Arc::clone(&articles) as Arc<dyn ArticleStore>,
        graph: Arc::clone(&graph) as Arc<dyn KnowledgeGraph>,
        discovery: Arc::new(discovery),
    });

    Wired {
        registry,
        articles,
        graph,
        reasoning,
    }
}

pub fn no_discovery() -> FakeDiscovery {
    FakeDiscovery { result: Ok(Vec::new()) }
}
