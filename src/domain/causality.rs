//! Causal graph vocabulary: events, links between them, and verdicts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A node in the causal graph. Upserted by `event_id`, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    pub trust_score: f64,
}

/// A link proposed by the reasoning service from a new article to an
/// existing event. Cause precedes effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalLink {
    #[serde(default)]
    pub source_event_id: String,
    #[serde(default)]
    pub target_event_id: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(rename = "type", default)]
    pub link_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventProcessing {
    #[serde(default)]
    pub original_headline: String,
    #[serde(default)]
    pub neutral_headline: String,
    /// 0-100
    #[serde(default)]
    pub emotional_score: f64,
    /// 0-1
    #[serde(default)]
    pub bridging_score: f64,
    #[serde(default)]
    pub key_facts: Vec<String>,
    #[serde(default)]
    pub causal_links: Vec<CausalLink>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UiDirectives {
    #[serde(default)]
    pub node_color_hex: String,
    #[serde(default)]
    pub swimlane_assignment: String,
}

/// Result of analyzing a new article against recent graph context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CausalAnalysis {
    #[serde(default)]
    pub event_processing: EventProcessing,
    #[serde(default)]
    pub ui_directives: UiDirectives,
}

/// Input of the causal analysis activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalityContext {
    pub text: String,
    pub context_events: Vec<CausalEvent>,
}

/// Request to create `child` caused_by `parent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalEdge {
    pub parent_id: String,
    pub child_id: String,
    pub relation_type: String,
}

/// Verdict of the retroactive causality check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CausalityAnalysisResult {
    #[serde(default)]
    pub is_consequence: bool,
    #[serde(default)]
    pub parent_event_id: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub relationship_type: String,
    #[serde(default)]
    pub reasoning: String,
}

impl CausalityAnalysisResult {
    /// A positive verdict must name one of the offered candidates as parent.
    pub fn check_parent(&self, candidates: &[PotentialCause]) -> Result<(), String> {
        if !self.is_consequence {
            return Ok(());
        }
        let parent = self.parent_event_id.trim();
        if parent.is_empty() {
            return Err("positive verdict without a parent event id".to_string());
        }
        if !candidates.iter().any(|c| c.id == parent) {
            return Err(format!("parent event '{}' is not among the candidates", parent));
        }
        Ok(())
    }
}

/// Graph change derived from a verdict about `child_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphMutation {
    pub child_id: String,
    pub result: CausalityAnalysisResult,
}

impl GraphMutation {
    /// The edge this mutation creates, if the verdict calls for one.
    pub fn edge(&self) -> Option<CausalEdge> {
        if !self.result.is_consequence || self.result.parent_event_id.trim().is_empty() {
            return None;
        }
        Some(CausalEdge {
            parent_id: self.result.parent_event_id.clone(),
            child_id: self.child_id.clone(),
            relation_type: self.result.relationship_type.clone(),
        })
    }
}

/// An existing event offered as a possible antecedent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PotentialCause {
    pub id: String,
    pub title: String,
    pub summary: String,
}

/// Input of the retroactive rebalancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceRequest {
    pub target_event_id: String,
    pub candidate_events: Vec<PotentialCause>,
}

/// A new article announced to the causal processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSignal {
    pub article_url: String,
    #[serde(default)]
    pub source: String,
}

impl IngestSignal {
    pub fn new(article_url: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            article_url: article_url.into(),
            source: source.into(),
        }
    }
}
