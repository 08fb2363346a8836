//! Articles and their AI analysis.

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Rejection reasons for a request or record that cannot be processed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("target URL is empty")]
    EmptyUrl,

    #[error("target URL is not a valid absolute http(s) URL: {0}")]
    InvalidUrl(String),
}

/// Checks that a URL is non-empty, absolute and http(s).
pub fn validate_url(url: &str) -> Result<(), IntegrityError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(IntegrityError::EmptyUrl);
    }
    match Url::parse(trimmed) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.has_host() => Ok(()),
        _ => Err(IntegrityError::InvalidUrl(url.to_string())),
    }
}

/// Request to run the per-article pipeline for one URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingRequest {
    pub target_url: String,
}

impl ProcessingRequest {
    pub fn new(target_url: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
        }
    }

    pub fn validate(&self) -> Result<(), IntegrityError> {
        validate_url(&self.target_url)
    }
}

/// Location and mood an article is pinned to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub emotion: String,
    #[serde(default)]
    pub intensity: f64,
}

/// An entity mentioned by an article, with a salience score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedEntity {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub score: f64,
}

/// A reference from an article to a causally related article or event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalEventLink {
    #[serde(default)]
    pub source_article_id: String,
    #[serde(default)]
    pub target_article_id: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(rename = "type", default)]
    pub link_type: String,
}

/// Optional archival identifiers. Produced elsewhere; carried as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchoring {
    pub archive_tx_id: Option<String>,
    pub ledger_signature: Option<String>,
}

/// Location as the reasoning service reports it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisLocation {
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lng: f64,
    #[serde(default)]
    pub emo: String,
    #[serde(default)]
    pub intensity: f64,
}

/// Structured analysis of one article by the reasoning service.
///
/// Field names follow the JSON contract of the reasoning service. Missing
/// fields default rather than fail; text that is not JSON at all is rejected
/// by the adapter as malformed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiAnalysis {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub neutral_text: String,
    /// Either `[0,1]` or `[0,100]`; normalized at assembly
    #[serde(default)]
    pub truth_score: f64,
    #[serde(default)]
    pub entities: Vec<NamedEntity>,
    #[serde(default)]
    pub bias_rating: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub location: AnalysisLocation,
    #[serde(default)]
    pub global_emotion: String,
    #[serde(default)]
    pub causal_relations: Vec<CausalEventLink>,
    #[serde(default)]
    pub counter_argument: String,
}

/// A processed, persisted article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub id: Uuid,
    pub original_url: String,
    pub title: String,
    /// Neutral rewrite of the article
    pub content: String,
    pub raw_content: String,
    pub summary: String,
    pub truth_score: f64,
    pub bias_rating: String,
    pub embedding: Vec<f32>,
    pub geolocation: GeoPoint,
    pub global_emotion: String,
    #[serde(default)]
    pub causes: Vec<CausalEventLink>,
    #[serde(default)]
    pub effects: Vec<CausalEventLink>,
    pub counter_argument: String,
    #[serde(default)]
    pub mentions: Vec<NamedEntity>,
    pub published_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    #[serde(default)]
    pub anchoring: Option<Anchoring>,
}

/// Identifiers and time of a newly assembled record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordStamp {
    pub id: Uuid,
    pub geolocation_id: Uuid,
    pub processed_at: DateTime<Utc>,
}

impl RecordStamp {
    pub fn fresh() -> Self {
        Self {
            id: Uuid::new_v4(),
            geolocation_id: Uuid::new_v4(),
            processed_at: Utc::now(),
        }
    }
}

impl ArticleRecord {
    /// Combine the pipeline's step outputs into a record.
    ///
    /// The stamp comes from a journaled side effect so the same record is
    /// produced again on replay.
    pub fn assemble(
        stamp: RecordStamp,
        url: &str,
        raw_content: String,
        embedding: Vec<f32>,
        analysis: AiAnalysis,
    ) -> Self {
        let title = if analysis.title.trim().is_empty() {
            format!("Analyzed: {}", url)
        } else {
            analysis.title.trim().to_string()
        };

        Self {
            id: stamp.id,
            original_url: url.to_string(),
            title,
            content: analysis.neutral_text,
            raw_content,
            summary: analysis.summary,
            truth_score: normalize_truth_score(analysis.truth_score),
            bias_rating: analysis.bias_rating,
            embedding,
            geolocation: GeoPoint {
                id: stamp.geolocation_id.to_string(),
                latitude: analysis.location.lat,
                longitude: analysis.location.lng,
                emotion: analysis.location.emo,
                intensity: analysis.location.intensity,
            },
            global_emotion: analysis.global_emotion,
            causes: analysis.causal_relations,
            effects: Vec::new(),
            counter_argument: analysis.counter_argument,
            mentions: analysis.entities,
            published_at: stamp.processed_at,
            processed_at: stamp.processed_at,
            anchoring: None,
        }
    }

    /// Rejects records whose URL is empty or unparseable.
    pub fn verify_integrity(&self) -> Result<(), IntegrityError> {
        validate_url(&self.original_url)
    }
}

/// Maps a reported truth score into `[0,1]`.
///
/// Scores above 1 are taken to be percentages.
pub fn normalize_truth_score(score: f64) -> f64 {
    if !score.is_finite() {
        return 0.0;
    }
    let scaled = if score > 1.0 { score / 100.0 } else { score };
    scaled.clamp(0.0, 1.0)
}

/// Closest existing article to a candidate vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimilarityCheckResult {
    pub existing_article: Option<ArticleRecord>,
    pub similarity_score: f64,
}

impl SimilarityCheckResult {
    /// True when the candidate must be dropped as a duplicate.
    pub fn is_duplicate(&self, threshold: f64) -> bool {
        self.existing_article.is_some() && self.similarity_score >= threshold
    }
}
