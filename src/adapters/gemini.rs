//! Gemini client for embeddings and structured analysis.
//!
//! Endpoint: POST {base_url}/models/{model}:generateContent
//! Endpoint: POST {base_url}/models/{embedding_model}:embedContent
//! Auth: `key` query parameter

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{status_error, transport_error, ReasoningService};
use crate::core::activities::ActivityError;
use crate::domain::{AiAnalysis, CausalAnalysis, CausalEvent, CausalityAnalysisResult, PotentialCause};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-1.5-pro";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-004";

const TEMPERATURE: f32 = 0.2;

const ANALYSIS_INSTRUCTIONS: &str = r#"Analyze the news text below.
Check its claims for internal consistency, rewrite it in neutral language,
locate the event (approximate latitude/longitude, 0,0 if unknown), name the
dominant emotion (Joy, Fear, Anger, Sadness, Surprise, Anticipation, Neutral),
extract the key people, organizations and places, and if the text argues a
position give a short counter-argument.

Reply with JSON only, using exactly these keys:
{
  "title": "short neutral headline",
  "neutral_text": "string",
  "truth_score": 0.0,
  "entities": [{"name": "string", "type": "Person|Org|Location", "score": 0.0}],
  "bias_rating": "Left|Right|Neutral",
  "summary": "string",
  "location": {"lat": 0.0, "lng": 0.0, "emo": "string", "intensity": 0.0},
  "global_emotion": "string",
  "causal_relations": [{"source_article_id": "", "target_article_id": "", "reason": "string", "confidence": 0.0, "type": "string"}],
  "counter_argument": "string"
}"#;

const CAUSAL_INSTRUCTIONS: &str = r##"You maintain a causal graph of world events.
Given a new article and a list of recent events from the graph, produce a
neutral headline, an emotional intensity score (0-100), a bridging score
(0-1, how much readers across viewpoints would agree on the facts), the key
facts, and links to the listed events that this article is a consequence of.
Only link when there is a clear causal mechanism and the earlier event
happened first. Use the listed event ids as target_event_id.

Reply with JSON only:
{
  "event_processing": {
    "original_headline": "string",
    "neutral_headline": "string",
    "emotional_score": 0,
    "bridging_score": 0.0,
    "key_facts": ["string"],
    "causal_links": [{"source_event_id": "", "target_event_id": "string", "reason": "string", "confidence": 0.0, "type": "CAUSED_BY"}]
  },
  "ui_directives": {"node_color_hex": "#RRGGBB", "swimlane_assignment": "string"}
}"##;

const REBALANCE_INSTRUCTIONS: &str = r#"Decide whether the current event is a direct
consequence of one of the candidate past events. Be strict about cause versus
correlation and require the cause to precede the effect. Pick at most one
parent.

Reply with JSON only:
{"is_consequence": false, "parent_event_id": "", "confidence": 0.0, "relationship_type": "DIRECT_RESPONSE|RETALIATION|ECONOMIC_FALLOUT", "reasoning": "string"}"#;

/// Gemini REST client
pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    embedding_model: String,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    response_mime_type: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: String,
    content: Content<'a>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Option<Embedding>,
}

#[derive(Debug, Deserialize)]
struct Embedding {
    values: Vec<f32>,
}

impl GeminiClient {
    pub fn new(api_key: String, base_url: String, model: String, embedding_model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            embedding_model,
        }
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        model: &str,
        method: &str,
        body: &B,
    ) -> Result<R, ActivityError> {
        let url = format!("{}/models/{}:{}", self.base_url, model, method);
        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(e, "gemini request failed"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &format!("gemini {}", method), &text));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| ActivityError::Malformed(format!("gemini {} response: {}", method, e)))
    }

    /// Send one prompt and return the concatenated reply text
    async fn generate(&self, instructions: &str, input: &str) -> Result<String, ActivityError> {
        let request = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![Part { text: instructions }, Part { text: input }],
            }],
            generation_config: GenerationConfig {
                temperature: TEMPERATURE,
                response_mime_type: "application/json",
            },
        };

        let response: GenerateResponse = self.post(&self.model, "generateContent", &request).await?;

        let text: String = response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(ActivityError::Malformed("gemini returned no candidates".to_string()));
        }
        debug!(chars = text.len(), "Gemini reply received");
        Ok(text)
    }
}

#[async_trait]
impl ReasoningService for GeminiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ActivityError> {
        let request = EmbedRequest {
            model: format!("models/{}", self.embedding_model),
            content: Content {
                role: "user",
                parts: vec![Part { text }],
            },
        };

        let response: EmbedResponse = self
            .post(&self.embedding_model, "embedContent", &request)
            .await?;

        match response.embedding {
            Some(embedding) if !embedding.values.is_empty() => Ok(embedding.values),
            _ => Err(ActivityError::Malformed("no embedding returned".to_string())),
        }
    }

    async fn analyze(&self, text: &str) -> Result<AiAnalysis, ActivityError> {
        let reply = self
            .generate(ANALYSIS_INSTRUCTIONS, &format!("Text to analyze:\n{}", text))
            .await?;
        parse_json_reply(&reply)
    }

    async fn analyze_causality(
        &self,
        text: &str,
        context: &[CausalEvent],
    ) -> Result<CausalAnalysis, ActivityError> {
        let input = format!(
            "Recent events:\n{}\n\nNew article:\n{}",
            format_context(context),
            text
        );
        let reply = self.generate(CAUSAL_INSTRUCTIONS, &input).await?;
        parse_json_reply(&reply)
    }

    async fn determine_causality(
        &self,
        target_summary: &str,
        candidates: &[PotentialCause],
    ) -> Result<CausalityAnalysisResult, ActivityError> {
        let mut input = String::from("Candidate past events:\n");
        for candidate in candidates {
            input.push_str(&format!(
                "- ID: {} | Title: {} | Summary: {}\n",
                candidate.id, candidate.title, candidate.summary
            ));
        }
        input.push_str(&format!("\nCurrent event:\n{}", target_summary));

        let reply = self.generate(REBALANCE_INSTRUCTIONS, &input).await?;
        parse_json_reply(&reply)
    }
}

/// One line per event: id, time, trust and summary
pub fn format_context(events: &[CausalEvent]) -> String {
    if events.is_empty() {
        return "(none)".to_string();
    }
    events
        .iter()
        .map(|e| {
            format!(
                "- ID: {} | At: {} | Trust: {:.2} | {}",
                e.event_id,
                e.timestamp.to_rfc3339(),
                e.trust_score,
                e.summary
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remove a surrounding markdown code fence, if any
pub fn strip_code_fences(reply: &str) -> &str {
    let trimmed = reply.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

/// Parse a model reply as JSON; unparseable replies are malformed
pub fn parse_json_reply<T: DeserializeOwned>(reply: &str) -> Result<T, ActivityError> {
    let body = strip_code_fences(reply);
    serde_json::from_str(body).map_err(|e| {
        let preview: String = body.chars().take(200).collect();
        ActivityError::Malformed(format!("{} (reply: {})", e, preview))
    })
}
