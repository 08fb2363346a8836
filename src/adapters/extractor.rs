//! Page fetcher that reduces HTML to readable article text.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{status_error, transport_error, ContentExtractor};
use crate::core::activities::ActivityError;

/// Wrap width handed to the HTML renderer
const RENDER_WIDTH: usize = 100;

/// Lines shorter than this are navigation, bylines and buttons
const MIN_LINE_CHARS: usize = 25;

/// Fetches pages over HTTP and renders them to text
pub struct HttpExtractor {
    client: reqwest::Client,
}

impl HttpExtractor {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ContentExtractor for HttpExtractor {
    async fn extract(&self, url: &str) -> Result<String, ActivityError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(e, "page fetch failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, url, &body));
        }

        let html = response
            .text()
            .await
            .map_err(|e| transport_error(e, "page body read failed"))?;

        let text = html_to_article_text(&html);
        debug!(%url, chars = text.len(), "Extracted article text");

        if text.is_empty() {
            return Err(ActivityError::NonRetryable(format!(
                "no readable content at {}",
                url
            )));
        }
        Ok(text)
    }
}

/// Render HTML to text and keep the paragraph-like lines
pub fn html_to_article_text(html: &str) -> String {
    let rendered = html2text::from_read(html.as_bytes(), RENDER_WIDTH).unwrap_or_default();

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in rendered.lines() {
        let line = line.trim();
        if line.is_empty() {
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
            continue;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }

    paragraphs
        .into_iter()
        .filter(|p| p.chars().count() >= MIN_LINE_CHARS && !is_link_only(p))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// html2text renders a bare link as `[text][n]`
fn is_link_only(paragraph: &str) -> bool {
    paragraph.starts_with('[') && paragraph.ends_with(']') && !paragraph.contains(". ")
}
