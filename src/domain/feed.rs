//! Advertisements and the interleaved article feed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::article::ArticleRecord;

/// One ad slot after this many articles.
pub const AD_INTERVAL: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdKind {
    Native,
    Banner,
}

impl AdKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Banner => "banner",
        }
    }
}

impl std::fmt::Display for AdKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for AdKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "banner" => Ok(Self::Banner),
            other => Err(format!("unknown ad kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advertisement {
    pub id: Uuid,
    pub kind: AdKind,
    pub title: String,
    pub body: String,
    pub media_url: String,
    pub target_url: String,
    pub is_active: bool,
    /// Higher serves first
    pub priority: i64,
    pub impressions: i64,
    pub created_at: DateTime<Utc>,
}

impl Advertisement {
    pub fn new(kind: AdKind, title: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            title: title.into(),
            body: String::new(),
            media_url: String::new(),
            target_url: target_url.into(),
            is_active: true,
            priority: 0,
            impressions: 0,
            created_at: Utc::now(),
        }
    }
}

/// One entry of the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum FeedItem {
    Article(ArticleRecord),
    Advertisement(Advertisement),
}

/// Interleaves ads into an article list: one ad after every `every`-th
/// article while ads remain. Leftover ads are dropped.
pub fn interleave(
    articles: Vec<ArticleRecord>,
    ads: Vec<Advertisement>,
    every: usize,
) -> Vec<FeedItem> {
    let every = every.max(1);
    let mut ads = ads.into_iter();
    let mut feed = Vec::with_capacity(articles.len() + articles.len() / every);

    for (index, article) in articles.into_iter().enumerate() {
        feed.push(FeedItem::Article(article));
        if (index + 1) % every == 0 {
            if let Some(ad) = ads.next() {
                feed.push(FeedItem::Advertisement(ad));
            }
        }
    }

    feed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::article::{AiAnalysis, ArticleRecord, RecordStamp};

    fn article(n: usize) -> ArticleRecord {
        ArticleRecord::assemble(
            RecordStamp::fresh(),
            &format!("https://news.example/{}", n),
            String::new(),
            Vec::new(),
            AiAnalysis::default(),
        )
    }

    fn ad(title: &str) -> Advertisement {
        Advertisement::new(AdKind::Native, title, "https://ads.example")
    }

    fn shape(feed: &[FeedItem]) -> String {
        feed.iter()
            .map(|item| match item {
                FeedItem::Article(_) => 'A',
                FeedItem::Advertisement(_) => 'D',
            })
            .collect()
    }

    #[test]
    fn test_ad_after_every_fifth_article() {
        let articles = (0..12).map(article).collect();
        let feed = interleave(articles, vec![ad("one"), ad("two"), ad("three")], AD_INTERVAL);
        assert_eq!(shape(&feed), "AAAAADAAAAADAA");
    }

    #[test]
    fn test_runs_out_of_ads() {
        let articles = (0..11).map(article).collect();
        let feed = interleave(articles, vec![ad("only")], AD_INTERVAL);
        assert_eq!(shape(&feed), "AAAAADAAAAAA");
    }

    #[test]
    fn test_no_articles_no_ads() {
        let feed = interleave(Vec::new(), vec![ad("unused")], AD_INTERVAL);
        assert!(feed.is_empty());
    }

    #[test]
    fn test_feed_item_is_tagged() {
        let json = serde_json::to_value(FeedItem::Advertisement(ad("x"))).unwrap();
        assert_eq!(json["type"], "advertisement");
        assert_eq!(json["data"]["title"], "x");
    }
}
