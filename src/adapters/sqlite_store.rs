//! SQLite-backed article and advertisement store.
//!
//! Articles are kept as JSON documents keyed by id with a unique
//! `original_url`. Similarity search is a brute-force cosine scan over the
//! stored embeddings.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{AdStore, ArticleStore, ScoredArticle, StoreError};
use crate::domain::{AdKind, Advertisement, ArticleRecord};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS articles (
    id            TEXT PRIMARY KEY,
    original_url  TEXT NOT NULL UNIQUE,
    title         TEXT NOT NULL,
    record        TEXT NOT NULL,
    processed_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_articles_processed ON articles(processed_at);

CREATE TABLE IF NOT EXISTS ads (
    id           TEXT PRIMARY KEY,
    kind         TEXT NOT NULL,
    title        TEXT NOT NULL,
    body         TEXT NOT NULL DEFAULT '',
    media_url    TEXT NOT NULL DEFAULT '',
    target_url   TEXT NOT NULL,
    is_active    INTEGER NOT NULL DEFAULT 1,
    priority     INTEGER NOT NULL DEFAULT 0,
    impressions  INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL
);
"#;

pub struct SqliteArticleStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteArticleStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Task(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Task("connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        self.call(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM articles", [], |r| r.get(0))?;
            Ok(n as usize)
        })
        .await
    }

    pub async fn get_ad(&self, id: Uuid) -> Result<Option<Advertisement>, StoreError> {
        self.call(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM ads WHERE id = ?1", AD_COLUMNS),
                    params![id.to_string()],
                    ad_row,
                )
                .optional()?;
            row.map(AdRow::into_ad).transpose()
        })
        .await
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Cosine similarity clamped to `[0,1]`. Mismatched or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

fn decode_record(json: String) -> Result<ArticleRecord, StoreError> {
    Ok(serde_json::from_str(&json)?)
}

#[async_trait]
impl ArticleStore for SqliteArticleStore {
    async fn upsert(&self, record: &ArticleRecord) -> Result<Uuid, StoreError> {
        record.verify_integrity()?;
        let mut record = record.clone();

        self.call(move |conn| {
            let tx = conn.transaction()?;
            let existing: Option<(String, String)> = tx
                .query_row(
                    "SELECT id, record FROM articles WHERE original_url = ?1",
                    params![record.original_url],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            // An article keeps the ids it was first stored under
            if let Some((existing_id, existing_json)) = existing {
                record.id = Uuid::parse_str(&existing_id).map_err(|e| {
                    StoreError::Task(format!("stored id '{}' is invalid: {}", existing_id, e))
                })?;
                let stored = decode_record(existing_json)?;
                if !stored.geolocation.id.is_empty() {
                    record.geolocation.id = stored.geolocation.id;
                }
            }

            let json = serde_json::to_string(&record)?;
            tx.execute(
                "INSERT INTO articles (id, original_url, title, record, processed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(original_url) DO UPDATE SET
                     title = excluded.title,
                     record = excluded.record,
                     processed_at = excluded.processed_at",
                params![
                    record.id.to_string(),
                    record.original_url,
                    record.title,
                    json,
                    timestamp(&record.processed_at),
                ],
            )?;
            tx.commit()?;
            Ok(record.id)
        })
        .await
    }

    async fn find_similar(&self, vector: &[f32], limit: usize) -> Result<Vec<ScoredArticle>, StoreError> {
        let query = vector.to_vec();
        self.call(move |conn| {
            let mut stmt = conn.prepare("SELECT record FROM articles")?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;

            let mut scored = Vec::new();
            for row in rows {
                let article = decode_record(row?)?;
                let score = cosine_similarity(&query, &article.embedding);
                scored.push(ScoredArticle { article, score });
            }

            scored.sort_by(|a, b| b.score.total_cmp(&a.score));
            scored.truncate(limit);
            Ok(scored)
        })
        .await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ArticleRecord>, StoreError> {
        self.call(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT record FROM articles WHERE id = ?1",
                    params![id.to_string()],
                    |r| r.get(0),
                )
                .optional()?;
            json.map(decode_record).transpose()
        })
        .await
    }

    async fn exists_by_url(&self, url: &str) -> Result<bool, StoreError> {
        let url = url.to_string();
        self.call(move |conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM articles WHERE original_url = ?1)",
                params![url],
                |r| r.get(0),
            )?;
            Ok(exists)
        })
        .await
    }

    async fn latest(&self, limit: usize) -> Result<Vec<ArticleRecord>, StoreError> {
        self.call(move |conn| {
            let mut stmt =
                conn.prepare("SELECT record FROM articles ORDER BY processed_at DESC, rowid DESC LIMIT ?1")?;
            let rows = stmt.query_map(params![limit as i64], |r| r.get::<_, String>(0))?;
            rows.map(|row| decode_record(row?)).collect()
        })
        .await
    }
}

const AD_COLUMNS: &str =
    "id, kind, title, body, media_url, target_url, is_active, priority, impressions, created_at";

struct AdRow {
    id: String,
    kind: String,
    title: String,
    body: String,
    media_url: String,
    target_url: String,
    is_active: bool,
    priority: i64,
    impressions: i64,
    created_at: String,
}

fn ad_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<AdRow> {
    Ok(AdRow {
        id: r.get(0)?,
        kind: r.get(1)?,
        title: r.get(2)?,
        body: r.get(3)?,
        media_url: r.get(4)?,
        target_url: r.get(5)?,
        is_active: r.get(6)?,
        priority: r.get(7)?,
        impressions: r.get(8)?,
        created_at: r.get(9)?,
    })
}

impl AdRow {
    fn into_ad(self) -> Result<Advertisement, StoreError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::Task(format!("stored ad id '{}' is invalid: {}", self.id, e)))?;
        let kind: AdKind = self.kind.parse().map_err(StoreError::Task)?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| StoreError::Task(format!("stored ad timestamp is invalid: {}", e)))?
            .with_timezone(&Utc);

        Ok(Advertisement {
            id,
            kind,
            title: self.title,
            body: self.body,
            media_url: self.media_url,
            target_url: self.target_url,
            is_active: self.is_active,
            priority: self.priority,
            impressions: self.impressions,
            created_at,
        })
    }
}

#[async_trait]
impl AdStore for SqliteArticleStore {
    async fn create_ad(&self, ad: &Advertisement) -> Result<(), StoreError> {
        let ad = ad.clone();
        self.call(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO ads ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)",
                    AD_COLUMNS
                ),
                params![
                    ad.id.to_string(),
                    ad.kind.as_str(),
                    ad.title,
                    ad.body,
                    ad.media_url,
                    ad.target_url,
                    ad.is_active,
                    ad.priority,
                    timestamp(&ad.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn active_ads(&self, limit: usize) -> Result<Vec<Advertisement>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM ads WHERE is_active = 1 ORDER BY priority DESC, created_at ASC LIMIT ?1",
                AD_COLUMNS
            ))?;
            let rows = stmt.query_map(params![limit as i64], ad_row)?;
            rows.map(|row| row?.into_ad()).collect()
        })
        .await
    }

    async fn set_ad_active(&self, id: Uuid, active: bool) -> Result<bool, StoreError> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE ads SET is_active = ?1 WHERE id = ?2",
                params![active, id.to_string()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn record_impressions(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare("UPDATE ads SET impressions = impressions + 1 WHERE id = ?1")?;
                for id in &ids {
                    stmt.execute(params![id])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AiAnalysis, RecordStamp};
    use tempfile::TempDir;

    fn record(url: &str, embedding: Vec<f32>) -> ArticleRecord {
        ArticleRecord::assemble(
            RecordStamp::fresh(),
            url,
            "raw".to_string(),
            embedding,
            AiAnalysis::default(),
        )
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_by_url() {
        let store = SqliteArticleStore::open_in_memory().unwrap();

        let first = record("https://news.example/a", vec![1.0, 0.0]);
        let first_id = store.upsert(&first).await.unwrap();
        assert_eq!(first_id, first.id);

        let mut second = record("https://news.example/a", vec![0.0, 1.0]);
        second.title = "Updated".to_string();
        let second_id = store.upsert(&second).await.unwrap();

        assert_eq!(second_id, first_id);
        assert_eq!(store.count().await.unwrap(), 1);

        let stored = store.get_by_id(first_id).await.unwrap().unwrap();
        assert_eq!(stored.title, "Updated");
        assert_eq!(stored.id, first_id);
        assert_eq!(stored.geolocation.id, first.geolocation.id);
        assert_ne!(stored.geolocation.id, stored.id.to_string());
        assert!(store.exists_by_url("https://news.example/a").await.unwrap());
        assert!(!store.exists_by_url("https://news.example/b").await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_rejects_invalid_url() {
        let store = SqliteArticleStore::open_in_memory().unwrap();
        let bad = record("not a url", vec![1.0]);
        assert!(matches!(store.upsert(&bad).await, Err(StoreError::Integrity(_))));
    }

    #[tokio::test]
    async fn test_find_similar_orders_by_score() {
        let store = SqliteArticleStore::open_in_memory().unwrap();
        store.upsert(&record("https://news.example/x", vec![1.0, 0.0])).await.unwrap();
        store.upsert(&record("https://news.example/y", vec![0.6, 0.8])).await.unwrap();
        store.upsert(&record("https://news.example/z", vec![0.0, 1.0])).await.unwrap();

        let hits = store.find_similar(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].article.original_url, "https://news.example/x");
        assert_eq!(hits[1].article.original_url, "https://news.example/y");
        assert!((hits[1].score - 0.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_latest_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = SqliteArticleStore::open(&dir.path().join("db/articles.db")).unwrap();

        let mut older = record("https://news.example/old", vec![1.0]);
        older.processed_at = Utc::now() - chrono::Duration::minutes(5);
        store.upsert(&older).await.unwrap();
        store.upsert(&record("https://news.example/new", vec![1.0])).await.unwrap();

        let latest = store.latest(10).await.unwrap();
        assert_eq!(latest[0].original_url, "https://news.example/new");
        assert_eq!(latest[1].original_url, "https://news.example/old");
    }

    #[tokio::test]
    async fn test_ads_by_priority_and_toggle() {
        let store = SqliteArticleStore::open_in_memory().unwrap();

        let mut low = Advertisement::new(AdKind::Banner, "low", "https://ads.example/low");
        low.priority = 1;
        let mut high = Advertisement::new(AdKind::Native, "high", "https://ads.example/high");
        high.priority = 10;
        store.create_ad(&low).await.unwrap();
        store.create_ad(&high).await.unwrap();

        let active = store.active_ads(5).await.unwrap();
        assert_eq!(active.iter().map(|a| a.title.as_str()).collect::<Vec<_>>(), vec!["high", "low"]);

        assert!(store.set_ad_active(high.id, false).await.unwrap());
        assert!(!store.set_ad_active(Uuid::new_v4(), false).await.unwrap());
        let active = store.active_ads(5).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, low.id);

        store.record_impressions(&[low.id, low.id]).await.unwrap();
        let stored = store.get_ad(low.id).await.unwrap().unwrap();
        assert_eq!(stored.impressions, 2);
    }
}
