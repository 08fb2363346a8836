//! Causal knowledge graph on SQLite.
//!
//! Nodes are articles, named entities and events; edges are article
//! mentions and `caused_by` links between events (child -> parent).

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{GraphError, KnowledgeGraph};
use crate::domain::{ArticleRecord, CausalEdge, CausalEvent};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    name  TEXT NOT NULL UNIQUE,
    kind  TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS graph_articles (
    url           TEXT PRIMARY KEY,
    title         TEXT NOT NULL,
    truth_score   REAL NOT NULL,
    published_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS article_mentions (
    article_url  TEXT NOT NULL REFERENCES graph_articles(url) ON DELETE CASCADE,
    entity_id    INTEGER NOT NULL REFERENCES entities(id),
    PRIMARY KEY (article_url, entity_id)
);

CREATE TABLE IF NOT EXISTS events (
    event_id     TEXT PRIMARY KEY,
    timestamp    TEXT NOT NULL,
    summary      TEXT NOT NULL,
    trust_score  REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);

CREATE TABLE IF NOT EXISTS causal_edges (
    parent_id      TEXT NOT NULL REFERENCES events(event_id),
    child_id       TEXT NOT NULL REFERENCES events(event_id),
    relation_type  TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    PRIMARY KEY (parent_id, child_id)
);
"#;

pub struct SqliteKnowledgeGraph {
    conn: Arc<Mutex<Connection>>,
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, GraphError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| GraphError::Invalid(format!("bad timestamp '{}': {}", raw, e)))
}

impl SqliteKnowledgeGraph {
    pub fn open(path: &Path) -> Result<Self, GraphError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GraphError::Invalid(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, GraphError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, GraphError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T, GraphError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, GraphError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| GraphError::Invalid("graph connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| GraphError::Invalid(format!("graph task failed: {}", e)))?
    }

    /// Edges whose child is `child_id`
    pub async fn causes_of(&self, child_id: &str) -> Result<Vec<CausalEdge>, GraphError> {
        let child_id = child_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT parent_id, child_id, relation_type FROM causal_edges
                 WHERE child_id = ?1 ORDER BY created_at, parent_id",
            )?;
            let rows = stmt.query_map(params![child_id], |r| {
                Ok(CausalEdge {
                    parent_id: r.get(0)?,
                    child_id: r.get(1)?,
                    relation_type: r.get(2)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn edge_count(&self) -> Result<usize, GraphError> {
        self.call(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM causal_edges", [], |r| r.get(0))?;
            Ok(n as usize)
        })
        .await
    }

    /// Entity names mentioned by the article at `url`
    pub async fn mentions_of(&self, url: &str) -> Result<Vec<String>, GraphError> {
        let url = url.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT e.name FROM article_mentions m JOIN entities e ON e.id = m.entity_id
                 WHERE m.article_url = ?1 ORDER BY e.name",
            )?;
            let rows = stmt.query_map(params![url], |r| r.get::<_, String>(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn entity_count(&self) -> Result<usize, GraphError> {
        self.call(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM entities", [], |r| r.get(0))?;
            Ok(n as usize)
        })
        .await
    }
}

fn event_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, f64)> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
}

fn into_event((event_id, raw_ts, summary, trust_score): (String, String, String, f64)) -> Result<CausalEvent, GraphError> {
    Ok(CausalEvent {
        event_id,
        timestamp: parse_timestamp(&raw_ts)?,
        summary,
        trust_score,
    })
}

#[async_trait]
impl KnowledgeGraph for SqliteKnowledgeGraph {
    async fn save_article(&self, record: &ArticleRecord) -> Result<(), GraphError> {
        let record = record.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT INTO graph_articles (url, title, truth_score, published_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(url) DO UPDATE SET
                     title = excluded.title,
                     truth_score = excluded.truth_score,
                     published_at = excluded.published_at",
                params![
                    record.original_url,
                    record.title,
                    record.truth_score,
                    timestamp(&record.published_at),
                ],
            )?;
            tx.execute(
                "DELETE FROM article_mentions WHERE article_url = ?1",
                params![record.original_url],
            )?;

            for entity in record.mentions.iter().filter(|e| !e.name.trim().is_empty()) {
                let name = entity.name.trim();
                tx.execute(
                    "INSERT OR IGNORE INTO entities (name, kind) VALUES (?1, ?2)",
                    params![name, entity.kind],
                )?;
                let entity_id: i64 =
                    tx.query_row("SELECT id FROM entities WHERE name = ?1", params![name], |r| r.get(0))?;
                tx.execute(
                    "INSERT OR IGNORE INTO article_mentions (article_url, entity_id) VALUES (?1, ?2)",
                    params![record.original_url, entity_id],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn upsert_causal_event(&self, event: &CausalEvent) -> Result<(), GraphError> {
        if event.event_id.trim().is_empty() {
            return Err(GraphError::Invalid("event id is empty".to_string()));
        }
        let event = event.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO events (event_id, timestamp, summary, trust_score)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(event_id) DO UPDATE SET
                     timestamp = excluded.timestamp,
                     summary = excluded.summary,
                     trust_score = excluded.trust_score",
                params![
                    event.event_id,
                    timestamp(&event.timestamp),
                    event.summary,
                    event.trust_score,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn create_causal_edge(
        &self,
        parent_id: &str,
        child_id: &str,
        relation_type: &str,
    ) -> Result<(), GraphError> {
        if parent_id == child_id {
            return Err(GraphError::Invalid(format!("event '{}' cannot cause itself", parent_id)));
        }
        let (parent_id, child_id, relation_type) =
            (parent_id.to_string(), child_id.to_string(), relation_type.to_string());

        self.call(move |conn| {
            let tx = conn.transaction()?;

            let lookup = |id: &str| -> Result<DateTime<Utc>, GraphError> {
                let raw: Option<String> = tx
                    .query_row("SELECT timestamp FROM events WHERE event_id = ?1", params![id], |r| r.get(0))
                    .optional()?;
                match raw {
                    Some(raw) => parse_timestamp(&raw),
                    None => Err(GraphError::EventNotFound(id.to_string())),
                }
            };
            let parent_at = lookup(&parent_id)?;
            let child_at = lookup(&child_id)?;

            if child_at < parent_at {
                return Err(GraphError::TemporalOrder {
                    parent: parent_id,
                    child: child_id,
                });
            }

            tx.execute(
                "INSERT OR IGNORE INTO causal_edges (parent_id, child_id, relation_type, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![parent_id, child_id, relation_type, timestamp(&Utc::now())],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<CausalEvent>, GraphError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT event_id, timestamp, summary, trust_score FROM events
                 ORDER BY timestamp DESC, event_id LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], event_row)?;
            rows.map(|row| into_event(row?)).collect()
        })
        .await
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<CausalEvent>, GraphError> {
        let event_id = event_id.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT event_id, timestamp, summary, trust_score FROM events WHERE event_id = ?1",
                    params![event_id],
                    event_row,
                )
                .optional()?;
            row.map(into_event).transpose()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AiAnalysis, NamedEntity, RecordStamp};
    use chrono::Duration;

    fn event(id: &str, at: DateTime<Utc>) -> CausalEvent {
        CausalEvent {
            event_id: id.to_string(),
            timestamp: at,
            summary: format!("summary of {}", id),
            trust_score: 0.5,
        }
    }

    #[tokio::test]
    async fn test_edge_requires_both_events() {
        let graph = SqliteKnowledgeGraph::open_in_memory().unwrap();
        graph.upsert_causal_event(&event("E1", Utc::now())).await.unwrap();

        let err = graph.create_causal_edge("E1", "missing", "TRIGGERED").await.unwrap_err();
        assert!(matches!(err, GraphError::EventNotFound(ref id) if id == "missing"));
        assert_eq!(graph.edge_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_effect_cannot_precede_cause() {
        let graph = SqliteKnowledgeGraph::open_in_memory().unwrap();
        let now = Utc::now();
        graph.upsert_causal_event(&event("early", now - Duration::hours(2))).await.unwrap();
        graph.upsert_causal_event(&event("late", now)).await.unwrap();

        let err = graph.create_causal_edge("late", "early", "CAUSED_BY").await.unwrap_err();
        assert!(matches!(err, GraphError::TemporalOrder { .. }));

        graph.create_causal_edge("early", "late", "CAUSED_BY").await.unwrap();
        let edges = graph.causes_of("late").await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].parent_id, "early");
        assert_eq!(edges[0].relation_type, "CAUSED_BY");
    }

    #[tokio::test]
    async fn test_duplicate_edge_is_noop() {
        let graph = SqliteKnowledgeGraph::open_in_memory().unwrap();
        let now = Utc::now();
        graph.upsert_causal_event(&event("a", now - Duration::minutes(1))).await.unwrap();
        graph.upsert_causal_event(&event("b", now)).await.unwrap();

        graph.create_causal_edge("a", "b", "TRIGGERED").await.unwrap();
        graph.create_causal_edge("a", "b", "TRIGGERED").await.unwrap();
        assert_eq!(graph.edge_count().await.unwrap(), 1);

        assert!(matches!(
            graph.create_causal_edge("a", "a", "TRIGGERED").await,
            Err(GraphError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_recent_events_newest_first() {
        let graph = SqliteKnowledgeGraph::open_in_memory().unwrap();
        let now = Utc::now();
        for (i, id) in ["E1", "E2", "E3"].iter().enumerate() {
            graph
                .upsert_causal_event(&event(id, now - Duration::minutes(10 - i as i64)))
                .await
                .unwrap();
        }

        let recent = graph.recent_events(2).await.unwrap();
        let ids: Vec<_> = recent.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["E3", "E2"]);

        let fetched = graph.get_event("E1").await.unwrap().unwrap();
        assert_eq!(fetched.summary, "summary of E1");
        assert!(graph.get_event("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_article_resolves_entities_by_name() {
        let graph = SqliteKnowledgeGraph::open_in_memory().unwrap();

        let mut first = ArticleRecord::assemble(
            RecordStamp::fresh(),
            "https://news.example/1",
            String::new(),
            Vec::new(),
            AiAnalysis::default(),
        );
        first.mentions = vec![
            NamedEntity { name: "Bucharest".into(), kind: "Location".into(), score: 0.9 },
            NamedEntity { name: "Central Bank".into(), kind: "Org".into(), score: 0.8 },
        ];
        let mut second = first.clone();
        second.original_url = "https://news.example/2".into();
        second.mentions.truncate(1);

        graph.save_article(&first).await.unwrap();
        graph.save_article(&second).await.unwrap();
        graph.save_article(&first).await.unwrap();

        assert_eq!(graph.entity_count().await.unwrap(), 2);
        assert_eq!(
            graph.mentions_of("https://news.example/1").await.unwrap(),
            vec!["Bucharest", "Central Bank"]
        );
        assert_eq!(graph.mentions_of("https://news.example/2").await.unwrap(), vec!["Bucharest"]);
    }
}
