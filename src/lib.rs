//! truthweave - durable news analysis and causal graph worker
//!
//! Articles discovered from GDELT (or sent in as signals) are fetched,
//! embedded, deduplicated, analyzed by a language model and stored; a
//! second workflow turns articles into events of a causal graph.
//!
//! # Architecture
//!
//! Every workflow run is journaled:
//! - Each activity result is appended to a per-run event log before the
//!   workflow moves on
//! - Re-running a workflow id replays completed steps instead of repeating
//!   their side effects
//! - Interrupted or failed runs resume from the last completed step
//!
//! # Modules
//!
//! - `core`: Journal, activity registry, retries, host and signal inbox
//! - `workflows`: Pipeline, ingestion scheduler, causal chain, rebalancer
//! - `adapters`: Gemini, GDELT, page extraction and SQLite stores
//! - `domain`: Data structures (Event, Run, ArticleRecord, CausalEvent, FeedItem)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run discovery and the causal processor
//! truthweave worker
//!
//! # Analyze one article
//! truthweave process https://example.com/story
//!
//! # Resume an interrupted run
//! truthweave resume analyze-https://example.com/story
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod workflows;

// Re-export main types at crate root for convenience
pub use core::{ActivityRegistry, WorkflowContext, WorkflowError, WorkflowHost};
pub use domain::{Event, EventType, Run, RunState, WorkflowId};
