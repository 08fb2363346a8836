//! Idempotency Integration Tests
//!
//! Step replay across executions of the same run: journaled outputs are
//! returned instead of re-running activities, and recorded side effects
//! keep their first value.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use uuid::Uuid;

use common::{fast_options, host};
use truthweave::core::activities::Embed;
use truthweave::core::{ActivityError, ActivityRegistry, WorkflowHost};
use truthweave::domain::{EventType, WorkflowId, WorkflowKind};

/// Embed handler that counts calls and returns the text length
fn counting_registry(calls: &Arc<AtomicUsize>) -> ActivityRegistry {
    let counter = Arc::clone(calls);
    let mut registry = ActivityRegistry::new();
    registry.register::<Embed, _, _>(move |text: String| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, ActivityError>(vec![text.len() as f32, 0.5]) }
    });
    registry
}

async fn open(host: &WorkflowHost, id: &WorkflowId) -> truthweave::core::WorkflowContext {
    host.open_context(id, WorkflowKind::Pipeline, &"input", fast_options(3))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_completed_step_is_not_executed_again() {
    let temp = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let id = WorkflowId::new("analyze-test");

    // First execution stops without finishing, as after a crash
    let first = host(&temp, counting_registry(&calls));
    let mut ctx = open(&first, &id).await;
    let original = ctx.execute::<Embed>(&"hello".to_string()).await.unwrap();
    drop(ctx);

    let second = host(&temp, counting_registry(&calls));
    let mut ctx = open(&second, &id).await;
    let replayed = ctx.execute::<Embed>(&"hello".to_string()).await.unwrap();
    ctx.finish(Ok(())).await.unwrap();

    assert_eq!(replayed, original);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let run = second.status(&id).await.unwrap().unwrap();
    assert_eq!(run.resumptions, 1);
    assert_eq!(run.completed_steps, 1);
}

#[tokio::test]
async fn test_changed_input_runs_the_step_again() {
    let temp = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let id = WorkflowId::new("analyze-test");
    let host = host(&temp, counting_registry(&calls));

    let mut ctx = open(&host, &id).await;
    ctx.execute::<Embed>(&"hello".to_string()).await.unwrap();
    drop(ctx);

    let mut ctx = open(&host, &id).await;
    let output = ctx.execute::<Embed>(&"goodbye".to_string()).await.unwrap();
    assert_eq!(output, vec![7.0, 0.5]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_repeated_activity_in_one_run_uses_distinct_steps() {
    let temp = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let id = WorkflowId::new("analyze-test");
    let host = host(&temp, counting_registry(&calls));

    let mut ctx = open(&host, &id).await;
    ctx.execute::<Embed>(&"same".to_string()).await.unwrap();
    ctx.execute::<Embed>(&"same".to_string()).await.unwrap();
    ctx.finish(Ok(())).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let run = host.status(&id).await.unwrap().unwrap();
    let mut steps: Vec<_> = run.step_statuses.keys().cloned().collect();
    steps.sort();
    assert_eq!(steps, vec!["001-embed", "002-embed"]);
}

#[tokio::test]
async fn test_side_effect_keeps_its_first_value() {
    let temp = TempDir::new().unwrap();
    let id = WorkflowId::new("causal-test");
    let host = host(&temp, ActivityRegistry::new());

    let mut ctx = open(&host, &id).await;
    let first: (String, DateTime<Utc>) = ctx
        .side_effect("new_event", || (Uuid::new_v4().to_string(), Utc::now()))
        .await
        .unwrap();
    drop(ctx);

    let mut ctx = open(&host, &id).await;
    let replayed: (String, DateTime<Utc>) = ctx
        .side_effect("new_event", || -> (String, DateTime<Utc>) {
            panic!("side effect produced twice")
        })
        .await
        .unwrap();

    assert_eq!(replayed, first);
}

#[tokio::test]
async fn test_failed_attempts_are_journaled_before_success() {
    let temp = TempDir::new().unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let mut registry = ActivityRegistry::new();
    registry.register::<Embed, _, _>(move |_text: String| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 0 {
                Err(ActivityError::Transient("rate limited".into()))
            } else {
                Ok(vec![1.0])
            }
        }
    });
    let host = host(&temp, registry);
    let id = WorkflowId::new("analyze-test");

    let mut ctx = open(&host, &id).await;
    ctx.execute::<Embed>(&"x".to_string()).await.unwrap();
    ctx.finish(Ok(())).await.unwrap();

    let journal = truthweave::core::Journal::open(&temp.path().join("runs"), &id).await.unwrap();
    let types: Vec<EventType> = journal
        .replay()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(types.first(), Some(&EventType::RunStarted));
    assert_eq!(types.last(), Some(&EventType::RunCompleted));
    assert!(types.contains(&EventType::StepRetrying));
    assert!(!types.contains(&EventType::StepFailed));
    assert_eq!(types.iter().filter(|t| **t == EventType::StepCompleted).count(), 1);
}
