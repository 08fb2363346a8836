//! Causal Chain Processor Tests
//!
//! The long-lived signal loop over scripted activities: ordering, failure
//! isolation, inbox recovery and shutdown.

mod common;

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tempfile::TempDir;

use common::{host, script, CallLog};
use truthweave::core::activities::{
    AnalyzeCausality, CreateCausalEdge, Extract, FetchRecentEvents, UpsertCausalEvent,
};
use truthweave::core::inbox::{DeliveryStatus, SignalInbox};
use truthweave::core::{ActivityError, ActivityRegistry};
use truthweave::domain::{
    CausalAnalysis, CausalEdge, CausalEvent, CausalLink, EventProcessing, IngestSignal,
};
use truthweave::workflows::causal_chain::{self, ProcessorStats};

fn link(target: &str) -> CausalLink {
    CausalLink {
        source_event_id: String::new(),
        target_event_id: target.to_string(),
        reason: "follows".to_string(),
        confidence: 0.8,
        link_type: "CAUSES".to_string(),
    }
}

fn analysis_with(links: Vec<CausalLink>) -> CausalAnalysis {
    CausalAnalysis {
        event_processing: EventProcessing {
            original_headline: "Original".to_string(),
            neutral_headline: "Neutral".to_string(),
            bridging_score: 0.6,
            causal_links: links,
            ..EventProcessing::default()
        },
        ..CausalAnalysis::default()
    }
}

/// Scripts the causal activities. Extract echoes the URL so the analysis
/// can pick links per article through `links_for`.
fn register_causal<F>(registry: &mut ActivityRegistry, log: &CallLog, links_for: F)
where
    F: Fn(&str) -> Vec<CausalLink> + Send + Sync + 'static,
{
    script::<Extract, _>(registry, log, |url| Ok(url));
    script::<FetchRecentEvents, _>(registry, log, |_| {
        Ok(vec![CausalEvent {
            event_id: "E1".to_string(),
            timestamp: Utc::now() - ChronoDuration::hours(1),
            summary: "Earlier event".to_string(),
            trust_score: 0.5,
        }])
    });
    script::<AnalyzeCausality, _>(registry, log, move |input| Ok(analysis_with(links_for(&input.text))));
    script::<UpsertCausalEvent, _>(registry, log, |_| Ok(()));
    script::<CreateCausalEdge, _>(registry, log, |_| Ok(()));
}

/// Poll the inbox until `count` deliveries reached done or failed
async fn wait_for_finished(inbox: &SignalInbox, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = inbox.status().await.unwrap();
        if status.done + status.failed >= count {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out: {:?}", status);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_idle_processor_does_nothing() {
    let temp = TempDir::new().unwrap();
    let log = CallLog::default();
    let mut registry = ActivityRegistry::new();
    register_causal(&mut registry, &log, |_| Vec::new());
    let host = host(&temp, registry);

    let (_sender, processor) =
        causal_chain::channel(host.clone(), SignalInbox::new(temp.path().join("inbox.jsonl")), 4);
    let task = tokio::spawn(processor.run(host.shutdown_signal()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    host.shutdown();

    let stats = task.await.unwrap();
    assert_eq!(stats, ProcessorStats::default());
    assert!(log.is_empty());
}

#[tokio::test]
async fn test_signals_are_processed_in_order() {
    let temp = TempDir::new().unwrap();
    let inbox_path = temp.path().join("inbox.jsonl");
    let log = CallLog::default();
    let mut registry = ActivityRegistry::new();
    register_causal(&mut registry, &log, |_| vec![link("E1")]);
    let host = host(&temp, registry);

    let (sender, processor) = causal_chain::channel(host.clone(), SignalInbox::new(&inbox_path), 2);
    let task = tokio::spawn(processor.run(host.shutdown_signal()));

    let urls: Vec<String> = (1..=4).map(|n| format!("https://news.example/{}", n)).collect();
    for url in &urls {
        sender.send(IngestSignal::new(url.clone(), "test")).await.unwrap();
    }

    let inbox = SignalInbox::new(&inbox_path);
    wait_for_finished(&inbox, urls.len()).await;
    host.shutdown();
    let stats = task.await.unwrap();

    assert_eq!(stats.processed, 4);
    assert_eq!(stats.failed, 0);

    let extracted: Vec<String> = log
        .inputs("extract")
        .into_iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(extracted, urls);

    // Each signal runs the full body once
    assert_eq!(log.count("fetch_recent_events"), 4);
    assert_eq!(log.count("upsert_causal_event"), 4);
    assert_eq!(log.count("create_causal_edge"), 4);

    // New events take the neutral headline and point back at E1
    let event: CausalEvent = serde_json::from_value(log.inputs("upsert_causal_event")[0].clone()).unwrap();
    assert_eq!(event.summary, "Neutral");
    let edge: CausalEdge = serde_json::from_value(log.inputs("create_causal_edge")[0].clone()).unwrap();
    assert_eq!(edge.parent_id, "E1");
    assert_eq!(edge.child_id, event.event_id);
    assert_eq!(edge.relation_type, "CAUSES");
}

#[tokio::test]
async fn test_edge_failure_fails_only_that_signal() {
    let temp = TempDir::new().unwrap();
    let inbox_path = temp.path().join("inbox.jsonl");
    let log = CallLog::default();
    let mut registry = ActivityRegistry::new();
    register_causal(&mut registry, &log, |url| {
        if url.ends_with("/bad") {
            vec![link("MISSING"), link("E1")]
        } else {
            vec![link("E1")]
        }
    });
    script::<CreateCausalEdge, _>(&mut registry, &log, |edge| {
        if edge.parent_id == "MISSING" {
            Err(ActivityError::NonRetryable("event not found: MISSING".into()))
        } else {
            Ok(())
        }
    });
    let host = host(&temp, registry);

    let (sender, processor) = causal_chain::channel(host.clone(), SignalInbox::new(&inbox_path), 4);
    let task = tokio::spawn(processor.run(host.shutdown_signal()));

    let bad = sender
        .send(IngestSignal::new("https://news.example/bad", "test"))
        .await
        .unwrap();
    let good = sender
        .send(IngestSignal::new("https://news.example/good", "test"))
        .await
        .unwrap();

    let inbox = SignalInbox::new(&inbox_path);
    wait_for_finished(&inbox, 2).await;
    host.shutdown();
    let stats = task.await.unwrap();

    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 1);

    // The failing edge stops the remaining links of that signal
    let parents: Vec<String> = log
        .inputs("create_causal_edge")
        .into_iter()
        .map(|v| v["parent_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(parents, vec!["MISSING", "E1"]);

    let bad = inbox.get(&bad).await.unwrap().unwrap();
    assert_eq!(bad.status, DeliveryStatus::Failed);
    assert!(bad.error.unwrap().contains("MISSING"));
    assert_eq!(inbox.get(&good).await.unwrap().unwrap().status, DeliveryStatus::Done);
}

#[tokio::test]
async fn test_unfinished_deliveries_are_recovered_at_start() {
    let temp = TempDir::new().unwrap();
    let inbox_path = temp.path().join("inbox.jsonl");

    // Written by a producer while no processor was running
    let producer = SignalInbox::new(&inbox_path);
    let first = producer
        .enqueue(&IngestSignal::new("https://news.example/1", "cli"))
        .await
        .unwrap();
    let second = producer
        .enqueue(&IngestSignal::new("https://news.example/2", "cli"))
        .await
        .unwrap();
    // Interrupted mid-processing by a crash
    producer.mark_processing(&first).await.unwrap();

    let log = CallLog::default();
    let mut registry = ActivityRegistry::new();
    register_causal(&mut registry, &log, |_| Vec::new());
    let host = host(&temp, registry);

    let (_sender, processor) = causal_chain::channel(host.clone(), SignalInbox::new(&inbox_path), 4);
    let task = tokio::spawn(processor.run(host.shutdown_signal()));

    wait_for_finished(&producer, 2).await;
    host.shutdown();
    let stats = task.await.unwrap();

    assert_eq!(stats.processed, 2);
    assert_eq!(
        log.inputs("extract"),
        vec![
            serde_json::json!("https://news.example/1"),
            serde_json::json!("https://news.example/2")
        ]
    );

    let first = producer.get(&first).await.unwrap().unwrap();
    assert_eq!(first.status, DeliveryStatus::Done);
    assert_eq!(first.attempts, 2);
    assert_eq!(producer.get(&second).await.unwrap().unwrap().status, DeliveryStatus::Done);
    assert!(producer.unfinished().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_finished_deliveries_are_compacted_at_start() {
    let temp = TempDir::new().unwrap();
    let inbox_path = temp.path().join("inbox.jsonl");

    let producer = SignalInbox::new(&inbox_path);
    let handled = producer
        .enqueue(&IngestSignal::new("https://news.example/old", "cli"))
        .await
        .unwrap();
    producer.mark_processing(&handled).await.unwrap();
    producer.mark_done(&handled).await.unwrap();
    let waiting = producer
        .enqueue(&IngestSignal::new("https://news.example/new", "cli"))
        .await
        .unwrap();

    let log = CallLog::default();
    let mut registry = ActivityRegistry::new();
    register_causal(&mut registry, &log, |_| Vec::new());
    let host = host(&temp, registry);

    let (_sender, processor) = causal_chain::channel(host.clone(), SignalInbox::new(&inbox_path), 4);
    let task = tokio::spawn(processor.run(host.shutdown_signal()));

    // The old delivery already counts as done, so wait on the new one
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while producer.get(&waiting).await.unwrap().map(|d| d.status) != Some(DeliveryStatus::Done) {
        assert!(tokio::time::Instant::now() < deadline, "new delivery never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    host.shutdown();
    let stats = task.await.unwrap();

    assert_eq!(stats.processed, 1);
    assert_eq!(log.inputs("extract"), vec![serde_json::json!("https://news.example/new")]);
    assert!(producer.get(&handled).await.unwrap().is_none());
    assert_eq!(producer.get(&waiting).await.unwrap().unwrap().status, DeliveryStatus::Done);

    let raw = std::fs::read_to_string(&inbox_path).unwrap();
    assert!(!raw.contains(&handled));
}

#[tokio::test]
async fn test_links_without_target_are_skipped() {
    let temp = TempDir::new().unwrap();
    let log = CallLog::default();
    let mut registry = ActivityRegistry::new();
    register_causal(&mut registry, &log, |_| vec![link(""), link("E1"), link("  ")]);
    let host = host(&temp, registry);

    let outcome = causal_chain::process_signal(
        &host,
        "delivery-1",
        &IngestSignal::new("https://news.example/1", "test"),
    )
    .await
    .unwrap();

    assert_eq!(outcome.edges_created, 1);
    assert_eq!(outcome.links_skipped, 2);
    assert_eq!(log.count("create_causal_edge"), 1);
}

#[tokio::test]
async fn test_invalid_signal_url_is_rejected() {
    let temp = TempDir::new().unwrap();
    let log = CallLog::default();
    let mut registry = ActivityRegistry::new();
    register_causal(&mut registry, &log, |_| Vec::new());
    let host = host(&temp, registry);

    let err = causal_chain::process_signal(&host, "delivery-1", &IngestSignal::new("not a url", "test"))
        .await
        .unwrap_err();

    assert!(matches!(err, truthweave::core::WorkflowError::InvalidInput(_)));
    assert!(log.is_empty());
}
