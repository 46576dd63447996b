//! Integration tests for the evidence cache
//!
//! Runs an `EvidenceCache` over the fake debugger, a real SQLite store in a
//! temporary directory and a scripted oracle.

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio_test::assert_ok;

use common::{
    big_failure_output, big_heap_output, evidence_config, evidence_store, ready_session, Received,
    StubOracle,
};
use dump_investigator::cache::{CommandExecutor, EvidenceCache, EvidenceType};
use dump_investigator::engine::prepare_evidence_text;
use dump_investigator::error::OracleError;
use dump_investigator::interpret::InterpreterRegistry;
use dump_investigator::oracle::{Oracle, OracleCall};
use dump_investigator::storage::EvidenceStorage;

const HEAP_SUMMARY: &str = "Heap is dominated by Contoso.Orders.Line instances, suggesting order lines are retained after processing completes and never released";

fn heap_oracle() -> Arc<StubOracle> {
    Arc::new(StubOracle::new(|_| {
        format!(
            r#"{{"summary": "{}", "findings": ["120 Contoso.Orders.Line types on the heap"]}}"#,
            HEAP_SUMMARY
        )
    }))
}

async fn cache_with(oracle: Arc<StubOracle>, dir: &TempDir) -> (EvidenceCache, Received) {
    let store: Arc<dyn EvidenceStorage> = Arc::new(evidence_store(dir).await);
    let (session, received) = ready_session().await;
    let config = evidence_config();
    let oracle: Arc<dyn Oracle> = oracle;
    let interpreters = InterpreterRegistry::with_builtins(oracle, config.chunk_size);
    (EvidenceCache::new(session, store, interpreters, config), received)
}

#[tokio::test]
async fn test_repeated_command_served_from_store() {
    let dir = TempDir::new().unwrap();
    let (cache, received) = cache_with(heap_oracle(), &dir).await;

    let first = cache.execute("lm").await;
    assert!(first.success);
    assert!(!first.cached);

    let second = cache.execute("lm").await;
    assert!(second.cached);
    assert_eq!(second.output, first.output);
    assert_eq!(second.evidence_id, first.evidence_id);
    assert_eq!(received.count("lm"), 1);
}

#[tokio::test]
async fn test_thread_sensitive_output_is_keyed_by_thread() {
    let dir = TempDir::new().unwrap();
    let (cache, received) = cache_with(heap_oracle(), &dir).await;

    cache.execute("~1s").await;
    let on_one = cache.execute("!clrstack").await;
    cache.execute("~2s").await;
    let on_two = cache.execute("!clrstack").await;

    assert!(!on_two.cached);
    assert_ne!(on_one.output, on_two.output);
    assert!(on_one.output.contains("Contoso.Worker.Run1"));
    assert!(on_two.output.contains("Contoso.Worker.Run2"));

    cache.execute("~1s").await;
    let again = cache.execute("!clrstack").await;
    assert!(again.cached);
    assert_eq!(again.output, on_one.output);
    assert_eq!(received.count("!clrstack"), 2);

    // A combined switch is answered under the thread it selects.
    let combined = cache.execute("~2s; !clrstack").await;
    assert!(combined.cached);
    assert_eq!(combined.output, on_two.output);
    assert_eq!(combined.command.thread_context.as_deref(), Some("2"));
    assert_eq!(received.count("!clrstack"), 2);
}

#[tokio::test]
async fn test_thread_switch_always_reaches_debugger() {
    let dir = TempDir::new().unwrap();
    let (cache, received) = cache_with(heap_oracle(), &dir).await;

    let first = cache.execute("~1s").await;
    assert!(first.success);
    assert!(first.output.contains("NtWaitForMultipleObjects"));
    let on_one = cache.execute("!clrstack").await;
    cache.execute("~2s").await;
    cache.execute("!clrstack").await;

    // Switching back is sent again, so the debugger really is on thread 1.
    let back = cache.execute("~1s").await;
    assert!(!back.cached);
    assert!(back.evidence_id.is_none());
    assert_eq!(received.count("~1s"), 2);
    assert_eq!(cache.thread_context().await.as_deref(), Some("1"));

    let again = cache.execute("!clrstack").await;
    assert!(again.cached);
    assert_eq!(again.output, on_one.output);
    assert_eq!(again.command.thread_context.as_deref(), Some("1"));

    // Only the two stacks were stored; switch frames never are.
    let stored = assert_ok!(cache.store().list().await);
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|e| e.command == "!clrstack"));
}

#[tokio::test]
async fn test_thread_insensitive_output_shared_across_threads() {
    let dir = TempDir::new().unwrap();
    let (cache, received) = cache_with(heap_oracle(), &dir).await;

    cache.execute("~1s").await;
    assert!(!cache.execute("lm").await.cached);
    cache.execute("~2s").await;
    assert!(cache.execute("lm").await.cached);
    assert_eq!(received.count("lm"), 1);
}

#[tokio::test]
async fn test_large_output_becomes_external_evidence() {
    let dir = TempDir::new().unwrap();
    let oracle = heap_oracle();
    let (cache, _) = cache_with(oracle.clone(), &dir).await;

    let evidence = cache.gather("!dumpheap -stat").await;
    assert_eq!(evidence.evidence_type, EvidenceType::External);
    assert!(!evidence.failed);
    assert!(evidence.output.chars().count() <= 120);
    assert!(HEAP_SUMMARY.starts_with(&evidence.output));
    assert!(!evidence.output.contains("00007ff8"));
    assert!(oracle.calls(OracleCall::AnalyzeChunk) > 1);
    assert_eq!(oracle.calls(OracleCall::Synthesize), 1);

    let id = evidence.evidence_id.clone().expect("stored");
    assert_eq!(assert_ok!(cache.retrieve(&id).await), big_heap_output());

    let text = prepare_evidence_text(&[&evidence], 8000, 250_000);
    assert!(text.contains("Command: !dumpheap -stat"));
    assert!(!text.contains("Contoso.Orders.Line17"));
}

#[tokio::test]
async fn test_stored_analysis_is_reused() {
    let dir = TempDir::new().unwrap();
    let oracle = heap_oracle();
    let (cache, received) = cache_with(oracle.clone(), &dir).await;

    let first = cache.gather("!dumpheap -stat").await;
    let calls = oracle.total_calls();

    let second = cache.gather("!dumpheap -stat").await;
    assert!(second.cached);
    assert_eq!(oracle.total_calls(), calls);
    assert_eq!(second.output, first.output);
    assert_eq!(second.summary.as_deref(), Some(HEAP_SUMMARY));
    assert_eq!(received.count("!dumpheap -stat"), 1);

    let entry = assert_ok!(cache.store().metadata(&second.evidence_id.unwrap()).await);
    assert!(entry.is_analyzed());
    assert_eq!(entry.findings, vec!["120 Contoso.Orders.Line types on the heap"]);
}

#[tokio::test]
async fn test_oracle_failure_still_bounds_large_output() {
    let dir = TempDir::new().unwrap();
    let oracle = Arc::new(StubOracle::fallible(|_| {
        Err(OracleError::Unavailable {
            message: "connection refused".to_string(),
        })
    }));
    let (cache, _) = cache_with(oracle, &dir).await;

    let evidence = cache.gather("!dumpheap -stat").await;
    assert_eq!(evidence.evidence_type, EvidenceType::External);
    assert!(!evidence.failed);
    assert!(evidence.output.chars().count() <= 120);
    assert!(!evidence.output.contains("Contoso.Orders.Line"));
    assert!(evidence.findings.is_empty());

    // A failed analysis is not attached to the stored entry.
    let id = evidence.evidence_id.unwrap();
    assert!(!assert_ok!(cache.store().metadata(&id).await).is_analyzed());
}

#[tokio::test]
async fn test_small_unspecialized_output_is_not_interpreted() {
    let dir = TempDir::new().unwrap();
    let oracle = heap_oracle();
    let (cache, _) = cache_with(oracle.clone(), &dir).await;

    let evidence = cache.gather("lm").await;
    assert_eq!(evidence.evidence_type, EvidenceType::Inline);
    assert!(evidence.output.contains("Contoso_Orders"));
    assert!(evidence.summary.is_none());
    assert_eq!(oracle.total_calls(), 0);
}

#[tokio::test]
async fn test_failed_command_yields_failed_evidence() {
    let dir = TempDir::new().unwrap();
    let (cache, _) = cache_with(heap_oracle(), &dir).await;

    let evidence = cache.gather("!bogus").await;
    assert!(evidence.failed);
    assert_eq!(evidence.error.as_deref(), Some("No export bogus found"));
    assert!(evidence.evidence_id.is_none());
    assert_eq!(assert_ok!(cache.store().list().await).len(), 0);
}

#[tokio::test]
async fn test_large_failed_output_stays_external() {
    let dir = TempDir::new().unwrap();
    let (cache, received) = cache_with(heap_oracle(), &dir).await;
    let config = evidence_config();

    let evidence = cache.gather("!bigfail").await;
    assert!(evidence.failed);
    assert_eq!(evidence.evidence_type, EvidenceType::External);
    assert!(evidence.output.starts_with("Failed to request MethodData"));
    assert!(!evidence.output.contains("LeakedRow"));
    assert!(evidence.output.len() < config.max_summary_chars + 200);

    let text = prepare_evidence_text(&[&evidence], 100_000, 1_000_000);
    assert!(text.contains("!bigfail (FAILED)"));
    assert!(!text.contains("LeakedRow"));

    let id = evidence.evidence_id.clone().expect("failed output stored");
    assert_eq!(assert_ok!(cache.retrieve(&id).await), big_failure_output());

    // The stored failure is never served as a cached success.
    let again = cache.execute("!bigfail").await;
    assert!(!again.success);
    assert!(!again.cached);
    assert_eq!(received.count("!bigfail"), 2);
}

#[tokio::test]
async fn test_missing_blob_forces_reexecution() {
    let dir = TempDir::new().unwrap();
    let (cache, received) = cache_with(heap_oracle(), &dir).await;

    let first = cache.execute("lm").await;
    let id = first.evidence_id.clone().unwrap();
    let entry = assert_ok!(cache.store().metadata(&id).await);
    std::fs::remove_file(&entry.blob_path).unwrap();

    let second = cache.execute("lm").await;
    assert!(second.success);
    assert!(!second.cached);
    assert_eq!(second.output, first.output);
    assert_eq!(received.count("lm"), 2);

    let third = cache.execute("lm").await;
    assert!(third.cached);
    assert_eq!(received.count("lm"), 2);
}
