//! Batching loader behavior with breakers, registries and concurrent tasks.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use leadflow_core::{CircuitBreakerConfig, LoaderConfig};
use leadflow_guard::{CircuitBreaker, CircuitState};
use leadflow_loader::{BatchLoader, LoaderRegistry};
use leadflow_test_utils::assertions::{assert_batch_failed, assert_circuit_open};
use leadflow_test_utils::fixtures::manual_clock;
use leadflow_test_utils::{init_test_tracing, RecordingBatchFn};

fn lead_names() -> RecordingBatchFn<u64, String> {
    RecordingBatchFn::new(|id: &u64| format!("lead-{id}"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_tasks_never_exceed_max_batch_size() {
    init_test_tracing();
    let batch = lead_names();
    let config = LoaderConfig {
        batch_size: 8,
        max_batch_size: 8,
        ..LoaderConfig::default()
    };
    let loader = BatchLoader::new("leads", batch.clone(), config).expect("valid config");

    let handles: Vec<_> = (0..100u64)
        .map(|id| {
            let loader = loader.clone();
            tokio::spawn(async move { (id, loader.load(id % 40).await) })
        })
        .collect();

    for handle in join_all(handles).await {
        let (id, result) = handle.expect("task completes");
        assert_eq!(result, Ok(format!("lead-{}", id % 40)));
    }

    let calls = batch.calls();
    assert!(calls.iter().all(|keys| keys.len() <= 8));
    let fetched: usize = calls.iter().map(Vec::len).sum();
    assert!(fetched >= 40, "every distinct key fetched at least once");
    assert!(fetched <= 100);
}

#[tokio::test]
async fn test_failure_fans_out_then_recovers_on_next_load() {
    let batch = lead_names();
    let loader = BatchLoader::new("leads", batch.clone(), LoaderConfig::default())
        .expect("valid config");

    batch.set_failing(true);
    let results = loader.load_many(vec![1, 2, 2, 3]).await;
    for result in &results {
        assert_batch_failed(result);
    }
    assert_eq!(batch.calls(), vec![vec![1, 2, 3]]);

    batch.set_failing(false);
    assert_eq!(loader.load(2).await, Ok("lead-2".to_string()));
    assert_eq!(batch.call_count(), 2, "failures are not cached");
}

#[tokio::test]
async fn test_breaker_trips_then_probes_after_recovery() {
    init_test_tracing();
    let (clock, shared) = manual_clock();
    let breaker = Arc::new(CircuitBreaker::with_clock(
        "crm-db",
        CircuitBreakerConfig::new(2, Duration::from_secs(30)),
        shared.clone(),
    ));
    let batch = lead_names();
    let loader = BatchLoader::builder("leads", batch.clone())
        .config(LoaderConfig::default().with_persistent_cache(false))
        .breaker(breaker.clone())
        .clock(shared)
        .build()
        .expect("valid config");

    batch.set_failing(true);
    assert_batch_failed(&loader.load(1).await);
    assert_batch_failed(&loader.load(2).await);
    assert_eq!(breaker.state(), CircuitState::Open);

    assert_circuit_open(&loader.load(3).await);
    assert_eq!(batch.call_count(), 2, "open breaker skips the batch function");

    batch.set_failing(false);
    clock.advance(Duration::from_secs(30));
    assert_eq!(loader.load(3).await, Ok("lead-3".to_string()));
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_flush_delay_widens_the_window() {
    let batch = lead_names();
    let loader = BatchLoader::new(
        "leads",
        batch.clone(),
        LoaderConfig::default().with_flush_delay(Duration::from_millis(10)),
    )
    .expect("valid config");

    let early = tokio::spawn({
        let loader = loader.clone();
        async move { loader.load(1).await }
    });
    tokio::time::sleep(Duration::from_millis(5)).await;
    let late = tokio::spawn({
        let loader = loader.clone();
        async move { loader.load(2).await }
    });

    assert_eq!(early.await.expect("task completes"), Ok("lead-1".to_string()));
    assert_eq!(late.await.expect("task completes"), Ok("lead-2".to_string()));
    assert_eq!(batch.calls(), vec![vec![1, 2]]);
}

#[tokio::test]
async fn test_request_scoped_registration() {
    let registry = Arc::new(LoaderRegistry::new());
    let batch = lead_names();

    {
        let loader = BatchLoader::new("leads", batch.clone(), LoaderConfig::default())
            .expect("valid config");
        let _guard = registry.scoped(loader);

        let handle = registry
            .get::<u64, String>("leads")
            .expect("registered for this scope");
        assert_eq!(handle.load(9).await, Ok("lead-9".to_string()));
        assert_eq!(registry.stats()["leads"].keys_loaded, 1);
    }

    assert!(registry.get::<u64, String>("leads").is_none());
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_batch_times_out_then_recovers() {
    let batch = lead_names();
    let loader = BatchLoader::new(
        "leads",
        batch.clone(),
        LoaderConfig::default().with_batch_timeout(Duration::from_millis(50)),
    )
    .expect("valid config");

    batch.set_delay(Some(Duration::from_secs(1)));
    let results = loader.load_many(vec![1, 2]).await;
    for result in &results {
        assert_batch_failed(result);
    }

    batch.set_delay(None);
    assert_eq!(loader.load(1).await, Ok("lead-1".to_string()));
    assert_eq!(batch.calls(), vec![vec![1, 2], vec![1]]);
}
