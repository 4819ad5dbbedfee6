//! Durability of the log-backed engine across restarts.

use std::sync::Arc;
use std::time::Duration;

use operator_metrics::config::StoreBackend;
use operator_metrics::query::ListFilter;
use operator_metrics::{
    Clock, EngineConfig, IngestOptions, IngestRequest, ManualClock, MetricsEngine, RequestContext, Timestamp,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const START: i64 = 1_700_000_000;

fn log_config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.store.backend = StoreBackend::Log;
    config.store.path = Some(dir.path().join("data").join("samples.log"));
    config
}

fn engine(config: &EngineConfig, clock: &Arc<ManualClock>) -> MetricsEngine {
    MetricsEngine::with_clock(config.clone(), clock.clone()).unwrap()
}

#[tokio::test]
async fn samples_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = log_config(&dir);
    let clock = Arc::new(ManualClock::new(Timestamp::from_secs(START)));

    let written = {
        let engine = engine(&config, &clock);
        let batch = (0..25).map(|i| IngestRequest::new("u1", "eeg", f64::from(i))).collect();
        let outcome = engine.gateway().batch_ingest(&RequestContext::system(), batch).await.unwrap();
        assert_eq!(outcome.written, 25);
        engine.start();
        engine.shutdown().await.unwrap();
        engine.query().list(&ListFilter::default()).await.unwrap().items
    };

    let reopened = engine(&config, &clock);
    let replay = reopened.log_store().unwrap().replay_report();
    assert_eq!(replay.records, 25);
    assert_eq!(replay.truncated_bytes, 0);

    let list = reopened.query().list(&ListFilter::default()).await.unwrap();
    assert_eq!(list.items, written);

    let stats = reopened.query().windowed_stats(10.0, Some("eeg")).await.unwrap();
    assert_eq!((stats.sample_count, stats.average_hz), (25, 12.0));
}

#[tokio::test]
async fn sweep_and_compact_persist_deletions() {
    let dir = tempfile::tempdir().unwrap();
    let config = log_config(&dir);
    let clock = Arc::new(ManualClock::new(Timestamp::from_secs(START)));

    {
        let engine = engine(&config, &clock);
        let ctx = RequestContext::system();
        engine
            .gateway()
            .ingest(&ctx, "host-1", "cpu_usage", 91.0, IngestOptions::default())
            .await
            .unwrap();
        clock.advance(Duration::from_secs(10 * 86_400));
        engine
            .gateway()
            .ingest(&ctx, "host-1", "cpu_usage", 12.0, IngestOptions::default())
            .await
            .unwrap();

        let reports = engine.retention().sweep_all(clock.now()).await.unwrap();
        assert_eq!(reports.iter().map(|r| r.purged).sum::<usize>(), 1);
        assert_eq!(engine.log_store().unwrap().compact().await.unwrap(), 1);
    }

    let reopened = engine(&config, &clock);
    assert_eq!(reopened.log_store().unwrap().replay_report().records, 1);
    let latest = reopened.query().latest("host-1", "cpu_usage").await.unwrap();
    assert_eq!(latest.value, 12.0);
}
