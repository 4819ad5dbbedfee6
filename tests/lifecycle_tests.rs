//! Engine startup, background ticking and shutdown.

use std::sync::Arc;
use std::time::Duration;

use operator_metrics::config::RollupConfig;
use operator_metrics::{EngineConfig, Granularity, MetricsEngine};

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.aggregates.rollups = vec![RollupConfig {
        granularity: Granularity::ONE_MINUTE,
        every: Duration::from_millis(20),
        start_offset: Duration::from_secs(600),
        end_offset: Duration::from_secs(60),
    }];
    config.retention.sweep_interval = Duration::from_millis(20);
    config.engine.shutdown_timeout = Duration::from_secs(2);
    config
}

#[tokio::test]
async fn background_jobs_tick_until_shutdown() {
    let engine = MetricsEngine::from_config(fast_config()).unwrap();
    engine.start();
    tokio::time::sleep(Duration::from_millis(150)).await;
    engine.shutdown().await.unwrap();

    let metrics = engine.metrics();
    assert!(metrics.ticks_total("aggregates/1m", "completed") >= 2);
    assert!(metrics.ticks_total("events/retention", "completed") >= 2);

    let frozen = metrics.ticks_total("aggregates/1m", "completed");
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(metrics.ticks_total("aggregates/1m", "completed"), frozen);

    let text = metrics.render().unwrap();
    assert!(text.contains("opmetrics_job_ticks_total"));
}

#[tokio::test]
async fn run_until_signal_returns_on_request() {
    let engine = Arc::new(MetricsEngine::from_config(fast_config()).unwrap());
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_until_signal().await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.is_running());
    engine.request_shutdown();

    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("engine did not stop")
        .unwrap()
        .unwrap();
    assert!(!engine.is_running());
    assert!(!engine.scheduler().is_running());
}
