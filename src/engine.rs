// ============================================================================
// ENGINE
// ============================================================================
// Wires stores, gateway, analytics, query façade, rollup maintainers and
// retention into one unit, owns the scheduler and drives startup/shutdown.
// ============================================================================

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::aggregate::{ContinuousAggregateMaintainer, RollupSpec};
use crate::api::MetricsApi;
use crate::config::{ConfigManager, EngineConfig, StoreBackend};
use crate::error::{ConfigError, MetricsResult};
use crate::ingest::IngestionGateway;
use crate::logging::targets;
use crate::query::{FeatureGate, QueryService};
use crate::retention::{RetentionEnforcer, RetentionPolicy};
use crate::scheduler::JobScheduler;
use crate::store::{
    AggregateStore, KpiStore, LogSampleStore, MemoryAggregateStore, MemorySampleStore, SampleStore,
    TimedAggregateStore, TimedSampleStore,
};
use crate::telemetry::EngineMetrics;
use crate::time::{Clock, SystemClock, Timestamp};
use crate::{ENGINE_FULL_NAME, ENGINE_VERSION};

/// The assembled metrics core.
#[derive(Debug)]
pub struct MetricsEngine {
    config: Arc<ConfigManager>,
    clock: Arc<dyn Clock>,
    samples: Arc<dyn SampleStore>,
    /// Kept separately so shutdown can flush it
    log_store: Option<Arc<LogSampleStore>>,
    aggregates: Arc<dyn AggregateStore>,
    kpis: Arc<KpiStore>,
    gate: FeatureGate,
    gateway: IngestionGateway,
    query: QueryService,
    maintainers: Vec<Arc<ContinuousAggregateMaintainer>>,
    retention: Arc<RetentionEnforcer>,
    scheduler: JobScheduler,
    metrics: EngineMetrics,
    shutdown: Arc<Notify>,
    running: AtomicBool,
    start_time: Timestamp,
}

impl MetricsEngine {
    pub fn from_config(config: EngineConfig) -> MetricsResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn from_config_file<P: AsRef<Path>>(path: P) -> MetricsResult<Self> {
        let manager = ConfigManager::from_file(path)?;
        Self::build(Arc::new(manager), Arc::new(SystemClock))
    }

    /// Build with an explicit clock (tests drive time through `ManualClock`).
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> MetricsResult<Self> {
        config.validate()?;
        Self::build(Arc::new(ConfigManager::new(config)), clock)
    }

    fn build(manager: Arc<ConfigManager>, clock: Arc<dyn Clock>) -> MetricsResult<Self> {
        let config = manager.get();
        let registry = Arc::new(config.signals.build_registry()?);
        let metrics = EngineMetrics::new()?;

        let (raw_samples, log_store): (Arc<dyn SampleStore>, Option<Arc<LogSampleStore>>) = match config.store.backend {
            StoreBackend::Memory => (Arc::new(MemorySampleStore::new()) as Arc<dyn SampleStore>, None),
            StoreBackend::Log => {
                let path = config
                    .store
                    .path
                    .as_ref()
                    .ok_or_else(|| ConfigError::invalid_value("store.path", "required when backend = \"log\""))?;
                let store = Arc::new(LogSampleStore::open(path, config.store.sync_every_write)?);
                let raw: Arc<dyn SampleStore> = store.clone();
                (raw, Some(store))
            }
        };
        let samples: Arc<dyn SampleStore> = Arc::new(TimedSampleStore::new(raw_samples, config.store.op_timeout));
        let aggregates: Arc<dyn AggregateStore> = Arc::new(TimedAggregateStore::new(
            Arc::new(MemoryAggregateStore::new()),
            config.store.op_timeout,
        ));
        let kpis = Arc::new(KpiStore::new());

        let gate = FeatureGate::with_name(config.feature.name.as_str(), config.feature.enabled);
        let gateway = IngestionGateway::new(
            samples.clone(),
            kpis.clone(),
            registry.clone(),
            gate.clone(),
            clock.clone(),
            config.ingest.clone(),
            metrics.clone(),
        );
        let query = QueryService::new(
            samples.clone(),
            aggregates.clone(),
            kpis.clone(),
            registry,
            gate.clone(),
            clock.clone(),
        );

        let scheduler = JobScheduler::new(clock.clone(), metrics.clone());

        let mut maintainers = Vec::with_capacity(config.aggregates.rollups.len());
        for rollup in &config.aggregates.rollups {
            let maintainer = Arc::new(ContinuousAggregateMaintainer::new(
                samples.clone(),
                aggregates.clone(),
                RollupSpec::try_from(rollup)?,
                config.aggregates.wildcard_scope,
                metrics.clone(),
            ));
            scheduler.register(maintainer.clone())?;
            maintainers.push(maintainer);
        }

        let retention = Arc::new(RetentionEnforcer::new(
            samples.clone(),
            aggregates.clone(),
            kpis.clone(),
            RetentionPolicy::from_config(&config.retention),
            metrics.clone(),
        ));
        if config.retention.enabled {
            for job in retention.jobs(config.retention.sweep_interval) {
                scheduler.register(job)?;
            }
        }

        Ok(Self {
            config: manager,
            clock,
            samples,
            log_store,
            aggregates,
            kpis,
            gate,
            gateway,
            query,
            maintainers,
            retention,
            scheduler,
            metrics,
            shutdown: Arc::new(Notify::new()),
            running: AtomicBool::new(false),
            start_time: Timestamp::now(),
        })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.get()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn gateway(&self) -> &IngestionGateway {
        &self.gateway
    }

    pub fn query(&self) -> &QueryService {
        &self.query
    }

    pub fn api(&self) -> MetricsApi {
        MetricsApi::new(self.gateway.clone(), self.query.clone())
    }

    pub fn kpis(&self) -> &Arc<KpiStore> {
        &self.kpis
    }

    pub fn samples(&self) -> &Arc<dyn SampleStore> {
        &self.samples
    }

    /// The durable log, when the log backend is configured.
    pub fn log_store(&self) -> Option<&Arc<LogSampleStore>> {
        self.log_store.as_ref()
    }

    pub fn aggregates(&self) -> &Arc<dyn AggregateStore> {
        &self.aggregates
    }

    pub fn maintainers(&self) -> &[Arc<ContinuousAggregateMaintainer>] {
        &self.maintainers
    }

    pub fn retention(&self) -> &Arc<RetentionEnforcer> {
        &self.retention
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn uptime(&self) -> Duration {
        Timestamp::now().duration_since(self.start_time)
    }

    /// Administrative switch; every endpoint answers `FeatureDisabled` while off.
    pub fn set_feature_enabled(&self, enabled: bool) {
        info!(target: targets::ENGINE, feature = self.gate.name(), enabled, "Feature switch changed");
        self.gate.set_enabled(enabled);
    }

    /// Re-read the configuration file and apply the feature switch.
    /// Schedules and horizons take effect on the next start.
    pub fn reload_config(&self) -> MetricsResult<()> {
        let config = self.config.reload()?;
        self.gate.set_enabled(config.feature.enabled);
        info!(target: targets::ENGINE, enabled = config.feature.enabled, "Configuration reloaded");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start background jobs.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!(target: targets::ENGINE, "Engine already running");
            return;
        }
        let config = self.config.get();
        info!(
            target: targets::ENGINE,
            version = ENGINE_VERSION,
            instance = %config.engine.instance_name,
            environment = %config.engine.environment,
            jobs = self.scheduler.job_keys().len(),
            feature_enabled = self.gate.is_enabled(),
            "Starting {}", ENGINE_FULL_NAME
        );
        self.scheduler.start();
    }

    /// Ask a running `run_until_signal` to return.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Stop background jobs and flush the sample log.
    pub async fn shutdown(&self) -> MetricsResult<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        info!(target: targets::ENGINE, "Starting graceful shutdown");
        let shutdown_start = Instant::now();

        self.scheduler.shutdown(self.config.get().engine.shutdown_timeout).await;
        if let Some(log) = &self.log_store {
            log.sync().await?;
        }

        info!(
            target: targets::ENGINE,
            duration_ms = shutdown_start.elapsed().as_millis() as u64,
            "Engine shutdown complete"
        );
        Ok(())
    }

    /// Start, then block until SIGINT/SIGTERM or `request_shutdown`.
    pub async fn run_until_signal(&self) -> MetricsResult<()> {
        self.start();

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
            tokio::select! {
                _ = sigterm.recv() => info!(target: targets::ENGINE, "Received SIGTERM"),
                _ = sigint.recv() => info!(target: targets::ENGINE, "Received SIGINT"),
                _ = self.shutdown.notified() => info!(target: targets::ENGINE, "Shutdown requested"),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                result = signal::ctrl_c() => {
                    result?;
                    info!(target: targets::ENGINE, "Received Ctrl-C");
                }
                _ = self.shutdown.notified() => info!(target: targets::ENGINE, "Shutdown requested"),
            }
        }

        self.shutdown().await
    }

    pub async fn stats(&self) -> MetricsResult<EngineStats> {
        Ok(EngineStats {
            uptime: self.uptime(),
            is_running: self.is_running(),
            feature_enabled: self.gate.is_enabled(),
            samples: self.samples.len().await?,
            buckets: self.aggregates.len().await?,
            kpi_measurements: self.kpis.measurement_count(),
            jobs: self.scheduler.job_keys().len(),
        })
    }
}

/// Engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub uptime: Duration,
    pub is_running: bool,
    pub feature_enabled: bool,
    pub samples: usize,
    pub buckets: usize,
    pub kpi_measurements: usize,
    pub jobs: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RollupConfig;
    use crate::ingest::IngestOptions;
    use crate::scheduler::JobKey;
    use crate::time::{Granularity, ManualClock};
    use crate::types::RequestContext;

    #[tokio::test]
    async fn test_engine_registers_default_jobs() {
        let engine = MetricsEngine::from_config(EngineConfig::default()).unwrap();
        let keys: Vec<String> = engine.scheduler().job_keys().iter().map(|k| k.to_string()).collect();
        assert!(keys.contains(&"aggregates/1m".to_string()));
        assert!(keys.contains(&"aggregates/5m".to_string()));
        assert!(keys.contains(&"events/retention".to_string()));
        assert_eq!(keys.len(), 7);
    }

    #[tokio::test]
    async fn test_disabled_retention_registers_no_sweeps() {
        let mut config = EngineConfig::default();
        config.retention.enabled = false;
        config.aggregates.rollups = vec![RollupConfig {
            granularity: Granularity::FIFTEEN_MINUTES,
            every: Duration::from_secs(900),
            start_offset: Duration::from_secs(3_600),
            end_offset: Duration::from_secs(900),
        }];
        let engine = MetricsEngine::from_config(config).unwrap();
        assert_eq!(engine.scheduler().job_keys(), vec![JobKey::new("aggregates", "15m")]);
    }

    #[tokio::test]
    async fn test_ingest_then_trigger_rollup() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(3_600)));
        let engine = MetricsEngine::with_clock(EngineConfig::default(), clock.clone()).unwrap();
        engine
            .gateway()
            .ingest(&RequestContext::system(), "u1", "eeg", 8.0, IngestOptions::default())
            .await
            .unwrap();

        clock.advance(Duration::from_secs(120));
        let outcome = engine.scheduler().trigger(&JobKey::new("aggregates", "1m")).await.unwrap();
        assert!(outcome.is_completed());

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.samples, 1);
        assert_eq!(stats.buckets, 2); // u1 and wildcard
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let engine = MetricsEngine::from_config(EngineConfig::default()).unwrap();
        engine.start();
        assert!(engine.is_running());
        assert!(engine.scheduler().is_running());
        engine.shutdown().await.unwrap();
        assert!(!engine.is_running());
        assert!(!engine.scheduler().is_running());

        engine.start();
        assert!(engine.is_running());
        assert!(engine.scheduler().is_running());
        engine.shutdown().await.unwrap();
        assert!(!engine.scheduler().is_running());
    }

    #[tokio::test]
    async fn test_feature_switch() {
        let engine = MetricsEngine::from_config(EngineConfig::default()).unwrap();
        engine.set_feature_enabled(false);
        assert!(engine.query().feature_status().await.is_err());
        engine.set_feature_enabled(true);
        assert_eq!(engine.query().feature_status().await.unwrap().measurement_count, 0);
    }
}
