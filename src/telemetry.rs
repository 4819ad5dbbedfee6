// ============================================================================
// ENGINE TELEMETRY
// ============================================================================
// Prometheus counters describing what the core has done: samples written and
// rejected, buckets upserted, rows purged and background ticks by outcome.
// Each engine owns its own registry so tests never share global state.
// ============================================================================

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry as PrometheusRegistry, TextEncoder,
};

use crate::error::{MetricsError, MetricsResult};

const NAMESPACE: &str = "opmetrics";

fn registration_error(e: prometheus::Error) -> MetricsError {
    MetricsError::Internal(format!("metric registration failed: {e}"))
}

/// Counters shared by every component of one engine.
#[derive(Clone)]
pub struct EngineMetrics {
    registry: PrometheusRegistry,
    samples_ingested: IntCounterVec,
    samples_rejected: IntCounterVec,
    buckets_upserted: IntCounterVec,
    rows_purged: IntCounterVec,
    ticks: IntCounterVec,
    tick_duration: HistogramVec,
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics").finish_non_exhaustive()
    }
}

impl EngineMetrics {
    pub fn new() -> MetricsResult<Self> {
        let registry = PrometheusRegistry::new_custom(Some(NAMESPACE.into()), None).map_err(registration_error)?;

        let samples_ingested = IntCounterVec::new(
            Opts::new("samples_ingested_total", "Samples written to the sample store"),
            &["table"],
        )
        .map_err(registration_error)?;
        let samples_rejected = IntCounterVec::new(
            Opts::new("samples_rejected_total", "Samples refused at the ingestion boundary"),
            &["reason"],
        )
        .map_err(registration_error)?;
        let buckets_upserted = IntCounterVec::new(
            Opts::new("buckets_upserted_total", "Aggregate buckets recomputed and upserted"),
            &["granularity"],
        )
        .map_err(registration_error)?;
        let rows_purged = IntCounterVec::new(
            Opts::new("rows_purged_total", "Rows deleted by retention sweeps"),
            &["table"],
        )
        .map_err(registration_error)?;
        let ticks = IntCounterVec::new(
            Opts::new("job_ticks_total", "Background job ticks by outcome"),
            &["job", "outcome"],
        )
        .map_err(registration_error)?;
        let tick_duration = HistogramVec::new(
            HistogramOpts::new("job_tick_duration_seconds", "Wall time of completed background ticks")
                .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["job"],
        )
        .map_err(registration_error)?;

        registry.register(Box::new(samples_ingested.clone())).map_err(registration_error)?;
        registry.register(Box::new(samples_rejected.clone())).map_err(registration_error)?;
        registry.register(Box::new(buckets_upserted.clone())).map_err(registration_error)?;
        registry.register(Box::new(rows_purged.clone())).map_err(registration_error)?;
        registry.register(Box::new(ticks.clone())).map_err(registration_error)?;
        registry.register(Box::new(tick_duration.clone())).map_err(registration_error)?;

        Ok(Self {
            registry,
            samples_ingested,
            samples_rejected,
            buckets_upserted,
            rows_purged,
            ticks,
            tick_duration,
        })
    }

    pub fn record_ingested(&self, table: &str) {
        self.samples_ingested.with_label_values(&[table]).inc();
    }

    pub fn record_rejected(&self, reason: &str) {
        self.samples_rejected.with_label_values(&[reason]).inc();
    }

    pub fn record_buckets(&self, granularity: &str, count: usize) {
        self.buckets_upserted.with_label_values(&[granularity]).inc_by(count as u64);
    }

    pub fn record_purged(&self, table: &str, count: usize) {
        self.rows_purged.with_label_values(&[table]).inc_by(count as u64);
    }

    pub fn record_tick(&self, job: &str, outcome: &str, elapsed: Option<Duration>) {
        self.ticks.with_label_values(&[job, outcome]).inc();
        if let Some(elapsed) = elapsed {
            self.tick_duration.with_label_values(&[job]).observe(elapsed.as_secs_f64());
        }
    }

    pub fn ingested_total(&self, table: &str) -> u64 {
        self.samples_ingested.with_label_values(&[table]).get()
    }

    pub fn ticks_total(&self, job: &str, outcome: &str) -> u64 {
        self.ticks.with_label_values(&[job, outcome]).get()
    }

    /// Text exposition format.
    pub fn render(&self) -> MetricsResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Internal(format!("metric encoding failed: {e}")))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Internal(e.to_string()))
    }
}
