// ============================================================================
// INGESTION GATEWAY
// ============================================================================
// The only writer of raw samples. Every sample is validated against the
// signal registry and the ingestion limits before anything is written; a
// rejected sample leaves no trace. Batches are capped and each element is
// validated and written independently.
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use compact_str::CompactString;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::error::{MetricsError, MetricsResult};
use crate::logging::targets;
use crate::query::FeatureGate;
use crate::store::{KpiStore, SampleStore};
use crate::telemetry::EngineMetrics;
use crate::time::{Clock, Timestamp};
use crate::types::{
    Dimensions, EntityScope, KpiMeasurement, MetricSample, RequestContext, SampleId, SignalRegistry,
};
use crate::{
    MAX_CONTEXT_ENTRIES, MAX_CONTEXT_KEY_LENGTH, MAX_CONTEXT_VALUE_LENGTH, MAX_DEVICE_ID_LENGTH,
    MAX_ENTITY_ID_LENGTH, MAX_KPI_DIMENSIONS, MAX_SIGNAL_TAG_LENGTH,
};

/// Batch elements written concurrently.
const BATCH_CONCURRENCY: usize = 16;

// ----------------------------------------------------------------------------
// Requests & Outcomes
// ----------------------------------------------------------------------------

/// Optional sample attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOptions {
    /// 0..=100
    #[serde(default)]
    pub quality_score: Option<i64>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Event time for replays and imports; server time otherwise.
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

/// One element of a batch (also one line of a JSONL import).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub entity_id: String,
    pub signal_type: String,
    pub value: f64,
    #[serde(flatten)]
    pub options: IngestOptions,
}

impl IngestRequest {
    pub fn new(entity_id: impl Into<String>, signal_type: impl Into<String>, value: f64) -> Self {
        Self {
            entity_id: entity_id.into(),
            signal_type: signal_type.into(),
            value,
            options: IngestOptions::default(),
        }
    }

    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.options.timestamp = Some(timestamp);
        self
    }
}

/// Why one batch element was not written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRejection {
    pub index: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    /// Samples durably written
    pub written: usize,
    /// Elements refused, ordered by index
    pub rejected: Vec<BatchRejection>,
}

// ----------------------------------------------------------------------------
// Gateway
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct IngestionGateway {
    samples: Arc<dyn SampleStore>,
    kpis: Arc<KpiStore>,
    registry: Arc<SignalRegistry>,
    gate: FeatureGate,
    clock: Arc<dyn Clock>,
    config: IngestConfig,
    metrics: EngineMetrics,
}

impl IngestionGateway {
    pub fn new(
        samples: Arc<dyn SampleStore>,
        kpis: Arc<KpiStore>,
        registry: Arc<SignalRegistry>,
        gate: FeatureGate,
        clock: Arc<dyn Clock>,
        config: IngestConfig,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            samples,
            kpis,
            registry,
            gate,
            clock,
            config,
            metrics,
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }

    /// Validate, stamp and append one sample.
    pub async fn ingest(
        &self,
        ctx: &RequestContext,
        entity_id: &str,
        signal_type: &str,
        value: f64,
        options: IngestOptions,
    ) -> MetricsResult<MetricSample> {
        self.gate.ensure_enabled()?;
        let request = IngestRequest {
            entity_id: entity_id.to_owned(),
            signal_type: signal_type.to_owned(),
            value,
            options,
        };
        let sample = self.write(request).await?;
        debug!(
            target: targets::INGEST,
            caller = %ctx.caller_id,
            role = %ctx.role,
            sample_id = %sample.sample_id,
            entity = %sample.entity_id,
            signal = %sample.signal_type,
            "Sample ingested"
        );
        Ok(sample)
    }

    /// Write each element independently; partial success is reported, not
    /// rolled back. A batch above the cap is refused outright.
    pub async fn batch_ingest(&self, ctx: &RequestContext, requests: Vec<IngestRequest>) -> MetricsResult<BatchOutcome> {
        self.gate.ensure_enabled()?;
        if requests.len() > self.config.max_batch_size {
            self.metrics.record_rejected("batch_too_large");
            return Err(MetricsError::validation(
                "batch",
                format!(
                    "batch of {} samples exceeds the limit of {}",
                    requests.len(),
                    self.config.max_batch_size
                ),
            ));
        }

        let total = requests.len();
        let results: Vec<(usize, MetricsResult<MetricSample>)> = stream::iter(requests.into_iter().enumerate())
            .map(|(index, request)| async move { (index, self.write(request).await) })
            .buffer_unordered(BATCH_CONCURRENCY)
            .collect()
            .await;

        let mut outcome = BatchOutcome::default();
        for (index, result) in results {
            match result {
                Ok(_) => outcome.written += 1,
                Err(e) => outcome.rejected.push(BatchRejection {
                    index,
                    message: e.to_string(),
                }),
            }
        }
        outcome.rejected.sort_by_key(|r| r.index);

        info!(
            target: targets::INGEST,
            caller = %ctx.caller_id,
            total,
            written = outcome.written,
            rejected = outcome.rejected.len(),
            "Batch ingested"
        );
        Ok(outcome)
    }

    /// Record one dimensioned KPI observation.
    pub async fn record_kpi_measurement(
        &self,
        ctx: &RequestContext,
        kpi_id: &str,
        value: f64,
        dimensions: Vec<String>,
        timestamp: Option<Timestamp>,
    ) -> MetricsResult<KpiMeasurement> {
        self.gate.ensure_enabled()?;

        let kpi_id = kpi_id.trim();
        if kpi_id.is_empty() {
            return Err(MetricsError::validation("kpiId", "must not be empty"));
        }
        if !value.is_finite() {
            return Err(MetricsError::validation("value", "must be a finite number"));
        }
        if dimensions.len() > MAX_KPI_DIMENSIONS {
            return Err(MetricsError::validation(
                "dimensions",
                format!("at most {MAX_KPI_DIMENSIONS} dimension tags are allowed"),
            ));
        }
        let mut tags = Dimensions::new();
        for raw in &dimensions {
            let tag = raw.trim();
            if tag.is_empty() || tag.len() > MAX_SIGNAL_TAG_LENGTH {
                return Err(MetricsError::validation(
                    "dimensions",
                    format!("dimension tags must be 1-{MAX_SIGNAL_TAG_LENGTH} characters"),
                ));
            }
            tags.push(CompactString::from(tag));
        }
        let timestamp = self.resolve_timestamp(timestamp)?;

        let measurement = KpiMeasurement {
            id: SampleId::generate(),
            kpi_id: CompactString::from(kpi_id),
            value,
            dimensions: tags,
            timestamp,
        };
        self.kpis.record(measurement.clone())?;

        debug!(
            target: targets::INGEST,
            caller = %ctx.caller_id,
            kpi = %measurement.kpi_id,
            value,
            "KPI measurement recorded"
        );
        Ok(measurement)
    }

    async fn write(&self, request: IngestRequest) -> MetricsResult<MetricSample> {
        let sample = match self.validate(request) {
            Ok(sample) => sample,
            Err(e) => {
                self.metrics.record_rejected(e.category());
                return Err(e);
            }
        };

        if let Err(e) = self.samples.insert(sample.clone()).await {
            warn!(
                target: targets::INGEST,
                sample_id = %sample.sample_id,
                table = %sample.table,
                error = %e,
                "Sample write failed"
            );
            self.metrics.record_rejected(e.category());
            return Err(e);
        }
        self.metrics.record_ingested(sample.table.as_str());
        Ok(sample)
    }

    fn resolve_timestamp(&self, requested: Option<Timestamp>) -> MetricsResult<Timestamp> {
        match requested {
            Some(_) if !self.config.allow_client_timestamps => Err(MetricsError::validation(
                "timestamp",
                "caller-supplied timestamps are disabled",
            )),
            Some(ts) => Ok(ts),
            None => Ok(self.clock.now()),
        }
    }

    /// Turn a request into a sample, or explain why not.
    fn validate(&self, request: IngestRequest) -> MetricsResult<MetricSample> {
        let IngestRequest {
            entity_id,
            signal_type,
            value,
            options,
        } = request;

        let entity_id = entity_id.trim();
        if entity_id.is_empty() {
            return Err(MetricsError::validation("entityId", "must not be empty"));
        }
        if entity_id.len() > MAX_ENTITY_ID_LENGTH {
            return Err(MetricsError::validation(
                "entityId",
                format!("must be at most {MAX_ENTITY_ID_LENGTH} characters"),
            ));
        }
        if entity_id == EntityScope::WILDCARD {
            return Err(MetricsError::validation(
                "entityId",
                format!("'{}' is reserved for cross-entity rollups", EntityScope::WILDCARD),
            ));
        }

        let spec = self.registry.resolve(&signal_type)?;

        if !value.is_finite() {
            return Err(MetricsError::validation("value", "must be a finite number"));
        }
        spec.bounds.check(spec.tag.as_str(), value)?;

        let quality_score = match options.quality_score {
            Some(q) if !(0..=100).contains(&q) => {
                return Err(MetricsError::validation("qualityScore", format!("must be 0-100, got {q}")));
            }
            Some(q) => Some(q as u8),
            None => None,
        };

        let device_id = match options.device_id.as_deref().map(str::trim) {
            Some(d) if d.len() > MAX_DEVICE_ID_LENGTH => {
                return Err(MetricsError::validation(
                    "deviceId",
                    format!("must be at most {MAX_DEVICE_ID_LENGTH} characters"),
                ));
            }
            Some("") | None => None,
            Some(d) => Some(d.to_owned()),
        };

        if options.context.len() > MAX_CONTEXT_ENTRIES {
            return Err(MetricsError::validation(
                "context",
                format!("at most {MAX_CONTEXT_ENTRIES} entries are allowed"),
            ));
        }
        for (key, val) in &options.context {
            if key.is_empty() || key.len() > MAX_CONTEXT_KEY_LENGTH {
                return Err(MetricsError::validation(
                    "context",
                    format!("keys must be 1-{MAX_CONTEXT_KEY_LENGTH} characters"),
                ));
            }
            if val.len() > MAX_CONTEXT_VALUE_LENGTH {
                return Err(MetricsError::validation(
                    "context",
                    format!("value for '{key}' exceeds {MAX_CONTEXT_VALUE_LENGTH} characters"),
                ));
            }
        }

        let timestamp = self.resolve_timestamp(options.timestamp)?;

        Ok(MetricSample {
            sample_id: SampleId::generate(),
            entity_id: CompactString::from(entity_id),
            signal_type: spec.tag.clone(),
            table: spec.table(),
            value,
            quality_score,
            device_id,
            context: options.context,
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemorySampleStore, SampleFilter};
    use crate::time::ManualClock;
    use crate::types::{KpiDefinition, KpiDirection, SampleTable};
    use rstest::rstest;

    fn gateway_with(config: IngestConfig) -> (IngestionGateway, Arc<MemorySampleStore>, FeatureGate) {
        let store = Arc::new(MemorySampleStore::new());
        let gate = FeatureGate::new(true);
        let gateway = IngestionGateway::new(
            store.clone(),
            Arc::new(KpiStore::new()),
            Arc::new(SignalRegistry::default()),
            gate.clone(),
            Arc::new(ManualClock::new(Timestamp::from_secs(1_000))),
            config,
            EngineMetrics::new().unwrap(),
        );
        (gateway, store, gate)
    }

    fn gateway() -> (IngestionGateway, Arc<MemorySampleStore>, FeatureGate) {
        gateway_with(IngestConfig::default())
    }

    #[tokio::test]
    async fn test_ingest_assigns_id_and_server_time() {
        let (gateway, store, _) = gateway();
        let ctx = RequestContext::anonymous();
        let sample = gateway.ingest(&ctx, " u1 ", "EEG", 12.5, IngestOptions::default()).await.unwrap();

        assert_eq!(sample.entity_id, "u1");
        assert_eq!(sample.signal_type.as_str(), "eeg");
        assert_eq!(sample.table, SampleTable::Biofeedback);
        assert_eq!(sample.timestamp, Timestamp::from_secs(1_000));
        assert_eq!(store.get_sample(sample.sample_id), Some(sample));
    }

    #[rstest]
    #[case("", "eeg", 1.0)]
    #[case("u1", "", 1.0)]
    #[case("u1", "blood_ph", 1.0)]
    #[case("u1", "eeg", -1.0)]
    #[case("u1", "eeg", f64::NAN)]
    #[case("u1", "eeg", f64::INFINITY)]
    #[case("u1", "focus_score", 101.0)]
    #[case("*", "eeg", 1.0)]
    #[case(" * ", "eeg", 1.0)]
    #[tokio::test]
    async fn test_invalid_samples_are_rejected_without_write(
        #[case] entity: &str,
        #[case] signal: &str,
        #[case] value: f64,
    ) {
        let (gateway, store, _) = gateway();
        let err = gateway
            .ingest(&RequestContext::anonymous(), entity, signal, value, IngestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MetricsError::Validation { .. }), "{err}");
        assert_eq!(store.sample_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_hz_is_valid() {
        let (gateway, _, _) = gateway();
        let sample = gateway
            .ingest(&RequestContext::anonymous(), "u1", "eeg", 0.0, IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(sample.value, 0.0);
    }

    #[tokio::test]
    async fn test_option_limits() {
        let (gateway, _, _) = gateway();
        let ctx = RequestContext::anonymous();

        let bad_quality = IngestOptions {
            quality_score: Some(101),
            ..Default::default()
        };
        assert!(gateway.ingest(&ctx, "u1", "eeg", 1.0, bad_quality).await.is_err());

        let crowded = IngestOptions {
            context: (0..=MAX_CONTEXT_ENTRIES).map(|i| (format!("k{i}"), "v".into())).collect(),
            ..Default::default()
        };
        assert!(gateway.ingest(&ctx, "u1", "eeg", 1.0, crowded).await.is_err());

        let fine = IngestOptions {
            quality_score: Some(100),
            device_id: Some("  headset-7 ".into()),
            context: [("session".to_string(), "morning".to_string())].into_iter().collect(),
            timestamp: Some(Timestamp::from_secs(42)),
        };
        let sample = gateway.ingest(&ctx, "u1", "eeg", 1.0, fine).await.unwrap();
        assert_eq!(sample.quality_score, Some(100));
        assert_eq!(sample.device_id.as_deref(), Some("headset-7"));
        assert_eq!(sample.timestamp, Timestamp::from_secs(42));
    }

    #[tokio::test]
    async fn test_client_timestamps_can_be_disabled() {
        let (gateway, _, _) = gateway_with(IngestConfig {
            allow_client_timestamps: false,
            ..Default::default()
        });
        let options = IngestOptions {
            timestamp: Some(Timestamp::from_secs(1)),
            ..Default::default()
        };
        let err = gateway
            .ingest(&RequestContext::anonymous(), "u1", "eeg", 1.0, options)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timestamp"));
    }

    #[tokio::test]
    async fn test_unrepresentable_client_timestamp_is_rejected() {
        let line = r#"{"entityId":"u1","signalType":"eeg","value":5,"timestamp":"2300-01-01T00:00:00Z"}"#;
        let err = serde_json::from_str::<IngestRequest>(line).unwrap_err();
        assert!(err.to_string().contains("representable range"), "{err}");

        let early = r#"{"entityId":"u1","signalType":"eeg","value":5,"timestamp":"1600-01-01T00:00:00Z"}"#;
        assert!(serde_json::from_str::<IngestRequest>(early).is_err());

        let (gateway, store, _) = gateway();
        let line = r#"{"entityId":"u1","signalType":"eeg","value":5,"timestamp":"2200-01-01T00:00:00Z"}"#;
        let request: IngestRequest = serde_json::from_str(line).unwrap();
        let outcome = gateway.batch_ingest(&RequestContext::system(), vec![request]).await.unwrap();
        assert_eq!(outcome.written, 1);
        let stored = store.scan_samples(&SampleFilter::new());
        assert_eq!(stored[0].timestamp.to_string(), "2200-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn test_batch_partial_success() {
        let (gateway, store, _) = gateway();
        let batch = vec![
            IngestRequest::new("u1", "eeg", 10.0),
            IngestRequest::new("u1", "eeg", -1.0),
            IngestRequest::new("u2", "heart_rate", 60.0),
            IngestRequest::new("", "eeg", 1.0),
        ];
        let outcome = gateway.batch_ingest(&RequestContext::system(), batch).await.unwrap();
        assert_eq!(outcome.written, 2);
        let indexes: Vec<usize> = outcome.rejected.iter().map(|r| r.index).collect();
        assert_eq!(indexes, vec![1, 3]);
        assert_eq!(store.count_samples(&SampleFilter::new()), 2);
    }

    #[tokio::test]
    async fn test_batch_over_cap_is_refused() {
        let (gateway, store, _) = gateway_with(IngestConfig {
            max_batch_size: 2,
            ..Default::default()
        });
        let batch = vec![IngestRequest::new("u1", "eeg", 1.0); 3];
        let err = gateway.batch_ingest(&RequestContext::system(), batch).await.unwrap_err();
        assert!(matches!(err, MetricsError::Validation { .. }));
        assert_eq!(store.sample_count(), 0);
    }

    #[tokio::test]
    async fn test_disabled_feature_refuses_writes() {
        let (gateway, store, gate) = gateway();
        gate.set_enabled(false);
        let err = gateway
            .ingest(&RequestContext::anonymous(), "u1", "eeg", 1.0, IngestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MetricsError::FeatureDisabled { .. }));
        assert_eq!(store.sample_count(), 0);
    }

    #[tokio::test]
    async fn test_kpi_measurement() {
        let (gateway, _, _) = gateway();
        gateway
            .kpis
            .define(KpiDefinition {
                id: "uptime".into(),
                name: "Uptime".into(),
                unit: None,
                target: Some(99.9),
                warning_threshold: None,
                critical_threshold: None,
                direction: KpiDirection::HigherIsBetter,
            })
            .unwrap();
        let ctx = RequestContext::system();

        let m = gateway
            .record_kpi_measurement(&ctx, "uptime", 99.5, vec!["eu-west".into(), "api".into()], None)
            .await
            .unwrap();
        assert_eq!(m.dimensions.len(), 2);
        assert_eq!(m.timestamp, Timestamp::from_secs(1_000));

        let too_many = vec!["a".to_string(), "b".into(), "c".into(), "d".into()];
        assert!(gateway.record_kpi_measurement(&ctx, "uptime", 1.0, too_many, None).await.is_err());
        assert!(gateway.record_kpi_measurement(&ctx, "missing", 1.0, vec![], None).await.is_err());
    }
}
