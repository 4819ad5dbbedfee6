// ============================================================================
// QUERY SERVICE
// ============================================================================
// Read-only façade over the sample, aggregate and KPI stores. Every call
// consults the feature gate first, so a disabled subsystem answers uniformly
// with `FeatureDisabled` instead of partial data.
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::analytics::{SummaryStats, WindowStats, WindowedAnalytics};
use crate::error::{MetricsError, MetricsResult};
use crate::logging::targets;
use crate::store::{AggregateStore, BucketRange, KpiStore, SampleFilter, SampleStore};
use crate::time::{Clock, Granularity, Timestamp};
use crate::types::{
    AggregateBucket, EntityScope, KpiDefinition, KpiMeasurement, KpiStatus, MetricSample, SignalRegistry, SignalType,
};
use crate::{DEFAULT_SERIES_LIMIT, FEATURE_NAME, MAX_ENTITY_ID_LENGTH, MAX_SERIES_LIMIT};

// ----------------------------------------------------------------------------
// Feature Gate
// ----------------------------------------------------------------------------

/// Runtime on/off switch shared by the gateway and the query service.
#[derive(Debug, Clone)]
pub struct FeatureGate {
    enabled: Arc<AtomicBool>,
    name: CompactString,
}

impl FeatureGate {
    pub fn new(enabled: bool) -> Self {
        Self::with_name(FEATURE_NAME, enabled)
    }

    pub fn with_name(name: impl Into<CompactString>, enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    #[inline]
    pub fn ensure_enabled(&self) -> MetricsResult<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(MetricsError::feature_disabled(self.name.as_str()))
        }
    }
}

// ----------------------------------------------------------------------------
// Query Parameters
// ----------------------------------------------------------------------------

/// Look-back ranges accepted by stats and series queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatsRange {
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "24h")]
    OneDay,
    #[serde(rename = "7d")]
    SevenDays,
    #[serde(rename = "30d")]
    ThirtyDays,
}

impl StatsRange {
    pub const ALL: [StatsRange; 4] = [
        StatsRange::OneHour,
        StatsRange::OneDay,
        StatsRange::SevenDays,
        StatsRange::ThirtyDays,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatsRange::OneHour => "1h",
            StatsRange::OneDay => "24h",
            StatsRange::SevenDays => "7d",
            StatsRange::ThirtyDays => "30d",
        }
    }

    pub fn as_duration(&self) -> Duration {
        const HOUR: u64 = 3600;
        Duration::from_secs(match self {
            StatsRange::OneHour => HOUR,
            StatsRange::OneDay => 24 * HOUR,
            StatsRange::SevenDays => 7 * 24 * HOUR,
            StatsRange::ThirtyDays => 30 * 24 * HOUR,
        })
    }
}

impl Display for StatsRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatsRange {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        StatsRange::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| MetricsError::validation("range", format!("'{s}' is not one of 1h, 24h, 7d, 30d")))
    }
}

/// Page request over an aggregated series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesQuery {
    /// Defaults to 100, capped at 100
    #[serde(default)]
    pub limit: Option<usize>,
    /// Continue below this bucket start (exclusive)
    #[serde(default)]
    pub before: Option<Timestamp>,
}

impl SeriesQuery {
    pub fn effective_limit(&self) -> MetricsResult<usize> {
        match self.limit {
            Some(0) => Err(MetricsError::validation("limit", "must be at least 1")),
            Some(n) => Ok(n.min(MAX_SERIES_LIMIT)),
            None => Ok(DEFAULT_SERIES_LIMIT),
        }
    }
}

/// Optional equality filters for `list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub signal_type: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleList {
    pub items: Vec<MetricSample>,
    /// Matches before the limit was applied
    pub total: usize,
}

/// Liveness of this subsystem only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureStatus {
    pub status: String,
    pub feature: String,
    pub measurement_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiReport {
    pub definition: KpiDefinition,
    pub latest: Option<KpiMeasurement>,
    pub status: Option<KpiStatus>,
}

// ----------------------------------------------------------------------------
// Service
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QueryService {
    samples: Arc<dyn SampleStore>,
    aggregates: Arc<dyn AggregateStore>,
    kpis: Arc<KpiStore>,
    registry: Arc<SignalRegistry>,
    analytics: WindowedAnalytics,
    gate: FeatureGate,
    clock: Arc<dyn Clock>,
}

impl QueryService {
    pub fn new(
        samples: Arc<dyn SampleStore>,
        aggregates: Arc<dyn AggregateStore>,
        kpis: Arc<KpiStore>,
        registry: Arc<SignalRegistry>,
        gate: FeatureGate,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let analytics = WindowedAnalytics::new(samples.clone(), registry.clone(), clock.clone());
        Self {
            samples,
            aggregates,
            kpis,
            registry,
            analytics,
            gate,
            clock,
        }
    }

    pub fn gate(&self) -> &FeatureGate {
        &self.gate
    }

    fn entity(raw: &str) -> MetricsResult<&str> {
        let entity = raw.trim();
        if entity.is_empty() {
            return Err(MetricsError::validation("entityId", "must not be empty"));
        }
        if entity.len() > MAX_ENTITY_ID_LENGTH {
            return Err(MetricsError::validation(
                "entityId",
                format!("must be at most {MAX_ENTITY_ID_LENGTH} characters"),
            ));
        }
        Ok(entity)
    }

    fn signal(&self, raw: &str) -> MetricsResult<SignalType> {
        Ok(self.registry.resolve(raw)?.tag.clone())
    }

    /// Newest sample of one series.
    pub async fn latest(&self, entity_id: &str, signal_type: &str) -> MetricsResult<MetricSample> {
        self.gate.ensure_enabled()?;
        let entity = Self::entity(entity_id)?;
        let signal = self.signal(signal_type)?;

        self.samples
            .latest(entity, &signal)
            .await?
            .ok_or_else(|| MetricsError::not_found(format!("latest {signal} sample for '{entity}'")))
    }

    /// Summary of one series over a look-back range. All zero when empty.
    pub async fn stats_by_range(&self, entity_id: &str, signal_type: &str, range: StatsRange) -> MetricsResult<SummaryStats> {
        self.gate.ensure_enabled()?;
        let entity = Self::entity(entity_id)?;
        let signal = self.signal(signal_type)?;

        let since = self.clock.now().sub_duration(range.as_duration());
        let filter = SampleFilter::new().entity(entity).signal(signal).since(since);
        let samples = self.samples.scan(&filter).await?;
        Ok(SummaryStats::from_values(samples.iter().map(|s| s.value)))
    }

    /// Rollup buckets newest first. `entity_id` may be `*` for the
    /// cross-entity series.
    pub async fn series(
        &self,
        entity_id: &str,
        signal_type: &str,
        granularity: Granularity,
        range: StatsRange,
        page: SeriesQuery,
    ) -> MetricsResult<Vec<AggregateBucket>> {
        self.gate.ensure_enabled()?;
        let entity = Self::entity(entity_id)?;
        let entity_scope = if entity == EntityScope::WILDCARD {
            EntityScope::All
        } else {
            EntityScope::entity(entity)
        };
        let signal = self.signal(signal_type)?;
        let limit = page.effective_limit()?;

        let from = granularity.bucket_start(self.clock.now().sub_duration(range.as_duration()));
        let buckets = self
            .aggregates
            .range(&BucketRange {
                entity_scope,
                signal_type: signal,
                granularity,
                from,
                before: page.before,
                limit,
            })
            .await?;

        debug!(
            target: targets::QUERY,
            entity,
            %granularity,
            %range,
            returned = buckets.len(),
            "Series served"
        );
        Ok(buckets)
    }

    /// Chronological list of matching samples with the unpaged total.
    pub async fn list(&self, filter: &ListFilter) -> MetricsResult<SampleList> {
        self.gate.ensure_enabled()?;

        let mut selection = SampleFilter::new();
        if let Some(entity) = filter.entity_id.as_deref().filter(|e| !e.trim().is_empty()) {
            selection = selection.entity(Self::entity(entity)?);
        }
        if let Some(signal) = filter.signal_type.as_deref().filter(|s| !s.trim().is_empty()) {
            selection = selection.signal(self.signal(signal)?);
        }

        let total = self.samples.count(&selection).await?;
        if let Some(limit) = filter.limit {
            selection = selection.limit(limit);
        }
        let items = self.samples.scan(&selection).await?;
        Ok(SampleList { items, total })
    }

    pub async fn windowed_stats(&self, window_minutes: f64, signal_type: Option<&str>) -> MetricsResult<WindowStats> {
        self.gate.ensure_enabled()?;
        self.analytics.windowed_stats(window_minutes, signal_type).await
    }

    pub async fn feature_status(&self) -> MetricsResult<FeatureStatus> {
        self.gate.ensure_enabled()?;
        Ok(FeatureStatus {
            status: "active".into(),
            feature: self.gate.name().to_owned(),
            measurement_count: self.samples.len().await?,
        })
    }

    /// Definition, newest measurement and its threshold classification.
    pub async fn kpi_status(&self, kpi_id: &str) -> MetricsResult<KpiReport> {
        self.gate.ensure_enabled()?;
        let kpi_id = kpi_id.trim();
        let definition = self
            .kpis
            .definition(kpi_id)
            .ok_or_else(|| MetricsError::not_found(format!("kpi '{kpi_id}'")))?;
        let latest = self.kpis.latest(kpi_id);
        let status = latest.as_ref().map(|m| definition.evaluate(m.value));
        Ok(KpiReport {
            definition,
            latest,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::tests::sample;
    use crate::store::{MemoryAggregateStore, MemorySampleStore};
    use crate::time::ManualClock;
    use crate::types::{KpiDirection, SampleId};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const NOW: i64 = 1_000_000;

    struct Fixture {
        query: QueryService,
        samples: Arc<MemorySampleStore>,
        aggregates: Arc<MemoryAggregateStore>,
        kpis: Arc<KpiStore>,
    }

    fn fixture() -> Fixture {
        let samples = Arc::new(MemorySampleStore::new());
        let aggregates = Arc::new(MemoryAggregateStore::new());
        let kpis = Arc::new(KpiStore::new());
        let query = QueryService::new(
            samples.clone(),
            aggregates.clone(),
            kpis.clone(),
            Arc::new(SignalRegistry::default()),
            FeatureGate::new(true),
            Arc::new(ManualClock::new(Timestamp::from_secs(NOW))),
        );
        Fixture {
            query,
            samples,
            aggregates,
            kpis,
        }
    }

    #[rstest]
    #[case("1h", StatsRange::OneHour)]
    #[case("24H", StatsRange::OneDay)]
    #[case(" 7d", StatsRange::SevenDays)]
    #[case("30d", StatsRange::ThirtyDays)]
    fn test_parse_range(#[case] text: &str, #[case] expected: StatsRange) {
        assert_eq!(text.parse::<StatsRange>().unwrap(), expected);
    }

    #[test]
    fn test_series_limit() {
        assert_eq!(SeriesQuery::default().effective_limit().unwrap(), 100);
        assert_eq!(SeriesQuery { limit: Some(500), before: None }.effective_limit().unwrap(), 100);
        assert_eq!(SeriesQuery { limit: Some(7), before: None }.effective_limit().unwrap(), 7);
        assert!(SeriesQuery { limit: Some(0), before: None }.effective_limit().is_err());
        assert!("2h".parse::<StatsRange>().is_err());
    }

    #[tokio::test]
    async fn test_latest_and_not_found() {
        let f = fixture();
        f.samples.insert_sample(sample("u1", "heart_rate", 60.0, NOW - 30)).unwrap();
        f.samples.insert_sample(sample("u1", "heart_rate", 64.0, NOW - 10)).unwrap();

        assert_eq!(f.query.latest("u1", "heart_rate").await.unwrap().value, 64.0);
        let err = f.query.latest("u2", "heart_rate").await.unwrap_err();
        assert!(matches!(err, MetricsError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_stats_by_range() {
        let f = fixture();
        f.samples.insert_sample(sample("u1", "eeg", 2.0, NOW - 60)).unwrap();
        f.samples.insert_sample(sample("u1", "eeg", 4.0, NOW - 120)).unwrap();
        f.samples.insert_sample(sample("u1", "eeg", 100.0, NOW - 7_200)).unwrap();

        let hour = f.query.stats_by_range("u1", "eeg", StatsRange::OneHour).await.unwrap();
        assert_eq!((hour.count, hour.avg, hour.min, hour.max), (2, 3.0, 2.0, 4.0));
        assert!((hour.stddev - std::f64::consts::SQRT_2).abs() < 1e-9);

        let day = f.query.stats_by_range("u1", "eeg", StatsRange::OneDay).await.unwrap();
        assert_eq!(day.count, 3);

        let empty = f.query.stats_by_range("u9", "eeg", StatsRange::ThirtyDays).await.unwrap();
        assert_eq!(empty, SummaryStats::EMPTY);
    }

    #[tokio::test]
    async fn test_series_is_descending_and_capped() {
        let f = fixture();
        let signal = SignalRegistry::default().resolve("eeg").unwrap().tag.clone();
        let now = Timestamp::from_secs(NOW);
        for i in 0..150 {
            f.aggregates
                .upsert(AggregateBucket {
                    entity_scope: EntityScope::All,
                    signal_type: signal.clone(),
                    granularity: Granularity::ONE_MINUTE,
                    bucket_start: Granularity::ONE_MINUTE.bucket_start(now.sub_duration(Duration::from_secs(60 * i))),
                    avg_value: i as f64,
                    min_value: i as f64,
                    max_value: i as f64,
                    sample_count: 1,
                })
                .await
                .unwrap();
        }

        let page = f
            .query
            .series("*", "eeg", Granularity::ONE_MINUTE, StatsRange::OneDay, SeriesQuery { limit: Some(1_000), before: None })
            .await
            .unwrap();
        assert_eq!(page.len(), 100);
        assert!(page.windows(2).all(|w| w[0].bucket_start > w[1].bucket_start));

        let next = f
            .query
            .series(
                "*",
                "eeg",
                Granularity::ONE_MINUTE,
                StatsRange::OneDay,
                SeriesQuery {
                    limit: None,
                    before: page.last().map(|b| b.bucket_start),
                },
            )
            .await
            .unwrap();
        assert_eq!(next.len(), 50);

        let hour = f
            .query
            .series("*", "eeg", Granularity::ONE_MINUTE, StatsRange::OneHour, SeriesQuery::default())
            .await
            .unwrap();
        assert!(hour.len() <= 61);
        assert!(f
            .query
            .series("u1", "eeg", Granularity::ONE_MINUTE, StatsRange::OneHour, SeriesQuery::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_list_round_trip() {
        let f = fixture();
        let stored = sample("u1", "eeg", 12.0, NOW - 5);
        f.samples.insert_sample(stored.clone()).unwrap();
        f.samples.insert_sample(sample("u2", "eeg", 1.0, NOW - 4)).unwrap();
        f.samples.insert_sample(sample("u1", "heart_rate", 70.0, NOW - 3)).unwrap();

        let list = f
            .query
            .list(&ListFilter {
                entity_id: Some("u1".into()),
                signal_type: Some("eeg".into()),
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(list.items, vec![stored]);
        assert_eq!(list.total, 1);

        let all = f.query.list(&ListFilter { limit: Some(2), ..Default::default() }).await.unwrap();
        assert_eq!((all.items.len(), all.total), (2, 3));
        assert!(all.items[0].timestamp <= all.items[1].timestamp);
    }

    #[tokio::test]
    async fn test_kpi_status() {
        let f = fixture();
        f.kpis
            .define(KpiDefinition {
                id: "p99_latency".into(),
                name: "p99 latency".into(),
                unit: Some("ms".into()),
                target: Some(100.0),
                warning_threshold: Some(200.0),
                critical_threshold: Some(500.0),
                direction: KpiDirection::LowerIsBetter,
            })
            .unwrap();

        let report = f.query.kpi_status("p99_latency").await.unwrap();
        assert_eq!((report.latest, report.status), (None, None));

        f.kpis
            .record(KpiMeasurement {
                id: SampleId::generate(),
                kpi_id: "p99_latency".into(),
                value: 250.0,
                dimensions: Default::default(),
                timestamp: Timestamp::from_secs(NOW),
            })
            .unwrap();
        assert_eq!(f.query.kpi_status("p99_latency").await.unwrap().status, Some(KpiStatus::Warning));
        assert!(f.query.kpi_status("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_disabled_gate_blocks_every_read() {
        let f = fixture();
        f.query.gate().set_enabled(false);

        let disabled = |e: MetricsError| matches!(e, MetricsError::FeatureDisabled { .. });
        assert!(disabled(f.query.latest("u1", "eeg").await.unwrap_err()));
        assert!(disabled(f.query.list(&ListFilter::default()).await.unwrap_err()));
        assert!(disabled(f.query.windowed_stats(60.0, None).await.unwrap_err()));
        assert!(disabled(f.query.feature_status().await.unwrap_err()));
        assert!(disabled(
            f.query.stats_by_range("u1", "eeg", StatsRange::OneHour).await.unwrap_err()
        ));

        f.query.gate().set_enabled(true);
        let status = f.query.feature_status().await.unwrap();
        assert_eq!(status.status, "active");
        assert_eq!(status.feature, FEATURE_NAME);
    }
}
