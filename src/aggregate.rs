// ============================================================================
// CONTINUOUS AGGREGATE MAINTAINER
// ============================================================================
// Keeps fixed-granularity rollups approximately in sync with raw samples.
// Each pass recomputes (never merges) every bucket whose start lies in the
// backfill window `[now - start_offset, now - end_offset]` and upserts it.
// Buckets older than the window are final: samples arriving after their
// window closed do not correct them.
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::analytics::SummaryStats;
use crate::config::RollupConfig;
use crate::error::{MetricsError, MetricsResult};
use crate::logging::targets;
use crate::scheduler::{JobKey, PeriodicJob};
use crate::store::{AggregateStore, SampleFilter, SampleStore};
use crate::telemetry::EngineMetrics;
use crate::time::{Granularity, Timestamp};
use crate::types::{AggregateBucket, EntityScope, MetricSample, SignalType};

/// Scheduler table name shared by every rollup job.
pub const AGGREGATES_TABLE: &str = "aggregates";

// ----------------------------------------------------------------------------
// Refresh Policy
// ----------------------------------------------------------------------------

/// One granularity and how it is refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollupSpec {
    pub granularity: Granularity,
    pub every: Duration,
    pub start_offset: Duration,
    pub end_offset: Duration,
}

impl RollupSpec {
    pub fn new(granularity: Granularity, every: Duration, start_offset: Duration, end_offset: Duration) -> MetricsResult<Self> {
        if every.is_zero() {
            return Err(MetricsError::validation("every", "rollup period must be positive"));
        }
        if end_offset >= start_offset {
            return Err(MetricsError::validation(
                "end_offset",
                format!(
                    "end offset {} must be smaller than start offset {}",
                    humantime::format_duration(end_offset),
                    humantime::format_duration(start_offset)
                ),
            ));
        }
        Ok(Self {
            granularity,
            every,
            start_offset,
            end_offset,
        })
    }
}

impl TryFrom<&RollupConfig> for RollupSpec {
    type Error = MetricsError;

    fn try_from(config: &RollupConfig) -> Result<Self, Self::Error> {
        RollupSpec::new(config.granularity, config.every, config.start_offset, config.end_offset)
    }
}

/// Bucket starts revisited by one pass, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillWindow {
    pub first_bucket: Timestamp,
    pub last_bucket: Timestamp,
    pub granularity: Granularity,
}

impl BackfillWindow {
    pub fn compute(now: Timestamp, spec: &RollupSpec) -> Self {
        let granularity = spec.granularity;
        Self {
            first_bucket: granularity.bucket_start(now.sub_duration(spec.start_offset)),
            last_bucket: granularity.bucket_start(now.sub_duration(spec.end_offset)),
            granularity,
        }
    }

    /// Raw sample range feeding the window: `[first_bucket, last_bucket + granularity)`.
    pub fn sample_range(&self) -> (Timestamp, Timestamp) {
        (
            self.first_bucket,
            self.last_bucket.add_duration(self.granularity.as_duration()),
        )
    }

    pub fn contains_bucket(&self, bucket_start: Timestamp) -> bool {
        bucket_start >= self.first_bucket && bucket_start <= self.last_bucket
    }

    pub fn bucket_count(&self) -> u64 {
        if self.last_bucket < self.first_bucket {
            return 0;
        }
        let span = self.last_bucket.as_nanos() - self.first_bucket.as_nanos();
        (span / self.granularity.as_nanos()) as u64 + 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub window: BackfillWindow,
    pub samples_scanned: usize,
    pub buckets_upserted: usize,
    pub elapsed_ms: u64,
}

// ----------------------------------------------------------------------------
// Maintainer
// ----------------------------------------------------------------------------

type GroupKey = (EntityScope, SignalType, Timestamp);

/// The only writer of aggregate buckets, one instance per granularity.
#[derive(Debug, Clone)]
pub struct ContinuousAggregateMaintainer {
    samples: Arc<dyn SampleStore>,
    aggregates: Arc<dyn AggregateStore>,
    spec: RollupSpec,
    wildcard_scope: bool,
    metrics: EngineMetrics,
}

impl ContinuousAggregateMaintainer {
    pub fn new(
        samples: Arc<dyn SampleStore>,
        aggregates: Arc<dyn AggregateStore>,
        spec: RollupSpec,
        wildcard_scope: bool,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            samples,
            aggregates,
            spec,
            wildcard_scope,
            metrics,
        }
    }

    pub fn spec(&self) -> &RollupSpec {
        &self.spec
    }

    /// Recompute and upsert every non-empty bucket of the backfill window.
    pub async fn run_pass(&self, now: Timestamp) -> MetricsResult<PassReport> {
        let started = Instant::now();
        let window = BackfillWindow::compute(now, &self.spec);
        let (from, until) = window.sample_range();

        let samples = self.samples.scan(&SampleFilter::new().since(from).until(until)).await?;
        let buckets = self.rollup(&samples);

        let granularity = self.spec.granularity;
        let mut upserted = 0;
        for bucket in buckets {
            self.aggregates.upsert(bucket).await?;
            upserted += 1;
        }
        self.metrics.record_buckets(&granularity.label(), upserted);

        let report = PassReport {
            window,
            samples_scanned: samples.len(),
            buckets_upserted: upserted,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        debug!(
            target: targets::AGGREGATE,
            %granularity,
            first = %window.first_bucket,
            last = %window.last_bucket,
            samples = report.samples_scanned,
            buckets = report.buckets_upserted,
            "Aggregate pass complete"
        );
        Ok(report)
    }

    /// Group samples by bucket and compute each bucket from scratch.
    fn rollup(&self, samples: &[MetricSample]) -> Vec<AggregateBucket> {
        let granularity = self.spec.granularity;
        let mut groups: BTreeMap<GroupKey, Vec<f64>> = BTreeMap::new();

        for sample in samples {
            let bucket_start = granularity.bucket_start(sample.timestamp);
            groups
                .entry((
                    EntityScope::entity(sample.entity_id.clone()),
                    sample.signal_type.clone(),
                    bucket_start,
                ))
                .or_default()
                .push(sample.value);
            if self.wildcard_scope {
                groups
                    .entry((EntityScope::All, sample.signal_type.clone(), bucket_start))
                    .or_default()
                    .push(sample.value);
            }
        }

        groups
            .into_iter()
            .map(|((entity_scope, signal_type, bucket_start), values)| {
                let stats = SummaryStats::from_values(values);
                AggregateBucket {
                    entity_scope,
                    signal_type,
                    granularity,
                    bucket_start,
                    avg_value: stats.avg,
                    min_value: stats.min,
                    max_value: stats.max,
                    sample_count: stats.count,
                }
            })
            .collect()
    }
}

#[async_trait]
impl PeriodicJob for ContinuousAggregateMaintainer {
    fn key(&self) -> JobKey {
        JobKey::new(AGGREGATES_TABLE, self.spec.granularity.label())
    }

    fn period(&self) -> Duration {
        self.spec.every
    }

    async fn tick(&self, now: Timestamp) -> MetricsResult<()> {
        match self.run_pass(now).await {
            Ok(report) if report.buckets_upserted > 0 => {
                info!(
                    target: targets::AGGREGATE,
                    granularity = %self.spec.granularity,
                    buckets = report.buckets_upserted,
                    elapsed_ms = report.elapsed_ms,
                    "Rollups refreshed"
                );
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                let window = BackfillWindow::compute(now, &self.spec);
                warn!(
                    target: targets::AGGREGATE,
                    table = AGGREGATES_TABLE,
                    granularity = %self.spec.granularity,
                    first = %window.first_bucket,
                    last = %window.last_bucket,
                    error = %e,
                    "Aggregate pass failed"
                );
                Err(e)
            }
        }
    }
}
