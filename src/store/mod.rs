// ============================================================================
// PERSISTENCE LAYER
// ============================================================================
// Storage seams for the core:
// - `SampleStore`: append-only raw samples, indexed by
//   (entity, signal, timestamp, id) with a per-table time index
// - `AggregateStore`: rollup buckets keyed by BucketKey, whole-row upsert
// - `KpiStore`: KPI definitions and their measurements
// - `Timed*` wrappers bounding every call with a timeout
// ============================================================================

use std::fmt::Debug;

use async_trait::async_trait;
use compact_str::CompactString;

use crate::error::MetricsResult;
use crate::time::{Granularity, Timestamp};
use crate::types::{AggregateBucket, BucketKey, EntityScope, MetricSample, SampleId, SampleTable, SignalType};

pub mod aggregate;
pub mod kpi;
pub mod log;
pub mod memory;
pub mod timed;

pub use aggregate::MemoryAggregateStore;
pub use kpi::KpiStore;
pub use log::LogSampleStore;
pub use memory::MemorySampleStore;
pub use timed::{TimedAggregateStore, TimedSampleStore};

// ----------------------------------------------------------------------------
// Sample Filter
// ----------------------------------------------------------------------------

/// Selection over raw samples. Time bounds are `[since, until)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleFilter {
    pub entity_id: Option<CompactString>,
    pub signal_type: Option<SignalType>,
    pub table: Option<SampleTable>,
    pub since: Option<Timestamp>,
    pub until: Option<Timestamp>,
    pub limit: Option<usize>,
}

impl SampleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, entity_id: impl Into<CompactString>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn signal(mut self, signal_type: SignalType) -> Self {
        self.signal_type = Some(signal_type);
        self
    }

    pub fn table(mut self, table: SampleTable) -> Self {
        self.table = Some(table);
        self
    }

    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: Timestamp) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Lower and upper time bounds with open ends filled in.
    #[inline]
    pub fn time_bounds(&self) -> (Timestamp, Timestamp) {
        (self.since.unwrap_or(Timestamp::MIN), self.until.unwrap_or(Timestamp::MAX))
    }

    /// Whether `sample` satisfies every predicate (the limit is not a predicate).
    pub fn matches(&self, sample: &MetricSample) -> bool {
        let (since, until) = self.time_bounds();
        sample.timestamp.is_within(since, until)
            && self.entity_id.as_ref().map_or(true, |e| *e == sample.entity_id)
            && self.signal_type.as_ref().map_or(true, |s| *s == sample.signal_type)
            && self.table.map_or(true, |t| t == sample.table)
    }
}

// ----------------------------------------------------------------------------
// Sample Store
// ----------------------------------------------------------------------------

/// Durable, append-only sample storage. Samples are never updated in place.
/// Implementations doing file or network I/O must yield while waiting on it
/// (`spawn_blocking` or async I/O), otherwise timeouts cannot fire.
#[async_trait]
pub trait SampleStore: Send + Sync + Debug {
    /// Append one sample. Fails if the id is already present.
    async fn insert(&self, sample: MetricSample) -> MetricsResult<()>;

    async fn get(&self, id: SampleId) -> MetricsResult<Option<MetricSample>>;

    /// Matching samples ordered by `(timestamp, sample_id)`, truncated to the
    /// filter's limit.
    async fn scan(&self, filter: &SampleFilter) -> MetricsResult<Vec<MetricSample>>;

    /// Newest sample of one series.
    async fn latest(&self, entity_id: &str, signal_type: &SignalType) -> MetricsResult<Option<MetricSample>>;

    /// Number of matching samples, ignoring the limit.
    async fn count(&self, filter: &SampleFilter) -> MetricsResult<usize>;

    /// Delete every sample of `table` with `timestamp < cutoff`.
    async fn purge_before(&self, table: SampleTable, cutoff: Timestamp) -> MetricsResult<usize>;

    async fn len(&self) -> MetricsResult<usize>;
}

// ----------------------------------------------------------------------------
// Aggregate Store
// ----------------------------------------------------------------------------

/// Page request over one rollup series, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketRange {
    pub entity_scope: EntityScope,
    pub signal_type: SignalType,
    pub granularity: Granularity,
    /// Oldest bucket start included
    pub from: Timestamp,
    /// Only buckets starting strictly before this
    pub before: Option<Timestamp>,
    pub limit: usize,
}

/// Rollup storage. Only the aggregate maintainer writes, only retention deletes.
#[async_trait]
pub trait AggregateStore: Send + Sync + Debug {
    /// Insert or replace the whole bucket row.
    async fn upsert(&self, bucket: AggregateBucket) -> MetricsResult<()>;

    async fn get(&self, key: &BucketKey) -> MetricsResult<Option<AggregateBucket>>;

    /// Buckets ordered descending by `bucket_start`.
    async fn range(&self, range: &BucketRange) -> MetricsResult<Vec<AggregateBucket>>;

    /// Delete buckets with `bucket_start < cutoff`.
    async fn purge_before(&self, cutoff: Timestamp) -> MetricsResult<usize>;

    async fn len(&self) -> MetricsResult<usize>;
}
