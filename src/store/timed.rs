// ----------------------------------------------------------------------------
// Bounded Store Calls
// ----------------------------------------------------------------------------
// No store call may hang its caller: every operation is raced against a
// timeout and expiry surfaces as a retryable `StoreUnavailable`.
// ----------------------------------------------------------------------------

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{AggregateStore, BucketRange, SampleFilter, SampleStore};
use crate::error::{MetricsError, MetricsResult};
use crate::logging::targets;
use crate::time::Timestamp;
use crate::types::{AggregateBucket, BucketKey, MetricSample, SampleId, SampleTable, SignalType};

async fn bounded<T>(
    timeout: Duration,
    operation: &'static str,
    call: impl Future<Output = MetricsResult<T>> + Send,
) -> MetricsResult<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                target: targets::STORE,
                operation,
                timeout_ms = timeout.as_millis() as u64,
                "Store call timed out"
            );
            Err(MetricsError::store_unavailable(
                operation,
                format!("timed out after {}ms", timeout.as_millis()),
            ))
        }
    }
}

/// Sample store wrapper applying a per-call timeout.
#[derive(Debug, Clone)]
pub struct TimedSampleStore {
    inner: Arc<dyn SampleStore>,
    timeout: Duration,
}

impl TimedSampleStore {
    pub fn new(inner: Arc<dyn SampleStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl SampleStore for TimedSampleStore {
    async fn insert(&self, sample: MetricSample) -> MetricsResult<()> {
        bounded(self.timeout, "insert", self.inner.insert(sample)).await
    }

    async fn get(&self, id: SampleId) -> MetricsResult<Option<MetricSample>> {
        bounded(self.timeout, "get", self.inner.get(id)).await
    }

    async fn scan(&self, filter: &SampleFilter) -> MetricsResult<Vec<MetricSample>> {
        bounded(self.timeout, "scan", self.inner.scan(filter)).await
    }

    async fn latest(&self, entity_id: &str, signal_type: &SignalType) -> MetricsResult<Option<MetricSample>> {
        bounded(self.timeout, "latest", self.inner.latest(entity_id, signal_type)).await
    }

    async fn count(&self, filter: &SampleFilter) -> MetricsResult<usize> {
        bounded(self.timeout, "count", self.inner.count(filter)).await
    }

    async fn purge_before(&self, table: SampleTable, cutoff: Timestamp) -> MetricsResult<usize> {
        bounded(self.timeout, "purge", self.inner.purge_before(table, cutoff)).await
    }

    async fn len(&self) -> MetricsResult<usize> {
        bounded(self.timeout, "len", self.inner.len()).await
    }
}

/// Aggregate store wrapper applying a per-call timeout.
#[derive(Debug, Clone)]
pub struct TimedAggregateStore {
    inner: Arc<dyn AggregateStore>,
    timeout: Duration,
}

impl TimedAggregateStore {
    pub fn new(inner: Arc<dyn AggregateStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl AggregateStore for TimedAggregateStore {
    async fn upsert(&self, bucket: AggregateBucket) -> MetricsResult<()> {
        bounded(self.timeout, "upsert_bucket", self.inner.upsert(bucket)).await
    }

    async fn get(&self, key: &BucketKey) -> MetricsResult<Option<AggregateBucket>> {
        bounded(self.timeout, "get_bucket", self.inner.get(key)).await
    }

    async fn range(&self, range: &BucketRange) -> MetricsResult<Vec<AggregateBucket>> {
        bounded(self.timeout, "range_buckets", self.inner.range(range)).await
    }

    async fn purge_before(&self, cutoff: Timestamp) -> MetricsResult<usize> {
        bounded(self.timeout, "purge_buckets", self.inner.purge_before(cutoff)).await
    }

    async fn len(&self) -> MetricsResult<usize> {
        bounded(self.timeout, "count_buckets", self.inner.len()).await
    }
}
