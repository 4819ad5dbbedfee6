// ----------------------------------------------------------------------------
// In-Memory Aggregate Store
// ----------------------------------------------------------------------------

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{AggregateStore, BucketRange};
use crate::error::MetricsResult;
use crate::time::Timestamp;
use crate::types::{AggregateBucket, BucketKey};

/// Rollup rows ordered by `(scope, signal, granularity, bucket_start)`, so one
/// series is a contiguous key range.
#[derive(Debug, Default)]
pub struct MemoryAggregateStore {
    buckets: RwLock<BTreeMap<BucketKey, AggregateBucket>>,
}

impl MemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row, in key order.
    pub fn snapshot(&self) -> Vec<AggregateBucket> {
        self.buckets.read().values().cloned().collect()
    }
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
    async fn upsert(&self, bucket: AggregateBucket) -> MetricsResult<()> {
        self.buckets.write().insert(bucket.key(), bucket);
        Ok(())
    }

    async fn get(&self, key: &BucketKey) -> MetricsResult<Option<AggregateBucket>> {
        Ok(self.buckets.read().get(key).cloned())
    }

    async fn range(&self, range: &BucketRange) -> MetricsResult<Vec<AggregateBucket>> {
        let key = |bucket_start| BucketKey {
            entity_scope: range.entity_scope.clone(),
            signal_type: range.signal_type.clone(),
            granularity: range.granularity,
            bucket_start,
        };
        let upper = range.before.unwrap_or(Timestamp::MAX);
        if range.from >= upper || range.limit == 0 {
            return Ok(Vec::new());
        }

        let buckets = self.buckets.read();
        Ok(buckets
            .range(key(range.from)..key(upper))
            .rev()
            .take(range.limit)
            .map(|(_, bucket)| bucket.clone())
            .collect())
    }

    async fn purge_before(&self, cutoff: Timestamp) -> MetricsResult<usize> {
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|key, _| key.bucket_start >= cutoff);
        Ok(before - buckets.len())
    }

    async fn len(&self) -> MetricsResult<usize> {
        Ok(self.buckets.read().len())
    }
}
