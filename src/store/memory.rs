// ----------------------------------------------------------------------------
// In-Memory Sample Store
// ----------------------------------------------------------------------------
// Primary index: (entity, signal, timestamp, id) -> sample.
// Secondary indexes: id -> key, and per table (timestamp, id) -> key, which
// serves retention purges and scans that are not pinned to one series.
// ----------------------------------------------------------------------------

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use async_trait::async_trait;
use compact_str::CompactString;
use parking_lot::RwLock;

use super::{SampleFilter, SampleStore};
use crate::error::{MetricsError, MetricsResult};
use crate::time::Timestamp;
use crate::types::{MetricSample, SampleId, SampleKey, SampleTable, SignalType};

type TimeKey = (Timestamp, SampleId);

#[derive(Debug, Default)]
struct Indexes {
    primary: BTreeMap<SampleKey, MetricSample>,
    by_id: HashMap<SampleId, SampleKey>,
    by_time: HashMap<SampleTable, BTreeMap<TimeKey, SampleKey>>,
}

impl Indexes {
    fn series_bounds(
        entity_id: &str,
        signal_type: &SignalType,
        since: Timestamp,
        until: Timestamp,
    ) -> (Bound<SampleKey>, Bound<SampleKey>) {
        let key = |timestamp| SampleKey {
            entity_id: CompactString::from(entity_id),
            signal_type: signal_type.clone(),
            timestamp,
            sample_id: SampleId::MIN,
        };
        (Bound::Included(key(since)), Bound::Excluded(key(until)))
    }

    /// Matching samples in (timestamp, id) order, without the limit applied.
    fn select<'a>(&'a self, filter: &'a SampleFilter) -> Box<dyn Iterator<Item = &'a MetricSample> + 'a> {
        let (since, until) = filter.time_bounds();
        if since >= until {
            return Box::new(std::iter::empty());
        }

        // Pinned to one series: walk the primary index directly.
        if let (Some(entity), Some(signal)) = (&filter.entity_id, &filter.signal_type) {
            let bounds = Self::series_bounds(entity, signal, since, until);
            return Box::new(
                self.primary
                    .range(bounds)
                    .map(|(_, sample)| sample)
                    .filter(move |sample| filter.matches(sample)),
            );
        }

        let lower = (since, SampleId::MIN);
        let upper = (until, SampleId::MIN);
        let tables: Vec<&BTreeMap<TimeKey, SampleKey>> = match filter.table {
            Some(table) => self.by_time.get(&table).into_iter().collect(),
            None => self.by_time.values().collect(),
        };

        if let [only] = tables[..] {
            return Box::new(
                only.range(lower..upper)
                    .filter_map(move |(_, key)| self.primary.get(key))
                    .filter(move |sample| filter.matches(sample)),
            );
        }

        let mut merged: Vec<(&TimeKey, &SampleKey)> = tables.iter().flat_map(|t| t.range(lower..upper)).collect();
        merged.sort_unstable_by(|a, b| a.0.cmp(b.0));
        Box::new(
            merged
                .into_iter()
                .filter_map(move |(_, key)| self.primary.get(key))
                .filter(move |sample| filter.matches(sample)),
        )
    }
}

/// Volatile sample store. Also the replay target of [`super::LogSampleStore`].
#[derive(Debug, Default)]
pub struct MemorySampleStore {
    indexes: RwLock<Indexes>,
}

impl MemorySampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: SampleId) -> bool {
        self.indexes.read().by_id.contains_key(&id)
    }

    pub fn insert_sample(&self, sample: MetricSample) -> MetricsResult<()> {
        let mut indexes = self.indexes.write();
        if indexes.by_id.contains_key(&sample.sample_id) {
            return Err(MetricsError::validation(
                "sampleId",
                format!("sample {} already exists", sample.sample_id),
            ));
        }

        let key = sample.key();
        indexes.by_id.insert(sample.sample_id, key.clone());
        indexes
            .by_time
            .entry(sample.table)
            .or_default()
            .insert((sample.timestamp, sample.sample_id), key.clone());
        indexes.primary.insert(key, sample);
        Ok(())
    }

    pub fn get_sample(&self, id: SampleId) -> Option<MetricSample> {
        let indexes = self.indexes.read();
        let key = indexes.by_id.get(&id)?;
        indexes.primary.get(key).cloned()
    }

    pub fn scan_samples(&self, filter: &SampleFilter) -> Vec<MetricSample> {
        let indexes = self.indexes.read();
        let matches = indexes.select(filter).cloned();
        match filter.limit {
            Some(limit) => matches.take(limit).collect(),
            None => matches.collect(),
        }
    }

    pub fn count_samples(&self, filter: &SampleFilter) -> usize {
        self.indexes.read().select(filter).count()
    }

    pub fn latest_sample(&self, entity_id: &str, signal_type: &SignalType) -> Option<MetricSample> {
        let indexes = self.indexes.read();
        let key = |timestamp, sample_id| SampleKey {
            entity_id: CompactString::from(entity_id),
            signal_type: signal_type.clone(),
            timestamp,
            sample_id,
        };
        indexes
            .primary
            .range(key(Timestamp::MIN, SampleId::MIN)..=key(Timestamp::MAX, SampleId::MAX))
            .next_back()
            .map(|(_, sample)| sample.clone())
    }

    /// Remove every sample of `table` older than `cutoff`.
    pub fn purge_samples(&self, table: SampleTable, cutoff: Timestamp) -> usize {
        let mut indexes = self.indexes.write();
        let Some(time_index) = indexes.by_time.get_mut(&table) else {
            return 0;
        };

        let retained = time_index.split_off(&(cutoff, SampleId::MIN));
        let expired = std::mem::replace(time_index, retained);

        for ((_, id), key) in &expired {
            indexes.by_id.remove(id);
            indexes.primary.remove(key);
        }
        expired.len()
    }

    pub fn sample_count(&self) -> usize {
        self.indexes.read().primary.len()
    }
}

#[async_trait]
impl SampleStore for MemorySampleStore {
    async fn insert(&self, sample: MetricSample) -> MetricsResult<()> {
        self.insert_sample(sample)
    }

    async fn get(&self, id: SampleId) -> MetricsResult<Option<MetricSample>> {
        Ok(self.get_sample(id))
    }

    async fn scan(&self, filter: &SampleFilter) -> MetricsResult<Vec<MetricSample>> {
        Ok(self.scan_samples(filter))
    }

    async fn latest(&self, entity_id: &str, signal_type: &SignalType) -> MetricsResult<Option<MetricSample>> {
        Ok(self.latest_sample(entity_id, signal_type))
    }

    async fn count(&self, filter: &SampleFilter) -> MetricsResult<usize> {
        Ok(self.count_samples(filter))
    }

    async fn purge_before(&self, table: SampleTable, cutoff: Timestamp) -> MetricsResult<usize> {
        Ok(self.purge_samples(table, cutoff))
    }

    async fn len(&self) -> MetricsResult<usize> {
        Ok(self.sample_count())
    }
}
