// ----------------------------------------------------------------------------
// KPI Store
// ----------------------------------------------------------------------------
// Definitions are managed externally and only looked up here; measurements
// must reference an existing definition, and deleting a definition removes
// its measurements.
// ----------------------------------------------------------------------------

use std::collections::BTreeMap;

use compact_str::CompactString;
use parking_lot::RwLock;

use crate::error::{MetricsError, MetricsResult};
use crate::time::Timestamp;
use crate::types::{KpiDefinition, KpiMeasurement, SampleId};

type MeasurementKey = (CompactString, Timestamp, SampleId);

#[derive(Debug, Default)]
struct KpiTables {
    definitions: BTreeMap<CompactString, KpiDefinition>,
    measurements: BTreeMap<MeasurementKey, KpiMeasurement>,
}

#[derive(Debug, Default)]
pub struct KpiStore {
    tables: RwLock<KpiTables>,
}

impl KpiStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a definition.
    pub fn define(&self, definition: KpiDefinition) -> MetricsResult<()> {
        definition.validate()?;
        self.tables.write().definitions.insert(definition.id.clone(), definition);
        Ok(())
    }

    pub fn definition(&self, kpi_id: &str) -> Option<KpiDefinition> {
        self.tables.read().definitions.get(kpi_id).cloned()
    }

    pub fn definitions(&self) -> Vec<KpiDefinition> {
        self.tables.read().definitions.values().cloned().collect()
    }

    /// Delete a definition and every measurement that references it. Returns
    /// the number of measurements removed.
    pub fn delete_definition(&self, kpi_id: &str) -> MetricsResult<usize> {
        let mut tables = self.tables.write();
        if tables.definitions.remove(kpi_id).is_none() {
            return Err(MetricsError::not_found(format!("kpi '{kpi_id}'")));
        }
        let before = tables.measurements.len();
        tables.measurements.retain(|(id, _, _), _| id.as_str() != kpi_id);
        Ok(before - tables.measurements.len())
    }

    pub fn record(&self, measurement: KpiMeasurement) -> MetricsResult<()> {
        let mut tables = self.tables.write();
        if !tables.definitions.contains_key(&measurement.kpi_id) {
            return Err(MetricsError::validation(
                "kpiId",
                format!("unknown kpi '{}'", measurement.kpi_id),
            ));
        }
        let key = (measurement.kpi_id.clone(), measurement.timestamp, measurement.id);
        tables.measurements.insert(key, measurement);
        Ok(())
    }

    /// Measurements of one KPI at or after `since`, oldest first.
    pub fn measurements(&self, kpi_id: &str, since: Timestamp) -> Vec<KpiMeasurement> {
        let id = CompactString::from(kpi_id);
        let lower = (id.clone(), since, SampleId::MIN);
        let upper = (id, Timestamp::MAX, SampleId::MAX);
        self.tables
            .read()
            .measurements
            .range(lower..=upper)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn latest(&self, kpi_id: &str) -> Option<KpiMeasurement> {
        let id = CompactString::from(kpi_id);
        let lower = (id.clone(), Timestamp::MIN, SampleId::MIN);
        let upper = (id, Timestamp::MAX, SampleId::MAX);
        self.tables
            .read()
            .measurements
            .range(lower..=upper)
            .next_back()
            .map(|(_, m)| m.clone())
    }

    /// Delete measurements with `timestamp < cutoff`.
    pub fn purge_before(&self, cutoff: Timestamp) -> usize {
        let mut tables = self.tables.write();
        let before = tables.measurements.len();
        tables.measurements.retain(|(_, ts, _), _| *ts >= cutoff);
        before - tables.measurements.len()
    }

    pub fn measurement_count(&self) -> usize {
        self.tables.read().measurements.len()
    }
}
