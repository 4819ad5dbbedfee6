// ============================================================================
// RETENTION ENFORCER
// ============================================================================
// Age-based eviction. Each table has a horizon; a sweep deletes every row
// with `timestamp < now - horizon` (buckets by `bucket_start`) and never
// touches anything newer. One periodic job per table, each single-flight.
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RetentionConfig;
use crate::error::{MetricsError, MetricsResult};
use crate::logging::targets;
use crate::scheduler::{JobKey, PeriodicJob};
use crate::store::{AggregateStore, KpiStore, SampleStore};
use crate::telemetry::EngineMetrics;
use crate::time::Timestamp;
use crate::types::SampleTable;

/// Scheduler lane of every retention job.
pub const RETENTION_LANE: &str = "retention";

// ----------------------------------------------------------------------------
// Tables & Policies
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionTable {
    Events,
    Biofeedback,
    SystemMetrics,
    KpiMeasurements,
    Aggregates,
}

impl RetentionTable {
    pub const ALL: [RetentionTable; 5] = [
        RetentionTable::Events,
        RetentionTable::Biofeedback,
        RetentionTable::SystemMetrics,
        RetentionTable::KpiMeasurements,
        RetentionTable::Aggregates,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionTable::Events => SampleTable::Events.as_str(),
            RetentionTable::Biofeedback => SampleTable::Biofeedback.as_str(),
            RetentionTable::SystemMetrics => SampleTable::SystemMetrics.as_str(),
            RetentionTable::KpiMeasurements => "kpi_measurements",
            RetentionTable::Aggregates => "aggregates",
        }
    }

    /// The raw sample table behind this entry, if any.
    pub fn sample_table(&self) -> Option<SampleTable> {
        match self {
            RetentionTable::Events => Some(SampleTable::Events),
            RetentionTable::Biofeedback => Some(SampleTable::Biofeedback),
            RetentionTable::SystemMetrics => Some(SampleTable::SystemMetrics),
            RetentionTable::KpiMeasurements | RetentionTable::Aggregates => None,
        }
    }
}

impl Display for RetentionTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maximum age of the rows kept in one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub table: RetentionTable,
    #[serde(with = "humantime_serde")]
    pub horizon: Duration,
}

impl RetentionPolicy {
    pub fn new(table: RetentionTable, horizon: Duration) -> Self {
        Self { table, horizon }
    }

    #[inline]
    pub fn cutoff(&self, now: Timestamp) -> Timestamp {
        now.sub_duration(self.horizon)
    }

    pub fn from_config(config: &RetentionConfig) -> Vec<RetentionPolicy> {
        vec![
            RetentionPolicy::new(RetentionTable::Events, config.events),
            RetentionPolicy::new(RetentionTable::Biofeedback, config.biofeedback),
            RetentionPolicy::new(RetentionTable::SystemMetrics, config.system_metrics),
            RetentionPolicy::new(RetentionTable::KpiMeasurements, config.kpi_measurements),
            RetentionPolicy::new(RetentionTable::Aggregates, config.aggregates),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub table: RetentionTable,
    pub cutoff: Timestamp,
    pub purged: usize,
    pub elapsed_ms: u64,
}

// ----------------------------------------------------------------------------
// Enforcer
// ----------------------------------------------------------------------------

/// The only component that deletes rows.
#[derive(Debug)]
pub struct RetentionEnforcer {
    samples: Arc<dyn SampleStore>,
    aggregates: Arc<dyn AggregateStore>,
    kpis: Arc<KpiStore>,
    policies: Vec<RetentionPolicy>,
    metrics: EngineMetrics,
}

impl RetentionEnforcer {
    pub fn new(
        samples: Arc<dyn SampleStore>,
        aggregates: Arc<dyn AggregateStore>,
        kpis: Arc<KpiStore>,
        policies: Vec<RetentionPolicy>,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            samples,
            aggregates,
            kpis,
            policies,
            metrics,
        }
    }

    pub fn policies(&self) -> &[RetentionPolicy] {
        &self.policies
    }

    pub fn policy(&self, table: RetentionTable) -> Option<&RetentionPolicy> {
        self.policies.iter().find(|p| p.table == table)
    }

    /// Delete every row of `table` older than its horizon.
    pub async fn sweep(&self, table: RetentionTable, now: Timestamp) -> MetricsResult<SweepReport> {
        let policy = self
            .policy(table)
            .ok_or_else(|| MetricsError::not_found(format!("retention policy for {table}")))?;
        let cutoff = policy.cutoff(now);
        let started = Instant::now();

        let purged = match table.sample_table() {
            Some(sample_table) => self.samples.purge_before(sample_table, cutoff).await?,
            None if table == RetentionTable::Aggregates => self.aggregates.purge_before(cutoff).await?,
            None => self.kpis.purge_before(cutoff),
        };
        self.metrics.record_purged(table.as_str(), purged);

        let report = SweepReport {
            table,
            cutoff,
            purged,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        if purged > 0 {
            info!(
                target: targets::RETENTION,
                %table,
                %cutoff,
                purged,
                elapsed_ms = report.elapsed_ms,
                "Retention sweep removed expired rows"
            );
        }
        Ok(report)
    }

    /// Sweep every table with a policy, in policy order.
    pub async fn sweep_all(&self, now: Timestamp) -> MetricsResult<Vec<SweepReport>> {
        let mut reports = Vec::with_capacity(self.policies.len());
        for policy in &self.policies {
            reports.push(self.sweep(policy.table, now).await?);
        }
        Ok(reports)
    }

    /// One periodic job per policy.
    pub fn jobs(self: &Arc<Self>, period: Duration) -> Vec<Arc<dyn PeriodicJob>> {
        self.policies
            .iter()
            .map(|p| {
                Arc::new(RetentionJob {
                    enforcer: self.clone(),
                    table: p.table,
                    period,
                }) as Arc<dyn PeriodicJob>
            })
            .collect()
    }
}

/// Scheduled sweep of a single table.
#[derive(Debug)]
pub struct RetentionJob {
    enforcer: Arc<RetentionEnforcer>,
    table: RetentionTable,
    period: Duration,
}

#[async_trait]
impl PeriodicJob for RetentionJob {
    fn key(&self) -> JobKey {
        JobKey::new(self.table.as_str(), RETENTION_LANE)
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn tick(&self, now: Timestamp) -> MetricsResult<()> {
        self.enforcer.sweep(self.table, now).await.map(|_| ()).map_err(|e| {
            warn!(target: targets::RETENTION, table = %self.table, error = %e, "Retention sweep failed");
            e
        })
    }
}
