//! # Operator Metrics - Time-Series Core
//!
//! Ingestion, windowed analytics, continuous rollups and age-based eviction
//! for high-rate sensor and event samples (biofeedback signals, frequency
//! readings, system and KPI metrics).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                         OPERATOR METRICS CORE                             │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  INGESTION GATEWAY → SAMPLE STORE ─┬→ WINDOWED ANALYTICS (on read)        │
//! │                                    └→ AGGREGATE MAINTAINER (on schedule)  │
//! │                                           ↓                               │
//! │                     QUERY SERVICE ← AGGREGATE STORE                        │
//! │  RETENTION ENFORCER ──(purges)──→ sample / aggregate / KPI tables          │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only the ingestion gateway writes samples, only the aggregate maintainer
//! writes buckets and only the retention enforcer deletes rows. Background
//! work runs through [`scheduler::JobScheduler`] with single-flight leases.
//!
//! The HTTP surface, authentication and packaging live outside this crate;
//! [`api::MetricsApi`] is the typed seam they call into.

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod aggregate;
pub mod analytics;
pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod query;
pub mod retention;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod time;
pub mod types;

pub use aggregate::{BackfillWindow, ContinuousAggregateMaintainer, PassReport, RollupSpec};
pub use analytics::{SummaryStats, WindowStats, WindowedAnalytics};
pub use api::{ApiReply, MetricsApi};
pub use config::{ConfigManager, EngineConfig};
pub use engine::MetricsEngine;
pub use error::{ConfigError, MetricsError, MetricsResult, RecoveryHint};
pub use ingest::{BatchOutcome, IngestOptions, IngestRequest, IngestionGateway};
pub use query::{FeatureGate, QueryService, SeriesQuery, StatsRange};
pub use retention::{RetentionEnforcer, RetentionPolicy, RetentionTable, SweepReport};
pub use scheduler::{JobKey, JobScheduler, PeriodicJob, TickOutcome};
pub use time::{Clock, Granularity, ManualClock, SystemClock, Timestamp};
pub use types::{
    AggregateBucket, EntityScope, KpiDefinition, KpiMeasurement, MetricSample, RequestContext,
    Role, SampleId, SampleTable, SignalRegistry, SignalType,
};

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================
// Global limits shared by the ingestion boundary, the query façade and the
// configuration defaults.
// ============================================================================

/// Crate version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "operator-metrics";
pub const ENGINE_FULL_NAME: &str = "Operator Metrics Core";

/// Name reported by the feature status endpoint
pub const FEATURE_NAME: &str = "metrics";

// ----------------------------------------------------------------------------
// Ingestion Limits
// ----------------------------------------------------------------------------

/// Default maximum samples accepted by one batch ingest call
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

/// Maximum key/value pairs carried in a sample context
pub const MAX_CONTEXT_ENTRIES: usize = 16;

/// Maximum context key length (bytes)
pub const MAX_CONTEXT_KEY_LENGTH: usize = 64;

/// Maximum context value length (bytes)
pub const MAX_CONTEXT_VALUE_LENGTH: usize = 256;

/// Maximum entity id length (bytes)
pub const MAX_ENTITY_ID_LENGTH: usize = 128;

/// Maximum device id length (bytes)
pub const MAX_DEVICE_ID_LENGTH: usize = 128;

/// Maximum signal tag length (bytes)
pub const MAX_SIGNAL_TAG_LENGTH: usize = 64;

/// Maximum dimension tags on a KPI measurement
pub const MAX_KPI_DIMENSIONS: usize = 3;

// ----------------------------------------------------------------------------
// Analytics & Query Limits
// ----------------------------------------------------------------------------

/// Largest trailing window accepted by windowed stats (one day)
pub const MAX_WINDOW_MINUTES: f64 = 1440.0;

/// Decimal places kept on the windowed mean
pub const WINDOW_MEAN_DECIMALS: i32 = 3;

/// Default page size for aggregated series
pub const DEFAULT_SERIES_LIMIT: usize = 100;

/// Hard cap on the aggregated series page size
pub const MAX_SERIES_LIMIT: usize = 100;

// ----------------------------------------------------------------------------
// Timing
// ----------------------------------------------------------------------------

/// Default bound on a single store call (milliseconds)
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2000;

/// Ticks slower than this are reported by the perf timer (milliseconds)
pub const SLOW_TICK_THRESHOLD_MS: u64 = 5000;

/// Grace period for background loops on shutdown (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 10;
