// ============================================================================
// CORE TYPE SYSTEM
// ============================================================================
// The data that flows through the core: validated signal tags, immutable
// samples, rollup buckets, KPI definitions/measurements and the caller
// identity handed in by the outer layer.
// ============================================================================

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display, Formatter};

use compact_str::CompactString;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;
use uuid::Uuid;

use crate::error::{MetricsError, MetricsResult};
use crate::time::{Granularity, Timestamp};
use crate::MAX_SIGNAL_TAG_LENGTH;

// ----------------------------------------------------------------------------
// Sample Identity
// ----------------------------------------------------------------------------

/// Globally unique sample id. UUID v7 so ids sort roughly by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleId(Uuid);

impl SampleId {
    #[inline]
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    #[inline]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    #[inline]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Lowest possible id, used as a range bound.
    pub const MIN: SampleId = SampleId(Uuid::nil());

    /// Highest possible id, used as a range bound.
    pub const MAX: SampleId = SampleId(Uuid::from_u128(u128::MAX));
}

impl Display for SampleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

// ----------------------------------------------------------------------------
// Signal Types & Registry
// ----------------------------------------------------------------------------

/// Broad family a signal belongs to; decides which table stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalClass {
    Biofeedback,
    System,
    Event,
}

/// Raw sample table. Each one carries its own retention horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleTable {
    Events,
    Biofeedback,
    SystemMetrics,
}

impl SampleTable {
    pub const ALL: [SampleTable; 3] = [SampleTable::Events, SampleTable::Biofeedback, SampleTable::SystemMetrics];

    pub fn as_str(&self) -> &'static str {
        match self {
            SampleTable::Events => "events",
            SampleTable::Biofeedback => "biofeedback_metrics",
            SampleTable::SystemMetrics => "system_metrics",
        }
    }
}

impl From<SignalClass> for SampleTable {
    fn from(class: SignalClass) -> Self {
        match class {
            SignalClass::Biofeedback => SampleTable::Biofeedback,
            SignalClass::System => SampleTable::SystemMetrics,
            SignalClass::Event => SampleTable::Events,
        }
    }
}

impl Display for SampleTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive value bounds for a signal. `None` means unbounded on that side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SignalBounds {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl SignalBounds {
    pub const UNBOUNDED: SignalBounds = SignalBounds { min: None, max: None };
    /// Physical frequencies, rates and durations.
    pub const NON_NEGATIVE: SignalBounds = SignalBounds { min: Some(0.0), max: None };
    /// Scores and percentages.
    pub const PERCENT: SignalBounds = SignalBounds { min: Some(0.0), max: Some(100.0) };

    pub fn check(&self, tag: &str, value: f64) -> MetricsResult<()> {
        if let Some(min) = self.min {
            if value < min {
                return Err(MetricsError::validation(
                    "value",
                    format!("{tag} must be ≥ {min}, got {value}"),
                ));
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return Err(MetricsError::validation(
                    "value",
                    format!("{tag} must be ≤ {max}, got {value}"),
                ));
            }
        }
        Ok(())
    }
}

/// A validated signal tag. Only obtainable through [`SignalRegistry::resolve`]
/// (or deserialization of previously stored data).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalType(CompactString);

impl SignalType {
    #[inline]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Syntax check only: `[a-z0-9_]{1,64}` after trimming and lowercasing.
    pub fn normalize(raw: &str) -> MetricsResult<CompactString> {
        let tag = raw.trim().to_ascii_lowercase();
        if tag.is_empty() {
            return Err(MetricsError::validation("signalType", "must not be empty"));
        }
        if tag.len() > MAX_SIGNAL_TAG_LENGTH {
            return Err(MetricsError::validation(
                "signalType",
                format!("must be at most {MAX_SIGNAL_TAG_LENGTH} characters"),
            ));
        }
        if !tag.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_') {
            return Err(MetricsError::validation(
                "signalType",
                format!("'{tag}' may only contain a-z, 0-9 and '_'"),
            ));
        }
        Ok(CompactString::from(tag))
    }
}

impl Display for SignalType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the ingestion boundary needs to know about one signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSpec {
    pub tag: SignalType,
    pub class: SignalClass,
    pub bounds: SignalBounds,
}

impl SignalSpec {
    #[inline]
    pub fn table(&self) -> SampleTable {
        self.class.into()
    }
}

/// The accepted vocabulary of signal tags. Grows through configuration, is
/// consulted only at the ingestion and query boundaries.
#[derive(Debug, Clone)]
pub struct SignalRegistry {
    specs: HashMap<CompactString, SignalSpec>,
}

impl SignalRegistry {
    pub fn empty() -> Self {
        Self { specs: HashMap::new() }
    }

    /// Register (or replace) a tag.
    pub fn register(&mut self, tag: &str, class: SignalClass, bounds: SignalBounds) -> MetricsResult<()> {
        let tag = SignalType::normalize(tag)?;
        let spec = SignalSpec {
            tag: SignalType(tag.clone()),
            class,
            bounds,
        };
        self.specs.insert(tag, spec);
        Ok(())
    }

    /// Look up a raw tag, normalizing it first.
    pub fn resolve(&self, raw: &str) -> MetricsResult<&SignalSpec> {
        let tag = SignalType::normalize(raw)?;
        self.specs.get(&tag).ok_or_else(|| {
            MetricsError::validation("signalType", format!("unknown signal type '{tag}'"))
        })
    }

    pub fn contains(&self, raw: &str) -> bool {
        self.resolve(raw).is_ok()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.specs.keys().map(|k| k.as_str()).collect();
        tags.sort_unstable();
        tags
    }
}

impl Default for SignalRegistry {
    fn default() -> Self {
        use SignalBounds as B;
        use SignalClass::*;

        let defaults: [(&str, SignalClass, SignalBounds); 18] = [
            ("heart_rate", Biofeedback, SignalBounds { min: Some(0.0), max: Some(300.0) }),
            ("hrv", Biofeedback, B::NON_NEGATIVE),
            ("stress_level", Biofeedback, B::PERCENT),
            ("focus_score", Biofeedback, B::PERCENT),
            ("brainwave", Biofeedback, B::NON_NEGATIVE),
            ("eeg", Biofeedback, B::NON_NEGATIVE),
            ("alpha_wave", Biofeedback, B::NON_NEGATIVE),
            ("beta_wave", Biofeedback, B::NON_NEGATIVE),
            ("theta_wave", Biofeedback, B::NON_NEGATIVE),
            ("respiration", Biofeedback, B::NON_NEGATIVE),
            ("cpu_usage", System, B::PERCENT),
            ("memory_usage", System, B::PERCENT),
            ("disk_usage", System, B::PERCENT),
            ("latency_ms", System, B::NON_NEGATIVE),
            ("request_rate", System, B::NON_NEGATIVE),
            ("error_rate", System, B::NON_NEGATIVE),
            ("event", Event, B::UNBOUNDED),
            ("session", Event, B::NON_NEGATIVE),
        ];

        let mut registry = Self::empty();
        for (tag, class, bounds) in defaults {
            // Built-in tags are known to be well formed.
            let tag = CompactString::from(tag);
            registry.specs.insert(
                tag.clone(),
                SignalSpec {
                    tag: SignalType(tag),
                    class,
                    bounds,
                },
            );
        }
        registry
    }
}

// ----------------------------------------------------------------------------
// Metric Sample
// ----------------------------------------------------------------------------

/// One observed value. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub sample_id: SampleId,
    pub entity_id: CompactString,
    pub signal_type: SignalType,
    pub table: SampleTable,
    pub value: f64,
    pub quality_score: Option<u8>,
    pub device_id: Option<String>,
    pub context: BTreeMap<String, String>,
    pub timestamp: Timestamp,
}

impl MetricSample {
    /// Primary index key `(entity, signal, timestamp, id)`.
    #[inline]
    pub fn key(&self) -> SampleKey {
        SampleKey {
            entity_id: self.entity_id.clone(),
            signal_type: self.signal_type.clone(),
            timestamp: self.timestamp,
            sample_id: self.sample_id,
        }
    }
}

/// Ordered key of the sample index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SampleKey {
    pub entity_id: CompactString,
    pub signal_type: SignalType,
    pub timestamp: Timestamp,
    pub sample_id: SampleId,
}

// ----------------------------------------------------------------------------
// Aggregate Buckets
// ----------------------------------------------------------------------------

/// Owner of a rollup: a single entity or every entity (`*`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityScope {
    All,
    Entity(CompactString),
}

impl EntityScope {
    pub const WILDCARD: &'static str = "*";

    pub fn entity(id: impl Into<CompactString>) -> Self {
        EntityScope::Entity(id.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            EntityScope::All => Self::WILDCARD,
            EntityScope::Entity(id) => id.as_str(),
        }
    }
}

impl Display for EntityScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EntityScope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntityScope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(if text == Self::WILDCARD {
            EntityScope::All
        } else {
            EntityScope::Entity(text.into())
        })
    }
}

/// Unique key of an aggregate row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey {
    pub entity_scope: EntityScope,
    pub signal_type: SignalType,
    pub granularity: Granularity,
    pub bucket_start: Timestamp,
}

/// One rollup over `[bucket_start, bucket_start + granularity)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateBucket {
    pub entity_scope: EntityScope,
    pub signal_type: SignalType,
    pub granularity: Granularity,
    pub bucket_start: Timestamp,
    pub avg_value: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub sample_count: u64,
}

impl AggregateBucket {
    pub fn key(&self) -> BucketKey {
        BucketKey {
            entity_scope: self.entity_scope.clone(),
            signal_type: self.signal_type.clone(),
            granularity: self.granularity,
            bucket_start: self.bucket_start,
        }
    }

    /// Exclusive end of the bucket.
    pub fn bucket_end(&self) -> Timestamp {
        self.bucket_start.add_duration(self.granularity.as_duration())
    }
}

// ----------------------------------------------------------------------------
// KPIs
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KpiDirection {
    #[default]
    HigherIsBetter,
    LowerIsBetter,
}

/// A named metric with target/warning/critical thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiDefinition {
    pub id: CompactString,
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub target: Option<f64>,
    #[serde(default)]
    pub warning_threshold: Option<f64>,
    #[serde(default)]
    pub critical_threshold: Option<f64>,
    #[serde(default)]
    pub direction: KpiDirection,
}

impl KpiDefinition {
    /// Thresholds must be finite and ordered towards the target.
    pub fn validate(&self) -> MetricsResult<()> {
        if self.id.trim().is_empty() {
            return Err(MetricsError::validation("kpi.id", "must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(MetricsError::validation("kpi.name", "must not be empty"));
        }
        for (field, value) in [
            ("kpi.target", self.target),
            ("kpi.warningThreshold", self.warning_threshold),
            ("kpi.criticalThreshold", self.critical_threshold),
        ] {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(MetricsError::validation(field, "must be a finite number"));
                }
            }
        }
        if let (Some(warning), Some(critical)) = (self.warning_threshold, self.critical_threshold) {
            let ordered = match self.direction {
                KpiDirection::HigherIsBetter => critical <= warning,
                KpiDirection::LowerIsBetter => critical >= warning,
            };
            if !ordered {
                return Err(MetricsError::validation(
                    "kpi.criticalThreshold",
                    "critical threshold must lie beyond the warning threshold",
                ));
            }
        }
        Ok(())
    }

    /// Classify a measured value against the thresholds.
    pub fn evaluate(&self, value: f64) -> KpiStatus {
        let breaches = |threshold: Option<f64>| match (threshold, self.direction) {
            (Some(t), KpiDirection::HigherIsBetter) => value <= t,
            (Some(t), KpiDirection::LowerIsBetter) => value >= t,
            (None, _) => false,
        };
        if breaches(self.critical_threshold) {
            KpiStatus::Critical
        } else if breaches(self.warning_threshold) {
            KpiStatus::Warning
        } else {
            KpiStatus::OnTarget
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KpiStatus {
    OnTarget,
    Warning,
    Critical,
}

/// Free-form dimension tags (at most three).
pub type Dimensions = SmallVec<[CompactString; 3]>;

/// One dimensioned KPI observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiMeasurement {
    pub id: SampleId,
    pub kpi_id: CompactString,
    pub value: f64,
    pub dimensions: Dimensions,
    pub timestamp: Timestamp,
}

// ----------------------------------------------------------------------------
// Request Identity
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
    Service,
    Anonymous,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Admin => "admin",
            Role::User => "user",
            Role::Service => "service",
            Role::Anonymous => "anonymous",
        })
    }
}

/// Caller identity resolved by the outer layer. The core only records it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub caller_id: CompactString,
    pub role: Role,
}

impl RequestContext {
    pub fn new(caller_id: impl Into<CompactString>, role: Role) -> Self {
        Self {
            caller_id: caller_id.into(),
            role,
        }
    }

    /// Identity used by background jobs and the CLI.
    pub fn system() -> Self {
        Self::new("system", Role::Service)
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous", Role::Anonymous)
    }
}
