// ============================================================================
// TIME, CLOCKS & GRANULARITY
// ============================================================================
// Nanosecond timestamps, an injectable clock so that every window, backfill
// and retention cutoff can be computed deterministically in tests, and the
// fixed bucket widths used by the continuous aggregates.
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::MetricsError;

const NANOS_PER_SEC: i64 = 1_000_000_000;

// ----------------------------------------------------------------------------
// Timestamp - Nanosecond Precision Time Handling
// ----------------------------------------------------------------------------

/// Event time in nanoseconds since the Unix epoch, always UTC.
/// Using i64 allows representing times from ~1677 to ~2262.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Smallest representable timestamp
    pub const MIN: Timestamp = Timestamp(i64::MIN);

    /// Largest representable timestamp
    pub const MAX: Timestamp = Timestamp(i64::MAX);

    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(NANOS_PER_SEC))
    }

    /// Wall-clock now. Prefer a [`Clock`] inside components.
    #[inline]
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / NANOS_PER_SEC
    }

    /// Duration between two timestamps, zero if `earlier` is later.
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_nanos(duration)))
    }

    #[inline]
    pub fn sub_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_nanos(duration)))
    }

    /// Truncate down to a granularity boundary. Uses Euclidean division so
    /// pre-epoch instants still round towards negative infinity.
    #[inline]
    pub fn floor_to(&self, granularity: Granularity) -> Self {
        let width = granularity.as_nanos();
        Self(self.0.div_euclid(width) * width)
    }

    /// Check if timestamp is within `[start, end)`.
    #[inline]
    pub fn is_within(&self, start: Timestamp, end: Timestamp) -> bool {
        self.0 >= start.0 && self.0 < end.0
    }

    /// Every i64 nanosecond value lies inside chrono's range.
    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.0)
    }

    /// Fails for instants outside ~1677..~2262.
    pub fn from_datetime(dt: DateTime<Utc>) -> Result<Self, MetricsError> {
        dt.timestamp_nanos_opt().map(Self).ok_or_else(|| {
            MetricsError::validation(
                "timestamp",
                format!("{} is outside the representable range (1677..2262)", dt.to_rfc3339()),
            )
        })
    }

    /// Parse RFC 3339 text (`2024-05-01T12:00:00Z`).
    pub fn parse_rfc3339(text: &str) -> Result<Self, MetricsError> {
        let dt = DateTime::parse_from_rfc3339(text)
            .map_err(|e| MetricsError::validation("timestamp", format!("invalid RFC 3339 time: {e}")))?;
        Self::from_datetime(dt.with_timezone(&Utc))
    }
}

fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_datetime().to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration_nanos(duration))
    }
}

impl TryFrom<DateTime<Utc>> for Timestamp {
    type Error = MetricsError;

    fn try_from(dt: DateTime<Utc>) -> Result<Self, Self::Error> {
        Self::from_datetime(dt)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Timestamp::parse_rfc3339(&text).map_err(serde::de::Error::custom)
    }
}

// ----------------------------------------------------------------------------
// Clocks
// ----------------------------------------------------------------------------

/// Source of "now" for every time-dependent operation.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Timestamp;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A clock that only moves when told to. Lock-free so concurrent readers
/// never block the test driving it.
#[derive(Debug)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self(AtomicI64::new(start.as_nanos()))
    }

    pub fn set(&self, ts: Timestamp) {
        self.0.store(ts.as_nanos(), AtomicOrdering::Release);
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(duration_nanos(by), AtomicOrdering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_nanos(self.0.load(AtomicOrdering::Acquire))
    }
}

// ----------------------------------------------------------------------------
// Granularity - Fixed Bucket Width
// ----------------------------------------------------------------------------

/// Width of an aggregate bucket. Always a whole, positive number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Granularity(Duration);

impl Granularity {
    pub const ONE_MINUTE: Granularity = Granularity(Duration::from_secs(60));
    pub const FIVE_MINUTES: Granularity = Granularity(Duration::from_secs(300));
    pub const FIFTEEN_MINUTES: Granularity = Granularity(Duration::from_secs(900));
    pub const ONE_HOUR: Granularity = Granularity(Duration::from_secs(3600));
    pub const ONE_DAY: Granularity = Granularity(Duration::from_secs(86_400));

    pub fn new(width: Duration) -> Result<Self, MetricsError> {
        if width.as_secs() == 0 || width.subsec_nanos() != 0 {
            return Err(MetricsError::validation(
                "granularity",
                format!("granularity must be a whole number of seconds ≥ 1s, got {width:?}"),
            ));
        }
        Ok(Self(width))
    }

    #[inline]
    pub fn as_duration(&self) -> Duration {
        self.0
    }

    #[inline]
    pub fn as_nanos(&self) -> i64 {
        self.0.as_secs() as i64 * NANOS_PER_SEC
    }

    /// Start of the bucket containing `ts`.
    #[inline]
    pub fn bucket_start(&self, ts: Timestamp) -> Timestamp {
        ts.floor_to(*self)
    }

    /// Short label used in job keys and logs: `1m`, `5m`, `1h`, `1d`, `90s`.
    pub fn label(&self) -> String {
        let secs = self.0.as_secs();
        if secs % 86_400 == 0 {
            format!("{}d", secs / 86_400)
        } else if secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }
}

impl Display for Granularity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl FromStr for Granularity {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let width = humantime::parse_duration(s.trim())
            .map_err(|e| MetricsError::validation("granularity", format!("'{s}': {e}")))?;
        Self::new(width)
    }
}

impl Serialize for Granularity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

impl<'de> Deserialize<'de> for Granularity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
