// ============================================================================
// WINDOWED ANALYTICS
// ============================================================================
// Read-time statistics over a trailing window of raw samples. Nothing is
// pre-materialized: every call scans the sample store from `now - window`
// onwards, so answers are a point-in-time snapshot of a growing series.
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MetricsError, MetricsResult};
use crate::logging::targets;
use crate::store::{SampleFilter, SampleStore};
use crate::time::Clock;
use crate::types::SignalRegistry;
use crate::{MAX_WINDOW_MINUTES, WINDOW_MEAN_DECIMALS};

/// Placeholder echoed as `signalType` when no filter was given.
pub const ALL_SIGNALS: &str = "all";

// ----------------------------------------------------------------------------
// Summary Statistics
// ----------------------------------------------------------------------------

/// Round half away from zero to `decimals` places.
#[inline]
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    let scaled = value * factor;
    if !scaled.is_finite() {
        // Too large to carry a fractional part at this precision.
        return value;
    }
    scaled.round() / factor
}

/// Average, extremes, count and sample standard deviation of a value set.
/// All fields are zero for an empty set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
    pub stddev: f64,
}

impl SummaryStats {
    pub const EMPTY: SummaryStats = SummaryStats {
        avg: 0.0,
        min: 0.0,
        max: 0.0,
        count: 0,
        stddev: 0.0,
    };

    pub fn from_values<I: IntoIterator<Item = f64>>(values: I) -> Self {
        let mut count = 0u64;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        // Welford running variance
        let mut mean = 0.0;
        let mut m2 = 0.0;

        for value in values {
            count += 1;
            sum += value;
            min = min.min(value);
            max = max.max(value);
            let delta = value - mean;
            mean += value / count as f64 - mean / count as f64;
            m2 += delta * (value - mean);
        }

        if count == 0 {
            return Self::EMPTY;
        }

        // The plain sum is exact for ordinary inputs; the running mean only
        // takes over once the sum overflows.
        let avg = if sum.is_finite() { sum / count as f64 } else { mean };
        let stddev = if count < 2 { 0.0 } else { (m2 / (count - 1) as f64).sqrt() };
        Self {
            avg: avg.clamp(min, max),
            min,
            max,
            count,
            stddev,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

// ----------------------------------------------------------------------------
// Window Statistics
// ----------------------------------------------------------------------------

/// Answer of a windowed stats call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowStats {
    pub average_hz: f64,
    pub min_hz: f64,
    pub max_hz: f64,
    pub sample_count: u64,
    pub signal_type: String,
    pub window_minutes: f64,
}

/// Reject anything outside `(0, 1440]`, NaN included.
pub fn validate_window(window_minutes: f64) -> MetricsResult<Duration> {
    if !(window_minutes > 0.0 && window_minutes <= MAX_WINDOW_MINUTES) {
        return Err(MetricsError::validation(
            "windowMinutes",
            format!("must be greater than 0 and at most {MAX_WINDOW_MINUTES}, got {window_minutes}"),
        ));
    }
    Ok(Duration::from_secs_f64(window_minutes * 60.0))
}

#[derive(Debug, Clone)]
pub struct WindowedAnalytics {
    samples: Arc<dyn SampleStore>,
    registry: Arc<SignalRegistry>,
    clock: Arc<dyn Clock>,
}

impl WindowedAnalytics {
    pub fn new(samples: Arc<dyn SampleStore>, registry: Arc<SignalRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            samples,
            registry,
            clock,
        }
    }

    /// Statistics over every sample with `timestamp >= now - window`,
    /// optionally restricted to one signal type. An empty selection is a
    /// valid all-zero answer.
    pub async fn windowed_stats(&self, window_minutes: f64, signal_type: Option<&str>) -> MetricsResult<WindowStats> {
        let window = validate_window(window_minutes)?;

        let signal = match signal_type.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(self.registry.resolve(raw)?.tag.clone()),
            None => None,
        };

        let cutoff = self.clock.now().sub_duration(window);
        let mut filter = SampleFilter::new().since(cutoff);
        if let Some(signal) = &signal {
            filter = filter.signal(signal.clone());
        }

        let samples = self.samples.scan(&filter).await?;
        let stats = SummaryStats::from_values(samples.iter().map(|s| s.value));

        let label = signal.as_ref().map_or_else(|| ALL_SIGNALS.to_string(), |s| s.to_string());
        debug!(
            target: targets::ANALYTICS,
            signal = %label,
            window_minutes,
            %cutoff,
            count = stats.count,
            "Windowed stats computed"
        );

        Ok(WindowStats {
            average_hz: round_to(stats.avg, WINDOW_MEAN_DECIMALS).clamp(stats.min, stats.max),
            min_hz: stats.min,
            max_hz: stats.max,
            sample_count: stats.count,
            signal_type: label,
            window_minutes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::tests::sample;
    use crate::store::MemorySampleStore;
    use crate::time::{ManualClock, Timestamp};
    use pretty_assertions::assert_eq;

    const NOW: i64 = 10_000;

    fn analytics(values: &[(&str, &str, f64, i64)]) -> WindowedAnalytics {
        let store = MemorySampleStore::new();
        for (entity, signal, value, secs) in values {
            store.insert_sample(sample(entity, signal, *value, *secs)).unwrap();
        }
        WindowedAnalytics::new(
            Arc::new(store),
            Arc::new(SignalRegistry::default()),
            Arc::new(ManualClock::new(Timestamp::from_secs(NOW))),
        )
    }

    #[test]
    fn test_round_half_away_from_zero() {
        assert_eq!(round_to(2.0005, 3), 2.001);
        assert_eq!(round_to(-2.0005, 3), -2.001);
        assert_eq!(round_to(20.0, 3), 20.0);
        assert_eq!(round_to(1.0 / 3.0, 3), 0.333);
    }

    #[test]
    fn test_summary_stats() {
        let stats = SummaryStats::from_values([2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(stats.count, 8);
        assert_eq!(stats.avg, 5.0);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 9.0);
        assert!((stats.stddev - 2.138_089_935).abs() < 1e-6);

        assert_eq!(SummaryStats::from_values([3.0]).stddev, 0.0);
        assert_eq!(SummaryStats::from_values(std::iter::empty()), SummaryStats::EMPTY);
    }

    #[test]
    fn test_mean_stays_within_extremes() {
        let tiny = SummaryStats::from_values([0.1, 0.1, 0.1]);
        assert!(tiny.min <= tiny.avg && tiny.avg <= tiny.max);

        let huge = SummaryStats::from_values([1e308, 1e308]);
        assert_eq!(huge.avg, 1e308);
        assert!(huge.avg.is_finite());

        let spread = SummaryStats::from_values([f64::MAX, f64::MAX, -f64::MAX]);
        assert!(spread.min <= spread.avg && spread.avg <= spread.max);
        assert_eq!(round_to(1e308, 3), 1e308);
    }

    #[tokio::test]
    async fn test_rounded_mean_is_clamped_to_extremes() {
        let narrow = analytics(&[("u1", "eeg", 1.0004, NOW - 1), ("u2", "eeg", 1.0004, NOW - 2)]);
        let stats = narrow.windowed_stats(5.0, Some("eeg")).await.unwrap();
        assert_eq!((stats.min_hz, stats.average_hz, stats.max_hz), (1.0004, 1.0004, 1.0004));

        let huge = analytics(&[("u1", "eeg", 1e308, NOW - 1), ("u2", "eeg", 1e308, NOW - 2)]);
        let stats = huge.windowed_stats(5.0, Some("eeg")).await.unwrap();
        assert_eq!(stats.average_hz, 1e308);
    }

    #[tokio::test]
    async fn test_window_bounds() {
        let analytics = analytics(&[]);
        for bad in [0.0, -5.0, 1441.0, f64::NAN, f64::INFINITY] {
            let err = analytics.windowed_stats(bad, None).await.unwrap_err();
            assert!(matches!(err, MetricsError::Validation { .. }), "{bad}");
        }
        for good in [1.0, 0.5, 1440.0] {
            assert!(analytics.windowed_stats(good, None).await.is_ok(), "{good}");
        }
    }

    #[tokio::test]
    async fn test_eeg_example() {
        let analytics = analytics(&[
            ("u1", "eeg", 10.0, NOW - 60),
            ("u1", "eeg", 20.0, NOW - 30),
            ("u2", "eeg", 30.0, NOW - 10),
            ("u1", "heart_rate", 70.0, NOW - 10),
        ]);
        let stats = analytics.windowed_stats(60.0, Some("eeg")).await.unwrap();
        assert_eq!(
            stats,
            WindowStats {
                average_hz: 20.0,
                min_hz: 10.0,
                max_hz: 30.0,
                sample_count: 3,
                signal_type: "eeg".into(),
                window_minutes: 60.0,
            }
        );
    }

    #[tokio::test]
    async fn test_cutoff_is_inclusive_and_unfiltered_is_all() {
        let analytics = analytics(&[
            ("u1", "eeg", 1.0, NOW - 120),
            ("u1", "eeg", 2.0, NOW - 60),
            ("u1", "cpu_usage", 3.0, NOW),
        ]);
        let stats = analytics.windowed_stats(1.0, None).await.unwrap();
        assert_eq!(stats.sample_count, 2);
        assert_eq!(stats.signal_type, ALL_SIGNALS);
        assert_eq!(stats.average_hz, 2.5);
    }

    #[tokio::test]
    async fn test_empty_window_is_all_zero() {
        let analytics = analytics(&[("u1", "eeg", 5.0, NOW - 7_200)]);
        let stats = analytics.windowed_stats(60.0, Some("eeg")).await.unwrap();
        assert_eq!(stats.sample_count, 0);
        assert_eq!((stats.average_hz, stats.min_hz, stats.max_hz), (0.0, 0.0, 0.0));
    }

    #[tokio::test]
    async fn test_mean_is_rounded_to_three_places() {
        let analytics = analytics(&[
            ("u1", "eeg", 1.0, NOW - 1),
            ("u1", "eeg", 1.0, NOW - 2),
            ("u1", "eeg", 2.0, NOW - 3),
        ]);
        let stats = analytics.windowed_stats(5.0, Some("eeg")).await.unwrap();
        assert_eq!(stats.average_hz, 1.333);
    }
}
