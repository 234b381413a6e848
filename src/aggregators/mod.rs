// =============================================================================
// Aggregators - cross-venue fusion with TTL windows and weighted sources
// =============================================================================
//
// Common contract shared by every aggregator:
//
//   - a short TTL window per source (venue stream); sources older than
//     `ttl_ms` are dropped from fusion and reported via
//     `stale_sources_dropped`
//   - per-source weight / unit multiplier / sign override applied before
//     fusion
//   - values in incompatible units are excluded with a NON_COMPARABLE reason,
//     never coerced
//   - bucket close timestamps follow `ceil(t / bucket_ms) * bucket_ms`
//   - every aggregate carries sorted `sources_used`, `venue_breakdown`,
//     `weights_used`, freshness counts, `mismatch_detected` and a
//     `confidence_score` in [0, 1]

pub mod canonical_price;
pub mod cvd;
pub mod funding;
pub mod liquidations;
pub mod liquidity;
pub mod open_interest;

use std::collections::BTreeMap;

use crate::meta::TsMillis;

pub use canonical_price::CanonicalPriceAggregator;
pub use cvd::{CvdAggregator, VolumeAggregator};
pub use funding::FundingAggregator;
pub use liquidations::LiquidationsAggregator;
pub use liquidity::LiquidityAggregator;
pub use open_interest::OpenInterestAggregator;

/// One source's latest observation inside a TTL window.
#[derive(Debug, Clone)]
pub(crate) struct SourceEntry<V> {
    pub value: V,
    pub ts: TsMillis,
}

/// Per-source latest-value window with TTL eviction. Keys are stream ids, so
/// the map is bounded by the number of configured venue streams.
#[derive(Debug)]
pub(crate) struct SourceWindow<V> {
    ttl_ms: i64,
    entries: BTreeMap<String, SourceEntry<V>>,
}

impl<V: Clone> SourceWindow<V> {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            ttl_ms,
            entries: BTreeMap::new(),
        }
    }

    pub fn upsert(&mut self, source: &str, value: V, ts: TsMillis) {
        self.entries
            .insert(source.to_string(), SourceEntry { value, ts });
    }

    /// Evict entries older than the TTL and return the fresh ones (sorted by
    /// source) plus the number of sources dropped this pass.
    pub fn fresh(&mut self, now: TsMillis) -> (Vec<(String, SourceEntry<V>)>, usize) {
        let before = self.entries.len();
        let ttl = self.ttl_ms;
        self.entries.retain(|_, e| now.delta_ms(e.ts) <= ttl);
        let dropped = before - self.entries.len();

        let fresh = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        (fresh, dropped)
    }

    pub fn get(&self, source: &str) -> Option<&SourceEntry<V>> {
        self.entries.get(source)
    }

    pub fn remove_stream(&mut self, stream_prefix: &str) {
        self.entries.retain(|k, _| !k.starts_with(stream_prefix));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Weighted mean over (value, weight) pairs. Returns `None` when the weight
/// mass is zero.
pub(crate) fn weighted_mean(pairs: &[(f64, f64)]) -> Option<f64> {
    let mass: f64 = pairs.iter().map(|(_, w)| w).sum();
    if mass <= 0.0 {
        return None;
    }
    Some(pairs.iter().map(|(v, w)| v * w).sum::<f64>() / mass)
}

/// Median of a value slice. Returns `None` on empty input.
pub(crate) fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Bucket close timestamp: `ceil(t / bucket_ms) * bucket_ms`. A timestamp
/// already on a boundary closes that same bucket.
pub(crate) fn bucket_end_ts(ts: TsMillis, bucket_ms: i64) -> TsMillis {
    if bucket_ms <= 0 {
        return ts;
    }
    TsMillis(ts.0.div_euclid(bucket_ms) * bucket_ms
        + if ts.0.rem_euclid(bucket_ms) == 0 { 0 } else { bucket_ms })
}

/// Clamp a confidence score into [0, 1].
pub(crate) fn clamp_confidence(score: f64) -> f64 {
    score.clamp(0.0, 1.0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_evicts_stale_sources() {
        let mut window: SourceWindow<f64> = SourceWindow::new(1_000);
        window.upsert("a", 1.0, TsMillis(0));
        window.upsert("b", 2.0, TsMillis(900));

        let (fresh, dropped) = window.fresh(TsMillis(1_500));
        assert_eq!(dropped, 1);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].0, "b");
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn window_upsert_replaces_previous_observation() {
        let mut window: SourceWindow<f64> = SourceWindow::new(1_000);
        window.upsert("a", 1.0, TsMillis(0));
        window.upsert("a", 5.0, TsMillis(800));

        let (fresh, dropped) = window.fresh(TsMillis(1_000));
        assert_eq!(dropped, 0);
        assert_eq!(fresh[0].1.value, 5.0);
    }

    #[test]
    fn weighted_mean_basics() {
        assert_eq!(weighted_mean(&[]), None);
        assert_eq!(weighted_mean(&[(10.0, 1.0), (20.0, 1.0)]), Some(15.0));
        assert_eq!(weighted_mean(&[(10.0, 3.0), (20.0, 1.0)]), Some(12.5));
        assert_eq!(weighted_mean(&[(10.0, 0.0)]), None);
    }

    #[test]
    fn median_odd_and_even() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[3.0]), Some(3.0));
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
    }

    #[test]
    fn bucket_end_rounds_up_and_keeps_boundary() {
        assert_eq!(bucket_end_ts(TsMillis(1), 1_000), TsMillis(1_000));
        assert_eq!(bucket_end_ts(TsMillis(999), 1_000), TsMillis(1_000));
        assert_eq!(bucket_end_ts(TsMillis(1_000), 1_000), TsMillis(1_000));
        assert_eq!(bucket_end_ts(TsMillis(1_001), 1_000), TsMillis(2_000));
    }
}
