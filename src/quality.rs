// =============================================================================
// Stream Quality Monitor - gap / duplicate / out-of-order / latency detection
// =============================================================================
//
// Stateful per-(stream, topic[, tf]) bookkeeping over sequence numbers and
// event times. The monitor itself is bus-agnostic: callers (the journal, the
// normalizer) translate the returned issues into `data:*` events with the
// right envelope.
//
// Kline series are tracked per-tf; every other topic is tracked per-stream
// only.

use std::collections::HashMap;

use crate::config::StalenessRule;
use crate::meta::{StreamId, TsMillis};
use crate::types::MarketType;

/// One detected anomaly for an observed event.
#[derive(Debug, Clone, PartialEq)]
pub enum QualityIssue {
    Gap {
        expected: u64,
        observed: u64,
        missing: u64,
    },
    Duplicate {
        sequence: u64,
    },
    SequenceOutOfOrder {
        expected: u64,
        observed: u64,
    },
    TimeOutOfOrder {
        prev_ts: TsMillis,
        ts: TsMillis,
    },
    LatencySpike {
        latency_ms: i64,
        threshold_ms: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    stream_id: StreamId,
    topic: String,
    tf: Option<String>,
}

#[derive(Debug, Default)]
struct SeriesState {
    last_sequence: Option<u64>,
    last_ts: Option<TsMillis>,
}

/// Sequence/time bookkeeping across all observed series.
#[derive(Debug)]
pub struct StreamQualityMonitor {
    latency_threshold_ms: i64,
    series: HashMap<SeriesKey, SeriesState>,
}

impl StreamQualityMonitor {
    pub fn new(latency_threshold_ms: i64) -> Self {
        Self {
            latency_threshold_ms,
            series: HashMap::new(),
        }
    }

    /// Observe one event and return any anomalies it exposes.
    ///
    /// `sequence` enables gap/duplicate/out-of-order checks; `ts_event`
    /// drives time-regression checks; `ts_exchange` (with `ts_ingest`)
    /// drives the latency check.
    #[allow(clippy::too_many_arguments)]
    pub fn observe(
        &mut self,
        stream_id: &StreamId,
        topic: &str,
        tf: Option<&str>,
        sequence: Option<u64>,
        ts_event: TsMillis,
        ts_ingest: Option<TsMillis>,
        ts_exchange: Option<TsMillis>,
    ) -> Vec<QualityIssue> {
        let key = SeriesKey {
            stream_id: stream_id.clone(),
            topic: topic.to_string(),
            tf: tf.map(|s| s.to_string()),
        };
        let state = self.series.entry(key).or_default();
        let mut issues = Vec::new();

        if let Some(seq) = sequence {
            match state.last_sequence {
                Some(last) if seq == last => {
                    issues.push(QualityIssue::Duplicate { sequence: seq });
                }
                Some(last) if seq < last => {
                    issues.push(QualityIssue::SequenceOutOfOrder {
                        expected: last + 1,
                        observed: seq,
                    });
                }
                Some(last) if seq > last + 1 => {
                    issues.push(QualityIssue::Gap {
                        expected: last + 1,
                        observed: seq,
                        missing: seq - last - 1,
                    });
                    state.last_sequence = Some(seq);
                }
                _ => {
                    state.last_sequence = Some(seq);
                }
            }
        }

        match state.last_ts {
            Some(prev) if ts_event < prev => {
                issues.push(QualityIssue::TimeOutOfOrder { prev_ts: prev, ts: ts_event });
            }
            _ => {
                state.last_ts = Some(ts_event);
            }
        }

        if let (Some(ingest), Some(exchange)) = (ts_ingest, ts_exchange) {
            let latency = ingest.delta_ms(exchange);
            if latency > self.latency_threshold_ms {
                issues.push(QualityIssue::LatencySpike {
                    latency_ms: latency,
                    threshold_ms: self.latency_threshold_ms,
                });
            }
        }

        issues
    }

    /// Drop bookkeeping for every series of `stream_id` (used on disconnect).
    pub fn reset_stream(&mut self, stream_id: &StreamId) {
        self.series.retain(|k, _| &k.stream_id != stream_id);
    }
}

// =============================================================================
// Staleness rule resolution
// =============================================================================

/// Resolve the most specific staleness rule for (topic, symbol, market).
///
/// Specificity ordering: topic+symbol+market > topic+symbol > topic+market >
/// topic.
pub fn resolve_staleness<'a>(
    rules: &'a [StalenessRule],
    topic: &str,
    symbol: &str,
    market_type: MarketType,
) -> Option<&'a StalenessRule> {
    let find = |want_symbol: bool, want_market: bool| {
        rules.iter().find(|r| {
            r.topic == topic
                && (if want_symbol {
                    r.symbol.as_deref() == Some(symbol)
                } else {
                    r.symbol.is_none()
                })
                && (if want_market {
                    r.market_type == Some(market_type)
                } else {
                    r.market_type.is_none()
                })
        })
    };

    find(true, true)
        .or_else(|| find(true, false))
        .or_else(|| find(false, true))
        .or_else(|| find(false, false))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> StreamId {
        StreamId::from("binance:trade:spot")
    }

    fn observe_seq(mon: &mut StreamQualityMonitor, seq: u64, ts: i64) -> Vec<QualityIssue> {
        mon.observe(
            &stream(),
            "market:trade",
            None,
            Some(seq),
            TsMillis(ts),
            Some(TsMillis(ts)),
            None,
        )
    }

    #[test]
    fn contiguous_sequence_is_clean() {
        let mut mon = StreamQualityMonitor::new(2_000);
        assert!(observe_seq(&mut mon, 1, 100).is_empty());
        assert!(observe_seq(&mut mon, 2, 200).is_empty());
        assert!(observe_seq(&mut mon, 3, 300).is_empty());
    }

    #[test]
    fn gap_reports_missing_count() {
        let mut mon = StreamQualityMonitor::new(2_000);
        observe_seq(&mut mon, 10, 100);
        let issues = observe_seq(&mut mon, 14, 200);
        assert_eq!(
            issues,
            vec![QualityIssue::Gap {
                expected: 11,
                observed: 14,
                missing: 3
            }]
        );
        // After a gap, tracking continues from the observed sequence.
        assert!(observe_seq(&mut mon, 15, 300).is_empty());
    }

    #[test]
    fn duplicate_and_out_of_order() {
        let mut mon = StreamQualityMonitor::new(2_000);
        observe_seq(&mut mon, 5, 100);
        assert_eq!(
            observe_seq(&mut mon, 5, 200),
            vec![QualityIssue::Duplicate { sequence: 5 }]
        );
        assert_eq!(
            observe_seq(&mut mon, 3, 300),
            vec![QualityIssue::SequenceOutOfOrder {
                expected: 6,
                observed: 3
            }]
        );
        // The highest observed sequence remains the reference.
        assert!(observe_seq(&mut mon, 6, 400).is_empty());
    }

    #[test]
    fn time_regression_detected() {
        let mut mon = StreamQualityMonitor::new(2_000);
        observe_seq(&mut mon, 1, 1_000);
        let issues = observe_seq(&mut mon, 2, 500);
        assert_eq!(
            issues,
            vec![QualityIssue::TimeOutOfOrder {
                prev_ts: TsMillis(1_000),
                ts: TsMillis(500)
            }]
        );
    }

    #[test]
    fn latency_spike_above_threshold() {
        let mut mon = StreamQualityMonitor::new(2_000);
        let issues = mon.observe(
            &stream(),
            "market:trade",
            None,
            None,
            TsMillis(10_000),
            Some(TsMillis(10_000)),
            Some(TsMillis(5_000)),
        );
        assert_eq!(
            issues,
            vec![QualityIssue::LatencySpike {
                latency_ms: 5_000,
                threshold_ms: 2_000
            }]
        );

        let ok = mon.observe(
            &stream(),
            "market:trade",
            None,
            None,
            TsMillis(11_000),
            Some(TsMillis(11_000)),
            Some(TsMillis(10_500)),
        );
        assert!(ok.is_empty());
    }

    #[test]
    fn kline_series_tracked_per_tf() {
        let mut mon = StreamQualityMonitor::new(2_000);
        let s = StreamId::from("binance:kline:spot");

        // 1m and 5m advance independently; neither trips the other.
        mon.observe(&s, "market:kline", Some("1m"), None, TsMillis(60_000), None, None);
        let issues = mon.observe(&s, "market:kline", Some("5m"), None, TsMillis(1_000), None, None);
        assert!(issues.is_empty());
    }

    #[test]
    fn reset_stream_clears_bookkeeping() {
        let mut mon = StreamQualityMonitor::new(2_000);
        observe_seq(&mut mon, 5, 100);
        mon.reset_stream(&stream());
        // Fresh start: no duplicate flagged for the same sequence.
        assert!(observe_seq(&mut mon, 5, 200).is_empty());
    }

    #[test]
    fn staleness_specificity() {
        let rules = vec![
            StalenessRule {
                topic: "market:ticker".to_string(),
                symbol: None,
                market_type: None,
                expected_interval_ms: 1_000,
                stale_threshold_ms: 5_000,
                startup_grace_ms: 0,
                min_samples: 0,
            },
            StalenessRule {
                topic: "market:ticker".to_string(),
                symbol: Some("BTCUSDT".to_string()),
                market_type: None,
                expected_interval_ms: 500,
                stale_threshold_ms: 2_000,
                startup_grace_ms: 0,
                min_samples: 0,
            },
            StalenessRule {
                topic: "market:ticker".to_string(),
                symbol: Some("BTCUSDT".to_string()),
                market_type: Some(MarketType::Futures),
                expected_interval_ms: 250,
                stale_threshold_ms: 1_000,
                startup_grace_ms: 0,
                min_samples: 0,
            },
        ];

        let full = resolve_staleness(&rules, "market:ticker", "BTCUSDT", MarketType::Futures).unwrap();
        assert_eq!(full.stale_threshold_ms, 1_000);

        let symbol = resolve_staleness(&rules, "market:ticker", "BTCUSDT", MarketType::Spot).unwrap();
        assert_eq!(symbol.stale_threshold_ms, 2_000);

        let topic = resolve_staleness(&rules, "market:ticker", "ETHUSDT", MarketType::Spot).unwrap();
        assert_eq!(topic.stale_threshold_ms, 5_000);

        assert!(resolve_staleness(&rules, "market:trade", "BTCUSDT", MarketType::Spot).is_none());
    }
}
