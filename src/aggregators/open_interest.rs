// =============================================================================
// Open Interest Aggregator - unit-aware fusion with mismatch detection
// =============================================================================
//
// Sources report OI in contracts, base or USD. Values are only fused when
// they share a comparable unit:
//
//   - contracts are never comparable without a configured contract size
//     (a per-source `unit_multiplier` + `unit` override converts them
//     upstream); unconverted contract sources are suppressed with
//     NON_COMPARABLE(contracts)
//   - USD converts to base through a fresh canonical price; without one, USD
//     sources fuse among themselves or are suppressed when base sources are
//     present
//
// Mismatch detection compares comparable fresh values against a deterministic
// baseline (`median` by default, or a named venue). With fewer than two
// comparable sources the check itself is suppressed and reported once via
// `data:mismatch` with `suppression_reason = "NO_COMPARABLE_UNIT"`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::aggregators::{clamp_confidence, median, weighted_mean, SourceWindow};
use crate::bus::EventBus;
use crate::config::AggregatorConfig;
use crate::events::{
    CanonicalPriceEvent, FusionInfo, MismatchEvent, OiAggEvent, OpenInterestEvent,
    SuppressedSource, ValueUnit,
};
use crate::meta::{Clock, EventMeta, TsMillis};
use crate::topics;
use crate::types::MarketType;

const MISMATCH_CONF_PENALTY: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
struct OiObservation {
    value: f64,
    unit: ValueUnit,
}

#[derive(Debug)]
struct SymbolState {
    sources: SourceWindow<OiObservation>,
    canonical_price: Option<(f64, TsMillis)>,
    last_emit: Option<TsMillis>,
    /// Set once the NO_COMPARABLE_UNIT snapshot has been emitted; cleared
    /// when the mismatch check becomes evaluable again.
    suppression_reported: bool,
}

impl SymbolState {
    fn new(ttl_ms: i64) -> Self {
        Self {
            sources: SourceWindow::new(ttl_ms),
            canonical_price: None,
            last_emit: None,
            suppression_reported: false,
        }
    }
}

pub struct OpenInterestAggregator {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: AggregatorConfig,
    state: Mutex<HashMap<(String, MarketType), SymbolState>>,
}

impl OpenInterestAggregator {
    pub fn new(bus: Arc<EventBus>, clock: Arc<dyn Clock>, config: AggregatorConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            clock,
            config,
            state: Mutex::new(HashMap::new()),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let agg = self.clone();
        self.bus.subscribe(topics::MARKET_OI, move |event| {
            agg.on_oi(event);
            Ok(())
        });

        let agg = self.clone();
        self.bus
            .subscribe(topics::MARKET_PRICE_CANONICAL, move |event| {
                agg.on_canonical_price(event);
                Ok(())
            });
    }

    fn on_canonical_price(&self, event: &CanonicalPriceEvent) {
        let ts = event.meta.ts_ingest.unwrap_or_else(|| self.clock.now_ms());
        let mut state = self.state.lock();
        let entry = state
            .entry((event.symbol.clone(), event.market_type))
            .or_insert_with(|| SymbolState::new(self.config.ttl_ms));
        entry.canonical_price = Some((event.price, ts));
    }

    fn on_oi(&self, event: &OpenInterestEvent) {
        let source = event.stream_id.as_str();
        let tuning = self.config.tuning(source);
        let observation = OiObservation {
            value: event.open_interest * tuning.unit_multiplier,
            unit: tuning.unit.unwrap_or(event.unit),
        };

        let now = self.clock.now_ms();
        let ts = event.meta.ts_ingest.unwrap_or(now);

        let mut state = self.state.lock();
        let entry = state
            .entry((event.symbol.clone(), event.market_type))
            .or_insert_with(|| SymbolState::new(self.config.ttl_ms));
        entry.sources.upsert(source, observation, ts);

        if let Some(last) = entry.last_emit {
            if now.delta_ms(last) < self.config.min_emit_interval_ms {
                return;
            }
        }
        entry.last_emit = Some(now);

        let (fresh, dropped) = entry.sources.fresh(now);
        let price = entry
            .canonical_price
            .filter(|(_, pts)| now.delta_ms(*pts) <= self.config.ttl_ms)
            .map(|(p, _)| p);
        let already_reported = entry.suppression_reported;
        drop(state);

        // Partition fresh observations into comparable values and suppressed
        // sources.
        let mut comparable: Vec<(String, f64)> = Vec::new();
        let mut suppressed: Vec<SuppressedSource> = Vec::new();
        let mut usd_only: Vec<(String, f64)> = Vec::new();
        let mut has_base = false;

        for (src, obs) in &fresh {
            match obs.value.unit {
                ValueUnit::Base => {
                    has_base = true;
                    comparable.push((src.clone(), obs.value.value));
                }
                ValueUnit::Usd => match price {
                    Some(p) if p > 0.0 => comparable.push((src.clone(), obs.value.value / p)),
                    _ => usd_only.push((src.clone(), obs.value.value)),
                },
                ValueUnit::Contracts => suppressed.push(SuppressedSource {
                    source: src.clone(),
                    reason: format!("NON_COMPARABLE({})", ValueUnit::Contracts),
                }),
            }
        }

        // Without a conversion basis, USD sources fuse among themselves only
        // when no base source is present.
        let unit = if !usd_only.is_empty() && !has_base && comparable.is_empty() {
            comparable = std::mem::take(&mut usd_only);
            ValueUnit::Usd
        } else {
            for (src, _) in usd_only {
                suppressed.push(SuppressedSource {
                    source: src,
                    reason: format!("NON_COMPARABLE({})", ValueUnit::Usd),
                });
            }
            ValueUnit::Base
        };

        // Mismatch detection needs at least two comparable values.
        let (mismatch_detected, baseline_label, deviation) = if comparable.len() >= 2 {
            self.detect_mismatch(&comparable)
        } else {
            (false, self.config.oi_baseline.clone(), 0.0)
        };

        // The suppression snapshot is about unit incompatibility, not about a
        // single-source startup: it only fires when some source was actually
        // excluded for its unit.
        let mismatch_evaluable = comparable.len() >= 2;
        if !mismatch_evaluable && !suppressed.is_empty() {
            if !already_reported {
                self.mark_suppression(&event.symbol, event.market_type, true);
                let snapshot = MismatchEvent {
                    meta: EventMeta::inherit(&event.meta, "oi-agg", now),
                    symbol: event.symbol.clone(),
                    topic: topics::MARKET_OI.name().to_string(),
                    baseline: baseline_label.clone(),
                    values: BTreeMap::new(),
                    deviation_pct: 0.0,
                    suppressed: true,
                    suppression_reason: Some("NO_COMPARABLE_UNIT".to_string()),
                };
                self.bus.publish(topics::DATA_MISMATCH, &snapshot);
            }
        } else if mismatch_evaluable {
            self.mark_suppression(&event.symbol, event.market_type, false);
        }

        if comparable.is_empty() {
            debug!(symbol = %event.symbol, "no comparable OI source, aggregate skipped");
            return;
        }

        if mismatch_detected {
            let values: BTreeMap<String, f64> = comparable.iter().cloned().collect();
            let mismatch = MismatchEvent {
                meta: EventMeta::inherit(&event.meta, "oi-agg", now),
                symbol: event.symbol.clone(),
                topic: topics::MARKET_OI.name().to_string(),
                baseline: baseline_label.clone(),
                values,
                deviation_pct: deviation,
                suppressed: false,
                suppression_reason: None,
            };
            self.bus.publish(topics::DATA_MISMATCH, &mismatch);
        }

        let mut breakdown = BTreeMap::new();
        let mut weights = BTreeMap::new();
        let mut pairs = Vec::with_capacity(comparable.len());
        for (src, value) in &comparable {
            let w = self.config.tuning(src).weight;
            breakdown.insert(src.clone(), *value);
            weights.insert(src.clone(), w);
            pairs.push((*value, w));
        }
        let Some(open_interest) = weighted_mean(&pairs) else {
            return;
        };

        let fresh_count = breakdown.len();
        let mut fusion = FusionInfo::from_breakdown(breakdown, weights, dropped);
        fusion.mismatch_detected = mismatch_detected;
        let freshness = if dropped == 0 {
            1.0
        } else {
            fresh_count as f64 / (fresh_count + dropped) as f64
        };
        let penalty = if mismatch_detected {
            MISMATCH_CONF_PENALTY
        } else {
            1.0
        };
        fusion.confidence_score = clamp_confidence(freshness * penalty);
        if mismatch_detected {
            fusion.confidence_explain =
                Some(format!("mismatch vs {baseline_label} ({deviation:.1}%)"));
        }

        let agg = OiAggEvent {
            meta: EventMeta::inherit(&event.meta, "oi-agg", now),
            symbol: event.symbol.clone(),
            market_type: event.market_type,
            open_interest,
            unit,
            baseline: baseline_label,
            suppressed,
            fusion,
        };
        self.bus.publish(topics::MARKET_OI_AGG, &agg);
    }

    fn mark_suppression(&self, symbol: &str, market_type: MarketType, value: bool) {
        let mut state = self.state.lock();
        if let Some(entry) = state.get_mut(&(symbol.to_string(), market_type)) {
            entry.suppression_reported = value;
        }
    }

    /// Deviation of comparable values from the configured baseline, as a
    /// percentage of the baseline.
    fn detect_mismatch(&self, comparable: &[(String, f64)]) -> (bool, String, f64) {
        let values: Vec<f64> = comparable.iter().map(|(_, v)| *v).collect();

        let (baseline_label, baseline) = if self.config.oi_baseline == "median" {
            ("median".to_string(), median(&values))
        } else {
            let venue_value = comparable
                .iter()
                .find(|(src, _)| src.starts_with(&self.config.oi_baseline))
                .map(|(_, v)| *v);
            match venue_value {
                Some(v) => (self.config.oi_baseline.clone(), Some(v)),
                // Baseline venue absent: deterministic fallback to median.
                None => ("median".to_string(), median(&values)),
            }
        };

        let Some(baseline) = baseline else {
            return (false, baseline_label, 0.0);
        };
        if baseline == 0.0 {
            return (false, baseline_label, 0.0);
        }

        let max_deviation = values
            .iter()
            .map(|v| ((v - baseline) / baseline).abs())
            .fold(0.0f64, f64::max);

        (
            max_deviation > self.config.mismatch_threshold_pct,
            baseline_label,
            max_deviation * 100.0,
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceTuning;
    use crate::meta::{ManualClock, StreamId};
    use parking_lot::Mutex as PMutex;

    fn oi(source: &str, value: f64, unit: ValueUnit, ts: i64) -> OpenInterestEvent {
        let stream_id = StreamId::from(source);
        OpenInterestEvent {
            meta: EventMeta::new("test", TsMillis(ts)).with_stream(stream_id.clone()),
            symbol: "BTCUSDT".to_string(),
            market_type: MarketType::Futures,
            stream_id,
            open_interest: value,
            unit,
        }
    }

    fn canonical(price: f64, ts: i64) -> CanonicalPriceEvent {
        CanonicalPriceEvent {
            meta: EventMeta::new("canonical-price", TsMillis(ts)),
            symbol: "BTCUSDT".to_string(),
            market_type: MarketType::Futures,
            price,
            price_type_used: crate::events::PriceType::Index,
            fallback_reason: None,
            fusion: FusionInfo::default(),
        }
    }

    fn capture<P: Clone + Send + Sync + 'static>(
        bus: &EventBus,
        topic: crate::bus::Topic<P>,
    ) -> Arc<PMutex<Vec<P>>> {
        let seen = Arc::new(PMutex::new(Vec::new()));
        let seen2 = seen.clone();
        bus.subscribe(topic, move |e| {
            seen2.lock().push(e.clone());
            Ok(())
        });
        seen
    }

    fn setup(config: AggregatorConfig) -> Arc<EventBus> {
        let bus = Arc::new(EventBus::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let agg = OpenInterestAggregator::new(bus.clone(), clock, config);
        agg.start();
        bus
    }

    #[test]
    fn base_sources_fuse_directly() {
        let bus = setup(AggregatorConfig::default());
        let aggs = capture(&bus, topics::MARKET_OI_AGG);

        bus.publish(topics::MARKET_OI, &oi("binance:oi:futures", 100.0, ValueUnit::Base, 500));
        bus.publish(topics::MARKET_OI, &oi("bybit:oi:futures", 200.0, ValueUnit::Base, 600));

        let aggs = aggs.lock();
        let e = aggs.last().unwrap();
        assert_eq!(e.open_interest, 150.0);
        assert_eq!(e.unit, ValueUnit::Base);
        assert!(e.suppressed.is_empty());
        assert!(!e.fusion.mismatch_detected);
    }

    #[test]
    fn usd_converts_through_fresh_canonical_price() {
        let bus = setup(AggregatorConfig::default());
        let aggs = capture(&bus, topics::MARKET_OI_AGG);

        bus.publish(topics::MARKET_PRICE_CANONICAL, &canonical(100.0, 500));
        bus.publish(topics::MARKET_OI, &oi("binance:oi:futures", 100.0, ValueUnit::Base, 500));
        bus.publish(topics::MARKET_OI, &oi("okx:oi:futures", 20_000.0, ValueUnit::Usd, 600));

        let aggs = aggs.lock();
        let e = aggs.last().unwrap();
        // 20_000 USD at price 100 converts to 200 base; mean(100, 200) = 150.
        assert_eq!(e.open_interest, 150.0);
        assert!(e.suppressed.is_empty());
    }

    #[test]
    fn contracts_without_contract_size_are_suppressed() {
        // Scenario: three venues in incompatible units (two contracts without
        // contract size, one base). Mismatch cannot be evaluated: a single
        // suppressed snapshot is emitted and mismatch count stays zero.
        let bus = setup(AggregatorConfig::default());
        let aggs = capture(&bus, topics::MARKET_OI_AGG);
        let mismatches = capture(&bus, topics::DATA_MISMATCH);

        bus.publish(topics::MARKET_OI, &oi("okx:oi:futures", 5_000.0, ValueUnit::Contracts, 500));
        bus.publish(topics::MARKET_OI, &oi("deribit:oi:futures", 7_000.0, ValueUnit::Contracts, 550));
        bus.publish(topics::MARKET_OI, &oi("binance:oi:futures", 100.0, ValueUnit::Base, 600));

        let mismatches = mismatches.lock();
        let suppressed: Vec<_> = mismatches.iter().filter(|m| m.suppressed).collect();
        let real: Vec<_> = mismatches.iter().filter(|m| !m.suppressed).collect();
        assert_eq!(real.len(), 0);
        assert_eq!(suppressed.len(), 1);
        assert_eq!(
            suppressed[0].suppression_reason.as_deref(),
            Some("NO_COMPARABLE_UNIT")
        );

        let aggs = aggs.lock();
        let e = aggs.last().unwrap();
        assert_eq!(e.open_interest, 100.0);
        assert_eq!(e.suppressed.len(), 2);
        assert!(e.suppressed.iter().all(|s| s.reason == "NON_COMPARABLE(contracts)"));
    }

    #[test]
    fn contract_size_override_makes_contracts_comparable() {
        let mut config = AggregatorConfig::default();
        config.sources.insert(
            "okx:oi:futures".to_string(),
            SourceTuning {
                unit_multiplier: 0.01, // contract size in base units
                unit: Some(ValueUnit::Base),
                ..SourceTuning::default()
            },
        );
        let bus = setup(config);
        let aggs = capture(&bus, topics::MARKET_OI_AGG);

        bus.publish(topics::MARKET_OI, &oi("okx:oi:futures", 10_000.0, ValueUnit::Contracts, 500));
        bus.publish(topics::MARKET_OI, &oi("binance:oi:futures", 100.0, ValueUnit::Base, 600));

        let aggs = aggs.lock();
        let e = aggs.last().unwrap();
        assert_eq!(e.open_interest, 100.0); // mean(100, 100)
        assert!(e.suppressed.is_empty());
    }

    #[test]
    fn mismatch_detected_against_median_baseline() {
        let bus = setup(AggregatorConfig {
            mismatch_threshold_pct: 0.2,
            ..AggregatorConfig::default()
        });
        let aggs = capture(&bus, topics::MARKET_OI_AGG);
        let mismatches = capture(&bus, topics::DATA_MISMATCH);

        bus.publish(topics::MARKET_OI, &oi("binance:oi:futures", 100.0, ValueUnit::Base, 500));
        bus.publish(topics::MARKET_OI, &oi("bybit:oi:futures", 102.0, ValueUnit::Base, 550));
        bus.publish(topics::MARKET_OI, &oi("okx2:oi:futures", 300.0, ValueUnit::Base, 600));

        let mismatches = mismatches.lock();
        let real: Vec<_> = mismatches.iter().filter(|m| !m.suppressed).collect();
        assert_eq!(real.len(), 1);
        assert_eq!(real[0].baseline, "median");

        let aggs = aggs.lock();
        let e = aggs.last().unwrap();
        assert!(e.fusion.mismatch_detected);
        assert!(e.fusion.confidence_score <= 0.5);
    }

    #[test]
    fn venue_baseline_strategy() {
        let bus = setup(AggregatorConfig {
            oi_baseline: "bybit".to_string(),
            mismatch_threshold_pct: 0.2,
            ..AggregatorConfig::default()
        });
        let mismatches = capture(&bus, topics::DATA_MISMATCH);

        bus.publish(topics::MARKET_OI, &oi("bybit:oi:futures", 100.0, ValueUnit::Base, 500));
        bus.publish(topics::MARKET_OI, &oi("binance:oi:futures", 150.0, ValueUnit::Base, 600));

        let mismatches = mismatches.lock();
        let real: Vec<_> = mismatches.iter().filter(|m| !m.suppressed).collect();
        assert_eq!(real.len(), 1);
        assert_eq!(real[0].baseline, "bybit");
    }
}
