// =============================================================================
// Liquidations Aggregator - bucketed counts and notional with side breakdown
// =============================================================================
//
// Liquidation prints are accumulated per (symbol, market type) into buckets
// closing at `ceil(t / bucket_ms) * bucket_ms`. Notional is unit-aware:
//
//   base       -> price * size
//   usd        -> size
//   contracts  -> suppressed with NON_COMPARABLE(contracts) unless a
//                 per-source unit override converts them
//
// Venue trust caps (e.g. OKX's truncated liquidation feed) cap the bucket's
// confidence score through the per-source `trust_cap` tuning.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::aggregators::{bucket_end_ts, clamp_confidence};
use crate::bus::EventBus;
use crate::config::AggregatorConfig;
use crate::events::{FusionInfo, LiquidationEvent, LiquidationsAggEvent, SuppressedSource, ValueUnit};
use crate::meta::{Clock, EventMeta, TsMillis};
use crate::topics;
use crate::types::{MarketType, Side};

#[derive(Debug, Default)]
struct Bucket {
    bucket_end: Option<TsMillis>,
    count: u64,
    notional: f64,
    buy_count: u64,
    sell_count: u64,
    buy_notional: f64,
    sell_notional: f64,
    per_source_notional: HashMap<String, f64>,
    suppressed: Vec<SuppressedSource>,
    trust_cap: f64,
}

impl Bucket {
    fn fresh() -> Self {
        Self {
            trust_cap: 1.0,
            ..Self::default()
        }
    }
}

pub struct LiquidationsAggregator {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: AggregatorConfig,
    state: Mutex<HashMap<(String, MarketType), Bucket>>,
}

impl LiquidationsAggregator {
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
        self.bus.subscribe(topics::MARKET_LIQUIDATION, move |event| {
            agg.on_liquidation(event);
            Ok(())
        });
    }

    fn on_liquidation(&self, event: &LiquidationEvent) {
        let source = event.stream_id.as_str();
        let tuning = self.config.tuning(source);
        let unit = tuning.unit.unwrap_or(event.unit);
        let size = event.size * tuning.unit_multiplier;

        let notional = match unit {
            ValueUnit::Base => Some(event.price * size),
            ValueUnit::Usd => Some(size),
            ValueUnit::Contracts => None,
        };

        let end = bucket_end_ts(event.meta.ts_event, self.config.bucket_ms);
        let key = (event.symbol.clone(), event.market_type);

        let mut state = self.state.lock();
        let bucket = state.entry(key).or_insert_with(Bucket::fresh);

        let mut closed: Option<Bucket> = None;
        match bucket.bucket_end {
            None => bucket.bucket_end = Some(end),
            Some(current) if end > current => {
                closed = Some(std::mem::replace(bucket, Bucket::fresh()));
                bucket.bucket_end = Some(end);
            }
            _ => {}
        }

        match notional {
            Some(notional) => {
                bucket.count += 1;
                bucket.notional += notional;
                match event.side {
                    Side::Buy => {
                        bucket.buy_count += 1;
                        bucket.buy_notional += notional;
                    }
                    Side::Sell => {
                        bucket.sell_count += 1;
                        bucket.sell_notional += notional;
                    }
                }
                *bucket
                    .per_source_notional
                    .entry(source.to_string())
                    .or_insert(0.0) += notional;
                if let Some(cap) = tuning.trust_cap {
                    bucket.trust_cap = bucket.trust_cap.min(cap);
                }
            }
            None => {
                debug!(
                    symbol = %event.symbol,
                    source,
                    "liquidation in non-comparable unit suppressed"
                );
                if !bucket.suppressed.iter().any(|s| s.source == source) {
                    bucket.suppressed.push(SuppressedSource {
                        source: source.to_string(),
                        reason: format!("NON_COMPARABLE({unit})"),
                    });
                }
            }
        }
        drop(state);

        if let Some(closed) = closed {
            self.emit_bucket(event, closed);
        }
    }

    fn emit_bucket(&self, event: &LiquidationEvent, bucket: Bucket) {
        let Some(bucket_end) = bucket.bucket_end else {
            return;
        };
        if bucket.count == 0 && bucket.suppressed.is_empty() {
            return;
        }

        let breakdown: BTreeMap<String, f64> = bucket.per_source_notional.into_iter().collect();
        let weights: BTreeMap<String, f64> = breakdown
            .keys()
            .map(|src| (src.clone(), self.config.tuning(src).weight))
            .collect();

        let mut fusion = FusionInfo::from_breakdown(breakdown, weights, 0);
        fusion.confidence_score = clamp_confidence(bucket.trust_cap);
        if bucket.trust_cap < 1.0 {
            fusion.confidence_explain = Some(format!("trust_cap={}", bucket.trust_cap));
        }

        let agg = LiquidationsAggEvent {
            meta: EventMeta::inherit(&event.meta, "liquidations-agg", self.clock.now_ms()),
            symbol: event.symbol.clone(),
            market_type: event.market_type,
            bucket_end_ts: bucket_end,
            count: bucket.count,
            notional: bucket.notional,
            buy_count: bucket.buy_count,
            sell_count: bucket.sell_count,
            buy_notional: bucket.buy_notional,
            sell_notional: bucket.sell_notional,
            suppressed: bucket.suppressed,
            fusion,
        };
        self.bus.publish(topics::MARKET_LIQUIDATIONS_AGG, &agg);
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

    fn liq(source: &str, side: Side, price: f64, size: f64, unit: ValueUnit, ts: i64) -> LiquidationEvent {
        let stream_id = StreamId::from(source);
        LiquidationEvent {
            meta: EventMeta::new("test", TsMillis(ts))
                .at(TsMillis(ts))
                .with_stream(stream_id.clone()),
            symbol: "BTCUSDT".to_string(),
            market_type: MarketType::Futures,
            stream_id,
            side,
            price,
            size,
            unit,
        }
    }

    fn setup(config: AggregatorConfig) -> (Arc<EventBus>, Arc<PMutex<Vec<LiquidationsAggEvent>>>) {
        let bus = Arc::new(EventBus::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let agg = LiquidationsAggregator::new(bus.clone(), clock, config);
        agg.start();

        let seen = Arc::new(PMutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe(topics::MARKET_LIQUIDATIONS_AGG, move |e| {
            s.lock().push(e.clone());
            Ok(())
        });
        (bus, seen)
    }

    #[test]
    fn bucket_accumulates_with_side_breakdown() {
        let (bus, seen) = setup(AggregatorConfig {
            bucket_ms: 1_000,
            ..AggregatorConfig::default()
        });

        bus.publish(topics::MARKET_LIQUIDATION, &liq("b:liq:f", Side::Sell, 100.0, 2.0, ValueUnit::Base, 100));
        bus.publish(topics::MARKET_LIQUIDATION, &liq("b:liq:f", Side::Buy, 100.0, 1.0, ValueUnit::Base, 500));
        assert!(seen.lock().is_empty());

        // Next bucket closes the first.
        bus.publish(topics::MARKET_LIQUIDATION, &liq("b:liq:f", Side::Sell, 100.0, 1.0, ValueUnit::Base, 1_500));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let e = &seen[0];
        assert_eq!(e.bucket_end_ts, TsMillis(1_000));
        assert_eq!(e.count, 2);
        assert_eq!(e.notional, 300.0);
        assert_eq!(e.sell_count, 1);
        assert_eq!(e.buy_count, 1);
        assert_eq!(e.sell_notional, 200.0);
        assert_eq!(e.buy_notional, 100.0);
    }

    #[test]
    fn usd_unit_counts_size_as_notional() {
        let (bus, seen) = setup(AggregatorConfig {
            bucket_ms: 1_000,
            ..AggregatorConfig::default()
        });

        bus.publish(topics::MARKET_LIQUIDATION, &liq("b:liq:f", Side::Sell, 99.0, 5_000.0, ValueUnit::Usd, 100));
        bus.publish(topics::MARKET_LIQUIDATION, &liq("b:liq:f", Side::Sell, 99.0, 1.0, ValueUnit::Usd, 1_500));

        let seen = seen.lock();
        assert_eq!(seen[0].notional, 5_000.0);
    }

    #[test]
    fn contract_unit_suppressed_into_bucket() {
        let (bus, seen) = setup(AggregatorConfig {
            bucket_ms: 1_000,
            ..AggregatorConfig::default()
        });

        bus.publish(topics::MARKET_LIQUIDATION, &liq("okx:liq:f", Side::Sell, 100.0, 10.0, ValueUnit::Contracts, 100));
        bus.publish(topics::MARKET_LIQUIDATION, &liq("b:liq:f", Side::Buy, 100.0, 1.0, ValueUnit::Base, 200));
        bus.publish(topics::MARKET_LIQUIDATION, &liq("b:liq:f", Side::Buy, 100.0, 1.0, ValueUnit::Base, 1_500));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let e = &seen[0];
        assert_eq!(e.count, 1); // only the base print counted
        assert_eq!(e.suppressed.len(), 1);
        assert_eq!(e.suppressed[0].reason, "NON_COMPARABLE(contracts)");
    }

    #[test]
    fn trust_cap_caps_bucket_confidence() {
        let mut config = AggregatorConfig {
            bucket_ms: 1_000,
            ..AggregatorConfig::default()
        };
        config.sources.insert(
            "okx:liq:f".to_string(),
            SourceTuning {
                trust_cap: Some(0.7),
                ..SourceTuning::default()
            },
        );
        let (bus, seen) = setup(config);

        bus.publish(topics::MARKET_LIQUIDATION, &liq("okx:liq:f", Side::Sell, 100.0, 1.0, ValueUnit::Base, 100));
        bus.publish(topics::MARKET_LIQUIDATION, &liq("okx:liq:f", Side::Sell, 100.0, 1.0, ValueUnit::Base, 1_500));

        let seen = seen.lock();
        assert_eq!(seen[0].fusion.confidence_score, 0.7);
    }
}
