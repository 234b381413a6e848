// =============================================================================
// CVD Aggregator - cumulative volume delta per market type, plus volume
// =============================================================================
//
// Delta sign follows the taker side (`Buy` -> +size, `Sell` -> -size), with
// per-stream sign overrides for venues whose side convention is inverted and
// per-stream unit multipliers normalizing size units before fusion.
//
// The fused CVD is the weight-scaled sum of per-source running totals over
// fresh sources. A running view is emitted on `market:cvd_spot` /
// `market:cvd_futures` on every relevant input (throttled by
// `min_emit_interval_ms`); bucket closes additionally emit on the `_agg`
// topics, `market:cvd_agg` and `analytics:flow`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::aggregators::{bucket_end_ts, clamp_confidence, SourceWindow};
use crate::bus::EventBus;
use crate::config::AggregatorConfig;
use crate::events::{CvdAggEvent, FlowEvent, FusionInfo, TradeEvent, VolumeAggEvent};
use crate::meta::{Clock, EventMeta, TsMillis};
use crate::topics;
use crate::types::MarketType;

#[derive(Debug)]
struct CvdState {
    /// Per-source running totals after sign/unit adjustment.
    totals: SourceWindow<f64>,
    bucket_end: Option<TsMillis>,
    bucket_delta: f64,
    last_emit: Option<TsMillis>,
}

impl CvdState {
    fn new(ttl_ms: i64) -> Self {
        Self {
            totals: SourceWindow::new(ttl_ms),
            bucket_end: None,
            bucket_delta: 0.0,
            last_emit: None,
        }
    }
}

pub struct CvdAggregator {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: AggregatorConfig,
    debug: bool,
    state: Mutex<HashMap<(String, MarketType), CvdState>>,
}

impl CvdAggregator {
    pub fn new(
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: AggregatorConfig,
        debug: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            clock,
            config,
            debug,
            state: Mutex::new(HashMap::new()),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let agg = self.clone();
        self.bus.subscribe(topics::MARKET_TRADE, move |trade| {
            agg.on_trade(trade);
            Ok(())
        });
    }

    fn on_trade(&self, trade: &TradeEvent) {
        let source = trade.stream_id.as_str();
        let tuning = self.config.tuning(source);
        let signed = trade.side.delta_sign()
            * trade.size
            * tuning.unit_multiplier
            * tuning.sign_override.unwrap_or(1.0);

        let now = self.clock.now_ms();
        let ts = trade.meta.ts_ingest.unwrap_or(now);
        let key = (trade.symbol.clone(), trade.market_type);

        let mut state = self.state.lock();
        let entry = state
            .entry(key)
            .or_insert_with(|| CvdState::new(self.config.ttl_ms));

        let total = entry.totals.get(source).map(|e| e.value).unwrap_or(0.0) + signed;
        entry.totals.upsert(source, total, ts);

        if self.debug {
            debug!(
                symbol = %trade.symbol,
                source,
                signed,
                total,
                "cvd input"
            );
        }

        // Bucket bookkeeping keyed by trade time.
        let end = bucket_end_ts(trade.trade_ts, self.config.bucket_ms);
        let mut closed: Option<(TsMillis, f64)> = None;
        match entry.bucket_end {
            None => entry.bucket_end = Some(end),
            Some(current) if end > current => {
                closed = Some((current, entry.bucket_delta));
                entry.bucket_delta = 0.0;
                entry.bucket_end = Some(end);
            }
            _ => {}
        }
        entry.bucket_delta += signed;

        let throttled = entry
            .last_emit
            .is_some_and(|last| now.delta_ms(last) < self.config.min_emit_interval_ms);
        if !throttled {
            entry.last_emit = Some(now);
        }

        let (fresh, dropped) = entry.totals.fresh(now);
        let bucket_delta = entry.bucket_delta;
        let current_end = entry.bucket_end.unwrap_or(end);
        drop(state);

        let mut breakdown = std::collections::BTreeMap::new();
        let mut weights = std::collections::BTreeMap::new();
        let mut cvd = 0.0;
        for (src, observed) in &fresh {
            let w = self.config.tuning(src).weight;
            breakdown.insert(src.clone(), observed.value);
            weights.insert(src.clone(), w);
            cvd += observed.value * w;
        }

        let fresh_count = breakdown.len();
        let mut fusion = FusionInfo::from_breakdown(breakdown, weights, dropped);
        fusion.confidence_score = clamp_confidence(if dropped == 0 {
            1.0
        } else {
            fresh_count as f64 / (fresh_count + dropped) as f64
        });

        // Close the previous bucket first so flow consumers see ordered
        // bucket ends.
        if let Some((closed_end, closed_delta)) = closed {
            self.emit_bucket(trade, closed_end, closed_delta, cvd, &fusion);
        }

        if !throttled {
            let event = CvdAggEvent {
                meta: EventMeta::inherit(&trade.meta, "cvd", now),
                symbol: trade.symbol.clone(),
                market_type: trade.market_type,
                bucket_end_ts: current_end,
                cvd,
                bucket_delta,
                fusion,
            };
            let topic = match trade.market_type {
                MarketType::Futures => topics::MARKET_CVD_FUTURES,
                _ => topics::MARKET_CVD_SPOT,
            };
            self.bus.publish(topic, &event);
        }
    }

    fn emit_bucket(
        &self,
        trade: &TradeEvent,
        bucket_end: TsMillis,
        bucket_delta: f64,
        cvd: f64,
        fusion: &FusionInfo,
    ) {
        let now = self.clock.now_ms();
        let event = CvdAggEvent {
            meta: EventMeta::inherit(&trade.meta, "cvd", now),
            symbol: trade.symbol.clone(),
            market_type: trade.market_type,
            bucket_end_ts: bucket_end,
            cvd,
            bucket_delta,
            fusion: fusion.clone(),
        };

        let market_topic = match trade.market_type {
            MarketType::Futures => topics::MARKET_CVD_FUTURES_AGG,
            _ => topics::MARKET_CVD_SPOT_AGG,
        };
        self.bus.publish(market_topic, &event);
        self.bus.publish(topics::MARKET_CVD_AGG, &event);

        let flow = FlowEvent {
            meta: EventMeta::inherit(&trade.meta, "cvd", now),
            symbol: trade.symbol.clone(),
            market_type: trade.market_type,
            cvd,
            bucket_delta,
            bucket_end_ts: bucket_end,
        };
        self.bus.publish(topics::ANALYTICS_FLOW, &flow);
    }
}

// =============================================================================
// VolumeAggregator
// =============================================================================

#[derive(Debug, Default)]
struct VolumeBucket {
    bucket_end: Option<TsMillis>,
    per_source: HashMap<String, f64>,
    volume: f64,
    quote_volume: f64,
}

/// Bucketed traded volume per (symbol, market type), emitted on
/// `market:volume_agg` at bucket close.
pub struct VolumeAggregator {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    bucket_ms: i64,
    state: Mutex<HashMap<(String, MarketType), VolumeBucket>>,
}

impl VolumeAggregator {
    pub fn new(bus: Arc<EventBus>, clock: Arc<dyn Clock>, bucket_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            bus,
            clock,
            bucket_ms,
            state: Mutex::new(HashMap::new()),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let agg = self.clone();
        self.bus.subscribe(topics::MARKET_TRADE, move |trade| {
            agg.on_trade(trade);
            Ok(())
        });
    }

    fn on_trade(&self, trade: &TradeEvent) {
        let end = bucket_end_ts(trade.trade_ts, self.bucket_ms);
        let key = (trade.symbol.clone(), trade.market_type);

        let mut state = self.state.lock();
        let bucket = state.entry(key).or_default();

        let mut closed: Option<VolumeBucket> = None;
        match bucket.bucket_end {
            None => bucket.bucket_end = Some(end),
            Some(current) if end > current => {
                closed = Some(std::mem::take(bucket));
                bucket.bucket_end = Some(end);
            }
            _ => {}
        }

        bucket.volume += trade.size;
        bucket.quote_volume += trade.size * trade.price;
        *bucket
            .per_source
            .entry(trade.stream_id.as_str().to_string())
            .or_insert(0.0) += trade.size;
        drop(state);

        if let Some(closed) = closed {
            let Some(closed_end) = closed.bucket_end else {
                return;
            };
            let breakdown: std::collections::BTreeMap<String, f64> =
                closed.per_source.into_iter().collect();
            let fusion = FusionInfo::from_breakdown(breakdown, Default::default(), 0);

            let event = VolumeAggEvent {
                meta: EventMeta::inherit(&trade.meta, "volume", self.clock.now_ms()),
                symbol: trade.symbol.clone(),
                market_type: trade.market_type,
                bucket_end_ts: closed_end,
                volume: closed.volume,
                quote_volume: closed.quote_volume,
                fusion,
            };
            self.bus.publish(topics::MARKET_VOLUME_AGG, &event);
        }
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
    use crate::types::Side;
    use parking_lot::Mutex as PMutex;

    fn trade(source: &str, symbol: &str, side: Side, size: f64, trade_ts: i64) -> TradeEvent {
        let stream_id = StreamId::from(source);
        TradeEvent {
            meta: EventMeta::new("test", TsMillis(trade_ts))
                .at(TsMillis(trade_ts))
                .with_stream(stream_id.clone()),
            symbol: symbol.to_string(),
            market_type: MarketType::Spot,
            stream_id,
            trade_ts: TsMillis(trade_ts),
            price: 100.0,
            size,
            side,
            trade_id: None,
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
        let agg = CvdAggregator::new(bus.clone(), clock, config, false);
        agg.start();
        bus
    }

    #[test]
    fn sign_by_side_accumulates() {
        let bus = setup(AggregatorConfig::default());
        let seen = capture(&bus, topics::MARKET_CVD_SPOT);

        bus.publish(topics::MARKET_TRADE, &trade("s1", "BTCUSDT", Side::Buy, 10.0, 100));
        bus.publish(topics::MARKET_TRADE, &trade("s1", "BTCUSDT", Side::Sell, 4.0, 200));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].cvd, 10.0);
        assert_eq!(seen[1].cvd, 6.0);
    }

    #[test]
    fn sign_override_flips_a_source() {
        // Scenario: two sources, same symbol, s2 configured with a -1 sign
        // override. Both report +10 total; the aggregate cancels to zero.
        let mut config = AggregatorConfig::default();
        config.sources.insert(
            "s2".to_string(),
            SourceTuning {
                sign_override: Some(-1.0),
                ..SourceTuning::default()
            },
        );
        let bus = setup(config);
        let seen = capture(&bus, topics::MARKET_CVD_SPOT);

        bus.publish(topics::MARKET_TRADE, &trade("s1", "BTCUSDT", Side::Buy, 10.0, 100));
        bus.publish(topics::MARKET_TRADE, &trade("s2", "BTCUSDT", Side::Buy, 10.0, 200));

        let seen = seen.lock();
        let e = seen.last().unwrap();
        assert_eq!(e.cvd, 0.0);
        assert_eq!(e.fusion.venue_breakdown.get("s1"), Some(&10.0));
        assert_eq!(e.fusion.venue_breakdown.get("s2"), Some(&-10.0));
    }

    #[test]
    fn unit_multiplier_normalizes_before_fusion() {
        let mut config = AggregatorConfig::default();
        config.sources.insert(
            "s2".to_string(),
            SourceTuning {
                unit_multiplier: 0.001,
                ..SourceTuning::default()
            },
        );
        let bus = setup(config);
        let seen = capture(&bus, topics::MARKET_CVD_SPOT);

        bus.publish(topics::MARKET_TRADE, &trade("s1", "BTCUSDT", Side::Buy, 1.0, 100));
        bus.publish(topics::MARKET_TRADE, &trade("s2", "BTCUSDT", Side::Buy, 1_000.0, 200));

        let seen = seen.lock();
        assert_eq!(seen.last().unwrap().cvd, 2.0);
    }

    #[test]
    fn bucket_close_emits_agg_and_flow() {
        let bus = setup(AggregatorConfig {
            bucket_ms: 1_000,
            ..AggregatorConfig::default()
        });
        let agg_events = capture(&bus, topics::MARKET_CVD_AGG);
        let spot_agg = capture(&bus, topics::MARKET_CVD_SPOT_AGG);
        let flow = capture(&bus, topics::ANALYTICS_FLOW);

        bus.publish(topics::MARKET_TRADE, &trade("s1", "BTCUSDT", Side::Buy, 3.0, 500));
        bus.publish(topics::MARKET_TRADE, &trade("s1", "BTCUSDT", Side::Buy, 2.0, 900));
        assert!(agg_events.lock().is_empty());

        // Crossing into the next bucket closes [.., 1000].
        bus.publish(topics::MARKET_TRADE, &trade("s1", "BTCUSDT", Side::Sell, 1.0, 1_500));

        let agg_events = agg_events.lock();
        assert_eq!(agg_events.len(), 1);
        assert_eq!(agg_events[0].bucket_end_ts, TsMillis(1_000));
        assert_eq!(agg_events[0].bucket_delta, 5.0);
        assert_eq!(spot_agg.lock().len(), 1);
        assert_eq!(flow.lock().len(), 1);
    }

    #[test]
    fn futures_trades_use_futures_topics() {
        let bus = setup(AggregatorConfig::default());
        let spot = capture(&bus, topics::MARKET_CVD_SPOT);
        let futures = capture(&bus, topics::MARKET_CVD_FUTURES);

        let mut t = trade("f1", "BTCUSDT", Side::Buy, 1.0, 100);
        t.market_type = MarketType::Futures;
        bus.publish(topics::MARKET_TRADE, &t);

        assert!(spot.lock().is_empty());
        assert_eq!(futures.lock().len(), 1);
    }

    #[test]
    fn volume_bucket_close() {
        let bus = Arc::new(EventBus::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let agg = VolumeAggregator::new(bus.clone(), clock, 1_000);
        agg.start();
        let seen = capture(&bus, topics::MARKET_VOLUME_AGG);

        bus.publish(topics::MARKET_TRADE, &trade("s1", "BTCUSDT", Side::Buy, 2.0, 100));
        bus.publish(topics::MARKET_TRADE, &trade("s2", "BTCUSDT", Side::Sell, 3.0, 900));
        bus.publish(topics::MARKET_TRADE, &trade("s1", "BTCUSDT", Side::Buy, 1.0, 1_200));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let e = &seen[0];
        assert_eq!(e.volume, 5.0);
        assert_eq!(e.quote_volume, 500.0);
        assert_eq!(e.bucket_end_ts, TsMillis(1_000));
        assert_eq!(e.fusion.sources_used, vec!["s1", "s2"]);
    }
}
