// =============================================================================
// Funding Aggregator - weighted mean of fresh funding rates
// =============================================================================
//
// Funding rates are already dimensionless, so fusion is a plain weighted mean
// over fresh sources. Inputs missing `ts_ingest` are stamped with the local
// ingest clock before freshness is judged.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::aggregators::{clamp_confidence, weighted_mean, SourceWindow};
use crate::bus::EventBus;
use crate::config::AggregatorConfig;
use crate::events::{FundingAggEvent, FundingRateEvent, FusionInfo};
use crate::meta::{Clock, EventMeta, TsMillis};
use crate::topics;
use crate::types::MarketType;

#[derive(Debug)]
struct SymbolState {
    rates: SourceWindow<f64>,
    last_emit: Option<TsMillis>,
}

pub struct FundingAggregator {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: AggregatorConfig,
    state: Mutex<HashMap<(String, MarketType), SymbolState>>,
}

impl FundingAggregator {
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
        self.bus.subscribe(topics::MARKET_FUNDING, move |event| {
            agg.on_funding(event);
            Ok(())
        });
    }

    fn on_funding(&self, event: &FundingRateEvent) {
        let now = self.clock.now_ms();
        // Local ingest time as fallback when the input lacks ts_ingest.
        let ts = event.meta.ts_ingest.unwrap_or(now);
        let source = event.stream_id.as_str();

        let mut state = self.state.lock();
        let entry = state
            .entry((event.symbol.clone(), event.market_type))
            .or_insert_with(|| SymbolState {
                rates: SourceWindow::new(self.config.ttl_ms),
                last_emit: None,
            });
        entry.rates.upsert(source, event.rate, ts);

        if let Some(last) = entry.last_emit {
            if now.delta_ms(last) < self.config.min_emit_interval_ms {
                return;
            }
        }
        entry.last_emit = Some(now);

        let (fresh, dropped) = entry.rates.fresh(now);
        drop(state);

        if fresh.is_empty() {
            debug!(symbol = %event.symbol, "no fresh funding source, aggregate skipped");
            return;
        }

        let mut breakdown = std::collections::BTreeMap::new();
        let mut weights = std::collections::BTreeMap::new();
        let mut pairs = Vec::with_capacity(fresh.len());
        for (src, observed) in &fresh {
            let w = self.config.tuning(src).weight;
            breakdown.insert(src.clone(), observed.value);
            weights.insert(src.clone(), w);
            pairs.push((observed.value, w));
        }
        let Some(rate) = weighted_mean(&pairs) else {
            return;
        };

        let fresh_count = breakdown.len();
        let mut fusion = FusionInfo::from_breakdown(breakdown, weights, dropped);
        fusion.confidence_score = clamp_confidence(if dropped == 0 {
            1.0
        } else {
            fresh_count as f64 / (fresh_count + dropped) as f64
        });

        let agg = FundingAggEvent {
            meta: EventMeta::inherit(&event.meta, "funding-agg", now),
            symbol: event.symbol.clone(),
            market_type: event.market_type,
            rate,
            fusion,
        };
        self.bus.publish(topics::MARKET_FUNDING_AGG, &agg);
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

    fn funding(source: &str, rate: f64, ts: i64) -> FundingRateEvent {
        let stream_id = StreamId::from(source);
        FundingRateEvent {
            meta: EventMeta::new("test", TsMillis(ts)).with_stream(stream_id.clone()),
            symbol: "BTCUSDT".to_string(),
            market_type: MarketType::Futures,
            stream_id,
            rate,
            next_funding_ts: None,
        }
    }

    fn setup(config: AggregatorConfig) -> (Arc<EventBus>, Arc<ManualClock>, Arc<PMutex<Vec<FundingAggEvent>>>) {
        let bus = Arc::new(EventBus::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let agg = FundingAggregator::new(bus.clone(), clock.clone(), config);
        agg.start();

        let seen = Arc::new(PMutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe(topics::MARKET_FUNDING_AGG, move |e| {
            s.lock().push(e.clone());
            Ok(())
        });
        (bus, clock, seen)
    }

    #[test]
    fn weighted_mean_of_fresh_rates() {
        let mut config = AggregatorConfig::default();
        config.sources.insert(
            "binance:funding:futures".to_string(),
            SourceTuning {
                weight: 3.0,
                ..SourceTuning::default()
            },
        );
        let (bus, _clock, seen) = setup(config);

        bus.publish(topics::MARKET_FUNDING, &funding("binance:funding:futures", 0.0002, 500));
        bus.publish(topics::MARKET_FUNDING, &funding("okx:funding:futures", 0.0006, 600));

        let seen = seen.lock();
        let e = seen.last().unwrap();
        // (0.0002 * 3 + 0.0006) / 4 = 0.0003
        assert!((e.rate - 0.0003).abs() < 1e-12);
        assert_eq!(e.fusion.fresh_sources_count, 2);
        assert_eq!(e.fusion.confidence_score, 1.0);
    }

    #[test]
    fn stale_sources_dropped_and_reported() {
        let (bus, clock, seen) = setup(AggregatorConfig::default());

        bus.publish(topics::MARKET_FUNDING, &funding("binance:funding:futures", 0.0002, 500));

        clock.set(20_000);
        bus.publish(topics::MARKET_FUNDING, &funding("okx:funding:futures", 0.0006, 20_000));

        let seen = seen.lock();
        let e = seen.last().unwrap();
        assert_eq!(e.rate, 0.0006);
        assert_eq!(e.fusion.stale_sources_dropped, 1);
        assert!(e.fusion.confidence_score < 1.0);
    }

    #[test]
    fn missing_ts_ingest_falls_back_to_local_clock() {
        let (bus, _clock, seen) = setup(AggregatorConfig::default());

        let mut event = funding("binance:funding:futures", 0.0001, 500);
        event.meta.ts_ingest = None;
        bus.publish(topics::MARKET_FUNDING, &event);

        // Judged fresh against the local clock (1_000), so it fuses.
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].rate, 0.0001);
    }
}
