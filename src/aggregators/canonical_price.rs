// =============================================================================
// Canonical Price Aggregator - index / mark / last with explicit fallback
// =============================================================================
//
// The canonical price is the single cross-venue USD reference per symbol.
// Preference order: index when fresh, else mark, else last. Every downgrade
// reduces the confidence score and records why the preferred type was not
// usable:
//
//   NO_INDEX / INDEX_STALE  when falling from index to mark
//   NO_MARK  / MARK_STALE   when falling from mark to last
//
// Index and mark points arrive on `market:price_index`; `last` prices arrive
// via `market:ticker`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::aggregators::{clamp_confidence, weighted_mean, SourceWindow};
use crate::bus::EventBus;
use crate::config::AggregatorConfig;
use crate::events::{
    CanonicalPriceEvent, FusionInfo, PriceFallbackReason, PricePointEvent, PriceType,
    TickerEvent,
};
use crate::meta::{Clock, EventMeta, TsMillis};
use crate::topics;
use crate::types::MarketType;

const CONF_MARK: f64 = 0.9;
const CONF_LAST: f64 = 0.75;

#[derive(Debug)]
struct SymbolState {
    index: SourceWindow<f64>,
    mark: SourceWindow<f64>,
    last: SourceWindow<f64>,
    /// Whether an index / mark point was ever observed for this symbol,
    /// independent of TTL eviction. Distinguishes NO_INDEX from INDEX_STALE
    /// (and NO_MARK from MARK_STALE).
    seen_index: bool,
    seen_mark: bool,
    last_emit: Option<TsMillis>,
}

impl SymbolState {
    fn new(ttl_ms: i64) -> Self {
        Self {
            index: SourceWindow::new(ttl_ms),
            mark: SourceWindow::new(ttl_ms),
            last: SourceWindow::new(ttl_ms),
            seen_index: false,
            seen_mark: false,
            last_emit: None,
        }
    }

    fn window(&mut self, price_type: PriceType) -> &mut SourceWindow<f64> {
        match price_type {
            PriceType::Index => {
                self.seen_index = true;
                &mut self.index
            }
            PriceType::Mark => {
                self.seen_mark = true;
                &mut self.mark
            }
            PriceType::Last => &mut self.last,
        }
    }
}

pub struct CanonicalPriceAggregator {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: AggregatorConfig,
    state: Mutex<HashMap<(String, MarketType), SymbolState>>,
}

impl CanonicalPriceAggregator {
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
        self.bus.subscribe(topics::MARKET_PRICE_INDEX, move |point| {
            agg.on_price_point(point);
            Ok(())
        });

        let agg = self.clone();
        self.bus.subscribe(topics::MARKET_TICKER, move |ticker| {
            agg.on_ticker(ticker);
            Ok(())
        });
    }

    fn on_price_point(&self, point: &PricePointEvent) {
        let ts = point.meta.ts_ingest.unwrap_or_else(|| self.clock.now_ms());
        {
            let mut state = self.state.lock();
            let entry = state
                .entry((point.symbol.clone(), point.market_type))
                .or_insert_with(|| SymbolState::new(self.config.ttl_ms));
            entry
                .window(point.price_type)
                .upsert(point.stream_id.as_str(), point.price, ts);
        }
        self.evaluate(&point.meta, &point.symbol, point.market_type);
    }

    fn on_ticker(&self, ticker: &TickerEvent) {
        let ts = ticker.meta.ts_ingest.unwrap_or_else(|| self.clock.now_ms());
        {
            let mut state = self.state.lock();
            let entry = state
                .entry((ticker.symbol.clone(), ticker.market_type))
                .or_insert_with(|| SymbolState::new(self.config.ttl_ms));
            entry
                .window(PriceType::Last)
                .upsert(ticker.stream_id.as_str(), ticker.last_price, ts);
        }
        self.evaluate(&ticker.meta, &ticker.symbol, ticker.market_type);
    }

    fn evaluate(&self, parent: &EventMeta, symbol: &str, market_type: MarketType) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let Some(entry) = state.get_mut(&(symbol.to_string(), market_type)) else {
            return;
        };

        if let Some(last) = entry.last_emit {
            if now.delta_ms(last) < self.config.min_emit_interval_ms {
                return;
            }
        }

        // Walk the preference chain, remembering why each tier was rejected.
        let (index_fresh, index_dropped) = entry.index.fresh(now);
        let (mark_fresh, mark_dropped) = entry.mark.fresh(now);
        let (last_fresh, last_dropped) = entry.last.fresh(now);

        let (chosen, price_type, fallback_reason, base_confidence) = if !index_fresh.is_empty() {
            (index_fresh, PriceType::Index, None, 1.0)
        } else if !mark_fresh.is_empty() {
            let reason = if entry.seen_index {
                PriceFallbackReason::IndexStale
            } else {
                PriceFallbackReason::NoIndex
            };
            (mark_fresh, PriceType::Mark, Some(reason), CONF_MARK)
        } else if !last_fresh.is_empty() {
            let reason = if entry.seen_mark {
                PriceFallbackReason::MarkStale
            } else {
                PriceFallbackReason::NoMark
            };
            (last_fresh, PriceType::Last, Some(reason), CONF_LAST)
        } else {
            debug!(symbol, %market_type, "no fresh price source, canonical price skipped");
            return;
        };

        let stale_dropped = index_dropped + mark_dropped + last_dropped;

        let mut breakdown = std::collections::BTreeMap::new();
        let mut weights = std::collections::BTreeMap::new();
        let mut pairs = Vec::with_capacity(chosen.len());
        for (source, observed) in &chosen {
            let tuning = self.config.tuning(source);
            let value = observed.value * tuning.unit_multiplier;
            breakdown.insert(source.clone(), value);
            weights.insert(source.clone(), tuning.weight);
            pairs.push((value, tuning.weight));
        }
        let Some(price) = weighted_mean(&pairs) else {
            return;
        };

        let fresh_count = breakdown.len();
        let freshness = if stale_dropped == 0 {
            1.0
        } else {
            fresh_count as f64 / (fresh_count + stale_dropped) as f64
        };

        let mut fusion = FusionInfo::from_breakdown(breakdown, weights, stale_dropped);
        fusion.confidence_score = clamp_confidence(base_confidence * freshness);
        if fallback_reason.is_some() || stale_dropped > 0 {
            fusion.confidence_explain = Some(format!(
                "price_type={price_type} stale_dropped={stale_dropped}"
            ));
        }

        entry.last_emit = Some(now);
        drop(state);

        let event = CanonicalPriceEvent {
            meta: EventMeta::inherit(parent, "canonical-price", now),
            symbol: symbol.to_string(),
            market_type,
            price,
            price_type_used: price_type,
            fallback_reason,
            fusion,
        };
        self.bus.publish(topics::MARKET_PRICE_CANONICAL, &event);
    }
}
