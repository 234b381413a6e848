// =============================================================================
// Liquidity Aggregator - cross-venue depth, spread and imbalance
// =============================================================================
//
// Consumes the book-top summaries emitted by the orderbook engine (which only
// emits while a book is READY) and fuses them per (symbol, market type):
//
//   best bid  = max across fresh venue books
//   best ask  = min across fresh venue books
//   depth     = sum of per-venue depth at `depth_levels`
//   imbalance = (depth_bid - depth_ask) / (depth_bid + depth_ask)
//
// On `market:disconnected` the affected stream's entries are dropped, so no
// aggregate is emitted for that venue until a fresh snapshot re-arms its book
// upstream.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::aggregators::{clamp_confidence, SourceWindow};
use crate::bus::EventBus;
use crate::config::AggregatorConfig;
use crate::events::{BookTopEvent, ConnectionEvent, FusionInfo, LiquidityAggEvent, LiquiditySnapshotEvent};
use crate::meta::{Clock, EventMeta, TsMillis};
use crate::topics;
use crate::types::MarketType;

#[derive(Debug, Clone, Copy)]
struct BookTop {
    best_bid: f64,
    best_ask: f64,
    depth_bid: f64,
    depth_ask: f64,
    depth_levels: usize,
}

#[derive(Debug)]
struct SymbolState {
    books: SourceWindow<BookTop>,
    last_emit: Option<TsMillis>,
}

pub struct LiquidityAggregator {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: AggregatorConfig,
    state: Mutex<HashMap<(String, MarketType), SymbolState>>,
}

impl LiquidityAggregator {
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
        self.bus.subscribe(topics::MARKET_ORDERBOOK_TOP, move |top| {
            agg.on_book_top(top);
            Ok(())
        });

        let agg = self.clone();
        self.bus.subscribe(topics::MARKET_DISCONNECTED, move |ev| {
            agg.on_disconnected(ev);
            Ok(())
        });
    }

    fn on_book_top(&self, top: &BookTopEvent) {
        let now = self.clock.now_ms();
        let ts = top.meta.ts_ingest.unwrap_or(now);

        let mut state = self.state.lock();
        let entry = state
            .entry((top.symbol.clone(), top.market_type))
            .or_insert_with(|| SymbolState {
                books: SourceWindow::new(self.config.ttl_ms),
                last_emit: None,
            });
        entry.books.upsert(
            top.stream_id.as_str(),
            BookTop {
                best_bid: top.best_bid,
                best_ask: top.best_ask,
                depth_bid: top.depth_bid,
                depth_ask: top.depth_ask,
                depth_levels: top.depth_levels,
            },
            ts,
        );

        if let Some(last) = entry.last_emit {
            if now.delta_ms(last) < self.config.min_emit_interval_ms {
                return;
            }
        }
        entry.last_emit = Some(now);

        let (fresh, dropped) = entry.books.fresh(now);
        drop(state);

        if fresh.is_empty() {
            debug!(symbol = %top.symbol, "no fresh book source, liquidity aggregate skipped");
            return;
        }

        let mut best_bid = f64::MIN;
        let mut best_ask = f64::MAX;
        let mut depth_bid = 0.0;
        let mut depth_ask = 0.0;
        let mut depth_levels = 0usize;
        let mut breakdown = std::collections::BTreeMap::new();
        let mut weights = std::collections::BTreeMap::new();

        for (src, observed) in &fresh {
            let book = observed.value;
            best_bid = best_bid.max(book.best_bid);
            best_ask = best_ask.min(book.best_ask);
            depth_bid += book.depth_bid;
            depth_ask += book.depth_ask;
            depth_levels = depth_levels.max(book.depth_levels);
            breakdown.insert(src.clone(), book.depth_bid + book.depth_ask);
            weights.insert(src.clone(), self.config.tuning(src).weight);
        }

        let total_depth = depth_bid + depth_ask;
        let imbalance = if total_depth > 0.0 {
            (depth_bid - depth_ask) / total_depth
        } else {
            0.0
        };

        let fresh_count = breakdown.len();
        let mut fusion = FusionInfo::from_breakdown(breakdown, weights, dropped);
        fusion.confidence_score = clamp_confidence(if dropped == 0 {
            1.0
        } else {
            fresh_count as f64 / (fresh_count + dropped) as f64
        });

        let event = LiquidityAggEvent {
            meta: EventMeta::inherit(&top.meta, "liquidity-agg", now),
            symbol: top.symbol.clone(),
            market_type: top.market_type,
            best_bid,
            best_ask,
            spread: best_ask - best_bid,
            depth_levels,
            depth_bid,
            depth_ask,
            imbalance,
            fusion,
        };
        self.bus.publish(topics::MARKET_LIQUIDITY_AGG, &event);

        let snapshot = LiquiditySnapshotEvent {
            meta: EventMeta::inherit(&top.meta, "liquidity-agg", now),
            symbol: top.symbol.clone(),
            market_type: top.market_type,
            spread: event.spread,
            imbalance,
            depth_bid,
            depth_ask,
        };
        self.bus.publish(topics::ANALYTICS_LIQUIDITY, &snapshot);
    }

    /// Drop every book sourced from the disconnected stream. Emission for
    /// that venue resumes only after a fresh snapshot makes its book READY
    /// again upstream.
    fn on_disconnected(&self, ev: &ConnectionEvent) {
        let Some(stream_id) = &ev.stream_id else {
            return;
        };
        let mut state = self.state.lock();
        for entry in state.values_mut() {
            entry.books.remove_stream(stream_id.as_str());
        }
        debug!(stream = %stream_id, "liquidity sources cleared on disconnect");
    }
}
