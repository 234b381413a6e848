// =============================================================================
// Orderbook Engine - per-(symbol, stream) L2 book from snapshot + delta
// =============================================================================
//
// State machine per (symbol, stream):
//
//   UNINITIALIZED --snapshot--> READY --gap--> RESYNCING --snapshot--> READY
//
//   - UNINITIALIZED: deltas are ignored until a snapshot arrives.
//   - READY: contiguous deltas apply in place; a snapshot replaces the book;
//     a non-contiguous delta drops the book, publishes
//     `market:resync_requested(gap)` and enters RESYNCING.
//   - RESYNCING: deltas are ignored; the next snapshot re-arms the book.
//
// `market:disconnected` clears every symbol of the affected stream back to
// UNINITIALIZED. A `market:orderbook_top` summary is emitted after every
// applied update, and only in READY, so downstream liquidity fusion can never
// observe a torn book.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::events::{
    BookLevel, BookTopEvent, ConnectionEvent, OrderbookL2Delta, OrderbookL2Snapshot,
    ResyncReason, ResyncRequest,
};
use crate::meta::{Clock, EventMeta, StreamId};
use crate::topics;
use crate::types::MarketType;

// =============================================================================
// Price key
// =============================================================================

/// f64 price usable as a BTreeMap key (total order via `total_cmp`). Prices
/// come from venue decimal strings and never hold NaN by the time they get
/// here.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Px(f64);

impl Eq for Px {}

impl PartialOrd for Px {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Px {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

// =============================================================================
// Book state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BookPhase {
    Uninitialized,
    Ready,
    Resyncing,
}

#[derive(Debug)]
struct BookState {
    phase: BookPhase,
    bids: BTreeMap<Px, f64>,
    asks: BTreeMap<Px, f64>,
    update_id: u64,
}

impl BookState {
    fn new() -> Self {
        Self {
            phase: BookPhase::Uninitialized,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            update_id: 0,
        }
    }

    fn load(&mut self, bids: &[BookLevel], asks: &[BookLevel], update_id: u64) {
        self.bids.clear();
        self.asks.clear();
        for l in bids {
            if l.size > 0.0 {
                self.bids.insert(Px(l.price), l.size);
            }
        }
        for l in asks {
            if l.size > 0.0 {
                self.asks.insert(Px(l.price), l.size);
            }
        }
        self.update_id = update_id;
        self.phase = BookPhase::Ready;
    }

    fn apply(&mut self, bids: &[BookLevel], asks: &[BookLevel], update_id: u64) {
        for l in bids {
            if l.size > 0.0 {
                self.bids.insert(Px(l.price), l.size);
            } else {
                self.bids.remove(&Px(l.price));
            }
        }
        for l in asks {
            if l.size > 0.0 {
                self.asks.insert(Px(l.price), l.size);
            } else {
                self.asks.remove(&Px(l.price));
            }
        }
        self.update_id = update_id;
    }

    fn drop_book(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.phase = BookPhase::Resyncing;
    }

    /// True when a delta continues the current book without a hole.
    fn is_contiguous(&self, delta: &OrderbookL2Delta) -> bool {
        match (delta.prev_update_id, delta.first_update_id) {
            (Some(prev), _) => prev == self.update_id,
            (None, Some(first)) => first <= self.update_id + 1 && delta.update_id > self.update_id,
            (None, None) => delta.update_id == self.update_id + 1,
        }
    }

    fn top(&self, depth_levels: usize) -> Option<(f64, f64, f64, f64)> {
        let (best_bid, _) = self.bids.iter().next_back()?;
        let (best_ask, _) = self.asks.iter().next()?;
        let depth_bid: f64 = self.bids.values().rev().take(depth_levels).sum();
        let depth_ask: f64 = self.asks.values().take(depth_levels).sum();
        Some((best_bid.0, best_ask.0, depth_bid, depth_ask))
    }
}

// =============================================================================
// OrderbookEngine
// =============================================================================

#[derive(Debug, Default)]
struct EngineState {
    books: HashMap<(StreamId, String), BookState>,
}

pub struct OrderbookEngine {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    depth_levels: usize,
    state: Mutex<EngineState>,
}

impl OrderbookEngine {
    pub fn new(bus: Arc<EventBus>, clock: Arc<dyn Clock>, depth_levels: usize) -> Arc<Self> {
        Arc::new(Self {
            bus,
            clock,
            depth_levels,
            state: Mutex::new(EngineState::default()),
        })
    }

    /// Wire the engine onto the bus.
    pub fn start(self: &Arc<Self>) {
        let engine = self.clone();
        self.bus
            .subscribe(topics::MARKET_ORDERBOOK_L2_SNAPSHOT, move |snap| {
                engine.on_snapshot(snap);
                Ok(())
            });

        let engine = self.clone();
        self.bus
            .subscribe(topics::MARKET_ORDERBOOK_L2_DELTA, move |delta| {
                engine.on_delta(delta);
                Ok(())
            });

        let engine = self.clone();
        self.bus.subscribe(topics::MARKET_DISCONNECTED, move |ev| {
            engine.on_disconnected(ev);
            Ok(())
        });
    }

    fn on_snapshot(&self, snap: &OrderbookL2Snapshot) {
        let key = (snap.stream_id.clone(), snap.symbol.clone());
        let mut state = self.state.lock();
        let book = state.books.entry(key).or_insert_with(BookState::new);

        let was = book.phase;
        book.load(&snap.bids, &snap.asks, snap.update_id);
        if was != BookPhase::Ready {
            info!(
                stream = %snap.stream_id,
                symbol = %snap.symbol,
                update_id = snap.update_id,
                "orderbook ready"
            );
        }
        let top = book.top(self.depth_levels);
        drop(state);

        self.emit_top(&snap.meta, &snap.stream_id, &snap.symbol, snap.market_type, snap.update_id, top);
    }

    fn on_delta(&self, delta: &OrderbookL2Delta) {
        let key = (delta.stream_id.clone(), delta.symbol.clone());
        let mut state = self.state.lock();
        let Some(book) = state.books.get_mut(&key) else {
            // No snapshot seen yet for this (stream, symbol); ignore.
            debug!(
                stream = %delta.stream_id,
                symbol = %delta.symbol,
                "delta before snapshot ignored"
            );
            return;
        };

        match book.phase {
            BookPhase::Uninitialized | BookPhase::Resyncing => {
                debug!(
                    stream = %delta.stream_id,
                    symbol = %delta.symbol,
                    phase = ?book.phase,
                    "delta ignored while awaiting snapshot"
                );
            }
            BookPhase::Ready => {
                if book.is_contiguous(delta) {
                    book.apply(&delta.bids, &delta.asks, delta.update_id);
                    let top = book.top(self.depth_levels);
                    let update_id = book.update_id;
                    drop(state);
                    self.emit_top(
                        &delta.meta,
                        &delta.stream_id,
                        &delta.symbol,
                        delta.market_type,
                        update_id,
                        top,
                    );
                } else {
                    let last_seen = book.update_id;
                    book.drop_book();
                    drop(state);

                    warn!(
                        stream = %delta.stream_id,
                        symbol = %delta.symbol,
                        last_seen,
                        update_id = delta.update_id,
                        "orderbook gap, dropping book and requesting resync"
                    );
                    let resync = ResyncRequest {
                        meta: EventMeta::inherit(&delta.meta, "orderbook", self.clock.now_ms()),
                        venue: delta.stream_id.venue().to_string(),
                        symbol: delta.symbol.clone(),
                        stream_id: delta.stream_id.clone(),
                        reason: ResyncReason::Gap,
                        last_sequence: Some(last_seen),
                    };
                    self.bus.publish(topics::MARKET_RESYNC_REQUESTED, &resync);
                }
            }
        }
    }

    fn on_disconnected(&self, ev: &ConnectionEvent) {
        let Some(stream_id) = &ev.stream_id else {
            return;
        };
        let mut state = self.state.lock();
        let mut cleared = 0usize;
        state.books.retain(|(s, _), _| {
            if s == stream_id {
                cleared += 1;
                false
            } else {
                true
            }
        });
        if cleared > 0 {
            info!(stream = %stream_id, cleared, "orderbook state cleared on disconnect");
        }
    }

    fn emit_top(
        &self,
        parent: &EventMeta,
        stream_id: &StreamId,
        symbol: &str,
        market_type: MarketType,
        update_id: u64,
        top: Option<(f64, f64, f64, f64)>,
    ) {
        let Some((best_bid, best_ask, depth_bid, depth_ask)) = top else {
            return;
        };
        let event = BookTopEvent {
            meta: EventMeta::inherit(parent, "orderbook", self.clock.now_ms()),
            symbol: symbol.to_string(),
            market_type,
            stream_id: stream_id.clone(),
            update_id,
            best_bid,
            best_ask,
            depth_levels: self.depth_levels,
            depth_bid,
            depth_ask,
        };
        self.bus.publish(topics::MARKET_ORDERBOOK_TOP, &event);
    }
}
