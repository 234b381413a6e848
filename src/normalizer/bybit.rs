// =============================================================================
// Bybit Normalizer - decoded Bybit v5 public messages to normalized events
// =============================================================================
//
// Bybit wraps everything in `{ topic, type, ts, data }` and routes by topic
// prefix (`publicTrade.BTCUSDT`, `orderbook.50.BTCUSDT`, `tickers.BTCUSDT`,
// `allLiquidation.BTCUSDT`). Orderbook sequence field is `u` (with `seq` as a
// secondary); deltas advance `u` by exactly one, so contiguity is judged
// against `last + 1`.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::events::*;
use crate::meta::{Clock, EventMeta, StreamId, TsMillis};
use crate::normalizer::{
    canonical_symbol, coerce_sequence, event_time, parse_f64, parse_i64, parse_levels,
    SeqCheck, SequenceLedger,
};
use crate::topics;
use crate::types::{MarketType, Side};

const VENUE: &str = "bybit";

pub struct BybitNormalizer {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    ledger: Mutex<SequenceLedger>,
}

impl BybitNormalizer {
    pub fn new(bus: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            bus,
            clock,
            ledger: Mutex::new(SequenceLedger::default()),
        }
    }

    /// Route a WS message by its `topic` field.
    pub fn on_ws_message(&self, market_type: MarketType, msg: &Value) {
        let Some(topic) = msg.get("topic").and_then(Value::as_str) else {
            debug!(venue = VENUE, "ws message without topic");
            return;
        };

        if topic.starts_with("publicTrade.") {
            self.on_trades(market_type, msg);
        } else if topic.starts_with("orderbook.") {
            self.on_orderbook(market_type, msg);
        } else if topic.starts_with("tickers.") {
            self.on_ticker(market_type, msg);
        } else if topic.starts_with("allLiquidation.") || topic.starts_with("liquidation.") {
            self.on_liquidations(market_type, msg);
        } else {
            debug!(venue = VENUE, topic, "unhandled ws topic");
            self.publish_raw(topics::MARKET_WS_EVENT_RAW, market_type, topic, None, msg);
        }
    }

    fn check_market_type(&self, market_type: MarketType, channel: &str) -> bool {
        if !market_type.is_known() {
            warn!(venue = VENUE, channel, "dropping event with unknown market type");
            return false;
        }
        true
    }

    fn publish_raw(
        &self,
        topic: crate::bus::Topic<RawVenueEvent>,
        market_type: MarketType,
        channel: &str,
        symbol: Option<String>,
        payload: &Value,
    ) {
        let now = self.clock.now_ms();
        let raw = RawVenueEvent {
            meta: EventMeta::new(VENUE, now),
            venue: VENUE.to_string(),
            market_type,
            channel: channel.to_string(),
            symbol,
            payload: payload.clone(),
        };
        self.bus.publish(topic, &raw);
    }

    fn meta(
        &self,
        ts_event: TsMillis,
        stream_id: &StreamId,
        ts_exchange: Option<TsMillis>,
        sequence: Option<u64>,
    ) -> EventMeta {
        let now = self.clock.now_ms();
        let mut meta = EventMeta::new(VENUE, now)
            .at(ts_event)
            .with_stream(stream_id.clone());
        meta.ts_exchange = ts_exchange;
        meta.sequence = sequence;
        meta
    }

    // ── Trades ───────────────────────────────────────────────────────────

    /// `{ "topic": "publicTrade.BTCUSDT", "ts": ...,
    ///    "data": [{ "T":..., "s":"BTCUSDT", "S":"Buy", "v":"...", "p":"...", "i":"..." }] }`
    pub fn on_trades(&self, market_type: MarketType, msg: &Value) {
        if !self.check_market_type(market_type, "publicTrade") {
            return;
        }
        self.publish_raw(topics::MARKET_TRADE_RAW, market_type, "publicTrade", None, msg);

        let Some(items) = msg.get("data").and_then(Value::as_array) else {
            warn!(venue = VENUE, "publicTrade without data array");
            return;
        };

        let now = self.clock.now_ms();
        let stream_id = StreamId::new(VENUE, "trade", market_type);

        for item in items {
            let Some(symbol) = item.get("s").and_then(Value::as_str).map(canonical_symbol)
            else {
                continue;
            };
            let (Some(price), Some(size)) = (
                item.get("p").and_then(parse_f64),
                item.get("v").and_then(parse_f64),
            ) else {
                warn!(venue = VENUE, symbol = %symbol, "trade missing price/size");
                continue;
            };

            let side = match item.get("S").and_then(Value::as_str) {
                Some("Buy") => Side::Buy,
                _ => Side::Sell,
            };

            let trade_ts = event_time(item.get("T").and_then(parse_i64), now);
            let event = TradeEvent {
                meta: self.meta(trade_ts, &stream_id, Some(trade_ts), None),
                symbol,
                market_type,
                stream_id: stream_id.clone(),
                trade_ts,
                price,
                size,
                side,
                trade_id: item.get("i").and_then(Value::as_str).map(str::to_string),
            };
            self.bus.publish(topics::MARKET_TRADE, &event);
        }
    }

    // ── Orderbook ────────────────────────────────────────────────────────

    /// `{ "topic": "orderbook.50.BTCUSDT", "type": "snapshot"|"delta",
    ///    "cts": ..., "data": { "s":"BTCUSDT", "b":[[p,q]], "a":[[p,q]],
    ///    "u":..., "seq":... } }`
    pub fn on_orderbook(&self, market_type: MarketType, msg: &Value) {
        if !self.check_market_type(market_type, "orderbook") {
            return;
        }

        let is_snapshot = msg.get("type").and_then(Value::as_str) == Some("snapshot");
        let raw_topic = if is_snapshot {
            topics::MARKET_ORDERBOOK_SNAPSHOT_RAW
        } else {
            topics::MARKET_ORDERBOOK_DELTA_RAW
        };
        self.publish_raw(raw_topic, market_type, "orderbook", None, msg);

        let data = &msg["data"];
        let Some(symbol) = data.get("s").and_then(Value::as_str).map(canonical_symbol) else {
            warn!(venue = VENUE, "orderbook without symbol");
            return;
        };
        let Some(update_id) = coerce_sequence(data, &["u", "seq", "lastUpdateId"]) else {
            warn!(venue = VENUE, symbol = %symbol, "orderbook missing update id");
            return;
        };

        let now = self.clock.now_ms();
        let ts = event_time(msg.get("cts").or_else(|| msg.get("ts")).and_then(parse_i64), now);
        let stream_id = StreamId::new(VENUE, "orderbook", market_type);

        if is_snapshot {
            self.ledger
                .lock()
                .apply_snapshot(&stream_id, &symbol, update_id);

            let event = OrderbookL2Snapshot {
                meta: self.meta(ts, &stream_id, Some(ts), Some(update_id)),
                symbol,
                market_type,
                stream_id,
                exchange_ts: ts,
                update_id,
                bids: parse_levels(&data["b"]),
                asks: parse_levels(&data["a"]),
            };
            self.bus.publish(topics::MARKET_ORDERBOOK_L2_SNAPSHOT, &event);
            return;
        }

        // Deltas advance `u` by one; encode that via the range check.
        let check = self.ledger.lock().check_delta(
            &stream_id,
            &symbol,
            Some(update_id),
            None,
            update_id,
        );

        let event = OrderbookL2Delta {
            meta: self.meta(ts, &stream_id, Some(ts), Some(update_id)),
            symbol: symbol.clone(),
            market_type,
            stream_id: stream_id.clone(),
            exchange_ts: ts,
            first_update_id: Some(update_id),
            update_id,
            prev_update_id: None,
            bids: parse_levels(&data["b"]),
            asks: parse_levels(&data["a"]),
        };

        if let SeqCheck::Gap { last_seen } = check {
            warn!(
                venue = VENUE,
                symbol = %symbol,
                last_seen,
                update_id,
                "orderbook sequence gap, requesting resync"
            );
            let resync = ResyncRequest {
                meta: EventMeta::inherit(&event.meta, "normalizer", now),
                venue: VENUE.to_string(),
                symbol: symbol.clone(),
                stream_id: stream_id.clone(),
                reason: ResyncReason::Gap,
                last_sequence: Some(last_seen),
            };
            self.bus.publish(topics::MARKET_RESYNC_REQUESTED, &resync);
        }

        self.bus.publish(topics::MARKET_ORDERBOOK_L2_DELTA, &event);
    }

    pub fn on_stream_disconnected(&self, stream_id: &StreamId) {
        self.ledger.lock().reset_stream(stream_id);
    }

    // ── Tickers (last/mark/index price, funding, OI in one message) ──────

    /// `{ "topic": "tickers.BTCUSDT", "ts": ..., "data": { "symbol":...,
    ///    "lastPrice":..., "markPrice":..., "indexPrice":...,
    ///    "fundingRate":..., "nextFundingTime":..., "openInterest":...,
    ///    "bid1Price":..., "ask1Price":..., "volume24h":... } }`
    pub fn on_ticker(&self, market_type: MarketType, msg: &Value) {
        if !self.check_market_type(market_type, "tickers") {
            return;
        }
        let data = &msg["data"];
        let Some(symbol) = data
            .get("symbol")
            .or_else(|| data.get("s"))
            .and_then(Value::as_str)
            .map(canonical_symbol)
        else {
            warn!(venue = VENUE, "tickers without symbol");
            return;
        };
        self.publish_raw(
            topics::MARKET_WS_EVENT_RAW,
            market_type,
            "tickers",
            Some(symbol.clone()),
            msg,
        );

        let now = self.clock.now_ms();
        let ts = event_time(msg.get("ts").and_then(parse_i64), now);

        if let Some(last_price) = data.get("lastPrice").and_then(parse_f64) {
            let stream_id = StreamId::new(VENUE, "ticker", market_type);
            let event = TickerEvent {
                meta: self.meta(ts, &stream_id, Some(ts), None),
                symbol: symbol.clone(),
                market_type,
                stream_id,
                last_price,
                bid: data.get("bid1Price").and_then(parse_f64),
                ask: data.get("ask1Price").and_then(parse_f64),
                volume_24h: data.get("volume24h").and_then(parse_f64),
            };
            self.bus.publish(topics::MARKET_TICKER, &event);
        }

        if let Some(mark) = data.get("markPrice").and_then(parse_f64) {
            let stream_id = StreamId::new(VENUE, "mark", market_type);
            let event = PricePointEvent {
                meta: self.meta(ts, &stream_id, Some(ts), None),
                symbol: symbol.clone(),
                market_type,
                stream_id,
                price: mark,
                price_type: PriceType::Mark,
            };
            self.bus.publish(topics::MARKET_PRICE_INDEX, &event);
        }

        if let Some(index) = data.get("indexPrice").and_then(parse_f64) {
            let stream_id = StreamId::new(VENUE, "index", market_type);
            let event = PricePointEvent {
                meta: self.meta(ts, &stream_id, Some(ts), None),
                symbol: symbol.clone(),
                market_type,
                stream_id,
                price: index,
                price_type: PriceType::Index,
            };
            self.bus.publish(topics::MARKET_PRICE_INDEX, &event);
        }

        if let Some(rate) = data.get("fundingRate").and_then(parse_f64) {
            let stream_id = StreamId::new(VENUE, "funding", market_type);
            let event = FundingRateEvent {
                meta: self.meta(ts, &stream_id, Some(ts), None),
                symbol: symbol.clone(),
                market_type,
                stream_id,
                rate,
                next_funding_ts: data.get("nextFundingTime").and_then(parse_i64).map(TsMillis),
            };
            self.bus.publish(topics::MARKET_FUNDING, &event);
        }

        if let Some(open_interest) = data.get("openInterest").and_then(parse_f64) {
            let stream_id = StreamId::new(VENUE, "oi", market_type);
            let event = OpenInterestEvent {
                meta: self.meta(ts, &stream_id, Some(ts), None),
                symbol,
                market_type,
                stream_id,
                open_interest,
                unit: ValueUnit::Base,
            };
            self.bus.publish(topics::MARKET_OI, &event);
        }
    }

    // ── Liquidations ─────────────────────────────────────────────────────

    /// `{ "topic": "allLiquidation.BTCUSDT", "ts": ...,
    ///    "data": [{ "T":..., "s":"BTCUSDT", "S":"Buy", "v":"...", "p":"..." }] }`
    pub fn on_liquidations(&self, market_type: MarketType, msg: &Value) {
        if !self.check_market_type(market_type, "allLiquidation") {
            return;
        }
        self.publish_raw(
            topics::MARKET_LIQUIDATION_RAW,
            market_type,
            "allLiquidation",
            None,
            msg,
        );

        let Some(items) = msg.get("data").and_then(Value::as_array) else {
            warn!(venue = VENUE, "allLiquidation without data array");
            return;
        };

        let now = self.clock.now_ms();
        let stream_id = StreamId::new(VENUE, "liquidation", market_type);

        for item in items {
            let Some(symbol) = item.get("s").and_then(Value::as_str).map(canonical_symbol)
            else {
                continue;
            };
            let (Some(price), Some(size)) = (
                item.get("p").and_then(parse_f64),
                item.get("v").and_then(parse_f64),
            ) else {
                warn!(venue = VENUE, symbol = %symbol, "liquidation missing price/size");
                continue;
            };

            let side = match item.get("S").and_then(Value::as_str) {
                Some("Buy") => Side::Buy,
                _ => Side::Sell,
            };

            let ts = event_time(item.get("T").and_then(parse_i64), now);
            let event = LiquidationEvent {
                meta: self.meta(ts, &stream_id, Some(ts), None),
                symbol,
                market_type,
                stream_id: stream_id.clone(),
                side,
                price,
                size,
                unit: ValueUnit::Base,
            };
            self.bus.publish(topics::MARKET_LIQUIDATION, &event);
        }
    }
}
