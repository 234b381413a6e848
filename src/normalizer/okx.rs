// =============================================================================
// OKX Normalizer - decoded OKX v5 public messages to normalized events
// =============================================================================
//
// OKX wraps everything in `{ arg: { channel, instId }, action?, data: [...] }`.
// The books channel chains deltas explicitly via `seqId` / `prevSeqId`, with
// `action` distinguishing `snapshot` from `update`. Instrument ids carry the
// market family (`BTC-USDT` spot, `BTC-USDT-SWAP` perpetual); the transport
// resolves that to a market type before handing messages in.
//
// OKX reports open interest in contracts (`oi`), which is not comparable with
// base-denominated venues unless a contract size is configured.

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

const VENUE: &str = "okx";

pub struct OkxNormalizer {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    ledger: Mutex<SequenceLedger>,
}

impl OkxNormalizer {
    pub fn new(bus: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            bus,
            clock,
            ledger: Mutex::new(SequenceLedger::default()),
        }
    }

    /// Route a WS message by its `arg.channel` field.
    pub fn on_ws_message(&self, market_type: MarketType, msg: &Value) {
        let Some(channel) = msg
            .pointer("/arg/channel")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            debug!(venue = VENUE, "ws message without arg.channel");
            return;
        };

        match channel.as_str() {
            "trades" => self.on_trades(market_type, msg),
            "books" | "books50-l2-tbt" | "books-l2-tbt" => self.on_books(market_type, msg),
            "tickers" => self.on_ticker(market_type, msg),
            "mark-price" => self.on_mark_price(market_type, msg),
            "index-tickers" => self.on_index_ticker(market_type, msg),
            "funding-rate" => self.on_funding(market_type, msg),
            "open-interest" => self.on_open_interest(market_type, msg),
            "liquidation-orders" => self.on_liquidations(market_type, msg),
            other => {
                debug!(venue = VENUE, channel = other, "unhandled ws channel");
                self.publish_raw(topics::MARKET_WS_EVENT_RAW, market_type, other, None, msg);
            }
        }
    }

    fn check_market_type(&self, market_type: MarketType, channel: &str) -> bool {
        if !market_type.is_known() {
            warn!(venue = VENUE, channel, "dropping event with unknown market type");
            return false;
        }
        true
    }

    fn inst_symbol(msg: &Value) -> Option<String> {
        msg.pointer("/arg/instId")
            .and_then(Value::as_str)
            .map(canonical_symbol)
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

    /// `{ "arg": { "channel":"trades", "instId":"BTC-USDT" },
    ///    "data": [{ "px":"...", "sz":"...", "side":"buy", "ts":"...", "tradeId":"..." }] }`
    pub fn on_trades(&self, market_type: MarketType, msg: &Value) {
        if !self.check_market_type(market_type, "trades") {
            return;
        }
        let symbol_hint = Self::inst_symbol(msg);
        self.publish_raw(
            topics::MARKET_TRADE_RAW,
            market_type,
            "trades",
            symbol_hint.clone(),
            msg,
        );

        let Some(symbol) = symbol_hint else {
            warn!(venue = VENUE, "trades without instId");
            return;
        };
        let Some(items) = msg.get("data").and_then(Value::as_array) else {
            return;
        };

        let now = self.clock.now_ms();
        let stream_id = StreamId::new(VENUE, "trades", market_type);

        for item in items {
            let (Some(price), Some(size)) = (
                item.get("px").and_then(parse_f64),
                item.get("sz").and_then(parse_f64),
            ) else {
                warn!(venue = VENUE, symbol = %symbol, "trade missing px/sz");
                continue;
            };

            let side = match item.get("side").and_then(Value::as_str) {
                Some("buy") => Side::Buy,
                _ => Side::Sell,
            };

            let trade_ts = event_time(item.get("ts").and_then(parse_i64), now);
            let event = TradeEvent {
                meta: self.meta(trade_ts, &stream_id, Some(trade_ts), None),
                symbol: symbol.clone(),
                market_type,
                stream_id: stream_id.clone(),
                trade_ts,
                price,
                size,
                side,
                trade_id: item.get("tradeId").and_then(Value::as_str).map(str::to_string),
            };
            self.bus.publish(topics::MARKET_TRADE, &event);
        }
    }

    // ── Books ────────────────────────────────────────────────────────────

    /// `{ "arg": { "channel":"books", "instId":"BTC-USDT" },
    ///    "action": "snapshot"|"update",
    ///    "data": [{ "asks":[[p,q,..]], "bids":[[p,q,..]], "ts":"...",
    ///               "seqId":..., "prevSeqId":... }] }`
    pub fn on_books(&self, market_type: MarketType, msg: &Value) {
        if !self.check_market_type(market_type, "books") {
            return;
        }

        let is_snapshot = msg.get("action").and_then(Value::as_str) != Some("update");
        let raw_topic = if is_snapshot {
            topics::MARKET_ORDERBOOK_SNAPSHOT_RAW
        } else {
            topics::MARKET_ORDERBOOK_DELTA_RAW
        };
        let symbol_hint = Self::inst_symbol(msg);
        self.publish_raw(raw_topic, market_type, "books", symbol_hint.clone(), msg);

        let Some(symbol) = symbol_hint else {
            warn!(venue = VENUE, "books without instId");
            return;
        };
        let Some(data) = msg.get("data").and_then(Value::as_array).and_then(|a| a.first())
        else {
            return;
        };
        let Some(seq_id) = coerce_sequence(data, &["seqId", "seq", "lastUpdateId"]) else {
            warn!(venue = VENUE, symbol = %symbol, "books missing seqId");
            return;
        };

        let now = self.clock.now_ms();
        let ts = event_time(data.get("ts").and_then(parse_i64), now);
        let stream_id = StreamId::new(VENUE, "books", market_type);

        if is_snapshot {
            self.ledger.lock().apply_snapshot(&stream_id, &symbol, seq_id);

            let event = OrderbookL2Snapshot {
                meta: self.meta(ts, &stream_id, Some(ts), Some(seq_id)),
                symbol,
                market_type,
                stream_id,
                exchange_ts: ts,
                update_id: seq_id,
                bids: parse_levels(&data["bids"]),
                asks: parse_levels(&data["asks"]),
            };
            self.bus.publish(topics::MARKET_ORDERBOOK_L2_SNAPSHOT, &event);
            return;
        }

        let prev_seq_id = data.get("prevSeqId").and_then(super::parse_u64);
        let check =
            self.ledger
                .lock()
                .check_delta(&stream_id, &symbol, None, prev_seq_id, seq_id);

        let event = OrderbookL2Delta {
            meta: self.meta(ts, &stream_id, Some(ts), Some(seq_id)),
            symbol: symbol.clone(),
            market_type,
            stream_id: stream_id.clone(),
            exchange_ts: ts,
            first_update_id: None,
            update_id: seq_id,
            prev_update_id: prev_seq_id,
            bids: parse_levels(&data["bids"]),
            asks: parse_levels(&data["asks"]),
        };

        if let SeqCheck::Gap { last_seen } = check {
            warn!(
                venue = VENUE,
                symbol = %symbol,
                last_seen,
                seq_id,
                "books sequence gap, requesting resync"
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

    // ── Ticker / prices ──────────────────────────────────────────────────

    /// `{ "arg": { "channel":"tickers", "instId":"BTC-USDT" },
    ///    "data": [{ "last":"...", "bidPx":"...", "askPx":"...",
    ///               "vol24h":"...", "ts":"..." }] }`
    pub fn on_ticker(&self, market_type: MarketType, msg: &Value) {
        if !self.check_market_type(market_type, "tickers") {
            return;
        }
        let symbol_hint = Self::inst_symbol(msg);
        self.publish_raw(
            topics::MARKET_WS_EVENT_RAW,
            market_type,
            "tickers",
            symbol_hint.clone(),
            msg,
        );

        let Some(symbol) = symbol_hint else {
            return;
        };
        let Some(data) = msg.get("data").and_then(Value::as_array).and_then(|a| a.first())
        else {
            return;
        };
        let Some(last_price) = data.get("last").and_then(parse_f64) else {
            warn!(venue = VENUE, symbol = %symbol, "ticker missing last");
            return;
        };

        let now = self.clock.now_ms();
        let ts = event_time(data.get("ts").and_then(parse_i64), now);
        let stream_id = StreamId::new(VENUE, "ticker", market_type);

        let event = TickerEvent {
            meta: self.meta(ts, &stream_id, Some(ts), None),
            symbol,
            market_type,
            stream_id,
            last_price,
            bid: data.get("bidPx").and_then(parse_f64),
            ask: data.get("askPx").and_then(parse_f64),
            volume_24h: data.get("vol24h").and_then(parse_f64),
        };
        self.bus.publish(topics::MARKET_TICKER, &event);
    }

    /// `{ "arg": { "channel":"mark-price", ... }, "data": [{ "markPx":"...", "ts":"..." }] }`
    pub fn on_mark_price(&self, market_type: MarketType, msg: &Value) {
        if !self.check_market_type(market_type, "mark-price") {
            return;
        }
        let symbol_hint = Self::inst_symbol(msg);
        self.publish_raw(
            topics::MARKET_MARK_PRICE_RAW,
            market_type,
            "mark-price",
            symbol_hint.clone(),
            msg,
        );

        let (Some(symbol), Some(data)) = (
            symbol_hint,
            msg.get("data").and_then(Value::as_array).and_then(|a| a.first()),
        ) else {
            return;
        };
        let Some(mark) = data.get("markPx").and_then(parse_f64) else {
            return;
        };

        let now = self.clock.now_ms();
        let ts = event_time(data.get("ts").and_then(parse_i64), now);
        let stream_id = StreamId::new(VENUE, "mark", market_type);

        let event = PricePointEvent {
            meta: self.meta(ts, &stream_id, Some(ts), None),
            symbol,
            market_type,
            stream_id,
            price: mark,
            price_type: PriceType::Mark,
        };
        self.bus.publish(topics::MARKET_PRICE_INDEX, &event);
    }

    /// `{ "arg": { "channel":"index-tickers", ... }, "data": [{ "idxPx":"...", "ts":"..." }] }`
    pub fn on_index_ticker(&self, market_type: MarketType, msg: &Value) {
        if !self.check_market_type(market_type, "index-tickers") {
            return;
        }
        let symbol_hint = Self::inst_symbol(msg);
        self.publish_raw(
            topics::MARKET_INDEX_PRICE_RAW,
            market_type,
            "index-tickers",
            symbol_hint.clone(),
            msg,
        );

        let (Some(symbol), Some(data)) = (
            symbol_hint,
            msg.get("data").and_then(Value::as_array).and_then(|a| a.first()),
        ) else {
            return;
        };
        let Some(index) = data.get("idxPx").and_then(parse_f64) else {
            return;
        };

        let now = self.clock.now_ms();
        let ts = event_time(data.get("ts").and_then(parse_i64), now);
        let stream_id = StreamId::new(VENUE, "index", market_type);

        let event = PricePointEvent {
            meta: self.meta(ts, &stream_id, Some(ts), None),
            symbol,
            market_type,
            stream_id,
            price: index,
            price_type: PriceType::Index,
        };
        self.bus.publish(topics::MARKET_PRICE_INDEX, &event);
    }

    /// `{ "arg": { "channel":"funding-rate", ... },
    ///    "data": [{ "fundingRate":"...", "nextFundingTime":"...", "ts":"..." }] }`
    pub fn on_funding(&self, market_type: MarketType, msg: &Value) {
        if !self.check_market_type(market_type, "funding-rate") {
            return;
        }
        let symbol_hint = Self::inst_symbol(msg);
        self.publish_raw(
            topics::MARKET_FUNDING_RAW,
            market_type,
            "funding-rate",
            symbol_hint.clone(),
            msg,
        );

        let (Some(symbol), Some(data)) = (
            symbol_hint,
            msg.get("data").and_then(Value::as_array).and_then(|a| a.first()),
        ) else {
            return;
        };
        let Some(rate) = data.get("fundingRate").and_then(parse_f64) else {
            return;
        };

        let now = self.clock.now_ms();
        let ts = event_time(data.get("ts").and_then(parse_i64), now);
        let stream_id = StreamId::new(VENUE, "funding", market_type);

        let event = FundingRateEvent {
            meta: self.meta(ts, &stream_id, Some(ts), None),
            symbol,
            market_type,
            stream_id,
            rate,
            next_funding_ts: data.get("nextFundingTime").and_then(parse_i64).map(TsMillis),
        };
        self.bus.publish(topics::MARKET_FUNDING, &event);
    }

    /// `{ "arg": { "channel":"open-interest", ... },
    ///    "data": [{ "oi":"...", "oiCcy":"...", "ts":"..." }] }`
    ///
    /// `oi` is denominated in contracts.
    pub fn on_open_interest(&self, market_type: MarketType, msg: &Value) {
        if !self.check_market_type(market_type, "open-interest") {
            return;
        }
        let symbol_hint = Self::inst_symbol(msg);
        self.publish_raw(
            topics::MARKET_OPEN_INTEREST_RAW,
            market_type,
            "open-interest",
            symbol_hint.clone(),
            msg,
        );

        let (Some(symbol), Some(data)) = (
            symbol_hint,
            msg.get("data").and_then(Value::as_array).and_then(|a| a.first()),
        ) else {
            return;
        };
        let Some(open_interest) = data.get("oi").and_then(parse_f64) else {
            return;
        };

        let now = self.clock.now_ms();
        let ts = event_time(data.get("ts").and_then(parse_i64), now);
        let stream_id = StreamId::new(VENUE, "oi", market_type);

        let event = OpenInterestEvent {
            meta: self.meta(ts, &stream_id, Some(ts), None),
            symbol,
            market_type,
            stream_id,
            open_interest,
            unit: ValueUnit::Contracts,
        };
        self.bus.publish(topics::MARKET_OI, &event);
    }

    /// `{ "arg": { "channel":"liquidation-orders", ... },
    ///    "data": [{ "details": [{ "side":"sell", "bkPx":"...", "sz":"...", "ts":"..." }] }] }`
    pub fn on_liquidations(&self, market_type: MarketType, msg: &Value) {
        if !self.check_market_type(market_type, "liquidation-orders") {
            return;
        }
        let symbol_hint = Self::inst_symbol(msg);
        self.publish_raw(
            topics::MARKET_LIQUIDATION_RAW,
            market_type,
            "liquidation-orders",
            symbol_hint.clone(),
            msg,
        );

        let Some(symbol) = symbol_hint else {
            return;
        };
        let Some(items) = msg.get("data").and_then(Value::as_array) else {
            return;
        };

        let now = self.clock.now_ms();
        let stream_id = StreamId::new(VENUE, "liquidation", market_type);

        for item in items {
            let Some(details) = item.get("details").and_then(Value::as_array) else {
                continue;
            };
            for detail in details {
                let (Some(price), Some(size)) = (
                    detail.get("bkPx").and_then(parse_f64),
                    detail.get("sz").and_then(parse_f64),
                ) else {
                    continue;
                };

                let side = match detail.get("side").and_then(Value::as_str) {
                    Some("buy") => Side::Buy,
                    _ => Side::Sell,
                };

                let ts = event_time(detail.get("ts").and_then(parse_i64), now);
                let event = LiquidationEvent {
                    meta: self.meta(ts, &stream_id, Some(ts), None),
                    symbol: symbol.clone(),
                    market_type,
                    stream_id: stream_id.clone(),
                    side,
                    price,
                    size,
                    unit: ValueUnit::Contracts,
                };
                self.bus.publish(topics::MARKET_LIQUIDATION, &event);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ManualClock;
    use parking_lot::Mutex as PMutex;
    use serde_json::json;

    fn setup() -> (Arc<EventBus>, OkxNormalizer) {
        let bus = Arc::new(EventBus::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let norm = OkxNormalizer::new(bus.clone(), clock);
        (bus, norm)
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

    #[test]
    fn swap_inst_id_maps_to_canonical_symbol() {
        let (bus, norm) = setup();
        let trades = capture(&bus, topics::MARKET_TRADE);

        norm.on_ws_message(
            MarketType::Futures,
            &json!({
                "arg": { "channel": "trades", "instId": "BTC-USDT-SWAP" },
                "data": [{ "px": "37000", "sz": "1.5", "side": "buy", "ts": "1700000000000", "tradeId": "t1" }]
            }),
        );

        let trades = trades.lock();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].symbol, "BTCUSDT");
        assert_eq!(trades[0].stream_id.as_str(), "okx:trades:futures");
        assert_eq!(trades[0].trade_id.as_deref(), Some("t1"));
    }

    #[test]
    fn books_chained_deltas_and_gap() {
        let (bus, norm) = setup();
        let resyncs = capture(&bus, topics::MARKET_RESYNC_REQUESTED);

        norm.on_ws_message(
            MarketType::Futures,
            &json!({
                "arg": { "channel": "books", "instId": "BTC-USDT-SWAP" },
                "action": "snapshot",
                "data": [{ "bids": [["100", "1"]], "asks": [["101", "1"]], "ts": "1700000000000", "seqId": 50 }]
            }),
        );

        // prevSeqId matches: contiguous.
        norm.on_ws_message(
            MarketType::Futures,
            &json!({
                "arg": { "channel": "books", "instId": "BTC-USDT-SWAP" },
                "action": "update",
                "data": [{ "bids": [], "asks": [["101", "2"]], "ts": "1700000000100", "seqId": 51, "prevSeqId": 50 }]
            }),
        );
        assert!(resyncs.lock().is_empty());

        // prevSeqId skips 51: gap with last_seen 51.
        norm.on_ws_message(
            MarketType::Futures,
            &json!({
                "arg": { "channel": "books", "instId": "BTC-USDT-SWAP" },
                "action": "update",
                "data": [{ "bids": [["100", "3"]], "asks": [], "ts": "1700000000200", "seqId": 60, "prevSeqId": 55 }]
            }),
        );
        let resyncs = resyncs.lock();
        assert_eq!(resyncs.len(), 1);
        assert_eq!(resyncs[0].last_sequence, Some(51));
        assert_eq!(resyncs[0].reason, ResyncReason::Gap);
    }

    #[test]
    fn open_interest_is_contract_denominated() {
        let (bus, norm) = setup();
        let oi = capture(&bus, topics::MARKET_OI);

        norm.on_ws_message(
            MarketType::Futures,
            &json!({
                "arg": { "channel": "open-interest", "instId": "BTC-USDT-SWAP" },
                "data": [{ "oi": "123456", "oiCcy": "1234.56", "ts": "1700000000000" }]
            }),
        );

        let oi = oi.lock();
        assert_eq!(oi.len(), 1);
        assert_eq!(oi[0].unit, ValueUnit::Contracts);
        assert_eq!(oi[0].open_interest, 123_456.0);
    }

    #[test]
    fn index_and_mark_points_carry_price_type() {
        let (bus, norm) = setup();
        let points = capture(&bus, topics::MARKET_PRICE_INDEX);

        norm.on_ws_message(
            MarketType::Futures,
            &json!({
                "arg": { "channel": "index-tickers", "instId": "BTC-USDT" },
                "data": [{ "idxPx": "37000.1", "ts": "1700000000000" }]
            }),
        );
        norm.on_ws_message(
            MarketType::Futures,
            &json!({
                "arg": { "channel": "mark-price", "instId": "BTC-USDT-SWAP" },
                "data": [{ "markPx": "37001.2", "ts": "1700000000000" }]
            }),
        );

        let points = points.lock();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].price_type, PriceType::Index);
        assert_eq!(points[1].price_type, PriceType::Mark);
    }

    #[test]
    fn liquidation_details_flattened() {
        let (bus, norm) = setup();
        let liqs = capture(&bus, topics::MARKET_LIQUIDATION);

        norm.on_ws_message(
            MarketType::Futures,
            &json!({
                "arg": { "channel": "liquidation-orders", "instId": "BTC-USDT-SWAP" },
                "data": [{
                    "details": [
                        { "side": "sell", "bkPx": "36900", "sz": "10", "ts": "1700000000000" },
                        { "side": "buy", "bkPx": "37100", "sz": "5", "ts": "1700000000001" }
                    ]
                }]
            }),
        );

        let liqs = liqs.lock();
        assert_eq!(liqs.len(), 2);
        assert_eq!(liqs[0].side, Side::Sell);
        assert_eq!(liqs[1].side, Side::Buy);
        assert_eq!(liqs[0].unit, ValueUnit::Contracts);
    }
}
