// =============================================================================
// Binance Normalizer - decoded Binance messages to normalized events
// =============================================================================
//
// Binance sends numeric values as JSON strings inside most payloads. Spot and
// futures share message shapes; futures depth deltas additionally carry `pu`
// (previous update id) for explicit chaining, spot deltas only the `U..u`
// range. Snapshot sequence field is `lastUpdateId`, delta latest is `u`.

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

const VENUE: &str = "binance";

pub struct BinanceNormalizer {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    ledger: Mutex<SequenceLedger>,
}

impl BinanceNormalizer {
    pub fn new(bus: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            bus,
            clock,
            ledger: Mutex::new(SequenceLedger::default()),
        }
    }

    /// Route a WS message by its `e` event-type field.
    pub fn on_ws_message(&self, market_type: MarketType, msg: &Value) {
        // Combined streams wrap the payload in `{ stream, data }`.
        let data = msg.get("data").unwrap_or(msg);

        match data.get("e").and_then(Value::as_str) {
            Some("aggTrade") => self.on_agg_trade(market_type, data),
            Some("kline") => self.on_kline(market_type, data),
            Some("24hrTicker") | Some("24hrMiniTicker") => self.on_ticker(market_type, data),
            Some("depthUpdate") => self.on_depth_update(market_type, data),
            Some("markPriceUpdate") => self.on_mark_price(market_type, data),
            Some("forceOrder") => self.on_force_order(market_type, data),
            Some(other) => {
                debug!(venue = VENUE, event = other, "unhandled ws event type");
                self.publish_raw(topics::MARKET_WS_EVENT_RAW, market_type, other, None, data);
            }
            None => {
                debug!(venue = VENUE, "ws message without event type");
                self.publish_raw(topics::MARKET_WS_EVENT_RAW, market_type, "unknown", None, data);
            }
        }
    }

    /// Drop events whose market type could not be resolved. Never coerce.
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

    /// `{ "e":"aggTrade", "s":"BTCUSDT", "a":1, "p":"...", "q":"...",
    ///    "T":..., "m":true }`
    pub fn on_agg_trade(&self, market_type: MarketType, msg: &Value) {
        if !self.check_market_type(market_type, "aggTrade") {
            return;
        }
        let Some(symbol) = msg.get("s").and_then(Value::as_str).map(canonical_symbol) else {
            warn!(venue = VENUE, "aggTrade without symbol");
            return;
        };
        self.publish_raw(
            topics::MARKET_TRADE_RAW,
            market_type,
            "aggTrade",
            Some(symbol.clone()),
            msg,
        );

        let (Some(price), Some(size)) = (
            msg.get("p").and_then(parse_f64),
            msg.get("q").and_then(parse_f64),
        ) else {
            warn!(venue = VENUE, symbol = %symbol, "aggTrade missing price/size");
            return;
        };

        // Buyer is maker means the taker sold.
        let side = if msg.get("m").and_then(Value::as_bool).unwrap_or(false) {
            Side::Sell
        } else {
            Side::Buy
        };

        let now = self.clock.now_ms();
        let trade_ts = event_time(msg.get("T").and_then(parse_i64), now);
        let stream_id = StreamId::new(VENUE, "trade", market_type);
        let sequence = msg.get("a").and_then(super::parse_u64);

        let event = TradeEvent {
            meta: self.meta(trade_ts, &stream_id, Some(trade_ts), sequence),
            symbol,
            market_type,
            stream_id,
            trade_ts,
            price,
            size,
            side,
            trade_id: msg.get("a").and_then(super::parse_u64).map(|a| a.to_string()),
        };
        self.bus.publish(topics::MARKET_TRADE, &event);
    }

    // ── Klines ───────────────────────────────────────────────────────────

    /// `{ "e":"kline", "s":"BTCUSDT", "k": { t, T, i, o, h, l, c, v, q, x } }`
    pub fn on_kline(&self, market_type: MarketType, msg: &Value) {
        if !self.check_market_type(market_type, "kline") {
            return;
        }
        let Some(symbol) = msg.get("s").and_then(Value::as_str).map(canonical_symbol) else {
            warn!(venue = VENUE, "kline without symbol");
            return;
        };
        self.publish_raw(
            topics::MARKET_CANDLE_RAW,
            market_type,
            "kline",
            Some(symbol.clone()),
            msg,
        );

        let k = &msg["k"];
        let Some(tf) = k.get("i").and_then(Value::as_str).map(str::to_string) else {
            warn!(venue = VENUE, symbol = %symbol, "kline missing interval");
            return;
        };
        let (Some(start), Some(end)) = (
            k.get("t").and_then(parse_i64),
            k.get("T").and_then(parse_i64),
        ) else {
            warn!(venue = VENUE, symbol = %symbol, "kline missing window");
            return;
        };
        let parsed = [
            k.get("o").and_then(parse_f64),
            k.get("h").and_then(parse_f64),
            k.get("l").and_then(parse_f64),
            k.get("c").and_then(parse_f64),
            k.get("v").and_then(parse_f64),
        ];
        let [Some(open), Some(high), Some(low), Some(close), Some(volume)] = parsed else {
            warn!(venue = VENUE, symbol = %symbol, "kline missing ohlcv");
            return;
        };

        let end_ts = TsMillis(end);
        let stream_id = StreamId::new(VENUE, "kline", market_type);
        let event = KlineEvent {
            meta: self.meta(end_ts, &stream_id, Some(end_ts), None),
            symbol,
            market_type,
            stream_id,
            tf,
            start_ts: TsMillis(start),
            end_ts,
            open,
            high,
            low,
            close,
            volume,
            quote_volume: k.get("q").and_then(parse_f64),
            closed: k.get("x").and_then(Value::as_bool).unwrap_or(false),
            bootstrap: false,
        };
        self.bus.publish(topics::MARKET_KLINE, &event);
    }

    /// REST kline entry: one `[openTime, open, high, low, close, volume,
    /// closeTime, ...]` array row. Used by the bootstrap fetcher; published
    /// as a closed candle flagged `bootstrap`.
    pub fn on_rest_kline(&self, market_type: MarketType, symbol: &str, tf: &str, row: &Value) {
        if !self.check_market_type(market_type, "restKline") {
            return;
        }
        let symbol = canonical_symbol(symbol);

        let (Some(start), Some(end)) = (
            row.get(0).and_then(parse_i64),
            row.get(6).and_then(parse_i64),
        ) else {
            warn!(venue = VENUE, symbol = %symbol, "rest kline missing window");
            return;
        };
        let parsed = [
            row.get(1).and_then(parse_f64),
            row.get(2).and_then(parse_f64),
            row.get(3).and_then(parse_f64),
            row.get(4).and_then(parse_f64),
            row.get(5).and_then(parse_f64),
        ];
        let [Some(open), Some(high), Some(low), Some(close), Some(volume)] = parsed else {
            warn!(venue = VENUE, symbol = %symbol, "rest kline missing ohlcv");
            return;
        };

        let end_ts = TsMillis(end);
        let stream_id = StreamId::new(VENUE, "kline", market_type);
        let event = KlineEvent {
            meta: self.meta(end_ts, &stream_id, Some(end_ts), None),
            symbol,
            market_type,
            stream_id,
            tf: tf.to_string(),
            start_ts: TsMillis(start),
            end_ts,
            open,
            high,
            low,
            close,
            volume,
            quote_volume: row.get(7).and_then(parse_f64),
            closed: true,
            bootstrap: true,
        };
        self.bus.publish(topics::MARKET_KLINE, &event);
    }

    // ── Ticker ───────────────────────────────────────────────────────────

    /// `{ "e":"24hrTicker", "s":"BTCUSDT", "c":"...", "b":"...", "a":"...",
    ///    "v":"...", "E":... }`
    pub fn on_ticker(&self, market_type: MarketType, msg: &Value) {
        if !self.check_market_type(market_type, "ticker") {
            return;
        }
        let Some(symbol) = msg.get("s").and_then(Value::as_str).map(canonical_symbol) else {
            warn!(venue = VENUE, "ticker without symbol");
            return;
        };
        self.publish_raw(
            topics::MARKET_WS_EVENT_RAW,
            market_type,
            "ticker",
            Some(symbol.clone()),
            msg,
        );

        let Some(last_price) = msg.get("c").and_then(parse_f64) else {
            warn!(venue = VENUE, symbol = %symbol, "ticker missing close");
            return;
        };

        let now = self.clock.now_ms();
        let ts = event_time(msg.get("E").and_then(parse_i64), now);
        let stream_id = StreamId::new(VENUE, "ticker", market_type);

        let event = TickerEvent {
            meta: self.meta(ts, &stream_id, Some(ts), None),
            symbol,
            market_type,
            stream_id,
            last_price,
            bid: msg.get("b").and_then(parse_f64),
            ask: msg.get("a").and_then(parse_f64),
            volume_24h: msg.get("v").and_then(parse_f64),
        };
        self.bus.publish(topics::MARKET_TICKER, &event);
    }

    // ── Orderbook ────────────────────────────────────────────────────────

    /// REST depth snapshot: `{ "lastUpdateId": ..., "bids": [...], "asks": [...] }`.
    /// The symbol is not in the payload, so the transport passes it in.
    pub fn on_depth_snapshot(&self, market_type: MarketType, symbol: &str, msg: &Value) {
        if !self.check_market_type(market_type, "depthSnapshot") {
            return;
        }
        let symbol = canonical_symbol(symbol);
        self.publish_raw(
            topics::MARKET_ORDERBOOK_SNAPSHOT_RAW,
            market_type,
            "depthSnapshot",
            Some(symbol.clone()),
            msg,
        );

        let Some(update_id) = coerce_sequence(msg, &["lastUpdateId", "seq", "seqId"]) else {
            warn!(venue = VENUE, symbol = %symbol, "depth snapshot missing lastUpdateId");
            return;
        };

        let now = self.clock.now_ms();
        let ts = event_time(msg.get("E").and_then(parse_i64), now);
        let stream_id = StreamId::new(VENUE, "depth", market_type);

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
            bids: parse_levels(&msg["bids"]),
            asks: parse_levels(&msg["asks"]),
        };
        self.bus.publish(topics::MARKET_ORDERBOOK_L2_SNAPSHOT, &event);
    }

    /// `{ "e":"depthUpdate", "s":"BTCUSDT", "E":..., "U":..., "u":...,
    ///    "pu":... (futures), "b":[[p,q]], "a":[[p,q]] }`
    pub fn on_depth_update(&self, market_type: MarketType, msg: &Value) {
        if !self.check_market_type(market_type, "depthUpdate") {
            return;
        }
        let Some(symbol) = msg.get("s").and_then(Value::as_str).map(canonical_symbol) else {
            warn!(venue = VENUE, "depthUpdate without symbol");
            return;
        };
        self.publish_raw(
            topics::MARKET_ORDERBOOK_DELTA_RAW,
            market_type,
            "depthUpdate",
            Some(symbol.clone()),
            msg,
        );

        let Some(update_id) = coerce_sequence(msg, &["u", "lastUpdateId"]) else {
            warn!(venue = VENUE, symbol = %symbol, "depthUpdate missing update id");
            return;
        };
        let first_update_id = msg.get("U").and_then(super::parse_u64);
        let prev_update_id = msg.get("pu").and_then(super::parse_u64);

        let now = self.clock.now_ms();
        let ts = event_time(msg.get("E").and_then(parse_i64), now);
        let stream_id = StreamId::new(VENUE, "depth", market_type);

        let check = self.ledger.lock().check_delta(
            &stream_id,
            &symbol,
            first_update_id,
            prev_update_id,
            update_id,
        );

        let event = OrderbookL2Delta {
            meta: self.meta(ts, &stream_id, Some(ts), Some(update_id)),
            symbol: symbol.clone(),
            market_type,
            stream_id: stream_id.clone(),
            exchange_ts: ts,
            first_update_id,
            update_id,
            prev_update_id,
            bids: parse_levels(&msg["b"]),
            asks: parse_levels(&msg["a"]),
        };

        if let SeqCheck::Gap { last_seen } = check {
            warn!(
                venue = VENUE,
                symbol = %symbol,
                last_seen,
                update_id,
                "depth sequence gap, requesting resync"
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

    /// Forget per-symbol sequence expectations when the depth stream drops.
    pub fn on_stream_disconnected(&self, stream_id: &StreamId) {
        self.ledger.lock().reset_stream(stream_id);
    }

    // ── Mark / index price + funding ─────────────────────────────────────

    /// `{ "e":"markPriceUpdate", "s":"BTCUSDT", "p": mark, "i": index,
    ///    "r": funding rate, "T": next funding time, "E":... }`
    pub fn on_mark_price(&self, market_type: MarketType, msg: &Value) {
        if !self.check_market_type(market_type, "markPrice") {
            return;
        }
        let Some(symbol) = msg.get("s").and_then(Value::as_str).map(canonical_symbol) else {
            warn!(venue = VENUE, "markPriceUpdate without symbol");
            return;
        };
        self.publish_raw(
            topics::MARKET_MARK_PRICE_RAW,
            market_type,
            "markPrice",
            Some(symbol.clone()),
            msg,
        );

        let now = self.clock.now_ms();
        let ts = event_time(msg.get("E").and_then(parse_i64), now);
        let stream_id = StreamId::new(VENUE, "mark", market_type);

        if let Some(mark) = msg.get("p").and_then(parse_f64) {
            let event = PricePointEvent {
                meta: self.meta(ts, &stream_id, Some(ts), None),
                symbol: symbol.clone(),
                market_type,
                stream_id: stream_id.clone(),
                price: mark,
                price_type: PriceType::Mark,
            };
            self.bus.publish(topics::MARKET_PRICE_INDEX, &event);
        }

        if let Some(index) = msg.get("i").and_then(parse_f64) {
            let index_stream = StreamId::new(VENUE, "index", market_type);
            let event = PricePointEvent {
                meta: self.meta(ts, &index_stream, Some(ts), None),
                symbol: symbol.clone(),
                market_type,
                stream_id: index_stream,
                price: index,
                price_type: PriceType::Index,
            };
            self.bus.publish(topics::MARKET_PRICE_INDEX, &event);
        }

        if let Some(rate) = msg.get("r").and_then(parse_f64) {
            let funding_stream = StreamId::new(VENUE, "funding", market_type);
            let event = FundingRateEvent {
                meta: self.meta(ts, &funding_stream, Some(ts), None),
                symbol,
                market_type,
                stream_id: funding_stream,
                rate,
                next_funding_ts: msg.get("T").and_then(parse_i64).map(TsMillis),
            };
            self.bus.publish(topics::MARKET_FUNDING, &event);
        }
    }

    // ── Liquidations ─────────────────────────────────────────────────────

    /// `{ "e":"forceOrder", "o": { "s":"BTCUSDT", "S":"SELL", "p":"...",
    ///    "q":"...", "T":... } }`
    pub fn on_force_order(&self, market_type: MarketType, msg: &Value) {
        if !self.check_market_type(market_type, "forceOrder") {
            return;
        }
        let order = &msg["o"];
        let Some(symbol) = order.get("s").and_then(Value::as_str).map(canonical_symbol) else {
            warn!(venue = VENUE, "forceOrder without symbol");
            return;
        };
        self.publish_raw(
            topics::MARKET_LIQUIDATION_RAW,
            market_type,
            "forceOrder",
            Some(symbol.clone()),
            msg,
        );

        let (Some(price), Some(size)) = (
            order.get("p").and_then(parse_f64),
            order.get("q").and_then(parse_f64),
        ) else {
            warn!(venue = VENUE, symbol = %symbol, "forceOrder missing price/size");
            return;
        };

        // The liquidated position's forced order side: SELL means longs were
        // liquidated.
        let side = match order.get("S").and_then(Value::as_str) {
            Some("BUY") => Side::Buy,
            _ => Side::Sell,
        };

        let now = self.clock.now_ms();
        let ts = event_time(order.get("T").and_then(parse_i64), now);
        let stream_id = StreamId::new(VENUE, "liquidation", market_type);

        let event = LiquidationEvent {
            meta: self.meta(ts, &stream_id, Some(ts), None),
            symbol,
            market_type,
            stream_id,
            side,
            price,
            size,
            unit: ValueUnit::Base,
        };
        self.bus.publish(topics::MARKET_LIQUIDATION, &event);
    }

    // ── Open interest (REST) ─────────────────────────────────────────────

    /// `{ "openInterest": "10659.509", "symbol": "BTCUSDT", "time": ... }`
    pub fn on_open_interest(&self, market_type: MarketType, msg: &Value) {
        if !self.check_market_type(market_type, "openInterest") {
            return;
        }
        let Some(symbol) = msg.get("symbol").and_then(Value::as_str).map(canonical_symbol)
        else {
            warn!(venue = VENUE, "openInterest without symbol");
            return;
        };
        self.publish_raw(
            topics::MARKET_OPEN_INTEREST_RAW,
            market_type,
            "openInterest",
            Some(symbol.clone()),
            msg,
        );

        let Some(open_interest) = msg.get("openInterest").and_then(parse_f64) else {
            warn!(venue = VENUE, symbol = %symbol, "openInterest missing value");
            return;
        };

        let now = self.clock.now_ms();
        let ts = event_time(msg.get("time").and_then(parse_i64), now);
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

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ManualClock;
    use parking_lot::Mutex as PMutex;
    use serde_json::json;

    fn setup() -> (Arc<EventBus>, Arc<ManualClock>, BinanceNormalizer) {
        let bus = Arc::new(EventBus::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let norm = BinanceNormalizer::new(bus.clone(), clock.clone());
        (bus, clock, norm)
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
    fn agg_trade_normalizes_side_and_meta() {
        let (bus, _clock, norm) = setup();
        let trades = capture(&bus, topics::MARKET_TRADE);
        let raws = capture(&bus, topics::MARKET_TRADE_RAW);

        norm.on_agg_trade(
            MarketType::Spot,
            &json!({
                "e": "aggTrade", "s": "BTCUSDT", "a": 7,
                "p": "37000.5", "q": "0.25", "T": 1_700_000_000_000i64, "m": true
            }),
        );

        let trades = trades.lock();
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.symbol, "BTCUSDT");
        assert_eq!(t.side, Side::Sell); // buyer-maker means taker sold
        assert_eq!(t.trade_ts, TsMillis(1_700_000_000_000));
        assert_eq!(t.meta.ts_event, t.trade_ts);
        assert_eq!(t.meta.ts_ingest, Some(TsMillis(1_000)));
        assert_eq!(t.meta.stream_id.as_ref(), Some(&t.stream_id));
        assert_eq!(t.stream_id.as_str(), "binance:trade:spot");
        assert_eq!(raws.lock().len(), 1);
    }

    #[test]
    fn unknown_market_type_is_dropped() {
        let (bus, _clock, norm) = setup();
        let trades = capture(&bus, topics::MARKET_TRADE);

        norm.on_agg_trade(
            MarketType::Unknown,
            &json!({ "e": "aggTrade", "s": "BTCUSDT", "p": "1", "q": "1", "T": 1, "m": false }),
        );

        assert!(trades.lock().is_empty());
    }

    #[test]
    fn depth_gap_requests_resync_with_last_sequence() {
        let (bus, _clock, norm) = setup();
        let resyncs = capture(&bus, topics::MARKET_RESYNC_REQUESTED);
        let deltas = capture(&bus, topics::MARKET_ORDERBOOK_L2_DELTA);

        norm.on_depth_snapshot(
            MarketType::Futures,
            "BTCUSDT",
            &json!({ "lastUpdateId": 100, "bids": [["100.0", "1.0"]], "asks": [["101.0", "1.0"]] }),
        );

        // Contiguous futures delta: pu == 100.
        norm.on_depth_update(
            MarketType::Futures,
            &json!({
                "e": "depthUpdate", "s": "BTCUSDT", "E": 1_700_000_000_100i64,
                "U": 101, "u": 105, "pu": 100, "b": [["100.0", "2.0"]], "a": []
            }),
        );
        assert!(resyncs.lock().is_empty());

        // Gap: pu == 110, last seen was 105.
        norm.on_depth_update(
            MarketType::Futures,
            &json!({
                "e": "depthUpdate", "s": "BTCUSDT", "E": 1_700_000_000_200i64,
                "U": 111, "u": 115, "pu": 110, "b": [], "a": [["101.0", "0.5"]]
            }),
        );

        let resyncs = resyncs.lock();
        assert_eq!(resyncs.len(), 1);
        assert_eq!(resyncs[0].reason, ResyncReason::Gap);
        assert_eq!(resyncs[0].last_sequence, Some(105));
        assert_eq!(resyncs[0].symbol, "BTCUSDT");
        // The delta itself is still published for the book engine to judge.
        assert_eq!(deltas.lock().len(), 2);
    }

    #[test]
    fn kline_normalizes_window_and_interval() {
        let (bus, _clock, norm) = setup();
        let klines = capture(&bus, topics::MARKET_KLINE);

        norm.on_kline(
            MarketType::Spot,
            &json!({
                "e": "kline", "s": "ETHUSDT",
                "k": {
                    "t": 1_700_000_000_000i64, "T": 1_700_000_059_999i64, "i": "1m",
                    "o": "2000.0", "h": "2010.0", "l": "1995.0", "c": "2005.0",
                    "v": "150.5", "q": "301000.0", "x": true
                }
            }),
        );

        let klines = klines.lock();
        assert_eq!(klines.len(), 1);
        let k = &klines[0];
        assert_eq!(k.tf, "1m");
        assert!(k.closed);
        assert_eq!(k.end_ts, TsMillis(1_700_000_059_999));
        assert_eq!(k.meta.ts_event, k.end_ts);
        assert_eq!(k.close, 2005.0);
    }

    #[test]
    fn mark_price_fans_out_mark_index_and_funding() {
        let (bus, _clock, norm) = setup();
        let points = capture(&bus, topics::MARKET_PRICE_INDEX);
        let funding = capture(&bus, topics::MARKET_FUNDING);

        norm.on_mark_price(
            MarketType::Futures,
            &json!({
                "e": "markPriceUpdate", "s": "BTCUSDT", "E": 1_700_000_000_000i64,
                "p": "37001.0", "i": "37000.0", "r": "0.0001", "T": 1_700_028_800_000i64
            }),
        );

        let points = points.lock();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].price_type, PriceType::Mark);
        assert_eq!(points[1].price_type, PriceType::Index);
        assert_eq!(points[1].price, 37_000.0);

        let funding = funding.lock();
        assert_eq!(funding.len(), 1);
        assert_eq!(funding[0].rate, 0.0001);
        assert_eq!(funding[0].next_funding_ts, Some(TsMillis(1_700_028_800_000)));
    }

    #[test]
    fn ws_dispatcher_routes_by_event_type() {
        let (bus, _clock, norm) = setup();
        let trades = capture(&bus, topics::MARKET_TRADE);

        // Combined-stream envelope.
        norm.on_ws_message(
            MarketType::Spot,
            &json!({
                "stream": "btcusdt@aggTrade",
                "data": { "e": "aggTrade", "s": "BTCUSDT", "p": "1.0", "q": "2.0", "T": 5, "m": false }
            }),
        );

        assert_eq!(trades.lock().len(), 1);
        assert_eq!(trades.lock()[0].side, Side::Buy);
    }
}
