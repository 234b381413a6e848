// =============================================================================
// Market Gateway - binds a venue transport to the bus
// =============================================================================
//
// One gateway per (venue, market type) target. The gateway owns no market
// state; it translates bus-level lifecycle events into transport calls:
//
//   - `market:connect`    -> transport connect, then `market:connected`
//   - `market:subscribe`  -> venue subscriptions, deduplicated against the
//                            currently-active set
//   - reconnect           -> previously-desired subscriptions reissued once
//   - `market:resync_requested` -> disconnect/reconnect of the orderbook
//                            stream, coalesced: within `resync_cooldown_ms`
//                            per (venue, symbol) and `resync_reason_cooldown_ms`
//                            per (venue, symbol, reason), further requests are
//                            ignored
//
// Events addressed to other venues are ignored.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::GatewayConfig;
use crate::events::{
    ConnectionEvent, MarketErrorEvent, ResyncReason, ResyncRequest, SubscribeRequest,
};
use crate::meta::{Clock, EventMeta, TsMillis};
use crate::topics;
use crate::types::MarketType;

/// Transport seam. Real implementations live in `feeds`; tests use
/// [`MockTransport`].
pub trait VenueTransport: Send + Sync {
    fn venue(&self) -> &str;
    fn market_type(&self) -> MarketType;
    fn connect(&self) -> Result<()>;
    fn disconnect(&self) -> Result<()>;
    fn subscribe(&self, channels: &[String], symbols: &[String]) -> Result<()>;
    /// Disconnect-then-reconnect the orderbook stream(s) for one symbol.
    fn resync_orderbook(&self, symbol: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct GatewayState {
    /// Subscriptions the caller asked for (survives reconnects).
    desired: BTreeSet<(String, String)>,
    /// Subscriptions currently live on the transport.
    active: BTreeSet<(String, String)>,
    /// Last resync per (symbol).
    last_resync: HashMap<String, TsMillis>,
    /// Last resync per (symbol, reason).
    last_resync_by_reason: HashMap<(String, ResyncReason), TsMillis>,
    connected: bool,
}

pub struct MarketGateway {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn VenueTransport>,
    config: GatewayConfig,
    state: Mutex<GatewayState>,
}

impl MarketGateway {
    pub fn new(
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn VenueTransport>,
        config: GatewayConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            clock,
            transport,
            config,
            state: Mutex::new(GatewayState::default()),
        })
    }

    fn is_addressed(&self, venue: &str, market_type: MarketType) -> bool {
        venue == self.transport.venue() && market_type == self.transport.market_type()
    }

    /// Wire the gateway onto the bus.
    pub fn start(self: &Arc<Self>) {
        let gw = self.clone();
        self.bus.subscribe(topics::MARKET_CONNECT, move |req| {
            if gw.is_addressed(&req.venue, req.market_type) {
                gw.handle_connect();
            }
            Ok(())
        });

        let gw = self.clone();
        self.bus.subscribe(topics::MARKET_DISCONNECT, move |req| {
            if gw.is_addressed(&req.venue, req.market_type) {
                gw.handle_disconnect();
            }
            Ok(())
        });

        let gw = self.clone();
        self.bus.subscribe(topics::MARKET_SUBSCRIBE, move |req| {
            gw.handle_subscribe(req);
            Ok(())
        });

        let gw = self.clone();
        self.bus
            .subscribe(topics::MARKET_RESYNC_REQUESTED, move |req| {
                gw.handle_resync(req);
                Ok(())
            });
    }

    fn emit_error(&self, phase: &str, detail: String) {
        let event = MarketErrorEvent {
            meta: EventMeta::new("gateway", self.clock.now_ms()),
            venue: self.transport.venue().to_string(),
            market_type: Some(self.transport.market_type()),
            phase: phase.to_string(),
            detail,
        };
        self.bus.publish(topics::MARKET_ERROR, &event);
    }

    fn handle_connect(&self) {
        match self.transport.connect() {
            Ok(()) => {
                self.state.lock().connected = true;
                info!(
                    venue = self.transport.venue(),
                    market = %self.transport.market_type(),
                    "gateway connected"
                );
                let event = ConnectionEvent {
                    meta: EventMeta::new("gateway", self.clock.now_ms()),
                    venue: self.transport.venue().to_string(),
                    market_type: self.transport.market_type(),
                    stream_id: None,
                };
                self.bus.publish(topics::MARKET_CONNECTED, &event);
            }
            Err(e) => {
                warn!(venue = self.transport.venue(), error = %e, "connect failed");
                self.emit_error("connect", e.to_string());
            }
        }
    }

    fn handle_disconnect(&self) {
        if let Err(e) = self.transport.disconnect() {
            warn!(venue = self.transport.venue(), error = %e, "disconnect failed");
        }
        let mut state = self.state.lock();
        state.connected = false;
        state.active.clear();
        drop(state);

        let event = ConnectionEvent {
            meta: EventMeta::new("gateway", self.clock.now_ms()),
            venue: self.transport.venue().to_string(),
            market_type: self.transport.market_type(),
            stream_id: None,
        };
        self.bus.publish(topics::MARKET_DISCONNECTED, &event);
    }

    fn handle_subscribe(&self, req: &SubscribeRequest) {
        if !self.is_addressed(&req.venue, req.market_type) {
            return;
        }

        // Record desire and compute what is actually new.
        let fresh: Vec<(String, String)> = {
            let mut state = self.state.lock();
            let mut fresh = Vec::new();
            for channel in &req.channels {
                for symbol in &req.symbols {
                    let key = (channel.clone(), symbol.clone());
                    state.desired.insert(key.clone());
                    if state.active.insert(key.clone()) {
                        fresh.push(key);
                    }
                }
            }
            fresh
        };

        if fresh.is_empty() {
            debug!(venue = self.transport.venue(), "subscribe request fully deduplicated");
            return;
        }

        let channels: BTreeSet<String> = fresh.iter().map(|(c, _)| c.clone()).collect();
        let symbols: BTreeSet<String> = fresh.iter().map(|(_, s)| s.clone()).collect();
        let channels: Vec<String> = channels.into_iter().collect();
        let symbols: Vec<String> = symbols.into_iter().collect();

        if let Err(e) = self.transport.subscribe(&channels, &symbols) {
            warn!(venue = self.transport.venue(), error = %e, "subscribe failed");
            // Roll the failed keys back so a retry is not deduplicated away.
            let mut state = self.state.lock();
            for key in &fresh {
                state.active.remove(key);
            }
            drop(state);
            self.emit_error("subscribe", e.to_string());
        } else {
            info!(
                venue = self.transport.venue(),
                channels = ?channels,
                symbols = ?symbols,
                "subscriptions issued"
            );
        }
    }

    /// Called by the transport after it re-established its connection.
    /// Reissues every previously-desired subscription exactly once.
    pub fn on_transport_reconnected(&self) {
        let desired: Vec<(String, String)> = {
            let mut state = self.state.lock();
            state.connected = true;
            state.active = state.desired.clone();
            state.desired.iter().cloned().collect()
        };

        if desired.is_empty() {
            return;
        }

        let channels: BTreeSet<String> = desired.iter().map(|(c, _)| c.clone()).collect();
        let symbols: BTreeSet<String> = desired.iter().map(|(_, s)| s.clone()).collect();
        let channels: Vec<String> = channels.into_iter().collect();
        let symbols: Vec<String> = symbols.into_iter().collect();

        info!(
            venue = self.transport.venue(),
            count = desired.len(),
            "reissuing subscriptions after reconnect"
        );
        if let Err(e) = self.transport.subscribe(&channels, &symbols) {
            warn!(venue = self.transport.venue(), error = %e, "resubscribe failed");
            self.emit_error("subscribe", e.to_string());
        }

        let event = ConnectionEvent {
            meta: EventMeta::new("gateway", self.clock.now_ms()),
            venue: self.transport.venue().to_string(),
            market_type: self.transport.market_type(),
            stream_id: None,
        };
        self.bus.publish(topics::MARKET_CONNECTED, &event);
    }

    fn handle_resync(&self, req: &ResyncRequest) {
        if req.venue != self.transport.venue()
            || req.stream_id.venue() != self.transport.venue()
        {
            return;
        }

        let now = self.clock.now_ms();
        {
            let mut state = self.state.lock();

            if let Some(&last) = state.last_resync.get(&req.symbol) {
                if now.delta_ms(last) < self.config.resync_cooldown_ms {
                    debug!(
                        venue = self.transport.venue(),
                        symbol = %req.symbol,
                        "resync coalesced (symbol cooldown)"
                    );
                    return;
                }
            }
            if let Some(&last) = state
                .last_resync_by_reason
                .get(&(req.symbol.clone(), req.reason))
            {
                if now.delta_ms(last) < self.config.resync_reason_cooldown_ms {
                    debug!(
                        venue = self.transport.venue(),
                        symbol = %req.symbol,
                        reason = %req.reason,
                        "resync coalesced (reason cooldown)"
                    );
                    return;
                }
            }

            state.last_resync.insert(req.symbol.clone(), now);
            state
                .last_resync_by_reason
                .insert((req.symbol.clone(), req.reason), now);
        }

        info!(
            venue = self.transport.venue(),
            symbol = %req.symbol,
            reason = %req.reason,
            last_sequence = ?req.last_sequence,
            "resyncing orderbook stream"
        );
        if let Err(e) = self.transport.resync_orderbook(&req.symbol) {
            warn!(venue = self.transport.venue(), symbol = %req.symbol, error = %e, "resync failed");
            self.emit_error("resync", e.to_string());
        }
    }
}

// =============================================================================
// Mock transport (tests)
// =============================================================================

#[cfg(test)]
pub struct MockTransport {
    venue: String,
    market_type: MarketType,
    pub connects: Mutex<usize>,
    pub disconnects: Mutex<usize>,
    pub subscribe_calls: Mutex<Vec<(Vec<String>, Vec<String>)>>,
    pub resyncs: Mutex<Vec<String>>,
    pub fail_connect: Mutex<bool>,
}

#[cfg(test)]
impl MockTransport {
    pub fn new(venue: &str, market_type: MarketType) -> Arc<Self> {
        Arc::new(Self {
            venue: venue.to_string(),
            market_type,
            connects: Mutex::new(0),
            disconnects: Mutex::new(0),
            subscribe_calls: Mutex::new(Vec::new()),
            resyncs: Mutex::new(Vec::new()),
            fail_connect: Mutex::new(false),
        })
    }
}

#[cfg(test)]
impl VenueTransport for MockTransport {
    fn venue(&self) -> &str {
        &self.venue
    }

    fn market_type(&self) -> MarketType {
        self.market_type
    }

    fn connect(&self) -> Result<()> {
        if *self.fail_connect.lock() {
            anyhow::bail!("connect refused");
        }
        *self.connects.lock() += 1;
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        *self.disconnects.lock() += 1;
        Ok(())
    }

    fn subscribe(&self, channels: &[String], symbols: &[String]) -> Result<()> {
        self.subscribe_calls
            .lock()
            .push((channels.to_vec(), symbols.to_vec()));
        Ok(())
    }

    fn resync_orderbook(&self, symbol: &str) -> Result<()> {
        self.resyncs.lock().push(symbol.to_string());
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ManualClock, StreamId};
    use parking_lot::Mutex as PMutex;

    fn setup(
        cooldown_ms: i64,
        reason_cooldown_ms: i64,
    ) -> (Arc<EventBus>, Arc<ManualClock>, Arc<MockTransport>, Arc<MarketGateway>) {
        let bus = Arc::new(EventBus::new());
        let clock = Arc::new(ManualClock::new(100_000));
        let transport = MockTransport::new("binance", MarketType::Spot);
        let gateway = MarketGateway::new(
            bus.clone(),
            clock.clone(),
            transport.clone(),
            GatewayConfig {
                resync_cooldown_ms: cooldown_ms,
                resync_reason_cooldown_ms: reason_cooldown_ms,
            },
        );
        gateway.start();
        (bus, clock, transport, gateway)
    }

    fn connect_req(venue: &str, market_type: MarketType) -> crate::events::ConnectRequest {
        crate::events::ConnectRequest {
            meta: EventMeta::new("orchestrator", TsMillis(100_000)),
            venue: venue.to_string(),
            market_type,
        }
    }

    fn subscribe_req(channels: &[&str], symbols: &[&str]) -> SubscribeRequest {
        SubscribeRequest {
            meta: EventMeta::new("orchestrator", TsMillis(100_000)),
            venue: "binance".to_string(),
            market_type: MarketType::Spot,
            channels: channels.iter().map(|s| s.to_string()).collect(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn resync_req(symbol: &str, reason: ResyncReason) -> ResyncRequest {
        ResyncRequest {
            meta: EventMeta::new("normalizer", TsMillis(100_000)),
            venue: "binance".to_string(),
            symbol: symbol.to_string(),
            stream_id: StreamId::from("binance:depth:spot"),
            reason,
            last_sequence: Some(10),
        }
    }

    #[test]
    fn connect_publishes_connected_event() {
        let (bus, _clock, transport, _gw) = setup(1_000, 2_000);
        let connected = Arc::new(PMutex::new(0));
        let c = connected.clone();
        bus.subscribe(topics::MARKET_CONNECTED, move |_| {
            *c.lock() += 1;
            Ok(())
        });

        bus.publish(topics::MARKET_CONNECT, &connect_req("binance", MarketType::Spot));
        assert_eq!(*transport.connects.lock(), 1);
        assert_eq!(*connected.lock(), 1);
    }

    #[test]
    fn events_for_other_venues_are_ignored() {
        let (bus, _clock, transport, _gw) = setup(1_000, 2_000);

        bus.publish(topics::MARKET_CONNECT, &connect_req("okx", MarketType::Spot));
        bus.publish(topics::MARKET_CONNECT, &connect_req("binance", MarketType::Futures));
        assert_eq!(*transport.connects.lock(), 0);
    }

    #[test]
    fn connect_failure_emits_market_error() {
        let (bus, _clock, transport, _gw) = setup(1_000, 2_000);
        *transport.fail_connect.lock() = true;

        let errors = Arc::new(PMutex::new(Vec::new()));
        let e = errors.clone();
        bus.subscribe(topics::MARKET_ERROR, move |ev| {
            e.lock().push(ev.phase.clone());
            Ok(())
        });

        bus.publish(topics::MARKET_CONNECT, &connect_req("binance", MarketType::Spot));
        assert_eq!(*errors.lock(), vec!["connect"]);
    }

    #[test]
    fn subscribe_deduplicates_against_active() {
        let (bus, _clock, transport, _gw) = setup(1_000, 2_000);

        bus.publish(topics::MARKET_SUBSCRIBE, &subscribe_req(&["trade"], &["BTCUSDT"]));
        bus.publish(topics::MARKET_SUBSCRIBE, &subscribe_req(&["trade"], &["BTCUSDT"]));
        bus.publish(
            topics::MARKET_SUBSCRIBE,
            &subscribe_req(&["trade"], &["BTCUSDT", "ETHUSDT"]),
        );

        let calls = transport.subscribe_calls.lock();
        // First call subscribes BTCUSDT; second is fully deduplicated; third
        // only carries the new ETHUSDT.
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, vec!["BTCUSDT"]);
        assert_eq!(calls[1].1, vec!["ETHUSDT"]);
    }

    #[test]
    fn reconnect_reissues_desired_exactly_once() {
        let (bus, _clock, transport, gw) = setup(1_000, 2_000);

        bus.publish(
            topics::MARKET_SUBSCRIBE,
            &subscribe_req(&["trade", "depth"], &["BTCUSDT"]),
        );
        assert_eq!(transport.subscribe_calls.lock().len(), 1);

        gw.on_transport_reconnected();

        let calls = transport.subscribe_calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, vec!["depth", "trade"]);
        assert_eq!(calls[1].1, vec!["BTCUSDT"]);
    }

    #[test]
    fn resync_coalesced_within_cooldown() {
        let (bus, clock, transport, _gw) = setup(1_000, 2_000);

        // Five rapid-fire gap resyncs for the same symbol: exactly one reaches
        // the transport.
        for _ in 0..5 {
            bus.publish(topics::MARKET_RESYNC_REQUESTED, &resync_req("BTCUSDT", ResyncReason::Gap));
        }
        assert_eq!(transport.resyncs.lock().len(), 1);

        // Past the symbol cooldown but inside the per-reason cooldown: still
        // coalesced.
        clock.advance(1_500);
        bus.publish(topics::MARKET_RESYNC_REQUESTED, &resync_req("BTCUSDT", ResyncReason::Gap));
        assert_eq!(transport.resyncs.lock().len(), 1);

        // Past both cooldowns: goes through.
        clock.advance(1_000);
        bus.publish(topics::MARKET_RESYNC_REQUESTED, &resync_req("BTCUSDT", ResyncReason::Gap));
        assert_eq!(transport.resyncs.lock().len(), 2);
    }

    #[test]
    fn resync_cooldowns_are_per_symbol() {
        let (bus, _clock, transport, _gw) = setup(1_000, 2_000);

        bus.publish(topics::MARKET_RESYNC_REQUESTED, &resync_req("BTCUSDT", ResyncReason::Gap));
        bus.publish(topics::MARKET_RESYNC_REQUESTED, &resync_req("ETHUSDT", ResyncReason::Gap));

        let resyncs = transport.resyncs.lock();
        assert_eq!(resyncs.len(), 2);
        assert_eq!(*resyncs, vec!["BTCUSDT", "ETHUSDT"]);
    }
}
