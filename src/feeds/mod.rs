// =============================================================================
// Feeds - reference live transports
// =============================================================================
//
// The pipeline core consumes decoded venue messages; these modules provide
// the concrete Binance transport that produces them. Each stream kind is a
// reconnecting loop in its own task, and the whole transport plugs into the
// gateway through the `VenueTransport` seam.

pub mod binance_rest;
pub mod binance_ws;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::bus::EventBus;
use crate::events::ConnectionEvent;
use crate::gateway::VenueTransport;
use crate::meta::{Clock, EventMeta, StreamId};
use crate::normalizer::BinanceNormalizer;
use crate::topics;
use crate::types::MarketType;

pub use binance_rest::{spawn_oi_polling, BinanceRest, KlineBootstrapper};

const RECONNECT_DELAY_SECS: u64 = 5;

/// Live Binance transport for one market type. Spawns one reconnecting task
/// per (channel, symbol) subscription.
pub struct BinanceTransport {
    market_type: MarketType,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    normalizer: Arc<BinanceNormalizer>,
    rest: Arc<BinanceRest>,
    runtime: tokio::runtime::Handle,
    kline_tfs: Vec<String>,
    orderbook_depth: usize,
    tasks: Mutex<HashMap<(String, String), tokio::task::JoinHandle<()>>>,
}

impl BinanceTransport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        market_type: MarketType,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        normalizer: Arc<BinanceNormalizer>,
        rest: Arc<BinanceRest>,
        runtime: tokio::runtime::Handle,
        kline_tfs: Vec<String>,
        orderbook_depth: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            market_type,
            bus,
            clock,
            normalizer,
            rest,
            runtime,
            kline_tfs,
            orderbook_depth,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    fn spawn_channel(&self, channel: &str, symbol: &str) {
        let key = (channel.to_string(), symbol.to_string());
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&key) {
            return;
        }

        let handle = match channel {
            "trade" => self.spawn_loop(symbol, |norm, sym, mt| async move {
                binance_ws::run_trade_stream(&sym, mt, &norm).await
            }),
            "ticker" => self.spawn_loop(symbol, |norm, sym, mt| async move {
                binance_ws::run_ticker_stream(&sym, mt, &norm).await
            }),
            "kline" => {
                let tfs = self.kline_tfs.clone();
                let norm = self.normalizer.clone();
                let sym = symbol.to_string();
                let mt = self.market_type;
                self.runtime.spawn(async move {
                    loop {
                        for tf in &tfs {
                            // One connection per tf would be N sockets; the
                            // reference transport runs them sequentially per
                            // reconnect cycle.
                            if let Err(e) =
                                binance_ws::run_kline_stream(&sym, tf, mt, &norm).await
                            {
                                error!(symbol = %sym, tf = %tf, error = %e, "kline stream error");
                            }
                        }
                        tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS))
                            .await;
                    }
                })
            }
            "orderbook" => self.spawn_depth(symbol),
            "oi" => {
                let rest = self.rest.clone();
                let norm = self.normalizer.clone();
                spawn_oi_polling(rest, norm, symbol.to_string(), 30)
            }
            "funding" | "liquidation" if self.market_type == MarketType::Futures => {
                // Funding rides the mark-price stream; liquidations have
                // their own stream.
                if channel == "funding" {
                    self.spawn_loop(symbol, |norm, sym, _| async move {
                        binance_ws::run_mark_price_stream(&sym, &norm).await
                    })
                } else {
                    self.spawn_loop(symbol, |norm, sym, _| async move {
                        binance_ws::run_force_order_stream(&sym, &norm).await
                    })
                }
            }
            other => {
                info!(channel = other, "no binance stream for channel");
                return;
            }
        };
        tasks.insert(key, handle);
    }

    fn spawn_loop<F, Fut>(&self, symbol: &str, run: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(Arc<BinanceNormalizer>, String, MarketType) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let norm = self.normalizer.clone();
        let sym = symbol.to_string();
        let mt = self.market_type;
        self.runtime.spawn(async move {
            loop {
                if let Err(e) = run(norm.clone(), sym.clone(), mt).await {
                    error!(symbol = %sym, error = %e, "stream error, reconnecting");
                }
                tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
            }
        })
    }

    /// Depth stream: REST snapshot first, then the delta stream.
    fn spawn_depth(&self, symbol: &str) -> tokio::task::JoinHandle<()> {
        let norm = self.normalizer.clone();
        let rest = self.rest.clone();
        let sym = symbol.to_string();
        let mt = self.market_type;
        let depth = self.orderbook_depth;
        self.runtime.spawn(async move {
            loop {
                match rest.fetch_depth_snapshot(&sym, depth.max(100), mt).await {
                    Ok(snapshot) => norm.on_depth_snapshot(mt, &sym, &snapshot),
                    Err(e) => {
                        error!(symbol = %sym, error = %e, "depth snapshot fetch failed");
                        tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS))
                            .await;
                        continue;
                    }
                }
                if let Err(e) = binance_ws::run_depth_stream(&sym, mt, &norm).await {
                    error!(symbol = %sym, error = %e, "depth stream error, reconnecting");
                }
                tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
            }
        })
    }

    fn depth_stream_id(&self) -> StreamId {
        StreamId::new("binance", "depth", self.market_type)
    }
}

impl VenueTransport for BinanceTransport {
    fn venue(&self) -> &str {
        "binance"
    }

    fn market_type(&self) -> MarketType {
        self.market_type
    }

    fn connect(&self) -> Result<()> {
        // Streams connect lazily per subscription; nothing to do up front.
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let mut tasks = self.tasks.lock();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
        Ok(())
    }

    fn subscribe(&self, channels: &[String], symbols: &[String]) -> Result<()> {
        for channel in channels {
            for symbol in symbols {
                self.spawn_channel(channel, symbol);
            }
        }
        Ok(())
    }

    fn resync_orderbook(&self, symbol: &str) -> Result<()> {
        let key = ("orderbook".to_string(), symbol.to_string());
        let stream_id = self.depth_stream_id();

        if let Some(handle) = self.tasks.lock().remove(&key) {
            handle.abort();
        }
        self.normalizer.on_stream_disconnected(&stream_id);

        // Downstream book state drops on the disconnect event; the respawned
        // task re-seeds with a fresh snapshot.
        let event = ConnectionEvent {
            meta: EventMeta::new("gateway", self.clock.now_ms()),
            venue: "binance".to_string(),
            market_type: self.market_type,
            stream_id: Some(stream_id),
        };
        self.bus.publish(topics::MARKET_DISCONNECTED, &event);

        let handle = self.spawn_depth(symbol);
        self.tasks.lock().insert(key, handle);
        info!(symbol, "orderbook stream resynced");
        Ok(())
    }
}
