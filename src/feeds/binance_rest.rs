// =============================================================================
// Binance REST feeds - kline bootstrap and derivatives polling
// =============================================================================
//
// REST complements the WebSocket streams in two places:
//
//   - kline bootstrap: on `market:kline_bootstrap_requested`, fetch the last
//     N closed candles per (symbol, tf) so feature engines warm up without
//     waiting for live flow
//   - open interest polling: futures OI has no WS stream on all venues, so a
//     periodic fetch feeds the normalizer

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::events::{KlineBootstrapCompleted, KlineBootstrapRequest};
use crate::meta::{Clock, EventMeta};
use crate::normalizer::BinanceNormalizer;
use crate::topics;
use crate::types::MarketType;

fn rest_base(market_type: MarketType) -> &'static str {
    match market_type {
        MarketType::Futures => "https://fapi.binance.com",
        _ => "https://api.binance.com",
    }
}

pub struct BinanceRest {
    client: reqwest::Client,
}

impl BinanceRest {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client for BinanceRest"),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("parse response from {url}"))?;

        if !status.is_success() {
            anyhow::bail!("{url} returned {status}: {body}");
        }
        Ok(body)
    }

    /// Fetch the last `limit` klines as raw array rows.
    pub async fn fetch_klines(
        &self,
        symbol: &str,
        tf: &str,
        limit: usize,
        market_type: MarketType,
    ) -> Result<Vec<Value>> {
        let path = match market_type {
            MarketType::Futures => "/fapi/v1/klines",
            _ => "/api/v3/klines",
        };
        let url = format!(
            "{}{}?symbol={}&interval={}&limit={}",
            rest_base(market_type),
            path,
            symbol,
            tf,
            limit
        );
        let body = self.get_json(&url).await?;
        body.as_array()
            .cloned()
            .context("kline response is not an array")
    }

    /// Fetch an orderbook depth snapshot.
    pub async fn fetch_depth_snapshot(
        &self,
        symbol: &str,
        depth: usize,
        market_type: MarketType,
    ) -> Result<Value> {
        let path = match market_type {
            MarketType::Futures => "/fapi/v1/depth",
            _ => "/api/v3/depth",
        };
        let url = format!(
            "{}{}?symbol={}&limit={}",
            rest_base(market_type),
            path,
            symbol,
            depth
        );
        self.get_json(&url).await
    }

    /// Fetch the current futures open interest.
    pub async fn fetch_open_interest(&self, symbol: &str) -> Result<Value> {
        let url = format!(
            "{}/fapi/v1/openInterest?symbol={}",
            rest_base(MarketType::Futures),
            symbol
        );
        self.get_json(&url).await
    }
}

impl Default for BinanceRest {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Kline bootstrapper
// =============================================================================

/// Answers `market:kline_bootstrap_requested` by fetching historical klines
/// and replying with `market:kline_bootstrap_completed`.
pub struct KlineBootstrapper {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    rest: Arc<BinanceRest>,
    normalizer: Arc<BinanceNormalizer>,
}

impl KlineBootstrapper {
    pub fn new(
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        rest: Arc<BinanceRest>,
        normalizer: Arc<BinanceNormalizer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            clock,
            rest,
            normalizer,
        })
    }

    pub fn start(self: &Arc<Self>) {
        let bootstrapper = self.clone();
        self.bus
            .subscribe(topics::MARKET_KLINE_BOOTSTRAP_REQUESTED, move |req| {
                if req.venue != "binance" {
                    return Ok(());
                }
                let bootstrapper = bootstrapper.clone();
                let req = req.clone();
                tokio::spawn(async move {
                    bootstrapper.run(&req).await;
                });
                Ok(())
            });
    }

    async fn run(&self, req: &KlineBootstrapRequest) {
        let mut published = 0u64;
        for symbol in &req.symbols {
            for tf in &req.tfs {
                match self
                    .rest
                    .fetch_klines(symbol, tf, req.limit, req.market_type)
                    .await
                {
                    Ok(rows) => {
                        for row in &rows {
                            self.normalizer
                                .on_rest_kline(req.market_type, symbol, tf, row);
                            published += 1;
                        }
                        info!(symbol, tf, count = rows.len(), "kline bootstrap fetched");
                    }
                    Err(e) => {
                        warn!(symbol, tf, error = %e, "kline bootstrap fetch failed");
                    }
                }
            }
        }

        let completed = KlineBootstrapCompleted {
            meta: EventMeta::new("bootstrap", self.clock.now_ms()),
            venue: req.venue.clone(),
            market_type: req.market_type,
            symbols: req.symbols.clone(),
            klines_published: published,
        };
        self.bus
            .publish(topics::MARKET_KLINE_BOOTSTRAP_COMPLETED, &completed);
    }
}

/// Spawn the periodic futures OI polling loop for one symbol.
pub fn spawn_oi_polling(
    rest: Arc<BinanceRest>,
    normalizer: Arc<BinanceNormalizer>,
    symbol: String,
    interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match rest.fetch_open_interest(&symbol).await {
                Ok(body) => normalizer.on_open_interest(MarketType::Futures, &body),
                Err(e) => warn!(symbol = %symbol, error = %e, "open interest poll failed"),
            }
        }
    })
}
