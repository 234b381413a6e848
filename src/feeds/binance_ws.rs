// =============================================================================
// Binance WebSocket feeds - live stream loops driving the normalizer
// =============================================================================
//
// One function per stream kind. Each connects, reads until the stream
// disconnects or errors, and returns so the caller can handle reconnection
// with its own backoff loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::normalizer::BinanceNormalizer;
use crate::types::MarketType;

fn ws_base(market_type: MarketType) -> &'static str {
    match market_type {
        MarketType::Futures => "wss://fstream.binance.com/ws",
        _ => "wss://stream.binance.com:9443/ws",
    }
}

/// Connect to one raw stream and feed every text frame to the normalizer.
async fn run_stream(
    url: &str,
    market_type: MarketType,
    normalizer: &Arc<BinanceNormalizer>,
) -> Result<()> {
    info!(url = %url, "connecting to Binance WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    info!(url = %url, "Binance WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match serde_json::from_str::<serde_json::Value>(&text) {
                        Ok(value) => normalizer.on_ws_message(market_type, &value),
                        Err(e) => {
                            warn!(error = %e, "failed to decode Binance message");
                        }
                    }
                }
                // Ping/Pong/Binary/Close frames are handled by tungstenite.
            }
            Some(Err(e)) => {
                error!(url = %url, error = %e, "Binance WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(url = %url, "Binance WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

pub async fn run_trade_stream(
    symbol: &str,
    market_type: MarketType,
    normalizer: &Arc<BinanceNormalizer>,
) -> Result<()> {
    let url = format!("{}/{}@aggTrade", ws_base(market_type), symbol.to_lowercase());
    run_stream(&url, market_type, normalizer).await
}

pub async fn run_kline_stream(
    symbol: &str,
    tf: &str,
    market_type: MarketType,
    normalizer: &Arc<BinanceNormalizer>,
) -> Result<()> {
    let url = format!(
        "{}/{}@kline_{tf}",
        ws_base(market_type),
        symbol.to_lowercase()
    );
    run_stream(&url, market_type, normalizer).await
}

pub async fn run_ticker_stream(
    symbol: &str,
    market_type: MarketType,
    normalizer: &Arc<BinanceNormalizer>,
) -> Result<()> {
    let url = format!("{}/{}@ticker", ws_base(market_type), symbol.to_lowercase());
    run_stream(&url, market_type, normalizer).await
}

pub async fn run_depth_stream(
    symbol: &str,
    market_type: MarketType,
    normalizer: &Arc<BinanceNormalizer>,
) -> Result<()> {
    let url = format!(
        "{}/{}@depth@100ms",
        ws_base(market_type),
        symbol.to_lowercase()
    );
    run_stream(&url, market_type, normalizer).await
}

/// Futures mark price stream; also carries index price and funding rate.
pub async fn run_mark_price_stream(
    symbol: &str,
    normalizer: &Arc<BinanceNormalizer>,
) -> Result<()> {
    let url = format!(
        "{}/{}@markPrice@1s",
        ws_base(MarketType::Futures),
        symbol.to_lowercase()
    );
    run_stream(&url, MarketType::Futures, normalizer).await
}

/// Futures forced-liquidation order stream.
pub async fn run_force_order_stream(
    symbol: &str,
    normalizer: &Arc<BinanceNormalizer>,
) -> Result<()> {
    let url = format!(
        "{}/{}@forceOrder",
        ws_base(MarketType::Futures),
        symbol.to_lowercase()
    );
    run_stream(&url, MarketType::Futures, normalizer).await
}
