// =============================================================================
// Event payloads - normalized, aggregated, analytics, lifecycle, quality
// =============================================================================
//
// Every payload carries an `EventMeta` envelope. Normalized market events
// additionally carry `symbol`, `market_type` and `stream_id`; the normalizer
// guarantees `meta.stream_id == payload.stream_id` and a known market type
// before anything reaches the bus.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::meta::{EventMeta, StreamId, TsMillis};
use crate::types::{Block, MarketType, Side};

// =============================================================================
// Normalized market events
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub stream_id: StreamId,
    pub last_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_24h: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub stream_id: StreamId,
    /// Timeframe label, e.g. `1m`, `5m`, `1h`.
    pub tf: String,
    pub start_ts: TsMillis,
    pub end_ts: TsMillis,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_volume: Option<f64>,
    /// True once the candle is final. Feature engines only consume closed
    /// candles.
    pub closed: bool,
    /// Set on candles published by the REST bootstrap rather than live flow.
    #[serde(default)]
    pub bootstrap: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub stream_id: StreamId,
    /// Venue trade time; the authoritative time for replay of this topic.
    pub trade_ts: TsMillis,
    pub price: f64,
    pub size: f64,
    pub side: Side,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<String>,
}

/// One price level of an L2 book side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookL2Snapshot {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub stream_id: StreamId,
    pub exchange_ts: TsMillis,
    pub update_id: u64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookL2Delta {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub stream_id: StreamId,
    pub exchange_ts: TsMillis,
    /// First update id covered by this delta (venue-dependent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_update_id: Option<u64>,
    pub update_id: u64,
    /// Previous update id when the venue provides explicit chaining.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_update_id: Option<u64>,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

/// Unit an open-interest or liquidation size is denominated in. Values in
/// different units are never fused without an explicit conversion basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueUnit {
    Contracts,
    Base,
    Usd,
}

impl std::fmt::Display for ValueUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Contracts => write!(f, "contracts"),
            Self::Base => write!(f, "base"),
            Self::Usd => write!(f, "usd"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenInterestEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub stream_id: StreamId,
    pub open_interest: f64,
    pub unit: ValueUnit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRateEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub stream_id: StreamId,
    /// Raw funding rate as a decimal (0.0001 = 0.01%).
    pub rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_funding_ts: Option<TsMillis>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub stream_id: StreamId,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub unit: ValueUnit,
}

/// Best-of-book summary emitted by the orderbook engine after every applied
/// snapshot or delta. Only emitted while the book is in the READY phase, so
/// consumers are structurally prevented from reading a torn book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookTopEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub stream_id: StreamId,
    pub update_id: u64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub depth_levels: usize,
    /// Total size across the top `depth_levels` bid levels.
    pub depth_bid: f64,
    /// Total size across the top `depth_levels` ask levels.
    pub depth_ask: f64,
}

/// Price reference kind used by the canonical price aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceType {
    Index,
    Mark,
    Last,
}

impl std::fmt::Display for PriceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index => write!(f, "index"),
            Self::Mark => write!(f, "mark"),
            Self::Last => write!(f, "last"),
        }
    }
}

/// A normalized index or mark price point from a futures venue, published on
/// `market:price_index`. `last` prices flow in via `market:ticker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePointEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub stream_id: StreamId,
    pub price: f64,
    pub price_type: PriceType,
}

/// A decoded venue message before normalization. Raw events carry only
/// transport/decoding fields and are journaled separately from normalized
/// events; they are never fused with them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawVenueEvent {
    pub meta: EventMeta,
    pub venue: String,
    pub market_type: MarketType,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub payload: serde_json::Value,
}

// =============================================================================
// Aggregated events
// =============================================================================

/// Fusion metadata carried by every aggregated event.
///
/// `sources_used` is sorted and always equals the key set of
/// `venue_breakdown` (both derive from the same BTreeMap).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FusionInfo {
    pub sources_used: Vec<String>,
    pub venue_breakdown: BTreeMap<String, f64>,
    pub weights_used: BTreeMap<String, f64>,
    pub fresh_sources_count: usize,
    pub stale_sources_dropped: usize,
    pub mismatch_detected: bool,
    pub confidence_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_explain: Option<String>,
}

impl FusionInfo {
    /// Build fusion info from a per-source breakdown, keeping `sources_used`
    /// consistent with the breakdown's key set.
    pub fn from_breakdown(
        venue_breakdown: BTreeMap<String, f64>,
        weights_used: BTreeMap<String, f64>,
        stale_sources_dropped: usize,
    ) -> Self {
        let sources_used: Vec<String> = venue_breakdown.keys().cloned().collect();
        let fresh_sources_count = sources_used.len();
        Self {
            sources_used,
            venue_breakdown,
            weights_used,
            fresh_sources_count,
            stale_sources_dropped,
            mismatch_detected: false,
            confidence_score: 1.0,
            confidence_explain: None,
        }
    }
}

/// Why the canonical price fell back from the preferred price type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceFallbackReason {
    NoIndex,
    IndexStale,
    NoMark,
    MarkStale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalPriceEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub price: f64,
    pub price_type_used: PriceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<PriceFallbackReason>,
    #[serde(flatten)]
    pub fusion: FusionInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CvdAggEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub bucket_end_ts: TsMillis,
    /// Running cumulative volume delta after fusion.
    pub cvd: f64,
    /// Signed delta contributed by the closing bucket.
    pub bucket_delta: f64,
    #[serde(flatten)]
    pub fusion: FusionInfo,
}

/// A source excluded from fusion, with the recorded reason
/// (e.g. `NON_COMPARABLE(contracts)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressedSource {
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OiAggEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub open_interest: f64,
    pub unit: ValueUnit,
    /// Baseline strategy used for mismatch detection (`median`, `bybit`, ...).
    pub baseline: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suppressed: Vec<SuppressedSource>,
    #[serde(flatten)]
    pub fusion: FusionInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingAggEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub rate: f64,
    #[serde(flatten)]
    pub fusion: FusionInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationsAggEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub bucket_end_ts: TsMillis,
    pub count: u64,
    pub notional: f64,
    pub buy_count: u64,
    pub sell_count: u64,
    pub buy_notional: f64,
    pub sell_notional: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suppressed: Vec<SuppressedSource>,
    #[serde(flatten)]
    pub fusion: FusionInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityAggEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub best_bid: f64,
    pub best_ask: f64,
    pub spread: f64,
    pub depth_levels: usize,
    pub depth_bid: f64,
    pub depth_ask: f64,
    /// `(depth_bid - depth_ask) / (depth_bid + depth_ask)`, 0 when empty.
    pub imbalance: f64,
    #[serde(flatten)]
    pub fusion: FusionInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeAggEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub bucket_end_ts: TsMillis,
    pub volume: f64,
    pub quote_volume: f64,
    #[serde(flatten)]
    pub fusion: FusionInfo,
}

// =============================================================================
// Analytics events
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerFeaturesEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub price: f64,
    pub sample_count: usize,
    pub features_ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_1: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sma: Option<f64>,
    pub sma_period: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volatility: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub momentum: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineFeaturesEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub tf: String,
    pub close: f64,
    pub warmed_up: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema_fast: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema_slow: Option<f64>,
    /// Slope of the slow EMA over the last step (per-candle difference).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema_slow_slope: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsi: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atr: Option<f64>,
    /// ATR as a fraction of the close (volatility proxy for regime rules).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atr_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsReadyEvent {
    pub meta: EventMeta,
    pub symbol: String,
    /// `tickerWarmup`, `klineWarmup` or `macroWarmup`.
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tf: Option<String>,
    /// Sorted list of ready timeframes, set for `macroWarmup`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_tfs: Option<Vec<String>>,
}

/// Coarse volatility regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Calm,
    Volatile,
    Unknown,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Calm => write!(f, "calm"),
            Self::Volatile => write!(f, "volatile"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Directional regime classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegimeV2 {
    CalmRange,
    TrendBull,
    TrendBear,
    Storm,
}

impl std::fmt::Display for RegimeV2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CalmRange => write!(f, "calm_range"),
            Self::TrendBull => write!(f, "trend_bull"),
            Self::TrendBear => write!(f, "trend_bear"),
            Self::Storm => write!(f, "storm"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketContextEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub tf: String,
    pub regime: Regime,
    pub regime_v2: RegimeV2,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atr_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema_fast: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema_slow: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeEvent {
    pub meta: EventMeta,
    pub symbol: String,
    /// Macro regime agreed across all configured macro timeframes.
    pub regime: Regime,
    pub regime_v2: RegimeV2,
    pub tfs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeExplainEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub regime_v2: RegimeV2,
    /// Per-timeframe classification that produced the macro verdict.
    pub per_tf: BTreeMap<String, RegimeV2>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub cvd: f64,
    pub bucket_delta: f64,
    pub bucket_end_ts: TsMillis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquiditySnapshotEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub spread: f64,
    pub imbalance: f64,
    pub depth_bid: f64,
    pub depth_ask: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketViewEvent {
    pub meta: EventMeta,
    pub symbol: String,
    /// Micro view: latest canonical price, flow and liquidity readings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cvd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imbalance: Option<f64>,
    /// Macro view: regime verdict across the configured macro timeframes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regime: Option<Regime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regime_v2: Option<RegimeV2>,
}

// =============================================================================
// Readiness / status
// =============================================================================

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BlockConfidence {
    pub price: f64,
    pub flow: f64,
    pub liquidity: f64,
    pub derivatives: f64,
}

impl BlockConfidence {
    pub fn get(&self, block: Block) -> f64 {
        match block {
            Block::Price => self.price,
            Block::Flow => self.flow,
            Block::Liquidity => self.liquidity,
            Block::Derivatives => self.derivatives,
        }
    }

    pub fn set(&mut self, block: Block, value: f64) {
        match block {
            Block::Price => self.price = value,
            Block::Flow => self.flow = value,
            Block::Liquidity => self.liquidity = value,
            Block::Derivatives => self.derivatives = value,
        }
    }

    pub fn min(&self) -> f64 {
        self.price
            .min(self.flow)
            .min(self.liquidity)
            .min(self.derivatives)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SourceCounts {
    pub agg: usize,
    pub raw: usize,
}

/// The uniform gating signal published on `system:market_data_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataStatus {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub overall_confidence: f64,
    pub block_confidence: BlockConfidence,
    pub degraded: bool,
    pub degraded_reasons: Vec<String>,
    pub warnings: Vec<String>,
    pub warming_up: bool,
    pub warming_progress: f64,
    pub warming_window_ms: i64,
    pub active_sources: SourceCounts,
    pub expected_sources: SourceCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_bucket_ts: Option<TsMillis>,
}

// =============================================================================
// Lifecycle / control events
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub meta: EventMeta,
    pub venue: String,
    pub market_type: MarketType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectRequest {
    pub meta: EventMeta,
    pub venue: String,
    pub market_type: MarketType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub meta: EventMeta,
    pub venue: String,
    pub market_type: MarketType,
    pub channels: Vec<String>,
    pub symbols: Vec<String>,
}

/// `market:connected` / `market:disconnected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub meta: EventMeta,
    pub venue: String,
    pub market_type: MarketType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketErrorEvent {
    pub meta: EventMeta,
    pub venue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_type: Option<MarketType>,
    /// `connect`, `subscribe`, `read`, ...
    pub phase: String,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResyncReason {
    Gap,
    Disconnect,
    Manual,
}

impl std::fmt::Display for ResyncReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gap => write!(f, "gap"),
            Self::Disconnect => write!(f, "disconnect"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResyncRequest {
    pub meta: EventMeta,
    pub venue: String,
    pub symbol: String,
    pub stream_id: StreamId,
    pub reason: ResyncReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sequence: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineBootstrapRequest {
    pub meta: EventMeta,
    pub venue: String,
    pub market_type: MarketType,
    pub symbols: Vec<String>,
    pub tfs: Vec<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineBootstrapCompleted {
    pub meta: EventMeta,
    pub venue: String,
    pub market_type: MarketType,
    pub symbols: Vec<String>,
    pub klines_published: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "command")]
pub enum ControlCommand {
    Pause,
    Resume,
    SetMode { mode: crate::types::PipelineMode },
    Status,
    Shutdown,
}

impl std::fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pause => write!(f, "pause"),
            Self::Resume => write!(f, "resume"),
            Self::SetMode { mode } => write!(f, "set_mode({mode})"),
            Self::Status => write!(f, "status"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlCommandEvent {
    pub meta: EventMeta,
    #[serde(flatten)]
    pub command: ControlCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// =============================================================================
// State snapshot / recovery events
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequested {
    pub meta: EventMeta,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotWritten {
    pub meta: EventMeta,
    pub path: String,
    pub components: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRequested {
    pub meta: EventMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryLoaded {
    pub meta: EventMeta,
    pub path: String,
    pub components: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryFailed {
    pub meta: EventMeta,
    pub error: String,
}

// =============================================================================
// Quality / storage / replay events
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapDetected {
    pub meta: EventMeta,
    pub stream_id: StreamId,
    pub topic: String,
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tf: Option<String>,
    pub expected: u64,
    pub observed: u64,
    pub missing: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutOfOrderDetected {
    pub meta: EventMeta,
    pub stream_id: StreamId,
    pub topic: String,
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tf: Option<String>,
    pub prev_ts: TsMillis,
    pub ts: TsMillis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceAnomaly {
    pub meta: EventMeta,
    pub stream_id: StreamId,
    pub topic: String,
    pub symbol: String,
    pub expected: u64,
    pub observed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateDetected {
    pub meta: EventMeta,
    pub stream_id: StreamId,
    pub topic: String,
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    pub ts: TsMillis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySpike {
    pub meta: EventMeta,
    pub stream_id: StreamId,
    pub topic: String,
    pub symbol: String,
    pub latency_ms: i64,
    pub threshold_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStale {
    pub meta: EventMeta,
    pub source: String,
    pub topic: String,
    pub symbol: String,
    pub age_ms: i64,
    pub threshold_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDegraded {
    pub meta: EventMeta,
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecovered {
    pub meta: EventMeta,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MismatchEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub topic: String,
    pub baseline: String,
    pub values: BTreeMap<String, f64>,
    pub deviation_pct: f64,
    /// True when the mismatch check itself was suppressed (e.g. no comparable
    /// unit across sources) rather than evaluated.
    #[serde(default)]
    pub suppressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppression_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceEvent {
    pub meta: EventMeta,
    pub symbol: String,
    pub market_type: MarketType,
    pub block: Block,
    pub score: f64,
    pub explain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageWriteFailed {
    pub meta: EventMeta,
    pub path: String,
    pub error: String,
    pub retry_in_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayWarning {
    pub meta: EventMeta,
    pub file: String,
    pub line: u64,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayFinished {
    pub meta: EventMeta,
    pub per_topic: BTreeMap<String, u64>,
    pub records_emitted: u64,
    pub records_skipped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayErrorEvent {
    pub meta: EventMeta,
    pub error: String,
}
