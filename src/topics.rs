// =============================================================================
// Topic registry - authoritative topic names, typed at compile time
// =============================================================================
//
// Every topic the pipeline publishes or subscribes to is declared here once,
// bound to its payload type. Publishing the wrong payload on a topic is a
// compile error, not a runtime surprise.

use crate::bus::Topic;
use crate::events::*;
use crate::types::ControlState;

// ── Normalized market data ───────────────────────────────────────────────────

pub const MARKET_TICKER: Topic<TickerEvent> = Topic::new("market:ticker");
pub const MARKET_KLINE: Topic<KlineEvent> = Topic::new("market:kline");
pub const MARKET_TRADE: Topic<TradeEvent> = Topic::new("market:trade");
pub const MARKET_ORDERBOOK_L2_SNAPSHOT: Topic<OrderbookL2Snapshot> =
    Topic::new("market:orderbook_l2_snapshot");
pub const MARKET_ORDERBOOK_L2_DELTA: Topic<OrderbookL2Delta> =
    Topic::new("market:orderbook_l2_delta");
pub const MARKET_OI: Topic<OpenInterestEvent> = Topic::new("market:oi");
pub const MARKET_FUNDING: Topic<FundingRateEvent> = Topic::new("market:funding");
pub const MARKET_LIQUIDATION: Topic<LiquidationEvent> = Topic::new("market:liquidation");
pub const MARKET_ORDERBOOK_TOP: Topic<BookTopEvent> = Topic::new("market:orderbook_top");

// ── Raw venue messages (transport/decoding fields only) ──────────────────────

pub const MARKET_TRADE_RAW: Topic<RawVenueEvent> = Topic::new("market:trade_raw");
pub const MARKET_ORDERBOOK_SNAPSHOT_RAW: Topic<RawVenueEvent> =
    Topic::new("market:orderbook_snapshot_raw");
pub const MARKET_ORDERBOOK_DELTA_RAW: Topic<RawVenueEvent> =
    Topic::new("market:orderbook_delta_raw");
pub const MARKET_CANDLE_RAW: Topic<RawVenueEvent> = Topic::new("market:candle_raw");
pub const MARKET_MARK_PRICE_RAW: Topic<RawVenueEvent> = Topic::new("market:mark_price_raw");
pub const MARKET_INDEX_PRICE_RAW: Topic<RawVenueEvent> = Topic::new("market:index_price_raw");
pub const MARKET_FUNDING_RAW: Topic<RawVenueEvent> = Topic::new("market:funding_raw");
pub const MARKET_OPEN_INTEREST_RAW: Topic<RawVenueEvent> =
    Topic::new("market:open_interest_raw");
pub const MARKET_LIQUIDATION_RAW: Topic<RawVenueEvent> = Topic::new("market:liquidation_raw");
pub const MARKET_WS_EVENT_RAW: Topic<RawVenueEvent> = Topic::new("market:ws_event_raw");

// ── Aggregated / canonical (produced internally, never replayed as inputs) ───

pub const MARKET_PRICE_INDEX: Topic<PricePointEvent> = Topic::new("market:price_index");
pub const MARKET_PRICE_CANONICAL: Topic<CanonicalPriceEvent> =
    Topic::new("market:price_canonical");
pub const MARKET_OI_AGG: Topic<OiAggEvent> = Topic::new("market:oi_agg");
pub const MARKET_FUNDING_AGG: Topic<FundingAggEvent> = Topic::new("market:funding_agg");
pub const MARKET_LIQUIDATIONS_AGG: Topic<LiquidationsAggEvent> =
    Topic::new("market:liquidations_agg");
pub const MARKET_VOLUME_AGG: Topic<VolumeAggEvent> = Topic::new("market:volume_agg");
pub const MARKET_CVD_SPOT: Topic<CvdAggEvent> = Topic::new("market:cvd_spot");
pub const MARKET_CVD_FUTURES: Topic<CvdAggEvent> = Topic::new("market:cvd_futures");
pub const MARKET_CVD_SPOT_AGG: Topic<CvdAggEvent> = Topic::new("market:cvd_spot_agg");
pub const MARKET_CVD_FUTURES_AGG: Topic<CvdAggEvent> = Topic::new("market:cvd_futures_agg");
pub const MARKET_CVD_AGG: Topic<CvdAggEvent> = Topic::new("market:cvd_agg");
pub const MARKET_LIQUIDITY_AGG: Topic<LiquidityAggEvent> = Topic::new("market:liquidity_agg");

// ── Analytics / context ──────────────────────────────────────────────────────

pub const ANALYTICS_FEATURES: Topic<TickerFeaturesEvent> = Topic::new("analytics:features");
pub const ANALYTICS_KLINE_FEATURES: Topic<KlineFeaturesEvent> =
    Topic::new("analytics:kline_features");
pub const ANALYTICS_CONTEXT: Topic<MarketContextEvent> = Topic::new("analytics:context");
pub const ANALYTICS_READY: Topic<AnalyticsReadyEvent> = Topic::new("analytics:ready");
pub const ANALYTICS_FLOW: Topic<FlowEvent> = Topic::new("analytics:flow");
pub const ANALYTICS_LIQUIDITY: Topic<LiquiditySnapshotEvent> = Topic::new("analytics:liquidity");
pub const ANALYTICS_MARKET_VIEW: Topic<MarketViewEvent> = Topic::new("analytics:market_view");
pub const ANALYTICS_REGIME: Topic<RegimeEvent> = Topic::new("analytics:regime");
pub const ANALYTICS_REGIME_EXPLAIN: Topic<RegimeExplainEvent> =
    Topic::new("analytics:regime_explain");

// ── Lifecycle / control ──────────────────────────────────────────────────────

pub const MARKET_CONNECT: Topic<ConnectRequest> = Topic::new("market:connect");
pub const MARKET_DISCONNECT: Topic<DisconnectRequest> = Topic::new("market:disconnect");
pub const MARKET_SUBSCRIBE: Topic<SubscribeRequest> = Topic::new("market:subscribe");
pub const MARKET_CONNECTED: Topic<ConnectionEvent> = Topic::new("market:connected");
pub const MARKET_DISCONNECTED: Topic<ConnectionEvent> = Topic::new("market:disconnected");
pub const MARKET_ERROR: Topic<MarketErrorEvent> = Topic::new("market:error");
pub const MARKET_RESYNC_REQUESTED: Topic<ResyncRequest> = Topic::new("market:resync_requested");
pub const MARKET_KLINE_BOOTSTRAP_REQUESTED: Topic<KlineBootstrapRequest> =
    Topic::new("market:kline_bootstrap_requested");
pub const MARKET_KLINE_BOOTSTRAP_COMPLETED: Topic<KlineBootstrapCompleted> =
    Topic::new("market:kline_bootstrap_completed");
pub const CONTROL_COMMAND: Topic<ControlCommandEvent> = Topic::new("control:command");
pub const CONTROL_STATE: Topic<ControlState> = Topic::new("control:state");

// ── State snapshot / recovery ────────────────────────────────────────────────

pub const STATE_SNAPSHOT_REQUESTED: Topic<SnapshotRequested> =
    Topic::new("state:snapshot_requested");
pub const STATE_SNAPSHOT_WRITTEN: Topic<SnapshotWritten> = Topic::new("state:snapshot_written");
pub const STATE_RECOVERY_REQUESTED: Topic<RecoveryRequested> =
    Topic::new("state:recovery_requested");
pub const STATE_RECOVERY_LOADED: Topic<RecoveryLoaded> = Topic::new("state:recovery_loaded");
pub const STATE_RECOVERY_FAILED: Topic<RecoveryFailed> = Topic::new("state:recovery_failed");

// ── Data quality / storage / replay / status ─────────────────────────────────

pub const DATA_GAP_DETECTED: Topic<GapDetected> = Topic::new("data:gapDetected");
pub const DATA_OUT_OF_ORDER: Topic<OutOfOrderDetected> = Topic::new("data:outOfOrder");
pub const DATA_TIME_OUT_OF_ORDER: Topic<OutOfOrderDetected> =
    Topic::new("data:time_out_of_order");
pub const DATA_SEQUENCE_ANOMALY: Topic<SequenceAnomaly> =
    Topic::new("data:sequence_gap_or_out_of_order");
pub const DATA_LATENCY_SPIKE: Topic<LatencySpike> = Topic::new("data:latencySpike");
pub const DATA_DUPLICATE_DETECTED: Topic<DuplicateDetected> =
    Topic::new("data:duplicateDetected");
pub const DATA_SOURCE_DEGRADED: Topic<SourceDegraded> = Topic::new("data:sourceDegraded");
pub const DATA_SOURCE_RECOVERED: Topic<SourceRecovered> = Topic::new("data:sourceRecovered");
pub const DATA_STALE: Topic<SourceStale> = Topic::new("data:stale");
pub const DATA_MISMATCH: Topic<MismatchEvent> = Topic::new("data:mismatch");
pub const DATA_CONFIDENCE: Topic<ConfidenceEvent> = Topic::new("data:confidence");
pub const SYSTEM_MARKET_DATA_STATUS: Topic<MarketDataStatus> =
    Topic::new("system:market_data_status");
pub const STORAGE_WRITE_FAILED: Topic<StorageWriteFailed> = Topic::new("storage:writeFailed");
pub const REPLAY_WARNING: Topic<ReplayWarning> = Topic::new("replay:warning");
pub const REPLAY_FINISHED: Topic<ReplayFinished> = Topic::new("replay:finished");
pub const REPLAY_ERROR: Topic<ReplayErrorEvent> = Topic::new("replay:error");

/// True for topics whose payloads are produced internally by aggregators.
/// These are never written by the raw journal sink and never replayed as
/// inputs.
pub fn is_aggregated_topic(name: &str) -> bool {
    name.ends_with("_agg") || name == MARKET_PRICE_CANONICAL.name()
}

/// True for raw venue topics (suffix `_raw`). Raw events are journaled
/// separately and never fused with normalized or aggregated storage.
pub fn is_raw_topic(name: &str) -> bool {
    name.ends_with("_raw")
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregated_topic_classification() {
        assert!(is_aggregated_topic(MARKET_OI_AGG.name()));
        assert!(is_aggregated_topic(MARKET_CVD_SPOT_AGG.name()));
        assert!(is_aggregated_topic(MARKET_PRICE_CANONICAL.name()));
        assert!(!is_aggregated_topic(MARKET_TICKER.name()));
        assert!(!is_aggregated_topic(MARKET_TRADE_RAW.name()));
    }

    #[test]
    fn raw_topic_classification() {
        assert!(is_raw_topic(MARKET_TRADE_RAW.name()));
        assert!(is_raw_topic(MARKET_WS_EVENT_RAW.name()));
        assert!(!is_raw_topic(MARKET_TRADE.name()));
        assert!(!is_raw_topic(MARKET_OI_AGG.name()));
    }

    #[test]
    fn topic_names_match_wire_convention() {
        assert_eq!(MARKET_TICKER.name(), "market:ticker");
        assert_eq!(DATA_GAP_DETECTED.name(), "data:gapDetected");
        assert_eq!(SYSTEM_MARKET_DATA_STATUS.name(), "system:market_data_status");
        assert_eq!(STORAGE_WRITE_FAILED.name(), "storage:writeFailed");
    }
}
