// =============================================================================
// Market Data Readiness - warmup, degradation and the status signal
// =============================================================================
//
// Joins the source registry, the confidence engine and the staleness policy
// into the uniform `system:market_data_status` signal that downstream gating
// consumes. The status is emitted on every flow bucket close and on any
// degraded-state change.
//
// The target market type is pinned at seed (config, else the first observed
// event); events of the other market type are ignored.
//
// Bucket alignment: bucket labels are `floor(ts / bucket_ms) * bucket_ms`;
// membership for price-vs-flow matching is inclusive of the bucket end, so a
// price stamped exactly on the boundary belongs to the bucket closing there.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::bus::EventBus;
use crate::config::PipelineConfig;
use crate::confidence::{BlockInputs, ConfidenceEngine};
use crate::events::{
    BlockConfidence, ConfidenceEvent, ConnectionEvent, FlowEvent, MarketDataStatus,
    SourceCounts, SourceDegraded, SourceRecovered, SourceStale,
};
use crate::meta::{Clock, EventMeta, TsMillis};
use crate::quality::resolve_staleness;
use crate::registry::{SourceKind, SourceRegistry};
use crate::topics;
use crate::types::{Block, MarketType};

/// Flow block confidence below this adds FLOW_LOW_CONF to the degraded
/// reasons.
const FLOW_LOW_CONF_THRESHOLD: f64 = 0.5;

/// Bucket label for a timestamp.
pub fn bucket_label(ts: TsMillis, bucket_ms: i64) -> TsMillis {
    if bucket_ms <= 0 {
        return ts;
    }
    TsMillis(ts.0.div_euclid(bucket_ms) * bucket_ms)
}

/// End-inclusive bucket membership used for price-vs-flow matching.
pub fn in_bucket_inclusive(ts: TsMillis, bucket_start: TsMillis, bucket_end: TsMillis) -> bool {
    ts >= bucket_start && ts <= bucket_end
}

/// Which readiness block a topic's quality events feed.
pub fn block_for_topic(topic: &str) -> Option<Block> {
    match topic {
        "market:ticker" | "market:price_index" | "market:price_canonical" => Some(Block::Price),
        "market:trade" | "market:cvd_agg" | "market:cvd_spot" | "market:cvd_futures" => {
            Some(Block::Flow)
        }
        "market:orderbook_l2_snapshot" | "market:orderbook_l2_delta" | "market:orderbook_top"
        | "market:liquidity_agg" => Some(Block::Liquidity),
        "market:oi" | "market:funding" | "market:liquidation" | "market:oi_agg"
        | "market:funding_agg" | "market:liquidations_agg" => Some(Block::Derivatives),
        _ => None,
    }
}

#[derive(Debug)]
struct SymbolReadiness {
    market_type: MarketType,
    seeded_at: TsMillis,
    last_price_ts: Option<TsMillis>,
    price_samples: usize,
    last_disconnect: Option<TsMillis>,
    price_seen_since_reconnect: bool,
    last_degraded: Option<bool>,
    last_bucket_ts: Option<TsMillis>,
    /// Expected sources currently reported as degraded (missing or stale).
    degraded_sources: std::collections::BTreeSet<String>,
}

impl SymbolReadiness {
    fn new(market_type: MarketType, now: TsMillis) -> Self {
        Self {
            market_type,
            seeded_at: now,
            last_price_ts: None,
            price_samples: 0,
            last_disconnect: None,
            price_seen_since_reconnect: true,
            last_degraded: None,
            last_bucket_ts: None,
            degraded_sources: std::collections::BTreeSet::new(),
        }
    }
}

pub struct MarketDataReadiness {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
    registry: Arc<SourceRegistry>,
    engine: Mutex<ConfidenceEngine>,
    state: Mutex<HashMap<String, SymbolReadiness>>,
}

impl MarketDataReadiness {
    pub fn new(
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
        registry: Arc<SourceRegistry>,
    ) -> Arc<Self> {
        let engine = ConfidenceEngine::new(config.confidence.clone());
        Arc::new(Self {
            bus,
            clock,
            config,
            registry,
            engine: Mutex::new(engine),
            state: Mutex::new(HashMap::new()),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let r = self.clone();
        self.bus.subscribe(topics::MARKET_TICKER, move |e| {
            r.mark(&e.symbol, e.market_type, Block::Price, e.stream_id.as_str(), SourceKind::Raw);
            Ok(())
        });

        let r = self.clone();
        self.bus.subscribe(topics::MARKET_PRICE_INDEX, move |e| {
            r.mark(&e.symbol, e.market_type, Block::Price, e.stream_id.as_str(), SourceKind::Raw);
            Ok(())
        });

        let r = self.clone();
        self.bus.subscribe(topics::MARKET_PRICE_CANONICAL, move |e| {
            r.on_canonical_price(e);
            Ok(())
        });

        let r = self.clone();
        self.bus.subscribe(topics::MARKET_TRADE, move |e| {
            r.mark(&e.symbol, e.market_type, Block::Flow, e.stream_id.as_str(), SourceKind::Raw);
            Ok(())
        });

        let r = self.clone();
        self.bus.subscribe(topics::MARKET_ORDERBOOK_TOP, move |e| {
            r.mark(&e.symbol, e.market_type, Block::Liquidity, e.stream_id.as_str(), SourceKind::Raw);
            Ok(())
        });

        let r = self.clone();
        self.bus.subscribe(topics::MARKET_LIQUIDITY_AGG, move |e| {
            r.mark(&e.symbol, e.market_type, Block::Liquidity, "liquidity_agg", SourceKind::Agg);
            Ok(())
        });

        let r = self.clone();
        self.bus.subscribe(topics::MARKET_OI, move |e| {
            r.mark(&e.symbol, e.market_type, Block::Derivatives, e.stream_id.as_str(), SourceKind::Raw);
            Ok(())
        });

        let r = self.clone();
        self.bus.subscribe(topics::MARKET_FUNDING, move |e| {
            r.mark(&e.symbol, e.market_type, Block::Derivatives, e.stream_id.as_str(), SourceKind::Raw);
            Ok(())
        });

        let r = self.clone();
        self.bus.subscribe(topics::MARKET_LIQUIDATION, move |e| {
            r.mark(&e.symbol, e.market_type, Block::Derivatives, e.stream_id.as_str(), SourceKind::Raw);
            Ok(())
        });

        let r = self.clone();
        self.bus.subscribe(topics::MARKET_OI_AGG, move |e| {
            r.mark(&e.symbol, e.market_type, Block::Derivatives, "oi_agg", SourceKind::Agg);
            if e.fusion.mismatch_detected {
                r.note_mismatch(&e.symbol, e.market_type, Block::Derivatives);
            }
            Ok(())
        });

        let r = self.clone();
        self.bus.subscribe(topics::MARKET_FUNDING_AGG, move |e| {
            r.mark(&e.symbol, e.market_type, Block::Derivatives, "funding_agg", SourceKind::Agg);
            Ok(())
        });

        let r = self.clone();
        self.bus.subscribe(topics::MARKET_LIQUIDATIONS_AGG, move |e| {
            r.mark(&e.symbol, e.market_type, Block::Derivatives, "liquidations_agg", SourceKind::Agg);
            Ok(())
        });

        let r = self.clone();
        self.bus.subscribe(topics::ANALYTICS_FLOW, move |e| {
            r.on_flow(e);
            Ok(())
        });

        let r = self.clone();
        self.bus.subscribe(topics::DATA_GAP_DETECTED, move |e| {
            if let Some(block) = block_for_topic(&e.topic) {
                r.note_gap(&e.symbol, block);
            }
            Ok(())
        });

        let r = self.clone();
        self.bus.subscribe(topics::DATA_SEQUENCE_ANOMALY, move |e| {
            if let Some(block) = block_for_topic(&e.topic) {
                r.note_sequence_broken(&e.symbol, block);
            }
            Ok(())
        });

        let r = self.clone();
        self.bus.subscribe(topics::DATA_LATENCY_SPIKE, move |e| {
            if let Some(block) = block_for_topic(&e.topic) {
                r.note_lag(&e.symbol, block);
            }
            Ok(())
        });

        let r = self.clone();
        self.bus.subscribe(topics::DATA_MISMATCH, move |e| {
            if e.suppressed {
                return Ok(());
            }
            if let Some(block) = block_for_topic(&e.topic) {
                r.note_mismatch_by_symbol(&e.symbol, block);
            }
            Ok(())
        });

        let r = self.clone();
        self.bus.subscribe(topics::MARKET_DISCONNECTED, move |e| {
            r.on_disconnected(e);
            Ok(())
        });

        let r = self.clone();
        self.bus.subscribe(topics::MARKET_CONNECTED, move |e| {
            r.on_connected(e);
            Ok(())
        });
    }

    /// Seed (or fetch) the per-symbol state, pinning the target market type.
    /// Returns false when the event's market type is not the pinned target.
    fn seed(&self, symbol: &str, market_type: MarketType) -> bool {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        match state.get(symbol) {
            Some(existing) => existing.market_type == market_type,
            None => {
                let target = self.config.target_market_type.unwrap_or(market_type);
                if target != market_type {
                    return false;
                }
                info!(symbol, market = %target, "readiness seeded");
                state.insert(symbol.to_string(), SymbolReadiness::new(target, now));
                drop(state);

                // Declare the expected source sets once per scope.
                for block in Block::ALL {
                    if let Some(sources) = self.config.expected_sources(block, symbol, target) {
                        self.registry.set_expected(symbol, target, block, sources);
                    }
                }
                true
            }
        }
    }

    fn mark(
        &self,
        symbol: &str,
        market_type: MarketType,
        block: Block,
        source: &str,
        kind: SourceKind,
    ) {
        if !self.seed(symbol, market_type) {
            return;
        }
        self.registry
            .mark_seen(symbol, market_type, block, source, kind, self.clock.now_ms());
    }

    fn on_canonical_price(&self, event: &crate::events::CanonicalPriceEvent) {
        if !self.seed(&event.symbol, event.market_type) {
            return;
        }
        let now = self.clock.now_ms();
        self.registry.mark_seen(
            &event.symbol,
            event.market_type,
            Block::Price,
            "price_canonical",
            SourceKind::Agg,
            now,
        );

        let mut state = self.state.lock();
        if let Some(entry) = state.get_mut(&event.symbol) {
            entry.last_price_ts = Some(event.meta.ts_event);
            entry.price_samples += 1;
            entry.price_seen_since_reconnect = true;
        }
        drop(state);

        if event.fusion.mismatch_detected {
            self.note_mismatch(&event.symbol, event.market_type, Block::Price);
        }
    }

    fn note_mismatch(&self, symbol: &str, market_type: MarketType, block: Block) {
        let now = self.clock.now_ms();
        self.engine.lock().note_mismatch(symbol, market_type, block, now);
        self.maybe_emit_on_change(symbol);
    }

    fn note_mismatch_by_symbol(&self, symbol: &str, block: Block) {
        if let Some(market) = self.market_of(symbol) {
            let now = self.clock.now_ms();
            self.engine.lock().note_mismatch(symbol, market, block, now);
            self.maybe_emit_on_change(symbol);
        }
    }

    fn note_gap(&self, symbol: &str, block: Block) {
        if let Some(market) = self.market_of(symbol) {
            let now = self.clock.now_ms();
            self.engine.lock().note_gap(symbol, market, block, now);
            self.maybe_emit_on_change(symbol);
        }
    }

    fn note_sequence_broken(&self, symbol: &str, block: Block) {
        if let Some(market) = self.market_of(symbol) {
            let now = self.clock.now_ms();
            self.engine
                .lock()
                .note_sequence_broken(symbol, market, block, now);
            self.maybe_emit_on_change(symbol);
        }
    }

    fn note_lag(&self, symbol: &str, block: Block) {
        if let Some(market) = self.market_of(symbol) {
            let now = self.clock.now_ms();
            self.engine.lock().note_lag(symbol, market, block, now);
        }
    }

    fn market_of(&self, symbol: &str) -> Option<MarketType> {
        self.state.lock().get(symbol).map(|s| s.market_type)
    }

    fn on_flow(&self, flow: &FlowEvent) {
        if !self.seed(&flow.symbol, flow.market_type) {
            return;
        }
        let now = self.clock.now_ms();
        self.registry.mark_seen(
            &flow.symbol,
            flow.market_type,
            Block::Flow,
            "cvd_agg",
            SourceKind::Agg,
            now,
        );

        // Price-vs-flow bucket alignment, end-inclusive.
        let bucket_ms = self.config.readiness.bucket_ms;
        let bucket_end = flow.bucket_end_ts;
        let bucket_start = TsMillis(bucket_end.0 - bucket_ms);
        let price_aligned = {
            let state = self.state.lock();
            state
                .get(&flow.symbol)
                .and_then(|s| s.last_price_ts)
                .map(|ts| in_bucket_inclusive(ts, bucket_start, bucket_end))
        };

        let mut warnings = Vec::new();
        if price_aligned == Some(false) {
            warnings.push("PRICE_BUCKET_MISMATCH".to_string());
        }

        {
            let mut state = self.state.lock();
            if let Some(entry) = state.get_mut(&flow.symbol) {
                entry.last_bucket_ts = Some(bucket_end);
            }
        }

        // Bucket close is an emission point.
        self.evaluate_and_emit(&flow.symbol, warnings, true);
    }

    fn on_disconnected(&self, ev: &ConnectionEvent) {
        let now = self.clock.now_ms();
        let symbols: Vec<String> = {
            let mut state = self.state.lock();
            state
                .iter_mut()
                .filter(|(_, s)| s.market_type == ev.market_type)
                .map(|(symbol, s)| {
                    s.last_disconnect = Some(now);
                    s.price_seen_since_reconnect = false;
                    symbol.clone()
                })
                .collect()
        };
        for symbol in symbols {
            self.evaluate_and_emit(&symbol, Vec::new(), false);
        }
    }

    fn on_connected(&self, ev: &ConnectionEvent) {
        let symbols: Vec<String> = {
            let state = self.state.lock();
            state
                .iter()
                .filter(|(_, s)| s.market_type == ev.market_type)
                .map(|(symbol, _)| symbol.clone())
                .collect()
        };
        for symbol in symbols {
            self.maybe_emit_on_change(&symbol);
        }
    }

    fn maybe_emit_on_change(&self, symbol: &str) {
        self.evaluate_and_emit(symbol, Vec::new(), false);
    }

    /// Build and (conditionally) publish the status. `force` emits
    /// unconditionally (bucket close); otherwise only a degraded flip emits.
    fn evaluate_and_emit(&self, symbol: &str, warnings: Vec<String>, force: bool) {
        let now = self.clock.now_ms();
        let Some(market) = self.market_of(symbol) else {
            return;
        };

        let ttl = self.config.aggregator.ttl_ms;
        let engine = self.engine.lock();

        let mut block_confidence = BlockConfidence::default();
        let mut confidence_events = Vec::new();
        let mut active = SourceCounts::default();
        let mut expected = SourceCounts::default();
        let mut sources_missing = false;
        let mut missing_all: std::collections::BTreeSet<String> = Default::default();

        for block in Block::ALL {
            let expected_count = self.registry.expected_count(symbol, market, block);
            let fresh_raw =
                self.registry
                    .active_count(symbol, market, block, SourceKind::Raw, ttl, now);
            let fresh_agg =
                self.registry
                    .active_count(symbol, market, block, SourceKind::Agg, ttl, now);

            active.raw += fresh_raw;
            active.agg += fresh_agg;
            expected.raw += expected_count;
            if expected_count > 0 {
                expected.agg += 1;
            }

            if expected_count > 0 {
                let missing = self.registry.missing(symbol, market, block, ttl, now);
                if !missing.is_empty() {
                    sources_missing = true;
                    missing_all.extend(missing);
                }
            }

            // Raw sources count against the expected set; with no expected
            // declaration, any fresh input (raw or aggregated) counts.
            let fresh = if expected_count > 0 {
                fresh_raw
            } else {
                fresh_raw + fresh_agg
            };
            let inputs = BlockInputs {
                fresh,
                expected: (expected_count > 0).then_some(expected_count),
                stale_dropped: 0,
                source_caps: Vec::new(),
            };
            let (score, explain) = engine.compute(symbol, market, block, &inputs, now);
            block_confidence.set(block, score);

            confidence_events.push(ConfidenceEvent {
                meta: EventMeta::new("readiness", now),
                symbol: symbol.to_string(),
                market_type: market,
                block,
                score,
                explain,
            });
        }

        let sequence_broken = Block::ALL
            .iter()
            .any(|b| engine.sequence_broken(symbol, market, *b, now));
        let mismatch_detected = Block::ALL
            .iter()
            .any(|b| engine.mismatch_active(symbol, market, *b, now));
        drop(engine);

        // Staleness policy for the canonical price path.
        let mut price_stale = false;
        let (seeded_at, last_price_ts, price_samples, last_disconnect, price_seen_since_reconnect) = {
            let state = self.state.lock();
            let Some(entry) = state.get(symbol) else {
                return;
            };
            (
                entry.seeded_at,
                entry.last_price_ts,
                entry.price_samples,
                entry.last_disconnect,
                entry.price_seen_since_reconnect,
            )
        };

        if let Some(rule) = resolve_staleness(
            &self.config.staleness,
            topics::MARKET_PRICE_CANONICAL.name(),
            symbol,
            market,
        ) {
            let past_grace = now.delta_ms(seeded_at) > rule.startup_grace_ms;
            let enough_samples = price_samples >= rule.min_samples;
            if past_grace && enough_samples {
                let age = last_price_ts.map(|ts| now.delta_ms(ts));
                if age.is_none_or(|a| a > rule.stale_threshold_ms) {
                    price_stale = true;
                    if let Some(age) = age {
                        let stale = SourceStale {
                            meta: EventMeta::new("readiness", now),
                            source: "price_canonical".to_string(),
                            topic: topics::MARKET_PRICE_CANONICAL.name().to_string(),
                            symbol: symbol.to_string(),
                            age_ms: age,
                            threshold_ms: rule.stale_threshold_ms,
                        };
                        self.bus.publish(topics::DATA_STALE, &stale);
                    }
                }
            }
        }

        let ws_disconnected = last_disconnect.is_some_and(|ts| {
            now.delta_ms(ts) < self.config.readiness.ws_recovery_window_ms
                && !price_seen_since_reconnect
        });

        let mut degraded_reasons = Vec::new();
        if ws_disconnected {
            degraded_reasons.push("WS_DISCONNECTED".to_string());
        }
        if price_stale {
            degraded_reasons.push("PRICE_STALE".to_string());
        }
        if mismatch_detected {
            degraded_reasons.push("MISMATCH_DETECTED".to_string());
        }
        if sources_missing {
            degraded_reasons.push("SOURCES_MISSING".to_string());
        }
        if sequence_broken {
            degraded_reasons.push("SEQUENCE_BROKEN".to_string());
        }
        if block_confidence.flow < FLOW_LOW_CONF_THRESHOLD {
            degraded_reasons.push("FLOW_LOW_CONF".to_string());
        }
        let degraded = !degraded_reasons.is_empty();

        let warmup_window = self.config.readiness.warmup_window_ms;
        let elapsed = now.delta_ms(seeded_at);
        let warming_up = elapsed < warmup_window;
        let warming_progress = if warmup_window > 0 {
            (elapsed as f64 / warmup_window as f64).clamp(0.0, 1.0)
        } else {
            1.0
        };

        let (changed, last_bucket_ts, newly_degraded, recovered) = {
            let mut state = self.state.lock();
            let Some(entry) = state.get_mut(symbol) else {
                return;
            };
            let changed = entry.last_degraded != Some(degraded);
            entry.last_degraded = Some(degraded);
            let newly: Vec<String> = missing_all
                .difference(&entry.degraded_sources)
                .cloned()
                .collect();
            let recovered: Vec<String> = entry
                .degraded_sources
                .difference(&missing_all)
                .cloned()
                .collect();
            entry.degraded_sources = missing_all;
            (changed, entry.last_bucket_ts, newly, recovered)
        };

        // Per-source degradation transitions fire on every evaluation, not
        // just on status emissions.
        for source in newly_degraded {
            let event = SourceDegraded {
                meta: EventMeta::new("readiness", now),
                source,
                reason: "MISSING".to_string(),
            };
            self.bus.publish(topics::DATA_SOURCE_DEGRADED, &event);
        }
        for source in recovered {
            let event = SourceRecovered {
                meta: EventMeta::new("readiness", now),
                source,
            };
            self.bus.publish(topics::DATA_SOURCE_RECOVERED, &event);
        }

        if !force && !changed {
            return;
        }

        for event in &confidence_events {
            self.bus.publish(topics::DATA_CONFIDENCE, event);
        }

        let status = MarketDataStatus {
            meta: EventMeta::new("readiness", now),
            symbol: symbol.to_string(),
            market_type: market,
            overall_confidence: block_confidence.min(),
            block_confidence,
            degraded,
            degraded_reasons,
            warnings,
            warming_up,
            warming_progress,
            warming_window_ms: warmup_window,
            active_sources: active,
            expected_sources: expected,
            last_bucket_ts,
        };

        if self.config.readiness_debug {
            debug!(
                symbol,
                overall = status.overall_confidence,
                degraded = status.degraded,
                reasons = ?status.degraded_reasons,
                "market data status"
            );
        }
        self.bus.publish(topics::SYSTEM_MARKET_DATA_STATUS, &status);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExpectedSourcesRule, StalenessRule};
    use crate::events::{CanonicalPriceEvent, FusionInfo, PriceType, TickerEvent};
    use crate::meta::{ManualClock, StreamId};
    use parking_lot::Mutex as PMutex;

    fn ticker(symbol: &str, market: MarketType, ts: i64) -> TickerEvent {
        let stream_id = StreamId::new("binance", "ticker", market);
        TickerEvent {
            meta: EventMeta::new("binance", TsMillis(ts)).with_stream(stream_id.clone()),
            symbol: symbol.to_string(),
            market_type: market,
            stream_id,
            last_price: 100.0,
            bid: None,
            ask: None,
            volume_24h: None,
        }
    }

    fn canonical(symbol: &str, ts_event: i64, mismatch: bool) -> CanonicalPriceEvent {
        let mut fusion = FusionInfo::default();
        fusion.mismatch_detected = mismatch;
        fusion.confidence_score = 1.0;
        CanonicalPriceEvent {
            meta: EventMeta::new("canonical-price", TsMillis(ts_event)).at(TsMillis(ts_event)),
            symbol: symbol.to_string(),
            market_type: MarketType::Futures,
            price: 100.0,
            price_type_used: PriceType::Index,
            fallback_reason: None,
            fusion,
        }
    }

    fn flow(symbol: &str, bucket_end: i64) -> FlowEvent {
        FlowEvent {
            meta: EventMeta::new("cvd", TsMillis(bucket_end)),
            symbol: symbol.to_string(),
            market_type: MarketType::Futures,
            cvd: 1.0,
            bucket_delta: 1.0,
            bucket_end_ts: TsMillis(bucket_end),
        }
    }

    fn setup(
        mut config: PipelineConfig,
    ) -> (Arc<EventBus>, Arc<ManualClock>, Arc<PMutex<Vec<MarketDataStatus>>>) {
        config.target_market_type = Some(MarketType::Futures);
        let bus = Arc::new(EventBus::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let registry = Arc::new(SourceRegistry::new());
        let readiness = MarketDataReadiness::new(bus.clone(), clock.clone(), config, registry);
        readiness.start();

        let seen = Arc::new(PMutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe(topics::SYSTEM_MARKET_DATA_STATUS, move |e| {
            s.lock().push(e.clone());
            Ok(())
        });
        (bus, clock, seen)
    }

    #[test]
    fn bucket_label_and_membership() {
        assert_eq!(bucket_label(TsMillis(1_999), 1_000), TsMillis(1_000));
        assert_eq!(bucket_label(TsMillis(2_000), 1_000), TsMillis(2_000));

        // End-inclusive membership: the boundary belongs to the closing
        // bucket.
        assert!(in_bucket_inclusive(TsMillis(2_000), TsMillis(1_000), TsMillis(2_000)));
        assert!(in_bucket_inclusive(TsMillis(1_000), TsMillis(1_000), TsMillis(2_000)));
        assert!(!in_bucket_inclusive(TsMillis(999), TsMillis(1_000), TsMillis(2_000)));
    }

    #[test]
    fn bucket_close_emits_status() {
        let (bus, _clock, seen) = setup(PipelineConfig::default());

        bus.publish(topics::MARKET_PRICE_CANONICAL, &canonical("BTCUSDT", 999_500, false));
        bus.publish(topics::ANALYTICS_FLOW, &flow("BTCUSDT", 1_000_000));

        let seen = seen.lock();
        assert!(!seen.is_empty());
        let status = seen.last().unwrap();
        assert_eq!(status.symbol, "BTCUSDT");
        assert_eq!(status.last_bucket_ts, Some(TsMillis(1_000_000)));
        assert!(status.warming_up);
        assert!(status.warnings.is_empty());
    }

    #[test]
    fn price_outside_bucket_warns_mismatch() {
        let (bus, _clock, seen) = setup(PipelineConfig::default());

        // Price far older than the closing bucket [999_000, 1_000_000].
        bus.publish(topics::MARKET_PRICE_CANONICAL, &canonical("BTCUSDT", 900_000, false));
        bus.publish(topics::ANALYTICS_FLOW, &flow("BTCUSDT", 1_000_000));

        let seen = seen.lock();
        let status = seen.last().unwrap();
        assert_eq!(status.warnings, vec!["PRICE_BUCKET_MISMATCH"]);
    }

    #[test]
    fn price_on_bucket_boundary_is_aligned() {
        let (bus, _clock, seen) = setup(PipelineConfig::default());

        bus.publish(topics::MARKET_PRICE_CANONICAL, &canonical("BTCUSDT", 1_000_000, false));
        bus.publish(topics::ANALYTICS_FLOW, &flow("BTCUSDT", 1_000_000));

        let seen = seen.lock();
        assert!(seen.last().unwrap().warnings.is_empty());
    }

    #[test]
    fn non_target_market_type_is_ignored() {
        let (bus, _clock, seen) = setup(PipelineConfig::default());

        bus.publish(topics::MARKET_TICKER, &ticker("BTCUSDT", MarketType::Spot, 999_000));
        let spot_flow = FlowEvent {
            market_type: MarketType::Spot,
            ..flow("BTCUSDT", 1_000_000)
        };
        bus.publish(topics::ANALYTICS_FLOW, &spot_flow);

        assert!(seen.lock().is_empty());
    }

    #[test]
    fn mismatch_degrades_status() {
        let (bus, _clock, seen) = setup(PipelineConfig::default());

        bus.publish(topics::MARKET_PRICE_CANONICAL, &canonical("BTCUSDT", 999_500, true));
        bus.publish(topics::ANALYTICS_FLOW, &flow("BTCUSDT", 1_000_000));

        let seen = seen.lock();
        let status = seen.last().unwrap();
        assert!(status.degraded);
        assert!(status
            .degraded_reasons
            .contains(&"MISMATCH_DETECTED".to_string()));
    }

    #[test]
    fn missing_expected_sources_degrade() {
        let mut config = PipelineConfig::default();
        config.confidence.expected_sources = vec![ExpectedSourcesRule {
            block: Block::Price,
            symbol: None,
            market_type: None,
            sources: vec![
                "binance:ticker:futures".to_string(),
                "okx:ticker:futures".to_string(),
            ],
        }];
        let (bus, _clock, seen) = setup(config);

        let degraded_sources = Arc::new(PMutex::new(Vec::new()));
        let d = degraded_sources.clone();
        bus.subscribe(topics::DATA_SOURCE_DEGRADED, move |e| {
            d.lock().push(e.source.clone());
            Ok(())
        });

        // Only binance reports; okx is missing.
        bus.publish(topics::MARKET_TICKER, &ticker("BTCUSDT", MarketType::Futures, 999_500));
        bus.publish(topics::ANALYTICS_FLOW, &flow("BTCUSDT", 1_000_000));

        let seen = seen.lock();
        let status = seen.last().unwrap();
        assert!(status.degraded);
        assert!(status.degraded_reasons.contains(&"SOURCES_MISSING".to_string()));
        assert_eq!(status.block_confidence.price, 0.5);
        assert_eq!(status.expected_sources.raw, 2);
        assert_eq!(status.active_sources.raw, 1);
        assert_eq!(*degraded_sources.lock(), vec!["okx:ticker:futures"]);
    }

    #[test]
    fn price_staleness_rule_applies_after_grace() {
        let mut config = PipelineConfig::default();
        config.staleness = vec![StalenessRule {
            topic: "market:price_canonical".to_string(),
            symbol: None,
            market_type: None,
            expected_interval_ms: 1_000,
            stale_threshold_ms: 5_000,
            startup_grace_ms: 0,
            min_samples: 1,
        }];
        let (bus, clock, seen) = setup(config);

        bus.publish(topics::MARKET_PRICE_CANONICAL, &canonical("BTCUSDT", 1_000_000, false));
        bus.publish(topics::ANALYTICS_FLOW, &flow("BTCUSDT", 1_000_000));
        assert!(!seen.lock().last().unwrap().degraded);

        // Price goes silent; the next bucket close sees it stale.
        clock.set(1_020_000);
        bus.publish(topics::ANALYTICS_FLOW, &flow("BTCUSDT", 1_020_000));

        let seen = seen.lock();
        let status = seen.last().unwrap();
        assert!(status.degraded);
        assert!(status.degraded_reasons.contains(&"PRICE_STALE".to_string()));
    }

    #[test]
    fn warmup_progress_advances() {
        let mut config = PipelineConfig::default();
        config.readiness.warmup_window_ms = 10_000;
        let (bus, clock, seen) = setup(config);

        bus.publish(topics::MARKET_PRICE_CANONICAL, &canonical("BTCUSDT", 1_000_000, false));
        bus.publish(topics::ANALYTICS_FLOW, &flow("BTCUSDT", 1_000_000));
        let first = seen.lock().last().unwrap().clone();
        assert!(first.warming_up);
        assert!(first.warming_progress < 1.0);

        clock.set(1_015_000);
        bus.publish(topics::MARKET_PRICE_CANONICAL, &canonical("BTCUSDT", 1_014_500, false));
        bus.publish(topics::ANALYTICS_FLOW, &flow("BTCUSDT", 1_015_000));
        let second = seen.lock().last().unwrap().clone();
        assert!(!second.warming_up);
        assert_eq!(second.warming_progress, 1.0);
    }

    #[test]
    fn ws_disconnect_degrades_until_price_reflows() {
        let (bus, _clock, seen) = setup(PipelineConfig::default());

        bus.publish(topics::MARKET_PRICE_CANONICAL, &canonical("BTCUSDT", 999_500, false));
        bus.publish(topics::ANALYTICS_FLOW, &flow("BTCUSDT", 1_000_000));

        bus.publish(
            topics::MARKET_DISCONNECTED,
            &ConnectionEvent {
                meta: EventMeta::new("gateway", TsMillis(1_000_100)),
                venue: "binance".to_string(),
                market_type: MarketType::Futures,
                stream_id: None,
            },
        );

        let after_disconnect = seen.lock().last().unwrap().clone();
        assert!(after_disconnect.degraded);
        assert!(after_disconnect
            .degraded_reasons
            .contains(&"WS_DISCONNECTED".to_string()));

        // Fresh price after reconnect clears the reason on the next close.
        bus.publish(topics::MARKET_PRICE_CANONICAL, &canonical("BTCUSDT", 1_000_500, false));
        bus.publish(topics::ANALYTICS_FLOW, &flow("BTCUSDT", 1_001_000));
        let recovered = seen.lock().last().unwrap().clone();
        assert!(!recovered
            .degraded_reasons
            .contains(&"WS_DISCONNECTED".to_string()));
    }
}
