// =============================================================================
// Pipeline Configuration - file-backed settings with env overrides
// =============================================================================
//
// Central configuration hub for the Borealis pipeline. Every tunable lives
// here. Persistence uses an atomic tmp + rename pattern to prevent corruption
// on crash, and all fields carry serde defaults so that adding new fields
// never breaks loading an older config file.
//
// Recognized environment variables (applied on top of the file):
//   BOT_SYMBOLS, BOT_KLINE_TF / BOT_KLINE_INTERVALS, BOT_KLINE_LIMIT,
//   BOT_TARGET_MARKET_TYPE, BOT_TRADES_ENABLED, BOT_ORDERBOOK_ENABLED,
//   BOT_OI_ENABLED, BOT_FUNDING_ENABLED, BOT_LIQUIDATIONS_ENABLED,
//   BOT_KLINES_ENABLED, BOT_SPOT_ENABLED, BOT_ORDERBOOK_DEPTH,
//   BOT_CVD_DEBUG, BOT_FLOW_DEBUG, BOT_READINESS_DEBUG, BOT_GAP_DEBUG

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::events::ValueUnit;
use crate::types::{Block, MarketType};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_kline_tfs() -> Vec<String> {
    ["1m", "5m", "15m", "1h", "4h", "1d"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_kline_limit() -> usize {
    200
}

fn default_orderbook_depth() -> usize {
    20
}

fn default_journal_dir() -> String {
    "journal".to_string()
}

fn default_journal_topics() -> Vec<String> {
    vec![
        "market:ticker".to_string(),
        "market:kline".to_string(),
        "market:trade".to_string(),
        "market:orderbook_l2_snapshot".to_string(),
        "market:orderbook_l2_delta".to_string(),
        "market:oi".to_string(),
        "market:funding".to_string(),
        "market:liquidation".to_string(),
    ]
}

fn default_batch_size() -> usize {
    256
}

fn default_flush_interval_ms() -> u64 {
    500
}

fn default_latency_spike_threshold_ms() -> i64 {
    2_000
}

fn default_resync_cooldown_ms() -> i64 {
    1_000
}

fn default_resync_reason_cooldown_ms() -> i64 {
    2_000
}

fn default_ttl_ms() -> i64 {
    5_000
}

fn default_bucket_ms() -> i64 {
    1_000
}

fn default_mismatch_threshold_pct() -> f64 {
    0.5
}

fn default_oi_baseline() -> String {
    "median".to_string()
}

fn default_weight() -> f64 {
    1.0
}

fn default_unit_multiplier() -> f64 {
    1.0
}

fn default_sma_period() -> usize {
    20
}

fn default_window_size() -> usize {
    50
}

fn default_feature_min_emit_interval_ms() -> i64 {
    1_000
}

fn default_max_ticks_before_emit() -> usize {
    5
}

fn default_ema_fast() -> usize {
    12
}

fn default_ema_slow() -> usize {
    26
}

fn default_rsi_period() -> usize {
    14
}

fn default_atr_period() -> usize {
    14
}

fn default_macro_tfs() -> Vec<String> {
    vec!["1h".to_string(), "4h".to_string()]
}

fn default_high_vol_threshold() -> f64 {
    0.02
}

fn default_warmup_window_ms() -> i64 {
    60_000
}

fn default_ws_recovery_window_ms() -> i64 {
    30_000
}

fn default_penalty_mismatch() -> f64 {
    0.5
}

fn default_penalty_gap() -> f64 {
    0.7
}

fn default_penalty_sequence() -> f64 {
    0.5
}

fn default_penalty_lag() -> f64 {
    0.8
}

fn default_penalty_outlier() -> f64 {
    0.8
}

fn default_snapshot_interval_ms() -> u64 {
    60_000
}

fn default_snapshot_dir() -> String {
    "state".to_string()
}

// =============================================================================
// Sub-configs
// =============================================================================

/// Journal sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "default_journal_dir")]
    pub base_dir: String,

    /// Non-aggregated topics the journal persists.
    #[serde(default = "default_journal_topics")]
    pub topics: Vec<String>,

    /// Records buffered before a forced flush.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time a record sits in the buffer before flush.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// `ts_ingest - ts_exchange` above this emits `data:latencySpike`.
    #[serde(default = "default_latency_spike_threshold_ms")]
    pub latency_spike_threshold_ms: i64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            base_dir: default_journal_dir(),
            topics: default_journal_topics(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            latency_spike_threshold_ms: default_latency_spike_threshold_ms(),
        }
    }
}

/// Gateway resync coalescing windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Resync requests for the same (venue, symbol) within this window are
    /// ignored.
    #[serde(default = "default_resync_cooldown_ms")]
    pub resync_cooldown_ms: i64,

    /// Additional per-reason window.
    #[serde(default = "default_resync_reason_cooldown_ms")]
    pub resync_reason_cooldown_ms: i64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            resync_cooldown_ms: default_resync_cooldown_ms(),
            resync_reason_cooldown_ms: default_resync_reason_cooldown_ms(),
        }
    }
}

/// Per-source tuning applied before weighted fusion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceTuning {
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Multiplier applied to the source value before fusion (unit
    /// normalization, e.g. contract size).
    #[serde(default = "default_unit_multiplier")]
    pub unit_multiplier: f64,

    /// Sign override for CVD-style sources (e.g. -1.0 flips the side
    /// convention).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign_override: Option<f64>,

    /// Declared unit for OI / liquidation sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<ValueUnit>,

    /// Venue trust cap applied to confidence when this source participates
    /// (e.g. OKX liquidations are capped at 0.7).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_cap: Option<f64>,
}

impl Default for SourceTuning {
    fn default() -> Self {
        Self {
            weight: default_weight(),
            unit_multiplier: default_unit_multiplier(),
            sign_override: None,
            unit: None,
            trust_cap: None,
        }
    }
}

/// Shared aggregator settings plus the per-source tuning table (keyed by
/// stream id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Sources older than this are dropped from fusion.
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: i64,

    /// Bucket width for CVD / liquidations / volume bucketing.
    #[serde(default = "default_bucket_ms")]
    pub bucket_ms: i64,

    /// Emission throttle; 0 emits on every relevant input.
    #[serde(default)]
    pub min_emit_interval_ms: i64,

    /// Relative deviation from baseline (fraction) that counts as mismatch.
    #[serde(default = "default_mismatch_threshold_pct")]
    pub mismatch_threshold_pct: f64,

    /// Baseline strategy for OI mismatch detection: `median` or a venue name.
    #[serde(default = "default_oi_baseline")]
    pub oi_baseline: String,

    /// Per-source tuning, keyed by stream id.
    #[serde(default)]
    pub sources: BTreeMap<String, SourceTuning>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            bucket_ms: default_bucket_ms(),
            min_emit_interval_ms: 0,
            mismatch_threshold_pct: default_mismatch_threshold_pct(),
            oi_baseline: default_oi_baseline(),
            sources: BTreeMap::new(),
        }
    }
}

impl AggregatorConfig {
    pub fn tuning(&self, source: &str) -> SourceTuning {
        self.sources.get(source).cloned().unwrap_or_default()
    }
}

/// Expected sources for one block, optionally scoped by symbol and market
/// type. More specific rules win (symbol+market > symbol > market > block).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedSourcesRule {
    pub block: Block,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_type: Option<MarketType>,
    pub sources: Vec<String>,
}

/// Multiplicative penalty factors, applied in the fixed order mismatch,
/// gap, sequence, lag, outlier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PenaltyFactors {
    #[serde(default = "default_penalty_mismatch")]
    pub mismatch: f64,
    #[serde(default = "default_penalty_gap")]
    pub gap: f64,
    #[serde(default = "default_penalty_sequence")]
    pub sequence_broken: f64,
    #[serde(default = "default_penalty_lag")]
    pub lag: f64,
    #[serde(default = "default_penalty_outlier")]
    pub outlier: f64,
}

impl Default for PenaltyFactors {
    fn default() -> Self {
        Self {
            mismatch: default_penalty_mismatch(),
            gap: default_penalty_gap(),
            sequence_broken: default_penalty_sequence(),
            lag: default_penalty_lag(),
            outlier: default_penalty_outlier(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfidenceConfig {
    #[serde(default)]
    pub expected_sources: Vec<ExpectedSourcesRule>,

    #[serde(default)]
    pub penalties: PenaltyFactors,

    /// Named trust caps, e.g. `OKX_LIQUIDATIONS_LIMITED` -> 0.7. Applied when
    /// the matching source participates in a block.
    #[serde(default)]
    pub source_caps: BTreeMap<String, f64>,
}

/// A staleness rule. Specificity ordering at lookup time:
/// topic+symbol+market > topic+symbol > topic+market > topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalenessRule {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_type: Option<MarketType>,
    pub expected_interval_ms: i64,
    pub stale_threshold_ms: i64,
    #[serde(default)]
    pub startup_grace_ms: i64,
    #[serde(default)]
    pub min_samples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    #[serde(default = "default_sma_period")]
    pub sma_period: usize,

    #[serde(default = "default_window_size")]
    pub window_size: usize,

    #[serde(default = "default_feature_min_emit_interval_ms")]
    pub min_emit_interval_ms: i64,

    #[serde(default = "default_max_ticks_before_emit")]
    pub max_ticks_before_emit: usize,

    #[serde(default = "default_ema_fast")]
    pub ema_fast: usize,

    #[serde(default = "default_ema_slow")]
    pub ema_slow: usize,

    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,

    #[serde(default = "default_atr_period")]
    pub atr_period: usize,

    /// Timeframes the macro context waits for before declaring readiness.
    #[serde(default = "default_macro_tfs")]
    pub macro_tfs: Vec<String>,

    /// ATR-as-fraction-of-close threshold above which the regime is `storm`.
    #[serde(default = "default_high_vol_threshold")]
    pub high_vol_threshold: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            sma_period: default_sma_period(),
            window_size: default_window_size(),
            min_emit_interval_ms: default_feature_min_emit_interval_ms(),
            max_ticks_before_emit: default_max_ticks_before_emit(),
            ema_fast: default_ema_fast(),
            ema_slow: default_ema_slow(),
            rsi_period: default_rsi_period(),
            atr_period: default_atr_period(),
            macro_tfs: default_macro_tfs(),
            high_vol_threshold: default_high_vol_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    /// Bucket width used for price-vs-flow alignment.
    #[serde(default = "default_bucket_ms")]
    pub bucket_ms: i64,

    #[serde(default = "default_warmup_window_ms")]
    pub warmup_window_ms: i64,

    /// A WS disconnect within this window marks the status degraded until
    /// stable reflow.
    #[serde(default = "default_ws_recovery_window_ms")]
    pub ws_recovery_window_ms: i64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            bucket_ms: default_bucket_ms(),
            warmup_window_ms: default_warmup_window_ms(),
            ws_recovery_window_ms: default_ws_recovery_window_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_dir")]
    pub dir: String,

    #[serde(default = "default_snapshot_interval_ms")]
    pub interval_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: default_snapshot_dir(),
            interval_ms: default_snapshot_interval_ms(),
        }
    }
}

// =============================================================================
// PipelineConfig
// =============================================================================

/// Top-level configuration for the Borealis pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_kline_tfs")]
    pub kline_tfs: Vec<String>,

    #[serde(default = "default_kline_limit")]
    pub kline_limit: usize,

    /// When set, readiness pins its target market type; events of the other
    /// market type are ignored by the readiness engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_market_type: Option<MarketType>,

    // --- Feature toggles ----------------------------------------------------
    #[serde(default = "default_true")]
    pub trades_enabled: bool,
    #[serde(default = "default_true")]
    pub orderbook_enabled: bool,
    #[serde(default = "default_true")]
    pub oi_enabled: bool,
    #[serde(default = "default_true")]
    pub funding_enabled: bool,
    #[serde(default = "default_true")]
    pub liquidations_enabled: bool,
    #[serde(default = "default_true")]
    pub klines_enabled: bool,
    #[serde(default = "default_true")]
    pub spot_enabled: bool,

    #[serde(default = "default_orderbook_depth")]
    pub orderbook_depth: usize,

    // --- Debug flags (off by default) ---------------------------------------
    #[serde(default)]
    pub cvd_debug: bool,
    #[serde(default)]
    pub flow_debug: bool,
    #[serde(default)]
    pub readiness_debug: bool,
    #[serde(default)]
    pub gap_debug: bool,

    // --- Component configs --------------------------------------------------
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub confidence: ConfidenceConfig,
    #[serde(default)]
    pub staleness: Vec<StalenessRule>,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            kline_tfs: default_kline_tfs(),
            kline_limit: default_kline_limit(),
            target_market_type: None,
            trades_enabled: true,
            orderbook_enabled: true,
            oi_enabled: true,
            funding_enabled: true,
            liquidations_enabled: true,
            klines_enabled: true,
            spot_enabled: true,
            orderbook_depth: default_orderbook_depth(),
            cvd_debug: false,
            flow_debug: false,
            readiness_debug: false,
            gap_debug: false,
            journal: JournalConfig::default(),
            gateway: GatewayConfig::default(),
            aggregator: AggregatorConfig::default(),
            confidence: ConfidenceConfig::default(),
            staleness: Vec::new(),
            features: FeatureConfig::default(),
            readiness: ReadinessConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse pipeline config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            "pipeline config loaded"
        );

        Ok(config)
    }

    /// Persist using an atomic write (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise pipeline config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "pipeline config saved (atomic)");
        Ok(())
    }

    /// Apply recognized `BOT_*` environment variables on top of the loaded
    /// configuration.
    pub fn apply_env(&mut self) {
        if let Ok(syms) = std::env::var("BOT_SYMBOLS") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.symbols = parsed;
            }
        }

        // BOT_KLINE_TF is the preferred name; BOT_KLINE_INTERVALS is accepted
        // as an alias.
        let tfs = std::env::var("BOT_KLINE_TF").or_else(|_| std::env::var("BOT_KLINE_INTERVALS"));
        if let Ok(tfs) = tfs {
            let parsed: Vec<String> = tfs
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.kline_tfs = parsed;
            }
        }

        if let Ok(limit) = std::env::var("BOT_KLINE_LIMIT") {
            if let Ok(n) = limit.trim().parse::<usize>() {
                self.kline_limit = n;
            }
        }

        if let Ok(mt) = std::env::var("BOT_TARGET_MARKET_TYPE") {
            self.target_market_type = match mt.trim().to_lowercase().as_str() {
                "spot" => Some(MarketType::Spot),
                "futures" => Some(MarketType::Futures),
                _ => None,
            };
        }

        if let Ok(depth) = std::env::var("BOT_ORDERBOOK_DEPTH") {
            if let Ok(n) = depth.trim().parse::<usize>() {
                self.orderbook_depth = n;
            }
        }

        apply_env_bool("BOT_TRADES_ENABLED", &mut self.trades_enabled);
        apply_env_bool("BOT_ORDERBOOK_ENABLED", &mut self.orderbook_enabled);
        apply_env_bool("BOT_OI_ENABLED", &mut self.oi_enabled);
        apply_env_bool("BOT_FUNDING_ENABLED", &mut self.funding_enabled);
        apply_env_bool("BOT_LIQUIDATIONS_ENABLED", &mut self.liquidations_enabled);
        apply_env_bool("BOT_KLINES_ENABLED", &mut self.klines_enabled);
        apply_env_bool("BOT_SPOT_ENABLED", &mut self.spot_enabled);
        apply_env_bool("BOT_CVD_DEBUG", &mut self.cvd_debug);
        apply_env_bool("BOT_FLOW_DEBUG", &mut self.flow_debug);
        apply_env_bool("BOT_READINESS_DEBUG", &mut self.readiness_debug);
        apply_env_bool("BOT_GAP_DEBUG", &mut self.gap_debug);
    }

    /// Expected sources for a block resolved by rule specificity:
    /// symbol+market > symbol > market > bare block rule.
    pub fn expected_sources(
        &self,
        block: Block,
        symbol: &str,
        market_type: MarketType,
    ) -> Option<Vec<String>> {
        let rules = &self.confidence.expected_sources;

        let matching = |want_symbol: bool, want_market: bool| {
            rules.iter().find(|r| {
                r.block == block
                    && (if want_symbol {
                        r.symbol.as_deref() == Some(symbol)
                    } else {
                        r.symbol.is_none()
                    })
                    && (if want_market {
                        r.market_type == Some(market_type)
                    } else {
                        r.market_type.is_none()
                    })
            })
        };

        matching(true, true)
            .or_else(|| matching(true, false))
            .or_else(|| matching(false, true))
            .or_else(|| matching(false, false))
            .map(|r| r.sources.clone())
    }
}

fn apply_env_bool(name: &str, target: &mut bool) {
    if let Ok(v) = std::env::var(name) {
        match v.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => *target = true,
            "0" | "false" | "no" | "off" => *target = false,
            _ => {}
        }
    }
}
