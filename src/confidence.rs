// =============================================================================
// Confidence Engine - per-block scores from freshness and quality penalties
// =============================================================================
//
// Four independent blocks: price, flow, liquidity, derivatives. For each
// block the base score is `fresh / expected` when the expected source count
// is known, else `fresh / (fresh + stale_dropped)`.
//
// Multiplicative penalties are applied in a fixed order:
//
//   mismatch x0.5, gap x0.7, sequence broken x0.5, lag x0.8, outlier x0.8
//
// followed by source-specific trust caps (the minimum participating cap,
// e.g. OKX_LIQUIDATIONS_LIMITED capping at 0.7) and a final clamp to [0, 1].
//
// Penalty flags decay: a noted anomaly stops penalizing once it is older
// than the penalty window.

use std::collections::HashMap;

use crate::config::ConfidenceConfig;
use crate::meta::TsMillis;
use crate::types::{Block, MarketType};

/// How long a noted anomaly keeps penalizing the block score.
pub const PENALTY_WINDOW_MS: i64 = 10_000;

#[derive(Debug, Default, Clone, Copy)]
struct PenaltyState {
    mismatch: Option<TsMillis>,
    gap: Option<TsMillis>,
    sequence_broken: Option<TsMillis>,
    lag: Option<TsMillis>,
    outlier: Option<TsMillis>,
}

impl PenaltyState {
    fn active(flag: Option<TsMillis>, now: TsMillis) -> bool {
        flag.is_some_and(|ts| now.delta_ms(ts) <= PENALTY_WINDOW_MS)
    }
}

/// Inputs for one block score computation.
#[derive(Debug, Clone, Default)]
pub struct BlockInputs {
    pub fresh: usize,
    /// Expected source count when declared; `None` falls back to the
    /// stale-ratio base.
    pub expected: Option<usize>,
    pub stale_dropped: usize,
    /// Trust caps of the sources participating in this block.
    pub source_caps: Vec<f64>,
}

#[derive(Debug)]
pub struct ConfidenceEngine {
    config: ConfidenceConfig,
    penalties: HashMap<(String, MarketType, Block), PenaltyState>,
}

impl ConfidenceEngine {
    pub fn new(config: ConfidenceConfig) -> Self {
        Self {
            config,
            penalties: HashMap::new(),
        }
    }

    fn entry(&mut self, symbol: &str, market: MarketType, block: Block) -> &mut PenaltyState {
        self.penalties
            .entry((symbol.to_string(), market, block))
            .or_default()
    }

    pub fn note_mismatch(&mut self, symbol: &str, market: MarketType, block: Block, now: TsMillis) {
        self.entry(symbol, market, block).mismatch = Some(now);
    }

    pub fn note_gap(&mut self, symbol: &str, market: MarketType, block: Block, now: TsMillis) {
        self.entry(symbol, market, block).gap = Some(now);
    }

    pub fn note_sequence_broken(
        &mut self,
        symbol: &str,
        market: MarketType,
        block: Block,
        now: TsMillis,
    ) {
        self.entry(symbol, market, block).sequence_broken = Some(now);
    }

    pub fn note_lag(&mut self, symbol: &str, market: MarketType, block: Block, now: TsMillis) {
        self.entry(symbol, market, block).lag = Some(now);
    }

    pub fn note_outlier(&mut self, symbol: &str, market: MarketType, block: Block, now: TsMillis) {
        self.entry(symbol, market, block).outlier = Some(now);
    }

    /// True when a sequence-broken flag is currently active for the block.
    pub fn sequence_broken(
        &self,
        symbol: &str,
        market: MarketType,
        block: Block,
        now: TsMillis,
    ) -> bool {
        self.penalties
            .get(&(symbol.to_string(), market, block))
            .is_some_and(|p| PenaltyState::active(p.sequence_broken, now))
    }

    /// True when a mismatch flag is currently active for the block.
    pub fn mismatch_active(
        &self,
        symbol: &str,
        market: MarketType,
        block: Block,
        now: TsMillis,
    ) -> bool {
        self.penalties
            .get(&(symbol.to_string(), market, block))
            .is_some_and(|p| PenaltyState::active(p.mismatch, now))
    }

    /// Compute the block confidence score and a human-readable explanation.
    pub fn compute(
        &self,
        symbol: &str,
        market: MarketType,
        block: Block,
        inputs: &BlockInputs,
        now: TsMillis,
    ) -> (f64, String) {
        let base = match inputs.expected {
            Some(expected) if expected > 0 => inputs.fresh as f64 / expected as f64,
            _ => {
                let denom = inputs.fresh + inputs.stale_dropped;
                if denom == 0 {
                    0.0
                } else {
                    inputs.fresh as f64 / denom as f64
                }
            }
        };

        let mut score = base;
        let mut explain = vec![format!("base={base:.2}")];

        let flags = self
            .penalties
            .get(&(symbol.to_string(), market, block))
            .copied()
            .unwrap_or_default();
        let p = &self.config.penalties;

        if PenaltyState::active(flags.mismatch, now) {
            score *= p.mismatch;
            explain.push(format!("mismatch x{}", p.mismatch));
        }
        if PenaltyState::active(flags.gap, now) {
            score *= p.gap;
            explain.push(format!("gap x{}", p.gap));
        }
        if PenaltyState::active(flags.sequence_broken, now) {
            score *= p.sequence_broken;
            explain.push(format!("seq x{}", p.sequence_broken));
        }
        if PenaltyState::active(flags.lag, now) {
            score *= p.lag;
            explain.push(format!("lag x{}", p.lag));
        }
        if PenaltyState::active(flags.outlier, now) {
            score *= p.outlier;
            explain.push(format!("outlier x{}", p.outlier));
        }

        // Final source cap: the lowest trust cap among participating sources.
        if let Some(cap) = inputs
            .source_caps
            .iter()
            .copied()
            .fold(None::<f64>, |acc, c| Some(acc.map_or(c, |a| a.min(c))))
        {
            if score > cap {
                score = cap;
                explain.push(format!("cap={cap}"));
            }
        }

        (score.clamp(0.0, 1.0), explain.join(" "))
    }

    /// Named trust cap lookup (`OKX_LIQUIDATIONS_LIMITED` -> 0.7).
    pub fn named_cap(&self, name: &str) -> Option<f64> {
        self.config.source_caps.get(name).copied()
    }
}
