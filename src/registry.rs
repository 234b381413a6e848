// =============================================================================
// Source Registry - expected vs. seen sources per (symbol, market, block)
// =============================================================================
//
// The registry is shared read-write, but every write path goes through a
// single owning component per (symbol, market type), so there is no
// contention beyond the lock itself. Readers (readiness, confidence) only
// take point-in-time counts.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::meta::TsMillis;
use crate::types::{Block, MarketType};

/// Whether a source feeds the aggregated path or the raw path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Agg,
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ScopeKey {
    symbol: String,
    market_type: MarketType,
    block: Block,
}

#[derive(Debug, Default)]
struct Scope {
    expected: BTreeSet<String>,
    /// source -> (kind, last observation time)
    seen: BTreeMap<String, (SourceKind, TsMillis)>,
}

/// Tracks which sources are expected and which have actually been observed,
/// per (symbol, market type, block).
#[derive(Debug, Default)]
pub struct SourceRegistry {
    scopes: RwLock<HashMap<ScopeKey, Scope>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the expected source set for a scope (replaces any previous
    /// declaration).
    pub fn set_expected(
        &self,
        symbol: &str,
        market_type: MarketType,
        block: Block,
        sources: impl IntoIterator<Item = String>,
    ) {
        let key = ScopeKey {
            symbol: symbol.to_string(),
            market_type,
            block,
        };
        let mut scopes = self.scopes.write();
        scopes.entry(key).or_default().expected = sources.into_iter().collect();
    }

    /// Record an observation of `source` at `now`. Creates the scope on first
    /// observation.
    pub fn mark_seen(
        &self,
        symbol: &str,
        market_type: MarketType,
        block: Block,
        source: &str,
        kind: SourceKind,
        now: TsMillis,
    ) {
        let key = ScopeKey {
            symbol: symbol.to_string(),
            market_type,
            block,
        };
        let mut scopes = self.scopes.write();
        scopes
            .entry(key)
            .or_default()
            .seen
            .insert(source.to_string(), (kind, now));
    }

    /// Number of expected sources for a scope (0 when undeclared).
    pub fn expected_count(&self, symbol: &str, market_type: MarketType, block: Block) -> usize {
        let key = ScopeKey {
            symbol: symbol.to_string(),
            market_type,
            block,
        };
        self.scopes.read().get(&key).map_or(0, |s| s.expected.len())
    }

    /// Sources of `kind` observed within `ttl_ms` of `now`.
    pub fn active_count(
        &self,
        symbol: &str,
        market_type: MarketType,
        block: Block,
        kind: SourceKind,
        ttl_ms: i64,
        now: TsMillis,
    ) -> usize {
        let key = ScopeKey {
            symbol: symbol.to_string(),
            market_type,
            block,
        };
        self.scopes.read().get(&key).map_or(0, |s| {
            s.seen
                .values()
                .filter(|(k, ts)| *k == kind && now.delta_ms(*ts) <= ttl_ms)
                .count()
        })
    }

    /// Expected sources with no observation within `ttl_ms` of `now`.
    pub fn missing(
        &self,
        symbol: &str,
        market_type: MarketType,
        block: Block,
        ttl_ms: i64,
        now: TsMillis,
    ) -> Vec<String> {
        let key = ScopeKey {
            symbol: symbol.to_string(),
            market_type,
            block,
        };
        let scopes = self.scopes.read();
        let Some(scope) = scopes.get(&key) else {
            return Vec::new();
        };

        scope
            .expected
            .iter()
            .filter(|source| match scope.seen.get(*source) {
                Some((_, ts)) => now.delta_ms(*ts) > ttl_ms,
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Drop all observations for `symbol` (e.g. on disconnect-driven reset).
    pub fn clear_seen(&self, symbol: &str) {
        let mut scopes = self.scopes.write();
        for (key, scope) in scopes.iter_mut() {
            if key.symbol == symbol {
                scope.seen.clear();
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_and_seen_counts() {
        let reg = SourceRegistry::new();
        reg.set_expected(
            "BTCUSDT",
            MarketType::Futures,
            Block::Price,
            ["binance:mark:futures".to_string(), "bybit:mark:futures".to_string()],
        );

        assert_eq!(reg.expected_count("BTCUSDT", MarketType::Futures, Block::Price), 2);
        assert_eq!(
            reg.active_count(
                "BTCUSDT",
                MarketType::Futures,
                Block::Price,
                SourceKind::Raw,
                5_000,
                TsMillis(10_000)
            ),
            0
        );

        reg.mark_seen(
            "BTCUSDT",
            MarketType::Futures,
            Block::Price,
            "binance:mark:futures",
            SourceKind::Raw,
            TsMillis(9_000),
        );

        assert_eq!(
            reg.active_count(
                "BTCUSDT",
                MarketType::Futures,
                Block::Price,
                SourceKind::Raw,
                5_000,
                TsMillis(10_000)
            ),
            1
        );
    }

    #[test]
    fn stale_observations_do_not_count_as_active() {
        let reg = SourceRegistry::new();
        reg.mark_seen(
            "BTCUSDT",
            MarketType::Spot,
            Block::Flow,
            "binance:trade:spot",
            SourceKind::Agg,
            TsMillis(1_000),
        );

        assert_eq!(
            reg.active_count(
                "BTCUSDT",
                MarketType::Spot,
                Block::Flow,
                SourceKind::Agg,
                5_000,
                TsMillis(2_000)
            ),
            1
        );
        assert_eq!(
            reg.active_count(
                "BTCUSDT",
                MarketType::Spot,
                Block::Flow,
                SourceKind::Agg,
                5_000,
                TsMillis(20_000)
            ),
            0
        );
    }

    #[test]
    fn missing_lists_unseen_and_stale_expected_sources() {
        let reg = SourceRegistry::new();
        reg.set_expected(
            "ETHUSDT",
            MarketType::Spot,
            Block::Liquidity,
            ["binance:books:spot".to_string(), "okx:books:spot".to_string()],
        );
        reg.mark_seen(
            "ETHUSDT",
            MarketType::Spot,
            Block::Liquidity,
            "binance:books:spot",
            SourceKind::Raw,
            TsMillis(1_000),
        );

        let missing = reg.missing("ETHUSDT", MarketType::Spot, Block::Liquidity, 5_000, TsMillis(2_000));
        assert_eq!(missing, vec!["okx:books:spot"]);

        // Once the seen source goes stale it is missing too.
        let missing = reg.missing("ETHUSDT", MarketType::Spot, Block::Liquidity, 5_000, TsMillis(60_000));
        assert_eq!(missing, vec!["binance:books:spot", "okx:books:spot"]);
    }

    #[test]
    fn clear_seen_scoped_by_symbol() {
        let reg = SourceRegistry::new();
        reg.mark_seen(
            "BTCUSDT",
            MarketType::Spot,
            Block::Flow,
            "s1",
            SourceKind::Raw,
            TsMillis(1_000),
        );
        reg.mark_seen(
            "ETHUSDT",
            MarketType::Spot,
            Block::Flow,
            "s1",
            SourceKind::Raw,
            TsMillis(1_000),
        );

        reg.clear_seen("BTCUSDT");

        assert_eq!(
            reg.active_count("BTCUSDT", MarketType::Spot, Block::Flow, SourceKind::Raw, 5_000, TsMillis(1_500)),
            0
        );
        assert_eq!(
            reg.active_count("ETHUSDT", MarketType::Spot, Block::Flow, SourceKind::Raw, 5_000, TsMillis(1_500)),
            1
        );
    }
}
