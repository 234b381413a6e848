// =============================================================================
// Market Context & View Builders - regime classification and composition
// =============================================================================
//
// MarketContextBuilder classifies each warmed (symbol, tf) series on every
// kline feature update:
//
//   atr_pct >= high_vol_threshold                  -> storm (volatile)
//   ema_fast > ema_slow and slope(ema_slow) > 0    -> trend_bull
//   ema_fast < ema_slow and slope(ema_slow) < 0    -> trend_bear
//   otherwise                                      -> calm_range
//
// The macro regime across the configured macro tfs requires full agreement
// (all bull / all bear); storm dominates when any tf exceeds the threshold;
// anything mixed is calm_range. Once every macro tf has warmed up, a one-shot
// `analytics:ready` with reason `macroWarmup` and the sorted `ready_tfs` is
// emitted per symbol.
//
// MarketViewBuilder composes the latest canonical price, flow, liquidity and
// macro regime readings into `analytics:market_view`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::bus::EventBus;
use crate::config::FeatureConfig;
use crate::events::{
    AnalyticsReadyEvent, KlineFeaturesEvent, MarketContextEvent, MarketViewEvent, Regime,
    RegimeEvent, RegimeExplainEvent, RegimeV2,
};
use crate::meta::{Clock, EventMeta};
use crate::topics;

/// Classify one warmed series snapshot.
fn classify(
    features: &KlineFeaturesEvent,
    high_vol_threshold: f64,
) -> (Regime, RegimeV2) {
    let (Some(atr_pct), Some(ema_fast), Some(ema_slow)) =
        (features.atr_pct, features.ema_fast, features.ema_slow)
    else {
        return (Regime::Unknown, RegimeV2::CalmRange);
    };

    if atr_pct >= high_vol_threshold {
        return (Regime::Volatile, RegimeV2::Storm);
    }

    let slope = features.ema_slow_slope.unwrap_or(0.0);
    let regime_v2 = if ema_fast > ema_slow && slope > 0.0 {
        RegimeV2::TrendBull
    } else if ema_fast < ema_slow && slope < 0.0 {
        RegimeV2::TrendBear
    } else {
        RegimeV2::CalmRange
    };
    (Regime::Calm, regime_v2)
}

/// Macro verdict across per-tf classifications: storm dominates, trends need
/// unanimous agreement, anything else is calm_range.
fn macro_regime(per_tf: &BTreeMap<String, RegimeV2>) -> (Regime, RegimeV2) {
    if per_tf.values().any(|r| *r == RegimeV2::Storm) {
        return (Regime::Volatile, RegimeV2::Storm);
    }
    if !per_tf.is_empty() && per_tf.values().all(|r| *r == RegimeV2::TrendBull) {
        return (Regime::Calm, RegimeV2::TrendBull);
    }
    if !per_tf.is_empty() && per_tf.values().all(|r| *r == RegimeV2::TrendBear) {
        return (Regime::Calm, RegimeV2::TrendBear);
    }
    (Regime::Calm, RegimeV2::CalmRange)
}

#[derive(Debug, Default)]
struct SymbolContext {
    ready_tfs: BTreeSet<String>,
    macro_ready_emitted: bool,
    per_tf_regime: BTreeMap<String, RegimeV2>,
}

pub struct MarketContextBuilder {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: FeatureConfig,
    state: Mutex<HashMap<String, SymbolContext>>,
}

impl MarketContextBuilder {
    pub fn new(bus: Arc<EventBus>, clock: Arc<dyn Clock>, config: FeatureConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            clock,
            config,
            state: Mutex::new(HashMap::new()),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let builder = self.clone();
        self.bus.subscribe(topics::ANALYTICS_READY, move |ready| {
            builder.on_ready(ready);
            Ok(())
        });

        let builder = self.clone();
        self.bus
            .subscribe(topics::ANALYTICS_KLINE_FEATURES, move |features| {
                builder.on_kline_features(features);
                Ok(())
            });
    }

    fn on_ready(&self, ready: &AnalyticsReadyEvent) {
        if ready.reason != "klineWarmup" {
            return;
        }
        let Some(tf) = &ready.tf else {
            return;
        };

        let fire = {
            let mut state = self.state.lock();
            let entry = state.entry(ready.symbol.clone()).or_default();
            entry.ready_tfs.insert(tf.clone());

            let all_ready = self
                .config
                .macro_tfs
                .iter()
                .all(|tf| entry.ready_tfs.contains(tf));
            if all_ready && !entry.macro_ready_emitted {
                entry.macro_ready_emitted = true;
                let mut tfs: Vec<String> = entry.ready_tfs.iter().cloned().collect();
                tfs.sort();
                Some(tfs)
            } else {
                None
            }
        };

        if let Some(ready_tfs) = fire {
            info!(symbol = %ready.symbol, tfs = ?ready_tfs, "macro context warmed up");
            let event = AnalyticsReadyEvent {
                meta: EventMeta::inherit(&ready.meta, "context", self.clock.now_ms()),
                symbol: ready.symbol.clone(),
                reason: "macroWarmup".to_string(),
                tf: None,
                ready_tfs: Some(ready_tfs),
            };
            self.bus.publish(topics::ANALYTICS_READY, &event);
        }
    }

    fn on_kline_features(&self, features: &KlineFeaturesEvent) {
        if !features.warmed_up {
            return;
        }

        let (regime, regime_v2) = classify(features, self.config.high_vol_threshold);

        let context = MarketContextEvent {
            meta: EventMeta::inherit(&features.meta, "context", self.clock.now_ms()),
            symbol: features.symbol.clone(),
            tf: features.tf.clone(),
            regime,
            regime_v2,
            atr_pct: features.atr_pct,
            ema_fast: features.ema_fast,
            ema_slow: features.ema_slow,
        };
        self.bus.publish(topics::ANALYTICS_CONTEXT, &context);

        // Macro verdict once every configured macro tf has reported.
        if !self.config.macro_tfs.contains(&features.tf) {
            return;
        }
        let macro_verdict = {
            let mut state = self.state.lock();
            let entry = state.entry(features.symbol.clone()).or_default();
            entry.per_tf_regime.insert(features.tf.clone(), regime_v2);

            if self
                .config
                .macro_tfs
                .iter()
                .all(|tf| entry.per_tf_regime.contains_key(tf))
            {
                let per_tf: BTreeMap<String, RegimeV2> = self
                    .config
                    .macro_tfs
                    .iter()
                    .filter_map(|tf| entry.per_tf_regime.get(tf).map(|r| (tf.clone(), *r)))
                    .collect();
                Some(per_tf)
            } else {
                None
            }
        };

        if let Some(per_tf) = macro_verdict {
            let (regime, regime_v2) = macro_regime(&per_tf);
            let event = RegimeEvent {
                meta: EventMeta::inherit(&features.meta, "context", self.clock.now_ms()),
                symbol: features.symbol.clone(),
                regime,
                regime_v2,
                tfs: per_tf.keys().cloned().collect(),
            };
            self.bus.publish(topics::ANALYTICS_REGIME, &event);

            let explain = RegimeExplainEvent {
                meta: EventMeta::inherit(&features.meta, "context", self.clock.now_ms()),
                symbol: features.symbol.clone(),
                regime_v2,
                detail: per_tf
                    .iter()
                    .map(|(tf, r)| format!("{tf}={r}"))
                    .collect::<Vec<_>>()
                    .join(" "),
                per_tf,
            };
            self.bus.publish(topics::ANALYTICS_REGIME_EXPLAIN, &explain);
        }
    }
}

// =============================================================================
// MarketViewBuilder
// =============================================================================

#[derive(Debug, Default, Clone)]
struct SymbolView {
    price: Option<f64>,
    cvd: Option<f64>,
    spread: Option<f64>,
    imbalance: Option<f64>,
    regime: Option<Regime>,
    regime_v2: Option<RegimeV2>,
}

/// Composes micro (price, flow, liquidity) and macro (regime) readings into
/// `analytics:market_view` on every update.
pub struct MarketViewBuilder {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    state: Mutex<HashMap<String, SymbolView>>,
}

impl MarketViewBuilder {
    pub fn new(bus: Arc<EventBus>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            clock,
            state: Mutex::new(HashMap::new()),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let builder = self.clone();
        self.bus.subscribe(topics::MARKET_PRICE_CANONICAL, move |e| {
            builder.update(&e.symbol, &e.meta, |view| view.price = Some(e.price));
            Ok(())
        });

        let builder = self.clone();
        self.bus.subscribe(topics::ANALYTICS_FLOW, move |e| {
            builder.update(&e.symbol, &e.meta, |view| view.cvd = Some(e.cvd));
            Ok(())
        });

        let builder = self.clone();
        self.bus.subscribe(topics::MARKET_LIQUIDITY_AGG, move |e| {
            builder.update(&e.symbol, &e.meta, |view| {
                view.spread = Some(e.spread);
                view.imbalance = Some(e.imbalance);
            });
            Ok(())
        });

        let builder = self.clone();
        self.bus.subscribe(topics::ANALYTICS_REGIME, move |e| {
            builder.update(&e.symbol, &e.meta, |view| {
                view.regime = Some(e.regime);
                view.regime_v2 = Some(e.regime_v2);
            });
            Ok(())
        });
    }

    fn update(&self, symbol: &str, parent: &EventMeta, apply: impl FnOnce(&mut SymbolView)) {
        let view = {
            let mut state = self.state.lock();
            let entry = state.entry(symbol.to_string()).or_default();
            apply(entry);
            entry.clone()
        };

        let event = MarketViewEvent {
            meta: EventMeta::inherit(parent, "market-view", self.clock.now_ms()),
            symbol: symbol.to_string(),
            price: view.price,
            cvd: view.cvd,
            spread: view.spread,
            imbalance: view.imbalance,
            regime: view.regime,
            regime_v2: view.regime_v2,
        };
        self.bus.publish(topics::ANALYTICS_MARKET_VIEW, &event);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ManualClock, TsMillis};
    use parking_lot::Mutex as PMutex;

    fn features(
        symbol: &str,
        tf: &str,
        ema_fast: f64,
        ema_slow: f64,
        slope: f64,
        atr_pct: f64,
    ) -> KlineFeaturesEvent {
        KlineFeaturesEvent {
            meta: EventMeta::new("kline-features", TsMillis(1_000)),
            symbol: symbol.to_string(),
            tf: tf.to_string(),
            close: 100.0,
            warmed_up: true,
            ema_fast: Some(ema_fast),
            ema_slow: Some(ema_slow),
            ema_slow_slope: Some(slope),
            rsi: Some(50.0),
            atr: Some(atr_pct * 100.0),
            atr_pct: Some(atr_pct),
        }
    }

    fn ready(symbol: &str, tf: &str) -> AnalyticsReadyEvent {
        AnalyticsReadyEvent {
            meta: EventMeta::new("kline-features", TsMillis(1_000)),
            symbol: symbol.to_string(),
            reason: "klineWarmup".to_string(),
            tf: Some(tf.to_string()),
            ready_tfs: None,
        }
    }

    fn setup(macro_tfs: &[&str]) -> (Arc<EventBus>, Arc<PMutex<Vec<AnalyticsReadyEvent>>>, Arc<PMutex<Vec<RegimeEvent>>>, Arc<PMutex<Vec<MarketContextEvent>>>) {
        let bus = Arc::new(EventBus::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let config = FeatureConfig {
            macro_tfs: macro_tfs.iter().map(|s| s.to_string()).collect(),
            high_vol_threshold: 0.02,
            ..FeatureConfig::default()
        };
        let builder = MarketContextBuilder::new(bus.clone(), clock, config);
        builder.start();

        let readies = Arc::new(PMutex::new(Vec::new()));
        let r = readies.clone();
        bus.subscribe(topics::ANALYTICS_READY, move |e| {
            if e.reason == "macroWarmup" {
                r.lock().push(e.clone());
            }
            Ok(())
        });

        let regimes = Arc::new(PMutex::new(Vec::new()));
        let rg = regimes.clone();
        bus.subscribe(topics::ANALYTICS_REGIME, move |e| {
            rg.lock().push(e.clone());
            Ok(())
        });

        let contexts = Arc::new(PMutex::new(Vec::new()));
        let c = contexts.clone();
        bus.subscribe(topics::ANALYTICS_CONTEXT, move |e| {
            c.lock().push(e.clone());
            Ok(())
        });

        (bus, readies, regimes, contexts)
    }

    #[test]
    fn storm_when_atr_exceeds_threshold() {
        let (bus, _readies, _regimes, contexts) = setup(&["1h"]);

        bus.publish(
            topics::ANALYTICS_KLINE_FEATURES,
            &features("BTCUSDT", "1h", 101.0, 100.0, 0.5, 0.05),
        );

        let contexts = contexts.lock();
        assert_eq!(contexts[0].regime_v2, RegimeV2::Storm);
        assert_eq!(contexts[0].regime, Regime::Volatile);
    }

    #[test]
    fn trend_rules_need_alignment_and_slope() {
        let (bus, _readies, _regimes, contexts) = setup(&["1h"]);

        // Fast above slow with positive slope: bull.
        bus.publish(
            topics::ANALYTICS_KLINE_FEATURES,
            &features("BTCUSDT", "1h", 101.0, 100.0, 0.5, 0.001),
        );
        // Fast below slow with negative slope: bear.
        bus.publish(
            topics::ANALYTICS_KLINE_FEATURES,
            &features("BTCUSDT", "1h", 99.0, 100.0, -0.5, 0.001),
        );
        // Fast above slow but slope negative: calm_range.
        bus.publish(
            topics::ANALYTICS_KLINE_FEATURES,
            &features("BTCUSDT", "1h", 101.0, 100.0, -0.5, 0.001),
        );

        let contexts = contexts.lock();
        assert_eq!(contexts[0].regime_v2, RegimeV2::TrendBull);
        assert_eq!(contexts[1].regime_v2, RegimeV2::TrendBear);
        assert_eq!(contexts[2].regime_v2, RegimeV2::CalmRange);
    }

    #[test]
    fn macro_ready_fires_once_when_all_tfs_ready() {
        let (bus, readies, _regimes, _contexts) = setup(&["1h", "4h"]);

        bus.publish(topics::ANALYTICS_READY, &ready("BTCUSDT", "1h"));
        assert!(readies.lock().is_empty());

        bus.publish(topics::ANALYTICS_READY, &ready("BTCUSDT", "4h"));
        {
            let readies = readies.lock();
            assert_eq!(readies.len(), 1);
            assert_eq!(readies[0].reason, "macroWarmup");
            assert_eq!(
                readies[0].ready_tfs.as_ref().unwrap(),
                &vec!["1h".to_string(), "4h".to_string()]
            );
        }

        // Duplicate warmups never re-fire.
        bus.publish(topics::ANALYTICS_READY, &ready("BTCUSDT", "1h"));
        assert_eq!(readies.lock().len(), 1);
    }

    #[test]
    fn macro_regime_requires_agreement() {
        let (bus, _readies, regimes, _contexts) = setup(&["1h", "4h"]);

        // Both bull: trend_bull.
        bus.publish(
            topics::ANALYTICS_KLINE_FEATURES,
            &features("BTCUSDT", "1h", 101.0, 100.0, 0.5, 0.001),
        );
        bus.publish(
            topics::ANALYTICS_KLINE_FEATURES,
            &features("BTCUSDT", "4h", 102.0, 100.0, 0.5, 0.001),
        );
        assert_eq!(regimes.lock().last().unwrap().regime_v2, RegimeV2::TrendBull);

        // 4h flips bear: mixed, calm_range.
        bus.publish(
            topics::ANALYTICS_KLINE_FEATURES,
            &features("BTCUSDT", "4h", 99.0, 100.0, -0.5, 0.001),
        );
        assert_eq!(regimes.lock().last().unwrap().regime_v2, RegimeV2::CalmRange);

        // Any storm dominates.
        bus.publish(
            topics::ANALYTICS_KLINE_FEATURES,
            &features("BTCUSDT", "1h", 101.0, 100.0, 0.5, 0.10),
        );
        assert_eq!(regimes.lock().last().unwrap().regime_v2, RegimeV2::Storm);
    }

    #[test]
    fn view_composes_latest_readings() {
        let bus = Arc::new(EventBus::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let builder = MarketViewBuilder::new(bus.clone(), clock);
        builder.start();

        let views = Arc::new(PMutex::new(Vec::new()));
        let v = views.clone();
        bus.subscribe(topics::ANALYTICS_MARKET_VIEW, move |e| {
            v.lock().push(e.clone());
            Ok(())
        });

        bus.publish(
            topics::ANALYTICS_FLOW,
            &crate::events::FlowEvent {
                meta: EventMeta::new("cvd", TsMillis(1_000)),
                symbol: "BTCUSDT".to_string(),
                market_type: crate::types::MarketType::Spot,
                cvd: 42.0,
                bucket_delta: 1.0,
                bucket_end_ts: TsMillis(1_000),
            },
        );

        let views_now = views.lock();
        assert_eq!(views_now.len(), 1);
        assert_eq!(views_now[0].cvd, Some(42.0));
        assert_eq!(views_now[0].price, None);
    }
}
