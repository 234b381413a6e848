// =============================================================================
// Kline Feature Engine - EMA / RSI / ATR per (symbol, tf)
// =============================================================================
//
// Incremental indicator state per (symbol, tf), fed by closed candles only:
//
//   EMA: seeded with the SMA of the first `period` closes, then
//        `close * k + prev * (1 - k)` with `k = 2 / (period + 1)`
//   RSI: average gain/loss seeded over the first `period` deltas, then
//        Wilder smoothing `avg = (avg * (period - 1) + current) / period`
//   ATR: true range seeded the same way, same smoothing scheme
//
// Warmup is `max(ema_slow, rsi_period + 1, atr_period + 1)` closed candles;
// the first warmup emits one `analytics:ready` per (symbol, tf) with reason
// `klineWarmup`. Features go out on `analytics:kline_features` per closed
// candle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::bus::EventBus;
use crate::config::FeatureConfig;
use crate::events::{AnalyticsReadyEvent, KlineEvent, KlineFeaturesEvent};
use crate::meta::{Clock, EventMeta};
use crate::topics;

// =============================================================================
// Incremental indicators
// =============================================================================

#[derive(Debug)]
struct EmaState {
    period: usize,
    count: usize,
    seed_sum: f64,
    value: Option<f64>,
}

impl EmaState {
    fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            count: 0,
            seed_sum: 0.0,
            value: None,
        }
    }

    fn update(&mut self, close: f64) -> Option<f64> {
        self.count += 1;
        match self.value {
            None => {
                self.seed_sum += close;
                if self.count >= self.period {
                    self.value = Some(self.seed_sum / self.period as f64);
                }
            }
            Some(prev) => {
                let k = 2.0 / (self.period as f64 + 1.0);
                self.value = Some(close * k + prev * (1.0 - k));
            }
        }
        self.value
    }
}

#[derive(Debug)]
struct RsiState {
    period: usize,
    prev_close: Option<f64>,
    deltas_seen: usize,
    gain_sum: f64,
    loss_sum: f64,
    avg_gain: Option<f64>,
    avg_loss: Option<f64>,
}

impl RsiState {
    fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            deltas_seen: 0,
            gain_sum: 0.0,
            loss_sum: 0.0,
            avg_gain: None,
            avg_loss: None,
        }
    }

    fn update(&mut self, close: f64) -> Option<f64> {
        let prev = match self.prev_close.replace(close) {
            Some(prev) => prev,
            None => return None,
        };

        let delta = close - prev;
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        self.deltas_seen += 1;

        match (self.avg_gain, self.avg_loss) {
            (Some(ag), Some(al)) => {
                let p = self.period as f64;
                self.avg_gain = Some((ag * (p - 1.0) + gain) / p);
                self.avg_loss = Some((al * (p - 1.0) + loss) / p);
            }
            _ => {
                self.gain_sum += gain;
                self.loss_sum += loss;
                if self.deltas_seen >= self.period {
                    self.avg_gain = Some(self.gain_sum / self.period as f64);
                    self.avg_loss = Some(self.loss_sum / self.period as f64);
                }
            }
        }

        match (self.avg_gain, self.avg_loss) {
            (Some(ag), Some(al)) => {
                if al == 0.0 {
                    Some(100.0)
                } else {
                    let rs = ag / al;
                    Some(100.0 - 100.0 / (1.0 + rs))
                }
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
struct AtrState {
    period: usize,
    prev_close: Option<f64>,
    trs_seen: usize,
    tr_sum: f64,
    value: Option<f64>,
}

impl AtrState {
    fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            trs_seen: 0,
            tr_sum: 0.0,
            value: None,
        }
    }

    fn update(&mut self, high: f64, low: f64, close: f64) -> Option<f64> {
        let tr = match self.prev_close {
            Some(pc) => (high - low).max((high - pc).abs()).max((low - pc).abs()),
            None => high - low,
        };
        self.prev_close = Some(close);
        self.trs_seen += 1;

        match self.value {
            Some(prev) => {
                let p = self.period as f64;
                self.value = Some((prev * (p - 1.0) + tr) / p);
            }
            None => {
                self.tr_sum += tr;
                if self.trs_seen >= self.period {
                    self.value = Some(self.tr_sum / self.period as f64);
                }
            }
        }
        self.value
    }
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Debug)]
struct SeriesState {
    ema_fast: EmaState,
    ema_slow: EmaState,
    rsi: RsiState,
    atr: AtrState,
    closed_candles: usize,
    ready_emitted: bool,
}

impl SeriesState {
    fn new(config: &FeatureConfig) -> Self {
        Self {
            ema_fast: EmaState::new(config.ema_fast),
            ema_slow: EmaState::new(config.ema_slow),
            rsi: RsiState::new(config.rsi_period),
            atr: AtrState::new(config.atr_period),
            closed_candles: 0,
            ready_emitted: false,
        }
    }
}

pub struct KlineFeatureEngine {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: FeatureConfig,
    state: Mutex<HashMap<(String, String), SeriesState>>,
}

impl KlineFeatureEngine {
    pub fn new(bus: Arc<EventBus>, clock: Arc<dyn Clock>, config: FeatureConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            clock,
            config,
            state: Mutex::new(HashMap::new()),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let engine = self.clone();
        self.bus.subscribe(topics::MARKET_KLINE, move |kline| {
            engine.on_kline(kline);
            Ok(())
        });
    }

    /// Closed candles needed before the series counts as warmed up.
    fn warmup_candles(&self) -> usize {
        self.config
            .ema_slow
            .max(self.config.rsi_period + 1)
            .max(self.config.atr_period + 1)
    }

    fn on_kline(&self, kline: &KlineEvent) {
        if !kline.closed {
            return;
        }

        let key = (kline.symbol.clone(), kline.tf.clone());
        let mut state = self.state.lock();
        let entry = state
            .entry(key)
            .or_insert_with(|| SeriesState::new(&self.config));

        entry.closed_candles += 1;
        let ema_fast = entry.ema_fast.update(kline.close);
        let prev_slow = entry.ema_slow.value;
        let ema_slow = entry.ema_slow.update(kline.close);
        let ema_slow_slope = match (prev_slow, ema_slow) {
            (Some(prev), Some(now)) => Some(now - prev),
            _ => None,
        };
        let rsi = entry.rsi.update(kline.close);
        let atr = entry.atr.update(kline.high, kline.low, kline.close);

        let warmed_up = entry.closed_candles >= self.warmup_candles();
        let first_ready = warmed_up && !entry.ready_emitted;
        if first_ready {
            entry.ready_emitted = true;
        }
        drop(state);

        if first_ready {
            info!(symbol = %kline.symbol, tf = %kline.tf, "kline features warmed up");
            let ready = AnalyticsReadyEvent {
                meta: EventMeta::inherit(&kline.meta, "kline-features", self.clock.now_ms()),
                symbol: kline.symbol.clone(),
                reason: "klineWarmup".to_string(),
                tf: Some(kline.tf.clone()),
                ready_tfs: None,
            };
            self.bus.publish(topics::ANALYTICS_READY, &ready);
        }

        let atr_pct = match atr {
            Some(atr) if kline.close != 0.0 => Some(atr / kline.close),
            _ => None,
        };

        let event = KlineFeaturesEvent {
            meta: EventMeta::inherit(&kline.meta, "kline-features", self.clock.now_ms())
                .at(kline.end_ts),
            symbol: kline.symbol.clone(),
            tf: kline.tf.clone(),
            close: kline.close,
            warmed_up,
            ema_fast,
            ema_slow,
            ema_slow_slope,
            rsi,
            atr,
            atr_pct,
        };
        self.bus.publish(topics::ANALYTICS_KLINE_FEATURES, &event);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ManualClock, StreamId, TsMillis};
    use crate::types::MarketType;
    use parking_lot::Mutex as PMutex;

    fn kline(symbol: &str, tf: &str, close: f64, i: i64, closed: bool) -> KlineEvent {
        let stream_id = StreamId::from("binance:kline:spot");
        let start = i * 60_000;
        KlineEvent {
            meta: EventMeta::new("binance", TsMillis(start + 60_000))
                .at(TsMillis(start + 60_000))
                .with_stream(stream_id.clone()),
            symbol: symbol.to_string(),
            market_type: MarketType::Spot,
            stream_id,
            tf: tf.to_string(),
            start_ts: TsMillis(start),
            end_ts: TsMillis(start + 59_999),
            open: close - 1.0,
            high: close + 2.0,
            low: close - 2.0,
            close,
            volume: 10.0,
            quote_volume: None,
            closed,
            bootstrap: false,
        }
    }

    fn setup(
        config: FeatureConfig,
    ) -> (
        Arc<EventBus>,
        Arc<PMutex<Vec<KlineFeaturesEvent>>>,
        Arc<PMutex<Vec<AnalyticsReadyEvent>>>,
    ) {
        let bus = Arc::new(EventBus::new());
        let clock = Arc::new(ManualClock::new(0));
        let engine = KlineFeatureEngine::new(bus.clone(), clock, config);
        engine.start();

        let features = Arc::new(PMutex::new(Vec::new()));
        let f = features.clone();
        bus.subscribe(topics::ANALYTICS_KLINE_FEATURES, move |e| {
            f.lock().push(e.clone());
            Ok(())
        });

        let ready = Arc::new(PMutex::new(Vec::new()));
        let r = ready.clone();
        bus.subscribe(topics::ANALYTICS_READY, move |e| {
            r.lock().push(e.clone());
            Ok(())
        });
        (bus, features, ready)
    }

    fn small_config() -> FeatureConfig {
        FeatureConfig {
            ema_fast: 3,
            ema_slow: 5,
            rsi_period: 3,
            atr_period: 3,
            ..FeatureConfig::default()
        }
    }

    #[test]
    fn unclosed_candles_are_ignored() {
        let (bus, features, _ready) = setup(small_config());
        bus.publish(topics::MARKET_KLINE, &kline("BTCUSDT", "1m", 100.0, 0, false));
        assert!(features.lock().is_empty());
    }

    #[test]
    fn ema_seeds_with_sma_then_smooths() {
        let (bus, features, _ready) = setup(small_config());

        for (i, close) in [2.0, 4.0, 6.0, 8.0].iter().enumerate() {
            bus.publish(topics::MARKET_KLINE, &kline("BTCUSDT", "1m", *close, i as i64, true));
        }

        let features = features.lock();
        assert_eq!(features[1].ema_fast, None);
        // SMA seed of first 3 closes: (2 + 4 + 6) / 3 = 4.
        assert_eq!(features[2].ema_fast, Some(4.0));
        // Next: 8 * 0.5 + 4 * 0.5 = 6 with k = 2/(3+1).
        assert_eq!(features[3].ema_fast, Some(6.0));
    }

    #[test]
    fn rsi_is_100_on_monotonic_gains() {
        let (bus, features, _ready) = setup(small_config());

        for i in 0..6 {
            bus.publish(
                topics::MARKET_KLINE,
                &kline("BTCUSDT", "1m", 100.0 + i as f64, i, true),
            );
        }

        let features = features.lock();
        let rsi = features.last().unwrap().rsi.unwrap();
        assert_eq!(rsi, 100.0);
    }

    #[test]
    fn warmup_ready_fires_once_per_symbol_tf() {
        let (bus, _features, ready) = setup(small_config());
        // warmup = max(5, 4, 4) = 5 closed candles.

        for i in 0..8 {
            bus.publish(
                topics::MARKET_KLINE,
                &kline("BTCUSDT", "1m", 100.0 + i as f64, i, true),
            );
        }
        for i in 0..8 {
            bus.publish(
                topics::MARKET_KLINE,
                &kline("BTCUSDT", "5m", 100.0 + i as f64, i, true),
            );
        }

        let ready = ready.lock();
        assert_eq!(ready.len(), 2);
        assert!(ready.iter().all(|r| r.reason == "klineWarmup"));
        let tfs: Vec<&str> = ready.iter().map(|r| r.tf.as_deref().unwrap()).collect();
        assert_eq!(tfs, vec!["1m", "5m"]);
    }

    #[test]
    fn warmed_up_flag_tracks_warmup_count() {
        let (bus, features, _ready) = setup(small_config());

        for i in 0..6 {
            bus.publish(
                topics::MARKET_KLINE,
                &kline("BTCUSDT", "1m", 100.0 + i as f64, i, true),
            );
        }

        let features = features.lock();
        assert!(!features[3].warmed_up);
        assert!(features[4].warmed_up);
        assert!(features[4].atr.is_some());
        assert!(features[4].rsi.is_some());
        assert!(features[4].ema_slow.is_some());
        assert!(features[5].atr_pct.is_some());
    }

    #[test]
    fn slope_of_slow_ema_appears_after_seed() {
        let (bus, features, _ready) = setup(small_config());

        for i in 0..7 {
            bus.publish(
                topics::MARKET_KLINE,
                &kline("BTCUSDT", "1m", 100.0 + i as f64 * 2.0, i, true),
            );
        }

        let features = features.lock();
        // Slope defined from the 6th candle on (first post-seed update).
        assert!(features[4].ema_slow_slope.is_none());
        let slope = features[5].ema_slow_slope.unwrap();
        assert!(slope > 0.0);
    }
}
