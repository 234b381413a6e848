// =============================================================================
// Ticker Feature Engine - rolling window features with dual throttle
// =============================================================================
//
// Maintains a bounded rolling window of prices per symbol (size
// `max(sma_period, window_size)`), computing:
//
//   return_1   = (p - p_prev) / p_prev
//   sma        = mean of the last `sma_period` prices
//   volatility = stddev of returns over the sma window
//   momentum   = (p - sma) / sma
//
// Emission is throttled by `min_emit_interval_ms` OR `max_ticks_before_emit`,
// whichever fires first, measured in event time so replayed sessions behave
// identically. The first readiness (`sample_count >= sma_period`) emits one
// `analytics:ready` per symbol with reason `tickerWarmup`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::bus::EventBus;
use crate::config::FeatureConfig;
use crate::events::{AnalyticsReadyEvent, TickerEvent, TickerFeaturesEvent};
use crate::meta::{Clock, EventMeta, TsMillis};
use crate::topics;

#[derive(Debug)]
struct SymbolFeatures {
    prices: VecDeque<f64>,
    sample_count: usize,
    ticks_since_emit: usize,
    last_emit_ts: Option<TsMillis>,
    ready_emitted: bool,
}

impl SymbolFeatures {
    fn new() -> Self {
        Self {
            prices: VecDeque::new(),
            sample_count: 0,
            ticks_since_emit: 0,
            last_emit_ts: None,
            ready_emitted: false,
        }
    }
}

pub struct TickerFeatureEngine {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: FeatureConfig,
    state: Mutex<HashMap<String, SymbolFeatures>>,
}

impl TickerFeatureEngine {
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
        self.bus.subscribe(topics::MARKET_TICKER, move |ticker| {
            engine.on_ticker(ticker);
            Ok(())
        });
    }

    fn on_ticker(&self, ticker: &TickerEvent) {
        let window_cap = self.config.sma_period.max(self.config.window_size).max(2);
        let ts = ticker.meta.ts_event;

        let mut state = self.state.lock();
        let entry = state
            .entry(ticker.symbol.clone())
            .or_insert_with(SymbolFeatures::new);

        let prev_price = entry.prices.back().copied();
        entry.prices.push_back(ticker.last_price);
        while entry.prices.len() > window_cap {
            entry.prices.pop_front();
        }
        entry.sample_count += 1;
        entry.ticks_since_emit += 1;

        let features_ready = entry.sample_count >= self.config.sma_period;
        let first_ready = features_ready && !entry.ready_emitted;
        if first_ready {
            entry.ready_emitted = true;
        }

        let should_emit = match entry.last_emit_ts {
            None => true,
            Some(last) => {
                ts.delta_ms(last) >= self.config.min_emit_interval_ms
                    || entry.ticks_since_emit >= self.config.max_ticks_before_emit
            }
        };

        let mut event = None;
        if should_emit {
            entry.last_emit_ts = Some(ts);
            entry.ticks_since_emit = 0;

            let (sma, volatility, momentum) = if features_ready {
                let prices: Vec<f64> = entry.prices.iter().copied().collect();
                let tail = &prices[prices.len() - self.config.sma_period..];
                let sma = tail.iter().sum::<f64>() / tail.len() as f64;

                let returns: Vec<f64> = tail
                    .windows(2)
                    .filter(|w| w[0] != 0.0)
                    .map(|w| (w[1] - w[0]) / w[0])
                    .collect();
                let volatility = stddev(&returns);

                let momentum = if sma != 0.0 {
                    Some((ticker.last_price - sma) / sma)
                } else {
                    None
                };
                (Some(sma), volatility, momentum)
            } else {
                (None, None, None)
            };

            let return_1 = prev_price
                .filter(|p| *p != 0.0)
                .map(|p| (ticker.last_price - p) / p);

            event = Some(TickerFeaturesEvent {
                // Event time follows the triggering tick so replay matches.
                meta: EventMeta::inherit(&ticker.meta, "ticker-features", self.clock.now_ms())
                    .at(ts),
                symbol: ticker.symbol.clone(),
                price: ticker.last_price,
                sample_count: entry.sample_count,
                features_ready,
                return_1,
                sma,
                sma_period: self.config.sma_period,
                volatility,
                momentum,
            });
        }
        drop(state);

        if first_ready {
            info!(symbol = %ticker.symbol, "ticker features warmed up");
            let ready = AnalyticsReadyEvent {
                meta: EventMeta::inherit(&ticker.meta, "ticker-features", self.clock.now_ms()),
                symbol: ticker.symbol.clone(),
                reason: "tickerWarmup".to_string(),
                tf: None,
                ready_tfs: None,
            };
            self.bus.publish(topics::ANALYTICS_READY, &ready);
        }

        if let Some(event) = event {
            self.bus.publish(topics::ANALYTICS_FEATURES, &event);
        }
    }
}

fn stddev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}
