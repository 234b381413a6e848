// =============================================================================
// Feature Engines - per-symbol rolling features from ticker and kline paths
// =============================================================================
//
// Two engines with distinct topics and warmup rules:
//
//   - TickerFeatureEngine: rolling price window per symbol, dual-throttled
//     emission on `analytics:features`, one-shot `analytics:ready`
//     (reason `tickerWarmup`) per symbol
//   - KlineFeatureEngine: EMA / RSI / ATR per (symbol, tf) from closed
//     candles, one-shot `analytics:ready` (reason `klineWarmup`) per
//     (symbol, tf)

pub mod kline;
pub mod ticker;

pub use kline::KlineFeatureEngine;
pub use ticker::TickerFeatureEngine;
