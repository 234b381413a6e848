// =============================================================================
// Event Metadata - envelope, branded timestamps, injectable clock
// =============================================================================
//
// Every event on the bus carries an `EventMeta` envelope. `ts_event` is the
// authoritative time for bucketing and replay; `ts` mirrors it on creation and
// is only overridden by the replay runner, which sets it to the topic-specific
// authoritative time of the journaled record.
//
// Correlation ids are inherited when one event causes another. When the parent
// carries no correlation id, the parent's `ts_event` rendered as a string is
// used instead (retained for downstream trace-grouping back-compat; it is not
// globally unique).

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::types::MarketType;

// =============================================================================
// Branded primitives
// =============================================================================

/// Milliseconds since the Unix epoch, nominally UTC.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TsMillis(pub i64);

impl TsMillis {
    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// Saturating difference `self - other` in milliseconds.
    pub fn delta_ms(self, other: TsMillis) -> i64 {
        self.0.saturating_sub(other.0)
    }
}

impl std::fmt::Display for TsMillis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TsMillis {
    fn from(ms: i64) -> Self {
        Self(ms)
    }
}

/// Identifies a venue channel binding: venue + channel + market type.
///
/// Rendered as `venue:channel:market_type`, e.g. `binance:trade:spot`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub String);

impl StreamId {
    pub fn new(venue: &str, channel: &str, market_type: MarketType) -> Self {
        Self(format!("{venue}:{channel}:{market_type}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Venue segment of the stream id (everything before the first `:`).
    pub fn venue(&self) -> &str {
        self.0.split(':').next().unwrap_or(&self.0)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// EventMeta
// =============================================================================

/// Envelope attached to every event published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Component or venue that emitted this event.
    pub source: String,

    /// Authoritative event time (ms). Used for bucketing and replay ordering.
    pub ts_event: TsMillis,

    /// Back-compat alias of `ts_event`. Equal on creation; the replay runner
    /// overrides it with the record's topic-specific authoritative time.
    pub ts: TsMillis,

    /// Local receive time. Always set on normalized events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_ingest: Option<TsMillis>,

    /// Venue-provided time, when the venue supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_exchange: Option<TsMillis>,

    /// Per-stream sequence number after normalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,

    /// Stream identity. Must equal the payload `stream_id` on normalized
    /// market events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,

    /// Causality chain id, inherited across derived events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl EventMeta {
    /// Fresh envelope stamped at `now`. `ts_event`, `ts` and `ts_ingest` all
    /// start at `now`; override the event time with [`EventMeta::at`] when the
    /// venue supplies its own.
    pub fn new(source: impl Into<String>, now: TsMillis) -> Self {
        Self {
            source: source.into(),
            ts_event: now,
            ts: now,
            ts_ingest: Some(now),
            ts_exchange: None,
            sequence: None,
            stream_id: None,
            correlation_id: None,
        }
    }

    /// Set the authoritative event time (and its `ts` alias).
    pub fn at(mut self, ts_event: TsMillis) -> Self {
        self.ts_event = ts_event;
        self.ts = ts_event;
        self
    }

    pub fn with_exchange_time(mut self, ts: TsMillis) -> Self {
        self.ts_exchange = Some(ts);
        self
    }

    pub fn with_sequence(mut self, seq: u64) -> Self {
        self.sequence = Some(seq);
        self
    }

    pub fn with_stream(mut self, stream_id: StreamId) -> Self {
        self.stream_id = Some(stream_id);
        self
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Derive an envelope for an event caused by `parent`.
    ///
    /// Carries forward `ts_ingest`, `ts_exchange`, `sequence` and `stream_id`;
    /// preserves the parent correlation id or substitutes the parent's
    /// `ts_event` as a string when absent. `source` is reset to the emitting
    /// component and the event time is re-stamped at `now`.
    pub fn inherit(parent: &EventMeta, source: impl Into<String>, now: TsMillis) -> Self {
        let correlation_id = parent
            .correlation_id
            .clone()
            .unwrap_or_else(|| parent.ts_event.to_string());

        Self {
            source: source.into(),
            ts_event: now,
            ts: now,
            ts_ingest: parent.ts_ingest,
            ts_exchange: parent.ts_exchange,
            sequence: parent.sequence,
            stream_id: parent.stream_id.clone(),
            correlation_id: Some(correlation_id),
        }
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Injectable time source. Every engine with throttling or TTL logic takes a
/// clock so tests can drive time deterministically.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> TsMillis;
}

/// Wall clock (UTC).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> TsMillis {
        TsMillis(Utc::now().timestamp_millis())
    }
}

/// Manually-driven clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> TsMillis {
        TsMillis(self.now.load(Ordering::SeqCst))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_meta_stamps_event_and_ingest() {
        let meta = EventMeta::new("normalizer", TsMillis(1_700_000_000_000));
        assert_eq!(meta.ts_event, TsMillis(1_700_000_000_000));
        assert_eq!(meta.ts, meta.ts_event);
        assert_eq!(meta.ts_ingest, Some(TsMillis(1_700_000_000_000)));
        assert!(meta.correlation_id.is_none());
    }

    #[test]
    fn at_overrides_event_time_but_not_ingest() {
        let meta = EventMeta::new("normalizer", TsMillis(2_000)).at(TsMillis(1_500));
        assert_eq!(meta.ts_event, TsMillis(1_500));
        assert_eq!(meta.ts, TsMillis(1_500));
        assert_eq!(meta.ts_ingest, Some(TsMillis(2_000)));
    }

    #[test]
    fn inherit_preserves_correlation_id() {
        let parent = EventMeta::new("normalizer", TsMillis(1_000)).with_correlation("chain-1");
        let child = EventMeta::inherit(&parent, "aggregator", TsMillis(1_100));
        assert_eq!(child.correlation_id.as_deref(), Some("chain-1"));
        assert_eq!(child.source, "aggregator");
        assert_eq!(child.ts_event, TsMillis(1_100));
    }

    #[test]
    fn inherit_falls_back_to_parent_ts_event_string() {
        let parent = EventMeta::new("normalizer", TsMillis(1_234));
        let child = EventMeta::inherit(&parent, "aggregator", TsMillis(2_000));
        assert_eq!(child.correlation_id.as_deref(), Some("1234"));
    }

    #[test]
    fn inherit_carries_stream_and_sequence() {
        let stream = StreamId::new("binance", "trade", MarketType::Spot);
        let parent = EventMeta::new("normalizer", TsMillis(1_000))
            .with_stream(stream.clone())
            .with_sequence(42)
            .with_exchange_time(TsMillis(990));
        let child = EventMeta::inherit(&parent, "journal", TsMillis(1_001));
        assert_eq!(child.stream_id, Some(stream));
        assert_eq!(child.sequence, Some(42));
        assert_eq!(child.ts_exchange, Some(TsMillis(990)));
        assert_eq!(child.ts_ingest, Some(TsMillis(1_000)));
    }

    #[test]
    fn stream_id_format_and_venue() {
        let stream = StreamId::new("okx", "books", MarketType::Futures);
        assert_eq!(stream.as_str(), "okx:books:futures");
        assert_eq!(stream.venue(), "okx");
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_ms(), TsMillis(100));
        clock.advance(50);
        assert_eq!(clock.now_ms(), TsMillis(150));
        clock.set(1_000);
        assert_eq!(clock.now_ms(), TsMillis(1_000));
    }

    #[test]
    fn ts_serde_is_transparent() {
        let ts = TsMillis(1_700_000_000_123);
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "1700000000123");
        let back: TsMillis = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ts);
    }
}
