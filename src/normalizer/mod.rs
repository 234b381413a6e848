// =============================================================================
// Normalizer / Ingress - venue-native messages to normalized bus events
// =============================================================================
//
// One normalizer per venue (`binance`, `bybit`, `okx`). Each converts decoded
// venue messages into normalized events, enforcing the ingress invariants:
//
//   - known market type or drop with a warning, never coerce
//   - `stream_id` attached and mirrored into the meta envelope
//   - `ts_event` from venue time when present, otherwise the ingest clock;
//     `ts_ingest` always the local receive time
//   - orderbook sequences coerced from whichever field the venue uses
//     (`seqId`, `seq`, `lastUpdateId`, `u`)
//   - real sequence gaps publish `market:resync_requested` with reason `gap`
//     and the last observed sequence

pub mod binance;
pub mod bybit;
pub mod okx;

use std::collections::HashMap;

use crate::meta::{StreamId, TsMillis};

pub use binance::BinanceNormalizer;
pub use bybit::BybitNormalizer;
pub use okx::OkxNormalizer;

/// Parse a JSON value that may be a number or a numeric string (venues mix
/// both freely).
pub(crate) fn parse_f64(val: &serde_json::Value) -> Option<f64> {
    match val {
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

pub(crate) fn parse_u64(val: &serde_json::Value) -> Option<u64> {
    match val {
        serde_json::Value::String(s) => s.parse::<u64>().ok(),
        serde_json::Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

pub(crate) fn parse_i64(val: &serde_json::Value) -> Option<i64> {
    match val {
        serde_json::Value::String(s) => s.parse::<i64>().ok(),
        serde_json::Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// Coerce an orderbook sequence from the alternative field names venues use.
/// Field preference follows the order given, so each venue can document its
/// snapshot/delta convention by listing the explicit field first.
pub(crate) fn coerce_sequence(obj: &serde_json::Value, fields: &[&str]) -> Option<u64> {
    fields.iter().find_map(|f| obj.get(*f).and_then(parse_u64))
}

/// Map a venue symbol to the canonical symbol: uppercase, separators removed,
/// perpetual suffixes stripped (`BTC-USDT-SWAP` -> `BTCUSDT`).
pub(crate) fn canonical_symbol(venue_symbol: &str) -> String {
    let upper = venue_symbol.to_uppercase();
    let trimmed = upper.strip_suffix("-SWAP").unwrap_or(&upper);
    trimmed.replace(['-', '_', '/'], "")
}

/// Parse a `[price, size]` JSON pair into a book level.
pub(crate) fn parse_level(val: &serde_json::Value) -> Option<crate::events::BookLevel> {
    let price = val.get(0).and_then(parse_f64)?;
    let size = val.get(1).and_then(parse_f64)?;
    Some(crate::events::BookLevel { price, size })
}

pub(crate) fn parse_levels(val: &serde_json::Value) -> Vec<crate::events::BookLevel> {
    val.as_array()
        .map(|arr| arr.iter().filter_map(parse_level).collect())
        .unwrap_or_default()
}

// =============================================================================
// SequenceLedger
// =============================================================================

/// Outcome of checking a delta against the per-(stream, symbol) expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SeqCheck {
    /// First delta seen before any snapshot; nothing to compare against.
    Fresh,
    /// Contiguous with the previous update.
    Contiguous,
    /// A real gap: carries the last observed sequence.
    Gap { last_seen: u64 },
}

/// Tracks the last applied update id per (stream, symbol) so the normalizer
/// can distinguish real gaps from first contact.
#[derive(Debug, Default)]
pub(crate) struct SequenceLedger {
    last: HashMap<(StreamId, String), u64>,
}

impl SequenceLedger {
    /// Record a snapshot's update id as the new baseline.
    pub fn apply_snapshot(&mut self, stream_id: &StreamId, symbol: &str, update_id: u64) {
        self.last
            .insert((stream_id.clone(), symbol.to_string()), update_id);
    }

    /// Check a delta. `prev_id` is the venue's explicit previous-update
    /// chaining field when it has one; otherwise contiguity is judged from
    /// `first_id` against the last applied id.
    pub fn check_delta(
        &mut self,
        stream_id: &StreamId,
        symbol: &str,
        first_id: Option<u64>,
        prev_id: Option<u64>,
        update_id: u64,
    ) -> SeqCheck {
        let key = (stream_id.clone(), symbol.to_string());
        let result = match self.last.get(&key) {
            None => SeqCheck::Fresh,
            Some(&last_seen) => {
                let contiguous = match (prev_id, first_id) {
                    // Explicit chaining: the delta names its predecessor.
                    (Some(prev), _) => prev == last_seen,
                    // Range style: the delta must cover last_seen + 1.
                    (None, Some(first)) => first <= last_seen + 1 && update_id > last_seen,
                    // No sequencing info at all; accept.
                    (None, None) => true,
                };
                if contiguous {
                    SeqCheck::Contiguous
                } else {
                    SeqCheck::Gap { last_seen }
                }
            }
        };

        // Track the newest id regardless of outcome so a later resync has the
        // correct reference point.
        self.last.insert(key, update_id);
        result
    }

    /// Forget all symbols of a stream (on disconnect).
    pub fn reset_stream(&mut self, stream_id: &StreamId) {
        self.last.retain(|(s, _), _| s != stream_id);
    }

    pub fn last_seen(&self, stream_id: &StreamId, symbol: &str) -> Option<u64> {
        self.last
            .get(&(stream_id.clone(), symbol.to_string()))
            .copied()
    }
}

/// Venue event time when present, otherwise the ingest clock reading.
pub(crate) fn event_time(venue_ts: Option<i64>, now: TsMillis) -> TsMillis {
    venue_ts.map(TsMillis).unwrap_or(now)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_f64_accepts_string_and_number() {
        assert_eq!(parse_f64(&json!("37000.5")), Some(37000.5));
        assert_eq!(parse_f64(&json!(42)), Some(42.0));
        assert_eq!(parse_f64(&json!(null)), None);
        assert_eq!(parse_f64(&json!("abc")), None);
    }

    #[test]
    fn coerce_sequence_prefers_listed_order() {
        let msg = json!({ "seq": 5, "lastUpdateId": 9 });
        assert_eq!(coerce_sequence(&msg, &["seqId", "seq", "lastUpdateId"]), Some(5));
        assert_eq!(coerce_sequence(&msg, &["lastUpdateId", "seq"]), Some(9));
        assert_eq!(coerce_sequence(&msg, &["seqId"]), None);
    }

    #[test]
    fn canonical_symbol_strips_separators_and_swap() {
        assert_eq!(canonical_symbol("BTC-USDT-SWAP"), "BTCUSDT");
        assert_eq!(canonical_symbol("BTC-USDT"), "BTCUSDT");
        assert_eq!(canonical_symbol("btcusdt"), "BTCUSDT");
        assert_eq!(canonical_symbol("ETH_USDT"), "ETHUSDT");
    }

    #[test]
    fn parse_levels_skips_malformed_entries() {
        let levels = parse_levels(&json!([["100.5", "2.0"], ["bad"], ["101.0", "1.5"]]));
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].price, 100.5);
        assert_eq!(levels[1].size, 1.5);
    }

    #[test]
    fn ledger_fresh_then_contiguous_then_gap() {
        let mut ledger = SequenceLedger::default();
        let stream = StreamId::from("okx:books:futures");

        // First delta before any snapshot.
        assert_eq!(
            ledger.check_delta(&stream, "BTCUSDT", None, Some(0), 10),
            SeqCheck::Fresh
        );

        // Explicit chaining: prev matches last seen.
        assert_eq!(
            ledger.check_delta(&stream, "BTCUSDT", None, Some(10), 11),
            SeqCheck::Contiguous
        );

        // prev skips ahead: a real gap carrying the last observed id.
        assert_eq!(
            ledger.check_delta(&stream, "BTCUSDT", None, Some(15), 16),
            SeqCheck::Gap { last_seen: 11 }
        );
    }

    #[test]
    fn ledger_range_style_contiguity() {
        let mut ledger = SequenceLedger::default();
        let stream = StreamId::from("binance:depth:spot");
        ledger.apply_snapshot(&stream, "BTCUSDT", 100);

        // Covers 101: contiguous.
        assert_eq!(
            ledger.check_delta(&stream, "BTCUSDT", Some(95), None, 105),
            SeqCheck::Contiguous
        );

        // Starts past 106: gap.
        assert_eq!(
            ledger.check_delta(&stream, "BTCUSDT", Some(110), None, 120),
            SeqCheck::Gap { last_seen: 105 }
        );
    }

    #[test]
    fn ledger_reset_scoped_to_stream() {
        let mut ledger = SequenceLedger::default();
        let a = StreamId::from("binance:depth:spot");
        let b = StreamId::from("bybit:orderbook:spot");
        ledger.apply_snapshot(&a, "BTCUSDT", 1);
        ledger.apply_snapshot(&b, "BTCUSDT", 2);

        ledger.reset_stream(&a);
        assert_eq!(ledger.last_seen(&a, "BTCUSDT"), None);
        assert_eq!(ledger.last_seen(&b, "BTCUSDT"), Some(2));
    }

    #[test]
    fn event_time_falls_back_to_clock() {
        assert_eq!(event_time(Some(123), TsMillis(999)), TsMillis(123));
        assert_eq!(event_time(None, TsMillis(999)), TsMillis(999));
    }
}
