// =============================================================================
// Replay Runner - deterministic re-emission of journaled events
// =============================================================================
//
// Enumerates the journal partition for one (streamId, symbol, topic[, tf],
// runId), re-emitting each record's payload on its topic with
// `meta.source = "replay"` and `meta.ts` set to the topic's authoritative
// time:
//
//   klines    -> end_ts
//   trades    -> trade_ts
//   orderbook -> exchange_ts
//   others    -> meta.ts_event as journaled
//
// Files are visited in date order; records within a file are stable-sorted by
// seq as a safety net. Corrupt lines emit `replay:warning` and are skipped.
// Pacing: `max` emits back-to-back, `accelerated` sleeps the ingest delta
// divided by `speed_factor`, `realtime` sleeps the full delta.
//
// Writers always use the runId layout; when the requested runId directory is
// missing, the runner falls back to the legacy layout without the runId
// segment so historical data stays replayable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::events::*;
use crate::journal::{topic_dir, JournalRecord};
use crate::meta::{Clock, EventMeta, StreamId, TsMillis};
use crate::topics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayMode {
    Max,
    Accelerated,
    Realtime,
}

#[derive(Debug, Clone)]
pub struct ReplayRequest {
    pub stream_id: StreamId,
    pub symbol: String,
    pub run_id: String,
    pub topic: String,
    pub tf: Option<String>,
    /// Inclusive `YYYY-MM-DD` bounds on the partition files.
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub mode: ReplayMode,
    pub speed_factor: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayStats {
    pub emitted: u64,
    pub skipped: u64,
    pub per_topic: BTreeMap<String, u64>,
}

pub struct ReplayRunner {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    base_dir: PathBuf,
}

impl ReplayRunner {
    pub fn new(bus: Arc<EventBus>, clock: Arc<dyn Clock>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            bus,
            clock,
            base_dir: base_dir.into(),
        }
    }

    pub async fn run(&self, req: &ReplayRequest) -> Result<ReplayStats> {
        if topics::is_aggregated_topic(&req.topic) {
            let msg = format!("aggregated topic {} is not a replayable input", req.topic);
            self.emit_error(&msg);
            bail!(msg);
        }

        let dir = match self.resolve_dir(req) {
            Some(dir) => dir,
            None => {
                let msg = format!(
                    "no journal partition for {}/{}/{} (run {})",
                    req.stream_id, req.symbol, req.topic, req.run_id
                );
                self.emit_error(&msg);
                bail!(msg);
            }
        };

        let files = self.list_files(&dir, req).await?;
        info!(
            dir = %dir.display(),
            files = files.len(),
            topic = %req.topic,
            mode = ?req.mode,
            "replay starting"
        );

        let mut stats = ReplayStats::default();
        let mut prev_ingest: Option<TsMillis> = None;

        for file in files {
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("read journal file {}", file.display()))?;

            let mut records: Vec<(u64, JournalRecord)> = Vec::new();
            for (idx, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JournalRecord>(line) {
                    Ok(record) => records.push((idx as u64, record)),
                    Err(e) => {
                        stats.skipped += 1;
                        self.emit_warning(&file, idx as u64 + 1, &e.to_string());
                    }
                }
            }

            // Records are written in seq order; the stable sort is a safety
            // net against interleaved writers.
            records.sort_by_key(|(_, r)| r.seq);

            for (line_no, record) in records {
                self.pace(req, prev_ingest, record.ts_ingest).await;
                prev_ingest = Some(record.ts_ingest);

                match self.emit(&record) {
                    Ok(topic) => {
                        stats.emitted += 1;
                        *stats.per_topic.entry(topic).or_insert(0) += 1;
                    }
                    Err(e) => {
                        stats.skipped += 1;
                        self.emit_warning(&file, line_no + 1, &e.to_string());
                    }
                }
            }
        }

        let finished = ReplayFinished {
            meta: EventMeta::new("replay", self.clock.now_ms()),
            per_topic: stats.per_topic.clone(),
            records_emitted: stats.emitted,
            records_skipped: stats.skipped,
        };
        self.bus.publish(topics::REPLAY_FINISHED, &finished);
        info!(emitted = stats.emitted, skipped = stats.skipped, "replay finished");

        Ok(stats)
    }

    /// Resolve the partition directory, preferring the runId layout and
    /// falling back to the legacy layout (no runId segment).
    fn resolve_dir(&self, req: &ReplayRequest) -> Option<PathBuf> {
        let mut base = self
            .base_dir
            .join(req.stream_id.as_str())
            .join(&req.symbol)
            .join(topic_dir(&req.topic));
        if let Some(tf) = &req.tf {
            base = base.join(tf);
        }

        let with_run = base.join(&req.run_id);
        if with_run.is_dir() {
            return Some(with_run);
        }
        if base.is_dir() {
            warn!(
                run_id = %req.run_id,
                dir = %base.display(),
                "runId partition missing, replaying legacy layout"
            );
            return Some(base);
        }
        None
    }

    async fn list_files(&self, dir: &Path, req: &ReplayRequest) -> Result<Vec<PathBuf>> {
        let mut names: Vec<String> = Vec::new();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("read journal dir {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".jsonl") {
                continue;
            }
            let date = name.trim_end_matches(".jsonl");
            if let Some(from) = &req.date_from {
                if date < from.as_str() {
                    continue;
                }
            }
            if let Some(to) = &req.date_to {
                if date > to.as_str() {
                    continue;
                }
            }
            names.push(name);
        }

        // Lexicographic order is date order for ISO-dated filenames.
        names.sort();
        Ok(names.into_iter().map(|n| dir.join(n)).collect())
    }

    async fn pace(&self, req: &ReplayRequest, prev: Option<TsMillis>, next: TsMillis) {
        let Some(prev) = prev else {
            return;
        };
        let delta_ms = next.delta_ms(prev).max(0) as u64;
        let sleep_ms = match req.mode {
            ReplayMode::Max => 0,
            ReplayMode::Accelerated => {
                let factor = if req.speed_factor > 0.0 {
                    req.speed_factor
                } else {
                    1.0
                };
                (delta_ms as f64 / factor) as u64
            }
            ReplayMode::Realtime => delta_ms,
        };
        if sleep_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
        }
    }

    /// Deserialize and re-publish one record. Returns the topic emitted on.
    fn emit(&self, record: &JournalRecord) -> Result<String> {
        let topic = record.topic.as_str();
        let payload = record.payload.clone();

        match topic {
            "market:ticker" => {
                let mut ev: TickerEvent =
                    serde_json::from_value(payload).context("ticker payload")?;
                ev.meta.source = "replay".to_string();
                ev.meta.ts = ev.meta.ts_event;
                self.bus.publish(topics::MARKET_TICKER, &ev);
            }
            "market:kline" => {
                let mut ev: KlineEvent = serde_json::from_value(payload).context("kline payload")?;
                ev.meta.source = "replay".to_string();
                ev.meta.ts = ev.end_ts;
                self.bus.publish(topics::MARKET_KLINE, &ev);
            }
            "market:trade" => {
                let mut ev: TradeEvent = serde_json::from_value(payload).context("trade payload")?;
                ev.meta.source = "replay".to_string();
                ev.meta.ts = ev.trade_ts;
                self.bus.publish(topics::MARKET_TRADE, &ev);
            }
            "market:orderbook_l2_snapshot" => {
                let mut ev: OrderbookL2Snapshot =
                    serde_json::from_value(payload).context("orderbook snapshot payload")?;
                ev.meta.source = "replay".to_string();
                ev.meta.ts = ev.exchange_ts;
                self.bus.publish(topics::MARKET_ORDERBOOK_L2_SNAPSHOT, &ev);
            }
            "market:orderbook_l2_delta" => {
                let mut ev: OrderbookL2Delta =
                    serde_json::from_value(payload).context("orderbook delta payload")?;
                ev.meta.source = "replay".to_string();
                ev.meta.ts = ev.exchange_ts;
                self.bus.publish(topics::MARKET_ORDERBOOK_L2_DELTA, &ev);
            }
            "market:oi" => {
                let mut ev: OpenInterestEvent =
                    serde_json::from_value(payload).context("oi payload")?;
                ev.meta.source = "replay".to_string();
                ev.meta.ts = ev.meta.ts_event;
                self.bus.publish(topics::MARKET_OI, &ev);
            }
            "market:funding" => {
                let mut ev: FundingRateEvent =
                    serde_json::from_value(payload).context("funding payload")?;
                ev.meta.source = "replay".to_string();
                ev.meta.ts = ev.meta.ts_event;
                self.bus.publish(topics::MARKET_FUNDING, &ev);
            }
            "market:liquidation" => {
                let mut ev: LiquidationEvent =
                    serde_json::from_value(payload).context("liquidation payload")?;
                ev.meta.source = "replay".to_string();
                ev.meta.ts = ev.meta.ts_event;
                self.bus.publish(topics::MARKET_LIQUIDATION, &ev);
            }
            other => bail!("no replay binding for topic {other}"),
        }

        Ok(topic.to_string())
    }

    fn emit_warning(&self, file: &Path, line: u64, error: &str) {
        warn!(file = %file.display(), line, error, "replay record skipped");
        let event = ReplayWarning {
            meta: EventMeta::new("replay", self.clock.now_ms()),
            file: file.display().to_string(),
            line,
            error: error.to_string(),
        };
        self.bus.publish(topics::REPLAY_WARNING, &event);
    }

    fn emit_error(&self, error: &str) {
        let event = ReplayErrorEvent {
            meta: EventMeta::new("replay", self.clock.now_ms()),
            error: error.to_string(),
        };
        self.bus.publish(topics::REPLAY_ERROR, &event);
    }
}
