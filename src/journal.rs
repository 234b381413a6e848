// =============================================================================
// Event Journal - durable partitioned JSONL storage
// =============================================================================
//
// Append-only sink for a configurable set of non-aggregated topics. Records
// are enqueued on the dispatcher thread (never blocking on I/O) and written by
// a worker task that batches by size and flush interval, retrying failed
// writes with backoff and emitting `storage:writeFailed` along the way.
//
// Partition layout:
//   <base>/<streamId>/<symbol>/<topicDir>/[tf/]<runId>/<YYYY-MM-DD>.jsonl
//
// Aggregated/canonical topics are journaled by a separate sink under:
//   <base>/aggregated/<topicDir>/<symbol>/<runId>/<YYYY-MM-DD>.jsonl
// Mixing the two is a hard invariant violation; the raw sink refuses
// aggregated topics outright.
//
// `seq` is monotonically increasing within a run across all topics of a sink
// and resets with every new run id.
//
// The journal also watches the stream it persists: sequence gaps, duplicates,
// out-of-order events and ingest latency spikes are published as `data:*`
// events from the same observation point.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, SubscriptionId};
use crate::config::JournalConfig;
use crate::events::*;
use crate::meta::{Clock, EventMeta, StreamId, TsMillis};
use crate::quality::{QualityIssue, StreamQualityMonitor};
use crate::topics;

/// One journaled record, stored as a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub seq: u64,
    pub stream_id: StreamId,
    pub topic: String,
    pub symbol: String,
    pub ts_ingest: TsMillis,
    pub payload: serde_json::Value,
}

/// Topic name as a directory segment (`market:ticker` -> `market_ticker`).
pub fn topic_dir(topic: &str) -> String {
    topic.replace(':', "_")
}

/// UTC date segment for file rollover, derived from `ts_ingest`.
pub fn date_segment(ts: TsMillis) -> String {
    Utc.timestamp_millis_opt(ts.0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string())
}

// =============================================================================
// Writer task
// =============================================================================

enum WriteCmd {
    Append { path: PathBuf, line: String },
    Shutdown,
}

/// Handle to the shared writer task. Both journal sinks feed it.
pub struct JournalWriter {
    tx: mpsc::Sender<WriteCmd>,
    handle: tokio::task::JoinHandle<()>,
}

const WRITE_QUEUE_CAPACITY: usize = 16_384;
const MAX_WRITE_ATTEMPTS: u32 = 3;
const RETRY_BASE_MS: u64 = 200;

impl JournalWriter {
    /// Spawn the writer task. `bus` is used to surface `storage:writeFailed`.
    pub fn spawn(bus: Arc<EventBus>, clock: Arc<dyn Clock>, config: &JournalConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriteCmd>(WRITE_QUEUE_CAPACITY);
        let batch_size = config.batch_size.max(1);
        let flush_interval = std::time::Duration::from_millis(config.flush_interval_ms.max(1));

        let handle = tokio::spawn(async move {
            let mut buffer: Vec<(PathBuf, String)> = Vec::with_capacity(batch_size);
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    cmd = rx.recv() => match cmd {
                        Some(WriteCmd::Append { path, line }) => {
                            buffer.push((path, line));
                            if buffer.len() >= batch_size {
                                flush(&bus, &clock, &mut buffer).await;
                            }
                        }
                        Some(WriteCmd::Shutdown) | None => {
                            flush(&bus, &clock, &mut buffer).await;
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        if !buffer.is_empty() {
                            flush(&bus, &clock, &mut buffer).await;
                        }
                    }
                }
            }
            debug!("journal writer stopped");
        });

        Self { tx, handle }
    }

    fn sender(&self) -> mpsc::Sender<WriteCmd> {
        self.tx.clone()
    }

    /// Flush outstanding records and stop the task.
    pub async fn shutdown(self) {
        let _ = self.tx.send(WriteCmd::Shutdown).await;
        let _ = self.handle.await;
    }
}

/// Group buffered lines by file and append them, retrying each file with
/// backoff. Failed groups emit `storage:writeFailed` per attempt; after the
/// final attempt the lines are dropped with an error log so the pipeline
/// never stalls on storage.
async fn flush(bus: &Arc<EventBus>, clock: &Arc<dyn Clock>, buffer: &mut Vec<(PathBuf, String)>) {
    let mut by_file: HashMap<PathBuf, Vec<String>> = HashMap::new();
    for (path, line) in buffer.drain(..) {
        by_file.entry(path).or_default().push(line);
    }

    for (path, lines) in by_file {
        let mut attempt = 0u32;
        loop {
            match append_lines(&path, &lines).await {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    let retry_in_ms = RETRY_BASE_MS * 2u64.pow(attempt.min(6));
                    warn!(
                        path = %path.display(),
                        attempt,
                        error = %e,
                        "journal write failed"
                    );
                    let event = StorageWriteFailed {
                        meta: EventMeta::new("journal", clock.now_ms()),
                        path: path.display().to_string(),
                        error: e.to_string(),
                        retry_in_ms,
                    };
                    bus.publish(topics::STORAGE_WRITE_FAILED, &event);

                    if attempt >= MAX_WRITE_ATTEMPTS {
                        error!(
                            path = %path.display(),
                            dropped = lines.len(),
                            "journal write abandoned after retries"
                        );
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(retry_in_ms)).await;
                }
            }
        }
    }
}

async fn append_lines(path: &Path, lines: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create journal dir {}", parent.display()))?;
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open journal file {}", path.display()))?;

    let mut chunk = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
    for line in lines {
        chunk.push_str(line);
        chunk.push('\n');
    }

    file.write_all(chunk.as_bytes())
        .await
        .with_context(|| format!("append to journal file {}", path.display()))?;
    Ok(())
}

// =============================================================================
// EventJournal (raw / normalized sink)
// =============================================================================

pub struct EventJournal {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: JournalConfig,
    base_dir: PathBuf,
    run_id: String,
    seq: AtomicU64,
    tx: mpsc::Sender<WriteCmd>,
    monitor: Mutex<StreamQualityMonitor>,
    dropped: AtomicU64,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl EventJournal {
    pub fn new(
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: JournalConfig,
        run_id: impl Into<String>,
        writer: &JournalWriter,
    ) -> Arc<Self> {
        let monitor = StreamQualityMonitor::new(config.latency_spike_threshold_ms);
        Arc::new(Self {
            base_dir: PathBuf::from(&config.base_dir),
            bus,
            clock,
            config,
            run_id: run_id.into(),
            seq: AtomicU64::new(0),
            tx: writer.sender(),
            monitor: Mutex::new(monitor),
            dropped: AtomicU64::new(0),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Subscribe to every configured topic. Aggregated topics are refused.
    pub fn start(self: &Arc<Self>) {
        let configured = self.config.topics.clone();
        let mut subs = Vec::new();

        for topic in &configured {
            if topics::is_aggregated_topic(topic) {
                warn!(topic, "aggregated topic refused by raw journal sink");
                continue;
            }
            match topic.as_str() {
                "market:ticker" => {
                    let j = self.clone();
                    subs.push(self.bus.subscribe(topics::MARKET_TICKER, move |e| {
                        j.record("market:ticker", &e.meta, &e.stream_id, &e.symbol, None, e)
                    }));
                }
                "market:kline" => {
                    let j = self.clone();
                    subs.push(self.bus.subscribe(topics::MARKET_KLINE, move |e| {
                        j.record("market:kline", &e.meta, &e.stream_id, &e.symbol, Some(&e.tf), e)
                    }));
                }
                "market:trade" => {
                    let j = self.clone();
                    subs.push(self.bus.subscribe(topics::MARKET_TRADE, move |e| {
                        j.record("market:trade", &e.meta, &e.stream_id, &e.symbol, None, e)
                    }));
                }
                "market:orderbook_l2_snapshot" => {
                    let j = self.clone();
                    subs.push(self.bus.subscribe(
                        topics::MARKET_ORDERBOOK_L2_SNAPSHOT,
                        move |e| {
                            j.record(
                                "market:orderbook_l2_snapshot",
                                &e.meta,
                                &e.stream_id,
                                &e.symbol,
                                None,
                                e,
                            )
                        },
                    ));
                }
                "market:orderbook_l2_delta" => {
                    let j = self.clone();
                    subs.push(self.bus.subscribe(
                        topics::MARKET_ORDERBOOK_L2_DELTA,
                        move |e| {
                            j.record(
                                "market:orderbook_l2_delta",
                                &e.meta,
                                &e.stream_id,
                                &e.symbol,
                                None,
                                e,
                            )
                        },
                    ));
                }
                "market:oi" => {
                    let j = self.clone();
                    subs.push(self.bus.subscribe(topics::MARKET_OI, move |e| {
                        j.record("market:oi", &e.meta, &e.stream_id, &e.symbol, None, e)
                    }));
                }
                "market:funding" => {
                    let j = self.clone();
                    subs.push(self.bus.subscribe(topics::MARKET_FUNDING, move |e| {
                        j.record("market:funding", &e.meta, &e.stream_id, &e.symbol, None, e)
                    }));
                }
                "market:liquidation" => {
                    let j = self.clone();
                    subs.push(self.bus.subscribe(topics::MARKET_LIQUIDATION, move |e| {
                        j.record("market:liquidation", &e.meta, &e.stream_id, &e.symbol, None, e)
                    }));
                }
                other => {
                    warn!(topic = other, "journal has no binding for configured topic");
                }
            }
        }

        *self.subscriptions.lock() = subs;
        info!(
            run_id = %self.run_id,
            base = %self.base_dir.display(),
            topics = configured.len(),
            "event journal started"
        );
        self.write_manifest();
    }

    /// Unsubscribe from the bus. In-flight writes complete on the worker.
    pub fn stop(&self) {
        let subs: Vec<SubscriptionId> = self.subscriptions.lock().drain(..).collect();
        for sub in subs {
            self.bus.unsubscribe(sub);
        }
        info!(run_id = %self.run_id, "event journal stopped");
    }

    /// Small per-run manifest aiding replay discovery.
    fn write_manifest(&self) {
        let manifest = serde_json::json!({
            "run_id": self.run_id,
            "started_at": self.clock.now_ms(),
            "topics": self.config.topics,
        });
        let path = self.base_dir.join(&self.run_id).with_extension("run.json");
        if let Err(e) = self.tx.try_send(WriteCmd::Append {
            path,
            line: manifest.to_string(),
        }) {
            warn!(error = %e, "failed to enqueue run manifest");
        }
    }

    fn record<T: Serialize>(
        &self,
        topic: &'static str,
        meta: &EventMeta,
        stream_id: &StreamId,
        symbol: &str,
        tf: Option<&str>,
        payload: &T,
    ) -> Result<()> {
        // Replayed events are outputs of a previous run; journaling them again
        // would duplicate the recording.
        if meta.source == "replay" {
            return Ok(());
        }

        let ts_ingest = meta.ts_ingest.unwrap_or_else(|| self.clock.now_ms());
        self.observe_quality(topic, meta, stream_id, symbol, tf, ts_ingest);

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let record = JournalRecord {
            seq,
            stream_id: stream_id.clone(),
            topic: topic.to_string(),
            symbol: symbol.to_string(),
            ts_ingest,
            payload: serde_json::to_value(payload).context("serialize journal payload")?,
        };

        let mut path = self
            .base_dir
            .join(stream_id.as_str())
            .join(symbol)
            .join(topic_dir(topic));
        if let Some(tf) = tf {
            path = path.join(tf);
        }
        let path = path
            .join(&self.run_id)
            .join(format!("{}.jsonl", date_segment(ts_ingest)));

        let line = serde_json::to_string(&record).context("serialize journal record")?;
        if self.tx.try_send(WriteCmd::Append { path, line }).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 1_000 == 1 {
                warn!(topic, dropped, "journal write queue full, dropping records");
            }
        }
        Ok(())
    }

    /// Quality observation on the same input stream the journal persists.
    fn observe_quality(
        &self,
        topic: &str,
        meta: &EventMeta,
        stream_id: &StreamId,
        symbol: &str,
        tf: Option<&str>,
        ts_ingest: TsMillis,
    ) {
        let issues = self.monitor.lock().observe(
            stream_id,
            topic,
            tf,
            meta.sequence,
            meta.ts_event,
            Some(ts_ingest),
            meta.ts_exchange,
        );

        let now = self.clock.now_ms();
        for issue in issues {
            match issue {
                QualityIssue::Gap {
                    expected,
                    observed,
                    missing,
                } => {
                    let event = GapDetected {
                        meta: EventMeta::inherit(meta, "journal", now),
                        stream_id: stream_id.clone(),
                        topic: topic.to_string(),
                        symbol: symbol.to_string(),
                        tf: tf.map(str::to_string),
                        expected,
                        observed,
                        missing,
                    };
                    self.bus.publish(topics::DATA_GAP_DETECTED, &event);

                    let anomaly = SequenceAnomaly {
                        meta: EventMeta::inherit(meta, "journal", now),
                        stream_id: stream_id.clone(),
                        topic: topic.to_string(),
                        symbol: symbol.to_string(),
                        expected,
                        observed,
                    };
                    self.bus.publish(topics::DATA_SEQUENCE_ANOMALY, &anomaly);
                }
                QualityIssue::Duplicate { sequence } => {
                    let event = DuplicateDetected {
                        meta: EventMeta::inherit(meta, "journal", now),
                        stream_id: stream_id.clone(),
                        topic: topic.to_string(),
                        symbol: symbol.to_string(),
                        sequence: Some(sequence),
                        ts: meta.ts_event,
                    };
                    self.bus.publish(topics::DATA_DUPLICATE_DETECTED, &event);
                }
                QualityIssue::SequenceOutOfOrder { expected, observed } => {
                    let event = OutOfOrderDetected {
                        meta: EventMeta::inherit(meta, "journal", now),
                        stream_id: stream_id.clone(),
                        topic: topic.to_string(),
                        symbol: symbol.to_string(),
                        tf: tf.map(str::to_string),
                        prev_ts: meta.ts_event,
                        ts: meta.ts_event,
                    };
                    self.bus.publish(topics::DATA_OUT_OF_ORDER, &event);

                    let anomaly = SequenceAnomaly {
                        meta: EventMeta::inherit(meta, "journal", now),
                        stream_id: stream_id.clone(),
                        topic: topic.to_string(),
                        symbol: symbol.to_string(),
                        expected,
                        observed,
                    };
                    self.bus.publish(topics::DATA_SEQUENCE_ANOMALY, &anomaly);
                }
                QualityIssue::TimeOutOfOrder { prev_ts, ts } => {
                    let event = OutOfOrderDetected {
                        meta: EventMeta::inherit(meta, "journal", now),
                        stream_id: stream_id.clone(),
                        topic: topic.to_string(),
                        symbol: symbol.to_string(),
                        tf: tf.map(str::to_string),
                        prev_ts,
                        ts,
                    };
                    self.bus.publish(topics::DATA_TIME_OUT_OF_ORDER, &event);
                }
                QualityIssue::LatencySpike {
                    latency_ms,
                    threshold_ms,
                } => {
                    let event = LatencySpike {
                        meta: EventMeta::inherit(meta, "journal", now),
                        stream_id: stream_id.clone(),
                        topic: topic.to_string(),
                        symbol: symbol.to_string(),
                        latency_ms,
                        threshold_ms,
                    };
                    self.bus.publish(topics::DATA_LATENCY_SPIKE, &event);
                }
            }
        }
    }
}

// =============================================================================
// AggregatedJournal
// =============================================================================

/// Separate sink for aggregated/canonical outputs. Own seq counter; layout
/// `<base>/aggregated/<topicDir>/<symbol>/<runId>/<date>.jsonl`.
pub struct AggregatedJournal {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    base_dir: PathBuf,
    run_id: String,
    seq: AtomicU64,
    tx: mpsc::Sender<WriteCmd>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl AggregatedJournal {
    pub fn new(
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        base_dir: impl Into<PathBuf>,
        run_id: impl Into<String>,
        writer: &JournalWriter,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            clock,
            base_dir: base_dir.into(),
            run_id: run_id.into(),
            seq: AtomicU64::new(0),
            tx: writer.sender(),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let mut subs = Vec::new();

        let j = self.clone();
        subs.push(self.bus.subscribe(topics::MARKET_PRICE_CANONICAL, move |e| {
            j.record("market:price_canonical", &e.meta, &e.symbol, e)
        }));

        let j = self.clone();
        subs.push(self.bus.subscribe(topics::MARKET_OI_AGG, move |e| {
            j.record("market:oi_agg", &e.meta, &e.symbol, e)
        }));

        let j = self.clone();
        subs.push(self.bus.subscribe(topics::MARKET_FUNDING_AGG, move |e| {
            j.record("market:funding_agg", &e.meta, &e.symbol, e)
        }));

        let j = self.clone();
        subs.push(self.bus.subscribe(topics::MARKET_LIQUIDATIONS_AGG, move |e| {
            j.record("market:liquidations_agg", &e.meta, &e.symbol, e)
        }));

        let j = self.clone();
        subs.push(self.bus.subscribe(topics::MARKET_CVD_AGG, move |e| {
            j.record("market:cvd_agg", &e.meta, &e.symbol, e)
        }));

        let j = self.clone();
        subs.push(self.bus.subscribe(topics::MARKET_LIQUIDITY_AGG, move |e| {
            j.record("market:liquidity_agg", &e.meta, &e.symbol, e)
        }));

        let j = self.clone();
        subs.push(self.bus.subscribe(topics::MARKET_VOLUME_AGG, move |e| {
            j.record("market:volume_agg", &e.meta, &e.symbol, e)
        }));

        *self.subscriptions.lock() = subs;
        info!(run_id = %self.run_id, "aggregated journal started");
    }

    pub fn stop(&self) {
        let subs: Vec<SubscriptionId> = self.subscriptions.lock().drain(..).collect();
        for sub in subs {
            self.bus.unsubscribe(sub);
        }
    }

    fn record<T: Serialize>(
        &self,
        topic: &'static str,
        meta: &EventMeta,
        symbol: &str,
        payload: &T,
    ) -> Result<()> {
        let ts_ingest = meta.ts_ingest.unwrap_or_else(|| self.clock.now_ms());
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);

        let stream_id = meta
            .stream_id
            .clone()
            .unwrap_or_else(|| StreamId::from("aggregated"));
        let record = JournalRecord {
            seq,
            stream_id,
            topic: topic.to_string(),
            symbol: symbol.to_string(),
            ts_ingest,
            payload: serde_json::to_value(payload).context("serialize aggregated payload")?,
        };

        let path = self
            .base_dir
            .join("aggregated")
            .join(topic_dir(topic))
            .join(symbol)
            .join(&self.run_id)
            .join(format!("{}.jsonl", date_segment(ts_ingest)));

        let line = serde_json::to_string(&record).context("serialize aggregated record")?;
        if self.tx.try_send(WriteCmd::Append { path, line }).is_err() {
            warn!(topic, "aggregated journal queue full, dropping record");
        }
        Ok(())
    }
}
