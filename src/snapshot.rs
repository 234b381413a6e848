// =============================================================================
// Snapshot Coordinator - periodic state persistence and recovery
// =============================================================================
//
// Components register named snapshot providers (state out) and restorers
// (state in). On `state:snapshot_requested` (periodic or ad hoc) the
// coordinator collects every provider payload into one JSON document and
// writes it atomically (tmp + rename), answering with
// `state:snapshot_written`. `state:recovery_requested` reads the document
// back and hands each component its section, answering with
// `state:recovery_loaded` or `state:recovery_failed`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::config::SnapshotConfig;
use crate::events::{
    RecoveryFailed, RecoveryLoaded, RecoveryRequested, SnapshotRequested, SnapshotWritten,
};
use crate::meta::{Clock, EventMeta};
use crate::topics;

pub type Provider = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;
pub type Restorer = Arc<dyn Fn(&serde_json::Value) -> Result<()> + Send + Sync>;

pub struct SnapshotCoordinator {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: SnapshotConfig,
    providers: Mutex<Vec<(String, Provider)>>,
    restorers: Mutex<HashMap<String, Restorer>>,
}

impl SnapshotCoordinator {
    pub fn new(bus: Arc<EventBus>, clock: Arc<dyn Clock>, config: SnapshotConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            clock,
            config,
            providers: Mutex::new(Vec::new()),
            restorers: Mutex::new(HashMap::new()),
        })
    }

    /// Register a component's state provider (and optional restorer).
    pub fn register(
        &self,
        name: impl Into<String>,
        provider: impl Fn() -> serde_json::Value + Send + Sync + 'static,
        restorer: Option<Restorer>,
    ) {
        let name = name.into();
        self.providers
            .lock()
            .push((name.clone(), Arc::new(provider)));
        if let Some(restorer) = restorer {
            self.restorers.lock().insert(name, restorer);
        }
    }

    pub fn start(self: &Arc<Self>) {
        let coordinator = self.clone();
        self.bus.subscribe(topics::STATE_SNAPSHOT_REQUESTED, move |req| {
            coordinator.write_snapshot(&req.reason);
            Ok(())
        });

        let coordinator = self.clone();
        self.bus
            .subscribe(topics::STATE_RECOVERY_REQUESTED, move |req| {
                coordinator.recover(req);
                Ok(())
            });
    }

    /// Spawn the periodic snapshot trigger. Returns the task handle so the
    /// orchestrator can abort it on shutdown.
    pub fn spawn_periodic(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        let interval = std::time::Duration::from_millis(self.config.interval_ms.max(1_000));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick is not a snapshot
            loop {
                ticker.tick().await;
                let request = SnapshotRequested {
                    meta: EventMeta::new("snapshot", coordinator.clock.now_ms()),
                    reason: "periodic".to_string(),
                };
                coordinator
                    .bus
                    .publish(topics::STATE_SNAPSHOT_REQUESTED, &request);
            }
        })
    }

    fn snapshot_path(&self) -> PathBuf {
        PathBuf::from(&self.config.dir).join("state.json")
    }

    fn write_snapshot(&self, reason: &str) {
        let providers = self.providers.lock();
        let mut document = serde_json::Map::new();
        let mut components = Vec::with_capacity(providers.len());
        for (name, provider) in providers.iter() {
            document.insert(name.clone(), provider());
            components.push(name.clone());
        }
        drop(providers);
        document.insert(
            "written_at".to_string(),
            serde_json::json!(self.clock.now_ms()),
        );

        let path = self.snapshot_path();
        match self.write_atomic(&path, &serde_json::Value::Object(document)) {
            Ok(()) => {
                info!(path = %path.display(), reason, "state snapshot written");
                let event = SnapshotWritten {
                    meta: EventMeta::new("snapshot", self.clock.now_ms()),
                    path: path.display().to_string(),
                    components,
                };
                self.bus.publish(topics::STATE_SNAPSHOT_WRITTEN, &event);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "state snapshot failed");
            }
        }
    }

    fn write_atomic(&self, path: &std::path::Path, value: &serde_json::Value) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create snapshot dir {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(value).context("serialize snapshot")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("write tmp snapshot {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("rename snapshot into {}", path.display()))?;
        Ok(())
    }

    fn recover(&self, req: &RecoveryRequested) {
        let path = req
            .path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.snapshot_path());

        let result: Result<Vec<String>> = (|| {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("read snapshot {}", path.display()))?;
            let document: serde_json::Value =
                serde_json::from_str(&content).context("parse snapshot")?;

            let restorers = self.restorers.lock();
            let mut restored = Vec::new();
            for (name, restorer) in restorers.iter() {
                if let Some(section) = document.get(name) {
                    restorer(section)
                        .with_context(|| format!("restore component {name}"))?;
                    restored.push(name.clone());
                }
            }
            Ok(restored)
        })();

        match result {
            Ok(components) => {
                info!(path = %path.display(), ?components, "state recovered");
                let event = RecoveryLoaded {
                    meta: EventMeta::new("snapshot", self.clock.now_ms()),
                    path: path.display().to_string(),
                    components,
                };
                self.bus.publish(topics::STATE_RECOVERY_LOADED, &event);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "state recovery failed");
                let event = RecoveryFailed {
                    meta: EventMeta::new("snapshot", self.clock.now_ms()),
                    error: e.to_string(),
                };
                self.bus.publish(topics::STATE_RECOVERY_FAILED, &event);
            }
        }
    }
}
