// =============================================================================
// Orchestrator - lifecycle owner and control-plane command handler
// =============================================================================
//
// The orchestrator is the sole mutator of `ControlState`. Lifecycle:
//
//   STARTING -> RUNNING (first ticker, unless paused) -> PAUSED <-> RUNNING
//   any      -> STOPPING -> STOPPED (shutdown, idempotent)
//
// Shutdown runs registered cleanups in reverse registration order; an
// individual cleanup may fail or overrun its budget without aborting the
// rest. Boot fan-out publishes `market:connect`, `market:subscribe` and
// `market:kline_bootstrap_requested` for every configured venue target.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::config::PipelineConfig;
use crate::events::{
    ConnectRequest, ControlCommand, ControlCommandEvent, KlineBootstrapRequest, SubscribeRequest,
};
use crate::meta::{Clock, EventMeta};
use crate::topics;
use crate::types::{ControlState, Lifecycle, MarketType, PipelineMode};

type Cleanup = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Budget one cleanup may spend before the overrun is logged.
const CLEANUP_BUDGET_MS: u128 = 5_000;

pub struct Orchestrator {
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
    state: Mutex<ControlState>,
    cleanups: Mutex<Vec<(String, Cleanup)>>,
}

impl Orchestrator {
    pub fn new(
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
        mode: PipelineMode,
    ) -> Arc<Self> {
        let state = ControlState::new(mode, clock.now_ms());
        Arc::new(Self {
            bus,
            clock,
            config,
            state: Mutex::new(state),
            cleanups: Mutex::new(Vec::new()),
        })
    }

    /// Register a shutdown cleanup. Cleanups run in reverse registration
    /// order.
    pub fn register_cleanup(
        &self,
        name: impl Into<String>,
        cleanup: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
    ) {
        self.cleanups.lock().push((name.into(), Box::new(cleanup)));
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn start(self: &Arc<Self>) {
        self.publish_state();

        let orch = self.clone();
        self.bus.subscribe(topics::CONTROL_COMMAND, move |cmd| {
            orch.on_command(cmd);
            Ok(())
        });

        // First ticker drives STARTING -> RUNNING unless paused.
        let orch = self.clone();
        self.bus.subscribe(topics::MARKET_TICKER, move |_| {
            orch.on_first_ticker();
            Ok(())
        });
    }

    fn publish_state(&self) {
        let state = self.state.lock().clone();
        self.bus.publish(topics::CONTROL_STATE, &state);
    }

    fn on_first_ticker(&self) {
        let changed = {
            let mut state = self.state.lock();
            if state.lifecycle == Lifecycle::Starting && !state.paused {
                state.lifecycle = Lifecycle::Running;
                true
            } else {
                false
            }
        };
        if changed {
            info!("first market data observed, pipeline RUNNING");
            self.publish_state();
        }
    }

    fn on_command(&self, event: &ControlCommandEvent) {
        let now = self.clock.now_ms();
        info!(command = %event.command, reason = ?event.reason, "control command");

        let mut run_shutdown = false;
        {
            let mut state = self.state.lock();
            state.last_command_at = Some(now);
            state.last_command = Some(event.command.to_string());
            state.last_command_reason = event.reason.clone();

            match &event.command {
                ControlCommand::Pause => {
                    state.paused = true;
                    if state.lifecycle == Lifecycle::Running {
                        state.lifecycle = Lifecycle::Paused;
                    }
                }
                ControlCommand::Resume => {
                    state.paused = false;
                    if state.lifecycle == Lifecycle::Paused {
                        state.lifecycle = Lifecycle::Running;
                    }
                }
                ControlCommand::SetMode { mode } => {
                    state.mode = *mode;
                }
                ControlCommand::Status => {}
                ControlCommand::Shutdown => {
                    if !state.shutting_down {
                        state.shutting_down = true;
                        state.lifecycle = Lifecycle::Stopping;
                        run_shutdown = true;
                    }
                }
            }
        }
        self.publish_state();

        if run_shutdown {
            self.run_cleanups();
            self.state.lock().lifecycle = Lifecycle::Stopped;
            self.publish_state();
            info!("pipeline STOPPED");
        }
    }

    /// Idempotent programmatic shutdown (same path as the command).
    pub fn shutdown(&self) {
        let event = ControlCommandEvent {
            meta: EventMeta::new("orchestrator", self.clock.now_ms()),
            command: ControlCommand::Shutdown,
            reason: Some("programmatic".to_string()),
        };
        self.on_command(&event);
    }

    fn run_cleanups(&self) {
        let mut cleanups: Vec<(String, Cleanup)> = self.cleanups.lock().drain(..).collect();
        // Reverse registration order: last registered is torn down first.
        cleanups.reverse();

        for (name, cleanup) in cleanups {
            let started = std::time::Instant::now();
            match cleanup() {
                Ok(()) => info!(cleanup = %name, "cleanup complete"),
                Err(e) => error!(cleanup = %name, error = %e, "cleanup failed, continuing"),
            }
            let elapsed = started.elapsed().as_millis();
            if elapsed > CLEANUP_BUDGET_MS {
                warn!(cleanup = %name, elapsed_ms = elapsed, "cleanup exceeded budget");
            }
        }
    }

    /// Boot fan-out for every configured venue target.
    pub fn boot(&self, venues: &[(String, MarketType)]) {
        let now = self.clock.now_ms();

        for (venue, market_type) in venues {
            let connect = ConnectRequest {
                meta: EventMeta::new("orchestrator", now),
                venue: venue.clone(),
                market_type: *market_type,
            };
            self.bus.publish(topics::MARKET_CONNECT, &connect);

            let mut channels = vec!["ticker".to_string()];
            if self.config.trades_enabled {
                channels.push("trade".to_string());
            }
            if self.config.orderbook_enabled {
                channels.push("orderbook".to_string());
            }
            if self.config.klines_enabled {
                channels.push("kline".to_string());
            }
            if *market_type == MarketType::Futures {
                if self.config.oi_enabled {
                    channels.push("oi".to_string());
                }
                if self.config.funding_enabled {
                    channels.push("funding".to_string());
                }
                if self.config.liquidations_enabled {
                    channels.push("liquidation".to_string());
                }
            }

            let subscribe = SubscribeRequest {
                meta: EventMeta::new("orchestrator", now),
                venue: venue.clone(),
                market_type: *market_type,
                channels,
                symbols: self.config.symbols.clone(),
            };
            self.bus.publish(topics::MARKET_SUBSCRIBE, &subscribe);

            if self.config.klines_enabled {
                let bootstrap = KlineBootstrapRequest {
                    meta: EventMeta::new("orchestrator", now),
                    venue: venue.clone(),
                    market_type: *market_type,
                    symbols: self.config.symbols.clone(),
                    tfs: self.config.kline_tfs.clone(),
                    limit: self.config.kline_limit,
                };
                self.bus
                    .publish(topics::MARKET_KLINE_BOOTSTRAP_REQUESTED, &bootstrap);
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
    use crate::meta::{ManualClock, StreamId, TsMillis};
    use parking_lot::Mutex as PMutex;

    fn setup(mode: PipelineMode) -> (Arc<EventBus>, Arc<Orchestrator>, Arc<PMutex<Vec<ControlState>>>) {
        let bus = Arc::new(EventBus::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let orch = Orchestrator::new(bus.clone(), clock, PipelineConfig::default(), mode);

        let states = Arc::new(PMutex::new(Vec::new()));
        let s = states.clone();
        bus.subscribe(topics::CONTROL_STATE, move |e| {
            s.lock().push(e.clone());
            Ok(())
        });

        orch.start();
        (bus, orch, states)
    }

    fn command(cmd: ControlCommand) -> ControlCommandEvent {
        ControlCommandEvent {
            meta: EventMeta::new("cli", TsMillis(1_000)),
            command: cmd,
            reason: None,
        }
    }

    fn ticker() -> crate::events::TickerEvent {
        let stream_id = StreamId::from("binance:ticker:spot");
        crate::events::TickerEvent {
            meta: EventMeta::new("binance", TsMillis(1_000)).with_stream(stream_id.clone()),
            symbol: "BTCUSDT".to_string(),
            market_type: MarketType::Spot,
            stream_id,
            last_price: 100.0,
            bid: None,
            ask: None,
            volume_24h: None,
        }
    }

    #[test]
    fn first_ticker_drives_starting_to_running() {
        let (bus, orch, _states) = setup(PipelineMode::Paper);
        assert_eq!(orch.lifecycle(), Lifecycle::Starting);

        bus.publish(topics::MARKET_TICKER, &ticker());
        assert_eq!(orch.lifecycle(), Lifecycle::Running);

        // Subsequent tickers are no-ops.
        bus.publish(topics::MARKET_TICKER, &ticker());
        assert_eq!(orch.lifecycle(), Lifecycle::Running);
    }

    #[test]
    fn pause_blocks_running_until_resume() {
        let (bus, orch, _states) = setup(PipelineMode::Paper);

        bus.publish(topics::CONTROL_COMMAND, &command(ControlCommand::Pause));
        bus.publish(topics::MARKET_TICKER, &ticker());
        assert_eq!(orch.lifecycle(), Lifecycle::Starting);

        bus.publish(topics::CONTROL_COMMAND, &command(ControlCommand::Resume));
        bus.publish(topics::MARKET_TICKER, &ticker());
        assert_eq!(orch.lifecycle(), Lifecycle::Running);

        bus.publish(topics::CONTROL_COMMAND, &command(ControlCommand::Pause));
        assert_eq!(orch.lifecycle(), Lifecycle::Paused);
        bus.publish(topics::CONTROL_COMMAND, &command(ControlCommand::Resume));
        assert_eq!(orch.lifecycle(), Lifecycle::Running);
    }

    #[test]
    fn set_mode_updates_state() {
        let (bus, _orch, states) = setup(PipelineMode::Paper);

        bus.publish(
            topics::CONTROL_COMMAND,
            &command(ControlCommand::SetMode {
                mode: PipelineMode::Live,
            }),
        );

        let states = states.lock();
        assert_eq!(states.last().unwrap().mode, PipelineMode::Live);
        assert_eq!(states.last().unwrap().last_command.as_deref(), Some("set_mode(LIVE)"));
    }

    #[test]
    fn shutdown_runs_cleanups_in_reverse_order_and_is_idempotent() {
        let (bus, orch, _states) = setup(PipelineMode::Paper);

        let order = Arc::new(PMutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = order.clone();
            orch.register_cleanup(name, move || {
                order.lock().push(name);
                Ok(())
            });
        }

        bus.publish(topics::CONTROL_COMMAND, &command(ControlCommand::Shutdown));
        assert_eq!(orch.lifecycle(), Lifecycle::Stopped);
        assert_eq!(*order.lock(), vec!["third", "second", "first"]);

        // Second shutdown is a no-op.
        bus.publish(topics::CONTROL_COMMAND, &command(ControlCommand::Shutdown));
        assert_eq!(*order.lock(), vec!["third", "second", "first"]);
    }

    #[test]
    fn failing_cleanup_does_not_abort_the_rest() {
        let (_bus, orch, _states) = setup(PipelineMode::Paper);

        let order = Arc::new(PMutex::new(Vec::new()));
        let o = order.clone();
        orch.register_cleanup("ok-first", move || {
            o.lock().push("ok-first");
            Ok(())
        });
        orch.register_cleanup("boom", || anyhow::bail!("cleanup exploded"));
        let o = order.clone();
        orch.register_cleanup("ok-last", move || {
            o.lock().push("ok-last");
            Ok(())
        });

        orch.shutdown();
        assert_eq!(orch.lifecycle(), Lifecycle::Stopped);
        assert_eq!(*order.lock(), vec!["ok-last", "ok-first"]);
    }

    #[test]
    fn boot_fans_out_connect_subscribe_bootstrap() {
        let (bus, orch, _states) = setup(PipelineMode::Paper);

        let connects = Arc::new(PMutex::new(Vec::new()));
        let c = connects.clone();
        bus.subscribe(topics::MARKET_CONNECT, move |e| {
            c.lock().push((e.venue.clone(), e.market_type));
            Ok(())
        });
        let subscribes = Arc::new(PMutex::new(Vec::new()));
        let s = subscribes.clone();
        bus.subscribe(topics::MARKET_SUBSCRIBE, move |e| {
            s.lock().push(e.channels.clone());
            Ok(())
        });
        let bootstraps = Arc::new(PMutex::new(0usize));
        let b = bootstraps.clone();
        bus.subscribe(topics::MARKET_KLINE_BOOTSTRAP_REQUESTED, move |_| {
            *b.lock() += 1;
            Ok(())
        });

        orch.boot(&[
            ("binance".to_string(), MarketType::Spot),
            ("binance".to_string(), MarketType::Futures),
        ]);

        let connects = connects.lock();
        assert_eq!(connects.len(), 2);
        let subscribes = subscribes.lock();
        // Futures target additionally subscribes derivatives channels.
        assert!(subscribes[0].iter().all(|c| c != "oi"));
        assert!(subscribes[1].iter().any(|c| c == "oi"));
        assert_eq!(*bootstraps.lock(), 2);
    }
}
