// =============================================================================
// Borealis Market Nexus - main entry point
// =============================================================================
//
// Wires the pipeline together: config, bus, journal sinks, normalizers,
// gateways, aggregators, feature engines, context builders, readiness and
// the orchestrator. Runs until Ctrl+C, then shuts down through the
// orchestrator's cleanup stack.

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use borealis::aggregators::{
    CanonicalPriceAggregator, CvdAggregator, FundingAggregator, LiquidationsAggregator,
    LiquidityAggregator, OpenInterestAggregator, VolumeAggregator,
};
use borealis::bus::EventBus;
use borealis::config::PipelineConfig;
use borealis::context::{MarketContextBuilder, MarketViewBuilder};
use borealis::features::{KlineFeatureEngine, TickerFeatureEngine};
use borealis::feeds::{BinanceRest, BinanceTransport, KlineBootstrapper};
use borealis::gateway::MarketGateway;
use borealis::journal::{AggregatedJournal, EventJournal, JournalWriter};
use borealis::meta::{Clock, SystemClock};
use borealis::normalizer::BinanceNormalizer;
use borealis::orchestrator::Orchestrator;
use borealis::orderbook::OrderbookEngine;
use borealis::readiness::MarketDataReadiness;
use borealis::registry::SourceRegistry;
use borealis::snapshot::SnapshotCoordinator;
use borealis::types::{MarketType, PipelineMode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Borealis Market Nexus starting up");

    let mut config = PipelineConfig::load("pipeline_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        PipelineConfig::default()
    });
    config.apply_env();
    info!(symbols = ?config.symbols, tfs = ?config.kline_tfs, "configured markets");

    // ── 2. Core plumbing ─────────────────────────────────────────────────
    let bus = Arc::new(EventBus::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(SourceRegistry::new());
    let run_id = uuid::Uuid::new_v4().to_string();
    info!(run_id = %run_id, "run started");

    // ── 3. Journals ──────────────────────────────────────────────────────
    let writer = JournalWriter::spawn(bus.clone(), clock.clone(), &config.journal);
    let journal = EventJournal::new(
        bus.clone(),
        clock.clone(),
        config.journal.clone(),
        run_id.clone(),
        &writer,
    );
    journal.start();
    let aggregated_journal = AggregatedJournal::new(
        bus.clone(),
        clock.clone(),
        config.journal.base_dir.clone(),
        run_id.clone(),
        &writer,
    );
    aggregated_journal.start();

    // ── 4. Market state engines ──────────────────────────────────────────
    let orderbook = OrderbookEngine::new(bus.clone(), clock.clone(), config.orderbook_depth);
    orderbook.start();

    let canonical_price =
        CanonicalPriceAggregator::new(bus.clone(), clock.clone(), config.aggregator.clone());
    canonical_price.start();
    let cvd = CvdAggregator::new(
        bus.clone(),
        clock.clone(),
        config.aggregator.clone(),
        config.cvd_debug,
    );
    cvd.start();
    let volume = VolumeAggregator::new(bus.clone(), clock.clone(), config.aggregator.bucket_ms);
    volume.start();
    let oi = OpenInterestAggregator::new(bus.clone(), clock.clone(), config.aggregator.clone());
    oi.start();
    let funding = FundingAggregator::new(bus.clone(), clock.clone(), config.aggregator.clone());
    funding.start();
    let liquidations =
        LiquidationsAggregator::new(bus.clone(), clock.clone(), config.aggregator.clone());
    liquidations.start();
    let liquidity =
        LiquidityAggregator::new(bus.clone(), clock.clone(), config.aggregator.clone());
    liquidity.start();

    // ── 5. Analytics ─────────────────────────────────────────────────────
    let ticker_features =
        TickerFeatureEngine::new(bus.clone(), clock.clone(), config.features.clone());
    ticker_features.start();
    let kline_features =
        KlineFeatureEngine::new(bus.clone(), clock.clone(), config.features.clone());
    kline_features.start();
    let context = MarketContextBuilder::new(bus.clone(), clock.clone(), config.features.clone());
    context.start();
    let view = MarketViewBuilder::new(bus.clone(), clock.clone());
    view.start();

    let readiness = MarketDataReadiness::new(
        bus.clone(),
        clock.clone(),
        config.clone(),
        registry.clone(),
    );
    readiness.start();

    // ── 6. Snapshot coordinator ──────────────────────────────────────────
    let snapshots =
        SnapshotCoordinator::new(bus.clone(), clock.clone(), config.snapshot.clone());
    snapshots.start();
    let snapshot_task = snapshots.spawn_periodic();

    // ── 7. Venue transports & gateways ───────────────────────────────────
    let binance_normalizer = Arc::new(BinanceNormalizer::new(bus.clone(), clock.clone()));
    let rest = Arc::new(BinanceRest::new());
    let bootstrapper = KlineBootstrapper::new(
        bus.clone(),
        clock.clone(),
        rest.clone(),
        binance_normalizer.clone(),
    );
    bootstrapper.start();

    let runtime = tokio::runtime::Handle::current();
    let mut venues: Vec<(String, MarketType)> = Vec::new();

    if config.spot_enabled {
        let transport = BinanceTransport::new(
            MarketType::Spot,
            bus.clone(),
            clock.clone(),
            binance_normalizer.clone(),
            rest.clone(),
            runtime.clone(),
            config.kline_tfs.clone(),
            config.orderbook_depth,
        );
        let gateway = MarketGateway::new(
            bus.clone(),
            clock.clone(),
            transport,
            config.gateway.clone(),
        );
        gateway.start();
        venues.push(("binance".to_string(), MarketType::Spot));
    }

    if config.target_market_type != Some(MarketType::Spot) {
        let transport = BinanceTransport::new(
            MarketType::Futures,
            bus.clone(),
            clock.clone(),
            binance_normalizer.clone(),
            rest.clone(),
            runtime.clone(),
            config.kline_tfs.clone(),
            config.orderbook_depth,
        );
        let gateway = MarketGateway::new(
            bus.clone(),
            clock.clone(),
            transport,
            config.gateway.clone(),
        );
        gateway.start();
        venues.push(("binance".to_string(), MarketType::Futures));
    }

    // ── 8. Orchestrator & boot fan-out ───────────────────────────────────
    let orchestrator = Orchestrator::new(
        bus.clone(),
        clock.clone(),
        config.clone(),
        PipelineMode::Paper,
    );

    {
        let journal = journal.clone();
        orchestrator.register_cleanup("journal", move || {
            journal.stop();
            Ok(())
        });
    }
    {
        let aggregated_journal = aggregated_journal.clone();
        orchestrator.register_cleanup("aggregated-journal", move || {
            aggregated_journal.stop();
            Ok(())
        });
    }
    {
        orchestrator.register_cleanup("snapshot-timer", move || {
            snapshot_task.abort();
            Ok(())
        });
    }

    orchestrator.start();
    orchestrator.boot(&venues);
    info!(venues = venues.len(), "pipeline running, press Ctrl+C to stop");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    orchestrator.shutdown();
    writer.shutdown().await;

    if let Err(e) = config.save("pipeline_config.json") {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("Borealis shut down complete");
    Ok(())
}
