use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use sweepbot::api::CoinbaseClient;
use sweepbot::backtest::{load_csv, BacktestRunner};
use sweepbot::config::{ExecutionCosts, Settings};
use sweepbot::db::PostgresPersistence;
use sweepbot::engine::Engine;
use sweepbot::events::{DomainEvent, Outbox};
use sweepbot::execution::{CandleStore, FeedSupervisor, ReconnectPolicy, TickOutcome};
use sweepbot::models::Timeframe;
use sweepbot::persistence::CandleCache;
use sweepbot::error::BotResult;
use sweepbot::Result;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;

const CACHE_CLEANUP_SECS: u64 = 3600;

#[derive(Parser)]
#[command(name = "sweepbot", version, about = "Liquidity sweep + confluence paper trader")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Paper trade against the live candle feed
    Run,
    /// Replay historical candles from CSV
    Backtest {
        /// 4H candles (timestamp, open, high, low, close, volume)
        #[arg(long)]
        coarse: PathBuf,
        /// 5M candles (timestamp, open, high, low, close, volume)
        #[arg(long)]
        fine: PathBuf,
        /// Ignore fees and slippage
        #[arg(long)]
        no_costs: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = Settings::load()?;

    match cli.command {
        Command::Run => run(settings).await,
        Command::Backtest {
            coarse,
            fine,
            no_costs,
        } => backtest(settings, coarse, fine, no_costs),
    }
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sweepbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect_to_postgres(settings: &Settings) -> Option<PostgresPersistence> {
    let database_url = settings.storage.database_url.as_deref()?;

    match PostgresPersistence::new(database_url).await {
        Ok(p) => {
            tracing::info!("Postgres persistence enabled");
            Some(p)
        }
        Err(e) => {
            tracing::warn!(
                "Failed to connect to Postgres ({}), continuing without persistence",
                e
            );
            None
        }
    }
}

async fn connect_to_redis(settings: &Settings) -> Option<CandleCache> {
    let redis_url = settings.storage.redis_url.as_deref()?;

    match CandleCache::new(redis_url, settings.storage.redis_keep_hours).await {
        Ok(cache) => Some(cache),
        Err(e) => {
            tracing::warn!("Failed to connect to Redis ({}), continuing without candle cache", e);
            None
        }
    }
}

/// Rebuild the engine from Postgres when available
async fn initialize_engine(
    settings: &Settings,
    store: CandleStore,
    outbox: Outbox,
    postgres: Option<&PostgresPersistence>,
) -> Result<Engine> {
    let now = Utc::now();
    let Some(db) = postgres else {
        return Ok(Engine::new(settings, store, outbox, now));
    };

    let snapshot = db.load_snapshot().await?;
    tracing::info!(
        "Loaded {} swings, {} sweeps, {} confluences, {} trades from database",
        snapshot.swings.len(),
        snapshot.sweeps.len(),
        snapshot.confluences.len(),
        snapshot.trades.len()
    );
    Ok(Engine::restore(settings, store, outbox, snapshot, now)?)
}

/// Seed the in-memory store from the candle cache
async fn warm_from_cache(cache: &CandleCache, store: &CandleStore) {
    for timeframe in [Timeframe::Coarse, Timeframe::Fine] {
        let hours = match timeframe {
            Timeframe::Coarse => 24 * 14,
            Timeframe::Fine => 12,
        };
        match cache.load_candles(timeframe, hours).await {
            Ok(candles) => match store.ingest_batch(timeframe, candles) {
                Ok(report) => tracing::info!("  ✓ Warmed {} {} candles from Redis", report.inserted, timeframe),
                Err(e) => tracing::warn!("  ✗ Failed to warm {} candles: {}", timeframe, e),
            },
            Err(e) => tracing::warn!("  ✗ Failed to load {} candles from Redis: {}", timeframe, e),
        }
    }
}

// ============================================================================
// Live trading
// ============================================================================

async fn run(settings: Settings) -> Result<()> {
    tracing::info!("🚀 SweepBot starting - {} paper trading", settings.feed.product_id);

    let store = CandleStore::new(settings.storage.candle_capacity);
    let outbox = Outbox::default();

    let postgres = connect_to_postgres(&settings).await;
    let engine = Arc::new(initialize_engine(&settings, store.clone(), outbox.clone(), postgres.as_ref()).await?);
    let postgres = postgres.map(Arc::new);

    let cache = connect_to_redis(&settings).await;
    if let Some(cache) = &cache {
        warm_from_cache(cache, &store).await;
    }

    let op_timeout = Duration::from_secs(settings.schedule.operation_timeout_secs);
    let client = CoinbaseClient::new(&settings.feed, op_timeout)?;

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Balance: ${:.2}", engine.balance()?);
    tracing::info!("  Risk per trade: {}%", settings.risk.risk_per_trade * 100.0);
    tracing::info!("  Min R:R: {}", settings.risk.min_risk_reward);
    tracing::info!("  Daily loss limit: {}%", settings.risk.daily_loss_limit_pct * 100.0);
    tracing::info!("  Persistence: postgres={} redis={}", postgres.is_some(), cache.is_some());

    let cancel = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    tracing::info!("\n🔄 Spawning independent loops...");

    // Feed supervisor
    {
        let mut supervisor = FeedSupervisor::new(
            client,
            store.clone(),
            ReconnectPolicy::from_params(&settings.feed),
            Duration::from_secs(settings.feed.heartbeat_timeout_secs),
            op_timeout,
        );
        if let Some(cache) = cache.clone() {
            supervisor = supervisor.with_cache(cache);
        }
        let period = Duration::from_secs(settings.feed.poll_interval_secs);
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = supervisor.run(period, cancel.clone()).await {
                tracing::error!("🛑 Feed lost: {}", e);
                cancel.cancel();
            }
        }));
    }

    // Bias scan: new coarse candles
    tasks.push(spawn_engine_loop(
        "🧭 BIAS",
        Duration::from_secs(settings.schedule.bias_scan_secs),
        engine.clone(),
        postgres.clone(),
        cancel.clone(),
        |engine, now| {
            let scan = engine.bias_scan(now)?;
            if !scan.sweeps.is_empty() {
                tracing::info!("🧭 [BIAS] {} new sweep(s)", scan.sweeps.len());
            }
            Ok(scan.candles_checked > 0)
        },
    ));

    // Execution scan: only while a bias is active
    tasks.push(spawn_engine_loop(
        "💹 EXECUTION",
        Duration::from_secs(settings.schedule.execution_scan_secs),
        engine.clone(),
        postgres.clone(),
        cancel.clone(),
        |engine, now| {
            if !engine.has_bias()? {
                return Ok(false);
            }
            let scan = engine.execution_scan(now)?;
            for proposal in &scan.proposals {
                match &proposal.trade {
                    Some(trade) => tracing::info!(
                        "💹 [EXECUTION] Opened {} {} @ ${:.2} | SL ${:.2} | TP ${:.2}",
                        trade.direction,
                        trade.id,
                        trade.entry_price,
                        trade.stop_loss,
                        trade.take_profit
                    ),
                    None => tracing::info!(
                        "💹 [EXECUTION] Proposal rejected: {} reason(s)",
                        proposal.rejection_reasons.len()
                    ),
                }
            }
            Ok(scan.changed())
        },
    ));

    // Position tick: only while a trade is open
    tasks.push(spawn_engine_loop(
        "📍 POSITION",
        Duration::from_secs(settings.schedule.position_tick_secs),
        engine.clone(),
        postgres.clone(),
        cancel.clone(),
        |engine, now| {
            if !engine.has_open_trade()? {
                return Ok(false);
            }
            Ok(matches!(
                engine.position_tick(now)?,
                Some(TickOutcome::Protected { .. }) | Some(TickOutcome::Closed(_))
            ))
        },
    ));

    tasks.push(spawn_outbox_logger(engine.clone(), cancel.clone()));

    if let Some(cache) = cache {
        tasks.push(spawn_cache_cleanup(cache, cancel.clone()));
    }

    tracing::info!("✅ All loops spawned successfully");
    tracing::info!("  🧭 Bias scan: every {}s", settings.schedule.bias_scan_secs);
    tracing::info!("  💹 Execution scan: every {}s", settings.schedule.execution_scan_secs);
    tracing::info!("  📍 Position tick: every {}s", settings.schedule.position_tick_secs);
    tracing::info!("\nPress Ctrl+C to stop...\n");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
        }
        _ = cancel.cancelled() => {
            tracing::error!("⚠️  A loop halted, shutting down...");
        }
    }
    cancel.cancel();

    let grace = Duration::from_secs(settings.schedule.shutdown_grace_secs);
    let drained = tokio::time::timeout(grace, async {
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Task ended abnormally: {}", e);
            }
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Loops did not finish within {:?}", grace);
    }

    if let Some(db) = &postgres {
        save_state(&engine, db).await;
    }
    log_account_summary(&engine);

    tracing::info!("👋 SweepBot stopped");
    Ok(())
}

/// Run `step` every `period` until cancelled
///
/// `step` returns whether state changed and should be saved. Fatal errors
/// cancel every loop; anything else skips the cycle.
fn spawn_engine_loop<F>(
    name: &'static str,
    period: Duration,
    engine: Arc<Engine>,
    postgres: Option<Arc<PostgresPersistence>>,
    cancel: CancellationToken,
    step: F,
) -> JoinHandle<()>
where
    F: Fn(&Engine, DateTime<Utc>) -> BotResult<bool> + Send + 'static,
{
    tokio::spawn(async move {
        tracing::info!("{} loop starting...", name);

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match step(engine.as_ref(), Utc::now()) {
                Ok(true) => {
                    if let Some(db) = &postgres {
                        save_state(&engine, db).await;
                    }
                }
                Ok(false) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!("{} halted: {}", name, e);
                    cancel.cancel();
                    break;
                }
                Err(e) => tracing::warn!("{} cycle skipped: {}", name, e),
            }
        }

        tracing::info!("{} loop stopped", name);
    })
}

fn spawn_outbox_logger(engine: Arc<Engine>, cancel: CancellationToken) -> JoinHandle<()> {
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.recv() => next,
            };

            match next {
                Some(Ok(event)) => log_event(&event.event),
                Some(Err(e)) => tracing::warn!("Outbox: {}", e),
                None => break,
            }
        }
    })
}

fn log_event(event: &DomainEvent) {
    match event {
        DomainEvent::TradeOpened {
            trade_id,
            direction,
            entry_price,
            ..
        } => tracing::info!("📣 Trade {} opened {} @ ${:.2}", trade_id, direction, entry_price),
        DomainEvent::TradeClosed {
            trade_id,
            outcome,
            pnl,
            ..
        } => tracing::info!("📣 Trade {} closed: {} (${:.2})", trade_id, outcome, pnl),
        other => tracing::debug!(event = ?other, "📣 Domain event"),
    }
}

fn spawn_cache_cleanup(cache: CandleCache, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(CACHE_CLEANUP_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tracing::info!("🧹 Running Redis cleanup...");
            for timeframe in [Timeframe::Coarse, Timeframe::Fine] {
                match cache.cleanup_old(timeframe).await {
                    Ok(removed) if removed > 0 => {
                        tracing::info!("  ✓ Cleaned up {} old {} candles", removed, timeframe)
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("  ✗ Failed to cleanup {}: {}", timeframe, e),
                }
            }
        }
    })
}

async fn save_state(engine: &Engine, postgres: &PostgresPersistence) {
    let snapshot = match engine.snapshot() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::error!("Failed to snapshot state: {}", e);
            return;
        }
    };
    if let Err(e) = postgres.save_snapshot(&snapshot).await {
        tracing::warn!("Failed to save state to database: {}", e);
    }
}

fn log_account_summary(engine: &Engine) {
    let (Ok(balance), Ok(trades)) = (engine.balance(), engine.trades()) else {
        return;
    };
    let closed: Vec<_> = trades.iter().filter(|t| !t.is_open()).collect();
    let total_pnl: f64 = closed.iter().filter_map(|t| t.pnl).sum();

    tracing::info!("\n📊 Account Summary:");
    tracing::info!("  Balance: ${:.2}", balance);
    tracing::info!("  Closed trades: {} | P&L: ${:.2}", closed.len(), total_pnl);
    if let Some(open) = trades.iter().find(|t| t.is_open()) {
        tracing::info!(
            "  Open: {} {} @ ${:.2} | SL ${:.2} | TP ${:.2}",
            open.id,
            open.direction,
            open.entry_price,
            open.stop_loss,
            open.take_profit
        );
    }
}

// ============================================================================
// Backtest
// ============================================================================

fn backtest(mut settings: Settings, coarse: PathBuf, fine: PathBuf, no_costs: bool) -> Result<()> {
    if no_costs {
        settings.costs = ExecutionCosts::none();
    }

    let coarse_candles = load_csv(&coarse)?;
    let fine_candles = load_csv(&fine)?;

    let runner = BacktestRunner::new(settings);
    let name = fine
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "backtest".to_string());
    runner.run_and_report(coarse_candles, fine_candles, &name)?;

    Ok(())
}
