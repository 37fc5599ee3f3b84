use crate::backtest::metrics::BacktestMetrics;
use crate::config::Settings;
use crate::engine::Engine;
use crate::error::{BotError, RejectionReason};
use crate::events::Outbox;
use crate::execution::{CandleStore, TradeProposal};
use crate::models::{Candle, Direction, ExitReason, Timeframe};
use crate::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::io::Read;
use std::path::Path;

/// One CSV row: timestamp, open, high, low, close, volume
#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

/// RFC 3339, or unix time in seconds (milliseconds above 1e12)
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        let parsed = if secs > 1_000_000_000_000 {
            Utc.timestamp_millis_opt(secs).single()
        } else {
            Utc.timestamp_opt(secs, 0).single()
        };
        return parsed.ok_or_else(|| format!("Timestamp out of range: {}", raw).into());
    }
    Ok(DateTime::parse_from_rfc3339(raw)
        .map_err(|e| format!("Bad timestamp '{}': {}", raw, e))?
        .with_timezone(&Utc))
}

/// Read candles from any CSV source, sorted oldest first
pub fn read_candles<R: Read>(reader: R) -> Result<Vec<Candle>> {
    let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);

    let mut candles = Vec::new();
    for result in csv_reader.deserialize() {
        let row: CsvRow = result?;
        candles.push(Candle {
            timestamp: parse_timestamp(&row.timestamp)?,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        });
    }

    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}

pub fn load_csv(path: &Path) -> Result<Vec<Candle>> {
    let file = std::fs::File::open(path).map_err(|e| format!("Cannot open {}: {}", path.display(), e))?;
    let candles = read_candles(file)?;
    tracing::info!("Loaded {} candles from {}", candles.len(), path.display());
    Ok(candles)
}

/// Proposal tallies collected while replaying
#[derive(Debug, Default)]
struct Rejections {
    proposals: usize,
    circuit_breaker: usize,
}

impl Rejections {
    fn record(&mut self, proposal: &TradeProposal) {
        if proposal.approved {
            return;
        }
        self.proposals += 1;
        if proposal
            .rejection_reasons
            .iter()
            .any(|r| matches!(r, RejectionReason::CircuitBreaker(_)))
        {
            self.circuit_breaker += 1;
        }
    }
}

/// Replays historical candles through the live engine on a simulated clock
///
/// The clock advances to each fine candle's close. Coarse candles become
/// visible once closed, which triggers a bias scan. The open trade is ticked
/// at the candle's adverse extreme, its favourable extreme, then its close,
/// before the execution scan may open a new trade at that close.
pub struct BacktestRunner {
    settings: Settings,
}

impl BacktestRunner {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Run a backtest over coarse and fine candles
    ///
    /// # Returns
    /// BacktestMetrics with performance data
    pub fn run(&self, coarse: Vec<Candle>, mut fine: Vec<Candle>) -> Result<BacktestMetrics> {
        if fine.is_empty() {
            return Err("Not enough candles for backtest: no fine candles".into());
        }
        fine.sort_by_key(|c| c.timestamp);
        let mut coarse = coarse;
        coarse.sort_by_key(|c| c.timestamp);

        tracing::info!(
            "Starting backtest: {} coarse, {} fine candles",
            coarse.len(),
            fine.len()
        );

        let start = fine[0].timestamp;
        let store = CandleStore::new(self.settings.storage.candle_capacity);
        let engine = Engine::new(&self.settings, store, Outbox::default(), start);

        let mut rejections = Rejections::default();
        let mut next_coarse = 0;
        let mut clock = start;

        for candle in &fine {
            clock = candle.timestamp + Timeframe::Fine.duration();

            let mut coarse_closed = false;
            while next_coarse < coarse.len() && coarse[next_coarse].timestamp + Timeframe::Coarse.duration() <= clock {
                coarse_closed |= self.ingest(&engine, Timeframe::Coarse, coarse[next_coarse].clone())?;
                next_coarse += 1;
            }
            if coarse_closed {
                engine.bias_scan(clock)?;
            }

            if !self.ingest(&engine, Timeframe::Fine, candle.clone())? {
                continue;
            }

            if let Some(trade) = engine.open_trade()? {
                let (adverse, favourable) = match trade.direction {
                    Direction::Long => (candle.low, candle.high),
                    Direction::Short => (candle.high, candle.low),
                };
                for price in [adverse, favourable, candle.close] {
                    if engine.tick_price(price, clock)?.is_none() {
                        break;
                    }
                    if !engine.has_open_trade()? {
                        break;
                    }
                }
            }

            let scan = engine.execution_scan(clock)?;
            for proposal in &scan.proposals {
                rejections.record(proposal);
            }
        }

        // Close any remaining open trade at the final close
        if let Some(trade) = engine.open_trade()? {
            engine.close_trade(trade.id, ExitReason::Manual, clock)?;
        }

        let metrics = BacktestMetrics::from_trades(
            &engine.trades()?,
            self.settings.risk.starting_balance,
            rejections.proposals,
            rejections.circuit_breaker,
        );

        tracing::info!(
            "Backtest complete: {} trades, P&L: ${:.2} ({:.2}%)",
            metrics.total_trades,
            metrics.total_pnl,
            metrics.total_return_pct
        );

        Ok(metrics)
    }

    /// Store one candle; invalid candles are skipped
    fn ingest(&self, engine: &Engine, timeframe: Timeframe, candle: Candle) -> Result<bool> {
        match engine.store().ingest(timeframe, candle) {
            Ok(stored) => Ok(stored),
            Err(BotError::Validation(reason)) => {
                tracing::warn!(timeframe = %timeframe, "Skipping candle: {}", reason);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run backtest and print report
    pub fn run_and_report(
        &self,
        coarse: Vec<Candle>,
        fine: Vec<Candle>,
        scenario_name: &str,
    ) -> Result<BacktestMetrics> {
        println!("\n🔬 Running backtest: {}", scenario_name);
        println!("   4H Candles: {}", coarse.len());
        println!("   5M Candles: {}", fine.len());
        println!("   Initial Balance: ${:.2}", self.settings.risk.starting_balance);

        let metrics = self.run(coarse, fine)?;
        metrics.print_report();

        Ok(metrics)
    }
}
