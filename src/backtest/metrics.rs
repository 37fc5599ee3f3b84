use crate::models::{Direction, Outcome, Trade};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Record of a single closed trade for analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub direction: Direction,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub position_size: f64,
    pub pnl: f64,
    pub outcome: Outcome,
    pub risk_reward_ratio: f64,
    pub holding_period_minutes: i64,
}

impl TradeRecord {
    pub fn from_trade(trade: &Trade) -> Option<Self> {
        if let (Some(exit_price), Some(exit_time), Some(pnl), Some(outcome)) =
            (trade.exit_price, trade.exit_time, trade.pnl, trade.outcome)
        {
            Some(Self {
                direction: trade.direction,
                entry_time: trade.entry_time,
                exit_time,
                entry_price: trade.entry_price,
                exit_price,
                position_size: trade.position_size,
                pnl,
                outcome,
                risk_reward_ratio: trade.risk_reward_ratio,
                holding_period_minutes: (exit_time - trade.entry_time).num_minutes(),
            })
        } else {
            None
        }
    }
}

/// Complete backtest performance metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestMetrics {
    // P&L Metrics
    pub total_pnl: f64,
    pub total_return_pct: f64,
    pub initial_balance: f64,
    pub final_balance: f64,

    // Trade Statistics
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub breakevens: usize,
    pub structure_exits: usize,
    pub time_limit_exits: usize,
    pub win_rate: f64,

    // P&L Distribution
    pub avg_risk_reward: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    pub profit_factor: f64, // Total gains / Total losses

    // Risk Metrics
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,

    pub avg_holding_period_minutes: f64,

    // Signals that never became trades
    pub rejected_proposals: usize,
    pub circuit_breaker_hits: usize,

    // Trade Records
    pub trades: Vec<TradeRecord>,
}

impl BacktestMetrics {
    /// Calculate metrics from the trade arena
    ///
    /// Trades still open are ignored; the runner closes them first.
    pub fn from_trades(
        trades: &[Trade],
        initial_balance: f64,
        rejected_proposals: usize,
        circuit_breaker_hits: usize,
    ) -> Self {
        let mut records: Vec<TradeRecord> = trades.iter().filter_map(TradeRecord::from_trade).collect();
        records.sort_by_key(|t| t.exit_time);

        let total_trades = records.len();
        let count = |outcome: Outcome| records.iter().filter(|t| t.outcome == outcome).count();

        let wins = count(Outcome::Win);
        let losses = count(Outcome::Loss);
        let breakevens = count(Outcome::Breakeven);
        let structure_exits = count(Outcome::Structure);
        let time_limit_exits = count(Outcome::TimeLimit);

        let total_pnl: f64 = records.iter().map(|t| t.pnl).sum();
        let final_balance = initial_balance + total_pnl;
        let total_return_pct = if initial_balance > 0.0 {
            (total_pnl / initial_balance) * 100.0
        } else {
            0.0
        };

        let win_rate = if total_trades > 0 {
            (wins as f64 / total_trades as f64) * 100.0
        } else {
            0.0
        };

        let avg_risk_reward = if total_trades > 0 {
            records.iter().map(|t| t.risk_reward_ratio).sum::<f64>() / total_trades as f64
        } else {
            0.0
        };

        let best_trade = records.iter().map(|t| t.pnl).reduce(f64::max).unwrap_or(0.0);
        let worst_trade = records.iter().map(|t| t.pnl).reduce(f64::min).unwrap_or(0.0);

        let gains: f64 = records.iter().map(|t| t.pnl).filter(|p| *p > 0.0).sum();
        let losses_total: f64 = records.iter().map(|t| t.pnl).filter(|p| *p < 0.0).map(f64::abs).sum();
        let profit_factor = if losses_total > 0.0 {
            gains / losses_total
        } else if gains > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let (max_drawdown, max_drawdown_pct) = Self::calculate_drawdown(&records, initial_balance);

        let avg_holding_period_minutes = if total_trades > 0 {
            records.iter().map(|t| t.holding_period_minutes).sum::<i64>() as f64 / total_trades as f64
        } else {
            0.0
        };

        Self {
            total_pnl,
            total_return_pct,
            initial_balance,
            final_balance,
            total_trades,
            wins,
            losses,
            breakevens,
            structure_exits,
            time_limit_exits,
            win_rate,
            avg_risk_reward,
            best_trade,
            worst_trade,
            profit_factor,
            max_drawdown,
            max_drawdown_pct,
            avg_holding_period_minutes,
            rejected_proposals,
            circuit_breaker_hits,
            trades: records,
        }
    }

    /// Largest peak-to-trough fall of the closed-trade equity curve
    fn calculate_drawdown(trades: &[TradeRecord], initial_value: f64) -> (f64, f64) {
        let mut peak = initial_value;
        let mut max_dd = 0.0;
        let mut max_dd_pct = 0.0;
        let mut current_value = initial_value;

        for trade in trades {
            current_value += trade.pnl;

            if current_value > peak {
                peak = current_value;
            }

            let drawdown = peak - current_value;
            if drawdown > max_dd {
                max_dd = drawdown;
                max_dd_pct = if peak > 0.0 { (drawdown / peak) * 100.0 } else { 0.0 };
            }
        }

        (max_dd, max_dd_pct)
    }

    /// Print a formatted report to stdout
    pub fn print_report(&self) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║              BACKTEST PERFORMANCE REPORT              ║");
        println!("╚═══════════════════════════════════════════════════════╝\n");

        println!("📊 P&L SUMMARY");
        println!("  Initial Balance:       ${:.2}", self.initial_balance);
        println!("  Final Balance:         ${:.2}", self.final_balance);
        println!(
            "  Net P&L:               ${:.2} ({:+.2}%)",
            self.total_pnl, self.total_return_pct
        );

        println!("\n📈 TRADE STATISTICS");
        println!("  Total Trades:          {}", self.total_trades);
        println!("  Wins:                  {} ({:.1}%)", self.wins, self.win_rate);
        println!("  Losses:                {}", self.losses);
        println!("  Breakevens:            {}", self.breakevens);
        println!("  Structure Exits:       {}", self.structure_exits);
        println!("  Time-Limit Exits:      {}", self.time_limit_exits);

        if self.total_trades > 0 {
            println!("\n💰 WIN/LOSS ANALYSIS");
            println!("  Average R:R:           {:.2}", self.avg_risk_reward);
            println!("  Best Trade:            ${:.2}", self.best_trade);
            println!("  Worst Trade:           ${:.2}", self.worst_trade);
            println!("  Profit Factor:         {:.2}", self.profit_factor);

            println!("\n⚠️  RISK METRICS");
            println!(
                "  Max Drawdown:          ${:.2} ({:.2}%)",
                self.max_drawdown, self.max_drawdown_pct
            );
            println!(
                "  Avg Holding Period:    {:.1} hours",
                self.avg_holding_period_minutes / 60.0
            );
        }

        println!("\n🛑 REJECTIONS");
        println!("  Rejected Proposals:    {}", self.rejected_proposals);
        println!("  Circuit Breaker Hits:  {}", self.circuit_breaker_hits);

        println!("\n═══════════════════════════════════════════════════════\n");
    }
}
