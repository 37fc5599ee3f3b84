use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::config::{ExecutionCosts, RiskParams};
use crate::error::{BotError, BotResult, FatalError, RejectionReason};
use crate::models::{Direction, ExitReason, Outcome, Trade, TradeId, TradeStatus};
use crate::risk::{CircuitBreakerTrip, CircuitBreakers, PositionPlan, StopLoss, TradingState};

/// P&L inside this band counts as breakeven on manual closes
const BREAKEVEN_BAND: f64 = 0.01;

/// Everything needed to open a trade from an approved proposal
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub confluence_ref: u64,
    pub direction: Direction,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub stop: StopLoss,
    pub plan: PositionPlan,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloseResult {
    pub trade_id: TradeId,
    pub pnl: f64,
    pub outcome: Outcome,
    pub exit_reason: ExitReason,
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Hold,
    /// Stop moved to entry
    Protected { trade_id: TradeId, stop_loss: f64 },
    Closed(CloseResult),
}

#[derive(Debug, Clone, PartialEq)]
struct Closing {
    exit_price: f64,
    exit_time: DateTime<Utc>,
    reason: ExitReason,
    outcome: Outcome,
    pnl: f64,
}

/// Allow-listed write to an open trade
///
/// The stop can only move to the entry price, once. Closed trades refuse
/// every update.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeUpdate {
    protect_at: Option<DateTime<Utc>>,
    closing: Option<Closing>,
}

impl TradeUpdate {
    pub fn protect(at: DateTime<Utc>) -> Self {
        Self {
            protect_at: Some(at),
            closing: None,
        }
    }

    fn close(closing: Closing) -> Self {
        Self {
            protect_at: None,
            closing: Some(closing),
        }
    }

    pub fn apply(&self, trade: &mut Trade) -> Result<(), FatalError> {
        if !trade.is_open() {
            return Err(FatalError::TerminalMutation {
                entity: "trade",
                id: trade.id.0,
            });
        }

        if let Some(at) = self.protect_at {
            if !trade.trailing_stop_activated {
                trade.stop_loss = trade.entry_price;
                trade.trailing_stop_activated = true;
                trade.trailing_activated_at = Some(at);
            }
        }

        if let Some(closing) = &self.closing {
            trade.status = TradeStatus::Closed;
            trade.exit_price = Some(closing.exit_price);
            trade.exit_time = Some(closing.exit_time);
            trade.exit_reason = Some(closing.reason);
            trade.outcome = Some(closing.outcome);
            trade.pnl = Some(closing.pnl);
        }

        Ok(())
    }
}

/// Net P&L of a round trip after slippage and fees on both fills
pub fn net_pnl(direction: Direction, entry: f64, exit: f64, size: f64, costs: &ExecutionCosts) -> f64 {
    let sign = direction.sign();
    let fill_entry = entry * (1.0 + sign * costs.slippage_pct);
    let fill_exit = exit * (1.0 - sign * costs.slippage_pct);

    let gross = sign * (fill_exit - fill_entry) * size;
    let fees = (fill_entry + fill_exit) * size * costs.fee_pct;
    gross - fees
}

/// Outcome for an exit reason
pub fn classify(reason: ExitReason, protected: bool, pnl: f64) -> Outcome {
    match reason {
        ExitReason::StopLoss if protected => Outcome::Breakeven,
        ExitReason::StopLoss => Outcome::Loss,
        ExitReason::TakeProfit => Outcome::Win,
        ExitReason::TimeLimit => Outcome::TimeLimit,
        ExitReason::Structure => Outcome::Structure,
        ExitReason::Manual if pnl > BREAKEVEN_BAND => Outcome::Win,
        ExitReason::Manual if pnl < -BREAKEVEN_BAND => Outcome::Loss,
        ExitReason::Manual => Outcome::Breakeven,
    }
}

/// Owns every trade and the account they trade against
///
/// Trades live in an arena: `TradeId(n)` is `trades[n - 1]`. At most one
/// trade is open at a time.
pub struct PositionManager {
    trades: Vec<Trade>,
    by_confluence: HashMap<u64, TradeId>,
    open: Option<TradeId>,
    circuit_breakers: CircuitBreakers,
    trading_state: TradingState,
    trailing_activation: f64,
    max_trade_duration: Duration,
    costs: ExecutionCosts,
    starting_balance: f64,
    total_pnl: f64,
}

impl PositionManager {
    pub fn new(risk: &RiskParams, costs: ExecutionCosts, now: DateTime<Utc>) -> Self {
        Self {
            trades: Vec::new(),
            by_confluence: HashMap::new(),
            open: None,
            circuit_breakers: CircuitBreakers::from(risk),
            trading_state: TradingState::new(risk.starting_balance, now),
            trailing_activation: risk.trailing_activation,
            max_trade_duration: Duration::hours(risk.max_trade_hours),
            costs,
            starting_balance: risk.starting_balance,
            total_pnl: 0.0,
        }
    }

    /// Create PositionManager and restore from loaded trades
    ///
    /// Replays closed trades into the balance and loss streak. Ids must be
    /// contiguous from 1.
    pub fn with_trades(
        risk: &RiskParams,
        costs: ExecutionCosts,
        mut trades: Vec<Trade>,
        now: DateTime<Utc>,
    ) -> BotResult<Self> {
        trades.sort_by_key(|t| t.id);
        let mut manager = Self::new(risk, costs, now);

        for (i, trade) in trades.iter().enumerate() {
            if trade.id != TradeId(i as u64 + 1) {
                return Err(BotError::transient(format!(
                    "trade ids are not contiguous: expected {}, found {}",
                    TradeId(i as u64 + 1),
                    trade.id
                )));
            }
        }

        let open: Vec<TradeId> = trades.iter().filter(|t| t.is_open()).map(|t| t.id).collect();
        if open.len() > 1 {
            return Err(FatalError::MultipleOpenTrades { count: open.len() }.into());
        }

        for trade in trades.iter().filter(|t| !t.is_open()) {
            let pnl = trade.pnl.unwrap_or(0.0);
            manager.total_pnl += pnl;
            manager
                .trading_state
                .record_close(pnl, is_loss(trade.outcome, pnl));
        }
        // Only today's closes count toward the daily limit
        manager.trading_state.daily_pnl = trades
            .iter()
            .filter(|t| t.exit_time.is_some_and(|at| at.date_naive() == now.date_naive()))
            .filter_map(|t| t.pnl)
            .sum();
        manager.trading_state.day_start_balance =
            manager.trading_state.balance - manager.trading_state.daily_pnl;

        manager.by_confluence = trades.iter().map(|t| (t.confluence_ref, t.id)).collect();
        manager.open = open.first().copied();
        manager.trades = trades;

        tracing::info!(
            "Restored {} trades from persistence (total P&L: ${:.2})",
            manager.trades.len(),
            manager.total_pnl
        );

        Ok(manager)
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn trade(&self, id: TradeId) -> Option<&Trade> {
        let index = usize::try_from(id.0).ok()?.checked_sub(1)?;
        self.trades.get(index)
    }

    fn trade_mut(&mut self, id: TradeId) -> BotResult<&mut Trade> {
        let index = usize::try_from(id.0)
            .ok()
            .and_then(|i| i.checked_sub(1))
            .ok_or(RejectionReason::TradeNotFound(id.0))?;
        self.trades
            .get_mut(index)
            .ok_or_else(|| RejectionReason::TradeNotFound(id.0).into())
    }

    pub fn trade_for_confluence(&self, confluence_id: u64) -> Option<&Trade> {
        self.by_confluence
            .get(&confluence_id)
            .and_then(|id| self.trade(*id))
    }

    pub fn open_trade(&self) -> Option<&Trade> {
        self.open.and_then(|id| self.trade(id))
    }

    pub fn balance(&self) -> f64 {
        self.trading_state.balance
    }

    pub fn starting_balance(&self) -> f64 {
        self.starting_balance
    }

    pub fn total_pnl(&self) -> f64 {
        self.total_pnl
    }

    pub fn costs(&self) -> &ExecutionCosts {
        &self.costs
    }

    pub fn trading_state(&self) -> &TradingState {
        &self.trading_state
    }

    /// Roll the trading day and run the breakers
    pub fn check_circuit_breakers(&mut self, now: DateTime<Utc>) -> Result<(), CircuitBreakerTrip> {
        self.trading_state.roll_day(now);
        self.circuit_breakers.check(&self.trading_state)
    }

    /// Insert a new OPEN trade, refusing a second concurrent one
    pub fn open_trade_from(&mut self, new: NewTrade) -> BotResult<TradeId> {
        if let Some(open) = self.open {
            return Err(RejectionReason::TradeAlreadyOpen(open.0).into());
        }
        if self.by_confluence.contains_key(&new.confluence_ref) {
            return Err(RejectionReason::AlreadyConsumed(new.confluence_ref).into());
        }

        let id = TradeId(self.trades.len() as u64 + 1);
        let trade = Trade {
            id,
            confluence_ref: new.confluence_ref,
            direction: new.direction,
            entry_price: new.entry_price,
            entry_time: new.entry_time,
            stop_loss: new.stop.price,
            initial_stop_loss: new.stop.price,
            stop_loss_source: new.stop.source,
            stop_loss_swing_price: new.stop.swing_price,
            stop_distance_pct: new.stop.distance_pct,
            take_profit: new.plan.take_profit,
            position_size: new.plan.position_size,
            risk_amount: new.plan.risk_amount,
            risk_reward_ratio: new.plan.risk_reward_ratio,
            trailing_stop_activated: false,
            trailing_activated_at: None,
            status: TradeStatus::Open,
            outcome: None,
            exit_reason: None,
            exit_price: None,
            exit_time: None,
            pnl: None,
        };

        tracing::info!(
            trade = %id,
            direction = %trade.direction,
            entry = trade.entry_price,
            stop = trade.stop_loss,
            target = trade.take_profit,
            size = trade.position_size,
            "Opened trade"
        );

        self.by_confluence.insert(trade.confluence_ref, id);
        self.trades.push(trade);
        self.open = Some(id);
        Ok(id)
    }

    /// Evaluate one price against the open trade
    ///
    /// Order: stop, target, time limit, structure break, then the one-time
    /// move of the stop to entry.
    pub fn tick(
        &mut self,
        id: TradeId,
        price: f64,
        now: DateTime<Utc>,
        structure_break: bool,
    ) -> BotResult<TickOutcome> {
        let trade = self
            .trade(id)
            .ok_or(RejectionReason::TradeNotFound(id.0))?;
        if !trade.is_open() {
            return Ok(TickOutcome::Hold);
        }

        let (stop_hit, target_hit) = match trade.direction {
            Direction::Long => (price <= trade.stop_loss, price >= trade.take_profit),
            Direction::Short => (price >= trade.stop_loss, price <= trade.take_profit),
        };

        if stop_hit {
            let stop = trade.stop_loss;
            return self.close_at(id, ExitReason::StopLoss, stop, now).map(TickOutcome::Closed);
        }
        if target_hit {
            let target = trade.take_profit;
            return self
                .close_at(id, ExitReason::TakeProfit, target, now)
                .map(TickOutcome::Closed);
        }
        if now - trade.entry_time >= self.max_trade_duration {
            return self
                .close_at(id, ExitReason::TimeLimit, price, now)
                .map(TickOutcome::Closed);
        }
        if structure_break {
            return self
                .close_at(id, ExitReason::Structure, price, now)
                .map(TickOutcome::Closed);
        }

        if !trade.trailing_stop_activated && self.progress(trade, price) >= self.trailing_activation {
            let trade = self.trade_mut(id)?;
            TradeUpdate::protect(now).apply(trade)?;
            tracing::info!(trade = %id, stop = trade.stop_loss, "Stop moved to entry");
            return Ok(TickOutcome::Protected {
                trade_id: id,
                stop_loss: trade.stop_loss,
            });
        }

        Ok(TickOutcome::Hold)
    }

    /// Fraction of the way from entry to target, clamped to [0, 1]
    fn progress(&self, trade: &Trade, price: f64) -> f64 {
        let span = trade.take_profit - trade.entry_price;
        if span == 0.0 {
            return 0.0;
        }
        ((price - trade.entry_price) / span).clamp(0.0, 1.0)
    }

    /// Close an open trade at `price`
    pub fn close_trade(
        &mut self,
        id: TradeId,
        reason: ExitReason,
        price: f64,
        now: DateTime<Utc>,
    ) -> BotResult<CloseResult> {
        self.close_at(id, reason, price, now)
    }

    fn close_at(
        &mut self,
        id: TradeId,
        reason: ExitReason,
        exit_price: f64,
        now: DateTime<Utc>,
    ) -> BotResult<CloseResult> {
        let costs = self.costs;
        let trade = self.trade_mut(id)?;

        let pnl = net_pnl(
            trade.direction,
            trade.entry_price,
            exit_price,
            trade.position_size,
            &costs,
        );
        let outcome = classify(reason, trade.trailing_stop_activated, pnl);

        TradeUpdate::close(Closing {
            exit_price,
            exit_time: now,
            reason,
            outcome,
            pnl,
        })
        .apply(trade)?;

        tracing::info!(
            trade = %id,
            reason = %reason,
            outcome = %outcome,
            exit = exit_price,
            pnl = pnl,
            "Closed trade"
        );

        self.trading_state.roll_day(now);
        self.trading_state.record_close(pnl, is_loss(Some(outcome), pnl));
        self.total_pnl += pnl;
        if self.open == Some(id) {
            self.open = None;
        }

        Ok(CloseResult {
            trade_id: id,
            pnl,
            outcome,
            exit_reason: reason,
            exit_price,
            exit_time: now,
        })
    }

    /// Count of open trades, checked against the single-open invariant
    pub fn verify_single_open(&self) -> Result<(), FatalError> {
        let count = self.trades.iter().filter(|t| t.is_open()).count();
        if count > 1 {
            return Err(FatalError::MultipleOpenTrades { count });
        }
        Ok(())
    }
}

fn is_loss(outcome: Option<Outcome>, pnl: f64) -> bool {
    match outcome {
        Some(Outcome::Loss) => true,
        Some(Outcome::Structure) | Some(Outcome::TimeLimit) => pnl < 0.0,
        _ => false,
    }
}
