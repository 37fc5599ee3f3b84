use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::RiskParams;

/// Circuit breakers to stop opening trades after a bad run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakers {
    pub daily_loss_limit_pct: f64,
    pub consecutive_loss_limit: u32,
    pub min_account_balance: f64,
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::from(&RiskParams::default())
    }
}

impl From<&RiskParams> for CircuitBreakers {
    fn from(params: &RiskParams) -> Self {
        Self {
            daily_loss_limit_pct: params.daily_loss_limit_pct,
            consecutive_loss_limit: params.consecutive_loss_limit,
            min_account_balance: params.min_account_balance,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TradingState {
    pub balance: f64,
    pub peak_balance: f64,
    /// Balance when the current UTC day started
    pub day_start_balance: f64,
    pub daily_pnl: f64,
    pub consecutive_losses: u32,
    pub daily_trades: u32,
    pub trading_day: NaiveDate,
}

impl TradingState {
    pub fn new(balance: f64, now: DateTime<Utc>) -> Self {
        Self {
            balance,
            peak_balance: balance,
            day_start_balance: balance,
            daily_pnl: 0.0,
            consecutive_losses: 0,
            daily_trades: 0,
            trading_day: now.date_naive(),
        }
    }

    /// Start a new day's counters once the UTC date changes
    pub fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.trading_day {
            self.trading_day = today;
            self.day_start_balance = self.balance;
            self.daily_pnl = 0.0;
            self.daily_trades = 0;
        }
    }

    /// Book a closed trade's net P&L
    pub fn record_close(&mut self, pnl: f64, is_loss: bool) {
        self.balance += pnl;
        self.daily_pnl += pnl;
        self.daily_trades += 1;
        if self.balance > self.peak_balance {
            self.peak_balance = self.balance;
        }

        if is_loss {
            self.consecutive_losses += 1;
        } else {
            self.consecutive_losses = 0;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerTrip {
    DailyLoss,
    ConsecutiveLosses,
    BelowMinimumBalance,
}

impl fmt::Display for CircuitBreakerTrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerTrip::DailyLoss => write!(f, "daily loss limit reached"),
            CircuitBreakerTrip::ConsecutiveLosses => write!(f, "consecutive loss limit reached"),
            CircuitBreakerTrip::BelowMinimumBalance => write!(f, "balance below minimum"),
        }
    }
}

impl CircuitBreakers {
    pub fn check(&self, state: &TradingState) -> Result<(), CircuitBreakerTrip> {
        // Check daily loss against the day's opening balance
        if state.day_start_balance > 0.0 {
            let daily_loss_pct = state.daily_pnl / state.day_start_balance;
            if daily_loss_pct <= -self.daily_loss_limit_pct {
                return Err(CircuitBreakerTrip::DailyLoss);
            }
        }

        // Check consecutive losses
        if state.consecutive_losses >= self.consecutive_loss_limit {
            return Err(CircuitBreakerTrip::ConsecutiveLosses);
        }

        // Check account floor
        if state.balance < self.min_account_balance {
            return Err(CircuitBreakerTrip::BelowMinimumBalance);
        }

        Ok(())
    }
}
