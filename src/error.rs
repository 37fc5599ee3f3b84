//! Error kinds for the strategy core.
//!
//! Validation failures are expected and enumerable: they reject a candle, a
//! proposal or a write and are never retried. Transient failures come from the
//! outside world and are retried by the loop that owns them. Fatal errors mean
//! a core invariant is already broken and the owning task must stop.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{Bias, Direction, Timeframe};

/// Why a candle, proposal or state write was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectionReason {
    #[error("invalid candle at {timestamp}: {detail}")]
    InvalidCandle {
        timestamp: DateTime<Utc>,
        detail: String,
    },

    #[error("direction {direction} does not match bias {bias}")]
    DirectionBiasMismatch { direction: Direction, bias: Bias },

    #[error("no active {timeframe} swing available for the stop")]
    NoSwing { timeframe: Timeframe },

    #[error("{timeframe} stop {stop:.2} is on the wrong side of entry {entry:.2}")]
    StopWrongSide {
        timeframe: Timeframe,
        stop: f64,
        entry: f64,
    },

    #[error("{timeframe} stop distance {distance_pct:.3}% is below the {min_pct}% minimum")]
    StopTooTight {
        timeframe: Timeframe,
        distance_pct: f64,
        min_pct: f64,
    },

    #[error("{timeframe} stop distance {distance_pct:.3}% is above the {max_pct}% maximum")]
    StopTooWide {
        timeframe: Timeframe,
        distance_pct: f64,
        max_pct: f64,
    },

    #[error("position notional {notional:.2} exceeds cap {cap:.2}")]
    PositionTooLarge { notional: f64, cap: f64 },

    #[error("no structural target reaches the {min_rr}R floor at {floor:.2}")]
    NoStructuralTarget { floor: f64, min_rr: f64 },

    #[error("risk/reward {ratio:.2} is below the {min_rr} minimum")]
    RiskRewardTooLow { ratio: f64, min_rr: f64 },

    #[error("account balance must be positive, got {0}")]
    NonPositiveBalance(f64),

    #[error("entry and stop are identical")]
    ZeroStopDistance,

    #[error("confluence {0} is not actionable")]
    NotActionable(u64),

    #[error("confluence {0} was already consumed")]
    AlreadyConsumed(u64),

    #[error("timestamps out of order: choch {choch:?}, fvg fill {fill:?}, bos {bos:?}")]
    MalformedSequence {
        choch: Option<DateTime<Utc>>,
        fill: Option<DateTime<Utc>>,
        bos: Option<DateTime<Utc>>,
    },

    #[error("trade {0} is already open")]
    TradeAlreadyOpen(u64),

    #[error("confluence {0} is already in progress")]
    ConfluenceInProgress(u64),

    #[error("sweep {0} already has a confluence")]
    SweepAlreadyTracked(u64),

    #[error("sweep {sweep_id} behind confluence {confluence_id} is no longer active")]
    SweepSuperseded { confluence_id: u64, sweep_id: u64 },

    #[error("sweep {sweep_id} is older than the {hours}h validity window")]
    SweepExpired { sweep_id: u64, hours: i64 },

    #[error("circuit breaker tripped: {0}")]
    CircuitBreaker(String),

    #[error("trade {0} not found")]
    TradeNotFound(u64),
}

/// A broken core invariant. Never auto-healed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FatalError {
    #[error("{count} active sweeps observed (at most one allowed)")]
    MultipleActiveSweeps { count: usize },

    #[error("{count} open trades observed (at most one allowed)")]
    MultipleOpenTrades { count: usize },

    #[error("{count} non-terminal confluence states observed (at most one allowed)")]
    MultipleOpenConfluences { count: usize },

    #[error("attempted to mutate terminal {entity} {id}")]
    TerminalMutation { entity: &'static str, id: u64 },

    #[error("shared state lock poisoned: {0}")]
    Poisoned(String),
}

/// Top-level error for the scan operations.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("rejected: {0}")]
    Validation(#[from] RejectionReason),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(#[from] FatalError),
}

impl BotError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BotError::Fatal(_))
    }

    pub fn transient(err: impl std::fmt::Display) -> Self {
        BotError::Transient(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for FatalError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        FatalError::Poisoned(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for BotError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        BotError::Fatal(err.into())
    }
}

pub type BotResult<T> = std::result::Result<T, BotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let err: BotError = FatalError::MultipleActiveSweeps { count: 2 }.into();
        assert!(err.is_fatal());

        let err: BotError = RejectionReason::ZeroStopDistance.into();
        assert!(!err.is_fatal());
        assert!(!BotError::transient("timeout").is_fatal());
    }

    #[test]
    fn test_rejection_messages_name_timeframe() {
        let reason = RejectionReason::StopTooWide {
            timeframe: Timeframe::Coarse,
            distance_pct: 5.56,
            max_pct: 3.0,
        };
        assert!(reason.to_string().contains("4H"));
        assert!(reason.to_string().contains("5.560%"));
    }
}
