use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RejectionReason;

/// Enums stored as text (Postgres rows, outbox payloads, logs)
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("invalid {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

/// Candle resolution. COARSE drives bias, FINE drives execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timeframe {
    Coarse,
    Fine,
}

text_enum!(Timeframe { Coarse => "4H", Fine => "5M" });

impl Timeframe {
    pub fn seconds(&self) -> i64 {
        match self {
            Timeframe::Coarse => 4 * 60 * 60,
            Timeframe::Fine => 5 * 60,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SwingType {
    High,
    Low,
}

text_enum!(SwingType { High => "HIGH", Low => "LOW" });

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Bias {
    Bullish,
    Bearish,
}

text_enum!(Bias { Bullish => "BULLISH", Bearish => "BEARISH" });

impl Bias {
    /// Sweeping a high reads as bearish, sweeping a low as bullish
    pub fn from_sweep(sweep_type: SwingType) -> Self {
        match sweep_type {
            SwingType::High => Bias::Bearish,
            SwingType::Low => Bias::Bullish,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Bias::Bullish => Bias::Bearish,
            Bias::Bearish => Bias::Bullish,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    Long,
    Short,
}

text_enum!(Direction { Long => "LONG", Short => "SHORT" });

impl Direction {
    pub fn for_bias(bias: Bias) -> Self {
        match bias {
            Bias::Bullish => Direction::Long,
            Bias::Bearish => Direction::Short,
        }
    }

    /// Swing type the protective stop hangs off
    pub fn stop_swing_type(&self) -> SwingType {
        match self {
            Direction::Long => SwingType::Low,
            Direction::Short => SwingType::High,
        }
    }

    /// Swing type the target is taken from
    pub fn target_swing_type(&self) -> SwingType {
        match self {
            Direction::Long => SwingType::High,
            Direction::Short => SwingType::Low,
        }
    }

    /// +1 for long, -1 for short
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

/// OHLCV candle, keyed by its open timestamp
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Check `high >= max(open, close) >= min(open, close) >= low` and positive prices
    pub fn validate(&self) -> Result<(), RejectionReason> {
        let invalid = |detail: String| RejectionReason::InvalidCandle {
            timestamp: self.timestamp,
            detail,
        };

        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(invalid(format!(
                "non-positive price (o={} h={} l={} c={})",
                self.open, self.high, self.low, self.close
            )));
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(invalid(format!("negative volume {}", self.volume)));
        }
        if self.high < self.open.max(self.close) {
            return Err(invalid(format!(
                "high {} below body top {}",
                self.high,
                self.open.max(self.close)
            )));
        }
        if self.low > self.open.min(self.close) {
            return Err(invalid(format!(
                "low {} above body bottom {}",
                self.low,
                self.open.min(self.close)
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SwingLevel {
    pub id: u64,
    pub timeframe: Timeframe,
    pub swing_type: SwingType,
    pub price: f64,
    pub active: bool,
    /// Timestamp of the extremum candle
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiquiditySweep {
    pub id: u64,
    pub sweep_type: SwingType,
    /// Extreme that pierced the swing
    pub price: f64,
    pub bias: Bias,
    pub swing_level_ref: u64,
    pub swing_price: f64,
    pub active: bool,
    /// Open time of the coarse candle that swept
    pub timestamp: DateTime<Utc>,
    /// Close of the sweep candle, kept for confirmation
    pub sweep_close: f64,
    pub confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConfluenceStage {
    WaitingChoch,
    WaitingFvg,
    WaitingBos,
    Complete,
    Expired,
}

text_enum!(ConfluenceStage {
    WaitingChoch => "WAITING_CHOCH",
    WaitingFvg => "WAITING_FVG",
    WaitingBos => "WAITING_BOS",
    Complete => "COMPLETE",
    Expired => "EXPIRED",
});

impl ConfluenceStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConfluenceStage::Complete | ConfluenceStage::Expired)
    }
}

/// Progress of the CHoCH -> FVG fill -> BOS pattern for one sweep
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfluenceState {
    pub id: u64,
    pub sweep_ref: u64,
    pub current_state: ConfluenceStage,
    pub bias: Bias,

    pub choch_detected: bool,
    pub choch_time: Option<DateTime<Utc>>,
    pub choch_price: Option<f64>,

    pub fvg_detected: bool,
    pub fvg_zone_low: Option<f64>,
    pub fvg_zone_high: Option<f64>,
    /// Open time of the third candle of the imbalance
    pub fvg_formed_time: Option<DateTime<Utc>>,
    pub fvg_fill_time: Option<DateTime<Utc>>,
    pub fvg_fill_price: Option<f64>,

    pub bos_detected: bool,
    pub bos_time: Option<DateTime<Utc>>,
    pub bos_price: Option<f64>,

    pub sequence_valid: bool,
    pub created_at: DateTime<Utc>,
    /// Newest fine candle already folded into this state
    pub last_candle_time: Option<DateTime<Utc>>,
    /// A proposal has been attempted for this row
    pub consumed: bool,
}

impl ConfluenceState {
    pub fn new(id: u64, sweep: &LiquiditySweep, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            sweep_ref: sweep.id,
            current_state: ConfluenceStage::WaitingChoch,
            bias: sweep.bias,
            choch_detected: false,
            choch_time: None,
            choch_price: None,
            fvg_detected: false,
            fvg_zone_low: None,
            fvg_zone_high: None,
            fvg_formed_time: None,
            fvg_fill_time: None,
            fvg_fill_price: None,
            bos_detected: false,
            bos_time: None,
            bos_price: None,
            sequence_valid: false,
            created_at,
            last_candle_time: None,
            consumed: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }

    /// BOS closed strictly beyond CHoCH in the bias direction
    pub fn price_action_consistent(&self) -> bool {
        match (self.choch_price, self.bos_price) {
            (Some(choch), Some(bos)) => match self.bias {
                Bias::Bullish => bos > choch,
                Bias::Bearish => bos < choch,
            },
            _ => false,
        }
    }

    /// COMPLETE, ordered timestamps, and price action agrees with the bias
    pub fn is_actionable(&self) -> bool {
        self.current_state == ConfluenceStage::Complete
            && self.sequence_valid
            && self.price_action_consistent()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StopSource {
    FineSwing,
    CoarseSwing,
}

text_enum!(StopSource { FineSwing => "5M_SWING", CoarseSwing => "4H_SWING" });

impl StopSource {
    pub fn for_timeframe(timeframe: Timeframe) -> Self {
        match timeframe {
            Timeframe::Fine => StopSource::FineSwing,
            Timeframe::Coarse => StopSource::CoarseSwing,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TradeStatus {
    Open,
    Closed,
}

text_enum!(TradeStatus { Open => "OPEN", Closed => "CLOSED" });

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TimeLimit,
    Structure,
    Manual,
}

text_enum!(ExitReason {
    StopLoss => "STOP_LOSS",
    TakeProfit => "TAKE_PROFIT",
    TimeLimit => "TIME_LIMIT",
    Structure => "STRUCTURE",
    Manual => "MANUAL",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Outcome {
    Win,
    Loss,
    Breakeven,
    Structure,
    TimeLimit,
}

text_enum!(Outcome {
    Win => "WIN",
    Loss => "LOSS",
    Breakeven => "BREAKEVEN",
    Structure => "STRUCTURE",
    TimeLimit => "TIME_LIMIT",
});

/// Stable arena index of a trade
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TradeId(pub u64);

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub id: TradeId,
    pub confluence_ref: u64,
    pub direction: Direction,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_loss: f64,
    /// Structure-derived stop; the only other legal stop value is `entry_price`
    pub initial_stop_loss: f64,
    pub stop_loss_source: StopSource,
    pub stop_loss_swing_price: f64,
    pub stop_distance_pct: f64,
    pub take_profit: f64,
    pub position_size: f64,
    pub risk_amount: f64,
    pub risk_reward_ratio: f64,
    pub trailing_stop_activated: bool,
    pub trailing_activated_at: Option<DateTime<Utc>>,
    pub status: TradeStatus,
    pub outcome: Option<Outcome>,
    pub exit_reason: Option<ExitReason>,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub pnl: Option<f64>,
}

impl Trade {
    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    pub fn notional(&self) -> f64 {
        self.position_size * self.entry_price
    }
}
