use chrono::{DateTime, Utc};

use crate::models::{Candle, SwingType};

/// Candles required on each side of a swing candidate
pub const SWING_WING: usize = 2;

/// True iff candle `i` has two neighbours on each side and its high is
/// strictly above all four of their highs
pub fn detect_swing_high(candles: &[Candle], i: usize) -> bool {
    if i < SWING_WING || i + SWING_WING >= candles.len() {
        return false;
    }

    let pivot = candles[i].high;
    (i - SWING_WING..=i + SWING_WING)
        .filter(|&j| j != i)
        .all(|j| pivot > candles[j].high)
}

/// True iff candle `i` has two neighbours on each side and its low is
/// strictly below all four of their lows
pub fn detect_swing_low(candles: &[Candle], i: usize) -> bool {
    if i < SWING_WING || i + SWING_WING >= candles.len() {
        return false;
    }

    let pivot = candles[i].low;
    (i - SWING_WING..=i + SWING_WING)
        .filter(|&j| j != i)
        .all(|j| pivot < candles[j].low)
}

/// A freshly confirmed extremum, not yet stored
#[derive(Debug, Clone, PartialEq)]
pub struct SwingPoint {
    pub swing_type: SwingType,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Walks a candle series and reports each swing exactly once
///
/// A candle is evaluated when its second right neighbour arrives. The cursor
/// only moves forward, so later scans over the same series never re-evaluate it.
#[derive(Debug, Clone, Default)]
pub struct SwingTracker {
    evaluated_through: Option<DateTime<Utc>>,
}

impl SwingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume after a restart: candles at or before `timestamp` are treated as evaluated
    pub fn resume_after(timestamp: DateTime<Utc>) -> Self {
        Self {
            evaluated_through: Some(timestamp),
        }
    }

    pub fn evaluated_through(&self) -> Option<DateTime<Utc>> {
        self.evaluated_through
    }

    /// Evaluate every candle that has become decidable since the last scan
    ///
    /// `candles` must be sorted oldest first. Highs are reported before lows
    /// for the same candle.
    pub fn scan(&mut self, candles: &[Candle]) -> Vec<SwingPoint> {
        let mut found = Vec::new();

        if candles.len() < 2 * SWING_WING + 1 {
            return found;
        }

        for i in SWING_WING..candles.len() - SWING_WING {
            let candle = &candles[i];
            if let Some(cursor) = self.evaluated_through {
                if candle.timestamp <= cursor {
                    continue;
                }
            }

            if detect_swing_high(candles, i) {
                found.push(SwingPoint {
                    swing_type: SwingType::High,
                    price: candle.high,
                    timestamp: candle.timestamp,
                });
            }
            if detect_swing_low(candles, i) {
                found.push(SwingPoint {
                    swing_type: SwingType::Low,
                    price: candle.low,
                    timestamp: candle.timestamp,
                });
            }

            self.evaluated_through = Some(candle.timestamp);
        }

        found
    }
}
