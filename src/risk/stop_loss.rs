use std::fmt;

use crate::config::RiskParams;
use crate::error::RejectionReason;
use crate::models::{Bias, Direction, StopSource, Timeframe};

/// Structure-anchored stop for a proposal
#[derive(Debug, Clone, PartialEq)]
pub struct StopLoss {
    pub price: f64,
    pub source: StopSource,
    /// |entry − stop| / entry, in percent
    pub distance_pct: f64,
    pub swing_price: f64,
}

/// Every timeframe that was tried, and why it failed
#[derive(Debug, Clone, PartialEq)]
pub struct StopLossRejection {
    pub reasons: Vec<RejectionReason>,
}

impl fmt::Display for StopLossRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no valid stop")?;
        for (i, reason) in self.reasons.iter().enumerate() {
            write!(f, "{}{}", if i == 0 { ": " } else { "; " }, reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for StopLossRejection {}

#[derive(Debug, Clone)]
pub struct StopLossCalculator {
    long_buffer: f64,
    short_buffer: f64,
    min_distance_pct: f64,
    max_distance_pct: f64,
}

impl Default for StopLossCalculator {
    fn default() -> Self {
        Self::new(&RiskParams::default())
    }
}

impl StopLossCalculator {
    pub fn new(params: &RiskParams) -> Self {
        Self {
            long_buffer: params.long_stop_buffer,
            short_buffer: params.short_stop_buffer,
            min_distance_pct: params.min_stop_distance_pct,
            max_distance_pct: params.max_stop_distance_pct,
        }
    }

    /// Try the fine swing first, then fall back to the coarse swing
    ///
    /// `fine_swing` and `coarse_swing` are the active swing prices of the
    /// stop side (LOW for LONG, HIGH for SHORT).
    pub fn calculate(
        &self,
        entry: f64,
        direction: Direction,
        bias: Bias,
        fine_swing: Option<f64>,
        coarse_swing: Option<f64>,
    ) -> Result<StopLoss, StopLossRejection> {
        if Direction::for_bias(bias) != direction {
            return Err(StopLossRejection {
                reasons: vec![RejectionReason::DirectionBiasMismatch { direction, bias }],
            });
        }

        let mut reasons = Vec::with_capacity(2);
        for (timeframe, swing) in [(Timeframe::Fine, fine_swing), (Timeframe::Coarse, coarse_swing)] {
            match self.from_swing(entry, direction, timeframe, swing) {
                Ok(stop) => {
                    tracing::debug!(
                        source = %stop.source,
                        stop = stop.price,
                        distance_pct = stop.distance_pct,
                        "Stop anchored to swing"
                    );
                    return Ok(stop);
                }
                Err(reason) => reasons.push(reason),
            }
        }

        Err(StopLossRejection { reasons })
    }

    fn from_swing(
        &self,
        entry: f64,
        direction: Direction,
        timeframe: Timeframe,
        swing: Option<f64>,
    ) -> Result<StopLoss, RejectionReason> {
        let swing_price = swing.ok_or(RejectionReason::NoSwing { timeframe })?;

        let price = match direction {
            Direction::Long => swing_price * (1.0 - self.long_buffer),
            Direction::Short => swing_price * (1.0 + self.short_buffer),
        };

        let wrong_side = match direction {
            Direction::Long => price >= entry,
            Direction::Short => price <= entry,
        };
        if wrong_side {
            return Err(RejectionReason::StopWrongSide {
                timeframe,
                stop: price,
                entry,
            });
        }

        let distance_pct = (entry - price).abs() / entry * 100.0;
        if distance_pct < self.min_distance_pct {
            return Err(RejectionReason::StopTooTight {
                timeframe,
                distance_pct,
                min_pct: self.min_distance_pct,
            });
        }
        if distance_pct > self.max_distance_pct {
            return Err(RejectionReason::StopTooWide {
                timeframe,
                distance_pct,
                max_pct: self.max_distance_pct,
            });
        }

        Ok(StopLoss {
            price,
            source: StopSource::for_timeframe(timeframe),
            distance_pct,
            swing_price,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fine_swing_accepted_without_fallback() {
        let calc = StopLossCalculator::default();
        let stop = calc
            .calculate(90_000.0, Direction::Long, Bias::Bullish, Some(89_000.0), None)
            .unwrap();

        assert!((stop.price - 88_822.0).abs() < 1e-6);
        assert!((stop.distance_pct - 1.3089).abs() < 1e-3);
        assert_eq!(stop.source, StopSource::FineSwing);
        assert_eq!(stop.swing_price, 89_000.0);
    }

    #[test]
    fn test_both_timeframes_rejected() {
        let calc = StopLossCalculator::default();
        let err = calc
            .calculate(90_000.0, Direction::Long, Bias::Bullish, Some(89_970.0), Some(85_000.0))
            .unwrap_err();

        assert_eq!(err.reasons.len(), 2);
        assert!(matches!(
            err.reasons[0],
            RejectionReason::StopTooTight { timeframe: Timeframe::Fine, .. }
        ));
        assert!(matches!(
            err.reasons[1],
            RejectionReason::StopTooWide { timeframe: Timeframe::Coarse, .. }
        ));
    }

    #[test]
    fn test_falls_back_to_coarse() {
        let calc = StopLossCalculator::default();
        let stop = calc
            .calculate(90_000.0, Direction::Long, Bias::Bullish, None, Some(88_500.0))
            .unwrap();

        assert_eq!(stop.source, StopSource::CoarseSwing);
        assert!(stop.distance_pct >= 0.5 && stop.distance_pct <= 3.0);
    }

    #[test]
    fn test_short_stop_above_entry() {
        let calc = StopLossCalculator::default();
        let stop = calc
            .calculate(90_000.0, Direction::Short, Bias::Bearish, Some(91_000.0), None)
            .unwrap();

        // 91000 × 1.003
        assert!((stop.price - 91_273.0).abs() < 1e-6);
        assert!(stop.price > 90_000.0);
    }

    #[test]
    fn test_wrong_side_swing() {
        let calc = StopLossCalculator::default();
        let err = calc
            .calculate(90_000.0, Direction::Short, Bias::Bearish, Some(89_000.0), None)
            .unwrap_err();

        assert!(matches!(err.reasons[0], RejectionReason::StopWrongSide { .. }));
        assert!(matches!(
            err.reasons[1],
            RejectionReason::NoSwing { timeframe: Timeframe::Coarse }
        ));
    }

    #[test]
    fn test_direction_must_match_bias() {
        let calc = StopLossCalculator::default();
        let err = calc
            .calculate(90_000.0, Direction::Long, Bias::Bearish, Some(89_000.0), None)
            .unwrap_err();

        assert_eq!(
            err.reasons,
            vec![RejectionReason::DirectionBiasMismatch {
                direction: Direction::Long,
                bias: Bias::Bearish
            }]
        );
        assert!(err.to_string().contains("does not match"));
    }
}
