use crate::models::{Bias, Candle, LiquiditySweep, SwingLevel, SwingType};

/// `price > swing_high × (1 + threshold)`
pub fn detect_high_sweep(price: f64, swing_high: f64, threshold: f64) -> bool {
    price > swing_high * (1.0 + threshold)
}

/// `price < swing_low × (1 − threshold)`
pub fn detect_low_sweep(price: f64, swing_low: f64, threshold: f64) -> bool {
    price < swing_low * (1.0 - threshold)
}

/// A sweep found on a closed coarse candle, not yet stored
#[derive(Debug, Clone, PartialEq)]
pub struct SweepSignal {
    pub sweep_type: SwingType,
    pub price: f64,
    pub bias: Bias,
    pub swing_level_ref: u64,
    pub swing_price: f64,
    pub candle: Candle,
}

/// Bias layer: coarse price piercing a tracked swing
#[derive(Debug, Clone)]
pub struct SweepDetector {
    threshold: f64,
}

impl SweepDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Check a closed coarse candle against the active coarse swings
    ///
    /// The high side is checked first. Swings formed at or after the candle and
    /// swings that were already swept are skipped.
    pub fn check<F>(
        &self,
        candle: &Candle,
        swing_high: Option<&SwingLevel>,
        swing_low: Option<&SwingLevel>,
        already_swept: F,
    ) -> Option<SweepSignal>
    where
        F: Fn(u64) -> bool,
    {
        let eligible = |swing: &&SwingLevel| {
            swing.active && swing.timestamp < candle.timestamp && !already_swept(swing.id)
        };

        if let Some(high) = swing_high.filter(eligible) {
            if detect_high_sweep(candle.high, high.price, self.threshold) {
                return Some(self.signal(SwingType::High, candle.high, high, candle));
            }
        }

        if let Some(low) = swing_low.filter(eligible) {
            if detect_low_sweep(candle.low, low.price, self.threshold) {
                return Some(self.signal(SwingType::Low, candle.low, low, candle));
            }
        }

        None
    }

    fn signal(&self, sweep_type: SwingType, price: f64, swing: &SwingLevel, candle: &Candle) -> SweepSignal {
        SweepSignal {
            sweep_type,
            price,
            bias: Bias::from_sweep(sweep_type),
            swing_level_ref: swing.id,
            swing_price: swing.price,
            candle: candle.clone(),
        }
    }

    /// The coarse candle right after the sweep closes further in the bias direction
    pub fn confirms(sweep: &LiquiditySweep, next: &Candle) -> bool {
        if next.timestamp <= sweep.timestamp {
            return false;
        }
        match sweep.bias {
            Bias::Bearish => next.close < sweep.sweep_close,
            Bias::Bullish => next.close > sweep.sweep_close,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Timeframe;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn swing(id: u64, swing_type: SwingType, price: f64) -> SwingLevel {
        SwingLevel {
            id,
            timeframe: Timeframe::Coarse,
            swing_type,
            price,
            active: true,
            timestamp: t0(),
        }
    }

    fn coarse(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp: t0() + Duration::hours(20),
            open: close,
            high,
            low,
            close,
            volume: 5.0,
        }
    }

    #[test]
    fn test_high_sweep_threshold() {
        // 90500 × 1.001 = 90590.5
        assert!(detect_high_sweep(91_000.0, 90_500.0, 0.001));
        assert!(!detect_high_sweep(90_590.0, 90_500.0, 0.001));
        assert!(detect_low_sweep(89_000.0, 89_500.0, 0.001));
        assert!(!detect_low_sweep(89_450.0, 89_500.0, 0.001));
    }

    #[test]
    fn test_high_sweep_reads_bearish() {
        let detector = SweepDetector::new(0.001);
        let high = swing(1, SwingType::High, 90_500.0);

        let signal = detector
            .check(&coarse(91_000.0, 90_000.0, 90_400.0), Some(&high), None, |_| false)
            .unwrap();

        assert_eq!(signal.sweep_type, SwingType::High);
        assert_eq!(signal.bias, Bias::Bearish);
        assert_eq!(signal.price, 91_000.0);
        assert_eq!(signal.swing_level_ref, 1);
    }

    #[test]
    fn test_high_checked_before_low() {
        let detector = SweepDetector::new(0.001);
        let high = swing(1, SwingType::High, 90_500.0);
        let low = swing(2, SwingType::Low, 89_500.0);

        // Outside bar pierces both
        let signal = detector
            .check(&coarse(91_000.0, 89_000.0, 90_000.0), Some(&high), Some(&low), |_| false)
            .unwrap();
        assert_eq!(signal.bias, Bias::Bearish);
    }

    #[test]
    fn test_swept_swing_is_not_swept_again() {
        let detector = SweepDetector::new(0.001);
        let high = swing(7, SwingType::High, 90_500.0);

        let signal = detector.check(&coarse(91_000.0, 90_000.0, 90_400.0), Some(&high), None, |id| id == 7);
        assert!(signal.is_none());
    }

    #[test]
    fn test_confirmation_follows_bias() {
        let sweep = LiquiditySweep {
            id: 1,
            sweep_type: SwingType::Low,
            price: 89_000.0,
            bias: Bias::Bullish,
            swing_level_ref: 2,
            swing_price: 89_500.0,
            active: true,
            timestamp: t0(),
            sweep_close: 89_700.0,
            confirmed_at: None,
        };

        let mut next = coarse(90_500.0, 89_600.0, 90_100.0);
        assert!(SweepDetector::confirms(&sweep, &next));

        next.close = 89_650.0;
        assert!(!SweepDetector::confirms(&sweep, &next));
    }
}
