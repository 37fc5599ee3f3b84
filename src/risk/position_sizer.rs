use crate::config::RiskParams;
use crate::error::RejectionReason;
use crate::models::Direction;

/// Size and target for an approved stop
#[derive(Debug, Clone, PartialEq)]
pub struct PositionPlan {
    pub position_size: f64,
    pub risk_amount: f64,
    pub take_profit: f64,
    pub risk_reward_ratio: f64,
}

impl PositionPlan {
    pub fn notional(&self, entry: f64) -> f64 {
        self.position_size * entry
    }
}

#[derive(Debug, Clone)]
pub struct PositionSizer {
    risk_per_trade: f64,
    max_position_fraction: f64,
    min_risk_reward: f64,
}

impl Default for PositionSizer {
    fn default() -> Self {
        Self::new(&RiskParams::default())
    }
}

impl PositionSizer {
    pub fn new(params: &RiskParams) -> Self {
        Self {
            risk_per_trade: params.risk_per_trade,
            max_position_fraction: params.max_position_fraction,
            min_risk_reward: params.min_risk_reward,
        }
    }

    /// Fixed-fractional size plus a structural target
    ///
    /// `targets` are opposing coarse swing prices, active and historical.
    pub fn plan(
        &self,
        balance: f64,
        entry: f64,
        stop: f64,
        direction: Direction,
        targets: &[f64],
    ) -> Result<PositionPlan, RejectionReason> {
        if balance <= 0.0 {
            return Err(RejectionReason::NonPositiveBalance(balance));
        }

        let stop_distance = (entry - stop).abs();
        if stop_distance == 0.0 {
            return Err(RejectionReason::ZeroStopDistance);
        }

        let risk_amount = balance * self.risk_per_trade;
        let position_size = risk_amount / stop_distance;

        let notional = position_size * entry;
        let cap = balance * self.max_position_fraction;
        if notional > cap {
            return Err(RejectionReason::PositionTooLarge { notional, cap });
        }

        let take_profit = self.select_target(entry, stop_distance, direction, targets)?;
        let risk_reward_ratio = (take_profit - entry).abs() / stop_distance;
        if risk_reward_ratio < self.min_risk_reward {
            return Err(RejectionReason::RiskRewardTooLow {
                ratio: risk_reward_ratio,
                min_rr: self.min_risk_reward,
            });
        }

        Ok(PositionPlan {
            position_size,
            risk_amount,
            take_profit,
            risk_reward_ratio,
        })
    }

    /// Nearest structural level at or beyond `entry ± min_rr × stop_distance`
    pub fn select_target(
        &self,
        entry: f64,
        stop_distance: f64,
        direction: Direction,
        targets: &[f64],
    ) -> Result<f64, RejectionReason> {
        let floor = entry + direction.sign() * self.min_risk_reward * stop_distance;

        let reaching = targets.iter().copied().filter(|&level| match direction {
            Direction::Long => level >= floor,
            Direction::Short => level <= floor,
        });

        let nearest = match direction {
            Direction::Long => reaching.fold(None, |best: Option<f64>, level| {
                Some(best.map_or(level, |b| b.min(level)))
            }),
            Direction::Short => reaching.fold(None, |best: Option<f64>, level| {
                Some(best.map_or(level, |b| b.max(level)))
            }),
        };

        nearest.ok_or(RejectionReason::NoStructuralTarget {
            floor,
            min_rr: self.min_risk_reward,
        })
    }
}
