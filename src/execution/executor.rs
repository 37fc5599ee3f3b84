use chrono::{DateTime, Utc};

use crate::config::RiskParams;
use crate::error::{BotError, BotResult, RejectionReason};
use crate::execution::position_manager::{NewTrade, PositionManager};
use crate::models::{ConfluenceStage, Direction, SwingType, Timeframe, Trade};
use crate::risk::{PositionSizer, StopLossCalculator};
use crate::strategy::{validate_sequence, ConfluenceUpdate, StructureBook};

/// Result of `propose_trade`
#[derive(Debug, Clone)]
pub struct TradeProposal {
    pub approved: bool,
    pub trade: Option<Trade>,
    pub rejection_reasons: Vec<RejectionReason>,
}

impl TradeProposal {
    fn approved(trade: Trade) -> Self {
        Self {
            approved: true,
            trade: Some(trade),
            rejection_reasons: Vec::new(),
        }
    }

    fn rejected(reasons: Vec<RejectionReason>) -> Self {
        Self {
            approved: false,
            trade: None,
            rejection_reasons: reasons,
        }
    }
}

/// Turns a completed confluence into a risk-checked trade
pub struct Executor {
    stop_calculator: StopLossCalculator,
    sizer: PositionSizer,
}

impl Executor {
    pub fn new(risk: &RiskParams) -> Self {
        Self {
            stop_calculator: StopLossCalculator::new(risk),
            sizer: PositionSizer::new(risk),
        }
    }

    /// Propose (and, when approved, open) a trade for a COMPLETE confluence
    ///
    /// The row is marked consumed before any risk check runs, so a signal is
    /// looked at once whether or not it trades. A row whose sweep has since
    /// been replaced is refused. Only fatal errors are returned
    /// as `Err`; every validation failure ends up in `rejection_reasons`.
    pub fn propose_trade(
        &self,
        book: &mut StructureBook,
        positions: &mut PositionManager,
        confluence_id: u64,
        entry_price: f64,
        now: DateTime<Utc>,
    ) -> BotResult<TradeProposal> {
        let Some(state) = book.confluence(confluence_id) else {
            return Ok(TradeProposal::rejected(vec![RejectionReason::NotActionable(
                confluence_id,
            )]));
        };
        if state.consumed {
            return Ok(TradeProposal::rejected(vec![RejectionReason::AlreadyConsumed(
                confluence_id,
            )]));
        }
        if state.current_state != ConfluenceStage::Complete {
            return Ok(TradeProposal::rejected(vec![RejectionReason::NotActionable(
                confluence_id,
            )]));
        }

        let state = book
            .apply_confluence(confluence_id, &ConfluenceUpdate::consumed())?
            .clone();

        let active_sweep = book.active_sweep()?.map(|s| s.id);
        if active_sweep != Some(state.sweep_ref) {
            let reason = RejectionReason::SweepSuperseded {
                confluence_id,
                sweep_id: state.sweep_ref,
            };
            return Ok(self.reject(confluence_id, vec![reason]));
        }

        if !state.sequence_valid {
            let reason = validate_sequence(state.choch_time, state.fvg_fill_time, state.bos_time)
                .err()
                .unwrap_or(RejectionReason::NotActionable(confluence_id));
            return Ok(self.reject(confluence_id, vec![reason]));
        }
        if !state.is_actionable() {
            return Ok(self.reject(confluence_id, vec![RejectionReason::NotActionable(confluence_id)]));
        }

        if let Some(open) = positions.open_trade() {
            let reason = RejectionReason::TradeAlreadyOpen(open.id.0);
            return Ok(self.reject(confluence_id, vec![reason]));
        }
        if let Err(trip) = positions.check_circuit_breakers(now) {
            let reason = RejectionReason::CircuitBreaker(trip.to_string());
            return Ok(self.reject(confluence_id, vec![reason]));
        }

        let direction = Direction::for_bias(state.bias);
        let stop_side = direction.stop_swing_type();
        let swing_price = |timeframe: Timeframe, swing_type: SwingType| {
            book.active_swing(timeframe, swing_type).map(|s| s.price)
        };

        let stop = match self.stop_calculator.calculate(
            entry_price,
            direction,
            state.bias,
            swing_price(Timeframe::Fine, stop_side),
            swing_price(Timeframe::Coarse, stop_side),
        ) {
            Ok(stop) => stop,
            Err(rejection) => return Ok(self.reject(confluence_id, rejection.reasons)),
        };

        let targets: Vec<f64> = book
            .swing_history(Timeframe::Coarse, direction.target_swing_type())
            .iter()
            .map(|s| s.price)
            .collect();

        let plan = match self.sizer.plan(
            positions.balance(),
            entry_price,
            stop.price,
            direction,
            &targets,
        ) {
            Ok(plan) => plan,
            Err(reason) => return Ok(self.reject(confluence_id, vec![reason])),
        };

        let opened = positions.open_trade_from(NewTrade {
            confluence_ref: confluence_id,
            direction,
            entry_price,
            entry_time: now,
            stop,
            plan,
        });

        match opened {
            Ok(id) => match positions.trade(id) {
                Some(trade) => Ok(TradeProposal::approved(trade.clone())),
                None => Err(RejectionReason::TradeNotFound(id.0).into()),
            },
            Err(BotError::Validation(reason)) => Ok(self.reject(confluence_id, vec![reason])),
            Err(e) => Err(e),
        }
    }

    fn reject(&self, confluence_id: u64, reasons: Vec<RejectionReason>) -> TradeProposal {
        for reason in &reasons {
            tracing::info!(confluence = confluence_id, "Proposal rejected: {}", reason);
        }
        TradeProposal::rejected(reasons)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionCosts;
    use crate::models::{Bias, Candle, TradeStatus};
    use crate::strategy::{SweepSignal, SwingPoint};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn swing(book: &mut StructureBook, timeframe: Timeframe, swing_type: SwingType, price: f64) {
        book.record_swing(
            timeframe,
            &SwingPoint {
                swing_type,
                price,
                timestamp: t0(),
            },
        );
    }

    /// Book with a bullish COMPLETE confluence; returns its id
    fn complete_bullish(book: &mut StructureBook, bos_price: f64) -> u64 {
        let (sweep, _) = book.record_sweep(&SweepSignal {
            sweep_type: SwingType::Low,
            price: 86_000.0,
            bias: Bias::Bullish,
            swing_level_ref: 99,
            swing_price: 86_500.0,
            candle: Candle {
                timestamp: t0(),
                open: 87_000.0,
                high: 87_500.0,
                low: 86_000.0,
                close: 87_200.0,
                volume: 1.0,
            },
        })
        .unwrap();
        let state = book
            .open_confluence_for(sweep.id, t0() + Duration::hours(4), Duration::hours(24))
            .unwrap();
        let at = |m: i64| t0() + Duration::hours(4) + Duration::minutes(m);
        let update = ConfluenceUpdate::new()
            .choch(at(5), 89_000.0)
            .fvg_zone(89_100.0, 89_300.0, at(15))
            .fvg_fill(at(20), 89_200.0)
            .bos(at(30), bos_price)
            .stage(ConfluenceStage::Complete);
        book.apply_confluence(state.id, &update).unwrap();
        state.id
    }

    fn setup() -> (StructureBook, PositionManager, Executor) {
        let mut book = StructureBook::new();
        // Stop 87475 × 0.998 = 87300.05, about 3% under 90000
        swing(&mut book, Timeframe::Fine, SwingType::Low, 87_475.0);
        swing(&mut book, Timeframe::Coarse, SwingType::High, 96_000.0);
        let risk = RiskParams::default();
        let positions = PositionManager::new(&risk, ExecutionCosts::none(), t0());
        (book, positions, Executor::new(&risk))
    }

    #[test]
    fn test_approved_proposal_opens_trade() {
        let (mut book, mut positions, executor) = setup();
        let id = complete_bullish(&mut book, 90_000.0);

        let proposal = executor
            .propose_trade(&mut book, &mut positions, id, 90_000.0, t0() + Duration::hours(5))
            .unwrap();

        assert!(proposal.approved, "{:?}", proposal.rejection_reasons);
        let trade = proposal.trade.unwrap();
        assert_eq!(trade.direction, Direction::Long);
        assert_eq!(trade.take_profit, 96_000.0);
        assert!(trade.risk_reward_ratio >= 2.0);
        assert_eq!(trade.status, TradeStatus::Open);
        assert!(book.confluence(id).unwrap().consumed);
    }

    #[test]
    fn test_complete_state_is_consumed_once() {
        let (mut book, mut positions, executor) = setup();
        let id = complete_bullish(&mut book, 90_000.0);
        let now = t0() + Duration::hours(5);

        executor.propose_trade(&mut book, &mut positions, id, 90_000.0, now).unwrap();
        let again = executor.propose_trade(&mut book, &mut positions, id, 90_000.0, now).unwrap();

        assert!(!again.approved);
        assert_eq!(again.rejection_reasons, vec![RejectionReason::AlreadyConsumed(id)]);
        assert_eq!(positions.trades().len(), 1);
    }

    #[test]
    fn test_price_action_inconsistency_rejected() {
        let (mut book, mut positions, executor) = setup();
        // BOS below the CHoCH close on a bullish row
        let id = complete_bullish(&mut book, 88_000.0);

        let proposal = executor
            .propose_trade(&mut book, &mut positions, id, 90_000.0, t0() + Duration::hours(5))
            .unwrap();

        assert!(!proposal.approved);
        assert_eq!(proposal.rejection_reasons, vec![RejectionReason::NotActionable(id)]);
        assert!(positions.trades().is_empty());
    }

    #[test]
    fn test_stop_rejections_listed_per_timeframe() {
        let (mut book, mut positions, executor) = setup();
        swing(&mut book, Timeframe::Fine, SwingType::Low, 89_970.0);
        swing(&mut book, Timeframe::Coarse, SwingType::Low, 85_000.0);
        let id = complete_bullish(&mut book, 90_000.0);

        let proposal = executor
            .propose_trade(&mut book, &mut positions, id, 90_000.0, t0() + Duration::hours(5))
            .unwrap();

        assert!(!proposal.approved);
        assert_eq!(proposal.rejection_reasons.len(), 2);
    }

    #[test]
    fn test_waiting_state_not_actionable_and_not_consumed() {
        let (mut book, mut positions, executor) = setup();
        let (sweep, _) = book.record_sweep(&SweepSignal {
            sweep_type: SwingType::High,
            price: 91_000.0,
            bias: Bias::Bearish,
            swing_level_ref: 5,
            swing_price: 90_500.0,
            candle: Candle {
                timestamp: t0(),
                open: 90_400.0,
                high: 91_000.0,
                low: 90_000.0,
                close: 90_400.0,
                volume: 1.0,
            },
        })
        .unwrap();
        let state = book.open_confluence_for(sweep.id, t0(), Duration::hours(24)).unwrap();

        let proposal = executor
            .propose_trade(&mut book, &mut positions, state.id, 90_000.0, t0())
            .unwrap();

        assert!(!proposal.approved);
        assert!(!book.confluence(state.id).unwrap().consumed);
    }

    #[test]
    fn test_circuit_breaker_blocks_proposal() {
        let mut book = StructureBook::new();
        swing(&mut book, Timeframe::Fine, SwingType::Low, 87_475.0);
        swing(&mut book, Timeframe::Coarse, SwingType::High, 96_000.0);
        let risk = RiskParams {
            starting_balance: 50.0,
            ..RiskParams::default()
        };
        let mut positions = PositionManager::new(&risk, ExecutionCosts::none(), t0());
        let executor = Executor::new(&risk);
        let id = complete_bullish(&mut book, 90_000.0);

        let proposal = executor
            .propose_trade(&mut book, &mut positions, id, 90_000.0, t0() + Duration::hours(5))
            .unwrap();

        assert!(!proposal.approved);
        assert!(matches!(
            proposal.rejection_reasons[0],
            RejectionReason::CircuitBreaker(_)
        ));
    }

    #[test]
    fn test_confluence_of_replaced_sweep_is_refused() {
        let (mut book, mut positions, executor) = setup();
        let id = complete_bullish(&mut book, 90_000.0);
        book.record_sweep(&SweepSignal {
            sweep_type: SwingType::High,
            price: 91_000.0,
            bias: Bias::Bearish,
            swing_level_ref: 7,
            swing_price: 90_500.0,
            candle: Candle {
                timestamp: t0() + Duration::hours(4),
                open: 90_400.0,
                high: 91_000.0,
                low: 90_000.0,
                close: 90_400.0,
                volume: 1.0,
            },
        })
        .unwrap();

        let proposal = executor
            .propose_trade(&mut book, &mut positions, id, 90_000.0, t0() + Duration::hours(5))
            .unwrap();

        assert!(!proposal.approved);
        assert!(matches!(
            proposal.rejection_reasons[0],
            RejectionReason::SweepSuperseded { confluence_id, .. } if confluence_id == id
        ));
        assert!(positions.trades().is_empty());
        assert!(book.confluence(id).unwrap().consumed);
    }
}
