//! The three scheduled operations over shared strategy state.
//!
//! `bias_scan` runs on closed coarse candles, `execution_scan` on closed fine
//! candles, `position_tick` on the latest price. Each call is idempotent: it
//! only looks at candles newer than what it has already seen, so a skipped or
//! repeated call changes nothing. Every operation takes the state lock once
//! and makes all of its writes inside that scope.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Mutex, MutexGuard};

use crate::config::Settings;
use crate::error::{BotError, BotResult};
use crate::events::{DomainEvent, Outbox, OutboxReceiver};
use crate::execution::{CandleStore, CloseResult, Executor, PositionManager, TickOutcome, TradeProposal};
use crate::models::{
    Candle, ConfluenceStage, ConfluenceState, Direction, ExitReason, LiquiditySweep, SwingLevel, SwingType,
    Timeframe, Trade, TradeId,
};
use crate::strategy::{ConfluenceMachine, StructureBook, SweepDetector, SwingTracker};

/// Rows persisted between runs
#[derive(Debug, Clone, Default)]
pub struct EngineSnapshot {
    pub swings: Vec<SwingLevel>,
    pub sweeps: Vec<LiquiditySweep>,
    pub confluences: Vec<ConfluenceState>,
    pub trades: Vec<Trade>,
}

impl EngineSnapshot {
    pub fn is_empty(&self) -> bool {
        self.swings.is_empty() && self.sweeps.is_empty() && self.confluences.is_empty() && self.trades.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BiasScan {
    pub candles_checked: usize,
    pub swings: Vec<SwingLevel>,
    pub sweeps: Vec<LiquiditySweep>,
    pub confluence: Option<ConfluenceState>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionScan {
    pub swings: Vec<SwingLevel>,
    /// The row this scan opened or advanced
    pub confluence: Option<ConfluenceState>,
    pub confluence_updated: bool,
    pub proposals: Vec<TradeProposal>,
}

impl ExecutionScan {
    /// Whether any stored row was written
    pub fn changed(&self) -> bool {
        !self.swings.is_empty() || self.confluence_updated || !self.proposals.is_empty()
    }
}

struct EngineState {
    book: StructureBook,
    positions: PositionManager,
    coarse_swings: SwingTracker,
    fine_swings: SwingTracker,
    /// Newest coarse candle already checked for a sweep
    coarse_checked: Option<DateTime<Utc>>,
}

pub struct Engine {
    state: Mutex<EngineState>,
    store: CandleStore,
    outbox: Outbox,
    detector: SweepDetector,
    machine: ConfluenceMachine,
    executor: Executor,
    sweep_validity: Duration,
}

impl Engine {
    pub fn new(settings: &Settings, store: CandleStore, outbox: Outbox, now: DateTime<Utc>) -> Self {
        let state = EngineState {
            book: StructureBook::new(),
            positions: PositionManager::new(&settings.risk, settings.costs, now),
            coarse_swings: SwingTracker::new(),
            fine_swings: SwingTracker::new(),
            coarse_checked: None,
        };
        Self::with_state(settings, store, outbox, state)
    }

    /// Rebuild from persisted rows
    ///
    /// Swing tracking resumes after the newest stored swing per timeframe.
    /// Coarse candles that closed before `now` are not checked for sweeps again.
    pub fn restore(
        settings: &Settings,
        store: CandleStore,
        outbox: Outbox,
        snapshot: EngineSnapshot,
        now: DateTime<Utc>,
    ) -> BotResult<Self> {
        let book = StructureBook::restore(snapshot.swings, snapshot.sweeps, snapshot.confluences)?;
        let positions = PositionManager::with_trades(&settings.risk, settings.costs, snapshot.trades, now)?;

        let tracker = |timeframe| match book.latest_swing_time(timeframe) {
            Some(at) => SwingTracker::resume_after(at),
            None => SwingTracker::new(),
        };

        let state = EngineState {
            coarse_swings: tracker(Timeframe::Coarse),
            fine_swings: tracker(Timeframe::Fine),
            coarse_checked: Some(now - Timeframe::Coarse.duration()),
            book,
            positions,
        };
        Ok(Self::with_state(settings, store, outbox, state))
    }

    fn with_state(settings: &Settings, store: CandleStore, outbox: Outbox, state: EngineState) -> Self {
        Self {
            state: Mutex::new(state),
            store,
            outbox,
            detector: SweepDetector::new(settings.strategy.sweep_threshold),
            machine: ConfluenceMachine::new(&settings.strategy),
            executor: Executor::new(&settings.risk),
            sweep_validity: Duration::hours(settings.strategy.sweep_validity_hours),
        }
    }

    fn lock(&self) -> BotResult<MutexGuard<'_, EngineState>> {
        Ok(self.state.lock()?)
    }

    pub fn store(&self) -> &CandleStore {
        &self.store
    }

    pub fn subscribe(&self) -> OutboxReceiver {
        self.outbox.subscribe()
    }

    /// Bias layer: coarse swings, sweeps and sweep confirmation
    ///
    /// Each coarse candle newer than the last one checked is handled in order:
    /// first the swings it confirms are recorded, then it is checked for a
    /// confirmation of the active sweep and for a new sweep.
    pub fn bias_scan(&self, now: DateTime<Utc>) -> BotResult<BiasScan> {
        let coarse = self.store.candles(Timeframe::Coarse)?;
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let mut scan = BiasScan::default();

        let start = match state.coarse_checked {
            Some(checked) => coarse.partition_point(|c| c.timestamp <= checked),
            None => 0,
        };

        for k in start..coarse.len() {
            for point in state.coarse_swings.scan(&coarse[..=k]) {
                let level = state.book.record_swing(Timeframe::Coarse, &point);
                tracing::debug!(
                    swing = level.id,
                    kind = %level.swing_type,
                    price = level.price,
                    "Coarse swing confirmed"
                );
                scan.swings.push(level);
            }

            let candle = &coarse[k];
            self.confirm_active_sweep(&mut state.book, candle)?;

            if let Some(sweep) = self.check_sweep(&mut state.book, candle, now)? {
                scan.sweeps.push(sweep);
            }

            state.coarse_checked = Some(candle.timestamp);
            scan.candles_checked += 1;
        }

        scan.confluence = state.book.open_confluence()?.cloned();
        Ok(scan)
    }

    fn confirm_active_sweep(&self, book: &mut StructureBook, candle: &Candle) -> BotResult<()> {
        let Some(active) = book.active_sweep()?.cloned() else {
            return Ok(());
        };
        let is_next = candle.timestamp == active.timestamp + Timeframe::Coarse.duration();
        if active.confirmed_at.is_none() && is_next && SweepDetector::confirms(&active, candle) {
            book.confirm_sweep(active.id, candle.timestamp);
            tracing::info!(sweep = active.id, bias = %active.bias, "Sweep confirmed");
        }
        Ok(())
    }

    fn check_sweep(
        &self,
        book: &mut StructureBook,
        candle: &Candle,
        now: DateTime<Utc>,
    ) -> BotResult<Option<LiquiditySweep>> {
        let signal = self.detector.check(
            candle,
            book.active_swing(Timeframe::Coarse, SwingType::High),
            book.active_swing(Timeframe::Coarse, SwingType::Low),
            |id| book.is_swept(id),
        );
        let Some(signal) = signal else {
            return Ok(None);
        };

        let (sweep, superseded) = book.record_sweep(&signal)?;
        if let Some(old) = superseded {
            self.publish_expired(&old, now);
        }
        tracing::info!(
            sweep = sweep.id,
            kind = %sweep.sweep_type,
            bias = %sweep.bias,
            price = sweep.price,
            swing = sweep.swing_price,
            "Liquidity sweep detected"
        );
        self.outbox.publish(
            DomainEvent::SweepDetected {
                sweep_id: sweep.id,
                sweep_type: sweep.sweep_type,
                bias: sweep.bias,
                price: sweep.price,
                swing_price: sweep.swing_price,
            },
            now,
        );

        if now - sweep.timestamp > self.sweep_validity {
            tracing::debug!(sweep = sweep.id, "Sweep already past its validity window");
            return Ok(Some(sweep));
        }

        // Fine candles from the sweep candle's close onward belong to this confluence
        let opened_at = candle.timestamp + Timeframe::Coarse.duration();
        match book.open_confluence_for(sweep.id, opened_at, self.sweep_validity) {
            Ok(state) => {
                tracing::info!(confluence = state.id, sweep = sweep.id, "Waiting for CHoCH");
            }
            Err(BotError::Validation(reason)) => {
                tracing::info!(sweep = sweep.id, "No confluence opened: {}", reason);
            }
            Err(e) => return Err(e),
        }
        Ok(Some(sweep))
    }

    /// Execution layer: fine swings, confluence progress and trade proposals
    pub fn execution_scan(&self, now: DateTime<Utc>) -> BotResult<ExecutionScan> {
        let fine = self.store.candles(Timeframe::Fine)?;
        let mut guard = self.lock()?;
        let EngineState {
            book,
            positions,
            fine_swings,
            ..
        } = &mut *guard;
        let mut scan = ExecutionScan::default();

        for point in fine_swings.scan(&fine) {
            scan.swings.push(book.record_swing(Timeframe::Fine, &point));
        }

        scan.confluence_updated = self.resume_confluence(book, now)?;

        if let Some(open) = book.open_confluence()?.cloned() {
            let updates = self.machine.advance(&open, &fine, now)?;
            let mut stage = open.current_state;
            for update in &updates {
                let after = book.apply_confluence(open.id, update)?.current_state;
                if after != stage {
                    self.publish_stage(&open, stage, after, now);
                    stage = after;
                }
            }
            scan.confluence_updated |= !updates.is_empty();
            scan.confluence = book.confluence(open.id).cloned();
        }

        let ready: Vec<u64> = book.unconsumed_complete().iter().map(|c| c.id).collect();
        if let Some(entry) = fine.last() {
            for confluence_id in ready {
                let proposal = self.executor.propose_trade(book, positions, confluence_id, entry.close, now)?;
                self.publish_proposal(confluence_id, &proposal, now);
                scan.proposals.push(proposal);
            }
        }

        Ok(scan)
    }

    /// Start tracking the active sweep if the bias scan could not
    ///
    /// Returns whether a row was opened.
    fn resume_confluence(&self, book: &mut StructureBook, now: DateTime<Utc>) -> BotResult<bool> {
        if book.open_confluence()?.is_some() {
            return Ok(false);
        }
        let Some(sweep) = book.active_sweep()?.cloned() else {
            return Ok(false);
        };
        if book.confluence_for_sweep(sweep.id).is_some() || now - sweep.timestamp > self.sweep_validity {
            return Ok(false);
        }

        match book.open_confluence_for(sweep.id, now, self.sweep_validity) {
            Ok(state) => {
                tracing::info!(confluence = state.id, sweep = sweep.id, "Waiting for CHoCH");
                Ok(true)
            }
            Err(BotError::Validation(reason)) => {
                tracing::debug!(sweep = sweep.id, "Confluence not opened: {}", reason);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn publish_stage(&self, state: &ConfluenceState, from: ConfluenceStage, to: ConfluenceStage, now: DateTime<Utc>) {
        if to == ConfluenceStage::Expired {
            return self.publish_expired(state, now);
        }
        tracing::info!(confluence = state.id, from = %from, to = %to, "Confluence advanced");
        self.outbox.publish(
            DomainEvent::ConfluenceAdvanced {
                confluence_id: state.id,
                sweep_id: state.sweep_ref,
                from,
                to,
            },
            now,
        );
    }

    fn publish_expired(&self, state: &ConfluenceState, now: DateTime<Utc>) {
        tracing::info!(confluence = state.id, sweep = state.sweep_ref, "Confluence expired");
        self.outbox.publish(
            DomainEvent::ConfluenceExpired {
                confluence_id: state.id,
                sweep_id: state.sweep_ref,
            },
            now,
        );
    }

    fn publish_proposal(&self, confluence_id: u64, proposal: &TradeProposal, now: DateTime<Utc>) {
        let event = match &proposal.trade {
            Some(trade) => DomainEvent::TradeOpened {
                trade_id: trade.id,
                confluence_id,
                direction: trade.direction,
                entry_price: trade.entry_price,
                stop_loss: trade.stop_loss,
                take_profit: trade.take_profit,
                position_size: trade.position_size,
            },
            None => DomainEvent::trade_rejected(confluence_id, &proposal.rejection_reasons),
        };
        self.outbox.publish(event, now);
    }

    /// Propose a trade for one COMPLETE confluence at `entry_price`
    pub fn propose_trade(&self, confluence_id: u64, entry_price: f64, now: DateTime<Utc>) -> BotResult<TradeProposal> {
        let mut guard = self.lock()?;
        let EngineState { book, positions, .. } = &mut *guard;
        let proposal = self
            .executor
            .propose_trade(book, positions, confluence_id, entry_price, now)?;
        self.publish_proposal(confluence_id, &proposal, now);
        Ok(proposal)
    }

    /// Tick the open trade at the latest fine close
    pub fn position_tick(&self, now: DateTime<Utc>) -> BotResult<Option<TickOutcome>> {
        match self.store.latest(Timeframe::Fine)? {
            Some(candle) => self.tick_price(candle.close, now),
            None => Ok(None),
        }
    }

    /// Tick the open trade at `price`; `None` when no trade is open
    pub fn tick_price(&self, price: f64, now: DateTime<Utc>) -> BotResult<Option<TickOutcome>> {
        let mut guard = self.lock()?;
        let EngineState { book, positions, .. } = &mut *guard;

        positions.verify_single_open()?;
        let Some(trade) = positions.open_trade().cloned() else {
            return Ok(None);
        };

        let structure_break = match book.active_sweep()? {
            Some(sweep) => {
                sweep.confirmed_at.is_some()
                    && Direction::for_bias(sweep.bias) != trade.direction
                    && sweep.timestamp > trade.entry_time
            }
            None => false,
        };

        let outcome = positions.tick(trade.id, price, now, structure_break)?;
        match &outcome {
            TickOutcome::Hold => {}
            TickOutcome::Protected { trade_id, stop_loss } => {
                self.outbox.publish(
                    DomainEvent::StopAdjusted {
                        trade_id: *trade_id,
                        stop_loss: *stop_loss,
                    },
                    now,
                );
            }
            TickOutcome::Closed(result) => self.publish_close(result, now),
        }
        Ok(Some(outcome))
    }

    /// Close a trade at the latest fine close
    pub fn close_trade(&self, id: TradeId, reason: ExitReason, now: DateTime<Utc>) -> BotResult<CloseResult> {
        let price = self
            .store
            .latest(Timeframe::Fine)?
            .map(|c| c.close)
            .ok_or_else(|| BotError::transient("no fine candle to price the exit"))?;
        self.close_trade_at(id, reason, price, now)
    }

    pub fn close_trade_at(
        &self,
        id: TradeId,
        reason: ExitReason,
        price: f64,
        now: DateTime<Utc>,
    ) -> BotResult<CloseResult> {
        let mut guard = self.lock()?;
        let result = guard.positions.close_trade(id, reason, price, now)?;
        self.publish_close(&result, now);
        Ok(result)
    }

    fn publish_close(&self, result: &CloseResult, now: DateTime<Utc>) {
        self.outbox.publish(
            DomainEvent::TradeClosed {
                trade_id: result.trade_id,
                exit_reason: result.exit_reason,
                outcome: result.outcome,
                exit_price: result.exit_price,
                pnl: result.pnl,
            },
            now,
        );
    }

    pub fn has_open_trade(&self) -> BotResult<bool> {
        Ok(self.lock()?.positions.open_trade().is_some())
    }

    pub fn open_trade(&self) -> BotResult<Option<Trade>> {
        Ok(self.lock()?.positions.open_trade().cloned())
    }

    /// Whether a sweep is active, i.e. the execution scan has work to do
    pub fn has_bias(&self) -> BotResult<bool> {
        Ok(self.lock()?.book.active_sweep()?.is_some())
    }

    pub fn trades(&self) -> BotResult<Vec<Trade>> {
        Ok(self.lock()?.positions.trades().to_vec())
    }

    pub fn confluences(&self) -> BotResult<Vec<ConfluenceState>> {
        Ok(self.lock()?.book.confluences().to_vec())
    }

    pub fn balance(&self) -> BotResult<f64> {
        Ok(self.lock()?.positions.balance())
    }

    /// Consistent copy of every persisted row
    pub fn snapshot(&self) -> BotResult<EngineSnapshot> {
        let guard = self.lock()?;
        Ok(EngineSnapshot {
            swings: guard.book.swings().to_vec(),
            sweeps: guard.book.sweeps().to_vec(),
            confluences: guard.book.confluences().to_vec(),
            trades: guard.positions.trades().to_vec(),
        })
    }
}
