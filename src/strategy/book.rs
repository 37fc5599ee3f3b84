use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;

use crate::error::{BotResult, FatalError, RejectionReason};
use crate::models::{ConfluenceStage, ConfluenceState, LiquiditySweep, SwingLevel, SwingType, Timeframe};
use crate::strategy::confluence::ConfluenceUpdate;
use crate::strategy::swings::SwingPoint;
use crate::strategy::sweep::SweepSignal;

/// In-memory rows for swings, sweeps and confluence states
///
/// Every insert runs its existence checks first and fails closed. Reads that
/// observe more than one active sweep or non-terminal confluence return a
/// `FatalError` instead of picking one.
#[derive(Debug, Default)]
pub struct StructureBook {
    swings: Vec<SwingLevel>,
    sweeps: Vec<LiquiditySweep>,
    confluences: Vec<ConfluenceState>,
    swept_levels: HashSet<u64>,
    next_swing_id: u64,
    next_sweep_id: u64,
    next_confluence_id: u64,
}

impl StructureBook {
    pub fn new() -> Self {
        Self {
            next_swing_id: 1,
            next_sweep_id: 1,
            next_confluence_id: 1,
            ..Self::default()
        }
    }

    /// Rebuild from persisted rows
    pub fn restore(
        swings: Vec<SwingLevel>,
        sweeps: Vec<LiquiditySweep>,
        confluences: Vec<ConfluenceState>,
    ) -> Result<Self, FatalError> {
        let next = |ids: &mut dyn Iterator<Item = u64>| ids.max().map_or(1, |id| id + 1);

        let book = Self {
            next_swing_id: next(&mut swings.iter().map(|s| s.id)),
            next_sweep_id: next(&mut sweeps.iter().map(|s| s.id)),
            next_confluence_id: next(&mut confluences.iter().map(|c| c.id)),
            swept_levels: sweeps.iter().map(|s| s.swing_level_ref).collect(),
            swings,
            sweeps,
            confluences,
        };

        // Surface corruption at startup rather than on the first scan
        book.active_sweep()?;
        book.open_confluence()?;

        tracing::info!(
            swings = book.swings.len(),
            sweeps = book.sweeps.len(),
            confluences = book.confluences.len(),
            "Restored structure book"
        );
        Ok(book)
    }

    // ---- swings ----

    /// Store a confirmed swing as the active one for its (timeframe, type)
    pub fn record_swing(&mut self, timeframe: Timeframe, point: &SwingPoint) -> SwingLevel {
        for swing in self
            .swings
            .iter_mut()
            .filter(|s| s.active && s.timeframe == timeframe && s.swing_type == point.swing_type)
        {
            swing.active = false;
        }

        let swing = SwingLevel {
            id: self.next_swing_id,
            timeframe,
            swing_type: point.swing_type,
            price: point.price,
            active: true,
            timestamp: point.timestamp,
        };
        self.next_swing_id += 1;
        self.swings.push(swing.clone());
        swing
    }

    pub fn active_swing(&self, timeframe: Timeframe, swing_type: SwingType) -> Option<&SwingLevel> {
        self.swings
            .iter()
            .rev()
            .find(|s| s.active && s.timeframe == timeframe && s.swing_type == swing_type)
    }

    /// Active and historical swings of one kind, newest first
    pub fn swing_history(&self, timeframe: Timeframe, swing_type: SwingType) -> Vec<&SwingLevel> {
        self.swings
            .iter()
            .rev()
            .filter(|s| s.timeframe == timeframe && s.swing_type == swing_type)
            .collect()
    }

    pub fn latest_swing_time(&self, timeframe: Timeframe) -> Option<DateTime<Utc>> {
        self.swings
            .iter()
            .filter(|s| s.timeframe == timeframe)
            .map(|s| s.timestamp)
            .max()
    }

    pub fn is_swept(&self, swing_id: u64) -> bool {
        self.swept_levels.contains(&swing_id)
    }

    pub fn swings(&self) -> &[SwingLevel] {
        &self.swings
    }

    // ---- sweeps ----

    /// Deactivate the current sweep and insert the new one (last write wins)
    ///
    /// A confluence still in progress for the replaced sweep is expired so the
    /// new sweep can start its own. The expired row is returned alongside.
    pub fn record_sweep(&mut self, signal: &SweepSignal) -> BotResult<(LiquiditySweep, Option<ConfluenceState>)> {
        let replaced: Vec<u64> = self.sweeps.iter().filter(|s| s.active).map(|s| s.id).collect();
        for sweep in self.sweeps.iter_mut().filter(|s| s.active) {
            sweep.active = false;
        }

        let mut expired = None;
        if let Some((id, sweep_ref)) = self.open_confluence()?.map(|c| (c.id, c.sweep_ref)) {
            if replaced.contains(&sweep_ref) {
                let update = ConfluenceUpdate::new().stage(ConfluenceStage::Expired);
                expired = Some(self.apply_confluence(id, &update)?.clone());
            }
        }

        let sweep = LiquiditySweep {
            id: self.next_sweep_id,
            sweep_type: signal.sweep_type,
            price: signal.price,
            bias: signal.bias,
            swing_level_ref: signal.swing_level_ref,
            swing_price: signal.swing_price,
            active: true,
            timestamp: signal.candle.timestamp,
            sweep_close: signal.candle.close,
            confirmed_at: None,
        };
        self.next_sweep_id += 1;
        self.swept_levels.insert(signal.swing_level_ref);
        self.sweeps.push(sweep.clone());
        Ok((sweep, expired))
    }

    pub fn active_sweep(&self) -> Result<Option<&LiquiditySweep>, FatalError> {
        let mut active = self.sweeps.iter().filter(|s| s.active);
        let first = active.next();
        let extra = active.count();
        if extra > 0 {
            return Err(FatalError::MultipleActiveSweeps { count: extra + 1 });
        }
        Ok(first)
    }

    pub fn sweep(&self, id: u64) -> Option<&LiquiditySweep> {
        self.sweeps.iter().find(|s| s.id == id)
    }

    pub fn confirm_sweep(&mut self, id: u64, at: DateTime<Utc>) -> Option<&LiquiditySweep> {
        let sweep = self.sweeps.iter_mut().find(|s| s.id == id)?;
        if sweep.confirmed_at.is_none() {
            sweep.confirmed_at = Some(at);
        }
        Some(&*sweep)
    }

    pub fn sweeps(&self) -> &[LiquiditySweep] {
        &self.sweeps
    }

    // ---- confluence ----

    /// Start a WAITING_CHOCH row for `sweep_id`
    ///
    /// Rejected while another row is non-terminal, when the sweep already has a
    /// row, or once the sweep is older than `validity`.
    pub fn open_confluence_for(
        &mut self,
        sweep_id: u64,
        now: DateTime<Utc>,
        validity: Duration,
    ) -> BotResult<ConfluenceState> {
        if let Some(open) = self.open_confluence()? {
            return Err(RejectionReason::ConfluenceInProgress(open.id).into());
        }
        if self.confluences.iter().any(|c| c.sweep_ref == sweep_id) {
            return Err(RejectionReason::SweepAlreadyTracked(sweep_id).into());
        }

        let sweep = self
            .sweep(sweep_id)
            .ok_or(RejectionReason::NotActionable(sweep_id))?;
        if now - sweep.timestamp > validity {
            return Err(RejectionReason::SweepExpired {
                sweep_id,
                hours: validity.num_hours(),
            }
            .into());
        }

        let state = ConfluenceState::new(self.next_confluence_id, sweep, now);
        self.next_confluence_id += 1;
        self.confluences.push(state.clone());
        Ok(state)
    }

    /// The single non-terminal row, if any
    pub fn open_confluence(&self) -> Result<Option<&ConfluenceState>, FatalError> {
        let mut open = self.confluences.iter().filter(|c| !c.is_terminal());
        let first = open.next();
        let extra = open.count();
        if extra > 0 {
            return Err(FatalError::MultipleOpenConfluences { count: extra + 1 });
        }
        Ok(first)
    }

    pub fn confluence(&self, id: u64) -> Option<&ConfluenceState> {
        self.confluences.iter().find(|c| c.id == id)
    }

    pub fn confluence_for_sweep(&self, sweep_id: u64) -> Option<&ConfluenceState> {
        self.confluences.iter().find(|c| c.sweep_ref == sweep_id)
    }

    /// COMPLETE rows no proposal has looked at yet, oldest first
    pub fn unconsumed_complete(&self) -> Vec<&ConfluenceState> {
        self.confluences
            .iter()
            .filter(|c| c.current_state == ConfluenceStage::Complete && !c.consumed)
            .collect()
    }

    pub fn apply_confluence(&mut self, id: u64, update: &ConfluenceUpdate) -> BotResult<&ConfluenceState> {
        let state = self
            .confluences
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(RejectionReason::NotActionable(id))?;
        update.apply(state)?;
        Ok(&*state)
    }

    pub fn confluences(&self) -> &[ConfluenceState] {
        &self.confluences
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Bias, Candle};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn point(swing_type: SwingType, price: f64, hours: i64) -> SwingPoint {
        SwingPoint {
            swing_type,
            price,
            timestamp: t0() + Duration::hours(hours),
        }
    }

    fn signal(swing_level_ref: u64, hours: i64) -> SweepSignal {
        SweepSignal {
            sweep_type: SwingType::High,
            price: 91_000.0,
            bias: Bias::Bearish,
            swing_level_ref,
            swing_price: 90_500.0,
            candle: Candle {
                timestamp: t0() + Duration::hours(hours),
                open: 90_400.0,
                high: 91_000.0,
                low: 90_000.0,
                close: 90_400.0,
                volume: 1.0,
            },
        }
    }

    #[test]
    fn test_new_swing_deactivates_previous_of_same_kind() {
        let mut book = StructureBook::new();
        let first = book.record_swing(Timeframe::Coarse, &point(SwingType::High, 100.0, 0));
        book.record_swing(Timeframe::Coarse, &point(SwingType::Low, 90.0, 4));
        book.record_swing(Timeframe::Fine, &point(SwingType::High, 99.0, 4));
        let second = book.record_swing(Timeframe::Coarse, &point(SwingType::High, 110.0, 8));

        assert_ne!(first.id, second.id);
        assert_eq!(book.active_swing(Timeframe::Coarse, SwingType::High).unwrap().id, second.id);
        assert_eq!(book.active_swing(Timeframe::Coarse, SwingType::Low).unwrap().price, 90.0);
        assert_eq!(book.active_swing(Timeframe::Fine, SwingType::High).unwrap().price, 99.0);

        let active_highs = book
            .swings()
            .iter()
            .filter(|s| s.active && s.timeframe == Timeframe::Coarse && s.swing_type == SwingType::High)
            .count();
        assert_eq!(active_highs, 1);
        assert_eq!(book.swing_history(Timeframe::Coarse, SwingType::High).len(), 2);
    }

    #[test]
    fn test_sweep_is_last_write_wins() {
        let mut book = StructureBook::new();
        let (first, _) = book.record_sweep(&signal(1, 8)).unwrap();
        let (second, _) = book.record_sweep(&signal(2, 12)).unwrap();

        let active = book.active_sweep().unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert!(!book.sweep(first.id).unwrap().active);
        assert!(book.is_swept(1) && book.is_swept(2));
    }

    #[test]
    fn test_two_active_sweeps_is_fatal() {
        let mut first = StructureBook::new();
        let (a, _) = first.record_sweep(&signal(1, 8)).unwrap();
        let mut b = a.clone();
        b.id = 2;

        let result = StructureBook::restore(vec![], vec![a, b], vec![]);
        assert!(matches!(result, Err(FatalError::MultipleActiveSweeps { count: 2 })));
    }

    #[test]
    fn test_single_open_confluence_fails_closed() {
        let mut book = StructureBook::new();
        let (s1, _) = book.record_sweep(&signal(1, 8)).unwrap();
        let (s2, _) = book.record_sweep(&signal(2, 12)).unwrap();
        let open = book
            .open_confluence_for(s2.id, t0() + Duration::hours(16), Duration::hours(24))
            .unwrap();
        assert_eq!(open.current_state, ConfluenceStage::WaitingChoch);

        // The older sweep is inactive but still unclaimed
        let err = book
            .open_confluence_for(s1.id, t0() + Duration::hours(16), Duration::hours(24))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::BotError::Validation(RejectionReason::ConfluenceInProgress(id)) if id == open.id
        ));
        assert_eq!(book.confluences().len(), 1);
    }

    #[test]
    fn test_new_sweep_expires_confluence_of_replaced_sweep() {
        let mut book = StructureBook::new();
        let (s1, expired) = book.record_sweep(&signal(1, 8)).unwrap();
        assert!(expired.is_none());
        let first = book
            .open_confluence_for(s1.id, t0() + Duration::hours(12), Duration::hours(24))
            .unwrap();

        let mut opposite = signal(2, 16);
        opposite.sweep_type = SwingType::Low;
        opposite.bias = Bias::Bullish;
        let (s2, expired) = book.record_sweep(&opposite).unwrap();

        let expired = expired.unwrap();
        assert_eq!(expired.id, first.id);
        assert_eq!(expired.current_state, ConfluenceStage::Expired);
        assert!(book.open_confluence().unwrap().is_none());

        let second = book
            .open_confluence_for(s2.id, t0() + Duration::hours(20), Duration::hours(24))
            .unwrap();
        assert_eq!(second.bias, Bias::Bullish);
        assert_eq!(second.current_state, ConfluenceStage::WaitingChoch);
    }

    #[test]
    fn test_stale_sweep_cannot_start_confluence() {
        let mut book = StructureBook::new();
        let (sweep, _) = book.record_sweep(&signal(1, 0)).unwrap();

        let err = book
            .open_confluence_for(sweep.id, t0() + Duration::hours(25), Duration::hours(24))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::BotError::Validation(RejectionReason::SweepExpired { hours: 24, .. })
        ));
    }

    #[test]
    fn test_sweep_gets_one_confluence() {
        let mut book = StructureBook::new();
        let (sweep, _) = book.record_sweep(&signal(1, 0)).unwrap();
        let state = book
            .open_confluence_for(sweep.id, t0() + Duration::hours(4), Duration::hours(24))
            .unwrap();
        book.apply_confluence(state.id, &ConfluenceUpdate::new().stage(ConfluenceStage::Expired))
            .unwrap();

        let err = book
            .open_confluence_for(sweep.id, t0() + Duration::hours(5), Duration::hours(24))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::BotError::Validation(RejectionReason::SweepAlreadyTracked(_))
        ));
    }

    #[test]
    fn test_restore_continues_ids() {
        let mut book = StructureBook::new();
        book.record_swing(Timeframe::Coarse, &point(SwingType::High, 100.0, 0));
        book.record_swing(Timeframe::Coarse, &point(SwingType::High, 101.0, 4));
        let (sweep, _) = book.record_sweep(&signal(2, 8)).unwrap();

        let mut restored =
            StructureBook::restore(book.swings().to_vec(), book.sweeps().to_vec(), vec![]).unwrap();
        let next = restored.record_swing(Timeframe::Fine, &point(SwingType::Low, 95.0, 9));

        assert_eq!(next.id, 3);
        assert!(restored.is_swept(sweep.swing_level_ref));
    }
}
