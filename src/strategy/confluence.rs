//! CHoCH -> FVG fill -> BOS state machine.
//!
//! `ConfluenceMachine::advance` is the only place that decides transitions. It
//! never touches the stored row: it returns the ordered `ConfluenceUpdate`s that
//! the caller applies under its own lock.

use chrono::{DateTime, Duration, Utc};

use crate::config::StrategyParams;
use crate::error::{FatalError, RejectionReason};
use crate::models::{Bias, Candle, ConfluenceStage, ConfluenceState};

/// Allow-listed write to a confluence row
///
/// Only the fields below can change. Rows in a terminal stage refuse every
/// update except the one-shot `consumed` flag on a COMPLETE row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfluenceUpdate {
    stage: Option<ConfluenceStage>,
    choch: Option<(DateTime<Utc>, f64)>,
    fvg_zone: Option<(f64, f64, DateTime<Utc>)>,
    fvg_fill: Option<(DateTime<Utc>, f64)>,
    bos: Option<(DateTime<Utc>, f64)>,
    last_candle_time: Option<DateTime<Utc>>,
    consumed: bool,
}

impl ConfluenceUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: ConfluenceStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn choch(mut self, time: DateTime<Utc>, price: f64) -> Self {
        self.choch = Some((time, price));
        self
    }

    pub fn fvg_zone(mut self, low: f64, high: f64, formed: DateTime<Utc>) -> Self {
        self.fvg_zone = Some((low, high, formed));
        self
    }

    pub fn fvg_fill(mut self, time: DateTime<Utc>, price: f64) -> Self {
        self.fvg_fill = Some((time, price));
        self
    }

    pub fn bos(mut self, time: DateTime<Utc>, price: f64) -> Self {
        self.bos = Some((time, price));
        self
    }

    pub fn last_candle(mut self, time: DateTime<Utc>) -> Self {
        self.last_candle_time = Some(time);
        self
    }

    /// The single write a COMPLETE row accepts
    pub fn consumed() -> Self {
        Self {
            consumed: true,
            ..Self::default()
        }
    }

    /// Stage this update moves the row into, if any
    pub fn target_stage(&self) -> Option<ConfluenceStage> {
        self.stage
    }

    fn is_consume_only(&self) -> bool {
        self.consumed && *self == Self::consumed()
    }

    pub fn apply(&self, state: &mut ConfluenceState) -> Result<(), FatalError> {
        if state.is_terminal() {
            let consumable = state.current_state == ConfluenceStage::Complete && !state.consumed;
            if !(self.is_consume_only() && consumable) {
                return Err(FatalError::TerminalMutation {
                    entity: "confluence",
                    id: state.id,
                });
            }
        }

        if let Some((time, price)) = self.choch {
            state.choch_detected = true;
            state.choch_time = Some(time);
            state.choch_price = Some(price);
        }
        if let Some((low, high, formed)) = self.fvg_zone {
            state.fvg_detected = true;
            state.fvg_zone_low = Some(low);
            state.fvg_zone_high = Some(high);
            state.fvg_formed_time = Some(formed);
        }
        if let Some((time, price)) = self.fvg_fill {
            state.fvg_fill_time = Some(time);
            state.fvg_fill_price = Some(price);
        }
        if let Some((time, price)) = self.bos {
            state.bos_detected = true;
            state.bos_time = Some(time);
            state.bos_price = Some(price);
        }
        if let Some(time) = self.last_candle_time {
            state.last_candle_time = Some(time);
        }
        if let Some(stage) = self.stage {
            state.current_state = stage;
            if stage == ConfluenceStage::Complete {
                state.sequence_valid =
                    validate_sequence(state.choch_time, state.fvg_fill_time, state.bos_time).is_ok();
            }
        }
        if self.consumed {
            state.consumed = true;
        }

        Ok(())
    }
}

/// `choch_time < fvg_fill_time < bos_time`, all present
pub fn validate_sequence(
    choch: Option<DateTime<Utc>>,
    fill: Option<DateTime<Utc>>,
    bos: Option<DateTime<Utc>>,
) -> Result<(), RejectionReason> {
    match (choch, fill, bos) {
        (Some(c), Some(f), Some(b)) if c < f && f < b => Ok(()),
        _ => Err(RejectionReason::MalformedSequence { choch, fill, bos }),
    }
}

pub struct ConfluenceMachine {
    choch_lookback: usize,
    break_threshold: f64,
    fvg_min_gap: f64,
    expiry: Duration,
}

impl ConfluenceMachine {
    pub fn new(params: &StrategyParams) -> Self {
        Self {
            choch_lookback: params.choch_lookback,
            break_threshold: params.break_threshold,
            fvg_min_gap: params.fvg_min_gap,
            expiry: Duration::hours(params.confluence_expiry_hours),
        }
    }

    pub fn is_expired(&self, state: &ConfluenceState, at: DateTime<Utc>) -> bool {
        at - state.created_at > self.expiry
    }

    /// Fold fine candles newer than `last_candle_time` into the state
    ///
    /// `candles` is the fine series sorted oldest first; older candles serve
    /// as CHoCH lookback and FVG context only. Returns one update per new
    /// candle, in order, and ends with an EXPIRED update when
    /// the window has lapsed by `now`. Terminal rows yield nothing.
    pub fn advance(
        &self,
        state: &ConfluenceState,
        candles: &[Candle],
        now: DateTime<Utc>,
    ) -> Result<Vec<ConfluenceUpdate>, FatalError> {
        let mut updates = Vec::new();
        if state.is_terminal() {
            return Ok(updates);
        }

        let mut work = state.clone();

        for (i, candle) in candles.iter().enumerate() {
            if candle.timestamp < work.created_at {
                continue;
            }
            if work.last_candle_time.is_some_and(|last| candle.timestamp <= last) {
                continue;
            }

            let update = if self.is_expired(&work, candle.timestamp) {
                ConfluenceUpdate::new()
                    .stage(ConfluenceStage::Expired)
                    .last_candle(candle.timestamp)
            } else {
                self.step(&work, candles, i)
                    .unwrap_or_default()
                    .last_candle(candle.timestamp)
            };

            update.apply(&mut work)?;
            updates.push(update);

            if work.is_terminal() {
                return Ok(updates);
            }
        }

        if self.is_expired(&work, now) {
            let update = ConfluenceUpdate::new().stage(ConfluenceStage::Expired);
            update.apply(&mut work)?;
            updates.push(update);
        }

        Ok(updates)
    }

    /// Transition triggered by candle `i`, if any
    fn step(&self, state: &ConfluenceState, candles: &[Candle], i: usize) -> Option<ConfluenceUpdate> {
        match state.current_state {
            ConfluenceStage::WaitingChoch => self.check_choch(state.bias, candles, i),
            ConfluenceStage::WaitingFvg => self.check_fvg(state, candles, i),
            ConfluenceStage::WaitingBos => self.check_bos(state, &candles[i]),
            ConfluenceStage::Complete | ConfluenceStage::Expired => None,
        }
    }

    fn check_choch(&self, bias: Bias, candles: &[Candle], i: usize) -> Option<ConfluenceUpdate> {
        if i < self.choch_lookback {
            return None;
        }

        let window = &candles[i - self.choch_lookback..i];
        let candle = &candles[i];

        let broke = match bias {
            Bias::Bullish => {
                let range_high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
                candle.close > range_high * (1.0 + self.break_threshold)
            }
            Bias::Bearish => {
                let range_low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
                candle.close < range_low * (1.0 - self.break_threshold)
            }
        };

        broke.then(|| {
            ConfluenceUpdate::new()
                .stage(ConfluenceStage::WaitingFvg)
                .choch(candle.timestamp, candle.close)
        })
    }

    fn check_fvg(&self, state: &ConfluenceState, candles: &[Candle], i: usize) -> Option<ConfluenceUpdate> {
        let candle = &candles[i];

        // Zone already formed: wait for price to come back into it
        if let (Some(low), Some(high), Some(formed)) =
            (state.fvg_zone_low, state.fvg_zone_high, state.fvg_formed_time)
        {
            if candle.timestamp <= formed {
                return None;
            }
            let fill = match state.bias {
                Bias::Bullish if candle.low <= high => Some(candle.low.clamp(low, high)),
                Bias::Bearish if candle.high >= low => Some(candle.high.clamp(low, high)),
                _ => None,
            };
            return fill.map(|price| {
                ConfluenceUpdate::new()
                    .stage(ConfluenceStage::WaitingBos)
                    .fvg_fill(candle.timestamp, price)
            });
        }

        let choch_time = state.choch_time?;
        if i < 2 {
            return None;
        }
        let first = &candles[i - 2];
        if first.timestamp < choch_time {
            return None;
        }

        match state.bias {
            Bias::Bullish => {
                let gap = candle.low - first.high;
                (gap > 0.0 && gap / first.high >= self.fvg_min_gap)
                    .then(|| ConfluenceUpdate::new().fvg_zone(first.high, candle.low, candle.timestamp))
            }
            Bias::Bearish => {
                let gap = first.low - candle.high;
                (gap > 0.0 && gap / first.low >= self.fvg_min_gap)
                    .then(|| ConfluenceUpdate::new().fvg_zone(candle.high, first.low, candle.timestamp))
            }
        }
    }

    fn check_bos(&self, state: &ConfluenceState, candle: &Candle) -> Option<ConfluenceUpdate> {
        let fill_time = state.fvg_fill_time?;
        let choch_price = state.choch_price?;
        if candle.timestamp <= fill_time {
            return None;
        }

        let broke = match state.bias {
            Bias::Bullish => candle.close > choch_price * (1.0 + self.break_threshold),
            Bias::Bearish => candle.close < choch_price * (1.0 - self.break_threshold),
        };

        broke.then(|| {
            ConfluenceUpdate::new()
                .stage(ConfluenceStage::Complete)
                .bos(candle.timestamp, candle.close)
        })
    }
}
