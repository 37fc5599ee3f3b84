use crate::engine::EngineSnapshot;
use crate::models::{ConfluenceState, LiquiditySweep, SwingLevel, Trade, TradeId};
use crate::Result;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// Postgres persistence for structure rows and trades
///
/// Every save is an upsert keyed by the row id, so writing the same snapshot
/// twice is harmless. Rows identical to what was last written are skipped.
pub struct PostgresPersistence {
    pool: PgPool,
    saved: Mutex<SavedRows>,
}

/// Last written version of every row, keyed by id
#[derive(Debug, Default)]
struct SavedRows {
    swings: HashMap<u64, SwingLevel>,
    sweeps: HashMap<u64, LiquiditySweep>,
    confluences: HashMap<u64, ConfluenceState>,
    trades: HashMap<TradeId, Trade>,
}

fn changed<K, T, F>(rows: &[T], saved: &HashMap<K, T>, key: F) -> Vec<T>
where
    K: Eq + Hash,
    T: Clone + PartialEq,
    F: Fn(&T) -> K,
{
    rows.iter()
        .filter(|row| saved.get(&key(*row)) != Some(*row))
        .cloned()
        .collect()
}

impl SavedRows {
    /// Rows of `snapshot` that differ from their last written version
    fn pending(&self, snapshot: &EngineSnapshot) -> EngineSnapshot {
        EngineSnapshot {
            swings: changed(&snapshot.swings, &self.swings, |s: &SwingLevel| s.id),
            sweeps: changed(&snapshot.sweeps, &self.sweeps, |s: &LiquiditySweep| s.id),
            confluences: changed(&snapshot.confluences, &self.confluences, |c: &ConfluenceState| c.id),
            trades: changed(&snapshot.trades, &self.trades, |t: &Trade| t.id),
        }
    }

    fn record(&mut self, written: &EngineSnapshot) {
        self.swings.extend(written.swings.iter().map(|s| (s.id, s.clone())));
        self.sweeps.extend(written.sweeps.iter().map(|s| (s.id, s.clone())));
        self.confluences.extend(written.confluences.iter().map(|c| (c.id, c.clone())));
        self.trades.extend(written.trades.iter().map(|t| (t.id, t.clone())));
    }
}

fn dec(value: f64) -> Result<Decimal> {
    Decimal::from_f64(value).ok_or_else(|| format!("{} does not fit a NUMERIC column", value).into())
}

fn opt_dec(value: Option<f64>) -> Result<Option<Decimal>> {
    value.map(dec).transpose()
}

fn num(row: &PgRow, column: &str) -> Result<f64> {
    let value: Decimal = row.try_get(column)?;
    value
        .to_f64()
        .ok_or_else(|| format!("{} is not a finite float", column).into())
}

fn opt_num(row: &PgRow, column: &str) -> Result<Option<f64>> {
    let value: Option<Decimal> = row.try_get(column)?;
    value
        .map(|v| v.to_f64().ok_or_else(|| format!("{} is not a finite float", column).into()))
        .transpose()
}

fn id(row: &PgRow, column: &str) -> Result<u64> {
    let value: i64 = row.try_get(column)?;
    Ok(u64::try_from(value)?)
}

fn text<T>(row: &PgRow, column: &str) -> Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let value: String = row.try_get(column)?;
    Ok(value.parse()?)
}

fn opt_text<T>(row: &PgRow, column: &str) -> Result<Option<T>>
where
    T: std::str::FromStr<Err = String>,
{
    let value: Option<String> = row.try_get(column)?;
    Ok(value.map(|v| v.parse()).transpose()?)
}

impl PostgresPersistence {
    /// Connect to Postgres and run pending migrations
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres");

        Ok(Self {
            pool,
            saved: Mutex::new(SavedRows::default()),
        })
    }

    fn saved(&self) -> Result<std::sync::MutexGuard<'_, SavedRows>> {
        self.saved.lock().map_err(|_| "saved row cache lock poisoned".into())
    }

    /// Write the changed rows of a snapshot in one transaction
    ///
    /// Rows are written oldest id first so the single-active-sweep and
    /// single-open-trade indexes never see two live rows at once.
    pub async fn save_snapshot(&self, snapshot: &EngineSnapshot) -> Result<()> {
        let snapshot = self.saved()?.pending(snapshot);
        if snapshot.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for swing in &snapshot.swings {
            Self::upsert_swing(&mut tx, swing).await?;
        }
        for sweep in &snapshot.sweeps {
            Self::upsert_sweep(&mut tx, sweep).await?;
        }
        for state in &snapshot.confluences {
            Self::upsert_confluence(&mut tx, state).await?;
        }
        for trade in &snapshot.trades {
            Self::upsert_trade(&mut tx, trade).await?;
        }

        tx.commit().await?;
        self.saved()?.record(&snapshot);

        tracing::debug!(
            swings = snapshot.swings.len(),
            sweeps = snapshot.sweeps.len(),
            confluences = snapshot.confluences.len(),
            trades = snapshot.trades.len(),
            "Saved snapshot to Postgres"
        );
        Ok(())
    }

    async fn upsert_swing(tx: &mut Transaction<'_, Postgres>, swing: &SwingLevel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO swing_levels (id, timeframe, swing_type, price, active, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                active = EXCLUDED.active,
                updated_at = NOW()
            "#,
        )
        .bind(swing.id as i64)
        .bind(swing.timeframe.as_str())
        .bind(swing.swing_type.as_str())
        .bind(dec(swing.price)?)
        .bind(swing.active)
        .bind(swing.timestamp)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn upsert_sweep(tx: &mut Transaction<'_, Postgres>, sweep: &LiquiditySweep) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO liquidity_sweeps (
                id, sweep_type, price, bias, swing_level_ref, swing_price,
                active, timestamp, sweep_close, confirmed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                active = EXCLUDED.active,
                confirmed_at = EXCLUDED.confirmed_at,
                updated_at = NOW()
            "#,
        )
        .bind(sweep.id as i64)
        .bind(sweep.sweep_type.as_str())
        .bind(dec(sweep.price)?)
        .bind(sweep.bias.as_str())
        .bind(sweep.swing_level_ref as i64)
        .bind(dec(sweep.swing_price)?)
        .bind(sweep.active)
        .bind(sweep.timestamp)
        .bind(dec(sweep.sweep_close)?)
        .bind(sweep.confirmed_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn upsert_confluence(tx: &mut Transaction<'_, Postgres>, state: &ConfluenceState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO confluence_states (
                id, sweep_ref, current_state, bias,
                choch_detected, choch_time, choch_price,
                fvg_detected, fvg_zone_low, fvg_zone_high, fvg_formed_time,
                fvg_fill_time, fvg_fill_price,
                bos_detected, bos_time, bos_price,
                sequence_valid, created_at, last_candle_time, consumed
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (id) DO UPDATE SET
                current_state = EXCLUDED.current_state,
                choch_detected = EXCLUDED.choch_detected,
                choch_time = EXCLUDED.choch_time,
                choch_price = EXCLUDED.choch_price,
                fvg_detected = EXCLUDED.fvg_detected,
                fvg_zone_low = EXCLUDED.fvg_zone_low,
                fvg_zone_high = EXCLUDED.fvg_zone_high,
                fvg_formed_time = EXCLUDED.fvg_formed_time,
                fvg_fill_time = EXCLUDED.fvg_fill_time,
                fvg_fill_price = EXCLUDED.fvg_fill_price,
                bos_detected = EXCLUDED.bos_detected,
                bos_time = EXCLUDED.bos_time,
                bos_price = EXCLUDED.bos_price,
                sequence_valid = EXCLUDED.sequence_valid,
                last_candle_time = EXCLUDED.last_candle_time,
                consumed = EXCLUDED.consumed,
                updated_at = NOW()
            "#,
        )
        .bind(state.id as i64)
        .bind(state.sweep_ref as i64)
        .bind(state.current_state.as_str())
        .bind(state.bias.as_str())
        .bind(state.choch_detected)
        .bind(state.choch_time)
        .bind(opt_dec(state.choch_price)?)
        .bind(state.fvg_detected)
        .bind(opt_dec(state.fvg_zone_low)?)
        .bind(opt_dec(state.fvg_zone_high)?)
        .bind(state.fvg_formed_time)
        .bind(state.fvg_fill_time)
        .bind(opt_dec(state.fvg_fill_price)?)
        .bind(state.bos_detected)
        .bind(state.bos_time)
        .bind(opt_dec(state.bos_price)?)
        .bind(state.sequence_valid)
        .bind(state.created_at)
        .bind(state.last_candle_time)
        .bind(state.consumed)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn upsert_trade(tx: &mut Transaction<'_, Postgres>, trade: &Trade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, confluence_ref, direction, entry_price, entry_time,
                stop_loss, initial_stop_loss, stop_loss_source, stop_loss_swing_price,
                stop_distance_pct, take_profit, position_size, risk_amount, risk_reward_ratio,
                trailing_stop_activated, trailing_activated_at, status,
                outcome, exit_reason, exit_price, exit_time, pnl
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
            ON CONFLICT (id) DO UPDATE SET
                stop_loss = EXCLUDED.stop_loss,
                trailing_stop_activated = EXCLUDED.trailing_stop_activated,
                trailing_activated_at = EXCLUDED.trailing_activated_at,
                status = EXCLUDED.status,
                outcome = EXCLUDED.outcome,
                exit_reason = EXCLUDED.exit_reason,
                exit_price = EXCLUDED.exit_price,
                exit_time = EXCLUDED.exit_time,
                pnl = EXCLUDED.pnl,
                updated_at = NOW()
            "#,
        )
        .bind(trade.id.0 as i64)
        .bind(trade.confluence_ref as i64)
        .bind(trade.direction.as_str())
        .bind(dec(trade.entry_price)?)
        .bind(trade.entry_time)
        .bind(dec(trade.stop_loss)?)
        .bind(dec(trade.initial_stop_loss)?)
        .bind(trade.stop_loss_source.as_str())
        .bind(dec(trade.stop_loss_swing_price)?)
        .bind(dec(trade.stop_distance_pct)?)
        .bind(dec(trade.take_profit)?)
        .bind(dec(trade.position_size)?)
        .bind(dec(trade.risk_amount)?)
        .bind(dec(trade.risk_reward_ratio)?)
        .bind(trade.trailing_stop_activated)
        .bind(trade.trailing_activated_at)
        .bind(trade.status.as_str())
        .bind(trade.outcome.map(|o| o.as_str()))
        .bind(trade.exit_reason.map(|r| r.as_str()))
        .bind(opt_dec(trade.exit_price)?)
        .bind(trade.exit_time)
        .bind(opt_dec(trade.pnl)?)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Load every persisted row
    pub async fn load_snapshot(&self) -> Result<EngineSnapshot> {
        let snapshot = EngineSnapshot {
            swings: self.load_swings().await?,
            sweeps: self.load_sweeps().await?,
            confluences: self.load_confluences().await?,
            trades: self.load_trades().await?,
        };

        tracing::info!(
            swings = snapshot.swings.len(),
            sweeps = snapshot.sweeps.len(),
            confluences = snapshot.confluences.len(),
            trades = snapshot.trades.len(),
            "Loaded snapshot from Postgres"
        );
        self.saved()?.record(&snapshot);
        Ok(snapshot)
    }

    pub async fn load_swings(&self) -> Result<Vec<SwingLevel>> {
        let rows = sqlx::query("SELECT * FROM swing_levels ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<SwingLevel> {
                Ok(SwingLevel {
                    id: id(row, "id")?,
                    timeframe: text(row, "timeframe")?,
                    swing_type: text(row, "swing_type")?,
                    price: num(row, "price")?,
                    active: row.try_get("active")?,
                    timestamp: row.try_get("timestamp")?,
                })
            })
            .collect()
    }

    pub async fn load_sweeps(&self) -> Result<Vec<LiquiditySweep>> {
        let rows = sqlx::query("SELECT * FROM liquidity_sweeps ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<LiquiditySweep> {
                Ok(LiquiditySweep {
                    id: id(row, "id")?,
                    sweep_type: text(row, "sweep_type")?,
                    price: num(row, "price")?,
                    bias: text(row, "bias")?,
                    swing_level_ref: id(row, "swing_level_ref")?,
                    swing_price: num(row, "swing_price")?,
                    active: row.try_get("active")?,
                    timestamp: row.try_get("timestamp")?,
                    sweep_close: num(row, "sweep_close")?,
                    confirmed_at: row.try_get("confirmed_at")?,
                })
            })
            .collect()
    }

    pub async fn load_confluences(&self) -> Result<Vec<ConfluenceState>> {
        let rows = sqlx::query("SELECT * FROM confluence_states ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<ConfluenceState> {
                Ok(ConfluenceState {
                    id: id(row, "id")?,
                    sweep_ref: id(row, "sweep_ref")?,
                    current_state: text(row, "current_state")?,
                    bias: text(row, "bias")?,
                    choch_detected: row.try_get("choch_detected")?,
                    choch_time: row.try_get("choch_time")?,
                    choch_price: opt_num(row, "choch_price")?,
                    fvg_detected: row.try_get("fvg_detected")?,
                    fvg_zone_low: opt_num(row, "fvg_zone_low")?,
                    fvg_zone_high: opt_num(row, "fvg_zone_high")?,
                    fvg_formed_time: row.try_get("fvg_formed_time")?,
                    fvg_fill_time: row.try_get("fvg_fill_time")?,
                    fvg_fill_price: opt_num(row, "fvg_fill_price")?,
                    bos_detected: row.try_get("bos_detected")?,
                    bos_time: row.try_get("bos_time")?,
                    bos_price: opt_num(row, "bos_price")?,
                    sequence_valid: row.try_get("sequence_valid")?,
                    created_at: row.try_get("created_at")?,
                    last_candle_time: row.try_get("last_candle_time")?,
                    consumed: row.try_get("consumed")?,
                })
            })
            .collect()
    }

    pub async fn load_trades(&self) -> Result<Vec<Trade>> {
        let rows = sqlx::query("SELECT * FROM trades ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        let trades = rows
            .iter()
            .map(|row| -> Result<Trade> {
                Ok(Trade {
                    id: TradeId(id(row, "id")?),
                    confluence_ref: id(row, "confluence_ref")?,
                    direction: text(row, "direction")?,
                    entry_price: num(row, "entry_price")?,
                    entry_time: row.try_get("entry_time")?,
                    stop_loss: num(row, "stop_loss")?,
                    initial_stop_loss: num(row, "initial_stop_loss")?,
                    stop_loss_source: text(row, "stop_loss_source")?,
                    stop_loss_swing_price: num(row, "stop_loss_swing_price")?,
                    stop_distance_pct: num(row, "stop_distance_pct")?,
                    take_profit: num(row, "take_profit")?,
                    position_size: num(row, "position_size")?,
                    risk_amount: num(row, "risk_amount")?,
                    risk_reward_ratio: num(row, "risk_reward_ratio")?,
                    trailing_stop_activated: row.try_get("trailing_stop_activated")?,
                    trailing_activated_at: row.try_get("trailing_activated_at")?,
                    status: text(row, "status")?,
                    outcome: opt_text(row, "outcome")?,
                    exit_reason: opt_text(row, "exit_reason")?,
                    exit_price: opt_num(row, "exit_price")?,
                    exit_time: row.try_get("exit_time")?,
                    pnl: opt_num(row, "pnl")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!("Loaded {} trades from Postgres", trades.len());
        Ok(trades)
    }

    /// Get total realised P&L across closed trades
    pub async fn get_total_pnl(&self) -> Result<f64> {
        let row = sqlx::query("SELECT COALESCE(SUM(pnl), 0) AS total_pnl FROM trades WHERE status = 'CLOSED'")
            .fetch_one(&self.pool)
            .await?;
        num(&row, "total_pnl")
    }

    /// Delete every row (tests and `--reset`)
    pub async fn clear_all(&self) -> Result<()> {
        sqlx::query("TRUNCATE trades, confluence_states, liquidity_sweeps, swing_levels")
            .execute(&self.pool)
            .await?;
        *self.saved()? = SavedRows::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Bias, ConfluenceStage, Direction, StopSource, SwingType, Timeframe, TradeStatus};
    use chrono::{Duration, TimeZone, Utc};

    async fn get_test_db() -> PostgresPersistence {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/sweepbot_test".to_string());

        PostgresPersistence::new(&database_url)
            .await
            .expect("Failed to connect to test database")
    }

    fn sample_snapshot() -> EngineSnapshot {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let swing = SwingLevel {
            id: 1,
            timeframe: Timeframe::Coarse,
            swing_type: SwingType::Low,
            price: 86_500.0,
            active: true,
            timestamp: t0,
        };
        let sweep = LiquiditySweep {
            id: 1,
            sweep_type: SwingType::Low,
            price: 86_000.0,
            bias: Bias::Bullish,
            swing_level_ref: 1,
            swing_price: 86_500.0,
            active: true,
            timestamp: t0 + Duration::hours(8),
            sweep_close: 87_200.0,
            confirmed_at: None,
        };
        let mut confluence = ConfluenceState::new(1, &sweep, t0 + Duration::hours(12));
        confluence.current_state = ConfluenceStage::WaitingFvg;
        confluence.choch_detected = true;
        confluence.choch_time = Some(t0 + Duration::hours(13));
        confluence.choch_price = Some(89_000.5);

        let trade = Trade {
            id: TradeId(1),
            confluence_ref: 1,
            direction: Direction::Long,
            entry_price: 90_000.0,
            entry_time: t0 + Duration::hours(14),
            stop_loss: 87_300.05,
            initial_stop_loss: 87_300.05,
            stop_loss_source: StopSource::FineSwing,
            stop_loss_swing_price: 87_475.0,
            stop_distance_pct: 2.9999,
            take_profit: 96_000.0,
            position_size: 0.037,
            risk_amount: 100.0,
            risk_reward_ratio: 2.22,
            trailing_stop_activated: false,
            trailing_activated_at: None,
            status: TradeStatus::Open,
            outcome: None,
            exit_reason: None,
            exit_price: None,
            exit_time: None,
            pnl: None,
        };

        EngineSnapshot {
            swings: vec![swing],
            sweeps: vec![sweep],
            confluences: vec![confluence],
            trades: vec![trade],
        }
    }

    #[test]
    fn test_decimal_conversion() {
        let value = dec(87_300.05).unwrap();
        assert_eq!(value.to_f64(), Some(87_300.05));
        assert!(dec(f64::NAN).is_err());
        assert_eq!(opt_dec(None).unwrap(), None);
    }

    #[test]
    fn test_unchanged_rows_are_not_rewritten() {
        let mut saved = SavedRows::default();
        let snapshot = sample_snapshot();
        assert_eq!(saved.pending(&snapshot).swings.len(), 1);

        saved.record(&snapshot);
        assert!(saved.pending(&snapshot).is_empty());

        // Only the deactivated swing and the new one go out
        let mut next = snapshot.clone();
        next.swings[0].active = false;
        let mut newer = next.swings[0].clone();
        newer.id = 2;
        newer.active = true;
        next.swings.push(newer);

        let pending = saved.pending(&next);
        assert_eq!(pending.swings.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(pending.sweeps.is_empty());
        assert!(pending.confluences.is_empty());
        assert!(pending.trades.is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_snapshot_round_trip() {
        let db = get_test_db().await;
        db.clear_all().await.unwrap();

        let snapshot = sample_snapshot();
        db.save_snapshot(&snapshot).await.unwrap();
        // Saving twice is an upsert
        db.save_snapshot(&snapshot).await.unwrap();

        let loaded = db.load_snapshot().await.unwrap();
        assert_eq!(loaded.swings, snapshot.swings);
        assert_eq!(loaded.sweeps, snapshot.sweeps);
        assert_eq!(loaded.confluences, snapshot.confluences);
        assert_eq!(loaded.trades, snapshot.trades);

        db.clear_all().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_closed_trade_updates_row() {
        let db = get_test_db().await;
        db.clear_all().await.unwrap();

        let mut snapshot = sample_snapshot();
        db.save_snapshot(&snapshot).await.unwrap();

        let trade = &mut snapshot.trades[0];
        trade.status = TradeStatus::Closed;
        trade.exit_price = Some(96_000.0);
        trade.exit_time = Some(trade.entry_time + Duration::hours(10));
        trade.outcome = Some(crate::models::Outcome::Win);
        trade.exit_reason = Some(crate::models::ExitReason::TakeProfit);
        trade.pnl = Some(222.0);
        db.save_snapshot(&snapshot).await.unwrap();

        let trades = db.load_trades().await.unwrap();
        assert_eq!(trades.len(), 1);
        assert!(!trades[0].is_open());
        assert_eq!(db.get_total_pnl().await.unwrap(), 222.0);

        db.clear_all().await.unwrap();
    }
}
