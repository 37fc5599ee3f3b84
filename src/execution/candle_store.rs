use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::error::{BotResult, RejectionReason};
use crate::models::{Candle, Timeframe};

/// Result of pushing a batch of candles into the store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: Vec<RejectionReason>,
    /// Candles that passed validation, new or duplicate
    pub accepted: Vec<Candle>,
}

/// Thread-safe candle series per timeframe
///
/// Append-only and keyed by timestamp: a candle whose timestamp is already
/// stored is ignored, so replaying a feed after reconnect never double counts.
/// The oldest candles are evicted once `max_candles` is exceeded.
#[derive(Clone)]
pub struct CandleStore {
    data: Arc<RwLock<HashMap<Timeframe, BTreeMap<DateTime<Utc>, Candle>>>>,
    max_candles: usize,
}

impl CandleStore {
    /// Create a new candle store
    ///
    /// # Arguments
    /// * `max_candles` - Maximum number of candles to keep per timeframe
    pub fn new(max_candles: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            max_candles,
        }
    }

    /// Upsert a candle keyed by timestamp
    ///
    /// Returns `Ok(true)` if stored, `Ok(false)` if that timestamp was already present.
    /// Candles violating the OHLC invariant are rejected and the store is untouched.
    pub fn ingest(&self, timeframe: Timeframe, candle: Candle) -> BotResult<bool> {
        candle.validate()?;

        let mut data = self.data.write()?;
        let series = data.entry(timeframe).or_default();

        if series.contains_key(&candle.timestamp) {
            return Ok(false);
        }
        series.insert(candle.timestamp, candle);

        while series.len() > self.max_candles {
            series.pop_first();
        }

        Ok(true)
    }

    /// Ingest many candles, logging and skipping invalid ones
    pub fn ingest_batch(&self, timeframe: Timeframe, candles: Vec<Candle>) -> BotResult<IngestReport> {
        let mut report = IngestReport::default();

        for candle in candles {
            match self.ingest(timeframe, candle.clone()) {
                Ok(true) => {
                    report.inserted += 1;
                    report.accepted.push(candle);
                }
                Ok(false) => {
                    report.duplicates += 1;
                    report.accepted.push(candle);
                }
                Err(crate::BotError::Validation(reason)) => {
                    tracing::warn!(timeframe = %timeframe, "Rejected candle: {}", reason);
                    report.rejected.push(reason);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    /// All candles for a timeframe, oldest first
    pub fn candles(&self, timeframe: Timeframe) -> BotResult<Vec<Candle>> {
        let data = self.data.read()?;
        Ok(data
            .get(&timeframe)
            .map(|series| series.values().cloned().collect())
            .unwrap_or_default())
    }

    /// The N most recent candles, oldest first
    pub fn recent(&self, timeframe: Timeframe, n: usize) -> BotResult<Vec<Candle>> {
        let data = self.data.read()?;
        Ok(data
            .get(&timeframe)
            .map(|series| series.values().rev().take(n).rev().cloned().collect())
            .unwrap_or_default())
    }

    pub fn latest(&self, timeframe: Timeframe) -> BotResult<Option<Candle>> {
        let data = self.data.read()?;
        Ok(data
            .get(&timeframe)
            .and_then(|series| series.values().next_back().cloned()))
    }

    pub fn candle_count(&self, timeframe: Timeframe) -> BotResult<usize> {
        let data = self.data.read()?;
        Ok(data.get(&timeframe).map(|s| s.len()).unwrap_or(0))
    }

    pub fn clear(&self) -> BotResult<()> {
        let mut data = self.data.write()?;
        data.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn create_test_candle(minutes: i64, price: f64) -> Candle {
        Candle {
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
                + Duration::minutes(minutes),
            open: price,
            high: price + 1.0,
            low: price - 1.0,
            close: price,
            volume: 1000.0,
        }
    }

    #[test]
    fn test_new_store() {
        let store = CandleStore::new(100);
        assert_eq!(store.max_candles, 100);
        assert_eq!(store.candle_count(Timeframe::Fine).unwrap(), 0);
    }

    #[test]
    fn test_ingest_and_order() {
        let store = CandleStore::new(100);

        // Out of order arrival still reads back sorted
        store.ingest(Timeframe::Fine, create_test_candle(10, 102.0)).unwrap();
        store.ingest(Timeframe::Fine, create_test_candle(0, 100.0)).unwrap();
        store.ingest(Timeframe::Fine, create_test_candle(5, 101.0)).unwrap();

        let candles = store.candles(Timeframe::Fine).unwrap();
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].close, 100.0);
        assert_eq!(candles[2].close, 102.0);
    }

    #[test]
    fn test_reingest_same_timestamp_is_noop() {
        let store = CandleStore::new(100);
        assert!(store.ingest(Timeframe::Fine, create_test_candle(0, 100.0)).unwrap());

        let before = store.candles(Timeframe::Fine).unwrap();
        // Same key with different values must not overwrite
        assert!(!store.ingest(Timeframe::Fine, create_test_candle(0, 250.0)).unwrap());
        let after = store.candles(Timeframe::Fine).unwrap();

        assert_eq!(before, after);
    }

    #[test]
    fn test_timeframes_are_separate() {
        let store = CandleStore::new(100);
        store.ingest(Timeframe::Fine, create_test_candle(0, 100.0)).unwrap();
        store.ingest(Timeframe::Coarse, create_test_candle(0, 200.0)).unwrap();

        assert_eq!(store.candle_count(Timeframe::Fine).unwrap(), 1);
        assert_eq!(store.latest(Timeframe::Coarse).unwrap().unwrap().close, 200.0);
    }

    #[test]
    fn test_max_candles_limit() {
        let store = CandleStore::new(5);

        for i in 0..10 {
            store
                .ingest(Timeframe::Fine, create_test_candle(i * 5, 100.0 + i as f64))
                .unwrap();
        }

        let candles = store.candles(Timeframe::Fine).unwrap();
        assert_eq!(candles.len(), 5);
        assert_eq!(candles[0].close, 105.0);
        assert_eq!(candles[4].close, 109.0);
    }

    #[test]
    fn test_recent_candles() {
        let store = CandleStore::new(100);
        for i in 0..10 {
            store
                .ingest(Timeframe::Fine, create_test_candle(i * 5, 100.0 + i as f64))
                .unwrap();
        }

        let recent = store.recent(Timeframe::Fine, 3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].close, 107.0);
        assert_eq!(recent[2].close, 109.0);
    }

    #[test]
    fn test_batch_rejects_invalid_without_failing() {
        let store = CandleStore::new(100);
        let mut broken = create_test_candle(10, 100.0);
        broken.high = 50.0;

        let report = store
            .ingest_batch(
                Timeframe::Fine,
                vec![create_test_candle(0, 100.0), create_test_candle(0, 100.0), broken],
            )
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.accepted.len(), 2);
        assert_eq!(store.candle_count(Timeframe::Fine).unwrap(), 1);
    }

    #[test]
    fn test_thread_safety() {
        use std::thread;

        let store = CandleStore::new(1000);
        let store_clone = store.clone();

        let handle = thread::spawn(move || {
            for i in 0..50 {
                store_clone
                    .ingest(Timeframe::Fine, create_test_candle(i, 100.0))
                    .unwrap();
            }
        });

        // Overlapping keys from the other thread
        for i in 25..75 {
            store.ingest(Timeframe::Fine, create_test_candle(i, 100.0)).unwrap();
        }

        handle.join().unwrap();

        assert_eq!(store.candle_count(Timeframe::Fine).unwrap(), 75);
    }
}
