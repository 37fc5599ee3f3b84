use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::FeedParams;
use crate::execution::candle_store::{CandleStore, IngestReport};
use crate::models::{Candle, Timeframe};
use crate::persistence::CandleCache;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("no data for {0:?}")]
    Stale(Duration),

    #[error("gave up after {attempts} reconnect attempts")]
    Exhausted { attempts: u32 },
}

/// A live source of OHLCV candles
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn connect(&mut self) -> Result<(), FeedError>;

    /// Recent candles for `timeframe`, oldest first. May include the bucket
    /// that is still forming.
    async fn fetch_candles(&mut self, timeframe: Timeframe) -> Result<Vec<Candle>, FeedError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// `min(base × 2^attempt, cap)`
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_params(params: &FeedParams) -> Self {
        Self {
            base: Duration::from_millis(params.backoff_base_ms),
            cap: Duration::from_secs(params.backoff_cap_secs),
            max_attempts: params.max_reconnect_attempts,
        }
    }

    /// Wait before the next connect after `failures` consecutive failures,
    /// or `None` once the budget is spent
    ///
    /// The first connect goes out at once; retries wait base, 2×base, 4×base...
    pub fn delay(&self, failures: u32) -> Option<Duration> {
        if failures >= self.max_attempts {
            return None;
        }
        Some(match failures {
            0 => Duration::ZERO,
            n => backoff_delay(n - 1, self.base, self.cap),
        })
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_params(&FeedParams::default())
    }
}

/// Drives a `CandleSource` into the candle store
///
/// Owns the connection state machine: DISCONNECTED → CONNECTING → CONNECTED,
/// falling back to DISCONNECTED on any failed fetch or when no data has
/// arrived within the heartbeat window.
pub struct FeedSupervisor<S: CandleSource> {
    source: S,
    store: CandleStore,
    cache: Option<CandleCache>,
    state: ConnectionState,
    attempt: u32,
    policy: ReconnectPolicy,
    heartbeat: Duration,
    op_timeout: Duration,
    last_data: Instant,
}

impl<S: CandleSource> FeedSupervisor<S> {
    pub fn new(source: S, store: CandleStore, policy: ReconnectPolicy, heartbeat: Duration, op_timeout: Duration) -> Self {
        Self {
            source,
            store,
            cache: None,
            state: ConnectionState::Disconnected,
            attempt: 0,
            policy,
            heartbeat,
            op_timeout,
            last_data: Instant::now(),
        }
    }

    /// Mirror every ingested batch into Redis
    pub fn with_cache(mut self, cache: CandleCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn store(&self) -> &CandleStore {
        &self.store
    }

    /// Connect, backing off between failures until the attempt budget is spent
    pub async fn ensure_connected(&mut self) -> Result<(), FeedError> {
        while self.state != ConnectionState::Connected {
            let Some(delay) = self.policy.delay(self.attempt) else {
                self.state = ConnectionState::Disconnected;
                return Err(FeedError::Exhausted {
                    attempts: self.attempt,
                });
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            self.state = ConnectionState::Connecting;
            match tokio::time::timeout(self.op_timeout, self.source.connect()).await {
                Ok(Ok(())) => {
                    tracing::info!(attempt = self.attempt, "Feed connected");
                    self.state = ConnectionState::Connected;
                    self.attempt = 0;
                    self.last_data = Instant::now();
                }
                Ok(Err(e)) => {
                    self.attempt += 1;
                    self.state = ConnectionState::Disconnected;
                    tracing::warn!(attempt = self.attempt, error = %e, "Feed connect failed");
                }
                Err(_) => {
                    self.attempt += 1;
                    self.state = ConnectionState::Disconnected;
                    tracing::warn!(attempt = self.attempt, timeout = ?self.op_timeout, "Feed connect timed out");
                }
            }
        }
        Ok(())
    }

    /// One fetch-and-ingest cycle for both timeframes
    ///
    /// Only candles closed by `now` are ingested. Any failure drops the
    /// connection; the next cycle reconnects.
    pub async fn poll_once(&mut self, now: DateTime<Utc>) -> Result<IngestReport, FeedError> {
        if self.state == ConnectionState::Connected && self.last_data.elapsed() > self.heartbeat {
            tracing::warn!(heartbeat = ?self.heartbeat, "Feed heartbeat missed, reconnecting");
            self.state = ConnectionState::Disconnected;
        }
        self.ensure_connected().await?;

        let mut total = IngestReport::default();
        for timeframe in [Timeframe::Coarse, Timeframe::Fine] {
            let candles = match tokio::time::timeout(self.op_timeout, self.source.fetch_candles(timeframe)).await {
                Ok(Ok(candles)) => candles,
                Ok(Err(e)) => {
                    self.state = ConnectionState::Disconnected;
                    return Err(e);
                }
                Err(_) => {
                    self.state = ConnectionState::Disconnected;
                    return Err(FeedError::Timeout(self.op_timeout));
                }
            };
            self.last_data = Instant::now();

            let closed: Vec<Candle> = candles
                .into_iter()
                .filter(|c| c.timestamp + timeframe.duration() <= now)
                .collect();

            let report = self
                .store
                .ingest_batch(timeframe, closed)
                .map_err(|e| FeedError::Request(e.to_string()))?;
            if report.inserted > 0 {
                tracing::debug!(timeframe = %timeframe, inserted = report.inserted, "Ingested candles");
            }

            // Only what the store accepted goes to the cache
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.store_candles(timeframe, &report.accepted).await {
                    tracing::warn!(timeframe = %timeframe, error = %e, "Candle cache write failed");
                }
            }

            total.inserted += report.inserted;
            total.duplicates += report.duplicates;
            total.rejected.extend(report.rejected);
            total.accepted.extend(report.accepted);
        }

        Ok(total)
    }

    /// Poll every `interval` until cancelled or the reconnect budget runs out
    pub async fn run(&mut self, interval: Duration, cancel: CancellationToken) -> Result<(), FeedError> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Feed supervisor stopping");
                    self.state = ConnectionState::Disconnected;
                    return Ok(());
                }
                _ = ticker.tick() => {
                    match self.poll_once(Utc::now()).await {
                        Ok(_) => {}
                        Err(e @ FeedError::Exhausted { .. }) => {
                            tracing::error!(error = %e, "Feed supervisor giving up");
                            return Err(e);
                        }
                        Err(e) => tracing::warn!(error = %e, "Feed cycle skipped"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::collections::VecDeque;

    struct MockSource {
        connects: VecDeque<Result<(), FeedError>>,
        candles: Vec<Candle>,
        fail_fetch: bool,
        connect_calls: u32,
    }

    impl MockSource {
        fn new(connects: Vec<Result<(), FeedError>>, candles: Vec<Candle>) -> Self {
            Self {
                connects: connects.into(),
                candles,
                fail_fetch: false,
                connect_calls: 0,
            }
        }
    }

    #[async_trait]
    impl CandleSource for MockSource {
        async fn connect(&mut self) -> Result<(), FeedError> {
            self.connect_calls += 1;
            self.connects
                .pop_front()
                .unwrap_or_else(|| Err(FeedError::Connect("refused".to_string())))
        }

        async fn fetch_candles(&mut self, timeframe: Timeframe) -> Result<Vec<Candle>, FeedError> {
            if self.fail_fetch {
                return Err(FeedError::Request("boom".to_string()));
            }
            Ok(match timeframe {
                Timeframe::Fine => self.candles.clone(),
                Timeframe::Coarse => Vec::new(),
            })
        }
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
            max_attempts: 10,
        }
    }

    fn supervisor(source: MockSource) -> FeedSupervisor<MockSource> {
        FeedSupervisor::new(
            source,
            CandleStore::new(100),
            fast_policy(),
            Duration::from_secs(30),
            Duration::from_secs(1),
        )
    }

    fn fine_candle(minute: i64) -> Candle {
        Candle {
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::minutes(minute),
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 1.0,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        assert_eq!(backoff_delay(0, base, cap), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, base, cap), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_secs(4));
        assert_eq!(backoff_delay(6, base, cap), Duration::from_secs(60));
        assert_eq!(backoff_delay(40, base, cap), Duration::from_secs(60));
    }

    #[test]
    fn test_eleventh_attempt_refused() {
        let policy = ReconnectPolicy::default();
        assert!(policy.delay(9).is_some());
        assert!(policy.delay(10).is_none());
    }

    #[test]
    fn test_first_retry_waits_base_delay() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Some(Duration::ZERO));
        assert_eq!(policy.delay(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay(3), Some(Duration::from_secs(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_sleeps_one_then_two_seconds() {
        let source = MockSource::new(
            vec![
                Err(FeedError::Connect("down".to_string())),
                Err(FeedError::Connect("down".to_string())),
                Ok(()),
            ],
            Vec::new(),
        );
        let policy = ReconnectPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_attempts: 10,
        };
        let mut feed = FeedSupervisor::new(
            source,
            CandleStore::new(100),
            policy,
            Duration::from_secs(30),
            Duration::from_secs(1),
        );

        let started = tokio::time::Instant::now();
        feed.ensure_connected().await.unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(feed.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connects_after_failures() {
        let source = MockSource::new(
            vec![
                Err(FeedError::Connect("down".to_string())),
                Err(FeedError::Connect("down".to_string())),
                Ok(()),
            ],
            Vec::new(),
        );
        let mut feed = supervisor(source);

        feed.ensure_connected().await.unwrap();

        assert_eq!(feed.state(), ConnectionState::Connected);
        assert_eq!(feed.attempt(), 0);
        assert_eq!(feed.source.connect_calls, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let mut feed = supervisor(MockSource::new(Vec::new(), Vec::new()));

        let err = feed.ensure_connected().await.unwrap_err();

        assert!(matches!(err, FeedError::Exhausted { attempts: 10 }));
        assert_eq!(feed.source.connect_calls, 10);
        assert_eq!(feed.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_poll_ingests_closed_candles_only() {
        let candles = vec![fine_candle(0), fine_candle(5), fine_candle(10)];
        let mut feed = supervisor(MockSource::new(vec![Ok(())], candles));

        // The 00:10 bucket is still forming at 00:12
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 12, 0).unwrap();
        let report = feed.poll_once(now).await.unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(feed.store().candle_count(Timeframe::Fine).unwrap(), 2);

        // Replaying the same window after reconnect adds nothing
        let report = feed.poll_once(now).await.unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(report.duplicates, 2);
    }

    #[tokio::test]
    async fn test_invalid_candles_are_not_accepted() {
        let mut broken = fine_candle(5);
        broken.high = 90.0;
        let candles = vec![fine_candle(0), broken];
        let mut feed = supervisor(MockSource::new(vec![Ok(())], candles));

        let now = Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap();
        let report = feed.poll_once(now).await.unwrap();

        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.accepted, vec![fine_candle(0)]);
    }

    #[tokio::test]
    async fn test_fetch_failure_drops_connection() {
        let mut source = MockSource::new(vec![Ok(())], Vec::new());
        source.fail_fetch = true;
        let mut feed = supervisor(source);

        let result = feed.poll_once(Utc::now()).await;

        assert!(result.is_err());
        assert_eq!(feed.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let mut feed = supervisor(MockSource::new(vec![Ok(())], Vec::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = feed.run(Duration::from_millis(10), cancel).await;

        assert!(result.is_ok());
        assert_eq!(feed.state(), ConnectionState::Disconnected);
    }
}
