use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, TimeZone, Utc};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::config::FeedParams;
use crate::execution::price_feed::{CandleSource, FeedError};
use crate::models::{Candle, Timeframe};

const MAX_RETRIES: u32 = 3;
/// Coinbase caps one candles request at 350 buckets
const MAX_BUCKETS: i64 = 300;

// Type alias for the rate limiter to simplify signatures
type CoinbaseRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Public Coinbase Advanced Trade market data client
///
/// This struct is cloneable to allow sharing across async tasks.
/// All clones share the same rate limiter.
#[derive(Clone)]
pub struct CoinbaseClient {
    client: Client,
    base_url: String,
    product_id: String,
    rate_limiter: Arc<CoinbaseRateLimiter>,
}

/// Response from /market/products/{id}/candles
#[derive(Debug, Deserialize)]
struct CandlesResponse {
    candles: Vec<CoinbaseCandle>,
}

/// Coinbase sends every field as a string
#[derive(Debug, Deserialize)]
struct CoinbaseCandle {
    start: String,
    low: String,
    high: String,
    open: String,
    close: String,
    volume: String,
}

impl CoinbaseCandle {
    fn parse(&self) -> Result<Candle> {
        let start: i64 = self.start.parse().context("bad candle start")?;
        let timestamp = Utc
            .timestamp_opt(start, 0)
            .single()
            .context("candle start out of range")?;

        Ok(Candle {
            timestamp,
            open: self.open.parse().context("bad open")?,
            high: self.high.parse().context("bad high")?,
            low: self.low.parse().context("bad low")?,
            close: self.close.parse().context("bad close")?,
            volume: self.volume.parse().context("bad volume")?,
        })
    }
}

/// Granularity requested for a timeframe and how many of them make one candle
///
/// Coinbase has no 4H bucket, so coarse candles are built from hourly ones.
fn granularity(timeframe: Timeframe) -> (&'static str, Duration, usize) {
    match timeframe {
        Timeframe::Fine => ("FIVE_MINUTE", Duration::minutes(5), 1),
        Timeframe::Coarse => ("ONE_HOUR", Duration::hours(1), 4),
    }
}

/// Merge hourly candles into 4H buckets aligned to 00:00 UTC
///
/// Buckets missing any of their four hours are dropped.
pub fn aggregate_coarse(hourly: &[Candle]) -> Vec<Candle> {
    let mut buckets: BTreeMap<DateTime<Utc>, Vec<&Candle>> = BTreeMap::new();
    for candle in hourly {
        if let Ok(start) = candle.timestamp.duration_trunc(Timeframe::Coarse.duration()) {
            buckets.entry(start).or_default().push(candle);
        }
    }

    buckets
        .into_iter()
        .filter(|(_, parts)| parts.len() == 4)
        .map(|(start, mut parts)| {
            parts.sort_by_key(|c| c.timestamp);
            Candle {
                timestamp: start,
                open: parts[0].open,
                high: parts.iter().map(|c| c.high).fold(f64::MIN, f64::max),
                low: parts.iter().map(|c| c.low).fold(f64::MAX, f64::min),
                close: parts[3].close,
                volume: parts.iter().map(|c| c.volume).sum(),
            }
        })
        .collect()
}

impl CoinbaseClient {
    pub fn new(params: &FeedParams, timeout: std::time::Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let rpm = NonZeroU32::new(params.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        Ok(Self {
            client,
            base_url: params.base_url.trim_end_matches('/').to_string(),
            product_id: params.product_id.clone(),
            rate_limiter,
        })
    }

    /// Make a rate-limited API request with retry logic
    async fn make_request(&self, url: &str) -> Result<reqwest::Response> {
        for attempt in 1..=MAX_RETRIES {
            // Wait for rate limiter
            self.rate_limiter.until_ready().await;

            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    }

                    // Rate limits and server errors are worth another try
                    if status.as_u16() == 429 || status.is_server_error() {
                        let backoff_secs = 2u64.pow(attempt - 1);
                        tracing::warn!(
                            "Coinbase returned {}, retrying in {}s (attempt {}/{})",
                            status,
                            backoff_secs,
                            attempt,
                            MAX_RETRIES
                        );
                        if attempt < MAX_RETRIES {
                            tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
                        }
                        continue;
                    }

                    // Other errors (4xx) - don't retry
                    let error_text = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown error".to_string());
                    anyhow::bail!("Coinbase API error ({}): {}", status, error_text);
                }
                Err(e) if attempt < MAX_RETRIES => {
                    tracing::warn!(
                        "Network error: {}, retrying (attempt {}/{})",
                        e,
                        attempt,
                        MAX_RETRIES
                    );
                }
                Err(e) => anyhow::bail!("Network error after {} retries: {}", MAX_RETRIES, e),
            }
        }

        anyhow::bail!("Failed after {} retries", MAX_RETRIES)
    }

    /// Check that the product exists and the API answers
    pub async fn ping(&self) -> Result<()> {
        let url = format!(
            "{}/api/v3/brokerage/market/products/{}",
            self.base_url, self.product_id
        );
        self.make_request(&url).await?;
        Ok(())
    }

    /// Candles covering `[end − buckets × granularity, end]`, oldest first
    ///
    /// Coarse candles are aggregated from hourly data. The bucket still
    /// forming at `end` is included; callers drop it.
    pub async fn get_candles(
        &self,
        timeframe: Timeframe,
        end: DateTime<Utc>,
        buckets: i64,
    ) -> Result<Vec<Candle>> {
        let (name, step, per_candle) = granularity(timeframe);
        let raw_buckets = (buckets * per_candle as i64).min(MAX_BUCKETS);
        let start = end - step * raw_buckets as i32;

        let url = format!(
            "{}/api/v3/brokerage/market/products/{}/candles?start={}&end={}&granularity={}",
            self.base_url,
            self.product_id,
            start.timestamp(),
            end.timestamp(),
            name
        );

        let response = self.make_request(&url).await?;
        let body: CandlesResponse = response
            .json()
            .await
            .context("Failed to parse candles response")?;

        let mut candles = body
            .candles
            .iter()
            .map(CoinbaseCandle::parse)
            .collect::<Result<Vec<_>>>()?;
        candles.sort_by_key(|c| c.timestamp);

        tracing::debug!(
            timeframe = %timeframe,
            count = candles.len(),
            "Fetched candles from Coinbase"
        );

        Ok(match timeframe {
            Timeframe::Fine => candles,
            Timeframe::Coarse => aggregate_coarse(&candles),
        })
    }
}

#[async_trait]
impl CandleSource for CoinbaseClient {
    async fn connect(&mut self) -> std::result::Result<(), FeedError> {
        self.ping()
            .await
            .map_err(|e| FeedError::Connect(format!("{:#}", e)))
    }

    async fn fetch_candles(
        &mut self,
        timeframe: Timeframe,
    ) -> std::result::Result<Vec<Candle>, FeedError> {
        let lookback = match timeframe {
            Timeframe::Fine => 60,
            Timeframe::Coarse => 30,
        };
        self.get_candles(timeframe, Utc::now(), lookback)
            .await
            .map_err(|e| FeedError::Request(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(base_url: String) -> FeedParams {
        FeedParams {
            base_url,
            requests_per_minute: 600,
            ..FeedParams::default()
        }
    }

    fn hour(h: u32, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, h, 0, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn test_aggregate_coarse_buckets() {
        let hourly = vec![
            hour(0, 100.0, 102.0, 99.0, 101.0),
            hour(1, 101.0, 105.0, 100.0, 104.0),
            hour(2, 104.0, 104.5, 98.0, 99.0),
            hour(3, 99.0, 100.0, 97.5, 98.5),
            // Incomplete second bucket
            hour(4, 98.5, 99.0, 98.0, 98.8),
        ];

        let coarse = aggregate_coarse(&hourly);
        assert_eq!(coarse.len(), 1);
        assert_eq!(coarse[0].timestamp, hourly[0].timestamp);
        assert_eq!(coarse[0].open, 100.0);
        assert_eq!(coarse[0].high, 105.0);
        assert_eq!(coarse[0].low, 97.5);
        assert_eq!(coarse[0].close, 98.5);
        assert_eq!(coarse[0].volume, 4.0);
    }

    #[tokio::test]
    async fn test_get_fine_candles_parses_strings() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock(
                "GET",
                mockito::Matcher::Regex(r"^/api/v3/brokerage/market/products/BTC-USD/candles.*".to_string()),
            )
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"candles":[
                    {"start":"1735689900","low":"93990.1","high":"94100","open":"94000","close":"94050.5","volume":"12.5"},
                    {"start":"1735689600","low":"93900","high":"94020","open":"93950","close":"94000","volume":"8"}
                ]}"#,
            )
            .create_async()
            .await;

        let client = CoinbaseClient::new(&params(server.url()), std::time::Duration::from_secs(5)).unwrap();
        let candles = client
            .get_candles(Timeframe::Fine, Utc::now(), 2)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(candles.len(), 2);
        // Sorted oldest first
        assert!(candles[0].timestamp < candles[1].timestamp);
        assert_eq!(candles[1].close, 94050.5);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v3/brokerage/market/products/BTC-USD")
            .with_status(404)
            .with_body("not found")
            .expect(1)
            .create_async()
            .await;

        let client = CoinbaseClient::new(&params(server.url()), std::time::Duration::from_secs(5)).unwrap();
        let result = client.ping().await;

        mock.assert_async().await;
        assert!(result.unwrap_err().to_string().contains("404"));
    }

    #[tokio::test]
    #[ignore] // Requires live API
    async fn test_live_candles() {
        let client =
            CoinbaseClient::new(&FeedParams::default(), std::time::Duration::from_secs(10)).unwrap();
        let candles = client
            .get_candles(Timeframe::Coarse, Utc::now(), 6)
            .await
            .unwrap();
        assert!(!candles.is_empty());
    }
}
