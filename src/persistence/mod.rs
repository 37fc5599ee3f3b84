use crate::models::{Candle, Timeframe};
use crate::Result;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::{timeout, Duration};

/// Redis cache for closed candles
///
/// One sorted set per timeframe, `candles:{tf}`, scored by the candle's open
/// time in unix seconds. Writing a candle first removes whatever is stored at
/// its score, so a re-sent candle replaces rather than duplicates.
#[derive(Clone)]
pub struct CandleCache {
    conn: ConnectionManager,
    keep_hours: u64,
}

fn key(timeframe: Timeframe) -> String {
    format!("candles:{}", timeframe)
}

impl CandleCache {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `keep_hours` - How much history `cleanup_old` retains
    pub async fn new(redis_url: &str, keep_hours: u64) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| "Redis connection timeout after 5 seconds")??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn, keep_hours })
    }

    /// Upsert candles by open time
    pub async fn store_candles(&self, timeframe: Timeframe, candles: &[Candle]) -> Result<()> {
        if candles.is_empty() {
            return Ok(());
        }
        let key = key(timeframe);
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for candle in candles {
            let score = candle.timestamp.timestamp();
            let value = serde_json::to_string(candle)?;
            pipe.zrembyscore(&key, score, score).ignore();
            pipe.zadd(&key, value, score).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;

        tracing::debug!("Saved {} {} candles to Redis", candles.len(), timeframe);

        Ok(())
    }

    /// Load candles newer than `hours_back`, oldest first
    pub async fn load_candles(&self, timeframe: Timeframe, hours_back: u64) -> Result<Vec<Candle>> {
        let cutoff = Utc::now() - chrono::Duration::hours(hours_back as i64);
        let mut conn = self.conn.clone();

        let results: Vec<String> = conn
            .zrangebyscore(key(timeframe), cutoff.timestamp(), "+inf")
            .await?;

        let candles = results
            .iter()
            .map(|json| serde_json::from_str::<Candle>(json))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        tracing::info!("Loaded {} {} candles from Redis", candles.len(), timeframe);

        Ok(candles)
    }

    /// Drop candles older than the retention window
    pub async fn cleanup_old(&self, timeframe: Timeframe) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::hours(self.keep_hours as i64);
        let mut conn = self.conn.clone();

        let removed: usize = conn
            .zrembyscore(key(timeframe), "-inf", cutoff.timestamp())
            .await?;

        if removed > 0 {
            tracing::debug!("Cleaned up {} old {} candles", removed, timeframe);
        }

        Ok(removed)
    }

    pub async fn count(&self, timeframe: Timeframe) -> Result<usize> {
        let mut conn = self.conn.clone();
        let count: usize = conn.zcard(key(timeframe)).await?;
        Ok(count)
    }

    /// Remove every cached candle for a timeframe
    pub async fn clear(&self, timeframe: Timeframe) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key(timeframe)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_candle(hours_ago: i64, price: f64) -> Candle {
        Candle {
            timestamp: Utc::now() - chrono::Duration::hours(hours_ago),
            open: price,
            high: price + 1.0,
            low: price - 1.0,
            close: price,
            volume: 10.0,
        }
    }

    #[test]
    fn test_key_per_timeframe() {
        assert_eq!(key(Timeframe::Coarse), "candles:4H");
        assert_eq!(key(Timeframe::Fine), "candles:5M");
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_connection_timeout() {
        // Try to connect to non-existent Redis
        let result = CandleCache::new("redis://192.0.2.1:6379", 24).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_store_is_upsert() {
        let cache = CandleCache::new("redis://127.0.0.1:6379", 24)
            .await
            .expect("Failed to connect to Redis");
        cache.clear(Timeframe::Fine).await.unwrap();

        let candle = create_test_candle(1, 100.0);
        cache.store_candles(Timeframe::Fine, &[candle.clone()]).await.unwrap();

        let mut revised = candle.clone();
        revised.close = 100.5;
        cache.store_candles(Timeframe::Fine, &[revised]).await.unwrap();

        let loaded = cache.load_candles(Timeframe::Fine, 24).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].close, 100.5);

        cache.clear(Timeframe::Fine).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_cleanup_old_data() {
        let cache = CandleCache::new("redis://127.0.0.1:6379", 24)
            .await
            .expect("Failed to connect to Redis");
        cache.clear(Timeframe::Coarse).await.unwrap();

        let candles = vec![
            create_test_candle(72, 100.0), // 3 days ago
            create_test_candle(12, 101.0), // 12 hours ago
        ];
        cache.store_candles(Timeframe::Coarse, &candles).await.unwrap();

        let removed = cache.cleanup_old(Timeframe::Coarse).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.count(Timeframe::Coarse).await.unwrap(), 1);

        cache.clear(Timeframe::Coarse).await.unwrap();
    }
}
