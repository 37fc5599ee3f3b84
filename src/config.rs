//! Runtime settings.
//!
//! Defaults carry the strategy constants. A `config/sweepbot.toml` file and
//! `SWEEPBOT__SECTION__KEY` environment variables may override them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub strategy: StrategyParams,
    pub risk: RiskParams,
    pub schedule: ScheduleParams,
    pub feed: FeedParams,
    pub storage: StorageParams,
    pub costs: ExecutionCosts,
}

/// Pattern detection thresholds and windows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyParams {
    /// Fraction a swing must be pierced by to count as a sweep
    pub sweep_threshold: f64,
    /// Fine candles looked back over for the CHoCH range
    pub choch_lookback: usize,
    /// Break buffer for CHoCH and BOS closes
    pub break_threshold: f64,
    /// Minimum imbalance size relative to candle 1's extreme
    pub fvg_min_gap: f64,
    pub confluence_expiry_hours: i64,
    pub sweep_validity_hours: i64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            sweep_threshold: 0.001,
            choch_lookback: 10,
            break_threshold: 0.001,
            fvg_min_gap: 0.001,
            confluence_expiry_hours: 12,
            sweep_validity_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskParams {
    pub starting_balance: f64,
    pub risk_per_trade: f64,
    /// Notional cap as a fraction of balance
    pub max_position_fraction: f64,
    pub min_risk_reward: f64,
    pub long_stop_buffer: f64,
    pub short_stop_buffer: f64,
    pub min_stop_distance_pct: f64,
    pub max_stop_distance_pct: f64,
    /// Progress toward target that moves the stop to entry
    pub trailing_activation: f64,
    pub max_trade_hours: i64,
    pub daily_loss_limit_pct: f64,
    pub consecutive_loss_limit: u32,
    pub min_account_balance: f64,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            starting_balance: 10_000.0,
            risk_per_trade: 0.01,
            max_position_fraction: 0.5,
            min_risk_reward: 2.0,
            long_stop_buffer: 0.002,
            short_stop_buffer: 0.003,
            min_stop_distance_pct: 0.5,
            max_stop_distance_pct: 3.0,
            trailing_activation: 0.80,
            max_trade_hours: 72,
            daily_loss_limit_pct: 0.03,
            consecutive_loss_limit: 3,
            min_account_balance: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleParams {
    /// How often to look for a freshly closed coarse candle
    pub bias_scan_secs: u64,
    pub execution_scan_secs: u64,
    pub position_tick_secs: u64,
    /// Timeout applied to each outbound call
    pub operation_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for ScheduleParams {
    fn default() -> Self {
        Self {
            bias_scan_secs: 60,
            execution_scan_secs: 5,
            position_tick_secs: 1,
            operation_timeout_secs: 10,
            shutdown_grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedParams {
    pub base_url: String,
    pub product_id: String,
    pub backoff_base_ms: u64,
    pub backoff_cap_secs: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub requests_per_minute: u32,
}

impl Default for FeedParams {
    fn default() -> Self {
        Self {
            base_url: "https://api.coinbase.com".to_string(),
            product_id: "BTC-USD".to_string(),
            backoff_base_ms: 1_000,
            backoff_cap_secs: 60,
            max_reconnect_attempts: 10,
            heartbeat_timeout_secs: 30,
            poll_interval_secs: 5,
            requests_per_minute: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageParams {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    /// Candles kept in memory per timeframe
    pub candle_capacity: usize,
    pub redis_keep_hours: u64,
}

impl Default for StorageParams {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            candle_capacity: 2_000,
            redis_keep_hours: 24 * 30,
        }
    }
}

/// Simulated fill costs, applied per side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionCosts {
    pub slippage_pct: f64,
    pub fee_pct: f64,
}

impl ExecutionCosts {
    pub fn none() -> Self {
        Self {
            slippage_pct: 0.0,
            fee_pct: 0.0,
        }
    }
}

impl Default for ExecutionCosts {
    fn default() -> Self {
        Self {
            slippage_pct: 0.0005, // 5 bps
            fee_pct: 0.006,       // taker
        }
    }
}

impl Settings {
    /// Layer defaults, optional config file, then environment
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Settings::default())?)
            .add_source(config::File::with_name("config/sweepbot").required(false))
            .add_source(
                config::Environment::with_prefix("SWEEPBOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = settings.try_deserialize()?;

        // Conventional variable names win when present
        if let Ok(url) = std::env::var("DATABASE_URL") {
            settings.storage.database_url = Some(url);
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            settings.storage.redis_url = Some(url);
        }

        Ok(settings)
    }
}
