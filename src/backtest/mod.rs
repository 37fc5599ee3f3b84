pub mod metrics;
pub mod runner;

pub use metrics::{BacktestMetrics, TradeRecord};
pub use runner::{load_csv, read_candles, BacktestRunner};
