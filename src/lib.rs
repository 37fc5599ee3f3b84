// Core modules
pub mod api;
pub mod backtest;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod models;
pub mod persistence;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use error::{BotError, FatalError, RejectionReason};
pub use models::*;

// Error handling for I/O glue (feed, storage, runner)
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
