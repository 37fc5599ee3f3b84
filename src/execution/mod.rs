// Execution module
pub mod candle_store;
pub mod executor;
pub mod position_manager;
pub mod price_feed;

pub use candle_store::{CandleStore, IngestReport};
pub use executor::{Executor, TradeProposal};
pub use position_manager::{CloseResult, NewTrade, PositionManager, TickOutcome, TradeUpdate};
pub use price_feed::{
    backoff_delay, CandleSource, ConnectionState, FeedError, FeedSupervisor, ReconnectPolicy,
};
