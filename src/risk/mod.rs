// Risk management module
pub mod circuit_breakers;
pub mod position_sizer;
pub mod stop_loss;

pub use circuit_breakers::{CircuitBreakerTrip, CircuitBreakers, TradingState};
pub use position_sizer::{PositionPlan, PositionSizer};
pub use stop_loss::{StopLoss, StopLossCalculator, StopLossRejection};
