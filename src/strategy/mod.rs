// Pattern detection: swings, liquidity sweeps and the confluence machine
pub mod book;
pub mod confluence;
pub mod sweep;
pub mod swings;

pub use book::StructureBook;
pub use confluence::{validate_sequence, ConfluenceMachine, ConfluenceUpdate};
pub use sweep::{detect_high_sweep, detect_low_sweep, SweepDetector, SweepSignal};
pub use swings::{detect_swing_high, detect_swing_low, SwingPoint, SwingTracker};
