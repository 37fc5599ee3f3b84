pub mod coinbase;

pub use coinbase::{aggregate_coarse, CoinbaseClient};
