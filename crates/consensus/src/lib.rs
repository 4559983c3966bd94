//! Consensus constants, chain parameters, and the stake reward schedule.

pub mod constants;
pub mod money;
pub mod params;
pub mod rewards;

pub use money::{money_range, Amount, CENT, COIN, MAX_MONEY, MIN_TXOUT_AMOUNT, MIN_TX_FEE};
pub use params::{chain_params, ChainParams, Network};
pub use rewards::proof_of_stake_reward;

/// 32-byte hash, little-endian on the wire.
pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];
