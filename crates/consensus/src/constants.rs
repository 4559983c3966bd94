//! Consensus-wide constants shared across wallet and chain code.

use crate::money::{Amount, CENT, COIN};

/// The maximum size of a block the generator will produce, in bytes.
/// The transaction builder refuses anything at or above a fifth of this.
pub const MAX_BLOCK_SIZE_GEN: usize = 1_000_000;

/// Current network protocol version for wire messages.
pub const PROTOCOL_VERSION: i32 = 60_016;

/// Message magic used for `sign_message`/`verify_message` style signatures.
pub const SIGNED_MESSAGE_MAGIC: &str = "Umbra Signed Message:\n";

/// Outputs of a coin-generating transaction spendable after this many blocks.
pub const COINBASE_MATURITY: i32 = 50;

/// Block timestamps can drift; rescans start this many seconds before the
/// oldest key's birth time.
pub const KEY_BIRTH_FUZZ: i64 = 7_200;

/// An output must sit unspent this long before it can stake.
pub const STAKE_MIN_AGE: i64 = 6 * 60 * 60;
/// Coin age stops accruing stake weight past this.
pub const STAKE_MAX_AGE: i64 = 30 * 24 * 60 * 60;
/// Kernels younger than this split the stake across two outputs.
pub const STAKE_SPLIT_AGE: i64 = 20 * 24 * 60 * 60;
/// The coinstake combiner stops gathering inputs past this total.
pub const STAKE_COMBINE_THRESHOLD: Amount = 100 * COIN;
/// Seconds searched backwards from the spend time for a kernel.
pub const MAX_STAKE_SEARCH_INTERVAL: i64 = 60;
/// Coinstake inputs are capped at this many.
pub const MAX_COINSTAKE_INPUTS: usize = 100;

/// Mix escrow fee: `base / MIX_FEE_DIVISOR`, floored at [`MIX_MIN_FEE`].
pub const MIX_FEE_DIVISOR: Amount = 100;
pub const MIX_MIN_FEE: Amount = CENT;
/// Reserved out of the paid fee to cover the distribution tx miner fee.
pub const MIX_DISTRIBUTION_TX_FEE: Amount = 5 * crate::money::MIN_TX_FEE;
/// Minimum spendable balance before a node may advertise mix service.
pub const MIN_ANON_SERVICE_COIN: Amount = 10 * COIN;
/// A mix instance idle this long before escrow is funded may be reset.
pub const MIX_RESET_TIMEOUT: i64 = 180;
/// The service directory holds at most this many advertised peers.
pub const MAX_SERVICE_LIST_SIZE: usize = 32;

/// The paid mix fee for a given base amount.
pub fn mix_paid_fee(base: Amount) -> Amount {
    let fee = base / MIX_FEE_DIVISOR;
    fee.max(MIX_MIN_FEE)
}

/// The per-service-party cut once the distribution miner fee is carved out.
pub fn mix_service_fee(base: Amount) -> Amount {
    (mix_paid_fee(base) - MIX_DISTRIBUTION_TX_FEE) / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paid_fee_floors_at_minimum() {
        assert_eq!(mix_paid_fee(10 * COIN), COIN / 10);
        assert_eq!(mix_paid_fee(CENT), MIX_MIN_FEE);
        assert_eq!(mix_paid_fee(0), MIX_MIN_FEE);
    }

    #[test]
    fn service_fee_splits_remainder() {
        let base = 10 * COIN;
        let paid = mix_paid_fee(base);
        assert_eq!(mix_service_fee(base), (paid - MIX_DISTRIBUTION_TX_FEE) / 2);
    }
}
