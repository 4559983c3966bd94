//! Proof-of-stake kernel hashing and compact-bits target math.

use primitive_types::U256;
use umbra_consensus::{Amount, Hash256, COIN};
use umbra_primitives::block::BlockHeader;
use umbra_primitives::encoding::Encoder;
use umbra_primitives::hash::sha256d;
use umbra_primitives::outpoint::OutPoint;
use umbra_primitives::transaction::Transaction;

#[derive(Debug, Eq, PartialEq)]
pub enum KernelError {
    NegativeBits,
    Overflow,
}

impl std::fmt::Display for KernelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelError::NegativeBits => write!(f, "compact target has sign bit set"),
            KernelError::Overflow => write!(f, "compact target overflows 256 bits"),
        }
    }
}

impl std::error::Error for KernelError {}

/// Expand a compact difficulty encoding into a full 256-bit target.
pub fn compact_to_u256(bits: u32) -> Result<U256, KernelError> {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;
    if (bits & 0x0080_0000) != 0 {
        return Err(KernelError::NegativeBits);
    }
    let value = if exponent <= 3 {
        U256::from(mantissa >> (8 * (3 - exponent)))
    } else {
        let shift = 8 * (exponent - 3);
        if shift >= 256 {
            return Err(KernelError::Overflow);
        }
        let shifted = U256::from(mantissa) << shift;
        if (shifted >> shift) != U256::from(mantissa) {
            return Err(KernelError::Overflow);
        }
        shifted
    };
    Ok(value)
}

/// The kernel digest. Commits to the staked output's containing block time,
/// its byte offset inside that block, the staked transaction's own time, the
/// outpoint, and the attempted spend time, so one output yields exactly one
/// try per second.
pub fn stake_kernel_hash(
    block_header: &BlockHeader,
    tx_offset: u32,
    prev_tx: &Transaction,
    prevout: &OutPoint,
    spend_time: u32,
) -> Hash256 {
    let mut encoder = Encoder::new();
    encoder.write_u32_le(block_header.time);
    encoder.write_u32_le(tx_offset);
    encoder.write_u32_le(prev_tx.time);
    encoder.write_hash(&prevout.hash);
    encoder.write_u32_le(prevout.index);
    encoder.write_u32_le(spend_time);
    sha256d(&encoder.into_inner())
}

/// Check whether the kernel hash falls under the per-coin-day target.
/// Returns the hash so callers can log the near-misses.
#[allow(clippy::too_many_arguments)]
pub fn check_stake_kernel_hash(
    bits: u32,
    block_header: &BlockHeader,
    tx_offset: u32,
    prev_tx: &Transaction,
    prevout: &OutPoint,
    spend_time: u32,
    coin_day_weight: u64,
) -> Result<(bool, Hash256), KernelError> {
    let target_per_coin_day = compact_to_u256(bits)?;
    let (target, overflow) = target_per_coin_day.overflowing_mul(U256::from(coin_day_weight));
    if overflow {
        return Err(KernelError::Overflow);
    }
    let hash = stake_kernel_hash(block_header, tx_offset, prev_tx, prevout, spend_time);
    let hash_value = U256::from_little_endian(&hash);
    Ok((hash_value <= target, hash))
}

/// Coin-day weight of an output: value × bounded age / COIN / 86400.
pub fn coin_day_weight(value: Amount, time_weight: i64) -> u64 {
    if value <= 0 || time_weight <= 0 {
        return 0;
    }
    let weight = U256::from(value as u64) * U256::from(time_weight as u64)
        / U256::from(COIN as u64)
        / U256::from(86_400u64);
    weight.low_u64()
}
