//! Script construction, classification, signature hashing, and the stake
//! kernel check.

pub mod kernel;
pub mod message;
mod secp;
pub mod sighash;
pub mod signer;
pub mod standard;

pub use kernel::{check_stake_kernel_hash, compact_to_u256, stake_kernel_hash, KernelError};
pub use signer::{combine_multisig_signatures, sign_input, verify_input, SignError, SigningKeys};
pub use standard::{classify_script_pubkey, extract_destination, ScriptDestination, ScriptType};
