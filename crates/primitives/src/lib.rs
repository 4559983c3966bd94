//! Core transaction/block types and consensus serialization.

pub mod address;
pub mod block;
pub mod encoding;
pub mod hash;
pub mod merkle;
pub mod outpoint;
pub mod stealth;
pub mod transaction;

pub use address::{
    address_to_script_pubkey, script_pubkey_to_address, secret_key_to_wif, wif_to_secret_key,
    AddressError,
};
pub use block::{Block, BlockHeader};
pub use hash::{hash160, sha256, sha256d};
pub use merkle::{merkle_branch, merkle_root_from_branch};
pub use outpoint::OutPoint;
pub use stealth::{StealthAddress, StealthAddressError};
pub use transaction::{Transaction, TxIn, TxOut};
