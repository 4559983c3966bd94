//! Wallet error taxonomy.
//!
//! `Corrupted` and `CommitRejected` are the fatal class: the caller should
//! stop the process after surfacing them. Everything else is recoverable or
//! user-facing.

use umbra_chain::{ChainError, MempoolError};
use umbra_primitives::encoding::DecodeError;
use umbra_script::SignError;
use umbra_storage::StoreError;

#[derive(Debug)]
pub enum WalletError {
    Store(StoreError),
    Decode(DecodeError),
    Chain(ChainError),
    Sign(SignError),
    /// Wallet records contradict themselves (keypool entry without a key,
    /// unreadable pool record). Fatal.
    Corrupted(&'static str),
    /// The mempool rejected a transaction the wallet already committed.
    /// Fatal: wallet and pool now disagree.
    CommitRejected(MempoolError),
    WalletLocked,
    UnlockedForStakingOnly,
    WalletNotEncrypted,
    WalletAlreadyEncrypted,
    IncorrectPassphrase,
    InvalidAddress,
    InvalidAmount,
    InsufficientFunds,
    SelectionFailed,
    TransactionTooLarge,
    NarrationTooLong,
    InvalidSecretKey,
    UnknownKey,
    NotMine,
    KeypoolExhausted,
    /// Another mix instance is still active.
    MixInProgress,
    /// A mix peer misbehaved or a protocol precondition failed; the state
    /// machine stays where it was.
    MixProtocol(&'static str),
}

impl std::fmt::Display for WalletError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalletError::Store(err) => write!(f, "{err}"),
            WalletError::Decode(err) => write!(f, "{err}"),
            WalletError::Chain(err) => write!(f, "{err}"),
            WalletError::Sign(err) => write!(f, "{err}"),
            WalletError::Corrupted(what) => write!(f, "wallet corrupted: {what}"),
            WalletError::CommitRejected(err) => {
                write!(f, "committed transaction rejected by mempool: {err}")
            }
            WalletError::WalletLocked => write!(f, "wallet is locked"),
            WalletError::UnlockedForStakingOnly => {
                write!(f, "wallet is unlocked for staking only")
            }
            WalletError::WalletNotEncrypted => write!(f, "wallet is not encrypted"),
            WalletError::WalletAlreadyEncrypted => write!(f, "wallet is already encrypted"),
            WalletError::IncorrectPassphrase => write!(f, "incorrect wallet passphrase"),
            WalletError::InvalidAddress => write!(f, "invalid address"),
            WalletError::InvalidAmount => write!(f, "invalid amount"),
            WalletError::InsufficientFunds => write!(f, "insufficient funds"),
            WalletError::SelectionFailed => write!(f, "coin selection failed"),
            WalletError::TransactionTooLarge => write!(f, "transaction too large"),
            WalletError::NarrationTooLong => {
                write!(f, "narration must be 24 characters or less")
            }
            WalletError::InvalidSecretKey => write!(f, "invalid secret key"),
            WalletError::UnknownKey => write!(f, "key not found in wallet"),
            WalletError::NotMine => write!(f, "address is not owned by this wallet"),
            WalletError::KeypoolExhausted => write!(f, "keypool ran out of keys"),
            WalletError::MixInProgress => {
                write!(f, "another anonymous transaction is in progress")
            }
            WalletError::MixProtocol(what) => write!(f, "mix protocol: {what}"),
        }
    }
}

impl std::error::Error for WalletError {}

impl From<StoreError> for WalletError {
    fn from(err: StoreError) -> Self {
        WalletError::Store(err)
    }
}

impl From<DecodeError> for WalletError {
    fn from(err: DecodeError) -> Self {
        WalletError::Decode(err)
    }
}

impl From<ChainError> for WalletError {
    fn from(err: ChainError) -> Self {
        WalletError::Chain(err)
    }
}

impl From<SignError> for WalletError {
    fn from(err: SignError) -> Self {
        WalletError::Sign(err)
    }
}

impl WalletError {
    /// The §7 InvariantViolation class.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WalletError::Corrupted(_) | WalletError::CommitRejected(_))
    }
}
