//! Key/value storage behind the wallet and chain view.
//!
//! Records live in typed columns; each column is one record family of the
//! wallet file (`key`, `ckey`, `mkey`, `pool`, …) or of the chain view the
//! wallet consults (`tx_index`, `block_data`, …).

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    // Wallet record families.
    Key,
    CryptedKey,
    MasterKey,
    KeyMeta,
    Pool,
    Name,
    Tx,
    Setting,
    DefaultKey,
    MinVersion,
    BestBlock,
    OrderPosNext,
    AccountEntry,
    StealthAddress,
    StealthKeyMeta,
    RedeemScript,
    Version,
    // Chain families the wallet consults.
    BlockIndex,
    BlockData,
    TxIndex,
    Meta,
}

impl Column {
    pub const ALL: [Column; 21] = [
        Column::Key,
        Column::CryptedKey,
        Column::MasterKey,
        Column::KeyMeta,
        Column::Pool,
        Column::Name,
        Column::Tx,
        Column::Setting,
        Column::DefaultKey,
        Column::MinVersion,
        Column::BestBlock,
        Column::OrderPosNext,
        Column::AccountEntry,
        Column::StealthAddress,
        Column::StealthKeyMeta,
        Column::RedeemScript,
        Column::Version,
        Column::BlockIndex,
        Column::BlockData,
        Column::TxIndex,
        Column::Meta,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Column::Key => "key",
            Column::CryptedKey => "ckey",
            Column::MasterKey => "mkey",
            Column::KeyMeta => "keymeta",
            Column::Pool => "pool",
            Column::Name => "name",
            Column::Tx => "tx",
            Column::Setting => "setting",
            Column::DefaultKey => "defaultkey",
            Column::MinVersion => "minversion",
            Column::BestBlock => "bestblock",
            Column::OrderPosNext => "orderposnext",
            Column::AccountEntry => "acentry",
            Column::StealthAddress => "sxaddr",
            Column::StealthKeyMeta => "sxkm",
            Column::RedeemScript => "cscript",
            Column::Version => "version",
            Column::BlockIndex => "block_index",
            Column::BlockData => "block_data",
            Column::TxIndex => "tx_index",
            Column::Meta => "meta",
        }
    }

    /// The families holding wallet state proper (purged and rewritten when
    /// the wallet file is rewritten after encryption).
    pub fn is_wallet_family(self) -> bool {
        !matches!(
            self,
            Column::BlockIndex | Column::BlockData | Column::TxIndex | Column::Meta
        )
    }
}

#[derive(Clone, Debug)]
pub struct WriteKey(SmallVec<[u8; 40]>);

impl WriteKey {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl AsRef<[u8]> for WriteKey {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for WriteKey {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl From<&[u8]> for WriteKey {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl<const N: usize> From<[u8; N]> for WriteKey {
    fn from(value: [u8; N]) -> Self {
        Self(SmallVec::from_slice(&value))
    }
}

impl<const N: usize> From<&[u8; N]> for WriteKey {
    fn from(value: &[u8; N]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

#[derive(Clone, Debug)]
pub struct WriteValue(SmallVec<[u8; 64]>);

impl WriteValue {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0.into_vec()
    }
}

impl AsRef<[u8]> for WriteValue {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for WriteValue {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl From<&[u8]> for WriteValue {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl<const N: usize> From<[u8; N]> for WriteValue {
    fn from(value: [u8; N]) -> Self {
        Self(SmallVec::from_slice(&value))
    }
}

#[derive(Clone, Debug)]
pub enum WriteOp {
    Put {
        column: Column,
        key: WriteKey,
        value: WriteValue,
    },
    Delete {
        column: Column,
        key: WriteKey,
    },
}

/// Batched writes applied atomically by the backend. The key-store
/// encryption path relies on this being all-or-nothing.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: Column, key: impl Into<WriteKey>, value: impl Into<WriteValue>) {
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<WriteKey>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError>;
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.as_ref().put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.as_ref().delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.as_ref().scan_prefix(column, prefix)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }
}
