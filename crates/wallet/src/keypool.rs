//! The pool of pre-generated receive/change keys and the scoped reservation
//! handle.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use secp256k1::PublicKey;
use umbra_primitives::hash::hash160;
use umbra_storage::KeyValueStore;

use crate::db::{PoolRecord, WalletDb};
use crate::error::WalletError;
use crate::keystore::KeyStore;
use crate::current_unix_seconds;

pub const DEFAULT_KEYPOOL_SIZE: usize = 100;

/// Pool indices a dropped [`ReservedKey`] still owes back. Drained on the
/// next reservation; the drop handler itself only queues.
type ReturnQueue = Arc<Mutex<Vec<i64>>>;

pub struct KeyPool {
    indices: BTreeSet<i64>,
    pending_returns: ReturnQueue,
    pub target_size: usize,
}

impl Default for KeyPool {
    fn default() -> Self {
        Self::new(DEFAULT_KEYPOOL_SIZE)
    }
}

impl KeyPool {
    pub fn new(target_size: usize) -> Self {
        Self {
            indices: BTreeSet::new(),
            pending_returns: Arc::new(Mutex::new(Vec::new())),
            target_size,
        }
    }

    pub fn load<S: KeyValueStore>(&mut self, db: &WalletDb<S>) -> Result<(), WalletError> {
        for index in db.load_pool_indices()? {
            self.indices.insert(index);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    fn drain_returns(&mut self) {
        let mut queue = self.pending_returns.lock().expect("return queue lock");
        for index in queue.drain(..) {
            self.indices.insert(index);
        }
    }

    /// Discard the pool and refill with fresh keys. Run after encryption so
    /// no pre-encryption key is ever handed out.
    pub fn reset<S: KeyValueStore>(
        &mut self,
        db: &WalletDb<S>,
        keystore: &mut KeyStore,
    ) -> Result<(), WalletError> {
        self.drain_returns();
        for index in std::mem::take(&mut self.indices) {
            db.erase_pool(index)?;
        }
        if keystore.is_locked() {
            return Err(WalletError::WalletLocked);
        }
        self.top_up(db, keystore)?;
        umbra_log::log_info!("keypool reset with {} keys", self.indices.len());
        Ok(())
    }

    /// Grow the pool back to its target size. A locked wallet cannot mint
    /// keys, so this silently does nothing then.
    pub fn top_up<S: KeyValueStore>(
        &mut self,
        db: &WalletDb<S>,
        keystore: &mut KeyStore,
    ) -> Result<(), WalletError> {
        self.drain_returns();
        if keystore.is_locked() {
            return Ok(());
        }
        while self.indices.len() < self.target_size {
            let next = self.indices.iter().next_back().map(|last| last + 1).unwrap_or(1);
            let pubkey = keystore.generate_key(db, true)?;
            db.write_pool(
                next,
                &PoolRecord {
                    pubkey: pubkey.serialize().to_vec(),
                    created_at: current_unix_seconds(),
                },
            )?;
            self.indices.insert(next);
            umbra_log::log_debug!("keypool added key {next}, size={}", self.indices.len());
        }
        Ok(())
    }

    /// Take the oldest pool key. The handle must be resolved with
    /// [`KeyPool::keep`] or [`KeyPool::release`]; dropping it queues the
    /// index for return.
    pub fn reserve<S: KeyValueStore>(
        &mut self,
        db: &WalletDb<S>,
        keystore: &mut KeyStore,
    ) -> Result<ReservedKey, WalletError> {
        self.drain_returns();
        if !keystore.is_locked() {
            self.top_up(db, keystore)?;
        }
        let Some(index) = self.indices.iter().next().copied() else {
            return Err(WalletError::KeypoolExhausted);
        };
        self.indices.remove(&index);
        let record = db
            .read_pool(index)?
            .ok_or(WalletError::Corrupted("keypool index without record"))?;
        let pubkey = PublicKey::from_slice(&record.pubkey)
            .map_err(|_| WalletError::Corrupted("keypool record with invalid pubkey"))?;
        if !keystore.have_key(&hash160(&record.pubkey)) {
            return Err(WalletError::Corrupted("keypool key unknown to key store"));
        }
        umbra_log::log_debug!("keypool reserve {index}");
        Ok(ReservedKey {
            index: Some(index),
            pubkey,
            returns: Arc::clone(&self.pending_returns),
        })
    }

    /// Commit a reservation: the key leaves the pool for good.
    pub fn keep<S: KeyValueStore>(
        &mut self,
        db: &WalletDb<S>,
        reserved: ReservedKey,
    ) -> Result<(), WalletError> {
        if let Some(index) = reserved.consume() {
            db.erase_pool(index)?;
            umbra_log::log_debug!("keypool keep {index}");
        }
        Ok(())
    }

    /// Hand a reservation straight back.
    pub fn release(&mut self, reserved: ReservedKey) {
        if let Some(index) = reserved.consume() {
            self.indices.insert(index);
            umbra_log::log_debug!("keypool return {index}");
        }
    }

    /// Stage current pool records into `batch` for the wallet rewrite.
    pub(crate) fn persist_records<S: KeyValueStore>(
        &self,
        db: &WalletDb<S>,
        batch: &mut umbra_storage::WriteBatch,
    ) -> Result<(), WalletError> {
        use umbra_primitives::encoding::encode;
        for index in &self.indices {
            let record = db
                .read_pool(*index)?
                .ok_or(WalletError::Corrupted("keypool index without record"))?;
            batch.put(
                umbra_storage::Column::Pool,
                index.to_be_bytes(),
                encode(&record),
            );
        }
        Ok(())
    }

    /// Creation time of the oldest pooled key, as a staleness signal.
    pub fn oldest_key_time<S: KeyValueStore>(
        &self,
        db: &WalletDb<S>,
    ) -> Result<Option<i64>, WalletError> {
        let Some(index) = self.indices.iter().next() else {
            return Ok(None);
        };
        Ok(db.read_pool(*index)?.map(|record| record.created_at))
    }
}

/// A key taken from the pool but not yet committed. Three outcomes: kept
/// (index consumed), released (index immediately reusable), or dropped
/// (index queued for reuse at the next pool operation).
#[derive(Debug)]
pub struct ReservedKey {
    index: Option<i64>,
    pubkey: PublicKey,
    returns: ReturnQueue,
}

impl ReservedKey {
    pub fn pubkey(&self) -> PublicKey {
        self.pubkey
    }

    fn consume(mut self) -> Option<i64> {
        self.index.take()
    }
}

impl Drop for ReservedKey {
    fn drop(&mut self) {
        if let Some(index) = self.index.take() {
            if let Ok(mut queue) = self.returns.lock() {
                queue.push(index);
            }
        }
    }
}
