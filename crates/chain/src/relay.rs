//! Relay seam. Network transport lives above this crate; the wallet only
//! needs somewhere to hand a transaction after mempool acceptance.

use std::sync::Mutex;

use umbra_consensus::Hash256;
use umbra_primitives::transaction::Transaction;

pub trait Relay: Send + Sync {
    fn relay_transaction(&self, tx: &Transaction);
}

/// Drops everything. For tools that build but do not broadcast.
#[derive(Default)]
pub struct NullRelay;

impl Relay for NullRelay {
    fn relay_transaction(&self, _tx: &Transaction) {}
}

/// Records relayed txids; the wallet tests assert on these.
#[derive(Default)]
pub struct RecordingRelay {
    relayed: Mutex<Vec<Hash256>>,
}

impl RecordingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relayed(&self) -> Vec<Hash256> {
        self.relayed.lock().expect("relay lock").clone()
    }
}

impl Relay for RecordingRelay {
    fn relay_transaction(&self, tx: &Transaction) {
        self.relayed.lock().expect("relay lock").push(tx.txid());
    }
}
