//! Minimal mempool: standalone checks, input availability, double-spend
//! rejection, and a fee floor. Enough for the wallet's commit/resend paths.

use std::collections::{HashMap, HashSet};

use umbra_consensus::{Amount, Hash256, MIN_TX_FEE};
use umbra_primitives::outpoint::OutPoint;
use umbra_primitives::transaction::{Transaction, TransactionCheckError};
use umbra_storage::KeyValueStore;

use crate::view::{ChainError, ChainView};

#[derive(Debug)]
pub enum MempoolError {
    Check(TransactionCheckError),
    Chain(ChainError),
    AlreadyInPool,
    AlreadyInBlock,
    MissingInputs(Vec<OutPoint>),
    InputsSpent,
    ValueOutOfRange,
    InsufficientFee { fee: Amount, required: Amount },
    Coinstake,
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MempoolError::Check(err) => write!(f, "{err}"),
            MempoolError::Chain(err) => write!(f, "{err}"),
            MempoolError::AlreadyInPool => write!(f, "transaction already in mempool"),
            MempoolError::AlreadyInBlock => write!(f, "transaction already in a block"),
            MempoolError::MissingInputs(missing) => {
                write!(f, "missing {} input(s)", missing.len())
            }
            MempoolError::InputsSpent => write!(f, "inputs already spent"),
            MempoolError::ValueOutOfRange => write!(f, "input value below output value"),
            MempoolError::InsufficientFee { fee, required } => {
                write!(f, "fee {fee} below required {required}")
            }
            MempoolError::Coinstake => write!(f, "coinstake cannot enter the mempool"),
        }
    }
}

impl std::error::Error for MempoolError {}

impl From<TransactionCheckError> for MempoolError {
    fn from(err: TransactionCheckError) -> Self {
        MempoolError::Check(err)
    }
}

impl From<ChainError> for MempoolError {
    fn from(err: ChainError) -> Self {
        MempoolError::Chain(err)
    }
}

#[derive(Default)]
pub struct Mempool {
    transactions: HashMap<Hash256, Transaction>,
    spent: HashSet<OutPoint>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.transactions.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&Transaction> {
        self.transactions.get(txid)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.keys().copied().collect()
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent.contains(outpoint)
    }

    /// Validate against the chain view and admit. Coinbase/coinstake never
    /// relay; they only arrive in blocks.
    pub fn accept<S: KeyValueStore>(
        &mut self,
        chain: &ChainView<S>,
        tx: &Transaction,
    ) -> Result<Hash256, MempoolError> {
        let txid = tx.txid();
        if self.contains(&txid) {
            return Err(MempoolError::AlreadyInPool);
        }
        if chain.tx_entry(&txid)?.is_some() {
            return Err(MempoolError::AlreadyInBlock);
        }
        tx.check()?;
        if tx.is_coinbase() || tx.is_coinstake() {
            return Err(MempoolError::Coinstake);
        }

        let mut value_in: Amount = 0;
        let mut missing = Vec::new();
        for input in &tx.vin {
            if self.spent.contains(&input.prevout) {
                return Err(MempoolError::InputsSpent);
            }
            // Pool parents first, then the chain index.
            let prev_out = match self.transactions.get(&input.prevout.hash) {
                Some(parent) => parent.vout.get(input.prevout.index as usize).cloned(),
                None => {
                    let entry = chain.tx_entry(&input.prevout.hash)?;
                    match entry {
                        Some(entry) if entry.is_output_spent(input.prevout.index as usize) => {
                            return Err(MempoolError::InputsSpent);
                        }
                        Some(_) => chain.prevout(&input.prevout)?,
                        None => None,
                    }
                }
            };
            match prev_out {
                Some(out) => value_in += out.value,
                None => missing.push(input.prevout),
            }
        }
        if !missing.is_empty() {
            return Err(MempoolError::MissingInputs(missing));
        }

        let value_out = tx.value_out();
        if value_in < value_out {
            return Err(MempoolError::ValueOutOfRange);
        }
        let fee = value_in - value_out;
        let required = required_fee(tx.serialized_size());
        if fee < required {
            return Err(MempoolError::InsufficientFee { fee, required });
        }

        for input in &tx.vin {
            self.spent.insert(input.prevout);
        }
        self.transactions.insert(txid, tx.clone());
        umbra_log::log_debug!("mempool accepted {}", hex_prefix(&txid));
        Ok(txid)
    }

    /// Drop a transaction, e.g. once it is seen in a connected block.
    pub fn remove(&mut self, txid: &Hash256) -> Option<Transaction> {
        let tx = self.transactions.remove(txid)?;
        for input in &tx.vin {
            self.spent.remove(&input.prevout);
        }
        Some(tx)
    }
}

/// Relay fee floor: one increment plus one per started kilobyte.
pub fn required_fee(bytes: usize) -> Amount {
    MIN_TX_FEE * (1 + bytes as Amount / 1000)
}

fn hex_prefix(hash: &Hash256) -> String {
    hash.iter()
        .take(5)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_consensus::ZERO_HASH;
    use umbra_primitives::block::{Block, BlockHeader};
    use umbra_primitives::transaction::{TxIn, TxOut};
    use umbra_storage::memory::MemoryStore;

    fn funded_chain() -> (ChainView<MemoryStore>, Hash256) {
        let view = ChainView::new(MemoryStore::new());
        let mut cb = Transaction::new(1);
        cb.vin.push(TxIn::from_outpoint(OutPoint::null()));
        cb.vout.push(TxOut::new(10_000_000, vec![1]));
        let txid = cb.txid();
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_block: ZERO_HASH,
                merkle_root: [0u8; 32],
                time: 100,
                bits: 0x2100_ffff,
                nonce: 0,
            },
            transactions: vec![cb],
        };
        view.connect_block(&block).expect("connect");
        (view, txid)
    }

    fn spend(prev: Hash256, value: i64) -> Transaction {
        let mut tx = Transaction::new(50);
        tx.vin.push(TxIn::from_outpoint(OutPoint::new(prev, 0)));
        tx.vout.push(TxOut::new(value, vec![2]));
        tx
    }

    #[test]
    fn accepts_well_formed_spend() {
        let (view, funding) = funded_chain();
        let mut pool = Mempool::new();
        let tx = spend(funding, 9_000_000);
        pool.accept(&view, &tx).expect("accept");
        assert!(pool.contains(&tx.txid()));
    }

    #[test]
    fn rejects_double_spend_in_pool() {
        let (view, funding) = funded_chain();
        let mut pool = Mempool::new();
        pool.accept(&view, &spend(funding, 9_000_000)).expect("accept");
        let err = pool.accept(&view, &spend(funding, 8_000_000)).unwrap_err();
        assert!(matches!(err, MempoolError::InputsSpent));
    }

    #[test]
    fn rejects_missing_inputs() {
        let (view, _) = funded_chain();
        let mut pool = Mempool::new();
        let err = pool.accept(&view, &spend([9u8; 32], 1_000)).unwrap_err();
        assert!(matches!(err, MempoolError::MissingInputs(_)));
    }

    #[test]
    fn rejects_underpaying_fee() {
        let (view, funding) = funded_chain();
        let mut pool = Mempool::new();
        let err = pool.accept(&view, &spend(funding, 10_000_000)).unwrap_err();
        assert!(matches!(err, MempoolError::InsufficientFee { .. }));
    }

    #[test]
    fn remove_releases_inputs() {
        let (view, funding) = funded_chain();
        let mut pool = Mempool::new();
        let tx = spend(funding, 9_000_000);
        let txid = pool.accept(&view, &tx).expect("accept");
        pool.remove(&txid);
        pool.accept(&view, &spend(funding, 9_000_000)).expect("re-accept");
    }
}
