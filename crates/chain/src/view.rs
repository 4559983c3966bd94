//! Block and transaction index backed by the storage trait.

use umbra_consensus::{Hash256, ZERO_HASH};
use umbra_primitives::block::{Block, BlockHeader};
use umbra_primitives::encoding::{
    decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder,
};
use umbra_primitives::outpoint::OutPoint;
use umbra_primitives::transaction::Transaction;
use umbra_storage::{Column, KeyValueStore, StoreError, WriteBatch};

const META_BEST_HEIGHT: &[u8] = b"best_height";
const META_BEST_HASH: &[u8] = b"best_hash";

#[derive(Debug)]
pub enum ChainError {
    Store(StoreError),
    Decode(DecodeError),
    UnknownBlock,
    NotOnTip,
    EmptyChain,
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Store(err) => write!(f, "{err}"),
            ChainError::Decode(err) => write!(f, "{err}"),
            ChainError::UnknownBlock => write!(f, "unknown block"),
            ChainError::NotOnTip => write!(f, "block does not extend the tip"),
            ChainError::EmptyChain => write!(f, "chain has no blocks"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Store(err)
    }
}

impl From<DecodeError> for ChainError {
    fn from(err: DecodeError) -> Self {
        ChainError::Decode(err)
    }
}

/// The authoritative record for one indexed transaction: where it sits and
/// which of its outputs have been consumed by main-chain transactions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIndexEntry {
    pub block_hash: Hash256,
    pub height: i32,
    pub index_in_block: u32,
    /// Spending txid per output; `ZERO_HASH` marks unspent.
    pub spent_by: Vec<Hash256>,
}

impl TxIndexEntry {
    pub fn is_output_spent(&self, index: usize) -> bool {
        self.spent_by
            .get(index)
            .map(|spender| *spender != ZERO_HASH)
            .unwrap_or(false)
    }
}

impl Encodable for TxIndexEntry {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.block_hash);
        encoder.write_i32_le(self.height);
        encoder.write_u32_le(self.index_in_block);
        encoder.write_compact_size(self.spent_by.len() as u64);
        for spender in &self.spent_by {
            encoder.write_hash(spender);
        }
    }
}

impl Decodable for TxIndexEntry {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let block_hash = decoder.read_hash()?;
        let height = decoder.read_i32_le()?;
        let index_in_block = decoder.read_u32_le()?;
        let count = decoder.read_compact_size()? as usize;
        let mut spent_by = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            spent_by.push(decoder.read_hash()?);
        }
        Ok(Self {
            block_hash,
            height,
            index_in_block,
            spent_by,
        })
    }
}

struct IndexedBlock {
    hash: Hash256,
    height: i32,
    transactions: Vec<Hash256>,
}

impl Encodable for IndexedBlock {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.hash);
        encoder.write_i32_le(self.height);
        encoder.write_compact_size(self.transactions.len() as u64);
        for txid in &self.transactions {
            encoder.write_hash(txid);
        }
    }
}

impl Decodable for IndexedBlock {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let hash = decoder.read_hash()?;
        let height = decoder.read_i32_le()?;
        let count = decoder.read_compact_size()? as usize;
        let mut transactions = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            transactions.push(decoder.read_hash()?);
        }
        Ok(Self {
            hash,
            height,
            transactions,
        })
    }
}

pub struct ChainView<S> {
    store: S,
}

impl<S: KeyValueStore> ChainView<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn best_height(&self) -> Result<i32, ChainError> {
        match self.store.get(Column::Meta, META_BEST_HEIGHT)? {
            Some(bytes) if bytes.len() == 4 => {
                Ok(i32::from_le_bytes(bytes.try_into().expect("length")))
            }
            _ => Ok(-1),
        }
    }

    pub fn best_block_hash(&self) -> Result<Hash256, ChainError> {
        match self.store.get(Column::Meta, META_BEST_HASH)? {
            Some(bytes) if bytes.len() == 32 => {
                Ok(bytes.try_into().expect("length"))
            }
            _ => Ok(ZERO_HASH),
        }
    }

    pub fn block_hash_at(&self, height: i32) -> Result<Option<Hash256>, ChainError> {
        if height < 0 {
            return Ok(None);
        }
        match self.store.get(Column::BlockIndex, &height.to_be_bytes())? {
            Some(bytes) => {
                let indexed: IndexedBlock = decode(&bytes)?;
                Ok(Some(indexed.hash))
            }
            None => Ok(None),
        }
    }

    pub fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        match self.store.get(Column::BlockData, hash)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn block_header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, ChainError> {
        Ok(self.read_block(hash)?.map(|block| block.header))
    }

    /// Height of a main-chain block. The height is carried on the block's
    /// tx index entries; read it off the first one.
    pub fn height_of(&self, hash: &Hash256) -> Result<Option<i32>, ChainError> {
        let Some(block) = self.read_block(hash)? else {
            return Ok(None);
        };
        let txid = block.transactions[0].txid();
        Ok(self.tx_entry(&txid)?.map(|entry| entry.height))
    }

    /// Depth of a block below the tip: 1 for the tip itself, 0 for unknown.
    pub fn depth_of_block(&self, hash: &Hash256) -> Result<i32, ChainError> {
        let Some(height) = self.height_of(hash)? else {
            return Ok(0);
        };
        Ok(self.best_height()? - height + 1)
    }

    pub fn tx_entry(&self, txid: &Hash256) -> Result<Option<TxIndexEntry>, ChainError> {
        match self.store.get(Column::TxIndex, txid)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch an indexed transaction along with its containing block hash.
    pub fn get_transaction(
        &self,
        txid: &Hash256,
    ) -> Result<Option<(Transaction, Hash256)>, ChainError> {
        let Some(entry) = self.tx_entry(txid)? else {
            return Ok(None);
        };
        let Some(block) = self.read_block(&entry.block_hash)? else {
            return Ok(None);
        };
        let tx = block
            .transactions
            .get(entry.index_in_block as usize)
            .cloned()
            .ok_or(ChainError::UnknownBlock)?;
        Ok(Some((tx, entry.block_hash)))
    }

    /// Append a block at the tip, index its transactions, and mark spends.
    pub fn connect_block(&self, block: &Block) -> Result<i32, ChainError> {
        let best_height = self.best_height()?;
        let best_hash = self.best_block_hash()?;
        if best_height >= 0 && block.header.prev_block != best_hash {
            return Err(ChainError::NotOnTip);
        }
        let height = best_height + 1;
        let hash = block.hash();
        let txids = block.txids();

        let mut batch = WriteBatch::new();
        batch.put(Column::BlockData, hash, encode(block));
        batch.put(
            Column::BlockIndex,
            height.to_be_bytes(),
            encode(&IndexedBlock {
                hash,
                height,
                transactions: txids.clone(),
            }),
        );
        // Fresh entries for this block's transactions, kept in memory so
        // same-block spends mark correctly.
        let mut fresh: std::collections::HashMap<Hash256, TxIndexEntry> = block
            .transactions
            .iter()
            .enumerate()
            .map(|(index, tx)| {
                (
                    txids[index],
                    TxIndexEntry {
                        block_hash: hash,
                        height,
                        index_in_block: index as u32,
                        spent_by: vec![ZERO_HASH; tx.vout.len()],
                    },
                )
            })
            .collect();
        // Mark consumed outputs on their source entries.
        for (index, tx) in block.transactions.iter().enumerate() {
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.vin {
                let n = input.prevout.index as usize;
                if let Some(entry) = fresh.get_mut(&input.prevout.hash) {
                    if n < entry.spent_by.len() {
                        entry.spent_by[n] = txids[index];
                    }
                } else if let Some(mut entry) = self.tx_entry(&input.prevout.hash)? {
                    if n < entry.spent_by.len() {
                        entry.spent_by[n] = txids[index];
                        batch.put(Column::TxIndex, input.prevout.hash, encode(&entry));
                    }
                }
            }
        }
        for (txid, entry) in &fresh {
            batch.put(Column::TxIndex, *txid, encode(entry));
        }
        batch.put(Column::Meta, META_BEST_HEIGHT.to_vec(), height.to_le_bytes());
        batch.put(Column::Meta, META_BEST_HASH.to_vec(), hash);
        self.store.write_batch(&batch)?;
        umbra_log::log_debug!("connected block {height} with {} txs", block.transactions.len());
        Ok(height)
    }

    /// Detach the tip block: drop its index entries and unmark the spends it
    /// made. Used by reorg handling (and by tests orphaning a coinstake).
    pub fn disconnect_tip(&self) -> Result<Block, ChainError> {
        let best_height = self.best_height()?;
        if best_height < 0 {
            return Err(ChainError::EmptyChain);
        }
        let hash = self.best_block_hash()?;
        let block = self.read_block(&hash)?.ok_or(ChainError::UnknownBlock)?;
        let txids = block.txids();

        let mut batch = WriteBatch::new();
        for txid in &txids {
            batch.delete(Column::TxIndex, *txid);
        }
        for tx in &block.transactions {
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.vin {
                if txids.contains(&input.prevout.hash) {
                    continue;
                }
                if let Some(mut entry) = self.tx_entry(&input.prevout.hash)? {
                    let n = input.prevout.index as usize;
                    if n < entry.spent_by.len() {
                        entry.spent_by[n] = ZERO_HASH;
                        batch.put(Column::TxIndex, input.prevout.hash, encode(&entry));
                    }
                }
            }
        }
        batch.delete(Column::BlockIndex, best_height.to_be_bytes());
        batch.delete(Column::BlockData, hash);

        let new_height = best_height - 1;
        batch.put(
            Column::Meta,
            META_BEST_HEIGHT.to_vec(),
            new_height.to_le_bytes(),
        );
        let new_hash = if new_height >= 0 {
            block.header.prev_block
        } else {
            ZERO_HASH
        };
        batch.put(Column::Meta, META_BEST_HASH.to_vec(), new_hash);
        self.store.write_batch(&batch)?;
        umbra_log::log_info!("disconnected tip at height {best_height}");
        Ok(block)
    }

    /// Look up the output an input spends, wherever it is indexed.
    pub fn prevout(&self, outpoint: &OutPoint) -> Result<Option<umbra_primitives::TxOut>, ChainError> {
        let Some((tx, _)) = self.get_transaction(&outpoint.hash)? else {
            return Ok(None);
        };
        Ok(tx.vout.get(outpoint.index as usize).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_primitives::transaction::{TxIn, TxOut};
    use umbra_storage::memory::MemoryStore;

    fn coinbase(value: i64, tag: u8) -> Transaction {
        let mut tx = Transaction::new(tag as u32);
        tx.vin.push(TxIn::from_outpoint(OutPoint::null()));
        tx.vout.push(TxOut::new(value, vec![tag]));
        tx
    }

    fn block_on(prev: Hash256, time: u32, transactions: Vec<Transaction>) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_block: prev,
                merkle_root: [0u8; 32],
                time,
                bits: 0x2100_ffff,
                nonce: 0,
            },
            transactions,
        }
    }

    #[test]
    fn connect_and_spend_tracking() {
        let view = ChainView::new(MemoryStore::new());
        let cb = coinbase(50, 1);
        let cb_txid = cb.txid();
        let b0 = block_on(ZERO_HASH, 100, vec![cb.clone()]);
        assert_eq!(view.connect_block(&b0).expect("connect"), 0);

        let mut spend = Transaction::new(200);
        spend
            .vin
            .push(TxIn::from_outpoint(OutPoint::new(cb_txid, 0)));
        spend.vout.push(TxOut::new(49, vec![2]));
        let spend_txid = spend.txid();
        let b1 = block_on(b0.hash(), 200, vec![coinbase(50, 2), spend]);
        assert_eq!(view.connect_block(&b1).expect("connect"), 1);

        let entry = view.tx_entry(&cb_txid).expect("entry").expect("some");
        assert!(entry.is_output_spent(0));
        assert_eq!(entry.spent_by[0], spend_txid);
        assert_eq!(view.best_height().expect("height"), 1);
        assert_eq!(view.depth_of_block(&b0.hash()).expect("depth"), 2);
    }

    #[test]
    fn disconnect_unmarks_spends() {
        let view = ChainView::new(MemoryStore::new());
        let cb = coinbase(50, 1);
        let cb_txid = cb.txid();
        let b0 = block_on(ZERO_HASH, 100, vec![cb]);
        view.connect_block(&b0).expect("connect");

        let mut spend = Transaction::new(200);
        spend
            .vin
            .push(TxIn::from_outpoint(OutPoint::new(cb_txid, 0)));
        spend.vout.push(TxOut::new(49, vec![2]));
        let b1 = block_on(b0.hash(), 200, vec![coinbase(50, 2), spend]);
        view.connect_block(&b1).expect("connect");

        view.disconnect_tip().expect("disconnect");
        let entry = view.tx_entry(&cb_txid).expect("entry").expect("some");
        assert!(!entry.is_output_spent(0));
        assert_eq!(view.best_height().expect("height"), 0);
        assert_eq!(view.best_block_hash().expect("hash"), b0.hash());
    }

    #[test]
    fn rejects_block_off_tip() {
        let view = ChainView::new(MemoryStore::new());
        let b0 = block_on(ZERO_HASH, 100, vec![coinbase(50, 1)]);
        view.connect_block(&b0).expect("connect");
        let stray = block_on([9u8; 32], 200, vec![coinbase(50, 2)]);
        assert!(matches!(
            view.connect_block(&stray),
            Err(ChainError::NotOnTip)
        ));
    }
}
