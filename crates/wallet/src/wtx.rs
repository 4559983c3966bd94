//! A transaction with wallet-local metadata.

use std::collections::BTreeMap;

use umbra_chain::ChainView;
use umbra_consensus::{ChainParams, Hash256, ZERO_HASH};
use umbra_primitives::block::Block;
use umbra_primitives::encoding::{
    read_vec, write_vec, Decodable, DecodeError, Decoder, Encodable, Encoder,
};
use umbra_primitives::merkle::merkle_branch;
use umbra_primitives::transaction::Transaction;
use umbra_storage::KeyValueStore;

use crate::error::WalletError;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalletTx {
    pub tx: Transaction,
    /// Containing block, zero while unconfirmed.
    pub hash_block: Hash256,
    pub merkle_branch: Vec<Hash256>,
    /// Position in the containing block; -1 while unconfirmed.
    pub index_in_block: i32,
    /// One bit per output: whether this wallet believes it has been spent.
    pub spent_bits: Vec<bool>,
    pub time_received: i64,
    /// Best-guess chronological time; see `Wallet::compute_smart_time`.
    pub time_smart: i64,
    /// Strictly increasing insertion counter across all wallet events.
    pub order_pos: i64,
    pub from_me: bool,
    /// Free-form metadata (narrations keyed `n_<vout>`, user memos).
    pub map_value: BTreeMap<String, String>,
    /// Supporting transactions shipped alongside for relay.
    pub vtx_prev: Vec<Transaction>,
}

impl WalletTx {
    pub fn new(tx: Transaction) -> Self {
        let outputs = tx.vout.len();
        Self {
            tx,
            hash_block: ZERO_HASH,
            merkle_branch: Vec::new(),
            index_in_block: -1,
            spent_bits: vec![false; outputs],
            time_received: 0,
            time_smart: 0,
            order_pos: -1,
            from_me: false,
            map_value: BTreeMap::new(),
            vtx_prev: Vec::new(),
        }
    }

    pub fn txid(&self) -> Hash256 {
        self.tx.txid()
    }

    pub fn is_confirmed(&self) -> bool {
        self.hash_block != ZERO_HASH && self.index_in_block >= 0
    }

    pub fn is_spent(&self, index: usize) -> bool {
        self.spent_bits.get(index).copied().unwrap_or(false)
    }

    pub fn mark_spent(&mut self, index: usize) -> bool {
        if index >= self.spent_bits.len() {
            return false;
        }
        let changed = !self.spent_bits[index];
        self.spent_bits[index] = true;
        changed
    }

    pub fn mark_unspent(&mut self, index: usize) -> bool {
        if index >= self.spent_bits.len() {
            return false;
        }
        let changed = self.spent_bits[index];
        self.spent_bits[index] = false;
        changed
    }

    /// OR in another copy's spent view. Returns whether anything changed.
    pub fn update_spent(&mut self, other: &[bool]) -> bool {
        let mut changed = false;
        for (index, spent) in other.iter().enumerate() {
            if *spent && index < self.spent_bits.len() && !self.spent_bits[index] {
                self.spent_bits[index] = true;
                changed = true;
            }
        }
        changed
    }

    /// Record the inclusion proof from the containing block.
    pub fn set_merkle_branch(&mut self, block: &Block) {
        let txid = self.txid();
        let txids = block.txids();
        let Some(index) = txids.iter().position(|candidate| *candidate == txid) else {
            return;
        };
        self.hash_block = block.hash();
        self.index_in_block = index as i32;
        self.merkle_branch = merkle_branch(&txids, index);
    }

    /// Confirmations in the main chain; 0 while unconfirmed, negative never
    /// (a conflicted tx simply stops being indexed).
    pub fn depth_in_main_chain<S: KeyValueStore>(
        &self,
        chain: &ChainView<S>,
    ) -> Result<i32, WalletError> {
        if !self.is_confirmed() {
            return Ok(0);
        }
        Ok(chain.depth_of_block(&self.hash_block)?)
    }

    pub fn blocks_to_maturity<S: KeyValueStore>(
        &self,
        chain: &ChainView<S>,
        params: &ChainParams,
    ) -> Result<i32, WalletError> {
        if !self.tx.is_coinbase() && !self.tx.is_coinstake() {
            return Ok(0);
        }
        let depth = self.depth_in_main_chain(chain)?;
        Ok((params.coinbase_maturity + 1 - depth).max(0))
    }

    /// Display/ordering time: the smart time when assigned, else receipt.
    pub fn tx_time(&self) -> i64 {
        if self.time_smart != 0 {
            self.time_smart
        } else {
            self.time_received
        }
    }
}

fn write_spent_bits(encoder: &mut Encoder, bits: &[bool]) {
    encoder.write_compact_size(bits.len() as u64);
    let mut byte = 0u8;
    for (index, bit) in bits.iter().enumerate() {
        if *bit {
            byte |= 1 << (index % 8);
        }
        if index % 8 == 7 {
            encoder.write_u8(byte);
            byte = 0;
        }
    }
    if bits.len() % 8 != 0 {
        encoder.write_u8(byte);
    }
}

fn read_spent_bits(decoder: &mut Decoder) -> Result<Vec<bool>, DecodeError> {
    let count = decoder.read_compact_size()? as usize;
    let mut bits = Vec::with_capacity(count);
    let mut byte = 0u8;
    for index in 0..count {
        if index % 8 == 0 {
            byte = decoder.read_u8()?;
        }
        bits.push(byte & (1 << (index % 8)) != 0);
    }
    Ok(bits)
}

impl Encodable for WalletTx {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.tx.consensus_encode(encoder);
        encoder.write_hash(&self.hash_block);
        encoder.write_compact_size(self.merkle_branch.len() as u64);
        for hash in &self.merkle_branch {
            encoder.write_hash(hash);
        }
        encoder.write_i32_le(self.index_in_block);
        write_spent_bits(encoder, &self.spent_bits);
        encoder.write_i64_le(self.time_received);
        encoder.write_i64_le(self.time_smart);
        encoder.write_i64_le(self.order_pos);
        encoder.write_bool(self.from_me);
        encoder.write_compact_size(self.map_value.len() as u64);
        for (key, value) in &self.map_value {
            encoder.write_var_str(key);
            encoder.write_var_str(value);
        }
        write_vec(encoder, &self.vtx_prev);
    }
}

impl Decodable for WalletTx {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let tx = Transaction::consensus_decode(decoder)?;
        let hash_block = decoder.read_hash()?;
        let branch_len = decoder.read_compact_size()? as usize;
        let mut merkle_branch = Vec::with_capacity(branch_len.min(64));
        for _ in 0..branch_len {
            merkle_branch.push(decoder.read_hash()?);
        }
        let index_in_block = decoder.read_i32_le()?;
        let spent_bits = read_spent_bits(decoder)?;
        let time_received = decoder.read_i64_le()?;
        let time_smart = decoder.read_i64_le()?;
        let order_pos = decoder.read_i64_le()?;
        let from_me = decoder.read_bool()?;
        let map_len = decoder.read_compact_size()? as usize;
        let mut map_value = BTreeMap::new();
        for _ in 0..map_len {
            let key = decoder.read_var_str()?;
            let value = decoder.read_var_str()?;
            map_value.insert(key, value);
        }
        let vtx_prev = read_vec(decoder)?;
        Ok(Self {
            tx,
            hash_block,
            merkle_branch,
            index_in_block,
            spent_bits,
            time_received,
            time_smart,
            order_pos,
            from_me,
            map_value,
            vtx_prev,
        })
    }
}
