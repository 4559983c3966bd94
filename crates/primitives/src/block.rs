//! Block header and block types.

use umbra_consensus::Hash256;

use crate::encoding::{
    encode, read_vec, write_vec, Decodable, DecodeError, Decoder, Encodable, Encoder,
};
use crate::hash::sha256d;
use crate::transaction::Transaction;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        sha256d(&encode(self))
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash()?,
            merkle_root: decoder.read_hash()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.transactions.len() > 1 && self.transactions[1].is_coinstake()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::txid).collect()
    }

    /// Byte offset of transaction `index` from the start of the serialized
    /// block. The stake kernel commits to this.
    pub fn tx_offset(&self, index: usize) -> Option<usize> {
        if index >= self.transactions.len() {
            return None;
        }
        let mut offset = {
            let mut encoder = Encoder::new();
            self.header.consensus_encode(&mut encoder);
            encoder.write_compact_size(self.transactions.len() as u64);
            encoder.len()
        };
        for tx in &self.transactions[..index] {
            offset += tx.serialized_size();
        }
        Some(offset)
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.consensus_encode(encoder);
        write_vec(encoder, &self.transactions);
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode(decoder)?;
        let transactions = read_vec(decoder)?;
        Ok(Self {
            header,
            transactions,
        })
    }
}
