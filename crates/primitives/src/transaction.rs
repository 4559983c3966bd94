//! Transaction types and serialization.
//!
//! Umbra transactions carry a creation timestamp after the version word (the
//! proof-of-stake lineage format): `version | time | vin | vout | lock_time`.

use umbra_consensus::{money_range, Amount, Hash256};

use crate::encoding::{
    decode, encode, read_vec, write_vec, Decodable, DecodeError, Decoder, Encodable, Encoder,
};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

pub const TX_VERSION: i32 = 1;
pub const SEQUENCE_FINAL: u32 = u32::MAX;
/// Lock times at or above this are unix timestamps rather than heights.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn from_outpoint(prevout: OutPoint) -> Self {
        Self {
            prevout,
            script_sig: Vec::new(),
            sequence: SEQUENCE_FINAL,
        }
    }

    pub fn is_final(&self) -> bool {
        self.sequence == SEQUENCE_FINAL
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(value: Amount, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    /// The empty marker output that opens every coinstake.
    pub fn empty_marker() -> Self {
        Self {
            value: 0,
            script_pubkey: Vec::new(),
        }
    }

    pub fn is_empty_marker(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    /// Creation timestamp; staking selects only coins older than the spend
    /// time, so this participates in consensus.
    pub time: u32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(time: u32) -> Self {
        Self {
            version: TX_VERSION,
            time,
            vin: Vec::new(),
            vout: Vec::new(),
            lock_time: 0,
        }
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&encode(self))
    }

    pub fn serialized_size(&self) -> usize {
        encode(self).len()
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null() && !self.vout.is_empty()
    }

    pub fn is_coinstake(&self) -> bool {
        self.vin.len() >= 1
            && !self.vin[0].prevout.is_null()
            && self.vout.len() >= 2
            && self.vout[0].is_empty_marker()
    }

    /// Sum of output values. Errors are for the caller; this saturates only
    /// on the money-range check.
    pub fn value_out(&self) -> Amount {
        self.vout.iter().map(|out| out.value).sum()
    }

    pub fn is_final(&self, height: i32, block_time: i64) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let cutoff = if self.lock_time < LOCKTIME_THRESHOLD {
            height as i64
        } else {
            block_time
        };
        if (self.lock_time as i64) < cutoff {
            return true;
        }
        self.vin.iter().all(TxIn::is_final)
    }

    /// Basic standalone sanity checks shared by relay and the wallet's
    /// resend loop.
    pub fn check(&self) -> Result<(), TransactionCheckError> {
        if self.vin.is_empty() {
            return Err(TransactionCheckError::NoInputs);
        }
        if self.vout.is_empty() {
            return Err(TransactionCheckError::NoOutputs);
        }
        let mut total: Amount = 0;
        for out in &self.vout {
            if out.value < 0 {
                return Err(TransactionCheckError::NegativeOutput);
            }
            if !money_range(out.value) {
                return Err(TransactionCheckError::OutputOutOfRange);
            }
            total = total
                .checked_add(out.value)
                .ok_or(TransactionCheckError::OutputOutOfRange)?;
            if !money_range(total) {
                return Err(TransactionCheckError::OutputOutOfRange);
            }
        }
        let mut seen = std::collections::HashSet::new();
        for input in &self.vin {
            if !self.is_coinbase() && input.prevout.is_null() {
                return Err(TransactionCheckError::NullInput);
            }
            if !seen.insert(input.prevout) {
                return Err(TransactionCheckError::DuplicateInput);
            }
        }
        Ok(())
    }

    pub fn consensus_encode_to_vec(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn consensus_decode_from(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode(bytes)
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_u32_le(self.time);
        write_vec(encoder, &self.vin);
        write_vec(encoder, &self.vout);
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let time = decoder.read_u32_le()?;
        let vin = read_vec(decoder)?;
        let vout = read_vec(decoder)?;
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            time,
            vin,
            vout,
            lock_time,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransactionCheckError {
    NoInputs,
    NoOutputs,
    NegativeOutput,
    OutputOutOfRange,
    NullInput,
    DuplicateInput,
}

impl std::fmt::Display for TransactionCheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionCheckError::NoInputs => write!(f, "transaction has no inputs"),
            TransactionCheckError::NoOutputs => write!(f, "transaction has no outputs"),
            TransactionCheckError::NegativeOutput => write!(f, "negative output value"),
            TransactionCheckError::OutputOutOfRange => write!(f, "output value out of range"),
            TransactionCheckError::NullInput => write!(f, "null prevout in non-coinbase"),
            TransactionCheckError::DuplicateInput => write!(f, "duplicate input"),
        }
    }
}

impl std::error::Error for TransactionCheckError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn spend_to(value: Amount) -> Transaction {
        let mut tx = Transaction::new(1_700_000_000);
        tx.vin.push(TxIn::from_outpoint(OutPoint::new([7u8; 32], 0)));
        tx.vout.push(TxOut::new(value, vec![0x51]));
        tx
    }

    #[test]
    fn round_trip() {
        let tx = spend_to(50_000);
        let bytes = tx.consensus_encode_to_vec();
        let decoded = Transaction::consensus_decode_from(&bytes).expect("decode");
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid(), tx.txid());
    }

    #[test]
    fn coinstake_shape() {
        let mut tx = Transaction::new(0);
        tx.vin.push(TxIn::from_outpoint(OutPoint::new([1u8; 32], 0)));
        tx.vout.push(TxOut::empty_marker());
        tx.vout.push(TxOut::new(0, vec![0x51]));
        assert!(tx.is_coinstake());
        assert!(!tx.is_coinbase());
    }

    #[test]
    fn coinbase_shape() {
        let mut tx = Transaction::new(0);
        tx.vin.push(TxIn::from_outpoint(OutPoint::null()));
        tx.vout.push(TxOut::new(1, vec![0x51]));
        assert!(tx.is_coinbase());
        assert!(!tx.is_coinstake());
    }

    #[test]
    fn check_rejects_duplicate_inputs() {
        let mut tx = spend_to(1);
        tx.vin.push(tx.vin[0].clone());
        assert_eq!(tx.check(), Err(TransactionCheckError::DuplicateInput));
    }

    #[test]
    fn check_rejects_negative_output() {
        let tx = spend_to(-5);
        assert_eq!(tx.check(), Err(TransactionCheckError::NegativeOutput));
    }
}
