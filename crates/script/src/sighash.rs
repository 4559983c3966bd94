//! Legacy signature hashing for transaction inputs.

use umbra_consensus::Hash256;
use umbra_primitives::encoding::{Encodable, Encoder};
use umbra_primitives::hash::sha256d;
use umbra_primitives::transaction::Transaction;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SighashType(pub u32);

impl SighashType {
    pub fn base_type(self) -> u32 {
        self.0 & 0x1f
    }

    pub fn has_anyone_can_pay(self) -> bool {
        (self.0 & SIGHASH_ANYONECANPAY) != 0
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum SighashError {
    InputIndexOutOfRange,
    MissingOutput,
}

impl std::fmt::Display for SighashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SighashError::InputIndexOutOfRange => write!(f, "input index out of range"),
            SighashError::MissingOutput => write!(f, "no matching output for SIGHASH_SINGLE"),
        }
    }
}

impl std::error::Error for SighashError {}

/// Digest an input commits to when signing: the transaction with every
/// scriptSig blanked except the signing input, which carries `script_code`.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    sighash_type: SighashType,
) -> Result<Hash256, SighashError> {
    if input_index >= tx.vin.len() {
        return Err(SighashError::InputIndexOutOfRange);
    }
    let anyone_can_pay = sighash_type.has_anyone_can_pay();
    let hash_single = sighash_type.base_type() == SIGHASH_SINGLE;
    let hash_none = sighash_type.base_type() == SIGHASH_NONE;
    if hash_single && input_index >= tx.vout.len() {
        return Err(SighashError::MissingOutput);
    }

    let mut encoder = Encoder::new();
    encoder.write_i32_le(tx.version);
    encoder.write_u32_le(tx.time);

    let input_count = if anyone_can_pay { 1 } else { tx.vin.len() };
    encoder.write_compact_size(input_count as u64);
    for idx in 0..input_count {
        let actual = if anyone_can_pay { input_index } else { idx };
        let input = &tx.vin[actual];
        input.prevout.consensus_encode(&mut encoder);
        if actual == input_index {
            encoder.write_var_bytes(script_code);
        } else {
            encoder.write_compact_size(0);
        }
        if actual != input_index && (hash_single || hash_none) {
            encoder.write_u32_le(0);
        } else {
            encoder.write_u32_le(input.sequence);
        }
    }

    let output_count = if hash_none {
        0
    } else if hash_single {
        input_index + 1
    } else {
        tx.vout.len()
    };
    encoder.write_compact_size(output_count as u64);
    for idx in 0..output_count {
        if hash_single && idx != input_index {
            encoder.write_i64_le(-1);
            encoder.write_compact_size(0);
        } else {
            tx.vout[idx].consensus_encode(&mut encoder);
        }
    }

    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(sighash_type.0);

    Ok(sha256d(&encoder.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_primitives::outpoint::OutPoint;
    use umbra_primitives::transaction::{TxIn, TxOut};

    fn two_in_two_out() -> Transaction {
        let mut tx = Transaction::new(100);
        tx.vin.push(TxIn::from_outpoint(OutPoint::new([1u8; 32], 0)));
        tx.vin.push(TxIn::from_outpoint(OutPoint::new([2u8; 32], 1)));
        tx.vout.push(TxOut::new(10, vec![0x51]));
        tx.vout.push(TxOut::new(20, vec![0x52]));
        tx
    }

    #[test]
    fn all_commits_to_every_output() {
        let tx = two_in_two_out();
        let before = signature_hash(&tx, 0, &[0x51], SighashType(SIGHASH_ALL)).expect("hash");
        let mut changed = tx.clone();
        changed.vout[1].value = 21;
        let after = signature_hash(&changed, 0, &[0x51], SighashType(SIGHASH_ALL)).expect("hash");
        assert_ne!(before, after);
    }

    #[test]
    fn single_ignores_later_outputs() {
        let tx = two_in_two_out();
        let before = signature_hash(&tx, 0, &[0x51], SighashType(SIGHASH_SINGLE)).expect("hash");
        let mut changed = tx.clone();
        changed.vout[1].value = 21;
        let after =
            signature_hash(&changed, 0, &[0x51], SighashType(SIGHASH_SINGLE)).expect("hash");
        assert_eq!(before, after);
    }

    #[test]
    fn single_requires_matching_output() {
        let mut tx = two_in_two_out();
        tx.vout.truncate(1);
        assert_eq!(
            signature_hash(&tx, 1, &[0x51], SighashType(SIGHASH_SINGLE)),
            Err(SighashError::MissingOutput)
        );
    }

    #[test]
    fn out_of_range_input() {
        let tx = two_in_two_out();
        assert_eq!(
            signature_hash(&tx, 5, &[0x51], SighashType(SIGHASH_ALL)),
            Err(SighashError::InputIndexOutOfRange)
        );
    }
}
