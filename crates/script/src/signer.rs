//! Input signing, multisig signature combination, and spend verification.

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, SecretKey};
use umbra_primitives::hash::hash160;
use umbra_primitives::transaction::Transaction;

use crate::secp::secp256k1;
use crate::sighash::{signature_hash, SighashType};
use crate::standard::{
    extract_destination, parse_multisig, push_data, ScriptDestination, ScriptOps, OP_0,
};

/// Key material the signer draws from. The wallet key store implements this;
/// the mix signer implements it over a single imported key.
pub trait SigningKeys {
    fn secret_for_key_hash(&self, key_hash: &[u8; 20]) -> Option<(SecretKey, bool)>;
    fn redeem_script(&self, script_hash: &[u8; 20]) -> Option<Vec<u8>>;
}

#[derive(Debug, Eq, PartialEq)]
pub enum SignError {
    UnknownKey,
    UnknownRedeemScript,
    UnsupportedScript,
    InputIndexOutOfRange,
    Sighash(crate::sighash::SighashError),
}

impl std::fmt::Display for SignError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignError::UnknownKey => write!(f, "no key for destination"),
            SignError::UnknownRedeemScript => write!(f, "no redeem script for script hash"),
            SignError::UnsupportedScript => write!(f, "unsupported script form"),
            SignError::InputIndexOutOfRange => write!(f, "input index out of range"),
            SignError::Sighash(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SignError {}

impl From<crate::sighash::SighashError> for SignError {
    fn from(err: crate::sighash::SighashError) -> Self {
        SignError::Sighash(err)
    }
}

fn encode_signature(sig: &Signature, sighash_type: SighashType) -> Vec<u8> {
    let mut bytes = sig.serialize_der().to_vec();
    bytes.push(sighash_type.0 as u8);
    bytes
}

fn sign_digest(secret: &SecretKey, digest: &[u8; 32], sighash_type: SighashType) -> Vec<u8> {
    let msg = Message::from_digest_slice(digest).expect("32-byte digest");
    let sig = secp256k1().sign_ecdsa(&msg, secret);
    encode_signature(&sig, sighash_type)
}

fn check_signature(
    sig_with_type: &[u8],
    pubkey_bytes: &[u8],
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
) -> bool {
    let Some((&type_byte, der)) = sig_with_type.split_last() else {
        return false;
    };
    let Ok(sig) = Signature::from_der(der) else {
        return false;
    };
    let Ok(pubkey) = PublicKey::from_slice(pubkey_bytes) else {
        return false;
    };
    let Ok(digest) = signature_hash(
        tx,
        input_index,
        script_code,
        SighashType(type_byte as u32),
    ) else {
        return false;
    };
    let Ok(msg) = Message::from_digest_slice(&digest) else {
        return false;
    };
    secp256k1().verify_ecdsa(&msg, &sig, &pubkey).is_ok()
}

/// Produce the scriptSig spending `script_pubkey` at `input_index`. For a
/// P2SH multisig output this signs with every held key; a partial signing
/// (fewer signatures than required) is not an error, the combiner finishes
/// the job.
pub fn sign_input<K: SigningKeys>(
    keys: &K,
    tx: &Transaction,
    input_index: usize,
    script_pubkey: &[u8],
    sighash_type: SighashType,
) -> Result<Vec<u8>, SignError> {
    if input_index >= tx.vin.len() {
        return Err(SignError::InputIndexOutOfRange);
    }
    match extract_destination(script_pubkey).ok_or(SignError::UnsupportedScript)? {
        ScriptDestination::KeyHash(key_hash) => {
            let (secret, compressed) = keys
                .secret_for_key_hash(&key_hash)
                .ok_or(SignError::UnknownKey)?;
            let digest = signature_hash(tx, input_index, script_pubkey, sighash_type)?;
            let sig = sign_digest(&secret, &digest, sighash_type);
            let pubkey = PublicKey::from_secret_key(secp256k1(), &secret);
            let pubkey_bytes = if compressed {
                pubkey.serialize().to_vec()
            } else {
                pubkey.serialize_uncompressed().to_vec()
            };
            let mut script_sig = Vec::with_capacity(sig.len() + pubkey_bytes.len() + 4);
            push_data(&mut script_sig, &sig);
            push_data(&mut script_sig, &pubkey_bytes);
            Ok(script_sig)
        }
        ScriptDestination::PubKey(pubkey_bytes) => {
            let key_hash = hash160(&pubkey_bytes);
            let (secret, _) = keys
                .secret_for_key_hash(&key_hash)
                .ok_or(SignError::UnknownKey)?;
            let digest = signature_hash(tx, input_index, script_pubkey, sighash_type)?;
            let sig = sign_digest(&secret, &digest, sighash_type);
            let mut script_sig = Vec::with_capacity(sig.len() + 2);
            push_data(&mut script_sig, &sig);
            Ok(script_sig)
        }
        ScriptDestination::ScriptHash(script_hash) => {
            let redeem = keys
                .redeem_script(&script_hash)
                .ok_or(SignError::UnknownRedeemScript)?;
            let (_, pubkeys) = parse_multisig(&redeem).ok_or(SignError::UnsupportedScript)?;
            let digest = signature_hash(tx, input_index, &redeem, sighash_type)?;
            let mut script_sig = vec![OP_0];
            for pubkey_bytes in &pubkeys {
                let key_hash = hash160(pubkey_bytes);
                if let Some((secret, _)) = keys.secret_for_key_hash(&key_hash) {
                    let sig = sign_digest(&secret, &digest, sighash_type);
                    push_data(&mut script_sig, &sig);
                }
            }
            push_data(&mut script_sig, &redeem);
            Ok(script_sig)
        }
        ScriptDestination::Multisig { .. } => Err(SignError::UnsupportedScript),
    }
}

fn pushed_elements(script_sig: &[u8]) -> Vec<Vec<u8>> {
    ScriptOps::new(script_sig)
        .filter(|(_, data)| !data.is_empty())
        .map(|(_, data)| data.to_vec())
        .collect()
}

/// Merge two partial P2SH-multisig scriptSigs into one. Candidate signatures
/// from both sides are checked against the redeem script's pubkeys and
/// emitted in pubkey order, at most one per key.
pub fn combine_multisig_signatures(
    redeem_script: &[u8],
    tx: &Transaction,
    input_index: usize,
    script_sig_a: &[u8],
    script_sig_b: &[u8],
) -> Result<Vec<u8>, SignError> {
    let (required, pubkeys) =
        parse_multisig(redeem_script).ok_or(SignError::UnsupportedScript)?;

    let mut candidates = pushed_elements(script_sig_a);
    candidates.extend(pushed_elements(script_sig_b));
    candidates.retain(|element| element.as_slice() != redeem_script);

    let mut script_sig = vec![OP_0];
    let mut used = 0usize;
    for pubkey_bytes in &pubkeys {
        if used == required {
            break;
        }
        let matched = candidates.iter().find(|candidate| {
            check_signature(candidate, pubkey_bytes, tx, input_index, redeem_script)
        });
        if let Some(sig) = matched {
            push_data(&mut script_sig, sig);
            used += 1;
        }
    }
    push_data(&mut script_sig, redeem_script);
    Ok(script_sig)
}

/// Check whether `script_sig` satisfies `script_pubkey` for this input.
/// Covers the standard forms the wallet produces; exotic scripts verify as
/// false rather than erroring.
pub fn verify_input(
    tx: &Transaction,
    input_index: usize,
    script_pubkey: &[u8],
) -> bool {
    if input_index >= tx.vin.len() {
        return false;
    }
    let script_sig = &tx.vin[input_index].script_sig;
    match extract_destination(script_pubkey) {
        Some(ScriptDestination::KeyHash(key_hash)) => {
            let elements = pushed_elements(script_sig);
            let [sig, pubkey_bytes] = elements.as_slice() else {
                return false;
            };
            hash160(pubkey_bytes) == key_hash
                && check_signature(sig, pubkey_bytes, tx, input_index, script_pubkey)
        }
        Some(ScriptDestination::PubKey(pubkey_bytes)) => {
            let elements = pushed_elements(script_sig);
            let [sig] = elements.as_slice() else {
                return false;
            };
            check_signature(sig, &pubkey_bytes, tx, input_index, script_pubkey)
        }
        Some(ScriptDestination::ScriptHash(script_hash)) => {
            let elements = pushed_elements(script_sig);
            let Some((redeem, sigs)) = elements.split_last() else {
                return false;
            };
            if hash160(redeem) != script_hash {
                return false;
            }
            let Some((required, pubkeys)) = parse_multisig(redeem) else {
                return false;
            };
            if sigs.len() < required {
                return false;
            }
            // Signatures must satisfy distinct keys in pubkey order.
            let mut key_cursor = 0usize;
            let mut satisfied = 0usize;
            for sig in sigs {
                while key_cursor < pubkeys.len() {
                    let pubkey_bytes = &pubkeys[key_cursor];
                    key_cursor += 1;
                    if check_signature(sig, pubkey_bytes, tx, input_index, redeem) {
                        satisfied += 1;
                        break;
                    }
                }
            }
            satisfied >= required
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sighash::SIGHASH_ALL;
    use std::collections::HashMap;
    use umbra_primitives::outpoint::OutPoint;
    use umbra_primitives::transaction::{TxIn, TxOut};

    use crate::standard::{multisig_redeem_script, p2pkh_script_pubkey, p2pk_script_pubkey};

    struct TestKeys {
        secrets: HashMap<[u8; 20], SecretKey>,
        redeem_scripts: HashMap<[u8; 20], Vec<u8>>,
    }

    impl TestKeys {
        fn new() -> Self {
            Self {
                secrets: HashMap::new(),
                redeem_scripts: HashMap::new(),
            }
        }

        fn add_secret(&mut self, seed: u8) -> PublicKey {
            let secret = SecretKey::from_slice(&[seed; 32]).expect("secret");
            let pubkey = PublicKey::from_secret_key(secp256k1(), &secret);
            self.secrets.insert(hash160(&pubkey.serialize()), secret);
            pubkey
        }

        fn add_redeem(&mut self, redeem: Vec<u8>) {
            self.redeem_scripts.insert(hash160(&redeem), redeem);
        }
    }

    impl SigningKeys for TestKeys {
        fn secret_for_key_hash(&self, key_hash: &[u8; 20]) -> Option<(SecretKey, bool)> {
            self.secrets.get(key_hash).map(|secret| (*secret, true))
        }

        fn redeem_script(&self, script_hash: &[u8; 20]) -> Option<Vec<u8>> {
            self.redeem_scripts.get(script_hash).cloned()
        }
    }

    fn spend_tx() -> Transaction {
        let mut tx = Transaction::new(1000);
        tx.vin.push(TxIn::from_outpoint(OutPoint::new([9u8; 32], 0)));
        tx.vout.push(TxOut::new(5000, vec![0x51]));
        tx
    }

    #[test]
    fn p2pkh_sign_and_verify() {
        let mut keys = TestKeys::new();
        let pubkey = keys.add_secret(11);
        let script_pubkey = p2pkh_script_pubkey(&hash160(&pubkey.serialize()));

        let mut tx = spend_tx();
        tx.vin[0].script_sig =
            sign_input(&keys, &tx, 0, &script_pubkey, SighashType(SIGHASH_ALL)).expect("sign");
        assert!(verify_input(&tx, 0, &script_pubkey));

        // Mutating an output invalidates the signature.
        tx.vout[0].value += 1;
        assert!(!verify_input(&tx, 0, &script_pubkey));
    }

    #[test]
    fn p2pk_sign_and_verify() {
        let mut keys = TestKeys::new();
        let pubkey = keys.add_secret(12);
        let script_pubkey = p2pk_script_pubkey(&pubkey);

        let mut tx = spend_tx();
        tx.vin[0].script_sig =
            sign_input(&keys, &tx, 0, &script_pubkey, SighashType(SIGHASH_ALL)).expect("sign");
        assert!(verify_input(&tx, 0, &script_pubkey));
    }

    #[test]
    fn two_of_three_combines_to_complete() {
        let mut all = TestKeys::new();
        let pk1 = all.add_secret(21);
        let pk2 = all.add_secret(22);
        let pk3 = all.add_secret(23);
        let mut pubkeys = vec![pk1, pk2, pk3];
        pubkeys.sort_by_key(|pk| pk.serialize());
        let redeem = multisig_redeem_script(2, &pubkeys);
        let script_pubkey =
            crate::standard::p2sh_script_pubkey_for_redeem_script(&redeem);

        // Party A holds only key 1, party B only key 2.
        let mut party_a = TestKeys::new();
        party_a.add_secret(21);
        party_a.add_redeem(redeem.clone());
        let mut party_b = TestKeys::new();
        party_b.add_secret(22);
        party_b.add_redeem(redeem.clone());

        let tx = spend_tx();
        let partial_a =
            sign_input(&party_a, &tx, 0, &script_pubkey, SighashType(SIGHASH_ALL)).expect("a");
        let partial_b =
            sign_input(&party_b, &tx, 0, &script_pubkey, SighashType(SIGHASH_ALL)).expect("b");

        // One signature is not enough.
        let mut half = tx.clone();
        half.vin[0].script_sig = partial_a.clone();
        assert!(!verify_input(&half, 0, &script_pubkey));

        let merged =
            combine_multisig_signatures(&redeem, &tx, 0, &partial_a, &partial_b).expect("merge");
        let mut complete = tx;
        complete.vin[0].script_sig = merged;
        assert!(verify_input(&complete, 0, &script_pubkey));
    }

    #[test]
    fn sign_without_key_fails() {
        let keys = TestKeys::new();
        let script_pubkey = p2pkh_script_pubkey(&[7u8; 20]);
        let tx = spend_tx();
        assert_eq!(
            sign_input(&keys, &tx, 0, &script_pubkey, SighashType(SIGHASH_ALL)),
            Err(SignError::UnknownKey)
        );
    }
}
