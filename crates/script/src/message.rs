//! Signed-message helpers (compact recoverable signatures over the message
//! magic). The mix protocol signs availability queries with these.

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::Message;
use umbra_consensus::constants::SIGNED_MESSAGE_MAGIC;
use umbra_consensus::Hash256;
use umbra_primitives::encoding::Encoder;
use umbra_primitives::hash::sha256d;

use crate::secp::secp256k1;

#[derive(Debug, Eq, PartialEq)]
pub enum SignedMessageError {
    InvalidPubkey,
    InvalidSignature,
    InvalidRecoveryId,
    InvalidMessage,
    RecoverFailed,
    PubkeyMismatch,
}

impl std::fmt::Display for SignedMessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignedMessageError::InvalidPubkey => write!(f, "invalid pubkey"),
            SignedMessageError::InvalidSignature => write!(f, "invalid signature"),
            SignedMessageError::InvalidRecoveryId => write!(f, "invalid recovery id"),
            SignedMessageError::InvalidMessage => write!(f, "invalid message"),
            SignedMessageError::RecoverFailed => write!(f, "failed to recover pubkey"),
            SignedMessageError::PubkeyMismatch => write!(f, "pubkey mismatch"),
        }
    }
}

impl std::error::Error for SignedMessageError {}

pub fn signed_message_hash(message: &[u8]) -> Hash256 {
    let mut encoder = Encoder::new();
    encoder.write_var_str(SIGNED_MESSAGE_MAGIC);
    encoder.write_var_bytes(message);
    sha256d(&encoder.into_inner())
}

/// Sign `message` with a 65-byte compact recoverable signature.
pub fn sign_message(
    secret: &secp256k1::SecretKey,
    message: &[u8],
    compressed: bool,
) -> Result<[u8; 65], SignedMessageError> {
    let digest = signed_message_hash(message);
    let msg =
        Message::from_digest_slice(&digest).map_err(|_| SignedMessageError::InvalidMessage)?;
    let sig = secp256k1().sign_ecdsa_recoverable(&msg, secret);
    let (rec_id, bytes) = sig.serialize_compact();
    let mut out = [0u8; 65];
    out[0] = 27 + (rec_id.to_i32() as u8) + if compressed { 4 } else { 0 };
    out[1..].copy_from_slice(&bytes);
    Ok(out)
}

pub fn verify_signed_message(
    expected_pubkey: &[u8],
    signature: &[u8],
    message: &[u8],
) -> Result<(), SignedMessageError> {
    if expected_pubkey.is_empty() {
        return Err(SignedMessageError::InvalidPubkey);
    }
    let recovered = recover_signed_message_pubkey(signature, message)?;
    if recovered != expected_pubkey {
        return Err(SignedMessageError::PubkeyMismatch);
    }
    Ok(())
}

pub fn recover_signed_message_pubkey(
    signature: &[u8],
    message: &[u8],
) -> Result<Vec<u8>, SignedMessageError> {
    let (recoverable, compressed) = decode_compact_signature(signature)?;
    let digest = signed_message_hash(message);
    let msg =
        Message::from_digest_slice(&digest).map_err(|_| SignedMessageError::InvalidMessage)?;
    let pubkey = secp256k1()
        .recover_ecdsa(&msg, &recoverable)
        .map_err(|_| SignedMessageError::RecoverFailed)?;
    if compressed {
        Ok(pubkey.serialize().to_vec())
    } else {
        Ok(pubkey.serialize_uncompressed().to_vec())
    }
}

fn decode_compact_signature(
    signature: &[u8],
) -> Result<(RecoverableSignature, bool), SignedMessageError> {
    if signature.len() != 65 {
        return Err(SignedMessageError::InvalidSignature);
    }
    let header = signature[0];
    if !(27..=34).contains(&header) {
        return Err(SignedMessageError::InvalidSignature);
    }
    let compressed = header >= 31;
    let recovery = if compressed { header - 31 } else { header - 27 };
    let rec_id =
        RecoveryId::from_i32(recovery as i32).map_err(|_| SignedMessageError::InvalidRecoveryId)?;
    let sig = RecoverableSignature::from_compact(&signature[1..65], rec_id)
        .map_err(|_| SignedMessageError::InvalidSignature)?;
    Ok((sig, compressed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SecretKey;

    #[test]
    fn sign_verify_recover() {
        let secret = SecretKey::from_slice(&[1u8; 32]).expect("secret");
        let pubkey = secp256k1::PublicKey::from_secret_key(secp256k1(), &secret);

        let message = b"availability check";
        let sig = sign_message(&secret, message, true).expect("sign");

        verify_signed_message(&pubkey.serialize(), &sig, message).expect("verify");
        let recovered = recover_signed_message_pubkey(&sig, message).expect("recover");
        assert_eq!(recovered, pubkey.serialize().to_vec());

        let err = verify_signed_message(&pubkey.serialize_uncompressed(), &sig, message)
            .unwrap_err();
        assert_eq!(err, SignedMessageError::PubkeyMismatch);
    }

    #[test]
    fn tampered_message_fails() {
        let secret = SecretKey::from_slice(&[2u8; 32]).expect("secret");
        let pubkey = secp256k1::PublicKey::from_secret_key(secp256k1(), &secret);
        let sig = sign_message(&secret, b"original", true).expect("sign");
        assert!(verify_signed_message(&pubkey.serialize(), &sig, b"tampered").is_err());
    }
}
