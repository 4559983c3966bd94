//! Stealth address encoding.
//!
//! A published stealth address is a (scan, spend) pubkey pair. Senders derive
//! a fresh one-time destination from it per payment; only the holder of the
//! scan secret can link the payment back. The encoded form is bech32 over
//! `version || scan_pubkey || spend_pubkey`.

use bech32::{Bech32, Hrp};
use secp256k1::PublicKey;
use umbra_consensus::{chain_params, Network};

pub const STEALTH_ADDRESS_VERSION: u8 = 1;

#[derive(Debug, Eq, PartialEq)]
pub enum StealthAddressError {
    InvalidEncoding,
    UnknownHrp,
    UnknownVersion(u8),
    InvalidLength,
    InvalidPubkey,
}

impl std::fmt::Display for StealthAddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StealthAddressError::InvalidEncoding => write!(f, "invalid bech32 encoding"),
            StealthAddressError::UnknownHrp => write!(f, "unknown human-readable part"),
            StealthAddressError::UnknownVersion(v) => write!(f, "unknown stealth version {v}"),
            StealthAddressError::InvalidLength => write!(f, "invalid stealth payload length"),
            StealthAddressError::InvalidPubkey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for StealthAddressError {}

/// The public half of a stealth address. Secrets live in the wallet's
/// stealth directory, not here.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StealthAddress {
    pub scan_pubkey: PublicKey,
    pub spend_pubkey: PublicKey,
}

impl StealthAddress {
    pub fn encode(&self, network: Network) -> String {
        let hrp = Hrp::parse(chain_params(network).stealth_hrp).expect("static hrp");
        let mut payload = Vec::with_capacity(1 + 33 + 33);
        payload.push(STEALTH_ADDRESS_VERSION);
        payload.extend_from_slice(&self.scan_pubkey.serialize());
        payload.extend_from_slice(&self.spend_pubkey.serialize());
        bech32::encode::<Bech32>(hrp, &payload).expect("payload within bech32 limits")
    }

    pub fn decode(encoded: &str, network: Network) -> Result<Self, StealthAddressError> {
        let (hrp, payload) =
            bech32::decode(encoded).map_err(|_| StealthAddressError::InvalidEncoding)?;
        if hrp.as_str() != chain_params(network).stealth_hrp {
            return Err(StealthAddressError::UnknownHrp);
        }
        if payload.len() != 1 + 33 + 33 {
            return Err(StealthAddressError::InvalidLength);
        }
        if payload[0] != STEALTH_ADDRESS_VERSION {
            return Err(StealthAddressError::UnknownVersion(payload[0]));
        }
        let scan_pubkey = PublicKey::from_slice(&payload[1..34])
            .map_err(|_| StealthAddressError::InvalidPubkey)?;
        let spend_pubkey = PublicKey::from_slice(&payload[34..67])
            .map_err(|_| StealthAddressError::InvalidPubkey)?;
        Ok(Self {
            scan_pubkey,
            spend_pubkey,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{Secp256k1, SecretKey};

    fn test_address() -> StealthAddress {
        let secp = Secp256k1::signing_only();
        let scan = SecretKey::from_slice(&[3u8; 32]).expect("secret");
        let spend = SecretKey::from_slice(&[5u8; 32]).expect("secret");
        StealthAddress {
            scan_pubkey: PublicKey::from_secret_key(&secp, &scan),
            spend_pubkey: PublicKey::from_secret_key(&secp, &spend),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let addr = test_address();
        let encoded = addr.encode(Network::Mainnet);
        assert!(encoded.starts_with("usx1"));
        assert_eq!(StealthAddress::decode(&encoded, Network::Mainnet), Ok(addr));
    }

    #[test]
    fn wrong_network_rejected() {
        let addr = test_address();
        let encoded = addr.encode(Network::Mainnet);
        assert_eq!(
            StealthAddress::decode(&encoded, Network::Testnet),
            Err(StealthAddressError::UnknownHrp)
        );
    }
}
