//! Base58check address decoding and script construction.

use umbra_consensus::{chain_params, Network};

use crate::hash::sha256d;

#[derive(Debug, Eq, PartialEq)]
pub enum AddressError {
    InvalidLength,
    InvalidCharacter,
    InvalidChecksum,
    UnknownPrefix,
}

impl std::fmt::Display for AddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressError::InvalidLength => write!(f, "invalid payload length"),
            AddressError::InvalidCharacter => write!(f, "invalid base58 character"),
            AddressError::InvalidChecksum => write!(f, "checksum mismatch"),
            AddressError::UnknownPrefix => write!(f, "unknown address prefix"),
        }
    }
}

impl std::error::Error for AddressError {}

pub fn key_hash_to_address(hash: &[u8; 20], network: Network) -> String {
    let params = chain_params(network);
    let mut payload = Vec::with_capacity(21);
    payload.push(params.pubkey_prefix);
    payload.extend_from_slice(hash);
    base58check_encode(&payload)
}

pub fn script_hash_to_address(hash: &[u8; 20], network: Network) -> String {
    let params = chain_params(network);
    let mut payload = Vec::with_capacity(21);
    payload.push(params.script_prefix);
    payload.extend_from_slice(hash);
    base58check_encode(&payload)
}

/// Decoded destination of a base58check address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Destination {
    KeyHash([u8; 20]),
    ScriptHash([u8; 20]),
}

pub fn decode_address(address: &str, network: Network) -> Result<Destination, AddressError> {
    let payload = base58check_decode(address)?;
    if payload.len() != 21 {
        return Err(AddressError::InvalidLength);
    }
    let params = chain_params(network);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&payload[1..]);
    if payload[0] == params.pubkey_prefix {
        Ok(Destination::KeyHash(hash))
    } else if payload[0] == params.script_prefix {
        Ok(Destination::ScriptHash(hash))
    } else {
        Err(AddressError::UnknownPrefix)
    }
}

pub fn address_to_script_pubkey(address: &str, network: Network) -> Result<Vec<u8>, AddressError> {
    match decode_address(address, network)? {
        Destination::KeyHash(hash) => Ok(p2pkh_script(&hash)),
        Destination::ScriptHash(hash) => Ok(p2sh_script(&hash)),
    }
}

pub fn script_pubkey_to_address(script: &[u8], network: Network) -> Option<String> {
    if is_p2pkh(script) {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[3..23]);
        return Some(key_hash_to_address(&hash, network));
    }
    if is_p2sh(script) {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[2..22]);
        return Some(script_hash_to_address(&hash, network));
    }
    None
}

pub fn secret_key_to_wif(secret: &[u8; 32], network: Network, compressed: bool) -> String {
    let params = chain_params(network);
    let mut payload = Vec::with_capacity(34);
    payload.push(params.wif_prefix);
    payload.extend_from_slice(secret);
    if compressed {
        payload.push(0x01);
    }
    base58check_encode(&payload)
}

pub fn wif_to_secret_key(wif: &str, network: Network) -> Result<([u8; 32], bool), AddressError> {
    let payload = base58check_decode(wif)?;
    if payload.is_empty() {
        return Err(AddressError::InvalidLength);
    }
    let params = chain_params(network);
    if payload[0] != params.wif_prefix {
        return Err(AddressError::UnknownPrefix);
    }
    let mut secret = [0u8; 32];
    match payload.len() {
        33 => {
            secret.copy_from_slice(&payload[1..33]);
            Ok((secret, false))
        }
        34 if payload[33] == 0x01 => {
            secret.copy_from_slice(&payload[1..33]);
            Ok((secret, true))
        }
        _ => Err(AddressError::InvalidLength),
    }
}

fn p2pkh_script(hash: &[u8; 20]) -> Vec<u8> {
    const OP_DUP: u8 = 0x76;
    const OP_HASH160: u8 = 0xa9;
    const OP_EQUALVERIFY: u8 = 0x88;
    const OP_CHECKSIG: u8 = 0xac;

    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(0x14);
    script.extend_from_slice(hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

fn p2sh_script(hash: &[u8; 20]) -> Vec<u8> {
    const OP_HASH160: u8 = 0xa9;
    const OP_EQUAL: u8 = 0x87;

    let mut script = Vec::with_capacity(23);
    script.push(OP_HASH160);
    script.push(0x14);
    script.extend_from_slice(hash);
    script.push(OP_EQUAL);
    script
}

fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == 0x76
        && script[1] == 0xa9
        && script[2] == 0x14
        && script[23] == 0x88
        && script[24] == 0xac
}

fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == 0xa9 && script[1] == 0x14 && script[22] == 0x87
}

const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

fn base58check_encode(payload: &[u8]) -> String {
    let mut data = Vec::with_capacity(payload.len() + 4);
    data.extend_from_slice(payload);
    let checksum = sha256d(payload);
    data.extend_from_slice(&checksum[..4]);
    base58_encode(&data)
}

fn base58check_decode(input: &str) -> Result<Vec<u8>, AddressError> {
    let bytes = base58_decode(input)?;
    if bytes.len() < 4 {
        return Err(AddressError::InvalidLength);
    }
    let (payload, checksum) = bytes.split_at(bytes.len() - 4);
    let digest = sha256d(payload);
    if checksum != &digest[..4] {
        return Err(AddressError::InvalidChecksum);
    }
    Ok(payload.to_vec())
}

fn base58_encode(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }
    let mut digits = vec![0u8];
    for byte in data {
        let mut carry = *byte as u32;
        for digit in digits.iter_mut().rev() {
            let value = (*digit as u32) * 256 + carry;
            *digit = (value % 58) as u8;
            carry = value / 58;
        }
        while carry > 0 {
            digits.insert(0, (carry % 58) as u8);
            carry /= 58;
        }
    }
    let leading_zeros = data.iter().take_while(|b| **b == 0).count();
    let mut out = String::with_capacity(leading_zeros + digits.len());
    for _ in 0..leading_zeros {
        out.push('1');
    }
    for digit in digits {
        out.push(ALPHABET[digit as usize] as char);
    }
    out
}

fn base58_decode(input: &str) -> Result<Vec<u8>, AddressError> {
    if input.is_empty() {
        return Err(AddressError::InvalidLength);
    }
    let mut bytes: Vec<u8> = Vec::new();
    for ch in input.bytes() {
        let value = ALPHABET
            .iter()
            .position(|v| *v == ch)
            .ok_or(AddressError::InvalidCharacter)? as u32;
        let mut carry = value;
        for byte in bytes.iter_mut().rev() {
            let val = (*byte as u32) * 58 + carry;
            *byte = (val & 0xff) as u8;
            carry = val >> 8;
        }
        while carry > 0 {
            bytes.insert(0, (carry & 0xff) as u8);
            carry >>= 8;
        }
    }
    let leading_zeros = input.bytes().take_while(|b| *b == b'1').count();
    let mut out = vec![0u8; leading_zeros];
    out.extend_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trip() {
        let hash = [0x42u8; 20];
        let address = key_hash_to_address(&hash, Network::Mainnet);
        assert_eq!(
            decode_address(&address, Network::Mainnet),
            Ok(Destination::KeyHash(hash))
        );
        let script = address_to_script_pubkey(&address, Network::Mainnet).expect("script");
        assert_eq!(
            script_pubkey_to_address(&script, Network::Mainnet).as_deref(),
            Some(address.as_str())
        );
    }

    #[test]
    fn script_address_round_trip() {
        let hash = [0x17u8; 20];
        let address = script_hash_to_address(&hash, Network::Regtest);
        assert_eq!(
            decode_address(&address, Network::Regtest),
            Ok(Destination::ScriptHash(hash))
        );
    }

    #[test]
    fn wif_round_trip() {
        let secret = [0x0fu8; 32];
        let wif = secret_key_to_wif(&secret, Network::Regtest, true);
        assert_eq!(wif_to_secret_key(&wif, Network::Regtest), Ok((secret, true)));
        let wif = secret_key_to_wif(&secret, Network::Regtest, false);
        assert_eq!(
            wif_to_secret_key(&wif, Network::Regtest),
            Ok((secret, false))
        );
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let address = key_hash_to_address(&[1u8; 20], Network::Mainnet);
        let mut broken = address.into_bytes();
        let last = broken.len() - 1;
        broken[last] = if broken[last] == b'2' { b'3' } else { b'2' };
        let broken = String::from_utf8(broken).expect("ascii");
        assert!(decode_address(&broken, Network::Mainnet).is_err());
    }
}
