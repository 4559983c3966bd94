//! Standard script classification and construction.

use secp256k1::PublicKey;
use umbra_primitives::hash::hash160;

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1: u8 = 0x51;
pub const OP_2: u8 = 0x52;
pub const OP_3: u8 = 0x53;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKMULTISIG: u8 = 0xae;

/// Narration outputs open with this tag so scanners can spot a plaintext
/// memo without trial-decrypting.
pub const NARRATION_TAG: [u8; 2] = *b"np";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    PubKey,
    PubKeyHash,
    ScriptHash,
    Multisig,
    NullData,
    Unknown,
}

/// Destination a standard output pays to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ScriptDestination {
    KeyHash([u8; 20]),
    PubKey(Vec<u8>),
    ScriptHash([u8; 20]),
    Multisig { required: usize, pubkeys: Vec<Vec<u8>> },
}

impl ScriptDestination {
    /// 20-byte key hash when the destination is single-key.
    pub fn key_hash(&self) -> Option<[u8; 20]> {
        match self {
            ScriptDestination::KeyHash(hash) => Some(*hash),
            ScriptDestination::PubKey(pubkey) => Some(hash160(pubkey)),
            _ => None,
        }
    }
}

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    if is_p2pkh(script) {
        ScriptType::PubKeyHash
    } else if is_p2sh(script) {
        ScriptType::ScriptHash
    } else if is_p2pk(script) {
        ScriptType::PubKey
    } else if is_null_data(script) {
        ScriptType::NullData
    } else if parse_multisig(script).is_some() {
        ScriptType::Multisig
    } else {
        ScriptType::Unknown
    }
}

pub fn extract_destination(script: &[u8]) -> Option<ScriptDestination> {
    if is_p2pkh(script) {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[3..23]);
        return Some(ScriptDestination::KeyHash(hash));
    }
    if is_p2sh(script) {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[2..22]);
        return Some(ScriptDestination::ScriptHash(hash));
    }
    if is_p2pk(script) {
        let key_len = script[0] as usize;
        return Some(ScriptDestination::PubKey(script[1..1 + key_len].to_vec()));
    }
    if let Some((required, pubkeys)) = parse_multisig(script) {
        return Some(ScriptDestination::Multisig { required, pubkeys });
    }
    None
}

pub fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

pub fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

pub fn is_p2pk(script: &[u8]) -> bool {
    let key_len = match script.first().copied() {
        Some(len @ 33) | Some(len @ 65) => len as usize,
        _ => return false,
    };
    script.len() == key_len + 2 && script[script.len() - 1] == OP_CHECKSIG
}

pub fn is_null_data(script: &[u8]) -> bool {
    script.first() == Some(&OP_RETURN)
}

/// `OP_m <pk…> OP_n OP_CHECKMULTISIG` with 1 ≤ m ≤ n ≤ 16.
pub fn parse_multisig(script: &[u8]) -> Option<(usize, Vec<Vec<u8>>)> {
    if script.len() < 4 || script[script.len() - 1] != OP_CHECKMULTISIG {
        return None;
    }
    let required = decode_small_int(script[0])?;
    let total = decode_small_int(script[script.len() - 2])?;
    if required == 0 || required > total || total > 16 {
        return None;
    }
    let mut pubkeys = Vec::with_capacity(total);
    let mut cursor = 1;
    let end = script.len() - 2;
    while cursor < end {
        let len = script[cursor] as usize;
        if !(33..=65).contains(&len) || cursor + 1 + len > end {
            return None;
        }
        pubkeys.push(script[cursor + 1..cursor + 1 + len].to_vec());
        cursor += 1 + len;
    }
    if cursor != end || pubkeys.len() != total {
        return None;
    }
    Some((required, pubkeys))
}

fn decode_small_int(opcode: u8) -> Option<usize> {
    if opcode == OP_0 {
        Some(0)
    } else if (OP_1..=OP_16).contains(&opcode) {
        Some((opcode - OP_1 + 1) as usize)
    } else {
        None
    }
}

fn encode_small_int(value: usize) -> u8 {
    debug_assert!((1..=16).contains(&value));
    OP_1 + (value as u8) - 1
}

/// Minimal-push encoding of a data element.
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => script.push(OP_0),
        len @ 1..=0x4b => {
            script.push(len as u8);
            script.extend_from_slice(data);
        }
        len @ 0x4c..=0xff => {
            script.push(OP_PUSHDATA1);
            script.push(len as u8);
            script.extend_from_slice(data);
        }
        len => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(len as u16).to_le_bytes());
            script.extend_from_slice(data);
        }
    }
}

pub fn p2pkh_script_pubkey(key_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(0x14);
    script.extend_from_slice(key_hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

pub fn p2pk_script_pubkey(pubkey: &PublicKey) -> Vec<u8> {
    let bytes = pubkey.serialize();
    let mut script = Vec::with_capacity(bytes.len() + 2);
    push_data(&mut script, &bytes);
    script.push(OP_CHECKSIG);
    script
}

pub fn p2sh_script_pubkey(script_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.push(OP_HASH160);
    script.push(0x14);
    script.extend_from_slice(script_hash);
    script.push(OP_EQUAL);
    script
}

pub fn p2sh_script_pubkey_for_redeem_script(redeem_script: &[u8]) -> Vec<u8> {
    p2sh_script_pubkey(&hash160(redeem_script))
}

/// `OP_m <pk…> OP_n OP_CHECKMULTISIG` over already-ordered pubkeys.
pub fn multisig_redeem_script(required: usize, pubkeys: &[PublicKey]) -> Vec<u8> {
    let mut script = Vec::new();
    script.push(encode_small_int(required));
    for pubkey in pubkeys {
        push_data(&mut script, &pubkey.serialize());
    }
    script.push(encode_small_int(pubkeys.len()));
    script.push(OP_CHECKMULTISIG);
    script
}

/// `OP_RETURN <"np"> OP_RETURN <narration>` — the zero-value memo output
/// that trails the payment output it describes.
pub fn narration_script(narration: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(narration.len() + 8);
    script.push(OP_RETURN);
    push_data(&mut script, &NARRATION_TAG);
    script.push(OP_RETURN);
    push_data(&mut script, narration);
    script
}

/// `OP_RETURN <ephemeral pubkey> [OP_RETURN <encrypted narration>]` — the
/// marker output a stealth payment carries.
pub fn stealth_metadata_script(ephemeral_pubkey: &[u8; 33], narration: Option<&[u8]>) -> Vec<u8> {
    let mut script = Vec::with_capacity(40);
    script.push(OP_RETURN);
    push_data(&mut script, ephemeral_pubkey);
    if let Some(narr) = narration {
        script.push(OP_RETURN);
        push_data(&mut script, narr);
    }
    script
}

/// Iterator over (opcode, pushed data) pairs of a script.
pub struct ScriptOps<'a> {
    script: &'a [u8],
    cursor: usize,
}

impl<'a> ScriptOps<'a> {
    pub fn new(script: &'a [u8]) -> Self {
        Self { script, cursor: 0 }
    }
}

impl<'a> Iterator for ScriptOps<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.script.len() {
            return None;
        }
        let opcode = self.script[self.cursor];
        self.cursor += 1;
        let len = match opcode {
            1..=0x4b => opcode as usize,
            OP_PUSHDATA1 => {
                let len = *self.script.get(self.cursor)? as usize;
                self.cursor += 1;
                len
            }
            OP_PUSHDATA2 => {
                let bytes = self.script.get(self.cursor..self.cursor + 2)?;
                self.cursor += 2;
                u16::from_le_bytes(bytes.try_into().ok()?) as usize
            }
            _ => 0,
        };
        let data = self.script.get(self.cursor..self.cursor + len)?;
        self.cursor += len;
        Some((opcode, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{Secp256k1, SecretKey};

    fn pubkey(seed: u8) -> PublicKey {
        let secp = Secp256k1::signing_only();
        PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[seed; 32]).expect("secret"))
    }

    #[test]
    fn classify_standard_forms() {
        assert_eq!(
            classify_script_pubkey(&p2pkh_script_pubkey(&[1u8; 20])),
            ScriptType::PubKeyHash
        );
        assert_eq!(
            classify_script_pubkey(&p2sh_script_pubkey(&[2u8; 20])),
            ScriptType::ScriptHash
        );
        assert_eq!(
            classify_script_pubkey(&p2pk_script_pubkey(&pubkey(3))),
            ScriptType::PubKey
        );
        assert_eq!(
            classify_script_pubkey(&narration_script(b"memo")),
            ScriptType::NullData
        );
    }

    #[test]
    fn multisig_round_trip() {
        let keys = vec![pubkey(1), pubkey(2), pubkey(3)];
        let redeem = multisig_redeem_script(2, &keys);
        assert_eq!(classify_script_pubkey(&redeem), ScriptType::Multisig);
        let (required, pubkeys) = parse_multisig(&redeem).expect("parse");
        assert_eq!(required, 2);
        assert_eq!(pubkeys.len(), 3);
        for (parsed, key) in pubkeys.iter().zip(&keys) {
            assert_eq!(parsed.as_slice(), key.serialize().as_slice());
        }
    }

    #[test]
    fn destination_key_hash() {
        let key = pubkey(4);
        let hash = hash160(&key.serialize());
        let dest = extract_destination(&p2pkh_script_pubkey(&hash)).expect("dest");
        assert_eq!(dest.key_hash(), Some(hash));
        let dest = extract_destination(&p2pk_script_pubkey(&key)).expect("dest");
        assert_eq!(dest.key_hash(), Some(hash));
    }

    #[test]
    fn script_ops_walks_narration() {
        let script = narration_script(b"hello");
        let ops: Vec<_> = ScriptOps::new(&script).collect();
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0].0, OP_RETURN);
        assert_eq!(ops[1].1, NARRATION_TAG);
        assert_eq!(ops[2].0, OP_RETURN);
        assert_eq!(ops[3].1, b"hello");
    }
}
