//! Wire envelopes for the mix protocol.
//!
//! Transport is out of scope here; envelopes encode with the consensus
//! codec and the node layer frames them. Each variant drives exactly one
//! state-machine step in [`crate::mix`].

use std::collections::BTreeMap;

use umbra_consensus::{Amount, Hash256};
use umbra_primitives::encoding::{
    Decodable, DecodeError, Decoder, Encodable, Encoder,
};

use crate::mix::MixRole;

fn write_role(encoder: &mut Encoder, role: MixRole) {
    encoder.write_u8(role as u8);
}

fn read_role(decoder: &mut Decoder) -> Result<MixRole, DecodeError> {
    MixRole::from_u8(decoder.read_u8()?)
        .ok_or(DecodeError::InvalidData("unknown mix role"))
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MixMessage {
    /// Peer advertises (or withdraws) mix-service availability.
    ServiceAdvert {
        key_address: String,
        available: bool,
    },
    /// Sender asks a prospective mixer whether it can serve, shipping its
    /// own service list for the guarantor intersection and a compact
    /// signature over the sender address.
    AvailabilityQuery {
        mix_id: String,
        sender_address: String,
        services: BTreeMap<String, String>,
        base_amount: Amount,
        signature: Vec<u8>,
    },
    /// Mixer accepts, naming itself and the chosen guarantor.
    AvailabilityReply {
        mix_id: String,
        mixer_address: String,
        mixer_pubkey: Vec<u8>,
        guarantor_key: String,
        guarantor_host: String,
    },
    /// A party publishes its address and pubkey for the escrow.
    PubkeyExchange {
        mix_id: String,
        role: MixRole,
        address: String,
        pubkey: Vec<u8>,
    },
    /// The 2-of-3 address and redeem script; receivers verify against their
    /// own construction.
    MultisigAddress {
        mix_id: String,
        address: String,
        redeem_script: Vec<u8>,
    },
    /// A party reports its escrow deposit.
    DepositNotice {
        mix_id: String,
        role: MixRole,
        txid: Hash256,
    },
    /// A party has verified all three deposits.
    DepositsVerified { mix_id: String, role: MixRole },
    /// The distribution transaction, signed `signed_count` times so far.
    DistributionTx {
        mix_id: String,
        tx: Vec<u8>,
        signed_count: u8,
    },
    /// The fully signed distribution transaction has been broadcast.
    DistributionCommitted { mix_id: String, txid: Hash256 },
    /// The mixer's user-facing payment went out; the sender verifies it.
    SendTxNotice { mix_id: String, txid: Hash256 },
    /// Sender hands the mixer its destination list once escrow is verified.
    /// The guarantor never sees this.
    SendTargets {
        mix_id: String,
        targets: Vec<(String, Amount)>,
    },
}

impl MixMessage {
    /// Wire command name, in the style of the p2p layer.
    pub fn kind(&self) -> &'static str {
        match self {
            MixMessage::ServiceAdvert { .. } => "mixservice",
            MixMessage::AvailabilityQuery { .. } => "asvcavail",
            MixMessage::AvailabilityReply { .. } => "asvcres",
            MixMessage::PubkeyExchange { .. } => "mixpubkey",
            MixMessage::MultisigAddress { .. } => "msaddr",
            MixMessage::DepositNotice { .. } => "msdepo",
            MixMessage::DepositsVerified { .. } => "msdepv",
            MixMessage::DistributionTx { .. } => "mstxr",
            MixMessage::DistributionCommitted { .. } => "msdone",
            MixMessage::SendTxNotice { .. } => "sendtx",
            MixMessage::SendTargets { .. } => "sendinfo",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            MixMessage::ServiceAdvert { .. } => 0,
            MixMessage::AvailabilityQuery { .. } => 1,
            MixMessage::AvailabilityReply { .. } => 2,
            MixMessage::PubkeyExchange { .. } => 3,
            MixMessage::MultisigAddress { .. } => 4,
            MixMessage::DepositNotice { .. } => 5,
            MixMessage::DepositsVerified { .. } => 6,
            MixMessage::DistributionTx { .. } => 7,
            MixMessage::DistributionCommitted { .. } => 8,
            MixMessage::SendTxNotice { .. } => 9,
            MixMessage::SendTargets { .. } => 10,
        }
    }
}

impl Encodable for MixMessage {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.tag());
        match self {
            MixMessage::ServiceAdvert {
                key_address,
                available,
            } => {
                encoder.write_var_str(key_address);
                encoder.write_bool(*available);
            }
            MixMessage::AvailabilityQuery {
                mix_id,
                sender_address,
                services,
                base_amount,
                signature,
            } => {
                encoder.write_var_str(mix_id);
                encoder.write_var_str(sender_address);
                encoder.write_compact_size(services.len() as u64);
                for (key, host) in services {
                    encoder.write_var_str(key);
                    encoder.write_var_str(host);
                }
                encoder.write_i64_le(*base_amount);
                encoder.write_var_bytes(signature);
            }
            MixMessage::AvailabilityReply {
                mix_id,
                mixer_address,
                mixer_pubkey,
                guarantor_key,
                guarantor_host,
            } => {
                encoder.write_var_str(mix_id);
                encoder.write_var_str(mixer_address);
                encoder.write_var_bytes(mixer_pubkey);
                encoder.write_var_str(guarantor_key);
                encoder.write_var_str(guarantor_host);
            }
            MixMessage::PubkeyExchange {
                mix_id,
                role,
                address,
                pubkey,
            } => {
                encoder.write_var_str(mix_id);
                write_role(encoder, *role);
                encoder.write_var_str(address);
                encoder.write_var_bytes(pubkey);
            }
            MixMessage::MultisigAddress {
                mix_id,
                address,
                redeem_script,
            } => {
                encoder.write_var_str(mix_id);
                encoder.write_var_str(address);
                encoder.write_var_bytes(redeem_script);
            }
            MixMessage::DepositNotice { mix_id, role, txid } => {
                encoder.write_var_str(mix_id);
                write_role(encoder, *role);
                encoder.write_hash(txid);
            }
            MixMessage::DepositsVerified { mix_id, role } => {
                encoder.write_var_str(mix_id);
                write_role(encoder, *role);
            }
            MixMessage::DistributionTx {
                mix_id,
                tx,
                signed_count,
            } => {
                encoder.write_var_str(mix_id);
                encoder.write_var_bytes(tx);
                encoder.write_u8(*signed_count);
            }
            MixMessage::DistributionCommitted { mix_id, txid } => {
                encoder.write_var_str(mix_id);
                encoder.write_hash(txid);
            }
            MixMessage::SendTxNotice { mix_id, txid } => {
                encoder.write_var_str(mix_id);
                encoder.write_hash(txid);
            }
            MixMessage::SendTargets { mix_id, targets } => {
                encoder.write_var_str(mix_id);
                encoder.write_compact_size(targets.len() as u64);
                for (address, amount) in targets {
                    encoder.write_var_str(address);
                    encoder.write_i64_le(*amount);
                }
            }
        }
    }
}

impl Decodable for MixMessage {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let tag = decoder.read_u8()?;
        Ok(match tag {
            0 => MixMessage::ServiceAdvert {
                key_address: decoder.read_var_str()?,
                available: decoder.read_bool()?,
            },
            1 => {
                let mix_id = decoder.read_var_str()?;
                let sender_address = decoder.read_var_str()?;
                let count = decoder.read_compact_size()? as usize;
                let mut services = BTreeMap::new();
                for _ in 0..count {
                    let key = decoder.read_var_str()?;
                    let host = decoder.read_var_str()?;
                    services.insert(key, host);
                }
                MixMessage::AvailabilityQuery {
                    mix_id,
                    sender_address,
                    services,
                    base_amount: decoder.read_i64_le()?,
                    signature: decoder.read_var_bytes()?,
                }
            }
            2 => MixMessage::AvailabilityReply {
                mix_id: decoder.read_var_str()?,
                mixer_address: decoder.read_var_str()?,
                mixer_pubkey: decoder.read_var_bytes()?,
                guarantor_key: decoder.read_var_str()?,
                guarantor_host: decoder.read_var_str()?,
            },
            3 => MixMessage::PubkeyExchange {
                mix_id: decoder.read_var_str()?,
                role: read_role(decoder)?,
                address: decoder.read_var_str()?,
                pubkey: decoder.read_var_bytes()?,
            },
            4 => MixMessage::MultisigAddress {
                mix_id: decoder.read_var_str()?,
                address: decoder.read_var_str()?,
                redeem_script: decoder.read_var_bytes()?,
            },
            5 => MixMessage::DepositNotice {
                mix_id: decoder.read_var_str()?,
                role: read_role(decoder)?,
                txid: decoder.read_hash()?,
            },
            6 => MixMessage::DepositsVerified {
                mix_id: decoder.read_var_str()?,
                role: read_role(decoder)?,
            },
            7 => MixMessage::DistributionTx {
                mix_id: decoder.read_var_str()?,
                tx: decoder.read_var_bytes()?,
                signed_count: decoder.read_u8()?,
            },
            8 => MixMessage::DistributionCommitted {
                mix_id: decoder.read_var_str()?,
                txid: decoder.read_hash()?,
            },
            9 => MixMessage::SendTxNotice {
                mix_id: decoder.read_var_str()?,
                txid: decoder.read_hash()?,
            },
            10 => {
                let mix_id = decoder.read_var_str()?;
                let count = decoder.read_compact_size()? as usize;
                let mut targets = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let address = decoder.read_var_str()?;
                    let amount = decoder.read_i64_le()?;
                    targets.push((address, amount));
                }
                MixMessage::SendTargets { mix_id, targets }
            }
            _ => return Err(DecodeError::InvalidData("unknown mix message tag")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_primitives::encoding::{decode, encode};

    #[test]
    fn envelope_round_trips() {
        let mut services = BTreeMap::new();
        services.insert("key1".to_string(), "one.onion".to_string());
        let samples = vec![
            MixMessage::ServiceAdvert {
                key_address: "UkQx".into(),
                available: true,
            },
            MixMessage::AvailabilityQuery {
                mix_id: "UkQx-170000".into(),
                sender_address: "UkQx".into(),
                services,
                base_amount: 10_000,
                signature: vec![1, 2, 3],
            },
            MixMessage::DepositNotice {
                mix_id: "m".into(),
                role: MixRole::Guarantor,
                txid: [9u8; 32],
            },
            MixMessage::DistributionTx {
                mix_id: "m".into(),
                tx: vec![0xab; 40],
                signed_count: 1,
            },
        ];
        for message in samples {
            let bytes = encode(&message);
            let decoded: MixMessage = decode(&bytes).expect("decode");
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn kinds_are_distinct() {
        let kinds = [
            MixMessage::ServiceAdvert {
                key_address: String::new(),
                available: false,
            }
            .kind(),
            MixMessage::SendTxNotice {
                mix_id: String::new(),
                txid: [0u8; 32],
            }
            .kind(),
        ];
        assert_ne!(kinds[0], kinds[1]);
    }
}
