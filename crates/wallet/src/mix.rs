//! The three-party escrow mixer.
//!
//! A sender, a mixer, and a guarantor escrow funds into a 2-of-3 multisig
//! address; a distribution transaction (signed by mixer and guarantor)
//! unwinds the escrow so the mixer is paid to forward the actual payment.
//! Any two parties can move the escrow, so nobody can abscond alone.
//!
//! The status ladder is monotone:
//! none → reserve → init-data → pubkey → ms-addr → deposited →
//! deposits-verified → drafted → signed-once → signed-complete → complete.
//! Every handler checks the expected predecessor status and rejects
//! otherwise; nothing ever advances past a failed verification.

use std::collections::BTreeMap;

use secp256k1::{PublicKey, SecretKey};
use umbra_chain::{ChainView, Mempool, Relay};
use umbra_consensus::{
    constants::{mix_paid_fee, mix_service_fee, MIX_RESET_TIMEOUT},
    Amount, Hash256,
};
use umbra_primitives::address::{
    decode_address, key_hash_to_address, script_hash_to_address, Destination,
};
use umbra_primitives::hash::hash160;
use umbra_primitives::outpoint::OutPoint;
use umbra_primitives::transaction::{Transaction, TxIn, TxOut};
use umbra_script::message::{recover_signed_message_pubkey, sign_message};
use umbra_script::sighash::{SighashType, SIGHASH_ALL};
use umbra_script::standard::{
    extract_destination, multisig_redeem_script, p2sh_script_pubkey_for_redeem_script,
};
use umbra_script::{combine_multisig_signatures, sign_input, verify_input, SigningKeys};
use umbra_storage::KeyValueStore;

use crate::coinselect::{CoinControl, SelectorRng};
use crate::error::WalletError;
use crate::messages::MixMessage;
use crate::wallet::Wallet;
use crate::{current_unix_seconds, hex_str};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MixRole {
    Sender = 0,
    Mixer = 1,
    Guarantor = 2,
}

impl MixRole {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MixRole::Sender),
            1 => Some(MixRole::Mixer),
            2 => Some(MixRole::Guarantor),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MixRole::Sender => "sender",
            MixRole::Mixer => "mixer",
            MixRole::Guarantor => "guarantor",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum MixStatus {
    None,
    Reserve,
    InitData,
    Pubkey,
    MultisigAddr,
    Deposited,
    DepositsVerified,
    DistributionDrafted,
    SignedOnce,
    SignedComplete,
    Complete,
}

impl MixStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MixStatus::None => "none",
            MixStatus::Reserve => "service reserved",
            MixStatus::InitData => "initial data set",
            MixStatus::Pubkey => "all public keys available",
            MixStatus::MultisigAddr => "2-of-3 multisig address created",
            MixStatus::Deposited => "escrow deposits completed",
            MixStatus::DepositsVerified => "escrow deposits verified",
            MixStatus::DistributionDrafted => "distribution transaction created",
            MixStatus::SignedOnce => "distribution transaction signed once",
            MixStatus::SignedComplete => "distribution transaction fully signed",
            MixStatus::Complete => "complete",
        }
    }
}

/// An outbound protocol message and the role it is addressed to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MixOutbound {
    pub to: MixRole,
    pub message: MixMessage,
}

#[derive(Clone, Debug, Default)]
pub struct MixParty {
    pub address: Option<String>,
    pub pubkey: Vec<u8>,
    pub deposit_txid: Option<Hash256>,
    pub deposit_vout: u32,
    pub deposit_script: Vec<u8>,
}

/// Per-instance record of one mix run.
pub struct MixCoordinator {
    pub role: MixRole,
    pub status: MixStatus,
    /// Creator's self address plus its start timestamp.
    pub mix_id: String,
    /// The user-facing payments the mixer will deliver.
    pub targets: Vec<(String, Amount)>,
    pub coin_control: Option<CoinControl>,
    parties: [MixParty; 3],
    pub multisig_address: Option<String>,
    pub redeem_script: Vec<u8>,
    pub distribution_tx: Vec<u8>,
    pub signed_count: u8,
    pub send_txid: Option<Hash256>,
    pub committed_txid: Option<Hash256>,
    pub last_activity: i64,
    pub log: Vec<String>,
}

impl MixCoordinator {
    fn new(role: MixRole, mix_id: String) -> Self {
        Self {
            role,
            status: MixStatus::Reserve,
            mix_id,
            targets: Vec::new(),
            coin_control: None,
            parties: Default::default(),
            multisig_address: None,
            redeem_script: Vec::new(),
            distribution_tx: Vec::new(),
            signed_count: 0,
            send_txid: None,
            committed_txid: None,
            last_activity: current_unix_seconds(),
            log: Vec::new(),
        }
    }

    pub fn party(&self, role: MixRole) -> &MixParty {
        &self.parties[role.index()]
    }

    fn party_mut(&mut self, role: MixRole) -> &mut MixParty {
        self.touch();
        &mut self.parties[role.index()]
    }

    fn touch(&mut self) {
        self.last_activity = current_unix_seconds();
    }

    pub fn add_log(&mut self, text: impl Into<String>) {
        let text = text.into();
        umbra_log::log_debug!("mix[{}]: {text}", self.role.as_str());
        self.log.push(text);
    }

    /// Human-readable history of the run, latest status first.
    pub fn report(&self) -> String {
        let mut out = format!("The status of the current mix: {}.\n\n", self.status.as_str());
        for line in &self.log {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn base_amount(&self) -> Amount {
        self.targets.iter().map(|(_, amount)| amount).sum()
    }

    /// Escrow each role must deposit: the sender over-collateralizes with
    /// twice the base plus the mix fee; mixer and guarantor match the base.
    pub fn required_deposit(&self, role: MixRole) -> Amount {
        let base = self.base_amount();
        match role {
            MixRole::Sender => 2 * base + mix_paid_fee(base),
            MixRole::Mixer | MixRole::Guarantor => base,
        }
    }

    pub fn is_in_process(&self) -> bool {
        !matches!(self.status, MixStatus::None | MixStatus::Complete)
    }

    /// Until escrow is funded there is nothing at stake; an instance idle
    /// past the timeout may be discarded.
    pub fn can_reset(&self, now: i64) -> bool {
        self.status < MixStatus::Deposited && now - self.last_activity > MIX_RESET_TIMEOUT
    }

    fn all_pubkeys_present(&self) -> bool {
        self.parties.iter().all(|party| !party.pubkey.is_empty())
    }

    fn all_deposits_present(&self) -> bool {
        self.parties.iter().all(|party| party.deposit_txid.is_some())
    }

    fn expect_status(&self, expected: MixStatus) -> Result<(), WalletError> {
        if self.status != expected {
            umbra_log::log_warn!(
                "mix message out of order: status {} expected {}",
                self.status.as_str(),
                expected.as_str()
            );
            return Err(WalletError::MixProtocol("mix protocol message out of order"));
        }
        Ok(())
    }

    /// Build the 2-of-3 redeem script and escrow address over the three
    /// party pubkeys (sorted for determinism on all sides).
    fn build_multisig(&mut self, network: umbra_consensus::Network) -> Result<(), WalletError> {
        let mut pubkeys = Vec::with_capacity(3);
        for party in &self.parties {
            let pubkey = PublicKey::from_slice(&party.pubkey)
                .map_err(|_| WalletError::MixProtocol("invalid mix party pubkey"))?;
            pubkeys.push(pubkey);
        }
        pubkeys.sort_by_key(|pubkey| pubkey.serialize());
        let redeem = multisig_redeem_script(2, &pubkeys);
        let script_hash = hash160(&redeem);
        let address = script_hash_to_address(&script_hash, network);
        self.add_log(format!("created 2-of-3 escrow address {address}"));
        self.redeem_script = redeem;
        self.multisig_address = Some(address);
        Ok(())
    }

    fn multisig_script_pubkey(&self) -> Vec<u8> {
        p2sh_script_pubkey_for_redeem_script(&self.redeem_script)
    }

    /// Value a transaction pays to the escrow address.
    fn amount_paid_to_escrow(&self, tx: &Transaction) -> Amount {
        let script = self.multisig_script_pubkey();
        tx.vout
            .iter()
            .filter(|out| out.script_pubkey == script)
            .map(|out| out.value)
            .sum()
    }
}

/// The wallet's single active-mix slot.
pub struct MixSlot {
    current: Option<MixCoordinator>,
}

impl MixSlot {
    pub fn new() -> Self {
        Self { current: None }
    }

    pub fn get(&self) -> Option<&MixCoordinator> {
        self.current.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut MixCoordinator> {
        self.current.as_mut()
    }
}

impl Default for MixSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Signing context for the distribution transaction: one address key plus
/// the escrow redeem script, mirroring a temporary key store.
struct EscrowSigner {
    key_hash: [u8; 20],
    secret: SecretKey,
    compressed: bool,
    redeem_script: Vec<u8>,
}

impl SigningKeys for EscrowSigner {
    fn secret_for_key_hash(&self, key_hash: &[u8; 20]) -> Option<(SecretKey, bool)> {
        (*key_hash == self.key_hash).then_some((self.secret, self.compressed))
    }

    fn redeem_script(&self, script_hash: &[u8; 20]) -> Option<Vec<u8>> {
        (hash160(&self.redeem_script) == *script_hash).then(|| self.redeem_script.clone())
    }
}

impl<S: KeyValueStore> Wallet<S> {
    /// Any owned non-change address, walking change chains back to their
    /// origin; the mix protocol identifies this node by it.
    pub fn self_address<C: KeyValueStore>(
        &mut self,
        chain: &ChainView<C>,
    ) -> Result<Option<String>, WalletError> {
        if let Some(address) = &self.self_address {
            return Ok(Some(address.clone()));
        }
        let coins = self.available_coins(chain, false, None)?;
        for coin in coins {
            let mut txid = coin.txid;
            let mut vout = coin.vout;
            loop {
                let Some(wtx) = self.get_tx(&txid) else {
                    break;
                };
                let Some(out) = wtx.tx.vout.get(vout as usize) else {
                    break;
                };
                if self.is_change(out)
                    && !wtx.tx.vin.is_empty()
                    && self.is_mine_txin(&wtx.tx.vin[0])
                    && self.get_tx(&wtx.tx.vin[0].prevout.hash).is_some()
                {
                    let prevout = wtx.tx.vin[0].prevout;
                    txid = prevout.hash;
                    vout = prevout.index;
                    continue;
                }
                break;
            }
            let Some(wtx) = self.get_tx(&txid) else {
                continue;
            };
            let Some(out) = wtx.tx.vout.get(vout as usize) else {
                continue;
            };
            let Some(dest) = extract_destination(&out.script_pubkey) else {
                continue;
            };
            let Some(key_hash) = dest.key_hash() else {
                continue;
            };
            let address = key_hash_to_address(&key_hash, self.network);
            self.self_address = Some(address.clone());
            return Ok(Some(address));
        }
        Ok(None)
    }

    /// Compressed pubkey behind one of our P2PKH addresses.
    pub fn address_pubkey(&self, address: &str) -> Result<Vec<u8>, WalletError> {
        let Destination::KeyHash(key_hash) =
            decode_address(address, self.network).map_err(|_| WalletError::InvalidAddress)?
        else {
            return Err(WalletError::InvalidAddress);
        };
        self.keystore
            .pubkey_bytes(&key_hash)
            .ok_or(WalletError::NotMine)
    }

    /// Sign `message` with the key behind `address` (compact signature).
    pub fn sign_message_with_address(
        &self,
        address: &str,
        message: &[u8],
    ) -> Result<[u8; 65], WalletError> {
        let Destination::KeyHash(key_hash) =
            decode_address(address, self.network).map_err(|_| WalletError::InvalidAddress)?
        else {
            return Err(WalletError::InvalidAddress);
        };
        let (secret, compressed) = self
            .keystore
            .secret(&key_hash)
            .ok_or(WalletError::UnknownKey)?;
        sign_message(&secret, message, compressed)
            .map_err(|_| WalletError::MixProtocol("message signing failed"))
    }

    /// Verify a compact signature against the key hash of `address`.
    pub fn verify_address_signature(
        &self,
        address: &str,
        signature: &[u8],
        message: &[u8],
    ) -> bool {
        let Ok(Destination::KeyHash(key_hash)) = decode_address(address, self.network) else {
            return false;
        };
        match recover_signed_message_pubkey(signature, message) {
            Ok(pubkey) => hash160(&pubkey) == key_hash,
            Err(_) => false,
        }
    }

    pub fn active_mix(&self) -> Option<&MixCoordinator> {
        self.mix.get()
    }

    pub fn active_mix_mut(&mut self) -> Option<&mut MixCoordinator> {
        self.mix.get_mut()
    }

    /// One mix at a time. A timed-out pre-escrow instance is discarded here.
    pub fn is_mix_in_process(&mut self) -> bool {
        let now = current_unix_seconds();
        if let Some(info) = self.mix.get() {
            if info.is_in_process() {
                if info.can_reset(now) {
                    umbra_log::log_info!("discarding stale mix instance {}", info.mix_id);
                    self.mix.current = None;
                    return false;
                }
                return true;
            }
        }
        false
    }

    pub fn mix_status(&self) -> MixStatus {
        self.mix.get().map(|info| info.status).unwrap_or(MixStatus::None)
    }

    pub fn mix_report(&self) -> String {
        match self.mix.get() {
            Some(info) => info.report(),
            None => "No anonymous transaction info available\n".to_string(),
        }
    }

    // ---- sender ------------------------------------------------------------

    /// Kick off a mix as the sender: pick a mixer from the service
    /// directory, set up the instance, and produce the signed availability
    /// query. Returns the mixer's host and the message to deliver to it.
    pub fn start_mix_send<C: KeyValueStore, R: SelectorRng>(
        &mut self,
        chain: &ChainView<C>,
        rng: &mut R,
        targets: Vec<(String, Amount)>,
        coin_control: Option<CoinControl>,
    ) -> Result<(String, MixMessage), WalletError> {
        if targets.is_empty() || targets.iter().any(|(_, amount)| *amount <= 0) {
            return Err(WalletError::InvalidAmount);
        }
        if self.is_mix_in_process() {
            umbra_log::log_error!("another anonymous tx is already in progress");
            return Err(WalletError::MixInProgress);
        }

        let self_address = self
            .self_address(chain)?
            .ok_or(WalletError::InsufficientFunds)?;
        let self_pubkey = self.address_pubkey(&self_address)?;

        let (mixer_key, mixer_host) = self
            .services
            .select_mixer(rng, Some(self_address.as_str()))
            .ok_or(WalletError::MixProtocol("not enough mix service nodes"))?;

        let mix_id = format!("{self_address}-{}", current_unix_seconds());
        let mut info = MixCoordinator::new(MixRole::Sender, mix_id.clone());
        info.status = MixStatus::InitData;
        info.targets = targets;
        info.coin_control = coin_control;
        info.add_log("self role is set to sender");
        info.add_log(format!("created mix id {mix_id}"));
        let party = info.party_mut(MixRole::Sender);
        party.address = Some(self_address.clone());
        party.pubkey = self_pubkey;
        info.party_mut(MixRole::Mixer).address = Some(mixer_key.clone());
        info.add_log(format!("selected mixer {mixer_key} at {mixer_host}"));

        let base_amount = info.base_amount();
        let signature = self.sign_message_with_address(&self_address, self_address.as_bytes())?;
        let services: BTreeMap<String, String> = self
            .services
            .entries()
            .map(|(key, host)| (key.to_string(), host.to_string()))
            .collect();

        self.mix.current = Some(info);
        Ok((
            mixer_host,
            MixMessage::AvailabilityQuery {
                mix_id,
                sender_address: self_address,
                services,
                base_amount,
                signature: signature.to_vec(),
            },
        ))
    }

    // ---- mixer / guarantor entry points ------------------------------------

    /// Mixer side of `asvcavail`: verify the sender's signature and our own
    /// eligibility, pick a guarantor from the intersection of service
    /// lists, and answer. The guarantor gets the sender's original query
    /// forwarded so it can set up its own instance.
    pub fn handle_availability_query<C: KeyValueStore, R: SelectorRng>(
        &mut self,
        chain: &ChainView<C>,
        rng: &mut R,
        message: &MixMessage,
    ) -> Result<Vec<MixOutbound>, WalletError> {
        let MixMessage::AvailabilityQuery {
            mix_id,
            sender_address,
            services,
            base_amount,
            signature,
        } = message
        else {
            return Err(WalletError::MixProtocol("wrong mix message kind"));
        };
        if !self.verify_address_signature(sender_address, signature, sender_address.as_bytes()) {
            umbra_log::log_warn!("availability query with bad signature from {sender_address}");
            return Err(WalletError::MixProtocol("bad availability signature"));
        }
        if self.is_mix_in_process() {
            return Err(WalletError::MixInProgress);
        }
        if !self.qualifies_as_service_provider(chain)? {
            return Err(WalletError::InsufficientFunds);
        }

        let self_address = self
            .self_address(chain)?
            .ok_or(WalletError::InsufficientFunds)?;
        let self_pubkey = self.address_pubkey(&self_address)?;

        // The guarantor must be visible to both sender and mixer.
        let guarantor_key = self
            .services
            .find_guarantor(rng, services, &[sender_address.as_str(), self_address.as_str()])
            .ok_or(WalletError::MixProtocol("no common guarantor candidate"))?;
        let guarantor_host = self
            .services
            .host_for(&guarantor_key)
            .ok_or(WalletError::MixProtocol("guarantor host missing"))?
            .to_string();

        let mut info = MixCoordinator::new(MixRole::Mixer, mix_id.clone());
        info.status = MixStatus::InitData;
        info.targets = vec![(String::new(), *base_amount)];
        info.add_log("self role is set to mixer");
        info.party_mut(MixRole::Sender).address = Some(sender_address.clone());
        let party = info.party_mut(MixRole::Mixer);
        party.address = Some(self_address.clone());
        party.pubkey = self_pubkey.clone();
        info.party_mut(MixRole::Guarantor).address = Some(guarantor_key.clone());
        info.add_log(format!("selected guarantor {guarantor_key}"));
        self.mix.current = Some(info);

        Ok(vec![
            MixOutbound {
                to: MixRole::Sender,
                message: MixMessage::AvailabilityReply {
                    mix_id: mix_id.clone(),
                    mixer_address: self_address.clone(),
                    mixer_pubkey: self_pubkey.clone(),
                    guarantor_key,
                    guarantor_host,
                },
            },
            MixOutbound {
                to: MixRole::Guarantor,
                message: message.clone(),
            },
            MixOutbound {
                to: MixRole::Guarantor,
                message: MixMessage::PubkeyExchange {
                    mix_id: mix_id.clone(),
                    role: MixRole::Mixer,
                    address: self_address,
                    pubkey: self_pubkey,
                },
            },
        ])
    }

    /// Guarantor side of the forwarded query: set up the instance and
    /// announce our pubkey to both peers.
    pub fn handle_forwarded_query<C: KeyValueStore>(
        &mut self,
        chain: &ChainView<C>,
        message: &MixMessage,
    ) -> Result<Vec<MixOutbound>, WalletError> {
        let MixMessage::AvailabilityQuery {
            mix_id,
            sender_address,
            base_amount,
            signature,
            ..
        } = message
        else {
            return Err(WalletError::MixProtocol("wrong mix message kind"));
        };
        if !self.verify_address_signature(sender_address, signature, sender_address.as_bytes()) {
            return Err(WalletError::MixProtocol("bad availability signature"));
        }
        if self.is_mix_in_process() {
            return Err(WalletError::MixInProgress);
        }
        let self_address = self
            .self_address(chain)?
            .ok_or(WalletError::InsufficientFunds)?;
        let self_pubkey = self.address_pubkey(&self_address)?;

        let mut info = MixCoordinator::new(MixRole::Guarantor, mix_id.clone());
        info.status = MixStatus::InitData;
        info.targets = vec![(String::new(), *base_amount)];
        info.add_log("self role is set to guarantor");
        info.party_mut(MixRole::Sender).address = Some(sender_address.clone());
        let party = info.party_mut(MixRole::Guarantor);
        party.address = Some(self_address.clone());
        party.pubkey = self_pubkey.clone();
        self.mix.current = Some(info);

        let announce = |to| MixOutbound {
            to,
            message: MixMessage::PubkeyExchange {
                mix_id: mix_id.clone(),
                role: MixRole::Guarantor,
                address: self_address.clone(),
                pubkey: self_pubkey.clone(),
            },
        };
        Ok(vec![announce(MixRole::Sender), announce(MixRole::Mixer)])
    }

    /// Sender side of `asvcres`: record the mixer's identity and publish
    /// our pubkey to mixer and guarantor.
    pub fn handle_availability_reply(
        &mut self,
        message: &MixMessage,
    ) -> Result<Vec<MixOutbound>, WalletError> {
        let MixMessage::AvailabilityReply {
            mix_id,
            mixer_address,
            mixer_pubkey,
            guarantor_key,
            ..
        } = message
        else {
            return Err(WalletError::MixProtocol("wrong mix message kind"));
        };
        let info = self
            .mix
            .get_mut()
            .ok_or(WalletError::MixProtocol("no active mix"))?;
        info.expect_status(MixStatus::InitData)?;
        if info.mix_id != *mix_id {
            return Err(WalletError::MixProtocol("mix id mismatch"));
        }
        let party = info.party_mut(MixRole::Mixer);
        party.address = Some(mixer_address.clone());
        party.pubkey = mixer_pubkey.clone();
        info.party_mut(MixRole::Guarantor).address = Some(guarantor_key.clone());
        info.add_log(format!(
            "mixer {mixer_address} accepted; guarantor is {guarantor_key}"
        ));

        let (self_address, self_pubkey) = {
            let party = info.party(MixRole::Sender);
            (
                party.address.clone().expect("sender address set"),
                party.pubkey.clone(),
            )
        };
        let mix_id = info.mix_id.clone();
        let announce = |to| MixOutbound {
            to,
            message: MixMessage::PubkeyExchange {
                mix_id: mix_id.clone(),
                role: MixRole::Sender,
                address: self_address.clone(),
                pubkey: self_pubkey.clone(),
            },
        };
        Ok(vec![announce(MixRole::Mixer), announce(MixRole::Guarantor)])
    }

    /// Record a peer's pubkey. When all three are known the escrow address
    /// is constructed and (for the sender) announced.
    pub fn handle_pubkey_exchange(
        &mut self,
        message: &MixMessage,
    ) -> Result<Vec<MixOutbound>, WalletError> {
        let MixMessage::PubkeyExchange {
            mix_id,
            role,
            address,
            pubkey,
        } = message
        else {
            return Err(WalletError::MixProtocol("wrong mix message kind"));
        };
        let network = self.network;
        let info = self
            .mix
            .get_mut()
            .ok_or(WalletError::MixProtocol("no active mix"))?;
        if info.mix_id != *mix_id {
            return Err(WalletError::MixProtocol("mix id mismatch"));
        }
        if info.status > MixStatus::Pubkey {
            return Err(WalletError::MixProtocol("mix protocol message out of order"));
        }
        let party = info.party_mut(*role);
        party.address = Some(address.clone());
        party.pubkey = pubkey.clone();
        info.add_log(format!("received pubkey for {}", role.as_str()));

        let mut outbound = Vec::new();
        if info.all_pubkeys_present() && info.status < MixStatus::Pubkey {
            info.status = MixStatus::Pubkey;
            info.build_multisig(network)?;
            info.status = MixStatus::MultisigAddr;
            if info.role == MixRole::Sender {
                let message = MixMessage::MultisigAddress {
                    mix_id: info.mix_id.clone(),
                    address: info.multisig_address.clone().expect("just built"),
                    redeem_script: info.redeem_script.clone(),
                };
                outbound.push(MixOutbound {
                    to: MixRole::Mixer,
                    message: message.clone(),
                });
                outbound.push(MixOutbound {
                    to: MixRole::Guarantor,
                    message,
                });
            }
            let redeem = info.redeem_script.clone();
            self.keystore.add_redeem_script(&self.db, redeem)?;
        }
        Ok(outbound)
    }

    /// Cross-check a peer's escrow address against our own construction.
    pub fn handle_multisig_address(&mut self, message: &MixMessage) -> Result<(), WalletError> {
        let MixMessage::MultisigAddress {
            mix_id,
            address,
            redeem_script,
        } = message
        else {
            return Err(WalletError::MixProtocol("wrong mix message kind"));
        };
        let info = self
            .mix
            .get_mut()
            .ok_or(WalletError::MixProtocol("no active mix"))?;
        if info.mix_id != *mix_id {
            return Err(WalletError::MixProtocol("mix id mismatch"));
        }
        info.expect_status(MixStatus::MultisigAddr)?;
        if info.multisig_address.as_deref() != Some(address.as_str())
            || info.redeem_script != *redeem_script
        {
            umbra_log::log_error!("escrow address mismatch for mix {mix_id}");
            return Err(WalletError::MixProtocol("escrow address mismatch"));
        }
        info.add_log("escrow address cross-checked");
        Ok(())
    }

    // ---- deposits ----------------------------------------------------------

    /// Pay this role's escrow deposit and notify the peers.
    pub fn deposit_to_escrow<C: KeyValueStore, R: SelectorRng>(
        &mut self,
        chain: &ChainView<C>,
        mempool: &mut Mempool,
        relay: &dyn Relay,
        rng: &mut R,
    ) -> Result<Vec<MixOutbound>, WalletError> {
        let (mix_id, role, amount, script, coin_control) = {
            let info = self
                .mix
                .get()
                .ok_or(WalletError::MixProtocol("no active mix"))?;
            if info.status < MixStatus::MultisigAddr {
                return Err(WalletError::MixProtocol("escrow address not ready"));
            }
            (
                info.mix_id.clone(),
                info.role,
                info.required_deposit(info.role),
                info.multisig_script_pubkey(),
                info.coin_control.clone(),
            )
        };

        let built =
            self.create_transaction(chain, rng, &[(script, amount)], None, coin_control.as_ref())?;
        let txid = self.commit_transaction(chain, mempool, relay, built)?;

        let info = self.mix.get_mut().expect("active mix");
        let party = info.party_mut(role);
        party.deposit_txid = Some(txid);
        info.add_log(format!("deposited {amount} to escrow in {}", hex_str(&txid[..8])));
        let complete = info.all_deposits_present();
        if complete {
            info.status = MixStatus::Deposited;
        }

        let notice = MixMessage::DepositNotice { mix_id, role, txid };
        let mut outbound: Vec<MixOutbound> = other_roles(role)
            .into_iter()
            .map(|to| MixOutbound {
                to,
                message: notice.clone(),
            })
            .collect();
        // Ours may have been the last deposit outstanding.
        if complete {
            outbound.extend(self.verify_deposits(chain)?);
        }
        Ok(outbound)
    }

    /// Record a peer's deposit txid; when all three are in, verify them.
    pub fn handle_deposit_notice<C: KeyValueStore>(
        &mut self,
        chain: &ChainView<C>,
        message: &MixMessage,
    ) -> Result<Vec<MixOutbound>, WalletError> {
        let MixMessage::DepositNotice { mix_id, role, txid } = message else {
            return Err(WalletError::MixProtocol("wrong mix message kind"));
        };
        {
            let info = self
                .mix
                .get_mut()
                .ok_or(WalletError::MixProtocol("no active mix"))?;
            if info.mix_id != *mix_id {
                return Err(WalletError::MixProtocol("mix id mismatch"));
            }
            if info.status < MixStatus::MultisigAddr || info.status > MixStatus::Deposited {
                return Err(WalletError::MixProtocol("mix protocol message out of order"));
            }
            info.party_mut(*role).deposit_txid = Some(*txid);
            info.add_log(format!("recorded {} deposit", role.as_str()));
            if info.all_deposits_present() {
                info.status = MixStatus::Deposited;
            } else {
                return Ok(Vec::new());
            }
        }
        self.verify_deposits(chain)
    }

    /// Check every deposit pays the escrow at least its required amount.
    /// Only a full pass advances the status.
    pub fn verify_deposits<C: KeyValueStore>(
        &mut self,
        chain: &ChainView<C>,
    ) -> Result<Vec<MixOutbound>, WalletError> {
        let (mix_id, self_role) = {
            let info = self
                .mix
                .get()
                .ok_or(WalletError::MixProtocol("no active mix"))?;
            info.expect_status(MixStatus::Deposited)?;
            (info.mix_id.clone(), info.role)
        };

        for role in [MixRole::Sender, MixRole::Mixer, MixRole::Guarantor] {
            if !self.check_deposit(chain, role)? {
                umbra_log::log_warn!("{} deposit verification failed", role.as_str());
                return Err(WalletError::MixProtocol("escrow deposit verification failed"));
            }
        }

        let info = self.mix.get_mut().expect("active mix");
        info.status = MixStatus::DepositsVerified;
        info.add_log("all escrow deposits verified");
        let targets = info.targets.clone();

        let note = MixMessage::DepositsVerified {
            mix_id: mix_id.clone(),
            role: self_role,
        };
        let mut outbound: Vec<MixOutbound> = other_roles(self_role)
            .into_iter()
            .map(|to| MixOutbound {
                to,
                message: note.clone(),
            })
            .collect();
        // The sender can now hand the mixer its destination list; the
        // guarantor never learns where the payment goes.
        if self_role == MixRole::Sender {
            outbound.push(MixOutbound {
                to: MixRole::Mixer,
                message: MixMessage::SendTargets { mix_id, targets },
            });
        }
        Ok(outbound)
    }

    fn check_deposit<C: KeyValueStore>(
        &self,
        chain: &ChainView<C>,
        role: MixRole,
    ) -> Result<bool, WalletError> {
        let info = self.mix.get().ok_or(WalletError::MixProtocol("no active mix"))?;
        let expected = info.required_deposit(role);
        let Some(txid) = info.party(role).deposit_txid else {
            return Ok(false);
        };

        // Prefer the wallet's copy (it may still be unconfirmed), falling
        // back to the chain index.
        let amount = if let Some(wtx) = self.get_tx(&txid) {
            info.amount_paid_to_escrow(&wtx.tx)
        } else if let Some((tx, _)) = chain.get_transaction(&txid)? {
            info.amount_paid_to_escrow(&tx)
        } else {
            umbra_log::log_debug!("deposit tx {} not found", hex_str(&txid[..8]));
            return Ok(false);
        };
        if amount < expected {
            umbra_log::log_warn!(
                "{} deposited {amount}, expected at least {expected}",
                role.as_str()
            );
            return Ok(false);
        }
        Ok(true)
    }

    // ---- distribution ------------------------------------------------------

    /// Locate the escrow-paying output of a deposit transaction.
    fn extract_deposit_outpoint<C: KeyValueStore>(
        &self,
        chain: &ChainView<C>,
        role: MixRole,
    ) -> Result<(OutPoint, Vec<u8>), WalletError> {
        let info = self.mix.get().ok_or(WalletError::MixProtocol("no active mix"))?;
        let txid = info
            .party(role)
            .deposit_txid
            .ok_or(WalletError::MixProtocol("missing deposit txid"))?;
        let tx = if let Some(wtx) = self.get_tx(&txid) {
            wtx.tx.clone()
        } else {
            chain
                .get_transaction(&txid)?
                .map(|(tx, _)| tx)
                .ok_or(WalletError::MixProtocol("deposit tx not found"))?
        };
        let escrow_script = info.multisig_script_pubkey();
        let expected = info.required_deposit(role);
        let vout = tx
            .vout
            .iter()
            .position(|out| out.script_pubkey == escrow_script && out.value == expected)
            .or_else(|| {
                tx.vout
                    .iter()
                    .position(|out| out.script_pubkey == escrow_script)
            })
            .unwrap_or(0);
        let script = tx.vout[vout].script_pubkey.clone();
        Ok((OutPoint::new(txid, vout as u32), script))
    }

    /// Build the raw distribution transaction: the three escrow outpoints
    /// in, the three role payouts out (sender, mixer, guarantor order).
    pub fn create_distribution_tx<C: KeyValueStore>(
        &mut self,
        chain: &ChainView<C>,
    ) -> Result<Vec<u8>, WalletError> {
        {
            let info = self.mix.get().ok_or(WalletError::MixProtocol("no active mix"))?;
            info.expect_status(MixStatus::DepositsVerified)?;
        }

        let mut outpoints = Vec::with_capacity(3);
        for role in [MixRole::Sender, MixRole::Mixer, MixRole::Guarantor] {
            let (outpoint, script) = self.extract_deposit_outpoint(chain, role)?;
            outpoints.push((role, outpoint, script));
        }

        let network = self.network;
        let info = self.mix.get_mut().expect("active mix");
        let base = info.base_amount();
        let service_fee = mix_service_fee(base);

        let mut tx = Transaction::new(current_unix_seconds() as u32);
        for (role, outpoint, script) in &outpoints {
            tx.vin.push(TxIn::from_outpoint(*outpoint));
            let party = info.party_mut(*role);
            party.deposit_vout = outpoint.index;
            party.deposit_script = script.clone();
        }
        for (role, amount) in [
            (MixRole::Sender, base),
            (MixRole::Mixer, 2 * base + service_fee),
            (MixRole::Guarantor, base + service_fee),
        ] {
            let address = info
                .party(role)
                .address
                .clone()
                .ok_or(WalletError::MixProtocol("mix party address missing"))?;
            let script = umbra_primitives::address::address_to_script_pubkey(&address, network)
                .map_err(|_| WalletError::InvalidAddress)?;
            tx.vout.push(TxOut::new(amount, script));
        }

        let bytes = tx.consensus_encode_to_vec();
        info.distribution_tx = bytes.clone();
        info.signed_count = 0;
        info.status = MixStatus::DistributionDrafted;
        info.add_log("distribution transaction created");
        Ok(bytes)
    }

    /// Add this party's signature to the distribution transaction, merging
    /// with whatever signatures it already carries. The completion flag
    /// must agree with the signature count: incomplete at one, complete at
    /// two.
    pub fn sign_distribution_tx(&mut self) -> Result<Vec<u8>, WalletError> {
        let (self_address, redeem_script, escrow_script, tx_bytes, signed_count) = {
            let info = self.mix.get().ok_or(WalletError::MixProtocol("no active mix"))?;
            if !matches!(
                info.status,
                MixStatus::DepositsVerified | MixStatus::DistributionDrafted | MixStatus::SignedOnce
            ) {
                return Err(WalletError::MixProtocol("mix protocol message out of order"));
            }
            let address = info
                .party(info.role)
                .address
                .clone()
                .ok_or(WalletError::MixProtocol("own address missing"))?;
            (
                address,
                info.redeem_script.clone(),
                info.multisig_script_pubkey(),
                info.distribution_tx.clone(),
                info.signed_count,
            )
        };
        if tx_bytes.is_empty() {
            return Err(WalletError::MixProtocol("no distribution transaction"));
        }

        let Destination::KeyHash(key_hash) =
            decode_address(&self_address, self.network).map_err(|_| WalletError::InvalidAddress)?
        else {
            return Err(WalletError::InvalidAddress);
        };
        let (secret, compressed) = self
            .keystore
            .secret(&key_hash)
            .ok_or(WalletError::WalletLocked)?;
        let signer = EscrowSigner {
            key_hash,
            secret,
            compressed,
            redeem_script: redeem_script.clone(),
        };

        let mut tx = Transaction::consensus_decode_from(&tx_bytes)?;
        let previous_sigs: Vec<Vec<u8>> =
            tx.vin.iter().map(|txin| txin.script_sig.clone()).collect();

        // Every deposit pays the same escrow script, so it is the previous
        // script pubkey for all three inputs.
        let mut complete = true;
        for index in 0..tx.vin.len() {
            let own = sign_input(&signer, &tx, index, &escrow_script, SighashType(SIGHASH_ALL))?;
            let merged = combine_multisig_signatures(
                &redeem_script,
                &tx,
                index,
                &own,
                &previous_sigs[index],
            )?;
            tx.vin[index].script_sig = merged;
            if !verify_input(&tx, index, &escrow_script) {
                complete = false;
            }
        }

        let new_count = signed_count + 1;
        if new_count == 2 && !complete {
            umbra_log::log_error!("two signatures present but escrow spend incomplete");
            return Err(WalletError::MixProtocol("incomplete after second signature"));
        }
        if new_count == 1 && complete {
            umbra_log::log_error!("one signature present but escrow spend already complete");
            return Err(WalletError::MixProtocol("complete after first signature"));
        }

        let bytes = tx.consensus_encode_to_vec();
        let info = self.mix.get_mut().expect("active mix");
        info.distribution_tx = bytes.clone();
        info.signed_count = new_count;
        info.status = if new_count >= 2 {
            MixStatus::SignedComplete
        } else {
            MixStatus::SignedOnce
        };
        info.add_log(format!("distribution transaction signed ({new_count}/2)"));
        Ok(bytes)
    }

    /// Adopt a peer's (partially or fully) signed distribution transaction.
    pub fn handle_distribution_tx(&mut self, message: &MixMessage) -> Result<(), WalletError> {
        let MixMessage::DistributionTx {
            mix_id,
            tx,
            signed_count,
        } = message
        else {
            return Err(WalletError::MixProtocol("wrong mix message kind"));
        };
        let info = self
            .mix
            .get_mut()
            .ok_or(WalletError::MixProtocol("no active mix"))?;
        if info.mix_id != *mix_id {
            return Err(WalletError::MixProtocol("mix id mismatch"));
        }
        if info.status < MixStatus::DepositsVerified || info.status > MixStatus::SignedComplete {
            return Err(WalletError::MixProtocol("mix protocol message out of order"));
        }
        // Sanity: the payload must decode and keep the three-in three-out
        // shape we constructed.
        let decoded = Transaction::consensus_decode_from(tx)?;
        if decoded.vin.len() != 3 || decoded.vout.len() != 3 {
            return Err(WalletError::MixProtocol("malformed distribution transaction"));
        }
        info.distribution_tx = tx.clone();
        info.signed_count = *signed_count;
        info.status = match *signed_count {
            0 => MixStatus::DistributionDrafted,
            1 => MixStatus::SignedOnce,
            _ => MixStatus::SignedComplete,
        };
        info.add_log(format!(
            "adopted distribution transaction signed {signed_count}/2"
        ));
        Ok(())
    }

    /// Broadcast the fully signed distribution transaction.
    pub fn send_distribution_tx<C: KeyValueStore>(
        &mut self,
        chain: &ChainView<C>,
        mempool: &mut Mempool,
        relay: &dyn Relay,
    ) -> Result<Hash256, WalletError> {
        let tx_bytes = {
            let info = self.mix.get().ok_or(WalletError::MixProtocol("no active mix"))?;
            info.expect_status(MixStatus::SignedComplete)?;
            if info.signed_count < 2 {
                return Err(WalletError::MixProtocol("not enough signatures"));
            }
            info.distribution_tx.clone()
        };
        let tx = Transaction::consensus_decode_from(&tx_bytes)?;
        let txid = tx.txid();

        if let Some(entry) = chain.tx_entry(&txid)? {
            umbra_log::log_error!(
                "distribution tx already in block at height {}",
                entry.height
            );
            return Err(WalletError::MixProtocol("distribution tx already mined"));
        }
        if !mempool.contains(&txid) {
            mempool
                .accept(chain, &tx)
                .map_err(WalletError::CommitRejected)?;
        }
        relay.relay_transaction(&tx);

        let info = self.mix.get_mut().expect("active mix");
        info.committed_txid = Some(txid);
        info.status = MixStatus::Complete;
        info.add_log(format!("distribution committed as {}", hex_str(&txid[..8])));
        Ok(txid)
    }

    /// Peer confirmation that the distribution went out.
    pub fn handle_distribution_committed(
        &mut self,
        message: &MixMessage,
    ) -> Result<(), WalletError> {
        let MixMessage::DistributionCommitted { mix_id, txid } = message else {
            return Err(WalletError::MixProtocol("wrong mix message kind"));
        };
        let info = self
            .mix
            .get_mut()
            .ok_or(WalletError::MixProtocol("no active mix"))?;
        if info.mix_id != *mix_id {
            return Err(WalletError::MixProtocol("mix id mismatch"));
        }
        info.committed_txid = Some(*txid);
        info.status = MixStatus::Complete;
        info.add_log("distribution transaction confirmed by peer");
        Ok(())
    }

    // ---- payment delivery --------------------------------------------------

    /// Mixer side: adopt the sender's destination list.
    pub fn handle_send_targets(&mut self, message: &MixMessage) -> Result<(), WalletError> {
        let MixMessage::SendTargets { mix_id, targets } = message else {
            return Err(WalletError::MixProtocol("wrong mix message kind"));
        };
        let info = self
            .mix
            .get_mut()
            .ok_or(WalletError::MixProtocol("no active mix"))?;
        if info.mix_id != *mix_id {
            return Err(WalletError::MixProtocol("mix id mismatch"));
        }
        if info.role != MixRole::Mixer {
            return Err(WalletError::MixProtocol("only the mixer delivers payments"));
        }
        if targets.is_empty() || targets.iter().any(|(_, amount)| *amount <= 0) {
            return Err(WalletError::MixProtocol("invalid destination list"));
        }
        // The declared total must match the base amount the escrow was
        // sized for.
        let declared: Amount = targets.iter().map(|(_, amount)| amount).sum();
        if declared != info.base_amount() {
            return Err(WalletError::MixProtocol("destination total mismatch"));
        }
        info.targets = targets.clone();
        info.add_log("received destination list");
        Ok(())
    }

    /// Mixer side: deliver the user-facing payments to the sender's
    /// declared destinations and announce the txid.
    pub fn send_coins_to_destination<C: KeyValueStore, R: SelectorRng>(
        &mut self,
        chain: &ChainView<C>,
        mempool: &mut Mempool,
        relay: &dyn Relay,
        rng: &mut R,
    ) -> Result<(Hash256, MixOutbound), WalletError> {
        let (mix_id, targets) = {
            let info = self.mix.get().ok_or(WalletError::MixProtocol("no active mix"))?;
            if info.role != MixRole::Mixer {
                return Err(WalletError::MixProtocol("only the mixer delivers payments"));
            }
            if info.targets.iter().any(|(address, _)| address.is_empty()) {
                return Err(WalletError::MixProtocol("destination list not received"));
            }
            (info.mix_id.clone(), info.targets.clone())
        };
        let mut payees = Vec::with_capacity(targets.len());
        for (address, amount) in &targets {
            let script = umbra_primitives::address::address_to_script_pubkey(address, self.network)
                .map_err(|_| WalletError::InvalidAddress)?;
            payees.push((script, *amount));
        }
        let built = self.create_transaction(chain, rng, &payees, None, None)?;
        let txid = self.commit_transaction(chain, mempool, relay, built)?;

        let info = self.mix.get_mut().expect("active mix");
        info.send_txid = Some(txid);
        info.add_log(format!("delivered payment in {}", hex_str(&txid[..8])));
        Ok((
            txid,
            MixOutbound {
                to: MixRole::Sender,
                message: MixMessage::SendTxNotice { mix_id, txid },
            },
        ))
    }

    /// Sender side: verify the mixer's payment covers the base amount.
    pub fn check_send_tx<C: KeyValueStore>(
        &mut self,
        chain: &ChainView<C>,
        message: &MixMessage,
    ) -> Result<bool, WalletError> {
        let MixMessage::SendTxNotice { mix_id, txid } = message else {
            return Err(WalletError::MixProtocol("wrong mix message kind"));
        };
        let (base, targets) = {
            let info = self.mix.get().ok_or(WalletError::MixProtocol("no active mix"))?;
            if info.mix_id != *mix_id {
                return Err(WalletError::MixProtocol("mix id mismatch"));
            }
            (info.base_amount(), info.targets.clone())
        };

        let tx = if let Some(wtx) = self.get_tx(txid) {
            Some(wtx.tx.clone())
        } else {
            chain.get_transaction(txid)?.map(|(tx, _)| tx)
        };
        let Some(tx) = tx else {
            umbra_log::log_debug!("send tx {} not found yet", hex_str(&txid[..8]));
            return Ok(false);
        };

        let mut paid: Amount = 0;
        for (address, _) in &targets {
            let Ok(script) =
                umbra_primitives::address::address_to_script_pubkey(address, self.network)
            else {
                continue;
            };
            paid += tx
                .vout
                .iter()
                .filter(|out| out.script_pubkey == script)
                .map(|out| out.value)
                .sum::<Amount>();
        }
        if paid < base {
            umbra_log::log_warn!("mixer paid {paid}, expected at least {base}");
            return Ok(false);
        }
        let info = self.mix.get_mut().expect("active mix");
        info.send_txid = Some(*txid);
        info.add_log("mixer payment verified");
        Ok(true)
    }
}

fn other_roles(role: MixRole) -> [MixRole; 2] {
    match role {
        MixRole::Sender => [MixRole::Mixer, MixRole::Guarantor],
        MixRole::Mixer => [MixRole::Sender, MixRole::Guarantor],
        MixRole::Guarantor => [MixRole::Sender, MixRole::Mixer],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_consensus::{CENT, COIN, MIN_TX_FEE};

    fn coordinator_with_base(base: Amount) -> MixCoordinator {
        let mut info = MixCoordinator::new(MixRole::Sender, "addr-100".into());
        info.targets = vec![("dest".into(), base)];
        info
    }

    #[test]
    fn deposit_requirements() {
        let info = coordinator_with_base(10 * COIN);
        let fee = mix_paid_fee(10 * COIN);
        assert_eq!(fee, COIN / 10);
        assert_eq!(info.required_deposit(MixRole::Sender), 20 * COIN + fee);
        assert_eq!(info.required_deposit(MixRole::Mixer), 10 * COIN);
        assert_eq!(info.required_deposit(MixRole::Guarantor), 10 * COIN);
    }

    #[test]
    fn distribution_totals_balance_against_deposits() {
        // Outputs total deposits minus the reserved miner fee.
        let base = 10 * COIN;
        let fee = mix_paid_fee(base);
        let service_fee = mix_service_fee(base);
        let outputs = base + (2 * base + service_fee) + (base + service_fee);
        let deposits = (2 * base + fee) + base + base;
        assert_eq!(outputs, deposits - 5 * MIN_TX_FEE);
    }

    #[test]
    fn small_base_uses_minimum_fee() {
        let base = 20 * CENT;
        assert_eq!(mix_paid_fee(base), CENT);
        assert_eq!(mix_service_fee(base), (CENT - 5 * MIN_TX_FEE) / 2);
    }

    #[test]
    fn status_ladder_is_ordered() {
        assert!(MixStatus::None < MixStatus::Reserve);
        assert!(MixStatus::Reserve < MixStatus::InitData);
        assert!(MixStatus::InitData < MixStatus::Pubkey);
        assert!(MixStatus::Pubkey < MixStatus::MultisigAddr);
        assert!(MixStatus::MultisigAddr < MixStatus::Deposited);
        assert!(MixStatus::Deposited < MixStatus::DepositsVerified);
        assert!(MixStatus::DepositsVerified < MixStatus::DistributionDrafted);
        assert!(MixStatus::DistributionDrafted < MixStatus::SignedOnce);
        assert!(MixStatus::SignedOnce < MixStatus::SignedComplete);
        assert!(MixStatus::SignedComplete < MixStatus::Complete);
    }

    #[test]
    fn reset_only_before_escrow_and_after_timeout() {
        let mut info = coordinator_with_base(COIN);
        info.status = MixStatus::InitData;
        let now = info.last_activity;
        assert!(!info.can_reset(now + 10));
        assert!(info.can_reset(now + MIX_RESET_TIMEOUT + 1));
        // Once funds are escrowed there is no reset path.
        info.status = MixStatus::Deposited;
        assert!(!info.can_reset(now + MIX_RESET_TIMEOUT + 1));
    }

    #[test]
    fn out_of_order_message_rejected() {
        let mut info = coordinator_with_base(COIN);
        info.status = MixStatus::InitData;
        assert!(info.expect_status(MixStatus::Deposited).is_err());
        assert!(info.expect_status(MixStatus::InitData).is_ok());
    }
}
