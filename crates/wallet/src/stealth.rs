//! The stealth directory: owned scan/spend pairs, payment derivation,
//! transaction scanning, and deferred key expansion for locked wallets.
//!
//! Sending to `(Qs, Qp)`: pick ephemeral `e`, publish `E = e·G`, derive
//! `c = H(e·Qs)` and pay to `H160(Qp + c·G)`. The receiver recomputes `c`
//! from the scan secret and `E`; on a match the one-time spend key is
//! `spend_secret + c (mod n)`.

use std::collections::BTreeMap;

use secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};
use umbra_primitives::address::key_hash_to_address;
use umbra_primitives::hash::{hash160, sha256};
use umbra_primitives::stealth::StealthAddress;
use umbra_primitives::transaction::Transaction;
use umbra_script::standard::{
    extract_destination, ScriptDestination, ScriptOps, NARRATION_TAG, OP_RETURN,
};
use umbra_storage::KeyValueStore;

use crate::db::{StealthAddressRecord, StealthKeyMetaRecord, WalletDb};
use crate::error::WalletError;
use crate::keystore::{decrypt_secret, encrypt_secret, secret_nonce};
use crate::wallet::Wallet;
use crate::hex_str;

/// Ciphertext cap for an encrypted narration output.
pub const MAX_ENCRYPTED_NARRATION: usize = 48;

#[derive(Clone)]
pub(crate) enum SpendSecret {
    Plain(SecretKey),
    Crypted(Vec<u8>),
    Watch,
}

#[derive(Clone)]
pub(crate) struct OwnedStealthAddress {
    pub label: String,
    pub scan_pubkey: PublicKey,
    pub spend_pubkey: PublicKey,
    pub scan_secret: Option<SecretKey>,
    pub spend_secret: SpendSecret,
}

impl OwnedStealthAddress {
    pub fn is_owned(&self) -> bool {
        self.scan_secret.is_some()
    }

    fn to_record(&self) -> StealthAddressRecord {
        StealthAddressRecord {
            label: self.label.clone(),
            scan_pubkey: self.scan_pubkey.serialize().to_vec(),
            spend_pubkey: self.spend_pubkey.serialize().to_vec(),
            scan_secret: self
                .scan_secret
                .map(|secret| secret.secret_bytes().to_vec())
                .unwrap_or_default(),
            spend_secret: match &self.spend_secret {
                SpendSecret::Plain(secret) => secret.secret_bytes().to_vec(),
                SpendSecret::Crypted(ciphertext) => ciphertext.clone(),
                SpendSecret::Watch => Vec::new(),
            },
        }
    }

    pub fn public(&self) -> StealthAddress {
        StealthAddress {
            scan_pubkey: self.scan_pubkey,
            spend_pubkey: self.spend_pubkey,
        }
    }
}

/// Owned and watched stealth addresses, keyed by spend pubkey so that label
/// updates and secret encryption never move an entry.
pub struct StealthDirectory {
    addresses: BTreeMap<[u8; 33], OwnedStealthAddress>,
    /// Matches discovered while locked: key hash → (ephemeral, scan) pair
    /// to expand at the next unlock.
    pending: BTreeMap<[u8; 20], StealthKeyMetaRecord>,
}

impl Default for StealthDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl StealthDirectory {
    pub fn new() -> Self {
        Self {
            addresses: BTreeMap::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn load<S: KeyValueStore>(&mut self, db: &WalletDb<S>) -> Result<(), WalletError> {
        for record in db.load_stealth_addresses()? {
            let Ok(scan_pubkey) = PublicKey::from_slice(&record.scan_pubkey) else {
                return Err(WalletError::Corrupted("sxaddr record with invalid scan key"));
            };
            let Ok(spend_pubkey) = PublicKey::from_slice(&record.spend_pubkey) else {
                return Err(WalletError::Corrupted("sxaddr record with invalid spend key"));
            };
            let scan_secret = if record.scan_secret.len() == 32 {
                SecretKey::from_slice(&record.scan_secret).ok()
            } else {
                None
            };
            let spend_secret = if record.spend_secret.is_empty() {
                SpendSecret::Watch
            } else if record.spend_secret.len() == 32 {
                match SecretKey::from_slice(&record.spend_secret) {
                    Ok(secret) => SpendSecret::Plain(secret),
                    Err(_) => {
                        return Err(WalletError::Corrupted(
                            "sxaddr record with invalid spend secret",
                        ))
                    }
                }
            } else {
                SpendSecret::Crypted(record.spend_secret.clone())
            };
            self.addresses.insert(
                spend_pubkey.serialize(),
                OwnedStealthAddress {
                    label: record.label,
                    scan_pubkey,
                    spend_pubkey,
                    scan_secret,
                    spend_secret,
                },
            );
        }
        for (key_hash, record) in db.load_stealth_key_metas()? {
            self.pending.insert(key_hash, record);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &OwnedStealthAddress> {
        self.addresses.values()
    }

    pub fn public_addresses(&self) -> Vec<StealthAddress> {
        self.addresses.values().map(OwnedStealthAddress::public).collect()
    }

    fn get_mut_by_spend(&mut self, spend_pubkey: &PublicKey) -> Option<&mut OwnedStealthAddress> {
        self.addresses.get_mut(&spend_pubkey.serialize())
    }

    /// Stage every stealth record into `batch` for the wallet rewrite.
    pub(crate) fn persist_records(&self, batch: &mut umbra_storage::WriteBatch) {
        use umbra_primitives::encoding::encode;
        for entry in self.addresses.values() {
            let record = entry.to_record();
            batch.put(
                umbra_storage::Column::StealthAddress,
                record.spend_pubkey.clone(),
                encode(&record),
            );
        }
        for (key_hash, meta) in &self.pending {
            batch.put(umbra_storage::Column::StealthKeyMeta, *key_hash, encode(meta));
        }
    }
}

// ---- derivation ------------------------------------------------------------

/// `H(secret·P)` on the compressed shared point.
pub fn shared_secret_hash(secret: &SecretKey, point: &PublicKey) -> Result<[u8; 32], WalletError> {
    let secp = Secp256k1::new();
    let scalar = Scalar::from(*secret);
    let shared = point
        .mul_tweak(&secp, &scalar)
        .map_err(|_| WalletError::InvalidSecretKey)?;
    Ok(sha256(&shared.serialize()))
}

/// Destination pubkey the sender derives: `Qp + c·G`.
pub fn derive_payment_pubkey(
    spend_pubkey: &PublicKey,
    shared: &[u8; 32],
) -> Result<PublicKey, WalletError> {
    let secp = Secp256k1::new();
    let tweak = SecretKey::from_slice(shared).map_err(|_| WalletError::InvalidSecretKey)?;
    let tweak_point = PublicKey::from_secret_key(&secp, &tweak);
    spend_pubkey
        .combine(&tweak_point)
        .map_err(|_| WalletError::InvalidSecretKey)
}

/// One-time spend key the receiver reconstructs: `spend_secret + c`.
pub fn derive_payment_secret(
    spend_secret: &SecretKey,
    shared: &[u8; 32],
) -> Result<SecretKey, WalletError> {
    let scalar = Scalar::from_be_bytes(*shared).map_err(|_| WalletError::InvalidSecretKey)?;
    spend_secret
        .add_tweak(&scalar)
        .map_err(|_| WalletError::InvalidSecretKey)
}

fn narration_cipher_key(shared: &[u8; 32]) -> [u8; 32] {
    sha256(shared)
}

fn narration_nonce(ephemeral_pubkey: &[u8]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&ephemeral_pubkey[..12]);
    nonce
}

pub fn encrypt_narration(
    shared: &[u8; 32],
    ephemeral_pubkey: &[u8; 33],
    narration: &str,
) -> Vec<u8> {
    encrypt_secret(
        &narration_cipher_key(shared),
        narration.as_bytes(),
        &narration_nonce(ephemeral_pubkey),
    )
}

pub fn decrypt_narration(
    shared: &[u8; 32],
    ephemeral_pubkey: &[u8],
    ciphertext: &[u8],
) -> Option<String> {
    if ephemeral_pubkey.len() < 12 {
        return None;
    }
    let plain = decrypt_secret(
        &narration_cipher_key(shared),
        ciphertext,
        &narration_nonce(ephemeral_pubkey),
    )?;
    String::from_utf8(plain).ok()
}

/// A sender-side derived payment: everything needed to build the outputs.
pub struct StealthPayment {
    pub destination_key_hash: [u8; 20],
    pub ephemeral_pubkey: [u8; 33],
    pub shared: [u8; 32],
}

/// Derive a fresh one-time destination for `address`.
pub fn prepare_stealth_payment(address: &StealthAddress) -> Result<StealthPayment, WalletError> {
    let secp = Secp256k1::new();
    let (ephemeral_secret, ephemeral_pubkey) = secp.generate_keypair(&mut rand::rngs::OsRng);
    let shared = shared_secret_hash(&ephemeral_secret, &address.scan_pubkey)?;
    let payment_pubkey = derive_payment_pubkey(&address.spend_pubkey, &shared)?;
    Ok(StealthPayment {
        destination_key_hash: hash160(&payment_pubkey.serialize()),
        ephemeral_pubkey: ephemeral_pubkey.serialize(),
        shared,
    })
}

// ---- wallet-level operations ----------------------------------------------

impl<S: KeyValueStore> Wallet<S> {
    /// Mint a new owned stealth address and persist it. The wallet must be
    /// unlocked; on an encrypted wallet the spend secret is stored as
    /// ciphertext under the master key.
    pub fn new_stealth_address(&mut self, label: &str) -> Result<String, WalletError> {
        if self.keystore.is_locked() {
            return Err(WalletError::WalletLocked);
        }
        let secp = Secp256k1::new();
        let (scan_secret, scan_pubkey) = secp.generate_keypair(&mut rand::rngs::OsRng);
        let (spend_secret, spend_pubkey) = secp.generate_keypair(&mut rand::rngs::OsRng);

        let spend_stored = if self.keystore.is_crypted() {
            let master = *self
                .keystore
                .unlocked_master()
                .ok_or(WalletError::WalletLocked)?;
            SpendSecret::Crypted(encrypt_secret(
                &master,
                &spend_secret.secret_bytes(),
                &secret_nonce(&spend_pubkey.serialize()),
            ))
        } else {
            SpendSecret::Plain(spend_secret)
        };

        let entry = OwnedStealthAddress {
            label: label.to_string(),
            scan_pubkey,
            spend_pubkey,
            scan_secret: Some(scan_secret),
            spend_secret: spend_stored,
        };
        self.db.write_stealth_address(&entry.to_record())?;
        let encoded = entry.public().encode(self.network);
        self.stealth
            .addresses
            .insert(spend_pubkey.serialize(), entry);
        umbra_log::log_info!("new stealth address {encoded}");
        Ok(encoded)
    }

    /// Record a third-party stealth address (send-to bookkeeping only).
    pub fn import_stealth_address(
        &mut self,
        encoded: &str,
        label: &str,
    ) -> Result<(), WalletError> {
        let address = StealthAddress::decode(encoded, self.network)
            .map_err(|_| WalletError::InvalidAddress)?;
        let entry = OwnedStealthAddress {
            label: label.to_string(),
            scan_pubkey: address.scan_pubkey,
            spend_pubkey: address.spend_pubkey,
            scan_secret: None,
            spend_secret: SpendSecret::Watch,
        };
        self.db.write_stealth_address(&entry.to_record())?;
        self.stealth
            .addresses
            .insert(address.spend_pubkey.serialize(), entry);
        Ok(())
    }

    /// Relabel a stealth address; optionally create a watch entry when it
    /// is unknown.
    pub fn update_stealth_address(
        &mut self,
        encoded: &str,
        label: &str,
        add_if_missing: bool,
    ) -> Result<(), WalletError> {
        let address = StealthAddress::decode(encoded, self.network)
            .map_err(|_| WalletError::InvalidAddress)?;
        match self.stealth.get_mut_by_spend(&address.spend_pubkey) {
            Some(entry) => {
                if entry.label == label {
                    return Ok(());
                }
                entry.label = label.to_string();
                let record = entry.to_record();
                self.db.write_stealth_address(&record)?;
                Ok(())
            }
            None if add_if_missing => self.import_stealth_address(encoded, label),
            None => Err(WalletError::InvalidAddress),
        }
    }

    /// Build and commit a payment to a stealth address. The metadata output
    /// (ephemeral pubkey, optionally an encrypted narration) directly
    /// follows the value output so scanners can pair them.
    #[allow(clippy::too_many_arguments)]
    pub fn send_to_stealth_destination<C: KeyValueStore, R: crate::coinselect::SelectorRng>(
        &mut self,
        chain: &umbra_chain::ChainView<C>,
        mempool: &mut umbra_chain::Mempool,
        relay: &dyn umbra_chain::Relay,
        rng: &mut R,
        encoded: &str,
        amount: umbra_consensus::Amount,
        narration: Option<&str>,
    ) -> Result<umbra_consensus::Hash256, WalletError> {
        if amount <= 0 {
            return Err(WalletError::InvalidAmount);
        }
        if amount + self.pay_tx_fee > self.balance(chain)? {
            return Err(WalletError::InsufficientFunds);
        }
        if self.keystore.is_locked() {
            return Err(WalletError::WalletLocked);
        }
        if self.keystore.unlock_staking_only {
            return Err(WalletError::UnlockedForStakingOnly);
        }
        let address = StealthAddress::decode(encoded, self.network)
            .map_err(|_| WalletError::InvalidAddress)?;
        let payment = prepare_stealth_payment(&address)?;

        let encrypted_narration = match narration {
            Some(narration) if !narration.is_empty() => {
                if narration.len() > crate::builder::MAX_NARRATION_LENGTH {
                    return Err(WalletError::NarrationTooLong);
                }
                let ciphertext =
                    encrypt_narration(&payment.shared, &payment.ephemeral_pubkey, narration);
                if ciphertext.len() > MAX_ENCRYPTED_NARRATION {
                    return Err(WalletError::NarrationTooLong);
                }
                Some(ciphertext)
            }
            _ => None,
        };

        let value_script =
            umbra_script::standard::p2pkh_script_pubkey(&payment.destination_key_hash);
        let metadata_script = umbra_script::standard::stealth_metadata_script(
            &payment.ephemeral_pubkey,
            encrypted_narration.as_deref(),
        );
        let payees = vec![(value_script, amount), (metadata_script, 0)];

        let built = self.create_transaction(chain, rng, &payees, None, None)?;
        self.commit_transaction(chain, mempool, relay, built)
    }

    /// Scan one transaction for stealth payments and narrations. Returns
    /// narration map entries (`n_<vout>` → text); ownership side effects
    /// (key insertion or pending metadata) happen as matches are found.
    /// Failures on individual outputs are logged and skipped.
    pub fn scan_tx_for_stealth(
        &mut self,
        tx: &Transaction,
    ) -> Result<BTreeMap<String, String>, WalletError> {
        let mut narrations = BTreeMap::new();
        for (outer_index, txout) in tx.vout.iter().enumerate() {
            let mut ops = ScriptOps::new(&txout.script_pubkey);
            let Some((first_op, _)) = ops.next() else {
                continue;
            };
            if first_op != OP_RETURN {
                continue;
            }
            let Some((_, tag)) = ops.next() else {
                continue;
            };

            if tag.len() != 33 {
                // Plaintext narration: OP_RETURN "np" OP_RETURN <narr>,
                // annotating the preceding value output.
                if tag == NARRATION_TAG {
                    match (ops.next(), ops.next()) {
                        (Some((OP_RETURN, _)), Some((_, narr))) if !narr.is_empty() => {
                            if let Ok(text) = String::from_utf8(narr.to_vec()) {
                                if outer_index > 0 {
                                    narrations
                                        .insert(format!("n_{}", outer_index - 1), text);
                                }
                            }
                        }
                        _ => {
                            umbra_log::log_warn!(
                                "could not extract plaintext narration from tx {}",
                                hex_str(&tx.txid()[..5])
                            );
                        }
                    }
                }
                continue;
            }

            let ephemeral_bytes = tag.to_vec();
            let encrypted_narr = match (ops.next(), ops.next()) {
                (Some((OP_RETURN, _)), Some((_, data))) if !data.is_empty() => {
                    Some(data.to_vec())
                }
                _ => None,
            };
            let Ok(ephemeral_pubkey) = PublicKey::from_slice(&ephemeral_bytes) else {
                continue;
            };

            // Pair this metadata output against every candidate value
            // output; only one transaction output can match an ephemeral.
            'outputs: for (inner_index, candidate) in tx.vout.iter().enumerate() {
                if inner_index == outer_index {
                    continue;
                }
                let Some(ScriptDestination::KeyHash(key_hash)) =
                    extract_destination(&candidate.script_pubkey)
                else {
                    continue;
                };
                if self.keystore.have_key(&key_hash) {
                    continue;
                }

                let owned: Vec<(PublicKey, PublicKey, SecretKey)> = self
                    .stealth
                    .entries()
                    .filter(|entry| entry.is_owned())
                    .map(|entry| {
                        (
                            entry.scan_pubkey,
                            entry.spend_pubkey,
                            entry.scan_secret.expect("owned"),
                        )
                    })
                    .collect();

                for (scan_pubkey, spend_pubkey, scan_secret) in owned {
                    let shared = match shared_secret_hash(&scan_secret, &ephemeral_pubkey) {
                        Ok(shared) => shared,
                        Err(_) => {
                            umbra_log::log_warn!("stealth shared-secret derivation failed");
                            continue;
                        }
                    };
                    let derived = match derive_payment_pubkey(&spend_pubkey, &shared) {
                        Ok(derived) => derived,
                        Err(_) => continue,
                    };
                    if hash160(&derived.serialize()) != key_hash {
                        continue;
                    }

                    let entry_encoded = StealthAddress {
                        scan_pubkey,
                        spend_pubkey,
                    }
                    .encode(self.network);
                    umbra_log::log_debug!("found stealth txn to {entry_encoded}");

                    if self.keystore.is_locked() {
                        // Cannot derive the spend secret now; remember the
                        // pair so unlock can.
                        self.keystore
                            .add_watch_pubkey(&self.db, derived.serialize().to_vec())?;
                        let meta = StealthKeyMetaRecord {
                            ephemeral_pubkey: ephemeral_bytes.clone(),
                            scan_pubkey: scan_pubkey.serialize().to_vec(),
                        };
                        self.db.write_stealth_key_meta(&key_hash, &meta)?;
                        self.stealth.pending.insert(key_hash, meta);
                        let address = key_hash_to_address(&key_hash, self.network);
                        self.set_address_label(&address, &entry_encoded)?;
                    } else {
                        let spend_secret = match self.stealth_spend_secret(&spend_pubkey)? {
                            Some(secret) => secret,
                            None => continue,
                        };
                        let one_time = derive_payment_secret(&spend_secret, &shared)?;
                        let check = PublicKey::from_secret_key(&Secp256k1::new(), &one_time);
                        if check != derived {
                            umbra_log::log_warn!("reconstructed stealth key mismatch");
                            continue;
                        }
                        self.keystore.add_key(&self.db, &one_time, true)?;
                        let address = key_hash_to_address(&key_hash, self.network);
                        self.set_address_label(&address, &entry_encoded)?;
                    }

                    if let Some(ciphertext) = &encrypted_narr {
                        match decrypt_narration(&shared, &ephemeral_bytes, ciphertext) {
                            Some(text) => {
                                narrations.insert(format!("n_{inner_index}"), text);
                            }
                            None => {
                                umbra_log::log_warn!("narration decryption failed");
                            }
                        }
                    }
                    break 'outputs;
                }
            }
        }
        Ok(narrations)
    }

    /// Plaintext spend secret for one of our stealth addresses, decrypting
    /// through the master key when needed.
    fn stealth_spend_secret(
        &self,
        spend_pubkey: &PublicKey,
    ) -> Result<Option<SecretKey>, WalletError> {
        let Some(entry) = self.stealth.addresses.get(&spend_pubkey.serialize()) else {
            return Ok(None);
        };
        match &entry.spend_secret {
            SpendSecret::Plain(secret) => Ok(Some(*secret)),
            SpendSecret::Crypted(ciphertext) => {
                let Some(master) = self.keystore.unlocked_master() else {
                    return Err(WalletError::WalletLocked);
                };
                let plain = decrypt_secret(
                    master,
                    ciphertext,
                    &secret_nonce(&spend_pubkey.serialize()),
                )
                .ok_or(WalletError::Corrupted("undecryptable stealth spend secret"))?;
                let secret = SecretKey::from_slice(&plain)
                    .map_err(|_| WalletError::Corrupted("invalid stealth spend secret"))?;
                // The decrypt must reproduce the advertised spend pubkey.
                let check = PublicKey::from_secret_key(&Secp256k1::new(), &secret);
                if check != *spend_pubkey {
                    return Err(WalletError::Corrupted("stealth spend secret mismatch"));
                }
                Ok(Some(secret))
            }
            SpendSecret::Watch => Ok(None),
        }
    }

    /// Expand every pending stealth match into a concrete key. Runs after
    /// unlock; individual failures are logged and left pending.
    pub(crate) fn expand_locked_stealth_keys(&mut self) -> Result<usize, WalletError> {
        let pending: Vec<([u8; 20], StealthKeyMetaRecord)> = self
            .stealth
            .pending
            .iter()
            .map(|(key_hash, meta)| (*key_hash, meta.clone()))
            .collect();
        let mut expanded = 0;
        for (key_hash, meta) in pending {
            let Ok(ephemeral_pubkey) = PublicKey::from_slice(&meta.ephemeral_pubkey) else {
                umbra_log::log_warn!("pending stealth meta with invalid ephemeral key");
                continue;
            };
            let Ok(scan_pubkey) = PublicKey::from_slice(&meta.scan_pubkey) else {
                umbra_log::log_warn!("pending stealth meta with invalid scan key");
                continue;
            };
            let Some(entry) = self
                .stealth
                .entries()
                .find(|entry| entry.is_owned() && entry.scan_pubkey == scan_pubkey)
                .map(|entry| (entry.spend_pubkey, entry.scan_secret.expect("owned")))
            else {
                umbra_log::log_warn!(
                    "no stealth address found to expand key {}",
                    hex_str(&key_hash)
                );
                continue;
            };
            let (spend_pubkey, scan_secret) = entry;
            let Some(spend_secret) = self.stealth_spend_secret(&spend_pubkey)? else {
                continue;
            };
            let shared = shared_secret_hash(&scan_secret, &ephemeral_pubkey)?;
            let one_time = derive_payment_secret(&spend_secret, &shared)?;
            let derived = PublicKey::from_secret_key(&Secp256k1::new(), &one_time);
            if hash160(&derived.serialize()) != key_hash {
                umbra_log::log_warn!("expanded stealth key does not match stored hash");
                continue;
            }
            self.keystore.add_key(&self.db, &one_time, true)?;
            self.db.erase_stealth_key_meta(&key_hash)?;
            self.stealth.pending.remove(&key_hash);
            expanded += 1;
        }
        if expanded > 0 {
            umbra_log::log_info!("expanded {expanded} stealth key(s) on unlock");
        }
        Ok(expanded)
    }

    /// Encrypt owned stealth spend secrets under the (unlocked) master key
    /// and rewrite their records. Part of wallet encryption.
    pub(crate) fn encrypt_stealth_secrets(&mut self) -> Result<(), WalletError> {
        let master = *self
            .keystore
            .unlocked_master()
            .ok_or(WalletError::WalletLocked)?;
        let spend_keys: Vec<[u8; 33]> = self.stealth.addresses.keys().copied().collect();
        for spend_key in spend_keys {
            let entry = self.stealth.addresses.get_mut(&spend_key).expect("present");
            if !entry.is_owned() {
                continue;
            }
            if let SpendSecret::Plain(secret) = entry.spend_secret {
                entry.spend_secret = SpendSecret::Crypted(encrypt_secret(
                    &master,
                    &secret.secret_bytes(),
                    &secret_nonce(&spend_key),
                ));
                let record = entry.to_record();
                self.db.write_stealth_address(&record)?;
            }
        }
        Ok(())
    }

    /// Check that every crypted stealth spend secret decrypts under the
    /// freshly unlocked master key. Secrets stay ciphertext at rest and are
    /// decrypted on demand; this only surfaces corruption early.
    pub(crate) fn unlock_stealth_secrets(&mut self) -> Result<(), WalletError> {
        let master = *self
            .keystore
            .unlocked_master()
            .ok_or(WalletError::WalletLocked)?;
        for (spend_key, entry) in self.stealth.addresses.iter() {
            if !entry.is_owned() {
                continue;
            }
            if let SpendSecret::Crypted(ciphertext) = &entry.spend_secret {
                let Some(plain) = decrypt_secret(&master, ciphertext, &secret_nonce(spend_key))
                else {
                    umbra_log::log_error!("failed decrypting stealth key");
                    continue;
                };
                match SecretKey::from_slice(&plain) {
                    Ok(secret) => {
                        let check = PublicKey::from_secret_key(&Secp256k1::new(), &secret);
                        if check != entry.spend_pubkey {
                            umbra_log::log_error!(
                                "decrypted stealth key does not match spend pubkey"
                            );
                        }
                    }
                    Err(_) => {
                        umbra_log::log_error!("decrypted stealth key is invalid");
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_and_receiver_agree() {
        let secp = Secp256k1::new();
        let (scan_secret, scan_pubkey) = secp.generate_keypair(&mut rand::rngs::OsRng);
        let (spend_secret, spend_pubkey) = secp.generate_keypair(&mut rand::rngs::OsRng);
        let address = StealthAddress {
            scan_pubkey,
            spend_pubkey,
        };

        let payment = prepare_stealth_payment(&address).expect("derive");

        // Receiver recomputes the shared secret from the scan key and the
        // published ephemeral.
        let ephemeral = PublicKey::from_slice(&payment.ephemeral_pubkey).expect("ephemeral");
        let shared = shared_secret_hash(&scan_secret, &ephemeral).expect("shared");
        assert_eq!(shared, payment.shared);

        let derived = derive_payment_pubkey(&spend_pubkey, &shared).expect("pubkey");
        assert_eq!(hash160(&derived.serialize()), payment.destination_key_hash);

        // And the reconstructed secret matches that pubkey.
        let one_time = derive_payment_secret(&spend_secret, &shared).expect("secret");
        assert_eq!(PublicKey::from_secret_key(&secp, &one_time), derived);
    }

    #[test]
    fn distinct_ephemerals_give_distinct_destinations() {
        let secp = Secp256k1::new();
        let (_, scan_pubkey) = secp.generate_keypair(&mut rand::rngs::OsRng);
        let (_, spend_pubkey) = secp.generate_keypair(&mut rand::rngs::OsRng);
        let address = StealthAddress {
            scan_pubkey,
            spend_pubkey,
        };
        let a = prepare_stealth_payment(&address).expect("a");
        let b = prepare_stealth_payment(&address).expect("b");
        assert_ne!(a.destination_key_hash, b.destination_key_hash);
    }

    #[test]
    fn narration_round_trip() {
        let shared = [7u8; 32];
        let ephemeral = [2u8; 33];
        let ciphertext = encrypt_narration(&shared, &ephemeral, "for the boat");
        assert!(ciphertext.len() <= MAX_ENCRYPTED_NARRATION);
        let text = decrypt_narration(&shared, &ephemeral, &ciphertext).expect("decrypt");
        assert_eq!(text, "for the boat");
        // Wrong shared secret fails cleanly.
        assert!(decrypt_narration(&[8u8; 32], &ephemeral, &ciphertext).is_none());
    }
}
