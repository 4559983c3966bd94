//! Spend keys, redeem scripts, and wallet encryption.
//!
//! Unencrypted wallets keep plaintext secrets in `key` records. Encrypting
//! generates a random 32-byte master key, wraps it per passphrase in `mkey`
//! records (calibrated iterated-SHA-512 KDF), and re-stores every secret as
//! a `ckey` ciphertext under the master key with a nonce derived from the
//! owning pubkey. Locking simply forgets the master key and every plaintext
//! secret.

use std::collections::BTreeMap;
use std::time::Instant;

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::RngCore;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha512};
use umbra_consensus::Network;
use umbra_primitives::address::secret_key_to_wif;
use umbra_primitives::hash::{hash160, sha256d};
use umbra_script::SigningKeys;
use umbra_storage::{Column, KeyValueStore, WriteBatch};
use zeroize::Zeroize;

use crate::db::{CryptedKeyRecord, KeyRecord, MasterKeyRecord, WalletDb};
use crate::error::WalletError;
use crate::{current_unix_seconds, hex_str};

pub const MIN_KDF_ITERATIONS: u32 = 25_000;
pub const KDF_ID_SHA512_ITER: u8 = 1;
const KDF_SALT_BYTES: usize = 16;
const KDF_TARGET_MILLIS: u64 = 100;

#[derive(Clone)]
struct StoredKey {
    pubkey_bytes: Vec<u8>,
    compressed: bool,
    secret: Option<[u8; 32]>,
    crypted_secret: Option<Vec<u8>>,
}

pub struct KeyStore {
    keys: BTreeMap<[u8; 20], StoredKey>,
    redeem_scripts: BTreeMap<[u8; 20], Vec<u8>>,
    master_keys: BTreeMap<u32, MasterKeyRecord>,
    key_create_times: BTreeMap<[u8; 20], i64>,
    /// Earliest key birth; bounds chain rescans.
    pub time_first_key: i64,
    unlocked_master: Option<[u8; 32]>,
    /// Unlocked, but only the staking path may sign.
    pub unlock_staking_only: bool,
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore {
    pub fn new() -> Self {
        Self {
            keys: BTreeMap::new(),
            redeem_scripts: BTreeMap::new(),
            master_keys: BTreeMap::new(),
            key_create_times: BTreeMap::new(),
            time_first_key: 0,
            unlocked_master: None,
            unlock_staking_only: false,
        }
    }

    pub fn load<S: KeyValueStore>(&mut self, db: &WalletDb<S>) -> Result<(), WalletError> {
        for (key_hash, record) in db.load_keys()? {
            self.keys.insert(
                key_hash,
                StoredKey {
                    pubkey_bytes: record.pubkey,
                    compressed: record.compressed,
                    secret: Some(record.secret),
                    crypted_secret: None,
                },
            );
        }
        for (key_hash, record) in db.load_crypted_keys()? {
            let compressed = record.pubkey.len() == 33;
            self.keys.insert(
                key_hash,
                StoredKey {
                    pubkey_bytes: record.pubkey,
                    compressed,
                    secret: None,
                    crypted_secret: Some(record.crypted_secret),
                },
            );
        }
        for (id, record) in db.load_master_keys()? {
            self.master_keys.insert(id, record);
        }
        for (key_hash, create_time) in db.load_key_metas()? {
            self.note_birth_time(create_time);
            self.key_create_times.insert(key_hash, create_time);
        }
        for (script_hash, script) in db.load_redeem_scripts()? {
            self.redeem_scripts.insert(script_hash, script);
        }
        Ok(())
    }

    fn note_birth_time(&mut self, create_time: i64) {
        if create_time != 0 && (self.time_first_key == 0 || create_time < self.time_first_key) {
            self.time_first_key = create_time;
        }
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn is_crypted(&self) -> bool {
        !self.master_keys.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.is_crypted() && self.unlocked_master.is_none()
    }

    pub fn key_create_time(&self, key_hash: &[u8; 20]) -> Option<i64> {
        self.key_create_times.get(key_hash).copied()
    }

    /// Generate a fresh key, persist it, and return its pubkey.
    pub fn generate_key<S: KeyValueStore>(
        &mut self,
        db: &WalletDb<S>,
        compressed: bool,
    ) -> Result<PublicKey, WalletError> {
        if self.is_locked() {
            return Err(WalletError::WalletLocked);
        }
        let secp = Secp256k1::new();
        let (secret, pubkey) = secp.generate_keypair(&mut rand::rngs::OsRng);
        let now = current_unix_seconds();
        let key_hash = self.insert_key(db, &secret, &pubkey, compressed)?;
        db.write_key_meta(&key_hash, now)?;
        self.note_birth_time(now);
        self.key_create_times.insert(key_hash, now);
        Ok(pubkey)
    }

    /// Add a known private key (imports, stealth expansion).
    pub fn add_key<S: KeyValueStore>(
        &mut self,
        db: &WalletDb<S>,
        secret: &SecretKey,
        compressed: bool,
    ) -> Result<[u8; 20], WalletError> {
        let secp = Secp256k1::new();
        let pubkey = PublicKey::from_secret_key(&secp, secret);
        let key_hash = self.insert_key(db, secret, &pubkey, compressed)?;
        let now = current_unix_seconds();
        db.write_key_meta(&key_hash, now)?;
        self.note_birth_time(now);
        self.key_create_times.entry(key_hash).or_insert(now);
        Ok(key_hash)
    }

    fn insert_key<S: KeyValueStore>(
        &mut self,
        db: &WalletDb<S>,
        secret: &SecretKey,
        pubkey: &PublicKey,
        compressed: bool,
    ) -> Result<[u8; 20], WalletError> {
        let pubkey_bytes = if compressed {
            pubkey.serialize().to_vec()
        } else {
            pubkey.serialize_uncompressed().to_vec()
        };
        let key_hash = hash160(&pubkey_bytes);
        let secret_bytes = secret.secret_bytes();

        if self.is_crypted() {
            let master = self.unlocked_master.ok_or(WalletError::WalletLocked)?;
            let crypted = encrypt_secret(&master, &secret_bytes, &secret_nonce(&pubkey_bytes));
            db.write_crypted_key(
                &key_hash,
                &CryptedKeyRecord {
                    pubkey: pubkey_bytes.clone(),
                    crypted_secret: crypted.clone(),
                },
            )?;
            self.keys.insert(
                key_hash,
                StoredKey {
                    pubkey_bytes,
                    compressed,
                    secret: Some(secret_bytes),
                    crypted_secret: Some(crypted),
                },
            );
        } else {
            db.write_key(
                &key_hash,
                &KeyRecord {
                    pubkey: pubkey_bytes.clone(),
                    secret: secret_bytes,
                    compressed,
                },
            )?;
            self.keys.insert(
                key_hash,
                StoredKey {
                    pubkey_bytes,
                    compressed,
                    secret: Some(secret_bytes),
                    crypted_secret: None,
                },
            );
        }
        Ok(key_hash)
    }

    /// Register a pubkey with no secret yet: a stealth match found while
    /// locked. The secret is expanded on the next unlock.
    pub fn add_watch_pubkey<S: KeyValueStore>(
        &mut self,
        db: &WalletDb<S>,
        pubkey_bytes: Vec<u8>,
    ) -> Result<[u8; 20], WalletError> {
        let key_hash = hash160(&pubkey_bytes);
        db.write_crypted_key(
            &key_hash,
            &CryptedKeyRecord {
                pubkey: pubkey_bytes.clone(),
                crypted_secret: Vec::new(),
            },
        )?;
        let compressed = pubkey_bytes.len() == 33;
        self.keys.insert(
            key_hash,
            StoredKey {
                pubkey_bytes,
                compressed,
                secret: None,
                crypted_secret: Some(Vec::new()),
            },
        );
        Ok(key_hash)
    }

    pub fn have_key(&self, key_hash: &[u8; 20]) -> bool {
        self.keys.contains_key(key_hash)
    }

    pub fn key_hashes(&self) -> Vec<[u8; 20]> {
        self.keys.keys().copied().collect()
    }

    pub fn pubkey_bytes(&self, key_hash: &[u8; 20]) -> Option<Vec<u8>> {
        self.keys.get(key_hash).map(|key| key.pubkey_bytes.clone())
    }

    pub fn secret(&self, key_hash: &[u8; 20]) -> Option<(SecretKey, bool)> {
        let key = self.keys.get(key_hash)?;
        let secret = key.secret.as_ref()?;
        SecretKey::from_slice(secret)
            .ok()
            .map(|secret| (secret, key.compressed))
    }

    pub fn privkey_wif(&self, key_hash: &[u8; 20], network: Network) -> Option<String> {
        let key = self.keys.get(key_hash)?;
        let secret = key.secret.as_ref()?;
        Some(secret_key_to_wif(secret, network, key.compressed))
    }

    pub fn add_redeem_script<S: KeyValueStore>(
        &mut self,
        db: &WalletDb<S>,
        redeem_script: Vec<u8>,
    ) -> Result<[u8; 20], WalletError> {
        let script_hash = hash160(&redeem_script);
        db.write_redeem_script(&script_hash, &redeem_script)?;
        self.redeem_scripts.insert(script_hash, redeem_script);
        Ok(script_hash)
    }

    pub fn have_redeem_script(&self, script_hash: &[u8; 20]) -> bool {
        self.redeem_scripts.contains_key(script_hash)
    }

    pub fn redeem_script_for(&self, script_hash: &[u8; 20]) -> Option<&[u8]> {
        self.redeem_scripts.get(script_hash).map(Vec::as_slice)
    }

    pub fn lock(&mut self) {
        if let Some(master) = self.unlocked_master.as_mut() {
            master.zeroize();
        }
        self.unlocked_master = None;
        self.unlock_staking_only = false;
        if self.is_crypted() {
            for key in self.keys.values_mut() {
                if key.crypted_secret.is_some() {
                    if let Some(secret) = key.secret.as_mut() {
                        secret.zeroize();
                    }
                    key.secret = None;
                }
            }
        }
    }

    /// Try each master-key record with the passphrase. On success every
    /// ciphertext key is decrypted back into memory. Wrong passphrase leaves
    /// the store untouched.
    pub fn unlock(&mut self, passphrase: &str) -> Result<(), WalletError> {
        if !self.is_crypted() {
            return Err(WalletError::WalletNotEncrypted);
        }
        for record in self.master_keys.values() {
            let mut derived = derive_kdf_key(passphrase, &record.salt, record.iterations);
            let Some(master) = decrypt_secret_exact(
                &derived,
                &record.crypted_key,
                &secret_nonce(&record.salt),
            ) else {
                derived.zeroize();
                continue;
            };
            derived.zeroize();

            let mut decrypted: Vec<([u8; 20], [u8; 32])> = Vec::new();
            for (key_hash, key) in &self.keys {
                let Some(ciphertext) = key.crypted_secret.as_ref() else {
                    continue;
                };
                if ciphertext.is_empty() {
                    // Stealth placeholder, expanded separately.
                    continue;
                }
                let Some(secret) = decrypt_secret_exact(
                    &master,
                    ciphertext,
                    &secret_nonce(&key.pubkey_bytes),
                ) else {
                    umbra_log::log_error!(
                        "failed to decrypt key {} with accepted master key",
                        hex_str(key_hash)
                    );
                    return Err(WalletError::Corrupted("undecryptable key record"));
                };
                decrypted.push((*key_hash, secret));
            }
            for (key_hash, secret) in decrypted {
                if let Some(key) = self.keys.get_mut(&key_hash) {
                    key.secret = Some(secret);
                }
            }
            self.unlocked_master = Some(master);
            return Ok(());
        }
        Err(WalletError::IncorrectPassphrase)
    }

    /// First-time encryption. All record changes are staged into one batch
    /// so a failure part-way leaves the stored wallet unencrypted.
    pub fn encrypt<S: KeyValueStore>(
        &mut self,
        db: &WalletDb<S>,
        passphrase: &str,
    ) -> Result<(), WalletError> {
        if self.is_crypted() {
            return Err(WalletError::WalletAlreadyEncrypted);
        }

        let mut master = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut master);
        let mut salt = vec![0u8; KDF_SALT_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        let iterations = calibrate_iterations(passphrase, &salt);
        umbra_log::log_info!("encrypting wallet with {iterations} KDF iterations");
        let mut derived = derive_kdf_key(passphrase, &salt, iterations);
        let crypted_master = encrypt_secret(&derived, &master, &secret_nonce(&salt));
        derived.zeroize();

        let record = MasterKeyRecord {
            crypted_key: crypted_master,
            salt,
            iterations,
            kdf_id: KDF_ID_SHA512_ITER,
        };

        let mut batch = WriteBatch::new();
        batch.put(
            Column::MasterKey,
            1u32.to_be_bytes(),
            umbra_primitives::encoding::encode(&record),
        );
        for (key_hash, key) in &self.keys {
            let secret = key
                .secret
                .ok_or(WalletError::Corrupted("key without secret before encryption"))?;
            let crypted = encrypt_secret(&master, &secret, &secret_nonce(&key.pubkey_bytes));
            batch.put(
                Column::CryptedKey,
                *key_hash,
                umbra_primitives::encoding::encode(&CryptedKeyRecord {
                    pubkey: key.pubkey_bytes.clone(),
                    crypted_secret: crypted,
                }),
            );
            batch.delete(Column::Key, *key_hash);
        }
        db.apply_batch(batch)?;

        for key in self.keys.values_mut() {
            let secret = key.secret.expect("checked above");
            key.crypted_secret = Some(encrypt_secret(
                &master,
                &secret,
                &secret_nonce(&key.pubkey_bytes),
            ));
        }
        self.master_keys.insert(1, record);
        self.unlocked_master = Some(master);
        Ok(())
    }

    /// Re-wrap the master key under a new passphrase with freshly calibrated
    /// iterations. The keys themselves are untouched.
    pub fn change_passphrase<S: KeyValueStore>(
        &mut self,
        db: &WalletDb<S>,
        old_passphrase: &str,
        new_passphrase: &str,
    ) -> Result<(), WalletError> {
        if !self.is_crypted() {
            return Err(WalletError::WalletNotEncrypted);
        }
        let was_locked = self.is_locked();

        let mut updated: Option<(u32, MasterKeyRecord)> = None;
        for (id, record) in &self.master_keys {
            let mut derived = derive_kdf_key(old_passphrase, &record.salt, record.iterations);
            let master = decrypt_secret_exact(
                &derived,
                &record.crypted_key,
                &secret_nonce(&record.salt),
            );
            derived.zeroize();
            let Some(mut master) = master else {
                continue;
            };

            let mut salt = vec![0u8; KDF_SALT_BYTES];
            rand::rngs::OsRng.fill_bytes(&mut salt);
            let iterations = calibrate_iterations(new_passphrase, &salt);
            umbra_log::log_info!("wallet passphrase changed to {iterations} KDF iterations");
            let mut derived = derive_kdf_key(new_passphrase, &salt, iterations);
            let crypted_key = encrypt_secret(&derived, &master, &secret_nonce(&salt));
            derived.zeroize();
            master.zeroize();

            updated = Some((
                *id,
                MasterKeyRecord {
                    crypted_key,
                    salt,
                    iterations,
                    kdf_id: KDF_ID_SHA512_ITER,
                },
            ));
            break;
        }

        let (id, record) = updated.ok_or(WalletError::IncorrectPassphrase)?;
        db.write_master_key(id, &record)?;
        self.master_keys.insert(id, record);
        if was_locked {
            self.lock();
        }
        Ok(())
    }

    /// The master keying material, for sibling stores (stealth secrets are
    /// encrypted under the same master key).
    pub(crate) fn unlocked_master(&self) -> Option<&[u8; 32]> {
        self.unlocked_master.as_ref()
    }

    /// Stage every key-store record into `batch`. The post-encryption
    /// rewrite rebuilds the whole wallet store from these.
    pub(crate) fn persist_records(&self, batch: &mut WriteBatch) -> Result<(), WalletError> {
        use umbra_primitives::encoding::encode;

        for (id, record) in &self.master_keys {
            batch.put(Column::MasterKey, id.to_be_bytes(), encode(record));
        }
        for (key_hash, key) in &self.keys {
            if self.is_crypted() {
                let crypted_secret = key
                    .crypted_secret
                    .clone()
                    .ok_or(WalletError::Corrupted("unencrypted key in encrypted wallet"))?;
                batch.put(
                    Column::CryptedKey,
                    *key_hash,
                    encode(&CryptedKeyRecord {
                        pubkey: key.pubkey_bytes.clone(),
                        crypted_secret,
                    }),
                );
            } else {
                let secret = key
                    .secret
                    .ok_or(WalletError::Corrupted("key without secret material"))?;
                batch.put(
                    Column::Key,
                    *key_hash,
                    encode(&KeyRecord {
                        pubkey: key.pubkey_bytes.clone(),
                        secret,
                        compressed: key.compressed,
                    }),
                );
            }
        }
        for (key_hash, create_time) in &self.key_create_times {
            batch.put(Column::KeyMeta, *key_hash, create_time.to_le_bytes());
        }
        for (script_hash, script) in &self.redeem_scripts {
            batch.put(Column::RedeemScript, *script_hash, script.clone());
        }
        Ok(())
    }
}

impl SigningKeys for KeyStore {
    fn secret_for_key_hash(&self, key_hash: &[u8; 20]) -> Option<(SecretKey, bool)> {
        self.secret(key_hash)
    }

    fn redeem_script(&self, script_hash: &[u8; 20]) -> Option<Vec<u8>> {
        self.redeem_scripts.get(script_hash).cloned()
    }
}

/// Nonce for a secret's AEAD: leading bytes of the double-SHA of whatever
/// public material names it (pubkey, spend pubkey, or KDF salt).
pub(crate) fn secret_nonce(public_material: &[u8]) -> [u8; 12] {
    let digest = sha256d(public_material);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&digest[..12]);
    nonce
}

pub(crate) fn encrypt_secret(key: &[u8; 32], plaintext: &[u8], nonce: &[u8; 12]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: b"",
            },
        )
        .expect("aead encryption is infallible for in-memory buffers")
}

pub(crate) fn decrypt_secret(
    key: &[u8; 32],
    ciphertext: &[u8],
    nonce: &[u8; 12],
) -> Option<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: b"",
            },
        )
        .ok()
}

fn decrypt_secret_exact(key: &[u8; 32], ciphertext: &[u8], nonce: &[u8; 12]) -> Option<[u8; 32]> {
    let mut plain = decrypt_secret(key, ciphertext, nonce)?;
    if plain.len() != 32 {
        plain.zeroize();
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&plain);
    plain.zeroize();
    Some(out)
}

pub(crate) fn derive_kdf_key(passphrase: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut hasher = Sha512::new();
    hasher.update(passphrase.as_bytes());
    hasher.update(salt);
    let mut state = hasher.finalize();
    for _ in 1..iterations.max(1) {
        state = Sha512::digest(&state);
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&state[..32]);
    key
}

/// Pick an iteration count so one derivation takes roughly
/// [`KDF_TARGET_MILLIS`]. Two timing samples are averaged; the result never
/// drops below [`MIN_KDF_ITERATIONS`].
fn calibrate_iterations(passphrase: &str, salt: &[u8]) -> u32 {
    let start = Instant::now();
    derive_kdf_key(passphrase, salt, MIN_KDF_ITERATIONS);
    let elapsed = start.elapsed().as_millis().max(1) as u64;
    let mut iterations =
        ((MIN_KDF_ITERATIONS as u64) * KDF_TARGET_MILLIS / elapsed).min(u32::MAX as u64) as u32;
    iterations = iterations.max(MIN_KDF_ITERATIONS);

    let start = Instant::now();
    derive_kdf_key(passphrase, salt, iterations);
    let elapsed = start.elapsed().as_millis().max(1) as u64;
    let second = ((iterations as u64) * KDF_TARGET_MILLIS / elapsed).min(u32::MAX as u64) as u32;
    iterations = ((iterations as u64 + second as u64) / 2) as u32;

    iterations.max(MIN_KDF_ITERATIONS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_storage::memory::MemoryStore;

    fn fresh() -> (KeyStore, WalletDb<MemoryStore>) {
        (KeyStore::new(), WalletDb::new(MemoryStore::new()))
    }

    #[test]
    fn generate_and_fetch() {
        let (mut store, db) = fresh();
        let pubkey = store.generate_key(&db, true).expect("generate");
        let key_hash = hash160(&pubkey.serialize());
        assert!(store.have_key(&key_hash));
        let (secret, compressed) = store.secret(&key_hash).expect("secret");
        assert!(compressed);
        let secp = Secp256k1::new();
        assert_eq!(PublicKey::from_secret_key(&secp, &secret), pubkey);
        assert!(store.time_first_key > 0);
    }

    #[test]
    fn encrypt_unlock_relock() {
        let (mut store, db) = fresh();
        let pubkey = store.generate_key(&db, true).expect("generate");
        let key_hash = hash160(&pubkey.serialize());

        store.encrypt(&db, "hunter2").expect("encrypt");
        assert!(store.is_crypted());
        assert!(!store.is_locked());

        store.lock();
        assert!(store.is_locked());
        assert!(store.secret(&key_hash).is_none());

        assert!(matches!(
            store.unlock("wrong"),
            Err(WalletError::IncorrectPassphrase)
        ));
        assert!(store.is_locked());

        store.unlock("hunter2").expect("unlock");
        assert!(!store.is_locked());
        assert!(store.secret(&key_hash).is_some());
    }

    #[test]
    fn change_passphrase_invalidates_old() {
        let (mut store, db) = fresh();
        store.generate_key(&db, true).expect("generate");
        store.encrypt(&db, "first").expect("encrypt");
        store.lock();

        store
            .change_passphrase(&db, "first", "second")
            .expect("change");
        assert!(matches!(
            store.unlock("first"),
            Err(WalletError::IncorrectPassphrase)
        ));
        store.unlock("second").expect("unlock with new passphrase");
    }

    #[test]
    fn change_passphrase_requires_old() {
        let (mut store, db) = fresh();
        store.generate_key(&db, true).expect("generate");
        store.encrypt(&db, "first").expect("encrypt");
        assert!(matches!(
            store.change_passphrase(&db, "wrong", "second"),
            Err(WalletError::IncorrectPassphrase)
        ));
    }

    #[test]
    fn crypted_keys_reload_locked() {
        let db = WalletDb::new(MemoryStore::new());
        let mut store = KeyStore::new();
        let pubkey = store.generate_key(&db, true).expect("generate");
        let key_hash = hash160(&pubkey.serialize());
        store.encrypt(&db, "pw").expect("encrypt");

        let mut reloaded = KeyStore::new();
        reloaded.load(&db).expect("load");
        assert!(reloaded.is_crypted());
        assert!(reloaded.is_locked());
        assert!(reloaded.have_key(&key_hash));
        assert!(reloaded.secret(&key_hash).is_none());
        reloaded.unlock("pw").expect("unlock");
        assert!(reloaded.secret(&key_hash).is_some());
    }

    #[test]
    fn kdf_iterations_floor() {
        let iterations = calibrate_iterations("pw", &[0u8; 16]);
        assert!(iterations >= MIN_KDF_ITERATIONS);
    }
}
