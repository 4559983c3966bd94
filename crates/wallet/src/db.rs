//! Typed access to the wallet's record families.

use umbra_consensus::Hash256;
use umbra_primitives::encoding::{decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
use umbra_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::WalletError;
use crate::wtx::WalletTx;

pub const WALLET_VERSION: u32 = 1;

/// One `key` record: a plaintext private key with its pubkey.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyRecord {
    pub pubkey: Vec<u8>,
    pub secret: [u8; 32],
    pub compressed: bool,
}

impl Encodable for KeyRecord {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_var_bytes(&self.pubkey);
        encoder.write_bytes(&self.secret);
        encoder.write_bool(self.compressed);
    }
}

impl Decodable for KeyRecord {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let pubkey = decoder.read_var_bytes()?;
        let secret = decoder.read_fixed::<32>()?;
        let compressed = decoder.read_bool()?;
        Ok(Self {
            pubkey,
            secret,
            compressed,
        })
    }
}

/// One `ckey` record: a private key encrypted under the master key. An empty
/// ciphertext marks a stealth-derived key awaiting expansion on unlock.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CryptedKeyRecord {
    pub pubkey: Vec<u8>,
    pub crypted_secret: Vec<u8>,
}

impl Encodable for CryptedKeyRecord {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_var_bytes(&self.pubkey);
        encoder.write_var_bytes(&self.crypted_secret);
    }
}

impl Decodable for CryptedKeyRecord {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            pubkey: decoder.read_var_bytes()?,
            crypted_secret: decoder.read_var_bytes()?,
        })
    }
}

/// One `mkey` record: a passphrase wrapping of the symmetric master key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MasterKeyRecord {
    pub crypted_key: Vec<u8>,
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub kdf_id: u8,
}

impl Encodable for MasterKeyRecord {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_var_bytes(&self.crypted_key);
        encoder.write_var_bytes(&self.salt);
        encoder.write_u32_le(self.iterations);
        encoder.write_u8(self.kdf_id);
    }
}

impl Decodable for MasterKeyRecord {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            crypted_key: decoder.read_var_bytes()?,
            salt: decoder.read_var_bytes()?,
            iterations: decoder.read_u32_le()?,
            kdf_id: decoder.read_u8()?,
        })
    }
}

/// One `pool` record: a pre-generated key waiting to be handed out.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoolRecord {
    pub pubkey: Vec<u8>,
    pub created_at: i64,
}

impl Encodable for PoolRecord {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_var_bytes(&self.pubkey);
        encoder.write_i64_le(self.created_at);
    }
}

impl Decodable for PoolRecord {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            pubkey: decoder.read_var_bytes()?,
            created_at: decoder.read_i64_le()?,
        })
    }
}

/// One `acentry` record: an internal credit/debit move between accounts.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AccountingEntry {
    pub account: String,
    pub amount: i64,
    pub time: i64,
    pub comment: String,
    pub order_pos: i64,
}

impl Encodable for AccountingEntry {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_var_str(&self.account);
        encoder.write_i64_le(self.amount);
        encoder.write_i64_le(self.time);
        encoder.write_var_str(&self.comment);
        encoder.write_i64_le(self.order_pos);
    }
}

impl Decodable for AccountingEntry {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            account: decoder.read_var_str()?,
            amount: decoder.read_i64_le()?,
            time: decoder.read_i64_le()?,
            comment: decoder.read_var_str()?,
            order_pos: decoder.read_i64_le()?,
        })
    }
}

/// One `sxaddr` record: an owned or watch stealth address. Secrets are
/// zeroed for watch entries and ciphertext for encrypted wallets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StealthAddressRecord {
    pub label: String,
    pub scan_pubkey: Vec<u8>,
    pub spend_pubkey: Vec<u8>,
    pub scan_secret: Vec<u8>,
    /// Plaintext (32 bytes), ciphertext (longer), or empty (watch-only).
    pub spend_secret: Vec<u8>,
}

impl Encodable for StealthAddressRecord {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_var_str(&self.label);
        encoder.write_var_bytes(&self.scan_pubkey);
        encoder.write_var_bytes(&self.spend_pubkey);
        encoder.write_var_bytes(&self.scan_secret);
        encoder.write_var_bytes(&self.spend_secret);
    }
}

impl Decodable for StealthAddressRecord {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            label: decoder.read_var_str()?,
            scan_pubkey: decoder.read_var_bytes()?,
            spend_pubkey: decoder.read_var_bytes()?,
            scan_secret: decoder.read_var_bytes()?,
            spend_secret: decoder.read_var_bytes()?,
        })
    }
}

/// One `sxkm` record: a stealth match discovered while locked, retained so
/// the spend key can be expanded on unlock.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StealthKeyMetaRecord {
    pub ephemeral_pubkey: Vec<u8>,
    pub scan_pubkey: Vec<u8>,
}

impl Encodable for StealthKeyMetaRecord {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_var_bytes(&self.ephemeral_pubkey);
        encoder.write_var_bytes(&self.scan_pubkey);
    }
}

impl Decodable for StealthKeyMetaRecord {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            ephemeral_pubkey: decoder.read_var_bytes()?,
            scan_pubkey: decoder.read_var_bytes()?,
        })
    }
}

/// Typed wrapper over the storage trait for wallet records.
pub struct WalletDb<S> {
    store: S,
}

impl<S: KeyValueStore> WalletDb<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn write_version(&self) -> Result<(), WalletError> {
        self.store
            .put(Column::Version, b"", &WALLET_VERSION.to_le_bytes())?;
        Ok(())
    }

    pub fn read_version(&self) -> Result<Option<u32>, WalletError> {
        Ok(self
            .store
            .get(Column::Version, b"")?
            .filter(|bytes| bytes.len() == 4)
            .map(|bytes| u32::from_le_bytes(bytes.try_into().expect("length"))))
    }

    pub fn write_key(&self, key_hash: &[u8; 20], record: &KeyRecord) -> Result<(), WalletError> {
        self.store.put(Column::Key, key_hash, &encode(record))?;
        Ok(())
    }

    pub fn erase_key(&self, key_hash: &[u8; 20]) -> Result<(), WalletError> {
        self.store.delete(Column::Key, key_hash)?;
        Ok(())
    }

    pub fn load_keys(&self) -> Result<Vec<([u8; 20], KeyRecord)>, WalletError> {
        let mut out = Vec::new();
        for (key, value) in self.store.scan_prefix(Column::Key, b"")? {
            let key_hash: [u8; 20] = key
                .as_slice()
                .try_into()
                .map_err(|_| WalletError::Corrupted("key record with malformed hash"))?;
            out.push((key_hash, decode(&value)?));
        }
        Ok(out)
    }

    pub fn write_crypted_key(
        &self,
        key_hash: &[u8; 20],
        record: &CryptedKeyRecord,
    ) -> Result<(), WalletError> {
        self.store
            .put(Column::CryptedKey, key_hash, &encode(record))?;
        Ok(())
    }

    pub fn load_crypted_keys(&self) -> Result<Vec<([u8; 20], CryptedKeyRecord)>, WalletError> {
        let mut out = Vec::new();
        for (key, value) in self.store.scan_prefix(Column::CryptedKey, b"")? {
            let key_hash: [u8; 20] = key
                .as_slice()
                .try_into()
                .map_err(|_| WalletError::Corrupted("ckey record with malformed hash"))?;
            out.push((key_hash, decode(&value)?));
        }
        Ok(out)
    }

    pub fn write_master_key(&self, id: u32, record: &MasterKeyRecord) -> Result<(), WalletError> {
        self.store
            .put(Column::MasterKey, &id.to_be_bytes(), &encode(record))?;
        Ok(())
    }

    pub fn load_master_keys(&self) -> Result<Vec<(u32, MasterKeyRecord)>, WalletError> {
        let mut out = Vec::new();
        for (key, value) in self.store.scan_prefix(Column::MasterKey, b"")? {
            let id_bytes: [u8; 4] = key
                .as_slice()
                .try_into()
                .map_err(|_| WalletError::Corrupted("mkey record with malformed id"))?;
            out.push((u32::from_be_bytes(id_bytes), decode(&value)?));
        }
        Ok(out)
    }

    pub fn write_key_meta(&self, key_hash: &[u8; 20], create_time: i64) -> Result<(), WalletError> {
        self.store
            .put(Column::KeyMeta, key_hash, &create_time.to_le_bytes())?;
        Ok(())
    }

    pub fn load_key_metas(&self) -> Result<Vec<([u8; 20], i64)>, WalletError> {
        let mut out = Vec::new();
        for (key, value) in self.store.scan_prefix(Column::KeyMeta, b"")? {
            let key_hash: [u8; 20] = key
                .as_slice()
                .try_into()
                .map_err(|_| WalletError::Corrupted("keymeta record with malformed hash"))?;
            let time_bytes: [u8; 8] = value
                .as_slice()
                .try_into()
                .map_err(|_| WalletError::Corrupted("keymeta record with malformed time"))?;
            out.push((key_hash, i64::from_le_bytes(time_bytes)));
        }
        Ok(out)
    }

    pub fn write_pool(&self, index: i64, record: &PoolRecord) -> Result<(), WalletError> {
        self.store
            .put(Column::Pool, &index.to_be_bytes(), &encode(record))?;
        Ok(())
    }

    pub fn read_pool(&self, index: i64) -> Result<Option<PoolRecord>, WalletError> {
        match self.store.get(Column::Pool, &index.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn erase_pool(&self, index: i64) -> Result<(), WalletError> {
        self.store.delete(Column::Pool, &index.to_be_bytes())?;
        Ok(())
    }

    pub fn load_pool_indices(&self) -> Result<Vec<i64>, WalletError> {
        let mut out = Vec::new();
        for (key, _) in self.store.scan_prefix(Column::Pool, b"")? {
            let index_bytes: [u8; 8] = key
                .as_slice()
                .try_into()
                .map_err(|_| WalletError::Corrupted("pool record with malformed index"))?;
            out.push(i64::from_be_bytes(index_bytes));
        }
        Ok(out)
    }

    pub fn write_name(&self, address: &str, label: &str) -> Result<(), WalletError> {
        self.store
            .put(Column::Name, address.as_bytes(), label.as_bytes())?;
        Ok(())
    }

    pub fn erase_name(&self, address: &str) -> Result<(), WalletError> {
        self.store.delete(Column::Name, address.as_bytes())?;
        Ok(())
    }

    pub fn load_names(&self) -> Result<Vec<(String, String)>, WalletError> {
        let mut out = Vec::new();
        for (key, value) in self.store.scan_prefix(Column::Name, b"")? {
            let address = String::from_utf8(key)
                .map_err(|_| WalletError::Corrupted("name record with malformed address"))?;
            let label = String::from_utf8(value)
                .map_err(|_| WalletError::Corrupted("name record with malformed label"))?;
            out.push((address, label));
        }
        Ok(out)
    }

    pub fn write_tx(&self, txid: &Hash256, wtx: &WalletTx) -> Result<(), WalletError> {
        self.store.put(Column::Tx, txid, &encode(wtx))?;
        Ok(())
    }

    pub fn erase_tx(&self, txid: &Hash256) -> Result<(), WalletError> {
        self.store.delete(Column::Tx, txid)?;
        Ok(())
    }

    pub fn load_txs(&self) -> Result<Vec<(Hash256, WalletTx)>, WalletError> {
        let mut out = Vec::new();
        for (key, value) in self.store.scan_prefix(Column::Tx, b"")? {
            let txid: Hash256 = key
                .as_slice()
                .try_into()
                .map_err(|_| WalletError::Corrupted("tx record with malformed txid"))?;
            out.push((txid, decode(&value)?));
        }
        Ok(out)
    }

    pub fn write_setting(&self, name: &str, value: &[u8]) -> Result<(), WalletError> {
        self.store.put(Column::Setting, name.as_bytes(), value)?;
        Ok(())
    }

    pub fn read_setting(&self, name: &str) -> Result<Option<Vec<u8>>, WalletError> {
        Ok(self.store.get(Column::Setting, name.as_bytes())?)
    }

    pub fn write_default_key(&self, pubkey: &[u8]) -> Result<(), WalletError> {
        self.store.put(Column::DefaultKey, b"", pubkey)?;
        Ok(())
    }

    pub fn read_default_key(&self) -> Result<Option<Vec<u8>>, WalletError> {
        Ok(self.store.get(Column::DefaultKey, b"")?)
    }

    pub fn write_min_version(&self, version: u32) -> Result<(), WalletError> {
        self.store
            .put(Column::MinVersion, b"", &version.to_le_bytes())?;
        Ok(())
    }

    pub fn write_best_block(&self, hash: &Hash256) -> Result<(), WalletError> {
        self.store.put(Column::BestBlock, b"", hash)?;
        Ok(())
    }

    pub fn read_best_block(&self) -> Result<Option<Hash256>, WalletError> {
        Ok(self
            .store
            .get(Column::BestBlock, b"")?
            .and_then(|bytes| bytes.try_into().ok()))
    }

    pub fn write_order_pos_next(&self, next: i64) -> Result<(), WalletError> {
        self.store
            .put(Column::OrderPosNext, b"", &next.to_le_bytes())?;
        Ok(())
    }

    pub fn read_order_pos_next(&self) -> Result<i64, WalletError> {
        match self.store.get(Column::OrderPosNext, b"")? {
            Some(bytes) if bytes.len() == 8 => {
                Ok(i64::from_le_bytes(bytes.try_into().expect("length")))
            }
            _ => Ok(0),
        }
    }

    pub fn write_accounting_entry(
        &self,
        serial: u64,
        entry: &AccountingEntry,
    ) -> Result<(), WalletError> {
        self.store
            .put(Column::AccountEntry, &serial.to_be_bytes(), &encode(entry))?;
        Ok(())
    }

    pub fn load_accounting_entries(&self) -> Result<Vec<AccountingEntry>, WalletError> {
        let mut out = Vec::new();
        for (_, value) in self.store.scan_prefix(Column::AccountEntry, b"")? {
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    pub fn write_stealth_address(
        &self,
        record: &StealthAddressRecord,
    ) -> Result<(), WalletError> {
        // Keyed by spend pubkey: label updates and secret encryption must
        // not move the record.
        self.store
            .put(Column::StealthAddress, &record.spend_pubkey, &encode(record))?;
        Ok(())
    }

    pub fn load_stealth_addresses(&self) -> Result<Vec<StealthAddressRecord>, WalletError> {
        let mut out = Vec::new();
        for (_, value) in self.store.scan_prefix(Column::StealthAddress, b"")? {
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    pub fn write_stealth_key_meta(
        &self,
        key_hash: &[u8; 20],
        record: &StealthKeyMetaRecord,
    ) -> Result<(), WalletError> {
        self.store
            .put(Column::StealthKeyMeta, key_hash, &encode(record))?;
        Ok(())
    }

    pub fn erase_stealth_key_meta(&self, key_hash: &[u8; 20]) -> Result<(), WalletError> {
        self.store.delete(Column::StealthKeyMeta, key_hash)?;
        Ok(())
    }

    pub fn load_stealth_key_metas(
        &self,
    ) -> Result<Vec<([u8; 20], StealthKeyMetaRecord)>, WalletError> {
        let mut out = Vec::new();
        for (key, value) in self.store.scan_prefix(Column::StealthKeyMeta, b"")? {
            let key_hash: [u8; 20] = key
                .as_slice()
                .try_into()
                .map_err(|_| WalletError::Corrupted("sxkm record with malformed hash"))?;
            out.push((key_hash, decode(&value)?));
        }
        Ok(out)
    }

    pub fn write_redeem_script(
        &self,
        script_hash: &[u8; 20],
        redeem_script: &[u8],
    ) -> Result<(), WalletError> {
        self.store
            .put(Column::RedeemScript, script_hash, redeem_script)?;
        Ok(())
    }

    pub fn load_redeem_scripts(&self) -> Result<Vec<([u8; 20], Vec<u8>)>, WalletError> {
        let mut out = Vec::new();
        for (key, value) in self.store.scan_prefix(Column::RedeemScript, b"")? {
            let script_hash: [u8; 20] = key
                .as_slice()
                .try_into()
                .map_err(|_| WalletError::Corrupted("cscript record with malformed hash"))?;
            out.push((script_hash, value));
        }
        Ok(out)
    }

    /// Apply a prepared batch atomically. Encryption stages all its record
    /// changes through one of these so a mid-way failure leaves the stored
    /// wallet untouched.
    pub fn apply_batch(&self, batch: WriteBatch) -> Result<(), WalletError> {
        self.store.write_batch(&batch)?;
        Ok(())
    }

    /// Delete every record in the wallet families. Used by the
    /// post-encryption rewrite to purge plaintext remnants.
    pub fn purge_wallet_families(&self) -> Result<WriteBatch, WalletError> {
        let mut batch = WriteBatch::new();
        for column in Column::ALL {
            if !column.is_wallet_family() {
                continue;
            }
            for (key, _) in self.store.scan_prefix(column, b"")? {
                batch.delete(column, key);
            }
        }
        Ok(batch)
    }
}
