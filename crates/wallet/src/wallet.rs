//! The wallet aggregate: owned transactions, balances, the address book,
//! chain scanning, and spent-state maintenance.

use std::collections::BTreeMap;
use std::process::Command;

use secp256k1::PublicKey;
use umbra_chain::{ChainView, Mempool, Relay};
use umbra_consensus::{
    chain_params, constants::KEY_BIRTH_FUZZ, Amount, ChainParams, Hash256, Network, ZERO_HASH,
};
use umbra_primitives::address::key_hash_to_address;
use umbra_primitives::block::Block;
use umbra_primitives::hash::hash160;
use umbra_primitives::outpoint::OutPoint;
use umbra_primitives::transaction::{Transaction, TxIn, TxOut};
use umbra_script::standard::{extract_destination, ScriptDestination};
use umbra_storage::KeyValueStore;

use crate::coinselect::SpendableOutput;
use crate::db::{AccountingEntry, WalletDb};
use crate::error::WalletError;
use crate::keypool::KeyPool;
use crate::keystore::KeyStore;
use crate::mix::MixSlot;
use crate::service::ServiceDirectory;
use crate::stealth::StealthDirectory;
use crate::wtx::WalletTx;
use crate::{current_unix_seconds, hex_str};

/// Wiggle room when bounding a transaction's smart time by later entries.
const SMART_TIME_FUTURE_SKEW: i64 = 300;

pub struct Wallet<S> {
    pub network: Network,
    pub(crate) db: WalletDb<S>,
    pub keystore: KeyStore,
    pub keypool: KeyPool,
    pub(crate) txs: BTreeMap<Hash256, WalletTx>,
    /// Address string → label. Owned destinations with no entry here are
    /// treated as change.
    address_book: BTreeMap<String, String>,
    accounting: Vec<AccountingEntry>,
    accounting_serial: u64,
    order_pos_next: i64,
    default_key: Option<Vec<u8>>,
    pub stealth: StealthDirectory,
    pub services: ServiceDirectory,
    pub(crate) mix: MixSlot,
    /// Funds kept back from staking.
    pub reserve_balance: Amount,
    /// Base fee the builder starts from; escalated per size.
    pub pay_tx_fee: Amount,
    /// External command run on wallet tx arrival; `%s` becomes the txid.
    pub wallet_notify: Option<String>,
    resend_next_time: i64,
    resend_last_run: i64,
    /// Self address cached for the mix protocol.
    pub(crate) self_address: Option<String>,
}

impl<S: KeyValueStore> Wallet<S> {
    pub fn create(network: Network, store: S) -> Result<Self, WalletError> {
        let db = WalletDb::new(store);
        db.write_version()?;
        let mut wallet = Self {
            network,
            db,
            keystore: KeyStore::new(),
            keypool: KeyPool::default(),
            txs: BTreeMap::new(),
            address_book: BTreeMap::new(),
            accounting: Vec::new(),
            accounting_serial: 0,
            order_pos_next: 0,
            default_key: None,
            stealth: StealthDirectory::new(),
            services: ServiceDirectory::new(),
            mix: MixSlot::new(),
            reserve_balance: 0,
            pay_tx_fee: umbra_consensus::MIN_TX_FEE,
            wallet_notify: None,
            resend_next_time: 0,
            resend_last_run: 0,
            self_address: None,
        };
        wallet.load()?;
        Ok(wallet)
    }

    fn load(&mut self) -> Result<(), WalletError> {
        self.keystore.load(&self.db)?;
        self.keypool.load(&self.db)?;
        self.stealth.load(&self.db)?;
        for (txid, wtx) in self.db.load_txs()? {
            self.txs.insert(txid, wtx);
        }
        for (address, label) in self.db.load_names()? {
            self.address_book.insert(address, label);
        }
        self.accounting = self.db.load_accounting_entries()?;
        self.accounting_serial = self.accounting.len() as u64;
        self.order_pos_next = self.db.read_order_pos_next()?;
        self.default_key = self.db.read_default_key()?;
        Ok(())
    }

    pub fn db(&self) -> &WalletDb<S> {
        &self.db
    }

    pub fn params(&self) -> &'static ChainParams {
        chain_params(self.network)
    }

    pub fn tx_count(&self) -> usize {
        self.txs.len()
    }

    pub fn get_tx(&self, txid: &Hash256) -> Option<&WalletTx> {
        self.txs.get(txid)
    }

    pub fn tx_ids(&self) -> Vec<Hash256> {
        self.txs.keys().copied().collect()
    }

    // ---- keys and addresses ------------------------------------------------

    /// Take a key from the pool (generating on an exhausted pool when the
    /// wallet can) and consume it.
    pub fn key_from_pool(&mut self) -> Result<PublicKey, WalletError> {
        match self.keypool.reserve(&self.db, &mut self.keystore) {
            Ok(reserved) => {
                let pubkey = reserved.pubkey();
                self.keypool.keep(&self.db, reserved)?;
                Ok(pubkey)
            }
            Err(WalletError::KeypoolExhausted) => {
                if self.keystore.is_locked() {
                    return Err(WalletError::WalletLocked);
                }
                self.keystore.generate_key(&self.db, true)
            }
            Err(err) => Err(err),
        }
    }

    /// Fresh receiving address, recorded in the address book.
    pub fn new_address(&mut self, label: &str) -> Result<String, WalletError> {
        let pubkey = self.key_from_pool()?;
        let key_hash = hash160(&pubkey.serialize());
        let address = key_hash_to_address(&key_hash, self.network);
        self.set_address_label(&address, label)?;
        Ok(address)
    }

    pub fn set_address_label(&mut self, address: &str, label: &str) -> Result<(), WalletError> {
        self.db.write_name(address, label)?;
        self.address_book.insert(address.to_string(), label.to_string());
        Ok(())
    }

    pub fn delete_address_label(&mut self, address: &str) -> Result<(), WalletError> {
        self.db.erase_name(address)?;
        self.address_book.remove(address);
        Ok(())
    }

    pub fn address_label(&self, address: &str) -> Option<&str> {
        self.address_book.get(address).map(String::as_str)
    }

    pub fn address_book(&self) -> &BTreeMap<String, String> {
        &self.address_book
    }

    /// Owned entries in the address book.
    pub fn own_address_count(&self) -> usize {
        self.address_book
            .keys()
            .filter(|address| self.is_mine_address(address))
            .count()
    }

    pub fn is_mine_address(&self, address: &str) -> bool {
        match umbra_primitives::address::decode_address(address, self.network) {
            Ok(umbra_primitives::address::Destination::KeyHash(hash)) => {
                self.keystore.have_key(&hash)
            }
            Ok(umbra_primitives::address::Destination::ScriptHash(hash)) => {
                self.keystore.have_redeem_script(&hash)
            }
            Err(_) => false,
        }
    }

    pub fn set_default_key(&mut self, pubkey: &PublicKey) -> Result<(), WalletError> {
        let bytes = pubkey.serialize().to_vec();
        self.db.write_default_key(&bytes)?;
        self.default_key = Some(bytes);
        Ok(())
    }

    // ---- mine / credit / debit ---------------------------------------------

    pub fn is_mine_script(&self, script_pubkey: &[u8]) -> bool {
        match extract_destination(script_pubkey) {
            Some(ScriptDestination::KeyHash(hash)) => self.keystore.have_key(&hash),
            Some(ScriptDestination::PubKey(pubkey)) => {
                self.keystore.have_key(&hash160(&pubkey))
            }
            Some(ScriptDestination::ScriptHash(hash)) => self.keystore.have_redeem_script(&hash),
            Some(ScriptDestination::Multisig { pubkeys, .. }) => pubkeys
                .iter()
                .any(|pubkey| self.keystore.have_key(&hash160(pubkey))),
            None => false,
        }
    }

    pub fn is_mine_txout(&self, txout: &TxOut) -> bool {
        self.is_mine_script(&txout.script_pubkey)
    }

    pub fn is_mine_txin(&self, txin: &TxIn) -> bool {
        self.txs
            .get(&txin.prevout.hash)
            .and_then(|prev| prev.tx.vout.get(txin.prevout.index as usize))
            .map(|out| self.is_mine_txout(out))
            .unwrap_or(false)
    }

    /// Value this input takes from the wallet (0 when not ours).
    pub fn debit_for_txin(&self, txin: &TxIn) -> Amount {
        self.txs
            .get(&txin.prevout.hash)
            .and_then(|prev| prev.tx.vout.get(txin.prevout.index as usize))
            .filter(|out| self.is_mine_txout(out))
            .map(|out| out.value)
            .unwrap_or(0)
    }

    pub fn credit_for_txout(&self, txout: &TxOut) -> Amount {
        if self.is_mine_txout(txout) {
            txout.value
        } else {
            0
        }
    }

    pub fn tx_debit(&self, tx: &Transaction) -> Amount {
        tx.vin.iter().map(|txin| self.debit_for_txin(txin)).sum()
    }

    pub fn tx_credit(&self, tx: &Transaction) -> Amount {
        tx.vout.iter().map(|txout| self.credit_for_txout(txout)).sum()
    }

    pub fn is_from_me(&self, tx: &Transaction) -> bool {
        self.tx_debit(tx) > 0
    }

    pub fn is_mine_tx(&self, tx: &Transaction) -> bool {
        tx.vout.iter().any(|txout| self.is_mine_txout(txout))
    }

    /// An output is change iff it pays us at a destination absent from the
    /// address book. Approximate: shared or co-signed addresses can fool it.
    pub fn is_change(&self, txout: &TxOut) -> bool {
        let Some(dest) = extract_destination(&txout.script_pubkey) else {
            return false;
        };
        let Some(key_hash) = dest.key_hash() else {
            return false;
        };
        if !self.keystore.have_key(&key_hash) {
            return false;
        }
        let address = key_hash_to_address(&key_hash, self.network);
        !self.address_book.contains_key(&address)
    }

    // ---- wallet tx index ---------------------------------------------------

    fn next_order_pos(&mut self) -> Result<i64, WalletError> {
        let pos = self.order_pos_next;
        self.order_pos_next += 1;
        self.db.write_order_pos_next(self.order_pos_next)?;
        Ok(pos)
    }

    pub fn add_accounting_entry(
        &mut self,
        account: &str,
        amount: Amount,
        comment: &str,
    ) -> Result<(), WalletError> {
        let entry = AccountingEntry {
            account: account.to_string(),
            amount,
            time: current_unix_seconds(),
            comment: comment.to_string(),
            order_pos: self.next_order_pos()?,
        };
        self.db.write_accounting_entry(self.accounting_serial, &entry)?;
        self.accounting_serial += 1;
        self.accounting.push(entry);
        Ok(())
    }

    /// (order_pos, smart-or-received time) over every wallet event, for the
    /// smart-time walk.
    fn ordered_event_times(&self) -> Vec<(i64, i64)> {
        let mut items: Vec<(i64, i64)> = self
            .txs
            .values()
            .map(|wtx| {
                let time = if wtx.time_smart != 0 {
                    wtx.time_smart
                } else {
                    wtx.time_received
                };
                (wtx.order_pos, time)
            })
            .collect();
        items.extend(
            self.accounting
                .iter()
                .map(|entry| (entry.order_pos, entry.time)),
        );
        items.sort_by_key(|(order_pos, _)| *order_pos);
        items
    }

    /// Bound a newly confirmed transaction's display time by its block time
    /// while respecting the order of entries already in the wallet.
    fn compute_smart_time(&self, skip_order_pos: i64, received: i64, block_time: i64) -> i64 {
        let mut latest_now = received;
        let mut latest_entry = 0i64;
        let latest_tolerated = latest_now + SMART_TIME_FUTURE_SKEW;
        for (order_pos, time) in self.ordered_event_times().into_iter().rev() {
            if order_pos == skip_order_pos {
                continue;
            }
            if time <= latest_tolerated {
                latest_entry = time;
                if time > latest_now {
                    latest_now = time;
                }
                break;
            }
        }
        latest_entry.max(block_time.min(latest_now))
    }

    /// Insert a transaction, or merge an updated copy into the stored one.
    pub fn add_to_wallet<C: KeyValueStore>(
        &mut self,
        mut wtx_in: WalletTx,
        chain: &ChainView<C>,
    ) -> Result<bool, WalletError> {
        let txid = wtx_in.txid();
        let inserted_new = !self.txs.contains_key(&txid);

        if inserted_new {
            wtx_in.time_received = current_unix_seconds();
            wtx_in.order_pos = self.next_order_pos()?;
            wtx_in.time_smart = wtx_in.time_received;
            if wtx_in.hash_block != ZERO_HASH {
                match chain.block_header(&wtx_in.hash_block)? {
                    Some(header) => {
                        wtx_in.time_smart = self.compute_smart_time(
                            wtx_in.order_pos,
                            wtx_in.time_received,
                            header.time as i64,
                        );
                    }
                    None => {
                        umbra_log::log_warn!(
                            "tx {} cites block {} not in index",
                            hex_str(&txid[..5]),
                            hex_str(&wtx_in.hash_block[..5])
                        );
                    }
                }
            }
            self.txs.insert(txid, wtx_in.clone());
        }

        let mut updated = false;
        if !inserted_new {
            let wtx = self.txs.get_mut(&txid).expect("present");
            if wtx_in.hash_block != ZERO_HASH && wtx_in.hash_block != wtx.hash_block {
                wtx.hash_block = wtx_in.hash_block;
                updated = true;
            }
            if wtx_in.index_in_block != -1
                && (wtx_in.merkle_branch != wtx.merkle_branch
                    || wtx_in.index_in_block != wtx.index_in_block)
            {
                wtx.merkle_branch = wtx_in.merkle_branch.clone();
                wtx.index_in_block = wtx_in.index_in_block;
                updated = true;
            }
            if wtx_in.from_me && wtx_in.from_me != wtx.from_me {
                wtx.from_me = wtx_in.from_me;
                updated = true;
            }
            updated |= wtx.update_spent(&wtx_in.spent_bits);
            for (key, value) in &wtx_in.map_value {
                if !wtx.map_value.contains_key(key) {
                    wtx.map_value.insert(key.clone(), value.clone());
                    updated = true;
                }
            }
        }

        umbra_log::log_debug!(
            "add_to_wallet {} {}{}",
            hex_str(&txid[..5]),
            if inserted_new { "new" } else { "" },
            if updated { "update" } else { "" }
        );

        if inserted_new || updated {
            let wtx = self.txs.get(&txid).expect("present").clone();
            self.db.write_tx(&txid, &wtx)?;
        }

        // If the default receiving key was paid, rotate it.
        if let Some(default_key) = self.default_key.clone() {
            let default_script =
                umbra_script::standard::p2pkh_script_pubkey(&hash160(&default_key));
            let paid_default = self
                .txs
                .get(&txid)
                .map(|wtx| {
                    wtx.tx
                        .vout
                        .iter()
                        .any(|out| out.script_pubkey == default_script)
                })
                .unwrap_or(false);
            if paid_default {
                if let Ok(fresh) = self.key_from_pool() {
                    self.set_default_key(&fresh)?;
                    let address =
                        key_hash_to_address(&hash160(&fresh.serialize()), self.network);
                    self.set_address_label(&address, "")?;
                }
            }
        }

        let in_block = self
            .txs
            .get(&txid)
            .map(|wtx| wtx.hash_block != ZERO_HASH)
            .unwrap_or(false);
        let tx = self.txs.get(&txid).expect("present").tx.clone();
        self.wallet_update_spent(&tx, in_block)?;

        self.notify_transaction(&txid);
        Ok(true)
    }

    /// Mark outputs consumed by `tx` as spent in the owning wallet entries,
    /// and (when `tx` itself is in a block) refresh its own outputs unspent.
    pub fn wallet_update_spent(&mut self, tx: &Transaction, in_block: bool) -> Result<(), WalletError> {
        let mut dirty: Vec<Hash256> = Vec::new();
        for txin in &tx.vin {
            let Some(prev) = self.txs.get(&txin.prevout.hash) else {
                continue;
            };
            let index = txin.prevout.index as usize;
            if index >= prev.tx.vout.len() {
                umbra_log::log_warn!(
                    "wallet_update_spent: bad wtx {}",
                    hex_str(&txin.prevout.hash[..5])
                );
                continue;
            }
            if !prev.is_spent(index) && self.is_mine_txout(&prev.tx.vout[index]) {
                let prev = self.txs.get_mut(&txin.prevout.hash).expect("present");
                prev.mark_spent(index);
                dirty.push(txin.prevout.hash);
            }
        }
        if in_block {
            let txid = tx.txid();
            if let Some(wtx) = self.txs.get(&txid) {
                let mine: Vec<usize> = (0..wtx.tx.vout.len())
                    .filter(|index| self.is_mine_txout(&wtx.tx.vout[*index]))
                    .collect();
                let wtx = self.txs.get_mut(&txid).expect("present");
                let mut changed = false;
                for index in mine {
                    changed |= wtx.mark_unspent(index);
                }
                if changed {
                    dirty.push(txid);
                }
            }
        }
        for txid in dirty {
            let wtx = self.txs.get(&txid).expect("present").clone();
            self.db.write_tx(&txid, &wtx)?;
            self.notify_transaction(&txid);
        }
        Ok(())
    }

    /// Insert/update if the transaction touches the wallet. Also feeds the
    /// stealth scanner; stealth hits make outputs ours before the ownership
    /// test runs.
    pub fn add_to_wallet_if_involving_me<C: KeyValueStore>(
        &mut self,
        tx: &Transaction,
        block: Option<&Block>,
        update: bool,
        chain: &ChainView<C>,
    ) -> Result<bool, WalletError> {
        let txid = tx.txid();
        let existed = self.txs.contains_key(&txid);
        if existed && !update {
            return Ok(false);
        }

        let narrations = self.scan_tx_for_stealth(tx)?;

        if existed || self.is_mine_tx(tx) || self.is_from_me(tx) {
            let mut wtx = WalletTx::new(tx.clone());
            wtx.from_me = self.is_from_me(tx);
            for (key, value) in narrations {
                wtx.map_value.insert(key, value);
            }
            if let Some(block) = block {
                wtx.set_merkle_branch(block);
            }
            return self.add_to_wallet(wtx, chain);
        }
        self.wallet_update_spent(tx, false)?;
        Ok(false)
    }

    pub fn erase_tx(&mut self, txid: &Hash256) -> Result<bool, WalletError> {
        if self.txs.remove(txid).is_some() {
            self.db.erase_tx(txid)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Walk the chain from `from_height`, adding involved transactions.
    /// Blocks older than the first key (less clock fuzz) are skipped.
    pub fn scan_for_involvement<C: KeyValueStore>(
        &mut self,
        chain: &ChainView<C>,
        from_height: i32,
        update: bool,
    ) -> Result<usize, WalletError> {
        let mut found = 0;
        let best = chain.best_height()?;
        let birth_cutoff = if self.keystore.time_first_key != 0 {
            self.keystore.time_first_key - KEY_BIRTH_FUZZ
        } else {
            0
        };
        for height in from_height.max(0)..=best {
            let Some(hash) = chain.block_hash_at(height)? else {
                break;
            };
            let Some(block) = chain.read_block(&hash)? else {
                break;
            };
            if birth_cutoff != 0 && (block.header.time as i64) < birth_cutoff {
                continue;
            }
            for tx in block.transactions.clone() {
                if self.add_to_wallet_if_involving_me(&tx, Some(&block), update, chain)? {
                    found += 1;
                }
            }
        }
        if best >= 0 {
            let best_hash = chain.best_block_hash()?;
            self.db.write_best_block(&best_hash)?;
        }
        Ok(found)
    }

    // ---- balances ----------------------------------------------------------

    /// A transaction whose unspent outputs count toward the spendable
    /// balance: confirmed, or our own pending spend whose inputs are all
    /// ours.
    pub fn is_trusted<C: KeyValueStore>(
        &self,
        wtx: &WalletTx,
        chain: &ChainView<C>,
    ) -> Result<bool, WalletError> {
        let best = chain.best_height()?;
        if !wtx.tx.is_final(best + 1, current_unix_seconds()) {
            return Ok(false);
        }
        let depth = wtx.depth_in_main_chain(chain)?;
        if depth >= 1 {
            return Ok(true);
        }
        if !wtx.from_me {
            return Ok(false);
        }
        Ok(wtx.tx.vin.iter().all(|txin| self.is_mine_txin(txin)))
    }

    fn available_credit<C: KeyValueStore>(
        &self,
        wtx: &WalletTx,
        chain: &ChainView<C>,
    ) -> Result<Amount, WalletError> {
        if wtx.blocks_to_maturity(chain, self.params())? > 0 {
            return Ok(0);
        }
        let mut total = 0;
        for (index, txout) in wtx.tx.vout.iter().enumerate() {
            if !wtx.is_spent(index) {
                total += self.credit_for_txout(txout);
            }
        }
        Ok(total)
    }

    pub fn balance<C: KeyValueStore>(&self, chain: &ChainView<C>) -> Result<Amount, WalletError> {
        let mut total = 0;
        for wtx in self.txs.values() {
            if self.is_trusted(wtx, chain)? {
                total += self.available_credit(wtx, chain)?;
            }
        }
        Ok(total)
    }

    pub fn unconfirmed_balance<C: KeyValueStore>(
        &self,
        chain: &ChainView<C>,
    ) -> Result<Amount, WalletError> {
        let mut total = 0;
        for wtx in self.txs.values() {
            if !self.is_trusted(wtx, chain)? {
                total += self.available_credit(wtx, chain)?;
            }
        }
        Ok(total)
    }

    pub fn immature_balance<C: KeyValueStore>(
        &self,
        chain: &ChainView<C>,
    ) -> Result<Amount, WalletError> {
        let mut total = 0;
        for wtx in self.txs.values() {
            if wtx.tx.is_coinbase()
                && wtx.blocks_to_maturity(chain, self.params())? > 0
                && wtx.depth_in_main_chain(chain)? > 0
            {
                total += self.tx_credit(&wtx.tx);
            }
        }
        Ok(total)
    }

    /// Coins bound up in maturing coinstakes.
    pub fn stake_balance<C: KeyValueStore>(
        &self,
        chain: &ChainView<C>,
    ) -> Result<Amount, WalletError> {
        let mut total = 0;
        for wtx in self.txs.values() {
            if wtx.tx.is_coinstake()
                && wtx.blocks_to_maturity(chain, self.params())? > 0
                && wtx.depth_in_main_chain(chain)? > 0
            {
                total += self.tx_credit(&wtx.tx);
            }
        }
        Ok(total)
    }

    pub fn new_mint<C: KeyValueStore>(&self, chain: &ChainView<C>) -> Result<Amount, WalletError> {
        self.immature_balance(chain)
    }

    // ---- spendable outputs -------------------------------------------------

    /// Enumerate spendable outputs: final, (optionally) trusted, matured,
    /// unspent, above dust, and passing any coin-control selection.
    pub fn available_coins<C: KeyValueStore>(
        &self,
        chain: &ChainView<C>,
        only_confirmed: bool,
        coin_control: Option<&crate::coinselect::CoinControl>,
    ) -> Result<Vec<SpendableOutput>, WalletError> {
        let mut coins = Vec::new();
        let best = chain.best_height()?;
        let now = current_unix_seconds();
        for (txid, wtx) in &self.txs {
            if !wtx.tx.is_final(best + 1, now) {
                continue;
            }
            if only_confirmed && !self.is_trusted(wtx, chain)? {
                continue;
            }
            if (wtx.tx.is_coinbase() || wtx.tx.is_coinstake())
                && wtx.blocks_to_maturity(chain, self.params())? > 0
            {
                continue;
            }
            let depth = wtx.depth_in_main_chain(chain)?;
            if depth < 0 {
                continue;
            }
            for (index, txout) in wtx.tx.vout.iter().enumerate() {
                if wtx.is_spent(index) || !self.is_mine_txout(txout) {
                    continue;
                }
                if txout.value < umbra_consensus::MIN_TXOUT_AMOUNT {
                    continue;
                }
                let outpoint = OutPoint::new(*txid, index as u32);
                if let Some(control) = coin_control {
                    if control.has_selection() && !control.is_selected(&outpoint) {
                        continue;
                    }
                }
                coins.push(SpendableOutput {
                    txid: *txid,
                    vout: index as u32,
                    value: txout.value,
                    depth,
                    from_me: wtx.from_me,
                    tx_time: wtx.tx.time,
                });
            }
        }
        Ok(coins)
    }

    /// Ascending-(txid, vout) enumeration at a fixed confirmation floor; the
    /// staking selector depends on this ordering.
    pub fn available_coins_min_conf<C: KeyValueStore>(
        &self,
        chain: &ChainView<C>,
        min_conf: i32,
    ) -> Result<Vec<SpendableOutput>, WalletError> {
        let mut coins = Vec::new();
        let best = chain.best_height()?;
        let now = current_unix_seconds();
        for (txid, wtx) in &self.txs {
            if !wtx.tx.is_final(best + 1, now) {
                continue;
            }
            let depth = wtx.depth_in_main_chain(chain)?;
            if depth < min_conf {
                continue;
            }
            for (index, txout) in wtx.tx.vout.iter().enumerate() {
                if wtx.is_spent(index) || !self.is_mine_txout(txout) {
                    continue;
                }
                if txout.value < umbra_consensus::MIN_TXOUT_AMOUNT {
                    continue;
                }
                coins.push(SpendableOutput {
                    txid: *txid,
                    vout: index as u32,
                    value: txout.value,
                    depth,
                    from_me: wtx.from_me,
                    tx_time: wtx.tx.time,
                });
            }
        }
        Ok(coins)
    }

    // ---- spent-state repair ------------------------------------------------

    /// Reconcile the wallet's spent bits against the authoritative chain
    /// index. Returns (mismatches, balance in question); repairs unless
    /// `check_only`.
    pub fn fix_spent_coins<C: KeyValueStore>(
        &mut self,
        chain: &ChainView<C>,
        check_only: bool,
    ) -> Result<(usize, Amount), WalletError> {
        let mut mismatches = 0;
        let mut amount_in_question: Amount = 0;
        let txids: Vec<Hash256> = self.txs.keys().copied().collect();
        for txid in txids {
            let Some(entry) = chain.tx_entry(&txid)? else {
                continue;
            };
            let wtx = self.txs.get(&txid).expect("present").clone();
            let mut repaired = false;
            for (index, txout) in wtx.tx.vout.iter().enumerate() {
                if !self.is_mine_txout(txout) {
                    continue;
                }
                let chain_spent = entry.is_output_spent(index);
                let wallet_spent = wtx.is_spent(index);
                if wallet_spent && !chain_spent {
                    umbra_log::log_warn!(
                        "fix_spent_coins found lost coin {} {}[{index}], {}",
                        txout.value,
                        hex_str(&txid[..5]),
                        if check_only { "repair not attempted" } else { "repairing" }
                    );
                    mismatches += 1;
                    amount_in_question += txout.value;
                    if !check_only {
                        let wtx = self.txs.get_mut(&txid).expect("present");
                        wtx.mark_unspent(index);
                        repaired = true;
                    }
                } else if !wallet_spent && chain_spent {
                    umbra_log::log_warn!(
                        "fix_spent_coins found spent coin {} {}[{index}], {}",
                        txout.value,
                        hex_str(&txid[..5]),
                        if check_only { "repair not attempted" } else { "repairing" }
                    );
                    mismatches += 1;
                    amount_in_question += txout.value;
                    if !check_only {
                        let wtx = self.txs.get_mut(&txid).expect("present");
                        wtx.mark_spent(index);
                        repaired = true;
                    }
                }
            }
            if repaired {
                let wtx = self.txs.get(&txid).expect("present").clone();
                self.db.write_tx(&txid, &wtx)?;
            }
        }
        Ok((mismatches, amount_in_question))
    }

    /// A reorg orphaned one of our coinstakes: make its inputs selectable
    /// again.
    pub fn disable_coinstake(&mut self, tx: &Transaction) -> Result<(), WalletError> {
        if !tx.is_coinstake() || !self.is_from_me(tx) {
            return Ok(());
        }
        for txin in &tx.vin {
            let Some(prev) = self.txs.get_mut(&txin.prevout.hash) else {
                continue;
            };
            let index = txin.prevout.index as usize;
            if index < prev.tx.vout.len() && prev.mark_unspent(index) {
                let wtx = prev.clone();
                self.db.write_tx(&txin.prevout.hash, &wtx)?;
            }
        }
        Ok(())
    }

    // ---- resend ------------------------------------------------------------

    /// Rebroadcast unconfirmed wallet transactions. Unforced runs are gated
    /// by a randomized delay (up to 30 minutes) and require a block to have
    /// arrived since the previous run.
    pub fn resend_wallet_transactions<C: KeyValueStore>(
        &mut self,
        chain: &ChainView<C>,
        mempool: &mut Mempool,
        relay: &dyn Relay,
        force: bool,
    ) -> Result<usize, WalletError> {
        let now = current_unix_seconds();
        if !force {
            if now < self.resend_next_time {
                return Ok(0);
            }
            let first_run = self.resend_next_time == 0;
            self.resend_next_time =
                now + (rand::random::<u64>() % (30 * 60)) as i64;
            if first_run {
                return Ok(0);
            }
            let best_hash = chain.best_block_hash()?;
            let best_time = chain
                .block_header(&best_hash)?
                .map(|header| header.time as i64)
                .unwrap_or(0);
            if best_time < self.resend_last_run {
                return Ok(0);
            }
            self.resend_last_run = now;
        }

        let mut resent = 0;
        let mut by_time: Vec<(i64, Hash256)> = self
            .txs
            .values()
            .filter(|wtx| !wtx.is_confirmed())
            .filter(|wtx| force || now - wtx.time_received > 5 * 60)
            .map(|wtx| (wtx.time_received, wtx.txid()))
            .collect();
        by_time.sort();
        for (_, txid) in by_time {
            let wtx = self.txs.get(&txid).expect("present");
            if wtx.tx.check().is_err() {
                umbra_log::log_warn!(
                    "resend: check failed for {}",
                    hex_str(&txid[..5])
                );
                continue;
            }
            for prev in &wtx.vtx_prev {
                if chain.tx_entry(&prev.txid())?.is_none() && !mempool.contains(&prev.txid()) {
                    let _ = mempool.accept(chain, prev);
                    relay.relay_transaction(prev);
                }
            }
            if chain.tx_entry(&txid)?.is_none() {
                if !mempool.contains(&txid) {
                    let _ = mempool.accept(chain, &wtx.tx);
                }
                relay.relay_transaction(&wtx.tx);
                resent += 1;
            }
        }
        if resent > 0 {
            umbra_log::log_info!("resent {resent} wallet transaction(s)");
        }
        Ok(resent)
    }

    // ---- notify ------------------------------------------------------------

    fn notify_transaction(&self, txid: &Hash256) {
        if let Some(template) = &self.wallet_notify {
            let command = template.replace("%s", &hex_str(txid));
            let mut parts = command.split_whitespace();
            if let Some(program) = parts.next() {
                let _ = Command::new(program).args(parts).spawn();
            }
        }
    }

    // ---- encryption orchestration ------------------------------------------

    /// Encrypt the wallet under `passphrase`. Owned spend keys and stealth
    /// spend secrets move under a fresh master key, the keypool is rebuilt
    /// from post-encryption keys, the entire wallet store is rewritten to
    /// purge plaintext remnants, and the wallet ends locked.
    pub fn encrypt_wallet(&mut self, passphrase: &str) -> Result<(), WalletError> {
        self.keystore.encrypt(&self.db, passphrase)?;
        self.encrypt_stealth_secrets()?;
        self.keypool.reset(&self.db, &mut self.keystore)?;
        self.rewrite_wallet()?;
        self.keystore.lock();
        umbra_log::log_info!("wallet encrypted");
        Ok(())
    }

    /// Unlock with a passphrase; stealth secrets decrypt alongside and any
    /// pending stealth matches expand into concrete keys.
    pub fn unlock_wallet(
        &mut self,
        passphrase: &str,
        staking_only: bool,
    ) -> Result<(), WalletError> {
        self.keystore.unlock(passphrase)?;
        self.keystore.unlock_staking_only = staking_only;
        self.unlock_stealth_secrets()?;
        self.expand_locked_stealth_keys()?;
        self.keypool.top_up(&self.db, &mut self.keystore)?;
        Ok(())
    }

    /// Forget the master key and all plaintext secrets. Crypted stealth
    /// secrets are only ever decrypted on demand, so they need no scrub.
    pub fn lock_wallet(&mut self) -> Result<(), WalletError> {
        if !self.keystore.is_crypted() {
            return Err(WalletError::WalletNotEncrypted);
        }
        self.keystore.lock();
        Ok(())
    }

    pub fn change_wallet_passphrase(
        &mut self,
        old_passphrase: &str,
        new_passphrase: &str,
    ) -> Result<(), WalletError> {
        self.keystore
            .change_passphrase(&self.db, old_passphrase, new_passphrase)
    }

    /// Rebuild every wallet record family from in-memory state in a single
    /// atomic batch: deletes first, fresh puts after.
    fn rewrite_wallet(&mut self) -> Result<(), WalletError> {
        use umbra_primitives::encoding::encode;
        use umbra_storage::Column;

        let mut batch = self.db.purge_wallet_families()?;
        self.keystore.persist_records(&mut batch)?;
        self.keypool.persist_records(&self.db, &mut batch)?;
        self.stealth.persist_records(&mut batch);
        for (txid, wtx) in &self.txs {
            batch.put(Column::Tx, *txid, encode(wtx));
        }
        for (address, label) in &self.address_book {
            batch.put(Column::Name, address.as_bytes(), label.as_bytes());
        }
        for (serial, entry) in self.accounting.iter().enumerate() {
            batch.put(
                Column::AccountEntry,
                (serial as u64).to_be_bytes(),
                encode(entry),
            );
        }
        batch.put(
            Column::OrderPosNext,
            b"".as_slice(),
            self.order_pos_next.to_le_bytes(),
        );
        batch.put(
            Column::Version,
            b"".as_slice(),
            crate::db::WALLET_VERSION.to_le_bytes(),
        );
        if let Some(default_key) = &self.default_key {
            batch.put(Column::DefaultKey, b"".as_slice(), default_key.clone());
        }
        if let Some(best_block) = self.db.read_best_block()? {
            batch.put(Column::BestBlock, b"".as_slice(), best_block);
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }
}
