//! Transaction construction and commit.

use umbra_chain::{ChainView, Mempool, Relay};
use umbra_consensus::{
    constants::MAX_BLOCK_SIZE_GEN, Amount, CENT, MIN_TXOUT_AMOUNT, MIN_TX_FEE,
};
use umbra_primitives::address::address_to_script_pubkey;
use umbra_primitives::hash::hash160;
use umbra_primitives::transaction::{Transaction, TxIn, TxOut};
use umbra_script::sighash::{SighashType, SIGHASH_ALL};
use umbra_script::standard::{narration_script, p2pkh_script_pubkey};
use umbra_script::sign_input;
use umbra_storage::KeyValueStore;

use crate::coinselect::{select_coins, CoinControl, SelectorRng};
use crate::error::WalletError;
use crate::keypool::ReservedKey;
use crate::wallet::Wallet;
use crate::wtx::WalletTx;
use crate::{current_unix_seconds, hex_str};

pub const MAX_NARRATION_LENGTH: usize = 24;
/// Serialized-size ceiling for wallet-built transactions.
const MAX_CREATE_TX_SIZE: usize = MAX_BLOCK_SIZE_GEN / 5;
/// How many ancestor generations ride along for relay.
const SUPPORTING_TX_DEPTH: i32 = 3;

/// A built-but-uncommitted transaction plus the change reservation that must
/// be kept or released with it.
#[derive(Debug)]
pub struct BuiltTransaction {
    pub wtx: WalletTx,
    pub fee: Amount,
    pub change_key: Option<ReservedKey>,
}

impl<S: KeyValueStore> Wallet<S> {
    /// Build and sign a spend paying `payees` in order. An optional
    /// narration rides as a zero-value null-data output directly after the
    /// first payee output.
    pub fn create_transaction<C: KeyValueStore, R: SelectorRng>(
        &mut self,
        chain: &ChainView<C>,
        rng: &mut R,
        payees: &[(Vec<u8>, Amount)],
        narration: Option<&str>,
        coin_control: Option<&CoinControl>,
    ) -> Result<BuiltTransaction, WalletError> {
        if payees.is_empty() {
            return Err(WalletError::InvalidAmount);
        }
        let mut value_total: Amount = 0;
        for (_, amount) in payees {
            if *amount < 0 {
                return Err(WalletError::InvalidAmount);
            }
            value_total += amount;
        }
        if self.keystore.is_locked() {
            return Err(WalletError::WalletLocked);
        }

        let mut outputs: Vec<TxOut> = payees
            .iter()
            .map(|(script, amount)| TxOut::new(*amount, script.clone()))
            .collect();
        if let Some(narration) = narration {
            if narration.len() > MAX_NARRATION_LENGTH {
                return Err(WalletError::NarrationTooLong);
            }
            if !narration.is_empty() {
                outputs.insert(1, TxOut::new(0, narration_script(narration.as_bytes())));
            }
        }

        let available = self.available_coins(chain, true, coin_control)?;
        let mut change_key: Option<ReservedKey> = None;
        let mut fee: Amount = self.pay_tx_fee;
        let mut tx = Transaction::new(current_unix_seconds() as u32);

        loop {
            tx.vin.clear();
            tx.vout = outputs.clone();

            let target = value_total + fee;
            let (selected, value_in) = if coin_control
                .map(|control| control.has_selection())
                .unwrap_or(false)
            {
                // Coin control: everything selected goes in, no subset math.
                let value: Amount = available.iter().map(|coin| coin.value).sum();
                if value < target {
                    umbra_log::log_debug!("create_transaction: selection failed");
                    return Err(WalletError::InsufficientFunds);
                }
                (available.clone(), value)
            } else {
                match select_coins(rng, target, tx.time, &available) {
                    Some(result) => result,
                    None => {
                        umbra_log::log_debug!("create_transaction: selection failed");
                        return Err(WalletError::InsufficientFunds);
                    }
                }
            };

            let mut change = value_in - value_total - fee;

            // Sub-cent change: raise the fee toward the floor before paying
            // a dust-sized change output.
            if fee < MIN_TX_FEE && change > 0 && change < CENT {
                let move_to_fee = change.min(MIN_TX_FEE - fee);
                change -= move_to_fee;
                fee += move_to_fee;
            }
            // Dust change folds into the fee entirely.
            if change > 0 && change < MIN_TXOUT_AMOUNT {
                fee += change;
                change = 0;
            }

            if change > 0 {
                let change_script = match coin_control.and_then(|c| c.change_script.clone()) {
                    Some(script) => script,
                    None => {
                        // A fresh key so the change side is not obvious.
                        if change_key.is_none() {
                            change_key =
                                Some(self.keypool.reserve(&self.db, &mut self.keystore)?);
                        }
                        let pubkey = change_key.as_ref().expect("reserved").pubkey();
                        p2pkh_script_pubkey(&hash160(&pubkey.serialize()))
                    }
                };

                // Random position, but never between a value output and the
                // narration output that annotates it.
                let mut position = rng.pick(tx.vout.len() + 1);
                while position > 0 && position < tx.vout.len() && tx.vout[position].value == 0 {
                    position -= 1;
                }
                tx.vout.insert(position, TxOut::new(change, change_script));
            } else if let Some(reserved) = change_key.take() {
                self.keypool.release(reserved);
            }

            for coin in &selected {
                tx.vin.push(TxIn::from_outpoint(coin.outpoint()));
            }

            for (index, coin) in selected.iter().enumerate() {
                let prev_script = self
                    .get_tx(&coin.txid)
                    .and_then(|wtx| wtx.tx.vout.get(coin.vout as usize))
                    .map(|out| out.script_pubkey.clone())
                    .ok_or(WalletError::Corrupted("selected coin missing from wallet"))?;
                let script_sig = sign_input(
                    &self.keystore,
                    &tx,
                    index,
                    &prev_script,
                    SighashType(SIGHASH_ALL),
                )?;
                tx.vin[index].script_sig = script_sig;
            }

            let bytes = tx.serialized_size();
            if bytes >= MAX_CREATE_TX_SIZE {
                umbra_log::log_warn!("create_transaction: transaction too large ({bytes} bytes)");
                return Err(WalletError::TransactionTooLarge);
            }

            let pay_fee = self.pay_tx_fee * (1 + bytes as Amount / 1000);
            let min_fee = MIN_TX_FEE * (1 + bytes as Amount / 1000);
            let required = pay_fee.max(min_fee);
            if fee < required {
                fee = required;
                continue;
            }
            break;
        }

        let mut wtx = WalletTx::new(tx);
        wtx.from_me = true;
        self.attach_supporting_transactions(chain, &mut wtx)?;
        Ok(BuiltTransaction {
            wtx,
            fee,
            change_key,
        })
    }

    /// Collect unconfirmed/shallow ancestors (to depth 3) so peers can
    /// validate the spend without asking around; oldest first.
    fn attach_supporting_transactions<C: KeyValueStore>(
        &self,
        chain: &ChainView<C>,
        wtx: &mut WalletTx,
    ) -> Result<(), WalletError> {
        wtx.vtx_prev.clear();
        let mut queue: Vec<(umbra_consensus::Hash256, i32)> = wtx
            .tx
            .vin
            .iter()
            .map(|txin| (txin.prevout.hash, 1))
            .collect();
        let mut done = std::collections::HashSet::new();
        let mut collected = Vec::new();
        while let Some((txid, generation)) = queue.pop() {
            if generation > SUPPORTING_TX_DEPTH || !done.insert(txid) {
                continue;
            }
            let Some(prev) = self.get_tx(&txid) else {
                continue;
            };
            if prev.depth_in_main_chain(chain)? >= SUPPORTING_TX_DEPTH {
                continue;
            }
            collected.push(prev.tx.clone());
            for txin in &prev.tx.vin {
                queue.push((txin.prevout.hash, generation + 1));
            }
        }
        collected.reverse();
        wtx.vtx_prev = collected;
        Ok(())
    }

    /// Commit a built transaction: consume the change key, store the wallet
    /// copy (marking its inputs spent), hand it to the mempool, and relay.
    /// Mempool rejection after this point is a fatal inconsistency.
    pub fn commit_transaction<C: KeyValueStore>(
        &mut self,
        chain: &ChainView<C>,
        mempool: &mut Mempool,
        relay: &dyn Relay,
        built: BuiltTransaction,
    ) -> Result<umbra_consensus::Hash256, WalletError> {
        let BuiltTransaction {
            mut wtx,
            fee: _,
            change_key,
        } = built;
        let txid = wtx.txid();
        umbra_log::log_info!("commit_transaction {}", hex_str(&txid[..8]));

        // Narrations attached to outputs (plaintext or stealth) land in the
        // metadata map before the wallet copy is stored.
        let narrations = self.scan_tx_for_stealth(&wtx.tx)?;
        for (key, value) in narrations {
            wtx.map_value.entry(key).or_insert(value);
        }

        if let Some(reserved) = change_key {
            self.keypool.keep(&self.db, reserved)?;
        }
        self.add_to_wallet(wtx.clone(), chain)?;

        if let Err(err) = mempool.accept(chain, &wtx.tx) {
            umbra_log::log_error!("commit_transaction: mempool rejected {}", hex_str(&txid[..8]));
            return Err(WalletError::CommitRejected(err));
        }
        relay.relay_transaction(&wtx.tx);
        Ok(txid)
    }

    /// One-call spend to a raw script.
    #[allow(clippy::too_many_arguments)]
    pub fn send_money<C: KeyValueStore, R: SelectorRng>(
        &mut self,
        chain: &ChainView<C>,
        mempool: &mut Mempool,
        relay: &dyn Relay,
        rng: &mut R,
        script_pubkey: Vec<u8>,
        amount: Amount,
        narration: Option<&str>,
        coin_control: Option<&CoinControl>,
    ) -> Result<umbra_consensus::Hash256, WalletError> {
        if self.keystore.is_locked() {
            return Err(WalletError::WalletLocked);
        }
        if self.keystore.unlock_staking_only {
            return Err(WalletError::UnlockedForStakingOnly);
        }
        let built = self.create_transaction(
            chain,
            rng,
            &[(script_pubkey, amount)],
            narration,
            coin_control,
        )?;
        self.commit_transaction(chain, mempool, relay, built)
    }

    /// One-call spend to an address, with the user-facing checks.
    #[allow(clippy::too_many_arguments)]
    pub fn send_to_destination<C: KeyValueStore, R: SelectorRng>(
        &mut self,
        chain: &ChainView<C>,
        mempool: &mut Mempool,
        relay: &dyn Relay,
        rng: &mut R,
        address: &str,
        amount: Amount,
        narration: Option<&str>,
    ) -> Result<umbra_consensus::Hash256, WalletError> {
        if amount <= 0 {
            return Err(WalletError::InvalidAmount);
        }
        if amount + self.pay_tx_fee > self.balance(chain)? {
            return Err(WalletError::InsufficientFunds);
        }
        if narration.map(|n| n.len() > MAX_NARRATION_LENGTH).unwrap_or(false) {
            return Err(WalletError::NarrationTooLong);
        }
        let script_pubkey = address_to_script_pubkey(address, self.network)
            .map_err(|_| WalletError::InvalidAddress)?;
        self.send_money(
            chain, mempool, relay, rng, script_pubkey, amount, narration, None,
        )
    }
}
