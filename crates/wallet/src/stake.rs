//! Proof-of-stake minting: weight accounting, kernel search, and coinstake
//! assembly.

use std::sync::atomic::{AtomicBool, Ordering};

use secp256k1::PublicKey;
use umbra_chain::ChainView;
use umbra_consensus::{
    constants::{MAX_COINSTAKE_INPUTS, MAX_STAKE_SEARCH_INTERVAL, STAKE_COMBINE_THRESHOLD},
    proof_of_stake_reward, Amount, CENT, COIN,
};
use umbra_primitives::hash::hash160;
use umbra_primitives::transaction::{Transaction, TxIn, TxOut};
use umbra_script::kernel::{check_stake_kernel_hash, coin_day_weight};
use umbra_script::sighash::{SighashType, SIGHASH_ALL};
use umbra_script::sign_input;
use umbra_script::standard::{extract_destination, p2pk_script_pubkey, ScriptDestination};
use umbra_storage::KeyValueStore;

use crate::coinselect::{select_coins_simple, SpendableOutput};
use crate::error::WalletError;
use crate::wallet::Wallet;
use crate::{current_unix_seconds, hex_str};

/// Size ceiling shared with the transaction builder.
const MAX_COINSTAKE_SIZE: usize = umbra_consensus::constants::MAX_BLOCK_SIZE_GEN / 5;
/// Extra confirmations beyond maturity a coin needs before staking.
const STAKE_CONF_MARGIN: i32 = 10;

/// Bounded age of an output: `min(now − t_out, max_age) − min_age`. Outputs
/// younger than the minimum age come out negative and never stake.
pub fn time_weight(t_out: i64, t_now: i64, min_age: i64, max_age: i64) -> i64 {
    (t_now - t_out).min(max_age) - min_age
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StakeWeight {
    /// Weight still below maximum age (can keep growing).
    pub min_weight: u64,
    /// Weight already at maximum age.
    pub max_weight: u64,
    /// Total effective weight.
    pub weight: u64,
}

impl<S: KeyValueStore> Wallet<S> {
    fn stakeable_coins<C: KeyValueStore>(
        &self,
        chain: &ChainView<C>,
        spend_time: i64,
    ) -> Result<Vec<SpendableOutput>, WalletError> {
        let balance = self.balance(chain)?;
        if balance <= self.reserve_balance {
            return Ok(Vec::new());
        }
        let min_conf = self.params().coinbase_maturity + STAKE_CONF_MARGIN;
        let coins = self.available_coins_min_conf(chain, min_conf)?;
        let (selected, _) =
            select_coins_simple(balance - self.reserve_balance, spend_time as u32, &coins);
        Ok(selected)
    }

    /// Aggregate stake weight over eligible coins.
    pub fn stake_weight<C: KeyValueStore>(
        &self,
        chain: &ChainView<C>,
    ) -> Result<StakeWeight, WalletError> {
        let now = current_unix_seconds();
        let params = self.params();
        let mut out = StakeWeight::default();
        for coin in self.stakeable_coins(chain, now)? {
            if chain.tx_entry(&coin.txid)?.is_none() {
                continue;
            }
            let age = time_weight(
                coin.tx_time as i64,
                now,
                params.stake_min_age,
                params.stake_max_age,
            );
            let weight = coin_day_weight(coin.value, age);
            if age > 0 {
                out.weight += weight;
            }
            if age > 0 && age < params.stake_max_age {
                out.min_weight += weight;
            }
            if age == params.stake_max_age {
                out.max_weight += weight;
            }
        }
        Ok(out)
    }

    /// Search eligible coins for a kernel under `bits` and assemble the
    /// coinstake. Returns `None` when no kernel hits in the window. The
    /// search aborts between attempts on `stop` or when the tip moves.
    pub fn create_coinstake<C: KeyValueStore>(
        &self,
        chain: &ChainView<C>,
        bits: u32,
        search_interval: i64,
        stop: &AtomicBool,
    ) -> Result<Option<Transaction>, WalletError> {
        let params = self.params();
        let spend_time = current_unix_seconds();
        let tip_at_start = chain.best_block_hash()?;

        let balance = self.balance(chain)?;
        if balance <= self.reserve_balance {
            return Ok(None);
        }
        let selected = self.stakeable_coins(chain, spend_time)?;
        if selected.is_empty() {
            return Ok(None);
        }

        let mut tx = Transaction::new(spend_time as u32);
        // First output is the coinstake marker.
        tx.vout.push(TxOut::empty_marker());

        let mut kernel_script: Vec<u8> = Vec::new();
        let mut kernel_coin: Option<&SpendableOutput> = None;
        let mut credit: Amount = 0;

        'coins: for coin in &selected {
            let Some(entry) = chain.tx_entry(&coin.txid)? else {
                continue;
            };
            let Some(block) = chain.read_block(&entry.block_hash)? else {
                continue;
            };
            let Some(prev_tx) = block
                .transactions
                .get(entry.index_in_block as usize)
                .cloned()
            else {
                continue;
            };
            let Some(tx_offset) = block.tx_offset(entry.index_in_block as usize) else {
                continue;
            };
            let block_time = block.header.time as i64;

            // Only coins meeting the minimum age requirement.
            if block_time + params.stake_min_age > spend_time - MAX_STAKE_SEARCH_INTERVAL {
                continue;
            }

            let window = search_interval.min(MAX_STAKE_SEARCH_INTERVAL).max(0);
            for n in 0..window {
                if stop.load(Ordering::Relaxed) || chain.best_block_hash()? != tip_at_start {
                    return Ok(None);
                }
                let attempt_time = (spend_time - n) as u32;
                let age = time_weight(
                    coin.tx_time as i64,
                    attempt_time as i64,
                    params.stake_min_age,
                    params.stake_max_age,
                );
                let weight = coin_day_weight(coin.value, age);
                let (found, _hash) = check_stake_kernel_hash(
                    bits,
                    &block.header,
                    tx_offset as u32,
                    &prev_tx,
                    &coin.outpoint(),
                    attempt_time,
                    weight,
                )
                .map_err(|_| WalletError::Corrupted("invalid stake target"))?;
                if !found {
                    continue;
                }

                umbra_log::log_debug!("create_coinstake: kernel found");
                let script = &prev_tx.vout[coin.vout as usize].script_pubkey;
                let script_out = match extract_destination(script) {
                    Some(ScriptDestination::PubKey(_)) => script.clone(),
                    Some(ScriptDestination::KeyHash(key_hash)) => {
                        // Upgrade pay-to-pubkey-hash to pay-to-pubkey.
                        let Some(pubkey_bytes) = self.keystore.pubkey_bytes(&key_hash) else {
                            umbra_log::log_debug!(
                                "create_coinstake: no key for kernel output"
                            );
                            break;
                        };
                        let Ok(pubkey) = PublicKey::from_slice(&pubkey_bytes) else {
                            break;
                        };
                        p2pk_script_pubkey(&pubkey)
                    }
                    _ => {
                        umbra_log::log_debug!("create_coinstake: unsupported kernel script");
                        break;
                    }
                };

                tx.time = attempt_time;
                tx.vin.push(TxIn::from_outpoint(coin.outpoint()));
                credit += coin.value;
                tx.vout.push(TxOut::new(0, script_out.clone()));
                kernel_script = script.clone();
                kernel_coin = Some(coin);

                // Young kernels split the stake across two outputs.
                if time_weight(
                    block_time,
                    tx.time as i64,
                    params.stake_min_age,
                    params.stake_max_age,
                ) < params.stake_split_age
                {
                    tx.vout.push(TxOut::new(0, script_out));
                }
                break 'coins;
            }
        }

        let Some(kernel) = kernel_coin else {
            return Ok(None);
        };
        if credit == 0 || credit > balance - self.reserve_balance {
            return Ok(None);
        }

        // Combine small same-key inputs into the stake.
        if tx.vout.len() == 2 {
            for coin in &selected {
                if coin.txid == kernel.txid {
                    continue;
                }
                let same_script = self
                    .get_tx(&coin.txid)
                    .and_then(|wtx| wtx.tx.vout.get(coin.vout as usize))
                    .map(|out| {
                        out.script_pubkey == kernel_script
                            || out.script_pubkey == tx.vout[1].script_pubkey
                    })
                    .unwrap_or(false);
                if !same_script {
                    continue;
                }
                let age = time_weight(
                    coin.tx_time as i64,
                    tx.time as i64,
                    params.stake_min_age,
                    params.stake_max_age,
                );
                if tx.vin.len() >= MAX_COINSTAKE_INPUTS {
                    break;
                }
                if credit >= STAKE_COMBINE_THRESHOLD {
                    break;
                }
                if credit + coin.value > balance - self.reserve_balance {
                    break;
                }
                if coin.value >= STAKE_COMBINE_THRESHOLD {
                    continue;
                }
                if age < params.stake_min_age {
                    continue;
                }
                tx.vin.push(TxIn::from_outpoint(coin.outpoint()));
                credit += coin.value;
            }
        }

        // Coin-age reward.
        let coin_days = self.transaction_coin_days(&tx)?;
        let reward = proof_of_stake_reward(coin_days);
        if reward <= 0 {
            return Ok(None);
        }
        credit += reward;

        if tx.vout.len() == 3 {
            tx.vout[1].value = (credit / 2 / CENT) * CENT;
            tx.vout[2].value = credit - tx.vout[1].value;
        } else {
            tx.vout[1].value = credit;
        }

        for index in 0..tx.vin.len() {
            let prevout = tx.vin[index].prevout;
            let prev_script = self
                .get_tx(&prevout.hash)
                .and_then(|wtx| wtx.tx.vout.get(prevout.index as usize))
                .map(|out| out.script_pubkey.clone())
                .ok_or(WalletError::Corrupted("coinstake input missing from wallet"))?;
            let script_sig = sign_input(
                &self.keystore,
                &tx,
                index,
                &prev_script,
                SighashType(SIGHASH_ALL),
            )?;
            tx.vin[index].script_sig = script_sig;
        }

        if tx.serialized_size() >= MAX_COINSTAKE_SIZE {
            umbra_log::log_warn!("create_coinstake: exceeded coinstake size limit");
            return Err(WalletError::TransactionTooLarge);
        }

        umbra_log::log_info!(
            "create_coinstake: staking {} input(s) for {} at {}",
            tx.vin.len(),
            credit,
            hex_str(&tx.txid()[..8])
        );
        Ok(Some(tx))
    }

    /// Coin-days destroyed by a transaction's inputs at its timestamp.
    fn transaction_coin_days(&self, tx: &Transaction) -> Result<u64, WalletError> {
        let mut cent_seconds: u128 = 0;
        for txin in &tx.vin {
            let Some(prev) = self.get_tx(&txin.prevout.hash) else {
                continue;
            };
            let Some(out) = prev.tx.vout.get(txin.prevout.index as usize) else {
                continue;
            };
            if (tx.time as i64) < prev.tx.time as i64 {
                continue;
            }
            let age_seconds = (tx.time - prev.tx.time) as u128;
            cent_seconds += (out.value as u128) * age_seconds / CENT as u128;
        }
        Ok((cent_seconds * CENT as u128 / COIN as u128 / 86_400) as u64)
    }
}

/// Is this wallet's key behind the second output of a coinstake we mined?
/// Used when signing freshly minted blocks.
pub fn coinstake_key_hash(tx: &Transaction) -> Option<[u8; 20]> {
    if !tx.is_coinstake() {
        return None;
    }
    match extract_destination(&tx.vout[1].script_pubkey)? {
        ScriptDestination::PubKey(pubkey) => Some(hash160(&pubkey)),
        ScriptDestination::KeyHash(hash) => Some(hash),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::Secp256k1;

    #[test]
    fn time_weight_clamps_both_ends() {
        let min_age = 60 * 60;
        let max_age = 30 * 24 * 60 * 60;
        // Too young: negative.
        assert!(time_weight(1_000, 1_500, min_age, max_age) < 0);
        // Old enough: linear in age.
        assert_eq!(
            time_weight(0, min_age + 100, min_age, max_age),
            100
        );
        // Saturates at max age.
        assert_eq!(
            time_weight(0, max_age * 2, min_age, max_age),
            max_age - min_age
        );
    }

    #[test]
    fn coinstake_key_hash_reads_second_output() {
        use umbra_primitives::outpoint::OutPoint;

        let secp = Secp256k1::new();
        let secret = secp256k1::SecretKey::from_slice(&[5u8; 32]).expect("secret");
        let pubkey = PublicKey::from_secret_key(&secp, &secret);

        let mut tx = Transaction::new(0);
        tx.vin.push(TxIn::from_outpoint(OutPoint::new([1u8; 32], 0)));
        tx.vout.push(TxOut::empty_marker());
        tx.vout.push(TxOut::new(0, p2pk_script_pubkey(&pubkey)));
        assert_eq!(
            coinstake_key_hash(&tx),
            Some(hash160(&pubkey.serialize()))
        );
    }
}
