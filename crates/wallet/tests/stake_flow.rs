//! Proof-of-stake kernel search and coinstake assembly.

mod common;

use std::sync::atomic::AtomicBool;

use common::Harness;
use umbra_consensus::COIN;

/// Maximal compact target: every kernel hash qualifies as long as the
/// coin-day weight is positive.
const EASY_BITS: u32 = 0x2100_ffff;
/// Compact target of zero: nothing can qualify.
const IMPOSSIBLE_BITS: u32 = 0x0100_0000;

#[test]
fn aged_coin_finds_kernel_and_splits() {
    let mut harness = Harness::new();
    let mut wallet = harness.new_wallet();
    // Regtest stake_min_age is 60 s; the harness starts block times an hour
    // in the past, so the funding coin is comfortably aged.
    harness.fund(&mut wallet, &[100 * COIN]);
    harness.confirm(12);
    harness.sync(&mut wallet);

    let weight = wallet.stake_weight(&harness.chain).expect("weight");
    assert!(weight.weight > 0, "aged coin must carry stake weight");

    let stop = AtomicBool::new(false);
    let coinstake = wallet
        .create_coinstake(&harness.chain, EASY_BITS, 60, &stop)
        .expect("search")
        .expect("kernel expected under the permissive target");

    assert!(coinstake.is_coinstake());
    assert!(coinstake.vout[0].is_empty_marker());
    // An hour-old kernel is far below the 20-day split age: stake splits
    // into two value outputs.
    assert_eq!(coinstake.vout.len(), 3);

    // The staked credit covers the input plus a nonnegative reward.
    let staked: i64 = coinstake.vout.iter().map(|out| out.value).sum();
    assert!(staked >= 100 * COIN);

    // All inputs are signed.
    for txin in &coinstake.vin {
        assert!(!txin.script_sig.is_empty());
    }
}

#[test]
fn impossible_target_finds_nothing() {
    let mut harness = Harness::new();
    let mut wallet = harness.new_wallet();
    harness.fund(&mut wallet, &[100 * COIN]);
    harness.confirm(12);
    harness.sync(&mut wallet);

    let stop = AtomicBool::new(false);
    let result = wallet
        .create_coinstake(&harness.chain, IMPOSSIBLE_BITS, 60, &stop)
        .expect("search");
    assert!(result.is_none());
}

#[test]
fn shutdown_flag_aborts_search() {
    let mut harness = Harness::new();
    let mut wallet = harness.new_wallet();
    harness.fund(&mut wallet, &[100 * COIN]);
    harness.confirm(12);
    harness.sync(&mut wallet);

    let stop = AtomicBool::new(true);
    let result = wallet
        .create_coinstake(&harness.chain, EASY_BITS, 60, &stop)
        .expect("search");
    assert!(result.is_none());
}

#[test]
fn reserve_balance_blocks_staking() {
    let mut harness = Harness::new();
    let mut wallet = harness.new_wallet();
    harness.fund(&mut wallet, &[100 * COIN]);
    harness.confirm(12);
    harness.sync(&mut wallet);

    wallet.reserve_balance = 200 * COIN;
    let stop = AtomicBool::new(false);
    let result = wallet
        .create_coinstake(&harness.chain, EASY_BITS, 60, &stop)
        .expect("search");
    assert!(result.is_none());
    assert_eq!(
        wallet.stake_weight(&harness.chain).expect("weight").weight,
        0
    );
}

#[test]
fn orphaned_coinstake_inputs_become_selectable_again() {
    let mut harness = Harness::new();
    let mut wallet = harness.new_wallet();
    let funding_txid = harness.fund(&mut wallet, &[100 * COIN]);
    harness.confirm(12);
    harness.sync(&mut wallet);

    let stop = AtomicBool::new(false);
    let coinstake = wallet
        .create_coinstake(&harness.chain, EASY_BITS, 60, &stop)
        .expect("search")
        .expect("kernel");

    // Stake is accepted into a block; the wallet sees its input spent.
    harness.mine_block(vec![coinstake.clone()]);
    harness.sync(&mut wallet);
    assert!(wallet.get_tx(&funding_txid).expect("funding").is_spent(0));

    // Reorg orphans the coinstake: inputs must be selectable again.
    harness.chain.disconnect_tip().expect("disconnect");
    wallet.disable_coinstake(&coinstake).expect("disable");
    assert!(!wallet.get_tx(&funding_txid).expect("funding").is_spent(0));
}
