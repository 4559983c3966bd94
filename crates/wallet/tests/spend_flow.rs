//! End-to-end spend construction against an in-memory chain.

mod common;

use common::Harness;
use umbra_consensus::{Amount, CENT, COIN, MIN_TX_FEE};
use umbra_primitives::address::address_to_script_pubkey;
use umbra_wallet::{SeededSelectorRng, WalletError};

#[test]
fn simple_send_prefers_single_larger_coin() {
    let mut harness = Harness::new();
    let mut wallet = harness.new_wallet();
    harness.fund(&mut wallet, &[5 * COIN, 3 * COIN, COIN]);
    harness.confirm(6);
    harness.sync(&mut wallet);
    assert_eq!(wallet.balance(&harness.chain).expect("balance"), 9 * COIN);

    let payee_script = address_to_script_pubkey(
        &wallet.new_address("payee").expect("address"),
        wallet.network,
    )
    .expect("script");
    let target = 5 * COIN / 2;

    let mut rng = SeededSelectorRng::new(1234);
    let built = wallet
        .create_transaction(
            &harness.chain,
            &mut rng,
            &[(payee_script.clone(), target)],
            None,
            None,
        )
        .expect("create");

    // Only the 1 COIN output is below target + CENT, so the selector must
    // fall back to the smallest larger coin: exactly one 3 COIN input.
    assert_eq!(built.wtx.tx.vin.len(), 1);
    let input_value = wallet
        .get_tx(&built.wtx.tx.vin[0].prevout.hash)
        .expect("prev")
        .tx
        .vout[built.wtx.tx.vin[0].prevout.index as usize]
        .value;
    assert_eq!(input_value, 3 * COIN);

    // One payee output plus one change output.
    assert_eq!(built.wtx.tx.vout.len(), 2);
    let payee_out: Amount = built
        .wtx
        .tx
        .vout
        .iter()
        .filter(|out| out.script_pubkey == payee_script)
        .map(|out| out.value)
        .sum();
    assert_eq!(payee_out, target);

    // Change correctness: inputs − payees − change = fee ≥ the policy floor.
    let change: Amount = built
        .wtx
        .tx
        .vout
        .iter()
        .filter(|out| out.script_pubkey != payee_script)
        .map(|out| out.value)
        .sum();
    assert_eq!(input_value - target - change, built.fee);
    let bytes = built.wtx.tx.serialized_size() as Amount;
    assert!(built.fee >= MIN_TX_FEE * (1 + bytes / 1000));
}

#[test]
fn subset_sum_gathers_half_coins() {
    let mut harness = Harness::new();
    let mut wallet = harness.new_wallet();
    harness.fund(&mut wallet, &[COIN / 2, COIN / 2, COIN / 2, COIN / 2]);
    harness.confirm(6);
    harness.sync(&mut wallet);

    let payee_script = address_to_script_pubkey(
        &wallet.new_address("payee").expect("address"),
        wallet.network,
    )
    .expect("script");
    let target = 12 * COIN / 10;

    let mut rng = SeededSelectorRng::new(77);
    let built = wallet
        .create_transaction(&harness.chain, &mut rng, &[(payee_script, target)], None, None)
        .expect("create");

    // Three or four half-coins cover 1.2 COIN.
    assert!(built.wtx.tx.vin.len() >= 3);
    let input_total: Amount = built
        .wtx
        .tx
        .vin
        .iter()
        .map(|txin| {
            wallet.get_tx(&txin.prevout.hash).expect("prev").tx.vout
                [txin.prevout.index as usize]
                .value
        })
        .sum();
    let output_total: Amount = built.wtx.tx.vout.iter().map(|out| out.value).sum();
    assert_eq!(input_total - output_total, built.fee);
    assert!(input_total >= target);
}

#[test]
fn narration_rides_directly_after_its_value_output() {
    let mut harness = Harness::new();
    let mut wallet = harness.new_wallet();
    harness.fund(&mut wallet, &[2 * COIN, 3 * COIN]);
    harness.confirm(6);
    harness.sync(&mut wallet);

    let payee_script = address_to_script_pubkey(
        &wallet.new_address("payee").expect("address"),
        wallet.network,
    )
    .expect("script");

    // Several seeds so the random change position gets exercised.
    for seed in [3u64, 17, 99, 1234, 5150] {
        let mut rng = SeededSelectorRng::new(seed);
        let built = wallet
            .create_transaction(
                &harness.chain,
                &mut rng,
                &[(payee_script.clone(), COIN)],
                Some("rent"),
                None,
            )
            .expect("create");
        let narration_index = built
            .wtx
            .tx
            .vout
            .iter()
            .position(|out| out.value == 0 && out.script_pubkey.first() == Some(&0x6a))
            .expect("narration output");
        assert!(narration_index > 0, "narration cannot lead the outputs");
        let preceding = &built.wtx.tx.vout[narration_index - 1];
        assert_eq!(preceding.script_pubkey, payee_script);
        assert_eq!(preceding.value, COIN);
        // Release the reserved change key back for the next round.
        if let Some(reserved) = built.change_key {
            wallet.keypool.release(reserved);
        }
    }
}

#[test]
fn narration_length_enforced() {
    let mut harness = Harness::new();
    let mut wallet = harness.new_wallet();
    harness.fund(&mut wallet, &[2 * COIN]);
    harness.confirm(6);
    harness.sync(&mut wallet);

    let address = wallet.new_address("payee").expect("address");
    let mut rng = SeededSelectorRng::new(5);
    let err = wallet
        .send_to_destination(
            &harness.chain,
            &mut harness.mempool,
            &harness.relay,
            &mut rng,
            &address,
            COIN,
            Some("a narration that is far too long"),
        )
        .unwrap_err();
    assert!(matches!(err, WalletError::NarrationTooLong));
}

#[test]
fn commit_marks_inputs_spent_and_relays() {
    let mut harness = Harness::new();
    let mut wallet = harness.new_wallet();
    let funding_txid = harness.fund(&mut wallet, &[4 * COIN]);
    harness.confirm(6);
    harness.sync(&mut wallet);

    let address = wallet.new_address("payee").expect("address");
    let mut rng = SeededSelectorRng::new(2);
    let txid = wallet
        .send_to_destination(
            &harness.chain,
            &mut harness.mempool,
            &harness.relay,
            &mut rng,
            &address,
            COIN,
            None,
        )
        .expect("send");

    assert!(harness.mempool.contains(&txid));
    assert_eq!(harness.relay.relayed(), vec![txid]);
    let funding = wallet.get_tx(&funding_txid).expect("funding");
    assert!(funding.is_spent(0));

    // The same coin cannot be selected again.
    let mut rng = SeededSelectorRng::new(3);
    let err = wallet
        .create_transaction(
            &harness.chain,
            &mut rng,
            &[(vec![0x51], 35 * COIN / 10)],
            None,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, WalletError::InsufficientFunds));
}

#[test]
fn spent_bits_reconcile_with_chain_index() {
    let mut harness = Harness::new();
    let mut wallet = harness.new_wallet();
    let funding_txid = harness.fund(&mut wallet, &[4 * COIN]);
    harness.confirm(6);
    harness.sync(&mut wallet);

    // Healthy wallet: the check-only pass reports nothing.
    let (mismatches, _) = wallet.fix_spent_coins(&harness.chain, true).expect("check");
    assert_eq!(mismatches, 0);

    // Commit a spend that never confirms: the wallet marks the funding
    // output spent, but the authoritative index still shows it unspent.
    let address = wallet.new_address("payee").expect("address");
    let mut rng = SeededSelectorRng::new(9);
    wallet
        .send_to_destination(
            &harness.chain,
            &mut harness.mempool,
            &harness.relay,
            &mut rng,
            &address,
            COIN,
            None,
        )
        .expect("send");
    assert!(wallet.get_tx(&funding_txid).expect("funding").is_spent(0));

    let (mismatches, amount) = wallet.fix_spent_coins(&harness.chain, false).expect("fix");
    assert_eq!(mismatches, 1);
    assert_eq!(amount, 4 * COIN);
    assert!(!wallet.get_tx(&funding_txid).expect("funding").is_spent(0));

    // Idempotent under repeat.
    let (mismatches, _) = wallet.fix_spent_coins(&harness.chain, false).expect("fix");
    assert_eq!(mismatches, 0);
}

#[test]
fn order_pos_strictly_increases() {
    let mut harness = Harness::new();
    let mut wallet = harness.new_wallet();
    for _ in 0..3 {
        harness.fund(&mut wallet, &[COIN]);
    }
    harness.confirm(2);
    harness.sync(&mut wallet);

    let mut positions: Vec<i64> = Vec::new();
    for txid in wallet.tx_ids() {
        positions.push(wallet.get_tx(&txid).expect("tx").order_pos);
    }
    positions.sort();
    for pair in positions.windows(2) {
        assert!(pair[0] < pair[1], "order_pos not strictly increasing");
    }
}

#[test]
fn sub_dust_change_folds_into_fee() {
    let mut harness = Harness::new();
    let mut wallet = harness.new_wallet();
    harness.fund(&mut wallet, &[COIN]);
    harness.confirm(6);
    harness.sync(&mut wallet);

    // Leave less than the dust threshold as change: it must fold into the
    // fee instead of creating an output.
    let payee_script = vec![0x51];
    let target = COIN - MIN_TX_FEE - MIN_TX_FEE / 2;
    let mut rng = SeededSelectorRng::new(4);
    let built = wallet
        .create_transaction(&harness.chain, &mut rng, &[(payee_script, target)], None, None)
        .expect("create");
    assert_eq!(built.wtx.tx.vout.len(), 1);
    assert_eq!(built.fee, COIN - target);
    assert!(built.fee < CENT);
}
