//! Stealth payments between two wallets sharing one chain.

mod common;

use common::Harness;
use umbra_consensus::COIN;
use umbra_wallet::SeededSelectorRng;

#[test]
fn stealth_payment_round_trip_with_narration() {
    let mut harness = Harness::new();
    let mut sender = harness.new_wallet();
    let mut receiver = harness.new_wallet();
    harness.fund(&mut sender, &[5 * COIN]);
    harness.confirm(6);
    harness.sync(&mut sender);

    let stealth_address = receiver
        .new_stealth_address("donations")
        .expect("stealth address");

    let mut rng = SeededSelectorRng::new(31);
    let txid = sender
        .send_to_stealth_destination(
            &harness.chain,
            &mut harness.mempool,
            &harness.relay,
            &mut rng,
            &stealth_address,
            2 * COIN,
            Some("thank you"),
        )
        .expect("stealth send");

    // The receiver discovers the payment by scanning the transaction.
    let tx = harness.mempool.get(&txid).expect("in mempool").clone();
    let involved = receiver
        .add_to_wallet_if_involving_me(&tx, None, true, &harness.chain)
        .expect("scan");
    assert!(involved, "receiver must recognise the stealth output");

    let wtx = receiver.get_tx(&txid).expect("wallet copy");
    assert_eq!(receiver.tx_credit(&wtx.tx), 2 * COIN);

    // The narration decrypted against the shared secret.
    let narration = wtx
        .map_value
        .values()
        .find(|value| value.as_str() == "thank you");
    assert!(narration.is_some(), "narration must decrypt for the receiver");

    // Once mined, the output is spendable by the receiver.
    harness.mine_mempool(&[txid], &mut [&mut sender, &mut receiver]);
    harness.confirm(6);
    harness.sync(&mut receiver);
    assert_eq!(
        receiver.balance(&harness.chain).expect("balance"),
        2 * COIN
    );
}

#[test]
fn sender_cannot_link_two_payments() {
    let mut harness = Harness::new();
    let mut sender = harness.new_wallet();
    let mut receiver = harness.new_wallet();
    harness.fund(&mut sender, &[6 * COIN]);
    harness.confirm(6);
    harness.sync(&mut sender);

    let stealth_address = receiver.new_stealth_address("").expect("stealth address");

    let mut rng = SeededSelectorRng::new(8);
    let first = sender
        .send_to_stealth_destination(
            &harness.chain,
            &mut harness.mempool,
            &harness.relay,
            &mut rng,
            &stealth_address,
            COIN,
            None,
        )
        .expect("first send");
    harness.mine_mempool(&[first], &mut [&mut sender]);
    let second = sender
        .send_to_stealth_destination(
            &harness.chain,
            &mut harness.mempool,
            &harness.relay,
            &mut rng,
            &stealth_address,
            COIN,
            None,
        )
        .expect("second send");

    // The two one-time destinations differ even though the published
    // stealth address is the same.
    let first_tx = harness
        .chain
        .get_transaction(&first)
        .expect("lookup")
        .expect("mined")
        .0;
    let second_tx = harness.mempool.get(&second).expect("in pool").clone();
    let dest = |tx: &umbra_primitives::Transaction| {
        tx.vout
            .iter()
            .find(|out| out.value == COIN)
            .expect("value output")
            .script_pubkey
            .clone()
    };
    assert_ne!(dest(&first_tx), dest(&second_tx));
}

#[test]
fn locked_receiver_expands_keys_on_unlock() {
    let mut harness = Harness::new();
    let mut sender = harness.new_wallet();
    let mut receiver = harness.new_wallet();
    harness.fund(&mut sender, &[5 * COIN]);
    // Give the receiver a key so it can encrypt at all.
    harness.fund(&mut receiver, &[COIN]);
    harness.confirm(6);
    harness.sync(&mut sender);
    harness.sync(&mut receiver);

    let stealth_address = receiver
        .new_stealth_address("cold tips")
        .expect("stealth address");
    receiver.encrypt_wallet("vault").expect("encrypt");
    assert!(receiver.keystore.is_locked());

    let mut rng = SeededSelectorRng::new(55);
    let txid = sender
        .send_to_stealth_destination(
            &harness.chain,
            &mut harness.mempool,
            &harness.relay,
            &mut rng,
            &stealth_address,
            3 * COIN,
            None,
        )
        .expect("stealth send");

    // Locked: the match is recorded, but only as pending metadata.
    let tx = harness.mempool.get(&txid).expect("in mempool").clone();
    let involved = receiver
        .add_to_wallet_if_involving_me(&tx, None, true, &harness.chain)
        .expect("scan");
    assert!(involved);
    assert_eq!(receiver.stealth.pending_count(), 1);

    // Unlock expands the pending match into a concrete spend key.
    receiver.unlock_wallet("vault", false).expect("unlock");
    assert_eq!(receiver.stealth.pending_count(), 0);

    harness.mine_mempool(&[txid], &mut [&mut receiver]);
    harness.confirm(6);
    harness.sync(&mut receiver);
    assert_eq!(
        receiver.balance(&harness.chain).expect("balance"),
        4 * COIN
    );
}
