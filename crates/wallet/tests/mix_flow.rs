//! Three wallets drive the escrow mixer end to end over one shared chain.

mod common;

use std::collections::HashSet;

use common::{Harness, TestWallet};
use umbra_consensus::{
    constants::{mix_paid_fee, mix_service_fee, MIX_DISTRIBUTION_TX_FEE},
    Amount, COIN,
};
use umbra_wallet::{
    mix::MixOutbound, service::ServiceUpdate, MixMessage, MixRole, MixStatus, SeededSelectorRng,
};

struct MixNet {
    harness: Harness,
    sender: TestWallet,
    mixer: TestWallet,
    guarantor: TestWallet,
}

impl MixNet {
    /// Fund three wallets, register the service directory entries, and
    /// resolve which of the two service peers the sender picks as mixer.
    fn setup(seed: u64) -> (Self, MixMessage) {
        let mut harness = Harness::new();
        let mut sender = harness.new_wallet();
        let mut peer_b = harness.new_wallet();
        let mut peer_c = harness.new_wallet();

        harness.fund(&mut sender, &[15 * COIN, 10 * COIN]);
        harness.fund(&mut peer_b, &[12 * COIN, 11 * COIN]);
        harness.fund(&mut peer_c, &[12 * COIN, 11 * COIN]);
        harness.confirm(8);
        harness.sync(&mut sender);
        harness.sync(&mut peer_b);
        harness.sync(&mut peer_c);

        let addr_b = peer_b.self_address(&harness.chain).expect("b").expect("addr");
        let addr_c = peer_c.self_address(&harness.chain).expect("c").expect("addr");
        let addr_a = sender.self_address(&harness.chain).expect("a").expect("addr");

        let connected: HashSet<String> =
            ["b.onion", "c.onion", "a.onion"].iter().map(|s| s.to_string()).collect();
        for (key, host) in [(addr_b.clone(), "b.onion"), (addr_c.clone(), "c.onion")] {
            assert_ne!(
                sender.services.update(&key, host, true, &connected, false),
                ServiceUpdate::Ignored
            );
        }
        peer_b
            .services
            .update(&addr_c, "c.onion", true, &connected, false);
        peer_b
            .services
            .update(&addr_a, "a.onion", true, &connected, false);
        peer_c
            .services
            .update(&addr_b, "b.onion", true, &connected, false);
        peer_c
            .services
            .update(&addr_a, "a.onion", true, &connected, false);

        // Two destinations totalling the 10 COIN base.
        let dest1 = sender.new_address("dest one").expect("address");
        let dest2 = sender.new_address("dest two").expect("address");
        let targets = vec![(dest1, 6 * COIN), (dest2, 4 * COIN)];

        let mut rng = SeededSelectorRng::new(seed);
        let (mixer_host, query) = sender
            .start_mix_send(&harness.chain, &mut rng, targets, None)
            .expect("start mix");

        // Whoever the sender picked becomes the mixer.
        let (mixer, guarantor) = if mixer_host == "b.onion" {
            (peer_b, peer_c)
        } else {
            (peer_c, peer_b)
        };

        (
            Self {
                harness,
                sender,
                mixer,
                guarantor,
            },
            query,
        )
    }

    fn wallet_for(&mut self, role: MixRole) -> &mut TestWallet {
        match role {
            MixRole::Sender => &mut self.sender,
            MixRole::Mixer => &mut self.mixer,
            MixRole::Guarantor => &mut self.guarantor,
        }
    }

    /// Deliver pubkey-phase traffic in order, fanning out whatever it
    /// provokes.
    fn deliver_handshake(&mut self, batch: Vec<MixOutbound>) {
        let mut queue: std::collections::VecDeque<MixOutbound> = batch.into();
        while let Some(MixOutbound { to, message }) = queue.pop_front() {
            let followups = match &message {
                MixMessage::AvailabilityQuery { .. } => {
                    let harness = &self.harness;
                    let chain_msgs = self
                        .guarantor
                        .handle_forwarded_query(&harness.chain, &message)
                        .expect("forwarded query");
                    chain_msgs
                }
                MixMessage::AvailabilityReply { .. } => self
                    .sender
                    .handle_availability_reply(&message)
                    .expect("availability reply"),
                MixMessage::PubkeyExchange { .. } => self
                    .wallet_for(to)
                    .handle_pubkey_exchange(&message)
                    .expect("pubkey exchange"),
                MixMessage::MultisigAddress { .. } => {
                    self.wallet_for(to)
                        .handle_multisig_address(&message)
                        .expect("multisig address");
                    Vec::new()
                }
                other => panic!("unexpected handshake message {other:?}"),
            };
            queue.extend(followups);
        }
    }
}

#[test]
fn mix_happy_path_distributes_escrow_and_delivers_payment() {
    let (mut net, query) = MixNet::setup(20_26);
    let base = 10 * COIN;
    let paid_fee = mix_paid_fee(base);
    let service_fee = mix_service_fee(base);

    // Phase 1: availability, pubkeys, escrow address.
    let mut rng = SeededSelectorRng::new(99);
    let outbound = net
        .mixer
        .handle_availability_query(&net.harness.chain, &mut rng, &query)
        .expect("availability query");
    net.deliver_handshake(outbound);

    for wallet in [&net.sender, &net.mixer, &net.guarantor] {
        assert_eq!(wallet.mix_status(), MixStatus::MultisigAddr);
    }
    let escrow = net
        .sender
        .active_mix()
        .expect("sender mix")
        .multisig_address
        .clone()
        .expect("escrow address");
    assert_eq!(
        net.mixer
            .active_mix()
            .expect("mixer mix")
            .multisig_address
            .clone()
            .expect("escrow address"),
        escrow
    );

    // Phase 2: deposits. Sender escrows 2·base + fee; peers escrow base.
    let mut deposit_notices = Vec::new();
    let mut deposit_txids = Vec::new();
    for role in [MixRole::Sender, MixRole::Mixer, MixRole::Guarantor] {
        let mut rng = SeededSelectorRng::new(role as u64 + 400);
        let (harness, wallet) = match role {
            MixRole::Sender => (&mut net.harness, &mut net.sender),
            MixRole::Mixer => (&mut net.harness, &mut net.mixer),
            MixRole::Guarantor => (&mut net.harness, &mut net.guarantor),
        };
        let notices = wallet
            .deposit_to_escrow(
                &harness.chain,
                &mut harness.mempool,
                &harness.relay,
                &mut rng,
            )
            .expect("deposit");
        let info = wallet.active_mix().expect("mix");
        let txid = info.party(role).deposit_txid.expect("own deposit txid");
        deposit_txids.push(txid);
        deposit_notices.extend(notices);
    }

    // Deposits confirm before anyone verifies.
    net.harness.mine_mempool(
        &deposit_txids.clone(),
        &mut [&mut net.sender, &mut net.mixer, &mut net.guarantor],
    );

    let mut verified_notes = Vec::new();
    for MixOutbound { to, message } in deposit_notices {
        let wallet = match to {
            MixRole::Sender => &mut net.sender,
            MixRole::Mixer => &mut net.mixer,
            MixRole::Guarantor => &mut net.guarantor,
        };
        let outs = wallet
            .handle_deposit_notice(&net.harness.chain, &message)
            .expect("deposit notice");
        verified_notes.extend(outs);
    }
    for wallet in [&net.sender, &net.mixer, &net.guarantor] {
        assert_eq!(wallet.mix_status(), MixStatus::DepositsVerified);
    }

    // The sender's destination list travels to the mixer only.
    for MixOutbound { to, message } in verified_notes {
        if let MixMessage::SendTargets { .. } = &message {
            assert_eq!(to, MixRole::Mixer);
            net.mixer.handle_send_targets(&message).expect("targets");
        }
    }

    // Phase 3: the mixer drafts and first-signs; the guarantor completes.
    net.mixer
        .create_distribution_tx(&net.harness.chain)
        .expect("draft");
    let signed_once = net.mixer.sign_distribution_tx().expect("first signature");
    assert_eq!(net.mixer.mix_status(), MixStatus::SignedOnce);

    net.guarantor
        .handle_distribution_tx(&MixMessage::DistributionTx {
            mix_id: net.mixer.active_mix().expect("mix").mix_id.clone(),
            tx: signed_once,
            signed_count: 1,
        })
        .expect("adopt draft");
    net.guarantor
        .sign_distribution_tx()
        .expect("second signature");
    assert_eq!(net.guarantor.mix_status(), MixStatus::SignedComplete);

    let distribution_txid = {
        let harness = &mut net.harness;
        net.guarantor
            .send_distribution_tx(&harness.chain, &mut harness.mempool, &harness.relay)
            .expect("broadcast")
    };
    assert_eq!(net.guarantor.mix_status(), MixStatus::Complete);

    // Distribution pays sender base, mixer 2·base + service fee, guarantor
    // base + service fee; total deposits minus the reserved miner fee.
    let distribution = net
        .harness
        .mempool
        .get(&distribution_txid)
        .expect("in mempool")
        .clone();
    assert_eq!(distribution.vin.len(), 3);
    assert_eq!(distribution.vout.len(), 3);
    assert_eq!(distribution.vout[0].value, base);
    assert_eq!(distribution.vout[1].value, 2 * base + service_fee);
    assert_eq!(distribution.vout[2].value, base + service_fee);
    let outputs_total: Amount = distribution.vout.iter().map(|out| out.value).sum();
    let deposits_total = (2 * base + paid_fee) + base + base;
    assert_eq!(outputs_total, deposits_total - MIX_DISTRIBUTION_TX_FEE);

    let committed = MixMessage::DistributionCommitted {
        mix_id: net.sender.active_mix().expect("mix").mix_id.clone(),
        txid: distribution_txid,
    };
    net.sender
        .handle_distribution_committed(&committed)
        .expect("sender commit note");
    net.mixer
        .handle_distribution_committed(&committed)
        .expect("mixer commit note");
    assert_eq!(net.sender.mix_status(), MixStatus::Complete);

    // Phase 4: escrow unwinds on-chain, then the mixer delivers the real
    // payment out of its payout.
    net.harness.mine_mempool(
        &[distribution_txid],
        &mut [&mut net.sender, &mut net.mixer, &mut net.guarantor],
    );
    net.harness.confirm(1);
    net.harness.sync(&mut net.mixer);

    let (send_txid, notice) = {
        let harness = &mut net.harness;
        let mut rng = SeededSelectorRng::new(777);
        net.mixer
            .send_coins_to_destination(
                &harness.chain,
                &mut harness.mempool,
                &harness.relay,
                &mut rng,
            )
            .expect("payment delivery")
    };
    net.harness
        .mine_mempool(&[send_txid], &mut [&mut net.sender, &mut net.mixer]);

    let verified = net
        .sender
        .check_send_tx(&net.harness.chain, &notice.message)
        .expect("check send tx");
    assert!(verified, "sender must see the full base amount delivered");
}

#[test]
fn second_mix_rejected_while_first_active() {
    let (mut net, _query) = MixNet::setup(42);
    assert!(net.sender.is_mix_in_process());

    let dest = net.sender.new_address("other").expect("address");
    let mut rng = SeededSelectorRng::new(1);
    let err = net
        .sender
        .start_mix_send(&net.harness.chain, &mut rng, vec![(dest, COIN)], None)
        .unwrap_err();
    assert!(matches!(err, umbra_wallet::WalletError::MixInProgress));
}

#[test]
fn stale_pre_escrow_mix_resets_after_timeout() {
    let (mut net, _query) = MixNet::setup(42);
    assert!(net.sender.is_mix_in_process());

    // Push the instance past the 3-minute idle window; it is still before
    // any escrow deposit, so it may be discarded.
    net.sender.active_mix_mut().expect("mix").last_activity -= 200;
    assert!(!net.sender.is_mix_in_process());

    let dest = net.sender.new_address("retry").expect("address");
    let mut rng = SeededSelectorRng::new(2);
    net.sender
        .start_mix_send(&net.harness.chain, &mut rng, vec![(dest, COIN)], None)
        .expect("fresh mix after timeout");
}
