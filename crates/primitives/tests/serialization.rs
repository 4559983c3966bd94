//! Randomized round-trip checks over the consensus codec.

use umbra_consensus::Hash256;
use umbra_primitives::encoding::{decode, encode};
use umbra_primitives::outpoint::OutPoint;
use umbra_primitives::transaction::{Transaction, TxIn, TxOut};

struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn next_u8(&mut self) -> u8 {
        self.next_u64() as u8
    }

    fn gen_range(&mut self, max: usize) -> usize {
        if max == 0 {
            0
        } else {
            (self.next_u64() % max as u64) as usize
        }
    }
}

fn random_hash(rng: &mut Lcg) -> Hash256 {
    std::array::from_fn(|_| rng.next_u8())
}

fn random_script(rng: &mut Lcg, max_len: usize) -> Vec<u8> {
    let len = rng.gen_range(max_len + 1);
    (0..len).map(|_| rng.next_u8()).collect()
}

fn random_transaction(rng: &mut Lcg) -> Transaction {
    let mut tx = Transaction::new(rng.next_u64() as u32);
    for _ in 0..(1 + rng.gen_range(4)) {
        tx.vin.push(TxIn {
            prevout: OutPoint::new(random_hash(rng), rng.next_u64() as u32),
            script_sig: random_script(rng, 120),
            sequence: rng.next_u64() as u32,
        });
    }
    for _ in 0..(1 + rng.gen_range(4)) {
        tx.vout.push(TxOut::new(
            (rng.next_u64() % 1_000_000_000) as i64,
            random_script(rng, 80),
        ));
    }
    tx.lock_time = rng.next_u64() as u32;
    tx
}

#[test]
fn transactions_round_trip() {
    let mut rng = Lcg::new(0xdead_beef);
    for _ in 0..200 {
        let tx = random_transaction(&mut rng);
        let bytes = encode(&tx);
        let decoded: Transaction = decode(&bytes).expect("decode");
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid(), tx.txid());
    }
}

#[test]
fn txid_commits_to_every_field() {
    let mut rng = Lcg::new(7);
    let tx = random_transaction(&mut rng);
    let original = tx.txid();

    let mut changed = tx.clone();
    changed.time = changed.time.wrapping_add(1);
    assert_ne!(changed.txid(), original);

    let mut changed = tx.clone();
    changed.vout[0].value += 1;
    assert_ne!(changed.txid(), original);

    let mut changed = tx.clone();
    changed.vin[0].prevout.index ^= 1;
    assert_ne!(changed.txid(), original);

    let mut changed = tx;
    changed.lock_time ^= 1;
    assert_ne!(changed.txid(), original);
}

#[test]
fn truncated_payload_is_rejected() {
    let mut rng = Lcg::new(3);
    let tx = random_transaction(&mut rng);
    let bytes = encode(&tx);
    for cut in [1, bytes.len() / 2, bytes.len() - 1] {
        assert!(decode::<Transaction>(&bytes[..cut]).is_err());
    }
}

#[test]
fn trailing_bytes_are_rejected() {
    let mut rng = Lcg::new(5);
    let tx = random_transaction(&mut rng);
    let mut bytes = encode(&tx);
    bytes.push(0);
    assert!(decode::<Transaction>(&bytes).is_err());
}
