//! Shared fixture: an in-memory chain the test wallets mine into.

use std::sync::Arc;

use umbra_chain::{ChainView, Mempool, RecordingRelay};
use umbra_consensus::{Amount, Hash256, Network, ZERO_HASH};
use umbra_primitives::block::{Block, BlockHeader};
use umbra_primitives::outpoint::OutPoint;
use umbra_primitives::transaction::{Transaction, TxIn, TxOut};
use umbra_storage::memory::MemoryStore;
use umbra_wallet::Wallet;

pub type TestWallet = Wallet<MemoryStore>;

pub fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub struct Harness {
    pub chain: ChainView<Arc<MemoryStore>>,
    pub mempool: Mempool,
    pub relay: RecordingRelay,
    next_block_time: u32,
}

impl Harness {
    /// Block times start an hour in the past so freshly created keys still
    /// see the funding blocks during rescans.
    pub fn new() -> Self {
        Self {
            chain: ChainView::new(Arc::new(MemoryStore::new())),
            mempool: Mempool::new(),
            relay: RecordingRelay::new(),
            next_block_time: (now_unix() - 3_600) as u32,
        }
    }

    pub fn new_wallet(&self) -> TestWallet {
        Wallet::create(Network::Regtest, MemoryStore::new()).expect("wallet")
    }

    fn filler_coinbase(&self, time: u32, tag: u32) -> Transaction {
        let mut tx = Transaction::new(time);
        tx.vin.push(TxIn::from_outpoint(OutPoint::null()));
        // Anyone-can-spend marker output, distinct per block.
        tx.vout
            .push(TxOut::new(1_000_000, vec![0x51, (tag & 0xff) as u8]));
        tx
    }

    /// Append a block holding `txs` (a filler coinbase is prepended).
    pub fn mine_block(&mut self, txs: Vec<Transaction>) -> Block {
        let time = self.next_block_time;
        self.next_block_time += 60;
        let height = self.chain.best_height().expect("height");
        let mut transactions = vec![self.filler_coinbase(time, height as u32 + 1)];
        transactions.extend(txs);
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_block: if height < 0 {
                    ZERO_HASH
                } else {
                    self.chain.best_block_hash().expect("hash")
                },
                merkle_root: [0u8; 32],
                time,
                bits: 0x2100_ffff,
                nonce: 0,
            },
            transactions,
        };
        self.chain.connect_block(&block).expect("connect");
        for tx in &block.transactions {
            self.mempool.remove(&tx.txid());
        }
        block
    }

    /// Mine a coinbase paying `amounts` to fresh addresses of `wallet`.
    pub fn fund(&mut self, wallet: &mut TestWallet, amounts: &[Amount]) -> Hash256 {
        let time = self.next_block_time;
        let mut coinbase = Transaction::new(time);
        coinbase.vin.push(TxIn::from_outpoint(OutPoint::null()));
        for amount in amounts {
            let address = wallet.new_address("funding").expect("address");
            let script = umbra_primitives::address::address_to_script_pubkey(
                &address,
                Network::Regtest,
            )
            .expect("script");
            coinbase.vout.push(TxOut::new(*amount, script));
        }
        let txid = coinbase.txid();
        self.mine_block(vec![coinbase]);
        txid
    }

    /// Mine `count` filler blocks so earlier outputs mature.
    pub fn confirm(&mut self, count: usize) {
        for _ in 0..count {
            self.mine_block(Vec::new());
        }
    }

    /// Bring a wallet up to date with the chain.
    pub fn sync(&self, wallet: &mut TestWallet) {
        wallet
            .scan_for_involvement(&self.chain, 0, true)
            .expect("scan");
    }

    /// Pull a transaction out of the mempool, mine it, and resync wallets.
    pub fn mine_mempool(&mut self, txids: &[Hash256], wallets: &mut [&mut TestWallet]) {
        let txs: Vec<Transaction> = txids
            .iter()
            .map(|txid| self.mempool.get(txid).expect("tx in mempool").clone())
            .collect();
        self.mine_block(txs);
        for wallet in wallets {
            self.sync(wallet);
        }
    }
}
