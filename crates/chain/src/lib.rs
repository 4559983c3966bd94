//! The chain view the wallet consults: block storage, a transaction index
//! with authoritative per-output spent markers, and a minimal mempool.

pub mod mempool;
pub mod relay;
pub mod view;

pub use mempool::{Mempool, MempoolError};
pub use relay::{NullRelay, RecordingRelay, Relay};
pub use view::{ChainError, ChainView, TxIndexEntry};
