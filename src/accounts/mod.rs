pub mod indexer;
pub mod pool;

pub use indexer::{ChannelAccessIndexer, IndexSummary};
pub use pool::{AccountLease, AccountPool, AccountStats, AccountStatus};
