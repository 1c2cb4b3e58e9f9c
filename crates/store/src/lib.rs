//! Tanjun store: delta queue, indexed cache and the sync barrier.

#![forbid(unsafe_code)]

mod barrier;
mod indexer;
mod queue;

pub use barrier::SyncBarrier;
pub use indexer::{indexer, Applied, IndexFn, IndexWriter, Indexer, IndexerBuilder, Snapshot, NAMESPACE_INDEX};
pub use queue::{DeltaList, DeltaQueue, Deltas};
