pub mod shard_map;
pub mod spinlock;

pub use shard_map::{Merge, ShardMap, DEFAULT_BUCKET_COUNT};
pub use spinlock::{RawRwSpinLock, RwSpinLock};
