//! Request cache: partitioned storage, strategy execution and background
//! revalidation.
//!
//! Responses are grouped into named partitions (static assets, pages,
//! images, API data). The [`CacheLayer`] decides, per strategy, whether a
//! request is served from a partition, from the network, or both, and falls
//! back to stored entries when the origin cannot be reached.

mod layer;
pub(crate) mod lock;
mod revalidate;
mod storage;
mod traits;

pub(crate) use layer::{fetch_with_timeout, store_response};
pub use layer::CacheLayer;
pub use revalidate::RevalidationPool;
pub use storage::{MemoryStorage, SqliteStorage};
pub use traits::{CacheEntry, CacheResult, CacheSource, PartitionStore};
