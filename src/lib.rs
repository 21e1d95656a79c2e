//! Request-interception cache layer for the marketplace front end.
//!
//! Every request the host intercepts is classified into a caching strategy
//! and served from versioned cache partitions, the network, or both. Failed
//! mutations are queued for replay, old entries are swept on a schedule, and
//! a lifecycle controller handles install, activation and control messages.

pub mod cache;
pub mod classifier;
pub mod commands;
pub mod config;
pub mod error;
pub mod eviction;
pub mod network;
pub mod notification;
pub mod offline;
pub mod request;
pub mod worker;

#[cfg(test)]
mod testing;

pub use cache::{CacheLayer, CacheResult, CacheSource, MemoryStorage, PartitionStore, SqliteStorage};
pub use classifier::{Classifier, Strategy};
pub use commands::{Command, CommandReply};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use network::{HttpNetwork, Network};
pub use request::{Request, Response};
pub use worker::{CacheWorker, WorkerState};
