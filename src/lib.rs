//! Tiered, cache-backed, persistent ordered key-value index engine.
//!
//! Two tree flavors share one storage substrate: the classic
//! [BPlusStore] and the buffered-insertion [BEpsilonStore], whose
//! interior nodes queue mutations and flush them downwards lazily.
//! Nodes live in a bounded replacement cache ([cache::NodeCache],
//! parametric in its policy) on top of three block-allocated storage
//! tiers (DRAM, PMEM, FILE) addressed through a compact node identity.
//!
//! ```
//! use tiertree::{BPlusStore, StoreConfig};
//!
//! # fn main() -> Result<(), tiertree::Error> {
//! let config = StoreConfig {
//!     degree: 3,
//!     cache_capacity: 64,
//!     ..StoreConfig::default()
//! };
//! let store: BPlusStore<u64, u64> = BPlusStore::new(&config)?;
//! store.init()?;
//! store.insert(7, 700)?;
//! assert_eq!(store.search(&7)?, 700);
//! let root = store.flush()?;
//! # let _ = root;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod cache;
pub mod config;
mod error;
pub mod pod;
pub mod storage;
pub mod tree;
pub mod uid;
pub mod wal;

pub use config::{PromotionConfig, StoreConfig};
pub use error::{Error, Result};
pub use pod::Pod;
pub use tree::{BEpsilonStore, BPlusStore};
pub use uid::{ObjectKind, ObjectUid, StorageTier};

/// Initializes `env_logger` once for binaries and tests that want the
/// engine's `log` output.
#[cfg(feature = "init_env_logger")]
pub fn init_env_logger() {
    let _ = env_logger::builder().is_test(false).try_init();
}
