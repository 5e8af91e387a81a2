//! Store configuration.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::uid::StorageTier;

/// Tunables of the cold→hot promotion heuristic. A node read at least
/// `threshold` times within windows no larger than `window` is deserialized
/// into its owned form; an expired window decays the counter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PromotionConfig {
    pub threshold: u32,
    pub window: Duration,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        PromotionConfig {
            threshold: 5,
            window: Duration::from_millis(100),
        }
    }
}

/// Construction parameters for a store and its tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Minimum occupancy parameter `d`; non-root nodes hold `d-1..=2d-1` keys.
    pub degree: u16,
    /// Upper bound on cache wrappers with attached bodies.
    pub cache_capacity: usize,
    /// Allocator block size for all tiers, a power of two.
    pub block_size: usize,
    /// Byte length of each tier's region.
    pub storage_bytes: usize,
    /// Backing file for the persistent-memory tier; DRAM-only when absent.
    pub pmem_path: Option<PathBuf>,
    /// Backing file for the block-device tier; DRAM-only when absent.
    pub file_path: Option<PathBuf>,
    /// Write-ahead log file consumed through its append interface.
    pub wal_path: Option<PathBuf>,
    /// Tier that receives write-backs.
    pub write_tier: StorageTier,
    pub promotion: PromotionConfig,
    /// B-ε only: per-pivot buffer capacity as a ratio of the fanout,
    /// `cap = (2·degree - 1) · buffer_ratio`.
    pub buffer_ratio: f32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            degree: 64,
            cache_capacity: 1024,
            block_size: 4096,
            storage_bytes: 128 * 1024 * 1024,
            pmem_path: None,
            file_path: None,
            wal_path: None,
            write_tier: StorageTier::Dram,
            promotion: PromotionConfig::default(),
            buffer_ratio: 1.0,
        }
    }
}

impl StoreConfig {
    /// Reads the configuration from `TIERTREE_`-prefixed environment
    /// variables layered over the defaults.
    #[cfg(feature = "figment_config")]
    pub fn from_env() -> Result<StoreConfig, Box<figment::Error>> {
        use figment::{providers::Env, Figment};
        Figment::from(figment::providers::Serialized::defaults(StoreConfig::default()))
            .merge(Env::prefixed("TIERTREE_"))
            .extract()
            .map_err(Box::new)
    }

    pub(crate) fn buffer_cap(&self) -> usize {
        (((2 * self.degree - 1) as f32) * self.buffer_ratio).max(1.0) as usize
    }
}
