use std::thread;

use ethogram_core::config::{Config, DEFAULT_MAX_DBS, DEFAULT_MAX_READERS};

/// Tuning knobs for the LMDB environments backing shards and factor stores.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Address-space reservation per environment; files grow as written.
    pub map_size: usize,
    pub max_dbs: u32,
    pub max_readers: u32,
    /// Defer fsync for bulk loads.
    pub nosync: bool,
    /// Shard count used only when the data directory holds no shards yet.
    pub default_shard_count: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            map_size: 1 << 30, // 1 GiB
            max_dbs: DEFAULT_MAX_DBS,
            max_readers: DEFAULT_MAX_READERS,
            nosync: false,
            default_shard_count: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl From<&Config> for StoreOptions {
    fn from(config: &Config) -> Self {
        Self {
            nosync: config.nosync,
            max_dbs: config.max_dbs,
            max_readers: config.max_readers,
            ..Default::default()
        }
    }
}
