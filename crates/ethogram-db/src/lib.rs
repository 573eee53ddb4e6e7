//! Sharded event storage for ethogram.
//!
//! The store maps `(table, object id)` to a single contiguous blob holding
//! the object's events sorted strictly by timestamp. Objects are routed to
//! one of N LMDB-backed shards by a stable hash of their id; each table also
//! owns a factor dictionary interning high-cardinality string values, and a
//! property catalog persisted alongside the table.
//!
//! On-disk layout, rooted at the configured data path:
//!
//! ```text
//! <root>/data/<shard_index>/     shard LMDB environment
//! <root>/factors/<table_name>/   per-table factor LMDB environment
//! <root>/tables/<table_name>/schema   property catalog manifest
//! ```

pub mod cache;
pub mod codec;
pub mod cursor;
pub mod db;
pub mod factorizer;
pub mod options;
pub mod schema;
pub mod shard;
pub mod table;

pub use cache::FactorCache;
pub use cursor::{EventView, ShardCursor};
pub use db::{BulkInsert, Db};
pub use factorizer::{Factorizer, FACTOR_CACHE_SIZE, MAX_KEY_SIZE};
pub use options::StoreOptions;
pub use schema::{Property, Schema};
pub use shard::{Shard, ShardStats};
pub use table::Table;

use ethogram_core::error::EthogramError;

pub(crate) fn store_err(e: lmdb::Error) -> EthogramError {
    EthogramError::Store(e.to_string())
}
