//! ethogram: an embedded behavioral event-analytics database.
//!
//! Data is a set of typed events (timestamped property bags) grouped by
//! object id within a named table. The workload is append-heavy ingestion of
//! per-object event streams plus analytical queries that run a per-object
//! state machine over each object's time-ordered events and reduce grouped
//! measures across the table.
//!
//! # Quick start
//!
//! ```no_run
//! use ethogram::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let db = Db::open("./data")?;
//! let table = db.create_table("visits")?;
//! table.create_property("action", DataType::Factor, true)?;
//!
//! let event = Event::new("2024-05-01T10:30:00Z".parse().unwrap())
//!     .with("action", Value::String("signup".into()));
//! db.insert_event("visits", "user-1", event)?;
//!
//! let query = Query::new(vec![Statement::select(
//!     Selection::new()
//!         .field(Field::count("count"))
//!         .group_by("action"),
//! )]);
//! let result = execute(&db, "visits", &query, &QueryOptions::default())?;
//! println!("{result}");
//! # Ok(())
//! # }
//! ```

pub mod prelude;
pub mod stream;

pub use ethogram_core::config::Config;
pub use ethogram_core::error::{EthogramError, Result};
pub use ethogram_core::event::{Event, PropertyId, RawEvent};
pub use ethogram_core::value::{DataType, Value};

pub use ethogram_db::{
    BulkInsert, Db, EventView, Factorizer, Property, Schema, Shard, ShardCursor, ShardStats,
    StoreOptions, Table,
};

pub use ethogram_query::{
    execute, BinaryOp, Expr, Field, Hashmap, Measure, Query, QueryOptions, Selection, Statement,
};

pub use stream::{load_stream, StreamLoader, DEFAULT_FLUSH_THRESHOLD};
