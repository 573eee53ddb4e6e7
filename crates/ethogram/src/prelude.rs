//! Common imports for working with ethogram.

pub use ethogram_core::config::Config;
pub use ethogram_core::error::{EthogramError, Result};
pub use ethogram_core::event::Event;
pub use ethogram_core::value::{DataType, Value};

pub use ethogram_db::{Db, StoreOptions, Table};

pub use ethogram_query::{
    execute, Expr, Field, Measure, Query, QueryOptions, Selection, Statement,
};

pub use crate::stream::{load_stream, StreamLoader};
