//! Core types for ethogram, an embedded behavioral event-analytics database.
//!
//! Data is a set of typed events (timestamped property bags) grouped by
//! object id within a named table. This crate holds the pieces shared by the
//! storage and query layers:
//! - The error type and `Result` alias
//! - Daemon configuration
//! - Typed property values and the event records
//! - Routing and name hashing
//! - Optional metrics hooks

pub mod config;
pub mod error;
pub mod event;
pub mod hash;
pub mod observe;
pub mod value;

pub use config::Config;
pub use error::{EthogramError, Result};
pub use event::{truncate_micros, Event, PropertyId, RawEvent};
pub use hash::{name_hash, object_hash};
pub use value::{DataType, Value};
