//! Query pipeline for ethogram.
//!
//! Queries are per-object state machines evaluated over each object's
//! time-ordered event stream, reduced across the table:
//!
//! 1. [`compile`](compile::compile) resolves the AST against the table's
//!    catalog into an executable plan (variables, factor literals, window
//!    slots).
//! 2. The [`Mapper`](mapper::Mapper) walks a shard cursor and accumulates
//!    measures into a nested [`Hashmap`](hashmap::Hashmap), one worker per
//!    shard.
//! 3. The [`Reducer`](reducer::Reducer) merges per-shard maps and renders
//!    the nested result dictionary, defactorizing dimension keys.

pub mod ast;
pub mod compile;
pub mod executor;
pub mod hashmap;
pub mod mapper;
pub mod reducer;

pub use ast::{BinaryOp, Expr, Field, Measure, Query, Selection, Statement};
pub use compile::{compile, CompiledQuery};
pub use executor::{execute, QueryOptions};
pub use hashmap::{Hashmap, Slot};
pub use mapper::{Mapper, Pass};
pub use reducer::Reducer;
