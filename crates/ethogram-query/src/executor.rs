//! Query execution: one map worker per shard, a pointwise merge, then the
//! reduce walk.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use serde_json::Value as Json;

use ethogram_core::error::{EthogramError, Result};
use ethogram_core::observe;
use ethogram_db::{Db, Schema};

use crate::ast::Query;
use crate::compile::{compile, CompiledQuery};
use crate::hashmap::Hashmap;
use crate::mapper::{Mapper, Pass};
use crate::reducer::Reducer;

/// Request-level query parameters.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Restrict the scan to object ids beginning with this byte prefix.
    pub prefix: Option<String>,
    /// Session idle gap in seconds; 0 disables sessionization.
    pub session_idle_time: u64,
    /// Cooperative cancellation, checked between objects by every worker.
    pub cancel: Option<Arc<AtomicBool>>,
}

/// Run a compiled-on-the-fly query against one table and render the nested
/// result dictionary.
pub fn execute(db: &Db, table: &str, query: &Query, options: &QueryOptions) -> Result<Json> {
    let start = Instant::now();
    let result = execute_inner(db, table, query, options);
    observe::record_query(start.elapsed(), result.is_ok());
    result
}

fn execute_inner(db: &Db, table: &str, query: &Query, options: &QueryOptions) -> Result<Json> {
    let handle = db.open_table(table)?;
    let factorizer = db.factorizer(table)?;
    // Pending dictionary writes must be visible before any worker maps.
    factorizer.flush()?;

    let plan = compile(query, &handle, &factorizer)?;
    let schema = handle.snapshot()?;
    tracing::debug!(
        table,
        selections = plan.selections.len(),
        shards = db.shard_count(),
        "query compiled"
    );

    let data = if plan.has_histogram {
        let range = run_pass(db, table, &schema, &plan, options, Pass::HistogramRange)?;
        run_pass(db, table, &schema, &plan, options, Pass::HistogramFill(&range))?
    } else {
        run_pass(db, table, &schema, &plan, options, Pass::Standard)?
    };

    Reducer::new(&plan, &factorizer).reduce(&data)
}

/// One worker per shard; shards never share mutable state, results merge
/// pairwise afterwards.
fn run_pass(
    db: &Db,
    table: &str,
    schema: &Schema,
    plan: &CompiledQuery,
    options: &QueryOptions,
    pass: Pass<'_>,
) -> Result<Hashmap> {
    let cancel: Option<&AtomicBool> = options.cancel.as_deref();
    let prefix: Option<&[u8]> = options.prefix.as_ref().map(|p| p.as_bytes());
    let session_idle = options.session_idle_time;

    let results: Vec<Result<Hashmap>> = thread::scope(|scope| {
        let handles: Vec<_> = db
            .shards()
            .iter()
            .map(|shard| {
                scope.spawn(move || -> Result<Hashmap> {
                    let mut cursor = shard.cursor(table, schema.clone(), prefix)?;
                    let mapper = Mapper::new(plan, session_idle, pass);
                    let mut acc = Hashmap::new();
                    mapper.run(&mut cursor, &mut acc, cancel)?;
                    Ok(acc)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(EthogramError::Query("map worker panicked".into())))
            })
            .collect()
    });

    let mut merged = Hashmap::new();
    for result in results {
        merged.merge(result?);
    }
    Ok(merged)
}
