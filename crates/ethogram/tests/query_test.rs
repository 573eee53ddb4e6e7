use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use ethogram::prelude::*;
use ethogram::Statement as S;

fn open_db(path: &Path) -> Db {
    let options = StoreOptions {
        default_shard_count: 4,
        map_size: 1 << 26,
        ..Default::default()
    };
    Db::open_with_options(path, options).unwrap()
}

fn ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

/// Mirrors the ingest boundary: rows of (object id, timestamp, JSON data).
fn setup_data(db: &Db, table: &str, rows: &[(&str, &str, serde_json::Value)]) {
    for (id, timestamp, data) in rows {
        let mut event = Event::new(ts(timestamp));
        for (name, value) in data.as_object().unwrap() {
            if let Some(value) = Value::from_json(value) {
                event.data.insert(name.clone(), value);
            }
        }
        db.insert_event(table, id, event).unwrap();
    }
}

fn run(db: &Db, table: &str, query: &Query) -> serde_json::Value {
    execute(db, table, query, &QueryOptions::default()).unwrap()
}

#[test]
fn test_simple_count() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path());
    let table = db.create_table("foo").unwrap();
    table.create_property("fruit", DataType::Factor, true).unwrap();
    table.create_property("num", DataType::Integer, true).unwrap();
    setup_data(
        &db,
        "foo",
        &[
            ("a0", "2012-01-01T00:00:00Z", json!({"fruit": "apple"})),
            ("a1", "2012-01-01T00:00:00Z", json!({"fruit": "grape"})),
            ("a1", "2012-01-01T00:00:01Z", json!({"num": 12})),
            ("a2", "2012-01-01T00:00:00Z", json!({"fruit": "orange"})),
            ("a3", "2012-01-01T00:00:00Z", json!({"fruit": "apple"})),
        ],
    );

    let query = Query::new(vec![S::select(Selection::new().field(Field::count("count")))]);
    assert_eq!(run(&db, "foo", &query), json!({"count": 5}));
}

#[test]
fn test_count_on_empty_table() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path());
    db.create_table("foo").unwrap();

    let query = Query::new(vec![S::select(Selection::new().field(Field::count("count")))]);
    assert_eq!(run(&db, "foo", &query), json!({"count": 0}));
}

#[test]
fn test_one_dimension_count() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path());
    let table = db.create_table("foo").unwrap();
    table.create_property("fruit", DataType::Factor, true).unwrap();
    table.create_property("num", DataType::Integer, true).unwrap();
    setup_data(
        &db,
        "foo",
        &[
            ("b0", "2012-01-01T00:00:00Z", json!({"fruit": "apple"})),
            ("b1", "2012-01-01T00:00:00Z", json!({"fruit": "grape"})),
            ("b1", "2012-01-01T00:00:01Z", json!({"num": 12})),
            ("b2", "2012-01-01T00:00:00Z", json!({"fruit": "orange"})),
            ("b3", "2012-01-01T00:00:00Z", json!({"fruit": "apple"})),
        ],
    );

    let query = Query::new(vec![S::select(
        Selection::new().field(Field::count("count")).group_by("fruit"),
    )]);
    assert_eq!(
        run(&db, "foo", &query),
        json!({"fruit": {
            "": {"count": 1},
            "apple": {"count": 2},
            "grape": {"count": 1},
            "orange": {"count": 1},
        }})
    );
}

#[test]
fn test_multi_dimensional_selections() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path());
    let table = db.create_table("foo").unwrap();
    table.create_property("gender", DataType::Factor, false).unwrap();
    table.create_property("state", DataType::Factor, false).unwrap();
    table.create_property("price", DataType::Float, true).unwrap();
    table.create_property("num", DataType::Integer, true).unwrap();
    setup_data(
        &db,
        "foo",
        &[
            ("c0", "2012-01-01T00:00:00Z", json!({"gender": "m", "state": "NY", "price": 100.0})),
            ("c0", "2012-01-01T00:00:01Z", json!({"price": 200.0})),
            ("c0", "2012-01-01T00:00:02Z", json!({"state": "CA", "price": 10.0})),
            ("c1", "2012-01-01T00:00:00Z", json!({"gender": "m", "state": "CA", "price": 20.0})),
            ("c1", "2012-01-01T00:00:01Z", json!({"num": 1000})),
            ("c2", "2012-01-01T00:00:00Z", json!({"gender": "f", "state": "NY", "price": 30.0})),
        ],
    );

    let query = Query::new(vec![
        S::select(
            Selection::new()
                .field(Field::count("count"))
                .field(Field::sum("sum", Expr::var("price")))
                .group_by("gender")
                .group_by("state")
                .into_name("s1"),
        ),
        S::select(
            Selection::new()
                .field(Field::min("minimum", Expr::var("price")))
                .field(Field::max("maximum", Expr::var("price")))
                .group_by("gender")
                .group_by("state"),
        ),
        S::select(
            Selection::new()
                .field(Field::sum(
                    "sum",
                    Expr::var("price").add(Expr::var("num")).mul(Expr::Int(2)),
                ))
                .into_name("_"),
        ),
    ]);

    assert_eq!(
        run(&db, "foo", &query),
        json!({
            "_": {"sum": 2720.0},
            "gender": {
                "f": {"state": {"NY": {"maximum": 30.0, "minimum": 30.0}}},
                "m": {"state": {
                    "CA": {"maximum": 20.0, "minimum": 0.0},
                    "NY": {"maximum": 200.0, "minimum": 100.0},
                }},
            },
            "s1": {"gender": {
                "f": {"state": {"NY": {"count": 1, "sum": 30.0}}},
                "m": {"state": {
                    "CA": {"count": 3, "sum": 30.0},
                    "NY": {"count": 2, "sum": 300.0},
                }},
            }},
        })
    );
}

#[test]
fn test_funnel_within_steps() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path());
    let table = db.create_table("foo").unwrap();
    table.create_property("action", DataType::Factor, true).unwrap();
    setup_data(
        &db,
        "foo",
        &[
            // The A0 .. A1 WITHIN 1..2 pattern occurs twice for this object.
            ("d0", "2012-01-01T00:00:00Z", json!({"action": "A0"})),
            ("d0", "2012-01-01T00:00:01Z", json!({"action": "A1"})),
            ("d0", "2012-01-01T00:00:02Z", json!({"action": "A2"})),
            ("d0", "2012-01-01T12:00:00Z", json!({"action": "A0"})),
            ("d0", "2012-01-01T13:00:00Z", json!({"action": "A0"})),
            ("d0", "2012-01-01T14:00:00Z", json!({"action": "A1"})),
            // Once for this object; the second A1 lands 3 steps after the arm.
            ("e1", "2012-01-01T00:00:00Z", json!({"action": "A0"})),
            ("e1", "2012-01-01T00:00:01Z", json!({"action": "A0"})),
            ("e1", "2012-01-01T00:00:02Z", json!({"action": "A1"})),
            ("e1", "2012-01-02T00:00:00Z", json!({"action": "A0"})),
            ("e1", "2012-01-02T00:00:01Z", json!({"action": "A0"})),
            ("e1", "2012-01-02T00:00:02Z", json!({"action": "A0"})),
            ("e1", "2012-01-02T00:00:03Z", json!({"action": "A1"})),
        ],
    );

    let query = Query::new(vec![S::when(
        Expr::var("action").eq(Expr::str("A0")),
        vec![S::when_within(
            Expr::var("action").eq(Expr::str("A1")),
            (1, 2),
            vec![S::select(
                Selection::new().field(Field::count("count")).group_by("action"),
            )],
        )],
    )]);

    assert_eq!(run(&db, "foo", &query), json!({"action": {"A1": {"count": 3}}}));
}

#[test]
fn test_sessionized_funnel() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path());
    let table = db.create_table("foo").unwrap();
    table.create_property("action", DataType::Factor, false).unwrap();
    setup_data(
        &db,
        "foo",
        &[
            // First pair sits inside one session; the second pair's gap
            // exceeds the idle time and is broken across sessions.
            ("f0", "2012-01-01T00:00:00Z", json!({"action": "A0"})),
            ("f0", "2012-01-01T01:59:59Z", json!({"action": "A1"})),
            ("f0", "2012-01-02T00:00:00Z", json!({"action": "A0"})),
            ("f0", "2012-01-02T02:00:01Z", json!({"action": "A1"})),
        ],
    );

    let query = Query::new(vec![S::when(
        Expr::var("action").eq(Expr::str("A0")),
        vec![S::when_within(
            Expr::var("action").eq(Expr::str("A1")),
            (1, 1),
            vec![S::select(
                Selection::new().field(Field::count("count")).group_by("action"),
            )],
        )],
    )]);

    let options = QueryOptions {
        session_idle_time: 7200,
        ..Default::default()
    };
    let result = execute(&db, "foo", &query, &options).unwrap();
    assert_eq!(result, json!({"action": {"A1": {"count": 1}}}));
}

#[test]
fn test_prefix_filter() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path());
    let table = db.create_table("foo").unwrap();
    table.create_property("price", DataType::Integer, true).unwrap();
    setup_data(
        &db,
        "foo",
        &[
            ("0010a", "2012-01-01T00:00:00Z", json!({"price": 100})),
            ("0010b", "2012-01-01T00:00:00Z", json!({"price": 200})),
            ("0010b", "2012-01-01T00:00:01Z", json!({})),
            ("0020a", "2012-01-01T00:00:00Z", json!({"price": 30})),
            ("0030a", "2012-01-01T00:00:00Z", json!({"price": 40})),
        ],
    );

    let query = Query::new(vec![S::select(
        Selection::new().field(Field::sum("totalPrice", Expr::var("price"))),
    )]);
    let options = QueryOptions {
        prefix: Some("001".to_string()),
        ..Default::default()
    };
    let result = execute(&db, "foo", &query, &options).unwrap();
    assert_eq!(result, json!({"totalPrice": 300}));
}

#[test]
fn test_declared_variable_state_machine() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path());
    let table = db.create_table("foo").unwrap();
    table.create_property("action", DataType::Factor, true).unwrap();
    setup_data(
        &db,
        "foo",
        &[
            ("00", "1970-01-01T00:00:00Z", json!({"action": "home"})),
            ("00", "1970-01-01T00:00:02Z", json!({"action": "signup"})),
            ("00", "1970-01-01T00:00:03Z", json!({"action": "signed_up"})),
            ("00", "1970-01-01T00:00:04Z", json!({"action": "pricing"})),
            ("00", "1970-01-02T00:00:00Z", json!({"action": "cancel"})),
            ("00", "1970-01-03T00:00:00Z", json!({"action": "home"})),
            ("01", "1970-01-01T00:00:00Z", json!({"action": "home"})),
            ("01", "1970-01-01T00:00:02Z", json!({"action": "cancel"})),
        ],
    );

    let query = Query::new(vec![
        S::declare("state", DataType::Integer),
        S::when(
            Expr::var("state").eq(Expr::Int(0)),
            vec![
                S::set("state", Expr::Int(1)),
                S::select(Selection::new().field(Field::count("count")).into_name("visited")),
            ],
        ),
        S::when(
            Expr::var("state")
                .eq(Expr::Int(1))
                .and(Expr::var("action").eq(Expr::str("signed_up"))),
            vec![
                S::set("state", Expr::Int(2)),
                S::select(Selection::new().field(Field::count("count")).into_name("registered")),
            ],
        ),
        S::when(
            Expr::var("state")
                .eq(Expr::Int(2))
                .and(Expr::var("action").eq(Expr::str("cancel"))),
            vec![
                S::set("state", Expr::Int(3)),
                S::select(Selection::new().field(Field::count("count")).into_name("cancelled")),
            ],
        ),
    ]);

    assert_eq!(
        run(&db, "foo", &query),
        json!({
            "cancelled": {"count": 1},
            "registered": {"count": 1},
            "visited": {"count": 2},
        })
    );

    // Declared variables registered as transient properties of the table.
    let prop = table.property("state").unwrap().unwrap();
    assert!(prop.transient);
    assert!(prop.id < 0);
}

#[test]
fn test_overlapping_named_selections() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path());
    let table = db.create_table("foo").unwrap();
    table.create_property("action", DataType::Factor, false).unwrap();
    setup_data(&db, "foo", &[("f0", "2012-01-01T00:00:00Z", json!({"action": "A0"}))]);

    let query = Query::new(vec![
        S::select(
            Selection::new()
                .field(Field::count("count1"))
                .group_by("action")
                .into_name("q"),
        ),
        S::select(
            Selection::new()
                .field(Field::count("count2"))
                .group_by("action")
                .into_name("q"),
        ),
    ]);

    assert_eq!(
        run(&db, "foo", &query),
        json!({"q": {"action": {"A0": {"count1": 1, "count2": 1}}}})
    );
}

#[test]
fn test_timestamp_variable() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path());
    let table = db.create_table("foo").unwrap();
    table.create_property("action", DataType::Factor, true).unwrap();
    setup_data(
        &db,
        "foo",
        &[
            ("00", "1970-01-01T00:00:00Z", json!({"action": "A0"})),
            ("00", "1970-01-01T00:00:02Z", json!({"action": "A1"})),
            ("00", "1970-01-01T00:00:04Z", json!({"action": "A2"})),
            ("00", "1970-01-01T00:00:06Z", json!({"action": "A3"})),
            ("00", "1970-01-01T00:01:00Z", json!({"action": "A4"})),
            ("01", "1970-01-01T00:00:02Z", json!({"action": "A5"})),
            ("02", "1970-01-01T00:00:02Z", json!({"action": "A5"})),
        ],
    );

    let query = Query::new(vec![S::when(
        Expr::var("timestamp")
            .ge(Expr::Int(2))
            .and(Expr::var("timestamp").lt(Expr::Int(6))),
        vec![S::select(
            Selection::new()
                .field(Field::count("count"))
                .field(Field::sum("tsSum", Expr::var("timestamp")))
                .group_by("action"),
        )],
    )]);

    assert_eq!(
        run(&db, "foo", &query),
        json!({"action": {
            "A1": {"count": 1, "tsSum": 2},
            "A2": {"count": 1, "tsSum": 4},
            "A5": {"count": 2, "tsSum": 4},
        }})
    );
}

#[test]
fn test_histogram() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path());
    let table = db.create_table("foo").unwrap();
    table.create_property("val", DataType::Integer, true).unwrap();
    setup_data(
        &db,
        "foo",
        &[
            ("h0", "2012-01-01T00:00:00Z", json!({"val": 0})),
            ("h0", "2012-01-01T00:00:01Z", json!({"val": 1})),
            ("h0", "2012-01-01T00:00:02Z", json!({"val": 2})),
            ("h0", "2012-01-01T00:00:03Z", json!({"val": 3})),
        ],
    );

    let query = Query::new(vec![S::select(
        Selection::new().field(Field::histogram_with_bins("hist", Expr::var("val"), 3)),
    )]);

    // Width is (max-min)/bins; the top edge value clamps into the last bin.
    assert_eq!(
        run(&db, "foo", &query),
        json!({"hist": {
            "__histogram__": true,
            "bins": {"0": 1, "1": 1, "2": 2},
            "count": 3,
            "max": 3,
            "min": 0,
            "width": 1.0,
        }})
    );
}

#[test]
fn test_declared_factor_variable_with_association() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path());
    let table = db.create_table("foo").unwrap();
    table.create_property("action", DataType::Factor, true).unwrap();
    setup_data(
        &db,
        "foo",
        &[
            ("00", "2012-01-01T00:00:00Z", json!({"action": "A0"})),
            ("00", "2012-01-01T00:00:01Z", json!({"action": "A1"})),
            ("01", "2012-01-01T00:00:00Z", json!({"action": "A0"})),
        ],
    );

    let query = Query::new(vec![
        Statement::Declare {
            name: "fav".to_string(),
            data_type: DataType::Factor,
            association: Some("action".to_string()),
        },
        S::set("fav", Expr::var("action")),
        S::select(Selection::new().field(Field::count("count")).group_by("fav")),
    ]);

    assert_eq!(
        run(&db, "foo", &query),
        json!({"fav": {"A0": {"count": 2}, "A1": {"count": 1}}})
    );
}

#[test]
fn test_string_dimension_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path());
    let table = db.create_table("foo").unwrap();
    table.create_property("note", DataType::String, false).unwrap();
    setup_data(&db, "foo", &[("00", "2012-01-01T00:00:00Z", json!({"note": "hi"}))]);

    let query = Query::new(vec![S::select(
        Selection::new().field(Field::count("count")).group_by("note"),
    )]);
    let err = execute(&db, "foo", &query, &QueryOptions::default()).unwrap_err();
    match err {
        EthogramError::Query(message) => {
            assert!(message.contains("string dimensions are not supported"))
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_unknown_factor_literal_matches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path());
    let table = db.create_table("foo").unwrap();
    table.create_property("action", DataType::Factor, true).unwrap();
    setup_data(&db, "foo", &[("00", "2012-01-01T00:00:00Z", json!({"action": "A0"}))]);

    let query = Query::new(vec![S::when(
        Expr::var("action").eq(Expr::str("never-ingested")),
        vec![S::select(Selection::new().field(Field::count("count")))],
    )]);
    assert_eq!(run(&db, "foo", &query), json!({"count": 0}));
}

#[test]
fn test_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path());
    let table = db.create_table("foo").unwrap();
    table.create_property("n", DataType::Integer, false).unwrap();
    for i in 0..8 {
        setup_data(
            &db,
            "foo",
            &[(format!("obj{i}").as_str(), "2012-01-01T00:00:00Z", json!({"n": i}))],
        );
    }

    let cancel = Arc::new(AtomicBool::new(false));
    cancel.store(true, Ordering::Relaxed);
    let options = QueryOptions {
        cancel: Some(cancel),
        ..Default::default()
    };
    let query = Query::new(vec![S::select(Selection::new().field(Field::count("count")))]);
    let err = execute(&db, "foo", &query, &options).unwrap_err();
    assert!(matches!(err, EthogramError::Cancelled));
}
