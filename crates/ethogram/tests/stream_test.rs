use std::path::Path;

use chrono::{DateTime, Utc};

use ethogram::prelude::*;
use ethogram::load_stream;

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

fn setup_table(db: &Db) {
    let table = db.create_table("foo").unwrap();
    table.create_property("bar", DataType::String, false).unwrap();
    table.create_property("baz", DataType::Integer, true).unwrap();
}

#[test]
fn test_load_stream_writes_all_records() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path());
    setup_table(&db);

    let body = concat!(
        r#"{"id":"xyz","timestamp":"2012-01-01T02:00:00Z","data":{"bar":"myValue","baz":12}}"#,
        "\n",
        r#"{"id":"xyz","timestamp":"2012-01-01T03:00:00Z","data":{"bar":"myValue2"}}"#,
        "\n",
    );
    let written = load_stream(&db, "foo", body.as_bytes(), 1000).unwrap();
    assert_eq!(written, 2);

    let events = db.get_events("foo", "xyz").unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].timestamp, ts("2012-01-01T02:00:00Z"));
    assert_eq!(events[0].data.get("bar"), Some(&Value::String("myValue".into())));
    assert_eq!(events[0].data.get("baz"), Some(&Value::Int(12)));
    assert_eq!(events[1].data.get("bar"), Some(&Value::String("myValue2".into())));
}

#[test]
fn test_flush_threshold_defers_visibility() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path());
    setup_table(&db);

    let mut loader = StreamLoader::new(&db, "foo", 2);

    let first = Event::new(ts("2012-01-01T02:00:00Z")).with("bar", Value::String("a".into()));
    loader.push("xyz", first).unwrap();
    // Below the threshold: nothing visible yet.
    assert!(db.get_events("foo", "xyz").unwrap().is_empty());
    assert_eq!(loader.events_written(), 0);

    let second = Event::new(ts("2012-01-01T03:00:00Z")).with("bar", Value::String("b".into()));
    loader.push("xyz", second).unwrap();
    // Threshold reached: both records flushed in one write.
    assert_eq!(db.get_events("foo", "xyz").unwrap().len(), 2);
    assert_eq!(loader.events_written(), 2);

    let third = Event::new(ts("2012-01-01T04:00:00Z")).with("bar", Value::String("c".into()));
    loader.push("xyz", third).unwrap();
    assert_eq!(loader.finish().unwrap(), 3);
    assert_eq!(db.get_events("foo", "xyz").unwrap().len(), 3);
}

#[test]
fn test_mismatched_record_table_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path());
    setup_table(&db);

    let body =
        r#"{"id":"xyz","table":"other","timestamp":"2012-01-01T02:00:00Z","data":{"baz":1}}"#;
    let err = load_stream(&db, "foo", body.as_bytes(), 1000).unwrap_err();
    assert!(matches!(err, EthogramError::Query(_)));
}

#[test]
fn test_malformed_record_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path());
    setup_table(&db);

    let err = load_stream(&db, "foo", "{not json".as_bytes(), 1000).unwrap_err();
    assert!(matches!(err, EthogramError::Codec(_)));
}

#[test]
fn test_records_for_matching_table_pass_the_table_field() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path());
    setup_table(&db);

    let body =
        r#"{"id":"abc","table":"foo","timestamp":"2012-01-01T02:00:00Z","data":{"baz":7}}"#;
    let written = load_stream(&db, "foo", body.as_bytes(), 1000).unwrap();
    assert_eq!(written, 1);
    assert_eq!(
        db.get_events("foo", "abc").unwrap()[0].data.get("baz"),
        Some(&Value::Int(7))
    );
}
