//! Filter hooks and the audit log: the pluggable edges of the engine.

use std::io::Write;
use std::sync::{Arc, Mutex};

use dpdb::{Db, Value};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn rot13(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .map(|&b| match b {
            b'a'..=b'z' => (b - b'a' + 13) % 26 + b'a',
            b'A'..=b'Z' => (b - b'A' + 13) % 26 + b'A',
            other => other,
        })
        .collect()
}

#[test]
fn value_filters_are_transparent_to_the_caller() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::builder()
        .path(dir.path().join("test.dpdb"))
        .filter_store_value(Box::new(rot13))
        .filter_fetch_value(Box::new(rot13))
        .open()
        .unwrap();
    let root = db.root_map().unwrap();
    root.put(b"k", "Hello").unwrap();
    assert_eq!(root.get(b"k").unwrap(), Some(Value::from("Hello")));
}

#[test]
fn key_filters_apply_to_lookup_and_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::builder()
        .path(dir.path().join("test.dpdb"))
        .filter_store_key(Box::new(rot13))
        .filter_fetch_key(Box::new(rot13))
        .open()
        .unwrap();
    let root = db.root_map().unwrap();
    root.put(b"secret", "v").unwrap();
    // Lookup goes through the same store-key transform.
    assert_eq!(root.get(b"secret").unwrap(), Some(Value::from("v")));
    // Iteration reverses it on the way out.
    assert_eq!(root.keys().unwrap(), vec![b"secret".to_vec()]);
}

#[test]
fn filtered_values_roundtrip_across_reopen_with_the_same_filters() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.dpdb");
    {
        let db = Db::builder()
            .path(&path)
            .filter_store_value(Box::new(rot13))
            .filter_fetch_value(Box::new(rot13))
            .open()
            .unwrap();
        db.root_map().unwrap().put(b"k", "Veil").unwrap();
    }
    // Without filters, the stored form shows: the bytes on disk were
    // transformed.
    let db = Db::open(&path).unwrap();
    assert_eq!(
        db.root_map().unwrap().get(b"k").unwrap(),
        Some(Value::from("Irvy"))
    );
}

#[test]
fn filters_never_touch_structural_values_or_indices() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::builder()
        .path(dir.path().join("test.dpdb"))
        .filter_store_value(Box::new(rot13))
        .filter_fetch_value(Box::new(rot13))
        .open()
        .unwrap();
    let root = db.root_map().unwrap();
    root.put(
        b"nest",
        Value::Map(vec![(
            b"list".to_vec(),
            Value::Seq(vec![Value::from("abc")]),
        )]),
    )
    .unwrap();
    let nest = root.get(b"nest").unwrap().unwrap();
    let list = nest.as_map().unwrap().get(b"list").unwrap().unwrap();
    let list = list.as_seq().unwrap();
    // Scalars inside structures still filter transparently; the
    // structure itself (and its length bookkeeping) is untouched.
    assert_eq!(list.get(0).unwrap(), Some(Value::from("abc")));
    assert_eq!(list.len().unwrap(), 1);
}

#[test]
fn audit_log_records_mutations_as_statements() {
    let dir = tempfile::tempdir().unwrap();
    let buf = SharedBuf::default();
    let db = Db::builder()
        .path(dir.path().join("test.dpdb"))
        .audit_sink(Box::new(buf.clone()))
        .open()
        .unwrap();
    let root = db.root_map().unwrap();

    root.put(b"greeting", "hi there").unwrap();
    root.delete(b"greeting").unwrap();
    db.begin().unwrap();
    root.put(b"x", "1").unwrap();
    db.commit().unwrap();

    let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines,
        vec![
            "put /greeting \"hi%20there\"",
            "del /greeting",
            "begin",
            "put /x \"1\"",
            "commit",
        ]
    );
}

#[test]
fn audit_log_expands_literal_trees() {
    let dir = tempfile::tempdir().unwrap();
    let buf = SharedBuf::default();
    let db = Db::builder()
        .path(dir.path().join("test.dpdb"))
        .audit_sink(Box::new(buf.clone()))
        .open()
        .unwrap();
    db.root_map()
        .unwrap()
        .put(
            b"cfg",
            Value::Map(vec![(
                b"flags".to_vec(),
                Value::Seq(vec![Value::from("on")]),
            )]),
        )
        .unwrap();

    let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines,
        vec![
            "new /cfg map",
            "new /cfg/flags seq",
            "put /cfg/flags/0 \"on\"",
        ]
    );
}

#[test]
fn audit_file_collects_statements_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("audit.log");
    {
        let db = Db::builder()
            .path(dir.path().join("test.dpdb"))
            .audit_file(&log_path)
            .open()
            .unwrap();
        db.root_map().unwrap().put(b"k", "v").unwrap();
    }
    let text = std::fs::read_to_string(&log_path).unwrap();
    assert_eq!(text, "put /k \"v\"\n");
}
