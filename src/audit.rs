//! # Audit Log
//!
//! An optional sink that records every mutation as one replayable textual
//! statement per line. The stream is append-only and flushed per
//! statement, so an external consumer can tail it live or replay it
//! against an empty file to reconstruct the database state.
//!
//! ## Statement Grammar
//!
//! ```text
//! new <path> map|seq        collection materialized at <path>
//! put <path> "<bytes>"      scalar stored at <path>
//! put <path> null           null stored at <path>
//! del <path>                key deleted
//! clear <path>              collection emptied
//! splice <path> <start> <remove> <insert>   sequence splice
//! begin | commit | rollback transaction boundaries
//! ```
//!
//! Paths are `/`-joined key chains from the root. Key and value bytes are
//! percent-escaped so statements stay one line each and survive arbitrary
//! binary keys.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use eyre::{Result, WrapErr};

use crate::error::ErrorKind;

pub struct AuditLog {
    sink: Box<dyn Write + Send>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}

impl AuditLog {
    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        Self { sink }
    }

    /// Opens (appending) a statement log at `path`.
    pub fn to_file(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .wrap_err_with(|| ErrorKind::Io(format!("cannot open audit log {}", path.display())))?;
        Ok(Self::new(Box::new(file)))
    }

    fn record(&mut self, statement: &str) -> Result<()> {
        writeln!(self.sink, "{statement}")
            .and_then(|_| self.sink.flush())
            .wrap_err_with(|| ErrorKind::Io("audit log write failed".into()))
    }

    pub fn put(&mut self, path: &str, value: Option<&[u8]>) -> Result<()> {
        match value {
            Some(bytes) => self.record(&format!("put {path} \"{}\"", escape(bytes))),
            None => self.record(&format!("put {path} null")),
        }
    }

    pub fn new_collection(&mut self, path: &str, kind: &str) -> Result<()> {
        self.record(&format!("new {path} {kind}"))
    }

    pub fn delete(&mut self, path: &str) -> Result<()> {
        self.record(&format!("del {path}"))
    }

    pub fn clear(&mut self, path: &str) -> Result<()> {
        self.record(&format!("clear {path}"))
    }

    /// Records a sequence splice; the inserted values follow as `put`
    /// statements at their final indices.
    pub fn splice(&mut self, path: &str, start: u64, remove: u64, insert: u64) -> Result<()> {
        self.record(&format!("splice {path} {start} {remove} {insert}"))
    }

    pub fn begin(&mut self) -> Result<()> {
        self.record("begin")
    }

    pub fn commit(&mut self) -> Result<()> {
        self.record("commit")
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.record("rollback")
    }
}

/// Percent-escapes bytes outside the printable ASCII range, plus the few
/// characters the statement grammar reserves.
pub fn escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'%' | b'"' | b'/' | b' ' => out.push_str(&format!("%{b:02X}")),
            0x21..=0x7E => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Joins escaped key segments into a root-anchored path.
pub fn join_path(segments: &[Vec<u8>]) -> String {
    if segments.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(&escape(segment));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

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

    #[test]
    fn statements_are_one_line_each() {
        let buf = SharedBuf::default();
        let mut log = AuditLog::new(Box::new(buf.clone()));
        log.put("/a", Some(b"x")).unwrap();
        log.delete("/a").unwrap();
        log.clear("/").unwrap();
        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text, "put /a \"x\"\ndel /a\nclear /\n");
    }

    #[test]
    fn binary_bytes_are_escaped() {
        assert_eq!(escape(b"a b/c\"%"), "a%20b%2Fc%22%25");
        assert_eq!(escape(&[0x00, 0xFF]), "%00%FF");
    }

    #[test]
    fn paths_join_from_the_root() {
        assert_eq!(join_path(&[]), "/");
        assert_eq!(
            join_path(&[b"a".to_vec(), b"b c".to_vec()]),
            "/a/b%20c"
        );
    }

    #[test]
    fn transaction_markers_are_recorded() {
        let buf = SharedBuf::default();
        let mut log = AuditLog::new(Box::new(buf.clone()));
        log.begin().unwrap();
        log.commit().unwrap();
        log.rollback().unwrap();
        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text, "begin\ncommit\nrollback\n");
    }
}
