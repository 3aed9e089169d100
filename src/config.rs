//! # Database Configuration
//!
//! `DbBuilder` is the fluent way to open or create a database with
//! fine-grained control. Settings are chained before the terminal
//! [`DbBuilder::open`] call.
//!
//! ## Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `path` | required | database file |
//! | `file_offset` | 0 | byte position of the header, for embedding |
//! | `byte_size` | medium | width of offsets: small=2, medium=4, large=8 |
//! | `readonly` | false | reject every mutation |
//! | `locking` | true | advisory file locking (implies autoflush) |
//! | `autoflush` | = locking | flush on outermost unlock |
//! | `autobless` | false | persist and restore class tags |
//! | `digest` | 16-byte MD5 | key digest function and width |
//! | `filter_*` | none | scalar transforms on store/fetch |
//! | `audit_file` / `audit_sink` | none | replayable statement log |
//! | `root_kind` | map | collection kind of the file root |
//!
//! Sizing options (`byte_size`, `digest`, `root_kind`) only matter at file
//! creation; an existing file is self-describing and its header wins,
//! except that a digest or root-kind mismatch is reported rather than
//! silently adopted.

use std::io::Write;
use std::path::{Path, PathBuf};

use eyre::Result;

use crate::audit::AuditLog;
use crate::db::Db;
use crate::digest::DigestFn;
use crate::engine::CollKind;
use crate::storage::DEFAULT_MAX_BUCKETS;

/// A scalar-in/scalar-out transform hook. Applied only to byte-string keys
/// and scalar values, never to structural values or sequence indices.
pub type FilterFn = Box<dyn Fn(&[u8]) -> Vec<u8> + Send>;

/// The four filter hook positions.
#[derive(Default)]
pub struct Filters {
    pub store_key: Option<FilterFn>,
    pub store_value: Option<FilterFn>,
    pub fetch_key: Option<FilterFn>,
    pub fetch_value: Option<FilterFn>,
}

impl std::fmt::Debug for Filters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filters")
            .field("store_key", &self.store_key.is_some())
            .field("store_value", &self.store_value.is_some())
            .field("fetch_key", &self.fetch_key.is_some())
            .field("fetch_value", &self.fetch_value.is_some())
            .finish()
    }
}

impl Filters {
    fn apply(hook: &Option<FilterFn>, bytes: &[u8]) -> Vec<u8> {
        match hook {
            Some(f) => f(bytes),
            None => bytes.to_vec(),
        }
    }

    pub fn apply_store_key(&self, bytes: &[u8]) -> Vec<u8> {
        Self::apply(&self.store_key, bytes)
    }

    pub fn apply_store_value(&self, bytes: &[u8]) -> Vec<u8> {
        Self::apply(&self.store_value, bytes)
    }

    pub fn apply_fetch_key(&self, bytes: &[u8]) -> Vec<u8> {
        Self::apply(&self.fetch_key, bytes)
    }

    pub fn apply_fetch_value(&self, bytes: &[u8]) -> Vec<u8> {
        Self::apply(&self.fetch_value, bytes)
    }
}

/// Offset width for a new file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteSize {
    Small,
    Medium,
    Large,
}

impl ByteSize {
    pub fn width(self) -> u8 {
        match self {
            ByteSize::Small => 2,
            ByteSize::Medium => 4,
            ByteSize::Large => 8,
        }
    }
}

/// Resolved open-time options handed to the engine.
#[derive(Debug)]
pub struct OpenOptions {
    pub path: PathBuf,
    pub file_offset: u64,
    pub byte_size: u8,
    pub max_buckets: u8,
    pub readonly: bool,
    pub locking: bool,
    pub autoflush: bool,
    pub autobless: bool,
    pub root_kind: CollKind,
    pub digest: DigestFn,
    pub filters: Filters,
    pub audit: Option<AuditLog>,
}

/// Builder for configuring and opening a dpdb database.
///
/// Use [`Db::builder`] to create one, then chain configuration methods
/// before calling [`DbBuilder::open`].
pub struct DbBuilder {
    path: Option<PathBuf>,
    file_offset: u64,
    byte_size: ByteSize,
    readonly: bool,
    locking: bool,
    autoflush: Option<bool>,
    autobless: bool,
    root_kind: CollKind,
    digest: DigestFn,
    filters: Filters,
    audit_file: Option<PathBuf>,
    audit_sink: Option<Box<dyn Write + Send>>,
}

impl Default for DbBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DbBuilder {
    pub fn new() -> Self {
        Self {
            path: None,
            file_offset: 0,
            byte_size: ByteSize::Medium,
            readonly: false,
            locking: true,
            autoflush: None,
            autobless: false,
            root_kind: CollKind::Map,
            digest: DigestFn::default(),
            filters: Filters::default(),
            audit_file: None,
            audit_sink: None,
        }
    }

    /// Sets the database file path. Required.
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Positions the header at a nonzero byte offset, for databases
    /// embedded inside a larger file.
    pub fn file_offset(mut self, offset: u64) -> Self {
        self.file_offset = offset;
        self
    }

    /// Offset width for a newly created file. Ignored when opening an
    /// existing file, whose header is authoritative.
    pub fn byte_size(mut self, size: ByteSize) -> Self {
        self.byte_size = size;
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// Enables or disables advisory file locking. Enabling it implies
    /// autoflush, so a lock release always publishes completed writes.
    pub fn locking(mut self, locking: bool) -> Self {
        self.locking = locking;
        self
    }

    pub fn autoflush(mut self, autoflush: bool) -> Self {
        self.autoflush = Some(autoflush);
        self
    }

    /// Persist class tags on stored values and surface them on fetch.
    pub fn autobless(mut self, autobless: bool) -> Self {
        self.autobless = autobless;
        self
    }

    /// Collection kind of the file root. A mismatch against an existing
    /// file is a `TypeMismatch` at open.
    pub fn root_kind(mut self, kind: CollKind) -> Self {
        self.root_kind = kind;
        self
    }

    /// Replaces the default 16-byte MD5 key digest. The width is recorded
    /// in new files and checked against existing ones.
    pub fn digest(mut self, func: fn(&[u8]) -> Vec<u8>, size: u8) -> Self {
        self.digest = DigestFn { func, size };
        self
    }

    pub fn filter_store_key(mut self, f: FilterFn) -> Self {
        self.filters.store_key = Some(f);
        self
    }

    pub fn filter_store_value(mut self, f: FilterFn) -> Self {
        self.filters.store_value = Some(f);
        self
    }

    pub fn filter_fetch_key(mut self, f: FilterFn) -> Self {
        self.filters.fetch_key = Some(f);
        self
    }

    pub fn filter_fetch_value(mut self, f: FilterFn) -> Self {
        self.filters.fetch_value = Some(f);
        self
    }

    /// Appends replayable mutation statements to the file at `path`.
    pub fn audit_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.audit_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Streams replayable mutation statements into an arbitrary sink.
    pub fn audit_sink(mut self, sink: Box<dyn Write + Send>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Opens or creates the database with the configured settings.
    pub fn open(self) -> Result<Db> {
        let path = self
            .path
            .ok_or_else(|| eyre::eyre!("dpdb: no database path configured: call .path() first"))?;
        let audit = match (self.audit_sink, &self.audit_file) {
            (Some(sink), _) => Some(AuditLog::new(sink)),
            (None, Some(file)) => Some(AuditLog::to_file(file)?),
            (None, None) => None,
        };
        let options = OpenOptions {
            path,
            file_offset: self.file_offset,
            byte_size: self.byte_size.width(),
            max_buckets: DEFAULT_MAX_BUCKETS,
            readonly: self.readonly,
            locking: self.locking,
            autoflush: self.locking || self.autoflush.unwrap_or(false),
            autobless: self.autobless,
            root_kind: self.root_kind,
            digest: self.digest,
            filters: self.filters,
            audit,
        };
        Db::open_with(options)
    }
}
