//! # Storage File
//!
//! A byte-addressable random-access file with append-at-end allocation and
//! reference-counted advisory locking. This is the only type in the crate
//! that touches the OS file; every layer above works in terms of
//! `read_at` / `write_at` / `allocate`.
//!
//! ## Locking Discipline
//!
//! Locks nest per instance via a depth counter: the outermost acquisition
//! issues the OS lock, inner acquisitions only bump the counter. Asking for
//! an exclusive lock while a shared one is held upgrades in place and the
//! upgrade sticks until the outermost release. When the file was opened
//! with autoflush, dirty data is synced before the outermost release, so a
//! reader that acquires the lock next observes every write from the
//! previous window.
//!
//! ## Rename Detection
//!
//! Another process may replace the database file wholesale (compaction does
//! exactly that). On the outermost lock acquisition the file's identity on
//! disk is compared against the open descriptor; a mismatch transparently
//! reopens the path so the instance continues against the live file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use tracing::{debug, warn};

use super::lock::{self, LockMode};
use crate::error::ErrorKind;

#[derive(Debug)]
pub struct StorageFile {
    path: PathBuf,
    file: File,
    readonly: bool,
    locking: bool,
    autoflush: bool,
    dirty: bool,
    lock_depth: u32,
    lock_mode: LockMode,
}

impl StorageFile {
    /// Opens (or creates, unless read-only) the file at `path`.
    pub fn open(path: &Path, readonly: bool, locking: bool, autoflush: bool) -> Result<Self> {
        let file = Self::open_handle(path, readonly)
            .wrap_err_with(|| ErrorKind::Io(format!("cannot open {}", path.display())))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            readonly,
            locking,
            autoflush,
            dirty: false,
            lock_depth: 0,
            lock_mode: LockMode::Shared,
        })
    }

    fn open_handle(path: &Path, readonly: bool) -> std::io::Result<File> {
        let mut options = OpenOptions::new();
        options.read(true);
        if !readonly {
            options.write(true).create(true);
        }
        options.open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self
            .file
            .metadata()
            .wrap_err_with(|| ErrorKind::Io("stat failed".into()))?
            .len())
    }

    /// Acquires the advisory lock, nesting by depth. The outermost
    /// acquisition also re-checks the file identity on disk.
    pub fn lock(&mut self, mode: LockMode) -> Result<()> {
        if self.lock_depth == 0 {
            self.reopen_if_replaced()?;
            if self.locking {
                lock::lock(&self.file, mode)
                    .wrap_err_with(|| ErrorKind::Io("file lock failed".into()))?;
            }
            self.lock_mode = mode;
        } else if mode == LockMode::Exclusive && self.lock_mode == LockMode::Shared {
            if self.locking {
                lock::lock(&self.file, LockMode::Exclusive)
                    .wrap_err_with(|| ErrorKind::Io("lock upgrade failed".into()))?;
            }
            self.lock_mode = LockMode::Exclusive;
        }
        self.lock_depth += 1;
        Ok(())
    }

    /// Releases one level of lock nesting; the outermost release flushes
    /// (under autoflush) and drops the OS lock.
    pub fn unlock(&mut self) -> Result<()> {
        ensure!(self.lock_depth > 0, "dpdb: unlock without a held lock");
        self.lock_depth -= 1;
        if self.lock_depth == 0 {
            if self.autoflush && self.dirty {
                self.file
                    .sync_data()
                    .wrap_err_with(|| ErrorKind::Io("flush failed".into()))?;
                self.dirty = false;
            }
            if self.locking {
                lock::unlock(&self.file)
                    .wrap_err_with(|| ErrorKind::Io("file unlock failed".into()))?;
            }
        }
        Ok(())
    }

    pub fn lock_depth(&self) -> u32 {
        self.lock_depth
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        read_exact_at(&self.file, offset, buf)
            .wrap_err_with(|| ErrorKind::Io(format!("read of {} bytes at {offset}", buf.len())))
    }

    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        ensure!(!self.readonly, ErrorKind::Readonly);
        write_all_at(&self.file, offset, bytes)
            .wrap_err_with(|| ErrorKind::Io(format!("write of {} bytes at {offset}", bytes.len())))?;
        self.dirty = true;
        Ok(())
    }

    /// Extends the file by `len` zero bytes and returns the offset of the
    /// new region.
    pub fn allocate(&mut self, len: u64) -> Result<u64> {
        ensure!(!self.readonly, ErrorKind::Readonly);
        let offset = self.len()?;
        self.file
            .set_len(offset + len)
            .wrap_err_with(|| ErrorKind::Io("file extension failed".into()))?;
        self.dirty = true;
        debug!(offset, len, "extended file");
        Ok(offset)
    }

    /// Forces buffered data to disk regardless of the autoflush setting.
    pub fn sync(&mut self) -> Result<()> {
        self.file
            .sync_data()
            .wrap_err_with(|| ErrorKind::Io("sync failed".into()))?;
        self.dirty = false;
        Ok(())
    }

    #[cfg(unix)]
    fn reopen_if_replaced(&mut self) -> Result<()> {
        use std::os::unix::fs::MetadataExt;

        let on_disk = match std::fs::metadata(&self.path) {
            Ok(meta) => meta,
            // Path temporarily missing mid-rename: keep the open handle.
            Err(_) => return Ok(()),
        };
        let held = self
            .file
            .metadata()
            .wrap_err_with(|| ErrorKind::Io("stat failed".into()))?;
        if on_disk.ino() != held.ino() || on_disk.dev() != held.dev() {
            warn!(path = %self.path.display(), "file was replaced on disk, reopening");
            self.file = Self::open_handle(&self.path, self.readonly)
                .wrap_err_with(|| ErrorKind::Io(format!("reopen of {}", self.path.display())))?;
            self.dirty = false;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn reopen_if_replaced(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(bytes, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unexpected end of file",
            ));
        }
        offset += n as u64;
        let rest = buf;
        buf = &mut rest[n..];
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut offset: u64, mut bytes: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !bytes.is_empty() {
        let n = file.seek_write(bytes, offset)?;
        offset += n as u64;
        bytes = &bytes[n..];
    }
    Ok(())
}
