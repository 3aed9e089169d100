//! # Advisory File Locking
//!
//! Whole-file advisory locks coordinate instances that share one database
//! file. The lock covers the entire file: readers take it shared, writers
//! exclusive. Nesting is handled one layer up (see
//! [`StorageFile`](super::file::StorageFile)); this module only speaks to
//! the OS.
//!
//! On unix the lock is `flock(2)`; upgrading a held shared lock to
//! exclusive re-issues `flock` with `LOCK_EX`, which the kernel performs
//! atomically on the same descriptor. On windows the equivalent is
//! `LockFileEx` over the full byte range.

use std::fs::File;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[cfg(unix)]
pub fn lock(file: &File, mode: LockMode) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let op = match mode {
        LockMode::Shared => libc::LOCK_SH,
        LockMode::Exclusive => libc::LOCK_EX,
    };
    let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
pub fn unlock(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
pub fn lock(file: &File, mode: LockMode) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::LockFileEx;
    use winapi::um::minwinbase::OVERLAPPED;
    use winapi::um::winnt::LOCKFILE_EXCLUSIVE_LOCK;

    let flags = match mode {
        LockMode::Shared => 0,
        LockMode::Exclusive => LOCKFILE_EXCLUSIVE_LOCK,
    };
    let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        LockFileEx(
            file.as_raw_handle() as *mut _,
            flags,
            0,
            !0,
            !0,
            &mut overlapped,
        )
    };
    if rc == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
pub fn unlock(file: &File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::UnlockFileEx;
    use winapi::um::minwinbase::OVERLAPPED;

    let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        UnlockFileEx(file.as_raw_handle() as *mut _, 0, !0, !0, &mut overlapped)
    };
    if rc == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
pub fn lock(_file: &File, _mode: LockMode) -> io::Result<()> {
    Ok(())
}

#[cfg(not(any(unix, windows)))]
pub fn unlock(_file: &File) -> io::Result<()> {
    Ok(())
}
