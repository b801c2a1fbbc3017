//! File mapping and cross-process advisory locking.
//!
//! The queue is a single file shared between processes. Mutation is guarded
//! by an advisory `fcntl` write lock over the whole file; traversal takes
//! the corresponding read lock. Intra-process serialization is layered on
//! top by the owning structure; the kernel lock only arbitrates between
//! processes.

use crate::error::{PqError, Result};
use memmap2::{MmapOptions, MmapRaw};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// How a persistent store is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Single-writer mode: mutations allowed, exclusive advisory lock taken
    /// around each mutation.
    ReadWrite,
    /// Multi-reader mode: traversal only, shared advisory locks.
    ReadOnly,
}

/// A memory-mapped file plus its advisory-lock plumbing.
pub struct MappedFile {
    file: File,
    map: MmapRaw,
    len: u64,
    path: PathBuf,
    mode: OpenMode,
}

impl MappedFile {
    /// Creates (clobbering any existing file) a file of exactly `len` bytes
    /// and maps it read-write.
    pub fn create(path: &Path, len: u64, perms: u32) -> Result<MappedFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(perms)
            .open(path)?;
        file.set_len(len)?;
        // SAFETY: the file was just sized to `len` and stays open (and
        // unshrunk) for the life of the mapping.
        let map = unsafe { MmapOptions::new().map_raw(&file)? };
        Ok(MappedFile {
            file,
            map,
            len,
            path: path.to_owned(),
            mode: OpenMode::ReadWrite,
        })
    }

    /// Maps an existing file whole.
    pub fn open(path: &Path, mode: OpenMode) -> Result<MappedFile> {
        let mut opts = OpenOptions::new();
        opts.read(true);
        if mode == OpenMode::ReadWrite {
            opts.write(true);
        }
        let file = opts.open(path)?;
        let len = file.metadata()?.len();
        // SAFETY: the file stays open for the life of the mapping; the
        // cooperating-process protocol never truncates a live queue.
        let map = unsafe {
            match mode {
                OpenMode::ReadWrite => MmapOptions::new().map_raw(&file)?,
                OpenMode::ReadOnly => MmapOptions::new().map_raw_read_only(&file)?,
            }
        };
        Ok(MappedFile {
            file,
            map,
            len,
            path: path.to_owned(),
            mode,
        })
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Base pointer of the mapping.
    ///
    /// Callers derive all region pointers from this and are responsible for
    /// staying inside `len` and honoring the lock discipline.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// Flushes dirty pages to the backing file.
    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    /// Takes the cross-process lock appropriate for `exclusive`, blocking
    /// until granted. Returns a guard that releases on drop.
    pub fn lock(&self, exclusive: bool) -> Result<FileLockGuard<'_>> {
        let ltype = if exclusive { libc::F_WRLCK } else { libc::F_RDLCK };
        fcntl_lock(&self.file, ltype as libc::c_short)?;
        Ok(FileLockGuard { file: &self.file })
    }
}

/// RAII guard for the advisory file lock.
pub struct FileLockGuard<'a> {
    file: &'a File,
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        // Unlock failure leaves the lock to be released at close; nothing
        // useful to do from a destructor.
        let _ = fcntl_lock(self.file, libc::F_UNLCK as libc::c_short);
    }
}

fn fcntl_lock(file: &File, l_type: libc::c_short) -> Result<()> {
    // SAFETY: flock is a plain-old-data struct; zeroed is a valid initial
    // state and l_start/l_len of zero means "whole file".
    let mut lk: libc::flock = unsafe { std::mem::zeroed() };
    lk.l_type = l_type;
    lk.l_whence = libc::SEEK_SET as libc::c_short;
    // SAFETY: fd is owned by `file` and valid for the duration of the call.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &lk) };
    if rc == -1 {
        return Err(PqError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_map_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapped.bin");
        let m = MappedFile::create(&path, 4096, 0o600).unwrap();
        // SAFETY: offset 0..8 is inside the 4096-byte mapping and no other
        // thread references it.
        unsafe {
            std::ptr::write(m.base().cast::<u64>(), 0xDEAD_BEEF);
        }
        m.flush().unwrap();
        drop(m);

        let m = MappedFile::open(&path, OpenMode::ReadOnly).unwrap();
        let v = unsafe { std::ptr::read(m.base().cast::<u64>()) };
        assert_eq!(v, 0xDEAD_BEEF);
    }

    #[test]
    fn lock_guard_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.bin");
        let m = MappedFile::create(&path, 64, 0o600).unwrap();
        let g = m.lock(true).unwrap();
        drop(g);
        let g = m.lock(false).unwrap();
        drop(g);
    }
}
