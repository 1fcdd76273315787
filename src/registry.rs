//! Process-wide open-file registry: opaque handle -> backing state.
//!
//! A mutex-guarded map from a monotonically generated id to a
//! `{path, fd/dir, flags, is_open, has_changed}` record. Rather than
//! transparently closing and reopening the native descriptor mid-access once
//! a soft ceiling is crossed, this registry enforces a hard descriptor
//! budget at open time: once `max_native_fds` handles are held, further
//! opens fail busy until one is released.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::errno;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

pub enum Handle {
    File(File),
    Directory(Vec<std::ffi::OsString>),
}

pub struct OpenFile {
    pub path: PathBuf,
    pub kind: FileKind,
    pub flags: i32,
    pub changed: bool,
    pub handle: Mutex<Handle>,
}

/// Keyed by an opaque 64-bit id handed to the kernel interface as the FUSE
/// file handle.
pub struct OpenFileRegistry {
    next_id: AtomicU64,
    entries: Mutex<std::collections::HashMap<u64, OpenFile>>,
    max_native_fds: usize,
}

impl OpenFileRegistry {
    pub fn new(max_native_fds: usize) -> Self {
        OpenFileRegistry {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(std::collections::HashMap::new()),
            max_native_fds,
        }
    }

    /// Records a freshly opened file/directory, enforcing the configured
    /// native descriptor ceiling (`max_native_fds`).
    pub fn insert(&self, path: PathBuf, kind: FileKind, flags: i32, handle: Handle, changed: bool) -> errno::OpResult<u64> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_native_fds {
            return Err(errno::busy());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            id,
            OpenFile {
                path,
                kind,
                flags,
                changed,
                handle: Mutex::new(handle),
            },
        );
        Ok(id)
    }

    pub fn mark_changed(&self, id: u64) {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.changed = true;
        }
    }

    pub fn was_changed(&self, id: u64) -> bool {
        self.entries.lock().get(&id).map(|e| e.changed).unwrap_or(false)
    }

    pub fn path_of(&self, id: u64) -> Option<PathBuf> {
        self.entries.lock().get(&id).map(|e| e.path.clone())
    }

    /// Removes and returns the entry, closing native resources as it's
    /// dropped. Returns `None` if `id` is unknown (already released).
    pub fn remove(&self, id: u64) -> Option<OpenFile> {
        self.entries.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn with_handle<R>(&self, id: u64, f: impl FnOnce(&mut Handle) -> R) -> Option<R> {
        let entries = self.entries.lock();
        entries.get(&id).map(|entry| f(&mut entry.handle.lock()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_then_release_empties_table() {
        let registry = OpenFileRegistry::new(8);
        let id = registry
            .insert(PathBuf::from("/tmp/x"), FileKind::File, 0, Handle::Directory(vec![]), false)
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert!(!registry.was_changed(id));
        registry.mark_changed(id);
        assert!(registry.was_changed(id));
        registry.remove(id);
        assert!(registry.is_empty());
    }

    #[test]
    fn rejects_beyond_native_fd_ceiling() {
        let registry = OpenFileRegistry::new(1);
        registry
            .insert(PathBuf::from("/tmp/a"), FileKind::File, 0, Handle::Directory(vec![]), false)
            .unwrap();
        let err = registry
            .insert(PathBuf::from("/tmp/b"), FileKind::File, 0, Handle::Directory(vec![]), false)
            .unwrap_err();
        assert_eq!(err, libc::EBUSY);
    }
}
