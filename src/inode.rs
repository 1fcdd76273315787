//! Bridges FUSE's inode-addressed kernel protocol to the virtual-path
//! contract every `Module` method expects.
//!
//! A forward map from inode to the path it names, and a reverse map to
//! avoid handing out two inodes for the same path. `parking_lot::RwLock`
//! around a plain `HashMap` rather than a sharded concurrent map, since
//! FUSE already serialises most of the traffic through `fuser`'s session
//! loop and one lock per table is plenty.
//!
//! The kernel holds a reference count (`nlookup`) on every inode it has been
//! handed via `lookup`/`mkdir`/`create`/etc. until it sends a matching
//! `forget`; `root` (ino 1) is pinned forever and never forgotten.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

pub const ROOT_INO: u64 = 1;

struct Entry {
    path: String,
    lookups: u64,
}

struct Tables {
    by_ino: HashMap<u64, Entry>,
    by_path: HashMap<String, u64>,
}

pub struct InodeTable {
    next: AtomicU64,
    tables: RwLock<Tables>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(ROOT_INO, Entry { path: "/".to_string(), lookups: 1 });
        by_path.insert("/".to_string(), ROOT_INO);
        InodeTable {
            next: AtomicU64::new(ROOT_INO + 1),
            tables: RwLock::new(Tables { by_ino, by_path }),
        }
    }

    /// Returns the virtual path `ino` currently names, if it is still live.
    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.tables.read().by_ino.get(&ino).map(|e| e.path.clone())
    }

    /// Joins a directory's virtual path with a child name. A virtual path
    /// always starts with `/` and never ends with a trailing separator
    /// (except the root itself).
    pub fn child_path(parent: &str, name: &str) -> String {
        if parent == "/" {
            format!("/{name}")
        } else {
            format!("{parent}/{name}")
        }
    }

    /// Assigns (or reuses) the inode for `path`, incrementing its lookup
    /// count by one the way every `lookup`/`mkdir`/`create`/`symlink`/`link`
    /// reply hands the kernel one fresh reference.
    pub fn lookup(&self, path: &str) -> u64 {
        let mut tables = self.tables.write();
        if let Some(&ino) = tables.by_path.get(path) {
            tables.by_ino.get_mut(&ino).unwrap().lookups += 1;
            return ino;
        }
        let ino = self.next.fetch_add(1, Ordering::Relaxed);
        tables.by_ino.insert(ino, Entry { path: path.to_string(), lookups: 1 });
        tables.by_path.insert(path.to_string(), ino);
        ino
    }

    /// `Filesystem::forget`: drops `nlookup` references; once an inode's
    /// count reaches zero it is removed from both tables. Root is never
    /// removed.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut tables = self.tables.write();
        let remove = match tables.by_ino.get_mut(&ino) {
            Some(entry) => {
                entry.lookups = entry.lookups.saturating_sub(nlookup);
                entry.lookups == 0
            }
            None => false,
        };
        if remove {
            if let Some(entry) = tables.by_ino.remove(&ino) {
                tables.by_path.remove(&entry.path);
            }
        }
    }

    /// Renaming moves a path (and every descendant path already known to
    /// the table) without changing the inode that names it, matching a
    /// POSIX rename's inode-preserving semantics.
    pub fn rename(&self, from: &str, to: &str) {
        let mut tables = self.tables.write();
        let moved: Vec<(String, u64)> = tables
            .by_path
            .iter()
            .filter(|(p, _)| *p == from || p.starts_with(&format!("{from}/")))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();
        for (old_path, ino) in moved {
            let suffix = &old_path[from.len()..];
            let new_path = format!("{to}{suffix}");
            tables.by_path.remove(&old_path);
            tables.by_path.insert(new_path.clone(), ino);
            if let Some(entry) = tables.by_ino.get_mut(&ino) {
                entry.path = new_path;
            }
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
