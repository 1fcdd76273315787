//! Raid locator: finds the one physical volume backing `(module, user)`.
//!
//! Iterates the configured raids in order, `stat`s each
//! `<raid>/<modname>/<username>`, and memoises the first hit for the life of
//! the module. A miss is a recoverable "not found", not a startup error.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::errno;

/// Caches the located raid for a single `(module, user)` pair. One instance
/// lives inside each `Module`'s core for the process lifetime, set once and
/// reused rather than re-scanned on every call.
pub struct RaidLocator {
    modname: String,
    located: RwLock<Option<PathBuf>>,
}

impl RaidLocator {
    pub fn new(modname: impl Into<String>) -> Self {
        RaidLocator {
            modname: modname.into(),
            located: RwLock::new(None),
        }
    }

    /// Returns the directory `<raid>/<modname>/<username>`, searching
    /// `raids` in order on the first call and caching the result afterwards.
    pub fn locate(&self, raids: &[PathBuf], username: &str) -> errno::OpResult<PathBuf> {
        if let Some(p) = self.located.read().as_ref() {
            return Ok(p.clone());
        }

        let mut found = None;
        for raid in raids {
            let candidate = raid.join(&self.modname).join(username);
            // A plain existence check, not a directory check: for the
            // single-file modules (`authkeys`, `control`) the raid slot
            // itself is the backing file, not a directory containing one.
            if candidate.exists() {
                found = Some(candidate);
                break;
            }
        }

        match found {
            Some(p) => {
                *self.located.write() = Some(p.clone());
                Ok(p)
            }
            None => Err(errno::not_found()),
        }
    }

    /// Forgets the cached location, forcing the next `locate` to rescan.
    pub fn invalidate(&self) {
        *self.located.write() = None;
    }

    /// The currently cached location, if any, without triggering a scan.
    /// Used by the `<modname>_raid` control-socket command.
    pub fn cached(&self) -> Option<PathBuf> {
        self.located.read().clone()
    }
}

/// Scans `<raid>/backup/*` across every raid, mapping userid to its backup
/// directory.
pub fn scan_backup_tree(raids: &[PathBuf]) -> std::collections::HashMap<String, PathBuf> {
    let mut map = std::collections::HashMap::new();
    for raid in raids {
        let backup_raid = raid.join("backup");
        let entries = match std::fs::read_dir(&backup_raid) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if is_directory(&path) {
                if let Some(name) = entry.file_name().to_str() {
                    map.insert(name.to_string(), path);
                }
            }
        }
    }
    map
}

fn is_directory(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn locates_first_matching_raid() {
        let tmp = tempfile::tempdir().unwrap();
        let r1 = tmp.path().join("r1");
        let r2 = tmp.path().join("r2");
        fs::create_dir_all(r2.join("private/alice")).unwrap();
        fs::create_dir_all(&r1).unwrap();

        let locator = RaidLocator::new("private");
        let found = locator.locate(&[r1.clone(), r2.clone()], "alice").unwrap();
        assert_eq!(found, r2.join("private/alice"));
        // cached afterwards, even if the directory later disappears.
        fs::remove_dir_all(&r2).unwrap();
        let cached = locator.locate(&[r1, r2], "alice").unwrap();
        assert_eq!(cached, found);
    }

    #[test]
    fn missing_raid_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let locator = RaidLocator::new("private");
        let err = locator.locate(&[tmp.path().to_path_buf()], "alice").unwrap_err();
        assert_eq!(err, libc::ENOENT);
    }

    #[test]
    fn scans_backup_tree_across_raids() {
        let tmp = tempfile::tempdir().unwrap();
        let r1 = tmp.path().join("r1");
        let r2 = tmp.path().join("r2");
        fs::create_dir_all(r1.join("backup/alice")).unwrap();
        fs::create_dir_all(r2.join("backup/bob")).unwrap();

        let map = scan_backup_tree(&[r1.clone(), r2.clone()]);
        assert_eq!(map.len(), 2);
        assert_eq!(map["alice"], r1.join("backup/alice"));
        assert_eq!(map["bob"], r2.join("backup/bob"));
    }
}
