//! `all-backup-tree`: every user's backup subtree under `/<userid>/…`,
//! aggregated across raids into one flat, scanned namespace.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::RwLock;

use crate::errno::{self, OpResult};
use crate::identity::{self, Identity};
use crate::module::{Attrs, DirEntry, Module, ModuleCore, PathKind, Subpath};
use crate::raid::scan_backup_tree;
use crate::registry::{FileKind, Handle};

/// `check_update_list`'s default refresh period.
const TTL: Duration = Duration::from_secs(300);

struct Cache {
    map: HashMap<String, PathBuf>,
    built_at: Option<Instant>,
}

pub struct AllBackupTreeModule {
    core: ModuleCore,
    cache: RwLock<Cache>,
    identity: Identity,
}

impl AllBackupTreeModule {
    pub fn new(core: ModuleCore) -> Arc<Self> {
        let this = Arc::new(AllBackupTreeModule {
            cache: RwLock::new(Cache { map: HashMap::new(), built_at: None }),
            identity: identity::running_process(),
            core,
        });
        if let Some(comm) = this.core.communicator.clone() {
            let target = Arc::clone(&this);
            comm.register_command("BACKUPTREE_INVALIDATE", "force a rescan of the backup tree", move |_| {
                target.invalidate();
                Ok(String::new())
            });
        }
        this
    }

    fn invalidate(&self) {
        self.cache.write().built_at = None;
    }

    fn ensure_fresh(&self) {
        let stale = {
            let cache = self.cache.read();
            match cache.built_at {
                None => true,
                Some(t) => t.elapsed() > TTL,
            }
        };
        if stale {
            let map = scan_backup_tree(&self.core.config.raids());
            let mut cache = self.cache.write();
            cache.map = map;
            cache.built_at = Some(Instant::now());
        }
    }

    fn split_first_segment(subpath: &str) -> (&str, Option<&str>) {
        let rest = subpath.strip_prefix('/').unwrap_or(subpath);
        match rest.split_once('/') {
            Some((name, remainder)) => (name, Some(remainder)),
            None => (rest, None),
        }
    }
}

impl Module for AllBackupTreeModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn translate(&self, subpath: Subpath<'_>) -> OpResult<PathBuf> {
        if subpath == "/" {
            return Ok(PathBuf::new());
        }
        self.ensure_fresh();
        let (userid, remainder) = Self::split_first_segment(subpath);
        let cache = self.cache.read();
        match cache.map.get(userid) {
            Some(base) => Ok(match remainder {
                Some(r) if !r.is_empty() => base.join(r),
                _ => base.clone(),
            }),
            None => Err(errno::not_found()),
        }
    }

    fn getattr(&self, subpath: Subpath<'_>) -> OpResult<Attrs> {
        if subpath == "/" {
            let now = SystemTime::now();
            return Ok(Attrs {
                kind: PathKind::Directory,
                size: 0,
                mode: 0o755,
                uid: self.identity.uid,
                gid: self.identity.gid,
                nlink: 2,
                atime: now,
                mtime: now,
                ctime: now,
            });
        }
        crate::module::baseline_getattr(self, subpath)
    }

    fn access(&self, subpath: Subpath<'_>, mask: i32) -> OpResult<()> {
        if subpath == "/" {
            return if mask & libc::W_OK != 0 { Err(errno::not_permitted()) } else { Ok(()) };
        }
        crate::module::baseline_access(self, subpath, mask)
    }

    fn opendir(&self, subpath: Subpath<'_>) -> OpResult<u64> {
        if subpath != "/" {
            return crate::module::baseline_opendir(self, subpath);
        }
        self.ensure_fresh();
        let names = self
            .cache
            .read()
            .map
            .keys()
            .map(std::ffi::OsString::from)
            .collect();
        self.core
            .registry
            .insert(PathBuf::from("/"), FileKind::Directory, 0, Handle::Directory(names), false)
    }

    fn readdir(&self, handle: u64) -> OpResult<Vec<DirEntry>> {
        let path = self.core.registry.path_of(handle).ok_or_else(errno::not_found)?;
        if path != PathBuf::from("/") {
            return crate::module::baseline_readdir(self, handle);
        }
        let mut out = vec![
            DirEntry { name: ".".to_string(), kind: PathKind::Directory },
            DirEntry { name: "..".to_string(), kind: PathKind::Directory },
        ];
        self.core
            .registry
            .with_handle(handle, |h| {
                if let Handle::Directory(names) = h {
                    for name in names {
                        out.push(DirEntry { name: name.to_string_lossy().into_owned(), kind: PathKind::Directory });
                    }
                }
            })
            .ok_or_else(errno::not_found)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::test_support::{core, registry, test_config};

    fn module(tmp: &std::path::Path) -> Arc<AllBackupTreeModule> {
        std::fs::create_dir_all(tmp.join("backup/alice")).unwrap();
        std::fs::write(tmp.join("backup/alice/file.txt"), b"hi").unwrap();
        let config = test_config(&[tmp.to_path_buf()]);
        AllBackupTreeModule::new(core("all-backup-tree", &config, &registry()))
    }

    #[test]
    fn translate_resolves_known_userid() {
        let tmp = tempfile::tempdir().unwrap();
        let m = module(tmp.path());
        let resolved = m.translate("/alice/file.txt").unwrap();
        assert_eq!(resolved, tmp.path().join("backup/alice/file.txt"));
    }

    #[test]
    fn translate_unknown_userid_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let m = module(tmp.path());
        assert_eq!(m.translate("/bob/file.txt").unwrap_err(), libc::ENOENT);
    }

    #[test]
    fn readdir_root_lists_scanned_userids() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("backup/bob")).unwrap();
        let m = module(tmp.path());
        let handle = m.opendir("/").unwrap();
        let entries = m.readdir(handle).unwrap();
        let mut names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec![".", "..", "alice", "bob"]);
    }

    #[test]
    fn invalidate_forces_a_rescan() {
        let tmp = tempfile::tempdir().unwrap();
        let m = module(tmp.path());
        assert!(m.translate("/carol/f").is_err());

        std::fs::create_dir_all(tmp.path().join("backup/carol")).unwrap();
        m.invalidate();
        assert!(m.translate("/carol/f").is_ok());
    }
}
