//! `lister`: the shared anonymous-export listing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use crate::anon::AnonMap;
use crate::errno::{self, OpResult};
use crate::identity::Identity;
use crate::module::{Attrs, DirEntry, Module, ModuleCore, PathKind, Subpath};
use crate::registry::{FileKind, Handle};

const CORE_ENTRY: &str = "core";
/// A synthetic entry advertising an oversized, unreadable-in-practice size.
const CORE_SIZE: u64 = 1 << 62;

pub struct ListerModule {
    core: ModuleCore,
    anon_map: Arc<AnonMap>,
    identity: Identity,
}

impl ListerModule {
    pub fn new(core: ModuleCore, anon_map: Arc<AnonMap>, identity: Identity) -> Self {
        if let Some(comm) = &core.communicator {
            let map = Arc::clone(&anon_map);
            comm.register_command("CLEARCACHE", "evict the anonymous-export map", move |_| {
                map.clear();
                Ok(String::new())
            });
            let map = Arc::clone(&anon_map);
            comm.register_command("FORCE-RELOAD", "reload the anonymous-export map now", move |_| {
                map.force_reload();
                Ok(String::new())
            });
        }
        ListerModule { core, anon_map, identity }
    }

    fn split_first_segment(subpath: &str) -> (&str, Option<&str>) {
        let rest = subpath.strip_prefix('/').unwrap_or(subpath);
        match rest.split_once('/') {
            Some((name, remainder)) => (name, Some(remainder)),
            None => (rest, None),
        }
    }
}

impl Module for ListerModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn visible_in_root(&self) -> bool {
        false
    }

    /// Root is virtual; `core` is synthetic and never translated; any other
    /// first segment is looked up in the anonymous map. The mapping's
    /// stored value is used as-is, not re-prefixed with a raid.
    fn translate(&self, subpath: Subpath<'_>) -> OpResult<PathBuf> {
        if subpath == "/" {
            return Ok(PathBuf::new());
        }
        let (name, remainder) = Self::split_first_segment(subpath);
        if name == CORE_ENTRY {
            return Err(errno::not_supported());
        }
        match self.anon_map.get(name) {
            Some(value) => {
                let base = PathBuf::from(value);
                Ok(match remainder {
                    Some(r) if !r.is_empty() => base.join(r),
                    _ => base,
                })
            }
            None => Err(errno::not_found()),
        }
    }

    fn getattr(&self, subpath: Subpath<'_>) -> OpResult<Attrs> {
        if subpath == "/" {
            let now = SystemTime::now();
            return Ok(Attrs {
                kind: PathKind::Directory,
                size: 0,
                mode: 0o555,
                uid: self.identity.uid,
                gid: self.identity.gid,
                nlink: 2,
                atime: now,
                mtime: now,
                ctime: now,
            });
        }
        let (name, remainder) = Self::split_first_segment(subpath);
        if name == CORE_ENTRY && remainder.is_none() {
            let now = SystemTime::now();
            return Ok(Attrs {
                kind: PathKind::File,
                size: CORE_SIZE,
                mode: 0o555,
                uid: self.identity.uid,
                gid: self.identity.gid,
                nlink: 1,
                atime: now,
                mtime: now,
                ctime: now,
            });
        }
        let mut attrs = crate::module::baseline_getattr(self, subpath)?;
        attrs.uid = self.identity.uid;
        attrs.gid = self.identity.gid;
        Ok(attrs)
    }

    fn mkdir(&self, subpath: Subpath<'_>, mode: u32) -> OpResult<()> {
        if subpath == "/" {
            return Err(errno::not_permitted());
        }
        let forced = (mode & 0o770) | 0o005;
        crate::module::baseline_mkdir(self, subpath, forced)
    }

    fn open(&self, subpath: Subpath<'_>, flags: i32) -> OpResult<u64> {
        let (name, remainder) = Self::split_first_segment(subpath);
        if name == CORE_ENTRY && remainder.is_none() {
            let file = std::fs::File::open("/dev/zero").map_err(|_| errno::from_errno())?;
            return self
                .core
                .registry
                .insert(PathBuf::from("/dev/zero"), FileKind::File, flags, Handle::File(file), false);
        }
        crate::module::baseline_open(self, subpath, flags)
    }

    fn opendir(&self, subpath: Subpath<'_>) -> OpResult<u64> {
        if subpath != "/" {
            return crate::module::baseline_opendir(self, subpath);
        }
        let mut names: Vec<std::ffi::OsString> = vec![std::ffi::OsString::from(CORE_ENTRY)];
        names.extend(self.anon_map.entries().into_iter().map(|(k, _)| std::ffi::OsString::from(k)));
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
                        let kind = if name == CORE_ENTRY.as_ref() { PathKind::File } else { PathKind::Directory };
                        out.push(DirEntry { name: name.to_string_lossy().into_owned(), kind });
                    }
                }
            })
            .ok_or_else(errno::not_found)?;
        Ok(out)
    }
}
