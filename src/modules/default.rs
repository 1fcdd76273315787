//! `default`: the home screen at mount root.
//!
//! `translate` always fails, `getattr("/")` is synthesised rather than
//! `lstat`'d (mode `0755`), and `readdir("/")` lists the other active,
//! root-visible modules.

use std::path::PathBuf;
use std::time::SystemTime;

use crate::errno::{self, OpResult};
use crate::module::{baseline_release, Attrs, DirEntry, Module, ModuleCore, PathKind, StatfsInfo, Subpath};
use crate::registry::{FileKind, Handle};

pub struct DefaultModule {
    core: ModuleCore,
    /// Names of every other active module with `visible_in_root() == true`,
    /// in the order they should be listed. Assembled by the caller once all
    /// modules are registered and handed in already filtered, rather than
    /// having `default` walk a global module table itself.
    visible_modules: Vec<String>,
}

impl DefaultModule {
    pub fn new(core: ModuleCore, visible_modules: Vec<String>) -> Self {
        DefaultModule { core, visible_modules }
    }
}

impl Module for DefaultModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn visible_in_root(&self) -> bool {
        false
    }

    /// `default` never resolves to a backing location; every baseline
    /// helper that would otherwise need one fails closed through here.
    fn translate(&self, _subpath: Subpath<'_>) -> OpResult<PathBuf> {
        Err(errno::not_found())
    }

    fn getattr(&self, subpath: Subpath<'_>) -> OpResult<Attrs> {
        if subpath == "/" {
            let now = SystemTime::now();
            Ok(Attrs {
                kind: PathKind::Directory,
                size: 0,
                mode: 0o755,
                uid: 0,
                gid: 0,
                nlink: 2,
                atime: now,
                mtime: now,
                ctime: now,
            })
        } else {
            Err(errno::not_found())
        }
    }

    fn access(&self, _subpath: Subpath<'_>, mask: i32) -> OpResult<()> {
        if mask & libc::W_OK != 0 {
            Err(errno::not_permitted())
        } else {
            Ok(())
        }
    }

    fn opendir(&self, subpath: Subpath<'_>) -> OpResult<u64> {
        if subpath != "/" {
            return Err(errno::not_found());
        }
        let names = self.visible_modules.iter().map(std::ffi::OsString::from).collect();
        self.core
            .registry
            .insert(PathBuf::from("/"), FileKind::Directory, 0, Handle::Directory(names), false)
    }

    fn readdir(&self, handle: u64) -> OpResult<Vec<DirEntry>> {
        let mut out = vec![
            DirEntry { name: ".".to_string(), kind: PathKind::Directory },
            DirEntry { name: "..".to_string(), kind: PathKind::Directory },
        ];
        self.core
            .registry
            .with_handle(handle, |h| match h {
                Handle::Directory(names) => {
                    for name in names {
                        out.push(DirEntry {
                            name: name.to_string_lossy().into_owned(),
                            kind: PathKind::Directory,
                        });
                    }
                }
                Handle::File(_) => {}
            })
            .ok_or_else(errno::not_found)?;
        Ok(out)
    }

    fn releasedir(&self, handle: u64) -> OpResult<()> {
        baseline_release(self, handle)
    }

    fn statfs(&self, _subpath: Subpath<'_>) -> OpResult<StatfsInfo> {
        crate::module::baseline_statfs_at(&self.core.config.mountpoint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::test_support::{core, registry, test_config};

    fn module(visible: &[&str]) -> DefaultModule {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(&[tmp.path().to_path_buf()]);
        DefaultModule::new(
            core("default", &config, &registry()),
            visible.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn root_is_synthesised_owned_by_root() {
        let m = module(&["private", "public"]);
        let attrs = m.getattr("/").unwrap();
        assert_eq!(attrs.kind, PathKind::Directory);
        assert_eq!(attrs.mode, 0o755);
        assert_eq!(attrs.uid, 0);
        assert_eq!(attrs.gid, 0);
    }

    #[test]
    fn anything_else_is_not_found() {
        let m = module(&["private"]);
        assert_eq!(m.getattr("/foo").unwrap_err(), libc::ENOENT);
        assert_eq!(m.translate("/foo").unwrap_err(), libc::ENOENT);
    }

    #[test]
    fn readdir_lists_only_visible_modules() {
        let m = module(&["private", "public", "backup"]);
        let handle = m.opendir("/").unwrap();
        let entries = m.readdir(handle).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "private", "public", "backup"]);
    }

    #[test]
    fn write_access_is_refused() {
        let m = module(&["private"]);
        assert_eq!(m.access("/", libc::W_OK).unwrap_err(), libc::EPERM);
        assert!(m.access("/", libc::R_OK).is_ok());
    }
}
