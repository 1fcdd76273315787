//! `anonym`: `public`'s policy plus identity rewriting and the
//! `.mammut-suffix` sidecar.

use crate::errno::{self, OpResult};
use crate::identity::Identity;
use crate::module::{Attrs, DirEntry, Module, ModuleCore, Subpath};
use crate::modules::policy;

const SIDECAR: &str = ".mammut-suffix";

fn is_sidecar(subpath: &str) -> bool {
    subpath.rsplit('/').next() == Some(SIDECAR)
}

pub struct AnonymModule {
    core: ModuleCore,
    identity: Identity,
}

impl AnonymModule {
    pub fn new(core: ModuleCore, identity: Identity) -> Self {
        AnonymModule { core, identity }
    }
}

impl Module for AnonymModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    /// `is_path_valid` in the original rejects any access to the sidecar
    /// file; we fold that into every operation that takes a bare `subpath`
    /// by failing closed at `getattr`/`open`/`unlink` and friends.
    fn getattr(&self, subpath: Subpath<'_>) -> OpResult<Attrs> {
        if is_sidecar(subpath) {
            return Err(errno::not_found());
        }
        let mut attrs = crate::module::baseline_getattr(self, subpath)?;
        attrs.uid = self.identity.uid;
        attrs.gid = self.identity.gid;
        Ok(attrs)
    }

    fn open(&self, subpath: Subpath<'_>, flags: i32) -> OpResult<u64> {
        if is_sidecar(subpath) {
            return Err(errno::not_found());
        }
        crate::module::baseline_open(self, subpath, flags)
    }

    fn readdir(&self, handle: u64) -> OpResult<Vec<DirEntry>> {
        let entries = crate::module::baseline_readdir(self, handle)?;
        Ok(entries.into_iter().filter(|e| e.name != SIDECAR).collect())
    }

    fn mkdir(&self, subpath: Subpath<'_>, mode: u32) -> OpResult<()> {
        policy::publish_mkdir(self, self.name(), subpath, mode)
    }

    fn create(&self, subpath: Subpath<'_>, mode: u32) -> OpResult<u64> {
        if is_sidecar(subpath) {
            return Err(errno::not_permitted());
        }
        policy::publish_create(self, self.name(), subpath, mode)
    }

    fn unlink(&self, subpath: Subpath<'_>) -> OpResult<()> {
        if is_sidecar(subpath) {
            return Err(errno::not_permitted());
        }
        policy::publish_unlink(self, self.name(), subpath)
    }

    /// Unlinks the `.mammut-suffix` sidecar inside the directory before
    /// removing it, so the removal itself doesn't fail on a non-empty dir.
    fn rmdir(&self, subpath: Subpath<'_>) -> OpResult<()> {
        if let Ok(dir) = self.translate(subpath) {
            let _ = std::fs::remove_file(dir.join(SIDECAR));
        }
        policy::publish_rmdir(self, self.name(), subpath)
    }

    fn rename(
        &self,
        source_physical: &std::path::Path,
        dest_subpath: Subpath<'_>,
        virtual_from: &str,
        virtual_to: &str,
    ) -> OpResult<()> {
        policy::publish_rename(self, source_physical, dest_subpath, virtual_from, virtual_to)
    }

    fn truncate(&self, subpath: Subpath<'_>, size: u64) -> OpResult<()> {
        policy::publish_truncate(self, self.name(), subpath, size)
    }

    fn chmod(&self, subpath: Subpath<'_>, mode: u32) -> OpResult<()> {
        policy::publish_chmod(self, subpath, mode)
    }

    fn release(&self, subpath: Subpath<'_>, handle: u64) -> OpResult<()> {
        policy::publish_release(self, self.name(), subpath, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::test_support::{core, make_raid, registry, test_config};

    fn module(tmp: &std::path::Path) -> AnonymModule {
        let raid = make_raid(tmp, "anonym");
        let config = test_config(&[raid]);
        let c = core("anonym", &config, &registry());
        AnonymModule::new(c, Identity { uid: 4242, gid: 4343 })
    }

    #[test]
    fn getattr_always_reports_configured_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let m = module(tmp.path());
        let handle = m.create("/file.txt", 0o600).unwrap();
        m.release("/file.txt", handle).unwrap();

        let attrs = m.getattr("/file.txt").unwrap();
        assert_eq!(attrs.uid, 4242);
        assert_eq!(attrs.gid, 4343);
    }

    #[test]
    fn sidecar_is_invisible_and_unreadable() {
        let tmp = tempfile::tempdir().unwrap();
        let m = module(tmp.path());
        let dir = m.translate("/").unwrap();
        std::fs::write(dir.join(SIDECAR), b"suffix123").unwrap();

        assert_eq!(m.getattr("/.mammut-suffix").unwrap_err(), libc::ENOENT);
        assert_eq!(m.open("/.mammut-suffix", libc::O_RDONLY).unwrap_err(), libc::ENOENT);

        let dh = m.opendir("/").unwrap();
        let entries = m.readdir(dh).unwrap();
        assert!(entries.iter().all(|e| e.name != SIDECAR));
    }

    #[test]
    fn rmdir_removes_sidecar_before_removing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let m = module(tmp.path());
        m.mkdir("/export1", 0o700).unwrap();
        let dir = m.translate("/export1").unwrap();
        std::fs::write(dir.join(SIDECAR), b"suffix123").unwrap();

        m.rmdir("/export1").unwrap();
        assert!(!dir.exists());
    }
}
