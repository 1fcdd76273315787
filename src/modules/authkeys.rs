//! `authkeys`: a single editable `authorized_keys` file at the module root.

use std::path::PathBuf;

use crate::errno::{self, OpResult};
use crate::module::{Attrs, Module, ModuleCore, Subpath};
use crate::modules::filemodule;

const ALIAS: &str = "authorized_keys";
/// The original's hardcoded ceiling, distinct from the configured
/// `truncate_maxsize`.
const MAX_SIZE: u64 = 10_000_000;

pub struct AuthkeysModule {
    core: ModuleCore,
}

impl AuthkeysModule {
    pub fn new(core: ModuleCore) -> Self {
        AuthkeysModule { core }
    }
}

impl Module for AuthkeysModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn translate(&self, subpath: Subpath<'_>) -> OpResult<PathBuf> {
        let _ = filemodule::ensure_exists(&self.core);
        filemodule::file_translate(&self.core, subpath, Some(ALIAS))
    }

    fn getattr(&self, subpath: Subpath<'_>) -> OpResult<Attrs> {
        filemodule::file_getattr(&self.core, subpath, Some(ALIAS))
    }

    fn readlink(&self, _subpath: Subpath<'_>) -> OpResult<PathBuf> {
        Err(errno::not_supported())
    }

    fn mkdir(&self, _subpath: Subpath<'_>, _mode: u32) -> OpResult<()> {
        Err(errno::not_supported())
    }

    fn rmdir(&self, _subpath: Subpath<'_>) -> OpResult<()> {
        Err(errno::not_supported())
    }

    fn rename(
        &self,
        _source_physical: &std::path::Path,
        _dest_subpath: Subpath<'_>,
        _virtual_from: &str,
        _virtual_to: &str,
    ) -> OpResult<()> {
        Err(errno::not_permitted())
    }

    fn chmod(&self, _subpath: Subpath<'_>, _mode: u32) -> OpResult<()> {
        Err(errno::not_permitted())
    }

    fn chown(&self, _subpath: Subpath<'_>, _uid: u32, _gid: u32) -> OpResult<()> {
        Err(errno::not_permitted())
    }

    fn truncate(&self, subpath: Subpath<'_>, size: u64) -> OpResult<()> {
        if size > MAX_SIZE {
            return Err(errno::not_permitted());
        }
        crate::module::baseline_truncate(self, subpath, size)
    }

    fn create(&self, subpath: Subpath<'_>, mode: u32) -> OpResult<u64> {
        let _ = filemodule::ensure_exists(&self.core);
        crate::module::baseline_create(self, subpath, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::test_support::{core, make_raid, registry, test_config};

    fn module(tmp: &std::path::Path) -> AuthkeysModule {
        let raid = make_raid(tmp, "authkeys");
        let config = test_config(&[raid]);
        AuthkeysModule::new(core("authkeys", &config, &registry()))
    }

    #[test]
    fn root_and_alias_resolve_to_the_same_file() {
        let tmp = tempfile::tempdir().unwrap();
        let m = module(tmp.path());
        assert_eq!(m.translate("/").unwrap(), m.translate("/authorized_keys").unwrap());
    }

    #[test]
    fn other_paths_are_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let m = module(tmp.path());
        assert_eq!(m.translate("/other").unwrap_err(), libc::ENOENT);
    }

    #[test]
    fn directory_operations_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let m = module(tmp.path());
        assert_eq!(m.mkdir("/sub", 0o700).unwrap_err(), libc::ENOTSUP);
        assert_eq!(m.rmdir("/sub").unwrap_err(), libc::ENOTSUP);
    }

    #[test]
    fn truncate_over_hardcoded_ceiling_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let m = module(tmp.path());
        let handle = m.create("/", 0o600).unwrap();
        m.release("/", handle).unwrap();
        assert_eq!(m.truncate("/", MAX_SIZE + 1).unwrap_err(), libc::EPERM);
    }
}
