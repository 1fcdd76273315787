//! `public`: pass-through plus mode-forcing and publication events. Shares
//! its policy layer with `anonym`, minus that variant's uid/gid rewrite and
//! sidecar handling.

use crate::errno::OpResult;
use crate::module::{Module, ModuleCore, Subpath};
use crate::modules::policy;

pub struct PublicModule {
    core: ModuleCore,
}

impl PublicModule {
    pub fn new(core: ModuleCore) -> Self {
        PublicModule { core }
    }
}

impl Module for PublicModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn mkdir(&self, subpath: Subpath<'_>, mode: u32) -> OpResult<()> {
        policy::publish_mkdir(self, self.name(), subpath, mode)
    }

    fn create(&self, subpath: Subpath<'_>, mode: u32) -> OpResult<u64> {
        policy::publish_create(self, self.name(), subpath, mode)
    }

    fn unlink(&self, subpath: Subpath<'_>) -> OpResult<()> {
        policy::publish_unlink(self, self.name(), subpath)
    }

    fn rmdir(&self, subpath: Subpath<'_>) -> OpResult<()> {
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
    use crate::communicator::Communicator;
    use crate::events::EventQueue;
    use crate::modules::test_support::{core, make_raid, registry, test_config};
    use std::os::unix::fs::PermissionsExt;

    fn module_with_comm(tmp: &std::path::Path) -> (PublicModule, std::sync::Arc<Communicator>) {
        let raid = make_raid(tmp, "public");
        let config = test_config(&[raid]);
        let queue = std::sync::Arc::new(EventQueue::new());
        let comm = Communicator::new(std::sync::Arc::clone(&config), queue);
        let mut c = core("public", &config, &registry());
        c.communicator = Some(std::sync::Arc::clone(&comm));
        (PublicModule::new(c), comm)
    }

    fn queued_ops(comm: &Communicator) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Some(line) = comm.pop_for_test() {
            out.push(serde_json::from_str(&line).unwrap());
        }
        out
    }

    #[test]
    fn mkdir_forces_world_readable_and_traversable() {
        let tmp = tempfile::tempdir().unwrap();
        let (m, comm) = module_with_comm(tmp.path());
        m.mkdir("/sub", 0o700).unwrap();
        let attrs = m.getattr("/sub").unwrap();
        assert_eq!(attrs.mode & 0o777, 0o705);
        let events = queued_ops(&comm);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["op"], "MKDIR");
        assert_eq!(events[0]["path"], "/public/sub");
    }

    #[test]
    fn create_write_release_emits_changed_not_write() {
        let tmp = tempfile::tempdir().unwrap();
        let (m, comm) = module_with_comm(tmp.path());
        let handle = m.create("/file.txt", 0o600).unwrap();
        m.write(handle, 0, b"hi").unwrap();
        m.release("/file.txt", handle).unwrap();

        let events = queued_ops(&comm);
        let ops: Vec<&str> = events.iter().map(|e| e["op"].as_str().unwrap()).collect();
        assert_eq!(ops, vec!["CREATE", "CHANGED"]);
    }

    #[test]
    fn release_without_write_emits_no_changed_event() {
        let tmp = tempfile::tempdir().unwrap();
        let (m, comm) = module_with_comm(tmp.path());
        let handle = m.create("/file.txt", 0o600).unwrap();
        let _ = queued_ops(&comm); // drain CREATE
        let handle2 = m.open("/file.txt", libc::O_RDONLY).unwrap();
        m.release("/file.txt", handle2).unwrap();
        assert!(queued_ops(&comm).is_empty());
        m.release("/file.txt", handle).unwrap();
    }

    #[test]
    fn chmod_keeps_world_read_guarantee() {
        let tmp = tempfile::tempdir().unwrap();
        let (m, _comm) = module_with_comm(tmp.path());
        let handle = m.create("/file.txt", 0o600).unwrap();
        m.release("/file.txt", handle).unwrap();
        m.chmod("/file.txt", 0o600).unwrap();
        let attrs = m.getattr("/file.txt").unwrap();
        assert_eq!(attrs.mode & 0o007, 0o004);
    }

    #[test]
    fn truncate_over_max_that_grows_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (m, _comm) = module_with_comm(tmp.path());
        let handle = m.create("/big", 0o600).unwrap();
        m.release("/big", handle).unwrap();
        let err = m.truncate("/big", 2_000_000).unwrap_err();
        assert_eq!(err, libc::EPERM);
    }

    /// Mirrors end-to-end scenario 5: a rename from `private` into `public`
    /// is dispatched on the *destination* module, so it's `public`'s policy
    /// that fires, naming both sides of the move in one `RENAME` event.
    #[test]
    fn rename_from_private_into_public_fires_on_destination_module() {
        let tmp = tempfile::tempdir().unwrap();
        let raid = tmp.path().join("r1");
        std::fs::create_dir_all(raid.join("private/alice")).unwrap();
        std::fs::create_dir_all(raid.join("public/alice")).unwrap();
        std::fs::write(raid.join("private/alice/x"), b"hi").unwrap();
        std::fs::set_permissions(raid.join("private/alice/x"), std::fs::Permissions::from_mode(0o600)).unwrap();

        let config = test_config(&[raid.clone()]);
        let reg = registry();
        let private = crate::modules::PrivateModule::new(core("private", &config, &reg));

        let queue = std::sync::Arc::new(EventQueue::new());
        let comm = Communicator::new(std::sync::Arc::clone(&config), queue);
        let mut public_core = core("public", &config, &reg);
        public_core.communicator = Some(std::sync::Arc::clone(&comm));
        let public = PublicModule::new(public_core);

        let source_physical = private.translate("/x").unwrap();
        public.rename(&source_physical, "/y", "/private/x", "/public/y").unwrap();

        assert!(!raid.join("private/alice/x").exists());
        assert!(raid.join("public/alice/y").exists());
        let moved_mode = std::fs::metadata(raid.join("public/alice/y")).unwrap().permissions().mode();
        assert_eq!(moved_mode & 0o777, 0o604);

        let events = queued_ops(&comm);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["op"], "RENAME");
        assert_eq!(events[0]["module"], "public");
        assert_eq!(events[0]["path"], "/private/x");
        assert_eq!(events[0]["path2"], "/public/y");
    }
}
