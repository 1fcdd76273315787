//! Concrete `Module` variants, one file per variant.

pub mod all_backup_tree;
pub mod anonym;
pub mod authkeys;
pub mod backup;
pub mod control;
pub mod default;
pub mod filemodule;
pub mod lister;
pub mod policy;
pub mod private;
pub mod public;

pub use all_backup_tree::AllBackupTreeModule;
pub use anonym::AnonymModule;
pub use authkeys::AuthkeysModule;
pub use backup::BackupModule;
pub use control::ControlModule;
pub use default::DefaultModule;
pub use lister::ListerModule;
pub use private::PrivateModule;
pub use public::PublicModule;

/// Shared scaffolding for the variant unit tests in this module: a config
/// pointed at a temporary raid tree, and a `ModuleCore` builder. Kept in one
/// place so each `modules/*.rs` test module isn't re-deriving the same
/// `Config::load` override map.
#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use crate::config::Config;
    use crate::module::ModuleCore;
    use crate::registry::OpenFileRegistry;

    /// A `Config` with `raids` pointed at `raids` and everything else a
    /// harmless default; `username` is always `"alice"`.
    pub fn test_config(raids: &[PathBuf]) -> Arc<Config> {
        let mut overrides = HashMap::new();
        let raids_str = raids
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(",");
        overrides.insert("raids".to_string(), raids_str);
        overrides.insert("username".to_string(), "alice".to_string());
        overrides.insert("mountpoint".to_string(), "/mnt/alice".to_string());
        overrides.insert("daemonize".to_string(), "false".to_string());
        overrides.insert("truncate_maxsize".to_string(), "1048576".to_string());
        overrides.insert("anon_user_name".to_string(), "anon".to_string());
        overrides.insert("anon_mapping_file".to_string(), "/tmp/nonexistent.map".to_string());
        overrides.insert("daemon_socket".to_string(), "/tmp/nonexistent.sock".to_string());
        overrides.insert("modules".to_string(), "private,public".to_string());
        overrides.insert("max_native_fds".to_string(), "64".to_string());
        overrides.insert("loglevel".to_string(), "INFO".to_string());
        Arc::new(Config::load(Path::new("/nonexistent"), &overrides).unwrap())
    }

    pub fn registry() -> Arc<OpenFileRegistry> {
        Arc::new(OpenFileRegistry::new(64))
    }

    pub fn core(name: &str, config: &Arc<Config>, registry: &Arc<OpenFileRegistry>) -> ModuleCore {
        ModuleCore::new(name, Arc::clone(config), Arc::clone(registry), None)
    }

    /// Builds `<raid>/<modname>/alice` and returns the raid root, so
    /// `RaidLocator::locate` succeeds on the first call.
    pub fn make_raid(tmp: &Path, modname: &str) -> PathBuf {
        let raid = tmp.join("r1");
        std::fs::create_dir_all(raid.join(modname).join("alice")).unwrap();
        raid
    }
}
