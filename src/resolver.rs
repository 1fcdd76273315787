//! Splits an incoming virtual path into `(module, subpath)` and dispatches
//! to it.
//!
//! Strips a leading `/`, reads up to the next `/` as *modname*, uses the
//! remainder (always starting with `/`, or the literal `/` if absent) as
//! *subpath*. An empty *modname* goes to `default` with subpath `/`; a
//! *modname* not in the active set is `not-found`; and when the active set
//! has exactly one non-default module, every path dispatches there
//! unchanged (single-module mount), bypassing segmentation entirely.

use std::collections::HashMap;
use std::sync::Arc;

use crate::errno::{self, OpResult};
use crate::module::Module;
use crate::modules::DefaultModule;

pub struct Resolver {
    default: Arc<DefaultModule>,
    by_name: HashMap<String, Arc<dyn Module>>,
    /// Set when the active set (excluding `default`) has exactly one
    /// member; every path then dispatches to it unchanged.
    single: Option<Arc<dyn Module>>,
}

impl Resolver {
    pub fn new(default: Arc<DefaultModule>, modules: Vec<Arc<dyn Module>>) -> Self {
        let single = if modules.len() == 1 { Some(Arc::clone(&modules[0])) } else { None };
        let mut by_name = HashMap::new();
        for module in modules {
            by_name.insert(module.name().to_string(), module);
        }
        Resolver { default, by_name, single }
    }

    pub fn default_module(&self) -> &Arc<DefaultModule> {
        &self.default
    }

    pub fn modules(&self) -> impl Iterator<Item = &Arc<dyn Module>> {
        self.by_name.values()
    }

    pub fn module_named(&self, name: &str) -> Option<&Arc<dyn Module>> {
        self.by_name.get(name)
    }

    /// Resolves `virtual_path` to the module that should handle it, plus
    /// the module-relative subpath. `virtual_path` must start with `/`.
    pub fn dispatch(&self, virtual_path: &str) -> OpResult<(Arc<dyn Module>, String)> {
        if let Some(module) = &self.single {
            return Ok((Arc::clone(module), virtual_path.to_string()));
        }

        if virtual_path == "/" {
            return Ok((self.default.clone() as Arc<dyn Module>, "/".to_string()));
        }

        let rest = virtual_path.strip_prefix('/').unwrap_or(virtual_path);
        let (modname, remainder) = match rest.split_once('/') {
            Some((name, tail)) => (name, format!("/{tail}")),
            None => (rest, "/".to_string()),
        };

        if modname.is_empty() {
            return Ok((self.default.clone() as Arc<dyn Module>, "/".to_string()));
        }

        match self.by_name.get(modname) {
            Some(module) => Ok((Arc::clone(module), remainder)),
            None => Err(errno::not_found()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::module::{Attrs, ModuleCore, PathKind, Subpath};
    use crate::registry::OpenFileRegistry;
    use std::sync::Arc;
    use std::time::SystemTime;

    struct Stub(ModuleCore);

    impl Module for Stub {
        fn core(&self) -> &ModuleCore {
            &self.0
        }

        fn getattr(&self, _subpath: Subpath<'_>) -> OpResult<Attrs> {
            Ok(Attrs {
                kind: PathKind::Directory,
                size: 0,
                mode: 0o755,
                uid: 0,
                gid: 0,
                nlink: 1,
                atime: SystemTime::UNIX_EPOCH,
                mtime: SystemTime::UNIX_EPOCH,
                ctime: SystemTime::UNIX_EPOCH,
            })
        }
    }

    fn test_config() -> Arc<Config> {
        let mut overrides = HashMap::new();
        overrides.insert("raids".to_string(), "/tmp".to_string());
        overrides.insert("username".to_string(), "alice".to_string());
        overrides.insert("mountpoint".to_string(), "/mnt".to_string());
        overrides.insert("daemonize".to_string(), "false".to_string());
        overrides.insert("truncate_maxsize".to_string(), "0".to_string());
        overrides.insert("anon_user_name".to_string(), "nobody".to_string());
        overrides.insert("anon_mapping_file".to_string(), "/tmp/anon".to_string());
        overrides.insert("daemon_socket".to_string(), "/tmp/sock".to_string());
        overrides.insert("modules".to_string(), "public,private".to_string());
        overrides.insert("max_native_fds".to_string(), "16".to_string());
        overrides.insert("loglevel".to_string(), "info".to_string());
        Arc::new(Config::load(std::path::Path::new("/nonexistent"), &overrides).unwrap())
    }

    fn make_resolver(names: &[&str]) -> Resolver {
        let config = test_config();
        let registry = Arc::new(OpenFileRegistry::new(16));
        let default = Arc::new(DefaultModule::new(
            ModuleCore::new("default", Arc::clone(&config), Arc::clone(&registry), None),
            names.iter().map(|s| s.to_string()).collect(),
        ));
        let modules: Vec<Arc<dyn Module>> = names
            .iter()
            .map(|name| {
                Arc::new(Stub(ModuleCore::new(*name, Arc::clone(&config), Arc::clone(&registry), None)))
                    as Arc<dyn Module>
            })
            .collect();
        Resolver::new(default, modules)
    }

    #[test]
    fn root_goes_to_default() {
        let resolver = make_resolver(&["public", "private"]);
        let (module, subpath) = resolver.dispatch("/").unwrap();
        assert_eq!(module.name(), "default");
        assert_eq!(subpath, "/");
    }

    #[test]
    fn segments_modname_and_subpath() {
        let resolver = make_resolver(&["public", "private"]);
        let (module, subpath) = resolver.dispatch("/public/foo/bar").unwrap();
        assert_eq!(module.name(), "public");
        assert_eq!(subpath, "/foo/bar");
    }

    #[test]
    fn unknown_modname_is_not_found() {
        let resolver = make_resolver(&["public", "private"]);
        assert!(resolver.dispatch("/nope/foo").is_err());
    }

    #[test]
    fn single_module_mount_bypasses_segmentation() {
        let resolver = make_resolver(&["public"]);
        let (module, subpath) = resolver.dispatch("/anything/foo").unwrap();
        assert_eq!(module.name(), "public");
        assert_eq!(subpath, "/anything/foo");
    }
}
