//! Process entry point: parses the command line, loads config, wires up
//! identity/logging/the communicator, builds the active module set, and
//! hands control to `fuser`. Registers modules in a fixed order, filters
//! the active set from configuration, and hands control to the filesystem
//! glue.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use fuser::MountOption;

use mammutfs::anon::AnonMap;
use mammutfs::communicator::Communicator;
use mammutfs::config::Config;
use mammutfs::errors::StartupError;
use mammutfs::events::EventQueue;
use mammutfs::fs::MammutFs;
use mammutfs::identity;
use mammutfs::logging::MammutLogger;
use mammutfs::module::{Module, ModuleCore};
use mammutfs::modules::{
    AllBackupTreeModule, AnonymModule, AuthkeysModule, BackupModule, ControlModule, DefaultModule,
    ListerModule, PrivateModule, PublicModule,
};
use mammutfs::registry::OpenFileRegistry;
use mammutfs::resolver::Resolver;

/// The registration order every deployment sees, independent of how
/// `modules` in the config file happens to list them.
const FIXED_MODULE_ORDER: &[&str] = &[
    "private",
    "public",
    "anonym",
    "backup",
    "lister",
    "all-backup-tree",
    "authkeys",
    "control",
];

#[derive(Parser, Debug)]
#[command(name = "mammutfs", version, about = "Userspace filesystem federating per-user storage volumes")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "/etc/mammutfs.toml")]
    config: PathBuf,

    /// Overrides a config key for this run, `key=value`; may be repeated.
    #[arg(short = 'o', long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

fn parse_overrides(raw: &[String]) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for entry in raw {
        if let Some((key, value)) = entry.split_once('=') {
            out.insert(key.to_string(), value.to_string());
        }
    }
    out
}

fn build_module(
    name: &str,
    config: &Arc<Config>,
    registry: &Arc<OpenFileRegistry>,
    communicator: &Arc<Communicator>,
    anon_map: &Arc<AnonMap>,
    identity: identity::Identity,
) -> Arc<dyn Module> {
    let core = |name: &str, with_comm: bool| {
        ModuleCore::new(
            name.to_string(),
            Arc::clone(config),
            Arc::clone(registry),
            if with_comm { Some(Arc::clone(communicator)) } else { None },
        )
    };
    match name {
        "private" => Arc::new(PrivateModule::new(core(name, false))),
        "public" => Arc::new(PublicModule::new(core(name, true))),
        "anonym" => Arc::new(AnonymModule::new(core(name, true), identity)),
        "backup" => Arc::new(BackupModule::new(core(name, false))),
        "lister" => Arc::new(ListerModule::new(core(name, true), Arc::clone(anon_map), identity)),
        "all-backup-tree" => AllBackupTreeModule::new(core(name, true)),
        "authkeys" => Arc::new(AuthkeysModule::new(core(name, false))),
        "control" => Arc::new(ControlModule::new(core(name, true))),
        other => unreachable!("unrecognised module name `{other}` in FIXED_MODULE_ORDER"),
    }
}

fn run() -> Result<(), StartupError> {
    let args = Args::parse();
    let overrides = parse_overrides(&args.overrides);
    let config = Arc::new(Config::load(&args.config, &overrides)?);

    MammutLogger::install(Arc::clone(&config));

    if nix::unistd::Uid::effective().is_root() || nix::unistd::Uid::current().is_root() {
        return Err(StartupError::RunningAsRoot);
    }

    let identity = identity::resolve(&config.anon_user_name());
    let registry = Arc::new(OpenFileRegistry::new(config.max_native_fds()));
    let anon_map = Arc::new(AnonMap::new(config.anon_mapping_file()));

    let queue = Arc::new(EventQueue::new());
    let communicator = Communicator::new(Arc::clone(&config), queue);
    {
        let comm = Arc::clone(&communicator);
        std::thread::spawn(move || comm.run());
    }

    let active: Vec<String> = config.modules();
    let mut modules: Vec<Arc<dyn Module>> = Vec::new();
    for name in FIXED_MODULE_ORDER {
        if active.iter().any(|m| m == name) {
            modules.push(build_module(name, &config, &registry, &communicator, &anon_map, identity));
        }
    }

    for module in &modules {
        let target = Arc::clone(module);
        communicator.register_command(
            &format!("{}_raid", target.name()),
            "the located raid for this module",
            move |_| match target.core().raid.cached() {
                Some(path) => Ok(serde_json::json!({ "raid": path.to_string_lossy() }).to_string()),
                None => Err("module has no located raid yet".to_string()),
            },
        );
    }

    let visible: Vec<String> = modules
        .iter()
        .filter(|m| m.visible_in_root())
        .map(|m| m.name().to_string())
        .collect();
    let default_core = ModuleCore::new("default", Arc::clone(&config), Arc::clone(&registry), None);
    let default = Arc::new(DefaultModule::new(default_core, visible));

    let resolver = Arc::new(Resolver::new(default, modules));
    let filesystem = MammutFs::new(resolver);

    let mountpoint = config.mountpoint();
    let options = vec![
        MountOption::FSName("mammutfs".to_string()),
        MountOption::Subtype("fuse.mammutfs".to_string()),
        MountOption::CUSTOM("nonempty".to_string()),
        MountOption::DefaultPermissions,
        MountOption::AllowOther,
        MountOption::CUSTOM("use_ino".to_string()),
        MountOption::CUSTOM("big_writes".to_string()),
    ];

    log::info!("mounting mammutfs at {}", mountpoint.display());
    if config.daemonize() {
        // Background mode: the session loop runs on its own thread via
        // `spawn_mount2`/`BackgroundSession`, and this thread just blocks on
        // it joining so the process stays alive until unmount.
        let session = fuser::spawn_mount2(filesystem, &mountpoint, &options).map_err(StartupError::Mount)?;
        session.join();
    } else {
        fuser::mount2(filesystem, &mountpoint, &options).map_err(StartupError::Mount)?;
    }

    communicator.stop();
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mammutfs: {e}");
            ExitCode::FAILURE
        }
    }
}
