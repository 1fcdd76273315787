//! Frozen, read-mostly key/value config with a small "live" overlay.
//!
//! Command-line overrides win over the file, and a missing required key is
//! fatal at startup: `Config::load` returns a `ConfigError` that `main`
//! turns into a process exit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use parking_lot::RwLock;
use serde::Deserialize;

use crate::errors::ConfigError;

/// The config keys every MammutFS process requires at startup.
pub const REQUIRED_KEYS: &[&str] = &[
    "raids",
    "username",
    "mountpoint",
    "daemonize",
    "truncate_maxsize",
    "anon_user_name",
    "anon_mapping_file",
    "daemon_socket",
    "modules",
    "max_native_fds",
    "loglevel",
];

/// Keys that may be rewritten at runtime via `SETCONFIG`.
pub const LIVE_KEYS: &[&str] = &["loglevel"];

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<String>),
}

impl ConfigValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            ConfigValue::List(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValue::Str(s) => write!(f, "{s}"),
            ConfigValue::Int(n) => write!(f, "{n}"),
            ConfigValue::Bool(b) => write!(f, "{b}"),
            ConfigValue::List(v) => write!(f, "{}", v.join(",")),
        }
    }
}

/// Raw TOML shape of the config file. Individual fields are re-homed into
/// `ConfigValue`s after load so the rest of the crate deals in one currency.
#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    raids: Option<Vec<String>>,
    username: Option<String>,
    mountpoint: Option<String>,
    daemonize: Option<bool>,
    truncate_maxsize: Option<i64>,
    anon_user_name: Option<String>,
    anon_mapping_file: Option<String>,
    daemon_socket: Option<String>,
    modules: Option<Vec<String>>,
    max_native_fds: Option<i64>,
    loglevel: Option<String>,
}

pub type Subscriber = Box<dyn Fn(&ConfigValue) + Send + Sync>;

/// Notified whenever a live key is overwritten via the control socket.
#[derive(Default)]
struct LiveOverlay {
    values: HashMap<String, ConfigValue>,
    subscribers: HashMap<String, Vec<Subscriber>>,
}

pub struct Config {
    base: HashMap<String, ConfigValue>,
    live: RwLock<LiveOverlay>,
}

impl Config {
    /// Loads the config file, applies `overrides` (command-line values win),
    /// and verifies every key in `REQUIRED_KEYS` is present.
    pub fn load(
        file: &Path,
        overrides: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(file) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(ConfigError::Unreadable(file.to_path_buf(), e)),
        };
        let raw: RawConfig = if text.trim().is_empty() {
            RawConfig::default()
        } else {
            toml::from_str(&text).map_err(|e| ConfigError::Malformed(file.to_path_buf(), e))?
        };

        let mut base = HashMap::new();
        insert_opt(&mut base, "raids", raw.raids.map(ConfigValue::List));
        insert_opt(&mut base, "username", raw.username.map(ConfigValue::Str));
        insert_opt(&mut base, "mountpoint", raw.mountpoint.map(ConfigValue::Str));
        insert_opt(&mut base, "daemonize", raw.daemonize.map(ConfigValue::Bool));
        insert_opt(
            &mut base,
            "truncate_maxsize",
            raw.truncate_maxsize.map(ConfigValue::Int),
        );
        insert_opt(
            &mut base,
            "anon_user_name",
            raw.anon_user_name.map(ConfigValue::Str),
        );
        insert_opt(
            &mut base,
            "anon_mapping_file",
            raw.anon_mapping_file.map(ConfigValue::Str),
        );
        insert_opt(
            &mut base,
            "daemon_socket",
            raw.daemon_socket.map(ConfigValue::Str),
        );
        insert_opt(&mut base, "modules", raw.modules.map(ConfigValue::List));
        insert_opt(
            &mut base,
            "max_native_fds",
            raw.max_native_fds.map(ConfigValue::Int),
        );
        insert_opt(&mut base, "loglevel", raw.loglevel.map(ConfigValue::Str));

        // command-line overrides take precedence over the file.
        for (key, value) in overrides {
            base.insert(key.clone(), parse_override(key, value));
        }

        for key in REQUIRED_KEYS {
            if !base.contains_key(*key) {
                return Err(ConfigError::Missing(key));
            }
        }

        Ok(Config {
            base,
            live: RwLock::new(LiveOverlay::default()),
        })
    }

    /// Reads a key, preferring the live overlay over the frozen base.
    pub fn get(&self, key: &str) -> Option<ConfigValue> {
        if let Some(v) = self.live.read().values.get(key) {
            return Some(v.clone());
        }
        self.base.get(key).cloned()
    }

    pub fn raids(&self) -> Vec<PathBuf> {
        self.get("raids")
            .and_then(|v| v.as_list().map(|l| l.iter().map(PathBuf::from).collect()))
            .unwrap_or_default()
    }

    pub fn username(&self) -> String {
        self.get("username")
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default()
    }

    pub fn mountpoint(&self) -> PathBuf {
        self.get("mountpoint")
            .and_then(|v| v.as_str().map(PathBuf::from))
            .unwrap_or_default()
    }

    pub fn daemonize(&self) -> bool {
        self.get("daemonize").and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn truncate_maxsize(&self) -> u64 {
        self.get("truncate_maxsize")
            .and_then(|v| v.as_int())
            .unwrap_or(0) as u64
    }

    pub fn anon_user_name(&self) -> String {
        self.get("anon_user_name")
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default()
    }

    pub fn anon_mapping_file(&self) -> PathBuf {
        self.get("anon_mapping_file")
            .and_then(|v| v.as_str().map(PathBuf::from))
            .unwrap_or_default()
    }

    pub fn daemon_socket(&self) -> PathBuf {
        self.get("daemon_socket")
            .and_then(|v| v.as_str().map(PathBuf::from))
            .unwrap_or_default()
    }

    pub fn modules(&self) -> Vec<String> {
        self.get("modules")
            .and_then(|v| v.as_list().map(|l| l.to_vec()))
            .unwrap_or_default()
    }

    pub fn max_native_fds(&self) -> usize {
        self.get("max_native_fds")
            .and_then(|v| v.as_int())
            .unwrap_or(256) as usize
    }

    pub fn loglevel(&self) -> crate::logging::LogLevel {
        self.get("loglevel")
            .and_then(|v| v.as_str().and_then(|s| crate::logging::LogLevel::from_str(s).ok()))
            .unwrap_or(crate::logging::LogLevel::Info)
    }

    /// Overwrites a live key, publishing the new value and notifying
    /// subscribers. Returns `false` if `key` is not in `LIVE_KEYS`.
    pub fn set_live(&self, key: &str, value: ConfigValue) -> bool {
        if !LIVE_KEYS.contains(&key) {
            return false;
        }
        let mut overlay = self.live.write();
        overlay.values.insert(key.to_string(), value.clone());
        if let Some(subs) = overlay.subscribers.get(key) {
            for sub in subs {
                sub(&value);
            }
        }
        true
    }

    /// Registers a callback invoked whenever `key` is overwritten via
    /// `set_live`. No-op for keys outside `LIVE_KEYS`.
    pub fn subscribe(&self, key: &str, callback: Subscriber) {
        if !LIVE_KEYS.contains(&key) {
            return;
        }
        self.live
            .write()
            .subscribers
            .entry(key.to_string())
            .or_default()
            .push(callback);
    }
}

fn insert_opt(map: &mut HashMap<String, ConfigValue>, key: &str, value: Option<ConfigValue>) {
    if let Some(v) = value {
        map.insert(key.to_string(), v);
    }
}

/// Command-line overrides arrive as plain strings; guess the shape from the
/// key rather than the source text, since every caller already knows the
/// target type for each key.
fn parse_override(key: &str, value: &str) -> ConfigValue {
    match key {
        "raids" | "modules" => {
            ConfigValue::List(value.split(',').map(str::to_owned).collect())
        }
        "daemonize" => ConfigValue::Bool(value == "true" || value == "1"),
        "truncate_maxsize" | "max_native_fds" => value
            .parse::<i64>()
            .map(ConfigValue::Int)
            .unwrap_or_else(|_| ConfigValue::Str(value.to_string())),
        _ => ConfigValue::Str(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_file() -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
raids = ["/r1", "/r2"]
username = "alice"
mountpoint = "/mnt/alice"
daemonize = false
truncate_maxsize = 1073741824
anon_user_name = "anon"
anon_mapping_file = "/etc/mammutfs/anon.map"
daemon_socket = "/run/mammutfs.sock"
modules = ["private", "public"]
max_native_fds = 128
loglevel = "INFO"
"#
        )
        .unwrap();
        f
    }

    #[test]
    fn loads_all_required_keys() {
        let f = sample_file();
        let cfg = Config::load(f.path(), &HashMap::new()).unwrap();
        assert_eq!(cfg.username(), "alice");
        assert_eq!(cfg.raids(), vec![PathBuf::from("/r1"), PathBuf::from("/r2")]);
        assert_eq!(cfg.max_native_fds(), 128);
    }

    #[test]
    fn missing_required_key_is_fatal() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, r#"username = "alice""#).unwrap();
        let err = Config::load(f.path(), &HashMap::new()).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn cmdline_override_wins_over_file() {
        let f = sample_file();
        let mut overrides = HashMap::new();
        overrides.insert("username".to_string(), "bob".to_string());
        let cfg = Config::load(f.path(), &overrides).unwrap();
        assert_eq!(cfg.username(), "bob");
    }

    #[test]
    fn only_live_keys_accept_set_live() {
        let f = sample_file();
        let cfg = Config::load(f.path(), &HashMap::new()).unwrap();
        assert!(cfg.set_live("loglevel", ConfigValue::Str("TRACE".to_string())));
        assert!(!cfg.set_live("username", ConfigValue::Str("mallory".to_string())));
        assert_eq!(cfg.username(), "alice");
    }
}
