//! Startup-time error types.
//!
//! Filesystem-operation errors flow as `fuser::Errno` values (see
//! `module::Module`); these types cover the narrower set of things that can
//! go wrong before the mount even starts, where there is no kernel request to
//! reply to.

use std::fmt;
use std::path::PathBuf;

/// A required config key was absent, or present with the wrong shape.
#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    WrongType(&'static str),
    Unreadable(PathBuf, std::io::Error),
    Malformed(PathBuf, toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "missing required config key `{key}`"),
            ConfigError::WrongType(key) => write!(f, "config key `{key}` has the wrong type"),
            ConfigError::Unreadable(path, err) => {
                write!(f, "could not read config file {}: {err}", path.display())
            }
            ConfigError::Malformed(path, err) => {
                write!(f, "could not parse config file {}: {err}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Top-level startup failure, returned by `main` before any mount attempt.
#[derive(Debug)]
pub enum StartupError {
    Config(ConfigError),
    RunningAsRoot,
    Mount(std::io::Error),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupError::Config(e) => write!(f, "{e}"),
            StartupError::RunningAsRoot => {
                write!(f, "refusing to run as the real or effective superuser")
            }
            StartupError::Mount(e) => write!(f, "mount failed: {e}"),
        }
    }
}

impl std::error::Error for StartupError {}

impl From<ConfigError> for StartupError {
    fn from(e: ConfigError) -> Self {
        StartupError::Config(e)
    }
}
