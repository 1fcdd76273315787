//! Shared publication policy used by `public` and `anonym`: forcing `o+rX`
//! on created entries, rewriting `chmod` to keep that guarantee, and
//! emitting one event per successful mutation. Kept as free functions
//! rather than a shared base type, so each variant composes this policy
//! atop its own pass-through baseline instead of inheriting it.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::errno::OpResult;
use crate::module::{
    baseline_chmod, baseline_create, baseline_mkdir, baseline_rename, baseline_truncate, baseline_unlink,
    Module, PathKind, Subpath,
};

/// `o+rX`: every entry gets world-read; world-execute is added for
/// directories unconditionally, and for files only when the owner or group
/// already has an execute bit (the classic `chmod =X` semantics).
pub fn force_public_mode(mode: u32, kind: PathKind) -> u32 {
    let mut m = mode | 0o004;
    if kind == PathKind::Directory || mode & 0o110 != 0 {
        m |= 0o001;
    }
    m
}

pub fn publish_mkdir(m: &(impl Module + ?Sized), module_name: &str, subpath: Subpath<'_>, mode: u32) -> OpResult<()> {
    let forced = force_public_mode(mode, PathKind::Directory);
    baseline_mkdir(m, subpath, forced)?;
    emit(m, module_name, "MKDIR", subpath, None);
    Ok(())
}

pub fn publish_create(
    m: &(impl Module + ?Sized),
    module_name: &str,
    subpath: Subpath<'_>,
    mode: u32,
) -> OpResult<u64> {
    let forced = force_public_mode(mode, PathKind::File);
    let handle = baseline_create(m, subpath, forced)?;
    emit(m, module_name, "CREATE", subpath, None);
    Ok(handle)
}

pub fn publish_unlink(m: &(impl Module + ?Sized), module_name: &str, subpath: Subpath<'_>) -> OpResult<()> {
    baseline_unlink(m, subpath)?;
    emit(m, module_name, "UNLINK", subpath, None);
    Ok(())
}

pub fn publish_rmdir(m: &(impl Module + ?Sized), module_name: &str, subpath: Subpath<'_>) -> OpResult<()> {
    crate::module::baseline_rmdir(m, subpath)?;
    emit(m, module_name, "RMDIR", subpath, None);
    Ok(())
}

/// Dispatched on the destination module (see `Module::rename`): emits the
/// full virtual paths on both sides, since the acting module's own
/// subpath no longer identifies the source side once it may live under a
/// different module entirely.
///
/// A move into `public`/`anonym` must carry the same `o+rX` guarantee as a
/// fresh `mkdir`/`create` there, so the moved tree is walked and rewritten
/// after the rename succeeds (scenario 5 in spec.md: a file moved in from
/// another module doesn't pass through `publish_mkdir`/`publish_create`,
/// which is the only other place that mode gets forced).
pub fn publish_rename(
    m: &(impl Module + ?Sized),
    source_physical: &std::path::Path,
    dest_subpath: Subpath<'_>,
    virtual_from: &str,
    virtual_to: &str,
) -> OpResult<()> {
    baseline_rename(m, source_physical, dest_subpath)?;
    if let Ok(dest_physical) = m.translate(dest_subpath) {
        force_public_mode_tree(&dest_physical);
    }
    m.core().emit("RENAME", virtual_from, Some(virtual_to));
    Ok(())
}

/// Rewrites `path`'s mode via `force_public_mode`, recursing into
/// directories. Best-effort: a permission error partway through a large
/// tree doesn't unwind the rename that already succeeded.
fn force_public_mode_tree(path: &Path) {
    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return;
    };
    let kind = if meta.is_dir() { PathKind::Directory } else { PathKind::File };
    let forced = force_public_mode(meta.permissions().mode(), kind);
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(forced));

    if kind == PathKind::Directory {
        let Ok(entries) = std::fs::read_dir(path) else {
            return;
        };
        for entry in entries.flatten() {
            force_public_mode_tree(&entry.path());
        }
    }
}

pub fn publish_truncate(m: &(impl Module + ?Sized), module_name: &str, subpath: Subpath<'_>, size: u64) -> OpResult<()> {
    baseline_truncate(m, subpath, size)?;
    emit(m, module_name, "TRUNCATE", subpath, None);
    Ok(())
}

pub fn publish_chmod(m: &(impl Module + ?Sized), subpath: Subpath<'_>, mode: u32) -> OpResult<()> {
    let is_dir = matches!(
        crate::module::baseline_getattr(m, subpath).map(|a| a.kind),
        Ok(PathKind::Directory)
    );
    let forced = force_public_mode(mode, if is_dir { PathKind::Directory } else { PathKind::File });
    baseline_chmod(m, subpath, forced)
}

/// `release`: emit `CHANGED` only if the handle recorded at least one
/// successful write, consistent with `registry::OpenFileRegistry`'s
/// `changed` bit.
pub fn publish_release(
    m: &(impl Module + ?Sized),
    module_name: &str,
    subpath: Subpath<'_>,
    handle: u64,
) -> OpResult<()> {
    let changed = m.core().registry.was_changed(handle);
    crate::module::baseline_release(m, handle)?;
    if changed {
        emit(m, module_name, "CHANGED", subpath, None);
    }
    Ok(())
}

fn emit(m: &(impl Module + ?Sized), module_name: &str, op: &str, subpath: Subpath<'_>, dest: Option<Subpath<'_>>) {
    let path = event_path(module_name, subpath);
    let path2 = dest.map(|d| event_path(module_name, d));
    m.core().emit(op, &path, path2.as_deref());
}

pub fn event_path(module_name: &str, subpath: &str) -> String {
    format!("/{module_name}{subpath}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directories_always_get_world_execute() {
        assert_eq!(force_public_mode(0o700, PathKind::Directory), 0o705);
        assert_eq!(force_public_mode(0o600, PathKind::Directory), 0o605);
    }

    #[test]
    fn files_only_get_world_execute_when_already_executable() {
        assert_eq!(force_public_mode(0o600, PathKind::File), 0o604);
        assert_eq!(force_public_mode(0o750, PathKind::File), 0o755);
        assert_eq!(force_public_mode(0o640, PathKind::File), 0o644);
    }

    #[test]
    fn event_path_prefixes_module_name() {
        assert_eq!(event_path("public", "/foo/bar"), "/public/foo/bar");
    }
}
