//! Shared bits for the two single-file modules: reject every directory
//! operation, translate only the module's root (and, for `authkeys`, one
//! legacy alias) to the single backing file.
//!
//! Both the root path and the legacy alias resolve to the same file, which
//! is the only internally consistent reading of "a single editable file at
//! the mount's root".

use std::path::PathBuf;

use crate::errno::{self, OpResult};
use crate::module::{Attrs, ModuleCore, PathKind, Subpath};

pub fn file_translate(core: &ModuleCore, subpath: Subpath<'_>, alias: Option<&str>) -> OpResult<PathBuf> {
    let is_root = subpath == "/";
    let is_alias = alias.map(|a| subpath == format!("/{a}")).unwrap_or(false);
    if !is_root && !is_alias {
        return Err(errno::not_found());
    }
    crate::module::baseline_translate(core, "/")
}

/// `FileModule::getattr`: only the root/alias name resolves; everything
/// else is `not-found` rather than falling through to a filesystem lookup.
pub fn file_getattr(core: &ModuleCore, subpath: Subpath<'_>, alias: Option<&str>) -> OpResult<Attrs> {
    let path = file_translate(core, subpath, alias)?;
    lstat(&path)
}

fn lstat(path: &std::path::Path) -> OpResult<Attrs> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::symlink_metadata(path).map_err(|_| errno::from_errno())?;
    Ok(Attrs {
        kind: if meta.is_dir() { PathKind::Directory } else { PathKind::File },
        size: meta.len(),
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        nlink: meta.nlink() as u32,
        atime: meta.accessed().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        mtime: meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        ctime: std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(meta.ctime().max(0) as u64),
    })
}

/// Ensures the backing file exists, creating an empty one (mode `0600`) if
/// not.
pub fn ensure_exists(core: &ModuleCore) -> OpResult<()> {
    let path = crate::module::baseline_translate(core, "/")?;
    if path.exists() {
        return Ok(());
    }
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .mode(0o600)
        .open(&path)
        .map(|_| ())
        .map_err(|_| errno::from_errno())
}
