//! The `Module` contract and its pass-through baseline.
//!
//! One method per filesystem operation, with a concrete default body for
//! almost all of them: a single `trait Module` whose default method bodies
//! call free `baseline_*` functions, so a variant that overrides e.g.
//! `mkdir` can still call `baseline_mkdir` itself to get the pass-through
//! behaviour plus its own policy on top, without a C++-style
//! `Module::mkdir(...)` base-class call.

use std::fs::OpenOptions;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::communicator::Communicator;
use crate::config::Config;
use crate::errno::{self, OpResult};
use crate::events::EventMessage;
use crate::raid::RaidLocator;
use crate::registry::{FileKind, Handle, OpenFileRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    File,
    Directory,
}

/// A filesystem-agnostic stat result; `fs.rs` converts this to
/// `fuser::FileAttr` at the kernel-glue boundary.
#[derive(Debug, Clone)]
pub struct Attrs {
    pub kind: PathKind,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: PathKind,
}

#[derive(Debug, Clone, Copy)]
pub struct StatfsInfo {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// State shared by every `Module` variant: its name, the config, its own
/// `RaidLocator`, a share of the process-wide open-file registry, and an
/// optional link to the communicator (`default`/`private`/`backup` never
/// emit events and may omit it).
pub struct ModuleCore {
    pub name: String,
    pub config: Arc<Config>,
    pub raid: RaidLocator,
    pub registry: Arc<OpenFileRegistry>,
    pub communicator: Option<Arc<Communicator>>,
}

impl ModuleCore {
    pub fn new(
        name: impl Into<String>,
        config: Arc<Config>,
        registry: Arc<OpenFileRegistry>,
        communicator: Option<Arc<Communicator>>,
    ) -> Self {
        let name = name.into();
        ModuleCore {
            raid: RaidLocator::new(name.clone()),
            name,
            config,
            registry,
            communicator,
        }
    }

    pub fn emit(&self, op: &str, path: &str, path2: Option<&str>) {
        if let Some(comm) = &self.communicator {
            comm.send_event(EventMessage::publication(op, &self.name, path, path2));
        }
    }
}

/// A virtual path, module-relative, always starting with `/` (the module
/// segment has already been peeled off by the resolver).
pub type Subpath<'a> = &'a str;

#[allow(clippy::too_many_arguments)]
pub trait Module: Send + Sync {
    fn core(&self) -> &ModuleCore;

    fn name(&self) -> &str {
        &self.core().name
    }

    /// Every module except `default` and `lister` shows up in the mount
    /// root.
    fn visible_in_root(&self) -> bool {
        true
    }

    fn translate(&self, subpath: Subpath<'_>) -> OpResult<PathBuf> {
        baseline_translate(self.core(), subpath)
    }

    fn getattr(&self, subpath: Subpath<'_>) -> OpResult<Attrs> {
        baseline_getattr(self, subpath)
    }

    fn readlink(&self, _subpath: Subpath<'_>) -> OpResult<PathBuf> {
        Err(errno::not_supported())
    }

    fn mknod(&self, _subpath: Subpath<'_>, _mode: u32, _rdev: u32) -> OpResult<()> {
        Err(errno::not_supported())
    }

    fn mkdir(&self, subpath: Subpath<'_>, mode: u32) -> OpResult<()> {
        baseline_mkdir(self, subpath, mode)
    }

    fn unlink(&self, subpath: Subpath<'_>) -> OpResult<()> {
        baseline_unlink(self, subpath)
    }

    fn rmdir(&self, subpath: Subpath<'_>) -> OpResult<()> {
        baseline_rmdir(self, subpath)
    }

    fn symlink(&self, _name: Subpath<'_>, _target: &str) -> OpResult<()> {
        Err(errno::not_supported())
    }

    fn link(&self, _subpath: Subpath<'_>, _newpath: Subpath<'_>) -> OpResult<()> {
        Err(errno::not_supported())
    }

    /// Dispatched on the *destination* module, matching the original's
    /// `GETMODULE(newpath)` dispatch: `source_physical` is the source
    /// path as already translated by the source module (the resolver
    /// translates it before calling in), and `dest_subpath` is this
    /// module's own subpath to translate. `virtual_from`/`virtual_to` are
    /// the full mount-rooted paths on each side, carried through only for
    /// event naming (a move from `private` into `public` must emit the
    /// event from `public`'s policy, naming both sides).
    fn rename(
        &self,
        source_physical: &Path,
        dest_subpath: Subpath<'_>,
        virtual_from: &str,
        virtual_to: &str,
    ) -> OpResult<()> {
        let _ = (virtual_from, virtual_to);
        baseline_rename(self, source_physical, dest_subpath)
    }

    fn chmod(&self, subpath: Subpath<'_>, mode: u32) -> OpResult<()> {
        baseline_chmod(self, subpath, mode)
    }

    fn chown(&self, _subpath: Subpath<'_>, _uid: u32, _gid: u32) -> OpResult<()> {
        Err(errno::not_permitted())
    }

    fn truncate(&self, subpath: Subpath<'_>, size: u64) -> OpResult<()> {
        baseline_truncate(self, subpath, size)
    }

    fn open(&self, subpath: Subpath<'_>, flags: i32) -> OpResult<u64> {
        baseline_open(self, subpath, flags)
    }

    fn create(&self, subpath: Subpath<'_>, mode: u32) -> OpResult<u64> {
        baseline_create(self, subpath, mode)
    }

    fn read(&self, handle: u64, offset: i64, size: u32) -> OpResult<Vec<u8>> {
        baseline_read(self, handle, offset, size)
    }

    fn write(&self, handle: u64, offset: i64, data: &[u8]) -> OpResult<u32> {
        baseline_write(self, handle, offset, data)
    }

    fn flush(&self, _handle: u64) -> OpResult<()> {
        Ok(())
    }

    /// `subpath` is the virtual path the kernel-glue layer resolved the
    /// handle from originally (classic FUSE `release` only carries the
    /// handle; the inode table reconstructs the path for callers that, like
    /// `public`/`anonym`, need it to name the `CHANGED` event).
    fn release(&self, subpath: Subpath<'_>, handle: u64) -> OpResult<()> {
        let _ = subpath;
        baseline_release(self, handle)
    }

    fn fsync(&self, handle: u64, _datasync: bool) -> OpResult<()> {
        baseline_fsync(self, handle)
    }

    fn setxattr(&self, _subpath: Subpath<'_>, _name: &str, _value: &[u8]) -> OpResult<()> {
        Err(errno::not_supported())
    }

    fn getxattr(&self, _subpath: Subpath<'_>, _name: &str) -> OpResult<Vec<u8>> {
        Err(errno::not_supported())
    }

    fn listxattr(&self, _subpath: Subpath<'_>) -> OpResult<Vec<String>> {
        Err(errno::not_supported())
    }

    fn removexattr(&self, _subpath: Subpath<'_>, _name: &str) -> OpResult<()> {
        Err(errno::not_supported())
    }

    fn opendir(&self, subpath: Subpath<'_>) -> OpResult<u64> {
        baseline_opendir(self, subpath)
    }

    fn readdir(&self, handle: u64) -> OpResult<Vec<DirEntry>> {
        baseline_readdir(self, handle)
    }

    fn releasedir(&self, handle: u64) -> OpResult<()> {
        baseline_release(self, handle)
    }

    fn fsyncdir(&self, _handle: u64, _datasync: bool) -> OpResult<()> {
        Ok(())
    }

    fn access(&self, subpath: Subpath<'_>, mask: i32) -> OpResult<()> {
        baseline_access(self, subpath, mask)
    }

    fn statfs(&self, subpath: Subpath<'_>) -> OpResult<StatfsInfo> {
        baseline_statfs(self, subpath)
    }

    fn utimens(&self, subpath: Subpath<'_>, atime: SystemTime, mtime: SystemTime) -> OpResult<()> {
        baseline_utimens(self, subpath, atime, mtime)
    }
}

// ---------------------------------------------------------------------
// Baseline (pass-through) bodies.
// ---------------------------------------------------------------------

/// `<raid>/<modname>/<user><subpath>`.
pub fn baseline_translate(core: &ModuleCore, subpath: Subpath<'_>) -> OpResult<PathBuf> {
    let raid_root = core.raid.locate(&core.config.raids(), &core.config.username())?;
    let rel = subpath.strip_prefix('/').unwrap_or(subpath);
    Ok(if rel.is_empty() { raid_root } else { raid_root.join(rel) })
}

fn lstat_attrs(path: &Path) -> OpResult<Attrs> {
    let meta = std::fs::symlink_metadata(path).map_err(|_| errno::from_errno())?;
    Ok(Attrs {
        kind: if meta.is_dir() { PathKind::Directory } else { PathKind::File },
        size: meta.len(),
        mode: meta.permissions().mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        nlink: meta.nlink() as u32,
        atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
        mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        ctime: SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(meta.ctime().max(0) as u64),
    })
}

pub fn baseline_getattr(m: &(impl Module + ?Sized), subpath: Subpath<'_>) -> OpResult<Attrs> {
    let path = m.translate(subpath)?;
    lstat_attrs(&path)
}

pub fn baseline_mkdir(m: &(impl Module + ?Sized), subpath: Subpath<'_>, mode: u32) -> OpResult<()> {
    let path = m.translate(subpath)?;
    std::fs::create_dir(&path).map_err(|_| errno::from_errno())?;
    let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode));
    Ok(())
}

pub fn baseline_unlink(m: &(impl Module + ?Sized), subpath: Subpath<'_>) -> OpResult<()> {
    let path = m.translate(subpath)?;
    std::fs::remove_file(&path).map_err(|_| errno::from_errno())
}

pub fn baseline_rmdir(m: &(impl Module + ?Sized), subpath: Subpath<'_>) -> OpResult<()> {
    let path = m.translate(subpath)?;
    std::fs::remove_dir(&path).map_err(|_| errno::from_errno())
}

/// Translates only the destination; `source_physical` arrives already
/// translated by the source module (`fs.rs` does that translation before
/// dispatching `rename` to the destination module, since the source and
/// destination may be in different modules).
pub fn baseline_rename(
    m: &(impl Module + ?Sized),
    source_physical: &Path,
    dest_subpath: Subpath<'_>,
) -> OpResult<()> {
    let to = m.translate(dest_subpath)?;
    std::fs::rename(source_physical, &to).map_err(|_| errno::from_errno())
}

pub fn baseline_chmod(m: &(impl Module + ?Sized), subpath: Subpath<'_>, mode: u32) -> OpResult<()> {
    let path = m.translate(subpath)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(|_| errno::from_errno())
}

/// Refuse to grow past `truncate_maxsize`; shrinking is always allowed.
pub fn baseline_truncate(m: &(impl Module + ?Sized), subpath: Subpath<'_>, size: u64) -> OpResult<()> {
    let path = m.translate(subpath)?;
    let max = m.core().config.truncate_maxsize();
    if size > max {
        let current = std::fs::metadata(&path).map_err(|_| errno::from_errno())?.len();
        if current < size {
            return Err(errno::not_permitted());
        }
    }
    let file = OpenOptions::new().write(true).open(&path).map_err(|_| errno::from_errno())?;
    file.set_len(size).map_err(|_| errno::from_errno())
}

/// Forces `O_NOFOLLOW`, records an entry with `changed=false`.
pub fn baseline_open(m: &(impl Module + ?Sized), subpath: Subpath<'_>, flags: i32) -> OpResult<u64> {
    let path = m.translate(subpath)?;
    let file = OpenOptions::new()
        .read(true)
        .write(flags & (libc::O_WRONLY | libc::O_RDWR) != 0)
        .custom_flags(libc::O_NOFOLLOW)
        .open(&path)
        .map_err(|_| errno::from_errno())?;
    m.core()
        .registry
        .insert(path, FileKind::File, flags, Handle::File(file), false)
}

/// Records an entry with `changed=true` straight away: creating a file
/// always counts as a write, whether or not any bytes follow.
pub fn baseline_create(m: &(impl Module + ?Sized), subpath: Subpath<'_>, mode: u32) -> OpResult<u64> {
    let path = m.translate(subpath)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .custom_flags(libc::O_NOFOLLOW)
        .open(&path)
        .map_err(|_| errno::from_errno())?;
    m.core()
        .registry
        .insert(path, FileKind::File, libc::O_RDWR, Handle::File(file), true)
}

pub fn baseline_read(m: &(impl Module + ?Sized), handle: u64, offset: i64, size: u32) -> OpResult<Vec<u8>> {
    m.core()
        .registry
        .with_handle(handle, |h| match h {
            Handle::File(f) => {
                let mut buf = vec![0u8; size as usize];
                let n = f.read_at(&mut buf, offset as u64).map_err(|_| errno::from_errno())?;
                buf.truncate(n);
                Ok(buf)
            }
            Handle::Directory(_) => Err(errno::invalid_argument()),
        })
        .unwrap_or(Err(errno::not_found()))
}

pub fn baseline_write(m: &(impl Module + ?Sized), handle: u64, offset: i64, data: &[u8]) -> OpResult<u32> {
    let result = m
        .core()
        .registry
        .with_handle(handle, |h| match h {
            Handle::File(f) => f.write_at(data, offset as u64).map_err(|_| errno::from_errno()),
            Handle::Directory(_) => Err(errno::invalid_argument()),
        })
        .unwrap_or(Err(errno::not_found()))?;
    if result > 0 {
        m.core().registry.mark_changed(handle);
    }
    Ok(result as u32)
}

pub fn baseline_release(m: &(impl Module + ?Sized), handle: u64) -> OpResult<()> {
    m.core().registry.remove(handle);
    Ok(())
}

pub fn baseline_fsync(m: &(impl Module + ?Sized), handle: u64) -> OpResult<()> {
    m.core()
        .registry
        .with_handle(handle, |h| match h {
            Handle::File(f) => f.sync_all().map_err(|_| errno::from_errno()),
            Handle::Directory(_) => Ok(()),
        })
        .unwrap_or(Ok(()))
}

pub fn baseline_opendir(m: &(impl Module + ?Sized), subpath: Subpath<'_>) -> OpResult<u64> {
    let path = m.translate(subpath)?;
    let entries = std::fs::read_dir(&path)
        .map_err(|_| errno::from_errno())?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .collect();
    m.core()
        .registry
        .insert(path, FileKind::Directory, 0, Handle::Directory(entries), false)
}

pub fn baseline_readdir(m: &(impl Module + ?Sized), handle: u64) -> OpResult<Vec<DirEntry>> {
    let path = m
        .core()
        .registry
        .path_of(handle)
        .ok_or_else(errno::not_found)?;
    m.core()
        .registry
        .with_handle(handle, |h| match h {
            Handle::Directory(names) => {
                let mut out = vec![
                    DirEntry { name: ".".to_string(), kind: PathKind::Directory },
                    DirEntry { name: "..".to_string(), kind: PathKind::Directory },
                ];
                for name in names {
                    let kind = if path.join(name).is_dir() { PathKind::Directory } else { PathKind::File };
                    out.push(DirEntry { name: name.to_string_lossy().into_owned(), kind });
                }
                Ok(out)
            }
            Handle::File(_) => Err(errno::invalid_argument()),
        })
        .unwrap_or(Err(errno::not_found()))
}

pub fn baseline_access(m: &(impl Module + ?Sized), subpath: Subpath<'_>, mask: i32) -> OpResult<()> {
    let path = m.translate(subpath)?;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).map_err(|_| errno::invalid_argument())?;
    let rc = unsafe { libc::access(c_path.as_ptr(), mask) };
    if rc == 0 {
        Ok(())
    } else {
        Err(errno::from_errno())
    }
}

pub fn baseline_statfs(m: &(impl Module + ?Sized), subpath: Subpath<'_>) -> OpResult<StatfsInfo> {
    let path = m.translate(subpath)?;
    statvfs(&path)
}

/// Used by modules (e.g. `default`) whose root has no raid-backed path to
/// translate but still needs to answer `statfs` against some real mount.
pub fn baseline_statfs_at(path: &Path) -> OpResult<StatfsInfo> {
    statvfs(path)
}

pub fn baseline_utimens(
    m: &(impl Module + ?Sized),
    subpath: Subpath<'_>,
    atime: SystemTime,
    mtime: SystemTime,
) -> OpResult<()> {
    use nix::sys::stat::{utimensat, UtimensatFlags};
    use nix::sys::time::TimeSpec;

    let path = m.translate(subpath)?;
    let to_timespec = |t: SystemTime| -> TimeSpec {
        let dur = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        TimeSpec::new(dur.as_secs() as i64, dur.subsec_nanos() as i64)
    };
    utimensat(
        None,
        &path,
        &to_timespec(atime),
        &to_timespec(mtime),
        UtimensatFlags::NoFollowSymlink,
    )
    .map_err(|_| errno::from_errno())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::OpenFileRegistry;
    use std::collections::HashMap;

    struct PassThrough(ModuleCore);

    impl Module for PassThrough {
        fn core(&self) -> &ModuleCore {
            &self.0
        }
    }

    /// `raid_root` is the raid directory itself (i.e. the parent of
    /// `<raid_root>/private/alice`).
    fn test_module(raid_root: &Path) -> PassThrough {
        let mut overrides = HashMap::new();
        overrides.insert("raids".to_string(), raid_root.to_string_lossy().into_owned());
        overrides.insert("username".to_string(), "alice".to_string());
        overrides.insert("mountpoint".to_string(), "/mnt/alice".to_string());
        overrides.insert("daemonize".to_string(), "false".to_string());
        overrides.insert("truncate_maxsize".to_string(), "100".to_string());
        overrides.insert("anon_user_name".to_string(), "anon".to_string());
        overrides.insert("anon_mapping_file".to_string(), "/tmp/nonexistent.map".to_string());
        overrides.insert("daemon_socket".to_string(), "/tmp/nonexistent.sock".to_string());
        overrides.insert("modules".to_string(), "private".to_string());
        overrides.insert("max_native_fds".to_string(), "8".to_string());
        overrides.insert("loglevel".to_string(), "INFO".to_string());
        let config = Arc::new(Config::load(Path::new("/nonexistent"), &overrides).unwrap());
        let registry = Arc::new(OpenFileRegistry::new(8));
        PassThrough(ModuleCore::new("private", config, registry, None))
    }

    #[test]
    fn translate_joins_raid_modname_user_and_subpath() {
        let tmp = tempfile::tempdir().unwrap();
        let raid_slot = tmp.path().join("private/alice");
        std::fs::create_dir_all(&raid_slot).unwrap();
        let m = test_module(tmp.path());

        assert_eq!(m.translate("/").unwrap(), raid_slot);
        assert_eq!(m.translate("/sub/file.txt").unwrap(), raid_slot.join("sub/file.txt"));
    }

    #[test]
    fn truncate_rejects_only_when_growing_past_the_ceiling() {
        let tmp = tempfile::tempdir().unwrap();
        let raid_slot = tmp.path().join("private/alice");
        std::fs::create_dir_all(&raid_slot).unwrap();
        let m = test_module(tmp.path());

        // truncate_maxsize is 100; start the file at 200 bytes.
        let handle = m.create("/big", 0o600).unwrap();
        m.write(handle, 0, &vec![0u8; 200]).unwrap();
        m.release("/big", handle).unwrap();

        // shrinking to a target above the ceiling is still fine, since the
        // file isn't growing.
        m.truncate("/big", 150).unwrap();
        // growing back past the ceiling is refused.
        assert_eq!(m.truncate("/big", 300).unwrap_err(), libc::EPERM);
    }

    #[test]
    fn create_marks_changed_immediately_write_marks_it_on_success() {
        let tmp = tempfile::tempdir().unwrap();
        let raid_slot = tmp.path().join("private/alice");
        std::fs::create_dir_all(&raid_slot).unwrap();
        let m = test_module(tmp.path());

        let created = m.create("/a", 0o600).unwrap();
        assert!(m.core().registry.was_changed(created));
        m.release("/a", created).unwrap();

        let opened = m.open("/a", libc::O_RDWR).unwrap();
        assert!(!m.core().registry.was_changed(opened));
        m.write(opened, 0, b"x").unwrap();
        assert!(m.core().registry.was_changed(opened));
        m.release("/a", opened).unwrap();
    }

    #[test]
    fn readdir_always_starts_with_dot_and_dotdot() {
        let tmp = tempfile::tempdir().unwrap();
        let raid_slot = tmp.path().join("private/alice");
        std::fs::create_dir_all(raid_slot.join("child")).unwrap();
        let m = test_module(tmp.path());

        let handle = m.opendir("/").unwrap();
        let entries = m.readdir(handle).unwrap();
        assert_eq!(entries[0].name, ".");
        assert_eq!(entries[1].name, "..");
        assert!(entries.iter().any(|e| e.name == "child" && e.kind == PathKind::Directory));
    }

    #[test]
    fn symlink_and_xattr_family_are_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let raid_slot = tmp.path().join("private/alice");
        std::fs::create_dir_all(&raid_slot).unwrap();
        let m = test_module(tmp.path());

        assert_eq!(m.readlink("/x").unwrap_err(), libc::ENOTSUP);
        assert_eq!(m.mknod("/x", 0o600, 0).unwrap_err(), libc::ENOTSUP);
        assert_eq!(m.link("/x", "/y").unwrap_err(), libc::ENOTSUP);
        assert_eq!(m.setxattr("/x", "user.a", b"v").unwrap_err(), libc::ENOTSUP);
        assert_eq!(m.getxattr("/x", "user.a").unwrap_err(), libc::ENOTSUP);
        assert_eq!(m.listxattr("/x").unwrap_err(), libc::ENOTSUP);
        assert_eq!(m.removexattr("/x", "user.a").unwrap_err(), libc::ENOTSUP);
        assert_eq!(m.chown("/x", 1, 1).unwrap_err(), libc::EPERM);
    }
}

/// Thin wrapper over `libc::statvfs`. `nix::sys::statvfs` would also serve;
/// calling `libc` directly keeps this crate from depending on a
/// feature-gated nix module it uses nowhere else.
fn statvfs(path: &Path) -> OpResult<StatfsInfo> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).map_err(|_| errno::invalid_argument())?;
    let mut buf: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut buf) };
    if rc != 0 {
        return Err(errno::from_errno());
    }
    Ok(StatfsInfo {
        blocks: buf.f_blocks as u64,
        bfree: buf.f_bfree as u64,
        bavail: buf.f_bavail as u64,
        files: buf.f_files as u64,
        ffree: buf.f_ffree as u64,
        bsize: buf.f_bsize as u32,
        namelen: buf.f_namemax as u32,
        frsize: buf.f_frsize as u32,
    })
}
