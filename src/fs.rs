//! The `fuser::Filesystem` implementation: the kernel-facing glue.
//!
//! Every callback follows the same shape: resolve the inode(s) the kernel
//! gave us back to virtual path(s) via `InodeTable`, hand the path to
//! `Resolver::dispatch` to get a `(Module, subpath)` pair, call the one
//! `Module` method that does the real work, and translate its
//! `Result<T, i32>` into the matching `Reply*` call.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};

use crate::errno;
use crate::inode::InodeTable;
use crate::module::{Attrs, Module, PathKind};
use crate::resolver::Resolver;

/// Attribute cache TTL handed back on every `entry`/`attr` reply. The
/// original has no equivalent notion (it answers every `getattr` fresh);
/// one second keeps the kernel from hammering `lstat` on hot paths without
/// making `SETCONFIG`/external writers' changes invisible for long.
const TTL: Duration = Duration::from_secs(1);

pub struct MammutFs {
    resolver: Arc<Resolver>,
    inodes: InodeTable,
}

impl MammutFs {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        MammutFs { resolver, inodes: InodeTable::new() }
    }

    fn path_of(&self, ino: u64) -> Result<String, i32> {
        self.inodes.path_of(ino).ok_or_else(errno::not_found)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, i32> {
        let parent_path = self.path_of(parent)?;
        let name = name.to_str().ok_or_else(errno::invalid_argument)?;
        Ok(InodeTable::child_path(&parent_path, name))
    }

    fn parent_of(path: &str) -> String {
        if path == "/" {
            return "/".to_string();
        }
        match path.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(idx) => path[..idx].to_string(),
        }
    }

    fn to_file_attr(ino: u64, attrs: &Attrs) -> FileAttr {
        let blocks = attrs.size.div_ceil(512);
        FileAttr {
            ino,
            size: attrs.size,
            blocks,
            atime: attrs.atime,
            mtime: attrs.mtime,
            ctime: attrs.ctime,
            crtime: attrs.ctime,
            kind: match attrs.kind {
                PathKind::File => FileType::RegularFile,
                PathKind::Directory => FileType::Directory,
            },
            perm: (attrs.mode & 0o7777) as u16,
            nlink: attrs.nlink,
            uid: attrs.uid,
            gid: attrs.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }
}

impl Filesystem for MammutFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), i32> {
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        match module.getattr(&subpath) {
            Ok(attrs) => {
                let ino = self.inodes.lookup(&path);
                reply.entry(&TTL, &Self::to_file_attr(ino, &attrs), 0);
            }
            Err(e) => reply.error(e),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        match module.getattr(&subpath) {
            Ok(attrs) => reply.attr(&TTL, &Self::to_file_attr(ino, &attrs)),
            Err(e) => reply.error(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };

        if let Some(mode) = mode {
            if let Err(e) = module.chmod(&subpath, mode) {
                return reply.error(e);
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(e) = module.chown(&subpath, uid.unwrap_or(0), gid.unwrap_or(0)) {
                return reply.error(e);
            }
        }
        if let Some(size) = size {
            if let Err(e) = module.truncate(&subpath, size) {
                return reply.error(e);
            }
        }
        if atime.is_some() || mtime.is_some() {
            let current = match module.getattr(&subpath) {
                Ok(a) => a,
                Err(e) => return reply.error(e),
            };
            let resolve = |t: Option<TimeOrNow>, fallback: std::time::SystemTime| match t {
                Some(TimeOrNow::SpecificTime(t)) => t,
                Some(TimeOrNow::Now) => std::time::SystemTime::now(),
                None => fallback,
            };
            let atime = resolve(atime, current.atime);
            let mtime = resolve(mtime, current.mtime);
            if let Err(e) = module.utimens(&subpath, atime, mtime) {
                return reply.error(e);
            }
        }

        match module.getattr(&subpath) {
            Ok(attrs) => reply.attr(&TTL, &Self::to_file_attr(ino, &attrs)),
            Err(e) => reply.error(e),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        match module.readlink(&subpath) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(e),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        if let Err(e) = module.mknod(&subpath, mode & !umask, rdev) {
            return reply.error(e);
        }
        match module.getattr(&subpath) {
            Ok(attrs) => {
                let ino = self.inodes.lookup(&path);
                reply.entry(&TTL, &Self::to_file_attr(ino, &attrs), 0);
            }
            Err(e) => reply.error(e),
        }
    }

    fn mkdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, umask: u32, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        if let Err(e) = module.mkdir(&subpath, mode & !umask) {
            return reply.error(e);
        }
        match module.getattr(&subpath) {
            Ok(attrs) => {
                let ino = self.inodes.lookup(&path);
                reply.entry(&TTL, &Self::to_file_attr(ino, &attrs), 0);
            }
            Err(e) => reply.error(e),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        match module.unlink(&subpath) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        match module.rmdir(&subpath) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, link_name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        let target = match target.to_str() {
            Some(t) => t,
            None => return reply.error(errno::invalid_argument()),
        };
        if let Err(e) = module.symlink(&subpath, target) {
            return reply.error(e);
        }
        match module.getattr(&subpath) {
            Ok(attrs) => {
                let ino = self.inodes.lookup(&path);
                reply.entry(&TTL, &Self::to_file_attr(ino, &attrs), 0);
            }
            Err(e) => reply.error(e),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let source_path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (source_module, source_subpath) = match self.resolver.dispatch(&source_path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        let dest_path = match self.child_path(newparent, newname) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (dest_module, dest_subpath) = match self.resolver.dispatch(&dest_path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        if let Err(e) = source_module.link(&source_subpath, &dest_subpath) {
            return reply.error(e);
        }
        match dest_module.getattr(&dest_subpath) {
            Ok(attrs) => {
                let ino = self.inodes.lookup(&dest_path);
                reply.entry(&TTL, &Self::to_file_attr(ino, &attrs), 0);
            }
            Err(e) => reply.error(e),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let from = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let to = match self.child_path(newparent, newname) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (source_module, source_subpath) = match self.resolver.dispatch(&from) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        let (dest_module, dest_subpath) = match self.resolver.dispatch(&to) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        // Mirrors the original's `GETMODULE(newpath)` dispatch: the
        // destination module's policy decides (and, for `public`/`anonym`,
        // emits the event), after the source module resolves its own
        // physical path.
        let source_physical = match source_module.translate(&source_subpath) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match dest_module.rename(&source_physical, &dest_subpath, &from, &to) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(e),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        match module.open(&subpath, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        let fh = match module.create(&subpath, mode & !umask) {
            Ok(fh) => fh,
            Err(e) => return reply.error(e),
        };
        match module.getattr(&subpath) {
            Ok(attrs) => {
                let ino = self.inodes.lookup(&path);
                reply.created(&TTL, &Self::to_file_attr(ino, &attrs), 0, fh, 0);
            }
            Err(e) => reply.error(e),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, _subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        match module.read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, _subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        match module.write(fh, offset, data) {
            Ok(n) => reply.written(n),
            Err(e) => reply.error(e),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, _subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        match module.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        match module.release(&subpath, fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, _subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        match module.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        match module.opendir(&subpath) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, _subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        let entries = match module.readdir(fh) {
            Ok(e) => e,
            Err(e) => return reply.error(e),
        };
        let parent_path = Self::parent_of(&path);
        for (i, entry) in entries.into_iter().enumerate().skip(offset as usize) {
            let entry_ino = match entry.name.as_str() {
                "." => ino,
                ".." => self.inodes.lookup(&parent_path),
                name => self.inodes.lookup(&InodeTable::child_path(&path, name)),
            };
            let kind = match entry.kind {
                PathKind::File => FileType::RegularFile,
                PathKind::Directory => FileType::Directory,
            };
            if reply.add(entry_ino, (i + 1) as i64, kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, _subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        match module.releasedir(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, _subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        match module.fsyncdir(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        match module.access(&subpath, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let path = self.path_of(ino).unwrap_or_else(|_| "/".to_string());
        let (module, subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        match module.statfs(&subpath) {
            Ok(s) => reply.statfs(s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize),
            Err(e) => reply.error(e),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        let name = match name.to_str() {
            Some(n) => n,
            None => return reply.error(errno::invalid_argument()),
        };
        match module.setxattr(&subpath, name, value) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        let name = match name.to_str() {
            Some(n) => n,
            None => return reply.error(errno::invalid_argument()),
        };
        match module.getxattr(&subpath, name) {
            Ok(data) if size == 0 => reply.size(data.len() as u32),
            Ok(data) if data.len() as u32 > size => reply.error(libc::ERANGE),
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        match module.listxattr(&subpath) {
            Ok(names) => {
                let mut joined = Vec::new();
                for name in names {
                    joined.extend_from_slice(name.as_bytes());
                    joined.push(0);
                }
                if size == 0 {
                    reply.size(joined.len() as u32)
                } else if joined.len() as u32 > size {
                    reply.error(libc::ERANGE)
                } else {
                    reply.data(&joined)
                }
            }
            Err(e) => reply.error(e),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let (module, subpath) = match self.resolver.dispatch(&path) {
            Ok(v) => v,
            Err(e) => return reply.error(e),
        };
        let name = match name.to_str() {
            Some(n) => n,
            None => return reply.error(errno::invalid_argument()),
        };
        match module.removexattr(&subpath, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }
}
