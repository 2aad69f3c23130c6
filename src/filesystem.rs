//! The `fuser::Filesystem` implementation: translates kernel callbacks into
//! cache lookups, FTP operations, and handle-table bookkeeping under the
//! locking discipline in the design notes (handles -> ftp -> cache).

use std::ffi::OsStr;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::{EBADF, ENOENT};
use tracing::{debug, warn};

use crate::context::Context;
use crate::errors::CftpfsError;
use crate::ftp_ops::{FtpBackend, SuppaftpBackend};
use crate::handles::OpenIntent;
use crate::inodes::ROOT_INO;
use crate::listing::{parse_line, ItemKind, ListingItem};

const TTL_FLOOR: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct Dispatcher<B: FtpBackend + 'static = SuppaftpBackend> {
    ctx: Arc<Context<B>>,
}

impl<B: FtpBackend + 'static> Dispatcher<B> {
    pub fn new(ctx: Arc<Context<B>>) -> Self {
        Dispatcher { ctx }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.ctx.cache_timeout).max(TTL_FLOOR)
    }

    /// Cache-or-listing procedure shared by `getattr`, `lookup`, `readdir`.
    fn listing_for(&self, dir_path: &str) -> Result<Vec<ListingItem>, CftpfsError> {
        if let Some(items) = self.ctx.cache.lock().unwrap().get(dir_path) {
            return Ok(items);
        }
        let raw = self.ctx.ftp.lock().unwrap().list(dir_path)?;
        let items: Vec<ListingItem> = raw.iter().filter_map(|line| parse_line(line)).collect();
        self.ctx
            .cache
            .lock()
            .unwrap()
            .put(dir_path.to_string(), items.clone());
        Ok(items)
    }

    fn attr_for_path(&self, ino: u64, path: &str) -> Result<FileAttr, CftpfsError> {
        let (parent, name) = split_parent(path);
        let items = self.listing_for(&parent)?;
        items
            .iter()
            .find(|item| item.name == name)
            .map(|item| self.attr_for(ino, item))
            .ok_or(CftpfsError::NotFound)
    }

    fn attr_for(&self, ino: u64, item: &ListingItem) -> FileAttr {
        let kind = to_fuse_kind(item.kind);
        let mtime = UNIX_EPOCH + Duration::from_secs(item.mtime.max(0) as u64);
        FileAttr {
            ino,
            size: item.size,
            blocks: (item.size + 511) / 512,
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm: item.mode as u16,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid: self.ctx.uid,
            gid: self.ctx.gid,
            rdev: 0,
            flags: 0,
            blksize: 512,
        }
    }

    fn root_attr(&self) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino: ROOT_INO,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: self.ctx.uid,
            gid: self.ctx.gid,
            rdev: 0,
            flags: 0,
            blksize: 512,
        }
    }

    fn synthetic_size_attr(&self, ino: u64, size: u64) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino,
            size,
            blocks: (size + 511) / 512,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::RegularFile,
            perm: 0o644,
            nlink: 1,
            uid: self.ctx.uid,
            gid: self.ctx.gid,
            rdev: 0,
            flags: 0,
            blksize: 512,
        }
    }

    /// Shared by `open` (write/create intent) and `create`.
    fn open_for_write(&self, path: String, creat: bool, trunc: bool) -> Result<u64, CftpfsError> {
        let purely_create = creat && !trunc;
        let intent = if purely_create {
            OpenIntent::CreateWrite
        } else if trunc {
            OpenIntent::Truncate
        } else {
            OpenIntent::Write
        };
        let (fh, handle) = {
            let mut table = self.ctx.handles.lock().unwrap();
            table
                .allocate(path.clone(), intent)
                .ok_or(CftpfsError::TooManyHandles)?
        };

        if purely_create {
            std::fs::File::create(&handle.temp_path)?;
            handle.mark_new();
            return Ok(fh);
        }

        match self.ctx.ftp.lock().unwrap().download(&path, &handle.temp_path) {
            Ok(()) => {}
            Err(CftpfsError::NotFound) => {
                std::fs::File::create(&handle.temp_path)?;
            }
            Err(err) => {
                self.ctx.handles.lock().unwrap().release(fh);
                return Err(err);
            }
        }
        if trunc {
            std::fs::File::create(&handle.temp_path)?;
        }
        Ok(fh)
    }

    fn ad_hoc_read(&self, path: &str, offset: i64, size: u32) -> Result<Vec<u8>, CftpfsError> {
        let tmp = self.ctx.staging_dir.join(format!(
            "adhoc_{:?}_{}",
            std::thread::current().id(),
            now_nanos()
        ));
        self.ctx.ftp.lock().unwrap().download(path, &tmp)?;
        let result = read_from_file(&tmp, offset, size);
        let _ = std::fs::remove_file(&tmp);
        result
    }

    fn truncate_remote(&self, path: &str, size: u64) -> Result<(), CftpfsError> {
        let tmp = self.ctx.staging_dir.join(format!(
            "trunc_{:?}_{}",
            std::thread::current().id(),
            now_nanos()
        ));
        match self.ctx.ftp.lock().unwrap().download(path, &tmp) {
            Ok(()) => {}
            Err(CftpfsError::NotFound) => {
                std::fs::File::create(&tmp)?;
            }
            Err(err) => return Err(err),
        }
        truncate_file(&tmp, size)?;
        let result = self.ctx.ftp.lock().unwrap().upload(&tmp, path);
        let _ = std::fs::remove_file(&tmp);
        result
    }

    fn remove_entry(&mut self, parent: u64, name: &OsStr, is_dir: bool, reply: ReplyEmpty) {
        let Some(parent_path) = self.ctx.inodes.lock().unwrap().path_of(parent) else {
            reply.error(ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(ENOENT);
            return;
        };
        let full_path = join_path(&parent_path, name);
        let result = if is_dir {
            self.ctx.ftp.lock().unwrap().rmdir(&full_path)
        } else {
            self.ctx.ftp.lock().unwrap().delete(&full_path)
        };
        match result {
            Ok(()) => {
                self.ctx.cache.lock().unwrap().invalidate(&parent_path);
                self.ctx.inodes.lock().unwrap().forget_path(&full_path);
                reply.ok();
            }
            Err(err) => reply.error(err.errno()),
        }
    }
}

fn to_fuse_kind(kind: ItemKind) -> FileType {
    match kind {
        ItemKind::Directory => FileType::Directory,
        ItemKind::Link => FileType::Symlink,
        ItemKind::File | ItemKind::Unknown => FileType::RegularFile,
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

fn split_parent(path: &str) -> (String, String) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

fn read_from_file(path: &std::path::Path, offset: i64, size: u32) -> Result<Vec<u8>, CftpfsError> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset.max(0) as u64))?;
    let mut buf = vec![0u8; size as usize];
    let n = file.read(&mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

fn write_to_file(path: &std::path::Path, offset: i64, data: &[u8]) -> Result<usize, CftpfsError> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)?;
    file.seek(SeekFrom::Start(offset.max(0) as u64))?;
    file.write_all(data)?;
    Ok(data.len())
}

fn truncate_file(path: &std::path::Path, size: u64) -> Result<(), CftpfsError> {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)?;
    file.set_len(size)?;
    Ok(())
}

impl<B: FtpBackend + 'static> Filesystem for Dispatcher<B> {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut KernelConfig,
    ) -> Result<(), libc::c_int> {
        debug!("cftpfs mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        self.ctx.shutdown();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.ctx.inodes.lock().unwrap().path_of(parent) else {
            reply.error(ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(ENOENT);
            return;
        };
        match self.listing_for(&parent_path) {
            Ok(items) => match items.iter().find(|item| item.name == name) {
                Some(item) => {
                    let full_path = join_path(&parent_path, name);
                    let ino = self
                        .ctx
                        .inodes
                        .lock()
                        .unwrap()
                        .register(full_path, item.kind);
                    let attr = self.attr_for(ino, item);
                    reply.entry(&self.ttl(), &attr, 0);
                }
                None => reply.error(ENOENT),
            },
            Err(err) => reply.error(err.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        if ino == ROOT_INO {
            reply.attr(&self.ttl(), &self.root_attr());
            return;
        }
        let Some(path) = self.ctx.inodes.lock().unwrap().path_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.attr_for_path(ino, &path) {
            Ok(attr) => reply.attr(&self.ttl(), &attr),
            Err(err) => reply.error(err.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if ino == ROOT_INO {
            reply.attr(&self.ttl(), &self.root_attr());
            return;
        }
        let Some(path) = self.ctx.inodes.lock().unwrap().path_of(ino) else {
            reply.error(ENOENT);
            return;
        };

        // chmod/chown/utimens-only calls: FTP has no such semantics, accept
        // and report the file's actual attributes back unchanged.
        let Some(target_size) = size else {
            match self.attr_for_path(ino, &path) {
                Ok(attr) => reply.attr(&self.ttl(), &attr),
                Err(err) => reply.error(err.errno()),
            }
            return;
        };

        if let Some(fh) = fh {
            if let Some(handle) = self.ctx.handles.lock().unwrap().get(fh) {
                let result = handle.with_io_lock(|| truncate_file(&handle.temp_path, target_size));
                match result {
                    Ok(()) => {
                        handle.mark_dirty();
                        reply.attr(&self.ttl(), &self.synthetic_size_attr(ino, target_size));
                    }
                    Err(err) => reply.error(err.errno()),
                }
                return;
            }
        }

        match self.truncate_remote(&path, target_size) {
            Ok(()) => {
                let (parent, _) = split_parent(&path);
                self.ctx.cache.lock().unwrap().invalidate(&parent);
                reply.attr(&self.ttl(), &self.synthetic_size_attr(ino, target_size));
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(dir_path) = self.ctx.inodes.lock().unwrap().path_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        let items = match self.listing_for(&dir_path) {
            Ok(items) => items,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };

        let parent_ino = if dir_path == "/" {
            ROOT_INO
        } else {
            let (parent_path, _) = split_parent(&dir_path);
            self.ctx
                .inodes
                .lock()
                .unwrap()
                .ino_for_path(&parent_path)
                .unwrap_or(ROOT_INO)
        };

        let mut entries: Vec<(u64, FileType, String)> = Vec::with_capacity(items.len() + 2);
        entries.push((ino, FileType::Directory, ".".to_string()));
        entries.push((parent_ino, FileType::Directory, "..".to_string()));
        for item in &items {
            let full_path = join_path(&dir_path, &item.name);
            let child_ino = self
                .ctx
                .inodes
                .lock()
                .unwrap()
                .register(full_path, item.kind);
            entries.push((child_ino, to_fuse_kind(item.kind), item.name.clone()));
        }

        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let is_write = flags & (libc::O_WRONLY | libc::O_RDWR) != 0;
        let creat = flags & libc::O_CREAT != 0;
        let trunc = flags & libc::O_TRUNC != 0;
        if !is_write && !creat && !trunc {
            reply.opened(0, 0);
            return;
        }
        let Some(path) = self.ctx.inodes.lock().unwrap().path_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.open_for_write(path, creat, trunc) {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_path) = self.ctx.inodes.lock().unwrap().path_of(parent) else {
            reply.error(ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(ENOENT);
            return;
        };
        let full_path = join_path(&parent_path, name);
        let trunc = flags & libc::O_TRUNC != 0;
        match self.open_for_write(full_path.clone(), true, trunc) {
            Ok(fh) => {
                let ino = self
                    .ctx
                    .inodes
                    .lock()
                    .unwrap()
                    .register(full_path, ItemKind::File);
                let item = ListingItem {
                    name: name.to_string(),
                    kind: ItemKind::File,
                    size: 0,
                    mtime: now_secs(),
                    mode: mode & 0o777,
                };
                let attr = self.attr_for(ino, &item);
                reply.created(&self.ttl(), &attr, 0, fh, 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.ctx.inodes.lock().unwrap().path_of(parent) else {
            reply.error(ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(ENOENT);
            return;
        };
        let full_path = join_path(&parent_path, name);
        match self.ctx.ftp.lock().unwrap().mkdir(&full_path) {
            Ok(()) => {
                self.ctx.cache.lock().unwrap().invalidate(&parent_path);
                let ino = self
                    .ctx
                    .inodes
                    .lock()
                    .unwrap()
                    .register(full_path, ItemKind::Directory);
                let item = ListingItem {
                    name: name.to_string(),
                    kind: ItemKind::Directory,
                    size: 0,
                    mtime: now_secs(),
                    mode: mode & 0o777,
                };
                let attr = self.attr_for(ino, &item);
                reply.entry(&self.ttl(), &attr, 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_entry(parent, name, false, reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_entry(parent, name, true, reply);
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
        let parent_path = self.ctx.inodes.lock().unwrap().path_of(parent);
        let new_parent_path = self.ctx.inodes.lock().unwrap().path_of(newparent);
        let (Some(parent_path), Some(new_parent_path)) = (parent_path, new_parent_path) else {
            reply.error(ENOENT);
            return;
        };
        let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
            reply.error(ENOENT);
            return;
        };
        let old_path = join_path(&parent_path, name);
        let new_path = join_path(&new_parent_path, newname);
        match self.ctx.ftp.lock().unwrap().rename(&old_path, &new_path) {
            Ok(()) => {
                self.ctx.inodes.lock().unwrap().rename(&old_path, new_path.clone());
                let mut cache = self.ctx.cache.lock().unwrap();
                cache.invalidate(&parent_path);
                if new_parent_path != parent_path {
                    cache.invalidate(&new_parent_path);
                }
                reply.ok();
            }
            Err(err) => reply.error(err.errno()),
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
        if fh != 0 {
            let handle = self.ctx.handles.lock().unwrap().get(fh);
            let Some(handle) = handle else {
                reply.error(EBADF);
                return;
            };
            match handle.with_io_lock(|| read_from_file(&handle.temp_path, offset, size)) {
                Ok(data) => reply.data(&data),
                Err(err) => reply.error(err.errno()),
            }
            return;
        }
        let Some(path) = self.ctx.inodes.lock().unwrap().path_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.ad_hoc_read(&path, offset, size) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(handle) = self.ctx.handles.lock().unwrap().get(fh) else {
            reply.error(EBADF);
            return;
        };
        match handle.with_io_lock(|| write_to_file(&handle.temp_path, offset, data)) {
            Ok(n) => {
                if n > 0 {
                    handle.mark_dirty();
                }
                reply.written(n as u32);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if fh == 0 {
            reply.ok();
            return;
        }
        let Some(handle) = self.ctx.handles.lock().unwrap().release(fh) else {
            reply.ok();
            return;
        };
        if handle.is_dirty() || handle.is_new() {
            match self.ctx.ftp.lock().unwrap().upload(&handle.temp_path, &handle.path) {
                Ok(()) => {
                    let (parent, _) = split_parent(&handle.path);
                    self.ctx.cache.lock().unwrap().invalidate(&parent);
                }
                Err(err) => {
                    warn!(path = %handle.path, %err, "upload on release failed");
                }
            }
        }
        let _ = std::fs::remove_file(&handle.temp_path);
        reply.ok();
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }
}
