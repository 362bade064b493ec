//! The shadow filesystem: a passthrough over a tree's cache root that
//! consults the fetch daemon on metadata lookups.
//!
//! Every operation rewrites its path from the mount to the cache root and
//! delegates to the OS, so absent paths look absent and present paths
//! carry their real content and metadata. The only twist is `getattr`,
//! which gives the daemon a chance to hydrate the cache before the answer
//! is read; debuggers always stat before they open, so that one hook is
//! enough to make the whole tree appear on demand.

pub mod trigger;

use std::{
    ffi::{CString, OsStr},
    fs,
    io::{self, ErrorKind},
    os::unix::{
        ffi::{OsStrExt as _, OsStringExt as _},
        fs::{DirBuilderExt as _, FileExt as _, FileTypeExt as _, MetadataExt as _,
            OpenOptionsExt as _, PermissionsExt as _},
    },
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use color_eyre::{Result, eyre::Context as _};
use filetime::FileTime;
use fuse_mt::{
    CallbackResult, DirectoryEntry, FileAttr, FileType, FilesystemMT, FuseMT, RequestInfo,
    ResultData, ResultEmpty, ResultEntry, ResultOpen, ResultReaddir, ResultSlice, ResultStatfs,
    ResultWrite, ResultXattr, Statfs, Xattr,
};
use tracing::info;

use crate::{config::DebugTree, shadow::trigger::Trigger};

/// How long the kernel may cache an attribute answer.
const TTL: Duration = Duration::from_secs(1);

/// Passthrough filesystem for one debug tree.
pub struct ShadowFs {
    tree: DebugTree,
    trigger: Trigger,
}

impl ShadowFs {
    pub fn new(tree: DebugTree) -> Self {
        let trigger = Trigger::new(tree.prefix);
        Self { tree, trigger }
    }

    /// Rewrite `/p` under the mount to the real path inside the cache
    /// root. Request paths are always absolute, so the join cannot step
    /// outside the root.
    fn real(&self, path: &Path) -> PathBuf {
        match path.strip_prefix("/") {
            Ok(relative) => self.tree.cache_root.join(relative),
            Err(_) => self.tree.cache_root.join(path),
        }
    }
}

/// Mount the tree and serve until unmounted.
///
/// The option set matches the deployment the debuggers expect: any user
/// may look (the debugger is rarely root), the kernel enforces
/// permissions, and a non-empty mountpoint is tolerated.
pub fn mount(tree: DebugTree, threads: usize) -> Result<()> {
    let mountpoint = tree.mountpoint.clone();
    info!(?mountpoint, cache_root = ?tree.cache_root, "mounting shadow filesystem");
    let options = [
        "-o", "nonempty",
        "-o", "allow_other",
        "-o", "default_permissions",
    ]
    .map(OsStr::new);
    fuse_mt::mount(FuseMT::new(ShadowFs::new(tree), threads), &mountpoint, &options)
        .with_context(|| format!("serve mount {mountpoint:?}"))
}

impl FilesystemMT for ShadowFs {
    fn getattr(&self, req: RequestInfo, path: &Path, _fh: Option<u64>) -> ResultEntry {
        let real = self.real(path);

        // The first look only supplies the mtime hint: zero means "not
        // cached, fetch synchronously", anything else is an asynchronous
        // refresh. The answer comes from the stat after the daemon has
        // had its chance.
        let mtime = fs::symlink_metadata(&real)
            .map(|meta| meta.mtime().max(0) as u64)
            .unwrap_or(0);
        self.trigger
            .try_to_get(&path.to_string_lossy(), req.pid, mtime);

        stat_entry(&real)
    }

    fn chmod(&self, _req: RequestInfo, path: &Path, _fh: Option<u64>, mode: u32) -> ResultEmpty {
        let real = self.real(path);
        fs::set_permissions(&real, fs::Permissions::from_mode(mode)).map_err(|e| errno(&e))
    }

    fn chown(
        &self,
        _req: RequestInfo,
        path: &Path,
        _fh: Option<u64>,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> ResultEmpty {
        let real = self.real(path);
        // The no-follow variant: a chown on a symlink addresses the link.
        std::os::unix::fs::lchown(&real, uid, gid).map_err(|e| errno(&e))
    }

    fn truncate(&self, _req: RequestInfo, path: &Path, _fh: Option<u64>, size: u64) -> ResultEmpty {
        let real = self.real(path);
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&real)
            .map_err(|e| errno(&e))?;
        file.set_len(size).map_err(|e| errno(&e))
    }

    fn utimens(
        &self,
        _req: RequestInfo,
        path: &Path,
        _fh: Option<u64>,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> ResultEmpty {
        let real = self.real(path);
        // Whichever side the caller omitted keeps its current value; the
        // no-follow variant leaves symlink targets alone.
        let meta = fs::symlink_metadata(&real).map_err(|e| errno(&e))?;
        let atime = atime
            .map(FileTime::from_system_time)
            .unwrap_or_else(|| FileTime::from_last_access_time(&meta));
        let mtime = mtime
            .map(FileTime::from_system_time)
            .unwrap_or_else(|| FileTime::from_last_modification_time(&meta));
        filetime::set_symlink_file_times(&real, atime, mtime).map_err(|e| errno(&e))
    }

    fn readlink(&self, _req: RequestInfo, path: &Path) -> ResultData {
        let real = self.real(path);
        fs::read_link(&real)
            .map(|target| target.into_os_string().into_vec())
            .map_err(|e| errno(&e))
    }

    fn mknod(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> ResultEntry {
        let real = self.real(&parent.join(name));
        match mode & libc::S_IFMT {
            0 | libc::S_IFREG => {
                fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(mode & 0o7777)
                    .open(&real)
                    .map_err(|e| errno(&e))?;
            }
            libc::S_IFIFO => {
                let real = c_path(&real)?;
                if unsafe { libc::mkfifo(real.as_ptr(), mode) } != 0 {
                    return Err(last_errno());
                }
            }
            _ => {
                let real = c_path(&real)?;
                if unsafe { libc::mknod(real.as_ptr(), mode, rdev as libc::dev_t) } != 0 {
                    return Err(last_errno());
                }
            }
        }
        stat_entry(&real)
    }

    fn mkdir(&self, _req: RequestInfo, parent: &Path, name: &OsStr, mode: u32) -> ResultEntry {
        let real = self.real(&parent.join(name));
        fs::DirBuilder::new()
            .mode(mode)
            .create(&real)
            .map_err(|e| errno(&e))?;
        stat_entry(&real)
    }

    fn unlink(&self, _req: RequestInfo, parent: &Path, name: &OsStr) -> ResultEmpty {
        let real = self.real(&parent.join(name));
        fs::remove_file(&real).map_err(|e| errno(&e))
    }

    fn rmdir(&self, _req: RequestInfo, parent: &Path, name: &OsStr) -> ResultEmpty {
        let real = self.real(&parent.join(name));
        fs::remove_dir(&real).map_err(|e| errno(&e))
    }

    fn symlink(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        target: &Path,
    ) -> ResultEntry {
        let real = self.real(&parent.join(name));
        std::os::unix::fs::symlink(target, &real).map_err(|e| errno(&e))?;
        stat_entry(&real)
    }

    fn rename(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        newparent: &Path,
        newname: &OsStr,
    ) -> ResultEmpty {
        let from = self.real(&parent.join(name));
        let to = self.real(&newparent.join(newname));
        fs::rename(&from, &to).map_err(|e| errno(&e))
    }

    fn link(
        &self,
        _req: RequestInfo,
        path: &Path,
        newparent: &Path,
        newname: &OsStr,
    ) -> ResultEntry {
        let original = self.real(path);
        let link = self.real(&newparent.join(newname));
        fs::hard_link(&original, &link).map_err(|e| errno(&e))?;
        stat_entry(&link)
    }

    fn open(&self, _req: RequestInfo, path: &Path, flags: u32) -> ResultOpen {
        let real = self.real(path);
        // Stateless passthrough: validate that the open is possible, hand
        // back no handle, and reopen per read/write.
        open_with_flags(&real, flags).map(|_| (0, 0)).map_err(|e| errno(&e))
    }

    fn read(
        &self,
        _req: RequestInfo,
        path: &Path,
        _fh: u64,
        offset: u64,
        size: u32,
        callback: impl FnOnce(ResultSlice<'_>) -> CallbackResult,
    ) -> CallbackResult {
        let real = self.real(path);
        match read_range(&real, offset, size) {
            Ok(buf) => callback(Ok(&buf)),
            Err(code) => callback(Err(code)),
        }
    }

    fn write(
        &self,
        _req: RequestInfo,
        path: &Path,
        _fh: u64,
        offset: u64,
        data: Vec<u8>,
        _flags: u32,
    ) -> ResultWrite {
        let real = self.real(path);
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&real)
            .map_err(|e| errno(&e))?;
        file.write_all_at(&data, offset).map_err(|e| errno(&e))?;
        Ok(data.len() as u32)
    }

    fn release(
        &self,
        _req: RequestInfo,
        _path: &Path,
        _fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> ResultEmpty {
        Ok(())
    }

    fn fsync(&self, _req: RequestInfo, _path: &Path, _fh: u64, _datasync: bool) -> ResultEmpty {
        Ok(())
    }

    fn opendir(&self, _req: RequestInfo, path: &Path, _flags: u32) -> ResultOpen {
        let real = self.real(path);
        let meta = fs::metadata(&real).map_err(|e| errno(&e))?;
        if meta.is_dir() { Ok((0, 0)) } else { Err(libc::ENOTDIR) }
    }

    fn readdir(&self, _req: RequestInfo, path: &Path, _fh: u64) -> ResultReaddir {
        let real = self.real(path);
        let mut entries = Vec::new();
        for entry in fs::read_dir(&real).map_err(|e| errno(&e))? {
            let entry = entry.map_err(|e| errno(&e))?;
            // Synthesized entries carry only the type bits; real
            // attributes arrive via getattr.
            let kind = entry
                .file_type()
                .map(file_type)
                .unwrap_or(FileType::RegularFile);
            entries.push(DirectoryEntry {
                name: entry.file_name(),
                kind,
            });
        }
        Ok(entries)
    }

    fn releasedir(&self, _req: RequestInfo, _path: &Path, _fh: u64, _flags: u32) -> ResultEmpty {
        Ok(())
    }

    fn fsyncdir(&self, _req: RequestInfo, _path: &Path, _fh: u64, _datasync: bool) -> ResultEmpty {
        Ok(())
    }

    fn statfs(&self, _req: RequestInfo, path: &Path) -> ResultStatfs {
        let real = c_path(&self.real(path))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(real.as_ptr(), &mut stat) } != 0 {
            return Err(last_errno());
        }
        Ok(Statfs {
            blocks: stat.f_blocks as u64,
            bfree: stat.f_bfree as u64,
            bavail: stat.f_bavail as u64,
            files: stat.f_files as u64,
            ffree: stat.f_ffree as u64,
            bsize: stat.f_bsize as u32,
            namelen: stat.f_namemax as u32,
            frsize: stat.f_frsize as u32,
        })
    }

    fn setxattr(
        &self,
        _req: RequestInfo,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: u32,
        _position: u32,
    ) -> ResultEmpty {
        let real = c_path(&self.real(path))?;
        let name = c_name(name)?;
        let rc = unsafe {
            libc::lsetxattr(
                real.as_ptr(),
                name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                flags as libc::c_int,
            )
        };
        if rc == 0 { Ok(()) } else { Err(last_errno()) }
    }

    fn getxattr(&self, _req: RequestInfo, path: &Path, name: &OsStr, size: u32) -> ResultXattr {
        let real = c_path(&self.real(path))?;
        let name = c_name(name)?;
        if size == 0 {
            let len =
                unsafe { libc::lgetxattr(real.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0) };
            if len < 0 {
                return Err(last_errno());
            }
            Ok(Xattr::Size(len as u32))
        } else {
            let mut buf = vec![0u8; size as usize];
            let len = unsafe {
                libc::lgetxattr(real.as_ptr(), name.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
            };
            if len < 0 {
                return Err(last_errno());
            }
            buf.truncate(len as usize);
            Ok(Xattr::Data(buf))
        }
    }

    fn listxattr(&self, _req: RequestInfo, path: &Path, size: u32) -> ResultXattr {
        let real = c_path(&self.real(path))?;
        if size == 0 {
            let len = unsafe { libc::llistxattr(real.as_ptr(), std::ptr::null_mut(), 0) };
            if len < 0 {
                return Err(last_errno());
            }
            Ok(Xattr::Size(len as u32))
        } else {
            let mut buf = vec![0u8; size as usize];
            let len =
                unsafe { libc::llistxattr(real.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
            if len < 0 {
                return Err(last_errno());
            }
            buf.truncate(len as usize);
            Ok(Xattr::Data(buf))
        }
    }

    fn removexattr(&self, _req: RequestInfo, path: &Path, name: &OsStr) -> ResultEmpty {
        let real = c_path(&self.real(path))?;
        let name = c_name(name)?;
        if unsafe { libc::lremovexattr(real.as_ptr(), name.as_ptr()) } == 0 {
            Ok(())
        } else {
            Err(last_errno())
        }
    }

    fn access(&self, _req: RequestInfo, path: &Path, mask: u32) -> ResultEmpty {
        let real = c_path(&self.real(path))?;
        if unsafe { libc::access(real.as_ptr(), mask as libc::c_int) } == 0 {
            Ok(())
        } else {
            Err(last_errno())
        }
    }
}

/// Read up to `size` bytes at `offset`, stopping early only at EOF.
fn read_range(real: &Path, offset: u64, size: u32) -> Result<Vec<u8>, libc::c_int> {
    let file = fs::File::open(real).map_err(|e| errno(&e))?;
    let mut buf = vec![0u8; size as usize];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(error) if error.kind() == ErrorKind::Interrupted => continue,
            Err(error) => return Err(errno(&error)),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

fn stat_entry(real: &Path) -> ResultEntry {
    fs::symlink_metadata(real)
        .map(|meta| (TTL, attr(&meta)))
        .map_err(|e| errno(&e))
}

fn open_with_flags(real: &Path, flags: u32) -> io::Result<fs::File> {
    let flags = flags as libc::c_int;
    let mut options = fs::OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => options.write(true),
        libc::O_RDWR => options.read(true).write(true),
        _ => options.read(true),
    };
    options.custom_flags(flags & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL));
    options.open(real)
}

fn attr(meta: &fs::Metadata) -> FileAttr {
    FileAttr {
        size: meta.len(),
        blocks: meta.blocks(),
        atime: system_time(meta.atime(), meta.atime_nsec()),
        mtime: system_time(meta.mtime(), meta.mtime_nsec()),
        ctime: system_time(meta.ctime(), meta.ctime_nsec()),
        crtime: UNIX_EPOCH,
        kind: file_type(meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        flags: 0,
    }
}

fn file_type(ft: fs::FileType) -> FileType {
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else {
        FileType::RegularFile
    }
}

fn system_time(secs: i64, nanos: i64) -> SystemTime {
    let nanos = nanos.clamp(0, 999_999_999) as u32;
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn errno(error: &io::Error) -> libc::c_int {
    error.raw_os_error().unwrap_or(libc::EIO)
}

fn last_errno() -> libc::c_int {
    errno(&io::Error::last_os_error())
}

fn c_path(path: &Path) -> Result<CString, libc::c_int> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| libc::EINVAL)
}

fn c_name(name: &OsStr) -> Result<CString, libc::c_int> {
    CString::new(name.as_bytes()).map_err(|_| libc::EINVAL)
}
