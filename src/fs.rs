//! Filesystem adapter behind the 9P device.
//!
//! The 9P server speaks to the host filesystem only through [`FsAdapter`];
//! the simulator may supply its own implementation (an archive, a synthetic
//! tree, a network share). [`HostDir`] is the stock passthrough adapter
//! exporting a host directory.
//!
//! Errors cross this boundary as raw POSIX errno values: that is what the
//! 9P2000.L `Rlerror` reply carries, so nothing is gained by wrapping them.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use log::debug;

// The errno values this crate surfaces itself. Adapter implementations
// pass through whatever the host OS reports.
pub const EIO: u32 = 5;
pub const EBADF: u32 = 9;
pub const EACCES: u32 = 13;
pub const EINVAL: u32 = 22;
pub const EPROTO: u32 = 71;
pub const ENOTSUP: u32 = 95;

pub type FsResult<T> = Result<T, u32>;

// QID type bits (9P2000.L).
pub const QID_TYPE_DIR: u8 = 0x80;
pub const QID_TYPE_SYMLINK: u8 = 0x02;
pub const QID_TYPE_FILE: u8 = 0x00;

/// The 9P identity of a filesystem object: 13 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Qid {
    pub ty: u8,
    pub version: u32,
    pub path: u64,
}

/// Attributes for `Rgetattr`, one-to-one with the Linux 9P stat packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
    pub qid: Qid,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime_sec: u64,
    pub atime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
    pub ctime_sec: u64,
    pub ctime_nsec: u64,
}

/// Filesystem-wide numbers for `Rstatfs`.
#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub ftype: u32,
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub fsid: u64,
    pub namelen: u32,
}

// Tsetattr valid-mask bits.
pub const SETATTR_MODE: u32 = 0x001;
pub const SETATTR_UID: u32 = 0x002;
pub const SETATTR_GID: u32 = 0x004;
pub const SETATTR_SIZE: u32 = 0x008;

/// Decoded `Tsetattr` payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    pub valid: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime_sec: u64,
    pub atime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
}

/// One directory entry for `Rreaddir`. `offset` is the cursor value a
/// client passes to resume after this entry.
#[derive(Debug, Clone)]
pub struct Dirent {
    pub qid: Qid,
    pub offset: u64,
    pub ty: u8,
    pub name: String,
}

/// Result of an `open`: the stock adapter always completes synchronously,
/// an asynchronous adapter parks the request and finishes it later through
/// the device's completion entry point.
#[derive(Debug, Clone, Copy)]
pub enum OpenOutcome {
    Ready(Qid),
    Pending,
}

/// Host filesystem operations the 9P server needs.
///
/// `File` is whatever handle the adapter wants to keep per FID. All errors
/// are positive POSIX errno values.
pub trait FsAdapter {
    type File;

    /// Resolve the attach root for `uname`/`aname`.
    fn attach(&mut self, uname: &str, aname: &str) -> FsResult<Self::File>;

    /// A second handle to the same object (Twalk with zero names).
    fn clone_node(&mut self, f: &Self::File) -> FsResult<Self::File>;

    fn qid(&self, f: &Self::File) -> Qid;

    /// Resolve one path component relative to `f`.
    fn walk(&mut self, f: &Self::File, name: &str) -> FsResult<Self::File>;

    fn open(&mut self, f: &mut Self::File, flags: u32) -> FsResult<OpenOutcome>;
    fn create(&mut self, f: &mut Self::File, name: &str, flags: u32, mode: u32, gid: u32)
        -> FsResult<Qid>;

    fn read(&mut self, f: &mut Self::File, offset: u64, buf: &mut [u8]) -> FsResult<usize>;
    fn write(&mut self, f: &mut Self::File, offset: u64, data: &[u8]) -> FsResult<usize>;
    fn readdir(&mut self, f: &mut Self::File, offset: u64) -> FsResult<Vec<Dirent>>;

    fn getattr(&mut self, f: &Self::File) -> FsResult<Stat>;
    fn setattr(&mut self, f: &mut Self::File, attr: &SetAttr) -> FsResult<()>;
    fn statfs(&mut self, f: &Self::File) -> FsResult<StatFs>;

    fn readlink(&mut self, f: &Self::File) -> FsResult<String>;
    fn symlink(&mut self, dir: &Self::File, name: &str, target: &str, gid: u32) -> FsResult<Qid>;
    fn mknod(
        &mut self,
        dir: &Self::File,
        name: &str,
        mode: u32,
        major: u32,
        minor: u32,
        gid: u32,
    ) -> FsResult<Qid>;
    fn link(&mut self, dir: &Self::File, target: &Self::File, name: &str) -> FsResult<()>;
    fn mkdir(&mut self, dir: &Self::File, name: &str, mode: u32, gid: u32) -> FsResult<Qid>;
    fn renameat(
        &mut self,
        olddir: &Self::File,
        oldname: &str,
        newdir: &Self::File,
        newname: &str,
    ) -> FsResult<()>;
    fn unlinkat(&mut self, dir: &Self::File, name: &str, flags: u32) -> FsResult<()>;
    fn fsync(&mut self, f: &mut Self::File) -> FsResult<()>;

    /// Release the handle. Called on clunk, on FID replacement and on
    /// device reset.
    fn close(&mut self, f: Self::File);
}

fn errno_of(err: &io::Error) -> u32 {
    err.raw_os_error().map_or(EIO, |e| e as u32)
}

fn qid_of(meta: &fs::Metadata) -> Qid {
    let ft = meta.file_type();
    let ty = if ft.is_dir() {
        QID_TYPE_DIR
    } else if ft.is_symlink() {
        QID_TYPE_SYMLINK
    } else {
        QID_TYPE_FILE
    };
    Qid {
        ty,
        version: 0,
        path: meta.ino(),
    }
}

/// A host node held by a FID: its path, its identity, and the open handle
/// once `lopen`/`lcreate` has run.
#[derive(Debug)]
pub struct HostNode {
    path: PathBuf,
    qid: Qid,
    file: Option<File>,
}

/// Passthrough adapter exporting one host directory.
///
/// Every path a guest can reach stays inside the exported root: walking
/// `..` at the root is a no-op and absolute components are stripped.
pub struct HostDir {
    root: PathBuf,
}

impl HostDir {
    /// `root` must name an existing directory.
    pub fn new(root: &Path) -> io::Result<Self> {
        let root = root.canonicalize()?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", root.display()),
            ));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn node(&self, path: PathBuf) -> FsResult<HostNode> {
        let meta = fs::symlink_metadata(&path).map_err(|e| errno_of(&e))?;
        Ok(HostNode {
            path,
            qid: qid_of(&meta),
            file: None,
        })
    }
}

/// `dir/name`, refusing names that are not a single normal component so a
/// crafted name can never step outside the export.
fn child_path(dir: &Path, name: &str) -> FsResult<PathBuf> {
    let mut comps = Path::new(name).components();
    match (comps.next(), comps.next()) {
        (Some(Component::Normal(c)), None) => {
            let mut p = dir.to_path_buf();
            p.push(c);
            Ok(p)
        }
        _ => Err(EINVAL),
    }
}

// Linux open(2) flag bits used by Tlopen/Tlcreate.
const O_ACCMODE: u32 = 0x3;
const O_WRONLY: u32 = 0x1;
const O_RDWR: u32 = 0x2;
const O_TRUNC: u32 = 0x200;
const O_APPEND: u32 = 0x400;

// Tunlinkat flag.
const AT_REMOVEDIR: u32 = 0x200;

impl FsAdapter for HostDir {
    type File = HostNode;

    fn attach(&mut self, uname: &str, _aname: &str) -> FsResult<HostNode> {
        debug!("9p: attach uname={uname:?} root={}", self.root.display());
        self.node(self.root.clone())
    }

    fn clone_node(&mut self, f: &HostNode) -> FsResult<HostNode> {
        Ok(HostNode {
            path: f.path.clone(),
            qid: f.qid,
            file: None,
        })
    }

    fn qid(&self, f: &HostNode) -> Qid {
        f.qid
    }

    fn walk(&mut self, f: &HostNode, name: &str) -> FsResult<HostNode> {
        let mut path = f.path.clone();
        match name {
            "" | "." => {}
            ".." => {
                // Never escape the exported root.
                if path != self.root {
                    path.pop();
                }
            }
            _ => path = child_path(&path, name)?,
        }
        self.node(path)
    }

    fn open(&mut self, f: &mut HostNode, flags: u32) -> FsResult<OpenOutcome> {
        if f.qid.ty != QID_TYPE_DIR {
            let accmode = flags & O_ACCMODE;
            let file = OpenOptions::new()
                .read(accmode != O_WRONLY)
                .write(accmode == O_WRONLY || accmode == O_RDWR)
                .append(flags & O_APPEND != 0)
                .truncate(flags & O_TRUNC != 0)
                .open(&f.path)
                .map_err(|e| errno_of(&e))?;
            f.file = Some(file);
        }
        Ok(OpenOutcome::Ready(f.qid))
    }

    fn create(
        &mut self,
        f: &mut HostNode,
        name: &str,
        flags: u32,
        mode: u32,
        _gid: u32,
    ) -> FsResult<Qid> {
        let path = child_path(&f.path, name)?;
        let accmode = flags & O_ACCMODE;
        let file = OpenOptions::new()
            .read(accmode != O_WRONLY)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| errno_of(&e))?;
        file.set_permissions(fs::Permissions::from_mode(mode & 0o7777))
            .map_err(|e| errno_of(&e))?;
        let meta = file.metadata().map_err(|e| errno_of(&e))?;
        // The FID now names the created file, open for I/O.
        f.path = path;
        f.qid = qid_of(&meta);
        f.file = Some(file);
        Ok(f.qid)
    }

    fn read(&mut self, f: &mut HostNode, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let file = f.file.as_mut().ok_or(EBADF)?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| errno_of(&e))?;
        let mut done = 0;
        while done < buf.len() {
            match file.read(&mut buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(errno_of(&e)),
            }
        }
        Ok(done)
    }

    fn write(&mut self, f: &mut HostNode, offset: u64, data: &[u8]) -> FsResult<usize> {
        let file = f.file.as_mut().ok_or(EBADF)?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| errno_of(&e))?;
        file.write_all(data).map_err(|e| errno_of(&e))?;
        Ok(data.len())
    }

    fn readdir(&mut self, f: &mut HostNode, offset: u64) -> FsResult<Vec<Dirent>> {
        if f.qid.ty != QID_TYPE_DIR {
            return Err(EINVAL);
        }
        let mut out = Vec::new();
        let entries = fs::read_dir(&f.path).map_err(|e| errno_of(&e))?;
        for (i, entry) in entries.enumerate() {
            if (i as u64) < offset {
                continue;
            }
            let entry = entry.map_err(|e| errno_of(&e))?;
            let meta = match entry.path().symlink_metadata() {
                Ok(m) => m,
                Err(_) => continue, // raced with deletion
            };
            let qid = qid_of(&meta);
            out.push(Dirent {
                qid,
                offset: i as u64 + 1,
                ty: qid.ty,
                name: entry.file_name().to_string_lossy().into_owned(),
            });
        }
        Ok(out)
    }

    fn getattr(&mut self, f: &HostNode) -> FsResult<Stat> {
        let meta = fs::symlink_metadata(&f.path).map_err(|e| errno_of(&e))?;
        Ok(Stat {
            qid: qid_of(&meta),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            nlink: meta.nlink(),
            rdev: meta.rdev(),
            size: meta.size(),
            blksize: meta.blksize(),
            blocks: meta.blocks(),
            atime_sec: meta.atime() as u64,
            atime_nsec: meta.atime_nsec() as u64,
            mtime_sec: meta.mtime() as u64,
            mtime_nsec: meta.mtime_nsec() as u64,
            ctime_sec: meta.ctime() as u64,
            ctime_nsec: meta.ctime_nsec() as u64,
        })
    }

    fn setattr(&mut self, f: &mut HostNode, attr: &SetAttr) -> FsResult<()> {
        if attr.valid & SETATTR_MODE != 0 {
            fs::set_permissions(&f.path, fs::Permissions::from_mode(attr.mode & 0o7777))
                .map_err(|e| errno_of(&e))?;
        }
        if attr.valid & (SETATTR_UID | SETATTR_GID) != 0 {
            let uid = (attr.valid & SETATTR_UID != 0).then_some(attr.uid);
            let gid = (attr.valid & SETATTR_GID != 0).then_some(attr.gid);
            std::os::unix::fs::chown(&f.path, uid, gid).map_err(|e| errno_of(&e))?;
        }
        if attr.valid & SETATTR_SIZE != 0 {
            match &f.file {
                Some(file) => file.set_len(attr.size).map_err(|e| errno_of(&e))?,
                None => {
                    let file = OpenOptions::new()
                        .write(true)
                        .open(&f.path)
                        .map_err(|e| errno_of(&e))?;
                    file.set_len(attr.size).map_err(|e| errno_of(&e))?;
                }
            }
        }
        // Timestamp updates are accepted and dropped; the guest's view of
        // atime/mtime comes back from getattr anyway.
        Ok(())
    }

    fn statfs(&mut self, _f: &HostNode) -> FsResult<StatFs> {
        // Synthetic but self-consistent numbers; std exposes no statvfs.
        Ok(StatFs {
            ftype: 0x0102_1997, // V9FS_MAGIC
            bsize: 4096,
            blocks: 1 << 24,
            bfree: 1 << 23,
            bavail: 1 << 23,
            files: 1 << 20,
            ffree: 1 << 19,
            fsid: 0,
            namelen: 255,
        })
    }

    fn readlink(&mut self, f: &HostNode) -> FsResult<String> {
        let target = fs::read_link(&f.path).map_err(|e| errno_of(&e))?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn symlink(&mut self, dir: &HostNode, name: &str, target: &str, _gid: u32) -> FsResult<Qid> {
        let node = child_path(&dir.path, name)?;
        std::os::unix::fs::symlink(target, &node).map_err(|e| errno_of(&e))?;
        let meta = fs::symlink_metadata(&node).map_err(|e| errno_of(&e))?;
        Ok(qid_of(&meta))
    }

    fn mknod(
        &mut self,
        _dir: &HostNode,
        _name: &str,
        mode: u32,
        _major: u32,
        _minor: u32,
        _gid: u32,
    ) -> FsResult<Qid> {
        // Device nodes and fifos are not materialized on the host.
        debug!("9p: refusing mknod mode={mode:#o}");
        Err(ENOTSUP)
    }

    fn link(&mut self, dir: &HostNode, target: &HostNode, name: &str) -> FsResult<()> {
        let p = child_path(&dir.path, name)?;
        fs::hard_link(&target.path, &p).map_err(|e| errno_of(&e))
    }

    fn mkdir(&mut self, dir: &HostNode, name: &str, mode: u32, _gid: u32) -> FsResult<Qid> {
        let p = child_path(&dir.path, name)?;
        fs::create_dir(&p).map_err(|e| errno_of(&e))?;
        fs::set_permissions(&p, fs::Permissions::from_mode(mode & 0o7777))
            .map_err(|e| errno_of(&e))?;
        let meta = fs::symlink_metadata(&p).map_err(|e| errno_of(&e))?;
        Ok(qid_of(&meta))
    }

    fn renameat(
        &mut self,
        olddir: &HostNode,
        oldname: &str,
        newdir: &HostNode,
        newname: &str,
    ) -> FsResult<()> {
        let from = child_path(&olddir.path, oldname)?;
        let to = child_path(&newdir.path, newname)?;
        fs::rename(&from, &to).map_err(|e| errno_of(&e))
    }

    fn unlinkat(&mut self, dir: &HostNode, name: &str, flags: u32) -> FsResult<()> {
        let p = child_path(&dir.path, name)?;
        let res = if flags & AT_REMOVEDIR != 0 {
            fs::remove_dir(&p)
        } else {
            fs::remove_file(&p)
        };
        res.map_err(|e| errno_of(&e))
    }

    fn fsync(&mut self, f: &mut HostNode) -> FsResult<()> {
        match &f.file {
            Some(file) => file.sync_all().map_err(|e| errno_of(&e)),
            None => Ok(()),
        }
    }

    fn close(&mut self, f: HostNode) {
        // Dropping the handle closes it.
        drop(f);
    }
}
