//! VirtIO 9P device: a 9P2000.L server over the MMIO transport.
//!
//! Every T-message arrives in the read-only span of a descriptor chain and
//! its reply goes back in the write-only span as `size[4] (id+1)[1] tag[2]
//! payload`, errors as `Rlerror` (id 7) carrying a POSIX errno. Message
//! bodies are encoded and decoded through one format-string mini-language
//! so the wire layout lives in exactly one place per operation:
//!
//! | code | field                                     |
//! |------|-------------------------------------------|
//! | `b`  | u8                                        |
//! | `h`  | u16 little-endian                         |
//! | `w`  | u32 little-endian                         |
//! | `d`  | u64 little-endian                         |
//! | `s`  | u16-length-prefixed UTF-8 string          |
//! | `Q`  | 13-byte QID `{type, version, path}`       |
//!
//! The filesystem itself sits behind [`FsAdapter`]; this module owns the
//! FID table and the wire protocol only.

use std::collections::HashMap;

use log::{debug, warn};

use crate::fs::{FsAdapter, OpenOutcome, Qid, SetAttr, EINVAL, EPROTO, ENOTSUP};
use crate::mem::GuestMemory;

use super::device::{Transport, Virtio, VirtioBackend, VIRTIO_9P_DEVICE_ID};

// 9P2000.L message ids. Replies are T-id + 1.
pub const T_STATFS: u8 = 8;
pub const T_LOPEN: u8 = 12;
pub const T_LCREATE: u8 = 14;
pub const T_SYMLINK: u8 = 16;
pub const T_MKNOD: u8 = 18;
pub const T_READLINK: u8 = 22;
pub const T_GETATTR: u8 = 24;
pub const T_SETATTR: u8 = 26;
pub const T_XATTRWALK: u8 = 30;
pub const T_READDIR: u8 = 40;
pub const T_FSYNC: u8 = 50;
pub const T_LOCK: u8 = 52;
pub const T_GETLOCK: u8 = 54;
pub const T_LINK: u8 = 70;
pub const T_MKDIR: u8 = 72;
pub const T_RENAMEAT: u8 = 74;
pub const T_UNLINKAT: u8 = 76;
pub const T_VERSION: u8 = 100;
pub const T_ATTACH: u8 = 104;
pub const T_FLUSH: u8 = 108;
pub const T_WALK: u8 = 110;
pub const T_READ: u8 = 116;
pub const T_WRITE: u8 = 118;
pub const T_CLUNK: u8 = 120;

pub const R_LERROR: u8 = 7;
pub const R_LOPEN: u8 = 13;

/// Feature bit 0: the mount tag is present in the config space.
const VIRTIO_9P_MOUNT_TAG: u32 = 1;

/// Default maximum message size until Tversion negotiates one.
const DEFAULT_MSIZE: u32 = 8192;

/// Rread/Rreaddir framing overhead: size[4] id[1] tag[2] count[4].
const IOHDR_SIZE: u32 = 11;
/// Conservative per-message overhead subtracted from msize for iounit.
const IOUNIT_SLACK: u32 = 24;

// Rgetlock/Rlock constants.
const LOCK_SUCCESS: u8 = 0;
const LOCK_TYPE_UNLCK: u8 = 2;

// ---------------------------------------------------------------------------
// Marshalling mini-language
// ---------------------------------------------------------------------------

/// One wire value. The accessors panic on a type mismatch, which can only
/// happen when a format string and its accessors disagree in this file.
#[derive(Debug, Clone, PartialEq)]
pub enum PVal {
    B(u8),
    H(u16),
    W(u32),
    D(u64),
    S(String),
    Q(Qid),
}

impl PVal {
    pub fn u8(&self) -> u8 {
        match self {
            PVal::B(v) => *v,
            _ => unreachable!("format accessor mismatch"),
        }
    }

    pub fn u16(&self) -> u16 {
        match self {
            PVal::H(v) => *v,
            _ => unreachable!("format accessor mismatch"),
        }
    }

    pub fn u32(&self) -> u32 {
        match self {
            PVal::W(v) => *v,
            _ => unreachable!("format accessor mismatch"),
        }
    }

    pub fn u64(&self) -> u64 {
        match self {
            PVal::D(v) => *v,
            _ => unreachable!("format accessor mismatch"),
        }
    }

    pub fn str(&self) -> &str {
        match self {
            PVal::S(v) => v,
            _ => unreachable!("format accessor mismatch"),
        }
    }

    pub fn qid(&self) -> Qid {
        match self {
            PVal::Q(v) => *v,
            _ => unreachable!("format accessor mismatch"),
        }
    }
}

/// Append `args` to `out` according to `fmt`.
pub fn marshal(out: &mut Vec<u8>, fmt: &str, args: &[PVal]) {
    assert_eq!(fmt.len(), args.len(), "format/argument count mismatch");
    for (code, arg) in fmt.chars().zip(args) {
        match (code, arg) {
            ('b', PVal::B(v)) => out.push(*v),
            ('h', PVal::H(v)) => out.extend_from_slice(&v.to_le_bytes()),
            ('w', PVal::W(v)) => out.extend_from_slice(&v.to_le_bytes()),
            ('d', PVal::D(v)) => out.extend_from_slice(&v.to_le_bytes()),
            ('s', PVal::S(v)) => {
                out.extend_from_slice(&(v.len() as u16).to_le_bytes());
                out.extend_from_slice(v.as_bytes());
            }
            ('Q', PVal::Q(q)) => {
                out.push(q.ty);
                out.extend_from_slice(&q.version.to_le_bytes());
                out.extend_from_slice(&q.path.to_le_bytes());
            }
            _ => unreachable!("format/value mismatch at code {code:?}"),
        }
    }
}

/// Decode `fmt` from `buf` starting at `*pos`, advancing it. Truncated or
/// malformed input is a protocol error.
pub fn unmarshal(buf: &[u8], pos: &mut usize, fmt: &str) -> Result<Vec<PVal>, u32> {
    let mut out = Vec::with_capacity(fmt.len());
    for code in fmt.chars() {
        let val = match code {
            'b' => PVal::B(*buf.get(*pos).ok_or(EPROTO)?),
            'h' => PVal::H(u16::from_le_bytes(take(buf, pos, 2)?.try_into().unwrap())),
            'w' => PVal::W(u32::from_le_bytes(take(buf, pos, 4)?.try_into().unwrap())),
            'd' => PVal::D(u64::from_le_bytes(take(buf, pos, 8)?.try_into().unwrap())),
            's' => {
                let len = u16::from_le_bytes(take(buf, pos, 2)?.try_into().unwrap()) as usize;
                let raw = take(buf, pos, len)?;
                PVal::S(std::str::from_utf8(raw).map_err(|_| EINVAL)?.to_owned())
            }
            'Q' => {
                let raw = take(buf, pos, 13)?;
                PVal::Q(Qid {
                    ty: raw[0],
                    version: u32::from_le_bytes(raw[1..5].try_into().unwrap()),
                    path: u64::from_le_bytes(raw[5..13].try_into().unwrap()),
                })
            }
            _ => unreachable!("unknown format code {code:?}"),
        };
        if code == 'b' {
            *pos += 1;
        }
        out.push(val);
    }
    Ok(out)
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], u32> {
    let end = pos.checked_add(len).ok_or(EPROTO)?;
    if end > buf.len() {
        return Err(EPROTO);
    }
    let out = &buf[*pos..end];
    *pos = end;
    Ok(out)
}

/// A complete R-message: `size[4] id[1] tag[2] payload`.
fn reply_frame(id: u8, tag: u16, payload: &[u8]) -> Vec<u8> {
    let size = (7 + payload.len()) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_le_bytes());
    out.push(id);
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// An `lopen` waiting on the adapter, with everything needed to finish the
/// reply later.
#[derive(Debug)]
struct PendingOpen {
    queue_idx: usize,
    head: u16,
    tag: u16,
}

/// What a handler produced: a reply payload for `T-id + 1`, or a parked
/// open.
enum Body {
    Payload(Vec<u8>),
    Pending,
}

/// VirtIO 9P device (device class 9) over any [`FsAdapter`].
pub struct NineP<A: FsAdapter> {
    fs: A,
    mount_tag: String,
    msize: u32,
    fids: HashMap<u32, A::File>,
    pending: Option<PendingOpen>,
}

impl<A: FsAdapter> std::fmt::Debug for NineP<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NineP")
            .field("mount_tag", &self.mount_tag)
            .field("msize", &self.msize)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl<A: FsAdapter> NineP<A> {
    pub fn new(fs: A, mount_tag: &str) -> Self {
        Self {
            fs,
            mount_tag: mount_tag.to_owned(),
            msize: DEFAULT_MSIZE,
            fids: HashMap::new(),
            pending: None,
        }
    }

    pub fn msize(&self) -> u32 {
        self.msize
    }

    pub fn mount_tag(&self) -> &str {
        &self.mount_tag
    }

    pub fn fs(&self) -> &A {
        &self.fs
    }

    /// Whether a FID is currently live. Exposed for the host's benefit;
    /// guests learn this the hard way.
    pub fn has_fid(&self, fid: u32) -> bool {
        self.fids.contains_key(&fid)
    }

    fn install_fid(&mut self, fid: u32, file: A::File) {
        if let Some(old) = self.fids.insert(fid, file) {
            self.fs.close(old);
        }
    }

    fn handle_message(&mut self, req: &[u8]) -> (u16, Result<Body, u32>) {
        if req.len() < 7 {
            return (0, Err(EPROTO));
        }
        let id = req[4];
        let tag = u16::from_le_bytes(req[5..7].try_into().unwrap());
        let body = &req[7..];

        debug!("9p: T{id} tag={tag} len={}", req.len());

        let result = match id {
            T_STATFS => self.op_statfs(body),
            T_VERSION => self.op_version(body),
            T_ATTACH => self.op_attach(body),
            T_WALK => self.op_walk(body),
            T_LOPEN => self.op_lopen(body),
            T_LCREATE => self.op_lcreate(body),
            T_SYMLINK => self.op_symlink(body),
            T_MKNOD => self.op_mknod(body),
            T_READLINK => self.op_readlink(body),
            T_GETATTR => self.op_getattr(body),
            T_SETATTR => self.op_setattr(body),
            T_XATTRWALK => Err(ENOTSUP),
            T_READDIR => self.op_readdir(body),
            T_FSYNC => self.op_fsync(body),
            T_LOCK => self.op_lock(body),
            T_GETLOCK => self.op_getlock(body),
            T_LINK => self.op_link(body),
            T_MKDIR => self.op_mkdir(body),
            T_RENAMEAT => self.op_renameat(body),
            T_UNLINKAT => self.op_unlinkat(body),
            T_FLUSH => Ok(Body::Payload(Vec::new())),
            T_READ => self.op_read(body),
            T_WRITE => self.op_write(body),
            T_CLUNK => self.op_clunk(body),
            _ => {
                warn!("9p: unknown message id {id}");
                Err(EPROTO)
            }
        };
        (tag, result)
    }

    fn op_statfs(&mut self, body: &[u8]) -> Result<Body, u32> {
        let v = unmarshal(body, &mut 0, "w")?;
        let file = self.fids.get(&v[0].u32()).ok_or(EPROTO)?;
        let sf = self.fs.statfs(file)?;
        let mut p = Vec::new();
        marshal(
            &mut p,
            "wwddddddw",
            &[
                PVal::W(sf.ftype),
                PVal::W(sf.bsize),
                PVal::D(sf.blocks),
                PVal::D(sf.bfree),
                PVal::D(sf.bavail),
                PVal::D(sf.files),
                PVal::D(sf.ffree),
                PVal::D(sf.fsid),
                PVal::W(sf.namelen),
            ],
        );
        Ok(Body::Payload(p))
    }

    fn op_version(&mut self, body: &[u8]) -> Result<Body, u32> {
        let v = unmarshal(body, &mut 0, "ws")?;
        // The requested msize is adopted as-is; the floor only keeps the
        // framing arithmetic sound against a hostile driver.
        self.msize = v[0].u32().max(512);
        debug!("9p: version msize={} version={:?}", self.msize, v[1].str());
        let mut p = Vec::new();
        marshal(&mut p, "ws", &[PVal::W(self.msize), PVal::S("9P2000.L".into())]);
        Ok(Body::Payload(p))
    }

    fn op_attach(&mut self, body: &[u8]) -> Result<Body, u32> {
        let v = unmarshal(body, &mut 0, "wwssw")?;
        let fid = v[0].u32();
        let root = self.fs.attach(v[2].str(), v[3].str())?;
        let qid = self.fs.qid(&root);
        self.install_fid(fid, root);
        let mut p = Vec::new();
        marshal(&mut p, "Q", &[PVal::Q(qid)]);
        Ok(Body::Payload(p))
    }

    fn op_walk(&mut self, body: &[u8]) -> Result<Body, u32> {
        let mut pos = 0;
        let v = unmarshal(body, &mut pos, "wwh")?;
        let (fid, newfid, nwname) = (v[0].u32(), v[1].u32(), v[2].u16());
        let mut names = Vec::with_capacity(nwname as usize);
        for _ in 0..nwname {
            names.push(unmarshal(body, &mut pos, "s")?.remove(0));
        }

        let start = self.fids.get(&fid).ok_or(EPROTO)?;
        let mut cur = self.fs.clone_node(start)?;
        let mut qids = Vec::new();
        for name in &names {
            match self.fs.walk(&cur, name.str()) {
                Ok(next) => {
                    self.fs.close(std::mem::replace(&mut cur, next));
                    qids.push(self.fs.qid(&cur));
                }
                Err(errno) => {
                    self.fs.close(cur);
                    // Nothing traversed at all is an error; a partial walk
                    // reports the QIDs reached and leaves newfid unset.
                    if qids.is_empty() {
                        return Err(errno);
                    }
                    let mut p = Vec::new();
                    marshal(&mut p, "h", &[PVal::H(qids.len() as u16)]);
                    for q in qids {
                        marshal(&mut p, "Q", &[PVal::Q(q)]);
                    }
                    return Ok(Body::Payload(p));
                }
            }
        }
        self.install_fid(newfid, cur);

        let mut p = Vec::new();
        marshal(&mut p, "h", &[PVal::H(qids.len() as u16)]);
        for q in qids {
            marshal(&mut p, "Q", &[PVal::Q(q)]);
        }
        Ok(Body::Payload(p))
    }

    fn op_lopen(&mut self, body: &[u8]) -> Result<Body, u32> {
        let v = unmarshal(body, &mut 0, "ww")?;
        let file = self.fids.get_mut(&v[0].u32()).ok_or(EPROTO)?;
        match self.fs.open(file, v[1].u32())? {
            OpenOutcome::Ready(qid) => {
                let mut p = Vec::new();
                marshal(
                    &mut p,
                    "Qw",
                    &[PVal::Q(qid), PVal::W(self.msize - IOUNIT_SLACK)],
                );
                Ok(Body::Payload(p))
            }
            OpenOutcome::Pending => Ok(Body::Pending),
        }
    }

    fn op_lcreate(&mut self, body: &[u8]) -> Result<Body, u32> {
        let v = unmarshal(body, &mut 0, "wswww")?;
        let file = self.fids.get_mut(&v[0].u32()).ok_or(EPROTO)?;
        let qid = self
            .fs
            .create(file, v[1].str(), v[2].u32(), v[3].u32(), v[4].u32())?;
        let mut p = Vec::new();
        marshal(
            &mut p,
            "Qw",
            &[PVal::Q(qid), PVal::W(self.msize - IOUNIT_SLACK)],
        );
        Ok(Body::Payload(p))
    }

    fn op_symlink(&mut self, body: &[u8]) -> Result<Body, u32> {
        let v = unmarshal(body, &mut 0, "wssw")?;
        let dir = self.fids.get(&v[0].u32()).ok_or(EPROTO)?;
        let qid = self.fs.symlink(dir, v[1].str(), v[2].str(), v[3].u32())?;
        let mut p = Vec::new();
        marshal(&mut p, "Q", &[PVal::Q(qid)]);
        Ok(Body::Payload(p))
    }

    fn op_mknod(&mut self, body: &[u8]) -> Result<Body, u32> {
        let v = unmarshal(body, &mut 0, "wswwww")?;
        let dir = self.fids.get(&v[0].u32()).ok_or(EPROTO)?;
        let qid = self.fs.mknod(
            dir,
            v[1].str(),
            v[2].u32(),
            v[3].u32(),
            v[4].u32(),
            v[5].u32(),
        )?;
        let mut p = Vec::new();
        marshal(&mut p, "Q", &[PVal::Q(qid)]);
        Ok(Body::Payload(p))
    }

    fn op_readlink(&mut self, body: &[u8]) -> Result<Body, u32> {
        let v = unmarshal(body, &mut 0, "w")?;
        let file = self.fids.get(&v[0].u32()).ok_or(EPROTO)?;
        let target = self.fs.readlink(file)?;
        let mut p = Vec::new();
        marshal(&mut p, "s", &[PVal::S(target)]);
        Ok(Body::Payload(p))
    }

    fn op_getattr(&mut self, body: &[u8]) -> Result<Body, u32> {
        let v = unmarshal(body, &mut 0, "wd")?;
        let file = self.fids.get(&v[0].u32()).ok_or(EPROTO)?;
        let st = self.fs.getattr(file)?;
        // Full Linux stat packet; the trailing btime/gen/data-version
        // quartet is reserved and always zero.
        let mut p = Vec::new();
        marshal(
            &mut p,
            "dQwwwddddddddddddddd",
            &[
                PVal::D(0x7ff), // basic attribute mask
                PVal::Q(st.qid),
                PVal::W(st.mode),
                PVal::W(st.uid),
                PVal::W(st.gid),
                PVal::D(st.nlink),
                PVal::D(st.rdev),
                PVal::D(st.size),
                PVal::D(st.blksize),
                PVal::D(st.blocks),
                PVal::D(st.atime_sec),
                PVal::D(st.atime_nsec),
                PVal::D(st.mtime_sec),
                PVal::D(st.mtime_nsec),
                PVal::D(st.ctime_sec),
                PVal::D(st.ctime_nsec),
                PVal::D(0),
                PVal::D(0),
                PVal::D(0),
                PVal::D(0),
            ],
        );
        Ok(Body::Payload(p))
    }

    fn op_setattr(&mut self, body: &[u8]) -> Result<Body, u32> {
        let v = unmarshal(body, &mut 0, "wwwwwddddd")?;
        let attr = SetAttr {
            valid: v[1].u32(),
            mode: v[2].u32(),
            uid: v[3].u32(),
            gid: v[4].u32(),
            size: v[5].u64(),
            atime_sec: v[6].u64(),
            atime_nsec: v[7].u64(),
            mtime_sec: v[8].u64(),
            mtime_nsec: v[9].u64(),
        };
        let file = self.fids.get_mut(&v[0].u32()).ok_or(EPROTO)?;
        self.fs.setattr(file, &attr)?;
        Ok(Body::Payload(Vec::new()))
    }

    fn op_readdir(&mut self, body: &[u8]) -> Result<Body, u32> {
        let v = unmarshal(body, &mut 0, "wdw")?;
        let count = v[2].u32().min(self.msize - IOHDR_SIZE) as usize;
        let file = self.fids.get_mut(&v[0].u32()).ok_or(EPROTO)?;
        let entries = self.fs.readdir(file, v[1].u64())?;

        let mut data = Vec::new();
        for e in entries {
            let mut one = Vec::new();
            marshal(
                &mut one,
                "Qdbs",
                &[
                    PVal::Q(e.qid),
                    PVal::D(e.offset),
                    PVal::B(e.ty),
                    PVal::S(e.name),
                ],
            );
            if data.len() + one.len() > count {
                break;
            }
            data.extend_from_slice(&one);
        }

        let mut p = Vec::new();
        marshal(&mut p, "w", &[PVal::W(data.len() as u32)]);
        p.extend_from_slice(&data);
        Ok(Body::Payload(p))
    }

    fn op_fsync(&mut self, body: &[u8]) -> Result<Body, u32> {
        let v = unmarshal(body, &mut 0, "w")?;
        let file = self.fids.get_mut(&v[0].u32()).ok_or(EPROTO)?;
        self.fs.fsync(file)?;
        Ok(Body::Payload(Vec::new()))
    }

    fn op_lock(&mut self, body: &[u8]) -> Result<Body, u32> {
        let v = unmarshal(body, &mut 0, "wbwddws")?;
        self.fids.get(&v[0].u32()).ok_or(EPROTO)?;
        // Single-client server: every lock is immediately granted.
        Ok(Body::Payload(vec![LOCK_SUCCESS]))
    }

    fn op_getlock(&mut self, body: &[u8]) -> Result<Body, u32> {
        let v = unmarshal(body, &mut 0, "wbddws")?;
        self.fids.get(&v[0].u32()).ok_or(EPROTO)?;
        // Nothing is ever locked, so report the range as free.
        let mut p = Vec::new();
        marshal(
            &mut p,
            "bddws",
            &[
                PVal::B(LOCK_TYPE_UNLCK),
                PVal::D(v[2].u64()),
                PVal::D(v[3].u64()),
                PVal::W(v[4].u32()),
                PVal::S(v[5].str().to_owned()),
            ],
        );
        Ok(Body::Payload(p))
    }

    fn op_link(&mut self, body: &[u8]) -> Result<Body, u32> {
        let v = unmarshal(body, &mut 0, "wws")?;
        let dir = self.fids.get(&v[0].u32()).ok_or(EPROTO)?;
        let target = self.fids.get(&v[1].u32()).ok_or(EPROTO)?;
        self.fs.link(dir, target, v[2].str())?;
        Ok(Body::Payload(Vec::new()))
    }

    fn op_mkdir(&mut self, body: &[u8]) -> Result<Body, u32> {
        let v = unmarshal(body, &mut 0, "wsww")?;
        let dir = self.fids.get(&v[0].u32()).ok_or(EPROTO)?;
        let qid = self.fs.mkdir(dir, v[1].str(), v[2].u32(), v[3].u32())?;
        let mut p = Vec::new();
        marshal(&mut p, "Q", &[PVal::Q(qid)]);
        Ok(Body::Payload(p))
    }

    fn op_renameat(&mut self, body: &[u8]) -> Result<Body, u32> {
        let v = unmarshal(body, &mut 0, "wsws")?;
        let olddir = self.fids.get(&v[0].u32()).ok_or(EPROTO)?;
        let newdir = self.fids.get(&v[2].u32()).ok_or(EPROTO)?;
        self.fs.renameat(olddir, v[1].str(), newdir, v[3].str())?;
        Ok(Body::Payload(Vec::new()))
    }

    fn op_unlinkat(&mut self, body: &[u8]) -> Result<Body, u32> {
        let v = unmarshal(body, &mut 0, "wsw")?;
        let dir = self.fids.get(&v[0].u32()).ok_or(EPROTO)?;
        self.fs.unlinkat(dir, v[1].str(), v[2].u32())?;
        Ok(Body::Payload(Vec::new()))
    }

    fn op_read(&mut self, body: &[u8]) -> Result<Body, u32> {
        let v = unmarshal(body, &mut 0, "wdw")?;
        let count = v[2].u32().min(self.msize - IOHDR_SIZE) as usize;
        let file = self.fids.get_mut(&v[0].u32()).ok_or(EPROTO)?;
        let mut data = vec![0u8; count];
        let n = self.fs.read(file, v[1].u64(), &mut data)?;
        data.truncate(n);

        let mut p = Vec::new();
        marshal(&mut p, "w", &[PVal::W(n as u32)]);
        p.extend_from_slice(&data);
        Ok(Body::Payload(p))
    }

    fn op_write(&mut self, body: &[u8]) -> Result<Body, u32> {
        let mut pos = 0;
        let v = unmarshal(body, &mut pos, "wdw")?;
        let count = v[2].u32() as usize;
        let data = take(body, &mut pos, count)?;
        let file = self.fids.get_mut(&v[0].u32()).ok_or(EPROTO)?;
        let n = self.fs.write(file, v[1].u64(), data)?;

        let mut p = Vec::new();
        marshal(&mut p, "w", &[PVal::W(n as u32)]);
        Ok(Body::Payload(p))
    }

    fn op_clunk(&mut self, body: &[u8]) -> Result<Body, u32> {
        let v = unmarshal(body, &mut 0, "w")?;
        let file = self.fids.remove(&v[0].u32()).ok_or(EPROTO)?;
        self.fs.close(file);
        Ok(Body::Payload(Vec::new()))
    }
}

impl<A: FsAdapter> VirtioBackend for NineP<A> {
    fn device_id(&self) -> u32 {
        VIRTIO_9P_DEVICE_ID
    }

    fn device_features(&self) -> u32 {
        VIRTIO_9P_MOUNT_TAG
    }

    fn config_space(&self) -> Vec<u8> {
        // tag_len: u16 LE, then the mount tag bytes.
        let tag = self.mount_tag.as_bytes();
        let mut cfg = Vec::with_capacity(2 + tag.len());
        cfg.extend_from_slice(&(tag.len() as u16).to_le_bytes());
        cfg.extend_from_slice(tag);
        cfg
    }

    fn recv_request(
        &mut self,
        t: &mut Transport,
        mem: &dyn GuestMemory,
        queue_idx: usize,
        head: u16,
        read_size: usize,
        write_size: usize,
    ) -> i32 {
        if self.pending.is_some() {
            return -1;
        }

        let mut req = vec![0u8; read_size];
        if t.queue(queue_idx).copy_from(mem, head, 0, &mut req).is_err() {
            return 0;
        }

        let (tag, result) = self.handle_message(&req);
        let reply = match result {
            Ok(Body::Payload(payload)) => reply_frame(req[4] + 1, tag, &payload),
            Ok(Body::Pending) => {
                self.pending = Some(PendingOpen {
                    queue_idx,
                    head,
                    tag,
                });
                return 0;
            }
            Err(errno) => reply_frame(R_LERROR, tag, &errno.to_le_bytes()),
        };

        if reply.len() > write_size {
            warn!(
                "9p: reply of {} bytes exceeds the chain's {write_size}-byte write span",
                reply.len()
            );
        }
        let _ = t.queue(queue_idx).copy_to(mem, head, 0, &reply);
        t.consume(mem, queue_idx, head, reply.len() as u32);
        0
    }

    fn reset(&mut self) {
        self.pending = None;
        self.msize = DEFAULT_MSIZE;
        for (_, file) in self.fids.drain() {
            self.fs.close(file);
        }
    }
}

impl<A: FsAdapter> Virtio<NineP<A>> {
    /// Completion entry for an asynchronous `lopen`. The adapter (or the
    /// host driving it) calls this once the open finishes; the parked reply
    /// is sent, the request slot frees up and the queue is drained again.
    pub fn open_completed(&mut self, mem: &dyn GuestMemory, qid: Qid, errno: u32) {
        let Some(p) = self.backend.pending.take() else {
            warn!("9p: open completion with no request in flight");
            return;
        };

        let reply = if errno == 0 {
            let mut payload = Vec::new();
            marshal(
                &mut payload,
                "Qw",
                &[PVal::Q(qid), PVal::W(self.backend.msize - IOUNIT_SLACK)],
            );
            reply_frame(R_LOPEN, p.tag, &payload)
        } else {
            reply_frame(R_LERROR, p.tag, &errno.to_le_bytes())
        };

        let _ = self.t.queue(p.queue_idx).copy_to(mem, p.head, 0, &reply);
        self.t.consume(mem, p.queue_idx, p.head, reply.len() as u32);
        self.queue_notify(mem, p.queue_idx);
    }
}
