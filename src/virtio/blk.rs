//! VirtIO block device and its host-file backend.
//!
//! The backend interface keeps the asynchronous shape of the transport
//! (a pending-request latch plus an explicit completion step) even though
//! [`DiskImage`] completes everything synchronously; a threaded backend can
//! be slotted in without touching the device state machine.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, warn};

use crate::mem::GuestMemory;

use super::device::{Transport, VirtioBackend, VIRTIO_BLK_DEVICE_ID};

pub const SECTOR_SIZE: usize = 512;

// Request types from the guest driver.
pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
pub const VIRTIO_BLK_T_FLUSH_OUT: u32 = 5;

// Status byte written back at the end of every request.
pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

/// 16-byte request header: `{type: u32, ioprio: u32, sector: u64}`.
const HEADER_SIZE: usize = 16;

/// Sector-addressed storage under a VirtIO block device.
///
/// Synchronous: both calls return once the data has moved. `buf` length is
/// a whole number of sectors.
pub trait BlockBackend {
    fn sector_count(&self) -> u64;
    fn read(&mut self, sector: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write(&mut self, sector: u64, buf: &[u8]) -> io::Result<()>;
}

/// How writes to a [`DiskImage`] behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskMode {
    /// Writes fail; the image is never touched.
    ReadOnly,
    /// The image file is the sole store.
    ReadWrite,
    /// Copy-on-write overlay: writes land in per-sector buffers, reads
    /// consult them first, the image file stays pristine.
    Snapshot,
}

/// A block backend over a host image file.
pub struct DiskImage {
    file: File,
    nb_sectors: u64,
    mode: DiskMode,
    overlay: HashMap<u64, Box<[u8; SECTOR_SIZE]>>,
}

impl DiskImage {
    pub fn open(path: &Path, mode: DiskMode) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(mode == DiskMode::ReadWrite)
            .open(path)?;
        let nb_sectors = file.metadata()?.len() / SECTOR_SIZE as u64;
        Ok(Self {
            file,
            nb_sectors,
            mode,
            overlay: HashMap::new(),
        })
    }

    pub fn mode(&self) -> DiskMode {
        self.mode
    }

    fn check_range(&self, sector: u64, sectors: u64) -> io::Result<()> {
        if sector.checked_add(sectors).map_or(true, |end| end > self.nb_sectors) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("sector range {sector}+{sectors} past end of image"),
            ));
        }
        Ok(())
    }

    fn read_file_sector(&mut self, sector: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))?;
        self.file.read_exact(buf)
    }
}

impl BlockBackend for DiskImage {
    fn sector_count(&self) -> u64 {
        self.nb_sectors
    }

    fn read(&mut self, sector: u64, buf: &mut [u8]) -> io::Result<()> {
        let sectors = (buf.len() / SECTOR_SIZE) as u64;
        self.check_range(sector, sectors)?;
        match self.mode {
            DiskMode::Snapshot => {
                for (i, chunk) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
                    let s = sector + i as u64;
                    match self.overlay.get(&s) {
                        Some(data) => chunk.copy_from_slice(&data[..]),
                        None => self.read_file_sector(s, chunk)?,
                    }
                }
                Ok(())
            }
            _ => {
                self.file.seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))?;
                self.file.read_exact(buf)
            }
        }
    }

    fn write(&mut self, sector: u64, buf: &[u8]) -> io::Result<()> {
        let sectors = (buf.len() / SECTOR_SIZE) as u64;
        match self.mode {
            DiskMode::ReadOnly => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "image is read-only",
            )),
            DiskMode::ReadWrite => {
                self.check_range(sector, sectors)?;
                self.file.seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))?;
                self.file.write_all(buf)?;
                self.file.flush()
            }
            DiskMode::Snapshot => {
                self.check_range(sector, sectors)?;
                for (i, chunk) in buf.chunks_exact(SECTOR_SIZE).enumerate() {
                    let slot = self
                        .overlay
                        .entry(sector + i as u64)
                        .or_insert_with(|| Box::new([0u8; SECTOR_SIZE]));
                    slot.copy_from_slice(chunk);
                }
                Ok(())
            }
        }
    }
}

/// One request in flight, captured as its resumption state.
#[derive(Debug)]
enum BlockPending {
    Idle,
    /// An IN request: the device-side buffer already sized to the chain's
    /// write span (payload plus trailing status byte).
    Read {
        queue_idx: usize,
        head: u16,
        buf: Vec<u8>,
    },
    /// An OUT, flush or unsupported request: only the status byte remains.
    Status {
        queue_idx: usize,
        head: u16,
        unsupported: bool,
    },
}

/// VirtIO block device (device class 2) over any [`BlockBackend`].
pub struct Blk {
    backend: Box<dyn BlockBackend>,
    pending: BlockPending,
}

impl std::fmt::Debug for Blk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blk")
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl Blk {
    pub fn new(backend: Box<dyn BlockBackend>) -> Self {
        Self {
            backend,
            pending: BlockPending::Idle,
        }
    }

    pub fn sector_count(&self) -> u64 {
        self.backend.sector_count()
    }

    /// Completion half of a request. With the synchronous backend this runs
    /// inline from `recv_request`; an asynchronous backend would call it
    /// from its completion callback with the backend's return value.
    fn req_end(&mut self, t: &mut Transport, mem: &dyn GuestMemory, ret: io::Result<()>) {
        let pending = std::mem::replace(&mut self.pending, BlockPending::Idle);
        match pending {
            BlockPending::Idle => unreachable!("completion without a request in flight"),
            BlockPending::Read {
                queue_idx,
                head,
                mut buf,
            } => {
                let write_size = buf.len();
                buf[write_size - 1] = match ret {
                    Ok(()) => VIRTIO_BLK_S_OK,
                    Err(_) => VIRTIO_BLK_S_IOERR,
                };
                let _ = t.queue(queue_idx).copy_to(mem, head, 0, &buf);
                t.consume(mem, queue_idx, head, write_size as u32);
            }
            BlockPending::Status {
                queue_idx,
                head,
                unsupported,
            } => {
                let status = match (&ret, unsupported) {
                    (_, true) => VIRTIO_BLK_S_UNSUPP,
                    (Ok(()), _) => VIRTIO_BLK_S_OK,
                    (Err(_), _) => VIRTIO_BLK_S_IOERR,
                };
                let _ = t.queue(queue_idx).copy_to(mem, head, 0, &[status]);
                t.consume(mem, queue_idx, head, 1);
            }
        }
    }
}

impl VirtioBackend for Blk {
    fn device_id(&self) -> u32 {
        VIRTIO_BLK_DEVICE_ID
    }

    fn config_space(&self) -> Vec<u8> {
        // 8 bytes: capacity in 512-byte sectors, little-endian.
        self.backend.sector_count().to_le_bytes().to_vec()
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
        if !matches!(self.pending, BlockPending::Idle) {
            return -1;
        }

        let mut raw = [0u8; HEADER_SIZE];
        if t.queue(queue_idx).copy_from(mem, head, 0, &mut raw).is_err() {
            // Header unreadable: the chain cannot be parsed, leave it alone.
            return 0;
        }
        let req_type = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        let sector = u64::from_le_bytes(raw[8..16].try_into().unwrap());

        if write_size < 1 {
            warn!("virtio-blk: request without room for a status byte");
            return 0;
        }

        debug!("virtio-blk: type={req_type} sector={sector} read={read_size} write={write_size}");

        match req_type {
            VIRTIO_BLK_T_IN => {
                let mut buf = vec![0u8; write_size];
                let sectors = (write_size - 1) / SECTOR_SIZE;
                let ret = self
                    .backend
                    .read(sector, &mut buf[..sectors * SECTOR_SIZE]);
                self.pending = BlockPending::Read {
                    queue_idx,
                    head,
                    buf,
                };
                self.req_end(t, mem, ret);
            }
            VIRTIO_BLK_T_OUT => {
                let len = read_size.saturating_sub(HEADER_SIZE);
                let mut buf = vec![0u8; len];
                if t
                    .queue(queue_idx)
                    .copy_from(mem, head, HEADER_SIZE, &mut buf)
                    .is_err()
                {
                    return 0;
                }
                let sectors = len / SECTOR_SIZE;
                let ret = self.backend.write(sector, &buf[..sectors * SECTOR_SIZE]);
                self.pending = BlockPending::Status {
                    queue_idx,
                    head,
                    unsupported: false,
                };
                self.req_end(t, mem, ret);
            }
            VIRTIO_BLK_T_FLUSH | VIRTIO_BLK_T_FLUSH_OUT => {
                // The synchronous backend flushes on every write; report
                // success so the driver does not wait forever.
                self.pending = BlockPending::Status {
                    queue_idx,
                    head,
                    unsupported: false,
                };
                self.req_end(t, mem, Ok(()));
            }
            _ => {
                warn!("virtio-blk: unsupported request type {req_type}");
                self.pending = BlockPending::Status {
                    queue_idx,
                    head,
                    unsupported: true,
                };
                self.req_end(t, mem, Ok(()));
            }
        }
        0
    }

    fn reset(&mut self) {
        // Drop any in-flight slot so a guest reset during I/O cannot wedge
        // the next driver instance.
        self.pending = BlockPending::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtio::device::{
        Virtio, INTERRUPT_STATUS_OFFSET, QUEUE_AVAIL_LOW_OFFSET, QUEUE_DESC_LOW_OFFSET,
        QUEUE_NOTIFY_OFFSET, QUEUE_NUM_OFFSET, QUEUE_READY_OFFSET, QUEUE_SEL_OFFSET,
        QUEUE_USED_LOW_OFFSET,
    };
    use crate::virtio::queue::{VRING_DESC_F_NEXT, VRING_DESC_F_WRITE};
    use crate::virtio::testing::{
        push_avail, ram, used_elem, used_idx, write_desc, TestIntc, AVAIL, DATA, DESC, USED,
    };
    use std::io::Write as _;
    use std::rc::Rc;

    /// An 8-sector image where sector `s` is filled with byte `s + 1`.
    fn image() -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for s in 0u8..8 {
            f.write_all(&[s + 1; SECTOR_SIZE]).unwrap();
        }
        f.flush().unwrap();
        f
    }

    fn device(mode: DiskMode) -> (Virtio<Blk>, Rc<TestIntc>, tempfile::NamedTempFile) {
        let img = image();
        let disk = DiskImage::open(img.path(), mode).unwrap();
        let (intc, line) = TestIntc::line(1);
        (Virtio::new(Blk::new(Box::new(disk)), line), intc, img)
    }

    fn setup_queue(dev: &mut Virtio<Blk>, mem: &crate::mem::Dram) {
        let mut w32 = |offset: u32, val: u32| {
            assert!(dev.store(mem, offset as u64, &val.to_le_bytes()));
        };
        w32(QUEUE_SEL_OFFSET, 0);
        w32(QUEUE_NUM_OFFSET, 8);
        w32(QUEUE_DESC_LOW_OFFSET, DESC as u32);
        w32(QUEUE_AVAIL_LOW_OFFSET, AVAIL as u32);
        w32(QUEUE_USED_LOW_OFFSET, USED as u32);
        w32(QUEUE_READY_OFFSET, 1);
    }

    /// Lay out a three-descriptor request chain and publish it.
    fn push_request(mem: &crate::mem::Dram, req_type: u32, sector: u64, payload: Option<&[u8]>) {
        let mut header = Vec::new();
        header.extend_from_slice(&req_type.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&sector.to_le_bytes());
        mem.write(DATA, &header).unwrap();

        match payload {
            None => {
                // IN: header, 512-byte data sink, status byte.
                write_desc(mem, 0, DATA, 16, VRING_DESC_F_NEXT, 1);
                write_desc(
                    mem,
                    1,
                    DATA + 16,
                    512,
                    VRING_DESC_F_NEXT | VRING_DESC_F_WRITE,
                    2,
                );
                write_desc(mem, 2, DATA + 16 + 512, 1, VRING_DESC_F_WRITE, 0);
            }
            Some(data) => {
                // OUT: header + payload to read, status byte to write.
                mem.write(DATA + 16, data).unwrap();
                write_desc(mem, 0, DATA, 16 + data.len() as u32, VRING_DESC_F_NEXT, 1);
                write_desc(
                    mem,
                    1,
                    DATA + 16 + data.len() as u64,
                    1,
                    VRING_DESC_F_WRITE,
                    0,
                );
            }
        }
        push_avail(mem, 8, 0);
    }

    fn notify(dev: &mut Virtio<Blk>, mem: &crate::mem::Dram) {
        assert!(dev.store(mem, QUEUE_NOTIFY_OFFSET as u64, &0u32.to_le_bytes()));
    }

    #[test]
    fn config_space_reports_capacity() {
        let (dev, _, _img) = device(DiskMode::ReadWrite);
        let mut cap = [0u8; 8];
        assert!(dev.load(0x100, &mut cap));
        assert_eq!(u64::from_le_bytes(cap), 8);
    }

    #[test]
    fn read_sector_end_to_end() {
        let (mut dev, intc, _img) = device(DiskMode::ReadWrite);
        let mem = ram();
        setup_queue(&mut dev, &mem);
        push_request(&mem, VIRTIO_BLK_T_IN, 0, None);
        notify(&mut dev, &mem);

        let mut data = vec![0u8; 512];
        mem.read(DATA + 16, &mut data).unwrap();
        assert!(data.iter().all(|&b| b == 1));
        let mut status = [0xffu8];
        mem.read(DATA + 16 + 512, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_OK);

        assert_eq!(used_idx(&mem), 1);
        assert_eq!(used_elem(&mem, 8, 0), (0, 513));
        let mut ist = [0u8; 4];
        assert!(dev.load(INTERRUPT_STATUS_OFFSET as u64, &mut ist));
        assert_eq!(u32::from_le_bytes(ist), 1);
        assert_eq!(intc.level.get(), 1);
    }

    #[test]
    fn write_then_read_round_trips() {
        let (mut dev, _, _img) = device(DiskMode::ReadWrite);
        let mem = ram();
        setup_queue(&mut dev, &mem);

        let pattern = [0x5au8; SECTOR_SIZE];
        push_request(&mem, VIRTIO_BLK_T_OUT, 3, Some(&pattern));
        notify(&mut dev, &mem);
        assert_eq!(used_elem(&mem, 8, 0), (0, 1));
        let mut status = [0xffu8];
        mem.read(DATA + 16 + 512, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_OK);

        push_request(&mem, VIRTIO_BLK_T_IN, 3, None);
        notify(&mut dev, &mem);
        let mut data = vec![0u8; 512];
        mem.read(DATA + 16, &mut data).unwrap();
        assert_eq!(data, pattern);
    }

    #[test]
    fn read_only_write_reports_ioerr() {
        let (mut dev, _, img) = device(DiskMode::ReadOnly);
        let mem = ram();
        setup_queue(&mut dev, &mem);
        push_request(&mem, VIRTIO_BLK_T_OUT, 0, Some(&[0xaa; SECTOR_SIZE]));
        notify(&mut dev, &mem);

        let mut status = [0xffu8];
        mem.read(DATA + 16 + 512, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_IOERR);
        assert_eq!(std::fs::read(img.path()).unwrap()[..SECTOR_SIZE], [1u8; SECTOR_SIZE]);
    }

    #[test]
    fn snapshot_write_leaves_the_image_untouched() {
        let (mut dev, _, img) = device(DiskMode::Snapshot);
        let before = std::fs::read(img.path()).unwrap();
        let mem = ram();
        setup_queue(&mut dev, &mem);

        push_request(&mem, VIRTIO_BLK_T_OUT, 2, Some(&[0xaa; SECTOR_SIZE]));
        notify(&mut dev, &mem);
        let mut status = [0xffu8];
        mem.read(DATA + 16 + 512, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_OK);
        assert_eq!(std::fs::read(img.path()).unwrap(), before);

        // The overlay serves subsequent reads.
        push_request(&mem, VIRTIO_BLK_T_IN, 2, None);
        notify(&mut dev, &mem);
        let mut data = vec![0u8; 512];
        mem.read(DATA + 16, &mut data).unwrap();
        assert!(data.iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn snapshot_write_past_end_fails() {
        let img = image();
        let mut disk = DiskImage::open(img.path(), DiskMode::Snapshot).unwrap();
        assert!(disk.write(8, &[0u8; SECTOR_SIZE]).is_err());
        assert!(disk.write(7, &[0u8; SECTOR_SIZE]).is_ok());
    }

    #[test]
    fn flush_is_acknowledged() {
        let (mut dev, _, _img) = device(DiskMode::ReadWrite);
        let mem = ram();
        setup_queue(&mut dev, &mem);

        // FLUSH carries no payload: header plus status byte.
        let mut header = Vec::new();
        header.extend_from_slice(&VIRTIO_BLK_T_FLUSH.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&0u64.to_le_bytes());
        mem.write(DATA, &header).unwrap();
        write_desc(&mem, 0, DATA, 16, VRING_DESC_F_NEXT, 1);
        write_desc(&mem, 1, DATA + 16, 1, VRING_DESC_F_WRITE, 0);
        push_avail(&mem, 8, 0);
        notify(&mut dev, &mem);

        let mut status = [0xffu8];
        mem.read(DATA + 16, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_OK);
        assert_eq!(used_elem(&mem, 8, 0), (0, 1));
    }

    #[test]
    fn unknown_request_type_reports_unsupported() {
        let (mut dev, _, _img) = device(DiskMode::ReadWrite);
        let mem = ram();
        setup_queue(&mut dev, &mem);

        let mut header = Vec::new();
        header.extend_from_slice(&99u32.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&0u64.to_le_bytes());
        mem.write(DATA, &header).unwrap();
        write_desc(&mem, 0, DATA, 16, VRING_DESC_F_NEXT, 1);
        write_desc(&mem, 1, DATA + 16, 1, VRING_DESC_F_WRITE, 0);
        push_avail(&mem, 8, 0);
        notify(&mut dev, &mem);

        let mut status = [0xffu8];
        mem.read(DATA + 16, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_UNSUPP);
        assert_eq!(used_idx(&mem), 1);
    }

    #[test]
    fn read_past_capacity_reports_ioerr() {
        let (mut dev, _, _img) = device(DiskMode::ReadWrite);
        let mem = ram();
        setup_queue(&mut dev, &mem);
        push_request(&mem, VIRTIO_BLK_T_IN, 8, None);
        notify(&mut dev, &mem);
        let mut status = [0xffu8];
        mem.read(DATA + 16 + 512, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_IOERR);
    }
}
