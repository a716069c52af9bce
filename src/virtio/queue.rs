//! Split-virtqueue engine.
//!
//! One request is one descriptor chain: a read-only prefix the device
//! gathers its inputs from, then a write-only suffix it scatters outputs
//! into. The engine walks chains in guest memory, sizes the two spans,
//! copies payload across descriptor boundaries and publishes completions
//! on the used ring.
//!
//! Ring layout (all little-endian, `num` descriptors):
//!
//! ```text
//! desc_addr:  num x {addr: u64, len: u32, flags: u16, next: u16}
//! avail_addr: flags u16, idx u16, ring[num] u16, used_event u16
//! used_addr:  flags u16, idx u16, ring[num] x {id: u32, len: u32}, avail_event u16
//! ```

use log::warn;
use thiserror::Error;

use crate::mem::GuestMemory;

pub const VRING_DESC_F_NEXT: u16 = 1;
pub const VRING_DESC_F_WRITE: u16 = 2;
pub const VRING_DESC_F_INDIRECT: u16 = 4;

/// Default and maximum ring size a queue accepts.
pub const MAX_QUEUE_NUM: u32 = 16;

/// Transfers are chunked so no single guest-memory access spans a page.
const PAGE_SIZE: u64 = 4096;

/// Descriptor-chain protocol errors.
///
/// These are guest driver bugs, not host faults: the offending chain is
/// skipped (or the request aborted) and the device keeps running.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("descriptor memory unreadable at {0:#x}")]
    BadDescriptor(u64),
    #[error("write descriptor followed by a read descriptor")]
    FlagOrder,
    #[error("chain ended while more data was expected")]
    MissingNext,
    #[error("indirect descriptors are not supported")]
    Indirect,
    #[error("descriptor chain does not terminate")]
    Loop,
}

/// A descriptor as it sits in guest memory (16 bytes).
#[derive(Debug, Clone, Copy)]
pub struct Desc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Desc {
    pub const SIZE: u64 = 16;

    fn has_next(&self) -> bool {
        self.flags & VRING_DESC_F_NEXT != 0
    }

    fn device_writes(&self) -> bool {
        self.flags & VRING_DESC_F_WRITE != 0
    }
}

/// Which way a payload transfer moves relative to guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    /// Gather: guest RAM (read-only descriptors) into a device buffer.
    FromQueue,
    /// Scatter: a device buffer into guest RAM (write-only descriptors).
    ToQueue,
}

/// Per-queue transport state. Ring addresses are guest physical; the
/// 16-bit `last_avail_idx` wraps and is compared modulo 2^16.
#[derive(Debug, Default, Clone)]
pub struct QueueState {
    pub ready: u32,
    pub num: u32,
    pub last_avail_idx: u16,
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
    /// When set, `queue_notify` is a no-op: the device drives reception
    /// from outside the notify path.
    pub manual_recv: bool,
}

impl QueueState {
    pub fn reset(&mut self) {
        self.ready = 0;
        self.num = MAX_QUEUE_NUM;
        self.last_avail_idx = 0;
        self.desc_addr = 0;
        self.avail_addr = 0;
        self.used_addr = 0;
    }

    /// Fetch the descriptor at `idx` from the descriptor table.
    pub fn desc(&self, mem: &dyn GuestMemory, idx: u16) -> Result<Desc, QueueError> {
        let addr = self.desc_addr + u64::from(idx) * Desc::SIZE;
        let mut raw = [0u8; Desc::SIZE as usize];
        copy_from_ram(mem, addr, &mut raw).map_err(|_| QueueError::BadDescriptor(addr))?;
        let desc = Desc {
            addr: u64::from_le_bytes(raw[0..8].try_into().unwrap()),
            len: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            flags: u16::from_le_bytes(raw[12..14].try_into().unwrap()),
            next: u16::from_le_bytes(raw[14..16].try_into().unwrap()),
        };
        if desc.flags & VRING_DESC_F_INDIRECT != 0 {
            return Err(QueueError::Indirect);
        }
        Ok(desc)
    }

    /// Walk the chain at `head` and size its two spans: total bytes the
    /// device may read, then total bytes it may write. A write descriptor
    /// followed by a read descriptor violates the chain grammar.
    pub fn rw_size(&self, mem: &dyn GuestMemory, head: u16) -> Result<(usize, usize), QueueError> {
        let mut read_size = 0usize;
        let mut write_size = 0usize;
        let mut steps = 0u32;
        let mut idx = head;
        let mut desc = self.desc(mem, idx)?;

        loop {
            if desc.device_writes() {
                break;
            }
            read_size += desc.len as usize;
            if !desc.has_next() {
                return Ok((read_size, write_size));
            }
            idx = desc.next;
            desc = self.desc(mem, idx)?;
            steps += 1;
            if steps > self.num {
                return Err(QueueError::Loop);
            }
        }

        loop {
            if !desc.device_writes() {
                return Err(QueueError::FlagOrder);
            }
            write_size += desc.len as usize;
            if !desc.has_next() {
                break;
            }
            idx = desc.next;
            desc = self.desc(mem, idx)?;
            steps += 1;
            if steps > self.num {
                return Err(QueueError::Loop);
            }
        }

        Ok((read_size, write_size))
    }

    /// Gather `buf.len()` bytes from the chain's read-only span, starting
    /// `offset` bytes into it.
    pub fn copy_from(
        &self,
        mem: &dyn GuestMemory,
        head: u16,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), QueueError> {
        let count = buf.len();
        self.transfer(mem, head, offset, count, Dir::FromQueue, |addr, done, l| {
            copy_from_ram(mem, addr, &mut buf[done..done + l])
        })
    }

    /// Scatter `data` into the chain's write-only span, starting `offset`
    /// bytes into it.
    pub fn copy_to(
        &self,
        mem: &dyn GuestMemory,
        head: u16,
        offset: usize,
        data: &[u8],
    ) -> Result<(), QueueError> {
        self.transfer(mem, head, offset, data.len(), Dir::ToQueue, |addr, done, l| {
            copy_to_ram(mem, addr, &data[done..done + l])
        })
    }

    /// Walk the chain and apply `copy` to each descriptor-sized piece of
    /// the transfer. `copy` receives the guest address and the range of the
    /// device buffer it covers.
    fn transfer(
        &self,
        mem: &dyn GuestMemory,
        head: u16,
        mut offset: usize,
        mut count: usize,
        dir: Dir,
        mut copy: impl FnMut(u64, usize, usize) -> Result<(), crate::mem::MemoryError>,
    ) -> Result<(), QueueError> {
        if count == 0 {
            return Ok(());
        }

        let want_write = dir == Dir::ToQueue;
        let mut steps = 0u32;
        let mut idx = head;
        let mut desc = self.desc(mem, idx)?;

        // Scatter targets start past the read-only prefix.
        if want_write {
            while !desc.device_writes() {
                if !desc.has_next() {
                    return Err(QueueError::MissingNext);
                }
                idx = desc.next;
                desc = self.desc(mem, idx)?;
                steps += 1;
                if steps > self.num {
                    return Err(QueueError::Loop);
                }
            }
        }

        // Skip whole descriptors covered by the offset.
        loop {
            if desc.device_writes() != want_write {
                return Err(QueueError::FlagOrder);
            }
            if offset < desc.len as usize {
                break;
            }
            if !desc.has_next() {
                return Err(QueueError::MissingNext);
            }
            offset -= desc.len as usize;
            idx = desc.next;
            desc = self.desc(mem, idx)?;
            steps += 1;
            if steps > self.num {
                return Err(QueueError::Loop);
            }
        }

        let mut done = 0usize;
        loop {
            let l = count.min(desc.len as usize - offset);
            let addr = desc.addr + offset as u64;
            copy(addr, done, l).map_err(|_| QueueError::BadDescriptor(addr))?;
            count -= l;
            if count == 0 {
                return Ok(());
            }
            done += l;
            offset += l;
            if offset == desc.len as usize {
                if !desc.has_next() {
                    return Err(QueueError::MissingNext);
                }
                idx = desc.next;
                desc = self.desc(mem, idx)?;
                // Never cross the read/write boundary mid-transfer.
                if desc.device_writes() != want_write {
                    return Err(QueueError::FlagOrder);
                }
                offset = 0;
                steps += 1;
                if steps > self.num {
                    return Err(QueueError::Loop);
                }
            }
        }
    }

    /// Publish a completed chain on the used ring. The element is written
    /// before the index advances so the guest driver never observes a slot
    /// it cannot read (the memory-ordering half of that contract belongs to
    /// the host's guest-memory implementation).
    pub fn push_used(&self, mem: &dyn GuestMemory, head: u16, written_len: u32) {
        let idx_addr = self.used_addr + 2;
        let idx = ring_read16(mem, idx_addr);
        let slot = u64::from(idx & (self.num as u16 - 1));
        let elem = self.used_addr + 4 + slot * 8;
        ring_write32(mem, elem, u32::from(head));
        ring_write32(mem, elem + 4, written_len);
        ring_write16(mem, idx_addr, idx.wrapping_add(1));
    }

    /// The driver's current available index.
    pub fn avail_idx(&self, mem: &dyn GuestMemory) -> u16 {
        ring_read16(mem, self.avail_addr + 2)
    }

    /// The chain head published in available-ring slot `slot`.
    pub fn avail_head(&self, mem: &dyn GuestMemory, slot: u16) -> u16 {
        ring_read16(
            mem,
            self.avail_addr + 4 + u64::from(slot & (self.num as u16 - 1)) * 2,
        )
    }
}

/// 16-bit ring-word read. A misaligned or out-of-range ring word (both are
/// guest driver bugs: the addresses come straight from the QUEUE_* address
/// registers) is refused: the read yields 0, the fault is logged and never
/// raised further, so a broken driver simply makes no progress.
pub fn ring_read16(mem: &dyn GuestMemory, addr: u64) -> u16 {
    match mem.load_u16(addr) {
        Ok(val) => val,
        Err(err) => {
            warn!("virtio: ring word read refused: {err}");
            0
        }
    }
}

/// Ring-word writes drop the store on the same faults `ring_read16`
/// refuses.
fn ring_write16(mem: &dyn GuestMemory, addr: u64, val: u16) {
    if let Err(err) = mem.store_u16(addr, val) {
        warn!("virtio: ring word write dropped: {err}");
    }
}

fn ring_write32(mem: &dyn GuestMemory, addr: u64, val: u32) {
    if let Err(err) = mem.store_u32(addr, val) {
        warn!("virtio: ring word write dropped: {err}");
    }
}

fn copy_from_ram(
    mem: &dyn GuestMemory,
    mut addr: u64,
    buf: &mut [u8],
) -> Result<(), crate::mem::MemoryError> {
    let mut done = 0usize;
    while done < buf.len() {
        let l = (buf.len() - done).min((PAGE_SIZE - (addr & (PAGE_SIZE - 1))) as usize);
        mem.read(addr, &mut buf[done..done + l])?;
        addr += l as u64;
        done += l;
    }
    Ok(())
}

fn copy_to_ram(
    mem: &dyn GuestMemory,
    mut addr: u64,
    data: &[u8],
) -> Result<(), crate::mem::MemoryError> {
    let mut done = 0usize;
    while done < data.len() {
        let l = (data.len() - done).min((PAGE_SIZE - (addr & (PAGE_SIZE - 1))) as usize);
        mem.write(addr, &data[done..done + l])?;
        addr += l as u64;
        done += l;
    }
    Ok(())
}
