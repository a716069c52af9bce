//! VirtIO-MMIO transport core ("version 2" register layout).
//!
//! [`Transport`] owns the state every VirtIO device shares: the register
//! file, feature/status negotiation, interrupt status and up to eight
//! queues. A concrete device supplies the [`VirtioBackend`] half and the
//! pair is driven through [`Virtio`], whose `load`/`store` methods are what
//! the simulator wires into the device's 4 KiB MMIO window.

use log::warn;

use crate::irq::IrqLine;
use crate::mem::GuestMemory;

use super::queue::{QueueState, MAX_QUEUE_NUM};

// MMIO register values expected by VirtIO 1.x guest drivers.
pub const MAGIC_VALUE: u32 = 0x7472_6976; // "virt"
pub const MMIO_VERSION: u32 = 2;
pub const VENDOR_ID: u32 = 0xffff;

// Common MMIO register offsets
pub const MAGIC_VALUE_OFFSET: u32 = 0x000;
pub const VERSION_OFFSET: u32 = 0x004;
pub const DEVICE_ID_OFFSET: u32 = 0x008;
pub const VENDOR_ID_OFFSET: u32 = 0x00c;
pub const DEVICE_FEATURES_OFFSET: u32 = 0x010;
pub const DEVICE_FEATURES_SEL_OFFSET: u32 = 0x014;
pub const QUEUE_SEL_OFFSET: u32 = 0x030;
pub const QUEUE_NUM_MAX_OFFSET: u32 = 0x034;
pub const QUEUE_NUM_OFFSET: u32 = 0x038;
pub const QUEUE_READY_OFFSET: u32 = 0x044;
pub const QUEUE_NOTIFY_OFFSET: u32 = 0x050;
pub const INTERRUPT_STATUS_OFFSET: u32 = 0x060;
pub const INTERRUPT_ACK_OFFSET: u32 = 0x064;
pub const STATUS_OFFSET: u32 = 0x070;
pub const QUEUE_DESC_LOW_OFFSET: u32 = 0x080;
pub const QUEUE_DESC_HIGH_OFFSET: u32 = 0x084;
pub const QUEUE_AVAIL_LOW_OFFSET: u32 = 0x090;
pub const QUEUE_AVAIL_HIGH_OFFSET: u32 = 0x094;
pub const QUEUE_USED_LOW_OFFSET: u32 = 0x0a0;
pub const QUEUE_USED_HIGH_OFFSET: u32 = 0x0a4;
pub const CONFIG_GENERATION_OFFSET: u32 = 0x0fc;
pub const CONFIG_SPACE_OFFSET: u32 = 0x100;

// Device IDs
pub const VIRTIO_BLK_DEVICE_ID: u32 = 2;
pub const VIRTIO_9P_DEVICE_ID: u32 = 9;

/// Queues per device.
pub const MAX_QUEUE: usize = 8;
/// Device-specific configuration space limit, in bytes.
pub const MAX_CONFIG_SPACE_SIZE: usize = 256;

/// `INTERRUPT_STATUS` bit: a buffer was placed on a used ring.
pub const INT_USED_BUFFER: u32 = 1;
/// `INTERRUPT_STATUS` bit: the configuration space changed.
pub const INT_CONFIG_CHANGE: u32 = 2;

/// The device-specific half of a VirtIO device.
///
/// The transport calls `recv_request` once per available descriptor chain.
/// Returning a negative value stalls the drain loop: the backend has
/// claimed a request slot and will restart delivery itself (by way of
/// [`Virtio::queue_notify`]) once the slot frees up. Returning zero lets
/// the loop advance whether or not the chain was consumed.
pub trait VirtioBackend {
    fn device_id(&self) -> u32;

    /// Low half of the device feature bitmap. Half 1 always reads as 1
    /// (VIRTIO_F_VERSION_1) at the transport level.
    fn device_features(&self) -> u32 {
        0
    }

    /// Initial contents of the configuration space (at most
    /// [`MAX_CONFIG_SPACE_SIZE`] bytes).
    fn config_space(&self) -> Vec<u8>;

    fn recv_request(
        &mut self,
        transport: &mut Transport,
        mem: &dyn GuestMemory,
        queue_idx: usize,
        head: u16,
        read_size: usize,
        write_size: usize,
    ) -> i32;

    /// Invoked after the guest writes configuration-space bytes.
    fn config_write(&mut self, _config: &[u8]) {}

    /// Invoked on device reset. Backends drop any in-flight request slot
    /// here so a guest reset during I/O cannot leak it.
    fn reset(&mut self) {}
}

/// Transport state shared by all VirtIO devices.
///
/// Owned by the single simulator thread that performs MMIO; device
/// callbacks run synchronously inside that thread, so no locking exists at
/// this layer.
#[derive(Debug)]
pub struct Transport {
    irq: IrqLine,
    device_id: u32,
    device_features: u32,
    status: u32,
    int_status: u32,
    device_features_sel: u32,
    queue_sel: u32,
    queues: [QueueState; MAX_QUEUE],
    config: Vec<u8>,
}

impl Transport {
    fn new(irq: IrqLine, device_id: u32, device_features: u32, config: Vec<u8>) -> Self {
        assert!(
            config.len() <= MAX_CONFIG_SPACE_SIZE,
            "config space exceeds {MAX_CONFIG_SPACE_SIZE} bytes"
        );
        let mut t = Self {
            irq,
            device_id,
            device_features,
            status: 0,
            int_status: 0,
            device_features_sel: 0,
            queue_sel: 0,
            queues: Default::default(),
            config,
        };
        t.reset();
        t
    }

    fn reset(&mut self) {
        self.status = 0;
        self.queue_sel = 0;
        self.device_features_sel = 0;
        self.int_status = 0;
        for qs in &mut self.queues {
            qs.reset();
        }
    }

    pub fn queue(&self, idx: usize) -> &QueueState {
        &self.queues[idx]
    }

    pub fn queue_mut(&mut self, idx: usize) -> &mut QueueState {
        &mut self.queues[idx]
    }

    pub fn config(&self) -> &[u8] {
        &self.config
    }

    pub fn int_status(&self) -> u32 {
        self.int_status
    }

    /// Publish a consumed chain on the used ring, then latch the
    /// used-buffer interrupt and raise the line.
    pub fn consume(&mut self, mem: &dyn GuestMemory, queue_idx: usize, head: u16, len: u32) {
        self.queues[queue_idx].push_used(mem, head, len);
        self.int_status |= INT_USED_BUFFER;
        self.irq.set(1);
    }

    /// Signal a configuration-space change to the guest.
    pub fn config_change(&mut self) {
        self.int_status |= INT_CONFIG_CHANGE;
        self.irq.set(1);
    }
}

/// A complete VirtIO-MMIO device: shared transport plus a backend.
#[derive(Debug)]
pub struct Virtio<B: VirtioBackend> {
    pub(crate) t: Transport,
    pub(crate) backend: B,
}

impl<B: VirtioBackend> Virtio<B> {
    pub fn new(backend: B, irq: IrqLine) -> Self {
        let t = Transport::new(
            irq,
            backend.device_id(),
            backend.device_features(),
            backend.config_space(),
        );
        Self { t, backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn transport(&self) -> &Transport {
        &self.t
    }

    /// Full device reset, as triggered by a guest `STATUS = 0` write.
    pub fn reset(&mut self) {
        self.t.irq.set(0);
        self.t.reset();
        self.backend.reset();
    }

    /// Simulator-facing MMIO load handler. `offset` is relative to the
    /// device's 4 KiB window; accepted access widths are 1, 2, 4 and 8
    /// bytes (8-byte accesses split into low and high words).
    pub fn load(&self, offset: u64, data: &mut [u8]) -> bool {
        let offset = offset as u32;
        match data.len() {
            1 => data[0] = self.mmio_read(offset, 0) as u8,
            2 => data.copy_from_slice(&(self.mmio_read(offset, 1) as u16).to_le_bytes()),
            4 => data.copy_from_slice(&self.mmio_read(offset, 2).to_le_bytes()),
            8 => {
                let lo = self.mmio_read(offset, 2) as u64;
                let hi = self.mmio_read(offset + 4, 2) as u64;
                data.copy_from_slice(&(lo | (hi << 32)).to_le_bytes());
            }
            _ => return false,
        }
        true
    }

    /// Simulator-facing MMIO store handler.
    pub fn store(&mut self, mem: &dyn GuestMemory, offset: u64, data: &[u8]) -> bool {
        let offset = offset as u32;
        match data.len() {
            1 => self.mmio_write(mem, offset, u32::from(data[0]), 0),
            2 => self.mmio_write(
                mem,
                offset,
                u32::from(u16::from_le_bytes(data.try_into().unwrap())),
                1,
            ),
            4 => self.mmio_write(mem, offset, u32::from_le_bytes(data.try_into().unwrap()), 2),
            8 => {
                let val = u64::from_le_bytes(data.try_into().unwrap());
                self.mmio_write(mem, offset, val as u32, 2);
                self.mmio_write(mem, offset + 4, (val >> 32) as u32, 2);
            }
            _ => return false,
        }
        true
    }

    pub fn mmio_read(&self, offset: u32, size_log2: u32) -> u32 {
        if offset >= CONFIG_SPACE_OFFSET {
            return self.config_read(offset - CONFIG_SPACE_OFFSET, size_log2);
        }

        // Non-config registers are 32-bit only; sub-word or misaligned
        // access reads as zero.
        if size_log2 != 2 || offset & 3 != 0 {
            warn!(
                "virtio{}: {}-byte read of register {offset:#x} ignored",
                self.t.device_id,
                1u32 << size_log2
            );
            return 0;
        }

        let qs = &self.t.queues[self.t.queue_sel as usize];
        match offset {
            MAGIC_VALUE_OFFSET => MAGIC_VALUE,
            VERSION_OFFSET => MMIO_VERSION,
            DEVICE_ID_OFFSET => self.t.device_id,
            VENDOR_ID_OFFSET => VENDOR_ID,
            DEVICE_FEATURES_OFFSET => match self.t.device_features_sel {
                0 => self.t.device_features,
                1 => 1, // VIRTIO_F_VERSION_1
                _ => 0,
            },
            DEVICE_FEATURES_SEL_OFFSET => self.t.device_features_sel,
            QUEUE_SEL_OFFSET => self.t.queue_sel,
            QUEUE_NUM_MAX_OFFSET => MAX_QUEUE_NUM,
            QUEUE_NUM_OFFSET => qs.num,
            QUEUE_READY_OFFSET => qs.ready,
            QUEUE_DESC_LOW_OFFSET => qs.desc_addr as u32,
            QUEUE_DESC_HIGH_OFFSET => (qs.desc_addr >> 32) as u32,
            QUEUE_AVAIL_LOW_OFFSET => qs.avail_addr as u32,
            QUEUE_AVAIL_HIGH_OFFSET => (qs.avail_addr >> 32) as u32,
            QUEUE_USED_LOW_OFFSET => qs.used_addr as u32,
            QUEUE_USED_HIGH_OFFSET => (qs.used_addr >> 32) as u32,
            INTERRUPT_STATUS_OFFSET => self.t.int_status,
            STATUS_OFFSET => self.t.status,
            CONFIG_GENERATION_OFFSET => 0,
            _ => 0,
        }
    }

    pub fn mmio_write(&mut self, mem: &dyn GuestMemory, offset: u32, val: u32, size_log2: u32) {
        if offset >= CONFIG_SPACE_OFFSET {
            self.config_write(offset - CONFIG_SPACE_OFFSET, val, size_log2);
            return;
        }

        if size_log2 != 2 || offset & 3 != 0 {
            warn!(
                "virtio{}: {}-byte write of register {offset:#x} ignored",
                self.t.device_id,
                1u32 << size_log2
            );
            return;
        }

        let sel = self.t.queue_sel as usize;
        match offset {
            DEVICE_FEATURES_SEL_OFFSET => self.t.device_features_sel = val,
            QUEUE_SEL_OFFSET => {
                if (val as usize) < MAX_QUEUE {
                    self.t.queue_sel = val;
                }
            }
            QUEUE_NUM_OFFSET => {
                if val.is_power_of_two() && val <= MAX_QUEUE_NUM {
                    self.t.queues[sel].num = val;
                }
            }
            QUEUE_DESC_LOW_OFFSET => set_low32(&mut self.t.queues[sel].desc_addr, val),
            QUEUE_DESC_HIGH_OFFSET => set_high32(&mut self.t.queues[sel].desc_addr, val),
            QUEUE_AVAIL_LOW_OFFSET => set_low32(&mut self.t.queues[sel].avail_addr, val),
            QUEUE_AVAIL_HIGH_OFFSET => set_high32(&mut self.t.queues[sel].avail_addr, val),
            QUEUE_USED_LOW_OFFSET => set_low32(&mut self.t.queues[sel].used_addr, val),
            QUEUE_USED_HIGH_OFFSET => set_high32(&mut self.t.queues[sel].used_addr, val),
            STATUS_OFFSET => {
                self.t.status = val;
                if val == 0 {
                    self.reset();
                }
            }
            QUEUE_READY_OFFSET => self.t.queues[sel].ready = val & 1,
            QUEUE_NOTIFY_OFFSET => {
                if (val as usize) < MAX_QUEUE {
                    self.queue_notify(mem, val as usize);
                }
            }
            INTERRUPT_ACK_OFFSET => {
                self.t.int_status &= !val;
                if self.t.int_status == 0 {
                    self.t.irq.set(0);
                }
            }
            _ => {}
        }
    }

    /// Drain the queue's available ring, handing each chain to the backend.
    ///
    /// Stops early when the backend stalls (negative return); the backend
    /// re-enters here from its completion path. Chains whose sizing fails
    /// are skipped without being consumed, so a driver bug shows up as a
    /// hung request rather than a corrupted ring.
    pub fn queue_notify(&mut self, mem: &dyn GuestMemory, queue_idx: usize) {
        if queue_idx >= MAX_QUEUE {
            return;
        }
        if self.t.queues[queue_idx].manual_recv || self.t.queues[queue_idx].ready == 0 {
            return;
        }

        let avail_idx = self.t.queues[queue_idx].avail_idx(mem);
        while self.t.queues[queue_idx].last_avail_idx != avail_idx {
            let qs = &self.t.queues[queue_idx];
            let head = qs.avail_head(mem, qs.last_avail_idx);
            match qs.rw_size(mem, head) {
                Ok((read_size, write_size)) => {
                    if self
                        .backend
                        .recv_request(&mut self.t, mem, queue_idx, head, read_size, write_size)
                        < 0
                    {
                        return;
                    }
                }
                Err(err) => {
                    warn!(
                        "virtio{}: skipping malformed chain at head {head}: {err}",
                        self.t.device_id
                    );
                }
            }
            let qs = &mut self.t.queues[queue_idx];
            qs.last_avail_idx = qs.last_avail_idx.wrapping_add(1);
        }
    }

    fn config_read(&self, offset: u32, size_log2: u32) -> u32 {
        let cfg = &self.t.config;
        let off = offset as usize;
        let width = 1usize << size_log2;
        if off.checked_add(width).map_or(true, |end| end > cfg.len()) {
            return 0;
        }
        match size_log2 {
            0 => u32::from(cfg[off]),
            1 => u32::from(u16::from_le_bytes(cfg[off..off + 2].try_into().unwrap())),
            2 => u32::from_le_bytes(cfg[off..off + 4].try_into().unwrap()),
            _ => unreachable!("invalid config-space access size"),
        }
    }

    fn config_write(&mut self, offset: u32, val: u32, size_log2: u32) {
        let off = offset as usize;
        let width = 1usize << size_log2;
        if off.checked_add(width).map_or(true, |end| end > self.t.config.len()) {
            return;
        }
        match size_log2 {
            0 => self.t.config[off] = val as u8,
            1 => self.t.config[off..off + 2].copy_from_slice(&(val as u16).to_le_bytes()),
            2 => self.t.config[off..off + 4].copy_from_slice(&val.to_le_bytes()),
            _ => unreachable!("invalid config-space access size"),
        }
        self.backend.config_write(&self.t.config);
    }
}

fn set_low32(paddr: &mut u64, val: u32) {
    *paddr = (*paddr & !0xffff_ffff) | u64::from(val);
}

fn set_high32(paddr: &mut u64, val: u32) {
    *paddr = (*paddr & 0xffff_ffff) | (u64::from(val) << 32);
}
