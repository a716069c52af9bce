pub mod blk;
pub mod device;
pub mod p9;
pub mod queue;

// Re-export common types for convenience
pub use blk::{Blk, BlockBackend, DiskImage, DiskMode};
pub use device::{Transport, Virtio, VirtioBackend};
pub use p9::NineP;
pub use queue::{QueueError, QueueState};

/// Shared ring-building helpers for transport and device tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::irq::{InterruptController, IrqLine};
    use crate::mem::{Dram, GuestMemory};

    pub const DESC: u64 = 0x100;
    pub const AVAIL: u64 = 0x300;
    pub const USED: u64 = 0x400;
    pub const DATA: u64 = 0x1000;

    pub fn ram() -> Dram {
        Dram::new(0, 64 * 1024)
    }

    /// Interrupt controller that records the last level per line.
    pub struct TestIntc {
        pub level: Cell<u32>,
    }

    impl TestIntc {
        pub fn line(irq: u32) -> (Rc<TestIntc>, IrqLine) {
            let intc = Rc::new(TestIntc { level: Cell::new(0) });
            let line = IrqLine::new(intc.clone(), irq);
            (intc, line)
        }
    }

    impl InterruptController for TestIntc {
        fn set_interrupt_level(&self, _id: u32, level: u32) {
            self.level.set(level);
        }
    }

    pub fn write_desc(mem: &Dram, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let base = DESC + u64::from(idx) * 16;
        mem.store_u64(base, addr).unwrap();
        mem.store_u32(base + 8, len).unwrap();
        mem.store_u16(base + 12, flags).unwrap();
        mem.store_u16(base + 14, next).unwrap();
    }

    /// Publish `head` in the next available-ring slot and bump the index.
    pub fn push_avail(mem: &Dram, num: u32, head: u16) {
        let idx = mem.load_u16(AVAIL + 2).unwrap();
        let slot = u64::from(idx & (num as u16 - 1));
        mem.store_u16(AVAIL + 4 + slot * 2, head).unwrap();
        mem.store_u16(AVAIL + 2, idx.wrapping_add(1)).unwrap();
    }

    pub fn used_idx(mem: &Dram) -> u16 {
        mem.load_u16(USED + 2).unwrap()
    }

    pub fn used_elem(mem: &Dram, num: u32, slot: u16) -> (u32, u32) {
        let base = USED + 4 + u64::from(slot & (num as u16 - 1)) * 8;
        (
            mem.load_u32(base).unwrap(),
            mem.load_u32(base + 4).unwrap(),
        )
    }
}
