//! Device-side VirtIO-MMIO emulation for a RISC-V instruction-set simulator.
//!
//! The simulator owns guest physical memory and an interrupt controller; this
//! crate supplies the devices that sit behind memory-mapped I/O regions:
//!
//! - a VirtIO block device backed by a host image file (read-only,
//!   read-write, or copy-on-write snapshot),
//! - a VirtIO 9P device exporting a host directory over 9P2000.L.
//!
//! Both ride the same VirtIO 1.x MMIO transport ("version 2" register
//! layout) and split-virtqueue engine in [`virtio`]. The host plugs in
//! through three seams: [`mem::GuestMemory`] for guest RAM access,
//! [`irq::InterruptController`] for the PLIC, and the MMIO `load`/`store`
//! handlers on [`virtio::Virtio`]. [`plugin`] builds devices from the
//! simulator's `key=value` option strings and emits the matching
//! device-tree fragments.

pub mod fs;
pub mod irq;
pub mod mem;
pub mod plugin;
pub mod virtio;
