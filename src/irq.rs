//! Interrupt plumbing between devices and the simulator's PLIC.

use std::rc::Rc;

/// The simulator's interrupt controller, addressed by IRQ number.
///
/// Lines are level-sensitive; `level` is 0 or 1 and the controller is
/// expected to latch the last value written.
pub trait InterruptController {
    fn set_interrupt_level(&self, id: u32, level: u32);
}

/// A single interrupt line: a controller slot plus a fixed IRQ number
/// chosen at device construction. No queueing, no edge synthesis.
#[derive(Clone)]
pub struct IrqLine {
    intc: Rc<dyn InterruptController>,
    irq: u32,
}

impl std::fmt::Debug for IrqLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrqLine").field("irq", &self.irq).finish()
    }
}

impl IrqLine {
    pub fn new(intc: Rc<dyn InterruptController>, irq: u32) -> Self {
        Self { intc, irq }
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    pub fn set(&self, level: u32) {
        self.intc.set_interrupt_level(self.irq, level);
    }
}

/// Controller that drops every level change. For hosts that poll
/// `INTERRUPT_STATUS` instead of wiring a PLIC, and for tests.
pub struct NullIntc;

impl InterruptController for NullIntc {
    fn set_interrupt_level(&self, _id: u32, _level: u32) {}
}
