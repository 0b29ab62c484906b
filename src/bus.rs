//! Bus-glue seam: register access and chipset quirks.
//!
//! The platform owns the I/O window and IRQ wiring; this crate only ever
//! touches the UHCI register block through [`RegisterIo`]. The platform's
//! interrupt handler calls [`crate::UhciHcd::handle_irq`].

use bitflags::bitflags;

bitflags! {
    /// Chipset-specific misbehavior reported by the bus glue.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Quirks: u32 {
        /// Resume-detect interrupts do not fire reliably; the root hub must be
        /// polled for port changes while suspended.
        const RESUME_DETECT_BROKEN = 1 << 0;
        /// Entering global suspend (EGSM) wedges the chipset; auto-stop only
        /// clears RS and leaves the suspend bit alone.
        const GLOBAL_SUSPEND_BROKEN = 1 << 1;
    }
}

/// Access to the controller's I/O register block.
pub trait RegisterIo {
    fn read16(&mut self, reg: u16) -> u16;
    fn write16(&mut self, reg: u16, value: u16);
    fn read32(&mut self, reg: u16) -> u32;
    fn write32(&mut self, reg: u16, value: u32);

    fn quirks(&self) -> Quirks {
        Quirks::empty()
    }
}
