//! UHCI (USB 1.1) host-controller driver core.
//!
//! This crate owns everything between an upstream USB stack and a UHCI
//! register block: the DMA descriptor pool, the skeleton schedule behind the
//! 1024-entry frame list, periodic bandwidth admission, TD chain construction
//! for all four transfer types, the completion scanner with its queue-repair
//! machinery, full-speed bandwidth reclamation and the root-hub power state
//! machine.
//!
//! The platform supplies the seams: [`MemoryBus`] for DMA-visible memory,
//! [`RegisterIo`] for the I/O window (plus chipset [`Quirks`]), a
//! [`CompletionHandler`] for givebacks, and a millisecond clock passed into
//! [`UhciHcd::poll`] / [`UhciHcd::handle_irq`]. The driver never sleeps and
//! never reads a wall clock itself.
//!
//! ```no_run
//! use uhci_hcd::{HcdConfig, UhciHcd};
//! # struct Ram(Vec<u8>);
//! # impl uhci_hcd::MemoryBus for Ram {
//! #     fn read_physical(&mut self, paddr: u32, buf: &mut [u8]) {
//! #         let at = paddr as usize;
//! #         buf.copy_from_slice(&self.0[at..at + buf.len()]);
//! #     }
//! #     fn write_physical(&mut self, paddr: u32, buf: &[u8]) {
//! #         let at = paddr as usize;
//! #         self.0[at..at + buf.len()].copy_from_slice(buf);
//! #     }
//! # }
//! # struct Pio;
//! # impl uhci_hcd::RegisterIo for Pio {
//! #     fn read16(&mut self, _reg: u16) -> u16 { 0 }
//! #     fn write16(&mut self, _reg: u16, _value: u16) {}
//! #     fn read32(&mut self, _reg: u16) -> u32 { 0 }
//! #     fn write32(&mut self, _reg: u16, _value: u32) {}
//! # }
//! let (mem, io) = (Ram(vec![0; 0x20_0000]), Pio);
//! let mut hcd = UhciHcd::new(mem, io, HcdConfig {
//!     frame_list_base: 0x10_0000,
//!     pool_base: 0x10_1000,
//!     qh_slots: 64,
//!     td_slots: 512,
//! });
//! hcd.start(0).unwrap();
//! ```

mod bandwidth;
mod bus;
mod error;
mod hcd;
mod hw;
mod mem;
mod pool;
mod qh;
pub mod regs;
mod root_hub;
mod scan;
mod sched;
mod submit;
mod transfer;

pub use bandwidth::{FRAME_BUDGET_US, MAX_PHASE};
pub use bus::{Quirks, RegisterIo};
pub use error::{HcdError, Result};
pub use hcd::{HcdConfig, UhciHcd};
pub use mem::MemoryBus;
pub use qh::QueueState;
pub use root_hub::{PortChange, RhState, AUTOSTOP_DELAY_MS, PORT_RESET_MS, PORT_RESUME_MS};
pub use transfer::{
    Completion, CompletionHandler, Direction, EndpointAddr, IsoPacket, IsoPacketResult,
    TransferFlags, TransferId, TransferKind, TransferRequest, TransferStatus, UsbSpeed,
};
