//! Upstream-facing transfer request and completion types.
//!
//! The USB core hands this crate fully prepared requests: endpoint address,
//! device speed, a pre-mapped DMA buffer, and (for control) the DMA address of
//! the 8-byte setup packet. Completions travel back through
//! [`CompletionHandler`]; submission-time failures are synchronous
//! [`crate::HcdError`] values and never reach the handler.

use bitflags::bitflags;

use crate::hw;

/// Identifies one submitted transfer until its completion callback returns.
pub type TransferId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbSpeed {
    Low,
    Full,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TransferFlags: u32 {
        /// A short IN transfer is a normal completion, not an error.
        const SHORT_OK = 1 << 0;
        /// Terminate an exact-multiple OUT transfer with a zero-length packet.
        const ZERO_PACKET = 1 << 1;
        /// Never enter full-speed bandwidth reclamation for this transfer.
        const NO_FSBR = 1 << 2;
        /// Isochronous: schedule at the earliest available frame instead of
        /// the caller-provided start frame.
        const ISO_ASAP = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EndpointAddr {
    pub device: u8,
    pub endpoint: u8,
    pub direction: Direction,
}

/// One packet of an isochronous request.
#[derive(Clone, Copy, Debug)]
pub struct IsoPacket {
    /// Byte offset into the request's DMA buffer.
    pub offset: u32,
    pub length: u16,
}

#[derive(Clone, Debug)]
pub enum TransferKind {
    /// `setup_dma` points at the pre-mapped 8-byte setup packet; the data
    /// stage (if `length > 0`) uses the request buffer.
    Control { setup_dma: u32 },
    Bulk,
    /// `interval` is the requested polling interval in frames; it is rounded
    /// to the nearest supported power of two at admission.
    Interrupt { interval: u16 },
    /// `start_frame` is ignored when [`TransferFlags::ISO_ASAP`] is set.
    Isochronous {
        start_frame: u16,
        interval: u16,
        packets: Vec<IsoPacket>,
    },
}

#[derive(Clone, Debug)]
pub struct TransferRequest {
    pub endpoint: EndpointAddr,
    pub speed: UsbSpeed,
    /// Pre-mapped DMA address of the data buffer.
    pub buffer: u32,
    pub length: usize,
    pub max_packet: u16,
    pub flags: TransferFlags,
    pub kind: TransferKind,
}

/// Final status delivered through the completion callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    /// Success, including short IN transfers when `SHORT_OK` was set.
    Completed,
    /// Short transfer without `SHORT_OK`.
    ShortPacket,
    Stalled,
    /// CRC failure or device timeout; the two share a hardware status bit.
    CrcTimeout,
    Babble,
    Bitstuff,
    DataBufferError,
    /// Frame missed for an isochronous packet.
    Overrun,
    Cancelled,
    /// The controller died; the device is gone.
    ControllerDied,
}

impl TransferStatus {
    pub fn is_error(self) -> bool {
        self != TransferStatus::Completed
    }
}

/// Map a hardware-reported TD status word to a normalized error.
///
/// Priority mirrors the order the controller reports: a stall dominates the
/// transmission-level errors that may accompany it.
pub fn status_from_td(ctrl_sts: u32) -> TransferStatus {
    if ctrl_sts & hw::TD_CTRL_STALLED != 0 {
        TransferStatus::Stalled
    } else if ctrl_sts & hw::TD_CTRL_BABBLE != 0 {
        TransferStatus::Babble
    } else if ctrl_sts & hw::TD_CTRL_DBUFERR != 0 {
        TransferStatus::DataBufferError
    } else if ctrl_sts & hw::TD_CTRL_CRC_TIMEOUT != 0 {
        TransferStatus::CrcTimeout
    } else if ctrl_sts & hw::TD_CTRL_BITSTUFF != 0 {
        TransferStatus::Bitstuff
    } else {
        TransferStatus::Completed
    }
}

#[derive(Clone, Copy, Debug)]
pub struct IsoPacketResult {
    pub status: TransferStatus,
    pub actual: usize,
}

/// Everything the upstream core learns about a finished transfer.
#[derive(Clone, Debug)]
pub struct Completion {
    pub id: TransferId,
    pub endpoint: EndpointAddr,
    pub status: TransferStatus,
    pub actual_length: usize,
    /// Per-packet results; empty for non-isochronous transfers.
    pub iso_packets: Vec<IsoPacketResult>,
}

/// Upstream USB core callback seam.
///
/// `complete` runs at the scanner's single lock-drop boundary; it may submit
/// or cancel transfers reentrantly (a rescan is coalesced, never nested).
pub trait CompletionHandler {
    fn complete(&mut self, completion: Completion);

    /// The controller suffered a fatal error and will accept no further work.
    fn controller_gone(&mut self) {}
}
