//! CPU-side bookkeeping for endpoint queues and submitted requests.
//!
//! A [`QueueQh`] is the software shadow of one endpoint's queue head: its
//! hardware handle, schedule membership, bandwidth reservation and the ordered
//! list of pending request wrappers. Isochronous streams get a `QueueQh` with
//! no hardware QH; their TDs live directly in the frame list.

use std::collections::VecDeque;

use crate::pool::{QhHandle, TdHandle};
use crate::transfer::{EndpointAddr, IsoPacketResult, TransferFlags, TransferId};

/// Lifecycle of a queue head relative to the hardware-visible schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    /// Not reachable from the schedule graph.
    Idle,
    /// Linked under its skeleton; the hardware may traverse it.
    Active,
    /// Link word already rewritten out of the schedule, but the hardware may
    /// still be inside; reusable only after a frame boundary passes.
    Unlinking,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QueueKind {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

/// Request wrapper: binds one submitted transfer to its queue and TD chain.
/// Created at submission, destroyed after the completion callback returns.
pub(crate) struct Urb {
    pub id: TransferId,
    pub endpoint: EndpointAddr,
    pub flags: TransferFlags,
    /// TD chain in hardware traversal order (per-packet for isochronous).
    pub tds: Vec<TdHandle>,
    /// Frame each packet TD was spliced into; isochronous only.
    pub iso_slots: Vec<u16>,
    pub iso_results: Vec<IsoPacketResult>,
    /// This request wants full-speed bandwidth reclamation while queued.
    pub fsbr: bool,
    pub cancelled: bool,
}

pub(crate) struct QueueQh {
    pub endpoint: EndpointAddr,
    pub kind: QueueKind,
    /// Hardware QH; `None` for isochronous streams.
    pub qh: Option<QhHandle>,
    /// Trailing inactive dummy TD; chains are appended after it and the old
    /// dummy is activated last. `None` for isochronous streams.
    pub dummy: Option<TdHandle>,
    pub state: QueueState,
    /// Skeleton chain this QH links under while active.
    pub skel_idx: usize,
    // Periodic reservation; zero/unreserved for async queues.
    pub period: u16,
    pub phase: u16,
    pub load: u16,
    pub reserved: bool,
    pub urbs: VecDeque<Urb>,
    /// Frame number recorded when the unlink link-word store happened.
    pub unlink_frame: u16,
    /// Element pointer was forced to the terminator (error or cancel); the
    /// queue needs toggle fixup before it may run again.
    pub stopped: bool,
    /// Element pointer observed by the previous scan pass, for stall-wait
    /// tracking.
    pub last_element: u32,
    /// Wall-clock deadline after which a non-advancing FSBR queue is demoted.
    pub advance_deadline_ms: Option<u64>,
}

impl QueueQh {
    pub(crate) fn new(endpoint: EndpointAddr, kind: QueueKind, skel_idx: usize) -> Self {
        Self {
            endpoint,
            kind,
            qh: None,
            dummy: None,
            state: QueueState::Idle,
            skel_idx,
            period: 0,
            phase: 0,
            load: 0,
            reserved: false,
            urbs: VecDeque::new(),
            unlink_frame: 0,
            stopped: false,
            last_element: 0,
            advance_deadline_ms: None,
        }
    }

    pub(crate) fn wants_fsbr(&self) -> bool {
        self.urbs.iter().any(|urb| urb.fsbr && !urb.cancelled)
    }
}
