//! Hardware descriptor layouts: link pointers, transfer descriptors, queue
//! heads.
//!
//! TDs and QHs are fixed-layout little-endian blocks in DMA memory, never plain
//! Rust structs: while a TD's status word has ACTIVE set the hardware owns the
//! status and buffer fields and the CPU must not touch them. All accessors here
//! take the [`MemoryBus`] explicitly; multi-word writes are only legal on
//! descriptors the hardware cannot currently reach (freshly allocated, or
//! observed inactive). Single-word link/status stores are the only mutations
//! permitted on hardware-reachable descriptors.

use crate::mem::MemoryBus;

// Link pointer bits, common to frame-list entries, TD links and QH links.
pub const LINK_TERMINATE: u32 = 1 << 0;
pub const LINK_QH: u32 = 1 << 1;
pub const LINK_DEPTH_FIRST: u32 = 1 << 2;
pub const LINK_ADDR_MASK: u32 = 0xffff_fff0;

/// A raw schedule link word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkPointer(pub u32);

impl LinkPointer {
    pub const TERM: LinkPointer = LinkPointer(LINK_TERMINATE);

    pub fn to_qh(addr: u32) -> Self {
        Self((addr & LINK_ADDR_MASK) | LINK_QH)
    }

    pub fn to_td(addr: u32) -> Self {
        Self(addr & LINK_ADDR_MASK)
    }

    /// TD-to-TD link with the depth-first bit, used inside a QH's element
    /// chain so the controller finishes one queue before moving on.
    pub fn to_td_depth(addr: u32) -> Self {
        Self((addr & LINK_ADDR_MASK) | LINK_DEPTH_FIRST)
    }

    pub fn terminated(self) -> bool {
        self.0 & LINK_TERMINATE != 0
    }

    pub fn is_qh(self) -> bool {
        self.0 & LINK_QH != 0
    }

    pub fn addr(self) -> u32 {
        self.0 & LINK_ADDR_MASK
    }
}

// TD control/status word (offset 0x04).
pub const TD_CTRL_ACTLEN_MASK: u32 = 0x7ff;
pub const TD_CTRL_BITSTUFF: u32 = 1 << 17;
pub const TD_CTRL_CRC_TIMEOUT: u32 = 1 << 18;
pub const TD_CTRL_NAK: u32 = 1 << 19;
pub const TD_CTRL_BABBLE: u32 = 1 << 20;
pub const TD_CTRL_DBUFERR: u32 = 1 << 21;
pub const TD_CTRL_STALLED: u32 = 1 << 22;
pub const TD_CTRL_ACTIVE: u32 = 1 << 23;
pub const TD_CTRL_IOC: u32 = 1 << 24;
pub const TD_CTRL_IOS: u32 = 1 << 25;
pub const TD_CTRL_LOWSPEED: u32 = 1 << 26;
pub const TD_CTRL_CERR_SHIFT: u32 = 27;
pub const TD_CTRL_SPD: u32 = 1 << 29;

/// Every hardware-reported error condition, babble and stall included.
pub const TD_CTRL_ANY_ERROR: u32 =
    TD_CTRL_BITSTUFF | TD_CTRL_CRC_TIMEOUT | TD_CTRL_BABBLE | TD_CTRL_DBUFERR | TD_CTRL_STALLED;

// TD token word (offset 0x08).
pub const TD_TOKEN_PID_MASK: u32 = 0xff;
pub const TD_TOKEN_DEVADDR_SHIFT: u32 = 8;
pub const TD_TOKEN_ENDPT_SHIFT: u32 = 15;
pub const TD_TOKEN_TOGGLE: u32 = 1 << 19;
pub const TD_TOKEN_MAXLEN_SHIFT: u32 = 21;

pub const PID_IN: u8 = 0x69;
pub const PID_OUT: u8 = 0xe1;
pub const PID_SETUP: u8 = 0x2d;

/// Encode a TD token. `len == 0` encodes the null-packet length (0x7ff).
pub fn td_token(pid: u8, devaddr: u8, endpt: u8, toggle: bool, len: usize) -> u32 {
    let maxlen = if len == 0 { 0x7ff } else { (len as u32) - 1 };
    let mut token = u32::from(pid)
        | (u32::from(devaddr) << TD_TOKEN_DEVADDR_SHIFT)
        | (u32::from(endpt) << TD_TOKEN_ENDPT_SHIFT)
        | (maxlen << TD_TOKEN_MAXLEN_SHIFT);
    if toggle {
        token |= TD_TOKEN_TOGGLE;
    }
    token
}

pub fn token_toggle(token: u32) -> bool {
    token & TD_TOKEN_TOGGLE != 0
}

pub fn token_pid(token: u32) -> u8 {
    (token & TD_TOKEN_PID_MASK) as u8
}

/// Expected (maximum) length encoded in a token; 0x7ff means zero bytes.
pub fn token_expected_len(token: u32) -> usize {
    let raw = (token >> TD_TOKEN_MAXLEN_SHIFT) & 0x7ff;
    if raw == 0x7ff {
        0
    } else {
        raw as usize + 1
    }
}

/// Rewrite a token's expected-length field. Used when a queue is repaired
/// after a short packet so later scans see a consistent chain.
pub fn token_set_expected_len(token: u32, len: usize) -> u32 {
    let maxlen = if len == 0 { 0x7ff } else { (len as u32) - 1 };
    (token & !(0x7ff << TD_TOKEN_MAXLEN_SHIFT)) | (maxlen << TD_TOKEN_MAXLEN_SHIFT)
}

/// Actual length from a completed status word; 0x7ff means zero bytes.
pub fn status_actual_len(ctrl_sts: u32) -> usize {
    let raw = ctrl_sts & TD_CTRL_ACTLEN_MASK;
    if raw == TD_CTRL_ACTLEN_MASK {
        0
    } else {
        raw as usize + 1
    }
}

/// Field accessors for a TD at a known physical address.
///
/// Layout per UHCI 1.1 spec section 3.2: link (0x0), control/status (0x4),
/// token (0x8), buffer pointer (0xc).
#[derive(Clone, Copy, Debug)]
pub struct TdMem(pub u32);

impl TdMem {
    pub fn link(self, mem: &mut dyn MemoryBus) -> LinkPointer {
        LinkPointer(mem.read_u32(self.0))
    }

    pub fn ctrl_sts(self, mem: &mut dyn MemoryBus) -> u32 {
        mem.read_u32(self.0 + 0x4)
    }

    pub fn token(self, mem: &mut dyn MemoryBus) -> u32 {
        mem.read_u32(self.0 + 0x8)
    }

    /// Single-word link store; legal while the hardware may be traversing.
    pub fn set_link(self, mem: &mut dyn MemoryBus, link: LinkPointer) {
        mem.write_u32(self.0, link.0);
    }

    /// Single-word status store; legal only for flipping ACTIVE on a fully
    /// written TD (queue extension) or clearing it on a stopped queue.
    pub fn set_ctrl_sts(self, mem: &mut dyn MemoryBus, ctrl_sts: u32) {
        mem.write_u32(self.0 + 0x4, ctrl_sts);
    }

    /// Single-word token store, used by toggle fixup on inactive TDs only.
    pub fn set_token(self, mem: &mut dyn MemoryBus, token: u32) {
        mem.write_u32(self.0 + 0x8, token);
    }

    pub fn set_buffer(self, mem: &mut dyn MemoryBus, buffer: u32) {
        mem.write_u32(self.0 + 0xc, buffer);
    }

    /// Full four-word write. The TD must be unreachable from the hardware
    /// (freshly allocated, or linked only behind an inactive dummy).
    pub fn write_all(
        self,
        mem: &mut dyn MemoryBus,
        link: LinkPointer,
        ctrl_sts: u32,
        token: u32,
        buffer: u32,
    ) {
        mem.write_u32(self.0, link.0);
        mem.write_u32(self.0 + 0x4, ctrl_sts);
        mem.write_u32(self.0 + 0x8, token);
        mem.write_u32(self.0 + 0xc, buffer);
    }
}

/// Field accessors for a QH at a known physical address.
///
/// Layout per UHCI 1.1 spec section 3.5: horizontal link (0x0), element
/// pointer (0x4). Both are single-word stores and safe under concurrent
/// hardware reads.
#[derive(Clone, Copy, Debug)]
pub struct QhMem(pub u32);

impl QhMem {
    pub fn link(self, mem: &mut dyn MemoryBus) -> LinkPointer {
        LinkPointer(mem.read_u32(self.0))
    }

    pub fn element(self, mem: &mut dyn MemoryBus) -> LinkPointer {
        LinkPointer(mem.read_u32(self.0 + 0x4))
    }

    pub fn set_link(self, mem: &mut dyn MemoryBus, link: LinkPointer) {
        mem.write_u32(self.0, link.0);
    }

    pub fn set_element(self, mem: &mut dyn MemoryBus, element: LinkPointer) {
        mem.write_u32(self.0 + 0x4, element.0);
    }
}
