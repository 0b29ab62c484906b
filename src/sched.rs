//! Skeleton schedule, frame list and FSBR link rewiring.
//!
//! The schedule is a static hierarchy of placeholder queue heads the hardware
//! walks every frame: one skeleton QH per supported interrupt interval, an
//! async head for control/bulk, and a terminator. Frame-list entry `i` enters
//! the hierarchy at the skeleton matching `i`'s interval residue, that
//! skeleton chains to the interval-1 skeleton, and every frame ends by walking
//! the async list. Endpoint QHs are linked behind their skeleton with single
//! link-word stores so the hardware never observes a dangling next pointer.

use crate::hw::{LinkPointer, QhMem, TdMem};
use crate::mem::MemoryBus;
use crate::pool::{DescriptorPool, QhHandle, TdHandle};
use crate::regs::FRAME_LIST_LEN;

// Skeleton indices: periodic intervals from 128 down to 1, then the async
// head and the terminator.
pub(crate) const SKEL_INT1: usize = 7;
pub(crate) const SKEL_ASYNC: usize = 8;
pub(crate) const SKEL_TERM: usize = 9;
pub(crate) const SKEL_COUNT: usize = 10;

/// Skeleton an endpoint QH with the given (power-of-two) period links under.
pub(crate) fn skel_for_period(period: u16) -> usize {
    debug_assert!(period.is_power_of_two());
    let exponent = period.min(128).ilog2() as usize;
    7 - exponent
}

/// Skeleton a frame-list entry targets.
///
/// Interrupt queues interleave as evenly as possible: period-2 queues are
/// visited from odd frames, period-4 queues from frames congruent to 2 (mod
/// 4), and so on, so each frame carries at most two interrupt skeletons. The
/// first set bit of the frame number picks the residue class; frames whose
/// residue would need a period above 128 fall through to the interval-1
/// skeleton.
pub(crate) fn skel_for_frame(frame: u16) -> usize {
    let ffs = (u32::from(frame) | 1 << 10).trailing_zeros() as usize;
    if ffs >= 7 {
        SKEL_INT1
    } else {
        6 - ffs
    }
}

pub(crate) struct Schedule {
    /// Skeleton QHs, indexed by `SKEL_*`.
    skel: [QhHandle; SKEL_COUNT],
    /// Permanently inactive TD parked on the terminator QH.
    term_td: TdHandle,
    /// CPU-side ordering of endpoint QHs under each linkable skeleton; the
    /// hardware chain is skeleton QH first, then these in order.
    chains: [Vec<QhHandle>; SKEL_TERM],
    /// Physical base of the 1024-entry frame list.
    frame_base: u32,
    /// Isochronous TDs spliced ahead of each frame-list entry, head first.
    iso_shadow: Vec<Vec<TdHandle>>,
    fsbr_on: bool,
}

impl Schedule {
    /// Build the skeleton hierarchy and precompute all frame-list entries.
    ///
    /// Runs once at controller attach, before RS is set, so full descriptor
    /// writes are unordered here.
    pub(crate) fn new(
        pool: &mut DescriptorPool,
        mem: &mut dyn MemoryBus,
        frame_base: u32,
    ) -> crate::Result<Self> {
        let mut skel = [QhHandle(0); SKEL_COUNT];
        for slot in skel.iter_mut() {
            *slot = pool.alloc_qh()?;
        }
        let term_td = pool.alloc_td()?;

        let qh_phys = |i: usize| pool.qh_phys(skel[i]);

        // Terminator: an idle TD so an FSBR loop always lands on valid,
        // inactive work, and a link word pointing back at the async head (the
        // loop target; unreachable while FSBR is off).
        TdMem(pool.td_phys(term_td)).write_all(mem, LinkPointer::TERM, 0, 0, 0);
        let term = QhMem(qh_phys(SKEL_TERM));
        term.set_element(mem, LinkPointer::to_td(pool.td_phys(term_td)));
        term.set_link(mem, LinkPointer::to_qh(qh_phys(SKEL_ASYNC)));

        // Async head ends the frame walk while FSBR is off.
        let async_qh = QhMem(qh_phys(SKEL_ASYNC));
        async_qh.set_element(mem, LinkPointer::TERM);
        async_qh.set_link(mem, LinkPointer::TERM);

        // Every periodic skeleton chains straight to the interval-1 skeleton
        // (frames partition across the higher intervals), and interval 1
        // chains to the async head.
        let int1 = QhMem(qh_phys(SKEL_INT1));
        int1.set_element(mem, LinkPointer::TERM);
        int1.set_link(mem, LinkPointer::to_qh(qh_phys(SKEL_ASYNC)));
        for i in 0..SKEL_INT1 {
            let qh = QhMem(qh_phys(i));
            qh.set_element(mem, LinkPointer::TERM);
            qh.set_link(mem, LinkPointer::to_qh(qh_phys(SKEL_INT1)));
        }

        for frame in 0..FRAME_LIST_LEN as u16 {
            let entry = LinkPointer::to_qh(qh_phys(skel_for_frame(frame)));
            mem.write_u32(frame_base + u32::from(frame) * 4, entry.0);
        }

        Ok(Self {
            skel,
            term_td,
            chains: Default::default(),
            frame_base,
            iso_shadow: vec![Vec::new(); FRAME_LIST_LEN],
            fsbr_on: false,
        })
    }

    pub(crate) fn frame_base(&self) -> u32 {
        self.frame_base
    }

    fn frame_entry_addr(&self, slot: u16) -> u32 {
        self.frame_base + u32::from(slot & (FRAME_LIST_LEN as u16 - 1)) * 4
    }

    /// Physical address of the last QH in a skeleton's chain (the skeleton
    /// itself when empty).
    fn tail_phys(&self, pool: &DescriptorPool, skel_idx: usize) -> u32 {
        match self.chains[skel_idx].last() {
            Some(&qh) => pool.qh_phys(qh),
            None => pool.qh_phys(self.skel[skel_idx]),
        }
    }

    /// Link an endpoint QH at the tail of a skeleton's chain.
    ///
    /// The new QH's own link word is written before the predecessor's link is
    /// redirected; the second store is the publication point and must not be
    /// reordered before the first (hardware may traverse the predecessor at
    /// any instant).
    pub(crate) fn link_qh(
        &mut self,
        mem: &mut dyn MemoryBus,
        pool: &DescriptorPool,
        skel_idx: usize,
        qh: QhHandle,
    ) {
        debug_assert!(skel_idx < SKEL_TERM);
        let pred = QhMem(self.tail_phys(pool, skel_idx));
        let inherited = pred.link(mem);
        QhMem(pool.qh_phys(qh)).set_link(mem, inherited);
        pred.set_link(mem, LinkPointer::to_qh(pool.qh_phys(qh)));
        self.chains[skel_idx].push(qh);
    }

    /// Unlink an endpoint QH: one store to the predecessor's link word, safe
    /// under concurrent hardware reads. The QH's own link is left intact so a
    /// traversal already inside it still exits cleanly.
    pub(crate) fn unlink_qh(
        &mut self,
        mem: &mut dyn MemoryBus,
        pool: &DescriptorPool,
        skel_idx: usize,
        qh: QhHandle,
    ) {
        debug_assert!(skel_idx < SKEL_TERM);
        let chain = &mut self.chains[skel_idx];
        let Some(pos) = chain.iter().position(|&h| h == qh) else {
            debug_assert!(false, "unlinking a QH that is not in the chain");
            return;
        };
        let pred_phys = if pos == 0 {
            pool.qh_phys(self.skel[skel_idx])
        } else {
            pool.qh_phys(chain[pos - 1])
        };
        let successor = QhMem(pool.qh_phys(qh)).link(mem);
        QhMem(pred_phys).set_link(mem, successor);
        chain.remove(pos);
    }

    pub(crate) fn fsbr_is_on(&self) -> bool {
        self.fsbr_on
    }

    /// Rewire the async tail for full-speed bandwidth reclamation: instead of
    /// terminating the frame walk, loop through the terminator QH back into
    /// the async list so the hardware re-polls it for the rest of the frame.
    pub(crate) fn set_fsbr(&mut self, mem: &mut dyn MemoryBus, pool: &DescriptorPool, on: bool) {
        if self.fsbr_on == on {
            return;
        }
        self.fsbr_on = on;
        let tail = QhMem(self.tail_phys(pool, SKEL_ASYNC));
        if on {
            tail.set_link(mem, LinkPointer::to_qh(pool.qh_phys(self.skel[SKEL_TERM])));
        } else {
            tail.set_link(mem, LinkPointer::TERM);
        }
        tracing::trace!(fsbr = on, "async tail rewired");
    }

    /// Splice an isochronous TD ahead of a frame-list entry. The TD inherits
    /// the slot's current link before the entry is redirected (same
    /// publication ordering as [`Self::link_qh`]).
    pub(crate) fn splice_iso_td(
        &mut self,
        mem: &mut dyn MemoryBus,
        pool: &DescriptorPool,
        slot: u16,
        td: TdHandle,
    ) {
        let slot = slot & (FRAME_LIST_LEN as u16 - 1);
        let entry_addr = self.frame_entry_addr(slot);
        let old = mem.read_u32(entry_addr);
        TdMem(pool.td_phys(td)).set_link(mem, LinkPointer(old));
        mem.write_u32(entry_addr, LinkPointer::to_td(pool.td_phys(td)).0);
        self.iso_shadow[slot as usize].insert(0, td);
    }

    /// Remove a spliced isochronous TD, restoring the predecessor link from
    /// the CPU-side shadow of the slot.
    pub(crate) fn remove_iso_td(
        &mut self,
        mem: &mut dyn MemoryBus,
        pool: &DescriptorPool,
        slot: u16,
        td: TdHandle,
    ) {
        let slot = slot & (FRAME_LIST_LEN as u16 - 1);
        let entry_addr = self.frame_entry_addr(slot);
        let shadow = &mut self.iso_shadow[slot as usize];
        let Some(pos) = shadow.iter().position(|&h| h == td) else {
            return;
        };
        let successor = TdMem(pool.td_phys(td)).link(mem);
        if pos == 0 {
            mem.write_u32(entry_addr, successor.0);
        } else {
            TdMem(pool.td_phys(shadow[pos - 1])).set_link(mem, successor);
        }
        shadow.remove(pos);
    }

    /// Release the skeleton descriptors at controller detach. All endpoint
    /// QHs and iso TDs must already be drained.
    pub(crate) fn teardown(self, pool: &mut DescriptorPool) {
        debug_assert!(self.chains.iter().all(Vec::is_empty));
        debug_assert!(self.iso_shadow.iter().all(Vec::is_empty));
        for qh in self.skel {
            pool.free_qh(qh);
        }
        pool.free_td(self.term_td);
    }
}
