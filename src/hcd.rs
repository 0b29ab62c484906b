//! Host-controller driver core: lifecycle, submission and cancellation.
//!
//! [`UhciHcd`] owns the descriptor pool, the skeleton schedule, the bandwidth
//! table and the per-endpoint queue map. The upstream USB core calls
//! [`UhciHcd::submit`] and [`UhciHcd::cancel`] from its own context and
//! drives [`UhciHcd::handle_irq`] / [`UhciHcd::poll`] from the platform's
//! interrupt handler and timer tick. Completions are only ever delivered from
//! inside those two entry points.

use std::collections::HashMap;

use crate::bandwidth::{round_period, transaction_load_us, LoadTable};
use crate::bus::{Quirks, RegisterIo};
use crate::error::{HcdError, Result};
use crate::hw::{LinkPointer, QhMem, TdMem};
use crate::mem::MemoryBus;
use crate::pool::DescriptorPool;
use crate::qh::{QueueKind, QueueQh, QueueState, Urb};
use crate::regs::{
    FRNUM_MASK, NUM_PORTS, REG_FLBASEADD, REG_FRNUM, REG_SOFMOD, REG_USBCMD, REG_USBINTR,
    REG_USBSTS, USBCMD_CF, USBCMD_HCRESET, USBCMD_MAXP, USBCMD_RS, USBINTR_ALL, USBINTR_RESUME,
    USBSTS_HCHALTED, USBSTS_HCPROCESSERR, USBSTS_HSE, USBSTS_W1C_MASK,
};
use crate::root_hub::{PortChange, RhState, RootHub};
use crate::sched::{skel_for_period, Schedule, SKEL_ASYNC};
use crate::submit::{append_chain, control_specs, iso_spec, queued_specs};
use crate::transfer::{
    Completion, CompletionHandler, EndpointAddr, TransferFlags, TransferId, TransferKind,
    TransferRequest, TransferStatus, UsbSpeed,
};

/// Reads of USBCMD allowed before a stuck HCRESET is declared fatal.
const HCRESET_POLL_LIMIT: u32 = 50;

/// Default SOF timing value (1 ms frames with a 12 MHz clock).
const SOF_DEFAULT: u16 = 64;

/// Isochronous ASAP submissions start this many frames past the current one,
/// leaving the CPU time to splice the TDs before the hardware arrives.
pub(crate) const ISO_ASAP_LEAD_FRAMES: u16 = 10;

/// How long FSBR stays on after the last interested transfer finishes.
pub(crate) const FSBR_OFF_DELAY_MS: u64 = 10;

/// DMA layout the platform carved out for this controller.
#[derive(Clone, Copy, Debug)]
pub struct HcdConfig {
    /// Physical base of the 4 KiB-aligned, 1024-entry frame list.
    pub frame_list_base: u32,
    /// Physical base of the descriptor pool region (16-byte aligned).
    pub pool_base: u32,
    pub qh_slots: u16,
    pub td_slots: u16,
}

pub struct UhciHcd<M: MemoryBus, R: RegisterIo> {
    pub(crate) mem: M,
    pub(crate) io: R,
    config: HcdConfig,
    pub(crate) pool: DescriptorPool,
    pub(crate) sched: Option<Schedule>,
    pub(crate) load: LoadTable,
    pub(crate) queues: HashMap<EndpointAddr, QueueQh>,
    /// Data toggle each endpoint will use next, tracked across transfers.
    pub(crate) toggles: HashMap<EndpointAddr, bool>,
    pub(crate) transfers: HashMap<TransferId, EndpointAddr>,
    next_id: TransferId,
    /// Scanner re-entrancy latch; a request arriving mid-scan coalesces into
    /// one extra pass instead of nesting.
    pub(crate) scanning: bool,
    pub(crate) rescan: bool,
    pub(crate) fsbr_off_deadline_ms: Option<u64>,
    pub(crate) rh: RootHub,
    pub(crate) dead: bool,
}

impl<M: MemoryBus, R: RegisterIo> UhciHcd<M, R> {
    pub fn new(mem: M, io: R, config: HcdConfig) -> Self {
        Self {
            mem,
            io,
            pool: DescriptorPool::new(config.pool_base, config.qh_slots, config.td_slots),
            config,
            sched: None,
            load: LoadTable::new(),
            queues: HashMap::new(),
            toggles: HashMap::new(),
            transfers: HashMap::new(),
            next_id: 1,
            scanning: false,
            rescan: false,
            fsbr_off_deadline_ms: None,
            rh: RootHub::new(),
            dead: false,
        }
    }

    /// Reset the controller, build the schedule and set it running.
    pub fn start(&mut self, now_ms: u64) -> Result<()> {
        let frame_list_base = self.config.frame_list_base;
        self.io.write16(REG_USBCMD, USBCMD_HCRESET);
        let mut cleared = false;
        for _ in 0..HCRESET_POLL_LIMIT {
            if self.io.read16(REG_USBCMD) & USBCMD_HCRESET == 0 {
                cleared = true;
                break;
            }
        }
        if !cleared {
            return Err(HcdError::ResetTimeout);
        }

        let sched = Schedule::new(&mut self.pool, &mut self.mem, frame_list_base)?;

        // Chipsets with broken resume-detect interrupts still latch the port
        // bits; wakeup is then driven entirely from the poll path.
        let mut intr = USBINTR_ALL;
        if self.io.quirks().contains(Quirks::RESUME_DETECT_BROKEN) {
            intr &= !USBINTR_RESUME;
        }
        self.io.write16(REG_USBINTR, intr);
        self.io.write16(REG_FRNUM, 0);
        self.io.write32(REG_FLBASEADD, frame_list_base);
        self.io.write16(REG_SOFMOD, SOF_DEFAULT);
        self.io.write16(REG_USBCMD, USBCMD_RS | USBCMD_CF | USBCMD_MAXP);

        self.sched = Some(sched);
        self.rh.set_running(now_ms);
        tracing::info!(frame_list_base, "controller started");
        Ok(())
    }

    /// Stop the controller and give back every pending transfer as cancelled.
    pub fn stop(&mut self, handler: &mut dyn CompletionHandler) {
        if !self.dead {
            self.io.write16(REG_USBCMD, 0);
        }
        self.drain_all(TransferStatus::Cancelled, handler);
        if let Some(sched) = self.sched.take() {
            sched.teardown(&mut self.pool);
        }
        self.rh.set_stopped();
    }

    pub fn frame_number(&mut self) -> u16 {
        self.io.read16(REG_FRNUM) & FRNUM_MASK
    }

    /// Queue a transfer. Returns its id; the matching completion arrives
    /// later through the [`CompletionHandler`] passed to irq/poll.
    pub fn submit(&mut self, req: TransferRequest) -> Result<TransferId> {
        if self.dead {
            return Err(HcdError::ControllerDead);
        }
        if self.sched.is_none() {
            return Err(HcdError::ControllerDead);
        }

        let id = self.next_id;
        match &req.kind {
            TransferKind::Control { setup_dma } => {
                self.submit_queued(id, &req, QueueKind::Control, Some(*setup_dma))?
            }
            TransferKind::Bulk => self.submit_queued(id, &req, QueueKind::Bulk, None)?,
            TransferKind::Interrupt { .. } => {
                self.submit_queued(id, &req, QueueKind::Interrupt, None)?
            }
            TransferKind::Isochronous { .. } => self.submit_iso(id, &req)?,
        }
        self.next_id += 1;
        self.transfers.insert(id, req.endpoint);
        Ok(id)
    }

    /// Cancel a pending transfer. Unknown (already completed) ids succeed;
    /// the transfer is given back as [`TransferStatus::Cancelled`] from the
    /// next irq/poll, not synchronously.
    pub fn cancel(&mut self, id: TransferId) -> Result<()> {
        if self.dead {
            return Err(HcdError::ControllerDead);
        }
        let Some(&ep) = self.transfers.get(&id) else {
            return Ok(());
        };
        let Some(qq) = self.queues.get_mut(&ep) else {
            return Ok(());
        };
        let Some(urb) = qq.urbs.iter_mut().find(|urb| urb.id == id) else {
            return Ok(());
        };
        if urb.cancelled {
            return Ok(());
        }
        urb.cancelled = true;

        // Queued transfers: freeze the queue so the hardware cannot advance
        // into (or past) the dying chain; the scanner gives it back and
        // restarts the survivors with fixed-up toggles.
        if qq.kind != QueueKind::Isochronous {
            if let Some(qh) = qq.qh {
                QhMem(self.pool.qh_phys(qh)).set_element(&mut self.mem, LinkPointer::TERM);
                qq.stopped = true;
            }
        }
        self.rescan = true;
        Ok(())
    }

    /// Interrupt-handler entry point. Returns whether the interrupt was this
    /// controller's.
    pub fn handle_irq(&mut self, handler: &mut dyn CompletionHandler, now_ms: u64) -> bool {
        if self.dead {
            return false;
        }
        let status = self.io.read16(REG_USBSTS) & USBSTS_W1C_MASK;
        if status == 0 {
            return false;
        }
        self.io.write16(REG_USBSTS, status);

        // A halt while Run/Stop is set means the controller gave up on its
        // own; halts from auto-stop or suspend are expected and benign.
        let unexpected_halt = status & USBSTS_HCHALTED != 0 && self.rh.state().is_running();
        if status & (USBSTS_HCPROCESSERR | USBSTS_HSE) != 0 || unexpected_halt {
            tracing::error!(status, "host controller fatal error");
            self.die(handler);
            return true;
        }
        self.scan_schedule(handler, now_ms);
        true
    }

    /// Timer-tick entry point: root hub state machine, deferred unlinks,
    /// FSBR timeouts and (on quirky chipsets) interrupt-less completions.
    pub fn poll(&mut self, handler: &mut dyn CompletionHandler, now_ms: u64) {
        if self.dead {
            return;
        }
        let busy = self.queues.values().any(|qq| !qq.urbs.is_empty());
        self.rh.poll(&mut self.io, now_ms, busy);
        if self.rh.state().is_running() && self.sched.is_some() {
            // Catch an unexpected halt even on chipsets that never raise the
            // matching interrupt.
            let status = self.io.read16(REG_USBSTS);
            if status & USBSTS_HCHALTED != 0 && self.io.read16(REG_USBCMD) & USBCMD_RS != 0 {
                self.io.write16(REG_USBSTS, status & USBSTS_W1C_MASK);
                tracing::error!(status, "host controller halted unexpectedly");
                self.die(handler);
                return;
            }
            self.scan_schedule(handler, now_ms);
        }
    }

    pub fn rh_state(&self) -> RhState {
        self.rh.state()
    }

    pub fn port_status(&mut self, port: usize) -> u16 {
        debug_assert!(port < NUM_PORTS);
        self.rh.port_status(&mut self.io, port)
    }

    pub fn port_speed(&mut self, port: usize) -> UsbSpeed {
        self.rh.port_speed(&mut self.io, port)
    }

    pub fn take_port_change(&mut self, port: usize) -> PortChange {
        self.rh.take_port_change(port)
    }

    pub fn reset_port(&mut self, port: usize, now_ms: u64) {
        self.rh.reset_port(&mut self.io, port, now_ms);
    }

    pub fn suspend_port(&mut self, port: usize) {
        self.rh.suspend_port(&mut self.io, port);
    }

    pub fn resume_port(&mut self, port: usize, now_ms: u64) {
        self.rh.resume_port(&mut self.io, port, now_ms);
    }

    /// Global bus suspend. Pending transfers stay queued and resume with the
    /// controller.
    pub fn suspend(&mut self) {
        self.rh.suspend(&mut self.io);
    }

    pub fn resume(&mut self, now_ms: u64) {
        self.rh.resume(&mut self.io, now_ms);
    }

    /// Schedule-lifecycle state of an endpoint's queue, if one exists.
    pub fn endpoint_state(&self, ep: EndpointAddr) -> Option<QueueState> {
        self.queues.get(&ep).map(|qq| qq.state)
    }

    fn submit_queued(
        &mut self,
        id: TransferId,
        req: &TransferRequest,
        kind: QueueKind,
        setup_dma: Option<u32>,
    ) -> Result<()> {
        let ep = req.endpoint;

        // Periodic admission happens before any allocation so a bandwidth
        // refusal leaves nothing to unwind.
        let mut reservation = None;
        if kind == QueueKind::Interrupt && !self.queues.get(&ep).is_some_and(|qq| qq.reserved) {
            let interval = match req.kind {
                TransferKind::Interrupt { interval } => interval,
                _ => unreachable!("kind matched Interrupt in submit"),
            };
            let period = round_period(interval)?;
            let load = transaction_load_us(
                req.speed,
                ep.direction,
                false,
                req.length.min(usize::from(req.max_packet)),
            );
            let phase = self.load.select_phase(period, load)?;
            reservation = Some((period, phase, load));
        }

        self.ensure_queue(ep, kind)?;
        let Some(qq) = self.queues.get_mut(&ep) else {
            unreachable!("ensure_queue inserted the entry")
        };

        if let Some((period, phase, load)) = reservation {
            self.load.reserve(period, phase, load);
            qq.period = period;
            qq.phase = phase;
            qq.load = load;
            qq.reserved = true;
            qq.skel_idx = skel_for_period(period);
        }

        let toggle = self.toggles.get(&ep).copied().unwrap_or(false);
        let (specs, new_toggle) = match kind {
            QueueKind::Control => {
                let dma = setup_dma.unwrap_or(0);
                (control_specs(req, dma), toggle)
            }
            _ => queued_specs(req, toggle),
        };

        let tds = match append_chain(&mut self.mem, &mut self.pool, qq, &specs) {
            Ok(tds) => tds,
            Err(err) => {
                if let Some((period, phase, load)) = reservation {
                    self.load.release(period, phase, load);
                    qq.reserved = false;
                }
                return Err(err);
            }
        };
        if kind != QueueKind::Control {
            self.toggles.insert(ep, new_toggle);
        }

        let fsbr = matches!(kind, QueueKind::Control | QueueKind::Bulk)
            && req.speed == UsbSpeed::Full
            && !req.flags.contains(TransferFlags::NO_FSBR);

        qq.urbs.push_back(Urb {
            id,
            endpoint: ep,
            flags: req.flags,
            tds,
            iso_slots: Vec::new(),
            iso_results: Vec::new(),
            fsbr,
            cancelled: false,
        });

        self.link_if_idle(ep);
        if fsbr {
            self.enable_fsbr();
        }
        Ok(())
    }

    fn submit_iso(&mut self, id: TransferId, req: &TransferRequest) -> Result<()> {
        let ep = req.endpoint;
        let TransferKind::Isochronous {
            start_frame,
            interval,
            packets,
        } = &req.kind
        else {
            unreachable!("kind matched Isochronous in submit")
        };
        if packets.is_empty() {
            return Err(HcdError::InvalidPacketCount);
        }
        let period = round_period(*interval)?;

        let start = if req.flags.contains(TransferFlags::ISO_ASAP) {
            let asap = self.frame_number().wrapping_add(ISO_ASAP_LEAD_FRAMES) & FRNUM_MASK;
            // Never overlap the tail of a previous submission on the stream.
            match self.queues.get(&ep).and_then(|qq| {
                qq.urbs
                    .back()
                    .and_then(|urb| urb.iso_slots.last())
                    .map(|&f| f.wrapping_add(period) & FRNUM_MASK)
            }) {
                Some(next) if frame_before(asap, next) => next,
                _ => asap,
            }
        } else {
            start_frame & FRNUM_MASK
        };

        let max_len = packets.iter().map(|p| usize::from(p.length)).max().unwrap_or(0);
        let load = transaction_load_us(req.speed, ep.direction, true, max_len);
        let phase = start % period;

        if !self.queues.get(&ep).is_some_and(|qq| qq.reserved) {
            self.load.check_phase(period, phase, load)?;
        }

        // All TDs allocated before any splice so a mid-stream pool failure
        // never leaves a partial stream in the frame list.
        let mut tds = Vec::with_capacity(packets.len());
        for _ in packets {
            match self.pool.alloc_td() {
                Ok(td) => tds.push(td),
                Err(err) => {
                    for td in tds {
                        self.pool.free_td(td);
                    }
                    return Err(err);
                }
            }
        }

        self.ensure_queue(ep, QueueKind::Isochronous)?;
        let Some(qq) = self.queues.get_mut(&ep) else {
            unreachable!("ensure_queue inserted the entry")
        };
        if !qq.reserved {
            self.load.reserve(period, phase, load);
            qq.period = period;
            qq.phase = phase;
            qq.load = load;
            qq.reserved = true;
        }

        let Some(sched) = self.sched.as_mut() else {
            return Err(HcdError::ControllerDead);
        };
        let mut slots = Vec::with_capacity(packets.len());
        for (i, (packet, &td)) in packets.iter().zip(&tds).enumerate() {
            let spec = iso_spec(req, packet.offset, packet.length, i + 1 == packets.len());
            TdMem(self.pool.td_phys(td)).write_all(
                &mut self.mem,
                LinkPointer::TERM,
                spec.ctrl,
                spec.token,
                spec.buffer,
            );
            let frame = start.wrapping_add(i as u16 * period) & FRNUM_MASK;
            sched.splice_iso_td(&mut self.mem, &self.pool, frame, td);
            slots.push(frame);
        }

        qq.state = QueueState::Active;
        qq.urbs.push_back(Urb {
            id,
            endpoint: ep,
            flags: req.flags,
            tds,
            iso_slots: slots,
            iso_results: Vec::new(),
            fsbr: false,
            cancelled: false,
        });
        Ok(())
    }

    /// Create the endpoint's queue bookkeeping (and hardware QH with its
    /// trailing dummy, for queued kinds) if it does not exist yet.
    fn ensure_queue(&mut self, ep: EndpointAddr, kind: QueueKind) -> Result<()> {
        if self.queues.contains_key(&ep) {
            return Ok(());
        }
        let mut qq = QueueQh::new(ep, kind, SKEL_ASYNC);
        if kind != QueueKind::Isochronous {
            let qh = self.pool.alloc_qh()?;
            let dummy = match self.pool.alloc_td() {
                Ok(td) => td,
                Err(err) => {
                    self.pool.free_qh(qh);
                    return Err(err);
                }
            };
            TdMem(self.pool.td_phys(dummy)).write_all(
                &mut self.mem,
                LinkPointer::TERM,
                0,
                0,
                0,
            );
            let qh_mem = QhMem(self.pool.qh_phys(qh));
            qh_mem.set_element(&mut self.mem, LinkPointer::to_td(self.pool.td_phys(dummy)));
            qh_mem.set_link(&mut self.mem, LinkPointer::TERM);
            qq.qh = Some(qh);
            qq.dummy = Some(dummy);
            qq.last_element = self.pool.td_phys(dummy);
        }
        self.queues.insert(ep, qq);
        Ok(())
    }

    /// Link a queue into the schedule if it is idle with work pending. A
    /// queue mid-unlink stays out until the frame boundary passes.
    pub(crate) fn link_if_idle(&mut self, ep: EndpointAddr) {
        let Some(qq) = self.queues.get_mut(&ep) else {
            return;
        };
        if qq.kind == QueueKind::Isochronous
            || qq.state != QueueState::Idle
            || qq.urbs.is_empty()
        {
            return;
        }
        let (Some(qh), Some(sched)) = (qq.qh, self.sched.as_mut()) else {
            return;
        };
        sched.link_qh(&mut self.mem, &self.pool, qq.skel_idx, qh);
        qq.state = QueueState::Active;
    }

    /// Enter full-speed bandwidth reclamation. Leaving it is deferred by
    /// [`FSBR_OFF_DELAY_MS`] and serviced by the scanner, which knows the
    /// current time.
    fn enable_fsbr(&mut self) {
        let Some(sched) = self.sched.as_mut() else {
            return;
        };
        self.fsbr_off_deadline_ms = None;
        sched.set_fsbr(&mut self.mem, &self.pool, true);
    }

    /// True while some live transfer still wants reclamation.
    pub(crate) fn fsbr_wanted(&self) -> bool {
        self.queues.values().any(QueueQh::wants_fsbr)
    }

    /// Mark the controller dead: no further register access, everything
    /// pending fails with [`TransferStatus::ControllerDied`].
    pub(crate) fn die(&mut self, handler: &mut dyn CompletionHandler) {
        self.dead = true;
        self.drain_all(TransferStatus::ControllerDied, handler);
        handler.controller_gone();
    }

    /// Tear down every queue and give back every pending transfer with the
    /// given status. Descriptor memory is still written (it is plain RAM)
    /// but registers are not touched.
    fn drain_all(&mut self, status: TransferStatus, handler: &mut dyn CompletionHandler) {
        let mut completions = Vec::new();
        let eps: Vec<EndpointAddr> = self.queues.keys().copied().collect();
        for ep in eps {
            let Some(mut qq) = self.queues.remove(&ep) else {
                continue;
            };
            while let Some(urb) = qq.urbs.pop_front() {
                // Isochronous packets already harvested by the scanner have
                // had their TDs unspliced and freed.
                let already_done = urb.iso_results.len();
                for (i, &td) in urb.tds.iter().enumerate() {
                    if !urb.iso_slots.is_empty() && i < already_done {
                        continue;
                    }
                    if let (Some(sched), Some(&frame)) =
                        (self.sched.as_mut(), urb.iso_slots.get(i))
                    {
                        sched.remove_iso_td(&mut self.mem, &self.pool, frame, td);
                    }
                    self.pool.free_td(td);
                }
                self.transfers.remove(&urb.id);
                completions.push(Completion {
                    id: urb.id,
                    endpoint: urb.endpoint,
                    status,
                    actual_length: 0,
                    iso_packets: urb.iso_results,
                });
            }
            if qq.state == QueueState::Active && qq.kind != QueueKind::Isochronous {
                if let (Some(qh), Some(sched)) = (qq.qh, self.sched.as_mut()) {
                    sched.unlink_qh(&mut self.mem, &self.pool, qq.skel_idx, qh);
                }
            }
            if let Some(qh) = qq.qh {
                self.pool.free_qh(qh);
            }
            if let Some(dummy) = qq.dummy {
                self.pool.free_td(dummy);
            }
            if qq.reserved {
                self.load.release(qq.period, qq.phase, qq.load);
            }
        }
        if let Some(sched) = self.sched.as_mut() {
            if sched.fsbr_is_on() {
                sched.set_fsbr(&mut self.mem, &self.pool, false);
            }
        }
        for completion in completions {
            handler.complete(completion);
        }
    }
}

/// True when frame `a` is strictly before frame `b` in 11-bit wrapping order.
pub(crate) fn frame_before(a: u16, b: u16) -> bool {
    a != b && (b.wrapping_sub(a) & FRNUM_MASK) < 0x400
}
