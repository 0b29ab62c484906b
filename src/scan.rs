//! Schedule scanner: completion harvesting, queue recovery and deferred
//! unlinks.
//!
//! The scanner is the only consumer of hardware-written TD status. It walks
//! each queue's pending chains front to back, gives back finished transfers,
//! repairs queues the hardware halted (errors, short packets, cancels) and
//! retires queue heads whose unlink has outlived a frame boundary. A request
//! arriving while a scan is in flight latches a rescan flag; the scanner
//! replays exactly once instead of nesting.

use crate::bus::RegisterIo;
use crate::hw::{
    status_actual_len, token_expected_len, token_set_expected_len, token_toggle, LinkPointer,
    QhMem, TdMem, TD_CTRL_ACTIVE, TD_CTRL_ACTLEN_MASK, TD_TOKEN_TOGGLE,
};
use crate::hcd::{frame_before, UhciHcd, FSBR_OFF_DELAY_MS};
use crate::mem::MemoryBus;
use crate::pool::TdHandle;
use crate::qh::{QueueKind, QueueState};
use crate::transfer::{
    status_from_td, Completion, CompletionHandler, EndpointAddr, IsoPacketResult, TransferFlags,
    TransferStatus,
};

/// An FSBR queue whose element pointer has not moved for this long is
/// demoted; a NAKing device would otherwise monopolize the bus for nothing.
const FSBR_STALL_MS: u64 = 200;

enum Verdict {
    /// Hardware is still working on the front chain.
    Wait,
    /// The front chain is finished; give it back with this status and byte
    /// count.
    Give(TransferStatus, usize),
    /// Control transfer short data stage: skip the element pointer ahead to
    /// the status TD and keep waiting. Carries the index of the short TD.
    JumpToStatus(usize),
}

impl<M: MemoryBus, R: RegisterIo> UhciHcd<M, R> {
    /// Harvest completions from the whole schedule and service deferred
    /// work. Invoked from irq and poll; reentrant invocations coalesce.
    pub(crate) fn scan_schedule(&mut self, handler: &mut dyn CompletionHandler, now_ms: u64) {
        if self.scanning {
            self.rescan = true;
            return;
        }
        self.scanning = true;
        loop {
            self.rescan = false;
            let frnum = self.frame_number();

            // Periodic queues first: their deadlines are real, the async
            // queues can wait a few microseconds.
            let mut eps: Vec<(u8, EndpointAddr)> = self
                .queues
                .iter()
                .map(|(&ep, qq)| {
                    let rank = match qq.kind {
                        QueueKind::Isochronous => 0,
                        QueueKind::Interrupt => 1,
                        QueueKind::Control => 2,
                        QueueKind::Bulk => 3,
                    };
                    (rank, ep)
                })
                .collect();
            eps.sort_by_key(|&(rank, ep)| (rank, ep.device, ep.endpoint));

            let mut completions = Vec::new();
            for (_, ep) in eps {
                match self.queues.get(&ep).map(|qq| qq.kind) {
                    Some(QueueKind::Isochronous) => {
                        self.scan_iso_queue(ep, frnum, &mut completions)
                    }
                    Some(_) => self.scan_queue(ep, frnum, now_ms, &mut completions),
                    None => {}
                }
            }

            self.reap_unlinks(frnum);
            self.service_fsbr(now_ms);

            // Handler runs with no queue borrowed; anything it triggers
            // (resubmission, cancels) lands in the rescan pass.
            for completion in completions {
                handler.complete(completion);
            }
            if !self.rescan {
                break;
            }
        }
        self.scanning = false;
    }

    fn scan_queue(
        &mut self,
        ep: EndpointAddr,
        frnum: u16,
        now_ms: u64,
        completions: &mut Vec<Completion>,
    ) {
        let Some(qq) = self.queues.get_mut(&ep) else {
            return;
        };
        let Some(qh) = qq.qh else {
            return;
        };
        let qh_mem = QhMem(self.pool.qh_phys(qh));
        let is_control = qq.kind == QueueKind::Control;
        let mut need_restart = qq.stopped;
        // Wire toggle expected by the first packet that never ran; set by any
        // early giveback so the survivors can be resynced.
        let mut resync: Option<bool> = None;

        loop {
            let Some(urb) = qq.urbs.front() else {
                break;
            };
            let frozen = qq.stopped;
            let verdict = 'walk: {
                let mut actual = 0usize;
                for (i, &td) in urb.tds.iter().enumerate() {
                    let tdm = TdMem(self.pool.td_phys(td));
                    let ctrl = tdm.ctrl_sts(&mut self.mem);
                    let token = tdm.token(&mut self.mem);

                    if ctrl & TD_CTRL_ACTIVE != 0 {
                        if urb.cancelled && frozen {
                            resync = Some(token_toggle(token));
                            break 'walk Verdict::Give(TransferStatus::Cancelled, actual);
                        }
                        break 'walk Verdict::Wait;
                    }

                    let err = status_from_td(ctrl);
                    if err.is_error() {
                        // The failed packet was not accepted, so its toggle
                        // is still the next one on the wire.
                        resync = Some(token_toggle(token));
                        need_restart = true;
                        break 'walk Verdict::Give(err, actual);
                    }

                    let got = status_actual_len(ctrl);
                    if !(is_control && i == 0) {
                        actual += got;
                    }
                    if got < token_expected_len(token) && i + 1 != urb.tds.len() {
                        if is_control {
                            // Short data stage is fine; proceed straight to
                            // the status stage.
                            break 'walk Verdict::JumpToStatus(i);
                        }
                        resync = Some(!token_toggle(token));
                        need_restart = true;
                        let status = if urb.flags.contains(TransferFlags::SHORT_OK) {
                            TransferStatus::Completed
                        } else {
                            TransferStatus::ShortPacket
                        };
                        break 'walk Verdict::Give(status, actual);
                    }
                }
                let status = if urb.cancelled {
                    TransferStatus::Cancelled
                } else {
                    TransferStatus::Completed
                };
                Verdict::Give(status, actual)
            };

            match verdict {
                Verdict::Wait => {
                    // FSBR stall watch: an element pointer frozen on a NAKing
                    // chain must not keep reclamation alive forever.
                    let element = qh_mem.element(&mut self.mem).0;
                    if qq.wants_fsbr() && element == qq.last_element {
                        match qq.advance_deadline_ms {
                            None => qq.advance_deadline_ms = Some(now_ms + FSBR_STALL_MS),
                            Some(deadline) if now_ms >= deadline => {
                                tracing::debug!(?ep, "queue stalled, dropping FSBR");
                                for urb in qq.urbs.iter_mut() {
                                    urb.fsbr = false;
                                }
                            }
                            Some(_) => {}
                        }
                    } else if element != qq.last_element {
                        qq.advance_deadline_ms = None;
                    }
                    qq.last_element = element;
                    break;
                }
                Verdict::JumpToStatus(short_idx) => {
                    let Some(urb) = qq.urbs.front() else {
                        break;
                    };
                    let last = urb.tds.len() - 1;
                    // Retire the skipped data TDs and shrink the short TD's
                    // expected length so later walks see a finished data
                    // stage instead of re-detecting the short packet.
                    let short_tdm = TdMem(self.pool.td_phys(urb.tds[short_idx]));
                    let got = status_actual_len(short_tdm.ctrl_sts(&mut self.mem));
                    let token = short_tdm.token(&mut self.mem);
                    short_tdm.set_token(&mut self.mem, token_set_expected_len(token, got));
                    for &td in &urb.tds[short_idx + 1..last] {
                        let tdm = TdMem(self.pool.td_phys(td));
                        let token = tdm.token(&mut self.mem);
                        tdm.set_token(&mut self.mem, token_set_expected_len(token, 0));
                        tdm.set_ctrl_sts(&mut self.mem, TD_CTRL_ACTLEN_MASK);
                    }
                    qh_mem.set_element(
                        &mut self.mem,
                        LinkPointer::to_td(self.pool.td_phys(urb.tds[last])),
                    );
                    break;
                }
                Verdict::Give(status, actual) => {
                    if status.is_error() && status != TransferStatus::Cancelled {
                        // Park the element pointer while the queue is
                        // repaired; restart re-aims it below.
                        qh_mem.set_element(&mut self.mem, LinkPointer::TERM);
                        qq.stopped = true;
                    }
                    let Some(urb) = qq.urbs.pop_front() else {
                        break;
                    };
                    for &td in &urb.tds {
                        self.pool.free_td(td);
                    }
                    self.transfers.remove(&urb.id);
                    completions.push(Completion {
                        id: urb.id,
                        endpoint: ep,
                        status,
                        actual_length: actual,
                        iso_packets: Vec::new(),
                    });
                }
            }
        }

        // Cancelled chains queued behind a live one can only be plucked out
        // while the queue is frozen.
        if need_restart {
            let mut idx = 0;
            while idx < qq.urbs.len() {
                if !qq.urbs[idx].cancelled {
                    idx += 1;
                    continue;
                }
                let Some(urb) = qq.urbs.remove(idx) else {
                    break;
                };
                for &td in &urb.tds {
                    self.pool.free_td(td);
                }
                self.transfers.remove(&urb.id);
                completions.push(Completion {
                    id: urb.id,
                    endpoint: ep,
                    status: TransferStatus::Cancelled,
                    actual_length: 0,
                    iso_packets: Vec::new(),
                });
            }
        }

        if need_restart {
            // Rebuild the survivor chain: stitch the remaining TDs back
            // together, resync their toggles and re-aim the element pointer.
            let mut pending: Vec<TdHandle> = Vec::new();
            for (k, urb) in qq.urbs.iter().enumerate() {
                for &td in &urb.tds {
                    if k == 0 && pending.is_empty() {
                        let ctrl = TdMem(self.pool.td_phys(td)).ctrl_sts(&mut self.mem);
                        if ctrl & TD_CTRL_ACTIVE == 0 {
                            // Already executed before the freeze.
                            continue;
                        }
                    }
                    pending.push(td);
                }
            }

            if let Some(dummy) = qq.dummy {
                for pair in pending.windows(2) {
                    TdMem(self.pool.td_phys(pair[0])).set_link(
                        &mut self.mem,
                        LinkPointer::to_td_depth(self.pool.td_phys(pair[1])),
                    );
                }
                if let Some(&last) = pending.last() {
                    TdMem(self.pool.td_phys(last)).set_link(
                        &mut self.mem,
                        LinkPointer::to_td_depth(self.pool.td_phys(dummy)),
                    );
                }

                if !is_control && !pending.is_empty() {
                    let first_token =
                        TdMem(self.pool.td_phys(pending[0])).token(&mut self.mem);
                    let mut toggle = resync.unwrap_or_else(|| token_toggle(first_token));
                    for &td in &pending {
                        let tdm = TdMem(self.pool.td_phys(td));
                        let token = tdm.token(&mut self.mem);
                        if token_toggle(token) != toggle {
                            tdm.set_token(&mut self.mem, token ^ TD_TOKEN_TOGGLE);
                        }
                        toggle = !toggle;
                    }
                    self.toggles.insert(ep, toggle);
                } else if !is_control {
                    if let Some(toggle) = resync {
                        self.toggles.insert(ep, toggle);
                    }
                }

                let target = pending.first().copied().unwrap_or(dummy);
                qh_mem.set_element(
                    &mut self.mem,
                    LinkPointer::to_td(self.pool.td_phys(target)),
                );
            }
            qq.stopped = false;
        }

        // Drained queue: take it out of the schedule. The QH stays allocated
        // for the endpoint's next transfer; it may relink only after a frame
        // boundary confirms the hardware let go.
        if qq.urbs.is_empty() && qq.state == QueueState::Active {
            if let Some(sched) = self.sched.as_mut() {
                sched.unlink_qh(&mut self.mem, &self.pool, qq.skel_idx, qh);
            }
            qq.state = QueueState::Unlinking;
            qq.unlink_frame = frnum;
            qq.advance_deadline_ms = None;
        }
    }

    fn scan_iso_queue(&mut self, ep: EndpointAddr, frnum: u16, completions: &mut Vec<Completion>) {
        let Some(qq) = self.queues.get_mut(&ep) else {
            return;
        };
        let Some(sched) = self.sched.as_mut() else {
            return;
        };

        loop {
            let Some(urb) = qq.urbs.front_mut() else {
                break;
            };
            while urb.iso_results.len() < urb.tds.len() {
                let i = urb.iso_results.len();
                let td = urb.tds[i];
                let frame = urb.iso_slots[i];
                let tdm = TdMem(self.pool.td_phys(td));
                let ctrl = tdm.ctrl_sts(&mut self.mem);
                let expired = frame_before(frame, frnum);

                if ctrl & TD_CTRL_ACTIVE != 0 && !expired && !urb.cancelled {
                    break;
                }
                let result = if ctrl & TD_CTRL_ACTIVE != 0 {
                    // Never executed: either torn down early or the frame
                    // went by without the controller reaching it.
                    let status = if urb.cancelled {
                        TransferStatus::Cancelled
                    } else {
                        TransferStatus::Overrun
                    };
                    IsoPacketResult { status, actual: 0 }
                } else {
                    IsoPacketResult {
                        status: status_from_td(ctrl),
                        actual: status_actual_len(ctrl),
                    }
                };
                sched.remove_iso_td(&mut self.mem, &self.pool, frame, td);
                self.pool.free_td(td);
                urb.iso_results.push(result);
            }

            if urb.iso_results.len() < urb.tds.len() {
                break;
            }
            let Some(urb) = qq.urbs.pop_front() else {
                break;
            };
            self.transfers.remove(&urb.id);
            let actual = urb.iso_results.iter().map(|r| r.actual).sum();
            let status = if urb.cancelled {
                TransferStatus::Cancelled
            } else {
                TransferStatus::Completed
            };
            completions.push(Completion {
                id: urb.id,
                endpoint: ep,
                status,
                actual_length: actual,
                iso_packets: urb.iso_results,
            });
        }

        if qq.urbs.is_empty() {
            qq.state = QueueState::Idle;
            if qq.reserved {
                self.load.release(qq.period, qq.phase, qq.load);
                qq.reserved = false;
            }
        }
    }

    /// Retire unlinks whose frame boundary has passed; queues that picked up
    /// new work while unlinking go straight back into the schedule.
    fn reap_unlinks(&mut self, frnum: u16) {
        let mut relink = Vec::new();
        for (&ep, qq) in self.queues.iter_mut() {
            if qq.state != QueueState::Unlinking {
                continue;
            }
            if !frame_before(qq.unlink_frame, frnum) {
                continue;
            }
            qq.state = QueueState::Idle;
            if qq.urbs.is_empty() {
                if qq.reserved {
                    self.load.release(qq.period, qq.phase, qq.load);
                    qq.reserved = false;
                }
            } else {
                relink.push(ep);
            }
        }
        for ep in relink {
            self.link_if_idle(ep);
        }
    }

    /// Keep the FSBR loop in step with demand, with the configured off-delay
    /// so back-to-back transfers do not thrash the async tail link.
    fn service_fsbr(&mut self, now_ms: u64) {
        let wanted = self.fsbr_wanted();
        let Some(sched) = self.sched.as_mut() else {
            return;
        };
        if wanted {
            self.fsbr_off_deadline_ms = None;
            sched.set_fsbr(&mut self.mem, &self.pool, true);
        } else if sched.fsbr_is_on() {
            match self.fsbr_off_deadline_ms {
                None => self.fsbr_off_deadline_ms = Some(now_ms + FSBR_OFF_DELAY_MS),
                Some(deadline) if now_ms >= deadline => {
                    sched.set_fsbr(&mut self.mem, &self.pool, false);
                    self.fsbr_off_deadline_ms = None;
                }
                Some(_) => {}
            }
        }
    }
}
