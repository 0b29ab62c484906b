//! Root-hub port management and controller power states.
//!
//! The two root ports live in PORTSC registers rather than behind hub
//! requests, so port reset and resume signalling are driven from here with
//! wall-clock deadlines instead of frame counting. The hub also owns the
//! controller's run state: with no devices connected the schedule is pure
//! overhead, so after an idle grace period the controller is auto-stopped
//! (and globally suspended where the chipset tolerates it) until a connect
//! shows up in the next poll.

use crate::bus::{Quirks, RegisterIo};
use crate::regs::{
    NUM_PORTS, PORTSC_CCS, PORTSC_CSC, PORTSC_LSDA, PORTSC_PED, PORTSC_PEDC, PORTSC_PR,
    PORTSC_RD, PORTSC_SUSP, PORTSC_W1C_MASK, REG_PORTSC1, REG_USBCMD, USBCMD_CF, USBCMD_EGSM,
    USBCMD_FGR, USBCMD_MAXP, USBCMD_RS,
};
use crate::transfer::UsbSpeed;

/// How long both root ports may sit disconnected before the controller is
/// stopped.
pub const AUTOSTOP_DELAY_MS: u64 = 1000;

/// Root-port reset assertion time.
pub const PORT_RESET_MS: u64 = 50;

/// Resume signalling time, for both per-port and global resume.
pub const PORT_RESUME_MS: u64 = 20;

/// Controller run states, from the root hub's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RhState {
    /// Not yet started (or stopped for teardown).
    Reset,
    /// Schedule running with at least one connected port.
    Running,
    /// Schedule running, no devices; the auto-stop timer is armed.
    RunningNodevs,
    /// Run/Stop cleared because the bus stayed empty; a connect restarts it.
    AutoStopped,
    /// Explicitly suspended by the upstream core.
    Suspended,
    /// Global resume signalling in progress; running again once the FGR
    /// pulse ends.
    Resuming,
}

impl RhState {
    pub fn is_running(self) -> bool {
        matches!(self, RhState::Running | RhState::RunningNodevs)
    }
}

/// Latched change bits for one port, reported to the upstream hub driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortChange {
    pub connect: bool,
    pub enable: bool,
}

pub(crate) struct RootHub {
    state: RhState,
    /// Ports with resume signalling asserted; bit per port. RESUMEDETECT is
    /// only acked once the corresponding pulse has been completed.
    resuming_ports: u8,
    resume_deadline_ms: [u64; NUM_PORTS],
    reset_deadline_ms: [Option<u64>; NUM_PORTS],
    /// Deadline for ending a global-resume FGR pulse.
    fgr_deadline_ms: Option<u64>,
    /// When both ports were last seen occupied (or the controller started).
    idle_since_ms: u64,
    changes: [PortChange; NUM_PORTS],
}

fn portsc_reg(port: usize) -> u16 {
    debug_assert!(port < NUM_PORTS);
    REG_PORTSC1 + (port as u16) * 2
}

impl RootHub {
    pub(crate) fn new() -> Self {
        Self {
            state: RhState::Reset,
            resuming_ports: 0,
            resume_deadline_ms: [0; NUM_PORTS],
            reset_deadline_ms: [None; NUM_PORTS],
            fgr_deadline_ms: None,
            idle_since_ms: 0,
            changes: [PortChange::default(); NUM_PORTS],
        }
    }

    pub(crate) fn state(&self) -> RhState {
        self.state
    }

    /// Raw PORTSC value, with the in-progress-resume ports masked so the hub
    /// driver never sees a half-finished RD bit.
    pub(crate) fn port_status(&self, io: &mut dyn RegisterIo, port: usize) -> u16 {
        let mut status = io.read16(portsc_reg(port));
        if self.resuming_ports & (1 << port) != 0 {
            status &= !PORTSC_RD;
        }
        status
    }

    pub(crate) fn port_speed(&self, io: &mut dyn RegisterIo, port: usize) -> UsbSpeed {
        if io.read16(portsc_reg(port)) & PORTSC_LSDA != 0 {
            UsbSpeed::Low
        } else {
            UsbSpeed::Full
        }
    }

    /// Take (and clear) the latched change bits for a port.
    pub(crate) fn take_port_change(&mut self, port: usize) -> PortChange {
        std::mem::take(&mut self.changes[port])
    }

    /// Called once the controller's Run/Stop bit has been set.
    pub(crate) fn set_running(&mut self, now_ms: u64) {
        self.state = RhState::Running;
        self.idle_since_ms = now_ms;
    }

    pub(crate) fn set_stopped(&mut self) {
        self.state = RhState::Reset;
    }

    /// Assert reset on a port. The pulse is completed by a later poll.
    pub(crate) fn reset_port(&mut self, io: &mut dyn RegisterIo, port: usize, now_ms: u64) {
        let reg = portsc_reg(port);
        let status = io.read16(reg) & !PORTSC_W1C_MASK;
        io.write16(reg, status | PORTSC_PR);
        self.reset_deadline_ms[port] = Some(now_ms + PORT_RESET_MS);
    }

    pub(crate) fn suspend_port(&mut self, io: &mut dyn RegisterIo, port: usize) {
        let reg = portsc_reg(port);
        let status = io.read16(reg) & !PORTSC_W1C_MASK;
        io.write16(reg, status | PORTSC_SUSP);
    }

    /// Begin resume signalling on a suspended port; the RD bit is held for
    /// [`PORT_RESUME_MS`] and cleared by a later poll.
    pub(crate) fn resume_port(&mut self, io: &mut dyn RegisterIo, port: usize, now_ms: u64) {
        let reg = portsc_reg(port);
        let status = io.read16(reg) & !PORTSC_W1C_MASK;
        if status & PORTSC_SUSP == 0 {
            return;
        }
        io.write16(reg, status | PORTSC_RD);
        self.resuming_ports |= 1 << port;
        self.resume_deadline_ms[port] = now_ms + PORT_RESUME_MS;
    }

    /// Explicit global suspend requested by the upstream core.
    pub(crate) fn suspend(&mut self, io: &mut dyn RegisterIo) {
        if !self.state.is_running() {
            return;
        }
        let mut cmd = io.read16(REG_USBCMD) & !USBCMD_RS;
        if !io.quirks().contains(Quirks::GLOBAL_SUSPEND_BROKEN) {
            cmd |= USBCMD_EGSM;
        }
        io.write16(REG_USBCMD, cmd);
        self.state = RhState::Suspended;
        tracing::debug!("root hub suspended");
    }

    /// Begin waking from suspend (explicit or auto-stop). Completed by poll
    /// once the FGR pulse has been held long enough; when no resume
    /// signalling is needed the controller restarts immediately.
    pub(crate) fn resume(&mut self, io: &mut dyn RegisterIo, now_ms: u64) {
        match self.state {
            RhState::Suspended => {
                let cmd = io.read16(REG_USBCMD);
                if cmd & USBCMD_EGSM != 0 {
                    io.write16(REG_USBCMD, cmd | USBCMD_FGR);
                    self.fgr_deadline_ms = Some(now_ms + PORT_RESUME_MS);
                    self.state = RhState::Resuming;
                } else {
                    self.restart(io, now_ms);
                }
            }
            RhState::AutoStopped => self.restart(io, now_ms),
            _ => {}
        }
    }

    fn restart(&mut self, io: &mut dyn RegisterIo, now_ms: u64) {
        io.write16(REG_USBCMD, USBCMD_RS | USBCMD_CF | USBCMD_MAXP);
        self.fgr_deadline_ms = None;
        self.set_running(now_ms);
        tracing::debug!("root hub running");
    }

    /// Periodic tick: finish timed pulses, latch port changes, and drive the
    /// run-state machine. `busy` reports whether the schedule still carries
    /// work (auto-stop is deferred while it does).
    pub(crate) fn poll(&mut self, io: &mut dyn RegisterIo, now_ms: u64, busy: bool) {
        if self.state == RhState::Reset {
            return;
        }

        if let Some(deadline) = self.fgr_deadline_ms {
            if now_ms >= deadline {
                // Restart drops FGR and EGSM along with writing RS.
                self.restart(io, now_ms);
            } else {
                return;
            }
        }

        let mut any_connected = false;
        for port in 0..NUM_PORTS {
            let reg = portsc_reg(port);

            if let Some(deadline) = self.reset_deadline_ms[port] {
                if now_ms >= deadline {
                    // End the reset pulse, enable the port and ack the
                    // changes the pulse itself raised.
                    let status = io.read16(reg) & !(PORTSC_PR | PORTSC_W1C_MASK);
                    io.write16(reg, status);
                    io.write16(reg, status | PORTSC_PED | PORTSC_CSC | PORTSC_PEDC);
                    self.reset_deadline_ms[port] = None;
                    self.changes[port].enable = true;
                }
                any_connected = true;
                continue;
            }

            let status = io.read16(reg);

            // Device-initiated resume shows up as RD while suspended; treat
            // it as a pulse we must complete, same as a driver-initiated one.
            if status & PORTSC_RD != 0 && self.resuming_ports & (1 << port) == 0 {
                self.resuming_ports |= 1 << port;
                self.resume_deadline_ms[port] = now_ms + PORT_RESUME_MS;
            }

            if self.resuming_ports & (1 << port) != 0 && now_ms >= self.resume_deadline_ms[port]
            {
                let cleared = status & !(PORTSC_RD | PORTSC_SUSP | PORTSC_W1C_MASK);
                io.write16(reg, cleared);
                self.resuming_ports &= !(1 << port);
            }

            if status & PORTSC_CSC != 0 {
                io.write16(reg, (status & !PORTSC_W1C_MASK) | PORTSC_CSC);
                self.changes[port].connect = true;
            }
            if status & PORTSC_PEDC != 0 {
                io.write16(reg, (status & !PORTSC_W1C_MASK) | PORTSC_PEDC);
                self.changes[port].enable = true;
            }

            if status & PORTSC_CCS != 0 {
                any_connected = true;
            }
        }

        match self.state {
            RhState::Running => {
                if !any_connected && !busy {
                    self.state = RhState::RunningNodevs;
                    self.idle_since_ms = now_ms;
                }
            }
            RhState::RunningNodevs => {
                if any_connected || busy {
                    self.state = RhState::Running;
                } else if now_ms >= self.idle_since_ms + AUTOSTOP_DELAY_MS {
                    let mut cmd = io.read16(REG_USBCMD) & !USBCMD_RS;
                    if !io.quirks().contains(Quirks::GLOBAL_SUSPEND_BROKEN) {
                        cmd |= USBCMD_EGSM;
                    }
                    io.write16(REG_USBCMD, cmd);
                    self.state = RhState::AutoStopped;
                    tracing::debug!("root hub auto-stopped");
                }
            }
            RhState::AutoStopped => {
                // Wake within one poll of a device showing up.
                if any_connected {
                    let cmd = io.read16(REG_USBCMD) & !USBCMD_EGSM;
                    io.write16(REG_USBCMD, cmd);
                    self.restart(io, now_ms);
                }
            }
            _ => {}
        }
    }
}
