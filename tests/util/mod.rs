//! Shared test harness: fake DMA memory, a fake register block and a small
//! schedule-walking controller model.
//!
//! The controller model executes one frame at a time the way the hardware
//! does: frame-list entry, spliced isochronous TDs, then the queue-head
//! hierarchy, honoring depth-first links, SPD halts and error halts. Devices
//! script their responses per transaction; everything a device is asked to do
//! is logged so tests can assert on wire-level ordering, toggles and lengths.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use uhci_hcd::regs::{
    FRAME_INDEX_MASK, FRNUM_MASK, NUM_PORTS, PORTSC_CCS, PORTSC_CSC, PORTSC_LSDA, PORTSC_PED,
    PORTSC_PEDC, PORTSC_PR, PORTSC_RD, PORTSC_SUSP, REG_FLBASEADD, REG_FRNUM, REG_PORTSC1,
    REG_USBCMD, REG_USBINTR, REG_USBSTS, USBCMD_HCRESET, USBCMD_RS, USBSTS_USBERRINT,
    USBSTS_USBINT, USBSTS_W1C_MASK,
};
use uhci_hcd::{
    Completion, CompletionHandler, HcdConfig, MemoryBus, Quirks, RegisterIo, UhciHcd,
};

pub const FRAME_BASE: u32 = 0x1000;
pub const POOL_BASE: u32 = 0x2000;
pub const BUF_BASE: u32 = 0x8000;
pub const SETUP_BASE: u32 = 0x7000;
const MEM_SIZE: usize = 0x2_0000;

// Link/TD bit knowledge the controller model needs; mirrors the register-level
// layout rather than reaching into the driver's internals.
const LINK_TERM: u32 = 1 << 0;
const LINK_QH: u32 = 1 << 1;
const LINK_DEPTH: u32 = 1 << 2;
const ADDR_MASK: u32 = 0xffff_fff0;
const CTRL_ACTIVE: u32 = 1 << 23;
const CTRL_IOC: u32 = 1 << 24;
const CTRL_IOS: u32 = 1 << 25;
const CTRL_SPD: u32 = 1 << 29;
const CTRL_STALLED: u32 = 1 << 22;
const CTRL_CRC_TIMEOUT: u32 = 1 << 18;
const ACTLEN_MASK: u32 = 0x7ff;
const TOKEN_TOGGLE: u32 = 1 << 19;

#[derive(Clone)]
pub struct TestMemory(Rc<RefCell<Vec<u8>>>);

impl TestMemory {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(vec![0; MEM_SIZE])))
    }

    pub fn read32(&self, paddr: u32) -> u32 {
        let mem = self.0.borrow();
        let i = paddr as usize;
        u32::from_le_bytes([mem[i], mem[i + 1], mem[i + 2], mem[i + 3]])
    }

    pub fn write32(&self, paddr: u32, value: u32) {
        self.0.borrow_mut()[paddr as usize..paddr as usize + 4]
            .copy_from_slice(&value.to_le_bytes());
    }

    pub fn fill(&self, paddr: u32, data: &[u8]) {
        self.0.borrow_mut()[paddr as usize..paddr as usize + data.len()].copy_from_slice(data);
    }

    pub fn bytes(&self, paddr: u32, len: usize) -> Vec<u8> {
        self.0.borrow()[paddr as usize..paddr as usize + len].to_vec()
    }
}

impl MemoryBus for TestMemory {
    fn read_physical(&mut self, paddr: u32, buf: &mut [u8]) {
        let mem = self.0.borrow();
        buf.copy_from_slice(&mem[paddr as usize..paddr as usize + buf.len()]);
    }

    fn write_physical(&mut self, paddr: u32, buf: &[u8]) {
        self.0.borrow_mut()[paddr as usize..paddr as usize + buf.len()].copy_from_slice(buf);
    }
}

#[derive(Default)]
struct PortState {
    connected: bool,
    low_speed: bool,
    enabled: bool,
    csc: bool,
    pedc: bool,
    pr: bool,
    susp: bool,
    rd: bool,
}

#[derive(Default)]
struct RegState {
    cmd: u16,
    sts: u16,
    intr: u16,
    frnum: u16,
    flbase: u32,
    sofmod: u16,
    ports: [PortState; NUM_PORTS],
    quirks: Quirks,
}

#[derive(Clone)]
pub struct TestRegs(Rc<RefCell<RegState>>);

impl TestRegs {
    pub fn new() -> Self {
        Self::with_quirks(Quirks::empty())
    }

    pub fn with_quirks(quirks: Quirks) -> Self {
        let mut state = RegState::default();
        state.quirks = quirks;
        Self(Rc::new(RefCell::new(state)))
    }

    pub fn cmd(&self) -> u16 {
        self.0.borrow().cmd
    }

    pub fn frnum(&self) -> u16 {
        self.0.borrow().frnum & FRNUM_MASK
    }

    pub fn set_frnum(&self, frame: u16) {
        self.0.borrow_mut().frnum = frame & FRNUM_MASK;
    }

    pub fn running(&self) -> bool {
        self.cmd() & USBCMD_RS != 0
    }

    /// Plug a device into a root port.
    pub fn attach(&self, port: usize, low_speed: bool) {
        let mut state = self.0.borrow_mut();
        let p = &mut state.ports[port];
        p.connected = true;
        p.low_speed = low_speed;
        p.csc = true;
    }

    pub fn detach(&self, port: usize) {
        let mut state = self.0.borrow_mut();
        let p = &mut state.ports[port];
        p.connected = false;
        if p.enabled {
            p.enabled = false;
            p.pedc = true;
        }
        p.csc = true;
    }

    /// Device-initiated remote wakeup on a suspended port.
    pub fn drive_resume(&self, port: usize) {
        self.0.borrow_mut().ports[port].rd = true;
    }

    pub fn intr(&self) -> u16 {
        self.0.borrow().intr
    }

    /// Latch status bits as the hardware would.
    pub fn raise(&self, bits: u16) {
        self.0.borrow_mut().sts |= bits;
    }
}

impl RegisterIo for TestRegs {
    fn read16(&mut self, reg: u16) -> u16 {
        let state = self.0.borrow();
        match reg {
            REG_USBCMD => state.cmd,
            REG_USBSTS => state.sts,
            REG_FRNUM => state.frnum & FRNUM_MASK,
            _ if reg >= REG_PORTSC1 && reg < REG_PORTSC1 + 2 * NUM_PORTS as u16 => {
                let p = &state.ports[usize::from((reg - REG_PORTSC1) / 2)];
                let mut v = 0;
                if p.connected {
                    v |= PORTSC_CCS;
                }
                if p.csc {
                    v |= PORTSC_CSC;
                }
                if p.enabled {
                    v |= PORTSC_PED;
                }
                if p.pedc {
                    v |= PORTSC_PEDC;
                }
                if p.low_speed {
                    v |= PORTSC_LSDA;
                }
                if p.pr {
                    v |= PORTSC_PR;
                }
                if p.susp {
                    v |= PORTSC_SUSP;
                }
                if p.rd {
                    v |= PORTSC_RD;
                }
                v
            }
            _ => 0,
        }
    }

    fn write16(&mut self, reg: u16, value: u16) {
        let mut state = self.0.borrow_mut();
        match reg {
            REG_USBCMD => {
                if value & USBCMD_HCRESET != 0 {
                    // Self-clearing reset wipes run state.
                    state.cmd = value & !(USBCMD_HCRESET | USBCMD_RS);
                    state.sts = 0;
                    state.frnum = 0;
                } else {
                    state.cmd = value;
                }
            }
            REG_USBSTS => state.sts &= !(value & USBSTS_W1C_MASK),
            REG_FRNUM => state.frnum = value & FRNUM_MASK,
            REG_USBINTR => state.intr = value,
            _ if reg >= REG_PORTSC1 && reg < REG_PORTSC1 + 2 * NUM_PORTS as u16 => {
                let p = &mut state.ports[usize::from((reg - REG_PORTSC1) / 2)];
                if value & PORTSC_CSC != 0 {
                    p.csc = false;
                }
                if value & PORTSC_PEDC != 0 {
                    p.pedc = false;
                }
                p.pr = value & PORTSC_PR != 0;
                p.susp = value & PORTSC_SUSP != 0;
                p.rd = value & PORTSC_RD != 0;
                if value & PORTSC_PED != 0 {
                    p.enabled = p.connected;
                } else {
                    p.enabled = false;
                }
            }
            _ => {}
        }
    }

    fn read32(&mut self, reg: u16) -> u32 {
        if reg == REG_FLBASEADD {
            self.0.borrow().flbase
        } else {
            0
        }
    }

    fn write32(&mut self, reg: u16, value: u32) {
        if reg == REG_FLBASEADD {
            self.0.borrow_mut().flbase = value;
        }
    }

    fn quirks(&self) -> Quirks {
        self.0.borrow().quirks
    }
}

#[derive(Default)]
pub struct Collector {
    pub completions: Vec<Completion>,
    pub gone: bool,
}

impl CompletionHandler for Collector {
    fn complete(&mut self, completion: Completion) {
        self.completions.push(completion);
    }

    fn controller_gone(&mut self) {
        self.gone = true;
    }
}

/// What a device did with one transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Xact {
    /// Accept the packet, transferring this many bytes.
    Ack(usize),
    Nak,
    Stall,
    Timeout,
}

/// One executed transaction, as seen on the wire.
#[derive(Clone, Copy, Debug)]
pub struct WireEvent {
    pub frame: u16,
    pub pid: u8,
    pub device: u8,
    pub endpoint: u8,
    pub toggle: bool,
    pub length: usize,
}

/// Scripted device: answers transactions from a response queue, falling back
/// to accepting everything in full.
#[derive(Default)]
pub struct FakeDevice {
    pub responses: VecDeque<Xact>,
    pub log: Vec<WireEvent>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&mut self, responses: &[Xact]) {
        self.responses.extend(responses.iter().copied());
    }

    fn transact(&mut self, frame: u16, token: u32, expected: usize) -> Xact {
        self.log.push(WireEvent {
            frame,
            pid: (token & 0xff) as u8,
            device: ((token >> 8) & 0x7f) as u8,
            endpoint: ((token >> 15) & 0xf) as u8,
            toggle: token & TOKEN_TOGGLE != 0,
            length: expected,
        });
        self.responses.pop_front().unwrap_or(Xact::Ack(expected))
    }
}

fn expected_len(token: u32) -> usize {
    let raw = (token >> 21) & 0x7ff;
    if raw == 0x7ff {
        0
    } else {
        raw as usize + 1
    }
}

fn encode_actlen(len: usize) -> u32 {
    if len == 0 {
        ACTLEN_MASK
    } else {
        (len as u32 - 1) & ACTLEN_MASK
    }
}

/// Execute one TD. Returns the completed status word, or `None` for a NAK
/// (TD left untouched).
fn execute_td(mem: &TestMemory, dev: &mut FakeDevice, frame: u16, td_addr: u32) -> Option<u32> {
    let ctrl = mem.read32(td_addr + 0x4);
    let token = mem.read32(td_addr + 0x8);
    let buffer = mem.read32(td_addr + 0xc);
    let expected = expected_len(token);
    let keep = ctrl & (CTRL_IOC | CTRL_IOS | CTRL_SPD | (1 << 26) | (3 << 27));

    match dev.transact(frame, token, expected) {
        Xact::Nak if ctrl & CTRL_IOS != 0 => {
            // Isochronous transactions never retry; a missed service is a
            // zero-length completion.
            Some(keep | encode_actlen(0))
        }
        Xact::Nak => None,
        Xact::Stall => Some(keep | CTRL_STALLED | encode_actlen(0)),
        Xact::Timeout => Some(keep | CTRL_CRC_TIMEOUT | encode_actlen(0)),
        Xact::Ack(actual) => {
            let actual = actual.min(expected);
            if (token & 0xff) as u8 == 0x69 {
                // IN: fill the buffer with a recognizable pattern.
                let data = vec![0xab; actual];
                if actual > 0 {
                    mem.fill(buffer, &data);
                }
            }
            Some(keep | encode_actlen(actual))
        }
    }
}

/// Walk and execute one frame of the schedule, then advance FRNUM.
fn run_one_frame(mem: &TestMemory, io: &TestRegs, dev: &mut FakeDevice) {
    let frame = io.frnum();
    let flbase = io.0.borrow().flbase;
    let mut link = mem.read32(flbase + u32::from(frame & FRAME_INDEX_MASK) * 4);

    let mut irq = false;
    let mut err_irq = false;
    let mut hops = 0;

    while link & LINK_TERM == 0 && hops < 256 {
        hops += 1;
        let addr = link & ADDR_MASK;
        if link & LINK_QH != 0 {
            let mut element = mem.read32(addr + 0x4);
            // Execute down the queue while depth-first links allow.
            loop {
                if element & LINK_TERM != 0 || element & LINK_QH != 0 {
                    break;
                }
                let td_addr = element & ADDR_MASK;
                let ctrl = mem.read32(td_addr + 0x4);
                if ctrl & CTRL_ACTIVE == 0 {
                    break;
                }
                let Some(done) = execute_td(mem, dev, frame, td_addr) else {
                    break;
                };
                mem.write32(td_addr + 0x4, done);
                if done & CTRL_IOC != 0 {
                    irq = true;
                }
                if done & (CTRL_STALLED | CTRL_CRC_TIMEOUT) != 0 {
                    err_irq = true;
                    break;
                }
                let actual = done & ACTLEN_MASK;
                let expected = mem.read32(td_addr + 0x8);
                let short = decode_actlen(actual) < expected_len(expected);
                if short && done & CTRL_SPD != 0 {
                    // Short-packet detect halts the queue without advancing
                    // the element pointer.
                    irq = true;
                    break;
                }
                let next = mem.read32(td_addr);
                mem.write32(addr + 0x4, next);
                element = next;
                if next & LINK_DEPTH == 0 {
                    break;
                }
                hops += 1;
                if hops >= 256 {
                    break;
                }
            }
            link = mem.read32(addr);
        } else {
            // Bare TD in the frame list: isochronous, executes exactly once.
            let ctrl = mem.read32(addr + 0x4);
            if ctrl & CTRL_ACTIVE != 0 {
                if let Some(done) = execute_td(mem, dev, frame, addr) {
                    mem.write32(addr + 0x4, done);
                    if done & CTRL_IOC != 0 {
                        irq = true;
                    }
                }
            }
            link = mem.read32(addr);
        }
    }

    if irq {
        io.raise(USBSTS_USBINT);
    }
    if err_irq {
        io.raise(USBSTS_USBERRINT);
    }
    io.set_frnum(frame.wrapping_add(1) & FRNUM_MASK);
}

fn decode_actlen(raw: u32) -> usize {
    if raw == ACTLEN_MASK {
        0
    } else {
        raw as usize + 1
    }
}

/// Run `n` frames of controller time while the controller is running.
pub fn run_frames(mem: &TestMemory, io: &TestRegs, dev: &mut FakeDevice, n: usize) {
    for _ in 0..n {
        if !io.running() {
            break;
        }
        run_one_frame(mem, io, dev);
    }
}

pub fn setup() -> (UhciHcd<TestMemory, TestRegs>, TestMemory, TestRegs) {
    setup_with_quirks(Quirks::empty())
}

pub fn setup_with_quirks(
    quirks: Quirks,
) -> (UhciHcd<TestMemory, TestRegs>, TestMemory, TestRegs) {
    let mem = TestMemory::new();
    let io = TestRegs::with_quirks(quirks);
    let hcd = UhciHcd::new(
        mem.clone(),
        io.clone(),
        HcdConfig {
            frame_list_base: FRAME_BASE,
            pool_base: POOL_BASE,
            qh_slots: 32,
            td_slots: 256,
        },
    );
    (hcd, mem, io)
}

/// Started controller with a full-speed device on port 0.
pub fn setup_running() -> (UhciHcd<TestMemory, TestRegs>, TestMemory, TestRegs) {
    let (mut hcd, mem, io) = setup();
    io.attach(0, false);
    hcd.start(0).expect("controller start");
    (hcd, mem, io)
}
