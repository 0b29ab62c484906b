//! Full-speed bandwidth reclamation: loop behavior and stall demotion.

mod util;

use uhci_hcd::{
    Direction, EndpointAddr, TransferFlags, TransferKind, TransferRequest, UsbSpeed,
};
use util::{run_frames, Collector, FakeDevice, Xact, BUF_BASE};

fn bulk_out(flags: TransferFlags) -> TransferRequest {
    TransferRequest {
        endpoint: EndpointAddr {
            device: 3,
            endpoint: 2,
            direction: Direction::Out,
        },
        speed: UsbSpeed::Full,
        buffer: BUF_BASE,
        length: 64,
        max_packet: 64,
        flags,
        kind: TransferKind::Bulk,
    }
}

#[test]
fn fsbr_polls_a_naking_endpoint_many_times_per_frame() {
    let (mut hcd, mem, io) = util::setup_running();
    let mut dev = FakeDevice::new();

    dev.script(&[Xact::Nak; 512]);
    hcd.submit(bulk_out(TransferFlags::empty())).unwrap();
    run_frames(&mem, &io, &mut dev, 1);

    // With the async tail looping through the terminator, the controller
    // revisits the queue for the rest of the frame.
    assert!(
        dev.log.len() > 10,
        "only {} polls in one frame",
        dev.log.len()
    );
}

#[test]
fn no_fsbr_flag_keeps_one_poll_per_frame() {
    let (mut hcd, mem, io) = util::setup_running();
    let mut dev = FakeDevice::new();

    dev.script(&[Xact::Nak; 512]);
    hcd.submit(bulk_out(TransferFlags::NO_FSBR)).unwrap();
    run_frames(&mem, &io, &mut dev, 1);

    assert_eq!(dev.log.len(), 1);
}

#[test]
fn stalled_out_queue_is_demoted_after_advance_timeout() {
    let (mut hcd, mem, io) = util::setup_running();
    let mut dev = FakeDevice::new();
    let mut col = Collector::default();

    dev.script(&[Xact::Nak; 4096]);
    hcd.submit(bulk_out(TransferFlags::empty())).unwrap();

    // First scan records the element pointer, second arms the advance
    // deadline, third (past 200 ms) demotes, and the off-delay then expires.
    hcd.poll(&mut col, 100);
    hcd.poll(&mut col, 101);
    hcd.poll(&mut col, 302);
    hcd.poll(&mut col, 320);

    dev.log.clear();
    run_frames(&mem, &io, &mut dev, 1);
    assert_eq!(dev.log.len(), 1, "reclamation loop still active");
}
