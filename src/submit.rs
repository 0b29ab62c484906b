//! TD chain construction for transfer submission.
//!
//! Queued transfers (control, bulk, interrupt) extend a queue the hardware
//! may be mid-traversal of. The only safe way to do that without locking the
//! hardware out is the trailing-dummy handoff: every chain ends in an
//! inactive dummy TD; a new chain is fully written *behind* the old dummy,
//! which then becomes the chain's first TD and is activated with a single
//! status-word store. That store is the publication point: everything written
//! before it must be visible to the bus first (on real hardware a release
//! barrier; through [`MemoryBus`] the write ordering is the implementation's
//! contract).

use crate::hw::{
    self, LinkPointer, TdMem, PID_IN, PID_OUT, PID_SETUP, TD_CTRL_ACTIVE, TD_CTRL_CERR_SHIFT,
    TD_CTRL_IOC, TD_CTRL_IOS, TD_CTRL_LOWSPEED, TD_CTRL_SPD,
};
use crate::mem::MemoryBus;
use crate::pool::{DescriptorPool, TdHandle};
use crate::qh::QueueQh;
use crate::transfer::{Direction, TransferFlags, TransferRequest, UsbSpeed};
use crate::Result;

/// One TD's worth of chain contents, before placement in the pool.
pub(crate) struct TdSpec {
    pub ctrl: u32,
    pub token: u32,
    pub buffer: u32,
}

fn base_ctrl(speed: UsbSpeed) -> u32 {
    let mut ctrl = TD_CTRL_ACTIVE | (3 << TD_CTRL_CERR_SHIFT);
    if speed == UsbSpeed::Low {
        ctrl |= TD_CTRL_LOWSPEED;
    }
    ctrl
}

fn data_pid(direction: Direction) -> u8 {
    match direction {
        Direction::In => PID_IN,
        Direction::Out => PID_OUT,
    }
}

/// Build the spec list for a control transfer: SETUP, alternating-toggle DATA
/// TDs, then a STATUS TD with inverted direction and toggle forced to 1.
pub(crate) fn control_specs(req: &TransferRequest, setup_dma: u32) -> Vec<TdSpec> {
    let ep = req.endpoint;
    let ctrl = base_ctrl(req.speed);
    let max_packet = usize::from(req.max_packet.max(8));
    let mut specs = Vec::new();

    specs.push(TdSpec {
        ctrl,
        token: hw::td_token(PID_SETUP, ep.device, ep.endpoint, false, 8),
        buffer: setup_dma,
    });

    let mut toggle = true;
    let mut offset = 0usize;
    while offset < req.length {
        let chunk = (req.length - offset).min(max_packet);
        let mut data_ctrl = ctrl;
        if ep.direction == Direction::In {
            data_ctrl |= TD_CTRL_SPD;
        }
        specs.push(TdSpec {
            ctrl: data_ctrl,
            token: hw::td_token(data_pid(ep.direction), ep.device, ep.endpoint, toggle, chunk),
            buffer: req.buffer + offset as u32,
        });
        toggle = !toggle;
        offset += chunk;
    }

    // Status stage runs opposite the data stage (IN when there was no data)
    // and always uses DATA1.
    let status_pid = match (req.length, ep.direction) {
        (0, _) | (_, Direction::Out) => PID_IN,
        (_, Direction::In) => PID_OUT,
    };
    specs.push(TdSpec {
        ctrl: ctrl | TD_CTRL_IOC,
        token: hw::td_token(status_pid, ep.device, ep.endpoint, true, 0),
        buffer: 0,
    });
    specs
}

/// Build the spec list for a bulk or interrupt transfer, continuing the
/// endpoint's remembered toggle. Returns the toggle value the endpoint holds
/// after the whole chain completes.
pub(crate) fn queued_specs(req: &TransferRequest, mut toggle: bool) -> (Vec<TdSpec>, bool) {
    let ep = req.endpoint;
    let ctrl = base_ctrl(req.speed);
    let max_packet = usize::from(req.max_packet.max(1));
    let mut specs = Vec::new();

    let mut offset = 0usize;
    loop {
        let chunk = (req.length - offset).min(max_packet);
        let mut td_ctrl = ctrl;
        if ep.direction == Direction::In {
            td_ctrl |= TD_CTRL_SPD;
        }
        specs.push(TdSpec {
            ctrl: td_ctrl,
            token: hw::td_token(data_pid(ep.direction), ep.device, ep.endpoint, toggle, chunk),
            buffer: req.buffer + offset as u32,
        });
        toggle = !toggle;
        offset += chunk;
        if offset >= req.length {
            break;
        }
    }

    // Zero-length terminator marking end-of-transfer on the wire.
    if req.flags.contains(TransferFlags::ZERO_PACKET)
        && ep.direction == Direction::Out
        && req.length > 0
    {
        specs.push(TdSpec {
            ctrl,
            token: hw::td_token(PID_OUT, ep.device, ep.endpoint, toggle, 0),
            buffer: 0,
        });
        toggle = !toggle;
    }

    if let Some(last) = specs.last_mut() {
        last.ctrl |= TD_CTRL_IOC;
    }
    (specs, toggle)
}

/// Spec for one isochronous packet TD. Isochronous TDs never retry and carry
/// no toggle; IOC goes on the final packet only.
pub(crate) fn iso_spec(req: &TransferRequest, offset: u32, length: u16, last: bool) -> TdSpec {
    let ep = req.endpoint;
    let mut ctrl = TD_CTRL_ACTIVE | TD_CTRL_IOS;
    if last {
        ctrl |= TD_CTRL_IOC;
    }
    TdSpec {
        ctrl,
        token: hw::td_token(
            data_pid(ep.direction),
            ep.device,
            ep.endpoint,
            false,
            usize::from(length),
        ),
        buffer: req.buffer + offset,
    }
}

/// Append a fully built chain behind the queue's trailing dummy.
///
/// On success the old dummy has become the chain's (now active) first TD, a
/// fresh inactive dummy terminates the queue, and the returned handles cover
/// the chain in traversal order. On allocation failure nothing in the
/// schedule is mutated.
pub(crate) fn append_chain(
    mem: &mut dyn MemoryBus,
    pool: &mut DescriptorPool,
    qq: &mut QueueQh,
    specs: &[TdSpec],
) -> Result<Vec<TdHandle>> {
    debug_assert!(!specs.is_empty());
    let Some(first) = qq.dummy else {
        unreachable!("queued QH always carries a dummy TD")
    };

    // Reserve every slot up front so failure leaves no partial chain.
    let mut fresh: Vec<TdHandle> = Vec::with_capacity(specs.len());
    for _ in 0..specs.len() {
        match pool.alloc_td() {
            Ok(td) => fresh.push(td),
            Err(err) => {
                for td in fresh {
                    pool.free_td(td);
                }
                return Err(err);
            }
        }
    }

    // Chain slots: old dummy, then all but the last fresh TD; the last fresh
    // TD is the new dummy.
    let mut chain = Vec::with_capacity(specs.len());
    chain.push(first);
    chain.extend_from_slice(&fresh[..specs.len() - 1]);
    let new_dummy = fresh[specs.len() - 1];

    TdMem(pool.td_phys(new_dummy)).write_all(mem, LinkPointer::TERM, 0, 0, 0);

    // Everything after the first TD is unreachable until the first TD goes
    // active, so full writes are fine there.
    for (i, spec) in specs.iter().enumerate().skip(1) {
        let next = if i + 1 < specs.len() {
            chain[i + 1]
        } else {
            new_dummy
        };
        TdMem(pool.td_phys(chain[i])).write_all(
            mem,
            LinkPointer::to_td_depth(pool.td_phys(next)),
            spec.ctrl,
            spec.token,
            spec.buffer,
        );
    }

    // The old dummy may be sitting under the hardware's element pointer.
    // Fill in its passive fields first; the status store activating it comes
    // last and publishes the whole chain.
    let first_td = TdMem(pool.td_phys(first));
    let first_next = if specs.len() > 1 { chain[1] } else { new_dummy };
    first_td.set_link(mem, LinkPointer::to_td_depth(pool.td_phys(first_next)));
    first_td.set_token(mem, specs[0].token);
    first_td.set_buffer(mem, specs[0].buffer);
    first_td.set_ctrl_sts(mem, specs[0].ctrl);

    qq.dummy = Some(new_dummy);
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{EndpointAddr, TransferKind};

    fn bulk_out_req(length: usize, flags: TransferFlags) -> TransferRequest {
        TransferRequest {
            endpoint: EndpointAddr {
                device: 3,
                endpoint: 2,
                direction: Direction::Out,
            },
            speed: UsbSpeed::Full,
            buffer: 0x8000,
            length,
            max_packet: 64,
            flags,
            kind: TransferKind::Bulk,
        }
    }

    #[test]
    fn bulk_out_130_bytes_with_zero_packet() {
        let (specs, toggle) = queued_specs(&bulk_out_req(130, TransferFlags::ZERO_PACKET), false);
        let lens: Vec<usize> = specs
            .iter()
            .map(|s| hw::token_expected_len(s.token))
            .collect();
        assert_eq!(lens, [64, 64, 2, 0]);
        let toggles: Vec<bool> = specs.iter().map(|s| hw::token_toggle(s.token)).collect();
        assert_eq!(toggles, [false, true, false, true]);
        assert_eq!(toggle, false);
        // Only the last TD interrupts on completion.
        assert!(specs[..3].iter().all(|s| s.ctrl & TD_CTRL_IOC == 0));
        assert_ne!(specs[3].ctrl & TD_CTRL_IOC, 0);
    }

    #[test]
    fn zero_packet_terminates_a_partial_final_packet_too() {
        let (specs, toggle) = queued_specs(&bulk_out_req(100, TransferFlags::ZERO_PACKET), false);
        let lens: Vec<usize> = specs
            .iter()
            .map(|s| hw::token_expected_len(s.token))
            .collect();
        assert_eq!(lens, [64, 36, 0]);
        // Three packets on the wire, so the endpoint's next toggle is DATA1.
        assert!(toggle);
    }

    #[test]
    fn zero_length_out_is_a_single_null_packet() {
        let (specs, toggle) = queued_specs(&bulk_out_req(0, TransferFlags::empty()), true);
        assert_eq!(specs.len(), 1);
        assert_eq!(hw::token_expected_len(specs[0].token), 0);
        assert!(hw::token_toggle(specs[0].token));
        assert!(!toggle);
    }

    #[test]
    fn control_chain_shape() {
        let mut req = bulk_out_req(0, TransferFlags::empty());
        req.endpoint.endpoint = 0;
        req.endpoint.direction = Direction::In;
        req.length = 18;
        req.max_packet = 8;
        req.kind = TransferKind::Control { setup_dma: 0x7000 };

        let specs = control_specs(&req, 0x7000);
        // SETUP + 3 data packets (8+8+2) + STATUS.
        assert_eq!(specs.len(), 5);
        assert_eq!(hw::token_pid(specs[0].token), PID_SETUP);
        assert!(!hw::token_toggle(specs[0].token));
        assert_eq!(hw::token_expected_len(specs[0].token), 8);

        let toggles: Vec<bool> = specs[1..4].iter().map(|s| hw::token_toggle(s.token)).collect();
        assert_eq!(toggles, [true, false, true]);
        assert!(specs[1..4]
            .iter()
            .all(|s| hw::token_pid(s.token) == PID_IN && s.ctrl & TD_CTRL_SPD != 0));

        // Status: inverted direction, DATA1, zero length, IOC.
        let status = &specs[4];
        assert_eq!(hw::token_pid(status.token), PID_OUT);
        assert!(hw::token_toggle(status.token));
        assert_eq!(hw::token_expected_len(status.token), 0);
        assert_ne!(status.ctrl & TD_CTRL_IOC, 0);
    }

    #[test]
    fn low_speed_tds_carry_ls_bit() {
        let mut req = bulk_out_req(8, TransferFlags::empty());
        req.speed = UsbSpeed::Low;
        let (specs, _) = queued_specs(&req, false);
        assert!(specs.iter().all(|s| s.ctrl & TD_CTRL_LOWSPEED != 0));
    }
}
