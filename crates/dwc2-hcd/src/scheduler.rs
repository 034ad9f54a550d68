//! Per-endpoint transfer scheduling and the channel-halt state machine.
//!
//! Every live endpoint gets one worker thread. The worker owns the
//! endpoint's FIFO, acquires a hardware channel per transfer attempt (one
//! channel spans all three phases of a control transfer), and then sits on
//! the channel's halt event feeding captured interrupt state into the
//! state machine until the request completes, fails, or is requeued at the
//! head of the FIFO for a fresh attempt.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::LocalRegisterCopy;

use crate::device::Endpoint;
use crate::error::Error;
use crate::regs::{
    pid, CHANNEL_CHARACTERISTICS, CHANNEL_INTERRUPTS, CHANNEL_SPLIT_CONTROL, CHANNEL_TRANSFER,
    EP_DIR_IN, EP_DIR_OUT, HOST_FRAME,
};
use crate::request::{CtrlPhase, DmaBuffer, TransferRequest};
use crate::usb::{EndpointType, UsbSpeed};
use crate::DwcInner;

const SETUP_PACKET_SIZE: usize = 8;

/// Written to the DMA address register when a transaction carries no data.
const NO_DATA_DMA_ADDRESS: u64 = 0xffff_ff00;

/// Complete-splits are abandoned (and the split restarted) after this many
/// NYETs in a row.
const CSPLIT_RETRY_LIMIT: u8 = 8;

/// Half a microframe: the NYET retry delay for non-interrupt endpoints.
const NYET_RETRY_DELAY: Duration = Duration::from_nanos(62_500);

/// Log every nth requeued frame overrun.
const FRAME_OVERRUN_THRESHOLD: u32 = 512;

pub(crate) fn spawn(inner: &Arc<DwcInner>, ep: &Arc<Endpoint>) -> Result<(), Error> {
    thread::Builder::new()
        .name(format!("dwc2-ep-{}.{:02x}", ep.device_id, ep.ep_address))
        .spawn({
            let inner = inner.clone();
            let ep = ep.clone();
            move || scheduler_thread(inner, ep)
        })
        .map(drop)
        .map_err(|_| Error::NoMemory)
}

fn scheduler_thread(inner: Arc<DwcInner>, ep: Arc<Endpoint>) {
    // The data toggle survives across requests on non-control endpoints;
    // the hardware reports the next toggle after every halt and it is
    // latched here.
    let mut next_data_toggle = pid::DATA0;
    let mut channel: u8 = 0;

    loop {
        ep.pending_signal.wait();
        let Some(mut req) = ep.pop() else { continue };

        match ep.ep_type() {
            EndpointType::Isochronous => {
                log::error!("isochronous endpoints are not implemented");
                inner.complete_request(req, Err(Error::NotSupported));
                continue;
            }
            EndpointType::Control => match req.ctrl_phase {
                CtrlPhase::Setup => {
                    // A single channel carries all three phases of the
                    // transfer and is held until the transaction ends.
                    channel = inner.channels.acquire();

                    let mut setup_buffer = DmaBuffer::new(SETUP_PACKET_SIZE);
                    setup_buffer
                        .as_mut_slice()
                        .copy_from_slice(&req.usb().setup.to_bytes());
                    inner.dma.cache_flush(setup_buffer.as_slice());
                    req.setup_buffer = Some(setup_buffer);

                    start_transfer(&inner, channel, &mut req, &ep);
                }
                // Later phases re-enter here off the head of the queue with
                // the channel still held.
                CtrlPhase::Data | CtrlPhase::Status => {
                    start_transfer(&inner, channel, &mut req, &ep);
                }
            },
            EndpointType::Bulk => {
                req.next_data_toggle = next_data_toggle;
                channel = inner.channels.acquire();
                start_transfer(&inner, channel, &mut req, &ep);
            }
            EndpointType::Interrupt => {
                req.next_data_toggle = next_data_toggle;
                channel = inner.channels.acquire();
                await_sof_if_necessary(&inner, channel, &req, &ep);
                start_transfer(&inner, channel, &mut req, &ep);
            }
        }

        // The halt interrupt drives the state machine until the request is
        // done with this scheduling cycle.
        let mut in_flight = req;
        loop {
            let interrupts = inner.channel_events[channel as usize].await_halt();
            next_data_toggle = inner.regs.get().host_channels[channel as usize]
                .transfer
                .read(CHANNEL_TRANSFER::PACKET_ID);

            match handle_channel_halt(&inner, channel, in_flight, &ep, interrupts) {
                Some(restarted) => in_flight = restarted,
                None => break,
            }
        }
    }
}

/// Parks the caller until the next usable start of frame, if this transfer
/// needs one: interrupt traffic to low/full-speed devices must not start a
/// split in the microframe reserved for host-initiated complete-splits.
pub(crate) fn await_sof_if_necessary(
    inner: &DwcInner,
    channel: u8,
    req: &TransferRequest,
    ep: &Endpoint,
) {
    if ep.ep_type() == EndpointType::Interrupt
        && !req.complete_split
        && inner.device_info(ep.device_id).speed != UsbSpeed::High
    {
        inner.sof.park(&inner.regs, channel);
    }
}

/// Programs a fresh transfer attempt on `channel`.
fn start_transfer(inner: &DwcInner, channel: u8, req: &mut TransferRequest, ep: &Endpoint) {
    let device = inner.device_info(ep.device_id);
    let descriptor = *ep.descriptor();
    let chan = &inner.regs.get().host_channels[channel as usize];

    req.short_attempt = false;

    let max_packet_size = descriptor.max_packet_size() as u32;
    let ep_type = descriptor.ep_type();

    let mut packets_per_frame: u32 = 1;
    if device.speed == UsbSpeed::High {
        packets_per_frame += descriptor.extra_packets_per_microframe() as u32;
    }

    let direction: u32;
    let packet_id: u32;
    let mut size: u32;
    let mut dma: Option<u64> = None;

    if ep_type == EndpointType::Control {
        match req.ctrl_phase {
            CtrlPhase::Setup => {
                let setup_buffer = req
                    .setup_buffer
                    .as_ref()
                    .expect("SETUP phase without a setup buffer");
                direction = EP_DIR_OUT;
                size = setup_buffer.len() as u32;
                dma = Some(inner.dma.bus_address(setup_buffer.as_slice()));
                packet_id = pid::MDATA_SETUP;
            }
            CtrlPhase::Data => {
                let usb_req = req.usb();
                direction = (usb_req.setup.bm_request_type >> 7) as u32;
                size = (usb_req.length - req.bytes_transferred) as u32;
                inner
                    .dma
                    .cache_flush(&usb_req.buffer.as_slice()[..size as usize]);
                dma = Some(
                    inner.dma.bus_address(usb_req.buffer.as_slice())
                        + req.bytes_transferred as u64,
                );
                // The data stage always opens on DATA1.
                packet_id = if req.bytes_transferred == 0 {
                    pid::DATA1
                } else {
                    req.next_data_toggle
                };
            }
            CtrlPhase::Status => {
                // With no DATA stage the status transaction is IN to the
                // host; otherwise it runs opposite to the data stage.
                let setup = req.usb().setup;
                direction = if setup.w_length == 0 || !setup.is_in() {
                    EP_DIR_IN
                } else {
                    EP_DIR_OUT
                };
                size = 0;
                packet_id = pid::DATA1;
            }
        }
    } else {
        let usb_req = req.usb();
        direction = if descriptor.is_in() { EP_DIR_IN } else { EP_DIR_OUT };
        size = (usb_req.length - req.bytes_transferred) as u32;
        dma = Some(
            inner.dma.bus_address(usb_req.buffer.as_slice()) + req.bytes_transferred as u64,
        );
        packet_id = req.next_data_toggle;
    }

    // Length still owed for this stage before any split trimming; the
    // zero-length-terminator rule below is defined over it, not the
    // per-attempt chunk.
    let stage_remaining = size;

    let mut split_enable = false;
    let mut low_speed = false;
    if device.speed != UsbSpeed::High {
        split_enable = true;
        // Splits carry at most one packet per attempt; the remainder is
        // rescheduled once this attempt completes.
        if size > max_packet_size {
            size = max_packet_size;
            req.short_attempt = true;
        }
        if device.speed == UsbSpeed::Low {
            low_speed = true;
        }
    }

    let address = dma.unwrap_or(NO_DATA_DMA_ADDRESS);
    assert_eq!(address % 4, 0, "DMA address must be word aligned");
    chan.dma_address.set(address as u32);

    let mut packet_count = size.div_ceil(max_packet_size);
    if packet_count == 0 {
        packet_count = 1;
    } else if req.usb().send_zlp
        && !req.short_attempt
        && stage_remaining % max_packet_size == 0
    {
        // The terminator rides on the attempt that carries the last data
        // packet; trimmed split attempts never queue it.
        packet_count += 1;
    }

    req.bytes_queued = size as usize;
    req.total_bytes_queued = size as usize;
    req.packets_queued = packet_count;

    log::trace!(
        "programming request id={} on channel {}, size={} packets={}",
        req.request_id,
        channel,
        size,
        packet_count
    );

    chan.characteristics.write(
        CHANNEL_CHARACTERISTICS::MAX_PACKET_SIZE.val(max_packet_size)
            + CHANNEL_CHARACTERISTICS::ENDPOINT_NUMBER.val(descriptor.number() as u32)
            + CHANNEL_CHARACTERISTICS::ENDPOINT_DIRECTION.val(direction)
            + CHANNEL_CHARACTERISTICS::LOW_SPEED.val(low_speed as u32)
            + CHANNEL_CHARACTERISTICS::ENDPOINT_TYPE.val(ep_type.wire_value())
            + CHANNEL_CHARACTERISTICS::PACKETS_PER_FRAME.val(packets_per_frame)
            + CHANNEL_CHARACTERISTICS::DEVICE_ADDRESS.val(ep.device_id),
    );
    chan.split_control.write(
        CHANNEL_SPLIT_CONTROL::PORT_ADDRESS.val(device.port)
            + CHANNEL_SPLIT_CONTROL::HUB_ADDRESS.val(device.hub_address)
            + CHANNEL_SPLIT_CONTROL::SPLIT_ENABLE.val(split_enable as u32),
    );
    chan.transfer.write(
        CHANNEL_TRANSFER::SIZE.val(size)
            + CHANNEL_TRANSFER::PACKET_COUNT.val(packet_count)
            + CHANNEL_TRANSFER::PACKET_ID.val(packet_id),
    );

    start_transaction(inner, channel, req);
}

/// (Re)starts a transaction on an already-programmed channel.
fn start_transaction(inner: &DwcInner, channel: u8, req: &mut TransferRequest) {
    let regs = inner.regs.get();
    let chan = &regs.host_channels[channel as usize];

    chan.interrupt_mask.set(0);
    chan.interrupts.set(0xffff_ffff);

    chan.split_control
        .modify(CHANNEL_SPLIT_CONTROL::COMPLETE_SPLIT.val(req.complete_split as u32));
    if !req.complete_split {
        req.csplit_retries = 0;
    }

    let next_frame = regs.host_frame_number.read(HOST_FRAME::FRAME_NUMBER) + 1;

    fence(Ordering::SeqCst);
    chan.characteristics.modify(
        CHANNEL_CHARACTERISTICS::ODD_FRAME.val(next_frame & 1)
            + CHANNEL_CHARACTERISTICS::CHANNEL_ENABLE::SET,
    );

    chan.interrupt_mask
        .write(CHANNEL_INTERRUPTS::CHANNEL_HALTED::SET);
    let mask = regs.host_channels_interrupt_mask.get();
    regs.host_channels_interrupt_mask.set(mask | (1 << channel));
}

/// Classifies a channel halt.
///
/// Returns `None` when the request is done with this scheduling cycle
/// (completed, failed, or requeued at the head of the endpoint FIFO), or
/// `Some(req)` when a follow-up transaction was started on the same channel
/// and the caller should keep waiting for halts.
fn handle_channel_halt(
    inner: &DwcInner,
    channel: u8,
    mut req: Box<TransferRequest>,
    ep: &Endpoint,
    interrupts: u32,
) -> Option<Box<TransferRequest>> {
    let ints = LocalRegisterCopy::<u32, CHANNEL_INTERRUPTS::Register>::new(interrupts);
    let chan = &inner.regs.get().host_channels[channel as usize];
    let direction_out =
        chan.characteristics.read(CHANNEL_CHARACTERISTICS::ENDPOINT_DIRECTION) == EP_DIR_OUT;

    let hard_error = ints.is_set(CHANNEL_INTERRUPTS::STALL)
        || ints.is_set(CHANNEL_INTERRUPTS::AHB_ERROR)
        || ints.is_set(CHANNEL_INTERRUPTS::TRANSACTION_ERROR)
        || ints.is_set(CHANNEL_INTERRUPTS::BABBLE_ERROR)
        || ints.is_set(CHANNEL_INTERRUPTS::EXCESS_TRANSACTION_ERROR)
        || ints.is_set(CHANNEL_INTERRUPTS::FRAME_LIST_ROLLOVER)
        || (ints.is_set(CHANNEL_INTERRUPTS::NYET) && !req.complete_split)
        || (ints.is_set(CHANNEL_INTERRUPTS::DATA_TOGGLE_ERROR) && direction_out);

    if hard_error {
        // A stall is a legitimate endpoint response, not worth logging.
        if !ints.is_set(CHANNEL_INTERRUPTS::STALL) {
            log::error!(
                "transfer failed on device {} ep {:#04x}, interrupts = {:#010x}",
                ep.device_id,
                ep.ep_address,
                interrupts
            );
        }
        inner.channels.release(channel);
        inner.complete_request(req, Err(Error::Io));
        return None;
    }

    if ints.is_set(CHANNEL_INTERRUPTS::FRAME_OVERRUN) {
        let overruns = inner.frame_overruns.fetch_add(1, Ordering::Relaxed) + 1;
        if overruns % FRAME_OVERRUN_THRESHOLD == 0 {
            log::info!(
                "requeued {} frame overruns, last on device {} ep {:#04x}",
                FRAME_OVERRUN_THRESHOLD,
                ep.device_id,
                ep.ep_address
            );
        }
        inner.channels.release(channel);
        ep.push_head(req);
        return None;
    }

    if ints.is_set(CHANNEL_INTERRUPTS::NAK) {
        req.next_data_toggle = chan.transfer.read(CHANNEL_TRANSFER::PACKET_ID);

        // Later control phases assume the channel is still held when they
        // retry; everything else hands it back for the backoff.
        if ep.ep_type() != EndpointType::Control || req.ctrl_phase == CtrlPhase::Setup {
            inner.channels.release(channel);
        }

        let speed = inner.device_info(ep.device_id).speed;
        let interval = ep.descriptor().b_interval;
        thread::sleep(nak_backoff(speed, interval));
        await_sof_if_necessary(inner, channel, &req, ep);

        req.complete_split = false;
        ep.push_head(req);
        return None;
    }

    if ints.is_set(CHANNEL_INTERRUPTS::NYET) {
        req.csplit_retries += 1;
        if req.csplit_retries >= CSPLIT_RETRY_LIMIT {
            req.complete_split = false;
        }

        // Retry the complete-split half a microframe out; interrupt
        // endpoints wait for the next usable start of frame instead.
        if ep.ep_type() != EndpointType::Interrupt {
            thread::sleep(NYET_RETRY_DELAY);
        }
        await_sof_if_necessary(inner, channel, &req, ep);

        log::trace!(
            "retrying complete-split on device {} ep {:#04x}",
            ep.device_id,
            ep.ep_address
        );
        start_transaction(inner, channel, &mut req);
        return Some(req);
    }

    handle_normal_halt(inner, channel, req, ep, ints)
}

/// Accounting for a halt that carried none of the fault or flow-control
/// bits: figure out how far the attempt got and what comes next.
fn handle_normal_halt(
    inner: &DwcInner,
    channel: u8,
    mut req: Box<TransferRequest>,
    ep: &Endpoint,
    ints: LocalRegisterCopy<u32, CHANNEL_INTERRUPTS::Register>,
) -> Option<Box<TransferRequest>> {
    let chan = &inner.regs.get().host_channels[channel as usize];

    let packets_remaining = chan.transfer.read(CHANNEL_TRANSFER::PACKET_COUNT);
    let packets_transferred = req.packets_queued - packets_remaining;

    if packets_transferred == 0 {
        // An ACKed start-split moves no data; answer it with the
        // complete-split on the same channel.
        if ints.is_set(CHANNEL_INTERRUPTS::ACK)
            && chan.split_control.is_set(CHANNEL_SPLIT_CONTROL::SPLIT_ENABLE)
            && !req.complete_split
        {
            req.complete_split = true;
            start_transaction(inner, channel, &mut req);
            return Some(req);
        }

        log::error!(
            "channel {} halted without progress, interrupts = {:#010x}",
            channel,
            ints.get()
        );
        inner.channels.release(channel);
        inner.complete_request(req, Err(Error::Io));
        return None;
    }

    let max_packet_size =
        chan.characteristics.read(CHANNEL_CHARACTERISTICS::MAX_PACKET_SIZE) as usize;
    let is_dir_in =
        chan.characteristics.read(CHANNEL_CHARACTERISTICS::ENDPOINT_DIRECTION) == EP_DIR_IN;

    let bytes_transferred = if is_dir_in {
        // The size register counts down as data arrives.
        req.bytes_queued - chan.transfer.read(CHANNEL_TRANSFER::SIZE) as usize
    } else {
        // OUT size bookkeeping is not reliable in DMA mode; reconstruct
        // from the packet count. The trailing packet is short when the
        // total is not a packet-size multiple (a zero total is a lone
        // zero-length packet).
        let mut bytes = 0usize;
        if packets_transferred > 1 {
            bytes += max_packet_size * (packets_transferred as usize - 1);
        }
        bytes += if packets_remaining == 0
            && (req.total_bytes_queued % max_packet_size != 0 || req.total_bytes_queued == 0)
        {
            req.total_bytes_queued % max_packet_size
        } else {
            max_packet_size
        };
        // A zero-length terminator moves no data; never report more than
        // was queued.
        bytes.min(req.bytes_queued)
    };

    req.packets_queued -= packets_transferred;
    req.bytes_queued -= bytes_transferred;
    req.bytes_transferred += bytes_transferred;

    let attempt_finished = req.packets_queued == 0
        || (is_dir_in && bytes_transferred < packets_transferred as usize * max_packet_size);

    if attempt_finished {
        if !ints.is_set(CHANNEL_INTERRUPTS::TRANSFER_COMPLETED) {
            log::error!(
                "transfer failed on device {} ep {:#04x}, interrupts = {:#010x}",
                ep.device_id,
                ep.ep_address,
                ints.get()
            );
            inner.channels.release(channel);
            inner.complete_request(req, Err(Error::Io));
            return None;
        }

        // The attempt was trimmed to a single packet for a split; schedule
        // the rest of the request as a fresh attempt. A control endpoint
        // keeps its channel: the continuation re-enters mid-phase without
        // re-acquiring.
        if req.short_attempt && req.bytes_queued == 0 {
            req.complete_split = false;
            req.next_data_toggle = chan.transfer.read(CHANNEL_TRANSFER::PACKET_ID);
            if ep.ep_type() != EndpointType::Control {
                inner.channels.release(channel);
            }
            ep.push_head(req);
            return None;
        }

        if ep.ep_type() == EndpointType::Control && req.ctrl_phase < CtrlPhase::Status {
            req.complete_split = false;
            if req.ctrl_phase == CtrlPhase::Setup {
                req.bytes_transferred = 0;
                req.next_data_toggle = pid::DATA1;
            }
            req.ctrl_phase = match req.ctrl_phase {
                CtrlPhase::Setup => CtrlPhase::Data,
                _ => CtrlPhase::Status,
            };
            // No data stage: go straight to STATUS.
            if req.ctrl_phase == CtrlPhase::Data && req.usb().length == 0 {
                req.ctrl_phase = CtrlPhase::Status;
            }
            ep.push_head(req);
            return None;
        }

        inner.channels.release(channel);
        let length = req.bytes_transferred;
        inner.complete_request(req, Ok(length));
        return None;
    }

    // More packets to go on this attempt: alternate the split stage and
    // keep the channel running.
    if chan.split_control.is_set(CHANNEL_SPLIT_CONTROL::SPLIT_ENABLE) {
        req.complete_split = !req.complete_split;
    }
    start_transaction(inner, channel, &mut req);
    Some(req)
}

/// NAK backoff: the endpoint's polling interval, floored at a millisecond.
fn nak_backoff(speed: UsbSpeed, b_interval: u8) -> Duration {
    let delay = if speed == UsbSpeed::High {
        // High-speed intervals are 2^(bInterval-1) microframes.
        Duration::from_micros(125) * (1u32 << b_interval.saturating_sub(1).min(15))
    } else {
        Duration::from_millis(b_interval as u64)
    };
    if delay.is_zero() {
        Duration::from_millis(1)
    } else {
        delay
    }
}
