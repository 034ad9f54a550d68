//! A fake DWC2 core for driving the real scheduler threads end to end.
//!
//! The register block lives in ordinary (leaked) memory. The test plays
//! the hardware: it polls channels for the enable bit the driver sets,
//! inspects what was programmed, writes back transfer results, and raises
//! the driver's IRQ entry point. DMA runs through a fake 32-bit bus
//! address space that maps programmed addresses back to host memory.

#![allow(dead_code)]

use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dwc2_hcd::regs::{self, pid};
use dwc2_hcd::usb::{self, SetupPacket, UsbSpeed};
use dwc2_hcd::{Bti, DmaOps, Dwc2Config, Dwc2Controller};

pub const NUM_CHANNELS: usize = 8;
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

struct Region {
    bus: u64,
    host: usize,
    len: usize,
}

/// Fake bus-address space. Buffers register themselves on their first
/// translation; the harness maps programmed 32-bit addresses back to host
/// pointers.
pub struct TestDma {
    regions: Mutex<Vec<Region>>,
    next_bus: Mutex<u64>,
}

impl TestDma {
    fn new() -> Self {
        Self {
            regions: Mutex::new(Vec::new()),
            next_bus: Mutex::new(0x1000_0000),
        }
    }

    fn host_addr(&self, bus: u32) -> *mut u8 {
        let bus = bus as u64;
        let regions = self.regions.lock().unwrap();
        let region = regions
            .iter()
            .find(|r| bus >= r.bus && bus < r.bus + r.len.max(1) as u64)
            .expect("bus address was never handed out by the fake BTI");
        (region.host + (bus - region.bus) as usize) as *mut u8
    }

    /// Reads `len` bytes of "host memory" at a programmed bus address.
    pub fn read(&self, bus: u32, len: usize) -> Vec<u8> {
        let ptr = self.host_addr(bus);
        let mut out = vec![0u8; len];
        fence(Ordering::SeqCst);
        unsafe { std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), len) };
        out
    }

    /// Writes into "host memory" at a programmed bus address, as the DMA
    /// engine would for an IN transfer.
    pub fn write(&self, bus: u32, data: &[u8]) {
        let ptr = self.host_addr(bus);
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
        fence(Ordering::SeqCst);
    }
}

impl DmaOps for TestDma {
    fn bus_address(&self, buf: &[u8]) -> u64 {
        let host = buf.as_ptr() as usize;
        let mut regions = self.regions.lock().unwrap();
        if let Some(region) = regions.iter_mut().find(|r| r.host == host) {
            region.len = region.len.max(buf.len());
            return region.bus;
        }
        let mut next = self.next_bus.lock().unwrap();
        let bus = *next;
        // Generous spacing so a region can grow without overlapping.
        *next += 0x1_0000;
        regions.push(Region {
            bus,
            host,
            len: buf.len(),
        });
        bus
    }

    fn cache_flush(&self, _buf: &[u8]) {}

    fn cache_invalidate(&self, _buf: &[u8]) {}
}

/// Raw hardware-side view of the register file.
#[derive(Clone, Copy)]
pub struct Hw {
    base: *mut u32,
}

unsafe impl Send for Hw {}
unsafe impl Sync for Hw {}

impl Hw {
    pub fn rd(&self, offset: usize) -> u32 {
        fence(Ordering::SeqCst);
        unsafe { self.base.add(offset / 4).read_volatile() }
    }

    pub fn wr(&self, offset: usize, value: u32) {
        unsafe { self.base.add(offset / 4).write_volatile(value) };
        fence(Ordering::SeqCst);
    }

    pub fn chan_rd(&self, channel: usize, reg: usize) -> u32 {
        self.rd(regs::reg_channel(channel) + reg)
    }

    pub fn chan_wr(&self, channel: usize, reg: usize, value: u32) {
        self.wr(regs::reg_channel(channel) + reg, value)
    }

    /// Waits for the driver to enable some channel and returns its index.
    pub fn wait_enabled(&self) -> usize {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            for channel in 0..NUM_CHANNELS {
                let characteristics = self.chan_rd(channel, regs::CHAN_CHARACTERISTICS);
                if characteristics & regs::HCCHAR_CHANNEL_ENABLE != 0 {
                    return channel;
                }
            }
            assert!(
                Instant::now() < deadline,
                "driver never enabled a channel"
            );
            thread::sleep(Duration::from_micros(50));
        }
    }
}

/// What the driver programmed into a channel, decoded.
#[derive(Clone, Copy, Debug)]
pub struct Programmed {
    pub size: u32,
    pub packet_count: u32,
    pub packet_id: u32,
    pub dma: u32,
    pub max_packet_size: u32,
    pub ep_number: u32,
    pub ep_dir_in: bool,
    pub ep_type: u32,
    pub device_address: u32,
    pub low_speed: bool,
    pub split_enable: bool,
    pub complete_split: bool,
    pub hub_address: u32,
    pub port_address: u32,
}

impl Programmed {
    pub fn capture(hw: &Hw, channel: usize) -> Self {
        let characteristics = hw.chan_rd(channel, regs::CHAN_CHARACTERISTICS);
        let split = hw.chan_rd(channel, regs::CHAN_SPLIT_CONTROL);
        let transfer = hw.chan_rd(channel, regs::CHAN_TRANSFER);
        Self {
            size: transfer & regs::HCTSIZ_SIZE_MASK,
            packet_count: (transfer >> regs::HCTSIZ_PKTCNT_SHIFT) & regs::HCTSIZ_PKTCNT_MASK,
            packet_id: (transfer >> regs::HCTSIZ_PID_SHIFT) & regs::HCTSIZ_PID_MASK,
            dma: hw.chan_rd(channel, regs::CHAN_DMA_ADDRESS),
            max_packet_size: characteristics & regs::HCCHAR_MPS_MASK,
            ep_number: (characteristics >> regs::HCCHAR_EPNUM_SHIFT) & regs::HCCHAR_EPNUM_MASK,
            ep_dir_in: characteristics & regs::HCCHAR_EPDIR_IN != 0,
            ep_type: (characteristics >> regs::HCCHAR_EPTYPE_SHIFT) & regs::HCCHAR_EPTYPE_MASK,
            device_address: (characteristics >> regs::HCCHAR_DEVADDR_SHIFT)
                & regs::HCCHAR_DEVADDR_MASK,
            low_speed: characteristics & regs::HCCHAR_LOW_SPEED != 0,
            split_enable: split & regs::HCSPLT_SPLIT_ENABLE != 0,
            complete_split: split & regs::HCSPLT_COMPLETE_SPLIT != 0,
            hub_address: (split >> regs::HCSPLT_HUB_ADDR_SHIFT) & regs::HCSPLT_HUB_ADDR_MASK,
            port_address: split & regs::HCSPLT_PORT_ADDR_MASK,
        }
    }
}

/// The fake core: hardware-side register access plus serialized IRQ
/// delivery into the driver.
#[derive(Clone)]
pub struct FakeCore {
    pub hw: Hw,
    pub dwc: Arc<Dwc2Controller>,
    pub dma: Arc<TestDma>,
    irq_lock: Arc<Mutex<()>>,
}

impl FakeCore {
    /// Delivers one core interrupt. `prepare` runs under the IRQ lock to
    /// set up status registers; write-1-to-clear state is wiped again once
    /// the driver has acknowledged.
    fn raise_irq(&self, core_status: u32, prepare: impl FnOnce(&Hw)) {
        let _guard = self.irq_lock.lock().unwrap();
        prepare(&self.hw);
        self.hw.wr(regs::REG_CORE_INTERRUPT_STATUS, core_status);
        self.dwc.handle_irq();
        self.hw.wr(regs::REG_CORE_INTERRUPT_STATUS, 0);
        self.hw.wr(regs::REG_HOST_CHANNELS_INTERRUPT, 0);
    }

    /// Halts the current transaction on `channel` the way the hardware
    /// would: clears the enable bit, writes the transfer leftovers back,
    /// latches the interrupt bits, and raises the channel IRQ.
    pub fn finish_transaction(
        &self,
        channel: usize,
        ints: u32,
        remaining_packets: u32,
        remaining_size: u32,
        next_pid: u32,
    ) {
        let characteristics = self.hw.chan_rd(channel, regs::CHAN_CHARACTERISTICS);
        self.hw.chan_wr(
            channel,
            regs::CHAN_CHARACTERISTICS,
            characteristics & !regs::HCCHAR_CHANNEL_ENABLE,
        );
        self.hw.chan_wr(
            channel,
            regs::CHAN_TRANSFER,
            (remaining_size & regs::HCTSIZ_SIZE_MASK)
                | ((remaining_packets & regs::HCTSIZ_PKTCNT_MASK) << regs::HCTSIZ_PKTCNT_SHIFT)
                | ((next_pid & regs::HCTSIZ_PID_MASK) << regs::HCTSIZ_PID_SHIFT),
        );
        self.hw.chan_wr(
            channel,
            regs::CHAN_INTERRUPTS,
            ints | regs::HCINT_CHANNEL_HALTED,
        );
        self.raise_irq(regs::GINTSTS_HOST_CHANNELS, |hw| {
            hw.wr(regs::REG_HOST_CHANNELS_INTERRUPT, 1 << channel);
        });
    }

    /// Latches a new host-port state and raises the port IRQ.
    pub fn raise_port_irq(&self, hprt: u32) {
        self.raise_irq(regs::GINTSTS_PORT, |hw| {
            hw.wr(regs::REG_HOST_PORT, hprt);
        });
    }

    /// Advances the frame counter and raises one SOF interrupt.
    pub fn sof_tick(&self) {
        self.raise_irq(regs::GINTSTS_SOF, |hw| {
            let frame = hw.rd(regs::REG_HOST_FRAME_NUMBER);
            hw.wr(regs::REG_HOST_FRAME_NUMBER, (frame + 1) & 0xffff);
        });
    }

    /// Runs SOF ticks in the background while the driver has the SOF
    /// interrupt unmasked (interrupt transfers to low/full-speed devices
    /// park on it).
    pub fn start_sof_pump(&self) -> SofPump {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let core = self.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let mask = core.hw.rd(regs::REG_CORE_INTERRUPT_MASK);
                    if mask & regs::GINTSTS_SOF != 0 {
                        core.sof_tick();
                    }
                    thread::sleep(Duration::from_micros(200));
                }
            })
        };
        SofPump {
            stop,
            handle: Some(handle),
        }
    }
}

pub struct SofPump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for SofPump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub struct TestRig {
    pub dwc: Arc<Dwc2Controller>,
    pub hw: Hw,
    pub dma: Arc<TestDma>,
    irq_lock: Arc<Mutex<()>>,
}

impl TestRig {
    pub fn new() -> Self {
        // The register file outlives every driver thread; driver threads
        // never exit (teardown is out of scope), so the backing memory is
        // deliberately leaked.
        let mem: &'static mut [u32] =
            Box::leak(vec![0u32; regs::MMIO_SIZE / 4].into_boxed_slice());
        let base = mem.as_mut_ptr();

        let registers = unsafe { dwc2_hcd::Registers::new(base.cast()) };
        let dma = Arc::new(TestDma::new());
        let dwc = Dwc2Controller::new(
            registers,
            Dwc2Config {
                num_host_channels: NUM_CHANNELS,
                bti: Bti(0x5a5a),
            },
            dma.clone(),
        )
        .expect("controller construction failed");

        Self {
            dwc: Arc::new(dwc),
            hw: Hw { base },
            dma,
            irq_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn core(&self) -> FakeCore {
        FakeCore {
            hw: self.hw,
            dwc: self.dwc.clone(),
            dma: self.dma.clone(),
            irq_lock: self.irq_lock.clone(),
        }
    }
}

/// How the fake device answers one transaction attempt.
pub enum Reply<'a> {
    /// IN data, transfer completed.
    In(&'a [u8]),
    /// OUT (or zero-length) transaction consumed in full.
    Ack,
    Nak,
    Stall,
    FrameOverrun,
}

pub fn flip_pid(packet_id: u32, packets: u32) -> u32 {
    if packet_id == pid::MDATA_SETUP {
        return pid::DATA1;
    }
    if packets % 2 == 1 {
        match packet_id {
            pid::DATA0 => pid::DATA1,
            _ => pid::DATA0,
        }
    } else {
        packet_id
    }
}

/// Serves one transaction attempt, transparently ACKing the start-split
/// and waiting for the complete-split when the transfer is split. Returns
/// what was programmed for the data-moving transaction.
pub fn serve_attempt(core: &FakeCore, reply: Reply<'_>) -> Programmed {
    let channel = core.hw.wait_enabled();
    let mut prog = Programmed::capture(&core.hw, channel);

    let split_dance = prog.split_enable
        && !prog.complete_split
        && !matches!(reply, Reply::Nak | Reply::Stall | Reply::FrameOverrun);
    if split_dance {
        // ACK the start-split with no data moved; the driver flips to the
        // complete-split on the same channel.
        core.finish_transaction(
            channel,
            regs::HCINT_ACK,
            prog.packet_count,
            prog.size,
            prog.packet_id,
        );
        assert_eq!(core.hw.wait_enabled(), channel, "complete-split must reuse the channel");
        prog = Programmed::capture(&core.hw, channel);
        assert!(prog.complete_split, "expected the complete-split stage");
    }

    match reply {
        Reply::In(data) => {
            assert!(prog.ep_dir_in, "device has IN data but the host asked OUT");
            let n = data.len().min(prog.size as usize);
            core.dma.write(prog.dma, &data[..n]);
            let packets = (n as u32).div_ceil(prog.max_packet_size).max(1);
            core.finish_transaction(
                channel,
                regs::HCINT_TRANSFER_COMPLETED | regs::HCINT_ACK,
                prog.packet_count.saturating_sub(packets),
                prog.size - n as u32,
                flip_pid(prog.packet_id, packets),
            );
        }
        Reply::Ack => {
            core.finish_transaction(
                channel,
                regs::HCINT_TRANSFER_COMPLETED | regs::HCINT_ACK,
                0,
                0,
                flip_pid(prog.packet_id, prog.packet_count),
            );
        }
        Reply::Nak => {
            core.finish_transaction(
                channel,
                regs::HCINT_NAK,
                prog.packet_count,
                prog.size,
                prog.packet_id,
            );
        }
        Reply::Stall => {
            core.finish_transaction(
                channel,
                regs::HCINT_STALL,
                prog.packet_count,
                prog.size,
                prog.packet_id,
            );
        }
        Reply::FrameOverrun => {
            core.finish_transaction(
                channel,
                regs::HCINT_FRAME_OVERRUN,
                prog.packet_count,
                prog.size,
                prog.packet_id,
            );
        }
    }
    prog
}

/// Serves a complete control transfer (split-aware) and returns the
/// decoded setup packet the host sent.
pub fn serve_control(core: &FakeCore, data_in: Option<&[u8]>) -> SetupPacket {
    // SETUP stage.
    let channel = core.hw.wait_enabled();
    let mut prog = Programmed::capture(&core.hw, channel);
    if prog.split_enable && !prog.complete_split {
        core.finish_transaction(
            channel,
            regs::HCINT_ACK,
            prog.packet_count,
            prog.size,
            prog.packet_id,
        );
        assert_eq!(core.hw.wait_enabled(), channel);
        prog = Programmed::capture(&core.hw, channel);
    }
    assert_eq!(prog.packet_id, pid::MDATA_SETUP, "SETUP stage must use the SETUP pid");
    assert_eq!(prog.size, 8, "a setup packet is 8 bytes");
    assert!(!prog.ep_dir_in, "SETUP stage is always OUT");
    let setup_bytes: [u8; 8] = core.dma.read(prog.dma, 8).try_into().unwrap();
    let setup = SetupPacket::parse(setup_bytes);
    core.finish_transaction(
        channel,
        regs::HCINT_TRANSFER_COMPLETED | regs::HCINT_ACK,
        0,
        0,
        pid::DATA1,
    );

    // DATA stage.
    if setup.w_length > 0 {
        let mut remaining: usize = setup.w_length as usize;
        let mut offset = 0usize;
        while remaining > 0 {
            let prog = if setup.is_in() {
                let data = data_in.expect("IN data stage needs device data");
                serve_attempt(core, Reply::In(&data[offset..]))
            } else {
                serve_attempt(core, Reply::Ack)
            };
            let served = (remaining).min(prog.size as usize);
            offset += served;
            remaining -= served;
            // A full-length response always fills the attempt; the driver
            // reschedules trimmed split attempts until the stage is done.
            if setup.is_in() {
                let data = data_in.unwrap();
                if offset >= data.len() {
                    break;
                }
            }
        }
    }

    // STATUS stage.
    let prog = serve_attempt(core, Reply::Ack);
    assert_eq!(prog.size, 0, "STATUS stage carries no data");

    setup
}

/// Enumerates one fake device and returns its assigned address.
pub fn enumerate_device(
    rig: &TestRig,
    hub_address: u32,
    port: u32,
    speed: UsbSpeed,
    max_packet_size0: u8,
) -> u32 {
    let core = rig.core();
    let responder = thread::spawn(move || {
        let device_descriptor8 = [18, 1, 0x00, 0x02, 0, 0, 0, max_packet_size0];
        let setup = serve_control(&core, Some(&device_descriptor8));
        assert_eq!(setup.b_request, usb::USB_REQUEST_GET_DESCRIPTOR);
        assert_eq!(setup.w_length, 8);

        let setup = serve_control(&core, None);
        assert_eq!(setup.b_request, usb::USB_REQUEST_SET_ADDRESS);
        setup.w_value as u32
    });

    rig.dwc
        .hub_device_added(hub_address, port, speed)
        .expect("enumeration failed");
    responder.join().expect("fake device responder panicked")
}
