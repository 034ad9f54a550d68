//! Host-mode driver core for the Synopsys DesignWare DWC2 USB 2.0 OTG
//! controller.
//!
//! The driver owns the controller's channel-based DMA engine and its single
//! root port, and presents a host-controller interface to an upstream USB
//! bus layer. One scheduler thread runs per live (device, endpoint) pair;
//! a small pool of hardware channels is allocated dynamically per transfer
//! attempt. Control transfers walk a three-phase state machine on a single
//! held channel, and low/full-speed devices behind high-speed hubs are
//! driven with start-split/complete-split transaction pairs. The root hub
//! is emulated entirely in software.
//!
//! Platform glue is out of scope: the platform maps the MMIO window, hands
//! the driver a [`Registers`] handle plus [`DmaOps`], and forwards the core
//! interrupt to [`Dwc2Controller::handle_irq`].

mod channel;
mod device;
mod error;
mod hci;
mod irq;
mod request;
pub mod regs;
mod root_hub;
mod scheduler;
mod sync;
pub mod usb;

use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};

pub use error::Error;
pub use request::{CoherentDma, DmaBuffer, DmaOps, UsbRequest};
pub use regs::Registers;
pub use usb::{EndpointDescriptor, EndpointType, SetupPacket, UsbSpeed};

use channel::{ChannelAllocator, ChannelEvent, SofGate};
use device::{DeviceInfo, DeviceSlot, Endpoint};
use request::{RequestPool, TransferRequest};
use root_hub::RootHub;

/// Upper bound of the device table; the table index is the bus address.
pub const MAX_DEVICE_COUNT: usize = 65;

/// The software root hub occupies the last device-table slot.
pub const ROOT_HUB_DEVICE_ID: u32 = MAX_DEVICE_COUNT as u32 - 1;

/// Transfers are limited to a single page until scatter/gather support is
/// implemented.
pub const MAX_TRANSFER_SIZE: usize = 4096;

/// Callbacks into the upstream USB bus layer.
pub trait UsbBusInterface: Send + Sync {
    /// Announces a newly enumerated device (or the root hub itself).
    fn add_device(&self, device_id: u32, hub_id: u32, speed: UsbSpeed);
}

/// Bus-transaction-initiator handle, owned by the platform and handed back
/// through [`Dwc2Controller::get_bti`] so the bus layer can pin request
/// memory for DMA.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Bti(pub u64);

#[derive(Clone, Copy, Debug)]
pub struct Dwc2Config {
    /// Channel count reported by the hardware (at most
    /// [`regs::MAX_HOST_CHANNELS`]).
    pub num_host_channels: usize,
    pub bti: Bti,
}

/// The DWC2 host controller driver.
///
/// Cheap to share: handles returned from [`Dwc2Controller::new`] can be
/// wrapped in an [`Arc`] and used concurrently from the bus layer and the
/// platform's IRQ context.
pub struct Dwc2Controller {
    inner: Arc<DwcInner>,
}

pub(crate) struct DwcInner {
    regs: Registers,
    dma: Arc<dyn DmaOps>,
    config: Dwc2Config,
    channels: ChannelAllocator,
    channel_events: Vec<ChannelEvent>,
    sof: SofGate,
    pool: RequestPool,
    root_hub: RootHub,
    devices: Vec<Mutex<DeviceSlot>>,
    bus: Mutex<Option<Arc<dyn UsbBusInterface>>>,
    next_device_address: Mutex<u32>,
    frame_overruns: AtomicU32,
}

impl Dwc2Controller {
    pub fn new(
        regs: Registers,
        config: Dwc2Config,
        dma: Arc<dyn DmaOps>,
    ) -> Result<Self, Error> {
        assert!(
            config.num_host_channels >= 1
                && config.num_host_channels <= regs::MAX_HOST_CHANNELS,
            "unsupported host channel count {}",
            config.num_host_channels
        );

        let inner = Arc::new(DwcInner {
            channels: ChannelAllocator::new(config.num_host_channels),
            channel_events: (0..config.num_host_channels)
                .map(|_| ChannelEvent::new())
                .collect(),
            sof: SofGate::new(config.num_host_channels),
            pool: RequestPool::new(),
            root_hub: RootHub::new(),
            devices: (0..MAX_DEVICE_COUNT)
                .map(|_| Mutex::new(DeviceSlot::empty()))
                .collect(),
            bus: Mutex::new(None),
            next_device_address: Mutex::new(1),
            frame_overruns: AtomicU32::new(0),
            regs,
            dma,
            config,
        });

        create_default_device(&inner)?;
        root_hub::spawn_worker(&inner)?;

        Ok(Self { inner })
    }
}

/// Seeds device-table slot 0: the address-zero device every newly attached
/// (not yet addressed) device answers as, with a control endpoint at the
/// 8-byte max packet size all devices support.
fn create_default_device(inner: &Arc<DwcInner>) -> Result<(), Error> {
    let ep0 = Endpoint::new(0, EndpointDescriptor::control(8));
    scheduler::spawn(inner, &ep0)?;

    let mut default_device = inner.devices[0].lock().unwrap();
    default_device.speed = UsbSpeed::High;
    default_device.hub_address = 0;
    default_device.port = 0;
    default_device.endpoints.push(ep0);
    Ok(())
}

impl DwcInner {
    pub(crate) fn device_info(&self, device_id: u32) -> DeviceInfo {
        self.devices[device_id as usize].lock().unwrap().info()
    }

    /// Completes the upstream request and recycles the wrapper.
    pub(crate) fn complete_request(
        &self,
        mut req: Box<TransferRequest>,
        result: Result<usize, Error>,
    ) {
        req.setup_buffer = None;
        let usb_req = req
            .usb_req
            .take()
            .expect("wrapper has no upstream request");

        log::trace!(
            "completing request id={} result={:?}",
            req.request_id,
            result
        );

        // The DMA engine may have moved data underneath the CPU's caches.
        if let Ok(length) = result {
            let length = length.min(usb_req.buffer.len());
            self.dma.cache_invalidate(&usb_req.buffer.as_slice()[..length]);
        }

        usb_req.complete(result);
        self.pool.release(req);
    }
}
