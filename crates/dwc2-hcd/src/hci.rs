//! The host-controller interface exposed to the upstream USB bus layer.

use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use tock_registers::interfaces::Readable;

use crate::device::Endpoint;
use crate::error::Error;
use crate::regs::HOST_FRAME;
use crate::request::{CtrlPhase, TransferRequest, UsbRequest};
use crate::usb::{
    EndpointDescriptor, SetupPacket, UsbSpeed, USB_DESCRIPTOR_TYPE_DEVICE, USB_DIR_IN,
    USB_DIR_OUT, USB_REQUEST_GET_DESCRIPTOR, USB_REQUEST_SET_ADDRESS,
};
use crate::{
    scheduler, Bti, Dwc2Controller, DwcInner, UsbBusInterface, MAX_DEVICE_COUNT,
    MAX_TRANSFER_SIZE, ROOT_HUB_DEVICE_ID,
};

/// Settle time between SET_ADDRESS and the first transfer to the new
/// address.
const ENUMERATION_SETTLE: Duration = Duration::from_millis(10);

/// Offset of `bMaxPacketSize0` in a device descriptor.
const DEVICE_DESCRIPTOR_MPS0_OFFSET: usize = 7;

impl Dwc2Controller {
    /// Queues a transfer. The request's completion callback fires exactly
    /// once, from an arbitrary driver thread.
    pub fn request_queue(&self, usb_req: UsbRequest) {
        if usb_req.length > self.get_max_transfer_size(usb_req.device_id, usb_req.ep_address) {
            usb_req.complete(Err(Error::InvalidArgs));
            return;
        }

        let req = self.inner.pool.acquire(usb_req);
        log::trace!(
            "queueing request id={} device={} ep={:#04x} length={:#x}",
            req.request_id,
            req.usb().device_id,
            req.usb().ep_address,
            req.usb().length
        );

        if req.usb().device_id == ROOT_HUB_DEVICE_ID {
            self.inner.root_hub.queue(req);
        } else {
            self.inner.queue_hw(req);
        }
    }

    /// Wires up (or tears down) the upstream bus layer. A non-null
    /// interface is immediately told about the root hub.
    pub fn set_bus_interface(&self, bus: Option<Arc<dyn UsbBusInterface>>) {
        *self.inner.bus.lock().unwrap() = bus.clone();
        if let Some(bus) = bus {
            bus.add_device(ROOT_HUB_DEVICE_ID, 0, UsbSpeed::High);
        }
    }

    pub fn get_max_device_count(&self) -> usize {
        MAX_DEVICE_COUNT
    }

    /// Creates an endpoint on `device_id` and spawns its scheduler.
    /// Disabling endpoints is not supported.
    pub fn enable_endpoint(
        &self,
        device_id: u32,
        descriptor: &EndpointDescriptor,
        enable: bool,
    ) -> Result<(), Error> {
        log::trace!(
            "enable endpoint device={} ep={:#04x}",
            device_id,
            descriptor.b_endpoint_address
        );

        if device_id == ROOT_HUB_DEVICE_ID {
            // Nothing to set up for the root hub.
            return Ok(());
        }
        if !enable {
            return Err(Error::NotSupported);
        }
        if device_id as usize >= MAX_DEVICE_COUNT {
            return Err(Error::InvalidArgs);
        }

        let ep = Endpoint::new(device_id, *descriptor);
        scheduler::spawn(&self.inner, &ep)?;
        self.inner.devices[device_id as usize]
            .lock()
            .unwrap()
            .endpoints
            .push(ep);
        Ok(())
    }

    /// Current frame number from the host frame counter.
    pub fn get_current_frame(&self) -> u64 {
        self.inner
            .regs
            .get()
            .host_frame_number
            .read(HOST_FRAME::FRAME_NUMBER) as u64
    }

    /// Nothing controller-side to configure for external hubs.
    pub fn configure_hub(
        &self,
        _device_id: u32,
        _speed: UsbSpeed,
        _descriptor: &[u8],
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Enumerates a device newly attached behind `hub_address`/`port`: the
    /// address-assignment dialogue runs against the default device, then
    /// the new device gets a table slot, a control endpoint, and a bus
    /// announcement.
    pub fn hub_device_added(
        &self,
        hub_address: u32,
        port: u32,
        speed: UsbSpeed,
    ) -> Result<(), Error> {
        log::info!(
            "hub device added, hub={} port={} speed={:?}",
            hub_address,
            port,
            speed
        );
        let inner = &self.inner;

        let address = *inner.next_device_address.lock().unwrap();
        if address >= ROOT_HUB_DEVICE_ID {
            return Err(Error::NoMemory);
        }

        // Until enumerated the device answers at address zero, through the
        // default device's control endpoint. Its max packet size is
        // unknown; every device is required to support 8.
        {
            let mut default_device = inner.devices[0].lock().unwrap();
            default_device.speed = speed;
            default_device.hub_address = hub_address;
            default_device.port = port;
            default_device
                .endpoint(0)
                .expect("default device has no control endpoint")
                .descriptor
                .lock()
                .unwrap()
                .w_max_packet_size = 8;
        }

        // Read the first 8 bytes of the device descriptor to learn ep0's
        // real max packet size.
        let setup = SetupPacket {
            bm_request_type: USB_DIR_IN,
            b_request: USB_REQUEST_GET_DESCRIPTOR,
            w_value: (USB_DESCRIPTOR_TYPE_DEVICE as u16) << 8,
            w_index: 0,
            w_length: 8,
        };
        let (req, transferred) = self.control_dialogue(UsbRequest::control(0, setup))?;
        if transferred <= DEVICE_DESCRIPTOR_MPS0_OFFSET {
            return Err(Error::Io);
        }
        let max_packet_size0 = req.buffer.as_slice()[DEVICE_DESCRIPTOR_MPS0_OFFSET] as u16;

        {
            let default_device = inner.devices[0].lock().unwrap();
            default_device
                .endpoint(0)
                .expect("default device has no control endpoint")
                .descriptor
                .lock()
                .unwrap()
                .w_max_packet_size = max_packet_size0;
        }

        // Move the device to its bus address.
        let setup = SetupPacket {
            bm_request_type: USB_DIR_OUT,
            b_request: USB_REQUEST_SET_ADDRESS,
            w_value: address as u16,
            w_index: 0,
            w_length: 0,
        };
        self.control_dialogue(UsbRequest::control(0, setup))?;

        thread::sleep(ENUMERATION_SETTLE);

        {
            let mut device = inner.devices[address as usize].lock().unwrap();
            device.speed = speed;
            device.hub_address = hub_address;
            device.port = port;
            device.endpoints.clear();

            let ep0 = Endpoint::new(address, EndpointDescriptor::control(max_packet_size0));
            scheduler::spawn(inner, &ep0)?;
            device.endpoints.push(ep0);
        }

        let bus = inner.bus.lock().unwrap().clone();
        if let Some(bus) = bus {
            bus.add_device(address, hub_address, speed);
        }

        *inner.next_device_address.lock().unwrap() = address + 1;
        Ok(())
    }

    pub fn hub_device_removed(&self, _hub_address: u32, _port: u32) -> Result<(), Error> {
        Err(Error::NotSupported)
    }

    pub fn reset_endpoint(&self, _device_id: u32, _ep_address: u8) -> Result<(), Error> {
        Err(Error::NotSupported)
    }

    /// Transfers are limited to a single page until scatter/gather support
    /// is implemented.
    pub fn get_max_transfer_size(&self, _device_id: u32, _ep_address: u8) -> usize {
        MAX_TRANSFER_SIZE
    }

    pub fn cancel_all(&self, _device_id: u32, _ep_address: u8) -> Result<(), Error> {
        Err(Error::NotSupported)
    }

    pub fn get_bti(&self) -> Bti {
        self.inner.config.bti
    }

    /// Queues a control request and blocks until it completes, returning
    /// the request and the transferred byte count.
    fn control_dialogue(&self, mut req: UsbRequest) -> Result<(UsbRequest, usize), Error> {
        let (tx, rx) = mpsc::channel();
        req.on_complete(move |req, result| {
            // The receiver only goes away if the dialogue was abandoned.
            let _ = tx.send((req, result));
        });
        self.request_queue(req);
        let (req, result) = rx.recv().map_err(|_| Error::Io)?;
        result.map(|transferred| (req, transferred))
    }
}

impl DwcInner {
    /// Routes a wrapped request to its endpoint scheduler.
    fn queue_hw(&self, mut req: Box<TransferRequest>) {
        let device_id = req.usb().device_id;
        let ep_address = req.usb().ep_address;

        if device_id as usize >= MAX_DEVICE_COUNT {
            log::warn!("request for out-of-range device {device_id}");
            self.complete_request(req, Err(Error::InvalidArgs));
            return;
        }

        let endpoint = self.devices[device_id as usize]
            .lock()
            .unwrap()
            .endpoint(ep_address);
        let Some(endpoint) = endpoint else {
            log::warn!("request for unknown endpoint {ep_address:#04x} on device {device_id}");
            self.complete_request(req, Err(Error::InvalidArgs));
            return;
        };

        if ep_address == 0 {
            req.ctrl_phase = CtrlPhase::Setup;
        }

        // Write back anything the CPU still holds for this buffer; the DMA
        // engine reads it underneath the caches.
        self.dma.cache_flush(req.usb().buffer.as_slice());

        endpoint.push_tail(req);
    }
}
