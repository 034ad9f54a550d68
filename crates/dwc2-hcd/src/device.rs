//! The device table and per-endpoint state.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::request::TransferRequest;
use crate::sync::Completion;
use crate::usb::{EndpointDescriptor, EndpointType, UsbSpeed};

/// Routing snapshot of a device, read by the scheduler when programming a
/// channel.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DeviceInfo {
    pub speed: UsbSpeed,
    pub hub_address: u32,
    pub port: u32,
}

/// One slot of the bounded device table; the slot index is the device's
/// bus address (which is also what gets programmed into the channel).
/// Slot 0 is the default device used for address assignment.
pub(crate) struct DeviceSlot {
    pub speed: UsbSpeed,
    pub hub_address: u32,
    pub port: u32,
    pub endpoints: Vec<Arc<Endpoint>>,
}

impl DeviceSlot {
    pub fn empty() -> Self {
        Self {
            speed: UsbSpeed::Full,
            hub_address: 0,
            port: 0,
            endpoints: Vec::new(),
        }
    }

    pub fn endpoint(&self, ep_address: u8) -> Option<Arc<Endpoint>> {
        self.endpoints
            .iter()
            .find(|ep| ep.ep_address == ep_address)
            .cloned()
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            speed: self.speed,
            hub_address: self.hub_address,
            port: self.port,
        }
    }
}

/// A live endpoint: its cached descriptor, its FIFO of pending wrappers,
/// and the scheduler worker draining it.
///
/// The parent device is referenced by id only; the device table owns both
/// sides. The scheduler worker is the sole consumer of the FIFO; retries go
/// back in at the head so they run before any queued request.
pub(crate) struct Endpoint {
    pub ep_address: u8,
    pub device_id: u32,
    pub descriptor: Mutex<EndpointDescriptor>,
    pending: Mutex<VecDeque<Box<TransferRequest>>>,
    pub pending_signal: Completion,
}

impl Endpoint {
    pub fn new(device_id: u32, descriptor: EndpointDescriptor) -> Arc<Self> {
        Arc::new(Self {
            ep_address: descriptor.b_endpoint_address,
            device_id,
            descriptor: Mutex::new(descriptor),
            pending: Mutex::new(VecDeque::new()),
            pending_signal: Completion::new(),
        })
    }

    pub fn ep_type(&self) -> EndpointType {
        self.descriptor.lock().unwrap().ep_type()
    }

    pub fn descriptor(&self) -> MutexGuard<'_, EndpointDescriptor> {
        self.descriptor.lock().unwrap()
    }

    pub fn push_tail(&self, req: Box<TransferRequest>) {
        self.pending.lock().unwrap().push_back(req);
        self.pending_signal.signal();
    }

    /// Requeue a retry ahead of everything else on this endpoint.
    pub fn push_head(&self, req: Box<TransferRequest>) {
        self.pending.lock().unwrap().push_front(req);
        self.pending_signal.signal();
    }

    /// Take the next pending wrapper, re-arming the pending signal when the
    /// queue drains.
    pub fn pop(&self) -> Option<Box<TransferRequest>> {
        let mut pending = self.pending.lock().unwrap();
        let req = pending.pop_front();
        if pending.is_empty() {
            self.pending_signal.reset();
        }
        req
    }
}
