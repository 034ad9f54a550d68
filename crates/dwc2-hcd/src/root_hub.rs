//! The emulated root hub: a virtual single-port USB 2.0 hub answering
//! standard and hub-class control requests, plus the serial worker that
//! drains its request queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tock_registers::interfaces::{Readable, Writeable};

use crate::error::Error;
use crate::regs::{
    DwcRegisters, Registers, HPRT_CONNECTED_CHANGED, HPRT_ENABLED, HPRT_ENABLED_CHANGED,
    HPRT_OVERCURRENT_CHANGED, HPRT_POWERED, HPRT_RESET,
};
use crate::request::TransferRequest;
use crate::sync::Completion;
use crate::usb::{
    HUB_PORT_CHANGE_CONNECTION, HUB_PORT_CHANGE_ENABLE, HUB_PORT_CHANGE_OVER_CURRENT,
    HUB_PORT_CHANGE_RESET, HUB_PORT_CHANGE_SUSPEND, HUB_PORT_FEATURE_C_PORT_CONNECTION,
    HUB_PORT_FEATURE_C_PORT_ENABLE, HUB_PORT_FEATURE_C_PORT_OVER_CURRENT,
    HUB_PORT_FEATURE_C_PORT_RESET, HUB_PORT_FEATURE_C_PORT_SUSPEND, HUB_PORT_FEATURE_POWER,
    HUB_PORT_FEATURE_RESET, USB_DESCRIPTOR_TYPE_CONFIGURATION, USB_DESCRIPTOR_TYPE_DEVICE,
    USB_DESCRIPTOR_TYPE_HUB, USB_DESCRIPTOR_TYPE_STRING, USB_REQUEST_CLEAR_FEATURE,
    USB_REQUEST_GET_DESCRIPTOR, USB_REQUEST_GET_STATUS, USB_REQUEST_SET_ADDRESS,
    USB_REQUEST_SET_CONFIGURATION, USB_REQUEST_SET_FEATURE, USB_TYPE_CLASS, USB_TYPE_MASK,
    USB_TYPE_STANDARD,
};
use crate::DwcInner;

/// Root-port reset signalling time. The USB 2.0 spec requires at least
/// 50 ms from a root port; we give it a little margin.
const PORT_RESET_SETTLE: Duration = Duration::from_millis(60);

// Device descriptor for the emulated USB 2.0 root hub.
const RH_DEVICE_DESCRIPTOR: [u8; 18] = [
    18,   // bLength
    0x01, // bDescriptorType (DEVICE)
    0x00, 0x02, // bcdUSB 2.0
    0x09, // bDeviceClass (hub)
    0x00, // bDeviceSubClass
    0x01, // bDeviceProtocol (single TT)
    64,   // bMaxPacketSize0
    0xd1, 0x18, // idVendor 0x18d1
    0x02, 0xa0, // idProduct 0xa002
    0x00, 0x01, // bcdDevice 1.00
    0x01, // iManufacturer
    0x02, // iProduct
    0x00, // iSerialNumber
    0x01, // bNumConfigurations
];

// Packed configuration + interface + interrupt-endpoint descriptors.
const RH_CONFIG_DESCRIPTOR: [u8; 25] = [
    // Configuration.
    9, 0x02, 25, 0, // wTotalLength
    1,    // bNumInterfaces
    1,    // bConfigurationValue
    0,    // iConfiguration
    0xe0, // bmAttributes (self powered)
    0,    // bMaxPower
    // Interface.
    9, 0x04, 0, 0, 1, 0x09, 0, 0, 0,
    // Status-change endpoint: interrupt IN 0x81.
    7, 0x05, 0x81, 0x03, 4, 0, 12,
];

const RH_LANGUAGE_LIST: [u8; 4] = [4, 0x03, 0x09, 0x04]; // en-US

const RH_MANUFACTURER_STRING: [u8; 16] = [
    16, 0x03, b'Z', 0, b'i', 0, b'r', 0, b'c', 0, b'o', 0, b'n', 0, 0, 0,
];

const RH_PRODUCT_STRING: [u8; 36] = [
    36, 0x03, b'U', 0, b'S', 0, b'B', 0, b' ', 0, b'2', 0, b'.', 0, b'0', 0, b' ', 0, b'R', 0,
    b'o', 0, b'o', 0, b't', 0, b' ', 0, b'H', 0, b'u', 0, b'b', 0, 0, 0,
];

const RH_STRING_TABLE: [&[u8]; 3] = [
    &RH_LANGUAGE_LIST,
    &RH_MANUFACTURER_STRING,
    &RH_PRODUCT_STRING,
];

/// Hub-class descriptor: one downstream port, everything else zero.
const RH_HUB_DESCRIPTOR: [u8; 9] = [9, USB_DESCRIPTOR_TYPE_HUB, 1, 0, 0, 0, 0, 0, 0];

/// Root port status mirrored into hub-class `wPortStatus`/`wPortChange`
/// words, plus the parked status-change interrupt request. Written from the
/// port IRQ, read by hub-class control requests.
pub(crate) struct RootPortState {
    pub status: u16,
    pub change: u16,
    pub intr_req: Option<Box<TransferRequest>>,
}

pub(crate) struct RootHub {
    state: Mutex<RootPortState>,
    requests: Mutex<VecDeque<Box<TransferRequest>>>,
    pending: Completion,
}

impl RootHub {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RootPortState {
                status: 0,
                change: 0,
                intr_req: None,
            }),
            requests: Mutex::new(VecDeque::new()),
            pending: Completion::new(),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, RootPortState> {
        self.state.lock().unwrap()
    }

    /// Queue a transaction for the worker.
    pub fn queue(&self, req: Box<TransferRequest>) {
        self.requests.lock().unwrap().push_back(req);
        self.pending.signal();
    }
}

/// Spawns the single worker that serialises all root-hub traffic.
pub(crate) fn spawn_worker(inner: &Arc<DwcInner>) -> Result<(), Error> {
    thread::Builder::new()
        .name("dwc2-root-hub".into())
        .spawn({
            let inner = inner.clone();
            move || worker(inner)
        })
        .map(drop)
        .map_err(|_| Error::NoMemory)
}

fn worker(inner: Arc<DwcInner>) {
    loop {
        inner.root_hub.pending.wait();

        let req = {
            let mut requests = inner.root_hub.requests.lock().unwrap();
            let req = requests.pop_front();
            if requests.is_empty() {
                inner.root_hub.pending.reset();
            }
            req
        };

        if let Some(req) = req {
            process_request(&inner, req);
        }
    }
}

fn process_request(inner: &DwcInner, req: Box<TransferRequest>) {
    if req.usb().ep_address == 0 {
        process_control_request(inner, req);
    } else {
        // An interrupt-IN request parks here until the port reports a
        // change.
        inner.root_hub.state().intr_req = Some(req);
        complete_port_status_request(inner);
    }
}

/// Completes a parked status-change interrupt request once `wPortChange`
/// is non-zero. The two-byte payload is the hub status-change bitmap with
/// bit 1 set: port 1 changed.
pub(crate) fn complete_port_status_request(inner: &DwcInner) {
    let req = {
        let mut state = inner.root_hub.state();
        if state.change == 0 {
            return;
        }
        state.intr_req.take()
    };

    if let Some(mut req) = req {
        let payload = 0x0002u16.to_le_bytes();
        let usb_req = req.usb_req.as_mut().expect("wrapper has no upstream request");
        usb_req.buffer.as_mut_slice()[..2].copy_from_slice(&payload);
        inner.complete_request(req, Ok(payload.len()));
    }
}

fn process_control_request(inner: &DwcInner, req: Box<TransferRequest>) {
    let setup = req.usb().setup;
    match setup.bm_request_type & USB_TYPE_MASK {
        USB_TYPE_STANDARD => process_standard_request(inner, req),
        USB_TYPE_CLASS => process_class_request(inner, req),
        _ => inner.complete_request(req, Err(Error::NotSupported)),
    }
}

fn process_standard_request(inner: &DwcInner, req: Box<TransferRequest>) {
    let setup = req.usb().setup;
    match setup.b_request {
        USB_REQUEST_SET_ADDRESS => inner.complete_request(req, Ok(0)),
        USB_REQUEST_GET_DESCRIPTOR => get_descriptor(inner, req),
        USB_REQUEST_SET_CONFIGURATION => inner.complete_request(req, Ok(0)),
        _ => inner.complete_request(req, Err(Error::NotSupported)),
    }
}

fn get_descriptor(inner: &DwcInner, req: Box<TransferRequest>) {
    let setup = req.usb().setup;
    let desc_type = (setup.w_value >> 8) as u8;
    let index = setup.w_index;

    if desc_type == USB_DESCRIPTOR_TYPE_DEVICE && index == 0 {
        complete_with_data(inner, req, &RH_DEVICE_DESCRIPTOR);
    } else if desc_type == USB_DESCRIPTOR_TYPE_CONFIGURATION && index == 0 {
        complete_with_data(inner, req, &RH_CONFIG_DESCRIPTOR);
    } else if desc_type == USB_DESCRIPTOR_TYPE_STRING {
        let string_index = (setup.w_value & 0xff) as usize;
        match RH_STRING_TABLE.get(string_index) {
            Some(string) => complete_with_data(inner, req, string),
            None => inner.complete_request(req, Err(Error::NotSupported)),
        }
    } else {
        inner.complete_request(req, Err(Error::NotSupported));
    }
}

fn process_class_request(inner: &DwcInner, req: Box<TransferRequest>) {
    let setup = req.usb().setup;
    match setup.b_request {
        USB_REQUEST_GET_DESCRIPTOR
            if setup.w_value == (USB_DESCRIPTOR_TYPE_HUB as u16) << 8 && setup.w_index == 0 =>
        {
            complete_with_data(inner, req, &RH_HUB_DESCRIPTOR);
        }
        USB_REQUEST_SET_FEATURE => {
            let result = host_port_set_feature(&inner.regs, setup.w_value);
            inner.complete_request(req, result.map(|()| 0));
        }
        USB_REQUEST_CLEAR_FEATURE => {
            {
                let mut state = inner.root_hub.state();
                match setup.w_value {
                    HUB_PORT_FEATURE_C_PORT_CONNECTION => {
                        state.change &= !HUB_PORT_CHANGE_CONNECTION
                    }
                    HUB_PORT_FEATURE_C_PORT_ENABLE => state.change &= !HUB_PORT_CHANGE_ENABLE,
                    HUB_PORT_FEATURE_C_PORT_SUSPEND => state.change &= !HUB_PORT_CHANGE_SUSPEND,
                    HUB_PORT_FEATURE_C_PORT_OVER_CURRENT => {
                        state.change &= !HUB_PORT_CHANGE_OVER_CURRENT
                    }
                    HUB_PORT_FEATURE_C_PORT_RESET => state.change &= !HUB_PORT_CHANGE_RESET,
                    _ => {}
                }
            }
            inner.complete_request(req, Ok(0));
        }
        USB_REQUEST_GET_STATUS => {
            let (status, change) = {
                let state = inner.root_hub.state();
                (state.status, state.change)
            };
            let mut bytes = [0u8; 4];
            bytes[0..2].copy_from_slice(&status.to_le_bytes());
            bytes[2..4].copy_from_slice(&change.to_le_bytes());
            let length = req.usb().length.min(bytes.len());
            complete_with_data(inner, req, &bytes[..length]);
        }
        _ => inner.complete_request(req, Err(Error::NotSupported)),
    }
}

/// Copies `data` (truncated to the request length) into the request buffer
/// and completes it.
fn complete_with_data(inner: &DwcInner, mut req: Box<TransferRequest>, data: &[u8]) {
    let usb_req = req.usb_req.as_mut().expect("wrapper has no upstream request");
    let length = data.len().min(usb_req.length);
    usb_req.buffer.as_mut_slice()[..length].copy_from_slice(&data[..length]);
    inner.complete_request(req, Ok(length));
}

fn host_port_set_feature(regs: &Registers, feature: u16) -> Result<(), Error> {
    match feature {
        HUB_PORT_FEATURE_POWER => {
            host_port_power_on(regs);
            Ok(())
        }
        HUB_PORT_FEATURE_RESET => {
            host_port_reset(regs);
            Ok(())
        }
        _ => Err(Error::NotSupported),
    }
}

/// Current HPRT value with the write-1-to-clear bits (and the port-enable
/// bit, which a write of 1 *disables*) masked out, safe to use as the base
/// of a read-modify-write.
fn host_port_ctrl(regs: &DwcRegisters) -> u32 {
    regs.host_port.get()
        & !(HPRT_ENABLED | HPRT_CONNECTED_CHANGED | HPRT_ENABLED_CHANGED | HPRT_OVERCURRENT_CHANGED)
}

fn host_port_power_on(regs: &Registers) {
    let regs = regs.get();
    let ctrl = host_port_ctrl(regs);
    regs.host_port.set(ctrl | HPRT_POWERED);
}

fn host_port_reset(regs: &Registers) {
    let regs = regs.get();
    regs.host_port.set(host_port_ctrl(regs) | HPRT_RESET);
    thread::sleep(PORT_RESET_SETTLE);
    regs.host_port.set(host_port_ctrl(regs) & !HPRT_RESET);
}
