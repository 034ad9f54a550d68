//! Wire-level USB types and constants shared across the driver.

use core::fmt;

pub const USB_ENDPOINT_DIR_MASK: u8 = 0x80;
pub const USB_DIR_IN: u8 = 0x80;
pub const USB_DIR_OUT: u8 = 0x00;

pub const USB_TYPE_MASK: u8 = 0x60;
pub const USB_TYPE_STANDARD: u8 = 0x00;
pub const USB_TYPE_CLASS: u8 = 0x20;

pub const USB_REQUEST_GET_STATUS: u8 = 0x00;
pub const USB_REQUEST_CLEAR_FEATURE: u8 = 0x01;
pub const USB_REQUEST_SET_FEATURE: u8 = 0x03;
pub const USB_REQUEST_SET_ADDRESS: u8 = 0x05;
pub const USB_REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const USB_REQUEST_SET_CONFIGURATION: u8 = 0x09;

pub const USB_DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub const USB_DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
pub const USB_DESCRIPTOR_TYPE_STRING: u8 = 0x03;
pub const USB_DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
pub const USB_DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;
pub const USB_DESCRIPTOR_TYPE_HUB: u8 = 0x29;

// Hub class port features (wValue of SET_FEATURE/CLEAR_FEATURE).
pub const HUB_PORT_FEATURE_RESET: u16 = 4;
pub const HUB_PORT_FEATURE_POWER: u16 = 8;
pub const HUB_PORT_FEATURE_C_PORT_CONNECTION: u16 = 16;
pub const HUB_PORT_FEATURE_C_PORT_ENABLE: u16 = 17;
pub const HUB_PORT_FEATURE_C_PORT_SUSPEND: u16 = 18;
pub const HUB_PORT_FEATURE_C_PORT_OVER_CURRENT: u16 = 19;
pub const HUB_PORT_FEATURE_C_PORT_RESET: u16 = 20;

// wPortStatus bits.
pub const HUB_PORT_STATUS_CONNECTION: u16 = 1 << 0;
pub const HUB_PORT_STATUS_ENABLE: u16 = 1 << 1;
pub const HUB_PORT_STATUS_SUSPEND: u16 = 1 << 2;
pub const HUB_PORT_STATUS_OVER_CURRENT: u16 = 1 << 3;
pub const HUB_PORT_STATUS_RESET: u16 = 1 << 4;
pub const HUB_PORT_STATUS_POWER: u16 = 1 << 8;
pub const HUB_PORT_STATUS_LOW_SPEED: u16 = 1 << 9;
pub const HUB_PORT_STATUS_HIGH_SPEED: u16 = 1 << 10;

// wPortChange bits.
pub const HUB_PORT_CHANGE_CONNECTION: u16 = 1 << 0;
pub const HUB_PORT_CHANGE_ENABLE: u16 = 1 << 1;
pub const HUB_PORT_CHANGE_SUSPEND: u16 = 1 << 2;
pub const HUB_PORT_CHANGE_OVER_CURRENT: u16 = 1 << 3;
pub const HUB_PORT_CHANGE_RESET: u16 = 1 << 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl EndpointType {
    pub fn from_attributes(bm_attributes: u8) -> Self {
        match bm_attributes & 0x3 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }

    /// Endpoint type encoding used by the channel characteristics register.
    pub fn wire_value(self) -> u32 {
        match self {
            Self::Control => 0,
            Self::Isochronous => 1,
            Self::Bulk => 2,
            Self::Interrupt => 3,
        }
    }
}

/// The 8-byte packet opening every control transfer, with the field names
/// the USB spec gives them.
#[derive(Clone, Copy, Default)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl fmt::Debug for SetupPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SetupPacket(type {:#x}, request {:#x}, value {:#x}, index {:#x}, length {})",
            self.bm_request_type, self.b_request, self.w_value, self.w_index, self.w_length
        )
    }
}

impl SetupPacket {
    pub fn parse(bytes: [u8; 8]) -> Self {
        let word = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        Self {
            bm_request_type: bytes[0],
            b_request: bytes[1],
            w_value: word(2),
            w_index: word(4),
            w_length: word(6),
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0] = self.bm_request_type;
        bytes[1] = self.b_request;
        bytes[2..4].copy_from_slice(&self.w_value.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.w_index.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.w_length.to_le_bytes());
        bytes
    }

    /// Direction of the data stage: `true` for device-to-host.
    pub fn is_in(&self) -> bool {
        self.bm_request_type & USB_ENDPOINT_DIR_MASK != 0
    }
}

/// Cached copy of a standard endpoint descriptor.
#[derive(Clone, Copy, Debug)]
pub struct EndpointDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_endpoint_address: u8,
    pub bm_attributes: u8,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
}

impl EndpointDescriptor {
    /// Descriptor for a default control endpoint with the given max packet
    /// size. Used for ep0 before and during enumeration.
    pub fn control(max_packet_size: u16) -> Self {
        Self {
            b_length: 7,
            b_descriptor_type: USB_DESCRIPTOR_TYPE_ENDPOINT,
            b_endpoint_address: 0,
            bm_attributes: 0,
            w_max_packet_size: max_packet_size,
            b_interval: 0,
        }
    }

    pub fn ep_type(&self) -> EndpointType {
        EndpointType::from_attributes(self.bm_attributes)
    }

    pub fn is_in(&self) -> bool {
        self.b_endpoint_address & USB_ENDPOINT_DIR_MASK != 0
    }

    /// Endpoint number without the direction bit.
    pub fn number(&self) -> u8 {
        self.b_endpoint_address & 0x0f
    }

    /// Max packet size with the high-bandwidth bits masked off.
    pub fn max_packet_size(&self) -> u16 {
        self.w_max_packet_size & 0x7ff
    }

    /// Additional transactions per microframe for high-bandwidth endpoints.
    pub fn extra_packets_per_microframe(&self) -> u16 {
        (self.w_max_packet_size >> 11) & 0x3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_packet_round_trips_through_wire_form() {
        let setup = SetupPacket {
            bm_request_type: USB_DIR_IN,
            b_request: USB_REQUEST_GET_DESCRIPTOR,
            w_value: (USB_DESCRIPTOR_TYPE_DEVICE as u16) << 8,
            w_index: 0,
            w_length: 8,
        };
        let bytes = setup.to_bytes();
        assert_eq!(bytes, [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x08, 0x00]);

        let parsed = SetupPacket::parse(bytes);
        assert_eq!(parsed.bm_request_type, setup.bm_request_type);
        assert_eq!(parsed.b_request, setup.b_request);
        assert_eq!(parsed.w_value, setup.w_value);
        assert_eq!(parsed.w_index, setup.w_index);
        assert_eq!(parsed.w_length, setup.w_length);
        assert!(parsed.is_in());
    }

    #[test]
    fn endpoint_descriptor_accessors() {
        let desc = EndpointDescriptor {
            b_length: 7,
            b_descriptor_type: USB_DESCRIPTOR_TYPE_ENDPOINT,
            b_endpoint_address: 0x81,
            bm_attributes: 0x02,
            w_max_packet_size: 512 | (1 << 11),
            b_interval: 0,
        };
        assert_eq!(desc.ep_type(), EndpointType::Bulk);
        assert!(desc.is_in());
        assert_eq!(desc.number(), 1);
        assert_eq!(desc.max_packet_size(), 512);
        assert_eq!(desc.extra_packets_per_microframe(), 1);
    }
}
