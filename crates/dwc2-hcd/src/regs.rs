//! DWC2 host-mode register definitions.
//!
//! Only the registers the host core touches are modelled: the core interrupt
//! status/mask pair, the frame counter, the per-channel register files, and
//! the single host port. Everything else is padding so the typed block lands
//! on the hardware offsets.

use core::ptr::NonNull;

use tock_registers::register_bitfields;
use tock_registers::registers::{ReadOnly, ReadWrite};

/// Upper bound on the channel register files present in the block. The
/// number actually implemented is hardware-reported and supplied by the
/// platform through [`crate::Dwc2Config`].
pub const MAX_HOST_CHANNELS: usize = 16;

/// Size of the register window the driver touches.
pub const MMIO_SIZE: usize = 0x700;

// Register offsets from the MMIO base.
pub const REG_CORE_INTERRUPT_STATUS: usize = 0x014;
pub const REG_CORE_INTERRUPT_MASK: usize = 0x018;
pub const REG_HOST_FRAME_NUMBER: usize = 0x408;
pub const REG_HOST_CHANNELS_INTERRUPT: usize = 0x414;
pub const REG_HOST_CHANNELS_INTERRUPT_MASK: usize = 0x418;
pub const REG_HOST_PORT: usize = 0x440;
pub const REG_HOST_CHANNEL_BASE: usize = 0x500;
pub const HOST_CHANNEL_STRIDE: usize = 0x20;

// Per-channel register offsets within a channel register file.
pub const CHAN_CHARACTERISTICS: usize = 0x00;
pub const CHAN_SPLIT_CONTROL: usize = 0x04;
pub const CHAN_INTERRUPTS: usize = 0x08;
pub const CHAN_INTERRUPT_MASK: usize = 0x0c;
pub const CHAN_TRANSFER: usize = 0x10;
pub const CHAN_DMA_ADDRESS: usize = 0x14;

pub const fn reg_channel(channel: usize) -> usize {
    REG_HOST_CHANNEL_BASE + channel * HOST_CHANNEL_STRIDE
}

// Raw masks for the hardware-side view (test rigs, debug dumps). The driver
// itself goes through the typed bitfields below.
pub const GINTSTS_SOF: u32 = 1 << 3;
pub const GINTSTS_PORT: u32 = 1 << 24;
pub const GINTSTS_HOST_CHANNELS: u32 = 1 << 25;

pub const HCCHAR_MPS_MASK: u32 = 0x7ff;
pub const HCCHAR_EPNUM_SHIFT: u32 = 11;
pub const HCCHAR_EPNUM_MASK: u32 = 0xf;
pub const HCCHAR_EPDIR_IN: u32 = 1 << 15;
pub const HCCHAR_LOW_SPEED: u32 = 1 << 17;
pub const HCCHAR_EPTYPE_SHIFT: u32 = 18;
pub const HCCHAR_EPTYPE_MASK: u32 = 0x3;
pub const HCCHAR_DEVADDR_SHIFT: u32 = 22;
pub const HCCHAR_DEVADDR_MASK: u32 = 0x7f;
pub const HCCHAR_ODD_FRAME: u32 = 1 << 29;
pub const HCCHAR_CHANNEL_ENABLE: u32 = 1 << 31;

pub const HCSPLT_PORT_ADDR_MASK: u32 = 0x7f;
pub const HCSPLT_HUB_ADDR_SHIFT: u32 = 7;
pub const HCSPLT_HUB_ADDR_MASK: u32 = 0x7f;
pub const HCSPLT_COMPLETE_SPLIT: u32 = 1 << 16;
pub const HCSPLT_SPLIT_ENABLE: u32 = 1 << 31;

pub const HCINT_TRANSFER_COMPLETED: u32 = 1 << 0;
pub const HCINT_CHANNEL_HALTED: u32 = 1 << 1;
pub const HCINT_AHB_ERROR: u32 = 1 << 2;
pub const HCINT_STALL: u32 = 1 << 3;
pub const HCINT_NAK: u32 = 1 << 4;
pub const HCINT_ACK: u32 = 1 << 5;
pub const HCINT_NYET: u32 = 1 << 6;
pub const HCINT_TRANSACTION_ERROR: u32 = 1 << 7;
pub const HCINT_BABBLE_ERROR: u32 = 1 << 8;
pub const HCINT_FRAME_OVERRUN: u32 = 1 << 9;
pub const HCINT_DATA_TOGGLE_ERROR: u32 = 1 << 10;
pub const HCINT_EXCESS_TRANSACTION_ERROR: u32 = 1 << 12;
pub const HCINT_FRAME_LIST_ROLLOVER: u32 = 1 << 13;

pub const HCTSIZ_SIZE_MASK: u32 = 0x7ffff;
pub const HCTSIZ_PKTCNT_SHIFT: u32 = 19;
pub const HCTSIZ_PKTCNT_MASK: u32 = 0x3ff;
pub const HCTSIZ_PID_SHIFT: u32 = 29;
pub const HCTSIZ_PID_MASK: u32 = 0x3;

pub const HPRT_CONNECTED: u32 = 1 << 0;
pub const HPRT_CONNECTED_CHANGED: u32 = 1 << 1;
pub const HPRT_ENABLED: u32 = 1 << 2;
pub const HPRT_ENABLED_CHANGED: u32 = 1 << 3;
pub const HPRT_OVERCURRENT: u32 = 1 << 4;
pub const HPRT_OVERCURRENT_CHANGED: u32 = 1 << 5;
pub const HPRT_SUSPENDED: u32 = 1 << 7;
pub const HPRT_RESET: u32 = 1 << 8;
pub const HPRT_POWERED: u32 = 1 << 12;
pub const HPRT_SPEED_SHIFT: u32 = 17;
pub const HPRT_SPEED_MASK: u32 = 0x3;

/// Port speed encodings in the host port register.
pub const HPRT_SPEED_HIGH: u32 = 0;
pub const HPRT_SPEED_FULL: u32 = 1;
pub const HPRT_SPEED_LOW: u32 = 2;

/// Packet-id (data toggle) encodings used by the transfer register.
pub mod pid {
    pub const DATA0: u32 = 0;
    pub const DATA2: u32 = 1;
    pub const DATA1: u32 = 2;
    pub const MDATA_SETUP: u32 = 3;
}

/// Endpoint direction encodings used by the characteristics register.
pub const EP_DIR_OUT: u32 = 0;
pub const EP_DIR_IN: u32 = 1;

register_bitfields![
    u32,
    /// Core interrupt status (GINTSTS) / mask (GINTMSK).
    pub CORE_INTR [
        SOF OFFSET(3) NUMBITS(1) [],
        PORT OFFSET(24) NUMBITS(1) [],
        HOST_CHANNELS OFFSET(25) NUMBITS(1) []
    ],

    /// Host frame number (HFNUM).
    pub HOST_FRAME [
        FRAME_NUMBER OFFSET(0) NUMBITS(16) [],
        FRAME_REMAINING OFFSET(16) NUMBITS(16) []
    ],

    /// Host port control and status (HPRT).
    ///
    /// The `*_CHANGED` bits and `ENABLED` are write-1-to-clear; writers must
    /// mask them out of read-modify-write sequences or the write clears the
    /// latched change (or disables the port).
    pub HOST_PORT [
        CONNECTED OFFSET(0) NUMBITS(1) [],
        CONNECTED_CHANGED OFFSET(1) NUMBITS(1) [],
        ENABLED OFFSET(2) NUMBITS(1) [],
        ENABLED_CHANGED OFFSET(3) NUMBITS(1) [],
        OVERCURRENT OFFSET(4) NUMBITS(1) [],
        OVERCURRENT_CHANGED OFFSET(5) NUMBITS(1) [],
        RESUME OFFSET(6) NUMBITS(1) [],
        SUSPENDED OFFSET(7) NUMBITS(1) [],
        RESET OFFSET(8) NUMBITS(1) [],
        POWERED OFFSET(12) NUMBITS(1) [],
        SPEED OFFSET(17) NUMBITS(2) [
            High = 0,
            Full = 1,
            Low = 2
        ]
    ],

    /// Host channel characteristics (HCCHAR).
    pub CHANNEL_CHARACTERISTICS [
        MAX_PACKET_SIZE OFFSET(0) NUMBITS(11) [],
        ENDPOINT_NUMBER OFFSET(11) NUMBITS(4) [],
        ENDPOINT_DIRECTION OFFSET(15) NUMBITS(1) [
            Out = 0,
            In = 1
        ],
        LOW_SPEED OFFSET(17) NUMBITS(1) [],
        ENDPOINT_TYPE OFFSET(18) NUMBITS(2) [],
        PACKETS_PER_FRAME OFFSET(20) NUMBITS(2) [],
        DEVICE_ADDRESS OFFSET(22) NUMBITS(7) [],
        ODD_FRAME OFFSET(29) NUMBITS(1) [],
        CHANNEL_DISABLE OFFSET(30) NUMBITS(1) [],
        CHANNEL_ENABLE OFFSET(31) NUMBITS(1) []
    ],

    /// Host channel split control (HCSPLT).
    pub CHANNEL_SPLIT_CONTROL [
        PORT_ADDRESS OFFSET(0) NUMBITS(7) [],
        HUB_ADDRESS OFFSET(7) NUMBITS(7) [],
        TRANSACTION_POSITION OFFSET(14) NUMBITS(2) [],
        COMPLETE_SPLIT OFFSET(16) NUMBITS(1) [],
        SPLIT_ENABLE OFFSET(31) NUMBITS(1) []
    ],

    /// Host channel interrupt status (HCINT) / mask (HCINTMSK).
    pub CHANNEL_INTERRUPTS [
        TRANSFER_COMPLETED OFFSET(0) NUMBITS(1) [],
        CHANNEL_HALTED OFFSET(1) NUMBITS(1) [],
        AHB_ERROR OFFSET(2) NUMBITS(1) [],
        STALL OFFSET(3) NUMBITS(1) [],
        NAK OFFSET(4) NUMBITS(1) [],
        ACK OFFSET(5) NUMBITS(1) [],
        NYET OFFSET(6) NUMBITS(1) [],
        TRANSACTION_ERROR OFFSET(7) NUMBITS(1) [],
        BABBLE_ERROR OFFSET(8) NUMBITS(1) [],
        FRAME_OVERRUN OFFSET(9) NUMBITS(1) [],
        DATA_TOGGLE_ERROR OFFSET(10) NUMBITS(1) [],
        BUFFER_NOT_AVAILABLE OFFSET(11) NUMBITS(1) [],
        EXCESS_TRANSACTION_ERROR OFFSET(12) NUMBITS(1) [],
        FRAME_LIST_ROLLOVER OFFSET(13) NUMBITS(1) []
    ],

    /// Host channel transfer size (HCTSIZ).
    pub CHANNEL_TRANSFER [
        SIZE OFFSET(0) NUMBITS(19) [],
        PACKET_COUNT OFFSET(19) NUMBITS(10) [],
        PACKET_ID OFFSET(29) NUMBITS(2) [],
        DO_PING OFFSET(31) NUMBITS(1) []
    ]
];

/// One host channel register file (0x20 bytes).
#[repr(C)]
pub struct HostChannel {
    pub characteristics: ReadWrite<u32, CHANNEL_CHARACTERISTICS::Register>,
    pub split_control: ReadWrite<u32, CHANNEL_SPLIT_CONTROL::Register>,
    pub interrupts: ReadWrite<u32, CHANNEL_INTERRUPTS::Register>,
    pub interrupt_mask: ReadWrite<u32, CHANNEL_INTERRUPTS::Register>,
    pub transfer: ReadWrite<u32, CHANNEL_TRANSFER::Register>,
    pub dma_address: ReadWrite<u32>,
    _reserved: u32,
    pub dma_buffer: ReadOnly<u32>,
}

/// The DWC2 register block, laid out at the hardware offsets.
#[repr(C)]
pub struct DwcRegisters {
    _reserved0: [u32; 5],
    pub core_interrupt_status: ReadWrite<u32, CORE_INTR::Register>,
    pub core_interrupt_mask: ReadWrite<u32, CORE_INTR::Register>,
    _reserved1: [u32; 251],
    pub host_frame_number: ReadOnly<u32, HOST_FRAME::Register>,
    _reserved2: [u32; 2],
    pub host_channels_interrupt: ReadOnly<u32>,
    pub host_channels_interrupt_mask: ReadWrite<u32>,
    _reserved3: [u32; 9],
    pub host_port: ReadWrite<u32, HOST_PORT::Register>,
    _reserved4: [u32; 47],
    pub host_channels: [HostChannel; MAX_HOST_CHANNELS],
}

/// Handle to the mapped DWC2 register block.
///
/// This is the only capability through which the driver touches the
/// hardware; there is no ambient global. All access is volatile through
/// `tock-registers` cells.
pub struct Registers {
    base: NonNull<DwcRegisters>,
}

// Register access is volatile and the hardware serialises concurrent
// accessors; the handle itself carries no state.
unsafe impl Send for Registers {}
unsafe impl Sync for Registers {}

impl Registers {
    /// Wraps a mapped register window.
    ///
    /// # Safety
    ///
    /// `base` must point to at least [`MMIO_SIZE`] bytes of device memory
    /// (or memory standing in for it) that stays mapped for the lifetime of
    /// the handle.
    pub unsafe fn new(base: *mut u8) -> Self {
        let base = NonNull::new(base.cast::<DwcRegisters>())
            .expect("register base must be non-null");
        Self { base }
    }

    pub(crate) fn get(&self) -> &DwcRegisters {
        unsafe { self.base.as_ref() }
    }
}
