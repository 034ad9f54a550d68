//! Core interrupt demultiplexing: port, SOF, and channel events.

use tock_registers::interfaces::{Readable, Writeable};

use crate::regs::{CORE_INTR, HOST_FRAME, HOST_PORT, HPRT_ENABLED, HPRT_SPEED_HIGH, HPRT_SPEED_LOW};
use crate::root_hub;
use crate::usb::{
    HUB_PORT_CHANGE_CONNECTION, HUB_PORT_CHANGE_ENABLE, HUB_PORT_CHANGE_OVER_CURRENT,
    HUB_PORT_STATUS_CONNECTION, HUB_PORT_STATUS_ENABLE, HUB_PORT_STATUS_HIGH_SPEED,
    HUB_PORT_STATUS_LOW_SPEED, HUB_PORT_STATUS_OVER_CURRENT, HUB_PORT_STATUS_RESET,
    HUB_PORT_STATUS_SUSPEND,
};
use crate::{Dwc2Controller, DwcInner};

impl Dwc2Controller {
    /// Entry point for the platform's IRQ handler: inspects the core
    /// interrupt register and fans out to the port, SOF, and channel
    /// handlers.
    pub fn handle_irq(&self) {
        let regs = self.inner.regs.get();
        let status = regs.core_interrupt_status.extract();

        if status.is_set(CORE_INTR::PORT) {
            self.inner.handle_port_irq();
        }
        if status.is_set(CORE_INTR::SOF) {
            self.inner.handle_sof_irq();
        }
        if status.is_set(CORE_INTR::HOST_CHANNELS) {
            self.inner.handle_channel_irq();
        }

        // Write-1-to-clear acknowledge of everything observed.
        regs.core_interrupt_status.set(status.get());
    }
}

impl DwcInner {
    /// Rebuilds the root-hub port status words from the host port register
    /// and flushes any parked status-change request.
    fn handle_port_irq(&self) {
        let regs = self.regs.get();
        let hw = regs.host_port.extract();

        {
            let mut state = self.root_hub.state();
            state.status = 0;
            state.change = 0;

            if hw.is_set(HOST_PORT::CONNECTED) {
                state.status |= HUB_PORT_STATUS_CONNECTION;
            }
            if hw.is_set(HOST_PORT::ENABLED) {
                state.status |= HUB_PORT_STATUS_ENABLE;
            }
            if hw.is_set(HOST_PORT::SUSPENDED) {
                state.status |= HUB_PORT_STATUS_SUSPEND;
            }
            if hw.is_set(HOST_PORT::OVERCURRENT) {
                state.status |= HUB_PORT_STATUS_OVER_CURRENT;
            }
            if hw.is_set(HOST_PORT::RESET) {
                state.status |= HUB_PORT_STATUS_RESET;
            }

            match hw.read(HOST_PORT::SPEED) {
                HPRT_SPEED_LOW => state.status |= HUB_PORT_STATUS_LOW_SPEED,
                HPRT_SPEED_HIGH => state.status |= HUB_PORT_STATUS_HIGH_SPEED,
                _ => {}
            }

            if hw.is_set(HOST_PORT::CONNECTED_CHANGED) {
                state.change |= HUB_PORT_CHANGE_CONNECTION;
            }
            if hw.is_set(HOST_PORT::ENABLED_CHANGED) {
                state.change |= HUB_PORT_CHANGE_ENABLE;
            }
            if hw.is_set(HOST_PORT::OVERCURRENT_CHANGED) {
                state.change |= HUB_PORT_CHANGE_OVER_CURRENT;
            }
        }

        // Acknowledge the latched change bits by writing the register back.
        // The enable bit is write-1-to-clear and must not be echoed or the
        // write would disable the port.
        regs.host_port.set(hw.get() & !HPRT_ENABLED);

        root_hub::complete_port_status_request(self);
    }

    /// Wakes every SOF waiter, except in the microframe reserved for
    /// host-initiated complete-splits.
    fn handle_sof_irq(&self) {
        let frame = self.regs.get().host_frame_number.read(HOST_FRAME::FRAME_NUMBER);
        if frame & 0x7 != 6 {
            self.sof.broadcast();
        }
    }

    /// Snapshots and acknowledges every halted channel, then signals the
    /// scheduler that owns it.
    fn handle_channel_irq(&self) {
        let regs = self.regs.get();
        let halted = regs.host_channels_interrupt.get();

        for channel in 0..self.config.num_host_channels {
            if halted & (1 << channel) == 0 {
                continue;
            }
            let chan = &regs.host_channels[channel];
            let snapshot = chan.interrupts.get();

            chan.interrupt_mask.set(0);
            chan.interrupts.set(0xffff_ffff);

            self.channel_events[channel].post(snapshot);
        }
    }
}
