//! Host channel allocation, per-channel halt events, and the SOF gate.

use std::sync::Mutex;

use tock_registers::interfaces::ReadWriteable;

use crate::regs::{Registers, CORE_INTR};
use crate::sync::Completion;

/// Bitmask pool of hardware channels. Bit *k* set means channel *k* is
/// free. Acquisition is lowest-set-bit first and blocks when the pool is
/// drained; fairness is not guaranteed.
pub(crate) struct ChannelAllocator {
    free: Mutex<u32>,
    available: Completion,
    all_mask: u32,
}

impl ChannelAllocator {
    pub fn new(count: usize) -> Self {
        assert!(count >= 1 && count <= 32);
        let all_mask = if count == 32 { u32::MAX } else { (1 << count) - 1 };
        Self {
            free: Mutex::new(all_mask),
            available: Completion::new(),
            all_mask,
        }
    }

    pub fn acquire(&self) -> u8 {
        loop {
            {
                let mut free = self.free.lock().unwrap();
                // A channel that doesn't exist must never be marked free.
                assert_eq!(*free & !self.all_mask, 0);

                if *free != 0 {
                    let channel = free.trailing_zeros() as u8;
                    *free &= !(1 << channel);
                    return channel;
                }
                self.available.reset();
            }
            self.available.wait();
        }
    }

    pub fn release(&self, channel: u8) {
        {
            let mut free = self.free.lock().unwrap();
            assert!(
                (1 << channel) & self.all_mask != 0,
                "released nonexistent channel {channel}"
            );
            assert_eq!(*free & (1 << channel), 0, "double release of channel {channel}");
            *free |= 1 << channel;
        }
        self.available.signal();
    }

    #[cfg(test)]
    pub fn free_mask(&self) -> u32 {
        *self.free.lock().unwrap()
    }
}

/// Per-channel halt event: the IRQ handler snapshots the channel's
/// interrupt register here and signals; the scheduler holding the channel
/// is the only reader. Mutual exclusion between transfers comes from the
/// channel-allocation discipline, not from this lock.
pub(crate) struct ChannelEvent {
    interrupts: Mutex<u32>,
    halted: Completion,
}

impl ChannelEvent {
    pub fn new() -> Self {
        Self {
            interrupts: Mutex::new(0),
            halted: Completion::new(),
        }
    }

    /// Called from the IRQ handler with the captured interrupt bits.
    pub fn post(&self, interrupts: u32) {
        *self.interrupts.lock().unwrap() = interrupts;
        self.halted.signal();
    }

    /// Blocks until the channel halts and returns the captured bits.
    pub fn await_halt(&self) -> u32 {
        self.halted.wait();
        self.halted.reset();
        *self.interrupts.lock().unwrap()
    }
}

/// Parks low/full-speed interrupt transfers until the next usable start of
/// frame. The SOF core interrupt is only unmasked while at least one waiter
/// is parked.
pub(crate) struct SofGate {
    waiters: Mutex<usize>,
    wakeups: Vec<Completion>,
}

impl SofGate {
    pub fn new(num_channels: usize) -> Self {
        Self {
            waiters: Mutex::new(0),
            wakeups: (0..num_channels).map(|_| Completion::new()).collect(),
        }
    }

    /// Blocks the calling scheduler until the SOF IRQ signals this
    /// channel's wakeup.
    pub fn park(&self, regs: &Registers, channel: u8) {
        {
            let mut waiters = self.waiters.lock().unwrap();
            if *waiters == 0 {
                regs.get().core_interrupt_mask.modify(CORE_INTR::SOF::SET);
            }
            *waiters += 1;
        }

        let wakeup = &self.wakeups[channel as usize];
        wakeup.reset();
        wakeup.wait();

        {
            let mut waiters = self.waiters.lock().unwrap();
            *waiters -= 1;
            if *waiters == 0 {
                regs.get().core_interrupt_mask.modify(CORE_INTR::SOF::CLEAR);
            }
        }
    }

    /// Called from the SOF IRQ on frames usable for start-splits.
    pub fn broadcast(&self) {
        for wakeup in &self.wakeups {
            wakeup.signal();
        }
    }
}
