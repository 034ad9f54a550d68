//! Upstream request objects, their DMA-able buffers, and the wrapper pool.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::error::Error;
use crate::usb::SetupPacket;

/// How many free wrappers the recycling pool hangs onto. Anything past this
/// is dropped back to the allocator.
pub(crate) const FREE_REQ_CACHE_THRESHOLD: usize = 1024;

/// Bus-translation and cache-maintenance primitives owned by the platform.
///
/// The DMA engine reads and writes request buffers behind the CPU's back;
/// before programming a channel the driver flushes the buffer, and after an
/// inbound transfer completes it invalidates the bytes the hardware wrote.
/// `bus_address` translates a host buffer into the address the DMA engine is
/// programmed with (the BTI mapping on platforms that have one).
pub trait DmaOps: Send + Sync {
    /// Bus address of `buf[0]` as seen by the DMA engine.
    fn bus_address(&self, buf: &[u8]) -> u64;

    fn cache_flush(&self, buf: &[u8]);

    fn cache_invalidate(&self, buf: &[u8]);
}

/// [`DmaOps`] for identity-mapped, cache-coherent hosts.
pub struct CoherentDma;

impl DmaOps for CoherentDma {
    fn bus_address(&self, buf: &[u8]) -> u64 {
        buf.as_ptr() as u64
    }

    fn cache_flush(&self, _buf: &[u8]) {}

    fn cache_invalidate(&self, _buf: &[u8]) {}
}

/// A word-aligned buffer suitable for channel DMA.
pub struct DmaBuffer {
    words: Box<[u64]>,
    len: usize,
}

impl DmaBuffer {
    pub fn new(len: usize) -> Self {
        let words = vec![0u64; len.div_ceil(8).max(1)].into_boxed_slice();
        Self { words, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), self.len) }
    }
}

type CompleteFn = Box<dyn FnOnce(UsbRequest, Result<usize, Error>) + Send>;

/// A transfer handed down by the upstream USB bus layer.
///
/// The request owns its DMA buffer and a single-shot completion callback;
/// the driver invokes the callback exactly once, handing the request back
/// together with the outcome (final byte count on success).
pub struct UsbRequest {
    pub device_id: u32,
    pub ep_address: u8,
    pub setup: SetupPacket,
    /// Bytes to transfer; the buffer is at least this large.
    pub length: usize,
    /// Terminate an OUT transfer that is an exact multiple of the max packet
    /// size with a zero-length packet.
    pub send_zlp: bool,
    pub buffer: DmaBuffer,
    complete_cb: Option<CompleteFn>,
}

impl UsbRequest {
    pub fn new(device_id: u32, ep_address: u8, length: usize) -> Self {
        Self {
            device_id,
            ep_address,
            setup: SetupPacket::default(),
            length,
            send_zlp: false,
            buffer: DmaBuffer::new(length),
            complete_cb: None,
        }
    }

    /// A control request on endpoint 0; the transfer length is the setup
    /// packet's `wLength`.
    pub fn control(device_id: u32, setup: SetupPacket) -> Self {
        let mut req = Self::new(device_id, 0, setup.w_length as usize);
        req.setup = setup;
        req
    }

    pub fn on_complete(
        &mut self,
        cb: impl FnOnce(UsbRequest, Result<usize, Error>) + Send + 'static,
    ) {
        self.complete_cb = Some(Box::new(cb));
    }

    pub(crate) fn complete(mut self, result: Result<usize, Error>) {
        if let Some(cb) = self.complete_cb.take() {
            cb(self, result);
        }
    }
}

/// Control transfer phase. Phases only ever advance, and DATA is skipped
/// when the setup packet carries no data stage.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum CtrlPhase {
    Setup,
    Data,
    Status,
}

/// Driver-side wrapper around an in-flight [`UsbRequest`].
///
/// Wrappers are recycled through [`RequestPool`]; every field is reset on
/// acquisition. `usb_req` is `Some` from acquisition until the upstream
/// request is completed.
pub(crate) struct TransferRequest {
    pub usb_req: Option<UsbRequest>,
    pub request_id: u32,
    pub ctrl_phase: CtrlPhase,
    /// Holds the 8-byte setup packet for the SETUP stage DMA.
    pub setup_buffer: Option<DmaBuffer>,
    pub bytes_transferred: usize,
    pub bytes_queued: usize,
    pub total_bytes_queued: usize,
    pub packets_queued: u32,
    /// Wire packet id for the next transaction ([`crate::regs::pid`]).
    pub next_data_toggle: u32,
    pub complete_split: bool,
    pub short_attempt: bool,
    pub csplit_retries: u8,
}

impl TransferRequest {
    fn reset(&mut self, usb_req: UsbRequest, request_id: u32) {
        self.usb_req = Some(usb_req);
        self.request_id = request_id;
        self.ctrl_phase = CtrlPhase::Setup;
        self.setup_buffer = None;
        self.bytes_transferred = 0;
        self.bytes_queued = 0;
        self.total_bytes_queued = 0;
        self.packets_queued = 0;
        self.next_data_toggle = 0;
        self.complete_split = false;
        self.short_attempt = false;
        self.csplit_retries = 0;
    }

    pub fn usb(&self) -> &UsbRequest {
        self.usb_req
            .as_ref()
            .expect("wrapper has no upstream request")
    }
}

/// Recycling pool for transfer wrappers.
///
/// Bounds steady-state memory while absorbing enumeration bursts; also the
/// source of the monotonically increasing debug ids.
pub(crate) struct RequestPool {
    free: Mutex<Vec<Box<TransferRequest>>>,
    next_id: AtomicU32,
}

impl RequestPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(0),
        }
    }

    pub fn acquire(&self, usb_req: UsbRequest) -> Box<TransferRequest> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut req = self.free.lock().unwrap().pop().unwrap_or_else(|| {
            Box::new(TransferRequest {
                usb_req: None,
                request_id: 0,
                ctrl_phase: CtrlPhase::Setup,
                setup_buffer: None,
                bytes_transferred: 0,
                bytes_queued: 0,
                total_bytes_queued: 0,
                packets_queued: 0,
                next_data_toggle: 0,
                complete_split: false,
                short_attempt: false,
                csplit_retries: 0,
            })
        });
        req.reset(usb_req, request_id);
        req
    }

    pub fn release(&self, req: Box<TransferRequest>) {
        let mut free = self.free.lock().unwrap();
        if free.len() < FREE_REQ_CACHE_THRESHOLD {
            free.push(req);
        }
        // Otherwise the wrapper is simply dropped.
    }

    #[cfg(test)]
    pub fn free_len(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dma_buffer_is_word_aligned() {
        for len in [0usize, 1, 7, 8, 9, 4096] {
            let buf = DmaBuffer::new(len);
            assert_eq!(buf.as_slice().as_ptr() as usize % 8, 0);
            assert_eq!(buf.len(), len);
        }
    }

    #[test]
    fn pool_recycles_wrappers_and_assigns_increasing_ids() {
        let pool = RequestPool::new();
        let a = pool.acquire(UsbRequest::new(1, 0x81, 8));
        let id_a = a.request_id;
        pool.release(a);
        assert_eq!(pool.free_len(), 1);

        let b = pool.acquire(UsbRequest::new(1, 0x81, 8));
        assert!(b.request_id > id_a, "ids must be monotonically increasing");
        assert!(b.usb_req.is_some());
        assert_eq!(b.bytes_transferred, 0);
        pool.release(b);
    }

    #[test]
    fn pool_never_holds_more_than_the_threshold() {
        let pool = RequestPool::new();
        let mut reqs = Vec::new();
        for _ in 0..FREE_REQ_CACHE_THRESHOLD + 10 {
            reqs.push(pool.acquire(UsbRequest::new(0, 0, 0)));
        }
        for req in reqs {
            pool.release(req);
        }
        assert_eq!(pool.free_len(), FREE_REQ_CACHE_THRESHOLD);
    }

    #[test]
    fn completion_callback_runs_exactly_once_with_the_request() {
        use std::sync::mpsc;

        let (tx, rx) = mpsc::channel();
        let mut req = UsbRequest::new(3, 0x02, 16);
        req.on_complete(move |req, result| {
            tx.send((req.device_id, result)).unwrap();
        });
        req.complete(Ok(16));

        let (device_id, result) = rx.recv().unwrap();
        assert_eq!(device_id, 3);
        assert_eq!(result, Ok(16));
        assert!(rx.try_recv().is_err());
    }
}
