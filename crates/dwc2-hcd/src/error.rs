use thiserror::Error;

/// Errors surfaced to request completions and HCI callers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum Error {
    /// The transfer failed on the bus: a hardware-signalled fault class,
    /// an endpoint stall, or a halt that completed no work.
    #[error("transfer failed on the bus")]
    Io,
    /// A request or its backing memory could not be allocated.
    #[error("out of memory")]
    NoMemory,
    /// The request is malformed: oversized transfer, unknown device or
    /// endpoint.
    #[error("invalid request")]
    InvalidArgs,
    /// The operation is not implemented by this controller.
    #[error("not supported")]
    NotSupported,
}
