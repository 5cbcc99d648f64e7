//! Error taxonomy shared by every server subsystem.
//!
//! The frame table and address-space code propagate these upward. The
//! syscall layer maps every error to a `-1` reply (there is no errno
//! channel); the page-fault handler maps them to process destruction.

use sos_kernel_model::KernelError;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SosError {
    #[error("invalid address")]
    InvalidAddr,

    #[error("address lies in no region")]
    InvalidRegion,

    #[error("out of memory")]
    NoMemory,

    #[error("page is already mapped")]
    AlreadyMapped,

    #[error("kernel refused a mapping operation")]
    InternalMapError,

    #[error("I/O error")]
    IoError,

    #[error("not found")]
    NotFound,

    #[error("bad argument")]
    BadArgument,

    /// The handler's process was destroyed while it was suspended. Observed
    /// at the yield boundary; never surfaces in a reply.
    #[error("process destroyed while handler suspended")]
    Cancelled,
}

pub type SosResult<T> = Result<T, SosError>;

impl From<KernelError> for SosError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::OutOfMemory { .. } | KernelError::OutOfSlots => SosError::NoMemory,
            _ => SosError::InternalMapError,
        }
    }
}
