//! Host side of the link: word transport, low-level primitives and the
//! flash/dump/save orchestration built on top of them.

mod link;
mod ops;

use core::fmt;

pub use link::{Link, LinkConfig};
pub use ops::{FlashOptions, FlashReport, SaveType, SaveTypeError};

/// One full-duplex 32-bit exchange with the device.
///
/// The word returned is whatever the device preloaded after the *previous*
/// exchange; the device sees `out` now and answers it next time.
pub trait WordTransport {
    type Error;

    fn exchange_word(&mut self, out: u32) -> Result<u32, Self::Error>;
}

impl<T: WordTransport + ?Sized> WordTransport for &mut T {
    type Error = T::Error;

    fn exchange_word(&mut self, out: u32) -> Result<u32, Self::Error> {
        (**self).exchange_word(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostError<E> {
    /// The underlying transport failed.
    Transport(E),
    /// The device never returned to IDLE.
    Timeout,
    /// Flash identifier did not match what we know how to program.
    UnsupportedCart { id: u32 },
    CrcMismatch { expected: u32, actual: u32 },
    /// A retry loop hit its configured cap.
    RetriesExhausted { block: usize },
    /// A worker command returned an unexpected status.
    DeviceStatus { command: u32, status: u32 },
    /// Transfer length is not a word multiple or exceeds the device buffer.
    InvalidLength { len: usize },
}

impl<E> HostError<E> {
    /// Process exit status for command-line front ends.
    pub fn exit_code(&self) -> i32 {
        match self {
            HostError::Transport(_) => -2,
            HostError::Timeout => -3,
            HostError::UnsupportedCart { .. } => -4,
            HostError::CrcMismatch { .. } => -5,
            HostError::RetriesExhausted { .. } => -6,
            HostError::DeviceStatus { .. } => -7,
            HostError::InvalidLength { .. } => -8,
        }
    }
}

impl<E: fmt::Display> fmt::Display for HostError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::Transport(err) => write!(f, "transport error: {}", err),
            HostError::Timeout => write!(f, "device did not return to idle"),
            HostError::UnsupportedCart { id } => {
                write!(f, "unsupported flash, ID 0x{:08x}", id)
            }
            HostError::CrcMismatch { expected, actual } => {
                write!(f, "CRC mismatch, 0x{:08x} != 0x{:08x}", expected, actual)
            }
            HostError::RetriesExhausted { block } => {
                write!(f, "retries exhausted on block {}", block)
            }
            HostError::DeviceStatus { command, status } => write!(
                f,
                "command 0x{:08x} returned status 0x{:08x}",
                command, status
            ),
            HostError::InvalidLength { len } => write!(f, "invalid transfer length {}", len),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> core::error::Error for HostError<E> {}
