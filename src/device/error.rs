use super::pin::Direction;
use crate::board::PinName;
use std::io;
use thiserror::Error;

/// Enum representing possible failures reported by a hardware driver.
///
/// These are passed to callers of `open`/`close`/register exactly as the driver produced them.
/// Nothing in this crate retries a failed driver call - a GPIO line that refuses to open is usually
/// a wiring or permission fault.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("driver does not know pin {0}")]
    UnknownPin(PinName),
    #[error("failed to access line {line} through {path}")]
    Io {
        line: u32,
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("unexpected value {0:?} read from line")]
    BadValue(String),
    #[error("failed to wait for edge on line {0}")]
    Poll(u32, #[source] nix::Error),
    #[error("hardware refused request for {0}: {1}")]
    Rejected(PinName, String),
}

/// Enum representing possible failures when working with pin handles.
///
/// - AlreadyOpen - Client tries to open a pin name which already has a live handle. Never substituted with the existing handle.
/// - Closed - Client uses a handle after it has been closed.
/// - WrongDirection - Client writes to an input pin or watches edges of an output pin.
/// - EdgeOnOutput - Client asks for an edge trigger on an output pin.
/// - LeaseMapPoisoned - A thread panicked while holding the registry lock.
#[derive(Error, Debug)]
pub enum PinError {
    #[error("pin {0} is already open")]
    AlreadyOpen(PinName),
    #[error("pin {0} is closed")]
    Closed(PinName),
    #[error("operation not supported on pin {0} configured as {1:?}")]
    WrongDirection(PinName, Direction),
    #[error("edge trigger requested on output pin {0}")]
    EdgeOnOutput(PinName),
    #[error("lease map lock poisoned")]
    LeaseMapPoisoned,
}
