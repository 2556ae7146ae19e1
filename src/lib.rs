//! This crate ties GPIO pins of a single-board computer to the lifecycle of the application using them.
//!
//! The building blocks are:
//!
//! * `PeripheralRegistry` - opens pins by name through a `Driver` and guarantees at most one live `PinHandle` per pin.
//! * `EdgeDispatcher` - one dedicated worker thread running edge callbacks and other background work in FIFO order.
//! * `LifecycleBound` - closes a pin when its `Lifecycle` goes inactive, reopens a fresh one when it becomes active again
//!   and closes it for good when the lifecycle is destroyed.
//! * `Foreground` / `ResultRelay` - the single foreground loop background work posts its results to.
//!
//! Two drivers are included: `SysfsDriver` for Linux boards exposing `/sys/class/gpio`, and `SimulatedDriver`,
//! an in-memory board for tests and for running the demo without hardware.
//!
//! Basic pin handles implement the relevant [`embedded_hal`](https://crates.io/crates/embedded-hal) digital traits.

use thiserror::Error;

pub mod app;
pub mod board;
mod device;
pub mod dispatch;
pub mod lifecycle;
pub mod relay;

pub use board::{BoardDefaults, BoardError, DeviceModel, PinName};
pub use device::driver::{Driver, EdgeSink, Line, LineConfig};
pub use device::error::{DriverError, PinError};
pub use device::sim::SimulatedDriver;
pub use device::sysfs::SysfsDriver;
pub use device::{Direction, Edge, EdgeEvent, EdgeKind, PeripheralRegistry, PinHandle, Value};
pub use dispatch::{ContinueListening, DispatchError, EdgeDispatcher, Registration};
pub use lifecycle::{
    BindingState, Lifecycle, LifecycleBound, LifecycleError, LifecycleObserver, LifecycleState,
    Retain, SubscriptionId, Transition,
};
pub use relay::{Foreground, ForegroundOnly, RelayError, ResultRelay};

/// Main error type for this crate.
///
/// For more details, see the per-area error enums wrapped by each variant.
#[derive(Error, Debug)]
pub enum GpioError {
    #[error("error while operating on a pin")]
    PinError(#[from] PinError),
    #[error("error reported by the hardware driver")]
    DriverError(#[from] DriverError),
    #[error("error while resolving board configuration")]
    BoardError(#[from] BoardError),
    #[error("error while following a lifecycle")]
    LifecycleError(#[from] LifecycleError),
    #[error("error in the edge dispatcher")]
    DispatchError(#[from] DispatchError),
    #[error("error in the foreground relay")]
    RelayError(#[from] RelayError),
}

pub type GpioResult<T> = Result<T, GpioError>;
