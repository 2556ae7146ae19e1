use crate::board::PinName;
use crate::{GpioError, GpioResult};
use std::sync::Arc;

pub mod driver;
pub mod error;
mod lease;
mod pin;
pub mod sim;
pub mod sysfs;

use driver::{Driver, LineConfig};
use error::PinError;
use lease::Leases;

pub use pin::{Direction, Edge, EdgeEvent, EdgeKind, PinHandle, Value};

/// Resolves pin names to exclusively owned `PinHandle`s.
///
/// Build one at startup and clone it into whatever needs to open pins - clones share the driver and the set of
/// open pin names. At most one open handle exists per pin name at any moment; a second `open` fails with
/// `PinError::AlreadyOpen` until the first handle is closed or dropped.
#[derive(Clone)]
pub struct PeripheralRegistry {
    driver: Arc<dyn Driver>,
    leases: Arc<Leases>,
}

impl PeripheralRegistry {
    pub fn new<D: Driver + 'static>(driver: D) -> Self {
        Self::with_driver(Arc::new(driver))
    }

    pub fn with_driver(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            leases: Arc::new(Leases::new()),
        }
    }

    /// Opens a line in the given direction.
    ///
    /// `edge` is only meaningful for inputs; passing one for an output fails with `PinError::EdgeOnOutput`.
    /// Outputs opened this way start low. Driver failures are returned unchanged.
    pub fn open<N: Into<PinName>>(
        &self,
        name: N,
        direction: Direction,
        edge: Option<Edge>,
    ) -> GpioResult<PinHandle> {
        let name = name.into();

        if direction == Direction::Output && edge.map_or(false, |e| e != Edge::None) {
            return Err(PinError::EdgeOnOutput(name).into());
        }

        self.open_with(
            name,
            LineConfig {
                direction,
                edge: edge.unwrap_or(Edge::None),
                initial: Value::Low,
            },
        )
    }

    pub fn open_input<N: Into<PinName>>(&self, name: N, edge: Edge) -> GpioResult<PinHandle> {
        self.open(name, Direction::Input, Some(edge))
    }

    pub fn open_output<N: Into<PinName>>(&self, name: N, initial: Value) -> GpioResult<PinHandle> {
        self.open_with(
            name.into(),
            LineConfig {
                direction: Direction::Output,
                edge: Edge::None,
                initial,
            },
        )
    }

    /// Same as `handle.close()`.
    pub fn close(&self, handle: &mut PinHandle) -> GpioResult<()> {
        handle.close()
    }

    pub fn is_open(&self, name: &PinName) -> GpioResult<bool> {
        Ok(self.leases.contains(name)?)
    }

    pub fn open_count(&self) -> GpioResult<usize> {
        Ok(self.leases.len()?)
    }

    fn open_with(&self, name: PinName, config: LineConfig) -> GpioResult<PinHandle> {
        let line = self
            .leases
            .acquire(&name, || {
                self.driver
                    .open(&name, &config)
                    .map_err(GpioError::DriverError)
            })?;
        log::debug!("opened pin {} as {:?}", name, config);

        Ok(PinHandle::new(
            name,
            config.direction,
            config.edge,
            config.initial,
            line,
            Arc::clone(&self.leases),
        ))
    }
}
