//! Seam between the pin handles and whatever actually toggles the hardware.
use super::error::DriverError;
use super::pin::{Direction, Edge, EdgeEvent, Value};
use crate::board::PinName;
use std::sync::Arc;

/// Receives qualifying edges. Called on a context owned by the driver, so it must not block.
pub type EdgeSink = Arc<dyn Fn(EdgeEvent) + Send + Sync>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LineConfig {
    pub direction: Direction,
    pub edge: Edge,
    pub initial: Value,
}

/// Register-level GPIO primitives of a board.
pub trait Driver: Send + Sync {
    fn open(&self, name: &PinName, config: &LineConfig) -> Result<Box<dyn Line>, DriverError>;
}

/// One opened hardware line.
///
/// Edge qualification is done by the driver: a sink installed with `watch` only ever sees transitions matching
/// the line's current edge trigger.
pub trait Line: Send {
    fn read(&self) -> Result<Value, DriverError>;
    fn write(&mut self, value: Value) -> Result<(), DriverError>;
    fn set_edge(&mut self, edge: Edge) -> Result<(), DriverError>;
    fn watch(&mut self, sink: EdgeSink) -> Result<(), DriverError>;
    fn unwatch(&mut self) -> Result<(), DriverError>;
    fn close(&mut self) -> Result<(), DriverError>;
}
