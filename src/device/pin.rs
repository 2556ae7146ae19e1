use super::driver::{EdgeSink, Line};
use super::error::PinError;
use super::lease::Leases;
use crate::board::PinName;
use crate::{GpioError, GpioResult};
use derive_try_from_primitive::TryFromPrimitive;
use embedded_hal::digital::v2 as eh;
use std::fmt;
use std::ops::Not;
use std::sync::Arc;
use std::time::Instant;

/// Enum representing the logical state of a given pin.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum Value {
    High = 1,
    Low = 0,
}

impl Not for Value {
    type Output = Value;

    fn not(self) -> Self::Output {
        match self {
            Value::High => Value::Low,
            Value::Low => Value::High,
        }
    }
}

impl From<bool> for Value {
    fn from(high: bool) -> Self {
        if high {
            Value::High
        } else {
            Value::Low
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// Which voltage transitions of an input pin are reported to software.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum Edge {
    None = 0,
    Rising = 1,
    Falling = 2,
    Both = 3,
}

impl Edge {
    pub fn qualifies(self, kind: EdgeKind) -> bool {
        match (self, kind) {
            (Edge::Both, _) => true,
            (Edge::Rising, EdgeKind::Rising) => true,
            (Edge::Falling, EdgeKind::Falling) => true,
            _ => false,
        }
    }
}

/// Direction of a transition that actually happened on a line.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    Rising,
    Falling,
}

impl EdgeKind {
    /// The transition that leads from `from` to `to`, if the level changed at all.
    pub fn between(from: Value, to: Value) -> Option<Self> {
        match (from, to) {
            (Value::Low, Value::High) => Some(EdgeKind::Rising),
            (Value::High, Value::Low) => Some(EdgeKind::Falling),
            _ => None,
        }
    }
}

/// One qualifying transition reported by a driver.
#[derive(Clone, Debug)]
pub struct EdgeEvent {
    pub pin: PinName,
    pub kind: EdgeKind,
    pub at: Instant,
}

/// Exclusively owned, closeable handle to one physical GPIO line.
///
/// Obtainable through `PeripheralRegistry::open` and its `open_input`/`open_output` shortcuts.
/// While the handle is open no other handle for the same pin name can be opened. Closing releases the name;
/// closing twice is a no-op. Dropping an open handle closes it.
pub struct PinHandle {
    name: PinName,
    direction: Direction,
    edge: Edge,
    value: Value,
    line: Option<Box<dyn Line>>,
    leases: Arc<Leases>,
}

impl PinHandle {
    pub(crate) fn new(
        name: PinName,
        direction: Direction,
        edge: Edge,
        value: Value,
        line: Box<dyn Line>,
        leases: Arc<Leases>,
    ) -> Self {
        Self {
            name,
            direction,
            edge,
            value,
            line: Some(line),
            leases,
        }
    }

    pub fn name(&self) -> &PinName {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn edge_trigger(&self) -> Edge {
        self.edge
    }

    pub fn is_open(&self) -> bool {
        self.line.is_some()
    }

    /// Reads the line for inputs; returns the last written logical value for outputs.
    pub fn value(&self) -> GpioResult<Value> {
        let line = self.line()?;
        match self.direction {
            Direction::Input => line.read().map_err(GpioError::DriverError),
            Direction::Output => Ok(self.value),
        }
    }

    pub fn set_value(&mut self, value: Value) -> GpioResult<()> {
        self.expect_direction(Direction::Output)?;
        self.line_mut()?
            .write(value)
            .map_err(GpioError::DriverError)?;
        self.value = value;
        Ok(())
    }

    /// Inverts the logical value of an output and returns the new value.
    pub fn toggle(&mut self) -> GpioResult<Value> {
        let next = !self.value;
        self.set_value(next)?;
        Ok(next)
    }

    pub fn set_edge_trigger(&mut self, edge: Edge) -> GpioResult<()> {
        if self.direction == Direction::Output {
            return Err(GpioError::PinError(PinError::EdgeOnOutput(self.name.clone())));
        }
        self.line_mut()?
            .set_edge(edge)
            .map_err(GpioError::DriverError)?;
        self.edge = edge;
        Ok(())
    }

    /// Releases the line and makes its name available again. A no-op on a closed handle.
    ///
    /// The name is released even when the driver fails to close the line; the driver error is still returned.
    pub fn close(&mut self) -> GpioResult<()> {
        let mut line = match self.line.take() {
            Some(line) => line,
            None => return Ok(()),
        };

        let closed = line.close();
        self.leases.release(&self.name)?;
        log::debug!("closed pin {}", self.name);

        closed.map_err(GpioError::DriverError)
    }

    pub(crate) fn watch(&mut self, sink: EdgeSink) -> GpioResult<()> {
        self.expect_direction(Direction::Input)?;
        if self.edge == Edge::None {
            log::warn!("watching pin {} without an edge trigger", self.name);
        }
        self.line_mut()?.watch(sink).map_err(GpioError::DriverError)
    }

    pub(crate) fn unwatch(&mut self) -> GpioResult<()> {
        match self.line.as_mut() {
            Some(line) => line.unwatch().map_err(GpioError::DriverError),
            None => Ok(()),
        }
    }

    fn expect_direction(&self, direction: Direction) -> GpioResult<()> {
        if self.direction == direction {
            Ok(())
        } else {
            Err(GpioError::PinError(PinError::WrongDirection(
                self.name.clone(),
                self.direction,
            )))
        }
    }

    fn line(&self) -> GpioResult<&dyn Line> {
        self.line
            .as_deref()
            .ok_or_else(|| GpioError::PinError(PinError::Closed(self.name.clone())))
    }

    fn line_mut(&mut self) -> GpioResult<&mut Box<dyn Line>> {
        let name = &self.name;
        self.line
            .as_mut()
            .ok_or_else(|| GpioError::PinError(PinError::Closed(name.clone())))
    }
}

impl fmt::Debug for PinHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinHandle")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("edge", &self.edge)
            .field("value", &self.value)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for PinHandle {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("failed to close pin {} on drop: {}", self.name, err);
        }
    }
}

impl eh::InputPin for PinHandle {
    type Error = GpioError;

    fn is_high(&self) -> Result<bool, Self::Error> {
        Ok(self.value()? == Value::High)
    }

    fn is_low(&self) -> Result<bool, Self::Error> {
        self.is_high().map(|v| !v)
    }
}

impl eh::OutputPin for PinHandle {
    type Error = GpioError;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set_value(Value::Low)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set_value(Value::High)
    }
}

impl eh::StatefulOutputPin for PinHandle {
    fn is_set_high(&self) -> Result<bool, Self::Error> {
        Ok(self.value()? == Value::High)
    }

    fn is_set_low(&self) -> Result<bool, Self::Error> {
        self.is_set_high().map(|v| !v)
    }
}

impl eh::ToggleableOutputPin for PinHandle {
    type Error = GpioError;

    fn toggle(&mut self) -> Result<(), Self::Error> {
        PinHandle::toggle(self).map(|_| ())
    }
}
