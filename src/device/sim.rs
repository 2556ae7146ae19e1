//! In-memory board used when no GPIO hardware is around.
//!
//! `SimulatedDriver` behaves like a driver with hardware edge detection: inputs are moved with `drive`, and a
//! watched input reports every transition matching its edge trigger. Outputs can be observed with `level`.
//! Clones share the same board.
use super::driver::{Driver, EdgeSink, Line, LineConfig};
use super::error::DriverError;
use super::pin::{Direction, Edge, EdgeEvent, EdgeKind, Value};
use crate::board::PinName;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

#[derive(Clone, Default)]
pub struct SimulatedDriver {
    board: Arc<Mutex<Board>>,
}

#[derive(Default)]
struct Board {
    known: Option<HashSet<PinName>>,
    pins: HashMap<PinName, SimPin>,
    next_line: u64,
}

struct SimPin {
    level: Value,
    line: Option<u64>,
    direction: Direction,
    edge: Edge,
    sink: Option<EdgeSink>,
    opens: usize,
    closes: usize,
    writes: usize,
    fail_next_open: Option<String>,
}

impl SimPin {
    fn new() -> Self {
        Self {
            level: Value::Low,
            line: None,
            direction: Direction::Input,
            edge: Edge::None,
            sink: None,
            opens: 0,
            closes: 0,
            writes: 0,
            fail_next_open: None,
        }
    }
}

impl Board {
    fn pin(&mut self, name: &PinName) -> Result<&mut SimPin, DriverError> {
        if let Some(known) = &self.known {
            if !known.contains(name) {
                return Err(DriverError::UnknownPin(name.clone()));
            }
        }
        Ok(self.pins.entry(name.clone()).or_insert_with(SimPin::new))
    }

    fn line(&mut self, name: &PinName, line: u64) -> Result<&mut SimPin, DriverError> {
        match self.pins.get_mut(name) {
            Some(pin) if pin.line == Some(line) => Ok(pin),
            _ => Err(DriverError::Rejected(name.clone(), "line is not open".to_owned())),
        }
    }
}

impl SimulatedDriver {
    /// A board accepting any pin name.
    pub fn new() -> Self {
        Self::default()
    }

    /// A board that only knows the given pin names; opening anything else fails with `DriverError::UnknownPin`.
    pub fn with_pins(names: &[&str]) -> Self {
        let driver = Self::default();
        if let Ok(mut board) = driver.board.lock() {
            board.known = Some(names.iter().map(|&n| PinName::from(n)).collect());
        }
        driver
    }

    /// Sets the level of a pin without reporting an edge, e.g. a pulled-up button before anything watches it.
    pub fn preset(&self, name: &PinName, level: Value) {
        if let Ok(pin) = self.board().pin(name) {
            pin.level = level;
        }
    }

    /// Moves the level of an input, reporting the transition if a watcher's edge trigger matches it.
    pub fn drive(&self, name: &PinName, level: Value) {
        let fired = {
            let mut board = self.board();
            let pin = match board.pin(name) {
                Ok(pin) => pin,
                Err(_) => return,
            };
            let previous = pin.level;
            pin.level = level;

            match (EdgeKind::between(previous, level), &pin.sink) {
                (Some(kind), Some(sink))
                    if pin.line.is_some()
                        && pin.direction == Direction::Input
                        && pin.edge.qualifies(kind) =>
                {
                    Some((Arc::clone(sink), kind))
                }
                _ => None,
            }
        };

        // Sinks run outside the board lock so they may touch the board themselves.
        if let Some((sink, kind)) = fired {
            sink(EdgeEvent {
                pin: name.clone(),
                kind,
                at: Instant::now(),
            });
        }
    }

    /// Falling edge on an active-low button.
    pub fn press(&self, name: &PinName) {
        self.drive(name, Value::Low);
    }

    pub fn release(&self, name: &PinName) {
        self.drive(name, Value::High);
    }

    pub fn level(&self, name: &PinName) -> Option<Value> {
        self.board().pins.get(name).map(|pin| pin.level)
    }

    pub fn is_open(&self, name: &PinName) -> bool {
        self.board()
            .pins
            .get(name)
            .map_or(false, |pin| pin.line.is_some())
    }

    pub fn is_watched(&self, name: &PinName) -> bool {
        self.board()
            .pins
            .get(name)
            .map_or(false, |pin| pin.sink.is_some())
    }

    pub fn opens(&self, name: &PinName) -> usize {
        self.board().pins.get(name).map_or(0, |pin| pin.opens)
    }

    pub fn closes(&self, name: &PinName) -> usize {
        self.board().pins.get(name).map_or(0, |pin| pin.closes)
    }

    /// Writes to an output since the board was created, across all handles.
    pub fn writes(&self, name: &PinName) -> usize {
        self.board().pins.get(name).map_or(0, |pin| pin.writes)
    }

    /// Makes the next `open` of `name` fail with `DriverError::Rejected`.
    pub fn fail_next_open(&self, name: &PinName, reason: &str) {
        if let Ok(pin) = self.board().pin(name) {
            pin.fail_next_open = Some(reason.to_owned());
        }
    }

    fn board(&self) -> MutexGuard<'_, Board> {
        // A panicking test thread must not hide the board state from the others.
        self.board.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Driver for SimulatedDriver {
    fn open(&self, name: &PinName, config: &LineConfig) -> Result<Box<dyn Line>, DriverError> {
        let mut board = self.board();
        let line = board.next_line;
        let pin = board.pin(name)?;

        if let Some(reason) = pin.fail_next_open.take() {
            return Err(DriverError::Rejected(name.clone(), reason));
        }
        if pin.line.is_some() {
            return Err(DriverError::Rejected(name.clone(), "line busy".to_owned()));
        }

        pin.line = Some(line);
        pin.direction = config.direction;
        pin.edge = config.edge;
        pin.sink = None;
        pin.opens += 1;
        if config.direction == Direction::Output {
            pin.level = config.initial;
        }
        board.next_line += 1;

        Ok(Box::new(SimLine {
            name: name.clone(),
            line,
            board: Arc::clone(&self.board),
        }))
    }
}

struct SimLine {
    name: PinName,
    line: u64,
    board: Arc<Mutex<Board>>,
}

impl SimLine {
    fn with_pin<T, F>(&self, f: F) -> Result<T, DriverError>
    where
        F: FnOnce(&mut SimPin) -> T,
    {
        let mut board = self
            .board
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        board.line(&self.name, self.line).map(f)
    }
}

impl Line for SimLine {
    fn read(&self) -> Result<Value, DriverError> {
        self.with_pin(|pin| pin.level)
    }

    fn write(&mut self, value: Value) -> Result<(), DriverError> {
        self.with_pin(|pin| {
            pin.level = value;
            pin.writes += 1;
        })
    }

    fn set_edge(&mut self, edge: Edge) -> Result<(), DriverError> {
        self.with_pin(|pin| pin.edge = edge)
    }

    fn watch(&mut self, sink: EdgeSink) -> Result<(), DriverError> {
        self.with_pin(|pin| pin.sink = Some(sink))
    }

    fn unwatch(&mut self) -> Result<(), DriverError> {
        self.with_pin(|pin| pin.sink = None)
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.with_pin(|pin| {
            pin.line = None;
            pin.sink = None;
            pin.closes += 1;
        })
    }
}
