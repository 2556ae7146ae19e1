use super::error::PinError;
use crate::board::PinName;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

/// Process-wide set of pin names that currently have a live handle.
///
/// The whole check-and-set for a lease happens under one lock, including the driver call that opens the line,
/// so two threads racing for one name can never both reach the hardware.
#[derive(Debug)]
pub struct Leases {
    open_pins: Mutex<HashSet<PinName>>,
}

impl Leases {
    pub fn new() -> Self {
        Self {
            open_pins: Mutex::new(HashSet::with_capacity(40)),
        }
    }

    /// Leases `name` and runs `open` while still holding the lock. Nothing is leased if `open` fails.
    pub fn acquire<T, E, F>(&self, name: &PinName, open: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<PinError>,
    {
        let mut leases = self.lock()?;

        if leases.contains(name) {
            return Err(PinError::AlreadyOpen(name.clone()).into());
        }

        let opened = open()?;
        leases.insert(name.clone());
        Ok(opened)
    }

    pub fn release(&self, name: &PinName) -> Result<(), PinError> {
        let mut leases = self.lock()?;
        if !leases.remove(name) {
            log::warn!("released pin {} which was not leased", name);
        }
        Ok(())
    }

    pub fn contains(&self, name: &PinName) -> Result<bool, PinError> {
        Ok(self.lock()?.contains(name))
    }

    pub fn len(&self) -> Result<usize, PinError> {
        Ok(self.lock()?.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashSet<PinName>>, PinError> {
        self.open_pins.lock().map_err(|_| PinError::LeaseMapPoisoned)
    }
}
