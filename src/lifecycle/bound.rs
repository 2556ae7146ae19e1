use super::{
    Lifecycle, LifecycleError, LifecycleObserver, LifecycleState, Retain, SubscriptionId, Transition,
};
use crate::board::PinName;
use crate::device::error::PinError;
use crate::device::PinHandle;
use crate::GpioResult;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

type Reopen = Box<dyn FnMut(&PinName) -> GpioResult<PinHandle> + Send>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BindingState {
    NotYetBound,
    BoundOpen,
    BoundClosed,
    UnboundTerminal,
}

struct Binding {
    state: BindingState,
    name: PinName,
    handle: Option<PinHandle>,
    reopen: Reopen,
    reopens: usize,
}

impl Binding {
    fn close_handle(&mut self) -> GpioResult<()> {
        match self.handle.take() {
            Some(mut handle) => handle.close(),
            None => Ok(()),
        }
    }
}

/// A pin whose open/close cycle follows a `Lifecycle`.
///
/// The handle given to `new` is already open and is used as-is for the first activation. Every later activation
/// gets a fresh handle from the reopen factory, since the line may have been reconfigured while the lifecycle was
/// inactive. Deactivation closes the current handle; destruction closes it for good and unsubscribes.
///
/// Clones share the same binding.
#[derive(Clone)]
pub struct LifecycleBound {
    binding: Arc<Mutex<Binding>>,
}

impl LifecycleBound {
    pub fn new<F>(initial: PinHandle, reopen: F) -> Self
    where
        F: FnMut(&PinName) -> GpioResult<PinHandle> + Send + 'static,
    {
        Self {
            binding: Arc::new(Mutex::new(Binding {
                state: BindingState::NotYetBound,
                name: initial.name().clone(),
                handle: Some(initial),
                reopen: Box::new(reopen),
                reopens: 0,
            })),
        }
    }

    /// Subscribes to `lifecycle`, taking over the initial handle without reopening it.
    ///
    /// Binding to a destroyed lifecycle fails; the initial handle is then closed and the binding stays
    /// `NotYetBound`. Binding to an inactive lifecycle closes the handle until the next activation.
    pub fn bind(&self, lifecycle: &mut Lifecycle) -> GpioResult<SubscriptionId> {
        let mut binding = self.lock()?;

        if binding.state != BindingState::NotYetBound {
            return Err(LifecycleError::AlreadyBound(binding.name.clone()).into());
        }
        if !binding.handle.as_ref().map_or(false, PinHandle::is_open) {
            return Err(PinError::Closed(binding.name.clone()).into());
        }

        match lifecycle.state() {
            LifecycleState::Destroyed => {
                if let Err(err) = binding.close_handle() {
                    log::error!("failed to close {} after refused bind: {}", binding.name, err);
                }
                return Err(LifecycleError::Destroyed.into());
            }
            LifecycleState::Inactive => {
                binding.close_handle()?;
                binding.state = BindingState::BoundClosed;
            }
            LifecycleState::Created | LifecycleState::Active => {
                binding.state = BindingState::BoundOpen;
            }
        }
        log::debug!("{} bound as {:?}", binding.name, binding.state);
        drop(binding);

        Ok(lifecycle.subscribe(self.clone()))
    }

    pub fn state(&self) -> BindingState {
        self.lock().map_or(BindingState::UnboundTerminal, |b| b.state)
    }

    pub fn name(&self) -> GpioResult<PinName> {
        Ok(self.lock()?.name.clone())
    }

    /// Number of times the reopen factory produced a handle.
    pub fn reopen_count(&self) -> usize {
        self.lock().map_or(0, |b| b.reopens)
    }

    /// Runs `f` with the currently open handle. Fails with `PinError::Closed` while the pin is released.
    pub fn with_handle<R, F>(&self, f: F) -> GpioResult<R>
    where
        F: FnOnce(&mut PinHandle) -> R,
    {
        let mut binding = self.lock()?;
        let name = binding.name.clone();
        binding
            .handle
            .as_mut()
            .filter(|handle| handle.is_open())
            .map(f)
            .ok_or_else(|| PinError::Closed(name).into())
    }

    fn lock(&self) -> GpioResult<MutexGuard<'_, Binding>> {
        self.binding.lock().map_err(|poisoned| {
            LifecycleError::Poisoned(poisoned.get_ref().name.clone()).into()
        })
    }
}

impl LifecycleObserver for LifecycleBound {
    fn on_transition(&mut self, transition: Transition) -> GpioResult<Retain> {
        use BindingState::*;

        let mut binding = self.lock()?;

        match (binding.state, transition.to) {
            (UnboundTerminal, _) => Ok(Retain::Drop),
            (NotYetBound, _) => Ok(Retain::Keep),
            (_, LifecycleState::Destroyed) => {
                binding.state = UnboundTerminal;
                log::debug!("{} released for good", binding.name);
                binding.close_handle()?;
                Ok(Retain::Drop)
            }
            (BoundOpen, LifecycleState::Inactive) => {
                binding.state = BoundClosed;
                binding.close_handle()?;
                Ok(Retain::Keep)
            }
            (BoundClosed, LifecycleState::Active) => {
                let name = binding.name.clone();
                let handle = (binding.reopen)(&name).map_err(|err| {
                    log::warn!("failed to reopen {}: {}", name, err);
                    err
                })?;
                binding.handle = Some(handle);
                binding.state = BoundOpen;
                binding.reopens += 1;
                log::debug!("{} reopened", name);
                Ok(Retain::Keep)
            }
            // The first activation keeps the handle the binding was created with.
            _ => Ok(Retain::Keep),
        }
    }
}

impl fmt::Debug for LifecycleBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.binding.try_lock() {
            Ok(binding) => f
                .debug_struct("LifecycleBound")
                .field("name", &binding.name)
                .field("state", &binding.state)
                .field("handle", &binding.handle)
                .finish(),
            Err(_) => f.write_str("LifecycleBound { <busy> }"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{PeripheralRegistry, Value};
    use crate::SimulatedDriver;

    fn led(sim: &SimulatedDriver) -> (PeripheralRegistry, LifecycleBound, PinName) {
        let registry = PeripheralRegistry::new(sim.clone());
        let name = PinName::from("BCM6");
        let initial = registry.open_output(name.clone(), Value::Low).unwrap();
        let reopen = {
            let registry = registry.clone();
            move |name: &PinName| registry.open_output(name.clone(), Value::Low)
        };
        (registry, LifecycleBound::new(initial, reopen), name)
    }

    #[test]
    fn reopens_only_after_a_stop() {
        let sim = SimulatedDriver::new();
        let (_registry, bound, name) = led(&sim);
        let mut lifecycle = Lifecycle::new();

        bound.bind(&mut lifecycle).unwrap();
        assert_eq!(bound.state(), BindingState::BoundOpen);

        lifecycle.start().unwrap();
        assert_eq!(bound.reopen_count(), 0);
        assert_eq!(sim.opens(&name), 1);

        lifecycle.stop().unwrap();
        assert_eq!(bound.state(), BindingState::BoundClosed);
        assert!(!sim.is_open(&name));
        assert!(bound.with_handle(|_| ()).is_err());

        lifecycle.start().unwrap();
        assert_eq!(bound.reopen_count(), 1);
        assert_eq!(sim.opens(&name), 2);
        bound.with_handle(|h| h.set_value(Value::High)).unwrap().unwrap();
        assert_eq!(sim.level(&name), Some(Value::High));
    }

    #[test]
    fn destroy_closes_once_and_ignores_late_notifications() {
        let sim = SimulatedDriver::new();
        let (registry, bound, name) = led(&sim);
        let mut lifecycle = Lifecycle::new();

        bound.bind(&mut lifecycle).unwrap();
        lifecycle.start().unwrap();
        lifecycle.destroy().unwrap();

        assert_eq!(bound.state(), BindingState::UnboundTerminal);
        assert_eq!(sim.closes(&name), 1);
        assert_eq!(lifecycle.observer_count(), 0);

        let mut spurious = bound.clone();
        let active = Transition {
            from: LifecycleState::Inactive,
            to: LifecycleState::Active,
        };
        assert_eq!(spurious.on_transition(active).unwrap(), Retain::Drop);
        assert_eq!(bound.reopen_count(), 0);
        assert_eq!(sim.opens(&name), 1);
        assert!(!registry.is_open(&name).unwrap());
    }

    #[test]
    fn bind_to_destroyed_lifecycle_stays_unbound() {
        let sim = SimulatedDriver::new();
        let (registry, bound, name) = led(&sim);
        let mut lifecycle = Lifecycle::new();
        lifecycle.destroy().unwrap();

        assert!(matches!(
            bound.bind(&mut lifecycle),
            Err(crate::GpioError::LifecycleError(LifecycleError::Destroyed))
        ));
        assert_eq!(bound.state(), BindingState::NotYetBound);
        assert!(!registry.is_open(&name).unwrap());
        assert_eq!(lifecycle.observer_count(), 0);
    }

    #[test]
    fn second_bind_is_rejected() {
        let sim = SimulatedDriver::new();
        let (_registry, bound, _name) = led(&sim);
        let mut lifecycle = Lifecycle::new();

        bound.bind(&mut lifecycle).unwrap();
        assert!(matches!(
            bound.bind(&mut lifecycle),
            Err(crate::GpioError::LifecycleError(LifecycleError::AlreadyBound(_)))
        ));
        assert_eq!(lifecycle.observer_count(), 1);
    }

    #[test]
    fn failed_reopen_keeps_the_pin_released() {
        let sim = SimulatedDriver::new();
        let (_registry, bound, name) = led(&sim);
        let mut lifecycle = Lifecycle::new();
        bound.bind(&mut lifecycle).unwrap();
        lifecycle.start().unwrap();
        lifecycle.stop().unwrap();

        sim.fail_next_open(&name, "pin muxed away");
        assert!(matches!(
            lifecycle.start(),
            Err(crate::GpioError::DriverError(crate::DriverError::Rejected(..)))
        ));
        assert_eq!(bound.state(), BindingState::BoundClosed);

        lifecycle.stop().unwrap();
        lifecycle.start().unwrap();
        assert_eq!(bound.state(), BindingState::BoundOpen);
        assert_eq!(bound.reopen_count(), 1);
    }
}
