//! Explicit lifecycle state machine and the observers following it.
//!
//! ```text
//! Created --start--> Active --stop--> Inactive --start--> Active ...
//!    any state --destroy--> Destroyed (terminal)
//! ```
//!
//! Observers are notified synchronously, on the thread driving the lifecycle, with the typed `Transition` that
//! just happened.
use crate::board::PinName;
use crate::GpioResult;
use thiserror::Error;

mod bound;

pub use bound::{BindingState, LifecycleBound};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Created,
    Active,
    Inactive,
    Destroyed,
}

impl LifecycleState {
    fn can_move_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;

        match (self, to) {
            (Created, Active) | (Active, Inactive) | (Inactive, Active) => true,
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            _ => false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// What an observer wants after handling a transition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Retain {
    Keep,
    Drop,
}

pub trait LifecycleObserver: Send {
    fn on_transition(&mut self, transition: Transition) -> GpioResult<Retain>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("cannot move lifecycle from {from:?} to {to:?}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
    #[error("{0} is already bound to a lifecycle")]
    AlreadyBound(PinName),
    #[error("lifecycle is already destroyed")]
    Destroyed,
    #[error("binding of {0} poisoned")]
    Poisoned(PinName),
}

pub struct Lifecycle {
    state: LifecycleState,
    observers: Vec<(SubscriptionId, Box<dyn LifecycleObserver>)>,
    next_id: u64,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Created,
            observers: Vec::new(),
            next_id: 0,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn subscribe<O: LifecycleObserver + 'static>(&mut self, observer: O) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(sub, _)| *sub != id);
        self.observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn start(&mut self) -> GpioResult<()> {
        self.move_to(LifecycleState::Active)
    }

    pub fn stop(&mut self) -> GpioResult<()> {
        self.move_to(LifecycleState::Inactive)
    }

    pub fn destroy(&mut self) -> GpioResult<()> {
        self.move_to(LifecycleState::Destroyed)
    }

    /// Changes state and notifies every observer, in subscription order.
    ///
    /// The state changes even when observers fail; failures are logged and the first one is returned.
    fn move_to(&mut self, to: LifecycleState) -> GpioResult<()> {
        let from = self.state;
        if !from.can_move_to(to) {
            return Err(LifecycleError::InvalidTransition { from, to }.into());
        }
        self.state = to;
        log::debug!("lifecycle {:?} -> {:?}", from, to);

        let transition = Transition { from, to };
        let mut first_error = None;
        let observers = std::mem::take(&mut self.observers);

        for (id, mut observer) in observers {
            match observer.on_transition(transition) {
                Ok(Retain::Keep) => self.observers.push((id, observer)),
                Ok(Retain::Drop) => {}
                Err(err) => {
                    log::error!("observer failed on {:?} -> {:?}: {}", from, to, err);
                    first_error.get_or_insert(err);
                    self.observers.push((id, observer));
                }
            }
        }

        if to == LifecycleState::Destroyed {
            self.observers.clear();
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
