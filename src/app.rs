//! Button-controlled LED, wired together from the pieces of this crate.
//!
//! Pressing the button (falling edge) queues a job on the `ButtonThread` worker. The job simulates slow work and then
//! posts to the foreground, which toggles the LED a few times at a fixed interval and records the completion.
//! Both pins follow the lifecycle: released on stop, reopened on start, closed for good on destroy.
use crate::board::{BoardDefaults, PinName};
use crate::device::{Edge, EdgeEvent, PeripheralRegistry, PinHandle, Value};
use crate::dispatch::{ContinueListening, EdgeDispatcher};
use crate::lifecycle::{Lifecycle, LifecycleBound, LifecycleError, LifecycleState};
use crate::relay::{Foreground, ForegroundOnly, ResultRelay};
use crate::GpioResult;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Copy, Clone, Debug)]
pub struct ButtonLedConfig {
    /// How long the worker pretends to be busy per press.
    pub work: Duration,
    pub toggles: usize,
    pub toggle_interval: Duration,
    pub quiesce_timeout: Duration,
}

impl Default for ButtonLedConfig {
    fn default() -> Self {
        Self {
            work: Duration::from_secs(3),
            toggles: 6,
            toggle_interval: Duration::from_secs(1),
            quiesce_timeout: EdgeDispatcher::DEFAULT_QUIESCE_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub message: &'static str,
    pub at: Instant,
}

pub struct ButtonLed {
    led: LifecycleBound,
    button: LifecycleBound,
    dispatcher: EdgeDispatcher,
    completions: Arc<ForegroundOnly<Vec<Completion>>>,
    presses: Arc<AtomicUsize>,
}

impl ButtonLed {
    pub const WORKER_NAME: &'static str = "ButtonThread";
    pub const DONE: &'static str = "All done!";

    /// Opens and binds both pins and starts the worker. Call on the foreground thread.
    ///
    /// On failure nothing is left behind: both pins are closed again, nothing stays subscribed to `lifecycle` and
    /// the worker is stopped.
    pub fn start(
        registry: &PeripheralRegistry,
        board: &BoardDefaults,
        lifecycle: &mut Lifecycle,
        foreground: &Foreground,
        config: ButtonLedConfig,
    ) -> GpioResult<Self> {
        if lifecycle.state() == LifecycleState::Destroyed {
            return Err(LifecycleError::Destroyed.into());
        }
        let dispatcher = EdgeDispatcher::spawn_with_timeout(Self::WORKER_NAME, config.quiesce_timeout)?;

        let led = {
            let initial = registry.open_output(board.led.clone(), Value::Low)?;
            let registry = registry.clone();
            LifecycleBound::new(initial, move |name: &PinName| {
                registry.open_output(name.clone(), Value::Low)
            })
        };

        let completions = Arc::new(ForegroundOnly::new(foreground, Vec::new()));
        let presses = Arc::new(AtomicUsize::new(0));

        let open_button = {
            let registry = registry.clone();
            let dispatcher = dispatcher.clone();
            let press = Press {
                led: Arc::new(ForegroundOnly::new(foreground, led.clone())),
                relay: foreground.relay(),
                completions: Arc::clone(&completions),
                presses: Arc::clone(&presses),
                config,
            };
            move |name: &PinName| -> GpioResult<PinHandle> {
                let mut button = registry.open_input(name.clone(), Edge::Falling)?;
                let press = press.clone();
                dispatcher.register_callback(&mut button, move |event| press.handle(event))?;
                Ok(button)
            }
        };
        let initial = open_button(&board.button)?;
        let button = LifecycleBound::new(initial, open_button);

        // Dropping the unbound pins closes them; the worker stops with its last handle.
        let led_subscription = led.bind(lifecycle)?;
        if let Err(err) = button.bind(lifecycle) {
            lifecycle.unsubscribe(led_subscription);
            return Err(err);
        }
        dispatcher.bind_lifecycle(lifecycle);

        Ok(Self {
            led,
            button,
            dispatcher,
            completions,
            presses,
        })
    }

    pub fn led(&self) -> &LifecycleBound {
        &self.led
    }

    pub fn button(&self) -> &LifecycleBound {
        &self.button
    }

    pub fn dispatcher(&self) -> &EdgeDispatcher {
        &self.dispatcher
    }

    /// Presses picked up by the worker so far.
    pub fn presses(&self) -> usize {
        self.presses.load(Ordering::SeqCst)
    }

    /// Completions recorded on the foreground. Only callable there.
    pub fn completions(&self) -> GpioResult<Vec<Completion>> {
        Ok(self.completions.with(|done| done.clone())?)
    }
}

#[derive(Clone)]
struct Press {
    led: Arc<ForegroundOnly<LifecycleBound>>,
    relay: ResultRelay,
    completions: Arc<ForegroundOnly<Vec<Completion>>>,
    presses: Arc<AtomicUsize>,
    config: ButtonLedConfig,
}

impl Press {
    // Runs on the worker: blocking here only delays later presses.
    fn handle(&self, event: &EdgeEvent) -> ContinueListening {
        self.presses.fetch_add(1, Ordering::SeqCst);
        log::debug!("{} pressed, {:?} after the edge", event.pin, event.at.elapsed());

        thread::sleep(self.config.work);
        log::info!("Job's done! {:?} after the press", event.at.elapsed());

        let blink = Blink {
            led: Arc::clone(&self.led),
            relay: self.relay.clone(),
            completions: Arc::clone(&self.completions),
            remaining: self.config.toggles,
            interval: self.config.toggle_interval,
        };
        if let Err(err) = self.relay.post(move || blink.step()) {
            log::error!("cannot report press to the foreground: {}", err);
        }
        true
    }
}

struct Blink {
    led: Arc<ForegroundOnly<LifecycleBound>>,
    relay: ResultRelay,
    completions: Arc<ForegroundOnly<Vec<Completion>>>,
    remaining: usize,
    interval: Duration,
}

impl Blink {
    // Runs on the foreground, once per toggle.
    fn step(mut self) {
        if self.remaining == 0 {
            let recorded = self.completions.with(|done| {
                done.push(Completion {
                    message: ButtonLed::DONE,
                    at: Instant::now(),
                })
            });
            if let Err(err) = recorded {
                log::error!("cannot record completion: {}", err);
            }
            return;
        }

        match self.led.with(|led| led.with_handle(PinHandle::toggle)) {
            Ok(Ok(Ok(value))) => log::trace!("LED now {:?}", value),
            Ok(Ok(Err(err))) | Ok(Err(err)) => log::warn!("LED toggle skipped: {}", err),
            Err(err) => {
                log::error!("LED toggled off the foreground: {}", err);
                return;
            }
        }

        self.remaining -= 1;
        let relay = self.relay.clone();
        let interval = self.interval;
        if let Err(err) = relay.post_delayed(interval, move || self.step()) {
            log::error!("foreground went away mid-blink: {}", err);
        }
    }
}
