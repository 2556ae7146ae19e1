//! Background worker that serializes all edge-triggered work for one device.
//!
//! Every `EdgeDispatcher` owns exactly one named thread. Qualifying edges of watched pins and tasks handed to `post`
//! become jobs on that thread's queue and run one after the other in arrival order. A long job delays every job
//! queued behind it; nothing is run in parallel to catch up.
use crate::board::PinName;
use crate::device::driver::EdgeSink;
use crate::device::{EdgeEvent, PinHandle};
use crate::lifecycle::{Lifecycle, LifecycleObserver, LifecycleState, Retain, SubscriptionId, Transition};
use crate::GpioResult;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Returned by edge callbacks: `true` keeps the registration, `false` removes it after this call.
pub type ContinueListening = bool;

type Callback = Box<dyn FnMut(&EdgeEvent) -> ContinueListening + Send>;
type Task = Box<dyn FnOnce() + Send>;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("dispatcher {0} no longer accepts work")]
    ShutDown(String),
    #[error("worker {worker} did not quiesce within {timeout:?}")]
    QuiesceTimeout { worker: String, timeout: Duration },
    #[error("failed to start worker {0}")]
    Spawn(String, #[source] io::Error),
    #[error("dispatcher {0} lock poisoned")]
    Poisoned(String),
}

struct RegistrationState {
    pin: PinName,
    active: AtomicBool,
    callback: Mutex<Callback>,
}

/// Handle to an edge callback registered with `EdgeDispatcher::register_callback`.
#[derive(Clone)]
pub struct Registration {
    state: Arc<RegistrationState>,
}

impl Registration {
    /// False once the callback returned `false` or was unregistered.
    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Stops the callback from running again, including for edges already queued, and stops watching `handle`.
    pub fn unregister(&self, handle: &mut PinHandle) -> GpioResult<()> {
        self.state.active.store(false, Ordering::SeqCst);
        handle.unwatch()
    }
}

/// One unit of background work.
struct PendingJob {
    triggered_at: Instant,
    payload: Payload,
}

enum Payload {
    Edge(Arc<RegistrationState>, EdgeEvent),
    Task(Task),
}

enum Message {
    Job(PendingJob),
    Quit,
}

struct Worker {
    thread: JoinHandle<()>,
    id: ThreadId,
    done: Receiver<()>,
}

struct Shared {
    name: String,
    tx: Mutex<Sender<Message>>,
    accepting: AtomicBool,
    worker: Mutex<Option<Worker>>,
    quiesce_timeout: Duration,
}

impl Shared {
    // `accepting` only changes under the `tx` lock, so nothing can be queued behind `Quit`.
    fn enqueue(&self, triggered_at: Instant, payload: Payload) -> Result<(), DispatchError> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| DispatchError::Poisoned(self.name.clone()))?;
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(DispatchError::ShutDown(self.name.clone()));
        }

        tx.send(Message::Job(PendingJob {
            triggered_at,
            payload,
        }))
        .map_err(|_| DispatchError::ShutDown(self.name.clone()))
    }

    fn shutdown(&self, timeout: Duration) -> Result<(), DispatchError> {
        let worker = {
            let tx = self.tx.lock();
            self.accepting.store(false, Ordering::SeqCst);

            let worker = match self.worker.lock() {
                Ok(mut worker) => worker.take(),
                Err(_) => return Err(DispatchError::Poisoned(self.name.clone())),
            };
            match (worker, tx) {
                (Some(worker), Ok(tx)) => {
                    // The worker may already be gone; then there is nothing left to quit.
                    let _ = tx.send(Message::Quit);
                    worker
                }
                (Some(_), Err(_)) => return Err(DispatchError::Poisoned(self.name.clone())),
                (None, _) => return Ok(()),
            }
        };

        if worker.id == thread::current().id() {
            log::debug!("worker {} asked to stop from its own job", self.name);
            return Ok(());
        }

        match worker.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.thread.join().is_err() {
                    log::error!("worker {} panicked", self.name);
                }
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                let err = DispatchError::QuiesceTimeout {
                    worker: self.name.clone(),
                    timeout,
                };
                log::warn!("{}, abandoning it", err);
                Err(err)
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Timeouts are already logged by `shutdown`.
        let _ = self.shutdown(self.quiesce_timeout);
    }
}

/// A dedicated worker thread for one device. Clones share the worker.
#[derive(Clone)]
pub struct EdgeDispatcher {
    shared: Arc<Shared>,
}

impl EdgeDispatcher {
    pub const DEFAULT_QUIESCE_TIMEOUT: Duration = Duration::from_secs(1);

    pub fn spawn(name: &str) -> GpioResult<Self> {
        Self::spawn_with_timeout(name, Self::DEFAULT_QUIESCE_TIMEOUT)
    }

    /// Starts the worker. `quiesce_timeout` bounds the wait when the dispatcher is torn down implicitly.
    pub fn spawn_with_timeout(name: &str, quiesce_timeout: Duration) -> GpioResult<Self> {
        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let worker_name = name.to_owned();

        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run_worker(&worker_name, rx, done_tx))
            .map_err(|err| DispatchError::Spawn(name.to_owned(), err))?;
        let id = thread.thread().id();

        Ok(Self {
            shared: Arc::new(Shared {
                name: name.to_owned(),
                tx: Mutex::new(tx),
                accepting: AtomicBool::new(true),
                worker: Mutex::new(Some(Worker {
                    thread,
                    id,
                    done: done_rx,
                })),
                quiesce_timeout,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    /// Runs `on_edge` on the worker for every qualifying edge of `handle`.
    ///
    /// The callback never runs on the caller's thread. Once it returns `false` it is removed and will not run
    /// again, even for edges that were already queued.
    pub fn register_callback<F>(&self, handle: &mut PinHandle, on_edge: F) -> GpioResult<Registration>
    where
        F: FnMut(&EdgeEvent) -> ContinueListening + Send + 'static,
    {
        if !self.is_accepting() {
            return Err(DispatchError::ShutDown(self.shared.name.clone()).into());
        }

        let state = Arc::new(RegistrationState {
            pin: handle.name().clone(),
            active: AtomicBool::new(true),
            callback: Mutex::new(Box::new(on_edge) as Callback),
        });

        let sink: EdgeSink = {
            let shared = Arc::downgrade(&self.shared);
            let state = Arc::clone(&state);
            Arc::new(move |event: EdgeEvent| {
                if !state.active.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(shared) = shared.upgrade() {
                    let at = event.at;
                    if let Err(err) = shared.enqueue(at, Payload::Edge(Arc::clone(&state), event)) {
                        log::debug!("dropping edge of {}: {}", state.pin, err);
                    }
                }
            })
        };
        handle.watch(sink)?;
        log::debug!("edge callback registered for {} on {}", handle.name(), self.shared.name);

        Ok(Registration { state })
    }

    /// Queues arbitrary work behind everything already queued.
    pub fn post<F>(&self, task: F) -> GpioResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        Ok(self.shared.enqueue(Instant::now(), Payload::Task(Box::new(task)))?)
    }

    /// Stops accepting work, lets the worker drain what is queued and waits for it up to `timeout`.
    ///
    /// A worker still busy after `timeout` is abandoned; the returned `QuiesceTimeout` is informational and has
    /// already been logged. Calling this again is a no-op.
    pub fn shutdown(&self, timeout: Duration) -> Result<(), DispatchError> {
        self.shared.shutdown(timeout)
    }

    /// Shuts the dispatcher down when `lifecycle` is destroyed.
    pub fn bind_lifecycle(&self, lifecycle: &mut Lifecycle) -> SubscriptionId {
        lifecycle.subscribe(Teardown {
            shared: Arc::downgrade(&self.shared),
        })
    }
}

struct Teardown {
    shared: Weak<Shared>,
}

impl LifecycleObserver for Teardown {
    fn on_transition(&mut self, transition: Transition) -> GpioResult<Retain> {
        if transition.to != LifecycleState::Destroyed {
            return Ok(Retain::Keep);
        }
        if let Some(shared) = self.shared.upgrade() {
            // Not fatal: the rest of the teardown goes on.
            let _ = shared.shutdown(shared.quiesce_timeout);
        }
        Ok(Retain::Drop)
    }
}

fn run_worker(name: &str, rx: Receiver<Message>, done: Sender<()>) {
    log::info!("worker {} started", name);

    for message in rx.iter() {
        let job = match message {
            Message::Job(job) => job,
            Message::Quit => break,
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_job(job)));
        if outcome.is_err() {
            log::error!("job on worker {} panicked", name);
        }
    }

    log::info!("worker {} stopped", name);
    let _ = done.send(());
}

fn run_job(job: PendingJob) {
    match job.payload {
        Payload::Task(task) => task(),
        Payload::Edge(state, event) => {
            if !state.active.load(Ordering::SeqCst) {
                return;
            }
            log::trace!(
                "edge {:?} on {} picked up after {:?}",
                event.kind,
                state.pin,
                job.triggered_at.elapsed()
            );

            let keep = match state.callback.lock() {
                Ok(mut callback) => (*callback)(&event),
                Err(_) => false,
            };
            if !keep {
                state.active.store(false, Ordering::SeqCst);
                log::debug!("edge callback for {} removed", state.pin);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Edge, PeripheralRegistry, Value};
    use crate::SimulatedDriver;
    use std::sync::atomic::AtomicUsize;

    fn button(sim: &SimulatedDriver) -> (PeripheralRegistry, PinHandle, PinName) {
        let name = PinName::from("BCM21");
        sim.preset(&name, Value::High);
        let registry = PeripheralRegistry::new(sim.clone());
        let handle = registry.open_input(name.clone(), Edge::Falling).unwrap();
        (registry, handle, name)
    }

    fn click(sim: &SimulatedDriver, name: &PinName) {
        sim.press(name);
        sim.release(name);
    }

    #[test]
    fn callbacks_run_on_the_worker() {
        let sim = SimulatedDriver::new();
        let (_registry, mut handle, name) = button(&sim);
        let dispatcher = EdgeDispatcher::spawn("ButtonThread").unwrap();
        let (tx, rx) = mpsc::channel();

        dispatcher
            .register_callback(&mut handle, move |event| {
                tx.send((thread::current().name().map(str::to_owned), event.kind))
                    .unwrap();
                true
            })
            .unwrap();
        click(&sim, &name);

        let (thread_name, kind) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(thread_name.as_deref(), Some("ButtonThread"));
        assert_eq!(kind, crate::EdgeKind::Falling);
    }

    #[test]
    fn one_shot_callback_fires_at_most_once() {
        let sim = SimulatedDriver::new();
        let (_registry, mut handle, name) = button(&sim);
        let dispatcher = EdgeDispatcher::spawn("one-shot").unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        let registration = dispatcher
            .register_callback(&mut handle, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                false
            })
            .unwrap();
        for _ in 0..5 {
            click(&sim, &name);
        }

        dispatcher.shutdown(Duration::from_secs(1)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!registration.is_active());
    }

    #[test]
    fn unregister_stops_watching() {
        let sim = SimulatedDriver::new();
        let (_registry, mut handle, name) = button(&sim);
        let dispatcher = EdgeDispatcher::spawn("unregister").unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        let registration = dispatcher
            .register_callback(&mut handle, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            })
            .unwrap();
        registration.unregister(&mut handle).unwrap();
        click(&sim, &name);

        dispatcher.shutdown(Duration::from_secs(1)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!sim.is_watched(&name));
    }

    #[test]
    fn slow_job_delays_the_next() {
        let dispatcher = EdgeDispatcher::spawn("fifo").unwrap();
        let spans = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            let spans = Arc::clone(&spans);
            dispatcher
                .post(move || {
                    let start = Instant::now();
                    thread::sleep(Duration::from_millis(40));
                    spans.lock().unwrap().push((tag, start, Instant::now()));
                })
                .unwrap();
        }
        dispatcher.shutdown(Duration::from_secs(2)).unwrap();

        let spans = spans.lock().unwrap();
        assert_eq!(spans.iter().map(|s| s.0).collect::<Vec<_>>(), vec![0, 1, 2]);
        for pair in spans.windows(2) {
            assert!(pair[1].1 >= pair[0].2);
        }
    }

    #[test]
    fn posts_racing_shutdown_either_run_or_fail() {
        for round in 0..50 {
            let dispatcher = EdgeDispatcher::spawn("racing").unwrap();
            let ran = Arc::new(AtomicUsize::new(0));
            let accepted = Arc::new(AtomicUsize::new(0));

            let posters: Vec<_> = (0..4)
                .map(|_| {
                    let dispatcher = dispatcher.clone();
                    let ran = Arc::clone(&ran);
                    let accepted = Arc::clone(&accepted);
                    thread::spawn(move || {
                        for _ in 0..200 {
                            let ran = Arc::clone(&ran);
                            match dispatcher.post(move || {
                                ran.fetch_add(1, Ordering::SeqCst);
                            }) {
                                Ok(()) => {
                                    accepted.fetch_add(1, Ordering::SeqCst);
                                }
                                Err(crate::GpioError::DispatchError(DispatchError::ShutDown(_))) => {}
                                Err(other) => panic!("unexpected post error {:?}", other),
                            }
                        }
                    })
                })
                .collect();

            thread::sleep(Duration::from_micros(200));
            dispatcher.shutdown(Duration::from_secs(2)).unwrap();
            for poster in posters {
                poster.join().unwrap();
            }

            assert_eq!(
                ran.load(Ordering::SeqCst),
                accepted.load(Ordering::SeqCst),
                "round {}",
                round
            );
        }
    }

    #[test]
    fn busy_worker_is_abandoned_after_timeout() {
        let dispatcher = EdgeDispatcher::spawn("busy").unwrap();
        dispatcher
            .post(|| thread::sleep(Duration::from_millis(300)))
            .unwrap();
        thread::sleep(Duration::from_millis(20));

        match dispatcher.shutdown(Duration::from_millis(20)) {
            Err(DispatchError::QuiesceTimeout { worker, .. }) => assert_eq!(worker, "busy"),
            other => panic!("expected QuiesceTimeout, got {:?}", other),
        }
        assert!(matches!(
            dispatcher.post(|| ()),
            Err(crate::GpioError::DispatchError(DispatchError::ShutDown(_)))
        ));
        assert!(dispatcher.shutdown(Duration::from_millis(20)).is_ok());
    }

    #[test]
    fn destroyed_lifecycle_stops_the_worker() {
        let dispatcher = EdgeDispatcher::spawn("bound").unwrap();
        let mut lifecycle = Lifecycle::new();
        dispatcher.bind_lifecycle(&mut lifecycle);

        lifecycle.start().unwrap();
        assert!(dispatcher.is_accepting());
        lifecycle.destroy().unwrap();
        assert!(!dispatcher.is_accepting());
        assert_eq!(lifecycle.observer_count(), 0);
    }
}
