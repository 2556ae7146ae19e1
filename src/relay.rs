//! Foreground execution context and the relay background work posts its results through.
//!
//! A `Foreground` is created on, and stays bound to, the thread that owns user-visible side effects. Any thread
//! can `post` closures to it through a clone of its `ResultRelay`; they run on the foreground thread one at a time,
//! in the order they were posted. State that may only be touched on the foreground lives in a `ForegroundOnly`.
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::marker::PhantomData;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Mutex;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;

pub type Action = Box<dyn FnOnce() + Send + 'static>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("foreground-only state touched from thread {0:?}")]
    OffForeground(String),
    #[error("foreground loop is gone")]
    Closed,
    #[error("foreground state lock poisoned")]
    Poisoned,
    #[error("foreground condition still pending after {0:?}")]
    Timeout(Duration),
}

enum Message {
    Run(Action),
    At(Instant, Action),
}

/// Posting end of a `Foreground`. Cheap to clone and safe to send to worker threads.
#[derive(Clone)]
pub struct ResultRelay {
    tx: Sender<Message>,
    owner: ThreadId,
}

impl ResultRelay {
    /// Schedules `action` on the foreground thread after everything posted before it. Never blocks.
    pub fn post<F>(&self, action: F) -> Result<(), RelayError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(Message::Run(Box::new(action)))
            .map_err(|_| RelayError::Closed)
    }

    pub fn post_delayed<F>(&self, delay: Duration, action: F) -> Result<(), RelayError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(Message::At(Instant::now() + delay, Box::new(action)))
            .map_err(|_| RelayError::Closed)
    }

    pub fn is_foreground(&self) -> bool {
        thread::current().id() == self.owner
    }
}

struct Timer {
    due: Instant,
    seq: u64,
    action: Action,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // Reversed: BinaryHeap is a max-heap and the earliest timer has to come out first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

/// The single foreground loop. Not `Send`: it belongs to the thread that created it.
pub struct Foreground {
    rx: Receiver<Message>,
    relay: ResultRelay,
    timers: BinaryHeap<Timer>,
    seq: u64,
    _bound: PhantomData<*const ()>,
}

impl Foreground {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();

        Self {
            rx,
            relay: ResultRelay {
                tx,
                owner: thread::current().id(),
            },
            timers: BinaryHeap::new(),
            seq: 0,
            _bound: PhantomData,
        }
    }

    pub fn relay(&self) -> ResultRelay {
        self.relay.clone()
    }

    /// Runs everything that is ready right now and returns how many actions ran. Never waits.
    pub fn run_until_idle(&mut self) -> usize {
        let mut ran = 0;

        loop {
            if let Some(action) = self.pop_due(Instant::now()) {
                action();
                ran += 1;
                continue;
            }
            match self.rx.try_recv() {
                Ok(Message::Run(action)) => {
                    action();
                    ran += 1;
                }
                Ok(Message::At(due, action)) => self.schedule(due, action),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return ran,
            }
        }
    }

    /// Runs posted actions as they arrive until `deadline`.
    pub fn run_until(&mut self, deadline: Instant) -> usize {
        let mut ran = 0;
        while let Some(did_run) = self.turn(deadline) {
            ran += did_run as usize;
        }
        ran
    }

    /// Runs posted actions while `pending` holds, giving up after `timeout`.
    pub fn run_while<F>(&mut self, mut pending: F, timeout: Duration) -> Result<usize, RelayError>
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut ran = 0;

        while pending() {
            match self.turn(deadline) {
                Some(did_run) => ran += did_run as usize,
                None => return Err(RelayError::Timeout(timeout)),
            }
        }
        Ok(ran)
    }

    /// One step of the loop: `Some(true)` if an action ran, `Some(false)` on a timer/idle wake-up, `None` past deadline.
    fn turn(&mut self, deadline: Instant) -> Option<bool> {
        let now = Instant::now();

        if let Some(action) = self.pop_due(now) {
            action();
            return Some(true);
        }
        if now >= deadline {
            return None;
        }

        let wake = self
            .timers
            .peek()
            .map_or(deadline, |timer| timer.due.min(deadline));
        match self.rx.recv_timeout(wake.saturating_duration_since(now)) {
            Ok(Message::Run(action)) => {
                action();
                Some(true)
            }
            Ok(Message::At(due, action)) => {
                self.schedule(due, action);
                Some(false)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Some(false),
        }
    }

    fn schedule(&mut self, due: Instant, action: Action) {
        self.seq += 1;
        self.timers.push(Timer {
            due,
            seq: self.seq,
            action,
        });
    }

    fn pop_due(&mut self, now: Instant) -> Option<Action> {
        match self.timers.peek() {
            Some(timer) if timer.due <= now => self.timers.pop().map(|timer| timer.action),
            _ => None,
        }
    }
}

impl Default for Foreground {
    fn default() -> Self {
        Self::new()
    }
}

/// State that may only be read or written on the foreground thread.
///
/// Access from any other thread fails immediately with `RelayError::OffForeground` and leaves the state untouched.
/// Background code gets its effects in through `ResultRelay::post`.
#[derive(Debug)]
pub struct ForegroundOnly<T> {
    owner: ThreadId,
    value: Mutex<T>,
}

impl<T> ForegroundOnly<T> {
    pub fn new(foreground: &Foreground, value: T) -> Self {
        Self {
            owner: foreground.relay.owner,
            value: Mutex::new(value),
        }
    }

    pub fn with<R, F>(&self, f: F) -> Result<R, RelayError>
    where
        F: FnOnce(&mut T) -> R,
    {
        let current = thread::current();
        if current.id() != self.owner {
            return Err(RelayError::OffForeground(
                current.name().unwrap_or("<unnamed>").to_owned(),
            ));
        }

        let mut value = self.value.lock().map_err(|_| RelayError::Poisoned)?;
        Ok(f(&mut value))
    }
}
