//! Runtime context: the serial queue and the keep-alive work counter
//!
//! All stream callbacks run on one cooperative queue owned by a [`Runtime`].
//! There is no global state: a runtime is created explicitly, handed to every
//! stream, and torn down explicitly.
//!
//! # Work counter
//!
//! Every asynchronous `Source`/`Target` call that has been dispatched but not
//! resolved holds one unit of pending work. [`Runtime::run`] keeps waiting
//! while work is pending and returns as soon as the queue is empty and the
//! counter is back to zero.
//!
//! # Worker threads
//!
//! Streams are single-threaded (`Rc`/`RefCell`). Work done on another thread
//! comes back through a [`Completion`]: the worker calls
//! [`Completion::complete`], and the callback registered with
//! [`Runtime::completion`] runs later on the serial queue.
//!
//! ```text
//!  worker thread                       serial queue
//!  ─────────────                       ────────────
//!  completion.complete(v) ──channel──► run(): deliver(ticket, v)
//!                                        └─ callback(v); end_work()
//! ```

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::error::RuntimeError;
use crate::idgen::{IdGen, StreamId};

type Task = Box<dyn FnOnce()>;
type Payload = Box<dyn Any + Send>;
type Delivery = (u64, Payload);
type Resume = Box<dyn FnOnce(Payload)>;

struct RuntimeInner {
    queue: RefCell<VecDeque<Task>>,
    pending: Cell<usize>,
    resumes: RefCell<HashMap<u64, Resume>>,
    next_ticket: Cell<u64>,
    remote_tx: mpsc::UnboundedSender<Delivery>,
    /// `None` while `run()` owns the receiver
    remote_rx: RefCell<Option<mpsc::UnboundedReceiver<Delivery>>>,
    idgen: IdGen,
    ticks: Cell<u64>,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        let pending = self.pending.get();
        if pending > 0 {
            warn!(pending, "runtime dropped with pending work");
        }
    }
}

/// Handle to the serial queue. Cloning is cheap and shares the queue.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    #[must_use]
    pub fn new() -> Self {
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        Self {
            inner: Rc::new(RuntimeInner {
                queue: RefCell::new(VecDeque::new()),
                pending: Cell::new(0),
                resumes: RefCell::new(HashMap::new()),
                next_ticket: Cell::new(1),
                remote_tx,
                remote_rx: RefCell::new(Some(remote_rx)),
                idgen: IdGen::new(),
                ticks: Cell::new(0),
            }),
        }
    }

    /// Allocate an identity for a new stream
    pub fn next_stream_id(&self) -> StreamId {
        self.inner.idgen.get_next()
    }

    /// Schedule a continuation on the serial queue
    pub fn next_tick(&self, task: impl FnOnce() + 'static) {
        self.inner.queue.borrow_mut().push_back(Box::new(task));
    }

    /// Number of dispatched but unresolved operations
    #[must_use]
    pub fn pending_work(&self) -> usize {
        self.inner.pending.get()
    }

    /// Number of queued continuations
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    /// Total number of continuations executed so far
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.inner.ticks.get()
    }

    pub fn begin_work(&self) {
        self.inner.pending.set(self.inner.pending.get() + 1);
    }

    pub fn end_work(&self) {
        let pending = self.inner.pending.get();
        if pending == 0 {
            error!("runtime.end_work: work counter is already zero");
            return;
        }
        self.inner.pending.set(pending - 1);
    }

    /// Register a callback to be resumed on the serial queue with a value
    /// produced elsewhere, possibly on another thread.
    ///
    /// The returned [`Completion`] counts as pending work until it is
    /// completed or dropped.
    pub fn completion<P, F>(&self, callback: F) -> Completion<P>
    where
        P: Send + 'static,
        F: FnOnce(P) + 'static,
    {
        let ticket = self.inner.next_ticket.get();
        self.inner.next_ticket.set(ticket + 1);

        let resume: Resume = Box::new(move |payload: Payload| {
            match payload.downcast::<Option<P>>() {
                Ok(value) => match *value {
                    Some(value) => callback(value),
                    None => warn!(ticket, "completion dropped without a value"),
                },
                Err(_) => error!(ticket, "completion delivered a value of the wrong type"),
            }
        });
        self.inner.resumes.borrow_mut().insert(ticket, resume);
        self.begin_work();

        Completion {
            ticket,
            tx: self.inner.remote_tx.clone(),
            delivered: false,
            _marker: PhantomData,
        }
    }

    fn deliver(&self, ticket: u64, payload: Payload) {
        let resume = self.inner.resumes.borrow_mut().remove(&ticket);
        match resume {
            Some(resume) => {
                self.end_work();
                trace!(ticket, "resuming completion");
                resume(payload);
            }
            None => error!(ticket, "unknown completion ticket"),
        }
    }

    fn pop_task(&self) -> Option<Task> {
        self.inner.queue.borrow_mut().pop_front()
    }

    fn run_task(&self, task: Task) {
        self.inner.ticks.set(self.inner.ticks.get() + 1);
        task();
    }

    fn drain(&self, rx: Option<&mut mpsc::UnboundedReceiver<Delivery>>) -> usize {
        let mut executed = 0;
        let mut rx = rx;
        loop {
            while let Some(task) = self.pop_task() {
                self.run_task(task);
                executed += 1;
            }
            let delivery = rx.as_deref_mut().and_then(|rx| rx.try_recv().ok());
            match delivery {
                Some((ticket, payload)) => self.deliver(ticket, payload),
                None => return executed,
            }
        }
    }

    /// Synchronously drain queued continuations and already arrived
    /// completions. Returns the number of continuations executed.
    pub fn run_until_stalled(&self) -> usize {
        let rx = self.inner.remote_rx.borrow_mut().take();
        match rx {
            Some(mut rx) => {
                let executed = self.drain(Some(&mut rx));
                *self.inner.remote_rx.borrow_mut() = Some(rx);
                executed
            }
            // Called from a continuation while `run()` owns the receiver
            None => self.drain(None),
        }
    }

    /// Run until the queue is empty and no work is pending.
    ///
    /// # Errors
    /// Returns `RuntimeError::AlreadyRunning` when called re-entrantly.
    pub async fn run(&self) -> Result<(), RuntimeError> {
        let Some(mut rx) = self.inner.remote_rx.borrow_mut().take() else {
            return Err(RuntimeError::AlreadyRunning);
        };
        debug!("runtime: running");

        loop {
            self.drain(Some(&mut rx));
            let pending = self.inner.pending.get();
            if pending == 0 {
                break;
            }
            trace!(pending, "runtime: waiting for completions");
            match rx.recv().await {
                Some((ticket, payload)) => self.deliver(ticket, payload),
                None => break,
            }
        }

        *self.inner.remote_rx.borrow_mut() = Some(rx);
        debug!(ticks = self.inner.ticks.get(), "runtime: idle");
        Ok(())
    }

    /// Check the runtime is fully drained
    ///
    /// # Errors
    /// Returns an error if continuations are queued or work is pending.
    pub fn teardown(&self) -> Result<(), RuntimeError> {
        let queued = self.queued();
        if queued > 0 {
            return Err(RuntimeError::QueuedTasks(queued));
        }
        let pending = self.pending_work();
        if pending > 0 {
            return Err(RuntimeError::PendingWork(pending));
        }
        Ok(())
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Runtime(queued={}, pending={}, ticks={})",
            self.queued(),
            self.pending_work(),
            self.ticks()
        )
    }
}

/// Sending half of a [`Runtime::completion`]
///
/// `Send`, so it can be moved to a worker thread.
pub struct Completion<P: Send + 'static> {
    ticket: u64,
    tx: mpsc::UnboundedSender<Delivery>,
    delivered: bool,
    _marker: PhantomData<fn(P)>,
}

impl<P: Send + 'static> Completion<P> {
    /// Deliver the value to the serial queue
    pub fn complete(mut self, value: P) {
        self.send(Some(value));
    }

    fn send(&mut self, value: Option<P>) {
        self.delivered = true;
        if self.tx.send((self.ticket, Box::new(value))).is_err() {
            log::debug!("completion {}: runtime is gone", self.ticket);
        }
    }
}

impl<P: Send + 'static> Drop for Completion<P> {
    fn drop(&mut self) {
        if !self.delivered {
            // Release the pending work even though no value was produced
            self.send(None);
        }
    }
}

impl<P: Send + 'static> fmt::Debug for Completion<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Completion(ticket={})", self.ticket)
    }
}
