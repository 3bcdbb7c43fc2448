//! Pipe engine
//!
//! Moves chunks from a readable into a writable, honouring backpressure:
//!
//! ```text
//!   Armed ──readable──► Running ──write()=false──► Draining
//!                         │  ▲                        │
//!                         │  └───────drain────────────┘
//!                         │
//!                   EOF / error ──► (Erroring) ──► Detached
//! ```
//!
//! The pipe is the only owner of the strong references to both streams.
//! Its listeners keep it alive while data flows; on EOF or error it removes
//! the listeners and drops both references, so a bare `a.pipe(b)` needs no
//! other handle and is released once the data has flowed.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::error::StreamError;
use crate::idgen::StreamId;
use crate::listener::ListenerId;
use crate::readable::Readable;
use crate::writable::Writable;

/// Streams that can feed a pipe
pub trait PipeSource<T>: Clone + 'static {
    fn as_readable(&self) -> &Readable<T>;
}

/// Streams that can be fed by a pipe
pub trait PipeTarget<T>: Clone + 'static {
    fn as_writable(&self) -> &Writable<T>;
}

impl<T: 'static> PipeSource<T> for Readable<T> {
    fn as_readable(&self) -> &Readable<T> {
        self
    }
}

impl<T: 'static> PipeTarget<T> for Writable<T> {
    fn as_writable(&self) -> &Writable<T> {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeOptions {
    /// Call `end()` on the target when the source ends
    pub end_on_finish: bool,
    /// Forward source errors to the target
    pub pass_errors: bool,
    /// Yield one scheduler tick after this many written chunks
    pub yield_every: usize,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            end_on_finish: true,
            pass_errors: true,
            yield_every: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipeStage {
    Armed,
    Running,
    Draining,
    Erroring,
    Detached,
}

#[derive(Default)]
struct PipeListeners {
    readable: Option<ListenerId>,
    source_error: Option<ListenerId>,
    drain: Option<ListenerId>,
    target_error: Option<ListenerId>,
}

struct PipeState<T> {
    source: RefCell<Option<Readable<T>>>,
    target: RefCell<Option<Writable<T>>>,
    source_id: StreamId,
    target_id: StreamId,
    options: PipeOptions,
    stage: Cell<PipeStage>,
    /// Set while the pipe itself emits on the target's error set
    forwarding_error: Cell<bool>,
    chunks: Cell<usize>,
    /// Bumped by every `readable` delivery, to spot listeners that fired
    /// while being registered
    readable_events: Cell<u64>,
    listeners: RefCell<PipeListeners>,
}

/// Pipe `source` into `target`, returning `target` for chaining
pub fn pipe<T, S, D>(source: S, target: D, options: PipeOptions) -> D
where
    T: 'static,
    S: PipeSource<T>,
    D: PipeTarget<T>,
{
    let readable = source.as_readable().clone();
    let writable = target.as_writable().clone();
    let state = Rc::new(PipeState {
        source_id: readable.id(),
        target_id: writable.id(),
        source: RefCell::new(Some(readable.clone())),
        target: RefCell::new(Some(writable.clone())),
        options,
        stage: Cell::new(PipeStage::Armed),
        forwarding_error: Cell::new(false),
        chunks: Cell::new(0),
        readable_events: Cell::new(0),
        listeners: RefCell::new(PipeListeners::default()),
    });
    debug!(source = %state.source_id, target = %state.target_id, "pipe armed");

    writable.events().pipe.emit(state.source_id);

    let this = Rc::clone(&state);
    let id = readable.on_error(move |e| this.on_source_error(e));
    // Queued errors replay on registration and may detach the pipe already
    if state.is_detached() {
        readable.events().error.remove_listener(id);
        return target;
    }
    state.listeners.borrow_mut().source_error = Some(id);

    let this = Rc::clone(&state);
    let id = writable.on_error(move |e| this.on_target_error(e));
    if state.is_detached() {
        writable.events().error.remove_listener(id);
        return target;
    }
    state.listeners.borrow_mut().target_error = Some(id);

    state.arm();
    target
}

impl<T: 'static> PipeState<T> {
    fn source(&self) -> Option<Readable<T>> {
        self.source.borrow().clone()
    }

    fn target(&self) -> Option<Writable<T>> {
        self.target.borrow().clone()
    }

    fn is_detached(&self) -> bool {
        self.stage.get() == PipeStage::Detached
    }

    fn arm(self: &Rc<Self>) {
        if self.is_detached() {
            return;
        }
        let Some(readable) = self.source() else {
            return;
        };
        let this = Rc::clone(self);
        let seen = self.readable_events.get();
        let id = readable.once_readable(move |()| this.on_readable());
        if self.is_detached() {
            readable.events().readable.remove_listener(id);
            return;
        }
        // A replayed event fired the listener during registration; it is
        // gone already and any re-arm recorded its own id
        if self.readable_events.get() == seen {
            self.listeners.borrow_mut().readable = Some(id);
        }
    }

    fn rearm_after_write(self: &Rc<Self>) {
        let chunks = self.chunks.get() + 1;
        self.chunks.set(chunks);
        if chunks % self.options.yield_every.max(1) != 0 {
            self.arm();
            return;
        }
        let this = Rc::clone(self);
        let Some(readable) = self.source() else {
            return;
        };
        readable.runtime().next_tick(move || this.arm());
    }

    fn on_readable(self: &Rc<Self>) {
        self.readable_events.set(self.readable_events.get() + 1);
        self.listeners.borrow_mut().readable = None;
        if self.is_detached() {
            return;
        }
        let (Some(readable), Some(writable)) = (self.source(), self.target()) else {
            return;
        };
        self.stage.set(PipeStage::Running);

        let Some(chunk) = readable.read(None) else {
            if readable.reached_end() {
                self.handle_source_end();
            } else {
                self.arm();
            }
            return;
        };

        trace!(source = %self.source_id, target = %self.target_id, items = chunk.len(), "pipe chunk");
        let may_continue = chunk.is_empty() || writable.write(chunk);
        if readable.reached_end() {
            self.handle_source_end();
            return;
        }
        if may_continue {
            self.rearm_after_write();
            return;
        }

        trace!(source = %self.source_id, target = %self.target_id, "pipe waits for drain");
        readable.pause();
        self.stage.set(PipeStage::Draining);
        let this = Rc::clone(self);
        let id = writable.once_drain(move |()| this.on_drain());
        if self.stage.get() == PipeStage::Draining {
            self.listeners.borrow_mut().drain = Some(id);
        }
    }

    fn on_drain(self: &Rc<Self>) {
        self.listeners.borrow_mut().drain = None;
        if self.is_detached() {
            return;
        }
        let Some(readable) = self.source() else {
            return;
        };
        self.stage.set(PipeStage::Running);
        readable.resume();
        let this = Rc::clone(self);
        readable.runtime().next_tick(move || this.arm());
    }

    fn on_source_error(&self, error: StreamError) {
        if self.is_detached() {
            return;
        }
        self.stage.set(PipeStage::Erroring);
        let error = error.wrap_for_pipe(self.source_id);
        debug!(source = %self.source_id, target = %self.target_id, error = %error, "pipe source failed");
        if self.options.pass_errors {
            if let Some(writable) = self.target() {
                self.forwarding_error.set(true);
                writable.emit_error(error);
                self.forwarding_error.set(false);
            }
        }
        self.handle_source_end();
    }

    fn on_target_error(&self, error: StreamError) {
        if self.forwarding_error.get() {
            trace!(target = %self.target_id, "pipe ignores the error it forwarded");
            return;
        }
        if self.is_detached() {
            return;
        }
        warn!(source = %self.source_id, target = %self.target_id, error = %error, "pipe target failed, unpiping");
        self.detach(false);
    }

    fn handle_source_end(&self) {
        self.detach(self.options.end_on_finish);
    }

    fn detach(&self, end_target: bool) {
        if self.is_detached() {
            return;
        }
        self.stage.set(PipeStage::Detached);
        let readable = self.source.borrow_mut().take();
        let writable = self.target.borrow_mut().take();
        let listeners = std::mem::take(&mut *self.listeners.borrow_mut());

        if let Some(readable) = &readable {
            if let Some(id) = listeners.readable {
                readable.events().readable.remove_listener(id);
            }
            if let Some(id) = listeners.source_error {
                readable.events().error.remove_listener(id);
            }
        }
        if let Some(writable) = &writable {
            if let Some(id) = listeners.drain {
                writable.events().drain.remove_listener(id);
            }
            if let Some(id) = listeners.target_error {
                writable.events().error.remove_listener(id);
            }
            writable.events().unpipe.emit(self.source_id);
            if end_target {
                writable.end(None);
            }
        }
        debug!(source = %self.source_id, target = %self.target_id, end_target, "pipe detached");
    }
}
