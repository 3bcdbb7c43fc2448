//! Listener Set
//!
//! Ordered pub/sub primitive behind every stream event.
//!
//! # 1) Emitting
//!
//! `emit` iterates over a *snapshot* of the listener list, so listeners may
//! add or remove listeners (including themselves) while an emission is in
//! progress without disturbing it:
//!
//! 10. Take a snapshot of the entries
//! 20. For each entry still attached:
//! 30.   once entry: mark fired, invoke, detach
//! 40.   entry already running (nested emit): defer to the next tick
//! 50.   otherwise: invoke synchronously
//!
//! Step 40 bounds the call stack: a listener that causes its own event to be
//! emitted again does not recurse, it gets the value on the next tick.
//! Re-entering a once entry is a defect in the caller and is reported.
//!
//! # 2) Emitting with no listeners
//!
//! Values emitted while nobody listens are queued (up to
//! `max_queue_length`, optionally coalescing equal consecutive values) and
//! replayed, oldest first, to the next listener that is added.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use crate::runtime::Runtime;

pub const DEFAULT_MAX_QUEUE_LENGTH: usize = 64;

// ============================================================================
// Listener Entry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ListenerEntry<T> {
    id: ListenerId,
    once: bool,
    callback: RefCell<Box<dyn FnMut(T)>>,
    /// Re-entrancy counter
    running: Cell<u32>,
    fired: Cell<bool>,
    detached: Cell<bool>,
}

impl<T> fmt::Debug for ListenerEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerEntry")
            .field("id", &self.id)
            .field("once", &self.once)
            .field("running", &self.running.get())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Queue Policy
// ============================================================================

/// What happens to values emitted while no listener is attached
pub struct QueuePolicy<T> {
    pub max_queue_length: usize,
    /// Drop a value equal to the last queued one
    pub coalesce: Option<fn(&T, &T) -> bool>,
}

impl<T> QueuePolicy<T> {
    #[must_use]
    pub fn bounded(max_queue_length: usize) -> Self {
        Self {
            max_queue_length,
            coalesce: None,
        }
    }
}

impl<T: PartialEq> QueuePolicy<T> {
    /// Keep only one of several equal consecutive values
    #[must_use]
    pub fn coalescing(max_queue_length: usize) -> Self {
        Self {
            max_queue_length,
            coalesce: Some(<T as PartialEq>::eq),
        }
    }
}

impl<T> Default for QueuePolicy<T> {
    fn default() -> Self {
        Self::bounded(DEFAULT_MAX_QUEUE_LENGTH)
    }
}

// ============================================================================
// Listener Set
// ============================================================================

struct Inner<T> {
    entries: Vec<Rc<ListenerEntry<T>>>,
    pending: VecDeque<T>,
    next_id: u64,
}

pub struct ListenerSet<T> {
    name: &'static str,
    inner: RefCell<Inner<T>>,
    policy: QueuePolicy<T>,
    runtime: Runtime,
    misuse: Cell<usize>,
}

impl<T: Clone + 'static> ListenerSet<T> {
    #[must_use]
    pub fn new(runtime: Runtime, name: &'static str) -> Self {
        Self::with_policy(runtime, name, QueuePolicy::default())
    }

    #[must_use]
    pub fn with_policy(runtime: Runtime, name: &'static str, policy: QueuePolicy<T>) -> Self {
        Self {
            name,
            inner: RefCell::new(Inner {
                entries: Vec::new(),
                pending: VecDeque::new(),
                next_id: 1,
            }),
            policy,
            runtime,
            misuse: Cell::new(0),
        }
    }

    /// Protocol violations reported so far (re-entrant once listeners)
    #[must_use]
    pub fn misuse_reports(&self) -> usize {
        self.misuse.get()
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    /// Number of values waiting for a listener
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    /// Attach a listener and replay queued values to it
    pub fn add(&self, callback: impl FnMut(T) + 'static, once: bool) -> ListenerId {
        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = ListenerId(inner.next_id);
            inner.next_id += 1;
            inner.entries.push(Rc::new(ListenerEntry {
                id,
                once,
                callback: RefCell::new(Box::new(callback)),
                running: Cell::new(0),
                fired: Cell::new(false),
                detached: Cell::new(false),
            }));
            id
        };
        self.replay_pending();
        id
    }

    pub fn on(&self, callback: impl FnMut(T) + 'static) -> ListenerId {
        self.add(callback, false)
    }

    pub fn once(&self, callback: impl FnOnce(T) + 'static) -> ListenerId {
        let mut callback = Some(callback);
        self.add(
            move |value| {
                if let Some(callback) = callback.take() {
                    callback(value);
                }
            },
            true,
        )
    }

    /// Detach by identity. Returns false if the listener is already gone.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.borrow_mut();
        match inner.entries.iter().position(|e| e.id == id) {
            Some(index) => {
                let entry = inner.entries.remove(index);
                entry.detached.set(true);
                true
            }
            None => false,
        }
    }

    pub fn remove_all_listeners(&self) {
        let entries = std::mem::take(&mut self.inner.borrow_mut().entries);
        for entry in entries {
            entry.detached.set(true);
        }
    }

    /// Drop queued values
    pub fn clear_pending(&self) {
        self.inner.borrow_mut().pending.clear();
    }

    pub fn emit(&self, value: T) {
        let snapshot = {
            let inner = self.inner.borrow();
            if inner.entries.is_empty() {
                drop(inner);
                self.queue_value(value);
                return;
            }
            inner.entries.clone()
        };
        self.dispatch(&snapshot, &value);
    }

    fn queue_value(&self, value: T) {
        let mut inner = self.inner.borrow_mut();
        if let Some(same) = self.policy.coalesce {
            if inner.pending.back().is_some_and(|last| same(last, &value)) {
                return;
            }
        }
        if inner.pending.len() >= self.policy.max_queue_length {
            log::warn!(
                "listeners.{}: no listener and queue is full ({}), dropping value",
                self.name,
                self.policy.max_queue_length
            );
            return;
        }
        inner.pending.push_back(value);
    }

    fn replay_pending(&self) {
        loop {
            let value = {
                let mut inner = self.inner.borrow_mut();
                // A once listener may have detached itself mid-replay
                if inner.entries.is_empty() {
                    return;
                }
                match inner.pending.pop_front() {
                    Some(value) => value,
                    None => return,
                }
            };
            self.emit(value);
        }
    }

    fn dispatch(&self, snapshot: &[Rc<ListenerEntry<T>>], value: &T) {
        for entry in snapshot {
            self.fire(entry, value.clone());
        }
    }

    fn fire(&self, entry: &Rc<ListenerEntry<T>>, value: T) {
        if entry.detached.get() {
            return;
        }

        if entry.once {
            if entry.fired.get() {
                if entry.running.get() > 0 {
                    self.misuse.set(self.misuse.get() + 1);
                    log::error!(
                        "listeners.{}: re-entrant emit into running once listener {:?}",
                        self.name,
                        entry.id
                    );
                }
                return;
            }
            entry.fired.set(true);
            Self::invoke(entry, value);
            self.remove_listener(entry.id);
            return;
        }

        if entry.running.get() > 0 {
            log::trace!(
                "listeners.{}: listener {:?} is running, deferring to next tick",
                self.name,
                entry.id
            );
            let entry = Rc::clone(entry);
            let runtime = self.runtime.clone();
            let name = self.name;
            self.runtime
                .next_tick(move || Self::fire_deferred(&runtime, name, &entry, value));
            return;
        }

        Self::invoke(entry, value);
    }

    fn fire_deferred(runtime: &Runtime, name: &'static str, entry: &Rc<ListenerEntry<T>>, value: T) {
        if entry.detached.get() {
            return;
        }
        if entry.running.get() > 0 {
            let entry = Rc::clone(entry);
            let again = runtime.clone();
            runtime.next_tick(move || Self::fire_deferred(&again, name, &entry, value));
            return;
        }
        Self::invoke(entry, value);
    }

    fn invoke(entry: &ListenerEntry<T>, value: T) {
        entry.running.set(entry.running.get() + 1);
        (entry.callback.borrow_mut())(value);
        entry.running.set(entry.running.get() - 1);
    }
}

impl<T> fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ListenerSet")
            .field("name", &self.name)
            .field("listeners", &inner.entries.len())
            .field("pending", &inner.pending.len())
            .finish()
    }
}
