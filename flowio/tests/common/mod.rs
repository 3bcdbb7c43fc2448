#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Once;

use flowio::{Brigade, Runtime, StreamError, Target, TargetYield};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Route `tracing` and `log` output to the test harness, filtered by `RUST_LOG`
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Shared counter for event listeners
#[derive(Clone, Default)]
pub struct Counter(Rc<Cell<usize>>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.get()
    }

    pub fn bump(&self) {
        self.0.set(self.0.get() + 1);
    }

    /// Listener that bumps the counter
    pub fn listener<T>(&self) -> impl FnMut(T) + 'static {
        let counter = self.clone();
        move |_| counter.bump()
    }
}

/// Target that holds every write until the test completes it
pub struct ManualTarget<T> {
    pub state: Rc<RefCell<ManualState<T>>>,
}

pub struct ManualState<T> {
    pub written: Vec<T>,
    pending: Vec<(Vec<T>, TargetYield)>,
}

impl<T> ManualTarget<T> {
    pub fn new() -> (Self, Rc<RefCell<ManualState<T>>>) {
        let state = Rc::new(RefCell::new(ManualState {
            written: Vec::new(),
            pending: Vec::new(),
        }));
        (
            Self {
                state: Rc::clone(&state),
            },
            state,
        )
    }
}

impl<T> ManualState<T> {
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Accept the oldest held write
pub fn complete_next<T>(state: &Rc<RefCell<ManualState<T>>>) {
    let next = {
        let mut st = state.borrow_mut();
        if st.pending.is_empty() {
            None
        } else {
            Some(st.pending.remove(0))
        }
    };
    if let Some((items, done)) = next {
        let count = items.len();
        state.borrow_mut().written.extend(items);
        done(Ok(count));
    }
}

impl<T> Target<T> for ManualTarget<T> {
    fn writev(&mut self, brigade: Brigade<T>, done: TargetYield) {
        let items: Vec<T> = brigade.into_iter().flatten().collect();
        self.state.borrow_mut().pending.push((items, done));
    }
}

/// Target that accepts every write one tick later
pub struct DeferredTarget<T> {
    runtime: Runtime,
    items: Rc<RefCell<Vec<T>>>,
}

impl<T: 'static> DeferredTarget<T> {
    pub fn new(runtime: &Runtime) -> (Self, Rc<RefCell<Vec<T>>>) {
        let items = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                runtime: runtime.clone(),
                items: Rc::clone(&items),
            },
            items,
        )
    }
}

impl<T: 'static> Target<T> for DeferredTarget<T> {
    fn writev(&mut self, brigade: Brigade<T>, done: TargetYield) {
        let items = Rc::clone(&self.items);
        self.runtime.next_tick(move || {
            let mut items = items.borrow_mut();
            let before = items.len();
            items.extend(brigade.into_iter().flatten());
            let count = items.len() - before;
            drop(items);
            done(Ok(count));
        });
    }
}

/// Error used by failing sources and targets in tests
pub fn boom() -> StreamError {
    StreamError::source_msg("boom")
}
