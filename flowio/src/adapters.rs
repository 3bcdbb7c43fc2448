//! Ready-made sources and targets

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::capability::{FinalizeYield, Source, SourceResult, SourceYield, Target, TargetYield};
use crate::error::StreamError;
use crate::io::Brigade;
use crate::runtime::Runtime;

/// Source over an iterator, in chunks of at most the requested size
pub struct IterSource<I> {
    iter: I,
}

impl<I: Iterator> IterSource<I> {
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            iter: iter.into_iter(),
        }
    }
}

impl<I: Iterator> Source<I::Item> for IterSource<I> {
    fn next(&mut self, requested: usize, done: SourceYield<I::Item>) {
        let items: Vec<I::Item> = self.iter.by_ref().take(requested.max(1)).collect();
        if items.is_empty() {
            done(Ok(None));
        } else {
            done(Ok(Some(items)));
        }
    }
}

/// Source running a blocking generator on the tokio blocking pool.
///
/// The generator gets the requested item count and returns items,
/// `Ok(None)` at end of input, or an error. Without a tokio runtime the
/// generator runs inline.
///
/// A panicking generator is logged and reported to the readable as a
/// source error.
pub struct BlockingSource<F> {
    runtime: Runtime,
    generator: Arc<Mutex<F>>,
}

impl<F> BlockingSource<F> {
    pub fn new(runtime: &Runtime, generator: F) -> Self {
        Self {
            runtime: runtime.clone(),
            generator: Arc::new(Mutex::new(generator)),
        }
    }
}

impl<T, F> Source<T> for BlockingSource<F>
where
    T: Send + 'static,
    F: FnMut(usize) -> SourceResult<T> + Send + 'static,
{
    fn next(&mut self, requested: usize, done: SourceYield<T>) {
        let completion = self.runtime.completion(move |result: SourceResult<T>| done(result));
        let generator = Arc::clone(&self.generator);
        let produce = move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                let mut generator = generator.lock();
                (*generator)(requested)
            }))
            .unwrap_or_else(|_| {
                error!(requested, "blocking source generator panicked");
                Err(StreamError::source_msg("generator panicked"))
            });
            completion.complete(result);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                trace!(requested, "blocking source dispatched");
                // Panics are caught inside `produce`, the join handle carries nothing
                drop(handle.spawn_blocking(produce));
            }
            Err(_) => produce(),
        }
    }
}

/// Concatenating sink. Clones share the collected items.
pub struct CollectTarget<T> {
    items: Rc<RefCell<Vec<T>>>,
    writes: Rc<Cell<usize>>,
    finalized: Rc<Cell<usize>>,
}

impl<T> Clone for CollectTarget<T> {
    fn clone(&self) -> Self {
        Self {
            items: Rc::clone(&self.items),
            writes: Rc::clone(&self.writes),
            finalized: Rc::clone(&self.finalized),
        }
    }
}

impl<T> Default for CollectTarget<T> {
    fn default() -> Self {
        Self {
            items: Rc::new(RefCell::new(Vec::new())),
            writes: Rc::new(Cell::new(0)),
            finalized: Rc::new(Cell::new(0)),
        }
    }
}

impl<T> CollectTarget<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    /// Move the collected items out
    #[must_use]
    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.borrow_mut())
    }

    /// Number of `writev` calls received
    #[must_use]
    pub fn write_calls(&self) -> usize {
        self.writes.get()
    }

    /// Number of `finalize` calls received
    #[must_use]
    pub fn finalize_calls(&self) -> usize {
        self.finalized.get()
    }
}

impl<T: Clone> CollectTarget<T> {
    #[must_use]
    pub fn items(&self) -> Vec<T> {
        self.items.borrow().clone()
    }
}

impl<T> Target<T> for CollectTarget<T> {
    fn writev(&mut self, brigade: Brigade<T>, done: TargetYield) {
        self.writes.set(self.writes.get() + 1);
        let mut items = self.items.borrow_mut();
        let before = items.len();
        items.extend(brigade.into_iter().flatten());
        let written = items.len() - before;
        drop(items);
        done(Ok(written));
    }

    fn finalize(&mut self, done: FinalizeYield) {
        self.finalized.set(self.finalized.get() + 1);
        done(Ok(()));
    }
}

impl<T> fmt::Debug for CollectTarget<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectTarget(len={})", self.len())
    }
}

/// Sink calling a closure with the flattened items of every write
pub struct FnTarget<F> {
    f: F,
}

impl<F> FnTarget<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<T, F> Target<T> for FnTarget<F>
where
    F: FnMut(Vec<T>) -> Result<(), StreamError>,
{
    fn writev(&mut self, brigade: Brigade<T>, done: TargetYield) {
        let items: Vec<T> = brigade.into_iter().flatten().collect();
        let count = items.len();
        done((self.f)(items).map(|()| count));
    }
}
