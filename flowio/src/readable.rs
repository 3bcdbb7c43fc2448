//! Readable stream
//!
//! Buffered source with high-water-mark flow control.
//!
//! ```text
//!   Idle ──(listener / read)──► Flowing ◄──► Paused
//!                                  │            │
//!                                  └─(EOF drained)──► Ended
//! ```
//!
//! Producers call [`Readable::push`]; consumers call [`Readable::read`]
//! after a `readable` event. A readable backed by a [`Source`] asks it for
//! more data whenever it is flowing and its buffer is below the high water
//! mark.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, error, trace, warn};

use crate::capability::{Source, SourceResult, SourceYield};
use crate::error::StreamError;
use crate::idgen::StreamId;
use crate::io::{ArrayBuffer, Bucket};
use crate::listener::{ListenerId, ListenerSet, QueuePolicy, DEFAULT_MAX_QUEUE_LENGTH};
use crate::pipe::{self, PipeOptions, PipeTarget};
use crate::runtime::Runtime;

pub const DEFAULT_HIGH_WATER_MARK: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadableOptions {
    pub high_water_mark: usize,
}

impl Default for ReadableOptions {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadableState {
    Idle,
    Flowing,
    Paused,
    Ended,
}

/// Listener sets of a readable
pub struct ReadableEvents {
    pub readable: ListenerSet<()>,
    pub end: ListenerSet<()>,
    pub close: ListenerSet<()>,
    /// Shared with the writable half of a duplex
    pub error: Rc<ListenerSet<StreamError>>,
}

impl ReadableEvents {
    fn new(runtime: &Runtime, error: Rc<ListenerSet<StreamError>>) -> Self {
        let signal = || QueuePolicy::coalescing(DEFAULT_MAX_QUEUE_LENGTH);
        Self {
            readable: ListenerSet::with_policy(runtime.clone(), "readable", signal()),
            end: ListenerSet::with_policy(runtime.clone(), "end", signal()),
            close: ListenerSet::with_policy(runtime.clone(), "close", signal()),
            error,
        }
    }
}

struct ReadState<T> {
    buffer: ArrayBuffer<T>,
    state: ReadableState,
    hit_eof: bool,
    end_scheduled: bool,
    pull_in_flight: bool,
    errored: bool,
    has_source: bool,
}

struct ReadableInner<T> {
    id: StreamId,
    runtime: Runtime,
    state: RefCell<ReadState<T>>,
    source: RefCell<Option<Box<dyn Source<T>>>>,
    events: ReadableEvents,
    /// Called after consumption frees buffer space
    capacity_hook: RefCell<Option<Box<dyn Fn()>>>,
}

/// Readable stream handle. Clones share the same stream.
pub struct Readable<T> {
    inner: Rc<ReadableInner<T>>,
}

impl<T> Clone for Readable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Readable<T> {
    /// Push-driven readable without a source
    #[must_use]
    pub fn new(runtime: &Runtime, options: ReadableOptions) -> Self {
        let error = Rc::new(ListenerSet::new(runtime.clone(), "error"));
        Self::build(runtime, options, None, error)
    }

    /// Readable that pulls from `source` on demand
    #[must_use]
    pub fn with_source(
        runtime: &Runtime,
        options: ReadableOptions,
        source: impl Source<T> + 'static,
    ) -> Self {
        let error = Rc::new(ListenerSet::new(runtime.clone(), "error"));
        Self::build(runtime, options, Some(Box::new(source)), error)
    }

    pub(crate) fn build(
        runtime: &Runtime,
        options: ReadableOptions,
        source: Option<Box<dyn Source<T>>>,
        error: Rc<ListenerSet<StreamError>>,
    ) -> Self {
        let id = runtime.next_stream_id();
        trace!(stream = %id, hwm = options.high_water_mark, "readable created");
        Self {
            inner: Rc::new(ReadableInner {
                id,
                runtime: runtime.clone(),
                state: RefCell::new(ReadState {
                    buffer: ArrayBuffer::new(options.high_water_mark),
                    state: ReadableState::Idle,
                    hit_eof: false,
                    end_scheduled: false,
                    pull_in_flight: false,
                    errored: false,
                    has_source: source.is_some(),
                }),
                source: RefCell::new(source),
                events: ReadableEvents::new(runtime, error),
                capacity_hook: RefCell::new(None),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    #[must_use]
    pub fn events(&self) -> &ReadableEvents {
        &self.inner.events
    }

    #[must_use]
    pub fn state(&self) -> ReadableState {
        self.inner.state.borrow().state
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state() == ReadableState::Paused
    }

    /// End-of-input was pushed (data may still be buffered)
    #[must_use]
    pub fn hit_eof(&self) -> bool {
        self.inner.state.borrow().hit_eof
    }

    /// End-of-input was pushed and everything has been read
    #[must_use]
    pub fn reached_end(&self) -> bool {
        let st = self.inner.state.borrow();
        st.hit_eof && st.buffer.is_empty()
    }

    #[must_use]
    pub fn is_errored(&self) -> bool {
        self.inner.state.borrow().errored
    }

    /// Number of buffered items
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.inner.state.borrow().buffer.total_count()
    }

    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.inner.state.borrow().buffer.high_water_mark()
    }

    #[must_use]
    pub fn available_buffer_space(&self) -> usize {
        self.inner.state.borrow().buffer.available_buffer_space()
    }

    /// Queue a chunk, or end-of-input with `None`.
    ///
    /// Returns whether the producer may keep pushing without exceeding the
    /// high water mark.
    pub fn push(&self, chunk: Option<Bucket<T>>) -> bool {
        let below_mark = {
            let mut st = self.inner.state.borrow_mut();
            if st.hit_eof {
                drop(st);
                error!(stream = %self.id(), "push after end-of-input, ignored");
                return false;
            }
            match chunk {
                None => {
                    st.hit_eof = true;
                    trace!(stream = %self.id(), buffered = st.buffer.total_count(), "EOF pushed");
                    false
                }
                Some(chunk) => {
                    st.buffer.enqueue_bucket(chunk, false);
                    st.buffer.total_count() < st.buffer.high_water_mark()
                }
            }
        };
        self.inner.events.readable.emit(());
        below_mark
    }

    /// Put a chunk back at the front of the buffer
    pub fn unshift(&self, chunk: Bucket<T>) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.end_scheduled {
                drop(st);
                error!(stream = %self.id(), "unshift after end, ignored");
                return;
            }
            st.buffer.enqueue_bucket(chunk, true);
        }
        self.inner.events.readable.emit(());
    }

    /// Take up to `count` items (everything buffered with `None`).
    ///
    /// `None` means nothing is buffered; check [`Readable::reached_end`] to
    /// tell end-of-input apart from "no data yet".
    pub fn read(&self, count: Option<usize>) -> Option<Bucket<T>> {
        let (chunk, at_end) = {
            let mut st = self.inner.state.borrow_mut();
            if st.state == ReadableState::Idle {
                st.state = ReadableState::Flowing;
            }
            let total = st.buffer.total_count();
            let wanted = count.unwrap_or(total).min(total);
            let chunk = if wanted == 0 {
                None
            } else {
                Some(st.buffer.dequeue(wanted))
            };
            (chunk, st.hit_eof && st.buffer.is_empty())
        };

        if at_end {
            self.schedule_end();
        } else {
            self.maybe_pull();
        }
        if chunk.is_some() {
            self.run_capacity_hook();
        }
        chunk
    }

    /// Stop pulling from the source
    pub fn pause(&self) {
        let mut st = self.inner.state.borrow_mut();
        if st.state != ReadableState::Ended {
            st.state = ReadableState::Paused;
        }
    }

    pub fn resume(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            match st.state {
                ReadableState::Idle | ReadableState::Paused => st.state = ReadableState::Flowing,
                ReadableState::Flowing | ReadableState::Ended => {}
            }
        }
        self.maybe_pull();
        self.run_capacity_hook();
    }

    pub fn on_readable(&self, callback: impl FnMut(()) + 'static) -> ListenerId {
        let id = self.inner.events.readable.on(callback);
        self.start_flowing();
        id
    }

    pub fn once_readable(&self, callback: impl FnOnce(()) + 'static) -> ListenerId {
        let id = self.inner.events.readable.once(callback);
        self.start_flowing();
        id
    }

    pub fn on_end(&self, callback: impl FnMut(()) + 'static) -> ListenerId {
        self.inner.events.end.on(callback)
    }

    pub fn on_close(&self, callback: impl FnMut(()) + 'static) -> ListenerId {
        self.inner.events.close.on(callback)
    }

    pub fn on_error(&self, callback: impl FnMut(StreamError) + 'static) -> ListenerId {
        self.inner.events.error.on(callback)
    }

    /// Emit an error on this stream
    pub fn emit_error(&self, error: StreamError) {
        self.inner.events.error.emit(error);
    }

    /// Pipe into `target` with default options, returning the target
    pub fn pipe<D: PipeTarget<T>>(&self, target: D) -> D {
        pipe::pipe(self.clone(), target, PipeOptions::default())
    }

    pub fn pipe_with<D: PipeTarget<T>>(&self, target: D, options: PipeOptions) -> D {
        pipe::pipe(self.clone(), target, options)
    }

    pub(crate) fn set_capacity_hook(&self, hook: impl Fn() + 'static) {
        *self.inner.capacity_hook.borrow_mut() = Some(Box::new(hook));
    }

    fn run_capacity_hook(&self) {
        if let Some(hook) = self.inner.capacity_hook.borrow().as_ref() {
            hook();
        }
    }

    fn start_flowing(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.state == ReadableState::Idle {
                st.state = ReadableState::Flowing;
            }
        }
        self.maybe_pull();
    }

    fn schedule_end(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.end_scheduled {
                return;
            }
            st.end_scheduled = true;
        }
        let this = self.clone();
        self.inner.runtime.next_tick(move || {
            this.inner.state.borrow_mut().state = ReadableState::Ended;
            debug!(stream = %this.id(), "end");
            this.inner.events.end.emit(());
            this.inner.events.close.emit(());
        });
    }

    fn maybe_pull(&self) {
        let requested = {
            let mut st = self.inner.state.borrow_mut();
            if !st.has_source
                || st.hit_eof
                || st.errored
                || st.pull_in_flight
                || st.state != ReadableState::Flowing
            {
                return;
            }
            let mut space = st.buffer.available_buffer_space();
            if st.buffer.is_empty() {
                // A consumer is waiting on an empty buffer
                space = space.max(1);
            }
            if space == 0 {
                return;
            }
            st.pull_in_flight = true;
            space
        };

        self.inner.runtime.begin_work();
        let this = self.clone();
        self.inner
            .runtime
            .next_tick(move || this.dispatch_pull(requested));
    }

    fn dispatch_pull(&self, requested: usize) {
        trace!(stream = %self.id(), requested, "pulling from source");
        let this = self.clone();
        let done: SourceYield<T> = Box::new(move |result| {
            let runtime = this.inner.runtime.clone();
            runtime.next_tick(move || {
                this.inner.runtime.end_work();
                this.on_pulled(result);
            });
        });

        let Ok(mut slot) = self.inner.source.try_borrow_mut() else {
            error!(stream = %self.id(), "source re-entered while producing, treating as end-of-input");
            done(Ok(None));
            return;
        };
        if let Some(source) = slot.as_mut() {
            source.next(requested, done);
            return;
        }
        drop(slot);
        warn!(stream = %self.id(), "pull without a source");
        done(Ok(None));
    }

    fn on_pulled(&self, result: SourceResult<T>) {
        self.inner.state.borrow_mut().pull_in_flight = false;
        match result {
            Ok(Some(items)) => {
                if !items.is_empty() {
                    self.push(Some(items));
                }
                self.maybe_pull();
            }
            Ok(None) => {
                self.push(None);
            }
            Err(e) => {
                // Equivalent to EOF for buffering: no further pulls
                self.inner.state.borrow_mut().errored = true;
                warn!(stream = %self.id(), error = %e, "source failed");
                self.inner.events.error.emit(e);
            }
        }
    }
}

impl<T> fmt::Debug for Readable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.borrow();
        write!(
            f,
            "Readable(id={}, state={:?}, buffered={}, eof={}, errored={})",
            self.inner.id,
            st.state,
            st.buffer.total_count(),
            st.hit_eof,
            st.errored
        )
    }
}
