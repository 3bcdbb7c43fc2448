//! Writable stream
//!
//! Buffered sink with high-water-mark flow control. Writes are queued in a
//! [`ListBuffer`] and flushed to the [`Target`] one brigade at a time:
//!
//! - `write` returns `false` once queued plus in-flight items reach the high
//!   water mark; the caller waits for `drain`.
//! - `cork` holds writes back, `uncork` flushes everything in one brigade.
//! - `end` flushes, runs `Target::finalize`, then emits `finish`.
//!
//! A failed target write leaves the stream errored: buffered data is
//! discarded, further writes are rejected, and `end` still reaches `finish`.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, error, trace, warn};

use crate::capability::{FinalizeYield, Target, TargetYield};
use crate::error::StreamError;
use crate::idgen::StreamId;
use crate::io::{Brigade, Bucket, ListBuffer, NodeCompletions};
use crate::listener::{ListenerId, ListenerSet, QueuePolicy, DEFAULT_MAX_QUEUE_LENGTH};
use crate::readable::DEFAULT_HIGH_WATER_MARK;
use crate::runtime::Runtime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritableOptions {
    pub high_water_mark: usize,
}

impl Default for WritableOptions {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

/// Listener sets of a writable
pub struct WritableEvents {
    pub drain: ListenerSet<()>,
    pub finish: ListenerSet<()>,
    pub close: ListenerSet<()>,
    /// A readable started piping into this stream
    pub pipe: ListenerSet<StreamId>,
    /// A readable stopped piping into this stream
    pub unpipe: ListenerSet<StreamId>,
    /// Shared with the readable half of a duplex
    pub error: Rc<ListenerSet<StreamError>>,
}

impl WritableEvents {
    fn new(runtime: &Runtime, error: Rc<ListenerSet<StreamError>>) -> Self {
        let signal = || QueuePolicy::coalescing(DEFAULT_MAX_QUEUE_LENGTH);
        Self {
            drain: ListenerSet::with_policy(runtime.clone(), "drain", signal()),
            finish: ListenerSet::with_policy(runtime.clone(), "finish", signal()),
            close: ListenerSet::with_policy(runtime.clone(), "close", signal()),
            pipe: ListenerSet::new(runtime.clone(), "pipe"),
            unpipe: ListenerSet::new(runtime.clone(), "unpipe"),
            error,
        }
    }
}

struct WriteState<T> {
    buffer: ListBuffer<T>,
    in_flight: usize,
    write_in_flight: bool,
    corked: bool,
    ending: bool,
    finalizing: bool,
    finished: bool,
    need_drain: bool,
    errored: bool,
}

impl<T> WriteState<T> {
    fn length(&self) -> usize {
        self.buffer.total_count() + self.in_flight
    }
}

struct WritableInner<T> {
    id: StreamId,
    runtime: Runtime,
    state: RefCell<WriteState<T>>,
    target: RefCell<Option<Box<dyn Target<T>>>>,
    events: WritableEvents,
    /// Extra backpressure condition; `false` means "report full"
    gate: RefCell<Option<Box<dyn Fn() -> bool>>>,
}

/// Writable stream handle. Clones share the same stream.
pub struct Writable<T> {
    inner: Rc<WritableInner<T>>,
}

impl<T> Clone for Writable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// Non-owning handle, used where the writable must not be kept alive
pub(crate) struct WeakWritable<T> {
    inner: Weak<WritableInner<T>>,
}

impl<T> WeakWritable<T> {
    pub(crate) fn upgrade(&self) -> Option<Writable<T>> {
        self.inner.upgrade().map(|inner| Writable { inner })
    }
}

impl<T: 'static> Writable<T> {
    #[must_use]
    pub fn new(
        runtime: &Runtime,
        options: WritableOptions,
        target: impl Target<T> + 'static,
    ) -> Self {
        let error = Rc::new(ListenerSet::new(runtime.clone(), "error"));
        Self::build(runtime, options, Box::new(target), error)
    }

    pub(crate) fn build(
        runtime: &Runtime,
        options: WritableOptions,
        target: Box<dyn Target<T>>,
        error: Rc<ListenerSet<StreamError>>,
    ) -> Self {
        let id = runtime.next_stream_id();
        trace!(stream = %id, hwm = options.high_water_mark, "writable created");
        Self {
            inner: Rc::new(WritableInner {
                id,
                runtime: runtime.clone(),
                state: RefCell::new(WriteState {
                    buffer: ListBuffer::new(options.high_water_mark),
                    in_flight: 0,
                    write_in_flight: false,
                    corked: false,
                    ending: false,
                    finalizing: false,
                    finished: false,
                    need_drain: false,
                    errored: false,
                }),
                target: RefCell::new(Some(target)),
                events: WritableEvents::new(runtime, error),
                gate: RefCell::new(None),
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
    pub fn events(&self) -> &WritableEvents {
        &self.inner.events
    }

    /// Queued plus in-flight items
    #[must_use]
    pub fn writable_length(&self) -> usize {
        self.inner.state.borrow().length()
    }

    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.inner.state.borrow().buffer.high_water_mark()
    }

    #[must_use]
    pub fn is_corked(&self) -> bool {
        self.inner.state.borrow().corked
    }

    /// `end()` was called
    #[must_use]
    pub fn is_ending(&self) -> bool {
        self.inner.state.borrow().ending
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.state.borrow().finished
    }

    #[must_use]
    pub fn is_errored(&self) -> bool {
        self.inner.state.borrow().errored
    }

    /// A `write` returned `false` and `drain` has not been emitted yet
    #[must_use]
    pub fn needs_drain(&self) -> bool {
        self.inner.state.borrow().need_drain
    }

    /// Queue one chunk. Returns `false` when the caller should wait for
    /// `drain`.
    pub fn write(&self, chunk: Bucket<T>) -> bool {
        self.enqueue(vec![chunk], None)
    }

    /// Queue one chunk; `on_flushed` runs once the target accepted it
    pub fn write_with(&self, chunk: Bucket<T>, on_flushed: impl FnOnce() + 'static) -> bool {
        self.enqueue(vec![chunk], Some(Box::new(on_flushed)))
    }

    /// Queue a brigade as a single node
    pub fn writev(&self, brigade: Brigade<T>) -> bool {
        self.enqueue(brigade, None)
    }

    fn enqueue(&self, brigade: Brigade<T>, done: Option<Box<dyn FnOnce()>>) -> bool {
        let rejected = {
            let mut st = self.inner.state.borrow_mut();
            if st.ending {
                Some(StreamError::WriteAfterEnd)
            } else if st.errored {
                Some(StreamError::Errored)
            } else {
                st.buffer.enqueue(brigade, done);
                None
            }
        };
        if let Some(e) = rejected {
            warn!(stream = %self.id(), error = %e, "write rejected");
            self.inner.events.error.emit(e);
            return false;
        }

        self.flush();
        self.report_capacity()
    }

    fn gate_open(&self) -> bool {
        self.inner.gate.borrow().as_ref().map_or(true, |gate| gate())
    }

    fn report_capacity(&self) -> bool {
        let gate_open = self.gate_open();
        let mut st = self.inner.state.borrow_mut();
        let has_room = st.length() < st.buffer.high_water_mark() && gate_open;
        if !has_room {
            st.need_drain = true;
        }
        has_room
    }

    /// Hold writes back until `uncork`
    pub fn cork(&self) {
        self.inner.state.borrow_mut().corked = true;
    }

    /// Flush everything written while corked as one brigade
    pub fn uncork(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            if !st.corked {
                return;
            }
            st.corked = false;
        }
        self.flush();
        self.maybe_finish();
    }

    /// No more writes; emits `finish` once everything reached the target
    pub fn end(&self, last: Option<Bucket<T>>) {
        if self.is_ending() {
            warn!(stream = %self.id(), "end called twice");
            return;
        }
        if let Some(chunk) = last {
            self.write(chunk);
        }
        {
            let mut st = self.inner.state.borrow_mut();
            st.ending = true;
            st.corked = false;
        }
        debug!(stream = %self.id(), "ending");
        self.flush();
        self.maybe_finish();
    }

    fn flush(&self) {
        let (brigade, completions, count) = {
            let mut st = self.inner.state.borrow_mut();
            if st.write_in_flight || st.corked || st.errored || st.buffer.is_empty() {
                return;
            }
            let drained = st.buffer.dequeue_all();
            let count = drained.count;
            st.write_in_flight = true;
            st.in_flight = count;
            let (brigade, completions) = drained.into_parts();
            (brigade, completions, count)
        };

        trace!(stream = %self.id(), items = count, "flushing to target");
        self.inner.runtime.begin_work();
        let this = self.clone();
        let done: TargetYield = Box::new(move |result| {
            let runtime = this.inner.runtime.clone();
            runtime.next_tick(move || {
                this.inner.runtime.end_work();
                this.on_written(result, completions, count);
            });
        });

        let Ok(mut slot) = self.inner.target.try_borrow_mut() else {
            error!(stream = %self.id(), "target re-entered while writing");
            done(Err(StreamError::target_msg("target re-entered while writing")));
            return;
        };
        match slot.as_mut() {
            Some(target) => target.writev(brigade, done),
            None => done(Ok(count)),
        }
    }

    fn on_written(
        &self,
        result: Result<usize, StreamError>,
        completions: NodeCompletions,
        count: usize,
    ) {
        {
            let mut st = self.inner.state.borrow_mut();
            st.write_in_flight = false;
            st.in_flight = 0;
        }
        match result {
            Ok(written) => {
                if written != count {
                    debug!(stream = %self.id(), written, count, "target reported a partial write");
                }
                completions.complete();
            }
            Err(e) => {
                completions.discard();
                let discarded = {
                    let mut st = self.inner.state.borrow_mut();
                    st.errored = true;
                    st.buffer.dequeue_all()
                };
                let (_, callbacks) = discarded.into_parts();
                callbacks.discard();
                warn!(stream = %self.id(), error = %e, "target failed");
                self.inner.events.error.emit(e);
            }
        }

        self.flush();
        self.check_drain();
        self.maybe_finish();
    }

    /// Emit `drain` if a writer is waiting and there is room again
    pub(crate) fn check_drain(&self) {
        {
            let st = self.inner.state.borrow();
            let length = st.length();
            // An empty buffer always drains, also with a zero high water mark
            let has_room = length == 0 || length < st.buffer.high_water_mark();
            if !st.need_drain || st.errored || !has_room {
                return;
            }
        }
        if !self.gate_open() {
            return;
        }
        self.inner.state.borrow_mut().need_drain = false;
        trace!(stream = %self.id(), "drain");
        self.inner.events.drain.emit(());
    }

    fn maybe_finish(&self) {
        let errored = {
            let mut st = self.inner.state.borrow_mut();
            if !st.ending || st.finalizing || st.write_in_flight || !st.buffer.is_empty() {
                return;
            }
            st.finalizing = true;
            st.errored
        };

        self.inner.runtime.begin_work();
        let this = self.clone();
        let done: FinalizeYield = Box::new(move |result| {
            let runtime = this.inner.runtime.clone();
            runtime.next_tick(move || {
                this.inner.runtime.end_work();
                this.on_finalized(result);
            });
        });

        if errored {
            done(Ok(()));
            return;
        }
        let Ok(mut slot) = self.inner.target.try_borrow_mut() else {
            error!(stream = %self.id(), "target re-entered while finalizing");
            done(Ok(()));
            return;
        };
        match slot.as_mut() {
            Some(target) => target.finalize(done),
            None => done(Ok(())),
        }
    }

    fn on_finalized(&self, result: Result<(), StreamError>) {
        if let Err(e) = result {
            warn!(stream = %self.id(), error = %e, "finalize failed");
            self.inner.state.borrow_mut().errored = true;
            self.inner.events.error.emit(e);
        }
        self.inner.state.borrow_mut().finished = true;
        debug!(stream = %self.id(), "finish");
        self.inner.events.finish.emit(());
        self.inner.events.close.emit(());
    }

    pub fn on_drain(&self, callback: impl FnMut(()) + 'static) -> ListenerId {
        self.inner.events.drain.on(callback)
    }

    pub fn once_drain(&self, callback: impl FnOnce(()) + 'static) -> ListenerId {
        self.inner.events.drain.once(callback)
    }

    pub fn on_finish(&self, callback: impl FnMut(()) + 'static) -> ListenerId {
        self.inner.events.finish.on(callback)
    }

    pub fn on_close(&self, callback: impl FnMut(()) + 'static) -> ListenerId {
        self.inner.events.close.on(callback)
    }

    pub fn on_error(&self, callback: impl FnMut(StreamError) + 'static) -> ListenerId {
        self.inner.events.error.on(callback)
    }

    pub fn emit_error(&self, error: StreamError) {
        self.inner.events.error.emit(error);
    }

    pub(crate) fn downgrade(&self) -> WeakWritable<T> {
        WeakWritable {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub(crate) fn set_gate(&self, gate: impl Fn() -> bool + 'static) {
        *self.inner.gate.borrow_mut() = Some(Box::new(gate));
    }
}

impl<T> fmt::Debug for Writable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.borrow();
        write!(
            f,
            "Writable(id={}, length={}, corked={}, ending={}, finished={}, errored={})",
            self.inner.id,
            st.length(),
            st.corked,
            st.ending,
            st.finished,
            st.errored
        )
    }
}
