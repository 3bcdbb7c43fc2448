//! Duplex and Transform streams
//!
//! A [`Duplex`] pairs an input [`Writable`] with an output [`Readable`].
//! The halves have their own buffers and high water marks and share one
//! `error` listener set, so an error on either half is seen by pipes on
//! both sides.
//!
//! A [`Transform`] is a duplex whose input target feeds a [`Transformer`]
//! that pushes to the output half. The input reports "full" while the
//! output is paused or at its high water mark, and re-emits `drain` once
//! output space frees up.

use std::cell::RefCell;
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

use tracing::{error, trace};

use crate::capability::{FinalizeYield, Source, Target, TargetYield};
use crate::error::StreamError;
use crate::io::{Brigade, Bucket};
use crate::listener::{ListenerId, ListenerSet};
use crate::pipe::{self, PipeOptions, PipeSource, PipeTarget};
use crate::readable::{Readable, ReadableOptions};
use crate::runtime::Runtime;
use crate::writable::{Writable, WritableOptions};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DuplexOptions {
    pub readable: ReadableOptions,
    pub writable: WritableOptions,
}

/// Input and output halves of a bidirectional stream
pub struct Duplex<I, O> {
    input: Writable<I>,
    output: Readable<O>,
}

impl<I, O> Clone for Duplex<I, O> {
    fn clone(&self) -> Self {
        Self {
            input: self.input.clone(),
            output: self.output.clone(),
        }
    }
}

impl<I: 'static, O: 'static> Duplex<I, O> {
    /// Duplex with a push-driven output half
    #[must_use]
    pub fn new(runtime: &Runtime, options: DuplexOptions, target: impl Target<I> + 'static) -> Self {
        Self::build(runtime, options, Box::new(target), None)
    }

    /// Duplex whose output half pulls from `source`
    #[must_use]
    pub fn with_source(
        runtime: &Runtime,
        options: DuplexOptions,
        target: impl Target<I> + 'static,
        source: impl Source<O> + 'static,
    ) -> Self {
        Self::build(runtime, options, Box::new(target), Some(Box::new(source)))
    }

    fn build(
        runtime: &Runtime,
        options: DuplexOptions,
        target: Box<dyn Target<I>>,
        source: Option<Box<dyn Source<O>>>,
    ) -> Self {
        let error = Rc::new(ListenerSet::new(runtime.clone(), "error"));
        let output = Readable::build(runtime, options.readable, source, Rc::clone(&error));
        let input = Writable::build(runtime, options.writable, target, error);
        Self { input, output }
    }

    /// The input (writable) half
    #[must_use]
    pub fn writable(&self) -> &Writable<I> {
        &self.input
    }

    /// The output (readable) half
    #[must_use]
    pub fn readable(&self) -> &Readable<O> {
        &self.output
    }

    pub fn write(&self, chunk: Bucket<I>) -> bool {
        self.input.write(chunk)
    }

    pub fn writev(&self, brigade: Brigade<I>) -> bool {
        self.input.writev(brigade)
    }

    pub fn end(&self, last: Option<Bucket<I>>) {
        self.input.end(last);
    }

    pub fn cork(&self) {
        self.input.cork();
    }

    pub fn uncork(&self) {
        self.input.uncork();
    }

    pub fn push(&self, chunk: Option<Bucket<O>>) -> bool {
        self.output.push(chunk)
    }

    pub fn read(&self, count: Option<usize>) -> Option<Bucket<O>> {
        self.output.read(count)
    }

    pub fn pause(&self) {
        self.output.pause();
    }

    pub fn resume(&self) {
        self.output.resume();
    }

    pub fn on_readable(&self, callback: impl FnMut(()) + 'static) -> ListenerId {
        self.output.on_readable(callback)
    }

    pub fn on_end(&self, callback: impl FnMut(()) + 'static) -> ListenerId {
        self.output.on_end(callback)
    }

    pub fn on_drain(&self, callback: impl FnMut(()) + 'static) -> ListenerId {
        self.input.on_drain(callback)
    }

    pub fn on_finish(&self, callback: impl FnMut(()) + 'static) -> ListenerId {
        self.input.on_finish(callback)
    }

    /// Errors of both halves
    pub fn on_error(&self, callback: impl FnMut(StreamError) + 'static) -> ListenerId {
        self.output.on_error(callback)
    }

    /// Pipe the output half into `target`
    pub fn pipe<D: PipeTarget<O>>(&self, target: D) -> D {
        pipe::pipe(self.output.clone(), target, PipeOptions::default())
    }

    pub fn pipe_with<D: PipeTarget<O>>(&self, target: D, options: PipeOptions) -> D {
        pipe::pipe(self.output.clone(), target, options)
    }
}

impl<I, O> fmt::Debug for Duplex<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Duplex")
            .field("input", &self.input)
            .field("output", &self.output)
            .finish()
    }
}

impl<I: 'static, O: 'static> PipeTarget<I> for Duplex<I, O> {
    fn as_writable(&self) -> &Writable<I> {
        &self.input
    }
}

impl<I: 'static, O: 'static> PipeSource<O> for Duplex<I, O> {
    fn as_readable(&self) -> &Readable<O> {
        &self.output
    }
}

// ============================================================================
// Transform
// ============================================================================

/// Continuation of [`Transformer`] callbacks. Must be called exactly once.
pub type TransformYield = Box<dyn FnOnce(Result<(), StreamError>)>;

/// User logic of a [`Transform`]
pub trait Transformer<I, O> {
    /// Consume one input chunk, pushing any number of output chunks
    fn transform(&mut self, chunk: Bucket<I>, output: &Readable<O>, done: TransformYield);

    /// Emit trailing output after the last input chunk
    fn flush(&mut self, output: &Readable<O>, done: TransformYield) {
        let _ = output;
        done(Ok(()));
    }
}

type SharedTransformer<I, O> = Rc<RefCell<Box<dyn Transformer<I, O>>>>;

/// Input target of a transform: runs the transformer chunk by chunk
struct TransformTarget<I, O> {
    transformer: SharedTransformer<I, O>,
    output: Readable<O>,
}

impl<I: 'static, O: 'static> Target<I> for TransformTarget<I, O> {
    fn writev(&mut self, brigade: Brigade<I>, done: TargetYield) {
        run_chunks(
            Rc::clone(&self.transformer),
            self.output.clone(),
            brigade.into_iter(),
            0,
            done,
        );
    }

    fn finalize(&mut self, done: FinalizeYield) {
        let output = self.output.clone();
        let flushed: TransformYield = Box::new(move |result| {
            if result.is_ok() {
                output.push(None);
            }
            done(result);
        });
        let Ok(mut transformer) = self.transformer.try_borrow_mut() else {
            error!(stream = %self.output.id(), "transformer re-entered while flushing");
            flushed(Err(StreamError::transform_msg("transformer re-entered")));
            return;
        };
        transformer.flush(&self.output, flushed);
    }
}

/// Feed chunks to the transformer one at a time, one tick apart
fn run_chunks<I: 'static, O: 'static>(
    transformer: SharedTransformer<I, O>,
    output: Readable<O>,
    mut chunks: std::vec::IntoIter<Bucket<I>>,
    written: usize,
    done: TargetYield,
) {
    let Some(chunk) = chunks.next() else {
        done(Ok(written));
        return;
    };
    let len = chunk.len();
    let runtime = output.runtime().clone();
    let next_transformer = Rc::clone(&transformer);
    let next_output = output.clone();
    let step: TransformYield = Box::new(move |result| match result {
        Ok(()) => runtime.next_tick(move || {
            run_chunks(next_transformer, next_output, chunks, written + len, done);
        }),
        Err(e) => done(Err(e)),
    });

    let Ok(mut slot) = transformer.try_borrow_mut() else {
        error!(stream = %output.id(), "transformer re-entered");
        step(Err(StreamError::transform_msg("transformer re-entered")));
        return;
    };
    trace!(stream = %output.id(), items = len, "transform");
    slot.transform(chunk, &output, step);
}

/// Duplex whose output is computed from its input
pub struct Transform<I, O> {
    duplex: Duplex<I, O>,
}

impl<I, O> Clone for Transform<I, O> {
    fn clone(&self) -> Self {
        Self {
            duplex: self.duplex.clone(),
        }
    }
}

impl<I: 'static, O: 'static> Transform<I, O> {
    #[must_use]
    pub fn new(
        runtime: &Runtime,
        options: DuplexOptions,
        transformer: impl Transformer<I, O> + 'static,
    ) -> Self {
        let error = Rc::new(ListenerSet::new(runtime.clone(), "error"));
        let output = Readable::build(runtime, options.readable, None, Rc::clone(&error));
        let transformer: Box<dyn Transformer<I, O>> = Box::new(transformer);
        let target = TransformTarget {
            transformer: Rc::new(RefCell::new(transformer)),
            output: output.clone(),
        };
        let input = Writable::build(runtime, options.writable, Box::new(target), error);

        let gate_output = output.clone();
        input.set_gate(move || {
            let buffered = gate_output.buffered();
            !gate_output.is_paused() && (buffered == 0 || buffered < gate_output.high_water_mark())
        });
        let weak_input = input.downgrade();
        output.set_capacity_hook(move || {
            if let Some(input) = weak_input.upgrade() {
                input.check_drain();
            }
        });

        Self {
            duplex: Duplex { input, output },
        }
    }

    /// Transform applying `f` to every item
    #[must_use]
    pub fn map(runtime: &Runtime, f: impl FnMut(I) -> O + 'static) -> Self {
        Self::new(runtime, DuplexOptions::default(), MapTransformer { f })
    }
}

impl<I, O> Deref for Transform<I, O> {
    type Target = Duplex<I, O>;

    fn deref(&self) -> &Duplex<I, O> {
        &self.duplex
    }
}

impl<I, O> fmt::Debug for Transform<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Transform").field(&self.duplex).finish()
    }
}

impl<I: 'static, O: 'static> PipeTarget<I> for Transform<I, O> {
    fn as_writable(&self) -> &Writable<I> {
        &self.duplex.input
    }
}

impl<I: 'static, O: 'static> PipeSource<O> for Transform<I, O> {
    fn as_readable(&self) -> &Readable<O> {
        &self.duplex.output
    }
}

struct MapTransformer<F> {
    f: F,
}

impl<I, O, F> Transformer<I, O> for MapTransformer<F>
where
    O: 'static,
    F: FnMut(I) -> O,
{
    fn transform(&mut self, chunk: Bucket<I>, output: &Readable<O>, done: TransformYield) {
        if !chunk.is_empty() {
            let mapped: Bucket<O> = chunk.into_iter().map(&mut self.f).collect();
            output.push(Some(mapped));
        }
        done(Ok(()));
    }
}
