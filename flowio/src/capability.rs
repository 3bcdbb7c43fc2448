//! Source / Target capabilities
//!
//! The only extension points of the engine. A transport implements
//! [`Source`] to feed a `Readable` and [`Target`] to drain a `Writable`.
//! Both are callback based and may finish on another thread by way of a
//! `runtime::Completion`; the stream always handles the result on its serial
//! queue.

use crate::error::StreamError;
use crate::io::Brigade;

/// Result of one `Source::next` call: items, `Ok(None)` for end-of-input,
/// or an error
pub type SourceResult<T> = Result<Option<Vec<T>>, StreamError>;

/// Continuation passed to `Source::next`. Must be called exactly once.
pub type SourceYield<T> = Box<dyn FnOnce(SourceResult<T>)>;

/// Continuation passed to `Target::writev`, reporting the number of items
/// written. Must be called exactly once.
pub type TargetYield = Box<dyn FnOnce(Result<usize, StreamError>)>;

/// Continuation passed to `Target::finalize`
pub type FinalizeYield = Box<dyn FnOnce(Result<(), StreamError>)>;

/// On-demand producer behind a `Readable`
pub trait Source<T> {
    /// Produce up to `requested` items and hand them to `done`
    fn next(&mut self, requested: usize, done: SourceYield<T>);
}

/// On-demand consumer behind a `Writable`
pub trait Target<T> {
    /// Consume the whole brigade and report through `done`
    fn writev(&mut self, brigade: Brigade<T>, done: TargetYield);

    /// Called once after the last write and before `finish`
    fn finalize(&mut self, done: FinalizeYield) {
        done(Ok(()));
    }
}

impl<T, F> Source<T> for F
where
    F: FnMut(usize, SourceYield<T>),
{
    fn next(&mut self, requested: usize, done: SourceYield<T>) {
        self(requested, done);
    }
}
