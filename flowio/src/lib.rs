pub mod adapters;
pub mod capability;
pub mod duplex;
pub mod error;
pub mod idgen;
pub mod io;
pub mod listener;
pub mod pipe;
pub mod readable;
pub mod runtime;
pub mod writable;


// Re-export stream types for convenience
pub use duplex::{Duplex, DuplexOptions, Transform, TransformYield, Transformer};
pub use readable::{Readable, ReadableEvents, ReadableOptions, ReadableState};
pub use writable::{Writable, WritableEvents, WritableOptions};

// Re-export capabilities
pub use capability::{FinalizeYield, Source, SourceResult, SourceYield, Target, TargetYield};

// Re-export pipe types
pub use pipe::{pipe, PipeOptions, PipeSource, PipeTarget};

// Re-export runtime and errors
pub use error::{RuntimeError, StreamError};
pub use idgen::{IdGen, StreamId};
pub use runtime::{Completion, Runtime};

// Re-export buffer types
pub use io::{Brigade, Bucket};

// Re-export listener types
pub use listener::{ListenerId, ListenerSet, QueuePolicy};

// Re-export adapters
pub use adapters::{BlockingSource, CollectTarget, FnTarget, IterSource};
