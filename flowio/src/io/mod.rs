//! Buffering primitives for streams
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  Readable / Writable (flow control) │
//! │  - high water mark                  │
//! │  - readable / drain events          │
//! └─────────────────────────────────────┘
//!          ▲                 ▲
//!          │ read side       │ write side
//!          ▼                 ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │  ArrayBuffer    │ │  ListBuffer     │
//! │  - dequeue(n)   │ │  - dequeue_all  │
//! │  - front insert │ │  - node cbs     │
//! └─────────────────┘ └─────────────────┘
//! ```

pub mod bucket;

pub use bucket::{
    ArrayBuffer, Brigade, Bucket, Drained, ListBuffer, NodeCallback, NodeCompletions,
};
