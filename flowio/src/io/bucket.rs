//! Bucket/brigade buffers
//!
//! A *bucket* is one chunk of items, a *brigade* is the ordered list of
//! buckets handed to a single write call. Two queue flavours are provided:
//!
//! - [`ArrayBuffer`]: read-side queue, dequeues an exact item count and
//!   splits buckets when the count falls inside one.
//! - [`ListBuffer`]: write-side queue of nodes, each with an optional
//!   completion callback, drained in whole-node units.
//!
//! Both keep `total_count` equal to the sum of the queued bucket lengths.

use std::collections::VecDeque;
use std::fmt;

/// One chunk of items
pub type Bucket<T> = Vec<T>;

/// Ordered list of chunks, the unit of a single write
pub type Brigade<T> = Vec<Bucket<T>>;

/// Callback fired once a node of a [`ListBuffer`] has been consumed
pub type NodeCallback = Box<dyn FnOnce()>;

/// Read-side buffer with count-based dequeue
pub struct ArrayBuffer<T> {
    buckets: VecDeque<Bucket<T>>,
    total_count: usize,
    high_water_mark: usize,
}

impl<T> ArrayBuffer<T> {
    #[must_use]
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            buckets: VecDeque::new(),
            total_count: 0,
            high_water_mark,
        }
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.total_count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_count == 0
    }

    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    pub fn set_high_water_mark(&mut self, high_water_mark: usize) {
        self.high_water_mark = high_water_mark;
    }

    /// `max(0, highWaterMark - totalCount)`
    #[must_use]
    pub fn available_buffer_space(&self) -> usize {
        self.high_water_mark.saturating_sub(self.total_count)
    }

    /// Number of queued buckets (not items)
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Queue a single bucket. Empty buckets are skipped.
    pub fn enqueue_bucket(&mut self, bucket: Bucket<T>, front: bool) {
        if bucket.is_empty() {
            return;
        }
        self.total_count += bucket.len();
        if front {
            self.buckets.push_front(bucket);
        } else {
            self.buckets.push_back(bucket);
        }
    }

    /// Queue every non-empty bucket of the brigade, keeping brigade order
    /// also when prepending.
    pub fn enqueue(&mut self, brigade: Brigade<T>, front: bool) {
        if front {
            for bucket in brigade.into_iter().rev() {
                self.enqueue_bucket(bucket, true);
            }
        } else {
            for bucket in brigade {
                self.enqueue_bucket(bucket, false);
            }
        }
    }

    /// Remove exactly `count` items, splitting a bucket if needed.
    ///
    /// Callers clamp `count` to `total_count`; a larger value is reported
    /// and clamped.
    pub fn dequeue(&mut self, count: usize) -> Bucket<T> {
        let count = if count > self.total_count {
            log::error!(
                "ArrayBuffer::dequeue: requested {count} items, only {} queued",
                self.total_count
            );
            self.total_count
        } else {
            count
        };

        // Fast path: the first bucket is exactly what was asked for
        if self.buckets.front().is_some_and(|b| b.len() == count) {
            if let Some(bucket) = self.buckets.pop_front() {
                self.total_count -= count;
                return bucket;
            }
        }

        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            let Some(mut bucket) = self.buckets.pop_front() else {
                break;
            };
            let needed = count - out.len();
            if bucket.len() > needed {
                let rest = bucket.split_off(needed);
                self.buckets.push_front(rest);
            }
            out.append(&mut bucket);
        }
        self.total_count -= out.len();
        out
    }

    /// Remove every queued bucket, preserving bucket boundaries
    pub fn dequeue_all(&mut self) -> Brigade<T> {
        self.total_count = 0;
        self.buckets.drain(..).collect()
    }
}

impl<T> fmt::Debug for ArrayBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ArrayBuffer(buckets={}, total={}, hwm={})",
            self.buckets.len(),
            self.total_count,
            self.high_water_mark
        )
    }
}

struct BufferNode<T> {
    brigade: Brigade<T>,
    count: usize,
    done: Option<NodeCallback>,
}

/// Write-side buffer: a FIFO of nodes, each owning a brigade and an
/// optional completion callback
pub struct ListBuffer<T> {
    nodes: VecDeque<BufferNode<T>>,
    total_count: usize,
    high_water_mark: usize,
}

impl<T> ListBuffer<T> {
    #[must_use]
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            nodes: VecDeque::new(),
            total_count: 0,
            high_water_mark,
        }
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.total_count
    }

    /// No nodes queued. A node may hold zero items but still carry a callback.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    pub fn set_high_water_mark(&mut self, high_water_mark: usize) {
        self.high_water_mark = high_water_mark;
    }

    #[must_use]
    pub fn available_buffer_space(&self) -> usize {
        self.high_water_mark.saturating_sub(self.total_count)
    }

    fn make_node(brigade: Brigade<T>, done: Option<NodeCallback>) -> Option<BufferNode<T>> {
        let brigade: Brigade<T> = brigade.into_iter().filter(|b| !b.is_empty()).collect();
        if brigade.is_empty() && done.is_none() {
            return None;
        }
        let count = brigade.iter().map(Vec::len).sum();
        Some(BufferNode {
            brigade,
            count,
            done,
        })
    }

    /// Append a node. Empty buckets are dropped; a node with no items is
    /// kept only if it carries a callback.
    pub fn enqueue(&mut self, brigade: Brigade<T>, done: Option<NodeCallback>) {
        if let Some(node) = Self::make_node(brigade, done) {
            self.total_count += node.count;
            self.nodes.push_back(node);
        }
    }

    /// Prepend a node
    pub fn enqueue_front(&mut self, brigade: Brigade<T>, done: Option<NodeCallback>) {
        if let Some(node) = Self::make_node(brigade, done) {
            self.total_count += node.count;
            self.nodes.push_front(node);
        }
    }

    /// Take every node. The callbacks are returned, not invoked: the caller
    /// fires them once the items are actually consumed.
    pub fn dequeue_all(&mut self) -> Drained<T> {
        let mut drained = Drained {
            brigade: Vec::new(),
            count: self.total_count,
            callbacks: Vec::new(),
        };
        for node in self.nodes.drain(..) {
            drained.brigade.extend(node.brigade);
            if let Some(done) = node.done {
                drained.callbacks.push(done);
            }
        }
        self.total_count = 0;
        drained
    }
}

impl<T> fmt::Debug for ListBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ListBuffer(nodes={}, total={}, hwm={})",
            self.nodes.len(),
            self.total_count,
            self.high_water_mark
        )
    }
}

/// Contents taken out of a [`ListBuffer`]
pub struct Drained<T> {
    pub brigade: Brigade<T>,
    pub count: usize,
    callbacks: Vec<NodeCallback>,
}

impl<T> Drained<T> {
    /// Split into the brigade and a handle for the node callbacks
    #[must_use]
    pub fn into_parts(self) -> (Brigade<T>, NodeCompletions) {
        (self.brigade, NodeCompletions(self.callbacks))
    }
}

/// Node callbacks of a drained [`ListBuffer`], in enqueue order
pub struct NodeCompletions(Vec<NodeCallback>);

impl NodeCompletions {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Invoke every callback, oldest first
    pub fn complete(self) {
        for done in self.0 {
            done();
        }
    }

    /// Drop the callbacks without invoking them
    pub fn discard(self) {
        if !self.0.is_empty() {
            log::debug!("discarding {} write callbacks", self.0.len());
        }
    }
}
