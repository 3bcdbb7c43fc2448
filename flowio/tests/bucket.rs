//! Integration tests for the bucket buffers

use std::cell::RefCell;
use std::rc::Rc;

use flowio::io::{ArrayBuffer, ListBuffer};

#[test]
fn test_total_count_tracks_outstanding_items() {
    let mut buffer = ArrayBuffer::new(8);
    let mut expected: Vec<u32> = Vec::new();
    let mut next = 0u32;

    // Deterministic mix of enqueues and clamped dequeues
    for step in 0..50usize {
        if step % 3 == 2 {
            let count = (step % 5).min(buffer.total_count());
            let got = buffer.dequeue(count);
            assert_eq!(got, expected.drain(..count).collect::<Vec<_>>());
        } else {
            let bucket: Vec<u32> = (next..next + (step % 4) as u32).collect();
            next += bucket.len() as u32;
            expected.extend(&bucket);
            buffer.enqueue_bucket(bucket, false);
        }
        assert_eq!(buffer.total_count(), expected.len());
    }
}

#[test]
fn test_dequeue_splits_buckets() {
    let mut buffer = ArrayBuffer::new(16);
    buffer.enqueue(vec![vec![1, 2, 3], vec![4, 5]], false);

    assert_eq!(buffer.dequeue(2), vec![1, 2]);
    assert_eq!(buffer.bucket_count(), 2);
    assert_eq!(buffer.dequeue(2), vec![3, 4]);
    assert_eq!(buffer.dequeue_all(), vec![vec![5]]);
    assert!(buffer.is_empty());
}

#[test]
fn test_front_enqueue_keeps_brigade_order() {
    let mut buffer = ArrayBuffer::new(16);
    buffer.enqueue_bucket(vec!['c'], false);
    buffer.enqueue(vec![vec!['a'], vec![], vec!['b']], true);

    assert_eq!(buffer.bucket_count(), 3);
    assert_eq!(buffer.dequeue(3), vec!['a', 'b', 'c']);
}

#[test]
fn test_dequeue_more_than_queued_is_clamped() {
    let mut buffer = ArrayBuffer::new(4);
    buffer.enqueue_bucket(vec![1, 2], false);
    assert_eq!(buffer.dequeue(10), vec![1, 2]);
    assert_eq!(buffer.total_count(), 0);
}

#[test]
fn test_available_space_saturates() {
    let mut buffer = ArrayBuffer::new(2);
    buffer.enqueue_bucket(vec![1, 2, 3], false);
    assert_eq!(buffer.available_buffer_space(), 0);
    buffer.set_high_water_mark(5);
    assert_eq!(buffer.available_buffer_space(), 2);
}

#[test]
fn test_list_buffer_runs_node_callbacks_in_order() {
    let order = Rc::new(RefCell::new(Vec::new()));
    let mut buffer = ListBuffer::new(16);

    for name in ["first", "second"] {
        let order = Rc::clone(&order);
        buffer.enqueue(
            vec![vec![name.len()]],
            Some(Box::new(move || order.borrow_mut().push(name))),
        );
    }
    let front = Rc::clone(&order);
    buffer.enqueue_front(vec![], Some(Box::new(move || front.borrow_mut().push("front"))));
    assert_eq!(buffer.node_count(), 3);
    assert_eq!(buffer.total_count(), 2);

    let drained = buffer.dequeue_all();
    assert_eq!(drained.count, 2);
    assert!(buffer.is_empty());

    let (brigade, callbacks) = drained.into_parts();
    assert_eq!(brigade, vec![vec![5], vec![6]]);
    assert_eq!(callbacks.len(), 3);
    callbacks.complete();
    assert_eq!(*order.borrow(), vec!["front", "first", "second"]);
}

#[test]
fn test_list_buffer_discarded_callbacks_never_run() {
    let ran = Rc::new(RefCell::new(false));
    let mut buffer = ListBuffer::new(4);
    let flag = Rc::clone(&ran);
    buffer.enqueue(vec![vec![1]], Some(Box::new(move || *flag.borrow_mut() = true)));
    buffer.enqueue(vec![], None);
    assert_eq!(buffer.node_count(), 1);

    let (_, callbacks) = buffer.dequeue_all().into_parts();
    callbacks.discard();
    assert!(!*ran.borrow());
}
