mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{boom, init_tracing, Counter, DeferredTarget};
use flowio::{
    BlockingSource, CollectTarget, FnTarget, IterSource, PipeOptions, Readable, ReadableOptions,
    Runtime, SourceResult, SourceYield, StreamError, StreamId, Transform, Writable,
    WritableOptions,
};

fn collector<T: 'static>(rt: &Runtime, high_water_mark: usize) -> (Writable<T>, CollectTarget<T>) {
    let target = CollectTarget::new();
    let w = Writable::new(rt, WritableOptions { high_water_mark }, target.clone());
    (w, target)
}

fn error_log<T: 'static>(w: &Writable<T>) -> Rc<RefCell<Vec<StreamError>>> {
    let errors = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&errors);
    w.on_error(move |e| sink.borrow_mut().push(e));
    errors
}

/// Yields `first` once, then fails
fn failing_after(first: Vec<u32>) -> impl FnMut(usize, SourceYield<u32>) {
    let mut first = Some(first);
    move |_requested, done| match first.take() {
        Some(items) => done(Ok(Some(items))),
        None => done(Err(boom())),
    }
}

async fn pipe_sequence(n: u32) {
    init_tracing();
    let rt = Runtime::new();
    let r = Readable::with_source(&rt, ReadableOptions::default(), IterSource::new(0..n));
    let (w, target) = collector(&rt, 16);
    let finishes = Counter::new();
    w.on_finish(finishes.listener());

    r.pipe(w.clone());
    rt.run().await.unwrap();

    assert_eq!(target.items(), (0..n).collect::<Vec<_>>());
    assert_eq!(finishes.get(), 1);
    assert_eq!(target.finalize_calls(), 1);
    rt.teardown().unwrap();
}

#[tokio::test]
async fn test_pipe_preserves_order_empty() {
    pipe_sequence(0).await;
}

#[tokio::test]
async fn test_pipe_preserves_order_single() {
    pipe_sequence(1).await;
}

#[tokio::test]
async fn test_pipe_preserves_order_thousand() {
    pipe_sequence(1000).await;
}

#[tokio::test]
async fn test_pipe_scenario_high_water_mark_one() {
    init_tracing();
    let rt = Runtime::new();
    let r = Readable::new(&rt, ReadableOptions { high_water_mark: 1 });
    r.push(Some(vec!["a"]));
    r.push(Some(vec!["b"]));
    r.push(Some(vec!["c"]));
    r.push(None);

    let (w, target) = collector(&rt, 1);
    let finishes = Counter::new();
    w.on_finish(finishes.listener());
    r.pipe(w);
    rt.run().await.unwrap();

    assert_eq!(target.items(), vec!["a", "b", "c"]);
    assert_eq!(finishes.get(), 1);
}

#[tokio::test]
async fn test_pipe_waits_for_drain_with_slow_target() {
    init_tracing();
    let rt = Runtime::new();
    let r = Readable::with_source(
        &rt,
        ReadableOptions { high_water_mark: 4 },
        IterSource::new(0..200),
    );
    let (target, items) = DeferredTarget::new(&rt);
    let w = Writable::new(&rt, WritableOptions { high_water_mark: 2 }, target);
    let drains = Counter::new();
    w.on_drain(drains.listener());
    let finishes = Counter::new();
    w.on_finish(finishes.listener());

    r.pipe(w);
    rt.run().await.unwrap();

    assert_eq!(*items.borrow(), (0..200).collect::<Vec<_>>());
    assert!(drains.get() > 0);
    assert_eq!(finishes.get(), 1);
    rt.teardown().unwrap();
}

#[tokio::test]
async fn test_pipe_emits_pipe_and_unpipe_on_target() {
    let rt = Runtime::new();
    let r = Readable::with_source(&rt, ReadableOptions::default(), IterSource::new(0..3));
    let (w, _target) = collector(&rt, 16);
    let piped = Rc::new(RefCell::new(Vec::<StreamId>::new()));
    let unpiped = Rc::new(RefCell::new(Vec::<StreamId>::new()));
    let p = Rc::clone(&piped);
    w.events().pipe.on(move |id| p.borrow_mut().push(id));
    let u = Rc::clone(&unpiped);
    w.events().unpipe.on(move |id| u.borrow_mut().push(id));

    r.pipe(w.clone());
    rt.run().await.unwrap();

    assert_eq!(*piped.borrow(), vec![r.id()]);
    assert_eq!(*unpiped.borrow(), vec![r.id()]);
}

#[tokio::test]
async fn test_pipe_detaches_its_listeners_at_end() {
    let rt = Runtime::new();
    let r = Readable::with_source(&rt, ReadableOptions::default(), IterSource::new(0..50));
    let (w, _target) = collector(&rt, 4);

    r.pipe(w.clone());
    assert_eq!(r.events().error.listener_count(), 1);
    rt.run().await.unwrap();

    assert_eq!(r.events().readable.listener_count(), 0);
    assert_eq!(r.events().error.listener_count(), 0);
    assert_eq!(w.events().error.listener_count(), 0);
    assert_eq!(w.events().drain.listener_count(), 0);
    assert!(w.is_finished());
}

#[test]
fn test_pipe_over_buffered_data_detaches_its_listeners() {
    init_tracing();
    let rt = Runtime::new();
    let r = Readable::new(&rt, ReadableOptions::default());
    let (w, target) = collector(&rt, 4);

    // The queued `readable` replays while the pipe registers
    r.push(Some(vec![1]));
    r.pipe(w.clone());
    rt.run_until_stalled();
    assert_eq!(target.items(), vec![1]);
    assert_eq!(r.events().readable.listener_count(), 1);

    r.emit_error(boom());
    rt.run_until_stalled();

    assert_eq!(r.events().readable.listener_count(), 0);
    assert_eq!(r.events().error.listener_count(), 0);
    assert!(w.is_finished());
}

#[tokio::test]
async fn test_pipe_into_zero_high_water_mark_writable() {
    init_tracing();
    let rt = Runtime::new();
    let r = Readable::with_source(&rt, ReadableOptions::default(), IterSource::new(0..5));
    let (w, target) = collector(&rt, 0);
    let finishes = Counter::new();
    w.on_finish(finishes.listener());
    let errors = error_log(&w);

    r.pipe(w.clone());
    rt.run().await.unwrap();

    assert_eq!(target.items(), vec![0, 1, 2, 3, 4]);
    assert_eq!(finishes.get(), 1);
    assert!(errors.borrow().is_empty());
}

#[tokio::test]
async fn test_pipe_from_zero_high_water_mark_readable() {
    init_tracing();
    let rt = Runtime::new();
    let r = Readable::with_source(&rt, ReadableOptions { high_water_mark: 0 }, IterSource::new(0..5));
    let (w, target) = collector(&rt, 16);
    let finishes = Counter::new();
    w.on_finish(finishes.listener());

    r.pipe(w.clone());
    rt.run().await.unwrap();

    assert_eq!(target.items(), vec![0, 1, 2, 3, 4]);
    assert_eq!(finishes.get(), 1);
    rt.teardown().unwrap();
}

#[tokio::test]
async fn test_end_on_finish_disabled_leaves_target_open() {
    let rt = Runtime::new();
    let r = Readable::with_source(&rt, ReadableOptions::default(), IterSource::new(0..5));
    let (w, target) = collector(&rt, 16);
    let options = PipeOptions {
        end_on_finish: false,
        ..PipeOptions::default()
    };

    r.pipe_with(w.clone(), options);
    rt.run().await.unwrap();

    assert_eq!(target.items(), vec![0, 1, 2, 3, 4]);
    assert!(!w.is_ending());
    w.write(vec![5]);
    w.end(None);
    rt.run().await.unwrap();
    assert_eq!(target.len(), 6);
    assert!(w.is_finished());
}

#[tokio::test]
async fn test_yield_every_batches_ticks() {
    let rt = Runtime::new();
    let r = Readable::with_source(
        &rt,
        ReadableOptions { high_water_mark: 1 },
        IterSource::new(0..20),
    );
    let (w, target) = collector(&rt, 64);
    let options = PipeOptions {
        yield_every: 5,
        ..PipeOptions::default()
    };

    r.pipe_with(w, options);
    rt.run().await.unwrap();

    assert_eq!(target.items(), (0..20).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_source_error_forwarded_exactly_once() {
    init_tracing();
    let rt = Runtime::new();
    let r = Readable::with_source(&rt, ReadableOptions::default(), failing_after(vec![1, 2]));
    let (w, target) = collector(&rt, 16);
    let errors = error_log(&w);
    let finishes = Counter::new();
    w.on_finish(finishes.listener());

    r.pipe(w.clone());
    rt.run().await.unwrap();

    let errors = errors.borrow();
    assert_eq!(errors.len(), 1);
    let error = &errors[0];
    assert_eq!(error.pipe_origin(), Some(r.id()));
    assert!(matches!(error.root(), StreamError::Source(_)));
    assert_eq!(target.items(), vec![1, 2]);
    assert_eq!(finishes.get(), 1);
}

#[tokio::test]
async fn test_source_error_not_forwarded_when_disabled() {
    let rt = Runtime::new();
    let r = Readable::with_source(&rt, ReadableOptions::default(), failing_after(vec![1]));
    let source_errors = Counter::new();
    r.on_error(source_errors.listener());
    let (w, _target) = collector(&rt, 16);
    let errors = error_log(&w);
    let options = PipeOptions {
        pass_errors: false,
        ..PipeOptions::default()
    };

    r.pipe_with(w.clone(), options);
    rt.run().await.unwrap();

    assert_eq!(source_errors.get(), 1);
    assert!(errors.borrow().is_empty());
    assert!(w.is_finished());
}

#[tokio::test]
async fn test_chained_pipes_do_not_double_wrap() {
    init_tracing();
    let rt = Runtime::new();
    let r = Readable::with_source(&rt, ReadableOptions::default(), failing_after(vec![1]));
    let middle = Transform::map(&rt, |n: u32| n * 10);
    let middle_errors = Counter::new();
    middle.on_error(middle_errors.listener());
    let (w, target) = collector(&rt, 16);
    let errors = error_log(&w);

    r.pipe(middle.clone()).pipe(w.clone());
    rt.run().await.unwrap();

    assert_eq!(middle_errors.get(), 1);
    let errors = errors.borrow();
    assert_eq!(errors.len(), 1);
    let error = &errors[0];
    assert_eq!(error.pipe_origin(), Some(r.id()));
    assert!(matches!(error.root(), StreamError::Source(_)));
    assert!(!matches!(
        error,
        StreamError::Pipe { inner, .. } if matches!(**inner, StreamError::Pipe { .. })
    ));
    assert_eq!(target.items(), vec![10]);
}

#[tokio::test]
async fn test_target_error_unpipes_without_ending() {
    init_tracing();
    let rt = Runtime::new();
    let r = Readable::with_source(
        &rt,
        ReadableOptions { high_water_mark: 2 },
        IterSource::new(0..100),
    );
    let w = Writable::new(
        &rt,
        WritableOptions::default(),
        FnTarget::new(|_items: Vec<u32>| Err(StreamError::target_msg("closed"))),
    );
    let errors = error_log(&w);

    r.pipe(w.clone());
    rt.run().await.unwrap();

    assert_eq!(errors.borrow().len(), 1);
    assert!(matches!(errors.borrow()[0], StreamError::Target(_)));
    assert_eq!(r.events().readable.listener_count(), 0);
    assert_eq!(r.events().error.listener_count(), 0);
    assert!(!w.is_ending());
}

#[tokio::test]
async fn test_blocking_source_through_pipe() {
    init_tracing();
    let rt = Runtime::new();
    let mut next = 0u32;
    let source = BlockingSource::new(&rt, move |requested: usize| -> SourceResult<u32> {
        if next >= 50 {
            return Ok(None);
        }
        let end = (next + requested as u32).min(50);
        let items = (next..end).collect();
        next = end;
        Ok(Some(items))
    });
    let r = Readable::with_source(&rt, ReadableOptions { high_water_mark: 8 }, source);
    let bump = Transform::map(&rt, |n: u32| n + 1);
    let (w, target) = collector(&rt, 4);

    r.pipe(bump).pipe(w.clone());
    rt.run().await.unwrap();

    assert_eq!(target.items(), (1..=50).collect::<Vec<_>>());
    assert!(w.is_finished());
    rt.teardown().unwrap();
}
