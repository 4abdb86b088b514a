//! Integration tests for lazy asynchronous sequences

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use asyncseq::prelude::*;
use futures::StreamExt;
use tokio_test::{assert_pending, assert_ready};

#[test]
fn test_done_is_final() {
    let it = from_iter(vec![1, 2]);
    assert_eq!(block_on(it.to_vec()).unwrap(), vec![1, 2]);
    assert!(it.is_done());

    it.set_readable(true);
    it.close();
    run_until_stalled();
    assert!(it.is_done());
    assert_eq!(it.state(), State::Ended);
    assert_eq!(it.read(), None);
}

#[test]
fn test_transform_keeps_upstream_order() {
    let options = TransformOptions::transform(|x: i32, emitter: Emitter<i32>| {
        emitter.push(x);
        emitter.push(x + 10);
    });
    let it = TransformIterator::new(from_iter(vec![1, 2, 3]), options).unwrap();
    assert_eq!(block_on(it.to_vec()).unwrap(), vec![1, 11, 2, 12, 3, 13]);
}

#[test]
fn test_offset_then_limit() {
    for (offset, limit, expected) in [
        (2usize, 3usize, vec![3, 4, 5]),
        (0, 2, vec![1, 2]),
        (8, 5, vec![9, 10]),
        (10, 1, vec![]),
    ] {
        let options = TransformOptions::identity().offset(offset).limit(limit);
        let it = TransformIterator::new(range(1, 10), options).unwrap();
        assert_eq!(block_on(it.to_vec()).unwrap(), expected, "offset {offset} limit {limit}");
    }
}

#[test]
fn test_clones_never_advance_each_other() {
    let source = from_iter(vec!['a', 'b']);
    let first = source.fork().unwrap();
    let second = source.fork().unwrap();

    assert_eq!(first.read(), Some('a'));
    assert_eq!(first.read(), Some('b'));
    assert_eq!(second.read(), Some('a'));

    assert_eq!(block_on(second.to_vec()).unwrap(), vec!['b']);
    assert_eq!(block_on(first.to_vec()).unwrap(), Vec::<char>::new());
    assert!(first.is_ended());
    assert!(second.is_ended());
}

#[test]
fn test_union_yields_every_item_once() {
    let union = UnionIterator::new(
        vec![range(0, 2), range(3, 4), range(5, 6)],
        UnionOptions::default(),
    )
    .unwrap();
    let ended = Rc::new(Cell::new(false));
    let flag = ended.clone();
    union.on_end(move || flag.set(true));

    let mut items = block_on(union.to_vec()).unwrap();
    items.sort_unstable();
    assert_eq!(items, vec![0, 1, 2, 3, 4, 5, 6]);
    run_until_stalled();
    assert!(ended.get());
}

#[test]
fn test_property_delivery_is_deferred() {
    let it = range(1, 3);
    it.set_property("origin", "integers".to_string());

    let seen = Rc::new(RefCell::new(None));
    let slot = seen.clone();
    it.on_property("origin", move |value| *slot.borrow_mut() = value.get::<String>());
    assert!(seen.borrow().is_none());

    run_until_stalled();
    assert_eq!(seen.borrow().as_deref(), Some("integers"));
}

#[test]
fn test_destroy_with_error_notifies_once() {
    let it = range(1, 3).map(|x| x * 2).unwrap();
    let notifications = Rc::new(RefCell::new(Vec::new()));
    let errors = notifications.clone();
    let ends = notifications.clone();
    it.on_error(move |error| errors.borrow_mut().push(format!("error: {error}")));
    it.on_end(move || ends.borrow_mut().push("end".to_string()));

    it.destroy_with(Error::custom("stop"));
    it.destroy_with(Error::custom("stop again"));
    it.destroy();
    run_until_stalled();

    assert_eq!(*notifications.borrow(), vec!["error: stop".to_string()]);
    assert!(it.is_destroyed());
}

#[test]
fn test_collect_waits_for_pushed_items() {
    let (pusher, it) = pushable::<&str>(BufferOptions::default());
    let mut collect = tokio_test::task::spawn(it.to_vec());
    assert_pending!(collect.poll());

    pusher.push("first");
    pusher.push("second");
    run_until_stalled();
    assert_pending!(collect.poll());

    pusher.close();
    run_until_stalled();
    let items = assert_ready!(collect.poll()).unwrap();
    assert_eq!(items, vec!["first", "second"]);
}

#[test]
fn test_combinator_chain() {
    let words = from_iter(vec!["apple", "banana", "apple", "cherry", "date", "banana"]);
    let it = words
        .uniq()
        .unwrap()
        .map(str::len)
        .unwrap()
        .surround(vec![0], vec![usize::MAX])
        .unwrap();
    assert_eq!(block_on(it.to_vec()).unwrap(), vec![0, 5, 6, 6, 4, usize::MAX]);
}

#[test]
fn test_multi_transform_with_fork_and_union() {
    let source = range(1, 3);
    let doubled = source
        .fork()
        .unwrap()
        .multi_transform(|n| Some(from_iter(vec![n, n])))
        .unwrap();
    let negated = source.fork().unwrap().map(|n| -n).unwrap();
    let merged = doubled.union(vec![negated]).unwrap();

    let mut items = block_on(merged.to_vec()).unwrap();
    items.sort_unstable();
    assert_eq!(items, vec![-3, -2, -1, 1, 1, 2, 2, 3, 3]);
}

#[test]
fn test_stream_round_trip() {
    let stream = futures::stream::iter(vec![3, 1, 4, 1, 5]);
    let it = from_stream(stream, BufferOptions::default());
    let evens = it.filter(|x| x % 2 == 0).unwrap();
    let collected: Vec<_> = block_on(evens.into_stream().collect::<Vec<_>>());
    let collected: Vec<i32> = collected.into_iter().map(|item| item.unwrap()).collect();
    assert_eq!(collected, vec![4]);
}

#[test]
fn test_custom_generator() {
    struct Fibonacci {
        current: u64,
        next: u64,
    }

    impl Generator<u64> for Fibonacci {
        fn read(&mut self, count: usize, emitter: Emitter<u64>) {
            for _ in 0..count {
                emitter.push(self.current);
                let next = self.current + self.next;
                self.current = self.next;
                self.next = next;
            }
        }
    }

    let fibonacci = BufferedIterator::new(Fibonacci { current: 0, next: 1 }, BufferOptions::default());
    let first = block_on(fibonacci.take(10).unwrap().to_vec()).unwrap();
    assert_eq!(first, vec![0, 1, 1, 2, 3, 5, 8, 13, 21, 34]);
    run_until_stalled();
    assert!(fibonacci.is_destroyed());
}

#[test]
fn test_deferred_source_through_combinators() {
    let (tx, rx) = futures::channel::oneshot::channel::<AsyncIterator<i64>>();
    let deferred = SourceExpr::deferred(async move { rx.await.map_err(Error::from) });
    let it = TransformIterator::new(deferred, TransformOptions::map(|x: i64| x + 100)).unwrap();
    run_until_stalled();
    assert!(!it.is_done());

    tx.send(range(1, 3)).ok();
    assert_eq!(block_on(it.to_vec()).unwrap(), vec![101, 102, 103]);
}
